use anyhow::{Context, Result};
use meshprint_core::{LandmarkTable, MatchConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// CLI configuration: defaults, then an optional TOML file, then `MESHPRINT_*`
/// environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    pub matching: MatchConfig,
    /// Landmark topology of the detector feeding us.
    pub landmarks: LandmarkTable,
}

/// On-disk layout of `config.toml`.
///
/// ```toml
/// db_path = "/var/lib/meshprint/faces.db"
///
/// [matching]
/// verification_threshold = 0.8
///
/// [landmarks]   # optional; every landmark name must be present
/// left_eye_outer = 33
/// ```
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    db_path: Option<PathBuf>,
    matching: MatchConfig,
    landmarks: Option<LandmarkTable>,
}

impl Config {
    /// Load from `file` (or the default config path, if it exists) and the process environment.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let file = match file {
            Some(path) => Some(path.to_path_buf()),
            None => Some(config_dir().join("config.toml")).filter(|p| p.exists()),
        };
        let mut config = match file {
            Some(path) => {
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read config {}", path.display()))?;
                tracing::debug!(path = %path.display(), "config file loaded");
                Self::from_toml(&text).with_context(|| format!("in config {}", path.display()))?
            }
            None => Self::defaults(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn defaults() -> Self {
        Self {
            db_path: data_dir().join("faces.db"),
            matching: MatchConfig::default(),
            landmarks: LandmarkTable::default(),
        }
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(text).context("invalid config TOML")?;
        let defaults = Self::defaults();
        Ok(Self {
            db_path: file.db_path.unwrap_or(defaults.db_path),
            matching: file.matching,
            landmarks: file.landmarks.unwrap_or(defaults.landmarks),
        })
    }

    /// Override settings from `MESHPRINT_*` variables. Unparseable values are ignored.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(path) = var("MESHPRINT_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        let m = &mut self.matching;
        m.verification_threshold =
            env_parse(&var, "MESHPRINT_VERIFICATION_THRESHOLD", m.verification_threshold);
        m.identification_threshold =
            env_parse(&var, "MESHPRINT_IDENTIFICATION_THRESHOLD", m.identification_threshold);
        m.consistency_threshold =
            env_parse(&var, "MESHPRINT_CONSISTENCY_THRESHOLD", m.consistency_threshold);
        m.min_enrollment_samples =
            env_parse(&var, "MESHPRINT_MIN_SAMPLES", m.min_enrollment_samples);
        m.min_sample_quality = env_parse(&var, "MESHPRINT_MIN_QUALITY", m.min_sample_quality);
        m.review_quality = env_parse(&var, "MESHPRINT_REVIEW_QUALITY", m.review_quality);
        m.top_k = env_parse(&var, "MESHPRINT_TOP_K", m.top_k);
    }
}

fn env_parse<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn home_subdir(xdg_var: &str, fallback: &str) -> PathBuf {
    std::env::var(xdg_var)
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(fallback)
        })
        .join("meshprint")
}

fn data_dir() -> PathBuf {
    home_subdir("XDG_DATA_HOME", ".local/share")
}

fn config_dir() -> PathBuf {
    home_subdir("XDG_CONFIG_HOME", ".config")
}
