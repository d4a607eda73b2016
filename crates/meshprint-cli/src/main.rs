mod config;
mod input;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use config::Config;
use meshprint_core::{
    EnrollError, Engine, FeatureExtractor, IdentityId, IdentitySummary, LandmarkSet, LandmarkTable,
    MatchResult, Sample, TemplateStore,
};
use meshprint_store::{MatchKind, MatchLog, SqliteStore, HIGH_CONFIDENCE};
use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "meshprint", about = "Face geometry enrollment, verification and identification")]
struct Cli {
    /// Config file (default: $XDG_CONFIG_HOME/meshprint/config.toml, if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Database file, overriding config and MESHPRINT_DB_PATH
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a new identity from several landmark captures
    Enroll {
        /// Identity to create (e.g., an employee number)
        identity: String,
        /// Landmark JSON files, one capture each
        #[arg(short, long = "landmarks", required = true, num_args = 1..)]
        landmarks: Vec<PathBuf>,
        /// Source images, in the same order as the landmark files, for quality scoring
        #[arg(short, long = "image", num_args = 1..)]
        images: Vec<PathBuf>,
        /// Free-form JSON metadata stored with the identity
        #[arg(short, long)]
        metadata: Option<String>,
    },
    /// Add captures to an enrolled identity
    Add {
        identity: String,
        #[arg(short, long = "landmarks", required = true, num_args = 1..)]
        landmarks: Vec<PathBuf>,
        #[arg(short, long = "image", num_args = 1..)]
        images: Vec<PathBuf>,
    },
    /// Check a capture against one enrolled identity (exit status 1 if rejected)
    Verify {
        identity: String,
        /// Landmark JSON file of the probe
        #[arg(short, long)]
        landmarks: PathBuf,
        /// Override the verification threshold
        #[arg(short, long)]
        threshold: Option<f32>,
    },
    /// Rank enrolled identities against a capture
    Identify {
        #[arg(short, long)]
        landmarks: PathBuf,
        /// Maximum number of candidates
        #[arg(short = 'k', long)]
        top_k: Option<usize>,
        /// Override the identification threshold
        #[arg(short, long)]
        threshold: Option<f32>,
    },
    /// Merge JSON metadata into an enrolled identity
    Update {
        identity: String,
        /// JSON object whose keys replace or extend the stored metadata
        #[arg(short, long)]
        metadata: String,
    },
    /// List enrolled identities
    List,
    /// Find identities whose id or metadata contains a string (case-insensitive)
    Search { query: String },
    /// Remove an identity, or a single template of it
    Remove {
        identity: String,
        /// Template id to remove instead of the whole identity
        #[arg(long)]
        template: Option<uuid::Uuid>,
    },
    /// Show store and match-log statistics
    Stats,
    /// Score the quality of an image
    Quality { image: PathBuf },
    /// Show the match log
    Log {
        /// Number of entries to show (newest first), after filtering
        #[arg(short = 'n', long, default_value_t = 10)]
        limit: usize,
        /// Only matches for this identity
        #[arg(long)]
        identity: Option<String>,
        /// Only matches at or above this confidence
        #[arg(long)]
        min_confidence: Option<f32>,
        /// Show system events instead of matches
        #[arg(long)]
        events: bool,
        /// Delete all log entries
        #[arg(long)]
        clear: bool,
    },
}

/// Everything a command needs: the engine over the on-disk store and the log.
struct App {
    engine: Engine<SqliteStore>,
    log: MatchLog,
    json: bool,
}

impl App {
    fn open(config: &Config, json: bool) -> Result<Self> {
        let store = SqliteStore::open(&config.db_path)
            .with_context(|| format!("failed to open database {}", config.db_path.display()))?;
        let log = MatchLog::open(&config.db_path).context("failed to open match log")?;
        let extractor = FeatureExtractor::new(config.landmarks.clone());
        Ok(Self {
            engine: Engine::new(extractor, config.matching.clone(), store),
            log,
            json,
        })
    }

    fn table(&self) -> &LandmarkTable {
        self.engine.extractor().table()
    }

    /// Print `value` as JSON, or run `text` for human output.
    fn emit<T: Serialize>(&self, value: &T, text: impl FnOnce()) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            text();
        }
        Ok(())
    }

    /// Log write failures are reported but never change the command's outcome.
    fn note_event(&self, event_type: &str, description: &str, metadata: serde_json::Value) {
        if let Err(e) = self.log.record_event(event_type, description, metadata) {
            tracing::warn!(error = %e, event_type, "failed to record event");
        }
    }

    fn note_match(&self, kind: MatchKind, result: &MatchResult, threshold: f32) {
        if let Err(e) = self.log.record_match(kind, result, threshold) {
            tracing::warn!(error = %e, "failed to record match");
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("meshprint: {e:#}");
            ExitCode::from(2)
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.db_path = db;
    }

    // Only commands that touch enrolled data open the database.
    let json = cli.json;
    let open = || App::open(&config, json);

    match cli.command {
        Commands::Quality { image } => {
            let metrics = input::assess_image(&image)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&metrics)?);
            } else {
                println!("sharpness:  {:.3}", metrics.sharpness);
                println!("brightness: {:.3}", metrics.brightness);
                println!("contrast:   {:.3}", metrics.contrast);
                println!("quality:    {:.3}", metrics.quality_score);
            }
        }
        Commands::Enroll {
            identity,
            landmarks,
            images,
            metadata,
        } => {
            let app = open()?;
            let metadata = match metadata {
                Some(raw) => parse_metadata(&raw)?,
                None => serde_json::Value::Null,
            };
            let identity = IdentityId::new(identity);
            let samples = load_samples(app.table(), &landmarks, &images)?;
            match app.engine.enroll(&identity, &samples, metadata) {
                Ok(outcome) => {
                    app.note_event(
                        "enrollment",
                        &format!("enrolled {identity}"),
                        json!({"identity": identity, "templates": outcome.templates_added}),
                    );
                    app.emit(&outcome, || {
                        println!(
                            "Enrolled {} with {} templates",
                            outcome.identity, outcome.templates_added
                        );
                        print_review_flags(&outcome.flagged_for_review);
                    })?;
                }
                Err(e) => {
                    note_rejection(&app, &identity, &e);
                    return Err(e.into());
                }
            }
        }
        Commands::Add {
            identity,
            landmarks,
            images,
        } => {
            let app = open()?;
            let identity = IdentityId::new(identity);
            let samples = load_samples(app.table(), &landmarks, &images)?;
            match app.engine.add_samples(&identity, &samples) {
                Ok(outcome) => {
                    app.note_event(
                        "templates_added",
                        &format!("added {} templates to {identity}", outcome.templates_added),
                        json!({"identity": identity, "templates": outcome.templates_added}),
                    );
                    app.emit(&outcome, || {
                        println!(
                            "Added {} templates to {}",
                            outcome.templates_added, outcome.identity
                        );
                        print_review_flags(&outcome.flagged_for_review);
                    })?;
                }
                Err(e) => {
                    note_rejection(&app, &identity, &e);
                    return Err(e.into());
                }
            }
        }
        Commands::Verify {
            identity,
            landmarks,
            threshold,
        } => {
            let app = open()?;
            let identity = IdentityId::new(identity);
            let faces = load_probe(app.table(), &landmarks)?;
            let threshold = threshold.unwrap_or(config.matching.verification_threshold);
            let verification = app
                .engine
                .verify_with_threshold(&identity, &faces, threshold)?;
            app.note_match(MatchKind::Verify, &verification.result, threshold);
            app.emit(&verification, || println!("{verification}"))?;
            if !verification.verified() {
                return Ok(ExitCode::from(1));
            }
        }
        Commands::Identify {
            landmarks,
            top_k,
            threshold,
        } => {
            let app = open()?;
            let faces = load_probe(app.table(), &landmarks)?;
            let threshold = threshold.unwrap_or(config.matching.identification_threshold);
            let top_k = top_k.unwrap_or(config.matching.top_k);
            let results = app
                .engine
                .identify_with_threshold(&faces, threshold, top_k)?;
            match results.first() {
                Some(best) => app.note_match(MatchKind::Identify, best, threshold),
                None => app.note_match(MatchKind::Identify, &MatchResult::no_match(), threshold),
            }
            app.emit(&results, || {
                if results.is_empty() {
                    println!("No identity at or above {:.2}%", threshold * 100.0);
                }
                for (rank, result) in results.iter().enumerate() {
                    let id = result.identity.as_ref().map(|i| i.as_str()).unwrap_or("-");
                    println!(
                        "{:>2}. {id:<24} {:6.2}%  (max {:.3}, avg {:.3}, {} templates)",
                        rank + 1,
                        result.confidence * 100.0,
                        result.max_similarity,
                        result.avg_similarity,
                        result.templates_compared
                    );
                }
            })?;
        }
        Commands::Update { identity, metadata } => {
            let app = open()?;
            let identity = IdentityId::new(identity);
            let metadata = parse_metadata(&metadata)?;
            app.engine.update_metadata(&identity, metadata.clone())?;
            app.note_event(
                "metadata_updated",
                &format!("updated metadata of {identity}"),
                json!({"identity": identity, "metadata": metadata}),
            );
            app.emit(&json!({"identity": identity, "metadata": metadata}), || {
                println!("Updated metadata of {identity}")
            })?;
        }
        Commands::List => {
            let app = open()?;
            let identities = app.engine.store().list_identities()?;
            app.emit(&identities, || {
                if identities.is_empty() {
                    println!("No identities enrolled");
                }
                print_summaries(&identities);
            })?;
        }
        Commands::Search { query } => {
            let app = open()?;
            let found = app.engine.search(&query)?;
            app.emit(&found, || {
                if found.is_empty() {
                    println!("No identity matches {query:?}");
                }
                print_summaries(&found);
            })?;
        }
        Commands::Remove { identity, template } => {
            let app = open()?;
            let identity = IdentityId::new(identity);
            match template {
                Some(template) => {
                    app.engine.remove_template(&identity, template)?;
                    app.note_event(
                        "template_removed",
                        &format!("removed template {template} from {identity}"),
                        json!({"identity": identity, "template": template}),
                    );
                    app.emit(&json!({"identity": identity, "template": template}), || {
                        println!("Removed template {template} from {identity}")
                    })?;
                }
                None => {
                    let removed = app.engine.remove_identity(&identity)?;
                    app.note_event(
                        "deletion",
                        &format!("removed {identity}"),
                        json!({"identity": identity, "templates": removed}),
                    );
                    app.emit(&json!({"identity": identity, "templates": removed}), || {
                        println!("Removed {identity} ({removed} templates)")
                    })?;
                }
            }
        }
        Commands::Stats => {
            let app = open()?;
            let store = app.engine.store().stats()?;
            let log = app.log.statistics()?;
            app.emit(&json!({"store": store, "log": log}), || {
                println!("identities:        {}", store.identities);
                println!("templates:         {}", store.templates);
                println!("templates/identity {:.2}", store.avg_templates_per_identity);
                println!("logged matches:    {}", log.total_matches);
                println!("logged events:     {}", log.total_events);
                println!("avg confidence:    {:.3}", log.avg_confidence);
                println!(
                    "high confidence:   {} (>= {HIGH_CONFIDENCE})",
                    log.high_confidence_matches
                );
            })?;
        }
        Commands::Log {
            limit,
            identity,
            min_confidence,
            events,
            clear,
        } => {
            let app = open()?;
            if clear {
                app.log.clear()?;
                app.emit(&json!({"cleared": true}), || println!("Match log cleared"))?;
            } else if events {
                let entries = app.log.recent_events(limit)?;
                app.emit(&entries, || {
                    for e in &entries {
                        println!(
                            "{}  {:<18} {}",
                            e.recorded_at.format("%Y-%m-%d %H:%M:%S"),
                            e.event_type,
                            e.description
                        );
                    }
                })?;
            } else {
                let identity = identity.map(IdentityId::new);
                let entries = app
                    .log
                    .find_matches(identity.as_ref(), min_confidence, limit)?;
                app.emit(&entries, || {
                    for e in &entries {
                        println!(
                            "{}  {:<8} {:<24} {:6.2}%  {}",
                            e.recorded_at.format("%Y-%m-%d %H:%M:%S"),
                            e.kind.as_str(),
                            e.identity.as_ref().map(|i| i.as_str()).unwrap_or("-"),
                            e.confidence * 100.0,
                            if e.matched { "match" } else { "no match" }
                        );
                    }
                })?;
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn parse_metadata(raw: &str) -> Result<serde_json::Value> {
    serde_json::from_str(raw).context("--metadata is not valid JSON")
}

fn print_summaries(summaries: &[IdentitySummary]) {
    for summary in summaries {
        println!(
            "{:<24} {:>3} templates  enrolled {}",
            summary.id,
            summary.template_count,
            summary.created_at.format("%Y-%m-%d %H:%M")
        );
    }
}

fn print_review_flags(flagged: &[usize]) {
    for i in flagged {
        println!("  sample {i}: low image quality, flagged for review");
    }
}

fn note_rejection(app: &App, identity: &IdentityId, err: &EnrollError) {
    app.note_event(
        "enrollment_rejected",
        &format!("rejected samples for {identity}: {err}"),
        json!({"identity": identity}),
    );
}

/// Make sure a face has every point the landmark table addresses.
fn check_topology(table: &LandmarkTable, face: &LandmarkSet, path: &Path) -> Result<()> {
    if !face.is_empty() && face.len() < table.required_len() {
        bail!(
            "{}: face has {} points but the landmark table needs {}",
            path.display(),
            face.len(),
            table.required_len()
        );
    }
    Ok(())
}

fn load_probe(table: &LandmarkTable, path: &Path) -> Result<Vec<LandmarkSet>> {
    let faces = input::load_faces(path)?;
    if let Some(first) = faces.first() {
        check_topology(table, first, path)?;
    }
    Ok(faces)
}

fn load_samples(table: &LandmarkTable, landmarks: &[PathBuf], images: &[PathBuf]) -> Result<Vec<Sample>> {
    if !images.is_empty() && images.len() != landmarks.len() {
        bail!(
            "got {} images for {} landmark files; pass one image per capture or none",
            images.len(),
            landmarks.len()
        );
    }

    landmarks
        .iter()
        .enumerate()
        .map(|(i, path)| -> Result<Sample> {
            let face = input::load_sample_face(path)?;
            check_topology(table, &face, path)?;
            let mut sample = Sample::new(face);
            if let Some(image) = images.get(i) {
                sample = sample.with_quality(input::assess_image(image)?);
            }
            Ok(sample)
        })
        .collect()
}
