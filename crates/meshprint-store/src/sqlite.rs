//! SQLite-backed [`TemplateStore`].
//!
//! ```text
//! identities (id PK, metadata JSON, created_at, updated_at)
//! templates  (seq PK, template_id UNIQUE, identity_id FK -> identities ON DELETE CASCADE,
//!             vector JSON, quality JSON NULL, created_at)
//! ```
//!
//! File databases run in WAL mode. Writes go through one connection behind a
//! mutex, each in an immediate transaction, so an identity never becomes
//! visible without its templates and two processes never interleave writes to
//! the same identity. Reads use a small pool of read-only connections and do
//! not wait on the writer or on each other. In-memory databases have a single
//! connection, so there reads share the writer mutex.

use chrono::{DateTime, SecondsFormat, Utc};
use meshprint_core::store::{StoreError, TemplateStore};
use meshprint_core::types::{merge_metadata, FeatureVector, IdentityId, IdentitySummary, Template};
use meshprint_core::QualityMetrics;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

const SCHEMA_VERSION: i64 = 1;

/// How long a connection waits on another connection's lock before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Idle read connections kept for reuse.
const MAX_IDLE_READERS: usize = 4;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS identities (
    id          TEXT PRIMARY KEY NOT NULL,
    metadata    TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS templates (
    seq          INTEGER PRIMARY KEY AUTOINCREMENT,
    template_id  TEXT NOT NULL UNIQUE,
    identity_id  TEXT NOT NULL REFERENCES identities(id) ON DELETE CASCADE,
    vector       TEXT NOT NULL,
    quality      TEXT,
    created_at   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS templates_by_identity ON templates(identity_id, seq);
CREATE TABLE IF NOT EXISTS match_log (
    seq             INTEGER PRIMARY KEY AUTOINCREMENT,
    recorded_at     TEXT NOT NULL,
    kind            TEXT NOT NULL,
    identity_id     TEXT,
    confidence      REAL NOT NULL,
    max_similarity  REAL NOT NULL,
    avg_similarity  REAL NOT NULL,
    matched         INTEGER NOT NULL,
    threshold       REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS match_log_by_identity ON match_log(identity_id);
CREATE TABLE IF NOT EXISTS event_log (
    seq          INTEGER PRIMARY KEY AUTOINCREMENT,
    recorded_at  TEXT NOT NULL,
    event_type   TEXT NOT NULL,
    description  TEXT NOT NULL,
    metadata     TEXT NOT NULL
);
";

#[derive(Error, Debug)]
pub enum SqliteStoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("database schema version {found} is newer than supported version {supported}")]
    UnsupportedSchema { found: i64, supported: i64 },
}

impl From<SqliteStoreError> for StoreError {
    fn from(err: SqliteStoreError) -> Self {
        StoreError::Backend(Box::new(err))
    }
}

/// Lifts backend errors into [`StoreError::Backend`] at the trait boundary.
trait BackendResultExt<T> {
    fn backend(self) -> Result<T, StoreError>;
}

impl<T, E: Into<SqliteStoreError>> BackendResultExt<T> for Result<T, E> {
    fn backend(self) -> Result<T, StoreError> {
        self.map_err(|e| StoreError::from(e.into()))
    }
}

/// Open (creating if needed) a database file and bring its schema up to date.
pub(crate) fn open_connection(path: &Path) -> Result<Connection, SqliteStoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        tracing::warn!(path = %path.display(), mode = %mode, "database not in WAL mode");
    }
    migrate(&conn)?;
    Ok(conn)
}

fn open_reader(path: &Path) -> Result<Connection, SqliteStoreError> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX | OpenFlags::SQLITE_OPEN_URI,
    )?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

/// Begin a write transaction holding the database write lock from the start.
pub(crate) fn begin_write(conn: &mut Connection) -> Result<Transaction<'_>, SqliteStoreError> {
    Ok(conn.transaction_with_behavior(TransactionBehavior::Immediate)?)
}

pub(crate) fn open_memory_connection() -> Result<Connection, SqliteStoreError> {
    let conn = Connection::open_in_memory()?;
    migrate(&conn)?;
    Ok(conn)
}

fn migrate(conn: &Connection) -> Result<(), SqliteStoreError> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if version > SCHEMA_VERSION {
        return Err(SqliteStoreError::UnsupportedSchema {
            found: version,
            supported: SCHEMA_VERSION,
        });
    }
    if version < SCHEMA_VERSION {
        conn.execute_batch(SCHEMA)?;
        conn.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION};"))?;
        tracing::info!(from = version, to = SCHEMA_VERSION, "database schema migrated");
    }
    Ok(())
}

pub(crate) fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, SqliteStoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| SqliteStoreError::Corrupt(format!("timestamp {raw:?}: {e}")))
}

/// Raw template row, decoded outside the rusqlite row callback.
struct TemplateRow {
    template_id: String,
    vector: String,
    quality: Option<String>,
    created_at: String,
}

impl TemplateRow {
    fn decode(self) -> Result<Template, SqliteStoreError> {
        let id = Uuid::parse_str(&self.template_id)
            .map_err(|e| SqliteStoreError::Corrupt(format!("template id {:?}: {e}", self.template_id)))?;
        let vector: FeatureVector = serde_json::from_str(&self.vector)?;
        let quality: Option<QualityMetrics> = match self.quality {
            Some(raw) => Some(serde_json::from_str(&raw)?),
            None => None,
        };
        Ok(Template {
            id,
            vector,
            quality,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

/// Read-only connections to a database file, opened on demand.
struct ReaderPool {
    path: PathBuf,
    idle: Mutex<Vec<Connection>>,
}

impl ReaderPool {
    fn checkout(&self) -> Result<Connection, SqliteStoreError> {
        match self.idle.lock().pop() {
            Some(conn) => Ok(conn),
            None => open_reader(&self.path),
        }
    }

    fn checkin(&self, conn: Connection) {
        let mut idle = self.idle.lock();
        if idle.len() < MAX_IDLE_READERS {
            idle.push(conn);
        }
    }
}

/// Persistent template store in a single SQLite database.
pub struct SqliteStore {
    writer: Mutex<Connection>,
    readers: Option<ReaderPool>,
}

impl SqliteStore {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SqliteStoreError> {
        let path = path.as_ref();
        let conn = open_connection(path)?;
        tracing::debug!(path = %path.display(), "template store opened");
        Ok(Self {
            writer: Mutex::new(conn),
            readers: Some(ReaderPool {
                path: path.to_path_buf(),
                idle: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn open_in_memory() -> Result<Self, SqliteStoreError> {
        Ok(Self {
            writer: Mutex::new(open_memory_connection()?),
            readers: None,
        })
    }

    /// Run `f` on a read connection.
    fn read<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, SqliteStoreError>,
    ) -> Result<T, SqliteStoreError> {
        match &self.readers {
            Some(pool) => {
                let conn = pool.checkout()?;
                let result = f(&conn);
                pool.checkin(conn);
                result
            }
            None => f(&*self.writer.lock()),
        }
    }

    fn load_templates(
        conn: &Connection,
        identity: &IdentityId,
    ) -> Result<Vec<Template>, SqliteStoreError> {
        let mut stmt = conn.prepare_cached(
            "SELECT template_id, vector, quality, created_at FROM templates
             WHERE identity_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt
            .query_map(params![identity.as_str()], |row| {
                Ok(TemplateRow {
                    template_id: row.get(0)?,
                    vector: row.get(1)?,
                    quality: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(TemplateRow::decode).collect()
    }

    fn identity_exists(conn: &Connection, identity: &IdentityId) -> Result<bool, SqliteStoreError> {
        Ok(conn
            .query_row(
                "SELECT 1 FROM identities WHERE id = ?1",
                params![identity.as_str()],
                |_| Ok(()),
            )
            .optional()?
            .is_some())
    }

    fn insert_template(
        tx: &Transaction<'_>,
        identity: &IdentityId,
        template: &Template,
    ) -> Result<(), SqliteStoreError> {
        let quality = template
            .quality
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        tx.execute(
            "INSERT INTO templates (template_id, identity_id, vector, quality, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                template.id.to_string(),
                identity.as_str(),
                serde_json::to_string(&template.vector)?,
                quality,
                timestamp(template.created_at),
            ],
        )?;
        Ok(())
    }

    fn touch(tx: &Transaction<'_>, identity: &IdentityId) -> Result<(), SqliteStoreError> {
        tx.execute(
            "UPDATE identities SET updated_at = ?2 WHERE id = ?1",
            params![identity.as_str(), timestamp(Utc::now())],
        )?;
        Ok(())
    }
}

impl TemplateStore for SqliteStore {
    fn get_templates(&self, identity: &IdentityId) -> Result<Vec<Template>, StoreError> {
        let found = self
            .read(|conn| {
                // One read transaction so the existence check and the rows agree.
                let tx = conn.unchecked_transaction()?;
                if !Self::identity_exists(&tx, identity)? {
                    return Ok(None);
                }
                let templates = Self::load_templates(&tx, identity)?;
                tx.finish()?;
                Ok(Some(templates))
            })
            .backend()?;
        found.ok_or_else(|| StoreError::NotFound(identity.clone()))
    }

    fn put_template(&self, identity: &IdentityId, template: Template) -> Result<(), StoreError> {
        self.put_templates(identity, vec![template])
    }

    fn put_templates(
        &self,
        identity: &IdentityId,
        templates: Vec<Template>,
    ) -> Result<(), StoreError> {
        self.put_templates_if(identity, templates, &mut |_| true).map(|_| ())
    }

    fn put_templates_if(
        &self,
        identity: &IdentityId,
        templates: Vec<Template>,
        accept: &mut dyn FnMut(&[Template]) -> bool,
    ) -> Result<bool, StoreError> {
        let mut conn = self.writer.lock();
        let tx = begin_write(&mut conn).backend()?;
        if !Self::identity_exists(&tx, identity).backend()? {
            return Err(StoreError::NotFound(identity.clone()));
        }
        let stored = Self::load_templates(&tx, identity).backend()?;
        if !accept(&stored) {
            tracing::debug!(identity = %identity, "template append refused");
            return Ok(false);
        }
        for template in &templates {
            Self::insert_template(&tx, identity, template).backend()?;
        }
        Self::touch(&tx, identity).backend()?;
        tx.commit().backend()?;

        tracing::debug!(identity = %identity, count = templates.len(), "templates stored");
        Ok(true)
    }

    fn create_identity(
        &self,
        identity: &IdentityId,
        metadata: serde_json::Value,
        templates: Vec<Template>,
    ) -> Result<(), StoreError> {
        if identity.is_blank() {
            return Err(StoreError::InvalidIdentity);
        }
        if templates.is_empty() {
            return Err(StoreError::EmptyEnrollment);
        }

        let mut conn = self.writer.lock();
        let tx = begin_write(&mut conn).backend()?;
        if Self::identity_exists(&tx, identity).backend()? {
            return Err(StoreError::AlreadyExists(identity.clone()));
        }
        let now = timestamp(Utc::now());
        tx.execute(
            "INSERT INTO identities (id, metadata, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
            params![
                identity.as_str(),
                serde_json::to_string(&metadata).backend()?,
                now
            ],
        )
        .backend()?;
        for template in &templates {
            Self::insert_template(&tx, identity, template).backend()?;
        }
        tx.commit().backend()?;

        tracing::debug!(identity = %identity, templates = templates.len(), "identity created");
        Ok(())
    }

    fn remove_identity(&self, identity: &IdentityId) -> Result<usize, StoreError> {
        let mut conn = self.writer.lock();
        let tx = begin_write(&mut conn).backend()?;
        let templates: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM templates WHERE identity_id = ?1",
                params![identity.as_str()],
                |row| row.get(0),
            )
            .backend()?;
        let deleted = tx
            .execute("DELETE FROM identities WHERE id = ?1", params![identity.as_str()])
            .backend()?;
        if deleted == 0 {
            return Err(StoreError::NotFound(identity.clone()));
        }
        tx.commit().backend()?;
        Ok(templates as usize)
    }

    fn remove_template(&self, identity: &IdentityId, template: Uuid) -> Result<(), StoreError> {
        let mut conn = self.writer.lock();
        let tx = begin_write(&mut conn).backend()?;
        if !Self::identity_exists(&tx, identity).backend()? {
            return Err(StoreError::NotFound(identity.clone()));
        }

        let template_id = template.to_string();
        let belongs = tx
            .query_row(
                "SELECT 1 FROM templates WHERE template_id = ?1 AND identity_id = ?2",
                params![template_id, identity.as_str()],
                |_| Ok(()),
            )
            .optional()
            .backend()?
            .is_some();
        if !belongs {
            return Err(StoreError::TemplateNotFound {
                identity: identity.clone(),
                template,
            });
        }

        let count: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM templates WHERE identity_id = ?1",
                params![identity.as_str()],
                |row| row.get(0),
            )
            .backend()?;
        if count <= 1 {
            return Err(StoreError::LastTemplate(identity.clone()));
        }

        tx.execute(
            "DELETE FROM templates WHERE template_id = ?1",
            params![template_id],
        )
        .backend()?;
        Self::touch(&tx, identity).backend()?;
        tx.commit().backend()?;
        Ok(())
    }

    fn update_metadata(
        &self,
        identity: &IdentityId,
        metadata: serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut conn = self.writer.lock();
        let tx = begin_write(&mut conn).backend()?;
        let stored: Option<String> = tx
            .query_row(
                "SELECT metadata FROM identities WHERE id = ?1",
                params![identity.as_str()],
                |row| row.get(0),
            )
            .optional()
            .backend()?;
        let Some(stored) = stored else {
            return Err(StoreError::NotFound(identity.clone()));
        };
        let mut merged: serde_json::Value = serde_json::from_str(&stored).backend()?;
        merge_metadata(&mut merged, metadata);
        tx.execute(
            "UPDATE identities SET metadata = ?2 WHERE id = ?1",
            params![identity.as_str(), serde_json::to_string(&merged).backend()?],
        )
        .backend()?;
        Self::touch(&tx, identity).backend()?;
        tx.commit().backend()?;
        Ok(())
    }

    fn all_identities(&self) -> Result<Vec<(IdentityId, Vec<FeatureVector>)>, StoreError> {
        let rows = self
            .read(|conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT identity_id, vector FROM templates ORDER BY identity_id, seq",
                )?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .backend()?;

        let mut gallery: Vec<(IdentityId, Vec<FeatureVector>)> = Vec::new();
        for (identity, vector) in rows {
            let vector: FeatureVector = serde_json::from_str(&vector).backend()?;
            match gallery.last_mut() {
                Some((last, vectors)) if last.as_str() == identity => vectors.push(vector),
                _ => gallery.push((IdentityId::new(identity), vec![vector])),
            }
        }
        Ok(gallery)
    }

    fn list_identities(&self) -> Result<Vec<IdentitySummary>, StoreError> {
        let rows = self
            .read(|conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT i.id, i.metadata, i.created_at, i.updated_at, COUNT(t.seq)
                     FROM identities i LEFT JOIN templates t ON t.identity_id = i.id
                     GROUP BY i.id ORDER BY i.id",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, i64>(4)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .backend()?;

        rows.into_iter()
            .map(
                |(id, metadata, created_at, updated_at, count)| -> Result<_, SqliteStoreError> {
                    Ok(IdentitySummary {
                        id: IdentityId::new(id),
                        template_count: count as usize,
                        metadata: serde_json::from_str(&metadata)?,
                        created_at: parse_timestamp(&created_at)?,
                        updated_at: parse_timestamp(&updated_at)?,
                    })
                },
            )
            .collect::<Result<Vec<_>, _>>()
            .backend()
    }
}
