//! Audit log of match decisions and system events.
//!
//! Lives in the same SQLite database as the templates but is independent of
//! the [`TemplateStore`](meshprint_core::TemplateStore) contract: a failed log
//! write never undoes a decision.

use crate::sqlite::{
    begin_write, open_connection, open_memory_connection, parse_timestamp, timestamp,
    SqliteStoreError,
};
use chrono::{DateTime, Utc};
use meshprint_core::types::{IdentityId, MatchResult};
use parking_lot::Mutex;
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

/// Confidence at or above which a match counts as high-confidence in statistics.
pub const HIGH_CONFIDENCE: f32 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Verify,
    Identify,
}

impl MatchKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchKind::Verify => "verify",
            MatchKind::Identify => "identify",
        }
    }
}

impl FromStr for MatchKind {
    type Err = SqliteStoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "verify" => Ok(MatchKind::Verify),
            "identify" => Ok(MatchKind::Identify),
            other => Err(SqliteStoreError::Corrupt(format!("match kind {other:?}"))),
        }
    }
}

/// One logged decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchEntry {
    pub seq: i64,
    pub recorded_at: DateTime<Utc>,
    pub kind: MatchKind,
    pub identity: Option<IdentityId>,
    pub confidence: f32,
    pub max_similarity: f32,
    pub avg_similarity: f32,
    pub matched: bool,
    pub threshold: f32,
}

/// One logged system event (enrollment, deletion, rejected enrollment, ...).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventEntry {
    pub seq: i64,
    pub recorded_at: DateTime<Utc>,
    pub event_type: String,
    pub description: String,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct LogStatistics {
    pub total_matches: usize,
    pub total_events: usize,
    pub avg_confidence: f32,
    pub min_confidence: Option<f32>,
    pub max_confidence: Option<f32>,
    pub high_confidence_matches: usize,
}

struct RawMatch {
    seq: i64,
    recorded_at: String,
    kind: String,
    identity: Option<String>,
    confidence: f64,
    max_similarity: f64,
    avg_similarity: f64,
    matched: bool,
    threshold: f64,
}

impl RawMatch {
    const COLUMNS: &'static str = "seq, recorded_at, kind, identity_id, confidence, \
                                   max_similarity, avg_similarity, matched, threshold";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            recorded_at: row.get(1)?,
            kind: row.get(2)?,
            identity: row.get(3)?,
            confidence: row.get(4)?,
            max_similarity: row.get(5)?,
            avg_similarity: row.get(6)?,
            matched: row.get(7)?,
            threshold: row.get(8)?,
        })
    }

    fn decode(self) -> Result<MatchEntry, SqliteStoreError> {
        Ok(MatchEntry {
            seq: self.seq,
            recorded_at: parse_timestamp(&self.recorded_at)?,
            kind: self.kind.parse()?,
            identity: self.identity.map(IdentityId::new),
            confidence: self.confidence as f32,
            max_similarity: self.max_similarity as f32,
            avg_similarity: self.avg_similarity as f32,
            matched: self.matched,
            threshold: self.threshold as f32,
        })
    }
}

/// Persistent match and event log.
pub struct MatchLog {
    conn: Mutex<Connection>,
}

impl MatchLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SqliteStoreError> {
        Ok(Self {
            conn: Mutex::new(open_connection(path.as_ref())?),
        })
    }

    pub fn open_in_memory() -> Result<Self, SqliteStoreError> {
        Ok(Self {
            conn: Mutex::new(open_memory_connection()?),
        })
    }

    /// Record one decision. Returns the entry's sequence number.
    pub fn record_match(
        &self,
        kind: MatchKind,
        result: &MatchResult,
        threshold: f32,
    ) -> Result<i64, SqliteStoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO match_log (recorded_at, kind, identity_id, confidence, max_similarity,
                                    avg_similarity, matched, threshold)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                timestamp(Utc::now()),
                kind.as_str(),
                result.identity.as_ref().map(|id| id.as_str()),
                result.confidence as f64,
                result.max_similarity as f64,
                result.avg_similarity as f64,
                result.matched,
                threshold as f64,
            ],
        )?;
        let seq = conn.last_insert_rowid();
        tracing::debug!(seq, kind = kind.as_str(), matched = result.matched, "match logged");
        Ok(seq)
    }

    /// Record a system event with free-form metadata.
    pub fn record_event(
        &self,
        event_type: &str,
        description: &str,
        metadata: serde_json::Value,
    ) -> Result<i64, SqliteStoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO event_log (recorded_at, event_type, description, metadata)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                timestamp(Utc::now()),
                event_type,
                description,
                serde_json::to_string(&metadata)?,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn query_matches(
        &self,
        filter: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<MatchEntry>, SqliteStoreError> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {} FROM match_log {filter}", RawMatch::COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params, RawMatch::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(RawMatch::decode).collect()
    }

    /// Newest first.
    pub fn recent_matches(&self, limit: usize) -> Result<Vec<MatchEntry>, SqliteStoreError> {
        let limit = limit as i64;
        self.query_matches("ORDER BY seq DESC LIMIT ?1", &[&limit])
    }

    /// Oldest first.
    pub fn matches_for(&self, identity: &IdentityId) -> Result<Vec<MatchEntry>, SqliteStoreError> {
        self.query_matches("WHERE identity_id = ?1 ORDER BY seq", &[&identity.as_str()])
    }

    pub fn high_confidence_matches(
        &self,
        threshold: f32,
    ) -> Result<Vec<MatchEntry>, SqliteStoreError> {
        let threshold = threshold as f64;
        self.query_matches("WHERE confidence >= ?1 ORDER BY seq", &[&threshold])
    }

    /// The `limit` newest matches, optionally restricted to one identity
    /// and to a minimum confidence. Newest first.
    pub fn find_matches(
        &self,
        identity: Option<&IdentityId>,
        min_confidence: Option<f32>,
        limit: usize,
    ) -> Result<Vec<MatchEntry>, SqliteStoreError> {
        let identity = identity.map(|id| id.as_str());
        let min_confidence = min_confidence.map(|c| c as f64);
        let limit = limit as i64;
        self.query_matches(
            "WHERE (?1 IS NULL OR identity_id = ?1) AND (?2 IS NULL OR confidence >= ?2)
             ORDER BY seq DESC LIMIT ?3",
            &[&identity, &min_confidence, &limit],
        )
    }

    /// Newest first.
    pub fn recent_events(&self, limit: usize) -> Result<Vec<EventEntry>, SqliteStoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT seq, recorded_at, event_type, description, metadata
             FROM event_log ORDER BY seq DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(seq, recorded_at, event_type, description, metadata)| -> Result<_, SqliteStoreError> {
                Ok(EventEntry {
                    seq,
                    recorded_at: parse_timestamp(&recorded_at)?,
                    event_type,
                    description,
                    metadata: serde_json::from_str(&metadata)?,
                })
            })
            .collect()
    }

    pub fn statistics(&self) -> Result<LogStatistics, SqliteStoreError> {
        let conn = self.conn.lock();
        let (total, avg, min, max, high): (i64, Option<f64>, Option<f64>, Option<f64>, i64) = conn
            .query_row(
                "SELECT COUNT(*), AVG(confidence), MIN(confidence), MAX(confidence),
                        COUNT(CASE WHEN confidence >= ?1 THEN 1 END)
                 FROM match_log",
                params![HIGH_CONFIDENCE as f64],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
            )?;
        let events: i64 = conn.query_row("SELECT COUNT(*) FROM event_log", [], |row| row.get(0))?;

        Ok(LogStatistics {
            total_matches: total as usize,
            total_events: events as usize,
            avg_confidence: avg.unwrap_or(0.0) as f32,
            min_confidence: min.map(|v| v as f32),
            max_confidence: max.map(|v| v as f32),
            high_confidence_matches: high as usize,
        })
    }

    /// Delete every match and event entry.
    pub fn clear(&self) -> Result<(), SqliteStoreError> {
        let mut conn = self.conn.lock();
        let tx = begin_write(&mut conn)?;
        tx.execute("DELETE FROM match_log", [])?;
        tx.execute("DELETE FROM event_log", [])?;
        tx.commit()?;
        tracing::info!("match log cleared");
        Ok(())
    }
}
