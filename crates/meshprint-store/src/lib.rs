//! meshprint-store — SQLite persistence for templates and the match log.

pub mod log;
pub mod sqlite;

pub use log::{EventEntry, LogStatistics, MatchEntry, MatchKind, MatchLog, HIGH_CONFIDENCE};
pub use sqlite::{SqliteStore, SqliteStoreError};
