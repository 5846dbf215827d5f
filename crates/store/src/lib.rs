//! `fleetlink-store` — SQLite persistence for source records, correlation
//! results, and analysis runs.
//!
//! One `Store` wraps one connection. Callers that want concurrency open
//! one `Store` per worker against the same path; WAL mode plus a busy
//! timeout keeps writers from tripping over each other.

use std::path::Path;

use rusqlite::Connection;

pub mod correlation;
pub mod orphan;
pub mod runs;
pub mod schema;
pub mod source;

pub use correlation::{CorrelationFilter, NewCorrelation, UpsertOutcome};
pub use orphan::OrphanGroup;
pub use runs::{AnalysisRun, RunStats, RunStatus};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum StoreError {
    /// Underlying SQLite failure.
    Sqlite(rusqlite::Error),
    /// A stored value could not be decoded (bad timestamp, bad JSON).
    Corrupt(String),
    /// The requested row does not exist.
    NotFound(String),
    /// The write was refused because the target row is verified.
    VerifiedConflict(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(e) => write!(f, "sqlite error: {e}"),
            Self::Corrupt(msg) => write!(f, "corrupt row: {msg}"),
            Self::NotFound(what) => write!(f, "not found: {what}"),
            Self::VerifiedConflict(id) => write!(f, "correlation {id} is verified"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Sqlite(e) => Some(e),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Sqlite(e)
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct Store {
    pub(crate) conn: Connection,
}

impl Store {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// In-memory store, used by tests and the config validator.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        // Foreign keys stay off: sources arrive in any order, and an event
        // may reference a vehicle the fleet file has not delivered yet.
        conn.pragma_update(None, "foreign_keys", false)?;
        conn.pragma_update(None, "busy_timeout", 5_000)?;
        conn.execute_batch(schema::SCHEMA)?;
        Ok(Self { conn })
    }
}

// RFC 3339 with fixed UTC offset; lexicographic order matches time order,
// so TEXT comparisons in SQL stay correct.
pub(crate) fn format_ts(ts: chrono::DateTime<chrono::Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

pub(crate) fn parse_ts(s: &str) -> Result<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&chrono::Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp {s:?}: {e}")))
}

pub(crate) fn parse_date(s: &str) -> Result<chrono::NaiveDate> {
    chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| StoreError::Corrupt(format!("date {s:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn timestamps_round_trip_and_sort_lexicographically() {
        let a = chrono::Utc.with_ymd_and_hms(2026, 3, 10, 14, 0, 0).unwrap();
        let b = chrono::Utc.with_ymd_and_hms(2026, 3, 10, 14, 0, 1).unwrap();
        assert_eq!(parse_ts(&format_ts(a)).unwrap(), a);
        assert!(format_ts(a) < format_ts(b));
    }

    #[test]
    fn open_in_memory_applies_schema() {
        let store = Store::open_in_memory().unwrap();
        let n: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM correlations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 0);
    }
}
