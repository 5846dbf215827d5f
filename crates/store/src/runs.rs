//! Analysis-run bookkeeping. A run moves through
//! created → running → completed | failed, and its final stats live on
//! the same row.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use crate::{format_ts, parse_ts, Result, Store, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RunStats {
    pub processed: u64,
    pub matched: u64,
    pub failed: u64,
    pub high_confidence: u64,
    pub needs_review: u64,
    pub avg_confidence: f64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AnalysisRun {
    pub id: String,
    pub kind: String,
    pub status: RunStatus,
    /// JSON description of what the run covered.
    pub scope: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stats: RunStats,
    pub error: Option<String>,
}

fn run_from_row(row: &Row) -> rusqlite::Result<(AnalysisRun, String, String, Option<String>)> {
    Ok((
        AnalysisRun {
            id: row.get(0)?,
            kind: row.get(1)?,
            status: RunStatus::Created,
            scope: row.get(3)?,
            started_at: Utc::now(),
            finished_at: None,
            stats: RunStats {
                processed: row.get::<_, i64>(6)? as u64,
                matched: row.get::<_, i64>(7)? as u64,
                failed: row.get::<_, i64>(8)? as u64,
                high_confidence: row.get::<_, i64>(9)? as u64,
                needs_review: row.get::<_, i64>(10)? as u64,
                avg_confidence: row.get(11)?,
            },
            error: row.get(12)?,
        },
        row.get(2)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn finish_run(raw: (AnalysisRun, String, String, Option<String>)) -> Result<AnalysisRun> {
    let (mut run, status, started, finished) = raw;
    run.status = status.parse().map_err(StoreError::Corrupt)?;
    run.started_at = parse_ts(&started)?;
    run.finished_at = finished.as_deref().map(parse_ts).transpose()?;
    Ok(run)
}

const RUN_COLS: &str = "id, kind, status, scope, started_at, finished_at, \
     processed, matched, failed, high_confidence, needs_review, avg_confidence, error";

impl Store {
    /// Create a run row in `created` state and return its id.
    pub fn create_run(&self, kind: &str, scope: &str) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        self.conn.execute(
            "INSERT INTO runs (id, kind, status, scope, started_at)
             VALUES (?1, ?2, 'created', ?3, ?4)",
            params![id, kind, scope, format_ts(Utc::now())],
        )?;
        Ok(id)
    }

    pub fn set_run_running(&self, id: &str) -> Result<()> {
        self.update_run_status(id, "UPDATE runs SET status = 'running', started_at = ?2 WHERE id = ?1")
    }

    fn update_run_status(&self, id: &str, sql: &str) -> Result<()> {
        let changed = self.conn.execute(sql, params![id, format_ts(Utc::now())])?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("run {id}")));
        }
        Ok(())
    }

    pub fn complete_run(&self, id: &str, stats: &RunStats) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE runs SET status = 'completed', finished_at = ?2,
                 processed = ?3, matched = ?4, failed = ?5,
                 high_confidence = ?6, needs_review = ?7, avg_confidence = ?8
             WHERE id = ?1",
            params![
                id,
                format_ts(Utc::now()),
                stats.processed as i64,
                stats.matched as i64,
                stats.failed as i64,
                stats.high_confidence as i64,
                stats.needs_review as i64,
                stats.avg_confidence,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("run {id}")));
        }
        Ok(())
    }

    pub fn fail_run(&self, id: &str, error: &str, stats: &RunStats) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE runs SET status = 'failed', finished_at = ?2, error = ?3,
                 processed = ?4, matched = ?5, failed = ?6,
                 high_confidence = ?7, needs_review = ?8, avg_confidence = ?9
             WHERE id = ?1",
            params![
                id,
                format_ts(Utc::now()),
                error,
                stats.processed as i64,
                stats.matched as i64,
                stats.failed as i64,
                stats.high_confidence as i64,
                stats.needs_review as i64,
                stats.avg_confidence,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("run {id}")));
        }
        Ok(())
    }

    pub fn get_run(&self, id: &str) -> Result<AnalysisRun> {
        let sql = format!("SELECT {RUN_COLS} FROM runs WHERE id = ?1");
        let raw = self
            .conn
            .query_row(&sql, params![id], run_from_row)
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("run {id}")))?;
        finish_run(raw)
    }

    /// Most recent runs first.
    pub fn list_runs(&self, limit: usize) -> Result<Vec<AnalysisRun>> {
        let sql = format!("SELECT {RUN_COLS} FROM runs ORDER BY started_at DESC, id LIMIT ?1");
        let mut stmt = self.conn.prepare(&sql)?;
        let raws = stmt
            .query_map(params![limit as i64], run_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter().map(finish_run).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_lifecycle() {
        let s = Store::open_in_memory().unwrap();
        let id = s.create_run("driver", "{}").unwrap();
        assert_eq!(s.get_run(&id).unwrap().status, RunStatus::Created);

        s.set_run_running(&id).unwrap();
        assert_eq!(s.get_run(&id).unwrap().status, RunStatus::Running);

        let stats = RunStats {
            processed: 10,
            matched: 8,
            failed: 1,
            high_confidence: 5,
            needs_review: 2,
            avg_confidence: 71.5,
        };
        s.complete_run(&id, &stats).unwrap();
        let run = s.get_run(&id).unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.stats, stats);
        assert!(run.finished_at.is_some());
        assert!(run.error.is_none());
    }

    #[test]
    fn failed_run_records_the_error_and_partial_stats() {
        let s = Store::open_in_memory().unwrap();
        let id = s.create_run("delivery", "{}").unwrap();
        s.set_run_running(&id).unwrap();
        let stats = RunStats { processed: 3, ..Default::default() };
        s.fail_run(&id, "timed out after 60s", &stats).unwrap();
        let run = s.get_run(&id).unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.as_deref(), Some("timed out after 60s"));
        assert_eq!(run.stats.processed, 3);
    }

    #[test]
    fn unknown_run_is_not_found() {
        let s = Store::open_in_memory().unwrap();
        assert!(matches!(s.get_run("nope"), Err(StoreError::NotFound(_))));
        assert!(matches!(s.set_run_running("nope"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn list_runs_newest_first() {
        let s = Store::open_in_memory().unwrap();
        let a = s.create_run("driver", "{}").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1100));
        let b = s.create_run("driver", "{}").unwrap();
        let runs = s.list_runs(10).unwrap();
        assert_eq!(runs[0].id, b);
        assert_eq!(runs[1].id, a);
    }
}
