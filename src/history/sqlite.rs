//! SQLite-backed practice history.

use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use tracing::debug;

use super::{PracticeRecord, PracticeRecorder};
use crate::rehearsal::{Outcome, RehearsalMode};

/// Append-only practice history table.
pub struct SqlitePracticeLog {
    conn: Mutex<Connection>,
}

impl SqlitePracticeLog {
    /// Open (or create) the history database at the given path.
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = if db_path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(db_path).context("failed to open practice history database")?
        };
        Self::with_connection(conn)
    }

    /// Create an in-memory log (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS practice_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                script_id TEXT NOT NULL,
                self_speaker TEXT NOT NULL,
                mode TEXT NOT NULL,
                read_all_as_other INTEGER NOT NULL DEFAULT 0,
                line_from INTEGER NOT NULL,
                line_to INTEGER NOT NULL,
                loops_completed INTEGER NOT NULL DEFAULT 0,
                last_line_position INTEGER,
                duration_ms INTEGER NOT NULL,
                outcome TEXT NOT NULL,
                ended_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_practice_history_script ON practice_history(script_id);
            ",
        )
        .context("failed to initialize practice history schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Most recent records first.
    pub fn recent(&self, limit: usize) -> Result<Vec<PracticeRecord>> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("practice history lock poisoned"))?;
        let mut stmt = conn.prepare(
            "SELECT script_id, self_speaker, mode, read_all_as_other, line_from, line_to,
                    loops_completed, last_line_position, duration_ms, outcome, ended_at
             FROM practice_history ORDER BY id DESC LIMIT ?1",
        )?;

        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, bool>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, u32>(6)?,
                row.get::<_, Option<i64>>(7)?,
                row.get::<_, i64>(8)?,
                row.get::<_, String>(9)?,
                row.get::<_, String>(10)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (
                script_id,
                self_speaker,
                mode,
                read_all_as_other,
                from,
                to,
                loops_completed,
                last_emitted_line_position,
                duration_ms,
                outcome,
                ended_at,
            ) = row?;
            records.push(PracticeRecord {
                script_id,
                self_speaker,
                mode: RehearsalMode::from_canonical(&mode)
                    .ok_or_else(|| anyhow!("unknown mode in history: {}", mode))?,
                read_all_as_other,
                from,
                to,
                loops_completed,
                last_emitted_line_position,
                duration_ms: duration_ms.max(0) as u64,
                outcome: Outcome::from_str_opt(&outcome)
                    .ok_or_else(|| anyhow!("unknown outcome in history: {}", outcome))?,
                ended_at: DateTime::parse_from_rfc3339(&ended_at)
                    .context("invalid ended_at in history")?
                    .with_timezone(&Utc),
            });
        }
        Ok(records)
    }
}

impl PracticeRecorder for SqlitePracticeLog {
    fn record(&self, record: &PracticeRecord) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("practice history lock poisoned"))?;
        conn.execute(
            "INSERT INTO practice_history
             (script_id, self_speaker, mode, read_all_as_other, line_from, line_to,
              loops_completed, last_line_position, duration_ms, outcome, ended_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                record.script_id,
                record.self_speaker,
                record.mode.as_str(),
                record.read_all_as_other,
                record.from,
                record.to,
                record.loops_completed,
                record.last_emitted_line_position,
                record.duration_ms as i64,
                record.outcome.as_str(),
                record.ended_at.to_rfc3339(),
            ],
        )
        .context("failed to insert practice history row")?;
        debug!(
            script_id = %record.script_id,
            outcome = record.outcome.as_str(),
            "Practice history row written"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::sample_record;

    #[test]
    fn insert_then_read_back() {
        let log = SqlitePracticeLog::in_memory().unwrap();
        let record = sample_record(Outcome::Completed);
        log.record(&record).unwrap();

        let recent = log.recent(10).unwrap();
        assert_eq!(recent.len(), 1);
        let got = &recent[0];
        assert_eq!(got.script_id, "macbeth");
        assert_eq!(got.mode, RehearsalMode::Practice);
        assert_eq!(got.loops_completed, 1);
        assert_eq!(got.last_emitted_line_position, Some(17));
        assert_eq!(got.outcome, Outcome::Completed);
        assert_eq!(got.ended_at.timestamp(), record.ended_at.timestamp());
    }

    #[test]
    fn recent_is_newest_first_and_limited() {
        let log = SqlitePracticeLog::in_memory().unwrap();
        log.record(&sample_record(Outcome::Stopped)).unwrap();
        log.record(&sample_record(Outcome::Expired)).unwrap();
        log.record(&sample_record(Outcome::Disconnected)).unwrap();

        let recent = log.recent(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].outcome, Outcome::Disconnected);
        assert_eq!(recent[1].outcome, Outcome::Expired);
    }

    #[test]
    fn null_last_position_round_trips() {
        let log = SqlitePracticeLog::in_memory().unwrap();
        let mut record = sample_record(Outcome::Stopped);
        record.last_emitted_line_position = None;
        log.record(&record).unwrap();
        assert_eq!(log.recent(1).unwrap()[0].last_emitted_line_position, None);
    }

    #[test]
    fn open_on_disk_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.db");
        let path = path.to_str().unwrap();
        {
            let log = SqlitePracticeLog::open(path).unwrap();
            log.record(&sample_record(Outcome::Stopped)).unwrap();
        }
        let reopened = SqlitePracticeLog::open(path).unwrap();
        assert_eq!(reopened.recent(10).unwrap().len(), 1);
    }
}
