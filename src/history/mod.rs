//! Practice history: one outcome record per terminated rehearsal session.
//!
//! Recording is best-effort. [`PracticeRecorder::record`] returns a
//! `Result` so stores can report failures, but the engine only logs them;
//! teardown never waits on or fails because of history.

mod sqlite;

pub use sqlite::SqlitePracticeLog;

use std::sync::Mutex;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::rehearsal::{Outcome, RehearsalMode};

/// One row of practice history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PracticeRecord {
    pub script_id: String,
    pub self_speaker: String,
    pub mode: RehearsalMode,
    pub read_all_as_other: bool,
    pub from: i64,
    pub to: i64,
    /// 1 iff `outcome` is [`Outcome::Completed`].
    pub loops_completed: u32,
    pub last_emitted_line_position: Option<i64>,
    pub duration_ms: u64,
    pub outcome: Outcome,
    pub ended_at: DateTime<Utc>,
}

/// Sink for practice outcome records.
#[cfg_attr(test, mockall::automock)]
pub trait PracticeRecorder: Send + Sync {
    fn record(&self, record: &PracticeRecord) -> Result<()>;
}

/// Recorder keeping everything in memory, for tests and embedding.
#[derive(Default)]
pub struct MemoryPracticeLog {
    records: Mutex<Vec<PracticeRecord>>,
}

impl MemoryPracticeLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<PracticeRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl PracticeRecorder for MemoryPracticeLog {
    fn record(&self, record: &PracticeRecord) -> Result<()> {
        self.records
            .lock()
            .map_err(|_| anyhow::anyhow!("practice log lock poisoned"))?
            .push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn sample_record(outcome: Outcome) -> PracticeRecord {
    PracticeRecord {
        script_id: "macbeth".to_string(),
        self_speaker: "lady macbeth".to_string(),
        mode: RehearsalMode::Practice,
        read_all_as_other: false,
        from: 10,
        to: 42,
        loops_completed: u32::from(outcome == Outcome::Completed),
        last_emitted_line_position: Some(17),
        duration_ms: 65_000,
        outcome,
        ended_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_log_appends() {
        let log = MemoryPracticeLog::new();
        log.record(&sample_record(Outcome::Stopped)).unwrap();
        log.record(&sample_record(Outcome::Completed)).unwrap();
        let records = log.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].loops_completed, 0);
        assert_eq!(records[1].loops_completed, 1);
    }

    #[test]
    fn record_serializes_snake_case_enums() {
        let json = serde_json::to_value(sample_record(Outcome::Expired)).unwrap();
        assert_eq!(json["mode"], "practice");
        assert_eq!(json["outcome"], "expired");
    }
}
