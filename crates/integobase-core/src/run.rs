use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::JobId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    Scheduled,
    Manual,
}

impl RunTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunTrigger::Scheduled => "scheduled",
            RunTrigger::Manual => "manual",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "scheduled" => Some(RunTrigger::Scheduled),
            "manual" => Some(RunTrigger::Manual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Opened but not finalized yet.
    Running,
    Success,
    Partial,
    Failure,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Running => "running",
            RunOutcome::Success => "success",
            RunOutcome::Partial => "partial",
            RunOutcome::Failure => "failure",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(RunOutcome::Running),
            "success" => Some(RunOutcome::Success),
            "partial" => Some(RunOutcome::Partial),
            "failure" => Some(RunOutcome::Failure),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunCounts {
    pub fetched: u64,
    pub created: u64,
    pub updated: u64,
    pub unchanged: u64,
    /// Records deferred at least once during the run.
    pub deferred: u64,
    /// Records still unresolved when the run ended.
    pub skipped: u64,
    pub invalid: u64,
    pub failed: u64,
}

impl RunCounts {
    pub fn written(&self) -> u64 {
        self.created + self.updated
    }

    /// Outcome of a run whose fetch completed: anything short of a clean
    /// pass is reported as partial.
    pub fn settled_outcome(&self) -> RunOutcome {
        if self.invalid == 0 && self.failed == 0 && self.skipped == 0 {
            RunOutcome::Success
        } else {
            RunOutcome::Partial
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordErrorKind {
    Invalid,
    Unresolved,
    StoreWrite,
}

/// Per-record failure sample kept on the run for operator visibility.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordError {
    pub source_id: Option<String>,
    pub kind: RecordErrorKind,
    pub detail: String,
}

/// Last durably processed position for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub watermark: Option<DateTime<Utc>>,
    pub page_token: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn at(watermark: DateTime<Utc>) -> Self {
        Self {
            watermark: Some(watermark),
            page_token: None,
            updated_at: Utc::now(),
        }
    }
}

/// Computes the watermark to persist after a fully committed run.
///
/// `held_back` is the earliest marker among records that must be re-delivered
/// (unresolved deferrals); the watermark stays strictly below it. The result
/// never moves behind `previous`.
pub fn next_watermark(
    previous: Option<DateTime<Utc>>,
    max_seen: Option<DateTime<Utc>>,
    held_back: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    let candidate = match (max_seen, held_back) {
        (Some(seen), Some(held)) => Some(seen.min(held - Duration::microseconds(1))),
        (seen, _) => seen,
    };
    match (previous, candidate) {
        (Some(prev), Some(next)) => Some(prev.max(next)),
        (prev, None) => prev,
        (None, next) => next,
    }
}

/// One execution of a sync job. Opened at job start, finalized exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: Uuid,
    pub job: JobId,
    pub trigger: RunTrigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: RunOutcome,
    pub counts: RunCounts,
    pub checkpoint_before: Option<Checkpoint>,
    pub checkpoint_after: Option<Checkpoint>,
    pub errors: Vec<RecordError>,
    pub message: Option<String>,
}

impl SyncRun {
    pub fn open(job: JobId, trigger: RunTrigger) -> Self {
        Self {
            id: Uuid::new_v4(),
            job,
            trigger,
            started_at: Utc::now(),
            finished_at: None,
            outcome: RunOutcome::Running,
            counts: RunCounts::default(),
            checkpoint_before: None,
            checkpoint_after: None,
            errors: Vec::new(),
            message: None,
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.outcome != RunOutcome::Running
    }

    /// Keeps the first `limit` samples; later ones only show up in counts.
    pub fn sample_error(&mut self, error: RecordError, limit: usize) {
        if self.errors.len() < limit {
            self.errors.push(error);
        }
    }

    pub fn finalize(&mut self, outcome: RunOutcome, message: Option<String>) {
        self.outcome = outcome;
        self.message = message;
        self.finished_at = Some(Utc::now());
    }
}
