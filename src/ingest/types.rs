// src/ingest/types.rs
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::NormalizeRejection;
use crate::model::EventRecord;

/// Body of one feed response, stamped with the time we received it.
#[derive(Debug, Clone)]
pub struct RawPayload {
    pub body: String,
    pub retrieved_at: DateTime<Utc>,
}

/// One dropped feed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Rejection {
    /// Position of the item in the provider list.
    pub index: usize,
    pub reason: NormalizeRejection,
}

#[derive(Debug, Clone, Default)]
pub struct Normalized {
    pub records: Vec<EventRecord>,
    pub rejections: Vec<Rejection>,
}

/// Steps of one cycle, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    Fetching,
    Normalizing,
    Persisting,
    Evaluating,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleSummary {
    pub fetched: usize,
    pub rejected: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub alerts: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleFailure {
    pub phase: CyclePhase,
    pub kind: String,
    pub message: String,
}

impl CycleFailure {
    pub fn new(phase: CyclePhase, kind: impl Into<String>, message: impl ToString) -> Self {
        Self {
            phase,
            kind: kind.into(),
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleResult {
    Success(CycleSummary),
    Failure(CycleFailure),
}

/// What the UI layer needs to show "last successful fetch" and error banners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleOutcome {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(flatten)]
    pub result: CycleResult,
}

impl CycleOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self.result, CycleResult::Success(_))
    }

    pub fn summary(&self) -> Option<&CycleSummary> {
        match &self.result {
            CycleResult::Success(s) => Some(s),
            CycleResult::Failure(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&CycleFailure> {
        match &self.result {
            CycleResult::Success(_) => None,
            CycleResult::Failure(f) => Some(f),
        }
    }
}
