//! # Alert evaluation
//! Turns newly persisted records into [`AlertIntent`]s.
//!
//! Stateless: the only inputs are the records and the threshold. Duplicates
//! never reach this point (the store filters them), which is what keeps
//! alerting at-most-once per physical event.

use serde::{Deserialize, Serialize};

use crate::model::EventRecord;

/// One row of the severity table: magnitudes `>= min_magnitude` (up to the
/// next bucket) get `label`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeverityBucket {
    pub min_magnitude: f64,
    pub label: String,
}

impl SeverityBucket {
    pub fn new(min_magnitude: f64, label: impl Into<String>) -> Self {
        Self {
            min_magnitude,
            label: label.into(),
        }
    }
}

pub fn default_buckets() -> Vec<SeverityBucket> {
    vec![
        SeverityBucket::new(0.0, "Minor"),
        SeverityBucket::new(4.0, "Light"),
        SeverityBucket::new(5.0, "Moderate"),
        SeverityBucket::new(6.0, "Strong"),
        SeverityBucket::new(7.0, "Major"),
    ]
}

/// Magnitude → label lookup, sorted ascending by lower bound.
#[derive(Debug, Clone, PartialEq)]
pub struct SeverityTable {
    buckets: Vec<SeverityBucket>,
}

impl SeverityTable {
    /// Non-finite bounds are dropped; an empty table falls back to the defaults.
    pub fn new(buckets: Vec<SeverityBucket>) -> Self {
        let mut buckets: Vec<SeverityBucket> = buckets
            .into_iter()
            .filter(|b| b.min_magnitude.is_finite())
            .collect();
        if buckets.is_empty() {
            buckets = default_buckets();
        }
        buckets.sort_by(|a, b| a.min_magnitude.total_cmp(&b.min_magnitude));
        Self { buckets }
    }

    /// Below the lowest bound the lowest label applies.
    pub fn label_for(&self, magnitude: f64) -> &str {
        self.buckets
            .iter()
            .rev()
            .find(|b| magnitude >= b.min_magnitude)
            .or_else(|| self.buckets.first())
            .map(|b| b.label.as_str())
            .unwrap_or_default()
    }

    /// Position of a label in the table; higher means more severe.
    pub fn rank_of(&self, label: &str) -> Option<usize> {
        self.buckets.iter().position(|b| b.label == label)
    }
}

impl Default for SeverityTable {
    fn default() -> Self {
        Self::new(default_buckets())
    }
}

/// A request to notify, independent of how it gets delivered.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertIntent {
    pub record: EventRecord,
    pub severity: String,
    /// Position of `severity` in the table (0 = least severe).
    pub severity_rank: usize,
}

#[derive(Debug, Clone, Default)]
pub struct AlertEvaluator {
    table: SeverityTable,
}

impl AlertEvaluator {
    pub fn new(table: SeverityTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &SeverityTable {
        &self.table
    }

    /// One intent per record with `magnitude >= threshold`, input order kept.
    pub fn evaluate(&self, newly_inserted: &[EventRecord], threshold: f64) -> Vec<AlertIntent> {
        newly_inserted
            .iter()
            .filter(|r| r.magnitude >= threshold)
            .map(|r| {
                let severity = self.table.label_for(r.magnitude).to_string();
                let severity_rank = self.table.rank_of(&severity).unwrap_or(0);
                AlertIntent {
                    record: r.clone(),
                    severity,
                    severity_rank,
                }
            })
            .collect()
    }
}
