// src/ingest/mod.rs
pub mod fetcher;
pub mod normalizer;
pub mod scheduler;
pub mod types;

use chrono::{DateTime, Utc};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use once_cell::sync::OnceCell;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::alerts::{AlertEvaluator, AlertIntent, SeverityTable};
use crate::config::AlertConfig;
use crate::ingest::fetcher::Fetcher;
use crate::ingest::normalizer::Normalizer;
use crate::ingest::types::{
    CycleFailure, CycleOutcome, CyclePhase, CycleResult, CycleSummary,
};
use crate::model::{EventRecord, IdentityKey};
use crate::notify::Notifier;
use crate::store::Store;

/// One-time metrics registration (so series show up on /metrics).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("quake_cycles_total", "Fetch cycles run, by outcome.");
        describe_counter!("quake_fetch_errors_total", "Feed fetch failures, by kind.");
        describe_counter!(
            "quake_normalize_rejections_total",
            "Feed items dropped during normalization, by reason."
        );
        describe_counter!("quake_events_inserted_total", "Events newly persisted.");
        describe_counter!(
            "quake_events_duplicate_total",
            "Events already present in the store."
        );
        describe_counter!("quake_alerts_total", "Alert intents emitted, by severity.");
        describe_histogram!("quake_cycle_ms", "Cycle wall time in milliseconds.");
        describe_histogram!("quake_fetch_ms", "Feed fetch time in milliseconds.");
        describe_gauge!(
            "quake_last_success_ts",
            "Unix ts of the last successful cycle."
        );
    });
}

/// Alerting knobs the pipeline applies on top of [`AlertEvaluator`].
#[derive(Debug, Clone)]
pub struct AlertSettings {
    pub threshold: f64,
    /// `None` = alert on every new record regardless of age.
    pub max_event_age: Option<Duration>,
    pub table: SeverityTable,
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self::from(&AlertConfig::default())
    }
}

impl From<&AlertConfig> for AlertSettings {
    fn from(cfg: &AlertConfig) -> Self {
        Self {
            threshold: cfg.threshold,
            max_event_age: (cfg.max_event_age_secs > 0).then(|| cfg.max_event_age()),
            table: SeverityTable::new(cfg.buckets.clone()),
        }
    }
}

/// Fetch → normalize → persist → evaluate, once per call.
pub struct Pipeline {
    fetcher: Arc<dyn Fetcher>,
    normalizer: Normalizer,
    store: Store,
    notifier: Arc<dyn Notifier>,
    evaluator: AlertEvaluator,
    threshold: f64,
    max_event_age: Option<Duration>,
    /// Start of the most recent successful cycle.
    last_success: Mutex<Option<DateTime<Utc>>>,
    /// Intents not yet handed to the notifier, oldest first. Outlives a
    /// cycle that is cut off mid-delivery.
    unsent: Mutex<VecDeque<AlertIntent>>,
}

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl Pipeline {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        normalizer: Normalizer,
        store: Store,
        notifier: Arc<dyn Notifier>,
        alerts: AlertSettings,
    ) -> Self {
        ensure_metrics_described();
        Self {
            fetcher,
            normalizer,
            store,
            notifier,
            evaluator: AlertEvaluator::new(alerts.table),
            threshold: alerts.threshold,
            max_event_age: alerts.max_event_age,
            last_success: Mutex::new(None),
            unsent: Mutex::new(VecDeque::new()),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Run one cycle. `on_phase` is called when each step starts.
    ///
    /// Never panics and never returns early with an error: a failing step
    /// ends the cycle and is reported in the outcome. Nothing is persisted
    /// when fetch or normalization fails.
    pub async fn run_cycle<F>(&self, on_phase: F) -> CycleOutcome
    where
        F: Fn(CyclePhase) + Send + Sync,
    {
        let started_at = Utc::now();
        let t0 = Instant::now();

        let result = match self.steps(started_at, &on_phase).await {
            Ok(summary) => {
                *locked(&self.last_success) = Some(started_at);
                CycleResult::Success(summary)
            }
            Err(failure) => CycleResult::Failure(failure),
        };
        let outcome = CycleOutcome {
            started_at,
            finished_at: Utc::now(),
            result,
        };

        histogram!("quake_cycle_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
        record_outcome(&outcome);
        outcome
    }

    async fn steps<F>(
        &self,
        started_at: DateTime<Utc>,
        on_phase: &F,
    ) -> Result<CycleSummary, CycleFailure>
    where
        F: Fn(CyclePhase) + Send + Sync,
    {
        on_phase(CyclePhase::Fetching);
        let raw = self.fetcher.fetch().await.map_err(|e| {
            counter!("quake_fetch_errors_total", "kind" => e.kind()).increment(1);
            CycleFailure::new(CyclePhase::Fetching, e.kind(), e)
        })?;

        on_phase(CyclePhase::Normalizing);
        let normalized = self
            .normalizer
            .normalize(&raw)
            .map_err(|e| CycleFailure::new(CyclePhase::Normalizing, "unreadable_payload", e))?;
        for rej in &normalized.rejections {
            counter!("quake_normalize_rejections_total", "reason" => rej.reason.as_str())
                .increment(1);
        }
        if !normalized.rejections.is_empty() {
            tracing::info!(
                target: "ingest",
                rejected = normalized.rejections.len(),
                kept = normalized.records.len(),
                "feed items rejected"
            );
        }

        on_phase(CyclePhase::Persisting);
        let report = self
            .store
            .upsert_batch(&normalized.records)
            .await
            .map_err(|e| CycleFailure::new(CyclePhase::Persisting, e.kind(), e))?;
        counter!("quake_events_inserted_total").increment(report.inserted as u64);
        counter!("quake_events_duplicate_total").increment(report.duplicates as u64);

        on_phase(CyclePhase::Evaluating);
        let fresh = self.alertable(&report.new_records, started_at);
        let intents = self.evaluator.evaluate(&fresh, self.threshold);
        for intent in &intents {
            counter!("quake_alerts_total", "severity" => intent.severity.clone()).increment(1);
        }
        locked(&self.unsent).extend(intents.iter().cloned());
        self.deliver_unsent().await;

        Ok(CycleSummary {
            fetched: normalized.records.len() + normalized.rejections.len(),
            rejected: normalized.rejections.len(),
            inserted: report.inserted,
            duplicates: report.duplicates,
            alerts: intents.len(),
        })
    }

    /// Identity keys of alerts still waiting for delivery. They go out,
    /// oldest first, the next time a cycle reaches evaluation.
    pub fn unsent_alerts(&self) -> Vec<IdentityKey> {
        locked(&self.unsent)
            .iter()
            .map(|a| a.record.identity_key.clone())
            .collect()
    }

    // An intent leaves the queue only once its send has returned, so a
    // cancelled cycle leaves it for the next one.
    async fn deliver_unsent(&self) {
        while let Some(intent) = self.next_unsent() {
            if let Err(e) = self.notifier.send(&intent).await {
                tracing::warn!(
                    target: "notify",
                    channel = self.notifier.name(),
                    identity_key = %intent.record.identity_key,
                    error = %e,
                    "alert delivery failed"
                );
            }
            self.mark_sent(&intent.record.identity_key);
        }
    }

    fn next_unsent(&self) -> Option<AlertIntent> {
        locked(&self.unsent).front().cloned()
    }

    fn mark_sent(&self, key: &IdentityKey) {
        let mut queue = locked(&self.unsent);
        if let Some(i) = queue.iter().position(|a| &a.record.identity_key == key) {
            queue.remove(i);
        }
    }

    /// New records old enough to predate both the age window and the last
    /// successful cycle are stored silently. Anything that happened after
    /// the last success still alerts, however long the feed was down.
    fn alertable(&self, new_records: &[EventRecord], started_at: DateTime<Utc>) -> Vec<EventRecord> {
        let Some(max_age) = self.max_event_age else {
            return new_records.to_vec();
        };
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let by_age = started_at
            .checked_sub_signed(max_age)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let cutoff = match *locked(&self.last_success) {
            Some(last) => by_age.min(last),
            None => by_age,
        };
        new_records
            .iter()
            .filter(|r| r.occurred_at >= cutoff)
            .cloned()
            .collect()
    }
}

fn record_outcome(outcome: &CycleOutcome) {
    match &outcome.result {
        CycleResult::Success(s) => {
            counter!("quake_cycles_total", "outcome" => "success").increment(1);
            gauge!("quake_last_success_ts").set(outcome.finished_at.timestamp() as f64);
            tracing::info!(
                target: "ingest",
                fetched = s.fetched,
                rejected = s.rejected,
                inserted = s.inserted,
                duplicates = s.duplicates,
                alerts = s.alerts,
                "cycle finished"
            );
        }
        CycleResult::Failure(f) => {
            counter!("quake_cycles_total", "outcome" => "failure").increment(1);
            tracing::warn!(
                target: "ingest",
                phase = ?f.phase,
                kind = %f.kind,
                started_at = %outcome.started_at.to_rfc3339(),
                error = %f.message,
                "cycle failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_age_disables_age_gate() {
        let cfg = AlertConfig {
            max_event_age_secs: 0,
            ..AlertConfig::default()
        };
        assert!(AlertSettings::from(&cfg).max_event_age.is_none());
        assert_eq!(
            AlertSettings::default().max_event_age,
            Some(Duration::from_secs(3600))
        );
    }
}
