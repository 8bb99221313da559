// src/ingest/scheduler.rs
//! Periodic driver for [`Pipeline::run_cycle`].
//!
//! One tokio task per running scheduler. Cycles never overlap: the cycle is
//! awaited inline in the loop, and ticks that elapse meanwhile are skipped.
//! `stop()` lets an in-flight cycle finish before the task exits.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::SchedulerConfig;
use crate::ingest::types::{CycleFailure, CycleOutcome, CyclePhase, CycleResult};
use crate::ingest::Pipeline;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Idle,
    Running(CyclePhase),
    Stopped,
}

/// Snapshot for status displays.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    pub last_outcome: Option<CycleOutcome>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub cycles_run: u64,
    pub ticks_skipped: u64,
}

impl Default for SchedulerStatus {
    fn default() -> Self {
        Self {
            state: SchedulerState::Stopped,
            last_outcome: None,
            last_success_at: None,
            consecutive_failures: 0,
            cycles_run: 0,
            ticks_skipped: 0,
        }
    }
}

/// Shared, cheaply clonable view of the scheduler status.
#[derive(Debug, Clone, Default)]
pub struct StatusHandle {
    inner: Arc<RwLock<SchedulerStatus>>,
}

impl StatusHandle {
    pub fn snapshot(&self) -> SchedulerStatus {
        self.inner
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn update(&self, f: impl FnOnce(&mut SchedulerStatus)) {
        let mut guard = self.inner.write().unwrap_or_else(|p| p.into_inner());
        f(&mut guard);
    }

    fn set_state(&self, state: SchedulerState) {
        self.update(|s| s.state = state);
    }

    fn current_phase(&self) -> Option<CyclePhase> {
        match self.snapshot().state {
            SchedulerState::Running(p) => Some(p),
            _ => None,
        }
    }

    fn record(&self, outcome: CycleOutcome) {
        self.update(|s| {
            s.cycles_run += 1;
            if outcome.is_success() {
                s.consecutive_failures = 0;
                s.last_success_at = Some(outcome.finished_at);
            } else {
                s.consecutive_failures = s.consecutive_failures.saturating_add(1);
            }
            s.last_outcome = Some(outcome);
            if s.state != SchedulerState::Stopped {
                s.state = SchedulerState::Idle;
            }
        });
    }

    fn add_skipped(&self, n: u64) {
        if n > 0 {
            self.update(|s| s.ticks_skipped += n);
        }
    }
}

/// Ticks to sit out after `consecutive_failures` failures in a row:
/// `min(2^(failures-1), max_skip)`; zero when `max_skip` is 0.
pub fn backoff_ticks(consecutive_failures: u32, max_skip: u32) -> u32 {
    if max_skip == 0 || consecutive_failures == 0 {
        return 0;
    }
    let exp = consecutive_failures.saturating_sub(1).min(31);
    (1u32 << exp).min(max_skip)
}

struct Running {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct Scheduler {
    pipeline: Arc<Pipeline>,
    cfg: SchedulerConfig,
    status: StatusHandle,
    running: Mutex<Option<Running>>,
}

impl Scheduler {
    pub fn new(pipeline: Arc<Pipeline>, cfg: SchedulerConfig) -> Self {
        Self {
            pipeline,
            cfg,
            status: StatusHandle::default(),
            running: Mutex::new(None),
        }
    }

    pub fn status(&self) -> StatusHandle {
        self.status.clone()
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Spawn the periodic task; the first cycle runs immediately. No-op when
    /// already running.
    pub async fn start(&self, interval: Duration) {
        let mut running = self.running.lock().await;
        if running.is_some() {
            tracing::debug!(target: "scheduler", "start ignored: already running");
            return;
        }
        let interval = interval.max(Duration::from_millis(1));
        let (stop_tx, stop_rx) = watch::channel(false);
        self.status.set_state(SchedulerState::Idle);

        let task = tokio::spawn(run_loop(
            self.pipeline.clone(),
            self.status.clone(),
            interval,
            self.cfg.cycle_hard_cap(),
            self.cfg.backoff_max_skipped_ticks,
            stop_rx,
        ));
        tracing::info!(target: "scheduler", interval_ms = interval.as_millis() as u64, "scheduler started");
        *running = Some(Running { stop_tx, task });
    }

    /// Signal the task and wait for the in-flight cycle (if any) to finish.
    pub async fn stop(&self) {
        let Some(Running { stop_tx, task }) = self.running.lock().await.take() else {
            return;
        };
        let _ = stop_tx.send(true);
        if let Err(e) = task.await {
            tracing::error!(target: "scheduler", error = %e, "scheduler task ended abnormally");
        }
        self.status.set_state(SchedulerState::Stopped);
        tracing::info!(target: "scheduler", "scheduler stopped");
    }
}

async fn run_loop(
    pipeline: Arc<Pipeline>,
    status: StatusHandle,
    interval: Duration,
    hard_cap: Duration,
    max_skip: u32,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut skip_left: u32 = 0;

    loop {
        tokio::select! {
            biased;
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
                continue;
            }
            _ = ticker.tick() => {}
        }

        if skip_left > 0 {
            skip_left -= 1;
            status.add_skipped(1);
            tracing::debug!(target: "scheduler", remaining = skip_left, "tick skipped by backoff");
            continue;
        }

        let tick_started = tokio::time::Instant::now();
        let outcome = run_capped(&pipeline, &status, hard_cap).await;
        let failures = {
            status.record(outcome);
            status.snapshot().consecutive_failures
        };
        skip_left = backoff_ticks(failures, max_skip);

        // Whole intervals the cycle overran are dropped by the ticker.
        let overran = tick_started.elapsed().as_nanos() / interval.as_nanos().max(1);
        status.add_skipped(u64::try_from(overran).unwrap_or(u64::MAX));
    }
}

async fn run_capped(pipeline: &Pipeline, status: &StatusHandle, hard_cap: Duration) -> CycleOutcome {
    let started_at = Utc::now();
    let on_phase = |phase: CyclePhase| status.set_state(SchedulerState::Running(phase));

    match tokio::time::timeout(hard_cap, pipeline.run_cycle(on_phase)).await {
        Ok(outcome) => outcome,
        Err(_) => {
            let phase = status.current_phase().unwrap_or(CyclePhase::Fetching);
            tracing::warn!(
                target: "scheduler",
                phase = ?phase,
                hard_cap_ms = hard_cap.as_millis() as u64,
                started_at = %started_at.to_rfc3339(),
                "cycle exceeded hard cap; abandoned"
            );
            let pending = pipeline.unsent_alerts();
            if !pending.is_empty() {
                let keys: Vec<&str> = pending.iter().map(|k| k.as_str()).collect();
                tracing::warn!(
                    target: "notify",
                    count = pending.len(),
                    identity_keys = %keys.join(","),
                    "alerts interrupted by hard cap; held for the next cycle"
                );
            }
            metrics::counter!("quake_cycles_total", "outcome" => "failure").increment(1);
            CycleOutcome {
                started_at,
                finished_at: Utc::now(),
                result: CycleResult::Failure(CycleFailure::new(
                    phase,
                    "timeout",
                    format!("cycle exceeded hard cap of {hard_cap:?}"),
                )),
            }
        }
    }
}
