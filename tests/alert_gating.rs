// tests/alert_gating.rs
//
// End-to-end cycle over the fixture feed: alerts fire once per physical
// event and only at or above the threshold.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use quake_watch::error::FetchError;
use quake_watch::ingest::types::RawPayload;
use quake_watch::ingest::AlertSettings;
use quake_watch::{
    AlertIntent, Fetcher, FixtureFetcher, Normalizer, Notifier, Pipeline, SeverityTable, Store,
};

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<AlertIntent>>>);

impl Recorder {
    fn magnitudes(&self) -> Vec<f64> {
        self.0.lock().unwrap().iter().map(|a| a.record.magnitude).collect()
    }
}

#[async_trait]
impl Notifier for Recorder {
    async fn send(&self, alert: &AlertIntent) -> anyhow::Result<()> {
        self.0.lock().unwrap().push(alert.clone());
        Ok(())
    }
    fn name(&self) -> &'static str {
        "recorder"
    }
}

fn settings(threshold: f64, max_event_age: Option<Duration>) -> AlertSettings {
    AlertSettings {
        threshold,
        max_event_age,
        table: SeverityTable::default(),
    }
}

async fn pipeline(
    dir: &tempfile::TempDir,
    alerts: AlertSettings,
) -> (Pipeline, Recorder) {
    let store = Store::open(dir.path().join("events.db"), Duration::from_secs(5))
        .await
        .unwrap();
    let fetcher = Arc::new(FixtureFetcher::from_fixture(include_str!(
        "fixtures/kandilli_live.json"
    )));
    let recorder = Recorder::default();
    let p = Pipeline::new(
        fetcher,
        Normalizer::default(),
        store,
        Arc::new(recorder.clone()),
        alerts,
    );
    (p, recorder)
}

#[tokio::test]
async fn threshold_gates_and_repeats_stay_silent() {
    let dir = tempfile::tempdir().unwrap();
    let (p, recorder) = pipeline(&dir, settings(4.0, None)).await;

    let first = p.run_cycle(|_| {}).await;
    let summary = first.summary().expect("first cycle succeeds").clone();
    assert_eq!(summary.fetched, 10);
    assert_eq!(summary.rejected, 1);
    assert_eq!(summary.inserted, 9);
    assert_eq!(summary.duplicates, 0);
    assert_eq!(summary.alerts, 3);
    assert_eq!(recorder.magnitudes(), vec![4.5, 5.8, 4.1]);

    let severities: Vec<String> = recorder
        .0
        .lock()
        .unwrap()
        .iter()
        .map(|a| a.severity.clone())
        .collect();
    assert_eq!(severities, vec!["Light", "Moderate", "Light"]);

    // Same feed again: everything is a duplicate, nothing new to announce.
    let second = p.run_cycle(|_| {}).await;
    let summary = second.summary().expect("second cycle succeeds");
    assert_eq!(summary.inserted, 0);
    assert_eq!(summary.duplicates, 9);
    assert_eq!(summary.alerts, 0);
    assert_eq!(recorder.magnitudes().len(), 3);

    assert_eq!(p.store().count().await.unwrap(), 9);
}

#[tokio::test]
async fn default_threshold_only_fires_for_the_big_one() {
    let dir = tempfile::tempdir().unwrap();
    let (p, recorder) = pipeline(&dir, settings(5.5, None)).await;
    p.run_cycle(|_| {}).await;
    assert_eq!(recorder.magnitudes(), vec![5.8]);
}

#[tokio::test]
async fn old_events_are_stored_but_not_announced() {
    let dir = tempfile::tempdir().unwrap();
    let (p, recorder) = pipeline(&dir, settings(4.0, Some(Duration::from_secs(3600)))).await;

    let outcome = p.run_cycle(|_| {}).await;
    let summary = outcome.summary().unwrap();
    assert_eq!(summary.inserted, 9);
    assert_eq!(summary.alerts, 0);
    assert!(recorder.magnitudes().is_empty());
}

#[tokio::test]
async fn phases_are_reported_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let (p, _recorder) = pipeline(&dir, settings(9.0, None)).await;
    let seen = Mutex::new(Vec::new());
    p.run_cycle(|phase| seen.lock().unwrap().push(phase)).await;

    use quake_watch::CyclePhase::*;
    assert_eq!(
        seen.into_inner().unwrap(),
        vec![Fetching, Normalizing, Persisting, Evaluating]
    );
}

/// Serves whatever body is set; `None` is a network failure.
#[derive(Default)]
struct SwitchFetcher(Mutex<Option<String>>);

impl SwitchFetcher {
    fn serve(&self, body: Option<String>) {
        *self.0.lock().unwrap() = body;
    }
}

#[async_trait]
impl Fetcher for SwitchFetcher {
    async fn fetch(&self) -> Result<RawPayload, FetchError> {
        let body = self.0.lock().unwrap().clone();
        match body {
            Some(body) => Ok(RawPayload {
                body,
                retrieved_at: Utc::now(),
            }),
            None => Err(FetchError::Network("connection refused".into())),
        }
    }

    fn name(&self) -> &'static str {
        "switch"
    }
}

fn feed(events: &[(DateTime<Utc>, f64, f64)]) -> String {
    let items: Vec<String> = events
        .iter()
        .map(|(t, lon, mag)| {
            format!(
                r#"{{"mag":{mag},"date_time":"{}","geojson":{{"coordinates":[{lon},38.0]}}}}"#,
                t.to_rfc3339_opts(SecondsFormat::Millis, true)
            )
        })
        .collect();
    format!(r#"{{"result":[{}]}}"#, items.join(","))
}

#[tokio::test]
async fn events_since_the_last_success_alert_after_an_outage() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path().join("events.db"), Duration::from_secs(5))
        .await
        .unwrap();
    let fetcher = Arc::new(SwitchFetcher::default());
    let recorder = Recorder::default();
    let p = Pipeline::new(
        fetcher.clone(),
        Normalizer::default(),
        store,
        Arc::new(recorder.clone()),
        settings(4.0, Some(Duration::from_secs(1))),
    );

    fetcher.serve(Some(feed(&[])));
    let last_success = p.run_cycle(|_| {}).await;
    assert!(last_success.is_success());

    fetcher.serve(None);
    assert!(p.run_cycle(|_| {}).await.failure().is_some());

    // Long enough that everything below is older than the age window.
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    let during_outage = last_success.started_at + ChronoDuration::milliseconds(100);
    let long_before = last_success.started_at - ChronoDuration::hours(2);
    fetcher.serve(Some(feed(&[(during_outage, 27.0, 5.0), (long_before, 28.0, 6.0)])));

    let outcome = p.run_cycle(|_| {}).await;
    let summary = outcome.summary().expect("catch-up cycle succeeds");
    assert_eq!(summary.inserted, 2);
    assert_eq!(summary.alerts, 1);
    assert_eq!(recorder.magnitudes(), vec![5.0]);
}

/// Hangs on the first send only; records every completed send.
struct StallsOnce {
    stalled: AtomicBool,
    inner: Recorder,
}

#[async_trait]
impl Notifier for StallsOnce {
    async fn send(&self, alert: &AlertIntent) -> anyhow::Result<()> {
        if !self.stalled.swap(true, Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        self.inner.send(alert).await
    }
    fn name(&self) -> &'static str {
        "stalls-once"
    }
}

#[tokio::test]
async fn alerts_cut_off_mid_delivery_go_out_next_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path().join("events.db"), Duration::from_secs(5))
        .await
        .unwrap();
    let recorder = Recorder::default();
    let p = Pipeline::new(
        Arc::new(FixtureFetcher::from_fixture(include_str!(
            "fixtures/kandilli_live.json"
        ))),
        Normalizer::default(),
        store,
        Arc::new(StallsOnce {
            stalled: AtomicBool::new(false),
            inner: recorder.clone(),
        }),
        settings(4.0, None),
    );

    let cut = tokio::time::timeout(Duration::from_millis(500), p.run_cycle(|_| {})).await;
    assert!(cut.is_err(), "cycle should still be stuck in delivery");
    assert_eq!(p.store().count().await.unwrap(), 9);
    assert_eq!(p.unsent_alerts().len(), 3);
    assert!(recorder.magnitudes().is_empty());

    // Nothing is new any more, but the held alerts are delivered.
    let outcome = p.run_cycle(|_| {}).await;
    let summary = outcome.summary().expect("second cycle succeeds");
    assert_eq!(summary.inserted, 0);
    assert_eq!(summary.alerts, 0);
    assert_eq!(recorder.magnitudes(), vec![4.5, 5.8, 4.1]);
    assert!(p.unsent_alerts().is_empty());
}
