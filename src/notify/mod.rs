// src/notify/mod.rs
//! Delivery of [`AlertIntent`]s to the outside world.
//!
//! Channels implement [`Notifier`]; [`NotifierMux`] fans one intent out to
//! every configured channel. A failing channel is logged and never blocks
//! the others or the cycle that produced the alert.

pub mod antiflutter;
pub mod discord;
pub mod log;
pub mod slack;

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Mutex;

use crate::alerts::AlertIntent;
use self::antiflutter::AntiFlutter;
use self::discord::DiscordNotifier;
use self::log::LogNotifier;
use self::slack::SlackNotifier;

pub const ENV_DISCORD_WEBHOOK_URL: &str = "DISCORD_WEBHOOK_URL";
pub const ENV_SLACK_WEBHOOK_URL: &str = "SLACK_WEBHOOK_URL";

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, alert: &AlertIntent) -> anyhow::Result<()>;
    fn name(&self) -> &'static str;
}

/// One-line summary shared by all channels.
pub fn headline(alert: &AlertIntent) -> String {
    let r = &alert.record;
    let place = if r.location_label.is_empty() {
        format!("{:.3}, {:.3}", r.latitude, r.longitude)
    } else {
        r.location_label.clone()
    };
    format!("M{:.1} {} ({})", r.magnitude, place, alert.severity)
}

/// Details block (time, depth, coordinates).
pub fn details(alert: &AlertIntent) -> String {
    let r = &alert.record;
    let depth = r
        .depth_km
        .map(|d| format!("{d:.1} km"))
        .unwrap_or_else(|| "unknown".to_string());
    let mut out = format!(
        "Time (UTC): {}\nDepth: {}\nLat/Lon: {:.4}, {:.4}",
        r.occurred_at.format("%Y-%m-%d %H:%M:%S"),
        depth,
        r.latitude,
        r.longitude
    );
    if let Some(city) = &r.closest_city {
        match city.distance_m {
            Some(m) => out.push_str(&format!("\nClosest city: {} ({:.0} km)", city.name, m / 1_000.0)),
            None => out.push_str(&format!("\nClosest city: {}", city.name)),
        }
    }
    out
}

pub struct NotifierMux {
    channels: Vec<Box<dyn Notifier>>,
    flutter: Mutex<AntiFlutter>,
}

impl NotifierMux {
    /// Empty mux; `cooldown_secs <= 0` disables per-severity debounce.
    pub fn new(cooldown_secs: i64) -> Self {
        Self {
            channels: Vec::new(),
            flutter: Mutex::new(AntiFlutter::new(cooldown_secs)),
        }
    }

    pub fn with_channel(mut self, channel: Box<dyn Notifier>) -> Self {
        self.channels.push(channel);
        self
    }

    /// Log channel always; Discord/Slack when their webhook env var is set.
    pub fn from_env(cooldown_secs: i64) -> Self {
        let mut mux = Self::new(cooldown_secs).with_channel(Box::new(LogNotifier));
        if let Some(url) = env_url(ENV_DISCORD_WEBHOOK_URL) {
            mux = mux.with_channel(Box::new(DiscordNotifier::new(url)));
        }
        if let Some(url) = env_url(ENV_SLACK_WEBHOOK_URL) {
            mux = mux.with_channel(Box::new(SlackNotifier::new(url)));
        }
        tracing::info!(target: "notify", channels = ?mux.channel_names(), "notifier channels ready");
        mux
    }

    pub fn channel_names(&self) -> Vec<&'static str> {
        self.channels.iter().map(|c| c.name()).collect()
    }

    /// Returns the number of channels that accepted the alert. Zero when
    /// the alert was debounced.
    pub async fn notify(&self, alert: &AlertIntent) -> usize {
        let now = Utc::now();
        {
            let af = self.flutter.lock().unwrap_or_else(|p| p.into_inner());
            if !af.should_alert(&alert.severity, now) {
                tracing::debug!(target: "notify", severity = %alert.severity, "alert suppressed by cooldown");
                metrics::counter!("quake_alerts_suppressed_total").increment(1);
                return 0;
            }
        }

        let mut delivered = 0usize;
        for ch in &self.channels {
            match ch.send(alert).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(
                        target: "notify",
                        channel = ch.name(),
                        identity_key = %alert.record.identity_key,
                        error = %e,
                        "notification failed"
                    );
                    metrics::counter!("quake_notify_errors_total", "channel" => ch.name())
                        .increment(1);
                }
            }
        }

        if delivered > 0 {
            let mut af = self.flutter.lock().unwrap_or_else(|p| p.into_inner());
            af.record_alert(&alert.severity, now);
        }
        delivered
    }
}

#[async_trait]
impl Notifier for NotifierMux {
    async fn send(&self, alert: &AlertIntent) -> anyhow::Result<()> {
        self.notify(alert).await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "mux"
    }
}

fn env_url(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertEvaluator;
    use crate::model::EventRecord;
    use anyhow::anyhow;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl Notifier for Counting {
        async fn send(&self, _alert: &AlertIntent) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn name(&self) -> &'static str {
            "counting"
        }
    }

    struct Broken;

    #[async_trait]
    impl Notifier for Broken {
        async fn send(&self, _alert: &AlertIntent) -> anyhow::Result<()> {
            Err(anyhow!("webhook down"))
        }
        fn name(&self) -> &'static str {
            "broken"
        }
    }

    fn intent(mag: f64) -> AlertIntent {
        let t = Utc.with_ymd_and_hms(2024, 2, 6, 1, 17, 0).unwrap();
        let rec = EventRecord::new(t, 37.2, 37.0, mag, t)
            .unwrap()
            .with_label("KAHRAMANMARAS");
        AlertEvaluator::default().evaluate(&[rec], 0.0).remove(0)
    }

    #[test]
    fn headline_uses_label_or_coordinates() {
        assert_eq!(headline(&intent(7.8)), "M7.8 KAHRAMANMARAS (Major)");
        let mut a = intent(4.1);
        a.record.location_label.clear();
        assert_eq!(headline(&a), "M4.1 37.200, 37.000 (Light)");
    }

    #[test]
    fn details_mention_the_closest_city_when_known() {
        let mut a = intent(5.2);
        assert!(!details(&a).contains("Closest city"));
        a.record.closest_city = Some(crate::model::ClosestCity {
            name: "Kahramanmaraş".into(),
            city_code: Some(46),
            distance_m: Some(23_600.0),
            population: None,
        });
        assert!(details(&a).ends_with("Closest city: Kahramanmaraş (24 km)"));
    }

    #[tokio::test]
    async fn failing_channel_does_not_block_others() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mux = NotifierMux::new(0)
            .with_channel(Box::new(Broken))
            .with_channel(Box::new(Counting(hits.clone())));
        assert_eq!(mux.notify(&intent(6.0)).await, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cooldown_is_per_severity() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mux = NotifierMux::new(600).with_channel(Box::new(Counting(hits.clone())));
        assert_eq!(mux.notify(&intent(6.1)).await, 1);
        assert_eq!(mux.notify(&intent(6.3)).await, 0);
        assert_eq!(mux.notify(&intent(7.2)).await, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn zero_cooldown_delivers_everything() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mux = NotifierMux::new(0).with_channel(Box::new(Counting(hits.clone())));
        for _ in 0..3 {
            mux.notify(&intent(6.1)).await;
        }
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }
}
