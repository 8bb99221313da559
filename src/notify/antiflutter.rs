// src/notify/antiflutter.rs
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;

/// Per-severity cooldown gate for notification channels.
/// - First alert of a severity always allowed.
/// - Inside the cooldown, further alerts of that same severity are suppressed.
/// - State is updated explicitly via `record_alert` after a successful send.
#[derive(Debug, Clone, Default)]
pub struct AntiFlutter {
    cooldown: ChronoDuration,
    last_alert: HashMap<String, DateTime<Utc>>,
}

impl AntiFlutter {
    /// `cooldown_secs` < 0 is treated as 0 (no cooldown).
    pub fn new(cooldown_secs: i64) -> Self {
        Self {
            cooldown: ChronoDuration::seconds(cooldown_secs.max(0)),
            last_alert: HashMap::new(),
        }
    }

    /// Check if we may alert at `now` for `severity`. Does NOT mutate state.
    pub fn should_alert(&self, severity: &str, now: DateTime<Utc>) -> bool {
        match self.last_alert.get(severity) {
            None => true,
            Some(ts) => now.signed_duration_since(*ts) >= self.cooldown,
        }
    }

    pub fn record_alert(&mut self, severity: &str, now: DateTime<Utc>) {
        self.last_alert.insert(severity.to_string(), now);
    }
}
