// src/notify/log.rs
use async_trait::async_trait;

use super::{headline, Notifier};
use crate::alerts::AlertIntent;

/// Writes alerts to the `alert` tracing target. Always on.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, alert: &AlertIntent) -> anyhow::Result<()> {
        let r = &alert.record;
        tracing::warn!(
            target: "alert",
            identity_key = %r.identity_key,
            magnitude = r.magnitude,
            severity = %alert.severity,
            occurred_at = %r.occurred_at.to_rfc3339(),
            depth_km = ?r.depth_km,
            "{}",
            headline(alert)
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}
