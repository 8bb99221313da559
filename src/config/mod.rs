// src/config/mod.rs
//! Application settings: TOML file layered with env overrides.
//!
//! Lookup order:
//! 1) `$QUAKE_CONFIG_PATH`
//! 2) `config/quakewatch.toml`
//! 3) built-in defaults
//!
//! The core never reads these globally; values are handed to constructors.

use anyhow::{anyhow, Context, Result};
use chrono::{FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::alerts::{default_buckets, SeverityBucket};

pub const ENV_CONFIG_PATH: &str = "QUAKE_CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "config/quakewatch.toml";

pub const ENV_FEED_URL: &str = "QUAKE_FEED_URL";
pub const ENV_POLL_INTERVAL_SECS: &str = "QUAKE_POLL_INTERVAL_SECS";
pub const ENV_ALERT_THRESHOLD: &str = "QUAKE_ALERT_THRESHOLD";
pub const ENV_DB_PATH: &str = "QUAKE_DB_PATH";
pub const ENV_API_BIND: &str = "QUAKE_API_BIND";

pub const DEFAULT_LIVE_ENDPOINT: &str = "https://api.orhanaydogdu.com.tr/deprem/kandilli/live";
pub const DEFAULT_ARCHIVE_ENDPOINT: &str =
    "https://api.orhanaydogdu.com.tr/deprem/kandilli/archive";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub feed: FeedConfig,
    pub scheduler: SchedulerConfig,
    pub alerts: AlertConfig,
    pub store: StoreConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub endpoint: String,
    pub archive_endpoint: String,
    pub timeout_secs: u64,
    pub user_agent: String,
    /// Offset applied to provider timestamps that carry none (Kandilli: UTC+3).
    pub source_utc_offset_minutes: i32,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_LIVE_ENDPOINT.to_string(),
            archive_endpoint: DEFAULT_ARCHIVE_ENDPOINT.to_string(),
            timeout_secs: 10,
            user_agent: concat!("quake-watch/", env!("CARGO_PKG_VERSION")).to_string(),
            source_utc_offset_minutes: 180,
        }
    }
}

impl FeedConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn source_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.source_utc_offset_minutes * 60)
            .unwrap_or_else(|| Utc.fix())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub interval_secs: u64,
    /// A cycle running longer than this is abandoned and recorded as failed.
    pub cycle_hard_cap_secs: u64,
    /// 0 disables backoff; otherwise the cap on ticks skipped after failures.
    pub backoff_max_skipped_ticks: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            cycle_hard_cap_secs: 120,
            backoff_max_skipped_ticks: 0,
        }
    }
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn cycle_hard_cap(&self) -> Duration {
        Duration::from_secs(self.cycle_hard_cap_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub threshold: f64,
    /// Newly stored events older than this (relative to cycle start) do not alert.
    pub max_event_age_secs: u64,
    /// Per-severity debounce for notification channels; 0 = off.
    pub cooldown_secs: i64,
    pub buckets: Vec<SeverityBucket>,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            threshold: 5.5,
            max_event_age_secs: 3600,
            cooldown_secs: 0,
            buckets: default_buckets(),
        }
    }
}

impl AlertConfig {
    pub fn max_event_age(&self) -> Duration {
        Duration::from_secs(self.max_event_age_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub op_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("quakewatch.db"),
            op_timeout_secs: 10,
        }
    }
}

impl StoreConfig {
    pub fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.op_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
        }
    }
}

impl AppConfig {
    /// Parse an explicit TOML file (no env overrides).
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        let cfg: AppConfig = toml::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(cfg.sanitized())
    }

    /// Env path, then the default file, then built-ins; env overrides on top.
    pub fn load_default() -> Result<Self> {
        let mut cfg = if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if !pb.exists() {
                return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
            }
            Self::load_from(&pb)?
        } else {
            let default_p = PathBuf::from(DEFAULT_CONFIG_PATH);
            if default_p.exists() {
                Self::load_from(&default_p)?
            } else {
                AppConfig::default()
            }
        };
        cfg.apply_env_overrides();
        Ok(cfg.sanitized())
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(url) = env_string(ENV_FEED_URL) {
            self.feed.endpoint = url;
        }
        if let Some(secs) = env_parse::<u64>(ENV_POLL_INTERVAL_SECS) {
            self.scheduler.interval_secs = secs;
        }
        if let Some(th) = env_parse::<f64>(ENV_ALERT_THRESHOLD).filter(|v| v.is_finite()) {
            self.alerts.threshold = th;
        }
        if let Some(p) = env_string(ENV_DB_PATH) {
            self.store.path = PathBuf::from(p);
        }
        if let Some(bind) = env_parse::<SocketAddr>(ENV_API_BIND) {
            self.api.bind = bind;
        }
    }

    fn sanitized(mut self) -> Self {
        self.scheduler.interval_secs = self.scheduler.interval_secs.max(1);
        self.scheduler.cycle_hard_cap_secs = self.scheduler.cycle_hard_cap_secs.max(1);
        self.feed.timeout_secs = self.feed.timeout_secs.max(1);
        self.store.op_timeout_secs = self.store.op_timeout_secs.max(1);
        if !self.alerts.threshold.is_finite() {
            self.alerts.threshold = AlertConfig::default().threshold;
        }
        self
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = env_string(name)?;
    match raw.parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "ignoring unparsable env override");
            None
        }
    }
}
