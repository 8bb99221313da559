// src/ingest/fetcher.rs
use anyhow::Context;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use metrics::histogram;
use std::time::{Duration, Instant};

use crate::config::FeedConfig;
use crate::error::FetchError;
use crate::ingest::types::RawPayload;

/// One snapshot of the provider feed per call. No retries in here; retry
/// policy belongs to the scheduler.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self) -> Result<RawPayload, FetchError>;
    fn name(&self) -> &'static str;
}

/// Live feed over HTTP GET.
pub struct HttpFetcher {
    endpoint: String,
    archive_endpoint: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(cfg: &FeedConfig) -> anyhow::Result<Self> {
        Self::build(&cfg.endpoint, &cfg.archive_endpoint, cfg.timeout(), &cfg.user_agent)
    }

    /// Convenience for tools/tests pointing at an arbitrary URL.
    pub fn from_url(url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let defaults = FeedConfig::default();
        Self::build(url, &defaults.archive_endpoint, timeout, &defaults.user_agent)
    }

    fn build(
        endpoint: &str,
        archive_endpoint: &str,
        timeout: Duration,
        user_agent: &str,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent.to_string())
            .build()
            .context("building feed http client")?;
        Ok(Self {
            endpoint: endpoint.to_string(),
            archive_endpoint: archive_endpoint.to_string(),
            client,
            timeout,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Provider archive for one day (`?date=YYYY-MM-DD`). Same payload shape as the live feed.
    pub async fn fetch_archive(&self, date: NaiveDate) -> Result<RawPayload, FetchError> {
        let req = self
            .client
            .get(&self.archive_endpoint)
            .query(&[("date", date.format("%Y-%m-%d").to_string())]);
        self.execute(req).await
    }

    async fn execute(&self, req: reqwest::RequestBuilder) -> Result<RawPayload, FetchError> {
        let t0 = Instant::now();
        let resp = req.send().await.map_err(|e| self.classify(e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        let body = resp.text().await.map_err(|e| self.classify(e))?;
        let retrieved_at = Utc::now();

        histogram!("quake_fetch_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
        tracing::debug!(target: "ingest", bytes = body.len(), "feed fetched");

        Ok(RawPayload { body, retrieved_at })
    }

    fn classify(&self, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout(self.timeout)
        } else {
            FetchError::Network(err.to_string())
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self) -> Result<RawPayload, FetchError> {
        let req = self.client.get(&self.endpoint);
        self.execute(req).await
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Serves a fixed body on every call (offline runs, tests).
pub struct FixtureFetcher {
    body: String,
}

impl FixtureFetcher {
    pub fn from_fixture(body: &str) -> Self {
        Self {
            body: body.to_string(),
        }
    }
}

#[async_trait]
impl Fetcher for FixtureFetcher {
    async fn fetch(&self) -> Result<RawPayload, FetchError> {
        Ok(RawPayload {
            body: self.body.clone(),
            retrieved_at: Utc::now(),
        })
    }

    fn name(&self) -> &'static str {
        "fixture"
    }
}
