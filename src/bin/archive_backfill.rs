//! Backfill one day (or a range of days) from the provider archive.
//!
//! Usage: `archive_backfill YYYY-MM-DD [YYYY-MM-DD]`
//!
//! Records go through the same normalizer and store as the live feed, so
//! re-running a day is harmless. No alerts are raised.

use anyhow::{anyhow, bail, Context, Result};
use chrono::{Duration as ChronoDuration, NaiveDate};

use quake_watch::config::AppConfig;
use quake_watch::{HttpFetcher, Normalizer, Store};

fn parse_day(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").with_context(|| format!("invalid date `{s}`"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt().with_target(false).init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let first = args
        .first()
        .ok_or_else(|| anyhow!("usage: archive_backfill YYYY-MM-DD [YYYY-MM-DD]"))?;
    let from = parse_day(first)?;
    let to = match args.get(1) {
        Some(s) => parse_day(s)?,
        None => from,
    };
    if to < from {
        bail!("end date {to} is before start date {from}");
    }

    let cfg = AppConfig::load_default()?;
    let store = Store::open(&cfg.store.path, cfg.store.op_timeout()).await?;
    let fetcher = HttpFetcher::new(&cfg.feed)?;
    let normalizer = Normalizer::new(cfg.feed.source_offset());

    let mut day = from;
    while day <= to {
        let raw = fetcher
            .fetch_archive(day)
            .await
            .with_context(|| format!("fetching archive for {day}"))?;
        let normalized = normalizer.normalize(&raw)?;
        let report = store.upsert_batch(&normalized.records).await?;
        println!(
            "{day}: fetched={} rejected={} inserted={} duplicates={}",
            normalized.records.len() + normalized.rejections.len(),
            normalized.rejections.len(),
            report.inserted,
            report.duplicates
        );
        day += ChronoDuration::days(1);
    }

    println!("total stored: {}", store.count().await?);
    store.close().await;
    Ok(())
}
