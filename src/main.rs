//! quake-watch: binary entrypoint.
//! Polls the earthquake feed on a schedule, persists new events, raises
//! alerts and serves the read API until Ctrl-C.

use anyhow::Context;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use quake_watch::api::{create_router, AppState};
use quake_watch::config::AppConfig;
use quake_watch::ingest::AlertSettings;
use quake_watch::metrics::Metrics;
use quake_watch::{HttpFetcher, Normalizer, NotifierMux, Pipeline, Scheduler, Store};

const DEFAULT_LOG_FILTER: &str =
    "quake_watch=info,ingest=info,scheduler=info,store=info,notify=info,alert=info,api=info,warn";

/// `RUST_LOG` wins over the default filter. `LOG_FORMAT=json` switches to
/// JSON lines.
fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact())
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = AppConfig::load_default().context("loading configuration")?;
    tracing::info!(
        endpoint = %cfg.feed.endpoint,
        interval_secs = cfg.scheduler.interval_secs,
        threshold = cfg.alerts.threshold,
        db = %cfg.store.path.display(),
        "configuration loaded"
    );

    let metrics = Metrics::init()?;

    let store = Store::open(&cfg.store.path, cfg.store.op_timeout())
        .await
        .context("opening event store")?;

    let fetcher = Arc::new(HttpFetcher::new(&cfg.feed)?);
    let notifier = Arc::new(NotifierMux::from_env(cfg.alerts.cooldown_secs));
    let pipeline = Arc::new(Pipeline::new(
        fetcher,
        Normalizer::new(cfg.feed.source_offset()),
        store.clone(),
        notifier,
        AlertSettings::from(&cfg.alerts),
    ));

    let scheduler = Scheduler::new(pipeline, cfg.scheduler.clone());
    scheduler.start(cfg.scheduler.interval()).await;

    let state = AppState {
        store: store.clone(),
        status: scheduler.status(),
    };
    let router = create_router(state).merge(metrics.router());

    let listener = tokio::net::TcpListener::bind(cfg.api.bind)
        .await
        .with_context(|| format!("binding {}", cfg.api.bind))?;
    tracing::info!(bind = %cfg.api.bind, "read api listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await
        .context("serving read api")?;

    scheduler.stop().await;
    store.close().await;
    Ok(())
}
