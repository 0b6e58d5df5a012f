use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use relayx_common::ApiType;
use relayx_core::{
    ChannelScheduler, Config, ConfigView, FailedKeyCache, ProxyCore, TraceAffinityMap,
    UpstreamClient, UpstreamClientConfig, UrlRanker,
};
use relayx_metrics::MetricsEngine;
use relayx_storage::{RecordStore, RecordStoreConfig};

mod cli;

const AFFINITY_TTL: Duration = Duration::from_secs(30 * 60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let settings = cli::CliArgs::parse().into_settings();

    let config = match Config::from_path(&settings.config_path) {
        Ok(config) => config,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %settings.config_path, "config file missing, starting empty");
            Config::default()
        }
        Err(err) => return Err(err).context("load channel config"),
    };
    let config = Arc::new(ConfigView::new(config));

    let store = RecordStore::open(RecordStoreConfig {
        db_path: settings.db_path.clone(),
        retention_days: settings.retention_days,
    })
    .await
    .context("open metrics store")?;

    // One engine per apiType; each replays its own 24h of history. The
    // sweep handles must outlive the server, so they live in main.
    let mut engines: HashMap<ApiType, Arc<MetricsEngine>> = HashMap::new();
    let mut sweep_guards = Vec::new();
    for api_type in ApiType::ALL {
        let engine = MetricsEngine::with_store(
            api_type,
            settings.window_size,
            settings.failure_threshold,
            store.clone(),
        )
        .await;
        sweep_guards.push(engine.spawn_sweeps());
        engines.insert(api_type, engine);
    }

    let failed_keys = Arc::new(FailedKeyCache::new(
        Duration::from_secs(settings.key_cooldown_secs),
        settings.key_max_failures,
    ));
    let affinity = Arc::new(TraceAffinityMap::new(AFFINITY_TTL));
    let url_ranker = Arc::new(UrlRanker::new());

    // Minute sweeps for the process-wide caches.
    {
        let failed_keys = failed_keys.clone();
        let affinity = affinity.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                failed_keys.sweep();
                affinity.sweep();
            }
        });
    }

    let scheduler = Arc::new(ChannelScheduler::new(
        config.clone(),
        engines,
        affinity,
        url_ranker,
    ));

    let upstream = UpstreamClient::new(UpstreamClientConfig {
        proxy: settings.outbound_proxy.clone(),
        connect_timeout: Duration::from_millis(settings.connect_timeout_ms),
        request_timeout: Duration::from_millis(settings.request_timeout_ms),
        stream_idle_timeout: Duration::from_secs(settings.stream_idle_timeout_secs),
    });

    let core = Arc::new(ProxyCore {
        config,
        scheduler,
        failed_keys,
        upstream,
    });

    let bind = format!("{}:{}", settings.host, settings.port);
    let settings = settings.into_handle();
    let app = relayx_router::proxy_router(core, settings);

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    info!(%bind, "listening");

    let result = axum_serve_with_shutdown(listener, app, store).await;
    drop(sweep_guards);
    result
}

async fn axum_serve_with_shutdown(
    listener: tokio::net::TcpListener,
    app: axum::Router,
    store: Arc<RecordStore>,
) -> Result<()> {
    let shutdown_store = store.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .context("serve")?;

    // Flush the residual metrics buffer before the process exits.
    shutdown_store.close().await;
    Ok(())
}
