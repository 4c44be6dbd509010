//! adserve — ad decisioning server.
//!
//! Main entry point: loads configuration, wires the engine and its
//! collaborators, spawns background tasks and serves HTTP.

use adserve_analytics::AnalyticsLogger;
use adserve_api::{ApiServer, AppState};
use adserve_bidder::ProgrammaticBidder;
use adserve_core::config::AppConfig;
use adserve_counters::CounterStore;
use adserve_ctr::CtrPredictor;
use adserve_delivery::RateLimiter;
use adserve_engine::DecisionEngine;
use adserve_store::{AdStore, CatalogFile};
use adserve_targeting::TargetingResolver;
use clap::Parser;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "adserve")]
#[command(about = "Ad decisioning server")]
#[command(version)]
struct Cli {
    /// Optional config file (TOML); environment variables override it.
    #[arg(long, env = "ADSERVE_CONFIG")]
    config: Option<String>,

    /// HTTP port (overrides config)
    #[arg(long, env = "ADSERVE__SERVER__PORT")]
    port: Option<u16>,

    /// Catalog bootstrap file (overrides config)
    #[arg(long, env = "ADSERVE__CATALOG__PATH")]
    catalog: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "adserve=info,tower_http=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("adserve starting up");

    let mut config = AppConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(catalog) = cli.catalog {
        config.catalog.path = catalog;
    }

    info!(
        port = config.server.port,
        catalog = %config.catalog.path,
        reload_interval_secs = config.catalog.reload_interval_secs,
        "Configuration loaded"
    );

    // Counter store with retry.
    let counters = connect_with_retry("counter store", || {
        CounterStore::connect(&config.counter_store.url)
    })
    .await?;

    // Catalog bootstrap.
    let store = Arc::new(AdStore::new());
    match CatalogFile::load(&config.catalog.path) {
        Ok(file) => file.apply(&store)?,
        Err(e) => warn!(error = %e, "Catalog bootstrap failed; serving with an empty catalog"),
    }

    // Analytics sink; an unreachable sink downgrades to a dropping logger.
    let analytics = match AnalyticsLogger::new(&config.analytics, node_id()).await {
        Ok(logger) => Arc::new(logger),
        Err(e) => {
            warn!(error = %e, "Analytics sink unavailable; events will be dropped");
            Arc::new(AnalyticsLogger::disabled(node_id()))
        }
    };

    let resolver = Arc::new(TargetingResolver::new(&config.targeting.geoip_db)?);
    let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
    let ctr = Arc::new(CtrPredictor::new(&config.ctr));
    let engine = Arc::new(DecisionEngine::new(
        store.clone(),
        counters.clone(),
        rate_limiter,
        ProgrammaticBidder::new(&config.bidding),
        ctr.clone(),
        &config.engine,
        &config.pacing,
    ));

    // Background tasks: catalog reload and CTR cache cleanup.
    if config.catalog.reload_interval_secs > 0 {
        let store = store.clone();
        let path = config.catalog.path.clone();
        let every = Duration::from_secs(config.catalog.reload_interval_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await; // the bootstrap already loaded once
            loop {
                interval.tick().await;
                match CatalogFile::load(&path) {
                    Ok(file) => {
                        if let Err(e) = file.apply(&store) {
                            error!(error = %e, "Catalog reload rejected; keeping prior snapshot");
                        }
                    }
                    Err(e) => error!(error = %e, "Catalog reload failed"),
                }
            }
        });
    }
    CtrPredictor::spawn_cache_cleanup(ctr, config.ctr.cache_ttl());

    let state = AppState {
        engine,
        store,
        counters,
        resolver,
        analytics,
        token: config.token.clone(),
        public_url: config.server.public_url.clone(),
        start_time: Instant::now(),
    };

    let server = ApiServer::new(config.server.clone(), state);
    if let Err(e) = server.start_metrics(&config.metrics) {
        error!(error = %e, "Failed to start metrics exporter");
    }

    info!("adserve is ready to serve traffic");
    server.start().await
}

fn node_id() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "adserve-0".to_string())
}

/// Connect to an external service with backoff (3 attempts).
async fn connect_with_retry<T, F, Fut>(service_name: &str, connect_fn: F) -> anyhow::Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<T>>,
{
    let delays = [
        Duration::from_secs(0),
        Duration::from_secs(2),
        Duration::from_secs(4),
    ];
    let mut last_err = None;
    for (attempt, delay) in delays.iter().enumerate() {
        if attempt > 0 {
            warn!(
                service = service_name,
                attempt,
                "Retrying connection after {}s",
                delay.as_secs()
            );
            tokio::time::sleep(*delay).await;
        }
        match connect_fn().await {
            Ok(conn) => return Ok(conn),
            Err(e) => {
                warn!(service = service_name, error = %e, "Connection attempt failed");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.expect("at least one connection attempt ran"))
}
