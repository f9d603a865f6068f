use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, info_span, warn, Instrument};
use tracing_subscriber::EnvFilter;

use inkgate::config::InkgateConfig;
use inkgate::error::InkgateError;
use inkgate::http::{AppState, HttpServer};
use inkgate::ratelimit::{CounterStore, RateLimitRegistry};
use inkgate::store::{MemoryStore, RedisStore};

/// How often the in-memory store drops expired buckets.
const PURGE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Shared fixed-window rate limiter for the writing platform API.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, env = "INKGATE_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP listen address, overrides the configuration
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Redis URL, overrides the configuration
    #[arg(long)]
    redis_url: Option<String>,

    /// Keep counters in this process instead of Redis (single instance only)
    #[arg(long)]
    memory_store: bool,

    /// Log output format
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!("Starting Inkgate Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = InkgateConfig::load(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        config.server.http_addr = listen;
    }
    if let Some(url) = cli.redis_url {
        config.store.url = url;
    }
    info!(
        http_addr = %config.server.http_addr,
        instance_id = %config.server.instance_id,
        policies = config.policies.len(),
        "Configuration loaded"
    );

    // Invalid policies abort startup; nothing below this point does
    let policies = config.build_policies()?;

    let store: Arc<dyn CounterStore> = if cli.memory_store {
        warn!("Using in-memory counter store; limits are not shared between processes");
        let store = Arc::new(MemoryStore::new());
        spawn_purge(store.clone());
        store
    } else {
        let store = RedisStore::open(&config.store.url, config.store.redis_config())
            .map_err(|e| InkgateError::Config(format!("invalid store url: {}", e)))?;
        Arc::new(store)
    };

    match store.ping().await {
        Ok(()) => info!("Counter store reachable"),
        Err(e) => warn!(error = %e, "Counter store unreachable at startup, continuing"),
    }

    let registry = RateLimitRegistry::build(policies, store.clone(), config.store.timeout())?;
    info!(policies = registry.len(), "Rate limiters initialized");

    let state = AppState::new(Arc::new(registry), store.clone(), config.store.timeout());
    let server = HttpServer::new(config.server.http_addr, state);

    server
        .serve_with_shutdown(shutdown_signal())
        .instrument(info_span!("server", instance_id = %config.server.instance_id))
        .await?;

    info!("Inkgate Rate Limiting Service stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("inkgate=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn spawn_purge(store: Arc<MemoryStore>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        loop {
            interval.tick().await;
            store.purge_expired();
        }
    });
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
