//! Convoy server

use anyhow::Context;
use clap::{Parser, ValueEnum};
use convoy_config::{ConfigHandle, load_server_config};
use convoy_db::{PgBuildRepo, create_pool, run_migrations};
use convoy_executor::{CiBuilderJobClient, ImageResolver, KubeClusterApi, RegistryDigestLookup};
use convoy_scheduler::{BuildService, CiBuildService, Instrumented, WorkQueue};
use convoy_server::{AesEnvelopeCodec, resolver_from_config, run_cron_ticker, shutdown_signal};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal as unix_signal};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "convoy-server")]
#[command(about = "Convoy CI/CD control core", long_about = None)]
struct Cli {
    /// Server configuration file
    #[arg(long, env = "CONVOY_CONFIG", default_value = "convoy.kdl")]
    config: PathBuf,

    /// PostgreSQL connection URL
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Maximum database connections
    #[arg(long, env = "CONVOY_DB_MAX_CONNECTIONS", default_value_t = 10)]
    max_connections: u32,

    /// Log output format
    #[arg(long, env = "CONVOY_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = load_server_config(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    let secret_key = config
        .secret_key
        .clone()
        .context("secret-key is not configured")?;
    let config = ConfigHandle::new(config);
    let snapshot = config.snapshot();

    info!("Connecting to database...");
    let pool = create_pool(&cli.database_url, cli.max_connections).await?;
    run_migrations(&pool).await?;
    info!("Database connected");

    let cluster = KubeClusterApi::new(snapshot.jobs.namespace.clone()).await?;
    let codec = AesEnvelopeCodec::from_hex(&secret_key)?;
    let images = ImageResolver::new(
        Arc::new(RegistryDigestLookup::new()),
        Duration::from_secs(snapshot.jobs.digest_cache_ttl_secs),
    );
    let ci_builder = CiBuilderJobClient::new(Arc::new(cluster), config.clone(), Arc::new(codec), images);

    let queue = WorkQueue::start(snapshot.work_queue);
    let service: Arc<dyn BuildService> = Arc::new(CiBuildService::new(
        Arc::new(Instrumented::new(PgBuildRepo::new(pool), "db")),
        Arc::new(Instrumented::new(ci_builder, "executor")),
        resolver_from_config(&snapshot.git_providers),
        config.clone(),
        queue.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ticker = tokio::spawn(run_cron_ticker(service.clone(), shutdown_rx));
    let reloader = tokio::spawn(reload_on_hangup(config.clone(), cli.config.clone()));

    let shutdown = shutdown_signal()?;
    info!(namespace = %snapshot.jobs.namespace, "Convoy server started");
    let received = shutdown.await;
    info!(signal = received, "Shutdown signal received");

    let _ = shutdown_tx.send(true);
    reloader.abort();
    if let Err(e) = ticker.await {
        error!(error = %e, "Cron ticker ended abnormally");
    }
    queue.shutdown().await;

    info!("Convoy server stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }
}

/// Swap in a fresh configuration snapshot on every SIGHUP.
async fn reload_on_hangup(config: ConfigHandle, path: PathBuf) -> anyhow::Result<()> {
    let mut hangup = unix_signal(SignalKind::hangup())?;
    while hangup.recv().await.is_some() {
        match config.reload(&path) {
            Ok(()) => info!(path = %path.display(), "Reloaded configuration"),
            Err(e) => error!(path = %path.display(), error = %e, "Failed to reload configuration, keeping the current one"),
        }
    }
    Ok(())
}
