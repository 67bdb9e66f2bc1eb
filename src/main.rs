mod alerts;
mod collector;
mod config;
mod epoch;
mod health;
mod metrics;
mod notify;
mod probe;
mod reducer;
mod shutdown;
mod store;

use alerts::AlertEngine;
use clap::Parser;
use config::{AlertConfig, MonitorConfig};
use eyre::{eyre, Result, WrapErr};
use fs2::FileExt;
use metrics::OracleMetrics;
use notify::AlertSink;
use shutdown::ShutdownFlag;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use store::EpochStore;
use tokio::task::JoinHandle;

/// A failed tick is retried after this, instead of waiting out the full
/// monitoring interval.
const TICK_BACKOFF: Duration = Duration::from_secs(10);

/// How long the supervisor waits for workers after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(
    name = "tnom",
    version,
    about = "Nibiru oracle monitor: signing, wallet balance, endpoint health"
)]
struct Args {
    /// Directory holding the config files and the chain database.
    #[arg(long, default_value = ".")]
    working_dir: PathBuf,

    /// Path to the monitoring config. Defaults to <working-dir>/config.yml.
    #[arg(long)]
    config_path: Option<PathBuf>,

    /// Path to the alerting config. Defaults to <working-dir>/alert.yml.
    #[arg(long)]
    alert_path: Option<PathBuf>,

    /// Override the metrics listen host from alert.yml.
    #[arg(long)]
    prometheus_host: Option<String>,

    /// Override the metrics listen port from alert.yml.
    #[arg(long)]
    prometheus_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config_path = args
        .config_path
        .unwrap_or_else(|| args.working_dir.join("config.yml"));
    let alert_path = args
        .alert_path
        .unwrap_or_else(|| args.working_dir.join("alert.yml"));

    let config = MonitorConfig::load(&config_path)?;
    let mut alert_config = AlertConfig::load(&alert_path)?;
    if let Some(host) = args.prometheus_host {
        alert_config.prometheus_host = host;
    }
    if let Some(port) = args.prometheus_port {
        alert_config.prometheus_port = port;
    }

    let store = EpochStore::ensure(&args.working_dir).wrap_err("failed to initialize database")?;
    store.migrate().wrap_err("failed to migrate database")?;

    // Single-instance guard: lock alongside the database. Two monitors
    // sharing one database would double every alert.
    let lock_path = store.db_path().with_extension("lock");
    let lock_file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)
        .wrap_err_with(|| format!("failed to open lock file {}", lock_path.display()))?;
    lock_file.try_lock_exclusive().map_err(|err| {
        eyre!(
            "monitor already running or lock unavailable ({}): {err}",
            lock_path.display()
        )
    })?;
    // Keep file handle alive.
    let _lock_guard = lock_file;

    let sink = AlertSink::from_config(&alert_config)?;
    let engine = AlertEngine::restore(&store)?;

    tracing::info!(
        validator = %config.validator_address,
        price_feeder = %config.price_feed_addr,
        endpoints = config.apis.len(),
        interval_s = config.monitoring_interval,
        health_check = alert_config.health_check_enabled,
        prometheus = alert_config.prometheus_client_enabled,
        "oracle monitor starting"
    );

    let (shutdown_handle, shutdown_flag) = shutdown::channel();

    let mut workers: Vec<(&str, JoinHandle<()>)> = Vec::new();

    workers.push(("monitor", {
        let config = config.clone();
        let store = store.clone();
        let shutdown = shutdown_flag.clone();
        let handle = shutdown_handle.clone();
        tokio::spawn(async move {
            run_monitor_loop(config, store, engine, sink, shutdown).await;
            // The monitor loop only returns on shutdown or an unrecoverable
            // startup problem; either way the process is done.
            handle.trigger();
        })
    }));

    if alert_config.health_check_enabled {
        let url = alert_config
            .health_check_url
            .clone()
            .ok_or_else(|| eyre!("health_check_url missing"))?;
        let interval = Duration::from_secs(
            alert_config
                .health_check_interval
                .ok_or_else(|| eyre!("health_check_interval missing"))?,
        );
        let shutdown = shutdown_flag.clone();
        workers.push((
            "health",
            tokio::spawn(health::run_health_pinger(url, interval, None, shutdown)),
        ));
    }

    if alert_config.prometheus_client_enabled {
        let oracle_metrics =
            Arc::new(OracleMetrics::new().wrap_err("failed to build metrics registry")?);
        let store = store.clone();
        let host = alert_config.prometheus_host.clone();
        let port = alert_config.prometheus_port;
        let update_interval = Duration::from_secs(config.monitoring_interval);
        let shutdown = shutdown_flag.clone();
        workers.push((
            "metrics",
            tokio::spawn(async move {
                if let Err(err) =
                    metrics::serve(oracle_metrics, store, &host, port, update_interval, shutdown)
                        .await
                {
                    tracing::error!(error = %err, "metrics endpoint failed");
                }
            }),
        ));
    }

    tokio::spawn(async move {
        shutdown::wait_for_signal().await;
        tracing::info!("shutdown signal received");
        shutdown_handle.trigger();
    });

    let mut shutdown_wait = shutdown_flag;
    shutdown_wait.wait().await;

    let join_all = async {
        for (name, handle) in workers {
            if let Err(err) = handle.await {
                tracing::warn!(task = name, error = %err, "worker ended abnormally");
            }
        }
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, join_all).await.is_err() {
        tracing::warn!(
            grace_s = SHUTDOWN_GRACE.as_secs(),
            "workers did not stop within the grace period; exiting anyway"
        );
    }

    tracing::info!("shutdown complete");
    Ok(())
}

/// One probe → collect → reduce → alert pass. A `false` healthy verdict and
/// a failed collection both leave the epoch rows untouched.
async fn run_tick(
    config: &MonitorConfig,
    client: &reqwest::Client,
    store: &EpochStore,
    engine: &mut AlertEngine,
    sink: &AlertSink,
) -> Result<()> {
    let healthy = probe::check_endpoints(client, &config.apis).await;
    if healthy.is_empty() {
        engine.record_api_status(false, store, sink).await?;
        return Ok(());
    }
    engine.record_api_status(true, store, sink).await?;

    let tick = collector::collect_from_random_healthy(client, &healthy, config).await?;
    let record = reducer::apply(store, &tick)?;
    tracing::debug!(
        endpoint = %tick.endpoint,
        epoch = tick.current_epoch,
        "tick applied to epoch store"
    );
    engine.evaluate(&tick, record, store, sink).await?;
    Ok(())
}

async fn run_monitor_loop(
    config: MonitorConfig,
    store: EpochStore,
    mut engine: AlertEngine,
    sink: AlertSink,
    mut shutdown: ShutdownFlag,
) {
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            tracing::error!(error = %err, "failed to build HTTP client");
            return;
        }
    };
    let interval = Duration::from_secs(config.monitoring_interval);

    while !shutdown.is_triggered() {
        let wait = match run_tick(&config, &client, &store, &mut engine, &sink).await {
            Ok(()) => interval,
            Err(err) => {
                tracing::error!(error = %err, backoff_s = TICK_BACKOFF.as_secs(), "tick failed; backing off");
                TICK_BACKOFF
            }
        };
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = tokio::time::sleep(wait) => {}
        }
    }
    tracing::info!("monitor loop stopped");
}
