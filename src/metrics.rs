use crate::shutdown::ShutdownFlag;
use crate::store::{EpochStore, StoreError};
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::routing::get;
use axum::Router;
use eyre::{Result, WrapErr};
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

const NAMESPACE: &str = "nibiru_oracle";

/// Prometheus view of the newest epoch row.
///
/// Gauges mirror the row directly. The `*_executed` series are exported as
/// counters bumped by the observed latch value on every refresh, matching
/// what the dashboards built against this exporter expect.
pub struct OracleMetrics {
    registry: Registry,
    slash_epoch: IntGauge,
    miss_counter_events: IntGauge,
    unsigned_oracle_events: IntGauge,
    price_feed_balance: IntGauge,
    consecutive_misses: IntGauge,
    api_cons_miss: IntGauge,
    miss_counter_p1_executed: IntCounter,
    miss_counter_p2_executed: IntCounter,
    miss_counter_p3_executed: IntCounter,
    small_balance_alert_executed: IntCounter,
    very_small_balance_alert_executed: IntCounter,
}

impl OracleMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let gauge = |name: &str, help: &str| -> Result<IntGauge, prometheus::Error> {
            let gauge = IntGauge::new(format!("{NAMESPACE}_{name}"), help)?;
            registry.register(Box::new(gauge.clone()))?;
            Ok(gauge)
        };
        let counter = |name: &str, help: &str| -> Result<IntCounter, prometheus::Error> {
            let counter = IntCounter::new(format!("{NAMESPACE}_{name}"), help)?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };

        Ok(Self {
            slash_epoch: gauge("slash_epoch", "Current slash epoch")?,
            miss_counter_events: gauge(
                "miss_counter_events",
                "Latest miss counter reported by the oracle module",
            )?,
            unsigned_oracle_events: gauge(
                "unsigned_oracle_events",
                "Unsigned oracle events observed this epoch",
            )?,
            price_feed_balance: gauge(
                "price_feed_balance",
                "Price feeder wallet unibi balance",
            )?,
            consecutive_misses: gauge(
                "consecutive_misses",
                "Consecutive unsigned events",
            )?,
            api_cons_miss: gauge("api_cons_miss", "Consecutive ticks without a healthy API")?,
            miss_counter_p1_executed: counter("miss_counter_events_p1_executed", "P1 miss alert executed")?,
            miss_counter_p2_executed: counter("miss_counter_events_p2_executed", "P2 miss alert executed")?,
            miss_counter_p3_executed: counter("miss_counter_events_p3_executed", "P3 miss alert executed")?,
            small_balance_alert_executed: counter(
                "small_balance_alert_executed",
                "Small balance alert executed",
            )?,
            very_small_balance_alert_executed: counter(
                "very_small_balance_alert_executed",
                "Very small balance alert executed",
            )?,
            registry,
        })
    }

    /// Re-reads the newest epoch row. A still-empty database leaves the
    /// series at their initial values.
    pub fn refresh(&self, store: &EpochStore) -> Result<(), StoreError> {
        let epoch = match store.last_epoch() {
            Ok(epoch) => epoch,
            Err(StoreError::Empty) => return Ok(()),
            Err(err) => return Err(err),
        };
        let record = store.get(epoch)?;

        self.slash_epoch.set(record.slash_epoch as i64);
        self.miss_counter_events.set(record.miss_counter_events as i64);
        self.unsigned_oracle_events
            .set(record.unsigned_oracle_events as i64);
        self.price_feed_balance
            .set(record.price_feed_addr_balance as i64);
        self.consecutive_misses.set(record.consecutive_misses as i64);
        self.api_cons_miss.set(record.api_cons_miss as i64);

        self.miss_counter_p1_executed
            .inc_by(record.miss_counter_p1_executed as u64);
        self.miss_counter_p2_executed
            .inc_by(record.miss_counter_p2_executed as u64);
        self.miss_counter_p3_executed
            .inc_by(record.miss_counter_p3_executed as u64);
        self.small_balance_alert_executed
            .inc_by(record.small_balance_alert_executed as u64);
        self.very_small_balance_alert_executed
            .inc_by(record.very_small_balance_alert_executed as u64);
        Ok(())
    }

    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(err) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::error!(error = %err, "failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[derive(Clone)]
struct MetricsState {
    metrics: Arc<OracleMetrics>,
    store: EpochStore,
}

async fn scrape(State(state): State<MetricsState>) -> ([(axum::http::HeaderName, &'static str); 1], String) {
    if let Err(err) = state.metrics.refresh(&state.store) {
        tracing::warn!(error = %err, "failed to refresh metrics from database");
    }
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

/// Serves `GET /metrics` until shutdown, refreshing from the store both on a
/// timer and on every scrape.
pub async fn serve(
    metrics: Arc<OracleMetrics>,
    store: EpochStore,
    host: &str,
    port: u16,
    update_interval: Duration,
    shutdown: ShutdownFlag,
) -> Result<()> {
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .wrap_err_with(|| format!("invalid metrics listen address {host}:{port}"))?;

    let app = Router::new().route("/metrics", get(scrape)).with_state(MetricsState {
        metrics: metrics.clone(),
        store: store.clone(),
    });

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("failed to bind metrics endpoint on {addr}"))?;
    tracing::info!(%addr, "metrics endpoint listening");

    let refresher = {
        let mut shutdown = shutdown.clone();
        async move {
            loop {
                if let Err(err) = metrics.refresh(&store) {
                    tracing::warn!(error = %err, "failed to refresh metrics from database");
                }
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = tokio::time::sleep(update_interval) => {}
                }
            }
        }
    };

    let server = {
        let mut shutdown = shutdown.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.wait().await })
    };

    let (served, ()) = tokio::join!(server, refresher);
    served.wrap_err("metrics server failed")?;
    tracing::info!("metrics endpoint stopped");
    Ok(())
}
