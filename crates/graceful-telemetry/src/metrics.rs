//! Prometheus metrics for graceful shutdown.
//!
//! # Standard Metrics
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `graceful_connections_total` | Counter | `state` | Connection state transitions |
//! | `graceful_live_connections` | Gauge | - | Connections counted towards the drain |
//! | `graceful_forced_closes_total` | Counter | - | Connections closed at the deadline |
//! | `graceful_shutdowns_total` | Counter | `trigger`, `outcome` | Completed shutdowns |
//! | `graceful_drain_duration_seconds` | Histogram | `outcome` | Time from shutdown request to stop |
//!
//! The recording functions are safe to call before [`init_metrics`]: without
//! an installed recorder they do nothing.

use crate::error::TelemetryError;
use crate::TelemetryResult;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

/// Counter of connection state transitions.
pub const CONNECTIONS_TOTAL: &str = "graceful_connections_total";

/// Gauge of live connections.
pub const LIVE_CONNECTIONS: &str = "graceful_live_connections";

/// Counter of forced closes.
pub const FORCED_CLOSES_TOTAL: &str = "graceful_forced_closes_total";

/// Counter of completed shutdowns.
pub const SHUTDOWNS_TOTAL: &str = "graceful_shutdowns_total";

/// Histogram of shutdown durations.
pub const DRAIN_DURATION_SECONDS: &str = "graceful_drain_duration_seconds";

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metrics configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsConfig {
    /// Whether metrics are enabled.
    pub enabled: bool,

    /// Address to expose metrics on (e.g., "0.0.0.0:9090").
    pub addr: String,

    /// Histogram buckets for the drain duration, in seconds.
    pub drain_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: "0.0.0.0:9090".to_string(),
            drain_buckets: vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0],
        }
    }
}

/// Installs the Prometheus recorder and starts its HTTP listener.
///
/// Must be called from within a Tokio runtime.
///
/// # Errors
///
/// Returns `TelemetryError::InvalidMetricsAddr` for a bad listen address,
/// `TelemetryError::Exporter` if the exporter cannot be built and
/// `TelemetryError::RecorderInstalled` if another recorder got there first.
pub fn init_metrics(config: &MetricsConfig) -> TelemetryResult<()> {
    if !config.enabled {
        return Ok(());
    }

    let addr: SocketAddr = config
        .addr
        .parse()
        .map_err(|source| TelemetryError::InvalidMetricsAddr {
            addr: config.addr.clone(),
            source,
        })?;

    let (recorder, exporter) = PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(
            Matcher::Full(DRAIN_DURATION_SECONDS.to_string()),
            &config.drain_buckets,
        )?
        .build()?;

    let handle = recorder.handle();
    metrics::set_global_recorder(recorder).map_err(|_| TelemetryError::RecorderInstalled)?;
    let _ = METRICS_HANDLE.set(handle);

    tokio::spawn(async move {
        if let Err(e) = exporter.await {
            tracing::error!(error = ?e, "metrics exporter stopped");
        }
    });

    register_metric_descriptions();
    tracing::info!(%addr, "metrics endpoint listening");
    Ok(())
}

/// Renders metrics in Prometheus format.
///
/// Returns `None` if metrics are not initialized.
#[must_use]
pub fn render_metrics() -> Option<String> {
    METRICS_HANDLE.get().map(PrometheusHandle::render)
}

fn register_metric_descriptions() {
    describe_counter!(CONNECTIONS_TOTAL, "Connection state transitions by state");
    describe_gauge!(
        LIVE_CONNECTIONS,
        "Connections currently counted towards the drain"
    );
    describe_counter!(
        FORCED_CLOSES_TOTAL,
        "Connections force-closed when the grace period expired"
    );
    describe_counter!(SHUTDOWNS_TOTAL, "Completed shutdowns by trigger and outcome");
    describe_histogram!(
        DRAIN_DURATION_SECONDS,
        "Time from shutdown request until the server stopped"
    );
}

/// Records a connection state transition.
pub fn record_connection_state(state: &str) {
    counter!(CONNECTIONS_TOTAL, "state" => state.to_string()).increment(1);
}

/// Sets the live connection gauge.
pub fn set_live_connections(live: usize) {
    gauge!(LIVE_CONNECTIONS).set(live as f64);
}

/// Records one forced close.
pub fn record_forced_close() {
    counter!(FORCED_CLOSES_TOTAL).increment(1);
}

/// Records a completed shutdown.
///
/// # Arguments
///
/// * `trigger` - What started it (`interrupt`, `stop`, `listener_exit`)
/// * `outcome` - How it ended (`drained`, `timed_out`)
/// * `elapsed` - Time from the request to `Stopped`
pub fn record_shutdown(trigger: &str, outcome: &str, elapsed: Duration) {
    counter!(
        SHUTDOWNS_TOTAL,
        "trigger" => trigger.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);

    histogram!(DRAIN_DURATION_SECONDS, "outcome" => outcome.to_string())
        .record(elapsed.as_secs_f64());
}
