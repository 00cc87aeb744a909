//! Telemetry error types.

use std::net::AddrParseError;

use metrics_exporter_prometheus::BuildError;
use thiserror::Error;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::util::TryInitError;

/// Errors raised while installing logging or metrics.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The log filter directive could not be parsed.
    #[error("invalid log filter '{filter}': {source}")]
    InvalidFilter {
        /// The rejected directive.
        filter: String,
        /// Parser error.
        #[source]
        source: ParseError,
    },

    /// A global `tracing` subscriber is already installed.
    #[error("failed to install log subscriber: {0}")]
    SubscriberInstalled(#[source] TryInitError),

    /// The metrics listen address is not a socket address.
    #[error("invalid metrics address '{addr}': {source}")]
    InvalidMetricsAddr {
        /// The rejected address.
        addr: String,
        /// Parser error.
        #[source]
        source: AddrParseError,
    },

    /// The Prometheus exporter could not be built.
    #[error("failed to build Prometheus exporter: {0}")]
    Exporter(#[from] BuildError),

    /// A global metrics recorder is already installed.
    #[error("a metrics recorder is already installed")]
    RecorderInstalled,
}
