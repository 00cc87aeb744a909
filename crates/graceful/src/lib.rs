//! # Graceful
//!
//! Graceful shutdown for Hyper/Tokio servers.
//!
//! - **Server**: connection tracking, interrupt and explicit stop triggers,
//!   grace-period enforcement and a bundled HTTP/1.1 engine
//! - **Config**: layered TOML/JSON/env configuration
//! - **Telemetry**: structured logs and Prometheus metrics
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use graceful::prelude::*;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = HttpEngine::new(|_req| async { respond(StatusCode::OK, "hello") });
//!     let server = Server::builder(engine)
//!         .http_addr("0.0.0.0:8080")
//!         .shutdown_timeout(Duration::from_secs(10))
//!         .handle_os_signals(true)
//!         .build();
//!
//!     server.listen_and_serve().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Lifecycle
//!
//! ```text
//! Running --(interrupt | stop | listener exit)--> ShuttingDown --(drain | timeout)--> Stopped
//! ```

#![doc(html_root_url = "https://docs.rs/graceful/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

// Re-export server types
pub use graceful_server as server;

// Re-export configuration types
pub use graceful_config as config;

// Re-export telemetry types
pub use graceful_telemetry as telemetry;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use graceful_config::{ConfigLoader, GracefulConfig};
    pub use graceful_server::{
        on_upgrade, respond, CompletionSignal, ConnInfo, ConnState, Engine, HijackPolicy,
        HttpEngine, HttpResponse, InterruptSource, Server, ServerConfig, ServerError,
        ShutdownState, Upgraded,
    };
    pub use graceful_telemetry::{init_telemetry, TelemetryConfig};
    pub use http::StatusCode;
}
