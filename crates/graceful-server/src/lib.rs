//! # Graceful Server
//!
//! Graceful shutdown for TCP servers.
//!
//! A [`Server`] serves connections through an [`Engine`] until it is told to
//! stop, either by an interrupt (SIGINT/SIGTERM or any future), by an explicit
//! [`Server::stop`] call or by its listener failing. It then:
//!
//! - turns keep-alives off and closes the listener, so new connections are
//!   refused while accepted ones keep being served;
//! - asks every open connection to finish its in-flight request and close;
//! - waits for every live connection to close, up to a grace period;
//! - force-closes whatever is left once the grace period expires;
//! - fulfils the [`CompletionSignal`] returned by [`Server::stop_signal`].
//!
//! [`HttpEngine`] is the bundled HTTP/1.1 engine built on Hyper. Handlers
//! that switch protocols take the stream with [`on_upgrade`].
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use graceful_server::{respond, HttpEngine, Server};
//! use http::StatusCode;
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

#![doc(html_root_url = "https://docs.rs/graceful-server/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod config;
mod conn;
mod enforcer;
mod engine;
mod http_engine;
mod server;
mod signal;
mod state;
mod tracker;
mod trigger;
mod upgrade;

pub use config::{
    ServerConfig, ServerConfigBuilder, DEFAULT_HTTP_ADDR, DEFAULT_SHUTDOWN_TIMEOUT_SECS,
};
pub use conn::{ConnId, ConnInfo, ConnState, ConnStateHook, HijackPolicy};
pub use enforcer::TimeoutEnforcer;
pub use engine::{is_connection_error, AcceptError, Engine, Listener};
pub use http_engine::{respond, HttpEngine, HttpResponse, ResponseBody};
pub use server::{Server, ServerBuilder, ServerError};
pub use signal::{CompletionSignal, Latch};
pub use state::{ShutdownState, StopReason, Trigger};
pub use tracker::{ConnectionTracker, Drain};
pub use trigger::InterruptSource;
pub use upgrade::{on_upgrade, Upgraded};
