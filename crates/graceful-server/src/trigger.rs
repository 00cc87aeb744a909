//! Interrupt-driven shutdown triggers.
//!
//! An [`InterruptSource`] is any future that completes when the process is
//! asked to stop. The server races it against explicit
//! [`Server::stop`](crate::Server::stop) calls; whichever comes first starts
//! the shutdown and the other is ignored.
//!
//! # Example
//!
//! ```rust,ignore
//! use graceful_server::InterruptSource;
//!
//! // SIGINT / SIGTERM
//! let source = InterruptSource::os_signals();
//!
//! // Any future, e.g. a channel the test controls
//! let (tx, rx) = tokio::sync::oneshot::channel::<()>();
//! let source = InterruptSource::new(async move {
//!     let _ = rx.await;
//! });
//! ```

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::state::Trigger;
use crate::tracker::ConnectionTracker;

/// A future that resolves when shutdown should begin.
pub struct InterruptSource {
    name: &'static str,
    signal: Pin<Box<dyn Future<Output = ()> + Send>>,
}

impl InterruptSource {
    /// Wraps an arbitrary future.
    pub fn new<F>(signal: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            name: "custom",
            signal: Box::pin(signal),
        }
    }

    /// Fires on SIGINT or SIGTERM (Ctrl+C only on non-Unix systems).
    ///
    /// Handlers are registered when the server starts polling the source,
    /// so this can be built outside a runtime.
    #[must_use]
    pub fn os_signals() -> Self {
        Self {
            name: "os_signals",
            signal: Box::pin(wait_for_os_signal()),
        }
    }

    /// Returns a short label for logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for InterruptSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterruptSource")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Requests shutdown when `source` fires, unless something else got there
/// first. Dropping out early also drops the source, which unregisters any
/// OS signal handlers it installed.
pub(crate) async fn watch_interrupt(
    source: InterruptSource,
    tracker: Arc<ConnectionTracker>,
    grace: Duration,
) {
    let name = source.name;
    tokio::select! {
        () = source.signal => {
            if tracker.request_shutdown(Trigger::Interrupt, grace) {
                tracing::info!(source = name, "interrupt received, initiating graceful shutdown");
            } else {
                tracing::debug!(source = name, "interrupt ignored, shutdown already in progress");
            }
        }
        () = tracker.shutdown_requested() => {}
    }
}

/// Waits for an OS shutdown signal (SIGTERM or SIGINT).
///
/// If the handlers cannot be registered the error is logged and the future
/// never completes, leaving explicit stops as the only trigger.
async fn wait_for_os_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let registered = signal(SignalKind::terminate())
            .and_then(|sigterm| signal(SignalKind::interrupt()).map(|sigint| (sigterm, sigint)));
        let (mut sigterm, mut sigint) = match registered {
            Ok(handlers) => handlers,
            Err(e) => {
                tracing::error!(error = %e, "failed to register signal handlers");
                return std::future::pending().await;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM");
            }
            _ = sigint.recv() => {
                tracing::info!("received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to wait for Ctrl+C");
            return std::future::pending().await;
        }
        tracing::info!("received Ctrl+C");
    }
}
