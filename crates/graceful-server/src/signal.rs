//! One-shot signals.
//!
//! A [`Latch`] flips from unset to set exactly once and can be awaited by any
//! number of tasks. The server uses latches internally to close the listener,
//! to ask connections to stop keeping themselves alive and to force-close
//! them. [`CompletionSignal`] is the public, read-only face of a latch that
//! fires once the server has fully stopped.
//!
//! # Example
//!
//! ```rust
//! use graceful_server::Latch;
//!
//! let latch = Latch::new();
//! let observer = latch.clone();
//!
//! assert!(latch.fire());
//! assert!(!latch.fire());
//! assert!(observer.is_fired());
//! ```

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;

/// A signal that transitions from unset to set exactly once.
///
/// Clones share the same underlying state, so firing any clone is observed
/// by all of them.
#[derive(Debug, Clone)]
pub struct Latch {
    sender: Arc<watch::Sender<bool>>,
}

impl Latch {
    /// Creates a new, unset latch.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Sets the latch and wakes every waiter.
    ///
    /// Returns `true` only for the call that actually set it; later calls
    /// are no-ops and return `false`.
    pub fn fire(&self) -> bool {
        self.sender.send_if_modified(|fired| {
            if *fired {
                false
            } else {
                *fired = true;
                true
            }
        })
    }

    /// Returns `true` once the latch has been set.
    #[must_use]
    pub fn is_fired(&self) -> bool {
        *self.sender.borrow()
    }

    /// Returns a future that completes once the latch is set.
    ///
    /// The future completes immediately if the latch is already set. The
    /// subscription is taken when `wait` is called, so a `fire` that happens
    /// between this call and the first poll is never missed.
    pub fn wait(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut receiver = self.sender.subscribe();
        async move {
            // Err: every handle was dropped, nothing can fire it anymore.
            let _ = receiver.wait_for(|fired| *fired).await;
        }
    }

    /// Returns `true` if both latches share the same state.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.sender, &other.sender)
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

/// Observable completion of a graceful shutdown.
///
/// Returned by [`Server::stop_signal`](crate::Server::stop_signal). Waiting
/// on it blocks until the server reaches
/// [`ShutdownState::Stopped`](crate::ShutdownState::Stopped); it never
/// completes earlier. Every call to `stop_signal` returns a handle to the
/// same underlying signal.
///
/// ```rust,ignore
/// let stopped = server.stop_signal();
/// server.stop(Duration::from_secs(5));
///
/// tokio::time::timeout(Duration::from_secs(10), stopped.wait()).await?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct CompletionSignal {
    latch: Latch,
}

impl CompletionSignal {
    pub(crate) fn new() -> Self {
        Self {
            latch: Latch::new(),
        }
    }

    pub(crate) fn complete(&self) -> bool {
        self.latch.fire()
    }

    /// Returns `true` once shutdown has completed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.latch.is_fired()
    }

    /// Waits until shutdown has completed.
    pub fn wait(&self) -> impl Future<Output = ()> + Send + 'static {
        self.latch.wait()
    }

    /// Returns `true` if both handles observe the same shutdown.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        self.latch.same_as(&other.latch)
    }
}
