//! Grace-period enforcement.
//!
//! Once the drain is armed, [`TimeoutEnforcer`] races a single timer against
//! the tracker's completion signal. If the timer wins, the remaining
//! connections are force-closed. A zero grace period disarms the timer
//! entirely: the server then waits for every connection to finish on its own.

use std::time::Duration;

use crate::state::StopReason;
use crate::tracker::ConnectionTracker;

/// Races the grace period against the drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutEnforcer {
    grace: Duration,
}

impl TimeoutEnforcer {
    /// Creates an enforcer for the given grace period.
    #[must_use]
    pub const fn new(grace: Duration) -> Self {
        Self { grace }
    }

    /// Returns the grace period.
    #[must_use]
    pub const fn grace(&self) -> Duration {
        self.grace
    }

    /// Returns `false` when the grace period is zero and nothing will ever
    /// be force-closed.
    #[must_use]
    pub const fn is_armed(&self) -> bool {
        !self.grace.is_zero()
    }

    /// Waits until the server is stopped, force-closing on expiry.
    ///
    /// `force_close` runs at most once, only if the timer expires first, and
    /// before the completion signal is fulfilled.
    pub async fn enforce(self, tracker: &ConnectionTracker, force_close: impl FnOnce()) -> StopReason {
        let completion = tracker.completion();

        if !self.is_armed() {
            tracing::debug!("grace period disabled, waiting for connections to drain");
            completion.wait().await;
            return StopReason::Drained;
        }

        tokio::select! {
            () = completion.wait() => {
                tracing::debug!("connections drained before the grace period expired");
                StopReason::Drained
            }
            () = tokio::time::sleep(self.grace) => {
                let live = tracker.live_connections();
                if tracker.finish(StopReason::TimedOut, force_close) {
                    tracing::warn!(
                        grace_ms = u64::try_from(self.grace.as_millis()).unwrap_or(u64::MAX),
                        live,
                        "grace period expired, forcing remaining connections closed"
                    );
                    StopReason::TimedOut
                } else {
                    StopReason::Drained
                }
            }
        }
    }
}
