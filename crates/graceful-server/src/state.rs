//! Server-level shutdown state machine.
//!
//! ```text
//! Running --(interrupt | stop)--> ShuttingDown --(drained | timed out)--> Stopped
//! ```
//!
//! Transitions only move forward and each happens at most once.

use std::fmt;

/// Shutdown phase of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum ShutdownState {
    /// Accepting and serving connections.
    #[default]
    Running,
    /// Shutdown requested: no new connections, open ones are draining.
    ShuttingDown,
    /// Every connection is gone. Terminal.
    Stopped,
}

impl ShutdownState {
    /// Returns the state as a lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ShutdownState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What initiated a shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// The configured interrupt source fired (e.g. SIGINT/SIGTERM).
    Interrupt,
    /// [`Server::stop`](crate::Server::stop) was called.
    Stop,
    /// The accept loop ended without being asked to.
    ListenerExit,
}

impl Trigger {
    /// Returns the trigger as a lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Interrupt => "interrupt",
            Self::Stop => "stop",
            Self::ListenerExit => "listener_exit",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How `ShuttingDown` ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The last live connection closed on its own.
    Drained,
    /// The grace period expired and remaining connections were force-closed.
    TimedOut,
}

impl StopReason {
    /// Returns the reason as a lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Drained => "drained",
            Self::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
