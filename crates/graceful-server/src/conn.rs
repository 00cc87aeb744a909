//! Connection identity and lifecycle states.
//!
//! Serving engines report every connection transition as a [`ConnState`]
//! through a [`ConnStateHook`]. The server installs its own hook to count live
//! connections and forwards each event to an optional user observer.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

/// Callback invoked on every connection-state transition.
///
/// Events for a single connection arrive in the order they occur. Events for
/// different connections may interleave and may be delivered from different
/// threads.
pub type ConnStateHook = Arc<dyn Fn(&ConnInfo, ConnState) + Send + Sync>;

/// Identifier of an accepted connection, unique per engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl ConnId {
    /// Creates a connection id from a raw value.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Describes an accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnInfo {
    id: ConnId,
    remote_addr: SocketAddr,
}

impl ConnInfo {
    /// Creates connection info.
    #[must_use]
    pub const fn new(id: ConnId, remote_addr: SocketAddr) -> Self {
        Self { id, remote_addr }
    }

    /// Returns the connection id.
    #[must_use]
    pub const fn id(&self) -> ConnId {
        self.id
    }

    /// Returns the peer address.
    #[must_use]
    pub const fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnState {
    /// The connection was just accepted and has not sent a request yet.
    New,
    /// A request is being served on the connection.
    Active,
    /// The connection finished a request and is waiting for the next one.
    Idle,
    /// The connection was handed off to another protocol (e.g. an HTTP
    /// upgrade). Under [`HijackPolicy::Retain`] a `Closed` follows once the
    /// hijacked stream is released; otherwise nothing else is reported.
    Hijacked,
    /// The connection is closed. Terminal.
    Closed,
}

impl ConnState {
    /// Returns the state as a lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Hijacked => "hijacked",
            Self::Closed => "closed",
        }
    }

    /// Returns `true` for states that end the protocol side of a
    /// connection.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Hijacked | Self::Closed)
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How hijacked connections count towards the drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HijackPolicy {
    /// A hijacked connection is no longer tracked: it stops counting as
    /// live and is never force-closed.
    #[default]
    Release,
    /// A hijacked connection keeps counting as live until the engine
    /// reports it closed, and is force-closed with the rest at the deadline.
    Retain,
}

impl HijackPolicy {
    /// Returns the policy as a lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Release => "release",
            Self::Retain => "retain",
        }
    }
}

impl fmt::Display for HijackPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HijackPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "release" => Ok(Self::Release),
            "retain" => Ok(Self::Retain),
            other => Err(format!(
                "unknown hijack policy '{other}', expected 'release' or 'retain'"
            )),
        }
    }
}
