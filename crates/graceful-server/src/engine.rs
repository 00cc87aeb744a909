//! The seam between the shutdown coordinator and the serving engine.
//!
//! The coordinator does not parse any protocol. It needs four things from
//! whatever serves the connections, captured by [`Engine`]:
//!
//! 1. run an accept loop over a [`Listener`], reporting every connection
//!    transition through the supplied [`ConnStateHook`];
//! 2. stop accepting once the listener is closed (the coordinator owns the
//!    close switch inside [`Listener`]);
//! 3. let open connections finish their in-flight work and close;
//! 4. forcibly close every open connection.
//!
//! Keep-alives and the hijack policy are plain settings the coordinator
//! applies before serving.

use std::future::Future;
use std::io;
use std::net::SocketAddr;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};

use crate::conn::{ConnStateHook, HijackPolicy};
use crate::signal::Latch;

/// Why an accept loop ended.
#[derive(Debug, Error)]
pub enum AcceptError {
    /// The listener was closed on purpose.
    #[error("listener closed")]
    Closed,

    /// Accepting failed for a reason unrelated to shutdown.
    #[error("accept failed: {0}")]
    Io(#[from] io::Error),
}

impl AcceptError {
    /// Returns `true` for the error produced by an intentional close.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// A serving engine driven by [`Server`](crate::Server).
pub trait Engine: Send + Sync + 'static {
    /// Runs the accept loop until the listener is closed or fails.
    ///
    /// The returned future owns everything it needs, so it can be spawned.
    ///
    /// Connections that were already accepted must keep being served after
    /// this returns. The hook must see at least `New`, `Active` and `Closed`
    /// for every connection, in order.
    fn serve(
        &self,
        listener: Listener,
        hook: ConnStateHook,
    ) -> impl Future<Output = Result<(), AcceptError>> + Send + 'static;

    /// Enables or disables keep-alives for connections served from now on.
    ///
    /// This is a setting only; it does not start a drain.
    fn set_keep_alives_enabled(&self, enabled: bool);

    /// Tells the engine how hijacked connections are accounted for.
    ///
    /// Engines that cannot follow a hijacked connection after the hand-off
    /// may ignore this.
    fn set_hijack_policy(&self, policy: HijackPolicy) {
        let _ = policy;
    }

    /// Asks every open connection to finish its in-flight request and close.
    ///
    /// Called once, after the listener has been closed.
    fn drain(&self);

    /// Forcibly closes every open connection, including hijacked ones the
    /// engine still accounts for.
    fn close(&self);
}

/// A TCP listener whose accept side can be shut from elsewhere.
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
    closed: Latch,
}

impl Listener {
    /// Wraps `inner`; firing `closed` makes every pending and future
    /// [`accept`](Self::accept) return [`AcceptError::Closed`].
    #[must_use]
    pub fn new(inner: TcpListener, closed: Latch) -> Self {
        Self { inner, closed }
    }

    /// Accepts the next connection.
    ///
    /// # Errors
    ///
    /// Returns [`AcceptError::Closed`] once the listener has been closed and
    /// [`AcceptError::Io`] if the socket fails.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), AcceptError> {
        if self.closed.is_fired() {
            return Err(AcceptError::Closed);
        }

        tokio::select! {
            biased;
            () = self.closed.wait() => Err(AcceptError::Closed),
            result = self.inner.accept() => result.map_err(AcceptError::Io),
        }
    }

    /// Returns `true` once the listener has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_fired()
    }

    /// Returns the bound address.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket address cannot be read.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

/// Returns `true` for accept errors that only concern the one connection
/// being accepted; the loop should keep going after these.
#[must_use]
pub fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}
