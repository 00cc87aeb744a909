//! Protocol upgrades on connections served by [`HttpEngine`](crate::HttpEngine).
//!
//! A handler that answers `101 Switching Protocols` claims the upgraded
//! stream with [`on_upgrade`]. Under [`HijackPolicy::Release`] the stream is
//! handed over untracked. Under [`HijackPolicy::Retain`] the connection stays
//! live until the returned [`Upgraded`] is dropped, and a forced close shuts
//! the stream down along with every other connection.
//!
//! [`HijackPolicy::Release`]: crate::HijackPolicy::Release
//! [`HijackPolicy::Retain`]: crate::HijackPolicy::Retain

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use http::Request;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::conn::ConnState;
use crate::http_engine::ConnTracking;

type Io = TokioIo<hyper::upgrade::Upgraded>;
type KillFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Hyper's upgrade handle, tagged with the connection it belongs to.
#[derive(Clone)]
pub(crate) struct PendingUpgrade {
    inner: OnUpgrade,
    tracking: Arc<ConnTracking>,
}

impl PendingUpgrade {
    pub(crate) fn new(inner: OnUpgrade, tracking: Arc<ConnTracking>) -> Self {
        Self { inner, tracking }
    }

    async fn resolve(self) -> Result<Upgraded, hyper::Error> {
        let Self { inner, tracking } = self;

        let io = match inner.await {
            Ok(upgraded) => TokioIo::new(upgraded),
            Err(e) => {
                // The connection ended before the upgrade completed.
                if tracking.settle(ConnState::Closed) == ConnState::Hijacked
                    && tracking.retains_hijacked()
                {
                    tracking.emit(ConnState::Closed);
                }
                return Err(e);
            }
        };

        match tracking.settle(ConnState::Hijacked) {
            ConnState::Hijacked if tracking.retains_hijacked() => {}
            ConnState::Hijacked => {
                return Ok(Upgraded {
                    stream: Stream::Released(io),
                })
            }
            // Force-closed while the upgrade was in flight.
            _ => {
                drop(io);
                return Ok(Upgraded {
                    stream: Stream::Retained(Retained::new(UpgradeSlot::closed(tracking))),
                });
            }
        }

        let slot = Arc::new(UpgradeSlot {
            io: Mutex::new(Some(io)),
            closed: AtomicBool::new(false),
            tracking: Arc::clone(&tracking),
        });
        tracking.retain(&slot);
        if tracking.kill().is_fired() {
            slot.release(true);
        }
        tracing::debug!(conn_id = %tracking.info().id(), "retaining hijacked connection");

        Ok(Upgraded {
            stream: Stream::Retained(Retained::new(slot)),
        })
    }
}

/// Claims the upgraded stream of `req` once the response has been sent.
///
/// Requests served by [`HttpEngine`](crate::HttpEngine) are accounted for
/// according to the server's [`HijackPolicy`](crate::HijackPolicy); any
/// other request falls back to `hyper::upgrade::on`.
pub fn on_upgrade<B>(
    req: &mut Request<B>,
) -> impl Future<Output = Result<Upgraded, hyper::Error>> + Send + 'static {
    let claim = match req.extensions_mut().remove::<PendingUpgrade>() {
        Some(pending) => {
            pending.tracking.claim();
            Claim::Tracked(pending)
        }
        None => Claim::Untracked(hyper::upgrade::on(req)),
    };

    async move {
        match claim {
            Claim::Tracked(pending) => pending.resolve().await,
            Claim::Untracked(on) => on.await.map(|upgraded| Upgraded {
                stream: Stream::Released(TokioIo::new(upgraded)),
            }),
        }
    }
}

enum Claim {
    Tracked(PendingUpgrade),
    Untracked(OnUpgrade),
}

/// The live socket of a retained hijacked connection.
pub(crate) struct UpgradeSlot {
    io: Mutex<Option<Io>>,
    closed: AtomicBool,
    tracking: Arc<ConnTracking>,
}

impl UpgradeSlot {
    fn closed(tracking: Arc<ConnTracking>) -> Arc<Self> {
        Arc::new(Self {
            io: Mutex::new(None),
            closed: AtomicBool::new(true),
            tracking,
        })
    }

    /// Drops the socket and reports the connection closed, once.
    pub(crate) fn release(&self, forced: bool) {
        let io = self.io.lock().take();
        drop(io);

        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if forced {
            graceful_telemetry::metrics::record_forced_close();
            tracing::debug!(conn_id = %self.tracking.info().id(), "hijacked connection force-closed");
        }
        self.tracking.emit(ConnState::Closed);
    }
}

/// An upgraded connection handed to the handler by [`on_upgrade`].
pub struct Upgraded {
    stream: Stream,
}

enum Stream {
    Released(Io),
    Retained(Retained),
}

impl Upgraded {
    /// Returns whether the server still accounts for this stream.
    #[must_use]
    pub fn is_retained(&self) -> bool {
        matches!(self.stream, Stream::Retained(_))
    }
}

impl fmt::Debug for Upgraded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upgraded")
            .field("retained", &self.is_retained())
            .finish_non_exhaustive()
    }
}

struct Retained {
    slot: Arc<UpgradeSlot>,
    read_kill: Option<KillFuture>,
    write_kill: Option<KillFuture>,
}

impl Retained {
    fn new(slot: Arc<UpgradeSlot>) -> Self {
        let kill = slot.tracking.kill();
        Self {
            read_kill: Some(Box::pin(kill.wait())),
            write_kill: Some(Box::pin(kill.wait())),
            slot,
        }
    }

    fn poll_io<T>(
        slot: &UpgradeSlot,
        kill: &mut Option<KillFuture>,
        cx: &mut Context<'_>,
        op: impl FnOnce(Pin<&mut Io>, &mut Context<'_>) -> Poll<io::Result<T>>,
    ) -> Poll<io::Result<T>> {
        if let Some(wait) = kill.as_mut() {
            if wait.as_mut().poll(cx).is_ready() {
                *kill = None;
                slot.release(true);
            }
        }

        let mut guard = slot.io.lock();
        let Some(io) = guard.as_mut() else {
            return Poll::Ready(Err(io::ErrorKind::ConnectionAborted.into()));
        };
        op(Pin::new(io), cx)
    }
}

impl Drop for Retained {
    fn drop(&mut self) {
        self.slot.release(false);
    }
}

impl AsyncRead for Upgraded {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().stream {
            Stream::Released(io) => Pin::new(io).poll_read(cx, buf),
            Stream::Retained(r) => {
                Retained::poll_io(&r.slot, &mut r.read_kill, cx, |io, cx| io.poll_read(cx, buf))
            }
        }
    }
}

impl AsyncWrite for Upgraded {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.get_mut().stream {
            Stream::Released(io) => Pin::new(io).poll_write(cx, buf),
            Stream::Retained(r) => {
                Retained::poll_io(&r.slot, &mut r.write_kill, cx, |io, cx| io.poll_write(cx, buf))
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().stream {
            Stream::Released(io) => Pin::new(io).poll_flush(cx),
            Stream::Retained(r) => {
                Retained::poll_io(&r.slot, &mut r.write_kill, cx, |io, cx| io.poll_flush(cx))
            }
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().stream {
            Stream::Released(io) => Pin::new(io).poll_shutdown(cx),
            Stream::Retained(r) => {
                Retained::poll_io(&r.slot, &mut r.write_kill, cx, |io, cx| io.poll_shutdown(cx))
            }
        }
    }
}
