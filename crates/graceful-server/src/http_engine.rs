//! HTTP/1.1 serving engine built on Hyper.
//!
//! [`HttpEngine`] accepts TCP connections, serves each one on its own task
//! and reports every connection transition through the hook it is given:
//!
//! - `New` right after accept, before the connection task starts
//! - `Active` when a request starts on an otherwise quiet connection
//! - `Idle` when the last in-flight request finishes and keep-alives are on
//! - `Hijacked` when a response switched protocols and Hyper handed the
//!   socket over to the upgrade
//! - `Closed` when the connection task ends for any reason, including a
//!   forced close or a panicking handler, and, under
//!   [`HijackPolicy::Retain`], when a hijacked stream is released
//!
//! Handlers that switch protocols claim the stream with
//! [`on_upgrade`](crate::on_upgrade) instead of `hyper::upgrade::on`.
//!
//! # Example
//!
//! ```rust,ignore
//! use graceful_server::{respond, HttpEngine, Server};
//! use http::StatusCode;
//!
//! let engine = HttpEngine::new(|_req| async { respond(StatusCode::OK, "hello") });
//! let server = Server::builder(engine).build();
//! ```

use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tokio::net::TcpStream;

use crate::conn::{ConnId, ConnInfo, ConnState, ConnStateHook, HijackPolicy};
use crate::engine::{is_connection_error, AcceptError, Engine, Listener};
use crate::signal::Latch;
use crate::upgrade::{PendingUpgrade, UpgradeSlot};

/// Type alias for HTTP response body.
pub type ResponseBody = Full<Bytes>;

/// Type alias for the HTTP response.
pub type HttpResponse = Response<ResponseBody>;

/// Builds a response with the given status and body.
pub fn respond(status: StatusCode, body: impl Into<Bytes>) -> HttpResponse {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

#[derive(Debug)]
struct EngineShared {
    keep_alive: AtomicBool,
    retain_hijacked: AtomicBool,
    /// Asks every connection to finish its current request and close.
    drain: Latch,
    /// Drops every connection immediately.
    kill: Latch,
    next_id: AtomicU64,
    /// Hijacked streams still counted as live.
    retained: Mutex<Vec<Weak<UpgradeSlot>>>,
}

/// Hyper-based engine serving every request with `handler`.
pub struct HttpEngine<F> {
    handler: F,
    shared: Arc<EngineShared>,
}

impl<F> HttpEngine<F> {
    /// Creates an engine with keep-alives enabled.
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            shared: Arc::new(EngineShared {
                keep_alive: AtomicBool::new(true),
                retain_hijacked: AtomicBool::new(false),
                drain: Latch::new(),
                kill: Latch::new(),
                next_id: AtomicU64::new(1),
                retained: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Returns whether keep-alives are currently enabled.
    #[must_use]
    pub fn keep_alives_enabled(&self) -> bool {
        self.shared.keep_alive.load(Ordering::SeqCst)
    }

    /// Returns the number of hijacked streams still counted as live.
    #[must_use]
    pub fn retained_hijacks(&self) -> usize {
        self.shared
            .retained
            .lock()
            .iter()
            .filter(|slot| slot.strong_count() > 0)
            .count()
    }
}

impl<F> fmt::Debug for HttpEngine<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpEngine")
            .field("keep_alive", &self.keep_alives_enabled())
            .field("draining", &self.shared.drain.is_fired())
            .field("closed", &self.shared.kill.is_fired())
            .finish_non_exhaustive()
    }
}

impl<F, Fut> Engine for HttpEngine<F>
where
    F: Fn(Request<Incoming>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = HttpResponse> + Send + 'static,
{
    fn serve(
        &self,
        listener: Listener,
        hook: ConnStateHook,
    ) -> impl Future<Output = Result<(), AcceptError>> + Send + 'static {
        let shared = Arc::clone(&self.shared);
        let handler = self.handler.clone();

        async move {
            if let Ok(addr) = listener.local_addr() {
                tracing::info!(%addr, "accepting connections");
            }

            loop {
                let (stream, remote_addr) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(AcceptError::Io(e)) if is_connection_error(&e) => {
                        tracing::debug!(error = %e, "dropped connection during accept");
                        continue;
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "accept loop finished");
                        return Err(e);
                    }
                };

                let id = ConnId::new(shared.next_id.fetch_add(1, Ordering::Relaxed));
                let tracking = Arc::new(ConnTracking {
                    info: ConnInfo::new(id, remote_addr),
                    hook: Arc::clone(&hook),
                    shared: Arc::clone(&shared),
                    in_flight: AtomicUsize::new(0),
                    upgraded: AtomicBool::new(false),
                    claimed: AtomicBool::new(false),
                    settled: Mutex::new(None),
                });
                tracking.emit(ConnState::New);

                tokio::spawn(serve_connection(stream, handler.clone(), tracking));
            }
        }
    }

    fn set_keep_alives_enabled(&self, enabled: bool) {
        self.shared.keep_alive.store(enabled, Ordering::SeqCst);
    }

    fn set_hijack_policy(&self, policy: HijackPolicy) {
        self.shared
            .retain_hijacked
            .store(policy == HijackPolicy::Retain, Ordering::SeqCst);
    }

    fn drain(&self) {
        if self.shared.drain.fire() {
            tracing::debug!("draining open connections");
        }
    }

    fn close(&self) {
        if self.shared.kill.fire() {
            tracing::debug!("force-closing open connections");
        }

        let retained: Vec<Arc<UpgradeSlot>> = self
            .shared
            .retained
            .lock()
            .drain(..)
            .filter_map(|slot| slot.upgrade())
            .collect();
        for slot in retained {
            slot.release(true);
        }
    }
}

/// Per-connection bookkeeping shared between the connection task, its
/// request futures and a hijacked stream.
pub(crate) struct ConnTracking {
    info: ConnInfo,
    hook: ConnStateHook,
    shared: Arc<EngineShared>,
    in_flight: AtomicUsize,
    upgraded: AtomicBool,
    /// Set once a handler took the upgraded stream with `on_upgrade`.
    claimed: AtomicBool,
    /// The terminal state reported for the protocol side, once there is one.
    settled: Mutex<Option<ConnState>>,
}

impl ConnTracking {
    pub(crate) fn info(&self) -> &ConnInfo {
        &self.info
    }

    pub(crate) fn emit(&self, state: ConnState) {
        (self.hook)(&self.info, state);
    }

    /// Reports `state` unless a terminal state was already reported, and
    /// returns whichever terminal state is now in effect.
    pub(crate) fn settle(&self, state: ConnState) -> ConnState {
        let mut settled = self.settled.lock();
        if let Some(previous) = *settled {
            return previous;
        }
        *settled = Some(state);
        // Emitted under the lock so a retained stream's `Closed` can never
        // overtake the `Hijacked` before it.
        self.emit(state);
        state
    }

    pub(crate) fn claim(&self) {
        self.claimed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn retains_hijacked(&self) -> bool {
        self.shared.retain_hijacked.load(Ordering::SeqCst)
    }

    pub(crate) fn kill(&self) -> &Latch {
        &self.shared.kill
    }

    pub(crate) fn retain(&self, slot: &Arc<UpgradeSlot>) {
        let mut retained = self.shared.retained.lock();
        retained.retain(|slot| slot.strong_count() > 0);
        retained.push(Arc::downgrade(slot));
    }

    fn request_started(&self) {
        if self.in_flight.fetch_add(1, Ordering::SeqCst) == 0 {
            self.emit(ConnState::Active);
        }
    }

    fn request_finished(&self, response: &HttpResponse) {
        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            self.upgraded.store(true, Ordering::SeqCst);
        }
        let idle = self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1;
        if idle
            && self.shared.keep_alive.load(Ordering::SeqCst)
            && !self.upgraded.load(Ordering::SeqCst)
        {
            self.emit(ConnState::Idle);
        }
    }
}

/// Reports the end of a connection task when dropped, so a task that is
/// torn down by a panic still settles its connection.
struct ConnGuard {
    tracking: Arc<ConnTracking>,
    forced: bool,
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        // An upgrade nobody claimed is dropped by Hyper along with the socket.
        let hijacked = self.tracking.upgraded.load(Ordering::SeqCst)
            && self.tracking.claimed.load(Ordering::SeqCst);
        let state = if hijacked && !self.forced {
            ConnState::Hijacked
        } else {
            ConnState::Closed
        };
        self.tracking.settle(state);
    }
}

async fn serve_connection<F, Fut>(stream: TcpStream, handler: F, tracking: Arc<ConnTracking>)
where
    F: Fn(Request<Incoming>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HttpResponse> + Send + 'static,
{
    let mut guard = ConnGuard {
        tracking: Arc::clone(&tracking),
        forced: false,
    };
    guard.forced = drive_connection(stream, handler, tracking).await;

    if guard.forced {
        graceful_telemetry::metrics::record_forced_close();
        tracing::debug!(conn_id = %guard.tracking.info.id(), "connection force-closed");
    }
}

/// Serves one connection until it ends; returns `true` if it was killed.
///
/// The connection is dropped, and the socket closed, before this returns.
async fn drive_connection<F, Fut>(stream: TcpStream, handler: F, tracking: Arc<ConnTracking>) -> bool
where
    F: Fn(Request<Incoming>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HttpResponse> + Send + 'static,
{
    let shared = Arc::clone(&tracking.shared);
    let conn_id = tracking.info.id();

    let service = service_fn(move |mut req: Request<Incoming>| {
        let tracking = Arc::clone(&tracking);
        if let Some(on_upgrade) = req.extensions_mut().remove::<hyper::upgrade::OnUpgrade>() {
            req.extensions_mut()
                .insert(PendingUpgrade::new(on_upgrade, Arc::clone(&tracking)));
        }
        tracking.request_started();
        let response = handler(req);
        async move {
            let response = response.await;
            tracking.request_finished(&response);
            Ok::<_, Infallible>(response)
        }
    });

    let conn = http1::Builder::new()
        .keep_alive(shared.keep_alive.load(Ordering::SeqCst))
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades();
    tokio::pin!(conn);

    let mut draining = false;
    loop {
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    tracing::debug!(conn_id = %conn_id, error = %e, "connection error");
                }
                return false;
            }
            () = shared.drain.wait(), if !draining => {
                conn.as_mut().graceful_shutdown();
                draining = true;
            }
            () = shared.kill.wait() => return true,
        }
    }
}
