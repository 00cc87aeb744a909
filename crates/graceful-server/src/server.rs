//! The lifecycle controller.
//!
//! [`Server`] wires an [`Engine`] to a [`ConnectionTracker`], an optional
//! interrupt source and the [`TimeoutEnforcer`]:
//!
//! ```text
//! Running --(interrupt | stop | listener exit)--> ShuttingDown --(drain | timeout)--> Stopped
//! ```
//!
//! On the way into `ShuttingDown` the controller turns keep-alives off,
//! closes the listener and waits for the accept loop to let go of it. Only
//! then are the engine's connections told to drain and the drain armed, so
//! the completion signal can never fire while new connections are still
//! being accepted.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use graceful_server::{respond, HttpEngine, Server};
//! use http::StatusCode;
//!
//! let engine = HttpEngine::new(|_req| async { respond(StatusCode::OK, "hello") });
//! let server = Arc::new(
//!     Server::builder(engine)
//!         .http_addr("127.0.0.1:8080")
//!         .shutdown_timeout(Duration::from_secs(10))
//!         .build(),
//! );
//!
//! let handle = tokio::spawn({
//!     let server = Arc::clone(&server);
//!     async move { server.listen_and_serve().await }
//! });
//!
//! server.stop(Duration::from_secs(2));
//! server.stop_signal().wait().await;
//! ```

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::TcpListener;

use crate::config::{ServerConfig, ServerConfigBuilder};
use crate::conn::{ConnInfo, ConnState, ConnStateHook, HijackPolicy};
use crate::enforcer::TimeoutEnforcer;
use crate::engine::{AcceptError, Engine, Listener};
use crate::signal::{CompletionSignal, Latch};
use crate::state::{ShutdownState, Trigger};
use crate::tracker::{ConnectionTracker, Drain};
use crate::trigger::{watch_interrupt, InterruptSource};

/// Errors returned by [`Server`].
#[derive(Debug, Error)]
pub enum ServerError {
    /// The configured address is not a socket address.
    #[error("invalid address '{addr}': {reason}")]
    InvalidAddress {
        /// The configured address.
        addr: String,
        /// Why it could not be parsed.
        reason: String,
    },

    /// Binding the listener failed.
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        /// The address that could not be bound.
        addr: SocketAddr,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// The accept loop failed for a reason other than shutdown.
    ///
    /// Open connections have been drained by the time this is returned.
    #[error("accept loop failed: {0}")]
    Accept(#[source] io::Error),

    /// `serve` was called on a server that is, or was, already serving.
    #[error("server is already serving")]
    AlreadyServing,
}

/// A server that shuts down gracefully.
///
/// Share it behind an [`Arc`] to call [`stop`](Self::stop) from other tasks
/// while [`serve`](Self::serve) runs.
pub struct Server<E> {
    config: ServerConfig,
    engine: E,
    tracker: Arc<ConnectionTracker>,
    observer: Option<ConnStateHook>,
    interrupt: Mutex<Option<InterruptSource>>,
    serving: AtomicBool,
}

impl<E: Engine> Server<E> {
    /// Creates a server with the given configuration.
    #[must_use]
    pub fn new(engine: E, config: ServerConfig) -> Self {
        Self {
            tracker: Arc::new(ConnectionTracker::new(config.hijack_policy())),
            config,
            engine,
            observer: None,
            interrupt: Mutex::new(None),
            serving: AtomicBool::new(false),
        }
    }

    /// Creates a new server builder.
    #[must_use]
    pub fn builder(engine: E) -> ServerBuilder<E> {
        ServerBuilder::new(engine)
    }

    /// Returns a reference to the server configuration.
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Returns a reference to the engine.
    #[must_use]
    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Returns the current shutdown state.
    #[must_use]
    pub fn state(&self) -> ShutdownState {
        self.tracker.state()
    }

    /// Returns the number of live connections.
    #[must_use]
    pub fn live_connections(&self) -> usize {
        self.tracker.live_connections()
    }

    /// Returns the signal fulfilled once the server is `Stopped`.
    ///
    /// Every call returns the same signal.
    #[must_use]
    pub fn stop_signal(&self) -> CompletionSignal {
        self.tracker.completion()
    }

    /// Requests a graceful shutdown with `timeout` as the grace period.
    ///
    /// Returns immediately. `timeout` replaces the configured grace period
    /// for this shutdown; zero waits for every connection however long it
    /// takes. Only the first request (from here, an interrupt or a failed
    /// listener) counts: later calls change nothing. Calling this before
    /// [`serve`](Self::serve) makes `serve` shut down as soon as it starts.
    pub fn stop(&self, timeout: Duration) {
        if self.tracker.request_shutdown(Trigger::Stop, timeout) {
            tracing::info!(
                grace_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                "stop requested, initiating graceful shutdown"
            );
        } else {
            tracing::debug!("stop ignored, shutdown already in progress");
        }
    }

    /// Binds the configured address and serves on it.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::InvalidAddress`] or [`ServerError::Bind`]
    /// without engaging any shutdown machinery, and otherwise whatever
    /// [`serve`](Self::serve) returns.
    pub async fn listen_and_serve(&self) -> Result<(), ServerError> {
        let addr = self
            .config
            .socket_addr()
            .map_err(|e| ServerError::InvalidAddress {
                addr: self.config.http_addr().to_string(),
                reason: e.to_string(),
            })?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;

        self.serve(listener).await
    }

    /// Serves connections from `listener` until the server is stopped.
    ///
    /// Resolves only after the completion signal has been fulfilled.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::AlreadyServing`] if called more than once and
    /// [`ServerError::Accept`] if the accept loop failed on its own. The
    /// listener closing because of a shutdown is not an error.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        if self.serving.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyServing);
        }

        let grace = self.config.shutdown_timeout();
        let closed = Latch::new();
        let listener = Listener::new(listener, closed.clone());
        let addr = listener.local_addr().ok();
        let hook = self.tracker.hook(self.observer.clone());

        let watcher = self.interrupt_source().map(|source| {
            tracing::debug!(source = source.name(), "watching for interrupts");
            tokio::spawn(watch_interrupt(source, Arc::clone(&self.tracker), grace))
        });

        tracing::info!(
            addr = ?addr,
            grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
            policy = %self.tracker.policy(),
            "server started"
        );

        self.engine.set_keep_alives_enabled(self.config.keep_alive());
        self.engine.set_hijack_policy(self.tracker.policy());
        let accept = self.engine.serve(listener, hook);
        tokio::pin!(accept);

        let exited = tokio::select! {
            result = &mut accept => {
                if self.tracker.request_shutdown(Trigger::ListenerExit, grace) {
                    tracing::warn!("accept loop exited unexpectedly, initiating graceful shutdown");
                }
                Some(result)
            }
            () = self.tracker.shutdown_requested() => None,
        };

        self.engine.set_keep_alives_enabled(false);
        closed.fire();
        let accept_result = match exited {
            Some(result) => result,
            None => accept.await,
        };
        tracing::info!(live = self.tracker.live_connections(), "listener closed");
        self.engine.drain();

        if let Drain::Pending { grace, live } = self.tracker.begin_drain() {
            tracing::info!(
                live,
                grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
                "draining connections"
            );
            TimeoutEnforcer::new(grace)
                .enforce(&self.tracker, || self.engine.close())
                .await;
        }
        self.tracker.completion().wait().await;

        if let Some(watcher) = watcher {
            watcher.abort();
        }

        match accept_result {
            Ok(()) | Err(AcceptError::Closed) => Ok(()),
            Err(AcceptError::Io(e)) => {
                tracing::error!(error = %e, "server stopped after accept failure");
                Err(ServerError::Accept(e))
            }
        }
    }

    /// An explicitly configured source wins over OS signal handling.
    fn interrupt_source(&self) -> Option<InterruptSource> {
        let custom = self.interrupt.lock().take();
        custom.or_else(|| {
            self.config
                .handle_os_signals()
                .then(InterruptSource::os_signals)
        })
    }
}

impl<E> fmt::Debug for Server<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("state", &self.tracker.state())
            .field("live_connections", &self.tracker.live_connections())
            .finish_non_exhaustive()
    }
}

/// Builder for [`Server`].
pub struct ServerBuilder<E> {
    engine: E,
    config_builder: ServerConfigBuilder,
    observer: Option<ConnStateHook>,
    interrupt: Option<InterruptSource>,
}

impl<E: Engine> ServerBuilder<E> {
    /// Creates a builder with default settings.
    #[must_use]
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            config_builder: ServerConfigBuilder::new(),
            observer: None,
            interrupt: None,
        }
    }

    /// Replaces every configuration value with those from `config`.
    #[must_use]
    pub fn config(mut self, config: &ServerConfig) -> Self {
        self.config_builder = ServerConfigBuilder::new()
            .http_addr(config.http_addr())
            .shutdown_timeout(config.shutdown_timeout())
            .keep_alive(config.keep_alive())
            .handle_os_signals(config.handle_os_signals())
            .hijack_policy(config.hijack_policy());
        self
    }

    /// Sets the HTTP bind address.
    #[must_use]
    pub fn http_addr(mut self, addr: impl Into<String>) -> Self {
        self.config_builder = self.config_builder.http_addr(addr);
        self
    }

    /// Sets the default grace period.
    #[must_use]
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config_builder = self.config_builder.shutdown_timeout(timeout);
        self
    }

    /// Sets whether connections are kept alive between requests.
    #[must_use]
    pub fn keep_alive(mut self, enabled: bool) -> Self {
        self.config_builder = self.config_builder.keep_alive(enabled);
        self
    }

    /// Starts shutdown on SIGINT or SIGTERM.
    #[must_use]
    pub fn handle_os_signals(mut self, enabled: bool) -> Self {
        self.config_builder = self.config_builder.handle_os_signals(enabled);
        self
    }

    /// Sets the hijack policy.
    #[must_use]
    pub fn hijack_policy(mut self, policy: HijackPolicy) -> Self {
        self.config_builder = self.config_builder.hijack_policy(policy);
        self
    }

    /// Installs an observer that sees every connection transition after the
    /// server has recorded it.
    #[must_use]
    pub fn on_conn_state<F>(mut self, observer: F) -> Self
    where
        F: Fn(&ConnInfo, ConnState) + Send + Sync + 'static,
    {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// Uses `source` as the interrupt trigger instead of OS signals.
    #[must_use]
    pub fn interrupt(mut self, source: InterruptSource) -> Self {
        self.interrupt = Some(source);
        self
    }

    /// Builds the [`Server`].
    #[must_use]
    pub fn build(self) -> Server<E> {
        let mut server = Server::new(self.engine, self.config_builder.build());
        server.observer = self.observer;
        server.interrupt = Mutex::new(self.interrupt);
        server
    }
}

impl<E> fmt::Debug for ServerBuilder<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("config_builder", &self.config_builder)
            .field("observer", &self.observer.is_some())
            .field("interrupt", &self.interrupt)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::ConnId;
    use std::future::Future;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;
    use tokio::sync::oneshot;

    /// Engine that accepts nothing; tests drive connection events through
    /// the hook it captures.
    #[derive(Default)]
    struct FakeEngine {
        hook: Mutex<Option<ConnStateHook>>,
        failure: Mutex<Option<io::Error>>,
        keep_alives_disabled: AtomicBool,
        policy: Mutex<Option<HijackPolicy>>,
        drains: AtomicUsize,
        closes: AtomicUsize,
    }

    impl FakeEngine {
        fn failing(error: io::Error) -> Self {
            let engine = Self::default();
            *engine.failure.lock() = Some(error);
            engine
        }

        fn emit(&self, id: u64, state: ConnState) {
            let hook = self.hook.lock().clone().expect("engine is serving");
            let info = ConnInfo::new(ConnId::new(id), "127.0.0.1:5000".parse().unwrap());
            hook(&info, state);
        }
    }

    impl Engine for FakeEngine {
        fn serve(
            &self,
            listener: Listener,
            hook: ConnStateHook,
        ) -> impl Future<Output = Result<(), AcceptError>> + Send + 'static {
            *self.hook.lock() = Some(hook);
            let failure = self.failure.lock().take();
            async move {
                if let Some(e) = failure {
                    return Err(AcceptError::Io(e));
                }
                loop {
                    listener.accept().await?;
                }
            }
        }

        fn set_keep_alives_enabled(&self, enabled: bool) {
            self.keep_alives_disabled.store(!enabled, Ordering::SeqCst);
        }

        fn set_hijack_policy(&self, policy: HijackPolicy) {
            *self.policy.lock() = Some(policy);
        }

        fn drain(&self) {
            self.drains.fetch_add(1, Ordering::SeqCst);
        }

        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn local_listener() -> TcpListener {
        TcpListener::bind("127.0.0.1:0").await.unwrap()
    }

    fn spawn_serve(
        server: &Arc<Server<FakeEngine>>,
    ) -> tokio::task::JoinHandle<Result<(), ServerError>> {
        let server = Arc::clone(server);
        tokio::spawn(async move {
            let listener = local_listener().await;
            server.serve(listener).await
        })
    }

    async fn wait_until_serving(server: &Server<FakeEngine>) {
        for _ in 0..100 {
            if server.engine().hook.lock().is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("server never started serving");
    }

    #[test]
    fn test_server_builder() {
        let server = Server::builder(FakeEngine::default())
            .http_addr("127.0.0.1:9090")
            .shutdown_timeout(Duration::from_secs(60))
            .hijack_policy(HijackPolicy::Retain)
            .build();

        assert_eq!(server.config().http_addr(), "127.0.0.1:9090");
        assert_eq!(server.config().shutdown_timeout(), Duration::from_secs(60));
        assert_eq!(server.state(), ShutdownState::Running);
        assert_eq!(server.live_connections(), 0);
    }

    #[test]
    fn test_stop_signal_is_stable() {
        let server = Server::new(FakeEngine::default(), ServerConfig::default());
        assert!(server.stop_signal().same_as(&server.stop_signal()));
        assert!(!server.stop_signal().is_complete());
    }

    #[tokio::test]
    async fn test_stop_with_no_connections() {
        let server = Arc::new(Server::new(FakeEngine::default(), ServerConfig::default()));
        let handle = spawn_serve(&server);
        wait_until_serving(&server).await;

        server.stop(Duration::from_secs(5));
        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("serve should return promptly")
            .unwrap();

        assert!(result.is_ok());
        assert_eq!(server.state(), ShutdownState::Stopped);
        assert!(server.stop_signal().is_complete());
        assert!(server.engine().keep_alives_disabled.load(Ordering::SeqCst));
        assert_eq!(server.engine().drains.load(Ordering::SeqCst), 1);
        assert_eq!(server.engine().closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_engine_settings_applied_before_serving() {
        let server = Arc::new(
            Server::builder(FakeEngine::default())
                .keep_alive(false)
                .hijack_policy(HijackPolicy::Retain)
                .build(),
        );
        assert!(!server.config().keep_alive());

        let handle = spawn_serve(&server);
        wait_until_serving(&server).await;

        assert!(server.engine().keep_alives_disabled.load(Ordering::SeqCst));
        assert_eq!(*server.engine().policy.lock(), Some(HijackPolicy::Retain));
        assert_eq!(server.engine().drains.load(Ordering::SeqCst), 0);

        server.stop(Duration::from_secs(1));
        handle.await.unwrap().unwrap();
        assert_eq!(server.engine().drains.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_keep_alives_stay_on_while_running() {
        let server = Arc::new(Server::new(FakeEngine::default(), ServerConfig::default()));
        server.engine().set_keep_alives_enabled(false);

        let handle = spawn_serve(&server);
        wait_until_serving(&server).await;
        assert!(!server.engine().keep_alives_disabled.load(Ordering::SeqCst));
        assert_eq!(*server.engine().policy.lock(), Some(HijackPolicy::Release));

        server.stop(Duration::from_secs(1));
        handle.await.unwrap().unwrap();
        assert!(server.engine().keep_alives_disabled.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_stop_before_serve() {
        let server = Arc::new(Server::new(FakeEngine::default(), ServerConfig::default()));
        server.stop(Duration::from_secs(5));
        assert!(!server.stop_signal().is_complete());

        let result = tokio::time::timeout(Duration::from_secs(1), spawn_serve(&server))
            .await
            .expect("serve should return promptly")
            .unwrap();
        assert!(result.is_ok());
        assert!(server.stop_signal().is_complete());
    }

    #[tokio::test]
    async fn test_drain_completes_on_last_close() {
        let server = Arc::new(Server::new(FakeEngine::default(), ServerConfig::default()));
        let handle = spawn_serve(&server);
        wait_until_serving(&server).await;

        server.engine().emit(1, ConnState::New);
        server.engine().emit(2, ConnState::New);
        server.engine().emit(2, ConnState::Active);
        assert_eq!(server.live_connections(), 2);

        server.stop(Duration::from_secs(10));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(server.state(), ShutdownState::ShuttingDown);

        server.engine().emit(1, ConnState::Closed);
        assert!(!server.stop_signal().is_complete());
        server.engine().emit(2, ConnState::Closed);

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("serve should return after the last close")
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(server.engine().closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_timeout_forces_close() {
        let server = Arc::new(Server::new(FakeEngine::default(), ServerConfig::default()));
        let handle = spawn_serve(&server);
        wait_until_serving(&server).await;
        server.engine().emit(1, ConnState::New);

        let start = Instant::now();
        server.stop(Duration::from_millis(50));
        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("serve should return at the deadline")
            .unwrap();

        assert!(result.is_ok());
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(server.engine().closes.load(Ordering::SeqCst), 1);
        assert_eq!(server.state(), ShutdownState::Stopped);
    }

    #[tokio::test]
    async fn test_first_stop_wins() {
        let server = Arc::new(Server::new(FakeEngine::default(), ServerConfig::default()));
        let handle = spawn_serve(&server);
        wait_until_serving(&server).await;
        server.engine().emit(1, ConnState::New);

        let start = Instant::now();
        server.stop(Duration::from_millis(50));
        server.stop(Duration::from_secs(30));

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("the first grace period should govern")
            .unwrap()
            .unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(server.engine().closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_accept_failure_drains_then_errors() {
        let server = Arc::new(Server::new(
            FakeEngine::failing(io::Error::other("socket gone")),
            ServerConfig::builder()
                .shutdown_timeout(Duration::from_millis(50))
                .build(),
        ));

        let result = tokio::time::timeout(Duration::from_secs(1), spawn_serve(&server))
            .await
            .expect("serve should return")
            .unwrap();

        assert!(matches!(result, Err(ServerError::Accept(_))));
        assert_eq!(server.state(), ShutdownState::Stopped);
        assert_eq!(server.tracker.trigger(), Some(Trigger::ListenerExit));
        assert!(server.stop_signal().is_complete());
    }

    #[tokio::test]
    async fn test_second_serve_is_rejected() {
        let server = Arc::new(Server::new(FakeEngine::default(), ServerConfig::default()));
        let handle = spawn_serve(&server);
        wait_until_serving(&server).await;

        let second = server.serve(local_listener().await).await;
        assert!(matches!(second, Err(ServerError::AlreadyServing)));

        server.stop(Duration::from_secs(1));
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_interrupt_source_triggers_shutdown() {
        let (tx, rx) = oneshot::channel::<()>();
        let server = Arc::new(
            Server::builder(FakeEngine::default())
                .interrupt(InterruptSource::new(async move {
                    let _ = rx.await;
                }))
                .build(),
        );
        let handle = spawn_serve(&server);
        wait_until_serving(&server).await;

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("interrupt should stop the server")
            .unwrap()
            .unwrap();
        assert_eq!(server.tracker.trigger(), Some(Trigger::Interrupt));
    }

    #[tokio::test]
    async fn test_observer_sees_every_event() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let server = Arc::new(
            Server::builder(FakeEngine::default())
                .on_conn_state(move |info, state| sink.lock().push((info.id(), state)))
                .build(),
        );
        let handle = spawn_serve(&server);
        wait_until_serving(&server).await;

        server.engine().emit(7, ConnState::New);
        server.engine().emit(7, ConnState::Active);
        server.engine().emit(7, ConnState::Idle);
        server.engine().emit(7, ConnState::Closed);
        server.stop(Duration::from_secs(1));
        handle.await.unwrap().unwrap();

        let states: Vec<ConnState> = seen.lock().iter().map(|(_, s)| *s).collect();
        assert_eq!(
            states,
            vec![ConnState::New, ConnState::Active, ConnState::Idle, ConnState::Closed]
        );
    }

    #[tokio::test]
    async fn test_listen_and_serve_setup_errors() {
        let server = Server::builder(FakeEngine::default())
            .http_addr("not-an-address")
            .build();
        assert!(matches!(
            server.listen_and_serve().await,
            Err(ServerError::InvalidAddress { .. })
        ));

        let taken = local_listener().await;
        let addr = taken.local_addr().unwrap();
        let server = Server::builder(FakeEngine::default())
            .http_addr(addr.to_string())
            .build();
        assert!(matches!(
            server.listen_and_serve().await,
            Err(ServerError::Bind { .. })
        ));
        assert_eq!(server.state(), ShutdownState::Running);
    }
}
