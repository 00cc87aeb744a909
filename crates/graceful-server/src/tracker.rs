//! Live-connection tracking and the shutdown state machine.
//!
//! [`ConnectionTracker`] owns the only shared mutable state of a server: the
//! set of live connections and the current [`ShutdownState`]. Both sit behind
//! one mutex so that "the last connection closed" and "shutdown was
//! requested" can never be observed out of order.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use graceful_server::{ConnId, ConnInfo, ConnState, ConnectionTracker, HijackPolicy, Trigger};
//!
//! let tracker = ConnectionTracker::new(HijackPolicy::Release);
//! let conn = ConnInfo::new(ConnId::new(1), "127.0.0.1:4000".parse().unwrap());
//!
//! tracker.observe(&conn, ConnState::New);
//! assert_eq!(tracker.live_connections(), 1);
//!
//! assert!(tracker.request_shutdown(Trigger::Stop, Duration::from_secs(5)));
//! assert!(!tracker.request_shutdown(Trigger::Interrupt, Duration::from_secs(1)));
//!
//! tracker.observe(&conn, ConnState::Closed);
//! assert!(tracker.is_idle());
//! ```

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::conn::{ConnId, ConnInfo, ConnState, ConnStateHook, HijackPolicy};
use crate::signal::{CompletionSignal, Latch};
use crate::state::{ShutdownState, StopReason, Trigger};

/// Outcome of arming the drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drain {
    /// Nothing left to wait for; the server is stopped.
    Complete,
    /// Connections are still open.
    Pending {
        /// Effective grace period for this shutdown.
        grace: Duration,
        /// Live connections when the drain was armed.
        live: usize,
    },
}

#[derive(Debug, Default)]
struct TrackerState {
    phase: ShutdownState,
    live: HashSet<ConnId>,
    /// Set once the listener is closed; only then may an empty live set
    /// finish the shutdown.
    draining: bool,
    grace: Duration,
    trigger: Option<Trigger>,
    requested_at: Option<Instant>,
    reason: Option<StopReason>,
}

/// Counts live connections and sequences the shutdown.
#[derive(Debug)]
pub struct ConnectionTracker {
    state: Mutex<TrackerState>,
    policy: HijackPolicy,
    requested: Latch,
    completion: CompletionSignal,
}

impl ConnectionTracker {
    /// Creates a tracker in the `Running` state with no connections.
    #[must_use]
    pub fn new(policy: HijackPolicy) -> Self {
        Self {
            state: Mutex::new(TrackerState::default()),
            policy,
            requested: Latch::new(),
            completion: CompletionSignal::new(),
        }
    }

    /// Builds the hook handed to the serving engine.
    ///
    /// Every event updates the tracker first and is then forwarded,
    /// unmodified, to `observer`.
    pub fn hook(self: &Arc<Self>, observer: Option<ConnStateHook>) -> ConnStateHook {
        let tracker = Arc::clone(self);
        Arc::new(move |info: &ConnInfo, state: ConnState| {
            tracker.observe(info, state);
            if let Some(observer) = &observer {
                observer(info, state);
            }
        })
    }

    /// Records a connection-state transition.
    pub fn observe(&self, info: &ConnInfo, state: ConnState) {
        let (live, drained) = {
            let mut st = self.state.lock();
            let removed = match state {
                ConnState::New | ConnState::Active => {
                    st.live.insert(info.id());
                    false
                }
                ConnState::Idle => false,
                ConnState::Hijacked if self.policy == HijackPolicy::Retain => false,
                ConnState::Hijacked | ConnState::Closed => st.live.remove(&info.id()),
            };
            let drained = removed
                && st.live.is_empty()
                && st.draining
                && st.phase == ShutdownState::ShuttingDown;
            (st.live.len(), drained)
        };

        graceful_telemetry::metrics::record_connection_state(state.as_str());
        graceful_telemetry::metrics::set_live_connections(live);
        tracing::trace!(conn_id = %info.id(), state = %state, live, "connection state changed");

        if drained {
            self.finish(StopReason::Drained, || {});
        }
    }

    /// Returns the number of live connections.
    #[must_use]
    pub fn live_connections(&self) -> usize {
        self.state.lock().live.len()
    }

    /// Returns `true` when no connection is live.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.state.lock().live.is_empty()
    }

    /// Returns the current shutdown state.
    #[must_use]
    pub fn state(&self) -> ShutdownState {
        self.state.lock().phase
    }

    /// Returns the hijack policy.
    #[must_use]
    pub fn policy(&self) -> HijackPolicy {
        self.policy
    }

    /// Returns the trigger that started the shutdown, if any.
    #[must_use]
    pub fn trigger(&self) -> Option<Trigger> {
        self.state.lock().trigger
    }

    /// Returns why the shutdown finished, once it has.
    #[must_use]
    pub fn stop_reason(&self) -> Option<StopReason> {
        self.state.lock().reason
    }

    /// Moves `Running` to `ShuttingDown` with the given grace period.
    ///
    /// Returns `false` if shutdown was already requested; the call then has
    /// no effect at all, including on the grace period.
    pub fn request_shutdown(&self, trigger: Trigger, grace: Duration) -> bool {
        {
            let mut st = self.state.lock();
            if st.phase != ShutdownState::Running {
                return false;
            }
            st.phase = ShutdownState::ShuttingDown;
            st.grace = grace;
            st.trigger = Some(trigger);
            st.requested_at = Some(Instant::now());
        }
        self.requested.fire();
        true
    }

    /// Returns `true` once shutdown has been requested.
    #[must_use]
    pub fn is_shutdown_requested(&self) -> bool {
        self.requested.is_fired()
    }

    /// Completes once shutdown has been requested.
    pub fn shutdown_requested(&self) -> impl Future<Output = ()> + Send + 'static {
        self.requested.wait()
    }

    /// Arms the drain after the listener has been closed.
    ///
    /// If nothing is live the server stops right away.
    pub fn begin_drain(&self) -> Drain {
        let pending = {
            let mut st = self.state.lock();
            if st.phase != ShutdownState::ShuttingDown {
                return Drain::Complete;
            }
            st.draining = true;
            if st.live.is_empty() {
                None
            } else {
                Some(Drain::Pending {
                    grace: st.grace,
                    live: st.live.len(),
                })
            }
        };

        match pending {
            Some(pending) => pending,
            None => {
                self.finish(StopReason::Drained, || {});
                Drain::Complete
            }
        }
    }

    /// Moves `ShuttingDown` to `Stopped`.
    ///
    /// Only the first caller performs the transition: it runs `before_signal`
    /// and then completes the [`CompletionSignal`]. Everyone else gets
    /// `false` and nothing runs.
    pub fn finish(&self, reason: StopReason, before_signal: impl FnOnce()) -> bool {
        let (trigger, requested_at, live) = {
            let mut st = self.state.lock();
            if st.phase != ShutdownState::ShuttingDown {
                return false;
            }
            st.phase = ShutdownState::Stopped;
            st.reason = Some(reason);
            (st.trigger, st.requested_at, st.live.len())
        };

        before_signal();

        let elapsed = requested_at.map(|at| at.elapsed()).unwrap_or_default();
        let trigger = trigger.map_or("unknown", Trigger::as_str);
        graceful_telemetry::metrics::record_shutdown(trigger, reason.as_str(), elapsed);
        tracing::info!(
            trigger,
            reason = %reason,
            remaining = live,
            elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            "shutdown complete"
        );

        self.completion.complete();
        true
    }

    /// Returns the completion signal.
    #[must_use]
    pub fn completion(&self) -> CompletionSignal {
        self.completion.clone()
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new(HijackPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn conn(id: u64) -> ConnInfo {
        ConnInfo::new(ConnId::new(id), "127.0.0.1:9000".parse().unwrap())
    }

    fn grace() -> Duration {
        Duration::from_secs(5)
    }

    #[test]
    fn test_tracker_new() {
        let tracker = ConnectionTracker::default();
        assert_eq!(tracker.live_connections(), 0);
        assert!(tracker.is_idle());
        assert_eq!(tracker.state(), ShutdownState::Running);
        assert!(tracker.trigger().is_none());
    }

    #[test]
    fn test_tracker_counts_open_and_close() {
        let tracker = ConnectionTracker::default();
        tracker.observe(&conn(1), ConnState::New);
        tracker.observe(&conn(2), ConnState::New);
        tracker.observe(&conn(1), ConnState::Active);
        assert_eq!(tracker.live_connections(), 2);

        tracker.observe(&conn(1), ConnState::Idle);
        assert_eq!(tracker.live_connections(), 2);

        tracker.observe(&conn(1), ConnState::Closed);
        assert_eq!(tracker.live_connections(), 1);

        tracker.observe(&conn(2), ConnState::Closed);
        assert!(tracker.is_idle());
    }

    #[test]
    fn test_tracker_ignores_unknown_close() {
        let tracker = ConnectionTracker::default();
        tracker.observe(&conn(1), ConnState::New);
        tracker.observe(&conn(99), ConnState::Closed);
        tracker.observe(&conn(1), ConnState::Closed);
        tracker.observe(&conn(1), ConnState::Closed);
        assert_eq!(tracker.live_connections(), 0);
    }

    #[test]
    fn test_tracker_hijack_release() {
        let tracker = ConnectionTracker::new(HijackPolicy::Release);
        tracker.observe(&conn(1), ConnState::New);
        tracker.observe(&conn(1), ConnState::Hijacked);
        assert!(tracker.is_idle());
    }

    #[test]
    fn test_tracker_hijack_retain() {
        let tracker = ConnectionTracker::new(HijackPolicy::Retain);
        tracker.observe(&conn(1), ConnState::New);
        tracker.observe(&conn(1), ConnState::Hijacked);
        assert_eq!(tracker.live_connections(), 1);

        tracker.observe(&conn(1), ConnState::Closed);
        assert!(tracker.is_idle());
    }

    #[test]
    fn test_request_shutdown_first_wins() {
        let tracker = ConnectionTracker::default();
        assert!(tracker.request_shutdown(Trigger::Interrupt, Duration::from_secs(30)));
        assert!(!tracker.request_shutdown(Trigger::Stop, Duration::from_millis(1)));
        assert_eq!(tracker.trigger(), Some(Trigger::Interrupt));
        assert_eq!(tracker.state(), ShutdownState::ShuttingDown);

        tracker.observe(&conn(1), ConnState::New);
        assert_eq!(
            tracker.begin_drain(),
            Drain::Pending {
                grace: Duration::from_secs(30),
                live: 1
            }
        );
    }

    #[test]
    fn test_begin_drain_with_no_connections_stops() {
        let tracker = ConnectionTracker::default();
        tracker.request_shutdown(Trigger::Stop, grace());

        assert_eq!(tracker.begin_drain(), Drain::Complete);
        assert_eq!(tracker.state(), ShutdownState::Stopped);
        assert!(tracker.completion().is_complete());
    }

    #[test]
    fn test_begin_drain_before_request_is_noop() {
        let tracker = ConnectionTracker::default();
        assert_eq!(tracker.begin_drain(), Drain::Complete);
        assert_eq!(tracker.state(), ShutdownState::Running);
        assert!(!tracker.completion().is_complete());
    }

    #[test]
    fn test_close_before_drain_armed_does_not_stop() {
        let tracker = ConnectionTracker::default();
        tracker.observe(&conn(1), ConnState::New);
        tracker.request_shutdown(Trigger::Stop, grace());

        tracker.observe(&conn(1), ConnState::Closed);
        assert_eq!(tracker.state(), ShutdownState::ShuttingDown);
        assert!(!tracker.completion().is_complete());

        assert_eq!(tracker.begin_drain(), Drain::Complete);
        assert_eq!(tracker.state(), ShutdownState::Stopped);
    }

    #[test]
    fn test_last_close_finishes_drain() {
        let tracker = ConnectionTracker::default();
        tracker.observe(&conn(1), ConnState::New);
        tracker.observe(&conn(2), ConnState::New);
        tracker.request_shutdown(Trigger::Stop, grace());
        tracker.begin_drain();

        tracker.observe(&conn(1), ConnState::Closed);
        assert!(!tracker.completion().is_complete());

        tracker.observe(&conn(2), ConnState::Closed);
        assert!(tracker.completion().is_complete());
        assert_eq!(tracker.state(), ShutdownState::Stopped);
    }

    #[test]
    fn test_close_while_running_does_not_complete() {
        let tracker = ConnectionTracker::default();
        tracker.observe(&conn(1), ConnState::New);
        tracker.observe(&conn(1), ConnState::Closed);
        assert!(!tracker.completion().is_complete());
        assert_eq!(tracker.state(), ShutdownState::Running);
    }

    #[test]
    fn test_finish_runs_once() {
        let tracker = ConnectionTracker::default();
        let calls = AtomicUsize::new(0);
        tracker.observe(&conn(1), ConnState::New);
        tracker.request_shutdown(Trigger::Stop, grace());
        tracker.begin_drain();

        assert!(tracker.finish(StopReason::TimedOut, || {
            calls.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(!tracker.finish(StopReason::TimedOut, || {
            calls.fetch_add(1, Ordering::SeqCst);
        }));
        tracker.observe(&conn(1), ConnState::Closed);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.state(), ShutdownState::Stopped);
    }

    #[test]
    fn test_finish_requires_shutting_down() {
        let tracker = ConnectionTracker::default();
        assert!(!tracker.finish(StopReason::Drained, || {}));
        assert!(!tracker.completion().is_complete());
    }

    #[test]
    fn test_hook_updates_before_forwarding() {
        let tracker = Arc::new(ConnectionTracker::default());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let observer_tracker = Arc::clone(&tracker);
        let observer_seen = Arc::clone(&seen);
        let observer: ConnStateHook = Arc::new(move |info: &ConnInfo, state: ConnState| {
            observer_seen
                .lock()
                .push((info.id(), state, observer_tracker.live_connections()));
        });

        let hook = tracker.hook(Some(observer));
        hook(&conn(1), ConnState::New);
        hook(&conn(1), ConnState::Active);
        hook(&conn(1), ConnState::Closed);

        let seen = seen.lock();
        assert_eq!(
            *seen,
            vec![
                (ConnId::new(1), ConnState::New, 1),
                (ConnId::new(1), ConnState::Active, 1),
                (ConnId::new(1), ConnState::Closed, 0),
            ]
        );
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let tracker = Arc::new(ConnectionTracker::default());
        let threads: Vec<_> = (0..8u64)
            .map(|t| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || {
                    for i in 0..500u64 {
                        let info = conn(t * 1_000 + i);
                        tracker.observe(&info, ConnState::New);
                        tracker.observe(&info, ConnState::Active);
                        tracker.observe(&info, ConnState::Closed);
                    }
                })
            })
            .collect();

        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(tracker.live_connections(), 0);
    }

    #[test]
    fn test_stop_reason_recorded_once() {
        let tracker = ConnectionTracker::default();
        tracker.observe(&conn(1), ConnState::New);
        assert_eq!(tracker.stop_reason(), None);

        tracker.request_shutdown(Trigger::Stop, grace());
        assert!(matches!(tracker.begin_drain(), Drain::Pending { live: 1, .. }));
        assert!(tracker.finish(StopReason::TimedOut, || {}));

        tracker.observe(&conn(1), ConnState::Closed);
        assert!(!tracker.finish(StopReason::Drained, || {}));
        assert_eq!(tracker.stop_reason(), Some(StopReason::TimedOut));
    }

    #[test]
    fn test_concurrent_drain_completes_once() {
        let tracker = Arc::new(ConnectionTracker::default());
        for id in 0..64 {
            tracker.observe(&conn(id), ConnState::New);
        }
        tracker.request_shutdown(Trigger::Interrupt, grace());
        assert!(matches!(tracker.begin_drain(), Drain::Pending { live: 64, .. }));

        let signalled = Arc::new(AtomicUsize::new(0));
        let closers: Vec<_> = (0..64)
            .map(|id| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || tracker.observe(&conn(id), ConnState::Closed))
            })
            .collect();
        let timers: Vec<_> = (0..4)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                let signalled = Arc::clone(&signalled);
                std::thread::spawn(move || {
                    tracker.finish(StopReason::TimedOut, || {
                        signalled.fetch_add(1, Ordering::SeqCst);
                    })
                })
            })
            .collect();

        for closer in closers {
            closer.join().unwrap();
        }
        let timer_wins = timers
            .into_iter()
            .map(|timer| timer.join().unwrap())
            .filter(|won| *won)
            .count();

        let drained = usize::from(tracker.stop_reason() == Some(StopReason::Drained));
        assert_eq!(timer_wins + drained, 1);
        assert_eq!(signalled.load(Ordering::SeqCst), timer_wins);
        if timer_wins == 1 {
            assert_eq!(tracker.stop_reason(), Some(StopReason::TimedOut));
        }
        assert_eq!(tracker.state(), ShutdownState::Stopped);
        assert!(tracker.completion().is_complete());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Event {
            Open(u64),
            Close(u64),
            Hijack(u64),
        }

        fn event() -> impl Strategy<Value = Event> {
            prop_oneof![
                (0..16u64).prop_map(Event::Open),
                (0..16u64).prop_map(Event::Close),
                (0..16u64).prop_map(Event::Hijack),
            ]
        }

        proptest! {
            #[test]
            fn live_count_matches_model(events in proptest::collection::vec(event(), 0..200)) {
                let tracker = ConnectionTracker::new(HijackPolicy::Release);
                let mut model = HashSet::new();

                for event in events {
                    match event {
                        Event::Open(id) => {
                            tracker.observe(&conn(id), ConnState::New);
                            model.insert(id);
                        }
                        Event::Close(id) => {
                            tracker.observe(&conn(id), ConnState::Closed);
                            model.remove(&id);
                        }
                        Event::Hijack(id) => {
                            tracker.observe(&conn(id), ConnState::Hijacked);
                            model.remove(&id);
                        }
                    }
                    prop_assert_eq!(tracker.live_connections(), model.len());
                }
            }

            #[test]
            fn stopped_only_after_drain(opens in 1..32u64) {
                let tracker = ConnectionTracker::default();
                for id in 0..opens {
                    tracker.observe(&conn(id), ConnState::New);
                }
                tracker.request_shutdown(Trigger::Stop, grace());
                tracker.begin_drain();

                for id in 0..opens {
                    prop_assert!(!tracker.completion().is_complete());
                    tracker.observe(&conn(id), ConnState::Closed);
                }
                prop_assert!(tracker.completion().is_complete());
            }
        }
    }
}
