//! Pending request tracking and network-idle detection.
//!
//! [`PendingRequestTracker`] owns the set of in-flight request ids for one
//! capture session. It is mutated only through [`dispatched`] and
//! [`settled`]; each call emits a [`ProgressEvent`] to the progress callback,
//! and a settle that empties the set records an Active→Idle *drain*.
//!
//! The capture is network-complete once at least one drain has happened and
//! no new request has been dispatched for a full quiet period; see
//! [`PendingRequestTracker::wait_for_completion`].
//!
//! [`dispatched`]: PendingRequestTracker::dispatched
//! [`settled`]: PendingRequestTracker::settled

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, trace};

/// Identifier of a single outbound request within a session.
pub type RequestId = u64;

/// Callback receiving every progress event, in dispatch/settle order.
///
/// Invoked synchronously while the tracker is updating, so it must not call
/// back into the tracker.
pub type ProgressCallback = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

/// Network activity state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerState {
    /// Nothing in flight.
    Idle,
    /// At least one request in flight.
    Active,
}

/// How a request left the pending set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// The response arrived.
    Completed,
    /// The request failed or was abandoned.
    Failed,
}

/// Incremental progress emitted on every dispatch and settle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    /// Requests currently in flight.
    pub pending_count: usize,
    /// Requests dispatched so far.
    pub dispatched: u64,
    /// Requests that completed so far.
    pub completed: u64,
    /// Requests that failed so far.
    pub failed: u64,
    /// State after this transition.
    pub state: TrackerState,
}

/// Result of waiting for network completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionReport {
    /// When the first Active→Idle transition happened.
    pub first_drain_at: Instant,
    /// When the quiet period ended and the capture was declared complete.
    pub completed_at: Instant,
    /// Number of Active→Idle transitions observed.
    pub drains: u64,
    /// Requests dispatched over the session.
    pub dispatched: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Snapshot {
    state: TrackerState,
    drains: u64,
    dispatched: u64,
    first_drain_at: Option<Instant>,
}

#[derive(Debug)]
struct Inner {
    pending: HashSet<RequestId>,
    state: TrackerState,
    dispatched: u64,
    completed: u64,
    failed: u64,
    drains: u64,
    first_drain_at: Option<Instant>,
}

impl Inner {
    fn progress(&self) -> ProgressEvent {
        ProgressEvent {
            pending_count: self.pending.len(),
            dispatched: self.dispatched,
            completed: self.completed,
            failed: self.failed,
            state: self.state,
        }
    }

    const fn snapshot(&self) -> Snapshot {
        Snapshot {
            state: self.state,
            drains: self.drains,
            dispatched: self.dispatched,
            first_drain_at: self.first_drain_at,
        }
    }
}

/// Tracks in-flight requests for one capture session.
pub struct PendingRequestTracker {
    inner: Mutex<Inner>,
    progress: Option<ProgressCallback>,
    changes: watch::Sender<Snapshot>,
}

impl Default for PendingRequestTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingRequestTracker {
    /// Create an idle tracker with no progress callback.
    #[must_use]
    pub fn new() -> Self {
        let inner = Inner {
            pending: HashSet::new(),
            state: TrackerState::Idle,
            dispatched: 0,
            completed: 0,
            failed: 0,
            drains: 0,
            first_drain_at: None,
        };
        let (changes, _) = watch::channel(inner.snapshot());
        Self {
            inner: Mutex::new(inner),
            progress: None,
            changes,
        }
    }

    /// Set the progress callback.
    #[must_use]
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Record a dispatched request. Returns `false` if the id is already pending.
    pub fn dispatched(&self, id: RequestId) -> bool {
        let mut inner = self.inner.lock();
        if !inner.pending.insert(id) {
            debug!(id, "request dispatched twice, ignoring");
            return false;
        }
        inner.dispatched += 1;
        inner.state = TrackerState::Active;
        trace!(id, pending = inner.pending.len(), "request dispatched");
        self.publish(&inner);
        true
    }

    /// Record a settled request. Returns `false` if the id was not pending.
    ///
    /// Settling the last pending request transitions to `Idle` and counts as a drain.
    pub fn settled(&self, id: RequestId, settlement: Settlement) -> bool {
        let mut inner = self.inner.lock();
        if !inner.pending.remove(&id) {
            debug!(id, "settle for unknown request, ignoring");
            return false;
        }
        match settlement {
            Settlement::Completed => inner.completed += 1,
            Settlement::Failed => inner.failed += 1,
        }
        if inner.pending.is_empty() {
            inner.state = TrackerState::Idle;
            inner.drains += 1;
            if inner.first_drain_at.is_none() {
                inner.first_drain_at = Some(Instant::now());
            }
            debug!(drains = inner.drains, "network idle");
        }
        trace!(id, pending = inner.pending.len(), "request settled");
        self.publish(&inner);
        true
    }

    fn publish(&self, inner: &Inner) {
        if let Some(callback) = &self.progress {
            callback(&inner.progress());
        }
        self.changes.send_replace(inner.snapshot());
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> TrackerState {
        self.inner.lock().state
    }

    /// Requests currently in flight.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Latest progress figures.
    #[must_use]
    pub fn progress(&self) -> ProgressEvent {
        self.inner.lock().progress()
    }

    /// Number of Active→Idle transitions so far.
    #[must_use]
    pub fn drains(&self) -> u64 {
        self.inner.lock().drains
    }

    /// Wait until the completion policy is satisfied.
    ///
    /// Completes once the tracker has drained at least once and then stayed
    /// idle, with no new dispatch, for `quiet_period`. Any activity during the
    /// quiet period restarts the wait. Bound the wait with a timeout; a page
    /// that never issues a request never completes.
    pub async fn wait_for_completion(&self, quiet_period: Duration) -> CompletionReport {
        let mut changes = self.changes.subscribe();
        loop {
            let snapshot = *changes.borrow_and_update();
            let first_drain_at = match snapshot.first_drain_at {
                Some(at) if snapshot.state == TrackerState::Idle && snapshot.drains > 0 => at,
                _ => {
                    if changes.changed().await.is_err() {
                        // Sender lives as long as `self`; unreachable while borrowed.
                        std::future::pending::<()>().await;
                    }
                    continue;
                },
            };

            if tokio::time::timeout(quiet_period, changes.changed())
                .await
                .is_err()
            {
                return CompletionReport {
                    first_drain_at,
                    completed_at: Instant::now(),
                    drains: snapshot.drains,
                    dispatched: snapshot.dispatched,
                };
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn recording_tracker() -> (PendingRequestTracker, Arc<Mutex<Vec<ProgressEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let tracker = PendingRequestTracker::new()
            .with_progress(Arc::new(move |event: &ProgressEvent| sink.lock().push(*event)));
        (tracker, events)
    }

    #[test]
    fn test_dispatch_and_settle_transitions() {
        let (tracker, events) = recording_tracker();
        assert_eq!(tracker.state(), TrackerState::Idle);

        tracker.dispatched(1);
        tracker.dispatched(2);
        assert_eq!(tracker.state(), TrackerState::Active);

        tracker.settled(1, Settlement::Completed);
        assert_eq!(tracker.state(), TrackerState::Active);
        tracker.settled(2, Settlement::Failed);
        assert_eq!(tracker.state(), TrackerState::Idle);
        assert_eq!(tracker.drains(), 1);

        let counts: Vec<usize> = events.lock().iter().map(|e| e.pending_count).collect();
        assert_eq!(counts, vec![1, 2, 1, 0]);
        let last = events.lock().last().copied().unwrap();
        assert_eq!(last.completed, 1);
        assert_eq!(last.failed, 1);
        assert_eq!(last.state, TrackerState::Idle);
    }

    #[test]
    fn test_requests_leave_the_set_exactly_once() {
        let (tracker, events) = recording_tracker();
        assert!(tracker.dispatched(7));
        assert!(!tracker.dispatched(7));
        assert!(tracker.settled(7, Settlement::Completed));
        assert!(!tracker.settled(7, Settlement::Completed));
        assert!(!tracker.settled(99, Settlement::Failed));

        assert_eq!(events.lock().len(), 2);
        assert_eq!(tracker.drains(), 1);
    }

    #[tokio::test]
    async fn test_initial_idle_does_not_complete() {
        let tracker = PendingRequestTracker::new();
        let waited =
            tokio::time::timeout(Duration::from_millis(100), tracker.wait_for_completion(Duration::from_millis(10)))
                .await;
        assert!(waited.is_err(), "zero observed requests must not count as complete");
    }

    #[tokio::test]
    async fn test_completion_after_drain_and_quiet_period() {
        let tracker = Arc::new(PendingRequestTracker::new());
        tracker.dispatched(1);

        let waiter = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move { tracker.wait_for_completion(Duration::from_millis(30)).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        tracker.settled(1, Settlement::Completed);

        let report = waiter.await.unwrap();
        assert_eq!(report.drains, 1);
        assert!(report.completed_at >= report.first_drain_at + Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_activity_during_quiet_period_restarts_wait() {
        let tracker = Arc::new(PendingRequestTracker::new());
        tracker.dispatched(1);
        tracker.settled(1, Settlement::Completed);

        let waiter = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move { tracker.wait_for_completion(Duration::from_millis(60)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        tracker.dispatched(2);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!waiter.is_finished(), "must not complete while a request is pending");
        tracker.settled(2, Settlement::Completed);

        let report = waiter.await.unwrap();
        assert_eq!(report.drains, 2);
        assert_eq!(report.dispatched, 2);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Dispatch(u8),
        Settle(u8, bool),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..16).prop_map(Op::Dispatch),
            (0u8..16, any::<bool>()).prop_map(|(id, ok)| Op::Settle(id, ok)),
        ]
    }

    proptest! {
        #[test]
        fn prop_empty_set_iff_idle(ops in prop::collection::vec(op(), 0..200)) {
            let tracker = PendingRequestTracker::new();
            for op in ops {
                match op {
                    Op::Dispatch(id) => { tracker.dispatched(u64::from(id)); },
                    Op::Settle(id, ok) => {
                        let settlement = if ok { Settlement::Completed } else { Settlement::Failed };
                        tracker.settled(u64::from(id), settlement);
                    },
                }
                let empty = tracker.pending_count() == 0;
                prop_assert_eq!(empty, tracker.state() == TrackerState::Idle);
            }
        }
    }
}
