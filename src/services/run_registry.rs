//! Registry of runs currently executing in this process.
//!
//! Each active run owns an [`ActiveRunState`]: cancellation flags, the ids of
//! tests that have started, the live observers, and a queue of broadcasts
//! nobody was connected to receive. All of it sits behind one lock, so a
//! broadcast and an observer attaching are strictly ordered: every message
//! reaches each observer either live, through the queue replay, or through
//! the state snapshot.
//!
//! `token_update` is never queued. It is only useful live, and the
//! `transcript_update` that closes the same turn carries the full text.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{ProgressMessage, RunWithResults};

/// Identifies one attached observer within the registry.
pub type ObserverId = u64;

/// Result of the check made immediately before a test starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The test may start; it is now recorded as started.
    Run,
    /// This test was cancelled while queued.
    TestCancelled,
    /// The whole run was cancelled; this and every later test are skipped.
    RunCancelled,
}

/// Receiving side of a run subscription.
#[derive(Debug)]
pub struct Observer {
    /// Registry-assigned id; 0 for observers of finished runs.
    pub id: ObserverId,
    /// Run being observed.
    pub run_id: Uuid,
    receiver: mpsc::UnboundedReceiver<ProgressMessage>,
}

impl Observer {
    fn new(id: ObserverId, run_id: Uuid, receiver: mpsc::UnboundedReceiver<ProgressMessage>) -> Self {
        Self {
            id,
            run_id,
            receiver,
        }
    }

    /// Observer for a run that is no longer executing: the snapshot, then end of stream.
    pub fn finished(run: RunWithResults) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let run_id = run.run.id;
        let _ = sender.send(ProgressMessage::State { run });
        Self::new(0, run_id, receiver)
    }

    /// Next message, or `None` once the run has been torn down.
    pub async fn recv(&mut self) -> Option<ProgressMessage> {
        self.receiver.recv().await
    }

    /// Next message if one is already buffered.
    pub fn try_recv(&mut self) -> Option<ProgressMessage> {
        self.receiver.try_recv().ok()
    }
}

#[derive(Default)]
struct RunChannels {
    cancelled: bool,
    cancelled_tests: HashSet<Uuid>,
    started_tests: HashSet<Uuid>,
    observers: HashMap<ObserverId, mpsc::UnboundedSender<ProgressMessage>>,
    pending: VecDeque<ProgressMessage>,
}

/// In-memory state for one executing run.
pub struct ActiveRunState {
    run_id: Uuid,
    channels: Mutex<RunChannels>,
    /// Tripped only on shutdown; interrupts in-flight tests.
    abort: CancellationToken,
    completed: watch::Sender<bool>,
}

impl ActiveRunState {
    fn new(run_id: Uuid, abort: CancellationToken) -> Self {
        let (completed, _) = watch::channel(false);
        Self {
            run_id,
            channels: Mutex::new(RunChannels::default()),
            abort,
            completed,
        }
    }

    /// Run this state belongs to.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Deliver to every connected observer, or queue when none received it.
    /// Undelivered token updates are dropped rather than queued.
    pub async fn broadcast(&self, message: ProgressMessage) {
        let mut channels = self.channels.lock().await;
        let mut delivered = false;
        channels.observers.retain(|_, sender| {
            let sent = sender.send(message.clone()).is_ok();
            delivered |= sent;
            sent
        });

        if !delivered && !matches!(message, ProgressMessage::TokenUpdate { .. }) {
            channels.pending.push_back(message);
        }
    }

    /// Decide whether a queued test may start, recording it as started when
    /// it may. Test-specific cancellation wins over whole-run cancellation.
    pub async fn admit(&self, result_id: Uuid) -> Admission {
        let mut channels = self.channels.lock().await;
        if channels.cancelled_tests.contains(&result_id) {
            Admission::TestCancelled
        } else if channels.cancelled {
            Admission::RunCancelled
        } else {
            channels.started_tests.insert(result_id);
            Admission::Run
        }
    }

    /// Whole-run cancellation requested.
    pub async fn is_cancelled(&self) -> bool {
        self.channels.lock().await.cancelled
    }

    /// True if this test was cancelled while queued.
    pub async fn is_test_cancelled(&self, result_id: Uuid) -> bool {
        self.channels
            .lock()
            .await
            .cancelled_tests
            .contains(&result_id)
    }

    /// Skip every test that has not started yet.
    pub async fn cancel(&self) {
        self.channels.lock().await.cancelled = true;
    }

    /// Flag a queued test. Returns false once the test has started, since an
    /// executing test always runs to its own end.
    pub async fn cancel_test(&self, result_id: Uuid) -> bool {
        let mut channels = self.channels.lock().await;
        if channels.started_tests.contains(&result_id) {
            return false;
        }
        channels.cancelled_tests.insert(result_id);
        true
    }

    /// Token that interrupts in-flight tests of this run.
    pub fn abort_token(&self) -> CancellationToken {
        self.abort.clone()
    }

    /// Mark the run closed and wake [`ActiveRunState::wait_completed`] callers.
    pub fn mark_completed(&self) {
        self.completed.send_replace(true);
    }

    /// True once the run has been marked complete.
    pub fn is_completed(&self) -> bool {
        *self.completed.borrow()
    }

    /// Resolves once the run has been marked complete.
    pub async fn wait_completed(&self) {
        let mut receiver = self.completed.subscribe();
        // sender lives as long as self, so this only returns once complete
        let _ = receiver.wait_for(|done| *done).await;
    }

    /// Number of live observers.
    pub async fn observer_count(&self) -> usize {
        self.channels.lock().await.observers.len()
    }
}

/// Runs executing in this process, keyed by run id.
pub struct RunRegistry {
    runs: RwLock<HashMap<Uuid, Arc<ActiveRunState>>>,
    next_observer_id: AtomicU64,
    shutdown: CancellationToken,
}

impl Default for RunRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RunRegistry {
    /// Empty registry with a fresh shutdown token.
    pub fn new() -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            next_observer_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        }
    }

    /// Start tracking a run. Its abort token is a child of the shutdown token.
    pub async fn register(&self, run_id: Uuid) -> Arc<ActiveRunState> {
        let state = Arc::new(ActiveRunState::new(run_id, self.shutdown.child_token()));
        self.runs.write().await.insert(run_id, Arc::clone(&state));
        debug!(%run_id, "run registered");
        state
    }

    /// Drop a run's state. Connected observers see end of stream.
    pub async fn unregister(&self, run_id: Uuid) -> Option<Arc<ActiveRunState>> {
        let removed = self.runs.write().await.remove(&run_id);
        if let Some(state) = &removed {
            state.channels.lock().await.observers.clear();
            debug!(%run_id, "run unregistered");
        }
        removed
    }

    /// State of an active run.
    pub async fn get(&self, run_id: Uuid) -> Option<Arc<ActiveRunState>> {
        self.runs.read().await.get(&run_id).cloned()
    }

    /// True while the run is registered.
    pub async fn contains(&self, run_id: Uuid) -> bool {
        self.runs.read().await.contains_key(&run_id)
    }

    /// Ids of every registered run.
    pub async fn active_run_ids(&self) -> Vec<Uuid> {
        self.runs.read().await.keys().copied().collect()
    }

    /// Broadcast to a run's observers. Messages for unknown runs are dropped.
    pub async fn broadcast(&self, run_id: Uuid, message: ProgressMessage) {
        match self.get(run_id).await {
            Some(state) => state.broadcast(message).await,
            None => debug!(%run_id, message_type = message.type_name(), "broadcast for inactive run dropped"),
        }
    }

    /// Whole-run cancellation requested. False for inactive runs.
    pub async fn is_cancelled(&self, run_id: Uuid) -> bool {
        match self.get(run_id).await {
            Some(state) => state.is_cancelled().await,
            None => false,
        }
    }

    /// Returns false when the run is not active.
    pub async fn cancel_run(&self, run_id: Uuid) -> bool {
        match self.get(run_id).await {
            Some(state) => {
                state.cancel().await;
                true
            }
            None => false,
        }
    }

    /// Returns false when the run is not active or the test already started.
    pub async fn cancel_test(&self, run_id: Uuid, result_id: Uuid) -> bool {
        match self.get(run_id).await {
            Some(state) => state.cancel_test(result_id).await,
            None => false,
        }
    }

    /// Subscribe to an active run.
    ///
    /// Under the run's lock: take the snapshot, send it, replay queued
    /// broadcasts, then register for live ones. Returns `None` if the run is
    /// not active.
    pub async fn attach<F, Fut>(&self, run_id: Uuid, snapshot: F) -> DomainResult<Option<Observer>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = DomainResult<RunWithResults>>,
    {
        let Some(state) = self.get(run_id).await else {
            return Ok(None);
        };

        let mut channels = state.channels.lock().await;
        let run = snapshot().await?;
        let (sender, receiver) = mpsc::unbounded_channel();
        let _ = sender.send(ProgressMessage::State { run });
        for message in channels.pending.drain(..) {
            let _ = sender.send(message);
        }

        let id = self.next_observer_id.fetch_add(1, Ordering::Relaxed);
        channels.observers.insert(id, sender);
        debug!(%run_id, observer_id = id, "observer attached");
        Ok(Some(Observer::new(id, run_id, receiver)))
    }

    /// Remove one observer. Unknown runs and ids are ignored.
    pub async fn detach(&self, run_id: Uuid, observer_id: ObserverId) {
        if let Some(state) = self.get(run_id).await {
            state.channels.lock().await.observers.remove(&observer_id);
        }
    }

    /// Interrupt every in-flight test of every run.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{Run, TestStatus, TokenSource};

    fn snapshot(run_id: Uuid) -> RunWithResults {
        let mut run = Run::new("agent", "Agent");
        run.id = run_id;
        RunWithResults {
            run,
            results: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_queued_messages_replay_once_after_snapshot() {
        let registry = RunRegistry::new();
        let run_id = Uuid::new_v4();
        registry.register(run_id).await;
        let result_id = Uuid::new_v4();

        registry
            .broadcast(run_id, ProgressMessage::TestCancelled { result_id })
            .await;

        let mut first = registry
            .attach(run_id, || async { Ok(snapshot(run_id)) })
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(first.try_recv(), Some(ProgressMessage::State { .. })));
        assert_eq!(first.try_recv(), Some(ProgressMessage::TestCancelled { result_id }));
        assert_eq!(first.try_recv(), None);

        let mut second = registry
            .attach(run_id, || async { Ok(snapshot(run_id)) })
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(second.try_recv(), Some(ProgressMessage::State { .. })));
        assert_eq!(second.try_recv(), None);
    }

    #[tokio::test]
    async fn test_live_broadcast_reaches_every_observer_without_queueing() {
        let registry = RunRegistry::new();
        let run_id = Uuid::new_v4();
        let state = registry.register(run_id).await;
        let mut a = registry
            .attach(run_id, || async { Ok(snapshot(run_id)) })
            .await
            .unwrap()
            .unwrap();
        let mut b = registry
            .attach(run_id, || async { Ok(snapshot(run_id)) })
            .await
            .unwrap()
            .unwrap();
        a.try_recv();
        b.try_recv();

        let message = ProgressMessage::TestCompleted {
            result_id: Uuid::new_v4(),
            status: TestStatus::Pass,
        };
        state.broadcast(message.clone()).await;

        assert_eq!(a.try_recv(), Some(message.clone()));
        assert_eq!(b.try_recv(), Some(message));
        assert!(state.channels.lock().await.pending.is_empty());
    }

    #[tokio::test]
    async fn test_closed_observer_is_pruned_and_message_queued() {
        let registry = RunRegistry::new();
        let run_id = Uuid::new_v4();
        let state = registry.register(run_id).await;
        let observer = registry
            .attach(run_id, || async { Ok(snapshot(run_id)) })
            .await
            .unwrap()
            .unwrap();
        drop(observer);

        state.broadcast(ProgressMessage::RunCompleted {}).await;
        assert_eq!(state.observer_count().await, 0);
        assert_eq!(state.channels.lock().await.pending.len(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_flags() {
        let registry = RunRegistry::new();
        let run_id = Uuid::new_v4();
        let result_id = Uuid::new_v4();
        let state = registry.register(run_id).await;

        assert!(registry.cancel_test(run_id, result_id).await);
        assert!(state.is_test_cancelled(result_id).await);
        assert!(!registry.is_cancelled(run_id).await);
        assert!(registry.cancel_run(run_id).await);
        assert!(registry.is_cancelled(run_id).await);

        assert!(!registry.cancel_run(Uuid::new_v4()).await);
        assert!(registry
            .attach(Uuid::new_v4(), || async { Ok(snapshot(run_id)) })
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_unregister_ends_observer_stream_and_shutdown_trips_token() {
        let registry = RunRegistry::new();
        let run_id = Uuid::new_v4();
        let state = registry.register(run_id).await;
        let token = state.abort_token();
        let mut observer = registry
            .attach(run_id, || async { Ok(snapshot(run_id)) })
            .await
            .unwrap()
            .unwrap();

        registry.shutdown();
        assert!(token.is_cancelled());

        registry.unregister(run_id).await;
        assert!(matches!(observer.recv().await, Some(ProgressMessage::State { .. })));
        assert_eq!(observer.recv().await, None);
        assert!(!registry.contains(run_id).await);
    }

    #[tokio::test]
    async fn test_token_flood_does_not_evict_lifecycle_messages() {
        let registry = RunRegistry::new();
        let run_id = Uuid::new_v4();
        let state = registry.register(run_id).await;
        let result_id = Uuid::new_v4();
        let started = ProgressMessage::TestStarted {
            result_id,
            test_case_id: "t1".into(),
            test_name: "greets".into(),
        };

        state.broadcast(started.clone()).await;
        for i in 0..10_000 {
            state
                .broadcast(ProgressMessage::TokenUpdate {
                    result_id,
                    token: format!("tok{i} "),
                    source: TokenSource::Agent,
                })
                .await;
        }
        let completed = ProgressMessage::TestCompleted {
            result_id,
            status: TestStatus::Pass,
        };
        state.broadcast(completed.clone()).await;

        let mut observer = registry
            .attach(run_id, || async { Ok(snapshot(run_id)) })
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(observer.try_recv(), Some(ProgressMessage::State { .. })));
        assert_eq!(observer.try_recv(), Some(started));
        assert_eq!(observer.try_recv(), Some(completed));
        assert_eq!(observer.try_recv(), None);
    }

    #[tokio::test]
    async fn test_live_observer_still_receives_tokens() {
        let registry = RunRegistry::new();
        let run_id = Uuid::new_v4();
        let state = registry.register(run_id).await;
        let mut observer = registry
            .attach(run_id, || async { Ok(snapshot(run_id)) })
            .await
            .unwrap()
            .unwrap();
        observer.try_recv();

        let token = ProgressMessage::TokenUpdate {
            result_id: Uuid::new_v4(),
            token: "Hel".into(),
            source: TokenSource::Agent,
        };
        state.broadcast(token.clone()).await;
        assert_eq!(observer.try_recv(), Some(token));
    }

    #[tokio::test]
    async fn test_started_test_cannot_be_cancelled() {
        let registry = RunRegistry::new();
        let run_id = Uuid::new_v4();
        let state = registry.register(run_id).await;
        let running = Uuid::new_v4();
        let queued = Uuid::new_v4();

        assert_eq!(state.admit(running).await, Admission::Run);
        assert!(!registry.cancel_test(run_id, running).await);
        assert!(!state.is_test_cancelled(running).await);

        assert!(registry.cancel_test(run_id, queued).await);
        assert_eq!(state.admit(queued).await, Admission::TestCancelled);

        registry.cancel_run(run_id).await;
        assert_eq!(state.admit(Uuid::new_v4()).await, Admission::RunCancelled);
    }

    #[tokio::test]
    async fn test_wait_completed() {
        let registry = RunRegistry::new();
        let state = registry.register(Uuid::new_v4()).await;
        let waiter = {
            let state = Arc::clone(&state);
            tokio::spawn(async move { state.wait_completed().await })
        };
        state.mark_completed();
        waiter.await.unwrap();
        assert!(state.is_completed());
    }
}
