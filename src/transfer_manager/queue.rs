//! Resumable bounded work queue.
//!
//! Runs transfer operations on a bounded pool (`max_concurrent`), honoring
//! dependency edges between units. Scheduling is FIFO among ready units.
//! Every unit that reaches a terminal state is reported back over the event
//! channel and purged from the queue.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::error::TransferError;

/// Result payload of a successfully completed unit.
#[derive(Debug, Clone, Default)]
pub struct OperationOutput {
    /// Total blob size, reported by the download probe.
    pub total_size: Option<u64>,
    pub bytes_transferred: u64,
}

/// A cancelable unit of transfer work.
///
/// Implementations perform one network interaction (a block fetch, a block
/// put, a probe, a finalize) and must honor the cancellation token at I/O
/// boundaries.
#[async_trait]
pub trait TransferOperation: Send + Sync {
    /// Stable unit identifier; block units reuse their block id.
    fn unit_id(&self) -> &str;

    /// Owning blob transfer, used for bulk removal.
    fn parent_id(&self) -> Option<&str> {
        None
    }

    /// Units that must complete successfully before this one may start.
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    async fn execute(&self, cancel: &CancellationToken) -> Result<OperationOutput, TransferError>;
}

/// Terminal outcome of a unit.
#[derive(Debug, Clone)]
pub enum UnitOutcome {
    Completed(OperationOutput),
    Failed(TransferError),
    Canceled,
}

/// Events emitted by the queue, consumed by the manager's event loop.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// The unit was scheduled and is now running.
    Started {
        unit_id: String,
        parent_id: Option<String>,
    },
    /// The unit reached a terminal state and was purged.
    Finished {
        unit_id: String,
        parent_id: Option<String>,
        outcome: UnitOutcome,
    },
}

struct RunningUnit {
    parent_id: Option<String>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Arc<dyn TransferOperation>>,
    running: HashMap<String, RunningUnit>,
    /// Dependencies that completed successfully (or were marked satisfied
    /// because their block is already complete from a previous run).
    satisfied: HashSet<String>,
    /// Units that finished in a non-success terminal state; dependents are
    /// reported canceled instead of running.
    unsatisfiable: HashSet<String>,
}

struct QueueInner {
    max_concurrent: usize,
    state: Mutex<QueueState>,
    notify: Notify,
    events: mpsc::UnboundedSender<QueueEvent>,
    shutdown: CancellationToken,
}

/// Bounded, dependency-aware work pool.
pub struct WorkQueue {
    inner: Arc<QueueInner>,
}

impl WorkQueue {
    /// Create the queue and its event channel. Must be called within a
    /// Tokio runtime; the scheduler task is spawned immediately.
    pub fn new(max_concurrent: usize) -> (Self, mpsc::UnboundedReceiver<QueueEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(QueueInner {
            max_concurrent: max_concurrent.max(1),
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            events,
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(scheduler_loop(inner.clone()));

        (Self { inner }, events_rx)
    }

    /// Enqueue a unit. A unit with unfinished dependencies stays pending.
    /// A unit id already pending or running is skipped.
    pub fn add(&self, op: Arc<dyn TransferOperation>) {
        {
            let mut state = self.inner.state.lock().unwrap();
            let id = op.unit_id().to_string();
            if state.running.contains_key(&id)
                || state.pending.iter().any(|p| p.unit_id() == id)
            {
                debug!("Unit {} already queued, skipping", id);
                return;
            }
            // Re-enqueueing resets any earlier terminal record for this id.
            state.satisfied.remove(&id);
            state.unsatisfiable.remove(&id);
            state.pending.push_back(op);
        }
        self.inner.notify.notify_one();
    }

    pub fn add_many(&self, ops: Vec<Arc<dyn TransferOperation>>) {
        for op in ops {
            self.add(op);
        }
    }

    /// Record a dependency as already satisfied without running it. Used on
    /// resume for blocks that completed in a previous run.
    pub fn mark_satisfied(&self, unit_id: &str) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.unsatisfiable.remove(unit_id);
            state.satisfied.insert(unit_id.to_string());
        }
        self.inner.notify.notify_one();
    }

    /// Cancel the unit if it is running, remove it if it is pending.
    pub fn remove(&self, unit_id: &str) {
        let mut state = self.inner.state.lock().unwrap();
        if let Some(running) = state.running.get(unit_id) {
            running.cancel.cancel();
        } else {
            state.pending.retain(|op| op.unit_id() != unit_id);
        }
    }

    /// Cancel and remove every unit belonging to a blob transfer.
    pub fn remove_parent(&self, parent_id: &str) {
        let mut state = self.inner.state.lock().unwrap();
        for running in state
            .running
            .values()
            .filter(|r| r.parent_id.as_deref() == Some(parent_id))
        {
            running.cancel.cancel();
        }
        state
            .pending
            .retain(|op| op.parent_id() != Some(parent_id));
    }

    /// Cancel and remove every unit.
    pub fn clear(&self) {
        let mut state = self.inner.state.lock().unwrap();
        for running in state.running.values() {
            running.cancel.cancel();
        }
        state.pending.clear();
        state.satisfied.clear();
        state.unsatisfiable.clear();
    }

    pub fn pending_len(&self) -> usize {
        self.inner.state.lock().unwrap().pending.len()
    }

    pub fn running_len(&self) -> usize {
        self.inner.state.lock().unwrap().running.len()
    }

    /// Stop the scheduler and cancel all running units.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn scheduler_loop(inner: Arc<QueueInner>) {
    loop {
        while let Some((op, cancel)) = next_ready(&inner) {
            spawn_unit(inner.clone(), op, cancel);
        }

        tokio::select! {
            _ = inner.notify.notified() => {}
            _ = inner.shutdown.cancelled() => break,
        }
    }
}

/// Pop the first pending unit whose dependencies are satisfied, respecting
/// the concurrency bound. Units whose dependencies can never complete are
/// purged and reported canceled.
fn next_ready(inner: &Arc<QueueInner>) -> Option<(Arc<dyn TransferOperation>, CancellationToken)> {
    let mut state = inner.state.lock().unwrap();
    if state.running.len() >= inner.max_concurrent {
        return None;
    }

    let mut i = 0;
    while i < state.pending.len() {
        let deps = state.pending[i].dependencies();

        if deps.iter().any(|d| state.unsatisfiable.contains(d)) {
            let op = state.pending.remove(i).unwrap();
            let unit_id = op.unit_id().to_string();
            state.unsatisfiable.insert(unit_id.clone());
            let _ = inner.events.send(QueueEvent::Finished {
                unit_id,
                parent_id: op.parent_id().map(String::from),
                outcome: UnitOutcome::Canceled,
            });
            continue;
        }

        if deps.iter().all(|d| state.satisfied.contains(d)) {
            let op = state.pending.remove(i).unwrap();
            let unit_id = op.unit_id().to_string();
            let cancel = inner.shutdown.child_token();
            state.running.insert(
                unit_id.clone(),
                RunningUnit {
                    parent_id: op.parent_id().map(String::from),
                    cancel: cancel.clone(),
                },
            );
            let _ = inner.events.send(QueueEvent::Started {
                unit_id,
                parent_id: op.parent_id().map(String::from),
            });
            return Some((op, cancel));
        }

        i += 1;
    }
    None
}

fn spawn_unit(inner: Arc<QueueInner>, op: Arc<dyn TransferOperation>, cancel: CancellationToken) {
    tokio::spawn(async move {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => UnitOutcome::Canceled,
            result = op.execute(&cancel) => match result {
                Ok(output) => UnitOutcome::Completed(output),
                Err(TransferError::Canceled) => UnitOutcome::Canceled,
                Err(e) => UnitOutcome::Failed(e),
            },
        };

        let unit_id = op.unit_id().to_string();
        {
            let mut state = inner.state.lock().unwrap();
            state.running.remove(&unit_id);
            match &outcome {
                UnitOutcome::Completed(_) => {
                    state.satisfied.insert(unit_id.clone());
                }
                _ => {
                    state.unsatisfiable.insert(unit_id.clone());
                }
            }
        }

        let _ = inner.events.send(QueueEvent::Finished {
            unit_id,
            parent_id: op.parent_id().map(String::from),
            outcome,
        });
        inner.notify.notify_one();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::timeout;

    struct TestOp {
        id: String,
        parent: Option<String>,
        deps: Vec<String>,
        delay: Duration,
        fail: bool,
        log: Arc<Mutex<Vec<String>>>,
        running_now: Arc<AtomicUsize>,
        max_running: Arc<AtomicUsize>,
    }

    impl TestOp {
        fn new(id: &str, log: Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                id: id.to_string(),
                parent: None,
                deps: Vec::new(),
                delay: Duration::from_millis(10),
                fail: false,
                log,
                running_now: Arc::new(AtomicUsize::new(0)),
                max_running: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn with_deps(mut self, deps: &[&str]) -> Self {
            self.deps = deps.iter().map(|s| s.to_string()).collect();
            self
        }

        fn with_parent(mut self, parent: &str) -> Self {
            self.parent = Some(parent.to_string());
            self
        }

        fn failing(mut self) -> Self {
            self.fail = true;
            self
        }
    }

    #[async_trait]
    impl TransferOperation for TestOp {
        fn unit_id(&self) -> &str {
            &self.id
        }

        fn parent_id(&self) -> Option<&str> {
            self.parent.as_deref()
        }

        fn dependencies(&self) -> Vec<String> {
            self.deps.clone()
        }

        async fn execute(
            &self,
            cancel: &CancellationToken,
        ) -> Result<OperationOutput, TransferError> {
            let now = self.running_now.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);

            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = cancel.cancelled() => {
                    self.running_now.fetch_sub(1, Ordering::SeqCst);
                    return Err(TransferError::Canceled);
                }
            }

            self.running_now.fetch_sub(1, Ordering::SeqCst);
            self.log.lock().unwrap().push(self.id.clone());
            if self.fail {
                Err(TransferError::from_status(404, "not found"))
            } else {
                Ok(OperationOutput::default())
            }
        }
    }

    async fn wait_finished(
        rx: &mut mpsc::UnboundedReceiver<QueueEvent>,
        unit_id: &str,
    ) -> UnitOutcome {
        loop {
            let event = timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for queue event")
                .expect("queue event channel closed");
            if let QueueEvent::Finished {
                unit_id: id,
                outcome,
                ..
            } = event
            {
                if id == unit_id {
                    return outcome;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_fifo_order_among_ready_units() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (queue, mut rx) = WorkQueue::new(1);

        for name in ["first", "second", "third"] {
            queue.add(Arc::new(TestOp::new(name, log.clone())));
        }

        wait_finished(&mut rx, "third").await;
        assert_eq!(
            *log.lock().unwrap(),
            vec!["first".to_string(), "second".to_string(), "third".to_string()]
        );
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (queue, mut rx) = WorkQueue::new(2);

        let running_now = Arc::new(AtomicUsize::new(0));
        let max_running = Arc::new(AtomicUsize::new(0));
        for i in 0..6 {
            let mut op = TestOp::new(&format!("u{}", i), log.clone());
            op.delay = Duration::from_millis(30);
            op.running_now = running_now.clone();
            op.max_running = max_running.clone();
            queue.add(Arc::new(op));
        }

        let mut finished = 0;
        while finished < 6 {
            let event = timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for queue event")
                .expect("queue event channel closed");
            if matches!(event, QueueEvent::Finished { .. }) {
                finished += 1;
            }
        }
        assert!(max_running.load(Ordering::SeqCst) <= 2);
        assert_eq!(log.lock().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_dependent_unit_waits_for_dependencies() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (queue, mut rx) = WorkQueue::new(4);

        // Final is added first but must run last
        queue.add(Arc::new(
            TestOp::new("final", log.clone()).with_deps(&["a", "b"]),
        ));
        queue.add(Arc::new(TestOp::new("a", log.clone())));
        queue.add(Arc::new(TestOp::new("b", log.clone())));

        wait_finished(&mut rx, "final").await;
        let order = log.lock().unwrap().clone();
        assert_eq!(order.last().unwrap(), "final");
    }

    #[tokio::test]
    async fn test_mark_satisfied_unblocks_dependent() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (queue, mut rx) = WorkQueue::new(4);

        queue.add(Arc::new(
            TestOp::new("final", log.clone()).with_deps(&["done-before", "b"]),
        ));
        queue.add(Arc::new(TestOp::new("b", log.clone())));
        // "done-before" completed in a previous run and is never enqueued
        queue.mark_satisfied("done-before");

        let outcome = wait_finished(&mut rx, "final").await;
        assert!(matches!(outcome, UnitOutcome::Completed(_)));
    }

    #[tokio::test]
    async fn test_failed_dependency_cancels_dependent() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (queue, mut rx) = WorkQueue::new(4);

        queue.add(Arc::new(TestOp::new("flaky", log.clone()).failing()));
        queue.add(Arc::new(
            TestOp::new("final", log.clone()).with_deps(&["flaky"]),
        ));

        let outcome = wait_finished(&mut rx, "flaky").await;
        assert!(matches!(outcome, UnitOutcome::Failed(_)));

        let outcome = wait_finished(&mut rx, "final").await;
        assert!(matches!(outcome, UnitOutcome::Canceled));
        // The dependent never executed
        assert!(!log.lock().unwrap().contains(&"final".to_string()));
    }

    #[tokio::test]
    async fn test_remove_cancels_running_unit() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (queue, mut rx) = WorkQueue::new(1);

        let mut slow = TestOp::new("slow", log.clone());
        slow.delay = Duration::from_secs(30);
        queue.add(Arc::new(slow));

        // Wait until it is actually running, then remove it
        loop {
            if queue.running_len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        queue.remove("slow");

        let outcome = wait_finished(&mut rx, "slow").await;
        assert!(matches!(outcome, UnitOutcome::Canceled));
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_parent_drops_all_units_of_transfer() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (queue, mut rx) = WorkQueue::new(1);

        let mut blocker = TestOp::new("t1-block", log.clone()).with_parent("t1");
        blocker.delay = Duration::from_secs(30);
        queue.add(Arc::new(blocker));
        queue.add(Arc::new(TestOp::new("t1-other", log.clone()).with_parent("t1")));
        queue.add(Arc::new(TestOp::new("t2-block", log.clone()).with_parent("t2")));

        loop {
            if queue.running_len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        queue.remove_parent("t1");

        // t2's unit still completes
        let outcome = wait_finished(&mut rx, "t2-block").await;
        assert!(matches!(outcome, UnitOutcome::Completed(_)));
        assert_eq!(*log.lock().unwrap(), vec!["t2-block".to_string()]);
    }

    #[tokio::test]
    async fn test_clear_then_requeue_runs_again() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (queue, mut rx) = WorkQueue::new(1);

        let mut slow = TestOp::new("unit", log.clone());
        slow.delay = Duration::from_secs(30);
        queue.add(Arc::new(slow));
        loop {
            if queue.running_len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        queue.clear();
        let outcome = wait_finished(&mut rx, "unit").await;
        assert!(matches!(outcome, UnitOutcome::Canceled));

        // Re-adding the same unit id after clear runs it fresh
        queue.add(Arc::new(TestOp::new("unit", log.clone())));
        let outcome = wait_finished(&mut rx, "unit").await;
        assert!(matches!(outcome, UnitOutcome::Completed(_)));
    }

    #[tokio::test]
    async fn test_duplicate_add_is_skipped() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (queue, mut rx) = WorkQueue::new(1);

        let mut first = TestOp::new("dup", log.clone());
        first.delay = Duration::from_millis(50);
        queue.add(Arc::new(first));
        queue.add(Arc::new(TestOp::new("dup", log.clone())));

        wait_finished(&mut rx, "dup").await;
        assert_eq!(log.lock().unwrap().len(), 1);
    }
}
