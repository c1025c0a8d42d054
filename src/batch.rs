//! Batching coalescer: groups operations submitted under one batch id and
//! executes them together.
//!
//! The first submission for an id creates the queue and arms a flush timer.
//! A flush fires on whichever comes first (timer expiry, the queue reaching
//! its threshold, or a submission flagged `force`) and executes the queued
//! operations **sequentially in submission order**. The task that drains the
//! queue out of the map under the lock is the only executor for that batch
//! generation, so operations never interleave. A failure aborts the rest of
//! the batch; every waiter observes one batch-level failure.

use crate::error::Rejection;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// A deferred operation queued into a batch.
pub type BatchOp<V, E> = Box<dyn FnOnce() -> BoxFuture<'static, Result<V, E>> + Send>;

/// Shared aggregate outcome of one batch generation.
pub type BatchResult<V> = Result<Arc<Vec<V>>, BatchFailure>;

/// A batch aborted mid-flush: operations after the failing one never ran.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("batch aborted after {completed} completed operation(s): {reason}")]
pub struct BatchFailure {
    /// Operations that finished before the failure.
    pub completed: usize,
    /// Stringified error from the failing operation.
    pub reason: String,
}

impl From<BatchFailure> for Rejection {
    fn from(failure: BatchFailure) -> Self {
        Rejection::BatchFailed { completed: failure.completed, reason: failure.reason }
    }
}

/// Timing and sizing knobs for the coalescer.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// How long the first submission waits before a timer flush.
    pub flush_after: Duration,
    /// Queue length that triggers an immediate flush.
    pub flush_threshold: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { flush_after: Duration::from_millis(100), flush_threshold: 10 }
    }
}

/// What a submission observed.
#[derive(Debug)]
pub enum Submission<V> {
    /// The operation was queued; `done` resolves with the aggregate result
    /// when the batch flushes.
    Queued {
        /// Queue length after this submission.
        pending: usize,
        /// Resolves once this batch generation flushes.
        done: oneshot::Receiver<BatchResult<V>>,
    },
    /// This submission triggered the flush (threshold or force) and the batch
    /// already executed.
    Flushed(BatchResult<V>),
}

struct BatchQueue<V, E> {
    ops: Vec<BatchOp<V, E>>,
    waiters: Vec<oneshot::Sender<BatchResult<V>>>,
    epoch: u64,
    timer: JoinHandle<()>,
}

struct CoalescerShared<V, E> {
    queues: Mutex<HashMap<String, BatchQueue<V, E>>>,
    epochs: AtomicU64,
}

/// Groups operations by batch id and flushes them together.
///
/// Clones share the same queues via `Arc`. Requires a tokio runtime for the
/// flush timers.
pub struct BatchCoalescer<V, E> {
    shared: Arc<CoalescerShared<V, E>>,
    config: BatchConfig,
}

impl<V, E> Clone for BatchCoalescer<V, E> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared), config: self.config.clone() }
    }
}

impl<V, E> BatchCoalescer<V, E>
where
    V: Send + Sync + 'static,
    E: std::fmt::Display + Send + 'static,
{
    pub fn new(config: BatchConfig) -> Self {
        Self {
            shared: Arc::new(CoalescerShared {
                queues: Mutex::new(HashMap::new()),
                epochs: AtomicU64::new(0),
            }),
            config,
        }
    }

    /// Queue `op` under `batch_id`.
    ///
    /// Returns [`Submission::Queued`] while the batch keeps collecting, or
    /// [`Submission::Flushed`] when this submission pushed the queue to its
    /// threshold or carried `force`, in which case the whole batch executed
    /// before returning.
    pub async fn submit(&self, batch_id: &str, op: BatchOp<V, E>, force: bool) -> Submission<V> {
        let (done_tx, done_rx) = oneshot::channel();
        let drained = {
            let mut queues = self.shared.queues.lock().expect("batch queues poisoned");
            let queue = queues.entry(batch_id.to_string()).or_insert_with(|| {
                let epoch = self.shared.epochs.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(batch_id, epoch, "opened batch queue");
                BatchQueue {
                    ops: Vec::new(),
                    waiters: Vec::new(),
                    epoch,
                    timer: self.spawn_timer(batch_id.to_string(), epoch),
                }
            });
            queue.ops.push(op);
            queue.waiters.push(done_tx);
            let pending = queue.ops.len();
            let should_flush = force || pending >= self.config.flush_threshold;
            if should_flush {
                queues.remove(batch_id)
            } else {
                return Submission::Queued { pending, done: done_rx };
            }
        };

        match drained {
            Some(queue) => {
                queue.timer.abort();
                let result = Self::run(batch_id, queue.ops).await;
                notify(queue.waiters, &result);
                Submission::Flushed(result)
            }
            // Unreachable in practice: the entry was just inserted above.
            None => Submission::Queued { pending: 0, done: done_rx },
        }
    }

    /// Number of batch ids currently collecting.
    pub fn pending_batches(&self) -> usize {
        self.shared.queues.lock().expect("batch queues poisoned").len()
    }

    fn spawn_timer(&self, batch_id: String, epoch: u64) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        let delay = self.config.flush_after;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let drained = {
                let mut queues = shared.queues.lock().expect("batch queues poisoned");
                // A threshold/force flush may already have drained this
                // generation, and a successor queue may reuse the id.
                let same_generation =
                    queues.get(&batch_id).map_or(false, |queue| queue.epoch == epoch);
                if same_generation {
                    queues.remove(&batch_id)
                } else {
                    None
                }
            };
            if let Some(queue) = drained {
                let result = Self::run(&batch_id, queue.ops).await;
                notify(queue.waiters, &result);
            }
        })
    }

    async fn run(batch_id: &str, ops: Vec<BatchOp<V, E>>) -> BatchResult<V> {
        let total = ops.len();
        let mut results = Vec::with_capacity(total);
        for op in ops {
            match op().await {
                Ok(value) => results.push(value),
                Err(error) => {
                    let failure =
                        BatchFailure { completed: results.len(), reason: error.to_string() };
                    tracing::warn!(
                        batch_id,
                        completed = failure.completed,
                        total,
                        "batch aborted by failing operation"
                    );
                    return Err(failure);
                }
            }
        }
        tracing::debug!(batch_id, total, "batch flushed");
        Ok(Arc::new(results))
    }
}

fn notify<V>(waiters: Vec<oneshot::Sender<BatchResult<V>>>, result: &BatchResult<V>) {
    for waiter in waiters {
        // A dropped receiver just means the submitter stopped listening.
        let _ = waiter.send(result.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(String);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "TestError: {}", self.0)
        }
    }

    impl std::error::Error for TestError {}

    fn ok_op(value: i64) -> BatchOp<i64, TestError> {
        Box::new(move || Box::pin(async move { Ok(value) }))
    }

    fn err_op(message: &str) -> BatchOp<i64, TestError> {
        let message = message.to_string();
        Box::new(move || Box::pin(async move { Err(TestError(message)) }))
    }

    fn coalescer() -> BatchCoalescer<i64, TestError> {
        BatchCoalescer::new(BatchConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn timer_flush_delivers_all_results_in_order() {
        let coalescer = coalescer();
        let started = tokio::time::Instant::now();

        let first = coalescer.submit("b1", ok_op(1), false).await;
        tokio::time::advance(Duration::from_millis(25)).await;
        let second = coalescer.submit("b1", ok_op(2), false).await;
        let third = coalescer.submit("b1", ok_op(3), false).await;

        let done = match first {
            Submission::Queued { pending, done } => {
                assert_eq!(pending, 1);
                done
            }
            other => panic!("expected Queued, got {:?}", other),
        };
        assert!(matches!(second, Submission::Queued { pending: 2, .. }));
        assert!(matches!(third, Submission::Queued { pending: 3, .. }));

        let result = done.await.expect("flush must resolve waiters").expect("batch succeeds");
        assert_eq!(*result, vec![1, 2, 3]);
        assert_eq!(
            started.elapsed(),
            Duration::from_millis(100),
            "timer runs from the first submission"
        );
        assert_eq!(coalescer.pending_batches(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn threshold_flushes_without_waiting_for_timer() {
        let coalescer = coalescer();

        for i in 0..9 {
            let submission = coalescer.submit("b1", ok_op(i), false).await;
            assert!(matches!(submission, Submission::Queued { .. }));
        }
        let tenth = coalescer.submit("b1", ok_op(9), false).await;

        match tenth {
            Submission::Flushed(Ok(results)) => {
                assert_eq!(*results, (0..10).collect::<Vec<_>>());
            }
            other => panic!("expected Flushed, got {:?}", other),
        }
        assert_eq!(coalescer.pending_batches(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn force_flushes_immediately() {
        let coalescer = coalescer();

        let first = coalescer.submit("b1", ok_op(1), false).await;
        let forced = coalescer.submit("b1", ok_op(2), true).await;

        match forced {
            Submission::Flushed(Ok(results)) => assert_eq!(*results, vec![1, 2]),
            other => panic!("expected Flushed, got {:?}", other),
        }
        // The queued waiter sees the same aggregate.
        if let Submission::Queued { done, .. } = first {
            assert_eq!(*done.await.unwrap().unwrap(), vec![1, 2]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failure_aborts_remaining_operations() {
        let coalescer = coalescer();

        let first = coalescer.submit("b1", ok_op(1), false).await;
        let _ = coalescer.submit("b1", err_op("boom"), false).await;
        let result = coalescer.submit("b1", ok_op(3), true).await;

        match result {
            Submission::Flushed(Err(failure)) => {
                assert_eq!(failure.completed, 1);
                assert!(failure.reason.contains("boom"));
            }
            other => panic!("expected Flushed failure, got {:?}", other),
        }
        if let Submission::Queued { done, .. } = first {
            let failure = done.await.unwrap().unwrap_err();
            assert_eq!(failure.completed, 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn batch_ids_are_independent() {
        let coalescer = coalescer();

        let a = coalescer.submit("a", ok_op(1), false).await;
        let b = coalescer.submit("b", ok_op(2), false).await;
        assert_eq!(coalescer.pending_batches(), 2);

        let (a_done, b_done) = match (a, b) {
            (Submission::Queued { done: a, .. }, Submission::Queued { done: b, .. }) => (a, b),
            other => panic!("expected two Queued submissions, got {:?}", other),
        };
        assert_eq!(*a_done.await.unwrap().unwrap(), vec![1]);
        assert_eq!(*b_done.await.unwrap().unwrap(), vec![2]);
    }

    #[tokio::test(start_paused = true)]
    async fn reused_id_starts_a_new_generation() {
        let coalescer = coalescer();

        let first = coalescer.submit("b1", ok_op(1), true).await;
        assert!(matches!(first, Submission::Flushed(Ok(_))));

        // Same id again: a fresh queue with its own timer.
        let second = coalescer.submit("b1", ok_op(2), false).await;
        let done = match second {
            Submission::Queued { pending, done } => {
                assert_eq!(pending, 1);
                done
            }
            other => panic!("expected Queued, got {:?}", other),
        };
        assert_eq!(*done.await.unwrap().unwrap(), vec![2]);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_timer_does_not_flush_successor_queue() {
        let coalescer = BatchCoalescer::<i64, TestError>::new(BatchConfig {
            flush_after: Duration::from_millis(100),
            flush_threshold: 2,
        });

        // Generation 1 flushes via threshold at t=0; its timer is aborted.
        let _ = coalescer.submit("b1", ok_op(1), false).await;
        let _ = coalescer.submit("b1", ok_op(2), false).await;

        // Generation 2 starts at t=10 and must flush at t=110, not t=100.
        tokio::time::advance(Duration::from_millis(10)).await;
        let started = tokio::time::Instant::now();
        let submission = coalescer.submit("b1", ok_op(3), false).await;
        let done = match submission {
            Submission::Queued { done, .. } => done,
            other => panic!("expected Queued, got {:?}", other),
        };
        assert_eq!(*done.await.unwrap().unwrap(), vec![3]);
        assert_eq!(started.elapsed(), Duration::from_millis(100));
    }
}
