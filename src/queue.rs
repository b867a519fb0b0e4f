//! Bounded-concurrency task queue
//!
//! A `Queue` runs at most `concurrent` tasks at a time and starts waiting
//! tasks in submission order. Submission is synchronous: the position in
//! the queue is fixed when `add` is called, not when its future is polled.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Notify};

use crate::error::QueueError;

/// Queue configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueOptions {
    /// Maximum number of tasks running at once (minimum 1)
    pub concurrent: usize,
    /// Per-task timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            concurrent: 1,
            timeout: None,
        }
    }
}

impl QueueOptions {
    /// Options with the given concurrency and no timeout
    pub fn concurrent(concurrent: usize) -> Self {
        Self {
            concurrent: concurrent.max(1),
            timeout: None,
        }
    }

    /// Set the per-task timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Snapshot of queue statistics
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Highest number of tasks that were waiting at once
    pub peak: usize,
    /// Tasks waiting to start
    pub pending: usize,
    /// Tasks waiting or running
    pub size: usize,
    /// Tasks that have started
    pub total: usize,
}

type Job = BoxFuture<'static, ()>;

#[derive(Default)]
struct State {
    running: usize,
    waiting: VecDeque<Job>,
    peak: usize,
    total: usize,
}

struct Inner {
    options: QueueOptions,
    state: Mutex<State>,
    idle: Notify,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A bounded-concurrency FIFO task queue
#[derive(Clone)]
pub struct Queue {
    inner: Arc<Inner>,
}

impl Default for Queue {
    fn default() -> Self {
        Self::new(QueueOptions::default())
    }
}

impl Queue {
    /// Create a queue
    pub fn new(options: QueueOptions) -> Self {
        let options = QueueOptions {
            concurrent: options.concurrent.max(1),
            ..options
        };
        Self {
            inner: Arc::new(Inner {
                options,
                state: Mutex::new(State::default()),
                idle: Notify::new(),
            }),
        }
    }

    /// Configured options
    pub fn options(&self) -> QueueOptions {
        self.inner.options
    }

    /// Submit a task; the returned future resolves with its outcome
    ///
    /// A task that panics resolves to `QueueError::Aborted`. A task that
    /// exceeds the timeout resolves to `QueueError::Timeout` and frees its
    /// slot, but keeps running detached until it finishes on its own.
    /// Must be called within a tokio runtime.
    pub fn add<F, T>(&self, task: F) -> impl Future<Output = Result<T, QueueError>> + Send + 'static
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let timeout = self.inner.options.timeout;

        let job = async move {
            let guarded = AssertUnwindSafe(task).catch_unwind();
            let result = match timeout {
                Some(limit) => {
                    let mut running = tokio::spawn(guarded);
                    match tokio::time::timeout(limit, &mut running).await {
                        Ok(Ok(outcome)) => outcome.map_err(|_| QueueError::Aborted),
                        Ok(Err(_)) => Err(QueueError::Aborted),
                        // Dropping the handle detaches the task without cancelling it
                        Err(_) => Err(QueueError::Timeout(limit)),
                    }
                }
                None => guarded.await.map_err(|_| QueueError::Aborted),
            };
            let _ = tx.send(result);
        }
        .boxed();

        self.submit(job);
        async move { rx.await.unwrap_or(Err(QueueError::Aborted)) }
    }

    fn submit(&self, job: Job) {
        let mut state = self.inner.state();
        if state.running < self.inner.options.concurrent {
            state.running += 1;
            state.total += 1;
            drop(state);
            tokio::spawn(drive(self.inner.clone(), job));
        } else {
            state.waiting.push_back(job);
            state.peak = state.peak.max(state.waiting.len());
        }
    }

    /// Current statistics
    pub fn get_stats(&self) -> QueueStats {
        let state = self.inner.state();
        QueueStats {
            peak: state.peak,
            pending: state.waiting.len(),
            size: state.waiting.len() + state.running,
            total: state.total,
        }
    }

    /// Check if nothing is waiting or running
    pub fn is_idle(&self) -> bool {
        let state = self.inner.state();
        state.running == 0 && state.waiting.is_empty()
    }

    /// Wait until the queue has drained
    pub async fn on_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("options", &self.inner.options)
            .field("stats", &self.get_stats())
            .finish()
    }
}

/// Run `job`, then keep pulling waiting jobs until the queue is empty
async fn drive(inner: Arc<Inner>, mut job: Job) {
    loop {
        job.await;

        let next = {
            let mut state = inner.state();
            match state.waiting.pop_front() {
                Some(next) => {
                    state.total += 1;
                    Some(next)
                }
                None => {
                    state.running -= 1;
                    None
                }
            }
        };

        match next {
            Some(next) => job = next,
            None => {
                inner.idle.notify_waiters();
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Semaphore;

    #[tokio::test]
    async fn test_concurrency_bound_and_peak() {
        let queue = Queue::new(QueueOptions::concurrent(2));
        let gate = Arc::new(Semaphore::new(0));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));

        let mut results = Vec::new();
        for i in 0..5usize {
            let gate = gate.clone();
            let in_flight = in_flight.clone();
            let max_in_flight = max_in_flight.clone();
            results.push(queue.add(async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_in_flight.fetch_max(now, Ordering::SeqCst);
                let _permit = gate.acquire().await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                i
            }));
        }

        let stats = queue.get_stats();
        assert_eq!(stats.peak, 3);
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.size, 5);
        assert_eq!(stats.total, 2);

        gate.add_permits(5);
        let outputs: Vec<usize> = futures::future::join_all(results)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(outputs, vec![0, 1, 2, 3, 4]);
        assert!(max_in_flight.load(Ordering::SeqCst) <= 2);
        queue.on_idle().await;
        let stats = queue.get_stats();
        assert_eq!(stats.total, 5);
        assert_eq!(stats.size, 0);
        assert_eq!(stats.peak, 3);
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = Queue::default();
        let order = Arc::new(Mutex::new(Vec::new()));

        let tasks: Vec<_> = (0..5)
            .map(|i| {
                let order = order.clone();
                queue.add(async move {
                    tokio::time::sleep(Duration::from_millis(5 - i)).await;
                    order.lock().unwrap().push(i);
                })
            })
            .collect();
        futures::future::join_all(tasks).await;

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_timeout_releases_slot() {
        let queue = Queue::new(QueueOptions::concurrent(1).timeout(Duration::from_millis(20)));

        let slow = queue.add(tokio::time::sleep(Duration::from_secs(5)));
        let fast = queue.add(async { 42 });

        assert_eq!(slow.await, Err(QueueError::Timeout(Duration::from_millis(20))));
        assert_eq!(fast.await, Ok(42));
    }

    #[tokio::test]
    async fn test_timed_out_task_runs_to_completion() {
        let queue = Queue::new(QueueOptions::concurrent(1).timeout(Duration::from_millis(20)));
        let finished = Arc::new(AtomicUsize::new(0));

        let f = finished.clone();
        let slow = queue.add(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            f.fetch_add(1, Ordering::SeqCst);
        });
        let next = queue.add(async { "next" });

        assert_eq!(slow.await, Err(QueueError::Timeout(Duration::from_millis(20))));
        assert_eq!(next.await, Ok("next"));
        assert_eq!(finished.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(queue.is_idle());
    }

    #[tokio::test]
    async fn test_panicking_task_is_isolated() {
        let queue = Queue::default();

        let bad = queue.add(async { panic!("boom") });
        let good = queue.add(async { "ok" });

        assert_eq!(bad.await, Err::<(), _>(QueueError::Aborted));
        assert_eq!(good.await, Ok("ok"));
    }

    #[tokio::test]
    async fn test_queues_are_independent() {
        let blocked = Queue::default();
        let free = Queue::default();
        let gate = Arc::new(Semaphore::new(0));

        let g = gate.clone();
        let stuck = blocked.add(async move {
            let _ = g.acquire().await;
        });

        assert_eq!(free.add(async { 1 }).await, Ok(1));
        assert!(!blocked.is_idle());

        gate.add_permits(1);
        stuck.await.unwrap();
        blocked.on_idle().await;
        assert!(blocked.is_idle());
    }

    #[test]
    fn test_options_minimum_concurrency() {
        assert_eq!(QueueOptions::concurrent(0).concurrent, 1);
        let queue = Queue::new(QueueOptions {
            concurrent: 0,
            timeout: None,
        });
        assert_eq!(queue.options().concurrent, 1);
    }
}
