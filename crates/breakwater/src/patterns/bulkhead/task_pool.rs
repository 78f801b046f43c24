//! Task-pool bulkhead
//!
//! The async rendering of a fixed thread pool: `core_workers` long-lived
//! worker tasks drain a bounded queue, surplus workers up to `max_workers`
//! spawn under load and retire after `keep_alive` idle. Submission hands
//! back a completion handle; a full queue with no worker headroom is a
//! full-signal. The pool's lifecycle is tied to the bulkhead: closing it
//! stops intake and lets the workers drain what was already queued.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::core::error::{ConfigError, ConfigResult, ResilienceError};
use crate::core::event::EventPublisher;

use super::{BulkheadEvent, BulkheadEventKind};

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Task-pool bulkhead configuration. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPoolBulkheadConfig {
    /// Workers kept alive permanently
    pub core_workers: usize,
    /// Upper bound on workers under load
    pub max_workers: usize,
    /// Jobs the queue buffers before submission full-signals
    pub queue_capacity: usize,
    /// Idle time after which a surplus worker retires
    #[serde(with = "humantime_serde")]
    pub keep_alive: Duration,
}

impl Default for TaskPoolBulkheadConfig {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism().map_or(2, usize::from);
        Self {
            core_workers: parallelism.saturating_sub(1).max(1),
            max_workers: parallelism,
            queue_capacity: 100,
            keep_alive: Duration::from_millis(20),
        }
    }
}

impl TaskPoolBulkheadConfig {
    /// Start building a configuration.
    #[must_use]
    pub fn builder() -> TaskPoolBulkheadConfigBuilder {
        TaskPoolBulkheadConfigBuilder::default()
    }

    /// Validate field ranges.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.core_workers == 0 {
            return Err(ConfigError::validation("core_workers must be at least 1"));
        }
        if self.max_workers < self.core_workers {
            return Err(ConfigError::validation(
                "max_workers must be at least core_workers",
            ));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::validation("queue_capacity must be at least 1"));
        }
        Ok(())
    }
}

/// Builder for [`TaskPoolBulkheadConfig`].
#[derive(Default)]
pub struct TaskPoolBulkheadConfigBuilder {
    config: TaskPoolBulkheadConfig,
}

impl TaskPoolBulkheadConfigBuilder {
    /// Workers kept alive permanently.
    #[must_use]
    pub fn core_workers(mut self, workers: usize) -> Self {
        self.config.core_workers = workers;
        self
    }

    /// Upper bound on workers under load.
    #[must_use]
    pub fn max_workers(mut self, workers: usize) -> Self {
        self.config.max_workers = workers;
        self
    }

    /// Jobs the queue buffers before submission full-signals.
    #[must_use]
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    /// Idle time after which a surplus worker retires.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.config.keep_alive = keep_alive;
        self
    }

    /// Validate and build the configuration.
    pub fn build(self) -> ConfigResult<TaskPoolBulkheadConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl crate::core::config::ResilienceConfig for TaskPoolBulkheadConfig {
    fn validate(&self) -> ConfigResult<()> {
        self.validate()
    }
}

/// Point-in-time metrics of one task-pool bulkhead.
#[derive(Debug, Clone, Copy)]
pub struct TaskPoolBulkheadMetrics {
    /// Jobs waiting in the queue
    pub queue_depth: usize,
    /// Queue capacity
    pub queue_capacity: usize,
    /// Workers currently alive
    pub worker_count: usize,
    /// Workers currently running a job
    pub busy_workers: usize,
    /// Upper bound on workers
    pub max_workers: usize,
}

struct PoolInner {
    name: String,
    config: TaskPoolBulkheadConfig,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<Job>>,
    workers: AtomicUsize,
    busy: AtomicUsize,
    publisher: EventPublisher<BulkheadEvent>,
}

impl PoolInner {
    fn publish(&self, kind: BulkheadEventKind) {
        if self.publisher.has_subscribers() {
            self.publisher.publish(&BulkheadEvent {
                name: self.name.clone(),
                timestamp: SystemTime::now(),
                kind,
            });
        }
    }
}

/// A named task-pool bulkhead. Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct TaskPoolBulkhead {
    inner: Arc<PoolInner>,
}

impl TaskPoolBulkhead {
    /// Create the pool and spawn its core workers. Must be called within
    /// a tokio runtime.
    pub fn of(name: impl Into<String>, config: TaskPoolBulkheadConfig) -> ConfigResult<Self> {
        config.validate()?;
        let (sender, receiver) = mpsc::channel(config.queue_capacity);
        let inner = Arc::new(PoolInner {
            name: name.into(),
            sender: Mutex::new(Some(sender)),
            receiver: tokio::sync::Mutex::new(receiver),
            workers: AtomicUsize::new(0),
            busy: AtomicUsize::new(0),
            publisher: EventPublisher::new(),
            config,
        });
        let bulkhead = Self { inner };
        for _ in 0..bulkhead.inner.config.core_workers {
            bulkhead.inner.workers.fetch_add(1, Ordering::AcqRel);
            bulkhead.spawn_worker(true);
        }
        Ok(bulkhead)
    }

    /// Create the pool with default configuration.
    #[must_use]
    pub fn of_defaults(name: impl Into<String>) -> Self {
        Self::of(name, TaskPoolBulkheadConfig::default())
            .expect("default task pool bulkhead config is valid")
    }

    /// Instance name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The configuration the pool was built with.
    #[must_use]
    pub fn config(&self) -> &TaskPoolBulkheadConfig {
        &self.inner.config
    }

    /// Lifecycle event stream of this instance.
    #[must_use]
    pub fn event_publisher(&self) -> &EventPublisher<BulkheadEvent> {
        &self.inner.publisher
    }

    /// Queue and worker occupancy.
    #[must_use]
    pub fn metrics(&self) -> TaskPoolBulkheadMetrics {
        let capacity = self.inner.config.queue_capacity;
        let queue_depth = self
            .inner
            .sender
            .lock()
            .as_ref()
            .map_or(0, |sender| capacity - sender.capacity());
        TaskPoolBulkheadMetrics {
            queue_depth,
            queue_capacity: capacity,
            worker_count: self.inner.workers.load(Ordering::Relaxed),
            busy_workers: self.inner.busy.load(Ordering::Relaxed),
            max_workers: self.inner.config.max_workers,
        }
    }

    /// Queue `operation` for execution on the pool. Returns a handle that
    /// resolves with the operation's output, or `BulkheadFull` when the
    /// queue is full or the pool is closed.
    pub fn submit<T, F, Fut>(&self, operation: F) -> Result<CompletionHandle<T>, ResilienceError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let sender = self.inner.sender.lock().clone();
        let Some(sender) = sender else {
            self.inner.publish(BulkheadEventKind::CallRejected);
            return Err(self.full_error());
        };

        let (done_tx, done_rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            let _ = done_tx.send(operation().await);
        });

        match sender.try_send(job) {
            Ok(()) => {
                self.inner.publish(BulkheadEventKind::CallPermitted);
                self.reinforce_workers();
                Ok(CompletionHandle { receiver: done_rx })
            }
            Err(mpsc::error::TrySendError::Full(_) | mpsc::error::TrySendError::Closed(_)) => {
                self.inner.publish(BulkheadEventKind::CallRejected);
                Err(self.full_error())
            }
        }
    }

    /// Stop intake and let the workers drain the queued jobs. Core workers
    /// exit once the queue is empty; already-submitted handles still
    /// resolve.
    pub fn close(&self) {
        debug!(name = %self.inner.name, "closing task pool bulkhead");
        self.inner.sender.lock().take();
    }

    /// Spawn a surplus worker when every live worker is busy and the
    /// worker budget allows one more. The bound is enforced with a
    /// compare-exchange so concurrent submitters cannot overshoot
    /// `max_workers`.
    fn reinforce_workers(&self) {
        let mut workers = self.inner.workers.load(Ordering::Acquire);
        loop {
            if workers >= self.inner.config.max_workers
                || self.inner.busy.load(Ordering::Acquire) < workers
            {
                return;
            }
            match self.inner.workers.compare_exchange(
                workers,
                workers + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => workers = actual,
            }
        }
        self.spawn_worker(false);
    }

    /// The caller has already counted this worker in `workers`.
    fn spawn_worker(&self, core: bool) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                let job = {
                    let mut receiver = inner.receiver.lock().await;
                    if core {
                        receiver.recv().await
                    } else {
                        match tokio::time::timeout(inner.config.keep_alive, receiver.recv()).await {
                            Ok(job) => job,
                            // Idle past keep-alive: retire.
                            Err(_) => None,
                        }
                    }
                };
                let Some(job) = job else { break };
                inner.busy.fetch_add(1, Ordering::AcqRel);
                job.await;
                inner.busy.fetch_sub(1, Ordering::AcqRel);
                inner.publish(BulkheadEventKind::CallFinished);
            }
            inner.workers.fetch_sub(1, Ordering::AcqRel);
        });
    }

    fn full_error(&self) -> ResilienceError {
        ResilienceError::bulkhead_full(self.name(), self.inner.config.max_workers)
    }
}

impl std::fmt::Debug for TaskPoolBulkhead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskPoolBulkhead")
            .field("name", &self.name())
            .field("metrics", &self.metrics())
            .finish_non_exhaustive()
    }
}

/// Resolves with the submitted operation's output. Dropping the handle
/// does not cancel the queued job.
#[derive(Debug)]
pub struct CompletionHandle<T> {
    receiver: oneshot::Receiver<T>,
}

impl<T> Future for CompletionHandle<T> {
    type Output = Result<T, ResilienceError>;

    fn poll(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.receiver)
            .poll(cx)
            .map(|result| result.map_err(|_| ResilienceError::Cancelled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(core: usize, max: usize, queue: usize) -> TaskPoolBulkhead {
        TaskPoolBulkhead::of(
            "pool",
            TaskPoolBulkheadConfig::builder()
                .core_workers(core)
                .max_workers(max)
                .queue_capacity(queue)
                .keep_alive(Duration::from_millis(20))
                .build()
                .unwrap(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_submit_resolves_with_the_result() {
        let pool = pool(2, 2, 10);
        let handle = pool.submit(|| async { 7 * 6 }).unwrap();
        assert_eq!(handle.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_full_queue_is_a_full_signal() {
        let pool = pool(1, 1, 1);
        let (gate_tx, gate_rx) = oneshot::channel::<()>();

        // Occupy the only worker, then the only queue slot.
        let running = pool
            .submit(move || async move {
                let _ = gate_rx.await;
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let queued = pool.submit(|| async {}).unwrap();

        let err = pool.submit(|| async {}).unwrap_err();
        assert!(matches!(err, ResilienceError::BulkheadFull { .. }));

        gate_tx.send(()).unwrap();
        running.await.unwrap();
        queued.await.unwrap();
    }

    #[tokio::test]
    async fn test_surplus_workers_add_parallelism_under_load() {
        let pool = pool(1, 3, 10);
        let started = std::time::Instant::now();

        let mut handles = Vec::new();
        for _ in 0..3 {
            handles.push(
                pool.submit(|| async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                })
                .unwrap(),
            );
            // Let the previous job reach a worker so saturation is visible.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // Three 100ms jobs on three workers beat a serial 300ms run.
        assert!(
            started.elapsed() < Duration::from_millis(280),
            "expected surplus workers to run jobs in parallel"
        );
    }

    #[tokio::test]
    async fn test_surplus_workers_retire_after_keep_alive() {
        let pool = pool(1, 4, 10);
        let mut handles = Vec::new();
        for _ in 0..4 {
            handles.push(
                pool.submit(|| async {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                })
                .unwrap(),
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        for handle in handles {
            handle.await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(pool.metrics().worker_count, 1);
    }

    #[tokio::test]
    async fn test_close_drains_queued_jobs_and_refuses_new_ones() {
        let pool = pool(1, 1, 10);
        let handles: Vec<_> = (0..5)
            .map(|i| {
                pool.submit(move || async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    i
                })
                .unwrap()
            })
            .collect();

        pool.close();
        assert!(pool.submit(|| async {}).is_err());

        // Already-queued jobs still resolve.
        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap(), i);
        }
    }
}
