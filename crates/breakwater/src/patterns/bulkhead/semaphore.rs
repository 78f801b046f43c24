//! Semaphore bulkhead
//!
//! Permits live in a tokio semaphore; the RAII [`BulkheadPermit`] releases
//! exactly once on drop, so every successful acquire pairs with one
//! release no matter how the guarded call ends. Shrinking the limit at
//! runtime retires permits as in-flight calls finish, through a forget
//! debt the permit guards settle.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::core::error::{ConfigResult, ExecuteError, ResilienceError};
use crate::core::event::EventPublisher;

use super::{BulkheadConfig, BulkheadEvent, BulkheadEventKind, BulkheadMetrics};

struct Inner {
    name: String,
    config: Mutex<BulkheadConfig>,
    semaphore: Semaphore,
    /// Permits to swallow instead of returning, after a limit decrease
    /// outran the permits that were free at the time.
    forget_debt: AtomicUsize,
    publisher: EventPublisher<BulkheadEvent>,
}

impl Inner {
    fn publish(&self, kind: BulkheadEventKind) {
        if self.publisher.has_subscribers() {
            self.publisher.publish(&BulkheadEvent::now(&self.name, kind));
        }
    }
}

/// A named semaphore bulkhead. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SemaphoreBulkhead {
    inner: Arc<Inner>,
}

impl SemaphoreBulkhead {
    /// Create a bulkhead with the given configuration.
    pub fn of(name: impl Into<String>, config: BulkheadConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                name: name.into(),
                semaphore: Semaphore::new(config.max_concurrent_calls),
                config: Mutex::new(config),
                forget_debt: AtomicUsize::new(0),
                publisher: EventPublisher::new(),
            }),
        })
    }

    /// Create a bulkhead with default configuration.
    #[must_use]
    pub fn of_defaults(name: impl Into<String>) -> Self {
        Self::of(name, BulkheadConfig::default()).expect("default bulkhead config is valid")
    }

    /// Instance name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The configuration currently in force.
    #[must_use]
    pub fn config(&self) -> BulkheadConfig {
        self.inner.config.lock().clone()
    }

    /// Lifecycle event stream of this instance.
    #[must_use]
    pub fn event_publisher(&self) -> &EventPublisher<BulkheadEvent> {
        &self.inner.publisher
    }

    /// Current permit availability.
    #[must_use]
    pub fn metrics(&self) -> BulkheadMetrics {
        BulkheadMetrics {
            available_concurrent_calls: self.inner.semaphore.available_permits(),
            max_allowed_concurrent_calls: self.inner.config.lock().max_concurrent_calls,
        }
    }

    /// Replace the configuration. Future acquires honor the new cap
    /// immediately; in-flight calls are unaffected, and a shrink beyond
    /// the currently free permits completes as those calls finish.
    pub fn change_config(&self, config: BulkheadConfig) -> ConfigResult<()> {
        config.validate()?;
        let mut current = self.inner.config.lock();
        let old_max = current.max_concurrent_calls;
        let new_max = config.max_concurrent_calls;
        if new_max > old_max {
            let mut grow = new_max - old_max;
            // Growth first cancels outstanding debt.
            let mut debt = self.inner.forget_debt.load(Ordering::Acquire);
            while debt > 0 && grow > 0 {
                let settle = debt.min(grow);
                match self.inner.forget_debt.compare_exchange(
                    debt,
                    debt - settle,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => grow -= settle,
                    Err(actual) => debt = actual,
                }
                if grow == 0 {
                    break;
                }
                debt = self.inner.forget_debt.load(Ordering::Acquire);
            }
            self.inner.semaphore.add_permits(grow);
        } else if new_max < old_max {
            let shrink = old_max - new_max;
            let forgotten = self.inner.semaphore.forget_permits(shrink);
            self.inner
                .forget_debt
                .fetch_add(shrink - forgotten, Ordering::AcqRel);
        }
        *current = config;
        debug!(name = %self.inner.name, old_max, new_max, "bulkhead limit changed");
        Ok(())
    }

    /// Acquire a permit without waiting.
    #[must_use]
    pub fn try_acquire_permission(&self) -> Option<BulkheadPermit> {
        match self.inner.semaphore.try_acquire() {
            Ok(permit) => {
                permit.forget();
                self.inner.publish(BulkheadEventKind::CallPermitted);
                Some(BulkheadPermit {
                    inner: Arc::clone(&self.inner),
                })
            }
            Err(_) => {
                self.inner.publish(BulkheadEventKind::CallRejected);
                None
            }
        }
    }

    /// Acquire a permit, waiting up to `max_wait_duration`.
    pub async fn acquire_permission(&self) -> Result<BulkheadPermit, ResilienceError> {
        let max_wait = self.inner.config.lock().max_wait_duration;
        if max_wait.is_zero() {
            return self.try_acquire_permission().ok_or_else(|| self.full_error());
        }
        match tokio::time::timeout(max_wait, self.inner.semaphore.acquire()).await {
            Ok(Ok(permit)) => {
                permit.forget();
                self.inner.publish(BulkheadEventKind::CallPermitted);
                Ok(BulkheadPermit {
                    inner: Arc::clone(&self.inner),
                })
            }
            // The semaphore is never closed; treat both arms as rejection.
            Ok(Err(_)) | Err(_) => {
                self.inner.publish(BulkheadEventKind::CallRejected);
                Err(self.full_error())
            }
        }
    }

    /// Run `operation` holding one permit; the permit is released when the
    /// operation settles, successful or not.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, ExecuteError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let _permit = self
            .acquire_permission()
            .await
            .map_err(ExecuteError::Rejected)?;
        operation().await.map_err(ExecuteError::Inner)
    }

    /// Wrap `operation` so every invocation runs under this bulkhead.
    pub fn decorate<T, E, F, Fut>(
        &self,
        operation: F,
    ) -> impl Fn() -> std::pin::Pin<Box<dyn Future<Output = Result<T, ExecuteError<E>>> + Send>>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let bulkhead = self.clone();
        let operation = Arc::new(operation);
        move || {
            let bulkhead = bulkhead.clone();
            let operation = Arc::clone(&operation);
            Box::pin(async move { bulkhead.execute(|| (*operation)()).await })
        }
    }

    fn full_error(&self) -> ResilienceError {
        ResilienceError::bulkhead_full(
            self.name(),
            self.inner.config.lock().max_concurrent_calls,
        )
    }
}

impl std::fmt::Debug for SemaphoreBulkhead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SemaphoreBulkhead")
            .field("name", &self.name())
            .field("metrics", &self.metrics())
            .finish_non_exhaustive()
    }
}

/// Held proof of admission. Dropping it releases exactly one permit (or
/// settles one unit of forget debt after a limit decrease).
pub struct BulkheadPermit {
    inner: Arc<Inner>,
}

impl Drop for BulkheadPermit {
    fn drop(&mut self) {
        let settled_debt = self
            .inner
            .forget_debt
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |debt| {
                (debt > 0).then_some(debt - 1)
            })
            .is_ok();
        if !settled_debt {
            self.inner.semaphore.add_permits(1);
        }
        self.inner.publish(BulkheadEventKind::CallFinished);
    }
}

impl std::fmt::Debug for BulkheadPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkheadPermit").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulkhead(max: usize, wait: Duration) -> SemaphoreBulkhead {
        SemaphoreBulkhead::of(
            "test",
            BulkheadConfig::builder()
                .max_concurrent_calls(max)
                .max_wait_duration(wait)
                .build()
                .unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_saturation_then_release_readmits() {
        let bulkhead = bulkhead(1, Duration::ZERO);

        let held = bulkhead.try_acquire_permission().unwrap();
        assert!(bulkhead.try_acquire_permission().is_none());

        drop(held);
        assert!(bulkhead.try_acquire_permission().is_some());
    }

    #[test]
    fn test_each_acquire_pairs_with_one_release() {
        let bulkhead = bulkhead(3, Duration::ZERO);
        let permits: Vec<_> = (0..3)
            .map(|_| bulkhead.try_acquire_permission().unwrap())
            .collect();
        assert_eq!(bulkhead.metrics().available_concurrent_calls, 0);

        drop(permits);
        assert_eq!(bulkhead.metrics().available_concurrent_calls, 3);
    }

    #[tokio::test]
    async fn test_bounded_wait_rejects_with_bulkhead_full() {
        let bulkhead = bulkhead(1, Duration::from_millis(50));
        let held = bulkhead.acquire_permission().await.unwrap();

        let started = std::time::Instant::now();
        let err = bulkhead.acquire_permission().await.unwrap_err();
        assert!(matches!(
            err,
            ResilienceError::BulkheadFull {
                max_concurrent_calls: 1,
                ..
            }
        ));
        assert!(started.elapsed() >= Duration::from_millis(45));
        drop(held);
    }

    #[tokio::test]
    async fn test_waiter_proceeds_when_permit_frees_up() {
        let bulkhead = bulkhead(1, Duration::from_millis(500));
        let held = bulkhead.acquire_permission().await.unwrap();

        let contender = {
            let bulkhead = bulkhead.clone();
            tokio::spawn(async move { bulkhead.acquire_permission().await.is_ok() })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(held);

        assert!(contender.await.unwrap());
    }

    #[test]
    fn test_growing_the_limit_adds_permits_immediately() {
        let bulkhead = bulkhead(1, Duration::ZERO);
        let _held = bulkhead.try_acquire_permission().unwrap();
        assert!(bulkhead.try_acquire_permission().is_none());

        bulkhead
            .change_config(BulkheadConfig::builder().max_concurrent_calls(3).build().unwrap())
            .unwrap();
        assert!(bulkhead.try_acquire_permission().is_some());
        assert_eq!(bulkhead.metrics().max_allowed_concurrent_calls, 3);
    }

    #[test]
    fn test_shrinking_spares_in_flight_calls() {
        let bulkhead = bulkhead(3, Duration::ZERO);
        let first = bulkhead.try_acquire_permission().unwrap();
        let second = bulkhead.try_acquire_permission().unwrap();

        // 3 -> 1 with two calls in flight: the free permit is retired now,
        // one more retires as a call finishes.
        bulkhead
            .change_config(BulkheadConfig::builder().max_concurrent_calls(1).build().unwrap())
            .unwrap();
        assert!(bulkhead.try_acquire_permission().is_none());

        drop(first);
        assert!(bulkhead.try_acquire_permission().is_none());

        drop(second);
        assert!(bulkhead.try_acquire_permission().is_some());
    }

    #[tokio::test]
    async fn test_execute_releases_on_user_error() {
        let bulkhead = bulkhead(1, Duration::ZERO);

        let result = bulkhead
            .execute(|| async { Err::<(), _>(std::io::Error::other("boom")) })
            .await;
        assert!(matches!(result, Err(ExecuteError::Inner(_))));

        // Failure released the permit.
        assert!(bulkhead.try_acquire_permission().is_some());
    }

    #[tokio::test]
    async fn test_decorate_wraps_repeated_invocations() {
        let bulkhead = bulkhead(2, Duration::ZERO);
        let guarded = bulkhead.decorate(|| async { Ok::<_, std::io::Error>(5) });

        assert_eq!(guarded().await.unwrap(), 5);
        assert_eq!(guarded().await.unwrap(), 5);
        assert_eq!(bulkhead.metrics().available_concurrent_calls, 2);
    }

    #[test]
    fn test_events_follow_the_permit_lifecycle() {
        let bulkhead = bulkhead(1, Duration::ZERO);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bulkhead
            .event_publisher()
            .on_event(move |event: &BulkheadEvent| sink.lock().push(event.kind));

        let held = bulkhead.try_acquire_permission().unwrap();
        assert!(bulkhead.try_acquire_permission().is_none());
        drop(held);

        assert_eq!(
            *seen.lock(),
            vec![
                BulkheadEventKind::CallPermitted,
                BulkheadEventKind::CallRejected,
                BulkheadEventKind::CallFinished,
            ]
        );
    }
}
