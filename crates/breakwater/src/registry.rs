//! Named-instance registries, one per primitive kind
//!
//! A registry caches instances by name with compute-if-absent semantics:
//! concurrent first access constructs exactly once, and every later access
//! returns the same shared instance. Each registry carries a default
//! configuration plus a table of named configurations registered up
//! front, both validated at registration time so instance creation cannot
//! fail later.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::core::config::ResilienceConfig;
use crate::core::error::{ConfigError, ConfigResult};
use crate::core::registry::NamedRegistry;
use crate::patterns::bulkhead::{
    AdaptiveBulkhead, AdaptiveBulkheadConfig, BulkheadConfig, SemaphoreBulkhead, TaskPoolBulkhead,
    TaskPoolBulkheadConfig,
};
use crate::patterns::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::patterns::rate_limiter::{CycleRateLimiter, RateLimiterConfig};
use crate::patterns::retry::{Retry, RetryConfig};

/// Generic registry over one primitive kind.
pub struct PatternRegistry<P, C> {
    default_config: C,
    configurations: RwLock<HashMap<String, C>>,
    instances: NamedRegistry<P>,
    factory: fn(&str, C) -> ConfigResult<P>,
}

impl<P, C: ResilienceConfig> PatternRegistry<P, C> {
    fn new(default_config: C, factory: fn(&str, C) -> ConfigResult<P>) -> ConfigResult<Self> {
        default_config.validate()?;
        Ok(Self {
            default_config,
            configurations: RwLock::new(HashMap::new()),
            instances: NamedRegistry::new(),
            factory,
        })
    }

    /// The default configuration instances are created with.
    pub fn default_config(&self) -> &C {
        &self.default_config
    }

    /// Register a named configuration for later
    /// [`get_or_create_with_config_name`](Self::get_or_create_with_config_name)
    /// lookups.
    pub fn add_configuration(&self, name: impl Into<String>, config: C) -> ConfigResult<()> {
        config.validate()?;
        self.configurations.write().insert(name.into(), config);
        Ok(())
    }

    /// Return the instance registered under `name`, creating it with the
    /// default configuration on first access.
    pub fn get_or_create(&self, name: &str) -> Arc<P> {
        let config = self.default_config.clone();
        self.create_validated(name, config)
    }

    /// Return the instance registered under `name`, creating it with
    /// `config` on first access. The configuration only applies to the
    /// creation; an existing instance is returned as-is.
    pub fn get_or_create_with(&self, name: &str, config: C) -> ConfigResult<Arc<P>> {
        config.validate()?;
        Ok(self.create_validated(name, config))
    }

    /// Like [`get_or_create`](Self::get_or_create) but with a
    /// configuration registered through
    /// [`add_configuration`](Self::add_configuration).
    pub fn get_or_create_with_config_name(
        &self,
        name: &str,
        config_name: &str,
    ) -> ConfigResult<Arc<P>> {
        let config = self
            .configurations
            .read()
            .get(config_name)
            .cloned()
            .ok_or_else(|| {
                ConfigError::validation(format!("no configuration named '{config_name}'"))
            })?;
        Ok(self.create_validated(name, config))
    }

    /// Look up an instance without constructing.
    pub fn find(&self, name: &str) -> Option<Arc<P>> {
        self.instances.find(name)
    }

    /// Remove and return the instance registered under `name`.
    pub fn remove(&self, name: &str) -> Option<Arc<P>> {
        self.instances.remove(name)
    }

    /// Names of all registered instances.
    pub fn names(&self) -> Vec<String> {
        self.instances.names()
    }

    /// All registered instances.
    pub fn all(&self) -> Vec<Arc<P>> {
        self.instances.all()
    }

    fn create_validated(&self, name: &str, config: C) -> Arc<P> {
        self.instances
            .try_get_or_insert_with(name, || (self.factory)(name, config))
            .expect("configuration was validated before construction")
    }
}

impl<P, C: ResilienceConfig> std::fmt::Debug for PatternRegistry<P, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatternRegistry")
            .field("instances", &self.names())
            .finish_non_exhaustive()
    }
}

/// Registry of named [`CircuitBreaker`]s.
pub type CircuitBreakerRegistry = PatternRegistry<CircuitBreaker, CircuitBreakerConfig>;

impl CircuitBreakerRegistry {
    /// Registry creating breakers with the default configuration.
    #[must_use]
    pub fn of_defaults() -> Self {
        Self::of(CircuitBreakerConfig::default()).expect("default circuit breaker config is valid")
    }

    /// Registry creating breakers with `default_config`.
    pub fn of(default_config: CircuitBreakerConfig) -> ConfigResult<Self> {
        Self::new(default_config, |name, config| {
            CircuitBreaker::of(name, config)
        })
    }
}

/// Registry of named [`CycleRateLimiter`]s.
pub type RateLimiterRegistry = PatternRegistry<CycleRateLimiter, RateLimiterConfig>;

impl RateLimiterRegistry {
    /// Registry creating limiters with the default configuration.
    #[must_use]
    pub fn of_defaults() -> Self {
        Self::of(RateLimiterConfig::default()).expect("default rate limiter config is valid")
    }

    /// Registry creating limiters with `default_config`.
    pub fn of(default_config: RateLimiterConfig) -> ConfigResult<Self> {
        Self::new(default_config, |name, config| {
            CycleRateLimiter::of(name, config)
        })
    }
}

/// Registry of named [`SemaphoreBulkhead`]s.
pub type BulkheadRegistry = PatternRegistry<SemaphoreBulkhead, BulkheadConfig>;

impl BulkheadRegistry {
    /// Registry creating bulkheads with the default configuration.
    #[must_use]
    pub fn of_defaults() -> Self {
        Self::of(BulkheadConfig::default()).expect("default bulkhead config is valid")
    }

    /// Registry creating bulkheads with `default_config`.
    pub fn of(default_config: BulkheadConfig) -> ConfigResult<Self> {
        Self::new(default_config, |name, config| {
            SemaphoreBulkhead::of(name, config)
        })
    }
}

/// Registry of named [`TaskPoolBulkhead`]s.
pub type TaskPoolBulkheadRegistry = PatternRegistry<TaskPoolBulkhead, TaskPoolBulkheadConfig>;

impl TaskPoolBulkheadRegistry {
    /// Registry creating pools with the default configuration.
    #[must_use]
    pub fn of_defaults() -> Self {
        Self::of(TaskPoolBulkheadConfig::default())
            .expect("default task pool bulkhead config is valid")
    }

    /// Registry creating pools with `default_config`.
    pub fn of(default_config: TaskPoolBulkheadConfig) -> ConfigResult<Self> {
        Self::new(default_config, |name, config| {
            TaskPoolBulkhead::of(name, config)
        })
    }
}

/// Registry of named [`AdaptiveBulkhead`]s.
pub type AdaptiveBulkheadRegistry = PatternRegistry<AdaptiveBulkhead, AdaptiveBulkheadConfig>;

impl AdaptiveBulkheadRegistry {
    /// Registry creating adaptive bulkheads with the default
    /// configuration.
    #[must_use]
    pub fn of_defaults() -> Self {
        Self::of(AdaptiveBulkheadConfig::default())
            .expect("default adaptive bulkhead config is valid")
    }

    /// Registry creating adaptive bulkheads with `default_config`.
    pub fn of(default_config: AdaptiveBulkheadConfig) -> ConfigResult<Self> {
        Self::new(default_config, |name, config| {
            AdaptiveBulkhead::of(name, config)
        })
    }
}

/// Registry of named [`Retry`]s.
pub type RetryRegistry = PatternRegistry<Retry, RetryConfig>;

impl RetryRegistry {
    /// Registry creating retries with the default configuration.
    #[must_use]
    pub fn of_defaults() -> Self {
        Self::of(RetryConfig::default()).expect("default retry config is valid")
    }

    /// Registry creating retries with `default_config`.
    pub fn of(default_config: RetryConfig) -> ConfigResult<Self> {
        Self::new(default_config, |name, config| Retry::of(name, config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_name_yields_the_same_instance() {
        let registry = CircuitBreakerRegistry::of_defaults();
        let a = registry.get_or_create("backend");
        let b = registry.get_or_create("backend");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.name(), "backend");
    }

    #[test]
    fn test_creation_config_applies_only_on_first_access() {
        let registry = BulkheadRegistry::of_defaults();
        let first = registry
            .get_or_create_with(
                "db",
                BulkheadConfig::builder().max_concurrent_calls(3).build().unwrap(),
            )
            .unwrap();
        assert_eq!(first.metrics().max_allowed_concurrent_calls, 3);

        // A different config for the same name returns the original.
        let second = registry
            .get_or_create_with(
                "db",
                BulkheadConfig::builder().max_concurrent_calls(9).build().unwrap(),
            )
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.metrics().max_allowed_concurrent_calls, 3);
    }

    #[test]
    fn test_named_configurations_resolve() {
        let registry = RetryRegistry::of_defaults();
        registry
            .add_configuration(
                "aggressive",
                RetryConfig::builder().max_attempts(7).build().unwrap(),
            )
            .unwrap();

        let retry = registry
            .get_or_create_with_config_name("sync-job", "aggressive")
            .unwrap();
        assert_eq!(retry.config().max_attempts, 7);

        assert!(registry
            .get_or_create_with_config_name("other", "missing")
            .is_err());
    }

    #[test]
    fn test_invalid_configurations_are_rejected_up_front() {
        let registry = RateLimiterRegistry::of_defaults();
        let invalid = RateLimiterConfig {
            limit_for_period: 0,
            ..RateLimiterConfig::default()
        };
        assert!(registry.add_configuration("broken", invalid.clone()).is_err());
        assert!(registry.get_or_create_with("svc", invalid).is_err());
        assert!(registry.find("svc").is_none());
    }

    #[test]
    fn test_concurrent_first_access_constructs_once() {
        let registry = Arc::new(RateLimiterRegistry::of_defaults());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.get_or_create("api"))
            })
            .collect();

        let instances: Vec<_> = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect();
        for instance in &instances[1..] {
            assert!(Arc::ptr_eq(&instances[0], instance));
        }
        assert_eq!(registry.names(), vec!["api"]);
    }

    #[test]
    fn test_remove_forgets_the_instance() {
        let registry = CircuitBreakerRegistry::of_defaults();
        let first = registry.get_or_create("transient");
        assert!(registry.remove("transient").is_some());

        let second = registry.get_or_create("transient");
        assert!(!Arc::ptr_eq(&first, &second));
    }
}
