//! Named-instance cache underlying the public registries
//!
//! Construction is compute-if-absent: the factory for a given name runs at
//! most once even under concurrent first access, because insertion happens
//! under the write lock after a double-checked read.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// String-keyed cache of shared primitive instances.
pub struct NamedRegistry<T> {
    instances: RwLock<HashMap<String, Arc<T>>>,
}

impl<T> NamedRegistry<T> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
        }
    }

    /// Return the instance registered under `name`, constructing it with
    /// `factory` on first access. Repeated calls return the same `Arc`.
    pub fn get_or_insert_with<F>(&self, name: &str, factory: F) -> Arc<T>
    where
        F: FnOnce() -> T,
    {
        if let Some(existing) = self.instances.read().get(name) {
            return Arc::clone(existing);
        }
        let mut instances = self.instances.write();
        // Re-check: another caller may have won the race for the write lock.
        if let Some(existing) = instances.get(name) {
            return Arc::clone(existing);
        }
        let instance = Arc::new(factory());
        instances.insert(name.to_owned(), Arc::clone(&instance));
        instance
    }

    /// Fallible form of [`get_or_insert_with`](Self::get_or_insert_with):
    /// a factory error leaves the registry unchanged, and the factory
    /// still runs at most once per name under concurrency.
    pub fn try_get_or_insert_with<F, E>(&self, name: &str, factory: F) -> Result<Arc<T>, E>
    where
        F: FnOnce() -> Result<T, E>,
    {
        if let Some(existing) = self.instances.read().get(name) {
            return Ok(Arc::clone(existing));
        }
        let mut instances = self.instances.write();
        if let Some(existing) = instances.get(name) {
            return Ok(Arc::clone(existing));
        }
        let instance = Arc::new(factory()?);
        instances.insert(name.to_owned(), Arc::clone(&instance));
        Ok(instance)
    }

    /// Look up an instance without constructing.
    pub fn find(&self, name: &str) -> Option<Arc<T>> {
        self.instances.read().get(name).cloned()
    }

    /// Remove and return the instance registered under `name`.
    pub fn remove(&self, name: &str) -> Option<Arc<T>> {
        self.instances.write().remove(name)
    }

    /// Names of all registered instances.
    pub fn names(&self) -> Vec<String> {
        self.instances.read().keys().cloned().collect()
    }

    /// All registered instances.
    pub fn all(&self) -> Vec<Arc<T>> {
        self.instances.read().values().cloned().collect()
    }

    /// Number of registered instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instances.read().len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instances.read().is_empty()
    }
}

impl<T> Default for NamedRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}
