//! Per-name monotone counters, named as an external collaborator in §6.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// A single thread-safe monotone counter.
#[derive(Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Increments the counter by one and returns its prior value.
    pub fn increment(&self) -> u64 {
        self.value.fetch_add(1, Ordering::Relaxed)
    }

    /// Increments the counter by `n` and returns its prior value.
    pub fn increment_by(&self, n: u64) -> u64 {
        self.value.fetch_add(n, Ordering::Relaxed)
    }

    /// The counter's current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Produces counters by name.
pub trait CounterFactory: Send + Sync {
    /// Returns the (possibly newly created) counter bound to `name`.
    fn get(&self, name: &str) -> Arc<Counter>;
}

/// A counter factory backed by a lock-protected name table.
#[derive(Default)]
pub struct LocalCounterFactory {
    counters: Mutex<HashMap<String, Arc<Counter>>>,
}

impl LocalCounterFactory {
    /// An empty factory.
    pub fn new() -> Self {
        Self::default()
    }
}

impl CounterFactory for LocalCounterFactory {
    fn get(&self, name: &str) -> Arc<Counter> {
        self.counters.lock().unwrap().entry(name.to_string()).or_default().clone()
    }
}

/// A factory that hands out a fresh, never-shared counter for every name.
///
/// Used where no aggregation across calls is needed (tests, the default
/// graph configuration).
#[derive(Default)]
pub struct NullCounterFactory;

impl CounterFactory for NullCounterFactory {
    fn get(&self, _name: &str) -> Arc<Counter> {
        Arc::new(Counter::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_factory_shares_counters_by_name() {
        let factory = LocalCounterFactory::new();
        let a = factory.get("x");
        let b = factory.get("x");
        a.increment();
        assert_eq!(b.get(), 1);
    }

    #[test]
    fn null_factory_never_shares() {
        let factory = NullCounterFactory;
        let a = factory.get("x");
        let b = factory.get("x");
        a.increment();
        assert_eq!(b.get(), 0);
    }
}
