//! Input/output stream handlers: the policy layer that turns per-stream
//! arrivals into coherent per-node invocations (§4.3).

pub mod barrier;
pub mod default;
pub mod fixed_size;
pub mod immediate;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::Error;
use crate::packet::Packet;
use crate::stream::input::InputStreamManager;
use crate::stream::output::{OutputShard, OutputStreamManager};
use crate::timestamp::Timestamp;

pub use barrier::BarrierInputStreamHandler;
pub use default::DefaultInputStreamHandler;
pub use fixed_size::FixedSizeInputStreamHandler;
pub use immediate::ImmediateInputStreamHandler;

/// One scheduled execution of `Calculator::process`: a timestamp and a
/// per-input packet set (`None` where the sync set left that input unfilled,
/// as happens under the immediate handler).
#[derive(Debug, Clone)]
pub struct Invocation {
    /// The timestamp this invocation runs at.
    pub timestamp: Timestamp,
    /// One slot per node input; `None` where no packet participates.
    pub inputs: Vec<Option<Packet>>,
}

/// Decides when a node is ready and with which packet set to invoke it.
///
/// `schedule_invocations` runs under a single lock (the handler's own), and
/// must never itself be called while the caller holds that lock — the
/// scheduler obtains invocations, drops the lock, and only then hands them to
/// the node's schedule callback.
pub trait InputStreamHandler: Send + Sync {
    /// Installs the shared queue-size bound, stamped onto every input.
    fn set_max_queue_size(&self, inputs: &[Arc<InputStreamManager>], size: Option<usize>) {
        for input in inputs {
            input.set_max_queue_size(size);
        }
    }

    /// Produces up to `max_allowance` ready invocations, calling `emit` for
    /// each, in strictly increasing timestamp order. If no invocation was
    /// ready, returns the earliest timestamp at which one might become ready,
    /// so the node can advance its output bound without starving downstream
    /// consumers.
    fn schedule_invocations(&self, inputs: &[Arc<InputStreamManager>], max_allowance: usize, emit: &mut dyn FnMut(Invocation)) -> Option<Timestamp>;
}

/// Tracks how many of a node's input headers are still unset, firing once
/// when the count reaches zero.
pub struct HeaderReadyTracker {
    remaining: Mutex<usize>,
}

impl HeaderReadyTracker {
    /// Creates a tracker expecting `count` headers, firing immediately if
    /// `count == 0`.
    pub fn new(count: usize) -> Self {
        HeaderReadyTracker { remaining: Mutex::new(count) }
    }

    /// Records one header as having arrived (or as never expected in the
    /// first place); returns `true` exactly once, the moment the count
    /// reaches zero.
    pub fn mark_one_ready(&self) -> bool {
        let mut remaining = self.remaining.lock().unwrap();
        if *remaining == 0 {
            return false;
        }
        *remaining -= 1;
        *remaining == 0
    }

    /// Whether every header has already arrived.
    pub fn is_ready(&self) -> bool {
        *self.remaining.lock().unwrap() == 0
    }
}

/// Packages per-invocation output shards and commits them to the shared
/// output stream managers in one step at the end of `Process` (§4.3).
pub struct OutputStreamHandler {
    /// `TimestampOffset` relative to the node's invocation timestamp, one
    /// entry per output, used to infer a bound when the calculator does not
    /// set one explicitly.
    offsets: Vec<Option<i64>>,
}

impl OutputStreamHandler {
    /// Creates a handler for a node with `output_count` outputs, none of
    /// which has a declared offset yet.
    pub fn new(output_count: usize) -> Self {
        OutputStreamHandler { offsets: vec![None; output_count] }
    }

    /// Declares the `TimestampOffset` for one output.
    pub fn set_offset(&mut self, output_index: usize, offset: i64) {
        self.offsets[output_index] = Some(offset);
    }

    /// Commits every output's shard, inferring an output bound from
    /// `invocation_ts` via the declared offset wherever the shard itself did
    /// not set one.
    pub fn commit(&self, outputs: &[Arc<OutputStreamManager>], mut shards: Vec<OutputShard>, invocation_ts: Timestamp) -> Result<(), Error> {
        for (index, output) in outputs.iter().enumerate() {
            let mut shard = std::mem::take(&mut shards[index]);
            if !shard.has_bound() {
                if let Some(offset) = self.offsets[index] {
                    shard.set_next_timestamp_bound(invocation_ts.checked_add(offset)?);
                }
            }
            output.propagate_updates_to_mirrors(shard)?;
        }
        Ok(())
    }
}

/// Registry keyed by type name, producing stream handler instances from a
/// contract (§6, "stream handler factory").
#[derive(Default)]
pub struct StreamHandlerFactory {
    constructors: Mutex<HashMap<String, Arc<dyn Fn() -> Arc<dyn InputStreamHandler> + Send + Sync>>>,
}

impl StreamHandlerFactory {
    /// A factory pre-registered with the four built-in handlers.
    pub fn with_defaults() -> Self {
        let factory = StreamHandlerFactory::default();
        factory.register("default", || Arc::new(DefaultInputStreamHandler::new(false)));
        factory.register("default_with_offset", || Arc::new(DefaultInputStreamHandler::new(true)));
        factory.register("immediate", || Arc::new(ImmediateInputStreamHandler::new()));
        factory.register("barrier", || Arc::new(BarrierInputStreamHandler::new()));
        factory
    }

    /// Binds a type name to a constructor.
    pub fn register(&self, name: impl Into<String>, ctor: impl Fn() -> Arc<dyn InputStreamHandler> + Send + Sync + 'static) {
        self.constructors.lock().unwrap().insert(name.into(), Arc::new(ctor));
    }

    /// Constructs a handler instance by type name.
    pub fn create(&self, name: &str) -> Result<Arc<dyn InputStreamHandler>, Error> {
        let ctors = self.constructors.lock().unwrap();
        let ctor = ctors.get(name).ok_or_else(|| Error::NotFound(format!("no stream handler registered as `{name}`")))?;
        Ok(ctor())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_tracker_fires_exactly_once() {
        let t = HeaderReadyTracker::new(2);
        assert!(!t.mark_one_ready());
        assert!(t.mark_one_ready());
        assert!(!t.mark_one_ready());
    }

    #[test]
    fn zero_count_tracker_is_ready_immediately() {
        let t = HeaderReadyTracker::new(0);
        assert!(t.is_ready());
    }

    #[test]
    fn factory_creates_registered_handlers() {
        let factory = StreamHandlerFactory::with_defaults();
        assert!(factory.create("default").is_ok());
        assert!(factory.create("immediate").is_ok());
        assert!(factory.create("nonexistent").is_err());
    }
}
