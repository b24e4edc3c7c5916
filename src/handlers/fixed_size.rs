//! Wraps another handler, capping per-input queue depth to bound latency.

use std::sync::Arc;

use super::{InputStreamHandler, Invocation};
use crate::stream::input::InputStreamManager;
use crate::timestamp::Timestamp;

/// Before delegating readiness to an inner handler, drops all but the
/// `target_queue_size` most recent packets on every input whose queue has
/// grown beyond that bound.
pub struct FixedSizeInputStreamHandler {
    inner: Arc<dyn InputStreamHandler>,
    target_queue_size: usize,
}

impl FixedSizeInputStreamHandler {
    /// Wraps `inner`, capping every input's queue at `target_queue_size`.
    pub fn new(inner: Arc<dyn InputStreamHandler>, target_queue_size: usize) -> Self {
        FixedSizeInputStreamHandler { inner, target_queue_size: target_queue_size.max(1) }
    }
}

impl InputStreamHandler for FixedSizeInputStreamHandler {
    fn schedule_invocations(&self, inputs: &[Arc<InputStreamManager>], max_allowance: usize, emit: &mut dyn FnMut(Invocation)) -> Option<Timestamp> {
        for input in inputs {
            let cutoff = input.min_timestamp_among_n_latest(self.target_queue_size);
            if cutoff != Timestamp::Unset {
                input.erase_packets_earlier_than(cutoff);
            }
        }
        self.inner.schedule_invocations(inputs, max_allowance, emit)
    }
}
