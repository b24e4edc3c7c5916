//! Ready only when every input has a packet at the same timestamp.

use std::sync::Arc;

use super::{InputStreamHandler, Invocation};
use crate::stream::input::InputStreamManager;
use crate::timestamp::Timestamp;

/// Strict join: an invocation only ever fires once every input has produced
/// a packet at the exact same timestamp. Unlike the default handler, an
/// input with an advanced bound but no packet does not unblock the barrier.
#[derive(Default)]
pub struct BarrierInputStreamHandler;

impl BarrierInputStreamHandler {
    /// Creates a new handler.
    pub fn new() -> Self {
        Self
    }
}

impl InputStreamHandler for BarrierInputStreamHandler {
    fn schedule_invocations(&self, inputs: &[Arc<InputStreamManager>], max_allowance: usize, emit: &mut dyn FnMut(Invocation)) -> Option<Timestamp> {
        let mut emitted = 0usize;
        loop {
            if emitted >= max_allowance {
                return None;
            }
            if inputs.iter().any(|i| i.queue_head().is_none()) {
                return Some(inputs.iter().map(|i| i.min_timestamp_or_bound()).max().unwrap_or(Timestamp::Done));
            }
            let ts = inputs[0].queue_head().unwrap().timestamp();
            if !inputs.iter().all(|i| i.queue_head().map(|p| p.timestamp()) == Some(ts)) {
                // Inputs disagree on timestamp: drop stragglers behind the
                // furthest-advanced input until they line up.
                let target = inputs.iter().filter_map(|i| i.queue_head().map(|p| p.timestamp())).max().unwrap();
                for input in inputs {
                    let _ = input.pop_packet_at_timestamp(target);
                }
                continue;
            }
            let mut slots = Vec::with_capacity(inputs.len());
            for input in inputs {
                let (packet, _) = input.pop_packet_at_timestamp(ts).unwrap();
                slots.push(packet);
            }
            emit(Invocation { timestamp: ts, inputs: slots });
            emitted += 1;
        }
    }
}
