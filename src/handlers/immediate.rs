//! Each input is its own sync set; ready whenever any input can fire.

use std::sync::Arc;

use super::{InputStreamHandler, Invocation};
use crate::stream::input::InputStreamManager;
use crate::timestamp::Timestamp;

/// Fires one invocation per input as soon as that input has a packet, rather
/// than waiting for the rest of the node's inputs to catch up.
#[derive(Default)]
pub struct ImmediateInputStreamHandler;

impl ImmediateInputStreamHandler {
    /// Creates a new handler.
    pub fn new() -> Self {
        Self
    }
}

impl InputStreamHandler for ImmediateInputStreamHandler {
    fn schedule_invocations(&self, inputs: &[Arc<InputStreamManager>], max_allowance: usize, emit: &mut dyn FnMut(Invocation)) -> Option<Timestamp> {
        let mut emitted = 0usize;
        let mut earliest_bound = None;
        for (index, input) in inputs.iter().enumerate() {
            while emitted < max_allowance {
                let Some(packet) = input.queue_head() else { break };
                let ts = packet.timestamp();
                let (popped, _) = input.pop_packet_at_timestamp(ts).unwrap();
                let mut slots = vec![None; inputs.len()];
                slots[index] = popped;
                emit(Invocation { timestamp: ts, inputs: slots });
                emitted += 1;
            }
            if emitted >= max_allowance {
                break;
            }
            let bound = input.min_timestamp_or_bound();
            earliest_bound = Some(earliest_bound.map_or(bound, |b: Timestamp| b.min(bound)));
        }
        if emitted > 0 {
            None
        } else {
            earliest_bound
        }
    }
}
