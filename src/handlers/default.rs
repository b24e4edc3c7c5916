//! The default input stream handler: a single sync set across all inputs.

use std::sync::{Arc, Mutex};

use super::{InputStreamHandler, Invocation};
use crate::stream::input::InputStreamManager;
use crate::timestamp::Timestamp;

/// Ready at `t` iff every input either has a packet queued at `t` or has
/// already advanced its bound past `t`.
///
/// With `process_timestamp_bounds` set, a bound-advance with no packets at
/// all (every input satisfied purely by an advanced bound) is also emitted,
/// once per distinct bound value, so a node can still observe timestamp
/// progress with entirely empty inputs.
pub struct DefaultInputStreamHandler {
    process_timestamp_bounds: bool,
    last_bound_emitted: Mutex<Timestamp>,
}

impl DefaultInputStreamHandler {
    /// Creates a handler; `process_timestamp_bounds` enables the bound-only
    /// invocation described above ("Default-with-offset" sets this).
    pub fn new(process_timestamp_bounds: bool) -> Self {
        DefaultInputStreamHandler { process_timestamp_bounds, last_bound_emitted: Mutex::new(Timestamp::Unset) }
    }
}

impl InputStreamHandler for DefaultInputStreamHandler {
    fn schedule_invocations(&self, inputs: &[Arc<InputStreamManager>], max_allowance: usize, emit: &mut dyn FnMut(Invocation)) -> Option<Timestamp> {
        let mut emitted = 0usize;
        loop {
            if emitted >= max_allowance {
                return None;
            }
            let candidate = inputs.iter().map(|i| i.min_timestamp_or_bound()).min().unwrap_or(Timestamp::Done);
            if candidate == Timestamp::Done {
                return None;
            }

            let mut has_any_packet = false;
            let mut ready = true;
            for input in inputs {
                match input.queue_head() {
                    Some(packet) if packet.timestamp() == candidate => has_any_packet = true,
                    Some(_) => {}
                    None => {
                        if input.min_timestamp_or_bound() <= candidate {
                            ready = false;
                        }
                    }
                }
            }

            if !ready {
                return Some(candidate);
            }

            if !has_any_packet {
                if !self.process_timestamp_bounds {
                    return Some(candidate);
                }
                let mut last = self.last_bound_emitted.lock().unwrap();
                if *last == candidate {
                    return Some(candidate);
                }
                *last = candidate;
            }

            let mut slots = Vec::with_capacity(inputs.len());
            for input in inputs {
                let head_ts = input.queue_head().map(|p| p.timestamp());
                if head_ts == Some(candidate) {
                    let (packet, _dropped) = input.pop_packet_at_timestamp(candidate).unwrap();
                    slots.push(packet);
                } else {
                    slots.push(None);
                }
            }
            emit(Invocation { timestamp: candidate, inputs: slots });
            emitted += 1;
        }
    }
}
