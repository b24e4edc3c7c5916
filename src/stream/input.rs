//! The per-edge input queue, grounded on `input_stream_manager.h`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::error::Error;
use crate::packet::Packet;
use crate::timestamp::Timestamp;

/// Invoked when a stream crosses its `max_queue_size` threshold, with no lock
/// held, per §4.2.2.
pub type QueueSizeCallback = Arc<dyn Fn(bool) + Send + Sync>;

struct State {
    queue: VecDeque<Packet>,
    num_packets_added: u64,
    bound: Timestamp,
    last_select_ts: Timestamp,
    closed: bool,
    enable_timestamps: bool,
    max_queue_size: Option<usize>,
    last_reported_full: bool,
}

/// The queue, bound, and close state for one input edge.
///
/// Identified externally by `(consumer_node_id, input_index)`; the manager
/// itself only knows its own contents. A single internal mutex guards all
/// state, matching the "per-stream mutex" rung of the lock hierarchy in §9 —
/// callbacks are always invoked after the guard has been dropped.
pub struct InputStreamManager {
    state: Mutex<State>,
    back_edge: bool,
    becomes_full: Mutex<Option<QueueSizeCallback>>,
    becomes_not_full: Mutex<Option<QueueSizeCallback>>,
    arrival: Mutex<Option<Arc<dyn Fn(Packet) + Send + Sync>>>,
}

impl InputStreamManager {
    /// Creates a fresh, open, empty input stream.
    pub fn new(back_edge: bool) -> Self {
        InputStreamManager {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                num_packets_added: 0,
                bound: Timestamp::Min,
                last_select_ts: Timestamp::Unset,
                closed: false,
                enable_timestamps: true,
                max_queue_size: None,
                last_reported_full: false,
            }),
            back_edge,
            becomes_full: Mutex::new(None),
            becomes_not_full: Mutex::new(None),
            arrival: Mutex::new(None),
        }
    }

    /// Excludes this edge from cycle-sensitive planning (a logical "back
    /// edge" flag, never a reference cycle).
    pub fn is_back_edge(&self) -> bool {
        self.back_edge
    }

    /// Turns off the strictly-increasing-timestamp requirement, for streams
    /// whose handler ignores timestamps entirely.
    pub fn disable_timestamps(&self) {
        self.state.lock().unwrap().enable_timestamps = false;
    }

    /// Installs the becomes-full / becomes-not-full callbacks.
    pub fn set_queue_size_callbacks(&self, full: QueueSizeCallback, not_full: QueueSizeCallback) {
        *self.becomes_full.lock().unwrap() = Some(full);
        *self.becomes_not_full.lock().unwrap() = Some(not_full);
    }

    /// The currently configured maximum queue size, if any.
    pub fn max_queue_size(&self) -> Option<usize> {
        self.state.lock().unwrap().max_queue_size
    }

    /// Sets the maximum queue size used for backpressure signalling.
    pub fn set_max_queue_size(&self, max: Option<usize>) {
        let fire = {
            let mut state = self.state.lock().unwrap();
            state.max_queue_size = max;
            self.edge_to_fire(&mut state)
        };
        self.fire(fire);
    }

    /// Appends packets, enforcing strictly increasing timestamps at or past
    /// the current bound. A no-op, not an error, if the stream is closed.
    pub fn add_packets(&self, packets: Vec<Packet>) -> Result<(), Error> {
        if packets.is_empty() {
            return Ok(());
        }
        let arrival_cb = self.arrival.lock().unwrap().clone();
        let announced = if arrival_cb.is_some() { packets.clone() } else { Vec::new() };
        let fire = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return Ok(());
            }
            for packet in packets {
                self.admit_locked(&mut state, packet)?;
            }
            self.edge_to_fire(&mut state)
        };
        self.fire(fire);
        if let Some(cb) = arrival_cb {
            for packet in announced {
                cb(packet);
            }
        }
        Ok(())
    }

    /// Installs a callback fired once per packet, after it has been queued
    /// and with no lock held — used by observer/poller streams that mirror a
    /// graph output (§6, `ObserveOutputStream`).
    pub fn set_arrival_callback(&self, cb: Arc<dyn Fn(Packet) + Send + Sync>) {
        *self.arrival.lock().unwrap() = Some(cb);
    }

    fn admit_locked(&self, state: &mut State, packet: Packet) -> Result<(), Error> {
        let ts = packet.timestamp();
        if !ts.is_allowed_in_stream() {
            return Err(Error::internal(format!("timestamp {ts} is not allowed in a stream")));
        }
        if state.enable_timestamps {
            if ts.is_singular() && state.num_packets_added > 0 {
                return Err(Error::internal("PreStream/PostStream packet must be the only packet in the stream"));
            }
            if let Some(front) = state.queue.back() {
                if front.timestamp().is_singular() {
                    return Err(Error::internal("a singular packet must be the only packet in the stream"));
                }
            }
            if ts < state.bound {
                return Err(Error::internal(format!("packet timestamp {ts} precedes stream bound")));
            }
        }
        state.num_packets_added += 1;
        state.queue.push_back(packet);
        if state.enable_timestamps {
            state.bound = ts.next_allowed_in_stream();
        }
        Ok(())
    }

    /// Sets the next-timestamp-bound. Errors if this would decrease the bound
    /// (unless timestamps are disabled). A no-op if the stream is closed.
    pub fn set_next_timestamp_bound(&self, bound: Timestamp) -> Result<(), Error> {
        let fire = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return Ok(());
            }
            if state.enable_timestamps && bound < state.bound {
                return Err(Error::internal("next timestamp bound may not decrease"));
            }
            state.bound = bound;
            self.edge_to_fire(&mut state)
        };
        self.fire(fire);
        Ok(())
    }

    /// The timestamp of the front packet if any, else the current bound.
    pub fn min_timestamp_or_bound(&self) -> Timestamp {
        let state = self.state.lock().unwrap();
        state.queue.front().map(|p| p.timestamp()).unwrap_or(state.bound)
    }

    /// Whether the queue is currently empty.
    pub fn is_empty(&self) -> bool {
        self.state.lock().unwrap().queue.is_empty()
    }

    /// The packet at the front of the queue, if any, without popping it.
    pub fn queue_head(&self) -> Option<Packet> {
        self.state.lock().unwrap().queue.front().cloned()
    }

    /// The number of packets currently queued.
    pub fn queue_size(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    /// Whether the stream has been closed.
    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    /// Pops the packet with timestamp exactly `ts` if present; packets with
    /// an earlier timestamp are dropped and counted. Returns the popped
    /// packet (if any) and the number of packets dropped in the process.
    /// `ts` must be `>=` the timestamp passed to the previous call.
    pub fn pop_packet_at_timestamp(&self, ts: Timestamp) -> Result<(Option<Packet>, u64), Error> {
        let fire = {
            let mut state = self.state.lock().unwrap();
            if state.enable_timestamps && state.last_select_ts != Timestamp::Unset && ts < state.last_select_ts {
                return Err(Error::internal("PopPacketAtTimestamp called with a decreasing timestamp"));
            }
            state.last_select_ts = ts;
            let mut dropped = 0u64;
            let mut found = None;
            while let Some(front) = state.queue.front() {
                match front.timestamp().cmp(&ts) {
                    std::cmp::Ordering::Less => {
                        state.queue.pop_front();
                        dropped += 1;
                    }
                    std::cmp::Ordering::Equal => {
                        found = state.queue.pop_front();
                        break;
                    }
                    std::cmp::Ordering::Greater => break,
                }
            }
            let fire = self.edge_to_fire(&mut state);
            (found, dropped, fire)
        };
        let (found, dropped, fire) = fire;
        self.fire(fire);
        Ok((found, dropped))
    }

    /// Pops and returns the packet at the head of the queue, if any.
    pub fn pop_queue_head(&self) -> Option<Packet> {
        let (popped, fire) = {
            let mut state = self.state.lock().unwrap();
            let popped = state.queue.pop_front();
            let fire = self.edge_to_fire(&mut state);
            (popped, fire)
        };
        self.fire(fire);
        popped
    }

    /// Closes the stream. Idempotent.
    pub fn close(&self) {
        let fire = {
            let mut state = self.state.lock().unwrap();
            state.closed = true;
            state.bound = Timestamp::Done;
            self.edge_to_fire(&mut state)
        };
        self.fire(fire);
    }

    /// Among the `n` most recently queued packets, the smallest timestamp; or
    /// `Timestamp::Unset` if fewer than `n` packets are queued.
    ///
    /// Intended for `FixedSizeInputStreamHandler` only.
    pub fn min_timestamp_among_n_latest(&self, n: usize) -> Timestamp {
        let state = self.state.lock().unwrap();
        if state.queue.len() < n || n == 0 {
            return Timestamp::Unset;
        }
        state.queue.iter().rev().take(n).map(|p| p.timestamp()).min().unwrap_or(Timestamp::Unset)
    }

    /// Drops packets with a timestamp earlier than `ts`.
    ///
    /// Intended for `FixedSizeInputStreamHandler` only.
    pub fn erase_packets_earlier_than(&self, ts: Timestamp) {
        let mut state = self.state.lock().unwrap();
        while let Some(front) = state.queue.front() {
            if front.timestamp() < ts {
                state.queue.pop_front();
            } else {
                break;
            }
        }
    }

    /// Evaluates whether a becomes-full/becomes-not-full edge fired, updating
    /// the guard flag, while still holding the lock. Returns the callback (if
    /// any) to invoke once the lock is released.
    fn edge_to_fire(&self, state: &mut State) -> Option<(bool, QueueSizeCallback)> {
        let Some(max) = state.max_queue_size else { return None };
        let is_full = state.queue.len() >= max;
        if is_full == state.last_reported_full {
            return None;
        }
        state.last_reported_full = is_full;
        let guard = if is_full { &self.becomes_full } else { &self.becomes_not_full };
        guard.lock().unwrap().clone().map(|cb| (is_full, cb))
    }

    fn fire(&self, fire: Option<(bool, QueueSizeCallback)>) {
        if let Some((is_full, cb)) = fire {
            cb(is_full);
        }
    }
}
