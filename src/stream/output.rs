//! The producer side of a stream edge: header, bound, and mirror fan-out.
//!
//! The fan-out shape mirrors `timely`'s `Tee` pusher
//! (`dataflow/channels/pushers/tee.rs`): a shared list of consumer handles
//! behind one lock, each one visited in registration order so that a single
//! consumer always observes packets in producer order regardless of how many
//! other mirrors exist.

use std::sync::{Arc, Mutex};

use crate::error::Error;
use crate::packet::Packet;
use crate::stream::input::InputStreamManager;
use crate::timestamp::Timestamp;

/// A buffered batch of packets produced by one invocation, committed to the
/// output stream manager in a single step by the output stream handler
/// (§4.3, "output stream handler").
#[derive(Default)]
pub struct OutputShard {
    packets: Vec<Packet>,
    bound: Option<Timestamp>,
}

impl OutputShard {
    /// An empty shard.
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers a packet for later propagation.
    pub fn add_packet(&mut self, packet: Packet) {
        self.packets.push(packet);
    }

    /// Records the bound to advance to once this shard is committed.
    pub fn set_next_timestamp_bound(&mut self, bound: Timestamp) {
        self.bound = Some(match self.bound {
            Some(existing) if existing > bound => existing,
            _ => bound,
        });
    }

    /// Whether the calculator itself already set a bound on this shard.
    pub fn has_bound(&self) -> bool {
        self.bound.is_some()
    }
}

struct Inner {
    header: Option<Packet>,
    header_locked: bool,
    bound: Timestamp,
    offset: Option<i64>,
    closed: bool,
    mirrors: Vec<Arc<InputStreamManager>>,
}

/// The producer side of one output edge, identified externally by
/// `(producer_node_id, output_index)`.
pub struct OutputStreamManager {
    inner: Mutex<Inner>,
}

impl OutputStreamManager {
    /// Creates a fresh, unheadered, open output stream with no mirrors yet.
    pub fn new() -> Self {
        OutputStreamManager {
            inner: Mutex::new(Inner { header: None, header_locked: false, bound: Timestamp::Min, offset: None, closed: false, mirrors: Vec::new() }),
        }
    }

    /// Registers an additional mirror; call only during graph construction,
    /// before any run starts.
    pub fn add_mirror(&self, mirror: Arc<InputStreamManager>) {
        self.inner.lock().unwrap().mirrors.push(mirror);
    }

    /// Declares the `TimestampOffset` this stream's bound is derived from
    /// relative to the node's invocation timestamp.
    pub fn set_offset(&self, offset: i64) {
        self.inner.lock().unwrap().offset = Some(offset);
    }

    /// Sets the header packet. Only legal before any data packet has been
    /// propagated and before the stream is closed; locks further changes.
    pub fn set_header(&self, header: Packet) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(Error::internal("cannot set header on a closed stream"));
        }
        if inner.header_locked {
            return Err(Error::internal("header already set or data already flowed"));
        }
        inner.header = Some(header);
        self.propagate_header(&inner)?;
        inner.header_locked = true;
        Ok(())
    }

    fn propagate_header(&self, inner: &Inner) -> Result<(), Error> {
        if let Some(header) = &inner.header {
            for mirror in &inner.mirrors {
                mirror.add_packets(vec![header.clone()])?;
            }
        }
        Ok(())
    }

    /// Advances the bound directly (outside of a shard commit), used at
    /// `OpenNode` and `CloseNode` boundaries.
    pub fn set_next_timestamp_bound(&self, bound: Timestamp) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Ok(());
        }
        if bound < inner.bound {
            return Err(Error::internal("output stream bound may not decrease"));
        }
        inner.bound = bound;
        self.propagate_bound(&inner, bound)?;
        Ok(())
    }

    /// Infers the output bound from the invocation timestamp via this
    /// stream's declared offset, if one was set.
    pub fn infer_bound_from_invocation(&self, invocation_ts: Timestamp) -> Result<Option<Timestamp>, Error> {
        let offset = self.inner.lock().unwrap().offset;
        match offset {
            Some(offset) => Ok(Some(invocation_ts.checked_add(offset)?)),
            None => Ok(None),
        }
    }

    /// Commits a shard atomically: appends its packets to every mirror in the
    /// same order, then advances every mirror's bound, locking header
    /// changes on first data propagation.
    pub fn propagate_updates_to_mirrors(&self, shard: OutputShard) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Ok(());
        }
        if !shard.packets.is_empty() {
            for packet in &shard.packets {
                let ts = packet.timestamp();
                if ts < inner.bound {
                    return Err(Error::internal(format!("output packet at {ts} precedes current bound")));
                }
            }
            inner.header_locked = true;
            for mirror in &inner.mirrors {
                mirror.add_packets(shard.packets.clone())?;
            }
            if let Some(last) = shard.packets.last() {
                let next_bound = last.timestamp().next_allowed_in_stream();
                if next_bound > inner.bound {
                    inner.bound = next_bound;
                }
            }
        }
        if let Some(bound) = shard.bound {
            if bound > inner.bound {
                inner.bound = bound;
                self.propagate_bound(&inner, bound)?;
            }
        }
        Ok(())
    }

    fn propagate_bound(&self, inner: &Inner, bound: Timestamp) -> Result<(), Error> {
        for mirror in &inner.mirrors {
            mirror.set_next_timestamp_bound(bound)?;
        }
        Ok(())
    }

    /// Propagates `Done` to every mirror and marks the stream closed.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return;
        }
        inner.closed = true;
        inner.bound = Timestamp::Done;
        for mirror in &inner.mirrors {
            mirror.close();
        }
    }

    /// The current next-timestamp-bound.
    pub fn bound(&self) -> Timestamp {
        self.inner.lock().unwrap().bound
    }

    /// Whether the stream has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }
}

impl Default for OutputStreamManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fan_out_preserves_producer_order_per_mirror() {
        let out = OutputStreamManager::new();
        let m1 = Arc::new(InputStreamManager::new(false));
        let m2 = Arc::new(InputStreamManager::new(false));
        out.add_mirror(m1.clone());
        out.add_mirror(m2.clone());

        let mut shard = OutputShard::new();
        shard.add_packet(Packet::empty(Timestamp::Finite(0)));
        shard.add_packet(Packet::empty(Timestamp::Finite(1)));
        out.propagate_updates_to_mirrors(shard).unwrap();

        assert_eq!(m1.queue_size(), 2);
        assert_eq!(m2.queue_size(), 2);
        assert_eq!(m1.pop_queue_head().unwrap().timestamp(), Timestamp::Finite(0));
        assert_eq!(m2.pop_queue_head().unwrap().timestamp(), Timestamp::Finite(0));
    }

    #[test]
    fn header_locks_after_first_data_propagation() {
        let out = OutputStreamManager::new();
        let mut shard = OutputShard::new();
        shard.add_packet(Packet::empty(Timestamp::Finite(0)));
        out.propagate_updates_to_mirrors(shard).unwrap();
        assert!(out.set_header(Packet::empty(Timestamp::Unset)).is_err());
    }

    #[test]
    fn close_propagates_done_to_all_mirrors() {
        let out = OutputStreamManager::new();
        let m1 = Arc::new(InputStreamManager::new(false));
        out.add_mirror(m1.clone());
        out.close();
        assert!(m1.is_closed());
        assert!(out.is_closed());
    }

    #[test]
    fn publishing_earlier_than_bound_errors() {
        let out = OutputStreamManager::new();
        out.set_next_timestamp_bound(Timestamp::Finite(5)).unwrap();
        let mut shard = OutputShard::new();
        shard.add_packet(Packet::empty(Timestamp::Finite(0)));
        assert!(out.propagate_updates_to_mirrors(shard).is_err());
    }
}
