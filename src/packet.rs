//! The immutable, type-erased value carried by a stream.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::error::Error;
use crate::timestamp::Timestamp;

/// An immutable, shared, type-erased value carrying a timestamp.
///
/// Copies share the payload via an `Arc`; the payload is never mutated after
/// a packet has been published into a stream. A packet may be empty, in
/// which case it carries no payload but still occupies a timestamp slot.
#[derive(Clone)]
pub struct Packet {
    payload: Option<Arc<dyn Any + Send + Sync>>,
    timestamp: Timestamp,
}

impl Packet {
    /// Builds a packet carrying `value` at timestamp `ts`.
    pub fn new<T: Any + Send + Sync>(value: T, ts: Timestamp) -> Self {
        Packet { payload: Some(Arc::new(value)), timestamp: ts }
    }

    /// Builds an empty packet (no payload) at timestamp `ts`.
    pub fn empty(ts: Timestamp) -> Self {
        Packet { payload: None, timestamp: ts }
    }

    /// Returns a copy of this packet retimestamped to `ts`; the payload is
    /// shared, not cloned.
    pub fn at(&self, ts: Timestamp) -> Self {
        Packet { payload: self.payload.clone(), timestamp: ts }
    }

    /// The packet's timestamp.
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Whether this packet carries no payload.
    pub fn is_empty(&self) -> bool {
        self.payload.is_none()
    }

    /// Downcasts the payload to `T`.
    ///
    /// Returns `Error::Internal` if the packet is empty or the payload is a
    /// different concrete type, rather than panicking, so a calculator can
    /// surface the mismatch through its own `Result` instead of aborting the
    /// whole run.
    pub fn get<T: Any + Send + Sync>(&self) -> Result<&T, Error> {
        self.payload
            .as_ref()
            .ok_or_else(|| Error::internal("attempted to read an empty packet"))?
            .downcast_ref::<T>()
            .ok_or_else(|| Error::internal("packet payload type mismatch"))
    }

    /// Clones the payload out as an `Arc<T>`, for callers that need to retain
    /// a handle beyond the packet's own lifetime.
    pub fn get_arc<T: Any + Send + Sync>(&self) -> Result<Arc<T>, Error> {
        let arc = self.payload.clone().ok_or_else(|| Error::internal("attempted to read an empty packet"))?;
        arc.downcast::<T>().map_err(|_| Error::internal("packet payload type mismatch"))
    }

    /// The payload's allocation identity, if any.
    ///
    /// Since payloads are never mutated after publication, two packets with
    /// the same identity are guaranteed to carry equal values; used to
    /// cheaply detect an unchanged side packet across runs.
    pub fn payload_identity(&self) -> Option<*const ()> {
        self.payload.as_ref().map(|arc| Arc::as_ptr(arc) as *const ())
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("timestamp", &self.timestamp)
            .field("has_payload", &self.payload.is_some())
            .finish()
    }
}

/// Constructs a packet carrying `value` at timestamp `ts`.
///
/// Free-function spelling of [`Packet::new`], matching the source API shape
/// (`MakePacket<T>(value, ts)`).
pub fn make_packet<T: Any + Send + Sync>(value: T, ts: Timestamp) -> Packet {
    Packet::new(value, ts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retimestamping_shares_payload() {
        let p = Packet::new(42i32, Timestamp::Finite(0));
        let q = p.at(Timestamp::Finite(1));
        assert_eq!(*p.get::<i32>().unwrap(), 42);
        assert_eq!(*q.get::<i32>().unwrap(), 42);
        assert_eq!(q.timestamp(), Timestamp::Finite(1));
    }

    #[test]
    fn type_mismatch_is_recoverable_error() {
        let p = Packet::new(42i32, Timestamp::Finite(0));
        assert!(p.get::<String>().is_err());
    }

    #[test]
    fn empty_packet_has_no_payload() {
        let p = Packet::empty(Timestamp::Finite(3));
        assert!(p.is_empty());
        assert!(p.get::<i32>().is_err());
    }
}
