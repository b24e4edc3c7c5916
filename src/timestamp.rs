//! The time coordinate carried by every packet.
//!
//! A [`Timestamp`] is a signed integer coordinate together with a handful of
//! distinguished sentinel values used by the stream and scheduling machinery.
//! The type has a total order; `Done` compares greater than every finite
//! value.

use std::cmp::Ordering;
use std::fmt;

use crate::error::Error;

/// A point in the logical time of a single stream.
///
/// Ordering across variants follows the order they are declared below:
/// `Unset < Unstarted < PreStream < Min <= Finite(_) <= Max < PostStream <
/// OneOverPostStream < Done`.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum Timestamp {
    /// No timestamp has ever been assigned. Not a legal packet timestamp.
    Unset,
    /// A node has not yet been opened. Not a legal packet timestamp.
    Unstarted,
    /// Precedes the first real timestamp of a stream.
    PreStream,
    /// The smallest finite timestamp.
    Min,
    /// An ordinary, finite timestamp.
    Finite(i64),
    /// The largest finite timestamp.
    Max,
    /// Follows the last real timestamp of a stream.
    PostStream,
    /// Strictly after `PostStream`; used internally by bound arithmetic.
    OneOverPostStream,
    /// The stream has terminated; no further packets will arrive.
    Done,
}

impl Timestamp {
    /// The smallest finite timestamp value, as a plain integer.
    pub const MIN_VALUE: i64 = i64::MIN + 2;
    /// The largest finite timestamp value, as a plain integer.
    pub const MAX_VALUE: i64 = i64::MAX - 2;

    /// Constructs a finite timestamp, clamping into `[Min, Max]`.
    pub fn new(value: i64) -> Self {
        if value <= Self::MIN_VALUE {
            Timestamp::Min
        } else if value >= Self::MAX_VALUE {
            Timestamp::Max
        } else {
            Timestamp::Finite(value)
        }
    }

    fn rank(&self) -> i128 {
        match self {
            Timestamp::Unset => -4,
            Timestamp::Unstarted => -3,
            Timestamp::PreStream => -2,
            Timestamp::Min => Self::MIN_VALUE as i128,
            Timestamp::Finite(v) => *v as i128,
            Timestamp::Max => Self::MAX_VALUE as i128,
            Timestamp::PostStream => Self::MAX_VALUE as i128 + 1,
            Timestamp::OneOverPostStream => Self::MAX_VALUE as i128 + 2,
            Timestamp::Done => Self::MAX_VALUE as i128 + 3,
        }
    }

    /// Whether a packet is allowed to carry this timestamp.
    ///
    /// `Unset` and `Unstarted` are framework-internal and never appear on a
    /// packet that has actually been published.
    pub fn is_allowed_in_stream(&self) -> bool {
        !matches!(self, Timestamp::Unset | Timestamp::Unstarted | Timestamp::OneOverPostStream)
    }

    /// Whether this is one of the two "singular" timestamps that must be the
    /// only packet ever admitted to their stream.
    pub fn is_singular(&self) -> bool {
        matches!(self, Timestamp::PreStream | Timestamp::PostStream)
    }

    /// The smallest timestamp strictly greater than `self` that is itself
    /// admissible as a packet timestamp.
    ///
    /// Special values collapse as documented in the data model: the next
    /// timestamp after `PreStream` is `Min`, after `PostStream` is
    /// `OneOverPostStream`, and `Done` is a fixed point.
    pub fn next_allowed_in_stream(&self) -> Timestamp {
        match self {
            Timestamp::Unset => Timestamp::Unset,
            Timestamp::Unstarted => Timestamp::Unstarted,
            Timestamp::PreStream => Timestamp::Min,
            Timestamp::Min => Timestamp::Finite(Self::MIN_VALUE + 1),
            Timestamp::Finite(v) if *v + 1 >= Self::MAX_VALUE => Timestamp::Max,
            Timestamp::Finite(v) => Timestamp::Finite(v + 1),
            Timestamp::Max => Timestamp::PostStream,
            Timestamp::PostStream => Timestamp::OneOverPostStream,
            Timestamp::OneOverPostStream => Timestamp::Done,
            Timestamp::Done => Timestamp::Done,
        }
    }

    /// Adds an offset to this timestamp, clamping at `Min`/`Max` and
    /// propagating `Done`. Errors if applied to `Unset`.
    pub fn checked_add(&self, offset: i64) -> Result<Timestamp, Error> {
        match self {
            Timestamp::Unset => Err(Error::internal("cannot offset an Unset timestamp")),
            Timestamp::Done => Ok(Timestamp::Done),
            Timestamp::Finite(v) => Ok(Timestamp::new(v.saturating_add(offset))),
            Timestamp::Min => Ok(Timestamp::new(Self::MIN_VALUE.saturating_add(offset))),
            Timestamp::Max => Ok(Timestamp::new(Self::MAX_VALUE.saturating_add(offset))),
            other => Ok(*other),
        }
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timestamp::Unset => write!(f, "Unset"),
            Timestamp::Unstarted => write!(f, "Unstarted"),
            Timestamp::PreStream => write!(f, "PreStream"),
            Timestamp::Min => write!(f, "Min"),
            Timestamp::Finite(v) => write!(f, "{v}"),
            Timestamp::Max => write!(f, "Max"),
            Timestamp::PostStream => write!(f, "PostStream"),
            Timestamp::OneOverPostStream => write!(f, "OneOverPostStream"),
            Timestamp::Done => write!(f, "Done"),
        }
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Timestamp::Unset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_order_holds_across_special_values() {
        let ordered = [
            Timestamp::Unset,
            Timestamp::Unstarted,
            Timestamp::PreStream,
            Timestamp::Min,
            Timestamp::Finite(0),
            Timestamp::Finite(1),
            Timestamp::Max,
            Timestamp::PostStream,
            Timestamp::OneOverPostStream,
            Timestamp::Done,
        ];
        for w in ordered.windows(2) {
            assert!(w[0] < w[1], "{:?} should be < {:?}", w[0], w[1]);
        }
    }

    #[test]
    fn next_allowed_collapses_special_values() {
        assert_eq!(Timestamp::PreStream.next_allowed_in_stream(), Timestamp::Min);
        assert_eq!(Timestamp::PostStream.next_allowed_in_stream(), Timestamp::OneOverPostStream);
        assert_eq!(Timestamp::Done.next_allowed_in_stream(), Timestamp::Done);
        assert_eq!(Timestamp::Finite(5).next_allowed_in_stream(), Timestamp::Finite(6));
    }

    #[test]
    fn done_is_strictly_greater_than_any_finite_timestamp() {
        assert!(Timestamp::Done > Timestamp::Finite(i64::MAX / 2));
        assert!(Timestamp::Done > Timestamp::Max);
    }

    #[test]
    fn add_to_done_yields_done() {
        assert_eq!(Timestamp::Done.checked_add(10).unwrap(), Timestamp::Done);
    }

    #[test]
    fn add_to_unset_errors() {
        assert!(Timestamp::Unset.checked_add(1).is_err());
    }
}
