use std::fmt;

use serde::{Deserialize, Serialize};

/// Number of low bits of a `HybridTime` reserved for the logical counter.
pub const HYBRID_TIME_LOGICAL_BITS: u32 = 12;

const LOGICAL_MASK: u64 = (1 << HYBRID_TIME_LOGICAL_BITS) - 1;

/// Composite physical+logical timestamp giving a total order for MVCC
/// visibility across loosely synchronized nodes.
///
/// Packed representation: physical microseconds since the Unix epoch in the
/// high 52 bits, a logical counter in the low 12 bits. The logical counter
/// disambiguates events sharing the same physical microsecond.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct HybridTime(pub u64);

impl HybridTime {
    /// Smallest valid hybrid time. Sorts before every real timestamp.
    pub const MIN: HybridTime = HybridTime(0);
    /// Largest representable hybrid time.
    pub const MAX: HybridTime = HybridTime(u64::MAX);

    pub fn new(physical_micros: u64, logical: u64) -> Self {
        HybridTime((physical_micros << HYBRID_TIME_LOGICAL_BITS) | (logical & LOGICAL_MASK))
    }

    /// Construct from physical microseconds with a zero logical component.
    pub fn from_micros(physical_micros: u64) -> Self {
        Self::new(physical_micros, 0)
    }

    pub fn physical_micros(&self) -> u64 {
        self.0 >> HYBRID_TIME_LOGICAL_BITS
    }

    pub fn logical(&self) -> u64 {
        self.0 & LOGICAL_MASK
    }

    /// The immediate successor in the total order.
    pub fn incremented(&self) -> Self {
        HybridTime(self.0.saturating_add(1))
    }

    /// The immediate predecessor, saturating at `MIN`.
    pub fn decremented(&self) -> Self {
        HybridTime(self.0.saturating_sub(1))
    }

    /// Subtract a physical duration, saturating at `MIN`. Used when
    /// backdating safe time by the clock's maximum error bound.
    pub fn sub_micros(&self, micros: u64) -> Self {
        let physical = self.physical_micros().saturating_sub(micros);
        HybridTime::new(physical, self.logical())
    }

    pub fn is_min(&self) -> bool {
        *self == Self::MIN
    }
}

impl fmt::Display for HybridTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ p: {} l: {} }}", self.physical_micros(), self.logical())
    }
}

/// Position in the replicated log: (term, index). Total order per term;
/// the index may rewind when a higher term truncates the log.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct OpId {
    pub term: u64,
    pub index: u64,
}

impl OpId {
    pub const fn new(term: u64, index: u64) -> Self {
        OpId { term, index }
    }

    /// The zero OpId, used before any entry has been observed.
    pub const fn min() -> Self {
        OpId { term: 0, index: 0 }
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.term, self.index)
    }
}

/// Tablet identifier (one shard of one table).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TabletId(pub String);

impl fmt::Display for TabletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Distributed transaction identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxnId(pub u64);

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn-{}", self.0)
    }
}

/// Storage strategy selected once at tablet creation.
///
/// The two backends share one write/replay pipeline; dispatch happens on
/// this tag at the pipeline boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableType {
    /// Row-set engine: MemRowSet + on-disk rowsets + delta stores.
    LegacyRowSet,
    /// Ordered byte-key LSM engine.
    KeyValue,
}

/// Isolation level resolved per write batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IsolationLevel {
    /// No transaction id on the batch.
    NonTransactional,
    Snapshot,
    Serializable,
}

/// Participant-side status of a distributed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnStatus {
    Pending,
    Committed,
    Aborted,
}

/// Schema version carried by write batches; the tablet only checks the
/// version, catalog management lives elsewhere.
pub type SchemaVersion = u32;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hybrid_time_packing() {
        let ht = HybridTime::new(1_000_000, 7);
        assert_eq!(ht.physical_micros(), 1_000_000);
        assert_eq!(ht.logical(), 7);
    }

    #[test]
    fn test_hybrid_time_ordering() {
        let a = HybridTime::new(100, 5);
        let b = HybridTime::new(100, 6);
        let c = HybridTime::new(101, 0);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a.incremented(), b);
    }

    #[test]
    fn test_hybrid_time_sub_micros() {
        let ht = HybridTime::new(500, 3);
        let backdated = ht.sub_micros(200);
        assert_eq!(backdated.physical_micros(), 300);
        assert_eq!(backdated.logical(), 3);
        assert_eq!(HybridTime::new(10, 0).sub_micros(50), HybridTime::new(0, 0));
    }

    #[test]
    fn test_op_id_ordering() {
        assert!(OpId::new(1, 5) < OpId::new(2, 3));
        assert!(OpId::new(1, 4) < OpId::new(1, 5));
        assert_eq!(OpId::min(), OpId::new(0, 0));
    }
}
