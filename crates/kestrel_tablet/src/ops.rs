//! Decoded write operations and per-batch write state.
//!
//! The protocol layer hands the tablet an opaque serialized batch; step one
//! of the write pipeline decodes it into `RowOp`s (legacy backend) or
//! `DocOperation`s (KV backend). A structural decode failure is Corruption
//! and aborts the whole batch.

use serde::{Deserialize, Serialize};

use kestrel_common::error::{TabletError, TabletResult};
use kestrel_common::types::{HybridTime, IsolationLevel, OpId, SchemaVersion, TxnId};

use crate::lock::{LockBatch, LockKind, RowLockGuard};

/// One mutation as decoded from the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum WireOp {
    Insert { key: Vec<u8>, value: Vec<u8> },
    Update { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl WireOp {
    pub fn key(&self) -> &[u8] {
        match self {
            WireOp::Insert { key, .. } | WireOp::Update { key, .. } | WireOp::Delete { key } => key,
        }
    }

    /// Whether this op mutates an existing row (read-modify-write) rather
    /// than creating one. Mutations need a consistent read snapshot to
    /// verify the target exists.
    pub fn is_mutation(&self) -> bool {
        !matches!(self, WireOp::Insert { .. })
    }
}

/// A decoded batch of operations plus the client's schema view and an
/// optional transaction id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WireBatch {
    pub schema_version: SchemaVersion,
    pub txn_id: Option<TxnId>,
    pub ops: Vec<WireOp>,
}

impl WireBatch {
    pub fn new(ops: Vec<WireOp>) -> Self {
        Self {
            schema_version: 0,
            txn_id: None,
            ops,
        }
    }

    pub fn transactional(txn_id: TxnId, ops: Vec<WireOp>) -> Self {
        Self {
            schema_version: 0,
            txn_id: Some(txn_id),
            ops,
        }
    }

    pub fn encode(&self) -> TabletResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| TabletError::Serialization(e.to_string()))
    }

    /// Decode the serialized batch. Failure here is structural Corruption.
    pub fn decode(raw: &[u8]) -> TabletResult<Self> {
        bincode::deserialize(raw)
            .map_err(|e| TabletError::Corruption(format!("undecodable write batch: {e}")))
    }

    /// Isolation resolved from the presence of a transaction id.
    pub fn isolation(&self) -> IsolationLevel {
        if self.txn_id.is_some() {
            IsolationLevel::Snapshot
        } else {
            IsolationLevel::NonTransactional
        }
    }
}

/// Per-operation outcome, recorded on the op without aborting siblings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpResult {
    Pending,
    Applied,
    /// Mutate target absent. A normal negative result.
    NotFound,
    /// Duplicate key on insert. A normal negative result.
    AlreadyPresent,
}

impl OpResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, OpResult::Applied)
    }
}

/// One decoded row mutation with its target key and result slot. Created
/// per request, destroyed when the batch completes.
#[derive(Debug, Clone)]
pub struct RowOp {
    pub op: WireOp,
    pub result: OpResult,
}

impl RowOp {
    pub fn new(op: WireOp) -> Self {
        Self {
            op,
            result: OpResult::Pending,
        }
    }
}

/// One KV-backend mutation with its encoded doc key and lock intent.
#[derive(Debug, Clone)]
pub struct DocOperation {
    /// Row key escaped into an order-preserving byte encoding (without the
    /// hybrid-time suffix; that is appended at apply time).
    pub encoded_key: Vec<u8>,
    pub op: WireOp,
    pub lock_kind: LockKind,
    pub result: OpResult,
}

impl DocOperation {
    pub fn from_wire(op: WireOp) -> Self {
        Self {
            encoded_key: encode_key_prefix(op.key()),
            // All three op kinds write the key, so the intent is exclusive.
            // Read-only intents (shared) come from the read path.
            lock_kind: LockKind::Exclusive,
            op,
            result: OpResult::Pending,
        }
    }
}

// ── Doc key encoding ────────────────────────────────────────────────────
//
// Order-preserving escaped key bytes followed, at apply time, by the
// bitwise-inverted hybrid time so newer versions of the same row sort
// first within the row's key range.

/// Escape `0x00` as `0x00 0xFF` and terminate with `0x00 0x00` so that no
/// encoded key is a prefix of another and byte order matches key order.
pub fn encode_key_prefix(key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + 2);
    for &b in key {
        out.push(b);
        if b == 0x00 {
            out.push(0xFF);
        }
    }
    out.push(0x00);
    out.push(0x00);
    out
}

/// Full doc key: escaped row key + inverted hybrid time (big-endian).
pub fn encode_doc_key(key: &[u8], ht: HybridTime) -> Vec<u8> {
    let mut out = encode_key_prefix(key);
    out.extend_from_slice(&(!ht.0).to_be_bytes());
    out
}

/// Full doc key from an already-escaped prefix.
pub fn doc_key_from_prefix(prefix: &[u8], ht: HybridTime) -> Vec<u8> {
    let mut out = Vec::with_capacity(prefix.len() + 8);
    out.extend_from_slice(prefix);
    out.extend_from_slice(&(!ht.0).to_be_bytes());
    out
}

/// Undo `encode_key_prefix`: strip the terminator and unescape `0x00`.
pub fn decode_key_prefix(prefix: &[u8]) -> TabletResult<Vec<u8>> {
    if prefix.len() < 2 || prefix[prefix.len() - 2..] != [0x00, 0x00] {
        return Err(TabletError::corruption("doc key prefix missing terminator"));
    }
    let body = &prefix[..prefix.len() - 2];
    let mut out = Vec::with_capacity(body.len());
    let mut i = 0;
    while i < body.len() {
        let b = body[i];
        out.push(b);
        if b == 0x00 {
            if body.get(i + 1) != Some(&0xFF) {
                return Err(TabletError::corruption("bad zero escape in doc key"));
            }
            i += 2;
        } else {
            i += 1;
        }
    }
    Ok(out)
}

/// Split a doc key back into (escaped key prefix, hybrid time).
pub fn decode_doc_key(doc_key: &[u8]) -> TabletResult<(Vec<u8>, HybridTime)> {
    if doc_key.len() < 8 {
        return Err(TabletError::corruption("doc key shorter than time suffix"));
    }
    let split = doc_key.len() - 8;
    let mut ht_bytes = [0u8; 8];
    ht_bytes.copy_from_slice(&doc_key[split..]);
    Ok((doc_key[..split].to_vec(), HybridTime(!u64::from_be_bytes(ht_bytes))))
}

/// Locks held by one write batch; variant depends on the backend.
pub enum HeldLocks {
    None,
    /// Legacy backend: one exclusive guard per row key.
    Rows(Vec<RowLockGuard>),
    /// KV backend: one batched lock set.
    Batch(LockBatch),
}

impl HeldLocks {
    pub fn release(&mut self) {
        match std::mem::replace(self, HeldLocks::None) {
            HeldLocks::None => {}
            HeldLocks::Rows(guards) => drop(guards),
            HeldLocks::Batch(batch) => batch.unlock(),
        }
    }
}

/// Per-request aggregate: target ops, assigned OpId and hybrid time, the
/// schema snapshot taken at decode time, held locks and per-op results.
pub struct WriteOperationState {
    pub schema_version: SchemaVersion,
    pub txn_id: Option<TxnId>,
    pub isolation: IsolationLevel,
    pub op_id: Option<OpId>,
    pub hybrid_time: Option<HybridTime>,
    pub row_ops: Vec<RowOp>,
    pub doc_ops: Vec<DocOperation>,
    pub locks: HeldLocks,
}

impl WriteOperationState {
    pub fn from_batch(batch: &WireBatch) -> Self {
        Self {
            schema_version: batch.schema_version,
            txn_id: batch.txn_id,
            isolation: batch.isolation(),
            op_id: None,
            hybrid_time: None,
            row_ops: Vec::new(),
            doc_ops: Vec::new(),
            locks: HeldLocks::None,
        }
    }

    /// Results in op order, for the batch response.
    pub fn results(&self) -> Vec<OpResult> {
        if !self.row_ops.is_empty() {
            self.row_ops.iter().map(|o| o.result.clone()).collect()
        } else {
            self.doc_ops.iter().map(|o| o.result.clone()).collect()
        }
    }

    /// Release all locks, e.g. after an irreconcilable transaction
    /// conflict fails the batch atomically.
    pub fn release_locks(&mut self) {
        self.locks.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_batch_round_trip() {
        let batch = WireBatch::new(vec![
            WireOp::Insert {
                key: b"a".to_vec(),
                value: b"1".to_vec(),
            },
            WireOp::Delete { key: b"b".to_vec() },
        ]);
        let decoded = WireBatch::decode(&batch.encode().unwrap()).unwrap();
        assert_eq!(decoded, batch);
        assert_eq!(decoded.isolation(), IsolationLevel::NonTransactional);
    }

    #[test]
    fn test_wire_batch_decode_garbage_is_corruption() {
        let err = WireBatch::decode(&[0xde, 0xad]).unwrap_err();
        assert!(matches!(err, TabletError::Corruption(_)));
    }

    #[test]
    fn test_key_prefix_ordering() {
        // Encoded order must match raw key order, including embedded zeros.
        let keys: Vec<&[u8]> = vec![b"", b"\x00", b"\x00a", b"a", b"a\x00", b"ab", b"b"];
        let encoded: Vec<Vec<u8>> = keys.iter().map(|k| encode_key_prefix(k)).collect();
        let mut sorted = encoded.clone();
        sorted.sort();
        assert_eq!(encoded, sorted);
    }

    #[test]
    fn test_doc_key_newer_sorts_first() {
        let older = encode_doc_key(b"row", HybridTime::new(100, 0));
        let newer = encode_doc_key(b"row", HybridTime::new(200, 0));
        assert!(newer < older);
        // Still grouped under the same row prefix.
        let prefix = encode_key_prefix(b"row");
        assert!(newer.starts_with(&prefix) && older.starts_with(&prefix));
    }

    #[test]
    fn test_doc_key_round_trip() {
        let ht = HybridTime::new(12345, 7);
        let dk = encode_doc_key(b"some-key", ht);
        let (prefix, decoded_ht) = decode_doc_key(&dk).unwrap();
        assert_eq!(prefix, encode_key_prefix(b"some-key"));
        assert_eq!(decoded_ht, ht);
    }

    #[test]
    fn test_mutation_classification() {
        assert!(!WireOp::Insert {
            key: vec![],
            value: vec![]
        }
        .is_mutation());
        assert!(WireOp::Delete { key: vec![] }.is_mutation());
    }
}
