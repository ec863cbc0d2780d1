//! Participant-side distributed-transaction bookkeeping.
//!
//! The tablet participates in distributed transactions but never
//! coordinates them: it registers transaction metadata, records
//! provisional per-key intents, and answers the write pipeline's two
//! conflict-resolution questions. Status-tablet coordination lives
//! elsewhere; only the hooks the tablet calls are here.

use dashmap::DashMap;

use kestrel_common::error::{TabletError, TabletResult};
use kestrel_common::types::{HybridTime, IsolationLevel, TxnId, TxnStatus};

use crate::clock::ClockRef;
use crate::ops::WireOp;

/// Metadata for one transaction, owned by the participant and referenced
/// (never owned) by the write pipeline.
#[derive(Debug, Clone)]
pub struct TxnMetadata {
    pub txn_id: TxnId,
    pub isolation: IsolationLevel,
    pub status: TxnStatus,
}

/// A provisional write: visible to its own transaction before commit,
/// resolvable by others.
#[derive(Debug, Clone)]
struct Intent {
    txn_id: TxnId,
    ht: HybridTime,
}

pub struct TransactionParticipant {
    txns: DashMap<TxnId, TxnMetadata>,
    /// Outstanding intents keyed by encoded row key.
    intents: DashMap<Vec<u8>, Intent>,
    /// Buffered provisional ops per transaction, materialized into the
    /// stores only when the transaction is applied.
    provisional: DashMap<TxnId, Vec<WireOp>>,
}

impl TransactionParticipant {
    pub fn new() -> Self {
        Self {
            txns: DashMap::new(),
            intents: DashMap::new(),
            provisional: DashMap::new(),
        }
    }

    pub fn register(&self, txn_id: TxnId, isolation: IsolationLevel) {
        self.txns.entry(txn_id).or_insert(TxnMetadata {
            txn_id,
            isolation,
            status: TxnStatus::Pending,
        });
    }

    pub fn status(&self, txn_id: TxnId) -> Option<TxnStatus> {
        self.txns.get(&txn_id).map(|m| m.status)
    }

    /// A value written by `txn_id` is visible as committed to other
    /// readers only once the transaction has been applied.
    pub fn is_committed(&self, txn_id: TxnId) -> bool {
        matches!(self.status(txn_id), Some(TxnStatus::Committed))
    }

    /// Record a provisional intent for one key. Fails immediately if a
    /// different pending transaction already holds one.
    pub fn write_intent(&self, key: &[u8], txn_id: TxnId, ht: HybridTime) -> TabletResult<()> {
        match self.intents.entry(key.to_vec()) {
            dashmap::mapref::entry::Entry::Occupied(mut e) => {
                let existing = e.get().txn_id;
                if existing != txn_id && self.status(existing) == Some(TxnStatus::Pending) {
                    return Err(TabletError::TxnConflict {
                        txn_id,
                        reason: format!("key has outstanding intent from {existing}"),
                    });
                }
                e.insert(Intent { txn_id, ht });
                Ok(())
            }
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert(Intent { txn_id, ht });
                Ok(())
            }
        }
    }

    /// Hook for the pipeline: a non-transactional write against a
    /// transactional table checks outstanding intents on its keys. An
    /// intent from a still-pending transaction aborts the batch; a settled
    /// intent only forces the local clock past the intent's time so the
    /// non-transactional write cannot be reordered below it.
    pub fn resolve_operation_conflicts<'a>(
        &self,
        keys: impl Iterator<Item = &'a [u8]>,
        clock: &ClockRef,
    ) -> TabletResult<()> {
        for key in keys {
            if let Some(intent) = self.intents.get(key) {
                match self.status(intent.txn_id) {
                    Some(TxnStatus::Pending) => {
                        return Err(TabletError::Aborted(format!(
                            "conflict with pending {}",
                            intent.txn_id
                        )));
                    }
                    _ => {
                        clock.update(intent.ht.incremented());
                    }
                }
            }
        }
        Ok(())
    }

    /// Hook for the pipeline: after tentatively producing a transactional
    /// batch, resolve txn-to-txn conflicts. On an irreconcilable conflict
    /// the caller releases all locks and fails the batch atomically.
    pub fn resolve_transaction_conflicts<'a>(
        &self,
        txn_id: TxnId,
        keys: impl Iterator<Item = &'a [u8]>,
    ) -> TabletResult<()> {
        for key in keys {
            if let Some(intent) = self.intents.get(key) {
                if intent.txn_id != txn_id && self.status(intent.txn_id) == Some(TxnStatus::Pending)
                {
                    return Err(TabletError::TxnConflict {
                        txn_id,
                        reason: format!("write-write conflict with {}", intent.txn_id),
                    });
                }
            }
        }
        Ok(())
    }

    /// Apply (commit) a transaction: flips the status so its provisional
    /// writes become visible, then clears the intent bookkeeping.
    pub fn apply_transaction(&self, txn_id: TxnId, commit_ht: HybridTime) -> TabletResult<()> {
        let mut meta = self.txns.get_mut(&txn_id).ok_or_else(|| {
            TabletError::NotFound(format!("{txn_id} not registered on this participant"))
        })?;
        if meta.status == TxnStatus::Aborted {
            return Err(TabletError::illegal_state(format!(
                "{txn_id} already aborted, cannot apply at {commit_ht}"
            )));
        }
        meta.status = TxnStatus::Committed;
        drop(meta);
        self.clear_intents(txn_id);
        tracing::debug!("applied {} at {}", txn_id, commit_ht);
        Ok(())
    }

    pub fn abort_transaction(&self, txn_id: TxnId) -> TabletResult<()> {
        let mut meta = self.txns.get_mut(&txn_id).ok_or_else(|| {
            TabletError::NotFound(format!("{txn_id} not registered on this participant"))
        })?;
        if meta.status == TxnStatus::Committed {
            return Err(TabletError::illegal_state(format!(
                "{txn_id} already committed, cannot abort"
            )));
        }
        meta.status = TxnStatus::Aborted;
        drop(meta);
        self.clear_intents(txn_id);
        tracing::debug!("aborted {}", txn_id);
        Ok(())
    }

    /// Buffer one provisional op for a pending transaction.
    pub fn buffer_op(&self, txn_id: TxnId, op: WireOp) {
        self.provisional.entry(txn_id).or_default().push(op);
    }

    /// Drain the transaction's buffered ops for materialization at apply
    /// time (or for discarding on abort).
    pub fn take_provisional(&self, txn_id: TxnId) -> Vec<WireOp> {
        self.provisional
            .remove(&txn_id)
            .map(|(_, ops)| ops)
            .unwrap_or_default()
    }

    fn clear_intents(&self, txn_id: TxnId) {
        self.intents.retain(|_, intent| intent.txn_id != txn_id);
        self.provisional.remove(&txn_id);
    }

    pub fn intent_count(&self) -> usize {
        self.intents.len()
    }
}

impl Default for TransactionParticipant {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use std::sync::Arc;

    #[test]
    fn test_intent_conflict_between_pending_txns() {
        let p = TransactionParticipant::new();
        p.register(TxnId(1), IsolationLevel::Snapshot);
        p.register(TxnId(2), IsolationLevel::Snapshot);
        p.write_intent(b"k", TxnId(1), HybridTime::new(10, 0)).unwrap();
        let err = p.write_intent(b"k", TxnId(2), HybridTime::new(11, 0)).unwrap_err();
        assert!(matches!(err, TabletError::TxnConflict { .. }));
    }

    #[test]
    fn test_operation_conflict_aborts_on_pending_intent() {
        let p = TransactionParticipant::new();
        let clock: ClockRef = Arc::new(ManualClock::new(HybridTime::new(1, 0)));
        p.register(TxnId(1), IsolationLevel::Snapshot);
        p.write_intent(b"k", TxnId(1), HybridTime::new(10, 0)).unwrap();

        let keys: Vec<&[u8]> = vec![b"k"];
        let err = p
            .resolve_operation_conflicts(keys.into_iter(), &clock)
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_operation_conflict_advances_clock_past_settled_intent() {
        let p = TransactionParticipant::new();
        let clock: ClockRef = Arc::new(ManualClock::new(HybridTime::new(1, 0)));
        p.register(TxnId(1), IsolationLevel::Snapshot);
        p.write_intent(b"k", TxnId(1), HybridTime::new(10, 0)).unwrap();
        p.apply_transaction(TxnId(1), HybridTime::new(10, 0)).unwrap();
        // Intents cleared on apply; re-record one from the committed txn.
        p.write_intent(b"k", TxnId(1), HybridTime::new(10, 0)).unwrap();

        let keys: Vec<&[u8]> = vec![b"k"];
        p.resolve_operation_conflicts(keys.into_iter(), &clock).unwrap();
        assert!(clock.now() > HybridTime::new(10, 0));
    }

    #[test]
    fn test_apply_clears_intents_and_commits() {
        let p = TransactionParticipant::new();
        p.register(TxnId(7), IsolationLevel::Snapshot);
        p.write_intent(b"a", TxnId(7), HybridTime::new(5, 0)).unwrap();
        p.write_intent(b"b", TxnId(7), HybridTime::new(5, 1)).unwrap();
        assert_eq!(p.intent_count(), 2);
        assert!(!p.is_committed(TxnId(7)));

        p.apply_transaction(TxnId(7), HybridTime::new(6, 0)).unwrap();
        assert!(p.is_committed(TxnId(7)));
        assert_eq!(p.intent_count(), 0);
    }

    #[test]
    fn test_abort_after_commit_rejected() {
        let p = TransactionParticipant::new();
        p.register(TxnId(3), IsolationLevel::Snapshot);
        p.apply_transaction(TxnId(3), HybridTime::new(9, 0)).unwrap();
        assert!(p.abort_transaction(TxnId(3)).is_err());
    }

    #[test]
    fn test_txn_conflict_resolution_between_txns() {
        let p = TransactionParticipant::new();
        p.register(TxnId(1), IsolationLevel::Snapshot);
        p.register(TxnId(2), IsolationLevel::Snapshot);
        p.write_intent(b"k", TxnId(1), HybridTime::new(10, 0)).unwrap();

        let keys: Vec<&[u8]> = vec![b"k"];
        let err = p
            .resolve_transaction_conflicts(TxnId(2), keys.into_iter())
            .unwrap_err();
        assert!(matches!(err, TabletError::TxnConflict { txn_id: TxnId(2), .. }));

        // The same txn re-checking its own intent is fine.
        let keys: Vec<&[u8]> = vec![b"k"];
        p.resolve_transaction_conflicts(TxnId(1), keys.into_iter()).unwrap();
    }
}
