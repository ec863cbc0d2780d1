//! Tablet bootstrap: deterministic log replay.
//!
//! Loads the superblock, moves the live log aside as a recovery source,
//! replays it entry by entry through the tablet's replay hooks and writes
//! a rebuilt log containing only the entries still needed (everything
//! above the superblock's flush watermark). Replay is single-threaded;
//! sequencing violations in the recovered log abort the bootstrap rather
//! than guess at intent.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;

use kestrel_common::config::TabletConfig;
use kestrel_common::error::{TabletError, TabletResult};
use kestrel_common::types::{HybridTime, OpId, TableType, TxnId, TxnStatus};

use crate::clock::ClockRef;
use crate::metadata::TabletMetadata;
use crate::ops::WireBatch;
use crate::tablet::Tablet;
use crate::wal::{
    finish_recovery, prepare_recovery, LogEntry, LogReader, LogWriter, ReplicateEntry,
    ReplicateOp,
};

/// Outcome of a completed bootstrap.
pub struct BootstrapResult {
    pub tablet: Arc<Tablet>,
    /// Replicates that never got a commit record. They were not applied;
    /// the replication layer decides whether to resubmit or discard them.
    pub orphaned_replicates: Vec<ReplicateEntry>,
    pub entries_replayed: u64,
    pub entries_skipped: u64,
}

impl std::fmt::Debug for BootstrapResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootstrapResult")
            .field("orphaned_replicates", &self.orphaned_replicates)
            .field("entries_replayed", &self.entries_replayed)
            .field("entries_skipped", &self.entries_skipped)
            .finish_non_exhaustive()
    }
}

/// Load the tablet at `root` and bring it `Open`, replaying the log if
/// one exists.
pub fn bootstrap_tablet(
    root: &Path,
    config: TabletConfig,
    clock: ClockRef,
) -> TabletResult<BootstrapResult> {
    let tablet = Tablet::load(root, config.clone(), clock)?;
    tablet.mark_bootstrapping()?;

    let wal_dir = TabletMetadata::wal_dir(root);
    let recovery = prepare_recovery(&wal_dir)?;

    let mut state = ReplayState::new(&tablet);
    if let Some(recovery_dir) = &recovery {
        let reader = LogReader::new(recovery_dir);
        for segment_id in reader.segment_ids()? {
            for entry in reader.read_segment(segment_id)? {
                if let Err(e) = state.handle_entry(&tablet, entry) {
                    tracing::error!(
                        "tablet {} bootstrap failed: {e}; {}",
                        tablet.tablet_id(),
                        state.describe()
                    );
                    return Err(e);
                }
            }
        }
    }
    state.finish(&tablet)?;

    // Rebuild the log from the entries still needed, then open on it.
    let log = LogWriter::open(&wal_dir, config.wal)?;
    for entry in state.rebuilt_entries(&tablet) {
        log.append(&entry)?;
    }
    log.sync()?;
    tablet.mark_open(log)?;
    tablet.persist_metadata()?;
    finish_recovery(&wal_dir)?;

    tracing::info!(
        "tablet {} bootstrapped: {} entries replayed, {} skipped, {} orphaned",
        tablet.tablet_id(),
        state.entries_replayed,
        state.entries_skipped,
        state.orphans.len()
    );
    Ok(BootstrapResult {
        tablet: Arc::new(tablet),
        orphaned_replicates: state.orphans,
        entries_replayed: state.entries_replayed,
        entries_skipped: state.entries_skipped,
    })
}

/// Sequencing and dispatch state for one replay pass.
struct ReplayState {
    watermark: u64,
    prev_op_id: OpId,
    /// Committed replicates, in apply order.
    applied: Vec<ReplicateEntry>,
    /// Replicates waiting for their commit record (legacy backend only),
    /// with a flag set once the commit has been seen. Entries are only
    /// applied once they reach the front, so apply order follows index
    /// order even when commit records interleave.
    pending: VecDeque<(ReplicateEntry, bool)>,
    /// Replicates whose commit never arrived, set by `finish`.
    orphans: Vec<ReplicateEntry>,
    committed_index: u64,
    /// Last piggybacked committed index seen, for regression checks.
    prev_piggyback: u64,
    /// Replayed transactional write entries by index. Ones whose
    /// transaction is still pending at the end of replay carry live intent
    /// state and must survive into the rebuilt log even below the
    /// watermark.
    txn_writes: HashMap<u64, TxnId>,
    safe_time: HybridTime,
    entries_replayed: u64,
    entries_skipped: u64,
}

impl ReplayState {
    fn new(tablet: &Tablet) -> Self {
        let watermark = tablet.last_durable_op_index();
        Self {
            watermark,
            prev_op_id: OpId::min(),
            applied: Vec::new(),
            pending: VecDeque::new(),
            orphans: Vec::new(),
            committed_index: watermark,
            prev_piggyback: 0,
            txn_writes: HashMap::new(),
            safe_time: HybridTime::MIN,
            entries_replayed: 0,
            entries_skipped: 0,
        }
    }

    fn handle_entry(&mut self, tablet: &Tablet, entry: LogEntry) -> TabletResult<()> {
        match entry {
            LogEntry::Replicate(replicate) => self.handle_replicate(tablet, replicate),
            LogEntry::Commit { op_id } => self.handle_commit(tablet, op_id),
        }
    }

    fn handle_replicate(&mut self, tablet: &Tablet, entry: ReplicateEntry) -> TabletResult<()> {
        self.check_sequencing(entry.op_id)?;
        // The piggybacked committed index is bounded by the entry's own
        // index (an op cannot be committed before it is appended) and
        // never moves backwards within one log.
        if entry.committed_index >= entry.op_id.index {
            return Err(TabletError::Corruption(format!(
                "replicate {:?} carries committed index {} at or past itself",
                entry.op_id, entry.committed_index
            )));
        }
        if entry.committed_index < self.prev_piggyback {
            return Err(TabletError::Corruption(format!(
                "replicate {:?} regresses committed index {} below {}",
                entry.op_id, entry.committed_index, self.prev_piggyback
            )));
        }
        self.prev_piggyback = entry.committed_index;
        self.committed_index = self.committed_index.max(entry.committed_index);
        self.prev_op_id = entry.op_id;
        match tablet.table_type() {
            // Committed implicitly; there are no commit records.
            TableType::KeyValue => self.apply(tablet, entry),
            TableType::LegacyRowSet => {
                self.pending.push_back((entry, false));
                Ok(())
            }
        }
    }

    fn handle_commit(&mut self, tablet: &Tablet, op_id: OpId) -> TabletResult<()> {
        if tablet.table_type() == TableType::KeyValue {
            return Err(TabletError::Corruption(format!(
                "commit record for {op_id:?} in a key-value tablet log"
            )));
        }
        let slot = self
            .pending
            .iter_mut()
            .find(|(entry, _)| entry.op_id == op_id);
        match slot {
            Some((_, committed @ false)) => *committed = true,
            Some((_, true)) => {
                return Err(TabletError::Corruption(format!(
                    "duplicate commit record for {op_id:?}"
                )))
            }
            None => {
                return Err(TabletError::Corruption(format!(
                    "commit record for {op_id:?} with no pending replicate"
                )))
            }
        }
        // Commit records can interleave out of index order when writers
        // race; apply strictly in index order, so hybrid times stay
        // monotonic for the MVCC replay hooks.
        while matches!(self.pending.front(), Some((_, true))) {
            let (entry, _) = self.pending.pop_front().unwrap();
            self.apply(tablet, entry)?;
        }
        Ok(())
    }

    fn check_sequencing(&mut self, op_id: OpId) -> TabletResult<()> {
        let prev = self.prev_op_id;
        if prev == OpId::min() {
            // The log may reach back below the watermark (those entries
            // are skipped), but it must not start above it: that means
            // entries the stores never saw were lost.
            if op_id.index > self.watermark + 1 {
                return Err(TabletError::Sequencing {
                    op_id,
                    reason: format!(
                        "first log entry skips past durable watermark {}",
                        self.watermark
                    ),
                });
            }
            return Ok(());
        }
        if op_id.term < prev.term {
            return Err(TabletError::Sequencing {
                op_id,
                reason: format!("term moved backwards from {prev:?}"),
            });
        }
        if op_id.term == prev.term {
            if op_id.index != prev.index + 1 {
                return Err(TabletError::Sequencing {
                    op_id,
                    reason: format!("index gap after {prev:?}"),
                });
            }
            return Ok(());
        }
        // A higher term may rewind the index, overwriting the uncommitted
        // tail it replaces.
        if op_id.index > prev.index + 1 {
            return Err(TabletError::Sequencing {
                op_id,
                reason: format!("index gap across term bump after {prev:?}"),
            });
        }
        if let Some((entry, _)) = self
            .pending
            .iter()
            .find(|(e, committed)| *committed && e.op_id.index >= op_id.index)
        {
            return Err(TabletError::Corruption(format!(
                "term rewind to {op_id:?} would truncate committed replicate {:?}",
                entry.op_id
            )));
        }
        let before = self.pending.len();
        self.pending.retain(|(e, _)| e.op_id.index < op_id.index);
        let truncated = before - self.pending.len();
        if truncated > 0 {
            tracing::info!(
                "term {} rewind to index {} truncated {} uncommitted replicates",
                op_id.term,
                op_id.index,
                truncated
            );
        }
        Ok(())
    }

    fn apply(&mut self, tablet: &Tablet, entry: ReplicateEntry) -> TabletResult<()> {
        let index = entry.op_id.index;
        match &entry.op {
            ReplicateOp::Write { batch } => {
                let batch = WireBatch::decode(batch)?;
                if let Some(txn_id) = batch.txn_id {
                    self.txn_writes.insert(index, txn_id);
                }
                // Transactional writes are provisional: their intents and
                // buffered ops were never in the flushed stores, so they
                // replay regardless of the watermark. Their transaction's
                // apply entry decides whether the data itself is re-done.
                if batch.txn_id.is_none() && index <= self.watermark {
                    self.entries_skipped += 1;
                } else {
                    tablet.replay_write(entry.op_id, entry.hybrid_time, &batch)?;
                    self.entries_replayed += 1;
                }
            }
            ReplicateOp::AlterSchema { schema_version } => {
                tablet.replay_alter_schema(*schema_version)?;
                self.entries_replayed += 1;
            }
            ReplicateOp::ChangeConfig { .. } | ReplicateOp::NoOp => {}
            ReplicateOp::UpdateTransaction {
                txn_id,
                aborted,
                commit_ht,
                ops,
            } => {
                if !aborted && index <= self.watermark {
                    // The materialized data is durable, but the intents
                    // restored by the transaction's replayed write entries
                    // still have to be released.
                    tablet.replay_settle_transaction(*txn_id, *commit_ht)?;
                    self.entries_skipped += 1;
                } else {
                    tablet.replay_update_transaction(
                        *txn_id,
                        *aborted,
                        *commit_ht,
                        ops,
                        index,
                    )?;
                    self.entries_replayed += 1;
                }
            }
        }
        self.committed_index = self.committed_index.max(index);
        let effective = if entry.commit_wait {
            entry
                .hybrid_time
                .sub_micros(tablet.clock().max_error().as_micros() as u64)
        } else {
            entry.hybrid_time
        };
        self.safe_time = self.safe_time.max(effective);
        self.applied.push(entry);
        Ok(())
    }

    /// Drain the pending tail, then install the recovered log position and
    /// safe time on the tablet. A committed entry stuck behind an
    /// uncommitted one (its commit record landed first, then the writer of
    /// the earlier index crashed) is still applied; only entries with no
    /// commit at all become orphans.
    fn finish(&mut self, tablet: &Tablet) -> TabletResult<()> {
        for (entry, committed) in std::mem::take(&mut self.pending) {
            if committed {
                self.apply(tablet, entry)?;
            } else {
                self.orphans.push(entry);
            }
        }
        tablet.set_log_position(
            self.prev_op_id.term,
            self.prev_op_id.index + 1,
            self.committed_index,
        );
        if !self.safe_time.is_min() {
            tablet.mvcc().offline_adjust_safe_time(self.safe_time)?;
        }
        Ok(())
    }

    /// Canonical rebuilt log: entries above the watermark in index order,
    /// each committed one followed by its commit record on the legacy
    /// backend, orphans without one. Entries at or below the watermark are
    /// durable in the stores and are garbage-collected here, except
    /// transactional writes whose transaction is still pending: their
    /// intents live only in memory and the next replay needs the entry.
    fn rebuilt_entries(&self, tablet: &Tablet) -> Vec<LogEntry> {
        let table_type = tablet.table_type();
        let mut out = Vec::new();
        let mut orphans = self.orphans.iter().peekable();
        for entry in &self.applied {
            if entry.op_id.index <= self.watermark && !self.retains_pending_intents(tablet, entry)
            {
                continue;
            }
            while let Some(orphan) = orphans.peek() {
                if orphan.op_id.index >= entry.op_id.index {
                    break;
                }
                out.push(LogEntry::Replicate((*orphan).clone()));
                orphans.next();
            }
            out.push(LogEntry::Replicate(entry.clone()));
            if table_type == TableType::LegacyRowSet {
                out.push(LogEntry::Commit {
                    op_id: entry.op_id,
                });
            }
        }
        for orphan in orphans {
            out.push(LogEntry::Replicate(orphan.clone()));
        }
        out
    }

    fn retains_pending_intents(&self, tablet: &Tablet, entry: &ReplicateEntry) -> bool {
        self.txn_writes
            .get(&entry.op_id.index)
            .map_or(false, |txn_id| {
                tablet.participant().status(*txn_id) == Some(TxnStatus::Pending)
            })
    }

    fn describe(&self) -> String {
        format!(
            "replay state: prev op {:?}, {} applied, {} pending, {} skipped, committed index {}",
            self.prev_op_id,
            self.applied.len(),
            self.pending.len(),
            self.entries_skipped,
            self.committed_index
        )
    }
}
