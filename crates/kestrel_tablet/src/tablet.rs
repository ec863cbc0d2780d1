//! The tablet: one shard's storage and write pipeline.
//!
//! Owns the store stack for one of the two backends (legacy rowsets or the
//! ordered KV engine), the MVCC manager, the lock tables, the transaction
//! participant and the log. Writes flow decode → lock → resolve conflicts →
//! assign OpId/hybrid time → log → apply → (legacy) commit record.
//!
//! Lifecycle: `Initialized → Bootstrapping → Open → Shutdown`. Writes and
//! reads are only served while `Open`; replay entry points are only valid
//! while `Bootstrapping`.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use serde_json::json;

use kestrel_common::config::TabletConfig;
use kestrel_common::error::{TabletError, TabletResult};
use kestrel_common::shutdown::ShutdownSignal;
use kestrel_common::types::{
    HybridTime, OpId, SchemaVersion, TableType, TabletId, TxnId,
};

use crate::clock::ClockRef;
use crate::kv::{KvBatch, KvConfig, KvEngine};
use crate::lock::{LockKind, RowLockMap, SharedLockManager};
use crate::metadata::{RowSetMeta, TabletMetadata};
use crate::mvcc::{
    MvccManager, MvccSnapshot, ReaderRegistration, ReaderTimestampRegistry,
};
use crate::ops::{
    decode_doc_key, decode_key_prefix, doc_key_from_prefix, encode_key_prefix, HeldLocks,
    OpResult, RowOp, WireBatch, WireOp, WriteOperationState,
};
use crate::rowset::{
    DiskRowSet, MemRowSet, RollingDiskRowSetWriter, RowChange, RowSetHandle, RowSetTree,
};
use crate::txn_participant::TransactionParticipant;
use crate::wal::{LogEntry, LogWriter, ReplicateEntry, ReplicateOp};

// ── Lifecycle ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabletState {
    Initialized,
    Bootstrapping,
    Open,
    Shutdown,
}

impl std::fmt::Display for TabletState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TabletState::Initialized => "INITIALIZED",
            TabletState::Bootstrapping => "BOOTSTRAPPING",
            TabletState::Open => "OPEN",
            TabletState::Shutdown => "SHUTDOWN",
        };
        f.write_str(s)
    }
}

// ── Metrics ─────────────────────────────────────────────────────────────

/// Cheap atomic counters, dumped into `debug_dump`.
#[derive(Default)]
pub struct TabletMetrics {
    pub writes: AtomicU64,
    pub rows_applied: AtomicU64,
    pub insert_rejects: AtomicU64,
    pub mutate_misses: AtomicU64,
    pub mrs_flushes: AtomicU64,
    pub delta_flushes: AtomicU64,
    pub rowset_compactions: AtomicU64,
    pub txn_applies: AtomicU64,
    pub txn_aborts: AtomicU64,
    /// Bumped whenever the rowset layout changes (flush, compaction).
    /// Maintenance ops use it to invalidate cached stats.
    pub layout_changes: AtomicU64,
}

impl TabletMetrics {
    fn dump(&self) -> serde_json::Value {
        json!({
            "writes": self.writes.load(Ordering::Relaxed),
            "rows_applied": self.rows_applied.load(Ordering::Relaxed),
            "insert_rejects": self.insert_rejects.load(Ordering::Relaxed),
            "mutate_misses": self.mutate_misses.load(Ordering::Relaxed),
            "mrs_flushes": self.mrs_flushes.load(Ordering::Relaxed),
            "delta_flushes": self.delta_flushes.load(Ordering::Relaxed),
            "rowset_compactions": self.rowset_compactions.load(Ordering::Relaxed),
            "txn_applies": self.txn_applies.load(Ordering::Relaxed),
            "txn_aborts": self.txn_aborts.load(Ordering::Relaxed),
            "layout_changes": self.layout_changes.load(Ordering::Relaxed),
        })
    }
}

// ── Components ──────────────────────────────────────────────────────────

/// The legacy backend's swappable store set. Writers snapshot this Arc
/// before assigning their log index; flush swaps the whole set atomically.
pub struct TabletComponents {
    pub memrowset: Arc<MemRowSet>,
    pub rowsets: Arc<RowSetTree>,
}

// ── Tablet ──────────────────────────────────────────────────────────────

pub struct Tablet {
    tablet_id: TabletId,
    table_type: TableType,
    root: PathBuf,
    data_dir: PathBuf,
    config: TabletConfig,
    clock: ClockRef,

    state: RwLock<TabletState>,
    components: RwLock<Arc<TabletComponents>>,
    kv: Option<KvEngine>,

    mvcc: Arc<MvccManager>,
    row_locks: Arc<RowLockMap>,
    lock_manager: Arc<SharedLockManager>,
    txns: TransactionParticipant,
    readers: Arc<ReaderTimestampRegistry>,

    log: RwLock<Option<Arc<LogWriter>>>,
    metadata: Mutex<TabletMetadata>,

    schema_version: AtomicU32,
    term: AtomicU64,
    next_index: AtomicU64,
    last_committed_index: AtomicU64,
    next_mrs_id: AtomicU64,
    next_rowset_id: AtomicU64,

    /// Serializes OpId + hybrid-time assignment so log-index order always
    /// matches hybrid-time order; replay depends on that.
    assign_lock: Mutex<()>,
    pending_ops: Mutex<u64>,
    drained: Condvar,
    flush_lock: Mutex<()>,
    shutdown_signal: ShutdownSignal,
    metrics: TabletMetrics,
}

impl Tablet {
    /// Create a brand-new tablet on disk.
    pub fn create(
        root: &Path,
        tablet_id: TabletId,
        table_type: TableType,
        config: TabletConfig,
        clock: ClockRef,
    ) -> TabletResult<Self> {
        fs::create_dir_all(TabletMetadata::data_dir(root))?;
        fs::create_dir_all(TabletMetadata::wal_dir(root))?;
        let meta = TabletMetadata::new(tablet_id, table_type);
        meta.store(root)?;
        Self::from_metadata(root, meta, config, clock)
    }

    /// Load an existing tablet from its superblock and store files. The
    /// result is `Initialized`; bootstrap must replay the log and open it.
    pub fn load(root: &Path, config: TabletConfig, clock: ClockRef) -> TabletResult<Self> {
        let meta = TabletMetadata::load(root)?;
        Self::from_metadata(root, meta, config, clock)
    }

    fn from_metadata(
        root: &Path,
        meta: TabletMetadata,
        config: TabletConfig,
        clock: ClockRef,
    ) -> TabletResult<Self> {
        let data_dir = TabletMetadata::data_dir(root);
        let mut handles = Vec::with_capacity(meta.rowsets.len());
        let mut kv = None;
        match meta.table_type {
            TableType::LegacyRowSet => {
                for rs_meta in &meta.rowsets {
                    let rs = DiskRowSet::open(&data_dir, rs_meta.id, &rs_meta.delta_ids)?;
                    handles.push(RowSetHandle::Disk(rs));
                }
            }
            TableType::KeyValue => {
                kv = Some(KvEngine::open(
                    &data_dir,
                    KvConfig {
                        memtable_budget_bytes: config.flush.memstore_budget_bytes,
                        ..KvConfig::default()
                    },
                )?);
            }
        }
        let mrs_id = meta.last_durable_mrs_id + 1;
        let components = TabletComponents {
            memrowset: Arc::new(MemRowSet::new(mrs_id)),
            rowsets: RowSetTree::new(handles),
        };
        let clock_for_mvcc = Arc::clone(&clock);
        Ok(Self {
            tablet_id: meta.tablet_id.clone(),
            table_type: meta.table_type,
            root: root.to_path_buf(),
            data_dir,
            config,
            clock,
            state: RwLock::new(TabletState::Initialized),
            components: RwLock::new(Arc::new(components)),
            kv,
            mvcc: Arc::new(MvccManager::new(clock_for_mvcc)),
            row_locks: Arc::new(RowLockMap::new()),
            lock_manager: Arc::new(SharedLockManager::new()),
            txns: TransactionParticipant::new(),
            readers: Arc::new(ReaderTimestampRegistry::new()),
            log: RwLock::new(None),
            schema_version: AtomicU32::new(meta.schema_version),
            term: AtomicU64::new(1),
            next_index: AtomicU64::new(meta.last_durable_op_index + 1),
            last_committed_index: AtomicU64::new(meta.last_durable_op_index),
            next_mrs_id: AtomicU64::new(mrs_id + 1),
            next_rowset_id: AtomicU64::new(meta.next_rowset_id),
            metadata: Mutex::new(meta),
            assign_lock: Mutex::new(()),
            pending_ops: Mutex::new(0),
            drained: Condvar::new(),
            flush_lock: Mutex::new(()),
            shutdown_signal: ShutdownSignal::new(),
            metrics: TabletMetrics::default(),
        })
    }

    // ── Lifecycle transitions ───────────────────────────────────────────

    pub fn state(&self) -> TabletState {
        *self.state.read()
    }

    pub fn mark_bootstrapping(&self) -> TabletResult<()> {
        let mut state = self.state.write();
        if *state != TabletState::Initialized {
            return Err(TabletError::illegal_state(format!(
                "cannot start bootstrap from state {state}"
            )));
        }
        *state = TabletState::Bootstrapping;
        Ok(())
    }

    /// Finish bootstrap: install the fresh log writer and open for traffic.
    pub fn mark_open(&self, log: LogWriter) -> TabletResult<()> {
        let mut state = self.state.write();
        if *state != TabletState::Bootstrapping {
            return Err(TabletError::illegal_state(format!(
                "cannot open from state {state}"
            )));
        }
        *self.log.write() = Some(Arc::new(log));
        *state = TabletState::Open;
        tracing::info!("tablet {} open", self.tablet_id);
        Ok(())
    }

    /// Reject new work, drain in-flight operations with a bounded wait,
    /// sync the log and persist the superblock.
    pub fn shutdown(&self) -> TabletResult<()> {
        {
            let mut state = self.state.write();
            if *state == TabletState::Shutdown {
                return Ok(());
            }
            *state = TabletState::Shutdown;
        }
        self.shutdown_signal.shutdown();

        let deadline =
            Instant::now() + Duration::from_millis(self.config.shutdown.drain_timeout_ms);
        let mut pending = self.pending_ops.lock();
        while *pending > 0 {
            if self.drained.wait_until(&mut pending, deadline).timed_out() {
                tracing::warn!(
                    "shutdown drain timed out with {} operations still pending",
                    *pending
                );
                break;
            }
        }
        drop(pending);
        self.mvcc.wait_for_applying_to_commit_timeout(
            Duration::from_millis(self.config.shutdown.drain_timeout_ms),
        );

        if let Some(log) = self.log.read().clone() {
            log.sync()?;
        }
        self.persist_metadata()?;
        tracing::info!("tablet {} shut down", self.tablet_id);
        Ok(())
    }

    pub fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.shutdown_signal
    }

    fn check_open(&self) -> TabletResult<()> {
        let state = *self.state.read();
        if state != TabletState::Open {
            return Err(TabletError::illegal_state(format!(
                "tablet {} is {state}, not OPEN",
                self.tablet_id
            )));
        }
        Ok(())
    }

    fn check_bootstrapping(&self) -> TabletResult<()> {
        let state = *self.state.read();
        if state != TabletState::Bootstrapping {
            return Err(TabletError::illegal_state(format!(
                "replay attempted while tablet {} is {state}",
                self.tablet_id
            )));
        }
        Ok(())
    }

    fn begin_op(&self) -> TabletResult<PendingOpGuard<'_>> {
        self.check_open()?;
        *self.pending_ops.lock() += 1;
        Ok(PendingOpGuard { tablet: self })
    }

    // ── Write pipeline ──────────────────────────────────────────────────

    /// Apply one write batch: decode, lock, resolve conflicts, assign
    /// OpId/hybrid time, log, apply, commit. Per-row negative outcomes
    /// (`NotFound`, `AlreadyPresent`) are returned in the result vector;
    /// batch-level failures return `Err` and apply nothing.
    pub fn write(&self, batch: WireBatch) -> TabletResult<Vec<OpResult>> {
        let _op_guard = self.begin_op()?;
        if batch.ops.is_empty() {
            return Err(TabletError::InvalidArgument("empty write batch".into()));
        }
        let current_schema = self.schema_version.load(Ordering::SeqCst);
        if batch.schema_version != current_schema {
            return Err(TabletError::InvalidArgument(format!(
                "batch schema version {} does not match tablet schema version {}",
                batch.schema_version, current_schema
            )));
        }

        let mut op = WriteOperationState::from_batch(&batch);
        let results = match self.table_type {
            TableType::LegacyRowSet => self.write_legacy(&mut op, &batch),
            TableType::KeyValue => self.write_kv(&mut op, &batch),
        };
        op.release_locks();
        self.metrics.writes.fetch_add(1, Ordering::Relaxed);
        results
    }

    fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.config.flush.lock_wait_ms)
    }

    fn write_legacy(
        &self,
        op: &mut WriteOperationState,
        batch: &WireBatch,
    ) -> TabletResult<Vec<OpResult>> {
        op.row_ops = batch.ops.iter().cloned().map(RowOp::new).collect();

        // Lock each distinct key in sorted order so two batches can never
        // deadlock against each other.
        let keys: BTreeSet<Vec<u8>> = batch.ops.iter().map(|o| o.key().to_vec()).collect();
        let mut guards = Vec::with_capacity(keys.len());
        for key in &keys {
            guards.push(self.row_locks.lock(key.clone(), self.lock_wait())?);
        }
        op.locks = HeldLocks::Rows(guards);

        self.resolve_conflicts(batch, keys.iter().map(|k| k.as_slice()))?;

        let encoded = batch.encode()?;
        let (op_id, mvcc_op, components) =
            self.assign_and_replicate(move |_| ReplicateOp::Write { batch: encoded })?;
        let ht = mvcc_op.hybrid_time();
        op.op_id = Some(op_id);
        op.hybrid_time = Some(ht);

        if let Some(txn_id) = batch.txn_id {
            // Provisional: record intents and buffer the ops; the stores
            // are only touched when the transaction is applied.
            for row_op in &mut op.row_ops {
                self.txns.write_intent(row_op.op.key(), txn_id, ht)?;
                self.txns.buffer_op(txn_id, row_op.op.clone());
                row_op.result = OpResult::Applied;
            }
        } else {
            for row_op in &mut op.row_ops {
                row_op.result = self.apply_legacy_op(&components, &row_op.op, ht)?;
            }
        }

        self.log_append(&LogEntry::Commit { op_id })?;
        mvcc_op.commit();
        self.last_committed_index
            .fetch_max(op_id.index, Ordering::SeqCst);
        Ok(op.results())
    }

    fn write_kv(
        &self,
        op: &mut WriteOperationState,
        batch: &WireBatch,
    ) -> TabletResult<Vec<OpResult>> {
        op.doc_ops = batch
            .ops
            .iter()
            .cloned()
            .map(crate::ops::DocOperation::from_wire)
            .collect();

        let intents: Vec<(Vec<u8>, LockKind)> = op
            .doc_ops
            .iter()
            .map(|d| (d.encoded_key.clone(), d.lock_kind))
            .collect();
        op.locks = HeldLocks::Batch(self.lock_manager.lock_batch(intents, self.lock_wait())?);

        let keys: BTreeSet<Vec<u8>> =
            op.doc_ops.iter().map(|d| d.encoded_key.clone()).collect();
        self.resolve_conflicts(batch, keys.iter().map(|k| k.as_slice()))?;

        let encoded = batch.encode()?;
        let (op_id, mvcc_op, _components) =
            self.assign_and_replicate(move |_| ReplicateOp::Write { batch: encoded })?;
        let ht = mvcc_op.hybrid_time();
        op.op_id = Some(op_id);
        op.hybrid_time = Some(ht);

        let results = if let Some(txn_id) = batch.txn_id {
            for doc_op in &mut op.doc_ops {
                self.txns.write_intent(&doc_op.encoded_key, txn_id, ht)?;
                self.txns.buffer_op(txn_id, doc_op.op.clone());
                doc_op.result = OpResult::Applied;
            }
            op.doc_ops.iter().map(|d| d.result.clone()).collect()
        } else {
            self.apply_kv_ops(&mut op.doc_ops, ht, op_id.index)?
        };
        mvcc_op.commit();
        self.last_committed_index
            .fetch_max(op_id.index, Ordering::SeqCst);
        Ok(results)
    }

    fn resolve_conflicts<'a>(
        &self,
        batch: &WireBatch,
        keys: impl Iterator<Item = &'a [u8]> + Clone,
    ) -> TabletResult<()> {
        match batch.txn_id {
            Some(txn_id) => {
                self.txns.register(txn_id, batch.isolation());
                self.txns.resolve_transaction_conflicts(txn_id, keys)
            }
            None => self.txns.resolve_operation_conflicts(keys, &self.clock),
        }
    }

    fn assign_op_id(&self) -> OpId {
        OpId::new(
            self.term.load(Ordering::SeqCst),
            self.next_index.fetch_add(1, Ordering::SeqCst),
        )
    }

    /// Take the next OpId, start its MVCC operation, capture the store set
    /// and append the replicate entry as one step. The pairing guarantees
    /// a later index always carries a later hybrid time, that replicates
    /// land in the log in index order, and that every op at or below a
    /// flush's watermark captured the store set that flush swaps out
    /// (`flush_legacy` reads the watermark and swaps under the same lock).
    fn assign_and_replicate(
        &self,
        build_op: impl FnOnce(HybridTime) -> ReplicateOp,
    ) -> TabletResult<(OpId, crate::mvcc::OperationHandle, Arc<TabletComponents>)> {
        let _assign_guard = self.assign_lock.lock();
        let components = self.components.read().clone();
        let op_id = self.assign_op_id();
        let mvcc_op = self.mvcc.start_operation();
        let ht = mvcc_op.hybrid_time();
        let entry = LogEntry::Replicate(ReplicateEntry {
            op_id,
            committed_index: self.last_committed_index.load(Ordering::SeqCst),
            hybrid_time: ht,
            commit_wait: false,
            op: build_op(ht),
        });
        if let Err(e) = self.log_append(&entry) {
            mvcc_op.abort();
            return Err(e);
        }
        Ok((op_id, mvcc_op, components))
    }

    /// An append failure would break the durability contract behind an
    /// entry the pipeline is about to acknowledge, so it escalates to
    /// `Fatal`.
    fn log_append(&self, entry: &LogEntry) -> TabletResult<()> {
        let log = self.log.read().clone().ok_or_else(|| {
            TabletError::illegal_state(format!("tablet {} has no open log", self.tablet_id))
        })?;
        log.append(entry)
            .map_err(|e| TabletError::Fatal(format!("log append failed: {e}")))
    }

    /// Commit record for an applied replicate. Only the legacy backend
    /// logs these; the KV backend commits implicitly.
    fn log_commit(&self, op_id: OpId) -> TabletResult<()> {
        if self.table_type == TableType::LegacyRowSet {
            self.log_append(&LogEntry::Commit { op_id })?;
        }
        Ok(())
    }

    fn apply_legacy_op(
        &self,
        components: &TabletComponents,
        wire_op: &WireOp,
        ht: HybridTime,
    ) -> TabletResult<OpResult> {
        let key = wire_op.key();
        let result = match wire_op {
            WireOp::Insert { value, .. } => {
                if self.legacy_is_live(components, key) {
                    OpResult::AlreadyPresent
                } else {
                    match components.memrowset.insert(key, value.clone(), ht) {
                        Ok(()) => OpResult::Applied,
                        Err(e) if e.is_per_op() => OpResult::AlreadyPresent,
                        Err(e) => return Err(e),
                    }
                }
            }
            WireOp::Update { value, .. } => {
                self.legacy_mutate(components, key, RowChange::Update(value.clone()), ht)?
            }
            WireOp::Delete { .. } => {
                self.legacy_mutate(components, key, RowChange::Delete, ht)?
            }
        };
        match result {
            OpResult::Applied => {
                self.metrics.rows_applied.fetch_add(1, Ordering::Relaxed);
            }
            OpResult::AlreadyPresent => {
                self.metrics.insert_rejects.fetch_add(1, Ordering::Relaxed);
            }
            OpResult::NotFound => {
                self.metrics.mutate_misses.fetch_add(1, Ordering::Relaxed);
            }
            OpResult::Pending => {}
        }
        Ok(result)
    }

    fn legacy_is_live(&self, components: &TabletComponents, key: &[u8]) -> bool {
        components.memrowset.is_live(key)
            || components
                .rowsets
                .rowsets_for_key(key)
                .iter()
                .any(|rs| rs.is_live(key))
    }

    fn legacy_mutate(
        &self,
        components: &TabletComponents,
        key: &[u8],
        change: RowChange,
        ht: HybridTime,
    ) -> TabletResult<OpResult> {
        if components.memrowset.is_live(key) {
            components.memrowset.mutate(key, change, ht)?;
            return Ok(OpResult::Applied);
        }
        for rs in components.rowsets.rowsets_for_key(key) {
            match rs.mutate(key, change.clone(), ht) {
                Ok(()) => return Ok(OpResult::Applied),
                Err(TabletError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(OpResult::NotFound)
    }

    fn apply_kv_ops(
        &self,
        doc_ops: &mut [crate::ops::DocOperation],
        ht: HybridTime,
        index: u64,
    ) -> TabletResult<Vec<OpResult>> {
        let kv = self.kv_engine()?;
        let mut kv_batch = KvBatch::new();
        for doc_op in doc_ops.iter_mut() {
            let exists = self
                .kv_visible(kv, &doc_op.encoded_key, &MvccSnapshot::all_committed())
                .is_some();
            doc_op.result = match &doc_op.op {
                WireOp::Insert { value, .. } => {
                    if exists {
                        self.metrics.insert_rejects.fetch_add(1, Ordering::Relaxed);
                        OpResult::AlreadyPresent
                    } else {
                        kv_batch.put(doc_key_from_prefix(&doc_op.encoded_key, ht), value.clone());
                        OpResult::Applied
                    }
                }
                WireOp::Update { value, .. } => {
                    if exists {
                        kv_batch.put(doc_key_from_prefix(&doc_op.encoded_key, ht), value.clone());
                        OpResult::Applied
                    } else {
                        self.metrics.mutate_misses.fetch_add(1, Ordering::Relaxed);
                        OpResult::NotFound
                    }
                }
                WireOp::Delete { .. } => {
                    if exists {
                        kv_batch.delete(doc_key_from_prefix(&doc_op.encoded_key, ht));
                        OpResult::Applied
                    } else {
                        self.metrics.mutate_misses.fetch_add(1, Ordering::Relaxed);
                        OpResult::NotFound
                    }
                }
            };
            if doc_op.result.is_ok() {
                self.metrics.rows_applied.fetch_add(1, Ordering::Relaxed);
            }
        }
        if !kv_batch.is_empty() {
            kv.write_batch(kv_batch, index)?;
        }
        Ok(doc_ops.iter().map(|d| d.result.clone()).collect())
    }

    fn kv_engine(&self) -> TabletResult<&KvEngine> {
        self.kv.as_ref().ok_or_else(|| {
            TabletError::illegal_state(format!(
                "tablet {} has no KV engine (table type {:?})",
                self.tablet_id, self.table_type
            ))
        })
    }

    /// Newest version of a row visible at `snap`. Tombstones read as
    /// `None`. Provisional transaction writes are never in the engine, so
    /// no intent filtering is needed here.
    fn kv_visible(
        &self,
        kv: &KvEngine,
        encoded_key: &[u8],
        snap: &MvccSnapshot,
    ) -> Option<Vec<u8>> {
        for (doc_key, value) in kv.scan_prefix(encoded_key) {
            let ht = match decode_doc_key(&doc_key) {
                Ok((_, ht)) => ht,
                Err(e) => {
                    tracing::warn!("skipping undecodable doc key: {e}");
                    continue;
                }
            };
            if !snap.is_committed(ht) {
                continue;
            }
            return value;
        }
        None
    }

    // ── Transaction participant operations ──────────────────────────────

    /// Coordinator-driven apply: materialize the transaction's buffered
    /// provisional ops into the stores at one commit time. The intents
    /// keep conflicting writers out until the status flips.
    pub fn apply_transaction(&self, txn_id: TxnId) -> TabletResult<HybridTime> {
        let _op_guard = self.begin_op()?;
        match self.txns.status(txn_id) {
            None => {
                return Err(TabletError::NotFound(format!(
                    "{txn_id} not registered on tablet {}",
                    self.tablet_id
                )))
            }
            Some(kestrel_common::types::TxnStatus::Aborted) => {
                return Err(TabletError::illegal_state(format!(
                    "{txn_id} already aborted, cannot apply"
                )))
            }
            _ => {}
        }
        let ops = self.txns.take_provisional(txn_id);
        let (op_id, mvcc_op, components) =
            self.assign_and_replicate(|ht| ReplicateOp::UpdateTransaction {
                txn_id,
                aborted: false,
                commit_ht: ht,
                ops: ops.clone(),
            })?;
        let commit_ht = mvcc_op.hybrid_time();
        self.materialize_ops(&components, &ops, commit_ht, op_id.index)?;
        self.txns.apply_transaction(txn_id, commit_ht)?;
        self.log_commit(op_id)?;
        mvcc_op.commit();
        self.last_committed_index
            .fetch_max(op_id.index, Ordering::SeqCst);
        self.metrics.txn_applies.fetch_add(1, Ordering::Relaxed);
        Ok(commit_ht)
    }

    /// Coordinator-driven abort: the buffered ops are discarded with the
    /// intents; nothing ever reached the stores.
    pub fn abort_transaction(&self, txn_id: TxnId) -> TabletResult<()> {
        let _op_guard = self.begin_op()?;
        let (op_id, mvcc_op, _components) =
            self.assign_and_replicate(|_| ReplicateOp::UpdateTransaction {
                txn_id,
                aborted: true,
                commit_ht: HybridTime::MIN,
                ops: Vec::new(),
            })?;
        self.txns.abort_transaction(txn_id)?;
        self.log_commit(op_id)?;
        mvcc_op.commit();
        self.last_committed_index
            .fetch_max(op_id.index, Ordering::SeqCst);
        self.metrics.txn_aborts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn materialize_ops(
        &self,
        components: &TabletComponents,
        ops: &[WireOp],
        ht: HybridTime,
        index: u64,
    ) -> TabletResult<()> {
        match self.table_type {
            TableType::LegacyRowSet => {
                for wire_op in ops {
                    self.apply_legacy_op(components, wire_op, ht)?;
                }
            }
            TableType::KeyValue => {
                let mut doc_ops: Vec<crate::ops::DocOperation> = ops
                    .iter()
                    .cloned()
                    .map(crate::ops::DocOperation::from_wire)
                    .collect();
                self.apply_kv_ops(&mut doc_ops, ht, index)?;
            }
        }
        Ok(())
    }

    // ── Schema ──────────────────────────────────────────────────────────

    pub fn schema_version(&self) -> SchemaVersion {
        self.schema_version.load(Ordering::SeqCst)
    }

    /// Bump the schema version. Only forward moves are legal.
    pub fn alter_schema(&self, new_version: SchemaVersion) -> TabletResult<()> {
        let _op_guard = self.begin_op()?;
        let current = self.schema_version.load(Ordering::SeqCst);
        if new_version <= current {
            return Err(TabletError::InvalidArgument(format!(
                "schema version must move forward (current {current}, requested {new_version})"
            )));
        }
        let (op_id, mvcc_op, _components) =
            self.assign_and_replicate(|_| ReplicateOp::AlterSchema {
                schema_version: new_version,
            })?;
        self.schema_version.store(new_version, Ordering::SeqCst);
        self.log_commit(op_id)?;
        mvcc_op.commit();
        self.last_committed_index
            .fetch_max(op_id.index, Ordering::SeqCst);
        self.metadata.lock().schema_version = new_version;
        self.persist_metadata()?;
        Ok(())
    }

    // ── Replay entry points (bootstrap only) ────────────────────────────

    /// Re-apply one logged write during bootstrap. No locks, no logging:
    /// replay is single-threaded and the entry is already durable.
    pub fn replay_write(
        &self,
        op_id: OpId,
        ht: HybridTime,
        batch: &WireBatch,
    ) -> TabletResult<()> {
        self.check_bootstrapping()?;
        self.clock.update(ht);
        let mvcc_op = self.mvcc.start_operation_at(ht)?;
        let result = (|| -> TabletResult<()> {
            if let Some(txn_id) = batch.txn_id {
                // Rebuild the provisional state; the later apply entry
                // carries its own copy of the ops, so this only restores
                // intents for transactions still pending at the crash.
                self.txns.register(txn_id, batch.isolation());
                for wire_op in &batch.ops {
                    match self.table_type {
                        TableType::LegacyRowSet => {
                            self.txns.write_intent(wire_op.key(), txn_id, ht)?
                        }
                        TableType::KeyValue => self.txns.write_intent(
                            &encode_key_prefix(wire_op.key()),
                            txn_id,
                            ht,
                        )?,
                    }
                    self.txns.buffer_op(txn_id, wire_op.clone());
                }
                return Ok(());
            }
            match self.table_type {
                TableType::LegacyRowSet => {
                    let components = self.components.read().clone();
                    for wire_op in &batch.ops {
                        self.apply_legacy_op(&components, wire_op, ht)?;
                    }
                }
                TableType::KeyValue => {
                    let mut doc_ops: Vec<crate::ops::DocOperation> = batch
                        .ops
                        .iter()
                        .cloned()
                        .map(crate::ops::DocOperation::from_wire)
                        .collect();
                    self.apply_kv_ops(&mut doc_ops, ht, op_id.index)?;
                }
            }
            Ok(())
        })();
        match result {
            Ok(()) => {
                mvcc_op.commit();
                Ok(())
            }
            Err(e) => {
                mvcc_op.abort();
                Err(e)
            }
        }
    }

    pub fn replay_alter_schema(&self, schema_version: SchemaVersion) -> TabletResult<()> {
        self.check_bootstrapping()?;
        self.schema_version
            .fetch_max(schema_version, Ordering::SeqCst);
        self.metadata.lock().schema_version =
            self.schema_version.load(Ordering::SeqCst);
        Ok(())
    }

    pub fn replay_update_transaction(
        &self,
        txn_id: TxnId,
        aborted: bool,
        commit_ht: HybridTime,
        ops: &[WireOp],
        index: u64,
    ) -> TabletResult<()> {
        self.check_bootstrapping()?;
        // The registration may predate the log tail being replayed;
        // recreate it so the status transition lands.
        if self.txns.status(txn_id).is_none() {
            self.txns
                .register(txn_id, kestrel_common::types::IsolationLevel::Snapshot);
        }
        if aborted {
            self.txns.abort_transaction(txn_id)
        } else {
            self.clock.update(commit_ht);
            let mvcc_op = self.mvcc.start_operation_at(commit_ht)?;
            let components = self.components.read().clone();
            match self.materialize_ops(&components, ops, commit_ht, index) {
                Ok(()) => mvcc_op.commit(),
                Err(e) => {
                    mvcc_op.abort();
                    return Err(e);
                }
            }
            self.txns.apply_transaction(txn_id, commit_ht)
        }
    }

    /// Settle a transaction whose materialized data is already durable
    /// (its apply entry sits at or below the flush watermark): release the
    /// intents and buffered ops restored by the transaction's replayed
    /// write entries without touching the stores.
    pub fn replay_settle_transaction(
        &self,
        txn_id: TxnId,
        commit_ht: HybridTime,
    ) -> TabletResult<()> {
        self.check_bootstrapping()?;
        if self.txns.status(txn_id).is_none() {
            self.txns
                .register(txn_id, kestrel_common::types::IsolationLevel::Snapshot);
        }
        self.txns.apply_transaction(txn_id, commit_ht)
    }

    /// Install the log position reached by replay.
    pub(crate) fn set_log_position(&self, term: u64, next_index: u64, committed_index: u64) {
        self.term.store(term.max(1), Ordering::SeqCst);
        self.next_index.fetch_max(next_index, Ordering::SeqCst);
        self.last_committed_index
            .fetch_max(committed_index, Ordering::SeqCst);
    }

    // ── Read path ───────────────────────────────────────────────────────

    /// A consistent snapshot at the current safe time.
    pub fn snapshot(&self) -> TabletResult<TabletSnapshot<'_>> {
        self.snapshot_at(self.mvcc.safe_time())
    }

    /// A consistent snapshot at `ht`. The registration keeps history
    /// compaction from discarding versions this reader may still need.
    pub fn snapshot_at(&self, ht: HybridTime) -> TabletResult<TabletSnapshot<'_>> {
        self.check_open()?;
        Ok(TabletSnapshot {
            tablet: self,
            components: self.components.read().clone(),
            snap: self.mvcc.snapshot_at(ht),
            _reader: self.readers.register(ht),
        })
    }

    // ── Flush ───────────────────────────────────────────────────────────

    /// Flush in-memory state to durable stores and advance the superblock
    /// watermarks accordingly.
    pub fn flush(&self) -> TabletResult<()> {
        if self.state() == TabletState::Shutdown {
            return Err(TabletError::illegal_state("flush after shutdown"));
        }
        match self.table_type {
            TableType::KeyValue => self.flush_kv(),
            TableType::LegacyRowSet => self.flush_legacy(),
        }
    }

    /// Flush when the memstore exceeds its budget. Returns whether a flush
    /// happened.
    pub fn maybe_flush(&self) -> TabletResult<bool> {
        if self.memstore_bytes() < self.config.flush.memstore_budget_bytes {
            return Ok(false);
        }
        self.flush()?;
        Ok(true)
    }

    pub fn memstore_bytes(&self) -> u64 {
        match self.table_type {
            TableType::LegacyRowSet => self.components.read().memrowset.approx_bytes(),
            TableType::KeyValue => self
                .kv
                .as_ref()
                .map(|kv| kv.memtable_bytes())
                .unwrap_or(0),
        }
    }

    fn flush_kv(&self) -> TabletResult<()> {
        let kv = self.kv_engine()?;
        kv.flush()?;
        {
            let mut meta = self.metadata.lock();
            meta.last_durable_op_index = meta.last_durable_op_index.max(kv.flushed_index());
        }
        self.persist_metadata()
    }

    fn flush_legacy(&self) -> TabletResult<()> {
        let _flush_guard = self.flush_lock.lock();

        // Watermark read and store swap happen under the assignment lock:
        // every op at or below the watermark has already captured the old
        // store set and started its MVCC operation, so the wait below
        // covers it; every later op sees the new memrowset. Over-replay of
        // later entries is idempotent.
        let (watermark, old_mrs) = {
            let _assign_guard = self.assign_lock.lock();
            let watermark = self.next_index.load(Ordering::SeqCst).saturating_sub(1);
            let new_mrs =
                Arc::new(MemRowSet::new(self.next_mrs_id.fetch_add(1, Ordering::SeqCst)));
            let mut components = self.components.write();
            let old_mrs = components.memrowset.clone();
            *components = Arc::new(TabletComponents {
                memrowset: new_mrs,
                rowsets: components.rowsets.clone(),
            });
            (watermark, old_mrs)
        };
        // Writers that captured the old store set may still be applying.
        self.mvcc.wait_for_applying_to_commit();

        if !old_mrs.is_empty() {
            let versions = old_mrs.drain_versions();
            let mut writer = RollingDiskRowSetWriter::new(
                &self.data_dir,
                &self.next_rowset_id,
                self.config.flush.rolling_segment_bytes,
            );
            // Earliest version becomes the base row; the rest of the key's
            // history is carried over as deltas so older snapshots keep
            // resolving.
            let mut carried: Vec<(Vec<u8>, HybridTime, RowChange)> = Vec::new();
            let mut current_key: Option<Vec<u8>> = None;
            for (key, ht, change) in versions {
                if current_key.as_deref() != Some(key.as_slice()) {
                    current_key = Some(key.clone());
                    match change {
                        RowChange::Insert(value) => writer.append(key, ht, value)?,
                        other => {
                            return Err(TabletError::Corruption(format!(
                                "memrowset {} history for key {:02x?} starts with {:?}",
                                old_mrs.id(),
                                &key[..key.len().min(16)],
                                other
                            )))
                        }
                    }
                } else {
                    carried.push((key, ht, change));
                }
            }
            let new_rowsets = writer.finish()?;
            for (key, ht, change) in carried {
                if let Some(rs) = new_rowsets.iter().find(|rs| rs.key_in_range(&key)) {
                    rs.apply_delta_unchecked(&key, ht, change);
                }
            }
            for rs in &new_rowsets {
                rs.flush_deltas(&self.data_dir)?;
            }

            let new_handles: Vec<RowSetHandle> = new_rowsets
                .into_iter()
                .map(RowSetHandle::Disk)
                .collect();
            let mut components = self.components.write();
            let new_tree = components.rowsets.replacing(&[], new_handles);
            *components = Arc::new(TabletComponents {
                memrowset: components.memrowset.clone(),
                rowsets: new_tree,
            });
        }

        // The watermark also covers mutations that landed in delta mem
        // stores, so those must reach disk too. A rowset serving as a
        // compaction input cannot flush deltas; in that case the watermark
        // stays put and the next flush advances it.
        let mut all_deltas_durable = true;
        for rs in self.components.read().rowsets.disk_rowsets() {
            match rs.flush_deltas(&self.data_dir) {
                Ok(Some(_)) => {
                    self.metrics.delta_flushes.fetch_add(1, Ordering::Relaxed);
                }
                Ok(None) => {}
                Err(TabletError::IllegalState(_)) => all_deltas_durable = false,
                Err(e) => return Err(e),
            }
        }
        if self
            .components
            .read()
            .rowsets
            .entries()
            .iter()
            .any(|h| matches!(h, RowSetHandle::Duplicating(_)))
        {
            all_deltas_durable = false;
        }

        {
            let mut meta = self.metadata.lock();
            meta.last_durable_mrs_id = meta.last_durable_mrs_id.max(old_mrs.id());
            if all_deltas_durable {
                meta.last_durable_op_index = meta.last_durable_op_index.max(watermark);
            }
        }
        self.persist_metadata()?;
        self.metrics.mrs_flushes.fetch_add(1, Ordering::Relaxed);
        self.metrics.layout_changes.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            "tablet {} flushed memrowset {} (watermark {})",
            self.tablet_id,
            old_mrs.id(),
            watermark
        );
        Ok(())
    }

    /// Rewrite the superblock from current in-memory state.
    pub(crate) fn persist_metadata(&self) -> TabletResult<()> {
        let mut meta = self.metadata.lock();
        if self.table_type == TableType::LegacyRowSet {
            let tree = self.components.read().rowsets.clone();
            let mut rowsets = Vec::new();
            for handle in tree.entries() {
                match handle {
                    RowSetHandle::Disk(rs) => rowsets.push(RowSetMeta {
                        id: rs.id(),
                        delta_ids: rs.delta_file_ids(),
                    }),
                    // Mid-compaction the old inputs are still the durable
                    // truth; the output is recorded by the final swap.
                    RowSetHandle::Duplicating(dup) => {
                        for rs in dup.old_rowsets() {
                            rowsets.push(RowSetMeta {
                                id: rs.id(),
                                delta_ids: rs.delta_file_ids(),
                            });
                        }
                    }
                }
            }
            rowsets.sort_by_key(|r| r.id);
            meta.rowsets = rowsets;
        }
        meta.next_rowset_id = self.next_rowset_id.load(Ordering::SeqCst);
        meta.store(&self.root)
    }

    // ── Checkpoint ──────────────────────────────────────────────────────

    /// Durable point-in-time copy of the tablet's data under `dir`: flush
    /// first, then copy the superblock and every store file.
    pub fn create_checkpoint(&self, dir: &Path) -> TabletResult<()> {
        self.check_open()?;
        self.flush()?;
        fs::create_dir_all(dir)?;
        fs::copy(
            TabletMetadata::path_in(&self.root),
            TabletMetadata::path_in(dir),
        )?;
        let data_out = TabletMetadata::data_dir(dir);
        match &self.kv {
            Some(kv) => kv.checkpoint(&data_out)?,
            None => {
                fs::create_dir_all(&data_out)?;
                for entry in fs::read_dir(&self.data_dir)? {
                    let path = entry?.path();
                    if path.is_file() {
                        if let Some(name) = path.file_name() {
                            fs::copy(&path, data_out.join(name))?;
                        }
                    }
                }
            }
        }
        tracing::info!(
            "tablet {} checkpoint created at {}",
            self.tablet_id,
            dir.display()
        );
        Ok(())
    }

    // ── Accessors / introspection ───────────────────────────────────────

    pub fn tablet_id(&self) -> &TabletId {
        &self.tablet_id
    }

    pub fn table_type(&self) -> TableType {
        self.table_type
    }

    pub fn config(&self) -> &TabletConfig {
        &self.config
    }

    pub fn clock(&self) -> &ClockRef {
        &self.clock
    }

    pub fn mvcc(&self) -> &Arc<MvccManager> {
        &self.mvcc
    }

    pub fn readers(&self) -> &Arc<ReaderTimestampRegistry> {
        &self.readers
    }

    pub fn participant(&self) -> &TransactionParticipant {
        &self.txns
    }

    pub fn kv(&self) -> Option<&KvEngine> {
        self.kv.as_ref()
    }

    pub fn components(&self) -> Arc<TabletComponents> {
        self.components.read().clone()
    }

    pub(crate) fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Superblock flush watermark: log entries at or below this index are
    /// already reflected in durable stores and must not be replayed.
    pub(crate) fn last_durable_op_index(&self) -> u64 {
        let meta_watermark = self.metadata.lock().last_durable_op_index;
        match &self.kv {
            Some(kv) => meta_watermark.max(kv.flushed_index()),
            None => meta_watermark,
        }
    }

    pub(crate) fn next_rowset_id(&self) -> &AtomicU64 {
        &self.next_rowset_id
    }

    /// Swap the rowset tree while holding the components lock, so a tree
    /// rebuilt by compaction can never clobber a concurrent flush's swap.
    pub(crate) fn update_tree(
        &self,
        rebuild: impl FnOnce(&Arc<RowSetTree>) -> Arc<RowSetTree>,
    ) {
        let mut components = self.components.write();
        *components = Arc::new(TabletComponents {
            memrowset: components.memrowset.clone(),
            rowsets: rebuild(&components.rowsets),
        });
    }

    pub fn metrics(&self) -> &TabletMetrics {
        &self.metrics
    }

    pub fn last_committed_index(&self) -> u64 {
        self.last_committed_index.load(Ordering::SeqCst)
    }

    pub fn debug_dump(&self) -> serde_json::Value {
        let components = self.components.read().clone();
        json!({
            "tablet_id": self.tablet_id.to_string(),
            "table_type": format!("{:?}", self.table_type),
            "state": self.state().to_string(),
            "schema_version": self.schema_version.load(Ordering::SeqCst),
            "term": self.term.load(Ordering::SeqCst),
            "next_index": self.next_index.load(Ordering::SeqCst),
            "last_committed_index": self.last_committed_index.load(Ordering::SeqCst),
            "safe_time": self.mvcc.safe_time().to_string(),
            "memrowset_id": components.memrowset.id(),
            "memrowset_bytes": components.memrowset.approx_bytes(),
            "disk_rowsets": components.rowsets.len(),
            "kv_segments": self.kv.as_ref().map(|kv| kv.segment_count()),
            "metrics": self.metrics.dump(),
        })
    }
}

struct PendingOpGuard<'a> {
    tablet: &'a Tablet,
}

impl Drop for PendingOpGuard<'_> {
    fn drop(&mut self) {
        let mut pending = self.tablet.pending_ops.lock();
        *pending -= 1;
        if *pending == 0 {
            self.tablet.drained.notify_all();
        }
    }
}

// ── Snapshot reads ──────────────────────────────────────────────────────

/// A consistent read view. Holds the store set alive and keeps the reader
/// registered so history it depends on is not compacted away.
pub struct TabletSnapshot<'a> {
    tablet: &'a Tablet,
    components: Arc<TabletComponents>,
    snap: MvccSnapshot,
    _reader: ReaderRegistration,
}

impl TabletSnapshot<'_> {
    pub fn snapshot_time(&self) -> HybridTime {
        self.snap.snapshot_time
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        match self.tablet.table_type {
            TableType::LegacyRowSet => {
                if let Some(v) = self.components.memrowset.get(key, &self.snap) {
                    return Some(v);
                }
                self.components
                    .rowsets
                    .rowsets_for_key(key)
                    .iter()
                    .find_map(|rs| rs.get(key, &self.snap))
            }
            TableType::KeyValue => {
                let kv = self.tablet.kv.as_ref()?;
                self.tablet
                    .kv_visible(kv, &encode_key_prefix(key), &self.snap)
            }
        }
    }

    /// All visible rows in key order.
    pub fn scan(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        match self.tablet.table_type {
            TableType::LegacyRowSet => {
                let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
                for handle in self.components.rowsets.entries() {
                    for (k, v) in handle.iterate(&self.snap) {
                        merged.insert(k, v);
                    }
                }
                for (k, v) in self.components.memrowset.iterate(&self.snap) {
                    merged.insert(k, v);
                }
                merged.into_iter().collect()
            }
            TableType::KeyValue => {
                let Some(kv) = self.tablet.kv.as_ref() else {
                    return Vec::new();
                };
                let mut out = Vec::new();
                let mut decided: Option<Vec<u8>> = None;
                for (doc_key, value) in kv.scan_prefix(&[]) {
                    let (prefix, ht) = match decode_doc_key(&doc_key) {
                        Ok(parts) => parts,
                        Err(e) => {
                            tracing::warn!("skipping undecodable doc key in scan: {e}");
                            continue;
                        }
                    };
                    if decided.as_ref() == Some(&prefix) {
                        continue;
                    }
                    if !self.snap.is_committed(ht) {
                        continue;
                    }
                    decided = Some(prefix.clone());
                    if let Some(v) = value {
                        match decode_key_prefix(&prefix) {
                            Ok(key) => out.push((key, v)),
                            Err(e) => tracing::warn!("bad key prefix in scan: {e}"),
                        }
                    }
                }
                out
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ops::WireOp;
    use crate::wal::LogWriter;
    use tempfile::TempDir;

    fn open_tablet(root: &Path, table_type: TableType) -> Tablet {
        let clock: ClockRef = Arc::new(ManualClock::new(HybridTime::from_micros(1_000)));
        let config = TabletConfig::default();
        let tablet = Tablet::create(
            root,
            TabletId("tablet-test".to_string()),
            table_type,
            config.clone(),
            clock,
        )
        .unwrap();
        tablet.mark_bootstrapping().unwrap();
        let log = LogWriter::open(&TabletMetadata::wal_dir(root), config.wal).unwrap();
        tablet.mark_open(log).unwrap();
        tablet
    }

    fn insert(key: &[u8], value: &[u8]) -> WireBatch {
        WireBatch::new(vec![WireOp::Insert {
            key: key.to_vec(),
            value: value.to_vec(),
        }])
    }

    fn update(key: &[u8], value: &[u8]) -> WireBatch {
        WireBatch::new(vec![WireOp::Update {
            key: key.to_vec(),
            value: value.to_vec(),
        }])
    }

    #[test]
    fn test_lifecycle_transitions() {
        let dir = TempDir::new().unwrap();
        let clock: ClockRef = Arc::new(ManualClock::new(HybridTime::from_micros(1_000)));
        let tablet = Tablet::create(
            dir.path(),
            TabletId("t".to_string()),
            TableType::LegacyRowSet,
            TabletConfig::default(),
            clock,
        )
        .unwrap();
        assert_eq!(tablet.state(), TabletState::Initialized);
        // Writes before open are rejected.
        assert!(matches!(
            tablet.write(insert(b"a", b"1")),
            Err(TabletError::IllegalState(_))
        ));
        // Opening from Initialized (skipping bootstrap) is illegal.
        let log = LogWriter::open(
            &TabletMetadata::wal_dir(dir.path()),
            TabletConfig::default().wal,
        )
        .unwrap();
        assert!(tablet.mark_open(log).is_err());

        tablet.mark_bootstrapping().unwrap();
        let log = LogWriter::open(
            &TabletMetadata::wal_dir(dir.path()),
            TabletConfig::default().wal,
        )
        .unwrap();
        tablet.mark_open(log).unwrap();
        assert_eq!(tablet.state(), TabletState::Open);

        tablet.shutdown().unwrap();
        assert_eq!(tablet.state(), TabletState::Shutdown);
        assert!(tablet.write(insert(b"a", b"1")).is_err());
    }

    #[test]
    fn test_legacy_insert_update_delete() {
        let dir = TempDir::new().unwrap();
        let tablet = open_tablet(dir.path(), TableType::LegacyRowSet);

        assert_eq!(
            tablet.write(insert(b"a", b"v1")).unwrap(),
            vec![OpResult::Applied]
        );
        assert_eq!(
            tablet.write(insert(b"a", b"v2")).unwrap(),
            vec![OpResult::AlreadyPresent]
        );
        assert_eq!(
            tablet.write(update(b"a", b"v2")).unwrap(),
            vec![OpResult::Applied]
        );
        assert_eq!(
            tablet.write(update(b"missing", b"x")).unwrap(),
            vec![OpResult::NotFound]
        );

        let snap = tablet.snapshot().unwrap();
        assert_eq!(snap.get(b"a"), Some(b"v2".to_vec()));

        tablet
            .write(WireBatch::new(vec![WireOp::Delete { key: b"a".to_vec() }]))
            .unwrap();
        let snap = tablet.snapshot().unwrap();
        assert_eq!(snap.get(b"a"), None);
    }

    #[test]
    fn test_kv_insert_update_delete() {
        let dir = TempDir::new().unwrap();
        let tablet = open_tablet(dir.path(), TableType::KeyValue);

        assert_eq!(
            tablet.write(insert(b"a", b"v1")).unwrap(),
            vec![OpResult::Applied]
        );
        assert_eq!(
            tablet.write(insert(b"a", b"v2")).unwrap(),
            vec![OpResult::AlreadyPresent]
        );
        assert_eq!(
            tablet.write(update(b"a", b"v2")).unwrap(),
            vec![OpResult::Applied]
        );
        let snap = tablet.snapshot().unwrap();
        assert_eq!(snap.get(b"a"), Some(b"v2".to_vec()));

        tablet
            .write(WireBatch::new(vec![WireOp::Delete { key: b"a".to_vec() }]))
            .unwrap();
        let snap = tablet.snapshot().unwrap();
        assert_eq!(snap.get(b"a"), None);
        assert_eq!(
            tablet.write(update(b"a", b"v3")).unwrap(),
            vec![OpResult::NotFound]
        );
    }

    #[test]
    fn test_schema_version_mismatch_rejected() {
        let dir = TempDir::new().unwrap();
        let tablet = open_tablet(dir.path(), TableType::LegacyRowSet);
        let mut batch = insert(b"a", b"1");
        batch.schema_version = 7;
        assert!(matches!(
            tablet.write(batch),
            Err(TabletError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_alter_schema_forward_only() {
        let dir = TempDir::new().unwrap();
        let tablet = open_tablet(dir.path(), TableType::LegacyRowSet);
        tablet.alter_schema(2).unwrap();
        assert_eq!(tablet.schema_version(), 2);
        assert!(tablet.alter_schema(1).is_err());
        assert!(tablet.alter_schema(2).is_err());

        let mut batch = insert(b"a", b"1");
        batch.schema_version = 2;
        assert_eq!(tablet.write(batch).unwrap(), vec![OpResult::Applied]);
    }

    #[test]
    fn test_flush_preserves_content() {
        let dir = TempDir::new().unwrap();
        let tablet = open_tablet(dir.path(), TableType::LegacyRowSet);
        for i in 0..20u32 {
            let key = format!("key{:02}", i);
            tablet
                .write(insert(key.as_bytes(), b"before"))
                .unwrap();
        }
        tablet.write(update(b"key05", b"after")).unwrap();
        tablet.flush().unwrap();

        let snap = tablet.snapshot().unwrap();
        assert_eq!(snap.scan().len(), 20);
        assert_eq!(snap.get(b"key05"), Some(b"after".to_vec()));
        assert_eq!(snap.get(b"key06"), Some(b"before".to_vec()));

        // Mutations after the flush land in the rowset's delta store.
        tablet.write(update(b"key06", b"newer")).unwrap();
        let snap = tablet.snapshot().unwrap();
        assert_eq!(snap.get(b"key06"), Some(b"newer".to_vec()));
    }

    #[test]
    fn test_snapshot_ignores_later_writes() {
        let dir = TempDir::new().unwrap();
        let tablet = open_tablet(dir.path(), TableType::LegacyRowSet);
        tablet.write(insert(b"row", b"old")).unwrap();

        let before = tablet.mvcc().safe_time();
        tablet.write(update(b"row", b"new")).unwrap();

        let snap = tablet.snapshot_at(before).unwrap();
        assert_eq!(snap.get(b"row"), Some(b"old".to_vec()));
        let now = tablet.snapshot().unwrap();
        assert_eq!(now.get(b"row"), Some(b"new".to_vec()));
    }

    #[test]
    fn test_snapshot_survives_flush() {
        let dir = TempDir::new().unwrap();
        let tablet = open_tablet(dir.path(), TableType::LegacyRowSet);
        tablet.write(insert(b"row", b"old")).unwrap();
        let before = tablet.mvcc().safe_time();
        tablet.write(update(b"row", b"new")).unwrap();

        tablet.flush().unwrap();

        // The pre-update version must still resolve from disk.
        let snap = tablet.snapshot_at(before).unwrap();
        assert_eq!(snap.get(b"row"), Some(b"old".to_vec()));
    }

    #[test]
    fn test_transactional_write_visibility() {
        let dir = TempDir::new().unwrap();
        let tablet = open_tablet(dir.path(), TableType::KeyValue);
        let txn = TxnId(7);

        tablet
            .write(WireBatch::transactional(
                txn,
                vec![WireOp::Insert {
                    key: b"a".to_vec(),
                    value: b"provisional".to_vec(),
                }],
            ))
            .unwrap();

        // Pending intent hides the version.
        let snap = tablet.snapshot().unwrap();
        assert_eq!(snap.get(b"a"), None);

        tablet.apply_transaction(txn).unwrap();
        let snap = tablet.snapshot().unwrap();
        assert_eq!(snap.get(b"a"), Some(b"provisional".to_vec()));
    }

    #[test]
    fn test_non_transactional_conflict_aborts() {
        let dir = TempDir::new().unwrap();
        let tablet = open_tablet(dir.path(), TableType::KeyValue);
        let txn = TxnId(9);
        tablet
            .write(WireBatch::transactional(
                txn,
                vec![WireOp::Insert {
                    key: b"k".to_vec(),
                    value: b"p".to_vec(),
                }],
            ))
            .unwrap();

        // A plain write against the same key conflicts with the pending txn.
        let err = tablet.write(insert(b"k", b"x")).unwrap_err();
        assert!(err.is_retryable());

        tablet.abort_transaction(txn).unwrap();
        // After abort the intent is gone and the key reads as absent.
        assert_eq!(
            tablet.write(insert(b"k", b"x")).unwrap(),
            vec![OpResult::Applied]
        );
    }

    #[test]
    fn test_checkpoint_copies_data() {
        let dir = TempDir::new().unwrap();
        let tablet = open_tablet(dir.path(), TableType::KeyValue);
        tablet.write(insert(b"a", b"1")).unwrap();
        tablet.write(insert(b"b", b"2")).unwrap();

        let ckpt = dir.path().join("ckpt");
        tablet.create_checkpoint(&ckpt).unwrap();
        assert!(TabletMetadata::exists_in(&ckpt));
        let copied = fs::read_dir(TabletMetadata::data_dir(&ckpt))
            .unwrap()
            .count();
        assert!(copied > 0);
    }

    #[test]
    fn test_debug_dump_shape() {
        let dir = TempDir::new().unwrap();
        let tablet = open_tablet(dir.path(), TableType::LegacyRowSet);
        tablet.write(insert(b"a", b"1")).unwrap();
        let dump = tablet.debug_dump();
        assert_eq!(dump["state"], "OPEN");
        assert_eq!(dump["metrics"]["writes"], 1);
    }
}
