//! Budgeted background maintenance.
//!
//! A single worker thread periodically scores the registered maintenance
//! ops and runs the best runnable one: memstore flushes, rowset merge
//! compactions and the two delta compaction flavors. Rowset swaps go
//! through a [`DuplicatingRowSet`] so readers and writers never block on
//! a running compaction.

use std::collections::BTreeMap;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use kestrel_common::error::{TabletError, TabletResult};
use kestrel_common::shutdown::ShutdownSignal;
use kestrel_common::types::{HybridTime, TableType};

use crate::mvcc::MvccSnapshot;
use crate::rowset::{
    materialize, DiskRowSet, DuplicatingRowSet, RollingDiskRowSetWriter, RowChange, RowSetHandle,
};
use crate::tablet::{Tablet, TabletState};

// ── Op interface ────────────────────────────────────────────────────────

/// Scheduling stats for one maintenance op, recomputed each scheduler
/// pass (or served from a cache keyed on the tablet's layout epoch).
#[derive(Debug, Clone, Copy, Default)]
pub struct OpStats {
    /// Whether the op has anything worth doing right now.
    pub runnable: bool,
    /// Relative benefit; the scheduler runs the highest-scoring runnable op.
    pub perf_score: f64,
}

pub trait MaintenanceOp: Send + Sync {
    fn name(&self) -> &'static str;

    fn update_stats(&self) -> OpStats;

    /// Reserve the op's inputs. Returns false if it lost a race with a
    /// concurrent flush or compaction and should be skipped this pass.
    fn prepare(&self) -> bool;

    /// Run the op. Must release whatever `prepare` reserved, on every
    /// path.
    fn perform(&self) -> TabletResult<()>;
}

// ── Memstore flush ──────────────────────────────────────────────────────

/// Flushes the active memstore once it exceeds its byte budget. Covers
/// both backends; the tablet picks the right flush path for its type.
pub struct FlushOp {
    tablet: Arc<Tablet>,
    running: AtomicBool,
}

impl FlushOp {
    pub fn new(tablet: Arc<Tablet>) -> Self {
        Self {
            tablet,
            running: AtomicBool::new(false),
        }
    }
}

impl MaintenanceOp for FlushOp {
    fn name(&self) -> &'static str {
        "flush_memstore"
    }

    fn update_stats(&self) -> OpStats {
        let bytes = self.tablet.memstore_bytes();
        let budget = self.tablet.config().flush.memstore_budget_bytes.max(1);
        OpStats {
            runnable: bytes >= budget && !self.running.load(Ordering::SeqCst),
            perf_score: bytes as f64 / budget as f64,
        }
    }

    fn prepare(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn perform(&self) -> TabletResult<()> {
        let result = self.tablet.flush();
        self.running.store(false, Ordering::SeqCst);
        result
    }
}

// ── Rowset merge compaction ─────────────────────────────────────────────

/// Merges overlapping disk rowsets into a replacement set, bounded by
/// the compaction IO budget. Selection stats are cached against the
/// tablet's layout epoch so idle passes stay cheap.
pub struct CompactRowSetsOp {
    tablet: Arc<Tablet>,
    selected: Mutex<Vec<Arc<DiskRowSet>>>,
    cached: Mutex<Option<(u64, OpStats)>>,
}

impl CompactRowSetsOp {
    pub fn new(tablet: Arc<Tablet>) -> Self {
        Self {
            tablet,
            selected: Mutex::new(Vec::new()),
            cached: Mutex::new(None),
        }
    }

    /// Greedy selection: sort candidates by min key and take the longest
    /// consecutive run that fits the byte budget. Consecutive runs are
    /// where the key-range overlap (and so the dedup payoff) lives.
    fn select_inputs(&self) -> Vec<Arc<DiskRowSet>> {
        let budget = self.tablet.config().compaction.budget_bytes.max(1);
        let mut candidates: Vec<Arc<DiskRowSet>> = self
            .tablet
            .components()
            .rowsets
            .disk_rowsets()
            .into_iter()
            .filter(|rs| !rs.is_compacting())
            .collect();
        candidates.sort_by(|a, b| a.min_key().cmp(&b.min_key()));

        let mut best = (0usize, 0usize);
        for start in 0..candidates.len() {
            let mut bytes = 0u64;
            let mut len = 0usize;
            for rs in &candidates[start..] {
                let size = rs.approx_bytes();
                if len >= 1 && bytes + size > budget {
                    break;
                }
                bytes += size;
                len += 1;
            }
            if len > best.1 {
                best = (start, len);
            }
        }
        if best.1 < 2 {
            return Vec::new();
        }
        candidates[best.0..best.0 + best.1].to_vec()
    }
}

impl MaintenanceOp for CompactRowSetsOp {
    fn name(&self) -> &'static str {
        "compact_rowsets"
    }

    fn update_stats(&self) -> OpStats {
        let epoch = self.tablet.metrics().layout_changes.load(Ordering::Relaxed);
        if let Some((cached_epoch, stats)) = *self.cached.lock() {
            if cached_epoch == epoch {
                return stats;
            }
        }
        let inputs = self.select_inputs();
        let stats = OpStats {
            runnable: inputs.len() >= 2,
            perf_score: inputs.len() as f64,
        };
        *self.cached.lock() = Some((epoch, stats));
        stats
    }

    fn prepare(&self) -> bool {
        let inputs = self.select_inputs();
        if inputs.len() < 2 {
            return false;
        }
        let mut locked = Vec::new();
        for rs in inputs {
            if rs.try_lock_for_compaction() {
                locked.push(rs);
            } else {
                for held in &locked {
                    held.unlock_compaction();
                }
                return false;
            }
        }
        *self.selected.lock() = locked;
        true
    }

    fn perform(&self) -> TabletResult<()> {
        let inputs = std::mem::take(&mut *self.selected.lock());
        let result = merge_rowsets(&self.tablet, &inputs);
        for rs in &inputs {
            rs.unlock_compaction();
        }
        *self.cached.lock() = None;
        result
    }
}

// ── Minor delta compaction ──────────────────────────────────────────────

/// Merges a rowset's small flushed delta files into one, without
/// touching the base rows.
pub struct MinorDeltaCompactionOp {
    tablet: Arc<Tablet>,
    selected: Mutex<Option<Arc<DiskRowSet>>>,
}

impl MinorDeltaCompactionOp {
    pub fn new(tablet: Arc<Tablet>) -> Self {
        Self {
            tablet,
            selected: Mutex::new(None),
        }
    }

    fn pick_candidate(&self) -> Option<Arc<DiskRowSet>> {
        let small = self.tablet.config().compaction.small_delta_bytes;
        self.tablet
            .components()
            .rowsets
            .disk_rowsets()
            .into_iter()
            .filter(|rs| {
                !rs.is_compacting()
                    && rs.delta_file_ids().len() >= 2
                    && rs.delta_bytes() <= small
            })
            .max_by_key(|rs| rs.delta_file_ids().len())
    }
}

impl MaintenanceOp for MinorDeltaCompactionOp {
    fn name(&self) -> &'static str {
        "minor_delta_compaction"
    }

    fn update_stats(&self) -> OpStats {
        match self.pick_candidate() {
            Some(rs) => OpStats {
                runnable: true,
                perf_score: rs.delta_file_ids().len() as f64,
            },
            None => OpStats::default(),
        }
    }

    fn prepare(&self) -> bool {
        match self.pick_candidate() {
            Some(rs) if rs.try_lock_for_compaction() => {
                *self.selected.lock() = Some(rs);
                true
            }
            _ => false,
        }
    }

    fn perform(&self) -> TabletResult<()> {
        let Some(rs) = self.selected.lock().take() else {
            return Ok(());
        };
        let result = rs
            .compact_delta_files(self.tablet.data_dir())
            .and_then(|merged| {
                if merged > 0 {
                    tracing::debug!(
                        "rowset {} minor-compacted {} delta files",
                        rs.id(),
                        merged
                    );
                    self.tablet.persist_metadata()?;
                }
                Ok(())
            });
        rs.unlock_compaction();
        result
    }
}

// ── Major delta compaction ──────────────────────────────────────────────

/// Rewrites one delta-heavy rowset, folding history no registered
/// reader can still see into the base rows. A single-input rowset merge
/// under the covers.
pub struct MajorDeltaCompactionOp {
    tablet: Arc<Tablet>,
    selected: Mutex<Option<Arc<DiskRowSet>>>,
}

impl MajorDeltaCompactionOp {
    pub fn new(tablet: Arc<Tablet>) -> Self {
        Self {
            tablet,
            selected: Mutex::new(None),
        }
    }

    fn pick_candidate(&self) -> Option<Arc<DiskRowSet>> {
        let small = self.tablet.config().compaction.small_delta_bytes;
        self.tablet
            .components()
            .rowsets
            .disk_rowsets()
            .into_iter()
            .filter(|rs| !rs.is_compacting() && rs.delta_bytes() > small)
            .max_by_key(|rs| rs.delta_bytes())
    }
}

impl MaintenanceOp for MajorDeltaCompactionOp {
    fn name(&self) -> &'static str {
        "major_delta_compaction"
    }

    fn update_stats(&self) -> OpStats {
        let small = self.tablet.config().compaction.small_delta_bytes.max(1);
        match self.pick_candidate() {
            Some(rs) => OpStats {
                runnable: true,
                perf_score: rs.delta_bytes() as f64 / small as f64,
            },
            None => OpStats::default(),
        }
    }

    fn prepare(&self) -> bool {
        match self.pick_candidate() {
            Some(rs) if rs.try_lock_for_compaction() => {
                *self.selected.lock() = Some(rs);
                true
            }
            _ => false,
        }
    }

    fn perform(&self) -> TabletResult<()> {
        let Some(rs) = self.selected.lock().take() else {
            return Ok(());
        };
        let result = merge_rowsets(&self.tablet, std::slice::from_ref(&rs));
        rs.unlock_compaction();
        result
    }
}

// ── Merge machinery ─────────────────────────────────────────────────────

/// Rewrite `inputs` (already compaction-locked by the caller) into a
/// replacement rowset set.
///
/// Phase one merges every version at or below a safe-time snapshot.
/// History at or below the reader horizon collapses into a single base
/// version; keys that are dead and invisible to every registered reader
/// are dropped outright. A [`DuplicatingRowSet`] stands in for the
/// inputs while this runs, so concurrent mutations keep landing in the
/// old delta stores and, once the output is installed, the new ones.
/// Phase two re-applies mutations newer than the snapshot; delta stores
/// dedup by (key, time), so overlap with forwarded mutations is
/// harmless.
fn merge_rowsets(tablet: &Tablet, inputs: &[Arc<DiskRowSet>]) -> TabletResult<()> {
    if inputs.is_empty() {
        return Ok(());
    }
    let input_handles: Vec<RowSetHandle> = inputs
        .iter()
        .map(|rs| RowSetHandle::Disk(Arc::clone(rs)))
        .collect();
    let dup = DuplicatingRowSet::new(inputs.to_vec());
    let dup_handle = RowSetHandle::Duplicating(Arc::clone(&dup));
    {
        let handle = dup_handle.clone();
        tablet.update_tree(|tree| tree.replacing(&input_handles, vec![handle]));
    }

    let snapshot_ht = tablet.mvcc().safe_time();
    let horizon = tablet
        .readers()
        .oldest_reader()
        .map(|r| r.decremented())
        .unwrap_or(snapshot_ht)
        .min(snapshot_ht);
    let all = MvccSnapshot::all_committed();

    let mut histories: BTreeMap<Vec<u8>, Vec<(HybridTime, RowChange)>> = BTreeMap::new();
    for rs in inputs {
        for (key, ht, change) in rs.export_history() {
            if ht <= snapshot_ht {
                histories.entry(key).or_default().push((ht, change));
            }
        }
    }
    for history in histories.values_mut() {
        history.sort_by_key(|(ht, _)| *ht);
        history.dedup_by(|a, b| a.0 == b.0);
    }

    let mut writer = RollingDiskRowSetWriter::new(
        tablet.data_dir(),
        tablet.next_rowset_id(),
        tablet.config().flush.rolling_segment_bytes,
    );
    let mut carried: Vec<(Vec<u8>, HybridTime, RowChange)> = Vec::new();
    for (key, history) in histories {
        let split = history.partition_point(|(ht, _)| *ht <= horizon);
        let (below, above) = history.split_at(split);
        match materialize(below.iter().map(|(ht, c)| (ht, c)), &all) {
            Some(value) => {
                // Everything a reader could still distinguish starts at
                // the newest pre-horizon version.
                let base_ht = below[below.len() - 1].0;
                writer.append(key.clone(), base_ht, value)?;
                carried.extend(above.iter().map(|(ht, c)| (key.clone(), *ht, c.clone())));
            }
            None if above.is_empty() => {
                // Dead below the horizon with nothing after: no reader
                // can see any version, so the key is garbage-collected.
                continue;
            }
            None => {
                let mut versions = above.iter();
                match versions.next() {
                    Some((ht, RowChange::Insert(value))) => {
                        writer.append(key.clone(), *ht, value.clone())?
                    }
                    Some((ht, other)) => {
                        return Err(TabletError::Corruption(format!(
                            "compaction history for key {:02x?} resumes with {:?} at {}",
                            &key[..key.len().min(16)],
                            other,
                            ht
                        )))
                    }
                    None => continue,
                }
                carried.extend(versions.map(|(ht, c)| (key.clone(), *ht, c.clone())));
            }
        }
    }
    let new_rowsets = writer.finish()?;
    for (key, ht, change) in carried {
        if let Some(out) = new_rowsets.iter().find(|rs| rs.key_in_range(&key)) {
            out.apply_delta_unchecked(&key, ht, change);
        }
    }

    // From here, mutations forwarded through the duplicating rowset land
    // in the output's delta stores as well.
    dup.install_new(new_rowsets.clone());

    for rs in inputs {
        for (key, ht, change) in rs.deltas_after(snapshot_ht) {
            if let Some(out) = new_rowsets.iter().find(|o| o.key_in_range(&key)) {
                out.apply_delta_unchecked(&key, ht, change);
            }
        }
    }
    for rs in &new_rowsets {
        rs.flush_deltas(tablet.data_dir())?;
    }

    let new_handles: Vec<RowSetHandle> = new_rowsets
        .iter()
        .map(|rs| RowSetHandle::Disk(Arc::clone(rs)))
        .collect();
    tablet.update_tree(|tree| tree.replacing(&[dup_handle], new_handles));
    drop(dup);

    // The superblock must stop referencing the inputs before their files
    // go away.
    tablet.persist_metadata()?;
    for rs in inputs {
        let _ = fs::remove_file(rs.path());
        for delta_id in rs.delta_file_ids() {
            let _ = fs::remove_file(
                tablet
                    .data_dir()
                    .join(DiskRowSet::delta_file_name(rs.id(), delta_id)),
            );
        }
    }

    tablet
        .metrics()
        .rowset_compactions
        .fetch_add(1, Ordering::Relaxed);
    tablet
        .metrics()
        .layout_changes
        .fetch_add(1, Ordering::Relaxed);
    tracing::info!(
        "tablet {} compacted {} rowsets into {}",
        tablet.tablet_id(),
        inputs.len(),
        new_rowsets.len()
    );
    Ok(())
}

// ── Scheduler ───────────────────────────────────────────────────────────

/// Owns the background worker thread. One manager per tablet; ops are
/// registered at construction based on the tablet's backend.
pub struct MaintenanceManager {
    tablet: Arc<Tablet>,
    ops: Arc<Vec<Arc<dyn MaintenanceOp>>>,
    poll: Duration,
    stop: ShutdownSignal,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl MaintenanceManager {
    pub fn new(tablet: Arc<Tablet>) -> Self {
        let mut ops: Vec<Arc<dyn MaintenanceOp>> =
            vec![Arc::new(FlushOp::new(Arc::clone(&tablet)))];
        if tablet.table_type() == TableType::LegacyRowSet {
            ops.push(Arc::new(CompactRowSetsOp::new(Arc::clone(&tablet))));
            ops.push(Arc::new(MinorDeltaCompactionOp::new(Arc::clone(&tablet))));
            ops.push(Arc::new(MajorDeltaCompactionOp::new(Arc::clone(&tablet))));
        }
        let poll = Duration::from_millis(tablet.config().compaction.poll_interval_ms);
        Self {
            tablet,
            ops: Arc::new(ops),
            poll,
            stop: ShutdownSignal::new(),
            worker: Mutex::new(None),
        }
    }

    /// Start the scheduler thread. Idempotent.
    pub fn start(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        let tablet = Arc::clone(&self.tablet);
        let ops = Arc::clone(&self.ops);
        let stop = self.stop.clone();
        let tablet_stop = tablet.shutdown_signal().clone();
        let poll = self.poll;
        *worker = Some(thread::spawn(move || {
            while !stop.wait_timeout(poll) {
                if tablet_stop.is_shutdown() {
                    break;
                }
                if tablet.state() != TabletState::Open {
                    continue;
                }
                match run_best_op(&ops) {
                    Ok(Some(name)) => tracing::debug!("maintenance op {} completed", name),
                    Ok(None) => {}
                    Err(e) => tracing::warn!("maintenance op failed: {e}"),
                }
            }
            tracing::debug!("maintenance worker for tablet {} exiting", tablet.tablet_id());
        }));
    }

    /// One scheduler pass, exposed for deterministic driving in tests
    /// and admin tooling. Returns the name of the op that ran, if any.
    pub fn run_once(&self) -> TabletResult<Option<&'static str>> {
        run_best_op(&self.ops)
    }

    /// Stop and join the worker. Safe to call more than once.
    pub fn stop(&self) {
        self.stop.shutdown();
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

impl Drop for MaintenanceManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_best_op(ops: &[Arc<dyn MaintenanceOp>]) -> TabletResult<Option<&'static str>> {
    let mut best: Option<(&Arc<dyn MaintenanceOp>, f64)> = None;
    for op in ops {
        let stats = op.update_stats();
        if !stats.runnable {
            continue;
        }
        if best.map(|(_, score)| stats.perf_score > score).unwrap_or(true) {
            best = Some((op, stats.perf_score));
        }
    }
    let Some((op, score)) = best else {
        return Ok(None);
    };
    if !op.prepare() {
        return Ok(None);
    }
    tracing::debug!("maintenance running {} (score {:.2})", op.name(), score);
    op.perform()?;
    Ok(Some(op.name()))
}
