//! Row-oriented storage backend: an in-memory sorted mutable store
//! (`MemRowSet`), immutable on-disk rowsets with delta stores
//! (`DiskRowSet`), an interval index over them (`RowSetTree`), a rolling
//! flush writer, and the transitional `DuplicatingRowSet` used mid-compaction.
//!
//! Every version carries the hybrid time it was written at; reads fold a
//! row's version history under an `MvccSnapshot`, so flush and compaction
//! are content-preserving for any registered reader.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use kestrel_common::error::{TabletError, TabletResult};
use kestrel_common::types::HybridTime;

use crate::mvcc::MvccSnapshot;

/// Magic bytes for flushed rowset base files.
pub const ROWSET_MAGIC: &[u8; 4] = b"KRS1";
/// Magic bytes for flushed delta files.
pub const DELTA_MAGIC: &[u8; 4] = b"KDL1";
/// File format version for both families.
pub const ROWSET_FORMAT_VERSION: u32 = 1;

/// One change to a row at one hybrid time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowChange {
    Insert(Vec<u8>),
    Update(Vec<u8>),
    Delete,
}

/// Fold a time-ordered, snapshot-filtered version history into the row's
/// visible value. `None` means the row does not exist at the snapshot.
pub(crate) fn materialize<'a>(
    versions: impl Iterator<Item = (&'a HybridTime, &'a RowChange)>,
    snap: &MvccSnapshot,
) -> Option<Vec<u8>> {
    let mut current: Option<&[u8]> = None;
    for (ht, change) in versions {
        if !snap.is_committed(*ht) {
            continue;
        }
        match change {
            RowChange::Insert(v) | RowChange::Update(v) => current = Some(v),
            RowChange::Delete => current = None,
        }
    }
    current.map(|v| v.to_vec())
}

// ── MemRowSet ───────────────────────────────────────────────────────────

/// Sorted mutable in-memory store. New inserts land here; mutations target
/// whichever store holds the row's base version.
pub struct MemRowSet {
    id: u64,
    rows: RwLock<std::collections::BTreeMap<Vec<u8>, Vec<(HybridTime, RowChange)>>>,
    approx_bytes: AtomicU64,
}

impl MemRowSet {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            rows: RwLock::new(std::collections::BTreeMap::new()),
            approx_bytes: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Insert a new row. `AlreadyPresent` if a live version exists in this
    /// store (the caller has already consulted the disk rowsets).
    pub fn insert(&self, key: &[u8], value: Vec<u8>, ht: HybridTime) -> TabletResult<()> {
        let mut rows = self.rows.write();
        let history = rows.entry(key.to_vec()).or_default();
        if Self::is_live_history(history) {
            return Err(TabletError::AlreadyPresent(format!(
                "key {:02x?} already present in memrowset {}",
                &key[..key.len().min(16)],
                self.id
            )));
        }
        self.approx_bytes
            .fetch_add((key.len() + value.len() + 16) as u64, Ordering::Relaxed);
        history.push((ht, RowChange::Insert(value)));
        Ok(())
    }

    /// Apply an update or delete to a row whose base version lives here.
    pub fn mutate(&self, key: &[u8], change: RowChange, ht: HybridTime) -> TabletResult<()> {
        let mut rows = self.rows.write();
        match rows.get_mut(key) {
            Some(history) if Self::is_live_history(history) => {
                self.approx_bytes.fetch_add(
                    (key.len() + change_size(&change) + 16) as u64,
                    Ordering::Relaxed,
                );
                history.push((ht, change));
                Ok(())
            }
            _ => Err(TabletError::NotFound(format!(
                "no live row for key {:02x?} in memrowset {}",
                &key[..key.len().min(16)],
                self.id
            ))),
        }
    }

    /// Whether the key has a live (non-deleted) version, ignoring snapshots.
    /// Writers hold the row lock, so this is stable for the caller.
    pub fn is_live(&self, key: &[u8]) -> bool {
        self.rows
            .read()
            .get(key)
            .map(|h| Self::is_live_history(h))
            .unwrap_or(false)
    }

    fn is_live_history(history: &[(HybridTime, RowChange)]) -> bool {
        !matches!(history.last(), None | Some((_, RowChange::Delete)))
    }

    pub fn get(&self, key: &[u8], snap: &MvccSnapshot) -> Option<Vec<u8>> {
        let rows = self.rows.read();
        let history = rows.get(key)?;
        materialize(history.iter().map(|(h, c)| (h, c)), snap)
    }

    /// All rows visible at `snap`, in key order.
    pub fn iterate(&self, snap: &MvccSnapshot) -> Vec<(Vec<u8>, Vec<u8>)> {
        let rows = self.rows.read();
        rows.iter()
            .filter_map(|(k, history)| {
                materialize(history.iter().map(|(h, c)| (h, c)), snap).map(|v| (k.clone(), v))
            })
            .collect()
    }

    /// Full version dump for flushing: (key, ht, change) in key then time
    /// order. The caller has already drained in-flight operations.
    pub fn drain_versions(&self) -> Vec<(Vec<u8>, HybridTime, RowChange)> {
        let rows = self.rows.read();
        let mut out = Vec::new();
        for (key, history) in rows.iter() {
            for (ht, change) in history {
                out.push((key.clone(), *ht, change.clone()));
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    pub fn entry_count(&self) -> usize {
        self.rows.read().len()
    }

    pub fn approx_bytes(&self) -> u64 {
        self.approx_bytes.load(Ordering::Relaxed)
    }
}

fn change_size(change: &RowChange) -> usize {
    match change {
        RowChange::Insert(v) | RowChange::Update(v) => v.len(),
        RowChange::Delete => 0,
    }
}

// ── Delta stores ────────────────────────────────────────────────────────

/// Mutable delta store attached to one disk rowset. Strictly time-ordered
/// within the rowset: the (key, ht) map key makes re-application of the
/// same update idempotent.
pub struct DeltaMemStore {
    entries: RwLock<std::collections::BTreeMap<(Vec<u8>, HybridTime), RowChange>>,
    approx_bytes: AtomicU64,
}

impl DeltaMemStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(std::collections::BTreeMap::new()),
            approx_bytes: AtomicU64::new(0),
        }
    }

    pub fn add(&self, key: &[u8], ht: HybridTime, change: RowChange) {
        self.approx_bytes
            .fetch_add((key.len() + change_size(&change) + 16) as u64, Ordering::Relaxed);
        self.entries
            .write()
            .insert((key.to_vec(), ht), change);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn approx_bytes(&self) -> u64 {
        self.approx_bytes.load(Ordering::Relaxed)
    }

    pub fn snapshot_entries(&self) -> Vec<(Vec<u8>, HybridTime, RowChange)> {
        self.entries
            .read()
            .iter()
            .map(|((k, ht), c)| (k.clone(), *ht, c.clone()))
            .collect()
    }

    fn fold_for_key(
        &self,
        key: &[u8],
        snap: &MvccSnapshot,
        out: &mut Vec<(HybridTime, RowChange)>,
    ) {
        let entries = self.entries.read();
        let range = entries.range((key.to_vec(), HybridTime::MIN)..=(key.to_vec(), HybridTime::MAX));
        for ((_, ht), change) in range {
            if snap.is_committed(*ht) {
                out.push((*ht, change.clone()));
            }
        }
    }
}

impl Default for DeltaMemStore {
    fn default() -> Self {
        Self::new()
    }
}

/// An immutable flushed delta store. Entries stay loaded after open; the
/// file is the durable copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaFile {
    pub id: u64,
    pub entries: Vec<(Vec<u8>, HybridTime, RowChange)>,
}

impl DeltaFile {
    pub fn approx_bytes(&self) -> u64 {
        self.entries
            .iter()
            .map(|(k, _, c)| (k.len() + change_size(c) + 16) as u64)
            .sum()
    }
}

// ── On-disk framing ─────────────────────────────────────────────────────

pub(crate) fn write_framed<T: Serialize>(path: &Path, magic: &[u8; 4], payload: &T) -> TabletResult<()> {
    let data =
        bincode::serialize(payload).map_err(|e| TabletError::Serialization(e.to_string()))?;
    let mut buf = Vec::with_capacity(data.len() + 16);
    buf.extend_from_slice(magic);
    buf.extend_from_slice(&ROWSET_FORMAT_VERSION.to_le_bytes());
    buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
    buf.extend_from_slice(&crc32fast::hash(&data).to_le_bytes());
    buf.extend_from_slice(&data);
    // Atomic write: tmp file then rename.
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, &buf)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub(crate) fn read_framed<T: for<'de> Deserialize<'de>>(path: &Path, magic: &[u8; 4]) -> TabletResult<T> {
    let raw = fs::read(path)?;
    if raw.len() < 16 || &raw[0..4] != magic {
        return Err(TabletError::Corruption(format!(
            "bad magic in {}",
            path.display()
        )));
    }
    let len = u32::from_le_bytes(raw[8..12].try_into().unwrap()) as usize;
    let crc = u32::from_le_bytes(raw[12..16].try_into().unwrap());
    if raw.len() < 16 + len {
        return Err(TabletError::Corruption(format!(
            "truncated file {}",
            path.display()
        )));
    }
    let data = &raw[16..16 + len];
    if crc32fast::hash(data) != crc {
        return Err(TabletError::Corruption(format!(
            "checksum mismatch in {}",
            path.display()
        )));
    }
    bincode::deserialize(data).map_err(|e| TabletError::Serialization(e.to_string()))
}

// ── DiskRowSet ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DiskRowSetFile {
    id: u64,
    /// Sorted by key; each base row keeps the hybrid time it was written.
    rows: Vec<(Vec<u8>, HybridTime, Vec<u8>)>,
}

/// Immutable on-disk base rows plus update (delta) stores.
pub struct DiskRowSet {
    id: u64,
    path: PathBuf,
    rows: Vec<(Vec<u8>, HybridTime, Vec<u8>)>,
    dms: RwLock<Arc<DeltaMemStore>>,
    delta_files: RwLock<Vec<Arc<DeltaFile>>>,
    next_delta_id: AtomicU64,
    /// Forbidden while this rowset is an input of a duplicating compaction:
    /// independent delta flushing would break strict delta time-ordering.
    delta_flush_allowed: AtomicBool,
    /// Per-rowset compaction lock so two maintenance tasks never select
    /// the same rowset.
    compacting: AtomicBool,
}

impl std::fmt::Debug for DiskRowSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskRowSet")
            .field("id", &self.id)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl DiskRowSet {
    /// Write a new rowset file and open it.
    pub fn create(
        dir: &Path,
        id: u64,
        rows: Vec<(Vec<u8>, HybridTime, Vec<u8>)>,
    ) -> TabletResult<Arc<Self>> {
        let path = dir.join(Self::file_name(id));
        write_framed(&path, ROWSET_MAGIC, &DiskRowSetFile { id, rows: rows.clone() })?;
        Ok(Arc::new(Self {
            id,
            path,
            rows,
            dms: RwLock::new(Arc::new(DeltaMemStore::new())),
            delta_files: RwLock::new(Vec::new()),
            next_delta_id: AtomicU64::new(0),
            delta_flush_allowed: AtomicBool::new(true),
            compacting: AtomicBool::new(false),
        }))
    }

    /// Open an existing rowset file, loading any flushed delta files whose
    /// ids are recorded in the tablet metadata.
    pub fn open(dir: &Path, id: u64, delta_ids: &[u64]) -> TabletResult<Arc<Self>> {
        let path = dir.join(Self::file_name(id));
        let file: DiskRowSetFile = read_framed(&path, ROWSET_MAGIC)?;
        if file.id != id {
            return Err(TabletError::Corruption(format!(
                "rowset file {} claims id {}, expected {}",
                path.display(),
                file.id,
                id
            )));
        }
        let mut delta_files = Vec::with_capacity(delta_ids.len());
        let mut max_delta = 0u64;
        for &delta_id in delta_ids {
            let dpath = dir.join(Self::delta_file_name(id, delta_id));
            let df: DeltaFile = read_framed(&dpath, DELTA_MAGIC)?;
            max_delta = max_delta.max(delta_id + 1);
            delta_files.push(Arc::new(df));
        }
        Ok(Arc::new(Self {
            id,
            path,
            rows: file.rows,
            dms: RwLock::new(Arc::new(DeltaMemStore::new())),
            delta_files: RwLock::new(delta_files),
            next_delta_id: AtomicU64::new(max_delta),
            delta_flush_allowed: AtomicBool::new(true),
            compacting: AtomicBool::new(false),
        }))
    }

    pub fn file_name(id: u64) -> String {
        format!("rowset_{:06}.krs", id)
    }

    pub fn delta_file_name(rowset_id: u64, delta_id: u64) -> String {
        format!("rowset_{:06}_delta_{:06}.kdl", rowset_id, delta_id)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn min_key(&self) -> Option<&[u8]> {
        self.rows.first().map(|(k, _, _)| k.as_slice())
    }

    pub fn max_key(&self) -> Option<&[u8]> {
        self.rows.last().map(|(k, _, _)| k.as_slice())
    }

    pub fn key_in_range(&self, key: &[u8]) -> bool {
        match (self.min_key(), self.max_key()) {
            (Some(min), Some(max)) => key >= min && key <= max,
            _ => false,
        }
    }

    fn base_entry(&self, key: &[u8]) -> Option<&(Vec<u8>, HybridTime, Vec<u8>)> {
        self.rows
            .binary_search_by(|(k, _, _)| k.as_slice().cmp(key))
            .ok()
            .map(|idx| &self.rows[idx])
    }

    pub fn has_base_row(&self, key: &[u8]) -> bool {
        self.base_entry(key).is_some()
    }

    /// Snapshot-filtered version history for one key: base row as an
    /// insert, then deltas in strict store order (files, then mem store).
    fn history_for_key(&self, key: &[u8], snap: &MvccSnapshot) -> Vec<(HybridTime, RowChange)> {
        let mut history = Vec::new();
        if let Some((_, ht, value)) = self.base_entry(key) {
            if snap.is_committed(*ht) {
                history.push((*ht, RowChange::Insert(value.clone())));
            }
        }
        for df in self.delta_files.read().iter() {
            for (k, ht, change) in &df.entries {
                if k.as_slice() == key && snap.is_committed(*ht) {
                    history.push((*ht, change.clone()));
                }
            }
        }
        self.dms.read().fold_for_key(key, snap, &mut history);
        history.sort_by_key(|(ht, _)| *ht);
        history
    }

    pub fn get(&self, key: &[u8], snap: &MvccSnapshot) -> Option<Vec<u8>> {
        let history = self.history_for_key(key, snap);
        materialize(history.iter().map(|(h, c)| (h, c)), snap)
    }

    pub fn is_live(&self, key: &[u8]) -> bool {
        let all = MvccSnapshot::all_committed();
        let history = self.history_for_key(key, &all);
        materialize(history.iter().map(|(h, c)| (h, c)), &all).is_some()
    }

    /// Apply an update or delete to a row whose base version lives here.
    pub fn mutate(&self, key: &[u8], change: RowChange, ht: HybridTime) -> TabletResult<()> {
        if !self.has_base_row(key) || !self.is_live(key) {
            return Err(TabletError::NotFound(format!(
                "no live row for key {:02x?} in rowset {}",
                &key[..key.len().min(16)],
                self.id
            )));
        }
        self.dms.read().add(key, ht, change);
        Ok(())
    }

    /// Flush-time history carry-over: later versions of a freshly written
    /// base row land in the delta store without the live-row check, since
    /// the history may legitimately pass through a delete.
    pub(crate) fn apply_delta_unchecked(&self, key: &[u8], ht: HybridTime, change: RowChange) {
        self.dms.read().add(key, ht, change);
    }

    pub fn iterate(&self, snap: &MvccSnapshot) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut out = Vec::new();
        for (key, _, _) in &self.rows {
            if let Some(v) = self.get(key, snap) {
                out.push((key.clone(), v));
            }
        }
        out
    }

    /// Flush the mutable delta store to an immutable delta file, swapping
    /// in a fresh empty store. Returns the new delta file id, or None if
    /// there was nothing to flush.
    pub fn flush_deltas(&self, dir: &Path) -> TabletResult<Option<u64>> {
        if !self.delta_flush_allowed.load(Ordering::SeqCst) {
            return Err(TabletError::illegal_state(format!(
                "rowset {} is a compaction input; delta flush forbidden",
                self.id
            )));
        }
        let old = {
            let mut dms = self.dms.write();
            if dms.is_empty() {
                return Ok(None);
            }
            std::mem::replace(&mut *dms, Arc::new(DeltaMemStore::new()))
        };
        let delta_id = self.next_delta_id.fetch_add(1, Ordering::SeqCst);
        let df = DeltaFile {
            id: delta_id,
            entries: old.snapshot_entries(),
        };
        let path = dir.join(Self::delta_file_name(self.id, delta_id));
        write_framed(&path, DELTA_MAGIC, &df)?;
        self.delta_files.write().push(Arc::new(df));
        tracing::debug!("rowset {} flushed delta store as delta {}", self.id, delta_id);
        Ok(Some(delta_id))
    }

    /// Merge small flushed delta files into one (minor delta compaction).
    /// Does not touch the base rows.
    pub fn compact_delta_files(&self, dir: &Path) -> TabletResult<usize> {
        let mut files = self.delta_files.write();
        if files.len() < 2 {
            return Ok(0);
        }
        let merged_count = files.len();
        let mut entries: Vec<(Vec<u8>, HybridTime, RowChange)> = Vec::new();
        for df in files.iter() {
            entries.extend(df.entries.iter().cloned());
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        let delta_id = self.next_delta_id.fetch_add(1, Ordering::SeqCst);
        let merged = DeltaFile { id: delta_id, entries };
        let path = dir.join(Self::delta_file_name(self.id, delta_id));
        write_framed(&path, DELTA_MAGIC, &merged)?;
        let old_paths: Vec<PathBuf> = files
            .iter()
            .map(|df| dir.join(Self::delta_file_name(self.id, df.id)))
            .collect();
        *files = vec![Arc::new(merged)];
        drop(files);
        for p in old_paths {
            let _ = fs::remove_file(p);
        }
        Ok(merged_count)
    }

    pub fn delta_file_ids(&self) -> Vec<u64> {
        self.delta_files.read().iter().map(|df| df.id).collect()
    }

    pub fn delta_store_count(&self) -> usize {
        let files = self.delta_files.read().len();
        files + usize::from(!self.dms.read().is_empty())
    }

    pub fn delta_bytes(&self) -> u64 {
        let file_bytes: u64 = self.delta_files.read().iter().map(|df| df.approx_bytes()).sum();
        file_bytes + self.dms.read().approx_bytes()
    }

    pub fn approx_bytes(&self) -> u64 {
        let base: u64 = self
            .rows
            .iter()
            .map(|(k, _, v)| (k.len() + v.len() + 16) as u64)
            .sum();
        base + self.delta_bytes()
    }

    /// Full unfiltered version history, in key then time order. Compaction
    /// merges these across its inputs.
    pub(crate) fn export_history(&self) -> Vec<(Vec<u8>, HybridTime, RowChange)> {
        let mut out: Vec<(Vec<u8>, HybridTime, RowChange)> = self
            .rows
            .iter()
            .map(|(k, ht, v)| (k.clone(), *ht, RowChange::Insert(v.clone())))
            .collect();
        for df in self.delta_files.read().iter() {
            out.extend(df.entries.iter().cloned());
        }
        out.extend(self.dms.read().snapshot_entries());
        out.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        out.dedup_by(|a, b| a.0 == b.0 && a.1 == b.1);
        out
    }

    /// Deltas newer than `after` across all delta stores, for the
    /// phase-two re-application pass of a rowset compaction.
    pub fn deltas_after(&self, after: HybridTime) -> Vec<(Vec<u8>, HybridTime, RowChange)> {
        let mut out = Vec::new();
        for df in self.delta_files.read().iter() {
            out.extend(df.entries.iter().filter(|(_, ht, _)| *ht > after).cloned());
        }
        out.extend(
            self.dms
                .read()
                .snapshot_entries()
                .into_iter()
                .filter(|(_, ht, _)| *ht > after),
        );
        out.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        out
    }

    pub fn set_delta_flush_allowed(&self, allowed: bool) {
        self.delta_flush_allowed.store(allowed, Ordering::SeqCst);
    }

    /// Take this rowset's compaction lock. Returns false if another
    /// maintenance task already holds it.
    pub fn try_lock_for_compaction(&self) -> bool {
        self.compacting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn unlock_compaction(&self) {
        self.compacting.store(false, Ordering::SeqCst);
    }

    pub fn is_compacting(&self) -> bool {
        self.compacting.load(Ordering::SeqCst)
    }
}

// ── DuplicatingRowSet ───────────────────────────────────────────────────

/// Transitional structure installed for the duration of a rowset
/// compaction. Reads are served from the old rowsets; mutations are
/// forwarded to the old rowsets and, once the compaction output is
/// installed, to the new ones as well, so in-flight readers and writers
/// never block or see torn state.
pub struct DuplicatingRowSet {
    old: Vec<Arc<DiskRowSet>>,
    new: RwLock<Vec<Arc<DiskRowSet>>>,
}

impl DuplicatingRowSet {
    pub fn new(old: Vec<Arc<DiskRowSet>>) -> Arc<Self> {
        for rs in &old {
            rs.set_delta_flush_allowed(false);
        }
        Arc::new(Self {
            old,
            new: RwLock::new(Vec::new()),
        })
    }

    pub fn install_new(&self, new: Vec<Arc<DiskRowSet>>) {
        *self.new.write() = new;
    }

    pub fn old_rowsets(&self) -> &[Arc<DiskRowSet>] {
        &self.old
    }

    pub fn new_rowsets(&self) -> Vec<Arc<DiskRowSet>> {
        self.new.read().clone()
    }

    pub fn min_key(&self) -> Option<Vec<u8>> {
        self.old.iter().filter_map(|rs| rs.min_key().map(|k| k.to_vec())).min()
    }

    pub fn max_key(&self) -> Option<Vec<u8>> {
        self.old.iter().filter_map(|rs| rs.max_key().map(|k| k.to_vec())).max()
    }

    pub fn key_in_range(&self, key: &[u8]) -> bool {
        self.old.iter().any(|rs| rs.key_in_range(key))
    }

    pub fn has_base_row(&self, key: &[u8]) -> bool {
        self.old.iter().any(|rs| rs.has_base_row(key))
    }

    pub fn is_live(&self, key: &[u8]) -> bool {
        self.old.iter().any(|rs| rs.is_live(key))
    }

    pub fn get(&self, key: &[u8], snap: &MvccSnapshot) -> Option<Vec<u8>> {
        self.old.iter().find_map(|rs| rs.get(key, snap))
    }

    /// Forward the mutation to every store holding the row. A `NotFound`
    /// from the new side only means the compaction output is not installed
    /// yet; the phase-two pass will carry the update over.
    pub fn mutate(&self, key: &[u8], change: RowChange, ht: HybridTime) -> TabletResult<()> {
        let mut found = false;
        for rs in &self.old {
            match rs.mutate(key, change.clone(), ht) {
                Ok(()) => found = true,
                Err(TabletError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        for rs in self.new.read().iter() {
            match rs.mutate(key, change.clone(), ht) {
                Ok(()) => {}
                Err(TabletError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        if found {
            Ok(())
        } else {
            Err(TabletError::NotFound(format!(
                "no live row for key {:02x?} in duplicating rowset",
                &key[..key.len().min(16)]
            )))
        }
    }

    pub fn iterate(&self, snap: &MvccSnapshot) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut out = Vec::new();
        for rs in &self.old {
            out.extend(rs.iterate(snap));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out.dedup_by(|a, b| a.0 == b.0);
        out
    }

    pub fn approx_bytes(&self) -> u64 {
        self.old.iter().map(|rs| rs.approx_bytes()).sum()
    }
}

impl Drop for DuplicatingRowSet {
    fn drop(&mut self) {
        for rs in &self.old {
            rs.set_delta_flush_allowed(true);
        }
    }
}

// ── RowSetTree ──────────────────────────────────────────────────────────

/// Tagged handle for one entry in the tree.
#[derive(Clone)]
pub enum RowSetHandle {
    Disk(Arc<DiskRowSet>),
    Duplicating(Arc<DuplicatingRowSet>),
}

impl RowSetHandle {
    pub fn key_in_range(&self, key: &[u8]) -> bool {
        match self {
            RowSetHandle::Disk(rs) => rs.key_in_range(key),
            RowSetHandle::Duplicating(rs) => rs.key_in_range(key),
        }
    }

    pub fn has_base_row(&self, key: &[u8]) -> bool {
        match self {
            RowSetHandle::Disk(rs) => rs.has_base_row(key),
            RowSetHandle::Duplicating(rs) => rs.has_base_row(key),
        }
    }

    pub fn is_live(&self, key: &[u8]) -> bool {
        match self {
            RowSetHandle::Disk(rs) => rs.is_live(key),
            RowSetHandle::Duplicating(rs) => rs.is_live(key),
        }
    }

    pub fn get(&self, key: &[u8], snap: &MvccSnapshot) -> Option<Vec<u8>> {
        match self {
            RowSetHandle::Disk(rs) => rs.get(key, snap),
            RowSetHandle::Duplicating(rs) => rs.get(key, snap),
        }
    }

    pub fn mutate(&self, key: &[u8], change: RowChange, ht: HybridTime) -> TabletResult<()> {
        match self {
            RowSetHandle::Disk(rs) => rs.mutate(key, change, ht),
            RowSetHandle::Duplicating(rs) => rs.mutate(key, change, ht),
        }
    }

    pub fn iterate(&self, snap: &MvccSnapshot) -> Vec<(Vec<u8>, Vec<u8>)> {
        match self {
            RowSetHandle::Disk(rs) => rs.iterate(snap),
            RowSetHandle::Duplicating(rs) => rs.iterate(snap),
        }
    }

    fn min_key(&self) -> Option<Vec<u8>> {
        match self {
            RowSetHandle::Disk(rs) => rs.min_key().map(|k| k.to_vec()),
            RowSetHandle::Duplicating(rs) => rs.min_key(),
        }
    }
}

/// Immutable index over the on-disk rowsets. Replaced wholesale by an
/// atomic components swap; never mutated in place.
pub struct RowSetTree {
    entries: Vec<RowSetHandle>,
}

impl RowSetTree {
    pub fn empty() -> Arc<Self> {
        Arc::new(Self { entries: Vec::new() })
    }

    pub fn new(mut entries: Vec<RowSetHandle>) -> Arc<Self> {
        entries.sort_by(|a, b| a.min_key().cmp(&b.min_key()));
        Arc::new(Self { entries })
    }

    pub fn entries(&self) -> &[RowSetHandle] {
        &self.entries
    }

    /// Rowsets whose key interval covers `key`. Intervals may overlap, so
    /// this can return more than one handle.
    pub fn rowsets_for_key(&self, key: &[u8]) -> Vec<&RowSetHandle> {
        self.entries.iter().filter(|h| h.key_in_range(key)).collect()
    }

    pub fn disk_rowsets(&self) -> Vec<Arc<DiskRowSet>> {
        self.entries
            .iter()
            .filter_map(|h| match h {
                RowSetHandle::Disk(rs) => Some(Arc::clone(rs)),
                RowSetHandle::Duplicating(_) => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// New tree with `remove` (matched by pointer identity) replaced by
    /// `insert`.
    pub fn replacing(
        &self,
        remove: &[RowSetHandle],
        insert: Vec<RowSetHandle>,
    ) -> Arc<Self> {
        let removed: Vec<*const ()> = remove.iter().map(handle_ptr).collect();
        let mut entries: Vec<RowSetHandle> = self
            .entries
            .iter()
            .filter(|h| !removed.contains(&handle_ptr(h)))
            .cloned()
            .collect();
        entries.extend(insert);
        Self::new(entries)
    }
}

fn handle_ptr(h: &RowSetHandle) -> *const () {
    match h {
        RowSetHandle::Disk(rs) => Arc::as_ptr(rs) as *const (),
        RowSetHandle::Duplicating(rs) => Arc::as_ptr(rs) as *const (),
    }
}

// ── Rolling writer ──────────────────────────────────────────────────────

/// Writes flush/compaction output, rolling to a new disk rowset whenever
/// the current one exceeds the segment size cap.
pub struct RollingDiskRowSetWriter<'a> {
    dir: &'a Path,
    next_id: &'a AtomicU64,
    cap_bytes: u64,
    current: Vec<(Vec<u8>, HybridTime, Vec<u8>)>,
    current_bytes: u64,
    finished: Vec<Arc<DiskRowSet>>,
}

impl<'a> RollingDiskRowSetWriter<'a> {
    pub fn new(dir: &'a Path, next_id: &'a AtomicU64, cap_bytes: u64) -> Self {
        Self {
            dir,
            next_id,
            cap_bytes: cap_bytes.max(1),
            current: Vec::new(),
            current_bytes: 0,
            finished: Vec::new(),
        }
    }

    /// Append one base row. Keys must arrive in sorted order.
    pub fn append(&mut self, key: Vec<u8>, ht: HybridTime, value: Vec<u8>) -> TabletResult<()> {
        self.current_bytes += (key.len() + value.len() + 16) as u64;
        self.current.push((key, ht, value));
        if self.current_bytes >= self.cap_bytes {
            self.roll()?;
        }
        Ok(())
    }

    fn roll(&mut self) -> TabletResult<()> {
        if self.current.is_empty() {
            return Ok(());
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let rows = std::mem::take(&mut self.current);
        self.current_bytes = 0;
        let rs = DiskRowSet::create(self.dir, id, rows)?;
        tracing::debug!("rolled disk rowset {} ({} rows)", id, rs.rows.len());
        self.finished.push(rs);
        Ok(())
    }

    pub fn finish(mut self) -> TabletResult<Vec<Arc<DiskRowSet>>> {
        self.roll()?;
        Ok(self.finished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ht(n: u64) -> HybridTime {
        HybridTime::new(n, 0)
    }

    fn all() -> MvccSnapshot {
        MvccSnapshot::all_committed()
    }

    #[test]
    fn test_mrs_insert_get_mutate() {
        let mrs = MemRowSet::new(0);
        mrs.insert(b"a", b"v1".to_vec(), ht(10)).unwrap();
        assert_eq!(mrs.get(b"a", &all()), Some(b"v1".to_vec()));

        mrs.mutate(b"a", RowChange::Update(b"v2".to_vec()), ht(20)).unwrap();
        assert_eq!(mrs.get(b"a", &all()), Some(b"v2".to_vec()));

        // Snapshot before the update sees the original value.
        let snap = MvccSnapshot::all_committed_before(ht(15));
        assert_eq!(mrs.get(b"a", &snap), Some(b"v1".to_vec()));
    }

    #[test]
    fn test_mrs_duplicate_insert() {
        let mrs = MemRowSet::new(0);
        mrs.insert(b"a", b"v1".to_vec(), ht(10)).unwrap();
        let err = mrs.insert(b"a", b"v2".to_vec(), ht(11)).unwrap_err();
        assert!(matches!(err, TabletError::AlreadyPresent(_)));
    }

    #[test]
    fn test_mrs_reinsert_after_delete() {
        let mrs = MemRowSet::new(0);
        mrs.insert(b"a", b"v1".to_vec(), ht(10)).unwrap();
        mrs.mutate(b"a", RowChange::Delete, ht(20)).unwrap();
        assert_eq!(mrs.get(b"a", &all()), None);
        mrs.insert(b"a", b"v2".to_vec(), ht(30)).unwrap();
        assert_eq!(mrs.get(b"a", &all()), Some(b"v2".to_vec()));
    }

    #[test]
    fn test_mrs_mutate_absent_not_found() {
        let mrs = MemRowSet::new(0);
        let err = mrs
            .mutate(b"missing", RowChange::Update(b"x".to_vec()), ht(5))
            .unwrap_err();
        assert!(matches!(err, TabletError::NotFound(_)));
    }

    #[test]
    fn test_disk_rowset_round_trip() {
        let dir = TempDir::new().unwrap();
        let rows = vec![
            (b"a".to_vec(), ht(1), b"va".to_vec()),
            (b"b".to_vec(), ht(2), b"vb".to_vec()),
        ];
        let rs = DiskRowSet::create(dir.path(), 0, rows).unwrap();
        rs.mutate(b"a", RowChange::Update(b"va2".to_vec()), ht(10)).unwrap();
        rs.flush_deltas(dir.path()).unwrap();

        let reopened = DiskRowSet::open(dir.path(), 0, &rs.delta_file_ids()).unwrap();
        assert_eq!(reopened.get(b"a", &all()), Some(b"va2".to_vec()));
        assert_eq!(reopened.get(b"b", &all()), Some(b"vb".to_vec()));
        assert_eq!(reopened.get(b"c", &all()), None);
    }

    #[test]
    fn test_disk_rowset_snapshot_reads() {
        let dir = TempDir::new().unwrap();
        let rs = DiskRowSet::create(
            dir.path(),
            0,
            vec![(b"k".to_vec(), ht(100), b"v1".to_vec())],
        )
        .unwrap();
        rs.mutate(b"k", RowChange::Update(b"v2".to_vec()), ht(200)).unwrap();

        let before_insert = MvccSnapshot::all_committed_before(ht(50));
        let between = MvccSnapshot::all_committed_before(ht(150));
        assert_eq!(rs.get(b"k", &before_insert), None);
        assert_eq!(rs.get(b"k", &between), Some(b"v1".to_vec()));
        assert_eq!(rs.get(b"k", &all()), Some(b"v2".to_vec()));
    }

    #[test]
    fn test_delta_flush_forbidden_under_duplication() {
        let dir = TempDir::new().unwrap();
        let rs = DiskRowSet::create(
            dir.path(),
            0,
            vec![(b"k".to_vec(), ht(1), b"v".to_vec())],
        )
        .unwrap();
        let dup = DuplicatingRowSet::new(vec![Arc::clone(&rs)]);
        rs.mutate(b"k", RowChange::Update(b"v2".to_vec()), ht(5)).unwrap();
        assert!(rs.flush_deltas(dir.path()).is_err());
        drop(dup);
        assert!(rs.flush_deltas(dir.path()).unwrap().is_some());
    }

    #[test]
    fn test_minor_delta_compaction_merges_files() {
        let dir = TempDir::new().unwrap();
        let rs = DiskRowSet::create(
            dir.path(),
            0,
            vec![(b"k".to_vec(), ht(1), b"v0".to_vec())],
        )
        .unwrap();
        for i in 0..3u64 {
            rs.mutate(b"k", RowChange::Update(format!("v{}", i + 1).into_bytes()), ht(10 + i))
                .unwrap();
            rs.flush_deltas(dir.path()).unwrap();
        }
        assert_eq!(rs.delta_file_ids().len(), 3);
        let merged = rs.compact_delta_files(dir.path()).unwrap();
        assert_eq!(merged, 3);
        assert_eq!(rs.delta_file_ids().len(), 1);
        assert_eq!(rs.get(b"k", &all()), Some(b"v3".to_vec()));
    }

    #[test]
    fn test_rolling_writer_caps_segments() {
        let dir = TempDir::new().unwrap();
        let next_id = AtomicU64::new(0);
        let mut w = RollingDiskRowSetWriter::new(dir.path(), &next_id, 64);
        for i in 0..10u8 {
            w.append(vec![i; 8], ht(i as u64 + 1), vec![0u8; 32]).unwrap();
        }
        let rowsets = w.finish().unwrap();
        assert!(rowsets.len() > 1, "expected the writer to roll");
        let total: usize = rowsets.iter().map(|rs| rs.rows.len()).sum();
        assert_eq!(total, 10);
    }

    #[test]
    fn test_duplicating_rowset_forwards_to_both() {
        let dir = TempDir::new().unwrap();
        let old = DiskRowSet::create(
            dir.path(),
            0,
            vec![(b"k".to_vec(), ht(1), b"v0".to_vec())],
        )
        .unwrap();
        let new = DiskRowSet::create(
            dir.path(),
            1,
            vec![(b"k".to_vec(), ht(1), b"v0".to_vec())],
        )
        .unwrap();
        let dup = DuplicatingRowSet::new(vec![Arc::clone(&old)]);
        dup.install_new(vec![Arc::clone(&new)]);

        dup.mutate(b"k", RowChange::Update(b"v1".to_vec()), ht(10)).unwrap();
        assert_eq!(old.get(b"k", &all()), Some(b"v1".to_vec()));
        assert_eq!(new.get(b"k", &all()), Some(b"v1".to_vec()));
    }

    #[test]
    fn test_tree_replacing_swaps_atomically() {
        let dir = TempDir::new().unwrap();
        let a = DiskRowSet::create(dir.path(), 0, vec![(b"a".to_vec(), ht(1), b"1".to_vec())])
            .unwrap();
        let b = DiskRowSet::create(dir.path(), 1, vec![(b"b".to_vec(), ht(1), b"2".to_vec())])
            .unwrap();
        let tree = RowSetTree::new(vec![
            RowSetHandle::Disk(Arc::clone(&a)),
            RowSetHandle::Disk(Arc::clone(&b)),
        ]);

        let c = DiskRowSet::create(dir.path(), 2, vec![(b"a".to_vec(), ht(2), b"3".to_vec())])
            .unwrap();
        let replaced = tree.replacing(
            &[RowSetHandle::Disk(Arc::clone(&a))],
            vec![RowSetHandle::Disk(Arc::clone(&c))],
        );
        assert_eq!(replaced.len(), 2);
        assert!(replaced
            .disk_rowsets()
            .iter()
            .any(|rs| Arc::ptr_eq(rs, &c)));
        assert!(!replaced.disk_rowsets().iter().any(|rs| Arc::ptr_eq(rs, &a)));
    }

    #[test]
    fn test_corrupt_rowset_file_detected() {
        let dir = TempDir::new().unwrap();
        let rs = DiskRowSet::create(
            dir.path(),
            0,
            vec![(b"k".to_vec(), ht(1), b"v".to_vec())],
        )
        .unwrap();
        let path = rs.path().to_path_buf();
        let mut raw = fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        fs::write(&path, raw).unwrap();
        let err = DiskRowSet::open(dir.path(), 0, &[]).unwrap_err();
        assert!(matches!(err, TabletError::Corruption(_)));
    }
}
