//! Ordered byte-key storage engine for the KV backend.
//!
//! The tablet issues atomic batched writes tagged with the replication
//! index, ordered scans, and periodic checkpoint exports. Segment-level
//! compaction is the engine's own business: the tablet never orchestrates
//! it, it only observes the `flushed_index` moving forward.
//!
//! Write path: memtable → (flush) → L0 segment file, each segment
//! embedding the highest replication index it reflects.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use kestrel_common::error::{TabletError, TabletResult};

use crate::rowset::{read_framed, write_framed};

/// Magic bytes for KV segment files.
pub const KV_SEGMENT_MAGIC: &[u8; 4] = b"KSS1";

/// One atomic batch of doc-key mutations. `None` values are tombstones.
#[derive(Debug, Clone, Default)]
pub struct KvBatch {
    pub ops: Vec<(Vec<u8>, Option<Vec<u8>>)>,
}

impl KvBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, doc_key: Vec<u8>, value: Vec<u8>) {
        self.ops.push((doc_key, Some(value)));
    }

    pub fn delete(&mut self, doc_key: Vec<u8>) {
        self.ops.push((doc_key, None));
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct KvSegmentFile {
    id: u64,
    /// Highest replication index reflected in this segment.
    last_applied_index: u64,
    entries: Vec<(Vec<u8>, Option<Vec<u8>>)>,
}

struct KvSegment {
    id: u64,
    last_applied_index: u64,
    path: PathBuf,
    entries: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

/// Configuration for the KV engine.
#[derive(Debug, Clone)]
pub struct KvConfig {
    /// Memtable size in bytes before an automatic flush.
    pub memtable_budget_bytes: u64,
    /// Segment count that triggers an internal merge.
    pub merge_trigger: usize,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            memtable_budget_bytes: 32 * 1024 * 1024,
            merge_trigger: 8,
        }
    }
}

/// The ordered key-value engine.
pub struct KvEngine {
    dir: PathBuf,
    config: KvConfig,
    memtable: RwLock<BTreeMap<Vec<u8>, Option<Vec<u8>>>>,
    memtable_bytes: AtomicU64,
    segments: RwLock<Vec<Arc<KvSegment>>>,
    next_segment_id: AtomicU64,
    /// Highest index applied anywhere (memtable included).
    applied_index: AtomicU64,
    /// Highest index durable in a segment file.
    flushed_index: AtomicU64,
    flush_lock: Mutex<()>,
}

impl KvEngine {
    /// Open or create the engine, recovering segment files from `dir`.
    pub fn open(dir: &Path, config: KvConfig) -> TabletResult<Self> {
        fs::create_dir_all(dir)?;
        let mut segments: Vec<Arc<KvSegment>> = Vec::new();
        let mut next_id = 0u64;
        let mut flushed = 0u64;
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("kss") {
                continue;
            }
            match read_framed::<KvSegmentFile>(&path, KV_SEGMENT_MAGIC) {
                Ok(file) => {
                    next_id = next_id.max(file.id + 1);
                    flushed = flushed.max(file.last_applied_index);
                    segments.push(Arc::new(KvSegment {
                        id: file.id,
                        last_applied_index: file.last_applied_index,
                        path,
                        entries: file.entries.into_iter().collect(),
                    }));
                }
                Err(e) => {
                    // A torn segment is unrecoverable corruption: the WAL
                    // replay below it could silently diverge.
                    return Err(TabletError::Corruption(format!(
                        "unreadable kv segment {}: {e}",
                        path.display()
                    )));
                }
            }
        }
        // Newest first for reads.
        segments.sort_by(|a, b| b.id.cmp(&a.id));
        tracing::debug!(
            "kv engine opened with {} segments, flushed index {}",
            segments.len(),
            flushed
        );
        Ok(Self {
            dir: dir.to_path_buf(),
            config,
            memtable: RwLock::new(BTreeMap::new()),
            memtable_bytes: AtomicU64::new(0),
            segments: RwLock::new(segments),
            next_segment_id: AtomicU64::new(next_id),
            applied_index: AtomicU64::new(flushed),
            flushed_index: AtomicU64::new(flushed),
            flush_lock: Mutex::new(()),
        })
    }

    /// Apply one batch atomically, tagging it with the replication index.
    pub fn write_batch(&self, batch: KvBatch, index: u64) -> TabletResult<()> {
        let mut added = 0u64;
        {
            let mut memtable = self.memtable.write();
            for (key, value) in batch.ops {
                added += (key.len() + value.as_ref().map(|v| v.len()).unwrap_or(0) + 16) as u64;
                memtable.insert(key, value);
            }
        }
        self.memtable_bytes.fetch_add(added, Ordering::Relaxed);
        self.applied_index.fetch_max(index, Ordering::SeqCst);
        if self.memtable_bytes.load(Ordering::Relaxed) >= self.config.memtable_budget_bytes {
            self.flush()?;
        }
        Ok(())
    }

    /// Point lookup. Tombstones read as `None`.
    pub fn get(&self, doc_key: &[u8]) -> Option<Vec<u8>> {
        if let Some(value) = self.memtable.read().get(doc_key) {
            return value.clone();
        }
        for segment in self.segments.read().iter() {
            if let Some(value) = segment.entries.get(doc_key) {
                return value.clone();
            }
        }
        None
    }

    /// Ordered scan of all live entries under `prefix`, newest source
    /// winning for duplicate doc keys. Tombstones are included so callers
    /// can resolve per-version deletes.
    pub fn scan_prefix(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Option<Vec<u8>>)> {
        let mut merged: BTreeMap<Vec<u8>, Option<Vec<u8>>> = BTreeMap::new();
        // Oldest segments first so newer sources overwrite.
        for segment in self.segments.read().iter().rev() {
            for (k, v) in segment.entries.range(prefix.to_vec()..) {
                if !k.starts_with(prefix) {
                    break;
                }
                merged.insert(k.clone(), v.clone());
            }
        }
        {
            let memtable = self.memtable.read();
            for (k, v) in memtable.range(prefix.to_vec()..) {
                if !k.starts_with(prefix) {
                    break;
                }
                merged.insert(k.clone(), v.clone());
            }
        }
        merged.into_iter().collect()
    }

    /// Freeze the memtable and write it as a new segment. The segment
    /// records the highest replication index it reflects, which advances
    /// `flushed_index`.
    pub fn flush(&self) -> TabletResult<()> {
        let _guard = self.flush_lock.lock();
        let (entries, index) = {
            let mut memtable = self.memtable.write();
            if memtable.is_empty() {
                return Ok(());
            }
            let frozen = std::mem::take(&mut *memtable);
            self.memtable_bytes.store(0, Ordering::Relaxed);
            (frozen, self.applied_index.load(Ordering::SeqCst))
        };
        let id = self.next_segment_id.fetch_add(1, Ordering::SeqCst);
        let path = self.dir.join(Self::segment_file_name(id));
        let file = KvSegmentFile {
            id,
            last_applied_index: index,
            entries: entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        };
        write_framed(&path, KV_SEGMENT_MAGIC, &file)?;
        {
            let mut segments = self.segments.write();
            segments.insert(
                0,
                Arc::new(KvSegment {
                    id,
                    last_applied_index: index,
                    path,
                    entries,
                }),
            );
        }
        self.flushed_index.fetch_max(index, Ordering::SeqCst);
        tracing::debug!("kv engine flushed segment {} at index {}", id, index);
        self.maybe_merge_segments()?;
        Ok(())
    }

    /// Internal segment merge. Not visible to the tablet beyond the
    /// shrinking segment count.
    fn maybe_merge_segments(&self) -> TabletResult<()> {
        let to_merge: Vec<Arc<KvSegment>> = {
            let segments = self.segments.read();
            if segments.len() < self.config.merge_trigger {
                return Ok(());
            }
            segments.clone()
        };
        let mut merged: BTreeMap<Vec<u8>, Option<Vec<u8>>> = BTreeMap::new();
        let mut max_index = 0u64;
        for segment in to_merge.iter().rev() {
            max_index = max_index.max(segment.last_applied_index);
            for (k, v) in &segment.entries {
                merged.insert(k.clone(), v.clone());
            }
        }
        // Merged output drops nothing: tombstones must survive until the
        // whole history below them is in one segment. They are now, so
        // they could be dropped; retained for checkpoint determinism.
        let id = self.next_segment_id.fetch_add(1, Ordering::SeqCst);
        let path = self.dir.join(Self::segment_file_name(id));
        let file = KvSegmentFile {
            id,
            last_applied_index: max_index,
            entries: merged.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        };
        write_framed(&path, KV_SEGMENT_MAGIC, &file)?;

        let merged_ids: Vec<u64> = to_merge.iter().map(|s| s.id).collect();
        let old_paths: Vec<PathBuf> = to_merge.iter().map(|s| s.path.clone()).collect();
        {
            let mut segments = self.segments.write();
            segments.retain(|s| !merged_ids.contains(&s.id));
            segments.insert(
                0,
                Arc::new(KvSegment {
                    id,
                    last_applied_index: max_index,
                    path,
                    entries: merged,
                }),
            );
        }
        for p in old_paths {
            let _ = fs::remove_file(p);
        }
        tracing::debug!("kv engine merged {} segments into {}", merged_ids.len(), id);
        Ok(())
    }

    /// Highest replication index durable in segment files. Entries at or
    /// below this index must not be replayed.
    pub fn flushed_index(&self) -> u64 {
        self.flushed_index.load(Ordering::SeqCst)
    }

    pub fn applied_index(&self) -> u64 {
        self.applied_index.load(Ordering::SeqCst)
    }

    /// Export a consistent on-disk image into `checkpoint_dir`: flush,
    /// then hard-copy every segment file.
    pub fn checkpoint(&self, checkpoint_dir: &Path) -> TabletResult<()> {
        self.flush()?;
        fs::create_dir_all(checkpoint_dir)?;
        for segment in self.segments.read().iter() {
            let name = segment
                .path
                .file_name()
                .ok_or_else(|| TabletError::illegal_state("segment without file name"))?;
            fs::copy(&segment.path, checkpoint_dir.join(name))?;
        }
        Ok(())
    }

    pub fn segment_count(&self) -> usize {
        self.segments.read().len()
    }

    pub fn memtable_bytes(&self) -> u64 {
        self.memtable_bytes.load(Ordering::Relaxed)
    }

    fn segment_file_name(id: u64) -> String {
        format!("kv_{:06}.kss", id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn engine(dir: &Path) -> KvEngine {
        KvEngine::open(
            dir,
            KvConfig {
                memtable_budget_bytes: 1024 * 1024,
                merge_trigger: 4,
            },
        )
        .unwrap()
    }

    fn batch(ops: &[(&[u8], Option<&[u8]>)]) -> KvBatch {
        KvBatch {
            ops: ops
                .iter()
                .map(|(k, v)| (k.to_vec(), v.map(|v| v.to_vec())))
                .collect(),
        }
    }

    #[test]
    fn test_write_get() {
        let dir = TempDir::new().unwrap();
        let kv = engine(dir.path());
        kv.write_batch(batch(&[(b"a", Some(b"1")), (b"b", Some(b"2"))]), 1)
            .unwrap();
        assert_eq!(kv.get(b"a"), Some(b"1".to_vec()));
        assert_eq!(kv.get(b"c"), None);
        assert_eq!(kv.applied_index(), 1);
        assert_eq!(kv.flushed_index(), 0);
    }

    #[test]
    fn test_flush_advances_flushed_index() {
        let dir = TempDir::new().unwrap();
        let kv = engine(dir.path());
        kv.write_batch(batch(&[(b"a", Some(b"1"))]), 5).unwrap();
        kv.flush().unwrap();
        assert_eq!(kv.flushed_index(), 5);
        assert_eq!(kv.get(b"a"), Some(b"1".to_vec()));
    }

    #[test]
    fn test_recovery_restores_flushed_index() {
        let dir = TempDir::new().unwrap();
        {
            let kv = engine(dir.path());
            kv.write_batch(batch(&[(b"a", Some(b"1"))]), 3).unwrap();
            kv.flush().unwrap();
            // Unflushed write is lost on crash.
            kv.write_batch(batch(&[(b"b", Some(b"2"))]), 4).unwrap();
        }
        let kv = engine(dir.path());
        assert_eq!(kv.flushed_index(), 3);
        assert_eq!(kv.get(b"a"), Some(b"1".to_vec()));
        assert_eq!(kv.get(b"b"), None);
    }

    #[test]
    fn test_scan_prefix_merges_sources() {
        let dir = TempDir::new().unwrap();
        let kv = engine(dir.path());
        kv.write_batch(batch(&[(b"row/1", Some(b"old"))]), 1).unwrap();
        kv.flush().unwrap();
        kv.write_batch(batch(&[(b"row/1", Some(b"new")), (b"row/2", Some(b"x"))]), 2)
            .unwrap();
        kv.write_batch(batch(&[(b"other/1", Some(b"y"))]), 3).unwrap();

        let rows = kv.scan_prefix(b"row/");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], (b"row/1".to_vec(), Some(b"new".to_vec())));
        assert_eq!(rows[1], (b"row/2".to_vec(), Some(b"x".to_vec())));
    }

    #[test]
    fn test_tombstone_shadows_older_value() {
        let dir = TempDir::new().unwrap();
        let kv = engine(dir.path());
        kv.write_batch(batch(&[(b"k", Some(b"v"))]), 1).unwrap();
        kv.flush().unwrap();
        kv.write_batch(batch(&[(b"k", None)]), 2).unwrap();
        assert_eq!(kv.get(b"k"), None);
        let scan = kv.scan_prefix(b"k");
        assert_eq!(scan, vec![(b"k".to_vec(), None)]);
    }

    #[test]
    fn test_internal_merge_preserves_data() {
        let dir = TempDir::new().unwrap();
        let kv = KvEngine::open(
            dir.path(),
            KvConfig {
                memtable_budget_bytes: 1024 * 1024,
                merge_trigger: 3,
            },
        )
        .unwrap();
        for i in 0..4u64 {
            kv.write_batch(batch(&[(format!("k{i}").as_bytes(), Some(b"v"))]), i + 1)
                .unwrap();
            kv.flush().unwrap();
        }
        assert!(kv.segment_count() < 4, "merge should have collapsed segments");
        for i in 0..4u64 {
            assert_eq!(kv.get(format!("k{i}").as_bytes()), Some(b"v".to_vec()));
        }
        assert_eq!(kv.flushed_index(), 4);
    }

    #[test]
    fn test_checkpoint_is_openable() {
        let dir = TempDir::new().unwrap();
        let ckpt = TempDir::new().unwrap();
        let kv = engine(dir.path());
        kv.write_batch(batch(&[(b"a", Some(b"1"))]), 7).unwrap();
        kv.checkpoint(ckpt.path()).unwrap();

        let restored = engine(ckpt.path());
        assert_eq!(restored.get(b"a"), Some(b"1".to_vec()));
        assert_eq!(restored.flushed_index(), 7);
    }
}
