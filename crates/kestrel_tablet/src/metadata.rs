//! Tablet superblock.
//!
//! One small framed file per tablet recording which stores are durable.
//! Rewritten atomically (tmp + rename) after every flush or compaction so
//! that bootstrap can tell which log entries are already reflected in base
//! data.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use kestrel_common::error::TabletResult;
use kestrel_common::types::{SchemaVersion, TableType, TabletId};

use crate::rowset::{read_framed, write_framed};

/// Magic bytes for the superblock file.
pub const METADATA_MAGIC: &[u8; 4] = b"KMT1";
/// Superblock file name inside the tablet root directory.
pub const METADATA_FILE_NAME: &str = "tablet.meta";
/// Data subdirectory (rowsets or KV segments).
pub const DATA_DIR_NAME: &str = "data";
/// Log subdirectory.
pub const WAL_DIR_NAME: &str = "wal";

/// Durable descriptor of one disk rowset and its delta files.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RowSetMeta {
    pub id: u64,
    pub delta_ids: Vec<u64>,
}

/// Persisted tablet state. Everything bootstrap needs that is not in the
/// log or in the store files themselves.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TabletMetadata {
    pub tablet_id: TabletId,
    pub table_type: TableType,
    pub schema_version: SchemaVersion,
    /// Live disk rowsets, legacy backend only.
    pub rowsets: Vec<RowSetMeta>,
    /// Next rowset id to allocate.
    pub next_rowset_id: u64,
    /// Id of the last memory rowset whose contents reached disk. The live
    /// memory rowset always has a strictly larger id.
    pub last_durable_mrs_id: u64,
    /// Highest log index whose effects are captured by durable base data.
    /// Replay skips write entries at or below this watermark.
    pub last_durable_op_index: u64,
}

impl TabletMetadata {
    pub fn new(tablet_id: TabletId, table_type: TableType) -> Self {
        Self {
            tablet_id,
            table_type,
            schema_version: 0,
            rowsets: Vec::new(),
            next_rowset_id: 0,
            last_durable_mrs_id: 0,
            last_durable_op_index: 0,
        }
    }

    pub fn path_in(root: &Path) -> PathBuf {
        root.join(METADATA_FILE_NAME)
    }

    pub fn data_dir(root: &Path) -> PathBuf {
        root.join(DATA_DIR_NAME)
    }

    pub fn wal_dir(root: &Path) -> PathBuf {
        root.join(WAL_DIR_NAME)
    }

    pub fn exists_in(root: &Path) -> bool {
        Self::path_in(root).exists()
    }

    pub fn load(root: &Path) -> TabletResult<Self> {
        read_framed(&Self::path_in(root), METADATA_MAGIC)
    }

    /// Atomically persist the superblock.
    pub fn store(&self, root: &Path) -> TabletResult<()> {
        write_framed(&Self::path_in(root), METADATA_MAGIC, self)
    }

    pub fn allocate_rowset_id(&mut self) -> u64 {
        let id = self.next_rowset_id;
        self.next_rowset_id += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::error::TabletError;
    use std::fs;
    use tempfile::TempDir;

    fn sample_metadata() -> TabletMetadata {
        let mut meta = TabletMetadata::new(
            TabletId("tablet-0001".to_string()),
            TableType::LegacyRowSet,
        );
        meta.schema_version = 3;
        meta.rowsets = vec![
            RowSetMeta {
                id: 0,
                delta_ids: vec![0, 1],
            },
            RowSetMeta {
                id: 1,
                delta_ids: vec![],
            },
        ];
        meta.next_rowset_id = 2;
        meta.last_durable_mrs_id = 2;
        meta.last_durable_op_index = 17;
        meta
    }

    #[test]
    fn test_store_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let meta = sample_metadata();
        meta.store(dir.path()).unwrap();
        assert!(TabletMetadata::exists_in(dir.path()));
        let loaded = TabletMetadata::load(dir.path()).unwrap();
        assert_eq!(loaded, meta);
    }

    #[test]
    fn test_corrupt_superblock_rejected() {
        let dir = TempDir::new().unwrap();
        sample_metadata().store(dir.path()).unwrap();
        let path = TabletMetadata::path_in(dir.path());
        let mut raw = fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        fs::write(&path, raw).unwrap();
        match TabletMetadata::load(dir.path()) {
            Err(TabletError::Corruption(_)) => {}
            other => panic!("expected corruption, got {other:?}"),
        }
    }

    #[test]
    fn test_allocate_rowset_id() {
        let mut meta =
            TabletMetadata::new(TabletId("t".to_string()), TableType::KeyValue);
        assert_eq!(meta.allocate_rowset_id(), 0);
        assert_eq!(meta.allocate_rowset_id(), 1);
        assert_eq!(meta.next_rowset_id, 2);
    }
}
