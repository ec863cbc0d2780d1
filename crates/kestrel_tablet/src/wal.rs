//! Segmented write-ahead log.
//!
//! Stores OpId-stamped replicate entries and, for the legacy backend only,
//! commit entries. Record format per segment: a magic + format-version
//! header, then `[len: u32][crc32: u32][bincode payload]` records. A torn
//! tail is tolerated on read (the crash may have interrupted an append);
//! everything before it must checksum clean.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use kestrel_common::config::WalConfig;
use kestrel_common::error::{TabletError, TabletResult};
use kestrel_common::types::{HybridTime, OpId, SchemaVersion, TxnId};

use crate::ops::WireOp;

/// Magic bytes at the start of each log segment.
pub const LOG_MAGIC: &[u8; 4] = b"KWAL";
/// Log format version for compatibility checks.
pub const LOG_FORMAT_VERSION: u32 = 1;
/// Segment header: magic (4) + format version (4).
pub const LOG_SEGMENT_HEADER_SIZE: usize = 8;

/// Operation payload of a replicate entry, dispatched by type on replay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReplicateOp {
    /// A write batch, stored in its wire encoding and re-decoded on replay.
    Write { batch: Vec<u8> },
    /// Schema version bump. The tablet only tracks the version.
    AlterSchema { schema_version: SchemaVersion },
    /// Opaque consensus configuration change; replay is a no-op for
    /// storage but the entry still participates in sequencing.
    ChangeConfig { config: Vec<u8> },
    NoOp,
    /// Participant-side transaction status transition. An apply carries
    /// the transaction's provisional ops so replay can materialize them at
    /// `commit_ht` without depending on earlier in-memory intent state.
    UpdateTransaction {
        txn_id: TxnId,
        aborted: bool,
        commit_ht: HybridTime,
        ops: Vec<WireOp>,
    },
}

/// One replicated entry as acknowledged by consensus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplicateEntry {
    pub op_id: OpId,
    /// Piggybacked committed index (KV backend commit advancement).
    pub committed_index: u64,
    pub hybrid_time: HybridTime,
    /// True for externally-consistent (commit-wait) writes; replay
    /// backdates safe time by the clock's max error for these.
    pub commit_wait: bool,
    pub op: ReplicateOp,
}

/// One log record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum LogEntry {
    Replicate(ReplicateEntry),
    /// Legacy backend only: marks the replicate at `op_id` committed.
    Commit { op_id: OpId },
}

fn segment_file_name(segment_id: u64) -> String {
    format!("wal_{:06}.log", segment_id)
}

fn parse_segment_id(name: &str) -> Option<u64> {
    name.strip_prefix("wal_")?
        .strip_suffix(".log")?
        .parse::<u64>()
        .ok()
}

/// Append-only log writer with segment rotation.
pub struct LogWriter {
    inner: Mutex<LogWriterInner>,
    config: WalConfig,
}

struct LogWriterInner {
    writer: BufWriter<File>,
    dir: PathBuf,
    current_segment: u64,
    current_segment_size: u64,
}

impl LogWriter {
    /// Open the log in `dir`, appending to the latest segment or creating
    /// segment 0.
    pub fn open(dir: &Path, config: WalConfig) -> TabletResult<Self> {
        fs::create_dir_all(dir)?;
        let segment_id = Self::latest_segment(dir).unwrap_or(0);
        let path = dir.join(segment_file_name(segment_id));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let file_len = file.metadata().map(|m| m.len()).unwrap_or(0);
        let mut writer = BufWriter::new(file);
        let current_segment_size = if file_len == 0 {
            writer.write_all(LOG_MAGIC)?;
            writer.write_all(&LOG_FORMAT_VERSION.to_le_bytes())?;
            writer.flush()?;
            LOG_SEGMENT_HEADER_SIZE as u64
        } else {
            file_len
        };
        Ok(Self {
            inner: Mutex::new(LogWriterInner {
                writer,
                dir: dir.to_path_buf(),
                current_segment: segment_id,
                current_segment_size,
            }),
            config,
        })
    }

    fn latest_segment(dir: &Path) -> Option<u64> {
        let mut max_id = None;
        if let Ok(entries) = fs::read_dir(dir) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                if let Some(id) = parse_segment_id(&name.to_string_lossy()) {
                    max_id = Some(max_id.map_or(id, |cur: u64| cur.max(id)));
                }
            }
        }
        max_id
    }

    /// Append and (per config) sync one entry. A failure here is fatal to
    /// the caller: an acknowledged entry that is not durable breaks the
    /// replication contract.
    pub fn append(&self, entry: &LogEntry) -> TabletResult<()> {
        let data =
            bincode::serialize(entry).map_err(|e| TabletError::Serialization(e.to_string()))?;
        let crc = crc32fast::hash(&data);
        let record_size = 8 + data.len() as u64;

        let mut inner = self.inner.lock();
        if inner.current_segment_size + record_size > self.config.max_segment_size {
            self.rotate(&mut inner)?;
        }
        inner.writer.write_all(&(data.len() as u32).to_le_bytes())?;
        inner.writer.write_all(&crc.to_le_bytes())?;
        inner.writer.write_all(&data)?;
        inner.current_segment_size += record_size;
        inner.writer.flush()?;
        if self.config.sync_writes {
            inner.writer.get_ref().sync_data()?;
        }
        Ok(())
    }

    fn rotate(&self, inner: &mut LogWriterInner) -> TabletResult<()> {
        inner.writer.flush()?;
        if self.config.sync_writes {
            inner.writer.get_ref().sync_data()?;
        }
        inner.current_segment += 1;
        let path = inner.dir.join(segment_file_name(inner.current_segment));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        inner.writer = BufWriter::new(file);
        inner.writer.write_all(LOG_MAGIC)?;
        inner.writer.write_all(&LOG_FORMAT_VERSION.to_le_bytes())?;
        inner.current_segment_size = LOG_SEGMENT_HEADER_SIZE as u64;
        tracing::debug!("log rotated to segment {}", inner.current_segment);
        Ok(())
    }

    pub fn sync(&self) -> TabletResult<()> {
        let mut inner = self.inner.lock();
        inner.writer.flush()?;
        inner.writer.get_ref().sync_data()?;
        Ok(())
    }

    pub fn current_segment_id(&self) -> u64 {
        self.inner.lock().current_segment
    }
}

/// Log reader for bootstrap: yields entries segment by segment, in order.
pub struct LogReader {
    dir: PathBuf,
}

impl LogReader {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub fn segment_ids(&self) -> TabletResult<Vec<u64>> {
        let mut ids = Vec::new();
        if self.dir.exists() {
            for entry in fs::read_dir(&self.dir)? {
                let name = entry?.file_name();
                if let Some(id) = parse_segment_id(&name.to_string_lossy()) {
                    ids.push(id);
                }
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// All entries of one segment. Stops with a warning at a torn or
    /// checksum-failing tail.
    pub fn read_segment(&self, segment_id: u64) -> TabletResult<Vec<LogEntry>> {
        let path = self.dir.join(segment_file_name(segment_id));
        let data = fs::read(&path)?;
        let mut entries = Vec::new();
        let mut pos = 0usize;

        if data.len() >= LOG_SEGMENT_HEADER_SIZE && &data[0..4] == LOG_MAGIC.as_slice() {
            let version = u32::from_le_bytes(data[4..8].try_into().unwrap());
            if version != LOG_FORMAT_VERSION {
                return Err(TabletError::Corruption(format!(
                    "log segment {segment_id} has format version {version}, expected {LOG_FORMAT_VERSION}"
                )));
            }
            pos = LOG_SEGMENT_HEADER_SIZE;
        } else if !data.is_empty() {
            return Err(TabletError::Corruption(format!(
                "log segment {segment_id} missing magic header"
            )));
        }

        while pos + 8 <= data.len() {
            let len = u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap()) as usize;
            let crc = u32::from_le_bytes(data[pos + 4..pos + 8].try_into().unwrap());
            pos += 8;
            if pos + len > data.len() {
                tracing::warn!(
                    "log segment {} truncated at offset {}, stopping replay of this segment",
                    segment_id,
                    pos
                );
                break;
            }
            let record = &data[pos..pos + len];
            if crc32fast::hash(record) != crc {
                tracing::warn!(
                    "log segment {} checksum mismatch at offset {}, stopping replay of this segment",
                    segment_id,
                    pos
                );
                break;
            }
            match bincode::deserialize::<LogEntry>(record) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    return Err(TabletError::Corruption(format!(
                        "undecodable log entry in segment {segment_id} at offset {pos}: {e}"
                    )));
                }
            }
            pos += len;
        }
        Ok(entries)
    }

    /// All entries across all segments, in order.
    pub fn read_all(&self) -> TabletResult<Vec<LogEntry>> {
        let mut out = Vec::new();
        for id in self.segment_ids()? {
            out.extend(self.read_segment(id)?);
        }
        Ok(out)
    }
}

/// Name of the recovery directory a prior bootstrap attempt leaves behind.
pub fn recovery_dir(log_dir: &Path) -> PathBuf {
    let mut name = log_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "wal".to_string());
    name.push_str(".recovery");
    log_dir.with_file_name(name)
}

/// Move the live log directory aside for replay and create a fresh one.
///
/// If a recovery directory already exists, a prior bootstrap attempt was
/// interrupted mid-replay: its partially rebuilt log is discarded and the
/// stale recovery directory is replayed again. Returns the directory to
/// replay from, or None when there is nothing to recover.
pub fn prepare_recovery(log_dir: &Path) -> TabletResult<Option<PathBuf>> {
    let recovery = recovery_dir(log_dir);
    if recovery.exists() {
        tracing::info!(
            "stale recovery dir {} found; discarding partial log rebuild",
            recovery.display()
        );
        if log_dir.exists() {
            fs::remove_dir_all(log_dir)?;
        }
        fs::create_dir_all(log_dir)?;
        return Ok(Some(recovery));
    }
    let has_segments = log_dir.exists()
        && fs::read_dir(log_dir)?
            .flatten()
            .any(|e| parse_segment_id(&e.file_name().to_string_lossy()).is_some());
    if !has_segments {
        fs::create_dir_all(log_dir)?;
        return Ok(None);
    }
    fs::rename(log_dir, &recovery)?;
    fs::create_dir_all(log_dir)?;
    Ok(Some(recovery))
}

/// Delete the recovery directory once replay has fully succeeded.
pub fn finish_recovery(log_dir: &Path) -> TabletResult<()> {
    let recovery = recovery_dir(log_dir);
    if recovery.exists() {
        fs::remove_dir_all(&recovery)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_entry(op_id: OpId) -> LogEntry {
        LogEntry::Replicate(ReplicateEntry {
            op_id,
            committed_index: 0,
            hybrid_time: HybridTime::new(op_id.index * 10, 0),
            commit_wait: false,
            op: ReplicateOp::NoOp,
        })
    }

    fn test_config() -> WalConfig {
        WalConfig {
            max_segment_size: 64 * 1024 * 1024,
            sync_writes: false,
        }
    }

    #[test]
    fn test_append_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let writer = LogWriter::open(dir.path(), test_config()).unwrap();
        let entries = vec![
            write_entry(OpId::new(1, 1)),
            write_entry(OpId::new(1, 2)),
            LogEntry::Commit {
                op_id: OpId::new(1, 1),
            },
        ];
        for e in &entries {
            writer.append(e).unwrap();
        }
        let read = LogReader::new(dir.path()).read_all().unwrap();
        assert_eq!(read, entries);
    }

    #[test]
    fn test_segment_rotation() {
        let dir = TempDir::new().unwrap();
        let writer = LogWriter::open(
            dir.path(),
            WalConfig {
                max_segment_size: 128,
                sync_writes: false,
            },
        )
        .unwrap();
        for i in 1..=20 {
            writer.append(&write_entry(OpId::new(1, i))).unwrap();
        }
        assert!(writer.current_segment_id() > 0);
        let reader = LogReader::new(dir.path());
        assert!(reader.segment_ids().unwrap().len() > 1);
        assert_eq!(reader.read_all().unwrap().len(), 20);
    }

    #[test]
    fn test_torn_tail_tolerated() {
        let dir = TempDir::new().unwrap();
        let writer = LogWriter::open(dir.path(), test_config()).unwrap();
        writer.append(&write_entry(OpId::new(1, 1))).unwrap();
        writer.append(&write_entry(OpId::new(1, 2))).unwrap();
        drop(writer);

        // Chop bytes off the tail to simulate a crash mid-append.
        let path = dir.path().join(segment_file_name(0));
        let mut raw = fs::read(&path).unwrap();
        raw.truncate(raw.len() - 3);
        fs::write(&path, raw).unwrap();

        let read = LogReader::new(dir.path()).read_all().unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0], write_entry(OpId::new(1, 1)));
    }

    #[test]
    fn test_corrupt_record_stops_segment() {
        let dir = TempDir::new().unwrap();
        let writer = LogWriter::open(dir.path(), test_config()).unwrap();
        writer.append(&write_entry(OpId::new(1, 1))).unwrap();
        drop(writer);

        let path = dir.path().join(segment_file_name(0));
        let mut raw = fs::read(&path).unwrap();
        // Flip a payload byte: checksum must catch it.
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        fs::write(&path, raw).unwrap();

        let read = LogReader::new(dir.path()).read_all().unwrap();
        assert!(read.is_empty());
    }

    #[test]
    fn test_prepare_recovery_moves_live_dir() {
        let dir = TempDir::new().unwrap();
        let log_dir = dir.path().join("wal");
        let writer = LogWriter::open(&log_dir, test_config()).unwrap();
        writer.append(&write_entry(OpId::new(1, 1))).unwrap();
        drop(writer);

        let recovered = prepare_recovery(&log_dir).unwrap().expect("dir to replay");
        assert_eq!(recovered, recovery_dir(&log_dir));
        assert_eq!(LogReader::new(&recovered).read_all().unwrap().len(), 1);
        // Fresh log dir exists and is empty of segments.
        assert!(LogReader::new(&log_dir).segment_ids().unwrap().is_empty());

        finish_recovery(&log_dir).unwrap();
        assert!(!recovery_dir(&log_dir).exists());
    }

    #[test]
    fn test_prepare_recovery_discards_stale_rebuild() {
        let dir = TempDir::new().unwrap();
        let log_dir = dir.path().join("wal");
        // Simulate a prior interrupted attempt: recovery dir with one
        // entry, live dir with a partial rebuild.
        let recovery = recovery_dir(&log_dir);
        let w = LogWriter::open(&recovery, test_config()).unwrap();
        w.append(&write_entry(OpId::new(1, 1))).unwrap();
        drop(w);
        let w = LogWriter::open(&log_dir, test_config()).unwrap();
        w.append(&write_entry(OpId::new(9, 9))).unwrap();
        drop(w);

        let replay_from = prepare_recovery(&log_dir).unwrap().expect("recovery dir");
        assert_eq!(replay_from, recovery);
        // The partial rebuild was discarded.
        assert!(LogReader::new(&log_dir).segment_ids().unwrap().is_empty());
    }

    #[test]
    fn test_prepare_recovery_clean_dir() {
        let dir = TempDir::new().unwrap();
        let log_dir = dir.path().join("wal");
        assert!(prepare_recovery(&log_dir).unwrap().is_none());
        assert!(log_dir.exists());
    }
}
