use serde::{Deserialize, Serialize};

/// Top-level tablet configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TabletConfig {
    #[serde(default)]
    pub wal: WalConfig,
    #[serde(default)]
    pub flush: FlushConfig,
    #[serde(default)]
    pub compaction: CompactionConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

/// Write-ahead log settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalConfig {
    /// Max bytes per log segment before rotating.
    pub max_segment_size: u64,
    /// Whether to fsync after every append (true = durable, false = faster).
    pub sync_writes: bool,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            max_segment_size: 64 * 1024 * 1024,
            sync_writes: true,
        }
    }
}

/// Flush and lock-wait settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlushConfig {
    /// MemRowSet / memtable size in bytes that makes a flush worthwhile.
    pub memstore_budget_bytes: u64,
    /// Max bytes per flushed disk rowset before the rolling writer rolls.
    pub rolling_segment_bytes: u64,
    /// How long a writer waits for a contended key lock before the whole
    /// batch fails with Aborted.
    pub lock_wait_ms: u64,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            memstore_budget_bytes: 32 * 1024 * 1024,
            rolling_segment_bytes: 64 * 1024 * 1024,
            lock_wait_ms: 5_000,
        }
    }
}

/// Background compaction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// IO budget (bytes of input) for one rowset compaction.
    pub budget_bytes: u64,
    /// Delta stores below this size are candidates for minor compaction.
    pub small_delta_bytes: u64,
    /// Interval between maintenance scheduler passes, in milliseconds.
    pub poll_interval_ms: u64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            budget_bytes: 128 * 1024 * 1024,
            small_delta_bytes: 1024 * 1024,
            poll_interval_ms: 250,
        }
    }
}

/// Shutdown drain settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// Bounded wait for the pending-operation counter to drain before
    /// storage is torn down anyway.
    pub drain_timeout_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout_ms: 10_000,
        }
    }
}
