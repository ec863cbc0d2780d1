//! End-to-end tablet behavior across writes, flushes, snapshots and
//! restarts:
//! - concurrent writers on disjoint keys all succeed
//! - acknowledged writes stay visible while flushes run concurrently
//! - snapshot reads are stable against later writes and flushes
//! - every acknowledged write survives an unclean restart
//! - replaying the same log twice converges to the same state
//! - transaction outcomes (commit, abort, still pending) survive restart

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use kestrel_common::config::TabletConfig;
use kestrel_common::types::{HybridTime, TableType, TabletId, TxnId};
use kestrel_tablet::bootstrap::bootstrap_tablet;
use kestrel_tablet::clock::{ClockRef, ManualClock};
use kestrel_tablet::ops::{OpResult, WireBatch, WireOp};
use kestrel_tablet::tablet::Tablet;

fn test_clock() -> ClockRef {
    Arc::new(ManualClock::new(HybridTime::from_micros(1_000)))
}

fn test_config() -> TabletConfig {
    let mut config = TabletConfig::default();
    config.wal.sync_writes = false;
    config
}

fn create_and_open(root: &Path, table_type: TableType) -> Arc<Tablet> {
    let tablet = Tablet::create(
        root,
        TabletId("tablet-it".to_string()),
        table_type,
        test_config(),
        test_clock(),
    )
    .unwrap();
    drop(tablet);
    bootstrap_tablet(root, test_config(), test_clock()).unwrap().tablet
}

fn reopen(root: &Path) -> Arc<Tablet> {
    bootstrap_tablet(root, test_config(), test_clock()).unwrap().tablet
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

// ── Concurrency ─────────────────────────────────────────────────────────

#[test]
fn test_concurrent_disjoint_writers_all_apply() {
    let dir = tempfile::tempdir().unwrap();
    let tablet = create_and_open(dir.path(), TableType::LegacyRowSet);

    let mut handles = Vec::new();
    for writer in 0..4u32 {
        let tablet = Arc::clone(&tablet);
        handles.push(thread::spawn(move || {
            for i in 0..25u32 {
                let key = format!("w{writer}-k{i:03}");
                let results = tablet
                    .write(insert(key.as_bytes(), b"v"))
                    .expect("write failed");
                assert_eq!(results, vec![OpResult::Applied]);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let snap = tablet.snapshot().unwrap();
    assert_eq!(snap.scan().len(), 100);
    assert_eq!(snap.get(b"w3-k024"), Some(b"v".to_vec()));
}

#[test]
fn test_acknowledged_writes_visible_during_concurrent_flush() {
    let dir = tempfile::tempdir().unwrap();
    let tablet = create_and_open(dir.path(), TableType::LegacyRowSet);

    let stop = Arc::new(AtomicBool::new(false));
    let flusher = {
        let tablet = Arc::clone(&tablet);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                tablet.flush().unwrap();
            }
        })
    };

    // Every acknowledged write must be readable immediately, no matter
    // where the flusher is in its swap.
    let mut missing = Vec::new();
    for i in 0..500u32 {
        let key = format!("k{i:05}");
        let results = tablet.write(insert(key.as_bytes(), b"v")).unwrap();
        assert_eq!(results, vec![OpResult::Applied]);
        if tablet.snapshot().unwrap().get(key.as_bytes()).is_none() {
            missing.push(key);
        }
    }
    stop.store(true, Ordering::SeqCst);
    flusher.join().unwrap();
    assert!(
        missing.is_empty(),
        "acknowledged writes invisible to live snapshots: {missing:?}"
    );
}

#[test]
fn test_reader_between_insert_and_update_sees_only_insert() {
    let dir = tempfile::tempdir().unwrap();
    let tablet = create_and_open(dir.path(), TableType::LegacyRowSet);

    assert_eq!(
        tablet.write(insert(b"row", b"first")).unwrap(),
        vec![OpResult::Applied]
    );
    let read_time = tablet.mvcc().safe_time();

    // Concurrent updates serialize on the row lock behind the insert and
    // all land above `read_time`.
    let mut handles = Vec::new();
    for i in 0..4u32 {
        let tablet = Arc::clone(&tablet);
        handles.push(thread::spawn(move || {
            let value = format!("update-{i}");
            let results = tablet.write(update(b"row", value.as_bytes())).unwrap();
            assert_eq!(results, vec![OpResult::Applied]);
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let snap = tablet.snapshot_at(read_time).unwrap();
    assert_eq!(snap.get(b"row"), Some(b"first".to_vec()));
    let latest = tablet.snapshot().unwrap().get(b"row").unwrap();
    assert!(latest.starts_with(b"update-"));
}

// ── Snapshot stability ──────────────────────────────────────────────────

#[test]
fn test_snapshot_is_stable_across_update_and_flush() {
    let dir = tempfile::tempdir().unwrap();
    let tablet = create_and_open(dir.path(), TableType::LegacyRowSet);

    tablet.write(insert(b"k", b"v1")).unwrap();
    let old = tablet.snapshot().unwrap();
    let old_time = old.snapshot_time();
    assert_eq!(old.get(b"k"), Some(b"v1".to_vec()));

    tablet.write(update(b"k", b"v2")).unwrap();
    assert_eq!(old.get(b"k"), Some(b"v1".to_vec()));
    assert_eq!(
        tablet.snapshot().unwrap().get(b"k"),
        Some(b"v2".to_vec())
    );

    // Flushing to disk must not disturb either view.
    tablet.flush().unwrap();
    assert_eq!(old.get(b"k"), Some(b"v1".to_vec()));
    assert_eq!(
        tablet.snapshot_at(old_time).unwrap().get(b"k"),
        Some(b"v1".to_vec())
    );
    assert_eq!(
        tablet.snapshot().unwrap().get(b"k"),
        Some(b"v2".to_vec())
    );
}

// ── Crash recovery ──────────────────────────────────────────────────────

#[test]
fn test_unclean_restart_recovers_acknowledged_writes() {
    let dir = tempfile::tempdir().unwrap();
    {
        let tablet = create_and_open(dir.path(), TableType::LegacyRowSet);
        for i in 0..10u32 {
            let key = format!("k{i:02}");
            tablet.write(insert(key.as_bytes(), b"v")).unwrap();
        }
        // No shutdown: the tablet is simply dropped, as in a crash. Every
        // acknowledged write is already in the log.
    }
    let tablet = reopen(dir.path());
    let snap = tablet.snapshot().unwrap();
    assert_eq!(snap.scan().len(), 10);
    assert_eq!(snap.get(b"k09"), Some(b"v".to_vec()));
}

#[test]
fn test_repeated_replay_converges() {
    let dir = tempfile::tempdir().unwrap();
    {
        let tablet = create_and_open(dir.path(), TableType::KeyValue);
        tablet.write(insert(b"a", b"v1")).unwrap();
        tablet.write(update(b"a", b"v2")).unwrap();
        tablet.write(insert(b"b", b"v1")).unwrap();
        tablet
            .write(WireBatch::new(vec![WireOp::Delete { key: b"b".to_vec() }]))
            .unwrap();
    }
    let mut seen = Vec::new();
    for _ in 0..3 {
        let tablet = reopen(dir.path());
        let snap = tablet.snapshot().unwrap();
        seen.push((snap.get(b"a"), snap.get(b"b"), snap.scan()));
        drop(snap);
        tablet.shutdown().unwrap();
    }
    assert_eq!(seen[0].0, Some(b"v2".to_vec()));
    assert_eq!(seen[0].1, None);
    assert_eq!(seen[0], seen[1]);
    assert_eq!(seen[1], seen[2]);
}

#[test]
fn test_flushed_data_survives_restart_without_replay() {
    let dir = tempfile::tempdir().unwrap();
    {
        let tablet = create_and_open(dir.path(), TableType::LegacyRowSet);
        tablet.write(insert(b"flushed", b"v1")).unwrap();
        tablet.flush().unwrap();
        tablet.write(insert(b"logged", b"v2")).unwrap();
        tablet.shutdown().unwrap();
    }
    let result = bootstrap_tablet(dir.path(), test_config(), test_clock()).unwrap();
    assert!(result.entries_skipped >= 1);
    let snap = result.tablet.snapshot().unwrap();
    assert_eq!(snap.get(b"flushed"), Some(b"v1".to_vec()));
    assert_eq!(snap.get(b"logged"), Some(b"v2".to_vec()));
}

// ── Transactions across restart ─────────────────────────────────────────

#[test]
fn test_committed_transaction_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let txn = TxnId(7);
    {
        let tablet = create_and_open(dir.path(), TableType::KeyValue);
        tablet
            .write(WireBatch::transactional(
                txn,
                vec![WireOp::Insert {
                    key: b"t".to_vec(),
                    value: b"committed".to_vec(),
                }],
            ))
            .unwrap();
        tablet.apply_transaction(txn).unwrap();
        assert_eq!(
            tablet.snapshot().unwrap().get(b"t"),
            Some(b"committed".to_vec())
        );
    }
    let tablet = reopen(dir.path());
    assert_eq!(
        tablet.snapshot().unwrap().get(b"t"),
        Some(b"committed".to_vec())
    );
}

#[test]
fn test_pending_transaction_intents_survive_flush_and_restart() {
    let dir = tempfile::tempdir().unwrap();
    let txn = TxnId(42);
    {
        let tablet = create_and_open(dir.path(), TableType::LegacyRowSet);
        assert_eq!(
            tablet
                .write(WireBatch::transactional(
                    txn,
                    vec![WireOp::Insert {
                        key: b"locked".to_vec(),
                        value: b"provisional".to_vec(),
                    }],
                ))
                .unwrap(),
            vec![OpResult::Applied]
        );
        // The flush watermark advances past the provisional write even
        // though its data only exists as buffered intents.
        tablet.flush().unwrap();
        // Crash without shutdown.
    }
    // Two restart cycles: the intents must also survive the rebuilt log.
    let tablet = reopen(dir.path());
    drop(tablet);
    let tablet = reopen(dir.path());

    // The intent still guards the key against plain writes.
    assert!(tablet.write(insert(b"locked", b"other")).is_err());

    // The coordinator can still apply the transaction.
    tablet.apply_transaction(txn).unwrap();
    assert_eq!(
        tablet.snapshot().unwrap().get(b"locked"),
        Some(b"provisional".to_vec())
    );
}

#[test]
fn test_aborted_transaction_stays_invisible_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let txn = TxnId(8);
    {
        let tablet = create_and_open(dir.path(), TableType::KeyValue);
        tablet
            .write(WireBatch::transactional(
                txn,
                vec![WireOp::Insert {
                    key: b"t".to_vec(),
                    value: b"provisional".to_vec(),
                }],
            ))
            .unwrap();
        tablet.abort_transaction(txn).unwrap();
    }
    let tablet = reopen(dir.path());
    assert_eq!(tablet.snapshot().unwrap().get(b"t"), None);
    // The key is free for a plain write after the abort replays.
    assert_eq!(
        tablet.write(insert(b"t", b"plain")).unwrap(),
        vec![OpResult::Applied]
    );
}
