//! MVCC manager: assigns hybrid times to mutations, tracks in-flight
//! operations, computes the safe read time and produces immutable snapshots.
//!
//! An operation is "in flight" between `start_operation` and the commit of
//! its handle. The safe read time is the largest boundary such that no
//! currently-uncommitted operation can later surface with a smaller
//! timestamp; it never regresses.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use kestrel_common::error::{TabletError, TabletResult};
use kestrel_common::types::HybridTime;

use crate::clock::ClockRef;

/// Immutable record of which hybrid times are committed as of an
/// observation instant. Bounds read visibility for the whole read.
#[derive(Debug, Clone)]
pub struct MvccSnapshot {
    /// Observation instant. Nothing after this is visible.
    pub snapshot_time: HybridTime,
    /// Operations that had started but not committed at the instant the
    /// snapshot was taken. Sorted, all ≤ `snapshot_time`.
    in_flight: Vec<HybridTime>,
}

impl MvccSnapshot {
    /// A snapshot in which every timestamp up to `ht` is committed.
    pub fn all_committed_before(ht: HybridTime) -> Self {
        Self {
            snapshot_time: ht.decremented(),
            in_flight: Vec::new(),
        }
    }

    /// A snapshot that sees everything. Used by flush, which first waits
    /// for the in-flight set to drain.
    pub fn all_committed() -> Self {
        Self {
            snapshot_time: HybridTime::MAX,
            in_flight: Vec::new(),
        }
    }

    /// Whether a write at `ht` is visible as committed in this snapshot.
    pub fn is_committed(&self, ht: HybridTime) -> bool {
        ht <= self.snapshot_time && self.in_flight.binary_search(&ht).is_err()
    }
}

struct MvccInner {
    in_flight: BTreeSet<HybridTime>,
    max_committed: HybridTime,
}

/// Tracks the set of operations between "started" and "committed".
pub struct MvccManager {
    clock: ClockRef,
    inner: Mutex<MvccInner>,
    no_in_flight: Condvar,
    /// Monotonic floor for the safe time; never regresses.
    safe_time_floor: AtomicU64,
}

impl MvccManager {
    pub fn new(clock: ClockRef) -> Self {
        Self {
            clock,
            inner: Mutex::new(MvccInner {
                in_flight: BTreeSet::new(),
                max_committed: HybridTime::MIN,
            }),
            no_in_flight: Condvar::new(),
            safe_time_floor: AtomicU64::new(0),
        }
    }

    /// Start an operation at the current time. The returned handle commits
    /// (and leaves the in-flight set) when released.
    pub fn start_operation(self: &Arc<Self>) -> OperationHandle {
        let mut inner = self.inner.lock();
        let ht = self.clock.now();
        inner.in_flight.insert(ht);
        OperationHandle {
            manager: Arc::clone(self),
            ht,
            done: false,
        }
    }

    /// Start an operation at an explicit historical time. Replay-only: live
    /// writers always take the clock's current time.
    pub fn start_operation_at(self: &Arc<Self>, ht: HybridTime) -> TabletResult<OperationHandle> {
        let mut inner = self.inner.lock();
        if ht <= inner.max_committed {
            return Err(TabletError::illegal_state(format!(
                "cannot start operation at {ht}: max committed is {}",
                inner.max_committed
            )));
        }
        self.clock.update(ht);
        inner.in_flight.insert(ht);
        Ok(OperationHandle {
            manager: Arc::clone(self),
            ht,
            done: false,
        })
    }

    /// Block the calling thread until the in-flight set is empty. Used
    /// before freezing a store for flush.
    pub fn wait_for_applying_to_commit(&self) {
        let mut inner = self.inner.lock();
        while !inner.in_flight.is_empty() {
            self.no_in_flight.wait(&mut inner);
        }
    }

    /// Like `wait_for_applying_to_commit` but bounded. Returns false on
    /// timeout with operations still in flight.
    pub fn wait_for_applying_to_commit_timeout(&self, timeout: Duration) -> bool {
        let mut inner = self.inner.lock();
        let deadline = std::time::Instant::now() + timeout;
        while !inner.in_flight.is_empty() {
            if self
                .no_in_flight
                .wait_until(&mut inner, deadline)
                .timed_out()
            {
                return inner.in_flight.is_empty();
            }
        }
        true
    }

    /// Largest timestamp at which a read is guaranteed to see a settled
    /// history: no uncommitted operation can later appear at or below it.
    pub fn safe_time(&self) -> HybridTime {
        let computed = {
            let inner = self.inner.lock();
            match inner.in_flight.iter().next() {
                Some(min) => min.decremented(),
                None => self.clock.now(),
            }
        };
        // Never regress, even if the clock or in-flight set says otherwise.
        let floor = self.safe_time_floor.fetch_max(computed.0, Ordering::SeqCst);
        HybridTime(floor.max(computed.0))
    }

    /// Bootstrap-only: advance the safe time to `ht` directly. Requires no
    /// concurrent in-flight operations.
    pub fn offline_adjust_safe_time(&self, ht: HybridTime) -> TabletResult<()> {
        let inner = self.inner.lock();
        if !inner.in_flight.is_empty() {
            return Err(TabletError::illegal_state(
                "offline safe-time adjustment with operations in flight",
            ));
        }
        self.clock.update(ht);
        self.safe_time_floor.fetch_max(ht.0, Ordering::SeqCst);
        Ok(())
    }

    /// Take a snapshot of commit visibility at the current instant.
    pub fn snapshot(&self) -> MvccSnapshot {
        let inner = self.inner.lock();
        let snapshot_time = self.clock.now().decremented();
        let in_flight = inner
            .in_flight
            .iter()
            .copied()
            .take_while(|ht| *ht <= snapshot_time)
            .collect();
        MvccSnapshot {
            snapshot_time,
            in_flight,
        }
    }

    /// Take a snapshot bounded at an explicit timestamp.
    pub fn snapshot_at(&self, snapshot_time: HybridTime) -> MvccSnapshot {
        let inner = self.inner.lock();
        let in_flight = inner
            .in_flight
            .iter()
            .copied()
            .take_while(|ht| *ht <= snapshot_time)
            .collect();
        MvccSnapshot {
            snapshot_time,
            in_flight,
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.lock().in_flight.len()
    }

    fn finish(&self, ht: HybridTime, committed: bool) {
        let mut inner = self.inner.lock();
        inner.in_flight.remove(&ht);
        if committed && ht > inner.max_committed {
            inner.max_committed = ht;
        }
        if inner.in_flight.is_empty() {
            self.no_in_flight.notify_all();
        }
    }
}

/// Scoped handle for one in-flight operation. Commits on drop unless
/// explicitly aborted.
pub struct OperationHandle {
    manager: Arc<MvccManager>,
    ht: HybridTime,
    done: bool,
}

impl OperationHandle {
    pub fn hybrid_time(&self) -> HybridTime {
        self.ht
    }

    pub fn commit(mut self) {
        self.manager.finish(self.ht, true);
        self.done = true;
    }

    /// Remove from the in-flight set without marking the time committed.
    pub fn abort(mut self) {
        self.manager.finish(self.ht, false);
        self.done = true;
    }
}

impl Drop for OperationHandle {
    fn drop(&mut self) {
        if !self.done {
            self.manager.finish(self.ht, true);
        }
    }
}

/// Shared registry of reader timestamps. A registered reader prevents
/// maintenance from discarding versions still visible to its snapshot.
pub struct ReaderTimestampRegistry {
    inner: Mutex<BTreeSet<(HybridTime, u64)>>,
    released: Condvar,
    next_id: AtomicU64,
}

impl ReaderTimestampRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BTreeSet::new()),
            released: Condvar::new(),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register interest in data visible at `ht`. Released when the guard
    /// drops, waking any maintenance task waiting on the registry.
    pub fn register(self: &Arc<Self>, ht: HybridTime) -> ReaderRegistration {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner.lock().insert((ht, id));
        ReaderRegistration {
            registry: Arc::clone(self),
            key: (ht, id),
        }
    }

    /// The oldest timestamp any active reader is pinned to, if any.
    pub fn oldest_reader(&self) -> Option<HybridTime> {
        self.inner.lock().iter().next().map(|(ht, _)| *ht)
    }

    /// Block until no reader older than `ht` remains, or the timeout
    /// expires. Returns false on timeout.
    pub fn wait_for_readers_before(&self, ht: HybridTime, timeout: Duration) -> bool {
        let mut inner = self.inner.lock();
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let has_older = inner.iter().next().map(|(r, _)| *r < ht).unwrap_or(false);
            if !has_older {
                return true;
            }
            if self.released.wait_until(&mut inner, deadline).timed_out() {
                return !inner.iter().next().map(|(r, _)| *r < ht).unwrap_or(false);
            }
        }
    }
}

impl Default for ReaderTimestampRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII reader registration; removal wakes pending maintenance.
pub struct ReaderRegistration {
    registry: Arc<ReaderTimestampRegistry>,
    key: (HybridTime, u64),
}

impl Drop for ReaderRegistration {
    fn drop(&mut self) {
        let mut inner = self.registry.inner.lock();
        inner.remove(&self.key);
        self.registry.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn manager() -> Arc<MvccManager> {
        let clock = Arc::new(ManualClock::new(HybridTime::new(100, 0)));
        Arc::new(MvccManager::new(clock))
    }

    #[test]
    fn test_operation_commit_on_drop() {
        let mgr = manager();
        {
            let op = mgr.start_operation();
            assert_eq!(mgr.in_flight_count(), 1);
            assert!(op.hybrid_time() > HybridTime::new(100, 0));
        }
        assert_eq!(mgr.in_flight_count(), 0);
    }

    #[test]
    fn test_safe_time_bounded_by_in_flight() {
        let mgr = manager();
        let op = mgr.start_operation();
        let ht = op.hybrid_time();
        assert_eq!(mgr.safe_time(), ht.decremented());
        op.commit();
        assert!(mgr.safe_time() > ht);
    }

    #[test]
    fn test_safe_time_never_regresses() {
        let mgr = manager();
        let high = mgr.safe_time();
        let _op = mgr.start_operation();
        // In-flight op would pull safe time down only if it were below the
        // floor; the floor holds.
        assert!(mgr.safe_time() >= high);
    }

    #[test]
    fn test_snapshot_excludes_in_flight() {
        let mgr = manager();
        let op = mgr.start_operation();
        let ht = op.hybrid_time();
        let snap = mgr.snapshot_at(ht.incremented());
        assert!(!snap.is_committed(ht));
        assert!(snap.is_committed(ht.decremented()));
        op.commit();
        // An existing snapshot never gains commits.
        assert!(!snap.is_committed(ht));
    }

    #[test]
    fn test_snapshot_bounds_future() {
        let snap = MvccSnapshot::all_committed_before(HybridTime::new(50, 0));
        assert!(snap.is_committed(HybridTime::new(49, 4095)));
        assert!(!snap.is_committed(HybridTime::new(50, 0)));
    }

    #[test]
    fn test_offline_adjust_requires_quiesced() {
        let mgr = manager();
        let op = mgr.start_operation();
        assert!(mgr.offline_adjust_safe_time(HybridTime::new(500, 0)).is_err());
        op.commit();
        mgr.offline_adjust_safe_time(HybridTime::new(500, 0)).unwrap();
        assert!(mgr.safe_time() >= HybridTime::new(500, 0));
    }

    #[test]
    fn test_wait_for_applying_unblocks() {
        let mgr = manager();
        let op = mgr.start_operation();
        let mgr2 = Arc::clone(&mgr);
        let h = std::thread::spawn(move || {
            mgr2.wait_for_applying_to_commit();
        });
        std::thread::sleep(Duration::from_millis(20));
        op.commit();
        h.join().unwrap();
        assert_eq!(mgr.in_flight_count(), 0);
    }

    #[test]
    fn test_start_at_below_committed_rejected() {
        let mgr = manager();
        let op = mgr.start_operation();
        let ht = op.hybrid_time();
        op.commit();
        assert!(mgr.start_operation_at(ht).is_err());
        assert!(mgr.start_operation_at(ht.incremented()).is_ok());
    }

    #[test]
    fn test_reader_registry_blocks_until_release() {
        let reg = Arc::new(ReaderTimestampRegistry::new());
        let r = reg.register(HybridTime::new(10, 0));
        assert_eq!(reg.oldest_reader(), Some(HybridTime::new(10, 0)));
        assert!(!reg.wait_for_readers_before(HybridTime::new(20, 0), Duration::from_millis(20)));
        drop(r);
        assert!(reg.wait_for_readers_before(HybridTime::new(20, 0), Duration::from_millis(20)));
    }
}
