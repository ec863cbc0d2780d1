//! Per-key locking.
//!
//! Two lock disciplines share this module:
//! - `RowLockMap` — one exclusive lock per row key (legacy backend);
//!   acquired before mutation, released by the owning operation's scope.
//! - `SharedLockManager` — shared/exclusive intent per encoded key across a
//!   batch (KV backend). All keys in a batch are locked in sorted order so
//!   two batches can never deadlock; a timeout rolls back every lock
//!   already taken and fails the whole batch.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use kestrel_common::error::{TabletError, TabletResult};

/// Encoded key a lock is held on.
pub type LockKey = Vec<u8>;

/// Exclusive row lock table for the legacy backend.
pub struct RowLockMap {
    held: Mutex<HashSet<LockKey>>,
    released: Condvar,
}

impl RowLockMap {
    pub fn new() -> Self {
        Self {
            held: Mutex::new(HashSet::new()),
            released: Condvar::new(),
        }
    }

    /// Block until the key's exclusive lock is free, then take it.
    /// Fails with `Aborted` if the lock cannot be taken within `timeout`;
    /// the caller retries the batch, this is not fatal.
    pub fn lock(self: &Arc<Self>, key: LockKey, timeout: Duration) -> TabletResult<RowLockGuard> {
        let deadline = Instant::now() + timeout;
        let mut held = self.held.lock();
        while held.contains(&key) {
            if self.released.wait_until(&mut held, deadline).timed_out() && held.contains(&key) {
                return Err(TabletError::Aborted(format!(
                    "timed out waiting for row lock on key {:02x?}",
                    &key[..key.len().min(16)]
                )));
            }
        }
        held.insert(key.clone());
        Ok(RowLockGuard {
            map: Arc::clone(self),
            key,
        })
    }

    pub fn is_locked(&self, key: &[u8]) -> bool {
        self.held.lock().contains(key)
    }

    fn unlock(&self, key: &[u8]) {
        let mut held = self.held.lock();
        held.remove(key);
        self.released.notify_all();
    }
}

impl Default for RowLockMap {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for one exclusive row lock.
pub struct RowLockGuard {
    map: Arc<RowLockMap>,
    key: LockKey,
}

impl RowLockGuard {
    pub fn key(&self) -> &[u8] {
        &self.key
    }
}

impl Drop for RowLockGuard {
    fn drop(&mut self) {
        self.map.unlock(&self.key);
    }
}

/// Lock intent for one key in a KV batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockKind {
    Shared,
    Exclusive,
}

#[derive(Default)]
struct KeyLockState {
    exclusive: bool,
    shared_count: u32,
}

impl KeyLockState {
    fn compatible(&self, kind: LockKind) -> bool {
        match kind {
            LockKind::Shared => !self.exclusive,
            LockKind::Exclusive => !self.exclusive && self.shared_count == 0,
        }
    }

    fn grant(&mut self, kind: LockKind) {
        match kind {
            LockKind::Shared => self.shared_count += 1,
            LockKind::Exclusive => self.exclusive = true,
        }
    }

    fn release(&mut self, kind: LockKind) {
        match kind {
            LockKind::Shared => self.shared_count -= 1,
            LockKind::Exclusive => self.exclusive = false,
        }
    }

    fn is_free(&self) -> bool {
        !self.exclusive && self.shared_count == 0
    }
}

/// Batched shared/exclusive lock manager for the KV backend.
pub struct SharedLockManager {
    state: Mutex<HashMap<LockKey, KeyLockState>>,
    released: Condvar,
}

impl SharedLockManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
            released: Condvar::new(),
        }
    }

    /// Acquire all locks for one batch atomically-or-not-at-all.
    ///
    /// Keys are deduplicated (the strongest intent wins) and locked in
    /// sorted order. On timeout every already-granted lock is rolled back
    /// and the whole batch fails with `Aborted`.
    pub fn lock_batch(
        self: &Arc<Self>,
        intents: Vec<(LockKey, LockKind)>,
        timeout: Duration,
    ) -> TabletResult<LockBatch> {
        let mut merged: HashMap<LockKey, LockKind> = HashMap::with_capacity(intents.len());
        for (key, kind) in intents {
            merged
                .entry(key)
                .and_modify(|existing| *existing = (*existing).max(kind))
                .or_insert(kind);
        }
        let mut ordered: Vec<(LockKey, LockKind)> = merged.into_iter().collect();
        ordered.sort_by(|a, b| a.0.cmp(&b.0));

        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        let mut granted: Vec<(LockKey, LockKind)> = Vec::with_capacity(ordered.len());

        for (key, kind) in ordered {
            loop {
                let entry = state.entry(key.clone()).or_default();
                if entry.compatible(kind) {
                    entry.grant(kind);
                    granted.push((key, kind));
                    break;
                }
                if self.released.wait_until(&mut state, deadline).timed_out() {
                    // Roll back partial acquisition before failing the batch.
                    for (k, g) in granted.drain(..) {
                        Self::release_one(&mut state, &k, g);
                    }
                    self.released.notify_all();
                    return Err(TabletError::Aborted(
                        "timed out acquiring batch key locks".into(),
                    ));
                }
            }
        }

        Ok(LockBatch {
            manager: Arc::clone(self),
            granted,
        })
    }

    pub fn is_locked(&self, key: &[u8]) -> bool {
        self.state
            .lock()
            .get(key)
            .map(|s| !s.is_free())
            .unwrap_or(false)
    }

    fn release_one(state: &mut HashMap<LockKey, KeyLockState>, key: &[u8], kind: LockKind) {
        if let Some(entry) = state.get_mut(key) {
            entry.release(kind);
            if entry.is_free() {
                state.remove(key);
            }
        }
    }

    fn unlock_all(&self, granted: &[(LockKey, LockKind)]) {
        let mut state = self.state.lock();
        for (key, kind) in granted {
            Self::release_one(&mut state, key, *kind);
        }
        self.released.notify_all();
    }
}

impl Default for SharedLockManager {
    fn default() -> Self {
        Self::new()
    }
}

/// The set of key locks held for one write batch. Invariant: never empty
/// while the underlying batch mutates at least one key. Released on drop
/// or via `unlock()` during conflict rollback.
pub struct LockBatch {
    manager: Arc<SharedLockManager>,
    granted: Vec<(LockKey, LockKind)>,
}

impl LockBatch {
    pub fn len(&self) -> usize {
        self.granted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.granted.is_empty()
    }

    /// Release every lock now instead of at scope exit.
    pub fn unlock(mut self) {
        self.manager.unlock_all(&self.granted);
        self.granted.clear();
    }
}

impl Drop for LockBatch {
    fn drop(&mut self) {
        if !self.granted.is_empty() {
            self.manager.unlock_all(&self.granted);
        }
    }
}
