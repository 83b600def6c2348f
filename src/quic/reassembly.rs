//! Per-connection CRYPTO stream reassembly
//!
//! Clients may spread a ClientHello over several CRYPTO frames and several
//! Initial packets, in any order. Each connection (keyed by DCID) gets a
//! buffer that tracks which bytes arrived and how long the contiguous prefix
//! from offset 0 is.
//!
//! Memory is bounded three ways: frame offsets past [`MAX_CRYPTO_OFFSET`] are
//! ignored, an entry whose buffer grows past [`MAX_CRYPTO_BUFFER`] is dropped,
//! and a background sweep removes idle entries and enforces an entry cap.

use super::frames::FrameWalk;
use crate::error::MangleError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// CRYPTO frames starting beyond this stream offset are dropped
pub const MAX_CRYPTO_OFFSET: u64 = 1 << 20;

/// An entry whose buffer grows past this is discarded
pub const MAX_CRYPTO_BUFFER: usize = 1 << 20;

/// Cache eviction settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheLimits {
    /// Entries idle longer than this are removed by the sweep
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// How often the background sweep runs
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Entry count the sweep trims down to
    pub max_entries: usize,
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(10),
            max_entries: 1000,
        }
    }
}

/// Result of writing one CRYPTO frame into an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// Frame offset beyond [`MAX_CRYPTO_OFFSET`]; nothing was written
    OutOfBounds,
    /// Buffer grew past [`MAX_CRYPTO_BUFFER`]; the entry should be dropped
    Overflow,
}

/// Reassembly state for one connection
#[derive(Debug, Clone)]
pub struct ReassemblyEntry {
    data: Vec<u8>,
    received: Vec<bool>,
    head: usize,
    last_access: Instant,
}

impl ReassemblyEntry {
    pub fn new(now: Instant) -> Self {
        Self {
            data: Vec::new(),
            received: Vec::new(),
            head: 0,
            last_access: now,
        }
    }

    /// Write `bytes` at stream `offset` and advance the contiguous head.
    ///
    /// Bytes that were already received keep their first value.
    pub fn write(&mut self, offset: u64, bytes: &[u8]) -> WriteOutcome {
        if offset > MAX_CRYPTO_OFFSET {
            return WriteOutcome::OutOfBounds;
        }
        let start = offset as usize;
        let end = start + bytes.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
            self.received.resize(end, false);
        }

        for (i, &b) in bytes.iter().enumerate() {
            let at = start + i;
            if !self.received[at] {
                self.data[at] = b;
                self.received[at] = true;
            }
        }

        while self.head < self.received.len() && self.received[self.head] {
            self.head += 1;
        }

        if self.data.len() > MAX_CRYPTO_BUFFER {
            WriteOutcome::Overflow
        } else {
            WriteOutcome::Written
        }
    }

    /// Length of the fully received prefix
    pub fn head(&self) -> usize {
        self.head
    }

    /// Highest byte written so far
    pub fn high_water(&self) -> usize {
        self.data.len()
    }

    /// Bytes `[0, head)`
    pub fn contiguous(&self) -> &[u8] {
        &self.data[..self.head]
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_access = now;
    }

    pub fn last_access(&self) -> Instant {
        self.last_access
    }

    /// Whether the entry has been idle longer than `ttl` at `now`
    pub fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.last_access) > ttl
    }
}

/// A cache entry shared between the store and a writer
pub type SharedEntry = Arc<Mutex<ReassemblyEntry>>;

fn lock_entry(entry: &Mutex<ReassemblyEntry>) -> MutexGuard<'_, ReassemblyEntry> {
    entry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Key space of the cache.
///
/// Implementations decide how the top-level map is synchronised; each entry
/// carries its own lock so writers to different connections never wait on
/// each other's reassembly work.
pub trait EntryStore: Send + Sync {
    /// Fetch the entry for `key`, inserting an empty one stamped `now`
    fn get_or_create(&self, key: &[u8], now: Instant) -> SharedEntry;

    /// Remove every entry for which `pred` returns true; returns how many.
    ///
    /// `pred` may run without the key space locked, so an entry replaced
    /// while it runs is kept.
    fn delete_if(&self, pred: &mut dyn FnMut(&[u8], &ReassemblyEntry) -> bool) -> usize;

    /// Remove one key; returns whether it was present
    fn remove(&self, key: &[u8]) -> bool {
        self.delete_if(&mut |k, _| k == key) > 0
    }

    fn len(&self) -> usize;
}

/// `RwLock<HashMap>` store: lookups share a read lock, inserts and deletes
/// take the write lock briefly.
#[derive(Debug, Default)]
pub struct LockedMap {
    entries: RwLock<HashMap<Vec<u8>, SharedEntry>>,
}

impl LockedMap {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EntryStore for LockedMap {
    fn get_or_create(&self, key: &[u8], now: Instant) -> SharedEntry {
        {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = entries.get(key) {
                return Arc::clone(entry);
            }
        }
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            entries
                .entry(key.to_vec())
                .or_insert_with(|| Arc::new(Mutex::new(ReassemblyEntry::new(now)))),
        )
    }

    fn delete_if(&self, pred: &mut dyn FnMut(&[u8], &ReassemblyEntry) -> bool) -> usize {
        let snapshot: Vec<(Vec<u8>, SharedEntry)> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(key, entry)| (key.clone(), Arc::clone(entry)))
            .collect();

        // entry locks are taken with no map lock held
        let doomed: Vec<(Vec<u8>, SharedEntry)> = snapshot
            .into_iter()
            .filter(|(key, entry)| pred(key.as_slice(), &*lock_entry(entry)))
            .collect();
        if doomed.is_empty() {
            return 0;
        }

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let mut removed = 0;
        for (key, entry) in doomed {
            // a key recreated since the snapshot belongs to a new connection
            if entries.get(&key).is_some_and(|current| Arc::ptr_eq(current, &entry)) {
                entries.remove(&key);
                removed += 1;
            }
        }
        removed
    }

    fn remove(&self, key: &[u8]) -> bool {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some()
    }

    fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

struct Sweeper {
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

/// CRYPTO reassembly cache keyed by DCID.
///
/// Constructed explicitly and shared by `Arc`; the background sweep is tied
/// to [`ReassemblyCache::start`] and [`ReassemblyCache::stop`].
pub struct ReassemblyCache<S: EntryStore = LockedMap> {
    store: S,
    limits: CacheLimits,
    sweeper: Mutex<Option<Sweeper>>,
}

impl ReassemblyCache<LockedMap> {
    pub fn new(limits: CacheLimits) -> Self {
        Self::with_store(LockedMap::new(), limits)
    }
}

impl Default for ReassemblyCache<LockedMap> {
    fn default() -> Self {
        Self::new(CacheLimits::default())
    }
}

impl<S: EntryStore> ReassemblyCache<S> {
    pub fn with_store(store: S, limits: CacheLimits) -> Self {
        Self {
            store,
            limits,
            sweeper: Mutex::new(None),
        }
    }

    pub fn limits(&self) -> &CacheLimits {
        &self.limits
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Feed a decrypted Initial payload for connection `dcid`.
    ///
    /// Writes every CRYPTO frame the walk yields and returns a copy of the
    /// contiguous prefix, or `None` while nothing from offset 0 is complete.
    /// An entry that overflows is deleted and reported as `None`.
    pub fn assemble(&self, dcid: &[u8], plaintext: &[u8]) -> Option<Vec<u8>> {
        let now = Instant::now();
        let entry = self.store.get_or_create(dcid, now);

        let prefix = {
            let mut entry = lock_entry(&entry);
            entry.touch(now);

            let mut overflow = false;
            for frame in FrameWalk::new(plaintext) {
                match entry.write(frame.offset, frame.data) {
                    WriteOutcome::Written => {}
                    WriteOutcome::OutOfBounds => {
                        log::trace!("CRYPTO frame at offset {} out of bounds", frame.offset);
                    }
                    WriteOutcome::Overflow => {
                        overflow = true;
                        break;
                    }
                }
            }

            if overflow {
                None
            } else {
                Some(entry.contiguous().to_vec())
            }
        };

        // entry lock released before touching the key space
        match prefix {
            None => {
                log::debug!(
                    "dropping reassembly entry {}: buffer over {} bytes",
                    hex::encode(dcid),
                    MAX_CRYPTO_BUFFER
                );
                self.store.remove(dcid);
                None
            }
            Some(prefix) if prefix.is_empty() => None,
            Some(prefix) => Some(prefix),
        }
    }

    /// Forget connection `dcid`
    pub fn clear(&self, dcid: &[u8]) -> bool {
        self.store.remove(dcid)
    }

    /// Run one eviction pass now
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// Run one eviction pass as if the time were `now`.
    ///
    /// Removes entries idle past the TTL, then trims arbitrary entries until
    /// the count is at most `max_entries`. No LRU order is kept.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let ttl = self.limits.ttl;
        let expired = self
            .store
            .delete_if(&mut |_, entry| entry.is_expired(now, ttl));

        let mut excess = self.store.len().saturating_sub(self.limits.max_entries);
        let trimmed = if excess > 0 {
            self.store.delete_if(&mut |_, _| {
                if excess > 0 {
                    excess -= 1;
                    true
                } else {
                    false
                }
            })
        } else {
            0
        };

        if expired + trimmed > 0 {
            log::debug!(
                "reassembly sweep: {} expired, {} over capacity, {} remain",
                expired,
                trimmed,
                self.store.len()
            );
        }
        expired + trimmed
    }

    /// Whether the background sweep is running
    pub fn is_running(&self) -> bool {
        self.sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|s| !s.task.is_finished())
    }
}

impl<S: EntryStore + 'static> ReassemblyCache<S> {
    /// Spawn the periodic sweep on the current tokio runtime.
    ///
    /// The task holds only a weak reference, so dropping the last `Arc` ends
    /// it. Calling `start` while running does nothing.
    pub fn start(self: &Arc<Self>) -> Result<(), MangleError> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| MangleError::Runtime(e.to_string()))?;

        let mut sweeper = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if sweeper.as_ref().is_some_and(|s| !s.task.is_finished()) {
            return Ok(());
        }

        let weak = Arc::downgrade(self);
        let shutdown = Arc::new(Notify::new());
        let signal = Arc::clone(&shutdown);
        // interval() panics on a zero period
        let period = self.limits.sweep_interval.max(Duration::from_millis(1));

        let task = handle.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = signal.notified() => break,
                    _ = ticker.tick() => {
                        let Some(cache) = weak.upgrade() else { break };
                        cache.sweep();
                    }
                }
            }
            log::debug!("reassembly sweeper stopped");
        });

        log::info!(
            "reassembly sweeper started (every {}, ttl {}, max {} entries)",
            humantime::format_duration(period),
            humantime::format_duration(self.limits.ttl),
            self.limits.max_entries
        );
        *sweeper = Some(Sweeper { shutdown, task });
        Ok(())
    }

    /// Stop the background sweep and wait for it to exit
    pub async fn stop(&self) {
        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sweeper) = sweeper {
            sweeper.shutdown.notify_one();
            if let Err(e) = sweeper.task.await {
                if !e.is_cancelled() {
                    log::warn!("reassembly sweeper ended abnormally: {}", e);
                }
            }
        }
    }
}

impl<S: EntryStore> Drop for ReassemblyCache<S> {
    fn drop(&mut self) {
        let sweeper = self
            .sweeper
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sweeper) = sweeper {
            sweeper.task.abort();
        }
    }
}

impl<S: EntryStore> std::fmt::Debug for ReassemblyCache<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReassemblyCache")
            .field("entries", &self.store.len())
            .field("limits", &self.limits)
            .finish()
    }
}
