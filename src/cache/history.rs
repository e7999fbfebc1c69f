//! Bounded per-key history of updates.

use crate::error::{CanError, Result};
use crate::types::{Key, Timestamp, Update};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Bookkeeping bytes charged per stored entry on top of the payload.
const ENTRY_OVERHEAD: usize = 48;

/// Bookkeeping bytes charged per key.
const KEY_OVERHEAD: usize = 128;

/// History of one key, ordered by timestamp ascending, unique timestamps.
#[derive(Default)]
struct KeyHistory {
    updates: VecDeque<Arc<Update>>,
    bytes: usize,
    /// Set once compaction has unlinked this history from the key map.
    dead: bool,
}

impl KeyHistory {
    fn entry_size(update: &Update) -> usize {
        ENTRY_OVERHEAD + update.payload.approx_size()
    }

    /// Insert in timestamp order. Returns the signed change in bytes.
    fn insert(&mut self, update: Arc<Update>) -> isize {
        let size = Self::entry_size(&update);

        // Fast path: in-order arrival.
        if self
            .updates
            .back()
            .map_or(true, |last| last.timestamp < update.timestamp)
        {
            self.updates.push_back(update);
            self.bytes += size;
            return size as isize;
        }

        match self
            .updates
            .binary_search_by_key(&update.timestamp, |u| u.timestamp)
        {
            Ok(idx) => {
                let old = Self::entry_size(&self.updates[idx]);
                self.updates[idx] = update;
                self.bytes = self.bytes + size - old;
                size as isize - old as isize
            }
            Err(idx) => {
                self.updates.insert(idx, update);
                self.bytes += size;
                size as isize
            }
        }
    }

    /// Drop entries older than `retention_ms` before the newest entry.
    /// Returns the bytes released.
    fn evict(&mut self, retention_ms: u64) -> usize {
        let cutoff = match self.updates.back() {
            Some(newest) => newest.timestamp.window_start(retention_ms),
            None => return 0,
        };

        let mut released = 0;
        while let Some(front) = self.updates.front() {
            if front.timestamp >= cutoff {
                break;
            }
            released += Self::entry_size(front);
            self.updates.pop_front();
        }
        self.bytes -= released;
        released
    }

    fn newest(&self) -> Option<Timestamp> {
        self.updates.back().map(|u| u.timestamp)
    }

    fn window(&self, window_ms: u64) -> Vec<Arc<Update>> {
        let start = match self.newest() {
            Some(newest) => newest.window_start(window_ms),
            None => return Vec::new(),
        };
        let first = self.updates.partition_point(|u| u.timestamp < start);
        self.updates.range(first..).cloned().collect()
    }
}

/// Cache occupancy.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub key_count: usize,
    pub entry_count: usize,
    pub used_bytes: usize,
    pub ceiling_bytes: usize,
}

/// Time-windowed history of updates per key.
///
/// Keeps up to `retention_ms` of history per key, measured back from the
/// newest entry of that key; older entries are dropped on the next write
/// to the key. New keys are refused once the memory ceiling is reached,
/// while keys already present keep being written and served. Reads of a
/// refused key report [`CanError::MemoryFull`].
pub struct HistoryCache {
    keys: RwLock<HashMap<Key, Arc<Mutex<KeyHistory>>>>,
    /// Keys whose admission was refused by the ceiling.
    refused: RwLock<HashSet<Key>>,
    used_bytes: AtomicUsize,
    ceiling_bytes: usize,
    retention_ms: u64,
}

impl HistoryCache {
    pub fn new(retention_ms: u64, ceiling_bytes: usize) -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
            refused: RwLock::new(HashSet::new()),
            used_bytes: AtomicUsize::new(0),
            ceiling_bytes,
            retention_ms,
        }
    }

    pub fn retention_ms(&self) -> u64 {
        self.retention_ms
    }

    /// Record an update for its key.
    ///
    /// Fails with [`CanError::MemoryFull`] only when the key is new and
    /// admitting it would cross the ceiling.
    pub fn write(&self, update: Arc<Update>) -> Result<()> {
        loop {
            let existing = self.keys.read().get(&update.key).cloned();
            let entry = match existing {
                Some(h) => h,
                None => self.admit_key(&update)?,
            };

            let mut history = entry.lock();
            // Compaction unlinked the entry between the lookup and the lock.
            if history.dead {
                continue;
            }
            let added = history.insert(update);
            let released = history.evict(self.retention_ms);

            // Accounted under the key lock so compaction sees a settled total.
            if added >= 0 {
                self.used_bytes.fetch_add(added as usize, Ordering::Relaxed);
            } else {
                self.used_bytes
                    .fetch_sub(added.unsigned_abs(), Ordering::Relaxed);
            }
            self.used_bytes.fetch_sub(released, Ordering::Relaxed);
            return Ok(());
        }
    }

    fn admit_key(&self, update: &Update) -> Result<Arc<Mutex<KeyHistory>>> {
        let mut keys = self.keys.write();
        // Another writer may have admitted the key meanwhile.
        if let Some(h) = keys.get(&update.key) {
            return Ok(Arc::clone(h));
        }

        let needed = KEY_OVERHEAD + KeyHistory::entry_size(update);
        let used = self.used_bytes.load(Ordering::Relaxed);
        if used + needed > self.ceiling_bytes {
            self.refused.write().insert(update.key);
            return Err(CanError::MemoryFull {
                used,
                ceiling: self.ceiling_bytes,
            });
        }
        self.refused.write().remove(&update.key);

        self.used_bytes.fetch_add(KEY_OVERHEAD, Ordering::Relaxed);
        let history = Arc::new(Mutex::new(KeyHistory::default()));
        keys.insert(update.key, Arc::clone(&history));
        Ok(history)
    }

    /// Updates of `key` no older than `window_ms` before its newest entry,
    /// in timestamp order.
    pub fn read(&self, key: &Key, window_ms: u64) -> Result<Vec<Arc<Update>>> {
        let existing = self.keys.read().get(key).cloned();
        let history = match existing {
            Some(h) => h,
            None if self.refused.read().contains(key) => {
                return Err(CanError::MemoryFull {
                    used: self.used_bytes.load(Ordering::Relaxed),
                    ceiling: self.ceiling_bytes,
                });
            }
            None => return Err(CanError::CacheNotReady(*key)),
        };

        let updates = history.lock().window(window_ms);
        if updates.is_empty() {
            return Err(CanError::CacheNotReady(*key));
        }
        Ok(updates)
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.keys.read().contains_key(key)
    }

    /// Remove keys whose newest entry is older than the retention window
    /// ending at `now`. Returns the bytes reclaimed.
    pub fn compact(&self, now: Timestamp) -> usize {
        let cutoff = now.window_start(self.retention_ms);
        let mut keys = self.keys.write();
        let mut reclaimed = 0;

        keys.retain(|_, history| {
            let mut history = history.lock();
            let live = history.newest().map_or(false, |ts| ts >= cutoff);
            if !live {
                history.dead = true;
                reclaimed += history.bytes + KEY_OVERHEAD;
            }
            live
        });

        self.used_bytes.fetch_sub(reclaimed, Ordering::Relaxed);
        reclaimed
    }

    pub fn stats(&self) -> CacheStats {
        let keys = self.keys.read();
        CacheStats {
            key_count: keys.len(),
            entry_count: keys.values().map(|h| h.lock().updates.len()).sum(),
            used_bytes: self.used_bytes.load(Ordering::Relaxed),
            ceiling_bytes: self.ceiling_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BusName;
    use proptest::prelude::*;

    fn frame(id: u32, ts: u64, byte: u8) -> Arc<Update> {
        Arc::new(Update::frame(BusName(0), id, Timestamp(ts), vec![byte; 8]))
    }

    fn timestamps(updates: &[Arc<Update>]) -> Vec<u64> {
        updates.iter().map(|u| u.timestamp.0).collect()
    }

    #[test]
    fn test_read_unknown_key_not_ready() {
        let cache = HistoryCache::new(10_000, 1 << 20);
        let key = Key::frame(BusName(0), 0x100);
        assert!(matches!(cache.read(&key, 1000), Err(CanError::CacheNotReady(_))));
    }

    #[test]
    fn test_window_is_relative_to_newest() {
        let cache = HistoryCache::new(10_000, 1 << 20);
        for ts in [0, 500, 1000, 1500, 2000] {
            cache.write(frame(0x100, ts, 1)).unwrap();
        }
        let key = Key::frame(BusName(0), 0x100);

        assert_eq!(timestamps(&cache.read(&key, 1000).unwrap()), vec![1000, 1500, 2000]);
        assert_eq!(timestamps(&cache.read(&key, 0).unwrap()), vec![2000]);
        assert_eq!(cache.read(&key, 60_000).unwrap().len(), 5);
    }

    #[test]
    fn test_out_of_order_sorted_and_duplicates_replaced() {
        let cache = HistoryCache::new(10_000, 1 << 20);
        cache.write(frame(0x100, 300, 3)).unwrap();
        cache.write(frame(0x100, 100, 1)).unwrap();
        cache.write(frame(0x100, 200, 2)).unwrap();
        cache.write(frame(0x100, 200, 9)).unwrap();

        let key = Key::frame(BusName(0), 0x100);
        let updates = cache.read(&key, 10_000).unwrap();
        assert_eq!(timestamps(&updates), vec![100, 200, 300]);
        assert_eq!(updates[1].payload, crate::types::Payload::Frame(vec![9; 8]));
    }

    #[test]
    fn test_eviction_on_write() {
        let cache = HistoryCache::new(1000, 1 << 20);
        cache.write(frame(0x100, 0, 1)).unwrap();
        cache.write(frame(0x100, 900, 1)).unwrap();
        cache.write(frame(0x100, 2000, 1)).unwrap();

        let key = Key::frame(BusName(0), 0x100);
        assert_eq!(timestamps(&cache.read(&key, 60_000).unwrap()), vec![2000]);
        assert_eq!(cache.stats().entry_count, 1);
    }

    #[test]
    fn test_memory_full_rejects_new_keys_only() {
        let per_key = KEY_OVERHEAD + ENTRY_OVERHEAD + 8;
        let cache = HistoryCache::new(10_000, per_key * 2);

        cache.write(frame(1, 0, 1)).unwrap();
        cache.write(frame(2, 0, 1)).unwrap();
        let result = cache.write(frame(3, 0, 1));
        assert!(matches!(result, Err(CanError::MemoryFull { .. })));
        assert!(!cache.contains(&Key::frame(BusName(0), 3)));
        assert!(matches!(
            cache.read(&Key::frame(BusName(0), 3), 1000),
            Err(CanError::MemoryFull { .. })
        ));

        // Existing keys keep accepting writes.
        cache.write(frame(1, 10, 2)).unwrap();
        let key = Key::frame(BusName(0), 1);
        assert_eq!(cache.read(&key, 1000).unwrap().len(), 2);
    }

    #[test]
    fn test_compact_reclaims_dead_keys() {
        let cache = HistoryCache::new(1000, 1 << 20);
        cache.write(frame(1, 0, 1)).unwrap();
        cache.write(frame(2, 5000, 1)).unwrap();
        let before = cache.stats().used_bytes;

        let reclaimed = cache.compact(Timestamp(5500));
        assert!(reclaimed > 0);
        assert_eq!(cache.stats().used_bytes, before - reclaimed);
        assert_eq!(cache.stats().key_count, 1);
        assert!(cache.contains(&Key::frame(BusName(0), 2)));
    }

    #[test]
    fn test_byte_accounting_returns_to_zero() {
        let cache = HistoryCache::new(100, 1 << 20);
        for ts in 0..50 {
            cache.write(frame(1, ts * 10, 1)).unwrap();
        }
        cache.compact(Timestamp(10_000));
        assert_eq!(cache.stats().used_bytes, 0);
    }

    #[test]
    fn test_write_racing_compaction_keeps_accounting() {
        let cache = Arc::new(HistoryCache::new(1_000_000, 1 << 30));
        let writer = {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || {
                for ts in 0..5_000 {
                    cache.write(frame(1, ts, 1)).unwrap();
                }
            })
        };
        while !writer.is_finished() {
            cache.compact(Timestamp(u64::MAX));
        }
        writer.join().unwrap();

        cache.compact(Timestamp(u64::MAX));
        let stats = cache.stats();
        assert_eq!(stats.key_count, 0);
        assert_eq!(stats.used_bytes, 0);
    }

    proptest! {
        #[test]
        fn prop_read_sorted_unique_and_within_window(
            stamps in proptest::collection::vec(0u64..5_000, 1..200),
            window in 0u64..3_000,
        ) {
            let cache = HistoryCache::new(2_000, usize::MAX);
            for ts in &stamps {
                cache.write(frame(7, *ts, 0)).unwrap();
            }
            let key = Key::frame(BusName(0), 7);
            let got = timestamps(&cache.read(&key, window).unwrap());

            let newest = *stamps.iter().max().unwrap();
            prop_assert_eq!(*got.last().unwrap(), newest);
            prop_assert!(got.windows(2).all(|w| w[0] < w[1]));
            let start = newest.saturating_sub(window.min(2_000));
            prop_assert!(got.iter().all(|ts| *ts >= start));
        }
    }
}
