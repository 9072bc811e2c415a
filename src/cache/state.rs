//! LRU bookkeeping. The *only* state protected by the cache's mutex —
//! everything else (file bytes, compression) happens with the lock
//! released (spec.md §5: "critical sections are strictly
//! metadata-only").

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;

use crate::tile::TileKey;

#[derive(Debug, Clone)]
pub struct Entry {
    pub dds_path: PathBuf,
    pub ddm_path: PathBuf,
    pub size: u64,
    pub last_access: u64,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub evictions: u64,
    pub heals: u64,
}

/// An insertion/access-ordered map: `order` holds keys from
/// least-to-most-recently-used, mirroring `collections.OrderedDict`'s
/// move-to-end-on-access semantics from the original.
#[derive(Default)]
pub struct CacheState {
    pub entries: HashMap<TileKey, Entry>,
    pub order: VecDeque<TileKey>,
    pub healing_in_progress: HashSet<TileKey>,
    pub total_bytes: u64,
    pub stats: Stats,
    clock: u64,
}

impl CacheState {
    pub fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    pub fn touch(&mut self, key: &TileKey) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        self.order.push_back(key.clone());
        let now = self.tick();
        if let Some(e) = self.entries.get_mut(key) {
            e.last_access = now;
        }
    }

    pub fn insert(&mut self, key: TileKey, entry: Entry) {
        if let Some(old) = self.entries.remove(&key) {
            self.total_bytes = self.total_bytes.saturating_sub(old.size);
            if let Some(pos) = self.order.iter().position(|k| k == &key) {
                self.order.remove(pos);
            }
        }
        self.total_bytes += entry.size;
        self.entries.insert(key.clone(), entry);
        self.order.push_back(key);
    }

    pub fn remove(&mut self, key: &TileKey) -> Option<Entry> {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        let entry = self.entries.remove(key);
        if let Some(e) = &entry {
            self.total_bytes = self.total_bytes.saturating_sub(e.size);
        }
        entry
    }

    /// Pop the oldest `n` entries whose cumulative size is at least
    /// `bytes_to_free`, returning them for deletion outside the lock.
    pub fn pop_oldest_until(&mut self, bytes_to_free: u64) -> Vec<(TileKey, Entry)> {
        let mut freed = 0u64;
        let mut popped = Vec::new();
        while freed < bytes_to_free {
            let Some(key) = self.order.pop_front() else {
                break;
            };
            if let Some(entry) = self.entries.remove(&key) {
                self.total_bytes = self.total_bytes.saturating_sub(entry.size);
                freed += entry.size;
                popped.push((key, entry));
            }
        }
        self.stats.evictions += popped.len() as u64;
        popped
    }

    /// Re-sort the whole ordering by recorded `last_access`, oldest
    /// first — used once after `scan_existing` populates entries out
    /// of access order (it walks the filesystem, not LRU order).
    pub fn resort_by_recency(&mut self) {
        let mut keys: Vec<TileKey> = self.order.drain(..).collect();
        keys.sort_by_key(|k| self.entries.get(k).map(|e| e.last_access).unwrap_or(0));
        self.order = keys.into();
    }
}
