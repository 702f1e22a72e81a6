//! Bounded LRU page cache.
//!
//! Keyed by page id; reads return copies, so entries are only mutated by
//! whole-page replacement. Evicting a dirty entry writes it back first.

use std::collections::HashMap;

use crate::core::errors::NovusError;
use crate::storage::page::{Page, PageId};

pub const DEFAULT_CACHE_PAGES: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
    pub capacity: usize,
}

#[derive(Debug)]
struct CacheEntry {
    page: Page,
    dirty: bool,
    last_access: u64,
}

#[derive(Debug)]
pub struct PageCache {
    capacity: usize,
    entries: HashMap<PageId, CacheEntry>,
    access_counter: u64,
    hits: u64,
    misses: u64,
}

impl PageCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            access_counter: 0,
            hits: 0,
            misses: 0,
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            size: self.entries.len(),
            capacity: self.capacity,
        }
    }

    pub fn contains(&self, id: PageId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn get(&mut self, id: PageId) -> Option<Page> {
        let access = self.next_access();
        match self.entries.get_mut(&id) {
            Some(entry) => {
                entry.last_access = access;
                self.hits += 1;
                Some(entry.page.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Insert or replace an entry. A dirty insert stays dirty until flushed
    /// even if a later clean insert lands on the same id.
    pub fn put(&mut self, page: Page, dirty: bool) {
        let access = self.next_access();
        let id = page.id();
        match self.entries.get_mut(&id) {
            Some(entry) => {
                entry.page = page;
                entry.dirty = entry.dirty || dirty;
                entry.last_access = access;
            }
            None => {
                self.entries.insert(
                    id,
                    CacheEntry {
                        page,
                        dirty,
                        last_access: access,
                    },
                );
            }
        }
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    fn lru_id(&self) -> Option<PageId> {
        self.entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_access)
            .map(|(id, _)| *id)
    }

    /// Evict the least-recently-used entry if the cache is at capacity,
    /// writing it back through `write_fn` when dirty.
    pub fn evict_if_full<F>(&mut self, mut write_fn: F) -> Result<(), NovusError>
    where
        F: FnMut(&Page) -> Result<(), NovusError>,
    {
        if !self.is_full() {
            return Ok(());
        }
        let Some(id) = self.lru_id() else {
            return Ok(());
        };
        let entry = self.entries.remove(&id).expect("lru candidate present");
        if entry.dirty {
            if let Err(err) = write_fn(&entry.page) {
                self.entries.insert(id, entry);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Write all dirty entries through `write_fn` in ascending page id order
    /// and mark them clean.
    pub fn flush<F>(&mut self, mut write_fn: F) -> Result<(), NovusError>
    where
        F: FnMut(&Page) -> Result<(), NovusError>,
    {
        let mut dirty_ids: Vec<PageId> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.dirty)
            .map(|(id, _)| *id)
            .collect();
        dirty_ids.sort_unstable();
        for id in dirty_ids {
            let entry = self.entries.get_mut(&id).expect("dirty entry present");
            write_fn(&entry.page)?;
            entry.dirty = false;
        }
        Ok(())
    }

    pub fn dirty_count(&self) -> usize {
        self.entries.values().filter(|e| e.dirty).count()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn next_access(&mut self) -> u64 {
        self.access_counter = self.access_counter.saturating_add(1);
        self.access_counter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::PageType;

    fn page(id: PageId) -> Page {
        Page::new(256, id, PageType::RecordHeap)
    }

    #[test]
    fn get_tracks_hits_and_misses() {
        let mut cache = PageCache::new(4);
        cache.put(page(1), false);
        assert!(cache.get(1).is_some());
        assert!(cache.get(2).is_none());
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 1);
    }

    #[test]
    fn eviction_picks_least_recently_used() {
        let mut cache = PageCache::new(2);
        cache.put(page(1), false);
        cache.put(page(2), false);
        cache.get(1);
        cache.evict_if_full(|_| Ok(())).unwrap();
        assert!(cache.contains(1));
        assert!(!cache.contains(2));
    }

    #[test]
    fn eviction_writes_back_dirty_page() {
        let mut cache = PageCache::new(1);
        cache.put(page(3), true);
        let mut written = Vec::new();
        cache
            .evict_if_full(|p| {
                written.push(p.id());
                Ok(())
            })
            .unwrap();
        assert_eq!(written, vec![3]);
    }

    #[test]
    fn failed_writeback_keeps_entry() {
        let mut cache = PageCache::new(1);
        cache.put(page(5), true);
        let err = cache.evict_if_full(|_| {
            Err(NovusError::Io(std::io::Error::other("disk full")))
        });
        assert!(err.is_err());
        assert!(cache.contains(5));
    }

    #[test]
    fn flush_goes_in_ascending_page_order() {
        let mut cache = PageCache::new(8);
        cache.put(page(9), true);
        cache.put(page(2), true);
        cache.put(page(4), false);
        let mut order = Vec::new();
        cache
            .flush(|p| {
                order.push(p.id());
                Ok(())
            })
            .unwrap();
        assert_eq!(order, vec![2, 9]);
        assert_eq!(cache.dirty_count(), 0);
    }

    #[test]
    fn dirty_flag_sticks_across_clean_put() {
        let mut cache = PageCache::new(4);
        cache.put(page(1), true);
        cache.put(page(1), false);
        assert_eq!(cache.dirty_count(), 1);
    }
}
