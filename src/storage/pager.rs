//! Block-aligned file I/O with a buffered page cache and an explicit
//! free list.
//!
//! The pager presents the database file as an array of fixed-size pages.
//! Reads go through a bounded LRU cache; writes only dirty the cache, and the
//! bytes reach disk on flush or eviction. Page allocation pops the free list
//! threaded through `Free` pages from the meta-page head, or extends the
//! file. All meta-page mutation goes through [`PageIo`], so a transaction
//! overlay captures allocator state changes in its redo set and a rollback
//! restores the free list untouched.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::debug;
use parking_lot::Mutex;

use crate::core::errors::NovusError;
use crate::storage::cache::{CacheStats, PageCache, DEFAULT_CACHE_PAGES};
use crate::storage::page::{Page, PageId, PageType, NO_PAGE};

pub const META_PAGE_ID: PageId = 0;

pub const DEFAULT_PAGE_SIZE: usize = 4096;

#[derive(Debug, Clone)]
pub struct PagerConfig {
    pub page_size: usize,
    pub cache_pages: usize,
    pub fsync_on_commit: bool,
}

impl Default for PagerConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cache_pages: DEFAULT_CACHE_PAGES,
            fsync_on_commit: true,
        }
    }
}

/// Page-granular I/O seam shared by the pager and the transaction overlay.
///
/// The B+Tree, heap, and catalog are written against this trait so the same
/// code path serves committed reads and in-transaction reads through the redo
/// set.
pub trait PageIo: Send + Sync {
    fn page_size(&self) -> usize;
    fn read(&self, id: PageId) -> Result<Page, NovusError>;
    fn write(&self, page: Page) -> Result<(), NovusError>;
}

/// Pop the free list, or extend the file. The fresh page is zero-filled and
/// header-stamped before it is returned.
pub fn allocate_page(io: &dyn PageIo, page_type: PageType) -> Result<PageId, NovusError> {
    let mut meta = io.read(META_PAGE_ID)?;
    let free_head = meta.meta_free_head();
    let id = if free_head != NO_PAGE {
        let free_page = io.read(free_head)?;
        meta.set_meta_free_head(free_page.free_next());
        free_head
    } else {
        let id = meta.meta_next_page_id();
        meta.set_meta_next_page_id(id + 1);
        id
    };
    io.write(meta)?;
    io.write(Page::new(io.page_size(), id, page_type))?;
    debug!("allocated page {id} as {page_type:?}");
    Ok(id)
}

/// Link a page into the free list via the meta-page head. Freeing `NO_PAGE`
/// is a no-op.
pub fn free_page(io: &dyn PageIo, id: PageId) -> Result<(), NovusError> {
    if id == NO_PAGE {
        return Ok(());
    }
    let mut meta = io.read(META_PAGE_ID)?;
    let mut page = Page::new(io.page_size(), id, PageType::Free);
    page.set_free_next(meta.meta_free_head());
    meta.set_meta_free_head(id);
    io.write(page)?;
    io.write(meta)?;
    debug!("freed page {id}");
    Ok(())
}

#[derive(Debug)]
struct PagerInner {
    file: File,
    cache: PageCache,
}

#[derive(Debug)]
pub struct Pager {
    inner: Mutex<PagerInner>,
    path: PathBuf,
    page_size: usize,
}

impl Pager {
    /// Open or create the database file. On create, meta page 0 is written
    /// and fsync'd before the pager is returned.
    pub fn open<P: AsRef<Path>>(path: P, config: &PagerConfig) -> Result<Self, NovusError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let len = file.metadata()?.len();

        let pager = Self {
            inner: Mutex::new(PagerInner {
                file,
                cache: PageCache::new(config.cache_pages),
            }),
            path,
            page_size: config.page_size,
        };

        if len == 0 {
            let mut meta = Page::new(config.page_size, META_PAGE_ID, PageType::Meta);
            meta.init_meta();
            meta.set_meta_page_size(config.page_size as u32);
            pager.write(meta)?;
            pager.flush(true)?;
        } else {
            let meta = pager.read(META_PAGE_ID)?;
            meta.meta_check()?;
            let on_disk = meta.meta_page_size() as usize;
            if on_disk != config.page_size {
                return Err(NovusError::Corruption(format!(
                    "page size mismatch: file has {on_disk}, config wants {}",
                    config.page_size
                )));
            }
        }
        Ok(pager)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.lock().cache.stats()
    }

    /// Write all dirty pages in ascending page id order, optionally fsync.
    pub fn flush(&self, sync: bool) -> Result<(), NovusError> {
        let mut inner = self.inner.lock();
        let PagerInner {
            ref file,
            ref mut cache,
        } = *inner;
        cache.flush(|page| write_block(file, self.page_size, page))?;
        if sync {
            inner.file.sync_all()?;
        }
        Ok(())
    }

    /// Install a batch of sealed pages as dirty cache entries under one lock,
    /// so readers observe a commit atomically.
    pub fn apply_batch(&self, pages: Vec<Page>) -> Result<(), NovusError> {
        let mut inner = self.inner.lock();
        for page in pages {
            let PagerInner {
                ref file,
                ref mut cache,
            } = *inner;
            cache.evict_if_full(|victim| write_block(file, self.page_size, victim))?;
            inner.cache.put(page, true);
        }
        Ok(())
    }

    pub fn allocate(&self, page_type: PageType) -> Result<PageId, NovusError> {
        allocate_page(self, page_type)
    }

    pub fn free(&self, id: PageId) -> Result<(), NovusError> {
        free_page(self, id)
    }

    /// Number of pages currently on the free list.
    pub fn free_list_len(&self) -> Result<usize, NovusError> {
        let mut count = 0;
        let mut id = self.read(META_PAGE_ID)?.meta_free_head();
        while id != NO_PAGE {
            count += 1;
            id = self.read(id)?.free_next();
        }
        Ok(count)
    }

    /// Total pages ever allocated, meta page included.
    pub fn page_count(&self) -> Result<u64, NovusError> {
        Ok(self.read(META_PAGE_ID)?.meta_next_page_id() as u64)
    }

    /// Flush, fsync, release.
    pub fn close(&self) -> Result<(), NovusError> {
        self.flush(true)
    }
}

impl PageIo for Pager {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read(&self, id: PageId) -> Result<Page, NovusError> {
        let mut inner = self.inner.lock();
        if let Some(page) = inner.cache.get(id) {
            return Ok(page);
        }
        let bytes = read_block(&inner.file, self.page_size, id)?;
        let page = Page::from_bytes(bytes)?;
        let PagerInner {
            ref file,
            ref mut cache,
        } = *inner;
        cache.evict_if_full(|victim| write_block(file, self.page_size, victim))?;
        inner.cache.put(page.clone(), false);
        Ok(page)
    }

    fn write(&self, mut page: Page) -> Result<(), NovusError> {
        page.seal();
        let mut inner = self.inner.lock();
        let PagerInner {
            ref file,
            ref mut cache,
        } = *inner;
        cache.evict_if_full(|victim| write_block(file, self.page_size, victim))?;
        inner.cache.put(page, true);
        Ok(())
    }
}

fn read_block(mut file: &File, page_size: usize, id: PageId) -> Result<Vec<u8>, NovusError> {
    let mut buf = vec![0u8; page_size];
    file.seek(SeekFrom::Start(id as u64 * page_size as u64))?;
    file.read_exact(&mut buf)?;
    Ok(buf)
}

fn write_block(mut file: &File, page_size: usize, page: &Page) -> Result<(), NovusError> {
    file.seek(SeekFrom::Start(page.id() as u64 * page_size as u64))?;
    file.write_all(page.bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_pager(path: &Path) -> Pager {
        Pager::open(path, &PagerConfig::default()).unwrap()
    }

    #[test]
    fn create_writes_meta_page() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("pager.db");
        let pager = open_pager(&path);
        let meta = pager.read(META_PAGE_ID).unwrap();
        meta.meta_check().unwrap();
        assert_eq!(meta.meta_next_page_id(), 1);
        assert_eq!(meta.meta_free_head(), NO_PAGE);
    }

    #[test]
    fn allocate_appends_then_reuses_freed() {
        let tmp = tempdir().unwrap();
        let pager = open_pager(&tmp.path().join("pager.db"));

        let a = pager.allocate(PageType::RecordHeap).unwrap();
        let b = pager.allocate(PageType::RecordHeap).unwrap();
        assert_eq!((a, b), (1, 2));

        pager.free(a).unwrap();
        assert_eq!(pager.free_list_len().unwrap(), 1);

        let c = pager.allocate(PageType::IndexLeaf).unwrap();
        assert_eq!(c, a);
        assert_eq!(pager.free_list_len().unwrap(), 0);
    }

    #[test]
    fn write_survives_flush_and_reopen() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("pager.db");
        {
            let pager = open_pager(&path);
            let id = pager.allocate(PageType::RecordHeap).unwrap();
            let mut page = pager.read(id).unwrap();
            page.payload_mut()[0..4].copy_from_slice(b"data");
            pager.write(page).unwrap();
            pager.close().unwrap();
        }
        let pager = open_pager(&path);
        let page = pager.read(1).unwrap();
        assert_eq!(&page.payload()[0..4], b"data");
    }

    #[test]
    fn torn_write_detected_on_read() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("pager.db");
        {
            let pager = open_pager(&path);
            let id = pager.allocate(PageType::RecordHeap).unwrap();
            assert_eq!(id, 1);
            pager.close().unwrap();
        }
        // Flip a payload byte of page 1 on disk.
        {
            let mut file = OpenOptions::new().write(true).open(&path).unwrap();
            file.seek(SeekFrom::Start(DEFAULT_PAGE_SIZE as u64 + 100))
                .unwrap();
            file.write_all(&[0xff]).unwrap();
        }
        let pager = open_pager(&path);
        assert!(matches!(
            pager.read(1),
            Err(NovusError::Corruption(_))
        ));
    }

    #[test]
    fn page_size_mismatch_rejected() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("pager.db");
        open_pager(&path).close().unwrap();
        let config = PagerConfig {
            page_size: 8192,
            ..PagerConfig::default()
        };
        assert!(Pager::open(&path, &config).is_err());
    }

    #[test]
    fn cache_stats_reflect_traffic() {
        let tmp = tempdir().unwrap();
        let pager = open_pager(&tmp.path().join("pager.db"));
        let id = pager.allocate(PageType::RecordHeap).unwrap();
        pager.flush(false).unwrap();

        pager.read(id).unwrap();
        let stats = pager.cache_stats();
        assert!(stats.hits >= 1);
        assert_eq!(stats.capacity, DEFAULT_CACHE_PAGES);
    }
}
