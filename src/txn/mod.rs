//! Transactions: write-set buffering and the single-writer gate.
//!
//! A transaction never touches the data file directly. Every page write
//! lands in an in-memory redo set keyed by page id; reads consult the redo
//! set before the shared pager, so a transaction observes its own writes
//! while readers keep seeing committed state. Commit frames the redo set
//! into the WAL, fsyncs, then installs the pages into the page cache in one
//! batch. Rollback just drops the redo set; allocator state lives in the
//! meta page, which is versioned through the same overlay, so pre-allocated
//! pages return to the free list for free.

pub mod recovery;

use std::collections::BTreeMap;

use parking_lot::{Condvar, Mutex};

use crate::catalog::Catalog;
use crate::core::errors::NovusError;
use crate::storage::page::{Page, PageId};
use crate::storage::pager::{PageIo, Pager};

pub type TxnId = u64;

/// One in-flight transaction: its redo set plus a working copy of the
/// catalog. Both become visible to other threads only at commit.
#[derive(Debug)]
pub struct TxnState {
    pub id: TxnId,
    pub redo: BTreeMap<PageId, Page>,
    pub catalog: Catalog,
}

impl TxnState {
    pub fn new(id: TxnId, catalog: Catalog) -> Self {
        Self {
            id,
            redo: BTreeMap::new(),
            catalog,
        }
    }
}

/// Page overlay: reads hit the redo set first, writes only ever land there.
pub struct TxnPageIo<'a> {
    base: &'a Pager,
    redo: Mutex<&'a mut BTreeMap<PageId, Page>>,
}

impl<'a> TxnPageIo<'a> {
    pub fn new(base: &'a Pager, redo: &'a mut BTreeMap<PageId, Page>) -> Self {
        Self {
            base,
            redo: Mutex::new(redo),
        }
    }
}

impl PageIo for TxnPageIo<'_> {
    fn page_size(&self) -> usize {
        self.base.page_size()
    }

    fn read(&self, id: PageId) -> Result<Page, NovusError> {
        if let Some(page) = self.redo.lock().get(&id) {
            return Ok(page.clone());
        }
        self.base.read(id)
    }

    fn write(&self, page: Page) -> Result<(), NovusError> {
        self.redo.lock().insert(page.id(), page);
        Ok(())
    }
}

/// The writer semaphore: commits are serialized, readers never take it.
/// Built on a Mutex+Condvar pair so the permit can be held across calls
/// (from BEGIN to COMMIT) without keeping a guard alive.
#[derive(Debug, Default)]
pub struct WriterGate {
    locked: Mutex<bool>,
    cv: Condvar,
}

impl WriterGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self) {
        let mut locked = self.locked.lock();
        while *locked {
            self.cv.wait(&mut locked);
        }
        *locked = true;
    }

    pub fn release(&self) {
        let mut locked = self.locked.lock();
        *locked = false;
        self.cv.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::PageType;
    use crate::storage::pager::{allocate_page, PagerConfig, META_PAGE_ID};
    use tempfile::tempdir;

    #[test]
    fn overlay_reads_its_own_writes() {
        let tmp = tempdir().unwrap();
        let pager = Pager::open(tmp.path().join("txn.db"), &PagerConfig::default()).unwrap();
        let mut redo = BTreeMap::new();
        let io = TxnPageIo::new(&pager, &mut redo);

        let id = allocate_page(&io, PageType::RecordHeap).unwrap();
        let mut page = io.read(id).unwrap();
        page.payload_mut()[0] = 0x5a;
        io.write(page).unwrap();

        assert_eq!(io.read(id).unwrap().payload()[0], 0x5a);
        // Nothing reached the shared pager.
        assert!(pager.read(id).is_err());
        assert_eq!(pager.read(META_PAGE_ID).unwrap().meta_next_page_id(), 1);
    }

    #[test]
    fn dropping_redo_set_undoes_allocation() {
        let tmp = tempdir().unwrap();
        let pager = Pager::open(tmp.path().join("txn.db"), &PagerConfig::default()).unwrap();
        {
            let mut redo = BTreeMap::new();
            let io = TxnPageIo::new(&pager, &mut redo);
            allocate_page(&io, PageType::RecordHeap).unwrap();
            assert_eq!(io.read(META_PAGE_ID).unwrap().meta_next_page_id(), 2);
        }
        assert_eq!(pager.read(META_PAGE_ID).unwrap().meta_next_page_id(), 1);
        assert_eq!(pager.free_list_len().unwrap(), 0);
    }

    #[test]
    fn writer_gate_round_trips() {
        let gate = WriterGate::new();
        gate.acquire();
        gate.release();
        gate.acquire();
        gate.release();
    }
}
