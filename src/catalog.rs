//! Persisted metadata: collections, indexes, sequences, views.
//!
//! The catalog is one serde-serialized document rooted at the meta page's
//! `catalog_root` pointer, spilling across a chain of `Overflow` pages. DDL
//! and id-counter updates mutate a working copy inside the transaction and
//! are saved through the same page overlay as data, so catalog changes
//! commit, roll back, and recover together with the structural change.

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::core::errors::NovusError;
use crate::query::ast::SelectStmt;
use crate::storage::heap::HeapState;
use crate::storage::page::{Page, PageId, PageType, NO_PAGE};
use crate::storage::pager::{allocate_page, free_page, PageIo, META_PAGE_ID};

const CHAIN_HEADER: usize = 6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionMeta {
    pub name: String,
    pub root_page: PageId,
    /// Insertion hint: last page of the heap chain.
    pub last_page: PageId,
    pub id_counter: u64,
}

impl CollectionMeta {
    pub fn heap_state(&self) -> HeapState {
        HeapState {
            root: self.root_page,
            last: self.last_page,
        }
    }

    pub fn set_heap_state(&mut self, state: HeapState) {
        self.root_page = state.root;
        self.last_page = state.last;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMeta {
    pub collection: String,
    pub field: String,
    pub root_page: PageId,
    pub unique: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceMeta {
    pub name: String,
    pub current: i64,
    pub increment: i64,
    pub min_value: i64,
    pub max_value: i64,
    pub cycle: bool,
    /// False until the first NEXTVAL; CURRVAL then reads the start value.
    pub started: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewMeta {
    pub name: String,
    /// Original SELECT text, kept for introspection and dump.
    pub text: String,
    /// Resolved statement, inlined by the planner on reference.
    pub select: SelectStmt,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Catalog {
    pub collections: Vec<CollectionMeta>,
    pub indexes: Vec<IndexMeta>,
    pub sequences: Vec<SequenceMeta>,
    pub views: Vec<ViewMeta>,
}

impl Catalog {
    pub fn collection(&self, name: &str) -> Option<&CollectionMeta> {
        self.collections.iter().find(|c| c.name == name)
    }

    pub fn collection_mut(&mut self, name: &str) -> Option<&mut CollectionMeta> {
        self.collections.iter_mut().find(|c| c.name == name)
    }

    /// Collections spring into existence on first insert.
    pub fn ensure_collection(&mut self, name: &str) -> &mut CollectionMeta {
        if let Some(idx) = self.collections.iter().position(|c| c.name == name) {
            return &mut self.collections[idx];
        }
        self.collections.push(CollectionMeta {
            name: name.to_string(),
            root_page: NO_PAGE,
            last_page: NO_PAGE,
            id_counter: 0,
        });
        self.collections.last_mut().expect("just pushed")
    }

    pub fn drop_collection(&mut self, name: &str) -> Option<CollectionMeta> {
        let idx = self.collections.iter().position(|c| c.name == name)?;
        self.indexes.retain(|i| i.collection != name);
        Some(self.collections.remove(idx))
    }

    pub fn indexes_of<'a>(&'a self, collection: &'a str) -> impl Iterator<Item = &'a IndexMeta> {
        self.indexes.iter().filter(move |i| i.collection == collection)
    }

    pub fn index_of(&self, collection: &str, field: &str) -> Option<&IndexMeta> {
        self.indexes
            .iter()
            .find(|i| i.collection == collection && i.field == field)
    }

    pub fn index_of_mut(&mut self, collection: &str, field: &str) -> Option<&mut IndexMeta> {
        self.indexes
            .iter_mut()
            .find(|i| i.collection == collection && i.field == field)
    }

    pub fn remove_index(&mut self, collection: &str, field: &str) -> Option<IndexMeta> {
        let idx = self
            .indexes
            .iter()
            .position(|i| i.collection == collection && i.field == field)?;
        Some(self.indexes.remove(idx))
    }

    pub fn sequence(&self, name: &str) -> Option<&SequenceMeta> {
        self.sequences.iter().find(|s| s.name == name)
    }

    pub fn sequence_mut(&mut self, name: &str) -> Option<&mut SequenceMeta> {
        self.sequences.iter_mut().find(|s| s.name == name)
    }

    pub fn view(&self, name: &str) -> Option<&ViewMeta> {
        self.views.iter().find(|v| v.name == name)
    }

    /// Load from the chain rooted at the meta page; a fresh file has no
    /// chain and loads the default empty catalog.
    pub fn load(io: &dyn PageIo) -> Result<Catalog, NovusError> {
        let meta = io.read(META_PAGE_ID)?;
        let mut id = meta.meta_catalog_root();
        if id == NO_PAGE {
            return Ok(Catalog::default());
        }
        let mut bytes = Vec::new();
        while id != NO_PAGE {
            let page = io.read(id)?;
            let payload = page.payload();
            let next = LittleEndian::read_u32(&payload[0..4]);
            let len = LittleEndian::read_u16(&payload[4..6]) as usize;
            bytes.extend_from_slice(&payload[CHAIN_HEADER..CHAIN_HEADER + len]);
            id = next;
        }
        let catalog = serde_json::from_slice(&bytes)?;
        Ok(catalog)
    }

    /// Serialize over the existing chain, growing or shrinking it as needed,
    /// and point the meta page at the head.
    pub fn save(&self, io: &dyn PageIo) -> Result<(), NovusError> {
        let bytes = serde_json::to_vec(self)?;
        let chunk_cap = io.page_size() - crate::storage::page::PAGE_HEADER_SIZE - CHAIN_HEADER;

        let mut meta = io.read(META_PAGE_ID)?;

        // Reusable pages from the current chain.
        let mut existing = Vec::new();
        let mut id = meta.meta_catalog_root();
        while id != NO_PAGE {
            let page = io.read(id)?;
            existing.push(id);
            id = LittleEndian::read_u32(&page.payload()[0..4]);
        }

        let chunks: Vec<&[u8]> = bytes.chunks(chunk_cap).collect();
        let mut ids = Vec::with_capacity(chunks.len());
        for i in 0..chunks.len() {
            match existing.get(i) {
                Some(id) => ids.push(*id),
                None => ids.push(allocate_page(io, PageType::Overflow)?),
            }
        }
        for extra in existing.iter().skip(chunks.len()) {
            free_page(io, *extra)?;
        }

        for (i, chunk) in chunks.iter().enumerate() {
            let mut page = Page::new(io.page_size(), ids[i], PageType::Overflow);
            let next = ids.get(i + 1).copied().unwrap_or(NO_PAGE);
            let payload = page.payload_mut();
            LittleEndian::write_u32(&mut payload[0..4], next);
            LittleEndian::write_u16(&mut payload[4..6], chunk.len() as u16);
            payload[CHAIN_HEADER..CHAIN_HEADER + chunk.len()].copy_from_slice(chunk);
            io.write(page)?;
        }

        // `save` runs after allocate/free touched the meta page; re-read so
        // the free-list head is not clobbered.
        meta = io.read(META_PAGE_ID)?;
        meta.set_meta_catalog_root(ids.first().copied().unwrap_or(NO_PAGE));
        io.write(meta)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::pager::{Pager, PagerConfig};
    use tempfile::tempdir;

    fn with_pager<F: FnOnce(&Pager)>(f: F) {
        let tmp = tempdir().unwrap();
        let pager = Pager::open(tmp.path().join("cat.db"), &PagerConfig::default()).unwrap();
        f(&pager);
    }

    #[test]
    fn empty_file_loads_default() {
        with_pager(|pager| {
            let catalog = Catalog::load(pager).unwrap();
            assert!(catalog.collections.is_empty());
        });
    }

    #[test]
    fn save_load_roundtrip() {
        with_pager(|pager| {
            let mut catalog = Catalog::default();
            let jobs = catalog.ensure_collection("jobs");
            jobs.id_counter = 41;
            catalog.indexes.push(IndexMeta {
                collection: "jobs".into(),
                field: "type".into(),
                root_page: 9,
                unique: false,
            });
            catalog.sequences.push(SequenceMeta {
                name: "ids".into(),
                current: 100,
                increment: 1,
                min_value: 1,
                max_value: i64::MAX,
                cycle: false,
                started: true,
            });
            catalog.save(pager).unwrap();

            let loaded = Catalog::load(pager).unwrap();
            assert_eq!(loaded, catalog);
        });
    }

    #[test]
    fn large_catalog_spans_pages_and_shrinks_back() {
        with_pager(|pager| {
            let mut catalog = Catalog::default();
            for i in 0..300 {
                catalog.ensure_collection(&format!("collection_with_a_long_name_{i:04}"));
            }
            catalog.save(pager).unwrap();
            assert_eq!(Catalog::load(pager).unwrap(), catalog);

            let small = Catalog::default();
            small.save(pager).unwrap();
            assert_eq!(Catalog::load(pager).unwrap(), small);
            // Shrinking released chain pages back to the free list.
            assert!(pager.free_list_len().unwrap() > 0);
        });
    }

    #[test]
    fn ensure_collection_is_idempotent() {
        let mut catalog = Catalog::default();
        catalog.ensure_collection("jobs").id_counter = 3;
        catalog.ensure_collection("jobs");
        assert_eq!(catalog.collections.len(), 1);
        assert_eq!(catalog.collection("jobs").unwrap().id_counter, 3);
    }

    #[test]
    fn drop_collection_cascades_indexes() {
        let mut catalog = Catalog::default();
        catalog.ensure_collection("jobs");
        catalog.indexes.push(IndexMeta {
            collection: "jobs".into(),
            field: "type".into(),
            root_page: 5,
            unique: false,
        });
        catalog.drop_collection("jobs").unwrap();
        assert!(catalog.index_of("jobs", "type").is_none());
    }
}
