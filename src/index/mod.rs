//! Secondary indexes: a persistent B+Tree per indexed field.
//!
//! Every live record with a non-null scalar value for the indexed field has
//! exactly one entry; null, document, and array values produce none.
//! Duplicates are allowed and tie-break by `record_id`.

pub mod btree;
pub mod key;

use crate::core::errors::NovusError;
use crate::core::value::{Document, Value};
use crate::storage::heap::RecordLoc;
use crate::storage::pager::PageIo;

pub use btree::{BTree, IndexEntry};
pub use key::{indexable_key, key_display, value_to_key, MAX_KEY_LEN};

/// Typed wrapper over one field's tree. The root page travels through the
/// catalog; the engine writes it back after any mutating operation.
#[derive(Debug, Clone)]
pub struct Index {
    pub collection: String,
    pub field: String,
    pub unique: bool,
    pub tree: BTree,
}

impl Index {
    /// Add the entry for one record; returns whether an entry was written.
    pub fn add_record(
        &mut self,
        io: &dyn PageIo,
        doc: &Document,
        record_id: u64,
        loc: RecordLoc,
    ) -> Result<bool, NovusError> {
        let Some(value) = doc.get_path(&self.field) else {
            return Ok(false);
        };
        let Some(key) = indexable_key(value)? else {
            return Ok(false);
        };
        self.tree
            .insert(io, &key, IndexEntry { record_id, loc })?;
        Ok(true)
    }

    /// Remove the entry for one record; absent entries are ignored.
    pub fn remove_record(
        &mut self,
        io: &dyn PageIo,
        doc: &Document,
        record_id: u64,
    ) -> Result<(), NovusError> {
        let Some(value) = doc.get_path(&self.field) else {
            return Ok(());
        };
        let Some(key) = indexable_key(value)? else {
            return Ok(());
        };
        self.tree.remove(io, &key, record_id)
    }

    pub fn seek_value(
        &self,
        io: &dyn PageIo,
        value: &Value,
    ) -> Result<Vec<IndexEntry>, NovusError> {
        match indexable_key(value)? {
            Some(key) => self.tree.lookup(io, &key),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::heap::RecordLoc;
    use crate::storage::pager::{Pager, PagerConfig};
    use tempfile::tempdir;

    fn doc(fields: Vec<(&str, Value)>) -> Document {
        fields
            .into_iter()
            .map(|(n, v)| (n.to_string(), v))
            .collect()
    }

    fn loc(n: u32) -> RecordLoc {
        RecordLoc {
            page_id: n,
            slot: 0,
        }
    }

    #[test]
    fn add_and_seek_by_value() {
        let tmp = tempdir().unwrap();
        let pager = Pager::open(tmp.path().join("idx.db"), &PagerConfig::default()).unwrap();
        let mut index = Index {
            collection: "jobs".into(),
            field: "type".into(),
            unique: false,
            tree: BTree::create(&pager).unwrap(),
        };

        assert!(index
            .add_record(&pager, &doc(vec![("type", Value::from("oracle"))]), 1, loc(10))
            .unwrap());
        assert!(index
            .add_record(&pager, &doc(vec![("type", Value::from("mysql"))]), 2, loc(11))
            .unwrap());
        // Null and missing values produce no entry.
        assert!(!index
            .add_record(&pager, &doc(vec![("type", Value::Null)]), 3, loc(12))
            .unwrap());
        assert!(!index
            .add_record(&pager, &doc(vec![("other", Value::Int(1))]), 4, loc(13))
            .unwrap());

        let hits = index.seek_value(&pager, &Value::from("oracle")).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record_id, 1);
    }

    #[test]
    fn nested_field_paths_index() {
        let tmp = tempdir().unwrap();
        let pager = Pager::open(tmp.path().join("idx.db"), &PagerConfig::default()).unwrap();
        let mut index = Index {
            collection: "jobs".into(),
            field: "params.timeout".into(),
            unique: false,
            tree: BTree::create(&pager).unwrap(),
        };

        let mut d = Document::new();
        d.set_path("params.timeout", Value::Int(30));
        assert!(index.add_record(&pager, &d, 1, loc(20)).unwrap());
        assert_eq!(
            index.seek_value(&pager, &Value::Int(30)).unwrap()[0].record_id,
            1
        );

        index.remove_record(&pager, &d, 1).unwrap();
        assert!(index.seek_value(&pager, &Value::Int(30)).unwrap().is_empty());
    }
}
