//! Introspection, maintenance, and export surfaces of the handle.

use std::collections::BTreeMap;

use log::info;

use crate::core::errors::NovusError;
use crate::core::value::{Document, Value};
use crate::index::btree::BTree;
use crate::query::exec::ExecContext;
use crate::storage::cache::CacheStats;
use crate::storage::heap::{self};
use crate::storage::page::NO_PAGE;
use crate::storage::wal::FrameKind;
use crate::txn::{TxnPageIo, TxnState};

use super::db::Database;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexInfo {
    pub collection: String,
    pub field: String,
    pub unique: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionStats {
    pub name: String,
    pub records: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DbStats {
    /// Pages ever allocated, meta page included.
    pub pages: u64,
    pub free_pages: usize,
    pub cache: CacheStats,
    pub collections: Vec<CollectionStats>,
}

impl Database {
    pub fn list_collections(&self) -> Vec<String> {
        self.shared
            .catalog
            .read()
            .collections
            .iter()
            .map(|c| c.name.clone())
            .collect()
    }

    pub fn list_indexes(&self) -> Vec<IndexInfo> {
        self.shared
            .catalog
            .read()
            .indexes
            .iter()
            .map(|i| IndexInfo {
                collection: i.collection.clone(),
                field: i.field.clone(),
                unique: i.unique,
            })
            .collect()
    }

    /// View names with their original SELECT text.
    pub fn list_views(&self) -> Vec<(String, String)> {
        self.shared
            .catalog
            .read()
            .views
            .iter()
            .map(|v| (v.name.clone(), v.text.clone()))
            .collect()
    }

    pub fn list_sequences(&self) -> Vec<String> {
        self.shared
            .catalog
            .read()
            .sequences
            .iter()
            .map(|s| s.name.clone())
            .collect()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.shared.pager.cache_stats()
    }

    pub fn stats(&self) -> Result<DbStats, NovusError> {
        let catalog = self.shared.catalog.read().clone();
        let mut collections = Vec::with_capacity(catalog.collections.len());
        for meta in &catalog.collections {
            let mut cursor = heap::ScanCursor::new(meta.root_page);
            let mut records = 0;
            while heap::scan_next(&self.shared.pager, &mut cursor)?.is_some() {
                records += 1;
            }
            collections.push(CollectionStats {
                name: meta.name.clone(),
                records,
            });
        }
        Ok(DbStats {
            pages: self.shared.pager.page_count()?,
            free_pages: self.shared.pager.free_list_len()?,
            cache: self.shared.pager.cache_stats(),
            collections,
        })
    }

    /// Observed field types of a collection: one entry per dotted field
    /// path, mapping type name → occurrence count.
    pub fn schema(&self, collection: &str) -> Result<Document, NovusError> {
        let catalog = self.shared.catalog.read();
        let meta = catalog
            .collection(collection)
            .ok_or_else(|| NovusError::Schema(format!("unknown collection: {collection}")))?;
        let root = meta.root_page;
        drop(catalog);

        let mut counts: BTreeMap<String, BTreeMap<&'static str, u64>> = BTreeMap::new();
        let mut cursor = heap::ScanCursor::new(root);
        while let Some((_, _, doc)) = heap::scan_next(&self.shared.pager, &mut cursor)? {
            observe_types(&doc, "", &mut counts);
        }

        let mut out = Document::new();
        for (path, types) in counts {
            let mut per_type = Document::new();
            for (type_name, count) in types {
                per_type.insert(type_name, Value::Int(count as i64));
            }
            out.insert(path, Value::Doc(per_type));
        }
        Ok(out)
    }

    /// Render the whole database as executable SQL text.
    pub fn dump(&self) -> Result<String, NovusError> {
        let catalog = self.shared.catalog.read().clone();
        let mut out = String::new();

        for seq in &catalog.sequences {
            out.push_str(&format!(
                "CREATE SEQUENCE {} START WITH {} INCREMENT BY {}{};\n",
                seq.name,
                seq.current,
                seq.increment,
                if seq.cycle { " CYCLE" } else { "" }
            ));
        }
        for view in &catalog.views {
            out.push_str(&format!("CREATE VIEW {} AS {};\n", view.name, view.text));
        }
        for index in &catalog.indexes {
            out.push_str(&format!(
                "CREATE {}INDEX ON {} ({});\n",
                if index.unique { "UNIQUE " } else { "" },
                index.collection,
                index.field
            ));
        }
        for meta in &catalog.collections {
            let mut cursor = heap::ScanCursor::new(meta.root_page);
            while let Some((_, _, doc)) = heap::scan_next(&self.shared.pager, &mut cursor)? {
                let mut assignments = Vec::new();
                render_assignments(&doc, "", &mut assignments);
                out.push_str(&format!(
                    "INSERT INTO {} VALUES ({});\n",
                    meta.name,
                    assignments.join(", ")
                ));
            }
        }
        Ok(out)
    }

    /// Rewrite every collection's heap without tombstones and rebuild its
    /// indexes by bulk load. Returns the number of reclaimed records;
    /// running it twice reclaims zero the second time.
    pub fn vacuum(&self) -> Result<usize, NovusError> {
        if self.shared.active.lock().is_some() {
            return Err(NovusError::Transaction(
                "vacuum inside an active transaction".into(),
            ));
        }
        self.shared.writer.acquire();
        let outcome = (|| -> Result<_, NovusError> {
            let id = self.next_txn_id();
            self.shared.wal.lock().append(id, FrameKind::BeginTxn, 0, &[])?;
            let mut txn = TxnState::new(id, self.shared.catalog.read().clone());
            let reclaimed = {
                let io = TxnPageIo::new(&self.shared.pager, &mut txn.redo);
                let mut cx = ExecContext {
                    io: &io,
                    catalog: &mut txn.catalog,
                };
                vacuum_all(&mut cx)?
            };
            self.commit_txn(txn)?;
            info!("vacuum reclaimed {reclaimed} record(s)");
            Ok(reclaimed)
        })();
        self.shared.writer.release();
        outcome
    }
}

fn vacuum_all(cx: &mut ExecContext) -> Result<usize, NovusError> {
    let io = cx.io;
    let names: Vec<String> = cx
        .catalog
        .collections
        .iter()
        .map(|c| c.name.clone())
        .collect();
    let mut reclaimed = 0usize;

    for name in names {
        let root = cx.catalog.collection(&name).expect("collection listed").root_page;
        let tombstones = heap::tombstone_count(io, root)?;
        if tombstones == 0 {
            continue;
        }
        reclaimed += tombstones;

        let mut live: Vec<(u64, Document)> = Vec::new();
        let mut cursor = heap::ScanCursor::new(root);
        while let Some((record_id, _, doc)) = heap::scan_next(io, &mut cursor)? {
            live.push((record_id, doc));
        }
        heap::free_chain(io, root)?;

        let meta = cx.catalog.collection_mut(&name).expect("collection listed");
        meta.root_page = NO_PAGE;
        meta.last_page = NO_PAGE;
        let mut state = meta.heap_state();
        let mut relocated: Vec<(u64, heap::RecordLoc, Document)> =
            Vec::with_capacity(live.len());
        for (record_id, doc) in live {
            let loc = heap::insert(io, &mut state, record_id, &doc)?;
            relocated.push((record_id, loc, doc));
        }
        cx.catalog
            .collection_mut(&name)
            .expect("collection listed")
            .set_heap_state(state);

        // Rebuild every index of the collection from the new locations.
        let index_metas: Vec<crate::catalog::IndexMeta> =
            cx.catalog.indexes_of(&name).cloned().collect();
        for index_meta in index_metas {
            BTree::open(index_meta.root_page).free(io)?;
            let mut entries: Vec<(Vec<u8>, crate::index::IndexEntry)> = Vec::new();
            for (record_id, loc, doc) in &relocated {
                if let Some(value) = doc.get_path(&index_meta.field) {
                    if let Some(key) = crate::index::key::indexable_key(value)? {
                        entries.push((
                            key,
                            crate::index::IndexEntry {
                                record_id: *record_id,
                                loc: *loc,
                            },
                        ));
                    }
                }
            }
            entries.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.record_id.cmp(&b.1.record_id)));
            let tree = BTree::bulk_load(io, &entries)?;
            cx.catalog
                .index_of_mut(&index_meta.collection, &index_meta.field)
                .expect("index present")
                .root_page = tree.root;
        }
    }
    Ok(reclaimed)
}

fn observe_types(
    doc: &Document,
    prefix: &str,
    counts: &mut BTreeMap<String, BTreeMap<&'static str, u64>>,
) {
    for (name, value) in doc.iter() {
        let path = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}.{name}")
        };
        *counts
            .entry(path.clone())
            .or_default()
            .entry(value.type_name())
            .or_insert(0) += 1;
        if let Value::Doc(nested) = value {
            observe_types(nested, &path, counts);
        }
    }
}

/// Flatten a document into `path=literal` assignments; nested documents
/// recurse into dotted paths, arrays render inline.
fn render_assignments(doc: &Document, prefix: &str, out: &mut Vec<String>) {
    for (name, value) in doc.iter() {
        let path = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}.{name}")
        };
        match value {
            Value::Doc(nested) if !nested.is_empty() => {
                render_assignments(nested, &path, out)
            }
            other => out.push(format!("{path}={}", render_literal(other))),
        }
    }
}

fn render_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => {
            if f.fract() == 0.0 && f.is_finite() {
                format!("{f:.1}")
            } else {
                f.to_string()
            }
        }
        Value::Str(s) => format!("{s:?}"),
        Value::Doc(_) => "{}".to_string(),
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(render_literal).collect();
            format!("[{}]", rendered.join(", "))
        }
    }
}
