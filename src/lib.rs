mod catalog;
mod core;
mod engine;
mod index;
mod query;
mod storage;
mod txn;

pub use crate::catalog::{Catalog, CollectionMeta, IndexMeta, SequenceMeta, ViewMeta};
pub use crate::core::codec::{decode_document, encode_document};
pub use crate::core::errors::NovusError;
pub use crate::core::value::{Document, Value};
pub use crate::engine::{CollectionStats, Database, DbStats, ExecResult, IndexInfo};
pub use crate::query::ast::{
    AggFunc, BinaryOp, DeleteStmt, Expr, Hint, InsertStmt, Join, OrderKey, SelectItem, SelectStmt,
    SequenceDef, Statement, TableRef, UnaryOp, UpdateStmt,
};
pub use crate::query::plan::{plan_statement, Plan};
pub use crate::storage::cache::CacheStats;
pub use crate::storage::pager::PagerConfig;
