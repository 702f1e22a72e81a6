//! The database handle.
//!
//! `Database` owns the pager, WAL, catalog, and locks, and is safe to share
//! across threads (`Clone` + `Send + Sync`). Statements execute through
//! [`Database::execute`]; `BEGIN`/`COMMIT`/`ROLLBACK` are intercepted here,
//! everything else runs inside the active transaction, or as a one-statement
//! autocommit transaction. Pure reads run directly against committed state
//! without touching the writer gate.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info};
use parking_lot::{Mutex, RwLock};

use crate::catalog::Catalog;
use crate::core::errors::NovusError;
use crate::core::value::Value;
use crate::query::ast::{SelectStmt, Statement};
use crate::query::exec::{run_statement, ExecContext};
use crate::storage::page::Page;
use crate::storage::pager::{Pager, PagerConfig};
use crate::storage::wal::{FrameKind, Wal};
use crate::txn::recovery;
use crate::txn::{TxnPageIo, TxnState, WriterGate};

/// Statement result: documents for queries, counters for writes.
pub use crate::query::exec::ExecOutcome as ExecResult;

pub(crate) struct Shared {
    pub(crate) pager: Pager,
    pub(crate) wal: Mutex<Wal>,
    pub(crate) catalog: RwLock<Catalog>,
    pub(crate) writer: WriterGate,
    pub(crate) active: Mutex<Option<TxnState>>,
    next_txn: AtomicU64,
    /// Per-collection and per-index lock registry, keyed `"c:<name>"` /
    /// `"i:<collection>.<field>"`.
    locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
    pub(crate) fsync_on_commit: bool,
}

impl Drop for Shared {
    fn drop(&mut self) {
        // Committed dirty pages are WAL-protected; flushing here just saves
        // a replay on the next open. An uncommitted transaction dies with
        // the handle, which is the rollback semantics anyway.
        let _ = self.pager.flush(true);
    }
}

#[derive(Clone)]
pub struct Database {
    pub(crate) shared: Arc<Shared>,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, NovusError> {
        Self::open_with(path, PagerConfig::default())
    }

    pub fn open_with<P: AsRef<Path>>(path: P, config: PagerConfig) -> Result<Self, NovusError> {
        let path = path.as_ref().to_path_buf();
        let pager = Pager::open(&path, &config)?;
        let mut wal = Wal::open(wal_path(&path))?;
        let summary = recovery::recover(&pager, &mut wal)?;
        let catalog = Catalog::load(&pager)?;
        info!(
            "opened {} ({} collection(s), {} redo page(s) recovered)",
            path.display(),
            catalog.collections.len(),
            summary.pages_applied
        );
        Ok(Self {
            shared: Arc::new(Shared {
                pager,
                wal: Mutex::new(wal),
                catalog: RwLock::new(catalog),
                writer: WriterGate::new(),
                active: Mutex::new(None),
                next_txn: AtomicU64::new(1),
                locks: Mutex::new(HashMap::new()),
                fsync_on_commit: config.fsync_on_commit,
            }),
        })
    }

    /// Execute a resolved statement.
    pub fn execute(&self, stmt: Statement) -> Result<ExecResult, NovusError> {
        self.execute_with(stmt, &[])
    }

    /// Execute with positional `?` parameters.
    pub fn execute_with(
        &self,
        stmt: Statement,
        params: &[Value],
    ) -> Result<ExecResult, NovusError> {
        let stmt = stmt.bind(params)?;
        match stmt {
            Statement::Begin => self.begin(),
            Statement::Commit => self.commit(),
            Statement::Rollback => self.rollback(),
            stmt => self.run(stmt),
        }
    }

    pub(crate) fn next_txn_id(&self) -> u64 {
        self.shared.next_txn.fetch_add(1, Ordering::Relaxed)
    }

    fn begin(&self) -> Result<ExecResult, NovusError> {
        if self.shared.active.lock().is_some() {
            return Err(NovusError::Transaction(
                "BEGIN inside an active transaction".into(),
            ));
        }
        self.shared.writer.acquire();
        let outcome = (|| -> Result<_, NovusError> {
            let id = self.next_txn_id();
            self.shared.wal.lock().append(id, FrameKind::BeginTxn, 0, &[])?;
            let catalog = self.shared.catalog.read().clone();
            *self.shared.active.lock() = Some(TxnState::new(id, catalog));
            debug!("txn {id} begun");
            Ok(ExecResult::default())
        })();
        if outcome.is_err() {
            self.shared.writer.release();
        }
        outcome
    }

    fn commit(&self) -> Result<ExecResult, NovusError> {
        let Some(txn) = self.shared.active.lock().take() else {
            return Err(NovusError::Transaction("COMMIT without BEGIN".into()));
        };
        let id = txn.id;
        let outcome = self.commit_txn(txn);
        self.shared.writer.release();
        debug!("txn {id} committed");
        outcome.map(|_| ExecResult::default())
    }

    fn rollback(&self) -> Result<ExecResult, NovusError> {
        let Some(txn) = self.shared.active.lock().take() else {
            return Err(NovusError::Transaction("ROLLBACK without BEGIN".into()));
        };
        let _ = self
            .shared
            .wal
            .lock()
            .append(txn.id, FrameKind::AbortTxn, 0, &[]);
        self.shared.writer.release();
        debug!("txn {} rolled back", txn.id);
        Ok(ExecResult::default())
    }

    /// Frame the redo set, fsync the WAL, install the pages and catalog,
    /// then (policy permitting) flush and truncate the log.
    pub(crate) fn commit_txn(&self, mut txn: TxnState) -> Result<(), NovusError> {
        {
            let io = TxnPageIo::new(&self.shared.pager, &mut txn.redo);
            txn.catalog.save(&io)?;
        }
        let TxnState { id, redo, catalog } = txn;
        let mut pages: Vec<Page> = redo.into_values().collect();

        let mut wal = self.shared.wal.lock();
        for page in &mut pages {
            let lsn = wal.next_lsn();
            page.set_lsn(lsn as u32);
            page.seal();
            wal.append(id, FrameKind::PagePut, page.id(), page.bytes())?;
        }
        wal.append(id, FrameKind::CommitTxn, 0, &[])?;
        wal.sync()?;

        self.shared.pager.apply_batch(pages)?;
        *self.shared.catalog.write() = catalog;

        if self.shared.fsync_on_commit {
            self.shared.pager.flush(true)?;
            let up_to = wal.next_lsn().saturating_sub(1);
            wal.checkpoint(up_to)?;
        }
        Ok(())
    }

    fn run(&self, stmt: Statement) -> Result<ExecResult, NovusError> {
        // Inside an explicit transaction every statement sees the overlay.
        {
            let mut active = self.shared.active.lock();
            if let Some(txn) = active.as_mut() {
                let keys = self.lock_keys(&stmt, &txn.catalog);
                return self.with_locks(&keys, true, |db| db.exec_in_txn(txn, &stmt));
            }
        }

        if stmt.is_read_only() {
            let mut catalog = self.shared.catalog.read().clone();
            let keys = self.lock_keys(&stmt, &catalog);
            return self.with_locks(&keys, false, |db| {
                let mut cx = ExecContext {
                    io: &db.shared.pager,
                    catalog: &mut catalog,
                };
                run_statement(&stmt, &mut cx)
            });
        }

        // Autocommit: a one-statement transaction.
        self.shared.writer.acquire();
        let outcome = (|| -> Result<_, NovusError> {
            let id = self.next_txn_id();
            self.shared.wal.lock().append(id, FrameKind::BeginTxn, 0, &[])?;
            let catalog = self.shared.catalog.read().clone();
            let mut txn = TxnState::new(id, catalog);
            let keys = self.lock_keys(&stmt, &txn.catalog);
            let result =
                self.with_locks(&keys, true, |db| db.exec_in_txn(&mut txn, &stmt));
            match result {
                Ok(result) => {
                    self.commit_txn(txn)?;
                    Ok(result)
                }
                Err(e) => {
                    let _ = self
                        .shared
                        .wal
                        .lock()
                        .append(id, FrameKind::AbortTxn, 0, &[]);
                    Err(e)
                }
            }
        })();
        self.shared.writer.release();
        outcome
    }

    fn exec_in_txn(
        &self,
        txn: &mut TxnState,
        stmt: &Statement,
    ) -> Result<ExecResult, NovusError> {
        let io = TxnPageIo::new(&self.shared.pager, &mut txn.redo);
        let mut cx = ExecContext {
            io: &io,
            catalog: &mut txn.catalog,
        };
        run_statement(stmt, &mut cx)
    }

    /// Sorted lock keys for the collections (and their indexes) a statement
    /// touches; acquisition in key order keeps lock ordering global.
    fn lock_keys(&self, stmt: &Statement, catalog: &Catalog) -> Vec<String> {
        let mut tables = Vec::new();
        collect_tables(stmt, &mut tables);
        let mut keys = Vec::new();
        for table in &tables {
            keys.push(format!("c:{table}"));
            for index in catalog.indexes_of(table) {
                keys.push(format!("i:{}.{}", index.collection, index.field));
            }
        }
        keys.sort();
        keys.dedup();
        keys
    }

    pub(crate) fn with_locks<R>(
        &self,
        keys: &[String],
        write: bool,
        f: impl FnOnce(&Database) -> R,
    ) -> R {
        let arcs: Vec<Arc<RwLock<()>>> = {
            let mut registry = self.shared.locks.lock();
            keys.iter()
                .map(|key| registry.entry(key.clone()).or_default().clone())
                .collect()
        };
        let mut read_guards = Vec::new();
        let mut write_guards = Vec::new();
        for arc in &arcs {
            if write {
                write_guards.push(arc.write());
            } else {
                read_guards.push(arc.read());
            }
        }
        f(self)
    }

    /// Flush dirty pages, fsync, and truncate the WAL.
    pub fn checkpoint(&self) -> Result<(), NovusError> {
        if self.shared.active.lock().is_some() {
            return Err(NovusError::Transaction(
                "checkpoint inside an active transaction".into(),
            ));
        }
        self.shared.writer.acquire();
        let outcome = (|| -> Result<_, NovusError> {
            self.shared.pager.flush(true)?;
            let mut wal = self.shared.wal.lock();
            let up_to = wal.next_lsn().saturating_sub(1);
            wal.checkpoint(up_to)?;
            Ok(())
        })();
        self.shared.writer.release();
        outcome
    }

    /// Flush and release; further use of clones of this handle is fine, the
    /// call is just an explicit durability point.
    pub fn close(&self) -> Result<(), NovusError> {
        self.checkpoint()
    }
}

fn wal_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".wal");
    PathBuf::from(os)
}

/// Collection names a statement references, views included (their
/// underlying tables resolve when the view inlines at plan time; locking
/// the view name itself is enough because DDL on the view serializes
/// through the writer gate).
fn collect_tables(stmt: &Statement, out: &mut Vec<String>) {
    match stmt {
        Statement::Select(select) => collect_select_tables(select, out),
        Statement::Insert(insert) => {
            out.push(insert.collection.clone());
            if let Some(select) = &insert.select {
                collect_select_tables(select, out);
            }
        }
        Statement::Update(update) => out.push(update.collection.clone()),
        Statement::Delete(delete) => out.push(delete.collection.clone()),
        Statement::CreateIndex { collection, .. } | Statement::DropIndex { collection, .. } => {
            out.push(collection.clone())
        }
        Statement::DropTable { name, .. } | Statement::Truncate { name } => {
            out.push(name.clone())
        }
        Statement::Explain(inner) => collect_tables(inner, out),
        _ => {}
    }
}

fn collect_select_tables(select: &SelectStmt, out: &mut Vec<String>) {
    if let Some(from) = &select.from {
        out.push(from.name.clone());
    }
    for join in &select.joins {
        out.push(join.table.name.clone());
    }
    // Subqueries in expressions.
    let mut probe = select.clone();
    let _ = probe.visit_exprs_mut(&mut |expr| {
        match expr {
            crate::query::ast::Expr::InSelect { select, .. } => {
                collect_select_tables(select, out)
            }
            crate::query::ast::Expr::Subquery(select) => collect_select_tables(select, out),
            _ => {}
        }
        Ok(())
    });
}
