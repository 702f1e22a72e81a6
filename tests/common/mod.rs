//! AST builders for the integration tests. The SQL front-end lives outside
//! this crate, so tests hand-assemble the statements it would produce.
#![allow(dead_code)]

use novusdb::{
    BinaryOp, DeleteStmt, Expr, InsertStmt, Join, OrderKey, SelectItem, SelectStmt, Statement,
    TableRef, UpdateStmt, Value,
};

/// RUST_LOG=debug surfaces pager/WAL traffic while debugging a test.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn lit(v: impl Into<Value>) -> Expr {
    Expr::Literal(v.into())
}

pub fn col(path: &str) -> Expr {
    Expr::Column(path.to_string())
}

pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

pub fn eq(path: &str, v: impl Into<Value>) -> Expr {
    binary(BinaryOp::Eq, col(path), lit(v))
}

pub fn insert(table: &str, rows: Vec<Vec<(&str, Expr)>>) -> Statement {
    Statement::Insert(InsertStmt {
        collection: table.to_string(),
        rows: rows
            .into_iter()
            .map(|row| row.into_iter().map(|(k, e)| (k.to_string(), e)).collect())
            .collect(),
        select: None,
        or_replace: false,
    })
}

pub fn insert_row(table: &str, fields: Vec<(&str, Expr)>) -> Statement {
    insert(table, vec![fields])
}

pub fn select_all(table: &str) -> Statement {
    Statement::Select(SelectStmt::scan(table))
}

pub fn select_where(table: &str, filter: Expr) -> Statement {
    Statement::Select(SelectStmt {
        filter: Some(filter),
        ..SelectStmt::scan(table)
    })
}

pub fn select_stmt(select: SelectStmt) -> Statement {
    Statement::Select(select)
}

pub fn projection(expr: Expr) -> SelectItem {
    SelectItem::Expr { expr, alias: None }
}

pub fn aliased(expr: Expr, alias: &str) -> SelectItem {
    SelectItem::Expr {
        expr,
        alias: Some(alias.to_string()),
    }
}

pub fn table(name: &str) -> TableRef {
    TableRef {
        name: name.to_string(),
        alias: None,
    }
}

pub fn aliased_table(name: &str, alias: &str) -> TableRef {
    TableRef {
        name: name.to_string(),
        alias: Some(alias.to_string()),
    }
}

pub fn join_on(name: &str, on: Expr) -> Join {
    Join {
        table: table(name),
        on: Some(on),
    }
}

pub fn order(expr: Expr, desc: bool) -> OrderKey {
    OrderKey { expr, desc }
}

pub fn update(table: &str, sets: Vec<(&str, Expr)>, filter: Option<Expr>) -> Statement {
    Statement::Update(UpdateStmt {
        collection: table.to_string(),
        sets: sets.into_iter().map(|(k, e)| (k.to_string(), e)).collect(),
        filter,
        hints: Vec::new(),
    })
}

pub fn delete(table: &str, filter: Option<Expr>) -> Statement {
    Statement::Delete(DeleteStmt {
        collection: table.to_string(),
        filter,
        hints: Vec::new(),
    })
}

pub fn create_index(table: &str, field: &str) -> Statement {
    Statement::CreateIndex {
        collection: table.to_string(),
        field: field.to_string(),
        unique: false,
        if_not_exists: false,
    }
}

pub fn drop_index(table: &str, field: &str) -> Statement {
    Statement::DropIndex {
        collection: table.to_string(),
        field: field.to_string(),
        if_exists: false,
    }
}

/// Field value of the single expected result document.
pub fn only_doc(result: &novusdb::ExecResult) -> &novusdb::Document {
    let docs = result.docs.as_ref().expect("query returns documents");
    assert_eq!(docs.len(), 1, "expected exactly one document: {docs:?}");
    &docs[0]
}
