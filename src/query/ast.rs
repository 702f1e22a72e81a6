//! Resolved statement AST.
//!
//! The SQL front-end is an external collaborator; this module is the input
//! contract it compiles into. `?` placeholders arrive as [`Expr::Param`] and
//! are substituted by [`Statement::bind`] before planning. The types are
//! serde-serializable because view definitions persist their resolved AST in
//! the catalog.

use serde::{Deserialize, Serialize};

use crate::core::errors::NovusError;
use crate::core::value::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    Select(SelectStmt),
    Insert(InsertStmt),
    Update(UpdateStmt),
    Delete(DeleteStmt),
    CreateIndex {
        collection: String,
        field: String,
        unique: bool,
        if_not_exists: bool,
    },
    DropIndex {
        collection: String,
        field: String,
        if_exists: bool,
    },
    CreateView {
        name: String,
        text: String,
        select: SelectStmt,
    },
    DropView {
        name: String,
        if_exists: bool,
    },
    CreateSequence(SequenceDef),
    DropSequence {
        name: String,
        if_exists: bool,
    },
    DropTable {
        name: String,
        if_exists: bool,
    },
    Truncate {
        name: String,
    },
    Begin,
    Commit,
    Rollback,
    Explain(Box<Statement>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceDef {
    pub name: String,
    pub start: Option<i64>,
    pub increment: Option<i64>,
    pub min_value: Option<i64>,
    pub max_value: Option<i64>,
    pub cycle: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectStmt {
    pub distinct: bool,
    pub projections: Vec<SelectItem>,
    pub from: Option<TableRef>,
    pub joins: Vec<Join>,
    pub filter: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub having: Option<Expr>,
    pub order_by: Vec<OrderKey>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub hints: Vec<Hint>,
}

impl SelectStmt {
    /// Bare `SELECT * FROM <table>`.
    pub fn scan(table: &str) -> Self {
        Self {
            distinct: false,
            projections: vec![SelectItem::Wildcard],
            from: Some(TableRef {
                name: table.to_string(),
                alias: None,
            }),
            joins: Vec::new(),
            filter: None,
            group_by: Vec::new(),
            having: None,
            order_by: Vec::new(),
            limit: None,
            offset: None,
            hints: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SelectItem {
    Wildcard,
    Expr { expr: Expr, alias: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRef {
    pub name: String,
    pub alias: Option<String>,
}

impl TableRef {
    pub fn binding(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Join {
    pub table: TableRef,
    pub on: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderKey {
    pub expr: Expr,
    pub desc: bool,
}

/// Oracle-style `/*+ ... */` hints, pre-parsed by the front-end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Hint {
    ForceIndex(String),
    FullScan,
    HashJoin,
    NestedLoop,
    /// Advisory only.
    Parallel(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Concat,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Literal(Value),
    /// Dotted path, optionally alias-qualified: `t.a.b`.
    Column(String),
    Param(u16),
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
    Like {
        expr: Box<Expr>,
        pattern: Box<Expr>,
        negated: bool,
    },
    Between {
        expr: Box<Expr>,
        low: Box<Expr>,
        high: Box<Expr>,
        negated: bool,
    },
    InList {
        expr: Box<Expr>,
        list: Vec<Expr>,
        negated: bool,
    },
    InSelect {
        expr: Box<Expr>,
        select: Box<SelectStmt>,
        negated: bool,
    },
    Case {
        operand: Option<Box<Expr>>,
        branches: Vec<(Expr, Expr)>,
        else_expr: Option<Box<Expr>>,
    },
    Func {
        name: String,
        args: Vec<Expr>,
    },
    /// `COUNT(*)` is `arg: None`.
    Agg {
        func: AggFunc,
        arg: Option<Box<Expr>>,
        distinct: bool,
    },
    /// `SYSDATE` / `CURRENT_TIMESTAMP`.
    Sysdate,
    SeqNext(String),
    SeqCurr(String),
    /// Scalar subquery.
    Subquery(Box<SelectStmt>),
}

impl Expr {
    pub fn column(path: &str) -> Self {
        Expr::Column(path.to_string())
    }

    pub fn literal(value: impl Into<Value>) -> Self {
        Expr::Literal(value.into())
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Self {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// Depth-first mutable visit over this expression and every nested
    /// subquery.
    pub fn visit_mut<F>(&mut self, f: &mut F) -> Result<(), NovusError>
    where
        F: FnMut(&mut Expr) -> Result<(), NovusError>,
    {
        f(self)?;
        match self {
            Expr::Literal(_)
            | Expr::Column(_)
            | Expr::Param(_)
            | Expr::Sysdate
            | Expr::SeqNext(_)
            | Expr::SeqCurr(_) => Ok(()),
            Expr::Unary { expr, .. } | Expr::IsNull { expr, .. } => expr.visit_mut(f),
            Expr::Binary { left, right, .. } => {
                left.visit_mut(f)?;
                right.visit_mut(f)
            }
            Expr::Like { expr, pattern, .. } => {
                expr.visit_mut(f)?;
                pattern.visit_mut(f)
            }
            Expr::Between {
                expr, low, high, ..
            } => {
                expr.visit_mut(f)?;
                low.visit_mut(f)?;
                high.visit_mut(f)
            }
            Expr::InList { expr, list, .. } => {
                expr.visit_mut(f)?;
                for item in list {
                    item.visit_mut(f)?;
                }
                Ok(())
            }
            Expr::InSelect { expr, select, .. } => {
                expr.visit_mut(f)?;
                select.visit_exprs_mut(f)
            }
            Expr::Case {
                operand,
                branches,
                else_expr,
            } => {
                if let Some(op) = operand {
                    op.visit_mut(f)?;
                }
                for (when, then) in branches {
                    when.visit_mut(f)?;
                    then.visit_mut(f)?;
                }
                if let Some(e) = else_expr {
                    e.visit_mut(f)?;
                }
                Ok(())
            }
            Expr::Func { args, .. } => {
                for arg in args {
                    arg.visit_mut(f)?;
                }
                Ok(())
            }
            Expr::Agg { arg, .. } => match arg {
                Some(a) => a.visit_mut(f),
                None => Ok(()),
            },
            Expr::Subquery(select) => select.visit_exprs_mut(f),
        }
    }
}

impl SelectStmt {
    pub fn visit_exprs_mut<F>(&mut self, f: &mut F) -> Result<(), NovusError>
    where
        F: FnMut(&mut Expr) -> Result<(), NovusError>,
    {
        for item in &mut self.projections {
            if let SelectItem::Expr { expr, .. } = item {
                expr.visit_mut(f)?;
            }
        }
        for join in &mut self.joins {
            if let Some(on) = &mut join.on {
                on.visit_mut(f)?;
            }
        }
        if let Some(filter) = &mut self.filter {
            filter.visit_mut(f)?;
        }
        for key in &mut self.group_by {
            key.visit_mut(f)?;
        }
        if let Some(having) = &mut self.having {
            having.visit_mut(f)?;
        }
        for key in &mut self.order_by {
            key.expr.visit_mut(f)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertStmt {
    pub collection: String,
    /// Named-field tuples: `VALUES (type="oracle", retry=5), (...)`.
    pub rows: Vec<Vec<(String, Expr)>>,
    /// `INSERT INTO t SELECT ...`.
    pub select: Option<Box<SelectStmt>>,
    pub or_replace: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateStmt {
    pub collection: String,
    pub sets: Vec<(String, Expr)>,
    pub filter: Option<Expr>,
    pub hints: Vec<Hint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteStmt {
    pub collection: String,
    pub filter: Option<Expr>,
    pub hints: Vec<Hint>,
}

impl Statement {
    /// Substitute `?` parameters positionally. Errors on an out-of-range
    /// placeholder; surplus parameters are ignored.
    pub fn bind(mut self, params: &[Value]) -> Result<Statement, NovusError> {
        let substitute = &mut |expr: &mut Expr| -> Result<(), NovusError> {
            if let Expr::Param(idx) = expr {
                let value = params.get(*idx as usize).cloned().ok_or_else(|| {
                    NovusError::Parse(format!(
                        "parameter {} out of range ({} supplied)",
                        idx,
                        params.len()
                    ))
                })?;
                *expr = Expr::Literal(value);
            }
            Ok(())
        };
        self.visit_exprs_mut(substitute)?;
        Ok(self)
    }

    pub fn visit_exprs_mut<F>(&mut self, f: &mut F) -> Result<(), NovusError>
    where
        F: FnMut(&mut Expr) -> Result<(), NovusError>,
    {
        match self {
            Statement::Select(select) => select.visit_exprs_mut(f),
            Statement::Insert(insert) => {
                for row in &mut insert.rows {
                    for (_, expr) in row {
                        expr.visit_mut(f)?;
                    }
                }
                if let Some(select) = &mut insert.select {
                    select.visit_exprs_mut(f)?;
                }
                Ok(())
            }
            Statement::Update(update) => {
                for (_, expr) in &mut update.sets {
                    expr.visit_mut(f)?;
                }
                if let Some(filter) = &mut update.filter {
                    filter.visit_mut(f)?;
                }
                Ok(())
            }
            Statement::Delete(delete) => {
                if let Some(filter) = &mut delete.filter {
                    filter.visit_mut(f)?;
                }
                Ok(())
            }
            Statement::CreateView { select, .. } => select.visit_exprs_mut(f),
            Statement::Explain(inner) => inner.visit_exprs_mut(f),
            _ => Ok(()),
        }
    }

    /// True when executing the statement cannot touch any persistent state.
    /// `NEXTVAL` advances a sequence, so a SELECT using it counts as a write.
    pub fn is_read_only(&self) -> bool {
        match self {
            Statement::Select(_) | Statement::Explain(_) => {
                let mut writes = false;
                let mut probe = self.clone();
                let _ = probe.visit_exprs_mut(&mut |expr: &mut Expr| {
                    if matches!(expr, Expr::SeqNext(_)) {
                        writes = true;
                    }
                    Ok(())
                });
                !writes
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_substitutes_parameters() {
        let stmt = Statement::Select(SelectStmt {
            filter: Some(Expr::binary(
                BinaryOp::Eq,
                Expr::column("type"),
                Expr::Param(0),
            )),
            ..SelectStmt::scan("jobs")
        });
        let bound = stmt.bind(&[Value::from("oracle")]).unwrap();
        let Statement::Select(select) = bound else {
            panic!("still a select");
        };
        assert_eq!(
            select.filter,
            Some(Expr::binary(
                BinaryOp::Eq,
                Expr::column("type"),
                Expr::literal("oracle"),
            ))
        );
    }

    #[test]
    fn bind_rejects_missing_parameter() {
        let stmt = Statement::Select(SelectStmt {
            filter: Some(Expr::Param(2)),
            ..SelectStmt::scan("jobs")
        });
        assert!(matches!(stmt.bind(&[]), Err(NovusError::Parse(_))));
    }

    #[test]
    fn bind_reaches_into_subqueries() {
        let sub = SelectStmt {
            filter: Some(Expr::Param(0)),
            ..SelectStmt::scan("inner")
        };
        let stmt = Statement::Select(SelectStmt {
            filter: Some(Expr::InSelect {
                expr: Box::new(Expr::column("id")),
                select: Box::new(sub),
                negated: false,
            }),
            ..SelectStmt::scan("outer")
        });
        let bound = stmt.bind(&[Value::Int(1)]).unwrap();
        let Statement::Select(select) = bound else {
            panic!()
        };
        let Some(Expr::InSelect { select: sub, .. }) = select.filter else {
            panic!()
        };
        assert_eq!(sub.filter, Some(Expr::literal(1i64)));
    }

    #[test]
    fn nextval_makes_select_a_writer() {
        let pure = Statement::Select(SelectStmt::scan("jobs"));
        assert!(pure.is_read_only());

        let seq = Statement::Select(SelectStmt {
            projections: vec![SelectItem::Expr {
                expr: Expr::SeqNext("ids".into()),
                alias: None,
            }],
            from: None,
            ..SelectStmt::scan("jobs")
        });
        assert!(!seq.is_read_only());
        assert!(!Statement::Begin.is_read_only());
    }
}
