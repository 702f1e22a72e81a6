//! Physical planning: resolved AST → operator tree.
//!
//! Index selection walks the WHERE conjuncts looking for `field OP literal`
//! shapes against an existing index: `=` becomes an `IndexSeek`, ranges and
//! `BETWEEN` become an `IndexRange`, `IN (…)` a multi-key seek (sorted,
//! de-duplicated). Everything that cannot use an index stays behind as a
//! `Filter`. Joins are left-deep; an equi-join builds a hash table on the
//! smaller estimated side, otherwise a nested loop runs. `ORDER BY` under a
//! `LIMIT` turns into a top-k sort.
//!
//! Numeric keys are planned against both the int64 and float64 sections of
//! an index (a schemaless field may hold either), unioned back together.

use crate::catalog::Catalog;
use crate::core::errors::NovusError;
use crate::core::value::{Document, Value};
use crate::index::key::{key_display, value_to_key};
use crate::query::ast::{
    AggFunc, BinaryOp, Expr, Hint, Join, SelectItem, SelectStmt, Statement, TableRef, UnaryOp,
};

#[derive(Debug, Clone, PartialEq)]
pub struct AggSpec {
    pub out: String,
    pub func: AggFunc,
    pub arg: Option<Expr>,
    pub distinct: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    SeqScan {
        collection: String,
        binding: String,
    },
    IndexSeek {
        collection: String,
        binding: String,
        field: String,
        keys: Vec<Vec<u8>>,
    },
    IndexRange {
        collection: String,
        binding: String,
        field: String,
        lo: Vec<u8>,
        hi: Vec<u8>,
        lo_open: bool,
        hi_open: bool,
    },
    Filter {
        pred: Expr,
        input: Box<Plan>,
    },
    Project {
        items: Vec<(String, Expr)>,
        input: Box<Plan>,
    },
    /// Rebind rows produced by a view or derived table under one name.
    Bind {
        binding: String,
        input: Box<Plan>,
    },
    NestedLoopJoin {
        left: Box<Plan>,
        right: Box<Plan>,
        on: Option<Expr>,
    },
    HashJoin {
        build: Box<Plan>,
        probe: Box<Plan>,
        build_keys: Vec<Expr>,
        probe_keys: Vec<Expr>,
    },
    Sort {
        keys: Vec<(Expr, bool)>,
        /// Top-k bound (`LIMIT` + `OFFSET`) when a limit is present.
        top_k: Option<usize>,
        input: Box<Plan>,
    },
    Limit {
        limit: Option<u64>,
        offset: u64,
        input: Box<Plan>,
    },
    Group {
        keys: Vec<(String, Expr)>,
        aggs: Vec<AggSpec>,
        input: Box<Plan>,
    },
    Distinct {
        input: Box<Plan>,
    },
    Union {
        all: bool,
        inputs: Vec<Plan>,
    },
    Values {
        rows: Vec<Vec<(String, Expr)>>,
    },
    Insert {
        collection: String,
        source: Box<Plan>,
        or_replace: bool,
    },
    Update {
        collection: String,
        sets: Vec<(String, Expr)>,
        source: Box<Plan>,
    },
    Delete {
        collection: String,
        source: Box<Plan>,
    },
}

pub fn plan_statement(stmt: &Statement, catalog: &Catalog) -> Result<Plan, NovusError> {
    match stmt {
        Statement::Select(select) => plan_select(select, catalog),
        Statement::Insert(insert) => {
            let source = match (&insert.select, insert.rows.is_empty()) {
                (Some(select), _) => plan_select(select, catalog)?,
                (None, false) => Plan::Values {
                    rows: insert.rows.clone(),
                },
                (None, true) => {
                    return Err(NovusError::Parse("INSERT without rows".into()));
                }
            };
            Ok(Plan::Insert {
                collection: insert.collection.clone(),
                source: Box::new(source),
                or_replace: insert.or_replace,
            })
        }
        Statement::Update(update) => {
            let source = plan_write_source(
                &update.collection,
                update.filter.as_ref(),
                &update.hints,
                catalog,
            )?;
            Ok(Plan::Update {
                collection: update.collection.clone(),
                sets: update.sets.clone(),
                source: Box::new(source),
            })
        }
        Statement::Delete(delete) => {
            let source = plan_write_source(
                &delete.collection,
                delete.filter.as_ref(),
                &delete.hints,
                catalog,
            )?;
            Ok(Plan::Delete {
                collection: delete.collection.clone(),
                source: Box::new(source),
            })
        }
        other => Err(NovusError::Parse(format!(
            "statement is not plannable: {other:?}"
        ))),
    }
}

/// Scan + filter feeding UPDATE/DELETE; no projection so record locations
/// flow through.
fn plan_write_source(
    collection: &str,
    filter: Option<&Expr>,
    hints: &[Hint],
    catalog: &Catalog,
) -> Result<Plan, NovusError> {
    let conjuncts = filter.map(split_conjuncts).unwrap_or_default();
    let (plan, residual) =
        plan_table_access(catalog, collection, collection, conjuncts, hints)?;
    Ok(wrap_filter(plan, residual))
}

pub fn plan_select(select: &SelectStmt, catalog: &Catalog) -> Result<Plan, NovusError> {
    // FROM and joins.
    let mut conjuncts = select
        .filter
        .as_ref()
        .map(split_conjuncts)
        .unwrap_or_default();

    let mut plan = match &select.from {
        None => Plan::Values { rows: vec![vec![]] },
        Some(table) => {
            let single_table = select.joins.is_empty();
            let pushed = take_pushable(&mut conjuncts, table.binding(), single_table);
            plan_table_source(table, pushed, &select.hints, catalog)?
        }
    };

    for join in &select.joins {
        let pushed = take_pushable(&mut conjuncts, join.table.binding(), false);
        let right = plan_table_source(&join.table, pushed, &select.hints, catalog)?;
        plan = plan_join(plan, right, join, select, catalog)?;
    }

    // Whatever index selection and pushdown left over.
    plan = wrap_filter(plan, conjuncts);

    // Grouping. Output names come from the original expressions; the
    // rewrite below replaces aggregates with references into the Group
    // operator's output.
    let mut projections = select.projections.clone();
    let projection_names: Vec<Option<String>> = projections
        .iter()
        .map(|item| match item {
            SelectItem::Wildcard => None,
            SelectItem::Expr { expr, alias } => {
                Some(alias.clone().unwrap_or_else(|| expr_display(expr)))
            }
        })
        .collect();
    let mut having = select.having.clone();
    let mut order_by = select.order_by.clone();
    let aggs = collect_aggs(&projections, &having, &order_by);
    if !select.group_by.is_empty() || !aggs.is_empty() {
        let keys: Vec<(String, Expr)> = select
            .group_by
            .iter()
            .enumerate()
            .map(|(i, expr)| match expr {
                Expr::Column(path) => (path.clone(), expr.clone()),
                other => (format!("$key{i}"), other.clone()),
            })
            .collect();
        plan = Plan::Group {
            keys: keys.clone(),
            aggs: aggs.clone(),
            input: Box::new(plan),
        };
        rewrite_grouped(&mut projections, &mut having, &mut order_by, &keys, &aggs)?;
        if let Some(having) = having {
            plan = Plan::Filter {
                pred: having,
                input: Box::new(plan),
            };
        }
    }

    // Projection.
    if !matches!(projections.as_slice(), [SelectItem::Wildcard]) {
        let mut items = Vec::with_capacity(projections.len());
        for (item, name) in projections.iter().zip(&projection_names) {
            match item {
                SelectItem::Wildcard => {
                    return Err(NovusError::Parse(
                        "wildcard mixed with expressions is unsupported".into(),
                    ))
                }
                SelectItem::Expr { expr, .. } => {
                    let name = name.clone().expect("named projection");
                    items.push((name, expr.clone()));
                }
            }
        }
        plan = Plan::Project {
            items,
            input: Box::new(plan),
        };
    }

    if select.distinct {
        plan = Plan::Distinct {
            input: Box::new(plan),
        };
    }

    if !order_by.is_empty() {
        let top_k = select
            .limit
            .map(|l| (l + select.offset.unwrap_or(0)) as usize);
        plan = Plan::Sort {
            keys: order_by
                .iter()
                .map(|k| (k.expr.clone(), k.desc))
                .collect(),
            top_k,
            input: Box::new(plan),
        };
    }

    if select.limit.is_some() || select.offset.is_some() {
        plan = Plan::Limit {
            limit: select.limit,
            offset: select.offset.unwrap_or(0),
            input: Box::new(plan),
        };
    }

    Ok(plan)
}

/// Base access for a table reference; views inline their stored statement.
fn plan_table_source(
    table: &TableRef,
    conjuncts: Vec<Expr>,
    hints: &[Hint],
    catalog: &Catalog,
) -> Result<Plan, NovusError> {
    if let Some(view) = catalog.view(&table.name) {
        let inner = plan_select(&view.select, catalog)?;
        let bound = Plan::Bind {
            binding: table.binding().to_string(),
            input: Box::new(inner),
        };
        return Ok(wrap_filter(bound, conjuncts));
    }
    let (plan, residual) =
        plan_table_access(catalog, &table.name, table.binding(), conjuncts, hints)?;
    Ok(wrap_filter(plan, residual))
}

fn plan_join(
    left: Plan,
    right: Plan,
    join: &Join,
    select: &SelectStmt,
    catalog: &Catalog,
) -> Result<Plan, NovusError> {
    let force_nested = select.hints.contains(&Hint::NestedLoop);

    let mut equi: Vec<(Expr, Expr)> = Vec::new();
    let mut residual: Vec<Expr> = Vec::new();
    if let Some(on) = &join.on {
        let right_binding = join.table.binding();
        for conjunct in split_conjuncts(on) {
            match split_equi(&conjunct, right_binding) {
                Some(pair) => equi.push(pair),
                None => residual.push(conjunct),
            }
        }
    }

    // A hash join needs at least one equi pair; the HASH_JOIN hint cannot
    // conjure one, so a keyless ON always nested-loops.
    if force_nested || equi.is_empty() {
        return Ok(Plan::NestedLoopJoin {
            left: Box::new(left),
            right: Box::new(right),
            on: join.on.clone(),
        });
    }

    let (left_keys, right_keys): (Vec<Expr>, Vec<Expr>) = equi.into_iter().unzip();
    // Build on the smaller estimated side.
    let plan = if estimate(&right, catalog) <= estimate(&left, catalog) {
        Plan::HashJoin {
            build: Box::new(right),
            probe: Box::new(left),
            build_keys: right_keys,
            probe_keys: left_keys,
        }
    } else {
        Plan::HashJoin {
            build: Box::new(left),
            probe: Box::new(right),
            build_keys: left_keys,
            probe_keys: right_keys,
        }
    };
    Ok(wrap_filter(plan, residual))
}

/// `left OP right` where one side references only the probe bindings and the
/// other only the new table; returns `(left_side_key, right_side_key)`.
fn split_equi(conjunct: &Expr, right_binding: &str) -> Option<(Expr, Expr)> {
    let Expr::Binary {
        op: BinaryOp::Eq,
        left,
        right,
    } = conjunct
    else {
        return None;
    };
    let left_is_right = qualified_with(left, right_binding)?;
    let right_is_right = qualified_with(right, right_binding)?;
    match (left_is_right, right_is_right) {
        (false, true) => Some(((**left).clone(), (**right).clone())),
        (true, false) => Some(((**right).clone(), (**left).clone())),
        _ => None,
    }
}

/// Whether the expression's columns are all qualified with `binding`.
/// Returns `None` for mixed or non-column expressions.
fn qualified_with(expr: &Expr, binding: &str) -> Option<bool> {
    match expr {
        Expr::Column(path) => {
            Some(path.split('.').next().map(|seg| seg == binding).unwrap_or(false))
        }
        Expr::Literal(_) => None,
        _ => None,
    }
}

fn wrap_filter(plan: Plan, conjuncts: Vec<Expr>) -> Plan {
    match join_conjuncts(conjuncts) {
        Some(pred) => Plan::Filter {
            pred,
            input: Box::new(plan),
        },
        None => plan,
    }
}

/// Split a predicate into top-level AND conjuncts.
pub fn split_conjuncts(expr: &Expr) -> Vec<Expr> {
    match expr {
        Expr::Binary {
            op: BinaryOp::And,
            left,
            right,
        } => {
            let mut out = split_conjuncts(left);
            out.extend(split_conjuncts(right));
            out
        }
        other => vec![other.clone()],
    }
}

fn join_conjuncts(conjuncts: Vec<Expr>) -> Option<Expr> {
    conjuncts
        .into_iter()
        .reduce(|acc, next| Expr::binary(BinaryOp::And, acc, next))
}

/// Pull out the conjuncts that can be evaluated against one binding alone.
fn take_pushable(conjuncts: &mut Vec<Expr>, binding: &str, allow_unqualified: bool) -> Vec<Expr> {
    let mut pushed = Vec::new();
    conjuncts.retain(|conjunct| {
        if conjunct_binds_to(conjunct, binding, allow_unqualified) {
            pushed.push(conjunct.clone());
            false
        } else {
            true
        }
    });
    pushed
}

fn conjunct_binds_to(conjunct: &Expr, binding: &str, allow_unqualified: bool) -> bool {
    let mut ok = true;
    let mut probe = conjunct.clone();
    let _ = probe.visit_mut(&mut |expr: &mut Expr| {
        match expr {
            Expr::Column(path) => {
                let first = path.split('.').next().unwrap_or("");
                if first != binding && !allow_unqualified {
                    ok = false;
                }
            }
            Expr::Subquery(_) | Expr::InSelect { .. } => ok = false,
            _ => {}
        }
        Ok(())
    });
    ok
}

/// Strip a leading `binding.` qualifier from a column path.
fn field_of(path: &str, binding: &str) -> String {
    match path.split_once('.') {
        Some((first, rest)) if first == binding => rest.to_string(),
        _ => path.to_string(),
    }
}

/// One indexable comparison pulled out of a conjunct.
enum IndexPred {
    Eq(Value),
    In(Vec<Value>),
    Range {
        lo: Option<Value>,
        hi: Option<Value>,
        lo_open: bool,
        hi_open: bool,
    },
}

fn match_index_pred(conjunct: &Expr, binding: &str) -> Option<(String, IndexPred)> {
    match conjunct {
        Expr::Binary { op, left, right } => {
            let (path, value, op) = match (&**left, &**right) {
                (Expr::Column(p), Expr::Literal(v)) => (p, v.clone(), *op),
                (Expr::Literal(v), Expr::Column(p)) => (p, v.clone(), flip_op(*op)?),
                _ => return None,
            };
            let field = field_of(path, binding);
            let pred = match op {
                BinaryOp::Eq => IndexPred::Eq(value),
                BinaryOp::Lt => IndexPred::Range {
                    lo: None,
                    hi: Some(value),
                    lo_open: false,
                    hi_open: true,
                },
                BinaryOp::Le => IndexPred::Range {
                    lo: None,
                    hi: Some(value),
                    lo_open: false,
                    hi_open: false,
                },
                BinaryOp::Gt => IndexPred::Range {
                    lo: Some(value),
                    hi: None,
                    lo_open: true,
                    hi_open: false,
                },
                BinaryOp::Ge => IndexPred::Range {
                    lo: Some(value),
                    hi: None,
                    lo_open: false,
                    hi_open: false,
                },
                _ => return None,
            };
            Some((field, pred))
        }
        Expr::Between {
            expr,
            low,
            high,
            negated: false,
        } => {
            let (Expr::Column(path), Expr::Literal(lo), Expr::Literal(hi)) =
                (&**expr, &**low, &**high)
            else {
                return None;
            };
            Some((
                field_of(path, binding),
                IndexPred::Range {
                    lo: Some(lo.clone()),
                    hi: Some(hi.clone()),
                    lo_open: false,
                    hi_open: false,
                },
            ))
        }
        Expr::InList {
            expr,
            list,
            negated: false,
        } => {
            let Expr::Column(path) = &**expr else {
                return None;
            };
            let mut values = Vec::with_capacity(list.len());
            for item in list {
                let Expr::Literal(v) = item else { return None };
                values.push(v.clone());
            }
            Some((field_of(path, binding), IndexPred::In(values)))
        }
        _ => None,
    }
}

fn flip_op(op: BinaryOp) -> Option<BinaryOp> {
    Some(match op {
        BinaryOp::Eq => BinaryOp::Eq,
        BinaryOp::Lt => BinaryOp::Gt,
        BinaryOp::Le => BinaryOp::Ge,
        BinaryOp::Gt => BinaryOp::Lt,
        BinaryOp::Ge => BinaryOp::Le,
        _ => return None,
    })
}

/// Equality probes for a literal. A numeric literal probes both the int64
/// and float64 sections of the index, since a schemaless field holds either.
fn eq_keys(value: &Value) -> Result<Vec<Vec<u8>>, NovusError> {
    let mut keys = Vec::new();
    if let Some(key) = value_to_key(value)? {
        keys.push(key);
    }
    match value {
        Value::Int(i) => {
            if let Some(key) = value_to_key(&Value::Float(*i as f64))? {
                keys.push(key);
            }
        }
        Value::Float(f) => {
            if f.fract() == 0.0 && *f >= i64::MIN as f64 && *f <= i64::MAX as f64 {
                if let Some(key) = value_to_key(&Value::Int(*f as i64))? {
                    keys.push(key);
                }
            }
        }
        _ => {}
    }
    keys.sort();
    keys.dedup();
    Ok(keys)
}

fn is_numeric(value: &Option<Value>) -> bool {
    matches!(value, Some(Value::Int(_)) | Some(Value::Float(_)))
}

/// Choose the access path for one table: an index seek/range when a conjunct
/// matches an existing index (subject to hints), else a sequential scan.
/// Returns the access plan plus the conjuncts it did not absorb.
fn plan_table_access(
    catalog: &Catalog,
    collection: &str,
    binding: &str,
    conjuncts: Vec<Expr>,
    hints: &[Hint],
) -> Result<(Plan, Vec<Expr>), NovusError> {
    let seq = Plan::SeqScan {
        collection: collection.to_string(),
        binding: binding.to_string(),
    };
    if hints.contains(&Hint::FullScan) {
        return Ok((seq, conjuncts));
    }
    let forced = hints.iter().find_map(|h| match h {
        Hint::ForceIndex(field) => Some(field.clone()),
        _ => None,
    });

    // Candidate (conjunct index, field, predicate), preferring seeks over
    // ranges: = first, then IN, then inequalities.
    let mut best: Option<(usize, String, IndexPred)> = None;
    for (i, conjunct) in conjuncts.iter().enumerate() {
        let Some((field, pred)) = match_index_pred(conjunct, binding) else {
            continue;
        };
        if let Some(forced_field) = &forced {
            if &field != forced_field {
                continue;
            }
        }
        if catalog.index_of(collection, &field).is_none() {
            continue;
        }
        let rank = match pred {
            IndexPred::Eq(_) => 0,
            IndexPred::In(_) => 1,
            IndexPred::Range { .. } => 2,
        };
        let current = best.as_ref().map(|(_, _, p)| match p {
            IndexPred::Eq(_) => 0,
            IndexPred::In(_) => 1,
            IndexPred::Range { .. } => 2,
        });
        if current.map(|c| rank < c).unwrap_or(true) {
            best = Some((i, field, pred));
        }
    }

    let Some((used, field, pred)) = best else {
        return Ok((seq, conjuncts));
    };

    let mut residual: Vec<Expr> = conjuncts;
    residual.remove(used);

    let plan = match pred {
        IndexPred::Eq(value) => {
            let keys = eq_keys(&value)?;
            Plan::IndexSeek {
                collection: collection.to_string(),
                binding: binding.to_string(),
                field,
                keys,
            }
        }
        IndexPred::In(values) => {
            let mut keys = Vec::new();
            for value in &values {
                keys.extend(eq_keys(value)?);
            }
            keys.sort();
            keys.dedup();
            Plan::IndexSeek {
                collection: collection.to_string(),
                binding: binding.to_string(),
                field,
                keys,
            }
        }
        IndexPred::Range {
            lo,
            hi,
            lo_open,
            hi_open,
        } => {
            if is_numeric(&lo) || is_numeric(&hi) {
                let int_range = numeric_range(
                    collection, binding, &field, &lo, &hi, lo_open, hi_open, false,
                )?;
                let float_range = numeric_range(
                    collection, binding, &field, &lo, &hi, lo_open, hi_open, true,
                )?;
                // A field value has one type, so the two sections are
                // disjoint and need no de-duplication.
                Plan::Union {
                    all: true,
                    inputs: vec![int_range, float_range],
                }
            } else {
                let lo_key = match &lo {
                    Some(v) => value_to_key(v)?.unwrap_or_default(),
                    None => Vec::new(),
                };
                let hi_key = match &hi {
                    Some(v) => value_to_key(v)?.unwrap_or_default(),
                    None => Vec::new(),
                };
                Plan::IndexRange {
                    collection: collection.to_string(),
                    binding: binding.to_string(),
                    field,
                    lo: lo_key,
                    hi: hi_key,
                    lo_open,
                    hi_open,
                }
            }
        }
    };
    Ok((plan, residual))
}

/// One typed section of a numeric range. Unbounded sides clamp to the type
/// extremes. In the int section, a fractional float bound rounds inward
/// (ceil for lower, floor for upper) and the bound becomes closed; in the
/// float section, int bounds widen exactly for any value f64 represents.
#[allow(clippy::too_many_arguments)]
fn numeric_range(
    collection: &str,
    binding: &str,
    field: &str,
    lo: &Option<Value>,
    hi: &Option<Value>,
    lo_open: bool,
    hi_open: bool,
    float_section: bool,
) -> Result<Plan, NovusError> {
    let clamp_i64 = |f: f64| f.clamp(i64::MIN as f64, i64::MAX as f64) as i64;

    let (lo_value, lo_open) = match lo {
        None => {
            if float_section {
                (Value::Float(f64::NEG_INFINITY), false)
            } else {
                (Value::Int(i64::MIN), false)
            }
        }
        Some(v) if float_section => (Value::Float(v.as_f64().unwrap_or(0.0)), lo_open),
        Some(Value::Int(i)) => (Value::Int(*i), lo_open),
        Some(Value::Float(f)) if f.fract() == 0.0 => (Value::Int(clamp_i64(*f)), lo_open),
        Some(Value::Float(f)) => (Value::Int(clamp_i64(f.ceil())), false),
        Some(other) => (other.clone(), lo_open),
    };
    let (hi_value, hi_open) = match hi {
        None => {
            if float_section {
                (Value::Float(f64::INFINITY), false)
            } else {
                (Value::Int(i64::MAX), false)
            }
        }
        Some(v) if float_section => (Value::Float(v.as_f64().unwrap_or(0.0)), hi_open),
        Some(Value::Int(i)) => (Value::Int(*i), hi_open),
        Some(Value::Float(f)) if f.fract() == 0.0 => (Value::Int(clamp_i64(*f)), hi_open),
        Some(Value::Float(f)) => (Value::Int(clamp_i64(f.floor())), false),
        Some(other) => (other.clone(), hi_open),
    };

    let lo_key = value_to_key(&lo_value)?.unwrap_or_default();
    let hi_key = value_to_key(&hi_value)?.unwrap_or_default();
    Ok(Plan::IndexRange {
        collection: collection.to_string(),
        binding: binding.to_string(),
        field: field.to_string(),
        lo: lo_key,
        hi: hi_key,
        lo_open,
        hi_open,
    })
}

/// Rough cardinality for join-side choice.
fn estimate(plan: &Plan, catalog: &Catalog) -> u64 {
    match plan {
        Plan::SeqScan { collection, .. } => catalog
            .collection(collection)
            .map(|c| c.id_counter)
            .unwrap_or(0),
        Plan::IndexSeek { keys, .. } => keys.len() as u64,
        Plan::IndexRange { collection, .. } => catalog
            .collection(collection)
            .map(|c| c.id_counter / 2)
            .unwrap_or(0),
        Plan::Filter { input, .. }
        | Plan::Project { input, .. }
        | Plan::Bind { input, .. }
        | Plan::Distinct { input }
        | Plan::Sort { input, .. }
        | Plan::Limit { input, .. }
        | Plan::Group { input, .. } => estimate(input, catalog),
        Plan::NestedLoopJoin { left, right, .. } => {
            estimate(left, catalog).saturating_mul(estimate(right, catalog))
        }
        Plan::HashJoin { build, probe, .. } => {
            estimate(build, catalog).max(estimate(probe, catalog))
        }
        Plan::Union { inputs, .. } => inputs.iter().map(|p| estimate(p, catalog)).sum(),
        Plan::Values { rows } => rows.len() as u64,
        Plan::Insert { .. } | Plan::Update { .. } | Plan::Delete { .. } => 0,
    }
}

/// Collect the distinct aggregate expressions used anywhere in the select.
fn collect_aggs(
    projections: &[SelectItem],
    having: &Option<Expr>,
    order_by: &[crate::query::ast::OrderKey],
) -> Vec<AggSpec> {
    let mut specs: Vec<AggSpec> = Vec::new();
    let mut add = |func: AggFunc, arg: &Option<Box<Expr>>, distinct: bool| {
        let arg = arg.as_deref().cloned();
        if !specs
            .iter()
            .any(|s| s.func == func && s.arg == arg && s.distinct == distinct)
        {
            specs.push(AggSpec {
                out: format!("$agg{}", specs.len()),
                func,
                arg,
                distinct,
            });
        }
    };
    let mut scan = |expr: &Expr| {
        let mut probe = expr.clone();
        let _ = probe.visit_mut(&mut |e: &mut Expr| {
            if let Expr::Agg {
                func,
                arg,
                distinct,
            } = e
            {
                add(*func, arg, *distinct);
            }
            Ok(())
        });
    };
    for item in projections {
        if let SelectItem::Expr { expr, .. } = item {
            scan(expr);
        }
    }
    if let Some(h) = having {
        scan(h);
    }
    for key in order_by {
        scan(&key.expr);
    }
    specs
}

/// Rewrite post-group expressions to reference the group output columns.
fn rewrite_grouped(
    projections: &mut [SelectItem],
    having: &mut Option<Expr>,
    order_by: &mut [crate::query::ast::OrderKey],
    keys: &[(String, Expr)],
    aggs: &[AggSpec],
) -> Result<(), NovusError> {
    let mut rewrite = |expr: &mut Expr| -> Result<(), NovusError> {
        expr.visit_mut(&mut |e: &mut Expr| {
            if let Expr::Agg {
                func,
                arg,
                distinct,
            } = e
            {
                let arg_expr = arg.as_deref().cloned();
                if let Some(spec) = aggs
                    .iter()
                    .find(|s| s.func == *func && s.arg == arg_expr && s.distinct == *distinct)
                {
                    *e = Expr::Column(spec.out.clone());
                    return Ok(());
                }
            }
            if let Some((name, _)) = keys.iter().find(|(_, key)| key == e) {
                *e = Expr::Column(name.clone());
            }
            Ok(())
        })
    };
    for item in projections.iter_mut() {
        if let SelectItem::Expr { expr, .. } = item {
            rewrite(expr)?;
        }
    }
    if let Some(h) = having {
        rewrite(h)?;
    }
    for key in order_by.iter_mut() {
        rewrite(&mut key.expr)?;
    }
    Ok(())
}

/// Human-readable expression rendering for EXPLAIN and projection naming.
pub fn expr_display(expr: &Expr) -> String {
    match expr {
        Expr::Literal(v) => value_display(v),
        Expr::Column(path) => path.clone(),
        Expr::Param(i) => format!("?{i}"),
        Expr::Unary { op, expr } => match op {
            UnaryOp::Not => format!("NOT {}", expr_display(expr)),
            UnaryOp::Neg => format!("-{}", expr_display(expr)),
        },
        Expr::Binary { op, left, right } => format!(
            "{} {} {}",
            expr_display(left),
            binop_display(*op),
            expr_display(right)
        ),
        Expr::IsNull { expr, negated } => format!(
            "{} IS {}NULL",
            expr_display(expr),
            if *negated { "NOT " } else { "" }
        ),
        Expr::Like {
            expr,
            pattern,
            negated,
        } => format!(
            "{} {}LIKE {}",
            expr_display(expr),
            if *negated { "NOT " } else { "" },
            expr_display(pattern)
        ),
        Expr::Between {
            expr,
            low,
            high,
            negated,
        } => format!(
            "{} {}BETWEEN {} AND {}",
            expr_display(expr),
            if *negated { "NOT " } else { "" },
            expr_display(low),
            expr_display(high)
        ),
        Expr::InList {
            expr,
            list,
            negated,
        } => {
            let items: Vec<String> = list.iter().map(expr_display).collect();
            format!(
                "{} {}IN ({})",
                expr_display(expr),
                if *negated { "NOT " } else { "" },
                items.join(", ")
            )
        }
        Expr::InSelect { expr, negated, .. } => format!(
            "{} {}IN (SELECT …)",
            expr_display(expr),
            if *negated { "NOT " } else { "" }
        ),
        Expr::Case { .. } => "CASE".to_string(),
        Expr::Func { name, args } => {
            let args: Vec<String> = args.iter().map(expr_display).collect();
            format!("{}({})", name, args.join(", "))
        }
        Expr::Agg {
            func,
            arg,
            distinct,
        } => {
            let name = match func {
                AggFunc::Count => "COUNT",
                AggFunc::Sum => "SUM",
                AggFunc::Avg => "AVG",
                AggFunc::Min => "MIN",
                AggFunc::Max => "MAX",
            };
            let inner = match arg {
                None => "*".to_string(),
                Some(a) => format!(
                    "{}{}",
                    if *distinct { "DISTINCT " } else { "" },
                    expr_display(a)
                ),
            };
            format!("{name}({inner})")
        }
        Expr::Sysdate => "SYSDATE".to_string(),
        Expr::SeqNext(name) => format!("{name}.NEXTVAL"),
        Expr::SeqCurr(name) => format!("{name}.CURRVAL"),
        Expr::Subquery(_) => "(SELECT …)".to_string(),
    }
}

fn binop_display(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Add => "+",
        BinaryOp::Sub => "-",
        BinaryOp::Mul => "*",
        BinaryOp::Div => "/",
        BinaryOp::Mod => "%",
        BinaryOp::Concat => "||",
        BinaryOp::Eq => "=",
        BinaryOp::Ne => "!=",
        BinaryOp::Lt => "<",
        BinaryOp::Le => "<=",
        BinaryOp::Gt => ">",
        BinaryOp::Ge => ">=",
        BinaryOp::And => "AND",
        BinaryOp::Or => "OR",
    }
}

pub fn value_display(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Str(s) => format!("{s:?}"),
        Value::Doc(_) => "{…}".to_string(),
        Value::Array(_) => "[…]".to_string(),
    }
}

impl Plan {
    /// One-line label for this node, e.g. `IndexSeek(jobs.type,"s:mysql")`.
    pub fn label(&self) -> String {
        match self {
            Plan::SeqScan { collection, .. } => format!("SeqScan({collection})"),
            Plan::IndexSeek {
                collection,
                field,
                keys,
                ..
            } => {
                let rendered: Vec<String> = keys
                    .iter()
                    .map(|k| format!("{:?}", key_display(k)))
                    .collect();
                format!("IndexSeek({collection}.{field},{})", rendered.join(","))
            }
            Plan::IndexRange {
                collection,
                field,
                lo,
                hi,
                lo_open,
                hi_open,
                ..
            } => {
                let lo_disp = if lo.is_empty() {
                    "".to_string()
                } else {
                    format!("{:?}", key_display(lo))
                };
                let hi_disp = if hi.is_empty() {
                    "".to_string()
                } else {
                    format!("{:?}", key_display(hi))
                };
                format!(
                    "IndexRange({collection}.{field},{lo_disp}{}..{}{hi_disp})",
                    if *lo_open { "<" } else { "" },
                    if *hi_open { "<" } else { "" },
                )
            }
            Plan::Filter { pred, .. } => format!("Filter({})", expr_display(pred)),
            Plan::Project { items, .. } => {
                let names: Vec<&str> = items.iter().map(|(n, _)| n.as_str()).collect();
                format!("Project({})", names.join(", "))
            }
            Plan::Bind { binding, .. } => format!("Bind({binding})"),
            Plan::NestedLoopJoin { on, .. } => match on {
                Some(on) => format!("NestedLoopJoin({})", expr_display(on)),
                None => "NestedLoopJoin".to_string(),
            },
            Plan::HashJoin {
                build_keys,
                probe_keys,
                ..
            } => {
                let pairs: Vec<String> = probe_keys
                    .iter()
                    .zip(build_keys)
                    .map(|(p, b)| format!("{} = {}", expr_display(p), expr_display(b)))
                    .collect();
                format!("HashJoin({})", pairs.join(" AND "))
            }
            Plan::Sort { keys, top_k, .. } => {
                let rendered: Vec<String> = keys
                    .iter()
                    .map(|(e, desc)| {
                        format!("{}{}", expr_display(e), if *desc { " DESC" } else { "" })
                    })
                    .collect();
                match top_k {
                    Some(k) => format!("Sort({}, top={k})", rendered.join(", ")),
                    None => format!("Sort({})", rendered.join(", ")),
                }
            }
            Plan::Limit { limit, offset, .. } => match limit {
                Some(l) => format!("Limit({l}, offset={offset})"),
                None => format!("Limit(all, offset={offset})"),
            },
            Plan::Group { keys, aggs, .. } => {
                let key_names: Vec<&str> = keys.iter().map(|(n, _)| n.as_str()).collect();
                let agg_names: Vec<String> = aggs
                    .iter()
                    .map(|a| {
                        expr_display(&Expr::Agg {
                            func: a.func,
                            arg: a.arg.clone().map(Box::new),
                            distinct: a.distinct,
                        })
                    })
                    .collect();
                format!("Group({}; {})", key_names.join(", "), agg_names.join(", "))
            }
            Plan::Distinct { .. } => "Distinct".to_string(),
            Plan::Union { all, .. } => {
                format!("Union({})", if *all { "all" } else { "distinct" })
            }
            Plan::Values { rows } => format!("Values({})", rows.len()),
            Plan::Insert { collection, .. } => format!("Insert({collection})"),
            Plan::Update { collection, .. } => format!("Update({collection})"),
            Plan::Delete { collection, .. } => format!("Delete({collection})"),
        }
    }

    /// EXPLAIN output: the operator tree as a document.
    pub fn to_doc(&self) -> Document {
        let mut doc = Document::new();
        doc.insert("op", Value::Str(self.label()));
        match self {
            Plan::Filter { input, .. }
            | Plan::Project { input, .. }
            | Plan::Bind { input, .. }
            | Plan::Sort { input, .. }
            | Plan::Limit { input, .. }
            | Plan::Group { input, .. }
            | Plan::Distinct { input }
            | Plan::Insert { source: input, .. }
            | Plan::Update { source: input, .. }
            | Plan::Delete { source: input, .. } => {
                doc.insert("input", Value::Doc(input.to_doc()));
            }
            Plan::NestedLoopJoin { left, right, .. } => {
                doc.insert("left", Value::Doc(left.to_doc()));
                doc.insert("right", Value::Doc(right.to_doc()));
            }
            Plan::HashJoin { build, probe, .. } => {
                doc.insert("build", Value::Doc(build.to_doc()));
                doc.insert("probe", Value::Doc(probe.to_doc()));
            }
            Plan::Union { inputs, .. } => {
                doc.insert(
                    "inputs",
                    Value::Array(inputs.iter().map(|p| Value::Doc(p.to_doc())).collect()),
                );
            }
            _ => {}
        }
        doc
    }
}
