//! Pull-based execution of physical plans.
//!
//! Every operator exposes `open` / `next` / `close` and pulls from its
//! input. Blocking operators (hash build, sort, group) buffer in memory,
//! which is the embedded-scale assumption. Write operators run eagerly: their source
//! rows are drained first, so `INSERT INTO t SELECT ... FROM t` cannot chase
//! its own tail.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use byteorder::{LittleEndian, WriteBytesExt};

use crate::catalog::{Catalog, IndexMeta, SequenceMeta, ViewMeta};
use crate::core::codec::{encode_document, encode_value_bytes};
use crate::core::errors::NovusError;
use crate::core::value::{Document, Value};
use crate::index::btree::BTree;
use crate::index::key::value_to_key;
use crate::index::Index;
use crate::query::ast::{AggFunc, SelectStmt, SequenceDef, Statement};
use crate::query::eval::eval;
use crate::query::plan::{plan_select, plan_statement, AggSpec, Plan};
use crate::storage::heap::{self, RecordLoc};
use crate::storage::page::NO_PAGE;
use crate::storage::pager::PageIo;

/// Everything an operator needs: the page overlay of the current
/// transaction (or the shared pager for autocommit reads) and the working
/// catalog.
pub struct ExecContext<'a> {
    pub io: &'a dyn PageIo,
    pub catalog: &'a mut Catalog,
}

/// A document streaming through the pipeline plus the alias context it was
/// produced under. `rid` carries the record identity for write plans.
#[derive(Debug, Clone, Default)]
pub struct Row {
    pub doc: Document,
    pub ctx: Vec<(String, Document)>,
    pub rid: Option<(u64, RecordLoc)>,
}

impl Row {
    pub fn from_record(binding: &str, record_id: u64, loc: RecordLoc, doc: Document) -> Self {
        Self {
            ctx: vec![(binding.to_string(), doc.clone())],
            doc,
            rid: Some((record_id, loc)),
        }
    }

    /// Resolve a column path: flat projected name first, then a dotted path
    /// into the row document, then alias-qualified context documents.
    pub fn resolve(&self, path: &str) -> Option<Value> {
        if let Some(v) = self.doc.get(path) {
            return Some(v.clone());
        }
        if let Some(v) = self.doc.get_path(path) {
            return Some(v.clone());
        }
        if let Some((first, rest)) = path.split_once('.') {
            if let Some((_, doc)) = self.ctx.iter().find(|(b, _)| b == first) {
                return doc.get_path(rest).cloned();
            }
        }
        if let Some((_, doc)) = self.ctx.iter().find(|(b, _)| b == path) {
            return Some(Value::Doc(doc.clone()));
        }
        for (_, doc) in &self.ctx {
            if let Some(v) = doc.get(path).or_else(|| doc.get_path(path)) {
                return Some(v.clone());
            }
        }
        None
    }
}

fn merge_rows(left: &Row, right: &Row) -> Row {
    let mut doc = left.doc.clone();
    for (name, value) in right.doc.iter() {
        if doc.get(name).is_none() {
            doc.insert(name.clone(), value.clone());
        }
    }
    let mut ctx = left.ctx.clone();
    ctx.extend(right.ctx.iter().cloned());
    Row {
        doc,
        ctx,
        rid: None,
    }
}

pub trait Operator {
    fn open(&mut self, cx: &mut ExecContext) -> Result<(), NovusError>;
    fn next(&mut self, cx: &mut ExecContext) -> Result<Option<Row>, NovusError>;
    fn close(&mut self);
}

pub fn build_operator(plan: &Plan) -> Result<Box<dyn Operator>, NovusError> {
    Ok(match plan {
        Plan::SeqScan {
            collection,
            binding,
        } => Box::new(SeqScanOp {
            collection: collection.clone(),
            binding: binding.clone(),
            cursor: None,
        }),
        Plan::IndexSeek {
            collection,
            binding,
            field,
            keys,
        } => Box::new(IndexAccessOp {
            collection: collection.clone(),
            binding: binding.clone(),
            field: field.clone(),
            probe: IndexProbe::Seek(keys.clone()),
            hits: Vec::new(),
            pos: 0,
        }),
        Plan::IndexRange {
            collection,
            binding,
            field,
            lo,
            hi,
            lo_open,
            hi_open,
        } => Box::new(IndexAccessOp {
            collection: collection.clone(),
            binding: binding.clone(),
            field: field.clone(),
            probe: IndexProbe::Range {
                lo: lo.clone(),
                hi: hi.clone(),
                lo_open: *lo_open,
                hi_open: *hi_open,
            },
            hits: Vec::new(),
            pos: 0,
        }),
        Plan::Filter { pred, input } => Box::new(FilterOp {
            pred: pred.clone(),
            input: build_operator(input)?,
        }),
        Plan::Project { items, input } => Box::new(ProjectOp {
            items: items.clone(),
            input: build_operator(input)?,
        }),
        Plan::Bind { binding, input } => Box::new(BindOp {
            binding: binding.clone(),
            input: build_operator(input)?,
        }),
        Plan::NestedLoopJoin { left, right, on } => Box::new(NestedLoopJoinOp {
            left: build_operator(left)?,
            right: build_operator(right)?,
            on: on.clone(),
            inner: Vec::new(),
            outer: None,
            inner_pos: 0,
        }),
        Plan::HashJoin {
            build,
            probe,
            build_keys,
            probe_keys,
        } => Box::new(HashJoinOp {
            build: build_operator(build)?,
            probe: build_operator(probe)?,
            build_keys: build_keys.clone(),
            probe_keys: probe_keys.clone(),
            table: HashMap::new(),
            pending: Vec::new(),
        }),
        Plan::Sort {
            keys,
            top_k,
            input,
        } => Box::new(SortOp {
            keys: keys.clone(),
            top_k: *top_k,
            input: build_operator(input)?,
            sorted: Vec::new(),
            pos: 0,
        }),
        Plan::Limit {
            limit,
            offset,
            input,
        } => Box::new(LimitOp {
            limit: *limit,
            offset: *offset,
            input: build_operator(input)?,
            skipped: 0,
            emitted: 0,
        }),
        Plan::Group { keys, aggs, input } => Box::new(GroupOp {
            keys: keys.clone(),
            aggs: aggs.clone(),
            input: build_operator(input)?,
            output: Vec::new(),
            pos: 0,
        }),
        Plan::Distinct { input } => Box::new(DistinctOp {
            input: build_operator(input)?,
            seen: HashSet::new(),
        }),
        Plan::Union { all, inputs } => Box::new(UnionOp {
            inputs: inputs
                .iter()
                .map(build_operator)
                .collect::<Result<Vec<_>, _>>()?,
            all: *all,
            current: 0,
            seen: HashSet::new(),
        }),
        Plan::Values { rows } => Box::new(ValuesOp {
            rows: rows.clone(),
            pos: 0,
        }),
        Plan::Insert { .. } | Plan::Update { .. } | Plan::Delete { .. } => {
            return Err(NovusError::Parse(
                "write operator cannot stream rows".into(),
            ))
        }
    })
}

struct SeqScanOp {
    collection: String,
    binding: String,
    cursor: Option<heap::ScanCursor>,
}

impl Operator for SeqScanOp {
    fn open(&mut self, cx: &mut ExecContext) -> Result<(), NovusError> {
        let meta = cx
            .catalog
            .collection(&self.collection)
            .ok_or_else(|| NovusError::Schema(format!("unknown collection: {}", self.collection)))?;
        self.cursor = Some(heap::ScanCursor::new(meta.root_page));
        Ok(())
    }

    fn next(&mut self, cx: &mut ExecContext) -> Result<Option<Row>, NovusError> {
        let cursor = self.cursor.as_mut().expect("scan opened");
        match heap::scan_next(cx.io, cursor)? {
            Some((record_id, loc, doc)) => {
                Ok(Some(Row::from_record(&self.binding, record_id, loc, doc)))
            }
            None => Ok(None),
        }
    }

    fn close(&mut self) {
        self.cursor = None;
    }
}

enum IndexProbe {
    Seek(Vec<Vec<u8>>),
    Range {
        lo: Vec<u8>,
        hi: Vec<u8>,
        lo_open: bool,
        hi_open: bool,
    },
}

/// Seek or range over one index; locations materialize at open, records
/// stream from the heap on demand.
struct IndexAccessOp {
    collection: String,
    binding: String,
    field: String,
    probe: IndexProbe,
    hits: Vec<crate::index::IndexEntry>,
    pos: usize,
}

impl Operator for IndexAccessOp {
    fn open(&mut self, cx: &mut ExecContext) -> Result<(), NovusError> {
        let meta = cx
            .catalog
            .index_of(&self.collection, &self.field)
            .ok_or_else(|| {
                NovusError::Schema(format!(
                    "unknown index: {}.{}",
                    self.collection, self.field
                ))
            })?;
        let tree = BTree::open(meta.root_page);
        self.hits.clear();
        match &self.probe {
            IndexProbe::Seek(keys) => {
                let mut seen = HashSet::new();
                for key in keys {
                    for entry in tree.lookup(cx.io, key)? {
                        if seen.insert(entry.record_id) {
                            self.hits.push(entry);
                        }
                    }
                }
            }
            IndexProbe::Range {
                lo,
                hi,
                lo_open,
                hi_open,
            } => {
                for (key, entry) in tree.range_scan(cx.io, lo, hi)? {
                    if *lo_open && key == *lo {
                        continue;
                    }
                    if *hi_open && key == *hi {
                        continue;
                    }
                    self.hits.push(entry);
                }
            }
        }
        self.pos = 0;
        Ok(())
    }

    fn next(&mut self, cx: &mut ExecContext) -> Result<Option<Row>, NovusError> {
        if self.pos >= self.hits.len() {
            return Ok(None);
        }
        let entry = self.hits[self.pos];
        self.pos += 1;
        let (record_id, doc) = heap::read(cx.io, entry.loc).map_err(|e| match e {
            NovusError::NotFound => NovusError::Corruption(format!(
                "index {}.{} points at a dead record",
                self.collection, self.field
            )),
            other => other,
        })?;
        Ok(Some(Row::from_record(
            &self.binding,
            record_id,
            entry.loc,
            doc,
        )))
    }

    fn close(&mut self) {
        self.hits.clear();
    }
}

struct FilterOp {
    pred: crate::query::ast::Expr,
    input: Box<dyn Operator>,
}

impl Operator for FilterOp {
    fn open(&mut self, cx: &mut ExecContext) -> Result<(), NovusError> {
        self.input.open(cx)
    }

    fn next(&mut self, cx: &mut ExecContext) -> Result<Option<Row>, NovusError> {
        while let Some(row) = self.input.next(cx)? {
            if eval(&self.pred, &row, cx)? == Value::Bool(true) {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }

    fn close(&mut self) {
        self.input.close();
    }
}

struct ProjectOp {
    items: Vec<(String, crate::query::ast::Expr)>,
    input: Box<dyn Operator>,
}

impl Operator for ProjectOp {
    fn open(&mut self, cx: &mut ExecContext) -> Result<(), NovusError> {
        self.input.open(cx)
    }

    fn next(&mut self, cx: &mut ExecContext) -> Result<Option<Row>, NovusError> {
        let Some(row) = self.input.next(cx)? else {
            return Ok(None);
        };
        let mut doc = Document::new();
        for (name, expr) in &self.items {
            let value = eval(expr, &row, cx)?;
            doc.insert(name.clone(), value);
        }
        // Keep the pre-projection document reachable so ORDER BY can still
        // see columns that were not projected.
        let mut ctx = row.ctx;
        ctx.push((String::new(), row.doc));
        Ok(Some(Row {
            doc,
            ctx,
            rid: None,
        }))
    }

    fn close(&mut self) {
        self.input.close();
    }
}

struct BindOp {
    binding: String,
    input: Box<dyn Operator>,
}

impl Operator for BindOp {
    fn open(&mut self, cx: &mut ExecContext) -> Result<(), NovusError> {
        self.input.open(cx)
    }

    fn next(&mut self, cx: &mut ExecContext) -> Result<Option<Row>, NovusError> {
        let Some(row) = self.input.next(cx)? else {
            return Ok(None);
        };
        Ok(Some(Row {
            ctx: vec![(self.binding.clone(), row.doc.clone())],
            doc: row.doc,
            rid: None,
        }))
    }

    fn close(&mut self) {
        self.input.close();
    }
}

/// Inner side buffers at open; the outer streams.
struct NestedLoopJoinOp {
    left: Box<dyn Operator>,
    right: Box<dyn Operator>,
    on: Option<crate::query::ast::Expr>,
    inner: Vec<Row>,
    outer: Option<Row>,
    inner_pos: usize,
}

impl Operator for NestedLoopJoinOp {
    fn open(&mut self, cx: &mut ExecContext) -> Result<(), NovusError> {
        self.left.open(cx)?;
        self.right.open(cx)?;
        self.inner.clear();
        while let Some(row) = self.right.next(cx)? {
            self.inner.push(row);
        }
        self.right.close();
        self.outer = None;
        self.inner_pos = 0;
        Ok(())
    }

    fn next(&mut self, cx: &mut ExecContext) -> Result<Option<Row>, NovusError> {
        loop {
            if self.outer.is_none() {
                self.outer = self.left.next(cx)?;
                self.inner_pos = 0;
                if self.outer.is_none() {
                    return Ok(None);
                }
            }
            let outer = self.outer.as_ref().expect("outer row present").clone();
            while self.inner_pos < self.inner.len() {
                let candidate = merge_rows(&outer, &self.inner[self.inner_pos]);
                self.inner_pos += 1;
                let hit = match &self.on {
                    None => true,
                    Some(pred) => eval(pred, &candidate, cx)? == Value::Bool(true),
                };
                if hit {
                    return Ok(Some(candidate));
                }
            }
            self.outer = None;
        }
    }

    fn close(&mut self) {
        self.left.close();
        self.inner.clear();
    }
}

struct HashJoinOp {
    build: Box<dyn Operator>,
    probe: Box<dyn Operator>,
    build_keys: Vec<crate::query::ast::Expr>,
    probe_keys: Vec<crate::query::ast::Expr>,
    table: HashMap<Vec<u8>, Vec<Row>>,
    pending: Vec<Row>,
}

impl Operator for HashJoinOp {
    fn open(&mut self, cx: &mut ExecContext) -> Result<(), NovusError> {
        self.build.open(cx)?;
        self.table.clear();
        while let Some(row) = self.build.next(cx)? {
            if let Some(key) = join_key(&row, &self.build_keys, cx)? {
                self.table.entry(key).or_default().push(row);
            }
        }
        self.build.close();
        self.probe.open(cx)?;
        self.pending.clear();
        Ok(())
    }

    fn next(&mut self, cx: &mut ExecContext) -> Result<Option<Row>, NovusError> {
        loop {
            if let Some(row) = self.pending.pop() {
                return Ok(Some(row));
            }
            let Some(probe_row) = self.probe.next(cx)? else {
                return Ok(None);
            };
            let Some(key) = join_key(&probe_row, &self.probe_keys, cx)? else {
                continue;
            };
            if let Some(matches) = self.table.get(&key) {
                // Reversed so pops emit in build order.
                for build_row in matches.iter().rev() {
                    self.pending.push(merge_rows(&probe_row, build_row));
                }
            }
        }
    }

    fn close(&mut self) {
        self.probe.close();
        self.table.clear();
        self.pending.clear();
    }
}

/// Equi-join key bytes; `None` when any component is NULL (NULL never
/// joins).
fn join_key(
    row: &Row,
    keys: &[crate::query::ast::Expr],
    cx: &mut ExecContext,
) -> Result<Option<Vec<u8>>, NovusError> {
    let mut out = Vec::new();
    for key in keys {
        let value = eval(key, row, cx)?;
        if value.is_null() {
            return Ok(None);
        }
        let bytes = canonical_key_bytes(&value)?;
        out.write_u32::<LittleEndian>(bytes.len() as u32)?;
        out.extend_from_slice(&bytes);
    }
    Ok(Some(out))
}

/// Canonical equality bytes: ints that fit f64 exactly unify with floats so
/// `5` and `5.0` hash together, matching the comparison semantics.
fn canonical_key_bytes(value: &Value) -> Result<Vec<u8>, NovusError> {
    const EXACT: i64 = 1 << 53;
    match value {
        Value::Int(i) if i.unsigned_abs() <= EXACT as u64 => {
            Ok(value_to_key(&Value::Float(*i as f64))?.expect("float key"))
        }
        Value::Float(f)
            if f.is_finite() && f.fract() == 0.0 && f.abs() > EXACT as f64 && *f >= i64::MIN as f64 && *f <= i64::MAX as f64 =>
        {
            Ok(value_to_key(&Value::Int(*f as i64))?.expect("int key"))
        }
        Value::Doc(_) | Value::Array(_) => encode_value_bytes(value),
        other => match value_to_key(other)? {
            Some(key) => Ok(key),
            None => encode_value_bytes(other),
        },
    }
}

struct SortOp {
    keys: Vec<(crate::query::ast::Expr, bool)>,
    top_k: Option<usize>,
    input: Box<dyn Operator>,
    sorted: Vec<Row>,
    pos: usize,
}

impl Operator for SortOp {
    fn open(&mut self, cx: &mut ExecContext) -> Result<(), NovusError> {
        self.input.open(cx)?;
        let dirs: Arc<Vec<bool>> = Arc::new(self.keys.iter().map(|(_, d)| *d).collect());

        if let Some(k) = self.top_k {
            // Top-k heap: only the best k rows stay buffered.
            let mut heap: std::collections::BinaryHeap<HeapEntry> =
                std::collections::BinaryHeap::with_capacity(k + 1);
            let mut seq = 0usize;
            while let Some(row) = self.input.next(cx)? {
                let keys = self.sort_key(&row, cx)?;
                heap.push(HeapEntry {
                    keys,
                    dirs: Arc::clone(&dirs),
                    seq,
                    row,
                });
                seq += 1;
                if heap.len() > k {
                    heap.pop();
                }
            }
            self.sorted = heap
                .into_sorted_vec()
                .into_iter()
                .map(|entry| entry.row)
                .collect();
        } else {
            let mut rows: Vec<(Vec<Value>, Row)> = Vec::new();
            while let Some(row) = self.input.next(cx)? {
                rows.push((self.sort_key(&row, cx)?, row));
            }
            rows.sort_by(|a, b| order_cmp(&a.0, &b.0, &dirs));
            self.sorted = rows.into_iter().map(|(_, row)| row).collect();
        }
        self.input.close();
        self.pos = 0;
        Ok(())
    }

    fn next(&mut self, _cx: &mut ExecContext) -> Result<Option<Row>, NovusError> {
        if self.pos >= self.sorted.len() {
            return Ok(None);
        }
        let row = self.sorted[self.pos].clone();
        self.pos += 1;
        Ok(Some(row))
    }

    fn close(&mut self) {
        self.sorted.clear();
    }
}

impl SortOp {
    fn sort_key(&self, row: &Row, cx: &mut ExecContext) -> Result<Vec<Value>, NovusError> {
        self.keys
            .iter()
            .map(|(expr, _)| eval(expr, row, cx))
            .collect()
    }
}

struct HeapEntry {
    keys: Vec<Value>,
    dirs: Arc<Vec<bool>>,
    seq: usize,
    row: Row,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        order_cmp(&self.keys, &other.keys, &self.dirs).then(self.seq.cmp(&other.seq))
    }
}

/// Total ordering for sort keys: NULL first, then by type family, then
/// in-type; NaN sorts after every other number.
fn value_order(a: &Value, b: &Value) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a.is_null(), b.is_null()) {
        (true, true) => return Ordering::Equal,
        (true, false) => return Ordering::Less,
        (false, true) => return Ordering::Greater,
        _ => {}
    }
    let rank = |v: &Value| match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Int(_) | Value::Float(_) => 2,
        Value::Str(_) => 3,
        Value::Doc(_) => 4,
        Value::Array(_) => 5,
    };
    let (ra, rb) = (rank(a), rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    if let Some(ord) = a.compare(b) {
        return ord;
    }
    match (a.as_f64(), b.as_f64()) {
        // At least one NaN.
        (Some(x), Some(y)) => match (x.is_nan(), y.is_nan()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            _ => Ordering::Equal,
        },
        _ => {
            let ea = encode_value_bytes(a).unwrap_or_default();
            let eb = encode_value_bytes(b).unwrap_or_default();
            ea.cmp(&eb)
        }
    }
}

fn order_cmp(a: &[Value], b: &[Value], dirs: &[bool]) -> std::cmp::Ordering {
    for (i, desc) in dirs.iter().enumerate() {
        let ord = value_order(&a[i], &b[i]);
        let ord = if *desc { ord.reverse() } else { ord };
        if ord != std::cmp::Ordering::Equal {
            return ord;
        }
    }
    std::cmp::Ordering::Equal
}

struct LimitOp {
    limit: Option<u64>,
    offset: u64,
    input: Box<dyn Operator>,
    skipped: u64,
    emitted: u64,
}

impl Operator for LimitOp {
    fn open(&mut self, cx: &mut ExecContext) -> Result<(), NovusError> {
        self.skipped = 0;
        self.emitted = 0;
        self.input.open(cx)
    }

    fn next(&mut self, cx: &mut ExecContext) -> Result<Option<Row>, NovusError> {
        if let Some(limit) = self.limit {
            if self.emitted >= limit {
                return Ok(None);
            }
        }
        while self.skipped < self.offset {
            if self.input.next(cx)?.is_none() {
                return Ok(None);
            }
            self.skipped += 1;
        }
        match self.input.next(cx)? {
            Some(row) => {
                self.emitted += 1;
                Ok(Some(row))
            }
            None => Ok(None),
        }
    }

    fn close(&mut self) {
        self.input.close();
    }
}

#[derive(Default)]
struct AggState {
    count: i64,
    sum: Option<Value>,
    min: Option<Value>,
    max: Option<Value>,
    distinct: HashSet<Vec<u8>>,
}

impl AggState {
    fn update(&mut self, value: Option<&Value>) -> Result<(), NovusError> {
        let Some(value) = value else {
            // COUNT(*) counts rows.
            self.count += 1;
            return Ok(());
        };
        if value.is_null() {
            return Ok(());
        }
        self.count += 1;
        self.distinct.insert(canonical_key_bytes(value)?);
        self.sum = Some(match &self.sum {
            None => value.clone(),
            Some(Value::Int(a)) => match value {
                Value::Int(b) => a
                    .checked_add(*b)
                    .map(Value::Int)
                    .ok_or_else(|| NovusError::Type("integer overflow in SUM".into()))?,
                other => Value::Float(*a as f64 + other.as_f64().unwrap_or(0.0)),
            },
            Some(Value::Float(a)) => Value::Float(a + value.as_f64().unwrap_or(0.0)),
            Some(other) => other.clone(),
        });
        if self
            .min
            .as_ref()
            .map(|m| value_order(value, m).is_lt())
            .unwrap_or(true)
        {
            self.min = Some(value.clone());
        }
        if self
            .max
            .as_ref()
            .map(|m| value_order(value, m).is_gt())
            .unwrap_or(true)
        {
            self.max = Some(value.clone());
        }
        Ok(())
    }

    fn finalize(&self, func: AggFunc, distinct: bool) -> Value {
        match func {
            AggFunc::Count => {
                if distinct {
                    Value::Int(self.distinct.len() as i64)
                } else {
                    Value::Int(self.count)
                }
            }
            AggFunc::Sum => self.sum.clone().unwrap_or(Value::Null),
            AggFunc::Avg => match (&self.sum, self.count) {
                (Some(sum), n) if n > 0 => {
                    Value::Float(sum.as_f64().unwrap_or(0.0) / n as f64)
                }
                _ => Value::Null,
            },
            AggFunc::Min => self.min.clone().unwrap_or(Value::Null),
            AggFunc::Max => self.max.clone().unwrap_or(Value::Null),
        }
    }
}

/// Hash grouping; one output row per key, aggregates finalized when the
/// input is exhausted. With no keys, exactly one row comes out even for
/// empty input.
struct GroupOp {
    keys: Vec<(String, crate::query::ast::Expr)>,
    aggs: Vec<AggSpec>,
    input: Box<dyn Operator>,
    output: Vec<Row>,
    pos: usize,
}

impl Operator for GroupOp {
    fn open(&mut self, cx: &mut ExecContext) -> Result<(), NovusError> {
        self.input.open(cx)?;

        let mut order: Vec<Vec<u8>> = Vec::new();
        let mut groups: HashMap<Vec<u8>, (Vec<Value>, Vec<AggState>)> = HashMap::new();

        while let Some(row) = self.input.next(cx)? {
            let mut key_values = Vec::with_capacity(self.keys.len());
            let mut key_bytes = Vec::new();
            for (_, expr) in &self.keys {
                let value = eval(expr, &row, cx)?;
                let bytes = canonical_key_bytes(&value)?;
                key_bytes.write_u32::<LittleEndian>(bytes.len() as u32)?;
                key_bytes.extend_from_slice(&bytes);
                key_values.push(value);
            }
            if !groups.contains_key(&key_bytes) {
                order.push(key_bytes.clone());
                let states: Vec<AggState> =
                    (0..self.aggs.len()).map(|_| AggState::default()).collect();
                groups.insert(key_bytes.clone(), (key_values, states));
            }
            let entry = groups.get_mut(&key_bytes).expect("group just ensured");
            for (spec, state) in self.aggs.iter().zip(entry.1.iter_mut()) {
                match &spec.arg {
                    None => state.update(None)?,
                    Some(arg) => {
                        let value = eval(arg, &row, cx)?;
                        state.update(Some(&value))?;
                    }
                }
            }
        }
        self.input.close();

        if self.keys.is_empty() && groups.is_empty() {
            let states: Vec<AggState> = (0..self.aggs.len()).map(|_| AggState::default()).collect();
            order.push(Vec::new());
            groups.insert(Vec::new(), (Vec::new(), states));
        }

        self.output.clear();
        for key in order {
            let (key_values, states) = groups.remove(&key).expect("group present");
            let mut doc = Document::new();
            for ((name, _), value) in self.keys.iter().zip(key_values) {
                doc.set_path(name, value);
            }
            for (spec, state) in self.aggs.iter().zip(states.iter()) {
                doc.insert(spec.out.clone(), state.finalize(spec.func, spec.distinct));
            }
            self.output.push(Row {
                doc,
                ctx: Vec::new(),
                rid: None,
            });
        }
        self.pos = 0;
        Ok(())
    }

    fn next(&mut self, _cx: &mut ExecContext) -> Result<Option<Row>, NovusError> {
        if self.pos >= self.output.len() {
            return Ok(None);
        }
        let row = self.output[self.pos].clone();
        self.pos += 1;
        Ok(Some(row))
    }

    fn close(&mut self) {
        self.output.clear();
    }
}

struct DistinctOp {
    input: Box<dyn Operator>,
    seen: HashSet<Vec<u8>>,
}

impl Operator for DistinctOp {
    fn open(&mut self, cx: &mut ExecContext) -> Result<(), NovusError> {
        self.seen.clear();
        self.input.open(cx)
    }

    fn next(&mut self, cx: &mut ExecContext) -> Result<Option<Row>, NovusError> {
        while let Some(row) = self.input.next(cx)? {
            let key = encode_document(&row.doc)?;
            if self.seen.insert(key) {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }

    fn close(&mut self) {
        self.input.close();
        self.seen.clear();
    }
}

struct UnionOp {
    inputs: Vec<Box<dyn Operator>>,
    all: bool,
    current: usize,
    seen: HashSet<Vec<u8>>,
}

impl Operator for UnionOp {
    fn open(&mut self, cx: &mut ExecContext) -> Result<(), NovusError> {
        for input in &mut self.inputs {
            input.open(cx)?;
        }
        self.current = 0;
        self.seen.clear();
        Ok(())
    }

    fn next(&mut self, cx: &mut ExecContext) -> Result<Option<Row>, NovusError> {
        while self.current < self.inputs.len() {
            match self.inputs[self.current].next(cx)? {
                Some(row) => {
                    if self.all {
                        return Ok(Some(row));
                    }
                    let key = match row.rid {
                        Some((record_id, _)) => {
                            let mut key = Vec::with_capacity(8);
                            key.write_u64::<LittleEndian>(record_id)?;
                            key
                        }
                        None => encode_document(&row.doc)?,
                    };
                    if self.seen.insert(key) {
                        return Ok(Some(row));
                    }
                }
                None => self.current += 1,
            }
        }
        Ok(None)
    }

    fn close(&mut self) {
        for input in &mut self.inputs {
            input.close();
        }
    }
}

struct ValuesOp {
    rows: Vec<Vec<(String, crate::query::ast::Expr)>>,
    pos: usize,
}

impl Operator for ValuesOp {
    fn open(&mut self, _cx: &mut ExecContext) -> Result<(), NovusError> {
        self.pos = 0;
        Ok(())
    }

    fn next(&mut self, cx: &mut ExecContext) -> Result<Option<Row>, NovusError> {
        if self.pos >= self.rows.len() {
            return Ok(None);
        }
        let fields = self.rows[self.pos].clone();
        self.pos += 1;
        let empty = Row::default();
        let mut doc = Document::new();
        for (path, expr) in &fields {
            let value = eval(expr, &empty, cx)?;
            doc.set_path(path, value);
        }
        Ok(Some(Row {
            doc,
            ctx: Vec::new(),
            rid: None,
        }))
    }

    fn close(&mut self) {}
}

/// Result of one statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecOutcome {
    pub docs: Option<Vec<Document>>,
    pub rows_affected: u64,
    pub last_insert_id: u64,
}

pub fn run_plan(plan: &Plan, cx: &mut ExecContext) -> Result<ExecOutcome, NovusError> {
    match plan {
        Plan::Insert {
            collection,
            source,
            or_replace,
        } => run_insert(collection, source, *or_replace, cx),
        Plan::Update {
            collection,
            sets,
            source,
        } => run_update(collection, sets, source, cx),
        Plan::Delete { collection, source } => run_delete(collection, source, cx),
        _ => {
            let mut op = build_operator(plan)?;
            op.open(cx)?;
            let mut docs = Vec::new();
            while let Some(row) = op.next(cx)? {
                docs.push(row.doc);
            }
            op.close();
            Ok(ExecOutcome {
                docs: Some(docs),
                rows_affected: 0,
                last_insert_id: 0,
            })
        }
    }
}

/// First projected value of each result row; used by IN/scalar subqueries.
pub fn run_select_values(
    select: &SelectStmt,
    cx: &mut ExecContext,
) -> Result<Vec<Value>, NovusError> {
    let plan = plan_select(select, cx.catalog)?;
    let out = run_plan(&plan, cx)?;
    Ok(out
        .docs
        .unwrap_or_default()
        .into_iter()
        .map(|doc| {
            doc.fields()
                .first()
                .map(|(_, v)| v.clone())
                .unwrap_or(Value::Null)
        })
        .collect())
}

fn drain_source(source: &Plan, cx: &mut ExecContext) -> Result<Vec<Row>, NovusError> {
    let mut op = build_operator(source)?;
    op.open(cx)?;
    let mut rows = Vec::new();
    while let Some(row) = op.next(cx)? {
        rows.push(row);
    }
    op.close();
    Ok(rows)
}

fn run_insert(
    collection: &str,
    source: &Plan,
    or_replace: bool,
    cx: &mut ExecContext,
) -> Result<ExecOutcome, NovusError> {
    let rows = drain_source(source, cx)?;
    let mut affected = 0u64;
    let mut last_id = 0u64;
    for row in rows {
        last_id = insert_document(cx, collection, row.doc, or_replace)?;
        affected += 1;
    }
    Ok(ExecOutcome {
        docs: None,
        rows_affected: affected,
        last_insert_id: last_id,
    })
}

/// Insert one document, maintaining every index of the collection. With
/// `or_replace`, a live record whose `id` field equals the new document's
/// replaces in place instead.
pub fn insert_document(
    cx: &mut ExecContext,
    collection: &str,
    doc: Document,
    or_replace: bool,
) -> Result<u64, NovusError> {
    let io = cx.io;

    if or_replace {
        if let Some(id_value) = doc.get("id").filter(|v| !v.is_null()).cloned() {
            if let Some((record_id, loc, old_doc)) =
                find_by_field(cx, collection, "id", &id_value)?
            {
                replace_document(cx, collection, record_id, loc, &old_doc, &doc)?;
                return Ok(record_id);
            }
        }
    }

    let meta = cx.catalog.ensure_collection(collection);
    let record_id = meta.id_counter + 1;
    meta.id_counter = record_id;
    let mut state = meta.heap_state();
    let loc = heap::insert(io, &mut state, record_id, &doc)?;
    cx.catalog
        .collection_mut(collection)
        .expect("collection ensured")
        .set_heap_state(state);

    apply_index_add(cx, collection, &doc, record_id, loc)?;
    Ok(record_id)
}

fn find_by_field(
    cx: &mut ExecContext,
    collection: &str,
    field: &str,
    value: &Value,
) -> Result<Option<(u64, RecordLoc, Document)>, NovusError> {
    let io = cx.io;
    if let Some(index_meta) = cx.catalog.index_of(collection, field) {
        let index = Index {
            collection: collection.to_string(),
            field: field.to_string(),
            unique: index_meta.unique,
            tree: BTree::open(index_meta.root_page),
        };
        for entry in index.seek_value(io, value)? {
            let (record_id, doc) = heap::read(io, entry.loc)?;
            return Ok(Some((record_id, entry.loc, doc)));
        }
        return Ok(None);
    }
    let Some(meta) = cx.catalog.collection(collection) else {
        return Ok(None);
    };
    let mut cursor = heap::ScanCursor::new(meta.root_page);
    while let Some((record_id, loc, doc)) = heap::scan_next(io, &mut cursor)? {
        if doc
            .get_path(field)
            .map(|v| v.loose_eq(value))
            .unwrap_or(false)
        {
            return Ok(Some((record_id, loc, doc)));
        }
    }
    Ok(None)
}

fn replace_document(
    cx: &mut ExecContext,
    collection: &str,
    record_id: u64,
    loc: RecordLoc,
    old_doc: &Document,
    new_doc: &Document,
) -> Result<(), NovusError> {
    let io = cx.io;
    let meta = cx
        .catalog
        .collection_mut(collection)
        .ok_or_else(|| NovusError::Schema(format!("unknown collection: {collection}")))?;
    let mut state = meta.heap_state();
    let new_loc = heap::update(io, &mut state, loc, record_id, new_doc)?;
    meta.set_heap_state(state);

    apply_index_change(cx, collection, record_id, loc, new_loc, old_doc, new_doc)
}

fn apply_index_add(
    cx: &mut ExecContext,
    collection: &str,
    doc: &Document,
    record_id: u64,
    loc: RecordLoc,
) -> Result<(), NovusError> {
    let io = cx.io;
    let metas: Vec<IndexMeta> = cx.catalog.indexes_of(collection).cloned().collect();
    for meta in metas {
        let mut index = Index {
            collection: meta.collection.clone(),
            field: meta.field.clone(),
            unique: meta.unique,
            tree: BTree::open(meta.root_page),
        };
        index.add_record(io, doc, record_id, loc)?;
        if index.tree.root != meta.root_page {
            cx.catalog
                .index_of_mut(&meta.collection, &meta.field)
                .expect("index present")
                .root_page = index.tree.root;
        }
    }
    Ok(())
}

fn apply_index_remove(
    cx: &mut ExecContext,
    collection: &str,
    doc: &Document,
    record_id: u64,
) -> Result<(), NovusError> {
    let io = cx.io;
    let metas: Vec<IndexMeta> = cx.catalog.indexes_of(collection).cloned().collect();
    for meta in metas {
        let mut index = Index {
            collection: meta.collection.clone(),
            field: meta.field.clone(),
            unique: meta.unique,
            tree: BTree::open(meta.root_page),
        };
        index.remove_record(io, doc, record_id)?;
        if index.tree.root != meta.root_page {
            cx.catalog
                .index_of_mut(&meta.collection, &meta.field)
                .expect("index present")
                .root_page = index.tree.root;
        }
    }
    Ok(())
}

/// Index maintenance for an update: entries move when the indexed value
/// changed or when the record itself moved.
fn apply_index_change(
    cx: &mut ExecContext,
    collection: &str,
    record_id: u64,
    old_loc: RecordLoc,
    new_loc: RecordLoc,
    old_doc: &Document,
    new_doc: &Document,
) -> Result<(), NovusError> {
    let io = cx.io;
    let metas: Vec<IndexMeta> = cx.catalog.indexes_of(collection).cloned().collect();
    for meta in metas {
        let old_value = old_doc.get_path(&meta.field);
        let new_value = new_doc.get_path(&meta.field);
        if old_loc == new_loc && old_value == new_value {
            continue;
        }
        let mut index = Index {
            collection: meta.collection.clone(),
            field: meta.field.clone(),
            unique: meta.unique,
            tree: BTree::open(meta.root_page),
        };
        index.remove_record(io, old_doc, record_id)?;
        index.add_record(io, new_doc, record_id, new_loc)?;
        if index.tree.root != meta.root_page {
            cx.catalog
                .index_of_mut(&meta.collection, &meta.field)
                .expect("index present")
                .root_page = index.tree.root;
        }
    }
    Ok(())
}

fn run_update(
    collection: &str,
    sets: &[(String, crate::query::ast::Expr)],
    source: &Plan,
    cx: &mut ExecContext,
) -> Result<ExecOutcome, NovusError> {
    let rows = drain_source(source, cx)?;
    let io = cx.io;
    let mut affected = 0u64;
    for row in rows {
        let (record_id, loc) = row
            .rid
            .ok_or_else(|| NovusError::Corruption("update source lost record identity".into()))?;
        let old_doc = row.doc.clone();
        let mut new_doc = old_doc.clone();
        for (path, expr) in sets {
            let value = eval(expr, &row, cx)?;
            new_doc.set_path(path, value);
        }

        let meta = cx
            .catalog
            .collection_mut(collection)
            .ok_or_else(|| NovusError::Schema(format!("unknown collection: {collection}")))?;
        let mut state = meta.heap_state();
        let new_loc = heap::update(io, &mut state, loc, record_id, &new_doc)?;
        meta.set_heap_state(state);

        apply_index_change(cx, collection, record_id, loc, new_loc, &old_doc, &new_doc)?;
        affected += 1;
    }
    Ok(ExecOutcome {
        docs: None,
        rows_affected: affected,
        last_insert_id: 0,
    })
}

fn run_delete(
    collection: &str,
    source: &Plan,
    cx: &mut ExecContext,
) -> Result<ExecOutcome, NovusError> {
    let rows = drain_source(source, cx)?;
    let io = cx.io;
    let mut affected = 0u64;
    for row in rows {
        let (record_id, loc) = row
            .rid
            .ok_or_else(|| NovusError::Corruption("delete source lost record identity".into()))?;
        heap::delete(io, loc)?;
        apply_index_remove(cx, collection, &row.doc, record_id)?;
        affected += 1;
    }
    Ok(ExecOutcome {
        docs: None,
        rows_affected: affected,
        last_insert_id: 0,
    })
}

/// Execute one non-transactional statement against the context. BEGIN,
/// COMMIT, and ROLLBACK never reach this layer; the database handle owns
/// them.
pub fn run_statement(stmt: &Statement, cx: &mut ExecContext) -> Result<ExecOutcome, NovusError> {
    match stmt {
        Statement::Select(_)
        | Statement::Insert(_)
        | Statement::Update(_)
        | Statement::Delete(_) => {
            let plan = plan_statement(stmt, cx.catalog)?;
            run_plan(&plan, cx)
        }
        Statement::Explain(inner) => {
            let plan = plan_statement(inner, cx.catalog)?;
            Ok(ExecOutcome {
                docs: Some(vec![plan.to_doc()]),
                rows_affected: 0,
                last_insert_id: 0,
            })
        }
        Statement::CreateIndex {
            collection,
            field,
            unique,
            if_not_exists,
        } => create_index(cx, collection, field, *unique, *if_not_exists),
        Statement::DropIndex {
            collection,
            field,
            if_exists,
        } => drop_index(cx, collection, field, *if_exists),
        Statement::CreateView { name, text, select } => {
            if cx.catalog.view(name).is_some() {
                return Err(NovusError::Schema(format!("view already exists: {name}")));
            }
            cx.catalog.views.push(ViewMeta {
                name: name.clone(),
                text: text.clone(),
                select: select.clone(),
            });
            Ok(ExecOutcome::default())
        }
        Statement::DropView { name, if_exists } => {
            let existed = cx.catalog.views.iter().any(|v| v.name == *name);
            if !existed && !if_exists {
                return Err(NovusError::Schema(format!("unknown view: {name}")));
            }
            cx.catalog.views.retain(|v| v.name != *name);
            Ok(ExecOutcome::default())
        }
        Statement::CreateSequence(def) => create_sequence(cx, def),
        Statement::DropSequence { name, if_exists } => {
            let existed = cx.catalog.sequences.iter().any(|s| s.name == *name);
            if !existed && !if_exists {
                return Err(NovusError::Schema(format!("unknown sequence: {name}")));
            }
            cx.catalog.sequences.retain(|s| s.name != *name);
            Ok(ExecOutcome::default())
        }
        Statement::DropTable { name, if_exists } => drop_table(cx, name, *if_exists),
        Statement::Truncate { name } => truncate_table(cx, name),
        Statement::Begin | Statement::Commit | Statement::Rollback => Err(
            NovusError::Transaction("transaction control outside the handle".into()),
        ),
    }
}

fn create_index(
    cx: &mut ExecContext,
    collection: &str,
    field: &str,
    unique: bool,
    if_not_exists: bool,
) -> Result<ExecOutcome, NovusError> {
    if cx.catalog.index_of(collection, field).is_some() {
        if if_not_exists {
            return Ok(ExecOutcome::default());
        }
        return Err(NovusError::Schema(format!(
            "index already exists: {collection}.{field}"
        )));
    }
    let io = cx.io;

    // Bulk-load from whatever records already exist.
    let mut entries: Vec<(Vec<u8>, crate::index::IndexEntry)> = Vec::new();
    if let Some(meta) = cx.catalog.collection(collection) {
        let mut cursor = heap::ScanCursor::new(meta.root_page);
        while let Some((record_id, loc, doc)) = heap::scan_next(io, &mut cursor)? {
            if let Some(value) = doc.get_path(field) {
                if let Some(key) = crate::index::key::indexable_key(value)? {
                    entries.push((key, crate::index::IndexEntry { record_id, loc }));
                }
            }
        }
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.record_id.cmp(&b.1.record_id)));
    let tree = BTree::bulk_load(io, &entries)?;

    cx.catalog.indexes.push(IndexMeta {
        collection: collection.to_string(),
        field: field.to_string(),
        root_page: tree.root,
        unique,
    });
    Ok(ExecOutcome::default())
}

fn drop_index(
    cx: &mut ExecContext,
    collection: &str,
    field: &str,
    if_exists: bool,
) -> Result<ExecOutcome, NovusError> {
    let io = cx.io;
    match cx.catalog.remove_index(collection, field) {
        Some(meta) => {
            BTree::open(meta.root_page).free(io)?;
            Ok(ExecOutcome::default())
        }
        None if if_exists => Ok(ExecOutcome::default()),
        None => Err(NovusError::Schema(format!(
            "unknown index: {collection}.{field}"
        ))),
    }
}

fn create_sequence(cx: &mut ExecContext, def: &SequenceDef) -> Result<ExecOutcome, NovusError> {
    if cx.catalog.sequence(&def.name).is_some() {
        return Err(NovusError::Schema(format!(
            "sequence already exists: {}",
            def.name
        )));
    }
    let increment = def.increment.unwrap_or(1);
    cx.catalog.sequences.push(SequenceMeta {
        name: def.name.clone(),
        current: def.start.unwrap_or(1),
        increment,
        min_value: def.min_value.unwrap_or(i64::MIN),
        max_value: def.max_value.unwrap_or(i64::MAX),
        cycle: def.cycle,
        started: false,
    });
    Ok(ExecOutcome::default())
}

fn drop_table(
    cx: &mut ExecContext,
    name: &str,
    if_exists: bool,
) -> Result<ExecOutcome, NovusError> {
    let io = cx.io;
    let index_roots: Vec<u32> = cx
        .catalog
        .indexes_of(name)
        .map(|m| m.root_page)
        .collect();
    match cx.catalog.drop_collection(name) {
        Some(meta) => {
            for root in index_roots {
                BTree::open(root).free(io)?;
            }
            heap::free_chain(io, meta.root_page)?;
            Ok(ExecOutcome::default())
        }
        None if if_exists => Ok(ExecOutcome::default()),
        None => Err(NovusError::Schema(format!("unknown collection: {name}"))),
    }
}

/// Drop all records but keep the collection, its indexes, and its id
/// counter (record ids are never reused).
fn truncate_table(cx: &mut ExecContext, name: &str) -> Result<ExecOutcome, NovusError> {
    let io = cx.io;
    let Some(meta) = cx.catalog.collection(name) else {
        return Err(NovusError::Schema(format!("unknown collection: {name}")));
    };
    let root = meta.root_page;
    heap::free_chain(io, root)?;
    let meta = cx.catalog.collection_mut(name).expect("checked above");
    meta.root_page = NO_PAGE;
    meta.last_page = NO_PAGE;

    let index_metas: Vec<IndexMeta> = cx.catalog.indexes_of(name).cloned().collect();
    for index_meta in index_metas {
        BTree::open(index_meta.root_page).free(io)?;
        let fresh = BTree::create(io)?;
        cx.catalog
            .index_of_mut(&index_meta.collection, &index_meta.field)
            .expect("index present")
            .root_page = fresh.root;
    }
    Ok(ExecOutcome::default())
}
