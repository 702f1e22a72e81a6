//! Tree-walking expression evaluation over a row.
//!
//! NULLs propagate per SQL three-valued logic: comparisons against NULL are
//! NULL, AND/OR follow Kleene logic, and a filter only passes rows whose
//! predicate is exactly TRUE. Int64 widens to float64 when types mix;
//! string comparison is bytewise. Comparisons between unrelated non-null
//! types are simply false (schemaless documents make them reachable), never
//! an error.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::core::errors::NovusError;
use crate::core::value::Value;
use crate::query::ast::{BinaryOp, Expr, SelectStmt, UnaryOp};
use crate::query::exec::{run_select_values, ExecContext, Row};

pub fn eval(expr: &Expr, row: &Row, cx: &mut ExecContext) -> Result<Value, NovusError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Column(path) => Ok(row.resolve(path).unwrap_or(Value::Null)),
        Expr::Param(i) => Err(NovusError::Parse(format!("unbound parameter ?{i}"))),
        Expr::Unary { op, expr } => {
            let v = eval(expr, row, cx)?;
            match op {
                UnaryOp::Not => Ok(match truthy(&v)? {
                    Some(b) => Value::Bool(!b),
                    None => Value::Null,
                }),
                UnaryOp::Neg => match v {
                    Value::Null => Ok(Value::Null),
                    Value::Int(i) => i
                        .checked_neg()
                        .map(Value::Int)
                        .ok_or_else(|| NovusError::Type("integer overflow".into())),
                    Value::Float(f) => Ok(Value::Float(-f)),
                    other => Err(NovusError::Type(format!(
                        "cannot negate {}",
                        other.type_name()
                    ))),
                },
            }
        }
        Expr::Binary { op, left, right } => eval_binary(*op, left, right, row, cx),
        Expr::IsNull { expr, negated } => {
            let v = eval(expr, row, cx)?;
            Ok(Value::Bool(v.is_null() != *negated))
        }
        Expr::Like {
            expr,
            pattern,
            negated,
        } => {
            let v = eval(expr, row, cx)?;
            let p = eval(pattern, row, cx)?;
            match (v, p) {
                (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
                (Value::Str(s), Value::Str(p)) => {
                    let hit = like_match(&s, &p);
                    Ok(Value::Bool(hit != *negated))
                }
                _ => Ok(Value::Bool(*negated)),
            }
        }
        Expr::Between {
            expr,
            low,
            high,
            negated,
        } => {
            let v = eval(expr, row, cx)?;
            let lo = eval(low, row, cx)?;
            let hi = eval(high, row, cx)?;
            let ge = compare(BinaryOp::Ge, &v, &lo);
            let le = compare(BinaryOp::Le, &v, &hi);
            let both = kleene_and(truthy(&ge)?, truthy(&le)?);
            Ok(match both {
                Some(b) => Value::Bool(b != *negated),
                None => Value::Null,
            })
        }
        Expr::InList {
            expr,
            list,
            negated,
        } => {
            let v = eval(expr, row, cx)?;
            let mut values = Vec::with_capacity(list.len());
            for item in list {
                values.push(eval(item, row, cx)?);
            }
            in_result(&v, &values, *negated)
        }
        Expr::InSelect {
            expr,
            select,
            negated,
        } => {
            let v = eval(expr, row, cx)?;
            let values = run_select_values(select, cx)?;
            in_result(&v, &values, *negated)
        }
        Expr::Case {
            operand,
            branches,
            else_expr,
        } => {
            for (when, then) in branches {
                let hit = match operand {
                    Some(op) => {
                        let lhs = eval(op, row, cx)?;
                        let rhs = eval(when, row, cx)?;
                        truthy(&compare(BinaryOp::Eq, &lhs, &rhs))?
                    }
                    None => truthy(&eval(when, row, cx)?)?,
                };
                if hit == Some(true) {
                    return eval(then, row, cx);
                }
            }
            match else_expr {
                Some(e) => eval(e, row, cx),
                None => Ok(Value::Null),
            }
        }
        Expr::Func { name, args } => eval_func(name, args, row, cx),
        Expr::Agg { .. } => Err(NovusError::Type(
            "aggregate used outside GROUP BY context".into(),
        )),
        Expr::Sysdate => Ok(Value::Str(timestamp_now())),
        Expr::SeqNext(name) => seq_next(name, cx),
        Expr::SeqCurr(name) => seq_curr(name, cx),
        Expr::Subquery(select) => scalar_subquery(select, cx),
    }
}

fn eval_binary(
    op: BinaryOp,
    left: &Expr,
    right: &Expr,
    row: &Row,
    cx: &mut ExecContext,
) -> Result<Value, NovusError> {
    // AND/OR short-circuit through Kleene logic.
    if matches!(op, BinaryOp::And | BinaryOp::Or) {
        let l = truthy(&eval(left, row, cx)?)?;
        if op == BinaryOp::And && l == Some(false) {
            return Ok(Value::Bool(false));
        }
        if op == BinaryOp::Or && l == Some(true) {
            return Ok(Value::Bool(true));
        }
        let r = truthy(&eval(right, row, cx)?)?;
        let out = if op == BinaryOp::And {
            kleene_and(l, r)
        } else {
            kleene_or(l, r)
        };
        return Ok(match out {
            Some(b) => Value::Bool(b),
            None => Value::Null,
        });
    }

    let l = eval(left, row, cx)?;
    let r = eval(right, row, cx)?;
    match op {
        BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            Ok(compare(op, &l, &r))
        }
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
            arith(op, &l, &r)
        }
        BinaryOp::Concat => concat(&l, &r),
        BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
    }
}

/// SQL comparison: NULL operands yield NULL; incomparable non-null types
/// compare unequal.
pub fn compare(op: BinaryOp, l: &Value, r: &Value) -> Value {
    if l.is_null() || r.is_null() {
        return Value::Null;
    }
    match l.compare(r) {
        Some(ord) => {
            let hit = match op {
                BinaryOp::Eq => ord.is_eq(),
                BinaryOp::Ne => ord.is_ne(),
                BinaryOp::Lt => ord.is_lt(),
                BinaryOp::Le => ord.is_le(),
                BinaryOp::Gt => ord.is_gt(),
                BinaryOp::Ge => ord.is_ge(),
                _ => false,
            };
            Value::Bool(hit)
        }
        None => {
            // Structural equality still applies to documents and arrays.
            let eq = l == r;
            Value::Bool(match op {
                BinaryOp::Eq => eq,
                BinaryOp::Ne => !eq,
                _ => false,
            })
        }
    }
}

fn arith(op: BinaryOp, l: &Value, r: &Value) -> Result<Value, NovusError> {
    if l.is_null() || r.is_null() {
        return Ok(Value::Null);
    }
    match (l, r) {
        (Value::Int(a), Value::Int(b)) => {
            let out = match op {
                BinaryOp::Add => a.checked_add(*b),
                BinaryOp::Sub => a.checked_sub(*b),
                BinaryOp::Mul => a.checked_mul(*b),
                BinaryOp::Div => {
                    if *b == 0 {
                        return Err(NovusError::Type("division by zero".into()));
                    }
                    a.checked_div(*b)
                }
                BinaryOp::Mod => {
                    if *b == 0 {
                        return Err(NovusError::Type("division by zero".into()));
                    }
                    a.checked_rem(*b)
                }
                _ => unreachable!(),
            };
            out.map(Value::Int)
                .ok_or_else(|| NovusError::Type("integer overflow".into()))
        }
        _ => {
            let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) else {
                return Err(NovusError::Type(format!(
                    "cannot apply arithmetic to {} and {}",
                    l.type_name(),
                    r.type_name()
                )));
            };
            let out = match op {
                BinaryOp::Add => a + b,
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div => a / b,
                BinaryOp::Mod => a % b,
                _ => unreachable!(),
            };
            Ok(Value::Float(out))
        }
    }
}

fn concat(l: &Value, r: &Value) -> Result<Value, NovusError> {
    if l.is_null() || r.is_null() {
        return Ok(Value::Null);
    }
    Ok(Value::Str(format!("{}{}", text_of(l)?, text_of(r)?)))
}

fn text_of(v: &Value) -> Result<String, NovusError> {
    match v {
        Value::Str(s) => Ok(s.clone()),
        Value::Int(i) => Ok(i.to_string()),
        Value::Float(f) => Ok(f.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(NovusError::Type(format!(
            "cannot render {} as text",
            other.type_name()
        ))),
    }
}

/// Boolean view for predicates; NULL is unknown.
pub fn truthy(v: &Value) -> Result<Option<bool>, NovusError> {
    match v {
        Value::Null => Ok(None),
        Value::Bool(b) => Ok(Some(*b)),
        other => Err(NovusError::Type(format!(
            "expected boolean, got {}",
            other.type_name()
        ))),
    }
}

fn kleene_and(l: Option<bool>, r: Option<bool>) -> Option<bool> {
    match (l, r) {
        (Some(false), _) | (_, Some(false)) => Some(false),
        (Some(true), Some(true)) => Some(true),
        _ => None,
    }
}

fn kleene_or(l: Option<bool>, r: Option<bool>) -> Option<bool> {
    match (l, r) {
        (Some(true), _) | (_, Some(true)) => Some(true),
        (Some(false), Some(false)) => Some(false),
        _ => None,
    }
}

fn in_result(needle: &Value, haystack: &[Value], negated: bool) -> Result<Value, NovusError> {
    if needle.is_null() {
        return Ok(Value::Null);
    }
    let mut saw_null = false;
    for candidate in haystack {
        if candidate.is_null() {
            saw_null = true;
            continue;
        }
        if needle.loose_eq(candidate) {
            return Ok(Value::Bool(!negated));
        }
    }
    if saw_null {
        return Ok(Value::Null);
    }
    Ok(Value::Bool(negated))
}

/// `%` matches any run, `_` one character; anchored at both ends.
fn like_match(s: &str, pattern: &str) -> bool {
    fn rec(s: &[char], p: &[char]) -> bool {
        match p.first() {
            None => s.is_empty(),
            Some('%') => {
                for skip in 0..=s.len() {
                    if rec(&s[skip..], &p[1..]) {
                        return true;
                    }
                }
                false
            }
            Some('_') => !s.is_empty() && rec(&s[1..], &p[1..]),
            Some(c) => s.first() == Some(c) && rec(&s[1..], &p[1..]),
        }
    }
    let s: Vec<char> = s.chars().collect();
    let p: Vec<char> = pattern.chars().collect();
    rec(&s, &p)
}

fn eval_func(
    name: &str,
    args: &[Expr],
    row: &Row,
    cx: &mut ExecContext,
) -> Result<Value, NovusError> {
    let mut values = Vec::with_capacity(args.len());
    for arg in args {
        values.push(eval(arg, row, cx)?);
    }
    let upper = name.to_ascii_uppercase();
    match (upper.as_str(), values.as_slice()) {
        ("COALESCE" | "NVL", _) => Ok(values
            .iter()
            .find(|v| !v.is_null())
            .cloned()
            .unwrap_or(Value::Null)),
        (_, [Value::Null, ..]) => Ok(Value::Null),
        ("LOWER", [Value::Str(s)]) => Ok(Value::Str(s.to_lowercase())),
        ("UPPER", [Value::Str(s)]) => Ok(Value::Str(s.to_uppercase())),
        ("TRIM", [Value::Str(s)]) => Ok(Value::Str(s.trim().to_string())),
        ("LENGTH", [Value::Str(s)]) => Ok(Value::Int(s.chars().count() as i64)),
        ("ABS", [Value::Int(i)]) => i
            .checked_abs()
            .map(Value::Int)
            .ok_or_else(|| NovusError::Type("integer overflow".into())),
        ("ABS", [Value::Float(f)]) => Ok(Value::Float(f.abs())),
        ("ROUND", [Value::Float(f)]) => Ok(Value::Float(f.round())),
        ("ROUND", [Value::Int(i)]) => Ok(Value::Int(*i)),
        ("SUBSTR", [Value::Str(s), Value::Int(start)]) => Ok(Value::Str(substr(s, *start, None))),
        ("SUBSTR", [Value::Str(s), Value::Int(start), Value::Int(len)]) => {
            Ok(Value::Str(substr(s, *start, Some(*len))))
        }
        _ => Err(NovusError::Schema(format!(
            "unknown function or bad arguments: {name}/{}",
            values.len()
        ))),
    }
}

/// Oracle-style 1-based SUBSTR.
fn substr(s: &str, start: i64, len: Option<i64>) -> String {
    let chars: Vec<char> = s.chars().collect();
    let begin = if start > 0 {
        (start - 1) as usize
    } else if start < 0 {
        chars.len().saturating_sub((-start) as usize)
    } else {
        0
    };
    let take = len.map(|l| l.max(0) as usize).unwrap_or(usize::MAX);
    chars.iter().skip(begin).take(take).collect()
}

fn seq_next(name: &str, cx: &mut ExecContext) -> Result<Value, NovusError> {
    let seq = cx
        .catalog
        .sequence_mut(name)
        .ok_or_else(|| NovusError::Schema(format!("unknown sequence: {name}")))?;
    if !seq.started {
        seq.started = true;
        return Ok(Value::Int(seq.current));
    }
    let stepped = seq.current.checked_add(seq.increment);
    let next = match stepped {
        Some(n) if n >= seq.min_value && n <= seq.max_value => n,
        _ if seq.cycle => {
            if seq.increment >= 0 {
                seq.min_value
            } else {
                seq.max_value
            }
        }
        _ => {
            return Err(NovusError::Constraint(format!(
                "sequence {name} exhausted"
            )))
        }
    };
    seq.current = next;
    Ok(Value::Int(next))
}

fn seq_curr(name: &str, cx: &mut ExecContext) -> Result<Value, NovusError> {
    let seq = cx
        .catalog
        .sequence(name)
        .ok_or_else(|| NovusError::Schema(format!("unknown sequence: {name}")))?;
    Ok(Value::Int(seq.current))
}

fn scalar_subquery(select: &SelectStmt, cx: &mut ExecContext) -> Result<Value, NovusError> {
    let mut values = run_select_values(select, cx)?;
    match values.len() {
        0 => Ok(Value::Null),
        1 => Ok(values.remove(0)),
        n => Err(NovusError::Type(format!(
            "scalar subquery returned {n} rows"
        ))),
    }
}

fn timestamp_now() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    format_timestamp(secs)
}

/// `YYYY-MM-DD HH:MM:SS` from unix seconds (days-from-civil inverse).
fn format_timestamp(secs: i64) -> String {
    let days = secs.div_euclid(86_400);
    let tod = secs.rem_euclid(86_400);

    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };

    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        y,
        m,
        d,
        tod / 3600,
        (tod % 3600) / 60,
        tod % 60
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_patterns() {
        assert!(like_match("oracle", "oracle"));
        assert!(like_match("oracle", "ora%"));
        assert!(like_match("oracle", "%acl%"));
        assert!(like_match("oracle", "o_acle"));
        assert!(!like_match("oracle", "ora"));
        assert!(!like_match("oracle", "_racle_"));
        assert!(like_match("", "%"));
    }

    #[test]
    fn kleene_tables() {
        assert_eq!(kleene_and(Some(false), None), Some(false));
        assert_eq!(kleene_and(Some(true), None), None);
        assert_eq!(kleene_or(Some(true), None), Some(true));
        assert_eq!(kleene_or(Some(false), None), None);
    }

    #[test]
    fn comparisons_with_null_are_null() {
        assert_eq!(compare(BinaryOp::Eq, &Value::Null, &Value::Int(1)), Value::Null);
        assert_eq!(
            compare(BinaryOp::Lt, &Value::Int(1), &Value::Null),
            Value::Null
        );
    }

    #[test]
    fn cross_type_comparison_is_false_not_an_error() {
        assert_eq!(
            compare(BinaryOp::Eq, &Value::from("5"), &Value::Int(5)),
            Value::Bool(false)
        );
        assert_eq!(
            compare(BinaryOp::Ne, &Value::from("5"), &Value::Int(5)),
            Value::Bool(true)
        );
    }

    #[test]
    fn widening_comparison() {
        assert_eq!(
            compare(BinaryOp::Eq, &Value::Int(3), &Value::Float(3.0)),
            Value::Bool(true)
        );
    }

    #[test]
    fn timestamp_formatting() {
        assert_eq!(format_timestamp(0), "1970-01-01 00:00:00");
        assert_eq!(format_timestamp(951_826_245), "2000-02-29 12:10:45");
    }

    #[test]
    fn substr_is_one_based() {
        assert_eq!(substr("oracle", 2, Some(3)), "rac");
        assert_eq!(substr("oracle", 1, None), "oracle");
        assert_eq!(substr("oracle", -2, None), "le");
    }
}
