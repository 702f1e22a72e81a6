//! Dynamic document values.
//!
//! A document is an ordered sequence of `(name, value)` fields; values are a
//! tagged variant over null/bool/int64/float64/string/document/array. Field
//! order is preserved on read and round-trips through the codec. Updates
//! produce new documents; records are rewritten rather than mutated in place.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Doc(Document),
    Array(Vec<Value>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Doc(_) => "document",
            Value::Array(_) => "array",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric view with int64 → float64 widening.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_doc(&self) -> Option<&Document> {
        match self {
            Value::Doc(d) => Some(d),
            _ => None,
        }
    }

    /// Total-order comparison where one exists.
    ///
    /// Null compares to nothing (three-valued logic handles it above this
    /// layer). Ints and floats compare numerically after widening; strings
    /// compare bytewise; bools false < true. Cross-type and NaN comparisons
    /// return `None`.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => None,
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Str(a), Value::Str(b)) => Some(a.as_bytes().cmp(b.as_bytes())),
            (Value::Int(_), Value::Float(_))
            | (Value::Float(_), Value::Int(_))
            | (Value::Float(_), Value::Float(_)) => {
                self.as_f64()?.partial_cmp(&other.as_f64()?)
            }
            _ => None,
        }
    }

    /// Equality for filters and join keys; cross numeric types compare by
    /// value, everything else structurally.
    pub fn loose_eq(&self, other: &Value) -> bool {
        match self.compare(other) {
            Some(ord) => ord == Ordering::Equal,
            None => self == other && !self.is_null(),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

/// Ordered field map. Lookups are linear; documents are small.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Document {
    fields: Vec<(String, Value)>,
}

impl Document {
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// Resolve a dotted path (`a.b.c`) through nested documents.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.get(parts.next()?)?;
        for part in parts {
            current = current.as_doc()?.get(part)?;
        }
        Some(current)
    }

    /// Insert or replace, preserving the position of an existing field.
    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some((_, v)) => *v = value,
            None => self.fields.push((name, value)),
        }
    }

    /// Set a dotted path, creating intermediate documents as needed. A
    /// non-document intermediate value is replaced by a document.
    pub fn set_path(&mut self, path: &str, value: Value) {
        match path.split_once('.') {
            None => self.insert(path, value),
            Some((head, rest)) => {
                if !matches!(self.get(head), Some(Value::Doc(_))) {
                    self.insert(head, Value::Doc(Document::new()));
                }
                if let Some((_, Value::Doc(nested))) =
                    self.fields.iter_mut().find(|(n, _)| n == head)
                {
                    nested.set_path(rest, value);
                }
            }
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        let idx = self.fields.iter().position(|(n, _)| n == name)?;
        Some(self.fields.remove(idx).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter().map(|(n, v)| (n, v))
    }

    pub fn fields(&self) -> &[(String, Value)] {
        &self.fields
    }
}

impl FromIterator<(String, Value)> for Document {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        let mut doc = Document::new();
        for (name, value) in iter {
            doc.insert(name, value);
        }
        doc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(fields: &[(&str, Value)]) -> Document {
        fields
            .iter()
            .map(|(n, v)| (n.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn insert_preserves_field_order() {
        let mut d = doc(&[("b", Value::Int(1)), ("a", Value::Int(2))]);
        d.insert("b", Value::Int(9));
        let names: Vec<&str> = d.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
        assert_eq!(d.get("b"), Some(&Value::Int(9)));
    }

    #[test]
    fn dotted_path_resolution() {
        let mut d = Document::new();
        d.set_path("params.timeout", Value::Int(30));
        assert_eq!(d.get_path("params.timeout"), Some(&Value::Int(30)));
        assert!(matches!(d.get("params"), Some(Value::Doc(_))));
        assert_eq!(d.get_path("params.missing"), None);
    }

    #[test]
    fn set_path_replaces_scalar_intermediate() {
        let mut d = doc(&[("a", Value::Int(1))]);
        d.set_path("a.b", Value::Int(2));
        assert_eq!(d.get_path("a.b"), Some(&Value::Int(2)));
    }

    #[test]
    fn numeric_widening_comparison() {
        assert_eq!(
            Value::Int(2).compare(&Value::Float(2.5)),
            Some(Ordering::Less)
        );
        assert!(Value::Int(3).loose_eq(&Value::Float(3.0)));
    }

    #[test]
    fn null_never_compares() {
        assert_eq!(Value::Null.compare(&Value::Null), None);
        assert!(!Value::Null.loose_eq(&Value::Null));
    }

    #[test]
    fn string_comparison_is_bytewise() {
        assert_eq!(
            Value::from("a").compare(&Value::from("aa")),
            Some(Ordering::Less)
        );
    }
}
