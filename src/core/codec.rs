//! Binary document codec.
//!
//! Records are tag-prefixed with little-endian length prefixes for strings
//! and counts for documents/arrays. The whole encoding is wrapped in a
//! one-byte compression envelope: payloads above [`COMPRESSION_THRESHOLD`]
//! are Snappy-compressed when that actually shrinks them.

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::core::errors::NovusError;
use crate::core::value::{Document, Value};

const TAG_NULL: u8 = 0x00;
const TAG_FALSE: u8 = 0x01;
const TAG_TRUE: u8 = 0x02;
const TAG_INT: u8 = 0x03;
const TAG_FLOAT: u8 = 0x04;
const TAG_STRING: u8 = 0x05;
const TAG_DOC: u8 = 0x06;
const TAG_ARRAY: u8 = 0x07;

const COMPRESS_NONE: u8 = 0x00;
const COMPRESS_SNAPPY: u8 = 0x01;

/// Serialized documents above this size are candidates for compression.
pub const COMPRESSION_THRESHOLD: usize = 128;

pub fn encode_document(doc: &Document) -> Result<Vec<u8>, NovusError> {
    let mut raw = Vec::new();
    write_doc(&mut raw, doc)?;

    if raw.len() > COMPRESSION_THRESHOLD {
        let compressed = snap::raw::Encoder::new()
            .compress_vec(&raw)
            .map_err(|e| NovusError::Corruption(format!("snappy compress: {e}")))?;
        if compressed.len() < raw.len() {
            let mut out = Vec::with_capacity(1 + compressed.len());
            out.push(COMPRESS_SNAPPY);
            out.extend_from_slice(&compressed);
            return Ok(out);
        }
    }

    let mut out = Vec::with_capacity(1 + raw.len());
    out.push(COMPRESS_NONE);
    out.extend_from_slice(&raw);
    Ok(out)
}

pub fn decode_document(bytes: &[u8]) -> Result<Document, NovusError> {
    let (&env, body) = bytes
        .split_first()
        .ok_or_else(|| NovusError::Corruption("empty record payload".into()))?;
    let raw;
    let data: &[u8] = match env {
        COMPRESS_NONE => body,
        COMPRESS_SNAPPY => {
            raw = snap::raw::Decoder::new()
                .decompress_vec(body)
                .map_err(|e| NovusError::Corruption(format!("snappy decompress: {e}")))?;
            &raw
        }
        other => {
            return Err(NovusError::Corruption(format!(
                "unknown compression tag: {other}"
            )))
        }
    };

    let mut cursor = Cursor::new(data);
    let doc = read_doc(&mut cursor)?;
    Ok(doc)
}

fn write_doc(buf: &mut Vec<u8>, doc: &Document) -> Result<(), NovusError> {
    buf.write_u32::<LittleEndian>(doc.len() as u32)?;
    for (name, value) in doc.iter() {
        write_string(buf, name)?;
        write_value(buf, value)?;
    }
    Ok(())
}

/// Canonical byte encoding of a single value; used for hashing and
/// de-duplication as well as inside record payloads.
pub(crate) fn encode_value_bytes(value: &Value) -> Result<Vec<u8>, NovusError> {
    let mut buf = Vec::new();
    write_value(&mut buf, value)?;
    Ok(buf)
}

fn write_value(buf: &mut Vec<u8>, value: &Value) -> Result<(), NovusError> {
    match value {
        Value::Null => buf.push(TAG_NULL),
        Value::Bool(false) => buf.push(TAG_FALSE),
        Value::Bool(true) => buf.push(TAG_TRUE),
        Value::Int(i) => {
            buf.push(TAG_INT);
            buf.write_i64::<LittleEndian>(*i)?;
        }
        Value::Float(f) => {
            buf.push(TAG_FLOAT);
            buf.write_f64::<LittleEndian>(*f)?;
        }
        Value::Str(s) => {
            buf.push(TAG_STRING);
            write_string(buf, s)?;
        }
        Value::Doc(d) => {
            buf.push(TAG_DOC);
            write_doc(buf, d)?;
        }
        Value::Array(items) => {
            buf.push(TAG_ARRAY);
            buf.write_u32::<LittleEndian>(items.len() as u32)?;
            for item in items {
                write_value(buf, item)?;
            }
        }
    }
    Ok(())
}

fn write_string(buf: &mut Vec<u8>, s: &str) -> Result<(), NovusError> {
    buf.write_u32::<LittleEndian>(s.len() as u32)?;
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

fn read_doc(cursor: &mut Cursor<&[u8]>) -> Result<Document, NovusError> {
    let count = cursor.read_u32::<LittleEndian>()?;
    let mut doc = Document::new();
    for _ in 0..count {
        let name = read_string(cursor)?;
        let value = read_value(cursor)?;
        doc.insert(name, value);
    }
    Ok(doc)
}

fn read_value(cursor: &mut Cursor<&[u8]>) -> Result<Value, NovusError> {
    let tag = cursor.read_u8()?;
    match tag {
        TAG_NULL => Ok(Value::Null),
        TAG_FALSE => Ok(Value::Bool(false)),
        TAG_TRUE => Ok(Value::Bool(true)),
        TAG_INT => Ok(Value::Int(cursor.read_i64::<LittleEndian>()?)),
        TAG_FLOAT => Ok(Value::Float(cursor.read_f64::<LittleEndian>()?)),
        TAG_STRING => Ok(Value::Str(read_string(cursor)?)),
        TAG_DOC => Ok(Value::Doc(read_doc(cursor)?)),
        TAG_ARRAY => {
            let count = cursor.read_u32::<LittleEndian>()?;
            let mut items = Vec::with_capacity(count.min(1024) as usize);
            for _ in 0..count {
                items.push(read_value(cursor)?);
            }
            Ok(Value::Array(items))
        }
        other => Err(NovusError::Corruption(format!("unknown value tag: {other}"))),
    }
}

fn read_string(cursor: &mut Cursor<&[u8]>) -> Result<String, NovusError> {
    let len = cursor.read_u32::<LittleEndian>()? as usize;
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes)?;
    String::from_utf8(bytes)
        .map_err(|e| NovusError::Corruption(format!("invalid utf8 in record: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn doc(fields: Vec<(&str, Value)>) -> Document {
        fields
            .into_iter()
            .map(|(n, v)| (n.to_string(), v))
            .collect()
    }

    #[test]
    fn roundtrip_flat_document() {
        let d = doc(vec![
            ("type", Value::from("oracle")),
            ("retry", Value::Int(5)),
            ("ratio", Value::Float(0.25)),
            ("enabled", Value::Bool(true)),
            ("note", Value::Null),
        ]);
        let bytes = encode_document(&d).unwrap();
        assert_eq!(decode_document(&bytes).unwrap(), d);
    }

    #[test]
    fn roundtrip_nested_document() {
        let inner = doc(vec![("timeout", Value::Int(30))]);
        let d = doc(vec![
            ("params", Value::Doc(inner)),
            (
                "tags",
                Value::Array(vec![Value::from("a"), Value::Int(1), Value::Null]),
            ),
        ]);
        let bytes = encode_document(&d).unwrap();
        assert_eq!(decode_document(&bytes).unwrap(), d);
    }

    #[test]
    fn roundtrip_empty_document() {
        let d = Document::new();
        let bytes = encode_document(&d).unwrap();
        assert_eq!(bytes[0], super::COMPRESS_NONE);
        assert_eq!(decode_document(&bytes).unwrap(), d);
    }

    #[test]
    fn large_document_is_compressed() {
        let d = doc(vec![("blob", Value::Str("x".repeat(4096)))]);
        let bytes = encode_document(&d).unwrap();
        assert_eq!(bytes[0], super::COMPRESS_SNAPPY);
        assert!(bytes.len() < 4096);
        assert_eq!(decode_document(&bytes).unwrap(), d);
    }

    #[test]
    fn small_document_stays_raw() {
        let d = doc(vec![("k", Value::Int(1))]);
        let bytes = encode_document(&d).unwrap();
        assert_eq!(bytes[0], super::COMPRESS_NONE);
    }

    #[test]
    fn rejects_unknown_envelope() {
        assert!(matches!(
            decode_document(&[0x7f, 0, 0, 0, 0]),
            Err(NovusError::Corruption(_))
        ));
    }

    fn arb_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::Int),
            // NaN is excluded: it breaks the equality half of the property,
            // not the codec.
            prop_oneof![prop::num::f64::NORMAL, prop::num::f64::ZERO].prop_map(Value::Float),
            "[a-zA-Z0-9 ]{0,24}".prop_map(Value::Str),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::vec(("[a-z]{1,8}", inner), 0..4).prop_map(|fields| {
                    Value::Doc(
                        fields
                            .into_iter()
                            .map(|(n, v)| (n, v))
                            .collect::<Document>(),
                    )
                }),
            ]
        })
    }

    proptest! {
        #[test]
        fn roundtrip_random_documents(
            fields in prop::collection::vec(("[a-z]{1,8}", arb_value()), 0..6)
        ) {
            let d: Document = fields.into_iter().collect();
            let bytes = encode_document(&d).unwrap();
            prop_assert_eq!(decode_document(&bytes).unwrap(), d);
        }
    }
}
