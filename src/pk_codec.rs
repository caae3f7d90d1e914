/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Self-describing binary encoding of a tuple of SQLite scalar values, used
//! as the opaque `pk` blob in every `T_meta` table and in payload rows.
//!
//! Layout: one byte giving the field count `n`, then for each field a
//! one-byte type tag, a varint length for variable-sized fields, and the
//! payload (network byte order for integers, IEEE-754 big-endian for
//! floats). Tuples are capped at 127 fields, matching the `i8` count byte
//! and the host's own composite-PK ceiling.

use crate::error::{Error, ErrorKind, Result};
use rusqlite::types::Value;

pub const MAX_FIELDS: usize = 127;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum TypeTag {
    Null = 0,
    Integer = 1,
    Float = 2,
    Text = 3,
    Blob = 4,
}

impl TypeTag {
    fn from_u8(b: u8) -> Result<Self> {
        Ok(match b {
            0 => TypeTag::Null,
            1 => TypeTag::Integer,
            2 => TypeTag::Float,
            3 => TypeTag::Text,
            4 => TypeTag::Blob,
            other => {
                return Err(Error::from(ErrorKind::Codec(format!(
                    "unknown pk field type tag {other}"
                ))))
            }
        })
    }
}

fn write_varint(out: &mut Vec<u8>, mut v: u64) {
    loop {
        let mut byte = (v & 0x7f) as u8;
        v >>= 7;
        if v != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if v == 0 {
            break;
        }
    }
}

fn read_varint(buf: &[u8], pos: &mut usize) -> Result<u64> {
    let mut result: u64 = 0;
    let mut shift = 0;
    loop {
        let byte = *buf
            .get(*pos)
            .ok_or_else(|| Error::from(ErrorKind::Codec("truncated varint".into())))?;
        *pos += 1;
        result |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > 63 {
            return Err(Error::from(ErrorKind::Codec("varint too long".into())));
        }
    }
    Ok(result)
}

/// Encode a tuple of values into the opaque PK blob.
pub fn encode(values: &[Value]) -> Result<Vec<u8>> {
    if values.len() > MAX_FIELDS {
        return Err(Error::from(ErrorKind::Codec(format!(
            "primary key has {} fields, max is {MAX_FIELDS}",
            values.len()
        ))));
    }
    let mut out = Vec::with_capacity(16 * values.len() + 1);
    out.push(values.len() as u8);
    for v in values {
        match v {
            Value::Null => out.push(TypeTag::Null as u8),
            Value::Integer(i) => {
                out.push(TypeTag::Integer as u8);
                out.extend_from_slice(&i.to_be_bytes());
            }
            Value::Real(f) => {
                out.push(TypeTag::Float as u8);
                out.extend_from_slice(&f.to_be_bytes());
            }
            Value::Text(s) => {
                out.push(TypeTag::Text as u8);
                write_varint(&mut out, s.len() as u64);
                out.extend_from_slice(s.as_bytes());
            }
            Value::Blob(b) => {
                out.push(TypeTag::Blob as u8);
                write_varint(&mut out, b.len() as u64);
                out.extend_from_slice(b);
            }
        }
    }
    Ok(out)
}

/// One decoded PK field, as handed to the visitor in [`decode`].
#[derive(Debug, Clone)]
pub struct DecodedField {
    pub index: usize,
    pub value: Value,
}

/// Decode a PK blob, calling `visit` once per field in order. Mirrors the
/// callback-based `decode_prikey` of the design doc rather than allocating
/// a `Vec` up front, so callers that only need to bind values into a
/// prepared statement can do so without an intermediate collection -- but
/// [`decode_to_vec`] below is provided for the common case.
pub fn decode(buf: &[u8], visit: impl FnMut(DecodedField) -> Result<()>) -> Result<()> {
    decode_prefix(buf, visit).map(|_consumed| ())
}

/// Like [`decode`], but returns the number of bytes consumed rather than
/// assuming the whole buffer is exactly one tuple. Lets callers split a
/// concatenation of back-to-back encoded tuples (e.g. a payload body, C8)
/// without a length-prefix framing layer on top of this codec.
pub fn decode_prefix(buf: &[u8], mut visit: impl FnMut(DecodedField) -> Result<()>) -> Result<usize> {
    let mut pos = 0usize;
    let n = *buf
        .first()
        .ok_or_else(|| Error::from(ErrorKind::Codec("empty pk blob".into())))? as usize;
    pos += 1;
    for index in 0..n {
        let tag_byte = *buf
            .get(pos)
            .ok_or_else(|| Error::from(ErrorKind::Codec("truncated pk blob".into())))?;
        pos += 1;
        let tag = TypeTag::from_u8(tag_byte)?;
        let value = match tag {
            TypeTag::Null => Value::Null,
            TypeTag::Integer => {
                let bytes: [u8; 8] = buf
                    .get(pos..pos + 8)
                    .ok_or_else(|| Error::from(ErrorKind::Codec("truncated integer".into())))?
                    .try_into()
                    .unwrap();
                pos += 8;
                Value::Integer(i64::from_be_bytes(bytes))
            }
            TypeTag::Float => {
                let bytes: [u8; 8] = buf
                    .get(pos..pos + 8)
                    .ok_or_else(|| Error::from(ErrorKind::Codec("truncated float".into())))?
                    .try_into()
                    .unwrap();
                pos += 8;
                Value::Real(f64::from_be_bytes(bytes))
            }
            TypeTag::Text => {
                let len = read_varint(buf, &mut pos)? as usize;
                let bytes = buf
                    .get(pos..pos + len)
                    .ok_or_else(|| Error::from(ErrorKind::Codec("truncated text".into())))?;
                pos += len;
                let s = std::str::from_utf8(bytes)
                    .map_err(|e| Error::from(ErrorKind::Codec(format!("invalid utf8: {e}"))))?;
                Value::Text(s.to_string())
            }
            TypeTag::Blob => {
                let len = read_varint(buf, &mut pos)? as usize;
                let bytes = buf
                    .get(pos..pos + len)
                    .ok_or_else(|| Error::from(ErrorKind::Codec("truncated blob".into())))?;
                pos += len;
                Value::Blob(bytes.to_vec())
            }
        };
        visit(DecodedField { index, value })?;
    }
    Ok(pos)
}

/// Convenience wrapper over [`decode`] that collects fields into a `Vec` in
/// order.
pub fn decode_to_vec(buf: &[u8]) -> Result<Vec<Value>> {
    let mut out = Vec::new();
    decode(buf, |field| {
        debug_assert_eq!(field.index, out.len());
        out.push(field.value);
        Ok(())
    })?;
    Ok(out)
}

/// Decode just the first tuple of `buf`, returning it along with how many
/// bytes it occupied so the caller can advance to the next one.
pub fn decode_to_vec_prefix(buf: &[u8]) -> Result<(Vec<Value>, usize)> {
    let mut out = Vec::new();
    let consumed = decode_prefix(buf, |field| {
        debug_assert_eq!(field.index, out.len());
        out.push(field.value);
        Ok(())
    })?;
    Ok((out, consumed))
}

/// Bind the decoded fields of a PK blob into a prepared statement at
/// positions `1..=n`.
pub fn bind_decoded(stmt: &mut rusqlite::Statement<'_>, buf: &[u8]) -> Result<()> {
    let values = decode_to_vec(buf)?;
    for (i, v) in values.into_iter().enumerate() {
        stmt.raw_bind_parameter(i + 1, v)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_mixed_tuple() {
        let values = vec![
            Value::Integer(i64::MIN),
            Value::Integer(i64::MAX),
            Value::Real(1.5),
            Value::Text("quote'd \"text\"".into()),
            Value::Blob(vec![]),
            Value::Blob(vec![0u8; 16]),
            Value::Null,
        ];
        let encoded = encode(&values).unwrap();
        let decoded = decode_to_vec(&encoded).unwrap();
        assert_eq!(values, decoded);
    }

    #[test]
    fn round_trips_single_field() {
        let values = vec![Value::Text("x".into())];
        let encoded = encode(&values).unwrap();
        assert_eq!(decode_to_vec(&encoded).unwrap(), values);
    }

    #[test]
    fn round_trips_max_field_count() {
        let values: Vec<Value> = (0..MAX_FIELDS as i64).map(Value::Integer).collect();
        let encoded = encode(&values).unwrap();
        assert_eq!(decode_to_vec(&encoded).unwrap(), values);
    }

    #[test]
    fn rejects_too_many_fields() {
        let values: Vec<Value> = (0..(MAX_FIELDS as i64 + 1)).map(Value::Integer).collect();
        assert!(encode(&values).is_err());
    }

    #[test]
    fn decode_to_vec_prefix_splits_concatenated_tuples() {
        let first = encode(&[Value::Integer(1)]).unwrap();
        let second = encode(&[Value::Text("two".into()), Value::Null]).unwrap();
        let mut concatenated = first.clone();
        concatenated.extend_from_slice(&second);

        let (values, consumed) = decode_to_vec_prefix(&concatenated).unwrap();
        assert_eq!(values, vec![Value::Integer(1)]);
        assert_eq!(consumed, first.len());

        let (values, consumed) = decode_to_vec_prefix(&concatenated[consumed..]).unwrap();
        assert_eq!(values, vec![Value::Text("two".into()), Value::Null]);
        assert_eq!(consumed, second.len());
    }

    #[test]
    fn empty_blob_and_text_round_trip() {
        let values = vec![Value::Blob(vec![]), Value::Text(String::new())];
        let encoded = encode(&values).unwrap();
        assert_eq!(decode_to_vec(&encoded).unwrap(), values);
    }
}
