/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! C8: the wire payload codec. A payload is a single self-describing BLOB:
//! a fixed 32-byte header followed by the pk-codec (C1) encoding of every
//! change-view row (C7), optionally LZ4-compressed. `encode`/`decode` are
//! the Rust-side bodies of the `cloudsync_payload_encode` aggregate and
//! `cloudsync_payload_apply` scalar functions (§6.2).

use crate::changes::{ChangeFilter, ChangeRow};
use crate::conn_ext::ConnExt;
use crate::context::Context;
use crate::error::{Error, ErrorKind, Result};
use crate::pk_codec;
use crate::schema_hash;
use crate::sync::merge::{self, ForeignChange};
use crate::util::quote_ident;
use rusqlite::types::Value;

const SIGNATURE: [u8; 4] = *b"CLSY";
const PROTOCOL_VERSION: u8 = 1;
const HEADER_LEN: usize = 32;

fn library_version_bytes() -> [u8; 3] {
    let parse = |s: &str| s.parse::<u8>().unwrap_or(0);
    [
        parse(env!("CARGO_PKG_VERSION_MAJOR")),
        parse(env!("CARGO_PKG_VERSION_MINOR")),
        parse(env!("CARGO_PKG_VERSION_PATCH")),
    ]
}

/// Serialise one [`ChangeRow`] using the C1 pk-codec, encoding its nine
/// fields in the same tuple order the change view declares them.
fn encode_row(row: &ChangeRow) -> Result<Vec<u8>> {
    pk_codec::encode(&[
        Value::Text(row.tbl.clone()),
        Value::Blob(row.pk.clone()),
        Value::Text(row.col_name.clone()),
        row.col_value.clone(),
        Value::Integer(row.col_version),
        Value::Integer(row.db_version),
        Value::Blob(row.site_id.clone()),
        Value::Integer(row.cl),
        Value::Integer(row.seq),
    ])
}

fn decode_row(values: Vec<Value>) -> Result<ForeignChange> {
    if values.len() != 9 {
        return Err(Error::from(ErrorKind::Codec(format!(
            "expected 9 fields in a change row, found {}",
            values.len()
        ))));
    }
    let mut values = values.into_iter();
    let text = |v: Value| -> Result<String> {
        match v {
            Value::Text(s) => Ok(s),
            _ => Err(Error::from(ErrorKind::Codec("expected TEXT field".into()))),
        }
    };
    let blob = |v: Value| -> Result<Vec<u8>> {
        match v {
            Value::Blob(b) => Ok(b),
            _ => Err(Error::from(ErrorKind::Codec("expected BLOB field".into()))),
        }
    };
    let int = |v: Value| -> Result<i64> {
        match v {
            Value::Integer(i) => Ok(i),
            _ => Err(Error::from(ErrorKind::Codec("expected INTEGER field".into()))),
        }
    };
    Ok(ForeignChange {
        tbl: text(values.next().unwrap())?,
        pk: blob(values.next().unwrap())?,
        col_name: text(values.next().unwrap())?,
        col_value: values.next().unwrap(),
        col_version: int(values.next().unwrap())?,
        db_version: int(values.next().unwrap())?,
        site_id: blob(values.next().unwrap())?,
        cl: int(values.next().unwrap())?,
        seq: int(values.next().unwrap())?,
    })
}

/// Build one payload BLOB out of `rows`, with `schema_hash` stamped into
/// the header so the receiving replica can gate on schema compatibility
/// before applying anything (§4.C8). LZ4-compresses the body when doing
/// so actually shrinks it; otherwise ships it expanded with
/// `expanded_size = 0`, matching "0 means uncompressed" in the header
/// layout.
pub fn encode(rows: &[ChangeRow], schema_hash: u64) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    for row in rows {
        body.extend_from_slice(&encode_row(row)?);
    }

    let compressed = lz4_flex::compress_prepend_size(&body);
    let (expanded_size, payload_body) = if compressed.len() < body.len() {
        (body.len() as u32, compressed)
    } else {
        (0u32, body)
    };

    let mut out = Vec::with_capacity(HEADER_LEN + payload_body.len());
    out.extend_from_slice(&SIGNATURE);
    out.push(PROTOCOL_VERSION);
    out.extend_from_slice(&library_version_bytes());
    out.extend_from_slice(&expanded_size.to_be_bytes());
    out.extend_from_slice(&9u16.to_be_bytes());
    out.extend_from_slice(&(rows.len() as u32).to_be_bytes());
    out.extend_from_slice(&schema_hash.to_be_bytes());
    out.extend_from_slice(&[0u8; 6]);
    debug_assert_eq!(out.len(), HEADER_LEN);
    out.extend_from_slice(&payload_body);
    Ok(out)
}

/// Aggregate entry point for `cloudsync_payload_encode`: runs the change
/// view (optionally filtered to `since_db_version`) and packs every row
/// into a single payload BLOB.
pub fn encode_changes(ctx: &Context, since_db_version: Option<i64>) -> Result<Vec<u8>> {
    let registry = ctx.registry.borrow();
    let filter = ChangeFilter {
        min_db_version: since_db_version,
        site_id: None,
    };
    let rows = crate::changes::select_changes(&ctx.conn, &registry, &filter)?;
    let hash = schema_hash::compute(&ctx.conn, &registry)?;
    encode(&rows, hash)
}

pub struct DecodedPayload {
    pub schema_hash: u64,
    pub rows: Vec<ForeignChange>,
}

/// Parse a payload's header and body back into [`ForeignChange`] rows,
/// without applying anything -- the schema-hash gate is the caller's
/// responsibility (see [`apply`]), since only the caller knows its own
/// current hash.
pub fn decode(blob: &[u8]) -> Result<DecodedPayload> {
    if blob.len() < HEADER_LEN {
        return Err(Error::from(ErrorKind::Codec("payload shorter than header".into())));
    }
    if blob[0..4] != SIGNATURE {
        return Err(Error::from(ErrorKind::Codec("bad payload signature".into())));
    }
    let version = blob[4];
    if version != PROTOCOL_VERSION {
        return Err(Error::from(ErrorKind::Codec(format!(
            "unsupported payload protocol version {version}"
        ))));
    }
    let expanded_size = u32::from_be_bytes(blob[8..12].try_into().unwrap());
    let row_count = u32::from_be_bytes(blob[14..18].try_into().unwrap());
    let schema_hash = u64::from_be_bytes(blob[18..26].try_into().unwrap());
    let body = &blob[HEADER_LEN..];

    let decompressed;
    let body: &[u8] = if expanded_size > 0 {
        decompressed = lz4_flex::decompress_size_prepended(body)
            .map_err(|e| Error::from(ErrorKind::Codec(format!("lz4 decompress failed: {e}"))))?;
        &decompressed
    } else {
        body
    };

    let mut rows = Vec::with_capacity(row_count as usize);
    let mut cursor = 0usize;
    while cursor < body.len() {
        let (values, consumed) = pk_codec::decode_to_vec_prefix(&body[cursor..])?;
        rows.push(decode_row(values)?);
        cursor += consumed;
    }
    if rows.len() != row_count as usize {
        return Err(Error::from(ErrorKind::Codec(format!(
            "payload header claims {row_count} rows, decoded {}",
            rows.len()
        ))));
    }
    Ok(DecodedPayload { schema_hash, rows })
}

/// Outcome of applying a payload: how many rows actually changed local
/// state, and the highest `(db_version, seq)` among the groups that
/// committed -- exactly what a transport-glue cursor needs to advance past
/// (§7 propagation policy, §6.5 cursor keys).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub applied: usize,
    pub max_db_version: Option<i64>,
    pub max_seq: Option<i64>,
}

/// Decode `blob` and apply every row through the merge engine, after
/// checking the payload's schema hash is acceptable against the
/// receiver's current one (§4.C8's forward-compatible, additive-only
/// schema-evolution rule). Rejects the whole payload rather than
/// partially applying it if the hash is unacceptable.
///
/// Rows are grouped by `db_version` and each group is applied inside its
/// own savepoint (§7): a row that fails to apply (e.g. row-level security
/// denies it) is logged and rolls back only its own group, so one bad row
/// never discards the other groups in the same payload. The cursor only
/// advances past groups that committed.
pub fn apply(ctx: &Context, blob: &[u8]) -> Result<ApplyReport> {
    let decoded = decode(blob)?;
    let registry = ctx.registry.borrow();
    let current_hash = schema_hash::compute(&ctx.conn, &registry)?;
    drop(registry);
    if !schema_hash::is_acceptable(&ctx.conn, decoded.schema_hash, current_hash)? {
        log::error!(
            "rejecting payload: schema hash {:#x} is not acceptable (current {:#x})",
            decoded.schema_hash,
            current_hash
        );
        return Err(Error::from(ErrorKind::SchemaMismatch { hash: decoded.schema_hash }));
    }

    let mut report = ApplyReport::default();
    let mut index = 0usize;
    while index < decoded.rows.len() {
        let db_version = decoded.rows[index].db_version;
        let mut end = index + 1;
        while end < decoded.rows.len() && decoded.rows[end].db_version == db_version {
            end += 1;
        }
        let group = &decoded.rows[index..end];
        index = end;

        let savepoint_name = quote_ident(&format!("cloudsync_apply_{db_version}"));
        let savepoint = ctx.conn.named_savepoint(&savepoint_name)?;

        let mut group_applied = 0usize;
        let mut max_seq_in_group = None;
        let mut failure = None;
        for change in group {
            match merge::apply(ctx, change) {
                Ok(outcome) => {
                    if outcome.is_some() {
                        group_applied += 1;
                    }
                    max_seq_in_group = Some(change.seq);
                }
                Err(e) => {
                    failure = Some((change.tbl.clone(), change.col_name.clone(), e));
                    break;
                }
            }
        }

        match failure {
            Some((tbl, col_name, e)) => {
                log::warn!(
                    "dropping db_version {db_version} group while applying {tbl}.{col_name}: {e}"
                );
                // `savepoint` rolls itself back on drop since we never release it.
            }
            None => {
                savepoint.release()?;
                report.applied += group_applied;
                report.max_db_version = Some(db_version);
                report.max_seq = max_seq_in_group;
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Config, Context as Ctx};
    use crate::registry::Algorithm;

    fn setup() -> std::rc::Rc<Ctx> {
        let ctx = Ctx::open_in_memory(Config::default()).unwrap();
        ctx.conn
            .execute_batch(
                "CREATE TABLE customers (
                    first_name TEXT NOT NULL,
                    last_name TEXT NOT NULL,
                    age INTEGER,
                    PRIMARY KEY (first_name, last_name)
                );",
            )
            .unwrap();
        ctx.init_table("customers", Algorithm::Cls, false).unwrap();
        ctx
    }

    #[test]
    fn round_trips_changes_through_encode_and_decode() {
        let ctx = setup();
        ctx.conn
            .execute(
                "INSERT INTO customers(first_name, last_name, age) VALUES ('a', 'b', 10)",
                [],
            )
            .unwrap();
        let blob = encode_changes(&ctx, None).unwrap();
        let decoded = decode(&blob).unwrap();
        assert!(decoded
            .rows
            .iter()
            .any(|r| r.col_name == "age" && matches!(r.col_value, Value::Integer(10))));
    }

    #[test]
    fn apply_replicates_rows_into_a_second_replica() {
        let src = setup();
        src.conn
            .execute(
                "INSERT INTO customers(first_name, last_name, age) VALUES ('a', 'b', 10)",
                [],
            )
            .unwrap();
        let blob = encode_changes(&src, None).unwrap();

        let dst = setup();
        let report = apply(&dst, &blob).unwrap();
        assert!(report.applied > 0);
        assert!(report.max_db_version.is_some());
        let age: i64 = dst
            .conn
            .query_row("SELECT age FROM customers WHERE first_name = 'a'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(age, 10);
    }

    #[test]
    fn rejects_payload_with_unknown_schema_hash() {
        let ctx = setup();
        ctx.conn
            .execute(
                "INSERT INTO customers(first_name, last_name, age) VALUES ('a', 'b', 10)",
                [],
            )
            .unwrap();
        let mut blob = encode_changes(&ctx, None).unwrap();
        blob[18..26].copy_from_slice(&0xdead_beefu64.to_be_bytes());
        let err = apply(&ctx, &blob).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::SchemaMismatch { .. }));
    }
}
