/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! C9: the merge engine. Applies one foreign change -- a single `(tbl, pk,
//! col_name, col_value, col_version, db_version, site_id, cl, seq)` tuple,
//! exactly the row shape the change view (C7) and the payload codec (C8)
//! both traffic in -- under Causal-Length-Set or Grow-Only-Set rules.

use crate::conn_ext::ConnExt;
use crate::context::Context;
use crate::error::{Error, ErrorKind, Result};
use crate::pk_codec;
use crate::registry::{Algorithm, ManagedTable, SENTINEL_COL};
use crate::site_id;
use rusqlite::{params, types::Value};
use std::cmp::Ordering;

/// One row of an incoming change, as decoded off the wire (C8) or produced
/// by an `INSERT INTO cloudsync_changes` (C7).
#[derive(Debug, Clone)]
pub struct ForeignChange {
    pub tbl: String,
    pub pk: Vec<u8>,
    pub col_name: String,
    pub col_value: Value,
    pub col_version: i64,
    pub db_version: i64,
    pub site_id: Vec<u8>,
    pub cl: i64,
    pub seq: i64,
}

/// Entry point. Returns the synthesized `(db_version << 30) | seq` rowid of
/// the meta row that was written, or `None` if the change was dropped as
/// stale or was a no-op.
pub fn apply(ctx: &Context, change: &ForeignChange) -> Result<Option<i64>> {
    let registry = ctx.registry.borrow();
    let table = registry
        .get(&change.tbl)
        .ok_or_else(|| Error::from(ErrorKind::UnknownTable(change.tbl.clone())))?
        .clone();
    drop(registry);

    if table.algorithm == Algorithm::Gos && change.cl % 2 == 0 {
        return Err(Error::from(ErrorKind::GosViolation {
            table: table.name.clone(),
            op: "delete",
        }));
    }

    let local_cl = local_causal_length(ctx, &table, &change.pk)?;

    if change.cl < local_cl {
        log::trace!(
            "apply({}): dropping stale change, cl {} < local_cl {}",
            table.name,
            change.cl,
            local_cl
        );
        return Ok(None);
    }

    if change.cl % 2 == 0 {
        if local_cl == change.cl {
            log::trace!("apply({}): delete already observed, no-op", table.name);
            return Ok(None);
        }
        log::trace!("apply({}): applying delete at cl {}", table.name, change.cl);
        return merge_delete(ctx, &table, change).map(Some);
    }

    if change.col_name == SENTINEL_COL {
        if local_cl == change.cl {
            log::trace!("apply({}): sentinel touch already observed, no-op", table.name);
            return Ok(None);
        }
        log::trace!("apply({}): sentinel-only insert at cl {}", table.name, change.cl);
        return merge_sentinel_only_insert(
            ctx,
            &table,
            &change.pk,
            change.cl,
            change.db_version,
            &change.site_id,
            change.seq,
        )
        .map(Some);
    }

    let needs_resurrect = change.cl > local_cl && change.cl % 2 == 1;
    let row_exists_locally = local_cl != 0;
    if needs_resurrect && (row_exists_locally || change.cl > 1) {
        log::trace!(
            "apply({}): resurrecting pk before column write (cl {} > local_cl {})",
            table.name,
            change.cl,
            local_cl
        );
        merge_sentinel_only_insert(
            ctx,
            &table,
            &change.pk,
            change.cl,
            change.db_version,
            &change.site_id,
            change.seq,
        )?;
    }

    if did_foreign_win(ctx, &table, change)? {
        log::trace!(
            "apply({}): foreign wins column {:?} at version {}",
            table.name,
            change.col_name,
            change.col_version
        );
        merge_insert_col(ctx, &table, change).map(Some)
    } else {
        log::trace!(
            "apply({}): local wins column {:?}, foreign write dropped",
            table.name,
            change.col_name
        );
        Ok(None)
    }
}

/// `local_cl = COALESCE(sentinel.col_version, row-exists ? 1 : 0)`.
fn local_causal_length(ctx: &Context, table: &ManagedTable, pk: &[u8]) -> Result<i64> {
    if let Some(cl) = ctx
        .conn
        .try_query_row::<i64, _>(&table.sentinel_lookup_sql, params![pk], |r| r.get(0))?
    {
        return Ok(cl);
    }
    Ok(if row_exists(ctx, table, pk)? { 1 } else { 0 })
}

fn row_exists(ctx: &Context, table: &ManagedTable, pk: &[u8]) -> Result<bool> {
    let mut stmt = ctx.conn.prepare_cached(&table.row_exists_sql)?;
    pk_codec::bind_decoded(&mut stmt, pk)?;
    let mut rows = stmt.raw_query();
    Ok(rows.next()?.is_some())
}

fn read_local_column_value(ctx: &Context, table: &ManagedTable, pk: &[u8], col: &str) -> Result<Value> {
    let Some(col_stmts) = table.per_column.get(col) else {
        return Err(Error::from(ErrorKind::Fatal(format!(
            "column {col:?} is not tracked for table {:?}",
            table.name
        ))));
    };
    let mut stmt = ctx.conn.prepare_cached(&col_stmts.column_value_sql)?;
    pk_codec::bind_decoded(&mut stmt, pk)?;
    let mut rows = stmt.raw_query();
    match rows.next()? {
        Some(row) => Ok(row.get::<_, Value>(0)?),
        None => Ok(Value::Null),
    }
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Integer(_) => 1,
        Value::Real(_) => 2,
        Value::Text(_) => 3,
        Value::Blob(_) => 4,
    }
}

/// NULL < INTEGER < FLOAT < TEXT < BLOB, then natural ordering within type;
/// BLOBs (and TEXT, whose `Ord` is already byte-lexicographic) compare by
/// memcmp then length, which is exactly what slice/`String` `Ord` gives us.
fn typed_compare(a: &Value, b: &Value) -> Ordering {
    let (ra, rb) = (type_rank(a), type_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Integer(x), Value::Integer(y)) => x.cmp(y),
        (Value::Real(x), Value::Real(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
        (Value::Text(x), Value::Text(y)) => x.cmp(y),
        (Value::Blob(x), Value::Blob(y)) => x.cmp(y),
        _ => unreachable!("type_rank gates mismatched variants"),
    }
}

/// `did_cid_win`.
fn did_foreign_win(ctx: &Context, table: &ManagedTable, change: &ForeignChange) -> Result<bool> {
    let local: Option<(i64, i64)> = ctx.conn.try_query_row(
        &table.column_meta_lookup_sql,
        params![change.pk, change.col_name],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    let (local_version, local_site_ordinal) = match local {
        None => return Ok(true),
        Some(v) => v,
    };
    if change.col_version > local_version {
        return Ok(true);
    }
    if change.col_version < local_version {
        return Ok(false);
    }

    let local_value = read_local_column_value(ctx, table, &change.pk, &change.col_name)?;
    let cmp = typed_compare(&local_value, &change.col_value);
    if cmp != Ordering::Equal || !ctx.config.merge_equal_values {
        return Ok(cmp == Ordering::Less);
    }

    let local_site_blob = site_id::blob_for_ordinal(&ctx.conn, local_site_ordinal)?.unwrap_or_default();
    Ok(change.site_id > local_site_blob)
}

/// `merge_delete`.
fn merge_delete(ctx: &Context, table: &ManagedTable, change: &ForeignChange) -> Result<i64> {
    ctx.suppress_capture(|| {
        let mut stmt = ctx.conn.prepare(&table.delete_row_sql)?;
        pk_codec::bind_decoded(&mut stmt, &change.pk)?;
        stmt.raw_execute()?;
        Ok(())
    })?;
    let rowid = set_winner_clock(
        ctx,
        table,
        &change.pk,
        SENTINEL_COL,
        change.col_version,
        change.db_version,
        &change.site_id,
        change.seq,
    )?;
    ctx.conn
        .execute_cached(&table.drop_non_sentinel_meta_sql, params![change.pk])?;
    Ok(rowid)
}

/// `merge_sentinel_only_insert`: resurrect-or-touch. `sentinel_version` is
/// the row's causal length (`cl`), which for a pure sentinel row (C9 step 5)
/// happens to equal the change's own `col_version`, and for the resurrect
/// pre-step inside a column write (C9 step 6) is the incoming column
/// change's `cl` rather than its `col_version` -- the two are only the same
/// value when the change IS the sentinel.
fn merge_sentinel_only_insert(
    ctx: &Context,
    table: &ManagedTable,
    pk: &[u8],
    sentinel_version: i64,
    incoming_db_version: i64,
    site_blob: &[u8],
    seq: i64,
) -> Result<i64> {
    ctx.suppress_capture(|| {
        let mut stmt = ctx.conn.prepare(&table.insert_or_ignore_pk_sql)?;
        pk_codec::bind_decoded(&mut stmt, pk)?;
        stmt.raw_execute()?;
        Ok(())
    })?;
    let dv = ctx
        .clock
        .version_next(&ctx.conn, &ctx.registry.borrow(), Some(incoming_db_version))?;
    ctx.conn
        .execute_cached(&table.zero_non_sentinel_versions_sql, params![pk, dv])?;
    set_winner_clock(ctx, table, pk, SENTINEL_COL, sentinel_version, incoming_db_version, site_blob, seq)
}

/// `merge_insert_col`.
fn merge_insert_col(ctx: &Context, table: &ManagedTable, change: &ForeignChange) -> Result<i64> {
    let col_stmts = table.per_column.get(&change.col_name).ok_or_else(|| {
        Error::from(ErrorKind::Fatal(format!(
            "unknown column {:?} for table {:?}",
            change.col_name, table.name
        )))
    })?;
    let pk_values = pk_codec::decode_to_vec(&change.pk)?;
    ctx.suppress_capture(|| {
        let mut stmt = ctx.conn.prepare(&col_stmts.merge_into_column_sql)?;
        for (i, v) in pk_values.iter().enumerate() {
            stmt.raw_bind_parameter(i + 1, v.clone())?;
        }
        stmt.raw_bind_parameter(pk_values.len() + 1, change.col_value.clone())?;
        stmt.raw_execute()?;
        Ok(())
    })?;
    set_winner_clock(
        ctx,
        table,
        &change.pk,
        &change.col_name,
        change.col_version,
        change.db_version,
        &change.site_id,
        change.seq,
    )
}

/// `set_winner_clock(pk, col, cv, dv, site_blob, seq)`.
fn set_winner_clock(
    ctx: &Context,
    table: &ManagedTable,
    pk: &[u8],
    col_name: &str,
    col_version: i64,
    incoming_db_version: i64,
    site_blob: &[u8],
    seq: i64,
) -> Result<i64> {
    let ordinal = site_id::resolve_ordinal(&ctx.conn, site_blob)?;
    let dv = ctx
        .clock
        .version_next(&ctx.conn, &ctx.registry.borrow(), Some(incoming_db_version))?;
    if col_name == SENTINEL_COL {
        ctx.conn
            .execute_cached(&table.sentinel_upsert_sql, params![pk, col_version, dv, ordinal, seq])?;
    } else {
        ctx.conn.execute_cached(
            &table.column_meta_upsert_sql,
            params![pk, col_name, col_version, dv, ordinal, seq],
        )?;
    }
    Ok((dv << 30) | seq)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture;
    use crate::context::{Config, Context};
    use crate::registry::Algorithm;
    use rusqlite::types::Value;

    fn setup(algo: Algorithm) -> std::rc::Rc<Context> {
        let ctx = Context::open_in_memory(Config::default()).unwrap();
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
        ctx.init_table("customers", algo, false).unwrap();
        ctx
    }

    fn pk(first: &str, last: &str) -> Vec<u8> {
        pk_codec::encode(&[Value::Text(first.into()), Value::Text(last.into())]).unwrap()
    }

    #[test]
    fn fresh_insert_from_remote_creates_row_and_sentinel() {
        let ctx = setup(Algorithm::Cls);
        let remote_site = vec![9u8; 16];
        let pk_bytes = pk("joe", "doe");

        apply(
            &ctx,
            &ForeignChange {
                tbl: "customers".into(),
                pk: pk_bytes.clone(),
                col_name: crate::registry::SENTINEL_COL.to_string(),
                col_value: Value::Null,
                col_version: 1,
                db_version: 1,
                site_id: remote_site.clone(),
                cl: 1,
                seq: 0,
            },
        )
        .unwrap();
        apply(
            &ctx,
            &ForeignChange {
                tbl: "customers".into(),
                pk: pk_bytes.clone(),
                col_name: "age".into(),
                col_value: Value::Integer(30),
                col_version: 1,
                db_version: 1,
                site_id: remote_site,
                cl: 1,
                seq: 1,
            },
        )
        .unwrap();

        let age: i64 = ctx
            .conn
            .query_row(
                "SELECT age FROM customers WHERE first_name='joe' AND last_name='doe'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(age, 30);
    }

    #[test]
    fn column_write_with_higher_cl_resurrects_before_applying() {
        let ctx = setup(Algorithm::Cls);
        let remote_site = vec![9u8; 16];
        let pk_bytes = pk("resurrected", "person");

        // Column write carries cl=3 (alive after one delete/recreate cycle)
        // while this replica has never heard of the PK (local_cl=0): the
        // sentinel must be created at cl=3 before the column lands.
        apply(
            &ctx,
            &ForeignChange {
                tbl: "customers".into(),
                pk: pk_bytes.clone(),
                col_name: "age".into(),
                col_value: Value::Integer(41),
                col_version: 2,
                db_version: 5,
                site_id: remote_site,
                cl: 3,
                seq: 0,
            },
        )
        .unwrap();

        let cl: i64 = ctx
            .conn
            .query_row(
                "SELECT col_version FROM customers_meta WHERE col_name = '__[RIP]__'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(cl, 3);
        assert_eq!(cl % 2, 1);
        let age: i64 = ctx
            .conn
            .query_row(
                "SELECT age FROM customers WHERE first_name='resurrected'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(age, 41);
    }

    #[test]
    fn stale_change_is_dropped() {
        let ctx = setup(Algorithm::Cls);
        let pk_values = vec![Value::Text("a".into()), Value::Text("b".into())];
        capture::insert(&ctx, &ctx.registry.borrow().get("customers").unwrap().clone(), &pk_values).unwrap();
        let pk_bytes = pk_codec::encode(&pk_values).unwrap();

        // local_cl is 1 (alive); an incoming delete at cl=0 is impossible
        // (cl=0 isn't a valid wire value) but an incoming *insert* touch at
        // a cl that's less than local_cl must be dropped outright.
        let result = apply(
            &ctx,
            &ForeignChange {
                tbl: "customers".into(),
                pk: pk_bytes,
                col_name: crate::registry::SENTINEL_COL.to_string(),
                col_value: Value::Null,
                col_version: 1,
                db_version: 99,
                site_id: vec![1u8; 16],
                cl: -1,
                seq: 0,
            },
        )
        .unwrap();
        assert_eq!(result, None);
    }

    #[test]
    fn delete_then_resurrect_round_trip() {
        let ctx = setup(Algorithm::Cls);
        let remote_site = vec![5u8; 16];
        let pk_bytes = pk("x", "y");

        apply(
            &ctx,
            &ForeignChange {
                tbl: "customers".into(),
                pk: pk_bytes.clone(),
                col_name: "age".into(),
                col_value: Value::Integer(1),
                col_version: 1,
                db_version: 1,
                site_id: remote_site.clone(),
                cl: 1,
                seq: 0,
            },
        )
        .unwrap();

        // Delete (cl=2): tombstone remains, row dropped.
        apply(
            &ctx,
            &ForeignChange {
                tbl: "customers".into(),
                pk: pk_bytes.clone(),
                col_name: crate::registry::SENTINEL_COL.to_string(),
                col_value: Value::Null,
                col_version: 2,
                db_version: 2,
                site_id: remote_site.clone(),
                cl: 2,
                seq: 0,
            },
        )
        .unwrap();
        let exists: i64 = ctx
            .conn
            .query_row("SELECT count(*) FROM customers WHERE first_name='x'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(exists, 0);

        // Late cl=1 insert (older than tombstone's cl=2) is dropped.
        apply(
            &ctx,
            &ForeignChange {
                tbl: "customers".into(),
                pk: pk_bytes.clone(),
                col_name: crate::registry::SENTINEL_COL.to_string(),
                col_value: Value::Null,
                col_version: 1,
                db_version: 3,
                site_id: remote_site.clone(),
                cl: 1,
                seq: 0,
            },
        )
        .unwrap();
        let exists: i64 = ctx
            .conn
            .query_row("SELECT count(*) FROM customers WHERE first_name='x'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(exists, 0);

        // cl=3 insert restores the row.
        apply(
            &ctx,
            &ForeignChange {
                tbl: "customers".into(),
                pk: pk_bytes.clone(),
                col_name: "age".into(),
                col_value: Value::Integer(2),
                col_version: 1,
                db_version: 4,
                site_id: remote_site,
                cl: 3,
                seq: 0,
            },
        )
        .unwrap();
        let age: i64 = ctx
            .conn
            .query_row("SELECT age FROM customers WHERE first_name='x'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(age, 2);
    }

    #[test]
    fn gos_table_rejects_delete_changes() {
        let ctx = setup(Algorithm::Gos);
        let pk_bytes = pk("g", "h");
        let err = apply(
            &ctx,
            &ForeignChange {
                tbl: "customers".into(),
                pk: pk_bytes,
                col_name: crate::registry::SENTINEL_COL.to_string(),
                col_value: Value::Null,
                col_version: 2,
                db_version: 1,
                site_id: vec![1u8; 16],
                cl: 2,
                seq: 0,
            },
        )
        .unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::GosViolation { .. }));
    }

    #[test]
    fn tie_broken_by_greater_value_by_default() {
        let ctx = setup(Algorithm::Cls);
        let pk_values = vec![Value::Text("x".into()), Value::Text("y".into())];
        let table = ctx.registry.borrow().get("customers").unwrap().clone();
        capture::insert(&ctx, &table, &pk_values).unwrap();
        ctx.conn
            .execute("UPDATE customers SET age = 10 WHERE first_name='x'", [])
            .unwrap();
        capture::update(
            &ctx,
            &table,
            &pk_values,
            &pk_values,
            &[("age".to_string(), Value::Integer(10))],
        )
        .unwrap();
        let pk_bytes = pk_codec::encode(&pk_values).unwrap();

        // Remote also reached col_version=2 for `age`, with value 20.
        let result = apply(
            &ctx,
            &ForeignChange {
                tbl: "customers".into(),
                pk: pk_bytes,
                col_name: "age".into(),
                col_value: Value::Integer(20),
                col_version: 2,
                db_version: 50,
                site_id: vec![2u8; 16],
                cl: 1,
                seq: 0,
            },
        )
        .unwrap();
        assert!(result.is_some());
        let age: i64 = ctx
            .conn
            .query_row("SELECT age FROM customers WHERE first_name='x'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(age, 20);
    }
}
