/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! C6: local change capture. These are the Rust-level bodies invoked by
//! the `cloudsync_insert`/`cloudsync_update`/`cloudsync_delete` SQL
//! functions that the per-table triggers call (registration lives in
//! `context.rs`). Each trigger's `WHEN cloudsync_is_sync(tbl) = 0` guard is
//! realised here as the `Context::is_suppressed()` check the caller
//! performs before invoking these at all.

use crate::clock::Clock;
use crate::conn_ext::ConnExt;
use crate::error::{Error, ErrorKind, Result};
use crate::pk_codec;
use crate::registry::{ManagedTable, Registry, SENTINEL_COL};
use rusqlite::{params, types::Value, Connection, OptionalExtension};
use std::cell::RefCell;
use std::rc::Rc;

use crate::context::Context;

fn read_sentinel_version(conn: &Connection, table: &ManagedTable, pk: &[u8]) -> Result<Option<i64>> {
    Ok(conn.try_query_row::<i64, _>(&table.sentinel_lookup_sql, params![pk], |row| row.get(0))?)
}

/// Whether `pk` already carries a sentinel row -- used by `Context::backfill`
/// to skip rows a prior `init`/ALTER-compaction already stamped, so that
/// re-running backfill after an additive schema change never rewrites
/// existing causal-length/column-version history.
pub fn has_sentinel(conn: &Connection, table: &ManagedTable, pk_values: &[Value]) -> Result<bool> {
    let pk = pk_codec::encode(pk_values)?;
    Ok(read_sentinel_version(conn, table, &pk)?.is_some())
}

fn upsert_sentinel(
    conn: &Connection,
    table: &ManagedTable,
    pk: &[u8],
    col_version: i64,
    db_version: i64,
    seq: i64,
) -> Result<()> {
    conn.execute_cached(
        &table.sentinel_upsert_sql,
        params![pk, col_version, db_version, 0i64, seq],
    )?;
    Ok(())
}

fn upsert_column(
    conn: &Connection,
    table: &ManagedTable,
    pk: &[u8],
    col_name: &str,
    col_version: i64,
    db_version: i64,
    seq: i64,
) -> Result<()> {
    conn.execute_cached(
        &table.column_meta_upsert_sql,
        params![pk, col_name, col_version, db_version, 0i64, seq],
    )?;
    Ok(())
}

fn next_col_version(conn: &Connection, table: &ManagedTable, pk: &[u8], col_name: &str) -> Result<i64> {
    let current: Option<i64> = conn
        .try_query_row::<i64, _>(
            &table.column_meta_lookup_sql,
            params![pk, col_name],
            |row| row.get(0),
        )
        .unwrap_or(None);
    Ok(current.unwrap_or(0) + 1)
}

/// `insert(T, pk_values)`.
pub fn insert(ctx: &Rc<Context>, table: &ManagedTable, pk_values: &[Value]) -> Result<()> {
    insert_raw(&ctx.conn, &ctx.clock, &ctx.registry, table, pk_values)
}

/// Connection-level body of [`insert`], usable without a full [`Context`]
/// handle -- needed by `Context::backfill`, which runs from inside a
/// `&Context` method (no `Rc` available yet, since the table is still
/// being registered).
pub fn insert_raw(
    conn: &Connection,
    clock: &Clock,
    registry: &RefCell<Registry>,
    table: &ManagedTable,
    pk_values: &[Value],
) -> Result<()> {
    let pk = pk_codec::encode(pk_values)?;
    let dv = clock.version_next(conn, &registry.borrow(), None)?;
    let seq = clock.bump_seq();

    match read_sentinel_version(conn, table, &pk)? {
        Some(existing) => {
            // Row previously existed on this replica (tombstone or alive);
            // bump to the next odd causal length.
            let next_cl = if existing % 2 == 0 { existing + 1 } else { existing + 2 };
            upsert_sentinel(conn, table, &pk, next_cl, dv, seq)?;
        }
        None => {
            // A pure-key table gets an explicit sentinel; a table with
            // non-PK columns gets one implicitly once the first column row
            // is written below, but we still seed it here so invariant 1
            // (every PK with a column row has a sentinel) holds even if no
            // column ends up changing (e.g. all columns are NULL defaults
            // and the INSERT sets nothing new).
            upsert_sentinel(conn, table, &pk, 1, dv, seq)?;
        }
    }

    for col in &table.non_pk_columns {
        let seq = clock.bump_seq();
        upsert_column(conn, table, &pk, col, 1, dv, seq)?;
    }
    Ok(())
}

/// `update(T, new_pk, old_pk, (new,old)...)`. `changed_columns` holds only
/// the `(name, new, old)` triples whose new/old values differ -- the
/// caller (trigger glue) is expected to have already filtered on
/// inequality, matching "For each (new, old) pair that compares
/// non-equal" in the design doc.
pub fn update(
    ctx: &Rc<Context>,
    table: &ManagedTable,
    new_pk_values: &[Value],
    old_pk_values: &[Value],
    changed_columns: &[(String, Value)],
) -> Result<()> {
    let conn = &ctx.conn;
    let clock = &ctx.clock;
    let new_pk = pk_codec::encode(new_pk_values)?;
    let old_pk = pk_codec::encode(old_pk_values)?;
    let dv = clock.version_next(conn, &ctx.registry.borrow(), None)?;

    if new_pk != old_pk {
        // mark_delete_meta(old_pk): tombstone the old key, dropping its
        // column rows.
        let seq = clock.bump_seq();
        mark_delete_meta(conn, table, &old_pk, dv, seq)?;

        // Move non-sentinel meta rows to the new key. Since we're in pure
        // Rust (not a real ON CONFLICT REPLACE move across differing blobs)
        // we re-home each known column explicitly: every tracked column
        // gets col_version=1 under the new key, recording this replica as
        // the writer.
        for col in &table.non_pk_columns {
            let seq = clock.bump_seq();
            upsert_column(conn, table, &new_pk, &col.clone(), 1, dv, seq)?;
        }
        let seq = clock.bump_seq();
        upsert_sentinel(conn, table, &new_pk, 1, dv, seq)?;
    }

    for (col_name, _new_value) in changed_columns {
        let pk_for_write = if new_pk != old_pk { &new_pk } else { &old_pk };
        let next = next_col_version(conn, table, pk_for_write, col_name)?;
        let seq = clock.bump_seq();
        upsert_column(conn, table, pk_for_write, col_name, next.max(1), dv, seq)?;
    }
    Ok(())
}

/// `delete(T, old_pk)`.
pub fn delete(ctx: &Rc<Context>, table: &ManagedTable, old_pk_values: &[Value]) -> Result<()> {
    let pk = pk_codec::encode(old_pk_values)?;
    let dv = ctx.clock.version_next(&ctx.conn, &ctx.registry.borrow(), None)?;
    let seq = ctx.clock.bump_seq();
    mark_delete_meta(&ctx.conn, table, &pk, dv, seq)
}

/// Writes the sentinel with the next even (tombstone) causal length and
/// drops every non-sentinel meta row for `pk`.
fn mark_delete_meta(conn: &Connection, table: &ManagedTable, pk: &[u8], dv: i64, seq: i64) -> Result<()> {
    let existing = read_sentinel_version(conn, table, pk)?.unwrap_or(0);
    let next_cl = if existing % 2 == 1 { existing + 1 } else { existing + 2 };
    upsert_sentinel(conn, table, pk, next_cl, dv, seq)?;
    conn.execute_cached(&table.drop_non_sentinel_meta_sql, params![pk])?;
    Ok(())
}

/// Guard value: validates that trigger glue is calling [`insert`],
/// [`update`], [`delete`] with the expected table and that `T` is
/// registered and enabled. Factored out since both the SQL-function
/// wrappers in `context.rs` and tests exercise it.
pub fn require_enabled<'a>(table: Option<&'a ManagedTable>, name: &str) -> Result<&'a ManagedTable> {
    let table = table.ok_or_else(|| Error::from(ErrorKind::UnknownTable(name.to_string())))?;
    if !table.enabled.get() {
        return Err(Error::from(ErrorKind::Misuse(format!(
            "table {name:?} is disabled"
        ))));
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Config, Context};
    use crate::registry::Algorithm;

    fn setup() -> Rc<Context> {
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
        ctx.init_table("customers", Algorithm::Cls, false).unwrap();
        ctx
    }

    #[test]
    fn insert_creates_sentinel_and_column_rows() {
        let ctx = setup();
        let table = ctx.registry.borrow().get("customers").unwrap().clone();
        let pk_values = vec![Value::Text("name1".into()), Value::Text("surname1".into())];
        insert(&ctx, &table, &pk_values).unwrap();
        let pk = pk_codec::encode(&pk_values).unwrap();
        let cl = read_sentinel_version(&ctx.conn, &table, &pk).unwrap();
        assert_eq!(cl, Some(1));
        let age_version: Option<i64> = ctx
            .conn
            .try_query_row::<i64, _>(&table.column_meta_lookup_sql, params![pk, "age"], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(age_version, Some(1));
    }

    #[test]
    fn delete_then_insert_bumps_causal_length_by_two() {
        let ctx = setup();
        let table = ctx.registry.borrow().get("customers").unwrap().clone();
        let pk_values = vec![Value::Text("name1".into()), Value::Text("surname1".into())];
        insert(&ctx, &table, &pk_values).unwrap();
        delete(&ctx, &table, &pk_values).unwrap();
        let pk = pk_codec::encode(&pk_values).unwrap();
        assert_eq!(read_sentinel_version(&ctx.conn, &table, &pk).unwrap(), Some(2));
        insert(&ctx, &table, &pk_values).unwrap();
        assert_eq!(read_sentinel_version(&ctx.conn, &table, &pk).unwrap(), Some(3));
    }
}
