/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! C10: the schema-evolution protocol. `begin_alter`/`commit_alter` bracket
//! arbitrary `ALTER TABLE`/rewrite statements the host runs against a
//! managed table, keeping `T_meta` and the table's triggers consistent with
//! whatever the new shape turns out to be.

use crate::conn_ext::ConnExt;
use crate::context::Context;
use crate::error::{Error, ErrorKind, Result};
use crate::registry::{self, Algorithm};
use crate::schema_hash;
use crate::settings;
use crate::util::quote_ident;

const SAVEPOINT: &str = "cloudsync_alter";

/// Opens the `cloudsync_alter` savepoint, drops `T`'s capture triggers, and
/// leaves the table's meta untouched so the host can run its ALTER/rewrite
/// statements. The savepoint is left open: [`commit`] releases it, and a
/// caller that never calls `commit` (e.g. the host aborts the whole
/// operation) leaves it to roll back on connection-level rollback, or the
/// caller may roll back explicitly.
pub fn begin(ctx: &Context, table: &str) -> Result<()> {
    let registry = ctx.registry.borrow();
    let managed = registry
        .get(table)
        .ok_or_else(|| Error::from(ErrorKind::UnknownTable(table.to_string())))?
        .clone();
    drop(registry);

    ctx.conn.execute_batch(&format!("SAVEPOINT {SAVEPOINT}"))?;
    let result = crate::context::drop_triggers(&ctx.conn, &managed);
    if result.is_err() {
        ctx.conn
            .execute_batch(&format!("ROLLBACK TO {SAVEPOINT}; RELEASE {SAVEPOINT}"))?;
    }
    result
}

/// Reads `T`'s new shape, decides whether PK columns changed (losing peer
/// history for this table, per the design doc) or only non-PK columns did
/// (compactable in place), reinitialises the table, and releases the
/// savepoint. Any failure rolls back to the savepoint instead, leaving the
/// pre-alter triggers and meta intact.
pub fn commit(ctx: &Context, table: &str) -> Result<()> {
    match commit_inner(ctx, table) {
        Ok(()) => Ok(()),
        Err(e) => {
            ctx.conn
                .execute_batch(&format!("ROLLBACK TO {SAVEPOINT}; RELEASE {SAVEPOINT}"))?;
            Err(e)
        }
    }
}

fn commit_inner(ctx: &Context, table: &str) -> Result<()> {
    let old = {
        let registry = ctx.registry.borrow();
        registry
            .get(table)
            .ok_or_else(|| Error::from(ErrorKind::UnknownTable(table.to_string())))?
            .clone()
    };

    settings::set(
        &ctx.conn,
        settings::keys::PRE_ALTER_DBVERSION,
        &ctx.clock.current_db_version().to_string(),
    )?;

    let new = registry::introspect(&ctx.conn, table, old.algorithm, true)?;

    if new.pk_columns != old.pk_columns {
        // PK shape changed: meta keyed on the old codec is meaningless.
        // Drop it outright -- it is rebuilt (and every row re-backfilled)
        // when `init_table` runs below.
        ctx.conn
            .execute_batch(&format!("DROP TABLE IF EXISTS {};", quote_ident(&old.meta_table)))?;
    } else {
        compact_meta(ctx, &old, &new)?;
    }

    ctx.registry.borrow_mut().deregister(table);
    ctx.conn.execute_batch(&format!("RELEASE {SAVEPOINT}"))?;

    ctx.init_table(table, old.algorithm, true)?;

    let registry = ctx.registry.borrow();
    schema_hash::remember(&ctx.conn, schema_hash::compute(&ctx.conn, &registry)?)?;
    Ok(())
}

/// Delete column-meta rows whose `col_name` no longer exists on `T`, and
/// rows (other than live sentinels) whose PK no longer exists on `T`.
/// Reached only when the PK shape is unchanged, so the old codec still
/// decodes the meta table's `pk` blobs.
fn compact_meta(ctx: &Context, old: &registry::ManagedTable, new: &registry::ManagedTable) -> Result<()> {
    let qmeta = quote_ident(&old.meta_table);
    let dropped_columns: Vec<&String> = old
        .non_pk_columns
        .iter()
        .filter(|c| !new.non_pk_columns.contains(c))
        .collect();
    for col in dropped_columns {
        ctx.conn.execute_cached(
            &format!("DELETE FROM {qmeta} WHERE col_name = ?1"),
            rusqlite::params![col],
        )?;
    }

    // Prune meta rows whose PK no longer exists in the live table, except
    // live (odd) tombstone sentinels -- a deleted row's tombstone is the
    // whole point of keeping its meta around.
    let qtable = quote_ident(&old.name);
    let pk_list = old
        .pk_columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    ctx.conn.execute_batch(&format!(
        "DELETE FROM {qmeta}
         WHERE NOT (col_name != {sentinel} AND col_version % 2 = 1)
           AND pk NOT IN (
             SELECT cloudsync_pk_encode({pk_list}) FROM {qtable}
           );",
        sentinel = crate::util::quote_literal(registry::SENTINEL_COL),
    ))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Config, Context as Ctx};

    #[test]
    fn adding_a_column_is_compacted_not_rebuilt() {
        let ctx = Ctx::open_in_memory(Config::default()).unwrap();
        ctx.conn
            .execute_batch(
                "CREATE TABLE customers (
                    id TEXT PRIMARY KEY,
                    age INTEGER
                );
                INSERT INTO customers VALUES ('c1', 10);",
            )
            .unwrap();
        ctx.init_table("customers", Algorithm::Cls, false).unwrap();

        ctx.begin_alter("customers").unwrap();
        ctx.conn
            .execute_batch("ALTER TABLE customers ADD COLUMN nickname TEXT;")
            .unwrap();
        ctx.commit_alter("customers").unwrap();

        assert!(ctx.registry.borrow().get("customers").unwrap().non_pk_columns.contains(&"nickname".to_string()));
        let age_version: i64 = ctx
            .conn
            .query_row(
                "SELECT col_version FROM customers_meta WHERE col_name = 'age'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(age_version, 1);
        // The pre-existing row's sentinel must survive the re-init untouched:
        // re-backfilling an already-stamped row would bump its causal length
        // (1 -> 3) and is exactly the history loss compaction exists to avoid.
        let sentinel_cl: i64 = ctx
            .conn
            .query_row(
                "SELECT col_version FROM customers_meta WHERE col_name = '__[RIP]__'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(sentinel_cl, 1);
    }

    #[test]
    fn changing_pk_columns_drops_meta_history() {
        let ctx = Ctx::open_in_memory(Config::default()).unwrap();
        ctx.conn
            .execute_batch(
                "CREATE TABLE widgets (id TEXT PRIMARY KEY, label TEXT);
                 INSERT INTO widgets VALUES ('w1', 'first');",
            )
            .unwrap();
        ctx.init_table("widgets", Algorithm::Cls, false).unwrap();

        ctx.begin_alter("widgets").unwrap();
        ctx.conn
            .execute_batch(
                "CREATE TABLE widgets_new (id TEXT, label TEXT, PRIMARY KEY (id, label));
                 INSERT INTO widgets_new SELECT id, label FROM widgets;
                 DROP TABLE widgets;
                 ALTER TABLE widgets_new RENAME TO widgets;",
            )
            .unwrap();
        ctx.commit_alter("widgets").unwrap();

        let table = ctx.registry.borrow().get("widgets").unwrap().clone();
        assert_eq!(table.pk_columns, vec!["id".to_string(), "label".to_string()]);
    }
}
