/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! C7: the change view. `cloudsync_changes` materialises the replica's
//! outbound change log by `UNION ALL`-ing every managed table's `_meta`
//! table against its sentinel sibling, exactly the dynamic query
//! `build_changes_sql` constructs in `original_source/src/vtab.c`.
//!
//! The query-building and row-materialisation logic below is plain,
//! testable Rust with no FFI surface; [`vtab`] is a thin virtual-table
//! shim (gated behind the crate's `vtab` feature) that exposes it to SQL
//! as `CREATE VIRTUAL TABLE`/direct `SELECT`/`INSERT` against
//! `cloudsync_changes`, per §4.C7.

use crate::registry::{Registry, SENTINEL_COL};
use crate::util::{quote_ident, quote_literal};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, Row};

/// One materialised row of the change log: the exact 9-column shape C7
/// exposes and C8 serialises.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRow {
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

impl ChangeRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(ChangeRow {
            tbl: row.get("tbl")?,
            pk: row.get("pk")?,
            col_name: row.get("col_name")?,
            col_value: row.get("col_value")?,
            col_version: row.get("col_version")?,
            db_version: row.get("db_version")?,
            site_id: row.get("site_id")?,
            cl: row.get("cl")?,
            seq: row.get("seq")?,
        })
    }
}

/// Optional equality/range predicate pushed down to the generated SQL,
/// mirroring the two columns `xBestIndex` special-cases (§4.C7): a
/// `db_version` lower bound and an exact `site_id` match.
#[derive(Debug, Clone, Default)]
pub struct ChangeFilter {
    pub min_db_version: Option<i64>,
    pub site_id: Option<Vec<u8>>,
}

/// Build the `UNION ALL` query over every managed table's meta table, each
/// branch joined against `cloudsync_site_id` (for the site blob) and
/// against its own sentinel rows (for the row-level causal length), with
/// the RLS-hidden sentinel value filtered out at the column-value layer.
/// Rows with the reserved `"__[RLS]__"` marker are excluded rather than
/// surfaced, per §4.C7 ("such rows are filtered out of the change log").
pub fn build_changes_sql(registry: &Registry, filter: &ChangeFilter) -> Option<String> {
    let mut branches = Vec::new();
    for table in registry.iter() {
        let qmeta = quote_ident(&table.meta_table);
        let tbl_literal = quote_literal(&table.name);
        branches.push(format!(
            "SELECT {tbl_literal} AS tbl, t1.pk AS pk, t1.col_name AS col_name, \
             cloudsync_col_value({tbl_literal}, t1.col_name, t1.pk) AS col_value, \
             t1.col_version AS col_version, t1.db_version AS db_version, \
             site_tbl.site_id AS site_id, COALESCE(t2.col_version, 1) AS cl, t1.seq AS seq \
             FROM {qmeta} AS t1 \
             LEFT JOIN cloudsync_site_id AS site_tbl ON t1.site_id = site_tbl.rowid \
             LEFT JOIN {qmeta} AS t2 ON t1.pk = t2.pk AND t2.col_name = {sentinel} \
             WHERE cloudsync_col_value({tbl_literal}, t1.col_name, t1.pk) IS NOT {rls}",
            sentinel = quote_literal(SENTINEL_COL),
            rls = quote_literal(crate::registry::RLS_HIDDEN),
        ));
    }
    if branches.is_empty() {
        return None;
    }
    let union = branches.join(" UNION ALL ");

    let mut conditions = Vec::new();
    if filter.min_db_version.is_some() {
        conditions.push("db_version > ?".to_string());
    }
    if filter.site_id.is_some() {
        conditions.push("site_id = ?".to_string());
    }
    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    };

    Some(format!(
        "SELECT tbl, pk, col_name, col_value, col_version, db_version, site_id, cl, seq \
         FROM ({union}){where_clause} ORDER BY db_version ASC, seq ASC"
    ))
}

/// Run the change-log query and collect every row into memory. Used both
/// by the C8 payload encoder (which aggregates the whole thing into one
/// BLOB) and by direct `SELECT * FROM cloudsync_changes` callers when the
/// `vtab` feature is off.
pub fn select_changes(
    conn: &Connection,
    registry: &Registry,
    filter: &ChangeFilter,
) -> crate::error::Result<Vec<ChangeRow>> {
    let Some(sql) = build_changes_sql(registry, filter) else {
        return Ok(Vec::new());
    };
    let mut stmt = conn.prepare(&sql)?;
    let mut bind: Vec<Value> = Vec::new();
    if let Some(dv) = filter.min_db_version {
        bind.push(Value::Integer(dv));
    }
    if let Some(site) = &filter.site_id {
        bind.push(Value::Blob(site.clone()));
    }
    let rows = stmt
        .query_map(params_from_iter(bind.iter()), ChangeRow::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Estimated planner cost for a given combination of pushed-down
/// predicates, matching `cloudsync_changesvtab_best_index`'s bitmask
/// exactly: both constraints present is cheapest, `site_id`-only is the
/// worst case short of an unconstrained scan.
pub fn estimated_cost(has_db_version: bool, has_site_id: bool) -> f64 {
    match (has_db_version, has_site_id) {
        (true, true) => 1.0,
        (true, false) => 10.0,
        (false, true) => i32::MAX as f64,
        (false, false) => i64::MAX as f64,
    }
}

#[cfg(feature = "vtab")]
pub mod vtab {
    //! Registers `cloudsync_changes` as a genuine eponymous-only SQLite
    //! virtual table: readable with predicate/cost pushdown per
    //! `xBestIndex`, and writable only by `INSERT` (dispatched to the
    //! merge engine, C9). `UPDATE`/`DELETE` against the view are host-level
    //! errors rather than anything this module needs to special-case --
    //! `UpdateVTab::update`/`delete` simply refuse them.

    use super::*;
    use crate::context::Context;
    use crate::error::{Error, ErrorKind};
    use crate::sync::merge::{self, ForeignChange};
    use rusqlite::vtab::{
        self, Context as FunCtx, CreateVTab, IndexConstraintOp, IndexInfo, UpdateVTab, VTab,
        VTabConnection, VTabCursor, VTabKind, Values,
    };
    use rusqlite::Result as SqlResult;
    use std::os::raw::c_int;
    use std::rc::Rc;

    #[repr(C)]
    pub struct ChangesTab {
        base: rusqlite::vtab::sqlite3_vtab,
        ctx: Rc<Context>,
    }

    unsafe impl<'vtab> VTab<'vtab> for ChangesTab {
        type Aux = Rc<Context>;
        type Cursor = ChangesCursor<'vtab>;

        fn connect(
            _db: &mut VTabConnection,
            aux: Option<&Rc<Context>>,
            _args: &[&[u8]],
        ) -> SqlResult<(String, Self)> {
            let ctx = aux
                .cloned()
                .ok_or_else(|| rusqlite::Error::ModuleError("cloudsync_changes needs a Context aux pointer".into()))?;
            let schema = "CREATE TABLE x(
                tbl TEXT NOT NULL,
                pk BLOB NOT NULL,
                col_name TEXT NOT NULL,
                col_value,
                col_version INTEGER NOT NULL,
                db_version INTEGER NOT NULL,
                site_id BLOB NOT NULL,
                cl INTEGER NOT NULL,
                seq INTEGER NOT NULL
            )"
            .to_owned();
            Ok((schema, ChangesTab { base: Default::default(), ctx }))
        }

        fn best_index(&self, info: &mut IndexInfo) -> SqlResult<()> {
            const COL_DB_VERSION: c_int = 5;
            const COL_SITE_ID: c_int = 6;

            let mut has_db_version = false;
            let mut has_site_id = false;
            let mut argv_index = 1;
            for mut constraint in info.constraints() {
                if !constraint.is_usable() || constraint.operator() != IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_EQ
                {
                    continue;
                }
                match constraint.column() {
                    COL_DB_VERSION => {
                        has_db_version = true;
                        constraint.set_argv_index(argv_index);
                        constraint.set_omit(true);
                        argv_index += 1;
                    }
                    COL_SITE_ID => {
                        has_site_id = true;
                        constraint.set_argv_index(argv_index);
                        constraint.set_omit(true);
                        argv_index += 1;
                    }
                    _ => {}
                }
            }
            let idx_num = (has_db_version as c_int) | ((has_site_id as c_int) << 1);
            info.set_idx_num(idx_num);
            info.set_estimated_cost(estimated_cost(has_db_version, has_site_id));
            // Default ordering is (db_version, seq) ASC; any other
            // requested ORDER BY is reported as not consumed.
            let wants_default_order = info
                .order_bys()
                .all(|ob| matches!(ob.column_index(), 5 | 8) && !ob.is_order_by_desc());
            info.set_order_by_consumed(wants_default_order);
            Ok(())
        }

        fn open(&'vtab mut self) -> SqlResult<Self::Cursor> {
            Ok(ChangesCursor {
                base: Default::default(),
                ctx: Rc::clone(&self.ctx),
                rows: Vec::new(),
                pos: 0,
                phantom: std::marker::PhantomData,
            })
        }
    }

    impl CreateVTab<'_> for ChangesTab {
        const KIND: VTabKind = VTabKind::Eponymous;
    }

    impl UpdateVTab<'_> for ChangesTab {
        fn delete(&mut self, _arg: rusqlite::types::ValueRef<'_>) -> SqlResult<()> {
            Err(rusqlite::Error::ModuleError(
                "cloudsync_changes does not support DELETE".into(),
            ))
        }

        fn update(&mut self, _args: &Values<'_>) -> SqlResult<()> {
            Err(rusqlite::Error::ModuleError(
                "cloudsync_changes does not support UPDATE".into(),
            ))
        }

        /// `INSERT INTO cloudsync_changes VALUES(...)` is how a decoded
        /// payload row (C8) or a peer-supplied change is applied: column 0
        /// is always NULL (rowid placeholder), columns 1..9 are
        /// `tbl, pk, col_name, col_value, col_version, db_version, site_id,
        /// cl, seq` in declaration order.
        fn insert(&mut self, args: &Values<'_>) -> SqlResult<i64> {
            let change = ForeignChange {
                tbl: args.get(1)?,
                pk: args.get(2)?,
                col_name: args.get(3)?,
                col_value: args.get(4)?,
                col_version: args.get(5)?,
                db_version: args.get(6)?,
                site_id: args.get(7)?,
                cl: args.get(8)?,
                seq: args.get(9)?,
            };
            let rowid = merge::apply(&self.ctx, &change)
                .map_err(|e: Error| rusqlite::Error::ModuleError(e.to_string()))?;
            Ok(rowid.unwrap_or(0))
        }
    }

    pub struct ChangesCursor<'vtab> {
        base: rusqlite::vtab::sqlite3_vtab_cursor,
        ctx: Rc<Context>,
        rows: Vec<ChangeRow>,
        pos: usize,
        #[allow(dead_code)]
        phantom: std::marker::PhantomData<&'vtab ChangesTab>,
    }

    unsafe impl VTabCursor for ChangesCursor<'_> {
        fn filter(&mut self, idx_num: c_int, _idx_str: Option<&str>, args: &Values<'_>) -> SqlResult<()> {
            let mut filter = ChangeFilter::default();
            let mut next = 0;
            if idx_num & 1 != 0 {
                filter.min_db_version = Some(args.get(next)?);
                next += 1;
            }
            if idx_num & 2 != 0 {
                filter.site_id = Some(args.get(next)?);
            }
            let registry = self.ctx.registry.borrow();
            self.rows = select_changes(&self.ctx.conn, &registry, &filter)
                .map_err(|e: Error| rusqlite::Error::ModuleError(e.to_string()))?;
            self.pos = 0;
            Ok(())
        }

        fn next(&mut self) -> SqlResult<()> {
            self.pos += 1;
            Ok(())
        }

        fn eof(&self) -> bool {
            self.pos >= self.rows.len()
        }

        fn column(&self, ctx: &mut FunCtx, i: c_int) -> SqlResult<()> {
            let row = &self.rows[self.pos];
            match i {
                0 => ctx.set_result(&row.tbl),
                1 => ctx.set_result(&row.pk),
                2 => ctx.set_result(&row.col_name),
                3 => ctx.set_result(&row.col_value),
                4 => ctx.set_result(&row.col_version),
                5 => ctx.set_result(&row.db_version),
                6 => ctx.set_result(&row.site_id),
                7 => ctx.set_result(&row.cl),
                8 => ctx.set_result(&row.seq),
                _ => Ok(()),
            }
        }

        /// `(db_version << 30) | seq`, per §4.C7 -- caps one replica at
        /// 2^30 mutations per `db_version` before rowid reuse (documented
        /// as a hard limit, not handled, per the design doc's Open
        /// Questions).
        fn rowid(&self) -> SqlResult<i64> {
            let row = &self.rows[self.pos];
            Ok((row.db_version << 30) | row.seq)
        }
    }

    /// Register `cloudsync_changes` on `ctx`'s connection.
    pub fn register(ctx: &Rc<Context>) -> crate::error::Result<()> {
        ctx.conn.create_module::<ChangesTab>(
            "cloudsync_changes",
            vtab::eponymous_only_module::<ChangesTab>(),
            Some(Rc::clone(ctx)),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Config, Context};
    use crate::registry::Algorithm;
    use rusqlite::types::Value;

    fn setup() -> std::rc::Rc<Context> {
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
    fn materialises_rows_for_every_column_and_sentinel() {
        let ctx = setup();
        ctx.conn
            .execute(
                "INSERT INTO customers(first_name, last_name, age) VALUES ('a', 'b', 10)",
                [],
            )
            .unwrap();
        let registry = ctx.registry.borrow();
        let rows = select_changes(&ctx.conn, &registry, &ChangeFilter::default()).unwrap();
        // one sentinel row + one column row (age).
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().any(|r| r.col_name == crate::registry::SENTINEL_COL));
        let age_row = rows.iter().find(|r| r.col_name == "age").unwrap();
        assert_eq!(age_row.col_value, Value::Integer(10));
        assert_eq!(age_row.tbl, "customers");
    }

    #[test]
    fn min_db_version_filter_excludes_older_rows() {
        let ctx = setup();
        ctx.conn
            .execute(
                "INSERT INTO customers(first_name, last_name, age) VALUES ('a', 'b', 10)",
                [],
            )
            .unwrap();
        let dv_now = ctx.clock.current_db_version();
        ctx.conn
            .execute(
                "INSERT INTO customers(first_name, last_name, age) VALUES ('c', 'd', 20)",
                [],
            )
            .unwrap();
        let registry = ctx.registry.borrow();
        let filter = ChangeFilter {
            min_db_version: Some(dv_now),
            site_id: None,
        };
        let rows = select_changes(&ctx.conn, &registry, &filter).unwrap();
        assert!(rows.iter().all(|r| r.db_version > dv_now));
        assert!(rows.iter().any(|r| r.col_name == "age" && r.col_value == Value::Integer(20)));
    }

    #[test]
    fn empty_registry_yields_no_rows() {
        let ctx = Context::open_in_memory(Config::default()).unwrap();
        let registry = ctx.registry.borrow();
        let rows = select_changes(&ctx.conn, &registry, &ChangeFilter::default()).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn estimated_cost_matches_design_doc_ordering() {
        assert!(estimated_cost(true, true) < estimated_cost(true, false));
        assert!(estimated_cost(true, false) < estimated_cost(false, true));
        assert!(estimated_cost(false, true) < estimated_cost(false, false));
    }
}
