/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! C4: the in-memory augmented-table registry. Maps a managed table's
//! (case-insensitive) name to its CRDT algorithm, column layout, and the
//! dynamically-generated SQL text for every statement the merge engine and
//! local capture need. The statements themselves are not held open as
//! `rusqlite::Statement` handles -- rusqlite's own `prepare_cached` already
//! gives each connection a statement cache keyed by SQL text, so we
//! generate the text once at registration and let the cache do the
//! pinning/reuse the design doc calls for.

use crate::error::{Error, ErrorKind, Result};
use crate::util::{quote_ident, quote_literal};
use rusqlite::Connection;
use std::cell::Cell;
use std::collections::HashMap;

pub const SENTINEL_COL: &str = "__[RIP]__";
pub const RLS_HIDDEN: &str = "__[RLS]__";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    /// Causal-Length-Set: inserts, updates, and deletes all replicate.
    Cls,
    /// Grow-Only-Set: only inserts replicate; UPDATE/DELETE are rejected
    /// locally by a BEFORE trigger.
    Gos,
}

impl Algorithm {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "cls" => Ok(Algorithm::Cls),
            "gos" => Ok(Algorithm::Gos),
            "dws" | "aws" => Err(Error::from(ErrorKind::UnknownAlgorithm(s.to_string()))),
            other => Err(Error::from(ErrorKind::UnknownAlgorithm(other.to_string()))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Cls => "cls",
            Algorithm::Gos => "gos",
        }
    }
}

/// Per-column generated statement text, one per non-PK column, as the
/// design doc's §6.3 "one of each ... per non-PK column" calls for.
#[derive(Debug, Clone)]
pub struct ColumnStatements {
    /// `merge_insert_col`'s foreign-write-wins statement for this column.
    pub merge_into_column_sql: String,
    /// Reads the live value of this column for a given decoded PK, used by
    /// the change view (C7) to materialise `col_value`.
    pub column_value_sql: String,
}

/// The full statement set for one managed table, generated from
/// `pragma_table_info` at registration time (§9 "Dynamic SQL generation":
/// never hard-code column names).
#[derive(Debug, Clone)]
pub struct ManagedTable {
    pub name: String,
    pub meta_table: String,
    pub algorithm: Algorithm,
    pub pk_columns: Vec<String>,
    pub non_pk_columns: Vec<String>,
    pub enabled: Cell<bool>,

    pub create_meta_table_sql: String,
    pub create_meta_index_sql: String,

    pub meta_pk_exists_sql: String,
    pub sentinel_lookup_sql: String,
    pub sentinel_upsert_sql: String,
    pub column_meta_upsert_sql: String,
    pub column_meta_lookup_sql: String,
    pub drop_non_sentinel_meta_sql: String,
    pub zero_non_sentinel_versions_sql: String,
    pub delete_row_sql: String,
    pub insert_or_ignore_pk_sql: String,
    /// Existence check for the real row, used by the merge engine to derive
    /// `local_cl` when a PK has no sentinel yet (defensive fallback; see
    /// C9 step 2 of the design doc).
    pub row_exists_sql: String,
    /// Reads every non-PK column's current value for a decoded PK, used by
    /// the change view (C7) and by schema-evolution compaction.
    pub real_col_values_sql: String,
    pub per_column: HashMap<String, ColumnStatements>,
}

impl ManagedTable {
    pub fn has_non_pk_columns(&self) -> bool {
        !self.non_pk_columns.is_empty()
    }
}

/// Introspect `table` via `pragma_table_info` and build a [`ManagedTable`].
/// `skip_int_pk_check` allows a single-column `INTEGER PRIMARY KEY` table
/// (normally rejected because it silently aliases `rowid`, per the Misuse
/// category in the design doc's error taxonomy).
pub fn introspect(
    db: &Connection,
    table: &str,
    algorithm: Algorithm,
    skip_int_pk_check: bool,
) -> Result<ManagedTable> {
    struct Col {
        name: String,
        is_pk: bool,
        pk_index: i64,
        not_null: bool,
        has_default: bool,
        decl_type: String,
    }

    let mut stmt = db.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
    let mut cols = stmt
        .query_map([], |row| {
            Ok(Col {
                name: row.get::<_, String>(1)?,
                decl_type: row.get::<_, String>(2)?,
                not_null: row.get::<_, i64>(3)? != 0,
                has_default: row.get::<_, rusqlite::types::Value>(4)?
                    != rusqlite::types::Value::Null,
                pk_index: row.get::<_, i64>(5)?,
                is_pk: row.get::<_, i64>(5)? > 0,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    if cols.is_empty() {
        return Err(Error::from(ErrorKind::UnknownTable(table.to_string())));
    }

    cols.sort_by_key(|c| if c.is_pk { c.pk_index } else { i64::MAX });
    let pk_columns: Vec<String> = cols
        .iter()
        .filter(|c| c.is_pk)
        .map(|c| c.name.clone())
        .collect();
    let non_pk_columns: Vec<String> = cols
        .iter()
        .filter(|c| !c.is_pk)
        .map(|c| c.name.clone())
        .collect();

    if pk_columns.is_empty() {
        return Err(Error::from(ErrorKind::UnsupportedTable {
            table: table.to_string(),
            reason: "table has no primary key".to_string(),
        }));
    }
    if pk_columns.len() > crate::pk_codec::MAX_FIELDS {
        return Err(Error::from(ErrorKind::UnsupportedTable {
            table: table.to_string(),
            reason: format!("composite primary key exceeds {} columns", crate::pk_codec::MAX_FIELDS),
        }));
    }
    if !skip_int_pk_check
        && pk_columns.len() == 1
        && cols
            .iter()
            .find(|c| c.is_pk)
            .map(|c| c.decl_type.eq_ignore_ascii_case("integer"))
            .unwrap_or(false)
    {
        return Err(Error::from(ErrorKind::UnsupportedTable {
            table: table.to_string(),
            reason: "single-column INTEGER PRIMARY KEY aliases rowid; pass skip_int_pk_check to override".to_string(),
        }));
    }
    for c in cols.iter().filter(|c| !c.is_pk) {
        if c.not_null && !c.has_default {
            return Err(Error::from(ErrorKind::UnsupportedTable {
                table: table.to_string(),
                reason: format!("column {:?} is NOT NULL without a DEFAULT", c.name),
            }));
        }
    }

    let meta_table = format!("{table}_meta");
    let qmeta = quote_ident(&meta_table);
    let qtable = quote_ident(table);

    let create_meta_table_sql = format!(
        "CREATE TABLE IF NOT EXISTS {qmeta} (
            pk BLOB NOT NULL,
            col_name TEXT NOT NULL,
            col_version INTEGER NOT NULL,
            db_version INTEGER NOT NULL,
            site_id INTEGER NOT NULL DEFAULT 0,
            seq INTEGER NOT NULL,
            PRIMARY KEY (pk, col_name)
        ) WITHOUT ROWID;"
    );
    let create_meta_index_sql = format!(
        "CREATE INDEX IF NOT EXISTS {} ON {qmeta}(db_version);",
        quote_ident(&format!("{table}_meta_db_idx"))
    );

    let meta_pk_exists_sql =
        format!("SELECT 1 FROM {qmeta} WHERE pk = ?1 AND col_name = ?2 LIMIT 1");
    let sentinel_lookup_sql = format!(
        "SELECT col_version FROM {qmeta} WHERE pk = ?1 AND col_name = {}",
        quote_literal(SENTINEL_COL)
    );
    let sentinel_upsert_sql = format!(
        "INSERT INTO {qmeta}(pk, col_name, col_version, db_version, site_id, seq)
         VALUES (?1, {sentinel}, ?2, ?3, ?4, ?5)
         ON CONFLICT(pk, col_name) DO UPDATE SET
            col_version = excluded.col_version,
            db_version = excluded.db_version,
            site_id = excluded.site_id,
            seq = excluded.seq",
        sentinel = quote_literal(SENTINEL_COL)
    );
    let column_meta_upsert_sql = format!(
        "INSERT INTO {qmeta}(pk, col_name, col_version, db_version, site_id, seq)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(pk, col_name) DO UPDATE SET
            col_version = excluded.col_version,
            db_version = excluded.db_version,
            site_id = excluded.site_id,
            seq = excluded.seq"
    );
    let column_meta_lookup_sql =
        format!("SELECT col_version, site_id FROM {qmeta} WHERE pk = ?1 AND col_name = ?2");
    let drop_non_sentinel_meta_sql = format!(
        "DELETE FROM {qmeta} WHERE pk = ?1 AND col_name != {}",
        quote_literal(SENTINEL_COL)
    );
    let zero_non_sentinel_versions_sql = format!(
        "UPDATE {qmeta} SET col_version = 0, db_version = ?2 WHERE pk = ?1 AND col_name != {}",
        quote_literal(SENTINEL_COL)
    );
    let delete_row_sql = format!(
        "DELETE FROM {qtable} WHERE ({}) = ({})",
        pk_columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", "),
        (1..=pk_columns.len()).map(|i| format!("?{i}")).collect::<Vec<_>>().join(", "),
    );

    let insert_or_ignore_pk_sql = format!(
        "INSERT OR IGNORE INTO {qtable} ({}) VALUES ({})",
        pk_columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", "),
        (1..=pk_columns.len()).map(|i| format!("?{i}")).collect::<Vec<_>>().join(", "),
    );

    let pk_list_for_lookup = pk_columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ");
    let pk_binds_for_lookup = (1..=pk_columns.len()).map(|i| format!("?{i}")).collect::<Vec<_>>().join(", ");
    let row_exists_sql = format!(
        "SELECT 1 FROM {qtable} WHERE ({pk_list_for_lookup}) = ({pk_binds_for_lookup}) LIMIT 1"
    );
    let real_col_values_sql = if non_pk_columns.is_empty() {
        format!("SELECT 1 FROM {qtable} WHERE ({pk_list_for_lookup}) = ({pk_binds_for_lookup})")
    } else {
        format!(
            "SELECT {} FROM {qtable} WHERE ({pk_list_for_lookup}) = ({pk_binds_for_lookup})",
            non_pk_columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", "),
        )
    };

    let mut per_column = HashMap::new();
    for col in &non_pk_columns {
        let qcol = quote_ident(col);
        let pk_list = pk_columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ");
        let pk_binds = (1..=pk_columns.len()).map(|i| format!("?{i}")).collect::<Vec<_>>().join(", ");
        let value_bind = format!("?{}", pk_columns.len() + 1);
        let merge_into_column_sql = match algorithm {
            Algorithm::Cls => format!(
                "INSERT INTO {qtable} ({pk_list}, {qcol}) VALUES ({pk_binds}, {value_bind})
                 ON CONFLICT ({pk_list}) DO UPDATE SET {qcol} = excluded.{qcol}"
            ),
            Algorithm::Gos => format!(
                "INSERT OR IGNORE INTO {qtable} ({pk_list}, {qcol}) VALUES ({pk_binds}, {value_bind})"
            ),
        };
        let column_value_sql = format!(
            "SELECT {qcol} FROM {qtable} WHERE ({pk_list}) = ({pk_binds})"
        );
        per_column.insert(
            col.clone(),
            ColumnStatements {
                merge_into_column_sql,
                column_value_sql,
            },
        );
    }

    Ok(ManagedTable {
        name: table.to_string(),
        meta_table,
        algorithm,
        pk_columns,
        non_pk_columns,
        enabled: Cell::new(true),
        create_meta_table_sql,
        create_meta_index_sql,
        meta_pk_exists_sql,
        sentinel_lookup_sql,
        sentinel_upsert_sql,
        column_meta_upsert_sql,
        column_meta_lookup_sql,
        drop_non_sentinel_meta_sql,
        zero_non_sentinel_versions_sql,
        delete_row_sql,
        insert_or_ignore_pk_sql,
        row_exists_sql,
        real_col_values_sql,
        per_column,
    })
}

/// In-memory index of managed tables, keyed by lowercased name. Lookup is
/// linear, matching the design doc's explicit "O(tables)" note -- there is
/// no expectation of more than a few dozen managed tables per connection.
#[derive(Default)]
pub struct Registry {
    tables: Vec<ManagedTable>,
}

impl Registry {
    pub fn new() -> Self {
        Self { tables: Vec::new() }
    }

    pub fn register(&mut self, table: ManagedTable) {
        self.tables
            .retain(|t| !t.name.eq_ignore_ascii_case(&table.name));
        self.tables.push(table);
    }

    pub fn deregister(&mut self, name: &str) -> Option<ManagedTable> {
        let pos = self.tables.iter().position(|t| t.name.eq_ignore_ascii_case(name))?;
        Some(self.tables.remove(pos))
    }

    pub fn get(&self, name: &str) -> Option<&ManagedTable> {
        self.tables.iter().find(|t| t.name.eq_ignore_ascii_case(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ManagedTable> {
        self.tables.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn clear(&mut self) {
        self.tables.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_customers(db: &Connection) {
        db.execute_batch(
            "CREATE TABLE customers (
                first_name TEXT NOT NULL,
                last_name TEXT NOT NULL,
                age INTEGER,
                PRIMARY KEY (first_name, last_name)
            );",
        )
        .unwrap();
    }

    #[test]
    fn introspects_composite_pk_table() {
        let db = Connection::open_in_memory().unwrap();
        make_customers(&db);
        let t = introspect(&db, "customers", Algorithm::Cls, false).unwrap();
        assert_eq!(t.pk_columns, vec!["first_name", "last_name"]);
        assert_eq!(t.non_pk_columns, vec!["age"]);
        assert!(t.per_column.contains_key("age"));
    }

    #[test]
    fn rejects_bare_integer_pk_by_default() {
        let db = Connection::open_in_memory().unwrap();
        db.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT);")
            .unwrap();
        assert!(introspect(&db, "t", Algorithm::Cls, false).is_err());
        assert!(introspect(&db, "t", Algorithm::Cls, true).is_ok());
    }

    #[test]
    fn rejects_not_null_without_default() {
        let db = Connection::open_in_memory().unwrap();
        db.execute_batch(
            "CREATE TABLE t (id TEXT PRIMARY KEY, v TEXT NOT NULL);",
        )
        .unwrap();
        assert!(introspect(&db, "t", Algorithm::Cls, false).is_err());
    }

    #[test]
    fn registry_register_lookup_deregister_is_case_insensitive() {
        let db = Connection::open_in_memory().unwrap();
        make_customers(&db);
        let t = introspect(&db, "customers", Algorithm::Cls, false).unwrap();
        let mut reg = Registry::new();
        reg.register(t);
        assert!(reg.get("CUSTOMERS").is_some());
        assert!(reg.deregister("Customers").is_some());
        assert!(reg.is_empty());
    }

    #[test]
    fn unknown_algorithm_names_are_rejected() {
        assert!(Algorithm::parse("dws").is_err());
        assert!(Algorithm::parse("aws").is_err());
        assert!(Algorithm::parse("bogus").is_err());
        assert_eq!(Algorithm::parse("cls").unwrap(), Algorithm::Cls);
        assert_eq!(Algorithm::parse("gos").unwrap(), Algorithm::Gos);
    }
}
