/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Key/value and per-table/per-column key/value settings stores (C3),
//! backed by the two fixed tables `cloudsync_settings` and
//! `cloudsync_table_settings`.

use crate::conn_ext::ConnExt;
use crate::error::Result;
use rusqlite::{params, Connection, OptionalExtension};

/// Well-known keys the context re-reads into in-memory fields whenever
/// they're written, per the design doc's "sync hook" note.
pub mod keys {
    pub const LIBRARY_VERSION: &str = "library_version";
    pub const SCHEMA_VERSION: &str = "schema_version";
    pub const DEBUG: &str = "debug";
    pub const PRE_ALTER_DBVERSION: &str = "pre_alter_dbversion";
    pub const SEND_DBVERSION: &str = "send_dbversion";
    pub const SEND_SEQ: &str = "send_seq";
    pub const CHECK_DBVERSION: &str = "check_dbversion";
    pub const CHECK_SEQ: &str = "check_seq";
}

pub fn get(db: &Connection, key: &str) -> Result<Option<String>> {
    Ok(db
        .query_row(
            "SELECT value FROM cloudsync_settings WHERE key = ?1",
            params![key],
            |r| r.get(0),
        )
        .optional()?)
}

pub fn set(db: &Connection, key: &str, value: &str) -> Result<()> {
    db.execute_cached(
        "INSERT INTO cloudsync_settings(key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

pub fn delete(db: &Connection, key: &str) -> Result<()> {
    db.execute_cached(
        "DELETE FROM cloudsync_settings WHERE key = ?1",
        params![key],
    )?;
    Ok(())
}

// `cloudsync_table_settings.col` is NOT NULL (WITHOUT ROWID primary key
// column), so a table-scoped (no-column) setting is stored under the empty
// string rather than NULL.
fn col_key(col: Option<&str>) -> &str {
    col.unwrap_or("")
}

pub fn get_table(
    db: &Connection,
    tbl: &str,
    col: Option<&str>,
    key: &str,
) -> Result<Option<String>> {
    Ok(db
        .query_row(
            "SELECT value FROM cloudsync_table_settings
             WHERE tbl = ?1 AND col = ?2 AND key = ?3",
            params![tbl, col_key(col), key],
            |r| r.get(0),
        )
        .optional()?)
}

pub fn set_table(db: &Connection, tbl: &str, col: Option<&str>, key: &str, value: &str) -> Result<()> {
    db.execute_cached(
        "INSERT INTO cloudsync_table_settings(tbl, col, key, value) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(tbl, col, key) DO UPDATE SET value = excluded.value",
        params![tbl, col_key(col), key, value],
    )?;
    Ok(())
}

pub fn delete_table(db: &Connection, tbl: &str, col: Option<&str>, key: &str) -> Result<()> {
    db.execute_cached(
        "DELETE FROM cloudsync_table_settings WHERE tbl = ?1 AND col = ?2 AND key = ?3",
        params![tbl, col_key(col), key],
    )?;
    Ok(())
}

/// Wipe all settings rows scoped to `tbl`, as invoked by `set_table(tbl,
/// null, null)` per §4.C3.
pub fn wipe_table(db: &Connection, tbl: &str) -> Result<()> {
    db.execute_cached(
        "DELETE FROM cloudsync_table_settings WHERE tbl = ?1",
        params![tbl],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema;

    fn db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        schema::init(&conn).unwrap();
        conn
    }

    #[test]
    fn global_settings_upsert_and_delete() {
        let conn = db();
        assert_eq!(get(&conn, "foo").unwrap(), None);
        set(&conn, "foo", "bar").unwrap();
        assert_eq!(get(&conn, "foo").unwrap(), Some("bar".to_string()));
        set(&conn, "foo", "baz").unwrap();
        assert_eq!(get(&conn, "foo").unwrap(), Some("baz".to_string()));
        delete(&conn, "foo").unwrap();
        assert_eq!(get(&conn, "foo").unwrap(), None);
    }

    #[test]
    fn table_settings_scoped_by_column() {
        let conn = db();
        set_table(&conn, "customers", None, "algo", "cls").unwrap();
        set_table(&conn, "customers", Some("age"), "hint", "x").unwrap();
        assert_eq!(
            get_table(&conn, "customers", None, "algo").unwrap(),
            Some("cls".to_string())
        );
        assert_eq!(
            get_table(&conn, "customers", Some("age"), "hint").unwrap(),
            Some("x".to_string())
        );
        wipe_table(&conn, "customers").unwrap();
        assert_eq!(get_table(&conn, "customers", None, "algo").unwrap(), None);
        assert_eq!(
            get_table(&conn, "customers", Some("age"), "hint").unwrap(),
            None
        );
    }
}
