/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Bootstrap schema for the four fixed, replica-wide tables (§6.6 of the
//! design doc). Per-managed-table `T_meta` tables are created dynamically
//! by the registry (C4) at `init()` time, not here.

use crate::conn_ext::ConnExt;
use crate::error::Result;
use rusqlite::Connection;

pub const VERSION: i64 = 1;

lazy_static::lazy_static! {
    static ref CREATE_SETTINGS_TABLE_SQL: String = "
        CREATE TABLE IF NOT EXISTS cloudsync_settings (
            key   TEXT PRIMARY KEY,
            value TEXT
        ) WITHOUT ROWID;
    ".to_string();

    static ref CREATE_SITE_ID_TABLE_SQL: String = "
        CREATE TABLE IF NOT EXISTS cloudsync_site_id (
            site_id BLOB NOT NULL UNIQUE
        );
    ".to_string();

    // `col` is NOT NULL: SQLite enforces NOT NULL on every column of a
    // WITHOUT ROWID primary key, so table-scoped settings (no column) store
    // the empty string as a sentinel rather than NULL (see `settings.rs`).
    static ref CREATE_TABLE_SETTINGS_TABLE_SQL: String = "
        CREATE TABLE IF NOT EXISTS cloudsync_table_settings (
            tbl   TEXT NOT NULL,
            col   TEXT NOT NULL,
            key   TEXT NOT NULL,
            value TEXT,
            PRIMARY KEY (tbl, col, key)
        ) WITHOUT ROWID;
    ".to_string();

    static ref CREATE_SCHEMA_VERSIONS_TABLE_SQL: String = "
        CREATE TABLE IF NOT EXISTS cloudsync_schema_versions (
            hash INTEGER PRIMARY KEY,
            seq  INTEGER NOT NULL
        ) WITHOUT ROWID;
    ".to_string();
}

/// Create the four fixed tables if they don't already exist and record the
/// schema version. Idempotent: calling `init` on an already-bootstrapped
/// connection is a no-op beyond the version check.
pub fn init(db: &Connection) -> Result<()> {
    let user_version: i64 = db.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    if user_version == 0 {
        create(db)?;
        set_version(db, VERSION)?;
    } else if user_version < VERSION {
        upgrade_from(db, user_version)?;
        set_version(db, VERSION)?;
    }
    Ok(())
}

fn create(db: &Connection) -> Result<()> {
    db.execute_all(&[
        &CREATE_SETTINGS_TABLE_SQL,
        &CREATE_SITE_ID_TABLE_SQL,
        &CREATE_TABLE_SETTINGS_TABLE_SQL,
        &CREATE_SCHEMA_VERSIONS_TABLE_SQL,
    ])?;
    Ok(())
}

fn set_version(db: &Connection, v: i64) -> Result<()> {
    db.execute_batch(&format!("PRAGMA user_version = {v}"))?;
    Ok(())
}

// There is only one schema version so far; this dispatcher exists so that
// future additive migrations (e.g. a new fixed table) have somewhere to
// land, following the sequential `upgrade_from` shape `logins::schema` uses.
fn upgrade_from(db: &Connection, from_version: i64) -> Result<()> {
    if from_version < 1 {
        create(db)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_creates_fixed_tables() {
        let db = Connection::open_in_memory().unwrap();
        init(&db).unwrap();
        for table in [
            "cloudsync_settings",
            "cloudsync_site_id",
            "cloudsync_table_settings",
            "cloudsync_schema_versions",
        ] {
            let count: i64 = db
                .query_row(
                    "SELECT count(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    [table],
                    |r| r.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "missing table {table}");
        }
        let v: i64 = db.query_row("PRAGMA user_version", [], |r| r.get(0)).unwrap();
        assert_eq!(v, VERSION);
    }

    #[test]
    fn init_is_idempotent() {
        let db = Connection::open_in_memory().unwrap();
        init(&db).unwrap();
        init(&db).unwrap();
    }
}
