/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Maps 16-byte UUIDv7 site ids to small per-connection ordinals, backed by
//! `cloudsync_site_id`. Rowid 0 is reserved for the local replica.

use crate::error::Result;
use crate::uuid7;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

/// Ensure the local site row (rowid 0) exists, generating a fresh UUIDv7 (or
/// using `override_id`, for deterministic tests) if this is a brand-new
/// database. Returns the local site id.
pub fn ensure_local(db: &Connection, override_id: Option<Uuid>) -> Result<Uuid> {
    let existing: Option<Vec<u8>> = db
        .query_row(
            "SELECT site_id FROM cloudsync_site_id WHERE rowid = 0",
            [],
            |r| r.get(0),
        )
        .optional()?;
    if let Some(bytes) = existing {
        return Ok(Uuid::from_slice(&bytes).unwrap_or_default());
    }
    let id = override_id.unwrap_or_else(uuid7::new_v7);
    db.execute(
        "INSERT INTO cloudsync_site_id(rowid, site_id) VALUES (0, ?1)",
        params![id.as_bytes().to_vec()],
    )?;
    Ok(id)
}

/// Resolve a site id blob to its ordinal, inserting a new row if this is
/// the first time this remote site has been observed.
pub fn resolve_ordinal(db: &Connection, site_id: &[u8]) -> Result<i64> {
    db.execute(
        "INSERT INTO cloudsync_site_id(site_id) VALUES (?1)
         ON CONFLICT(site_id) DO UPDATE SET site_id = excluded.site_id",
        params![site_id],
    )?;
    Ok(db.query_row(
        "SELECT rowid FROM cloudsync_site_id WHERE site_id = ?1",
        params![site_id],
        |r| r.get(0),
    )?)
}

pub fn blob_for_ordinal(db: &Connection, ordinal: i64) -> Result<Option<Vec<u8>>> {
    Ok(db
        .query_row(
            "SELECT site_id FROM cloudsync_site_id WHERE rowid = ?1",
            params![ordinal],
            |r| r.get(0),
        )
        .optional()?)
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
    fn local_site_id_is_stable_across_calls() {
        let conn = db();
        let a = ensure_local(&conn, None).unwrap();
        let b = ensure_local(&conn, None).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn local_site_id_honors_an_override() {
        let conn = db();
        let wanted = uuid7::new_v7();
        let got = ensure_local(&conn, Some(wanted)).unwrap();
        assert_eq!(got, wanted);
    }

    #[test]
    fn remote_site_ids_get_distinct_ordinals() {
        let conn = db();
        ensure_local(&conn, None).unwrap();
        let remote_a = uuid7::new_v7();
        let remote_b = uuid7::new_v7();
        let ord_a = resolve_ordinal(&conn, remote_a.as_bytes()).unwrap();
        let ord_b = resolve_ordinal(&conn, remote_b.as_bytes()).unwrap();
        assert_ne!(ord_a, ord_b);
        assert_eq!(resolve_ordinal(&conn, remote_a.as_bytes()).unwrap(), ord_a);
        assert_eq!(
            blob_for_ordinal(&conn, ord_a).unwrap().as_deref(),
            Some(remote_a.as_bytes().as_slice())
        );
    }
}
