/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! FNV-1a schema-hash fingerprinting and the `cloudsync_schema_versions`
//! registry (part of C3/C8). The exact hash input -- lower-cased
//! `sqlite_master.sql` text for every managed table's `CREATE TABLE`
//! statement, concatenated in table-registration order -- is recovered from
//! `dbutils.c` in `original_source/` per §10.5 of the design doc, since the
//! distilled spec only says "FNV-1a of the current managed schema" without
//! pinning down the input bytes.

use crate::conn_ext::ConnExt;
use crate::error::Result;
use crate::registry::Registry;
use rusqlite::{params, Connection, OptionalExtension};

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01B3;

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Compute the current schema hash: FNV-1a over the lower-cased `CREATE
/// TABLE` text of every managed table, concatenated in registration order.
pub fn compute(db: &Connection, registry: &Registry) -> Result<u64> {
    let mut joined = String::new();
    for table in registry.iter() {
        let sql: Option<String> = db
            .query_row(
                "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![table.name],
                |r| r.get(0),
            )
            .optional()?;
        if let Some(sql) = sql {
            joined.push_str(&sql.to_lowercase());
        }
    }
    Ok(fnv1a(joined.as_bytes()))
}

/// Record `hash` as known, assigning it the next sequence number if it
/// isn't already present. Sequence numbers order known hashes so that
/// "known older" (§4.C8, forward-compatible additive evolution only) can be
/// distinguished from "known current".
pub fn remember(db: &Connection, hash: u64) -> Result<()> {
    let already: Option<i64> = db
        .query_row(
            "SELECT seq FROM cloudsync_schema_versions WHERE hash = ?1",
            params![hash as i64],
            |r| r.get(0),
        )
        .optional()?;
    if already.is_some() {
        return Ok(());
    }
    let next_seq: i64 = db
        .query_row(
            "SELECT COALESCE(max(seq), 0) + 1 FROM cloudsync_schema_versions",
            [],
            |r| r.get(0),
        )
        .unwrap_or(1);
    db.execute_cached(
        "INSERT INTO cloudsync_schema_versions(hash, seq) VALUES (?1, ?2)",
        params![hash as i64, next_seq],
    )?;
    Ok(())
}

pub fn seq_for(db: &Connection, hash: u64) -> Result<Option<i64>> {
    Ok(db
        .query_row(
            "SELECT seq FROM cloudsync_schema_versions WHERE hash = ?1",
            params![hash as i64],
            |r| r.get(0),
        )
        .optional()?)
}

/// A payload is acceptable iff its hash is the replica's current hash, or a
/// hash this replica has previously registered with a sequence number no
/// greater than the current one (i.e. an older, additive-only schema).
pub fn is_acceptable(db: &Connection, incoming_hash: u64, current_hash: u64) -> Result<bool> {
    if incoming_hash == current_hash {
        return Ok(true);
    }
    let incoming_seq = seq_for(db, incoming_hash)?;
    let current_seq = seq_for(db, current_hash)?;
    Ok(match (incoming_seq, current_seq) {
        (Some(i), Some(c)) => i <= c,
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{introspect, Algorithm, Registry};
    use crate::schema;

    fn db_with_customers() -> Connection {
        let db = Connection::open_in_memory().unwrap();
        schema::init(&db).unwrap();
        db.execute_batch(
            "CREATE TABLE customers (
                first_name TEXT NOT NULL,
                last_name TEXT NOT NULL,
                age INTEGER,
                PRIMARY KEY (first_name, last_name)
            );",
        )
        .unwrap();
        db
    }

    #[test]
    fn hash_is_stable_for_the_same_schema() {
        let db = db_with_customers();
        let mut registry = Registry::new();
        registry.register(introspect(&db, "customers", Algorithm::Cls, false).unwrap());
        let h1 = compute(&db, &registry).unwrap();
        let h2 = compute(&db, &registry).unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn hash_changes_when_schema_changes() {
        let db = db_with_customers();
        let mut registry = Registry::new();
        registry.register(introspect(&db, "customers", Algorithm::Cls, false).unwrap());
        let before = compute(&db, &registry).unwrap();

        db.execute_batch("ALTER TABLE customers ADD COLUMN nickname TEXT;").unwrap();
        registry.register(introspect(&db, "customers", Algorithm::Cls, false).unwrap());
        let after = compute(&db, &registry).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn older_known_hash_is_acceptable_but_unknown_is_not() {
        let db = db_with_customers();
        let mut registry = Registry::new();
        registry.register(introspect(&db, "customers", Algorithm::Cls, false).unwrap());
        let old_hash = compute(&db, &registry).unwrap();
        remember(&db, old_hash).unwrap();

        db.execute_batch("ALTER TABLE customers ADD COLUMN nickname TEXT;").unwrap();
        registry.register(introspect(&db, "customers", Algorithm::Cls, false).unwrap());
        let new_hash = compute(&db, &registry).unwrap();
        remember(&db, new_hash).unwrap();

        assert!(is_acceptable(&db, old_hash, new_hash).unwrap());
        assert!(!is_acceptable(&db, 0xdead_beef, new_hash).unwrap());
    }
}
