/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! C5: the per-replica version clock. Tracks the last-committed
//! `db_version`, the pending value the in-flight transaction will commit
//! at, and an intra-transaction `seq` counter.
//!
//! State lives behind a [`parking_lot::Mutex`] rather than bare `Cell`s: the
//! clock is shared (via `Arc`) with the commit/rollback hooks registered on
//! the host connection (`rusqlite::Connection::commit_hook` requires `Send`),
//! even though the design's concurrency model (§5) is single-threaded
//! cooperative and contention is never expected in practice.

use crate::error::Result;
use crate::registry::Registry;
use crate::settings;
use parking_lot::Mutex;
use rusqlite::Connection;

struct ClockState {
    db_version: i64,
    pending_db_version: Option<i64>,
    seq: i64,
    data_version: i64,
    schema_version: i64,
}

impl Default for ClockState {
    fn default() -> Self {
        Self {
            db_version: -1,
            pending_db_version: None,
            seq: 0,
            data_version: -1,
            schema_version: -1,
        }
    }
}

#[derive(Default)]
pub struct Clock {
    state: Mutex<ClockState>,
}

impl Clock {
    pub fn new() -> Self {
        Self::default()
    }

    fn pragma_i64(db: &Connection, name: &str) -> Result<i64> {
        Ok(db.query_row(&format!("PRAGMA {name}"), [], |r| r.get(0))?)
    }

    /// Recompute `db_version` from scratch: `max(db_version)` across every
    /// managed meta table, unioned with the persisted `pre_alter_dbversion`
    /// setting (so a replica with zero managed tables, e.g. right after a
    /// PK-changing schema evolution, still has a monotone floor).
    fn reload(&self, db: &Connection, registry: &Registry, state: &mut ClockState) -> Result<()> {
        let mut max_seen: i64 = -1;
        for table in registry.iter() {
            let v: Option<i64> = db
                .query_row(
                    &format!(
                        "SELECT max(db_version) FROM {}",
                        crate::util::quote_ident(&table.meta_table)
                    ),
                    [],
                    |r| r.get(0),
                )
                .unwrap_or(None);
            if let Some(v) = v {
                max_seen = max_seen.max(v);
            }
        }
        if let Some(pre_alter) = settings::get(db, settings::keys::PRE_ALTER_DBVERSION)? {
            if let Ok(v) = pre_alter.parse::<i64>() {
                max_seen = max_seen.max(v);
            }
        }
        state.db_version = max_seen;
        Ok(())
    }

    /// `version_next(merging)`: returns the db_version the current write
    /// (local or merge-applied) should be stamped with, advancing the
    /// pending value. `merging` is `Some(dv)` when the merge engine needs
    /// the clock to observe at least an incoming replica's `db_version`.
    pub fn version_next(
        &self,
        db: &Connection,
        registry: &Registry,
        merging: Option<i64>,
    ) -> Result<i64> {
        let data_version = Self::pragma_i64(db, "data_version")?;
        let schema_version = Self::pragma_i64(db, "schema_version")?;
        let mut state = self.state.lock();
        if data_version != state.data_version || schema_version != state.schema_version || state.db_version < 0 {
            self.reload(db, registry, &mut state)?;
            state.data_version = data_version;
            state.schema_version = schema_version;
        }

        let candidate = state.db_version + 1;
        let pending = state.pending_db_version.unwrap_or(i64::MIN);
        let merging = merging.unwrap_or(i64::MIN);
        let next = candidate.max(pending).max(merging);
        state.pending_db_version = Some(next);
        Ok(next)
    }

    /// Bump and return the next `seq` within the current transaction.
    pub fn bump_seq(&self) -> i64 {
        let mut state = self.state.lock();
        let next = state.seq;
        state.seq = next + 1;
        next
    }

    pub fn current_seq(&self) -> i64 {
        self.state.lock().seq
    }

    pub fn current_db_version(&self) -> i64 {
        self.state.lock().db_version
    }

    /// Commit hook: `db_version := pending_db_version; pending_db_version
    /// := None; seq := 0`.
    pub fn on_commit(&self) {
        let mut state = self.state.lock();
        if let Some(pending) = state.pending_db_version {
            state.db_version = pending;
        }
        state.pending_db_version = None;
        state.seq = 0;
    }

    /// Rollback hook: clears the pending value and resets `seq` without
    /// touching the committed `db_version`.
    pub fn on_rollback(&self) {
        let mut state = self.state.lock();
        state.pending_db_version = None;
        state.seq = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use crate::schema;

    #[test]
    fn version_next_advances_monotonically() {
        let db = Connection::open_in_memory().unwrap();
        schema::init(&db).unwrap();
        let registry = Registry::new();
        let clock = Clock::new();

        let v1 = clock.version_next(&db, &registry, None).unwrap();
        clock.on_commit();
        let v2 = clock.version_next(&db, &registry, None).unwrap();
        clock.on_commit();
        assert!(v2 > v1);
    }

    #[test]
    fn seq_resets_on_commit_and_rollback() {
        let clock = Clock::new();
        assert_eq!(clock.bump_seq(), 0);
        assert_eq!(clock.bump_seq(), 1);
        clock.on_commit();
        assert_eq!(clock.current_seq(), 0);
        assert_eq!(clock.bump_seq(), 0);
        clock.on_rollback();
        assert_eq!(clock.current_seq(), 0);
    }

    #[test]
    fn merging_floor_is_respected() {
        let db = Connection::open_in_memory().unwrap();
        schema::init(&db).unwrap();
        let registry = Registry::new();
        let clock = Clock::new();
        let v = clock.version_next(&db, &registry, Some(500)).unwrap();
        assert!(v >= 500);
    }

    #[test]
    fn clock_is_send_and_sync_for_commit_hook_registration() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Clock>();
    }
}
