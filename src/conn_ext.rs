/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Small extension trait over [`rusqlite::Connection`], following the same
//! shape as the teacher's `sql-support` crate: a handful of convenience
//! methods plus an unchecked, `Drop`-safe transaction wrapper usable from an
//! `&Connection` rather than requiring `&mut`.

use rusqlite::{
    types::{FromSql, ToSql},
    Connection, Result as SqlResult, Row, Savepoint, Transaction, TransactionBehavior,
};
use std::ops::Deref;
use std::time::Instant;

pub trait ConnExt {
    fn conn(&self) -> &Connection;

    fn execute_all(&self, stmts: &[&str]) -> SqlResult<()> {
        let conn = self.conn();
        for sql in stmts {
            conn.execute(sql, [])?;
        }
        Ok(())
    }

    fn execute_cached(&self, sql: &str, params: &[&dyn ToSql]) -> SqlResult<usize> {
        let mut stmt = self.conn().prepare_cached(sql)?;
        stmt.execute(params)
    }

    /// Execute a query that returns a single result column, and return that
    /// result.
    fn query_one<T: FromSql>(&self, sql: &str) -> SqlResult<T> {
        self.conn().query_row(sql, [], |row| row.get(0))
    }

    /// Like [`rusqlite::Connection::query_row`] but returns `None` instead
    /// of erroring when there's no such row.
    fn try_query_row<T, F>(&self, sql: &str, params: &[&dyn ToSql], mapper: F) -> SqlResult<Option<T>>
    where
        Self: Sized,
        F: FnOnce(&Row<'_>) -> SqlResult<T>,
    {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(sql)?;
        let mut rows = stmt.query(params)?;
        match rows.next()? {
            None => Ok(None),
            Some(row) => Ok(Some(mapper(row)?)),
        }
    }

    fn unchecked_transaction(&self) -> SqlResult<UncheckedTransaction<'_>> {
        UncheckedTransaction::new(self.conn(), TransactionBehavior::Deferred)
    }

    /// Open a named savepoint that rolls itself back on `Drop` unless
    /// released, mirroring `cloudsync_alter`/`cloudsync_init`/
    /// `cloudsync_logout_sp` in the design doc.
    fn named_savepoint<'c>(&'c self, name: &str) -> SqlResult<NamedSavepoint<'c>> {
        NamedSavepoint::new(self.conn(), name)
    }
}

impl ConnExt for Connection {
    #[inline]
    fn conn(&self) -> &Connection {
        self
    }
}

impl ConnExt for Transaction<'_> {
    #[inline]
    fn conn(&self) -> &Connection {
        self
    }
}

impl ConnExt for Savepoint<'_> {
    #[inline]
    fn conn(&self) -> &Connection {
        self
    }
}

/// rusqlite, in an attempt to save us from ourselves, needs a mutable ref
/// to a connection to start a transaction. That is a bit of a PITA since
/// our context only ever hands out `&Connection`, so we offer this as an
/// alternative -- the responsibility of ensuring there are no concurrent
/// transactions is on our head.
pub struct UncheckedTransaction<'conn> {
    conn: &'conn Connection,
    started_at: Instant,
}

impl<'conn> UncheckedTransaction<'conn> {
    pub fn new(conn: &'conn Connection, behavior: TransactionBehavior) -> SqlResult<Self> {
        let query = match behavior {
            TransactionBehavior::Deferred => "BEGIN DEFERRED",
            TransactionBehavior::Immediate => "BEGIN IMMEDIATE",
            TransactionBehavior::Exclusive => "BEGIN EXCLUSIVE",
            _ => "BEGIN DEFERRED",
        };
        conn.execute_batch(query)?;
        Ok(UncheckedTransaction {
            conn,
            started_at: Instant::now(),
        })
    }

    pub fn commit(self) -> SqlResult<()> {
        self.conn.execute_batch("COMMIT")?;
        log::trace!("transaction committed after {:?}", self.started_at.elapsed());
        Ok(())
    }

    pub fn rollback(self) -> SqlResult<()> {
        self.rollback_()
    }

    fn rollback_(&self) -> SqlResult<()> {
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    fn finish_(&self) -> SqlResult<()> {
        if self.conn.is_autocommit() {
            return Ok(());
        }
        self.rollback_()
    }
}

impl Deref for UncheckedTransaction<'_> {
    type Target = Connection;
    fn deref(&self) -> &Connection {
        self.conn
    }
}

impl Drop for UncheckedTransaction<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.finish_() {
            log::warn!("error dropping an unchecked transaction: {}", e);
        }
    }
}

impl ConnExt for UncheckedTransaction<'_> {
    #[inline]
    fn conn(&self) -> &Connection {
        self.conn
    }
}

/// A named savepoint that rolls back on drop unless [`release`] is called.
/// Used for `cloudsync_alter`, `cloudsync_init`, `cloudsync_logout_sp`, and
/// the per-`db_version` apply groups in the merge engine.
pub struct NamedSavepoint<'conn> {
    conn: &'conn Connection,
    name: String,
    released: bool,
}

impl<'conn> NamedSavepoint<'conn> {
    pub fn new(conn: &'conn Connection, name: &str) -> SqlResult<Self> {
        conn.execute_batch(&format!("SAVEPOINT {}", name))?;
        Ok(Self {
            conn,
            name: name.to_string(),
            released: false,
        })
    }

    pub fn release(mut self) -> SqlResult<()> {
        self.conn.execute_batch(&format!("RELEASE {}", self.name))?;
        self.released = true;
        Ok(())
    }

    pub fn rollback_to(&self) -> SqlResult<()> {
        self.conn
            .execute_batch(&format!("ROLLBACK TO {}", self.name))
    }
}

impl Drop for NamedSavepoint<'_> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.conn.execute_batch(&format!(
                "ROLLBACK TO {name}; RELEASE {name}",
                name = self.name
            )) {
                log::warn!("error rolling back savepoint {}: {}", self.name, e);
            }
        }
    }
}
