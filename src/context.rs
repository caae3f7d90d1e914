/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The owned per-connection context. `Context` bundles everything a
//! managed connection needs -- the [`rusqlite::Connection`] itself, the
//! version clock (C5), the augmented-table registry (C4), the local site
//! id, and the re-entrant capture-suppression counter (§10.5) -- and is
//! the thing every other module (`capture`, `sync::merge`, `changes`)
//! borrows from.
//!
//! `init_table`/`cleanup_table` are C6's other half: generating and
//! installing the per-table triggers that turn ordinary `INSERT`/
//! `UPDATE`/`DELETE` statements into calls to the `cloudsync_insert`/
//! `cloudsync_update`/`cloudsync_delete` SQL functions registered here,
//! which then dispatch into `capture::{insert,update,delete}`.

use crate::capture;
use crate::changes::ChangeRow;
use crate::clock::Clock;
use crate::conn_ext::ConnExt;
use crate::error::{Error, ErrorKind, Result};
use crate::pk_codec;
use crate::registry::{self, Algorithm, ManagedTable, Registry};
use crate::schema_hash;
use crate::settings;
use crate::site_id;
use crate::sync::payload;
use crate::util::quote_ident;
use crate::uuid7;
use rusqlite::functions::FunctionFlags;
use rusqlite::params;
use rusqlite::types::Value;
use rusqlite::Connection;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use uuid::Uuid;

/// Bootstrap-time and behavioural configuration. Everything here is cheap
/// to default and safe to leave untouched for a single-process embedding.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// When two replicas wrote the *same* value at the *same* column
    /// version, whether ties are broken by comparing site ids
    /// lexicographically (`true`) or left as whichever replica's write
    /// happens to already be present locally (`false`, the default --
    /// matches the upstream engine's default of not requiring a total
    /// order over equal values).
    pub merge_equal_values: bool,
    /// Override the local site id instead of generating a fresh UUIDv7 on
    /// first open. Only meaningful the first time a database is opened
    /// (the site id, once persisted to `cloudsync_site_id` rowid 0, never
    /// changes); exists for deterministic tests.
    pub site_id: Option<Uuid>,
    /// Connection details for the HTTP transport glue (C11). `None` means
    /// this context has no peer configured -- `send_changes`/`sync` will
    /// return a misuse error if called.
    pub network: Option<crate::transport::NetworkConfig>,
}

/// Wraps a [`Weak`] handle so it can be captured by the `Send`-bounded
/// closures `rusqlite::Connection::create_scalar_function` requires.
///
/// This is safe because SQLite only ever invokes a registered function
/// synchronously, on the same thread that is currently executing a
/// statement against this same `Connection` -- there is no cross-thread
/// handoff, matching the `void *` user-data pointer the reference
/// implementation threads through `sqlite3_create_function_v2` in
/// `original_source/cloudsync.c`. `Weak` (rather than `Rc`) avoids a
/// reference cycle between `Context` and its own registered callbacks.
struct ReentrantHandle(Weak<Context>);
unsafe impl Send for ReentrantHandle {}
impl std::panic::UnwindSafe for ReentrantHandle {}
impl std::panic::RefUnwindSafe for ReentrantHandle {}

impl ReentrantHandle {
    fn upgrade(&self) -> rusqlite::Result<Rc<Context>> {
        self.0
            .upgrade()
            .ok_or_else(|| rusqlite::Error::UserFunctionError("cloudsync context has been dropped".into()))
    }
}

fn sql_err(e: Error) -> rusqlite::Error {
    rusqlite::Error::UserFunctionError(Box::new(e))
}

/// Sentinel table name meaning "every user table" / "every managed table",
/// accepted by `init`, `cleanup`, `enable`, `disable`, and `is_enabled`
/// (§6.2).
const WILDCARD: &str = "*";

pub struct Context {
    pub conn: Connection,
    pub clock: Arc<Clock>,
    pub registry: RefCell<Registry>,
    pub site_id: Uuid,
    pub config: Config,
    pub transport: Option<crate::transport::Transport>,
    suppress_depth: Cell<i64>,
}

impl Context {
    pub fn open_in_memory(config: Config) -> Result<Rc<Context>> {
        Self::bootstrap(Connection::open_in_memory()?, config)
    }

    pub fn open(path: impl AsRef<std::path::Path>, config: Config) -> Result<Rc<Context>> {
        Self::bootstrap(Connection::open(path)?, config)
    }

    fn bootstrap(conn: Connection, config: Config) -> Result<Rc<Context>> {
        crate::schema::init(&conn)?;
        let site_id = site_id::ensure_local(&conn, config.site_id)?;
        let clock = Arc::new(Clock::new());
        let transport = config
            .network
            .as_ref()
            .map(crate::transport::Transport::new)
            .transpose()?;

        let ctx = Rc::new(Context {
            conn,
            clock: Arc::clone(&clock),
            registry: RefCell::new(Registry::new()),
            site_id,
            config,
            transport,
            suppress_depth: Cell::new(0),
        });

        {
            let hook_clock = Arc::clone(&clock);
            ctx.conn.commit_hook(Some(move || {
                hook_clock.on_commit();
                false
            }));
        }
        {
            let hook_clock = Arc::clone(&clock);
            ctx.conn.rollback_hook(Some(move || {
                hook_clock.on_rollback();
            }));
        }

        register_functions(&ctx)?;
        #[cfg(feature = "vtab")]
        crate::changes::vtab::register(&ctx)?;
        Ok(ctx)
    }

    /// Re-entrant suppression counter (§10.5): while `f` runs, triggers'
    /// `cloudsync_insert`/`update`/`delete` calls become no-ops, since the
    /// write was itself produced by the merge engine or schema-evolution
    /// machinery applying a *foreign* change, not a genuinely new local
    /// edit. A counter, not a bool, because `merge::apply` can recursively
    /// trigger further suppressed writes (e.g. `insert_or_ignore_pk_sql`
    /// during a resurrect nested inside a column write).
    pub fn suppress_capture<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.suppress_depth.set(self.suppress_depth.get() + 1);
        let result = f();
        self.suppress_depth.set(self.suppress_depth.get() - 1);
        result
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppress_depth.get() > 0
    }

    /// Bring `table` under CRDT management: introspect its columns, create
    /// its `_meta` shadow table, install the capture triggers, backfill
    /// sentinels/column meta for any pre-existing rows, and register it.
    /// `table = "*"` (§6.2) inits every not-yet-managed user table.
    pub fn init_table(&self, table: &str, algorithm: Algorithm, skip_int_pk_check: bool) -> Result<()> {
        if table == WILDCARD {
            for name in self.list_user_tables()? {
                self.init_one(&name, algorithm, skip_int_pk_check)?;
            }
            return Ok(());
        }
        self.init_one(table, algorithm, skip_int_pk_check)
    }

    fn init_one(&self, table: &str, algorithm: Algorithm, skip_int_pk_check: bool) -> Result<()> {
        let managed = registry::introspect(&self.conn, table, algorithm, skip_int_pk_check)?;
        self.conn.execute_batch(&managed.create_meta_table_sql)?;
        self.conn.execute_batch(&managed.create_meta_index_sql)?;
        install_triggers(&self.conn, &managed)?;
        self.backfill(&managed)?;
        if let Some(persisted) = settings::get_table(&self.conn, table, None, "enabled")? {
            managed.enabled.set(persisted != "0");
        }
        self.registry.borrow_mut().register(managed);
        Ok(())
    }

    /// Every real table in the schema that isn't a `cloudsync_*` internal
    /// table, a `_meta` shadow table, or an `sqlite_*` system table --
    /// candidates for `init("*", ...)`.
    fn list_user_tables(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table'
               AND name NOT LIKE 'sqlite\\_%' ESCAPE '\\'
               AND name NOT LIKE 'cloudsync\\_%' ESCAPE '\\'
               AND name NOT LIKE '%\\_meta' ESCAPE '\\'
             ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(names)
    }

    /// Stamp a sentinel (cl=1) and column meta rows (version 1) for every
    /// row that already exists in `table` and has no meta history yet, as
    /// if each had just been locally inserted -- needed when `init_table`
    /// is called against an already-populated table. Rows that already
    /// carry a sentinel are left untouched: re-`init`-ing a table after an
    /// additive ALTER (`alter::commit_inner`'s compact path) must not
    /// rewrite causal lengths or column versions that compaction preserved.
    fn backfill(&self, table: &ManagedTable) -> Result<()> {
        let qtable = quote_ident(&table.name);
        let pk_list = table
            .pk_columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let mut stmt = self.conn.prepare(&format!("SELECT {pk_list} FROM {qtable}"))?;
        let rows: Vec<Vec<Value>> = stmt
            .query_map([], |row| {
                (0..table.pk_columns.len()).map(|i| row.get::<_, Value>(i)).collect()
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        drop(stmt);
        for pk_values in rows {
            if capture::has_sentinel(&self.conn, table, &pk_values)? {
                continue;
            }
            capture::insert_raw(&self.conn, &self.clock, &self.registry, table, &pk_values)?;
        }
        Ok(())
    }

    /// Deregister `table`: drops its triggers and `_meta` table, frees its
    /// registry entry. `table = "*"` (§6.2) cleans up every managed table.
    pub fn cleanup_table(&self, table: &str) -> Result<()> {
        if table == WILDCARD {
            let names: Vec<String> = self.registry.borrow().iter().map(|t| t.name.clone()).collect();
            for name in names {
                self.cleanup_one(&name)?;
            }
            return Ok(());
        }
        self.cleanup_one(table)
    }

    fn cleanup_one(&self, table: &str) -> Result<()> {
        let removed = self
            .registry
            .borrow_mut()
            .deregister(table)
            .ok_or_else(|| Error::from(ErrorKind::UnknownTable(table.to_string())))?;
        drop_triggers(&self.conn, &removed)?;
        self.conn
            .execute_batch(&format!("DROP TABLE IF EXISTS {};", quote_ident(&removed.meta_table)))?;
        settings::wipe_table(&self.conn, table)?;
        Ok(())
    }

    pub fn terminate(&self) -> Result<()> {
        let names: Vec<String> = self.registry.borrow().iter().map(|t| t.name.clone()).collect();
        for name in names {
            self.cleanup_table(&name)?;
        }
        Ok(())
    }

    /// `table = "*"` (§6.2) toggles capture for every managed table.
    pub fn enable(&self, table: &str) -> Result<()> {
        self.set_enabled(table, true)
    }

    pub fn disable(&self, table: &str) -> Result<()> {
        self.set_enabled(table, false)
    }

    fn set_enabled(&self, table: &str, enabled: bool) -> Result<()> {
        if table == WILDCARD {
            let names: Vec<String> = self.registry.borrow().iter().map(|t| t.name.clone()).collect();
            for name in names {
                self.set_enabled_one(&name, enabled)?;
            }
            return Ok(());
        }
        self.set_enabled_one(table, enabled)
    }

    fn set_enabled_one(&self, table: &str, enabled: bool) -> Result<()> {
        let registry = self.registry.borrow();
        let managed = registry
            .get(table)
            .ok_or_else(|| Error::from(ErrorKind::UnknownTable(table.to_string())))?;
        managed.enabled.set(enabled);
        settings::set_table(&self.conn, table, None, "enabled", if enabled { "1" } else { "0" })?;
        Ok(())
    }

    /// `table = "*"` (§6.2) reports whether every managed table is enabled.
    pub fn is_enabled(&self, table: &str) -> Result<bool> {
        if table == WILDCARD {
            return Ok(self.registry.borrow().iter().all(|t| t.enabled.get()));
        }
        Ok(self
            .registry
            .borrow()
            .get(table)
            .ok_or_else(|| Error::from(ErrorKind::UnknownTable(table.to_string())))?
            .enabled
            .get())
    }

    pub fn begin_alter(&self, table: &str) -> Result<()> {
        crate::alter::begin(self, table)
    }

    pub fn commit_alter(&self, table: &str) -> Result<()> {
        crate::alter::commit(self, table)
    }

    /// Pack every local change since `since_db_version` (or the whole
    /// change log, if `None`) into one payload BLOB (C8). The Rust-level
    /// sibling of the `cloudsync_payload_encode` SQL aggregate, usable
    /// without the `vtab` feature and without going through a peer's HTTP
    /// transport.
    pub fn encode_changes(&self, since_db_version: Option<i64>) -> Result<Vec<u8>> {
        payload::encode_changes(self, since_db_version)
    }

    /// Apply a payload BLOB produced by [`Self::encode_changes`] (or by a
    /// peer). The Rust-level sibling of the `cloudsync_payload_decode` SQL
    /// function.
    pub fn apply_payload(&self, blob: &[u8]) -> Result<payload::ApplyReport> {
        payload::apply(self, blob)
    }

    /// Upload every local change since the last `send_changes` call.
    /// Returns `false` if there was nothing new to send.
    pub fn send_changes(&self) -> Result<bool> {
        crate::transport::send_changes(self)
    }

    /// Poll for, download, and apply one batch of inbound changes.
    pub fn check_for_changes(&self) -> Result<crate::sync::payload::ApplyReport> {
        crate::transport::check_for_changes(self)
    }

    /// Send then repeatedly poll for inbound changes, sleeping `wait`
    /// between passes, up to `max_retries` times (§5, §10.5).
    pub fn sync(&self, wait: std::time::Duration, max_retries: u32) -> Result<crate::sync::payload::ApplyReport> {
        crate::transport::sync(self, wait, max_retries)
    }

    /// Forget the send/check cursors, forcing the next sync to start over.
    pub fn network_reset_sync_version(&self) -> Result<()> {
        crate::transport::network_reset_sync_version(self)
    }
}

fn trigger_name(kind: &str, table: &str) -> String {
    format!("cloudsync_{kind}_{table}")
}

pub(crate) fn drop_triggers(conn: &Connection, table: &ManagedTable) -> Result<()> {
    for kind in ["after_insert", "after_update", "after_delete", "before_update", "before_delete"] {
        conn.execute_batch(&format!(
            "DROP TRIGGER IF EXISTS {};",
            quote_ident(&trigger_name(kind, &table.name))
        ))?;
    }
    Ok(())
}

/// Generate and install the capture triggers for a freshly-registered
/// table. CLS tables get AFTER triggers on all three verbs; GOS tables
/// additionally get BEFORE UPDATE/DELETE triggers that `RAISE(ABORT)`
/// whenever the table is enabled, mirroring `dbutils.c`'s
/// `cloudsync_before_update_<table>`/`cloudsync_before_delete_<table>`.
fn install_triggers(conn: &Connection, table: &ManagedTable) -> Result<()> {
    drop_triggers(conn, table)?;
    let qtable = quote_ident(&table.name);
    let name_literal = crate::util::quote_literal(&table.name);

    let pk_new = table
        .pk_columns
        .iter()
        .map(|c| format!("NEW.{}", quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ");
    let pk_old = table
        .pk_columns
        .iter()
        .map(|c| format!("OLD.{}", quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ");

    conn.execute_batch(&format!(
        "CREATE TRIGGER {ins} AFTER INSERT ON {qtable}
         BEGIN SELECT cloudsync_insert({name_literal}{sep}{pk_new}); END;",
        ins = quote_ident(&trigger_name("after_insert", &table.name)),
        sep = if pk_new.is_empty() { "" } else { ", " },
    ))?;

    let col_triples = table
        .non_pk_columns
        .iter()
        .map(|c| format!("{}, NEW.{col}, OLD.{col}", crate::util::quote_literal(c), col = quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ");
    conn.execute_batch(&format!(
        "CREATE TRIGGER {upd} AFTER UPDATE ON {qtable}
         BEGIN SELECT cloudsync_update({name_literal}, {npk}, {pk_new}, {pk_old}, {ncol}{csep}{col_triples}); END;",
        upd = quote_ident(&trigger_name("after_update", &table.name)),
        npk = table.pk_columns.len(),
        ncol = table.non_pk_columns.len(),
        csep = if col_triples.is_empty() { "" } else { ", " },
    ))?;

    conn.execute_batch(&format!(
        "CREATE TRIGGER {del} AFTER DELETE ON {qtable}
         BEGIN SELECT cloudsync_delete({name_literal}{sep}{pk_old}); END;",
        del = quote_ident(&trigger_name("after_delete", &table.name)),
        sep = if pk_old.is_empty() { "" } else { ", " },
    ))?;

    if table.algorithm == Algorithm::Gos {
        conn.execute_batch(&format!(
            "CREATE TRIGGER {name} BEFORE UPDATE ON {qtable}
             WHEN cloudsync_is_enabled({name_literal}) = 1
             BEGIN SELECT RAISE(ABORT, 'GOS table {tbl} does not support update'); END;",
            name = quote_ident(&trigger_name("before_update", &table.name)),
            tbl = table.name,
        ))?;
        conn.execute_batch(&format!(
            "CREATE TRIGGER {name} BEFORE DELETE ON {qtable}
             WHEN cloudsync_is_enabled({name_literal}) = 1
             BEGIN SELECT RAISE(ABORT, 'GOS table {tbl} does not support delete'); END;",
            name = quote_ident(&trigger_name("before_delete", &table.name)),
            tbl = table.name,
        ))?;
    }
    Ok(())
}

/// Register the full `cloudsync_*` SQL function surface (§6.2) on `ctx`'s
/// connection. The capture-dispatch functions (`cloudsync_insert`/
/// `update`/`delete`) are the ones the generated triggers call; the rest
/// are the directly SQL-callable surface (`cloudsync_version()`,
/// `cloudsync_siteid()`, ...).
fn register_functions(ctx: &Rc<Context>) -> Result<()> {
    let utf8 = FunctionFlags::SQLITE_UTF8;
    let deterministic = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC;

    ctx.conn
        .create_scalar_function("cloudsync_version", 0, deterministic, |_| {
            Ok(env!("CARGO_PKG_VERSION").to_string())
        })?;

    {
        let handle = ReentrantHandle(Rc::downgrade(ctx));
        ctx.conn
            .create_scalar_function("cloudsync_siteid", 0, utf8, move |_| {
                let ctx = handle.upgrade()?;
                Ok(ctx.site_id.as_bytes().to_vec())
            })?;
    }
    {
        let handle = ReentrantHandle(Rc::downgrade(ctx));
        ctx.conn
            .create_scalar_function("cloudsync_db_version", 0, utf8, move |_| {
                let ctx = handle.upgrade()?;
                Ok(ctx.clock.current_db_version())
            })?;
    }
    {
        let handle = ReentrantHandle(Rc::downgrade(ctx));
        ctx.conn
            .create_scalar_function("cloudsync_db_version_next", 0, utf8, move |_| {
                let ctx = handle.upgrade()?;
                ctx.clock
                    .version_next(&ctx.conn, &ctx.registry.borrow(), None)
                    .map_err(sql_err)
            })?;
    }
    {
        let handle = ReentrantHandle(Rc::downgrade(ctx));
        ctx.conn
            .create_scalar_function("cloudsync_seq", 0, utf8, move |_| {
                let ctx = handle.upgrade()?;
                Ok(ctx.clock.current_seq())
            })?;
    }
    ctx.conn
        .create_scalar_function("cloudsync_uuid", 0, utf8, |_| Ok(uuid7::new_v7().to_string()))?;

    {
        let handle = ReentrantHandle(Rc::downgrade(ctx));
        ctx.conn
            .create_scalar_function("cloudsync_is_enabled", 1, utf8, move |fctx| {
                let ctx = handle.upgrade()?;
                let name: String = fctx.get(0)?;
                let enabled = ctx
                    .registry
                    .borrow()
                    .get(&name)
                    .map(|t| t.enabled.get())
                    .unwrap_or(false);
                Ok(enabled as i64)
            })?;
    }
    {
        let handle = ReentrantHandle(Rc::downgrade(ctx));
        ctx.conn
            .create_scalar_function("cloudsync_is_sync", 0, utf8, move |_| {
                let ctx = handle.upgrade()?;
                Ok(ctx.is_suppressed() as i64)
            })?;
    }

    ctx.conn
        .create_scalar_function("cloudsync_pk_encode", -1, utf8, |fctx| {
            let mut values = Vec::with_capacity(fctx.len());
            for i in 0..fctx.len() {
                values.push(fctx.get::<Value>(i)?);
            }
            pk_codec::encode(&values).map_err(sql_err)
        })?;
    ctx.conn
        .create_scalar_function("cloudsync_pk_decode", 2, utf8, |fctx| {
            let blob: Vec<u8> = fctx.get(0)?;
            let idx: i64 = fctx.get(1)?;
            let values = pk_codec::decode_to_vec(&blob).map_err(sql_err)?;
            values
                .into_iter()
                .nth(idx as usize)
                .ok_or_else(|| rusqlite::Error::UserFunctionError("pk field index out of range".into()))
        })?;

    {
        let handle = ReentrantHandle(Rc::downgrade(ctx));
        ctx.conn
            .create_scalar_function("cloudsync_col_value", 3, utf8, move |fctx| {
                let ctx = handle.upgrade()?;
                let table_name: String = fctx.get(0)?;
                let pk: Vec<u8> = fctx.get(1)?;
                let col_name: String = fctx.get(2)?;
                let registry = ctx.registry.borrow();
                let table = registry
                    .get(&table_name)
                    .ok_or_else(|| Error::from(ErrorKind::UnknownTable(table_name.clone())))
                    .map_err(sql_err)?;
                let Some(col) = table.per_column.get(&col_name) else {
                    return Ok(Value::Null);
                };
                let mut stmt = ctx.conn.prepare_cached(&col.column_value_sql)?;
                pk_codec::bind_decoded(&mut stmt, &pk).map_err(sql_err)?;
                let mut rows = stmt.raw_query();
                match rows.next()? {
                    Some(row) => Ok(row.get::<_, Value>(0)?),
                    None => Ok(Value::Null),
                }
            })?;
    }

    {
        let handle = ReentrantHandle(Rc::downgrade(ctx));
        ctx.conn
            .create_scalar_function("cloudsync_insert", -1, utf8, move |fctx| {
                let ctx = handle.upgrade()?;
                if ctx.is_suppressed() {
                    return Ok(0i64);
                }
                let table_name: String = fctx.get(0)?;
                let pk_values: Vec<Value> = (1..fctx.len())
                    .map(|i| fctx.get::<Value>(i))
                    .collect::<rusqlite::Result<_>>()?;
                let registry = ctx.registry.borrow();
                let table = capture::require_enabled(registry.get(&table_name), &table_name)
                    .map_err(sql_err)?
                    .clone();
                drop(registry);
                capture::insert(&ctx, &table, &pk_values).map_err(sql_err)?;
                Ok(0i64)
            })?;
    }
    {
        let handle = ReentrantHandle(Rc::downgrade(ctx));
        ctx.conn
            .create_scalar_function("cloudsync_delete", -1, utf8, move |fctx| {
                let ctx = handle.upgrade()?;
                if ctx.is_suppressed() {
                    return Ok(0i64);
                }
                let table_name: String = fctx.get(0)?;
                let pk_values: Vec<Value> = (1..fctx.len())
                    .map(|i| fctx.get::<Value>(i))
                    .collect::<rusqlite::Result<_>>()?;
                let registry = ctx.registry.borrow();
                let table = capture::require_enabled(registry.get(&table_name), &table_name)
                    .map_err(sql_err)?
                    .clone();
                drop(registry);
                capture::delete(&ctx, &table, &pk_values).map_err(sql_err)?;
                Ok(0i64)
            })?;
    }
    {
        let handle = ReentrantHandle(Rc::downgrade(ctx));
        ctx.conn
            .create_scalar_function("cloudsync_update", -1, utf8, move |fctx| {
                let ctx = handle.upgrade()?;
                if ctx.is_suppressed() {
                    return Ok(0i64);
                }
                let table_name: String = fctx.get(0)?;
                let npk: i64 = fctx.get(1)?;
                let npk = npk as usize;
                let mut idx = 2usize;
                let mut new_pk = Vec::with_capacity(npk);
                for _ in 0..npk {
                    new_pk.push(fctx.get::<Value>(idx)?);
                    idx += 1;
                }
                let mut old_pk = Vec::with_capacity(npk);
                for _ in 0..npk {
                    old_pk.push(fctx.get::<Value>(idx)?);
                    idx += 1;
                }
                let ncol: i64 = fctx.get(idx)?;
                idx += 1;
                let mut changed = Vec::with_capacity(ncol as usize);
                for _ in 0..ncol {
                    let col_name: String = fctx.get(idx)?;
                    let new_val: Value = fctx.get(idx + 1)?;
                    let old_val: Value = fctx.get(idx + 2)?;
                    idx += 3;
                    if new_val != old_val {
                        changed.push((col_name, new_val));
                    }
                }
                let registry = ctx.registry.borrow();
                let table = capture::require_enabled(registry.get(&table_name), &table_name)
                    .map_err(sql_err)?
                    .clone();
                drop(registry);
                capture::update(&ctx, &table, &new_pk, &old_pk, &changed).map_err(sql_err)?;
                Ok(0i64)
            })?;
    }

    {
        let handle = ReentrantHandle(Rc::downgrade(ctx));
        ctx.conn
            .create_aggregate_function("cloudsync_payload_encode", 9, utf8, PayloadEncodeAgg { handle })?;
    }
    {
        let handle = ReentrantHandle(Rc::downgrade(ctx));
        ctx.conn
            .create_scalar_function("cloudsync_payload_decode", 1, utf8, move |fctx| {
                let ctx = handle.upgrade()?;
                let blob: Vec<u8> = fctx.get(0)?;
                let report = payload::apply(&ctx, &blob).map_err(sql_err)?;
                Ok(report.applied as i64)
            })?;
    }

    {
        let handle = ReentrantHandle(Rc::downgrade(ctx));
        ctx.conn.create_scalar_function("cloudsync_set", 2, utf8, move |fctx| {
            let ctx = handle.upgrade()?;
            let key: String = fctx.get(0)?;
            let value: String = fctx.get(1)?;
            settings::set(&ctx.conn, &key, &value).map_err(sql_err)?;
            Ok(0i64)
        })?;
    }
    {
        let handle = ReentrantHandle(Rc::downgrade(ctx));
        ctx.conn
            .create_scalar_function("cloudsync_set_table", 3, utf8, move |fctx| {
                let ctx = handle.upgrade()?;
                let tbl: String = fctx.get(0)?;
                let key: String = fctx.get(1)?;
                let value: String = fctx.get(2)?;
                settings::set_table(&ctx.conn, &tbl, None, &key, &value).map_err(sql_err)?;
                Ok(0i64)
            })?;
    }
    {
        let handle = ReentrantHandle(Rc::downgrade(ctx));
        ctx.conn
            .create_scalar_function("cloudsync_set_column", 4, utf8, move |fctx| {
                let ctx = handle.upgrade()?;
                let tbl: String = fctx.get(0)?;
                let col: String = fctx.get(1)?;
                let key: String = fctx.get(2)?;
                let value: String = fctx.get(3)?;
                settings::set_table(&ctx.conn, &tbl, Some(&col), &key, &value).map_err(sql_err)?;
                Ok(0i64)
            })?;
    }

    Ok(())
}

/// Aggregate backing `cloudsync_payload_encode`: accumulates one
/// [`ChangeRow`] per step (the nine columns `cloudsync_changes` exposes) and
/// packs them into a single payload BLOB on finalize, exactly
/// `payload::encode` applied to whatever rows the query fed it -- typically
/// `SELECT cloudsync_payload_encode(tbl, pk, col_name, col_value,
/// col_version, db_version, site_id, cl, seq) FROM cloudsync_changes`.
struct PayloadEncodeAgg {
    handle: ReentrantHandle,
}

impl rusqlite::functions::Aggregate<Vec<ChangeRow>, Vec<u8>> for PayloadEncodeAgg {
    fn init(&self, _ctx: &mut rusqlite::functions::Context<'_>) -> rusqlite::Result<Vec<ChangeRow>> {
        Ok(Vec::new())
    }

    fn step(&self, ctx: &mut rusqlite::functions::Context<'_>, acc: &mut Vec<ChangeRow>) -> rusqlite::Result<()> {
        acc.push(ChangeRow {
            tbl: ctx.get(0)?,
            pk: ctx.get(1)?,
            col_name: ctx.get(2)?,
            col_value: ctx.get(3)?,
            col_version: ctx.get(4)?,
            db_version: ctx.get(5)?,
            site_id: ctx.get(6)?,
            cl: ctx.get(7)?,
            seq: ctx.get(8)?,
        });
        Ok(())
    }

    fn finalize(
        &self,
        _ctx: &mut rusqlite::functions::Context<'_>,
        acc: Option<Vec<ChangeRow>>,
    ) -> rusqlite::Result<Vec<u8>> {
        let rows = acc.unwrap_or_default();
        let ctx = self.handle.upgrade()?;
        let registry = ctx.registry.borrow();
        let hash = schema_hash::compute(&ctx.conn, &registry).map_err(sql_err)?;
        payload::encode(&rows, hash).map_err(sql_err)
    }
}
