/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The connection wrapper. Opening a `CrrDb` initializes the replication
//! metadata, loads the site identity, registers the SQL functions the CRR
//! triggers call, and installs the commit/rollback hooks that maintain
//! the version discipline.

use crate::error::Result;
use crate::schema;
use crate::state::{SessionState, SITE_ID_LEN};
use crate::tableinfo::{pull_table_info, TableInfo};
use rusqlite::functions::FunctionFlags;
use rusqlite::types::FromSql;
use rusqlite::{Connection, OpenFlags, OptionalExtension, Params};
use std::path::Path;
use std::sync::{Arc, Mutex};

pub struct CrrDb {
    conn: Connection,
    state: Arc<Mutex<SessionState>>,
    site_id: [u8; SITE_ID_LEN],
}

impl CrrDb {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_NO_MUTEX
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_READ_WRITE;
        Self::with_connection(Connection::open_with_flags(path, flags)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    pub fn with_connection(conn: Connection) -> Result<Self> {
        let initial_pragmas = "
            -- keep temp structures in memory
            PRAGMA temp_store = 2;
            -- we unconditionally want write-ahead-logging mode
            PRAGMA journal_mode = WAL;
        ";
        conn.execute_batch(initial_pragmas)?;
        conn.set_prepared_statement_cache_capacity(128);

        let tx = conn.unchecked_transaction()?;
        schema::init(&conn)?;
        let site_id = schema::load_or_create_site_id(&conn)?;
        tx.commit()?;

        let committed = schema::fetch_db_version(&conn)?;
        let state = Arc::new(Mutex::new(SessionState::new(site_id, committed)));
        define_functions(&conn, &state)?;
        install_hooks(&conn, &state);

        log::debug!("opened crr database at version {}", committed);
        Ok(CrrDb {
            conn,
            state,
            site_id,
        })
    }

    #[inline]
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub(crate) fn state(&self) -> &Arc<Mutex<SessionState>> {
        &self.state
    }

    /// This database's stable 16-byte site identifier.
    #[inline]
    pub fn site_id(&self) -> &[u8] {
        &self.site_id
    }

    /// Last committed db_version of this site.
    pub fn db_version(&self) -> Result<i64> {
        let cached = self.state.lock().unwrap().committed_db_version;
        match cached {
            Some(v) => Ok(v),
            None => {
                let v = schema::fetch_db_version(&self.conn)?;
                self.state.lock().unwrap().committed_db_version = Some(v);
                Ok(v)
            }
        }
    }

    /// Table metadata, cached until `PRAGMA schema_version` moves.
    pub(crate) fn table_info(&self, table: &str) -> Result<Arc<TableInfo>> {
        let watermark: i64 = self
            .conn
            .query_row("PRAGMA schema_version", [], |r| r.get(0))?;
        {
            let mut state = self.state.lock().unwrap();
            if state.schema_watermark != Some(watermark) {
                state.invalidate_table_infos();
                state.schema_watermark = Some(watermark);
            }
            if let Some(info) = state.table_infos.get(table) {
                return Ok(Arc::clone(info));
            }
        }
        // Build outside the lock; pragma queries cannot re-enter our
        // functions.
        let info = Arc::new(pull_table_info(&self.conn, table)?);
        self.state
            .lock()
            .unwrap()
            .table_infos
            .insert(table.to_string(), Arc::clone(&info));
        Ok(info)
    }

    pub(crate) fn set_sync_bit(&self, value: bool) {
        self.state.lock().unwrap().sync_bit = value;
    }

    /// Run `f` with the CRR triggers suppressed. The bit is always cleared
    /// again, error or not.
    pub(crate) fn with_sync_bit<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T>,
    ) -> Result<T> {
        self.set_sync_bit(true);
        let ret = f(&self.conn);
        self.set_sync_bit(false);
        ret
    }

    /// Rows merged so far in the current transaction.
    pub fn rows_impacted(&self) -> i64 {
        self.state.lock().unwrap().rows_impacted
    }

    /// Shut the connection down explicitly. Runs `PRAGMA optimize`, as
    /// long-lived connections should before closing; statement
    /// finalization and the handle itself are released by `Drop` when
    /// the value goes out of scope at the end of this call.
    pub fn close(self) -> Result<()> {
        self.conn.execute_batch("PRAGMA optimize")?;
        Ok(())
    }
}

impl Drop for CrrDb {
    fn drop(&mut self) {
        // The close hook: finalize cached statements and free the peer
        // tracker, whether or not close() was called first.
        self.conn.flush_prepared_statement_cache();
        if let Ok(mut state) = self.state.lock() {
            state.peers.clear();
        }
    }
}

impl std::ops::Deref for CrrDb {
    type Target = Connection;

    #[inline]
    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl std::fmt::Debug for CrrDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrrDb").finish_non_exhaustive()
    }
}

fn define_functions(conn: &Connection, state: &Arc<Mutex<SessionState>>) -> Result<()> {
    let flags = FunctionFlags::SQLITE_UTF8;

    let st = Arc::clone(state);
    conn.create_scalar_function("crsql_site_id", 0, flags, move |_ctx| {
        Ok(st.lock().unwrap().site_id.to_vec())
    })?;

    let st = Arc::clone(state);
    conn.create_scalar_function("crsql_db_version", 0, flags, move |_ctx| {
        Ok(st.lock().unwrap().committed_db_version.unwrap_or(0))
    })?;

    // Variadic: an optional argument lets a caller (or the merge path)
    // raise the floor of the version being allocated.
    let st = Arc::clone(state);
    conn.create_scalar_function("crsql_next_db_version", -1, flags, move |ctx| {
        let arg = match ctx.len() {
            0 => None,
            1 => Some(ctx.get::<i64>(0)?),
            n => {
                return Err(rusqlite::Error::UserFunctionError(
                    format!("crsql_next_db_version expects 0 or 1 arguments, got {}", n).into(),
                ))
            }
        };
        Ok(st.lock().unwrap().next_db_version(arg))
    })?;

    let st = Arc::clone(state);
    conn.create_scalar_function("crsql_increment_and_get_seq", 0, flags, move |_ctx| {
        Ok(st.lock().unwrap().increment_and_get_seq())
    })?;

    let st = Arc::clone(state);
    conn.create_scalar_function("crsql_get_seq", 0, flags, move |_ctx| {
        Ok(st.lock().unwrap().get_seq())
    })?;

    // With no arguments reads the bit; with one sets it. The triggers
    // consult this in their WHEN clause.
    let st = Arc::clone(state);
    conn.create_scalar_function("crsql_internal_sync_bit", -1, flags, move |ctx| {
        let mut state = st.lock().unwrap();
        match ctx.len() {
            0 => {}
            1 => state.sync_bit = ctx.get::<i64>(0)? != 0,
            n => {
                return Err(rusqlite::Error::UserFunctionError(
                    format!("crsql_internal_sync_bit expects 0 or 1 arguments, got {}", n).into(),
                ))
            }
        }
        Ok(state.sync_bit as i64)
    })?;

    let st = Arc::clone(state);
    conn.create_scalar_function("crsql_rows_impacted", 0, flags, move |_ctx| {
        Ok(st.lock().unwrap().rows_impacted)
    })?;

    Ok(())
}

fn install_hooks(conn: &Connection, state: &Arc<Mutex<SessionState>>) {
    let st = Arc::clone(state);
    conn.commit_hook(Some(move || {
        st.lock().unwrap().on_commit();
        false
    }));
    let st = Arc::clone(state);
    conn.rollback_hook(Some(move || {
        st.lock().unwrap().on_rollback();
    }));
}

/// Execute `f` inside a savepoint: released on success, rolled back (and
/// released) on error so the composite never leaves partial state behind.
pub(crate) fn with_savepoint<T>(
    conn: &Connection,
    name: &str,
    f: impl FnOnce() -> Result<T>,
) -> Result<T> {
    conn.execute_batch(&format!("SAVEPOINT {};", name))?;
    match f() {
        Ok(value) => {
            conn.execute_batch(&format!("RELEASE {};", name))?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_err) =
                conn.execute_batch(&format!("ROLLBACK TO {0}; RELEASE {0};", name))
            {
                log::warn!("failed to roll back savepoint {}: {}", name, rollback_err);
            }
            Err(e)
        }
    }
}

/// Single-column, zero-or-one-row query helper.
pub(crate) fn try_query_one<T: FromSql, P: Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Option<T>> {
    let mut stmt = conn.prepare_cached(sql)?;
    Ok(stmt.query_row(params, |r| r.get(0)).optional()?)
}
