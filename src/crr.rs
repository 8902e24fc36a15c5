/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Lifecycle of a replicated relation: promotion (`as_crr`), the
//! begin/commit alter bracket, backfill of clock records and compaction
//! of metadata after schema changes.

use crate::changes::{rebuild_changes_view, PKONLY_SENTINEL};
use crate::clock;
use crate::db::{with_savepoint, CrrDb};
use crate::error::{Error, Result};
use crate::tableinfo::{check_compatible, quoted_clock_table, table_exists, TableInfo};
use crate::triggers;
use crate::util::{escape_ident, escape_string_literal, identifier_list};

const ALTER_SAVEPOINT: &str = "crsql_alter";

/// Promote an ordinary table to a replicated relation: gate, clock table,
/// triggers, backfill of every existing row, and a refreshed changes view.
/// Idempotent for tables that are already replicated.
pub fn as_crr(db: &CrrDb, table: &str) -> Result<()> {
    check_compatible(db.conn(), table)?;
    with_savepoint(db.conn(), "crsql_as_crr", || {
        let info = db.table_info(table)?;
        clock::create_clock_table(db.conn(), &info)?;
        triggers::drop_triggers(db.conn(), table)?;
        triggers::create_triggers(db.conn(), &info)?;
        backfill(db, &info)?;
        rebuild_changes_view(db.conn())?;
        Ok(())
    })?;
    log::debug!("{} is now a replicated relation", table);
    Ok(())
}

/// Is the table currently tracked as a replicated relation?
pub fn is_crr(db: &CrrDb, table: &str) -> Result<bool> {
    table_exists(db.conn(), &format!("{}__crsql_clock", table))
}

/// Open the alter bracket: drop the triggers (so the caller's ALTER
/// statements are not tracked) and the changes view (so dropping a column
/// it references is possible). Everything up to [`commit_alter`] runs
/// inside one savepoint; a failed commit rolls the whole bracket back.
pub fn begin_alter(db: &CrrDb, table: &str) -> Result<()> {
    if !table_exists(db.conn(), table)? {
        return Err(Error::Schema(format!("no such table: {}", table)));
    }
    if !is_crr(db, table)? {
        return Err(Error::Schema(format!(
            "{} is not a replicated relation",
            table
        )));
    }
    db.conn()
        .execute_batch(&format!("SAVEPOINT {};", ALTER_SAVEPOINT))?;
    let result: Result<()> = (|| {
        triggers::drop_triggers(db.conn(), table)?;
        db.conn()
            .execute_batch("DROP VIEW IF EXISTS crsql_changes")?;
        Ok(())
    })();
    if result.is_err() {
        let _ = db.conn().execute_batch(&format!(
            "ROLLBACK TO {0}; RELEASE {0};",
            ALTER_SAVEPOINT
        ));
    }
    result
}

/// Close the alter bracket: compact clock records for dropped columns,
/// backfill ones for added columns, recreate the triggers and the view.
/// On any failure the savepoint opened by [`begin_alter`] is rolled back
/// and the table returns to its pre-alter state.
pub fn commit_alter(db: &CrrDb, table: &str) -> Result<()> {
    let result: Result<()> = (|| {
        let info = db.table_info(table)?;
        clock::create_clock_table(db.conn(), &info)?;
        clock::delete_stale_columns(db.conn(), &info)?;
        backfill(db, &info)?;
        triggers::create_triggers(db.conn(), &info)?;
        rebuild_changes_view(db.conn())?;
        Ok(())
    })();
    match result {
        Ok(()) => {
            db.conn()
                .execute_batch(&format!("RELEASE {};", ALTER_SAVEPOINT))?;
            // Cached statements may reference the pre-alter schema.
            db.conn().flush_prepared_statement_cache();
            log::debug!("committed schema change for {}", table);
            Ok(())
        }
        Err(e) => {
            let _ = db.conn().execute_batch(&format!(
                "ROLLBACK TO {0}; RELEASE {0};",
                ALTER_SAVEPOINT
            ));
            db.conn().flush_prepared_statement_cache();
            Err(e)
        }
    }
}

/// Synthesize clock records for rows that lack them: one per non-pk
/// column, or a single pk-only sentinel. `INSERT OR IGNORE` makes this
/// incremental, which is what the post-alter path needs: existing
/// records keep their versions, new columns start at 1.
fn backfill(db: &CrrDb, info: &TableInfo) -> Result<()> {
    let table = escape_ident(&info.name);
    let pk_list = identifier_list(&info.pks, None);
    let clock = quoted_clock_table(&info.name);

    let mut col_names: Vec<String> = info.non_pks.iter().map(|c| c.name.clone()).collect();
    if col_names.is_empty() {
        col_names.push(PKONLY_SENTINEL.to_string());
    }

    for col in col_names {
        db.conn().execute_batch(&format!(
            "INSERT OR IGNORE INTO {clock} (
               {pk_list},
               __crsql_col_name,
               __crsql_col_version,
               __crsql_db_version,
               __crsql_seq,
               __crsql_site_id
             ) SELECT
               {pk_list},
               '{col}',
               1,
               crsql_next_db_version(),
               crsql_increment_and_get_seq(),
               NULL
             FROM \"{table}\";",
            col = escape_string_literal(&col),
        ))?;
    }
    Ok(())
}
