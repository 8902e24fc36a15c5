/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Generation of the per-table INSERT/UPDATE/DELETE triggers that stamp
//! clock records on local writes.
//!
//! Every trigger is guarded by `crsql_internal_sync_bit() = 0` so replayed
//! remote writes (which carry their own metadata) skip stamping entirely.
//! The conflict arm of each upsert reuses the sequence allocated by the
//! select arm via `crsql_get_seq() - 1`; both arms always agree.

use crate::changes::{DELETE_SENTINEL, PKONLY_SENTINEL};
use crate::error::Result;
use crate::tableinfo::{quoted_clock_table, TableInfo};
use crate::util::{any_differs, escape_ident, identifier_list, join_prefixed_where};
use rusqlite::Connection;

pub fn create_triggers(conn: &Connection, info: &TableInfo) -> Result<()> {
    log::debug!("creating crr triggers for {}", info.name);
    create_insert_trigger(conn, info)?;
    create_update_trigger(conn, info)?;
    create_delete_trigger(conn, info)?;
    Ok(())
}

pub fn drop_triggers(conn: &Connection, table: &str) -> Result<()> {
    let table = escape_ident(table);
    conn.execute_batch(&format!(
        "DROP TRIGGER IF EXISTS \"{table}__crsql_itrig\";
         DROP TRIGGER IF EXISTS \"{table}__crsql_utrig\";
         DROP TRIGGER IF EXISTS \"{table}__crsql_dtrig\";"
    ))?;
    Ok(())
}

fn create_insert_trigger(conn: &Connection, info: &TableInfo) -> Result<()> {
    let mut body = vec![revive_tombstone_component(info, "NEW.")];
    if info.non_pks.is_empty() {
        body.push(clock_upsert_component(info, PKONLY_SENTINEL, None));
    } else {
        for col in &info.non_pks {
            body.push(clock_upsert_component(info, &col.name, None));
        }
    }

    conn.execute_batch(&format!(
        "CREATE TRIGGER \"{table}__crsql_itrig\"
         AFTER INSERT ON \"{table}\" WHEN crsql_internal_sync_bit() = 0
         BEGIN
           {body}
         END;",
        table = escape_ident(&info.name),
        body = body.join("\n"),
    ))?;
    Ok(())
}

fn create_update_trigger(conn: &Connection, info: &TableInfo) -> Result<()> {
    let mut body = Vec::new();
    if info.non_pks.is_empty() {
        body.push(clock_upsert_component(
            info,
            PKONLY_SENTINEL,
            Some(any_differs(&info.pks)),
        ));
    } else {
        for col in &info.non_pks {
            let name = escape_ident(&col.name);
            body.push(clock_upsert_component(
                info,
                &col.name,
                Some(format!("NEW.\"{name}\" IS NOT OLD.\"{name}\"")),
            ));
        }
    }

    conn.execute_batch(&format!(
        "CREATE TRIGGER \"{table}__crsql_utrig\"
         AFTER UPDATE ON \"{table}\" WHEN crsql_internal_sync_bit() = 0
         BEGIN
           {body}
         END;",
        table = escape_ident(&info.name),
        body = body.join("\n"),
    ))?;
    Ok(())
}

fn create_delete_trigger(conn: &Connection, info: &TableInfo) -> Result<()> {
    let clock = quoted_clock_table(&info.name);
    let pk_list = identifier_list(&info.pks, None);
    let pk_old_list = identifier_list(&info.pks, Some("OLD."));
    let pk_where = join_prefixed_where(&info.pks, "OLD.");

    // A fresh tombstone records causal length 2 (one insert, one delete);
    // re-deleting a revived row flips an odd sentinel back to even. All
    // other records for the row are replaced by the single sentinel.
    conn.execute_batch(&format!(
        "CREATE TRIGGER \"{table}__crsql_dtrig\"
         AFTER DELETE ON \"{table}\" WHEN crsql_internal_sync_bit() = 0
         BEGIN
           INSERT INTO {clock} (
             {pk_list},
             __crsql_col_name,
             __crsql_col_version,
             __crsql_db_version,
             __crsql_seq,
             __crsql_site_id
           ) SELECT
             {pk_old_list},
             '{sentinel}',
             2,
             crsql_next_db_version(),
             crsql_increment_and_get_seq(),
             NULL WHERE true
           ON CONFLICT DO UPDATE SET
             __crsql_col_version = __crsql_col_version + 1,
             __crsql_db_version = crsql_next_db_version(),
             __crsql_seq = crsql_get_seq() - 1,
             __crsql_site_id = NULL;
           DELETE FROM {clock}
             WHERE {pk_where} AND __crsql_col_name != '{sentinel}';
         END;",
        table = escape_ident(&info.name),
        sentinel = DELETE_SENTINEL,
    ))?;
    Ok(())
}

/// Upsert of one clock record keyed on the NEW row's primary key. `guard`
/// restricts stamping to rows that actually changed.
fn clock_upsert_component(info: &TableInfo, col_name: &str, guard: Option<String>) -> String {
    let where_clause = guard.unwrap_or_else(|| "true".to_string());
    format!(
        "INSERT INTO {clock} (
           {pk_list},
           __crsql_col_name,
           __crsql_col_version,
           __crsql_db_version,
           __crsql_seq,
           __crsql_site_id
         ) SELECT
           {pk_new_list},
           '{col_name}',
           1,
           crsql_next_db_version(),
           crsql_increment_and_get_seq(),
           NULL WHERE {where_clause}
         ON CONFLICT DO UPDATE SET
           __crsql_col_version = __crsql_col_version + 1,
           __crsql_db_version = crsql_next_db_version(),
           __crsql_seq = crsql_get_seq() - 1,
           __crsql_site_id = NULL;",
        clock = quoted_clock_table(&info.name),
        pk_list = identifier_list(&info.pks, None),
        pk_new_list = identifier_list(&info.pks, Some("NEW.")),
        col_name = crate::util::escape_string_literal(col_name),
    )
}

// Inserting a row whose tombstone is still around is a revival: the causal
// length flips from even back to odd. A never-deleted row has no sentinel
// and the statement matches nothing.
fn revive_tombstone_component(info: &TableInfo, prefix: &str) -> String {
    format!(
        "UPDATE {clock} SET
           __crsql_col_version = __crsql_col_version + 1,
           __crsql_db_version = crsql_next_db_version(),
           __crsql_seq = crsql_increment_and_get_seq(),
           __crsql_site_id = NULL
         WHERE {pk_where} AND __crsql_col_name = '{sentinel}'
           AND __crsql_col_version % 2 = 0;",
        clock = quoted_clock_table(&info.name),
        pk_where = join_prefixed_where(&info.pks, prefix),
        sentinel = DELETE_SENTINEL,
    )
}
