/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The clock store: one shadow table per replicated relation holding the
//! per-(row, column) version metadata, keyed by the row's primary-key
//! tuple plus the column name. A NULL `__crsql_site_id` marks a locally
//! originated write; two reserved column names mark tombstones
//! (`__crsql_del`) and pk-only row creation (`__crsql_pko`).

use crate::changes::DELETE_SENTINEL;
use crate::error::Result;
use crate::tableinfo::{quoted_clock_table, TableInfo};
use crate::util::{escape_ident, escape_string_literal, identifier_list, where_list};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension, ToSql};

/// Create the shadow table and its db_version index. Idempotent.
pub fn create_clock_table(conn: &Connection, info: &TableInfo) -> Result<()> {
    let pk_defs = info
        .pks
        .iter()
        .map(|c| {
            let decl = if c.decl_type.is_empty() {
                String::new()
            } else {
                format!(" {}", c.decl_type)
            };
            format!("\"{}\"{}", escape_ident(&c.name), decl)
        })
        .collect::<Vec<_>>()
        .join(",\n           ");

    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {clock} (
           {pk_defs},
           __crsql_col_name TEXT NOT NULL,
           __crsql_col_version INTEGER NOT NULL,
           __crsql_db_version INTEGER NOT NULL,
           __crsql_site_id BLOB,
           __crsql_seq INTEGER NOT NULL DEFAULT 0,
           PRIMARY KEY ({pk_list}, __crsql_col_name)
         );
         CREATE INDEX IF NOT EXISTS \"{table}__crsql_clock_dbv_idx\"
           ON {clock} (__crsql_db_version);",
        clock = quoted_clock_table(&info.name),
        table = escape_ident(&info.name),
        pk_list = identifier_list(&info.pks, None),
    ))?;
    Ok(())
}

/// The metadata half of a clock record, as the conflict resolver sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClockMeta {
    pub col_version: i64,
    pub db_version: i64,
    /// NULL for locally originated writes.
    pub site_id: Option<Vec<u8>>,
}

/// Load the metadata stored for `(pk, col)`, if any.
pub fn get_col_meta(
    conn: &Connection,
    info: &TableInfo,
    pk_values: &[Value],
    col_name: &str,
) -> Result<Option<ClockMeta>> {
    let sql = format!(
        "SELECT __crsql_col_version, __crsql_db_version, __crsql_site_id
         FROM {clock} WHERE {pk_where} AND __crsql_col_name = ?",
        clock = quoted_clock_table(&info.name),
        pk_where = where_list(&info.pks),
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let params: Vec<&dyn ToSql> = pk_values
        .iter()
        .map(|v| v as &dyn ToSql)
        .chain(std::iter::once(&col_name as &dyn ToSql))
        .collect();
    Ok(stmt
        .query_row(params_from_iter(params), |row| {
            Ok(ClockMeta {
                col_version: row.get(0)?,
                db_version: row.get(1)?,
                site_id: row.get(2)?,
            })
        })
        .optional()?)
}

/// Causal length of a row: the tombstone sentinel's `col_version` when one
/// exists (odd = alive again, even = deleted), else 1 for any known row,
/// else 0 for a row this site has never seen.
pub fn local_causal_length(
    conn: &Connection,
    info: &TableInfo,
    pk_values: &[Value],
) -> Result<i64> {
    let sql = format!(
        "SELECT COALESCE(
           (SELECT __crsql_col_version FROM {clock}
             WHERE {pk_where} AND __crsql_col_name = '{sentinel}'),
           (SELECT 1 FROM {clock} WHERE {pk_where} LIMIT 1),
           0)",
        clock = quoted_clock_table(&info.name),
        pk_where = where_list(&info.pks),
        sentinel = DELETE_SENTINEL,
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let params: Vec<&dyn ToSql> = pk_values
        .iter()
        .chain(pk_values.iter())
        .map(|v| v as &dyn ToSql)
        .collect();
    Ok(stmt.query_row(params_from_iter(params), |row| row.get(0))?)
}

/// Record the winning metadata for `(pk, col)`, replacing whatever was
/// there. The incoming values are stored verbatim; a merge never mints a
/// local db_version.
pub fn set_winner_clock(
    conn: &Connection,
    info: &TableInfo,
    pk_values: &[Value],
    col_name: &str,
    col_version: i64,
    db_version: i64,
    site_id: Option<&[u8]>,
    seq: i64,
) -> Result<()> {
    let sql = format!(
        "INSERT OR REPLACE INTO {clock} (
           {pk_list},
           __crsql_col_name,
           __crsql_col_version,
           __crsql_db_version,
           __crsql_site_id,
           __crsql_seq
         ) VALUES ({pk_bindings}, ?, ?, ?, ?, ?)",
        clock = quoted_clock_table(&info.name),
        pk_list = identifier_list(&info.pks, None),
        pk_bindings = crate::util::binding_list(info.pks.len()),
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let params: Vec<&dyn ToSql> = pk_values
        .iter()
        .map(|v| v as &dyn ToSql)
        .chain([
            &col_name as &dyn ToSql,
            &col_version as &dyn ToSql,
            &db_version as &dyn ToSql,
            &site_id as &dyn ToSql,
            &seq as &dyn ToSql,
        ])
        .collect();
    stmt.execute(params_from_iter(params))?;
    Ok(())
}

/// A row resurrected by a later causal length must not keep version
/// weight from its previous lifecycle: surviving column clocks are zeroed
/// so the new lifecycle's writes always win over them.
pub fn zero_clocks_on_resurrect(
    conn: &Connection,
    info: &TableInfo,
    pk_values: &[Value],
    db_version: i64,
) -> Result<()> {
    let sql = format!(
        "UPDATE {clock} SET __crsql_col_version = 0, __crsql_db_version = ?
         WHERE {pk_where} AND __crsql_col_name != '{sentinel}'",
        clock = quoted_clock_table(&info.name),
        pk_where = where_list(&info.pks),
        sentinel = DELETE_SENTINEL,
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let params: Vec<&dyn ToSql> = std::iter::once(&db_version as &dyn ToSql)
        .chain(pk_values.iter().map(|v| v as &dyn ToSql))
        .collect();
    stmt.execute(params_from_iter(params))?;
    Ok(())
}

/// After a merged delete the tombstone is the row's only record.
pub fn drop_non_sentinel_clocks(
    conn: &Connection,
    info: &TableInfo,
    pk_values: &[Value],
) -> Result<()> {
    let sql = format!(
        "DELETE FROM {clock} WHERE {pk_where} AND __crsql_col_name != '{sentinel}'",
        clock = quoted_clock_table(&info.name),
        pk_where = where_list(&info.pks),
        sentinel = DELETE_SENTINEL,
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    stmt.execute(params_from_iter(pk_values.iter()))?;
    Ok(())
}

/// Compaction after an ALTER: remove clock records for columns that no
/// longer exist. Tombstone and pk-only sentinels carry no column and are
/// always preserved.
pub fn delete_stale_columns(conn: &Connection, info: &TableInfo) -> Result<()> {
    let mut keep: Vec<String> = info
        .non_pks
        .iter()
        .map(|c| format!("'{}'", escape_string_literal(&c.name)))
        .collect();
    keep.push(format!("'{}'", DELETE_SENTINEL));
    keep.push(format!("'{}'", crate::changes::PKONLY_SENTINEL));

    let deleted = conn.execute(
        &format!(
            "DELETE FROM {clock} WHERE __crsql_col_name NOT IN ({keep})",
            clock = quoted_clock_table(&info.name),
            keep = keep.join(","),
        ),
        [],
    )?;
    if deleted > 0 {
        log::debug!(
            "compacted {} stale clock record(s) for {}",
            deleted,
            info.name
        );
    }
    Ok(())
}
