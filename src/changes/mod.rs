/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The changes feed: the `crsql_changes` view for SQL-side reads, the
//! typed read cursor, and the merge entry point for incoming records.

pub mod apply;
pub mod read;

use crate::error::Result;
use crate::tableinfo::{crr_table_names, pull_table_info, quoted_clock_table, TableInfo};
use crate::util::{escape_ident, escape_string_literal, join_list};
use rusqlite::types::Value;
use rusqlite::Connection;

/// Reserved `cid` marking a row tombstone. The record's `col_version` is
/// the row's causal length.
pub const DELETE_SENTINEL: &str = "__crsql_del";
/// Reserved `cid` marking a row created only by its primary key (tables
/// with no non-pk columns to stamp).
pub const PKONLY_SENTINEL: &str = "__crsql_pko";

/// One row of the changes feed, in wire order.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    pub table: String,
    /// Canonical packed primary-key tuple (see [`crate::pack`]).
    pub pk: Vec<u8>,
    /// Column name, or one of the reserved sentinels.
    pub cid: String,
    /// The replicated value; NULL for sentinels.
    pub val: Value,
    pub col_version: i64,
    pub db_version: i64,
    /// NULL for changes authored by the site that produced the feed.
    pub site_id: Option<Vec<u8>>,
    /// Causal length of the row at the time of the change.
    pub cl: i64,
    /// Position of the change within its producing transaction.
    pub seq: i64,
}

impl ChangeRecord {
    pub fn is_delete(&self) -> bool {
        self.cid == DELETE_SENTINEL
    }

    pub fn is_pk_only(&self) -> bool {
        self.cid == PKONLY_SENTINEL
    }
}

/// Create the view if this database has never had one. Used at open so
/// `SELECT … FROM crsql_changes` always works, even with no replicated
/// tables yet.
pub fn ensure_changes_view(conn: &Connection) -> Result<()> {
    let exists: Option<i64> = crate::db::try_query_one(
        conn,
        "SELECT 1 FROM sqlite_master WHERE type = 'view' AND name = 'crsql_changes'",
        [],
    )?;
    if exists.is_none() {
        rebuild_changes_view(conn)?;
    }
    Ok(())
}

/// (Re)build `crsql_changes` as a union over every replicated table.
/// Called whenever the set of replicated tables or one of their schemas
/// changes.
pub fn rebuild_changes_view(conn: &Connection) -> Result<()> {
    let mut selects = Vec::new();
    for table in crr_table_names(conn)? {
        let info = pull_table_info(conn, &table)?;
        selects.push(table_changes_select(&info));
    }
    if selects.is_empty() {
        // A well-typed empty feed.
        selects.push(
            "SELECT NULL AS \"table\", NULL AS pk, NULL AS cid, NULL AS val,
                    NULL AS col_version, NULL AS db_version, NULL AS site_id,
                    NULL AS cl, NULL AS seq
             WHERE 0"
                .to_string(),
        );
    }
    conn.execute_batch(&format!(
        "DROP VIEW IF EXISTS crsql_changes;
         CREATE VIEW crsql_changes AS {};",
        selects.join("\nUNION ALL\n")
    ))?;
    log::debug!("rebuilt crsql_changes view");
    Ok(())
}

fn table_changes_select(info: &TableInfo) -> String {
    let clock = quoted_clock_table(&info.name);
    let table = escape_ident(&info.name);

    let pk_expr = info
        .pks
        .iter()
        .map(|c| format!("quote(c.\"{}\")", escape_ident(&c.name)))
        .collect::<Vec<_>>()
        .join(" || '|' || ");

    // The current value of whichever column the record names; sentinels
    // fall through to NULL.
    let val_expr = if info.non_pks.is_empty() {
        "NULL".to_string()
    } else {
        let arms = info
            .non_pks
            .iter()
            .map(|c| {
                format!(
                    "WHEN '{}' THEN t.\"{}\"",
                    escape_string_literal(&c.name),
                    escape_ident(&c.name)
                )
            })
            .collect::<Vec<_>>()
            .join(" ");
        format!("CASE c.__crsql_col_name {} ELSE NULL END", arms)
    };

    let cl_expr = format!(
        "COALESCE((SELECT d.__crsql_col_version FROM {clock} d
                    WHERE {match_pks} AND d.__crsql_col_name = '{sentinel}'), 1)",
        match_pks = join_list(&info.pks, "d", "c"),
        sentinel = DELETE_SENTINEL,
    );

    format!(
        "SELECT
           '{table_literal}' AS \"table\",
           CAST({pk_expr} AS BLOB) AS pk,
           c.__crsql_col_name AS cid,
           {val_expr} AS val,
           c.__crsql_col_version AS col_version,
           c.__crsql_db_version AS db_version,
           c.__crsql_site_id AS site_id,
           {cl_expr} AS cl,
           c.__crsql_seq AS seq
         FROM {clock} c
         LEFT JOIN \"{table}\" t ON {join_pks}",
        table_literal = escape_string_literal(&info.name),
        join_pks = join_list(&info.pks, "t", "c"),
    )
}
