/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Introspection of user tables: which columns exist and which of them form
//! the primary key. Instances are cached per connection and revalidated
//! against `PRAGMA schema_version` (see `SessionState`).

use crate::error::{Error, Result};
use crate::util::escape_ident;
use rusqlite::{params, Connection};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub cid: i32,
    pub name: String,
    /// Declared type, possibly empty. The shadow table clones it so pk
    /// values keep the same affinity on both sides of the join.
    pub decl_type: String,
    /// 0 for non-pk columns; otherwise the 1-based position of the column
    /// in the `PRIMARY KEY (…)` clause.
    pub pk: i32,
}

#[derive(Debug, Clone)]
pub struct TableInfo {
    pub name: String,
    /// Primary-key columns ordered by their position in the key.
    pub pks: Vec<ColumnInfo>,
    pub non_pks: Vec<ColumnInfo>,
}

impl TableInfo {
    pub fn clock_table_name(&self) -> String {
        format!("{}__crsql_clock", self.name)
    }

    pub fn non_pk(&self, col_name: &str) -> Option<&ColumnInfo> {
        self.non_pks.iter().find(|c| c.name == col_name)
    }
}

/// Build a `TableInfo` from `pragma_table_info`. Fails with
/// [`Error::Schema`] when the table does not exist and with
/// [`Error::Schema`] when it has no primary key (the shadow table cannot be
/// keyed without one).
pub fn pull_table_info(conn: &Connection, table: &str) -> Result<TableInfo> {
    let mut stmt = conn.prepare_cached(
        "SELECT cid, name, type, pk FROM pragma_table_info(?) ORDER BY cid ASC",
    )?;
    let mut columns = Vec::new();
    let mut rows = stmt.query(params![table])?;
    while let Some(row) = rows.next()? {
        columns.push(ColumnInfo {
            cid: row.get(0)?,
            name: row.get(1)?,
            decl_type: row.get(2)?,
            pk: row.get(3)?,
        });
    }

    if columns.is_empty() {
        return Err(Error::Schema(format!("no such table: {}", table)));
    }

    let (mut pks, non_pks): (Vec<_>, Vec<_>) = columns.into_iter().partition(|c| c.pk > 0);
    pks.sort_by_key(|c| c.pk);

    if pks.is_empty() {
        return Err(Error::Schema(format!(
            "table {} has no explicit primary key",
            table
        )));
    }

    Ok(TableInfo {
        name: table.to_string(),
        pks,
        non_pks,
    })
}

/// The compatibility gate for promoting a table to a replicated relation.
pub fn check_compatible(conn: &Connection, table: &str) -> Result<()> {
    // Must have an explicit primary key.
    let pk_count: i64 = conn.query_row(
        "SELECT count(*) FROM pragma_table_info(?) WHERE pk > 0",
        params![table],
        |r| r.get(0),
    )?;
    if pk_count == 0 {
        return Err(Error::Unsupported(format!(
            "table {} has no explicit primary key",
            table
        )));
    }

    // NOT NULL columns outside the key must carry a default, otherwise a
    // column-at-a-time merge could not materialize a row.
    let narrow: i64 = conn.query_row(
        "SELECT count(*) FROM pragma_table_xinfo(?)
         WHERE \"notnull\" = 1 AND dflt_value IS NULL AND pk = 0",
        params![table],
        |r| r.get(0),
    )?;
    if narrow != 0 {
        return Err(Error::Unsupported(format!(
            "table {} has a NOT NULL column without a default value",
            table
        )));
    }

    // No unique indexes beyond the primary key; uniqueness cannot be
    // enforced across concurrent writers.
    let unique: i64 = conn.query_row(
        "SELECT count(*) FROM pragma_index_list(?)
         WHERE origin != 'pk' AND \"unique\" = 1",
        params![table],
        |r| r.get(0),
    )?;
    if unique != 0 {
        return Err(Error::Unsupported(format!(
            "table {} has unique indexes besides the primary key",
            table
        )));
    }

    // No foreign-key declarations; replication can transiently violate them.
    let fks: i64 = conn.query_row(
        "SELECT count(*) FROM pragma_foreign_key_list(?)",
        params![table],
        |r| r.get(0),
    )?;
    if fks != 0 {
        return Err(Error::Unsupported(format!(
            "table {} has foreign key declarations",
            table
        )));
    }

    // Two concurrent writers would hand unrelated rows the same
    // auto-assigned key.
    let autoinc: Option<i64> = crate::db::try_query_one(
        conn,
        "SELECT 1 FROM sqlite_master
         WHERE name = ? AND type = 'table' AND sql LIKE '%autoincrement%'",
        params![table],
    )?;
    if autoinc.is_some() {
        return Err(Error::Unsupported(format!(
            "table {} uses AUTOINCREMENT primary keys",
            table
        )));
    }

    Ok(())
}

/// Names of every table currently shadowed by a clock table.
pub fn crr_table_names(conn: &Connection) -> Result<Vec<String>> {
    let suffix = "__crsql_clock";
    // GLOB rather than LIKE: underscores in the suffix must match
    // literally.
    let mut stmt = conn.prepare_cached(
        "SELECT name FROM sqlite_master
         WHERE type = 'table' AND name GLOB '*__crsql_clock'
         ORDER BY name",
    )?;
    let mut names = Vec::new();
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let clock_name: String = row.get(0)?;
        names.push(clock_name[..clock_name.len() - suffix.len()].to_string());
    }
    Ok(names)
}

/// Does the given user table exist at all?
pub fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let found: Option<i64> = crate::db::try_query_one(
        conn,
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?",
        params![table],
    )?;
    Ok(found.is_some())
}

/// Quoted identifier for the clock table of `table`.
pub fn quoted_clock_table(table: &str) -> String {
    format!("\"{}__crsql_clock\"", escape_ident(table))
}
