/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The read side of the changes feed: an ordered scan of `crsql_changes`
//! with optional lower bound and origin filters.

use crate::changes::ChangeRecord;
use crate::db::CrrDb;
use crate::error::Result;
use rusqlite::{params_from_iter, ToSql};

/// Changes committed after `min_db_version`, in `(db_version, seq)` order.
/// `(db_version, seq)` is unique within a site, so the order is total and
/// deterministic for identical input.
///
/// `exclude_sites` drops changes that originated at any of the given
/// sites; locally authored changes (`site_id` NULL) always pass. Pullers
/// typically exclude themselves to avoid receiving their own writes back.
pub fn changes_since(
    db: &CrrDb,
    min_db_version: i64,
    exclude_sites: &[&[u8]],
) -> Result<Vec<ChangeRecord>> {
    let mut sql = String::from(
        "SELECT \"table\", pk, cid, val, col_version, db_version, site_id, cl, seq
         FROM crsql_changes
         WHERE db_version > ?",
    );
    for _ in exclude_sites {
        sql.push_str(" AND (site_id IS NULL OR site_id != ?)");
    }
    sql.push_str(" ORDER BY db_version ASC, seq ASC");

    let params: Vec<&dyn ToSql> = std::iter::once(&min_db_version as &dyn ToSql)
        .chain(exclude_sites.iter().map(|s| s as &dyn ToSql))
        .collect();

    let conn = db.conn();
    let mut stmt = conn.prepare_cached(&sql)?;
    let mut rows = stmt.query(params_from_iter(params))?;
    let mut changes = Vec::new();
    while let Some(row) = rows.next()? {
        changes.push(ChangeRecord {
            table: row.get(0)?,
            pk: row.get(1)?,
            cid: row.get(2)?,
            val: row.get(3)?,
            col_version: row.get(4)?,
            db_version: row.get(5)?,
            site_id: row.get(6)?,
            cl: row.get(7)?,
            seq: row.get(8)?,
        });
    }
    log::trace!(
        "changes_since({}) -> {} record(s)",
        min_db_version,
        changes.len()
    );
    Ok(changes)
}
