/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The write side of the changes feed: applying a batch of incoming
//! records under last-writer-wins conflict resolution.
//!
//! Each record is merged inside its own savepoint; the whole batch runs in
//! one transaction. User-row effects are replayed with the sync bit set so
//! the local triggers do not restamp them; clock records take the incoming
//! metadata verbatim, so a merge never mints a local db_version.

use crate::changes::{ChangeRecord, DELETE_SENTINEL};
use crate::clock;
use crate::db::{with_savepoint, CrrDb};
use crate::error::{Error, Result};
use crate::pack::unpack_pk;
use crate::peers::PeerKey;
use crate::schema;
use crate::tableinfo::TableInfo;
use crate::util::{binding_list, escape_ident, identifier_list, where_list};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, ToSql};
use std::cmp::Ordering;
use std::sync::Arc;

/// Merge a batch of records pulled from `source_site`'s feed. Records with
/// a NULL `site_id` were authored by that site and are attributed to it.
///
/// Returns the number of records that won and changed local state. Losing
/// records still advance the peer tracker: observing a clock is knowledge
/// worth keeping even when nothing changes.
pub fn apply_changes(db: &CrrDb, source_site: &[u8], changes: &[ChangeRecord]) -> Result<i64> {
    apply_changes_with_tag(db, source_site, changes, PeerKey::default())
}

/// [`apply_changes`], but tracking peers under a caller-chosen
/// `(tag, event)` pair.
pub fn apply_changes_with_tag(
    db: &CrrDb,
    source_site: &[u8],
    changes: &[ChangeRecord],
    peer_key: PeerKey,
) -> Result<i64> {
    let tx = db.conn().unchecked_transaction()?;
    let mut applied = 0i64;
    let mut max_version = 0i64;

    for change in changes {
        let won = with_savepoint(db.conn(), "crsql_merge_change", || {
            apply_one(db, source_site, change)
        })?;
        if won {
            applied += 1;
            db.state().lock().unwrap().rows_impacted += 1;
        }

        let origin = change.site_id.as_deref().unwrap_or(source_site);
        if origin != db.site_id() {
            db.state().lock().unwrap().peers.record(
                origin,
                peer_key,
                change.db_version,
                change.seq,
            );
        }
        max_version = max_version.max(change.db_version);
    }

    if max_version > 0 {
        schema::persist_db_version(db.conn(), max_version)?;
    }
    {
        let state = db.state().lock().unwrap();
        state.peers.flush(db.conn())?;
    }
    {
        let mut state = db.state().lock().unwrap();
        state.peers.clear();
        // Lamport merge: the next local write must exceed everything seen.
        state.observe_db_version(max_version);
    }

    tx.commit()?;
    log::debug!(
        "merged {}/{} incoming change(s)",
        applied,
        changes.len()
    );
    Ok(applied)
}

fn apply_one(db: &CrrDb, source_site: &[u8], change: &ChangeRecord) -> Result<bool> {
    let info = db.table_info(&change.table).map_err(|e| match e {
        Error::Schema(_) => Error::UnknownTable(change.table.clone()),
        other => other,
    })?;

    let pks = unpack_pk(&change.pk)?;
    if pks.len() != info.pks.len() {
        return Err(Error::Malformed(format!(
            "primary-key blob for {} decodes to {} value(s), table has {}",
            change.table,
            pks.len(),
            info.pks.len()
        )));
    }

    let origin = change.site_id.as_deref().unwrap_or(source_site);
    let conn = db.conn();
    let local_cl = clock::local_causal_length(conn, &info, &pks)?;

    // Anything from an older lifecycle of the row is stale and can never
    // win at anything.
    if change.cl < local_cl {
        return Ok(false);
    }

    let row_known = local_cl != 0;
    // An alive record from a later lifecycle revives the row, whether or
    // not we ever saw the intervening delete (gap tolerance).
    let resurrect = change.cl > local_cl && change.cl % 2 == 1;

    if change.is_delete() {
        if change.cl == local_cl {
            // This tombstone generation (or revival) is already processed.
            return Ok(false);
        }
        if change.cl % 2 == 0 {
            // A newer tombstone: drop the row, keep only the sentinel.
            db.with_sync_bit(|conn| delete_row(conn, &info, &pks))?;
            clock::set_winner_clock(
                conn,
                &info,
                &pks,
                DELETE_SENTINEL,
                change.col_version,
                change.db_version,
                Some(origin),
                change.seq,
            )?;
            clock::drop_non_sentinel_clocks(conn, &info, &pks)?;
        } else {
            // An odd sentinel is a revival marker: the row came back to
            // life at this causal length. Make sure it exists and record
            // the new length; column values follow in their own records.
            db.with_sync_bit(|conn| insert_pk_only(conn, &info, &pks))?;
            if row_known {
                clock::zero_clocks_on_resurrect(conn, &info, &pks, change.db_version)?;
            }
            clock::set_winner_clock(
                conn,
                &info,
                &pks,
                DELETE_SENTINEL,
                change.col_version,
                change.db_version,
                Some(origin),
                change.seq,
            )?;
        }
        return Ok(true);
    }

    if change.is_pk_only() {
        if change.cl == local_cl {
            // Same lifecycle; the record can still carry metadata we have
            // not seen (e.g. a gap-filled creation marker).
            if !did_cid_win(db, &info, &pks, change, origin)? {
                return Ok(false);
            }
        } else if row_known {
            clock::zero_clocks_on_resurrect(conn, &info, &pks, change.db_version)?;
        }
        db.with_sync_bit(|conn| insert_pk_only(conn, &info, &pks))?;
        if change.cl > local_cl && (row_known || change.cl > 1) {
            clock::set_winner_clock(
                conn,
                &info,
                &pks,
                DELETE_SENTINEL,
                change.cl,
                change.db_version,
                Some(origin),
                change.seq,
            )?;
        }
        clock::set_winner_clock(
            conn,
            &info,
            &pks,
            &change.cid,
            change.col_version,
            change.db_version,
            Some(origin),
            change.seq,
        )?;
        return Ok(true);
    }

    // Regular column change. The column must exist; a record for a column
    // this site has never heard of means the schemas are out of step.
    if info.non_pk(&change.cid).is_none() {
        return Err(Error::Schema(format!(
            "table {} has no column {}",
            change.table, change.cid
        )));
    }

    if resurrect && (row_known || change.cl > 1) {
        db.with_sync_bit(|conn| insert_pk_only(conn, &info, &pks))?;
        if row_known {
            clock::zero_clocks_on_resurrect(conn, &info, &pks, change.db_version)?;
        }
        clock::set_winner_clock(
            conn,
            &info,
            &pks,
            DELETE_SENTINEL,
            change.cl,
            change.db_version,
            Some(origin),
            change.seq,
        )?;
    }

    let wins = resurrect
        || !row_known
        || did_cid_win(db, &info, &pks, change, origin)?;
    if !wins {
        return Ok(false);
    }

    db.with_sync_bit(|conn| upsert_column(conn, &info, &pks, &change.cid, &change.val))?;
    clock::set_winner_clock(
        conn,
        &info,
        &pks,
        &change.cid,
        change.col_version,
        change.db_version,
        Some(origin),
        change.seq,
    )?;
    Ok(true)
}

/// Last-writer-wins decision for one `(pk, column)` cell. Pure metadata:
/// `col_version`, then `db_version`, then the site-id comparator against
/// the effective local writer. Exact equality is a no-op (lose).
fn did_cid_win(
    db: &CrrDb,
    info: &Arc<TableInfo>,
    pks: &[Value],
    change: &ChangeRecord,
    origin: &[u8],
) -> Result<bool> {
    let local = match clock::get_col_meta(db.conn(), info, pks, &change.cid)? {
        Some(meta) => meta,
        // Nothing local to lose against.
        None => return Ok(true),
    };

    Ok(match change.col_version.cmp(&local.col_version) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => match change.db_version.cmp(&local.db_version) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => {
                let local_writer = local.site_id.as_deref().unwrap_or_else(|| db.site_id());
                origin > local_writer
            }
        },
    })
}

fn delete_row(conn: &rusqlite::Connection, info: &TableInfo, pks: &[Value]) -> Result<()> {
    let sql = format!(
        "DELETE FROM \"{}\" WHERE {}",
        escape_ident(&info.name),
        where_list(&info.pks),
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    stmt.execute(params_from_iter(pks.iter()))?;
    Ok(())
}

fn insert_pk_only(conn: &rusqlite::Connection, info: &TableInfo, pks: &[Value]) -> Result<()> {
    let sql = format!(
        "INSERT OR IGNORE INTO \"{}\" ({}) VALUES ({})",
        escape_ident(&info.name),
        identifier_list(&info.pks, None),
        binding_list(info.pks.len()),
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    stmt.execute(params_from_iter(pks.iter()))?;
    Ok(())
}

fn upsert_column(
    conn: &rusqlite::Connection,
    info: &TableInfo,
    pks: &[Value],
    col_name: &str,
    val: &Value,
) -> Result<()> {
    let col = escape_ident(col_name);
    let sql = format!(
        "INSERT INTO \"{table}\" ({pk_list}, \"{col}\") VALUES ({bindings}, ?)
         ON CONFLICT DO UPDATE SET \"{col}\" = excluded.\"{col}\"",
        table = escape_ident(&info.name),
        pk_list = identifier_list(&info.pks, None),
        bindings = binding_list(info.pks.len()),
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let params: Vec<&dyn ToSql> = pks
        .iter()
        .map(|v| v as &dyn ToSql)
        .chain(std::iter::once(val as &dyn ToSql))
        .collect();
    stmt.execute(params_from_iter(params))?;
    Ok(())
}
