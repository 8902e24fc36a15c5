/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Bootstrap of the replication metadata: site identity, the persisted
//! database version, the tracked-peers table and the (initially empty)
//! changes view. Table names are fixed for on-disk compatibility.

use crate::error::Result;
use crate::state::SITE_ID_LEN;
use crate::tableinfo::{crr_table_names, quoted_clock_table};
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension};

pub const SITE_ID_TABLE: &str = "__crsql_siteid";
pub const DB_VERSION_TABLE: &str = "__crsql_dbversion";
pub const TRACKED_PEERS_TABLE: &str = "crsql_tracked_peers";

/// Create the metadata tables. Runs inside the open-time transaction; all
/// statements are idempotent so reopening an initialized database is a
/// no-op.
pub fn init(conn: &Connection) -> Result<()> {
    log::debug!("initializing crsqlite metadata tables");
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS \"{site}\" (site_id BLOB NOT NULL);
         CREATE TABLE IF NOT EXISTS \"{dbv}\" (
             id INTEGER PRIMARY KEY CHECK (id = 0),
             version INTEGER NOT NULL
         );
         INSERT OR IGNORE INTO \"{dbv}\" (id, version) VALUES (0, 0);",
        site = SITE_ID_TABLE,
        dbv = DB_VERSION_TABLE,
    ))?;
    create_peer_tracking_table(conn)?;
    crate::changes::ensure_changes_view(conn)?;
    Ok(())
}

pub fn create_peer_tracking_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS \"{peers}\" (
             site_id BLOB NOT NULL,
             version INTEGER NOT NULL,
             seq INTEGER DEFAULT 0,
             tag INTEGER,
             event INTEGER,
             PRIMARY KEY (site_id, tag, event)
         )",
        peers = TRACKED_PEERS_TABLE,
    ))?;
    Ok(())
}

/// Load the stable site identifier, creating and persisting a fresh one on
/// the first open of this database.
pub fn load_or_create_site_id(conn: &Connection) -> Result<[u8; SITE_ID_LEN]> {
    let existing: Option<Vec<u8>> = conn
        .query_row(
            &format!("SELECT site_id FROM \"{}\" LIMIT 1", SITE_ID_TABLE),
            [],
            |r| r.get(0),
        )
        .optional()?;
    if let Some(blob) = existing {
        return blob.as_slice().try_into().map_err(|_| {
            crate::error::Error::Invariant(format!(
                "stored site id has length {}, expected {}",
                blob.len(),
                SITE_ID_LEN
            ))
        });
    }

    let site_id = generate_site_id();
    conn.execute(
        &format!("INSERT INTO \"{}\" (site_id) VALUES (?)", SITE_ID_TABLE),
        params![&site_id[..]],
    )?;
    log::debug!("generated new site id");
    Ok(site_id)
}

// Random 16 bytes shaped like a UUIDv4.
fn generate_site_id() -> [u8; SITE_ID_LEN] {
    let mut blob = [0u8; SITE_ID_LEN];
    rand::thread_rng().fill_bytes(&mut blob);
    blob[6] = (blob[6] & 0x0f) | 0x40;
    blob[8] = (blob[8] & 0x3f) | 0x80;
    blob
}

/// The committed database version: the larger of the persisted watermark
/// and the maximum version present in any clock table (local writes bump
/// clock tables without rewriting the watermark row).
pub fn fetch_db_version(conn: &Connection) -> Result<i64> {
    let mut version: i64 = conn
        .query_row(
            &format!("SELECT version FROM \"{}\" WHERE id = 0", DB_VERSION_TABLE),
            [],
            |r| r.get(0),
        )
        .optional()?
        .unwrap_or(0);
    for table in crr_table_names(conn)? {
        let max: i64 = conn.query_row(
            &format!(
                "SELECT COALESCE(MAX(__crsql_db_version), 0) FROM {}",
                quoted_clock_table(&table)
            ),
            [],
            |r| r.get(0),
        )?;
        version = version.max(max);
    }
    Ok(version)
}

/// Raise the persisted watermark; never lowers it. Runs inside whatever
/// transaction the caller holds.
pub fn persist_db_version(conn: &Connection, version: i64) -> Result<()> {
    conn.execute(
        &format!(
            "UPDATE \"{}\" SET version = ? WHERE id = 0 AND version < ?",
            DB_VERSION_TABLE
        ),
        params![version, version],
    )?;
    Ok(())
}
