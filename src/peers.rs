/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Tracking of peer sites observed during a merge transaction.
//!
//! Entries accumulate in memory while changes are applied and are written
//! to `crsql_tracked_peers` just before the merge transaction commits. A
//! rolled-back merge discards its entries without touching the table.

use crate::error::Result;
use rusqlite::{params, Connection};
use std::collections::HashMap;

/// `(tag, event)` are opaque integers a caller may use to partition its
/// tracking rows; everything defaults to `(0, 0)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PeerKey {
    pub tag: i64,
    pub event: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerClock {
    pub version: i64,
    pub seq: i64,
}

#[derive(Debug, Default)]
pub struct PeerTracker {
    peers: HashMap<(Vec<u8>, PeerKey), PeerClock>,
}

impl PeerTracker {
    /// Record that we observed `version`/`seq` from `site_id`. Never moves
    /// a stored clock backward.
    pub fn record(&mut self, site_id: &[u8], key: PeerKey, version: i64, seq: i64) {
        let entry = self
            .peers
            .entry((site_id.to_vec(), key))
            .or_insert(PeerClock { version, seq });
        if (version, seq) > (entry.version, entry.seq) {
            *entry = PeerClock { version, seq };
        }
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Clock currently tracked in memory for a peer, if any.
    pub fn get(&self, site_id: &[u8], key: PeerKey) -> Option<PeerClock> {
        self.peers.get(&(site_id.to_vec(), key)).copied()
    }

    /// Write every entry to the persistent peer table, keeping whichever
    /// clock is larger. Call inside the merge transaction, then [`Self::clear`].
    pub fn flush(&self, conn: &Connection) -> Result<()> {
        if self.peers.is_empty() {
            return Ok(());
        }
        let mut stmt = conn.prepare_cached(
            "INSERT INTO crsql_tracked_peers (site_id, version, seq, tag, event)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (site_id, tag, event) DO UPDATE SET
               version = excluded.version,
               seq = excluded.seq
             WHERE excluded.version > version
                OR (excluded.version = version AND excluded.seq > seq)",
        )?;
        for ((site_id, key), clock) in &self.peers {
            stmt.execute(params![site_id, clock.version, clock.seq, key.tag, key.event])?;
        }
        log::trace!("flushed {} tracked peer(s)", self.peers.len());
        Ok(())
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }
}
