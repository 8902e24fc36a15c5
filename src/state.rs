/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Per-connection session state: the site identity, the database-version
//! discipline, the in-transaction sequence counter, the sync bit and the
//! peer tracker. The state is shared (behind a mutex) with the SQL
//! function closures and the commit/rollback hooks, all of which require
//! `Send`. It is never shared across connections.

use crate::peers::PeerTracker;
use crate::tableinfo::TableInfo;
use std::collections::HashMap;
use std::sync::Arc;

pub const SITE_ID_LEN: usize = 16;

#[derive(Debug)]
pub struct SessionState {
    pub site_id: [u8; SITE_ID_LEN],
    /// Last db_version observed as committed. `None` means "query the
    /// store"; it is filled at open and maintained by the hooks afterward.
    pub committed_db_version: Option<i64>,
    /// The version the current transaction will commit to. Set on the
    /// first tracked mutation, discarded on rollback.
    pub pending_db_version: Option<i64>,
    /// 0-based position of the next tracked change within the current
    /// transaction.
    pub seq: i64,
    /// Suppresses the CRR triggers while a merge replays remote writes.
    pub sync_bit: bool,
    /// Rows successfully merged in the current transaction.
    pub rows_impacted: i64,
    /// `PRAGMA schema_version` at the time the table-info cache was built.
    pub schema_watermark: Option<i64>,
    pub table_infos: HashMap<String, Arc<TableInfo>>,
    pub peers: PeerTracker,
}

impl SessionState {
    pub fn new(site_id: [u8; SITE_ID_LEN], committed_db_version: i64) -> Self {
        SessionState {
            site_id,
            committed_db_version: Some(committed_db_version),
            pending_db_version: None,
            seq: 0,
            sync_bit: false,
            rows_impacted: 0,
            schema_watermark: None,
            table_infos: HashMap::new(),
            peers: PeerTracker::default(),
        }
    }

    /// The version the next tracked write in this transaction stamps.
    ///
    /// `ret = max(committed + 1, pending, arg)`; repeated calls within one
    /// transaction return the same value unless a caller supplies a larger
    /// `arg`.
    pub fn next_db_version(&mut self, arg: Option<i64>) -> i64 {
        let committed = self.committed_db_version.unwrap_or(0);
        let ret = (committed + 1)
            .max(self.pending_db_version.unwrap_or(0))
            .max(arg.unwrap_or(0));
        self.pending_db_version = Some(ret);
        ret
    }

    /// Lamport merge of a version observed from a peer: the pending version
    /// is raised so the next local write exceeds everything we have seen,
    /// without minting a new version for the merge itself.
    pub fn observe_db_version(&mut self, db_version: i64) {
        let pending = self.pending_db_version.unwrap_or(0);
        if db_version > pending {
            self.pending_db_version = Some(db_version);
        }
    }

    pub fn increment_and_get_seq(&mut self) -> i64 {
        let ret = self.seq;
        self.seq += 1;
        ret
    }

    pub fn get_seq(&self) -> i64 {
        self.seq
    }

    pub fn on_commit(&mut self) {
        if let Some(pending) = self.pending_db_version.take() {
            let committed = self.committed_db_version.unwrap_or(0);
            self.committed_db_version = Some(committed.max(pending));
        }
        self.seq = 0;
        self.rows_impacted = 0;
        // Table infos refreshed inside the transaction stay valid.
    }

    pub fn on_rollback(&mut self) {
        self.pending_db_version = None;
        self.seq = 0;
        self.rows_impacted = 0;
        self.peers.clear();
    }

    pub fn invalidate_table_infos(&mut self) {
        self.schema_watermark = None;
        self.table_infos.clear();
    }
}
