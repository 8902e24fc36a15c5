/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Conflict-free replicated relations over SQLite.
//!
//! Promoting a table with [`as_crr`] gives it a shadow clock table and a
//! set of triggers that record per-column version metadata for every local
//! write. The [`changes_since`] feed exposes those writes as ordered
//! change records (also queryable as the `crsql_changes` view), and
//! [`apply_changes`] merges a peer's feed under last-writer-wins
//! resolution, so any number of sites can write independently and
//! converge.

#![allow(unknown_lints)]
#![warn(rust_2018_idioms)]

pub mod changes;
mod clock;
pub mod crr;
pub mod db;
pub mod error;
pub mod pack;
mod peers;
mod schema;
mod state;
mod tableinfo;
mod triggers;
mod util;

pub use changes::apply::{apply_changes, apply_changes_with_tag};
pub use changes::read::changes_since;
pub use changes::{ChangeRecord, DELETE_SENTINEL, PKONLY_SENTINEL};
pub use crr::{as_crr, begin_alter, commit_alter, is_crr};
pub use db::CrrDb;
pub use error::{Error, Result};
pub use pack::{pack_pk, unpack_pk};
pub use peers::PeerKey;
