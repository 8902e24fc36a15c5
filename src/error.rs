/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use rusqlite::ffi::ErrorCode;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Error executing SQL: {0}")]
    SqlError(#[from] rusqlite::Error),

    #[error("Table is not compatible with replication: {0}")]
    Unsupported(String),

    #[error("Incoming change names an unknown table: {0}")]
    UnknownTable(String),

    #[error("Malformed change record: {0}")]
    Malformed(String),

    #[error("Could not load table information: {0}")]
    Schema(String),

    #[error("Internal invariant violated: {0}")]
    Invariant(String),
}

impl Error {
    /// Transient busy/locked failures from the underlying store. Callers may
    /// retry the whole composite; every other kind is either a caller bug or
    /// a non-recoverable engine failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::SqlError(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}
