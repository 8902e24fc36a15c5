/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Small helpers for generating SQL text. All user-controlled identifiers
//! pass through [`escape_ident`]; string literals through
//! [`escape_string_literal`].

use crate::tableinfo::ColumnInfo;

/// Escape an identifier for interpolation inside a double-quoted name.
pub fn escape_ident(ident: &str) -> String {
    ident.replace('"', "\"\"")
}

/// Escape a value for interpolation inside a single-quoted SQL string
/// literal. The single quote is the only character needing escaping.
pub fn escape_string_literal(s: &str) -> String {
    s.replace('\'', "''")
}

/// `"a","b","c"`, each optionally prefixed (e.g. `NEW."a",NEW."b"`).
pub fn identifier_list(cols: &[ColumnInfo], prefix: Option<&str>) -> String {
    let prefix = prefix.unwrap_or("");
    cols.iter()
        .map(|c| format!("{}\"{}\"", prefix, escape_ident(&c.name)))
        .collect::<Vec<_>>()
        .join(",")
}

/// `"a" = ? AND "b" = ?` for binding a primary-key tuple.
pub fn where_list(cols: &[ColumnInfo]) -> String {
    cols.iter()
        .map(|c| format!("\"{}\" = ?", escape_ident(&c.name)))
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// `t."a" = c."a" AND t."b" = c."b"` for joining a table to its shadow.
pub fn join_list(cols: &[ColumnInfo], left: &str, right: &str) -> String {
    cols.iter()
        .map(|c| {
            let name = escape_ident(&c.name);
            format!("{left}.\"{name}\" = {right}.\"{name}\"")
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// `"a" = OLD."a" AND "b" = OLD."b"` for matching shadow rows against the
/// row a trigger fired on.
pub fn join_prefixed_where(cols: &[ColumnInfo], prefix: &str) -> String {
    cols.iter()
        .map(|c| {
            let name = escape_ident(&c.name);
            format!("\"{name}\" = {prefix}\"{name}\"")
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// `NEW."a" IS NOT OLD."a" OR NEW."b" IS NOT OLD."b"`.
pub fn any_differs(cols: &[ColumnInfo]) -> String {
    cols.iter()
        .map(|c| {
            let name = escape_ident(&c.name);
            format!("NEW.\"{name}\" IS NOT OLD.\"{name}\"")
        })
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// `?,?,?` with one binding per column.
pub fn binding_list(len: usize) -> String {
    vec!["?"; len].join(",")
}
