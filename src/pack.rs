/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Canonical packed encoding of a primary-key tuple.
//!
//! Each column value is rendered the way SQLite's `quote()` renders it
//! (`NULL`, a signed integer, a decimal float, `'text''with''quotes'`,
//! `X'aabb'`) and the parts are joined with `|`. The same encoding is
//! produced by the `crsql_changes` view in SQL, so packed keys from either
//! side compare byte-for-byte.

use crate::error::{Error, Result};
use rusqlite::types::Value;

/// Pack a primary-key tuple into its canonical blob form.
pub fn pack_pk(values: &[Value]) -> Vec<u8> {
    let mut out = String::new();
    for (i, v) in values.iter().enumerate() {
        if i > 0 {
            out.push('|');
        }
        match v {
            Value::Null => out.push_str("NULL"),
            Value::Integer(n) => out.push_str(&n.to_string()),
            Value::Real(f) => out.push_str(&format_real(*f)),
            Value::Text(s) => {
                out.push('\'');
                out.push_str(&s.replace('\'', "''"));
                out.push('\'');
            }
            Value::Blob(b) => {
                // Uppercase hex, matching SQLite's quote().
                out.push_str("X'");
                for byte in b {
                    out.push_str(&format!("{:02X}", byte));
                }
                out.push('\'');
            }
        }
    }
    out.into_bytes()
}

// Always keep a decimal point or exponent so the decoder can tell a real
// from an integer.
fn format_real(f: f64) -> String {
    let s = format!("{}", f);
    if s.contains('.') || s.contains('e') || s.contains('E') || s.contains("inf") || s.contains("NaN")
    {
        s
    } else {
        format!("{}.0", s)
    }
}

/// Unpack a blob produced by [`pack_pk`] (or the `crsql_changes` view) back
/// into column values. Rejects anything that is not one of the five quoted
/// token shapes.
pub fn unpack_pk(blob: &[u8]) -> Result<Vec<Value>> {
    let text = std::str::from_utf8(blob)
        .map_err(|_| Error::Malformed("primary-key blob is not valid UTF-8".to_string()))?;
    let bytes = text.as_bytes();
    let mut values = Vec::new();
    let mut pos = 0;

    loop {
        let (value, next) = parse_token(text, bytes, pos)?;
        values.push(value);
        if next == bytes.len() {
            return Ok(values);
        }
        if bytes[next] != b'|' {
            return Err(malformed(text, next));
        }
        pos = next + 1;
    }
}

fn parse_token(text: &str, bytes: &[u8], pos: usize) -> Result<(Value, usize)> {
    match bytes.get(pos) {
        None => Err(malformed(text, pos)),
        Some(b'N') => {
            if text[pos..].starts_with("NULL") {
                Ok((Value::Null, pos + 4))
            } else {
                Err(malformed(text, pos))
            }
        }
        Some(b'\'') => parse_text(text, bytes, pos),
        Some(b'X') | Some(b'x') => parse_blob(text, bytes, pos),
        Some(c) if c.is_ascii_digit() || *c == b'-' || *c == b'+' || *c == b'.' => {
            parse_number(text, bytes, pos)
        }
        Some(_) => Err(malformed(text, pos)),
    }
}

fn parse_text(text: &str, bytes: &[u8], pos: usize) -> Result<(Value, usize)> {
    // pos sits on the opening quote.
    let mut out = String::new();
    let mut i = pos + 1;
    while i < bytes.len() {
        if bytes[i] == b'\'' {
            if bytes.get(i + 1) == Some(&b'\'') {
                out.push('\'');
                i += 2;
            } else {
                return Ok((Value::Text(out), i + 1));
            }
        } else {
            // Advance one whole UTF-8 character.
            let ch = text[i..]
                .chars()
                .next()
                .ok_or_else(|| malformed(text, i))?;
            out.push(ch);
            i += ch.len_utf8();
        }
    }
    Err(Error::Malformed(
        "unterminated text token in primary-key blob".to_string(),
    ))
}

fn parse_blob(text: &str, bytes: &[u8], pos: usize) -> Result<(Value, usize)> {
    if bytes.get(pos + 1) != Some(&b'\'') {
        return Err(malformed(text, pos));
    }
    let mut out = Vec::new();
    let mut i = pos + 2;
    while i < bytes.len() && bytes[i] != b'\'' {
        let hi = hex_digit(bytes[i]).ok_or_else(|| malformed(text, i))?;
        let lo = bytes
            .get(i + 1)
            .and_then(|b| hex_digit(*b))
            .ok_or_else(|| malformed(text, i))?;
        out.push(hi << 4 | lo);
        i += 2;
    }
    if i >= bytes.len() {
        return Err(Error::Malformed(
            "unterminated blob token in primary-key blob".to_string(),
        ));
    }
    Ok((Value::Blob(out), i + 1))
}

fn parse_number(text: &str, bytes: &[u8], pos: usize) -> Result<(Value, usize)> {
    let mut end = pos;
    while end < bytes.len() && bytes[end] != b'|' {
        end += 1;
    }
    let token = &text[pos..end];
    if let Ok(n) = token.parse::<i64>() {
        return Ok((Value::Integer(n), end));
    }
    match token.parse::<f64>() {
        Ok(f) => Ok((Value::Real(f), end)),
        Err(_) => Err(malformed(text, pos)),
    }
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn malformed(text: &str, pos: usize) -> Error {
    Error::Malformed(format!(
        "unrecognized token at byte {} of primary-key blob {:?}",
        pos, text
    ))
}
