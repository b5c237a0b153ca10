//! Whitespace- and comment-insensitive source hashing.
//!
//! Unify mode hashes a canonicalized token stream of the preprocessed
//! source instead of its raw bytes, so reformatting a file doesn't
//! invalidate its cache entries. Each token is fed to the hasher
//! followed by a newline; comments, horizontal whitespace, blank lines,
//! and preprocessor line markers all disappear.
//!
//! This canonicalization is this implementation's own scheme (the hash
//! version prefix changes whenever it does), so entries written by other
//! implementations are simply missed.

use std::path::Path;

use ccache_common::Hasher;

use crate::error::CacheError;

/// Multi-character operators, longest first so maximal munch works.
const OPERATORS: &[&str] = &[
    "<<=", ">>=", "...", "->", "<<", ">>", "<=", ">=", "==", "!=", "&&", "||", "++", "--", "+=",
    "-=", "*=", "/=", "%=", "&=", "|=", "^=", "##",
];

/// Reads a file and hashes its unified token stream.
pub fn unify_hash(hasher: &mut Hasher, path: &Path) -> Result<(), CacheError> {
    let data = std::fs::read(path).map_err(|e| CacheError::io(path, e))?;
    unify_bytes(hasher, &data);
    Ok(())
}

/// Hashes the unified token stream of `data`.
pub fn unify_bytes(hasher: &mut Hasher, data: &[u8]) {
    let mut i = 0;
    let mut at_line_start = true;
    let end = data.len();

    while i < end {
        let c = data[i];

        if c == b'\n' {
            at_line_start = true;
            i += 1;
            continue;
        }
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }

        // Line markers from the preprocessor carry no semantics the
        // object file depends on; drop the whole line.
        if at_line_start && c == b'#' && is_line_marker(&data[i..]) {
            while i < end && data[i] != b'\n' {
                i += 1;
            }
            continue;
        }
        at_line_start = false;

        // Comments.
        if c == b'/' && i + 1 < end && data[i + 1] == b'/' {
            while i < end && data[i] != b'\n' {
                i += 1;
            }
            continue;
        }
        if c == b'/' && i + 1 < end && data[i + 1] == b'*' {
            i += 2;
            while i + 1 < end && !(data[i] == b'*' && data[i + 1] == b'/') {
                i += 1;
            }
            i = (i + 2).min(end);
            continue;
        }

        // String and character literals, kept verbatim with their
        // quotes and escapes.
        if c == b'"' || c == b'\'' {
            let start = i;
            i += 1;
            while i < end && data[i] != c {
                if data[i] == b'\\' && i + 1 < end {
                    i += 1;
                }
                i += 1;
            }
            i = (i + 1).min(end);
            emit(hasher, &data[start..i]);
            continue;
        }

        // Preprocessing numbers: 1.5e+3, 0x1fULL, ...
        if c.is_ascii_digit() {
            let start = i;
            i += 1;
            while i < end {
                let d = data[i];
                let prev = data[i - 1];
                let exponent_sign = (d == b'+' || d == b'-')
                    && matches!(prev, b'e' | b'E' | b'p' | b'P');
                if d.is_ascii_alphanumeric() || d == b'.' || d == b'_' || exponent_sign {
                    i += 1;
                } else {
                    break;
                }
            }
            emit(hasher, &data[start..i]);
            continue;
        }

        // Identifiers and keywords.
        if c == b'_' || c.is_ascii_alphabetic() {
            let start = i;
            while i < end && (data[i] == b'_' || data[i].is_ascii_alphanumeric()) {
                i += 1;
            }
            emit(hasher, &data[start..i]);
            continue;
        }

        // Operators, maximal munch.
        if let Some(op) = OPERATORS
            .iter()
            .find(|op| data[i..].starts_with(op.as_bytes()))
        {
            emit(hasher, op.as_bytes());
            i += op.len();
            continue;
        }
        emit(hasher, &data[i..i + 1]);
        i += 1;
    }
}

fn emit(hasher: &mut Hasher, token: &[u8]) {
    hasher.update(token);
    hasher.update(b"\n");
}

fn is_line_marker(line: &[u8]) -> bool {
    // "# 1 ..." or "#line ..."
    let mut rest = &line[1..];
    if rest.starts_with(b"line") {
        rest = &rest[4..];
    }
    while let Some((b' ' | b'\t', tail)) = rest.split_first().map(|(c, t)| (*c, t)) {
        rest = tail;
    }
    rest.first().is_some_and(|c| c.is_ascii_digit())
}
