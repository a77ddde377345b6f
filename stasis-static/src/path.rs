//! Request path resolution
//!
//! Turns a raw request path into a canonical lookup key. Everything here
//! is lexical: the filesystem is never consulted.

use percent_encoding::percent_decode_str;
use stasis_core::{Error, Result};

/// Resolve a raw request path into a lookup key
///
/// Percent-decodes first, then normalizes with [`normalize`]. Invalid
/// UTF-8 after decoding is `InvalidPath`.
pub fn resolve(raw: &str) -> Result<String> {
    let decoded = percent_decode_str(raw)
        .decode_utf8()
        .map_err(|_| Error::InvalidPath(raw.to_string()))?;
    normalize(&decoded).map_err(|_| Error::InvalidPath(raw.to_string()))
}

/// Lexically normalize an already decoded path
///
/// Collapses `//` and `.` segments and applies `..` against the segments
/// seen so far. A `..` that would climb above the root, a NUL byte or a
/// backslash is `InvalidPath`. The result always starts with `/` and keeps
/// a trailing slash.
pub fn normalize(path: &str) -> Result<String> {
    if path.contains('\0') || path.contains('\\') {
        return Err(Error::InvalidPath(path.to_string()));
    }

    let mut segments: Vec<&str> = Vec::new();
    let mut trailing_slash = path.ends_with('/');
    for segment in path.split('/') {
        match segment {
            "" => {}
            "." => trailing_slash = true,
            ".." => {
                if segments.pop().is_none() {
                    return Err(Error::InvalidPath(path.to_string()));
                }
                trailing_slash = true;
            }
            other => {
                segments.push(other);
                trailing_slash = false;
            }
        }
    }
    // the loop above resets the flag on every name, so re-check the raw tail
    if path.ends_with('/') {
        trailing_slash = true;
    }

    let mut key = String::with_capacity(path.len() + 1);
    key.push('/');
    key.push_str(&segments.join("/"));
    if trailing_slash && !segments.is_empty() {
        key.push('/');
    }
    Ok(key)
}

/// Normalize a URL prefix to `/name/` form (`/` for an empty prefix)
pub fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{}/", trimmed)
    }
}

/// Strip a mount prefix, keeping the leading `/` of the remainder
pub fn strip_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    let prefix = normalize_prefix(prefix);
    if prefix == "/" {
        return Some(path);
    }
    if path.len() + 1 == prefix.len() && prefix.starts_with(path) {
        return Some("/");
    }
    path.strip_prefix(&prefix[..prefix.len() - 1])
        .filter(|rest| rest.starts_with('/'))
}

/// Join a URL prefix and a `/`-separated relative path into a key
pub fn join_key(prefix: &str, relative: &str) -> String {
    let mut key = normalize_prefix(prefix);
    key.push_str(relative.trim_start_matches('/'));
    key
}
