//! MIME type handling

use std::collections::HashMap;
use std::path::Path;

/// Get MIME type for a file, consulting `extra` (extension -> type) first
pub fn guess_mime_type(path: &Path, extra: &HashMap<String, String>) -> String {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    if let Some(mime) = ext.as_deref().and_then(|e| extra.get(e)) {
        return mime.clone();
    }
    mime_guess::from_path(path)
        .first_raw()
        .unwrap_or("application/octet-stream")
        .to_string()
}

/// Whether a type is textual enough to carry a charset parameter
fn wants_charset(mime: &str) -> bool {
    mime.starts_with("text/")
        || matches!(
            mime,
            "application/javascript" | "application/json" | "application/manifest+json"
        )
}

/// Full `Content-Type` header value
pub fn content_type(mime: &str, charset: &str) -> String {
    if wants_charset(mime) && !charset.is_empty() && !mime.contains(';') {
        format!("{}; charset={}", mime, charset)
    } else {
        mime.to_string()
    }
}

/// Whether `mime` is listed; entries ending in `/` match a whole top-level type
pub fn is_compressible(mime: &str, compressible: &[String]) -> bool {
    let essence = mime.split(';').next().unwrap_or(mime).trim();
    compressible.iter().any(|entry| {
        if entry.ends_with('/') {
            essence.starts_with(entry.as_str())
        } else {
            essence.eq_ignore_ascii_case(entry)
        }
    })
}
