//! On-demand resolution for development
//!
//! With autorefresh on, nothing is indexed up front. Every request key is
//! matched against the roots and the file is described from a fresh
//! `stat`, so edits show up on the next request. Compressed siblings that
//! already exist on disk are offered; nothing is compressed in process.

use crate::compress::{Encoding, is_effective, meta_for};
use crate::index::Redirect;
use crate::options::StaticOptions;
use crate::record::{AssetRecord, Storage, Variant};
use crate::scan::ProvisionalAsset;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// What a key resolves to on disk
#[derive(Debug)]
pub enum Found {
    Asset(Arc<AssetRecord>),
    Redirect(Redirect),
}

/// Resolve a normalized key against the roots; the first root holding it wins
pub fn find(key: &str, options: &StaticOptions) -> Option<Found> {
    if options.scan.index_file.is_none() && key.ends_with('/') {
        return None;
    }
    options.roots.iter().find_map(|root| {
        let relative = key.strip_prefix(root.prefix.as_str())?;
        let dir = root.path.canonicalize().ok()?;
        find_in_root(&dir, relative, key, options)
    })
}

fn find_in_root(
    root: &Path,
    relative: &str,
    key: &str,
    options: &StaticOptions,
) -> Option<Found> {
    if !options.scan.include_hidden && relative.split('/').any(|part| part.starts_with('.')) {
        return None;
    }
    let path = root.join(relative);
    if is_compressed_sibling(&path) {
        return None;
    }

    let Some(index) = options.scan.index_file.as_deref() else {
        return describe(root, &path, key, options).map(Found::Asset);
    };
    if key.ends_with('/') {
        return describe(root, &path.join(index), key, options).map(Found::Asset);
    }
    if key.strip_suffix(index).is_some_and(|dir| dir.ends_with('/')) {
        return is_servable(root, &path).then(|| Found::Redirect(Redirect::found("./")));
    }
    if let Some(record) = describe(root, &path, key, options) {
        return Some(Found::Asset(record));
    }
    if path.is_dir() && is_servable(root, &path.join(index)) {
        let last = key.rsplit('/').next().unwrap_or(key);
        return Some(Found::Redirect(Redirect::found(format!("{}/", last))));
    }
    None
}

/// `app.js.gz` next to an existing `app.js`
fn is_compressed_sibling(path: &Path) -> bool {
    Encoding::for_sibling(path).is_some() && path.with_extension("").is_file()
}

/// A regular file inside `root`, symlinks resolved
fn is_servable(root: &Path, path: &Path) -> bool {
    match path.canonicalize() {
        Ok(target) => target.starts_with(root) && target.is_file(),
        Err(_) => false,
    }
}

/// Build a record for the file at `path` from its metadata alone
fn describe(
    root: &Path,
    path: &Path,
    key: &str,
    options: &StaticOptions,
) -> Option<Arc<AssetRecord>> {
    let target = path.canonicalize().ok()?;
    if !target.starts_with(root) {
        tracing::warn!("⚠️ Ignoring {} pointing outside the root", path.display());
        return None;
    }
    let metadata = std::fs::metadata(&target).ok().filter(|m| m.is_file())?;
    let name = path.file_name()?.to_string_lossy();
    if options.scan.is_excluded(&name) {
        return None;
    }

    let asset =
        ProvisionalAsset::new(key.to_string(), path.to_path_buf(), &metadata, &options.scan);
    let mut variants = Vec::new();
    for &encoding in &options.compression.encodings {
        let sibling = encoding.sibling_of(path);
        let size = match std::fs::metadata(&sibling) {
            Ok(m) if m.is_file() => m.len(),
            _ => continue,
        };
        if is_effective(size, asset.size, options.compression.min_ratio) {
            variants.push(Variant::sibling(encoding, size, sibling));
        }
    }

    let etag = stat_etag(asset.modified, asset.size);
    let identity = Variant::identity(asset.size, Storage::file(target));
    let record = AssetRecord::new(meta_for(&asset, etag), identity, variants);
    Some(Arc::new(record.with_headers(asset.headers)))
}

/// Validator from modification time and size, both in hex
fn stat_etag(modified: Option<SystemTime>, size: u64) -> String {
    let mtime = modified
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("\"{:x}-{:x}\"", mtime, size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;

    fn options(root: &Path) -> StaticOptions {
        StaticOptions {
            autorefresh: true,
            ..StaticOptions::for_root(root)
        }
    }

    fn asset(found: Option<Found>) -> Arc<AssetRecord> {
        match found {
            Some(Found::Asset(record)) => record,
            other => panic!("expected an asset, got {:?}", other),
        }
    }

    fn location(found: Option<Found>) -> String {
        match found {
            Some(Found::Redirect(redirect)) => redirect.location,
            other => panic!("expected a redirect, got {:?}", other),
        }
    }

    #[test]
    fn test_stat_etag() {
        let modified = UNIX_EPOCH + Duration::from_secs(1_498_579_535);
        assert_eq!(stat_etag(Some(modified), 10), "\"5952824f-a\"");
        assert_eq!(stat_etag(None, 255), "\"0-ff\"");
    }

    #[test]
    fn test_sees_changes_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let options = options(dir.path());
        assert!(find("/app.js", &options).is_none());

        fs::write(dir.path().join("app.js"), "one").unwrap();
        let first = asset(find("/app.js", &options));
        assert_eq!(first.identity().size, 3);
        assert_eq!(first.content_type(), "text/javascript; charset=utf-8");

        fs::write(dir.path().join("app.js"), "two!").unwrap();
        let second = asset(find("/app.js", &options));
        assert_eq!(second.identity().size, 4);
        assert_ne!(first.etag_str(), second.etag_str());
    }

    #[test]
    fn test_offers_existing_siblings() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("app.js"), "x".repeat(400)).unwrap();
        fs::write(dir.path().join("app.js.gz"), "g".repeat(40)).unwrap();
        fs::write(dir.path().join("app.js.br"), "b".repeat(400)).unwrap();
        let options = options(dir.path());

        let record = asset(find("/app.js", &options));
        let encodings: Vec<_> = record.variants().iter().map(|v| v.encoding_name()).collect();
        assert_eq!(encodings, vec!["identity", "gzip"]);
        assert!(find("/app.js.gz", &options).is_none());
    }

    #[test]
    fn test_index_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("docs")).unwrap();
        fs::write(dir.path().join("docs/index.html"), "<h1>docs</h1>").unwrap();
        let mut options = options(dir.path());
        assert!(find("/docs/", &options).is_none());

        options.scan.index_file = Some("index.html".to_string());
        assert_eq!(asset(find("/docs/", &options)).identity().size, 13);
        assert_eq!(location(find("/docs/index.html", &options)), "./");
        assert_eq!(location(find("/docs", &options)), "docs/");
        assert!(find("/", &options).is_none());
        assert!(find("/missing/", &options).is_none());
    }

    #[test]
    fn test_filters_and_prefixes() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(".env"), "SECRET=1").unwrap();
        fs::write(dir.path().join("notes.bak"), "x").unwrap();
        fs::write(dir.path().join("app.css"), "body{}").unwrap();

        let mut options = StaticOptions {
            autorefresh: true,
            ..StaticOptions::default().with_root(dir.path(), "/static/")
        };
        options.scan.include_hidden = false;
        options.scan.exclude = vec![".bak".to_string()];

        assert!(find("/static/app.css", &options).is_some());
        assert!(find("/app.css", &options).is_none());
        assert!(find("/static/.env", &options).is_none());
        assert!(find("/static/notes.bak", &options).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_confined_to_root() {
        use std::os::unix::fs::symlink;

        let outside = tempfile::tempdir().unwrap();
        fs::write(outside.path().join("secret.txt"), "secret").unwrap();
        let dir = tempfile::tempdir().unwrap();
        symlink(outside.path().join("secret.txt"), dir.path().join("leak.txt")).unwrap();

        assert!(find("/leak.txt", &options(dir.path())).is_none());
    }
}
