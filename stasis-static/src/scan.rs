//! Directory scanning
//!
//! Walks each configured root once and produces provisional assets: the
//! key, the file, and the metadata known from `stat`. Reading, hashing
//! and compressing happen later on the worker pool.

use crate::compress::Encoding;
use crate::index::Redirect;
use crate::mime;
use crate::options::ScanOptions;
use crate::path::join_key;
use crate::record::AssetKind;
use http::HeaderMap;
use stasis_core::Error;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::{DirEntry, WalkDir};

/// How a provisional asset gets its variants
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetSource {
    /// Found by scanning; variants are compressed in process
    Scanned,
    /// Declared by a manifest; variants are sibling files on disk
    Manifest { hash: Option<String> },
}

/// A file known to exist, not yet read
#[derive(Debug, Clone)]
pub struct ProvisionalAsset {
    pub key: String,
    pub path: PathBuf,
    pub size: u64,
    pub modified: Option<SystemTime>,
    pub mime_type: String,
    pub content_type: String,
    pub kind: AssetKind,
    pub aliases: Vec<String>,
    pub source: AssetSource,
    /// Extra response headers from the header rules
    pub headers: HeaderMap,
}

impl ProvisionalAsset {
    /// Describe the file at `path`, served under `key`
    pub fn new(
        key: String,
        path: PathBuf,
        metadata: &std::fs::Metadata,
        options: &ScanOptions,
    ) -> Self {
        let mime_type = mime::guess_mime_type(&path, &options.mimetypes);
        let content_type = mime::content_type(&mime_type, &options.charset);
        Self {
            kind: options.kind_for(&key),
            headers: options.headers.headers_for(&path, &key),
            key,
            path,
            size: metadata.len(),
            modified: metadata.modified().ok(),
            mime_type,
            content_type,
            aliases: Vec::new(),
            source: AssetSource::Scanned,
        }
    }
}

/// Everything one root produced
#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub assets: Vec<ProvisionalAsset>,
    pub redirects: Vec<(String, Redirect)>,
    pub errors: Vec<Error>,
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .map(|name| name.starts_with('.'))
            .unwrap_or(false)
}

/// Forward-slash relative path, or `None` for names that are not UTF-8
fn relative_url(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in relative.components() {
        parts.push(component.as_os_str().to_str()?);
    }
    Some(parts.join("/"))
}

/// Walk `root` and describe every servable file under it
///
/// Symlinks are followed only when they point at a regular file inside
/// the root. Unreadable entries are reported and skipped.
pub fn scan_root(root: &Path, prefix: &str, options: &ScanOptions) -> ScanOutcome {
    let mut outcome = ScanOutcome::default();

    let root = match root.canonicalize() {
        Ok(root) if root.is_dir() => root,
        Ok(root) => {
            tracing::warn!("⚠️ Not a directory: {}", root.display());
            outcome.errors.push(Error::scan_io(
                root,
                std::io::Error::other("not a directory"),
            ));
            return outcome;
        }
        Err(e) => {
            tracing::warn!("⚠️ No directory at {}: {}", root.display(), e);
            outcome.errors.push(Error::scan_io(root, e));
            return outcome;
        }
    };

    let include_hidden = options.include_hidden;
    let walker = WalkDir::new(&root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| include_hidden || !is_hidden(entry));

    let mut found: Vec<(String, PathBuf, std::fs::Metadata)> = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.clone());
                tracing::warn!("⚠️ Skipping {}: {}", path.display(), e);
                outcome.errors.push(Error::scan_io(path, e.into()));
                continue;
            }
        };

        let file_type = entry.file_type();
        if file_type.is_dir() {
            continue;
        }

        let metadata = if file_type.is_symlink() {
            match resolve_symlink(&root, entry.path()) {
                Some(metadata) => metadata,
                None => continue,
            }
        } else if file_type.is_file() {
            match entry.metadata() {
                Ok(metadata) => metadata,
                Err(e) => {
                    tracing::warn!("⚠️ Skipping {}: {}", entry.path().display(), e);
                    outcome.errors.push(Error::scan_io(entry.path(), e.into()));
                    continue;
                }
            }
        } else {
            continue;
        };

        if options.is_excluded(&entry.file_name().to_string_lossy()) {
            continue;
        }
        let Some(relative) = relative_url(&root, entry.path()) else {
            tracing::warn!("⚠️ Skipping non UTF-8 path {}", entry.path().display());
            continue;
        };
        found.push((relative, entry.into_path(), metadata));
    }

    let names: HashSet<&str> = found.iter().map(|(rel, _, _)| rel.as_str()).collect();
    let siblings: HashSet<String> = found
        .iter()
        .filter(|(rel, path, _)| {
            Encoding::for_sibling(path).is_some()
                && rel
                    .rsplit_once('.')
                    .map(|(stem, _)| names.contains(stem))
                    .unwrap_or(false)
        })
        .map(|(rel, _, _)| rel.clone())
        .collect();

    for (relative, path, metadata) in found {
        if siblings.contains(&relative) {
            continue;
        }
        let key = join_key(prefix, &relative);
        let key = match &options.index_file {
            Some(index) => index_key(&key, index, &mut outcome.redirects),
            None => key,
        };
        outcome
            .assets
            .push(ProvisionalAsset::new(key, path, &metadata, options));
    }

    tracing::debug!(
        "📁 Scanned {}: {} files, {} redirects",
        root.display(),
        outcome.assets.len(),
        outcome.redirects.len()
    );
    outcome
}

/// Metadata of a symlink target that is a regular file inside `root`
fn resolve_symlink(root: &Path, link: &Path) -> Option<std::fs::Metadata> {
    let target = match link.canonicalize() {
        Ok(target) => target,
        Err(e) => {
            tracing::debug!("Ignoring dangling symlink {}: {}", link.display(), e);
            return None;
        }
    };
    if !target.starts_with(root) {
        tracing::warn!(
            "⚠️ Ignoring symlink {} pointing outside the root",
            link.display()
        );
        return None;
    }
    match std::fs::metadata(&target) {
        Ok(metadata) if metadata.is_file() => Some(metadata),
        _ => None,
    }
}

/// Map `dir/index.html` to `dir/` and record the redirects that lead there
fn index_key(key: &str, index: &str, redirects: &mut Vec<(String, Redirect)>) -> String {
    let Some(dir) = key.strip_suffix(index).filter(|d| d.ends_with('/')) else {
        return key.to_string();
    };
    redirects.push((key.to_string(), Redirect::found("./")));

    let without_slash = dir.trim_end_matches('/');
    if !without_slash.is_empty() {
        let last = without_slash.rsplit('/').next().unwrap_or(without_slash);
        redirects.push((without_slash.to_string(), Redirect::found(format!("{}/", last))));
    }
    dir.to_string()
}
