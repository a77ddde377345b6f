//! Manifest-driven builds
//!
//! A manifest maps logical names to content-hashed file names produced by
//! an asset pipeline. Nothing is traversed: only the listed files are
//! served, every one of them is immutable, and the logical names become
//! aliases of the hashed keys.

use crate::options::ScanOptions;
use crate::path::{join_key, normalize};
use crate::record::AssetKind;
use crate::scan::{AssetSource, ProvisionalAsset};
use serde::Deserialize;
use stasis_core::{Error, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// A loaded manifest
#[derive(Debug, Clone)]
pub struct Manifest {
    /// Directory the hashed files live in
    pub root: PathBuf,
    /// URL prefix for every key
    pub prefix: String,
    pub entries: Vec<ManifestEntry>,
}

/// One logical name and the hashed file it points at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Logical (unhashed) name, relative to the prefix
    pub name: String,
    /// Hashed file name, relative to the root
    pub file: String,
    /// Content hash, when the manifest records one
    pub hash: Option<String>,
}

/// Accepted on-disk layouts
#[derive(Deserialize)]
#[serde(untagged)]
enum ManifestFile {
    /// `{"paths": {...}, "hashes": {...}}` as written by Django's
    /// `ManifestStaticFilesStorage`; extra keys such as `version` are ignored
    Staticfiles {
        paths: BTreeMap<String, String>,
        #[serde(default)]
        hashes: BTreeMap<String, String>,
    },
    /// `{"app.js": "app.abc123.js"}`
    Flat(BTreeMap<String, String>),
}

impl Manifest {
    /// Read a manifest file
    pub fn load(path: &Path, root: impl Into<PathBuf>, prefix: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Manifest(format!("Failed to read {}: {}", path.display(), e)))?;
        let manifest = Self::from_json(&content, root, prefix)?;
        tracing::debug!(
            "📜 Loaded manifest {} with {} entries",
            path.display(),
            manifest.entries.len()
        );
        Ok(manifest)
    }

    /// Parse manifest JSON
    pub fn from_json(json: &str, root: impl Into<PathBuf>, prefix: &str) -> Result<Self> {
        let parsed: ManifestFile = serde_json::from_str(json)
            .map_err(|e| Error::Manifest(format!("Invalid manifest: {}", e)))?;
        let (paths, hashes) = match parsed {
            ManifestFile::Staticfiles { paths, hashes } => (paths, hashes),
            ManifestFile::Flat(paths) => (paths, BTreeMap::new()),
        };

        let entries = paths
            .into_iter()
            .map(|(name, file)| ManifestEntry {
                hash: hashes.get(&name).cloned(),
                name,
                file,
            })
            .collect();

        Ok(Self {
            root: root.into(),
            prefix: crate::path::normalize_prefix(prefix),
            entries,
        })
    }
}

/// Relative form of a manifest name, rejecting anything that escapes the root
///
/// Names are file names, not URLs, so nothing is percent-decoded.
fn relative(name: &str) -> Result<String> {
    let resolved = normalize(name)
        .map_err(|_| Error::Manifest(format!("Invalid manifest path: {}", name)))?;
    let relative = resolved.trim_start_matches('/');
    if relative.is_empty() || relative.ends_with('/') {
        return Err(Error::Manifest(format!("Invalid manifest path: {}", name)));
    }
    Ok(relative.to_string())
}

/// Turn manifest entries into provisional assets
///
/// Entries sharing a hashed file become one asset with several aliases.
/// Missing files and invalid names are reported and skipped.
pub fn manifest_assets(
    manifest: &Manifest,
    options: &ScanOptions,
) -> (Vec<ProvisionalAsset>, Vec<Error>) {
    let mut errors = Vec::new();
    let mut by_file: BTreeMap<String, Vec<&ManifestEntry>> = BTreeMap::new();
    for entry in &manifest.entries {
        match relative(&entry.file) {
            Ok(file) => by_file.entry(file).or_default().push(entry),
            Err(e) => {
                tracing::warn!("⚠️ Skipping manifest entry {}: {}", entry.name, e);
                errors.push(e);
            }
        }
    }

    let mut assets = Vec::with_capacity(by_file.len());
    for (file, entries) in by_file {
        let path = manifest.root.join(&file);
        let metadata = match std::fs::metadata(&path) {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => {
                errors.push(Error::scan_io(
                    &path,
                    std::io::Error::other("not a regular file"),
                ));
                continue;
            }
            Err(e) => {
                tracing::warn!("⚠️ Manifest file missing {}: {}", path.display(), e);
                errors.push(Error::scan_io(&path, e));
                continue;
            }
        };

        let key = join_key(&manifest.prefix, &file);
        let mut aliases = Vec::new();
        for entry in &entries {
            match relative(&entry.name) {
                Ok(name) => {
                    let alias = join_key(&manifest.prefix, &name);
                    if alias != key && !aliases.contains(&alias) {
                        aliases.push(alias);
                    }
                }
                Err(e) => errors.push(e),
            }
        }
        let hash = entries.iter().find_map(|e| e.hash.clone());

        let mut asset = ProvisionalAsset::new(key, path, &metadata, options);
        asset.kind = AssetKind::Immutable;
        asset.aliases = aliases;
        asset.source = AssetSource::Manifest { hash };
        assets.push(asset);
    }
    (assets, errors)
}
