//! Asset records and their variants

use crate::compress::Encoding;
use bytes::Bytes;
use http::{HeaderMap, HeaderValue};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Where the bytes of a variant live
#[derive(Debug, Clone)]
pub enum Storage {
    /// Held in memory
    Memory(Bytes),
    /// Read from disk on demand
    File(Arc<PathBuf>),
}

impl Storage {
    /// Disk-backed storage for `path`
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Storage::File(Arc::new(path.into()))
    }

    /// Backing file path, if any
    pub fn path(&self) -> Option<&Path> {
        match self {
            Storage::Memory(_) => None,
            Storage::File(path) => Some(path.as_path()),
        }
    }
}

/// One representation of an asset
#[derive(Debug, Clone)]
pub struct Variant {
    /// `None` for the identity variant
    pub encoding: Option<Encoding>,
    /// Length in bytes
    pub size: u64,
    /// Backing bytes
    pub storage: Storage,
    /// Produced ahead of any request rather than on the fly
    pub precompressed: bool,
}

impl Variant {
    /// The uncompressed variant
    pub fn identity(size: u64, storage: Storage) -> Self {
        Self {
            encoding: None,
            size,
            storage,
            precompressed: false,
        }
    }

    /// A compressed variant held in memory
    pub fn compressed(encoding: Encoding, content: Bytes) -> Self {
        Self {
            encoding: Some(encoding),
            size: content.len() as u64,
            storage: Storage::Memory(content),
            precompressed: true,
        }
    }

    /// A compressed sibling file that already exists on disk
    pub fn sibling(encoding: Encoding, size: u64, path: PathBuf) -> Self {
        Self {
            encoding: Some(encoding),
            size,
            storage: Storage::file(path),
            precompressed: true,
        }
    }

    pub fn is_identity(&self) -> bool {
        self.encoding.is_none()
    }

    /// Content-coding token (`identity` for the identity variant)
    pub fn encoding_name(&self) -> &'static str {
        self.encoding.map(|e| e.name()).unwrap_or("identity")
    }
}

/// Cache policy, decided once at build time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetKind {
    /// The key embeds a content hash; cache forever
    Immutable,
    /// Revalidate after the configured max-age
    Standard,
}

impl AssetKind {
    pub fn is_immutable(self) -> bool {
        self == AssetKind::Immutable
    }
}

/// Everything known about one servable file
///
/// Records are built once and never changed after they are published.
#[derive(Debug, Clone)]
pub struct AssetRecord {
    key: String,
    variants: Vec<Variant>,
    etag: HeaderValue,
    last_modified: Option<SystemTime>,
    last_modified_header: Option<HeaderValue>,
    mime_type: String,
    content_type: HeaderValue,
    kind: AssetKind,
    aliases: Vec<String>,
    source: PathBuf,
    headers: HeaderMap,
}

/// Descriptive fields needed to build a record
#[derive(Debug, Clone)]
pub struct RecordMeta {
    pub key: String,
    pub source: PathBuf,
    pub etag: String,
    pub modified: Option<SystemTime>,
    pub mime_type: String,
    pub content_type: String,
    pub kind: AssetKind,
    pub aliases: Vec<String>,
}

impl AssetRecord {
    /// Assemble a record from its identity variant and compressed variants
    ///
    /// Non-identity variants are ordered brotli, gzip, zstd; duplicate
    /// encodings keep the first one given.
    pub fn new(meta: RecordMeta, identity: Variant, compressed: Vec<Variant>) -> Self {
        let mut variants = Vec::with_capacity(compressed.len() + 1);
        variants.push(Variant {
            encoding: None,
            ..identity
        });
        let mut compressed: Vec<Variant> = compressed
            .into_iter()
            .filter(|v| !v.is_identity())
            .collect();
        compressed.sort_by_key(|v| v.encoding);
        compressed.dedup_by_key(|v| v.encoding);
        variants.extend(compressed);

        let last_modified = meta.modified.and_then(truncate_to_seconds);
        let last_modified_header = last_modified
            .and_then(|t| HeaderValue::from_str(&httpdate::fmt_http_date(t)).ok());
        let content_type = HeaderValue::from_str(&meta.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
        let etag = HeaderValue::from_str(&meta.etag)
            .unwrap_or_else(|_| HeaderValue::from_static("\"0\""));

        Self {
            key: meta.key,
            variants,
            etag,
            last_modified,
            last_modified_header,
            mime_type: meta.mime_type,
            content_type,
            kind: meta.kind,
            aliases: meta.aliases,
            source: meta.source,
            headers: HeaderMap::new(),
        }
    }

    /// Attach extra response headers
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// All variants, identity first
    pub fn variants(&self) -> &[Variant] {
        &self.variants
    }

    pub fn identity(&self) -> &Variant {
        &self.variants[0]
    }

    /// Variant for a given encoding
    pub fn variant(&self, encoding: Option<Encoding>) -> Option<&Variant> {
        self.variants.iter().find(|v| v.encoding == encoding)
    }

    pub fn has_alternatives(&self) -> bool {
        self.variants.len() > 1
    }

    /// Quoted strong validator
    pub fn etag(&self) -> &HeaderValue {
        &self.etag
    }

    pub fn etag_str(&self) -> &str {
        self.etag.to_str().unwrap_or("")
    }

    /// Modification time, truncated to whole seconds
    pub fn last_modified(&self) -> Option<SystemTime> {
        self.last_modified
    }

    pub fn last_modified_header(&self) -> Option<&HeaderValue> {
        self.last_modified_header.as_ref()
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    /// Content-Type header value, charset included
    pub fn content_type(&self) -> &HeaderValue {
        &self.content_type
    }

    pub fn kind(&self) -> AssetKind {
        self.kind
    }

    pub fn is_immutable(&self) -> bool {
        self.kind.is_immutable()
    }

    /// Secondary keys resolving to this record
    pub fn aliases(&self) -> &[String] {
        &self.aliases
    }

    /// File the record was built from
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Extra response headers; they override the computed ones
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}

/// Strong validator for some content: the first 128 bits of its BLAKE3 hash
pub fn etag_for(content: &[u8]) -> String {
    let hash = blake3::hash(content);
    format!("\"{}\"", hex::encode(&hash.as_bytes()[..16]))
}

/// Strong validator from a hash supplied by a manifest
pub fn etag_from_hash(hash: &str) -> String {
    format!("\"{}\"", hash.trim_matches('"'))
}

/// Drop sub-second precision; a zero timestamp is treated as unknown
pub fn truncate_to_seconds(time: SystemTime) -> Option<SystemTime> {
    let secs = time.duration_since(UNIX_EPOCH).ok()?.as_secs();
    if secs == 0 {
        return None;
    }
    Some(UNIX_EPOCH + Duration::from_secs(secs))
}
