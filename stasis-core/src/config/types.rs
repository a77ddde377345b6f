//! Configuration type definitions
//!
//! These types represent the on-disk configuration for Stasis. They are
//! plain data: the static crate turns them into validated build and
//! serve options.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Ten years, the value nginx uses for `expires max`
pub const FOREVER: u64 = 10 * 365 * 24 * 60 * 60;

/// Root configuration for Stasis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StasisConfig {
    /// Address the bundled HTTP server listens on
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Directories to scan
    #[serde(default)]
    pub roots: Vec<RootConfig>,

    /// Externally supplied manifest (replaces directory scanning)
    #[serde(default)]
    pub manifest: Option<ManifestConfig>,

    /// Build-time compression
    #[serde(default)]
    pub compression: CompressionConfig,

    /// Cache-Control policy
    #[serde(default)]
    pub cache: CacheConfig,

    /// Request handling
    #[serde(default)]
    pub serve: ServeConfig,

    /// Global logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for StasisConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            roots: Vec::new(),
            manifest: None,
            compression: CompressionConfig::default(),
            cache: CacheConfig::default(),
            serve: ServeConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_prefix() -> String {
    "/".to_string()
}

fn default_bool_true() -> bool {
    true
}

/// A directory served under a URL prefix
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootConfig {
    /// Directory on disk
    pub path: PathBuf,

    /// URL prefix the directory is mounted at
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

/// Manifest-driven build
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestConfig {
    /// Path to the JSON manifest
    pub path: PathBuf,

    /// Directory holding the hashed files (defaults to the manifest's directory)
    #[serde(default)]
    pub root: Option<PathBuf>,

    /// URL prefix
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

/// Compression level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompressionLevel {
    /// Fast compression
    Fast,
    /// Default compression
    #[default]
    Default,
    /// Best compression (slower)
    Best,
}

/// Build-time compression configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    /// Encodings to attempt, in priority order (`br`, `gzip`, `zstd`)
    #[serde(default = "default_encodings")]
    pub encodings: Vec<String>,

    /// Files smaller than this are never compressed
    #[serde(default = "default_min_size")]
    pub min_size: u64,

    /// Minimum fraction a variant must save to be kept
    #[serde(default = "default_min_ratio")]
    pub min_ratio: f64,

    /// MIME types worth compressing; entries ending in `/` match a whole top-level type
    #[serde(default = "default_compressible_types")]
    pub compressible_types: Vec<String>,

    /// Worker pool size (defaults to available parallelism)
    #[serde(default)]
    pub workers: Option<usize>,

    /// Compression level
    #[serde(default)]
    pub level: CompressionLevel,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            encodings: default_encodings(),
            min_size: default_min_size(),
            min_ratio: default_min_ratio(),
            compressible_types: default_compressible_types(),
            workers: None,
            level: CompressionLevel::default(),
        }
    }
}

fn default_encodings() -> Vec<String> {
    vec!["br".to_string(), "gzip".to_string()]
}

fn default_min_size() -> u64 {
    200
}

fn default_min_ratio() -> f64 {
    0.05
}

fn default_compressible_types() -> Vec<String> {
    [
        "text/",
        "application/javascript",
        "application/json",
        "application/manifest+json",
        "application/ld+json",
        "application/xml",
        "application/xhtml+xml",
        "application/rss+xml",
        "application/atom+xml",
        "application/wasm",
        "application/x-font-ttf",
        "application/vnd.ms-fontobject",
        "font/ttf",
        "font/otf",
        "image/svg+xml",
        "image/x-icon",
        "image/vnd.microsoft.icon",
        "image/bmp",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Cache-Control configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// max-age for non-immutable assets (None omits Cache-Control)
    #[serde(default = "default_max_age")]
    pub max_age: Option<u64>,

    /// max-age for immutable assets
    #[serde(default = "default_immutable_max_age")]
    pub immutable_max_age: u64,

    /// Regex over the lookup key marking cache-busted names
    #[serde(default = "default_immutable_pattern")]
    pub immutable_pattern: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_age: default_max_age(),
            immutable_max_age: default_immutable_max_age(),
            immutable_pattern: default_immutable_pattern(),
        }
    }
}

fn default_max_age() -> Option<u64> {
    Some(60)
}

fn default_immutable_max_age() -> u64 {
    FOREVER
}

fn default_immutable_pattern() -> Option<String> {
    Some(r"\.[0-9a-fA-F]{8,64}\.[A-Za-z0-9]+$".to_string())
}

/// What to do when a request carries several byte ranges
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MultiRangePolicy {
    /// Ignore the ranges and send the whole body with 200
    #[default]
    Full,
    /// Send a `multipart/byteranges` 206 response
    Multipart,
}

/// Request handling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServeConfig {
    /// Serve `dir/<index_file>` at `dir/`
    #[serde(default)]
    pub index_file: Option<String>,

    /// Send `Access-Control-Allow-Origin: *`
    #[serde(default = "default_bool_true")]
    pub allow_all_origins: bool,

    /// Charset appended to textual Content-Types
    #[serde(default = "default_charset")]
    pub charset: String,

    /// Extra extension -> MIME type mappings (without the dot)
    #[serde(default)]
    pub mimetypes: HashMap<String, String>,

    /// Append the request's query string to redirect locations
    #[serde(default = "default_bool_true")]
    pub preserve_query_string: bool,

    /// Redirect manifest aliases to the hashed key instead of serving them
    #[serde(default)]
    pub redirect_aliases: bool,

    /// Policy for multi-range requests
    #[serde(default)]
    pub multi_range: MultiRangePolicy,

    /// Answer non GET/HEAD methods with 405 (otherwise pass through)
    #[serde(default = "default_bool_true")]
    pub reject_other_methods: bool,

    /// Include dot files when scanning
    #[serde(default = "default_bool_true")]
    pub include_hidden: bool,

    /// File name suffixes to leave out of the index
    #[serde(default)]
    pub exclude: Vec<String>,

    /// Identity bodies larger than this stay on disk
    #[serde(default = "default_memory_limit")]
    pub memory_limit: u64,

    /// Extra response headers for matching keys
    #[serde(default)]
    pub headers: Vec<HeaderRuleConfig>,

    /// Resolve files on every request instead of indexing them up front.
    /// Development only: nothing is compressed and every request stats the disk.
    #[serde(default)]
    pub autorefresh: bool,
}

/// Headers added to every asset whose lookup key matches `pattern`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderRuleConfig {
    /// Regex over the lookup key
    pub pattern: String,

    /// Header name -> value
    pub headers: HashMap<String, String>,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            index_file: None,
            allow_all_origins: true,
            charset: default_charset(),
            mimetypes: HashMap::new(),
            preserve_query_string: true,
            redirect_aliases: false,
            multi_range: MultiRangePolicy::default(),
            reject_other_methods: true,
            include_hidden: true,
            exclude: Vec::new(),
            memory_limit: default_memory_limit(),
            headers: Vec::new(),
            autorefresh: false,
        }
    }
}

fn default_charset() -> String {
    "utf-8".to_string()
}

fn default_memory_limit() -> u64 {
    8 * 1024 * 1024
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
