//! Validated runtime options
//!
//! Built from [`StasisConfig`]; every string in the configuration that
//! needs parsing (encodings, regexes, header values) is parsed here once.

use crate::compress::{self, Encoding};
use crate::mime;
use crate::path::normalize_prefix;
use crate::record::AssetKind;
use async_compression::Level;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use regex::Regex;
use stasis_core::config::{
    CacheConfig, CompressionConfig, CompressionLevel, FOREVER, HeaderRuleConfig,
    MultiRangePolicy, ServeConfig, StasisConfig,
};
use stasis_core::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Everything needed to build and serve one set of assets
#[derive(Debug, Clone, Default)]
pub struct StaticOptions {
    /// Directories to scan, with their URL prefixes
    pub roots: Vec<RootSource>,
    /// Manifest to load instead of (or alongside) scanning
    pub manifest: Option<ManifestSource>,
    pub scan: ScanOptions,
    pub compression: CompressionOptions,
    pub serve: ServeOptions,
    /// Resolve every request against the roots instead of a prebuilt index
    pub autorefresh: bool,
}

/// A directory mounted at a URL prefix
#[derive(Debug, Clone)]
pub struct RootSource {
    pub path: PathBuf,
    pub prefix: String,
}

impl RootSource {
    pub fn new(path: impl Into<PathBuf>, prefix: &str) -> Self {
        Self {
            path: path.into(),
            prefix: normalize_prefix(prefix),
        }
    }
}

/// A JSON manifest and the directory its files live in
#[derive(Debug, Clone)]
pub struct ManifestSource {
    pub path: PathBuf,
    pub root: PathBuf,
    pub prefix: String,
}

impl StaticOptions {
    /// Options serving a single directory at `/`
    pub fn for_root(path: impl Into<PathBuf>) -> Self {
        Self {
            roots: vec![RootSource::new(path, "/")],
            ..Default::default()
        }
    }

    /// Mount another directory
    pub fn with_root(mut self, path: impl Into<PathBuf>, prefix: &str) -> Self {
        self.roots.push(RootSource::new(path, prefix));
        self
    }

    /// Validate a configuration into runtime options
    pub fn from_config(config: &StasisConfig) -> Result<Self> {
        let roots = config
            .roots
            .iter()
            .map(|r| RootSource::new(r.path.clone(), &r.prefix))
            .collect();
        let manifest = config.manifest.as_ref().map(|m| ManifestSource {
            root: m.root.clone().unwrap_or_else(|| {
                m.path
                    .parent()
                    .map(|p| p.to_path_buf())
                    .unwrap_or_else(|| PathBuf::from("."))
            }),
            path: m.path.clone(),
            prefix: normalize_prefix(&m.prefix),
        });

        Ok(Self {
            roots,
            manifest,
            scan: ScanOptions::from_config(config)?,
            compression: CompressionOptions::from_config(&config.compression, &config.serve)?,
            serve: ServeOptions::from_config(&config.cache, &config.serve)?,
            autorefresh: config.serve.autorefresh,
        })
    }
}

/// How directories are walked and files classified
#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub include_hidden: bool,
    /// File name suffixes to skip
    pub exclude: Vec<String>,
    /// Extra extension -> MIME type mappings
    pub mimetypes: HashMap<String, String>,
    pub charset: String,
    /// Keys matching this are immutable
    pub immutable: Option<Regex>,
    /// Serve `dir/<index_file>` at `dir/`
    pub index_file: Option<String>,
    /// Extra response headers, decided per file
    pub headers: HeaderRules,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            include_hidden: true,
            exclude: Vec::new(),
            mimetypes: HashMap::new(),
            charset: "utf-8".to_string(),
            immutable: CacheConfig::default()
                .immutable_pattern
                .and_then(|pattern| Regex::new(&pattern).ok()),
            index_file: None,
            headers: HeaderRules::default(),
        }
    }
}

impl ScanOptions {
    fn from_config(config: &StasisConfig) -> Result<Self> {
        let immutable = match &config.cache.immutable_pattern {
            Some(pattern) => Some(Regex::new(pattern).map_err(|e| {
                Error::Config(format!("Invalid immutable_pattern '{}': {}", pattern, e))
            })?),
            None => None,
        };
        let index_file = match &config.serve.index_file {
            Some(name) if name.is_empty() || name.contains('/') => {
                return Err(Error::Config(format!("Invalid index_file '{}'", name)));
            }
            other => other.clone(),
        };
        Ok(Self {
            include_hidden: config.serve.include_hidden,
            exclude: config.serve.exclude.clone(),
            mimetypes: lowercase_keys(&config.serve.mimetypes),
            charset: config.serve.charset.clone(),
            immutable,
            index_file,
            headers: HeaderRules::from_config(&config.serve.headers)?,
        })
    }

    /// Classify a lookup key
    pub fn kind_for(&self, key: &str) -> AssetKind {
        match &self.immutable {
            Some(re) if re.is_match(key) => AssetKind::Immutable,
            _ => AssetKind::Standard,
        }
    }

    /// Whether a file name is filtered out by `exclude`
    pub fn is_excluded(&self, name: &str) -> bool {
        self.exclude.iter().any(|suffix| name.ends_with(suffix.as_str()))
    }
}

/// Callback adding headers for one file: `(headers, path, key)`
pub type AddHeadersFn = dyn Fn(&mut HeaderMap, &Path, &str) + Send + Sync;

/// Headers the body framing depends on; never taken from rules or hooks
const FRAMING_HEADERS: [HeaderName; 4] = [
    header::CONTENT_LENGTH,
    header::CONTENT_ENCODING,
    header::CONTENT_RANGE,
    header::TRANSFER_ENCODING,
];

/// Extra response headers attached to records when they are built
///
/// Pattern rules apply in order, later rules overriding earlier ones; the
/// hook runs last and sees what the rules produced.
#[derive(Clone, Default)]
pub struct HeaderRules {
    rules: Vec<(Regex, HeaderMap)>,
    hook: Option<Arc<AddHeadersFn>>,
}

impl fmt::Debug for HeaderRules {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeaderRules")
            .field("rules", &self.rules)
            .field("hook", &self.hook.is_some())
            .finish()
    }
}

impl HeaderRules {
    fn from_config(configs: &[HeaderRuleConfig]) -> Result<Self> {
        let mut rules = Self::default();
        for config in configs {
            let pattern = Regex::new(&config.pattern).map_err(|e| {
                Error::Config(format!("Invalid header pattern '{}': {}", config.pattern, e))
            })?;
            let mut headers = HeaderMap::new();
            for (name, value) in &config.headers {
                let name = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|e| Error::Config(format!("Invalid header name '{}': {}", name, e)))?;
                if FRAMING_HEADERS.contains(&name) {
                    return Err(Error::Config(format!("{} cannot be set by a header rule", name)));
                }
                let value = HeaderValue::from_str(value).map_err(|e| {
                    Error::Config(format!("Invalid value for header {}: {}", name, e))
                })?;
                headers.insert(name, value);
            }
            rules.rules.push((pattern, headers));
        }
        Ok(rules)
    }

    /// Add `headers` to every key matching `pattern`
    pub fn with_rule(mut self, pattern: Regex, headers: HeaderMap) -> Self {
        self.rules.push((pattern, headers));
        self
    }

    /// Run `hook` for every file after the rules
    pub fn with_hook(
        mut self,
        hook: impl Fn(&mut HeaderMap, &Path, &str) + Send + Sync + 'static,
    ) -> Self {
        self.hook = Some(Arc::new(hook));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty() && self.hook.is_none()
    }

    /// Extra headers for the file at `path` served under `key`
    pub fn headers_for(&self, path: &Path, key: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if self.is_empty() {
            return headers;
        }
        for (pattern, extra) in &self.rules {
            if pattern.is_match(key) {
                for (name, value) in extra {
                    headers.insert(name.clone(), value.clone());
                }
            }
        }
        if let Some(hook) = &self.hook {
            hook(&mut headers, path, key);
        }
        for name in &FRAMING_HEADERS {
            if headers.remove(name).is_some() {
                tracing::warn!("⚠️ Ignoring {} header added for {}", name, key);
            }
        }
        headers
    }
}

fn lowercase_keys(map: &HashMap<String, String>) -> HashMap<String, String> {
    map.iter()
        .map(|(k, v)| (k.trim_start_matches('.').to_ascii_lowercase(), v.clone()))
        .collect()
}

/// Build-time compression settings
#[derive(Debug, Clone)]
pub struct CompressionOptions {
    /// Encodings to produce, in priority order
    pub encodings: Vec<Encoding>,
    pub min_size: u64,
    pub min_ratio: f64,
    pub compressible_types: Vec<String>,
    /// Bounded pool size
    pub workers: usize,
    pub level: Level,
    /// Identity bodies above this size are served from disk
    pub memory_limit: u64,
    /// Extra extension -> MIME type mappings
    pub mimetypes: HashMap<String, String>,
}

impl Default for CompressionOptions {
    fn default() -> Self {
        let config = CompressionConfig::default();
        Self {
            encodings: vec![Encoding::Brotli, Encoding::Gzip],
            min_size: config.min_size,
            min_ratio: config.min_ratio,
            compressible_types: config.compressible_types,
            workers: compress::worker_count(None),
            level: compress::level(CompressionLevel::Default),
            memory_limit: ServeConfig::default().memory_limit,
            mimetypes: HashMap::new(),
        }
    }
}

impl CompressionOptions {
    fn from_config(config: &CompressionConfig, serve: &ServeConfig) -> Result<Self> {
        let mut encodings = Vec::with_capacity(config.encodings.len());
        for name in &config.encodings {
            let encoding = Encoding::from_name(name)
                .ok_or_else(|| Error::Config(format!("Unknown encoding: {}", name)))?;
            if !encodings.contains(&encoding) {
                encodings.push(encoding);
            }
        }
        if !(0.0..1.0).contains(&config.min_ratio) {
            return Err(Error::Config(format!(
                "min_ratio must be in [0, 1): {}",
                config.min_ratio
            )));
        }
        Ok(Self {
            encodings,
            min_size: config.min_size,
            min_ratio: config.min_ratio,
            compressible_types: config.compressible_types.clone(),
            workers: compress::worker_count(config.workers),
            level: compress::level(config.level),
            memory_limit: serve.memory_limit,
            mimetypes: lowercase_keys(&serve.mimetypes),
        })
    }

    /// Whether an asset of this type and size gets compressed variants
    pub fn should_compress(&self, mime_type: &str, size: u64) -> bool {
        !self.encodings.is_empty()
            && size >= self.min_size
            && mime::is_compressible(mime_type, &self.compressible_types)
    }
}

/// Per-request policy
#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub allow_all_origins: bool,
    pub preserve_query_string: bool,
    pub redirect_aliases: bool,
    pub multi_range: MultiRangePolicy,
    pub reject_other_methods: bool,
    pub(crate) cache_standard: Option<HeaderValue>,
    pub(crate) cache_immutable: HeaderValue,
    pub(crate) cache_redirect: Option<HeaderValue>,
}

impl Default for ServeOptions {
    fn default() -> Self {
        let cache = CacheConfig::default();
        Self {
            allow_all_origins: true,
            preserve_query_string: true,
            redirect_aliases: false,
            multi_range: MultiRangePolicy::Full,
            reject_other_methods: true,
            cache_standard: standard_cache_control(cache.max_age),
            cache_immutable: immutable_cache_control(FOREVER),
            cache_redirect: redirect_cache_control(cache.max_age),
        }
    }
}

impl ServeOptions {
    fn from_config(cache: &CacheConfig, serve: &ServeConfig) -> Result<Self> {
        Ok(Self {
            allow_all_origins: serve.allow_all_origins,
            preserve_query_string: serve.preserve_query_string,
            redirect_aliases: serve.redirect_aliases,
            multi_range: serve.multi_range,
            reject_other_methods: serve.reject_other_methods,
            cache_standard: standard_cache_control(cache.max_age),
            cache_immutable: immutable_cache_control(cache.immutable_max_age),
            cache_redirect: redirect_cache_control(cache.max_age),
        })
    }

    /// Override the max-age used for standard assets
    pub fn with_max_age(mut self, max_age: Option<u64>) -> Self {
        self.cache_standard = standard_cache_control(max_age);
        self.cache_redirect = redirect_cache_control(max_age);
        self
    }

    /// Cache-Control header for an asset kind
    pub fn cache_control(&self, kind: AssetKind) -> Option<&HeaderValue> {
        match kind {
            AssetKind::Immutable => Some(&self.cache_immutable),
            AssetKind::Standard => self.cache_standard.as_ref(),
        }
    }

    /// Cache-Control header for index and alias redirects
    pub fn redirect_cache_control(&self) -> Option<&HeaderValue> {
        self.cache_redirect.as_ref()
    }
}

fn standard_cache_control(max_age: Option<u64>) -> Option<HeaderValue> {
    let age = max_age?;
    HeaderValue::from_str(&format!("public, max-age={}, must-revalidate", age)).ok()
}

fn redirect_cache_control(max_age: Option<u64>) -> Option<HeaderValue> {
    let age = max_age?;
    HeaderValue::from_str(&format!("max-age={}, public", age)).ok()
}

fn immutable_cache_control(max_age: u64) -> HeaderValue {
    HeaderValue::from_str(&format!("public, max-age={}, immutable", max_age))
        .unwrap_or_else(|_| HeaderValue::from_static("public, immutable"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use stasis_core::config::ConfigLoader;

    #[test]
    fn test_from_config() {
        let config = ConfigLoader::from_toml(
            r#"
            [[roots]]
            path = "/srv/static"
            prefix = "static"

            [compression]
            encodings = ["gzip", "br", "gzip"]
            workers = 2

            [cache]
            max_age = 300

            [serve]
            mimetypes = { ".WebManifest" = "application/manifest+json" }
            "#,
        )
        .unwrap();
        let options = StaticOptions::from_config(&config).unwrap();
        assert_eq!(options.roots[0].prefix, "/static/");
        assert_eq!(
            options.compression.encodings,
            vec![Encoding::Gzip, Encoding::Brotli]
        );
        assert_eq!(options.compression.workers, 2);
        assert_eq!(
            options.scan.mimetypes.get("webmanifest").map(String::as_str),
            Some("application/manifest+json")
        );
        assert_eq!(
            options.serve.cache_control(AssetKind::Standard).unwrap(),
            "public, max-age=300, must-revalidate"
        );
        assert_eq!(
            options.serve.cache_control(AssetKind::Immutable).unwrap(),
            "public, max-age=315360000, immutable"
        );
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut config = StasisConfig::default();
        config.compression.encodings = vec!["deflate".to_string()];
        assert!(matches!(
            StaticOptions::from_config(&config),
            Err(Error::Config(_))
        ));

        let mut config = StasisConfig::default();
        config.cache.immutable_pattern = Some("(".to_string());
        assert!(StaticOptions::from_config(&config).is_err());

        let mut config = StasisConfig::default();
        config.compression.min_ratio = 1.5;
        assert!(StaticOptions::from_config(&config).is_err());
    }

    #[test]
    fn test_kind_for() {
        let config = StasisConfig::default();
        let scan = ScanOptions::from_config(&config).unwrap();
        assert_eq!(scan.kind_for("/static/app.3f2a9c1b.css"), AssetKind::Immutable);
        assert_eq!(scan.kind_for("/static/app.css"), AssetKind::Standard);
        assert_eq!(scan.kind_for("/static/decade.js"), AssetKind::Standard);
    }

    #[test]
    fn test_default_scan_matches_default_config() {
        let scan = ScanOptions::default();
        assert_eq!(scan.kind_for("/app.3f2a9c1b.css"), AssetKind::Immutable);
        assert_eq!(scan.kind_for("/app.css"), AssetKind::Standard);

        let options = StaticOptions::for_root("/srv/static");
        assert_eq!(
            options.scan.kind_for("/js/vendor.0123abcd.js"),
            AssetKind::Immutable
        );
    }

    #[test]
    fn test_header_rules() {
        let config = ConfigLoader::from_toml(
            r#"
            [[serve.headers]]
            pattern = '\.woff2$'
            headers = { "X-Font" = "yes", "Cache-Control" = "no-transform" }

            [[serve.headers]]
            pattern = '^/fonts/'
            headers = { "X-Font" = "override" }
            "#,
        )
        .unwrap();
        let rules = ScanOptions::from_config(&config).unwrap().headers;

        let headers = rules.headers_for(Path::new("/srv/a.woff2"), "/fonts/a.woff2");
        assert_eq!(headers.get("x-font").unwrap(), "override");
        assert_eq!(headers.get(header::CACHE_CONTROL).unwrap(), "no-transform");
        assert!(rules.headers_for(Path::new("/srv/a.css"), "/a.css").is_empty());

        let rules = rules.with_hook(|headers, path, key| {
            let origin = format!("{}|{}", path.display(), key);
            headers.insert("x-origin", HeaderValue::from_str(&origin).unwrap());
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
        });
        let headers = rules.headers_for(Path::new("/srv/a.css"), "/a.css");
        assert_eq!(headers.get("x-origin").unwrap(), "/srv/a.css|/a.css");
        assert!(headers.get(header::CONTENT_LENGTH).is_none());
    }

    #[test]
    fn test_header_rules_reject_bad_config() {
        let mut config = StasisConfig::default();
        config.serve.headers = vec![HeaderRuleConfig {
            pattern: ".*".to_string(),
            headers: HashMap::from([("Content-Length".to_string(), "1".to_string())]),
        }];
        assert!(matches!(
            StaticOptions::from_config(&config),
            Err(Error::Config(_))
        ));

        config.serve.headers[0].headers =
            HashMap::from([("X-Ok".to_string(), "bad\nvalue".to_string())]);
        assert!(StaticOptions::from_config(&config).is_err());
    }

    #[test]
    fn test_max_age_none_omits_header() {
        let serve = ServeOptions::default().with_max_age(None);
        assert!(serve.cache_control(AssetKind::Standard).is_none());
        assert!(serve.redirect_cache_control().is_none());
    }
}
