//! Static file service
//!
//! Ties the build phase (scan, manifest, compress, index) to the serve
//! phase (resolve, look up, negotiate).

use crate::autorefresh::{self, Found};
use crate::compress::process_assets;
use crate::index::{Catalog, Redirect, Resolved, Snapshot};
use crate::manifest::{Manifest, manifest_assets};
use crate::negotiate::{Request, Response, negotiate};
use crate::options::StaticOptions;
use crate::path::resolve;
use crate::scan::{ProvisionalAsset, scan_root};
use http::Method;
use stasis_core::config::StasisConfig;
use stasis_core::{Error, Result};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Result of handling one request
#[derive(Debug)]
pub enum Outcome {
    Response(Response),
    /// Not ours: let the host answer
    PassThrough,
}

impl Outcome {
    pub fn is_pass_through(&self) -> bool {
        matches!(self, Outcome::PassThrough)
    }

    pub fn response(self) -> Option<Response> {
        match self {
            Outcome::Response(response) => Some(response),
            Outcome::PassThrough => None,
        }
    }
}

/// Summary of one build
#[derive(Debug)]
pub struct BuildReport {
    pub generation: u64,
    pub assets: usize,
    /// Compressed variants across all assets
    pub variants: usize,
    pub aliases: usize,
    pub redirects: usize,
    /// Files skipped and variants dropped
    pub errors: Vec<Error>,
    pub elapsed: Duration,
}

/// Precompressed static file service
pub struct StaticFiles {
    options: Arc<StaticOptions>,
    catalog: Catalog,
}

impl StaticFiles {
    /// Create the service; nothing is served until [`rebuild`](Self::rebuild) completes
    pub fn new(options: StaticOptions) -> Self {
        Self {
            options: Arc::new(options),
            catalog: Catalog::new(),
        }
    }

    /// Create the service from configuration
    pub fn from_config(config: &StasisConfig) -> Result<Self> {
        Ok(Self::new(StaticOptions::from_config(config)?))
    }

    /// Create the service and run the first build
    pub async fn build(options: StaticOptions) -> Result<(Self, BuildReport)> {
        let files = Self::new(options);
        let report = files.rebuild().await?;
        Ok((files, report))
    }

    /// Rebuild the index from disk and publish it
    ///
    /// Requests keep being answered from the previous snapshot until the
    /// new one is complete.
    pub async fn rebuild(&self) -> Result<BuildReport> {
        let options = self.options.clone();
        let (snapshot, mut report) = self
            .catalog
            .rebuild(move || build_snapshot(options))
            .await?;
        report.generation = snapshot.generation();
        Ok(report)
    }

    pub fn options(&self) -> &StaticOptions {
        &self.options
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Result<Arc<Snapshot>> {
        self.catalog.snapshot()
    }

    /// Answer a request from the current snapshot, or from disk with autorefresh on
    pub fn handle(&self, request: &Request) -> Outcome {
        if self.options.autorefresh {
            return self.handle_live(request);
        }

        let snapshot = match self.catalog.snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::debug!("{} {}: {}", request.method, request.path, e);
                return Outcome::PassThrough;
            }
        };

        let key = match lookup_key(request) {
            Ok(key) => key,
            Err(outcome) => return outcome,
        };

        let Some(resolved) = snapshot.resolve(&key) else {
            tracing::debug!("{} {}: no match", request.method, key);
            return Outcome::PassThrough;
        };
        self.respond(request, resolved)
    }

    fn handle_live(&self, request: &Request) -> Outcome {
        let key = match lookup_key(request) {
            Ok(key) => key,
            Err(outcome) => return outcome,
        };

        match autorefresh::find(&key, &self.options) {
            Some(Found::Asset(record)) => self.respond(request, Resolved::Asset(&record)),
            Some(Found::Redirect(redirect)) => self.respond(request, Resolved::Redirect(&redirect)),
            None => {
                tracing::debug!("{} {}: no file", request.method, key);
                Outcome::PassThrough
            }
        }
    }

    fn respond(&self, request: &Request, resolved: Resolved<'_>) -> Outcome {
        if request.method != Method::GET && request.method != Method::HEAD {
            if self.options.serve.reject_other_methods {
                return Outcome::Response(Response::method_not_allowed());
            }
            return Outcome::PassThrough;
        }

        let serve = &self.options.serve;
        let query = request.query.as_deref();
        let response = match resolved {
            Resolved::Redirect(redirect) => Response::redirect(redirect, query, serve),
            Resolved::Alias { canonical, .. } if serve.redirect_aliases => {
                Response::redirect(&Redirect::found(canonical), query, serve)
            }
            Resolved::Alias { record, .. } | Resolved::Asset(record) => {
                negotiate(record, request, serve)
            }
        };
        Outcome::Response(response)
    }
}

/// Normalized key for a request, or the 400 to answer with
fn lookup_key(request: &Request) -> std::result::Result<String, Outcome> {
    resolve(&request.path).map_err(|e| {
        tracing::debug!("{} {}: {}", request.method, request.path, e);
        Outcome::Response(Response::bad_request())
    })
}

/// Run one full build off to the side
async fn build_snapshot(options: Arc<StaticOptions>) -> Result<(Snapshot, BuildReport)> {
    let started = Instant::now();

    if options.autorefresh {
        if options.manifest.is_some() {
            tracing::warn!("⚠️ The manifest is not used with autorefresh on");
        }
        tracing::info!("🔄 Autorefresh on: files are resolved on every request");
        let report = BuildReport {
            generation: 0,
            assets: 0,
            variants: 0,
            aliases: 0,
            redirects: 0,
            errors: Vec::new(),
            elapsed: started.elapsed(),
        };
        return Ok((Snapshot::build(Vec::new(), Vec::new()), report));
    }

    let discover = options.clone();
    let (assets, redirects, mut errors) =
        tokio::task::spawn_blocking(move || discover_assets(&discover))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))??;

    let (records, compress_errors) =
        process_assets(assets, Arc::new(options.compression.clone())).await;
    errors.extend(compress_errors);

    let variants: usize = records.iter().map(|r| r.variants().len() - 1).sum();
    let snapshot = Snapshot::build(records, redirects);
    let report = BuildReport {
        generation: 0,
        assets: snapshot.len(),
        variants,
        aliases: snapshot.alias_count(),
        redirects: snapshot.redirect_count(),
        errors,
        elapsed: started.elapsed(),
    };

    tracing::info!(
        "✅ Indexed {} assets with {} compressed variants in {:?}",
        report.assets,
        report.variants,
        report.elapsed
    );
    if !report.errors.is_empty() {
        tracing::warn!("⚠️ {} files or variants were skipped", report.errors.len());
    }
    Ok((snapshot, report))
}

type Discovered = (Vec<ProvisionalAsset>, Vec<(String, Redirect)>, Vec<Error>);

/// Scan every root and load the manifest; the first source to claim a key keeps it
fn discover_assets(options: &StaticOptions) -> Result<Discovered> {
    let mut assets = Vec::new();
    let mut redirects = Vec::new();
    let mut errors = Vec::new();

    for root in &options.roots {
        let outcome = scan_root(&root.path, &root.prefix, &options.scan);
        assets.extend(outcome.assets);
        redirects.extend(outcome.redirects);
        errors.extend(outcome.errors);
    }

    if let Some(source) = &options.manifest {
        let manifest = Manifest::load(&source.path, source.root.clone(), &source.prefix)?;
        let (listed, manifest_errors) = manifest_assets(&manifest, &options.scan);
        assets.extend(listed);
        errors.extend(manifest_errors);
    }

    let mut seen = HashSet::new();
    assets.retain(|asset| {
        if seen.insert(asset.key.clone()) {
            true
        } else {
            tracing::warn!("⚠️ {} is provided twice, keeping the first", asset.key);
            false
        }
    });
    Ok((assets, redirects, errors))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::ManifestSource;
    use http::StatusCode;
    use http::header::{self, HeaderName};
    use std::fs;

    async fn service(dir: &std::path::Path) -> StaticFiles {
        let (files, report) = StaticFiles::build(StaticOptions::for_root(dir)).await.unwrap();
        assert!(report.errors.is_empty());
        files
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_not_ready_passes_through() {
        let files = StaticFiles::new(StaticOptions::default());
        assert!(files.handle(&Request::get("/app.js")).is_pass_through());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_serves_and_passes_through() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("app.js"), "console.log('hi');").unwrap();
        let files = service(dir.path()).await;

        let response = files.handle(&Request::get("/app.js")).response().unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(
            response.header(header::CONTENT_TYPE),
            Some("text/javascript; charset=utf-8")
        );
        assert!(files.handle(&Request::get("/missing.js")).is_pass_through());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_invalid_path_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let files = service(dir.path()).await;
        let response = files
            .handle(&Request::get("/../../etc/passwd"))
            .response()
            .unwrap();
        assert_eq!(response.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_method_policy() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("app.js"), "x").unwrap();

        let files = service(dir.path()).await;
        let post = Request::new(Method::POST, "/app.js");
        let response = files.handle(&post).response().unwrap();
        assert_eq!(response.status, StatusCode::METHOD_NOT_ALLOWED);
        assert!(files.handle(&Request::new(Method::POST, "/nope")).is_pass_through());

        let mut options = StaticOptions::for_root(dir.path());
        options.serve.reject_other_methods = false;
        let (files, _) = StaticFiles::build(options).await.unwrap();
        assert!(files.handle(&post).is_pass_through());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_first_root_wins() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        fs::write(first.path().join("app.js"), "first").unwrap();
        fs::write(second.path().join("app.js"), "second").unwrap();
        fs::write(second.path().join("other.js"), "other").unwrap();

        let options = StaticOptions::for_root(first.path()).with_root(second.path(), "/");
        let (files, report) = StaticFiles::build(options).await.unwrap();
        assert_eq!(report.assets, 2);
        let record = files.catalog().lookup("/app.js").unwrap().unwrap();
        assert_eq!(record.identity().size, 5);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_alias_redirects() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("app.abc123.js"), "console.log(1)").unwrap();
        let manifest = dir.path().join("manifest.json");
        fs::write(&manifest, r#"{"app.js": "app.abc123.js"}"#).unwrap();

        let mut options = StaticOptions {
            manifest: Some(ManifestSource {
                path: manifest,
                root: dir.path().to_path_buf(),
                prefix: "/static/".to_string(),
            }),
            ..Default::default()
        };
        options.serve.redirect_aliases = true;
        let (files, report) = StaticFiles::build(options).await.unwrap();
        assert_eq!(report.aliases, 1);

        let request = Request::from_target(Method::GET, "/static/app.js?v=2");
        let response = files.handle(&request).response().unwrap();
        assert_eq!(response.status, StatusCode::FOUND);
        assert_eq!(
            response.header(header::LOCATION),
            Some("/static/app.abc123.js?v=2")
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_rebuild_publishes_new_generation() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("app.js"), "one").unwrap();
        let files = service(dir.path()).await;
        let before = files.snapshot().unwrap();

        fs::write(dir.path().join("app.js"), "two!").unwrap();
        let report = files.rebuild().await.unwrap();
        assert_eq!(report.generation, 2);

        assert_eq!(before.lookup("/app.js").unwrap().identity().size, 3);
        let after = files.catalog().lookup("/app.js").unwrap().unwrap();
        assert_eq!(after.identity().size, 4);
        assert_ne!(after.etag_str(), before.lookup("/app.js").unwrap().etag_str());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_autorefresh_serves_files_added_later() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = StaticOptions::for_root(dir.path());
        options.autorefresh = true;
        options.scan.index_file = Some("index.html".to_string());
        let (files, report) = StaticFiles::build(options).await.unwrap();
        assert_eq!(report.assets, 0);
        assert!(files.handle(&Request::get("/app.js")).is_pass_through());

        fs::write(dir.path().join("app.js"), "console.log('late');").unwrap();
        let response = files.handle(&Request::get("/app.js")).response().unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.header(header::CONTENT_LENGTH), Some("20"));
        assert!(response.header(header::ETAG).unwrap().contains('-'));

        fs::create_dir(dir.path().join("docs")).unwrap();
        fs::write(dir.path().join("docs/index.html"), "<h1>docs</h1>").unwrap();
        let response = files.handle(&Request::get("/docs")).response().unwrap();
        assert_eq!(response.status, StatusCode::FOUND);
        assert_eq!(response.header(header::LOCATION), Some("docs/"));
        assert_eq!(response.header(header::CACHE_CONTROL), Some("max-age=60, public"));

        let post = Request::new(Method::POST, "/app.js");
        let response = files.handle(&post).response().unwrap();
        assert_eq!(response.status, StatusCode::METHOD_NOT_ALLOWED);
        let response = files.handle(&Request::get("/../secret")).response().unwrap();
        assert_eq!(response.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_header_rules_reach_responses() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("font.woff2"), "wOF2").unwrap();
        fs::write(dir.path().join("app.js"), "x").unwrap();

        let mut extra = http::HeaderMap::new();
        extra.insert("x-font", http::HeaderValue::from_static("yes"));
        let mut options = StaticOptions::for_root(dir.path());
        options.scan.headers = options
            .scan
            .headers
            .with_rule(regex::Regex::new(r"\.woff2$").unwrap(), extra)
            .with_hook(|headers, path, _key| {
                if path.extension().is_some_and(|ext| ext == "js") {
                    let no_store = http::HeaderValue::from_static("no-store");
                    headers.insert(header::CACHE_CONTROL, no_store);
                }
            });
        let (files, _) = StaticFiles::build(options).await.unwrap();

        let font = files.handle(&Request::get("/font.woff2")).response().unwrap();
        assert_eq!(font.header(HeaderName::from_static("x-font")), Some("yes"));
        let script = files.handle(&Request::get("/app.js")).response().unwrap();
        assert_eq!(script.header(header::CACHE_CONTROL), Some("no-store"));
        assert!(script.header(HeaderName::from_static("x-font")).is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_broken_manifest_fails_build() {
        let dir = tempfile::tempdir().unwrap();
        let options = StaticOptions {
            manifest: Some(ManifestSource {
                path: dir.path().join("missing.json"),
                root: dir.path().to_path_buf(),
                prefix: "/".to_string(),
            }),
            ..Default::default()
        };
        assert!(matches!(
            StaticFiles::build(options).await,
            Err(Error::Manifest(_))
        ));
    }
}
