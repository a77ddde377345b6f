//! Compression support
//!
//! All compression happens at build time. Each asset is handled by one
//! task on a bounded pool, and its record is only assembled once every
//! configured encoding has finished, so a half-built record never exists.

use crate::mime;
use crate::options::CompressionOptions;
use crate::record::{AssetRecord, RecordMeta, Storage, Variant, etag_for, etag_from_hash};
use crate::scan::{AssetSource, ProvisionalAsset};
use async_compression::Level;
use bytes::Bytes;
use stasis_core::config::CompressionLevel;
use stasis_core::{Error, Result};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};

/// Supported compression algorithms, in canonical preference order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Encoding {
    Brotli,
    Gzip,
    Zstd,
}

impl Encoding {
    /// Every supported encoding, canonical order
    pub const ALL: [Encoding; 3] = [Encoding::Brotli, Encoding::Gzip, Encoding::Zstd];

    /// Get the content-encoding header value
    pub fn name(&self) -> &'static str {
        match self {
            Encoding::Brotli => "br",
            Encoding::Gzip => "gzip",
            Encoding::Zstd => "zstd",
        }
    }

    /// File extension of a precompressed sibling (without the dot)
    pub fn extension(&self) -> &'static str {
        match self {
            Encoding::Brotli => "br",
            Encoding::Gzip => "gz",
            Encoding::Zstd => "zst",
        }
    }

    /// Parse a content-coding token, case-insensitively
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        if name.eq_ignore_ascii_case("br") || name.eq_ignore_ascii_case("brotli") {
            Some(Encoding::Brotli)
        } else if name.eq_ignore_ascii_case("gzip") || name.eq_ignore_ascii_case("x-gzip") {
            Some(Encoding::Gzip)
        } else if name.eq_ignore_ascii_case("zstd") {
            Some(Encoding::Zstd)
        } else {
            None
        }
    }

    /// Encoding whose sibling extension `path` carries
    pub fn for_sibling(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?;
        Encoding::ALL.into_iter().find(|e| e.extension() == ext)
    }

    /// `path` with this encoding's sibling extension appended
    pub fn sibling_of(&self, path: &Path) -> PathBuf {
        let mut sibling = path.as_os_str().to_owned();
        sibling.push(".");
        sibling.push(self.extension());
        PathBuf::from(sibling)
    }
}

pub(crate) fn level(level: CompressionLevel) -> Level {
    match level {
        CompressionLevel::Fast => Level::Fastest,
        CompressionLevel::Default => Level::Default,
        CompressionLevel::Best => Level::Best,
    }
}

/// Compress `input` with one encoding
pub async fn compress(
    encoding: Encoding,
    quality: Level,
    input: &[u8],
) -> std::io::Result<Vec<u8>> {
    use async_compression::tokio::write::{BrotliEncoder, GzipEncoder, ZstdEncoder};
    use tokio::io::AsyncWriteExt;

    match encoding {
        Encoding::Brotli => {
            let mut encoder = BrotliEncoder::with_quality(Vec::new(), quality);
            encoder.write_all(input).await?;
            encoder.shutdown().await?;
            Ok(encoder.into_inner())
        }
        Encoding::Gzip => {
            let mut encoder = GzipEncoder::with_quality(Vec::new(), quality);
            encoder.write_all(input).await?;
            encoder.shutdown().await?;
            Ok(encoder.into_inner())
        }
        Encoding::Zstd => {
            let mut encoder = ZstdEncoder::with_quality(Vec::new(), quality);
            encoder.write_all(input).await?;
            encoder.shutdown().await?;
            Ok(encoder.into_inner())
        }
    }
}

/// A variant is worth keeping only if it saves at least `min_ratio` of the identity size
pub fn is_effective(compressed: u64, identity: u64, min_ratio: f64) -> bool {
    identity > 0 && (compressed as f64) < (identity as f64) * (1.0 - min_ratio)
}

/// Pool size: configured, else available parallelism
pub fn worker_count(configured: Option<usize>) -> usize {
    configured
        .unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        })
        .max(1)
}

/// Run `work` over `items` with at most `workers` units in flight
///
/// Units run on the blocking pool so CPU-heavy work never stalls the
/// threads serving requests. A panicking unit only loses its own result.
pub(crate) async fn run_bounded<I, T, F, Fut>(
    items: Vec<I>,
    workers: usize,
    work: F,
) -> Vec<std::result::Result<T, JoinError>>
where
    I: Send + 'static,
    T: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = T>,
{
    let semaphore = Arc::new(Semaphore::new(workers.max(1)));
    let work = Arc::new(work);
    let handle = tokio::runtime::Handle::current();
    let mut tasks = JoinSet::new();
    let mut results = Vec::with_capacity(items.len());

    for item in items {
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let work = work.clone();
        let handle = handle.clone();
        tasks.spawn_blocking(move || {
            let _permit = permit;
            handle.block_on(work(item))
        });
    }

    while let Some(joined) = tasks.join_next().await {
        results.push(joined);
    }
    results
}

/// Result of processing one provisional asset
pub(crate) struct Processed {
    pub record: Option<AssetRecord>,
    pub errors: Vec<Error>,
}

/// Turn provisional assets into finished records
///
/// Returns the records (in no particular order) and every per-file error.
pub async fn process_assets(
    assets: Vec<ProvisionalAsset>,
    options: Arc<CompressionOptions>,
) -> (Vec<AssetRecord>, Vec<Error>) {
    let workers = options.workers;
    let results = run_bounded(assets, workers, move |asset| {
        let options = options.clone();
        async move { process_asset(asset, &options).await }
    })
    .await;

    let mut records = Vec::with_capacity(results.len());
    let mut errors = Vec::new();
    for result in results {
        match result {
            Ok(processed) => {
                records.extend(processed.record);
                errors.extend(processed.errors);
            }
            Err(e) => {
                tracing::error!("❌ Asset worker failed: {}", e);
                errors.push(Error::Io(std::io::Error::other(format!(
                    "asset worker failed: {}",
                    e
                ))));
            }
        }
    }
    (records, errors)
}

pub(crate) async fn process_asset(
    asset: ProvisionalAsset,
    options: &CompressionOptions,
) -> Processed {
    match asset.source.clone() {
        AssetSource::Scanned => compress_scanned(asset, options).await,
        AssetSource::Manifest { hash } => collect_siblings(asset, hash, options).await,
    }
}

pub(crate) fn meta_for(asset: &ProvisionalAsset, etag: String) -> RecordMeta {
    RecordMeta {
        key: asset.key.clone(),
        source: asset.path.clone(),
        etag,
        modified: asset.modified,
        mime_type: asset.mime_type.clone(),
        content_type: asset.content_type.clone(),
        kind: asset.kind,
        aliases: asset.aliases.clone(),
    }
}

async fn compress_scanned(asset: ProvisionalAsset, options: &CompressionOptions) -> Processed {
    let content = match tokio::fs::read(&asset.path).await {
        Ok(content) => Bytes::from(content),
        Err(e) => {
            tracing::warn!("⚠️ Skipping unreadable file {}: {}", asset.path.display(), e);
            return Processed {
                record: None,
                errors: vec![Error::scan_io(&asset.path, e)],
            };
        }
    };

    let mut attempts = Vec::new();
    if options.should_compress(&asset.mime_type, content.len() as u64) {
        for &encoding in &options.encodings {
            attempts.push((encoding, compress(encoding, options.level, &content).await));
        }
    }
    assemble_scanned(&asset, content, attempts, options)
}

/// Build the record of a scanned asset from its compression attempts
///
/// Failed and ineffective encodings are left out. The identity variant is
/// always present, so an asset whose encodings all failed is still served.
fn assemble_scanned(
    asset: &ProvisionalAsset,
    content: Bytes,
    attempts: Vec<(Encoding, std::io::Result<Vec<u8>>)>,
    options: &CompressionOptions,
) -> Processed {
    let size = content.len() as u64;
    let etag = etag_for(&content);
    let mut errors = Vec::new();
    let mut variants = Vec::new();

    for (encoding, attempt) in attempts {
        match attempt {
            Ok(compressed) => {
                if is_effective(compressed.len() as u64, size, options.min_ratio) {
                    variants.push(Variant::compressed(encoding, Bytes::from(compressed)));
                } else {
                    tracing::debug!(
                        "Skipping {} for {}: {} -> {} bytes",
                        encoding.name(),
                        asset.key,
                        size,
                        compressed.len()
                    );
                }
            }
            Err(e) => {
                tracing::warn!(
                    "⚠️ {} compression failed for {}: {}",
                    encoding.name(),
                    asset.path.display(),
                    e
                );
                errors.push(Error::Compression {
                    path: asset.path.clone(),
                    encoding: encoding.name().to_string(),
                    message: e.to_string(),
                });
            }
        }
    }

    let storage = if size <= options.memory_limit {
        Storage::Memory(content)
    } else {
        Storage::file(&asset.path)
    };
    let identity = Variant::identity(size, storage);
    Processed {
        record: Some(
            AssetRecord::new(meta_for(asset, etag), identity, variants)
                .with_headers(asset.headers.clone()),
        ),
        errors,
    }
}

async fn collect_siblings(
    asset: ProvisionalAsset,
    hash: Option<String>,
    options: &CompressionOptions,
) -> Processed {
    let etag = match hash {
        Some(hash) => etag_from_hash(&hash),
        None => match hash_file(&asset.path).await {
            Ok(etag) => etag,
            Err(e) => {
                tracing::warn!("⚠️ Skipping unreadable file {}: {}", asset.path.display(), e);
                return Processed {
                    record: None,
                    errors: vec![Error::scan_io(&asset.path, e)],
                };
            }
        },
    };

    let mut variants = Vec::new();
    for &encoding in &options.encodings {
        let sibling = encoding.sibling_of(&asset.path);
        let metadata = match tokio::fs::metadata(&sibling).await {
            Ok(m) if m.is_file() => m,
            _ => continue,
        };
        if is_effective(metadata.len(), asset.size, options.min_ratio) {
            variants.push(Variant::sibling(encoding, metadata.len(), sibling));
        } else {
            tracing::debug!(
                "Ignoring {}: not smaller than {} bytes",
                sibling.display(),
                asset.size
            );
        }
    }

    let identity = Variant::identity(asset.size, Storage::file(&asset.path));
    Processed {
        record: Some(
            AssetRecord::new(meta_for(&asset, etag), identity, variants)
                .with_headers(asset.headers),
        ),
        errors: Vec::new(),
    }
}

async fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = blake3::Hasher::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(format!("\"{}\"", hex::encode(&hasher.finalize().as_bytes()[..16])))
}

/// Outcome of compressing a directory in place
#[derive(Debug, Default)]
pub struct CompressDirReport {
    /// Sibling files written
    pub written: Vec<PathBuf>,
    /// Files considered
    pub considered: usize,
    /// Per-file failures
    pub errors: Vec<Error>,
}

/// Write `.br`/`.gz`/`.zst` siblings next to every compressible file under `root`
///
/// Siblings keep the source's modification time and are only written
/// when they compress effectively.
pub async fn compress_dir(
    root: &Path,
    options: Arc<CompressionOptions>,
) -> Result<CompressDirReport> {
    let root = root.to_path_buf();
    let mimetypes = options.mimetypes.clone();
    let compressible = options.compressible_types.clone();
    let candidates = tokio::task::spawn_blocking(move || -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in walkdir::WalkDir::new(&root).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.clone());
                Error::scan_io(path, e.into())
            })?;
            if !entry.file_type().is_file() || Encoding::for_sibling(entry.path()).is_some() {
                continue;
            }
            let mime_type = mime::guess_mime_type(entry.path(), &mimetypes);
            if mime::is_compressible(&mime_type, &compressible) {
                files.push(entry.into_path());
            }
        }
        Ok(files)
    })
    .await
    .map_err(|e| Error::Io(std::io::Error::other(e)))??;

    let considered = candidates.len();
    let workers = options.workers;
    let results = run_bounded(candidates, workers, move |path| {
        let options = options.clone();
        async move { compress_file(&path, &options).await }
    })
    .await;

    let mut report = CompressDirReport {
        considered,
        ..Default::default()
    };
    for result in results {
        match result {
            Ok((written, errors)) => {
                report.written.extend(written);
                report.errors.extend(errors);
            }
            Err(e) => report
                .errors
                .push(Error::Io(std::io::Error::other(e.to_string()))),
        }
    }
    report.written.sort();
    Ok(report)
}

async fn compress_file(path: &Path, options: &CompressionOptions) -> (Vec<PathBuf>, Vec<Error>) {
    let mut written = Vec::new();
    let mut errors = Vec::new();

    let (content, modified) = match read_with_mtime(path).await {
        Ok(found) => found,
        Err(e) => return (written, vec![Error::scan_io(path, e)]),
    };
    let size = content.len() as u64;
    if size < options.min_size {
        return (written, errors);
    }

    for &encoding in &options.encodings {
        let compressed = match compress(encoding, options.level, &content).await {
            Ok(compressed) => compressed,
            Err(e) => {
                errors.push(Error::Compression {
                    path: path.to_path_buf(),
                    encoding: encoding.name().to_string(),
                    message: e.to_string(),
                });
                continue;
            }
        };
        if !is_effective(compressed.len() as u64, size, options.min_ratio) {
            continue;
        }
        let sibling = encoding.sibling_of(path);
        let result = async {
            tokio::fs::write(&sibling, &compressed).await?;
            if let Some(modified) = modified {
                let file = std::fs::File::options().write(true).open(&sibling)?;
                file.set_modified(modified)?;
            }
            Ok::<_, std::io::Error>(())
        }
        .await;
        match result {
            Ok(()) => written.push(sibling),
            Err(e) => errors.push(Error::scan_io(&sibling, e)),
        }
    }
    (written, errors)
}

async fn read_with_mtime(
    path: &Path,
) -> std::io::Result<(Vec<u8>, Option<std::time::SystemTime>)> {
    let metadata = tokio::fs::metadata(path).await?;
    let content = tokio::fs::read(path).await?;
    Ok((content, metadata.modified().ok()))
}
