//! Stasis Static Asset Module
//!
//! Precompressed static file serving with:
//! - Build-time scanning of directories or a hashed-name manifest
//! - Brotli, gzip and zstd variants produced on a bounded worker pool
//! - An immutable, atomically swapped asset index
//! - Content negotiation, conditional requests and byte ranges
//! - Blocking and async transfer adapters
//! - An autorefresh mode resolving files per request for development

pub mod accept;
pub mod autorefresh;
pub mod compress;
mod file_server;
pub mod index;
pub mod manifest;
pub mod mime;
pub mod negotiate;
pub mod options;
pub mod path;
pub mod range;
pub mod record;
pub mod scan;
pub mod transfer;

pub use compress::{CompressDirReport, Encoding, compress_dir};
pub use file_server::{BuildReport, Outcome, StaticFiles};
pub use index::{Catalog, Redirect, Snapshot};
pub use negotiate::{Body, Request, Response, negotiate};
pub use options::{CompressionOptions, HeaderRules, ScanOptions, ServeOptions, StaticOptions};
pub use record::{AssetKind, AssetRecord, Storage, Variant};
pub use transfer::{AsyncResponseSink, BufferedSink, ResponseSink, transfer, transfer_blocking};
