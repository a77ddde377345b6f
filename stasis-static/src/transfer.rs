//! Moving response bytes to a client
//!
//! The only part of serving that differs between blocking and async
//! hosts. In-memory bodies are sliced without copying; file bodies are
//! read from their offset in [`BLOCK_SIZE`] chunks.

use crate::negotiate::{Body, Response};
use crate::range::MultipartPart;
use crate::record::Storage;
use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use std::io;
use std::path::Path;

/// Read size for file-backed bodies
pub const BLOCK_SIZE: usize = 8192;

/// Destination for a response on a blocking host
pub trait ResponseSink {
    fn send_head(&mut self, status: StatusCode, headers: &HeaderMap) -> io::Result<()>;
    fn send_data(&mut self, data: Bytes) -> io::Result<()>;
}

/// Destination for a response on an async host
#[async_trait]
pub trait AsyncResponseSink: Send {
    async fn send_head(&mut self, status: StatusCode, headers: &HeaderMap) -> io::Result<()>;
    async fn send_data(&mut self, data: Bytes) -> io::Result<()>;
}

fn memory_slice(bytes: &Bytes, start: u64, len: u64) -> io::Result<Bytes> {
    let start = start as usize;
    let end = start.saturating_add(len as usize);
    if end > bytes.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "range outside of the stored body",
        ));
    }
    Ok(bytes.slice(start..end))
}

fn truncated(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("{} is shorter than when it was indexed", path.display()),
    )
}

/// Send a response on a blocking host
pub fn transfer_blocking<S: ResponseSink + ?Sized>(
    response: &Response,
    sink: &mut S,
) -> io::Result<()> {
    sink.send_head(response.status, &response.headers)?;
    match &response.body {
        Body::Empty => Ok(()),
        Body::Slice {
            storage,
            start,
            len,
        } => send_blocking(storage, *start, *len, sink),
        Body::Multipart {
            storage,
            parts,
            closing,
        } => {
            for MultipartPart { header, range } in parts {
                sink.send_data(header.clone())?;
                send_blocking(storage, range.start, range.len(), sink)?;
            }
            sink.send_data(closing.clone())
        }
    }
}

fn send_blocking<S: ResponseSink + ?Sized>(
    storage: &Storage,
    start: u64,
    len: u64,
    sink: &mut S,
) -> io::Result<()> {
    use std::io::{Read, Seek, SeekFrom};

    match storage {
        Storage::Memory(bytes) => sink.send_data(memory_slice(bytes, start, len)?),
        Storage::File(path) => {
            let mut file = std::fs::File::open(path.as_path())?;
            file.seek(SeekFrom::Start(start))?;
            let mut buffer = vec![0u8; BLOCK_SIZE];
            let mut remaining = len;
            while remaining > 0 {
                let want = remaining.min(BLOCK_SIZE as u64) as usize;
                let n = file.read(&mut buffer[..want])?;
                if n == 0 {
                    return Err(truncated(path));
                }
                sink.send_data(Bytes::copy_from_slice(&buffer[..n]))?;
                remaining -= n as u64;
            }
            Ok(())
        }
    }
}

/// Send a response on an async host
///
/// Dropping the returned future closes any open file.
pub async fn transfer<S: AsyncResponseSink + ?Sized>(
    response: &Response,
    sink: &mut S,
) -> io::Result<()> {
    sink.send_head(response.status, &response.headers).await?;
    match &response.body {
        Body::Empty => Ok(()),
        Body::Slice {
            storage,
            start,
            len,
        } => send_async(storage, *start, *len, sink).await,
        Body::Multipart {
            storage,
            parts,
            closing,
        } => {
            for MultipartPart { header, range } in parts {
                sink.send_data(header.clone()).await?;
                send_async(storage, range.start, range.len(), sink).await?;
            }
            sink.send_data(closing.clone()).await
        }
    }
}

async fn send_async<S: AsyncResponseSink + ?Sized>(
    storage: &Storage,
    start: u64,
    len: u64,
    sink: &mut S,
) -> io::Result<()> {
    use tokio::io::{AsyncReadExt, AsyncSeekExt};

    match storage {
        Storage::Memory(bytes) => sink.send_data(memory_slice(bytes, start, len)?).await,
        Storage::File(path) => {
            let mut file = tokio::fs::File::open(path.as_path()).await?;
            file.seek(io::SeekFrom::Start(start)).await?;
            let mut buffer = vec![0u8; BLOCK_SIZE];
            let mut remaining = len;
            while remaining > 0 {
                let want = remaining.min(BLOCK_SIZE as u64) as usize;
                let n = file.read(&mut buffer[..want]).await?;
                if n == 0 {
                    return Err(truncated(path));
                }
                sink.send_data(Bytes::copy_from_slice(&buffer[..n])).await?;
                remaining -= n as u64;
            }
            Ok(())
        }
    }
}

/// Sink that keeps the whole response in memory
#[derive(Debug, Default)]
pub struct BufferedSink {
    pub status: Option<StatusCode>,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    /// Number of `send_data` calls
    pub chunks: usize,
}

impl ResponseSink for BufferedSink {
    fn send_head(&mut self, status: StatusCode, headers: &HeaderMap) -> io::Result<()> {
        self.status = Some(status);
        self.headers = headers.clone();
        Ok(())
    }

    fn send_data(&mut self, data: Bytes) -> io::Result<()> {
        self.body.extend_from_slice(&data);
        self.chunks += 1;
        Ok(())
    }
}

#[async_trait]
impl AsyncResponseSink for BufferedSink {
    async fn send_head(&mut self, status: StatusCode, headers: &HeaderMap) -> io::Result<()> {
        ResponseSink::send_head(self, status, headers)
    }

    async fn send_data(&mut self, data: Bytes) -> io::Result<()> {
        ResponseSink::send_data(self, data)
    }
}
