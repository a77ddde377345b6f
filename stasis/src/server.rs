//! HTTP host for the static file service
//!
//! Connections are served by hyper's HTTP/1.1 implementation, so
//! keep-alive, pipelining and framing come from the library. Bodies are
//! streamed: [`transfer`] writes into a [`ChannelSink`] on its own task
//! and hyper pulls the chunks out of the matching [`ChannelBody`].

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use hyper::body::{Frame, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use stasis_static::{
    AsyncResponseSink, Body, Outcome, Request, Response, StaticFiles, Storage, transfer,
};
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};

/// Chunks buffered between a transfer task and its connection
const CHANNEL_DEPTH: usize = 8;

/// HTTP server answering from a [`StaticFiles`] service
pub struct HttpServer {
    files: Arc<StaticFiles>,
    listener: TcpListener,
}

impl HttpServer {
    /// Bind to `addr`
    pub async fn bind(addr: &str, files: Arc<StaticFiles>) -> io::Result<Self> {
        let addr: SocketAddr = addr
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { files, listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections forever
    pub async fn run(self) -> io::Result<()> {
        tracing::info!("🚀 Stasis listening on http://{}", self.local_addr()?);
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            let io = TokioIo::new(stream);
            let files = self.files.clone();
            let service = service_fn(move |req| handle_request(req, files.clone()));
            tokio::task::spawn(async move {
                if let Err(err) = http1::Builder::new().serve_connection(io, service).await
                {
                    tracing::debug!("Connection from {} ended: {:?}", peer, err);
                }
            });
        }
    }
}

async fn handle_request(
    req: hyper::Request<Incoming>,
    files: Arc<StaticFiles>,
) -> Result<hyper::Response<ChannelBody>, Infallible> {
    let request = Request::from(&req);
    let response = match files.handle(&request) {
        Outcome::Response(response) => response,
        Outcome::PassThrough => not_found(&request),
    };
    tracing::info!(
        "{} {} {}",
        request.method,
        request.path,
        response.status.as_u16()
    );
    Ok(stream_response(response).await)
}

fn not_found(request: &Request) -> Response {
    const BODY: &[u8] = b"Not Found\n";
    let mut response = Response::new(StatusCode::NOT_FOUND);
    response.headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
        .headers
        .insert(header::CONTENT_LENGTH, HeaderValue::from(BODY.len()));
    if request.method != Method::HEAD {
        response.body = Body::Slice {
            storage: Storage::Memory(Bytes::from_static(BODY)),
            start: 0,
            len: BODY.len() as u64,
        };
    }
    response
}

/// Start transferring `response` and hand hyper its head and body
async fn stream_response(response: Response) -> hyper::Response<ChannelBody> {
    let (head_tx, head_rx) = oneshot::channel();
    let (body_tx, body_rx) = mpsc::channel(CHANNEL_DEPTH);

    tokio::spawn(async move {
        let mut sink = ChannelSink {
            head: Some(head_tx),
            body: body_tx,
        };
        if let Err(e) = transfer(&response, &mut sink).await {
            tracing::warn!("⚠️ Response body aborted: {}", e);
            let _ = sink.body.send(Err(e)).await;
        }
    });

    let (status, mut headers) = match head_rx.await {
        Ok(head) => head,
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, HeaderMap::new()),
    };
    headers.insert(header::SERVER, HeaderValue::from_static("Stasis"));

    let mut reply = hyper::Response::new(ChannelBody { rx: body_rx });
    *reply.status_mut() = status;
    *reply.headers_mut() = headers;
    reply
}

/// Sink half of a streamed response
struct ChannelSink {
    head: Option<oneshot::Sender<(StatusCode, HeaderMap)>>,
    body: mpsc::Sender<io::Result<Bytes>>,
}

fn client_gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "client went away")
}

#[async_trait]
impl AsyncResponseSink for ChannelSink {
    async fn send_head(&mut self, status: StatusCode, headers: &HeaderMap) -> io::Result<()> {
        let head = self
            .head
            .take()
            .ok_or_else(|| io::Error::other("response head sent twice"))?;
        head.send((status, headers.clone())).map_err(|_| client_gone())
    }

    async fn send_data(&mut self, data: Bytes) -> io::Result<()> {
        self.body.send(Ok(data)).await.map_err(|_| client_gone())
    }
}

/// Body half of a streamed response
///
/// Framing follows the `Content-Length` header negotiation already set.
pub struct ChannelBody {
    rx: mpsc::Receiver<io::Result<Bytes>>,
}

impl hyper::body::Body for ChannelBody {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, io::Error>>> {
        self.rx
            .poll_recv(cx)
            .map(|chunk| chunk.map(|result| result.map(Frame::data)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stasis_static::StaticOptions;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn start(root: &std::path::Path) -> SocketAddr {
        let (files, _) = StaticFiles::build(StaticOptions::for_root(root)).await.unwrap();
        let server = HttpServer::bind("127.0.0.1:0", Arc::new(files)).await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());
        addr
    }

    async fn exchange(addr: SocketAddr, requests: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(requests.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        String::from_utf8_lossy(&response).into_owned()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_keep_alive_serves_pipelined_requests() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("hello.txt"), "hello world!").unwrap();
        let addr = start(root.path()).await;

        let response = exchange(
            addr,
            "GET /hello.txt HTTP/1.1\r\nHost: localhost\r\n\r\n\
             HEAD /hello.txt HTTP/1.1\r\nHost: localhost\r\n\r\n\
             GET /missing.txt HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        )
        .await;

        assert_eq!(response.matches("HTTP/1.1 200 OK").count(), 2);
        assert_eq!(response.matches("HTTP/1.1 404 Not Found").count(), 1);
        assert_eq!(response.matches("hello world!").count(), 1);
        assert_eq!(response.matches("content-length: 12\r\n").count(), 2);
        assert!(response.ends_with("Not Found\n"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_file_backed_body_streams() {
        let root = tempfile::tempdir().unwrap();
        let content = "x".repeat(3 * stasis_static::transfer::BLOCK_SIZE + 17);
        std::fs::write(root.path().join("blob.bin"), &content).unwrap();
        let mut options = StaticOptions::for_root(root.path());
        options.compression.memory_limit = 1024;
        let (files, _) = StaticFiles::build(options).await.unwrap();
        let server = HttpServer::bind("127.0.0.1:0", Arc::new(files)).await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());

        let response = exchange(
            addr,
            "GET /blob.bin HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        )
        .await;
        let (head, body) = response.split_once("\r\n\r\n").unwrap();
        assert!(head.starts_with("HTTP/1.1 200 OK"));
        assert!(head.contains(&format!("content-length: {}", content.len())));
        assert!(head.contains("server: Stasis"));
        assert_eq!(body, content);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_malformed_request_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let addr = start(root.path()).await;
        let response = exchange(addr, "GET / HTTP/1.1\r\nno colon here\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 400 Bad Request"));
    }

    #[test]
    fn test_request_conversion() {
        let req = http::Request::get("/static/app.js?v=1")
            .header(header::ACCEPT_ENCODING, "gzip, br")
            .body(())
            .unwrap();
        let request = Request::from(&req);
        assert_eq!(request.method, Method::GET);
        assert_eq!(request.path, "/static/app.js");
        assert_eq!(request.query.as_deref(), Some("v=1"));
        assert_eq!(request.header(header::ACCEPT_ENCODING), Some("gzip, br"));
    }
}
