//! Response negotiation
//!
//! [`negotiate`] is a pure function of a record, a request and the serve
//! options. It decides status, headers and which bytes to send, but never
//! touches the filesystem; moving the bytes is the job of [`crate::transfer`].

use crate::accept::{AcceptEncoding, select};
use crate::index::Redirect;
use crate::options::ServeOptions;
use crate::range::{ByteRange, Multipart, MultipartPart, RangeSpec, parse_range};
use crate::record::{AssetRecord, Storage, Variant};
use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode};
use stasis_core::config::MultiRangePolicy;
use std::time::SystemTime;

/// The parts of an HTTP request negotiation looks at
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    /// Raw (still percent-encoded) path
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: None,
            headers: HeaderMap::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn head(path: impl Into<String>) -> Self {
        Self::new(Method::HEAD, path)
    }

    /// Split a request target such as `/app.js?v=1`
    pub fn from_target(method: Method, target: &str) -> Self {
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, Some(query.to_string())),
            None => (target, None),
        };
        Self {
            query,
            ..Self::new(method, path)
        }
    }

    /// Add a header; values that are not valid header text are dropped
    pub fn with_header(mut self, name: HeaderName, value: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.append(name, value);
        }
        self
    }

    pub fn header(&self, name: HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    fn is_read(&self) -> bool {
        self.method == Method::GET || self.method == Method::HEAD
    }
}

impl<B> From<&http::Request<B>> for Request {
    fn from(request: &http::Request<B>) -> Self {
        Self {
            method: request.method().clone(),
            path: request.uri().path().to_string(),
            query: request.uri().query().map(str::to_string),
            headers: request.headers().clone(),
        }
    }
}

/// What to send after the head
#[derive(Debug, Clone)]
pub enum Body {
    Empty,
    /// `len` bytes of `storage` from `start`
    Slice { storage: Storage, start: u64, len: u64 },
    /// `multipart/byteranges` over one storage
    Multipart {
        storage: Storage,
        parts: Vec<MultipartPart>,
        closing: Bytes,
    },
}

impl Body {
    /// Bytes the body will produce
    pub fn len(&self) -> u64 {
        match self {
            Body::Empty => 0,
            Body::Slice { len, .. } => *len,
            Body::Multipart { parts, closing, .. } => {
                parts
                    .iter()
                    .map(|p| p.header.len() as u64 + p.range.len())
                    .sum::<u64>()
                    + closing.len() as u64
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A fully decided response
#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Body,
    /// Variant the body is taken from
    pub variant: Option<Variant>,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Body::Empty,
            variant: None,
        }
    }

    fn text(status: StatusCode, message: &'static str) -> Self {
        let mut response = Self::new(status);
        response.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response
            .headers
            .insert(header::CONTENT_LENGTH, HeaderValue::from(message.len()));
        response.body = Body::Slice {
            storage: Storage::Memory(Bytes::from_static(message.as_bytes())),
            start: 0,
            len: message.len() as u64,
        };
        response
    }

    /// 400 for paths that cannot be resolved
    pub fn bad_request() -> Self {
        Self::text(StatusCode::BAD_REQUEST, "Bad Request\n")
    }

    /// 405 with `Allow: GET, HEAD`
    pub fn method_not_allowed() -> Self {
        let mut response = Self::text(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed\n");
        response
            .headers
            .insert(header::ALLOW, HeaderValue::from_static("GET, HEAD"));
        response
    }

    /// Redirect to `redirect.location`, carrying the query string over when allowed
    pub fn redirect(redirect: &Redirect, query: Option<&str>, options: &ServeOptions) -> Self {
        let mut location = redirect.location.clone();
        if let Some(query) = query.filter(|q| options.preserve_query_string && !q.is_empty()) {
            location.push('?');
            location.push_str(query);
        }
        let mut response = Self::new(redirect.status);
        insert(&mut response.headers, header::LOCATION, &location);
        if let Some(cache_control) = options.redirect_cache_control() {
            response
                .headers
                .insert(header::CACHE_CONTROL, cache_control.clone());
        }
        response
            .headers
            .insert(header::CONTENT_LENGTH, HeaderValue::from(0u64));
        response
    }

    pub fn header(&self, name: HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

fn insert(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(_) => tracing::warn!("⚠️ Dropping invalid {} header: {:?}", name, value),
    }
}

/// Headers a 304 may carry
const NOT_MODIFIED_HEADERS: [HeaderName; 6] = [
    header::CACHE_CONTROL,
    header::CONTENT_LOCATION,
    header::DATE,
    header::ETAG,
    header::EXPIRES,
    header::VARY,
];

/// Copy `extra` over `headers`, replacing every value of each name it sets
fn override_headers(
    headers: &mut HeaderMap,
    extra: &HeaderMap,
    keep: impl Fn(&HeaderName) -> bool,
) {
    for name in extra.keys().filter(|name| keep(name)) {
        headers.remove(name);
        for value in extra.get_all(name) {
            headers.append(name.clone(), value.clone());
        }
    }
}

/// Entity tags listed in a conditional header
fn entity_tags(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|t| !t.is_empty())
}

/// Weak comparison: `W/` prefixes are ignored
fn weak_match(a: &str, b: &str) -> bool {
    a.trim_start_matches("W/") == b.trim_start_matches("W/")
}

fn not_modified(record: &AssetRecord, request: &Request) -> bool {
    if let Some(if_none_match) = request.header(header::IF_NONE_MATCH) {
        let etag = record.etag_str();
        return entity_tags(if_none_match).any(|tag| tag == "*" || weak_match(tag, etag));
    }
    match (
        request
            .header(header::IF_MODIFIED_SINCE)
            .and_then(|v| httpdate::parse_http_date(v).ok()),
        record.last_modified(),
    ) {
        (Some(since), Some(modified)) => modified <= since,
        _ => false,
    }
}

/// Whether `If-Range` (if any) still allows a partial response
fn if_range_allows(record: &AssetRecord, request: &Request) -> bool {
    let Some(value) = request.header(header::IF_RANGE) else {
        return true;
    };
    let value = value.trim();
    if value.starts_with('"') {
        return value == record.etag_str();
    }
    if value.starts_with("W/") {
        return false;
    }
    let date: Option<SystemTime> = httpdate::parse_http_date(value).ok();
    matches!((date, record.last_modified()), (Some(d), Some(m)) if d == m)
}

/// Decide the response for a GET or HEAD of `record`
pub fn negotiate(record: &AssetRecord, request: &Request, options: &ServeOptions) -> Response {
    if !request.is_read() {
        return Response::method_not_allowed();
    }

    let accept = AcceptEncoding::parse(request.header(header::ACCEPT_ENCODING));
    let variant = select(record, &accept);

    let mut response = Response::new(StatusCode::OK);
    let headers = &mut response.headers;
    if record.has_alternatives() {
        headers.insert(header::VARY, HeaderValue::from_static("Accept-Encoding"));
    }
    headers.insert(header::ETAG, record.etag().clone());
    if let Some(modified) = record.last_modified_header() {
        headers.insert(header::LAST_MODIFIED, modified.clone());
    }
    if let Some(cache_control) = options.cache_control(record.kind()) {
        headers.insert(header::CACHE_CONTROL, cache_control.clone());
    }
    if options.allow_all_origins {
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        );
    }

    if not_modified(record, request) {
        override_headers(headers, record.headers(), |name| NOT_MODIFIED_HEADERS.contains(name));
        response.status = StatusCode::NOT_MODIFIED;
        tracing::debug!("{} {} -> 304", request.method, record.key());
        return response;
    }

    headers.insert(header::CONTENT_TYPE, record.content_type().clone());
    override_headers(headers, record.headers(), |_| true);
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Some(encoding) = variant.encoding {
        headers.insert(
            header::CONTENT_ENCODING,
            HeaderValue::from_static(encoding.name()),
        );
    }

    let total = variant.size;
    let ranges = match request.header(header::RANGE) {
        Some(range) if if_range_allows(record, request) => parse_range(range, total),
        _ => RangeSpec::Ignore,
    };

    match ranges {
        RangeSpec::Unsatisfiable => {
            response.status = StatusCode::RANGE_NOT_SATISFIABLE;
            insert(headers, header::CONTENT_RANGE, &format!("bytes */{}", total));
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(0u64));
        }
        RangeSpec::Satisfiable(ranges) if ranges.len() == 1 => {
            let range = ranges[0];
            response.status = StatusCode::PARTIAL_CONTENT;
            insert(headers, header::CONTENT_RANGE, &range.content_range(total));
            response.body = slice(variant, range);
        }
        RangeSpec::Satisfiable(ranges) if options.multi_range == MultiRangePolicy::Multipart => {
            let content_type = record.content_type().to_str().unwrap_or("application/octet-stream");
            let multipart = Multipart::new(&ranges, content_type, total, record.etag_str());
            response.status = StatusCode::PARTIAL_CONTENT;
            insert(headers, header::CONTENT_TYPE, &multipart.content_type());
            response.body = Body::Multipart {
                storage: variant.storage.clone(),
                parts: multipart.parts,
                closing: multipart.closing,
            };
        }
        _ if total == 0 => {}
        _ => response.body = slice(variant, ByteRange::new(0, total - 1)),
    }

    if response.status != StatusCode::RANGE_NOT_SATISFIABLE {
        response
            .headers
            .insert(header::CONTENT_LENGTH, HeaderValue::from(response.body.len()));
    }
    response.variant = Some(variant.clone());

    tracing::debug!(
        "{} {} -> {} ({}, {} bytes)",
        request.method,
        record.key(),
        response.status.as_u16(),
        variant.encoding_name(),
        response.body.len()
    );

    if request.method == Method::HEAD {
        response.body = Body::Empty;
    }
    response
}

fn slice(variant: &Variant, range: ByteRange) -> Body {
    Body::Slice {
        storage: variant.storage.clone(),
        start: range.start,
        len: range.len(),
    }
}
