//! QUIC transport boundary
//!
//! The scheduler consumes the QUIC/HTTP-3 stack through three narrow
//! capabilities: a [`Dialer`] that opens sessions to an origin, a [`Session`]
//! that opens request streams and reports the connection RTT, and a
//! [`ResponseStream`] that yields decoded response headers and body bytes and
//! can be cancelled in both directions. The production implementation wraps
//! quiche (`transport::quiche`); tests substitute scripted implementations.

pub mod quiche;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, header};
use thiserror::Error;
use url::Url;

use crate::http::{HttpRequest, ResponseHead};

/// HTTP/3 application error codes (RFC 9114 §8.1).
pub mod codes {
    pub const H3_NO_ERROR: u64 = 0x100;
    pub const H3_GENERAL_PROTOCOL_ERROR: u64 = 0x101;
    pub const H3_INTERNAL_ERROR: u64 = 0x102;
    pub const H3_FRAME_UNEXPECTED: u64 = 0x105;
    pub const H3_FRAME_ERROR: u64 = 0x106;
    pub const H3_EXCESSIVE_LOAD: u64 = 0x107;
    pub const H3_REQUEST_CANCELLED: u64 = 0x10C;
    pub const H3_REQUEST_INCOMPLETE: u64 = 0x10D;
}

/// Errors produced at the transport boundary.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("dial failed: {0}")]
    Dial(String),
    #[error("session closed: {0}")]
    Closed(String),
    #[error("stream reset by peer: code {0:#x}")]
    Reset(u64),
    #[error("HEADERS frame too large (max: {max} bytes)")]
    HeaderTooLarge { max: u64 },
    #[error("header decode failed: {0}")]
    HeaderDecode(String),
    #[error("h3 protocol error: {0}")]
    Protocol(String),
    #[error("request canceled")]
    Canceled,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<TransportError> for crate::Error {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Dial(_) | TransportError::Closed(_) => {
                crate::error::transport_unavailable(e)
            }
            TransportError::HeaderTooLarge { max } => crate::error::frame_too_large(max),
            TransportError::HeaderDecode(_) | TransportError::Protocol(_) => {
                crate::error::header_decode(e)
            }
            TransportError::Canceled => crate::error::canceled(),
            TransportError::Reset(_) | TransportError::Io(_) => crate::error::body(e),
        }
    }
}

/// A serialized view of one outgoing request, ready for the HTTP/3 layer.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    /// Advertise `accept-encoding: gzip` when writing the request.
    pub gzip: bool,
}

impl RequestHead {
    /// Head for a main request.
    #[must_use]
    pub fn from_request(request: &HttpRequest, gzip: bool) -> Self {
        Self {
            method: request.method().clone(),
            url: request.url().clone(),
            headers: request.headers().clone(),
            body: request.body().cloned(),
            gzip,
        }
    }

    /// Head for a byte-range sub-request: a bare GET with an inclusive
    /// `Range: bytes=<start>-<end>` header. Never compressed.
    #[must_use]
    pub fn range_get(url: Url, start: u64, end: u64) -> Self {
        let mut headers = HeaderMap::new();
        if let Ok(value) = format!("bytes={start}-{end}").parse() {
            headers.insert(header::RANGE, value);
        }
        Self {
            method: Method::GET,
            url,
            headers,
            body: None,
            gzip: false,
        }
    }
}

/// Opens QUIC sessions to one origin. ALPN is forced to `h3` by every
/// implementation; TLS configuration passes through unchanged.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, authority: &str) -> Result<Arc<dyn Session>, TransportError>;
}

/// One QUIC session to the origin.
#[async_trait]
pub trait Session: Send + Sync {
    /// Open a bidirectional stream, write the request on it, and return the
    /// response side.
    async fn open_request(
        &self,
        head: RequestHead,
    ) -> Result<Box<dyn ResponseStream>, TransportError>;

    /// Most recent RTT estimate reported by the transport.
    fn rtt(&self) -> Duration;

    /// Tear the session down with an application error code.
    async fn close_with_error(&self, code: u64, reason: &str) -> Result<(), TransportError>;
}

/// The response side of one request stream.
#[async_trait]
pub trait ResponseStream: Send {
    /// Read and decode the response HEADERS frame. Enforces the configured
    /// HEADERS size cap and fails with [`TransportError::HeaderTooLarge`]
    /// beyond it.
    async fn read_head(&mut self) -> Result<ResponseHead, TransportError>;

    /// Read body bytes into `buf`; `Ok(0)` means the stream finished cleanly.
    async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Abort the stream in both directions with an application error code.
    fn cancel(&mut self, code: u64);
}
