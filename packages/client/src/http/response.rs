//! Response head and streaming body types
//!
//! A response is handed to the caller as soon as its headers are decoded; the
//! body keeps streaming afterwards. Depending on how the response is served
//! the body is either a segmented reader fed by one or more sessions, a
//! direct passthrough of a single stream, or a gzip-decoding wrapper.

use http::{HeaderMap, StatusCode, Version, header};
use url::Url;

use crate::body::BodyReader;
use crate::error::Kind;
use crate::http::compression::GzipBody;
use crate::transport::{ResponseStream, codes};

/// Decoded response headers, as delivered by the HTTP/3 layer.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

impl ResponseHead {
    #[must_use]
    pub fn new(status: StatusCode, headers: HeaderMap) -> Self {
        Self { status, headers }
    }

    /// Parsed `Content-Length`, if present and well-formed.
    #[must_use]
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    }

    /// True when the body is gzip-encoded.
    #[must_use]
    pub fn is_gzip(&self) -> bool {
        self.headers
            .get(header::CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("gzip"))
    }
}

/// Callback fired once when a body finishes or is abandoned, used to hand the
/// carrying session back to the scheduler.
pub(crate) type ReleaseFn = Box<dyn FnOnce() + Send>;

/// Body passthrough of a single response stream.
pub struct DirectBody {
    stream: Option<Box<dyn ResponseStream>>,
    release: Option<ReleaseFn>,
    finished: bool,
}

impl DirectBody {
    pub(crate) fn new(stream: Box<dyn ResponseStream>, release: Option<ReleaseFn>) -> Self {
        Self {
            stream: Some(stream),
            release,
            finished: false,
        }
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> crate::Result<usize> {
        if self.finished || buf.is_empty() {
            return Ok(0);
        }
        let Some(stream) = self.stream.as_mut() else {
            return Ok(0);
        };
        match stream.read_chunk(buf).await {
            Ok(0) => {
                self.finish();
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(e) => {
                self.finish();
                Err(e.into())
            }
        }
    }

    /// Abort the stream if it has not finished and release the session.
    pub fn close(&mut self) {
        if !self.finished {
            if let Some(stream) = self.stream.as_mut() {
                stream.cancel(codes::H3_REQUEST_CANCELLED);
            }
        }
        self.finish();
        self.stream = None;
    }

    fn finish(&mut self) {
        self.finished = true;
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for DirectBody {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for DirectBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectBody")
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

/// The streaming body of an [`HttpResponse`].
#[derive(Debug)]
pub enum ResponseBody {
    /// In-order reader over segments written by one or more sessions.
    Segmented(BodyReader),
    /// Single-stream passthrough.
    Direct(DirectBody),
    /// Gzip-decoding passthrough.
    Gzip(GzipBody),
    /// No body.
    Empty,
}

/// An HTTP/3 response: status and headers up front, body streamed behind.
#[derive(Debug)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
    error: Option<crate::Error>,
    body: ResponseBody,
}

impl HttpResponse {
    pub(crate) fn new(head: ResponseHead, body: ResponseBody) -> Self {
        Self {
            status: head.status,
            version: Version::HTTP_3,
            headers: head.headers,
            error: None,
            body,
        }
    }

    /// Record a non-fatal error on the response; the body stays consumable.
    pub(crate) fn with_error(mut self, error: crate::Error) -> Self {
        self.error = Some(error);
        self
    }

    /// Synthetic `404 Not Found` produced when no session to the origin could
    /// serve the request.
    pub(crate) fn synthetic_not_found(url: &Url) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            version: Version::HTTP_3,
            headers: HeaderMap::new(),
            error: Some(
                crate::Error::new(Kind::TransportUnavailable).with_url(url.clone()),
            ),
            body: ResponseBody::Empty,
        }
    }

    /// Error recorded while constructing this response, if any.
    #[must_use]
    pub fn error(&self) -> Option<&crate::Error> {
        self.error.as_ref()
    }

    /// Parsed `Content-Length` of the delivered body, if declared.
    #[must_use]
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    }

    /// Read body bytes in response order. `Ok(0)` is end of body.
    pub async fn read(&mut self, buf: &mut [u8]) -> crate::Result<usize> {
        match &mut self.body {
            ResponseBody::Segmented(reader) => reader.read(buf).await,
            ResponseBody::Direct(direct) => direct.read(buf).await,
            ResponseBody::Gzip(gzip) => gzip.read(buf).await,
            ResponseBody::Empty => Ok(0),
        }
    }

    /// Drain the whole body into memory.
    pub async fn read_to_end(&mut self) -> crate::Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut chunk = vec![0u8; 16 * 1024];
        loop {
            let n = self.read(&mut chunk).await?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&chunk[..n]);
        }
    }

    /// Stop consuming the body. In-flight streams feeding it are aborted with
    /// the request-canceled code.
    pub fn close(&mut self) {
        match &mut self.body {
            ResponseBody::Segmented(reader) => reader.close(),
            ResponseBody::Direct(direct) => direct.close(),
            ResponseBody::Gzip(gzip) => gzip.close(),
            ResponseBody::Empty => {}
        }
    }
}
