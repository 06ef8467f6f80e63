use std::error::Error as StdError;
use std::fmt;

/// A Result alias where the Err case is `qfan_client::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// Represents errors that can occur while scheduling and streaming requests.
#[derive(Clone)]
pub struct Error {
    inner: Box<Inner>,
}

pub(crate) struct Inner {
    pub(crate) kind: Kind,
    pub(crate) source: Option<Box<dyn StdError + Send + Sync>>,
    pub(crate) url: Option<url::Url>,
}

impl Clone for Inner {
    fn clone(&self) -> Self {
        Inner {
            kind: self.kind.clone(),
            source: None, // trait objects cannot be cloned, the source is dropped
            url: self.url.clone(),
        }
    }
}

/// Failure classification for a scheduled request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Kind {
    /// Invalid input before any request was admitted.
    Builder,
    /// Dial failed or the QUIC session went away.
    TransportUnavailable,
    /// Malformed HEADERS frame, QPACK failure, or a frame over the size cap.
    HeaderDecode,
    /// The main response carried no usable `Content-Length`.
    NoContentLength,
    /// A byte-range sub-request failed; fatal to the parent request.
    SubRequestFailed,
    /// The caller abandoned the request; streams were aborted both ways.
    Canceled,
    /// The scheduler was closed before or during this request.
    Closed,
    /// Response body error after headers were delivered.
    Body,
}

impl Error {
    /// Invalid caller input, surfaced before any request is admitted.
    #[must_use]
    pub fn builder<E: Into<Box<dyn StdError + Send + Sync>>>(source: E) -> Error {
        Error::new(Kind::Builder).with(source)
    }

    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(Inner {
                kind,
                source: None,
                url: None,
            }),
        }
    }

    #[must_use = "Error builder methods return a new Error and should be used"]
    pub(crate) fn with<E: Into<Box<dyn StdError + Send + Sync>>>(mut self, source: E) -> Error {
        self.inner.source = Some(source.into());
        self
    }

    #[must_use]
    pub fn with_url(mut self, url: url::Url) -> Self {
        self.inner.url = Some(url);
        self
    }

    /// Failure classification of this error.
    #[must_use]
    pub fn kind(&self) -> &Kind {
        &self.inner.kind
    }

    /// URL associated with this error, if any.
    #[must_use]
    pub fn url(&self) -> Option<&url::Url> {
        self.inner.url.as_ref()
    }

    /// True when the caller cancelled the request.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        matches!(self.inner.kind, Kind::Canceled)
    }

    /// True when no session to the origin could be used.
    #[must_use]
    pub fn is_transport_unavailable(&self) -> bool {
        matches!(self.inner.kind, Kind::TransportUnavailable)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_struct("qfan::Error");

        f.field("kind", &self.inner.kind);

        if let Some(ref source) = self.inner.source {
            f.field("source", source);
        }

        if let Some(ref url) = self.inner.url {
            f.field("url", url);
        }

        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner.kind {
            Kind::Builder => f.write_str("builder error")?,
            Kind::TransportUnavailable => f.write_str("no session to origin available")?,
            Kind::HeaderDecode => f.write_str("error decoding response headers")?,
            Kind::NoContentLength => f.write_str("response has no content length")?,
            Kind::SubRequestFailed => f.write_str("byte-range sub-request failed")?,
            Kind::Canceled => f.write_str("request canceled")?,
            Kind::Closed => f.write_str("scheduler closed")?,
            Kind::Body => f.write_str("response body error")?,
        }

        if let Some(ref url) = self.inner.url {
            write!(f, " for url ({url})")?;
        }

        if let Some(ref source) = self.inner.source {
            write!(f, ": {source}")?;
        }

        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .source
            .as_ref()
            .map(|e| &**e as &(dyn StdError + 'static))
    }
}
