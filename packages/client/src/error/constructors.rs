//! Constructor helpers used throughout the crate.

use std::error::Error as StdError;

use super::types::{Error, Kind};

type BoxError = Box<dyn StdError + Send + Sync>;

pub(crate) fn builder<E: Into<BoxError>>(e: E) -> Error {
    Error::new(Kind::Builder).with(e)
}

pub(crate) fn transport_unavailable<E: Into<BoxError>>(e: E) -> Error {
    Error::new(Kind::TransportUnavailable).with(e)
}

pub(crate) fn header_decode<E: Into<BoxError>>(e: E) -> Error {
    Error::new(Kind::HeaderDecode).with(e)
}

pub(crate) fn frame_too_large(max: u64) -> Error {
    Error::new(Kind::HeaderDecode).with(format!("HEADERS frame too large (max: {max} bytes)"))
}

pub(crate) fn no_content_length() -> Error {
    Error::new(Kind::NoContentLength)
}

pub(crate) fn sub_request_failed<E: Into<BoxError>>(e: E) -> Error {
    Error::new(Kind::SubRequestFailed).with(e)
}

pub(crate) fn canceled() -> Error {
    Error::new(Kind::Canceled)
}

pub(crate) fn closed() -> Error {
    Error::new(Kind::Closed)
}

pub(crate) fn body<E: Into<BoxError>>(e: E) -> Error {
    Error::new(Kind::Body).with(e)
}
