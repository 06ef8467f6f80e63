//! Error types for the request scheduler
//!
//! A single public [`Error`] with a [`Kind`] discriminant covers every failure
//! the scheduler can surface: dial/session loss, header decoding, missing
//! content length, sub-request failure, cancellation and use-after-close.

mod constructors;
mod types;

pub(crate) use constructors::*;
pub use types::{Error, Kind, Result};
