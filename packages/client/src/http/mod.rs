//! HTTP request/response model
//!
//! Request and response types shared by every scheduling strategy, resource
//! classification for the priority queues, and streaming gzip decoding for
//! compressed responses.

pub mod classify;
pub mod compression;
pub mod request;
pub mod response;

pub use classify::ResourceClass;
pub use compression::GzipBody;
pub use request::HttpRequest;
pub use response::{DirectBody, HttpResponse, ResponseBody, ResponseHead};
