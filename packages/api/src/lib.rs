//! # qfan
//!
//! HTTP/3 client that splits large responses across parallel QUIC sessions.
//!
//! For each origin the client keeps a small pool of QUIC sessions. While a
//! response streams in, the scheduler watches bandwidth and RTT and may fan
//! the remaining bytes out as HTTP byte-range sub-requests on sibling
//! sessions; the caller always sees one ordered body. Requests are admitted
//! page-load style: documents before stylesheets before scripts before
//! everything else, and a finishing transfer frees its session one RTT early
//! so the next request overlaps the tail.
//!
//! ## Usage
//!
//! ```no_run
//! use qfan::Qfan;
//!
//! # async fn run() -> qfan::Result<()> {
//! let client = Qfan::builder()
//!     .max_sessions(4)
//!     .connect("https://example.com")?;
//!
//! let mut response = client.get("https://example.com/large.bin").await?;
//! let body = response.read_to_end().await?;
//! println!("{} bytes over HTTP/3", body.len());
//!
//! client.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! The implementation lives in `qfan_client`; this crate is the public
//! surface.

mod builder;

pub use builder::{Client, ClientBuilder};
pub use qfan_client::{
    Error, HttpRequest, HttpResponse, Kind, ResourceClass, Result, SchedulerConfig, StatsSnapshot,
    Strategy, TransportConfig,
};

/// Entry point mirroring the builder.
#[derive(Debug, Clone, Copy, Default)]
pub struct Qfan;

impl Qfan {
    /// Start configuring a client.
    #[must_use]
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Client for `origin` with default configuration.
    pub fn connect(origin: &str) -> Result<Client> {
        ClientBuilder::new().connect(origin)
    }
}
