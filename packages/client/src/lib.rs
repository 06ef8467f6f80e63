//! # qfan_client
//!
//! Parallel HTTP/3 request scheduler: the implementation crate behind `qfan`.
//!
//! For a single origin, the scheduler opportunistically splits a large
//! response across several QUIC sessions using HTTP byte-range sub-requests
//! and reassembles the bytes into one in-order streaming body. At runtime it
//! decides, from observed bandwidth and RTT, whether fanning a transfer out
//! actually shortens it; it also hands a session back to the pool one RTT
//! before its transfer completes so the next queued request overlaps the
//! tail.
//!
//! Layout:
//!
//! - [`scheduler`]: the strategy boundary, the parallel scheduler and its
//!   round-robin / single-connection baselines, the split planner, session
//!   and request control blocks, block-size policy
//! - [`body`]: the segmented response body assembling out-of-order ranges
//! - [`transport`]: the narrow QUIC/HTTP-3 contracts and the quiche-backed
//!   production transport
//! - [`http`]: request/response model, resource classification, gzip
//! - [`client`]: the per-origin facade
//! - [`config`], [`error`], [`telemetry`]: the supporting surface

pub mod body;
pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod scheduler;
pub mod telemetry;
pub mod transport;

pub use client::Http3Client;
pub use config::{SchedulerConfig, Strategy, TransportConfig};
pub use error::{Error, Kind, Result};
pub use http::{HttpRequest, HttpResponse, ResourceClass};
pub use telemetry::StatsSnapshot;
