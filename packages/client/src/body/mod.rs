//! Streaming response body assembly
//!
//! Out-of-order byte ranges arriving from several QUIC sessions are stitched
//! into a single in-order reader here.

pub mod segmented;

pub use segmented::{BodyClosed, BodyReader, SegmentWriter, SegmentedBody};
