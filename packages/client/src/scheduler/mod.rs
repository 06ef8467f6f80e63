//! Request scheduling strategies
//!
//! Every strategy exposes the same two-operation surface: `submit` admits one
//! logical request and resolves once response headers are available, `close`
//! tears the origin's sessions down. Three implementations ship:
//!
//! - [`parallel::ParallelRequestScheduler`]: splits large responses into
//!   byte-range sub-requests across sibling sessions (the default),
//! - [`round_robin::RoundRobinRequestScheduler`]: one request per session in
//!   a fixed rotation, no splitting,
//! - [`single_connection::SingleConnectionScheduler`]: multiplexes every
//!   request on one session.
//!
//! The latter two exist as measurement baselines; they share the session and
//! body bookkeeping but skip the split planner.

pub(crate) mod execute;
pub mod parallel;
pub mod planner;
pub mod request;
pub mod round_robin;
pub mod session;
pub mod single_connection;
pub mod timing;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{SchedulerConfig, Strategy};
use crate::http::{HttpRequest, HttpResponse};
use crate::telemetry::SchedulerStats;
use crate::transport::Dialer;

/// The uniform scheduler capability.
#[async_trait]
pub trait RequestScheduler: Send + Sync {
    /// Admit a request; resolves when response headers are available (the
    /// body streams afterwards) or with the failure.
    async fn submit(&self, request: HttpRequest) -> crate::Result<HttpResponse>;

    /// Tear down every session. Idempotent; subsequent `submit` calls fail.
    async fn close(&self) -> crate::Result<()>;
}

/// Instantiate the configured strategy for one origin.
#[must_use]
pub fn new_request_scheduler(
    authority: String,
    dialer: Arc<dyn Dialer>,
    config: SchedulerConfig,
    stats: Arc<SchedulerStats>,
) -> Arc<dyn RequestScheduler> {
    match config.strategy {
        Strategy::Parallel => {
            parallel::ParallelRequestScheduler::new(authority, dialer, config, stats)
        }
        Strategy::RoundRobin => {
            round_robin::RoundRobinRequestScheduler::new(authority, dialer, config, stats)
        }
        Strategy::SingleConnection => {
            single_connection::SingleConnectionScheduler::new(authority, dialer, config, stats)
        }
    }
}
