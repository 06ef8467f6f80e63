//! Per-origin client facade
//!
//! One `Http3Client` owns one scheduler for one origin. The upper layer is
//! unaware that a submitted request may have been fanned out into byte-range
//! sub-requests across several QUIC sessions; it sees a single response with
//! one ordered body.

use std::sync::Arc;

use tracing::debug;
use url::Url;

use crate::config::{SchedulerConfig, TransportConfig};
use crate::http::{HttpRequest, HttpResponse};
use crate::scheduler::{RequestScheduler, new_request_scheduler};
use crate::telemetry::{SchedulerStats, StatsSnapshot};
use crate::transport::Dialer;
use crate::transport::quiche::QuicheDialer;

/// HTTP/3 client for a single origin.
pub struct Http3Client {
    origin: Url,
    authority: String,
    scheduler: Arc<dyn RequestScheduler>,
    stats: Arc<SchedulerStats>,
}

impl Http3Client {
    /// Client for `origin` over the quiche transport.
    ///
    /// `origin` must be an `https` URL; its path is ignored.
    pub fn connect(origin: &str, config: SchedulerConfig) -> crate::Result<Self> {
        let transport = TransportConfig::default();
        let dialer = {
            let max_header_bytes = config.max_header_bytes;
            Arc::new(QuicheDialer::new(transport, max_header_bytes))
        };
        Self::with_dialer(origin, config, dialer)
    }

    /// Client with a caller-provided transport, used by tests and by
    /// embedders that bring their own session layer.
    pub fn with_dialer(
        origin: &str,
        config: SchedulerConfig,
        dialer: Arc<dyn Dialer>,
    ) -> crate::Result<Self> {
        config.validate().map_err(crate::error::builder)?;
        let origin = Url::parse(origin).map_err(crate::error::builder)?;
        if origin.scheme() != "https" {
            return Err(crate::error::builder(format!(
                "unsupported scheme: {}",
                origin.scheme()
            ))
            .with_url(origin));
        }
        if origin.host_str().is_none() {
            return Err(crate::error::builder("origin has no host").with_url(origin));
        }

        let authority = match origin.port() {
            Some(port) => format!("{}:{port}", origin.host_str().unwrap_or_default()),
            None => origin.host_str().unwrap_or_default().to_string(),
        };
        let stats = Arc::new(SchedulerStats::new());
        let scheduler =
            new_request_scheduler(authority.clone(), dialer, config.clone(), stats.clone());
        debug!(
            target: "qfan::client",
            origin = %origin,
            strategy = config.strategy.as_str(),
            "client ready"
        );

        Ok(Self {
            origin,
            authority,
            scheduler,
            stats,
        })
    }

    /// Origin this client talks to.
    #[must_use]
    pub fn origin(&self) -> &Url {
        &self.origin
    }

    /// Submit one request and wait for its response headers; the body streams
    /// behind the returned response.
    ///
    /// A request that could not reach the origin at all resolves to the
    /// synthetic `404 Not Found` the original deployment reported, with the
    /// transport error recorded on the response.
    pub async fn fetch(&self, request: HttpRequest) -> crate::Result<HttpResponse> {
        if request.url().scheme() != "https" {
            return Err(crate::error::builder(format!(
                "unsupported scheme: {}",
                request.url().scheme()
            ))
            .with_url(request.url().clone()));
        }
        if request.authority() != self.authority {
            return Err(crate::error::builder(format!(
                "request for {} submitted to the {} client",
                request.authority(),
                self.authority
            ))
            .with_url(request.url().clone()));
        }

        let url = request.url().clone();
        match self.scheduler.submit(request).await {
            Ok(response) => Ok(response),
            Err(e) if e.is_transport_unavailable() => {
                debug!(
                    target: "qfan::client",
                    url = %url,
                    "no session to origin, reporting synthetic 404"
                );
                Ok(HttpResponse::synthetic_not_found(&url))
            }
            Err(e) => Err(e),
        }
    }

    /// Tear down every session to the origin. Subsequent `fetch` calls fail.
    pub async fn close(&self) -> crate::Result<()> {
        self.scheduler.close().await
    }

    /// Counters for this client's scheduler.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

impl std::fmt::Debug for Http3Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Http3Client")
            .field("origin", &self.origin.as_str())
            .finish_non_exhaustive()
    }
}
