//! Fluent client construction.

use std::sync::Arc;

use qfan_client::transport::Dialer;
use qfan_client::{Http3Client, HttpRequest, HttpResponse, SchedulerConfig, Strategy};
use tracing::debug;
use url::Url;

/// Configures and connects a [`Client`].
#[derive(Debug, Clone, Default)]
pub struct ClientBuilder {
    config: SchedulerConfig,
}

impl ClientBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: SchedulerConfig::default(),
        }
    }

    /// Scheduling strategy; defaults to [`Strategy::Parallel`].
    #[must_use]
    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.config.strategy = strategy;
        self
    }

    /// QUIC session cap per origin.
    #[must_use]
    pub fn max_sessions(mut self, max_sessions: usize) -> Self {
        self.config.max_sessions = max_sessions;
        self
    }

    /// In-flight request cap for the round-robin strategy.
    #[must_use]
    pub fn max_parallel_streams(mut self, max_parallel_streams: usize) -> Self {
        self.config.max_parallel_streams = max_parallel_streams;
        self
    }

    /// Never advertise gzip.
    #[must_use]
    pub fn disable_compression(mut self, disable: bool) -> Self {
        self.config.disable_compression = disable;
        self
    }

    /// Upper bound on a response HEADERS frame.
    #[must_use]
    pub fn max_header_bytes(mut self, max_header_bytes: u64) -> Self {
        self.config.max_header_bytes = max_header_bytes;
        self
    }

    /// Read-chunk size used before the first bandwidth sample.
    #[must_use]
    pub fn default_block_size(mut self, default_block_size: u64) -> Self {
        self.config.default_block_size = default_block_size;
        self
    }

    /// Connect over the built-in quiche transport.
    pub fn connect(self, origin: &str) -> qfan_client::Result<Client> {
        debug!(
            target: "qfan",
            origin,
            strategy = self.config.strategy.as_str(),
            "connecting client"
        );
        Ok(Client {
            inner: Http3Client::connect(origin, self.config)?,
        })
    }

    /// Connect over a caller-provided transport.
    pub fn connect_with_dialer(
        self,
        origin: &str,
        dialer: Arc<dyn Dialer>,
    ) -> qfan_client::Result<Client> {
        debug!(
            target: "qfan",
            origin,
            strategy = self.config.strategy.as_str(),
            "connecting client over a caller-provided transport"
        );
        Ok(Client {
            inner: Http3Client::with_dialer(origin, self.config, dialer)?,
        })
    }
}

/// HTTP/3 client bound to one origin.
#[derive(Debug)]
pub struct Client {
    inner: Http3Client,
}

impl Client {
    /// GET `url` and wait for response headers; the body streams behind the
    /// returned response.
    pub async fn get(&self, url: &str) -> qfan_client::Result<HttpResponse> {
        let url = Url::parse(url).map_err(qfan_client::Error::builder)?;
        self.inner.fetch(HttpRequest::get(url)).await
    }

    /// Submit a prepared request.
    pub async fn fetch(&self, request: HttpRequest) -> qfan_client::Result<HttpResponse> {
        self.inner.fetch(request).await
    }

    /// Tear down every session to the origin.
    pub async fn close(&self) -> qfan_client::Result<()> {
        debug!(target: "qfan", origin = %self.inner.origin(), "closing client");
        self.inner.close().await
    }

    /// Scheduler counters.
    #[must_use]
    pub fn stats(&self) -> qfan_client::StatsSnapshot {
        self.inner.stats()
    }
}
