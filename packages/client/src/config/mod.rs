//! Scheduler and transport configuration
//!
//! Plain configuration structs with `Default` impls and explicit validation,
//! consumed once at client construction. Transport values are handed through
//! to the QUIC layer unchanged; the scheduler only forces ALPN to `h3`.

use std::time::Duration;

/// Request scheduling strategy for one origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Split large responses into byte-range sub-requests across sessions.
    #[default]
    Parallel,
    /// One request per session in a fixed rotation, no splitting.
    RoundRobin,
    /// Multiplex every request on a single session.
    SingleConnection,
}

impl Strategy {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Parallel => "parallel",
            Strategy::RoundRobin => "round-robin",
            Strategy::SingleConnection => "single-connection",
        }
    }
}

/// Scheduler configuration for one origin.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Scheduling strategy to instantiate.
    pub strategy: Strategy,
    /// Never advertise gzip on outgoing requests.
    pub disable_compression: bool,
    /// Upper bound on a response HEADERS frame.
    pub max_header_bytes: u64,
    /// QUIC session cap per origin.
    pub max_sessions: usize,
    /// In-flight request cap for the round-robin strategy.
    pub max_parallel_streams: usize,
    /// Concurrent stream cap for the single-connection strategy.
    pub max_concurrent_streams: usize,
    /// Read-chunk size used when no bandwidth/RTT sample exists yet.
    pub default_block_size: u64,
}

/// Default HEADERS frame cap, 10 MiB.
const DEFAULT_MAX_HEADER_BYTES: u64 = 10 * (1 << 20);

/// Default per-origin session cap.
const DEFAULT_MAX_SESSIONS: usize = 4;

/// Default round-robin in-flight cap.
const DEFAULT_MAX_PARALLEL_STREAMS: usize = 4;

/// Default single-connection stream cap.
const DEFAULT_MAX_CONCURRENT_STREAMS: usize = 20;

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::Parallel,
            disable_compression: false,
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
            max_sessions: DEFAULT_MAX_SESSIONS,
            max_parallel_streams: DEFAULT_MAX_PARALLEL_STREAMS,
            max_concurrent_streams: DEFAULT_MAX_CONCURRENT_STREAMS,
            default_block_size: crate::scheduler::timing::DEFAULT_BLOCK_SIZE,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_sessions == 0 {
            return Err("max_sessions must be greater than 0".to_string());
        }
        if self.max_parallel_streams == 0 {
            return Err("max_parallel_streams must be greater than 0".to_string());
        }
        if self.max_concurrent_streams == 0 {
            return Err("max_concurrent_streams must be greater than 0".to_string());
        }
        if self.default_block_size < 4096 {
            return Err("default_block_size must be at least 4096".to_string());
        }
        if self.max_header_bytes == 0 {
            return Err("max_header_bytes must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// QUIC transport parameters, passed through to the session layer.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub idle_timeout: Duration,
    pub max_udp_payload_size: u16,
    pub initial_max_data: u64,
    pub initial_max_stream_data: u64,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
    /// Verify the origin's certificate chain.
    pub verify_peer: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30),
            max_udp_payload_size: 1452,
            initial_max_data: 10_485_760,           // 10MB
            initial_max_stream_data: 1_048_576,     // 1MB
            initial_max_streams_bidi: 100,
            initial_max_streams_uni: 100,
            verify_peer: true,
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.idle_timeout.is_zero() {
            return Err("idle_timeout must be greater than 0".to_string());
        }
        if self.max_udp_payload_size < 1200 {
            return Err("max_udp_payload_size must be at least 1200".to_string());
        }
        if self.initial_max_data == 0 {
            return Err("initial_max_data must be greater than 0".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(SchedulerConfig::default().validate().is_ok());
        assert!(TransportConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_sessions() {
        let cfg = SchedulerConfig {
            max_sessions: 0,
            ..SchedulerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_small_udp_payload() {
        let cfg = TransportConfig {
            max_udp_payload_size: 512,
            ..TransportConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
