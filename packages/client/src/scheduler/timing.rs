//! Block-size policy and transfer-time estimation
//!
//! The unit of a single stream read is derived from the session's
//! bandwidth-delay product, bucketed so per-read overhead stays low without
//! starving the bandwidth measurement. The completion-time estimator prices a
//! hypothetical extra load onto a session that may still be draining earlier
//! bytes.

use std::time::Duration;

/// Fallback read-chunk size when bandwidth or RTT is unknown, 32 KiB.
pub const DEFAULT_BLOCK_SIZE: u64 = 32 * 1024;

/// BDP cut-points (bytes) selecting the block-size buckets. Tunables.
const BDP_BUCKETS: [(f64, u64); 4] = [
    (64.0 * 1024.0, 16 * 1024),
    (256.0 * 1024.0, 32 * 1024),
    (1024.0 * 1024.0, 64 * 1024),
    (4096.0 * 1024.0, 128 * 1024),
];

/// Block size above the largest cut-point, 256 KiB.
const BLOCK_SIZE_MAX: u64 = 256 * 1024;

/// Per-read block size for a session with the given channel estimate.
///
/// `bandwidth` is application-level throughput in bytes per second; `None`
/// (or a zero RTT) yields `fallback`.
#[must_use]
pub fn block_size(bandwidth: Option<f64>, rtt: Duration, fallback: u64) -> u64 {
    let Some(bandwidth) = bandwidth else {
        return fallback;
    };
    if bandwidth <= 0.0 || rtt.is_zero() {
        return fallback;
    }
    let bdp = bandwidth * rtt.as_secs_f64();
    for (limit, size) in BDP_BUCKETS {
        if bdp < limit {
            return size;
        }
    }
    BLOCK_SIZE_MAX
}

/// Estimated seconds until a session finishes `new_bytes` of additional load,
/// given it still owes `remaining` bytes: the session is ready after the
/// larger of one RTT and its current drain time, then transfers the new load.
#[must_use]
pub fn time_to_finish(remaining: u64, bandwidth: f64, rtt_secs: f64, new_bytes: u64) -> f64 {
    let time_to_available = (remaining as f64 / bandwidth).max(rtt_secs);
    time_to_available + new_bytes as f64 / bandwidth
}

/// Application-level throughput of one timed read, bytes per second.
///
/// Sub-microsecond samples are discarded: they measure buffering, not the
/// channel.
#[must_use]
pub fn measure_bandwidth(bytes: usize, elapsed: Duration) -> Option<f64> {
    let micros = elapsed.as_micros();
    if bytes == 0 || micros == 0 {
        return None;
    }
    Some(bytes as f64 / micros as f64 * 1_000_000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_channel_uses_fallback() {
        assert_eq!(
            block_size(None, Duration::from_millis(20), DEFAULT_BLOCK_SIZE),
            DEFAULT_BLOCK_SIZE
        );
        assert_eq!(
            block_size(Some(1e6), Duration::ZERO, DEFAULT_BLOCK_SIZE),
            DEFAULT_BLOCK_SIZE
        );
    }

    #[test]
    fn bdp_buckets_are_monotonic() {
        let rtt = Duration::from_millis(20);
        // 20ms RTT: 1 MiB/s -> ~20 KiB BDP -> smallest bucket
        assert_eq!(block_size(Some(1024.0 * 1024.0), rtt, 0), 16 * 1024);
        // 10 MiB/s -> ~210 KiB BDP
        assert_eq!(block_size(Some(10.0 * 1024.0 * 1024.0), rtt, 0), 32 * 1024);
        // 40 MiB/s -> ~840 KiB BDP
        assert_eq!(block_size(Some(40.0 * 1024.0 * 1024.0), rtt, 0), 64 * 1024);
        // 150 MiB/s -> ~3 MiB BDP
        assert_eq!(
            block_size(Some(150.0 * 1024.0 * 1024.0), rtt, 0),
            128 * 1024
        );
        // 400 MiB/s -> ~8 MiB BDP -> capped
        assert_eq!(
            block_size(Some(400.0 * 1024.0 * 1024.0), rtt, 0),
            256 * 1024
        );
    }

    #[test]
    fn time_to_finish_floors_at_rtt() {
        // nothing queued: readiness costs one RTT
        let t = time_to_finish(0, 1_000_000.0, 0.05, 100_000);
        assert!((t - 0.15).abs() < 1e-9);
        // a long queue dominates the RTT
        let t = time_to_finish(500_000, 1_000_000.0, 0.05, 100_000);
        assert!((t - 0.6).abs() < 1e-9);
    }

    #[test]
    fn bandwidth_sample_needs_measurable_time() {
        assert_eq!(measure_bandwidth(4096, Duration::ZERO), None);
        assert_eq!(measure_bandwidth(0, Duration::from_millis(1)), None);
        let bw = measure_bandwidth(32 * 1024, Duration::from_millis(1)).unwrap();
        assert!((bw - 32.0 * 1024.0 * 1000.0).abs() < 1.0);
    }
}
