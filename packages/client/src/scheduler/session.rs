//! Session control block
//!
//! Per-QUIC-session bookkeeping for the scheduler: a stable id, the
//! busy/idle request count, outstanding bytes across assigned requests, and
//! the latest observed throughput. All mutation goes through one short mutex;
//! RTT is delegated to the transport. A session may carry at most one main
//! request at a time; it is dispatchable while `pending < 1`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::scheduler::planner::SessionSnapshot;
use crate::transport::Session;

struct SessionState {
    pending: u32,
    remaining: u64,
    bandwidth: Option<f64>,
}

/// Scheduler-side wrapper of one QUIC session.
pub struct SessionControlBlock {
    id: u64,
    transport: Arc<dyn Session>,
    state: Mutex<SessionState>,
}

impl SessionControlBlock {
    #[must_use]
    pub fn new(id: u64, transport: Arc<dyn Session>) -> Arc<Self> {
        Arc::new(Self {
            id,
            transport,
            state: Mutex::new(SessionState {
                pending: 0,
                remaining: 0,
                bandwidth: None,
            }),
        })
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn transport(&self) -> Arc<dyn Session> {
        self.transport.clone()
    }

    /// Assign one more request to this session.
    pub fn set_busy(&self) {
        let mut state = self.state.lock().expect("session state lock");
        state.pending += 1;
    }

    /// Release one request. Saturates at zero.
    pub fn set_idle(&self) {
        let mut state = self.state.lock().expect("session state lock");
        state.pending = state.pending.saturating_sub(1);
    }

    /// True while the session can take a new request.
    #[must_use]
    pub fn dispatchable(&self) -> bool {
        let state = self.state.lock().expect("session state lock");
        state.pending < 1
    }

    #[must_use]
    pub fn pending(&self) -> u32 {
        self.state.lock().expect("session state lock").pending
    }

    pub fn add_remaining(&self, bytes: u64) {
        let mut state = self.state.lock().expect("session state lock");
        state.remaining += bytes;
    }

    /// Saturates at zero.
    pub fn reduce_remaining(&self, bytes: u64) {
        let mut state = self.state.lock().expect("session state lock");
        state.remaining = state.remaining.saturating_sub(bytes);
    }

    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.state.lock().expect("session state lock").remaining
    }

    #[must_use]
    pub fn bandwidth(&self) -> Option<f64> {
        self.state.lock().expect("session state lock").bandwidth
    }

    pub fn set_bandwidth(&self, bandwidth: f64) {
        let mut state = self.state.lock().expect("session state lock");
        state.bandwidth = Some(bandwidth);
    }

    /// Latest RTT estimate from the transport.
    #[must_use]
    pub fn rtt(&self) -> Duration {
        self.transport.rtt()
    }

    /// Channel snapshot for the split planner.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.lock().expect("session state lock");
        SessionSnapshot {
            id: self.id,
            remaining: state.remaining,
            bandwidth: state.bandwidth,
            rtt_secs: self.transport.rtt().as_secs_f64(),
        }
    }
}

impl std::fmt::Debug for SessionControlBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().expect("session state lock");
        f.debug_struct("SessionControlBlock")
            .field("id", &self.id)
            .field("pending", &state.pending)
            .field("remaining", &state.remaining)
            .field("bandwidth", &state.bandwidth)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{RequestHead, ResponseStream, TransportError};
    use async_trait::async_trait;

    struct NoopSession;

    #[async_trait]
    impl Session for NoopSession {
        async fn open_request(
            &self,
            _head: RequestHead,
        ) -> Result<Box<dyn ResponseStream>, TransportError> {
            Err(TransportError::Closed("noop".into()))
        }

        fn rtt(&self) -> Duration {
            Duration::from_millis(20)
        }

        async fn close_with_error(&self, _code: u64, _reason: &str) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn block() -> Arc<SessionControlBlock> {
        SessionControlBlock::new(7, Arc::new(NoopSession))
    }

    #[test]
    fn dispatchable_tracks_pending() {
        let scb = block();
        assert!(scb.dispatchable());
        scb.set_busy();
        assert!(!scb.dispatchable());
        scb.set_idle();
        assert!(scb.dispatchable());
    }

    #[test]
    fn set_idle_saturates_at_zero() {
        let scb = block();
        scb.set_idle();
        scb.set_idle();
        assert_eq!(scb.pending(), 0);
        assert!(scb.dispatchable());
    }

    #[test]
    fn remaining_saturates_at_zero() {
        let scb = block();
        scb.add_remaining(100);
        scb.reduce_remaining(300);
        assert_eq!(scb.remaining(), 0);
    }

    #[test]
    fn snapshot_reflects_channel_state() {
        let scb = block();
        scb.add_remaining(4096);
        scb.set_bandwidth(1_000_000.0);
        let snap = scb.snapshot();
        assert_eq!(snap.id, 7);
        assert_eq!(snap.remaining, 4096);
        assert_eq!(snap.bandwidth, Some(1_000_000.0));
        assert!((snap.rtt_secs - 0.02).abs() < 1e-9);
    }
}
