//! Round-robin request scheduler
//!
//! Measurement baseline: a single FIFO of requests handed to sessions in a
//! fixed rotation, capped at `max_parallel_streams` concurrent executions.
//! No response is ever split. Shares the session and body bookkeeping with
//! the parallel strategy but never consults the planner.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use crate::config::SchedulerConfig;
use crate::http::{HttpRequest, HttpResponse};
use crate::scheduler::RequestScheduler;
use crate::scheduler::execute::execute_plain;
use crate::scheduler::request::RequestControlBlock;
use crate::scheduler::session::SessionControlBlock;
use crate::telemetry::SchedulerStats;
use crate::transport::{Dialer, codes};

/// One-request-per-session rotation scheduler.
pub struct RoundRobinRequestScheduler {
    inner: Arc<Inner>,
}

struct Inner {
    authority: String,
    dialer: Arc<dyn Dialer>,
    config: SchedulerConfig,
    stats: Arc<SchedulerStats>,
    state: Mutex<State>,
    admit_tx: mpsc::UnboundedSender<()>,
    shutdown_tx: watch::Sender<bool>,
}

struct State {
    queue: VecDeque<RequestControlBlock>,
    sessions: Vec<Arc<SessionControlBlock>>,
    next_index: usize,
    next_session_id: u64,
    in_flight: usize,
    dialing: usize,
    closed: bool,
}

impl RoundRobinRequestScheduler {
    pub fn new(
        authority: String,
        dialer: Arc<dyn Dialer>,
        config: SchedulerConfig,
        stats: Arc<SchedulerStats>,
    ) -> Arc<Self> {
        let (admit_tx, admit_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let inner = Arc::new(Inner {
            authority,
            dialer,
            config,
            stats,
            state: Mutex::new(State {
                queue: VecDeque::new(),
                sessions: Vec::new(),
                next_index: 0,
                next_session_id: 0,
                in_flight: 0,
                dialing: 0,
                closed: false,
            }),
            admit_tx,
            shutdown_tx,
        });

        tokio::spawn(run(inner.clone(), admit_rx, shutdown_rx));
        for _ in 0..inner.config.max_sessions {
            spawn_dial(inner.clone());
        }

        Arc::new(Self { inner })
    }
}

#[async_trait]
impl RequestScheduler for RoundRobinRequestScheduler {
    async fn submit(&self, request: HttpRequest) -> crate::Result<HttpResponse> {
        let inner = &self.inner;
        inner.stats.record_submitted();

        let (ready_tx, ready_rx) = oneshot::channel();
        let rcb = RequestControlBlock::main(request, ready_tx);
        {
            let mut state = inner.state.lock().expect("scheduler state lock");
            if state.closed {
                inner.stats.record_failed();
                return Err(crate::error::closed());
            }
            state.queue.push_back(rcb);
        }
        let _ = inner.admit_tx.send(());

        match ready_rx.await {
            Ok(result) => result,
            Err(_) => Err(crate::error::closed()),
        }
    }

    async fn close(&self) -> crate::Result<()> {
        let inner = &self.inner;
        let _ = inner.shutdown_tx.send(true);

        let (sessions, queued) = {
            let mut state = inner.state.lock().expect("scheduler state lock");
            state.closed = true;
            (
                state.sessions.drain(..).collect::<Vec<_>>(),
                state.queue.drain(..).collect::<Vec<_>>(),
            )
        };
        for mut rcb in queued {
            inner.stats.record_failed();
            rcb.finish(Err(crate::error::closed()));
        }

        let mut first_error = None;
        for scb in sessions {
            if let Err(e) = scb
                .transport()
                .close_with_error(codes::H3_NO_ERROR, "")
                .await
            {
                warn!(
                    target: "qfan::scheduler",
                    session = scb.id(),
                    error = %e,
                    "session close failed"
                );
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

async fn run(
    inner: Arc<Inner>,
    mut admit_rx: mpsc::UnboundedReceiver<()>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = admit_rx.recv() => {
                if let Some(rcb) = may_execute(&inner) {
                    let inner = inner.clone();
                    tokio::spawn(async move { execute(inner, rcb).await });
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

/// Pop the next request when below the in-flight cap, rotating through the
/// session pool.
fn may_execute(inner: &Arc<Inner>) -> Option<RequestControlBlock> {
    let mut state = inner.state.lock().expect("scheduler state lock");
    if state.closed
        || state.in_flight >= inner.config.max_parallel_streams
        || state.queue.is_empty()
    {
        return None;
    }
    if state.sessions.is_empty() {
        let top_up = state.dialing == 0;
        drop(state);
        if top_up {
            spawn_dial(inner.clone());
        }
        return None;
    }

    let index = state.next_index % state.sessions.len();
    let session = state.sessions[index].clone();
    state.next_index = (state.next_index + 1) % inner.config.max_sessions;
    debug!(
        target: "qfan::scheduler",
        session = session.id(),
        next_index = state.next_index,
        "rotating onto session"
    );

    let mut rcb = state.queue.pop_front()?;
    session.set_busy();
    state.in_flight += 1;
    rcb.designated_session = Some(session);
    Some(rcb)
}

fn spawn_dial(inner: Arc<Inner>) {
    {
        let mut state = inner.state.lock().expect("scheduler state lock");
        if state.closed || state.sessions.len() + state.dialing >= inner.config.max_sessions {
            return;
        }
        state.dialing += 1;
    }
    tokio::spawn(async move {
        match inner.dialer.dial(&inner.authority).await {
            Ok(session) => {
                let mut state = inner.state.lock().expect("scheduler state lock");
                state.dialing -= 1;
                if state.closed {
                    drop(state);
                    tokio::spawn(async move {
                        let _ = session.close_with_error(codes::H3_NO_ERROR, "").await;
                    });
                    return;
                }
                let id = state.next_session_id;
                state.next_session_id += 1;
                state.sessions.push(SessionControlBlock::new(id, session));
                drop(state);
                let _ = inner.admit_tx.send(());
            }
            Err(e) => {
                warn!(target: "qfan::scheduler", error = %e, "dial failed");
                let orphaned = {
                    let mut state = inner.state.lock().expect("scheduler state lock");
                    state.dialing -= 1;
                    if state.sessions.is_empty() && state.dialing == 0 {
                        state.queue.drain(..).collect::<Vec<_>>()
                    } else {
                        Vec::new()
                    }
                };
                for mut rcb in orphaned {
                    inner.stats.record_failed();
                    rcb.finish(Err(crate::error::transport_unavailable(format!(
                        "dial {} failed: {e}",
                        inner.authority
                    ))));
                }
            }
        }
    });
}

async fn execute(inner: Arc<Inner>, rcb: RequestControlBlock) {
    let scb = rcb
        .designated_session
        .clone()
        .expect("request bound to a session");

    execute_plain(
        scb,
        rcb,
        inner.config.disable_compression,
        inner.config.default_block_size,
        inner.admit_tx.clone(),
        inner.stats.clone(),
    )
    .await;

    // the execution slot frees up as soon as headers were handed over; the
    // session itself is released when the body finishes
    {
        let mut state = inner.state.lock().expect("scheduler state lock");
        state.in_flight = state.in_flight.saturating_sub(1);
    }
    let _ = inner.admit_tx.send(());
}
