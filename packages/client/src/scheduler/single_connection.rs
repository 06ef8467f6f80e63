//! Single-connection request scheduler
//!
//! Measurement baseline: one QUIC session to the origin, every request
//! multiplexed as a concurrent stream up to `max_concurrent_streams`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::warn;

use crate::config::SchedulerConfig;
use crate::http::{HttpRequest, HttpResponse};
use crate::scheduler::RequestScheduler;
use crate::scheduler::execute::execute_plain;
use crate::scheduler::request::RequestControlBlock;
use crate::scheduler::session::SessionControlBlock;
use crate::telemetry::SchedulerStats;
use crate::transport::{Dialer, codes};

/// All-streams-on-one-session scheduler.
pub struct SingleConnectionScheduler {
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
    session: Option<Arc<SessionControlBlock>>,
    in_flight: usize,
    dialing: bool,
    closed: bool,
}

impl SingleConnectionScheduler {
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
                session: None,
                in_flight: 0,
                dialing: false,
                closed: false,
            }),
            admit_tx,
            shutdown_tx,
        });

        tokio::spawn(run(inner.clone(), admit_rx, shutdown_rx));
        spawn_dial(inner.clone());

        Arc::new(Self { inner })
    }
}

#[async_trait]
impl RequestScheduler for SingleConnectionScheduler {
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

        let (session, queued) = {
            let mut state = inner.state.lock().expect("scheduler state lock");
            state.closed = true;
            (
                state.session.take(),
                state.queue.drain(..).collect::<Vec<_>>(),
            )
        };
        for mut rcb in queued {
            inner.stats.record_failed();
            rcb.finish(Err(crate::error::closed()));
        }

        if let Some(scb) = session {
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
                return Err(e.into());
            }
        }
        Ok(())
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

fn may_execute(inner: &Arc<Inner>) -> Option<RequestControlBlock> {
    let mut state = inner.state.lock().expect("scheduler state lock");
    if state.closed
        || state.in_flight >= inner.config.max_concurrent_streams
        || state.queue.is_empty()
    {
        return None;
    }
    let Some(session) = state.session.clone() else {
        let top_up = !state.dialing;
        drop(state);
        if top_up {
            spawn_dial(inner.clone());
        }
        return None;
    };

    let mut rcb = state.queue.pop_front()?;
    session.set_busy();
    state.in_flight += 1;
    rcb.designated_session = Some(session);
    Some(rcb)
}

fn spawn_dial(inner: Arc<Inner>) {
    {
        let mut state = inner.state.lock().expect("scheduler state lock");
        if state.closed || state.session.is_some() || state.dialing {
            return;
        }
        state.dialing = true;
    }
    tokio::spawn(async move {
        match inner.dialer.dial(&inner.authority).await {
            Ok(session) => {
                let mut state = inner.state.lock().expect("scheduler state lock");
                state.dialing = false;
                if state.closed {
                    drop(state);
                    tokio::spawn(async move {
                        let _ = session.close_with_error(codes::H3_NO_ERROR, "").await;
                    });
                    return;
                }
                state.session = Some(SessionControlBlock::new(0, session));
                drop(state);
                let _ = inner.admit_tx.send(());
            }
            Err(e) => {
                warn!(target: "qfan::scheduler", error = %e, "dial failed");
                let orphaned = {
                    let mut state = inner.state.lock().expect("scheduler state lock");
                    state.dialing = false;
                    state.queue.drain(..).collect::<Vec<_>>()
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

    {
        let mut state = inner.state.lock().expect("scheduler state lock");
        state.in_flight = state.in_flight.saturating_sub(1);
    }
    let _ = inner.admit_tx.send(());
}
