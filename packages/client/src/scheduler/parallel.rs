//! Parallel request scheduler
//!
//! The default strategy for one origin. Requests are classified into four
//! priority queues (document, stylesheet, script, other) and bound to idle
//! QUIC sessions from an eagerly dialed pool. While a response streams in on
//! its main session, the scheduler measures throughput and may hand the tail
//! of the transfer to sibling sessions as byte-range sub-requests; the
//! segmented body reassembles the ranges into one in-order reader. When a
//! transfer drops below two blocks of remaining data, its session is handed
//! back one RTT early so the next queued request overlaps the tail.
//!
//! The event loop reacts to exactly three signals: "a request or session may
//! be available", "sub-requests to dispatch", and shutdown. Requests and
//! sub-requests each run on their own task; the loop never blocks on I/O.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use http::Method;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};
use url::Url;

use crate::body::{SegmentWriter, SegmentedBody};
use crate::config::SchedulerConfig;
use crate::http::{HttpRequest, HttpResponse, ResponseBody, classify};
use crate::scheduler::RequestScheduler;
use crate::scheduler::execute::{cancel_code_for, plain_body_response, wants_gzip};
use crate::scheduler::planner::{SessionSnapshot, SplitContext, plan_split};
use crate::scheduler::request::{RequestControlBlock, RequestKind};
use crate::scheduler::session::SessionControlBlock;
use crate::scheduler::timing;
use crate::telemetry::SchedulerStats;
use crate::transport::{Dialer, RequestHead, ResponseStream, codes};

use async_trait::async_trait;

const QUEUE_COUNT: usize = 4;

/// Byte-range splitting scheduler for one origin.
pub struct ParallelRequestScheduler {
    inner: Arc<Inner>,
}

struct Inner {
    authority: String,
    dialer: Arc<dyn Dialer>,
    config: SchedulerConfig,
    stats: Arc<SchedulerStats>,
    state: Mutex<SchedulerState>,
    /// "A request or an idle session may be available."
    admit_tx: mpsc::UnboundedSender<()>,
    /// Sub-requests produced by a split decision, to be dispatched.
    sub_requests_tx: mpsc::UnboundedSender<Vec<RequestControlBlock>>,
    shutdown_tx: watch::Sender<bool>,
}

struct SchedulerState {
    /// Priority queues in [`classify::ResourceClass`] order.
    queues: [VecDeque<RequestControlBlock>; QUEUE_COUNT],
    sessions: Vec<Arc<SessionControlBlock>>,
    next_session_id: u64,
    /// Dial workers currently in flight.
    dialing: usize,
    closed: bool,
}

impl ParallelRequestScheduler {
    /// Build the scheduler, spawn its event loop, and start dialing the
    /// session pool so the first request can already fan out.
    pub fn new(
        authority: String,
        dialer: Arc<dyn Dialer>,
        config: SchedulerConfig,
        stats: Arc<SchedulerStats>,
    ) -> Arc<Self> {
        let (admit_tx, admit_rx) = mpsc::unbounded_channel();
        let (sub_requests_tx, sub_requests_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let inner = Arc::new(Inner {
            authority,
            dialer,
            config,
            stats,
            state: Mutex::new(SchedulerState {
                queues: std::array::from_fn(|_| VecDeque::new()),
                sessions: Vec::new(),
                next_session_id: 0,
                dialing: 0,
                closed: false,
            }),
            admit_tx,
            sub_requests_tx,
            shutdown_tx,
        });

        tokio::spawn(run(inner.clone(), admit_rx, sub_requests_rx, shutdown_rx));
        for _ in 0..inner.config.max_sessions {
            spawn_dial(inner.clone());
        }

        Arc::new(Self { inner })
    }
}

#[async_trait]
impl RequestScheduler for ParallelRequestScheduler {
    async fn submit(&self, request: HttpRequest) -> crate::Result<HttpResponse> {
        let inner = &self.inner;
        inner.stats.record_submitted();

        let class = classify::classify(request.url());
        let (ready_tx, ready_rx) = oneshot::channel();
        let rcb = RequestControlBlock::main(request, ready_tx);
        {
            let mut state = inner.state.lock().expect("scheduler state lock");
            if state.closed {
                inner.stats.record_failed();
                return Err(crate::error::closed());
            }
            state.queues[class.index()].push_back(rcb);
        }
        debug!(target: "qfan::scheduler", class = ?class, "request queued");
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
            let sessions: Vec<_> = state.sessions.drain(..).collect();
            let mut queued = Vec::new();
            for queue in &mut state.queues {
                queued.extend(queue.drain(..));
            }
            (sessions, queued)
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

/// The scheduler's event loop.
async fn run(
    inner: Arc<Inner>,
    mut admit_rx: mpsc::UnboundedReceiver<()>,
    mut sub_requests_rx: mpsc::UnboundedReceiver<Vec<RequestControlBlock>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = admit_rx.recv() => {
                if let Some(rcb) = may_execute(&inner) {
                    let inner = inner.clone();
                    tokio::spawn(async move { execute_main(inner, rcb).await });
                }
            }
            subs = sub_requests_rx.recv() => {
                if let Some(subs) = subs {
                    for rcb in subs {
                        let inner = inner.clone();
                        tokio::spawn(async move { execute_sub(inner, rcb).await });
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
    debug!(target: "qfan::scheduler", "event loop stopped");
}

/// Bind the highest-priority queued request to an idle session, if both
/// exist. The request stays queued until a session is secured, so a dropped
/// admit signal never loses work.
fn may_execute(inner: &Arc<Inner>) -> Option<RequestControlBlock> {
    let mut state = inner.state.lock().expect("scheduler state lock");
    if state.closed {
        return None;
    }
    let queue_index = state.queues.iter().position(|q| !q.is_empty())?;

    let session = state
        .sessions
        .iter()
        .find(|s| s.dispatchable())
        .cloned();
    let Some(session) = session else {
        let top_up = state.sessions.len() + state.dialing < inner.config.max_sessions;
        drop(state);
        if top_up {
            spawn_dial(inner.clone());
        }
        return None;
    };

    let mut rcb = state.queues[queue_index].pop_front()?;
    session.set_busy();
    rcb.designated_session = Some(session);
    Some(rcb)
}

/// Dial one more session in the background, respecting the pool cap.
fn spawn_dial(inner: Arc<Inner>) {
    {
        let mut state = inner.state.lock().expect("scheduler state lock");
        if state.closed || state.sessions.len() + state.dialing >= inner.config.max_sessions {
            return;
        }
        state.dialing += 1;
    }
    tokio::spawn(async move {
        let result = inner.dialer.dial(&inner.authority).await;
        match result {
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
                debug!(target: "qfan::scheduler", session = id, "session established");
                let _ = inner.admit_tx.send(());
            }
            Err(e) => {
                warn!(target: "qfan::scheduler", error = %e, "dial failed");
                let orphaned = {
                    let mut state = inner.state.lock().expect("scheduler state lock");
                    state.dialing -= 1;
                    if state.sessions.is_empty() && state.dialing == 0 {
                        let mut orphaned = Vec::new();
                        for queue in &mut state.queues {
                            orphaned.extend(queue.drain(..));
                        }
                        orphaned
                    } else {
                        Vec::new()
                    }
                };
                // no session and none coming: everything queued fails
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

/// Hand a session back to the pool and wake the admission loop.
fn release_session(inner: &Arc<Inner>, scb: &Arc<SessionControlBlock>) {
    scb.set_idle();
    let _ = inner.admit_tx.send(());
}

fn find_session(inner: &Arc<Inner>, id: u64) -> Option<Arc<SessionControlBlock>> {
    let state = inner.state.lock().expect("scheduler state lock");
    state.sessions.iter().find(|s| s.id() == id).cloned()
}

/// Pool snapshot for the split planner: dispatchable siblings plus the count
/// of session slots not opened yet.
fn planner_pool(inner: &Arc<Inner>, main_id: u64) -> (Vec<SessionSnapshot>, usize) {
    let state = inner.state.lock().expect("scheduler state lock");
    let siblings = state
        .sessions
        .iter()
        .filter(|s| s.id() != main_id && s.dispatchable())
        .map(|s| s.snapshot())
        .collect();
    let unopened = inner
        .config
        .max_sessions
        .saturating_sub(state.sessions.len() + state.dialing);
    (siblings, unopened)
}

/// Execute one main request on its designated session.
async fn execute_main(inner: Arc<Inner>, mut rcb: RequestControlBlock) {
    let scb = rcb
        .designated_session
        .clone()
        .expect("main request bound to a session");
    let url = rcb.request.url().clone();
    let gzip = wants_gzip(inner.config.disable_compression, &rcb.request);
    let head = RequestHead::from_request(&rcb.request, gzip);

    let mut stream = match scb.transport().open_request(head).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(
                target: "qfan::scheduler",
                session = scb.id(),
                error = %e,
                "opening request stream failed"
            );
            inner.stats.record_failed();
            rcb.finish(Err(crate::Error::from(e).with_url(url)));
            release_session(&inner, &scb);
            return;
        }
    };

    let head = match stream.read_head().await {
        Ok(head) => head,
        Err(e) => {
            stream.cancel(cancel_code_for(&e));
            inner.stats.record_failed();
            rcb.finish(Err(crate::Error::from(e).with_url(url)));
            release_session(&inner, &scb);
            return;
        }
    };

    // HEAD responses carry no body whatever their declared length says
    if *rcb.request.method() == Method::HEAD {
        rcb.finish(Ok(HttpResponse::new(head, ResponseBody::Empty)));
        release_session(&inner, &scb);
        inner.stats.record_completed();
        return;
    }

    // A response without a usable content length (a gzip-encoded body
    // included) cannot be split: it passes through on this session alone.
    let content_length = if gzip && head.is_gzip() {
        None
    } else {
        head.content_length()
    };
    let Some(content_length) = content_length else {
        let response = plain_body_response(
            scb,
            head,
            stream,
            gzip,
            inner.config.default_block_size,
            inner.admit_tx.clone(),
            inner.stats.clone(),
        );
        rcb.finish(Ok(response));
        return;
    };

    let body = SegmentedBody::new(content_length);
    if content_length == 0 {
        rcb.finish(Ok(HttpResponse::new(
            head,
            ResponseBody::Segmented(body.reader()),
        )));
        release_session(&inner, &scb);
        inner.stats.record_completed();
        return;
    }

    scb.add_remaining(content_length);
    let writer = body.register(0, content_length - 1);
    let eligible = rcb.eligible_for_split && *rcb.request.method() == Method::GET;
    rcb.finish(Ok(HttpResponse::new(
        head,
        ResponseBody::Segmented(body.reader()),
    )));

    main_read_loop(
        inner,
        scb,
        stream,
        body,
        writer,
        content_length,
        eligible,
        url,
    )
    .await;
}

/// The main request's read loop: block-sized reads, bandwidth measurement,
/// the one-shot prestart release, and at most one split decision.
#[allow(clippy::too_many_arguments)]
async fn main_read_loop(
    inner: Arc<Inner>,
    scb: Arc<SessionControlBlock>,
    mut stream: Box<dyn ResponseStream>,
    body: SegmentedBody,
    writer: SegmentWriter,
    content_length: u64,
    mut eligible: bool,
    url: Url,
) {
    let mut remaining = content_length;
    let mut received: u64 = 0;
    let mut idle_released = false;
    let mut shrunk = false;

    let block = timing::block_size(
        scb.bandwidth(),
        scb.rtt(),
        inner.config.default_block_size,
    );

    // Small responses skip the split machinery; the session frees up before
    // the body finishes streaming.
    if content_length < 2 * block {
        release_session(&inner, &scb);
        idle_released = true;
        eligible = false;
    }

    let mut chunk = vec![0u8; block as usize];
    while remaining > 0 {
        let want = remaining.min(block) as usize;
        let started = Instant::now();
        let n = match stream.read_chunk(&mut chunk[..want]).await {
            Ok(0) => {
                body.fail(
                    crate::error::body("response truncated before content length")
                        .with_url(url.clone()),
                );
                scb.reduce_remaining(remaining);
                if !idle_released {
                    release_session(&inner, &scb);
                }
                inner.stats.record_failed();
                return;
            }
            Ok(n) => n,
            Err(e) => {
                body.fail(crate::Error::from(e).with_url(url.clone()));
                stream.cancel(codes::H3_REQUEST_CANCELLED);
                scb.reduce_remaining(remaining);
                if !idle_released {
                    release_session(&inner, &scb);
                }
                inner.stats.record_failed();
                return;
            }
        };

        if let Some(bandwidth) = timing::measure_bandwidth(n, started.elapsed()) {
            scb.set_bandwidth(bandwidth);
        }
        if writer.write(&chunk[..n]).is_err() {
            // the caller dropped the body
            debug!(
                target: "qfan::scheduler",
                session = scb.id(),
                url = %url,
                "body dropped by caller, canceling stream"
            );
            stream.cancel(codes::H3_REQUEST_CANCELLED);
            scb.reduce_remaining(remaining);
            if !idle_released {
                release_session(&inner, &scb);
            }
            return;
        }

        remaining -= n as u64;
        received += n as u64;
        scb.reduce_remaining(n as u64);
        inner.stats.record_bytes(n as u64);
        if remaining == 0 {
            break;
        }

        // Prestart: hand the session back one RTT before the tail finishes,
        // exactly once per request.
        if !idle_released && remaining <= 2 * block {
            idle_released = true;
            inner.stats.record_prestart();
            debug!(
                target: "qfan::scheduler",
                session = scb.id(),
                remaining,
                "prestart: session released early"
            );
            release_session(&inner, &scb);
        }

        if eligible {
            if let Some(bandwidth) = scb.bandwidth() {
                // one split decision per request, split or not
                eligible = false;
                let (siblings, unopened) = planner_pool(&inner, scb.id());
                let ctx = SplitContext {
                    received,
                    remaining,
                    content_length,
                    block_size: block,
                    bandwidth,
                    rtt_secs: scb.rtt().as_secs_f64(),
                    max_sessions: inner.config.max_sessions,
                    siblings,
                    unopened,
                };
                if let Some(plan) = plan_split(&ctx) {
                    inner.stats.record_split();
                    let handed_off = content_length - plan.main_new_end;
                    body.set_segment_bounds(0, content_length - 1, 0, plan.main_new_end - 1);

                    let mut subs = Vec::with_capacity(plan.ranges.len());
                    for range in &plan.ranges {
                        let segment = body.register(range.start, range.end);
                        let session = range.session.and_then(|id| find_session(&inner, id));
                        subs.push(RequestControlBlock::sub(
                            url.clone(),
                            range.start,
                            range.end,
                            session,
                            segment,
                            body.clone(),
                        ));
                    }
                    remaining = plan.main_new_end - received;
                    scb.reduce_remaining(handed_off);
                    shrunk = true;
                    inner.stats.record_sub_requests(subs.len() as u64);
                    debug!(
                        target: "qfan::scheduler",
                        url = %url,
                        sub_requests = subs.len(),
                        main_new_end = plan.main_new_end,
                        "response split across sessions"
                    );
                    let _ = inner.sub_requests_tx.send(subs);
                }
            }
        }
    }

    if shrunk {
        // the server still owes the handed-off tail on this stream
        stream.cancel(codes::H3_REQUEST_CANCELLED);
    }
    if !idle_released {
        release_session(&inner, &scb);
    }
    body.signal();
    inner.stats.record_completed();
}

/// Execute one planner-issued byte-range sub-request. Sub-requests never
/// split further; a failure here is fatal to the parent request.
async fn execute_sub(inner: Arc<Inner>, mut rcb: RequestControlBlock) {
    let RequestKind::Sub { start, end } = rcb.kind else {
        return;
    };
    let body = rcb
        .parent_body
        .take()
        .expect("sub-request carries the parent body");
    let writer = rcb.segment.take().expect("sub-request carries a segment");
    let url = rcb.request.url().clone();

    let scb = match rcb.designated_session.take() {
        Some(scb) => {
            scb.set_busy();
            scb
        }
        None => match acquire_session(&inner).await {
            Ok(scb) => scb,
            Err(e) => {
                inner.stats.record_failed();
                body.fail(crate::error::sub_request_failed(e).with_url(url));
                return;
            }
        },
    };
    debug!(
        target: "qfan::scheduler",
        session = scb.id(),
        start,
        end,
        url = %url,
        "executing sub-request"
    );

    let head = RequestHead::range_get(url.clone(), start, end);
    let mut stream = match scb.transport().open_request(head).await {
        Ok(stream) => stream,
        Err(e) => {
            inner.stats.record_failed();
            body.fail(crate::error::sub_request_failed(e).with_url(url));
            release_session(&inner, &scb);
            return;
        }
    };

    let head = match stream.read_head().await {
        Ok(head) => head,
        Err(e) => {
            stream.cancel(cancel_code_for(&e));
            inner.stats.record_failed();
            body.fail(crate::error::sub_request_failed(e).with_url(url));
            release_session(&inner, &scb);
            return;
        }
    };

    // the slice must declare exactly the requested range
    let expected = end - start + 1;
    if head.content_length() != Some(expected) {
        stream.cancel(codes::H3_FRAME_UNEXPECTED);
        inner.stats.record_failed();
        body.fail(
            crate::error::sub_request_failed(format!(
                "range response declared {:?} bytes, expected {expected}",
                head.content_length()
            ))
            .with_url(url),
        );
        release_session(&inner, &scb);
        return;
    }

    scb.add_remaining(expected);
    let block = timing::block_size(
        scb.bandwidth(),
        scb.rtt(),
        inner.config.default_block_size,
    );
    let mut chunk = vec![0u8; block as usize];
    let mut remaining = expected;
    let mut idle_released = false;

    while remaining > 0 {
        let want = remaining.min(block) as usize;
        let started = Instant::now();
        let n = match stream.read_chunk(&mut chunk[..want]).await {
            Ok(0) => {
                body.fail(
                    crate::error::sub_request_failed("range response truncated")
                        .with_url(url.clone()),
                );
                scb.reduce_remaining(remaining);
                if !idle_released {
                    release_session(&inner, &scb);
                }
                inner.stats.record_failed();
                return;
            }
            Ok(n) => n,
            Err(e) => {
                body.fail(crate::error::sub_request_failed(e).with_url(url.clone()));
                stream.cancel(codes::H3_REQUEST_CANCELLED);
                scb.reduce_remaining(remaining);
                if !idle_released {
                    release_session(&inner, &scb);
                }
                inner.stats.record_failed();
                return;
            }
        };

        if let Some(bandwidth) = timing::measure_bandwidth(n, started.elapsed()) {
            scb.set_bandwidth(bandwidth);
        }
        if writer.write(&chunk[..n]).is_err() {
            stream.cancel(codes::H3_REQUEST_CANCELLED);
            scb.reduce_remaining(remaining);
            if !idle_released {
                release_session(&inner, &scb);
            }
            return;
        }
        remaining -= n as u64;
        scb.reduce_remaining(n as u64);
        inner.stats.record_bytes(n as u64);
        if remaining == 0 {
            break;
        }

        if !idle_released && remaining <= 2 * block {
            idle_released = true;
            inner.stats.record_prestart();
            release_session(&inner, &scb);
        }
    }

    if !idle_released {
        release_session(&inner, &scb);
    }
    body.signal();
    inner.stats.record_sub_request_completed();
}

/// Find a dispatchable session for a planner range that named none, dialing a
/// fresh one when the pool has room.
async fn acquire_session(inner: &Arc<Inner>) -> Result<Arc<SessionControlBlock>, crate::Error> {
    {
        let mut state = inner.state.lock().expect("scheduler state lock");
        if state.closed {
            return Err(crate::error::closed());
        }
        if let Some(scb) = state.sessions.iter().find(|s| s.dispatchable()).cloned() {
            scb.set_busy();
            return Ok(scb);
        }
        if state.sessions.len() + state.dialing >= inner.config.max_sessions {
            return Err(crate::error::transport_unavailable("no available session"));
        }
        state.dialing += 1;
    }

    match inner.dialer.dial(&inner.authority).await {
        Ok(session) => {
            let closed = {
                let mut state = inner.state.lock().expect("scheduler state lock");
                state.dialing -= 1;
                state.closed
            };
            if closed {
                let _ = session.close_with_error(codes::H3_NO_ERROR, "").await;
                return Err(crate::error::closed());
            }
            let mut state = inner.state.lock().expect("scheduler state lock");
            let id = state.next_session_id;
            state.next_session_id += 1;
            let scb = SessionControlBlock::new(id, session);
            scb.set_busy();
            state.sessions.push(scb.clone());
            Ok(scb)
        }
        Err(e) => {
            let mut state = inner.state.lock().expect("scheduler state lock");
            state.dialing -= 1;
            drop(state);
            Err(crate::error::transport_unavailable(e))
        }
    }
}
