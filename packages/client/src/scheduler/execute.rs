//! Single-stream request execution shared by the strategies
//!
//! The round-robin and single-connection schedulers run every request as one
//! plain stream; the parallel scheduler falls back to the same path for
//! responses it cannot split (no usable content length, gzip-encoded). Bodies
//! with a declared length are pumped through a single-segment body so all
//! strategies share the same reader type; the rest pass the stream through.

use std::sync::Arc;
use std::time::Instant;

use http::{Method, header};
use tokio::sync::mpsc;
use tracing::debug;

use crate::body::{SegmentWriter, SegmentedBody};
use crate::http::response::ReleaseFn;
use crate::http::{GzipBody, HttpRequest, HttpResponse, ResponseBody, ResponseHead};
use crate::http::response::DirectBody;
use crate::scheduler::request::RequestControlBlock;
use crate::scheduler::session::SessionControlBlock;
use crate::scheduler::timing;
use crate::telemetry::SchedulerStats;
use crate::transport::{RequestHead, ResponseStream, TransportError, codes};

/// Gzip is advertised only when compression is enabled, the method is not
/// HEAD, and the caller pinned neither `accept-encoding` nor `range`.
#[must_use]
pub(crate) fn wants_gzip(disable_compression: bool, request: &HttpRequest) -> bool {
    !disable_compression
        && request.method() != Method::HEAD
        && request.header_str(&header::ACCEPT_ENCODING).is_empty()
        && request.header_str(&header::RANGE).is_empty()
}

/// H3 error code to abort a stream with after a header-phase failure.
#[must_use]
pub(crate) fn cancel_code_for(e: &TransportError) -> u64 {
    match e {
        TransportError::HeaderTooLarge { .. } => codes::H3_FRAME_ERROR,
        TransportError::HeaderDecode(_) => codes::H3_GENERAL_PROTOCOL_ERROR,
        TransportError::Protocol(_) => codes::H3_FRAME_UNEXPECTED,
        _ => codes::H3_INTERNAL_ERROR,
    }
}

/// One-shot session hand-back: mark idle and wake the admission loop.
#[must_use]
pub(crate) fn session_release(
    scb: Arc<SessionControlBlock>,
    admit: mpsc::UnboundedSender<()>,
) -> ReleaseFn {
    Box::new(move || {
        scb.set_idle();
        let _ = admit.send(());
    })
}

/// Run one request on its designated session and resolve the caller.
pub(crate) async fn execute_plain(
    scb: Arc<SessionControlBlock>,
    mut rcb: RequestControlBlock,
    disable_compression: bool,
    default_block_size: u64,
    admit: mpsc::UnboundedSender<()>,
    stats: Arc<SchedulerStats>,
) {
    let gzip = wants_gzip(disable_compression, &rcb.request);
    let url = rcb.request.url().clone();
    let head = RequestHead::from_request(&rcb.request, gzip);

    let mut stream = match scb.transport().open_request(head).await {
        Ok(stream) => stream,
        Err(e) => {
            stats.record_failed();
            rcb.finish(Err(crate::Error::from(e).with_url(url)));
            session_release(scb, admit)();
            return;
        }
    };

    let head = match stream.read_head().await {
        Ok(head) => head,
        Err(e) => {
            stream.cancel(cancel_code_for(&e));
            stats.record_failed();
            rcb.finish(Err(crate::Error::from(e).with_url(url)));
            session_release(scb, admit)();
            return;
        }
    };

    // HEAD responses carry no body whatever their declared length says
    if *rcb.request.method() == Method::HEAD {
        rcb.finish(Ok(HttpResponse::new(head, ResponseBody::Empty)));
        stats.record_completed();
        session_release(scb, admit)();
        return;
    }

    let response =
        plain_body_response(scb, head, stream, gzip, default_block_size, admit, stats);
    rcb.finish(Ok(response));
}

/// Build the response for a single-stream execution. The session is released
/// when the body finishes (or is abandoned), not when headers arrive.
pub(crate) fn plain_body_response(
    scb: Arc<SessionControlBlock>,
    mut head: ResponseHead,
    stream: Box<dyn ResponseStream>,
    gzip_requested: bool,
    default_block_size: u64,
    admit: mpsc::UnboundedSender<()>,
    stats: Arc<SchedulerStats>,
) -> HttpResponse {
    let release = session_release(scb.clone(), admit);

    if gzip_requested && head.is_gzip() {
        // the encoded length means nothing to the caller once inflated
        head.headers.remove(header::CONTENT_ENCODING);
        head.headers.remove(header::CONTENT_LENGTH);
        let direct = DirectBody::new(stream, Some(release));
        return HttpResponse::new(head, ResponseBody::Gzip(GzipBody::new(direct)));
    }

    match head.content_length() {
        Some(0) => {
            release();
            HttpResponse::new(head, ResponseBody::Empty)
        }
        Some(length) => {
            let body = SegmentedBody::new(length);
            let writer = body.register(0, length - 1);
            let reader = body.reader();
            tokio::spawn(pump_stream(
                scb,
                stream,
                body,
                writer,
                length,
                default_block_size,
                release,
                stats,
            ));
            HttpResponse::new(head, ResponseBody::Segmented(reader))
        }
        None => {
            let direct = DirectBody::new(stream, Some(release));
            HttpResponse::new(head, ResponseBody::Direct(direct))
                .with_error(crate::error::no_content_length())
        }
    }
}

/// Copy a declared-length body from its stream into a single-segment body,
/// measuring throughput along the way.
#[allow(clippy::too_many_arguments)]
async fn pump_stream(
    scb: Arc<SessionControlBlock>,
    mut stream: Box<dyn ResponseStream>,
    body: SegmentedBody,
    writer: SegmentWriter,
    length: u64,
    default_block_size: u64,
    release: ReleaseFn,
    stats: Arc<SchedulerStats>,
) {
    scb.add_remaining(length);
    let block = timing::block_size(scb.bandwidth(), scb.rtt(), default_block_size);
    let mut chunk = vec![0u8; block as usize];
    let mut remaining = length;

    while remaining > 0 {
        let want = remaining.min(block) as usize;
        let started = Instant::now();
        match stream.read_chunk(&mut chunk[..want]).await {
            Ok(0) => {
                body.fail(crate::error::body("response truncated before content length"));
                break;
            }
            Ok(n) => {
                if let Some(bandwidth) = timing::measure_bandwidth(n, started.elapsed()) {
                    scb.set_bandwidth(bandwidth);
                }
                if writer.write(&chunk[..n]).is_err() {
                    debug!(
                        target: "qfan::scheduler",
                        session = scb.id(),
                        "body dropped by caller, canceling stream"
                    );
                    stream.cancel(codes::H3_REQUEST_CANCELLED);
                    break;
                }
                remaining -= n as u64;
                scb.reduce_remaining(n as u64);
                stats.record_bytes(n as u64);
            }
            Err(e) => {
                body.fail(crate::Error::from(e));
                stream.cancel(codes::H3_REQUEST_CANCELLED);
                break;
            }
        }
    }

    if remaining == 0 {
        stats.record_completed();
    }
    scb.reduce_remaining(remaining);
    release();
    body.signal();
}
