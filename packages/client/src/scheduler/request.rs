//! Request control block
//!
//! Per-logical-request state carried through the scheduler: the immutable
//! request, whether this is the caller's main request or a byte-range
//! sub-request, the session it was bound to, and the one-shot signal that
//! hands the response (or the failure) back to the submitting caller.

use std::sync::Arc;

use tokio::sync::oneshot;
use url::Url;

use crate::body::{SegmentWriter, SegmentedBody};
use crate::http::{HttpRequest, HttpResponse};
use crate::scheduler::session::SessionControlBlock;

/// Main request, or a byte-range sub-request with inclusive bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Main,
    Sub { start: u64, end: u64 },
}

/// One scheduled request.
pub struct RequestControlBlock {
    pub request: HttpRequest,
    pub kind: RequestKind,
    /// A main request stays eligible until its first split decision; a
    /// sub-request never splits.
    pub eligible_for_split: bool,
    /// Session bound at admission (mains) or assigned by the planner (subs).
    /// `None` on a sub-request means the executor acquires one itself.
    pub designated_session: Option<Arc<SessionControlBlock>>,
    /// The sub-request's pre-registered segment in the parent's body.
    pub segment: Option<SegmentWriter>,
    /// Control handle of the parent's body, used to fail it when a
    /// sub-request dies.
    pub parent_body: Option<SegmentedBody>,
    /// Fired once response headers are available, or with the failure.
    pub ready: Option<oneshot::Sender<crate::Result<HttpResponse>>>,
}

impl RequestControlBlock {
    /// Control block for a caller-submitted main request.
    #[must_use]
    pub fn main(
        request: HttpRequest,
        ready: oneshot::Sender<crate::Result<HttpResponse>>,
    ) -> Self {
        Self {
            request,
            kind: RequestKind::Main,
            eligible_for_split: true,
            designated_session: None,
            segment: None,
            parent_body: None,
            ready: Some(ready),
        }
    }

    /// Control block for a planner-issued byte-range sub-request.
    #[must_use]
    pub fn sub(
        url: Url,
        start: u64,
        end: u64,
        session: Option<Arc<SessionControlBlock>>,
        segment: SegmentWriter,
        parent_body: SegmentedBody,
    ) -> Self {
        Self {
            request: HttpRequest::get(url),
            kind: RequestKind::Sub { start, end },
            eligible_for_split: false,
            designated_session: session,
            segment: Some(segment),
            parent_body: Some(parent_body),
            ready: None,
        }
    }

    /// Resolve the submitting caller, if it is still waiting.
    pub fn finish(&mut self, result: crate::Result<HttpResponse>) {
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(result);
        }
    }
}

impl std::fmt::Debug for RequestControlBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestControlBlock")
            .field("url", &self.request.url().as_str())
            .field("kind", &self.kind)
            .field("eligible_for_split", &self.eligible_for_split)
            .field(
                "designated_session",
                &self.designated_session.as_ref().map(|s| s.id()),
            )
            .finish_non_exhaustive()
    }
}
