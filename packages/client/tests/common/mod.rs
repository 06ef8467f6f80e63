//! Scripted in-memory transport for scheduler tests.
//!
//! A `MockOrigin` holds the resources of one origin and a log of everything
//! the scheduler did to it: streams opened (with their byte ranges), streams
//! served to completion, cancellations, session closes. Chunk service is
//! paced with a configurable delay so the scheduler's bandwidth measurement
//! sees a finite channel, and `rtt()` reports a configured value without
//! sleeping.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, StatusCode, header};
use qfan_client::http::ResponseHead;
use qfan_client::transport::{
    Dialer, RequestHead, ResponseStream, Session, TransportError,
};

/// One observable interaction with the origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Open {
        seq: u64,
        session: u64,
        path: String,
        range: Option<(u64, u64)>,
    },
    /// The stream delivered its last byte.
    Served {
        seq: u64,
        session: u64,
        path: String,
        range: Option<(u64, u64)>,
    },
    Cancel {
        seq: u64,
        session: u64,
        path: String,
        code: u64,
    },
    SessionClosed {
        seq: u64,
        session: u64,
        code: u64,
    },
}

struct OriginState {
    resources: Mutex<HashMap<String, Bytes>>,
    /// Paths served without a `Content-Length` header.
    no_length: Mutex<HashSet<String>>,
    /// Paths served with `Content-Encoding: gzip` (stored pre-compressed).
    gzip_paths: Mutex<HashSet<String>>,
    /// Paths whose HEADERS frame exceeds the configured cap.
    oversized_headers: Mutex<HashSet<String>>,
    /// Byte-range requests against this path die after serving N bytes.
    fail_range_after: Mutex<Option<(String, usize)>>,
    rtt: Mutex<Duration>,
    chunk_delay: Mutex<Duration>,
    chunk_size: Mutex<usize>,
    max_header_bytes: u64,
    log: Mutex<Vec<Event>>,
    seq: AtomicU64,
    session_seq: AtomicU64,
}

impl OriginState {
    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    fn push(&self, event: Event) {
        self.log.lock().unwrap().push(event);
    }
}

/// A scripted origin plus the dialer handing out sessions to it.
#[derive(Clone)]
pub struct MockOrigin {
    state: Arc<OriginState>,
}

impl MockOrigin {
    pub fn new() -> Self {
        Self {
            state: Arc::new(OriginState {
                resources: Mutex::new(HashMap::new()),
                no_length: Mutex::new(HashSet::new()),
                gzip_paths: Mutex::new(HashSet::new()),
                oversized_headers: Mutex::new(HashSet::new()),
                fail_range_after: Mutex::new(None),
                rtt: Mutex::new(Duration::from_millis(5)),
                chunk_delay: Mutex::new(Duration::from_millis(1)),
                chunk_size: Mutex::new(32 * 1024),
                max_header_bytes: 10 * (1 << 20),
                log: Mutex::new(Vec::new()),
                seq: AtomicU64::new(0),
                session_seq: AtomicU64::new(0),
            }),
        }
    }

    pub fn insert(&self, path: &str, body: Bytes) {
        self.state
            .resources
            .lock()
            .unwrap()
            .insert(path.to_string(), body);
    }

    pub fn insert_without_length(&self, path: &str, body: Bytes) {
        self.insert(path, body);
        self.state
            .no_length
            .lock()
            .unwrap()
            .insert(path.to_string());
    }

    /// Store `body` gzip-compressed and mark the path as encoded.
    pub fn insert_gzip(&self, path: &str, body: &[u8]) {
        use flate2::Compression;
        use flate2::write::GzEncoder;
        use std::io::Write;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(body).unwrap();
        let encoded = encoder.finish().unwrap();
        self.insert(path, Bytes::from(encoded));
        self.state
            .gzip_paths
            .lock()
            .unwrap()
            .insert(path.to_string());
    }

    pub fn serve_oversized_headers(&self, path: &str) {
        self.insert(path, Bytes::new());
        self.state
            .oversized_headers
            .lock()
            .unwrap()
            .insert(path.to_string());
    }

    pub fn fail_range_requests_after(&self, path: &str, bytes: usize) {
        *self.state.fail_range_after.lock().unwrap() = Some((path.to_string(), bytes));
    }

    pub fn set_rtt(&self, rtt: Duration) {
        *self.state.rtt.lock().unwrap() = rtt;
    }

    pub fn set_chunk_delay(&self, delay: Duration) {
        *self.state.chunk_delay.lock().unwrap() = delay;
    }

    pub fn set_chunk_size(&self, size: usize) {
        *self.state.chunk_size.lock().unwrap() = size;
    }

    pub fn dialer(&self) -> Arc<dyn Dialer> {
        Arc::new(MockDialer {
            state: self.state.clone(),
        })
    }

    /// A dialer whose every attempt fails.
    pub fn failing_dialer(&self) -> Arc<dyn Dialer> {
        Arc::new(FailingDialer)
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.log.lock().unwrap().clone()
    }

    /// Open events for `path`, in sequence order.
    pub fn opens(&self, path: &str) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| matches!(e, Event::Open { path: p, .. } if p == path))
            .collect()
    }

    /// Byte ranges requested against `path`, sorted by start offset.
    pub fn ranges_requested(&self, path: &str) -> Vec<(u64, u64)> {
        let mut ranges: Vec<(u64, u64)> = self
            .opens(path)
            .into_iter()
            .filter_map(|e| match e {
                Event::Open { range, .. } => range,
                _ => None,
            })
            .collect();
        ranges.sort_unstable();
        ranges
    }

    /// Sequence number of the first event matching `pred`.
    pub fn seq_of(&self, pred: impl Fn(&Event) -> bool) -> Option<u64> {
        self.events().into_iter().find(|e| pred(e)).map(|e| match e {
            Event::Open { seq, .. }
            | Event::Served { seq, .. }
            | Event::Cancel { seq, .. }
            | Event::SessionClosed { seq, .. } => seq,
        })
    }

    pub fn cancel_codes(&self) -> Vec<u64> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Cancel { code, .. } => Some(code),
                _ => None,
            })
            .collect()
    }
}

struct MockDialer {
    state: Arc<OriginState>,
}

#[async_trait]
impl Dialer for MockDialer {
    async fn dial(&self, _authority: &str) -> Result<Arc<dyn Session>, TransportError> {
        let id = self.state.session_seq.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockSession {
            id,
            state: self.state.clone(),
        }))
    }
}

struct FailingDialer;

#[async_trait]
impl Dialer for FailingDialer {
    async fn dial(&self, authority: &str) -> Result<Arc<dyn Session>, TransportError> {
        Err(TransportError::Dial(format!("{authority}: unreachable")))
    }
}

struct MockSession {
    id: u64,
    state: Arc<OriginState>,
}

#[async_trait]
impl Session for MockSession {
    async fn open_request(
        &self,
        head: RequestHead,
    ) -> Result<Box<dyn ResponseStream>, TransportError> {
        let path = head.url.path().to_string();
        let range = parse_range(&head.headers);
        self.state.push(Event::Open {
            seq: self.state.next_seq(),
            session: self.id,
            path: path.clone(),
            range,
        });

        let full = self
            .state
            .resources
            .lock()
            .unwrap()
            .get(&path)
            .cloned();
        let oversized = self
            .state
            .oversized_headers
            .lock()
            .unwrap()
            .contains(&path);

        let (status, slice) = match (&full, range) {
            (None, _) => (StatusCode::NOT_FOUND, Bytes::new()),
            (Some(body), Some((start, end))) => {
                let end = (end as usize).min(body.len().saturating_sub(1));
                (
                    StatusCode::PARTIAL_CONTENT,
                    body.slice(start as usize..=end),
                )
            }
            (Some(body), None) => (StatusCode::OK, body.clone()),
        };

        let mut headers = HeaderMap::new();
        let no_length = range.is_none()
            && self.state.no_length.lock().unwrap().contains(&path);
        if !no_length {
            headers.insert(
                header::CONTENT_LENGTH,
                slice.len().to_string().parse().unwrap(),
            );
        }
        if range.is_none() && self.state.gzip_paths.lock().unwrap().contains(&path) {
            headers.insert(header::CONTENT_ENCODING, "gzip".parse().unwrap());
        }

        let fail_after = match (&*self.state.fail_range_after.lock().unwrap(), range) {
            (Some((failing_path, bytes)), Some(_)) if *failing_path == path => Some(*bytes),
            _ => None,
        };

        Ok(Box::new(MockStream {
            state: self.state.clone(),
            session: self.id,
            path,
            range,
            head: ResponseHead::new(status, headers),
            oversized,
            slice,
            served: 0,
            fail_after,
            canceled: false,
            done_logged: false,
            rtt: *self.state.rtt.lock().unwrap(),
            chunk_delay: *self.state.chunk_delay.lock().unwrap(),
            chunk_size: *self.state.chunk_size.lock().unwrap(),
        }))
    }

    fn rtt(&self) -> Duration {
        *self.state.rtt.lock().unwrap()
    }

    async fn close_with_error(&self, code: u64, _reason: &str) -> Result<(), TransportError> {
        self.state.push(Event::SessionClosed {
            seq: self.state.next_seq(),
            session: self.id,
            code,
        });
        Ok(())
    }
}

struct MockStream {
    state: Arc<OriginState>,
    session: u64,
    path: String,
    range: Option<(u64, u64)>,
    head: ResponseHead,
    oversized: bool,
    slice: Bytes,
    served: usize,
    fail_after: Option<usize>,
    canceled: bool,
    done_logged: bool,
    rtt: Duration,
    chunk_delay: Duration,
    chunk_size: usize,
}

#[async_trait]
impl ResponseStream for MockStream {
    async fn read_head(&mut self) -> Result<ResponseHead, TransportError> {
        tokio::time::sleep(self.rtt).await;
        if self.oversized {
            return Err(TransportError::HeaderTooLarge {
                max: self.state.max_header_bytes,
            });
        }
        Ok(self.head.clone())
    }

    async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if self.canceled {
            return Err(TransportError::Canceled);
        }
        if self.served >= self.slice.len() {
            self.log_served();
            return Ok(0);
        }
        tokio::time::sleep(self.chunk_delay).await;
        if self.canceled {
            return Err(TransportError::Canceled);
        }
        if let Some(limit) = self.fail_after {
            if self.served >= limit {
                return Err(TransportError::Reset(0x1));
            }
        }

        let mut n = buf
            .len()
            .min(self.chunk_size)
            .min(self.slice.len() - self.served);
        if let Some(limit) = self.fail_after {
            n = n.min(limit - self.served);
        }
        buf[..n].copy_from_slice(&self.slice[self.served..self.served + n]);
        self.served += n;
        if self.served >= self.slice.len() {
            self.log_served();
        }
        Ok(n)
    }

    fn cancel(&mut self, code: u64) {
        self.canceled = true;
        self.state.push(Event::Cancel {
            seq: self.state.next_seq(),
            session: self.session,
            path: self.path.clone(),
            code,
        });
    }
}

impl MockStream {
    fn log_served(&mut self) {
        if self.done_logged {
            return;
        }
        self.done_logged = true;
        self.state.push(Event::Served {
            seq: self.state.next_seq(),
            session: self.session,
            path: self.path.clone(),
            range: self.range,
        });
    }
}

fn parse_range(headers: &HeaderMap) -> Option<(u64, u64)> {
    let value = headers.get(header::RANGE)?.to_str().ok()?;
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

/// Deterministic pseudo-random body.
pub fn patterned_body(len: usize) -> Bytes {
    let mut out = Vec::with_capacity(len);
    let mut state = 0x2545F491u32;
    for _ in 0..len {
        state = state.wrapping_mul(1664525).wrapping_add(1013904223);
        out.push((state >> 24) as u8);
    }
    Bytes::from(out)
}
