//! Segmented response body
//!
//! The body of a split response is an ordered list of buffer segments, each
//! tagged with its absolute byte range. Writers (the main request and its
//! byte-range sub-requests) fill their own segments in parallel; a single
//! reader walks the segments in ascending offset order and blocks on a
//! data-arrived signal whenever the segment under its cursor has no bytes
//! buffered yet.
//!
//! Locking: every segment buffer has its own mutex so writers never contend
//! with each other; the cursor, total-read counter and segment list live
//! under one body-level lock. No lock is held across an await point. Writers
//! never block on the reader; a segment's buffer may grow to hold its whole
//! declared range.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

/// Error returned to a writer once the reader has gone away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BodyClosed;

impl std::fmt::Display for BodyClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("response body closed")
    }
}

impl std::error::Error for BodyClosed {}

/// One buffer segment covering an absolute, inclusive byte range.
struct Segment {
    /// `(start, end)` inclusive; the end moves once when the split planner
    /// shrinks the main segment.
    bounds: Mutex<(u64, u64)>,
    /// Bytes written so far, appended in wire order.
    buf: Mutex<Vec<u8>>,
    /// Bytes of this segment already handed to the reader.
    consumed: AtomicU64,
}

impl Segment {
    fn new(start: u64, end: u64) -> Arc<Self> {
        Arc::new(Self {
            bounds: Mutex::new((start, end)),
            buf: Mutex::new(Vec::new()),
            consumed: AtomicU64::new(0),
        })
    }

    fn bounds(&self) -> (u64, u64) {
        *self.bounds.lock().expect("segment bounds lock")
    }

    fn len(&self) -> u64 {
        let (start, end) = self.bounds();
        end - start + 1
    }
}

struct BodyState {
    /// Segments sorted by ascending start offset.
    segments: Vec<Arc<Segment>>,
    /// Index of the segment currently being consumed.
    read_cursor: usize,
    /// Bytes handed to the reader so far.
    total_read: u64,
    error: Option<crate::Error>,
    closed: bool,
}

struct Shared {
    content_length: u64,
    state: Mutex<BodyState>,
    /// Data-arrived signal; `notify_one` stores a permit, so a wake-up racing
    /// the reader's state check is never lost.
    data_arrived: Notify,
    /// Fast-path flag for writers.
    closed: AtomicBool,
}

/// Control handle of a segmented body: registers segments, adjusts bounds,
/// records failure. Cloneable; the single [`BodyReader`] is taken separately.
#[derive(Clone)]
pub struct SegmentedBody {
    shared: Arc<Shared>,
}

impl SegmentedBody {
    /// A body that will deliver exactly `content_length` bytes.
    #[must_use]
    pub fn new(content_length: u64) -> Self {
        Self {
            shared: Arc::new(Shared {
                content_length,
                state: Mutex::new(BodyState {
                    segments: Vec::new(),
                    read_cursor: 0,
                    total_read: 0,
                    error: None,
                    closed: false,
                }),
                data_arrived: Notify::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    #[must_use]
    pub fn content_length(&self) -> u64 {
        self.shared.content_length
    }

    /// Register a segment covering the inclusive range `[start, end]` and
    /// return its writer. Segments must be registered in a way that keeps the
    /// list non-overlapping; the list is kept sorted by start offset so the
    /// reader's linear walk stays correct.
    pub fn register(&self, start: u64, end: u64) -> SegmentWriter {
        debug_assert!(start <= end, "segment start past end");
        let segment = Segment::new(start, end);
        {
            let mut state = self.shared.state.lock().expect("body state lock");
            let at = state
                .segments
                .partition_point(|seg| seg.bounds().0 < start);
            state.segments.insert(at, segment.clone());
        }
        self.shared.data_arrived.notify_one();
        SegmentWriter {
            shared: self.shared.clone(),
            segment,
        }
    }

    /// Move a segment's bounds, used exactly when the split planner finalizes
    /// a shorter end for the main segment. Returns false when no segment with
    /// the old bounds exists.
    pub fn set_segment_bounds(
        &self,
        old_start: u64,
        old_end: u64,
        new_start: u64,
        new_end: u64,
    ) -> bool {
        debug_assert!(new_start <= new_end, "segment start past end");
        let state = self.shared.state.lock().expect("body state lock");
        for segment in &state.segments {
            let mut bounds = segment.bounds.lock().expect("segment bounds lock");
            if *bounds == (old_start, old_end) {
                *bounds = (new_start, new_end);
                drop(bounds);
                let new_len = new_end - new_start + 1;
                let mut buf = segment.buf.lock().expect("segment buffer lock");
                if buf.len() as u64 > new_len {
                    buf.truncate(new_len as usize);
                }
                drop(buf);
                drop(state);
                self.shared.data_arrived.notify_one();
                return true;
            }
        }
        false
    }

    /// Wake a blocked reader to re-examine the body state.
    pub fn signal(&self) {
        self.shared.data_arrived.notify_one();
    }

    /// Record a fatal error; the reader's next read returns it. Bytes of not
    /// yet consumed segments are never delivered past this point.
    pub fn fail(&self, error: crate::Error) {
        {
            let mut state = self.shared.state.lock().expect("body state lock");
            if state.error.is_none() {
                state.error = Some(error);
            }
        }
        self.shared.closed.store(true, Ordering::Release);
        self.shared.data_arrived.notify_one();
    }

    /// True once the reader went away or the body was failed; writers should
    /// abandon their streams.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Take the reading half. A body has exactly one reader.
    #[must_use]
    pub fn reader(&self) -> BodyReader {
        BodyReader {
            shared: self.shared.clone(),
        }
    }
}

impl std::fmt::Debug for SegmentedBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock().expect("body state lock");
        f.debug_struct("SegmentedBody")
            .field("content_length", &self.shared.content_length)
            .field("segments", &state.segments.len())
            .field("read_cursor", &state.read_cursor)
            .field("total_read", &state.total_read)
            .finish()
    }
}

/// Writing half for one segment. Appends are non-blocking; each append raises
/// the data-arrived signal.
pub struct SegmentWriter {
    shared: Arc<Shared>,
    segment: Arc<Segment>,
}

impl SegmentWriter {
    /// Current absolute bounds of this segment.
    #[must_use]
    pub fn bounds(&self) -> (u64, u64) {
        self.segment.bounds()
    }

    /// Append bytes in wire order. Bytes past the segment's declared range
    /// are dropped. Fails once the reader has gone away.
    pub fn write(&self, data: &[u8]) -> Result<(), BodyClosed> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(BodyClosed);
        }
        {
            let capacity = self.segment.len();
            let mut buf = self.segment.buf.lock().expect("segment buffer lock");
            let room = capacity.saturating_sub(buf.len() as u64);
            let n = (data.len() as u64).min(room) as usize;
            buf.extend_from_slice(&data[..n]);
        }
        self.shared.data_arrived.notify_one();
        Ok(())
    }
}

impl std::fmt::Debug for SegmentWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (start, end) = self.segment.bounds();
        f.debug_struct("SegmentWriter")
            .field("start", &start)
            .field("end", &end)
            .finish()
    }
}

/// The single in-order reader of a segmented body.
///
/// Bytes come back in strictly ascending absolute offset order regardless of
/// arrival order. End of body is reported only when every declared byte was
/// delivered, or after the body was closed by cancellation.
pub struct BodyReader {
    shared: Arc<Shared>,
}

impl BodyReader {
    /// Read the next in-order bytes. Blocks on the data-arrived signal while
    /// the segment under the cursor has nothing buffered; spurious wake-ups
    /// re-check the state and loop.
    pub async fn read(&mut self, buf: &mut [u8]) -> crate::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if let Some(read) = self.try_read(buf)? {
                return Ok(read);
            }
            self.shared.data_arrived.notified().await;
        }
    }

    /// One non-blocking attempt; `None` means "wait for the signal".
    fn try_read(&mut self, buf: &mut [u8]) -> crate::Result<Option<usize>> {
        let mut state = self.shared.state.lock().expect("body state lock");

        if let Some(error) = &state.error {
            return Err(error.clone());
        }
        if state.total_read == self.shared.content_length {
            return Ok(Some(0));
        }
        if state.closed {
            // cancelled mid-stream: the reader observes end of body
            return Ok(Some(0));
        }

        while state.read_cursor < state.segments.len() {
            let segment = state.segments[state.read_cursor].clone();
            let seg_len = segment.len();
            let consumed = segment.consumed.load(Ordering::Acquire);
            if consumed >= seg_len {
                state.read_cursor += 1;
                continue;
            }

            let available = {
                let seg_buf = segment.buf.lock().expect("segment buffer lock");
                let written = (seg_buf.len() as u64).min(seg_len);
                if written <= consumed {
                    // nothing buffered beyond the cursor yet
                    break;
                }
                let n = ((written - consumed) as usize).min(buf.len());
                let from = consumed as usize;
                buf[..n].copy_from_slice(&seg_buf[from..from + n]);
                n
            };

            segment
                .consumed
                .store(consumed + available as u64, Ordering::Release);
            state.total_read += available as u64;
            if consumed + available as u64 == seg_len {
                state.read_cursor += 1;
            }
            return Ok(Some(available));
        }

        Ok(None)
    }

    /// Stop reading. Writers observe the closed body and abort their streams.
    pub fn close(&mut self) {
        {
            let mut state = self.shared.state.lock().expect("body state lock");
            state.closed = true;
        }
        self.shared.closed.store(true, Ordering::Release);
        self.shared.data_arrived.notify_one();
    }
}

impl Drop for BodyReader {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for BodyReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BodyReader").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Kind;

    #[tokio::test]
    async fn single_segment_in_order() {
        let body = SegmentedBody::new(10);
        let writer = body.register(0, 9);
        writer.write(b"0123456789").unwrap();

        let mut reader = body.reader();
        let mut buf = [0u8; 16];
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"0123456789");
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn out_of_order_segments_deliver_ascending() {
        let body = SegmentedBody::new(12);
        let first = body.register(0, 3);
        let second = body.register(4, 7);
        let third = body.register(8, 11);

        // written back to front
        third.write(b"ijkl").unwrap();
        second.write(b"efgh").unwrap();
        first.write(b"abcd").unwrap();

        let mut reader = body.reader();
        let mut out = Vec::new();
        let mut buf = [0u8; 5];
        loop {
            let n = reader.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, b"abcdefghijkl");
    }

    #[test]
    fn read_stays_pending_until_a_writer_signals() {
        let body = SegmentedBody::new(4);
        let writer = body.register(0, 3);
        let mut reader = body.reader();

        let mut buf = [0u8; 4];
        let mut read = tokio_test::task::spawn(reader.read(&mut buf));
        tokio_test::assert_pending!(read.poll());

        writer.write(b"done").unwrap();
        assert!(read.is_woken(), "write must wake the parked reader");
        let n = tokio_test::assert_ready!(read.poll()).unwrap();
        drop(read);
        assert_eq!(&buf[..n], b"done");
    }

    #[tokio::test]
    async fn reader_blocks_until_data_arrives() {
        let body = SegmentedBody::new(4);
        let writer = body.register(0, 3);
        let mut reader = body.reader();

        let writer_task = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            writer.write(b"wxyz").unwrap();
        });

        let mut buf = [0u8; 4];
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"wxyz");
        writer_task.await.unwrap();
    }

    #[tokio::test]
    async fn no_eof_before_every_byte_delivered() {
        let body = SegmentedBody::new(8);
        let first = body.register(0, 3);
        let second = body.register(4, 7);
        first.write(b"abcd").unwrap();

        let mut reader = body.reader();
        let mut buf = [0u8; 8];
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abcd");

        // the next read must wait for the second segment instead of EOF
        let pending = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            reader.read(&mut buf),
        )
        .await;
        assert!(pending.is_err(), "read returned before segment two arrived");

        second.write(b"efgh").unwrap();
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"efgh");
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn shrinking_main_segment_moves_the_cut() {
        let body = SegmentedBody::new(16);
        let main = body.register(0, 15);
        assert!(body.set_segment_bounds(0, 15, 0, 7));
        let tail = body.register(8, 15);

        main.write(b"AAAAAAAA").unwrap();
        tail.write(b"BBBBBBBB").unwrap();

        let mut reader = body.reader();
        let mut out = Vec::new();
        let mut buf = [0u8; 6];
        loop {
            let n = reader.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, b"AAAAAAAABBBBBBBB");
    }

    #[tokio::test]
    async fn set_segment_bounds_requires_matching_range() {
        let body = SegmentedBody::new(8);
        let _writer = body.register(0, 7);
        assert!(!body.set_segment_bounds(0, 3, 0, 1));
    }

    #[tokio::test]
    async fn failure_surfaces_on_next_read() {
        let body = SegmentedBody::new(8);
        let writer = body.register(0, 7);
        writer.write(b"abcd").unwrap();

        let mut reader = body.reader();
        let mut buf = [0u8; 8];
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abcd");

        body.fail(crate::error::sub_request_failed("stream reset"));
        let err = reader.read(&mut buf).await.unwrap_err();
        assert_eq!(*err.kind(), Kind::SubRequestFailed);
        // failure is sticky
        let err = reader.read(&mut buf).await.unwrap_err();
        assert_eq!(*err.kind(), Kind::SubRequestFailed);
    }

    #[tokio::test]
    async fn closing_the_reader_rejects_writers() {
        let body = SegmentedBody::new(8);
        let writer = body.register(0, 7);
        let mut reader = body.reader();
        reader.close();

        assert_eq!(writer.write(b"data"), Err(BodyClosed));
        assert!(body.is_closed());
        // a cancelled body reads as EOF
        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn writes_past_declared_range_are_dropped() {
        let body = SegmentedBody::new(4);
        let writer = body.register(0, 3);
        writer.write(b"abcdEXTRA").unwrap();

        let mut reader = body.reader();
        let mut buf = [0u8; 16];
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abcd");
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn empty_body_is_immediate_eof() {
        let body = SegmentedBody::new(0);
        let mut reader = body.reader();
        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
    }
}
