//! quiche-backed transport
//!
//! Production implementation of the transport contracts. Each session owns a
//! `quiche::Connection` plus its `quiche::h3::Connection` (frames and QPACK
//! live entirely inside quiche), driven by one tokio task that shuttles UDP
//! datagrams, retires timers, and routes per-stream HTTP/3 events to the
//! [`ResponseStream`] handles held by the scheduler. ALPN is forced to `h3`;
//! the HEADERS size cap is enforced by quiche's field-section limit.

use std::collections::HashMap;
use std::hash::{BuildHasher, Hasher, RandomState};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use quiche::h3;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::config::TransportConfig;
use crate::http::ResponseHead;
use crate::transport::{Dialer, RequestHead, ResponseStream, Session, TransportError, codes};

const MAX_DATAGRAM_SIZE: usize = 1350;
const RECV_BUFFER_SIZE: usize = 65535;
const HANDSHAKE_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Dials quiche sessions for one client.
pub struct QuicheDialer {
    transport: TransportConfig,
    max_header_bytes: u64,
}

impl QuicheDialer {
    #[must_use]
    pub fn new(transport: TransportConfig, max_header_bytes: u64) -> Self {
        Self {
            transport,
            max_header_bytes,
        }
    }
}

#[async_trait]
impl Dialer for QuicheDialer {
    async fn dial(&self, authority: &str) -> Result<Arc<dyn Session>, TransportError> {
        let (host, peer) = resolve(authority).await?;
        let bind_addr: SocketAddr = if peer.is_ipv4() {
            "0.0.0.0:0".parse().expect("ipv4 wildcard")
        } else {
            "[::]:0".parse().expect("ipv6 wildcard")
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(peer).await?;
        let local = socket.local_addr()?;

        let mut config = build_config(&self.transport)?;
        let scid_bytes = generate_scid();
        let scid = quiche::ConnectionId::from_ref(&scid_bytes);
        let mut conn = quiche::connect(Some(&host), &scid, local, peer, &mut config)
            .map_err(|e| TransportError::Dial(format!("quiche connect: {e}")))?;

        let mut out = [0u8; MAX_DATAGRAM_SIZE];
        let mut inbuf = [0u8; RECV_BUFFER_SIZE];
        flush_egress(&socket, &mut conn, &mut out).await?;
        while !conn.is_established() {
            if conn.is_closed() {
                return Err(TransportError::Dial(
                    "connection closed during handshake".into(),
                ));
            }
            let timeout = conn.timeout().unwrap_or(HANDSHAKE_IDLE_TIMEOUT);
            tokio::select! {
                received = socket.recv(&mut inbuf) => {
                    let n = received?;
                    let info = quiche::RecvInfo { from: peer, to: local };
                    if let Err(e) = conn.recv(&mut inbuf[..n], info) {
                        if e != quiche::Error::Done {
                            return Err(TransportError::Dial(format!("handshake recv: {e}")));
                        }
                    }
                }
                _ = tokio::time::sleep(timeout) => {
                    conn.on_timeout();
                }
            }
            flush_egress(&socket, &mut conn, &mut out).await?;
        }

        let mut h3_config =
            h3::Config::new().map_err(|e| TransportError::Dial(format!("h3 config: {e}")))?;
        h3_config.set_max_field_section_size(self.max_header_bytes);
        let h3_conn = h3::Connection::with_transport(&mut conn, &h3_config)
            .map_err(|e| TransportError::Dial(format!("h3 handshake: {e}")))?;

        let rtt = Arc::new(AtomicU64::new(
            conn.path_stats()
                .next()
                .map(|p| p.rtt.as_nanos() as u64)
                .unwrap_or(0),
        ));
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let driver = Driver {
            socket,
            conn,
            h3: h3_conn,
            peer,
            local,
            streams: HashMap::new(),
            pending_bodies: HashMap::new(),
            rtt: rtt.clone(),
            max_header_bytes: self.max_header_bytes,
        };
        tokio::spawn(driver.run(cmd_rx));
        debug!(target: "qfan::transport", %peer, "session established");

        Ok(Arc::new(QuicheSession { cmd_tx, rtt }))
    }
}

enum Command {
    OpenRequest {
        headers: Vec<h3::Header>,
        body: Option<Bytes>,
        resp: oneshot::Sender<Result<OpenedStream, TransportError>>,
    },
    Cancel {
        stream_id: u64,
        code: u64,
    },
    Close {
        code: u64,
        reason: String,
        done: oneshot::Sender<()>,
    },
}

struct OpenedStream {
    stream_id: u64,
    events: mpsc::UnboundedReceiver<StreamEvent>,
}

enum StreamEvent {
    Headers(ResponseHead),
    Data(Bytes),
    Finished,
    Failed(TransportError),
}

struct QuicheSession {
    cmd_tx: mpsc::UnboundedSender<Command>,
    rtt: Arc<AtomicU64>,
}

#[async_trait]
impl Session for QuicheSession {
    async fn open_request(
        &self,
        head: RequestHead,
    ) -> Result<Box<dyn ResponseStream>, TransportError> {
        let headers = encode_request_headers(&head);
        let (resp_tx, resp_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::OpenRequest {
                headers,
                body: head.body,
                resp: resp_tx,
            })
            .map_err(|_| TransportError::Closed("session driver gone".into()))?;
        let opened = resp_rx
            .await
            .map_err(|_| TransportError::Closed("session driver gone".into()))??;
        Ok(Box::new(QuicheStream {
            stream_id: opened.stream_id,
            events: opened.events,
            cmd_tx: self.cmd_tx.clone(),
            buffered: Bytes::new(),
            finished: false,
        }))
    }

    fn rtt(&self) -> Duration {
        Duration::from_nanos(self.rtt.load(Ordering::Relaxed))
    }

    async fn close_with_error(&self, code: u64, reason: &str) -> Result<(), TransportError> {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::Close {
                code,
                reason: reason.to_string(),
                done: done_tx,
            })
            .is_err()
        {
            // driver already gone means the session is already down
            return Ok(());
        }
        let _ = done_rx.await;
        Ok(())
    }
}

struct QuicheStream {
    stream_id: u64,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    buffered: Bytes,
    finished: bool,
}

#[async_trait]
impl ResponseStream for QuicheStream {
    async fn read_head(&mut self) -> Result<ResponseHead, TransportError> {
        match self.events.recv().await {
            Some(StreamEvent::Headers(head)) => Ok(head),
            Some(StreamEvent::Data(_)) => {
                Err(TransportError::Protocol("DATA frame before HEADERS".into()))
            }
            Some(StreamEvent::Finished) => Err(TransportError::Closed(
                "stream finished before headers".into(),
            )),
            Some(StreamEvent::Failed(e)) => Err(e),
            None => Err(TransportError::Closed("session driver gone".into())),
        }
    }

    async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if buf.is_empty() || self.finished {
            return Ok(0);
        }
        if !self.buffered.is_empty() {
            let n = self.buffered.len().min(buf.len());
            buf[..n].copy_from_slice(&self.buffered[..n]);
            self.buffered = self.buffered.slice(n..);
            return Ok(n);
        }
        loop {
            match self.events.recv().await {
                Some(StreamEvent::Data(data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    if n < data.len() {
                        self.buffered = data.slice(n..);
                    }
                    return Ok(n);
                }
                Some(StreamEvent::Finished) => {
                    self.finished = true;
                    return Ok(0);
                }
                // trailers are not surfaced
                Some(StreamEvent::Headers(_)) => continue,
                Some(StreamEvent::Failed(e)) => return Err(e),
                None => return Err(TransportError::Closed("session driver gone".into())),
            }
        }
    }

    fn cancel(&mut self, code: u64) {
        let _ = self.cmd_tx.send(Command::Cancel {
            stream_id: self.stream_id,
            code,
        });
        self.finished = true;
    }
}

/// What woke the driver loop.
enum Tick {
    Cmd(Option<Command>),
    Recv(std::io::Result<usize>),
    Timeout,
}

struct Driver {
    socket: UdpSocket,
    conn: quiche::Connection,
    h3: h3::Connection,
    peer: SocketAddr,
    local: SocketAddr,
    streams: HashMap<u64, mpsc::UnboundedSender<StreamEvent>>,
    /// Request bodies blocked on stream flow control, retried every tick.
    pending_bodies: HashMap<u64, Bytes>,
    rtt: Arc<AtomicU64>,
    max_header_bytes: u64,
}

impl Driver {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        let mut out = [0u8; MAX_DATAGRAM_SIZE];
        let mut inbuf = [0u8; RECV_BUFFER_SIZE];

        loop {
            if self.flush(&mut out).await.is_err() {
                self.fail_all(|| TransportError::Closed("socket send failed".into()));
                break;
            }
            self.retry_pending_bodies();
            self.drain_h3_events(&mut inbuf);
            if let Some(path) = self.conn.path_stats().next() {
                self.rtt.store(path.rtt.as_nanos() as u64, Ordering::Relaxed);
            }
            if self.conn.is_closed() {
                self.fail_all(|| TransportError::Closed("connection closed".into()));
                break;
            }

            let timeout = self.conn.timeout();
            let tick = tokio::select! {
                cmd = cmd_rx.recv() => Tick::Cmd(cmd),
                received = self.socket.recv(&mut inbuf) => Tick::Recv(received),
                _ = sleep_for(timeout) => Tick::Timeout,
            };

            match tick {
                Tick::Cmd(Some(Command::OpenRequest {
                    headers,
                    body,
                    resp,
                })) => self.open_request(headers, body, resp),
                Tick::Cmd(Some(Command::Cancel { stream_id, code })) => {
                    let _ = self
                        .conn
                        .stream_shutdown(stream_id, quiche::Shutdown::Read, code);
                    let _ = self
                        .conn
                        .stream_shutdown(stream_id, quiche::Shutdown::Write, code);
                    self.streams.remove(&stream_id);
                    self.pending_bodies.remove(&stream_id);
                }
                Tick::Cmd(Some(Command::Close { code, reason, done })) => {
                    let _ = self.conn.close(true, code, reason.as_bytes());
                    let _ = done.send(());
                }
                Tick::Cmd(None) => {
                    // session handle dropped: wind the connection down
                    let _ = self.conn.close(true, codes::H3_NO_ERROR, b"");
                }
                Tick::Recv(Ok(n)) => {
                    let info = quiche::RecvInfo {
                        from: self.peer,
                        to: self.local,
                    };
                    if let Err(e) = self.conn.recv(&mut inbuf[..n], info) {
                        if e != quiche::Error::Done {
                            log::warn!("packet processing failed: {e}");
                        }
                    }
                }
                Tick::Recv(Err(e)) => {
                    self.fail_all(|| TransportError::Closed(format!("socket recv failed: {e}")));
                    break;
                }
                Tick::Timeout => self.conn.on_timeout(),
            }
        }
        let _ = self.flush(&mut out).await;
        debug!(target: "qfan::transport", peer = %self.peer, "session driver stopped");
    }

    async fn flush(&mut self, out: &mut [u8]) -> Result<(), TransportError> {
        flush_egress(&self.socket, &mut self.conn, out).await
    }

    fn open_request(
        &mut self,
        headers: Vec<h3::Header>,
        body: Option<Bytes>,
        resp: oneshot::Sender<Result<OpenedStream, TransportError>>,
    ) {
        let fin = body.is_none();
        match self.h3.send_request(&mut self.conn, &headers, fin) {
            Ok(stream_id) => {
                if let Some(body) = body {
                    match self.h3.send_body(&mut self.conn, stream_id, &body, true) {
                        Ok(written) if written < body.len() => {
                            self.pending_bodies.insert(stream_id, body.slice(written..));
                        }
                        Ok(_) => {}
                        Err(h3::Error::Done) => {
                            self.pending_bodies.insert(stream_id, body);
                        }
                        Err(e) => {
                            let _ = resp.send(Err(TransportError::Protocol(format!(
                                "send_body: {e}"
                            ))));
                            return;
                        }
                    }
                }
                let (events_tx, events_rx) = mpsc::unbounded_channel();
                self.streams.insert(stream_id, events_tx);
                let _ = resp.send(Ok(OpenedStream {
                    stream_id,
                    events: events_rx,
                }));
            }
            Err(e) => {
                let _ = resp.send(Err(TransportError::Closed(format!("send_request: {e}"))));
            }
        }
    }

    fn retry_pending_bodies(&mut self) {
        let stream_ids: Vec<u64> = self.pending_bodies.keys().copied().collect();
        for stream_id in stream_ids {
            let body = self.pending_bodies.remove(&stream_id).expect("pending body");
            match self.h3.send_body(&mut self.conn, stream_id, &body, true) {
                Ok(written) if written < body.len() => {
                    self.pending_bodies.insert(stream_id, body.slice(written..));
                }
                Ok(_) => {}
                Err(h3::Error::Done) => {
                    self.pending_bodies.insert(stream_id, body);
                }
                Err(e) => {
                    self.send_event(
                        stream_id,
                        StreamEvent::Failed(TransportError::Protocol(format!("send_body: {e}"))),
                    );
                }
            }
        }
    }

    fn drain_h3_events(&mut self, buf: &mut [u8]) {
        loop {
            match self.h3.poll(&mut self.conn) {
                Ok((stream_id, h3::Event::Headers { list, .. })) => {
                    let event = match decode_response_head(&list) {
                        Ok(head) => StreamEvent::Headers(head),
                        Err(e) => StreamEvent::Failed(e),
                    };
                    self.send_event(stream_id, event);
                }
                Ok((stream_id, h3::Event::Data)) => loop {
                    match self.h3.recv_body(&mut self.conn, stream_id, buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            self.send_event(
                                stream_id,
                                StreamEvent::Data(Bytes::copy_from_slice(&buf[..n])),
                            );
                        }
                        Err(h3::Error::Done) => break,
                        Err(e) => {
                            self.send_event(
                                stream_id,
                                StreamEvent::Failed(TransportError::Protocol(format!(
                                    "recv_body: {e}"
                                ))),
                            );
                            break;
                        }
                    }
                },
                Ok((stream_id, h3::Event::Finished)) => {
                    self.send_event(stream_id, StreamEvent::Finished);
                    self.streams.remove(&stream_id);
                }
                Ok((stream_id, h3::Event::Reset(code))) => {
                    self.send_event(stream_id, StreamEvent::Failed(TransportError::Reset(code)));
                    self.streams.remove(&stream_id);
                }
                Ok((_, h3::Event::PriorityUpdate)) => {}
                Ok((_, h3::Event::GoAway)) => {}
                Err(h3::Error::Done) => break,
                Err(h3::Error::ExcessiveLoad) => {
                    let max = self.max_header_bytes;
                    self.fail_all(|| TransportError::HeaderTooLarge { max });
                    let _ = self.conn.close(true, codes::H3_EXCESSIVE_LOAD, b"");
                    break;
                }
                Err(e) => {
                    let message = format!("h3 poll: {e}");
                    self.fail_all(|| TransportError::Protocol(message.clone()));
                    break;
                }
            }
        }
    }

    fn send_event(&self, stream_id: u64, event: StreamEvent) {
        if let Some(tx) = self.streams.get(&stream_id) {
            let _ = tx.send(event);
        }
    }

    fn fail_all<F: Fn() -> TransportError>(&mut self, make: F) {
        for (_, tx) in self.streams.drain() {
            let _ = tx.send(StreamEvent::Failed(make()));
        }
    }
}

async fn flush_egress(
    socket: &UdpSocket,
    conn: &mut quiche::Connection,
    out: &mut [u8],
) -> Result<(), TransportError> {
    loop {
        match conn.send(out) {
            Ok((n, _info)) => {
                socket.send(&out[..n]).await?;
            }
            Err(quiche::Error::Done) => return Ok(()),
            Err(e) => return Err(TransportError::Protocol(format!("quic send: {e}"))),
        }
    }
}

async fn sleep_for(timeout: Option<Duration>) {
    match timeout {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending::<()>().await,
    }
}

fn build_config(transport: &TransportConfig) -> Result<quiche::Config, TransportError> {
    let mut config = quiche::Config::new(quiche::PROTOCOL_VERSION)
        .map_err(|e| TransportError::Dial(format!("quic config: {e}")))?;
    // ALPN is always h3, whatever the caller's TLS options say
    config
        .set_application_protos(&[b"h3"])
        .map_err(|e| TransportError::Dial(format!("set ALPN: {e}")))?;
    config.set_max_idle_timeout(transport.idle_timeout.as_millis() as u64);
    config.set_max_recv_udp_payload_size(transport.max_udp_payload_size as usize);
    config.set_max_send_udp_payload_size(transport.max_udp_payload_size as usize);
    config.set_initial_max_data(transport.initial_max_data);
    config.set_initial_max_stream_data_bidi_local(transport.initial_max_stream_data);
    config.set_initial_max_stream_data_bidi_remote(transport.initial_max_stream_data);
    config.set_initial_max_stream_data_uni(transport.initial_max_stream_data);
    config.set_initial_max_streams_bidi(transport.initial_max_streams_bidi);
    config.set_initial_max_streams_uni(transport.initial_max_streams_uni);
    config.set_disable_active_migration(true);
    config.verify_peer(transport.verify_peer);
    Ok(config)
}

/// Random source connection id, seeded from the process-random hasher.
fn generate_scid() -> [u8; 16] {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let state = RandomState::new();
    let mut first = state.build_hasher();
    first.write_u64(COUNTER.fetch_add(1, Ordering::Relaxed));
    let a = first.finish();
    let mut second = state.build_hasher();
    second.write_u64(a.wrapping_add(1));
    let b = second.finish();

    let mut scid = [0u8; 16];
    scid[..8].copy_from_slice(&a.to_be_bytes());
    scid[8..].copy_from_slice(&b.to_be_bytes());
    scid
}

async fn resolve(authority: &str) -> Result<(String, SocketAddr), TransportError> {
    let (host, port) = split_authority(authority)?;
    let addr = tokio::net::lookup_host((host.as_str(), port))
        .await?
        .next()
        .ok_or_else(|| TransportError::Dial(format!("no address for {host}")))?;
    Ok((host, addr))
}

fn split_authority(authority: &str) -> Result<(String, u16), TransportError> {
    // bracketed IPv6 literal
    if let Some(rest) = authority.strip_prefix('[') {
        let Some((host, tail)) = rest.split_once(']') else {
            return Err(TransportError::Dial(format!(
                "malformed authority: {authority}"
            )));
        };
        let port = match tail.strip_prefix(':') {
            Some(port) => port
                .parse()
                .map_err(|_| TransportError::Dial(format!("bad port in {authority}")))?,
            None => 443,
        };
        return Ok((host.to_string(), port));
    }
    match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|_| TransportError::Dial(format!("bad port in {authority}")))?;
            Ok((host.to_string(), port))
        }
        None => Ok((authority.to_string(), 443)),
    }
}

fn encode_request_headers(head: &RequestHead) -> Vec<h3::Header> {
    let url = &head.url;
    let mut path = url.path().to_string();
    if let Some(query) = url.query() {
        path = format!("{path}?{query}");
    }
    let authority = match url.port() {
        Some(port) => format!("{}:{port}", url.host_str().unwrap_or_default()),
        None => url.host_str().unwrap_or_default().to_string(),
    };

    let mut out = vec![
        h3::Header::new(b":method", head.method.as_str().as_bytes()),
        h3::Header::new(b":scheme", url.scheme().as_bytes()),
        h3::Header::new(b":authority", authority.as_bytes()),
        h3::Header::new(b":path", path.as_bytes()),
    ];
    if head.gzip {
        out.push(h3::Header::new(b"accept-encoding", b"gzip"));
    }
    for (name, value) in &head.headers {
        out.push(h3::Header::new(name.as_str().as_bytes(), value.as_bytes()));
    }
    out
}

fn decode_response_head(list: &[h3::Header]) -> Result<ResponseHead, TransportError> {
    use quiche::h3::NameValue;

    let mut status = None;
    let mut headers = HeaderMap::new();
    for field in list {
        let name = field.name();
        if name == b":status" {
            let text = std::str::from_utf8(field.value())
                .map_err(|_| TransportError::HeaderDecode("non-UTF-8 status".into()))?;
            let code: u16 = text.parse().map_err(|_| {
                TransportError::HeaderDecode("malformed non-numeric status pseudo header".into())
            })?;
            status = Some(StatusCode::from_u16(code).map_err(|_| {
                TransportError::HeaderDecode(format!("status out of range: {code}"))
            })?);
        } else if !name.starts_with(b":") {
            let header_name = HeaderName::from_bytes(name)
                .map_err(|e| TransportError::HeaderDecode(format!("header name: {e}")))?;
            let header_value = HeaderValue::from_bytes(field.value())
                .map_err(|e| TransportError::HeaderDecode(format!("header value: {e}")))?;
            headers.append(header_name, header_value);
        }
    }
    let status =
        status.ok_or_else(|| TransportError::HeaderDecode("missing :status pseudo header".into()))?;
    Ok(ResponseHead::new(status, headers))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authority_splitting() {
        assert_eq!(
            split_authority("example.com:8443").unwrap(),
            ("example.com".to_string(), 8443)
        );
        assert_eq!(
            split_authority("example.com").unwrap(),
            ("example.com".to_string(), 443)
        );
        assert_eq!(
            split_authority("[::1]:4433").unwrap(),
            ("::1".to_string(), 4433)
        );
        assert_eq!(split_authority("[::1]").unwrap(), ("::1".to_string(), 443));
        assert!(split_authority("example.com:notaport").is_err());
    }

    #[test]
    fn scids_are_distinct() {
        assert_ne!(generate_scid(), generate_scid());
    }

    #[test]
    fn request_headers_carry_pseudo_fields() {
        use quiche::h3::NameValue;

        let url = url::Url::parse("https://example.com:8443/a/b.bin?x=1").unwrap();
        let head = RequestHead::range_get(url, 100, 199);
        let headers = encode_request_headers(&head);

        let find = |name: &[u8]| {
            headers
                .iter()
                .find(|h| h.name() == name)
                .map(|h| h.value().to_vec())
        };
        assert_eq!(find(b":method").unwrap(), b"GET");
        assert_eq!(find(b":scheme").unwrap(), b"https");
        assert_eq!(find(b":authority").unwrap(), b"example.com:8443");
        assert_eq!(find(b":path").unwrap(), b"/a/b.bin?x=1");
        assert_eq!(find(b"range").unwrap(), b"bytes=100-199");
        assert!(find(b"accept-encoding").is_none());
    }
}
