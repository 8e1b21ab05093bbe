//! In-process HTTP/2 peer for the integration tests.
//!
//! Speaks just enough server-side HTTP/2 (built from `strand_h2`'s frame and
//! HPACK codecs) to answer requests on std threads, optionally over TLS with
//! a self-signed certificate. By default every request is answered with
//! `200` and its own `:path` as the body.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use strand_h2::frame::Frame;
use strand_h2::hpack::{Decoder, Encoder};
use strand_h2::{ErrorCode, HeaderField, PREFACE};

// -- TLS cert generation --

pub fn generate_self_signed() -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let key = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());
    let cert_der = CertificateDer::from(cert.cert);
    (vec![cert_der], key.into())
}

fn server_tls_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    alpn: Vec<Vec<u8>>,
) -> Arc<rustls::ServerConfig> {
    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .unwrap();
    config.alpn_protocols = alpn;
    Arc::new(config)
}

pub fn client_tls_config(certs: &[CertificateDer<'static>]) -> Arc<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in certs {
        roots.add(cert.clone()).unwrap();
    }
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Arc::new(config)
}

// -- Requests and replies --

/// A request as the peer saw it.
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub stream_id: u32,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl SeenRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn path(&self) -> &str {
        self.header(":path").unwrap_or_default()
    }

    pub fn method(&self) -> &str {
        self.header(":method").unwrap_or_default()
    }
}

/// What the peer does with a complete request.
#[derive(Debug, Clone)]
pub enum Reply {
    Respond {
        status: u16,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
        delay: Duration,
        /// Follow the response with GOAWAY(NO_ERROR) naming this stream last.
        goaway: bool,
    },
    /// Drop the connection on the spot.
    Hangup,
    /// Never answer.
    Ignore,
    Reset(ErrorCode),
}

impl Reply {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self::status(200, body)
    }

    pub fn status(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Reply::Respond {
            status,
            headers: Vec::new(),
            body: body.into(),
            delay: Duration::ZERO,
            goaway: false,
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        if let Reply::Respond { headers, .. } = &mut self {
            headers.push((name.to_string(), value.to_string()));
        }
        self
    }

    pub fn delayed(mut self, by: Duration) -> Self {
        if let Reply::Respond { delay, .. } = &mut self {
            *delay = by;
        }
        self
    }

    pub fn then_goaway(mut self) -> Self {
        if let Reply::Respond { goaway, .. } = &mut self {
            *goaway = true;
        }
        self
    }
}

pub type Handler = Arc<dyn Fn(&SeenRequest) -> Reply + Send + Sync>;

pub fn echo_path() -> Handler {
    Arc::new(|req: &SeenRequest| Reply::ok(req.path().as_bytes().to_vec()))
}

// -- Server --

trait Io: Read + Write + Send {}
impl<T: Read + Write + Send> Io for T {}

pub struct DummyServer {
    addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<SeenRequest>>>,
    stop: Arc<AtomicBool>,
}

impl DummyServer {
    pub fn start(handler: Handler) -> Self {
        Self::spawn(handler, None)
    }

    /// TLS server with a fresh self-signed cert for `localhost`, offering
    /// `alpn`. Returns the cert so the client can trust it.
    pub fn start_tls(handler: Handler, alpn: &[&[u8]]) -> (Self, Vec<CertificateDer<'static>>) {
        let (certs, key) = generate_self_signed();
        let alpn = alpn.iter().map(|p| p.to_vec()).collect();
        let config = server_tls_config(certs.clone(), key, alpn);
        (Self::spawn(handler, Some(config)), certs)
    }

    fn spawn(handler: Handler, tls: Option<Arc<rustls::ServerConfig>>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));

        let (c, s, st) = (connections.clone(), seen.clone(), stop.clone());
        thread::spawn(move || {
            while !st.load(Ordering::Acquire) {
                let tcp = match listener.accept() {
                    Ok((tcp, _)) => tcp,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(5));
                        continue;
                    }
                    Err(_) => return,
                };
                c.fetch_add(1, Ordering::SeqCst);
                tcp.set_nonblocking(false).unwrap();
                tcp.set_nodelay(true).unwrap();
                tcp.set_read_timeout(Some(Duration::from_millis(5))).unwrap();
                let io: Box<dyn Io> = match &tls {
                    Some(config) => {
                        let conn = rustls::ServerConnection::new(config.clone()).unwrap();
                        Box::new(rustls::StreamOwned::new(conn, tcp))
                    }
                    None => Box::new(tcp),
                };
                let (handler, seen, stop) = (handler.clone(), s.clone(), st.clone());
                thread::spawn(move || serve(io, handler, seen, stop));
            }
        });

        Self {
            addr,
            connections,
            seen,
            stop,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn tls_url(&self) -> String {
        format!("https://localhost:{}", self.addr.port())
    }

    /// Connections accepted so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<SeenRequest> {
        self.seen.lock().unwrap().clone()
    }
}

impl Drop for DummyServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

/// A port nothing listens on.
pub fn closed_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Poll `cond` until it holds or five seconds pass.
pub fn eventually(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

// -- Server-side HTTP/2 --

struct Scheduled {
    due: Instant,
    stream_id: u32,
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    goaway: bool,
}

#[derive(Default)]
struct Incoming {
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

struct Peer {
    inbuf: Vec<u8>,
    out: Vec<u8>,
    preface_seen: bool,
    decoder: Decoder,
    encoder: Encoder,
    streams: HashMap<u32, Incoming>,
    block: Option<(u32, Vec<u8>, bool)>,
    scheduled: Vec<Scheduled>,
}

enum Step {
    Continue,
    Hangup,
}

fn serve(
    mut io: Box<dyn Io>,
    handler: Handler,
    seen: Arc<Mutex<Vec<SeenRequest>>>,
    stop: Arc<AtomicBool>,
) {
    let mut peer = Peer {
        inbuf: Vec::new(),
        out: Vec::new(),
        preface_seen: false,
        decoder: Decoder::new(4096),
        encoder: Encoder::new(),
        streams: HashMap::new(),
        block: None,
        scheduled: Vec::new(),
    };
    Frame::Settings {
        ack: false,
        params: Vec::new(),
    }
    .encode(&mut peer.out);

    let mut buf = vec![0u8; 16 * 1024];
    loop {
        if stop.load(Ordering::Acquire) {
            return;
        }
        if !peer.out.is_empty() {
            let out = std::mem::take(&mut peer.out);
            if !write_out(&mut *io, &out) {
                return;
            }
        }
        match io.read(&mut buf) {
            Ok(0) => return,
            Ok(n) => {
                peer.inbuf.extend_from_slice(&buf[..n]);
                match peer.process(&handler, &seen) {
                    Ok(Step::Continue) => {}
                    Ok(Step::Hangup) | Err(()) => return,
                }
            }
            Err(e) if retryable(&e) => {}
            Err(_) => return,
        }
        peer.send_due(Instant::now());
    }
}

fn retryable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

/// Write everything, riding out the read timeouts a TLS stream surfaces
/// while it finishes its handshake.
fn write_out(io: &mut dyn Io, mut data: &[u8]) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !data.is_empty() {
        match io.write(data) {
            Ok(0) => return false,
            Ok(n) => data = &data[n..],
            Err(e) if retryable(&e) && Instant::now() < deadline => {}
            Err(_) => return false,
        }
    }
    loop {
        match io.flush() {
            Ok(()) => return true,
            Err(e) if retryable(&e) && Instant::now() < deadline => {}
            Err(_) => return false,
        }
    }
}

impl Peer {
    fn process(
        &mut self,
        handler: &Handler,
        seen: &Mutex<Vec<SeenRequest>>,
    ) -> Result<Step, ()> {
        if !self.preface_seen {
            if self.inbuf.len() < PREFACE.len() {
                return Ok(Step::Continue);
            }
            if &self.inbuf[..PREFACE.len()] != PREFACE {
                return Err(());
            }
            self.inbuf.drain(..PREFACE.len());
            self.preface_seen = true;
        }
        while let Some((frame, used)) = Frame::decode(&self.inbuf, 1 << 24).map_err(|_| ())? {
            self.inbuf.drain(..used);
            match frame {
                Frame::Settings { ack: false, .. } => Frame::Settings {
                    ack: true,
                    params: Vec::new(),
                }
                .encode(&mut self.out),
                Frame::Ping { ack: false, payload } => {
                    Frame::Ping { ack: true, payload }.encode(&mut self.out)
                }
                Frame::Headers {
                    stream_id,
                    block,
                    end_stream,
                    end_headers,
                } => {
                    if !end_headers {
                        self.block = Some((stream_id, block.to_vec(), end_stream));
                    } else if self.on_block(stream_id, &block, end_stream)?
                        && let Step::Hangup = self.complete(stream_id, handler, seen)
                    {
                        return Ok(Step::Hangup);
                    }
                }
                Frame::Continuation {
                    block, end_headers, ..
                } => {
                    let Some((_, partial, _)) = self.block.as_mut() else {
                        return Err(());
                    };
                    partial.extend_from_slice(&block);
                    if end_headers
                        && let Some((id, full, end)) = self.block.take()
                        && self.on_block(id, &full, end)?
                        && let Step::Hangup = self.complete(id, handler, seen)
                    {
                        return Ok(Step::Hangup);
                    }
                }
                Frame::Data {
                    stream_id,
                    payload,
                    end_stream,
                    flow_len,
                } => {
                    if flow_len > 0 {
                        for id in [0, stream_id] {
                            Frame::WindowUpdate {
                                stream_id: id,
                                increment: flow_len,
                            }
                            .encode(&mut self.out);
                        }
                    }
                    if let Some(incoming) = self.streams.get_mut(&stream_id) {
                        incoming.body.extend_from_slice(&payload);
                    }
                    if end_stream && let Step::Hangup = self.complete(stream_id, handler, seen) {
                        return Ok(Step::Hangup);
                    }
                }
                _ => {}
            }
        }
        Ok(Step::Continue)
    }

    /// Decode a complete header block. True when it also ended the stream.
    fn on_block(&mut self, stream_id: u32, block: &[u8], end_stream: bool) -> Result<bool, ()> {
        let fields = self.decoder.decode(block).map_err(|_| ())?;
        let incoming = self.streams.entry(stream_id).or_default();
        for field in fields {
            incoming
                .headers
                .push((field.name_str().into_owned(), field.value_str().into_owned()));
        }
        Ok(end_stream)
    }

    fn complete(
        &mut self,
        stream_id: u32,
        handler: &Handler,
        seen: &Mutex<Vec<SeenRequest>>,
    ) -> Step {
        let Some(incoming) = self.streams.remove(&stream_id) else {
            return Step::Continue;
        };
        let request = SeenRequest {
            stream_id,
            headers: incoming.headers,
            body: incoming.body,
        };
        let reply = handler(&request);
        seen.lock().unwrap().push(request);
        match reply {
            Reply::Respond {
                status,
                headers,
                body,
                delay,
                goaway,
            } => {
                self.scheduled.push(Scheduled {
                    due: Instant::now() + delay,
                    stream_id,
                    status,
                    headers,
                    body,
                    goaway,
                });
                Step::Continue
            }
            Reply::Hangup => Step::Hangup,
            Reply::Ignore => Step::Continue,
            Reply::Reset(code) => {
                Frame::RstStream { stream_id, code }.encode(&mut self.out);
                Step::Continue
            }
        }
    }

    fn send_due(&mut self, now: Instant) {
        let (due, later): (Vec<Scheduled>, Vec<Scheduled>) =
            std::mem::take(&mut self.scheduled)
                .into_iter()
                .partition(|s| s.due <= now);
        self.scheduled = later;
        for reply in due {
            let mut fields = vec![
                HeaderField::new(":status", reply.status.to_string()),
                HeaderField::new("content-length", reply.body.len().to_string()),
            ];
            for (name, value) in reply.headers {
                fields.push(HeaderField::new(name, value));
            }
            let mut block = BytesMut::new();
            self.encoder.encode(&fields, &mut block);
            Frame::Headers {
                stream_id: reply.stream_id,
                block: block.freeze(),
                end_stream: reply.body.is_empty(),
                end_headers: true,
            }
            .encode(&mut self.out);
            let mut chunks = reply.body.chunks(16_384).peekable();
            while let Some(chunk) = chunks.next() {
                Frame::data(reply.stream_id, chunk.to_vec(), chunks.peek().is_none())
                    .encode(&mut self.out);
            }
            if reply.goaway {
                Frame::GoAway {
                    last_stream_id: reply.stream_id,
                    code: ErrorCode::NoError,
                    debug: Bytes::new(),
                }
                .encode(&mut self.out);
            }
        }
    }
}
