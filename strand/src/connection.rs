//! A live connection: the HTTP/2 engine, the I/O thread that owns the
//! socket, and the streams currently carried.
//!
//! Caller threads drive the engine only to send (under its mutex); the
//! frames it emits go through a channel to the I/O thread, which is the
//! only thread touching the socket:
//!
//! ```text
//!  caller ──lock──> engine ──hook──> channel ──waker──> I/O thread ──> socket
//!  caller <──condvar── Stream <──dispatch── I/O thread <── engine <── socket
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::Receiver;
use mio::{Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use strand_h2::Event as H2Event;
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::metrics;
use crate::registry::InFlight;
use crate::request::Request;
use crate::socket::{ReadState, Transport};
use crate::stream::{Completion, Stream, guarded};

const SOCKET: Token = Token(0);
const WAKER: Token = Token(1);

pub(crate) type ErrorHandler = Arc<dyn Fn(&Error) + Send + Sync>;

/// Where mid-connection failures go when no blocked caller can take them.
#[derive(Default)]
pub(crate) struct ErrorSink {
    handler: Mutex<Option<ErrorHandler>>,
    stashed: Mutex<Option<Error>>,
}

impl ErrorSink {
    pub(crate) fn set_handler(&self, handler: ErrorHandler) {
        *self.handler.lock() = Some(handler);
    }

    fn handler(&self) -> Option<ErrorHandler> {
        self.handler.lock().clone()
    }

    /// Keep the first unreported error; later ones are only logged.
    fn stash(&self, err: Error) {
        let mut stashed = self.stashed.lock();
        if stashed.is_none() {
            error!(error = %err, "connection failed with no one waiting, reporting on next join");
            *stashed = Some(err);
        } else {
            error!(error = %err, "connection failed, earlier error still unreported");
        }
    }

    pub(crate) fn take(&self) -> Option<Error> {
        self.stashed.lock().take()
    }
}

struct Shared {
    generation: u64,
    engine: Mutex<strand_h2::Connection>,
    streams: Mutex<HashMap<u32, Arc<Stream>>>,
    waker: Arc<Waker>,
    /// Cleared by the I/O thread, under the engine lock, as it dies.
    alive: AtomicBool,
    /// Set by `close`.
    shutdown: AtomicBool,
    /// The peer sent GOAWAY: streams already open finish here, new ones go
    /// to a fresh connection.
    draining: AtomicBool,
    in_flight: Arc<InFlight>,
    errors: Arc<ErrorSink>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to one connection. Clones share it.
#[derive(Clone)]
pub(crate) struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Establish the transport and start the I/O thread. Blocks for the
    /// connect and handshake; their failures are returned here.
    pub(crate) fn open(
        uri: &Url,
        config: &Config,
        generation: u64,
        in_flight: Arc<InFlight>,
        errors: Arc<ErrorSink>,
    ) -> Result<Self> {
        let mut transport = Transport::connect(uri, config)?;

        let poll = Poll::new()?;
        poll.registry().register(
            transport.tcp(),
            SOCKET,
            Interest::READABLE | Interest::WRITABLE,
        )?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        let (tx, rx) = crossbeam_channel::unbounded::<Bytes>();

        let mut engine = strand_h2::Connection::new(config.settings.clone());
        engine.set_closed_stream_grace(config.closed_stream_grace);
        let hook_waker = waker.clone();
        engine.on_frame(move |bytes| {
            if tx.send(bytes).is_ok() {
                let _ = hook_waker.wake();
            }
        });

        let shared = Arc::new(Shared {
            generation,
            engine: Mutex::new(engine),
            streams: Mutex::new(HashMap::new()),
            waker,
            alive: AtomicBool::new(true),
            shutdown: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            in_flight,
            errors,
            thread: Mutex::new(None),
        });

        let io = IoLoop {
            shared: shared.clone(),
            transport,
            poll,
            readiness: mio::Events::with_capacity(64),
            writes: rx,
            buf: vec![0; config.read_buffer_size],
            write_chunk: config.write_chunk_size,
        };
        let handle = thread::Builder::new()
            .name(format!("strand-io-{generation}"))
            .spawn(move || io.run())?;
        *shared.thread.lock() = Some(handle);

        metrics::CONNECTIONS_OPENED.increment();
        metrics::CONNECTIONS_ACTIVE.increment();
        info!(generation, %uri, "connection established");
        Ok(Self { shared })
    }

    pub(crate) fn generation(&self) -> u64 {
        self.shared.generation
    }

    /// The I/O thread has not finished yet.
    pub(crate) fn is_running(&self) -> bool {
        self.shared.alive.load(Ordering::Acquire)
    }

    /// Accepting new streams: the I/O thread runs, `close` was not called
    /// and the peer has not sent GOAWAY.
    pub(crate) fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::Acquire)
            && !self.shared.shutdown.load(Ordering::Acquire)
            && !self.shared.draining.load(Ordering::Acquire)
    }

    /// Open a stream for `request` and send its headers and body.
    ///
    /// Returns [`Error::Disconnected`] without consuming `completion` or the
    /// request's handlers when the connection died or is going away before
    /// anything was sent, so the caller can retry on a fresh connection.
    pub(crate) fn start(
        &self,
        request: &mut Request,
        completion: &mut Option<Completion>,
    ) -> Result<Arc<Stream>> {
        let fields = request.header_fields();
        let body = request.body().cloned();
        let generation = self.shared.generation;

        let mut engine = self.shared.engine.lock();
        if !self.is_alive() {
            return Err(Error::Disconnected);
        }
        if engine.is_going_away() {
            self.shared.draining.store(true, Ordering::Release);
            return Err(Error::Disconnected);
        }
        let id = engine.new_stream()?;
        let on_complete = completion.take();
        let deadline = on_complete
            .as_ref()
            .and_then(|_| Instant::now().checked_add(request.timeout()));
        let stream = Arc::new(Stream::new(
            id,
            generation,
            request.take_events(),
            on_complete,
            deadline,
        ));
        self.shared.streams.lock().insert(id, stream.clone());
        if stream.is_async() {
            self.shared.in_flight.insert(generation, id);
        }
        metrics::STREAMS_ACTIVE.increment();
        metrics::REQUESTS_STARTED.increment();

        let sent = engine
            .send_headers(id, &fields, body.is_none())
            .and_then(|()| match &body {
                Some(body) => engine.send_data(id, body, true),
                None => Ok(()),
            });
        if let Err(e) = sent {
            drop(engine);
            self.forget(id);
            self.shared.in_flight.remove(generation, id);
            return Err(e.into());
        }
        stream.mark_sent();
        drop(engine);

        trace!(
            stream_id = id,
            method = request.method(),
            path = request.path(),
            is_async = stream.is_async(),
            "request sent"
        );
        Ok(stream)
    }

    /// Stop tracking a stream whose caller gave up. Frames still arriving
    /// for it are dropped.
    pub(crate) fn forget(&self, stream_id: u32) {
        if self.shared.streams.lock().remove(&stream_id).is_some() {
            metrics::STREAMS_ACTIVE.decrement();
        }
    }

    /// Stop the I/O thread and discard every stream without running its
    /// handlers or callback. Blocked callers wake with [`Error::Closed`].
    pub(crate) fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        let _ = self.shared.waker.wake();

        let streams: Vec<Arc<Stream>> = self.shared.streams.lock().drain().map(|(_, s)| s).collect();
        for stream in &streams {
            metrics::STREAMS_ACTIVE.decrement();
            stream.fail(Error::Closed, false);
        }
        self.shared.in_flight.remove_generation(self.shared.generation);

        let handle = self.shared.thread.lock().take();
        if let Some(handle) = handle
            && handle.thread().id() != thread::current().id()
        {
            let _ = handle.join();
        }
        debug!(
            generation = self.shared.generation,
            discarded = streams.len(),
            "connection shut down"
        );
    }
}

/// State owned by the I/O thread.
struct IoLoop {
    shared: Arc<Shared>,
    transport: Transport,
    poll: Poll,
    readiness: mio::Events,
    writes: Receiver<Bytes>,
    buf: Vec<u8>,
    write_chunk: usize,
}

impl IoLoop {
    fn run(mut self) {
        let result = self.drive();
        self.teardown(result);
    }

    /// `Ok` for a graceful end (client shutdown, idle EOF, drained GOAWAY).
    fn drive(&mut self) -> Result<()> {
        loop {
            if self.shared.shutdown.load(Ordering::Acquire) {
                return Ok(());
            }

            let timeout = if self.transport.has_buffered()? || !self.writes.is_empty() {
                Some(Duration::ZERO)
            } else {
                self.next_deadline()
                    .map(|deadline| deadline.saturating_duration_since(Instant::now()))
            };
            if let Err(e) = self.poll.poll(&mut self.readiness, timeout) {
                if e.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e.into());
            }
            if self.shared.shutdown.load(Ordering::Acquire) {
                return Ok(());
            }

            self.pump_writes()?;
            if self.pump_reads()? {
                if self.shared.streams.lock().is_empty() {
                    debug!(generation = self.shared.generation, "peer closed idle connection");
                    return Ok(());
                }
                return Err(Error::ConnectionClosed);
            }
            // Acks and window updates produced by what was just read.
            self.pump_writes()?;
            self.expire_deadlines()?;

            let going_away = self.shared.engine.lock().is_going_away();
            if going_away && self.shared.streams.lock().is_empty() {
                debug!(generation = self.shared.generation, "GOAWAY and no streams left");
                return Ok(());
            }
        }
    }

    /// Move up to one chunk from the channel to the socket.
    fn pump_writes(&mut self) -> Result<()> {
        let mut moved = 0;
        while moved < self.write_chunk {
            match self.writes.try_recv() {
                Ok(bytes) => {
                    moved += bytes.len();
                    self.transport.queue(&bytes)?;
                }
                Err(_) => break,
            }
        }
        let written = self.transport.flush()?;
        metrics::BYTES_SENT.add(written as u64);
        Ok(())
    }

    /// Read until the socket would block. Returns true on EOF.
    fn pump_reads(&mut self) -> Result<bool> {
        loop {
            match self.transport.read(&mut self.buf)? {
                ReadState::Data(n) => {
                    metrics::BYTES_RECEIVED.add(n as u64);
                    self.feed(n)?;
                }
                ReadState::WouldBlock => return Ok(false),
                ReadState::Eof => return Ok(true),
            }
        }
    }

    /// Hand `buf[..n]` to the engine, then dispatch what it produced with
    /// the engine unlocked. Events decoded before a protocol error are still
    /// delivered.
    fn feed(&mut self, n: usize) -> Result<()> {
        let (received, events) = {
            let mut engine = self.shared.engine.lock();
            let received = engine.receive(&self.buf[..n]);
            let events: Vec<H2Event> = std::iter::from_fn(|| engine.poll_event()).collect();
            (received, events)
        };
        self.dispatch(events)?;
        received.map_err(Error::from)
    }

    fn dispatch(&self, events: Vec<H2Event>) -> Result<()> {
        for event in events {
            match event {
                H2Event::Headers {
                    stream_id,
                    headers,
                    end_stream,
                } => {
                    if let Some(stream) = self.stream(stream_id) {
                        guarded(|| stream.on_headers(headers, end_stream))?;
                    }
                }
                H2Event::Data {
                    stream_id,
                    data,
                    end_stream,
                } => {
                    if let Some(stream) = self.stream(stream_id) {
                        guarded(|| stream.on_data(data, end_stream))?;
                    }
                }
                H2Event::Close { stream_id, reset } => {
                    let removed = self.shared.streams.lock().remove(&stream_id);
                    let Some(stream) = removed else {
                        continue;
                    };
                    metrics::STREAMS_ACTIVE.decrement();
                    // A panicking callback stays registered until teardown
                    // has recorded the failure, so `join` cannot miss it.
                    guarded(|| stream.on_close(reset))?;
                    if stream.is_async() {
                        self.shared.in_flight.remove(stream.generation(), stream_id);
                    }
                }
                H2Event::GoAway {
                    last_stream_id,
                    code,
                    ..
                } => {
                    self.shared.draining.store(true, Ordering::Release);
                    debug!(
                        generation = self.shared.generation,
                        last_stream_id,
                        ?code,
                        "connection draining"
                    );
                }
                H2Event::SettingsAcknowledged => trace!("settings acknowledged"),
            }
        }
        Ok(())
    }

    fn stream(&self, stream_id: u32) -> Option<Arc<Stream>> {
        self.shared.streams.lock().get(&stream_id).cloned()
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.shared
            .streams
            .lock()
            .values()
            .filter_map(|stream| stream.deadline())
            .min()
    }

    /// Retire async requests whose timeout passed. Their callbacks get
    /// `None`; the exchange itself is not cancelled.
    fn expire_deadlines(&self) -> Result<()> {
        let now = Instant::now();
        let expired: Vec<Arc<Stream>> = {
            let mut streams = self.shared.streams.lock();
            let ids: Vec<u32> = streams
                .iter()
                .filter(|(_, stream)| stream.deadline().is_some_and(|d| d <= now))
                .map(|(&id, _)| id)
                .collect();
            ids.into_iter().filter_map(|id| streams.remove(&id)).collect()
        };
        let mut outcome = Ok(());
        for stream in expired {
            metrics::STREAMS_ACTIVE.decrement();
            match guarded(|| stream.expire()) {
                Ok(()) => self.shared.in_flight.remove(stream.generation(), stream.id()),
                Err(err) if outcome.is_ok() => outcome = Err(err),
                Err(_) => {}
            }
        }
        outcome
    }

    /// Close the socket, mark the connection dead, then settle every stream
    /// it carried and report the failure once.
    fn teardown(mut self, result: Result<()>) {
        let generation = self.shared.generation;

        // Let a queued GOAWAY reach the peer if the socket still takes it.
        while let Ok(bytes) = self.writes.try_recv() {
            let _ = self.transport.queue(&bytes);
        }
        self.transport.close();
        {
            let _engine = self.shared.engine.lock();
            self.shared.alive.store(false, Ordering::Release);
        }
        let streams: Vec<Arc<Stream>> = self.shared.streams.lock().drain().map(|(_, s)| s).collect();
        for _ in &streams {
            metrics::STREAMS_ACTIVE.decrement();
        }
        metrics::CONNECTIONS_CLOSED.increment();
        metrics::CONNECTIONS_ACTIVE.decrement();

        if self.shared.shutdown.load(Ordering::Acquire) {
            for stream in &streams {
                stream.fail(Error::Closed, false);
            }
            self.shared.in_flight.remove_generation(generation);
            debug!(generation, "I/O thread stopped");
            return;
        }

        let err = match result {
            Err(err) => err,
            Ok(()) if streams.is_empty() => {
                self.shared.in_flight.remove_generation(generation);
                info!(generation, "connection closed");
                return;
            }
            // A stream slipped in while the loop was deciding to stop.
            Ok(()) => Error::ConnectionClosed,
        };
        warn!(generation, error = %err, streams = streams.len(), "connection lost");

        let (waiting, callbacks): (Vec<_>, Vec<_>) =
            streams.into_iter().partition(|stream| !stream.is_async());
        let for_waiting = match self.shared.errors.handler() {
            Some(handler) => {
                let _ = guarded(|| handler(&err));
                Error::Disconnected
            }
            None if !waiting.is_empty() => err.clone(),
            None => {
                self.shared.errors.stash(err.clone());
                Error::Disconnected
            }
        };
        for stream in waiting {
            let _ = guarded(|| stream.fail(for_waiting.clone(), true));
        }
        for stream in callbacks {
            let _ = guarded(|| stream.fail(err.clone(), true));
            self.shared.in_flight.remove(generation, stream.id());
        }
        self.shared.in_flight.remove_generation(generation);
    }
}
