//! Client-side HTTP/2 connection state machine.
//!
//! [`Connection`] owns no socket. Received bytes go in through
//! [`Connection::receive`]; the frames it produces leave through the hook
//! installed with [`Connection::on_frame`] (or [`Connection::take_pending_send`]
//! when no hook is installed); stream activity is drained with
//! [`Connection::poll_event`].

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, trace, warn};

use crate::closed::{DEFAULT_GRACE, RecentlyClosed};
use crate::error::{ErrorCode, H2Error};
use crate::flow::{DEFAULT_WINDOW, RecvWindow, Window};
use crate::frame::Frame;
use crate::hpack::{Decoder, Encoder, HeaderField};
use crate::settings::Settings;
use crate::stream::{State, Stream};

/// Client connection preface (RFC 7540 Section 3.5).
pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

const MAX_STREAM_ID: u32 = 0x7fff_ffff;

/// Receives every chunk of encoded outbound frames.
pub type FrameHook = Box<dyn FnMut(Bytes) + Send>;

/// Stream and connection activity produced by [`Connection::receive`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A complete header block: the response head, or trailers.
    Headers {
        stream_id: u32,
        headers: Vec<HeaderField>,
        end_stream: bool,
    },
    Data {
        stream_id: u32,
        data: Bytes,
        end_stream: bool,
    },
    /// The stream reached the closed state. `reset` carries the RST_STREAM
    /// code when it did not end cleanly.
    Close {
        stream_id: u32,
        reset: Option<ErrorCode>,
    },
    GoAway {
        last_stream_id: u32,
        code: ErrorCode,
        debug: Bytes,
    },
    SettingsAcknowledged,
}

/// A header block spread over HEADERS and CONTINUATION frames.
struct PartialBlock {
    stream_id: u32,
    block: BytesMut,
    end_stream: bool,
}

/// How to treat a frame whose stream is not in the active table.
enum Unknown {
    /// Never opened by us; a protocol error.
    Idle,
    /// Closed within the grace period.
    Recent,
    /// Closed long ago.
    Expired,
}

pub struct Connection {
    local: Settings,
    remote: Settings,
    streams: HashMap<u32, Stream>,
    closed: RecentlyClosed,
    next_stream_id: u32,
    send_window: Window,
    recv_window: RecvWindow,
    encoder: Encoder,
    decoder: Decoder,
    partial: Option<PartialBlock>,
    inbuf: BytesMut,
    out: BytesMut,
    hook: Option<FrameHook>,
    events: VecDeque<Event>,
    going_away: bool,
    now: Instant,
}

impl Connection {
    /// Create a connection and queue the preface, our SETTINGS and, when
    /// our window is larger than the default, a connection WINDOW_UPDATE.
    pub fn new(settings: Settings) -> Self {
        let extra = settings.initial_window_size.saturating_sub(DEFAULT_WINDOW);
        let mut conn = Self {
            remote: Settings::default(),
            streams: HashMap::new(),
            closed: RecentlyClosed::new(DEFAULT_GRACE),
            next_stream_id: 1,
            send_window: Window::default(),
            recv_window: RecvWindow::new(DEFAULT_WINDOW + extra),
            encoder: Encoder::new(),
            decoder: Decoder::new(settings.header_table_size as usize),
            partial: None,
            inbuf: BytesMut::new(),
            out: BytesMut::new(),
            hook: None,
            events: VecDeque::new(),
            going_away: false,
            now: Instant::now(),
            local: settings,
        };
        conn.out.extend_from_slice(PREFACE);
        conn.write(Frame::Settings {
            ack: false,
            params: conn.local.to_params(),
        });
        if extra > 0 {
            conn.write(Frame::WindowUpdate {
                stream_id: 0,
                increment: extra,
            });
        }
        conn
    }

    /// Install the outbound hook. Anything already queued (the preface at
    /// least) is handed to it immediately.
    pub fn on_frame<F>(&mut self, hook: F)
    where
        F: FnMut(Bytes) + Send + 'static,
    {
        self.hook = Some(Box::new(hook));
        self.flush();
    }

    /// How long a closed stream id is remembered.
    pub fn set_closed_stream_grace(&mut self, grace: Duration) {
        self.closed.set_grace(grace);
    }

    /// Bytes queued while no hook is installed.
    pub fn take_pending_send(&mut self) -> Bytes {
        self.out.split().freeze()
    }

    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// GOAWAY was received or sent; no new streams will be accepted.
    pub fn is_going_away(&self) -> bool {
        self.going_away
    }

    /// Streams allocated and not yet closed.
    pub fn active_streams(&self) -> usize {
        self.streams.len()
    }

    /// Closed stream ids still inside the grace period.
    pub fn recently_closed(&self) -> usize {
        self.closed.len()
    }

    /// Allocate the next client stream id.
    pub fn new_stream(&mut self) -> Result<u32, H2Error> {
        if self.going_away {
            return Err(H2Error::GoingAway);
        }
        if let Some(limit) = self.remote.max_concurrent_streams
            && self.streams.len() >= limit as usize
        {
            return Err(H2Error::StreamLimit(limit));
        }
        if self.next_stream_id > MAX_STREAM_ID {
            return Err(H2Error::StreamIdsExhausted);
        }
        let id = self.next_stream_id;
        self.next_stream_id += 2;
        self.streams.insert(
            id,
            Stream::new(self.remote.initial_window_size, self.local.initial_window_size),
        );
        trace!(stream_id = id, "stream allocated");
        Ok(id)
    }

    /// Send the request head on a freshly allocated stream. Pseudo-headers
    /// are moved to the front; the block is split into CONTINUATION frames
    /// to respect the peer's frame size.
    pub fn send_headers(
        &mut self,
        stream_id: u32,
        fields: &[HeaderField],
        end_stream: bool,
    ) -> Result<(), H2Error> {
        self.now = Instant::now();
        let stream = self
            .streams
            .get_mut(&stream_id)
            .filter(|s| s.state == State::Idle)
            .ok_or(H2Error::StreamNotWritable(stream_id))?;
        stream.state = State::Open;
        if end_stream {
            stream.end_local();
        }

        let (pseudo, regular): (Vec<HeaderField>, Vec<HeaderField>) =
            fields.iter().cloned().partition(HeaderField::is_pseudo);
        let mut block = BytesMut::new();
        self.encoder.encode(&pseudo, &mut block);
        self.encoder.encode(&regular, &mut block);

        let max = self.remote.max_frame_size as usize;
        let mut first = true;
        loop {
            let chunk = block.split_to(block.len().min(max)).freeze();
            let end_headers = block.is_empty();
            let frame = if first {
                Frame::Headers {
                    stream_id,
                    block: chunk,
                    end_stream,
                    end_headers,
                }
            } else {
                Frame::Continuation {
                    stream_id,
                    block: chunk,
                    end_headers,
                }
            };
            self.write(frame);
            first = false;
            if end_headers {
                break;
            }
        }
        self.flush();
        Ok(())
    }

    /// Queue body bytes. They go out as DATA frames as far as the send
    /// windows allow; the rest waits for WINDOW_UPDATE.
    pub fn send_data(
        &mut self,
        stream_id: u32,
        data: &[u8],
        end_stream: bool,
    ) -> Result<(), H2Error> {
        self.now = Instant::now();
        let stream = self
            .streams
            .get_mut(&stream_id)
            .filter(|s| s.can_send())
            .ok_or(H2Error::StreamNotWritable(stream_id))?;
        stream.queued.extend_from_slice(data);
        stream.queued_end = end_stream;
        self.drain_stream(stream_id);
        self.flush();
        Ok(())
    }

    /// Feed bytes read from the transport.
    pub fn receive(&mut self, data: &[u8]) -> Result<(), H2Error> {
        self.receive_at(data, Instant::now())
    }

    /// [`receive`](Self::receive) with an explicit clock, which drives
    /// expiry of closed stream ids.
    ///
    /// On error a GOAWAY carrying the matching code is queued; the
    /// connection must not be used afterwards.
    pub fn receive_at(&mut self, data: &[u8], now: Instant) -> Result<(), H2Error> {
        self.now = now;
        self.closed.purge(now);
        self.inbuf.extend_from_slice(data);
        let result = self.process();
        if let Err(e) = &result {
            warn!(error = %e, "connection error, sending GOAWAY");
            self.going_away = true;
            self.write(Frame::GoAway {
                last_stream_id: 0,
                code: e.code(),
                debug: Bytes::new(),
            });
        }
        self.flush();
        result
    }

    fn process(&mut self) -> Result<(), H2Error> {
        while let Some((frame, used)) = Frame::decode(&self.inbuf, self.local.max_frame_size)? {
            self.inbuf.advance(used);
            trace!(frame = frame.name(), stream_id = frame.stream_id(), "recv");
            self.handle(frame)?;
        }
        Ok(())
    }

    fn handle(&mut self, frame: Frame) -> Result<(), H2Error> {
        if let Some(partial) = &self.partial {
            let continues = matches!(
                &frame,
                Frame::Continuation { stream_id, .. } if *stream_id == partial.stream_id
            );
            if !continues {
                return Err(H2Error::Protocol(format!(
                    "expected CONTINUATION for stream {}, got {}",
                    partial.stream_id,
                    frame.name()
                )));
            }
        }

        match frame {
            Frame::Settings { ack: true, .. } => {
                self.events.push_back(Event::SettingsAcknowledged);
            }
            Frame::Settings { ack: false, params } => {
                let old_window = self.remote.initial_window_size;
                self.remote.apply(&params);
                let delta =
                    i64::from(self.remote.initial_window_size) - i64::from(old_window);
                if delta != 0 {
                    for stream in self.streams.values_mut() {
                        stream.send.shift(delta)?;
                    }
                }
                debug!(settings = ?self.remote, "peer settings applied");
                self.write(Frame::Settings {
                    ack: true,
                    params: Vec::new(),
                });
                self.drain_all();
            }
            Frame::Headers {
                stream_id,
                block,
                end_stream,
                end_headers,
            } => {
                if end_headers {
                    self.on_header_block(stream_id, &block, end_stream)?;
                } else {
                    self.partial = Some(PartialBlock {
                        stream_id,
                        block: BytesMut::from(&block[..]),
                        end_stream,
                    });
                }
            }
            Frame::Continuation {
                block, end_headers, ..
            } => {
                let Some(partial) = self.partial.as_mut() else {
                    return Err(H2Error::Protocol("CONTINUATION without HEADERS".into()));
                };
                partial.block.extend_from_slice(&block);
                if end_headers && let Some(done) = self.partial.take() {
                    self.on_header_block(done.stream_id, &done.block, done.end_stream)?;
                }
            }
            Frame::Data {
                stream_id,
                payload,
                end_stream,
                flow_len,
            } => self.on_data(stream_id, payload, end_stream, flow_len)?,
            Frame::RstStream { stream_id, code } => {
                match self.streams.get(&stream_id).map(|s| s.state) {
                    Some(State::Idle) => return Err(idle_stream("RST_STREAM", stream_id)),
                    Some(_) => {
                        debug!(stream_id, ?code, "stream reset by peer");
                        self.close_stream(stream_id, Some(code));
                    }
                    None => self.on_unknown(stream_id, "RST_STREAM", false)?,
                }
            }
            Frame::Ping { ack: false, payload } => {
                self.write(Frame::Ping { ack: true, payload });
            }
            Frame::Ping { ack: true, .. } => {}
            Frame::GoAway {
                last_stream_id,
                code,
                debug,
            } => self.on_goaway(last_stream_id, code, debug),
            Frame::WindowUpdate {
                stream_id: 0,
                increment,
            } => {
                self.send_window.grow(increment)?;
                self.drain_all();
            }
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => {
                let outcome = self
                    .streams
                    .get_mut(&stream_id)
                    .map(|s| (s.state, s.send.grow(increment)));
                match outcome {
                    Some((State::Idle, _)) => {
                        return Err(idle_stream("WINDOW_UPDATE", stream_id));
                    }
                    Some((_, Err(_))) => self.reset(stream_id, ErrorCode::FlowControlError),
                    Some((_, Ok(()))) => self.drain_stream(stream_id),
                    None => self.on_unknown(stream_id, "WINDOW_UPDATE", false)?,
                }
            }
            Frame::PushPromise { .. } => {
                return Err(H2Error::Protocol("PUSH_PROMISE with push disabled".into()));
            }
            Frame::Priority { .. } | Frame::Unknown { .. } => {}
        }
        Ok(())
    }

    fn on_header_block(
        &mut self,
        stream_id: u32,
        block: &[u8],
        end_stream: bool,
    ) -> Result<(), H2Error> {
        // Decode even when the stream is gone: the block may update the
        // dynamic table the peer's later blocks refer to.
        let headers = self.decoder.decode(block)?;
        match self.streams.get(&stream_id).map(|s| (s.state, s.can_recv())) {
            Some((State::Idle, _)) => return Err(idle_stream("HEADERS", stream_id)),
            Some((_, true)) => {
                self.events.push_back(Event::Headers {
                    stream_id,
                    headers,
                    end_stream,
                });
                if end_stream {
                    self.end_remote(stream_id);
                }
            }
            Some((_, false)) => self.reset(stream_id, ErrorCode::StreamClosed),
            None => self.on_unknown(stream_id, "HEADERS", true)?,
        }
        Ok(())
    }

    fn on_data(
        &mut self,
        stream_id: u32,
        payload: Bytes,
        end_stream: bool,
        flow_len: u32,
    ) -> Result<(), H2Error> {
        // The connection window counts every DATA frame, wanted or not.
        self.recv_window.receive(flow_len)?;

        match self.streams.get_mut(&stream_id) {
            Some(stream) if stream.state == State::Idle => {
                return Err(idle_stream("DATA", stream_id));
            }
            Some(stream) if stream.can_recv() => {
                let accepted = stream.recv.receive(flow_len).is_ok();
                let credit = if accepted && !end_stream {
                    stream.recv.replenish()
                } else {
                    None
                };
                if !accepted {
                    self.reset(stream_id, ErrorCode::FlowControlError);
                } else {
                    if let Some(increment) = credit {
                        self.write(Frame::WindowUpdate {
                            stream_id,
                            increment,
                        });
                    }
                    if !payload.is_empty() || end_stream {
                        self.events.push_back(Event::Data {
                            stream_id,
                            data: payload,
                            end_stream,
                        });
                    }
                    if end_stream {
                        self.end_remote(stream_id);
                    }
                }
            }
            Some(_) => self.reset(stream_id, ErrorCode::StreamClosed),
            None => self.on_unknown(stream_id, "DATA", true)?,
        }

        if let Some(increment) = self.recv_window.replenish() {
            self.write(Frame::WindowUpdate {
                stream_id: 0,
                increment,
            });
        }
        Ok(())
    }

    fn on_goaway(&mut self, last_stream_id: u32, code: ErrorCode, debug: Bytes) {
        self.going_away = true;
        if code == ErrorCode::NoError {
            debug!(last_stream_id, "peer is going away");
        } else {
            let reason = String::from_utf8_lossy(&debug).into_owned();
            warn!(last_stream_id, ?code, %reason, "peer sent GOAWAY");
        }
        self.events.push_back(Event::GoAway {
            last_stream_id,
            code,
            debug,
        });
        let mut refused: Vec<u32> = self
            .streams
            .keys()
            .copied()
            .filter(|&id| id > last_stream_id)
            .collect();
        refused.sort_unstable();
        for id in refused {
            self.close_stream(id, Some(ErrorCode::RefusedStream));
        }
    }

    fn on_unknown(&mut self, stream_id: u32, what: &str, answer: bool) -> Result<(), H2Error> {
        let class = if stream_id % 2 == 0 || stream_id >= self.next_stream_id {
            Unknown::Idle
        } else if self.closed.contains(stream_id) {
            Unknown::Recent
        } else {
            Unknown::Expired
        };
        match class {
            Unknown::Idle => Err(idle_stream(what, stream_id)),
            Unknown::Recent => {
                trace!(stream_id, frame = what, "ignoring frame for recently closed stream");
                Ok(())
            }
            Unknown::Expired => {
                debug!(stream_id, frame = what, "frame for long-closed stream");
                if answer {
                    self.write(Frame::RstStream {
                        stream_id,
                        code: ErrorCode::StreamClosed,
                    });
                }
                Ok(())
            }
        }
    }

    fn end_remote(&mut self, stream_id: u32) {
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.end_remote();
            if stream.state == State::Closed {
                self.close_stream(stream_id, None);
            }
        }
    }

    fn reset(&mut self, stream_id: u32, code: ErrorCode) {
        debug!(stream_id, ?code, "resetting stream");
        self.write(Frame::RstStream { stream_id, code });
        self.close_stream(stream_id, Some(code));
    }

    fn close_stream(&mut self, stream_id: u32, reset: Option<ErrorCode>) {
        if self.streams.remove(&stream_id).is_some() {
            self.closed.insert(stream_id, self.now);
            self.events.push_back(Event::Close { stream_id, reset });
        }
    }

    /// Move as much queued body as the windows allow onto the wire.
    fn drain_stream(&mut self, stream_id: u32) {
        let max_frame = self.remote.max_frame_size as usize;
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        while matches!(stream.state, State::Open | State::HalfClosedRemote) {
            if stream.queued.is_empty() {
                if stream.queued_end {
                    Frame::data(stream_id, Bytes::new(), true).encode(&mut self.out);
                    stream.end_local();
                }
                break;
            }
            let n = stream
                .queued
                .len()
                .min(self.send_window.available())
                .min(stream.send.available())
                .min(max_frame);
            if n == 0 {
                trace!(stream_id, queued = stream.queued.len(), "blocked on flow control");
                break;
            }
            let payload = stream.queued.split_to(n).freeze();
            let end = stream.queued_end && stream.queued.is_empty();
            // `n` is within both windows, so neither consume can fail.
            let _ = self.send_window.consume(n as u32);
            let _ = stream.send.consume(n as u32);
            Frame::data(stream_id, payload, end).encode(&mut self.out);
            if end {
                stream.end_local();
                break;
            }
        }
        if stream.state == State::Closed {
            self.close_stream(stream_id, None);
        }
    }

    fn drain_all(&mut self) {
        let mut waiting: Vec<u32> = self
            .streams
            .iter()
            .filter(|(_, s)| !s.queued.is_empty())
            .map(|(&id, _)| id)
            .collect();
        waiting.sort_unstable();
        for id in waiting {
            self.drain_stream(id);
        }
    }

    fn write(&mut self, frame: Frame) {
        trace!(frame = frame.name(), stream_id = frame.stream_id(), "send");
        frame.encode(&mut self.out);
    }

    fn flush(&mut self) {
        if self.out.is_empty() {
            return;
        }
        if let Some(hook) = self.hook.as_mut() {
            hook(self.out.split().freeze());
        }
    }
}

fn idle_stream(what: &str, stream_id: u32) -> H2Error {
    H2Error::Protocol(format!("{what} on idle stream {stream_id}"))
}
