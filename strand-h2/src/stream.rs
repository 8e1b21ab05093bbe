//! Per-stream state (RFC 7540 Section 5.1), client side only.

use bytes::BytesMut;

use crate::flow::{RecvWindow, Window};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Id allocated, HEADERS not sent yet.
    Idle,
    Open,
    /// We sent END_STREAM.
    HalfClosedLocal,
    /// Peer sent END_STREAM.
    HalfClosedRemote,
    Closed,
}

#[derive(Debug)]
pub(crate) struct Stream {
    pub state: State,
    pub send: Window,
    pub recv: RecvWindow,
    /// Outbound body bytes waiting for send window.
    pub queued: BytesMut,
    /// END_STREAM goes out with the last queued byte.
    pub queued_end: bool,
}

impl Stream {
    pub fn new(send_window: u32, recv_window: u32) -> Self {
        Self {
            state: State::Idle,
            send: Window::new(send_window),
            recv: RecvWindow::new(recv_window),
            queued: BytesMut::new(),
            queued_end: false,
        }
    }

    /// May we still put body bytes on this stream?
    pub fn can_send(&self) -> bool {
        matches!(self.state, State::Open | State::HalfClosedRemote) && !self.queued_end
    }

    /// May the peer still send HEADERS or DATA on this stream?
    pub fn can_recv(&self) -> bool {
        matches!(self.state, State::Open | State::HalfClosedLocal)
    }

    /// Record our END_STREAM going out.
    pub fn end_local(&mut self) {
        self.state = match self.state {
            State::HalfClosedRemote | State::Closed => State::Closed,
            _ => State::HalfClosedLocal,
        };
    }

    /// Record the peer's END_STREAM.
    pub fn end_remote(&mut self) {
        self.state = match self.state {
            State::HalfClosedLocal | State::Closed => State::Closed,
            _ => State::HalfClosedRemote,
        };
    }
}
