//! Per-request lifecycle notifications.
//!
//! Handlers registered on a request run on the connection's I/O thread, in
//! registration order, in this sequence: [`Event::Headers`] once, then
//! [`Event::BodyChunk`] for every DATA payload, then [`Event::Close`] once.
//! They must not block. A panicking handler takes the connection down.
//! The one exception is the `Close` of a blocking call that timed out, which
//! runs on the calling thread as it gives up.

use crate::response::{Headers, Response};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Headers,
    BodyChunk,
    Close,
}

impl EventKind {
    const COUNT: usize = 3;

    fn index(self) -> usize {
        match self {
            EventKind::Headers => 0,
            EventKind::BodyChunk => 1,
            EventKind::Close => 2,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Event<'a> {
    /// The response head arrived.
    Headers(&'a Headers),
    BodyChunk(&'a [u8]),
    /// The exchange is over. `None` when it ended without a complete
    /// response (reset, timeout, or a dead connection).
    Close(Option<&'a Response>),
}

impl Event<'_> {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Headers(_) => EventKind::Headers,
            Event::BodyChunk(_) => EventKind::BodyChunk,
            Event::Close(_) => EventKind::Close,
        }
    }
}

pub type Handler = Box<dyn FnMut(&Event<'_>) + Send>;

/// Ordered handler lists, one per [`EventKind`].
#[derive(Default)]
pub struct Events {
    handlers: [Vec<Handler>; EventKind::COUNT],
}

impl Events {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&mut self, kind: EventKind, handler: F)
    where
        F: FnMut(&Event<'_>) + Send + 'static,
    {
        self.handlers[kind.index()].push(Box::new(handler));
    }

    pub fn has(&self, kind: EventKind) -> bool {
        !self.handlers[kind.index()].is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.iter().all(Vec::is_empty)
    }

    /// Run every handler registered for the event's kind.
    pub fn emit(&mut self, event: &Event<'_>) {
        for handler in &mut self.handlers[event.kind().index()] {
            handler(event);
        }
    }
}

impl std::fmt::Debug for Events {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Events")
            .field("headers", &self.handlers[0].len())
            .field("body_chunk", &self.handlers[1].len())
            .field("close", &self.handlers[2].len())
            .finish()
    }
}
