//! One request/response exchange on a shared connection.
//!
//! Caller threads create a [`Stream`] and wait on it; the I/O thread feeds it
//! header and data events and completes it. The completion flag is written
//! only by the I/O thread (or by `close`, which discards), exactly once.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use parking_lot::{Condvar, Mutex};
use strand_h2::{ErrorCode, HeaderField};
use tracing::{trace, warn};

use crate::error::{Error, Result};
use crate::event::{Event, EventKind, Events};
use crate::metrics;
use crate::response::{self, Headers, Response};

/// Invoked once with the response, or `None` when none arrived in time.
pub type Completion = Box<dyn FnOnce(Option<Response>) + Send>;

#[derive(Debug, Clone)]
enum Phase {
    Open,
    AwaitingResponse,
    Completed(Response),
    /// An async request whose deadline passed.
    Expired,
    Failed(Error),
}

impl Phase {
    fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed(_) | Phase::Expired | Phase::Failed(_))
    }
}

struct State {
    phase: Phase,
    headers: Headers,
    /// The first header block has been seen; later ones are trailers.
    head_seen: bool,
    remote_done: bool,
    body: BytesMut,
    on_complete: Option<Completion>,
}

pub(crate) struct Stream {
    id: u32,
    generation: u64,
    deadline: Option<Instant>,
    is_async: bool,
    state: Mutex<State>,
    done: Condvar,
    // Only the I/O thread emits, so this lock is uncontended.
    events: Mutex<Events>,
}

impl Stream {
    pub(crate) fn new(
        id: u32,
        generation: u64,
        events: Events,
        on_complete: Option<Completion>,
        deadline: Option<Instant>,
    ) -> Self {
        Self {
            id,
            generation,
            deadline,
            is_async: on_complete.is_some(),
            state: Mutex::new(State {
                phase: Phase::Open,
                headers: Headers::new(),
                head_seen: false,
                remote_done: false,
                body: BytesMut::new(),
                on_complete,
            }),
            done: Condvar::new(),
            events: Mutex::new(events),
        }
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn is_async(&self) -> bool {
        self.is_async
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Headers and body are on their way.
    pub(crate) fn mark_sent(&self) {
        let mut state = self.state.lock();
        if matches!(state.phase, Phase::Open) {
            state.phase = Phase::AwaitingResponse;
        }
    }

    #[cfg(test)]
    fn is_finished(&self) -> bool {
        self.state.lock().phase.is_terminal()
    }

    /// Block until the stream finishes or `timeout` elapses. `Ok(None)`
    /// means the caller stopped waiting; the exchange itself goes on.
    pub(crate) fn wait(&self, timeout: Duration) -> Result<Option<Response>> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        loop {
            match &state.phase {
                Phase::Completed(response) => return Ok(Some(response.clone())),
                Phase::Failed(err) => return Err(err.clone()),
                Phase::Expired => return Ok(None),
                Phase::Open | Phase::AwaitingResponse => {}
            }
            match deadline {
                Some(deadline) => {
                    if self.done.wait_until(&mut state, deadline).timed_out()
                        && !state.phase.is_terminal()
                    {
                        return Ok(None);
                    }
                }
                None => self.done.wait(&mut state),
            }
        }
    }

    // Handlers are emitted with the events lock held from before the phase
    // check, so nothing is emitted after `finish` has emitted `Close`.
    pub(crate) fn on_headers(&self, fields: Vec<HeaderField>, end_stream: bool) {
        let mut events = self.events.lock();
        let snapshot = {
            let mut state = self.state.lock();
            if state.phase.is_terminal() {
                return;
            }
            response::merge(&mut state.headers, fields);
            state.remote_done |= end_stream;
            let first = !state.head_seen;
            state.head_seen = true;
            (first && events.has(EventKind::Headers)).then(|| state.headers.clone())
        };
        if let Some(headers) = snapshot {
            events.emit(&Event::Headers(&headers));
        }
    }

    pub(crate) fn on_data(&self, data: Bytes, end_stream: bool) {
        let mut events = self.events.lock();
        {
            let mut state = self.state.lock();
            if state.phase.is_terminal() {
                return;
            }
            state.body.extend_from_slice(&data);
            state.remote_done |= end_stream;
        }
        if !data.is_empty() {
            events.emit(&Event::BodyChunk(&data));
        }
    }

    /// The engine closed the stream. A clean close, or a `NO_ERROR` reset
    /// after the peer finished its response, completes the stream; any
    /// other reset fails it.
    pub(crate) fn on_close(&self, reset: Option<ErrorCode>) {
        let outcome = {
            let mut state = self.state.lock();
            match reset {
                None => Ok(()),
                Some(ErrorCode::NoError) if state.remote_done => Ok(()),
                Some(code) => Err(Error::Reset(code)),
            }
            .map(|()| {
                let headers = std::mem::take(&mut state.headers);
                let body = state.body.split().freeze();
                Response::new(headers, body)
            })
        };
        match outcome {
            Ok(response) => {
                metrics::REQUESTS_COMPLETED.increment();
                self.finish(Phase::Completed(response), true);
            }
            Err(err) => self.finish(Phase::Failed(err), true),
        }
    }

    /// The deadline passed: `Close` handlers and the callback get `None`.
    /// Called by the I/O thread for async requests and by the waiting
    /// caller for sync ones.
    pub(crate) fn expire(&self) {
        trace!(stream_id = self.id, is_async = self.is_async, "request timed out");
        metrics::REQUESTS_TIMED_OUT.increment();
        self.finish(Phase::Expired, true);
    }

    /// The connection is gone. With `notify`, handlers and the completion
    /// callback still run (with no response); without, they are dropped.
    pub(crate) fn fail(&self, err: Error, notify: bool) {
        self.finish(Phase::Failed(err), notify);
    }

    fn finish(&self, phase: Phase, notify: bool) {
        let (response, callback) = {
            let mut state = self.state.lock();
            if state.phase.is_terminal() {
                return;
            }
            let response = match &phase {
                Phase::Completed(response) => Some(response.clone()),
                _ => None,
            };
            state.phase = phase;
            self.done.notify_all();
            (response, state.on_complete.take())
        };
        if !notify {
            return;
        }
        self.events.lock().emit(&Event::Close(response.as_ref()));
        if let Some(callback) = callback {
            callback(response);
        }
    }
}

/// Run `f`, turning a panic into [`Error::Callback`].
pub(crate) fn guarded<F: FnOnce()>(f: F) -> Result<()> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
        metrics::CALLBACK_PANICS.increment();
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        warn!(%message, "callback panicked on the I/O thread");
        Error::Callback(message)
    })
}
