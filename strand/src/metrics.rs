//! strand client metrics.
//!
//! Process-wide counters shared by every [`Client`](crate::Client). They are
//! registered with metriken and show up in any exposition the process sets up.

use metriken::{Counter, Gauge, metric};

// ── Connection lifecycle ─────────────────────────────────────────

#[metric(
    name = "strand/connections/opened",
    description = "Connections established"
)]
pub static CONNECTIONS_OPENED: Counter = Counter::new();

#[metric(
    name = "strand/connections/failed",
    description = "Connection attempts that failed during establishment"
)]
pub static CONNECTIONS_FAILED: Counter = Counter::new();

#[metric(
    name = "strand/connections/closed",
    description = "Connections torn down, for any reason"
)]
pub static CONNECTIONS_CLOSED: Counter = Counter::new();

#[metric(
    name = "strand/connections/active",
    description = "Connections with a running I/O thread"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

// ── Requests ─────────────────────────────────────────────────────

#[metric(name = "strand/requests/started", description = "Requests sent")]
pub static REQUESTS_STARTED: Counter = Counter::new();

#[metric(
    name = "strand/requests/completed",
    description = "Requests that received a complete response"
)]
pub static REQUESTS_COMPLETED: Counter = Counter::new();

#[metric(
    name = "strand/requests/timed_out",
    description = "Requests whose caller stopped waiting before the response arrived"
)]
pub static REQUESTS_TIMED_OUT: Counter = Counter::new();

#[metric(
    name = "strand/streams/active",
    description = "Streams registered on live connections"
)]
pub static STREAMS_ACTIVE: Gauge = Gauge::new();

#[metric(
    name = "strand/callbacks/panicked",
    description = "Event handlers or completion callbacks that panicked"
)]
pub static CALLBACK_PANICS: Counter = Counter::new();

// ── Bytes ────────────────────────────────────────────────────────

#[metric(
    name = "strand/bytes/sent",
    description = "Bytes written to sockets"
)]
pub static BYTES_SENT: Counter = Counter::new();

#[metric(
    name = "strand/bytes/received",
    description = "Bytes read from sockets"
)]
pub static BYTES_RECEIVED: Counter = Counter::new();
