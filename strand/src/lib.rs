//! Thread-safe HTTP/2 client over a single multiplexed connection.
//!
//! Any number of threads share one [`Client`]. Each call becomes one HTTP/2
//! stream on the same TCP (or TLS) connection; a dedicated I/O thread owns
//! the socket, and callers never touch it.
//!
//! # Architecture
//!
//! The wire protocol lives in the sans-IO `strand-h2` crate. This crate
//! adds the threads around it:
//!
//! - Callers encode their request through the engine (under its mutex).
//!   The engine's frame hook pushes the bytes into a channel.
//! - The I/O thread waits on the socket and the channel with mio, writes
//!   channel bytes out, feeds socket bytes to the engine, and dispatches the
//!   resulting events to the stream each request owns.
//! - Sync calls block on a per-stream condition variable; async calls run
//!   their callback on the I/O thread when the stream closes.
//! - When the connection dies the I/O thread closes the socket, fails the
//!   streams it carried, and the next call reconnects.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use strand::{CallOptions, Client, EventKind, Event};
//!
//! let client = Client::new("https://example.com")?;
//!
//! let response = client
//!     .post("/items", CallOptions::new().body("{}").header("content-type", "application/json"))?
//!     .expect("timed out");
//! assert!(response.is_ok());
//!
//! let options = CallOptions::new()
//!     .timeout(Duration::from_secs(5))
//!     .on(EventKind::BodyChunk, |event| {
//!         if let Event::BodyChunk(chunk) = event {
//!             println!("{} bytes", chunk.len());
//!         }
//!     });
//! client.get_async("/large", options, |response| {
//!     println!("finished: {}", response.is_some());
//! })?;
//! client.join(Some(Duration::from_secs(10)))?;
//! # Ok::<(), strand::Error>(())
//! ```

mod client;
pub mod config;
mod connection;
pub mod error;
pub mod event;
pub mod metrics;
mod query;
mod registry;
pub mod request;
pub mod response;
mod socket;
mod stream;

pub use client::Client;
pub use config::{ClientBuilder, Config};
pub use error::{Error, Result};
pub use event::{Event, EventKind};
pub use request::{CallOptions, Request};
pub use response::{Headers, Response};

pub use strand_h2::{ErrorCode, Settings};
