//! Sans-IO HTTP/2 client engine.
//!
//! The engine never touches a socket. The owner feeds it received bytes and
//! collects the frames it wants written through a hook:
//!
//! ```text
//!   caller threads                 I/O thread
//!        |                             |
//!   new_stream / send_headers     receive(bytes)
//!   send_data                          |
//!        \                             v
//!         +-------> Connection --> poll_event(): Headers, Data, Close, GoAway
//!                       |
//!                  on_frame(hook) --> bytes to write
//! ```
//!
//! # Example
//!
//! ```rust
//! use strand_h2::{Connection, Event, HeaderField, Settings};
//!
//! let mut h2 = Connection::new(Settings::client_default());
//! let preface = h2.take_pending_send();
//! assert!(preface.starts_with(strand_h2::PREFACE));
//!
//! let id = h2.new_stream().unwrap();
//! h2.send_headers(id, &[
//!     HeaderField::new(":method", "GET"),
//!     HeaderField::new(":scheme", "https"),
//!     HeaderField::new(":path", "/"),
//!     HeaderField::new(":authority", "example.com"),
//! ], true).unwrap();
//! let request = h2.take_pending_send();
//! assert!(!request.is_empty());
//!
//! while let Some(event) = h2.poll_event() {
//!     if let Event::Close { stream_id, .. } = event {
//!         println!("stream {stream_id} finished");
//!     }
//! }
//! ```

mod closed;
pub mod connection;
pub mod error;
pub mod flow;
pub mod frame;
pub mod hpack;
pub mod settings;
mod stream;

pub use closed::DEFAULT_GRACE;
pub use connection::{Connection, Event, FrameHook, PREFACE};
pub use error::{ErrorCode, H2Error};
pub use frame::Frame;
pub use hpack::HeaderField;
pub use settings::{Setting, Settings};
