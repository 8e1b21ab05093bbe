use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use strand_h2::{ErrorCode, H2Error};

/// Errors produced by the client.
///
/// `Clone` so that a single connection failure can be handed to every
/// caller blocked on that connection.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The target or request path could not be parsed.
    #[error("invalid uri: {0}")]
    InvalidUri(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("unsupported scheme {0:?}, expected http or https")]
    UnsupportedScheme(String),

    /// Host name resolution failed or yielded no addresses.
    #[error("could not resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: Arc<io::Error>,
    },

    /// TCP connect failed (refused, unreachable, ...).
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("tls: {0}")]
    Tls(#[from] rustls::Error),

    #[error("invalid tls server name: {0}")]
    ServerName(String),

    /// The server did not agree to speak h2.
    #[error("server did not negotiate h2 (got {0:?})")]
    Alpn(Option<String>),

    #[error("h2: {0}")]
    Protocol(#[from] H2Error),

    /// The peer reset the stream before a complete response arrived.
    #[error("stream reset by peer ({0:?})")]
    Reset(ErrorCode),

    #[error("io: {0}")]
    Io(Arc<io::Error>),

    /// The peer closed the socket while requests were outstanding.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// The connection died and its error went to the registered error handler.
    #[error("connection lost")]
    Disconnected,

    /// An event handler or completion callback panicked on the I/O thread.
    #[error("callback panicked: {0}")]
    Callback(String),

    /// `join` gave up with this many requests still outstanding.
    #[error("{0} requests still in flight after join timeout")]
    JoinTimeout(usize),

    /// `close` was called while the request was outstanding.
    #[error("client closed")]
    Closed,
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::InvalidUri(e.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
