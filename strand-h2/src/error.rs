/// HTTP/2 error codes (RFC 7540 Section 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSizeError = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    CompressionError = 0x9,
    ConnectError = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

impl From<u32> for ErrorCode {
    /// Unknown codes are treated as `InternalError` (RFC 7540 Section 7).
    fn from(raw: u32) -> Self {
        const KNOWN: [ErrorCode; 14] = [
            ErrorCode::NoError,
            ErrorCode::ProtocolError,
            ErrorCode::InternalError,
            ErrorCode::FlowControlError,
            ErrorCode::SettingsTimeout,
            ErrorCode::StreamClosed,
            ErrorCode::FrameSizeError,
            ErrorCode::RefusedStream,
            ErrorCode::Cancel,
            ErrorCode::CompressionError,
            ErrorCode::ConnectError,
            ErrorCode::EnhanceYourCalm,
            ErrorCode::InadequateSecurity,
            ErrorCode::Http11Required,
        ];
        KNOWN
            .get(raw as usize)
            .copied()
            .unwrap_or(ErrorCode::InternalError)
    }
}

/// Errors produced by the HTTP/2 engine.
///
/// Every variant is a connection-level failure unless noted otherwise; the
/// owner of the engine is expected to tear the transport down on receipt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum H2Error {
    #[error("frame size error")]
    FrameSize,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("header compression error: {0}")]
    Compression(&'static str),

    #[error("flow control error")]
    FlowControl,

    /// The peer sent GOAWAY, or we did; no new streams may be opened.
    #[error("connection is going away")]
    GoingAway,

    /// The peer's MAX_CONCURRENT_STREAMS would be exceeded.
    #[error("concurrent stream limit of {0} reached")]
    StreamLimit(u32),

    /// Stream ids are exhausted (2^31 - 1 reached).
    #[error("stream ids exhausted")]
    StreamIdsExhausted,

    /// A send was attempted on a stream that is not open for sending.
    /// This is a usage error and does not affect the connection.
    #[error("stream {0} is not writable")]
    StreamNotWritable(u32),
}

impl H2Error {
    /// Error code to advertise in a GOAWAY for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::FrameSize => ErrorCode::FrameSizeError,
            Self::Protocol(_) => ErrorCode::ProtocolError,
            Self::Compression(_) => ErrorCode::CompressionError,
            Self::FlowControl => ErrorCode::FlowControlError,
            Self::GoingAway | Self::StreamLimit(_) => ErrorCode::RefusedStream,
            Self::StreamIdsExhausted => ErrorCode::NoError,
            Self::StreamNotWritable(_) => ErrorCode::StreamClosed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_from_wire() {
        assert_eq!(ErrorCode::from(0x0), ErrorCode::NoError);
        assert_eq!(ErrorCode::from(0x8), ErrorCode::Cancel);
        assert_eq!(ErrorCode::from(0xd), ErrorCode::Http11Required);
        assert_eq!(ErrorCode::from(0xff), ErrorCode::InternalError);
    }

    #[test]
    fn error_code_discriminants_match_wire() {
        for raw in 0..=0xd {
            assert_eq!(ErrorCode::from(raw) as u32, raw);
        }
    }
}
