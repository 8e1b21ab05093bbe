//! Frame codec (RFC 7540 Section 4 and 6).
//!
//! Every frame starts with a fixed 9-byte header:
//! ```text
//! +-----------------------------------------------+
//! |                 Length (24)                   |
//! +---------------+---------------+---------------+
//! |   Type (8)    |   Flags (8)   |
//! +-+-------------+---------------+-------------------------------+
//! |R|                 Stream Identifier (31)                      |
//! +=+=============================================================+
//! |                   Frame Payload (0...)                      ...
//! +---------------------------------------------------------------+
//! ```

use bytes::{Buf, BufMut, Bytes};

use crate::error::{ErrorCode, H2Error};
use crate::settings::Setting;

/// Frame header size in bytes.
pub const HEADER_LEN: usize = 9;

const STREAM_ID_MASK: u32 = 0x7fff_ffff;

/// Frame type identifiers.
pub mod kind {
    pub const DATA: u8 = 0x0;
    pub const HEADERS: u8 = 0x1;
    pub const PRIORITY: u8 = 0x2;
    pub const RST_STREAM: u8 = 0x3;
    pub const SETTINGS: u8 = 0x4;
    pub const PUSH_PROMISE: u8 = 0x5;
    pub const PING: u8 = 0x6;
    pub const GOAWAY: u8 = 0x7;
    pub const WINDOW_UPDATE: u8 = 0x8;
    pub const CONTINUATION: u8 = 0x9;
}

/// Frame flag bits. Meaning depends on the frame type.
pub mod flags {
    pub const END_STREAM: u8 = 0x1;
    pub const ACK: u8 = 0x1;
    pub const END_HEADERS: u8 = 0x4;
    pub const PADDED: u8 = 0x8;
    pub const PRIORITY: u8 = 0x20;
}

/// The fixed 9-byte frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Head {
    pub length: u32,
    pub kind: u8,
    pub flags: u8,
    pub stream_id: u32,
}

impl Head {
    /// Parse a header from the front of `src`; `None` if fewer than 9 bytes.
    pub fn parse(mut src: &[u8]) -> Option<Head> {
        if src.len() < HEADER_LEN {
            return None;
        }
        let length = src.get_uint(3) as u32;
        let kind = src.get_u8();
        let flags = src.get_u8();
        let stream_id = src.get_u32() & STREAM_ID_MASK;
        Some(Head {
            length,
            kind,
            flags,
            stream_id,
        })
    }

    pub fn encode<B: BufMut>(&self, dst: &mut B) {
        dst.put_uint(u64::from(self.length), 3);
        dst.put_u8(self.kind);
        dst.put_u8(self.flags);
        dst.put_u32(self.stream_id & STREAM_ID_MASK);
    }

    fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data {
        stream_id: u32,
        payload: Bytes,
        end_stream: bool,
        /// Payload length on the wire including padding; this is what
        /// counts against flow-control windows.
        flow_len: u32,
    },
    Headers {
        stream_id: u32,
        block: Bytes,
        end_stream: bool,
        end_headers: bool,
    },
    /// Priority signals are parsed for validation and otherwise ignored.
    Priority {
        stream_id: u32,
    },
    RstStream {
        stream_id: u32,
        code: ErrorCode,
    },
    Settings {
        ack: bool,
        params: Vec<Setting>,
    },
    PushPromise {
        stream_id: u32,
        promised_id: u32,
        block: Bytes,
        end_headers: bool,
    },
    Ping {
        ack: bool,
        payload: [u8; 8],
    },
    GoAway {
        last_stream_id: u32,
        code: ErrorCode,
        debug: Bytes,
    },
    WindowUpdate {
        stream_id: u32,
        increment: u32,
    },
    Continuation {
        stream_id: u32,
        block: Bytes,
        end_headers: bool,
    },
    /// Extension frame types are ignored (RFC 7540 Section 4.1).
    Unknown {
        kind: u8,
        stream_id: u32,
    },
}

impl Frame {
    /// DATA frame with `flow_len` equal to the payload length.
    pub fn data(stream_id: u32, payload: impl Into<Bytes>, end_stream: bool) -> Frame {
        let payload = payload.into();
        Frame::Data {
            stream_id,
            flow_len: payload.len() as u32,
            payload,
            end_stream,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Frame::Data { .. } => "DATA",
            Frame::Headers { .. } => "HEADERS",
            Frame::Priority { .. } => "PRIORITY",
            Frame::RstStream { .. } => "RST_STREAM",
            Frame::Settings { .. } => "SETTINGS",
            Frame::PushPromise { .. } => "PUSH_PROMISE",
            Frame::Ping { .. } => "PING",
            Frame::GoAway { .. } => "GOAWAY",
            Frame::WindowUpdate { .. } => "WINDOW_UPDATE",
            Frame::Continuation { .. } => "CONTINUATION",
            Frame::Unknown { .. } => "UNKNOWN",
        }
    }

    /// The stream this frame belongs to; 0 for connection-level frames.
    pub fn stream_id(&self) -> u32 {
        match self {
            Frame::Data { stream_id, .. }
            | Frame::Headers { stream_id, .. }
            | Frame::Priority { stream_id }
            | Frame::RstStream { stream_id, .. }
            | Frame::PushPromise { stream_id, .. }
            | Frame::WindowUpdate { stream_id, .. }
            | Frame::Continuation { stream_id, .. }
            | Frame::Unknown { stream_id, .. } => *stream_id,
            Frame::Settings { .. } | Frame::Ping { .. } | Frame::GoAway { .. } => 0,
        }
    }

    /// Append the encoded frame (header and payload) to `dst`.
    ///
    /// Padding is never emitted, so `flow_len` of a DATA frame is ignored.
    pub fn encode<B: BufMut>(&self, dst: &mut B) {
        match self {
            Frame::Data {
                stream_id,
                payload,
                end_stream,
                ..
            } => {
                let flags = if *end_stream { flags::END_STREAM } else { 0 };
                head(payload.len(), kind::DATA, flags, *stream_id).encode(dst);
                dst.put_slice(payload);
            }
            Frame::Headers {
                stream_id,
                block,
                end_stream,
                end_headers,
            } => {
                let mut bits = 0;
                if *end_stream {
                    bits |= flags::END_STREAM;
                }
                if *end_headers {
                    bits |= flags::END_HEADERS;
                }
                head(block.len(), kind::HEADERS, bits, *stream_id).encode(dst);
                dst.put_slice(block);
            }
            Frame::Priority { stream_id } => {
                head(5, kind::PRIORITY, 0, *stream_id).encode(dst);
                dst.put_u32(0);
                dst.put_u8(15);
            }
            Frame::RstStream { stream_id, code } => {
                head(4, kind::RST_STREAM, 0, *stream_id).encode(dst);
                dst.put_u32(*code as u32);
            }
            Frame::Settings { ack, params } => {
                if *ack {
                    head(0, kind::SETTINGS, flags::ACK, 0).encode(dst);
                } else {
                    head(params.len() * 6, kind::SETTINGS, 0, 0).encode(dst);
                    for param in params {
                        param.encode(dst);
                    }
                }
            }
            Frame::PushPromise {
                stream_id,
                promised_id,
                block,
                end_headers,
            } => {
                let bits = if *end_headers { flags::END_HEADERS } else { 0 };
                head(4 + block.len(), kind::PUSH_PROMISE, bits, *stream_id).encode(dst);
                dst.put_u32(promised_id & STREAM_ID_MASK);
                dst.put_slice(block);
            }
            Frame::Ping { ack, payload } => {
                let bits = if *ack { flags::ACK } else { 0 };
                head(8, kind::PING, bits, 0).encode(dst);
                dst.put_slice(payload);
            }
            Frame::GoAway {
                last_stream_id,
                code,
                debug,
            } => {
                head(8 + debug.len(), kind::GOAWAY, 0, 0).encode(dst);
                dst.put_u32(last_stream_id & STREAM_ID_MASK);
                dst.put_u32(*code as u32);
                dst.put_slice(debug);
            }
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => {
                head(4, kind::WINDOW_UPDATE, 0, *stream_id).encode(dst);
                dst.put_u32(increment & STREAM_ID_MASK);
            }
            Frame::Continuation {
                stream_id,
                block,
                end_headers,
            } => {
                let bits = if *end_headers { flags::END_HEADERS } else { 0 };
                head(block.len(), kind::CONTINUATION, bits, *stream_id).encode(dst);
                dst.put_slice(block);
            }
            Frame::Unknown { kind, stream_id } => {
                head(0, *kind, 0, *stream_id).encode(dst);
            }
        }
    }

    /// Decode one frame from the front of `src`.
    ///
    /// Returns `Ok(None)` when `src` does not yet hold a whole frame, and
    /// `Ok(Some((frame, consumed)))` otherwise.
    pub fn decode(src: &[u8], max_frame_size: u32) -> Result<Option<(Frame, usize)>, H2Error> {
        let Some(head) = Head::parse(src) else {
            return Ok(None);
        };
        if head.length > max_frame_size {
            return Err(H2Error::FrameSize);
        }
        let total = HEADER_LEN + head.length as usize;
        if src.len() < total {
            return Ok(None);
        }
        let payload = &src[HEADER_LEN..total];
        let frame = Self::decode_payload(head, payload)?;
        Ok(Some((frame, total)))
    }

    fn decode_payload(head: Head, payload: &[u8]) -> Result<Frame, H2Error> {
        let stream_id = head.stream_id;
        let require_stream = |name: &str| {
            if stream_id == 0 {
                Err(H2Error::Protocol(format!("{name} on stream 0")))
            } else {
                Ok(())
            }
        };
        let require_connection = |name: &str| {
            if stream_id != 0 {
                Err(H2Error::Protocol(format!("{name} on stream {stream_id}")))
            } else {
                Ok(())
            }
        };

        let frame = match head.kind {
            kind::DATA => {
                require_stream("DATA")?;
                let body = strip_padding(&head, payload)?;
                Frame::Data {
                    stream_id,
                    payload: Bytes::copy_from_slice(body),
                    end_stream: head.has(flags::END_STREAM),
                    flow_len: head.length,
                }
            }
            kind::HEADERS => {
                require_stream("HEADERS")?;
                let mut body = strip_padding(&head, payload)?;
                if head.has(flags::PRIORITY) {
                    if body.len() < 5 {
                        return Err(H2Error::FrameSize);
                    }
                    body = &body[5..];
                }
                Frame::Headers {
                    stream_id,
                    block: Bytes::copy_from_slice(body),
                    end_stream: head.has(flags::END_STREAM),
                    end_headers: head.has(flags::END_HEADERS),
                }
            }
            kind::PRIORITY => {
                require_stream("PRIORITY")?;
                if payload.len() != 5 {
                    return Err(H2Error::FrameSize);
                }
                Frame::Priority { stream_id }
            }
            kind::RST_STREAM => {
                require_stream("RST_STREAM")?;
                let mut body = exact(payload, 4)?;
                Frame::RstStream {
                    stream_id,
                    code: ErrorCode::from(body.get_u32()),
                }
            }
            kind::SETTINGS => {
                require_connection("SETTINGS")?;
                if head.has(flags::ACK) {
                    if !payload.is_empty() {
                        return Err(H2Error::FrameSize);
                    }
                    Frame::Settings {
                        ack: true,
                        params: Vec::new(),
                    }
                } else {
                    Frame::Settings {
                        ack: false,
                        params: Setting::decode_all(payload)?,
                    }
                }
            }
            kind::PUSH_PROMISE => {
                require_stream("PUSH_PROMISE")?;
                let mut body = strip_padding(&head, payload)?;
                if body.len() < 4 {
                    return Err(H2Error::FrameSize);
                }
                let promised_id = body.get_u32() & STREAM_ID_MASK;
                Frame::PushPromise {
                    stream_id,
                    promised_id,
                    block: Bytes::copy_from_slice(body),
                    end_headers: head.has(flags::END_HEADERS),
                }
            }
            kind::PING => {
                require_connection("PING")?;
                let body = exact(payload, 8)?;
                let mut data = [0u8; 8];
                data.copy_from_slice(body);
                Frame::Ping {
                    ack: head.has(flags::ACK),
                    payload: data,
                }
            }
            kind::GOAWAY => {
                require_connection("GOAWAY")?;
                if payload.len() < 8 {
                    return Err(H2Error::FrameSize);
                }
                let mut body = payload;
                let last_stream_id = body.get_u32() & STREAM_ID_MASK;
                let code = ErrorCode::from(body.get_u32());
                Frame::GoAway {
                    last_stream_id,
                    code,
                    debug: Bytes::copy_from_slice(body),
                }
            }
            kind::WINDOW_UPDATE => {
                let mut body = exact(payload, 4)?;
                let increment = body.get_u32() & STREAM_ID_MASK;
                if increment == 0 {
                    return Err(H2Error::Protocol("WINDOW_UPDATE with zero increment".into()));
                }
                Frame::WindowUpdate {
                    stream_id,
                    increment,
                }
            }
            kind::CONTINUATION => {
                require_stream("CONTINUATION")?;
                Frame::Continuation {
                    stream_id,
                    block: Bytes::copy_from_slice(payload),
                    end_headers: head.has(flags::END_HEADERS),
                }
            }
            other => Frame::Unknown {
                kind: other,
                stream_id,
            },
        };
        Ok(frame)
    }
}

fn head(length: usize, kind: u8, flags: u8, stream_id: u32) -> Head {
    Head {
        length: length as u32,
        kind,
        flags,
        stream_id,
    }
}

fn exact(payload: &[u8], len: usize) -> Result<&[u8], H2Error> {
    if payload.len() == len {
        Ok(payload)
    } else {
        Err(H2Error::FrameSize)
    }
}

fn strip_padding<'a>(head: &Head, payload: &'a [u8]) -> Result<&'a [u8], H2Error> {
    if !head.has(flags::PADDED) {
        return Ok(payload);
    }
    let Some((&pad_len, rest)) = payload.split_first() else {
        return Err(H2Error::FrameSize);
    };
    let pad_len = usize::from(pad_len);
    if pad_len > rest.len() {
        return Err(H2Error::Protocol("padding exceeds payload".into()));
    }
    Ok(&rest[..rest.len() - pad_len])
}
