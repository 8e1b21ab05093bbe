//! SETTINGS parameters (RFC 7540 Section 6.5).
//!
//! A SETTINGS frame carries a list of changes, not a full snapshot, so the
//! wire form is a list of [`Setting`] values that are applied on top of the
//! current [`Settings`].

use bytes::{Buf, BufMut};

use crate::error::H2Error;

const HEADER_TABLE_SIZE: u16 = 0x1;
const ENABLE_PUSH: u16 = 0x2;
const MAX_CONCURRENT_STREAMS: u16 = 0x3;
const INITIAL_WINDOW_SIZE: u16 = 0x4;
const MAX_FRAME_SIZE: u16 = 0x5;
const MAX_HEADER_LIST_SIZE: u16 = 0x6;

/// Largest legal flow-control window.
pub const MAX_WINDOW_SIZE: u32 = 0x7fff_ffff;
/// Smallest legal (and default) SETTINGS_MAX_FRAME_SIZE.
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;
const MAX_MAX_FRAME_SIZE: u32 = 16_777_215;

/// One identifier/value pair from a SETTINGS frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setting {
    HeaderTableSize(u32),
    EnablePush(bool),
    MaxConcurrentStreams(u32),
    InitialWindowSize(u32),
    MaxFrameSize(u32),
    MaxHeaderListSize(u32),
}

impl Setting {
    /// Parse the 6-byte pairs of a SETTINGS payload, validating ranges.
    /// Unknown identifiers are skipped (RFC 7540 Section 6.5.2).
    pub fn decode_all(mut payload: &[u8]) -> Result<Vec<Setting>, H2Error> {
        if payload.len() % 6 != 0 {
            return Err(H2Error::FrameSize);
        }
        let mut out = Vec::with_capacity(payload.len() / 6);
        while payload.has_remaining() {
            let id = payload.get_u16();
            let value = payload.get_u32();
            let setting = match id {
                HEADER_TABLE_SIZE => Setting::HeaderTableSize(value),
                ENABLE_PUSH => match value {
                    0 => Setting::EnablePush(false),
                    1 => Setting::EnablePush(true),
                    _ => return Err(H2Error::Protocol("ENABLE_PUSH must be 0 or 1".into())),
                },
                MAX_CONCURRENT_STREAMS => Setting::MaxConcurrentStreams(value),
                INITIAL_WINDOW_SIZE => {
                    if value > MAX_WINDOW_SIZE {
                        return Err(H2Error::FlowControl);
                    }
                    Setting::InitialWindowSize(value)
                }
                MAX_FRAME_SIZE => {
                    if !(DEFAULT_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&value) {
                        return Err(H2Error::Protocol("MAX_FRAME_SIZE out of range".into()));
                    }
                    Setting::MaxFrameSize(value)
                }
                MAX_HEADER_LIST_SIZE => Setting::MaxHeaderListSize(value),
                _ => continue,
            };
            out.push(setting);
        }
        Ok(out)
    }

    pub fn encode<B: BufMut>(&self, dst: &mut B) {
        let (id, value) = match *self {
            Setting::HeaderTableSize(v) => (HEADER_TABLE_SIZE, v),
            Setting::EnablePush(v) => (ENABLE_PUSH, u32::from(v)),
            Setting::MaxConcurrentStreams(v) => (MAX_CONCURRENT_STREAMS, v),
            Setting::InitialWindowSize(v) => (INITIAL_WINDOW_SIZE, v),
            Setting::MaxFrameSize(v) => (MAX_FRAME_SIZE, v),
            Setting::MaxHeaderListSize(v) => (MAX_HEADER_LIST_SIZE, v),
        };
        dst.put_u16(id);
        dst.put_u32(value);
    }
}

/// Effective SETTINGS for one side of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub header_table_size: u32,
    pub enable_push: bool,
    /// `None` means unlimited.
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    /// `None` means unlimited.
    pub max_header_list_size: Option<u32>,
}

/// Protocol defaults (RFC 7540 Section 6.5.2); what a peer is assumed to
/// use until its first SETTINGS frame arrives.
impl Default for Settings {
    fn default() -> Self {
        Self {
            header_table_size: 4096,
            enable_push: true,
            max_concurrent_streams: None,
            initial_window_size: 65_535,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_header_list_size: None,
        }
    }
}

impl Settings {
    /// Settings advertised by the client: push disabled and a 1 MiB
    /// receive window so large bodies don't stall on WINDOW_UPDATE round trips.
    pub fn client_default() -> Self {
        Self {
            enable_push: false,
            initial_window_size: 1 << 20,
            ..Default::default()
        }
    }

    /// The parameter list to send in our initial SETTINGS frame. Values that
    /// equal the protocol default are still sent, except optional limits.
    pub fn to_params(&self) -> Vec<Setting> {
        let mut params = vec![
            Setting::HeaderTableSize(self.header_table_size),
            Setting::EnablePush(self.enable_push),
        ];
        if let Some(v) = self.max_concurrent_streams {
            params.push(Setting::MaxConcurrentStreams(v));
        }
        params.push(Setting::InitialWindowSize(self.initial_window_size));
        params.push(Setting::MaxFrameSize(self.max_frame_size));
        if let Some(v) = self.max_header_list_size {
            params.push(Setting::MaxHeaderListSize(v));
        }
        params
    }

    /// Apply a received parameter list in order.
    pub fn apply(&mut self, params: &[Setting]) {
        for param in params {
            match *param {
                Setting::HeaderTableSize(v) => self.header_table_size = v,
                Setting::EnablePush(v) => self.enable_push = v,
                Setting::MaxConcurrentStreams(v) => self.max_concurrent_streams = Some(v),
                Setting::InitialWindowSize(v) => self.initial_window_size = v,
                Setting::MaxFrameSize(v) => self.max_frame_size = v,
                Setting::MaxHeaderListSize(v) => self.max_header_list_size = Some(v),
            }
        }
    }
}
