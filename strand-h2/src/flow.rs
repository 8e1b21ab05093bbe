//! Flow-control windows (RFC 7540 Section 6.9).

use crate::error::H2Error;
use crate::settings::MAX_WINDOW_SIZE;

/// Window size every connection and stream starts with.
pub const DEFAULT_WINDOW: u32 = 65_535;

/// A send or receive window. Signed because a SETTINGS change may push a
/// send window below zero (RFC 7540 Section 6.9.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window(i64);

impl Window {
    pub fn new(initial: u32) -> Self {
        Self(i64::from(initial))
    }

    pub fn get(&self) -> i64 {
        self.0
    }

    /// Bytes that may be sent right now.
    pub fn available(&self) -> usize {
        self.0.max(0) as usize
    }

    /// Take `amount` out of the window; fails if it would go negative.
    pub fn consume(&mut self, amount: u32) -> Result<(), H2Error> {
        let next = self.0 - i64::from(amount);
        if next < 0 {
            return Err(H2Error::FlowControl);
        }
        self.0 = next;
        Ok(())
    }

    /// Credit from a WINDOW_UPDATE.
    pub fn grow(&mut self, increment: u32) -> Result<(), H2Error> {
        self.shift(i64::from(increment))
    }

    /// Apply the difference between an old and new INITIAL_WINDOW_SIZE.
    pub fn shift(&mut self, delta: i64) -> Result<(), H2Error> {
        let next = self.0 + delta;
        if next > i64::from(MAX_WINDOW_SIZE) {
            return Err(H2Error::FlowControl);
        }
        self.0 = next;
        Ok(())
    }
}

impl Default for Window {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

/// Receive-side accounting: tracks how much of the advertised window the
/// peer has used and says when to hand it back.
#[derive(Debug, Clone, Copy)]
pub struct RecvWindow {
    window: Window,
    target: u32,
}

impl RecvWindow {
    pub fn new(target: u32) -> Self {
        Self {
            window: Window::new(target),
            target,
        }
    }

    /// Account for `amount` received bytes.
    pub fn receive(&mut self, amount: u32) -> Result<(), H2Error> {
        self.window.consume(amount)
    }

    /// Once at least half the window is used, restore it to the target and
    /// return the increment for a WINDOW_UPDATE.
    pub fn replenish(&mut self) -> Option<u32> {
        let used = i64::from(self.target) - self.window.get();
        if used <= 0 || used < i64::from(self.target / 2) {
            return None;
        }
        let increment = used as u32;
        self.window.grow(increment).ok()?;
        Some(increment)
    }
}
