//! Time-bounded memory of closed stream ids.
//!
//! After a stream closes locally the peer may still have frames for it in
//! flight (a late WINDOW_UPDATE, the tail of a DATA run after our RST_STREAM).
//! Those are dropped silently while the id is remembered here. Once an id
//! ages out, frames for it are answered with RST_STREAM(STREAM_CLOSED).

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

/// Default time a closed stream id is remembered.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(15);

#[derive(Debug)]
pub(crate) struct RecentlyClosed {
    grace: Duration,
    order: VecDeque<(u32, Instant)>,
    ids: HashSet<u32>,
}

impl RecentlyClosed {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            order: VecDeque::new(),
            ids: HashSet::new(),
        }
    }

    pub fn set_grace(&mut self, grace: Duration) {
        self.grace = grace;
    }

    pub fn insert(&mut self, id: u32, now: Instant) {
        if self.ids.insert(id) {
            self.order.push_back((id, now));
        }
    }

    pub fn contains(&self, id: u32) -> bool {
        self.ids.contains(&id)
    }

    /// Forget every id closed more than `grace` before `now`.
    pub fn purge(&mut self, now: Instant) {
        while let Some(&(id, closed_at)) = self.order.front() {
            if now.saturating_duration_since(closed_at) <= self.grace {
                break;
            }
            self.order.pop_front();
            self.ids.remove(&id);
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }
}
