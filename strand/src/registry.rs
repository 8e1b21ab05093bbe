//! The set of async requests whose completion has not been observed yet.

use std::collections::HashSet;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

/// In-flight async streams, keyed by connection generation and stream id
/// (ids restart at 1 on every new connection).
#[derive(Default)]
pub(crate) struct InFlight {
    entries: Mutex<HashSet<(u64, u32)>>,
    drained: Condvar,
}

impl InFlight {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, generation: u64, stream_id: u32) {
        self.entries.lock().insert((generation, stream_id));
    }

    pub(crate) fn remove(&self, generation: u64, stream_id: u32) {
        let mut entries = self.entries.lock();
        if entries.remove(&(generation, stream_id)) && entries.is_empty() {
            self.drained.notify_all();
        }
    }

    /// Drop every entry belonging to a dead connection.
    pub(crate) fn remove_generation(&self, generation: u64) {
        let mut entries = self.entries.lock();
        entries.retain(|&(g, _)| g != generation);
        if entries.is_empty() {
            self.drained.notify_all();
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Block until empty. On timeout returns how many are still pending.
    pub(crate) fn wait_empty(&self, deadline: Option<Instant>) -> Result<(), usize> {
        let mut entries = self.entries.lock();
        while !entries.is_empty() {
            match deadline {
                Some(deadline) => {
                    if self.drained.wait_until(&mut entries, deadline).timed_out() {
                        return if entries.is_empty() {
                            Ok(())
                        } else {
                            Err(entries.len())
                        };
                    }
                }
                None => self.drained.wait(&mut entries),
            }
        }
        Ok(())
    }
}
