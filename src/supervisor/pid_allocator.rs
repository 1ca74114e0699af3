//! C1 — monotonic wrap-around PID allocator.
//!
//! Allocates internal process identifiers from a bounded range, distinct
//! from the OS pid of any child. Space is deliberately small so exhaustion
//! is reachable (and diagnosable) under test rather than a theoretical edge
//! case.

use std::collections::HashSet;
use std::sync::Mutex;

use crate::types::{fatal, Pid};

struct State {
    next: u64,
    in_use: HashSet<u64>,
}

/// Allocates [`Pid`]s from `[1, max]`, wrapping around and skipping in-use
/// values. All operations are serialized under an internal mutex.
#[derive(Debug)]
pub struct PidAllocator {
    max: u64,
    state: Mutex<State>,
}

impl std::fmt::Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("State")
            .field("next", &self.next)
            .field("in_use_count", &self.in_use.len())
            .finish()
    }
}

impl PidAllocator {
    pub fn new(max: u64) -> Self {
        assert!(max >= 1, "pid_max must be at least 1");
        Self {
            max,
            state: Mutex::new(State {
                next: 1,
                in_use: HashSet::new(),
            }),
        }
    }

    /// Allocates the next free pid, advancing with wraparound. Aborts the
    /// process if a full wrap completes without finding a free slot — PID
    /// space exhaustion is an operational misconfiguration, not a
    /// recoverable condition (spec §7).
    pub fn alloc(&self) -> Pid {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let start = state.next;
        loop {
            let candidate = state.next;
            state.next = if state.next >= self.max {
                1
            } else {
                state.next + 1
            };
            if state.in_use.insert(candidate) {
                return Pid(candidate);
            }
            if state.next == start {
                fatal(format!(
                    "pid space exhausted: all {} slots in [1, {}] are in use",
                    self.max, self.max
                ));
            }
        }
    }

    /// Releases a pid back to the pool. A no-op if the pid is unknown or
    /// already released.
    pub fn release(&self, pid: Pid) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.in_use.remove(&pid.0);
    }

    #[cfg(test)]
    pub fn in_use_count(&self) -> usize {
        self.state.lock().unwrap().in_use.len()
    }
}
