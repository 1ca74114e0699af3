//! C3 — ownership-tracked slot pool.
//!
//! A counting semaphore that names its owners. Preferred over a plain
//! counting semaphore because capacity shrink needs to name victims, and
//! because it turns "release-without-acquire" and "double-acquire" bugs
//! into immediate fatal diagnostics instead of silent underflow/overflow
//! (spec.md §9 "Ownership-carrying semaphore").

use std::sync::Mutex;

use indexmap::IndexSet;
use tokio::sync::Notify;

use crate::types::{fatal, Pid};

struct State {
    max_cap: u64,
    // Insertion-ordered so `list_acquired()` can hand `close_excess` a
    // deterministic FIFO-by-acquisition victim order (SPEC_FULL.md §11);
    // a `HashSet` would iterate in arbitrary bucket order instead.
    acquired_by: IndexSet<u64>,
}

/// Ownership-tracked capacity gate for one lifecycle phase (preflight or
/// onflight).
#[derive(Debug)]
pub struct SlotPool {
    state: Mutex<State>,
    // Notified whenever usage drops or capacity grows, so waiters can
    // recheck. Broadcasting on every change (rather than notify_one) matches
    // spec.md §5's "no FIFO fairness ... wake-ups are signalled broadly".
    changed: Notify,
}

impl std::fmt::Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("State")
            .field("max_cap", &self.max_cap)
            .field("usage", &self.acquired_by.len())
            .finish()
    }
}

impl SlotPool {
    pub fn new(max_cap: u64) -> Self {
        Self {
            state: Mutex::new(State {
                max_cap,
                acquired_by: IndexSet::new(),
            }),
            changed: Notify::new(),
        }
    }

    /// Blocks until a slot is available, then acquires it for `pid`.
    /// Acquiring twice for the same pid is a protocol violation.
    pub async fn acquire(&self, pid: Pid) {
        loop {
            let notified = self.changed.notified();
            if self.try_acquire(pid) {
                return;
            }
            notified.await;
        }
    }

    /// Non-blocking acquire. Returns `false` if the pool is at capacity.
    pub fn try_acquire(&self, pid: Pid) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.acquired_by.contains(&pid.0) {
            fatal(format!("slot pool: pid {} acquired twice", pid.0));
        }
        if (state.acquired_by.len() as u64) >= state.max_cap {
            return false;
        }
        state.acquired_by.insert(pid.0);
        true
    }

    /// Blocks until a slot is available, without acquiring it. A readiness
    /// probe used by the dual-phase main loop before it takes the
    /// supervisor's lock (spec.md §4.6 "dual wait + tryAcquire").
    pub async fn wait_slot(&self) {
        loop {
            let notified = self.changed.notified();
            {
                let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                if (state.acquired_by.len() as u64) < state.max_cap {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Releases `pid`'s slot. Releasing a non-owner is a protocol
    /// violation.
    pub fn release(&self, pid: Pid) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            // `shift_remove`, not `swap_remove`: releasing a pid must not
            // reorder the remaining owners, or `list_acquired()`'s
            // FIFO-by-acquisition order would be scrambled by whichever pid
            // happened to occupy the last slot.
            if !state.acquired_by.shift_remove(&pid.0) {
                fatal(format!("slot pool: release of non-owner pid {}", pid.0));
            }
        }
        self.changed.notify_waiters();
    }

    /// Updates the pool's capacity, clamped to `>= 0` (capacity is
    /// unsigned, so this is a no-op clamp in practice). Wakes all waiters
    /// so growth is observed promptly.
    pub fn update_limit(&self, n: u64) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.max_cap = n;
        }
        self.changed.notify_waiters();
    }

    /// Snapshot of current owners, oldest acquisition first.
    pub fn list_acquired(&self) -> Vec<Pid> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.acquired_by.iter().map(|&p| Pid(p)).collect()
    }

    pub fn usage(&self) -> u64 {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.acquired_by.len() as u64
    }
}
