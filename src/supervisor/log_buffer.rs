//! C4 — per-unit ring log buffer and lazy registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::types::UnitId;

/// Fixed-capacity circular buffer of text lines. Readers and writers
/// contend on a `RwLock`, permitting concurrent readers.
#[derive(Debug)]
pub struct RingBuffer {
    capacity: usize,
    inner: RwLock<Inner>,
}

#[derive(Debug)]
struct Inner {
    // Logical insertion order, oldest first once saturated. A `VecDeque`
    // makes Append O(1) amortized and Read O(n) in the slice returned,
    // which is the only cost that matters here (n is bounded by capacity).
    lines: std::collections::VecDeque<String>,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: RwLock::new(Inner {
                lines: std::collections::VecDeque::with_capacity(capacity.max(1)),
            }),
        }
    }

    /// Appends a line, evicting the oldest once the buffer saturates.
    pub fn append(&self, line: impl Into<String>) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if inner.lines.len() == self.capacity {
            inner.lines.pop_front();
        }
        inner.lines.push_back(line.into());
    }

    /// Returns up to `n` newest-first entries. `n` is clamped to
    /// `[0, capacity]`.
    pub fn read(&self, n: usize) -> Vec<String> {
        let n = n.min(self.capacity);
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.lines.iter().rev().take(n).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Lazily-created `uid -> RingBuffer` registry. Buffers are never evicted:
/// history for a unit survives across restarts so operators can inspect the
/// log of a just-crashed incarnation.
#[derive(Debug, Default)]
pub struct LogRegistry {
    buffers: Mutex<HashMap<i64, Arc<RingBuffer>>>,
    capacity: usize,
}

impl LogRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffers: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// Returns the buffer for `uid`, creating one on first access.
    pub fn get(&self, uid: UnitId) -> Arc<RingBuffer> {
        let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        buffers
            .entry(uid.get())
            .or_insert_with(|| Arc::new(RingBuffer::new(self.capacity)))
            .clone()
    }
}
