//! Identifiers for the supervisor's two-tier identity model.
//!
//! `UnitId` is externally chosen (the embedding service picks it) and stable
//! across restarts. `Pid` is internally allocated by the PID allocator and
//! identifies one incarnation of a unit; it is never reused while referenced
//! by any table (see [`crate::supervisor::pid_allocator`]).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Externally chosen identifier for a supervised unit (e.g. a channel row).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitId(pub i64);

impl UnitId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for UnitId {
    fn from(v: i64) -> Self {
        Self(v)
    }
}

/// Internal, monotonically allocated identifier for one process incarnation.
///
/// Allocated by [`crate::supervisor::pid_allocator::PidAllocator`] from a
/// bounded range; it is the authoritative identity of a single launch, never
/// the unit it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Pid(pub u64);

impl Pid {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
