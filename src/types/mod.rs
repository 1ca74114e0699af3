//! Core types shared across the supervisor.
//!
//! - **IDs**: `UnitId` (external) and `Pid` (internal, allocator-assigned).
//! - **Errors**: recoverable `Error` plus the `fatal` protocol-violation path.
//! - **Config**: `SupervisorConfig`, the knobs documented for the embedder.

mod config;
mod errors;
mod ids;

pub use config::SupervisorConfig;
pub use errors::{fatal, Error, Result};
pub use ids::{Pid, UnitId};
