//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context. See `fatal` for the separate class of
//! unrecoverable protocol violations, which are never represented here.

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Error enum for the supervisor's fallible, recoverable operations.
///
/// The supervisor's fire-and-forget public surface (`Add`/`Remove`/
/// `UpdateLimits`) never returns this type to callers — those stay
/// idempotent and silent on bad input per their definitions. `Error` is used
/// internally by constructors and by read-only diagnostic paths (`status`,
/// log reads) that do have a meaningful failure to report.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad `ExecSpec` (empty argv, invalid cooldown, ...).
    #[error("validation error: {0}")]
    Validation(String),

    /// A diagnostic operation addressed at an unknown uid/pid.
    #[error("not found: {0}")]
    NotFound(String),

    /// A requested transition is inconsistent with recorded state, but does
    /// not itself indicate supervisor corruption (unlike the `fatal` class).
    #[error("state transition error: {0}")]
    StateTransition(String),

    /// Process spawn / pipe construction failures outside the launch-retry
    /// path's concern (e.g. a malformed environment overlay).
    #[error("internal error: {0}")]
    Internal(String),

    /// I/O errors surfaced while spawning or draining a child process.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// Convenience constructors
impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn state_transition(msg: impl Into<String>) -> Self {
        Self::StateTransition(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Logs `msg` as a fatal supervisor-internal error, then terminates the
/// process.
///
/// Reserved for true protocol violations: a slot double-acquire, a release
/// from a non-owner, the scheduler holding two entries for one pid, PID
/// space exhaustion. These indicate a bug in the supervisor itself, not a
/// recoverable `Error` condition, so they are never propagated as a `Result`.
/// The `tracing::error!` runs first so the structured-log history captures
/// the condition before the process goes down; `panic!` then unwinds, which
/// this crate's release profile turns into an immediate process abort (see
/// `[profile.release] panic = "abort"` in Cargo.toml) while still letting
/// `#[should_panic]` tests observe it in debug/test builds.
#[cold]
pub fn fatal(msg: impl std::fmt::Display) -> ! {
    tracing::error!(%msg, "fatal protocol violation");
    panic!("{msg}")
}
