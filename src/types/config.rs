//! Configuration structures.
//!
//! Plain serde data; loading it from a file or environment is left to the
//! embedding service. The struct and its `Default` exist so the embedder has
//! a documented schema to deserialize into.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Supervisor-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Size of the PID allocator's `[1, pid_max]` range.
    pub pid_max: u64,

    /// Capacity of each unit's ring log buffer.
    pub log_buffer_capacity: usize,

    /// Line a child must print on stdout to be considered ready.
    pub readiness_marker: String,

    /// Grace period after closing a child's stdin pipe before declaring it
    /// unresponsive.
    #[serde(with = "humantime_serde")]
    pub pipe_grace: Duration,

    /// Window after pipes are drained during which a natural exit is still
    /// treated as a clean shutdown rather than a crash.
    #[serde(with = "humantime_serde")]
    pub post_drain_exit_window: Duration,

    /// Grace period between SIGTERM and SIGKILL during teardown.
    #[serde(with = "humantime_serde")]
    pub sigterm_grace: Duration,

    /// Preflight pool size. Only meaningful for a dual-phase supervisor.
    pub preflight_limit: u64,

    /// Onflight pool size. Only meaningful for a dual-phase supervisor.
    pub onflight_limit: u64,

    /// Fixed environment overlay applied to every spawned child.
    pub env_overlay: HashMap<String, String>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            pid_max: 32_768,
            log_buffer_capacity: 500,
            readiness_marker: "Press ENTER to continue or Ctrl+C to cancel.".to_string(),
            pipe_grace: Duration::from_millis(50),
            post_drain_exit_window: Duration::from_millis(250),
            sigterm_grace: Duration::from_secs(3),
            preflight_limit: 4,
            onflight_limit: 4,
            env_overlay: HashMap::from([("ENV".to_string(), "prod".to_string())]),
        }
    }
}
