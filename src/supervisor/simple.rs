use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::supervisor::core::{Core, UnitStatus};
use crate::types::{SupervisorConfig, UnitId};

/// Supervisor variant with no concurrency gates — every launch fires as
/// soon as its cooldown elapses. Used for admin-owned units (spec.md §2).
pub struct SimpleSupervisor {
    core: Arc<Core>,
    main_loop: JoinHandle<()>,
}

impl SimpleSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let core = Core::new(config, None);
        let main_loop = core.spawn_main_loop();
        Self { core, main_loop }
    }

    /// Idempotent: a uid already added is a no-op.
    pub async fn add(&self, uid: UnitId, argv: Vec<String>, cooldown: Duration) {
        self.core.add(uid, argv, cooldown).await;
    }

    /// Idempotent: an absent uid is a no-op. Does not wait for the torn-down
    /// instance to finish exiting.
    pub async fn remove(&self, uid: UnitId) {
        self.core.remove(uid).await;
    }

    /// Read-only snapshot of every currently-added unit.
    pub async fn status(&self) -> Vec<UnitStatus> {
        self.core.status().await
    }

    /// Up to `n` newest-first log lines for `uid`, across all incarnations.
    pub fn log(&self, uid: UnitId, n: usize) -> Vec<String> {
        self.core.log(uid, n)
    }

    /// Stops the background main loop. In-flight instance supervisors and
    /// close sequences are left to finish on their own.
    pub fn shutdown(self) {
        self.main_loop.abort();
    }
}

impl std::fmt::Debug for SimpleSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimpleSupervisor").finish_non_exhaustive()
    }
}
