use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::supervisor::core::{Core, Pools, UnitStatus};
use crate::supervisor::slot_pool::SlotPool;
use crate::types::{SupervisorConfig, UnitId};

/// Supervisor variant gated by preflight/onflight slot pools (spec.md §2,
/// §4.6). Used for tenanted units, where concurrency quotas bound how many
/// channels may be warming up or actively running at once.
pub struct DualPhaseSupervisor {
    core: Arc<Core>,
    main_loop: JoinHandle<()>,
}

impl DualPhaseSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let pools = Pools {
            preflight: SlotPool::new(config.preflight_limit),
            onflight: SlotPool::new(config.onflight_limit),
        };
        let core = Core::new(config, Some(pools));
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

    /// Shrinking a pool below its current usage forces teardown of the
    /// excess before the new capacity takes effect; the forced closes run
    /// in the background.
    pub async fn update_limits(&self, max_preflight: u64, max_onflight: u64) {
        self.core.update_limits(max_preflight, max_onflight).await;
    }

    /// Current onflight usage.
    pub fn onflight(&self) -> u64 {
        self.core.onflight()
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

impl std::fmt::Debug for DualPhaseSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DualPhaseSupervisor")
            .field("onflight", &self.onflight())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(preflight: u64, onflight: u64) -> SupervisorConfig {
        SupervisorConfig {
            preflight_limit: preflight,
            onflight_limit: onflight,
            readiness_marker: "READY".to_string(),
            pipe_grace: Duration::from_millis(50),
            post_drain_exit_window: Duration::from_millis(250),
            sigterm_grace: Duration::from_millis(500),
            ..Default::default()
        }
    }

    fn remux_script() -> Vec<String> {
        vec![
            "/bin/sh".into(),
            "-c".into(),
            "echo READY; read x".into(),
        ]
    }

    #[tokio::test]
    async fn capacity_gate_admits_only_onflight_limit_units() {
        // Pre=2, On=1: both A and B can warm up, but only one occupies the
        // onflight slot at a time (spec.md §8 S4).
        let sup = DualPhaseSupervisor::new(config(2, 1));
        sup.add(UnitId(1), remux_script(), Duration::from_secs(1)).await;
        sup.add(UnitId(2), remux_script(), Duration::from_secs(1)).await;

        let mut onflight_reached = false;
        for _ in 0..100 {
            if sup.onflight() == 1 {
                onflight_reached = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(onflight_reached, "expected exactly one unit to reach onflight");
        assert!(sup.onflight() <= 1, "onflight usage must never exceed its capacity");

        sup.remove(UnitId(1)).await;
        sup.remove(UnitId(2)).await;
    }

    #[tokio::test]
    async fn update_limits_shrinks_without_exceeding_new_capacity() {
        let sup = DualPhaseSupervisor::new(config(3, 3));
        for uid in [1, 2, 3] {
            sup.add(UnitId(uid), remux_script(), Duration::from_secs(5)).await;
        }

        for _ in 0..100 {
            if sup.onflight() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        sup.update_limits(3, 1).await;

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(sup.onflight() <= 1, "shrink must not leave onflight over new capacity");

        for uid in [1, 2, 3] {
            sup.remove(UnitId(uid)).await;
        }
    }
}
