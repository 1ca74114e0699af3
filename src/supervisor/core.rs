//! C6 — the shared logic behind both supervisor variants: the authoritative
//! identity tables, the single-mutex main loop, launch, and exit handling.
//!
//! `Core` is deliberately not public; [`crate::supervisor::SimpleSupervisor`]
//! and [`crate::supervisor::DualPhaseSupervisor`] are thin wrappers over it
//! that differ only in whether `pools` is populated, giving the compiler a
//! way to enforce which operations (`UpdateLimits`, `Onflight`) exist on
//! which variant while sharing the identity/launch/exit machinery.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify};

use crate::supervisor::log_buffer::LogRegistry;
use crate::supervisor::pid_allocator::PidAllocator;
use crate::supervisor::process::{ExecSpec, ManagedProcess};
use crate::supervisor::scheduler::Scheduler;
use crate::supervisor::slot_pool::SlotPool;
use crate::types::{Pid, SupervisorConfig, UnitId};

/// The two capacity gates a dual-phase supervisor enforces. Absent for a
/// simple supervisor.
pub(crate) struct Pools {
    pub preflight: SlotPool,
    pub onflight: SlotPool,
}

struct Tables {
    units: HashMap<UnitId, Pid>,
    specs: HashMap<Pid, ExecSpec>,
    live: HashMap<Pid, Arc<ManagedProcess>>,
    scheduler: Scheduler,
}

/// A read-only projection of one unit's current state, for admin tooling —
/// a natural complement to the per-unit log read, mirroring the "status
/// endpoints outside scope" spec.md already assumes exist downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitStatus {
    pub uid: UnitId,
    pub pid: Pid,
    pub running: bool,
}

pub(crate) struct Core {
    config: Arc<SupervisorConfig>,
    pid_alloc: PidAllocator,
    log_registry: LogRegistry,
    tables: Mutex<Tables>,
    wake_notify: Notify,
    pub(crate) pools: Option<Pools>,
}

impl Core {
    pub(crate) fn new(config: SupervisorConfig, pools: Option<Pools>) -> Arc<Self> {
        let config = Arc::new(config);
        Arc::new(Self {
            pid_alloc: PidAllocator::new(config.pid_max),
            log_registry: LogRegistry::new(config.log_buffer_capacity),
            tables: Mutex::new(Tables {
                units: HashMap::new(),
                specs: HashMap::new(),
                live: HashMap::new(),
                scheduler: Scheduler::new(),
            }),
            wake_notify: Notify::new(),
            pools,
            config,
        })
    }

    pub(crate) fn spawn_main_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.clone().run_main_loop())
    }

    fn wake(&self) {
        self.wake_notify.notify_one();
    }

    /// `Add(uid, argv, cooldown)`. Idempotent: a uid already present is a
    /// no-op.
    pub(crate) async fn add(self: &Arc<Self>, uid: UnitId, argv: Vec<String>, cooldown: Duration) {
        let mut t = self.tables.lock().await;
        if t.units.contains_key(&uid) {
            return;
        }
        let pid = self.pid_alloc.alloc();
        t.units.insert(uid, pid);
        t.specs.insert(
            pid,
            ExecSpec {
                unit_id: uid,
                argv,
                restart_cooldown: cooldown,
            },
        );
        t.scheduler.push(pid, Instant::now());
        tracing::info!(uid = uid.get(), pid = pid.get(), "unit added");
        drop(t);
        self.wake();
    }

    /// `Remove(uid)`. Idempotent: an absent uid is a no-op. Initiates
    /// teardown of any live instance but does not wait for it to complete —
    /// the close runs in the background and the eventual exit handler
    /// releases the pid.
    pub(crate) async fn remove(self: &Arc<Self>, uid: UnitId) {
        let mut t = self.tables.lock().await;
        let Some(pid) = t.units.remove(&uid) else {
            return;
        };
        t.specs.remove(&pid);
        t.scheduler.remove(pid);
        let live = t.live.remove(&pid);
        drop(t);
        tracing::info!(uid = uid.get(), pid = pid.get(), "unit removed");
        if let Some(proc) = live {
            tokio::spawn(async move { proc.close().await });
        }
    }

    /// `UpdateLimits(maxPre, maxOn)`. A no-op on a simple supervisor (no
    /// pools). Shrinking a pool below its current usage forces teardown of
    /// `usage - new` owners (any deterministic subset is acceptable per
    /// spec.md §9; this picks from `list_acquired()`'s order) before the
    /// new capacity takes effect.
    pub(crate) async fn update_limits(self: &Arc<Self>, max_pre: u64, max_on: u64) {
        let Some(pools) = self.pools.as_ref() else {
            return;
        };
        self.close_excess(&pools.preflight, max_pre, "preflight").await;
        self.close_excess(&pools.onflight, max_on, "onflight").await;
        pools.preflight.update_limit(max_pre);
        pools.onflight.update_limit(max_on);
        tracing::info!(max_pre, max_on, "limit update accepted");
        self.wake();
    }

    async fn close_excess(&self, pool: &SlotPool, new_cap: u64, phase: &'static str) {
        let usage = pool.usage();
        if usage <= new_cap {
            return;
        }
        let excess = (usage - new_cap) as usize;
        let victims: Vec<Pid> = pool.list_acquired().into_iter().take(excess).collect();
        let t = self.tables.lock().await;
        let procs: Vec<(Pid, Arc<ManagedProcess>)> = victims
            .into_iter()
            .filter_map(|pid| t.live.get(&pid).cloned().map(|p| (pid, p)))
            .collect();
        drop(t);
        for (pid, proc) in procs {
            tracing::warn!(pid = pid.get(), phase, "forced teardown on limit shrink");
            tokio::spawn(async move { proc.close().await });
        }
    }

    /// `Onflight()`. Zero on a simple supervisor.
    pub(crate) fn onflight(&self) -> u64 {
        self.pools.as_ref().map(|p| p.onflight.usage()).unwrap_or(0)
    }

    pub(crate) async fn status(&self) -> Vec<UnitStatus> {
        let t = self.tables.lock().await;
        t.units
            .iter()
            .map(|(&uid, &pid)| UnitStatus {
                uid,
                pid,
                running: t.live.contains_key(&pid),
            })
            .collect()
    }

    pub(crate) fn log(&self, uid: UnitId, n: usize) -> Vec<String> {
        self.log_registry.get(uid).read(n)
    }

    async fn run_main_loop(self: Arc<Self>) {
        loop {
            if let Some(pools) = &self.pools {
                pools.preflight.wait_slot().await;
                pools.onflight.wait_slot().await;
            }

            let mut t = self.tables.lock().await;
            match t.scheduler.next() {
                None => {
                    let notified = self.wake_notify.notified();
                    drop(t);
                    notified.await;
                }
                Some((pid, due_at)) => {
                    let delay = due_at.saturating_duration_since(Instant::now());
                    if delay > Duration::ZERO {
                        let notified = self.wake_notify.notified();
                        drop(t);
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {},
                            _ = notified => {},
                        }
                        continue;
                    }

                    if let Some(pools) = &self.pools {
                        if !pools.preflight.try_acquire(pid) {
                            // Capacity shrank between wait_slot and
                            // try_acquire; retry from the top.
                            drop(t);
                            continue;
                        }
                    }
                    t.scheduler.pop();
                    self.launch_under_lock(&mut t, pid).await;
                }
            }
        }
    }

    async fn launch_under_lock(self: &Arc<Self>, t: &mut Tables, pid: Pid) {
        let spec = match t.specs.get(&pid) {
            Some(spec) => spec.clone(),
            None => crate::types::fatal(format!(
                "scheduler entry for pid {} with no spec (invariant 1 violated)",
                pid.get()
            )),
        };

        let log = self.log_registry.get(spec.unit_id);
        let proc = match ManagedProcess::new(
            spec.clone(),
            self.config.env_overlay.clone(),
            log,
            self.config.clone(),
        ) {
            Ok(proc) => Arc::new(proc),
            Err(err) => {
                tracing::warn!(pid = pid.get(), error = %err, "process construction failed");
                self.release_preflight(pid);
                t.scheduler.push(pid, Instant::now() + spec.restart_cooldown);
                return;
            }
        };

        if !proc.start().await {
            self.release_preflight(pid);
            t.scheduler.push(pid, Instant::now() + spec.restart_cooldown);
            return;
        }

        t.live.insert(pid, proc.clone());
        let core = self.clone();
        let uid = spec.unit_id;
        tokio::spawn(async move { core.instance_supervisor(pid, uid, proc).await });
    }

    fn release_preflight(&self, pid: Pid) {
        if let Some(pools) = &self.pools {
            pools.preflight.release(pid);
        }
    }

    async fn instance_supervisor(self: Arc<Self>, pid: Pid, uid: UnitId, proc: Arc<ManagedProcess>) {
        if let Some(pools) = self.pools.as_ref() {
            let mut ready = proc.ready();
            let mut done = proc.done();
            tokio::select! {
                result = ready.wait_for(|r| *r) => {
                    if result.is_err() {
                        // Ready sender dropped without firing: treat like Done.
                        pools.preflight.release(pid);
                        self.handle_exit(pid, uid).await;
                        return;
                    }
                    if pools.onflight.try_acquire(pid) {
                        pools.preflight.release(pid);
                        if !proc.enter().await {
                            proc.close().await;
                            pools.onflight.release(pid);
                            let _ = done.wait_for(|d| *d).await;
                            self.handle_exit(pid, uid).await;
                            return;
                        }
                        // Falls through: await Done below while holding onflight.
                    } else {
                        proc.close().await;
                        pools.preflight.release(pid);
                        let _ = done.wait_for(|d| *d).await;
                        self.handle_exit(pid, uid).await;
                        return;
                    }
                }
                _ = done.wait_for(|d| *d) => {
                    pools.preflight.release(pid);
                    self.handle_exit(pid, uid).await;
                    return;
                }
            }
            let _ = done.wait_for(|d| *d).await;
            pools.onflight.release(pid);
            self.handle_exit(pid, uid).await;
        } else {
            let mut done = proc.done();
            let _ = done.wait_for(|d| *d).await;
            self.handle_exit(pid, uid).await;
        }
    }

    async fn handle_exit(self: &Arc<Self>, pid: Pid, uid: UnitId) {
        let mut t = self.tables.lock().await;
        t.live.remove(&pid);
        if t.units.get(&uid) == Some(&pid) {
            let cooldown = t
                .specs
                .get(&pid)
                .map(|s| s.restart_cooldown)
                .unwrap_or_default();
            t.scheduler.push(pid, Instant::now() + cooldown);
            drop(t);
            tracing::info!(pid = pid.get(), uid = uid.get(), "scheduled restart");
            self.wake();
        } else {
            t.specs.remove(&pid);
            drop(t);
            tracing::info!(pid = pid.get(), "pid released (not authoritative)");
            self.pid_alloc.release(pid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> SupervisorConfig {
        SupervisorConfig {
            pid_max: 1000,
            log_buffer_capacity: 50,
            readiness_marker: "READY".to_string(),
            pipe_grace: Duration::from_millis(30),
            post_drain_exit_window: Duration::from_millis(50),
            sigterm_grace: Duration::from_millis(200),
            preflight_limit: 4,
            onflight_limit: 4,
            env_overlay: HashMap::new(),
        }
    }

    async fn wait_for_running(core: &Arc<Core>, uid: UnitId, want: bool) -> Instant {
        loop {
            let status = core.status().await;
            if let Some(s) = status.iter().find(|s| s.uid == uid) {
                if s.running == want {
                    return Instant::now();
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// S2 — crash-restart loop: a unit that keeps exiting must not be
    /// relaunched sooner than its configured cooldown after each exit
    /// (spec.md §8 S2, handle_exit's authoritative branch, core.rs:314-323).
    #[tokio::test]
    async fn crash_restart_loop_honors_cooldown() {
        let cooldown = Duration::from_millis(300);
        let core = Core::new(fast_config(), None);
        let _main_loop = core.spawn_main_loop();

        core.add(
            UnitId(1),
            vec!["/bin/sh".into(), "-c".into(), "sleep 0.05; exit 1".into()],
            cooldown,
        )
        .await;

        wait_for_running(&core, UnitId(1), true).await;
        let first_exit = wait_for_running(&core, UnitId(1), false).await;
        let second_launch = wait_for_running(&core, UnitId(1), true).await;

        let gap = second_launch.duration_since(first_exit);
        assert!(
            gap >= cooldown,
            "restart fired before cooldown elapsed: waited {:?}, needed >= {:?}",
            gap,
            cooldown
        );

        core.remove(UnitId(1)).await;
    }

    /// S3 — supersession: `Remove(uid)` followed immediately by
    /// `Add(uid, argv')` must allocate a *new*, distinct pid for the unit,
    /// `units` must never show both the old and new pid for `uid` at once,
    /// and the old pid is only released back to the allocator once its own
    /// instance has actually been reaped (handle_exit's non-authoritative
    /// branch, core.rs:324-329) — not synchronously at `remove()` time.
    #[tokio::test]
    async fn supersession_yields_a_new_pid_and_releases_the_old_one_only_after_reap() {
        let core = Core::new(fast_config(), None);
        let _main_loop = core.spawn_main_loop();

        // Ignores SIGTERM for a while so the old instance's reap is still
        // pending when we check that both pids are briefly allocated at
        // once; it only dies once sigterm_grace expires and SIGKILL lands.
        let stubborn = vec![
            "/bin/sh".into(),
            "-c".into(),
            "trap '' TERM; sleep 5".into(),
        ];

        core.add(UnitId(1), stubborn, Duration::from_millis(50)).await;
        wait_for_running(&core, UnitId(1), true).await;
        let pid1 = {
            let t = core.tables.lock().await;
            *t.units.get(&UnitId(1)).unwrap()
        };

        core.remove(UnitId(1)).await;
        core.add(
            UnitId(1),
            vec!["/bin/sh".into(), "-c".into(), "sleep 5".into()],
            Duration::from_millis(50),
        )
        .await;

        let pid2 = {
            let t = core.tables.lock().await;
            *t.units.get(&UnitId(1)).unwrap()
        };
        assert_ne!(pid1, pid2, "supersession must allocate a distinct pid");

        // At no point do both the old and new pid appear under `uid` at
        // once — `units` is keyed by uid, so structurally there is always
        // exactly one entry; assert it holds across the race window too.
        for _ in 0..20 {
            let status = core.status().await;
            assert_eq!(
                status.iter().filter(|s| s.uid == UnitId(1)).count(),
                1,
                "uid must map to exactly one pid at any instant"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // The old pid is still held: its process ignores SIGTERM and hasn't
        // been reaped yet, so handle_exit hasn't run for it.
        assert_eq!(
            core.pid_alloc.in_use_count(),
            2,
            "old pid must remain allocated until its own reap completes"
        );

        // Eventually SIGKILL (after sigterm_grace) reaps the old instance
        // and its pid is released — without restarting under the old pid,
        // since handle_exit finds uid no longer maps to it.
        for _ in 0..200 {
            if core.pid_alloc.in_use_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            core.pid_alloc.in_use_count(),
            1,
            "old pid should be released once its reap completes"
        );

        let pid2_still = {
            let t = core.tables.lock().await;
            *t.units.get(&UnitId(1)).unwrap()
        };
        assert_eq!(pid2_still, pid2, "the new instance must still own the uid, unaffected by the old one's reap");

        core.remove(UnitId(1)).await;
    }
}
