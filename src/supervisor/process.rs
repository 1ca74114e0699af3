//! C5 — one supervised child process: argv, pipes, readiness gate, the
//! drain/reap supervise loop, and graceful close.
//!
//! Grounded in the process-group teardown and pipe-drain idioms of a
//! production child-process supervisor (SIGTERM→grace→SIGKILL over a
//! process group, `/proc`-free reap via `waitpid`, a capacity-500 rolling
//! buffer of drained lines) adapted here to the readiness-marker protocol
//! and one-shot `ready`/`done` signals this crate's contract requires.

use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, watch, Mutex};

use crate::supervisor::log_buffer::RingBuffer;
use crate::types::{SupervisorConfig, UnitId};

/// Static launch configuration for one pid, keyed by pid in the supervisor's
/// specs table.
#[derive(Debug, Clone)]
pub struct ExecSpec {
    pub unit_id: UnitId,
    pub argv: Vec<String>,
    pub restart_cooldown: Duration,
}

impl ExecSpec {
    pub fn validate(&self) -> Result<(), crate::types::Error> {
        if self.argv.is_empty() {
            return Err(crate::types::Error::validation("argv must not be empty"));
        }
        Ok(())
    }
}

/// Why a reaped child is considered to have exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitReport {
    fn from_status(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

enum DrainDone {
    Stdout,
    Stderr,
}

struct Inner {
    started: bool,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    cmd_pid: Option<u32>,
}

/// One external child process.
///
/// `Ready()`/`Done()` are modeled as `tokio::sync::watch::channel(bool)`
/// rather than `Notify`: a caller that subscribes *after* the signal has
/// already fired must still observe it, which `watch::Receiver::wait_for`
/// guarantees and `Notify::notified()` does not.
pub struct ManagedProcess {
    spec: ExecSpec,
    env_overlay: HashMap<String, String>,
    log: Arc<RingBuffer>,
    config: Arc<SupervisorConfig>,
    inner: Arc<Mutex<Inner>>,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl std::fmt::Debug for ManagedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedProcess")
            .field("argv", &self.spec.argv)
            .field("ready", &*self.ready_rx.borrow())
            .field("done", &*self.done_rx.borrow())
            .finish()
    }
}

impl ManagedProcess {
    /// Validates `spec` and constructs a not-yet-started process. Pipe
    /// allocation itself happens in `start()`: `tokio::process::Command::
    /// spawn()` is atomic with respect to the three pipe ends it creates, so
    /// unlike a hand-rolled pipe() sequence there is nothing to roll back on
    /// partial failure.
    pub fn new(
        spec: ExecSpec,
        env_overlay: HashMap<String, String>,
        log: Arc<RingBuffer>,
        config: Arc<SupervisorConfig>,
    ) -> Result<Self, crate::types::Error> {
        spec.validate()?;
        let (ready_tx, ready_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);
        Ok(Self {
            spec,
            env_overlay,
            log,
            config,
            inner: Arc::new(Mutex::new(Inner {
                started: false,
                child: None,
                stdin: None,
                cmd_pid: None,
            })),
            ready_tx,
            ready_rx,
            done_tx,
            done_rx,
        })
    }

    /// Launches the child. A no-op returning `false` if already started, or
    /// if the OS spawn fails.
    pub async fn start(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.started {
            return false;
        }
        inner.started = true;

        let mut cmd = Command::new(&self.spec.argv[0]);
        cmd.args(&self.spec.argv[1..]);
        cmd.envs(&self.env_overlay);
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.stdin(std::process::Stdio::piped());
        // New process group so the close sequence can signal the whole
        // subtree via the negative pgid, not just the direct child.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(err) => {
                tracing::warn!(error = %err, argv = ?self.spec.argv, "process spawn failed");
                self.done_tx.send_replace(true);
                return false;
            }
        };

        let os_pid = child.id();
        tracing::info!(os_pid, argv = ?self.spec.argv, "process started");

        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");
        inner.stdin = child.stdin.take();
        inner.cmd_pid = os_pid;
        inner.child = Some(child);
        drop(inner);

        let (drain_tx, drain_rx) = mpsc::channel(2);
        tokio::spawn(drain_stdout(
            stdout,
            self.log.clone(),
            self.config.readiness_marker.clone(),
            self.ready_tx.clone(),
            drain_tx.clone(),
        ));
        tokio::spawn(drain_stderr(stderr, self.log.clone(), drain_tx));

        tokio::spawn(supervise(
            self.inner.clone(),
            self.config.clone(),
            self.done_tx.clone(),
            drain_rx,
            os_pid,
        ));

        true
    }

    /// A one-shot signal closed on first observation of the readiness
    /// marker. Safe to clone and await from multiple callers.
    pub fn ready(&self) -> watch::Receiver<bool> {
        self.ready_rx.clone()
    }

    /// A one-shot signal closed once the child has been fully reaped and
    /// stdin finalized.
    pub fn done(&self) -> watch::Receiver<bool> {
        self.done_rx.clone()
    }

    /// Writes a newline to stdin, letting a child past its readiness
    /// barrier. Fails if not started, already done, stdin unavailable, or
    /// another exclusive operation (e.g. a concurrent `close()` reaping the
    /// child) currently holds the internal lock — this is a non-blocking
    /// attempt, not a wait, so a racing `close()` always wins outright
    /// rather than letting `enter()` sneak a write in right after it.
    pub async fn enter(&self) -> bool {
        if *self.done_rx.borrow() {
            return false;
        }
        let Ok(mut inner) = self.inner.try_lock() else {
            return false;
        };
        if !inner.started || *self.done_rx.borrow() {
            return false;
        }
        match inner.stdin.as_mut() {
            Some(stdin) => stdin.write_all(b"\n").await.is_ok(),
            None => false,
        }
    }

    /// Idempotent graceful teardown: SIGTERM the process group, wait up to
    /// `sigterm_grace`, then SIGKILL. Never returns an error — failures are
    /// logged, since there is no caller-facing error surface for this path
    /// (spec §7).
    pub async fn close(&self) {
        let cmd_pid = {
            let inner = self.inner.lock().await;
            if !inner.started || *self.done_rx.borrow() {
                return;
            }
            inner.cmd_pid
        };
        let Some(os_pid) = cmd_pid else { return };
        send_signal(os_pid, libc::SIGTERM);
        tracing::info!(os_pid, signal = "SIGTERM", "sent to process group");

        let mut done_rx = self.done_rx.clone();
        let waited = tokio::time::timeout(self.config.sigterm_grace, async {
            let _ = done_rx.wait_for(|done| *done).await;
        })
        .await;

        if waited.is_err() {
            send_signal(os_pid, libc::SIGKILL);
            tracing::warn!(os_pid, signal = "SIGKILL", "sent to process group after grace expired");
        }
    }
}

/// Sends `sig` to the process group led by `os_pid` (negative pid).
fn send_signal(os_pid: u32, sig: i32) {
    let pgid = -(os_pid as i32);
    // SAFETY: kill(2) with a negative pid targets the process group; no
    // memory is touched, only a signal is delivered.
    let res = unsafe { libc::kill(pgid, sig) };
    if res != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            tracing::warn!(os_pid, sig, error = %err, "kill(pgid) failed");
        }
    }
}

async fn drain_stdout(
    stdout: tokio::process::ChildStdout,
    log: Arc<RingBuffer>,
    marker: String,
    ready_tx: watch::Sender<bool>,
    drain_done: mpsc::Sender<DrainDone>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line == marker {
                    ready_tx.send_replace(true);
                } else {
                    log.append(line);
                }
            }
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(error = %err, "stdout read failed");
                break;
            }
        }
    }
    tracing::debug!("stdout drain completed");
    let _ = drain_done.send(DrainDone::Stdout).await;
}

async fn drain_stderr(
    stderr: tokio::process::ChildStderr,
    log: Arc<RingBuffer>,
    drain_done: mpsc::Sender<DrainDone>,
) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => log.append(line),
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(error = %err, "stderr read failed");
                break;
            }
        }
    }
    tracing::debug!("stderr drain completed");
    let _ = drain_done.send(DrainDone::Stderr).await;
}

/// Awaits both pipe closures (within the pipe-pair grace window), then the
/// natural exit (within the post-drain window, forcing a close if it
/// doesn't happen), then reaps the child exactly once.
async fn supervise(
    inner: Arc<Mutex<Inner>>,
    config: Arc<SupervisorConfig>,
    done_tx: watch::Sender<bool>,
    mut drain_rx: mpsc::Receiver<DrainDone>,
    os_pid: Option<u32>,
) {
    let Some(first) = drain_rx.recv().await else {
        reap_and_finish(inner, done_tx, os_pid).await;
        return;
    };
    let _ = first;

    let second = tokio::time::timeout(config.pipe_grace, drain_rx.recv()).await;
    match second {
        Ok(Some(_)) => {
            // Both pipes closed within the grace window. Give the child a
            // short window to exit naturally before forcing it — pipe
            // closure can precede actual exit on Linux.
            let exited_naturally = tokio::time::timeout(
                config.post_drain_exit_window,
                wait_exited(inner.clone()),
            )
            .await
            .is_ok();
            if !exited_naturally {
                send_close(&inner, os_pid, config.sigterm_grace).await;
            }
        }
        _ => {
            // Second pipe failed to close in time: force shutdown now, then
            // keep draining the remaining pipe in the background (already
            // running as its own task).
            send_close(&inner, os_pid, config.sigterm_grace).await;
        }
    }

    reap_and_finish(inner, done_tx, os_pid).await;
}

/// Polls until the child has exited, without reaping — used only to decide
/// whether the post-drain window elapsed naturally.
async fn wait_exited(inner: Arc<Mutex<Inner>>) {
    loop {
        {
            let mut guard = inner.lock().await;
            if let Some(child) = guard.child.as_mut() {
                if let Ok(Some(_)) = child.try_wait() {
                    return;
                }
            } else {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn send_close(inner: &Arc<Mutex<Inner>>, os_pid: Option<u32>, sigterm_grace: Duration) {
    let Some(os_pid) = os_pid else { return };
    send_signal(os_pid, libc::SIGTERM);
    tracing::info!(os_pid, signal = "SIGTERM", "sent to process group");
    let exited = tokio::time::timeout(sigterm_grace, wait_exited(inner.clone())).await;
    if exited.is_err() {
        send_signal(os_pid, libc::SIGKILL);
        tracing::warn!(os_pid, signal = "SIGKILL", "sent to process group after grace expired");
    }
}

async fn reap_and_finish(
    inner: Arc<Mutex<Inner>>,
    done_tx: watch::Sender<bool>,
    os_pid: Option<u32>,
) {
    let mut guard = inner.lock().await;
    if let Some(mut child) = guard.child.take() {
        match child.wait().await {
            Ok(status) => {
                let report = ExitReport::from_status(status);
                tracing::info!(os_pid, exit_code = report.code, signal = report.signal, "process exited");
            }
            Err(err) => {
                tracing::warn!(os_pid, error = %err, "wait() on child failed");
            }
        }
    }
    guard.stdin = None;
    drop(guard);
    // A child that crashes before the readiness marker completes leaves
    // `ready` unset forever; callers distinguish this case via Done(), not
    // by waiting on Ready() indefinitely.
    done_tx.send_replace(true);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Arc<SupervisorConfig> {
        Arc::new(SupervisorConfig {
            readiness_marker: "READY".to_string(),
            pipe_grace: Duration::from_millis(50),
            post_drain_exit_window: Duration::from_millis(250),
            sigterm_grace: Duration::from_millis(500),
            ..Default::default()
        })
    }

    fn spec(script: &str) -> ExecSpec {
        ExecSpec {
            unit_id: UnitId(1),
            argv: vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()],
            restart_cooldown: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn start_rejects_empty_argv() {
        let err = ManagedProcess::new(
            ExecSpec {
                unit_id: UnitId(1),
                argv: vec![],
                restart_cooldown: Duration::from_secs(1),
            },
            HashMap::new(),
            Arc::new(RingBuffer::new(10)),
            test_config(),
        )
        .unwrap_err();
        assert!(matches!(err, crate::types::Error::Validation(_)));
    }

    #[tokio::test]
    async fn readiness_marker_is_observed_and_not_logged() {
        let log = Arc::new(RingBuffer::new(10));
        let proc = ManagedProcess::new(
            spec("echo before; echo READY; read x; echo after"),
            HashMap::new(),
            log.clone(),
            test_config(),
        )
        .unwrap();

        assert!(proc.start().await);
        let mut ready = proc.ready();
        tokio::time::timeout(Duration::from_secs(2), ready.wait_for(|r| *r))
            .await
            .expect("readiness marker should be observed")
            .unwrap();

        assert!(!log.read(10).contains(&"READY".to_string()));
        assert!(log.read(10).contains(&"before".to_string()));

        assert!(proc.enter().await);

        let mut done = proc.done();
        tokio::time::timeout(Duration::from_secs(2), done.wait_for(|d| *d))
            .await
            .expect("process should complete after enter()")
            .unwrap();
    }

    #[tokio::test]
    async fn close_on_unready_process_reaps_via_sigterm() {
        let log = Arc::new(RingBuffer::new(10));
        let proc = ManagedProcess::new(
            spec("sleep 60"),
            HashMap::new(),
            log,
            test_config(),
        )
        .unwrap();

        assert!(proc.start().await);
        proc.close().await;

        let mut done = proc.done();
        tokio::time::timeout(Duration::from_secs(2), done.wait_for(|d| *d))
            .await
            .expect("process should be reaped after close()")
            .unwrap();
    }

    #[tokio::test]
    async fn enter_fails_on_contention_instead_of_blocking() {
        // Holding the internal lock models another exclusive operation (a
        // concurrent close()'s reap) already in progress; enter() must
        // observe the contention and fail, not queue up behind it.
        let log = Arc::new(RingBuffer::new(10));
        let proc = ManagedProcess::new(spec("echo READY; read x"), HashMap::new(), log, test_config())
            .unwrap();
        assert!(proc.start().await);
        let mut ready = proc.ready();
        ready.wait_for(|r| *r).await.unwrap();

        let guard = proc.inner.lock().await;
        assert!(!proc.enter().await, "enter() must fail, not block, while the lock is held");
        drop(guard);

        assert!(proc.enter().await, "enter() should succeed once the lock is free");
        proc.close().await;
    }

    #[tokio::test]
    async fn double_start_is_noop() {
        let log = Arc::new(RingBuffer::new(10));
        let proc = ManagedProcess::new(spec("sleep 60"), HashMap::new(), log, test_config())
            .unwrap();
        assert!(proc.start().await);
        assert!(!proc.start().await);
        proc.close().await;
    }

    #[tokio::test]
    async fn natural_exit_leaves_marker_file_written_by_child() {
        // Stands in for a remux job that produces an output file: we assert
        // on a filesystem side effect rather than only on the Done() signal.
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("done.marker");
        let log = Arc::new(RingBuffer::new(10));
        let proc = ManagedProcess::new(
            spec(&format!("echo READY; read x; touch {}", marker.display())),
            HashMap::new(),
            log,
            test_config(),
        )
        .unwrap();

        assert!(proc.start().await);
        let mut ready = proc.ready();
        ready.wait_for(|r| *r).await.unwrap();
        assert!(proc.enter().await);

        let mut done = proc.done();
        tokio::time::timeout(Duration::from_secs(2), done.wait_for(|d| *d))
            .await
            .expect("process should complete after enter()")
            .unwrap();

        assert!(marker.exists(), "child should have written its marker file before exiting");
    }

    #[tracing_test::traced_test]
    #[tokio::test]
    async fn start_logs_the_os_pid() {
        let log = Arc::new(RingBuffer::new(10));
        let proc = ManagedProcess::new(spec("sleep 60"), HashMap::new(), log, test_config())
            .unwrap();
        assert!(proc.start().await);
        // `logs_contain` is injected into scope by `#[traced_test]`.
        assert!(logs_contain("process started"));
        proc.close().await;
    }
}
