//! A single managed child process
//!
//! Each [`Process`] owns the full lifecycle of one OS child: spawn with a
//! prepared environment, observe the exit, restart within the configured
//! policy, and stop with graceful-then-forceful semantics. Every transition
//! is appended to the log ring under the app name.

use crate::config::AppSpec;
use crate::logring::LogRing;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Graceful window between the terminate signal and the forceful kill
pub const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll interval while waiting for a stopping child to exit
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Pause between stop and start during a restart
const RESTART_PAUSE: Duration = Duration::from_secs(1);

/// State of a managed process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

/// How a stop request concluded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Child exited within the graceful window
    Stopped,
    /// Graceful window elapsed; the process group was force-killed
    Killed,
    /// The process was not running
    NotRunning,
}

/// Snapshot of a process for the management API
#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub name: String,
    pub pid: u32,
    pub state: ProcessState,
    pub restarts: u32,
    pub command: String,
    pub args: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub port: u16,
}

struct Inner {
    spec: Option<AppSpec>,
    state: ProcessState,
    pid: u32,
    restarts: u32,
    started_at: Option<DateTime<Utc>>,
    externally_owned: bool,
}

/// One managed OS child for one [`AppSpec`]
pub struct Process {
    name: String,
    pid_file: PathBuf,
    ring: LogRing,
    inner: Mutex<Inner>,
}

enum ExitDecision {
    CleanExit,
    Restart { backoff: Duration, attempt: u32, max: u32 },
    Failed { code: Option<i32> },
    StoppedByRequest,
    None,
}

impl Process {
    pub fn new(spec: AppSpec, pid_file: PathBuf, ring: LogRing) -> Arc<Self> {
        Arc::new(Self {
            name: spec.name.clone(),
            pid_file,
            ring,
            inner: Mutex::new(Inner {
                spec: Some(spec),
                state: ProcessState::Stopped,
                pid: 0,
                restarts: 0,
                started_at: None,
                externally_owned: false,
            }),
        })
    }

    /// A process adopted from a PID file after a supervisor restart.
    /// It has no spec until [`adopt_spec`](Self::adopt_spec) re-attaches one
    /// and is excluded from restart logic until then.
    pub fn recovered(name: String, pid: u32, pid_file: PathBuf, ring: LogRing) -> Arc<Self> {
        Arc::new(Self {
            name,
            pid_file,
            ring,
            inner: Mutex::new(Inner {
                spec: None,
                state: ProcessState::Running,
                pid,
                restarts: 0,
                started_at: None,
                externally_owned: true,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ProcessState {
        self.inner.lock().state
    }

    pub fn pid(&self) -> u32 {
        self.inner.lock().pid
    }

    pub fn restart_count(&self) -> u32 {
        self.inner.lock().restarts
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().started_at
    }

    pub fn externally_owned(&self) -> bool {
        self.inner.lock().externally_owned
    }

    pub fn spec(&self) -> Option<AppSpec> {
        self.inner.lock().spec.clone()
    }

    /// Re-attach a spec to a recovered process, making it restart-eligible
    pub fn adopt_spec(&self, spec: AppSpec) {
        let mut inner = self.inner.lock();
        inner.spec = Some(spec);
        inner.externally_owned = false;
    }

    pub fn info(&self) -> ProcessInfo {
        let inner = self.inner.lock();
        ProcessInfo {
            name: self.name.clone(),
            pid: inner.pid,
            state: inner.state,
            restarts: inner.restarts,
            command: inner
                .spec
                .as_ref()
                .map(|s| s.command.clone())
                .unwrap_or_default(),
            args: inner.spec.as_ref().map(|s| s.args.clone()).unwrap_or_default(),
            started_at: inner.started_at,
            port: inner.spec.as_ref().map(|s| s.port).unwrap_or(0),
        }
    }

    /// True iff the state is Running and the OS still knows the pid.
    /// A failed probe flips the state to Stopped.
    pub fn is_running(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != ProcessState::Running {
            return false;
        }
        if inner.pid != 0 && !process_alive(inner.pid) {
            inner.state = ProcessState::Stopped;
            return false;
        }
        true
    }

    /// Spawn the child and begin supervision.
    ///
    /// The child inherits the host environment overlaid with the app's env,
    /// runs in its own process group, and has stdout/stderr pumped into the
    /// log ring. The PID file is written on success.
    pub fn start(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send>> {
        let this = Arc::clone(self);
        Box::pin(async move {
            let spec = {
                let mut inner = this.inner.lock();
                if inner.state == ProcessState::Running || inner.state == ProcessState::Starting {
                    anyhow::bail!("process '{}' is already running", this.name);
                }
                let Some(spec) = inner.spec.clone() else {
                    anyhow::bail!(
                        "process '{}' is externally owned and has no configuration",
                        this.name
                    );
                };
                inner.state = ProcessState::Starting;
                spec
            };

            info!(
                app = %this.name,
                command = %spec.command,
                args = ?spec.args,
                port = spec.port,
                "Starting process"
            );

            let mut cmd = Command::new(&spec.command);
            cmd.args(&spec.args);
            cmd.stdin(Stdio::null());
            cmd.stdout(Stdio::piped());
            cmd.stderr(Stdio::piped());
            if let Some(dir) = &spec.working_dir {
                cmd.current_dir(dir);
            }
            for (key, value) in &spec.env {
                cmd.env(key, value);
            }
            set_process_group(&mut cmd);

            let mut child = match cmd.spawn() {
                Ok(child) => child,
                Err(e) => {
                    this.inner.lock().state = ProcessState::Failed;
                    this.ring
                        .append(&this.name, "error", format!("Failed to start: {e}"));
                    error!(app = %this.name, error = %e, "Failed to spawn process");
                    return Err(anyhow::anyhow!(
                        "failed to start process '{}': {e}",
                        this.name
                    ));
                }
            };

            let pid = child.id().unwrap_or(0);
            {
                let mut inner = this.inner.lock();
                inner.pid = pid;
                inner.state = ProcessState::Running;
                inner.started_at = Some(Utc::now());
            }

            if let Err(e) = this.write_pid_file(pid) {
                warn!(app = %this.name, error = %e, "Failed to write PID file");
            }

            this.ring
                .append(&this.name, "info", format!("Process started (pid {pid})"));
            info!(app = %this.name, pid, "Process started");

            this.pump_output(&mut child);

            let proc = Arc::clone(&this);
            tokio::spawn(async move {
                proc.monitor(child, shutdown).await;
            });

            Ok(())
        })
    }

    /// Forward child stdout/stderr lines into the log ring
    fn pump_output(self: &Arc<Self>, child: &mut Child) {
        if let Some(stdout) = child.stdout.take() {
            let ring = self.ring.clone();
            let name = self.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    ring.append(&name, "info", line);
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let ring = self.ring.clone();
            let name = self.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    ring.append(&name, "error", line);
                }
            });
        }
    }

    /// Supervision loop: wait for the child to exit and decide what happens next
    async fn monitor(self: Arc<Self>, mut child: Child, shutdown: watch::Receiver<bool>) {
        let mut shutdown_rx = shutdown.clone();
        let status = tokio::select! {
            status = child.wait() => status,
            _ = wait_for_shutdown(&mut shutdown_rx) => {
                debug!(app = %self.name, "Supervision loop exiting on shutdown");
                return;
            }
        };

        let code = status.as_ref().ok().and_then(|s| s.code());
        let exited_cleanly = status.as_ref().map(|s| s.success()).unwrap_or(false);

        let decision = {
            let mut inner = self.inner.lock();
            match inner.state {
                ProcessState::Running => {
                    inner.pid = 0;
                    if exited_cleanly {
                        inner.state = ProcessState::Stopped;
                        ExitDecision::CleanExit
                    } else {
                        let policy = inner
                            .spec
                            .as_ref()
                            .map(|s| s.restart_policy.clone())
                            .unwrap_or_default();
                        if policy.enabled && inner.restarts < policy.max_retries {
                            inner.restarts += 1;
                            inner.state = ProcessState::Stopped;
                            ExitDecision::Restart {
                                backoff: policy.backoff(),
                                attempt: inner.restarts,
                                max: policy.max_retries,
                            }
                        } else {
                            inner.state = ProcessState::Failed;
                            ExitDecision::Failed { code }
                        }
                    }
                }
                ProcessState::Stopping => {
                    inner.pid = 0;
                    inner.state = ProcessState::Stopped;
                    ExitDecision::StoppedByRequest
                }
                _ => ExitDecision::None,
            }
        };

        self.remove_pid_file();

        match decision {
            ExitDecision::CleanExit => {
                self.ring.append(&self.name, "info", "Process exited normally");
                info!(app = %self.name, "Process exited normally");
            }
            ExitDecision::StoppedByRequest => {
                debug!(app = %self.name, "Process exit observed during stop");
            }
            ExitDecision::Failed { code } => {
                self.ring.append(
                    &self.name,
                    "error",
                    format!("Process exited with code {:?}, not restarting", code),
                );
                error!(app = %self.name, exit_code = ?code, "Process failed");
            }
            ExitDecision::Restart { backoff, attempt, max } => {
                self.ring.append(
                    &self.name,
                    "warn",
                    format!(
                        "Process exited with code {:?}, restart {attempt}/{max} in {}s",
                        code,
                        backoff.as_secs()
                    ),
                );
                warn!(
                    app = %self.name,
                    exit_code = ?code,
                    attempt,
                    max_retries = max,
                    "Scheduling process restart"
                );

                let mut shutdown_rx = shutdown.clone();
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = wait_for_shutdown(&mut shutdown_rx) => return,
                }

                if let Err(e) = self.start(shutdown).await {
                    self.ring
                        .append(&self.name, "error", format!("Restart failed: {e}"));
                    error!(app = %self.name, error = %e, "Failed to restart process");
                }
            }
            ExitDecision::None => {}
        }
    }

    /// Stop the process: terminate signal, 10 s graceful window, then a
    /// forceful kill of the process group. Removes the PID file.
    pub async fn stop(&self) -> anyhow::Result<StopOutcome> {
        let pid = {
            let mut inner = self.inner.lock();
            if inner.state != ProcessState::Running {
                return Ok(StopOutcome::NotRunning);
            }
            inner.state = ProcessState::Stopping;
            inner.pid
        };

        if pid == 0 {
            self.finish_stop();
            return Ok(StopOutcome::Stopped);
        }

        self.ring
            .append(&self.name, "info", format!("Stopping process (pid {pid})"));
        info!(app = %self.name, pid, "Stopping process");

        send_term(pid);

        let deadline = Instant::now() + GRACEFUL_STOP_TIMEOUT;
        let mut killed = false;
        loop {
            if !process_alive(pid) {
                break;
            }
            if Instant::now() >= deadline {
                self.ring.append(
                    &self.name,
                    "warn",
                    "Process did not stop gracefully, forcing kill",
                );
                warn!(app = %self.name, pid, "Graceful window elapsed, killing process group");
                kill_group(pid);
                killed = true;
                // Wait for the kill to land before reporting
                for _ in 0..50 {
                    if !process_alive(pid) {
                        break;
                    }
                    tokio::time::sleep(STOP_POLL_INTERVAL).await;
                }
                break;
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }

        self.finish_stop();

        if killed {
            self.ring.append(&self.name, "warn", "Process killed");
        } else {
            self.ring.append(&self.name, "info", "Process stopped gracefully");
        }

        Ok(if killed {
            StopOutcome::Killed
        } else {
            StopOutcome::Stopped
        })
    }

    fn finish_stop(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.state == ProcessState::Stopping {
                inner.state = ProcessState::Stopped;
            }
            inner.pid = 0;
        }
        self.remove_pid_file();
    }

    /// Stop, pause briefly, then start again
    pub async fn restart(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        self.ring.append(&self.name, "info", "Restarting process");
        info!(app = %self.name, "Restarting process");

        self.stop().await?;
        tokio::time::sleep(RESTART_PAUSE).await;
        self.start(shutdown).await
    }

    pub fn pid_file(&self) -> &PathBuf {
        &self.pid_file
    }

    fn write_pid_file(&self, pid: u32) -> std::io::Result<()> {
        if let Some(dir) = self.pid_file.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(&self.pid_file, format!("{pid}\n"))
    }

    fn remove_pid_file(&self) {
        let _ = std::fs::remove_file(&self.pid_file);
    }
}

async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender dropped without signalling; never resolve
            std::future::pending::<()>().await;
        }
    }
}

// Cross-platform helpers

fn set_process_group(cmd: &mut Command) {
    #[cfg(unix)]
    cmd.process_group(0);

    #[cfg(windows)]
    cmd.creation_flags(0x0000_0200); // CREATE_NEW_PROCESS_GROUP

    #[cfg(not(any(unix, windows)))]
    let _ = cmd;
}

/// Signal-0 probe for process existence
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
fn send_term(pid: u32) {
    unsafe {
        libc::kill(pid as i32, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn send_term(_pid: u32) {}

/// Forceful kill of the whole process group so descendants go too
#[cfg(unix)]
fn kill_group(pid: u32) {
    unsafe {
        let pgid = libc::getpgid(pid as i32);
        if pgid > 0 {
            libc::kill(-pgid, libc::SIGKILL);
        } else {
            libc::kill(pid as i32, libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppSpec, AppTlsConfig, HealthCheckConfig, RestartPolicy};
    use std::collections::HashMap;

    fn spec(name: &str, command: &str, args: &[&str]) -> AppSpec {
        AppSpec {
            name: name.to_string(),
            hostname: format!("{name}.localhost"),
            port: 3999,
            command: command.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            working_dir: None,
            env: HashMap::new(),
            health_check: HealthCheckConfig::default(),
            restart_policy: RestartPolicy {
                enabled: false,
                max_retries: 0,
                backoff_secs: 0,
            },
            tls: AppTlsConfig::default(),
        }
    }

    fn pid_path(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        dir.path().join(format!("{name}.pid"))
    }

    #[test]
    fn test_initial_state() {
        let dir = tempfile::tempdir().unwrap();
        let proc = Process::new(
            spec("web", "sleep", &["60"]),
            pid_path(&dir, "web"),
            LogRing::new(10),
        );

        assert_eq!(proc.state(), ProcessState::Stopped);
        assert_eq!(proc.pid(), 0);
        assert_eq!(proc.restart_count(), 0);
        assert!(!proc.is_running());
    }

    #[tokio::test]
    async fn test_stop_when_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let proc = Process::new(
            spec("web", "sleep", &["60"]),
            pid_path(&dir, "web"),
            LogRing::new(10),
        );

        assert_eq!(proc.stop().await.unwrap(), StopOutcome::NotRunning);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_and_stop() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = pid_path(&dir, "web");
        let proc = Process::new(
            spec("web", "sleep", &["60"]),
            pid_file.clone(),
            LogRing::new(10),
        );
        let (_tx, rx) = watch::channel(false);

        proc.start(rx.clone()).await.unwrap();
        assert_eq!(proc.state(), ProcessState::Running);
        assert!(proc.is_running());
        assert!(proc.pid() > 0);

        // PID file holds exactly the child pid
        let content = std::fs::read_to_string(&pid_file).unwrap();
        assert_eq!(content.trim().parse::<u32>().unwrap(), proc.pid());

        // Starting again while running is rejected
        assert!(proc.start(rx.clone()).await.is_err());

        let outcome = proc.stop().await.unwrap();
        assert_eq!(outcome, StopOutcome::Stopped);
        assert_eq!(proc.state(), ProcessState::Stopped);
        assert!(!pid_file.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_failure_is_failed() {
        let dir = tempfile::tempdir().unwrap();
        let proc = Process::new(
            spec("bad", "/nonexistent/binary-xyz", &[]),
            pid_path(&dir, "bad"),
            LogRing::new(10),
        );
        let (_tx, rx) = watch::channel(false);

        assert!(proc.start(rx).await.is_err());
        assert_eq!(proc.state(), ProcessState::Failed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_clean_exit_is_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let proc = Process::new(
            spec("oneshot", "sh", &["-c", "exit 0"]),
            pid_path(&dir, "oneshot"),
            LogRing::new(10),
        );
        let (_tx, rx) = watch::channel(false);

        proc.start(rx).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(proc.state(), ProcessState::Stopped);
        assert_eq!(proc.restart_count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_restarts_then_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = spec("crash", "sh", &["-c", "exit 1"]);
        s.restart_policy = RestartPolicy {
            enabled: true,
            max_retries: 2,
            backoff_secs: 0,
        };
        let ring = LogRing::new(100);
        let proc = Process::new(s, pid_path(&dir, "crash"), ring.clone());
        let (_tx, rx) = watch::channel(false);

        proc.start(rx).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(proc.restart_count(), 2);
        assert_eq!(proc.state(), ProcessState::Failed);
        assert!(!ring.tail_by_tag("crash", 100).is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_env_overlay_and_output_capture() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = spec("env", "sh", &["-c", "echo value=$GUVNOR_TEST_VAR"]);
        s.env
            .insert("GUVNOR_TEST_VAR".to_string(), "hello".to_string());
        let ring = LogRing::new(10);
        let proc = Process::new(s, pid_path(&dir, "env"), ring.clone());
        let (_tx, rx) = watch::channel(false);

        proc.start(rx).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        let logs = ring.tail_by_tag("env", 10);
        assert!(
            logs.iter().any(|r| r.message == "value=hello"),
            "stdout not captured: {logs:?}"
        );
    }

    #[test]
    fn test_recovered_process_has_no_spec() {
        let dir = tempfile::tempdir().unwrap();
        let proc = Process::recovered(
            "ghost".to_string(),
            std::process::id(),
            pid_path(&dir, "ghost"),
            LogRing::new(10),
        );

        assert!(proc.externally_owned());
        assert_eq!(proc.state(), ProcessState::Running);
        assert!(proc.spec().is_none());
        assert!(proc.is_running());

        proc.adopt_spec(spec("ghost", "sleep", &["60"]));
        assert!(!proc.externally_owned());
        assert!(proc.spec().is_some());
    }

    #[tokio::test]
    async fn test_recovered_without_spec_cannot_start() {
        let dir = tempfile::tempdir().unwrap();
        let proc = Process::recovered(
            "ghost".to_string(),
            0,
            pid_path(&dir, "ghost"),
            LogRing::new(10),
        );
        // Not running (pid 0 never probes alive on a fresh entry)
        proc.inner.lock().state = ProcessState::Stopped;
        let (_tx, rx) = watch::channel(false);

        let err = proc.start(rx).await.unwrap_err().to_string();
        assert!(err.contains("externally owned"), "unexpected: {err}");
    }
}
