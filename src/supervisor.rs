//! Fleet management for supervised processes
//!
//! The [`Supervisor`] owns the name→process registry, provides fleet
//! operations (start/stop/restart/stop_all) and recovers state across
//! supervisor restarts from PID files. Processes found in PID files but
//! absent from configuration stay observable but are excluded from
//! restart logic.

use crate::config::AppSpec;
use crate::logring::LogRing;
use crate::process::{self, Process, ProcessInfo, StopOutcome};
use dashmap::DashMap;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Per-app outcome of a stop_all
#[derive(Debug, Clone, Serialize)]
pub struct StopResult {
    pub name: String,
    pub pid: u32,
    /// "stopped", "killed", "not_running" or "error"
    pub status: &'static str,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Owns the set of managed processes
pub struct Supervisor {
    processes: DashMap<String, Arc<Process>>,
    pid_dir: PathBuf,
    ring: LogRing,
    shutdown: watch::Receiver<bool>,
}

impl Supervisor {
    /// Create the supervisor and recover any live processes from PID files
    pub fn new(
        pid_dir: PathBuf,
        ring: LogRing,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<Arc<Self>> {
        std::fs::create_dir_all(&pid_dir)?;
        let supervisor = Arc::new(Self {
            processes: DashMap::new(),
            pid_dir,
            ring,
            shutdown,
        });
        supervisor.recover_from_pid_files();
        Ok(supervisor)
    }

    /// Default PID directory under the OS temp dir
    pub fn default_pid_dir() -> PathBuf {
        std::env::temp_dir().join("guvnor").join("pids")
    }

    fn pid_file_for(&self, name: &str) -> PathBuf {
        self.pid_dir.join(format!("{name}.pid"))
    }

    /// Scan the PID directory for live processes left by a previous
    /// supervisor. Stale files are removed; live pids are adopted as
    /// Running, externally owned processes.
    fn recover_from_pid_files(&self) {
        let entries = match std::fs::read_dir(&self.pid_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %self.pid_dir.display(), error = %e, "Failed to scan PID directory");
                return;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("pid") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(String::from) else {
                continue;
            };

            let pid = std::fs::read_to_string(&path)
                .ok()
                .and_then(|s| s.trim().parse::<u32>().ok());

            match pid {
                Some(pid) if process::process_alive(pid) => {
                    let proc = Process::recovered(name.clone(), pid, path, self.ring.clone());
                    self.processes.insert(name.clone(), proc);
                    self.ring.append(
                        &name,
                        "info",
                        format!("Recovered running process (pid {pid})"),
                    );
                    info!(app = %name, pid, "Recovered running process from PID file");
                }
                _ => {
                    let _ = std::fs::remove_file(&path);
                    info!(app = %name, "Removed stale PID file");
                }
            }
        }
    }

    /// Re-attach specs to recovered processes once configuration is loaded.
    /// Recovered processes with no matching spec stay externally owned.
    pub fn adopt_specs(&self, specs: &[AppSpec]) {
        for spec in specs {
            if let Some(proc) = self.processes.get(&spec.name) {
                if proc.externally_owned() {
                    proc.adopt_spec(spec.clone());
                    info!(app = %spec.name, "Attached configuration to recovered process");
                }
            }
        }
    }

    /// Start a process for the given spec. Rejects a duplicate that is
    /// still running; a stopped duplicate is replaced.
    pub async fn start(&self, spec: AppSpec) -> anyhow::Result<()> {
        if let Some(existing) = self.processes.get(&spec.name) {
            if existing.is_running() {
                anyhow::bail!("process '{}' is already running", spec.name);
            }
        }

        let name = spec.name.clone();
        let pid_file = self.pid_file_for(&name);
        let proc = Process::new(spec, pid_file, self.ring.clone());
        self.processes.insert(name, Arc::clone(&proc));
        proc.start(self.shutdown.clone()).await
    }

    pub async fn stop(&self, name: &str) -> anyhow::Result<StopOutcome> {
        let proc = self
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("process '{name}' not found"))?;
        proc.stop().await
    }

    pub async fn restart(&self, name: &str) -> anyhow::Result<()> {
        let proc = self
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("process '{name}' not found"))?;
        if proc.externally_owned() {
            anyhow::bail!("process '{name}' is externally owned and not restart-eligible");
        }
        proc.restart(self.shutdown.clone()).await
    }

    /// Stop all running processes concurrently and collect per-app results.
    /// Individual failures never abort the other stops.
    pub async fn stop_all(&self) -> Vec<StopResult> {
        let running: Vec<Arc<Process>> = self
            .processes
            .iter()
            .filter(|entry| entry.value().is_running())
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        if running.is_empty() {
            return Vec::new();
        }

        let names: Vec<&str> = running.iter().map(|p| p.name()).collect();
        self.ring.append(
            "system",
            "info",
            format!("Stopping {} processes: {names:?}", running.len()),
        );

        let mut set = JoinSet::new();
        for proc in running {
            set.spawn(async move {
                let start = Instant::now();
                let name = proc.name().to_string();
                let pid = proc.pid();
                match proc.stop().await {
                    Ok(StopOutcome::Stopped) => StopResult {
                        name,
                        pid,
                        status: "stopped",
                        duration_ms: start.elapsed().as_millis() as u64,
                        error: None,
                    },
                    Ok(StopOutcome::Killed) => StopResult {
                        name,
                        pid,
                        status: "killed",
                        duration_ms: start.elapsed().as_millis() as u64,
                        error: None,
                    },
                    Ok(StopOutcome::NotRunning) => StopResult {
                        name,
                        pid,
                        status: "not_running",
                        duration_ms: start.elapsed().as_millis() as u64,
                        error: None,
                    },
                    Err(e) => StopResult {
                        name,
                        pid,
                        status: "error",
                        duration_ms: start.elapsed().as_millis() as u64,
                        error: Some(e.to_string()),
                    },
                }
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => warn!(error = %e, "Stop task panicked"),
            }
        }

        let stopped = results.iter().filter(|r| r.status == "stopped").count();
        let killed = results.iter().filter(|r| r.status == "killed").count();
        let errors = results.iter().filter(|r| r.status == "error").count();
        self.ring.append(
            "system",
            "info",
            format!("Stop complete: {stopped} stopped gracefully, {killed} killed, {errors} errors"),
        );

        results
    }

    pub fn get(&self, name: &str) -> Option<Arc<Process>> {
        self.processes.get(name).map(|p| Arc::clone(p.value()))
    }

    /// True iff a process with this name exists and is running
    pub fn is_running(&self, name: &str) -> bool {
        self.get(name).map(|p| p.is_running()).unwrap_or(false)
    }

    /// Snapshot of the registry
    pub fn list(&self) -> Vec<(String, Arc<Process>)> {
        self.processes
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect()
    }

    /// Info for all running processes (recovered ones included)
    pub fn running_info(&self) -> Vec<ProcessInfo> {
        let mut info: Vec<ProcessInfo> = self
            .processes
            .iter()
            .filter(|entry| entry.value().is_running())
            .map(|entry| entry.value().info())
            .collect();
        info.sort_by(|a, b| a.name.cmp(&b.name));
        info
    }
}

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

    fn new_supervisor(dir: &tempfile::TempDir) -> (Arc<Supervisor>, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let supervisor =
            Supervisor::new(dir.path().to_path_buf(), LogRing::new(100), rx).unwrap();
        (supervisor, tx)
    }

    #[tokio::test]
    async fn test_stop_all_idempotent_when_empty() {
        let dir = tempfile::tempdir().unwrap();
        let (supervisor, _shutdown) = new_supervisor(&dir);

        assert!(supervisor.stop_all().await.is_empty());
        assert!(supervisor.stop_all().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_process_operations() {
        let dir = tempfile::tempdir().unwrap();
        let (supervisor, _shutdown) = new_supervisor(&dir);

        assert!(supervisor.stop("nope").await.is_err());
        assert!(supervisor.restart("nope").await.is_err());
        assert!(supervisor.get("nope").is_none());
        assert!(!supervisor.is_running("nope"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let (supervisor, _shutdown) = new_supervisor(&dir);

        supervisor.start(spec("a", "sleep", &["60"])).await.unwrap();
        assert!(supervisor.is_running("a"));

        // Duplicate start of a running process is rejected
        assert!(supervisor.start(spec("a", "sleep", &["60"])).await.is_err());

        let outcome = supervisor.stop("a").await.unwrap();
        assert_eq!(outcome, StopOutcome::Stopped);
        assert!(!supervisor.is_running("a"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_all_collects_results() {
        let dir = tempfile::tempdir().unwrap();
        let (supervisor, _shutdown) = new_supervisor(&dir);

        supervisor.start(spec("a", "sleep", &["60"])).await.unwrap();
        supervisor.start(spec("b", "sleep", &["60"])).await.unwrap();

        let mut results = supervisor.stop_all().await;
        results.sort_by(|x, y| x.name.cmp(&y.name));

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].name, "a");
        assert_eq!(results[0].status, "stopped");
        assert!(results[0].pid > 0);
        assert_eq!(results[1].name, "b");

        // Second stop_all finds nothing running
        assert!(supervisor.stop_all().await.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pid_file_recovery() {
        let dir = tempfile::tempdir().unwrap();

        // A live pid (our own) and a stale one
        std::fs::write(
            dir.path().join("alive.pid"),
            format!("{}\n", std::process::id()),
        )
        .unwrap();
        std::fs::write(dir.path().join("stale.pid"), "999999999\n").unwrap();
        std::fs::write(dir.path().join("garbage.pid"), "not-a-pid\n").unwrap();

        let (supervisor, _shutdown) = new_supervisor(&dir);

        let recovered = supervisor.get("alive").expect("live pid recovered");
        assert!(recovered.externally_owned());
        assert_eq!(recovered.pid(), std::process::id());
        assert!(supervisor.is_running("alive"));

        assert!(supervisor.get("stale").is_none());
        assert!(!dir.path().join("stale.pid").exists());
        assert!(!dir.path().join("garbage.pid").exists());

        // Recovered process is visible but not restart-eligible
        let info = supervisor.running_info();
        assert!(info.iter().any(|i| i.name == "alive"));
        assert!(supervisor.restart("alive").await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_adopt_specs_makes_recovered_eligible() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("web.pid"),
            format!("{}\n", std::process::id()),
        )
        .unwrap();

        let (supervisor, _shutdown) = new_supervisor(&dir);
        let proc = supervisor.get("web").unwrap();
        assert!(proc.externally_owned());

        supervisor.adopt_specs(&[spec("web", "sleep", &["60"])]);
        assert!(!proc.externally_owned());
        assert!(proc.spec().is_some());
    }
}
