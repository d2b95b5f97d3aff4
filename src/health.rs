//! Periodic health probing of managed applications
//!
//! Each app with health checks enabled gets its own probe loop: after an
//! initial grace period, GET the configured path on the backend port every
//! interval. Sustained failure triggers a supervisor restart when the app's
//! restart policy allows it. Probes are skipped while the process is not
//! running and are not counted as failures.

use crate::config::AppSpec;
use crate::supervisor::Supervisor;
use chrono::{DateTime, Utc};
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::Request;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Grace period before the first probe of a freshly started app
const INITIAL_GRACE: Duration = Duration::from_secs(5);

/// User agent sent with every probe
const PROBE_USER_AGENT: &str = "guvnor-healthcheck/1.0";

/// Response body capture limit
const SNIPPET_LIMIT: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

/// Latest probe outcome for one app
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Runs one probe loop per health-enabled app
pub struct HealthProber {
    supervisor: Arc<Supervisor>,
    results: Arc<RwLock<HashMap<String, HealthReport>>>,
    client: Client<HttpConnector, Empty<Bytes>>,
    shutdown: watch::Receiver<bool>,
}

impl HealthProber {
    pub fn new(supervisor: Arc<Supervisor>, shutdown: watch::Receiver<bool>) -> Arc<Self> {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(2)
            .build(connector);

        Arc::new(Self {
            supervisor,
            results: Arc::new(RwLock::new(HashMap::new())),
            client,
            shutdown,
        })
    }

    /// Spawn a probe loop for every app with health checks enabled
    pub fn start(self: &Arc<Self>, apps: &[AppSpec]) {
        for app in apps {
            if !app.health_check.enabled {
                continue;
            }
            let prober = Arc::clone(self);
            let app = app.clone();
            tokio::spawn(async move {
                prober.probe_loop(app).await;
            });
        }
    }

    /// Latest report per app
    pub fn results(&self) -> HashMap<String, HealthReport> {
        self.results.read().clone()
    }

    pub fn result_for(&self, name: &str) -> Option<HealthReport> {
        self.results.read().get(name).cloned()
    }

    async fn probe_loop(self: Arc<Self>, app: AppSpec) {
        let check = &app.health_check;
        info!(
            app = %app.name,
            path = %check.path,
            interval_secs = check.interval_secs,
            "Starting health checks"
        );

        let mut shutdown_rx = self.shutdown.clone();

        // Let the app start before the first probe
        tokio::select! {
            _ = tokio::time::sleep(INITIAL_GRACE) => {}
            _ = shutdown_signalled(&mut shutdown_rx) => return,
        }

        let mut consecutive_failures: u32 = 0;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(check.interval()) => {}
                _ = shutdown_signalled(&mut shutdown_rx) => {
                    info!(app = %app.name, "Stopping health checks");
                    return;
                }
            }

            if !self.supervisor.is_running(&app.name) {
                // Not a failure; the supervisor owns restart-on-exit
                debug!(app = %app.name, "Process not running, skipping health check");
                self.store(
                    &app.name,
                    HealthReport {
                        status: HealthStatus::Unknown,
                        http_status: None,
                        response: None,
                        error: Some("process not running".to_string()),
                        timestamp: Utc::now(),
                        duration_ms: 0,
                    },
                );
                continue;
            }

            let report = self.probe(&app).await;
            let healthy = report.status == HealthStatus::Healthy;
            let previous = self.store(&app.name, report.clone());

            if previous.map(|p| p.status) != Some(report.status) {
                info!(
                    app = %app.name,
                    status = ?report.status,
                    http_status = ?report.http_status,
                    "Health status changed"
                );
            }

            if healthy {
                consecutive_failures = 0;
                continue;
            }

            consecutive_failures += 1;
            warn!(
                app = %app.name,
                consecutive_failures,
                retries = check.retries,
                error = ?report.error,
                "Health check failed"
            );

            if consecutive_failures >= check.retries && app.restart_policy.enabled {
                error!(app = %app.name, "Health check failed too many times, restarting process");
                match self.supervisor.restart(&app.name).await {
                    Ok(()) => {
                        info!(app = %app.name, "Process restarted after failed health checks");
                        consecutive_failures = 0;
                    }
                    Err(e) => {
                        error!(app = %app.name, error = %e, "Failed to restart unhealthy process");
                    }
                }
            }
        }
    }

    /// One probe with the configured deadline
    async fn probe(&self, app: &AppSpec) -> HealthReport {
        let check = &app.health_check;
        let started = Instant::now();
        let uri = format!("http://127.0.0.1:{}{}", app.port, check.path);

        let request = Request::builder()
            .method("GET")
            .uri(&uri)
            .header(hyper::header::USER_AGENT, PROBE_USER_AGENT)
            .header(hyper::header::ACCEPT, "application/json,text/plain,*/*")
            .body(Empty::<Bytes>::new());

        let request = match request {
            Ok(r) => r,
            Err(e) => {
                return HealthReport {
                    status: HealthStatus::Unhealthy,
                    http_status: None,
                    response: None,
                    error: Some(format!("failed to build request: {e}")),
                    timestamp: Utc::now(),
                    duration_ms: started.elapsed().as_millis() as u64,
                };
            }
        };

        let outcome = tokio::time::timeout(check.timeout(), async {
            let response = self.client.request(request).await?;
            let status = response.status().as_u16();
            let body = response.into_body().collect().await?.to_bytes();
            Ok::<(u16, Bytes), anyhow::Error>((status, body))
        })
        .await;

        let duration_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(Ok((status, body))) => {
                let passed = match check.expected_status {
                    Some(expected) => status == expected,
                    None => (200..300).contains(&status),
                };
                let snippet = snippet(&body);
                HealthReport {
                    status: if passed {
                        HealthStatus::Healthy
                    } else {
                        HealthStatus::Unhealthy
                    },
                    http_status: Some(status),
                    response: snippet,
                    error: if passed {
                        None
                    } else {
                        Some(format!("unhealthy status code: {status}"))
                    },
                    timestamp: Utc::now(),
                    duration_ms,
                }
            }
            Ok(Err(e)) => HealthReport {
                status: HealthStatus::Unhealthy,
                http_status: None,
                response: None,
                error: Some(format!("request failed: {e}")),
                timestamp: Utc::now(),
                duration_ms,
            },
            Err(_) => HealthReport {
                status: HealthStatus::Unhealthy,
                http_status: None,
                response: None,
                error: Some(format!("timeout after {}s", check.timeout_secs)),
                timestamp: Utc::now(),
                duration_ms,
            },
        }
    }

    fn store(&self, name: &str, report: HealthReport) -> Option<HealthReport> {
        self.results.write().insert(name.to_string(), report)
    }
}

fn snippet(body: &Bytes) -> Option<String> {
    if body.is_empty() {
        return None;
    }
    let end = body.len().min(SNIPPET_LIMIT);
    Some(String::from_utf8_lossy(&body[..end]).into_owned())
}

async fn shutdown_signalled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
