//! Server composer
//!
//! Wires configuration into the supervisor, health prober, certificate
//! manager, proxy listeners and management API, and owns the ordered
//! shutdown: management API first, then listener drain within the
//! configured window, then the supervised processes.

use crate::cert::{CertManager, CertManagerConfig};
use crate::config::Config;
use crate::health::HealthProber;
use crate::logring::{self, LogRing};
use crate::proxy::ProxyServer;
use crate::supervisor::Supervisor;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Composes and runs all components
pub struct Server {
    config: Arc<Config>,
    ring: LogRing,
    supervisor: Arc<Supervisor>,
    prober: Arc<HealthProber>,
    cert_manager: Option<Arc<CertManager>>,
    shutdown: watch::Receiver<bool>,
}

impl Server {
    pub fn new(config: Config, shutdown: watch::Receiver<bool>) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let ring =
            LogRing::with_shared_file(logring::DEFAULT_CAPACITY, logring::shared_log_path());

        let supervisor =
            Supervisor::new(Supervisor::default_pid_dir(), ring.clone(), shutdown.clone())?;
        // Recovered processes get their configuration back
        supervisor.adopt_specs(&config.apps);

        let prober = HealthProber::new(Arc::clone(&supervisor), shutdown.clone());

        let cert_manager = if config.tls_enabled() {
            let cert_dir = PathBuf::from(&config.tls.cert_dir);
            let manager = if config.auto_cert_enabled() {
                CertManager::new(CertManagerConfig {
                    email: config.acme_email().unwrap_or_default().to_string(),
                    cert_dir,
                    staging: config.tls.staging,
                    domains: config.cert_domains(),
                })?
            } else {
                CertManager::new_static(cert_dir, config.cert_domains())?
            };
            Some(manager)
        } else {
            None
        };

        Ok(Self {
            config,
            ring,
            supervisor,
            prober,
            cert_manager,
            shutdown,
        })
    }

    pub fn supervisor(&self) -> Arc<Supervisor> {
        Arc::clone(&self.supervisor)
    }

    pub fn ring(&self) -> LogRing {
        self.ring.clone()
    }

    /// Start everything, then wait for the shutdown signal and unwind in
    /// order: management API, listeners (within shutdown_timeout), health
    /// prober, supervised processes.
    pub async fn run(self) -> anyhow::Result<()> {
        let config = &self.config;

        info!(
            http_port = config.server.http_port,
            https_port = config.server.https_port,
            management_port = config.server.management_port(),
            tls = config.tls_enabled(),
            auto_cert = config.auto_cert_enabled(),
            apps = config.apps.len(),
            "Starting guvnor"
        );

        // Start all configured applications; one failure does not stop the rest
        for app in &config.apps {
            if self.supervisor.is_running(&app.name) {
                info!(app = %app.name, "Application already running (recovered), not starting");
                continue;
            }
            info!(app = %app.name, "Starting application");
            if let Err(e) = self.supervisor.start(app.clone()).await {
                error!(app = %app.name, error = %e, "Failed to start application");
            }
        }

        self.prober.start(&config.apps);

        // Certificate material for apps that bring their own files, and a
        // self-signed fallback when TLS is on without ACME or files
        if let Some(manager) = &self.cert_manager {
            let mut fallback_hosts = Vec::new();
            for app in &config.apps {
                if !app.tls_enabled(&config.tls) {
                    continue;
                }
                match (&app.tls.cert_file, &app.tls.key_file) {
                    (Some(cert_file), Some(key_file)) => {
                        if let Err(e) = manager.insert_static(&app.hostname, cert_file, key_file) {
                            error!(app = %app.name, error = %e, "Failed to load certificate files");
                        }
                    }
                    _ if !config.auto_cert_enabled() => {
                        fallback_hosts.push(app.hostname.clone());
                    }
                    _ => {}
                }
            }
            if !fallback_hosts.is_empty() {
                warn!(
                    hosts = ?fallback_hosts,
                    "TLS enabled without ACME or certificate files, using a self-signed certificate (not for production)"
                );
                if let Err(e) = manager.insert_self_signed(&fallback_hosts) {
                    error!(error = %e, "Failed to generate self-signed certificate");
                }
            }

            if config.auto_cert_enabled() {
                let manager = Arc::clone(manager);
                let shutdown = self.shutdown.clone();
                tokio::spawn(manager.run_renewal_loop(shutdown));
            }
        }

        // Listeners
        let proxy = Arc::new(ProxyServer::new(
            Arc::clone(&self.config),
            Arc::clone(&self.supervisor),
            self.cert_manager.clone(),
            self.shutdown.clone(),
        ));

        let http_addr = SocketAddr::from(([0, 0, 0, 0], config.server.http_port));
        let http_handle: JoinHandle<()> = {
            let proxy = Arc::clone(&proxy);
            tokio::spawn(async move {
                if let Err(e) = proxy.run_http(http_addr).await {
                    error!(error = %e, "HTTP listener error");
                }
            })
        };

        let https_handle: Option<JoinHandle<()>> = if config.tls_enabled() {
            let https_addr = SocketAddr::from(([0, 0, 0, 0], config.server.https_port));
            let proxy = Arc::clone(&proxy);
            Some(tokio::spawn(async move {
                if let Err(e) = proxy.run_https(https_addr).await {
                    error!(error = %e, "HTTPS listener error");
                }
            }))
        } else {
            None
        };

        // Management API on loopback
        let api_addr = SocketAddr::from(([127, 0, 0, 1], config.server.management_port()));
        let api = crate::api::ManagementApi::new(
            api_addr,
            Arc::clone(&self.supervisor),
            Arc::clone(&self.prober),
            self.ring.clone(),
            self.shutdown.clone(),
        );
        let api_handle = tokio::spawn(async move {
            if let Err(e) = api.run().await {
                error!(error = %e, "Management API error");
            }
        });

        info!("Guvnor started");

        // Wait for shutdown
        let mut shutdown = self.shutdown.clone();
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        info!("Shutting down");

        // Management API and listeners drain within the configured window
        let drain = async {
            let _ = api_handle.await;
            let _ = http_handle.await;
            if let Some(handle) = https_handle {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(config.server.shutdown_timeout(), drain)
            .await
            .is_err()
        {
            warn!(
                timeout_secs = config.server.shutdown_timeout_secs,
                "Listeners did not drain within the shutdown window"
            );
        }

        // Health prober loops exit on the same shutdown signal; stop children last
        info!("Stopping all applications");
        let results = self.supervisor.stop_all().await;
        for result in &results {
            match result.status {
                "error" => error!(
                    app = %result.name,
                    error = ?result.error,
                    "Failed to stop application"
                ),
                "killed" => warn!(
                    app = %result.name,
                    duration_ms = result.duration_ms,
                    "Application force-killed"
                ),
                _ => info!(
                    app = %result.name,
                    status = result.status,
                    duration_ms = result.duration_ms,
                    "Application stopped"
                ),
            }
        }

        info!("Shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ServerConfig, TlsConfig};

    #[test]
    fn test_server_builds_without_tls() {
        let (_tx, rx) = watch::channel(false);
        let config = Config {
            server: ServerConfig::default(),
            tls: TlsConfig::default(),
            apps: vec![],
        };
        let server = Server::new(config, rx).unwrap();
        assert!(server.cert_manager.is_none());
    }

    #[test]
    fn test_server_builds_static_cert_manager() {
        let dir = tempfile::tempdir().unwrap();
        let (_tx, rx) = watch::channel(false);
        let mut config = Config {
            server: ServerConfig::default(),
            tls: TlsConfig {
                enabled: true,
                auto_cert: false,
                cert_dir: dir.path().to_string_lossy().into_owned(),
                ..TlsConfig::default()
            },
            apps: vec![crate::config::AppSpec {
                name: "web".to_string(),
                hostname: String::new(),
                port: 3001,
                command: "sleep".to_string(),
                args: vec!["60".to_string()],
                working_dir: None,
                env: Default::default(),
                health_check: Default::default(),
                restart_policy: Default::default(),
                tls: Default::default(),
            }],
        };
        config.validate().unwrap();

        let server = Server::new(config, rx).unwrap();
        assert!(server.cert_manager.is_some());
    }
}
