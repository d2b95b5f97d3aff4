use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Default header carrying the per-hop tracking chain
pub const DEFAULT_TRACKING_HEADER: &str = "X-GUVNOR-TRACKING";

/// Global configuration for the supervisor
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    /// Server-wide settings (ports, timeouts, tracking)
    #[serde(default)]
    pub server: ServerConfig,

    /// Global TLS settings
    #[serde(default)]
    pub tls: TlsConfig,

    /// Managed applications
    #[serde(default)]
    pub apps: Vec<AppSpec>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    /// HTTP port (default: 80)
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// HTTPS port (default: 443)
    #[serde(default = "default_https_port")]
    pub https_port: u16,

    /// Read timeout in seconds for inbound connections
    #[serde(default = "default_rw_timeout")]
    pub read_timeout_secs: u64,

    /// Write timeout in seconds for inbound connections
    #[serde(default = "default_rw_timeout")]
    pub write_timeout_secs: u64,

    /// Graceful listener shutdown window in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Log level for the tracing subscriber (default: info)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Append a per-hop UUID to the tracking header on forwarded requests
    #[serde(default)]
    pub enable_tracking: bool,

    /// Header name for the tracking chain (default: X-GUVNOR-TRACKING)
    #[serde(default = "default_tracking_header")]
    pub tracking_header: String,
}

impl ServerConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// The management API listens on loopback at http_port + 1000
    pub fn management_port(&self) -> u16 {
        self.http_port.saturating_add(1000)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
            https_port: default_https_port(),
            read_timeout_secs: default_rw_timeout(),
            write_timeout_secs: default_rw_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            log_level: default_log_level(),
            enable_tracking: false,
            tracking_header: default_tracking_header(),
        }
    }
}

/// Global TLS and ACME configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TlsConfig {
    /// Enable the HTTPS listener
    #[serde(default)]
    pub enabled: bool,

    /// Acquire certificates automatically via ACME
    #[serde(default)]
    pub auto_cert: bool,

    /// Directory for the on-disk certificate cache
    #[serde(default = "default_cert_dir")]
    pub cert_dir: String,

    /// Contact email for the ACME account (required when auto_cert)
    pub email: Option<String>,

    /// Extra domains eligible for certificates (app hostnames are always added)
    #[serde(default)]
    pub domains: Vec<String>,

    /// Use the ACME staging directory
    #[serde(default)]
    pub staging: bool,

    /// Redirect HTTP requests to HTTPS with a 301
    #[serde(default)]
    pub force_https: bool,

    /// Inject X-Certificate-* headers describing the client certificate
    #[serde(default)]
    pub certificate_headers: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            auto_cert: false,
            cert_dir: default_cert_dir(),
            email: None,
            domains: Vec::new(),
            staging: false,
            force_https: false,
            certificate_headers: false,
        }
    }
}

/// Per-app TLS overrides
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct AppTlsConfig {
    pub enabled: Option<bool>,
    pub auto_cert: Option<bool>,
    pub email: Option<String>,
    pub staging: Option<bool>,
    /// PEM certificate chain for this app's hostname (instead of ACME)
    pub cert_file: Option<String>,
    /// PEM private key matching cert_file
    pub key_file: Option<String>,
    pub certificate_headers: Option<bool>,
}

/// Health check parameters for one app
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HealthCheckConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Path probed on the backend (default: /health)
    #[serde(default = "default_health_path")]
    pub path: String,

    /// Seconds between probes
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,

    /// Total deadline per probe in seconds
    #[serde(default = "default_health_timeout")]
    pub timeout_secs: u64,

    /// Consecutive failures before a restart is triggered
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Exact status expected from the probe; any 2xx passes when unset
    pub expected_status: Option<u16>,
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            path: default_health_path(),
            interval_secs: default_health_interval(),
            timeout_secs: default_health_timeout(),
            retries: default_retries(),
            expected_status: None,
        }
    }
}

/// Restart behavior after a non-zero exit
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RestartPolicy {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_retries")]
    pub max_retries: u32,

    /// Seconds to wait between consecutive restart attempts
    #[serde(default = "default_backoff")]
    pub backoff_secs: u64,
}

impl RestartPolicy {
    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_secs)
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            max_retries: default_retries(),
            backoff_secs: default_backoff(),
        }
    }
}

/// One managed backend application
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppSpec {
    /// Unique name; used as routing key, log tag and PID file stem
    pub name: String,

    /// Hostname routed to this app (auto: {name}.localhost)
    #[serde(default)]
    pub hostname: String,

    /// Loopback port the backend listens on (auto-assigned from 3000 when 0)
    #[serde(default)]
    pub port: u16,

    /// Command to execute
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    pub working_dir: Option<String>,

    /// Environment overlaid onto the inherited host environment
    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default)]
    pub health_check: HealthCheckConfig,

    #[serde(default)]
    pub restart_policy: RestartPolicy,

    #[serde(default)]
    pub tls: AppTlsConfig,
}

impl AppSpec {
    /// Whether the certificate headers should be injected for this app
    pub fn certificate_headers(&self, global: &TlsConfig) -> bool {
        self.tls
            .certificate_headers
            .unwrap_or(global.certificate_headers)
    }

    /// Whether TLS applies to this app, considering the global setting
    pub fn tls_enabled(&self, global: &TlsConfig) -> bool {
        self.tls.enabled.unwrap_or(global.enabled)
    }
}

// Default value functions

fn default_http_port() -> u16 {
    80
}

fn default_https_port() -> u16 {
    443
}

fn default_rw_timeout() -> u64 {
    30
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_tracking_header() -> String {
    DEFAULT_TRACKING_HEADER.to_string()
}

fn default_cert_dir() -> String {
    "/var/lib/guvnor/certs".to_string()
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_health_interval() -> u64 {
    30
}

fn default_health_timeout() -> u64 {
    5
}

fn default_retries() -> u32 {
    3
}

fn default_backoff() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration and materialize derived values.
    ///
    /// Auto-generates hostnames and ports, substitutes `$PORT` placeholders
    /// in args and env, and rejects duplicate names/hostnames/ports.
    pub fn validate(&mut self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.http_port == 0 {
            errors.push("server: http_port must be greater than 0".to_string());
        }
        if self.server.https_port == 0 {
            errors.push("server: https_port must be greater than 0".to_string());
        }

        let mut names: HashMap<String, ()> = HashMap::new();
        let mut hostnames: HashMap<String, String> = HashMap::new();
        let mut ports: HashMap<u16, String> = HashMap::new();
        let mut used_ports: HashSet<u16> =
            self.apps.iter().map(|a| a.port).filter(|p| *p != 0).collect();
        let mut next_auto_port: u16 = 3000;

        for app in &mut self.apps {
            if app.name.is_empty() {
                errors.push("app name cannot be empty".to_string());
                continue;
            }
            if names.insert(app.name.clone(), ()).is_some() {
                errors.push(format!("app name '{}' is used more than once", app.name));
            }

            if app.command.is_empty() {
                errors.push(format!("app '{}': command cannot be empty", app.name));
            }

            if app.hostname.is_empty() {
                app.hostname = format!("{}.localhost", app.name.to_lowercase());
            }
            let hostname_key = app.hostname.to_lowercase();
            if let Some(other) = hostnames.insert(hostname_key, app.name.clone()) {
                errors.push(format!(
                    "hostname '{}' is used by both '{}' and '{}'",
                    app.hostname, other, app.name
                ));
            }

            if app.port == 0 {
                while used_ports.contains(&next_auto_port) {
                    next_auto_port += 1;
                }
                app.port = next_auto_port;
                used_ports.insert(app.port);
            }
            if let Some(other) = ports.insert(app.port, app.name.clone()) {
                errors.push(format!(
                    "port {} is used by both '{}' and '{}'",
                    app.port, other, app.name
                ));
            }

            if app.health_check.enabled {
                if app.health_check.interval_secs == 0 {
                    errors.push(format!(
                        "app '{}': health_check.interval_secs must be positive",
                        app.name
                    ));
                }
                if app.health_check.timeout_secs == 0 {
                    errors.push(format!(
                        "app '{}': health_check.timeout_secs must be positive",
                        app.name
                    ));
                }
                if app.health_check.retries == 0 {
                    errors.push(format!(
                        "app '{}': health_check.retries must be at least 1",
                        app.name
                    ));
                }
            }

            // Materialize $PORT so the process layer never sees placeholders
            let port_str = app.port.to_string();
            for arg in &mut app.args {
                if arg.contains("$PORT") {
                    *arg = arg.replace("$PORT", &port_str);
                }
            }
            for value in app.env.values_mut() {
                if value.contains("$PORT") {
                    *value = value.replace("$PORT", &port_str);
                }
            }
        }

        if self.auto_cert_enabled() && self.acme_email().is_none() {
            errors.push("tls: email is required when auto_cert is enabled".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// Whether any app (or the global config) wants ACME certificates
    pub fn auto_cert_enabled(&self) -> bool {
        if self.tls.enabled && self.tls.auto_cert {
            return true;
        }
        self.apps
            .iter()
            .any(|a| a.tls_enabled(&self.tls) && a.tls.auto_cert.unwrap_or(self.tls.auto_cert))
    }

    /// Whether the HTTPS listener should run at all
    pub fn tls_enabled(&self) -> bool {
        self.tls.enabled || self.apps.iter().any(|a| a.tls.enabled == Some(true))
    }

    /// First email configured at either scope
    pub fn acme_email(&self) -> Option<&str> {
        if let Some(email) = self.tls.email.as_deref() {
            return Some(email);
        }
        self.apps.iter().find_map(|a| a.tls.email.as_deref())
    }

    /// Domains eligible for certificate acquisition: configured domains
    /// plus every app hostname.
    pub fn cert_domains(&self) -> Vec<String> {
        let mut domains = self.tls.domains.clone();
        for app in &self.apps {
            if !domains.contains(&app.hostname) {
                domains.push(app.hostname.clone());
            }
        }
        domains
    }

    /// Find the app serving the given hostname (case-insensitive exact match)
    pub fn app_for_hostname(&self, hostname: &str) -> Option<&AppSpec> {
        self.apps
            .iter()
            .find(|a| a.hostname.eq_ignore_ascii_case(hostname))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app(name: &str, port: u16) -> AppSpec {
        AppSpec {
            name: name.to_string(),
            hostname: String::new(),
            port,
            command: "sleep".to_string(),
            args: vec!["60".to_string()],
            working_dir: None,
            env: HashMap::new(),
            health_check: HealthCheckConfig::default(),
            restart_policy: RestartPolicy::default(),
            tls: AppTlsConfig::default(),
        }
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
http_port = 8080
https_port = 8443
enable_tracking = true

[tls]
enabled = false

[[apps]]
name = "web"
hostname = "web.localhost"
port = 3001
command = "node"
args = ["server.js"]

[[apps]]
name = "api"
port = 3002
command = "python"
args = ["-m", "uvicorn", "main:app"]
"#;
        let mut config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.server.http_port, 8080);
        assert_eq!(config.server.management_port(), 9080);
        assert!(config.server.enable_tracking);
        assert_eq!(config.server.tracking_header, DEFAULT_TRACKING_HEADER);
        assert_eq!(config.apps.len(), 2);
        assert_eq!(config.apps[1].hostname, "api.localhost");
    }

    #[test]
    fn test_hostname_auto_generated() {
        let mut config = Config {
            server: ServerConfig::default(),
            tls: TlsConfig::default(),
            apps: vec![app("Web", 3001)],
        };
        config.validate().unwrap();
        assert_eq!(config.apps[0].hostname, "web.localhost");
    }

    #[test]
    fn test_port_auto_assigned() {
        let mut config = Config {
            server: ServerConfig::default(),
            tls: TlsConfig::default(),
            apps: vec![app("a", 3000), app("b", 0), app("c", 0)],
        };
        config.validate().unwrap();
        assert_eq!(config.apps[1].port, 3001);
        assert_eq!(config.apps[2].port, 3002);
    }

    #[test]
    fn test_duplicate_hostname_rejected() {
        let mut a = app("one", 3001);
        let mut b = app("two", 3002);
        a.hostname = "same.localhost".to_string();
        b.hostname = "SAME.localhost".to_string();

        let mut config = Config {
            server: ServerConfig::default(),
            tls: TlsConfig::default(),
            apps: vec![a, b],
        };
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("hostname"), "unexpected error: {err}");
    }

    #[test]
    fn test_duplicate_port_rejected() {
        let mut config = Config {
            server: ServerConfig::default(),
            tls: TlsConfig::default(),
            apps: vec![app("one", 3001), app("two", 3001)],
        };
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("port 3001"), "unexpected error: {err}");
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut config = Config {
            server: ServerConfig::default(),
            tls: TlsConfig::default(),
            apps: vec![app("one", 3001), app("one", 3002)],
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_port_substitution() {
        let mut a = app("web", 3005);
        a.args = vec!["--port".to_string(), "$PORT".to_string()];
        a.env.insert("PORT".to_string(), "$PORT".to_string());
        a.env
            .insert("URL".to_string(), "http://localhost:$PORT/".to_string());

        let mut config = Config {
            server: ServerConfig::default(),
            tls: TlsConfig::default(),
            apps: vec![a],
        };
        config.validate().unwrap();

        assert_eq!(config.apps[0].args[1], "3005");
        assert_eq!(config.apps[0].env["PORT"], "3005");
        assert_eq!(config.apps[0].env["URL"], "http://localhost:3005/");
    }

    #[test]
    fn test_auto_cert_requires_email() {
        let mut config = Config {
            server: ServerConfig::default(),
            tls: TlsConfig {
                enabled: true,
                auto_cert: true,
                ..TlsConfig::default()
            },
            apps: vec![app("web", 3001)],
        };
        assert!(config.validate().is_err());

        config.tls.email = Some("ops@example.com".to_string());
        config.validate().unwrap();
    }

    #[test]
    fn test_zero_health_interval_rejected() {
        let mut a = app("web", 3001);
        a.health_check.interval_secs = 0;

        let mut config = Config {
            server: ServerConfig::default(),
            tls: TlsConfig::default(),
            apps: vec![a],
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serialization_round_trip() {
        let mut config = Config {
            server: ServerConfig {
                http_port: 8080,
                https_port: 8443,
                enable_tracking: true,
                ..ServerConfig::default()
            },
            tls: TlsConfig {
                enabled: true,
                auto_cert: true,
                email: Some("ops@example.com".to_string()),
                domains: vec!["example.com".to_string()],
                ..TlsConfig::default()
            },
            apps: vec![app("web", 3001)],
        };
        config.validate().unwrap();

        let serialized = toml::to_string(&config).unwrap();
        let mut reparsed: Config = toml::from_str(&serialized).unwrap();
        reparsed.validate().unwrap();

        assert_eq!(reparsed.server.http_port, config.server.http_port);
        assert_eq!(reparsed.tls.email, config.tls.email);
        assert_eq!(reparsed.apps.len(), 1);
        assert_eq!(reparsed.apps[0].hostname, config.apps[0].hostname);
        assert_eq!(reparsed.apps[0].port, config.apps[0].port);
        assert_eq!(
            reparsed.apps[0].health_check.retries,
            config.apps[0].health_check.retries
        );
    }

    #[test]
    fn test_cert_domains_include_app_hostnames() {
        let mut config = Config {
            server: ServerConfig::default(),
            tls: TlsConfig {
                domains: vec!["example.com".to_string()],
                ..TlsConfig::default()
            },
            apps: vec![app("web", 3001)],
        };
        config.validate().unwrap();

        let domains = config.cert_domains();
        assert!(domains.contains(&"example.com".to_string()));
        assert!(domains.contains(&"web.localhost".to_string()));
    }

    #[test]
    fn test_app_for_hostname_case_insensitive() {
        let mut config = Config {
            server: ServerConfig::default(),
            tls: TlsConfig::default(),
            apps: vec![app("web", 3001)],
        };
        config.validate().unwrap();

        assert!(config.app_for_hostname("WEB.LOCALHOST").is_some());
        assert!(config.app_for_hostname("other.localhost").is_none());
    }
}
