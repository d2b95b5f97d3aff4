use guvnor::cert::{CertManager, CertManagerConfig};
use guvnor::config::Config;
use guvnor::server::Server;
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::{error, info};

const DEFAULT_CONFIG: &str = "guvnor.toml";

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let result = match args.first().map(String::as_str) {
        Some("validate") => run_validate(args.get(1).map(String::as_str)),
        Some("cert") => run_cert(args.get(1).map(String::as_str), args.get(2).map(String::as_str)).await,
        Some("--help") | Some("-h") | Some("help") => {
            print_usage();
            Ok(())
        }
        Some(path) => run_server(path).await,
        None => run_server(DEFAULT_CONFIG).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn print_usage() {
    println!(
        "guvnor - process supervisor with reverse proxy and automatic TLS

Usage:
  guvnor [config.toml]              Run the supervisor
  guvnor validate [config.toml]     Validate the configuration
  guvnor cert info [config.toml]    Show cached certificates
  guvnor cert renew [config.toml]   Renew certificates close to expiry
  guvnor cert cleanup [config.toml] Remove expired certificates"
    );
}

fn init_tracing(log_level: &str) {
    let directive = format!("guvnor={log_level}")
        .parse()
        .unwrap_or_else(|_| "guvnor=info".parse().expect("valid log directive"));
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(directive))
        .init();
}

async fn run_server(config_path: &str) -> anyhow::Result<()> {
    let config = Config::load(PathBuf::from(config_path))
        .map_err(|e| anyhow::anyhow!("failed to load configuration from {config_path}: {e}"))?;

    init_tracing(&config.server.log_level);
    info!(path = config_path, "Configuration loaded");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = Server::new(config, shutdown_rx)?;

    let mut server_handle = tokio::spawn(server.run());

    tokio::select! {
        _ = wait_for_signal() => {
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
            match server_handle.await {
                Ok(result) => result?,
                Err(e) => error!(error = %e, "Server task failed"),
            }
        }
        result = &mut server_handle => {
            // Server finished on its own (startup failure or internal stop)
            match result {
                Ok(inner) => inner?,
                Err(e) => anyhow::bail!("server task failed: {e}"),
            }
        }
    }

    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Received Ctrl+C");
}

fn run_validate(config_path: Option<&str>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or(DEFAULT_CONFIG);
    match Config::load(PathBuf::from(path)) {
        Ok(config) => {
            println!("Configuration valid: {} app(s)", config.apps.len());
            for app in &config.apps {
                println!("  {} -> {} (port {})", app.name, app.hostname, app.port);
            }
            Ok(())
        }
        Err(e) => Err(anyhow::anyhow!("configuration invalid: {e:#}")),
    }
}

async fn run_cert(action: Option<&str>, config_path: Option<&str>) -> anyhow::Result<()> {
    let action = action.ok_or_else(|| {
        anyhow::anyhow!("cert subcommand required: info, renew or cleanup")
    })?;

    let path = config_path.unwrap_or(DEFAULT_CONFIG);
    let config = Config::load(PathBuf::from(path))?;
    init_tracing(&config.server.log_level);

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

    match action {
        "info" => {
            let certs = manager.certificates()?;
            if certs.is_empty() {
                println!("No certificates in {}", config.tls.cert_dir);
                return Ok(());
            }
            for cert in certs {
                println!(
                    "{}: not_before={} not_after={}{}",
                    cert.host,
                    cert.not_before.format("%Y-%m-%d"),
                    cert.not_after.format("%Y-%m-%d"),
                    if cert.expired { " (EXPIRED)" } else { "" }
                );
            }
            Ok(())
        }
        "renew" => {
            manager.renew_all().await;
            Ok(())
        }
        "cleanup" => {
            let removed = manager.cleanup()?;
            println!("Removed {removed} expired certificate(s)");
            Ok(())
        }
        other => Err(anyhow::anyhow!("unknown cert subcommand '{other}'")),
    }
}
