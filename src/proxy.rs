//! HTTP/HTTPS reverse proxy
//!
//! Routes inbound requests by Host header to the configured app, forwards
//! them to `127.0.0.1:{app.port}` through a pooled client, and rewrites the
//! forwarding headers on the way. The HTTPS listener resolves certificates
//! per SNI through the certificate manager; the HTTP listener serves ACME
//! HTTP-01 challenges and optionally redirects everything else to HTTPS.
//! Every request gets one Apache-combined access log line.

use crate::cert::{self, CertManager, Http01Challenges};
use crate::config::Config;
use crate::error::{text_response, ProxyError};
use crate::supervisor::Supervisor;
use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderValue};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Version};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use rustls::pki_types::CertificateDer;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const X_REAL_IP: &str = "x-real-ip";

/// State shared by both listeners and every connection
pub struct ProxyShared {
    config: Arc<Config>,
    supervisor: Arc<Supervisor>,
    cert_manager: Option<Arc<CertManager>>,
    challenges: Option<Http01Challenges>,
    client: Client<HttpConnector, Incoming>,
}

/// The public-facing reverse proxy
pub struct ProxyServer {
    shared: Arc<ProxyShared>,
    shutdown: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        config: Arc<Config>,
        supervisor: Arc<Supervisor>,
        cert_manager: Option<Arc<CertManager>>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build(connector);

        let challenges = cert_manager.as_ref().map(|m| m.challenges());

        Self {
            shared: Arc::new(ProxyShared {
                config,
                supervisor,
                cert_manager,
                challenges,
                client,
            }),
            shutdown,
        }
    }

    /// Serve plain HTTP: ACME challenges, optional HTTPS redirect, proxying
    pub async fn run_http(&self, addr: SocketAddr) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %addr, "HTTP listener started");

        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let shared = Arc::clone(&self.shared);
                            tokio::spawn(async move {
                                if let Err(e) = serve_plain_connection(stream, peer, shared).await {
                                    debug!(addr = %peer, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => error!(error = %e, "Failed to accept connection"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("HTTP listener shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Serve HTTPS with per-SNI certificate resolution
    pub async fn run_https(&self, addr: SocketAddr) -> anyhow::Result<()> {
        if self.shared.cert_manager.is_none() {
            anyhow::bail!("HTTPS listener requires a certificate manager");
        }

        let listener = TcpListener::bind(addr).await?;
        info!(addr = %addr, "HTTPS listener started");

        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let shared = Arc::clone(&self.shared);
                            tokio::spawn(async move {
                                if let Err(e) = serve_tls_connection(stream, peer, shared).await {
                                    debug!(addr = %peer, error = %e, "TLS connection error");
                                }
                            });
                        }
                        Err(e) => error!(error = %e, "Failed to accept connection"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("HTTPS listener shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_plain_connection(
    stream: TcpStream,
    peer: SocketAddr,
    shared: Arc<ProxyShared>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let shared = Arc::clone(&shared);
        async move { handle_request(req, shared, peer, false, None).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("connection error: {e}"))?;
    Ok(())
}

async fn serve_tls_connection(
    stream: TcpStream,
    peer: SocketAddr,
    shared: Arc<ProxyShared>,
) -> anyhow::Result<()> {
    let cert_manager = shared
        .cert_manager
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("TLS not configured"))?;

    // Suspend the handshake until the certificate for the SNI is resolved
    let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream);
    let start = acceptor.await?;

    let sni = {
        let hello = start.client_hello();
        hello
            .server_name()
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("client hello carries no server name"))?
    };

    let key = cert_manager.get_certificate(&sni).await?;
    let tls_config = cert::server_config_for(key);
    let tls_stream = start.into_stream(tls_config).await?;

    let client_cert = tls_stream
        .get_ref()
        .1
        .peer_certificates()
        .and_then(|certs| certs.first())
        .and_then(ClientCertInfo::from_der)
        .map(Arc::new);

    let io = TokioIo::new(tls_stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let shared = Arc::clone(&shared);
        let client_cert = client_cert.clone();
        async move { handle_request(req, shared, peer, true, client_cert).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("connection error: {e}"))?;
    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    shared: Arc<ProxyShared>,
    peer: SocketAddr,
    is_tls: bool,
    client_cert: Option<Arc<ClientCertInfo>>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let started = Instant::now();
    let config = &shared.config;

    if !is_tls {
        // ACME challenges are answered before any redirect
        if let Some(token) = req.uri().path().strip_prefix(ACME_CHALLENGE_PREFIX) {
            if let Some(challenges) = &shared.challenges {
                if let Some(key_auth) = challenges.get(token).await {
                    debug!(token, "Answering ACME HTTP-01 challenge");
                    return Ok(text_response(StatusCode::OK, key_auth));
                }
            }
            return Ok(text_response(StatusCode::NOT_FOUND, "not found"));
        }

        if config.tls.enabled && config.tls.force_https {
            return Ok(build_https_redirect(&req, config.server.https_port));
        }
    }

    let ip = client_ip(req.headers(), peer);
    let request_line = RequestLine::capture(&req);

    let Some(hostname) = request_host(&req) else {
        let response = ProxyError::DomainNotFound.response();
        warn!("Request carries no usable Host header");
        log_access(&ip, &request_line, response.status(), 0, "-", started.elapsed());
        return Ok(response);
    };

    let Some(app) = config.app_for_hostname(&hostname).cloned() else {
        let response = ProxyError::DomainNotFound.response();
        warn!(host = %hostname, "No application found for domain");
        log_access(&ip, &request_line, response.status(), 0, "-", started.elapsed());
        return Ok(response);
    };

    if !shared.supervisor.is_running(&app.name) {
        let response = ProxyError::ServiceUnavailable.response();
        error!(app = %app.name, "Target application is not running");
        log_access(&ip, &request_line, response.status(), 0, &app.name, started.elapsed());
        return Ok(response);
    }

    // Forwarding headers
    let original_host = req
        .headers()
        .get(hyper::header::HOST)
        .cloned()
        .or_else(|| {
            req.uri()
                .authority()
                .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
        });

    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&ip) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    headers.insert(
        X_FORWARDED_PROTO,
        HeaderValue::from_static(if is_tls { "https" } else { "http" }),
    );
    if let Some(host) = original_host {
        headers.insert(X_FORWARDED_HOST, host);
    }

    if config.server.enable_tracking {
        inject_tracking_header(headers, &config.server.tracking_header);
    }

    if app.certificate_headers(&config.tls) {
        inject_certificate_headers(headers, client_cert.as_deref());
    }

    // Round trip to the backend
    let backend_req = match build_backend_request(req, app.port) {
        Ok(r) => r,
        Err(e) => {
            error!(app = %app.name, error = %e, "Failed to build backend request");
            let response = ProxyError::BadGateway.response();
            log_access(&ip, &request_line, response.status(), 0, &app.name, started.elapsed());
            return Ok(response);
        }
    };

    match shared.client.request(backend_req).await {
        Ok(response) => {
            let status = response.status();
            let size = response
                .headers()
                .get(hyper::header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0);
            log_access(&ip, &request_line, status, size, &app.name, started.elapsed());

            let (parts, body) = response.into_parts();
            Ok(Response::from_parts(parts, body.boxed()))
        }
        Err(e) => {
            error!(app = %app.name, port = app.port, error = %e, "Proxy error");
            let response = ProxyError::BadGateway.response();
            log_access(&ip, &request_line, response.status(), 0, &app.name, started.elapsed());
            Ok(response)
        }
    }
}

/// Request details captured before the request is consumed, for the access log
struct RequestLine {
    method: String,
    uri: String,
    proto: &'static str,
    referer: String,
    user_agent: String,
}

impl RequestLine {
    fn capture<B>(req: &Request<B>) -> Self {
        let header = |name: hyper::header::HeaderName| {
            req.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
                .unwrap_or("-")
                .to_string()
        };
        Self {
            method: req.method().to_string(),
            uri: req
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| "/".to_string()),
            proto: proto_str(req.version()),
            referer: header(hyper::header::REFERER),
            user_agent: header(hyper::header::USER_AGENT),
        }
    }
}

/// One Apache-combined log line per request, level by status class
fn log_access(
    ip: &str,
    line: &RequestLine,
    status: StatusCode,
    size: u64,
    app: &str,
    duration: Duration,
) {
    let timestamp = chrono::Local::now().format("%d/%b/%Y:%H:%M:%S %z");
    let entry = format!(
        "{ip} - - [{timestamp}] \"{method} {uri} {proto}\" {status} {size} \"{referer}\" \"{ua}\" app={app} rt={rt}ms",
        method = line.method,
        uri = line.uri,
        proto = line.proto,
        status = status.as_u16(),
        referer = line.referer,
        ua = line.user_agent,
        rt = duration.as_millis(),
    );

    if status.is_server_error() {
        error!("{entry}");
    } else if status.is_client_error() {
        warn!("{entry}");
    } else {
        info!("{entry}");
    }
}

fn proto_str(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_11 => "HTTP/1.1",
        Version::HTTP_2 => "HTTP/2.0",
        Version::HTTP_3 => "HTTP/3.0",
        _ => "HTTP/1.1",
    }
}

/// Rebuild the request against the loopback backend, keeping method,
/// path+query, headers and body
fn build_backend_request(
    req: Request<Incoming>,
    port: u16,
) -> anyhow::Result<Request<Incoming>> {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri = format!("http://127.0.0.1:{port}{path_and_query}");

    let (parts, body) = req.into_parts();
    let mut builder = Request::builder().method(parts.method).uri(&uri);
    for (key, value) in parts.headers.iter() {
        builder = builder.header(key, value);
    }
    builder
        .body(body)
        .map_err(|e| anyhow::anyhow!("failed to build request: {e}"))
}

/// Hostname the request is addressed to: Host header (or :authority),
/// lowercased, port suffix stripped, validated
fn request_host<B>(req: &Request<B>) -> Option<String> {
    let raw = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))?;

    let hostname = match raw.rsplit_once(':') {
        Some((h, port))
            if !h.is_empty() && !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) =>
        {
            h
        }
        _ => raw.as_str(),
    };

    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }
    // Reject anything that could smuggle into logs or routing
    if !hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return None;
    }

    Some(hostname.to_lowercase())
}

/// Real client IP: first X-Forwarded-For hop, then X-Real-IP, then the
/// remote address minus its port
fn client_ip(headers: &HeaderMap, remote: SocketAddr) -> String {
    if let Some(xf) = headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        let first = xf.split(',').next().unwrap_or(xf).trim();
        if !first.is_empty() {
            return first.to_string();
        }
    }
    if let Some(xr) = headers.get(X_REAL_IP).and_then(|v| v.to_str().ok()) {
        let trimmed = xr.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    remote.ip().to_string()
}

/// Compose the outbound tracking chain: existing chain plus exactly one
/// fresh UUID, semicolon-separated
pub fn append_tracking(existing: Option<&str>, next: &str) -> String {
    match existing {
        Some(chain) if !chain.is_empty() => format!("{chain};{next}"),
        _ => next.to_string(),
    }
}

fn inject_tracking_header(headers: &mut HeaderMap, header_name: &str) {
    let hop = Uuid::new_v4().to_string();
    let existing = headers
        .get(header_name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let chain = append_tracking(existing.as_deref(), &hop);

    if let (Ok(name), Ok(value)) = (
        hyper::header::HeaderName::try_from(header_name),
        HeaderValue::from_str(&chain),
    ) {
        debug!(header = header_name, chain = %chain, "Tracking chain updated");
        headers.insert(name, value);
    }
}

/// Client certificate details extracted at handshake time
#[derive(Debug, Clone)]
pub struct ClientCertInfo {
    pub common_name: String,
    pub subject: String,
    pub issuer: String,
    pub serial: String,
    pub not_before: String,
    pub not_after: String,
    pub expired: bool,
}

impl ClientCertInfo {
    pub fn from_der(der: &CertificateDer<'_>) -> Option<Self> {
        use x509_parser::prelude::*;

        let (_, cert) = X509Certificate::from_der(der.as_ref()).ok()?;
        let validity = cert.validity();
        let not_after_ts = validity.not_after.timestamp();
        let expired = chrono::Utc::now().timestamp() > not_after_ts;

        Some(Self {
            common_name: format_dn(cert.subject()),
            subject: cert.subject().to_string(),
            issuer: cert.issuer().to_string(),
            serial: cert.tbs_certificate.serial.to_string(),
            not_before: format_cert_time(validity.not_before.timestamp()),
            not_after: format_cert_time(not_after_ts),
            expired,
        })
    }
}

fn format_cert_time(timestamp: i64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp(timestamp, 0)
        .map(|t| t.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_default()
}

/// DN-formatted subject components (CN, O, OU, C, ST, L) joined by ", "
fn format_dn(name: &x509_parser::x509::X509Name<'_>) -> String {
    let mut parts = Vec::new();
    if let Some(cn) = name.iter_common_name().next().and_then(|a| a.as_str().ok()) {
        parts.push(format!("CN={cn}"));
    }
    for org in name.iter_organization().filter_map(|a| a.as_str().ok()) {
        parts.push(format!("O={org}"));
    }
    for unit in name
        .iter_organizational_unit()
        .filter_map(|a| a.as_str().ok())
    {
        parts.push(format!("OU={unit}"));
    }
    if let Some(country) = name.iter_country().next().and_then(|a| a.as_str().ok()) {
        parts.push(format!("C={country}"));
    }
    if let Some(state) = name.iter_state_or_province().next().and_then(|a| a.as_str().ok()) {
        parts.push(format!("ST={state}"));
    }
    if let Some(locality) = name.iter_locality().next().and_then(|a| a.as_str().ok()) {
        parts.push(format!("L={locality}"));
    }
    parts.join(", ")
}

fn inject_certificate_headers(headers: &mut HeaderMap, cert: Option<&ClientCertInfo>) {
    let Some(cert) = cert else {
        headers.insert("x-certificate-detected", HeaderValue::from_static("off"));
        return;
    };

    headers.insert("x-certificate-detected", HeaderValue::from_static("on"));
    let mut set = |name: &'static str, value: &str| {
        if let Ok(value) = HeaderValue::from_str(value) {
            headers.insert(name, value);
        }
    };
    set("x-certificate-cn", &cert.common_name);
    set("x-certificate-subject", &cert.subject);
    set("x-certificate-issuer", &cert.issuer);
    set("x-certificate-serial", &cert.serial);
    set("x-certificate-not-before", &cert.not_before);
    set("x-certificate-not-after", &cert.not_after);
    set(
        "x-certificate-status",
        if cert.expired { "expired" } else { "valid" },
    );
}

/// 301 to the HTTPS origin, substituting the port when it is not 443
fn build_https_redirect(
    req: &Request<Incoming>,
    https_port: u16,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let host = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(|h| h.split(':').next().unwrap_or(h))
        .unwrap_or("localhost");

    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let location = if https_port == 443 {
        format!("https://{host}{path}")
    } else {
        format!("https://{host}:{https_port}{path}")
    };

    Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header(hyper::header::LOCATION, location)
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(
            http_body_util::Full::new(Bytes::from("Redirecting to HTTPS"))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response builder")
}
