//! ACME certificate management
//!
//! Acquires and renews certificates for a whitelist of hostnames, keeping
//! one PEM pair per host in the cache directory. Concurrent handshakes for
//! the same host coalesce onto a single ACME order. HTTP-01 challenge
//! responses are served by the proxy's HTTP listener from the shared
//! challenge store.
//!
//! # Key storage
//!
//! Account credentials and private keys live unencrypted in the cache
//! directory; keys are written with mode 0600 on Unix. Restrict the
//! directory to the service user.

use chrono::{DateTime, TimeZone, Utc};
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt,
    NewAccount, NewOrder, OrderStatus,
};
use parking_lot::RwLock;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};
use rustls::client::danger::HandshakeSignatureValid;
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::ResolvesServerCert;
use rustls::sign::CertifiedKey;
use rustls::{DigitallySignedStruct, SignatureScheme};
use serde::Serialize;
use std::collections::HashMap;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Certificates within this many days of expiry are re-acquired
pub const RENEWAL_WINDOW_DAYS: i64 = 30;

/// ACME polling cadence and attempt cap
const POLL_INTERVAL: Duration = Duration::from_secs(2);
const POLL_ATTEMPTS: u32 = 30;

/// Certificate manager configuration (derived from the TLS config)
#[derive(Debug, Clone)]
pub struct CertManagerConfig {
    pub email: String,
    pub cert_dir: PathBuf,
    pub staging: bool,
    /// Hostnames eligible for acquisition; `*.example.com` entries match
    /// the base domain and any single-or-deeper subdomain
    pub domains: Vec<String>,
}

/// Metadata for one cached certificate
#[derive(Debug, Clone, Serialize)]
pub struct CertInfo {
    pub host: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub expired: bool,
    pub path: PathBuf,
}

/// Pending HTTP-01 challenges, shared with the HTTP listener
#[derive(Clone, Default)]
pub struct Http01Challenges {
    inner: Arc<tokio::sync::RwLock<HashMap<String, String>>>,
}

impl Http01Challenges {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, token: String, key_authorization: String) {
        self.inner.write().await.insert(token, key_authorization);
    }

    pub async fn get(&self, token: &str) -> Option<String> {
        self.inner.read().await.get(token).cloned()
    }

    pub async fn remove(&self, token: &str) {
        self.inner.write().await.remove(token);
    }
}

struct CachedCert {
    key: Arc<CertifiedKey>,
    not_after: DateTime<Utc>,
}

/// Acquires, caches and renews certificates for whitelisted hosts
pub struct CertManager {
    config: CertManagerConfig,
    account: tokio::sync::OnceCell<Account>,
    cache: RwLock<HashMap<String, CachedCert>>,
    in_flight: RwLock<HashMap<String, Arc<Mutex<()>>>>,
    challenges: Http01Challenges,
}

impl CertManager {
    pub fn new(config: CertManagerConfig) -> anyhow::Result<Arc<Self>> {
        if config.email.is_empty() {
            anyhow::bail!("certificate manager requires a contact email");
        }
        Self::build(config)
    }

    /// Manager without an ACME account: serves installed certificates only,
    /// cache misses fail instead of ordering
    pub fn new_static(cert_dir: PathBuf, domains: Vec<String>) -> anyhow::Result<Arc<Self>> {
        Self::build(CertManagerConfig {
            email: String::new(),
            cert_dir,
            staging: false,
            domains,
        })
    }

    fn build(config: CertManagerConfig) -> anyhow::Result<Arc<Self>> {
        if config.domains.is_empty() {
            anyhow::bail!("certificate manager requires at least one domain");
        }
        std::fs::create_dir_all(&config.cert_dir)?;

        info!(
            domains = ?config.domains,
            cert_dir = %config.cert_dir.display(),
            staging = config.staging,
            "Certificate manager configured"
        );

        Ok(Arc::new(Self {
            config,
            account: tokio::sync::OnceCell::new(),
            cache: RwLock::new(HashMap::new()),
            in_flight: RwLock::new(HashMap::new()),
            challenges: Http01Challenges::new(),
        }))
    }

    pub fn challenges(&self) -> Http01Challenges {
        self.challenges.clone()
    }

    /// Accept an SNI host iff it matches a configured domain exactly or via
    /// a `*.domain` entry. A trailing `:port` suffix is stripped first.
    pub fn authorize_host(&self, server_name: &str) -> anyhow::Result<String> {
        let host = strip_port(server_name).to_lowercase();
        if host.is_empty() {
            anyhow::bail!("empty server name");
        }

        for domain in &self.config.domains {
            let domain = domain.to_lowercase();
            if host == domain {
                return Ok(host);
            }
            if let Some(base) = domain.strip_prefix("*.") {
                if host == base || host.ends_with(&format!(".{base}")) {
                    return Ok(host);
                }
            }
        }

        warn!(host = %host, "Certificate request denied, host not in whitelist");
        anyhow::bail!("host '{host}' is not authorized for certificates")
    }

    /// Return a certificate for the SNI host, ordering one if the cache has
    /// nothing fresh. Exactly one order is in flight per host; concurrent
    /// callers wait and then reuse the winner's result.
    pub async fn get_certificate(&self, server_name: &str) -> anyhow::Result<Arc<CertifiedKey>> {
        let host = self.authorize_host(server_name)?;

        if let Some(key) = self.cached_if_fresh(&host) {
            return Ok(key);
        }

        let gate = {
            let mut in_flight = self.in_flight.write();
            Arc::clone(
                in_flight
                    .entry(host.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        let _guard = gate.lock().await;

        // A concurrent caller may have finished the order while we waited
        if let Some(key) = self.cached_if_fresh(&host) {
            return Ok(key);
        }

        // Disk cache survives restarts
        match self.load_from_disk(&host) {
            Ok(Some(cached)) => {
                let fresh = !within_renewal_window(cached.not_after);
                let key = Arc::clone(&cached.key);
                let not_after = cached.not_after;
                self.cache.write().insert(host.clone(), cached);
                if fresh {
                    info!(host = %host, "Loaded cached certificate");
                    return Ok(key);
                }
                debug!(host = %host, %not_after, "Cached certificate inside renewal window");
            }
            Ok(None) => {}
            Err(e) => warn!(host = %host, error = %e, "Failed to load cached certificate"),
        }

        match self.order_certificate(&host).await {
            Ok(cached) => {
                let key = Arc::clone(&cached.key);
                self.cache.write().insert(host.clone(), cached);
                Ok(key)
            }
            Err(e) => {
                // An unexpired cached certificate still beats a failed order
                let fallback = {
                    let cache = self.cache.read();
                    cache
                        .get(&host)
                        .filter(|c| c.not_after > Utc::now())
                        .map(|c| Arc::clone(&c.key))
                };
                if let Some(key) = fallback {
                    warn!(host = %host, error = %e, "Renewal failed, serving cached certificate");
                    return Ok(key);
                }
                error!(host = %host, error = %e, "Failed to obtain certificate");
                Err(e)
            }
        }
    }

    fn cached_if_fresh(&self, host: &str) -> Option<Arc<CertifiedKey>> {
        let cache = self.cache.read();
        cache
            .get(host)
            .filter(|c| !within_renewal_window(c.not_after))
            .map(|c| Arc::clone(&c.key))
    }

    /// Install a certificate loaded from operator-provided PEM files
    pub fn insert_static(&self, host: &str, cert_file: &str, key_file: &str) -> anyhow::Result<()> {
        let certs = load_pem_certs(Path::new(cert_file))?;
        let key = load_pem_key(Path::new(key_file))?;
        let not_after = chain_not_after(&certs)?;
        let key = certified_key(certs, key)?;
        self.cache.write().insert(
            strip_port(host).to_lowercase(),
            CachedCert {
                key: Arc::new(key),
                not_after,
            },
        );
        info!(host = %host, cert = %cert_file, "Installed certificate from file");
        Ok(())
    }

    /// Install a freshly generated self-signed certificate for the hosts
    /// (local development fallback, not for production)
    pub fn insert_self_signed(&self, hosts: &[String]) -> anyhow::Result<()> {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(hosts.to_vec())
                .map_err(|e| anyhow::anyhow!("failed to generate self-signed certificate: {e}"))?;

        let cert_der = CertificateDer::from(cert.der().to_vec());
        let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
            .map_err(|e| anyhow::anyhow!("failed to serialize private key: {e}"))?;
        let not_after = chain_not_after(std::slice::from_ref(&cert_der))?;
        let key = Arc::new(certified_key(vec![cert_der], key_der)?);

        let mut cache = self.cache.write();
        for host in hosts {
            cache.insert(
                host.to_lowercase(),
                CachedCert {
                    key: Arc::clone(&key),
                    not_after,
                },
            );
        }
        Ok(())
    }

    /// Metadata for every cached certificate on disk
    pub fn certificates(&self) -> anyhow::Result<Vec<CertInfo>> {
        let mut infos = Vec::new();
        for entry in std::fs::read_dir(&self.config.cert_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("crt") {
                continue;
            }
            let Some(host) = path.file_stem().and_then(|s| s.to_str()).map(String::from) else {
                continue;
            };

            let certs = load_pem_certs(&path)?;
            let (not_before, not_after) = chain_validity(&certs)?;
            infos.push(CertInfo {
                host,
                not_before,
                not_after,
                expired: not_after < Utc::now(),
                path,
            });
        }
        infos.sort_by(|a, b| a.host.cmp(&b.host));
        Ok(infos)
    }

    /// Re-acquire every certificate within the renewal window.
    /// Failures are logged and do not affect other hosts.
    pub async fn renew_all(&self) {
        info!("Starting certificate renewal check");

        let certs = match self.certificates() {
            Ok(certs) => certs,
            Err(e) => {
                error!(error = %e, "Failed to scan certificate directory");
                return;
            }
        };

        for cert in certs {
            if !within_renewal_window(cert.not_after) {
                continue;
            }
            info!(host = %cert.host, not_after = %cert.not_after, "Certificate needs renewal");
            match self.get_certificate(&cert.host).await {
                Ok(_) => info!(host = %cert.host, "Certificate renewed"),
                Err(e) => error!(host = %cert.host, error = %e, "Certificate renewal failed"),
            }
        }
    }

    /// Remove expired certificate material from the cache directory.
    /// Returns the number of certificates removed.
    pub fn cleanup(&self) -> anyhow::Result<usize> {
        let mut removed = 0;
        for cert in self.certificates()? {
            if !cert.expired {
                continue;
            }
            info!(host = %cert.host, "Removing expired certificate");
            if let Err(e) = std::fs::remove_file(&cert.path) {
                warn!(path = %cert.path.display(), error = %e, "Failed to remove certificate");
                continue;
            }
            let _ = std::fs::remove_file(cert.path.with_extension("key"));
            self.cache.write().remove(&cert.host);
            removed += 1;
        }
        info!(removed, "Certificate cleanup complete");
        Ok(removed)
    }

    /// Renewal loop: check every 12 hours until shutdown
    pub async fn run_renewal_loop(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let interval = Duration::from_secs(12 * 60 * 60);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.renew_all().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Certificate renewal loop shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// Load or create the ACME account
    async fn account(&self) -> anyhow::Result<&Account> {
        self.account
            .get_or_try_init(|| async {
                let account_path = self.config.cert_dir.join("account.json");

                if account_path.exists() {
                    debug!(path = %account_path.display(), "Loading existing ACME account");
                    let data = std::fs::read_to_string(&account_path)?;
                    let credentials: AccountCredentials = serde_json::from_str(&data)?;
                    return Ok(Account::from_credentials(credentials).await?);
                }

                let directory_url = self.directory_url();
                info!(directory = directory_url, "Creating new ACME account");

                let (account, credentials) = Account::create(
                    &NewAccount {
                        contact: &[&format!("mailto:{}", self.config.email)],
                        terms_of_service_agreed: true,
                        only_return_existing: false,
                    },
                    directory_url,
                    None,
                )
                .await?;

                let data = serde_json::to_string_pretty(&credentials)?;
                std::fs::write(&account_path, data)?;
                info!(path = %account_path.display(), "ACME account credentials saved");

                Ok(account)
            })
            .await
    }

    fn directory_url(&self) -> &'static str {
        if self.config.staging {
            LetsEncrypt::Staging.url()
        } else {
            LetsEncrypt::Production.url()
        }
    }

    /// Order one certificate for the host via HTTP-01
    async fn order_certificate(&self, host: &str) -> anyhow::Result<CachedCert> {
        if self.config.email.is_empty() {
            anyhow::bail!("no ACME contact email configured, cannot order certificate for {host}");
        }
        let account = self.account().await?;

        info!(host = %host, "Requesting new certificate");

        let identifier = Identifier::Dns(host.to_string());
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &[identifier],
            })
            .await?;

        let authorizations = order.authorizations().await?;
        for authz in authorizations {
            if authz.status == AuthorizationStatus::Valid {
                continue;
            }

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| anyhow::anyhow!("HTTP-01 challenge not offered for {host}"))?;

            let key_auth = order.key_authorization(challenge);
            debug!(host = %host, token = %challenge.token, "Publishing HTTP-01 challenge");
            self.challenges
                .set(challenge.token.clone(), key_auth.as_str().to_string())
                .await;

            order.set_challenge_ready(&challenge.url).await?;

            let result = self.await_authorization(&mut order, host).await;
            self.challenges.remove(&challenge.token).await;
            result?;
        }

        // Wait for the order to become ready for finalization
        let mut attempts = 0;
        loop {
            match order.state().status {
                OrderStatus::Ready | OrderStatus::Valid => break,
                OrderStatus::Invalid => anyhow::bail!("order invalid for {host}"),
                OrderStatus::Pending | OrderStatus::Processing => {
                    attempts += 1;
                    if attempts > POLL_ATTEMPTS {
                        anyhow::bail!("order timeout for {host}");
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                    order.refresh().await?;
                }
            }
        }

        // Finalize with a fresh key and CSR
        let mut params = CertificateParams::new(vec![host.to_string()])?;
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, host.to_string());

        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let csr = params.serialize_request(&key_pair)?;
        order.finalize(csr.der()).await?;

        let mut attempts = 0;
        let cert_chain_pem: String = loop {
            order.refresh().await?;
            match order.state().status {
                OrderStatus::Valid => {
                    if let Some(cert) = order.certificate().await? {
                        break cert;
                    }
                    anyhow::bail!("order valid but no certificate returned for {host}");
                }
                OrderStatus::Processing => {
                    attempts += 1;
                    if attempts > POLL_ATTEMPTS {
                        anyhow::bail!("certificate timeout for {host}");
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                status => anyhow::bail!("unexpected order status {status:?} for {host}"),
            }
        };

        let key_pem = key_pair.serialize_pem();
        self.save_cert(host, &cert_chain_pem, &key_pem)?;

        let certs: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut BufReader::new(cert_chain_pem.as_bytes()))
                .collect::<Result<Vec<_>, _>>()?;
        let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
            .map_err(|e| anyhow::anyhow!("failed to parse private key: {e}"))?;

        let not_after = chain_not_after(&certs)?;
        let key = certified_key(certs, key_der)?;

        info!(host = %host, %not_after, "Certificate obtained");

        Ok(CachedCert {
            key: Arc::new(key),
            not_after,
        })
    }

    async fn await_authorization(
        &self,
        order: &mut instant_acme::Order,
        host: &str,
    ) -> anyhow::Result<()> {
        let mut attempts = 0;
        loop {
            tokio::time::sleep(POLL_INTERVAL).await;
            order.refresh().await?;

            let authorizations = order.authorizations().await?;
            let status = authorizations
                .iter()
                .find(|a| matches!(&a.identifier, Identifier::Dns(d) if d == host))
                .map(|a| a.status);

            match status {
                Some(AuthorizationStatus::Valid) => {
                    info!(host = %host, "Authorization valid");
                    return Ok(());
                }
                Some(AuthorizationStatus::Invalid) => {
                    anyhow::bail!("authorization failed for {host}");
                }
                Some(AuthorizationStatus::Pending) => {
                    attempts += 1;
                    if attempts > POLL_ATTEMPTS {
                        anyhow::bail!("authorization timeout for {host}");
                    }
                    debug!(host = %host, attempt = attempts, "Waiting for authorization");
                }
                Some(status) => {
                    debug!(host = %host, status = ?status, "Authorization status");
                }
                None => anyhow::bail!("authorization not found for {host}"),
            }
        }
    }

    fn cert_path(&self, host: &str) -> PathBuf {
        self.config.cert_dir.join(format!("{host}.crt"))
    }

    fn key_path(&self, host: &str) -> PathBuf {
        self.config.cert_dir.join(format!("{host}.key"))
    }

    fn load_from_disk(&self, host: &str) -> anyhow::Result<Option<CachedCert>> {
        let cert_path = self.cert_path(host);
        let key_path = self.key_path(host);
        if !cert_path.exists() || !key_path.exists() {
            return Ok(None);
        }

        let certs = load_pem_certs(&cert_path)?;
        let key = load_pem_key(&key_path)?;
        let not_after = chain_not_after(&certs)?;
        let key = certified_key(certs, key)?;

        Ok(Some(CachedCert {
            key: Arc::new(key),
            not_after,
        }))
    }

    /// Persist one PEM pair; the key is written with mode 0600
    fn save_cert(&self, host: &str, cert_pem: &str, key_pem: &str) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.config.cert_dir)?;
        std::fs::write(self.cert_path(host), cert_pem)?;

        let key_path = self.key_path(host);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&key_path)?;
            std::io::Write::write_all(&mut file, key_pem.as_bytes())?;
        }
        #[cfg(not(unix))]
        {
            std::fs::write(&key_path, key_pem)?;
        }

        info!(host = %host, path = %self.cert_path(host).display(), "Certificate saved");
        Ok(())
    }
}

/// Resolver used for a single already-selected certificate
struct SingleCertResolver(Arc<CertifiedKey>);

impl std::fmt::Debug for SingleCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleCertResolver").finish_non_exhaustive()
    }
}

impl ResolvesServerCert for SingleCertResolver {
    fn resolve(
        &self,
        _client_hello: rustls::server::ClientHello<'_>,
    ) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }
}

/// Verifier that requests an optional client certificate and accepts
/// whatever the client presents. The proxy forwards certificate details to
/// backends as headers; it makes no trust decision itself.
struct AnyClientCertVerifier {
    algorithms: WebPkiSupportedAlgorithms,
}

impl AnyClientCertVerifier {
    fn new() -> Self {
        Self {
            algorithms: rustls::crypto::ring::default_provider().signature_verification_algorithms,
        }
    }
}

impl std::fmt::Debug for AnyClientCertVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnyClientCertVerifier").finish_non_exhaustive()
    }
}

impl ClientCertVerifier for AnyClientCertVerifier {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Build a per-connection rustls config serving the given certificate,
/// with ALPN h2 + http/1.1. The handshake requests an optional client
/// certificate so a presented one reaches the certificate headers.
pub fn server_config_for(key: Arc<CertifiedKey>) -> Arc<rustls::ServerConfig> {
    let mut config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(Arc::new(AnyClientCertVerifier::new()))
        .with_cert_resolver(Arc::new(SingleCertResolver(key)));
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Arc::new(config)
}

fn certified_key(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> anyhow::Result<CertifiedKey> {
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| anyhow::anyhow!("failed to create signing key: {e}"))?;
    Ok(CertifiedKey::new(certs, signing_key))
}

fn load_pem_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let data = std::fs::read(path)?;
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut BufReader::new(&data[..])).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        anyhow::bail!("no certificates found in {}", path.display());
    }
    Ok(certs)
}

fn load_pem_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let data = std::fs::read(path)?;
    let mut reader = BufReader::new(&data[..]);
    loop {
        match rustls_pemfile::read_one(&mut reader)? {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            Some(_) => continue,
            None => anyhow::bail!("no private key found in {}", path.display()),
        }
    }
}

fn chain_validity(
    certs: &[CertificateDer<'_>],
) -> anyhow::Result<(DateTime<Utc>, DateTime<Utc>)> {
    use x509_parser::prelude::*;

    let first = certs
        .first()
        .ok_or_else(|| anyhow::anyhow!("empty certificate chain"))?;
    let (_, parsed) = X509Certificate::from_der(first.as_ref())
        .map_err(|e| anyhow::anyhow!("failed to parse certificate: {e}"))?;

    let not_before = Utc
        .timestamp_opt(parsed.validity().not_before.timestamp(), 0)
        .single()
        .ok_or_else(|| anyhow::anyhow!("certificate not_before out of range"))?;
    let not_after = Utc
        .timestamp_opt(parsed.validity().not_after.timestamp(), 0)
        .single()
        .ok_or_else(|| anyhow::anyhow!("certificate not_after out of range"))?;

    Ok((not_before, not_after))
}

fn chain_not_after(certs: &[CertificateDer<'_>]) -> anyhow::Result<DateTime<Utc>> {
    Ok(chain_validity(certs)?.1)
}

fn within_renewal_window(not_after: DateTime<Utc>) -> bool {
    not_after - Utc::now() < chrono::Duration::days(RENEWAL_WINDOW_DAYS)
}

fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((h, port))
            if !h.is_empty() && !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) =>
        {
            h
        }
        _ => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(dir: &Path, domains: &[&str]) -> Arc<CertManager> {
        CertManager::new(CertManagerConfig {
            email: "ops@example.com".to_string(),
            cert_dir: dir.to_path_buf(),
            staging: true,
            domains: domains.iter().map(|s| s.to_string()).collect(),
        })
        .unwrap()
    }

    fn write_self_signed(dir: &Path, host: &str) {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec![host.to_string()]).unwrap();
        std::fs::write(dir.join(format!("{host}.crt")), cert.pem()).unwrap();
        std::fs::write(dir.join(format!("{host}.key")), key_pair.serialize_pem()).unwrap();
    }

    fn write_expired(dir: &Path, host: &str) {
        let mut params = CertificateParams::new(vec![host.to_string()]).unwrap();
        params.not_before = rcgen::date_time_ymd(2020, 1, 1);
        params.not_after = rcgen::date_time_ymd(2020, 6, 1);
        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).unwrap();
        let cert = params.self_signed(&key_pair).unwrap();
        std::fs::write(dir.join(format!("{host}.crt")), cert.pem()).unwrap();
        std::fs::write(dir.join(format!("{host}.key")), key_pair.serialize_pem()).unwrap();
    }

    #[test]
    fn test_requires_email_and_domains() {
        let dir = tempfile::tempdir().unwrap();

        assert!(CertManager::new(CertManagerConfig {
            email: String::new(),
            cert_dir: dir.path().to_path_buf(),
            staging: true,
            domains: vec!["example.com".to_string()],
        })
        .is_err());

        assert!(CertManager::new(CertManagerConfig {
            email: "ops@example.com".to_string(),
            cert_dir: dir.path().to_path_buf(),
            staging: true,
            domains: vec![],
        })
        .is_err());
    }

    #[test]
    fn test_host_policy_exact_match() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), &["example.com", "web.localhost"]);

        assert_eq!(mgr.authorize_host("example.com").unwrap(), "example.com");
        assert_eq!(mgr.authorize_host("EXAMPLE.COM").unwrap(), "example.com");
        assert_eq!(mgr.authorize_host("example.com:443").unwrap(), "example.com");
        assert!(mgr.authorize_host("other.com").is_err());
        assert!(mgr.authorize_host("sub.example.com").is_err());
    }

    #[test]
    fn test_host_policy_wildcard() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), &["*.example.com"]);

        assert!(mgr.authorize_host("example.com").is_ok());
        assert!(mgr.authorize_host("app.example.com").is_ok());
        assert!(mgr.authorize_host("deep.app.example.com").is_ok());
        assert!(mgr.authorize_host("example.org").is_err());
        assert!(mgr.authorize_host("notexample.com").is_err());
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("example.com:443"), "example.com");
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("example.com:"), "example.com:");
    }

    #[tokio::test]
    async fn test_challenge_store() {
        let challenges = Http01Challenges::new();
        challenges
            .set("token123".to_string(), "key_auth_123".to_string())
            .await;

        assert_eq!(
            challenges.get("token123").await,
            Some("key_auth_123".to_string())
        );
        assert_eq!(challenges.get("missing").await, None);

        challenges.remove("token123").await;
        assert_eq!(challenges.get("token123").await, None);
    }

    #[test]
    fn test_certificates_metadata() {
        let dir = tempfile::tempdir().unwrap();
        write_self_signed(dir.path(), "web.localhost");
        write_expired(dir.path(), "old.localhost");

        let mgr = manager(dir.path(), &["web.localhost", "old.localhost"]);
        let infos = mgr.certificates().unwrap();
        assert_eq!(infos.len(), 2);

        let old = infos.iter().find(|i| i.host == "old.localhost").unwrap();
        assert!(old.expired);
        let fresh = infos.iter().find(|i| i.host == "web.localhost").unwrap();
        assert!(!fresh.expired);
    }

    #[test]
    fn test_cleanup_removes_expired_only() {
        let dir = tempfile::tempdir().unwrap();
        write_self_signed(dir.path(), "web.localhost");
        write_expired(dir.path(), "old.localhost");

        let mgr = manager(dir.path(), &["web.localhost", "old.localhost"]);
        let removed = mgr.cleanup().unwrap();
        assert_eq!(removed, 1);

        assert!(dir.path().join("web.localhost.crt").exists());
        assert!(!dir.path().join("old.localhost.crt").exists());
        assert!(!dir.path().join("old.localhost.key").exists());
    }

    #[tokio::test]
    async fn test_get_certificate_uses_disk_cache() {
        let dir = tempfile::tempdir().unwrap();
        write_self_signed(dir.path(), "web.localhost");

        let mgr = manager(dir.path(), &["web.localhost"]);

        // Warm from disk without any ACME traffic
        let first = mgr.get_certificate("web.localhost").await.unwrap();
        // Warm cache returns the same certificate identity
        let second = mgr.get_certificate("web.localhost").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_get_certificate_rejects_unknown_host() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), &["web.localhost"]);

        assert!(mgr.get_certificate("evil.example.com").await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_certificate() {
        let dir = tempfile::tempdir().unwrap();
        write_self_signed(dir.path(), "web.localhost");
        let mgr = manager(dir.path(), &["web.localhost"]);

        let (a, b) = tokio::join!(
            mgr.get_certificate("web.localhost"),
            mgr.get_certificate("web.localhost")
        );
        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
    }

    #[test]
    fn test_client_certs_requested_but_optional() {
        let verifier = AnyClientCertVerifier::new();
        assert!(verifier.offer_client_auth());
        assert!(!verifier.client_auth_mandatory());
        assert!(verifier.root_hint_subjects().is_empty());
        assert!(!verifier.supported_verify_schemes().is_empty());

        // Any presented certificate passes; chain building is not attempted
        let rcgen::CertifiedKey { cert, .. } =
            rcgen::generate_simple_self_signed(vec!["client.localhost".to_string()]).unwrap();
        let der = CertificateDer::from(cert.der().to_vec());
        assert!(verifier.verify_client_cert(&der, &[], UnixTime::now()).is_ok());
    }

    #[test]
    fn test_insert_static_and_server_config() {
        let dir = tempfile::tempdir().unwrap();
        write_self_signed(dir.path(), "web.localhost");

        let mgr = manager(dir.path(), &["web.localhost"]);
        mgr.insert_static(
            "web.localhost",
            dir.path().join("web.localhost.crt").to_str().unwrap(),
            dir.path().join("web.localhost.key").to_str().unwrap(),
        )
        .unwrap();

        let key = mgr.cached_if_fresh("web.localhost").unwrap();
        let config = server_config_for(key);
        assert_eq!(
            config.alpn_protocols,
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        );
    }

    #[test]
    fn test_insert_self_signed() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), &["web.localhost", "api.localhost"]);

        mgr.insert_self_signed(&["web.localhost".to_string(), "api.localhost".to_string()])
            .unwrap();

        assert!(mgr.cached_if_fresh("web.localhost").is_some());
        assert!(mgr.cached_if_fresh("api.localhost").is_some());
    }
}
