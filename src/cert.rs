//! TLS certificates: loading, issuance and the renewal policy.
//!
//! A [`CertManager`] produces the [`ManagedCertificate`] of one listener epoch.  It never
//! swaps certificates under a running listener: when renewal is due the supervisor is asked
//! to rotate, and the next epoch's manager run issues the new certificate.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use nested_enum_utils::common_fields;
use rustls::{
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer},
    server::{ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
};
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, ResultExt, Snafu};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::{
    defaults::{DEFAULT_RENEWAL_CHECK_INTERVAL, DEFAULT_RENEWAL_THRESHOLD},
    dns::{DnsProvider, DnsProviderError, ZoneError},
};

pub mod acme;
pub mod port_redirect;

pub use self::acme::{AcmeConfig, DnsChallengeConfig};

/// Certificate failures.  All of them are fatal for the epoch being loaded.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum CertError {
    #[snafu(display("failed to read {}", path.display()))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to write {}", path.display()))]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("invalid PEM data"))]
    Pem { source: std::io::Error },
    #[snafu(display("no certificates found"))]
    NoCertificates {},
    #[snafu(display("no private key found"))]
    NoPrivateKey {},
    #[snafu(display("invalid certificate: {details}"))]
    InvalidCertificate { details: String },
    #[snafu(display("certificate expired at {not_after}"))]
    Expired { not_after: OffsetDateTime },
    #[snafu(display("invalid private key"))]
    InvalidKey { source: rustls::Error },
    #[snafu(display("TLS configuration"))]
    TlsConfig { source: rustls::Error },
    #[snafu(display("certificate generation"))]
    Generate { source: rcgen::Error },
    #[snafu(display("DNS provider"))]
    Provider { source: DnsProviderError },
    #[snafu(display("zone discovery"))]
    Zone { source: ZoneError },
    #[snafu(display("ACME"))]
    Acme { source: instant_acme::Error },
    #[snafu(display("ACME account credentials"))]
    AccountCredentials { source: serde_json::Error },
    #[snafu(display("ACME order failed: {details}"))]
    Order { details: String },
    #[snafu(display("ACME order did not complete within {timeout:?}"))]
    OrderTimeout { timeout: Duration },
    #[snafu(display("failed to bind the TLS-ALPN-01 responder on port {port}"))]
    ChallengeBind { port: u16, source: std::io::Error },
    #[snafu(display("port redirect: {details}"))]
    PortRedirect { details: String },
    #[snafu(display("port redirect command"))]
    PortRedirectSpawn { source: std::io::Error },
}

/// How the certificate is obtained.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CertMode {
    /// Certificate and key are read from disk.
    #[default]
    Manual,
    /// Issued and renewed through ACME.
    LetsEncrypt,
    /// Generated at startup, for development.
    SelfSigned,
}

/// When to look at the certificate and how early to replace it.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct RenewalPolicy {
    /// Period of the expiry check.
    #[serde(with = "humantime_serde")]
    pub check_interval: Duration,
    /// Remaining validity below which the certificate is replaced.
    #[serde(with = "humantime_serde")]
    pub threshold: Duration,
}

impl Default for RenewalPolicy {
    fn default() -> Self {
        Self {
            check_interval: DEFAULT_RENEWAL_CHECK_INTERVAL,
            threshold: DEFAULT_RENEWAL_THRESHOLD,
        }
    }
}

impl RenewalPolicy {
    /// Whether a certificate valid until `not_after` is due for renewal at `now`.
    pub fn is_due(&self, not_after: OffsetDateTime, now: OffsetDateTime) -> bool {
        not_after - now < self.threshold
    }
}

/// A certificate chain with its private key.
#[derive(derive_more::Debug)]
pub struct ManagedCertificate {
    #[debug(skip)]
    chain: Vec<CertificateDer<'static>>,
    #[debug(skip)]
    key: PrivateKeyDer<'static>,
    not_after: OffsetDateTime,
}

impl Clone for ManagedCertificate {
    fn clone(&self) -> Self {
        Self {
            chain: self.chain.clone(),
            key: self.key.clone_key(),
            not_after: self.not_after,
        }
    }
}

impl ManagedCertificate {
    /// Creates a certificate from its DER chain, leaf first, and key.
    pub fn new(
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Self, CertError> {
        let leaf = chain.first().ok_or_else(|| NoCertificatesSnafu.build())?;
        let not_after = leaf_not_after(leaf)?;
        Ok(Self {
            chain,
            key,
            not_after,
        })
    }

    /// Parses a PEM chain and a PEM private key.
    pub fn from_pem(chain_pem: &[u8], key_pem: &[u8]) -> Result<Self, CertError> {
        let chain = rustls_pemfile::certs(&mut &chain_pem[..])
            .collect::<Result<Vec<_>, _>>()
            .context(PemSnafu)?;
        let key = rustls_pemfile::private_key(&mut &key_pem[..])
            .context(PemSnafu)?
            .ok_or_else(|| NoPrivateKeySnafu.build())?;
        Self::new(chain, key)
    }

    /// Reads a PEM chain and key from disk.
    pub async fn load(cert_path: &Path, key_path: &Path) -> Result<Self, CertError> {
        let chain_pem = tokio::fs::read(cert_path)
            .await
            .context(ReadSnafu { path: cert_path })?;
        let key_pem = tokio::fs::read(key_path)
            .await
            .context(ReadSnafu { path: key_path })?;
        Self::from_pem(&chain_pem, &key_pem)
    }

    /// Generates a self-signed certificate for `hostname`.
    pub fn self_signed(hostname: &str) -> Result<Self, CertError> {
        let key_pair = rcgen::KeyPair::generate().context(GenerateSnafu)?;
        let params =
            rcgen::CertificateParams::new(vec![hostname.to_string()]).context(GenerateSnafu)?;
        Self::sign(params, key_pair)
    }

    /// Generates a self-signed certificate for `hostname` expiring at `not_after`.
    pub fn self_signed_until(hostname: &str, not_after: OffsetDateTime) -> Result<Self, CertError> {
        let key_pair = rcgen::KeyPair::generate().context(GenerateSnafu)?;
        let mut params =
            rcgen::CertificateParams::new(vec![hostname.to_string()]).context(GenerateSnafu)?;
        params.not_before = not_after.min(OffsetDateTime::now_utc()) - time::Duration::days(30);
        params.not_after = not_after;
        Self::sign(params, key_pair)
    }

    fn sign(params: rcgen::CertificateParams, key_pair: rcgen::KeyPair) -> Result<Self, CertError> {
        let cert = params.self_signed(&key_pair).context(GenerateSnafu)?;
        let key = PrivatePkcs8KeyDer::from(key_pair.serialize_der());
        Self::new(vec![cert.der().clone()], key.into())
    }

    /// The certificate chain, leaf first.
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    /// Expiry of the leaf certificate.
    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    /// Validity left at `now`, zero once expired.
    pub fn remaining(&self, now: OffsetDateTime) -> Duration {
        (self.not_after - now).try_into().unwrap_or(Duration::ZERO)
    }

    /// Whether the leaf has expired.
    pub fn is_expired(&self) -> bool {
        self.not_after <= OffsetDateTime::now_utc()
    }

    /// Builds the rustls configuration serving this certificate.
    ///
    /// `meta_cert` is appended after the real chain.
    pub fn server_config(
        &self,
        meta_cert: &CertificateDer<'static>,
    ) -> Result<Arc<rustls::ServerConfig>, CertError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let certified_key = self.certified_key(&provider, meta_cert)?;
        let config = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .context(TlsConfigSnafu)?
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(ChainResolver(Arc::new(certified_key))));
        Ok(Arc::new(config))
    }

    fn certified_key(
        &self,
        provider: &rustls::crypto::CryptoProvider,
        meta_cert: &CertificateDer<'static>,
    ) -> Result<CertifiedKey, CertError> {
        let signing_key = provider
            .key_provider
            .load_private_key(self.key.clone_key())
            .context(InvalidKeySnafu)?;
        let mut chain = self.chain.clone();
        chain.push(meta_cert.clone());
        Ok(CertifiedKey::new(chain, signing_key))
    }
}

/// Always presents the same certified key.
#[derive(Debug)]
struct ChainResolver(Arc<CertifiedKey>);

impl ResolvesServerCert for ChainResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}

fn leaf_not_after(der: &[u8]) -> Result<OffsetDateTime, CertError> {
    let (_, cert) = x509_parser::parse_x509_certificate(der).map_err(|err| {
        InvalidCertificateSnafu {
            details: err.to_string(),
        }
        .build()
    })?;
    Ok(cert.validity().not_after.to_datetime())
}

/// Settings of the [`CertManager`].
#[derive(Debug, Clone)]
pub struct CertConfig {
    /// How the certificate is obtained.
    pub mode: CertMode,
    /// The name the certificate is for.
    pub hostname: String,
    /// Where issued certificates and the ACME account are stored.
    pub cert_dir: PathBuf,
    /// Certificate path in manual mode, `<cert_dir>/<hostname>.crt` by default.
    pub manual_cert_path: Option<PathBuf>,
    /// Key path in manual mode, `<cert_dir>/<hostname>.key` by default.
    pub manual_key_path: Option<PathBuf>,
    /// ACME settings, used in [`CertMode::LetsEncrypt`].
    pub acme: AcmeConfig,
    /// Renewal settings, used in [`CertMode::LetsEncrypt`].
    pub renewal: RenewalPolicy,
}

/// Obtains the certificate of a listener epoch.
#[derive(Debug)]
pub struct CertManager {
    config: CertConfig,
    dns_provider: Option<Arc<dyn DnsProvider>>,
}

impl CertManager {
    /// Creates a manager, selecting the DNS provider if one is configured.
    ///
    /// An unknown provider name fails here, before any network activity.
    pub fn new(config: CertConfig) -> Result<Self, CertError> {
        let dns_provider = match (config.mode, &config.acme.dns) {
            (CertMode::LetsEncrypt, Some(dns)) => Some(
                crate::dns::create_provider(&dns.provider, dns.id.as_deref(), &dns.key)
                    .context(ProviderSnafu)?,
            ),
            _ => None,
        };
        Ok(Self {
            config,
            dns_provider,
        })
    }

    /// The renewal policy, only set for automatically issued certificates.
    pub fn renewal(&self) -> Option<RenewalPolicy> {
        match self.config.mode {
            CertMode::LetsEncrypt => Some(self.config.renewal),
            CertMode::Manual | CertMode::SelfSigned => None,
        }
    }

    /// Path of the stored or manual certificate.
    pub fn cert_path(&self) -> PathBuf {
        match (self.config.mode, &self.config.manual_cert_path) {
            (CertMode::Manual, Some(path)) => path.clone(),
            _ => self
                .config
                .cert_dir
                .join(format!("{}.crt", self.config.hostname)),
        }
    }

    /// Path of the stored or manual private key.
    pub fn key_path(&self) -> PathBuf {
        match (self.config.mode, &self.config.manual_key_path) {
            (CertMode::Manual, Some(path)) => path.clone(),
            _ => self
                .config
                .cert_dir
                .join(format!("{}.key", self.config.hostname)),
        }
    }

    /// Returns a certificate which is current, issuing a new one when needed.
    pub async fn ensure(&self) -> Result<ManagedCertificate, CertError> {
        match self.config.mode {
            CertMode::Manual => {
                let cert = ManagedCertificate::load(&self.cert_path(), &self.key_path()).await?;
                snafu::ensure!(
                    !cert.is_expired(),
                    ExpiredSnafu {
                        not_after: cert.not_after()
                    }
                );
                info!(not_after = %cert.not_after(), "loaded manual certificate");
                Ok(cert)
            }
            CertMode::SelfSigned => {
                warn!(hostname = %self.config.hostname, "using a self-signed certificate");
                ManagedCertificate::self_signed(&self.config.hostname)
            }
            CertMode::LetsEncrypt => {
                let stored = self.load_stored().await;
                let now = OffsetDateTime::now_utc();
                if let Some(cert) = reusable(stored, &self.config.renewal, now) {
                    info!(not_after = %cert.not_after(), "reusing stored certificate");
                    return Ok(cert);
                }
                let issued = acme::issue(
                    &self.config.hostname,
                    &self.config.acme,
                    self.dns_provider.as_deref(),
                    &self.config.cert_dir,
                )
                .await?;
                self.store(&issued).await?;
                let cert = ManagedCertificate::from_pem(
                    issued.chain_pem.as_bytes(),
                    issued.key_pem.as_bytes(),
                )?;
                info!(not_after = %cert.not_after(), "issued new certificate");
                Ok(cert)
            }
        }
    }

    async fn load_stored(&self) -> Option<ManagedCertificate> {
        let (cert_path, key_path) = (self.cert_path(), self.key_path());
        if !tokio::fs::try_exists(&cert_path).await.unwrap_or(false) {
            debug!(path = %cert_path.display(), "no stored certificate");
            return None;
        }
        match ManagedCertificate::load(&cert_path, &key_path).await {
            Ok(cert) => Some(cert),
            Err(err) => {
                warn!(path = %cert_path.display(), "ignoring stored certificate: {err:#}");
                None
            }
        }
    }

    async fn store(&self, issued: &acme::IssuedCertificate) -> Result<(), CertError> {
        let dir = &self.config.cert_dir;
        tokio::fs::create_dir_all(dir)
            .await
            .context(WriteSnafu { path: dir })?;
        let cert_path = self.cert_path();
        tokio::fs::write(&cert_path, &issued.chain_pem)
            .await
            .context(WriteSnafu { path: &cert_path })?;
        write_private(&self.key_path(), issued.key_pem.as_bytes()).await
    }
}

/// The stored certificate, if it is valid for at least the renewal threshold.
fn reusable(
    stored: Option<ManagedCertificate>,
    policy: &RenewalPolicy,
    now: OffsetDateTime,
) -> Option<ManagedCertificate> {
    let cert = stored?;
    if policy.is_due(cert.not_after(), now) {
        info!(not_after = %cert.not_after(), "stored certificate is due for renewal");
        return None;
    }
    Some(cert)
}

/// Writes `contents` to `path`, readable only by the owner.
pub(crate) async fn write_private(path: &Path, contents: &[u8]) -> Result<(), CertError> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options.open(path).await.context(WriteSnafu { path })?;
    tokio::io::AsyncWriteExt::write_all(&mut file, contents)
        .await
        .context(WriteSnafu { path })?;
    tokio::io::AsyncWriteExt::flush(&mut file)
        .await
        .context(WriteSnafu { path })
}

#[cfg(test)]
mod tests {
    use n0_snafu::{Result, ResultExt};
    use tracing_test::traced_test;

    use super::*;

    fn manual_config(dir: &Path) -> CertConfig {
        CertConfig {
            mode: CertMode::Manual,
            hostname: "relay.example.com".to_string(),
            cert_dir: dir.to_path_buf(),
            manual_cert_path: None,
            manual_key_path: None,
            acme: AcmeConfig::default(),
            renewal: RenewalPolicy::default(),
        }
    }

    fn write_pem(dir: &Path, hostname: &str, not_after: OffsetDateTime) -> Result<()> {
        let key_pair = rcgen::KeyPair::generate().e()?;
        let mut params = rcgen::CertificateParams::new(vec![hostname.to_string()]).e()?;
        params.not_before = OffsetDateTime::now_utc() - time::Duration::days(60);
        params.not_after = not_after;
        let cert = params.self_signed(&key_pair).e()?;
        std::fs::write(dir.join(format!("{hostname}.crt")), cert.pem()).e()?;
        std::fs::write(dir.join(format!("{hostname}.key")), key_pair.serialize_pem()).e()?;
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn test_manual_load() -> Result {
        let dir = tempfile::tempdir().e()?;
        let not_after = OffsetDateTime::now_utc() + time::Duration::days(90);
        write_pem(dir.path(), "relay.example.com", not_after)?;

        let manager = CertManager::new(manual_config(dir.path()))?;
        assert!(manager.renewal().is_none());
        let cert = manager.ensure().await?;
        assert_eq!(cert.chain().len(), 1);
        assert_eq!(cert.not_after().unix_timestamp(), not_after.unix_timestamp());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn test_manual_expired_is_fatal() -> Result {
        let dir = tempfile::tempdir().e()?;
        write_pem(
            dir.path(),
            "relay.example.com",
            OffsetDateTime::now_utc() - time::Duration::days(1),
        )?;
        let manager = CertManager::new(manual_config(dir.path()))?;
        let err = manager.ensure().await.unwrap_err();
        assert!(matches!(err, CertError::Expired { .. }));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn test_manual_missing_files() -> Result {
        let dir = tempfile::tempdir().e()?;
        let manager = CertManager::new(manual_config(dir.path()))?;
        assert!(matches!(
            manager.ensure().await.unwrap_err(),
            CertError::Read { .. }
        ));
        Ok(())
    }

    #[test]
    fn test_pem_without_key() -> Result {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).e()?;
        let err = ManagedCertificate::from_pem(cert.cert.pem().as_bytes(), b"").unwrap_err();
        assert!(matches!(err, CertError::NoPrivateKey { .. }));
        Ok(())
    }

    #[test]
    fn test_stored_certificate_reuse() -> Result {
        let policy = RenewalPolicy::default();
        let now = OffsetDateTime::now_utc();

        let fresh = ManagedCertificate::self_signed_until("a", now + time::Duration::days(60))?;
        assert!(reusable(Some(fresh), &policy, now).is_some());

        let expiring = ManagedCertificate::self_signed_until("a", now + time::Duration::days(3))?;
        assert!(reusable(Some(expiring), &policy, now).is_none());

        assert!(reusable(None, &policy, now).is_none());
        Ok(())
    }

    #[test]
    fn test_meta_cert_appended() -> Result {
        let cert = ManagedCertificate::self_signed("relay.example.com")?;
        let meta = ManagedCertificate::self_signed("meta")?;
        let meta_der = meta.chain()[0].clone();

        let provider = rustls::crypto::ring::default_provider();
        let certified = cert.certified_key(&provider, &meta_der)?;
        assert_eq!(certified.cert.len(), 2);
        assert_eq!(certified.cert[0], cert.chain()[0]);
        assert_eq!(certified.cert[1], meta_der);

        // the full config builds as well
        cert.server_config(&meta_der)?;
        Ok(())
    }

    #[test]
    fn test_renewal_policy() {
        let policy = RenewalPolicy::default();
        let now = OffsetDateTime::now_utc();
        assert!(policy.is_due(now + time::Duration::days(3), now));
        assert!(!policy.is_due(now + time::Duration::days(8), now));
        let parsed: RenewalPolicy =
            toml::from_str("check_interval = \"1h\"\nthreshold = \"2days\"").unwrap();
        assert_eq!(parsed.check_interval, Duration::from_secs(3600));
        assert_eq!(parsed.threshold, Duration::from_secs(2 * 24 * 3600));
    }
}
