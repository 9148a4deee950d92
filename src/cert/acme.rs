//! Certificate issuance over ACME.
//!
//! One call to [`issue`] runs a complete order for a single hostname, with either a
//! TLS-ALPN-01 or a DNS-01 challenge.  There is no background renewal here: a renewal is a new
//! issuance in a new listener epoch.

use std::{
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    path::Path,
    sync::Arc,
    time::Duration,
};

use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier,
    KeyAuthorization, LetsEncrypt, NewAccount, NewOrder, Order, OrderStatus,
};
use rustls::pki_types::PrivatePkcs8KeyDer;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tokio::{net::TcpListener, time::Instant};
use tokio_util::task::AbortOnDropHandle;
use tracing::{Instrument, debug, info, info_span, trace, warn};

use super::{
    AccountCredentialsSnafu, AcmeSnafu, CertError, ChallengeBindSnafu, GenerateSnafu,
    OrderSnafu, OrderTimeoutSnafu, ReadSnafu, TlsConfigSnafu, ZoneSnafu,
    port_redirect::PortRedirect,
};
use crate::{
    defaults::{
        DEFAULT_HTTPS_PORT,
        timeouts::{
            ACME_ORDER_TIMEOUT, DNS_PROPAGATION_POLL, DNS_PROPAGATION_TIMEOUT,
            TLS_HANDSHAKE_TIMEOUT,
        },
    },
    dns::{
        DnsProvider, DnsRecord, HickoryZoneLookup, RecordType, challenge_record_name,
        find_zone_by_fqdn, relative_name,
    },
};

/// File in the certificate directory holding the ACME account credentials.
pub const ACCOUNT_FILE: &str = "acme_account.json";

/// ALPN protocol of TLS-ALPN-01 validation connections.
pub const ACME_TLS_ALPN_NAME: &[u8] = b"acme-tls/1";

/// TTL of the challenge TXT records.
const CHALLENGE_TTL: u32 = 60;

/// ACME settings.
#[derive(Debug, Clone)]
pub struct AcmeConfig {
    /// Use the production directory of Let's Encrypt instead of staging.
    pub production: bool,
    /// Contact email for the ACME account.
    pub contact: Option<String>,
    /// Where the TLS-ALPN-01 responder listens, the address of the relay listener.
    pub challenge_addr: SocketAddr,
    /// DNS-01 settings, when set TLS-ALPN-01 is not used.
    pub dns: Option<DnsChallengeConfig>,
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            production: true,
            contact: None,
            challenge_addr: (Ipv6Addr::UNSPECIFIED, DEFAULT_HTTPS_PORT).into(),
            dns: None,
        }
    }
}

/// Settings of the DNS-01 challenge.
#[derive(Serialize, Deserialize, derive_more::Debug, Clone, PartialEq, Eq, Default)]
#[serde(default)]
pub struct DnsChallengeConfig {
    /// Name of the DNS provider, see [`crate::dns::create_provider`].
    pub provider: String,
    /// Access key id, for the providers needing one.
    pub id: Option<String>,
    /// API secret or token.
    #[debug("***")]
    pub key: String,
    /// IPv4 address published as A record of the hostname before every issuance.
    pub set_ipv4: Option<Ipv4Addr>,
    /// IPv6 address published as AAAA record of the hostname before every issuance.
    pub set_ipv6: Option<Ipv6Addr>,
    /// Recursive resolvers for zone discovery, the system resolvers when empty.
    pub resolvers: Vec<SocketAddr>,
}

/// A freshly issued certificate.
#[derive(derive_more::Debug, Clone)]
pub struct IssuedCertificate {
    /// PEM certificate chain, leaf first.
    pub chain_pem: String,
    /// PEM private key.
    #[debug(skip)]
    pub key_pem: String,
}

/// Issues a certificate for `hostname`.
///
/// Uses DNS-01 through `dns_provider` when given, TLS-ALPN-01 otherwise.  The account is
/// loaded from, or created in, `cert_dir`.
pub async fn issue(
    hostname: &str,
    config: &AcmeConfig,
    dns_provider: Option<&dyn DnsProvider>,
    cert_dir: &Path,
) -> Result<IssuedCertificate, CertError> {
    async move {
        let account = load_or_create_account(config, cert_dir).await?;
        match (dns_provider, &config.dns) {
            (Some(provider), Some(dns)) => issue_dns01(&account, hostname, provider, dns).await,
            _ => issue_tls_alpn01(&account, hostname, config.challenge_addr).await,
        }
    }
    .instrument(info_span!("acme", %hostname))
    .await
}

async fn issue_tls_alpn01(
    account: &Account,
    hostname: &str,
    challenge_addr: SocketAddr,
) -> Result<IssuedCertificate, CertError> {
    let redirect = PortRedirect::install(challenge_addr.port()).await?;
    let mut solver = Solver::TlsAlpn {
        addr: challenge_addr,
        responders: Vec::new(),
    };
    let res = run_order(account, hostname, &mut solver).await;
    drop(solver);
    if let Some(redirect) = redirect {
        redirect.remove().await?;
    }
    res
}

async fn issue_dns01(
    account: &Account,
    hostname: &str,
    provider: &dyn DnsProvider,
    dns: &DnsChallengeConfig,
) -> Result<IssuedCertificate, CertError> {
    let lookup = HickoryZoneLookup::new(&dns.resolvers);
    let zone = find_zone_by_fqdn(hostname, &lookup)
        .await
        .context(ZoneSnafu)?;
    let name = relative_name(hostname, &zone).context(ZoneSnafu)?;
    info!(%zone, %name, provider = provider.name(), "using DNS-01 challenge");

    publish_address_records(provider, &zone, &name, dns.set_ipv4, dns.set_ipv6).await;

    let mut solver = Solver::Dns {
        provider,
        lookup,
        zone: &zone,
        name: &name,
        published: Vec::new(),
    };
    let res = run_order(account, hostname, &mut solver).await;
    if let Solver::Dns { published, .. } = solver {
        if !published.is_empty() {
            if let Err(err) = provider.delete_records(&zone, &published).await {
                warn!("failed to remove challenge records: {err:#}");
            }
        }
    }
    res
}

/// Publishes the configured A and AAAA records of `name` in `zone`.
///
/// This runs before every DNS-01 issuance, renewals included, so the hostname keeps
/// pointing at this node.  Records are appended, and most vendors refuse a record which
/// already exists, so a failure is logged and issuance continues.  Returns the records
/// the provider accepted.
pub async fn publish_address_records(
    provider: &dyn DnsProvider,
    zone: &str,
    name: &str,
    ipv4: Option<Ipv4Addr>,
    ipv6: Option<Ipv6Addr>,
) -> Vec<DnsRecord> {
    let records: Vec<_> = ipv4
        .map(|ip| DnsRecord::new(RecordType::A, name, ip.to_string()))
        .into_iter()
        .chain(ipv6.map(|ip| DnsRecord::new(RecordType::Aaaa, name, ip.to_string())))
        .collect();
    if records.is_empty() {
        return records;
    }
    match provider.append_records(zone, &records).await {
        Ok(published) => {
            info!(%zone, %name, ?ipv4, ?ipv6, "published address records");
            published
        }
        Err(err) => {
            warn!(%zone, %name, ?ipv4, ?ipv6, "failed to publish address records: {err:#}");
            Vec::new()
        }
    }
}

/// The challenge specific part of an order.
enum Solver<'a> {
    TlsAlpn {
        addr: SocketAddr,
        responders: Vec<AbortOnDropHandle<()>>,
    },
    Dns {
        provider: &'a dyn DnsProvider,
        lookup: HickoryZoneLookup,
        zone: &'a str,
        name: &'a str,
        published: Vec<DnsRecord>,
    },
}

impl Solver<'_> {
    fn challenge_type(&self) -> ChallengeType {
        match self {
            Solver::TlsAlpn { .. } => ChallengeType::TlsAlpn01,
            Solver::Dns { .. } => ChallengeType::Dns01,
        }
    }

    /// Makes the challenge answerable, before it is marked ready.
    async fn prepare(
        &mut self,
        hostname: &str,
        key_auth: &KeyAuthorization,
    ) -> Result<(), CertError> {
        match self {
            Solver::TlsAlpn { addr, responders } => {
                let responder = spawn_alpn_responder(*addr, hostname, key_auth).await?;
                responders.push(responder);
                Ok(())
            }
            Solver::Dns {
                provider,
                lookup,
                zone,
                name,
                published,
            } => {
                let record = DnsRecord::new(
                    RecordType::Txt,
                    challenge_record_name(name),
                    key_auth.dns_value(),
                )
                .with_ttl(CHALLENGE_TTL);
                let fqdn = record.fqdn(zone);
                let created = provider
                    .append_records(zone, std::slice::from_ref(&record))
                    .await
                    .context(super::ProviderSnafu)?;
                published.extend(created);
                wait_for_txt(lookup, &fqdn, &record.value).await;
                Ok(())
            }
        }
    }
}

/// Waits until `value` is visible at `fqdn`, giving up quietly after a while.
async fn wait_for_txt(lookup: &HickoryZoneLookup, fqdn: &str, value: &str) {
    let deadline = Instant::now() + DNS_PROPAGATION_TIMEOUT;
    loop {
        if lookup.txt_values(fqdn).await.iter().any(|v| v == value) {
            debug!(%fqdn, "challenge record visible");
            return;
        }
        if Instant::now() >= deadline {
            warn!(
                %fqdn,
                "challenge record not visible after {DNS_PROPAGATION_TIMEOUT:?}, continuing"
            );
            return;
        }
        trace!(%fqdn, "challenge record not visible yet");
        tokio::time::sleep(DNS_PROPAGATION_POLL).await;
    }
}

async fn run_order(
    account: &Account,
    hostname: &str,
    solver: &mut Solver<'_>,
) -> Result<IssuedCertificate, CertError> {
    let identifiers = [Identifier::Dns(hostname.to_string())];
    let mut order = account
        .new_order(&NewOrder::new(&identifiers))
        .await
        .context(AcmeSnafu)?;
    debug!("order created");

    {
        let mut authorizations = order.authorizations();
        while let Some(result) = authorizations.next().await {
            let mut authz = result.context(AcmeSnafu)?;
            match authz.status {
                AuthorizationStatus::Valid => continue,
                AuthorizationStatus::Pending => {}
                _ => {
                    return Err(OrderSnafu {
                        details: format!("authorization is {:?}", authz.status),
                    }
                    .build());
                }
            }
            let challenge_type = solver.challenge_type();
            let mut challenge = authz.challenge(challenge_type.clone()).ok_or_else(|| {
                OrderSnafu {
                    details: format!("no {challenge_type:?} challenge offered"),
                }
                .build()
            })?;
            solver
                .prepare(hostname, &challenge.key_authorization())
                .await?;
            challenge.set_ready().await.context(AcmeSnafu)?;
            debug!(?challenge_type, "challenge ready");
        }
    }

    poll_order(&mut order, |status| *status == OrderStatus::Ready).await?;

    let key_pair = rcgen::KeyPair::generate().context(GenerateSnafu)?;
    let csr = rcgen::CertificateParams::new(vec![hostname.to_string()])
        .context(GenerateSnafu)?
        .serialize_request(&key_pair)
        .context(GenerateSnafu)?;
    order
        .finalize_csr(&csr.der().to_vec())
        .await
        .context(AcmeSnafu)?;

    poll_order(&mut order, |status| *status == OrderStatus::Valid).await?;
    let chain_pem = order
        .certificate()
        .await
        .context(AcmeSnafu)?
        .ok_or_else(|| {
            OrderSnafu {
                details: "no certificate in a valid order",
            }
            .build()
        })?;

    Ok(IssuedCertificate {
        chain_pem,
        key_pem: key_pair.serialize_pem(),
    })
}

/// Refreshes `order` until `done` holds for its status.
async fn poll_order(
    order: &mut Order,
    done: impl Fn(&OrderStatus) -> bool,
) -> Result<(), CertError> {
    let deadline = Instant::now() + ACME_ORDER_TIMEOUT;
    let mut delay = Duration::from_millis(250);
    loop {
        let state = order.refresh().await.context(AcmeSnafu)?;
        if done(&state.status) {
            return Ok(());
        }
        if state.status == OrderStatus::Invalid {
            return Err(OrderSnafu {
                details: "order is invalid",
            }
            .build());
        }
        trace!(status = ?state.status, "order not done yet");
        snafu::ensure!(
            Instant::now() < deadline,
            OrderTimeoutSnafu {
                timeout: ACME_ORDER_TIMEOUT
            }
        );
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(Duration::from_secs(10));
    }
}

async fn load_or_create_account(
    config: &AcmeConfig,
    cert_dir: &Path,
) -> Result<Account, CertError> {
    let path = cert_dir.join(ACCOUNT_FILE);
    if tokio::fs::try_exists(&path).await.unwrap_or(false) {
        let json = tokio::fs::read(&path)
            .await
            .context(ReadSnafu { path: &path })?;
        let credentials: AccountCredentials =
            serde_json::from_slice(&json).context(AccountCredentialsSnafu)?;
        let account = Account::builder()
            .context(AcmeSnafu)?
            .from_credentials(credentials)
            .await
            .context(AcmeSnafu)?;
        debug!(path = %path.display(), "loaded ACME account");
        return Ok(account);
    }

    let directory = if config.production {
        LetsEncrypt::Production
    } else {
        LetsEncrypt::Staging
    };
    let contact = config.contact.as_ref().map(|c| format!("mailto:{c}"));
    let contact: Vec<&str> = contact.iter().map(String::as_str).collect();
    let (account, credentials) = Account::builder()
        .context(AcmeSnafu)?
        .create(
            &NewAccount {
                contact: &contact,
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            directory.url().to_owned(),
            None,
        )
        .await
        .context(AcmeSnafu)?;

    tokio::fs::create_dir_all(cert_dir)
        .await
        .context(super::WriteSnafu { path: cert_dir })?;
    let json = serde_json::to_vec_pretty(&credentials).context(AccountCredentialsSnafu)?;
    super::write_private(&path, &json).await?;
    info!(path = %path.display(), production = config.production, "created ACME account");
    Ok(account)
}

/// Serves the TLS-ALPN-01 validation certificate on `addr` until dropped.
async fn spawn_alpn_responder(
    addr: SocketAddr,
    hostname: &str,
    key_auth: &KeyAuthorization,
) -> Result<AbortOnDropHandle<()>, CertError> {
    let key_pair = rcgen::KeyPair::generate().context(GenerateSnafu)?;
    let mut params =
        rcgen::CertificateParams::new(vec![hostname.to_string()]).context(GenerateSnafu)?;
    params.custom_extensions = vec![rcgen::CustomExtension::new_acme_identifier(
        key_auth.digest().as_ref(),
    )];
    let cert = params.self_signed(&key_pair).context(GenerateSnafu)?;

    let mut config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .context(TlsConfigSnafu)?
    .with_no_client_auth()
    .with_single_cert(
        vec![cert.der().clone()],
        PrivatePkcs8KeyDer::from(key_pair.serialize_der()).into(),
    )
    .context(TlsConfigSnafu)?;
    config.alpn_protocols = vec![ACME_TLS_ALPN_NAME.to_vec()];
    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind(addr)
        .await
        .context(ChallengeBindSnafu { port: addr.port() })?;
    info!(%addr, "serving TLS-ALPN-01 challenge");

    let task = tokio::spawn(
        async move {
            let mut handshakes = tokio::task::JoinSet::new();
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(err) => {
                        debug!("accept failed: {err:#}");
                        continue;
                    }
                };
                let acceptor = acceptor.clone();
                handshakes.spawn(async move {
                    match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await
                    {
                        Ok(Ok(_)) => info!(%peer, "answered validation request"),
                        Ok(Err(err)) => debug!(%peer, "validation handshake failed: {err:#}"),
                        Err(_) => debug!(%peer, "validation handshake timed out"),
                    }
                });
                while handshakes.try_join_next().is_some() {}
            }
        }
        .instrument(info_span!("acme-tls-alpn")),
    );
    Ok(AbortOnDropHandle::new(task))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use n0_snafu::Result;
    use tracing_test::traced_test;

    use super::*;
    use crate::dns::DnsProviderError;

    /// Records appended records in memory.
    #[derive(Debug, Default)]
    struct MemoryProvider {
        appended: Mutex<Vec<(String, DnsRecord)>>,
        reject_duplicates: bool,
    }

    #[async_trait]
    impl DnsProvider for MemoryProvider {
        fn name(&self) -> &'static str {
            "memory"
        }

        async fn append_records(
            &self,
            zone: &str,
            records: &[DnsRecord],
        ) -> std::result::Result<Vec<DnsRecord>, DnsProviderError> {
            let mut appended = self.appended.lock().unwrap();
            if self.reject_duplicates {
                for record in records {
                    let exists = appended.iter().any(|(z, r)| {
                        z == zone
                            && r.name == record.name
                            && r.record_type == record.record_type
                            && r.value == record.value
                    });
                    if exists {
                        return Err(crate::dns::provider::ApiSnafu {
                            provider: "memory",
                            message: "record already exists",
                        }
                        .build());
                    }
                }
            }
            Ok(records
                .iter()
                .map(|record| {
                    let record = DnsRecord {
                        id: Some(appended.len().to_string()),
                        ..record.clone()
                    };
                    appended.push((zone.to_string(), record.clone()));
                    record
                })
                .collect())
        }

        async fn delete_records(
            &self,
            _zone: &str,
            _records: &[DnsRecord],
        ) -> std::result::Result<(), DnsProviderError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_publish_address_records() -> Result {
        let provider = MemoryProvider::default();
        let published = publish_address_records(
            &provider,
            "example.com",
            "relay",
            Some(Ipv4Addr::new(192, 0, 2, 1)),
            Some("2001:db8::1".parse().unwrap()),
        )
        .await;
        assert_eq!(published.len(), 2);
        assert!(published.iter().all(|r| r.id.is_some()));

        let appended = provider.appended.lock().unwrap();
        assert_eq!(appended[0].0, "example.com");
        assert_eq!(appended[0].1.record_type, RecordType::A);
        assert_eq!(appended[0].1.value, "192.0.2.1");
        assert_eq!(appended[1].1.record_type, RecordType::Aaaa);
        assert_eq!(appended[1].1.name, "relay");
        Ok(())
    }

    #[tokio::test]
    async fn test_publish_nothing_configured() -> Result {
        let provider = MemoryProvider::default();
        let published =
            publish_address_records(&provider, "example.com", "relay", None, None).await;
        assert!(published.is_empty());
        assert!(provider.appended.lock().unwrap().is_empty());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn test_republish_existing_records() -> Result {
        let provider = MemoryProvider {
            reject_duplicates: true,
            ..Default::default()
        };
        let ip = Some(Ipv4Addr::new(192, 0, 2, 1));

        let first = publish_address_records(&provider, "example.com", "relay", ip, None).await;
        assert_eq!(first.len(), 1);

        // a renewal publishes the same record again, the vendor refuses it
        let renewal = publish_address_records(&provider, "example.com", "relay", ip, None).await;
        assert!(renewal.is_empty());
        assert_eq!(provider.appended.lock().unwrap().len(), 1);
        assert!(logs_contain("failed to publish address records"));
        Ok(())
    }

    #[test]
    fn test_dns_config_hides_key() {
        let config: DnsChallengeConfig = toml::from_str(
            r#"
            provider = "cloudflare"
            key = "token"
            set_ipv4 = "192.0.2.1"
            resolvers = ["1.1.1.1:53"]
            "#,
        )
        .unwrap();
        assert_eq!(config.provider, "cloudflare");
        assert_eq!(config.set_ipv4, Some(Ipv4Addr::new(192, 0, 2, 1)));
        assert!(config.set_ipv6.is_none());
        assert!(!format!("{config:?}").contains("token"));
    }
}
