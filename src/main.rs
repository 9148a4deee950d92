//! The navi relay node.
//!
//! This handles only the CLI, config file loading and managed-mode bootstrap, the node
//! itself lives in [`navi_relay::supervisor`].

use std::{
    net::{IpAddr, Ipv6Addr, SocketAddr},
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use clap::Parser;
use n0_snafu::Result;
use navi_relay::{
    cert::{AcmeConfig, CertConfig, CertManager, CertMode, DnsChallengeConfig, RenewalPolicy},
    controller::{FleetController, HttpController, ManagedSettings},
    defaults::{DEFAULT_HTTPS_PORT, DEV_MODE_HTTPS_PORT},
    identity::ServerIdentity,
    relay::{LoopbackEngine, RelayService},
    server::{Metrics, RateBudget, RateBudgetError, ServerConfig, TlsConfig},
    supervisor::{EpochConfig, EpochLoader, LoadError, Supervisor, spawn_signal_listener},
};
use nested_enum_utils::common_fields;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, ResultExt, Snafu};
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

/// A relay node answering STUN and relaying over TLS.
#[derive(Parser, Debug, Clone)]
#[clap(version, about, long_about = None)]
struct Cli {
    /// Run in localhost development mode.
    ///
    /// Serves a self-signed certificate on port 3340 unless `addr` is configured, and uses
    /// a fresh identity which is not stored.
    #[clap(long, default_value_t = false)]
    dev: bool,
    /// Path to the configuration file.
    ///
    /// Re-read at every listener rotation.  The defaults are used if it does not exist.
    #[clap(long, short)]
    config_path: Option<PathBuf>,
    /// Node id of a managed node, selects the identity store.
    #[clap(long)]
    id: Option<String>,
    /// URL of the fleet controller, requires `--id`.
    #[clap(long)]
    ctrl_url: Option<String>,
}

#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[derive(Debug, Snafu)]
#[non_exhaustive]
enum ConfigError {
    #[snafu(display("config-path must be a file: {}", path.display()))]
    NotAFile { path: PathBuf },
    #[snafu(display("unable to read config {}", path.display()))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("config must be valid toml"))]
    Parse { source: toml::de::Error },
    #[snafu(display("invalid accept limits"))]
    Limits { source: RateBudgetError },
}

/// Configuration for the relay node.
///
/// Every field has a default, an empty file is a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Config {
    /// The public hostname, the name the certificate is for.
    #[serde(default = "cfg_defaults::hostname")]
    hostname: String,
    /// The socket address the HTTPS server binds.
    ///
    /// Defaults to `[::]:443`, or `[::]:3340` in `--dev` mode.
    addr: Option<SocketAddr>,
    /// The socket address of the plain-HTTP captive portal service.
    ///
    /// Disabled if not set.
    http_bind_addr: Option<SocketAddr>,
    /// Whether to hand `/derp` upgrades to the relay engine.
    #[serde(default = "cfg_defaults::enable_relay")]
    enable_relay: bool,
    /// Whether to run the STUN responder.
    #[serde(default = "cfg_defaults::enable_stun")]
    enable_stun: bool,
    /// The UDP port of the STUN responder.
    #[serde(default = "cfg_defaults::stun_port")]
    stun_port: u16,
    /// The socket address of the STUN responder.
    ///
    /// Defaults to the IP of `addr` with the port set to `stun_port`.
    stun_bind_addr: Option<SocketAddr>,
    /// Certificate settings.
    #[serde(default)]
    tls: TlsSection,
    /// DNS-01 challenge settings, TLS-ALPN-01 is used when not set.
    dns: Option<DnsChallengeConfig>,
    /// Admission limits of the HTTPS listener.
    #[serde(default)]
    limits: Limits,
    /// Certificate renewal settings.
    #[serde(default)]
    renewal: RenewalPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hostname: cfg_defaults::hostname(),
            addr: None,
            http_bind_addr: None,
            enable_relay: cfg_defaults::enable_relay(),
            enable_stun: cfg_defaults::enable_stun(),
            stun_port: cfg_defaults::stun_port(),
            stun_bind_addr: None,
            tls: TlsSection::default(),
            dns: None,
            limits: Limits::default(),
            renewal: RenewalPolicy::default(),
        }
    }
}

/// Defaults for fields from [`Config`].
///
/// These are the defaults that serde will fill in.  Other defaults depend on each other
/// and can not immediately be substituted, so they are `Option` with the `None` meaning
/// described in the field documentation.
mod cfg_defaults {
    pub(crate) fn hostname() -> String {
        "localhost".to_string()
    }

    pub(crate) fn enable_relay() -> bool {
        true
    }

    pub(crate) fn enable_stun() -> bool {
        true
    }

    pub(crate) fn stun_port() -> u16 {
        navi_relay::defaults::DEFAULT_STUN_PORT
    }

    pub(crate) mod tls {
        use std::path::PathBuf;

        use navi_relay::cert::CertMode;

        pub(crate) fn cert_mode() -> CertMode {
            CertMode::LetsEncrypt
        }

        pub(crate) fn cert_dir() -> PathBuf {
            dirs_next::home_dir()
                .map(|home| home.join(".navi-relay").join("certs"))
                .unwrap_or_else(|| PathBuf::from("navi-certs"))
        }

        pub(crate) fn prod_tls() -> bool {
            true
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TlsSection {
    /// How the certificate is obtained.
    #[serde(default = "cfg_defaults::tls::cert_mode")]
    cert_mode: CertMode,
    /// Directory of issued certificates and the ACME account.
    #[serde(default = "cfg_defaults::tls::cert_dir")]
    cert_dir: PathBuf,
    /// Certificate path in manual mode, `<cert_dir>/<hostname>.crt` if not set.
    manual_cert_path: Option<PathBuf>,
    /// Key path in manual mode, `<cert_dir>/<hostname>.key` if not set.
    manual_key_path: Option<PathBuf>,
    /// Whether to use the production Let's Encrypt directory instead of staging.
    #[serde(default = "cfg_defaults::tls::prod_tls")]
    prod_tls: bool,
    /// Contact email of the ACME account.
    contact: Option<String>,
}

impl Default for TlsSection {
    fn default() -> Self {
        Self {
            cert_mode: cfg_defaults::tls::cert_mode(),
            cert_dir: cfg_defaults::tls::cert_dir(),
            manual_cert_path: None,
            manual_key_path: None,
            prod_tls: cfg_defaults::tls::prod_tls(),
            contact: None,
        }
    }
}

/// Admission limits of the HTTPS listener.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Limits {
    /// Accepted connections per second, unlimited if not set.
    accept_conn_limit: Option<f64>,
    /// Burst of accepted connections, defaults to the limit rounded up.
    accept_conn_burst: Option<usize>,
}

impl Config {
    async fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Config::default());
        };
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            Self::read_from_file(path).await
        } else {
            debug!(path = %path.display(), "config file missing, using defaults");
            Ok(Config::default())
        }
    }

    fn from_str(config: &str) -> Result<Self, ConfigError> {
        toml::from_str(config).context(ParseSnafu)
    }

    async fn read_from_file(path: &Path) -> Result<Self, ConfigError> {
        snafu::ensure!(path.is_file(), NotAFileSnafu { path });
        let config_ser = tokio::fs::read_to_string(path)
            .await
            .context(ReadSnafu { path })?;
        Self::from_str(&config_ser)
    }

    /// Overrides local settings with those of the fleet controller.
    fn apply_managed(&mut self, settings: &ManagedSettings) {
        if let Some(hostname) = &settings.hostname {
            self.hostname = hostname.clone();
        }
        if let Some(addr) = settings.addr {
            self.addr = Some(addr);
        }
        if let Some(stun_port) = settings.stun_port {
            self.stun_port = stun_port;
        }
        if let Some(enable_relay) = settings.enable_relay {
            self.enable_relay = enable_relay;
        }
        if let Some(enable_stun) = settings.enable_stun {
            self.enable_stun = enable_stun;
        }
        if let Some(provider) = &settings.dns_provider {
            let dns = self.dns.get_or_insert_with(Default::default);
            dns.provider = provider.clone();
        }
        if let Some(dns) = self.dns.as_mut() {
            if let Some(id) = &settings.dns_id {
                dns.id = Some(id.clone());
            }
            if let Some(key) = &settings.dns_key {
                dns.key = key.clone();
            }
            if let Some(ip) = settings.set_ipv4 {
                dns.set_ipv4 = Some(ip);
            }
            if let Some(ip) = settings.set_ipv6 {
                dns.set_ipv6 = Some(ip);
            }
        }
    }

    fn https_bind_addr(&self, dev: bool) -> SocketAddr {
        let port = if dev {
            DEV_MODE_HTTPS_PORT
        } else {
            DEFAULT_HTTPS_PORT
        };
        self.addr
            .unwrap_or_else(|| (Ipv6Addr::UNSPECIFIED, port).into())
    }

    fn stun_bind_addr(&self, dev: bool) -> Option<SocketAddr> {
        if !self.enable_stun {
            return None;
        }
        let ip: IpAddr = self.https_bind_addr(dev).ip();
        Some(
            self.stun_bind_addr
                .unwrap_or_else(|| SocketAddr::new(ip, self.stun_port)),
        )
    }

    fn cert_config(&self, dev: bool) -> CertConfig {
        let mode = if dev {
            CertMode::SelfSigned
        } else {
            self.tls.cert_mode
        };
        CertConfig {
            mode,
            hostname: self.hostname.clone(),
            cert_dir: self.tls.cert_dir.clone(),
            manual_cert_path: self.tls.manual_cert_path.clone(),
            manual_key_path: self.tls.manual_key_path.clone(),
            acme: AcmeConfig {
                production: self.tls.prod_tls,
                contact: self.tls.contact.clone(),
                challenge_addr: self.https_bind_addr(dev),
                dns: self.dns.clone(),
            },
            renewal: self.renewal,
        }
    }

    fn server_config(&self, dev: bool, tls: TlsConfig) -> Result<ServerConfig, ConfigError> {
        let accept_budget = RateBudget::new(
            self.limits.accept_conn_limit,
            self.limits.accept_conn_burst,
        )
        .context(LimitsSnafu)?;
        Ok(ServerConfig {
            https_bind_addr: self.https_bind_addr(dev),
            tls,
            http_bind_addr: self.http_bind_addr,
            stun_bind_addr: self.stun_bind_addr(dev),
            enable_relay: self.enable_relay,
            accept_budget,
        })
    }
}

/// Builds every epoch from the config file and, for a managed node, the controller.
#[derive(Debug)]
struct NodeLoader {
    cli: Cli,
    identity: ServerIdentity,
    relay: RelayService,
    controller: Option<Arc<dyn FleetController>>,
}

#[async_trait]
impl EpochLoader for NodeLoader {
    async fn load(&mut self, epoch: u64) -> Result<EpochConfig, LoadError> {
        let mut cfg = Config::load(self.cli.config_path.as_deref()).await?;
        let mut housekeeping = None;
        if let Some(controller) = &self.controller {
            let bootstrap = controller.bootstrap(&self.identity).await?;
            cfg.apply_managed(&bootstrap.settings);
            housekeeping = bootstrap.housekeeping;
        }
        debug!(epoch, "{cfg:#?}");

        let manager = CertManager::new(cfg.cert_config(self.cli.dev))?;
        let certificate = manager.ensure().await?;
        let tls = TlsConfig::new(&certificate, &self.relay)?;
        Ok(EpochConfig {
            server: cfg.server_config(self.cli.dev, tls)?,
            renewal: manager.renewal(),
            housekeeping,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let identity = if cli.dev {
        ServerIdentity::generate()
    } else {
        let path = ServerIdentity::default_path(cli.id.as_deref())?;
        ServerIdentity::load_or_create(&path).await?
    };

    let controller: Option<Arc<dyn FleetController>> = match (&cli.ctrl_url, &cli.id) {
        (Some(url), Some(id)) => Some(Arc::new(HttpController::new(url, id)?)),
        (Some(_), None) => {
            warn!("--ctrl-url given without --id, running unmanaged");
            None
        }
        (None, _) => None,
    };

    let relay = RelayService::new(Arc::new(LoopbackEngine), identity.node_key())?;
    info!(public_key = %relay.public_key_hex(), "starting relay node");

    let loader = NodeLoader {
        cli,
        identity,
        relay: relay.clone(),
        controller,
    };
    let supervisor = Supervisor::new(loader, relay, Metrics::default());
    let _signals = n0_snafu::ResultExt::e(spawn_signal_listener(supervisor.handle()))?;
    supervisor.run().await?;
    info!("relay node stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{net::Ipv4Addr, time::Duration};

    use n0_snafu::{Result, ResultExt};
    use navi_relay::defaults::DEFAULT_STUN_PORT;

    use super::*;

    #[test]
    fn test_config_default() -> Result {
        let config = Config::from_str("")?;
        assert_eq!(config.hostname, "localhost");
        assert_eq!(
            config.https_bind_addr(false),
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, DEFAULT_HTTPS_PORT))
        );
        assert_eq!(
            config.https_bind_addr(true),
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, DEV_MODE_HTTPS_PORT))
        );
        assert_eq!(
            config.stun_bind_addr(false),
            Some(SocketAddr::from((Ipv6Addr::UNSPECIFIED, DEFAULT_STUN_PORT)))
        );
        assert!(config.enable_relay);
        assert_eq!(config.tls.cert_mode, CertMode::LetsEncrypt);
        assert!(config.tls.prod_tls);
        assert_eq!(config.renewal, RenewalPolicy::default());
        assert!(config.dns.is_none());

        assert_eq!(config.cert_config(true).mode, CertMode::SelfSigned);
        assert_eq!(config.cert_config(false).mode, CertMode::LetsEncrypt);
        Ok(())
    }

    #[test]
    fn test_config_full() -> Result {
        let config = Config::from_str(
            r#"
            hostname = "relay.example.com"
            addr = "0.0.0.0:8443"
            http_bind_addr = "0.0.0.0:80"
            enable_stun = false

            [tls]
            cert_mode = "Manual"
            manual_cert_path = "/etc/navi/relay.crt"
            manual_key_path = "/etc/navi/relay.key"

            [dns]
            provider = "cloudflare"
            key = "token"
            set_ipv4 = "203.0.113.7"

            [limits]
            accept_conn_limit = 2.5

            [renewal]
            check_interval = "1h"
            threshold = "14days"
            "#,
        )?;
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8443));
        assert_eq!(config.https_bind_addr(false), addr);
        assert_eq!(config.https_bind_addr(true), addr);
        assert_eq!(config.stun_bind_addr(false), None);

        let certs = config.cert_config(false);
        assert_eq!(certs.mode, CertMode::Manual);
        assert_eq!(
            certs.manual_cert_path.as_deref(),
            Some(Path::new("/etc/navi/relay.crt"))
        );
        let dns = certs.acme.dns.expect("dns section");
        assert_eq!(dns.provider, "cloudflare");
        assert_eq!(dns.set_ipv4, Some(Ipv4Addr::new(203, 0, 113, 7)));
        assert_eq!(certs.acme.challenge_addr, addr);

        assert_eq!(config.renewal.check_interval, Duration::from_secs(3600));
        assert_eq!(
            config.renewal.threshold,
            Duration::from_secs(14 * 24 * 60 * 60)
        );

        let budget = RateBudget::new(
            config.limits.accept_conn_limit,
            config.limits.accept_conn_burst,
        )
        .e()?;
        assert!(!budget.is_unlimited());
        Ok(())
    }

    #[test]
    fn test_config_invalid_limits() -> Result {
        let config = Config::from_str(
            "
            [limits]
            accept_conn_limit = 10.0
            accept_conn_burst = 0
            ",
        )?;
        let certificate = navi_relay::cert::ManagedCertificate::self_signed("localhost")?;
        let relay = RelayService::new(
            Arc::new(LoopbackEngine),
            ServerIdentity::generate().node_key(),
        )?;
        let tls = TlsConfig::new(&certificate, &relay)?;
        assert!(matches!(
            config.server_config(false, tls),
            Err(ConfigError::Limits { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_apply_managed() -> Result {
        let mut config = Config::from_str("enable_relay = false")?;
        let settings: ManagedSettings = serde_json::from_str(
            r#"{
                "hostname": "eu1.relay.example.com",
                "enableRelay": true,
                "stunPort": 3479,
                "dnsProvider": "namesilo",
                "dnsKey": "secret",
                "setIpv6": "2001:db8::7"
            }"#,
        )
        .e()?;
        config.apply_managed(&settings);
        assert_eq!(config.hostname, "eu1.relay.example.com");
        assert!(config.enable_relay);
        assert_eq!(
            config.stun_bind_addr(false),
            Some(SocketAddr::from((Ipv6Addr::UNSPECIFIED, 3479)))
        );
        let dns = config.dns.expect("dns section");
        assert_eq!(dns.provider, "namesilo");
        assert_eq!(dns.key, "secret");
        assert_eq!(dns.set_ipv6, Some("2001:db8::7".parse::<Ipv6Addr>().e()?));
        Ok(())
    }

    #[tokio::test]
    async fn test_config_missing_file() -> Result {
        let dir = tempfile::tempdir().e()?;
        let config = Config::load(Some(&dir.path().join("navi.toml"))).await?;
        assert_eq!(config.hostname, "localhost");
        assert!(matches!(
            Config::load(Some(dir.path())).await,
            Err(ConfigError::NotAFile { .. })
        ));
        Ok(())
    }
}
