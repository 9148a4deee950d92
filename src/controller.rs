//! Managed mode: bootstrap against a fleet controller.
//!
//! A managed relay node registers with its controller at the start of every epoch and gets
//! settings back which override the local configuration.  The controller also gets a
//! periodic heartbeat for as long as the epoch runs.

use std::{
    fmt,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    time::Duration,
};

use async_trait::async_trait;
use ed25519_dalek::Signer;
use nested_enum_utils::common_fields;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, ResultExt, Snafu};
use tokio_util::task::AbortOnDropHandle;
use tracing::{Instrument, debug, info, info_span, warn};
use url::Url;

use crate::{
    defaults::timeouts::HTTP_API_TIMEOUT,
    identity::{ServerIdentity, public_hex},
};

/// Interval of the heartbeat sent by [`HttpController`].
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Header carrying the hex encoded control key signature of the request body.
pub const SIGNATURE_HEADER: &str = "Navi-Signature";

/// Failures talking to the fleet controller.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ControllerError {
    #[snafu(display("invalid controller URL"))]
    InvalidUrl { source: url::ParseError },
    #[snafu(display("failed to build the HTTP client"))]
    Client { source: reqwest::Error },
    #[snafu(display("controller request failed"))]
    Request { source: reqwest::Error },
    #[snafu(display("failed to encode the request"))]
    Encode { source: serde_json::Error },
    #[snafu(display("controller refused node {node_id}: {status}"))]
    Refused {
        node_id: String,
        status: reqwest::StatusCode,
    },
}

/// Settings a controller imposes on a managed node.
///
/// Fields left `None` keep the local configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ManagedSettings {
    /// The public hostname of the node.
    pub hostname: Option<String>,
    /// The HTTPS listen address.
    pub addr: Option<SocketAddr>,
    /// The STUN port.
    pub stun_port: Option<u16>,
    /// Whether to relay.
    pub enable_relay: Option<bool>,
    /// Whether to answer STUN.
    pub enable_stun: Option<bool>,
    /// DNS provider for DNS-01 issuance.
    pub dns_provider: Option<String>,
    /// DNS provider account id.
    pub dns_id: Option<String>,
    /// DNS provider secret.
    pub dns_key: Option<String>,
    /// IPv4 address published for the hostname.
    pub set_ipv4: Option<Ipv4Addr>,
    /// IPv6 address published for the hostname.
    pub set_ipv6: Option<Ipv6Addr>,
}

/// The outcome of a successful bootstrap.
#[derive(Debug, Default)]
pub struct Bootstrap {
    /// Overrides of the local configuration.
    pub settings: ManagedSettings,
    /// A job running as long as the epoch, stopped by dropping it.
    pub housekeeping: Option<AbortOnDropHandle<()>>,
}

/// The fleet controller a managed node registers with.
#[async_trait]
pub trait FleetController: Send + Sync + fmt::Debug + 'static {
    /// Registers the node, returning its settings for this epoch.
    async fn bootstrap(&self, identity: &ServerIdentity) -> Result<Bootstrap, ControllerError>;
}

/// A [`FleetController`] reached over HTTPS.
///
/// Requests are JSON bodies signed with the control key, the signature is sent in
/// [`SIGNATURE_HEADER`].
#[derive(Debug, Clone)]
pub struct HttpController {
    client: reqwest::Client,
    base: Url,
    node_id: String,
    heartbeat_interval: Duration,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct NodeRequest<'a> {
    node_id: &'a str,
    node_key: String,
    control_key: String,
    timestamp: i64,
}

impl HttpController {
    /// Creates a controller client for `node_id` at `url`.
    pub fn new(url: &str, node_id: &str) -> Result<Self, ControllerError> {
        let mut base = Url::parse(url).context(InvalidUrlSnafu)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let client = reqwest::Client::builder()
            .timeout(HTTP_API_TIMEOUT)
            .build()
            .context(ClientSnafu)?;
        Ok(Self {
            client,
            base,
            node_id: node_id.to_string(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        })
    }

    /// Sets the heartbeat interval.
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    fn endpoint(&self, action: &str) -> Result<Url, ControllerError> {
        self.base
            .join(&format!("navi/{}/{action}", self.node_id))
            .context(InvalidUrlSnafu)
    }

    async fn post(
        &self,
        action: &str,
        identity: &ServerIdentity,
    ) -> Result<reqwest::Response, ControllerError> {
        let body = serde_json::to_vec(&NodeRequest {
            node_id: &self.node_id,
            node_key: public_hex(identity.node_key()),
            control_key: public_hex(identity.control_key()),
            timestamp: time::OffsetDateTime::now_utc().unix_timestamp(),
        })
        .context(EncodeSnafu)?;
        let signature = identity.control_key().sign(&body);
        let response = self
            .client
            .post(self.endpoint(action)?)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(
                SIGNATURE_HEADER,
                data_encoding::HEXLOWER.encode(&signature.to_bytes()),
            )
            .body(body)
            .send()
            .await
            .context(RequestSnafu)?;
        let status = response.status();
        snafu::ensure!(
            status.is_success(),
            RefusedSnafu {
                node_id: &self.node_id,
                status
            }
        );
        Ok(response)
    }

    fn spawn_heartbeat(&self, identity: ServerIdentity) -> AbortOnDropHandle<()> {
        let this = self.clone();
        let task = tokio::spawn(
            async move {
                let period = this.heartbeat_interval;
                let mut ticker =
                    tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                loop {
                    ticker.tick().await;
                    match this.post("heartbeat", &identity).await {
                        Ok(_) => debug!("heartbeat sent"),
                        Err(err) => warn!("heartbeat failed: {err:#}"),
                    }
                }
            }
            .instrument(info_span!("heartbeat", node_id = %self.node_id)),
        );
        AbortOnDropHandle::new(task)
    }
}

#[async_trait]
impl FleetController for HttpController {
    async fn bootstrap(&self, identity: &ServerIdentity) -> Result<Bootstrap, ControllerError> {
        let settings: ManagedSettings = self
            .post("bootstrap", identity)
            .await?
            .json()
            .await
            .context(RequestSnafu)?;
        info!(node_id = %self.node_id, ?settings.hostname, "bootstrapped with the controller");
        Ok(Bootstrap {
            settings,
            housekeeping: Some(self.spawn_heartbeat(identity.clone())),
        })
    }
}

#[cfg(test)]
mod tests {
    use n0_snafu::{Result, ResultExt};

    use super::*;

    #[test]
    fn test_endpoint() -> Result {
        let controller = HttpController::new("https://ctrl.example.com/api", "relay-eu")?;
        assert_eq!(
            controller.endpoint("bootstrap")?.as_str(),
            "https://ctrl.example.com/api/navi/relay-eu/bootstrap"
        );
        let controller = HttpController::new("https://ctrl.example.com", "n1")?;
        assert_eq!(
            controller.endpoint("heartbeat")?.as_str(),
            "https://ctrl.example.com/navi/n1/heartbeat"
        );
        assert!(HttpController::new("not a url", "n1").is_err());
        Ok(())
    }

    #[test]
    fn test_settings_partial() -> Result {
        let settings: ManagedSettings = serde_json::from_str(
            r#"{"hostname":"relay.example.com","stunPort":3479,"setIpv4":"203.0.113.7"}"#,
        )
        .e()?;
        assert_eq!(settings.hostname.as_deref(), Some("relay.example.com"));
        assert_eq!(settings.stun_port, Some(3479));
        assert_eq!(settings.set_ipv4, Some(Ipv4Addr::new(203, 0, 113, 7)));
        assert_eq!(settings.addr, None);
        assert_eq!(settings.enable_relay, None);
        Ok(())
    }
}
