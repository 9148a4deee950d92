//! The seam between the listener control plane and the message-relay engine.
//!
//! The engine multiplexing relayed packets between peers lives outside of this crate and is
//! plugged in through [`RelayEngine`].  [`RelayService`] owns the engine for the whole
//! process lifetime: it outlives every listener epoch, so connections handed to the engine
//! are never torn down by a certificate rotation.

use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use hyper::upgrade::{OnUpgrade, Upgraded};
use hyper_util::rt::TokioIo;
use nested_enum_utils::common_fields;
use rustls::pki_types::CertificateDer;
use snafu::{Backtrace, ResultExt, Snafu};
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, info_span, warn};

/// The HTTP path relay clients upgrade on.
pub const RELAY_PATH: &str = "/derp";
/// The value of the `Upgrade` header relay clients send.
pub const RELAY_UPGRADE_PROTOCOL: &str = "DERP";
/// The relay protocol version announced in the upgrade response.
pub const RELAY_PROTOCOL_VERSION: u8 = 2;
/// Response header carrying [`RELAY_PROTOCOL_VERSION`].
pub const VERSION_HEADER: &str = "Derp-Version";
/// Response header carrying the hex encoded node public key.
pub const PUBLIC_KEY_HEADER: &str = "Derp-Public-Key";
/// Common name prefix of the meta certificate.
const META_CERT_CN_PREFIX: &str = "derpkey";

/// A client connection after the HTTP upgrade, owned by the relay engine.
#[derive(derive_more::Debug)]
pub struct RelayConnection {
    /// The upgraded byte stream.
    #[debug("TokioIo<Upgraded>")]
    pub io: TokioIo<Upgraded>,
    /// The remote address of the TCP connection.
    pub peer_addr: SocketAddr,
}

/// The message-relay engine.
///
/// Peer authentication and any allow or deny decisions about clients belong to the engine.
#[async_trait]
pub trait RelayEngine: Send + Sync + std::fmt::Debug + 'static {
    /// Hands the node's private key to the engine, once, before any connection.
    fn start(&self, _node_key: &SigningKey) {}

    /// Serves a single upgraded client connection until it is done.
    async fn serve(&self, conn: RelayConnection);
}

/// A [`RelayEngine`] echoing every byte back to its sender.
///
/// Useful for smoke-testing a deployment where no real engine is linked in.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoopbackEngine;

#[async_trait]
impl RelayEngine for LoopbackEngine {
    async fn serve(&self, conn: RelayConnection) {
        let (mut reader, mut writer) = tokio::io::split(conn.io);
        match tokio::io::copy(&mut reader, &mut writer).await {
            Ok(n) => debug!(peer = %conn.peer_addr, "loopback connection done after {n} bytes"),
            Err(err) => debug!(peer = %conn.peer_addr, "loopback connection failed: {err:#}"),
        }
    }
}

/// Failures creating the [`RelayService`].
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum RelayError {
    #[snafu(display("failed to create the meta certificate"))]
    MetaCert { source: rcgen::Error },
}

/// Process-wide handle on the relay engine.
///
/// Cheap to clone.
#[derive(Debug, Clone)]
pub struct RelayService(Arc<Inner>);

#[derive(derive_more::Debug)]
struct Inner {
    engine: Arc<dyn RelayEngine>,
    public_key: ed25519_dalek::VerifyingKey,
    #[debug(skip)]
    meta_cert: CertificateDer<'static>,
    connections: TaskTracker,
}

impl RelayService {
    /// Starts `engine` with `node_key` and prepares the meta certificate.
    pub fn new(engine: Arc<dyn RelayEngine>, node_key: &SigningKey) -> Result<Self, RelayError> {
        let public_key = node_key.verifying_key();
        let meta_cert = meta_certificate(&public_key).context(MetaCertSnafu)?;
        engine.start(node_key);
        Ok(Self(Arc::new(Inner {
            engine,
            public_key,
            meta_cert,
            connections: TaskTracker::new(),
        })))
    }

    /// The certificate appended to the served TLS chain, advertising the node key.
    pub fn meta_cert(&self) -> &CertificateDer<'static> {
        &self.0.meta_cert
    }

    /// The public half of the node key.
    pub fn public_key(&self) -> ed25519_dalek::VerifyingKey {
        self.0.public_key
    }

    /// The node public key as sent in [`PUBLIC_KEY_HEADER`].
    pub fn public_key_hex(&self) -> String {
        data_encoding::HEXLOWER.encode(self.0.public_key.as_bytes())
    }

    /// Number of connections currently held by the engine.
    pub fn connection_count(&self) -> usize {
        self.0.connections.len()
    }

    /// Hands a pending HTTP upgrade over to the engine.
    ///
    /// The task is not owned by any listener epoch.
    pub(crate) fn spawn_upgrade(&self, on_upgrade: OnUpgrade, peer_addr: SocketAddr) {
        let engine = self.0.engine.clone();
        self.0.connections.spawn(
            async move {
                match on_upgrade.await {
                    Ok(upgraded) => {
                        debug!("relay connection upgraded");
                        engine
                            .serve(RelayConnection {
                                io: TokioIo::new(upgraded),
                                peer_addr,
                            })
                            .await;
                        debug!("relay connection closed");
                    }
                    Err(err) => warn!("upgrade error: {err:#}"),
                }
            }
            .instrument(info_span!("relay-conn", peer = %peer_addr)),
        );
    }

    /// Stops accepting new connections and waits for the engine to finish the current ones.
    pub async fn shutdown(&self) {
        self.0.connections.close();
        self.0.connections.wait().await;
    }
}

/// Self-signed certificate with the node public key in its common name.
fn meta_certificate(
    public_key: &ed25519_dalek::VerifyingKey,
) -> Result<CertificateDer<'static>, rcgen::Error> {
    let key_pair = rcgen::KeyPair::generate()?;
    let mut params = rcgen::CertificateParams::new(Vec::<String>::new())?;
    let mut name = rcgen::DistinguishedName::new();
    name.push(
        rcgen::DnType::CommonName,
        format!(
            "{META_CERT_CN_PREFIX}{}",
            data_encoding::HEXLOWER.encode(public_key.as_bytes())
        ),
    );
    params.distinguished_name = name;
    params.serial_number = Some(rcgen::SerialNumber::from_slice(&[RELAY_PROTOCOL_VERSION]));
    let cert = params.self_signed(&key_pair)?;
    Ok(cert.der().clone())
}
