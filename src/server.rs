//! One listener epoch of the relay node: STUN, HTTPS and the captive portal.
//!
//! This code is fully written in a form of structured-concurrency: every spawned task is
//! always attached to a handle and when the handle is dropped the tasks abort.  A [`Server`]
//! is started from a [`BindPermit`] and only hands the permit for the next epoch back from
//! [`Server::shutdown`], once every socket of this epoch is closed.
//!
//! The server hosts the following services:
//!
//! - HTTPS `/derp`: The endpoint relay clients upgrade on, served by the relay engine.
//! - HTTPS `/derp/probe`: Used for latency probes.
//! - HTTP(S) `/generate_204`: Used for captive portal detection.
//! - STUN: UDP port for STUN requests/responses.

use std::{io, net::SocketAddr, sync::Arc};

use nested_enum_utils::common_fields;
use snafu::{Backtrace, ResultExt, Snafu};
use time::OffsetDateTime;
use tokio::{
    net::{TcpListener, UdpSocket},
    task::JoinSet,
};
use tokio_util::{sync::CancellationToken, task::AbortOnDropHandle};
use tracing::{Instrument, debug, error, info, info_span, instrument};

use crate::{cert::ManagedCertificate, relay::RelayService, supervisor::BindPermit};

mod http_server;
pub mod listener;
mod metrics;
mod stun;

pub use self::{
    listener::{Listener, RateBudget, RateBudgetError, RateLimitedListener},
    metrics::{AcceptMetrics, Metrics, StunMetrics, TlsMetrics},
};
use self::http_server::{CaptivePortalService, HttpService};

/// TLS settings of the HTTPS listener.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// The rustls configuration, built once per epoch.
    pub server_config: Arc<rustls::ServerConfig>,
    /// Expiry of the served leaf certificate.
    pub not_after: OffsetDateTime,
}

impl TlsConfig {
    /// Serves `certificate` followed by the relay meta certificate.
    pub fn new(
        certificate: &ManagedCertificate,
        relay: &RelayService,
    ) -> Result<Self, crate::cert::CertError> {
        Ok(Self {
            server_config: certificate.server_config(relay.meta_cert())?,
            not_after: certificate.not_after(),
        })
    }
}

/// Configuration of one listener epoch.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket the HTTPS server binds.
    pub https_bind_addr: SocketAddr,
    /// TLS settings of the HTTPS server.
    pub tls: TlsConfig,
    /// Socket of the plain-HTTP captive portal service, disabled if `None`.
    pub http_bind_addr: Option<SocketAddr>,
    /// Socket of the STUN responder, disabled if `None`.
    pub stun_bind_addr: Option<SocketAddr>,
    /// Whether `/derp` upgrades are handed to the relay engine.
    pub enable_relay: bool,
    /// Admission budget of the HTTPS listener.
    pub accept_budget: RateBudget,
}

/// Failures starting a listener epoch.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum SpawnError {
    #[snafu(display("certificate expired at {not_after}"))]
    CertificateExpired { not_after: OffsetDateTime },
    #[snafu(display("failed to bind STUN listener on {addr}"))]
    BindUdp { addr: SocketAddr, source: io::Error },
    #[snafu(display("failed to bind TCP listener on {addr}"))]
    BindTcp { addr: SocketAddr, source: io::Error },
    #[snafu(display("no local address"))]
    NoLocalAddr { source: io::Error },
}

/// Failures of a running listener epoch.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ServeError {
    #[snafu(display("server task exited unexpectedly"))]
    UnexpectedExit {},
    #[snafu(display("server task failed"))]
    TaskFailed { source: tokio::task::JoinError },
    #[snafu(display("failed to accept connections on {addr}"))]
    Accept { addr: SocketAddr, source: io::Error },
}

/// A running listener epoch.
///
/// Dropping this will stop the server, but only [`Server::shutdown`] returns the
/// [`BindPermit`] of the next epoch.
#[derive(Debug)]
pub struct Server {
    epoch: u64,
    /// The address of the HTTPS server.
    https_addr: SocketAddr,
    /// The address of the captive portal HTTP server, if configured.
    http_addr: Option<SocketAddr>,
    /// The address of the STUN server, if configured.
    stun_addr: Option<SocketAddr>,
    cancel: CancellationToken,
    /// The main task running the server.
    supervisor: AbortOnDropHandle<Result<(), ServeError>>,
}

impl Server {
    /// Binds all sockets of the epoch `permit` is for and starts serving.
    ///
    /// Fails without binding anything when the certificate has already expired.
    pub async fn spawn(
        permit: BindPermit,
        config: ServerConfig,
        relay: &RelayService,
        metrics: &Metrics,
    ) -> Result<Self, SpawnError> {
        let now = OffsetDateTime::now_utc();
        snafu::ensure!(
            config.tls.not_after > now,
            CertificateExpiredSnafu {
                not_after: config.tls.not_after
            }
        );

        let epoch = permit.epoch();
        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();

        // Start the STUN server.
        let stun_addr = match config.stun_bind_addr {
            Some(addr) => {
                debug!("Starting STUN server");
                let sock = UdpSocket::bind(addr).await.context(BindUdpSnafu { addr })?;
                let addr = sock.local_addr().context(NoLocalAddrSnafu)?;
                info!("STUN server listening on {addr}");
                let stun_metrics = metrics.stun.clone();
                let cancel = cancel.clone();
                tasks.spawn(
                    async move {
                        stun::serve(sock, stun_metrics, cancel).await;
                        Ok(())
                    }
                    .instrument(info_span!("stun-server", %addr)),
                );
                Some(addr)
            }
            None => None,
        };

        // Start the HTTPS server.
        let addr = config.https_bind_addr;
        let tcp = TcpListener::bind(addr).await.context(BindTcpSnafu { addr })?;
        let https_addr = tcp.local_addr().context(NoLocalAddrSnafu)?;
        let listener = RateLimitedListener::new(tcp, config.accept_budget, metrics.accept.clone());
        let acceptor = tokio_rustls::TlsAcceptor::from(config.tls.server_config.clone());
        let service = HttpService::new(config.enable_relay.then(|| relay.clone()));
        let tls_metrics = metrics.tls.clone();
        info!(
            relay = config.enable_relay,
            budget = ?config.accept_budget,
            "[HTTPS] relay: serving on {https_addr}"
        );
        let https_loop =
            http_server::accept_loop(listener, cancel.clone(), move |stream, peer_addr| {
                service.clone().handle_tls_connection(
                    stream,
                    peer_addr,
                    acceptor.clone(),
                    tls_metrics.clone(),
                )
            });
        tasks.spawn(
            async move { https_loop.await.context(AcceptSnafu { addr: https_addr }) }
                .instrument(info_span!("relay-http-serve", addr = %https_addr)),
        );

        // Some services always need to be served over HTTP without TLS.  Run these
        // standalone.
        let http_addr = match config.http_bind_addr {
            Some(addr) => {
                let tcp = TcpListener::bind(addr).await.context(BindTcpSnafu { addr })?;
                let addr = tcp.local_addr().context(NoLocalAddrSnafu)?;
                info!("[HTTP] captive portal: serving on {addr}");
                let portal_loop =
                    http_server::accept_loop(tcp, cancel.clone(), |stream, _peer_addr| {
                        CaptivePortalService.handle_connection(stream)
                    });
                tasks.spawn(
                    async move { portal_loop.await.context(AcceptSnafu { addr }) }
                        .instrument(info_span!("captive-portal", %addr)),
                );
                Some(addr)
            }
            None => None,
        };

        let task = tokio::spawn(server_supervisor(tasks, cancel.clone()));

        Ok(Self {
            epoch,
            https_addr,
            http_addr,
            stun_addr,
            cancel,
            supervisor: AbortOnDropHandle::new(task),
        })
    }

    /// Requests graceful shutdown.
    ///
    /// Returns once all server tasks have stopped and every socket of this epoch is
    /// closed.  Relay connections already handed to the engine are not affected.
    pub async fn shutdown(self) -> Result<BindPermit, ServeError> {
        let Self {
            epoch,
            cancel,
            supervisor,
            ..
        } = self;
        cancel.cancel();
        supervisor.await.context(TaskFailedSnafu)??;
        debug!(epoch, "server stopped");
        Ok(BindPermit::new(epoch + 1))
    }

    /// Returns the handle for the task.
    ///
    /// This allows waiting for the server's supervisor task to finish.  It only finishes
    /// on its own when one of the epoch's tasks stopped unexpectedly.
    pub fn task_handle(&mut self) -> &mut AbortOnDropHandle<Result<(), ServeError>> {
        &mut self.supervisor
    }

    /// The epoch this server was started for.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// The socket address the HTTPS server is listening on.
    pub fn https_addr(&self) -> SocketAddr {
        self.https_addr
    }

    /// The socket address the captive portal is listening on.
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_addr
    }

    /// The socket address the STUN server is listening on.
    pub fn stun_addr(&self) -> Option<SocketAddr> {
        self.stun_addr
    }
}

/// Supervisor for the epoch's tasks.
///
/// As soon as one of the tasks exits, all other tasks are stopped and the server stops.
/// The supervisor finishes once all tasks are finished.
#[instrument(skip_all)]
async fn server_supervisor(
    mut tasks: JoinSet<Result<(), ServeError>>,
    cancel: CancellationToken,
) -> Result<(), ServeError> {
    let res = match tasks.join_next().await {
        Some(Ok(Ok(()))) if cancel.is_cancelled() => {
            debug!("Task exited");
            Ok(())
        }
        Some(Ok(Ok(()))) | None => {
            error!("Task exited unexpectedly");
            Err(UnexpectedExitSnafu.build())
        }
        Some(Ok(Err(err))) => {
            error!("Task failed: {err:#}");
            Err(err)
        }
        Some(Err(err)) => {
            if err.is_panic() {
                error!("Task panicked");
            } else {
                debug!("Task cancelled");
            }
            Err(err).context(TaskFailedSnafu)
        }
    };

    // Stop the remaining tasks, each of them drops its socket on the way out.
    cancel.cancel();
    while let Some(res) = tasks.join_next().await {
        match res {
            Err(err) if err.is_panic() => error!("Task panicked during shutdown: {err:#?}"),
            Ok(Err(err)) => debug!("Task failed during shutdown: {err:#}"),
            _ => {}
        }
    }

    res
}

#[cfg(test)]
mod tests {
    use std::{net::Ipv4Addr, time::Duration};

    use ed25519_dalek::SigningKey;
    use http::StatusCode;
    use n0_snafu::{Result, ResultExt};
    use rand::rngs::OsRng;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tracing_test::traced_test;

    use super::{
        http_server::{NO_CONTENT_CHALLENGE_HEADER, NO_CONTENT_RESPONSE_HEADER},
        *,
    };
    use crate::relay::{LoopbackEngine, RELAY_UPGRADE_PROTOCOL};

    fn local_relay() -> RelayService {
        RelayService::new(Arc::new(LoopbackEngine), &SigningKey::generate(&mut OsRng)).unwrap()
    }

    fn local_config(relay: &RelayService, https_port: u16) -> Result<ServerConfig> {
        let cert = ManagedCertificate::self_signed("localhost")?;
        Ok(ServerConfig {
            https_bind_addr: (Ipv4Addr::LOCALHOST, https_port).into(),
            tls: TlsConfig::new(&cert, relay)?,
            http_bind_addr: Some((Ipv4Addr::LOCALHOST, 0).into()),
            stun_bind_addr: Some((Ipv4Addr::LOCALHOST, 0).into()),
            enable_relay: true,
            accept_budget: RateBudget::unlimited(),
        })
    }

    fn https_client() -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .e()
    }

    #[tokio::test]
    #[traced_test]
    async fn test_expired_certificate_is_rejected() -> Result {
        let relay = local_relay();
        let expired = ManagedCertificate::self_signed_until(
            "localhost",
            OffsetDateTime::now_utc() - time::Duration::days(1),
        )?;
        let mut config = local_config(&relay, 0)?;
        config.tls = TlsConfig::new(&expired, &relay)?;

        let err = Server::spawn(BindPermit::new(0), config, &relay, &Metrics::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SpawnError::CertificateExpired { .. }));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn test_https_routes() -> Result {
        let relay = local_relay();
        let metrics = Metrics::default();
        let server = Server::spawn(
            BindPermit::new(0),
            local_config(&relay, 0)?,
            &relay,
            &metrics,
        )
        .await?;
        let base = format!("https://localhost:{}", server.https_addr().port());
        let client = https_client()?;

        let response = client.get(format!("{base}/")).send().await.e()?;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(
            response
                .headers()
                .contains_key("strict-transport-security")
        );
        assert!(response.text().await.e()?.contains("Navi"));

        let response = client.get(format!("{base}/derp/probe")).send().await.e()?;
        assert_eq!(response.status(), StatusCode::OK);
        let response = client.post(format!("{base}/derp/probe")).send().await.e()?;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

        let response = client.get(format!("{base}/robots.txt")).send().await.e()?;
        assert_eq!(response.text().await.e()?, "User-agent: *\nDisallow: /\n");

        let response = client.get(format!("{base}/nope")).send().await.e()?;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        assert!(metrics.tls.requests_v13.get() >= 1);
        assert_eq!(metrics.accept.rejected.get(), 0);

        server.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn test_relay_disabled() -> Result {
        let relay = local_relay();
        let mut config = local_config(&relay, 0)?;
        config.enable_relay = false;
        let server = Server::spawn(BindPermit::new(0), config, &relay, &Metrics::default()).await?;

        let url = format!("https://localhost:{}/derp", server.https_addr().port());
        let response = https_client()?
            .get(url)
            .header(http::header::UPGRADE, RELAY_UPGRADE_PROTOCOL)
            .send()
            .await
            .e()?;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.text().await.e()?, "relay server disabled");
        server.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn test_captive_portal_service() -> Result {
        let relay = local_relay();
        let server = Server::spawn(
            BindPermit::new(0),
            local_config(&relay, 0)?,
            &relay,
            &Metrics::default(),
        )
        .await?;
        let url = format!("http://{}/generate_204", server.http_addr().context("no http")?);
        let challenge = "123az__.";

        let response = reqwest::Client::new()
            .get(&url)
            .header(NO_CONTENT_CHALLENGE_HEADER, challenge)
            .send()
            .await
            .e()?;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let header = response
            .headers()
            .get(NO_CONTENT_RESPONSE_HEADER)
            .context("no response header")?;
        assert_eq!(header.to_str().e()?, format!("response {challenge}"));
        assert!(response.text().await.e()?.is_empty());
        server.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn test_shutdown_closes_sockets() -> Result {
        let relay = local_relay();
        let server = Server::spawn(
            BindPermit::new(7),
            local_config(&relay, 0)?,
            &relay,
            &Metrics::default(),
        )
        .await?;
        let https_addr = server.https_addr();
        let stun_addr = server.stun_addr().context("no stun")?;

        let permit = server.shutdown().await?;
        assert_eq!(permit.epoch(), 8);

        // every address of the stopped epoch can be bound again right away
        let _tcp = TcpListener::bind(https_addr).await.e()?;
        let _udp = UdpSocket::bind(stun_addr).await.e()?;
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn test_relay_connection_outlives_epoch() -> Result {
        let relay = local_relay();
        let metrics = Metrics::default();
        let server = Server::spawn(
            BindPermit::new(0),
            local_config(&relay, 0)?,
            &relay,
            &metrics,
        )
        .await?;
        let port = server.https_addr().port();

        let response = https_client()?
            .get(format!("https://localhost:{port}/derp"))
            .header(http::header::UPGRADE, RELAY_UPGRADE_PROTOCOL)
            .header(http::header::CONNECTION, "Upgrade")
            .send()
            .await
            .e()?;
        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(
            response
                .headers()
                .get(crate::relay::PUBLIC_KEY_HEADER)
                .context("no key header")?
                .to_str()
                .e()?,
            relay.public_key_hex()
        );
        let mut conn = response.upgrade().await.e()?;

        let permit = server.shutdown().await?;
        let server = Server::spawn(permit, local_config(&relay, port)?, &relay, &metrics).await?;
        assert_eq!(server.https_addr().port(), port);

        // the loopback engine still echoes on the connection from the first epoch
        conn.write_all(b"ping").await.e()?;
        let mut buf = [0u8; 4];
        tokio::time::timeout(Duration::from_secs(5), conn.read_exact(&mut buf))
            .await
            .context("no echo")?
            .e()?;
        assert_eq!(&buf, b"ping");
        assert_eq!(relay.connection_count(), 1);

        server.shutdown().await?;
        Ok(())
    }
}
