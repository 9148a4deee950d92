//! The lifecycle orchestrator.
//!
//! A [`Supervisor`] runs the relay node as a sequence of epochs.  Each epoch loads its
//! configuration and certificate through an [`EpochLoader`], starts a [`Server`] and serves
//! until a [`ControlEvent`] arrives:
//!
//! - [`ControlEvent::Terminate`] stops the server and ends [`Supervisor::run`].
//! - [`ControlEvent::Rotate`] stops the server and starts the next epoch in-process.
//!
//! The next epoch can only bind its sockets with the [`BindPermit`] returned by
//! [`Server::shutdown`] of the previous one, so two epochs never listen at the same time.
//! Relay connections are held by the [`RelayService`] and survive rotations.

use std::io;

use async_trait::async_trait;
use nested_enum_utils::common_fields;
use snafu::{Backtrace, ResultExt, Snafu};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio_util::task::AbortOnDropHandle;
use tracing::{Instrument, debug, info, info_span};

use crate::{
    cert::RenewalPolicy,
    relay::RelayService,
    server::{Metrics, ServeError, Server, ServerConfig, SpawnError},
};

/// The right to bind the sockets of one epoch.
///
/// Not `Clone`: the only way to get the permit of epoch `n + 1` is to shut down the server
/// of epoch `n`.
#[derive(Debug, PartialEq, Eq)]
pub struct BindPermit {
    epoch: u64,
}

impl BindPermit {
    pub(crate) fn new(epoch: u64) -> Self {
        Self { epoch }
    }

    /// The generation number of the epoch this permit is for.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

/// Why a rotation was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum RotateReason {
    /// The certificate is about to expire.
    #[display("certificate expiring")]
    CertificateExpiring,
    /// An operator asked for it.
    #[display("operator request")]
    Operator,
}

/// Requests to the [`Supervisor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    /// Stop serving and return from [`Supervisor::run`].
    Terminate,
    /// Rebuild the listener stack.
    Rotate {
        /// The epoch the request is about, `None` for the current one.
        ///
        /// Requests about an earlier epoch are ignored.
        epoch: Option<u64>,
        /// Why the rotation is wanted.
        reason: RotateReason,
    },
}

/// Everything one epoch runs with.
#[derive(Debug)]
pub struct EpochConfig {
    /// The listener configuration.
    pub server: ServerConfig,
    /// Watches the certificate expiry when set.
    pub renewal: Option<RenewalPolicy>,
    /// A background job living as long as the epoch.
    pub housekeeping: Option<AbortOnDropHandle<()>>,
}

/// Error type of [`EpochLoader::load`].
pub type LoadError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Produces the configuration of each epoch.
#[async_trait]
pub trait EpochLoader: Send + 'static {
    /// Loads the configuration of `epoch`, obtaining a current certificate.
    ///
    /// Called after the previous epoch has fully stopped.
    async fn load(&mut self, epoch: u64) -> Result<EpochConfig, LoadError>;
}

/// Failures ending [`Supervisor::run`].
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum SupervisorError {
    #[snafu(display("failed to load epoch {epoch}"))]
    Load { epoch: u64, source: LoadError },
    #[snafu(display("failed to start epoch {epoch}"))]
    Spawn { epoch: u64, source: SpawnError },
    #[snafu(display("server of epoch {epoch} failed"))]
    Serve { epoch: u64, source: ServeError },
    #[snafu(display("server of epoch {epoch} stopped unexpectedly"))]
    ServerStopped { epoch: u64 },
    #[snafu(display("server task of epoch {epoch} failed"))]
    ServerTask {
        epoch: u64,
        source: tokio::task::JoinError,
    },
    #[snafu(display("the supervisor is not running"))]
    Closed {},
}

/// Sends [`ControlEvent`]s to a [`Supervisor`].
#[derive(Debug, Clone)]
pub struct ControlHandle {
    tx: mpsc::UnboundedSender<ControlEvent>,
}

impl ControlHandle {
    /// Delivers `event`, failing once the supervisor is gone.
    pub fn send(&self, event: ControlEvent) -> Result<(), SupervisorError> {
        self.tx.send(event).map_err(|_| ClosedSnafu.build())
    }

    /// Asks for the listener stack to be rebuilt.
    pub fn request_rotation(&self) -> Result<(), SupervisorError> {
        self.send(ControlEvent::Rotate {
            epoch: None,
            reason: RotateReason::Operator,
        })
    }

    /// Asks the supervisor to stop.
    pub fn request_shutdown(&self) -> Result<(), SupervisorError> {
        self.send(ControlEvent::Terminate)
    }
}

/// Runs listener epochs until terminated.
#[derive(Debug)]
pub struct Supervisor<L> {
    loader: L,
    relay: RelayService,
    metrics: Metrics,
    control_tx: mpsc::UnboundedSender<ControlEvent>,
    control_rx: mpsc::UnboundedReceiver<ControlEvent>,
}

enum EpochEnd {
    Terminate,
    Rotate,
}

impl<L: EpochLoader> Supervisor<L> {
    /// Creates a supervisor for `relay`, counting into `metrics`.
    pub fn new(loader: L, relay: RelayService, metrics: Metrics) -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Self {
            loader,
            relay,
            metrics,
            control_tx,
            control_rx,
        }
    }

    /// A handle to control this supervisor.
    pub fn handle(&self) -> ControlHandle {
        ControlHandle {
            tx: self.control_tx.clone(),
        }
    }

    /// The metrics shared by all epochs.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Runs epochs until [`ControlEvent::Terminate`].
    ///
    /// Returns an error when an epoch can not be loaded or started, or when a running
    /// server fails on its own.
    pub async fn run(mut self) -> Result<(), SupervisorError> {
        let mut permit = BindPermit::new(0);
        loop {
            let epoch = permit.epoch();
            let (end, next) = self
                .run_epoch(permit)
                .instrument(info_span!("epoch", epoch))
                .await?;
            match end {
                EpochEnd::Terminate => {
                    info!(epoch, "terminated");
                    return Ok(());
                }
                EpochEnd::Rotate => permit = next,
            }
        }
    }

    async fn run_epoch(
        &mut self,
        permit: BindPermit,
    ) -> Result<(EpochEnd, BindPermit), SupervisorError> {
        let epoch = permit.epoch();
        let EpochConfig {
            server: config,
            renewal,
            housekeeping,
        } = self.loader.load(epoch).await.context(LoadSnafu { epoch })?;
        let not_after = config.tls.not_after;

        let mut server = Server::spawn(permit, config, &self.relay, &self.metrics)
            .await
            .context(SpawnSnafu { epoch })?;
        info!(https_addr = %server.https_addr(), %not_after, "epoch started");

        let monitor = renewal.map(|policy| {
            spawn_renewal_monitor(policy, not_after, epoch, self.handle())
        });

        let end = loop {
            tokio::select! {
                biased;
                event = self.control_rx.recv() => match event {
                    // the supervisor holds a sender, so the channel never closes
                    Some(ControlEvent::Terminate) | None => break EpochEnd::Terminate,
                    Some(ControlEvent::Rotate {
                        epoch: Some(requested),
                        reason,
                    }) if requested != epoch => {
                        debug!(
                            requested,
                            %reason,
                            "ignoring rotation request for an earlier epoch"
                        );
                    }
                    Some(ControlEvent::Rotate { reason, .. }) => {
                        info!(%reason, "rotating");
                        break EpochEnd::Rotate;
                    }
                },
                res = server.task_handle() => {
                    return match res {
                        Ok(Ok(())) => Err(ServerStoppedSnafu { epoch }.build()),
                        Ok(Err(err)) => Err(err).context(ServeSnafu { epoch }),
                        Err(err) => Err(err).context(ServerTaskSnafu { epoch }),
                    };
                }
            }
        };

        drop(monitor);
        drop(housekeeping);
        let next = server.shutdown().await.context(ServeSnafu { epoch })?;
        debug!("epoch stopped");
        Ok((end, next))
    }
}

/// Periodically compares the certificate expiry to the renewal threshold.
///
/// The first check happens one full interval after the start.  Once renewal is due a
/// single rotation for `epoch` is requested and the monitor ends.
fn spawn_renewal_monitor(
    policy: RenewalPolicy,
    not_after: OffsetDateTime,
    epoch: u64,
    control: ControlHandle,
) -> AbortOnDropHandle<()> {
    let task = tokio::spawn(
        async move {
            let period = policy.check_interval;
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let now = OffsetDateTime::now_utc();
                if policy.is_due(not_after, now) {
                    info!(%not_after, "certificate due for renewal, requesting rotation");
                    let event = ControlEvent::Rotate {
                        epoch: Some(epoch),
                        reason: RotateReason::CertificateExpiring,
                    };
                    if control.send(event).is_err() {
                        debug!("supervisor gone");
                    }
                    break;
                }
                debug!(remaining = %(not_after - now), "certificate still valid");
            }
        }
        .instrument(info_span!("renewal-monitor", epoch)),
    );
    AbortOnDropHandle::new(task)
}

/// Forwards process signals to `control`.
///
/// SIGINT, SIGTERM and SIGQUIT terminate, SIGUSR2 requests a rotation.  Elsewhere than unix
/// only ctrl-c is handled.
pub fn spawn_signal_listener(control: ControlHandle) -> io::Result<AbortOnDropHandle<()>> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let mut quit = signal(SignalKind::quit())?;
        let mut user2 = signal(SignalKind::user_defined2())?;
        let task = tokio::spawn(
            async move {
                loop {
                    let (name, event) = tokio::select! {
                        _ = interrupt.recv() => ("SIGINT", ControlEvent::Terminate),
                        _ = terminate.recv() => ("SIGTERM", ControlEvent::Terminate),
                        _ = quit.recv() => ("SIGQUIT", ControlEvent::Terminate),
                        _ = user2.recv() => ("SIGUSR2", ControlEvent::Rotate {
                            epoch: None,
                            reason: RotateReason::Operator,
                        }),
                    };
                    info!("received {name}");
                    if control.send(event).is_err() {
                        break;
                    }
                }
            }
            .instrument(info_span!("signals")),
        );
        Ok(AbortOnDropHandle::new(task))
    }
    #[cfg(not(unix))]
    {
        let task = tokio::spawn(
            async move {
                loop {
                    if let Err(err) = tokio::signal::ctrl_c().await {
                        tracing::warn!("failed to wait for ctrl-c: {err:#}");
                        break;
                    }
                    info!("received ctrl-c");
                    if control.send(ControlEvent::Terminate).is_err() {
                        break;
                    }
                }
            }
            .instrument(info_span!("signals")),
        );
        Ok(AbortOnDropHandle::new(task))
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::{Ipv4Addr, SocketAddr},
        sync::{Arc, Mutex},
        time::Duration,
    };

    use ed25519_dalek::SigningKey;
    use n0_snafu::{Result, ResultExt};
    use rand::rngs::OsRng;
    use tokio::sync::mpsc::UnboundedSender;
    use tracing_test::traced_test;

    use super::*;
    use crate::{
        cert::ManagedCertificate,
        relay::LoopbackEngine,
        server::{RateBudget, TlsConfig},
    };

    /// Hands out self-signed certificates, the first one expiring in `first_validity`.
    struct TestLoader {
        relay: RelayService,
        addr: SocketAddr,
        first_validity: time::Duration,
        renewal: Option<RenewalPolicy>,
        loads: Arc<Mutex<Vec<u64>>>,
        started: UnboundedSender<u64>,
    }

    #[async_trait]
    impl EpochLoader for TestLoader {
        async fn load(&mut self, epoch: u64) -> Result<EpochConfig, LoadError> {
            if epoch > 0 {
                // the previous epoch released the port before we are asked to load
                std::net::TcpListener::bind(self.addr)?;
            }
            self.loads.lock().unwrap().push(epoch);
            let validity = if epoch == 0 {
                self.first_validity
            } else {
                time::Duration::days(90)
            };
            let cert = ManagedCertificate::self_signed_until(
                "localhost",
                OffsetDateTime::now_utc() + validity,
            )?;
            let _ = self.started.send(epoch);
            Ok(EpochConfig {
                server: ServerConfig {
                    https_bind_addr: self.addr,
                    tls: TlsConfig::new(&cert, &self.relay)?,
                    http_bind_addr: None,
                    stun_bind_addr: None,
                    enable_relay: true,
                    accept_budget: RateBudget::unlimited(),
                },
                renewal: self.renewal,
                housekeeping: None,
            })
        }
    }

    fn free_addr() -> Result<SocketAddr> {
        let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).e()?;
        listener.local_addr().e()
    }

    struct Setup {
        supervisor: Supervisor<TestLoader>,
        loads: Arc<Mutex<Vec<u64>>>,
        started: mpsc::UnboundedReceiver<u64>,
    }

    fn setup(first_validity: time::Duration, renewal: Option<RenewalPolicy>) -> Result<Setup> {
        let relay = RelayService::new(Arc::new(LoopbackEngine), &SigningKey::generate(&mut OsRng))?;
        let loads = Arc::new(Mutex::new(Vec::new()));
        let (started_tx, started) = mpsc::unbounded_channel();
        let loader = TestLoader {
            relay: relay.clone(),
            addr: free_addr()?,
            first_validity,
            renewal,
            loads: loads.clone(),
            started: started_tx,
        };
        Ok(Setup {
            supervisor: Supervisor::new(loader, relay, Metrics::default()),
            loads,
            started,
        })
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_expiring_certificate_rotates_once() -> Result {
        let Setup {
            supervisor,
            loads,
            mut started,
        } = setup(time::Duration::days(3), Some(RenewalPolicy::default()))?;
        let control = supervisor.handle();
        let run = tokio::spawn(supervisor.run());

        assert_eq!(started.recv().await, Some(0));
        // the first check happens after one interval and finds 3 days < 7 days left
        assert_eq!(started.recv().await, Some(1));

        // the new certificate is valid for long enough, days of checks change nothing
        tokio::time::sleep(Duration::from_secs(3 * 24 * 60 * 60)).await;
        assert_eq!(*loads.lock().unwrap(), vec![0, 1]);

        control.request_shutdown()?;
        run.await.e()??;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_no_rotation_before_first_interval() -> Result {
        let Setup {
            supervisor,
            loads,
            mut started,
        } = setup(time::Duration::days(3), Some(RenewalPolicy::default()))?;
        let control = supervisor.handle();
        let run = tokio::spawn(supervisor.run());
        assert_eq!(started.recv().await, Some(0));

        tokio::time::sleep(RenewalPolicy::default().check_interval - Duration::from_secs(1)).await;
        assert_eq!(*loads.lock().unwrap(), vec![0]);

        control.request_shutdown()?;
        run.await.e()??;
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn test_operator_rotation_and_stale_requests() -> Result {
        let Setup {
            supervisor,
            loads,
            mut started,
        } = setup(time::Duration::days(90), None)?;
        let control = supervisor.handle();
        let run = tokio::spawn(supervisor.run());
        assert_eq!(started.recv().await, Some(0));

        control.request_rotation()?;
        assert_eq!(started.recv().await, Some(1));

        // a request about epoch 0 arriving during epoch 1 is stale
        control.send(ControlEvent::Rotate {
            epoch: Some(0),
            reason: RotateReason::CertificateExpiring,
        })?;
        control.send(ControlEvent::Rotate {
            epoch: Some(1),
            reason: RotateReason::CertificateExpiring,
        })?;
        assert_eq!(started.recv().await, Some(2));

        control.request_shutdown()?;
        run.await.e()??;
        assert_eq!(*loads.lock().unwrap(), vec![0, 1, 2]);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn test_load_failure_ends_run() -> Result {
        struct FailingLoader;

        #[async_trait]
        impl EpochLoader for FailingLoader {
            async fn load(&mut self, _epoch: u64) -> Result<EpochConfig, LoadError> {
                Err("no certificate".into())
            }
        }

        let relay = RelayService::new(Arc::new(LoopbackEngine), &SigningKey::generate(&mut OsRng))?;
        let supervisor = Supervisor::new(FailingLoader, relay, Metrics::default());
        let err = supervisor.run().await.unwrap_err();
        assert!(matches!(err, SupervisorError::Load { epoch: 0, .. }));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn test_handle_after_supervisor_gone() -> Result {
        let Setup { supervisor, .. } = setup(time::Duration::days(90), None)?;
        let control = supervisor.handle();
        drop(supervisor);
        assert!(control.request_rotation().is_err());
        Ok(())
    }
}
