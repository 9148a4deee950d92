//! Stream listeners and the accept rate limiter.
//!
//! [`RateLimitedListener`] wraps any [`Listener`] and applies a token-bucket admission
//! policy on new connections.  It always accepts first, so the kernel backlog stays short,
//! and immediately closes connections exceeding the budget instead of leaving them queued.

use std::{
    future::Future,
    io,
    net::SocketAddr,
    num::NonZeroU32,
    sync::Arc,
    time::Duration,
};

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use nested_enum_utils::common_fields;
use snafu::{Backtrace, Snafu};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::metrics::AcceptMetrics;

/// A source of incoming stream connections.
pub trait Listener: Send + 'static {
    /// The connection type produced by this listener.
    type Conn: Send + 'static;

    /// Waits for the next incoming connection.
    fn accept(&mut self) -> impl Future<Output = io::Result<(Self::Conn, SocketAddr)>> + Send;

    /// The local address this listener is bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl Listener for TcpListener {
    type Conn = TcpStream;

    fn accept(&mut self) -> impl Future<Output = io::Result<(Self::Conn, SocketAddr)>> + Send {
        TcpListener::accept(&*self)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// Invalid token-bucket parameters.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum RateBudgetError {
    #[snafu(display("accept burst must be at least 1"))]
    ZeroBurst {},
    #[snafu(display("accept burst {burst} is too large"))]
    BurstTooLarge { burst: usize },
    #[snafu(display("accept rate {rate}/s is too low"))]
    RateTooLow { rate: f64 },
}

/// Token-bucket parameters for accepting connections.
///
/// Immutable once constructed.  The unlimited budget never rejects a connection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateBudget {
    /// Connections per second and the bucket size, `None` when unlimited.
    limit: Option<(f64, NonZeroU32)>,
}

impl RateBudget {
    /// A budget which accepts every connection.
    pub const fn unlimited() -> Self {
        Self { limit: None }
    }

    /// Creates a budget of `rate` connections per second with a bucket of `burst`.
    ///
    /// A missing, infinite or non-positive `rate` is unlimited.  A rate so low that one
    /// connection per period does not fit a [`Duration`] is an error.  Without a `burst` the
    /// bucket holds one second worth of connections, but at least one.
    pub fn new(rate: Option<f64>, burst: Option<usize>) -> Result<Self, RateBudgetError> {
        let Some(rate) = rate.filter(|rate| rate.is_finite() && *rate > 0.0) else {
            return Ok(Self::unlimited());
        };
        snafu::ensure!(
            Duration::try_from_secs_f64(1.0 / rate).is_ok(),
            RateTooLowSnafu { rate }
        );
        let burst = burst.unwrap_or_else(|| (rate.ceil() as usize).max(1));
        snafu::ensure!(burst > 0, ZeroBurstSnafu);
        let burst = u32::try_from(burst)
            .ok()
            .and_then(NonZeroU32::new)
            .ok_or_else(|| BurstTooLargeSnafu { burst }.build())?;
        Ok(Self {
            limit: Some((rate, burst)),
        })
    }

    /// Whether this budget ever rejects connections.
    pub fn is_unlimited(&self) -> bool {
        self.limit.is_none()
    }

    fn limiter(&self) -> Option<DefaultDirectRateLimiter> {
        let (rate, burst) = self.limit?;
        // A period too small to be represented can not be limited in practice.
        let period = Duration::try_from_secs_f64(1.0 / rate).ok()?;
        let quota = Quota::with_period(period)?.allow_burst(burst);
        Some(RateLimiter::direct(quota))
    }
}

impl Default for RateBudget {
    fn default() -> Self {
        Self::unlimited()
    }
}

/// A [`Listener`] closing connections which exceed a [`RateBudget`].
#[derive(derive_more::Debug)]
pub struct RateLimitedListener<L> {
    #[debug(skip)]
    inner: L,
    budget: RateBudget,
    #[debug(skip)]
    limiter: Option<DefaultDirectRateLimiter>,
    metrics: Arc<AcceptMetrics>,
    closed: CancellationToken,
}

impl<L: Listener> RateLimitedListener<L> {
    /// Wraps `inner`, admitting connections within `budget`.
    pub fn new(inner: L, budget: RateBudget, metrics: Arc<AcceptMetrics>) -> Self {
        Self {
            inner,
            limiter: budget.limiter(),
            budget,
            metrics,
            closed: CancellationToken::new(),
        }
    }

    /// Accepts the next connection within the budget.
    ///
    /// Connections over budget are dropped right away and the next connection is awaited.
    /// After [`Self::close`] this fails with [`io::ErrorKind::NotConnected`].
    pub async fn accept(&mut self) -> io::Result<(L::Conn, SocketAddr)> {
        loop {
            let (conn, peer_addr) = tokio::select! {
                biased;
                _ = self.closed.cancelled() => {
                    return Err(io::Error::new(io::ErrorKind::NotConnected, "listener closed"));
                }
                res = self.inner.accept() => res?,
            };
            let admitted = match self.limiter {
                Some(ref limiter) => limiter.check().is_ok(),
                None => true,
            };
            if admitted {
                self.metrics.accepted.inc();
                trace!(%peer_addr, "connection accepted");
                return Ok((conn, peer_addr));
            }
            self.metrics.rejected.inc();
            debug!(%peer_addr, "accept rate exceeded, closing connection");
            drop(conn);
        }
    }

    /// The budget this listener admits connections with.
    pub fn budget(&self) -> RateBudget {
        self.budget
    }

    /// Closes the listener.  Calling this more than once has no further effect.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Returns a token which closes this listener when cancelled.
    pub fn close_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Whether [`Self::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl<L: Listener> Listener for RateLimitedListener<L> {
    type Conn = L::Conn;

    fn accept(&mut self) -> impl Future<Output = io::Result<(Self::Conn, SocketAddr)>> + Send {
        RateLimitedListener::accept(self)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}
