use std::sync::Arc;

use iroh_metrics::{Counter, Gauge, MetricsGroup, MetricsGroupSet};

/// Metrics tracked for the STUN responder.
#[derive(Debug, Default, MetricsGroup)]
#[metrics(name = "stun")]
pub struct StunMetrics {
    /// Failed reads from the UDP socket.
    #[metrics(help = "Number of failed reads from the STUN socket.")]
    pub read_errors: Counter,
    /// Datagrams that were not binding requests.
    #[metrics(help = "Number of packets that are not STUN binding requests.")]
    pub not_stun: Counter,
    /// Responses that could not be sent.
    #[metrics(help = "Number of STUN responses that failed to send.")]
    pub write_errors: Counter,
    /// Responses sent in full.
    #[metrics(help = "Number of successful STUN responses.")]
    pub success: Counter,
    /// Binding requests received from IPv4 addresses.
    #[metrics(help = "Number of STUN requests over IPv4.")]
    pub ipv4: Counter,
    /// Binding requests received from IPv6 addresses.
    #[metrics(help = "Number of STUN requests over IPv6.")]
    pub ipv6: Counter,
}

/// Metrics tracked by the rate-limited accept loop.
#[derive(Debug, Default, MetricsGroup)]
#[metrics(name = "accept")]
pub struct AcceptMetrics {
    /// Connections handed on to the TLS layer.
    #[metrics(help = "Number of connections accepted within the rate limit.")]
    pub accepted: Counter,
    /// Connections closed right after accept because the budget was exhausted.
    #[metrics(help = "Number of connections closed because of the rate limit.")]
    pub rejected: Counter,
}

/// Metrics about the TLS connections of the HTTPS server.
#[derive(Debug, Default, MetricsGroup)]
#[metrics(name = "tls")]
pub struct TlsMetrics {
    /// Handshakes that failed or timed out.
    #[metrics(help = "Number of failed TLS handshakes.")]
    pub handshake_errors: Counter,
    /// Connections negotiated with TLS 1.2.
    #[metrics(help = "Number of connections negotiated with TLS 1.2.")]
    pub requests_v12: Counter,
    /// Connections negotiated with TLS 1.3.
    #[metrics(help = "Number of connections negotiated with TLS 1.3.")]
    pub requests_v13: Counter,
    /// Currently open TLS 1.2 connections.
    #[metrics(help = "Number of open TLS 1.2 connections.")]
    pub active_v12: Gauge,
    /// Currently open TLS 1.3 connections.
    #[metrics(help = "Number of open TLS 1.3 connections.")]
    pub active_v13: Gauge,
    /// Number of connections upgraded to the relay protocol.
    pub relay_accepts: Counter,
}

/// All metrics tracked by the relay node.
///
/// Created once per process and handed to every epoch, so counters keep increasing
/// across certificate rotations.
#[derive(Debug, Default, Clone, MetricsGroupSet)]
#[metrics(name = "navi")]
pub struct Metrics {
    /// Metrics of the STUN responder.
    pub stun: Arc<StunMetrics>,
    /// Metrics of the accept loop.
    pub accept: Arc<AcceptMetrics>,
    /// Metrics of the HTTPS server.
    pub tls: Arc<TlsMetrics>,
}
