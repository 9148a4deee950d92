//! Default values used by the relay node.

use std::time::Duration;

/// The default HTTP port, used for the captive portal service.
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// The default HTTPS port used by the relay server.
pub const DEFAULT_HTTPS_PORT: u16 = 443;

/// The default STUN port used by the relay server.
///
/// The STUN port as defined by [RFC 8489](<https://www.rfc-editor.org/rfc/rfc8489#section-18.6>)
pub const DEFAULT_STUN_PORT: u16 = 3478;

/// The HTTPS port used when running with `--dev`.
pub const DEV_MODE_HTTPS_PORT: u16 = 3340;

/// How often the certificate expiry is checked.
pub const DEFAULT_RENEWAL_CHECK_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

/// Remaining validity below which a certificate rotation is requested.
pub const DEFAULT_RENEWAL_THRESHOLD: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Contains all timeouts used by the relay node.
pub(crate) mod timeouts {
    use std::time::Duration;

    /// Pause of the STUN read loop after a failed read.
    pub(crate) const STUN_READ_ERROR_BACKOFF: Duration = Duration::from_secs(1);

    /// Maximum time for the TLS handshake of an accepted connection.
    pub(crate) const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

    /// Initial pause after a failed `accept`, doubled up to [`ACCEPT_ERROR_MAX_BACKOFF`].
    pub(crate) const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(5);

    /// Upper bound of the pause after a failed `accept`.
    pub(crate) const ACCEPT_ERROR_MAX_BACKOFF: Duration = Duration::from_secs(1);

    /// Timeout for requests to DNS provider APIs and the fleet controller.
    pub(crate) const HTTP_API_TIMEOUT: Duration = Duration::from_secs(30);

    /// Maximum time spent waiting for an ACME order to change state.
    pub(crate) const ACME_ORDER_TIMEOUT: Duration = Duration::from_secs(300);

    /// Maximum time spent waiting for a DNS challenge record to become visible.
    pub(crate) const DNS_PROPAGATION_TIMEOUT: Duration = Duration::from_secs(120);

    /// Pause between two checks for a DNS challenge record.
    pub(crate) const DNS_PROPAGATION_POLL: Duration = Duration::from_secs(5);

    /// Timeout of single DNS queries during zone discovery.
    pub(crate) const DNS_TIMEOUT: Duration = Duration::from_secs(5);
}
