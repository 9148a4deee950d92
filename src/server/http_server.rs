//! HTTP(S) serving: the accept loop, the TLS handshake and the request router.

use std::{future::Future, io, net::SocketAddr, pin::Pin, sync::Arc};

use http::{
    HeaderMap, HeaderValue, Method, Request, Response, StatusCode,
    header::{CONNECTION, CONTENT_TYPE, UPGRADE},
    response::Builder as ResponseBuilder,
};
use hyper::{body::Incoming, service::Service};
use rustls::ProtocolVersion;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info_span, trace, warn};

use super::{listener::Listener, metrics::TlsMetrics};
use crate::{
    defaults::timeouts::{ACCEPT_ERROR_BACKOFF, ACCEPT_ERROR_MAX_BACKOFF, TLS_HANDSHAKE_TIMEOUT},
    relay::{
        PUBLIC_KEY_HEADER, RELAY_PATH, RELAY_PROTOCOL_VERSION, RELAY_UPGRADE_PROTOCOL,
        RelayService, VERSION_HEADER,
    },
};

pub(super) const NO_CONTENT_CHALLENGE_HEADER: &str = "X-Tailscale-Challenge";
pub(super) const NO_CONTENT_RESPONSE_HEADER: &str = "X-Tailscale-Response";
/// Latency probe for clients unable to send STUN.
pub(super) const RELAY_PROBE_PATH: &str = "/derp/probe";
const NOTFOUND: &[u8] = b"Not Found";
const RELAY_DISABLED: &[u8] = b"relay server disabled";
const ROBOTS_TXT: &[u8] = b"User-agent: *\nDisallow: /\n";
const INDEX: &str = r#"<html><body>
<h1>Navi</h1>
<p>
  This is a Navi relay node.
</p>
"#;
const INDEX_RELAY_DISABLED: &str = "<p>Status: <b>relay disabled</b></p>\n";
const TLS_HEADERS: [(&str, &str); 2] = [
    ("Strict-Transport-Security", "max-age=63072000; includeSubDomains"),
    (
        "Content-Security-Policy",
        "default-src 'none'; frame-ancestors 'none'; form-action 'none'; base-uri 'self'; block-all-mixed-content; plugin-types 'none'",
    ),
];

type BytesBody = http_body_util::Full<hyper::body::Bytes>;
type HyperError = Box<dyn std::error::Error + Send + Sync>;
type HyperResult<T> = std::result::Result<T, HyperError>;

fn body_empty() -> BytesBody {
    http_body_util::Full::new(hyper::body::Bytes::new())
}

fn body_full(content: impl Into<hyper::body::Bytes>) -> BytesBody {
    http_body_util::Full::new(content.into())
}

/// Accepts connections from `listener` until `cancel` fires, handing each to `handle`.
///
/// Transient accept errors, see [`is_transient_accept_error`], are logged and followed by
/// a pause doubling from [`ACCEPT_ERROR_BACKOFF`] up to [`ACCEPT_ERROR_MAX_BACKOFF`].  A
/// listener closed through [`RateLimitedListener::close`] ends the loop cleanly, any other
/// accept error ends it with that error.  Either way the listener is dropped first and the
/// connection tasks are aborted after.
///
/// [`RateLimitedListener::close`]: super::listener::RateLimitedListener::close
pub(super) async fn accept_loop<L, F, Fut>(
    mut listener: L,
    cancel: CancellationToken,
    mut handle: F,
) -> io::Result<()>
where
    L: Listener,
    F: FnMut(L::Conn, SocketAddr) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    // If this future is cancelled, this is dropped and all tasks are aborted.
    let mut set = JoinSet::new();
    let mut backoff = ACCEPT_ERROR_BACKOFF;
    let res = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break Ok(()),
            Some(res) = set.join_next() => {
                if let Err(err) = res {
                    if err.is_panic() {
                        panic!("task panicked: {err:#?}");
                    }
                }
            }
            res = listener.accept() => match res {
                Ok((conn, peer_addr)) => {
                    backoff = ACCEPT_ERROR_BACKOFF;
                    trace!(%peer_addr, "connection opened");
                    set.spawn(
                        handle(conn, peer_addr).instrument(info_span!("conn", peer = %peer_addr)),
                    );
                }
                Err(err) if err.kind() == io::ErrorKind::NotConnected => {
                    debug!("listener closed");
                    break Ok(());
                }
                Err(err) if is_transient_accept_error(&err) => {
                    warn!("failed to accept connection: {err:#}, retrying in {backoff:?}");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break Ok(()),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(ACCEPT_ERROR_MAX_BACKOFF);
                }
                Err(err) => {
                    error!("accept failed: {err:#}");
                    break Err(err);
                }
            }
        }
    };
    drop(listener);
    set.shutdown().await;
    debug!("accept loop stopped");
    res
}

/// Whether a failed `accept` is worth retrying.
///
/// Errors of the peer's connection and exhausted process or system resources are
/// transient, everything else means the listener is unusable.
pub(super) fn is_transient_accept_error(err: &io::Error) -> bool {
    use io::ErrorKind::*;

    if matches!(
        err.kind(),
        ConnectionAborted | ConnectionReset | ConnectionRefused | Interrupted | WouldBlock
            | TimedOut | OutOfMemory
    ) {
        return true;
    }
    #[cfg(unix)]
    {
        if let Some(code) = err.raw_os_error() {
            return matches!(
                code,
                libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM | libc::EPROTO
            );
        }
    }
    false
}

/// Routes the requests of one connection.
#[derive(Debug, Clone)]
pub(super) struct HttpService {
    inner: Arc<Inner>,
    peer_addr: SocketAddr,
}

#[derive(Debug)]
struct Inner {
    relay: Option<RelayService>,
    headers: HeaderMap,
}

impl HttpService {
    /// The HTTPS service, `relay` is `None` when relaying is disabled.
    pub(super) fn new(relay: Option<RelayService>) -> Self {
        let mut headers = HeaderMap::new();
        for (name, value) in TLS_HEADERS.iter() {
            headers.insert(*name, HeaderValue::from_static(*value));
        }
        Self {
            inner: Arc::new(Inner { relay, headers }),
            peer_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
        }
    }

    fn for_peer(&self, peer_addr: SocketAddr) -> Self {
        Self {
            inner: self.inner.clone(),
            peer_addr,
        }
    }

    fn default_response(&self) -> ResponseBuilder {
        let mut response = Response::builder();
        for (key, value) in self.inner.headers.iter() {
            response = response.header(key.clone(), value.clone());
        }
        response
    }

    /// Runs the TLS handshake on `stream` and serves HTTP on it.
    pub(super) async fn handle_tls_connection<S>(
        self,
        stream: S,
        peer_addr: SocketAddr,
        acceptor: tokio_rustls::TlsAcceptor,
        metrics: Arc<TlsMetrics>,
    ) where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + Sync + 'static,
    {
        let handshake = tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream));
        let tls_stream = match handshake.await {
            Ok(Ok(tls_stream)) => tls_stream,
            Ok(Err(err)) => {
                metrics.handshake_errors.inc();
                match err.kind() {
                    std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::ConnectionReset => {
                        debug!(reason = ?err, "peer disconnected during handshake");
                    }
                    _ => debug!("TLS handshake failed: {err:#}"),
                }
                return;
            }
            Err(_) => {
                metrics.handshake_errors.inc();
                debug!("TLS handshake timed out after {TLS_HANDSHAKE_TIMEOUT:?}");
                return;
            }
        };

        let version = tls_stream.get_ref().1.protocol_version();
        let active = match version {
            Some(ProtocolVersion::TLSv1_3) => {
                metrics.requests_v13.inc();
                Some(&metrics.active_v13)
            }
            Some(ProtocolVersion::TLSv1_2) => {
                metrics.requests_v12.inc();
                Some(&metrics.active_v12)
            }
            _ => None,
        };
        if let Some(gauge) = active {
            gauge.inc();
        }
        trace!(?version, "TLS established");

        let res = serve_connection(tls_stream, self.for_peer(peer_addr)).await;
        if let Some(gauge) = active {
            gauge.dec();
        }
        log_serve_result(res);
    }

    /// Upgrades the HTTP connection to the relay protocol.
    fn handle_relay_upgrade(
        &self,
        relay: &RelayService,
        mut req: Request<Incoming>,
    ) -> HyperResult<Response<BytesBody>> {
        let upgrade_ok = req
            .headers()
            .get(UPGRADE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.eq_ignore_ascii_case(RELAY_UPGRADE_PROTOCOL));
        if !upgrade_ok {
            debug!("relay request without upgrade header");
            return self
                .default_response()
                .status(StatusCode::UPGRADE_REQUIRED)
                .body(body_full(format!("{UPGRADE} must be {RELAY_UPGRADE_PROTOCOL}")))
                .map_err(Into::into);
        }

        // Can't be fulfilled before the 101 response below is sent, so it runs in the
        // relay's own task set.
        relay.spawn_upgrade(hyper::upgrade::on(&mut req), self.peer_addr);

        self.default_response()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(UPGRADE, HeaderValue::from_static(RELAY_UPGRADE_PROTOCOL))
            .header(CONNECTION, "Upgrade")
            .header(VERSION_HEADER, RELAY_PROTOCOL_VERSION.to_string())
            .header(PUBLIC_KEY_HEADER, relay.public_key_hex())
            .body(body_empty())
            .map_err(Into::into)
    }

    fn route(&self, req: Request<Incoming>) -> HyperResult<Response<BytesBody>> {
        let response = self.default_response();
        match (req.method(), req.uri().path()) {
            (&Method::GET, RELAY_PATH) => match self.inner.relay {
                Some(ref relay) => self.handle_relay_upgrade(relay, req),
                None => response
                    .status(StatusCode::NOT_FOUND)
                    .body(body_full(RELAY_DISABLED))
                    .map_err(Into::into),
            },
            (&Method::GET, "/" | "/index.html") => {
                let mut page = INDEX.to_string();
                if self.inner.relay.is_none() {
                    page.push_str(INDEX_RELAY_DISABLED);
                }
                response
                    .status(StatusCode::OK)
                    .header(CONTENT_TYPE, "text/html; charset=utf-8")
                    .body(body_full(page))
                    .map_err(Into::into)
            }
            (_, RELAY_PROBE_PATH) => probe_handler(req, response),
            (&Method::GET, "/robots.txt") => response
                .status(StatusCode::OK)
                .body(body_full(ROBOTS_TXT))
                .map_err(Into::into),
            (&Method::GET, "/generate_204") => serve_no_content_handler(&req, response),
            _ => response
                .status(StatusCode::NOT_FOUND)
                .body(body_full(NOTFOUND))
                .map_err(Into::into),
        }
    }
}

impl Service<Request<Incoming>> for HttpService {
    type Response = Response<BytesBody>;
    type Error = HyperError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let res = self.route(req);
        Box::pin(async move { res })
    }
}

/// Serves the plain-HTTP captive portal check.
#[derive(Debug, Clone, Copy)]
pub(super) struct CaptivePortalService;

impl CaptivePortalService {
    pub(super) async fn handle_connection(self, stream: tokio::net::TcpStream) {
        log_serve_result(serve_connection(stream, self).await);
    }
}

impl Service<Request<Incoming>> for CaptivePortalService {
    type Response = Response<BytesBody>;
    type Error = HyperError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let res = match (req.method(), req.uri().path()) {
            // Captive Portal checker
            (&Method::GET, "/generate_204") => {
                serve_no_content_handler(&req, Response::builder())
            }
            _ => Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(body_full(NOTFOUND))
                .map_err(Into::into),
        };
        Box::pin(async move { res })
    }
}

/// Wrapper for the actual http connection (with upgrades)
async fn serve_connection<I, S>(io: I, service: S) -> Result<(), hyper::Error>
where
    I: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    S: Service<Request<Incoming>, Response = Response<BytesBody>, Error = HyperError>,
    S::Future: Send + 'static,
{
    hyper::server::conn::http1::Builder::new()
        .serve_connection(hyper_util::rt::TokioIo::new(io), service)
        .with_upgrades()
        .await
}

fn log_serve_result(res: Result<(), hyper::Error>) {
    match res {
        Ok(()) => {}
        // `hyper::Error::IncompleteMessage` is hyper's equivalent of UnexpectedEof
        Err(err) if err.is_incomplete_message() => debug!(reason = ?err, "peer disconnected"),
        Err(err) => error!("failed to serve connection: {err:#}"),
    }
}

/// HTTP latency queries
fn probe_handler(
    req: Request<Incoming>,
    response: ResponseBuilder,
) -> HyperResult<Response<BytesBody>> {
    match *req.method() {
        Method::GET | Method::HEAD => response
            .status(StatusCode::OK)
            .header("Access-Control-Allow-Origin", "*")
            .body(body_empty()),
        _ => response
            .status(StatusCode::METHOD_NOT_ALLOWED)
            .body(body_full("bogus probe method")),
    }
    .map_err(Into::into)
}

/// For captive portal detection.
fn serve_no_content_handler<B>(
    req: &Request<B>,
    mut response: ResponseBuilder,
) -> HyperResult<Response<BytesBody>> {
    if let Some(challenge) = req.headers().get(NO_CONTENT_CHALLENGE_HEADER) {
        if !challenge.is_empty()
            && challenge.len() < 64
            && challenge
                .as_bytes()
                .iter()
                .all(|c| is_challenge_char(*c as char))
        {
            response = response.header(
                NO_CONTENT_RESPONSE_HEADER,
                format!("response {}", challenge.to_str()?),
            );
        }
    }

    response
        .status(StatusCode::NO_CONTENT)
        .body(body_empty())
        .map_err(Into::into)
}

fn is_challenge_char(c: char) -> bool {
    // Semi-randomly chosen as a limited set of valid characters
    c.is_ascii_lowercase()
        || c.is_ascii_uppercase()
        || c.is_ascii_digit()
        || c == '.'
        || c == '-'
        || c == '_'
}
