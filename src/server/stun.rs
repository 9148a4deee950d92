//! The STUN address-discovery responder.

use std::{net::SocketAddr, sync::Arc};

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::metrics::StunMetrics;
use crate::{defaults::timeouts::STUN_READ_ERROR_BACKOFF, protos};

/// Runs a STUN server on `sock` until `cancel` fires.
///
/// Requests are answered inline, in the order they arrive.  Read and write failures are
/// counted and never end the loop.
pub(super) async fn serve(sock: UdpSocket, metrics: Arc<StunMetrics>, cancel: CancellationToken) {
    info!(addr = ?sock.local_addr().ok(), "running STUN server");
    let mut buffer = vec![0u8; 64 << 10];
    loop {
        let res = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            res = sock.recv_from(&mut buffer) => res,
        };
        match res {
            Ok((n, src_addr)) => {
                handle_packet(&sock, &buffer[..n], src_addr, &metrics).await;
            }
            Err(err) => {
                metrics.read_errors.inc();
                warn!("failed to recv: {err:#}");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(STUN_READ_ERROR_BACKOFF) => {}
                }
            }
        }
    }
    debug!("STUN server stopped");
}

/// Answers a single datagram, doing all logging and counting required.
async fn handle_packet(sock: &UdpSocket, pkt: &[u8], src_addr: SocketAddr, metrics: &StunMetrics) {
    if !protos::stun::is(pkt) {
        debug!(%src_addr, "STUN: ignoring non stun packet");
        metrics.not_stun.inc();
        return;
    }
    let txid = match protos::stun::parse_binding_request(pkt) {
        Ok(txid) => txid,
        Err(err) => {
            debug!(%src_addr, "STUN: invalid binding request: {err}");
            metrics.not_stun.inc();
            return;
        }
    };
    trace!(%src_addr, %txid, "STUN: received binding request");
    if src_addr.ip().to_canonical().is_ipv4() {
        metrics.ipv4.inc();
    } else {
        metrics.ipv6.inc();
    }

    let response = protos::stun::response(txid, src_addr);
    match sock.send_to(&response, src_addr).await {
        Ok(len) if len == response.len() => {
            metrics.success.inc();
            trace!(%src_addr, %txid, "sent {len} bytes");
        }
        Ok(len) => {
            metrics.write_errors.inc();
            warn!(
                %src_addr,
                %txid,
                "failed to write response, {len}/{} bytes sent",
                response.len()
            );
        }
        Err(err) => {
            metrics.write_errors.inc();
            warn!(%src_addr, %txid, "failed to write response: {err:#}");
        }
    }
}
