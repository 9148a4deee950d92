//! Redirects TCP port 443 to the listen port while a TLS-ALPN-01 challenge is pending.
//!
//! The CA always validates on port 443, so a node listening elsewhere needs a NAT rule.

use snafu::ResultExt;
use tokio::process::Command;
use tracing::{debug, info};

use super::{CertError, PortRedirectSnafu, PortRedirectSpawnSnafu};

/// The port ACME TLS-ALPN-01 validation connects to.
pub const CHALLENGE_PORT: u16 = 443;

/// An installed `iptables` redirect rule.
///
/// Must be removed with [`PortRedirect::remove`].
#[derive(Debug)]
#[must_use = "the redirect rule stays installed until removed"]
pub struct PortRedirect {
    to_port: u16,
}

impl PortRedirect {
    /// Installs a redirect of port 443 to `to_port`.
    ///
    /// Returns `None` without touching the firewall when `to_port` is 443.
    pub async fn install(to_port: u16) -> Result<Option<Self>, CertError> {
        if to_port == CHALLENGE_PORT {
            return Ok(None);
        }
        run_iptables(&rule_args("-A", to_port)).await?;
        info!(to_port, "redirecting port {CHALLENGE_PORT} for the ACME challenge");
        Ok(Some(Self { to_port }))
    }

    /// Deletes the redirect rule.
    pub async fn remove(self) -> Result<(), CertError> {
        run_iptables(&rule_args("-D", self.to_port)).await?;
        info!(to_port = self.to_port, "removed port {CHALLENGE_PORT} redirect");
        Ok(())
    }
}

fn rule_args(action: &str, to_port: u16) -> Vec<String> {
    [
        "iptables",
        "-t",
        "nat",
        action,
        "PREROUTING",
        "-p",
        "tcp",
        "--dport",
        &CHALLENGE_PORT.to_string(),
        "-j",
        "REDIRECT",
        "--to-ports",
        &to_port.to_string(),
    ]
    .iter()
    .map(ToString::to_string)
    .collect()
}

async fn run_iptables(args: &[String]) -> Result<(), CertError> {
    debug!(?args, "running sudo");
    let output = Command::new("sudo")
        .args(args)
        .output()
        .await
        .context(PortRedirectSpawnSnafu)?;
    snafu::ensure!(
        output.status.success(),
        PortRedirectSnafu {
            details: format!(
                "{} exited with {}: {}",
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )
        }
    );
    Ok(())
}
