//! Control-endpoint discovery.
//!
//! The agent has no inbound handshake; the only thing it publishes is one
//! `Listening on <host>:<port>` line on stdout at startup. Discovery scans
//! the container's non-following log for that line, retrying until the
//! discovery deadline. The log-scrape is an external constraint (the
//! target image is not ours to modify); callers only see this function, so
//! a structured discovery mechanism could replace it without touching
//! them.

use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use kube::api::LogParams;
use podtap_common::constants::{DISCOVERY_POLL_INTERVAL, DISCOVERY_TIMEOUT, LISTENING_PREFIX};
use tokio::time::Instant;

use crate::error::{ClientError, Result};

/// Finds the agent's control port by scanning its container log.
///
/// # Errors
///
/// Returns [`ClientError::DiscoveryTimeout`] if the startup line does not
/// appear within the discovery deadline, or an orchestrator error if the
/// log cannot be requested at all.
pub async fn discover_control_port(
    pods: &Api<Pod>,
    pod_name: &str,
    container_name: &str,
) -> Result<u16> {
    let deadline = Instant::now() + DISCOVERY_TIMEOUT;
    let params = LogParams {
        container: Some(container_name.to_string()),
        follow: false,
        ..LogParams::default()
    };

    loop {
        match pods.logs(pod_name, &params).await {
            Ok(log) => {
                if let Some(port) = scan_for_port(&log) {
                    tracing::debug!(port, container = %container_name, "discovered control endpoint");
                    return Ok(port);
                }
            }
            Err(err) => {
                // The container can race us to its first log line; keep
                // retrying until the deadline.
                tracing::debug!(error = %err, "log fetch failed during discovery");
            }
        }

        if Instant::now() >= deadline {
            return Err(ClientError::DiscoveryTimeout {
                container: container_name.to_string(),
            });
        }
        tokio::time::sleep(DISCOVERY_POLL_INTERVAL).await;
    }
}

/// Extracts the control port from log text: the first line starting with
/// the discovery prefix, taking the digits after the last `:`.
fn scan_for_port(log: &str) -> Option<u16> {
    for line in log.lines() {
        let Some(addr) = line.trim().strip_prefix(LISTENING_PREFIX) else {
            continue;
        };
        let Some((_, port)) = addr.rsplit_once(':') else {
            continue;
        };
        if let Ok(port) = port.trim().parse::<u16>() {
            if port != 0 {
                return Some(port);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_port_in_plain_log() {
        assert_eq!(scan_for_port("Listening on 0.0.0.0:8444\n"), Some(8444));
    }

    #[test]
    fn finds_port_among_other_lines() {
        let log = "starting up\nsome tracing output\nListening on 10.2.3.4:9000\nmore output\n";
        assert_eq!(scan_for_port(log), Some(9000));
    }

    #[test]
    fn handles_ipv6_addresses() {
        assert_eq!(scan_for_port("Listening on [::]:7777\n"), Some(7777));
    }

    #[test]
    fn ignores_unrelated_and_malformed_lines() {
        assert_eq!(scan_for_port("listening on 1.2.3.4:80\n"), None);
        assert_eq!(scan_for_port("Listening on nonsense\n"), None);
        assert_eq!(scan_for_port("Listening on 1.2.3.4:0\n"), None);
        assert_eq!(scan_for_port(""), None);
    }
}
