//! The redirect manager: operator-side driver for control sessions.

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use podtap_common::types::Direction;
use podtap_proto::message::ProcessRecord;
use podtap_proto::Control;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::discovery;
use crate::error::Result;
use crate::forward::{ForwardedStream, forward_stream};

/// Drives listing and redirect sessions against one pod's agent.
#[derive(Debug)]
pub struct RedirectManager {
    pods: Api<Pod>,
    pod_name: String,
    control_port: u16,
}

impl RedirectManager {
    /// Discovers the agent's control endpoint in `pod_name` and prepares a
    /// manager for it. The agent container must already be running (see
    /// [`crate::ensure_agent`]).
    ///
    /// # Errors
    ///
    /// Returns an error if endpoint discovery fails.
    pub async fn connect(
        client: Client,
        namespace: &str,
        pod_name: &str,
        agent_container: &str,
    ) -> Result<Self> {
        let pods: Api<Pod> = Api::namespaced(client, namespace);
        let control_port =
            discovery::discover_control_port(&pods, pod_name, agent_container).await?;
        Ok(Self {
            pods,
            pod_name: pod_name.to_string(),
            control_port,
        })
    }

    /// Opens a fresh control session through a new port-forward.
    async fn open_control(&self) -> Result<Control<ForwardedStream>> {
        let stream = forward_stream(&self.pods, &self.pod_name, self.control_port).await?;
        Ok(Control::new(stream))
    }

    /// Lists processes and their listening sockets as seen by the agent.
    ///
    /// # Errors
    ///
    /// Returns an error if the session cannot be opened or the agent
    /// reports one.
    pub async fn list_processes(&self) -> Result<Vec<ProcessRecord>> {
        let mut control = self.open_control().await?;
        Ok(control.list_processes().await?)
    }

    /// Returns the distinct non-loopback ports currently in LISTEN state
    /// in the pod. Used to default to "redirect everything listening".
    ///
    /// # Errors
    ///
    /// Returns an error if the process listing fails.
    pub async fn list_listening_ports(&self) -> Result<Vec<u16>> {
        let processes = self.list_processes().await?;
        Ok(flatten_listening_ports(&processes))
    }

    /// Redirects connections arriving at the pod's `remote_port` to
    /// `127.0.0.1:<local_port>` on the operator's machine. Runs until the
    /// agent closes the stream or an error occurs.
    ///
    /// # Errors
    ///
    /// Returns an error if the session fails; individual pairing failures
    /// are not fatal.
    pub async fn redirect_incoming(&self, remote_port: u16, local_port: u16) -> Result<()> {
        self.redirect(Direction::Inbound, remote_port, local_port)
            .await
    }

    /// Redirects connections the pod initiates towards `remote_port` to
    /// `127.0.0.1:<local_port>` on the operator's machine.
    ///
    /// # Errors
    ///
    /// Returns an error if the session fails.
    pub async fn redirect_outgoing(&self, remote_port: u16, local_port: u16) -> Result<()> {
        self.redirect(Direction::Outbound, remote_port, local_port)
            .await
    }

    async fn redirect(&self, direction: Direction, remote_port: u16, local_port: u16) -> Result<()> {
        let mut control = self.open_control().await?;
        control.start_redirect(remote_port, direction).await?;
        tracing::info!(remote_port, local_port, %direction, "redirect session started");

        while let Some(pairing_port) = control.next_pairing_port().await? {
            tracing::debug!(pairing_port, "opening data-plane hop");
            // Every pairing gets its own, fully independent forward.
            let hop = forward_stream(&self.pods, &self.pod_name, pairing_port).await?;
            drop(tokio::spawn(pair_with_local(hop, local_port)));
        }

        tracing::debug!(remote_port, "redirect session ended");
        Ok(())
    }
}

/// Splices one data-plane hop with the operator's local target. If the
/// local dial fails, the hop is closed immediately so the remote peer
/// observes the failure instead of a silent hang; the session itself
/// continues.
async fn pair_with_local(mut hop: ForwardedStream, local_port: u16) {
    match TcpStream::connect(("127.0.0.1", local_port)).await {
        Ok(mut local) => {
            match tokio::io::copy_bidirectional(&mut hop, &mut local).await {
                Ok((up, down)) => tracing::debug!(up, down, "pairing closed"),
                Err(err) => tracing::debug!(error = %err, "pairing aborted"),
            }
        }
        Err(err) => {
            tracing::debug!(error = %err, local_port, "error connecting to local port");
            let _ = hop.shutdown().await;
        }
    }
}

/// Flattens process records to the distinct ports reachable from outside
/// the pod: loopback bindings and port 0 never appear.
fn flatten_listening_ports(processes: &[ProcessRecord]) -> Vec<u16> {
    let ports: BTreeSet<u16> = processes
        .iter()
        .flat_map(|process| &process.listen_addresses)
        .filter(|addr| !addr.is_loopback() && addr.port != 0)
        .map(|addr| addr.port)
        .collect();
    ports.into_iter().collect()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use podtap_proto::message::ListenAddress;

    use super::*;

    fn record(name: &str, addresses: &[(&str, u16)]) -> ProcessRecord {
        ProcessRecord {
            pid: 1,
            ppid: 0,
            name: name.to_string(),
            listen_addresses: addresses
                .iter()
                .map(|(ip, port)| ListenAddress {
                    ip: ip.parse().unwrap(),
                    port: *port,
                })
                .collect(),
        }
    }

    #[test]
    fn excludes_loopback_and_zero_ports() {
        let processes = vec![
            record("web", &[("0.0.0.0", 80), ("127.0.0.1", 9901)]),
            record("admin", &[("::1", 15000), ("10.0.0.4", 8080)]),
            record("odd", &[("10.0.0.4", 0)]),
        ];
        assert_eq!(flatten_listening_ports(&processes), vec![80, 8080]);
    }

    #[test]
    fn deduplicates_across_processes() {
        let processes = vec![
            record("a", &[("0.0.0.0", 8080)]),
            record("b", &[("10.0.0.5", 8080)]),
        ];
        assert_eq!(flatten_listening_ports(&processes), vec![8080]);
    }

    #[test]
    fn empty_input_yields_no_ports() {
        assert!(flatten_listening_ports(&[]).is_empty());
    }
}
