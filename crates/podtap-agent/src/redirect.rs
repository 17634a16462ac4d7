//! Firewall redirection handles.
//!
//! A [`Redirection`] owns exactly one NAT rule and the local listener it
//! diverts to. Rule insertion and removal use identical match criteria, so
//! repeated create/destroy cycles leave the NAT table unchanged. Only one
//! redirection should exist at a time per (port, direction) pair; this is
//! not deduplicated here and a second one would install a conflicting rule.

use podtap_common::constants::FIREWALL_OUTPUT_CAP;
use podtap_common::types::Direction;
use tokio::net::TcpListener;

use crate::error::{AgentError, Result};

const IPTABLES: &str = "iptables";

#[derive(Debug, Clone, Copy)]
enum RuleOp {
    Append,
    Delete,
}

impl RuleOp {
    const fn flag(self) -> &'static str {
        match self {
            Self::Append => "-A",
            Self::Delete => "-D",
        }
    }
}

/// One active traffic diversion: a bound listener plus the NAT rule that
/// feeds it.
#[derive(Debug)]
pub struct Redirection {
    listener: Option<TcpListener>,
    intercepted_port: u16,
    listener_port: u16,
    direction: Direction,
    rule_installed: bool,
}

impl Redirection {
    /// Binds an ephemeral listener that will receive the diverted traffic.
    /// No firewall state is touched until [`Self::install`].
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound.
    pub async fn new(intercepted_port: u16, direction: Direction) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", 0)).await?;
        let listener_port = listener.local_addr()?.port();
        Ok(Self {
            listener: Some(listener),
            intercepted_port,
            listener_port,
            direction,
            rule_installed: false,
        })
    }

    /// Port of the intercepting listener.
    #[must_use]
    pub const fn listener_port(&self) -> u16 {
        self.listener_port
    }

    /// Hands the intercepting listener to the caller (the tunnel engine
    /// accepts on it). The rule lifecycle stays with this handle.
    pub fn take_listener(&mut self) -> Option<TcpListener> {
        self.listener.take()
    }

    /// Inserts the NAT rule diverting the intercepted port to the listener.
    ///
    /// # Errors
    ///
    /// Returns an error if the firewall command fails.
    pub async fn install(&mut self) -> Result<()> {
        let args = self.rule_args(RuleOp::Append);
        run_iptables(&args).await?;
        self.rule_installed = true;
        tracing::info!(
            port = self.intercepted_port,
            to = self.listener_port,
            direction = %self.direction,
            "installed redirect rule"
        );
        Ok(())
    }

    /// Removes the exact rule [`Self::install`] inserted and drops the
    /// listener if it was never taken.
    ///
    /// # Errors
    ///
    /// Returns an error if the firewall command fails; the rule is still
    /// considered removed so the drop guard does not retry it.
    pub async fn close(&mut self) -> Result<()> {
        drop(self.listener.take());
        if !self.rule_installed {
            return Ok(());
        }
        self.rule_installed = false;
        let args = self.rule_args(RuleOp::Delete);
        run_iptables(&args).await?;
        tracing::info!(
            port = self.intercepted_port,
            direction = %self.direction,
            "removed redirect rule"
        );
        Ok(())
    }

    fn rule_args(&self, op: RuleOp) -> Vec<String> {
        let port = self.intercepted_port.to_string();
        match self.direction {
            Direction::Inbound => vec![
                "-t".into(),
                "nat".into(),
                op.flag().into(),
                "PREROUTING".into(),
                "-p".into(),
                "tcp".into(),
                "--dport".into(),
                port,
                "-j".into(),
                "REDIRECT".into(),
                "--to-port".into(),
                self.listener_port.to_string(),
            ],
            Direction::Outbound => vec![
                "-t".into(),
                "nat".into(),
                op.flag().into(),
                "OUTPUT".into(),
                "-p".into(),
                "tcp".into(),
                "--dport".into(),
                port,
                "-j".into(),
                "DNAT".into(),
                "--to-destination".into(),
                format!("127.0.0.1:{}", self.listener_port),
            ],
        }
    }
}

impl Drop for Redirection {
    // Last-resort removal for sessions that never reached `close()`.
    fn drop(&mut self) {
        if !self.rule_installed {
            return;
        }
        let args = self.rule_args(RuleOp::Delete);
        let result = std::process::Command::new(IPTABLES).args(&args).output();
        match result {
            Ok(output) if output.status.success() => {}
            Ok(output) => tracing::warn!(
                status = %output.status,
                "failed to remove redirect rule on drop"
            ),
            Err(err) => tracing::warn!(error = %err, "failed to run iptables on drop"),
        }
    }
}

async fn run_iptables(args: &[String]) -> Result<()> {
    let output = tokio::process::Command::new(IPTABLES)
        .args(args)
        .output()
        .await?;
    if output.status.success() {
        return Ok(());
    }

    let mut combined = output.stdout;
    combined.extend_from_slice(&output.stderr);
    combined.truncate(FIREWALL_OUTPUT_CAP);
    Err(AgentError::Firewall {
        command: format!("{IPTABLES} {}", args.join(" ")),
        output: String::from_utf8_lossy(&combined).into_owned(),
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    async fn redirection(direction: Direction) -> Redirection {
        Redirection::new(80, direction).await.unwrap()
    }

    #[tokio::test]
    async fn inbound_rule_targets_prerouting_redirect() {
        let redir = redirection(Direction::Inbound).await;
        let args = redir.rule_args(RuleOp::Append);
        let expected: Vec<String> = [
            "-t",
            "nat",
            "-A",
            "PREROUTING",
            "-p",
            "tcp",
            "--dport",
            "80",
            "-j",
            "REDIRECT",
            "--to-port",
        ]
        .iter()
        .map(ToString::to_string)
        .chain(std::iter::once(redir.listener_port().to_string()))
        .collect();
        assert_eq!(args, expected);
    }

    #[tokio::test]
    async fn outbound_rule_targets_output_dnat() {
        let redir = redirection(Direction::Outbound).await;
        let args = redir.rule_args(RuleOp::Append);
        assert_eq!(args[3], "OUTPUT");
        assert_eq!(args[9], "DNAT");
        assert_eq!(
            args[11],
            format!("127.0.0.1:{}", redir.listener_port())
        );
    }

    #[tokio::test]
    async fn delete_mirrors_append_exactly() {
        let redir = redirection(Direction::Inbound).await;
        let append = redir.rule_args(RuleOp::Append);
        let delete = redir.rule_args(RuleOp::Delete);
        assert_eq!(append[2], "-A");
        assert_eq!(delete[2], "-D");
        // Every other token must be identical for symmetric removal.
        for (i, (a, d)) in append.iter().zip(delete.iter()).enumerate() {
            if i != 2 {
                assert_eq!(a, d, "token {i} differs");
            }
        }
    }

    #[tokio::test]
    async fn close_without_install_touches_nothing() {
        let mut redir = redirection(Direction::Inbound).await;
        redir.close().await.unwrap();
        assert!(!redir.rule_installed);
    }
}
