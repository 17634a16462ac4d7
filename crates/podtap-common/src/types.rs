//! Domain primitive types used across the podtap workspace.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::constants::AGENT_CONTAINER_PREFIX;
use crate::error::CommonError;

/// Direction of an intercept session relative to the pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Divert traffic arriving at the pod's port (NAT PREROUTING).
    Inbound,
    /// Divert traffic the pod initiates towards a port (NAT OUTPUT).
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inbound => write!(f, "inbound"),
            Self::Outbound => write!(f, "outbound"),
        }
    }
}

/// A remote/local port pairing as given on the command line.
///
/// Grammar: `REMOTE`, `REMOTE:LOCAL`, or `REMOTE:`. A bare `REMOTE` mirrors
/// the port locally (`local == remote`); an empty local half parses as `0`,
/// meaning "any free local port". The remote port must be nonzero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortPair {
    /// Port on the pod side.
    pub remote: u16,
    /// Port on the operator side; `0` means unspecified.
    pub local: u16,
}

impl FromStr for PortPair {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let split = s.split_once(':');
        let remote_str = split.map_or(s, |(r, _)| r);

        let remote: u16 = remote_str
            .parse()
            .map_err(|_| CommonError::InvalidPortPair {
                input: s.to_string(),
                reason: "remote half is not a valid port number",
            })?;
        if remote == 0 {
            return Err(CommonError::ZeroRemotePort);
        }

        let local: u16 = match split {
            // Bare `REMOTE` mirrors the port locally.
            None => remote,
            // `REMOTE:` leaves the local side unspecified.
            Some((_, "")) => 0,
            Some((_, l)) => l.parse().map_err(|_| CommonError::InvalidPortPair {
                input: s.to_string(),
                reason: "local half is not a valid port number",
            })?,
        };

        Ok(Self { remote, local })
    }
}

impl fmt::Display for PortPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.remote, self.local)
    }
}

/// Returns the deterministic name of the agent container for this build.
///
/// The name is derived from the crate version, so identical builds resolve
/// to identical names and re-injection into a pod that already carries the
/// agent is a no-op.
#[must_use]
pub fn agent_container_name() -> String {
    agent_container_name_for(env!("CARGO_PKG_VERSION"))
}

/// Derives the agent container name for a specific version tag.
#[must_use]
pub fn agent_container_name_for(version: &str) -> String {
    let digest = Sha256::digest(version.as_bytes());
    // Eight hex characters keep the name well under the 63-character limit
    // for container names while still separating builds.
    format!(
        "{AGENT_CONTAINER_PREFIX}-{:02x}{:02x}{:02x}{:02x}",
        digest[0], digest[1], digest[2], digest[3]
    )
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn port_pair_remote_only_mirrors_port() {
        let pair: PortPair = "8080".parse().unwrap();
        assert_eq!(pair, PortPair { remote: 8080, local: 8080 });
    }

    #[test]
    fn port_pair_remote_and_local() {
        let pair: PortPair = "80:8989".parse().unwrap();
        assert_eq!(pair, PortPair { remote: 80, local: 8989 });
    }

    #[test]
    fn port_pair_empty_local_defaults_to_zero() {
        let pair: PortPair = "443:".parse().unwrap();
        assert_eq!(pair, PortPair { remote: 443, local: 0 });
    }

    #[test]
    fn port_pair_rejects_zero_remote() {
        assert!(matches!(
            "0:8080".parse::<PortPair>(),
            Err(CommonError::ZeroRemotePort)
        ));
    }

    #[test]
    fn port_pair_rejects_garbage() {
        assert!("http:80".parse::<PortPair>().is_err());
        assert!("80:yes".parse::<PortPair>().is_err());
        assert!("".parse::<PortPair>().is_err());
        assert!("65536".parse::<PortPair>().is_err());
    }

    #[test]
    fn agent_name_is_deterministic() {
        let a = agent_container_name_for("0.1.0");
        let b = agent_container_name_for("0.1.0");
        assert_eq!(a, b);
        assert!(a.starts_with(AGENT_CONTAINER_PREFIX));
    }

    #[test]
    fn agent_name_differs_across_versions() {
        assert_ne!(
            agent_container_name_for("0.1.0"),
            agent_container_name_for("0.2.0")
        );
    }
}
