//! Control-protocol message payloads.

use std::net::IpAddr;

use podtap_common::types::Direction;
use serde::{Deserialize, Serialize};

/// A client request. Exactly one is sent per control session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// List processes and their listening sockets.
    ListProcesses,
    /// Start redirecting traffic for one port and stream pairing ports.
    Redirect {
        /// Port to intercept on the pod side.
        port: u16,
        /// Interception direction.
        direction: Direction,
    },
}

/// An address a process is listening on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenAddress {
    /// Bound IP address.
    pub ip: IpAddr,
    /// Bound port.
    pub port: u16,
}

impl ListenAddress {
    /// Whether this address is only reachable from inside the pod.
    #[must_use]
    pub fn is_loopback(&self) -> bool {
        self.ip.is_loopback()
    }
}

/// One process visible to the agent, with its listening sockets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRecord {
    /// Process ID.
    pub pid: u32,
    /// Parent process ID.
    pub ppid: u32,
    /// Executable name.
    pub name: String,
    /// Addresses the process listens on; empty when the socket inventory
    /// was unavailable.
    pub listen_addresses: Vec<ListenAddress>,
}

/// A unary response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Response {
    /// Answer to [`Request::ListProcesses`].
    ProcessList {
        /// Processes visible to the agent, excluding the agent itself.
        processes: Vec<ProcessRecord>,
    },
}

/// One streamed signal: a pairing listener port the client must dial
/// through a fresh data-plane hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingPort {
    /// Ephemeral pairing port on the agent side.
    pub port: u16,
}

/// A session-fatal error reported by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Human-readable description.
    pub message: String,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn request_serde_round_trip() {
        let req = Request::Redirect {
            port: 80,
            direction: Direction::Inbound,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(
            json,
            r#"{"op":"redirect","port":80,"direction":"inbound"}"#
        );
        let back: Request = serde_json::from_str(&json).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn process_list_serde() {
        let resp = Response::ProcessList {
            processes: vec![ProcessRecord {
                pid: 12,
                ppid: 1,
                name: "envoy".to_string(),
                listen_addresses: vec![ListenAddress {
                    ip: "10.0.0.3".parse().unwrap(),
                    port: 8080,
                }],
            }],
        };
        let json = serde_json::to_string(&resp).unwrap();
        let back: Response = serde_json::from_str(&json).unwrap();
        assert_eq!(back, resp);
    }

    #[test]
    fn loopback_detection_covers_v4_and_v6() {
        let v4 = ListenAddress { ip: "127.0.0.1".parse().unwrap(), port: 80 };
        let v6 = ListenAddress { ip: "::1".parse().unwrap(), port: 80 };
        let outside = ListenAddress { ip: "0.0.0.0".parse().unwrap(), port: 80 };
        assert!(v4.is_loopback());
        assert!(v6.is_loopback());
        assert!(!outside.is_loopback());
    }
}
