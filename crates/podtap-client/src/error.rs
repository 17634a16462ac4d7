//! Operator-side error types.
//!
//! The timeout conditions are distinct variants so callers can tell "never
//! became ready" from an explicit failure.

use thiserror::Error;

/// Errors raised by the operator-side client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// An orchestrator API call failed; surfaced verbatim, not retried.
    #[error(transparent)]
    Kube(#[from] kube::Error),

    /// A control-protocol exchange failed.
    #[error(transparent)]
    Proto(#[from] podtap_proto::ProtoError),

    /// A local I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A payload could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The agent container never reached a running state.
    #[error("timeout waiting for agent container {container} to be ready")]
    AgentReadyTimeout {
        /// The agent container's name.
        container: String,
    },

    /// The agent's startup line never appeared in the container log.
    #[error("no control endpoint found in logs of container {container}")]
    DiscoveryTimeout {
        /// The agent container's name.
        container: String,
    },

    /// A port-forward did not become usable in time.
    #[error("timeout waiting for port forward to port {port}")]
    PortForwardTimeout {
        /// The pod-side port.
        port: u16,
    },

    /// The orchestrator accepted the port-forward but produced no stream.
    #[error("port forward to port {port} yielded no stream")]
    MissingForwardStream {
        /// The pod-side port.
        port: u16,
    },

    /// The pod declares no containers, so no target can be chosen.
    #[error("pod {pod} has no containers to target")]
    NoTargetContainer {
        /// The pod's name.
        pod: String,
    },
}

/// Convenience alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
