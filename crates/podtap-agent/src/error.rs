//! Agent-side error types.

use thiserror::Error;

/// Errors raised by the in-pod agent.
#[derive(Debug, Error)]
pub enum AgentError {
    /// An I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A diagnostic-socket record was shorter than its fixed layout.
    #[error("socket data short read ({got}); want {want}")]
    ShortRead {
        /// Bytes available.
        got: usize,
        /// Bytes the layout requires.
        want: usize,
    },

    /// The kernel answered a diagnostic dump with an error message.
    #[error("netlink error: {errno}")]
    Netlink {
        /// Negated errno embedded in the reply.
        errno: i32,
    },

    /// The diagnostic dump produced neither records nor an error.
    #[error("no message nor error from netlink")]
    EmptyNetlinkReply,

    /// A firewall command exited non-zero.
    #[error("{command} failed: {output}")]
    Firewall {
        /// The command line that was run.
        command: String,
        /// Combined stdout/stderr, capped at 1 KiB.
        output: String,
    },

    /// A control-protocol exchange failed.
    #[error(transparent)]
    Proto(#[from] podtap_proto::ProtoError),
}

/// Convenience alias for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;
