//! Shared error types.
//!
//! Each higher-level crate defines its own domain-specific error enum and
//! wraps these common variants where appropriate.

use thiserror::Error;

/// Errors produced by the shared primitives.
#[derive(Debug, Error)]
pub enum CommonError {
    /// A port-pair argument did not match `REMOTE`, `REMOTE:LOCAL`, or
    /// `REMOTE:`.
    #[error("invalid port pair {input:?}: {reason}")]
    InvalidPortPair {
        /// The argument as given.
        input: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// A remote port of zero was requested.
    #[error("remote port must be nonzero")]
    ZeroRemotePort,
}

/// Convenience alias for the shared primitives.
pub type Result<T> = std::result::Result<T, CommonError>;
