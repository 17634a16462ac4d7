//! # podtap-agent
//!
//! The privileged helper injected into a target pod as an ephemeral
//! container. It shares the target container's process namespace, which is
//! what lets it enumerate the target's sockets and rewrite its NAT table.
//!
//! The binary announces its control endpoint with a single `Listening on
//! <addr>` line on stdout; everything else happens over the control
//! protocol defined in `podtap-proto`.

pub mod error;
pub mod inventory;
pub mod redirect;
pub mod server;
pub mod sock_diag;
pub mod tunnel;

pub use error::{AgentError, Result};
pub use server::ControlService;
