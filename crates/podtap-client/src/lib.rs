//! # podtap-client
//!
//! The operator-side half of podtap. Ensures the agent's ephemeral
//! container exists in the target pod, discovers its control endpoint from
//! the container log, and drives redirect/listing sessions through the
//! orchestrator's port-forward primitive.

pub mod agent;
pub mod discovery;
pub mod error;
pub mod forward;
pub mod manager;

pub use agent::{AgentConfig, ensure_agent};
pub use error::{ClientError, Result};
pub use manager::RedirectManager;
