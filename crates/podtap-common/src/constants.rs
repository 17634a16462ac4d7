//! Workspace-wide constants: timeouts, discovery markers, and limits.

use std::time::Duration;

/// How long to wait for the agent's ephemeral container to reach a running
/// state after injection.
pub const AGENT_READY_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Interval between pod status polls while waiting for the agent.
pub const AGENT_READY_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How long to wait for a port-forward to become usable.
pub const PORT_FORWARD_TIMEOUT: Duration = Duration::from_secs(10);

/// How long to scan the agent's startup log for the control endpoint.
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between log fetches while discovering the control endpoint.
pub const DISCOVERY_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// The single line the agent writes to stdout at startup. Everything after
/// the prefix is the listening address; the port is the text after the last
/// colon. This line is the sole discovery mechanism.
pub const LISTENING_PREFIX: &str = "Listening on ";

/// Maximum bytes of firewall-command output carried in an error.
pub const FIREWALL_OUTPUT_CAP: usize = 1024;

/// Name prefix for the injected agent container. The full name appends a
/// hash of the build version so identical builds resolve to identical names.
pub const AGENT_CONTAINER_PREFIX: &str = "podtap-agent";

/// Default agent image injected into target pods.
pub const DEFAULT_AGENT_IMAGE: &str = "ghcr.io/podtap/agent:latest";

/// Default image pull policy for the agent container.
pub const DEFAULT_PULL_POLICY: &str = "IfNotPresent";

/// Application name used in CLI output.
pub const APP_NAME: &str = "podtap";
