//! Agent lifecycle: ephemeral-container injection and readiness.

use k8s_openapi::api::core::v1::{Capabilities, EphemeralContainer, Pod, SecurityContext};
use kube::Api;
use kube::api::{Patch, PatchParams};
use podtap_common::constants::{AGENT_READY_POLL_INTERVAL, AGENT_READY_TIMEOUT};
use podtap_common::types::agent_container_name;
use tokio::time::Instant;

use crate::error::{ClientError, Result};

/// How the agent container is constructed.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Agent image reference.
    pub image: String,
    /// Image pull policy (`IfNotPresent`, `Always`, ...).
    pub pull_policy: String,
    /// Container whose process namespace the agent shares; defaults to the
    /// pod's first declared container.
    pub target_container: Option<String>,
}

/// Ensures the agent's ephemeral container exists in `pod_name` and is
/// running, injecting it if absent.
///
/// The container name is derived from the build version, so calling this
/// twice for the same build is a no-op after the first successful
/// injection. Two operators racing with *different* builds are not
/// protected against; each injects its own container.
///
/// # Errors
///
/// Returns an error if the pod cannot be fetched or patched, or the agent
/// does not reach a running state within the readiness timeout.
pub async fn ensure_agent(pods: &Api<Pod>, pod_name: &str, config: &AgentConfig) -> Result<Pod> {
    let pod = pods.get(pod_name).await?;
    let name = agent_container_name();

    if !has_ephemeral_container(&pod, &name) {
        tracing::info!(container = %name, pod = %pod_name, "injecting agent container");
        inject(pods, pod_name, &pod, &name, config).await?;
    } else {
        tracing::debug!(container = %name, "agent container already present");
    }

    wait_ready(pods, pod_name, &name).await
}

fn has_ephemeral_container(pod: &Pod, name: &str) -> bool {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.ephemeral_containers.as_ref())
        .is_some_and(|containers| containers.iter().any(|c| c.name == name))
}

async fn inject(
    pods: &Api<Pod>,
    pod_name: &str,
    pod: &Pod,
    container_name: &str,
    config: &AgentConfig,
) -> Result<()> {
    let target = config
        .target_container
        .clone()
        .or_else(|| {
            pod.spec
                .as_ref()
                .and_then(|spec| spec.containers.first())
                .map(|c| c.name.clone())
        })
        .ok_or_else(|| ClientError::NoTargetContainer {
            pod: pod_name.to_string(),
        })?;

    let container = EphemeralContainer {
        name: container_name.to_string(),
        image: Some(config.image.clone()),
        image_pull_policy: Some(config.pull_policy.clone()),
        target_container_name: Some(target),
        termination_message_policy: Some("File".to_string()),
        security_context: Some(SecurityContext {
            privileged: Some(true),
            capabilities: Some(Capabilities {
                add: Some(vec![
                    "SYS_PTRACE".to_string(),
                    "NET_ADMIN".to_string(),
                    "SYS_ADMIN".to_string(),
                ]),
                ..Capabilities::default()
            }),
            ..SecurityContext::default()
        }),
        ..EphemeralContainer::default()
    };

    // Strategic merge on the ephemeralcontainers subresource: the container
    // list merges by name, so the patch carries only the appended container
    // and unrelated pod fields are untouched.
    let patch = serde_json::json!({
        "spec": {
            "ephemeralContainers": [serde_json::to_value(&container)?],
        }
    });
    let _ = pods
        .patch_ephemeral_containers(pod_name, &PatchParams::default(), &Patch::Strategic(patch))
        .await?;
    Ok(())
}

/// Polls the pod until the agent container reports a running state.
///
/// Resolves only to success, an orchestrator error, or
/// [`ClientError::AgentReadyTimeout`]; caller cancellation is expressed by
/// dropping the future and is never converted into success.
async fn wait_ready(pods: &Api<Pod>, pod_name: &str, container_name: &str) -> Result<Pod> {
    let deadline = Instant::now() + AGENT_READY_TIMEOUT;
    loop {
        let pod = pods.get(pod_name).await?;
        if agent_running(&pod, container_name) {
            return Ok(pod);
        }
        if Instant::now() >= deadline {
            return Err(ClientError::AgentReadyTimeout {
                container: container_name.to_string(),
            });
        }
        tokio::time::sleep(AGENT_READY_POLL_INTERVAL).await;
    }
}

fn agent_running(pod: &Pod, container_name: &str) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.ephemeral_container_statuses.as_ref())
        .is_some_and(|statuses| {
            statuses.iter().any(|status| {
                status.name == container_name
                    && status
                        .state
                        .as_ref()
                        .is_some_and(|state| state.running.is_some())
            })
        })
}
