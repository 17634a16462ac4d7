//! CLI command definitions and dispatch.

pub mod ps;
pub mod redirect;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use podtap_client::{AgentConfig, RedirectManager, ensure_agent};
use podtap_common::constants::{APP_NAME, DEFAULT_AGENT_IMAGE, DEFAULT_PULL_POLICY};
use podtap_common::types::agent_container_name;

/// podtap — inspect and redirect traffic of a running pod.
#[derive(Parser, Debug)]
#[command(name = APP_NAME, version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Namespace of the target pod; defaults to the context namespace.
    #[arg(short = 'n', long, global = true)]
    pub namespace: Option<String>,

    /// Agent image injected into the target pod.
    #[arg(long, global = true, default_value = DEFAULT_AGENT_IMAGE)]
    pub image: String,

    /// Container whose process namespace the agent joins; defaults to the
    /// pod's first declared container.
    #[arg(long, global = true)]
    pub target_container: Option<String>,

    /// Image pull policy for the agent container.
    #[arg(long, global = true, default_value = DEFAULT_PULL_POLICY)]
    pub pull_policy: String,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// List processes and their listening sockets inside a pod.
    Ps(ps::PsArgs),
    /// Redirect a pod's connections to local ports.
    Redirect(redirect::RedirectArgs),
}

/// Flags shared by every subcommand.
#[derive(Debug)]
pub struct Globals {
    namespace: Option<String>,
    agent: AgentConfig,
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub async fn execute(cli: Cli) -> anyhow::Result<()> {
    let Cli {
        command,
        namespace,
        image,
        target_container,
        pull_policy,
    } = cli;
    let globals = Globals {
        namespace,
        agent: AgentConfig {
            image,
            pull_policy,
            target_container,
        },
    };

    match command {
        Command::Ps(args) => ps::execute(&globals, args).await,
        Command::Redirect(args) => redirect::execute(&globals, args).await,
    }
}

/// Injects the agent into `pod_name` (if absent), waits for it, and returns
/// a manager connected to its control endpoint.
pub(crate) async fn attach(globals: &Globals, pod_name: &str) -> anyhow::Result<RedirectManager> {
    let client = Client::try_default()
        .await
        .context("failed to build cluster client")?;
    let namespace = globals
        .namespace
        .clone()
        .unwrap_or_else(|| client.default_namespace().to_string());
    let pods: Api<Pod> = Api::namespaced(client.clone(), &namespace);

    let _ = ensure_agent(&pods, pod_name, &globals.agent)
        .await
        .context("failed to inject agent container")?;

    let manager =
        RedirectManager::connect(client, &namespace, pod_name, &agent_container_name())
            .await
            .context("failed to reach agent control endpoint")?;
    Ok(manager)
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn binary_name_matches_app_name() {
        assert_eq!(Cli::command().get_name(), APP_NAME);
    }
}
