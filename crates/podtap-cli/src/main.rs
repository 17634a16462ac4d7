//! # podtap — pod traffic inspection and redirection CLI
//!
//! Injects a privileged agent into a running pod as an ephemeral container,
//! lists the processes listening inside it, and redirects its traffic to
//! local ports.

mod commands;

use clap::Parser;

use crate::commands::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    commands::execute(cli).await
}
