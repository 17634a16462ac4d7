//! # podtap-agent
//!
//! Binary entry point for the in-pod helper. Binds the control service,
//! announces the endpoint on stdout, and serves until SIGINT/SIGTERM.

use clap::Parser;
use podtap_agent::ControlService;
use tokio_util::sync::CancellationToken;

/// In-pod helper for podtap: socket inventory and traffic redirection.
#[derive(Parser, Debug)]
#[command(name = "podtap-agent", version, about, long_about = None)]
struct Args {
    /// Address to bind the control service on; port 0 picks a free port.
    #[arg(long, default_value = "0.0.0.0:0")]
    bind: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout is reserved for the discovery line; all logging goes to
    // stderr.
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let service = ControlService::bind(&args.bind).await?;
    service.announce()?;

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    drop(tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("interrupt received"),
            Err(err) => tracing::error!(error = %err, "failed to listen for interrupt"),
        }
        signal_shutdown.cancel();
    }));

    service.serve(shutdown).await?;
    Ok(())
}
