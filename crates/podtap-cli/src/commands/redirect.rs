//! `podtap redirect` — Divert a pod's connections to local ports.

use anyhow::bail;
use clap::Args;
use podtap_common::types::PortPair;

use crate::commands::Globals;

/// Arguments for the `redirect` command.
#[derive(Args, Debug)]
pub struct RedirectArgs {
    /// Name of the target pod.
    pub pod: String,

    /// Port pairs to redirect, as `REMOTE`, `REMOTE:LOCAL`, or `REMOTE:`.
    /// With no pairs given, every non-loopback port in LISTEN state is
    /// redirected to the same local port.
    pub ports: Vec<PortPair>,

    /// Redirect connections the pod initiates instead of connections it
    /// receives.
    #[arg(long)]
    pub outgoing: bool,
}

/// Executes the `redirect` command.
///
/// Runs one redirect session per port pair, all concurrently, until every
/// session ends, one of them fails, or the user interrupts.
///
/// # Errors
///
/// Returns an error if `--outgoing` is given without ports, no ports are
/// found to redirect, or any session fails.
pub async fn execute(globals: &Globals, args: RedirectArgs) -> anyhow::Result<()> {
    // Listening ports cannot be enumerated for the outbound case; the
    // targets live outside the pod.
    if args.outgoing && args.ports.is_empty() {
        bail!("must specify at least one port pair to redirect");
    }

    let manager = crate::commands::attach(globals, &args.pod).await?;

    let pairs: Vec<PortPair> = if args.ports.is_empty() {
        manager
            .list_listening_ports()
            .await?
            .into_iter()
            .map(|port| PortPair {
                remote: port,
                local: port,
            })
            .collect()
    } else {
        args.ports.clone()
    };
    if pairs.is_empty() {
        bail!("no ports to redirect");
    }

    let outgoing = args.outgoing;
    let direction = if outgoing { "outgoing" } else { "incoming" };
    let mut sessions = Vec::with_capacity(pairs.len());
    for pair in &pairs {
        println!(
            "redirecting {direction} traffic from {}:{} to localhost:{}",
            args.pod, pair.remote, pair.local
        );
        let pair = *pair;
        let manager = &manager;
        sessions.push(async move {
            if outgoing {
                manager.redirect_outgoing(pair.remote, pair.local).await
            } else {
                manager.redirect_incoming(pair.remote, pair.local).await
            }
        });
    }

    tokio::select! {
        result = futures::future::try_join_all(sessions) => {
            let _ = result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, closing redirect sessions");
        }
    }

    Ok(())
}
