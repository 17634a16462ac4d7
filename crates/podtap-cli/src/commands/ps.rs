//! `podtap ps` — List processes and listening sockets inside a pod.

use clap::Args;

use crate::commands::Globals;

/// Arguments for the `ps` command.
#[derive(Args, Debug)]
pub struct PsArgs {
    /// Name of the target pod.
    pub pod: String,
}

/// Executes the `ps` command.
///
/// Asks the agent for the pod's process list and displays it in a tabular
/// format, one row per process, listening addresses joined with commas.
///
/// # Errors
///
/// Returns an error if agent injection or the listing fails.
pub async fn execute(globals: &Globals, args: PsArgs) -> anyhow::Result<()> {
    let manager = crate::commands::attach(globals, &args.pod).await?;
    let mut processes = manager.list_processes().await?;
    processes.sort_by_key(|p| p.pid);

    if processes.is_empty() {
        println!("No processes found.");
        return Ok(());
    }

    println!("{:<8} {:<8} {:<24} {:<30}", "PID", "PPID", "NAME", "LISTEN");
    for process in &processes {
        let listen = process
            .listen_addresses
            .iter()
            .map(|addr| format!("{}:{}", addr.ip, addr.port))
            .collect::<Vec<_>>()
            .join(", ");
        println!(
            "{:<8} {:<8} {:<24} {:<30}",
            process.pid, process.ppid, process.name, listen
        );
    }

    Ok(())
}
