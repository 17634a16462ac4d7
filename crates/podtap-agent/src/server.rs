//! The agent's control service.
//!
//! Accepts control connections, one session per connection: a single
//! request, answered with a unary response or a stream of pairing-port
//! signals. Redirect sessions own their firewall rule and intercept
//! listener; both are released on every exit path, including client
//! disconnect and shutdown.

use std::collections::HashMap;
use std::net::SocketAddr;

use podtap_proto::message::{ListenAddress, ProcessRecord, Request};
use podtap_proto::server::{Session, SessionSink, SessionStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::error::{AgentError, Result};
use crate::redirect::Redirection;
use crate::sock_diag::DiagSocket;
use crate::{inventory, tunnel};

/// The listening control service.
#[derive(Debug)]
pub struct ControlService {
    listener: TcpListener,
}

impl ControlService {
    /// Binds the control listener. `bind_addr` may carry port `0` to let
    /// the OS choose.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn bind(bind_addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        Ok(Self { listener })
    }

    /// The bound control endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the local address cannot be read.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Writes the discovery line to stdout. The operator finds the control
    /// endpoint by scanning the container log for exactly this line, so it
    /// must go to stdout even though all other output is tracing on stderr.
    ///
    /// # Errors
    ///
    /// Returns an error if the local address cannot be read.
    #[allow(clippy::print_stdout)]
    pub fn announce(&self) -> Result<()> {
        println!(
            "{}{}",
            podtap_common::constants::LISTENING_PREFIX,
            self.local_addr()?
        );
        Ok(())
    }

    /// Serves control sessions until `shutdown` fires. Sessions run on
    /// their own tasks and fail independently.
    ///
    /// # Errors
    ///
    /// Returns an error if accepting a connection fails.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        loop {
            let (stream, peer) = tokio::select! {
                () = shutdown.cancelled() => {
                    tracing::info!("control service shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => accepted?,
            };

            let session_cancel = shutdown.child_token();
            // The span must be attached to the future, not held across its
            // awaits, so interleaved sessions keep their own attribution.
            drop(tokio::spawn(
                async move {
                    if let Err(err) = handle_connection(stream, session_cancel).await {
                        tracing::warn!(error = %err, "session ended with error");
                    }
                }
                .instrument(tracing::info_span!("session", %peer)),
            ));
        }
    }
}

async fn handle_connection(stream: TcpStream, cancel: CancellationToken) -> Result<()> {
    let mut session = Session::new(stream);
    let Some(request) = session.read_request().await? else {
        tracing::debug!("client closed before sending a request");
        return Ok(());
    };

    match request {
        Request::ListProcesses => handle_list_processes(session).await,
        Request::Redirect { port, direction } => {
            if port == 0 {
                session.send_error("port must be nonzero").await?;
                return Ok(());
            }
            let mut redirection = match Redirection::new(port, direction).await {
                Ok(redirection) => redirection,
                Err(err) => {
                    session
                        .send_error(format!("could not create redirection: {err}"))
                        .await?;
                    return Err(err);
                }
            };
            if let Err(err) = redirection.install().await {
                session
                    .send_error(format!("could not redirect: {err}"))
                    .await?;
                // No rule was installed; close only drops the listener.
                let _ = redirection.close().await;
                return Err(err);
            }

            let result = run_redirect_stream(session, &mut redirection, cancel).await;

            // Cleanup obligation: runs on success, error, disconnect, and
            // cancellation alike.
            if let Err(err) = redirection.close().await {
                tracing::warn!(error = %err, "failed to remove redirect rule");
            }
            result
        }
    }
}

async fn handle_list_processes(mut session: Session<TcpStream>) -> Result<()> {
    let records = tokio::task::spawn_blocking(collect_process_records)
        .await
        .map_err(|err| AgentError::Io(std::io::Error::other(err)))?;
    match records {
        Ok(records) => session.send_process_list(records).await.map_err(Into::into),
        Err(err) => {
            session.send_error(format!("could not list processes: {err}")).await?;
            Err(err)
        }
    }
}

/// Builds the process listing: the process table joined with the socket
/// inventory, excluding the agent itself and loopback-only bindings.
///
/// The socket inventory is advisory; if it fails the listing degrades to
/// processes without listen addresses.
fn collect_process_records() -> Result<Vec<ProcessRecord>> {
    let processes = inventory::list_processes()?;

    let sockets_by_pid: HashMap<u32, Vec<DiagSocket>> = match inventory::listening_sockets_by_pid()
    {
        Ok(map) => map,
        Err(err) => {
            tracing::error!(error = %err, "could not get listening ports");
            HashMap::new()
        }
    };

    let own_pid = std::process::id();
    let records = processes
        .into_iter()
        .filter(|process| process.pid != own_pid)
        .map(|process| {
            let listen_addresses = sockets_by_pid
                .get(&process.pid)
                .map(|sockets| {
                    sockets
                        .iter()
                        .map(|sock| ListenAddress {
                            ip: sock.id.source,
                            port: sock.id.source_port,
                        })
                        // Loopback bindings are unreachable from outside
                        // the pod.
                        .filter(|addr| !addr.is_loopback())
                        .collect()
                })
                .unwrap_or_default();
            ProcessRecord {
                pid: process.pid,
                ppid: process.ppid,
                name: process.name,
                listen_addresses,
            }
        })
        .collect();
    Ok(records)
}

async fn run_redirect_stream(
    session: Session<TcpStream>,
    redirection: &mut Redirection,
    cancel: CancellationToken,
) -> Result<()> {
    let Some(intercept) = redirection.take_listener() else {
        return Ok(());
    };

    let (signal_tx, mut signal_rx) = mpsc::channel(1);
    let tunnel_cancel = cancel.child_token();
    let tunnel_task = tokio::spawn(tunnel::tunnel(intercept, signal_tx, tunnel_cancel.clone()));

    let (mut sink, mut stream) = session.split();
    let result = pump_signals(&mut sink, &mut stream, &mut signal_rx, &cancel).await;

    // Closing the pairing/intercept listeners unblocks any pending accept.
    tunnel_cancel.cancel();
    match tunnel_task.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::debug!(error = %err, "tunnel ended with error"),
        Err(err) => tracing::debug!(error = %err, "tunnel task join error"),
    }

    result
}

async fn pump_signals(
    sink: &mut SessionSink<TcpStream>,
    stream: &mut SessionStream<TcpStream>,
    signal_rx: &mut mpsc::Receiver<u16>,
    cancel: &CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            () = stream.closed() => {
                tracing::debug!("client closed redirect session");
                return Ok(());
            }
            signal = signal_rx.recv() => match signal {
                Some(port) => sink.send_pairing_port(port).await?,
                // Tunnel loop ended on its own.
                None => return Ok(()),
            },
        }
    }
}
