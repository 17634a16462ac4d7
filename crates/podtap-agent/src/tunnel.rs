//! Tunnel engine: pairs diverted connections with data-plane hops.
//!
//! One pairing listener is bound per session and reused for every diverted
//! connection, which bounds resource usage but serializes connection
//! establishment: the next accept on the intercept listener happens only
//! after the previous pairing accept completed. Established pairings are
//! spliced on their own tasks and do not block the loop.

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Runs the pairing loop for one redirect session.
///
/// For each connection accepted on `intercept`, the pairing listener's port
/// is emitted on `signal`, then exactly one connection is accepted on the
/// pairing listener (the data-plane hop the peer opens in response) and the
/// two are spliced until either side closes.
///
/// Returns when `cancel` fires, when the signal receiver is dropped (the
/// session ended), or with an error if an accept fails.
///
/// # Errors
///
/// Returns an error if binding the pairing listener or an accept fails.
pub async fn tunnel(
    intercept: TcpListener,
    signal: mpsc::Sender<u16>,
    cancel: CancellationToken,
) -> Result<()> {
    let pairing = TcpListener::bind(("127.0.0.1", 0)).await?;
    let pairing_port = pairing.local_addr()?.port();

    loop {
        tracing::debug!("waiting for diverted connection");
        let (mut diverted, peer) = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            accepted = intercept.accept() => accepted?,
        };

        tracing::debug!(%peer, pairing_port, "signaling pairing port");
        if signal.send(pairing_port).await.is_err() {
            // Session is gone; nobody will dial the pairing port.
            return Ok(());
        }

        tracing::debug!("waiting for data-plane hop");
        let (mut hop, _) = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            accepted = pairing.accept() => accepted?,
        };

        tracing::debug!(%peer, "splicing connection pair");
        drop(tokio::spawn(async move {
            match tokio::io::copy_bidirectional(&mut diverted, &mut hop).await {
                Ok((up, down)) => {
                    tracing::debug!(%peer, up, down, "connection pair closed");
                }
                Err(err) => {
                    tracing::debug!(%peer, error = %err, "connection pair aborted");
                }
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    use super::*;

    async fn start_tunnel() -> (std::net::SocketAddr, mpsc::Receiver<u16>, CancellationToken) {
        let intercept = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = intercept.local_addr().unwrap();
        let (tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        drop(tokio::spawn(tunnel(intercept, tx, cancel.clone())));
        (addr, rx, cancel)
    }

    #[tokio::test]
    async fn proxies_bytes_both_ways() {
        let (addr, mut rx, _cancel) = start_tunnel().await;

        let mut app = TcpStream::connect(addr).await.unwrap();
        let port = rx.recv().await.unwrap();
        let mut operator = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

        app.write_all(b"hello from the pod").await.unwrap();
        let mut buf = [0u8; 18];
        operator.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello from the pod");

        operator.write_all(b"ack").await.unwrap();
        let mut buf = [0u8; 3];
        app.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ack");
    }

    #[tokio::test]
    async fn two_connections_yield_two_ordered_signals() {
        let (addr, mut rx, _cancel) = start_tunnel().await;

        let mut first = TcpStream::connect(addr).await.unwrap();
        let port1 = rx.recv().await.unwrap();

        // A second diverted connection can arrive immediately, but its
        // signal must not be consumable before the first pairing accept.
        let mut second = TcpStream::connect(addr).await.unwrap();
        let early = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(early.is_err(), "second signal arrived before first pairing");

        let mut hop1 = TcpStream::connect(("127.0.0.1", port1)).await.unwrap();
        let port2 = rx.recv().await.unwrap();
        assert_eq!(port1, port2, "pairing listener is reused per session");
        let mut hop2 = TcpStream::connect(("127.0.0.1", port2)).await.unwrap();

        // Each pairing carries its own connection's bytes.
        first.write_all(b"one").await.unwrap();
        second.write_all(b"two").await.unwrap();
        let mut buf = [0u8; 3];
        hop1.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"one");
        hop2.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"two");
    }

    #[tokio::test]
    async fn cancellation_stops_the_loop() {
        let (addr, mut rx, cancel) = start_tunnel().await;

        cancel.cancel();
        // Give the loop a moment to observe cancellation.
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The tunnel no longer signals for new connections.
        let _conn = TcpStream::connect(addr).await;
        let signal = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(matches!(signal, Err(_) | Ok(None)));
    }

    #[tokio::test]
    async fn dropped_receiver_ends_the_loop() {
        let intercept = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = intercept.local_addr().unwrap();
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let handle = tokio::spawn(tunnel(intercept, tx, CancellationToken::new()));

        let _app = TcpStream::connect(addr).await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
