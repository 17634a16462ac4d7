//! Port-forward plumbing.
//!
//! Wraps the orchestrator's port-forward primitive into a plain duplex byte
//! stream. Both the control connection and every per-connection data-plane
//! hop are one forward each; a hop forward is fully independent of the
//! control forward.

use std::pin::Pin;
use std::task::{Context, Poll};

use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use kube::api::Portforwarder;
use podtap_common::constants::PORT_FORWARD_TIMEOUT;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::{ClientError, Result};

/// A duplex byte stream tunneled to one pod port. Keeps its forwarder
/// alive for as long as the stream is in use.
pub struct ForwardedStream {
    inner: Box<dyn DuplexIo>,
    _forwarder: Portforwarder,
}

/// Object-safe alias for the tunneled stream type.
trait DuplexIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> DuplexIo for T {}

impl std::fmt::Debug for ForwardedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardedStream").finish_non_exhaustive()
    }
}

/// Opens one port-forward to `port` on the pod and returns its byte
/// stream, bounded by the readiness timeout.
///
/// # Errors
///
/// Returns [`ClientError::PortForwardTimeout`] if the forward does not
/// become usable in time, or an orchestrator error if it fails outright.
pub async fn forward_stream(pods: &Api<Pod>, pod_name: &str, port: u16) -> Result<ForwardedStream> {
    let mut forwarder = tokio::time::timeout(PORT_FORWARD_TIMEOUT, pods.portforward(pod_name, &[port]))
        .await
        .map_err(|_| ClientError::PortForwardTimeout { port })??;

    let stream = forwarder
        .take_stream(port)
        .ok_or(ClientError::MissingForwardStream { port })?;

    Ok(ForwardedStream {
        inner: Box::new(stream),
        _forwarder: forwarder,
    })
}

impl AsyncRead for ForwardedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for ForwardedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
