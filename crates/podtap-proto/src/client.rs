//! Client half of the control protocol.

use futures::{SinkExt, StreamExt};
use podtap_common::types::Direction;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use crate::error::{ProtoError, Result};
use crate::frame::{Frame, FrameCodec, FrameType};
use crate::message::{PairingPort, ProcessRecord, RemoteError, Request, Response};

/// One control session, generic over the transport. In production the
/// transport is a port-forwarded stream; tests use in-memory duplex pipes.
#[derive(Debug)]
pub struct Control<S> {
    framed: Framed<S, FrameCodec>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Control<S> {
    /// Wraps a connected byte stream in a control session.
    pub fn new(stream: S) -> Self {
        Self {
            framed: Framed::new(stream, FrameCodec::new()),
        }
    }

    /// Requests the process/socket listing.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails, the agent reports an error,
    /// or the response is malformed.
    pub async fn list_processes(&mut self) -> Result<Vec<ProcessRecord>> {
        self.send(Frame::encode(FrameType::Request, &Request::ListProcesses)?)
            .await?;

        let frame = self.recv().await?;
        match frame.frame_type {
            FrameType::Response => {
                let Response::ProcessList { processes } = frame.decode()?;
                Ok(processes)
            }
            FrameType::Error => Err(remote_error(&frame)?),
            other => Err(ProtoError::UnexpectedFrame {
                expected: "response",
                got: other.name(),
            }),
        }
    }

    /// Starts a redirect session for `port` in the given direction. Pairing
    /// ports are then read with [`Self::next_pairing_port`].
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be sent.
    pub async fn start_redirect(&mut self, port: u16, direction: Direction) -> Result<()> {
        self.send(Frame::encode(
            FrameType::Request,
            &Request::Redirect { port, direction },
        )?)
        .await
    }

    /// Waits for the next pairing-port signal. Returns `None` when the agent
    /// closes the stream cleanly.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails, the agent reports an error,
    /// or a non-stream frame arrives.
    pub async fn next_pairing_port(&mut self) -> Result<Option<u16>> {
        let Some(frame) = self.framed.next().await else {
            return Ok(None);
        };
        let frame = frame?;
        match frame.frame_type {
            FrameType::Stream => {
                let PairingPort { port } = frame.decode()?;
                Ok(Some(port))
            }
            FrameType::Error => Err(remote_error(&frame)?),
            other => Err(ProtoError::UnexpectedFrame {
                expected: "stream",
                got: other.name(),
            }),
        }
    }

    async fn send(&mut self, frame: Frame) -> Result<()> {
        self.framed.send(frame).await
    }

    async fn recv(&mut self) -> Result<Frame> {
        self.framed
            .next()
            .await
            .ok_or(ProtoError::ConnectionClosed)?
    }
}

fn remote_error(frame: &Frame) -> Result<ProtoError> {
    let RemoteError { message } = frame.decode()?;
    Ok(ProtoError::Remote(message))
}
