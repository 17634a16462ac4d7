//! Server half of the control protocol.
//!
//! The agent drives one of these per accepted connection: read the single
//! request, then answer with a response, a stream of pairing-port signals,
//! or an error frame.

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use crate::error::{ProtoError, Result};
use crate::frame::{Frame, FrameCodec, FrameType};
use crate::message::{PairingPort, ProcessRecord, RemoteError, Request, Response};

/// Server side of one control session.
#[derive(Debug)]
pub struct Session<S> {
    framed: Framed<S, FrameCodec>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Session<S> {
    /// Wraps an accepted byte stream.
    pub fn new(stream: S) -> Self {
        Self {
            framed: Framed::new(stream, FrameCodec::new()),
        }
    }

    /// Reads the session's request. Returns `None` if the client went away
    /// before sending one.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a malformed/non-request
    /// frame.
    pub async fn read_request(&mut self) -> Result<Option<Request>> {
        let Some(frame) = self.framed.next().await else {
            return Ok(None);
        };
        let frame = frame?;
        if frame.frame_type != FrameType::Request {
            return Err(ProtoError::UnexpectedFrame {
                expected: "request",
                got: frame.frame_type.name(),
            });
        }
        Ok(Some(frame.decode()?))
    }

    /// Sends the process listing response.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the transport fails.
    pub async fn send_process_list(&mut self, processes: Vec<ProcessRecord>) -> Result<()> {
        let frame = Frame::encode(FrameType::Response, &Response::ProcessList { processes })?;
        self.framed.send(frame).await
    }

    /// Sends one pairing-port signal.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails, typically meaning the client
    /// disconnected; the caller tears the session down in response.
    pub async fn send_pairing_port(&mut self, port: u16) -> Result<()> {
        let frame = Frame::encode(FrameType::Stream, &PairingPort { port })?;
        self.framed.send(frame).await
    }

    /// Reports a session-fatal error to the client.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails.
    pub async fn send_error(&mut self, message: impl Into<String>) -> Result<()> {
        let frame = Frame::encode(
            FrameType::Error,
            &RemoteError {
                message: message.into(),
            },
        )?;
        self.framed.send(frame).await
    }

    /// Splits the session into independent send and receive halves so a
    /// streaming handler can emit signals while watching for client
    /// disconnect.
    pub fn split(self) -> (SessionSink<S>, SessionStream<S>) {
        let (sink, stream) = self.framed.split();
        (SessionSink { sink }, SessionStream { stream })
    }
}

/// Sending half of a split [`Session`].
#[derive(Debug)]
pub struct SessionSink<S> {
    sink: futures::stream::SplitSink<Framed<S, FrameCodec>, Frame>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> SessionSink<S> {
    /// Sends one pairing-port signal.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails.
    pub async fn send_pairing_port(&mut self, port: u16) -> Result<()> {
        let frame = Frame::encode(FrameType::Stream, &PairingPort { port })?;
        self.sink.send(frame).await
    }

    /// Reports a session-fatal error to the client.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails.
    pub async fn send_error(&mut self, message: impl Into<String>) -> Result<()> {
        let frame = Frame::encode(
            FrameType::Error,
            &RemoteError {
                message: message.into(),
            },
        )?;
        self.sink.send(frame).await
    }
}

/// Receiving half of a split [`Session`].
#[derive(Debug)]
pub struct SessionStream<S> {
    stream: futures::stream::SplitStream<Framed<S, FrameCodec>>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> SessionStream<S> {
    /// Resolves when the client closes (or breaks) its side of the
    /// connection. Frames arriving after the request are ignored.
    pub async fn closed(&mut self) {
        while let Some(frame) = self.stream.next().await {
            match frame {
                Ok(frame) => {
                    tracing::debug!(frame_type = frame.frame_type.name(), "ignoring late frame");
                }
                Err(_) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use podtap_common::types::Direction;

    use super::*;
    use crate::client::Control;
    use crate::message::ListenAddress;

    #[tokio::test]
    async fn list_processes_conversation() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let mut client = Control::new(client_io);
        let mut session = Session::new(server_io);

        let server = tokio::spawn(async move {
            let req = session.read_request().await.unwrap().unwrap();
            assert_eq!(req, Request::ListProcesses);
            session
                .send_process_list(vec![ProcessRecord {
                    pid: 7,
                    ppid: 1,
                    name: "nginx".into(),
                    listen_addresses: vec![ListenAddress {
                        ip: "0.0.0.0".parse().unwrap(),
                        port: 80,
                    }],
                }])
                .await
                .unwrap();
        });

        let processes = client.list_processes().await.unwrap();
        assert_eq!(processes.len(), 1);
        assert_eq!(processes[0].name, "nginx");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn redirect_streams_ports_in_order() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let mut client = Control::new(client_io);
        let mut session = Session::new(server_io);

        let server = tokio::spawn(async move {
            let req = session.read_request().await.unwrap().unwrap();
            assert_eq!(
                req,
                Request::Redirect {
                    port: 80,
                    direction: Direction::Inbound
                }
            );
            session.send_pairing_port(50001).await.unwrap();
            session.send_pairing_port(50001).await.unwrap();
            // Session ends by dropping the stream.
        });

        client.start_redirect(80, Direction::Inbound).await.unwrap();
        assert_eq!(client.next_pairing_port().await.unwrap(), Some(50001));
        assert_eq!(client.next_pairing_port().await.unwrap(), Some(50001));
        assert_eq!(client.next_pairing_port().await.unwrap(), None);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn error_frame_surfaces_as_remote_error() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let mut client = Control::new(client_io);
        let mut session = Session::new(server_io);

        let server = tokio::spawn(async move {
            let _ = session.read_request().await.unwrap();
            session.send_error("port must be nonzero").await.unwrap();
        });

        client.start_redirect(80, Direction::Outbound).await.unwrap();
        let err = client.next_pairing_port().await.unwrap_err();
        assert!(matches!(err, ProtoError::Remote(msg) if msg.contains("nonzero")));
        server.await.unwrap();
    }
}
