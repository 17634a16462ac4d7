//! # podtap-proto
//!
//! Wire format for the control channel between the operator and the in-pod
//! agent.
//!
//! One session is one bidirectional byte stream (in practice, a
//! port-forwarded connection). The client sends exactly one request per
//! session; the agent answers with a single response, a stream of pairing
//! port signals, or an error frame. Frames are length-prefixed and carry
//! JSON payloads.

pub mod client;
pub mod error;
pub mod frame;
pub mod message;
pub mod server;

pub use client::Control;
pub use error::{ProtoError, Result};
pub use frame::{Frame, FrameCodec, FrameType, MAX_FRAME_SIZE};
pub use message::{ListenAddress, PairingPort, ProcessRecord, RemoteError, Request, Response};
