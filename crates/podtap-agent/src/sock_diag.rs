//! Kernel socket-diagnostics codec and query.
//!
//! Talks `NETLINK_SOCK_DIAG` directly: one dump request asking for all TCP
//! sockets in LISTEN state, then a walk of the returned records. The wire
//! format has no schema or versioning, so both directions are implemented
//! as fixed-offset codecs with an explicit bounds check on every field
//! read; a truncated record yields [`AgentError::ShortRead`], never an
//! out-of-bounds access.

use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use socket2::{Domain, Protocol, Socket, Type};

use crate::error::{AgentError, Result};

/// Size of the socket identity block shared by requests and records.
pub const SIZEOF_SOCKET_ID: usize = 0x30;
/// Size of an `inet_diag_req_v2` request payload.
pub const SIZEOF_DIAG_REQUEST: usize = SIZEOF_SOCKET_ID + 0x8;
/// Size of an `inet_diag_msg` response record.
pub const SIZEOF_DIAG_SOCKET: usize = SIZEOF_SOCKET_ID + 0x18;

const NLMSG_HEADER_SIZE: usize = 16;
const NLMSG_ERROR: u16 = 2;
const NLMSG_DONE: u16 = 3;
const NLM_F_REQUEST: u16 = 0x0001;
const NLM_F_MULTI: u16 = 0x0002;
// NLM_F_ROOT | NLM_F_MATCH
const NLM_F_DUMP: u16 = 0x0300;

const SOCK_DIAG_BY_FAMILY: u16 = 20;

/// Bitmask selecting the TCP LISTEN state in a dump request.
pub const TCP_LISTEN_MASK: u32 = 1 << 10;

/// Identity of one socket as the kernel reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiagSocketId {
    /// Source (local) port, stored big-endian on the wire.
    pub source_port: u16,
    /// Destination port, stored big-endian on the wire.
    pub destination_port: u16,
    /// Source (local) address.
    pub source: IpAddr,
    /// Destination address.
    pub destination: IpAddr,
    /// Bound interface index.
    pub interface: u32,
    /// Kernel socket cookie.
    pub cookie: [u32; 2],
}

impl Default for DiagSocketId {
    fn default() -> Self {
        Self {
            source_port: 0,
            destination_port: 0,
            source: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            destination: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            interface: 0,
            cookie: [0; 2],
        }
    }
}

/// One parsed diagnostic-socket record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiagSocket {
    /// Address family (`AF_INET`/`AF_INET6`).
    pub family: u8,
    /// TCP state.
    pub state: u8,
    /// Active kernel timer.
    pub timer: u8,
    /// Retransmit count.
    pub retrans: u8,
    /// Socket identity.
    pub id: DiagSocketId,
    /// Timer expiry in milliseconds.
    pub expires: u32,
    /// Receive queue depth.
    pub rqueue: u32,
    /// Send queue depth.
    pub wqueue: u32,
    /// Owning UID.
    pub uid: u32,
    /// Owning inode, the join key against `/proc/<pid>/fd`.
    pub inode: u32,
}

/// Bounds-checked reader over a fixed-layout record.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or(AgentError::ShortRead {
            got: self.buf.len(),
            want: usize::MAX,
        })?;
        if end > self.buf.len() {
            return Err(AgentError::ShortRead {
                got: self.buf.len(),
                want: end,
            });
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u16_be(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn read_u32_ne(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
    }
}

impl DiagSocket {
    /// Parses one record of the fixed `inet_diag_msg` layout.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::ShortRead`] if the input is shorter than the
    /// record layout requires.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < SIZEOF_DIAG_SOCKET {
            return Err(AgentError::ShortRead {
                got: buf.len(),
                want: SIZEOF_DIAG_SOCKET,
            });
        }
        let mut rb = Cursor::new(buf);

        let family = rb.read_u8()?;
        let state = rb.read_u8()?;
        let timer = rb.read_u8()?;
        let retrans = rb.read_u8()?;

        let source_port = rb.read_u16_be()?;
        let destination_port = rb.read_u16_be()?;

        let (source, destination) = if i32::from(family) == libc::AF_INET6 {
            let src = ipv6_from(rb.take(16)?);
            let dst = ipv6_from(rb.take(16)?);
            (src, dst)
        } else {
            // IPv4 addresses occupy the first 4 bytes of each 16-byte field.
            let src = ipv4_from(rb.take(4)?);
            let _ = rb.take(12)?;
            let dst = ipv4_from(rb.take(4)?);
            let _ = rb.take(12)?;
            (src, dst)
        };

        Ok(Self {
            family,
            state,
            timer,
            retrans,
            id: DiagSocketId {
                source_port,
                destination_port,
                source,
                destination,
                interface: rb.read_u32_ne()?,
                cookie: [rb.read_u32_ne()?, rb.read_u32_ne()?],
            },
            expires: rb.read_u32_ne()?,
            rqueue: rb.read_u32_ne()?,
            wqueue: rb.read_u32_ne()?,
            uid: rb.read_u32_ne()?,
            inode: rb.read_u32_ne()?,
        })
    }
}

fn ipv4_from(bytes: &[u8]) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]))
}

fn ipv6_from(bytes: &[u8]) -> IpAddr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(bytes);
    IpAddr::V6(Ipv6Addr::from(octets))
}

/// An `inet_diag_req_v2` dump request.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiagRequest {
    /// Address family to dump.
    pub family: u8,
    /// Transport protocol to dump.
    pub protocol: u8,
    /// Requested extensions.
    pub ext: u8,
    /// Bitmask of socket states to include.
    pub states: u32,
    /// Identity filter; all-zero matches everything.
    pub id: DiagSocketId,
}

impl DiagRequest {
    /// Serializes the request into its fixed 56-byte layout, the exact
    /// inverse of [`DiagSocket::parse`] for the shared identity block.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(SIZEOF_DIAG_REQUEST);
        buf.push(self.family);
        buf.push(self.protocol);
        buf.push(self.ext);
        buf.push(0); // pad
        buf.extend_from_slice(&self.states.to_ne_bytes());

        buf.extend_from_slice(&self.id.source_port.to_be_bytes());
        buf.extend_from_slice(&self.id.destination_port.to_be_bytes());
        push_addr(&mut buf, self.id.source);
        push_addr(&mut buf, self.id.destination);
        buf.extend_from_slice(&self.id.interface.to_ne_bytes());
        buf.extend_from_slice(&self.id.cookie[0].to_ne_bytes());
        buf.extend_from_slice(&self.id.cookie[1].to_ne_bytes());

        debug_assert_eq!(buf.len(), SIZEOF_DIAG_REQUEST);
        buf
    }
}

fn push_addr(buf: &mut Vec<u8>, addr: IpAddr) {
    match addr {
        IpAddr::V4(v4) => {
            buf.extend_from_slice(&v4.octets());
            buf.extend_from_slice(&[0u8; 12]);
        }
        IpAddr::V6(v6) => buf.extend_from_slice(&v6.octets()),
    }
}

fn netlink_request(req: &DiagRequest) -> Vec<u8> {
    let payload = req.serialize();
    let total = NLMSG_HEADER_SIZE + payload.len();
    let mut msg = Vec::with_capacity(total);
    msg.extend_from_slice(&u32::try_from(total).unwrap_or(u32::MAX).to_ne_bytes());
    msg.extend_from_slice(&SOCK_DIAG_BY_FAMILY.to_ne_bytes());
    msg.extend_from_slice(&(NLM_F_REQUEST | NLM_F_DUMP).to_ne_bytes());
    msg.extend_from_slice(&1u32.to_ne_bytes()); // sequence
    msg.extend_from_slice(&0u32.to_ne_bytes()); // port id, kernel fills it in
    msg.extend_from_slice(&payload);
    msg
}

/// Queries the kernel for all IPv4 TCP sockets in the LISTEN state.
///
/// Individual malformed records are skipped; a `NLMSG_ERROR` reply is
/// surfaced as [`AgentError::Netlink`]. This call blocks and is expected to
/// run on a blocking worker.
///
/// # Errors
///
/// Returns an error if the diagnostic socket cannot be opened, the request
/// cannot be sent, or the kernel answers with an error message.
pub fn query_listening_sockets() -> Result<Vec<DiagSocket>> {
    let request = DiagRequest {
        family: u8::try_from(libc::AF_INET).unwrap_or(2),
        protocol: u8::try_from(libc::IPPROTO_TCP).unwrap_or(6),
        ext: 0,
        states: TCP_LISTEN_MASK,
        id: DiagSocketId::default(),
    };

    let mut socket = Socket::new_raw(
        Domain::from(libc::AF_NETLINK),
        Type::DGRAM,
        Some(Protocol::from(libc::NETLINK_SOCK_DIAG)),
    )?;

    socket.write_all(&netlink_request(&request))?;

    let mut sockets = Vec::new();
    let mut buf = vec![0u8; 32 * 1024];
    let mut saw_any = false;

    'dump: loop {
        let n = socket.read(&mut buf)?;
        if n == 0 {
            break;
        }
        let mut datagram = &buf[..n];
        let mut multi = false;

        while datagram.len() >= NLMSG_HEADER_SIZE {
            let msg_len = u32::from_ne_bytes([datagram[0], datagram[1], datagram[2], datagram[3]])
                as usize;
            let msg_type = u16::from_ne_bytes([datagram[4], datagram[5]]);
            let flags = u16::from_ne_bytes([datagram[6], datagram[7]]);
            if msg_len < NLMSG_HEADER_SIZE || msg_len > datagram.len() {
                break;
            }
            saw_any = true;
            multi |= flags & NLM_F_MULTI != 0;
            let payload = &datagram[NLMSG_HEADER_SIZE..msg_len];

            match msg_type {
                NLMSG_DONE => break 'dump,
                NLMSG_ERROR => {
                    if payload.len() < 4 {
                        return Err(AgentError::ShortRead {
                            got: payload.len(),
                            want: 4,
                        });
                    }
                    let errno =
                        i32::from_ne_bytes([payload[0], payload[1], payload[2], payload[3]]);
                    return Err(AgentError::Netlink { errno });
                }
                SOCK_DIAG_BY_FAMILY => {
                    match DiagSocket::parse(payload) {
                        Ok(sock) => sockets.push(sock),
                        Err(err) => {
                            tracing::debug!(error = %err, "skipping malformed diag record");
                        }
                    }
                }
                other => {
                    tracing::debug!(msg_type = other, "ignoring unexpected netlink message");
                }
            }

            // Messages are 4-byte aligned within a datagram.
            let aligned = (msg_len + 3) & !3;
            if aligned >= datagram.len() {
                break;
            }
            datagram = &datagram[aligned..];
        }

        if !multi {
            break;
        }
    }

    if !saw_any {
        return Err(AgentError::EmptyNetlinkReply);
    }
    Ok(sockets)
}
