//! Hole-punch engines.
//!
//! One capability per transport behind [`Puncher`]: bind the punch socket
//! to the same local port the control connection used, then drive the
//! transport-specific traversal until a peer socket exists or the deadline
//! passes. Engines block the calling thread up to their deadline and never
//! spawn; callers wanting concurrency run them on their own thread.

mod tcp;
pub use tcp::TcpPuncher;
mod udp;
pub use udp::UdpPuncher;

use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};

use crate::Result;

/// Which side of the rendezvous this peer played.
///
/// The listening peer keeps an acceptor open and dials only to open its NAT
/// mapping; the connecting peer dials until a connection completes. UDP
/// punching is symmetric and ignores the role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Listener,
    Dialer,
}

/// A transport-specific hole-punch strategy.
pub trait Puncher {
    type Conn;

    /// Punch from `local` toward `peer`, returning the established peer
    /// socket or [`Error::PunchTimeout`](crate::Error::PunchTimeout) once
    /// the retry budget is spent.
    fn punch(&self, local: SocketAddr, peer: SocketAddr, role: Role) -> Result<Self::Conn>;
}

/// Stream socket bound to `local` with the reuse options punching depends
/// on (the control connection and the punch socket share one port).
pub(crate) fn stream_socket(local: SocketAddr) -> Result<Socket> {
    let sock = Socket::new(Domain::for_address(local), Type::STREAM, Some(Protocol::TCP))?;
    sock.set_reuse_address(true)?;
    #[cfg(unix)]
    sock.set_reuse_port(true)?;
    sock.bind(&local.into())?;
    Ok(sock)
}

/// Datagram socket bound to `local`.
pub(crate) fn dgram_socket(local: SocketAddr) -> Result<Socket> {
    let sock = Socket::new(Domain::for_address(local), Type::DGRAM, Some(Protocol::UDP))?;
    sock.set_reuse_address(true)?;
    sock.bind(&local.into())?;
    Ok(sock)
}
