//! UDP socket wrapper
//!
//! Configures a datagram socket through `socket2` (address reuse, buffer
//! sizes, non-blocking mode) and then drives it as a std `UdpSocket`.

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io::{self, ErrorKind};
use std::net::{SocketAddr, UdpSocket};
use thiserror::Error;

/// Receive buffer requested for media sockets
pub const DEFAULT_RECV_BUFFER_SIZE: usize = 1 << 20;

/// Largest datagram accepted
pub const MAX_DATAGRAM_SIZE: usize = 65_536;

#[derive(Error, Debug)]
pub enum SocketError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid socket address")]
    InvalidAddress,
}

impl SocketError {
    /// The socket has nothing to read (or no room to write) right now
    pub fn is_would_block(&self) -> bool {
        matches!(self, SocketError::Io(err) if err.kind() == ErrorKind::WouldBlock)
    }
}

/// Non-blocking UDP socket for RTP traffic
#[derive(Debug)]
pub struct RtpSocket {
    inner: UdpSocket,
}

impl RtpSocket {
    /// Create a socket bound to `addr`
    pub fn bind(addr: SocketAddr) -> Result<Self, SocketError> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };

        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.set_nonblocking(true)?;

        // Best effort; the OS may cap it
        if let Err(err) = socket.set_recv_buffer_size(DEFAULT_RECV_BUFFER_SIZE) {
            tracing::debug!("could not enlarge receive buffer: {}", err);
        }

        Ok(RtpSocket {
            inner: socket.into(),
        })
    }

    pub fn set_send_buffer_size(&self, size: usize) -> Result<(), SocketError> {
        SockRef::from(&self.inner).set_send_buffer_size(size)?;
        Ok(())
    }

    pub fn set_recv_buffer_size(&self, size: usize) -> Result<(), SocketError> {
        SockRef::from(&self.inner).set_recv_buffer_size(size)?;
        Ok(())
    }

    pub fn recv_buffer_size(&self) -> Result<usize, SocketError> {
        Ok(SockRef::from(&self.inner).recv_buffer_size()?)
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        Ok(self.inner.local_addr()?)
    }

    /// Send one datagram
    pub fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize, SocketError> {
        Ok(self.inner.send_to(buf, target)?)
    }

    /// Receive one datagram
    ///
    /// Fails with a would-block error when nothing is queued.
    pub fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), SocketError> {
        Ok(self.inner.recv_from(buf)?)
    }

    pub fn try_clone(&self) -> Result<Self, SocketError> {
        Ok(RtpSocket {
            inner: self.inner.try_clone()?,
        })
    }
}
