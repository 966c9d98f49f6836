//! UDP transport components
//!
//! `UdpRtpInput` drains a socket on every timer tick and emits each datagram
//! as an inbound RTP or RTCP message. `UdpRtpOutput` sends outbound RTP and
//! RTCP messages to a list of destinations.

use crate::socket::{RtpSocket, SocketError, MAX_DATAGRAM_SIZE};
use bytes::Bytes;
use mip_core::{
    ChainContext, Clock, Component, ComponentError, IterationQueue, Message, MessageRef,
    RtpDatagram, RtpKind,
};
use mip_rtp::is_rtcp;
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::Arc;
use tracing::{debug, warn};

impl From<SocketError> for ComponentError {
    fn from(err: SocketError) -> Self {
        match err {
            SocketError::Io(err) => ComponentError::Io(err),
            other => ComponentError::Other(other.to_string()),
        }
    }
}

/// Upper bound on datagrams read per tick
const MAX_READS_PER_TICK: usize = 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UdpInputStats {
    pub datagrams: u64,
    pub bytes: u64,
    pub rtp_packets: u64,
    pub rtcp_packets: u64,
    pub empty_dropped: u64,
    pub recv_errors: u64,
}

pub struct UdpRtpInput {
    name: String,
    socket: RtpSocket,
    clock: Arc<dyn Clock>,
    buffer: Vec<u8>,
    queue: IterationQueue,
    stats: UdpInputStats,
}

impl UdpRtpInput {
    pub fn new(
        name: impl Into<String>,
        socket: RtpSocket,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ComponentError> {
        Ok(UdpRtpInput {
            name: name.into(),
            socket,
            clock,
            buffer: vec![0u8; MAX_DATAGRAM_SIZE],
            queue: IterationQueue::new(),
            stats: UdpInputStats::default(),
        })
    }

    /// Bind a fresh socket and wrap it
    pub fn bind(
        name: impl Into<String>,
        addr: SocketAddr,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ComponentError> {
        Self::new(name, RtpSocket::bind(addr)?, clock)
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ComponentError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn stats(&self) -> UdpInputStats {
        self.stats
    }

    fn drain(&mut self) -> Result<(), ComponentError> {
        for _ in 0..MAX_READS_PER_TICK {
            let received = self.socket.recv_from(&mut self.buffer);
            if self.handle_receive(received).is_break() {
                return Ok(());
            }
        }
        warn!(input = %self.name, "read limit reached, leaving datagrams for the next tick");
        Ok(())
    }

    /// Queue one receive result; breaks when reading should wait for the next tick
    fn handle_receive(
        &mut self,
        received: Result<(usize, SocketAddr), SocketError>,
    ) -> ControlFlow<()> {
        let (len, peer) = match received {
            Ok(received) => received,
            Err(err) if err.is_would_block() => return ControlFlow::Break(()),
            Err(err) => {
                // ICMP errors from earlier sends surface here; retry next tick
                self.stats.recv_errors += 1;
                debug!(input = %self.name, "receive error: {}", err);
                return ControlFlow::Break(());
            }
        };

        self.stats.datagrams += 1;
        self.stats.bytes += len as u64;
        if len == 0 {
            self.stats.empty_dropped += 1;
            return ControlFlow::Continue(());
        }

        let data = Bytes::copy_from_slice(&self.buffer[..len]);
        let kind = if is_rtcp(&data) {
            self.stats.rtcp_packets += 1;
            RtpKind::ControlIn
        } else {
            self.stats.rtp_packets += 1;
            RtpKind::PacketIn
        };

        self.queue.push(
            Message::Rtp(RtpDatagram {
                kind,
                data,
                time: self.clock.now(),
                peer: Some(peer),
            })
            .into_ref(),
        );
        ControlFlow::Continue(())
    }
}

impl Component for UdpRtpInput {
    fn name(&self) -> &str {
        &self.name
    }

    fn push(
        &mut self,
        _chain: &ChainContext,
        iteration: u64,
        message: &MessageRef,
    ) -> Result<(), ComponentError> {
        if !message.is_system() {
            return Err(ComponentError::unexpected("system", message));
        }
        self.queue.begin(iteration);
        self.drain()
    }

    fn pull(
        &mut self,
        _chain: &ChainContext,
        iteration: u64,
    ) -> Result<Option<MessageRef>, ComponentError> {
        self.queue.begin(iteration);
        Ok(self.queue.next())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UdpOutputStats {
    pub rtp_sent: u64,
    pub rtcp_sent: u64,
    pub bytes_sent: u64,
    pub send_errors: u64,
}

/// Where one peer receives RTP and RTCP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Destination {
    pub rtp: SocketAddr,
    pub rtcp: SocketAddr,
}

impl Destination {
    /// RTCP on the next port up
    pub fn new(rtp: SocketAddr) -> Self {
        let mut rtcp = rtp;
        rtcp.set_port(rtp.port().wrapping_add(1));
        Destination { rtp, rtcp }
    }

    /// RTP and RTCP share one port
    pub fn muxed(addr: SocketAddr) -> Self {
        Destination {
            rtp: addr,
            rtcp: addr,
        }
    }
}

pub struct UdpRtpOutput {
    name: String,
    socket: RtpSocket,
    destinations: Vec<Destination>,
    stats: UdpOutputStats,
}

impl UdpRtpOutput {
    pub fn new(name: impl Into<String>, socket: RtpSocket) -> Self {
        UdpRtpOutput {
            name: name.into(),
            socket,
            destinations: Vec::new(),
            stats: UdpOutputStats::default(),
        }
    }

    pub fn add_destination(&mut self, destination: Destination) {
        if !self.destinations.contains(&destination) {
            self.destinations.push(destination);
        }
    }

    pub fn remove_destination(&mut self, rtp: SocketAddr) -> bool {
        let before = self.destinations.len();
        self.destinations.retain(|d| d.rtp != rtp);
        self.destinations.len() != before
    }

    pub fn destinations(&self) -> &[Destination] {
        &self.destinations
    }

    pub fn stats(&self) -> UdpOutputStats {
        self.stats
    }

    fn send(&mut self, datagram: &RtpDatagram) {
        let control = datagram.kind == RtpKind::ControlOut;
        for destination in &self.destinations {
            let target = if control {
                destination.rtcp
            } else {
                destination.rtp
            };
            match self.socket.send_to(&datagram.data, target) {
                Ok(sent) => {
                    self.stats.bytes_sent += sent as u64;
                    if control {
                        self.stats.rtcp_sent += 1;
                    } else {
                        self.stats.rtp_sent += 1;
                    }
                }
                Err(err) => {
                    // A full send buffer or an unreachable peer costs one datagram
                    self.stats.send_errors += 1;
                    debug!(output = %self.name, %target, "send failed: {}", err);
                }
            }
        }
    }
}

impl Component for UdpRtpOutput {
    fn name(&self) -> &str {
        &self.name
    }

    fn push(
        &mut self,
        _chain: &ChainContext,
        _iteration: u64,
        message: &MessageRef,
    ) -> Result<(), ComponentError> {
        match message.as_ref() {
            Message::Rtp(datagram)
                if matches!(datagram.kind, RtpKind::PacketOut | RtpKind::ControlOut) =>
            {
                self.send(datagram);
                Ok(())
            }
            other => Err(ComponentError::unexpected("outbound rtp", other)),
        }
    }

    fn pull(
        &mut self,
        _chain: &ChainContext,
        _iteration: u64,
    ) -> Result<Option<MessageRef>, ComponentError> {
        Ok(None)
    }
}
