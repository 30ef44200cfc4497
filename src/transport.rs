//! The physical socket and the poll loop around it.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Instant;

use crate::buffer::Buf;
use crate::driver::HandshakeDriver;
use crate::endpoint::HandshakeState;
use crate::registry::{EndpointRegistry, EvictReason, Routed};
use crate::Error;

/// Largest datagram the poll loop reads.
const MAX_DATAGRAM: usize = 65_535;

/// Something that moves datagrams.
pub trait Transport {
    /// Send one datagram. Best effort, never retried.
    fn send_datagram(&mut self, to: SocketAddr, datagram: &[u8]) -> io::Result<()>;

    /// Read one datagram into `buf` without blocking.
    ///
    /// `None` when nothing is waiting.
    fn receive_datagram(&mut self, buf: &mut [u8]) -> io::Result<Option<(SocketAddr, usize)>>;
}

/// The socket must be in non-blocking mode.
impl Transport for UdpSocket {
    fn send_datagram(&mut self, to: SocketAddr, datagram: &[u8]) -> io::Result<()> {
        self.send_to(datagram, to).map(|_| ())
    }

    fn receive_datagram(&mut self, buf: &mut [u8]) -> io::Result<Option<(SocketAddr, usize)>> {
        match self.recv_from(buf) {
            Ok((len, from)) => Ok(Some((from, len))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// What happened during one [`EndpointRegistry::pump`].
#[derive(Debug)]
pub enum Event {
    /// Handshake with the peer completed.
    Connected(SocketAddr),
    /// Plaintext from an established peer.
    Payload(SocketAddr, Buf),
    /// A datagram from an established peer was discarded.
    Rejected(SocketAddr, Error),
    /// The handshake with the peer failed.
    Failed(SocketAddr, Error),
    /// The sweep removed the peer.
    Evicted(SocketAddr, EvictReason),
    /// The peer closed the connection.
    Closed(SocketAddr),
    /// A datagram to the peer could not be sent.
    SendFailed(SocketAddr, Error),
    /// A datagram from the peer was lost to a local error, such as a full
    /// transmit queue.
    RouteFailed(SocketAddr, Error),
    /// Reading the transport failed. Whatever is still queued waits for the
    /// next pump.
    ReceiveFailed(Error),
}

impl<D: HandshakeDriver> EndpointRegistry<D> {
    /// Drain `transport`, route every datagram, send what that produced and
    /// then sweep.
    ///
    /// Errors never cut a pump short. They are reported as events next to
    /// everything else that happened.
    pub fn pump<T: Transport>(&mut self, transport: &mut T, now: Instant) -> Vec<Event> {
        let mut events = Vec::new();
        let mut buf = vec![0; MAX_DATAGRAM];

        loop {
            let (from, len) = match transport.receive_datagram(&mut buf) {
                Ok(Some(received)) => received,
                Ok(None) => break,
                Err(e) => {
                    warn!("Receive failed: {}", e);
                    events.push(Event::ReceiveFailed(e.into()));
                    break;
                }
            };
            let before = self.state(from);

            let routed = match self.on_datagram_received(from, &buf[..len], now) {
                Ok(routed) => routed,
                Err(e) => {
                    warn!("Routing datagram from {} failed: {}", from, e);
                    events.push(Event::RouteFailed(from, e));
                    continue;
                }
            };

            match routed {
                Routed::Dropped => {}
                Routed::Challenge { transmit } => {
                    self.send(transport, from, transmit, &mut events);
                }
                Routed::Handshake { transmit, state } => {
                    for datagram in transmit {
                        self.send(transport, from, datagram, &mut events);
                    }
                    let connected = state == HandshakeState::Complete
                        && before != Some(HandshakeState::Complete);
                    if connected {
                        events.push(Event::Connected(from));
                    }
                }
                Routed::Payload(payload) => events.push(Event::Payload(from, payload)),
                Routed::Rejected(e) => events.push(Event::Rejected(from, e)),
                Routed::Failed(e) => events.push(Event::Failed(from, e)),
                Routed::Closed => events.push(Event::Closed(from)),
            }
        }

        let sweep = self.sweep(now);
        for (to, datagram) in sweep.transmit {
            self.send(transport, to, datagram, &mut events);
        }
        for (addr, reason) in sweep.evicted {
            events.push(Event::Evicted(addr, reason));
        }

        events
    }

    fn send<T: Transport>(
        &mut self,
        transport: &mut T,
        to: SocketAddr,
        datagram: Buf,
        events: &mut Vec<Event>,
    ) {
        if let Err(e) = transport.send_datagram(to, &datagram) {
            warn!("Send to {} failed: {}", to, e);
            events.push(Event::SendFailed(to, e.into()));
        }
        self.recycle(datagram);
    }
}
