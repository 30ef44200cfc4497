//! The seam between endpoint orchestration and cryptography.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use crate::buffer::Buf;
use crate::certificate::Identity;
use crate::channel::HandshakeChannel;
use crate::{Config, Error};

/// Which side of the handshake a session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Result of driving one handshake step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// More round trips are needed.
    ///
    /// `advanced` is false when the input moved nothing forward, such as a
    /// repeated or out of order message.
    Pending { advanced: bool },
    /// Keys are derived and the peer is verified.
    Complete,
}

/// What an established session made of one datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opened {
    /// This many bytes of application plaintext were written to the output.
    Data(usize),
    /// Late handshake traffic. Any response is on the channel.
    Handshake,
    /// The peer closed the session.
    Closed,
}

/// A cryptographic session driven through a [`HandshakeChannel`].
///
/// Implementations read peer bytes from the channel and queue the datagrams
/// they produce on it. They never see the network, which lets the registry
/// keep any number of them behind one socket.
pub trait HandshakeDriver: Sized {
    /// Create a session for `role` talking to `peer`.
    fn new_session(
        role: Role,
        peer: SocketAddr,
        config: &Arc<Config>,
        identity: &Arc<Identity>,
    ) -> Result<Self, Error>;

    /// Consume whatever is in the channel's `received` queue and advance.
    ///
    /// Called once with an empty channel right after a client session is
    /// created so it can produce its opening flight.
    fn step(&mut self, channel: &mut HandshakeChannel, now: Instant) -> Result<Progress, Error>;

    /// Retransmit the current flight if its timer expired.
    fn handle_timeout(&mut self, channel: &mut HandshakeChannel, now: Instant)
        -> Result<(), Error>;

    /// When [`HandshakeDriver::handle_timeout`] next needs to run.
    fn poll_timeout(&self) -> Option<Instant>;

    /// Protect one application payload into one datagram.
    fn seal(&mut self, plaintext: &[u8], out: &mut Buf) -> Result<(), Error>;

    /// Unprotect one datagram received after the handshake completed.
    ///
    /// A record whose plaintext does not fit `out` is rejected before it is
    /// decrypted or counted against replay.
    fn open(
        &mut self,
        datagram: &[u8],
        channel: &mut HandshakeChannel,
        out: &mut [u8],
    ) -> Result<Opened, Error>;

    /// Queue a close notification for the peer.
    fn close(&mut self, channel: &mut HandshakeChannel) -> Result<(), Error>;

    /// DER certificate the peer presented, if any.
    fn peer_certificate(&self) -> Option<&[u8]>;
}
