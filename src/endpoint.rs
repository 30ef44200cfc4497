//! One logical connection to one peer address.
//!
//! An endpoint owns its session and its [`HandshakeChannel`]. It knows
//! nothing about sockets; whatever it produces is queued for the caller to
//! send to [`Endpoint::peer`].
//!
//! ```text
//!          connect()                       accept()
//!   None ────────────▶ Connecting   None ───────────▶ Accepting
//!                          │                              │
//!                          │ continue_handshake()         │
//!                          ▼                              ▼
//!                      Complete  ◀────────────────────────┘
//!
//!   Connecting | Accepting ── any handshake error ──▶ Failed
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use crate::buffer::Buf;
use crate::certificate::Identity;
use crate::channel::HandshakeChannel;
use crate::driver::{HandshakeDriver, Opened, Progress, Role};
use crate::session::Session;
use crate::{Config, Error};

/// Where an endpoint is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeState {
    /// Created, neither side has spoken.
    None,
    /// We initiated the handshake.
    Connecting,
    /// The peer initiated the handshake.
    Accepting,
    /// Keys are established, application data flows.
    Complete,
    /// The handshake failed. Terminal.
    Failed,
}

impl HandshakeState {
    /// Human readable name of the state.
    pub fn name(&self) -> &'static str {
        match self {
            HandshakeState::None => "None",
            HandshakeState::Connecting => "Connecting",
            HandshakeState::Accepting => "Accepting",
            HandshakeState::Complete => "Complete",
            HandshakeState::Failed => "Failed",
        }
    }
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome of a handshake call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Pending,
    Complete,
    Failed,
}

/// Outcome of [`Endpoint::decode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoded {
    /// This many bytes of plaintext were written to the output.
    Payload(usize),
    /// Protocol traffic with nothing for the application. Any answer is
    /// queued for transmission.
    Control,
    /// The peer closed the connection.
    Closed,
}

pub struct Endpoint<D: HandshakeDriver = Session> {
    peer: SocketAddr,
    state: HandshakeState,

    /// Created by the first connect/accept.
    session: Option<D>,

    channel: HandshakeChannel,

    /// Why the endpoint is [`HandshakeState::Failed`].
    failure: Option<Error>,

    created: Instant,
    last_progress: Instant,
    last_received: Instant,

    config: Arc<Config>,
    identity: Arc<Identity>,
}

impl<D: HandshakeDriver> Endpoint<D> {
    pub fn new(peer: SocketAddr, config: Arc<Config>, identity: Arc<Identity>, now: Instant) -> Self {
        Endpoint {
            peer,
            state: HandshakeState::None,
            session: None,
            channel: HandshakeChannel::new(config.max_queue_tx()),
            failure: None,
            created: now,
            last_progress: now,
            last_received: now,
            config,
            identity,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// The error that failed the handshake.
    pub fn failure(&self) -> Option<&Error> {
        self.failure.as_ref()
    }

    pub fn is_handshaking(&self) -> bool {
        matches!(
            self.state,
            HandshakeState::Connecting | HandshakeState::Accepting
        )
    }

    /// Start a handshake as the initiating side.
    ///
    /// The opening flight is queued for transmission.
    pub fn connect(&mut self, now: Instant) -> Result<Status, Error> {
        self.start(Role::Client, "connect", None, now)
    }

    /// Answer a handshake the peer initiated with `datagram`.
    pub fn accept(&mut self, datagram: &[u8], now: Instant) -> Result<Status, Error> {
        self.start(Role::Server, "accept", Some(datagram), now)
    }

    fn start(
        &mut self,
        role: Role,
        op: &'static str,
        datagram: Option<&[u8]>,
        now: Instant,
    ) -> Result<Status, Error> {
        match self.state {
            HandshakeState::None => {}
            HandshakeState::Failed => return Ok(Status::Failed),
            state => return Err(Error::Misuse { op, state }),
        }

        let session = D::new_session(role, self.peer, &self.config, &self.identity)?;
        self.session = Some(session);
        self.state = match role {
            Role::Client => HandshakeState::Connecting,
            Role::Server => HandshakeState::Accepting,
        };
        debug!("{} {} ({})", op, self.peer, self.state);

        if let Some(datagram) = datagram {
            self.channel.feed(datagram);
            self.last_received = now;
        }
        self.drive(now)
    }

    /// Feed the next handshake datagram from the peer.
    pub fn continue_handshake(&mut self, datagram: &[u8], now: Instant) -> Result<Status, Error> {
        match self.state {
            HandshakeState::Connecting | HandshakeState::Accepting => {}
            HandshakeState::Failed => return Ok(Status::Failed),
            state => {
                return Err(Error::Misuse {
                    op: "continue_handshake",
                    state,
                })
            }
        }

        self.channel.feed(datagram);
        self.last_received = now;
        self.drive(now)
    }

    fn drive(&mut self, now: Instant) -> Result<Status, Error> {
        let Some(session) = self.session.as_mut() else {
            return Err(Error::Misuse {
                op: "continue_handshake",
                state: self.state,
            });
        };

        match session.step(&mut self.channel, now) {
            Ok(Progress::Pending { advanced }) => {
                if advanced {
                    self.last_progress = now;
                }
                Ok(Status::Pending)
            }
            Ok(Progress::Complete) => {
                self.last_progress = now;
                self.state = HandshakeState::Complete;
                debug!("Handshake with {} complete", self.peer);
                Ok(Status::Complete)
            }
            // Local resource exhaustion, not the peer's doing.
            Err(e @ Error::TransmitQueueFull) => Err(e),
            Err(e) => Ok(self.fail(e)),
        }
    }

    fn fail(&mut self, error: Error) -> Status {
        debug!("Handshake with {} failed: {}", self.peer, error);
        self.state = HandshakeState::Failed;
        self.failure = Some(error);
        self.session = None;
        Status::Failed
    }

    /// Decrypt one datagram from an established peer into `out`.
    ///
    /// Errors concern only this datagram; the endpoint stays `Complete`.
    pub fn decode(&mut self, datagram: &[u8], out: &mut [u8]) -> Result<Decoded, Error> {
        let session = match (self.state, self.session.as_mut()) {
            (HandshakeState::Complete, Some(session)) => session,
            (state, _) => return Err(Error::Misuse { op: "decode", state }),
        };

        match session.open(datagram, &mut self.channel, out)? {
            Opened::Data(len) => Ok(Decoded::Payload(len)),
            Opened::Handshake => Ok(Decoded::Control),
            Opened::Closed => Ok(Decoded::Closed),
        }
    }

    /// Encrypt `plaintext` into one datagram in `out`.
    pub fn encode(&mut self, plaintext: &[u8], out: &mut Buf) -> Result<(), Error> {
        let session = match (self.state, self.session.as_mut()) {
            (HandshakeState::Complete, Some(session)) => session,
            (state, _) => return Err(Error::Misuse { op: "encode", state }),
        };
        session.seal(plaintext, out)
    }

    /// Queue a close notification if the connection is established.
    pub fn close(&mut self) -> Result<(), Error> {
        if self.state != HandshakeState::Complete {
            return Ok(());
        }
        match self.session.as_mut() {
            Some(session) => session.close(&mut self.channel),
            None => Ok(()),
        }
    }

    /// Drive flight retransmission.
    pub fn handle_timeout(&mut self, now: Instant) -> Result<(), Error> {
        if !self.is_handshaking() {
            return Ok(());
        }
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        match session.handle_timeout(&mut self.channel, now) {
            Ok(()) => Ok(()),
            Err(e @ Error::TransmitQueueFull) => Err(e),
            Err(e) => {
                self.fail(e);
                Ok(())
            }
        }
    }

    /// When [`Self::handle_timeout`] next needs to run.
    pub fn poll_timeout(&self) -> Option<Instant> {
        if !self.is_handshaking() {
            return None;
        }
        self.session.as_ref().and_then(|s| s.poll_timeout())
    }

    /// Next datagram to send to the peer.
    pub fn poll_transmit(&mut self) -> Option<Buf> {
        self.channel.pop_datagram()
    }

    /// Every datagram waiting to be sent to the peer.
    pub fn take_transmit(&mut self) -> Vec<Buf> {
        self.channel.drain()
    }

    /// Give a sent datagram back for reuse.
    pub fn recycle(&mut self, buf: Buf) {
        self.channel.recycle(buf);
    }

    /// DER certificate the peer presented.
    pub fn peer_certificate(&self) -> Option<&[u8]> {
        self.session.as_ref().and_then(|s| s.peer_certificate())
    }

    pub(crate) fn created(&self) -> Instant {
        self.created
    }

    pub(crate) fn last_progress(&self) -> Instant {
        self.last_progress
    }

    pub(crate) fn last_received(&self) -> Instant {
        self.last_received
    }

    pub(crate) fn mark_received(&mut self, now: Instant) {
        self.last_received = now;
    }
}

impl<D: HandshakeDriver> fmt::Debug for Endpoint<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("peer", &self.peer)
            .field("state", &self.state)
            .field("failure", &self.failure)
            .field("channel", &self.channel)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Completes as soon as it is given the datagram "hello".
    struct OneRoundTrip {
        role: Role,
        done: bool,
    }

    impl HandshakeDriver for OneRoundTrip {
        fn new_session(
            role: Role,
            _peer: SocketAddr,
            _config: &Arc<Config>,
            _identity: &Arc<Identity>,
        ) -> Result<Self, Error> {
            Ok(OneRoundTrip { role, done: false })
        }

        fn step(&mut self, channel: &mut HandshakeChannel, _now: Instant) -> Result<Progress, Error> {
            let received = channel.take_received();
            let result = match (self.role, &*received) {
                (Role::Client, b"") => channel.push_datagram(Buf::from_slice(b"hello")),
                (Role::Client, b"welcome") | (Role::Server, b"hello") => {
                    self.done = true;
                    if self.role == Role::Server {
                        channel.push_datagram(Buf::from_slice(b"welcome"))
                    } else {
                        Ok(())
                    }
                }
                _ => Err(Error::UnexpectedMessage("not hello".into())),
            };
            channel.finish_received(received);
            result?;
            Ok(if self.done {
                Progress::Complete
            } else {
                Progress::Pending { advanced: true }
            })
        }

        fn handle_timeout(&mut self, _: &mut HandshakeChannel, _: Instant) -> Result<(), Error> {
            Ok(())
        }

        fn poll_timeout(&self) -> Option<Instant> {
            None
        }

        fn seal(&mut self, plaintext: &[u8], out: &mut Buf) -> Result<(), Error> {
            out.clear();
            out.extend_from_slice(plaintext);
            Ok(())
        }

        fn open(
            &mut self,
            datagram: &[u8],
            _: &mut HandshakeChannel,
            out: &mut [u8],
        ) -> Result<Opened, Error> {
            if out.len() < datagram.len() {
                return Err(Error::BufferTooSmall {
                    needed: datagram.len(),
                    available: out.len(),
                });
            }
            out[..datagram.len()].copy_from_slice(datagram);
            Ok(Opened::Data(datagram.len()))
        }

        fn close(&mut self, _: &mut HandshakeChannel) -> Result<(), Error> {
            Ok(())
        }

        fn peer_certificate(&self) -> Option<&[u8]> {
            None
        }
    }

    fn endpoint(port: u16) -> Endpoint<OneRoundTrip> {
        let config = Arc::new(Config::default());
        let identity = Arc::new(Identity::generate().unwrap());
        let peer = SocketAddr::from(([127, 0, 0, 1], port));
        Endpoint::new(peer, config, identity, Instant::now())
    }

    #[test]
    fn accept_completes_in_one_round_trip() {
        let now = Instant::now();
        let mut client = endpoint(1);
        let mut server = endpoint(2);

        assert_eq!(client.connect(now).unwrap(), Status::Pending);
        assert!(client.is_handshaking());
        let hello = client.poll_transmit().unwrap();

        assert_eq!(server.accept(&hello, now).unwrap(), Status::Complete);
        assert_eq!(server.state(), HandshakeState::Complete);
        assert!(!server.is_handshaking());

        let welcome = server.poll_transmit().unwrap();
        assert_eq!(
            client.continue_handshake(&welcome, now).unwrap(),
            Status::Complete
        );

        let mut datagram = Buf::new();
        client.encode(b"data", &mut datagram).unwrap();
        let mut out = [0u8; 8];
        assert_eq!(server.decode(&datagram, &mut out), Ok(Decoded::Payload(4)));
    }

    #[test]
    fn misuse_is_reported() {
        let now = Instant::now();
        let mut ep = endpoint(1);
        let mut out = [0u8; 8];

        assert_eq!(
            ep.decode(b"x", &mut out),
            Err(Error::Misuse {
                op: "decode",
                state: HandshakeState::None
            })
        );
        assert!(matches!(
            ep.continue_handshake(b"x", now),
            Err(Error::Misuse { .. })
        ));

        ep.connect(now).unwrap();
        assert_eq!(
            ep.connect(now),
            Err(Error::Misuse {
                op: "connect",
                state: HandshakeState::Connecting
            })
        );
        assert!(matches!(
            ep.encode(b"x", &mut Buf::new()),
            Err(Error::Misuse { op: "encode", .. })
        ));
    }

    #[test]
    fn failed_is_terminal() {
        let now = Instant::now();
        let mut ep = endpoint(1);

        assert_eq!(ep.accept(b"garbage", now).unwrap(), Status::Failed);
        assert_eq!(ep.state(), HandshakeState::Failed);
        assert!(ep.failure().is_some());

        assert_eq!(ep.accept(b"hello", now).unwrap(), Status::Failed);
        assert_eq!(ep.connect(now).unwrap(), Status::Failed);
        assert_eq!(ep.continue_handshake(b"hello", now).unwrap(), Status::Failed);
        assert_eq!(ep.state(), HandshakeState::Failed);
    }

    #[test]
    fn state_names() {
        let all = [
            HandshakeState::None,
            HandshakeState::Connecting,
            HandshakeState::Accepting,
            HandshakeState::Complete,
            HandshakeState::Failed,
        ];
        let names: Vec<_> = all.iter().map(|s| s.name()).collect();
        assert_eq!(
            names,
            ["None", "Connecting", "Accepting", "Complete", "Failed"]
        );
        assert_eq!(HandshakeState::Failed.to_string(), "Failed");
    }
}
