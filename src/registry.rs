//! Many peers behind one socket.
//!
//! The registry owns every [`Endpoint`] keyed by peer address. It decides
//! what to do with a datagram from each sender and periodically sweeps out
//! endpoints that failed, stalled or went quiet.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use crate::buffer::{Buf, BufferPool};
use crate::certificate::Identity;
use crate::cookie::CookieJar;
use crate::driver::HandshakeDriver;
use crate::endpoint::{Decoded, Endpoint, HandshakeState, Status};
use crate::session::message::{hello_verify_request, peek_client_hello};
use crate::session::Session;
use crate::{Config, Error};

/// What became of one inbound datagram.
#[derive(Debug)]
pub enum Routed {
    /// Ignored. Nothing was created and nothing needs sending.
    Dropped,

    /// An unknown peer must prove it owns its address. Send `transmit` back.
    Challenge { transmit: Buf },

    /// Handshake traffic. Send `transmit` back to the peer.
    Handshake {
        transmit: Vec<Buf>,
        state: HandshakeState,
    },

    /// Application plaintext.
    Payload(Buf),

    /// The datagram did not decrypt. The connection is unaffected.
    Rejected(Error),

    /// The handshake with this peer failed.
    Failed(Error),

    /// The peer closed the connection and the endpoint is gone.
    Closed,
}

/// Why [`EndpointRegistry::sweep`] removed an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvictReason {
    /// The handshake made no progress within `handshake_timeout`.
    HandshakeTimeout,
    /// The handshake failed.
    Failed(Error),
    /// Nothing was received within `idle_timeout`.
    Idle,
}

/// Output of one [`EndpointRegistry::sweep`].
#[derive(Debug, Default)]
pub struct Sweep {
    /// Retransmitted flights.
    pub transmit: Vec<(SocketAddr, Buf)>,
    pub evicted: Vec<(SocketAddr, EvictReason)>,
}

pub struct EndpointRegistry<D: HandshakeDriver = Session> {
    config: Arc<Config>,
    identity: Arc<Identity>,

    endpoints: HashMap<SocketAddr, Endpoint<D>>,

    /// Live endpoints per remote IP.
    per_ip: HashMap<IpAddr, usize>,

    cookies: CookieJar,

    /// Decrypted plaintext lands here before it is copied out.
    scratch: Vec<u8>,

    pool: BufferPool,
}

impl<D: HandshakeDriver> EndpointRegistry<D> {
    pub fn new(config: Arc<Config>, identity: Arc<Identity>, now: Instant) -> Self {
        EndpointRegistry {
            cookies: CookieJar::new(config.cookie_lifetime(), now),
            scratch: vec![0; config.mtu()],
            config,
            identity,
            endpoints: HashMap::new(),
            per_ip: HashMap::new(),
            pool: BufferPool::default(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Route one datagram from `from`.
    ///
    /// Only local failures are returned as `Err`. Anything the peer did
    /// wrong is reported through [`Routed`].
    pub fn on_datagram_received(
        &mut self,
        from: SocketAddr,
        datagram: &[u8],
        now: Instant,
    ) -> Result<Routed, Error> {
        let state = self.endpoints.get(&from).map(|e| e.state());

        match state {
            Some(HandshakeState::Connecting | HandshakeState::Accepting) => {
                self.continue_handshake(from, datagram, now)
            }
            Some(HandshakeState::Complete) => Ok(self.decode(from, datagram, now)),
            Some(state) => {
                debug!("Replace {} endpoint for {}", state, from);
                self.remove(from);
                self.admit(from, datagram, now)
            }
            None => self.admit(from, datagram, now),
        }
    }

    fn continue_handshake(
        &mut self,
        from: SocketAddr,
        datagram: &[u8],
        now: Instant,
    ) -> Result<Routed, Error> {
        let Some(endpoint) = self.endpoints.get_mut(&from) else {
            return Ok(Routed::Dropped);
        };

        match endpoint.continue_handshake(datagram, now)? {
            Status::Failed => Ok(Routed::Failed(failure_of(endpoint))),
            Status::Pending | Status::Complete => Ok(Routed::Handshake {
                transmit: endpoint.take_transmit(),
                state: endpoint.state(),
            }),
        }
    }

    fn decode(&mut self, from: SocketAddr, datagram: &[u8], now: Instant) -> Routed {
        let Some(endpoint) = self.endpoints.get_mut(&from) else {
            return Routed::Dropped;
        };
        endpoint.mark_received(now);

        if self.scratch.len() < datagram.len() {
            self.scratch.resize(datagram.len(), 0);
        }

        match endpoint.decode(datagram, &mut self.scratch) {
            Ok(Decoded::Payload(len)) => {
                let mut payload = self.pool.pop();
                payload.extend_from_slice(&self.scratch[..len]);
                Routed::Payload(payload)
            }
            Ok(Decoded::Control) => Routed::Handshake {
                transmit: endpoint.take_transmit(),
                state: endpoint.state(),
            },
            Ok(Decoded::Closed) => {
                debug!("Peer {} closed", from);
                self.remove(from);
                Routed::Closed
            }
            Err(e) => {
                trace!("Reject datagram from {}: {}", from, e);
                Routed::Rejected(e)
            }
        }
    }

    /// First contact from an address we hold no endpoint for.
    fn admit(&mut self, from: SocketAddr, datagram: &[u8], now: Instant) -> Result<Routed, Error> {
        if !self.config.accept_new_peers() {
            debug!("Drop datagram from unknown peer {}", from);
            return Ok(Routed::Dropped);
        }

        if self.endpoints.len() >= self.config.max_endpoints() {
            debug!("Drop datagram from {}: registry full", from);
            return Ok(Routed::Dropped);
        }

        if self.count_for(from.ip()) >= self.config.max_endpoints_per_ip() {
            debug!("Drop datagram from {}: too many endpoints for ip", from);
            return Ok(Routed::Dropped);
        }

        if self.config.cookie_exchange() {
            let Some(hello) = peek_client_hello(datagram) else {
                debug!("Drop non-ClientHello from unknown peer {}", from);
                return Ok(Routed::Dropped);
            };

            if !self.cookies.verify(from, &hello.cookie, now) {
                let cookie = self.cookies.generate(from, now)?;
                let mut transmit = self.pool.pop();
                hello_verify_request(&hello, cookie, &mut transmit);
                debug!("Challenge {} with cookie", from);
                return Ok(Routed::Challenge { transmit });
            }
        }

        let mut endpoint = Endpoint::new(from, self.config.clone(), self.identity.clone(), now);
        let status = endpoint.accept(datagram, now)?;

        let routed = match status {
            Status::Failed => Routed::Failed(failure_of(&endpoint)),
            Status::Pending | Status::Complete => Routed::Handshake {
                transmit: endpoint.take_transmit(),
                state: endpoint.state(),
            },
        };

        self.insert(endpoint);
        Ok(routed)
    }

    /// Start a handshake with `addr`.
    ///
    /// Returns the datagrams to send. A failed endpoint for the address is
    /// replaced, a live one is an error. An endpoint whose opening flight
    /// can not be built is not kept.
    pub fn connect(&mut self, addr: SocketAddr, now: Instant) -> Result<Vec<Buf>, Error> {
        match self.endpoints.get(&addr).map(|e| e.state()) {
            Some(HandshakeState::Failed) => {
                self.remove(addr);
            }
            Some(_) => return Err(Error::EndpointExists(addr)),
            None => {}
        }

        if self.endpoints.len() >= self.config.max_endpoints() {
            return Err(Error::RegistryFull(self.endpoints.len()));
        }
        if self.count_for(addr.ip()) >= self.config.max_endpoints_per_ip() {
            return Err(Error::RegistryFull(self.count_for(addr.ip())));
        }

        let mut endpoint = Endpoint::new(addr, self.config.clone(), self.identity.clone(), now);
        if endpoint.connect(now)? == Status::Failed {
            return Err(failure_of(&endpoint));
        }
        let transmit = endpoint.take_transmit();
        self.insert(endpoint);

        Ok(transmit)
    }

    /// Protect `plaintext` for an established peer.
    pub fn encode(&mut self, addr: SocketAddr, plaintext: &[u8]) -> Result<Buf, Error> {
        let endpoint = self
            .endpoints
            .get_mut(&addr)
            .ok_or(Error::UnknownPeer(addr))?;

        let mut out = self.pool.pop();
        match endpoint.encode(plaintext, &mut out) {
            Ok(()) => Ok(out),
            Err(e) => {
                self.pool.push(out);
                Err(e)
            }
        }
    }

    /// Forget `addr`, returning a close notification to send if the
    /// connection was established.
    pub fn close(&mut self, addr: SocketAddr) -> Result<Vec<Buf>, Error> {
        let mut endpoint = self.remove(addr).ok_or(Error::UnknownPeer(addr))?;
        endpoint.close()?;
        Ok(endpoint.take_transmit())
    }

    /// Run retransmission timers and evict what is stale.
    pub fn sweep(&mut self, now: Instant) -> Sweep {
        let mut sweep = Sweep::default();
        let handshake_timeout = self.config.handshake_timeout();
        let idle_timeout = self.config.idle_timeout();

        for (addr, endpoint) in self.endpoints.iter_mut() {
            let addr = *addr;

            let reason = match endpoint.state() {
                HandshakeState::Failed => Some(EvictReason::Failed(failure_of(endpoint))),
                HandshakeState::Connecting | HandshakeState::Accepting => {
                    let stalled = now.saturating_duration_since(endpoint.last_progress());
                    if stalled >= handshake_timeout {
                        Some(EvictReason::HandshakeTimeout)
                    } else {
                        if let Err(e) = endpoint.handle_timeout(now) {
                            warn!("Retransmit to {} failed: {}", addr, e);
                        }
                        if endpoint.state() == HandshakeState::Failed {
                            Some(EvictReason::Failed(failure_of(endpoint)))
                        } else {
                            None
                        }
                    }
                }
                HandshakeState::Complete => {
                    let quiet = now.saturating_duration_since(endpoint.last_received());
                    idle_timeout
                        .filter(|idle| quiet >= *idle)
                        .map(|_| EvictReason::Idle)
                }
                HandshakeState::None => None,
            };

            match reason {
                Some(reason) => {
                    debug!(
                        "Evict {} after {:?}: {:?}",
                        addr,
                        now.saturating_duration_since(endpoint.created()),
                        reason
                    );
                    sweep.evicted.push((addr, reason));
                }
                None => {
                    while let Some(buf) = endpoint.poll_transmit() {
                        sweep.transmit.push((addr, buf));
                    }
                }
            }
        }

        for (addr, _) in &sweep.evicted {
            self.remove(*addr);
        }

        sweep
    }

    /// Earliest instant [`Self::sweep`] has something to do.
    pub fn poll_timeout(&self) -> Option<Instant> {
        let handshake_timeout = self.config.handshake_timeout();
        self.endpoints
            .values()
            .filter_map(|e| match e.state() {
                HandshakeState::Connecting | HandshakeState::Accepting => {
                    let give_up = e.last_progress() + handshake_timeout;
                    Some(e.poll_timeout().map_or(give_up, |t| t.min(give_up)))
                }
                HandshakeState::Complete => {
                    self.config.idle_timeout().map(|idle| e.last_received() + idle)
                }
                _ => None,
            })
            .min()
    }

    pub fn get(&self, addr: SocketAddr) -> Option<&Endpoint<D>> {
        self.endpoints.get(&addr)
    }

    pub fn state(&self, addr: SocketAddr) -> Option<HandshakeState> {
        self.endpoints.get(&addr).map(|e| e.state())
    }

    pub fn contains(&self, addr: SocketAddr) -> bool {
        self.endpoints.contains_key(&addr)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Give a sent datagram back for reuse.
    pub fn recycle(&mut self, buf: Buf) {
        self.pool.push(buf);
    }

    fn count_for(&self, ip: IpAddr) -> usize {
        self.per_ip.get(&ip).copied().unwrap_or(0)
    }

    fn insert(&mut self, endpoint: Endpoint<D>) {
        let addr = endpoint.peer();
        if let Some(previous) = self.endpoints.insert(addr, endpoint) {
            // Callers remove before inserting; keep the count right regardless.
            debug!("Replaced endpoint {} in state {}", addr, previous.state());
            return;
        }
        *self.per_ip.entry(addr.ip()).or_insert(0) += 1;
    }

    fn remove(&mut self, addr: SocketAddr) -> Option<Endpoint<D>> {
        let endpoint = self.endpoints.remove(&addr)?;
        if let Some(count) = self.per_ip.get_mut(&addr.ip()) {
            *count -= 1;
            if *count == 0 {
                self.per_ip.remove(&addr.ip());
            }
        }
        Some(endpoint)
    }
}

fn failure_of<D: HandshakeDriver>(endpoint: &Endpoint<D>) -> Error {
    endpoint
        .failure()
        .cloned()
        .unwrap_or_else(|| Error::UnexpectedMessage("handshake failed".into()))
}

impl<D: HandshakeDriver> std::fmt::Debug for EndpointRegistry<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointRegistry")
            .field("endpoints", &self.endpoints.len())
            .field("per_ip", &self.per_ip)
            .field("cookies", &self.cookies)
            .finish()
    }
}
