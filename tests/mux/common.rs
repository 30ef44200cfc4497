#![allow(unused)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dtlsmux::{
    Buf, Config, Decoded, Endpoint, EndpointRegistry, HandshakeState, Identity, Routed, Status,
};

pub const CLIENT: SocketAddr = SocketAddr::new(
    std::net::IpAddr::V4(std::net::Ipv4Addr::new(192, 168, 1, 10)),
    50_000,
);
pub const SERVER: SocketAddr = SocketAddr::new(
    std::net::IpAddr::V4(std::net::Ipv4Addr::new(192, 168, 1, 1)),
    4433,
);

pub fn config() -> Arc<Config> {
    Arc::new(Config::default())
}

pub fn identity() -> Arc<Identity> {
    Arc::new(Identity::generate().expect("generate identity"))
}

/// Client endpoint talking to [`SERVER`] and server endpoint talking to
/// [`CLIENT`].
pub fn endpoint_pair(
    client_config: Arc<Config>,
    server_config: Arc<Config>,
    now: Instant,
) -> (Endpoint, Endpoint) {
    let client = Endpoint::new(SERVER, client_config, identity(), now);
    let server = Endpoint::new(CLIENT, server_config, identity(), now);
    (client, server)
}

/// Hand one datagram to an endpoint the way the registry would.
pub fn feed(endpoint: &mut Endpoint, datagram: &[u8], now: Instant) -> Status {
    match endpoint.state() {
        HandshakeState::None => endpoint.accept(datagram, now).expect("accept"),
        HandshakeState::Connecting | HandshakeState::Accepting => endpoint
            .continue_handshake(datagram, now)
            .expect("continue_handshake"),
        HandshakeState::Complete => {
            let mut out = vec![0; 2048];
            let decoded = endpoint.decode(datagram, &mut out).expect("decode");
            assert_eq!(decoded, Decoded::Control);
            Status::Complete
        }
        HandshakeState::Failed => Status::Failed,
    }
}

/// Deliver every queued datagram from `from` to `to`.
pub fn deliver(from: &mut Endpoint, to: &mut Endpoint, now: Instant) -> usize {
    let datagrams = from.take_transmit();
    let count = datagrams.len();
    for datagram in datagrams {
        feed(to, &datagram, now);
    }
    count
}

/// Run connect and deliver datagrams back and forth until both sides are
/// established.
pub fn handshake(client: &mut Endpoint, server: &mut Endpoint, now: Instant) {
    assert_eq!(client.connect(now).expect("connect"), Status::Pending);

    for _ in 0..10 {
        let to_server = deliver(client, server, now);
        let to_client = deliver(server, client, now);

        if client.state() == HandshakeState::Complete
            && server.state() == HandshakeState::Complete
        {
            return;
        }
        assert!(
            to_server + to_client > 0,
            "handshake stalled: client {} server {}",
            client.state(),
            server.state()
        );
    }
    panic!("handshake did not complete");
}

/// A connected client/server pair with default configuration.
pub fn connected_pair(now: Instant) -> (Endpoint, Endpoint) {
    let (mut client, mut server) = endpoint_pair(config(), config(), now);
    handshake(&mut client, &mut server, now);
    (client, server)
}

/// Send one datagram batch from one registry to the other and return what
/// the receiving side produced in answer.
pub fn route(
    to: &mut EndpointRegistry,
    from: SocketAddr,
    datagrams: Vec<Buf>,
    now: Instant,
) -> (Vec<Buf>, Vec<Routed>) {
    let mut answer = Vec::new();
    let mut routed = Vec::new();

    for datagram in datagrams {
        let r = to
            .on_datagram_received(from, &datagram, now)
            .expect("on_datagram_received");
        match r {
            Routed::Challenge { transmit } => {
                answer.push(transmit.clone());
                routed.push(Routed::Challenge { transmit });
            }
            Routed::Handshake { transmit, state } => {
                answer.extend(transmit.iter().cloned());
                routed.push(Routed::Handshake { transmit, state });
            }
            other => routed.push(other),
        }
    }

    (answer, routed)
}

/// Drive a client registry and a server registry to an established
/// connection between [`CLIENT`] and [`SERVER`].
pub fn registry_handshake(
    client: &mut EndpointRegistry,
    server: &mut EndpointRegistry,
    now: Instant,
) -> Vec<Routed> {
    let mut all = Vec::new();
    let mut to_server = client.connect(SERVER, now).expect("connect");

    for _ in 0..10 {
        let (to_client, routed) = route(server, CLIENT, to_server, now);
        all.extend(routed);
        let (next, routed) = route(client, SERVER, to_client, now);
        all.extend(routed);
        to_server = next;

        if client.state(SERVER) == Some(HandshakeState::Complete)
            && server.state(CLIENT) == Some(HandshakeState::Complete)
        {
            return all;
        }
    }
    panic!("registry handshake did not complete");
}

pub fn registry(config: Arc<Config>, now: Instant) -> EndpointRegistry {
    EndpointRegistry::new(config, identity(), now)
}

pub fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}
