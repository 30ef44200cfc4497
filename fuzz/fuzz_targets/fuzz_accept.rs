#![no_main]

//! Arbitrary bytes as the first datagram from an unknown peer.
//!
//! Garbage must never complete a handshake and never panic.

use libfuzzer_sys::fuzz_target;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use dtlsmux::{Config, Endpoint, HandshakeState, Identity};

fn identity() -> Arc<Identity> {
    static IDENTITY: OnceLock<Arc<Identity>> = OnceLock::new();
    IDENTITY
        .get_or_init(|| Arc::new(Identity::generate().expect("identity")))
        .clone()
}

fuzz_target!(|data: &[u8]| {
    let now = Instant::now();
    let peer = SocketAddr::from(([127, 0, 0, 1], 9));
    let config = Arc::new(Config::default());

    let mut server: Endpoint = Endpoint::new(peer, config.clone(), identity(), now);
    let _ = server.accept(data, now);
    assert_ne!(server.state(), HandshakeState::Complete);

    // Same bytes at a client that is waiting for the server's flight.
    let mut client: Endpoint = Endpoint::new(peer, config, identity(), now);
    let _ = client.connect(now);
    let _ = client.continue_handshake(data, now);
    assert_ne!(client.state(), HandshakeState::Complete);
});
