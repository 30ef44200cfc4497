use std::sync::Arc;
use std::time::Instant;

use dtlsmux::{Config, Endpoint, Error, Fingerprint, HandshakeState, Identity, Status, Verification};

use crate::common::*;

#[test]
fn endpoints_reach_complete() {
    let _ = env_logger::try_init();

    let now = Instant::now();
    let client_id = identity();
    let server_id = identity();

    let mut client: Endpoint = Endpoint::new(SERVER, config(), client_id.clone(), now);
    let mut server: Endpoint = Endpoint::new(CLIENT, config(), server_id.clone(), now);

    assert_eq!(client.state(), HandshakeState::None);
    assert!(!client.is_handshaking());

    handshake(&mut client, &mut server, now);

    assert!(!client.is_handshaking());
    assert!(!server.is_handshaking());
    assert_eq!(client.poll_timeout(), None);
    assert_eq!(server.poll_timeout(), None);

    // The client saw the server's certificate. The server did not ask for one.
    assert_eq!(client.peer_certificate(), Some(server_id.certificate()));
    assert_eq!(server.peer_certificate(), None);
}

#[test]
fn client_certificate_on_request() {
    let _ = env_logger::try_init();

    let now = Instant::now();
    let server_config = Arc::new(
        Config::builder()
            .require_client_certificate(true)
            .build()
            .expect("config"),
    );
    let client_id = identity();

    let mut client: Endpoint = Endpoint::new(SERVER, config(), client_id.clone(), now);
    let mut server: Endpoint = Endpoint::new(CLIENT, server_config, identity(), now);

    handshake(&mut client, &mut server, now);

    assert_eq!(server.peer_certificate(), Some(client_id.certificate()));
}

#[test]
fn pinned_fingerprint_is_accepted() {
    let now = Instant::now();
    let server_id = identity();
    let client_config = Arc::new(
        Config::builder()
            .verification(Verification::Pinned(vec![server_id.fingerprint()]))
            .build()
            .expect("config"),
    );

    let mut client: Endpoint = Endpoint::new(SERVER, client_config, identity(), now);
    let mut server: Endpoint = Endpoint::new(CLIENT, config(), server_id, now);

    handshake(&mut client, &mut server, now);
}

#[test]
fn unpinned_server_fails_client() {
    let _ = env_logger::try_init();

    let now = Instant::now();
    let client_config = Arc::new(
        Config::builder()
            .verification(Verification::Pinned(vec![Fingerprint([0xaa; 32])]))
            .build()
            .expect("config"),
    );
    let (mut client, mut server) = endpoint_pair(client_config, config(), now);

    client.connect(now).expect("connect");
    deliver(&mut client, &mut server, now);
    deliver(&mut server, &mut client, now);

    assert_eq!(client.state(), HandshakeState::Failed);
    assert_eq!(client.failure(), Some(&Error::FingerprintMismatch));

    // Terminal. Further input is ignored.
    assert_eq!(
        client.continue_handshake(&[22, 0xfe, 0xfd], now),
        Ok(Status::Failed)
    );
    assert!(client.take_transmit().is_empty());
}

#[test]
fn garbage_never_completes() {
    let now = Instant::now();

    // A genuine ClientHello, cut short.
    let mut client: Endpoint = Endpoint::new(SERVER, config(), identity(), now);
    client.connect(now).expect("connect");
    let hello = client.take_transmit().remove(0);

    let inputs: Vec<Vec<u8>> = vec![
        vec![],
        vec![0xff; 40],
        vec![22, 0xfe, 0xfd, 0, 0],
        hello[..hello.len() / 2].to_vec(),
        // Application data before any handshake.
        vec![23, 0xfe, 0xfd, 0, 1, 0, 0, 0, 0, 0, 0, 0, 4, 1, 2, 3, 4],
    ];

    for input in inputs {
        let mut server: Endpoint = Endpoint::new(CLIENT, config(), identity(), now);
        let status = server.accept(&input, now).expect("accept");
        assert_ne!(status, Status::Complete, "input {:?}", input);
        assert_ne!(server.state(), HandshakeState::Complete);
    }
}

#[test]
fn truncated_hello_fails() {
    let now = Instant::now();
    let mut client: Endpoint = Endpoint::new(SERVER, config(), identity(), now);
    client.connect(now).expect("connect");
    let hello = client.take_transmit().remove(0);

    let mut server: Endpoint = Endpoint::new(CLIENT, config(), identity(), now);
    let status = server.accept(&hello[..hello.len() - 10], now).unwrap();
    assert_eq!(status, Status::Failed);
    assert!(server.failure().is_some());
}

#[test]
fn duplicate_client_hello_does_not_change_state() {
    let _ = env_logger::try_init();

    let now = Instant::now();
    let (mut client, mut server) = endpoint_pair(config(), config(), now);

    client.connect(now).expect("connect");
    let hello = client.take_transmit().remove(0);

    assert_eq!(server.accept(&hello, now), Ok(Status::Pending));
    let first_flight = server.take_transmit();
    assert!(!first_flight.is_empty());

    // The same ClientHello again only repeats the server's flight.
    assert_eq!(server.continue_handshake(&hello, now), Ok(Status::Pending));
    assert_eq!(server.state(), HandshakeState::Accepting);
    let resent = server.take_transmit();
    assert_eq!(resent.len(), first_flight.len());

    // The client is fine with the duplicate.
    for datagram in first_flight.iter().chain(resent.iter()) {
        feed(&mut client, datagram, now);
    }
    assert_eq!(client.state(), HandshakeState::Connecting);

    deliver(&mut client, &mut server, now);
    deliver(&mut server, &mut client, now);
    assert_eq!(client.state(), HandshakeState::Complete);
    assert_eq!(server.state(), HandshakeState::Complete);
}

#[test]
fn lost_flight_is_retransmitted() {
    let _ = env_logger::try_init();

    let now = Instant::now();
    let (mut client, mut server) = endpoint_pair(config(), config(), now);

    client.connect(now).expect("connect");
    let deadline = client.poll_timeout().expect("client timer armed");
    assert!(deadline > now);

    // The first ClientHello is lost.
    client.take_transmit();

    client.handle_timeout(deadline).expect("handle_timeout");
    let resent = client.take_transmit();
    assert_eq!(resent.len(), 1);

    let later = deadline + secs(1);
    for datagram in resent {
        feed(&mut server, &datagram, later);
    }
    deliver(&mut server, &mut client, later);
    deliver(&mut client, &mut server, later);
    deliver(&mut server, &mut client, later);

    assert_eq!(client.state(), HandshakeState::Complete);
    assert_eq!(server.state(), HandshakeState::Complete);
}

#[test]
fn lost_final_flight_is_answered_after_complete() {
    let _ = env_logger::try_init();

    let now = Instant::now();
    let (mut client, mut server) = endpoint_pair(config(), config(), now);

    client.connect(now).expect("connect");
    deliver(&mut client, &mut server, now);
    deliver(&mut server, &mut client, now);
    deliver(&mut client, &mut server, now);
    assert_eq!(server.state(), HandshakeState::Complete);

    // The server's Finished is lost.
    server.take_transmit();
    assert_eq!(client.state(), HandshakeState::Connecting);

    let deadline = client.poll_timeout().expect("client timer armed");
    client.handle_timeout(deadline).expect("handle_timeout");

    // The established server answers the repeated flight with its own.
    deliver(&mut client, &mut server, deadline);
    deliver(&mut server, &mut client, deadline);

    assert_eq!(client.state(), HandshakeState::Complete);
}

#[test]
fn misuse_on_complete() {
    let now = Instant::now();
    let (mut client, _server) = connected_pair(now);

    assert_eq!(
        client.continue_handshake(&[1, 2, 3], now),
        Err(Error::Misuse {
            op: "continue_handshake",
            state: HandshakeState::Complete
        })
    );
    assert_eq!(
        client.accept(&[1, 2, 3], now),
        Err(Error::Misuse {
            op: "accept",
            state: HandshakeState::Complete
        })
    );
}

#[test]
fn identity_from_parts() {
    let generated = Identity::generate().expect("generate");
    assert_eq!(
        generated.fingerprint(),
        Fingerprint::of(generated.certificate())
    );
}
