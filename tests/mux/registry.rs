use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dtlsmux::{Config, Error, EvictReason, HandshakeState, Routed};

use crate::common::*;

#[test]
fn registries_connect_through_cookie_challenge() {
    let _ = env_logger::try_init();

    let now = Instant::now();
    let mut client = registry(config(), now);
    let mut server = registry(config(), now);

    let routed = registry_handshake(&mut client, &mut server, now);

    // The first ClientHello is challenged and creates nothing on the server.
    assert!(matches!(routed[0], Routed::Challenge { .. }));
    assert_eq!(server.len(), 1);
    assert_eq!(client.len(), 1);

    let datagram = client.encode(SERVER, b"ping").expect("encode");
    match server.on_datagram_received(CLIENT, &datagram, now).unwrap() {
        Routed::Payload(payload) => assert_eq!(&payload[..], b"ping"),
        other => panic!("expected payload, got {:?}", other),
    }

    let datagram = server.encode(CLIENT, b"pong").expect("encode");
    match client.on_datagram_received(SERVER, &datagram, now).unwrap() {
        Routed::Payload(payload) => assert_eq!(&payload[..], b"pong"),
        other => panic!("expected payload, got {:?}", other),
    }
}

#[test]
fn challenge_is_a_hello_verify_request() {
    let now = Instant::now();
    let mut client = registry(config(), now);
    let mut server = registry(config(), now);

    let hello = client.connect(SERVER, now).expect("connect");
    let routed = server
        .on_datagram_received(CLIENT, &hello[0], now)
        .expect("route");

    let Routed::Challenge { transmit } = routed else {
        panic!("expected challenge");
    };
    // Handshake record carrying a HelloVerifyRequest.
    assert_eq!(transmit[0], 22);
    assert_eq!(transmit[13], 3);
    assert!(server.is_empty());

    // Repeating the cookie-less hello challenges again, statelessly.
    let again = server
        .on_datagram_received(CLIENT, &hello[0], now)
        .expect("route");
    assert!(matches!(again, Routed::Challenge { .. }));
    assert!(server.is_empty());
}

#[test]
fn closed_policy_drops_unknown_peer() {
    let now = Instant::now();
    let closed = Arc::new(Config::builder().accept_new_peers(false).build().unwrap());

    let mut client = registry(config(), now);
    let mut server = registry(closed, now);

    let hello = client.connect(SERVER, now).expect("connect");
    let (answer, routed) = route(&mut server, CLIENT, hello, now);

    assert!(answer.is_empty());
    assert!(matches!(routed[..], [Routed::Dropped]));
    assert!(!server.contains(CLIENT));
    assert!(server.is_empty());
}

#[test]
fn handshake_timeout_then_fresh_connect() {
    let _ = env_logger::try_init();

    let now = Instant::now();
    let config = Arc::new(
        Config::builder()
            .handshake_timeout(secs(3))
            .build()
            .unwrap(),
    );
    let mut client = registry(config, now);

    client.connect(SERVER, now).expect("connect");
    assert_eq!(client.state(SERVER), Some(HandshakeState::Connecting));
    assert!(client.poll_timeout().expect("deadline") <= now + secs(3));

    let sweep = client.sweep(now + secs(4));
    assert_eq!(sweep.evicted, vec![(SERVER, EvictReason::HandshakeTimeout)]);
    assert!(!client.contains(SERVER));

    // A new connect makes a brand new endpoint.
    let later = now + secs(5);
    let hello = client.connect(SERVER, later).expect("connect again");
    assert_eq!(hello.len(), 1);
    assert_eq!(client.state(SERVER), Some(HandshakeState::Connecting));
    assert!(client.sweep(later + secs(1)).evicted.is_empty());
}

#[test]
fn idle_connection_is_evicted() {
    let now = Instant::now();
    let idle = Arc::new(
        Config::builder()
            .idle_timeout(Some(secs(30)))
            .build()
            .unwrap(),
    );
    let mut client = registry(config(), now);
    let mut server = registry(idle, now);

    registry_handshake(&mut client, &mut server, now);

    assert!(server.sweep(now + secs(10)).evicted.is_empty());

    // Traffic keeps it alive.
    let datagram = client.encode(SERVER, b"keepalive").unwrap();
    server
        .on_datagram_received(CLIENT, &datagram, now + secs(20))
        .unwrap();
    assert!(server.sweep(now + secs(40)).evicted.is_empty());

    let sweep = server.sweep(now + secs(51));
    assert_eq!(sweep.evicted, vec![(CLIENT, EvictReason::Idle)]);
    assert!(server.is_empty());
}

#[test]
fn per_ip_limit() {
    let now = Instant::now();
    let limited = Arc::new(
        Config::builder()
            .max_endpoints_per_ip(1)
            .cookie_exchange(false)
            .build()
            .unwrap(),
    );
    let mut server = registry(limited, now);
    let mut client = registry(config(), now);

    let hello = client.connect(SERVER, now).expect("connect");

    let first = SocketAddr::from(([10, 1, 1, 1], 1000));
    let second = SocketAddr::from(([10, 1, 1, 1], 1001));
    let other_ip = SocketAddr::from(([10, 1, 1, 2], 1000));

    let r = server.on_datagram_received(first, &hello[0], now).unwrap();
    assert!(matches!(r, Routed::Handshake { .. }));

    let r = server.on_datagram_received(second, &hello[0], now).unwrap();
    assert!(matches!(r, Routed::Dropped));
    assert!(!server.contains(second));

    let r = server.on_datagram_received(other_ip, &hello[0], now).unwrap();
    assert!(matches!(r, Routed::Handshake { .. }));
    assert_eq!(server.len(), 2);

    // Closing frees the slot.
    server.close(first).expect("close");
    let r = server.on_datagram_received(second, &hello[0], now).unwrap();
    assert!(matches!(r, Routed::Handshake { .. }));
}

#[test]
fn failed_endpoint_is_replaced_on_next_contact() {
    let now = Instant::now();
    let open = Arc::new(Config::builder().cookie_exchange(false).build().unwrap());
    let mut server = registry(open, now);
    let mut client = registry(config(), now);

    let r = server.on_datagram_received(CLIENT, &[0xff; 30], now).unwrap();
    assert!(matches!(r, Routed::Failed(_)));
    assert_eq!(server.state(CLIENT), Some(HandshakeState::Failed));
    assert!(server.get(CLIENT).unwrap().failure().is_some());

    // The same address starts over with a real hello.
    let hello = client.connect(SERVER, now).expect("connect");
    let r = server.on_datagram_received(CLIENT, &hello[0], now).unwrap();
    assert!(matches!(
        r,
        Routed::Handshake {
            state: HandshakeState::Accepting,
            ..
        }
    ));
    assert_eq!(server.len(), 1);
}

#[test]
fn tampered_datagram_leaves_connection_up() {
    let now = Instant::now();
    let mut client = registry(config(), now);
    let mut server = registry(config(), now);
    registry_handshake(&mut client, &mut server, now);

    let mut datagram = client.encode(SERVER, b"secret").unwrap();
    let last = datagram.len() - 1;
    datagram[last] ^= 0x80;

    let r = server.on_datagram_received(CLIENT, &datagram, now).unwrap();
    assert!(matches!(r, Routed::Rejected(Error::AuthenticationFailed)));
    assert_eq!(server.state(CLIENT), Some(HandshakeState::Complete));
}

#[test]
fn close_notify_removes_peer() {
    let _ = env_logger::try_init();

    let now = Instant::now();
    let mut client = registry(config(), now);
    let mut server = registry(config(), now);
    registry_handshake(&mut client, &mut server, now);

    let goodbye = client.close(SERVER).expect("close");
    assert!(client.is_empty());

    let (_, routed) = route(&mut server, CLIENT, goodbye, now);
    assert!(matches!(routed[..], [Routed::Closed]));
    assert!(server.is_empty());
}

#[test]
fn retransmission_comes_out_of_sweep() {
    let now = Instant::now();
    let mut client = registry(config(), now);

    client.connect(SERVER, now).expect("connect");

    let deadline = client.poll_timeout().expect("deadline");
    let sweep = client.sweep(deadline);
    assert!(sweep.evicted.is_empty());
    assert_eq!(sweep.transmit.len(), 1);
    assert_eq!(sweep.transmit[0].0, SERVER);

    let sweep = client.sweep(deadline + Duration::from_millis(1));
    assert!(sweep.transmit.is_empty());
}

#[test]
fn replayed_hello_does_not_keep_handshake_alive() {
    let _ = env_logger::try_init();

    let now = Instant::now();
    let mut client = registry(config(), now);
    let mut server = registry(config(), now);

    let hello = client.connect(SERVER, now).expect("connect");
    let (challenge, _) = route(&mut server, CLIENT, hello, now);
    let (hello, _) = route(&mut client, SERVER, challenge, now);
    assert_eq!(hello.len(), 1);

    let (flight, _) = route(&mut server, CLIENT, hello.clone(), now);
    assert!(!flight.is_empty());
    assert_eq!(server.state(CLIENT), Some(HandshakeState::Accepting));

    // The same hello every five seconds and nothing else.
    let (_, routed) = route(&mut server, CLIENT, hello.clone(), now + secs(5));
    assert!(matches!(
        routed[..],
        [Routed::Handshake {
            state: HandshakeState::Accepting,
            ..
        }]
    ));
    assert!(server.sweep(now + secs(5)).evicted.is_empty());

    route(&mut server, CLIENT, hello, now + secs(10));
    let sweep = server.sweep(now + secs(10));
    assert_eq!(sweep.evicted, vec![(CLIENT, EvictReason::HandshakeTimeout)]);
    assert!(!server.contains(CLIENT));
}

#[test]
fn connect_obeys_per_ip_limit() {
    let now = Instant::now();
    let limited = Arc::new(Config::builder().max_endpoints_per_ip(1).build().unwrap());
    let mut client = registry(limited, now);

    let other_port = SocketAddr::new(SERVER.ip(), SERVER.port() + 1);
    client.connect(SERVER, now).expect("connect");
    assert_eq!(client.connect(other_port, now), Err(Error::RegistryFull(1)));
    assert_eq!(client.len(), 1);
}
