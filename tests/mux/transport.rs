use std::net::UdpSocket;
use std::thread;
use std::time::{Duration, Instant};

use dtlsmux::{EndpointRegistry, Event, Transport};

use crate::common::*;

fn socket() -> UdpSocket {
    let socket = UdpSocket::bind("127.0.0.1:0").expect("bind");
    socket.set_nonblocking(true).expect("nonblocking");
    socket
}

/// Pump both sides until `done` holds for the collected events.
fn pump_until(
    a: (&mut EndpointRegistry, &mut UdpSocket),
    b: (&mut EndpointRegistry, &mut UdpSocket),
    events: &mut Vec<Event>,
    done: impl Fn(&[Event]) -> bool,
) {
    let (reg_a, sock_a) = a;
    let (reg_b, sock_b) = b;

    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        events.extend(reg_a.pump(sock_a, Instant::now()));
        events.extend(reg_b.pump(sock_b, Instant::now()));
        if done(events) {
            return;
        }
        thread::sleep(Duration::from_millis(2));
    }
    panic!("timed out, events so far: {:?}", events);
}

#[test]
fn udp_loopback_round_trip() {
    let _ = env_logger::try_init();

    let mut client_socket = socket();
    let mut server_socket = socket();
    let client_addr = client_socket.local_addr().unwrap();
    let server_addr = server_socket.local_addr().unwrap();

    let now = Instant::now();
    let mut client = registry(config(), now);
    let mut server = registry(config(), now);

    for datagram in client.connect(server_addr, now).expect("connect") {
        client_socket
            .send_datagram(server_addr, &datagram)
            .expect("send");
    }

    let mut events = Vec::new();
    pump_until(
        (&mut client, &mut client_socket),
        (&mut server, &mut server_socket),
        &mut events,
        |events| {
            let connected = |addr| {
                events
                    .iter()
                    .any(|e| matches!(e, Event::Connected(a) if *a == addr))
            };
            connected(client_addr) && connected(server_addr)
        },
    );

    let datagram = client.encode(server_addr, b"over the wire").expect("encode");
    client_socket
        .send_datagram(server_addr, &datagram)
        .expect("send");

    let mut events = Vec::new();
    pump_until(
        (&mut server, &mut server_socket),
        (&mut client, &mut client_socket),
        &mut events,
        |events| events.iter().any(|e| matches!(e, Event::Payload(..))),
    );

    let payload = events.iter().find_map(|e| match e {
        Event::Payload(from, payload) => Some((*from, payload.to_vec())),
        _ => None,
    });
    assert_eq!(payload, Some((client_addr, b"over the wire".to_vec())));
}
