use std::time::Instant;

use dtlsmux::{Buf, Decoded, Error, HandshakeState, AEAD_OVERHEAD, RECORD_HEADER_LEN};

use crate::common::*;

#[test]
fn payload_both_ways() {
    let _ = env_logger::try_init();

    let now = Instant::now();
    let (mut client, mut server) = connected_pair(now);
    let mut out = [0u8; 1500];

    let mut datagram = Buf::new();
    client.encode(b"hello", &mut datagram).expect("encode");
    assert_eq!(datagram.len(), RECORD_HEADER_LEN + AEAD_OVERHEAD + 5);
    assert_eq!(server.decode(&datagram, &mut out), Ok(Decoded::Payload(5)));
    assert_eq!(&out[..5], b"hello");

    server.encode(b"world", &mut datagram).expect("encode");
    assert_eq!(client.decode(&datagram, &mut out), Ok(Decoded::Payload(5)));
    assert_eq!(&out[..5], b"world");

    // An empty payload is still a datagram.
    client.encode(b"", &mut datagram).expect("encode");
    assert_eq!(server.decode(&datagram, &mut out), Ok(Decoded::Payload(0)));
}

#[test]
fn many_payloads_in_order_and_out_of_order() {
    let now = Instant::now();
    let (mut client, mut server) = connected_pair(now);
    let mut out = [0u8; 64];

    let datagrams: Vec<Buf> = (0..10u8)
        .map(|i| {
            let mut d = Buf::new();
            client.encode(&[i; 10], &mut d).expect("encode");
            d
        })
        .collect();

    for i in [3usize, 0, 9, 1, 2, 8, 4, 7, 5, 6] {
        assert_eq!(server.decode(&datagrams[i], &mut out), Ok(Decoded::Payload(10)));
        assert_eq!(&out[..10], &[i as u8; 10]);
    }
}

#[test]
fn bit_flip_is_rejected() {
    let now = Instant::now();
    let (mut client, mut server) = connected_pair(now);
    let mut out = [0u8; 128];

    let mut datagram = Buf::new();
    client.encode(b"attack at dawn", &mut datagram).expect("encode");

    for index in RECORD_HEADER_LEN..datagram.len() {
        let mut tampered = datagram.clone();
        tampered[index] ^= 0x01;
        assert_eq!(
            server.decode(&tampered, &mut out),
            Err(Error::AuthenticationFailed),
            "flip at {}",
            index
        );
    }

    // Every bit of the record header is covered too.
    for index in 0..RECORD_HEADER_LEN {
        for bit in 0..8 {
            let mut tampered = datagram.clone();
            tampered[index] ^= 1 << bit;
            assert!(
                server.decode(&tampered, &mut out).is_err(),
                "flip of bit {} at {}",
                bit,
                index
            );
        }
    }

    // Tampering does not hurt the connection, nor burn the sequence number.
    assert_eq!(server.state(), HandshakeState::Complete);
    assert_eq!(server.decode(&datagram, &mut out), Ok(Decoded::Payload(14)));
}

#[test]
fn truncated_record_is_rejected() {
    let now = Instant::now();
    let (mut client, mut server) = connected_pair(now);
    let mut out = [0u8; 128];

    let mut datagram = Buf::new();
    client.encode(b"attack at dawn", &mut datagram).expect("encode");

    let result = server.decode(&datagram[..datagram.len() - 4], &mut out);
    assert!(result.is_err());
    assert_eq!(server.state(), HandshakeState::Complete);
}

#[test]
fn replay_is_rejected() {
    let now = Instant::now();
    let (mut client, mut server) = connected_pair(now);
    let mut out = [0u8; 128];

    let mut datagram = Buf::new();
    client.encode(b"once", &mut datagram).expect("encode");

    assert_eq!(server.decode(&datagram, &mut out), Ok(Decoded::Payload(4)));
    assert!(matches!(
        server.decode(&datagram, &mut out),
        Err(Error::Replayed(_))
    ));
    assert_eq!(server.state(), HandshakeState::Complete);
}

#[test]
fn small_buffer_is_an_error_not_a_truncation() {
    let now = Instant::now();
    let (mut client, mut server) = connected_pair(now);

    let mut datagram = Buf::new();
    client.encode(&[7; 100], &mut datagram).expect("encode");

    let mut small = [0u8; 99];
    assert_eq!(
        server.decode(&datagram, &mut small),
        Err(Error::BufferTooSmall {
            needed: 100,
            available: 99
        })
    );

    // The record was not consumed.
    let mut out = [0u8; 100];
    assert_eq!(server.decode(&datagram, &mut out), Ok(Decoded::Payload(100)));
    assert_eq!(out, [7; 100]);
}

#[test]
fn payload_limit_follows_mtu() {
    let now = Instant::now();
    let (mut client, _server) = connected_pair(now);
    let max = config().max_payload();

    let mut datagram = Buf::new();
    client.encode(&vec![0; max], &mut datagram).expect("max payload");
    assert_eq!(datagram.len(), config().mtu());

    assert_eq!(
        client.encode(&vec![0; max + 1], &mut datagram),
        Err(Error::PayloadTooLarge { len: max + 1, max })
    );
}

#[test]
fn close_reaches_peer() {
    let _ = env_logger::try_init();

    let now = Instant::now();
    let (mut client, mut server) = connected_pair(now);
    let mut out = [0u8; 128];

    client.close().expect("close");
    let datagrams = client.take_transmit();
    assert_eq!(datagrams.len(), 1);

    assert_eq!(server.decode(&datagrams[0], &mut out), Ok(Decoded::Closed));
}

#[test]
fn encode_before_complete_is_misuse() {
    let now = Instant::now();
    let (mut client, _server) = endpoint_pair(config(), config(), now);
    client.connect(now).expect("connect");

    assert_eq!(
        client.encode(b"early", &mut Buf::new()),
        Err(Error::Misuse {
            op: "encode",
            state: HandshakeState::Connecting
        })
    );
}
