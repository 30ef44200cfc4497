#![no_main]

//! A stream of datagrams from a handful of addresses into one registry.

use libfuzzer_sys::fuzz_target;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use dtlsmux::{Config, EndpointRegistry, Identity};

fn identity() -> Arc<Identity> {
    static IDENTITY: OnceLock<Arc<Identity>> = OnceLock::new();
    IDENTITY
        .get_or_init(|| Arc::new(Identity::generate().expect("identity")))
        .clone()
}

fuzz_target!(|data: &[u8]| {
    let mut now = Instant::now();
    let config = Config::builder()
        .cookie_exchange(data.first().map_or(false, |b| b & 1 == 1))
        .build()
        .expect("config");
    let mut registry: EndpointRegistry = EndpointRegistry::new(Arc::new(config), identity(), now);

    // Each chunk: one byte of sender port, one byte of length, then payload.
    let mut rest = data;
    while let [port, len, tail @ ..] = rest {
        let len = (*len as usize).min(tail.len());
        let (datagram, next) = tail.split_at(len);
        let from = SocketAddr::from(([10, 0, 0, 1], 1000 + (*port % 4) as u16));

        let _ = registry.on_datagram_received(from, datagram, now);
        assert!(registry.len() <= 4);

        now += Duration::from_millis(300);
        let _ = registry.sweep(now);
        rest = next;
    }
});
