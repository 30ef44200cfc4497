//! dtlsmux
//!
//! Many encrypted peer sessions behind one UDP socket.
//!
//! Each remote address gets an [`Endpoint`]: a small state machine that runs
//! a DTLS 1.2 style handshake (ECDHE over x25519, ECDSA P-256 certificates,
//! AES-128-GCM records) and then protects application datagrams. The
//! [`EndpointRegistry`] owns the endpoints, creates them on first contact,
//! answers unknown peers with a stateless cookie challenge and sweeps out
//! the ones that failed or stalled.
//!
//! Nothing here owns a socket or a clock. Callers pass `now: Instant` in,
//! feed received datagrams and send whatever comes out. [`Transport`] and
//! [`EndpointRegistry::pump`] wrap that into a poll loop for a
//! `std::net::UdpSocket`.
//!
//! ```no_run
//! use std::net::UdpSocket;
//! use std::sync::Arc;
//! use std::time::Instant;
//!
//! use dtlsmux::{Config, EndpointRegistry, Event, Identity};
//!
//! let mut socket = UdpSocket::bind("0.0.0.0:4433").unwrap();
//! socket.set_nonblocking(true).unwrap();
//!
//! let config = Arc::new(Config::default());
//! let identity = Arc::new(Identity::generate().unwrap());
//! let mut registry: EndpointRegistry = EndpointRegistry::new(config, identity, Instant::now());
//!
//! loop {
//!     for event in registry.pump(&mut socket, Instant::now()) {
//!         if let Event::Payload(from, data) = event {
//!             let reply = registry.encode(from, &data).unwrap();
//!             socket.send_to(&reply, from).unwrap();
//!         }
//!     }
//! #   break;
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all)]

#[macro_use]
extern crate log;

mod buffer;
pub use buffer::Buf;

mod certificate;
pub use certificate::{Fingerprint, Identity, Verification};

mod channel;
pub use channel::HandshakeChannel;

mod config;
pub use config::{Config, ConfigBuilder};

mod cookie;

mod driver;
pub use driver::{HandshakeDriver, Opened, Progress, Role};

mod endpoint;
pub use endpoint::{Decoded, Endpoint, HandshakeState, Status};

mod error;
pub use error::Error;

mod registry;
pub use registry::{EndpointRegistry, EvictReason, Routed, Sweep};

mod rng;

mod session;
pub use session::{Session, AEAD_OVERHEAD, RECORD_HEADER_LEN};

mod timer;

mod transport;
pub use transport::{Event, Transport};

mod window;
