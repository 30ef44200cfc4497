mod common;
mod data;
mod handshake;
mod registry;
mod transport;
