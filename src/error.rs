use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::endpoint::HandshakeState;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("Too short")]
    TooShort,

    #[error("Parse incomplete")]
    ParseIncomplete,

    #[error("Invalid content type {0}")]
    InvalidContentType(u8),

    #[error("Unsupported TLS version {0}, {1}")]
    UnsupportedTlsVersion(u8, u8),

    #[error("Too big dtls sequence field (max 48 bits) {0}")]
    TooBigDtlsSeq(u64),

    #[error("Fragmented handshake message {0} not supported")]
    FragmentedHandshake(u16),

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Security error: {0}")]
    SecurityError(String),

    #[error("Crypto error: {0}")]
    CryptoError(String),

    #[error("Certificate error: {0}")]
    CertificateError(String),

    #[error("Certificate fingerprint not trusted")]
    FingerprintMismatch,

    #[error("Peer sent fatal alert {0}")]
    PeerAlert(u8),

    #[error("Record failed authentication")]
    AuthenticationFailed,

    #[error("Replayed record with sequence {0}")]
    Replayed(u64),

    #[error("Destination buffer too small: need {needed}, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("Payload too large: {len} > {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("Transmit queue full")]
    TransmitQueueFull,

    #[error("{op} is not valid in state {state}")]
    Misuse {
        op: &'static str,
        state: HandshakeState,
    },

    #[error("Endpoint for {0} already exists")]
    EndpointExists(SocketAddr),

    #[error("No endpoint for {0}")]
    UnknownPeer(SocketAddr),

    #[error("Registry is full ({0} endpoints)")]
    RegistryFull(usize),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Transport error ({kind:?}): {message}")]
    Io { kind: io::ErrorKind, message: String },
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

impl<'a> From<nom::Err<nom::error::Error<&'a [u8]>>> for Error {
    fn from(value: nom::Err<nom::error::Error<&'a [u8]>>) -> Self {
        match value {
            nom::Err::Incomplete(_) => Error::ParseIncomplete,
            nom::Err::Error(e) | nom::Err::Failure(e) => {
                Error::UnexpectedMessage(format!("parse error {:?}", e.code))
            }
        }
    }
}

impl Error {
    /// Whether this error ends the session it occurred in.
    ///
    /// Record-level rejections on an established session are not fatal,
    /// they only discard the offending datagram.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::AuthenticationFailed
                | Error::Replayed(_)
                | Error::BufferTooSmall { .. }
                | Error::PayloadTooLarge { .. }
                | Error::Misuse { .. }
        )
    }
}
