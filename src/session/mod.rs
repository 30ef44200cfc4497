//! The cryptographic session behind every endpoint.
//!
//! A DTLS 1.2 style handshake for one suite (ECDHE x25519, ECDSA P-256,
//! AES-128-GCM), followed by protected application records.
//!
//! ```text
//! Client                                             Server
//!
//! ClientHello                  -------->
//!                              <--------  HelloVerifyRequest
//!                                         (stateless, answered by the registry)
//! ClientHello (with cookie)    -------->
//!                                                ServerHello
//!                                                Certificate
//!                                          ServerKeyExchange
//!                                        CertificateRequest*
//!                              <--------     ServerHelloDone
//! Certificate*
//! ClientKeyExchange
//! CertificateVerify*
//! [ChangeCipherSpec]
//! Finished                     -------->
//!                                         [ChangeCipherSpec]
//!                              <--------            Finished
//! ```
//!
//! The session only ever reads from and writes to a [`HandshakeChannel`].

use std::collections::BTreeMap;
use std::fmt;
use std::mem;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use rand::Rng;
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::buffer::Buf;
use crate::certificate::{verify_signature, Identity, Verification};
use crate::channel::HandshakeChannel;
use crate::driver::{HandshakeDriver, Opened, Progress, Role};
use crate::rng::SeededRng;
use crate::timer::ExponentialBackoff;
use crate::window::ReplayWindow;
use crate::{Config, Error};

mod crypto;
pub(crate) mod message;

use crypto::{constant_time_eq, Keys};
use message::{
    decode_finished, write_handshake, write_plaintext_record, Alert, Certificate,
    CertificateRequest, CertificateVerify, ClientHello, ClientKeyExchange, ContentType,
    Handshake, HandshakeType, HelloVerifyRequest, ProtocolVersion, Record, ServerHello,
    ServerKeyExchange, MAX_SEQUENCE_NUMBER, NAMED_GROUP_X25519, SIGNATURE_SCHEME,
};

pub use message::RECORD_HEADER_LEN;

/// Explicit nonce and GCM tag added to every protected record.
pub const AEAD_OVERHEAD: usize = crypto::EXPLICIT_NONCE_LEN + crypto::GCM_TAG_LEN;

const X25519_KEY_LEN: usize = 32;

/// The handshake message a session waits for next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Await {
    /// Client that has not sent its ClientHello yet.
    Start,

    ServerHello,
    ServerCertificate,
    ServerKeyExchange,
    CertificateRequestOrDone,
    ServerHelloDone,
    ServerFinished,

    ClientHello,
    ClientCertificate,
    ClientKeyExchange,
    CertificateVerify,
    ClientFinished,

    /// Handshake complete.
    Nothing,
}

/// A record of the current flight, kept for resending.
#[derive(Debug)]
struct Entry {
    content_type: ContentType,
    epoch: u16,
    fragment: Vec<u8>,
}

/// What a record meant beyond handshake progress.
enum Control {
    None,
    Closed,
}

pub struct Session {
    role: Role,
    peer: SocketAddr,
    config: Arc<Config>,
    identity: Arc<Identity>,

    /// Seedable random number generator for retransmit jitter.
    rng: SeededRng,

    awaiting: Await,

    /// Handshakes collected for Finished and CertificateVerify.
    transcript: Buf,

    client_random: [u8; 32],
    server_random: [u8; 32],

    /// Cookie from the last HelloVerifyRequest.
    cookie: Vec<u8>,

    ecdh_secret: Option<EphemeralSecret>,
    peer_public: Option<[u8; X25519_KEY_LEN]>,

    keys: Option<Keys>,

    peer_certificate: Option<Vec<u8>>,

    /// Client: the server asked for our certificate.
    /// Server: we ask for the client's.
    certificate_requested: bool,

    /// Next handshake message sequence number for sending.
    next_message_seq: u16,

    /// Expected peer handshake sequence number.
    peer_message_seq: u16,

    /// message_seq of the message that ended the peer's previous flight.
    ///
    /// Seeing it again means our answer to it was lost.
    peer_flight_end: Option<u16>,

    /// Handshake messages that arrived ahead of `peer_message_seq`.
    pending: BTreeMap<u16, (u16, Vec<u8>)>,

    /// Record counters. Epoch 0 keeps counting separately since resends of
    /// an epoch 0 flight go out after epoch 1 records.
    sequence_epoch_0: u64,
    sequence_epoch_1: u64,

    /// Anti-replay window for epoch 1.
    replay: ReplayWindow,

    /// The records that have been sent in the current flight.
    flight: Vec<Entry>,

    flight_backoff: ExponentialBackoff,

    /// Resends of the current flight the peer asked for by repeating itself.
    peer_resends: usize,

    /// A new flight was built and the timer must be re-armed.
    flight_started: bool,

    /// Datagrams built but not yet handed to the channel.
    outgoing: Vec<Buf>,
}

impl Session {
    fn new(role: Role, peer: SocketAddr, config: Arc<Config>, identity: Arc<Identity>) -> Self {
        let mut rng = SeededRng::new(config.rng_seed());

        let flight_backoff =
            ExponentialBackoff::new(config.flight_start_rto(), config.flight_retries(), &mut rng);

        let certificate_requested = role == Role::Server
            && (config.require_client_certificate()
                || *config.verification() != Verification::AcceptAny);

        Session {
            role,
            peer,
            config,
            identity,
            rng,
            awaiting: match role {
                Role::Client => Await::Start,
                Role::Server => Await::ClientHello,
            },
            transcript: Buf::new(),
            client_random: [0; 32],
            server_random: [0; 32],
            cookie: Vec::new(),
            ecdh_secret: None,
            peer_public: None,
            keys: None,
            peer_certificate: None,
            certificate_requested,
            next_message_seq: 0,
            peer_message_seq: 0,
            peer_flight_end: None,
            pending: BTreeMap::new(),
            sequence_epoch_0: 0,
            sequence_epoch_1: 0,
            replay: ReplayWindow::new(),
            flight: Vec::new(),
            flight_backoff,
            peer_resends: 0,
            flight_started: false,
            outgoing: Vec::new(),
        }
    }

    fn is_complete(&self) -> bool {
        self.awaiting == Await::Nothing
    }

    fn peer_role(&self) -> Role {
        match self.role {
            Role::Client => Role::Server,
            Role::Server => Role::Client,
        }
    }

    fn handle_datagram(&mut self, datagram: &[u8]) -> Result<Control, Error> {
        let mut control = Control::None;
        for record in Record::parse_datagram(datagram)? {
            if let Control::Closed = self.handle_record(&record)? {
                control = Control::Closed;
            }
        }
        Ok(control)
    }

    /// One record during the handshake. Records that do not authenticate
    /// are dropped, so a forged datagram can not fail the handshake.
    fn handle_record(&mut self, record: &Record) -> Result<Control, Error> {
        match record.epoch {
            0 => self.handle_plaintext(record),
            1 if self.keys.is_some() => {
                let mut plaintext = vec![0; record.fragment.len()];
                let len = match self.unprotect(record, &mut plaintext) {
                    Ok(len) => len,
                    Err(e) if !e.is_fatal() => {
                        debug!("Drop epoch 1 record from {}: {}", self.peer, e);
                        return Ok(Control::None);
                    }
                    Err(e) => return Err(e),
                };
                plaintext.truncate(len);

                self.handle_protected(record.content_type, &plaintext)
            }
            epoch => {
                trace!("Drop record of epoch {} from {}", epoch, self.peer);
                Ok(Control::None)
            }
        }
    }

    /// Authenticate and decrypt an epoch 1 record into `out`.
    ///
    /// The replay window only moves for records that authenticate.
    fn unprotect(&mut self, record: &Record, out: &mut [u8]) -> Result<usize, Error> {
        let keys = self
            .keys
            .as_ref()
            .ok_or_else(|| Error::CryptoError("session not established".into()))?;

        let seq = record.sequence_number;
        if !self.replay.is_fresh(seq) {
            return Err(Error::Replayed(seq));
        }

        let len = keys.write_cipher(self.peer_role()).open(record, out)?;
        self.replay.mark(seq);
        Ok(len)
    }

    fn handle_plaintext(&mut self, record: &Record) -> Result<Control, Error> {
        match record.content_type {
            ContentType::Handshake => {
                self.handle_handshakes(0, record.fragment)?;
                Ok(Control::None)
            }
            // Only the epoch of a record decides how it is read.
            ContentType::ChangeCipherSpec => Ok(Control::None),
            ContentType::Alert => {
                // Unauthenticated alerts can not end an established session.
                if self.is_complete() {
                    return Ok(Control::None);
                }
                self.handle_alert(record.fragment)
            }
            ContentType::ApplicationData => {
                debug!("Drop plaintext application data from {}", self.peer);
                Ok(Control::None)
            }
        }
    }

    fn handle_protected(&mut self, content_type: ContentType, plaintext: &[u8]) -> Result<Control, Error> {
        match content_type {
            ContentType::Handshake => {
                self.handle_handshakes(1, plaintext)?;
                Ok(Control::None)
            }
            ContentType::ChangeCipherSpec => Ok(Control::None),
            ContentType::Alert => self.handle_alert(plaintext),
            ContentType::ApplicationData => {
                // Reordered ahead of the Finished that completes us.
                trace!("Drop application data before handshake completes");
                Ok(Control::None)
            }
        }
    }

    fn handle_alert(&mut self, fragment: &[u8]) -> Result<Control, Error> {
        let alert = Alert::decode(fragment)?;
        let ends = alert.level == Alert::FATAL || alert.description == Alert::CLOSE_NOTIFY;
        if !ends {
            trace!("Ignore warning alert {}", alert.description);
            return Ok(Control::None);
        }
        if self.is_complete() {
            debug!("Peer {} closed the session (alert {})", self.peer, alert.description);
            return Ok(Control::Closed);
        }
        Err(Error::PeerAlert(alert.description))
    }

    fn handle_handshakes(&mut self, epoch: u16, mut fragment: &[u8]) -> Result<(), Error> {
        while !fragment.is_empty() {
            let (rest, handshake) = Handshake::parse(fragment)?;
            self.handle_handshake(epoch, handshake)?;
            fragment = rest;
        }
        Ok(())
    }

    fn handle_handshake(&mut self, epoch: u16, handshake: Handshake) -> Result<(), Error> {
        let seq = handshake.message_seq;

        // After a cookie exchange the client numbers its hello 1, not 0.
        if self.awaiting == Await::ClientHello && handshake.msg_type == HandshakeType::ClientHello {
            self.peer_message_seq = seq;
        }

        if seq < self.peer_message_seq {
            // Once complete, only the peer's Finished (epoch 1) asks for our
            // last flight. Plaintext repeats can be forged by anyone.
            let repeats_flight = Some(seq) == self.peer_flight_end
                && !self.flight.is_empty()
                && !(self.is_complete() && epoch == 0);

            if repeats_flight && self.peer_resends < self.config.flight_retries() {
                self.peer_resends += 1;
                self.flight_resend("peer resent its flight")?;
            } else {
                trace!("Ignore duplicate handshake {:?} seq {}", handshake.msg_type, seq);
            }
            return Ok(());
        }

        if seq > self.peer_message_seq {
            if self.pending.len() >= self.config.max_queue_rx() {
                debug!("Receive queue full, drop handshake seq {}", seq);
                return Ok(());
            }
            trace!("Buffer future handshake {:?} seq {}", handshake.msg_type, seq);
            self.pending
                .entry(seq)
                .or_insert_with(|| (epoch, handshake.raw.to_vec()));
            return Ok(());
        }

        self.process_handshake(epoch, handshake)?;

        while let Some((epoch, raw)) = self.pending.remove(&self.peer_message_seq) {
            let (_, handshake) = Handshake::parse(&raw)?;
            self.process_handshake(epoch, handshake)?;
        }

        let expected = self.peer_message_seq;
        self.pending.retain(|seq, _| *seq > expected);

        Ok(())
    }

    fn process_handshake(&mut self, epoch: u16, handshake: Handshake) -> Result<(), Error> {
        use HandshakeType as H;

        let msg_type = handshake.msg_type;
        let expected_epoch = if msg_type == H::Finished { 1 } else { 0 };
        if epoch != expected_epoch {
            return Err(Error::UnexpectedMessage(format!(
                "{:?} in epoch {}",
                msg_type, epoch
            )));
        }

        trace!(
            "Handle {:?} seq {} from {}",
            msg_type,
            handshake.message_seq,
            self.peer
        );
        self.peer_message_seq = handshake.message_seq.wrapping_add(1);

        match (self.awaiting, msg_type) {
            (Await::ServerHello, H::HelloVerifyRequest) => self.on_hello_verify_request(handshake),
            (Await::ServerHello, H::ServerHello) => self.on_server_hello(handshake),
            (Await::ServerCertificate, H::Certificate) => self.on_server_certificate(handshake),
            (Await::ServerKeyExchange, H::ServerKeyExchange) => {
                self.on_server_key_exchange(handshake)
            }
            (Await::CertificateRequestOrDone, H::CertificateRequest) => {
                self.on_certificate_request(handshake)
            }
            (Await::CertificateRequestOrDone | Await::ServerHelloDone, H::ServerHelloDone) => {
                self.on_server_hello_done(handshake)
            }
            (Await::ServerFinished, H::Finished) => self.on_server_finished(handshake),

            (Await::ClientHello, H::ClientHello) => self.on_client_hello(handshake),
            (Await::ClientCertificate, H::Certificate) => self.on_client_certificate(handshake),
            (Await::ClientKeyExchange, H::ClientKeyExchange) => {
                self.on_client_key_exchange(handshake)
            }
            (Await::CertificateVerify, H::CertificateVerify) => {
                self.on_certificate_verify(handshake)
            }
            (Await::ClientFinished, H::Finished) => self.on_client_finished(handshake),

            (awaiting, msg_type) => Err(Error::UnexpectedMessage(format!(
                "{:?} while awaiting {:?}",
                msg_type, awaiting
            ))),
        }
    }

    // Client side

    fn send_client_hello(&mut self) -> Result<(), Error> {
        self.flight_begin();

        let hello = ClientHello::new(self.client_random, self.cookie.clone());
        let mut body = Buf::new();
        hello.serialize(&mut body);

        // The server mirrors the message_seq of the hello it answers.
        self.peer_message_seq = self.next_message_seq;
        self.send_handshake(HandshakeType::ClientHello, 0, &body)?;

        self.awaiting = Await::ServerHello;
        Ok(())
    }

    fn on_hello_verify_request(&mut self, handshake: Handshake) -> Result<(), Error> {
        let hvr = HelloVerifyRequest::decode(handshake.body)?;
        debug!("HelloVerifyRequest from {}, resend ClientHello", self.peer);

        self.cookie = hvr.cookie;
        self.peer_flight_end = Some(handshake.message_seq);

        // The transcript starts over with the second ClientHello.
        self.transcript.clear();
        self.send_client_hello()
    }

    fn on_server_hello(&mut self, handshake: Handshake) -> Result<(), Error> {
        let hello = ServerHello::decode(handshake.body)?;

        if hello.server_version != ProtocolVersion::DTLS1_2 {
            let [major, minor] = hello.server_version.as_u16().to_be_bytes();
            return Err(Error::UnsupportedTlsVersion(major, minor));
        }
        if hello.cipher_suite != message::CIPHER_SUITE || hello.compression_method != 0 {
            return Err(Error::SecurityError(format!(
                "server selected unsupported cipher suite {:04x}",
                hello.cipher_suite
            )));
        }

        self.server_random = hello.random;
        self.transcript.extend_from_slice(handshake.raw);
        self.awaiting = Await::ServerCertificate;
        Ok(())
    }

    fn on_server_certificate(&mut self, handshake: Handshake) -> Result<(), Error> {
        let certificate = Certificate::decode(handshake.body)?;
        let leaf = certificate
            .chain
            .into_iter()
            .next()
            .ok_or_else(|| Error::CertificateError("empty certificate chain".into()))?;

        self.config.verification().check(&leaf)?;
        self.peer_certificate = Some(leaf);

        self.transcript.extend_from_slice(handshake.raw);
        self.awaiting = Await::ServerKeyExchange;
        Ok(())
    }

    fn on_server_key_exchange(&mut self, handshake: Handshake) -> Result<(), Error> {
        let ske = ServerKeyExchange::decode(handshake.body)?;

        if ske.named_group != NAMED_GROUP_X25519 {
            return Err(Error::SecurityError(format!(
                "unsupported named group {:04x}",
                ske.named_group
            )));
        }
        if ske.signature_scheme != SIGNATURE_SCHEME {
            return Err(Error::SecurityError(format!(
                "unsupported signature scheme {:04x}",
                ske.signature_scheme
            )));
        }
        let public: [u8; X25519_KEY_LEN] = ske
            .public_key
            .as_slice()
            .try_into()
            .map_err(|_| Error::SecurityError("bad x25519 public key length".into()))?;

        let mut signed = Vec::with_capacity(64 + 4 + X25519_KEY_LEN);
        signed.extend_from_slice(&self.client_random);
        signed.extend_from_slice(&self.server_random);
        signed.extend_from_slice(&ServerKeyExchange::params(ske.named_group, &ske.public_key));

        let cert = self
            .peer_certificate
            .as_deref()
            .ok_or_else(|| Error::UnexpectedMessage("ServerKeyExchange before Certificate".into()))?;
        verify_signature(cert, &signed, &ske.signature)?;

        self.peer_public = Some(public);
        self.transcript.extend_from_slice(handshake.raw);
        self.awaiting = Await::CertificateRequestOrDone;
        Ok(())
    }

    fn on_certificate_request(&mut self, handshake: Handshake) -> Result<(), Error> {
        let request = CertificateRequest::decode(handshake.body)?;
        if !request.signature_schemes.contains(&SIGNATURE_SCHEME) {
            return Err(Error::SecurityError(
                "server does not accept ECDSA P-256 client certificates".into(),
            ));
        }

        self.certificate_requested = true;
        self.transcript.extend_from_slice(handshake.raw);
        self.awaiting = Await::ServerHelloDone;
        Ok(())
    }

    fn on_server_hello_done(&mut self, handshake: Handshake) -> Result<(), Error> {
        if !handshake.body.is_empty() {
            return Err(Error::UnexpectedMessage("ServerHelloDone with body".into()));
        }
        self.transcript.extend_from_slice(handshake.raw);
        self.peer_flight_end = Some(handshake.message_seq);

        self.flight_begin();

        if self.certificate_requested {
            let certificate = Certificate {
                chain: vec![self.identity.certificate().to_vec()],
            };
            let mut body = Buf::new();
            certificate.serialize(&mut body);
            self.send_handshake(HandshakeType::Certificate, 0, &body)?;
        }

        let secret = EphemeralSecret::random();
        let public = PublicKey::from(&secret);
        let cke = ClientKeyExchange {
            public_key: public.as_bytes().to_vec(),
        };
        let mut body = Buf::new();
        cke.serialize(&mut body);
        self.send_handshake(HandshakeType::ClientKeyExchange, 0, &body)?;

        self.derive_keys(secret)?;

        if self.certificate_requested {
            let verify = CertificateVerify {
                signature_scheme: SIGNATURE_SCHEME,
                signature: self.identity.sign(&self.transcript),
            };
            let mut body = Buf::new();
            verify.serialize(&mut body);
            self.send_handshake(HandshakeType::CertificateVerify, 0, &body)?;
        }

        self.send_finished()?;
        self.awaiting = Await::ServerFinished;
        Ok(())
    }

    fn on_server_finished(&mut self, handshake: Handshake) -> Result<(), Error> {
        self.verify_finished(Role::Server, &handshake)?;
        self.transcript.extend_from_slice(handshake.raw);
        self.complete();
        Ok(())
    }

    // Server side

    fn on_client_hello(&mut self, handshake: Handshake) -> Result<(), Error> {
        let hello = ClientHello::decode(handshake.body)?;

        // DTLS versions count down; 0xFEFD is newer than 0xFEFF.
        if hello.client_version.as_u16() > ProtocolVersion::DTLS1_2.as_u16() {
            let [major, minor] = hello.client_version.as_u16().to_be_bytes();
            return Err(Error::UnsupportedTlsVersion(major, minor));
        }
        if !hello.is_acceptable() {
            return Err(Error::SecurityError(
                "no shared cipher suite, group or signature scheme".into(),
            ));
        }

        self.client_random = hello.random;
        rand::rng().fill(&mut self.server_random);
        self.transcript.extend_from_slice(handshake.raw);
        self.peer_flight_end = Some(handshake.message_seq);

        // Our numbering starts where the client's hello is.
        self.next_message_seq = handshake.message_seq;

        self.flight_begin();

        let mut body = Buf::new();
        ServerHello::new(self.server_random).serialize(&mut body);
        self.send_handshake(HandshakeType::ServerHello, 0, &body)?;

        let certificate = Certificate {
            chain: vec![self.identity.certificate().to_vec()],
        };
        let mut body = Buf::new();
        certificate.serialize(&mut body);
        self.send_handshake(HandshakeType::Certificate, 0, &body)?;

        let secret = EphemeralSecret::random();
        let public = PublicKey::from(&secret);
        self.ecdh_secret = Some(secret);

        let params = ServerKeyExchange::params(NAMED_GROUP_X25519, public.as_bytes());
        let mut signed = Vec::with_capacity(64 + params.len());
        signed.extend_from_slice(&self.client_random);
        signed.extend_from_slice(&self.server_random);
        signed.extend_from_slice(&params);

        let ske = ServerKeyExchange {
            named_group: NAMED_GROUP_X25519,
            public_key: public.as_bytes().to_vec(),
            signature_scheme: SIGNATURE_SCHEME,
            signature: self.identity.sign(&signed),
        };
        let mut body = Buf::new();
        ske.serialize(&mut body);
        self.send_handshake(HandshakeType::ServerKeyExchange, 0, &body)?;

        if self.certificate_requested {
            let mut body = Buf::new();
            CertificateRequest::new().serialize(&mut body);
            self.send_handshake(HandshakeType::CertificateRequest, 0, &body)?;
        }

        self.send_handshake(HandshakeType::ServerHelloDone, 0, &[])?;

        self.awaiting = if self.certificate_requested {
            Await::ClientCertificate
        } else {
            Await::ClientKeyExchange
        };
        Ok(())
    }

    fn on_client_certificate(&mut self, handshake: Handshake) -> Result<(), Error> {
        let certificate = Certificate::decode(handshake.body)?;
        let leaf = certificate
            .chain
            .into_iter()
            .next()
            .ok_or_else(|| Error::CertificateError("client certificate required".into()))?;

        self.config.verification().check(&leaf)?;
        self.peer_certificate = Some(leaf);

        self.transcript.extend_from_slice(handshake.raw);
        self.awaiting = Await::ClientKeyExchange;
        Ok(())
    }

    fn on_client_key_exchange(&mut self, handshake: Handshake) -> Result<(), Error> {
        let cke = ClientKeyExchange::decode(handshake.body)?;
        let public: [u8; X25519_KEY_LEN] = cke
            .public_key
            .as_slice()
            .try_into()
            .map_err(|_| Error::SecurityError("bad x25519 public key length".into()))?;
        self.peer_public = Some(public);

        let secret = self
            .ecdh_secret
            .take()
            .ok_or_else(|| Error::UnexpectedMessage("ClientKeyExchange twice".into()))?;
        self.derive_keys(secret)?;

        self.transcript.extend_from_slice(handshake.raw);
        self.awaiting = if self.peer_certificate.is_some() {
            Await::CertificateVerify
        } else {
            Await::ClientFinished
        };
        Ok(())
    }

    fn on_certificate_verify(&mut self, handshake: Handshake) -> Result<(), Error> {
        let verify = CertificateVerify::decode(handshake.body)?;
        if verify.signature_scheme != SIGNATURE_SCHEME {
            return Err(Error::SecurityError(format!(
                "unsupported signature scheme {:04x}",
                verify.signature_scheme
            )));
        }

        let cert = self
            .peer_certificate
            .as_deref()
            .ok_or_else(|| Error::UnexpectedMessage("CertificateVerify without Certificate".into()))?;
        verify_signature(cert, &self.transcript, &verify.signature)?;

        self.transcript.extend_from_slice(handshake.raw);
        self.awaiting = Await::ClientFinished;
        Ok(())
    }

    fn on_client_finished(&mut self, handshake: Handshake) -> Result<(), Error> {
        self.verify_finished(Role::Client, &handshake)?;
        self.transcript.extend_from_slice(handshake.raw);
        self.peer_flight_end = Some(handshake.message_seq);

        self.flight_begin();
        self.send_finished()?;
        self.complete();
        Ok(())
    }

    // Shared

    fn derive_keys(&mut self, secret: EphemeralSecret) -> Result<(), Error> {
        let peer_public = self
            .peer_public
            .ok_or_else(|| Error::UnexpectedMessage("no peer key share".into()))?;

        let shared = secret.diffie_hellman(&PublicKey::from(peer_public));
        if !shared.was_contributory() {
            return Err(Error::SecurityError("non-contributory x25519 key share".into()));
        }

        self.keys = Some(Keys::derive(
            shared.as_bytes(),
            &self.client_random,
            &self.server_random,
        )?);
        Ok(())
    }

    fn send_finished(&mut self) -> Result<(), Error> {
        self.create_record(ContentType::ChangeCipherSpec, 0, true, &[1])?;

        let keys = self
            .keys
            .as_ref()
            .ok_or_else(|| Error::CryptoError("Finished before keys".into()))?;
        let verify_data = keys.verify_data(self.role, &self.transcript)?;

        self.send_handshake(HandshakeType::Finished, 1, &verify_data)
    }

    fn verify_finished(&self, sender: Role, handshake: &Handshake) -> Result<(), Error> {
        let verify_data = decode_finished(handshake.body)?;
        let keys = self
            .keys
            .as_ref()
            .ok_or_else(|| Error::UnexpectedMessage("Finished before keys".into()))?;
        let expected = keys.verify_data(sender, &self.transcript)?;

        if !constant_time_eq(&expected, verify_data) {
            return Err(Error::SecurityError("Finished verify_data mismatch".into()));
        }
        Ok(())
    }

    fn complete(&mut self) {
        debug!("Handshake with {} complete as {:?}", self.peer, self.role);
        self.awaiting = Await::Nothing;
        self.flight_backoff.disarm();
        self.ecdh_secret = None;
        self.pending.clear();
    }

    /// Serialize a handshake message, add it to the transcript and send it.
    fn send_handshake(&mut self, msg_type: HandshakeType, epoch: u16, body: &[u8]) -> Result<(), Error> {
        let message_seq = self.next_message_seq;
        self.next_message_seq = self.next_message_seq.wrapping_add(1);

        let mut raw = Buf::new();
        write_handshake(msg_type, message_seq, body, &mut raw);
        self.transcript.extend_from_slice(&raw);

        trace!("Send {:?} seq {} to {}", msg_type, message_seq, self.peer);
        self.create_record(ContentType::Handshake, epoch, true, &raw)
    }

    /// Start a new flight. The previous flight is no longer resent.
    fn flight_begin(&mut self) {
        self.flight.clear();
        self.peer_resends = 0;
        self.flight_started = true;
    }

    fn flight_resend(&mut self, reason: &str) -> Result<(), Error> {
        debug!("Resending flight to {} due to {}", self.peer, reason);
        // For lifetime issues, we take the entries out of self
        let entries = mem::take(&mut self.flight);

        let result = entries
            .iter()
            .try_for_each(|e| self.create_record(e.content_type, e.epoch, false, &e.fragment));

        // Put the entries back into self
        self.flight = entries;
        result
    }

    /// Append one record to the datagrams under construction.
    fn create_record(
        &mut self,
        content_type: ContentType,
        epoch: u16,
        save_fragment: bool,
        fragment: &[u8],
    ) -> Result<(), Error> {
        if save_fragment {
            self.flight.push(Entry {
                content_type,
                epoch,
                fragment: fragment.to_vec(),
            });
        }

        let overhead = if epoch >= 1 { AEAD_OVERHEAD } else { 0 };
        let record_wire_len = RECORD_HEADER_LEN + fragment.len() + overhead;
        let mtu = self.config.mtu();

        // Handshake messages are never fragmented, so each must fit a datagram.
        if record_wire_len > mtu {
            return Err(Error::PayloadTooLarge {
                len: fragment.len(),
                max: mtu - RECORD_HEADER_LEN - overhead,
            });
        }

        let can_append = self
            .outgoing
            .last()
            .map(|b| b.len() + record_wire_len <= mtu)
            .unwrap_or(false);
        if !can_append {
            self.outgoing.push(Buf::new());
        }
        let Some(datagram) = self.outgoing.last_mut() else {
            unreachable!("a datagram was pushed above");
        };

        if epoch == 0 {
            let seq = self.sequence_epoch_0;
            if seq > MAX_SEQUENCE_NUMBER {
                return Err(Error::TooBigDtlsSeq(seq));
            }
            self.sequence_epoch_0 += 1;
            write_plaintext_record(content_type, seq, fragment, datagram);
        } else {
            let seq = self.sequence_epoch_1;
            if seq > MAX_SEQUENCE_NUMBER {
                return Err(Error::TooBigDtlsSeq(seq));
            }
            let keys = self
                .keys
                .as_ref()
                .ok_or_else(|| Error::CryptoError("epoch 1 record before keys".into()))?;
            self.sequence_epoch_1 += 1;
            keys.write_cipher(self.role)
                .seal(content_type, 1, seq, fragment, datagram)?;
        }

        Ok(())
    }

    /// Hand every datagram built so far to the channel.
    fn flush(&mut self, channel: &mut HandshakeChannel) -> Result<(), Error> {
        for datagram in self.outgoing.drain(..) {
            let mut buf = channel.buffer();
            buf.extend_from_slice(&datagram);
            channel.push_datagram(buf)?;
        }
        Ok(())
    }

    fn rearm(&mut self, now: Instant) {
        if !mem::take(&mut self.flight_started) {
            return;
        }
        // The last flight of a handshake is only resent when the peer
        // shows it was lost.
        if self.is_complete() {
            self.flight_backoff.disarm();
        } else {
            self.flight_backoff.arm(now, &mut self.rng);
        }
    }
}

impl HandshakeDriver for Session {
    fn new_session(
        role: Role,
        peer: SocketAddr,
        config: &Arc<Config>,
        identity: &Arc<Identity>,
    ) -> Result<Self, Error> {
        let mut session = Session::new(role, peer, Arc::clone(config), Arc::clone(identity));
        if role == Role::Client {
            rand::rng().fill(&mut session.client_random);
        }
        Ok(session)
    }

    fn step(&mut self, channel: &mut HandshakeChannel, now: Instant) -> Result<Progress, Error> {
        let before = (self.awaiting, self.peer_message_seq);

        if self.awaiting == Await::Start {
            self.send_client_hello()?;
        } else if channel.has_received() {
            let received = channel.take_received();
            let result = self.handle_datagram(&received);
            channel.finish_received(received);

            if let Control::Closed = result? {
                return Err(Error::PeerAlert(Alert::CLOSE_NOTIFY));
            }
        }

        self.rearm(now);
        self.flush(channel)?;

        Ok(if self.is_complete() {
            Progress::Complete
        } else {
            Progress::Pending {
                advanced: (self.awaiting, self.peer_message_seq) != before,
            }
        })
    }

    fn handle_timeout(&mut self, channel: &mut HandshakeChannel, now: Instant) -> Result<(), Error> {
        if self.flight_backoff.fire(now, &mut self.rng) {
            self.flight_resend("timeout")?;
            self.flush(channel)?;
        }
        Ok(())
    }

    fn poll_timeout(&self) -> Option<Instant> {
        self.flight_backoff.deadline()
    }

    fn seal(&mut self, plaintext: &[u8], out: &mut Buf) -> Result<(), Error> {
        let max = self.config.max_payload();
        if plaintext.len() > max {
            return Err(Error::PayloadTooLarge {
                len: plaintext.len(),
                max,
            });
        }

        let keys = self
            .keys
            .as_ref()
            .filter(|_| self.awaiting == Await::Nothing)
            .ok_or_else(|| Error::CryptoError("session not established".into()))?;

        let seq = self.sequence_epoch_1;
        if seq > MAX_SEQUENCE_NUMBER {
            return Err(Error::TooBigDtlsSeq(seq));
        }
        self.sequence_epoch_1 += 1;

        out.clear();
        keys.write_cipher(self.role)
            .seal(ContentType::ApplicationData, 1, seq, plaintext, out)
    }

    fn open(
        &mut self,
        datagram: &[u8],
        channel: &mut HandshakeChannel,
        out: &mut [u8],
    ) -> Result<Opened, Error> {
        let mut opened = Opened::Handshake;

        for record in Record::parse_datagram(datagram)? {
            match (record.epoch, record.content_type) {
                (1, ContentType::ApplicationData) => {
                    let needed = record.fragment.len().saturating_sub(AEAD_OVERHEAD);
                    if out.len() < needed {
                        return Err(Error::BufferTooSmall {
                            needed,
                            available: out.len(),
                        });
                    }

                    let len = self.unprotect(&record, out)?;

                    // One application record per datagram.
                    self.flush(channel)?;
                    return Ok(Opened::Data(len));
                }
                (1, content_type) => {
                    let mut plaintext = vec![0; record.fragment.len()];
                    let len = self.unprotect(&record, &mut plaintext)?;
                    plaintext.truncate(len);

                    if let Control::Closed = self.handle_protected(content_type, &plaintext)? {
                        opened = Opened::Closed;
                    }
                }
                (0, ContentType::ApplicationData) => {
                    return Err(Error::UnexpectedMessage(
                        "unprotected application data".into(),
                    ));
                }
                (0, _) => {
                    if let Control::Closed = self.handle_plaintext(&record)? {
                        opened = Opened::Closed;
                    }
                }
                (epoch, _) => {
                    return Err(Error::UnexpectedMessage(format!("record of epoch {}", epoch)));
                }
            }
        }

        self.flush(channel)?;
        Ok(opened)
    }

    fn close(&mut self, channel: &mut HandshakeChannel) -> Result<(), Error> {
        if self.keys.is_none() {
            return Ok(());
        }
        self.create_record(ContentType::Alert, 1, false, &Alert::close_notify().to_bytes())?;
        self.flush(channel)
    }

    fn peer_certificate(&self) -> Option<&[u8]> {
        self.peer_certificate.as_deref()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.role)
            .field("peer", &self.peer)
            .field("awaiting", &self.awaiting)
            .field("next_message_seq", &self.next_message_seq)
            .field("peer_message_seq", &self.peer_message_seq)
            .field("flight", &self.flight.len())
            .finish()
    }
}
