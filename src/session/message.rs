//! Wire format of records and handshake messages.
//!
//! Parsers are nom combinators over borrowed input. Bodies that are kept past
//! the datagram they arrived in own their bytes.

use nom::bytes::complete::take;
use nom::combinator::{map, rest};
use nom::multi::{length_data, many0};
use nom::number::complete::{be_u16, be_u24, be_u8};
use nom::sequence::tuple;
use nom::IResult;

use crate::buffer::Buf;
use crate::Error;

/// content_type(1) + version(2) + epoch(2) + seq(6) + length(2)
pub const RECORD_HEADER_LEN: usize = 13;

/// msg_type(1) + length(3) + message_seq(2) + fragment_offset(3) + fragment_length(3)
pub const HANDSHAKE_HEADER_LEN: usize = 12;

/// TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256
pub const CIPHER_SUITE: u16 = 0xC02B;

/// x25519 named group.
pub const NAMED_GROUP_X25519: u16 = 0x001D;

/// ecdsa_secp256r1_sha256 signature scheme.
pub const SIGNATURE_SCHEME: u16 = 0x0403;

const CURVE_TYPE_NAMED: u8 = 3;
const COMPRESSION_NULL: u8 = 0;
const CLIENT_CERT_TYPE_ECDSA_SIGN: u8 = 64;

const EXT_SUPPORTED_GROUPS: u16 = 0x000A;
const EXT_EC_POINT_FORMATS: u16 = 0x000B;
const EXT_SIGNATURE_ALGORITHMS: u16 = 0x000D;

/// Largest sequence number that fits the 48 bit record field.
pub const MAX_SEQUENCE_NUMBER: u64 = (1 << 48) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    ChangeCipherSpec,
    Alert,
    Handshake,
    ApplicationData,
}

impl ContentType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            20 => Some(ContentType::ChangeCipherSpec),
            21 => Some(ContentType::Alert),
            22 => Some(ContentType::Handshake),
            23 => Some(ContentType::ApplicationData),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            ContentType::ChangeCipherSpec => 20,
            ContentType::Alert => 21,
            ContentType::Handshake => 22,
            ContentType::ApplicationData => 23,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    DTLS1_0,
    DTLS1_2,
    Unknown(u16),
}

impl ProtocolVersion {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0xFEFF => ProtocolVersion::DTLS1_0,
            0xFEFD => ProtocolVersion::DTLS1_2,
            _ => ProtocolVersion::Unknown(value),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            ProtocolVersion::DTLS1_0 => 0xFEFF,
            ProtocolVersion::DTLS1_2 => 0xFEFD,
            ProtocolVersion::Unknown(value) => *value,
        }
    }

    fn parse(input: &[u8]) -> IResult<&[u8], ProtocolVersion> {
        map(be_u16, ProtocolVersion::from_u16)(input)
    }

    fn serialize(&self, output: &mut Buf) {
        output.extend_from_slice(&self.as_u16().to_be_bytes());
    }
}

fn be_u48(input: &[u8]) -> IResult<&[u8], u64> {
    map(take(6_usize), |b: &[u8]| {
        b.iter().fold(0u64, |acc, byte| (acc << 8) | *byte as u64)
    })(input)
}

/// Parse `input` completely with `parser`.
fn parse_all<'a, T>(
    mut parser: impl FnMut(&'a [u8]) -> IResult<&'a [u8], T>,
    input: &'a [u8],
) -> Result<T, Error> {
    let (rest, value) = parser(input)?;
    if !rest.is_empty() {
        return Err(Error::UnexpectedMessage(format!(
            "{} trailing bytes",
            rest.len()
        )));
    }
    Ok(value)
}

/// One record of a datagram.
#[derive(Debug, PartialEq, Eq)]
pub struct Record<'a> {
    pub content_type: ContentType,
    pub version: ProtocolVersion,
    pub epoch: u16,
    pub sequence_number: u64,
    pub fragment: &'a [u8],
}

impl<'a> Record<'a> {
    /// Parse the record at the front of `input`, returning the remainder.
    pub fn parse(input: &'a [u8]) -> Result<(&'a [u8], Record<'a>), Error> {
        if input.len() < RECORD_HEADER_LEN {
            return Err(Error::TooShort);
        }

        let (rest, (content_type, version, epoch, sequence_number, fragment)) = tuple((
            be_u8,
            ProtocolVersion::parse,
            be_u16,
            be_u48,
            length_data(be_u16),
        ))(input)?;

        let content_type =
            ContentType::from_u8(content_type).ok_or(Error::InvalidContentType(content_type))?;

        // DTLS 1.0 is allowed in the record layer for compatibility.
        if !matches!(version, ProtocolVersion::DTLS1_0 | ProtocolVersion::DTLS1_2) {
            let [major, minor] = version.as_u16().to_be_bytes();
            return Err(Error::UnsupportedTlsVersion(major, minor));
        }

        Ok((
            rest,
            Record {
                content_type,
                version,
                epoch,
                sequence_number,
                fragment,
            },
        ))
    }

    /// Parse every record of a datagram.
    pub fn parse_datagram(mut input: &'a [u8]) -> Result<Vec<Record<'a>>, Error> {
        if input.is_empty() {
            return Err(Error::TooShort);
        }
        let mut records = Vec::new();
        while !input.is_empty() {
            let (rest, record) = Record::parse(input)?;
            records.push(record);
            input = rest;
        }
        Ok(records)
    }
}

pub fn write_record_header(
    content_type: ContentType,
    epoch: u16,
    sequence_number: u64,
    length: u16,
    output: &mut Buf,
) {
    output.push(content_type.as_u8());
    ProtocolVersion::DTLS1_2.serialize(output);
    output.extend_from_slice(&epoch.to_be_bytes());
    output.extend_from_slice(&sequence_number.to_be_bytes()[2..]);
    output.extend_from_slice(&length.to_be_bytes());
}

/// Append an unprotected record.
pub fn write_plaintext_record(
    content_type: ContentType,
    sequence_number: u64,
    fragment: &[u8],
    output: &mut Buf,
) {
    write_record_header(content_type, 0, sequence_number, fragment.len() as u16, output);
    output.extend_from_slice(fragment);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeType {
    ClientHello,
    ServerHello,
    HelloVerifyRequest,
    Certificate,
    ServerKeyExchange,
    CertificateRequest,
    ServerHelloDone,
    CertificateVerify,
    ClientKeyExchange,
    Finished,
}

impl HandshakeType {
    pub fn from_u8(value: u8) -> Option<Self> {
        use HandshakeType::*;
        Some(match value {
            1 => ClientHello,
            2 => ServerHello,
            3 => HelloVerifyRequest,
            11 => Certificate,
            12 => ServerKeyExchange,
            13 => CertificateRequest,
            14 => ServerHelloDone,
            15 => CertificateVerify,
            16 => ClientKeyExchange,
            20 => Finished,
            _ => return None,
        })
    }

    pub fn as_u8(&self) -> u8 {
        use HandshakeType::*;
        match self {
            ClientHello => 1,
            ServerHello => 2,
            HelloVerifyRequest => 3,
            Certificate => 11,
            ServerKeyExchange => 12,
            CertificateRequest => 13,
            ServerHelloDone => 14,
            CertificateVerify => 15,
            ClientKeyExchange => 16,
            Finished => 20,
        }
    }
}

/// A complete (unfragmented) handshake message.
#[derive(Debug, PartialEq, Eq)]
pub struct Handshake<'a> {
    pub msg_type: HandshakeType,
    pub message_seq: u16,
    pub body: &'a [u8],
    /// Header and body, as it enters the transcript.
    pub raw: &'a [u8],
}

impl<'a> Handshake<'a> {
    pub fn parse(input: &'a [u8]) -> Result<(&'a [u8], Handshake<'a>), Error> {
        if input.len() < HANDSHAKE_HEADER_LEN {
            return Err(Error::TooShort);
        }

        let header: IResult<&[u8], (u8, u32, u16, u32, u32)> =
            tuple((be_u8, be_u24, be_u16, be_u24, be_u24))(input);
        let (after_header, (msg_type, length, message_seq, fragment_offset, fragment_length)) =
            header?;

        if fragment_offset != 0 || fragment_length != length {
            return Err(Error::FragmentedHandshake(message_seq));
        }

        let msg_type = HandshakeType::from_u8(msg_type)
            .ok_or_else(|| Error::UnexpectedMessage(format!("handshake type {}", msg_type)))?;

        let body: IResult<&[u8], &[u8]> = take(length as usize)(after_header);
        let (rest, body) = body?;
        let raw = &input[..HANDSHAKE_HEADER_LEN + body.len()];

        Ok((
            rest,
            Handshake {
                msg_type,
                message_seq,
                body,
                raw,
            },
        ))
    }
}

/// Append a handshake header and body to `output`.
pub fn write_handshake(msg_type: HandshakeType, message_seq: u16, body: &[u8], output: &mut Buf) {
    let length = (body.len() as u32).to_be_bytes();
    output.push(msg_type.as_u8());
    output.extend_from_slice(&length[1..]);
    output.extend_from_slice(&message_seq.to_be_bytes());
    output.extend_from_slice(&[0, 0, 0]);
    output.extend_from_slice(&length[1..]);
    output.extend_from_slice(body);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extension {
    pub extension_type: u16,
    pub data: Vec<u8>,
}

impl Extension {
    fn parse(input: &[u8]) -> IResult<&[u8], Extension> {
        let (input, (extension_type, data)) = tuple((be_u16, length_data(be_u16)))(input)?;
        Ok((
            input,
            Extension {
                extension_type,
                data: data.to_vec(),
            },
        ))
    }

    fn serialize(&self, output: &mut Buf) {
        output.extend_from_slice(&self.extension_type.to_be_bytes());
        output.extend_from_slice(&(self.data.len() as u16).to_be_bytes());
        output.extend_from_slice(&self.data);
    }
}

fn parse_extensions(input: &[u8]) -> IResult<&[u8], Vec<Extension>> {
    if input.is_empty() {
        return Ok((input, Vec::new()));
    }
    let (input, data) = length_data(be_u16)(input)?;
    let (_, extensions) = many0(Extension::parse)(data)?;
    Ok((input, extensions))
}

fn serialize_extensions(extensions: &[Extension], output: &mut Buf) {
    if extensions.is_empty() {
        return;
    }
    let len: usize = extensions.iter().map(|e| 4 + e.data.len()).sum();
    output.extend_from_slice(&(len as u16).to_be_bytes());
    for ext in extensions {
        ext.serialize(output);
    }
}

fn u16_list(values: &[u16]) -> Vec<u8> {
    let mut data = Vec::with_capacity(2 + values.len() * 2);
    data.extend_from_slice(&((values.len() * 2) as u16).to_be_bytes());
    for v in values {
        data.extend_from_slice(&v.to_be_bytes());
    }
    data
}

fn parse_u16_list(input: &[u8]) -> IResult<&[u8], Vec<u16>> {
    let (input, data) = length_data(be_u16)(input)?;
    let (_, values) = many0(be_u16)(data)?;
    Ok((input, values))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    pub client_version: ProtocolVersion,
    pub random: [u8; 32],
    pub session_id: Vec<u8>,
    pub cookie: Vec<u8>,
    pub cipher_suites: Vec<u16>,
    pub compression_methods: Vec<u8>,
    pub extensions: Vec<Extension>,
}

impl ClientHello {
    /// The hello we send: one suite, x25519 and ECDSA P-256.
    pub fn new(random: [u8; 32], cookie: Vec<u8>) -> Self {
        ClientHello {
            client_version: ProtocolVersion::DTLS1_2,
            random,
            session_id: Vec::new(),
            cookie,
            cipher_suites: vec![CIPHER_SUITE],
            compression_methods: vec![COMPRESSION_NULL],
            extensions: vec![
                Extension {
                    extension_type: EXT_SUPPORTED_GROUPS,
                    data: u16_list(&[NAMED_GROUP_X25519]),
                },
                Extension {
                    extension_type: EXT_EC_POINT_FORMATS,
                    // uncompressed
                    data: vec![1, 0],
                },
                Extension {
                    extension_type: EXT_SIGNATURE_ALGORITHMS,
                    data: u16_list(&[SIGNATURE_SCHEME]),
                },
            ],
        }
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], ClientHello> {
        let (input, client_version) = ProtocolVersion::parse(input)?;
        let (input, random) = take(32_usize)(input)?;
        let (input, session_id) = length_data(be_u8)(input)?;
        let (input, cookie) = length_data(be_u8)(input)?;
        let (input, cipher_suites) = parse_u16_list(input)?;
        let (input, compression_methods) = length_data(be_u8)(input)?;
        let (input, extensions) = parse_extensions(input)?;

        if session_id.len() > 32 || cipher_suites.is_empty() || compression_methods.is_empty() {
            return Err(nom::Err::Failure(nom::error::Error::new(
                input,
                nom::error::ErrorKind::LengthValue,
            )));
        }

        let mut r = [0u8; 32];
        r.copy_from_slice(random);

        Ok((
            input,
            ClientHello {
                client_version,
                random: r,
                session_id: session_id.to_vec(),
                cookie: cookie.to_vec(),
                cipher_suites,
                compression_methods: compression_methods.to_vec(),
                extensions,
            },
        ))
    }

    pub fn decode(body: &[u8]) -> Result<Self, Error> {
        parse_all(Self::parse, body)
    }

    pub fn serialize(&self, output: &mut Buf) {
        self.client_version.serialize(output);
        output.extend_from_slice(&self.random);
        output.push(self.session_id.len() as u8);
        output.extend_from_slice(&self.session_id);
        output.push(self.cookie.len() as u8);
        output.extend_from_slice(&self.cookie);
        output.extend_from_slice(&u16_list(&self.cipher_suites));
        output.push(self.compression_methods.len() as u8);
        output.extend_from_slice(&self.compression_methods);
        serialize_extensions(&self.extensions, output);
    }

    /// Whether the client can do the suite, key exchange and signatures we need.
    pub fn is_acceptable(&self) -> bool {
        let suite = self.cipher_suites.contains(&CIPHER_SUITE);
        let compression = self.compression_methods.contains(&COMPRESSION_NULL);

        // A missing extension means "no preference".
        let group = self.u16_extension(EXT_SUPPORTED_GROUPS, NAMED_GROUP_X25519);
        let scheme = self.u16_extension(EXT_SIGNATURE_ALGORITHMS, SIGNATURE_SCHEME);

        suite && compression && group && scheme
    }

    fn u16_extension(&self, extension_type: u16, wanted: u16) -> bool {
        let Some(ext) = self
            .extensions
            .iter()
            .find(|e| e.extension_type == extension_type)
        else {
            return true;
        };
        match parse_u16_list(&ext.data) {
            Ok((_, values)) => values.contains(&wanted),
            Err(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloVerifyRequest {
    pub server_version: ProtocolVersion,
    pub cookie: Vec<u8>,
}

impl HelloVerifyRequest {
    pub fn decode(body: &[u8]) -> Result<Self, Error> {
        let (server_version, cookie) =
            parse_all(tuple((ProtocolVersion::parse, length_data(be_u8))), body)?;
        if cookie.is_empty() {
            return Err(Error::UnexpectedMessage("empty cookie".into()));
        }
        Ok(HelloVerifyRequest {
            server_version,
            cookie: cookie.to_vec(),
        })
    }

    pub fn serialize(&self, output: &mut Buf) {
        self.server_version.serialize(output);
        output.push(self.cookie.len() as u8);
        output.extend_from_slice(&self.cookie);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHello {
    pub server_version: ProtocolVersion,
    pub random: [u8; 32],
    pub session_id: Vec<u8>,
    pub cipher_suite: u16,
    pub compression_method: u8,
}

impl ServerHello {
    pub fn new(random: [u8; 32]) -> Self {
        ServerHello {
            server_version: ProtocolVersion::DTLS1_2,
            random,
            session_id: Vec::new(),
            cipher_suite: CIPHER_SUITE,
            compression_method: COMPRESSION_NULL,
        }
    }

    fn parse(input: &[u8]) -> IResult<&[u8], ServerHello> {
        let (input, server_version) = ProtocolVersion::parse(input)?;
        let (input, random) = take(32_usize)(input)?;
        let (input, session_id) = length_data(be_u8)(input)?;
        let (input, cipher_suite) = be_u16(input)?;
        let (input, compression_method) = be_u8(input)?;
        // Extensions carry nothing we act on.
        let (input, _) = parse_extensions(input)?;

        let mut r = [0u8; 32];
        r.copy_from_slice(random);

        Ok((
            input,
            ServerHello {
                server_version,
                random: r,
                session_id: session_id.to_vec(),
                cipher_suite,
                compression_method,
            },
        ))
    }

    pub fn decode(body: &[u8]) -> Result<Self, Error> {
        parse_all(Self::parse, body)
    }

    pub fn serialize(&self, output: &mut Buf) {
        self.server_version.serialize(output);
        output.extend_from_slice(&self.random);
        output.push(self.session_id.len() as u8);
        output.extend_from_slice(&self.session_id);
        output.extend_from_slice(&self.cipher_suite.to_be_bytes());
        output.push(self.compression_method);
    }
}

/// Certificate chain, leaf first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    pub chain: Vec<Vec<u8>>,
}

impl Certificate {
    fn parse(input: &[u8]) -> IResult<&[u8], Certificate> {
        let (input, list) = length_data(be_u24)(input)?;
        let (rest, chain) = many0(length_data(be_u24))(list)?;
        if !rest.is_empty() {
            return Err(nom::Err::Failure(nom::error::Error::new(
                rest,
                nom::error::ErrorKind::LengthValue,
            )));
        }
        Ok((
            input,
            Certificate {
                chain: chain.into_iter().map(|c| c.to_vec()).collect(),
            },
        ))
    }

    pub fn decode(body: &[u8]) -> Result<Self, Error> {
        parse_all(Self::parse, body)
    }

    pub fn serialize(&self, output: &mut Buf) {
        let total: usize = self.chain.iter().map(|c| 3 + c.len()).sum();
        output.extend_from_slice(&(total as u32).to_be_bytes()[1..]);
        for cert in &self.chain {
            output.extend_from_slice(&(cert.len() as u32).to_be_bytes()[1..]);
            output.extend_from_slice(cert);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerKeyExchange {
    pub named_group: u16,
    pub public_key: Vec<u8>,
    pub signature_scheme: u16,
    pub signature: Vec<u8>,
}

impl ServerKeyExchange {
    /// ServerECDHParams: curve_type, named_group, public key.
    pub fn params(named_group: u16, public_key: &[u8]) -> Vec<u8> {
        let mut params = Vec::with_capacity(4 + public_key.len());
        params.push(CURVE_TYPE_NAMED);
        params.extend_from_slice(&named_group.to_be_bytes());
        params.push(public_key.len() as u8);
        params.extend_from_slice(public_key);
        params
    }

    fn parse(input: &[u8]) -> IResult<&[u8], ServerKeyExchange> {
        let (input, (curve_type, named_group, public_key, signature_scheme, signature)) =
            tuple((
                be_u8,
                be_u16,
                length_data(be_u8),
                be_u16,
                length_data(be_u16),
            ))(input)?;

        if curve_type != CURVE_TYPE_NAMED {
            return Err(nom::Err::Failure(nom::error::Error::new(
                input,
                nom::error::ErrorKind::Tag,
            )));
        }

        Ok((
            input,
            ServerKeyExchange {
                named_group,
                public_key: public_key.to_vec(),
                signature_scheme,
                signature: signature.to_vec(),
            },
        ))
    }

    pub fn decode(body: &[u8]) -> Result<Self, Error> {
        parse_all(Self::parse, body)
    }

    pub fn serialize(&self, output: &mut Buf) {
        output.extend_from_slice(&Self::params(self.named_group, &self.public_key));
        output.extend_from_slice(&self.signature_scheme.to_be_bytes());
        output.extend_from_slice(&(self.signature.len() as u16).to_be_bytes());
        output.extend_from_slice(&self.signature);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRequest {
    pub certificate_types: Vec<u8>,
    pub signature_schemes: Vec<u16>,
}

impl CertificateRequest {
    pub fn new() -> Self {
        CertificateRequest {
            certificate_types: vec![CLIENT_CERT_TYPE_ECDSA_SIGN],
            signature_schemes: vec![SIGNATURE_SCHEME],
        }
    }

    fn parse(input: &[u8]) -> IResult<&[u8], CertificateRequest> {
        let (input, certificate_types) = length_data(be_u8)(input)?;
        let (input, signature_schemes) = parse_u16_list(input)?;
        // Distinguished names are not used for selection.
        let (input, _) = length_data(be_u16)(input)?;
        Ok((
            input,
            CertificateRequest {
                certificate_types: certificate_types.to_vec(),
                signature_schemes,
            },
        ))
    }

    pub fn decode(body: &[u8]) -> Result<Self, Error> {
        parse_all(Self::parse, body)
    }

    pub fn serialize(&self, output: &mut Buf) {
        output.push(self.certificate_types.len() as u8);
        output.extend_from_slice(&self.certificate_types);
        output.extend_from_slice(&u16_list(&self.signature_schemes));
        output.extend_from_slice(&[0, 0]);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientKeyExchange {
    pub public_key: Vec<u8>,
}

impl ClientKeyExchange {
    pub fn decode(body: &[u8]) -> Result<Self, Error> {
        let public_key = parse_all(length_data(be_u8), body)?;
        Ok(ClientKeyExchange {
            public_key: public_key.to_vec(),
        })
    }

    pub fn serialize(&self, output: &mut Buf) {
        output.push(self.public_key.len() as u8);
        output.extend_from_slice(&self.public_key);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateVerify {
    pub signature_scheme: u16,
    pub signature: Vec<u8>,
}

impl CertificateVerify {
    pub fn decode(body: &[u8]) -> Result<Self, Error> {
        let (signature_scheme, signature) = parse_all(tuple((be_u16, length_data(be_u16))), body)?;
        Ok(CertificateVerify {
            signature_scheme,
            signature: signature.to_vec(),
        })
    }

    pub fn serialize(&self, output: &mut Buf) {
        output.extend_from_slice(&self.signature_scheme.to_be_bytes());
        output.extend_from_slice(&(self.signature.len() as u16).to_be_bytes());
        output.extend_from_slice(&self.signature);
    }
}

pub fn decode_finished(body: &[u8]) -> Result<&[u8], Error> {
    let verify_data = parse_all(rest, body)?;
    if verify_data.len() != super::crypto::VERIFY_DATA_LEN {
        return Err(Error::UnexpectedMessage(format!(
            "verify_data of {} bytes",
            verify_data.len()
        )));
    }
    Ok(verify_data)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alert {
    pub level: u8,
    pub description: u8,
}

impl Alert {
    pub const WARNING: u8 = 1;
    pub const FATAL: u8 = 2;
    pub const CLOSE_NOTIFY: u8 = 0;

    pub fn close_notify() -> Self {
        Alert {
            level: Self::WARNING,
            description: Self::CLOSE_NOTIFY,
        }
    }

    pub fn decode(fragment: &[u8]) -> Result<Self, Error> {
        let (level, description) = parse_all(tuple((be_u8, be_u8)), fragment)?;
        Ok(Alert { level, description })
    }

    pub fn to_bytes(self) -> [u8; 2] {
        [self.level, self.description]
    }
}

/// What the registry needs to know about a ClientHello from an unknown peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloPeek {
    pub record_sequence: u64,
    pub message_seq: u16,
    pub cookie: Vec<u8>,
}

/// Look for a ClientHello as the first message of a datagram.
pub fn peek_client_hello(datagram: &[u8]) -> Option<HelloPeek> {
    let (_, record) = Record::parse(datagram).ok()?;
    if record.content_type != ContentType::Handshake || record.epoch != 0 {
        return None;
    }
    let (_, handshake) = Handshake::parse(record.fragment).ok()?;
    if handshake.msg_type != HandshakeType::ClientHello {
        return None;
    }
    let hello = ClientHello::decode(handshake.body).ok()?;
    Some(HelloPeek {
        record_sequence: record.sequence_number,
        message_seq: handshake.message_seq,
        cookie: hello.cookie,
    })
}

/// A complete datagram carrying a HelloVerifyRequest.
///
/// The record sequence and message_seq mirror the ClientHello it answers so
/// the server stays stateless.
pub fn hello_verify_request(peek: &HelloPeek, cookie: Vec<u8>, output: &mut Buf) {
    let hvr = HelloVerifyRequest {
        server_version: ProtocolVersion::DTLS1_2,
        cookie,
    };
    let mut body = Buf::new();
    hvr.serialize(&mut body);

    let mut handshake = Buf::new();
    write_handshake(
        HandshakeType::HelloVerifyRequest,
        peek.message_seq,
        &body,
        &mut handshake,
    );

    write_plaintext_record(
        ContentType::Handshake,
        peek.record_sequence,
        &handshake,
        output,
    );
}
