//! Certificates, keys and peer verification.
//!
//! Every side of a handshake presents a certificate carrying an ECDSA P-256
//! key and proves possession by signing handshake data. Whether a proven
//! certificate is also trusted is decided by [`Verification`].

use std::fmt;

use der::Decode;
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{DerSignature, Signature, SigningKey, VerifyingKey};
use pkcs8::DecodePrivateKey;
use rcgen::{
    Certificate as RcgenCertificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    PKCS_ECDSA_P256_SHA256,
};
use sha2::{Digest, Sha256};
use spki::ObjectIdentifier;
use x509_cert::Certificate as X509Certificate;

use crate::Error;

const OID_EC_PUBLIC_KEY: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");
const OID_P256: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.3.1.7");

/// Certificate and private key of the local side.
#[derive(Clone)]
pub struct Identity {
    certificate: Vec<u8>,
    signing_key: SigningKey,
}

impl Identity {
    /// Create an identity from a DER certificate and a PKCS#8 DER (or PEM) key.
    pub fn new(certificate: Vec<u8>, private_key: &[u8]) -> Result<Self, Error> {
        let signing_key = load_private_key(private_key)?;

        // The certificate must carry the public half of the key we sign with.
        let public = public_key_of(&certificate)?;
        if public != *signing_key.verifying_key() {
            return Err(Error::CertificateError(
                "private key does not match certificate".into(),
            ));
        }

        Ok(Identity {
            certificate,
            signing_key,
        })
    }

    /// Generate a self-signed certificate with a fresh P-256 key.
    pub fn generate() -> Result<Self, Error> {
        let key_pair = KeyPair::generate(&PKCS_ECDSA_P256_SHA256)
            .map_err(|e| Error::CertificateError(format!("key generation: {e}")))?;

        let mut params = CertificateParams::new(vec!["dtlsmux peer".to_string()]);

        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::OrganizationName, "dtlsmux".to_string());
        distinguished_name.push(DnType::CommonName, "dtlsmux peer".to_string());
        params.distinguished_name = distinguished_name;
        params.is_ca = IsCa::NoCa;
        params.key_pair = Some(key_pair);

        let not_before = time::OffsetDateTime::now_utc();
        params.not_before = not_before;
        params.not_after = not_before + time::Duration::days(365);

        let cert = RcgenCertificate::from_params(params)
            .map_err(|e| Error::CertificateError(format!("generation: {e}")))?;
        let cert_der = cert
            .serialize_der()
            .map_err(|e| Error::CertificateError(format!("serialize: {e}")))?;
        let key_der = cert.serialize_private_key_der();

        Identity::new(cert_der, &key_der)
    }

    /// The certificate in DER format.
    pub fn certificate(&self) -> &[u8] {
        &self.certificate
    }

    /// SHA-256 fingerprint of the certificate.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(&self.certificate)
    }

    /// DER encoded ECDSA-SHA256 signature over `data`.
    pub(crate) fn sign(&self, data: &[u8]) -> Vec<u8> {
        let signature: Signature = self.signing_key.sign(data);
        let der: DerSignature = signature.to_der();
        der.as_bytes().to_vec()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

/// SHA-256 hash of a DER certificate.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(pub [u8; 32]);

impl Fingerprint {
    pub fn of(cert_der: &[u8]) -> Self {
        Fingerprint(Sha256::digest(cert_der).into())
    }
}

/// Colon separated upper case hex, "AF:12:F6:...".
impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self)
    }
}

/// How the certificate a peer presents is trusted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// Any certificate whose key signed the handshake.
    AcceptAny,
    /// Only certificates with one of these fingerprints.
    Pinned(Vec<Fingerprint>),
}

impl Verification {
    pub(crate) fn check(&self, cert_der: &[u8]) -> Result<(), Error> {
        match self {
            Verification::AcceptAny => Ok(()),
            Verification::Pinned(trusted) => {
                let fingerprint = Fingerprint::of(cert_der);
                if trusted.contains(&fingerprint) {
                    Ok(())
                } else {
                    debug!("Untrusted certificate {}", fingerprint);
                    Err(Error::FingerprintMismatch)
                }
            }
        }
    }
}

/// Verify a DER ECDSA-SHA256 `signature` over `data` with the key in `cert_der`.
pub(crate) fn verify_signature(cert_der: &[u8], data: &[u8], signature: &[u8]) -> Result<(), Error> {
    let verifying_key = public_key_of(cert_der)?;
    let signature = Signature::from_der(signature)
        .map_err(|_| Error::SecurityError("invalid signature format".into()))?;
    verifying_key
        .verify(data, &signature)
        .map_err(|_| Error::SecurityError("ECDSA signature verification failed".into()))
}

fn public_key_of(cert_der: &[u8]) -> Result<VerifyingKey, Error> {
    let cert = X509Certificate::from_der(cert_der)
        .map_err(|e| Error::CertificateError(format!("parse: {e}")))?;
    let spki = &cert.tbs_certificate.subject_public_key_info;

    if spki.algorithm.oid != OID_EC_PUBLIC_KEY {
        return Err(Error::CertificateError(format!(
            "unsupported public key algorithm: {}",
            spki.algorithm.oid
        )));
    }

    let curve: ObjectIdentifier = spki
        .algorithm
        .parameters
        .as_ref()
        .ok_or_else(|| Error::CertificateError("missing EC curve parameter".into()))?
        .decode_as()
        .map_err(|_| Error::CertificateError("invalid EC curve parameter".into()))?;

    if curve != OID_P256 {
        return Err(Error::CertificateError(format!("unsupported curve: {curve}")));
    }

    let bytes = spki
        .subject_public_key
        .as_bytes()
        .ok_or_else(|| Error::CertificateError("invalid public key bitstring".into()))?;

    VerifyingKey::from_sec1_bytes(bytes)
        .map_err(|_| Error::CertificateError("invalid P-256 public key".into()))
}

fn load_private_key(key: &[u8]) -> Result<SigningKey, Error> {
    if let Ok(k) = SigningKey::from_pkcs8_der(key) {
        return Ok(k);
    }

    if let Ok(pem) = std::str::from_utf8(key) {
        if pem.contains("-----BEGIN") {
            return SigningKey::from_pkcs8_pem(pem)
                .map_err(|e| Error::CertificateError(format!("private key: {e}")));
        }
    }

    Err(Error::CertificateError(
        "private key is not PKCS#8 P-256".into(),
    ))
}
