//! Key schedule and record protection for the single supported suite,
//! TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256.

use std::fmt;

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes128Gcm, Key};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use tinyvec::ArrayVec;
use zeroize::Zeroize;

use super::message::{ContentType, ProtocolVersion, Record};
use crate::buffer::Buf;
use crate::driver::Role;
use crate::Error;

type HmacSha256 = Hmac<Sha256>;

/// Explicit nonce carried in front of every protected fragment.
pub(crate) const EXPLICIT_NONCE_LEN: usize = 8;

pub(crate) const GCM_TAG_LEN: usize = 16;

const KEY_LEN: usize = 16;
const FIXED_IV_LEN: usize = 4;
const MASTER_SECRET_LEN: usize = 48;
pub(crate) const VERIFY_DATA_LEN: usize = 12;

/// PRF for TLS 1.2 (RFC 5246 section 5) with HMAC-SHA256.
///
/// `seed` is the seed WITHOUT the label, which is prepended here.
pub(crate) fn prf(
    secret: &[u8],
    label: &str,
    seed: &[u8],
    output_len: usize,
) -> Result<ArrayVec<[u8; 128]>, Error> {
    let mut full_seed: ArrayVec<[u8; 128]> = ArrayVec::default();
    full_seed.extend_from_slice(label.as_bytes());
    full_seed.extend_from_slice(seed);

    p_hash(secret, &full_seed, output_len)
}

fn p_hash(secret: &[u8], full_seed: &[u8], output_len: usize) -> Result<ArrayVec<[u8; 128]>, Error> {
    let key = <HmacSha256 as Mac>::new_from_slice(secret)
        .map_err(|_| Error::CryptoError("Invalid HMAC key".to_string()))?;

    let mut result = ArrayVec::default();

    // A(1) = HMAC_hash(secret, A(0)) where A(0) = seed
    let mut a = {
        let mut mac = key.clone();
        mac.update(full_seed);
        mac.finalize().into_bytes()
    };

    while result.len() < output_len {
        // HMAC_hash(secret, A(i) + seed)
        let mut mac = key.clone();
        mac.update(&a);
        mac.update(full_seed);
        let output = mac.finalize().into_bytes();

        let to_copy = (output_len - result.len()).min(output.len());
        result.extend_from_slice(&output[..to_copy]);

        if result.len() < output_len {
            // A(i+1) = HMAC_hash(secret, A(i))
            let mut mac = key.clone();
            mac.update(&a);
            a = mac.finalize().into_bytes();
        }
    }

    Ok(result)
}

/// Keys derived from one handshake.
pub(crate) struct Keys {
    master_secret: [u8; MASTER_SECRET_LEN],
    client_write: RecordCipher,
    server_write: RecordCipher,
}

impl Keys {
    pub fn derive(
        pre_master_secret: &[u8],
        client_random: &[u8; 32],
        server_random: &[u8; 32],
    ) -> Result<Self, Error> {
        let mut seed = [0u8; 64];
        seed[..32].copy_from_slice(client_random);
        seed[32..].copy_from_slice(server_random);

        let mut master = prf(pre_master_secret, "master secret", &seed, MASTER_SECRET_LEN)?;
        let mut master_secret = [0u8; MASTER_SECRET_LEN];
        master_secret.copy_from_slice(&master);
        master.as_mut_slice().zeroize();

        // Key expansion uses server_random + client_random.
        seed[..32].copy_from_slice(server_random);
        seed[32..].copy_from_slice(client_random);

        let len = 2 * KEY_LEN + 2 * FIXED_IV_LEN;
        let mut block = prf(&master_secret, "key expansion", &seed, len)?;

        let (client_key, rest) = block.split_at(KEY_LEN);
        let (server_key, rest) = rest.split_at(KEY_LEN);
        let (client_iv, server_iv) = rest.split_at(FIXED_IV_LEN);

        let keys = Keys {
            master_secret,
            client_write: RecordCipher::new(client_key, client_iv),
            server_write: RecordCipher::new(server_key, server_iv),
        };

        block.as_mut_slice().zeroize();

        Ok(keys)
    }

    /// verify_data of a Finished message sent by `sender`.
    pub fn verify_data(
        &self,
        sender: Role,
        transcript: &[u8],
    ) -> Result<[u8; VERIFY_DATA_LEN], Error> {
        let label = match sender {
            Role::Client => "client finished",
            Role::Server => "server finished",
        };
        let hash = Sha256::digest(transcript);
        let out = prf(&self.master_secret, label, &hash, VERIFY_DATA_LEN)?;

        let mut verify_data = [0u8; VERIFY_DATA_LEN];
        verify_data.copy_from_slice(&out);
        Ok(verify_data)
    }

    /// The cipher protecting records written by `role`.
    pub fn write_cipher(&self, role: Role) -> &RecordCipher {
        match role {
            Role::Client => &self.client_write,
            Role::Server => &self.server_write,
        }
    }
}

impl Drop for Keys {
    fn drop(&mut self) {
        self.master_secret.zeroize();
    }
}

impl fmt::Debug for Keys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keys").finish_non_exhaustive()
    }
}

/// AES-128-GCM for one direction of traffic.
pub(crate) struct RecordCipher {
    cipher: Aes128Gcm,
    iv: [u8; FIXED_IV_LEN],
}

impl RecordCipher {
    fn new(key: &[u8], iv: &[u8]) -> Self {
        let mut fixed = [0u8; FIXED_IV_LEN];
        fixed.copy_from_slice(iv);
        RecordCipher {
            cipher: Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(key)),
            iv: fixed,
        }
    }

    /// Append one complete protected record to `out`.
    pub fn seal(
        &self,
        content_type: ContentType,
        epoch: u16,
        sequence_number: u64,
        plaintext: &[u8],
        out: &mut Buf,
    ) -> Result<(), Error> {
        let explicit = explicit_nonce(epoch, sequence_number);
        let length = EXPLICIT_NONCE_LEN + plaintext.len() + GCM_TAG_LEN;

        super::message::write_record_header(
            content_type,
            epoch,
            sequence_number,
            length as u16,
            out,
        );
        out.extend_from_slice(&explicit);

        let start = out.len();
        out.extend_from_slice(plaintext);

        let nonce = self.nonce(&explicit);
        let aad = aad(
            content_type,
            ProtocolVersion::DTLS1_2,
            epoch,
            sequence_number,
            plaintext.len() as u16,
        );

        let tag = self
            .cipher
            .encrypt_in_place_detached(GenericArray::from_slice(&nonce), &aad, &mut out[start..])
            .map_err(|_| Error::CryptoError("AES-GCM encryption failed".to_string()))?;

        out.extend_from_slice(&tag);
        Ok(())
    }

    /// Decrypt the fragment of `record` into the front of `out`.
    ///
    /// Every header field is authenticated. Returns the plaintext length.
    /// Nothing is decrypted when `out` cannot hold the plaintext.
    pub fn open(&self, record: &Record, out: &mut [u8]) -> Result<usize, Error> {
        let fragment = record.fragment;
        let Some(len) = fragment.len().checked_sub(EXPLICIT_NONCE_LEN + GCM_TAG_LEN) else {
            return Err(Error::AuthenticationFailed);
        };
        if out.len() < len {
            return Err(Error::BufferTooSmall {
                needed: len,
                available: out.len(),
            });
        }

        let (explicit, rest) = fragment.split_at(EXPLICIT_NONCE_LEN);
        let (ciphertext, tag) = rest.split_at(len);

        let nonce = self.nonce(explicit);
        let aad = aad(
            record.content_type,
            record.version,
            record.epoch,
            record.sequence_number,
            len as u16,
        );

        let out = &mut out[..len];
        out.copy_from_slice(ciphertext);

        let result = self.cipher.decrypt_in_place_detached(
            GenericArray::from_slice(&nonce),
            &aad,
            out,
            GenericArray::from_slice(tag),
        );

        if result.is_err() {
            out.fill(0);
            return Err(Error::AuthenticationFailed);
        }

        Ok(len)
    }

    fn nonce(&self, explicit: &[u8]) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[..FIXED_IV_LEN].copy_from_slice(&self.iv);
        nonce[FIXED_IV_LEN..].copy_from_slice(explicit);
        nonce
    }
}

impl Drop for RecordCipher {
    fn drop(&mut self) {
        self.iv.zeroize();
    }
}

fn explicit_nonce(epoch: u16, sequence_number: u64) -> [u8; EXPLICIT_NONCE_LEN] {
    let mut explicit = sequence_number.to_be_bytes();
    explicit[..2].copy_from_slice(&epoch.to_be_bytes());
    explicit
}

// epoch(2) + seq(6) + type(1) + version(2) + length(2)
fn aad(
    content_type: ContentType,
    version: ProtocolVersion,
    epoch: u16,
    sequence_number: u64,
    length: u16,
) -> [u8; 13] {
    let mut aad = [0u8; 13];
    aad[..8].copy_from_slice(&explicit_nonce(epoch, sequence_number));
    aad[8] = content_type.as_u8();
    aad[9..11].copy_from_slice(&version.as_u16().to_be_bytes());
    aad[11..].copy_from_slice(&length.to_be_bytes());
    aad
}

/// Compare two byte strings without an early exit.
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
