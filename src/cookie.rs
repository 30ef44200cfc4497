//! Stateless HelloVerifyRequest cookies.
//!
//! A cookie is HMAC-SHA256 over the peer address with a secret that rotates
//! every `cookie_lifetime`. Cookies made with the previous secret are still
//! honoured while that secret is younger than two lifetimes, so a client
//! that was challenged right before a rotation is not challenged again.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::Error;

type HmacSha256 = Hmac<Sha256>;

pub(crate) const COOKIE_LEN: usize = 32;

struct Secret {
    key: [u8; 32],
    created: Instant,
}

impl Secret {
    fn generate(now: Instant) -> Self {
        let mut key = [0u8; 32];
        rand::rng().fill(&mut key);
        Secret { key, created: now }
    }

    fn mac(&self, peer: SocketAddr) -> Result<HmacSha256, Error> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.key)
            .map_err(|_| Error::CryptoError("Invalid HMAC key".to_string()))?;
        mac.update(peer.to_string().as_bytes());
        Ok(mac)
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

pub(crate) struct CookieJar {
    lifetime: Duration,
    current: Secret,
    previous: Option<Secret>,
}

impl CookieJar {
    pub fn new(lifetime: Duration, now: Instant) -> Self {
        CookieJar {
            lifetime,
            current: Secret::generate(now),
            previous: None,
        }
    }

    fn rotate(&mut self, now: Instant) {
        if now.saturating_duration_since(self.current.created) < self.lifetime {
            return;
        }
        trace!("Rotate cookie secret");
        let previous = std::mem::replace(&mut self.current, Secret::generate(now));
        self.previous = Some(previous);
    }

    /// Cookie for `peer` under the current secret.
    pub fn generate(&mut self, peer: SocketAddr, now: Instant) -> Result<Vec<u8>, Error> {
        self.rotate(now);
        let tag = self.current.mac(peer)?.finalize().into_bytes();
        Ok(tag.to_vec())
    }

    /// Whether `cookie` was issued to `peer` by a secret still honoured.
    pub fn verify(&mut self, peer: SocketAddr, cookie: &[u8], now: Instant) -> bool {
        if cookie.len() != COOKIE_LEN {
            return false;
        }
        self.rotate(now);

        let valid = |secret: &Secret| {
            secret
                .mac(peer)
                .map(|mac| mac.verify_slice(cookie).is_ok())
                .unwrap_or(false)
        };

        if valid(&self.current) {
            return true;
        }

        match &self.previous {
            Some(previous)
                if now.saturating_duration_since(previous.created) < self.lifetime * 2 =>
            {
                valid(previous)
            }
            _ => false,
        }
    }
}

impl std::fmt::Debug for CookieJar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CookieJar")
            .field("lifetime", &self.lifetime)
            .field("has_previous", &self.previous.is_some())
            .finish()
    }
}
