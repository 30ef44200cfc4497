use std::time::Duration;

use crate::certificate::Verification;
use crate::session::{AEAD_OVERHEAD, RECORD_HEADER_LEN};
use crate::Error;

/// Multiplexer configuration
#[derive(Debug, Clone)]
pub struct Config {
    mtu: usize,
    max_queue_rx: usize,
    max_queue_tx: usize,
    flight_start_rto: Duration,
    flight_retries: usize,
    handshake_timeout: Duration,
    idle_timeout: Option<Duration>,
    accept_new_peers: bool,
    cookie_exchange: bool,
    cookie_lifetime: Duration,
    max_endpoints: usize,
    max_endpoints_per_ip: usize,
    require_client_certificate: bool,
    verification: Verification,
    rng_seed: Option<u64>,
}

impl Config {
    /// Create a new configuration builder.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder {
            mtu: 1150,
            max_queue_rx: 30,
            max_queue_tx: 10,
            flight_start_rto: Duration::from_secs(1),
            flight_retries: 4,
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: None,
            accept_new_peers: true,
            cookie_exchange: true,
            cookie_lifetime: Duration::from_secs(30),
            max_endpoints: 1024,
            max_endpoints_per_ip: 16,
            require_client_certificate: false,
            verification: Verification::AcceptAny,
            rng_seed: None,
        }
    }

    /// Max transmission unit.
    ///
    /// The largest size UDP packets we will produce.
    #[inline(always)]
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Largest application payload that fits one protected datagram.
    #[inline(always)]
    pub fn max_payload(&self) -> usize {
        self.mtu - RECORD_HEADER_LEN - AEAD_OVERHEAD
    }

    /// Max amount of out-of-order handshake messages buffered per session.
    #[inline(always)]
    pub fn max_queue_rx(&self) -> usize {
        self.max_queue_rx
    }

    /// Max amount of outgoing datagrams queued per endpoint.
    #[inline(always)]
    pub fn max_queue_tx(&self) -> usize {
        self.max_queue_tx
    }

    /// Time of first flight retransmission.
    ///
    /// Every flight restarts with this value.
    /// Doubled for every retry with a ±25% jitter.
    #[inline(always)]
    pub fn flight_start_rto(&self) -> Duration {
        self.flight_start_rto
    }

    /// Max number of retries per flight.
    #[inline(always)]
    pub fn flight_retries(&self) -> usize {
        self.flight_retries
    }

    /// Time a handshake may go without progress before the registry evicts it.
    #[inline(always)]
    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    /// Time an established endpoint may go without inbound traffic.
    ///
    /// `None` keeps established endpoints until closed.
    #[inline(always)]
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    /// Whether datagrams from unknown addresses may create endpoints.
    #[inline(always)]
    pub fn accept_new_peers(&self) -> bool {
        self.accept_new_peers
    }

    /// Whether unknown peers must echo a stateless cookie before an
    /// endpoint is created for them.
    #[inline(always)]
    pub fn cookie_exchange(&self) -> bool {
        self.cookie_exchange
    }

    /// Lifetime of a cookie secret before it rotates.
    #[inline(always)]
    pub fn cookie_lifetime(&self) -> Duration {
        self.cookie_lifetime
    }

    /// Max number of endpoints held by a registry.
    #[inline(always)]
    pub fn max_endpoints(&self) -> usize {
        self.max_endpoints
    }

    /// Max number of endpoints sharing one IP address.
    #[inline(always)]
    pub fn max_endpoints_per_ip(&self) -> usize {
        self.max_endpoints_per_ip
    }

    /// For a server, require a client certificate.
    #[inline(always)]
    pub fn require_client_certificate(&self) -> bool {
        self.require_client_certificate
    }

    /// How peer certificates are checked.
    #[inline(always)]
    pub fn verification(&self) -> &Verification {
        &self.verification
    }

    /// Seed for non-cryptographic randomness (retransmit jitter).
    #[inline(always)]
    pub fn rng_seed(&self) -> Option<u64> {
        self.rng_seed
    }
}

/// Builder for multiplexer configuration.
pub struct ConfigBuilder {
    mtu: usize,
    max_queue_rx: usize,
    max_queue_tx: usize,
    flight_start_rto: Duration,
    flight_retries: usize,
    handshake_timeout: Duration,
    idle_timeout: Option<Duration>,
    accept_new_peers: bool,
    cookie_exchange: bool,
    cookie_lifetime: Duration,
    max_endpoints: usize,
    max_endpoints_per_ip: usize,
    require_client_certificate: bool,
    verification: Verification,
    rng_seed: Option<u64>,
}

impl ConfigBuilder {
    /// Set the max transmission unit (MTU).
    ///
    /// Defaults to 1150.
    pub fn mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    /// Set the max amount of buffered out-of-order handshake messages.
    ///
    /// Defaults to 30.
    pub fn max_queue_rx(mut self, max_queue_rx: usize) -> Self {
        self.max_queue_rx = max_queue_rx;
        self
    }

    /// Set the max amount of outgoing datagrams to queue per endpoint.
    ///
    /// Defaults to 10.
    pub fn max_queue_tx(mut self, max_queue_tx: usize) -> Self {
        self.max_queue_tx = max_queue_tx;
        self
    }

    /// Set the time of first flight retransmission.
    ///
    /// Defaults to 1 second.
    pub fn flight_start_rto(mut self, rto: Duration) -> Self {
        self.flight_start_rto = rto;
        self
    }

    /// Set the max number of retries per flight.
    ///
    /// Defaults to 4.
    pub fn flight_retries(mut self, retries: usize) -> Self {
        self.flight_retries = retries;
        self
    }

    /// Set the time a handshake may stall before eviction.
    ///
    /// Defaults to 10 seconds.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the idle timeout for established endpoints.
    ///
    /// Defaults to `None` (never).
    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set whether unknown peers may open new endpoints.
    ///
    /// Defaults to true.
    pub fn accept_new_peers(mut self, accept: bool) -> Self {
        self.accept_new_peers = accept;
        self
    }

    /// Set whether unknown peers must complete a cookie exchange first.
    ///
    /// Defaults to true.
    pub fn cookie_exchange(mut self, enabled: bool) -> Self {
        self.cookie_exchange = enabled;
        self
    }

    /// Set the cookie secret lifetime.
    ///
    /// Defaults to 30 seconds.
    pub fn cookie_lifetime(mut self, lifetime: Duration) -> Self {
        self.cookie_lifetime = lifetime;
        self
    }

    /// Set the max number of endpoints per registry.
    ///
    /// Defaults to 1024.
    pub fn max_endpoints(mut self, max: usize) -> Self {
        self.max_endpoints = max;
        self
    }

    /// Set the max number of endpoints per IP address.
    ///
    /// Defaults to 16.
    pub fn max_endpoints_per_ip(mut self, max: usize) -> Self {
        self.max_endpoints_per_ip = max;
        self
    }

    /// Set whether to require a client certificate (for servers).
    ///
    /// Defaults to false.
    pub fn require_client_certificate(mut self, require: bool) -> Self {
        self.require_client_certificate = require;
        self
    }

    /// Set how peer certificates are verified.
    ///
    /// Defaults to [`Verification::AcceptAny`].
    pub fn verification(mut self, verification: Verification) -> Self {
        self.verification = verification;
        self
    }

    /// Seed the non-cryptographic RNG for deterministic tests.
    pub fn rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    /// Build the configuration.
    ///
    /// Returns `Error::ConfigError` for values the transport cannot work with.
    pub fn build(self) -> Result<Config, Error> {
        // A ServerKeyExchange plus its record header must fit one datagram.
        if self.mtu < 256 {
            return Err(Error::ConfigError(format!("mtu too small: {}", self.mtu)));
        }
        if self.mtu > 16_384 {
            return Err(Error::ConfigError(format!("mtu too big: {}", self.mtu)));
        }
        if self.max_queue_tx == 0 {
            return Err(Error::ConfigError("max_queue_tx must be > 0".into()));
        }
        if self.max_endpoints == 0 || self.max_endpoints_per_ip == 0 {
            return Err(Error::ConfigError("endpoint limits must be > 0".into()));
        }
        if self.flight_start_rto.is_zero() || self.handshake_timeout.is_zero() {
            return Err(Error::ConfigError("timeouts must be > 0".into()));
        }

        Ok(Config {
            mtu: self.mtu,
            max_queue_rx: self.max_queue_rx,
            max_queue_tx: self.max_queue_tx,
            flight_start_rto: self.flight_start_rto,
            flight_retries: self.flight_retries,
            handshake_timeout: self.handshake_timeout,
            idle_timeout: self.idle_timeout,
            accept_new_peers: self.accept_new_peers,
            cookie_exchange: self.cookie_exchange,
            cookie_lifetime: self.cookie_lifetime,
            max_endpoints: self.max_endpoints,
            max_endpoints_per_ip: self.max_endpoints_per_ip,
            require_client_certificate: self.require_client_certificate,
            verification: self.verification,
            rng_seed: self.rng_seed,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::builder()
            .build()
            .expect("Default config should always validate")
    }
}
