//! Seedable random source for retransmission jitter.
//!
//! Key material never comes from here. With [`Config::rng_seed`] set, the
//! retransmission schedule of every session becomes reproducible, which the
//! timer tests rely on.
//!
//! [`Config::rng_seed`]: crate::Config::rng_seed

use rand::distr::{Distribution, StandardUniform};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub(crate) enum SeededRng {
    Seeded(StdRng),
    Thread,
}

impl SeededRng {
    pub fn new(seed: Option<u64>) -> Self {
        match seed {
            Some(seed) => SeededRng::Seeded(StdRng::seed_from_u64(seed)),
            None => SeededRng::Thread,
        }
    }

    pub fn random<T>(&mut self) -> T
    where
        StandardUniform: Distribution<T>,
    {
        match self {
            SeededRng::Seeded(rng) => rng.random(),
            SeededRng::Thread => rand::random(),
        }
    }
}

impl std::fmt::Debug for SeededRng {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let seeded = matches!(self, SeededRng::Seeded(_));
        f.debug_struct("SeededRng").field("seeded", &seeded).finish()
    }
}
