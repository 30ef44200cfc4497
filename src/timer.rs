use std::time::{Duration, Instant};

use crate::rng::SeededRng;

// In seconds.
const JITTER_RANGE: f32 = 0.5;

/// Never go below this retransmit interval, regardless of jitter.
const MIN_RTO: Duration = Duration::from_millis(50);

/// Exponential backoff for flight retransmission.
#[derive(Debug)]
pub(crate) struct ExponentialBackoff {
    start_rto: Duration,
    retries: usize,
    rto: Duration,
    jitter: f32,
    left: usize,
    deadline: Option<Instant>,
}

impl ExponentialBackoff {
    pub fn new(start_rto: Duration, retries: usize, rng: &mut SeededRng) -> Self {
        Self {
            start_rto,
            retries,
            rto: start_rto,
            jitter: Self::jitter(rng),
            left: retries,
            deadline: None,
        }
    }

    /// Start over for a new flight and arm the timer from `now`.
    pub fn arm(&mut self, now: Instant, rng: &mut SeededRng) {
        self.rto = self.start_rto;
        self.jitter = Self::jitter(rng);
        self.left = self.retries;
        self.deadline = Some(now + self.rto());
    }

    /// Stop retransmitting altogether.
    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether the deadline passed and a resend is due.
    ///
    /// On `true` the interval doubles and the timer is re-armed. When the
    /// retries are spent the timer disarms and `false` is returned.
    pub fn fire(&mut self, now: Instant, rng: &mut SeededRng) -> bool {
        let Some(deadline) = self.deadline else {
            return false;
        };
        if now < deadline {
            return false;
        }
        if self.left == 0 {
            debug!("Flight retries exhausted");
            self.deadline = None;
            return false;
        }
        self.left -= 1;
        self.jitter = Self::jitter(rng);
        self.rto *= 2;
        self.deadline = Some(now + self.rto());
        true
    }

    pub fn rto(&self) -> Duration {
        if self.jitter < 0.0 {
            let duration = Duration::from_secs_f32(self.jitter.abs());
            self.rto.saturating_sub(duration)
        } else {
            self.rto + Duration::from_secs_f32(self.jitter)
        }
        .max(MIN_RTO)
    }

    // A value between -0.25s and 0.25s
    fn jitter(rng: &mut SeededRng) -> f32 {
        rng.random::<f32>() * JITTER_RANGE - (JITTER_RANGE / 2.0)
    }
}
