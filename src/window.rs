/// Sliding anti-replay window over record sequence numbers.
///
/// Tracks the highest authenticated sequence number and a 64-bit bitmap of
/// the ones below it. Checking and recording are split so a record only
/// enters the window once it has authenticated; a forged record must never
/// be able to shift the window.
#[derive(Debug, Default)]
pub(crate) struct ReplayWindow {
    highest: Option<u64>,
    seen: u64,
}

const WINDOW_SIZE: u64 = 64;

impl ReplayWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `seqno` is neither a duplicate nor too old.
    pub fn is_fresh(&self, seqno: u64) -> bool {
        let Some(highest) = self.highest else {
            return true;
        };
        if seqno > highest {
            return true;
        }
        let offset = highest - seqno;
        offset < WINDOW_SIZE && self.seen & (1 << offset) == 0
    }

    /// Record an authenticated `seqno`. Call only after [`Self::is_fresh`].
    pub fn mark(&mut self, seqno: u64) {
        match self.highest {
            Some(highest) if seqno <= highest => {
                let offset = highest - seqno;
                if offset < WINDOW_SIZE {
                    self.seen |= 1 << offset;
                }
            }
            Some(highest) => {
                let shift = seqno - highest;
                self.seen = if shift >= WINDOW_SIZE {
                    0
                } else {
                    self.seen << shift
                };
                self.seen |= 1;
                self.highest = Some(seqno);
            }
            None => {
                self.seen = 1;
                self.highest = Some(seqno);
            }
        }
    }
}
