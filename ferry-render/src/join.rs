use std::sync::atomic::{AtomicU32, Ordering};

/// Barrier for a fixed number of parties.
///
/// Exactly one of the arrivals, the last one, observes completion.
pub struct Join {
    parties: u32,
    arrived: AtomicU32,
}

impl Join {
    pub const fn new(parties: u32) -> Self {
        Self {
            parties,
            arrived: AtomicU32::new(0),
        }
    }

    /// Register an arrival. Returns `true` for the last one.
    pub fn arrive(&self) -> bool {
        let previous = self.arrived.fetch_add(1, Ordering::AcqRel);
        debug_assert!(previous < self.parties, "too many arrivals");
        previous + 1 == self.parties
    }

    pub fn arrived(&self) -> u32 {
        self.arrived.load(Ordering::Acquire)
    }

    pub fn is_done(&self) -> bool {
        self.arrived.load(Ordering::Acquire) >= self.parties
    }
}
