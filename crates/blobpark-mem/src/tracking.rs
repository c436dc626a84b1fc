//! Lightweight current/peak byte tracking.
//!
//! Keep this cheap; it sits on the allocator's reserve/discard path.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct FootprintTracker {
    current: AtomicU64,
    peak: AtomicU64,
}

impl FootprintTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account `bytes` more; updates peak if higher.
    pub fn add(&self, bytes: u64) {
        let used = self.current.fetch_add(bytes, Ordering::AcqRel) + bytes;
        let mut cur = self.peak.load(Ordering::Relaxed);
        while used > cur {
            match self
                .peak
                .compare_exchange(cur, used, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(observed) => cur = observed,
            }
        }
        #[cfg(feature = "tracing")]
        tracing::trace!(used, peak = self.peak.load(Ordering::Relaxed), "footprint grew");
    }

    pub fn sub(&self, bytes: u64) {
        self.current.fetch_sub(bytes, Ordering::AcqRel);
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn peak(&self) -> u64 {
        self.peak.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peak_survives_release() {
        let t = FootprintTracker::new();
        t.add(100);
        t.add(50);
        t.sub(120);
        assert_eq!(t.current(), 30);
        assert_eq!(t.peak(), 150);
        t.add(10);
        assert_eq!(t.peak(), 150);
    }
}
