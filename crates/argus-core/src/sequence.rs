//! Receiver-side sequence tracking.
//!
//! Sequence numbers are strictly increasing per session. A gap means the
//! sender dropped telemetry under backpressure; it is a signal, not a fault,
//! so the tracker records it and keeps accepting later messages.

/// Outcome of observing one sequence number.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeqObservation {
    /// First message, or exactly one past the previous.
    InOrder,
    /// Messages were skipped; `missing` is how many.
    Gap {
        /// Number of sequence numbers skipped.
        missing: u64,
    },
    /// Not greater than the last observed value (duplicate or reordered).
    Stale,
}

/// Tracks the last sequence number seen on one session.
#[derive(Clone, Debug, Default)]
pub struct SequenceTracker {
    last: Option<u64>,
    gaps: u64,
    missing: u64,
    stale: u64,
}

impl SequenceTracker {
    /// Fresh tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `seq` and classify it.
    pub fn observe(&mut self, seq: u64) -> SeqObservation {
        let observation = match self.last {
            None => SeqObservation::InOrder,
            Some(last) if seq <= last => SeqObservation::Stale,
            Some(last) if seq == last + 1 => SeqObservation::InOrder,
            Some(last) => SeqObservation::Gap {
                missing: seq - last - 1,
            },
        };
        match observation {
            SeqObservation::Stale => self.stale += 1,
            SeqObservation::Gap { missing } => {
                self.gaps += 1;
                self.missing += missing;
                self.last = Some(seq);
            }
            SeqObservation::InOrder => self.last = Some(seq),
        }
        observation
    }

    /// Highest sequence number accepted so far.
    pub fn last(&self) -> Option<u64> {
        self.last
    }

    /// Number of gaps observed.
    pub fn gaps(&self) -> u64 {
        self.gaps
    }

    /// Total sequence numbers skipped across all gaps.
    pub fn missing(&self) -> u64 {
        self.missing
    }

    /// Number of stale (duplicate or out-of-order) observations.
    pub fn stale(&self) -> u64 {
        self.stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contiguous_sequence_is_in_order() {
        let mut t = SequenceTracker::new();
        for seq in 1..=5 {
            assert_eq!(t.observe(seq), SeqObservation::InOrder);
        }
        assert_eq!(t.last(), Some(5));
        assert_eq!(t.gaps(), 0);
    }

    #[test]
    fn gap_is_reported_and_processing_continues() {
        let mut t = SequenceTracker::new();
        let _ = t.observe(1);
        let _ = t.observe(2);
        assert_eq!(t.observe(6), SeqObservation::Gap { missing: 3 });
        assert_eq!(t.observe(7), SeqObservation::InOrder);
        assert_eq!(t.observe(9), SeqObservation::Gap { missing: 1 });
        assert_eq!(t.observe(10), SeqObservation::InOrder);
        assert_eq!(t.gaps(), 2);
        assert_eq!(t.missing(), 4);
        assert_eq!(t.last(), Some(10));
    }

    #[test]
    fn duplicates_are_stale_and_do_not_rewind() {
        let mut t = SequenceTracker::new();
        let _ = t.observe(4);
        assert_eq!(t.observe(4), SeqObservation::Stale);
        assert_eq!(t.observe(2), SeqObservation::Stale);
        assert_eq!(t.last(), Some(4));
        assert_eq!(t.stale(), 2);
        assert_eq!(t.observe(5), SeqObservation::InOrder);
    }

    #[test]
    fn first_observation_is_always_in_order() {
        let mut t = SequenceTracker::new();
        assert_eq!(t.observe(100), SeqObservation::InOrder);
    }
}
