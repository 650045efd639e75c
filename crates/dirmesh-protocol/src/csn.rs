//! Change sequence numbers: the per-replica logical clock ordering every
//! change published into a replication domain.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Unique identifier of a replica (directory server) within a domain.
pub type ReplicaId = u32;

/// A change sequence number: a (timestamp, sequence, replica) triple totally
/// ordering changes across all replicas of a domain.
///
/// Two CSNs generated by different replicas in the same millisecond are
/// ordered by sequence number, then by replica id, so the order is total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Csn {
    /// Milliseconds since the Unix epoch at generation time.
    pub time_ms: u64,
    /// Sequence number distinguishing changes generated in the same millisecond.
    pub seq: u32,
    /// The replica that generated the change.
    pub replica_id: ReplicaId,
}

impl Csn {
    /// Creates a new CSN from its components.
    pub fn new(time_ms: u64, seq: u32, replica_id: ReplicaId) -> Self {
        Self {
            time_ms,
            seq,
            replica_id,
        }
    }

    /// Returns true if `self` happened before or at the same point as `other`.
    pub fn older_or_equal(&self, other: &Csn) -> bool {
        self <= other
    }
}

impl fmt::Display for Csn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}{:08x}{:08x}", self.time_ms, self.seq, self.replica_id)
    }
}

/// Generates strictly increasing CSNs for one replica.
///
/// The generator never goes backwards: observing a peer CSN through
/// [`CsnGenerator::adjust`] raises the floor so that the next generated CSN
/// sorts after everything seen so far, even across replicas with skewed
/// clocks.
#[derive(Debug)]
pub struct CsnGenerator {
    replica_id: ReplicaId,
    /// Timestamp of the most recently issued or observed CSN.
    time_ms: u64,
    /// Sequence of the most recently issued or observed CSN.
    seq: u32,
}

impl CsnGenerator {
    /// Creates a generator for the given replica starting from the wall clock.
    pub fn new(replica_id: ReplicaId) -> Self {
        Self {
            replica_id,
            time_ms: 0,
            seq: 0,
        }
    }

    /// Creates a generator seeded from a server state, so that the first
    /// generated CSN sorts after every change already recorded.
    pub fn from_state(replica_id: ReplicaId, state: &crate::state::ServerState) -> Self {
        let mut gen = Self::new(replica_id);
        for (_, csn) in state.iter() {
            gen.adjust(csn);
        }
        gen
    }

    /// The replica this generator produces CSNs for.
    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    /// Produces the next CSN, strictly greater than any previously produced
    /// or observed one.
    pub fn next_csn(&mut self) -> Csn {
        let now = now_ms();
        if now > self.time_ms {
            self.time_ms = now;
            self.seq = 0;
        } else if self.seq == u32::MAX {
            // Sequence exhausted within one millisecond: borrow from time.
            self.time_ms += 1;
            self.seq = 0;
        } else {
            self.seq += 1;
        }
        Csn::new(self.time_ms, self.seq, self.replica_id)
    }

    /// Raises the generator floor so the next CSN sorts after `observed`.
    ///
    /// Called whenever a peer change is replayed locally; without it, a
    /// replica with a slow clock could generate CSNs colliding with (or
    /// ordered before) changes it has already seen.
    pub fn adjust(&mut self, observed: &Csn) {
        if observed.time_ms > self.time_ms
            || (observed.time_ms == self.time_ms && observed.seq > self.seq)
        {
            self.time_ms = observed.time_ms;
            self.seq = observed.seq;
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn ordering_is_time_then_seq_then_replica() {
        let a = Csn::new(1, 0, 5);
        let b = Csn::new(2, 0, 1);
        let c = Csn::new(2, 1, 1);
        let d = Csn::new(2, 1, 2);
        assert!(a < b);
        assert!(b < c);
        assert!(c < d);
        assert!(a.older_or_equal(&a));
        assert!(a.older_or_equal(&d));
        assert!(!d.older_or_equal(&a));
    }

    #[test]
    fn generator_is_strictly_monotonic() {
        let mut gen = CsnGenerator::new(7);
        let mut prev = gen.next_csn();
        for _ in 0..10_000 {
            let next = gen.next_csn();
            assert!(prev < next, "{prev} !< {next}");
            prev = next;
        }
    }

    #[test]
    fn adjust_raises_the_floor() {
        let mut gen = CsnGenerator::new(1);
        // A peer far in the future (e.g. clock skew).
        let future = Csn::new(u64::MAX / 2, 42, 9);
        gen.adjust(&future);
        let next = gen.next_csn();
        assert!(future < next);
        assert_eq!(next.replica_id, 1);
    }

    #[test]
    fn adjust_with_older_csn_is_a_noop() {
        let mut gen = CsnGenerator::new(1);
        let first = gen.next_csn();
        gen.adjust(&Csn::new(0, 0, 3));
        let second = gen.next_csn();
        assert!(first < second);
    }

    #[test]
    fn from_state_seeds_past_recorded_changes() {
        let mut state = crate::state::ServerState::new();
        state.update(Csn::new(u64::MAX / 4, 3, 2));
        state.update(Csn::new(u64::MAX / 2, 9, 3));
        let mut gen = CsnGenerator::from_state(1, &state);
        let next = gen.next_csn();
        assert!(Csn::new(u64::MAX / 2, 9, 3) < next);
    }

    proptest! {
        #[test]
        fn display_roundtrips_ordering(
            t1 in 0u64..1u64 << 48, s1 in 0u32..1024, r1 in 0u32..64,
            t2 in 0u64..1u64 << 48, s2 in 0u32..1024, r2 in 0u32..64,
        ) {
            let a = Csn::new(t1, s1, r1);
            let b = Csn::new(t2, s2, r2);
            // The fixed-width hex rendering preserves the CSN order.
            prop_assert_eq!(a.cmp(&b), a.to_string().cmp(&b.to_string()));
        }

        #[test]
        fn adjust_never_lowers_next_output(
            t in 0u64..1u64 << 48, s in 0u32..1024,
        ) {
            let mut gen = CsnGenerator::new(1);
            let observed = Csn::new(t, s, 2);
            gen.adjust(&observed);
            prop_assert!(observed < gen.next_csn());
        }
    }
}
