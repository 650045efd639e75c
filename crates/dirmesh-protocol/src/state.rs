//! Per-replica server state: the vector of latest CSNs seen from every
//! replica of a domain.

use crate::csn::{Csn, ReplicaId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Maps every known replica to the most recent CSN seen from it.
///
/// This is the convergence anchor of the protocol: it is advanced on every
/// locally generated and every locally replayed change, exchanged during
/// handshakes, and compared to decide which peer is most up to date.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerState {
    changes: BTreeMap<ReplicaId, Csn>,
}

impl ServerState {
    /// Creates an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a change, keeping only the maximum CSN per replica.
    ///
    /// Returns true if the state advanced.
    pub fn update(&mut self, csn: Csn) -> bool {
        match self.changes.get(&csn.replica_id) {
            Some(existing) if *existing >= csn => false,
            _ => {
                self.changes.insert(csn.replica_id, csn);
                true
            }
        }
    }

    /// The latest CSN seen from the given replica, if any.
    pub fn max_csn(&self, replica_id: ReplicaId) -> Option<Csn> {
        self.changes.get(&replica_id).copied()
    }

    /// Returns true if this state has already seen `csn`.
    pub fn covers(&self, csn: &Csn) -> bool {
        self.max_csn(csn.replica_id)
            .map(|max| csn.older_or_equal(&max))
            .unwrap_or(false)
    }

    /// Iterates over `(replica, latest CSN)` pairs in replica-id order.
    pub fn iter(&self) -> impl Iterator<Item = (ReplicaId, &Csn)> {
        self.changes.iter().map(|(id, csn)| (*id, csn))
    }

    /// The replica ids present in this state, in ascending order.
    pub fn replica_ids(&self) -> impl Iterator<Item = ReplicaId> + '_ {
        self.changes.keys().copied()
    }

    /// Returns true if no change has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Estimates how many changes `newer` has seen that `older` has not.
    ///
    /// The estimate is based on sequence numbers within a millisecond and is
    /// only used to decide whether a replica is late enough to be degraded,
    /// never for correctness.
    pub fn diff_changes(newer: &ServerState, older: &ServerState) -> u64 {
        let mut diff = 0u64;
        for (replica_id, csn) in newer.iter() {
            match older.max_csn(replica_id) {
                None => diff += u64::from(csn.seq) + 1,
                Some(seen) if seen < *csn => {
                    if seen.time_ms == csn.time_ms {
                        diff += u64::from(csn.seq - seen.seq);
                    } else {
                        diff += u64::from(csn.seq) + 1;
                    }
                }
                Some(_) => {}
            }
        }
        diff
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (id, csn) in self.changes.iter() {
            if !first {
                write!(f, " ")?;
            }
            write!(f, "{id}:{csn}")?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_keeps_the_maximum() {
        let mut state = ServerState::new();
        assert!(state.update(Csn::new(10, 0, 1)));
        assert!(state.update(Csn::new(11, 0, 1)));
        assert!(!state.update(Csn::new(10, 5, 1)));
        assert_eq!(state.max_csn(1), Some(Csn::new(11, 0, 1)));
    }

    #[test]
    fn covers_checks_per_replica() {
        let mut state = ServerState::new();
        state.update(Csn::new(10, 2, 1));
        assert!(state.covers(&Csn::new(10, 2, 1)));
        assert!(state.covers(&Csn::new(9, 9, 1)));
        assert!(!state.covers(&Csn::new(10, 3, 1)));
        assert!(!state.covers(&Csn::new(1, 0, 2)));
    }

    #[test]
    fn diff_counts_missing_changes() {
        let mut newer = ServerState::new();
        newer.update(Csn::new(10, 4, 1));
        newer.update(Csn::new(20, 0, 2));

        let mut older = ServerState::new();
        older.update(Csn::new(10, 1, 1));

        // 3 changes behind on replica 1 (same millisecond), plus one unseen
        // replica-2 change.
        assert_eq!(ServerState::diff_changes(&newer, &older), 4);
        assert_eq!(ServerState::diff_changes(&older, &newer), 0);
    }

    #[test]
    fn iteration_order_is_deterministic() {
        let mut state = ServerState::new();
        state.update(Csn::new(1, 0, 30));
        state.update(Csn::new(1, 0, 10));
        state.update(Csn::new(1, 0, 20));
        let ids: Vec<_> = state.replica_ids().collect();
        assert_eq!(ids, vec![10, 20, 30]);
    }
}
