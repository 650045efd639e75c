//! Best-server selection: given the phase-1 probe results from every
//! candidate replication server, pick the one to complete the handshake with.

use dirmesh_protocol::{Csn, ReplicaId, ServerState, ServerStatus};
use std::collections::BTreeMap;

/// Discovery record gathered from one candidate server during phase-1
/// probing; discarded once a server has been chosen.
#[derive(Debug, Clone)]
pub struct CandidateInfo {
    /// The candidate's server id.
    pub server_id: u32,
    /// The candidate's view of the domain state.
    pub server_state: ServerState,
    /// The candidate's group id.
    pub group_id: u8,
    /// The data generation the candidate holds.
    pub generation_id: Option<u64>,
    /// Send window the candidate grants.
    pub window_size: u32,
    /// Degraded-status threshold the candidate applies (0 disables).
    pub degraded_status_threshold: u64,
    /// Protocol version the candidate speaks.
    pub protocol_version: u8,
}

/// Picks the best replication server among the probed candidates.
///
/// Candidates sharing `group_id` are preferred; when none does, all are
/// considered. Within the considered set, servers that have seen at least
/// our own latest change ("up to date") win over late ones:
///
/// - among up-to-date servers, choose the one whose state has the smallest
///   worst-case lag behind the virtual topology state (the per-replica
///   maximum over all up-to-date candidates);
/// - otherwise choose the late server whose knowledge of our own changes is
///   closest to ours.
///
/// Candidates are evaluated in ascending address order and compared
/// strictly, so the result is deterministic for identical inputs.
pub fn select_best_server(
    my_state: &ServerState,
    candidates: &BTreeMap<String, CandidateInfo>,
    replica_id: ReplicaId,
    group_id: u8,
) -> Option<String> {
    if candidates.is_empty() {
        return None;
    }

    let same_group: BTreeMap<&String, &CandidateInfo> = candidates
        .iter()
        .filter(|(_, info)| info.group_id == group_id)
        .collect();
    if !same_group.is_empty() {
        search_best(my_state, &same_group, replica_id)
    } else {
        let all: BTreeMap<&String, &CandidateInfo> = candidates.iter().collect();
        search_best(my_state, &all, replica_id)
    }
}

fn search_best(
    my_state: &ServerState,
    candidates: &BTreeMap<&String, &CandidateInfo>,
    replica_id: ReplicaId,
) -> Option<String> {
    if candidates.len() == 1 {
        return candidates.keys().next().map(|addr| (*addr).clone());
    }

    let my_csn = my_state
        .max_csn(replica_id)
        .unwrap_or_else(|| Csn::new(0, 0, replica_id));

    let mut up_to_date: BTreeMap<&String, &ServerState> = BTreeMap::new();
    let mut late: BTreeMap<&String, &ServerState> = BTreeMap::new();
    for (addr, info) in candidates {
        let server_csn = info
            .server_state
            .max_csn(replica_id)
            .unwrap_or_else(|| Csn::new(0, 0, replica_id));
        if my_csn.older_or_equal(&server_csn) {
            up_to_date.insert(*addr, &info.server_state);
        } else {
            late.insert(*addr, &info.server_state);
        }
    }

    if !up_to_date.is_empty() {
        // Virtual topology state: the most recent CSN per replica across all
        // up-to-date candidates.
        let mut topo_state = ServerState::new();
        for state in up_to_date.values() {
            for (_, csn) in state.iter() {
                topo_state.update(*csn);
            }
        }

        // Keep the candidate whose worst per-replica time lag behind the
        // topology state is smallest. Comparison uses timestamps, not
        // sequence numbers, so a wrapping sequence cannot distort it.
        let mut best: Option<(&String, u64)> = None;
        for (addr, state) in &up_to_date {
            let mut worst_lag = 0u64;
            for (rid, topo_csn) in topo_state.iter() {
                let seen = state
                    .max_csn(rid)
                    .unwrap_or_else(|| Csn::new(0, 0, rid));
                worst_lag = worst_lag.max(topo_csn.time_ms.saturating_sub(seen.time_ms));
            }
            if best.map(|(_, lag)| worst_lag < lag).unwrap_or(true) {
                best = Some((*addr, worst_lag));
            }
        }
        best.map(|(addr, _)| (*addr).clone())
    } else {
        // No candidate has all our changes: pick the one whose knowledge of
        // our own replica is the closest to ours.
        let mut best: Option<(&String, u64)> = None;
        for (addr, state) in &late {
            let seen = state
                .max_csn(replica_id)
                .unwrap_or_else(|| Csn::new(0, 0, replica_id));
            let lag = my_csn.time_ms.saturating_sub(seen.time_ms);
            if best.map(|(_, l)| lag < l).unwrap_or(true) {
                best = Some((*addr, lag));
            }
        }
        best.map(|(addr, _)| (*addr).clone())
    }
}

/// Computes the status a session starts in, from the generation comparison
/// and the pending-change lag against the chosen server.
pub fn compute_initial_status(
    server_generation: Option<u64>,
    my_generation: Option<u64>,
    server_state: &ServerState,
    my_state: &ServerState,
    degraded_status_threshold: u64,
) -> ServerStatus {
    match server_generation {
        // A server without a generation accepts anyone.
        None => ServerStatus::Normal,
        Some(server_gen) => {
            if Some(server_gen) != my_generation {
                return ServerStatus::BadGenId;
            }
            if degraded_status_threshold == 0 {
                return ServerStatus::Normal;
            }
            let pending = ServerState::diff_changes(server_state, my_state);
            if pending >= degraded_status_threshold {
                ServerStatus::Degraded
            } else {
                ServerStatus::Normal
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(entries: &[(ReplicaId, u64, u32)]) -> ServerState {
        let mut s = ServerState::new();
        for (rid, time, seq) in entries {
            s.update(Csn::new(*time, *seq, *rid));
        }
        s
    }

    fn candidate(group_id: u8, server_state: ServerState) -> CandidateInfo {
        CandidateInfo {
            server_id: 0,
            server_state,
            group_id,
            generation_id: Some(1),
            window_size: 100,
            degraded_status_threshold: 0,
            protocol_version: 4,
        }
    }

    #[test]
    fn empty_candidate_set_yields_none() {
        let candidates = BTreeMap::new();
        assert_eq!(select_best_server(&ServerState::new(), &candidates, 1, 1), None);
    }

    #[test]
    fn single_candidate_wins_outright() {
        let mut candidates = BTreeMap::new();
        candidates.insert("rs1:8989".to_string(), candidate(9, ServerState::new()));
        assert_eq!(
            select_best_server(&state(&[(1, 100, 0)]), &candidates, 1, 1),
            Some("rs1:8989".to_string())
        );
    }

    #[test]
    fn same_group_servers_are_preferred() {
        let mut candidates = BTreeMap::new();
        // The other-group server is far more up to date, but locality wins.
        candidates.insert("rs1:8989".to_string(), candidate(2, state(&[(1, 500, 0)])));
        candidates.insert("rs2:8989".to_string(), candidate(1, state(&[(1, 100, 0)])));
        assert_eq!(
            select_best_server(&state(&[(1, 100, 0)]), &candidates, 1, 1),
            Some("rs2:8989".to_string())
        );
    }

    #[test]
    fn up_to_date_server_beats_late_one() {
        let my = state(&[(1, 100, 0)]);
        let mut candidates = BTreeMap::new();
        candidates.insert("late:1".to_string(), candidate(1, state(&[(1, 50, 0)])));
        candidates.insert("fresh:1".to_string(), candidate(1, state(&[(1, 100, 0)])));
        assert_eq!(
            select_best_server(&my, &candidates, 1, 1),
            Some("fresh:1".to_string())
        );
    }

    #[test]
    fn up_to_date_tie_broken_by_smallest_worst_case_lag() {
        let my = state(&[(1, 100, 0)]);
        // Both have our changes; rs-a lags replica 2 by 900ms, rs-b by 100ms.
        let mut candidates = BTreeMap::new();
        candidates.insert(
            "rs-a:1".to_string(),
            candidate(1, state(&[(1, 100, 0), (2, 100, 0)])),
        );
        candidates.insert(
            "rs-b:1".to_string(),
            candidate(1, state(&[(1, 100, 0), (2, 900, 0)])),
        );
        assert_eq!(
            select_best_server(&my, &candidates, 1, 1),
            Some("rs-b:1".to_string())
        );
    }

    #[test]
    fn all_late_picks_closest_knowledge_of_my_replica() {
        let my = state(&[(1, 1000, 0)]);
        let mut candidates = BTreeMap::new();
        candidates.insert("rs-a:1".to_string(), candidate(1, state(&[(1, 200, 0)])));
        candidates.insert("rs-b:1".to_string(), candidate(1, state(&[(1, 800, 0)])));
        assert_eq!(
            select_best_server(&my, &candidates, 1, 1),
            Some("rs-b:1".to_string())
        );
    }

    #[test]
    fn selection_is_deterministic() {
        let my = state(&[(1, 100, 0)]);
        let mut candidates = BTreeMap::new();
        // Identical states: the lexicographically first address must win,
        // every single time.
        for addr in ["rs-c:1", "rs-a:1", "rs-b:1"] {
            candidates.insert(addr.to_string(), candidate(1, state(&[(1, 100, 0)])));
        }
        let first = select_best_server(&my, &candidates, 1, 1);
        assert_eq!(first, Some("rs-a:1".to_string()));
        for _ in 0..20 {
            assert_eq!(select_best_server(&my, &candidates, 1, 1), first);
        }
    }

    #[test]
    fn empty_local_state_counts_as_up_to_date_everywhere() {
        let my = ServerState::new();
        let mut candidates = BTreeMap::new();
        candidates.insert("rs-a:1".to_string(), candidate(1, ServerState::new()));
        candidates.insert("rs-b:1".to_string(), candidate(1, state(&[(2, 50, 0)])));
        // Both cover our (empty) history; rs-a lags replica 2 by 50ms.
        assert_eq!(
            select_best_server(&my, &candidates, 1, 1),
            Some("rs-b:1".to_string())
        );
    }

    mod initial_status {
        use super::*;
        use ServerStatus::*;

        #[test]
        fn unknown_server_generation_is_normal() {
            assert_eq!(
                compute_initial_status(None, Some(5), &ServerState::new(), &ServerState::new(), 10),
                Normal
            );
        }

        #[test]
        fn generation_mismatch_is_bad_gen_id() {
            assert_eq!(
                compute_initial_status(
                    Some(5),
                    Some(6),
                    &ServerState::new(),
                    &ServerState::new(),
                    10
                ),
                BadGenId
            );
            assert_eq!(
                compute_initial_status(Some(5), None, &ServerState::new(), &ServerState::new(), 10),
                BadGenId
            );
        }

        #[test]
        fn lag_beyond_threshold_is_degraded() {
            let server = state(&[(2, 100, 9)]);
            let me = state(&[(2, 100, 1)]);
            assert_eq!(
                compute_initial_status(Some(5), Some(5), &server, &me, 8),
                Degraded
            );
            assert_eq!(
                compute_initial_status(Some(5), Some(5), &server, &me, 9),
                Normal
            );
        }

        #[test]
        fn zero_threshold_disables_degraded_detection() {
            let server = state(&[(2, 100, 500)]);
            let me = ServerState::new();
            assert_eq!(
                compute_initial_status(Some(5), Some(5), &server, &me, 0),
                Normal
            );
        }
    }
}
