//! The shard distribution algorithm (spec §4.9.2).
//!
//! Deterministic given `(peers, shards, replicas)` in order: for each shard,
//! among peers that do not already hold it, repeatedly take the peer with
//! the fewest assignments so far (ties broken by the peers' original
//! order, since the sort below is stable) until `replicas` copies exist or
//! no eligible peer remains.

use std::collections::BTreeMap;

/// Compute a balanced peer -> shards assignment.
///
/// - No peer's list contains a shard twice (P1a).
/// - Every peer's list is a subset of `shards` (P1b).
/// - Every shard is held by exactly `min(replicas, peers.len())` peers,
///   since every shard starts with the full peer set eligible (P1c).
/// - List lengths differ by at most one when `replicas * shards.len()` is
///   evenly divisible by `peers.len()` (P1d), because each shard's
///   assignment always prefers the currently least-loaded peers.
pub fn distribute(
    peers: &[String],
    shards: &[String],
    replicas: usize,
) -> BTreeMap<String, Vec<String>> {
    let mut assignment: BTreeMap<String, Vec<String>> =
        peers.iter().map(|p| (p.clone(), Vec::new())).collect();

    if peers.is_empty() {
        return assignment;
    }

    for shard in shards {
        let mut eligible: Vec<&String> = peers
            .iter()
            .filter(|p| !assignment[p.as_str()].contains(shard))
            .collect();
        // Stable sort: peers with equal current load keep their relative
        // position from `peers`, which is how the algorithm preserves
        // insertion order across rebalances (spec §4.9.2).
        eligible.sort_by_key(|p| assignment[p.as_str()].len());

        let take = replicas.min(eligible.len());
        for peer in eligible.into_iter().take(take) {
            assignment.get_mut(peer.as_str()).unwrap().push(shard.clone());
        }
    }

    assignment
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn shards(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn no_peer_holds_a_shard_twice() {
        let assignment = distribute(&peers(&["a", "b"]), &shards(&["s1", "s2", "s3"]), 2);
        for list in assignment.values() {
            let mut sorted = list.clone();
            sorted.sort();
            sorted.dedup();
            assert_eq!(sorted.len(), list.len());
        }
    }

    #[test]
    fn every_assigned_shard_is_a_known_shard() {
        let all_shards = shards(&["s1", "s2", "s3", "s4"]);
        let assignment = distribute(&peers(&["a", "b", "c"]), &all_shards, 2);
        for list in assignment.values() {
            for s in list {
                assert!(all_shards.contains(s));
            }
        }
    }

    #[test]
    fn every_shard_held_by_min_replicas_peers_exactly() {
        let all_peers = peers(&["a", "b"]);
        let all_shards = shards(&["a", "b", "c", "d"]);
        let replicas = 2;
        let assignment = distribute(&all_peers, &all_shards, replicas);
        for shard in &all_shards {
            let holders = assignment
                .values()
                .filter(|list| list.contains(shard))
                .count();
            assert_eq!(holders, replicas.min(all_peers.len()));
        }
    }

    #[test]
    fn total_assignment_count_matches_replicas_times_shards() {
        let all_peers = peers(&["a", "b", "c"]);
        let all_shards = shards(&["a", "b", "c", "d"]);
        let assignment = distribute(&all_peers, &all_shards, 2);
        let total: usize = assignment.values().map(|v| v.len()).sum();
        assert_eq!(total, 2 * all_shards.len());
    }

    #[test]
    fn evenly_divisible_load_differs_by_at_most_one() {
        // 2 replicas * 4 shards = 8 assignments over 2 peers -> 4 each.
        let assignment = distribute(&peers(&["a", "b"]), &shards(&["a", "b", "c", "d"]), 2);
        let lengths: Vec<usize> = assignment.values().map(|v| v.len()).collect();
        let min = *lengths.iter().min().unwrap();
        let max = *lengths.iter().max().unwrap();
        assert!(max - min <= 1);
    }

    #[test]
    fn rebalance_on_join_spreads_load_near_evenly() {
        // Scenario 2: A,B steady state over 4 shards, replicas=2 (4 each).
        // After C joins, 2*4=8 total assignments spread across A,B,C.
        let before = distribute(&peers(&["a", "b"]), &shards(&["a", "b", "c", "d"]), 2);
        let before_total: usize = before.values().map(|v| v.len()).sum();
        assert_eq!(before_total, 8);

        let after = distribute(&peers(&["a", "b", "c"]), &shards(&["a", "b", "c", "d"]), 2);
        let after_total: usize = after.values().map(|v| v.len()).sum();
        assert_eq!(after_total, 8);

        let lengths: Vec<usize> = after.values().map(|v| v.len()).collect();
        let min = *lengths.iter().min().unwrap();
        let max = *lengths.iter().max().unwrap();
        assert!(max - min <= 1, "load should spread near-evenly across 3 peers");
    }

    #[test]
    fn empty_peer_set_yields_empty_assignment() {
        let assignment = distribute(&[], &shards(&["a"]), 2);
        assert!(assignment.is_empty());
    }

    #[test]
    fn replicas_capped_by_peer_count() {
        let assignment = distribute(&peers(&["a"]), &shards(&["a", "b"]), 5);
        assert_eq!(assignment["a"].len(), 2);
    }
}
