//! Peer identity and the shard-name sequence generator.

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Length of a peer id, per spec §3: "Each process picks a random
/// 24-character alphanumeric identifier."
const PEER_ID_LEN: usize = 24;

/// Generate a random 24-character alphanumeric peer id. Unique with
/// overwhelming probability across the lifetime of a cluster (spec §3).
///
/// The source system names this format "nanoid"; no crate in this
/// workspace's dependency stack provides that generator, and `rand` is
/// already depended on elsewhere, so the same alphanumeric-alphabet,
/// fixed-length guarantee is produced directly from it.
pub fn peer_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PEER_ID_LEN)
        .map(char::from)
        .collect()
}

/// Minimal width `w` such that `26^w >= n` (width is 1 for `n == 0`, since
/// an empty sequence still needs a defined width for callers that probe
/// it before checking length).
fn width_for(n: usize) -> usize {
    if n <= 26 {
        return 1;
    }
    let mut width = 1usize;
    let mut capacity = 26u64;
    while capacity < n as u64 {
        width += 1;
        capacity *= 26;
    }
    width
}

fn to_base26(mut index: u64, width: usize) -> String {
    let mut digits = vec![0u8; width];
    for pos in (0..width).rev() {
        digits[pos] = (index % 26) as u8;
        index /= 26;
    }
    digits.iter().map(|&d| (b'a' + d) as char).collect()
}

/// Returns `n` distinct, equal-length, ascending alphabetic shard names:
/// zero-padded base-26 strings over `a..z`, wide enough to hold `n` of
/// them. `shard_sequence(0) == []`; `shard_sequence(12)` is the default
/// shard set `a..l` (spec §3).
pub fn shard_sequence(n: usize) -> Vec<String> {
    let width = width_for(n);
    (0..n as u64).map(|i| to_base26(i, width)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn peer_id_is_24_alphanumeric_chars() {
        let id = peer_id();
        assert_eq!(id.len(), 24);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn peer_ids_are_distinct() {
        let a = peer_id();
        let b = peer_id();
        assert_ne!(a, b);
    }

    #[test]
    fn sequence_zero_is_empty() {
        assert!(shard_sequence(0).is_empty());
    }

    #[test]
    fn sequence_twelve_is_a_through_l() {
        let seq = shard_sequence(12);
        assert_eq!(
            seq,
            vec!["a", "b", "c", "d", "e", "f", "g", "h", "i", "j", "k", "l"]
        );
    }

    #[test]
    fn sequence_is_distinct_equal_length_and_ascending() {
        let seq = shard_sequence(27);
        assert_eq!(seq.len(), 27);
        let lengths: HashSet<usize> = seq.iter().map(|s| s.len()).collect();
        assert_eq!(lengths.len(), 1, "all shard names must share one width");
        let mut sorted = seq.clone();
        sorted.sort();
        assert_eq!(seq, sorted, "sequence must already be ascending");
        let distinct: HashSet<&String> = seq.iter().collect();
        assert_eq!(distinct.len(), 27);
    }

    #[test]
    fn sequence_27_ends_with_ba() {
        let seq = shard_sequence(27);
        assert_eq!(seq[26], "ba");
    }
}
