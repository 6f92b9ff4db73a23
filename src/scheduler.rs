//! Piece Scheduler: a pure function with no I/O and no locking, so its
//! load-balancing behavior is unit-testable directly without a network
//! fixture.
//!
//! Grounded line-for-line on `original_source/node1/node.py`'s
//! `NodeUtils.get_request_queue`/`create_request_queue`: the least-loaded
//! pick below breaks ties by each peer's *remaining* availability count, not
//! by the length of the queue built so far.

use std::collections::HashSet;

use crate::piece::piece_filename;

/// Identifies a peer by the address its upload (piece-serving) port is
/// reachable at, rather than its control-connection address.
pub type PeerKey = (String, u16);

/// Produces a disjoint per-peer download queue for one file.
///
/// `availability` is an insertion-ordered list of `(peer, piece_ids)` pairs —
/// a `Vec` rather than a map, since scheduling is stable with respect to
/// that order. Callers with a `HashMap`-backed availability map must impose
/// a deterministic order (e.g. sort by peer key) before calling this
/// function.
///
/// `held` is the set of piece-ids already present locally; those are removed
/// from every peer's list before scheduling. The returned vector has one
/// entry per input peer, in the same order, though some may be empty.
pub fn schedule(
    filename: &str,
    availability: &[(PeerKey, Vec<u32>)],
    held: &HashSet<u32>,
) -> Vec<(PeerKey, Vec<String>)> {
    let mut remaining: Vec<(PeerKey, Vec<u32>)> = availability
        .iter()
        .map(|(peer, ids)| {
            let filtered: Vec<u32> = ids.iter().copied().filter(|id| !held.contains(id)).collect();
            (peer.clone(), filtered)
        })
        .collect();

    let mut result: Vec<(PeerKey, Vec<String>)> = remaining
        .iter()
        .map(|(peer, _)| (peer.clone(), Vec::new()))
        .collect();

    let mut total: usize = remaining.iter().map(|(_, ids)| ids.len()).sum();
    let mut active: Vec<usize> = (0..remaining.len()).collect();

    while total > 0 {
        let mut round_peers = active.clone();

        while !round_peers.is_empty() {
            let round_pos = round_peers
                .iter()
                .enumerate()
                .min_by_key(|&(_, &idx)| remaining[idx].1.len())
                .map(|(pos, _)| pos)
                .expect("round_peers is non-empty");
            let idx = round_peers[round_pos];

            if remaining[idx].1.is_empty() {
                active.retain(|&k| k != idx);
                round_peers.remove(round_pos);
                continue;
            }

            let piece_id = remaining[idx].1[0];
            let name = piece_filename(filename, piece_id)
                .unwrap_or_else(|_| format!("{}_{}", filename, piece_id));
            result[idx].1.push(name);

            for &k in &active {
                if let Some(pos) = remaining[k].1.iter().position(|&x| x == piece_id) {
                    remaining[k].1.remove(pos);
                    total -= 1;
                }
            }

            round_peers.remove(round_pos);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(ip: &str, port: u16) -> PeerKey {
        (ip.to_string(), port)
    }

    fn names_for(result: &[(PeerKey, Vec<String>)], peer: &PeerKey) -> Vec<String> {
        result
            .iter()
            .find(|(p, _)| p == peer)
            .map(|(_, names)| names.clone())
            .unwrap_or_default()
    }

    #[test]
    fn disjoint_availability_assigns_each_peer_its_own_pieces() {
        let a = peer("127.0.0.1", 9001);
        let c = peer("127.0.0.1", 9002);
        let availability = vec![(a.clone(), vec![0, 1]), (c.clone(), vec![2])];

        let result = schedule("3.txt", &availability, &HashSet::new());

        assert_eq!(names_for(&result, &a), vec!["3_0.txt", "3_1.txt"]);
        assert_eq!(names_for(&result, &c), vec!["3_2.txt"]);
    }

    #[test]
    fn overlapping_availability_balances_load_across_peers() {
        let a = peer("127.0.0.1", 9001);
        let b = peer("127.0.0.1", 9002);
        let availability = vec![(a.clone(), vec![0, 1, 2, 3]), (b.clone(), vec![0, 2])];

        let result = schedule("4.txt", &availability, &HashSet::new());

        assert_eq!(names_for(&result, &a), vec!["4_1.txt", "4_3.txt"]);
        assert_eq!(names_for(&result, &b), vec!["4_0.txt", "4_2.txt"]);

        // P2: disjointness.
        let mut seen = HashSet::new();
        for (_, names) in &result {
            for name in names {
                assert!(seen.insert(name.clone()), "piece {} assigned twice", name);
            }
        }
    }

    #[test]
    fn already_held_pieces_are_filtered_out_of_the_queue() {
        let a = peer("127.0.0.1", 9001);
        let availability = vec![(a.clone(), vec![0, 1, 2])];
        let held: HashSet<u32> = [1].into_iter().collect();

        let result = schedule("f.txt", &availability, &held);

        assert_eq!(names_for(&result, &a), vec!["f_0.txt", "f_2.txt"]);
    }

    #[test]
    fn every_known_piece_ends_up_assigned_or_already_held() {
        let a = peer("127.0.0.1", 9001);
        let b = peer("127.0.0.1", 9002);
        let availability = vec![(a.clone(), vec![0, 1, 2, 3, 4]), (b.clone(), vec![2, 3, 4, 5])];
        let held: HashSet<u32> = [0].into_iter().collect();

        let result = schedule("g.txt", &availability, &held);

        let mut assigned: HashSet<u32> = HashSet::new();
        for (_, names) in &result {
            for name in names {
                let id: u32 = name
                    .trim_start_matches("g_")
                    .trim_end_matches(".txt")
                    .parse()
                    .unwrap();
                assigned.insert(id);
            }
        }

        let mut known: HashSet<u32> = HashSet::new();
        for (_, ids) in &availability {
            known.extend(ids.iter().copied());
        }

        for id in known {
            assert!(held.contains(&id) || assigned.contains(&id));
        }
    }

    #[test]
    fn empty_availability_yields_empty_queues() {
        let a = peer("127.0.0.1", 9001);
        let availability = vec![(a.clone(), vec![])];
        let result = schedule("h.txt", &availability, &HashSet::new());
        assert_eq!(names_for(&result, &a), Vec::<String>::new());
    }
}
