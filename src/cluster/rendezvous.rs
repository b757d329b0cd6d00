//! Rendezvous (highest-random-weight) node selection.
//!
//! Each live node scores a key with FNV-1a 64 over `tenant:user:node`; the
//! highest score owns the key. Ties fall to the lexicographically smallest
//! node id so the choice is a total order for a fixed key.

use serde::{Deserialize, Serialize};

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// A live gateway node as published in the node directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: String,
    pub endpoint: String,
}

impl NodeInfo {
    pub fn new(node_id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            endpoint: endpoint.into(),
        }
    }
}

pub fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Score of `node_id` for the (tenant, user) key.
pub fn score(tenant_id: &str, user_id: &str, node_id: &str) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    let parts: [&[u8]; 5] = [
        tenant_id.as_bytes(),
        b":",
        user_id.as_bytes(),
        b":",
        node_id.as_bytes(),
    ];
    for part in parts {
        for byte in part {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
    }
    hash
}

/// Pick the owning node for a key, or `None` when no node is live.
pub fn pick_node<'a>(tenant_id: &str, user_id: &str, nodes: &'a [NodeInfo]) -> Option<&'a NodeInfo> {
    let mut best: Option<(&NodeInfo, u64)> = None;
    for node in nodes {
        if node.node_id.is_empty() {
            continue;
        }
        let s = score(tenant_id, user_id, &node.node_id);
        best = match best {
            None => Some((node, s)),
            Some((current, current_score)) => {
                if s > current_score || (s == current_score && node.node_id < current.node_id) {
                    Some((node, s))
                } else {
                    Some((current, current_score))
                }
            }
        };
    }
    best.map(|(node, _)| node)
}

pub fn pick_node_id<'a>(tenant_id: &str, user_id: &str, nodes: &'a [NodeInfo]) -> Option<&'a str> {
    pick_node(tenant_id, user_id, nodes).map(|n| n.node_id.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn nodes(ids: &[&str]) -> Vec<NodeInfo> {
        ids.iter()
            .map(|id| NodeInfo::new(*id, format!("http://{id}:7100")))
            .collect()
    }

    #[test]
    fn fnv_matches_reference_vectors() {
        assert_eq!(fnv1a64(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a64(b"a"), 0xaf63_dc4c_8601_ec8c);
        assert_eq!(score("t", "u", "n"), fnv1a64(b"t:u:n"));
    }

    #[test]
    fn empty_node_list_has_no_owner() {
        assert!(pick_node_id("t", "u", &[]).is_none());
        assert!(pick_node_id("t", "u", &nodes(&[""])).is_none());
    }

    #[test]
    fn selection_ignores_input_order() {
        let forward = nodes(&["a", "b", "c", "d"]);
        let mut reversed = forward.clone();
        reversed.reverse();
        for user in ["u1", "u2", "u3", "alice", "bob"] {
            assert_eq!(
                pick_node_id("acme", user, &forward),
                pick_node_id("acme", user, &reversed)
            );
        }
    }

    proptest! {
        #[test]
        fn removing_a_loser_keeps_the_winner(
            user in "[a-z0-9]{1,12}",
            ids in proptest::collection::btree_set("[a-z]{1,6}", 2..8),
            drop_idx in 0usize..8,
        ) {
            let ids: Vec<String> = ids.into_iter().collect();
            let all: Vec<NodeInfo> = ids.iter().map(|id| NodeInfo::new(id.clone(), "e")).collect();
            let winner = pick_node_id("tenant", &user, &all).unwrap().to_string();
            let victim = &ids[drop_idx % ids.len()];
            prop_assume!(*victim != winner);
            let remaining: Vec<NodeInfo> = all.iter().filter(|n| &n.node_id != victim).cloned().collect();
            prop_assert_eq!(pick_node_id("tenant", &user, &remaining), Some(winner.as_str()));
        }

        #[test]
        fn selection_is_deterministic(user in "[a-z0-9]{1,12}") {
            let set = nodes(&["n1", "n2", "n3"]);
            prop_assert_eq!(pick_node_id("t", &user, &set), pick_node_id("t", &user, &set));
        }
    }
}
