//! Group fanout planning: partition routed members by the node holding them.

use crate::cluster::OnlineDeviceRoute;
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeBucket {
    pub node_id: String,
    pub endpoint: String,
    pub user_ids: Vec<String>,
}

/// One bucket per node holding at least one routed member, local node first,
/// the rest ordered by node id. Members keep their input order inside a bucket.
/// A user with devices on several nodes lands once in each of those buckets.
/// Members without routes are left out.
pub fn build_buckets(
    local_node_id: &str,
    members: &[String],
    routes: &HashMap<String, Vec<OnlineDeviceRoute>>,
) -> Vec<NodeBucket> {
    let mut buckets: BTreeMap<&str, NodeBucket> = BTreeMap::new();
    let mut seen: HashSet<&str> = HashSet::with_capacity(members.len());
    for member in members {
        if !seen.insert(member.as_str()) {
            continue;
        }
        let Some(user_routes) = routes.get(member) else {
            continue;
        };
        let mut placed: Vec<&str> = Vec::with_capacity(1);
        for route in user_routes {
            if route.node_id.is_empty() || placed.contains(&route.node_id.as_str()) {
                continue;
            }
            placed.push(&route.node_id);
            buckets
                .entry(&route.node_id)
                .or_insert_with(|| NodeBucket {
                    node_id: route.node_id.clone(),
                    endpoint: route.endpoint.clone(),
                    user_ids: Vec::new(),
                })
                .user_ids
                .push(member.clone());
        }
    }
    let mut ordered = Vec::with_capacity(buckets.len());
    if let Some(local) = buckets.remove(local_node_id) {
        ordered.push(local);
    }
    ordered.extend(buckets.into_values());
    ordered
}

/// Members with no route entry, deduplicated, in input order.
pub fn unrouted_members<'a>(
    members: &'a [String],
    routes: &HashMap<String, Vec<OnlineDeviceRoute>>,
) -> Vec<&'a str> {
    let mut seen = HashSet::new();
    members
        .iter()
        .map(String::as_str)
        .filter(|m| seen.insert(*m) && !routes.contains_key(*m))
        .collect()
}
