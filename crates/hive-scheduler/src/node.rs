//! Node registry: live worker nodes, their capacity and reachability.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use hive_core::{NodeId, PileId, ReplicaKey, ResourceValues, SubDomainKey};
use hive_state::NodeRecord;
use tracing::warn;

/// Runtime view of a worker node.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub record: NodeRecord,
    pub connected: bool,
    /// Bumped on every disconnect; grace timers carry the epoch they were armed in.
    pub epoch: u64,
    /// Replicas currently assigned to the node.
    pub replicas: BTreeSet<ReplicaKey>,
    usage_window: VecDeque<(u64, f64)>,
    recent_failures: VecDeque<u64>,
    pub skip_until_ms: u64,
}

impl NodeInfo {
    pub fn new(record: NodeRecord) -> Self {
        Self {
            record,
            connected: false,
            epoch: 0,
            replicas: BTreeSet::new(),
            usage_window: VecDeque::new(),
            recent_failures: VecDeque::new(),
            skip_until_ms: 0,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.record.node_id
    }

    pub fn data_center(&self) -> &str {
        &self.record.location.data_center
    }

    pub fn pile(&self) -> Option<PileId> {
        self.record.location.pile
    }

    /// Maximums, falling back to `defaults` for undeclared dimensions.
    pub fn max(&self, defaults: &ResourceValues) -> ResourceValues {
        self.record.resource_max.or_defaults(defaults)
    }

    /// Domains the node runs tablets for; an empty list means the root domain.
    pub fn serviced_domains(&self, root: SubDomainKey) -> Vec<SubDomainKey> {
        if self.record.serviced_domains.is_empty() {
            vec![root]
        } else {
            self.record.serviced_domains.clone()
        }
    }

    pub fn services(&self, domain: SubDomainKey, root: SubDomainKey) -> bool {
        if self.record.serviced_domains.is_empty() {
            domain == root
        } else {
            self.record.serviced_domains.contains(&domain)
        }
    }

    pub fn record_usage(&mut self, now_ms: u64, usage: f64, window_ms: u64) {
        self.usage_window.push_back((now_ms, usage));
        while let Some((ts, _)) = self.usage_window.front() {
            if now_ms.saturating_sub(*ts) > window_ms {
                self.usage_window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Highest aggregate usage reported within the window.
    pub fn reported_usage(&self) -> f64 {
        self.usage_window
            .iter()
            .map(|(_, u)| *u)
            .fold(0.0, f64::max)
    }

    pub fn is_bad(&self, now_ms: u64) -> bool {
        self.skip_until_ms > now_ms
    }

    /// Record a failed boot. Returns true when the node just became bad.
    pub fn record_failure(&mut self, now_ms: u64, threshold: u32, window_ms: u64, skip_ms: u64) -> bool {
        self.recent_failures.push_back(now_ms);
        while let Some(ts) = self.recent_failures.front() {
            if now_ms.saturating_sub(*ts) > window_ms {
                self.recent_failures.pop_front();
            } else {
                break;
            }
        }
        if threshold > 0 && self.recent_failures.len() >= threshold as usize {
            self.recent_failures.clear();
            self.skip_until_ms = now_ms + skip_ms;
            warn!(node_id = self.node_id(), skip_ms, "node marked bad after repeated boot failures");
            return true;
        }
        false
    }
}

/// Bridge (multi-pile) cluster state.
#[derive(Debug, Clone, Default)]
pub struct BridgeState {
    pub primary: Option<PileId>,
    pub promoted: Option<PileId>,
    pub disconnected: BTreeSet<PileId>,
}

impl BridgeState {
    /// Preference rank of a pile, lower is better. `None` when unreachable.
    pub fn rank(&self, pile: Option<PileId>) -> Option<u32> {
        let Some(pile) = pile else {
            return Some(0);
        };
        if self.disconnected.contains(&pile) {
            return None;
        }
        match self.primary {
            None => Some(0),
            Some(p) if p == pile => Some(0),
            Some(_) if self.promoted == Some(pile) => Some(1),
            Some(_) => Some(2),
        }
    }
}

#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: BTreeMap<NodeId, NodeInfo>,
}

impl NodeRegistry {
    pub fn insert(&mut self, node: NodeInfo) {
        self.nodes.insert(node.node_id(), node);
    }

    pub fn get(&self, node_id: NodeId) -> Option<&NodeInfo> {
        self.nodes.get(&node_id)
    }

    pub fn get_mut(&mut self, node_id: NodeId) -> Option<&mut NodeInfo> {
        self.nodes.get_mut(&node_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeInfo> {
        self.nodes.values()
    }

    pub fn connected(&self) -> impl Iterator<Item = &NodeInfo> {
        self.nodes.values().filter(|n| n.connected)
    }

    pub fn attach(&mut self, node_id: NodeId, key: ReplicaKey) {
        if let Some(node) = self.nodes.get_mut(&node_id) {
            node.replicas.insert(key);
        }
    }

    pub fn detach(&mut self, node_id: NodeId, key: ReplicaKey) {
        if let Some(node) = self.nodes.get_mut(&node_id) {
            node.replicas.remove(&key);
        }
    }

    /// Distinct data centers of connected nodes.
    pub fn data_centers(&self) -> BTreeSet<String> {
        self.connected().map(|n| n.data_center().to_string()).collect()
    }

    pub fn is_schedulable(&self, node_id: NodeId, now_ms: u64, bridge: &BridgeState) -> bool {
        self.get(node_id).is_some_and(|n| {
            n.connected
                && !n.record.down
                && !n.record.draining
                && !n.is_bad(now_ms)
                && bridge.rank(n.pile()).is_some()
        })
    }
}
