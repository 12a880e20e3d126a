//! Balancer move planning.
//!
//! A pass looks at each resource dimension separately, most scattered
//! first. For CPU, memory and network the scatter is the spread of
//! normalized node usage; for the counter dimension it is the spread of
//! replica counts. While a dimension stays above its threshold and budget
//! remains, one replica is moved from the most loaded node to the least
//! loaded node that can host it. A move is only made when the target stays
//! below the source afterwards, so equal placements are left alone.
//!
//! The plan is computed against a working copy of the cluster so later
//! moves in the same pass see the effect of earlier ones. A replica is moved
//! at most once per pass.

use std::collections::{BTreeMap, BTreeSet};

use hive_core::{NodeId, ReplicaKey, ResourceKind, ResourceValues};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceKind {
    /// Periodic pass over every eligible node.
    Regular,
    /// Only drains nodes at or above the kick threshold.
    Emergency,
}

#[derive(Debug, Clone)]
pub struct BalanceNode {
    pub node_id: NodeId,
    pub usage: ResourceValues,
    pub max: ResourceValues,
    pub tablet_count: u64,
    /// Aggregate usage ratio as reported by the node.
    pub node_usage: f64,
    /// Replicas may be taken off this node.
    pub source: bool,
    /// Replicas may be placed on this node.
    pub target: bool,
}

#[derive(Debug, Clone)]
pub struct BalanceReplica {
    pub key: ReplicaKey,
    pub node_id: NodeId,
    pub usage: ResourceValues,
    /// False for `Ignore` policy, locked, deleting, cooling-down replicas.
    pub movable: bool,
}

#[derive(Debug, Clone)]
pub struct BalanceParams {
    pub min_scatter: f64,
    pub min_counter_difference: u64,
    pub min_node_usage: f64,
    pub kick_usage: f64,
    pub max_movements: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Move {
    pub replica: ReplicaKey,
    pub from: NodeId,
    pub to: NodeId,
    pub dimension: ResourceKind,
}

struct Working {
    nodes: BTreeMap<NodeId, BalanceNode>,
    replicas: Vec<BalanceReplica>,
    moved: BTreeSet<ReplicaKey>,
}

impl Working {
    fn load(&self, node: &BalanceNode, dim: ResourceKind) -> f64 {
        match dim {
            ResourceKind::Counter => node.tablet_count as f64,
            _ => node.usage.normalized(&node.max, dim),
        }
    }

    /// Load a replica adds to `node` in `dim`.
    fn weight(&self, replica: &BalanceReplica, node: &BalanceNode, dim: ResourceKind) -> f64 {
        match dim {
            ResourceKind::Counter => 1.0,
            _ => replica.usage.normalized(&node.max, dim),
        }
    }

    fn participating(&self) -> impl Iterator<Item = &BalanceNode> {
        self.nodes.values().filter(|n| n.source || n.target)
    }

    fn scatter(&self, dim: ResourceKind) -> f64 {
        let loads: Vec<f64> = self.participating().map(|n| self.load(n, dim)).collect();
        let max = loads.iter().copied().fold(f64::MIN, f64::max);
        let min = loads.iter().copied().fold(f64::MAX, f64::min);
        if loads.len() < 2 { 0.0 } else { max - min }
    }

    /// Scatter normalized to 0..1 so dimensions can be ordered together.
    fn relative_scatter(&self, dim: ResourceKind) -> f64 {
        let s = self.scatter(dim);
        match dim {
            ResourceKind::Counter => {
                let top = self
                    .participating()
                    .map(|n| n.tablet_count)
                    .max()
                    .unwrap_or(0);
                if top == 0 { 0.0 } else { s / top as f64 }
            }
            _ => s,
        }
    }

    fn above_threshold(&self, dim: ResourceKind, params: &BalanceParams) -> bool {
        let s = self.scatter(dim);
        match dim {
            ResourceKind::Counter => s >= params.min_counter_difference.max(1) as f64,
            _ => s > params.min_scatter,
        }
    }

    fn apply(&mut self, index: usize, to: NodeId) {
        let replica = &mut self.replicas[index];
        let from = replica.node_id;
        let usage = replica.usage;
        replica.node_id = to;
        self.moved.insert(replica.key);
        if let Some(src) = self.nodes.get_mut(&from) {
            src.usage = src.usage.saturating_sub(&usage);
            src.tablet_count = src.tablet_count.saturating_sub(1);
        }
        if let Some(dst) = self.nodes.get_mut(&to) {
            dst.usage = dst.usage.saturating_add(&usage);
            dst.tablet_count += 1;
        }
    }
}

/// Plan balancer moves. `can_host` reports whether a node satisfies a
/// replica's hard placement constraints.
pub fn plan_moves<F>(
    kind: BalanceKind,
    nodes: &[BalanceNode],
    replicas: &[BalanceReplica],
    params: &BalanceParams,
    can_host: F,
) -> Vec<Move>
where
    F: Fn(&BalanceReplica, NodeId) -> bool,
{
    let mut work = Working {
        nodes: nodes.iter().map(|n| (n.node_id, n.clone())).collect(),
        replicas: replicas.to_vec(),
        moved: BTreeSet::new(),
    };
    let mut moves = Vec::new();

    let mut dims = ResourceKind::ALL.to_vec();
    dims.sort_by(|a, b| {
        work.relative_scatter(*b)
            .total_cmp(&work.relative_scatter(*a))
    });

    for dim in dims {
        while moves.len() < params.max_movements {
            if kind == BalanceKind::Regular && !work.above_threshold(dim, params) {
                break;
            }
            let Some(mv) = next_move(&work, kind, dim, params, &can_host) else {
                break;
            };
            work.apply(mv.0, mv.1.to);
            moves.push(mv.1);
        }
    }
    moves
}

fn next_move<F>(
    work: &Working,
    kind: BalanceKind,
    dim: ResourceKind,
    params: &BalanceParams,
    can_host: &F,
) -> Option<(usize, Move)>
where
    F: Fn(&BalanceReplica, NodeId) -> bool,
{
    let mut sources: Vec<&BalanceNode> = work
        .nodes
        .values()
        .filter(|n| n.source)
        .filter(|n| match kind {
            BalanceKind::Emergency => n.node_usage >= params.kick_usage,
            BalanceKind::Regular => {
                dim == ResourceKind::Counter
                    || n.usage.normalized(&n.max, dim) >= params.min_node_usage
            }
        })
        .collect();
    sources.sort_by(|a, b| {
        work.load(b, dim)
            .total_cmp(&work.load(a, dim))
            .then(a.node_id.cmp(&b.node_id))
    });

    let mut targets: Vec<&BalanceNode> = work.nodes.values().filter(|n| n.target).collect();
    targets.sort_by(|a, b| {
        work.load(a, dim)
            .total_cmp(&work.load(b, dim))
            .then(a.node_id.cmp(&b.node_id))
    });

    for src in sources {
        let src_load = work.load(src, dim);
        for dst in targets.iter().filter(|d| d.node_id != src.node_id) {
            let dst_load = work.load(dst, dim);
            let mut best: Option<(usize, f64, f64)> = None;
            for (i, r) in work.replicas.iter().enumerate() {
                if r.node_id != src.node_id || !r.movable || work.moved.contains(&r.key) {
                    continue;
                }
                let w_src = work.weight(r, src, dim);
                let w_dst = work.weight(r, dst, dim);
                if w_src <= 0.0 || dst_load + w_dst >= src_load {
                    continue;
                }
                if !can_host(r, dst.node_id) {
                    continue;
                }
                let peak = (src_load - w_src).max(dst_load + w_dst);
                let side_effect = side_effect(r, dst, dim);
                let better = match best {
                    None => true,
                    Some((j, p, s)) => {
                        let key_order = r.key < work.replicas[j].key;
                        if dim == ResourceKind::Counter {
                            side_effect < s || (side_effect == s && key_order)
                        } else {
                            peak < p || (peak == p && key_order)
                        }
                    }
                };
                if better {
                    best = Some((i, peak, side_effect));
                }
            }
            if let Some((i, _, _)) = best {
                let r = &work.replicas[i];
                return Some((
                    i,
                    Move {
                        replica: r.key,
                        from: src.node_id,
                        to: dst.node_id,
                        dimension: dim,
                    },
                ));
            }
        }
    }
    None
}

/// Load a replica would add to the target outside the balanced dimension.
fn side_effect(replica: &BalanceReplica, dst: &BalanceNode, dim: ResourceKind) -> f64 {
    ResourceKind::ALL
        .iter()
        .filter(|k| **k != dim && **k != ResourceKind::Counter)
        .map(|k| replica.usage.normalized(&dst.max, *k))
        .sum()
}
