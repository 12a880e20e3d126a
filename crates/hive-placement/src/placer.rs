//! Placement engine: picks the node a replica boots on.
//!
//! Candidates go through these stages:
//! 1. Hard filters: schedulable, domain scope, node/DC allow-lists, type
//!    capacity, resource capacity.
//! 2. Replica spread (follower groups): nodes not hosting a sibling and DCs
//!    under their quota, when any such node exists.
//! 3. Type-priority tier: only the highest tier that still has candidates.
//!    Spare hosts carry lower priorities.
//! 4. Location: best pile rank, then data center preference order.
//! 5. The preferred node hint wins if it survived; otherwise the configured
//!    selection strategy decides.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use hive_core::config::NodeSelectStrategy;
use hive_core::{NodeId, ResourceValues, ResourceWeights, SubDomainKey};
use rand::Rng;
use tracing::debug;

use crate::scorer::{NodeView, score_node};

/// Placement constraints of one replica.
#[derive(Debug, Clone, Default)]
pub struct PlacementRequest {
    pub demand: ResourceValues,
    /// Empty allows any domain.
    pub allowed_domains: Vec<SubDomainKey>,
    pub allowed_node_ids: Vec<NodeId>,
    pub allowed_data_centers: Vec<String>,
    /// Earlier data centers are preferred.
    pub data_center_preference: Vec<String>,
    pub spread: Option<SpreadConstraint>,
    pub preferred_node: Option<NodeId>,
    /// Nodes that must not be used, e.g. the node being moved away from.
    pub exclude_nodes: Vec<NodeId>,
}

/// Soft anti-affinity between replicas of one tablet.
#[derive(Debug, Clone, Default)]
pub struct SpreadConstraint {
    pub require_different_nodes: bool,
    /// Nodes already hosting a replica of the tablet.
    pub occupied_nodes: Vec<NodeId>,
    pub require_all_data_centers: bool,
    pub per_data_center: u32,
    /// Replicas of the group already placed per data center.
    pub data_center_counts: BTreeMap<String, u32>,
}

impl SpreadConstraint {
    fn satisfied_by(&self, node: &NodeView) -> bool {
        if self.require_different_nodes && self.occupied_nodes.contains(&node.node_id) {
            return false;
        }
        if self.require_all_data_centers {
            let placed = self
                .data_center_counts
                .get(&node.data_center)
                .copied()
                .unwrap_or(0);
            if placed >= self.per_data_center.max(1) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placement {
    pub node_id: NodeId,
    pub score: f64,
}

/// Why no node was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unplaceable {
    /// No schedulable node is within the replica's scope.
    NoNodes,
    /// Every node in scope is at capacity.
    OverCapacity,
}

struct Candidate<'a> {
    node: &'a NodeView,
    score: f64,
}

fn in_scope(node: &NodeView, req: &PlacementRequest) -> bool {
    if !node.schedulable || req.exclude_nodes.contains(&node.node_id) {
        return false;
    }
    if !req.allowed_domains.is_empty()
        && !node
            .serviced_domains
            .iter()
            .any(|d| req.allowed_domains.contains(d))
    {
        return false;
    }
    if !req.allowed_node_ids.is_empty() && !req.allowed_node_ids.contains(&node.node_id) {
        return false;
    }
    if !req.allowed_data_centers.is_empty() && !req.allowed_data_centers.contains(&node.data_center) {
        return false;
    }
    true
}

fn has_type_room(node: &NodeView) -> bool {
    node.type_limit
        .max_count
        .is_none_or(|max| node.same_type_count < max)
}

fn location_rank(node: &NodeView, req: &PlacementRequest) -> (u32, usize) {
    let dc_rank = req
        .data_center_preference
        .iter()
        .position(|dc| *dc == node.data_center)
        .unwrap_or(req.data_center_preference.len());
    (node.pile_rank, dc_rank)
}

/// Deterministic order: score, anti-affinity, fewer tablets, node id.
fn exact_order(a: &Candidate<'_>, b: &Candidate<'_>) -> Ordering {
    a.score
        .total_cmp(&b.score)
        .then(a.node.same_object_count.cmp(&b.node.same_object_count))
        .then(a.node.tablet_count.cmp(&b.node.tablet_count))
        .then(a.node.node_id.cmp(&b.node.node_id))
}

/// Whether `node` passes every hard filter for `req`.
pub fn admits(node: &NodeView, req: &PlacementRequest, weights: &ResourceWeights) -> bool {
    in_scope(node, req) && has_type_room(node) && score_node(node, &req.demand, weights).is_some()
}

/// Choose a node for one replica.
pub fn place<R: Rng>(
    nodes: &[NodeView],
    req: &PlacementRequest,
    weights: &ResourceWeights,
    strategy: NodeSelectStrategy,
    rng: &mut R,
) -> Result<Placement, Unplaceable> {
    let scoped: Vec<&NodeView> = nodes
        .iter()
        .filter(|n| in_scope(n, req) && has_type_room(n))
        .collect();
    if scoped.is_empty() {
        return Err(Unplaceable::NoNodes);
    }

    let mut candidates: Vec<Candidate<'_>> = scoped
        .into_iter()
        .filter_map(|node| {
            score_node(node, &req.demand, weights).map(|score| Candidate { node, score })
        })
        .collect();
    if candidates.is_empty() {
        return Err(Unplaceable::OverCapacity);
    }

    if let Some(spread) = &req.spread {
        if candidates.iter().any(|c| spread.satisfied_by(c.node)) {
            candidates.retain(|c| spread.satisfied_by(c.node));
        }
    }

    if let Some(top) = candidates.iter().map(|c| c.node.type_limit.priority).max() {
        candidates.retain(|c| c.node.type_limit.priority == top);
    }

    if let Some(best) = candidates.iter().map(|c| location_rank(c.node, req)).min() {
        candidates.retain(|c| location_rank(c.node, req) == best);
    }

    let preferred = req
        .preferred_node
        .and_then(|id| candidates.iter().find(|c| c.node.node_id == id));
    if let Some(c) = preferred {
        return Ok(Placement {
            node_id: c.node.node_id,
            score: c.score,
        });
    }

    let chosen = select(&mut candidates, strategy, rng);
    debug!(
        node_id = chosen.node_id,
        score = chosen.score,
        ?strategy,
        "node selected"
    );
    Ok(chosen)
}

fn select<R: Rng>(
    candidates: &mut [Candidate<'_>],
    strategy: NodeSelectStrategy,
    rng: &mut R,
) -> Placement {
    candidates.sort_by(exact_order);
    let pick = match strategy {
        NodeSelectStrategy::ExactMin => 0,
        NodeSelectStrategy::RandomMin7p => {
            let best = &candidates[0];
            let limit = best.score * 1.07 + f64::EPSILON;
            let min_object = best.node.same_object_count;
            let close: Vec<usize> = candidates
                .iter()
                .enumerate()
                .filter(|(_, c)| c.score <= limit && c.node.same_object_count == min_object)
                .map(|(i, _)| i)
                .collect();
            close[rng.gen_range(0..close.len())]
        }
        NodeSelectStrategy::WeightedRandom => {
            let weights: Vec<f64> = candidates
                .iter()
                .map(|c| (1.0 - c.score).max(0.001))
                .collect();
            let total: f64 = weights.iter().sum();
            let mut point = rng.gen_range(0.0..total);
            let mut pick = weights.len() - 1;
            for (i, w) in weights.iter().enumerate() {
                if point < *w {
                    pick = i;
                    break;
                }
                point -= w;
            }
            pick
        }
    };
    let c = &candidates[pick];
    Placement {
        node_id: c.node.node_id,
        score: c.score,
    }
}
