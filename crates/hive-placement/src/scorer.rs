//! Node scoring for placement decisions.
//!
//! A node's score is its projected usage after taking the new replica:
//! the highest weighted `(usage + demand) / max` over all resource
//! dimensions, raised to the node's self-reported aggregate usage when that
//! is higher. Lower is better. A node that would exceed any declared
//! maximum is rejected.

use hive_core::{NodeId, ResourceKind, ResourceValues, ResourceWeights, SubDomainKey, TypeLimit};

/// What the placer needs to know about one node for one request.
#[derive(Debug, Clone)]
pub struct NodeView {
    pub node_id: NodeId,
    pub data_center: String,
    /// Bridge pile rank, 0 is the primary pile.
    pub pile_rank: u32,
    pub serviced_domains: Vec<SubDomainKey>,
    /// Sum of the usage of replicas already placed on the node.
    pub usage: ResourceValues,
    pub max: ResourceValues,
    /// Windowed aggregate usage ratio reported by the node itself.
    pub reported_usage: f64,
    pub tablet_count: u32,
    /// Replicas of the requested tablet type on the node.
    pub same_type_count: u32,
    /// Replicas sharing the requested object id on the node.
    pub same_object_count: u32,
    pub type_limit: TypeLimit,
    /// Connected, not down, not draining, not skipped as bad.
    pub schedulable: bool,
}

impl NodeView {
    pub fn new(node_id: NodeId, max: ResourceValues) -> Self {
        Self {
            node_id,
            data_center: String::new(),
            pile_rank: 0,
            serviced_domains: Vec::new(),
            usage: ResourceValues::default(),
            max,
            reported_usage: 0.0,
            tablet_count: 0,
            same_type_count: 0,
            same_object_count: 0,
            type_limit: TypeLimit::default(),
            schedulable: true,
        }
    }

    /// Highest normalized usage over all dimensions, ignoring weights.
    pub fn current_usage(&self) -> f64 {
        ResourceKind::ALL
            .iter()
            .map(|kind| self.usage.normalized(&self.max, *kind))
            .fold(self.reported_usage, f64::max)
    }
}

/// Score `node` for a replica needing `demand`. `None` means it does not fit.
pub fn score_node(node: &NodeView, demand: &ResourceValues, weights: &ResourceWeights) -> Option<f64> {
    let mut score = node.reported_usage;
    for kind in ResourceKind::ALL {
        let max = node.max.get(kind);
        if max == 0 {
            continue;
        }
        let projected = node.usage.get(kind).saturating_add(demand.get(kind)) as f64 / max as f64;
        if projected > 1.0 {
            return None;
        }
        score = score.max(projected * weights.get(kind));
    }
    if score > 1.0 {
        return None;
    }
    Some(score)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_node(id: NodeId, cpu_used: u64, cpu_max: u64) -> NodeView {
        let mut node = NodeView::new(id, ResourceValues::new(cpu_max, 1024, 0, 100));
        node.usage = ResourceValues::new(cpu_used, 0, 0, 0);
        node
    }

    #[test]
    fn rejects_node_over_capacity() {
        let node = make_node(1, 900, 1000);
        let demand = ResourceValues::new(200, 0, 0, 1);
        assert!(score_node(&node, &demand, &ResourceWeights::default()).is_none());
    }

    #[test]
    fn score_is_highest_dimension() {
        let mut node = make_node(1, 500, 1000);
        node.usage.memory = 128;
        let demand = ResourceValues::new(0, 0, 0, 1);
        let score = score_node(&node, &demand, &ResourceWeights::default()).unwrap();
        assert!((score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn reported_usage_raises_score() {
        let mut node = make_node(1, 0, 1000);
        node.reported_usage = 0.8;
        let score = score_node(&node, &ResourceValues::default(), &ResourceWeights::default()).unwrap();
        assert!((score - 0.8).abs() < 1e-9);
    }

    #[test]
    fn overloaded_report_rejects_node() {
        let mut node = make_node(1, 0, 1000);
        node.reported_usage = 1.2;
        assert!(score_node(&node, &ResourceValues::default(), &ResourceWeights::default()).is_none());
    }

    #[test]
    fn weights_scale_dimensions() {
        let node = make_node(1, 500, 1000);
        let weights = ResourceWeights {
            cpu: 0.5,
            ..Default::default()
        };
        let score = score_node(&node, &ResourceValues::default(), &weights).unwrap();
        assert!((score - 0.25).abs() < 1e-9);
    }

    #[test]
    fn unknown_maximum_is_ignored() {
        let mut node = NodeView::new(1, ResourceValues::default());
        node.usage = ResourceValues::new(10_000, 10_000, 10_000, 10_000);
        assert_eq!(
            score_node(&node, &ResourceValues::new(1, 1, 1, 1), &ResourceWeights::default()),
            Some(0.0)
        );
    }
}
