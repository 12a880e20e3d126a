//! Balancer passes: gather the cluster picture, plan moves, restart the
//! moved replicas on their new nodes.
//!
//! Regular passes run from `BalancerTick` and are rate limited by
//! `min_period_between_balance_ms`. Emergency passes are triggered by a
//! node reporting usage at or above `max_node_usage_to_kick` and only move
//! replicas off such nodes.

use std::collections::{HashMap, HashSet};

use hive_core::{BalancerPolicy, NodeId, ReplicaKey, ResourceValues, TabletType, VolatileState};
use hive_placement::{
    BalanceKind, BalanceNode, BalanceParams, BalanceReplica, NodeView, PlacementRequest, admits,
    plan_moves,
};
use tracing::{debug, info};

use crate::hive::Hive;

#[derive(Debug, Default)]
pub struct BalancerState {
    pub last_regular_ms: Option<u64>,
    pub last_emergency_ms: Option<u64>,
    /// Replicas moved by the balancer and not yet running at their target.
    pub moves: HashSet<ReplicaKey>,
    pub total_movements: u64,
}

impl Hive {
    pub(crate) fn balancer_tick(&mut self, now_ms: u64) {
        let config = &self.config.balancer;
        if !config.enabled {
            return;
        }
        let due = self
            .balancer
            .last_regular_ms
            .is_none_or(|last| now_ms.saturating_sub(last) >= config.min_period_between_balance_ms);
        if due {
            self.run_balancer(BalanceKind::Regular, now_ms);
        }
    }

    /// Start an emergency pass if `node_id` is overloaded.
    pub(crate) fn emergency_check(&mut self, node_id: NodeId, now_ms: u64) {
        let config = &self.config.balancer;
        if !config.enabled {
            return;
        }
        let overloaded = self
            .nodes
            .get(node_id)
            .is_some_and(|n| n.connected && n.reported_usage() >= config.max_node_usage_to_kick);
        if !overloaded {
            return;
        }
        let due = self.balancer.last_emergency_ms.is_none_or(|last| {
            now_ms.saturating_sub(last) >= config.min_period_between_emergency_ms
        });
        if due {
            info!(node_id, "node overloaded, emergency balance");
            self.run_balancer(BalanceKind::Emergency, now_ms);
        }
    }

    pub(crate) fn run_balancer(&mut self, kind: BalanceKind, now_ms: u64) {
        match kind {
            BalanceKind::Regular => self.balancer.last_regular_ms = Some(now_ms),
            BalanceKind::Emergency => self.balancer.last_emergency_ms = Some(now_ms),
        }
        let config = &self.config.balancer;
        let limit = match kind {
            BalanceKind::Regular => config.max_movements,
            BalanceKind::Emergency => config.max_emergency_movements,
        };
        let budget = limit.min(
            config
                .max_inflight_movements
                .saturating_sub(self.balancer.moves.len()),
        );
        if budget == 0 {
            debug!(?kind, in_flight = self.balancer.moves.len(), "balancer has no budget");
            return;
        }
        let params = BalanceParams {
            min_scatter: config.min_scatter_to_balance,
            min_counter_difference: config.min_counter_difference_to_balance,
            min_node_usage: config.min_node_usage_to_balance,
            kick_usage: config.max_node_usage_to_kick,
            max_movements: budget,
        };

        let nodes = self.balance_nodes(now_ms);
        let replicas = self.balance_replicas(now_ms);
        let mut views: HashMap<TabletType, HashMap<NodeId, NodeView>> = HashMap::new();
        let mut requests: HashMap<ReplicaKey, (TabletType, PlacementRequest)> = HashMap::new();
        for replica in replicas.iter().filter(|r| r.movable) {
            let Some(tablet_type) = self.tablets.get(replica.key.tablet_id).map(|t| t.record.tablet_type)
            else {
                continue;
            };
            let Some(request) = self.placement_request(replica.key) else {
                continue;
            };
            views.entry(tablet_type).or_insert_with(|| {
                self.node_views(tablet_type, 0, now_ms)
                    .into_iter()
                    .map(|v| (v.node_id, v))
                    .collect()
            });
            requests.insert(replica.key, (tablet_type, request));
        }
        let weights = self.config.boot.resource_weights;
        let moves = plan_moves(kind, &nodes, &replicas, &params, |replica, to| {
            let Some((tablet_type, request)) = requests.get(&replica.key) else {
                return false;
            };
            let Some(view) = views.get(tablet_type).and_then(|v| v.get(&to)) else {
                return false;
            };
            let shares_node = request
                .spread
                .as_ref()
                .is_some_and(|s| s.require_different_nodes && s.occupied_nodes.contains(&to));
            !shares_node && admits(view, request, &weights)
        });

        for mv in &moves {
            debug!(replica = %mv.replica, from = mv.from, to = mv.to, dimension = ?mv.dimension, "balancer move");
            self.stop_replica(mv.replica);
            if let Some(replica) = self.tablets.replica_mut(mv.replica) {
                replica.preferred_node = Some(mv.to);
                replica.last_moved_ms = Some(now_ms);
            }
            self.balancer.moves.insert(mv.replica);
            self.enqueue(mv.replica);
        }
        self.balancer.total_movements += moves.len() as u64;
        if !moves.is_empty() {
            info!(
                ?kind,
                movements = moves.len(),
                nodes = nodes.len(),
                replicas = replicas.len(),
                "balancer pass complete"
            );
        }
    }

    fn balance_nodes(&self, now_ms: u64) -> Vec<BalanceNode> {
        let defaults = &self.config.boot.default_node_max;
        self.nodes
            .connected()
            .map(|node| {
                let mut usage = ResourceValues::default();
                let mut tablet_count = 0;
                for key in &node.replicas {
                    let Some(tablet) = self.tablets.get(key.tablet_id) else {
                        continue;
                    };
                    let Some(replica) = tablet.replica(key.follower_id) else {
                        continue;
                    };
                    usage = usage.saturating_add(&self.replica_demand(tablet, replica));
                    tablet_count += 1;
                }
                let schedulable = self.nodes.is_schedulable(node.node_id(), now_ms, &self.bridge);
                BalanceNode {
                    node_id: node.node_id(),
                    usage,
                    max: node.max(defaults),
                    tablet_count,
                    node_usage: node.reported_usage(),
                    source: !node.record.freeze,
                    target: schedulable && !node.record.freeze,
                }
            })
            .collect()
    }

    fn balance_replicas(&self, now_ms: u64) -> Vec<BalanceReplica> {
        let cooldown = self.config.balancer.tablet_move_cooldown_ms;
        let mut out = Vec::new();
        for tablet in self.tablets.iter() {
            let record = &tablet.record;
            let tablet_movable = record.balancer_policy == BalancerPolicy::Balance
                && !record.deleting
                && !tablet.is_migrating()
                && !self.storage_balancer.moves.contains(&record.tablet_id);
            for replica in tablet.replicas() {
                if replica.state != VolatileState::Running || replica.node_id == 0 {
                    continue;
                }
                let cooled = replica
                    .last_moved_ms
                    .is_none_or(|at| now_ms.saturating_sub(at) >= cooldown);
                let movable = tablet_movable
                    && cooled
                    && !self.balancer.moves.contains(&replica.key)
                    && !(replica.key.is_leader() && tablet.is_locked());
                out.push(BalanceReplica {
                    key: replica.key,
                    node_id: replica.node_id,
                    usage: self.replica_demand(tablet, replica),
                    movable,
                });
            }
        }
        out
    }
}
