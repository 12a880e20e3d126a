//! Node lifecycle: registration, disconnects, drains and operator flags.

use std::collections::BTreeSet;

use hive_core::{LockLostReason, NodeId, PileId, ReplicaKey, Status, TabletId};
use hive_state::NodeRecord;
use tracing::{debug, error, info, warn};

use crate::hive::Hive;
use crate::messages::{Notification, RegisterNode, Response, TabletUsage, Timer};
use crate::node::{BridgeState, NodeInfo};

/// Progress of one node drain.
#[derive(Debug, Default)]
pub struct DrainState {
    /// Replicas still to move off the node.
    pub pending: BTreeSet<ReplicaKey>,
    /// Stopped on the node, not yet running elsewhere.
    pub moving: BTreeSet<ReplicaKey>,
    pub movements: usize,
}

impl Hive {
    pub(crate) fn register_node(&mut self, register: RegisterNode, now_ms: u64) -> Response {
        let node_id = register.node_id;
        if node_id == 0 {
            warn!("node registration without an id");
            return Response::status(Status::Error);
        }
        let restarted = match self.nodes.get_mut(node_id) {
            Some(node) => {
                let restarted = !node.connected;
                node.record.location = register.location;
                node.record.serviced_domains = register.serviced_domains;
                node.record.resource_max = register.resource_max;
                node.record.type_limits = register.type_limits;
                if restarted {
                    node.record.draining = false;
                    node.record.registered_at_ms = now_ms;
                    node.epoch += 1;
                }
                node.connected = true;
                restarted
            }
            None => {
                let mut record = NodeRecord::new(node_id);
                record.location = register.location;
                record.serviced_domains = register.serviced_domains;
                record.resource_max = register.resource_max;
                record.type_limits = register.type_limits;
                record.registered_at_ms = now_ms;
                let mut node = NodeInfo::new(record);
                node.connected = true;
                self.nodes.insert(node);
                true
            }
        };
        if let Some(node) = self.nodes.get(node_id) {
            if let Err(e) = self.store.put_node(&node.record) {
                error!(node_id, error = %e, "failed to persist node");
                return Response::status(Status::Error);
            }
        }
        if restarted {
            self.drains.remove(&node_id);
            // A returning node lost whatever it was running.
            let stale: Vec<ReplicaKey> = self
                .nodes
                .get(node_id)
                .map(|n| n.replicas.iter().copied().collect())
                .unwrap_or_default();
            for key in stale {
                self.reset_replica(key);
                self.after_replica_stopped(key);
            }
            info!(node_id, "node registered");
        } else {
            debug!(node_id, "node re-registered");
        }
        self.retry_waiting();
        Response::status(Status::Ok)
    }

    pub(crate) fn node_disconnected(&mut self, node_id: NodeId) -> Response {
        let Some(node) = self.nodes.get_mut(node_id) else {
            return self.warn_unknown_node(node_id, "disconnect");
        };
        if !node.connected {
            return Response::status(Status::Already);
        }
        node.connected = false;
        node.epoch += 1;
        let epoch = node.epoch;
        info!(node_id, epoch, "node disconnected");

        let held: Vec<TabletId> = self
            .tablets
            .iter()
            .filter(|t| t.record.lock.is_some_and(|l| l.owner.node_id == node_id))
            .map(|t| t.id())
            .collect();
        self.reclaim_locks(&held, LockLostReason::NodeDisconnected);

        let grace_ms = self.config.node.disconnect_grace_ms;
        if grace_ms == 0 {
            self.node_grace_expired(node_id, epoch);
        } else {
            self.arm(grace_ms, Timer::NodeGrace { node_id, epoch });
        }
        Response::status(Status::Ok)
    }

    /// The node stayed away past its grace period: reboot its replicas elsewhere.
    pub(crate) fn node_grace_expired(&mut self, node_id: NodeId, epoch: u64) {
        let Some(node) = self.nodes.get(node_id) else {
            return;
        };
        if node.connected || node.epoch != epoch {
            debug!(node_id, epoch, "stale grace timer");
            return;
        }
        let keys: Vec<ReplicaKey> = node.replicas.iter().copied().collect();
        info!(node_id, replicas = keys.len(), "node grace expired, rescheduling");
        for key in keys {
            self.reset_replica(key);
            self.after_replica_stopped(key);
        }
        if let Some(drain) = self.drains.get_mut(&node_id) {
            drain.pending.clear();
        }
        self.continue_drain(node_id);
    }

    pub(crate) fn drain_node(&mut self, node_id: NodeId) -> Response {
        let Some(node) = self.nodes.get_mut(node_id) else {
            warn!(node_id, "drain of unknown node");
            return Response::Drain {
                status: Status::Error,
                movements: 0,
            };
        };
        if node.record.draining {
            return Response::Drain {
                status: Status::Already,
                movements: 0,
            };
        }
        node.record.draining = true;
        if let Err(e) = self.store.put_node(&node.record) {
            error!(node_id, error = %e, "failed to persist drain flag");
            node.record.draining = false;
            return Response::Drain {
                status: Status::Error,
                movements: 0,
            };
        }
        let pending: BTreeSet<ReplicaKey> = node
            .replicas
            .iter()
            .copied()
            .filter(|key| self.tablets.replica(*key).is_some_and(|r| r.is_placed()))
            .collect();
        let movements = pending.len();
        info!(node_id, movements, "draining node");
        self.drains.insert(
            node_id,
            DrainState {
                pending,
                moving: BTreeSet::new(),
                movements,
            },
        );
        self.continue_drain(node_id);
        Response::Drain {
            status: Status::Ok,
            movements,
        }
    }

    /// Start more moves off a draining node, or finish the drain.
    pub(crate) fn continue_drain(&mut self, node_id: NodeId) {
        let limit = self.config.node.max_drain_inflight.max(1);
        loop {
            let Some(drain) = self.drains.get_mut(&node_id) else {
                return;
            };
            if drain.moving.len() >= limit {
                return;
            }
            let Some(key) = drain.pending.pop_first() else {
                break;
            };
            let on_node = self
                .tablets
                .replica(key)
                .is_some_and(|r| r.node_id == node_id && r.is_placed());
            if !on_node {
                continue;
            }
            drain.moving.insert(key);
            self.stop_replica(key);
            self.enqueue(key);
        }
        let done = self
            .drains
            .get(&node_id)
            .is_some_and(|d| d.pending.is_empty() && d.moving.is_empty());
        if done {
            if let Some(drain) = self.drains.remove(&node_id) {
                info!(node_id, movements = drain.movements, "drain complete");
                self.notify(Notification::DrainComplete {
                    node_id,
                    movements: drain.movements,
                });
            }
        }
    }

    /// A replica moved by a drain came up elsewhere, or went away.
    pub(crate) fn on_drain_progress(&mut self, key: ReplicaKey) {
        let nodes: Vec<NodeId> = self
            .drains
            .iter_mut()
            .filter_map(|(node_id, drain)| drain.moving.remove(&key).then_some(*node_id))
            .collect();
        for node_id in nodes {
            self.continue_drain(node_id);
        }
    }

    pub(crate) fn set_node_down(&mut self, node_id: NodeId, down: bool) -> Response {
        let Some(node) = self.nodes.get_mut(node_id) else {
            return self.warn_unknown_node(node_id, "set down");
        };
        if node.record.down == down {
            return Response::status(Status::Already);
        }
        node.record.down = down;
        if let Err(e) = self.store.put_node(&node.record) {
            error!(node_id, error = %e, "failed to persist down flag");
            return Response::status(Status::Error);
        }
        info!(node_id, down, "node down flag changed");
        if !down {
            self.retry_waiting();
        }
        Response::status(Status::Ok)
    }

    pub(crate) fn set_node_freeze(&mut self, node_id: NodeId, freeze: bool) -> Response {
        let Some(node) = self.nodes.get_mut(node_id) else {
            return self.warn_unknown_node(node_id, "set freeze");
        };
        if node.record.freeze == freeze {
            return Response::status(Status::Already);
        }
        node.record.freeze = freeze;
        if let Err(e) = self.store.put_node(&node.record) {
            error!(node_id, error = %e, "failed to persist freeze flag");
            return Response::status(Status::Error);
        }
        info!(node_id, freeze, "node freeze flag changed");
        Response::status(Status::Ok)
    }

    pub(crate) fn update_bridge_state(
        &mut self,
        primary: PileId,
        promoted: Option<PileId>,
        disconnected: Vec<PileId>,
    ) -> Response {
        self.bridge = BridgeState {
            primary: Some(primary),
            promoted,
            disconnected: disconnected.into_iter().collect(),
        };
        info!(primary, ?promoted, disconnected = ?self.bridge.disconnected, "bridge state updated");
        self.retry_waiting();
        Response::status(Status::Ok)
    }

    pub(crate) fn tablet_metrics(
        &mut self,
        node_id: NodeId,
        reports: Vec<TabletUsage>,
        node_usage: Option<f64>,
        now_ms: u64,
    ) -> Response {
        if self.nodes.get(node_id).is_none() {
            return self.warn_unknown_node(node_id, "metrics");
        }
        for report in reports {
            let key = ReplicaKey {
                tablet_id: report.tablet_id,
                follower_id: report.follower_id,
            };
            match self.tablets.replica_mut(key) {
                Some(replica) if replica.node_id == node_id => replica.usage = Some(report.usage),
                _ => debug!(replica = %key, node_id, "metrics for replica not on node"),
            }
        }
        if let Some(usage) = node_usage {
            let window = self.config.node.usage_window_ms;
            if let Some(node) = self.nodes.get_mut(node_id) {
                node.record_usage(now_ms, usage, window);
            }
        }
        self.emergency_check(node_id, now_ms);
        self.retry_waiting();
        Response::status(Status::Ok)
    }
}
