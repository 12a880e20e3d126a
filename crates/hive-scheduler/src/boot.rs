//! Boot queue and the replica lifecycle driven by node status reports.
//!
//! ```text
//!            enqueue                 place()                 Running
//!  Unknown ──────────► BootQueue ─────────────► Booting ─────────────► Running
//!  Stopped                │  ▲                     │
//!                  no node│  │retry on register,   │BootFailed → backoff
//!                         ▼  │metrics, stop, timer │StorageFailed → new groups
//!                      WaitQueue ◄─────────────────┘
//! ```
//!
//! Entries pop in priority order (tablet type, leaders before followers),
//! FIFO within a priority.

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BinaryHeap, HashSet};

use hive_core::config::BootStrategy;
use hive_core::{
    ChannelHistoryEntry, NodeId, ObjectId, ReplicaKey, ResourceValues, TabletId,
    TabletType, VolatileState,
};
use hive_placement::{NodeView, PlacementRequest, SpreadConstraint, Unplaceable, place};
use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::hive::Hive;
use crate::messages::{BootCommand, NodeCommand, ReplicaStatus, Timer};
use crate::tablet::{Replica, Tablet};

#[derive(Debug, PartialEq, Eq)]
struct QueueEntry {
    priority: u32,
    seq: Reverse<u64>,
    key: ReplicaKey,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Replicas waiting for a node.
#[derive(Debug, Default)]
pub struct BootQueue {
    heap: BinaryHeap<QueueEntry>,
    queued: HashSet<ReplicaKey>,
    /// No node could take these; retried when capacity may have appeared.
    waiting: BTreeMap<ReplicaKey, u32>,
    /// Backing off after a failed boot: key → (due time, priority).
    delayed: BTreeMap<ReplicaKey, (u64, u32)>,
    seq: u64,
}

impl BootQueue {
    pub fn push(&mut self, key: ReplicaKey, priority: u32) {
        if self.contains(key) {
            return;
        }
        self.push_ready(key, priority);
    }

    fn push_ready(&mut self, key: ReplicaKey, priority: u32) {
        self.seq += 1;
        self.queued.insert(key);
        self.heap.push(QueueEntry {
            priority,
            seq: Reverse(self.seq),
            key,
        });
    }

    pub fn pop(&mut self) -> Option<(ReplicaKey, u32)> {
        while let Some(entry) = self.heap.pop() {
            if self.queued.remove(&entry.key) {
                return Some((entry.key, entry.priority));
            }
        }
        None
    }

    pub fn wait(&mut self, key: ReplicaKey, priority: u32) {
        self.waiting.insert(key, priority);
    }

    pub fn delay(&mut self, key: ReplicaKey, priority: u32, due_ms: u64) {
        self.queued.remove(&key);
        self.waiting.remove(&key);
        self.delayed.insert(key, (due_ms, priority));
    }

    /// Move every waiting replica back to the queue. Returns how many moved.
    pub fn release_waiting(&mut self) -> usize {
        let waiting = std::mem::take(&mut self.waiting);
        let count = waiting.len();
        for (key, priority) in waiting {
            self.push_ready(key, priority);
        }
        count
    }

    /// Queue delayed replicas whose backoff has elapsed.
    pub fn promote_due(&mut self, now_ms: u64) {
        let due: Vec<(ReplicaKey, u32)> = self
            .delayed
            .iter()
            .filter(|(_, (at, _))| *at <= now_ms)
            .map(|(key, (_, priority))| (*key, *priority))
            .collect();
        for (key, priority) in due {
            self.delayed.remove(&key);
            self.push_ready(key, priority);
        }
    }

    pub fn remove(&mut self, key: ReplicaKey) {
        self.queued.remove(&key);
        self.waiting.remove(&key);
        self.delayed.remove(&key);
    }

    pub fn contains(&self, key: ReplicaKey) -> bool {
        self.queued.contains(&key) || self.waiting.contains_key(&key) || self.delayed.contains_key(&key)
    }

    pub fn is_waiting(&self, key: ReplicaKey) -> bool {
        self.waiting.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }

    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }
}

/// Boot order: tablet type priority, leaders ahead of their followers.
pub(crate) fn boot_priority(tablet_type: TabletType, key: ReplicaKey) -> u32 {
    tablet_type.boot_priority() * 2 + u32::from(key.is_leader())
}

enum BootAttempt {
    Started,
    Skipped,
    Unplaceable,
}

impl Hive {
    /// Place queued replicas, bounded by the batch size and the number of
    /// boots already in flight.
    pub(crate) fn process_boot_queue(&mut self, now_ms: u64) {
        self.boot_queue.promote_due(now_ms);
        let batch = match self.config.boot.strategy {
            BootStrategy::Heavy => self.config.boot.max_boot_batch_size.max(1),
            BootStrategy::Balanced => 1,
        };
        let mut started = 0;
        let mut throttled = false;
        while started < batch {
            if self.booting.len() >= self.config.boot.max_tablets_scheduled {
                debug!(in_flight = self.booting.len(), "boot queue throttled");
                throttled = true;
                break;
            }
            let Some((key, priority)) = self.boot_queue.pop() else {
                break;
            };
            match self.try_boot(key, now_ms) {
                BootAttempt::Started => started += 1,
                BootAttempt::Skipped => {}
                BootAttempt::Unplaceable => self.boot_queue.wait(key, priority),
            }
        }
        if started > 0 {
            debug!(started, queued = self.boot_queue.len(), "boot batch processed");
        }
        // A throttled queue resumes when a boot completes.
        if self.boot_timer_armed || throttled {
            return;
        }
        if !self.boot_queue.is_empty() {
            self.boot_timer_armed = true;
            self.arm(0, Timer::ProcessBootQueue);
        } else if self.boot_queue.waiting_len() > 0 {
            self.boot_timer_armed = true;
            self.arm(self.config.boot.wait_queue_retry_ms, Timer::ProcessBootQueue);
        }
    }

    pub(crate) fn on_boot_timer(&mut self) {
        self.boot_timer_armed = false;
        self.boot_queue.release_waiting();
    }

    /// Put a replica in the queue if the hive should be running it.
    pub(crate) fn enqueue(&mut self, key: ReplicaKey) {
        let Some(tablet) = self.tablets.get(key.tablet_id) else {
            return;
        };
        if tablet.wants_boot(key.follower_id) {
            let priority = boot_priority(tablet.record.tablet_type, key);
            self.boot_queue.push(key, priority);
        }
    }

    pub(crate) fn enqueue_tablet(&mut self, tablet_id: TabletId) {
        let keys: Vec<ReplicaKey> = match self.tablets.get(tablet_id) {
            Some(tablet) => tablet.replicas().map(|r| r.key).collect(),
            None => return,
        };
        for key in keys {
            self.enqueue(key);
        }
    }

    /// Capacity may have appeared: give waiting replicas another chance.
    pub(crate) fn retry_waiting(&mut self) {
        let released = self.boot_queue.release_waiting();
        if released > 0 {
            debug!(released, "wait queue released");
        }
    }

    fn try_boot(&mut self, key: ReplicaKey, now_ms: u64) -> BootAttempt {
        match self.tablets.get(key.tablet_id) {
            Some(tablet) if tablet.wants_boot(key.follower_id) => {}
            _ => return BootAttempt::Skipped,
        }
        if !self.ensure_channel_groups(key.tablet_id, now_ms) {
            debug!(replica = %key, "no storage group available, waiting");
            return BootAttempt::Unplaceable;
        }
        let Some(request) = self.placement_request(key) else {
            return BootAttempt::Skipped;
        };
        let Some((tablet_type, object_id)) = self
            .tablets
            .get(key.tablet_id)
            .map(|t| (t.record.tablet_type, t.record.object_id))
        else {
            return BootAttempt::Skipped;
        };
        let views = self.node_views(tablet_type, object_id, now_ms);
        let placement = place(
            &views,
            &request,
            &self.config.boot.resource_weights,
            self.config.boot.node_select_strategy,
            &mut self.rng,
        );
        match placement {
            Ok(p) => {
                if self.start_boot(key, p.node_id) {
                    BootAttempt::Started
                } else {
                    BootAttempt::Skipped
                }
            }
            Err(reason) => {
                match reason {
                    Unplaceable::NoNodes => debug!(replica = %key, "no node in scope"),
                    Unplaceable::OverCapacity => debug!(replica = %key, "all nodes at capacity"),
                }
                BootAttempt::Unplaceable
            }
        }
    }

    /// Assign the replica to `node_id` and send the boot command.
    fn start_boot(&mut self, key: ReplicaKey, node_id: NodeId) -> bool {
        let Some(tablet) = self.tablets.get_mut(key.tablet_id) else {
            return false;
        };
        if key.is_leader() {
            tablet.record.generation += 1;
            tablet.record.node_id = node_id;
            if let Err(e) = self.store.put_tablet(&tablet.record) {
                error!(replica = %key, error = %e, "failed to persist boot generation");
                tablet.record.generation -= 1;
                return false;
            }
        } else if let Some(f) = tablet
            .record
            .followers
            .iter_mut()
            .find(|f| f.follower_id == key.follower_id)
        {
            f.node_id = node_id;
        }
        let generation = tablet.record.generation;
        let tablet_type = tablet.record.tablet_type;
        let channels = tablet.record.channels.clone();
        let Some(replica) = tablet.replica_mut(key.follower_id) else {
            return false;
        };
        replica.node_id = node_id;
        replica.state = VolatileState::Booting;
        replica.generation = generation;
        replica.preferred_node = None;
        let role = replica.role();
        self.nodes.attach(node_id, key);
        self.booting.insert(key);
        info!(replica = %key, node_id, generation, "booting replica");
        self.send_node(
            node_id,
            NodeCommand::Boot(BootCommand {
                tablet_id: key.tablet_id,
                follower_id: key.follower_id,
                role,
                generation,
                tablet_type,
                channels,
            }),
        );
        true
    }

    /// Give every channel of the tablet a storage group. Returns false if
    /// some channel still has none.
    pub(crate) fn ensure_channel_groups(&mut self, tablet_id: TabletId, now_ms: u64) -> bool {
        let Some(tablet) = self.tablets.get_mut(tablet_id) else {
            return false;
        };
        let mut changed = false;
        let mut complete = true;
        let from_generation = tablet.record.generation;
        for channel in &mut tablet.record.channels {
            if channel.current_group().is_some() {
                continue;
            }
            match self
                .storage
                .select_group(&channel.binding.storage_pool, None, now_ms)
            {
                Some(group_id) => {
                    channel.history.push(ChannelHistoryEntry {
                        from_generation,
                        group_id,
                        timestamp_ms: now_ms,
                    });
                    changed = true;
                }
                None => complete = false,
            }
        }
        if changed {
            if let Err(e) = self.store.put_tablet(&tablet.record) {
                error!(tablet_id, error = %e, "failed to persist channel groups");
            }
        }
        complete
    }

    /// Demand a replica places on its node.
    pub(crate) fn replica_demand(&self, tablet: &Tablet, replica: &Replica) -> ResourceValues {
        replica
            .usage
            .unwrap_or(tablet.record.declared_usage)
            .or_defaults(&self.config.boot.default_tablet_usage)
    }

    pub(crate) fn node_views(
        &self,
        tablet_type: TabletType,
        object_id: ObjectId,
        now_ms: u64,
    ) -> Vec<NodeView> {
        let defaults = &self.config.boot.default_node_max;
        self.nodes
            .iter()
            .map(|node| {
                let mut view = NodeView::new(node.node_id(), node.max(defaults));
                view.data_center = node.data_center().to_string();
                view.pile_rank = self.bridge.rank(node.pile()).unwrap_or(u32::MAX);
                view.serviced_domains = node.serviced_domains(self.config.root_domain);
                view.reported_usage = node.reported_usage();
                view.type_limit = node
                    .record
                    .type_limits
                    .get(&tablet_type)
                    .copied()
                    .unwrap_or_default();
                view.schedulable = self.nodes.is_schedulable(node.node_id(), now_ms, &self.bridge);
                for key in &node.replicas {
                    let Some(tablet) = self.tablets.get(key.tablet_id) else {
                        continue;
                    };
                    let Some(replica) = tablet.replica(key.follower_id) else {
                        continue;
                    };
                    view.usage = view.usage.saturating_add(&self.replica_demand(tablet, replica));
                    view.tablet_count += 1;
                    if tablet.record.tablet_type == tablet_type {
                        view.same_type_count += 1;
                    }
                    if object_id != 0 && tablet.record.object_id == object_id {
                        view.same_object_count += 1;
                    }
                }
                view
            })
            .collect()
    }

    /// Constraints for booting one replica.
    pub(crate) fn placement_request(&self, key: ReplicaKey) -> Option<PlacementRequest> {
        let tablet = self.tablets.get(key.tablet_id)?;
        let replica = tablet.replica(key.follower_id)?;
        let record = &tablet.record;
        let mut request = PlacementRequest {
            demand: self.replica_demand(tablet, replica),
            allowed_domains: self.effective_domains(record),
            allowed_node_ids: record.allowed_node_ids.clone(),
            allowed_data_centers: record.allowed_data_centers.clone(),
            data_center_preference: record.data_center_preference.clone(),
            spread: None,
            preferred_node: replica.preferred_node,
            exclude_nodes: Vec::new(),
        };
        let others: Vec<&Replica> = tablet
            .replicas()
            .filter(|r| r.key != key && r.is_placed())
            .collect();
        match replica.group_id.and_then(|g| record.follower_group(g)) {
            Some(group) => {
                let mut data_center_counts = BTreeMap::new();
                for other in others.iter().filter(|r| r.group_id == Some(group.id)) {
                    if let Some(node) = self.nodes.get(other.node_id) {
                        *data_center_counts
                            .entry(node.data_center().to_string())
                            .or_insert(0) += 1;
                    }
                }
                request.spread = Some(SpreadConstraint {
                    require_different_nodes: group.require_different_nodes,
                    occupied_nodes: others.iter().map(|r| r.node_id).collect(),
                    require_all_data_centers: group.require_all_data_centers,
                    per_data_center: group.follower_count_per_data_center,
                    data_center_counts,
                });
            }
            None => {
                if request.preferred_node.is_none() {
                    request.preferred_node = tablet.promotion_candidate();
                }
                let separate = record
                    .follower_groups
                    .iter()
                    .any(|g| g.require_different_nodes);
                if request.preferred_node.is_none() && separate {
                    request.spread = Some(SpreadConstraint {
                        require_different_nodes: true,
                        occupied_nodes: others.iter().map(|r| r.node_id).collect(),
                        ..Default::default()
                    });
                }
            }
        }
        Some(request)
    }

    // ── Status reports ─────────────────────────────────────────────

    pub(crate) fn on_tablet_status(
        &mut self,
        node_id: NodeId,
        key: ReplicaKey,
        generation: u32,
        status: ReplicaStatus,
        now_ms: u64,
    ) {
        let Some(replica) = self.tablets.replica(key) else {
            warn!(replica = %key, node_id, "status for unknown replica");
            return;
        };
        if replica.node_id != node_id || replica.generation != generation {
            warn!(
                replica = %key,
                node_id,
                generation,
                expected_node = replica.node_id,
                expected_generation = replica.generation,
                ?status,
                "stale status ignored"
            );
            return;
        }
        let state = replica.state;
        match status {
            ReplicaStatus::Running => self.on_replica_running(key, state),
            ReplicaStatus::Stopped => {
                debug!(replica = %key, node_id, "replica stopped");
                self.reset_replica(key);
                self.after_replica_stopped(key);
            }
            ReplicaStatus::BootFailed => self.on_boot_failed(key, node_id, now_ms),
            ReplicaStatus::StorageFailed => self.on_storage_failed(key, now_ms),
        }
    }

    fn on_replica_running(&mut self, key: ReplicaKey, state: VolatileState) {
        if state == VolatileState::Stopping {
            return;
        }
        if let Some(replica) = self.tablets.replica_mut(key) {
            replica.state = VolatileState::Running;
            replica.boot_failures = 0;
        }
        self.booting.remove(&key);
        info!(replica = %key, "replica running");
        self.balancer.moves.remove(&key);
        if key.is_leader() {
            self.storage_balancer.moves.remove(&key.tablet_id);
        }
        self.on_drain_progress(key);
    }

    /// Stopped, by request or not: finish a pending delete or boot again.
    pub(crate) fn after_replica_stopped(&mut self, key: ReplicaKey) {
        let deleting = self
            .tablets
            .get(key.tablet_id)
            .is_some_and(|t| t.record.deleting);
        if deleting {
            self.try_finalize_delete(key.tablet_id);
        } else {
            self.enqueue(key);
        }
        self.retry_waiting();
    }

    fn on_boot_failed(&mut self, key: ReplicaKey, node_id: NodeId, now_ms: u64) {
        self.reset_replica(key);
        let boot = &self.config.boot;
        if let Some(node) = self.nodes.get_mut(node_id) {
            node.record_failure(now_ms, boot.bad_node_failures, boot.bad_node_window_ms, boot.bad_node_skip_ms);
        }
        let Some(tablet) = self.tablets.get_mut(key.tablet_id) else {
            return;
        };
        let tablet_type = tablet.record.tablet_type;
        let Some(replica) = tablet.replica_mut(key.follower_id) else {
            return;
        };
        replica.boot_failures += 1;
        let failures = replica.boot_failures;
        let exponent = failures.saturating_sub(1).min(20);
        let base = boot
            .retry_min_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(boot.retry_max_delay_ms);
        let delay = (base as f64 * self.rng.gen_range(0.5..1.5)) as u64;
        warn!(replica = %key, node_id, failures, delay_ms = delay, "boot failed, backing off");
        if self.tablets.get(key.tablet_id).is_some_and(|t| t.wants_boot(key.follower_id)) {
            self.boot_queue
                .delay(key, boot_priority(tablet_type, key), now_ms + delay);
            self.arm(delay, Timer::ProcessBootQueue);
        }
    }

    /// The replica could not use its groups: move its channels elsewhere
    /// and boot again.
    fn on_storage_failed(&mut self, key: ReplicaKey, now_ms: u64) {
        self.reset_replica(key);
        let ineligible_until = now_ms + self.config.storage_balancer.group_ineligible_period_ms;
        if let Some(tablet) = self.tablets.get(key.tablet_id) {
            let groups: Vec<_> = tablet
                .record
                .channels
                .iter()
                .filter_map(|c| c.current_group())
                .collect();
            for group in groups {
                self.storage.mark_ineligible(group, ineligible_until);
            }
        }
        let renewed = self.renew_channels(key.tablet_id, &[], now_ms);
        warn!(replica = %key, renewed, "storage failure, channels renewed");
        self.enqueue(key);
    }

    /// Detach a replica from its node; it counts as stopped from now on.
    pub(crate) fn reset_replica(&mut self, key: ReplicaKey) -> Option<NodeId> {
        let replica = self.tablets.replica_mut(key)?;
        let node_id = replica.node_id;
        replica.node_id = 0;
        if replica.state != VolatileState::Migrating {
            replica.state = VolatileState::Stopped;
        }
        self.nodes.detach(node_id, key);
        self.booting.remove(&key);
        (node_id != 0).then_some(node_id)
    }

    /// Send a stop to the replica's node and detach it.
    pub(crate) fn stop_replica(&mut self, key: ReplicaKey) {
        let Some(replica) = self.tablets.replica(key) else {
            return;
        };
        if replica.node_id != 0 && replica.state.is_placed() {
            let (node_id, generation) = (replica.node_id, replica.generation);
            self.send_node(
                node_id,
                NodeCommand::Stop {
                    tablet_id: key.tablet_id,
                    follower_id: key.follower_id,
                    generation,
                },
            );
        }
        self.reset_replica(key);
    }

    /// Stop the leader so it boots again with the current channels.
    pub(crate) fn restart_leader(&mut self, tablet_id: TabletId) {
        let key = ReplicaKey::leader(tablet_id);
        let placed = self.tablets.replica(key).is_some_and(|r| r.is_placed());
        if placed {
            self.stop_replica(key);
        }
        self.enqueue(key);
        debug!(tablet_id, "leader restarted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_by_priority_then_fifo() {
        let mut queue = BootQueue::default();
        queue.push(ReplicaKey::follower(1, 1), 10);
        queue.push(ReplicaKey::leader(2), 21);
        queue.push(ReplicaKey::leader(3), 21);
        queue.push(ReplicaKey::leader(4), 201);
        let order: Vec<_> = std::iter::from_fn(|| queue.pop().map(|(k, _)| k.tablet_id)).collect();
        assert_eq!(order, vec![4, 2, 3, 1]);
    }

    #[test]
    fn duplicate_push_is_ignored() {
        let mut queue = BootQueue::default();
        let key = ReplicaKey::leader(1);
        queue.push(key, 1);
        queue.push(key, 1);
        assert_eq!(queue.len(), 1);
        assert!(queue.pop().is_some());
        assert!(queue.pop().is_none());
    }

    #[test]
    fn removed_entry_is_not_popped() {
        let mut queue = BootQueue::default();
        queue.push(ReplicaKey::leader(1), 1);
        queue.push(ReplicaKey::leader(2), 1);
        queue.remove(ReplicaKey::leader(1));
        assert_eq!(queue.pop().map(|(k, _)| k.tablet_id), Some(2));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn waiting_and_delayed_return_to_queue() {
        let mut queue = BootQueue::default();
        let waiting = ReplicaKey::leader(1);
        let delayed = ReplicaKey::leader(2);
        queue.wait(waiting, 1);
        queue.delay(delayed, 1, 100);
        assert!(queue.contains(waiting) && queue.contains(delayed));
        assert!(queue.is_empty());

        assert_eq!(queue.release_waiting(), 1);
        queue.promote_due(50);
        assert_eq!(queue.len(), 1);
        queue.promote_due(100);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn leaders_outrank_followers_of_same_type() {
        let leader = boot_priority(TabletType::DataShard, ReplicaKey::leader(1));
        let follower = boot_priority(TabletType::DataShard, ReplicaKey::follower(1, 1));
        assert!(leader > follower);
        let coordinator = boot_priority(TabletType::Coordinator, ReplicaKey::follower(1, 1));
        assert!(coordinator > leader);
    }
}
