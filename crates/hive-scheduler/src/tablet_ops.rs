//! Tablet definition requests: create, delete and in-place updates.

use hive_core::{
    BalancerPolicy, ChannelBinding, ChannelHistoryEntry, FollowerId, LockLostReason, MigrationState,
    ObjectId, OwnerId, OwnerKey, ReplicaKey, Status, TabletChannel, TabletId, TxId,
    VolatileState,
};
use hive_state::{FollowerRecord, MigrationRole, TabletRecord, Tombstone};
use tracing::{debug, error, info, warn};

use crate::hive::Hive;
use crate::messages::{CreateTablet, NodeCommand, Notification, Response};
use crate::tablet::{Replica, Tablet};

fn create_status(status: Status, tablet_id: TabletId) -> Response {
    Response::CreateTablet { status, tablet_id }
}

/// The request describes exactly what is stored.
fn same_definition(record: &TabletRecord, create: &CreateTablet) -> bool {
    record.tablet_type == create.tablet_type
        && record.channels.len() == create.channels.len()
        && record
            .channels
            .iter()
            .zip(&create.channels)
            .all(|(c, b)| c.binding == *b)
        && record.follower_groups == create.follower_groups
        && record.allowed_domains == create.allowed_domains
        && record.allowed_node_ids == create.allowed_node_ids
        && record.allowed_data_centers == create.allowed_data_centers
        && record.data_center_preference == create.data_center_preference
        && record.object_id == create.object_id
        && record.object_domain == create.object_domain
        && record.balancer_policy == create.balancer_policy
        && record.declared_usage == create.declared_usage
}

impl Hive {
    pub(crate) fn create_tablet(&mut self, create: CreateTablet, now_ms: u64) -> Response {
        let owner = create.owner;
        if owner.owner_id == 0 {
            return create_status(Status::InvalidOwner, 0);
        }
        if create.channels.is_empty() {
            warn!(%owner, "create without channels");
            return create_status(Status::Error, 0);
        }
        if let Some(hive_id) = create.object_domain.and_then(|d| self.delegated_to(d)) {
            debug!(%owner, hive_id, "create forwarded to sub-hive");
            return Response::Forward { hive_id };
        }
        match self.store.get_tombstone(owner) {
            Ok(Some(Tombstone::Deleted { tablet_id })) => {
                return create_status(Status::Blocked, tablet_id);
            }
            Ok(Some(Tombstone::Migrated { hive_id, .. })) => return Response::Forward { hive_id },
            Ok(None) => {}
            Err(e) => {
                error!(%owner, error = %e, "failed to read tombstone");
                return create_status(Status::Error, 0);
            }
        }
        if let Some(tablet_id) = self.tablets.by_owner(owner) {
            return self.update_existing(tablet_id, create, now_ms);
        }
        if let Some(migration) = create.object_domain.and_then(|d| self.migrations.get(&d)) {
            // The parent may still hold this identity.
            if migration.role == MigrationRole::Child && migration.state == MigrationState::InProgress {
                return Response::Forward {
                    hive_id: migration.peer_hive,
                };
            }
        }

        let tablet_id = match self.store.allocate_tablet_id(self.config.tablet_id_base) {
            Ok(id) => id,
            Err(e) => {
                error!(%owner, error = %e, "failed to allocate tablet id");
                return create_status(Status::Error, 0);
            }
        };
        let mut record = TabletRecord::new(tablet_id, owner, create.tablet_type);
        record.channels = create
            .channels
            .iter()
            .enumerate()
            .map(|(index, binding)| self.new_channel(index as u32, binding.clone(), 0, now_ms))
            .collect();
        record.follower_groups = create.follower_groups;
        record.allowed_domains = create.allowed_domains;
        record.allowed_node_ids = create.allowed_node_ids;
        record.allowed_data_centers = create.allowed_data_centers;
        record.data_center_preference = create.data_center_preference;
        record.object_id = create.object_id;
        record.object_domain = create.object_domain;
        record.balancer_policy = create.balancer_policy;
        record.declared_usage = create.declared_usage;
        record.created_at_ms = now_ms;
        let (followers, _) = self.plan_followers(&record);
        record.followers = followers;

        if let Err(e) = self.store.put_tablet(&record) {
            error!(tablet_id, %owner, error = %e, "failed to persist new tablet");
            return create_status(Status::Error, 0);
        }
        info!(
            tablet_id,
            %owner,
            tablet_type = %record.tablet_type,
            followers = record.followers.len(),
            "tablet created"
        );
        self.tablets.insert(Tablet::from_record(record));
        self.enqueue_tablet(tablet_id);
        create_status(Status::Ok, tablet_id)
    }

    /// A channel bound to `binding`, placed in its pool's emptiest group if
    /// the pool is known yet.
    fn new_channel(
        &self,
        index: u32,
        binding: ChannelBinding,
        from_generation: u32,
        now_ms: u64,
    ) -> TabletChannel {
        let mut channel = TabletChannel::new(index, binding);
        if let Some(group_id) = self
            .storage
            .select_group(&channel.binding.storage_pool, None, now_ms)
        {
            channel.history.push(ChannelHistoryEntry {
                from_generation,
                group_id,
                timestamp_ms: now_ms,
            });
        }
        channel
    }

    /// Followers each group should have: existing ones kept up to the
    /// desired count, new ones appended. Returns (followers, removed ids).
    fn plan_followers(&self, record: &TabletRecord) -> (Vec<FollowerRecord>, Vec<FollowerId>) {
        let data_centers = self.nodes.data_centers().len();
        let mut next_id = record.max_follower_id() + 1;
        let mut keep = Vec::new();
        let mut removed: Vec<FollowerId> = record
            .followers
            .iter()
            .filter(|f| record.follower_group(f.group_id).is_none())
            .map(|f| f.follower_id)
            .collect();
        for group in &record.follower_groups {
            let desired = group.desired_followers(data_centers) as usize;
            let existing: Vec<FollowerRecord> = record
                .followers
                .iter()
                .filter(|f| f.group_id == group.id)
                .copied()
                .collect();
            keep.extend(existing.iter().take(desired).copied());
            removed.extend(existing.iter().skip(desired).map(|f| f.follower_id));
            for _ in existing.len()..desired {
                keep.push(FollowerRecord {
                    follower_id: next_id,
                    group_id: group.id,
                    node_id: 0,
                });
                next_id += 1;
            }
        }
        (keep, removed)
    }

    /// Create for an identity that already exists.
    fn update_existing(&mut self, tablet_id: TabletId, create: CreateTablet, now_ms: u64) -> Response {
        let Some(tablet) = self.tablets.get(tablet_id) else {
            return create_status(Status::Error, tablet_id);
        };
        if let Some(hive_id) = tablet.record.seized_by {
            return Response::Forward { hive_id };
        }
        let record = &tablet.record;
        if record.deleting {
            return create_status(Status::Blocked, tablet_id);
        }
        if record.tablet_type != create.tablet_type {
            warn!(tablet_id, stored = %record.tablet_type, requested = %create.tablet_type, "create changes tablet type");
            return create_status(Status::Error, tablet_id);
        }
        if create.channels.len() < record.channels.len() {
            warn!(tablet_id, "create removes channels");
            return create_status(Status::Error, tablet_id);
        }
        if same_definition(record, &create) {
            return create_status(Status::Already, tablet_id);
        }

        let channels_changed = self.apply_channels(tablet_id, &create.channels, now_ms);
        let Some(tablet) = self.tablets.get_mut(tablet_id) else {
            return create_status(Status::Error, tablet_id);
        };
        let record = &mut tablet.record;
        record.follower_groups = create.follower_groups;
        record.allowed_domains = create.allowed_domains;
        record.allowed_node_ids = create.allowed_node_ids;
        record.allowed_data_centers = create.allowed_data_centers;
        record.data_center_preference = create.data_center_preference;
        record.object_id = create.object_id;
        record.object_domain = create.object_domain;
        record.balancer_policy = create.balancer_policy;
        record.declared_usage = create.declared_usage;
        self.sync_followers(tablet_id);
        if !self.persist_tablet(tablet_id) {
            return create_status(Status::Error, tablet_id);
        }
        info!(tablet_id, channels_changed, "tablet definition updated");
        if channels_changed {
            self.restart_leader(tablet_id);
        }
        self.enqueue_tablet(tablet_id);
        create_status(Status::Ok, tablet_id)
    }

    /// Rebind changed channels and append new ones. Returns whether anything
    /// changed. Does not persist.
    fn apply_channels(&mut self, tablet_id: TabletId, bindings: &[ChannelBinding], now_ms: u64) -> bool {
        let Some(tablet) = self.tablets.get(tablet_id) else {
            return false;
        };
        let from_generation = tablet.record.generation + 1;
        let current: Vec<ChannelBinding> = tablet
            .record
            .channels
            .iter()
            .map(|c| c.binding.clone())
            .collect();
        let mut rebound = Vec::new();
        for (index, binding) in bindings.iter().enumerate() {
            match current.get(index) {
                Some(existing) if existing == binding => {}
                _ => rebound.push(self.new_channel(index as u32, binding.clone(), from_generation, now_ms)),
            }
        }
        if rebound.is_empty() {
            return false;
        }
        let Some(tablet) = self.tablets.get_mut(tablet_id) else {
            return false;
        };
        for fresh in rebound {
            match tablet
                .record
                .channels
                .iter_mut()
                .find(|c| c.index == fresh.index)
            {
                Some(channel) => {
                    channel.binding = fresh.binding;
                    channel.history.extend(fresh.history);
                }
                None => tablet.record.channels.push(fresh),
            }
        }
        tablet.record.last_reassign_ms = now_ms;
        true
    }

    /// Bring the follower replicas in line with the follower groups.
    fn sync_followers(&mut self, tablet_id: TabletId) {
        let Some(tablet) = self.tablets.get(tablet_id) else {
            return;
        };
        let (followers, removed) = self.plan_followers(&tablet.record);
        for follower_id in &removed {
            let key = ReplicaKey::follower(tablet_id, *follower_id);
            self.boot_queue.remove(key);
            self.balancer.moves.remove(&key);
            self.stop_replica(key);
            self.on_drain_progress(key);
        }
        let Some(tablet) = self.tablets.get_mut(tablet_id) else {
            return;
        };
        for follower_id in removed {
            tablet.followers.remove(&follower_id);
        }
        for f in &followers {
            tablet
                .followers
                .entry(f.follower_id)
                .or_insert_with(|| Replica::follower(tablet_id, f.follower_id, f.group_id));
        }
        tablet.record.followers = followers;
    }

    pub(crate) fn update_tablet_channels(
        &mut self,
        tablet_id: TabletId,
        channels: Vec<ChannelBinding>,
        now_ms: u64,
    ) -> Response {
        let current = match self.live_tablet(tablet_id) {
            Ok(tablet) => tablet.record.channels.len(),
            Err(response) => return response,
        };
        if channels.len() < current {
            warn!(tablet_id, "channel update removes channels");
            return Response::status(Status::Error);
        }
        if !self.apply_channels(tablet_id, &channels, now_ms) {
            return Response::status(Status::Already);
        }
        if !self.persist_tablet(tablet_id) {
            return Response::status(Status::Error);
        }
        info!(tablet_id, channels = channels.len(), "tablet channels updated");
        self.restart_leader(tablet_id);
        Response::status(Status::Ok)
    }

    pub(crate) fn update_object_id(&mut self, tablet_id: TabletId, object_id: ObjectId) -> Response {
        let current = match self.live_tablet(tablet_id) {
            Ok(tablet) => tablet.record.object_id,
            Err(response) => return response,
        };
        if current == object_id {
            return Response::status(Status::Already);
        }
        if let Some(tablet) = self.tablets.get_mut(tablet_id) {
            tablet.record.object_id = object_id;
        }
        if !self.persist_tablet(tablet_id) {
            return Response::status(Status::Error);
        }
        Response::status(Status::Ok)
    }

    pub(crate) fn set_balancer_policy(&mut self, tablet_id: TabletId, policy: BalancerPolicy) -> Response {
        let current = match self.live_tablet(tablet_id) {
            Ok(tablet) => tablet.record.balancer_policy,
            Err(response) => return response,
        };
        if current == policy {
            return Response::status(Status::Already);
        }
        if let Some(tablet) = self.tablets.get_mut(tablet_id) {
            tablet.record.balancer_policy = policy;
        }
        if !self.persist_tablet(tablet_id) {
            return Response::status(Status::Error);
        }
        debug!(tablet_id, ?policy, "balancer policy set");
        Response::status(Status::Ok)
    }

    // ── Delete ─────────────────────────────────────────────────────

    pub(crate) fn delete_tablet(&mut self, owner: OwnerKey, tx_id: TxId) -> Response {
        if let Some(tablet_id) = self.tablets.by_owner(owner) {
            let Some(tablet) = self.tablets.get(tablet_id) else {
                return Response::status(Status::Error);
            };
            if let Some(hive_id) = tablet.record.seized_by {
                return Response::Forward { hive_id };
            }
            if tablet.record.deleting {
                return Response::status(Status::Already);
            }
            return self.start_delete(tablet_id, tx_id);
        }
        match self.store.get_tombstone(owner) {
            Ok(Some(Tombstone::Migrated { hive_id, .. })) => Response::Forward { hive_id },
            Ok(_) => Response::status(Status::Already),
            Err(e) => {
                error!(%owner, error = %e, "failed to read tombstone");
                Response::status(Status::Error)
            }
        }
    }

    pub(crate) fn delete_owner_tablets(&mut self, owner_id: OwnerId, tx_id: TxId) -> Response {
        let ids: Vec<TabletId> = self
            .tablets
            .owned_by(owner_id)
            .into_iter()
            .filter(|id| {
                self.tablets
                    .get(*id)
                    .is_some_and(|t| !t.record.deleting && !t.is_migrating())
            })
            .collect();
        if ids.is_empty() {
            return Response::status(Status::Already);
        }
        info!(owner_id, tablets = ids.len(), "deleting owner tablets");
        for tablet_id in ids {
            if !self.start_delete(tablet_id, tx_id).status_code().is_success() {
                return Response::status(Status::Error);
            }
        }
        Response::status(Status::Ok)
    }

    /// Mark the tablet deleting, release its lock and stop its replicas.
    /// The row goes away once nothing is left booting.
    fn start_delete(&mut self, tablet_id: TabletId, tx_id: TxId) -> Response {
        let Some(tablet) = self.tablets.get_mut(tablet_id) else {
            return Response::status(Status::Error);
        };
        tablet.record.deleting = true;
        tablet.record.delete_tx = Some(tx_id);
        let lock = tablet.record.lock.take();
        if let Err(e) = self.store.put_tablet(&tablet.record) {
            error!(tablet_id, error = %e, "failed to persist delete");
            tablet.record.deleting = false;
            tablet.record.delete_tx = None;
            tablet.record.lock = lock;
            return Response::status(Status::Error);
        }
        info!(tablet_id, tx_id, "tablet deleting");
        if let Some(lock) = lock {
            self.notify(Notification::LockLost {
                tablet_id,
                owner: lock.owner,
                reason: LockLostReason::TabletDeleted,
            });
        }
        let keys: Vec<(ReplicaKey, VolatileState)> = tablet_keys(self.tablets.get(tablet_id));
        for (key, state) in keys {
            self.boot_queue.remove(key);
            self.balancer.moves.remove(&key);
            self.on_drain_progress(key);
            match state {
                // Wait for the node to confirm the stop of an in-flight boot.
                VolatileState::Booting => self.stop_in_flight(key),
                _ => self.stop_replica(key),
            }
        }
        self.storage_balancer.moves.remove(&tablet_id);
        self.try_finalize_delete(tablet_id);
        Response::status(Status::Ok)
    }

    fn stop_in_flight(&mut self, key: ReplicaKey) {
        let Some(replica) = self.tablets.replica_mut(key) else {
            return;
        };
        replica.state = VolatileState::Stopping;
        let (node_id, generation) = (replica.node_id, replica.generation);
        self.booting.remove(&key);
        self.send_node(
            node_id,
            NodeCommand::Stop {
                tablet_id: key.tablet_id,
                follower_id: key.follower_id,
                generation,
            },
        );
    }

    /// Remove a deleting tablet once none of its replicas is still stopping.
    pub(crate) fn try_finalize_delete(&mut self, tablet_id: TabletId) {
        let Some(tablet) = self.tablets.get(tablet_id) else {
            return;
        };
        if !tablet.record.deleting {
            return;
        }
        if tablet.replicas().any(|r| r.state == VolatileState::Stopping) {
            debug!(tablet_id, "delete waits for in-flight boots");
            return;
        }
        let owner = tablet.record.owner;
        let tx_id = tablet.record.delete_tx;
        if let Err(e) = self.store.delete_tablet(tablet_id, owner) {
            error!(tablet_id, error = %e, "failed to remove deleted tablet");
            return;
        }
        if let Some(tablet) = self.tablets.remove(tablet_id) {
            for replica in tablet.replicas() {
                self.nodes.detach(replica.node_id, replica.key);
            }
        }
        info!(tablet_id, %owner, "tablet deleted");
        self.notify(Notification::TabletDeleted {
            tablet_id,
            owner,
            tx_id,
        });
    }
}

fn tablet_keys(tablet: Option<&Tablet>) -> Vec<(ReplicaKey, VolatileState)> {
    tablet
        .map(|t| t.replicas().map(|r| (r.key, r.state)).collect())
        .unwrap_or_default()
}
