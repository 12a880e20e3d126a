//! Tablet registry: persisted definitions plus volatile replica state.

use std::collections::{BTreeMap, HashMap};

use hive_core::{
    FollowerGroupId, FollowerId, Generation, LEADER, NodeId, OwnerId, OwnerKey, ReplicaKey,
    ReplicaRole, ResourceValues, TabletId, VolatileState,
};
use hive_state::TabletRecord;

/// Volatile state of a leader or follower replica.
#[derive(Debug, Clone)]
pub struct Replica {
    pub key: ReplicaKey,
    /// `None` for the leader.
    pub group_id: Option<FollowerGroupId>,
    pub node_id: NodeId,
    pub state: VolatileState,
    /// Generation the replica was last booted with.
    pub generation: Generation,
    /// Last usage reported by the hosting node.
    pub usage: Option<ResourceValues>,
    pub last_moved_ms: Option<u64>,
    pub boot_failures: u32,
    /// Placement hint consumed by the next boot.
    pub preferred_node: Option<NodeId>,
}

impl Replica {
    pub fn leader(tablet_id: TabletId) -> Self {
        Self::new(ReplicaKey::leader(tablet_id), None)
    }

    pub fn follower(tablet_id: TabletId, follower_id: FollowerId, group_id: FollowerGroupId) -> Self {
        Self::new(ReplicaKey::follower(tablet_id, follower_id), Some(group_id))
    }

    fn new(key: ReplicaKey, group_id: Option<FollowerGroupId>) -> Self {
        Self {
            key,
            group_id,
            node_id: 0,
            state: VolatileState::Unknown,
            generation: 0,
            usage: None,
            last_moved_ms: None,
            boot_failures: 0,
            preferred_node: None,
        }
    }

    pub fn role(&self) -> ReplicaRole {
        match self.group_id {
            None => ReplicaRole::Leader,
            Some(group_id) => ReplicaRole::Follower {
                group_id,
                follower_id: self.key.follower_id,
            },
        }
    }

    pub fn is_placed(&self) -> bool {
        self.node_id != 0 && self.state.is_placed()
    }
}

/// A tablet: its durable record and the replicas derived from it.
#[derive(Debug, Clone)]
pub struct Tablet {
    pub record: TabletRecord,
    pub leader: Replica,
    pub followers: BTreeMap<FollowerId, Replica>,
    /// Lock owner's node is gone and the reconnect window is running.
    pub lock_expiry_pending: bool,
}

impl Tablet {
    /// Build volatile state for a record. Placement is not restored: every
    /// replica starts `Unknown` and goes through the boot queue.
    pub fn from_record(record: TabletRecord) -> Self {
        let tablet_id = record.tablet_id;
        let followers = record
            .followers
            .iter()
            .map(|f| (f.follower_id, Replica::follower(tablet_id, f.follower_id, f.group_id)))
            .collect();
        let mut leader = Replica::leader(tablet_id);
        leader.generation = record.generation;
        let migrating = record.seized_by.is_some();
        let mut tablet = Self {
            record,
            leader,
            followers,
            lock_expiry_pending: false,
        };
        if migrating {
            for replica in tablet.replicas_mut() {
                replica.state = VolatileState::Migrating;
            }
        }
        tablet
    }

    pub fn id(&self) -> TabletId {
        self.record.tablet_id
    }

    pub fn replica(&self, follower_id: FollowerId) -> Option<&Replica> {
        if follower_id == LEADER {
            Some(&self.leader)
        } else {
            self.followers.get(&follower_id)
        }
    }

    pub fn replica_mut(&mut self, follower_id: FollowerId) -> Option<&mut Replica> {
        if follower_id == LEADER {
            Some(&mut self.leader)
        } else {
            self.followers.get_mut(&follower_id)
        }
    }

    pub fn replicas(&self) -> impl Iterator<Item = &Replica> {
        std::iter::once(&self.leader).chain(self.followers.values())
    }

    pub fn replicas_mut(&mut self) -> impl Iterator<Item = &mut Replica> {
        std::iter::once(&mut self.leader).chain(self.followers.values_mut())
    }

    pub fn is_locked(&self) -> bool {
        self.record.lock.is_some()
    }

    pub fn is_migrating(&self) -> bool {
        self.record.seized_by.is_some()
    }

    /// Whether the follower is started on demand by its client node.
    pub fn is_local_only(&self, follower_id: FollowerId) -> bool {
        self.followers
            .get(&follower_id)
            .and_then(|f| f.group_id)
            .and_then(|g| self.record.follower_group(g))
            .is_some_and(|g| g.local_node_only)
    }

    /// The hive should be trying to run this replica.
    pub fn wants_boot(&self, follower_id: FollowerId) -> bool {
        if self.record.deleting || self.is_migrating() || self.is_local_only(follower_id) {
            return false;
        }
        if follower_id == LEADER && self.is_locked() {
            return false;
        }
        self.replica(follower_id).is_some_and(|r| !r.is_placed())
    }

    /// Node of a running follower whose group allows leader promotion.
    pub fn promotion_candidate(&self) -> Option<NodeId> {
        self.followers
            .values()
            .filter(|f| f.state == VolatileState::Running && f.node_id != 0)
            .find(|f| {
                f.group_id
                    .and_then(|g| self.record.follower_group(g))
                    .is_some_and(|g| g.allow_leader_promotion)
            })
            .map(|f| f.node_id)
    }

    /// Leader state, reported as the tablet's state.
    pub fn state(&self) -> VolatileState {
        if self.record.deleting {
            VolatileState::Deleted
        } else {
            self.leader.state
        }
    }
}

#[derive(Debug, Default)]
pub struct TabletRegistry {
    tablets: BTreeMap<TabletId, Tablet>,
    by_owner: HashMap<OwnerKey, TabletId>,
}

impl TabletRegistry {
    pub fn insert(&mut self, tablet: Tablet) {
        self.by_owner.insert(tablet.record.owner, tablet.id());
        self.tablets.insert(tablet.id(), tablet);
    }

    pub fn remove(&mut self, tablet_id: TabletId) -> Option<Tablet> {
        let tablet = self.tablets.remove(&tablet_id)?;
        self.by_owner.remove(&tablet.record.owner);
        Some(tablet)
    }

    pub fn get(&self, tablet_id: TabletId) -> Option<&Tablet> {
        self.tablets.get(&tablet_id)
    }

    pub fn get_mut(&mut self, tablet_id: TabletId) -> Option<&mut Tablet> {
        self.tablets.get_mut(&tablet_id)
    }

    pub fn contains(&self, tablet_id: TabletId) -> bool {
        self.tablets.contains_key(&tablet_id)
    }

    pub fn by_owner(&self, owner: OwnerKey) -> Option<TabletId> {
        self.by_owner.get(&owner).copied()
    }

    pub fn owned_by(&self, owner_id: OwnerId) -> Vec<TabletId> {
        self.tablets
            .values()
            .filter(|t| t.record.owner.owner_id == owner_id)
            .map(|t| t.id())
            .collect()
    }

    pub fn replica(&self, key: ReplicaKey) -> Option<&Replica> {
        self.tablets.get(&key.tablet_id)?.replica(key.follower_id)
    }

    pub fn replica_mut(&mut self, key: ReplicaKey) -> Option<&mut Replica> {
        self.tablets.get_mut(&key.tablet_id)?.replica_mut(key.follower_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tablet> {
        self.tablets.values()
    }

    pub fn ids(&self) -> Vec<TabletId> {
        self.tablets.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.tablets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tablets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_core::{FollowerGroup, LockOwner, TabletType};
    use hive_state::{FollowerRecord, LockRecord};

    fn record_with_followers() -> TabletRecord {
        let mut record = TabletRecord::new(10, OwnerKey::new(1, 0), TabletType::DataShard);
        record.follower_groups = vec![
            FollowerGroup {
                id: 1,
                follower_count: 1,
                allow_leader_promotion: true,
                ..Default::default()
            },
            FollowerGroup {
                id: 2,
                follower_count: 1,
                local_node_only: true,
                ..Default::default()
            },
        ];
        record.followers = vec![
            FollowerRecord {
                follower_id: 1,
                group_id: 1,
                node_id: 0,
            },
            FollowerRecord {
                follower_id: 2,
                group_id: 2,
                node_id: 0,
            },
        ];
        record
    }

    #[test]
    fn from_record_builds_replicas() {
        let tablet = Tablet::from_record(record_with_followers());
        assert_eq!(tablet.replicas().count(), 3);
        assert!(tablet.replica(1).unwrap().role() != ReplicaRole::Leader);
        assert!(tablet.wants_boot(LEADER));
        assert!(tablet.wants_boot(1));
        assert!(!tablet.wants_boot(2));
    }

    #[test]
    fn locked_leader_is_not_booted() {
        let mut record = record_with_followers();
        record.lock = Some(LockRecord {
            owner: LockOwner {
                node_id: 1,
                actor_id: 1,
            },
            timeout_ms: None,
            locked_at_ms: 0,
            seq_no: 1,
        });
        let tablet = Tablet::from_record(record);
        assert!(!tablet.wants_boot(LEADER));
        assert!(tablet.wants_boot(1));
    }

    #[test]
    fn promotion_requires_running_follower() {
        let mut tablet = Tablet::from_record(record_with_followers());
        assert_eq!(tablet.promotion_candidate(), None);
        let follower = tablet.replica_mut(1).unwrap();
        follower.node_id = 4;
        follower.state = VolatileState::Running;
        assert_eq!(tablet.promotion_candidate(), Some(4));
    }

    #[test]
    fn registry_indexes_owner() {
        let mut registry = TabletRegistry::default();
        registry.insert(Tablet::from_record(record_with_followers()));
        assert_eq!(registry.by_owner(OwnerKey::new(1, 0)), Some(10));
        assert_eq!(registry.owned_by(1), vec![10]);
        assert!(registry.remove(10).is_some());
        assert_eq!(registry.by_owner(OwnerKey::new(1, 0)), None);
        assert!(registry.is_empty());
    }
}
