//! Persisted records of the hive.
//!
//! Only the durable part of the scheduler lives here: tablet definitions
//! and their last known placement, node operator flags, domains,
//! migration progress and tombstones. Volatile replica state is rebuilt
//! on load.

use std::collections::BTreeMap;

use hive_core::{
    BalancerPolicy, ComputeMode, FollowerGroup, FollowerGroupId, FollowerId, Generation, HiveId,
    LockOwner, MigrationState, NodeId, NodeLocation, ObjectId, OwnerKey, ResourceValues,
    SubDomainKey, TabletChannel, TabletId, TabletType, TxId, TypeLimit,
};
use serde::{Deserialize, Serialize};

// ── Tablet ─────────────────────────────────────────────────────────

/// Durable definition and placement of one tablet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TabletRecord {
    pub tablet_id: TabletId,
    pub owner: OwnerKey,
    pub tablet_type: TabletType,
    pub channels: Vec<TabletChannel>,
    #[serde(default)]
    pub follower_groups: Vec<FollowerGroup>,
    #[serde(default)]
    pub followers: Vec<FollowerRecord>,
    #[serde(default)]
    pub generation: Generation,
    /// Node the leader was last placed on; 0 when unassigned.
    #[serde(default)]
    pub node_id: NodeId,
    #[serde(default)]
    pub object_id: ObjectId,
    #[serde(default)]
    pub object_domain: Option<SubDomainKey>,
    #[serde(default)]
    pub allowed_domains: Vec<SubDomainKey>,
    #[serde(default)]
    pub allowed_node_ids: Vec<NodeId>,
    #[serde(default)]
    pub allowed_data_centers: Vec<String>,
    /// Earlier entries are preferred.
    #[serde(default)]
    pub data_center_preference: Vec<String>,
    #[serde(default)]
    pub balancer_policy: BalancerPolicy,
    /// Resource usage declared at creation, overridden by reported metrics.
    #[serde(default)]
    pub declared_usage: ResourceValues,
    #[serde(default)]
    pub lock: Option<LockRecord>,
    #[serde(default)]
    pub deleting: bool,
    #[serde(default)]
    pub delete_tx: Option<TxId>,
    /// Set on a parent hive once a sub-hive has seized the tablet.
    #[serde(default)]
    pub seized_by: Option<HiveId>,
    #[serde(default)]
    pub last_reassign_ms: u64,
    #[serde(default)]
    pub created_at_ms: u64,
}

impl TabletRecord {
    pub fn new(tablet_id: TabletId, owner: OwnerKey, tablet_type: TabletType) -> Self {
        Self {
            tablet_id,
            owner,
            tablet_type,
            channels: Vec::new(),
            follower_groups: Vec::new(),
            followers: Vec::new(),
            generation: 0,
            node_id: 0,
            object_id: 0,
            object_domain: None,
            allowed_domains: Vec::new(),
            allowed_node_ids: Vec::new(),
            allowed_data_centers: Vec::new(),
            data_center_preference: Vec::new(),
            balancer_policy: BalancerPolicy::Balance,
            declared_usage: ResourceValues::default(),
            lock: None,
            deleting: false,
            delete_tx: None,
            seized_by: None,
            last_reassign_ms: 0,
            created_at_ms: 0,
        }
    }

    pub fn table_key(&self) -> String {
        self.tablet_id.to_string()
    }

    pub fn follower_group(&self, id: FollowerGroupId) -> Option<&FollowerGroup> {
        self.follower_groups.iter().find(|g| g.id == id)
    }

    /// Highest follower id in use, 0 when there are no followers.
    pub fn max_follower_id(&self) -> FollowerId {
        self.followers.iter().map(|f| f.follower_id).max().unwrap_or(0)
    }
}

/// A follower replica slot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct FollowerRecord {
    pub follower_id: FollowerId,
    pub group_id: FollowerGroupId,
    /// Last node the follower was placed on.
    #[serde(default)]
    pub node_id: NodeId,
}

/// Exclusive-execution lock held by an external owner.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockRecord {
    pub owner: LockOwner,
    /// Reconnect window after the owner's node disconnects.
    pub timeout_ms: Option<u64>,
    pub locked_at_ms: u64,
    /// Bumped on every acquisition; stale expiry timers compare against it.
    pub seq_no: u64,
}

// ── Tombstone ──────────────────────────────────────────────────────

/// What happened to an (owner, idx) identity that no longer has a row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Tombstone {
    Deleted { tablet_id: TabletId },
    /// Ownership moved to another hive; requests are forwarded there.
    Migrated { tablet_id: TabletId, hive_id: HiveId },
}

impl Tombstone {
    pub fn tablet_id(&self) -> TabletId {
        match self {
            Tombstone::Deleted { tablet_id } | Tombstone::Migrated { tablet_id, .. } => {
                *tablet_id
            }
        }
    }
}

// ── Node ───────────────────────────────────────────────────────────

/// Durable part of a node: registration data and operator flags.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeRecord {
    pub node_id: NodeId,
    #[serde(default)]
    pub location: NodeLocation,
    #[serde(default)]
    pub serviced_domains: Vec<SubDomainKey>,
    #[serde(default)]
    pub resource_max: ResourceValues,
    #[serde(default)]
    pub type_limits: BTreeMap<TabletType, TypeLimit>,
    #[serde(default)]
    pub down: bool,
    #[serde(default)]
    pub freeze: bool,
    #[serde(default)]
    pub draining: bool,
    #[serde(default)]
    pub registered_at_ms: u64,
}

impl NodeRecord {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            location: NodeLocation::default(),
            serviced_domains: Vec::new(),
            resource_max: ResourceValues::default(),
            type_limits: BTreeMap::new(),
            down: false,
            freeze: false,
            draining: false,
            registered_at_ms: 0,
        }
    }

    pub fn table_key(&self) -> String {
        self.node_id.to_string()
    }
}

// ── Domain ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DomainRecord {
    pub key: SubDomainKey,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub compute_mode: ComputeMode,
}

// ── Migration ──────────────────────────────────────────────────────

/// Which end of a migration this hive is.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MigrationRole {
    /// Gives tablets away to `peer_hive`.
    Parent,
    /// Pulls tablets from `peer_hive`.
    Child,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MigrationRecord {
    pub domain: SubDomainKey,
    pub role: MigrationRole,
    pub peer_hive: HiveId,
    pub state: MigrationState,
    /// Tablets transferred so far.
    #[serde(default)]
    pub migrated: u64,
    #[serde(default)]
    pub updated_at_ms: u64,
}

impl MigrationRecord {
    pub fn table_key(&self) -> String {
        self.domain.table_key()
    }
}
