//! Shared types used across hive crates.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Globally unique tablet identifier.
pub type TabletId = u64;

/// Worker node identifier. `0` means "no node".
pub type NodeId = u32;

/// Identity of the entity that asked for a tablet to exist.
pub type OwnerId = u64;

/// Follower replica identifier. `0` is reserved for the leader.
pub type FollowerId = u32;

pub type FollowerGroupId = u32;

/// Groups related tablets for anti-affinity.
pub type ObjectId = u64;

/// Storage group identifier.
pub type GroupId = u32;

/// Identifier of a scheduler instance (its own tablet id).
pub type HiveId = u64;

pub type TxId = u64;

pub type Generation = u32;

/// Bridge pile (region) identifier.
pub type PileId = u32;

/// Follower id used to address the leader replica.
pub const LEADER: FollowerId = 0;

// ── Identity ──────────────────────────────────────────────────────

/// Key of a (sub-)database the hive can place tablets for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubDomainKey {
    pub owner_id: u64,
    pub path_id: u64,
}

impl SubDomainKey {
    pub const fn new(owner_id: u64, path_id: u64) -> Self {
        Self { owner_id, path_id }
    }

    /// Key used in persisted tables.
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.owner_id, self.path_id)
    }
}

impl fmt::Display for SubDomainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.owner_id, self.path_id)
    }
}

/// The (owner, index) pair a tablet is created under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OwnerKey {
    pub owner_id: OwnerId,
    pub owner_idx: u64,
}

impl OwnerKey {
    pub const fn new(owner_id: OwnerId, owner_idx: u64) -> Self {
        Self { owner_id, owner_idx }
    }

    pub fn table_key(&self) -> String {
        format!("{}:{}", self.owner_id, self.owner_idx)
    }
}

impl fmt::Display for OwnerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.owner_id, self.owner_idx)
    }
}

/// Address of a single replica: the leader or one follower.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicaKey {
    pub tablet_id: TabletId,
    pub follower_id: FollowerId,
}

impl ReplicaKey {
    pub const fn leader(tablet_id: TabletId) -> Self {
        Self {
            tablet_id,
            follower_id: LEADER,
        }
    }

    pub const fn follower(tablet_id: TabletId, follower_id: FollowerId) -> Self {
        Self {
            tablet_id,
            follower_id,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.follower_id == LEADER
    }
}

impl fmt::Display for ReplicaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_leader() {
            write!(f, "{}", self.tablet_id)
        } else {
            write!(f, "{}.{}", self.tablet_id, self.follower_id)
        }
    }
}

/// External identity holding an execution lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockOwner {
    /// Node the owner lives on.
    pub node_id: NodeId,
    pub actor_id: u64,
}

impl fmt::Display for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node_id, self.actor_id)
    }
}

// ── Tablet ────────────────────────────────────────────────────────

/// Kind of tablet being scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TabletType {
    SchemeShard,
    Hive,
    Coordinator,
    Mediator,
    TxAllocator,
    DataShard,
    ColumnShard,
    PersQueue,
    PersQueueReadBalancer,
    KeyValue,
    SequenceShard,
    BlobDepot,
    Dummy,
}

impl TabletType {
    /// Boot queue priority; system tablets come up first.
    pub fn boot_priority(self) -> u32 {
        match self {
            TabletType::SchemeShard | TabletType::Hive => 100,
            TabletType::Coordinator | TabletType::Mediator | TabletType::TxAllocator => 80,
            TabletType::BlobDepot => 60,
            TabletType::PersQueueReadBalancer | TabletType::SequenceShard => 40,
            TabletType::DataShard
            | TabletType::ColumnShard
            | TabletType::PersQueue
            | TabletType::KeyValue => 20,
            TabletType::Dummy => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TabletType::SchemeShard => "scheme_shard",
            TabletType::Hive => "hive",
            TabletType::Coordinator => "coordinator",
            TabletType::Mediator => "mediator",
            TabletType::TxAllocator => "tx_allocator",
            TabletType::DataShard => "data_shard",
            TabletType::ColumnShard => "column_shard",
            TabletType::PersQueue => "pers_queue",
            TabletType::PersQueueReadBalancer => "pers_queue_read_balancer",
            TabletType::KeyValue => "key_value",
            TabletType::SequenceShard => "sequence_shard",
            TabletType::BlobDepot => "blob_depot",
            TabletType::Dummy => "dummy",
        }
    }
}

impl fmt::Display for TabletType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage pool a channel is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelBinding {
    pub storage_pool: String,
}

impl ChannelBinding {
    pub fn new(storage_pool: impl Into<String>) -> Self {
        Self {
            storage_pool: storage_pool.into(),
        }
    }
}

/// One storage group assignment in a channel's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelHistoryEntry {
    /// First tablet generation that writes to this group.
    pub from_generation: Generation,
    pub group_id: GroupId,
    pub timestamp_ms: u64,
}

/// A storage channel of a tablet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletChannel {
    pub index: u32,
    pub binding: ChannelBinding,
    #[serde(default)]
    pub history: Vec<ChannelHistoryEntry>,
}

impl TabletChannel {
    pub fn new(index: u32, binding: ChannelBinding) -> Self {
        Self {
            index,
            binding,
            history: Vec::new(),
        }
    }

    /// Group the channel currently writes to.
    pub fn current_group(&self) -> Option<GroupId> {
        self.history.last().map(|e| e.group_id)
    }
}

/// Placement policy for a group of follower replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FollowerGroup {
    pub id: FollowerGroupId,
    pub follower_count: u32,
    pub require_all_data_centers: bool,
    /// Followers per data center when `require_all_data_centers` is set.
    pub follower_count_per_data_center: u32,
    pub require_different_nodes: bool,
    pub allow_leader_promotion: bool,
    /// Followers are started on demand by the client node, never by the hive.
    pub local_node_only: bool,
}

impl Default for FollowerGroup {
    fn default() -> Self {
        Self {
            id: 0,
            follower_count: 0,
            require_all_data_centers: false,
            follower_count_per_data_center: 1,
            require_different_nodes: false,
            allow_leader_promotion: false,
            local_node_only: false,
        }
    }
}

impl FollowerGroup {
    /// Number of followers this group wants given the known data centers.
    pub fn desired_followers(&self, data_centers: usize) -> u32 {
        if self.require_all_data_centers {
            self.follower_count_per_data_center
                .saturating_mul(data_centers.max(1) as u32)
        } else {
            self.follower_count
        }
    }
}

/// Role of a replica, sent to nodes with every boot command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum ReplicaRole {
    Leader,
    Follower {
        group_id: FollowerGroupId,
        follower_id: FollowerId,
    },
}

impl ReplicaRole {
    pub fn follower_id(&self) -> FollowerId {
        match self {
            ReplicaRole::Leader => LEADER,
            ReplicaRole::Follower { follower_id, .. } => *follower_id,
        }
    }

    pub fn is_leader(&self) -> bool {
        matches!(self, ReplicaRole::Leader)
    }
}

/// Volatile lifecycle state of a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolatileState {
    Unknown,
    Booting,
    Running,
    Stopping,
    Stopped,
    Migrating,
    Deleted,
}

impl VolatileState {
    /// The replica occupies a node slot.
    pub fn is_placed(self) -> bool {
        matches!(self, VolatileState::Booting | VolatileState::Running)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancerPolicy {
    #[default]
    Balance,
    Ignore,
}

/// Why an execution lock was released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockLostReason {
    Unlocked,
    NewLock,
    NodeDisconnected,
    HiveRestart,
    TabletDeleted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    #[default]
    NotReady,
    Ready,
    InProgress,
    Complete,
}

/// Where tablets of a serverless database run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputeMode {
    /// On the nodes of the shared database.
    #[default]
    Shared,
    /// On the database's own nodes.
    Dedicated,
}

/// Protocol-level outcome carried in replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ok,
    Already,
    Blocked,
    Error,
    InvalidOwner,
    NotReady,
}

impl Status {
    pub fn is_success(self) -> bool {
        matches!(self, Status::Ok | Status::Already)
    }
}

// ── Resources ─────────────────────────────────────────────────────

/// A resource dimension the scheduler balances on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Cpu,
    Memory,
    Network,
    Counter,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Cpu,
        ResourceKind::Memory,
        ResourceKind::Network,
        ResourceKind::Counter,
    ];
}

/// Raw resource values: usage of a tablet, sum over a node, or a maximum.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceValues {
    /// CPU, microseconds per second.
    pub cpu: u64,
    pub memory: u64,
    /// Network, bytes per second.
    pub network: u64,
    /// Abstract counter; every tablet counts 1 unless it reports otherwise.
    pub counter: u64,
}

impl ResourceValues {
    pub const fn new(cpu: u64, memory: u64, network: u64, counter: u64) -> Self {
        Self {
            cpu,
            memory,
            network,
            counter,
        }
    }

    pub fn get(&self, kind: ResourceKind) -> u64 {
        match kind {
            ResourceKind::Cpu => self.cpu,
            ResourceKind::Memory => self.memory,
            ResourceKind::Network => self.network,
            ResourceKind::Counter => self.counter,
        }
    }

    pub fn saturating_add(&self, other: &ResourceValues) -> ResourceValues {
        ResourceValues {
            cpu: self.cpu.saturating_add(other.cpu),
            memory: self.memory.saturating_add(other.memory),
            network: self.network.saturating_add(other.network),
            counter: self.counter.saturating_add(other.counter),
        }
    }

    pub fn saturating_sub(&self, other: &ResourceValues) -> ResourceValues {
        ResourceValues {
            cpu: self.cpu.saturating_sub(other.cpu),
            memory: self.memory.saturating_sub(other.memory),
            network: self.network.saturating_sub(other.network),
            counter: self.counter.saturating_sub(other.counter),
        }
    }

    /// Replace zero fields with values from `fallback`.
    pub fn or_defaults(&self, fallback: &ResourceValues) -> ResourceValues {
        let pick = |v: u64, d: u64| if v == 0 { d } else { v };
        ResourceValues {
            cpu: pick(self.cpu, fallback.cpu),
            memory: pick(self.memory, fallback.memory),
            network: pick(self.network, fallback.network),
            counter: pick(self.counter, fallback.counter),
        }
    }

    /// `self[kind] / max[kind]`, 0 when the maximum is unknown.
    pub fn normalized(&self, max: &ResourceValues, kind: ResourceKind) -> f64 {
        let m = max.get(kind);
        if m == 0 {
            0.0
        } else {
            self.get(kind) as f64 / m as f64
        }
    }
}

/// Relative weight of each dimension in placement scores.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceWeights {
    pub cpu: f64,
    pub memory: f64,
    pub network: f64,
    pub counter: f64,
}

impl Default for ResourceWeights {
    fn default() -> Self {
        Self {
            cpu: 1.0,
            memory: 1.0,
            network: 1.0,
            counter: 1.0,
        }
    }
}

impl ResourceWeights {
    pub fn get(&self, kind: ResourceKind) -> f64 {
        match kind {
            ResourceKind::Cpu => self.cpu,
            ResourceKind::Memory => self.memory,
            ResourceKind::Network => self.network,
            ResourceKind::Counter => self.counter,
        }
    }
}

// ── Node ──────────────────────────────────────────────────────────

/// Physical placement of a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeLocation {
    pub data_center: String,
    /// Bridge pile; `None` outside bridge deployments.
    pub pile: Option<PileId>,
}

impl NodeLocation {
    pub fn new(data_center: impl Into<String>) -> Self {
        Self {
            data_center: data_center.into(),
            pile: None,
        }
    }

    pub fn with_pile(mut self, pile: PileId) -> Self {
        self.pile = Some(pile);
        self
    }
}

/// Per-tablet-type hosting rule of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TypeLimit {
    /// Maximum replicas of the type on the node; `None` = unlimited, 0 = never.
    pub max_count: Option<u32>,
    /// Higher tiers are used first; negative priorities mark spare hosts.
    pub priority: i32,
}

impl Default for TypeLimit {
    fn default() -> Self {
        Self {
            max_count: None,
            priority: 0,
        }
    }
}
