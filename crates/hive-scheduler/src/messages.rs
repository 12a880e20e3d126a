//! Messages in and out of a hive.
//!
//! ```text
//!   Request ──► Hive::request ──► Response
//!   Event   ──► Hive::event
//!                    │
//!                    └──► Vec<Effect>  (node commands, notifications,
//!                                       inter-hive messages, timers)
//! ```

use hive_core::{
    BalancerPolicy, ChannelBinding, ComputeMode, FollowerGroup, FollowerGroupId, FollowerId,
    Generation, GroupId, HiveId, LockLostReason, LockOwner, MigrationState, NodeId, NodeLocation,
    ObjectId, OwnerId, OwnerKey, PileId, ReplicaRole, ResourceValues, Status, SubDomainKey,
    TabletChannel, TabletId, TabletType, TxId, TypeLimit, VolatileState,
};
use hive_autoscale::{Recommendation, ScalePolicy};
use hive_state::TabletRecord;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ── Requests ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTablet {
    pub owner: OwnerKey,
    pub tablet_type: TabletType,
    pub channels: Vec<ChannelBinding>,
    #[serde(default)]
    pub follower_groups: Vec<FollowerGroup>,
    #[serde(default)]
    pub allowed_domains: Vec<SubDomainKey>,
    #[serde(default)]
    pub allowed_node_ids: Vec<NodeId>,
    #[serde(default)]
    pub allowed_data_centers: Vec<String>,
    #[serde(default)]
    pub data_center_preference: Vec<String>,
    #[serde(default)]
    pub object_id: ObjectId,
    #[serde(default)]
    pub object_domain: Option<SubDomainKey>,
    #[serde(default)]
    pub balancer_policy: BalancerPolicy,
    #[serde(default)]
    pub declared_usage: ResourceValues,
}

impl CreateTablet {
    pub fn new(owner: OwnerKey, tablet_type: TabletType, channels: Vec<ChannelBinding>) -> Self {
        Self {
            owner,
            tablet_type,
            channels,
            follower_groups: Vec::new(),
            allowed_domains: Vec::new(),
            allowed_node_ids: Vec::new(),
            allowed_data_centers: Vec::new(),
            data_center_preference: Vec::new(),
            object_id: 0,
            object_domain: None,
            balancer_policy: BalancerPolicy::Balance,
            declared_usage: ResourceValues::default(),
        }
    }

    pub fn with_follower_group(mut self, group: FollowerGroup) -> Self {
        self.follower_groups.push(group);
        self
    }

    pub fn with_object_domain(mut self, domain: SubDomainKey) -> Self {
        self.object_domain = Some(domain);
        self
    }

    pub fn with_object_id(mut self, object_id: ObjectId) -> Self {
        self.object_id = object_id;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterNode {
    pub node_id: NodeId,
    #[serde(default)]
    pub location: NodeLocation,
    #[serde(default)]
    pub serviced_domains: Vec<SubDomainKey>,
    #[serde(default)]
    pub resource_max: ResourceValues,
    #[serde(default)]
    pub type_limits: BTreeMap<TabletType, TypeLimit>,
}

impl RegisterNode {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            location: NodeLocation::default(),
            serviced_domains: Vec::new(),
            resource_max: ResourceValues::default(),
            type_limits: BTreeMap::new(),
        }
    }

    pub fn in_data_center(mut self, data_center: &str) -> Self {
        self.location.data_center = data_center.to_string();
        self
    }

    pub fn with_max(mut self, max: ResourceValues) -> Self {
        self.resource_max = max;
        self
    }
}

/// Usage of one replica as reported by its node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TabletUsage {
    pub tablet_id: TabletId,
    #[serde(default)]
    pub follower_id: FollowerId,
    pub usage: ResourceValues,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageGroupReport {
    pub group_id: GroupId,
    pub capacity: u64,
    pub allocated: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    CreateTablet(CreateTablet),
    DeleteTablet {
        owner: OwnerKey,
        tx_id: TxId,
    },
    DeleteOwnerTablets {
        owner_id: OwnerId,
        tx_id: TxId,
    },
    UpdateTabletChannels {
        tablet_id: TabletId,
        channels: Vec<ChannelBinding>,
    },
    UpdateObjectId {
        tablet_id: TabletId,
        object_id: ObjectId,
    },
    SetBalancerPolicy {
        tablet_id: TabletId,
        policy: BalancerPolicy,
    },
    GetTabletStorageInfo {
        tablet_id: TabletId,
    },
    RegisterNode(RegisterNode),
    NodeDisconnected {
        node_id: NodeId,
    },
    TabletMetrics {
        node_id: NodeId,
        #[serde(default)]
        tablets: Vec<TabletUsage>,
        /// Aggregate usage ratio of the whole node.
        #[serde(default)]
        node_usage: Option<f64>,
    },
    DrainNode {
        node_id: NodeId,
    },
    SetNodeDown {
        node_id: NodeId,
        down: bool,
    },
    SetNodeFreeze {
        node_id: NodeId,
        freeze: bool,
    },
    UpdateBridgeState {
        primary: PileId,
        #[serde(default)]
        promoted: Option<PileId>,
        #[serde(default)]
        disconnected: Vec<PileId>,
    },
    RequestNodeInfo,
    RequestHiveInfo(InfoFilter),
    LockTabletExecution {
        tablet_id: TabletId,
        owner: LockOwner,
        /// Node the request arrived from.
        sender_node: NodeId,
        #[serde(default)]
        timeout_ms: Option<u64>,
        #[serde(default)]
        reconnect: bool,
    },
    UnlockTabletExecution {
        tablet_id: TabletId,
        owner: LockOwner,
        sender_node: NodeId,
    },
    InitiateTabletExternalBoot {
        tablet_id: TabletId,
    },
    ReassignTablet {
        tablet_id: TabletId,
        /// Channel indexes to move; empty means all.
        #[serde(default)]
        channels: Vec<u32>,
        /// Target groups, positionally matching `channels`.
        #[serde(default)]
        forced_groups: Vec<GroupId>,
    },
    ReassignTabletSpace {
        tablet_id: TabletId,
        #[serde(default)]
        channels: Vec<u32>,
    },
    UpdateStoragePool {
        pool: String,
        groups: Vec<StorageGroupReport>,
    },
    UpdateDomain {
        domain: SubDomainKey,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        compute_mode: ComputeMode,
    },
    ConfigureHive {
        domain: SubDomainKey,
        parent_hive: HiveId,
    },
    InitMigration {
        domain: SubDomainKey,
    },
    QueryMigration {
        domain: SubDomainKey,
    },
    ConfigureScaleRecommender {
        domain: SubDomainKey,
        policy: ScalePolicy,
    },
    RequestScaleRecommendation {
        domain: SubDomainKey,
    },
}

/// Selects what `RequestHiveInfo` returns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InfoFilter {
    /// `None` returns every tablet.
    pub tablet_id: Option<TabletId>,
    pub return_followers: bool,
    pub return_metrics: bool,
    pub return_channel_history: bool,
}

// ── Responses ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Status {
        status: Status,
    },
    /// The request belongs to another hive.
    Forward {
        hive_id: HiveId,
    },
    CreateTablet {
        status: Status,
        tablet_id: TabletId,
    },
    Drain {
        status: Status,
        movements: usize,
    },
    HiveInfo {
        tablets: Vec<TabletInfo>,
    },
    NodeInfo {
        nodes: Vec<NodeSummary>,
    },
    StorageInfo {
        status: Status,
        channels: Vec<ChannelInfo>,
    },
    ExternalBoot {
        status: Status,
        boot: Option<BootCommand>,
    },
    Migration {
        status: Status,
        state: MigrationState,
        migrated: u64,
    },
    ScaleRecommendation {
        status: Status,
        recommended_nodes: Option<u32>,
    },
}

impl Response {
    pub fn status(status: Status) -> Self {
        Response::Status { status }
    }

    /// Protocol status carried by the reply; `Ok` for pure data replies.
    pub fn status_code(&self) -> Status {
        match self {
            Response::Status { status }
            | Response::CreateTablet { status, .. }
            | Response::Drain { status, .. }
            | Response::StorageInfo { status, .. }
            | Response::ExternalBoot { status, .. }
            | Response::Migration { status, .. }
            | Response::ScaleRecommendation { status, .. } => *status,
            Response::Forward { .. } | Response::HiveInfo { .. } | Response::NodeInfo { .. } => {
                Status::Ok
            }
        }
    }

    pub(crate) fn from_recommendation(recommendation: Recommendation) -> Self {
        match recommendation {
            Recommendation::NotReady => Response::ScaleRecommendation {
                status: Status::NotReady,
                recommended_nodes: None,
            },
            Recommendation::Nodes { count } => Response::ScaleRecommendation {
                status: Status::Ok,
                recommended_nodes: Some(count),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FollowerInfo {
    pub follower_id: FollowerId,
    pub group_id: FollowerGroupId,
    pub node_id: NodeId,
    pub state: VolatileState,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TabletInfo {
    pub tablet_id: TabletId,
    pub owner: OwnerKey,
    pub tablet_type: TabletType,
    pub state: VolatileState,
    pub node_id: NodeId,
    pub generation: Generation,
    pub object_id: ObjectId,
    pub balancer_policy: BalancerPolicy,
    pub locked_by: Option<LockOwner>,
    pub deleting: bool,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub followers: Vec<FollowerInfo>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub usage: Option<ResourceValues>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub channels: Option<Vec<TabletChannel>>,
    /// Consistency problems found while building the snapshot.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeSummary {
    pub node_id: NodeId,
    pub connected: bool,
    pub down: bool,
    pub freeze: bool,
    pub draining: bool,
    pub data_center: String,
    pub pile: Option<PileId>,
    pub tablet_count: usize,
    pub usage: f64,
    pub bad_until_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelInfo {
    pub index: u32,
    pub storage_pool: String,
    pub group_id: Option<GroupId>,
    pub from_generation: Option<Generation>,
}

// ── Events ─────────────────────────────────────────────────────────

/// Outcome a node reports for one replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaStatus {
    Running,
    Stopped,
    /// The node refused or failed to start the replica.
    BootFailed,
    /// The replica could not write to its storage groups.
    StorageFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    TabletStatus {
        node_id: NodeId,
        tablet_id: TabletId,
        #[serde(default)]
        follower_id: FollowerId,
        generation: Generation,
        status: ReplicaStatus,
    },
    Hive(HiveMessage),
    Timer(Timer),
}

/// Messages exchanged between a parent hive and a sub-hive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HiveMessage {
    SeizeTablets {
        from: HiveId,
        domain: SubDomainKey,
        max: usize,
    },
    SeizeTabletsReply {
        from: HiveId,
        domain: SubDomainKey,
        tablets: Vec<TabletRecord>,
    },
    ReleaseTablets {
        from: HiveId,
        domain: SubDomainKey,
        tablet_ids: Vec<TabletId>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "timer", rename_all = "snake_case")]
pub enum Timer {
    ProcessBootQueue,
    BalancerTick,
    StorageBalancerTick,
    ScaleSample,
    LockExpiry { tablet_id: TabletId, seq_no: u64 },
    NodeGrace { node_id: NodeId, epoch: u64 },
}

// ── Effects ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BootCommand {
    pub tablet_id: TabletId,
    pub follower_id: FollowerId,
    pub role: ReplicaRole,
    pub generation: Generation,
    pub tablet_type: TabletType,
    pub channels: Vec<TabletChannel>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum NodeCommand {
    Boot(BootCommand),
    Stop {
        tablet_id: TabletId,
        follower_id: FollowerId,
        generation: Generation,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "notification", rename_all = "snake_case")]
pub enum Notification {
    LockLost {
        tablet_id: TabletId,
        owner: LockOwner,
        reason: LockLostReason,
    },
    TabletDeleted {
        tablet_id: TabletId,
        owner: OwnerKey,
        tx_id: Option<TxId>,
    },
    DrainComplete {
        node_id: NodeId,
        movements: usize,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum Effect {
    Node { node_id: NodeId, command: NodeCommand },
    Notify(Notification),
    Hive { hive_id: HiveId, message: HiveMessage },
    Timer { after_ms: u64, timer: Timer },
}
