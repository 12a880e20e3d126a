//! The hive: one tablet scheduler instance.
//!
//! `Hive` is a plain state machine. Callers feed it [`Request`]s and
//! [`Event`]s with the current time and drain the [`Effect`]s it produces;
//! the runtime turns those into node commands, notifications, inter-hive
//! messages and timers. Nothing in here blocks or spawns.

use std::collections::{HashMap, HashSet};

use hive_autoscale::ScaleRecommender;
use hive_core::{
    ComputeMode, HiveConfig, HiveId, MigrationState, NodeId, ReplicaKey, ResourceKind,
    ResourceValues, Status, SubDomainKey, TabletId, VolatileState,
};
use hive_state::{
    DomainRecord, MigrationRecord, MigrationRole, StateStore, TabletRecord, Tombstone,
};
use rand::SeedableRng;
use rand::rngs::SmallRng;
use tracing::{debug, error, info, warn};

use crate::balancer::BalancerState;
use crate::boot::BootQueue;
use crate::error::HiveResult;
use crate::messages::{
    ChannelInfo, Effect, Event, FollowerInfo, HiveMessage, InfoFilter, NodeCommand, NodeSummary,
    Notification, Request, Response, TabletInfo, Timer,
};
use crate::node::{BridgeState, NodeInfo, NodeRegistry};
use crate::node_ops::DrainState;
use crate::storage::StorageRegistry;
use crate::storage_balancer::StorageBalancerState;
use crate::tablet::{Tablet, TabletRegistry};

pub struct Hive {
    pub(crate) config: HiveConfig,
    pub(crate) store: StateStore,
    pub(crate) nodes: NodeRegistry,
    pub(crate) tablets: TabletRegistry,
    pub(crate) storage: StorageRegistry,
    pub(crate) boot_queue: BootQueue,
    /// Replicas sent a boot command and not yet reported running.
    pub(crate) booting: HashSet<ReplicaKey>,
    pub(crate) boot_timer_armed: bool,
    pub(crate) domains: HashMap<SubDomainKey, DomainRecord>,
    pub(crate) migrations: HashMap<SubDomainKey, MigrationRecord>,
    pub(crate) recommender: ScaleRecommender,
    pub(crate) bridge: BridgeState,
    pub(crate) balancer: BalancerState,
    pub(crate) storage_balancer: StorageBalancerState,
    pub(crate) drains: HashMap<NodeId, DrainState>,
    /// Tablets handed to a sub-hive, by id.
    pub(crate) forwarded: HashMap<TabletId, HiveId>,
    pub(crate) next_lock_seq: u64,
    pub(crate) rng: SmallRng,
    effects: Vec<Effect>,
}

impl Hive {
    /// Rebuild a hive from its store. Nodes start disconnected and every
    /// replica that should run is queued for boot.
    pub fn load(config: HiveConfig, store: StateStore, now_ms: u64) -> HiveResult<Self> {
        let mut hive = Self {
            nodes: NodeRegistry::default(),
            tablets: TabletRegistry::default(),
            storage: StorageRegistry::default(),
            boot_queue: BootQueue::default(),
            booting: HashSet::new(),
            boot_timer_armed: false,
            domains: HashMap::new(),
            migrations: HashMap::new(),
            recommender: ScaleRecommender::new(&config.scale_recommender),
            bridge: BridgeState::default(),
            balancer: BalancerState::default(),
            storage_balancer: StorageBalancerState::default(),
            drains: HashMap::new(),
            forwarded: HashMap::new(),
            next_lock_seq: 1,
            rng: SmallRng::seed_from_u64(config.seed),
            effects: Vec::new(),
            config,
            store,
        };

        for record in hive.store.list_nodes()? {
            hive.nodes.insert(NodeInfo::new(record));
        }
        for domain in hive.store.list_domains()? {
            hive.domains.insert(domain.key, domain);
        }
        for migration in hive.store.list_migrations()? {
            hive.migrations.insert(migration.domain, migration);
        }
        for (_, tombstone) in hive.store.list_tombstones()? {
            if let Tombstone::Migrated { tablet_id, hive_id } = tombstone {
                hive.forwarded.insert(tablet_id, hive_id);
            }
        }
        let records = hive.store.list_tablets()?;
        let tablet_count = records.len();
        for record in records {
            if let Some(lock) = record.lock {
                hive.next_lock_seq = hive.next_lock_seq.max(lock.seq_no + 1);
            }
            hive.tablets.insert(Tablet::from_record(record));
        }
        hive.restore_locks();
        // Deletes interrupted while waiting on a node have nothing left to wait for.
        let deleting: Vec<TabletId> = hive
            .tablets
            .iter()
            .filter(|t| t.record.deleting)
            .map(|t| t.id())
            .collect();
        for tablet_id in deleting {
            hive.try_finalize_delete(tablet_id);
        }
        for tablet_id in hive.tablets.ids() {
            hive.enqueue_tablet(tablet_id);
        }
        hive.resume_migrations();

        hive.arm(hive.config.balancer.interval_ms, Timer::BalancerTick);
        hive.arm(hive.config.storage_balancer.interval_ms, Timer::StorageBalancerTick);
        hive.arm(hive.config.scale_recommender.sample_interval_ms, Timer::ScaleSample);
        hive.process_boot_queue(now_ms);

        info!(
            hive_id = hive.config.hive_id,
            tablets = tablet_count,
            nodes = hive.nodes.iter().count(),
            "hive loaded"
        );
        Ok(hive)
    }

    pub fn hive_id(&self) -> HiveId {
        self.config.hive_id
    }

    pub fn config(&self) -> &HiveConfig {
        &self.config
    }

    pub fn tablets(&self) -> &TabletRegistry {
        &self.tablets
    }

    pub fn nodes(&self) -> &NodeRegistry {
        &self.nodes
    }

    pub fn boot_queue(&self) -> &BootQueue {
        &self.boot_queue
    }

    /// Drain the effects produced since the last call.
    pub fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    // ── Dispatch ───────────────────────────────────────────────────

    pub fn request(&mut self, request: Request, now_ms: u64) -> Response {
        let response = self.dispatch(request, now_ms);
        self.process_boot_queue(now_ms);
        response
    }

    fn dispatch(&mut self, request: Request, now_ms: u64) -> Response {
        match request {
            Request::CreateTablet(create) => self.create_tablet(create, now_ms),
            Request::DeleteTablet { owner, tx_id } => self.delete_tablet(owner, tx_id),
            Request::DeleteOwnerTablets { owner_id, tx_id } => {
                self.delete_owner_tablets(owner_id, tx_id)
            }
            Request::UpdateTabletChannels {
                tablet_id,
                channels,
            } => self.update_tablet_channels(tablet_id, channels, now_ms),
            Request::UpdateObjectId {
                tablet_id,
                object_id,
            } => self.update_object_id(tablet_id, object_id),
            Request::SetBalancerPolicy { tablet_id, policy } => {
                self.set_balancer_policy(tablet_id, policy)
            }
            Request::GetTabletStorageInfo { tablet_id } => self.storage_info(tablet_id),
            Request::RegisterNode(register) => self.register_node(register, now_ms),
            Request::NodeDisconnected { node_id } => self.node_disconnected(node_id),
            Request::TabletMetrics {
                node_id,
                tablets,
                node_usage,
            } => self.tablet_metrics(node_id, tablets, node_usage, now_ms),
            Request::DrainNode { node_id } => self.drain_node(node_id),
            Request::SetNodeDown { node_id, down } => self.set_node_down(node_id, down),
            Request::SetNodeFreeze { node_id, freeze } => self.set_node_freeze(node_id, freeze),
            Request::UpdateBridgeState {
                primary,
                promoted,
                disconnected,
            } => self.update_bridge_state(primary, promoted, disconnected),
            Request::RequestNodeInfo => Response::NodeInfo {
                nodes: self.node_info(now_ms),
            },
            Request::RequestHiveInfo(filter) => Response::HiveInfo {
                tablets: self.hive_info(&filter),
            },
            Request::LockTabletExecution {
                tablet_id,
                owner,
                sender_node,
                timeout_ms,
                reconnect,
            } => self.lock_tablet(tablet_id, owner, sender_node, timeout_ms, reconnect, now_ms),
            Request::UnlockTabletExecution {
                tablet_id,
                owner,
                sender_node,
            } => self.unlock_tablet(tablet_id, owner, sender_node),
            Request::InitiateTabletExternalBoot { tablet_id } => self.external_boot(tablet_id),
            Request::ReassignTablet {
                tablet_id,
                channels,
                forced_groups,
            } => self.reassign_tablet(tablet_id, &channels, &forced_groups, now_ms),
            Request::ReassignTabletSpace {
                tablet_id,
                channels,
            } => self.reassign_tablet(tablet_id, &channels, &[], now_ms),
            Request::UpdateStoragePool { pool, groups } => {
                self.storage.update_pool(&pool, &groups);
                debug!(pool, groups = groups.len(), "storage pool updated");
                self.retry_waiting();
                Response::status(Status::Ok)
            }
            Request::UpdateDomain {
                domain,
                name,
                compute_mode,
            } => self.update_domain(domain, name, compute_mode),
            Request::ConfigureHive {
                domain,
                parent_hive,
            } => self.configure_hive(domain, parent_hive, now_ms),
            Request::InitMigration { domain } => self.init_migration(domain, now_ms),
            Request::QueryMigration { domain } => self.query_migration(domain),
            Request::ConfigureScaleRecommender { domain, policy } => {
                self.recommender.configure(domain, policy);
                Response::status(Status::Ok)
            }
            Request::RequestScaleRecommendation { domain } => {
                let current = self.domain_node_count(domain);
                Response::from_recommendation(self.recommender.recommend(domain, current))
            }
        }
    }

    pub fn event(&mut self, event: Event, now_ms: u64) {
        match event {
            Event::TabletStatus {
                node_id,
                tablet_id,
                follower_id,
                generation,
                status,
            } => {
                let key = ReplicaKey {
                    tablet_id,
                    follower_id,
                };
                self.on_tablet_status(node_id, key, generation, status, now_ms);
            }
            Event::Hive(message) => self.on_hive_message(message, now_ms),
            Event::Timer(timer) => self.on_timer(timer, now_ms),
        }
        self.process_boot_queue(now_ms);
    }

    fn on_timer(&mut self, timer: Timer, now_ms: u64) {
        match timer {
            Timer::ProcessBootQueue => self.on_boot_timer(),
            Timer::BalancerTick => {
                self.balancer_tick(now_ms);
                self.arm(self.config.balancer.interval_ms, Timer::BalancerTick);
            }
            Timer::StorageBalancerTick => {
                self.storage_balancer_tick(now_ms);
                self.arm(
                    self.config.storage_balancer.interval_ms,
                    Timer::StorageBalancerTick,
                );
            }
            Timer::ScaleSample => {
                self.sample_domain_usage(now_ms);
                self.arm(
                    self.config.scale_recommender.sample_interval_ms,
                    Timer::ScaleSample,
                );
            }
            Timer::LockExpiry { tablet_id, seq_no } => self.lock_expired(tablet_id, seq_no),
            Timer::NodeGrace { node_id, epoch } => self.node_grace_expired(node_id, epoch),
        }
    }

    // ── Effects ────────────────────────────────────────────────────

    pub(crate) fn send_node(&mut self, node_id: NodeId, command: NodeCommand) {
        self.effects.push(Effect::Node { node_id, command });
    }

    pub(crate) fn notify(&mut self, notification: Notification) {
        self.effects.push(Effect::Notify(notification));
    }

    pub(crate) fn send_hive(&mut self, hive_id: HiveId, message: HiveMessage) {
        self.effects.push(Effect::Hive { hive_id, message });
    }

    pub(crate) fn arm(&mut self, after_ms: u64, timer: Timer) {
        self.effects.push(Effect::Timer { after_ms, timer });
    }

    // ── Shared lookups ─────────────────────────────────────────────

    /// Resolve a tablet addressed by id. Seized and handed-over tablets
    /// forward to their new hive, and while this hive is still pulling a
    /// domain, unknown ones forward to the parent. Otherwise unknown or
    /// deleting tablets answer `Error`.
    pub(crate) fn live_tablet(&self, tablet_id: TabletId) -> Result<&Tablet, Response> {
        let Some(tablet) = self.tablets.get(tablet_id) else {
            let forward = self
                .forwarded
                .get(&tablet_id)
                .copied()
                .or_else(|| self.pulling_from());
            if let Some(hive_id) = forward {
                return Err(Response::Forward { hive_id });
            }
            debug!(tablet_id, "request for unknown tablet");
            return Err(Response::status(Status::Error));
        };
        if let Some(hive_id) = tablet.record.seized_by {
            return Err(Response::Forward { hive_id });
        }
        if tablet.record.deleting {
            return Err(Response::status(Status::Error));
        }
        Ok(tablet)
    }

    pub(crate) fn persist_tablet(&self, tablet_id: TabletId) -> bool {
        let Some(tablet) = self.tablets.get(tablet_id) else {
            return false;
        };
        match self.store.put_tablet(&tablet.record) {
            Ok(()) => true,
            Err(e) => {
                error!(tablet_id, error = %e, "failed to persist tablet");
                false
            }
        }
    }

    pub(crate) fn is_dedicated(&self, domain: SubDomainKey) -> bool {
        self.domains
            .get(&domain)
            .is_some_and(|d| d.compute_mode == ComputeMode::Dedicated)
    }

    /// Domains whose nodes may run the tablet.
    pub(crate) fn effective_domains(&self, record: &TabletRecord) -> Vec<SubDomainKey> {
        if let Some(domain) = record.object_domain {
            if self.is_dedicated(domain) {
                return vec![domain];
            }
        }
        if record.allowed_domains.is_empty() {
            vec![self.config.root_domain]
        } else {
            record.allowed_domains.clone()
        }
    }

    /// Sub-hive that owns new tablets of a domain. While the handover is
    /// running the parent still creates them; a later seize picks them up.
    pub(crate) fn delegated_to(&self, domain: SubDomainKey) -> Option<HiveId> {
        self.migrations.get(&domain).and_then(|m| {
            let delegated =
                m.role == MigrationRole::Parent && m.state == MigrationState::Complete;
            delegated.then_some(m.peer_hive)
        })
    }

    fn update_domain(
        &mut self,
        domain: SubDomainKey,
        name: Option<String>,
        compute_mode: ComputeMode,
    ) -> Response {
        let record = DomainRecord {
            key: domain,
            name,
            compute_mode,
        };
        if self.domains.get(&domain) == Some(&record) {
            return Response::status(Status::Already);
        }
        if let Err(e) = self.store.put_domain(&record) {
            error!(%domain, error = %e, "failed to persist domain");
            return Response::status(Status::Error);
        }
        info!(%domain, ?compute_mode, "domain updated");
        self.domains.insert(domain, record);
        self.retry_waiting();
        Response::status(Status::Ok)
    }

    // ── Info ───────────────────────────────────────────────────────

    fn node_info(&self, now_ms: u64) -> Vec<NodeSummary> {
        let defaults = &self.config.boot.default_node_max;
        self.nodes
            .iter()
            .map(|node| {
                let max = node.max(defaults);
                let usage = node
                    .replicas
                    .iter()
                    .filter_map(|key| {
                        let tablet = self.tablets.get(key.tablet_id)?;
                        let replica = tablet.replica(key.follower_id)?;
                        Some(self.replica_demand(tablet, replica))
                    })
                    .fold(ResourceValues::default(), |acc, d| acc.saturating_add(&d));
                let load = ResourceKind::ALL
                    .iter()
                    .map(|kind| usage.normalized(&max, *kind))
                    .fold(node.reported_usage(), f64::max);
                NodeSummary {
                    node_id: node.node_id(),
                    connected: node.connected,
                    down: node.record.down,
                    freeze: node.record.freeze,
                    draining: node.record.draining,
                    data_center: node.data_center().to_string(),
                    pile: node.pile(),
                    tablet_count: node.replicas.len(),
                    usage: load,
                    bad_until_ms: node.is_bad(now_ms).then_some(node.skip_until_ms),
                }
            })
            .collect()
    }

    fn hive_info(&self, filter: &InfoFilter) -> Vec<TabletInfo> {
        let selected: Vec<&Tablet> = match filter.tablet_id {
            Some(id) => self.tablets.get(id).into_iter().collect(),
            None => self.tablets.iter().collect(),
        };
        selected
            .into_iter()
            .map(|tablet| self.tablet_info(tablet, filter))
            .collect()
    }

    fn tablet_info(&self, tablet: &Tablet, filter: &InfoFilter) -> TabletInfo {
        let record = &tablet.record;
        let followers = if filter.return_followers {
            tablet
                .followers
                .values()
                .map(|f| FollowerInfo {
                    follower_id: f.key.follower_id,
                    group_id: f.group_id.unwrap_or_default(),
                    node_id: f.node_id,
                    state: f.state,
                })
                .collect()
        } else {
            Vec::new()
        };
        TabletInfo {
            tablet_id: record.tablet_id,
            owner: record.owner,
            tablet_type: record.tablet_type,
            state: tablet.state(),
            node_id: tablet.leader.node_id,
            generation: record.generation,
            object_id: record.object_id,
            balancer_policy: record.balancer_policy,
            locked_by: record.lock.map(|l| l.owner),
            deleting: record.deleting,
            followers,
            usage: filter
                .return_metrics
                .then(|| self.replica_demand(tablet, &tablet.leader)),
            channels: filter.return_channel_history.then(|| record.channels.clone()),
            issues: self.tablet_issues(tablet),
        }
    }

    /// Consistency problems visible from the hive's state.
    fn tablet_issues(&self, tablet: &Tablet) -> Vec<String> {
        let mut issues = Vec::new();
        for replica in tablet.replicas() {
            if replica.is_placed() {
                let attached = self
                    .nodes
                    .get(replica.node_id)
                    .is_some_and(|n| n.replicas.contains(&replica.key));
                if !attached {
                    issues.push(format!(
                        "replica {} is not indexed on node {}",
                        replica.key, replica.node_id
                    ));
                }
            }
        }
        if let Some(lock) = tablet.record.lock {
            if tablet.leader.state == VolatileState::Running {
                issues.push(format!("leader running while locked by {}", lock.owner));
            }
            if tablet.lock_expiry_pending {
                issues.push(format!("lock owner {} is disconnected", lock.owner));
            }
        } else if tablet.lock_expiry_pending {
            issues.push("lock expiry pending without a lock".to_string());
        }
        for channel in &tablet.record.channels {
            if let Some(issue) = self.storage.check_channel(channel) {
                issues.push(issue);
            }
        }
        issues
    }

    pub(crate) fn storage_info(&self, tablet_id: TabletId) -> Response {
        let tablet = match self.live_tablet(tablet_id) {
            Ok(tablet) => tablet,
            Err(response) => return response,
        };
        let channels = tablet
            .record
            .channels
            .iter()
            .map(|c| ChannelInfo {
                index: c.index,
                storage_pool: c.binding.storage_pool.clone(),
                group_id: c.current_group(),
                from_generation: c.history.last().map(|h| h.from_generation),
            })
            .collect();
        Response::StorageInfo {
            status: Status::Ok,
            channels,
        }
    }

    // ── Scale recommender ──────────────────────────────────────────

    fn domain_node_count(&self, domain: SubDomainKey) -> u32 {
        let root = self.config.root_domain;
        self.nodes
            .connected()
            .filter(|n| n.services(domain, root))
            .count() as u32
    }

    /// Feed every known domain's average node usage to the recommender.
    fn sample_domain_usage(&mut self, now_ms: u64) {
        let root = self.config.root_domain;
        let mut domains: Vec<SubDomainKey> = self.domains.keys().copied().collect();
        if !domains.contains(&root) {
            domains.push(root);
        }
        let summaries = self.node_info(now_ms);
        for domain in domains {
            let usages: Vec<f64> = summaries
                .iter()
                .filter(|s| s.connected)
                .filter(|s| {
                    self.nodes
                        .get(s.node_id)
                        .is_some_and(|n| n.services(domain, root))
                })
                .map(|s| s.usage)
                .collect();
            if usages.is_empty() {
                continue;
            }
            let average = usages.iter().sum::<f64>() / usages.len() as f64;
            self.recommender.record(domain, average, now_ms);
        }
    }

    pub(crate) fn warn_unknown_node(&self, node_id: NodeId, what: &str) -> Response {
        warn!(node_id, what, "request for unknown node");
        Response::status(Status::Error)
    }
}
