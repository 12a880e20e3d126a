//! Deterministic driver for a single hive: fake clock, timer wheel and
//! worker nodes that acknowledge every command.

#![allow(dead_code)]

use std::collections::BTreeMap;

use hive_core::{
    ChannelBinding, HiveConfig, HiveId, NodeId, OwnerKey, ReplicaKey, TabletId, TabletType,
};
use hive_scheduler::{
    CreateTablet, Effect, Event, Hive, HiveMessage, NodeCommand, Notification, RegisterNode,
    ReplicaStatus, Request, Response, StorageGroupReport, Timer,
};
use hive_state::StateStore;

pub const POOL: &str = "ssd";

pub struct Sim {
    pub hive: Hive,
    pub now: u64,
    timers: Vec<(u64, Timer)>,
    pub notifications: Vec<Notification>,
    pub outbound: Vec<(HiveId, HiveMessage)>,
    pub commands: Vec<(NodeId, NodeCommand)>,
    /// Nodes answer boots with `Running` and stops with `Stopped`.
    pub auto_ack: bool,
}

pub fn config(hive_id: HiveId) -> HiveConfig {
    let mut config = HiveConfig::default().with_hive_id(hive_id);
    config.tablet_id_base = hive_id * 1_000_000;
    config
}

impl Sim {
    pub fn new(config: HiveConfig) -> Self {
        Self::with_store(config, StateStore::open_in_memory().unwrap())
    }

    pub fn with_store(config: HiveConfig, store: StateStore) -> Self {
        Self::load(config, store, 0)
    }

    pub fn load(config: HiveConfig, store: StateStore, now: u64) -> Self {
        let hive = Hive::load(config, store, now).unwrap();
        let mut sim = Self {
            hive,
            now,
            timers: Vec::new(),
            notifications: Vec::new(),
            outbound: Vec::new(),
            commands: Vec::new(),
            auto_ack: true,
        };
        sim.settle();
        sim
    }

    pub fn request(&mut self, request: Request) -> Response {
        let response = self.hive.request(request, self.now);
        self.settle();
        response
    }

    pub fn event(&mut self, event: Event) {
        self.hive.event(event, self.now);
        self.settle();
    }

    /// Apply effects and fire due timers until nothing is left to do.
    pub fn settle(&mut self) {
        loop {
            let effects = self.hive.take_effects();
            let mut events = Vec::new();
            for effect in &effects {
                match effect {
                    Effect::Node { node_id, command } => {
                        self.commands.push((*node_id, command.clone()));
                        if self.auto_ack {
                            events.push(ack(*node_id, command));
                        }
                    }
                    Effect::Notify(notification) => self.notifications.push(notification.clone()),
                    Effect::Hive { hive_id, message } => {
                        self.outbound.push((*hive_id, message.clone()))
                    }
                    Effect::Timer { after_ms, timer } => {
                        self.timers.push((self.now + after_ms, *timer))
                    }
                }
            }
            for event in events {
                self.hive.event(event, self.now);
            }
            let due = self.take_due(self.now);
            for timer in &due {
                self.hive.event(Event::Timer(*timer), self.now);
            }
            if effects.is_empty() && due.is_empty() {
                break;
            }
        }
    }

    fn take_due(&mut self, until: u64) -> Vec<Timer> {
        self.timers.sort_by_key(|(at, _)| *at);
        let split = self.timers.partition_point(|(at, _)| *at <= until);
        self.timers.drain(..split).map(|(_, t)| t).collect()
    }

    /// Move the clock forward, firing timers at their due time.
    pub fn advance(&mut self, ms: u64) {
        let target = self.now + ms;
        loop {
            self.timers.sort_by_key(|(at, _)| *at);
            let Some(&(at, timer)) = self.timers.first() else {
                break;
            };
            if at > target {
                break;
            }
            self.timers.remove(0);
            self.now = at;
            self.hive.event(Event::Timer(timer), self.now);
            self.settle();
        }
        self.now = target;
        self.settle();
    }

    pub fn take_outbound(&mut self) -> Vec<(HiveId, HiveMessage)> {
        std::mem::take(&mut self.outbound)
    }

    pub fn take_notifications(&mut self) -> Vec<Notification> {
        std::mem::take(&mut self.notifications)
    }

    // ── Setup helpers ──────────────────────────────────────────────

    pub fn storage_pool(&mut self, groups: u32) {
        let groups = (1..=groups)
            .map(|group_id| StorageGroupReport {
                group_id,
                capacity: 1000,
                allocated: 0,
            })
            .collect();
        self.request(Request::UpdateStoragePool {
            pool: POOL.into(),
            groups,
        });
    }

    pub fn register(&mut self, node_id: NodeId, data_center: &str) {
        let response = self.request(Request::RegisterNode(
            RegisterNode::new(node_id).in_data_center(data_center),
        ));
        assert!(response.status_code().is_success(), "{response:?}");
    }

    pub fn create(&mut self, create: CreateTablet) -> TabletId {
        match self.request(Request::CreateTablet(create)) {
            Response::CreateTablet { tablet_id, status } if status.is_success() => tablet_id,
            other => panic!("create failed: {other:?}"),
        }
    }

    pub fn create_simple(&mut self, owner_idx: u64) -> TabletId {
        self.create(simple(owner_idx))
    }

    // ── Inspection ─────────────────────────────────────────────────

    pub fn leader_node(&self, tablet_id: TabletId) -> NodeId {
        self.hive.tablets().get(tablet_id).unwrap().leader.node_id
    }

    /// Replicas assigned per node, connected or not.
    pub fn load_per_node(&self) -> BTreeMap<NodeId, usize> {
        self.hive
            .nodes()
            .iter()
            .map(|n| (n.node_id(), n.replicas.len()))
            .collect()
    }

    pub fn boots(&self) -> Vec<(NodeId, ReplicaKey)> {
        self.commands
            .iter()
            .filter_map(|(node_id, command)| match command {
                NodeCommand::Boot(boot) => Some((
                    *node_id,
                    ReplicaKey {
                        tablet_id: boot.tablet_id,
                        follower_id: boot.follower_id,
                    },
                )),
                _ => None,
            })
            .collect()
    }
}

pub fn simple(owner_idx: u64) -> CreateTablet {
    CreateTablet::new(
        OwnerKey::new(100, owner_idx),
        TabletType::DataShard,
        vec![ChannelBinding::new(POOL)],
    )
}

fn ack(node_id: NodeId, command: &NodeCommand) -> Event {
    match command {
        NodeCommand::Boot(boot) => Event::TabletStatus {
            node_id,
            tablet_id: boot.tablet_id,
            follower_id: boot.follower_id,
            generation: boot.generation,
            status: ReplicaStatus::Running,
        },
        NodeCommand::Stop {
            tablet_id,
            follower_id,
            generation,
        } => Event::TabletStatus {
            node_id,
            tablet_id: *tablet_id,
            follower_id: *follower_id,
            generation: *generation,
            status: ReplicaStatus::Stopped,
        },
    }
}

/// Carry inter-hive messages between two sims until both go quiet.
/// `drop` decides whether a message is lost in transit.
pub fn exchange(a: &mut Sim, b: &mut Sim, mut drop: impl FnMut(&HiveMessage) -> bool) {
    loop {
        let from_a = a.take_outbound();
        let from_b = b.take_outbound();
        if from_a.is_empty() && from_b.is_empty() {
            break;
        }
        for (hive_id, message) in from_a {
            if hive_id == b.hive.hive_id() && !drop(&message) {
                b.event(Event::Hive(message));
            }
        }
        for (hive_id, message) in from_b {
            if hive_id == a.hive.hive_id() && !drop(&message) {
                a.event(Event::Hive(message));
            }
        }
    }
}
