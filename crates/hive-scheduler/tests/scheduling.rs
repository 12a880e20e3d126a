//! Boot, balance, drain and delete scenarios against a single hive.

mod common;

use std::collections::BTreeSet;

use common::{Sim, config, simple};
use hive_core::{
    BalancerPolicy, ChannelBinding, FollowerGroup, Generation, GroupId, NodeId, OwnerKey,
    ReplicaKey, ReplicaRole, ResourceValues, Status, TabletId, TabletType, VolatileState,
};
use hive_scheduler::{
    Event, NodeCommand, Notification, RegisterNode, ReplicaStatus, Request, Response,
    StorageGroupReport, TabletUsage,
};
use hive_state::StateStore;

fn cluster(nodes: NodeId) -> Sim {
    let mut sim = Sim::new(config(1));
    sim.storage_pool(3);
    for node_id in 1..=nodes {
        sim.register(node_id, "dc-1");
    }
    sim
}

fn group_of(sim: &Sim, tablet_id: TabletId) -> GroupId {
    let tablet = sim.hive.tablets().get(tablet_id).unwrap();
    tablet.record.channels[0].current_group().unwrap()
}

fn generation_of(sim: &Sim, tablet_id: TabletId) -> Generation {
    sim.hive.tablets().get(tablet_id).unwrap().record.generation
}

/// Generation and node of the latest leader boot sent for `tablet_id`.
fn last_boot(sim: &Sim, tablet_id: TabletId) -> (Generation, NodeId) {
    sim.commands
        .iter()
        .rev()
        .find_map(|(node_id, command)| match command {
            NodeCommand::Boot(boot) if boot.tablet_id == tablet_id && boot.follower_id == 0 => {
                Some((boot.generation, *node_id))
            }
            _ => None,
        })
        .unwrap()
}

fn running(node_id: NodeId, tablet_id: TabletId, generation: Generation) -> Event {
    Event::TabletStatus {
        node_id,
        tablet_id,
        follower_id: 0,
        generation,
        status: ReplicaStatus::Running,
    }
}

#[test]
fn followers_land_on_distinct_nodes() {
    let mut sim = cluster(3);
    let tablet_id = sim.create(simple(1).with_follower_group(FollowerGroup {
        id: 1,
        follower_count: 2,
        require_different_nodes: true,
        ..Default::default()
    }));

    let tablet = sim.hive.tablets().get(tablet_id).unwrap();
    let nodes: BTreeSet<NodeId> = tablet.replicas().map(|r| r.node_id).collect();
    assert_eq!(nodes, BTreeSet::from([1, 2, 3]));
    assert!(tablet.replicas().all(|r| r.state == VolatileState::Running));

    let mut leaders = 0;
    let mut followers = 0;
    for (_, command) in &sim.commands {
        if let NodeCommand::Boot(boot) = command {
            match boot.role {
                ReplicaRole::Leader => {
                    assert_eq!(boot.follower_id, 0);
                    leaders += 1;
                }
                ReplicaRole::Follower { group_id, follower_id } => {
                    assert_eq!(group_id, 1);
                    assert_eq!(follower_id, boot.follower_id);
                    followers += 1;
                }
            }
        }
    }
    assert_eq!((leaders, followers), (1, 2));
}

#[test]
fn tablets_spread_evenly_at_boot() {
    let mut sim = cluster(3);
    for idx in 1..=9 {
        sim.create_simple(idx);
    }
    let load = sim.load_per_node();
    assert_eq!(load.values().copied().collect::<Vec<_>>(), vec![3, 3, 3]);
}

#[test]
fn balancer_spreads_tablets_onto_new_nodes() {
    let mut sim = cluster(1);
    let ids: Vec<_> = (1..=9).map(|idx| sim.create_simple(idx)).collect();
    assert!(ids.iter().all(|id| sim.leader_node(*id) == 1));

    sim.register(2, "dc-1");
    sim.register(3, "dc-1");
    assert_eq!(sim.load_per_node()[&1], 9);

    let interval = sim.hive.config().balancer.interval_ms;
    sim.advance(interval);

    let load = sim.load_per_node();
    let max = load.values().max().copied().unwrap();
    let min = load.values().min().copied().unwrap();
    assert!(max - min <= 1, "unbalanced: {load:?}");
    assert_eq!(load.values().sum::<usize>(), 9);
    for id in ids {
        let tablet = sim.hive.tablets().get(id).unwrap();
        assert_eq!(tablet.leader.state, VolatileState::Running);
    }
}

#[test]
fn hot_tablets_are_spread_by_cpu() {
    let mut sim = Sim::new(config(1));
    sim.storage_pool(3);
    for node_id in 1..=3 {
        let register = RegisterNode::new(node_id)
            .in_data_center("dc-1")
            .with_max(ResourceValues::new(1000, 0, 0, 0));
        assert_eq!(sim.request(Request::RegisterNode(register)).status_code(), Status::Ok);
    }
    let ids: Vec<TabletId> = (1..=9).map(|idx| sim.create_simple(idx)).collect();
    let (hot, cold): (Vec<TabletId>, Vec<TabletId>) =
        ids.iter().partition(|id| sim.leader_node(**id) == 1);
    assert_eq!(hot.len(), 3);

    let report = hot
        .iter()
        .map(|tablet_id| TabletUsage {
            tablet_id: *tablet_id,
            follower_id: 0,
            usage: ResourceValues::new(300, 0, 0, 0),
        })
        .collect();
    sim.request(Request::TabletMetrics {
        node_id: 1,
        tablets: report,
        node_usage: None,
    });
    let cold_before: Vec<NodeId> = cold.iter().map(|id| sim.leader_node(*id)).collect();

    let interval = sim.hive.config().balancer.interval_ms;
    sim.advance(interval);

    let hot_left = hot.iter().filter(|id| sim.leader_node(**id) != 1).count();
    assert!(hot_left >= 1, "no hot tablet left node 1");
    for node_id in 1..=3 {
        let hot_here = hot.iter().filter(|id| sim.leader_node(**id) == node_id).count();
        assert!(hot_here <= 2, "node {node_id} still holds {hot_here} hot tablets");
    }
    // Idle tablets only move to even out counts, which means onto node 1.
    for (id, before) in cold.iter().zip(cold_before) {
        let now = sim.leader_node(*id);
        assert!(now == before || now == 1, "tablet {id} moved {before} -> {now}");
    }
    assert!(ids.iter().all(|id| {
        sim.hive.tablets().get(*id).unwrap().leader.state == VolatileState::Running
    }));
}

#[test]
fn drain_moves_replicas_off_the_node() {
    let mut sim = cluster(3);
    for idx in 1..=6 {
        sim.create_simple(idx);
    }
    assert_eq!(sim.load_per_node()[&1], 2);

    let response = sim.request(Request::DrainNode { node_id: 1 });
    assert!(matches!(
        response,
        Response::Drain {
            status: Status::Ok,
            movements: 2
        }
    ));
    assert_eq!(sim.load_per_node()[&1], 0);
    assert!(sim.notifications.contains(&Notification::DrainComplete {
        node_id: 1,
        movements: 2
    }));

    let again = sim.request(Request::DrainNode { node_id: 1 });
    assert_eq!(again.status_code(), Status::Already);
    assert_eq!(
        sim.request(Request::DrainNode { node_id: 9 }).status_code(),
        Status::Error
    );
}

#[test]
fn disconnected_node_is_replaced_after_grace() {
    let mut sim = cluster(2);
    let first = sim.create_simple(1);
    let second = sim.create_simple(2);
    assert_eq!(sim.leader_node(second), 2);

    sim.request(Request::NodeDisconnected { node_id: 2 });
    // Still assigned while the node may come back.
    assert_eq!(sim.leader_node(second), 2);

    let grace = sim.hive.config().node.disconnect_grace_ms;
    sim.advance(grace);
    assert_eq!(sim.leader_node(first), 1);
    assert_eq!(sim.leader_node(second), 1);
    assert_eq!(
        sim.hive.tablets().get(second).unwrap().leader.state,
        VolatileState::Running
    );
}

#[test]
fn failed_boot_is_retried_with_a_new_generation() {
    let mut sim = cluster(1);
    sim.auto_ack = false;
    let tablet_id = sim.create_simple(1);
    let boots = sim.boots();
    assert_eq!(boots.len(), 1);
    let generation = sim.hive.tablets().get(tablet_id).unwrap().record.generation;

    sim.event(Event::TabletStatus {
        node_id: 1,
        tablet_id,
        follower_id: 0,
        generation,
        status: ReplicaStatus::BootFailed,
    });
    assert_eq!(sim.leader_node(tablet_id), 0);

    let max_delay = sim.hive.config().boot.retry_min_delay_ms * 2;
    sim.advance(max_delay);
    assert_eq!(sim.boots().len(), 2);
    let tablet = sim.hive.tablets().get(tablet_id).unwrap();
    assert_eq!(tablet.record.generation, generation + 1);
    assert_eq!(tablet.leader.node_id, 1);
}

#[test]
fn create_is_idempotent_and_validated() {
    let mut sim = cluster(1);
    let tablet_id = sim.create_simple(1);
    assert!(matches!(
        sim.request(Request::CreateTablet(simple(1))),
        Response::CreateTablet { status: Status::Already, tablet_id: id } if id == tablet_id
    ));

    let mut invalid = simple(2);
    invalid.owner = OwnerKey::new(0, 2);
    assert_eq!(
        sim.request(Request::CreateTablet(invalid)).status_code(),
        Status::InvalidOwner
    );

    let mut no_channels = simple(3);
    no_channels.channels.clear();
    assert_eq!(
        sim.request(Request::CreateTablet(no_channels)).status_code(),
        Status::Error
    );

    let mut retyped = simple(1);
    retyped.tablet_type = TabletType::Coordinator;
    assert_eq!(
        sim.request(Request::CreateTablet(retyped)).status_code(),
        Status::Error
    );

    let mut wide = simple(4);
    wide.channels.push(ChannelBinding::new(common::POOL));
    let wide_id = sim.create(wide.clone());
    assert_eq!(
        sim.request(Request::CreateTablet(simple(4))).status_code(),
        Status::Error
    );

    wide.channels.push(ChannelBinding::new(common::POOL));
    assert_eq!(
        sim.request(Request::CreateTablet(wide)).status_code(),
        Status::Ok
    );
    let tablet = sim.hive.tablets().get(wide_id).unwrap();
    assert_eq!(tablet.record.channels.len(), 3);
    assert!(tablet.record.channels.iter().all(|c| c.current_group().is_some()));
}

#[test]
fn delete_is_final() {
    let mut sim = cluster(1);
    let tablet_id = sim.create_simple(1);
    let owner = OwnerKey::new(100, 1);

    let response = sim.request(Request::DeleteTablet { owner, tx_id: 7 });
    assert_eq!(response.status_code(), Status::Ok);
    assert!(sim.hive.tablets().get(tablet_id).is_none());
    assert!(sim.notifications.contains(&Notification::TabletDeleted {
        tablet_id,
        owner,
        tx_id: Some(7),
    }));

    assert!(matches!(
        sim.request(Request::CreateTablet(simple(1))),
        Response::CreateTablet { status: Status::Blocked, tablet_id: id } if id == tablet_id
    ));
    assert_eq!(
        sim.request(Request::DeleteTablet { owner, tx_id: 8 }).status_code(),
        Status::Already
    );
}

#[test]
fn delete_waits_for_in_flight_boot() {
    let mut sim = cluster(1);
    sim.auto_ack = false;
    let tablet_id = sim.create_simple(1);
    let generation = sim.hive.tablets().get(tablet_id).unwrap().record.generation;

    let owner = OwnerKey::new(100, 1);
    assert_eq!(
        sim.request(Request::DeleteTablet { owner, tx_id: 1 }).status_code(),
        Status::Ok
    );
    assert!(sim.take_notifications().is_empty());
    let tablet = sim.hive.tablets().get(tablet_id).unwrap();
    assert!(tablet.record.deleting);
    assert_eq!(tablet.leader.state, VolatileState::Stopping);

    sim.event(Event::TabletStatus {
        node_id: 1,
        tablet_id,
        follower_id: 0,
        generation,
        status: ReplicaStatus::Stopped,
    });
    assert!(sim.hive.tablets().get(tablet_id).is_none());
    assert_eq!(
        sim.take_notifications(),
        vec![Notification::TabletDeleted {
            tablet_id,
            owner,
            tx_id: Some(1)
        }]
    );
}

#[test]
fn pending_delete_finishes_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hive.redb");
    let mut sim = Sim::with_store(config(1), StateStore::open(&path).unwrap());
    sim.storage_pool(1);
    sim.register(1, "dc-1");
    sim.auto_ack = false;
    let tablet_id = sim.create_simple(1);
    let owner = OwnerKey::new(100, 1);
    assert_eq!(
        sim.request(Request::DeleteTablet { owner, tx_id: 3 }).status_code(),
        Status::Ok
    );
    assert!(sim.hive.tablets().get(tablet_id).unwrap().record.deleting);
    drop(sim);

    // The stop ack never arrives; nothing runs after the restart.
    let mut sim = Sim::load(config(1), StateStore::open(&path).unwrap(), 10_000);
    assert!(sim.hive.tablets().get(tablet_id).is_none());
    assert!(!sim.hive.boot_queue().is_waiting(ReplicaKey::leader(tablet_id)));
    let deleted: Vec<Notification> = sim
        .take_notifications()
        .into_iter()
        .filter(|n| matches!(n, Notification::TabletDeleted { .. }))
        .collect();
    assert_eq!(
        deleted,
        vec![Notification::TabletDeleted {
            tablet_id,
            owner,
            tx_id: Some(3)
        }]
    );
    assert!(matches!(
        sim.request(Request::CreateTablet(simple(1))),
        Response::CreateTablet { status: Status::Blocked, tablet_id: id } if id == tablet_id
    ));
    drop(sim);

    let store = StateStore::open(&path).unwrap();
    assert!(store.get_tablet(tablet_id).unwrap().is_none());
}

#[test]
fn delete_owner_tablets_removes_all() {
    let mut sim = cluster(2);
    for idx in 1..=3 {
        sim.create_simple(idx);
    }
    assert_eq!(
        sim.request(Request::DeleteOwnerTablets {
            owner_id: 100,
            tx_id: 9
        })
        .status_code(),
        Status::Ok
    );
    assert!(sim.hive.tablets().is_empty());
    assert_eq!(
        sim.request(Request::DeleteOwnerTablets {
            owner_id: 100,
            tx_id: 10
        })
        .status_code(),
        Status::Already
    );
}

#[test]
fn tablets_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hive.redb");
    let mut sim = Sim::with_store(config(1), StateStore::open(&path).unwrap());
    sim.storage_pool(1);
    sim.register(1, "dc-1");
    let tablet_id = sim.create_simple(1);
    let generation = sim.hive.tablets().get(tablet_id).unwrap().record.generation;
    drop(sim);

    let mut sim = Sim::load(config(1), StateStore::open(&path).unwrap(), 10_000);
    let tablet = sim.hive.tablets().get(tablet_id).unwrap();
    assert_eq!(tablet.record.generation, generation);
    assert_eq!(tablet.leader.node_id, 0);
    assert!(sim.hive.boot_queue().is_waiting(tablet.leader.key));

    sim.storage_pool(1);
    sim.register(1, "dc-1");
    let wait = sim.hive.config().boot.wait_queue_retry_ms;
    sim.advance(wait);
    let tablet = sim.hive.tablets().get(tablet_id).unwrap();
    assert_eq!(tablet.leader.state, VolatileState::Running);
    assert_eq!(tablet.record.generation, generation + 1);
}

#[test]
fn balancer_leaves_ignored_tablets_in_place() {
    let mut sim = cluster(1);
    let ids: Vec<TabletId> = (1..=9).map(|idx| sim.create_simple(idx)).collect();
    let (ignored, balanced) = ids.split_at(3);
    for tablet_id in ignored {
        let response = sim.request(Request::SetBalancerPolicy {
            tablet_id: *tablet_id,
            policy: BalancerPolicy::Ignore,
        });
        assert_eq!(response.status_code(), Status::Ok);
    }
    assert_eq!(
        sim.request(Request::SetBalancerPolicy {
            tablet_id: ignored[0],
            policy: BalancerPolicy::Ignore,
        })
        .status_code(),
        Status::Already
    );

    sim.register(2, "dc-1");
    sim.register(3, "dc-1");
    let interval = sim.hive.config().balancer.interval_ms;
    sim.advance(interval);

    assert!(ignored.iter().all(|id| sim.leader_node(*id) == 1));
    assert!(balanced.iter().all(|id| sim.leader_node(*id) != 1));
    let load = sim.load_per_node();
    assert_eq!(load.values().copied().collect::<Vec<_>>(), vec![3, 3, 3]);
}

#[test]
fn overloaded_node_sheds_a_tablet_without_waiting_for_a_tick() {
    let mut sim = Sim::new(config(1));
    sim.storage_pool(1);
    for node_id in 1..=2 {
        let register = RegisterNode::new(node_id)
            .in_data_center("dc-1")
            .with_max(ResourceValues::new(1000, 0, 0, 0));
        assert_eq!(sim.request(Request::RegisterNode(register)).status_code(), Status::Ok);
    }
    let ids: Vec<TabletId> = (1..=4).map(|idx| sim.create_simple(idx)).collect();
    let hot: Vec<TabletId> = ids.iter().copied().filter(|id| sim.leader_node(*id) == 1).collect();
    assert_eq!(hot.len(), 2);
    let report: Vec<TabletUsage> = hot
        .iter()
        .map(|tablet_id| TabletUsage {
            tablet_id: *tablet_id,
            follower_id: 0,
            usage: ResourceValues::new(400, 0, 0, 0),
        })
        .collect();

    sim.request(Request::TabletMetrics {
        node_id: 1,
        tablets: report.clone(),
        node_usage: None,
    });
    assert!(hot.iter().all(|id| sim.leader_node(*id) == 1));

    let kick = sim.hive.config().balancer.max_node_usage_to_kick;
    sim.request(Request::TabletMetrics {
        node_id: 1,
        tablets: report,
        node_usage: Some(kick + 0.05),
    });
    let moved = hot.iter().filter(|id| sim.leader_node(**id) == 2).count();
    assert_eq!(moved, 1);
    assert!(ids.iter().all(|id| {
        sim.hive.tablets().get(*id).unwrap().leader.state == VolatileState::Running
    }));
}

#[test]
fn storage_balancer_moves_channels_within_its_limits() {
    let mut config = config(1);
    config.storage_balancer.interval_ms = 10_000;
    config.storage_balancer.min_period_between_reassign_ms = 30_000;
    config.storage_balancer.max_inflight = 1;
    let mut sim = Sim::new(config);
    sim.storage_pool(1);
    sim.register(1, "dc-1");
    let ids: Vec<TabletId> = (1..=4).map(|idx| sim.create_simple(idx)).collect();
    assert!(ids.iter().all(|id| group_of(&sim, *id) == 1));
    sim.request(Request::UpdateStoragePool {
        pool: common::POOL.into(),
        groups: vec![
            StorageGroupReport {
                group_id: 1,
                capacity: 1000,
                allocated: 1000,
            },
            StorageGroupReport {
                group_id: 2,
                capacity: 1000,
                allocated: 0,
            },
        ],
    });
    let moved = |sim: &Sim| -> Vec<TabletId> {
        ids.iter().copied().filter(|id| group_of(sim, *id) == 2).collect()
    };

    // Channels assigned at creation are too recent to move.
    sim.advance(20_000);
    assert!(moved(&sim).is_empty());

    sim.auto_ack = false;
    sim.advance(10_000);
    let first = moved(&sim);
    assert_eq!(first.len(), 1);
    let tablet_id = first[0];
    let tablet = sim.hive.tablets().get(tablet_id).unwrap();
    let entry = tablet.record.channels[0].history.last().unwrap();
    assert_eq!(entry.from_generation, tablet.record.generation);
    let (generation, node_id) = last_boot(&sim, tablet_id);
    assert_eq!((generation, node_id), (entry.from_generation, 1));

    // The restarted leader has not come back, so the move is still in flight.
    sim.advance(10_000);
    assert_eq!(moved(&sim), first);

    sim.event(running(node_id, tablet_id, generation));
    sim.auto_ack = true;
    sim.advance(10_000);
    let second = moved(&sim);
    assert_eq!(second.len(), 2);
    assert!(second.contains(&tablet_id));
    assert!(ids.iter().all(|id| {
        sim.hive.tablets().get(*id).unwrap().leader.state == VolatileState::Running
    }));
}

#[test]
fn storage_failure_renews_channels_and_benches_the_group() {
    let mut sim = cluster(1);
    let tablet_id = sim.create_simple(1);
    assert_eq!(group_of(&sim, tablet_id), 1);
    let generation = generation_of(&sim, tablet_id);

    sim.event(Event::TabletStatus {
        node_id: 1,
        tablet_id,
        follower_id: 0,
        generation,
        status: ReplicaStatus::StorageFailed,
    });
    assert_eq!(group_of(&sim, tablet_id), 2);
    let tablet = sim.hive.tablets().get(tablet_id).unwrap();
    assert_eq!(tablet.record.generation, generation + 1);
    assert_eq!(tablet.leader.state, VolatileState::Running);
    assert_eq!(tablet.record.channels[0].history.last().unwrap().from_generation, generation + 1);

    let during = sim.create_simple(2);
    assert_eq!(group_of(&sim, during), 2);

    let period = sim.hive.config().storage_balancer.group_ineligible_period_ms;
    sim.advance(period);
    let after = sim.create_simple(3);
    assert_eq!(group_of(&sim, after), 1);
}

#[test]
fn failing_node_is_skipped_until_it_recovers() {
    let mut sim = cluster(2);
    sim.auto_ack = false;
    let tablet_id = sim.create_simple(1);
    let failures = sim.hive.config().boot.bad_node_failures;

    for _ in 0..failures {
        let (generation, node_id) = last_boot(&sim, tablet_id);
        assert_eq!(node_id, 1);
        sim.event(Event::TabletStatus {
            node_id,
            tablet_id,
            follower_id: 0,
            generation,
            status: ReplicaStatus::BootFailed,
        });
        sim.advance(1_000);
    }
    let (generation, node_id) = last_boot(&sim, tablet_id);
    assert_eq!(node_id, 2);
    sim.event(running(node_id, tablet_id, generation));

    // Node 1 is empty yet still passed over.
    let while_bad = sim.create_simple(2);
    assert_eq!(sim.leader_node(while_bad), 2);

    let skip = sim.hive.config().boot.bad_node_skip_ms;
    sim.advance(skip);
    let recovered = sim.create_simple(3);
    assert_eq!(sim.leader_node(recovered), 1);
}

#[test]
fn reassign_moves_channels_to_forced_groups() {
    let mut sim = cluster(1);
    let tablet_id = sim.create_simple(1);
    let generation = generation_of(&sim, tablet_id);
    let reassign = |channels: Vec<u32>, forced_groups: Vec<GroupId>| Request::ReassignTablet {
        tablet_id,
        channels,
        forced_groups,
    };

    assert_eq!(sim.request(reassign(vec![0], vec![3])).status_code(), Status::Ok);
    assert_eq!(group_of(&sim, tablet_id), 3);
    let tablet = sim.hive.tablets().get(tablet_id).unwrap();
    assert_eq!(tablet.record.generation, generation + 1);
    assert_eq!(tablet.leader.state, VolatileState::Running);

    assert_eq!(sim.request(reassign(vec![0], vec![3])).status_code(), Status::Already);
    assert_eq!(sim.request(reassign(vec![0], vec![99])).status_code(), Status::Error);
    assert_eq!(sim.request(reassign(vec![], vec![1, 2])).status_code(), Status::Error);
    assert_eq!(sim.request(reassign(vec![5], vec![1])).status_code(), Status::Error);
    assert_eq!(group_of(&sim, tablet_id), 3);
    assert_eq!(generation_of(&sim, tablet_id), generation + 1);

    // Without forced groups the channel goes to the emptiest other group.
    assert_eq!(sim.request(reassign(vec![], vec![])).status_code(), Status::Ok);
    assert_eq!(group_of(&sim, tablet_id), 1);
}

#[test]
fn bridge_state_steers_boots_between_piles() {
    let mut sim = Sim::new(config(1));
    sim.storage_pool(1);
    for (node_id, pile) in [(1, 1), (2, 2)] {
        let mut register = RegisterNode::new(node_id).in_data_center("dc-1");
        register.location.pile = Some(pile);
        assert_eq!(sim.request(Request::RegisterNode(register)).status_code(), Status::Ok);
    }

    let update = |primary, disconnected: Vec<u32>| Request::UpdateBridgeState {
        primary,
        promoted: None,
        disconnected,
    };
    assert_eq!(sim.request(update(1, vec![])).status_code(), Status::Ok);
    let on_primary: Vec<TabletId> = (1..=3).map(|idx| sim.create_simple(idx)).collect();
    assert!(on_primary.iter().all(|id| sim.leader_node(*id) == 1));

    assert_eq!(sim.request(update(2, vec![1])).status_code(), Status::Ok);
    let after_switch: Vec<TabletId> = (4..=6).map(|idx| sim.create_simple(idx)).collect();
    assert!(after_switch.iter().all(|id| sim.leader_node(*id) == 2));
}

#[test]
fn frozen_nodes_are_left_out_of_balancing() {
    let mut sim = cluster(1);
    let ids: Vec<TabletId> = (1..=6).map(|idx| sim.create_simple(idx)).collect();
    let interval = sim.hive.config().balancer.interval_ms;

    sim.register(2, "dc-1");
    let freeze = |node_id, freeze| Request::SetNodeFreeze { node_id, freeze };
    assert_eq!(sim.request(freeze(2, true)).status_code(), Status::Ok);
    assert_eq!(sim.request(freeze(2, true)).status_code(), Status::Already);
    sim.advance(interval);
    assert_eq!(sim.load_per_node()[&2], 0);

    // A frozen source keeps its tablets too.
    assert_eq!(sim.request(freeze(1, true)).status_code(), Status::Ok);
    assert_eq!(sim.request(freeze(2, false)).status_code(), Status::Ok);
    sim.advance(interval);
    assert!(ids.iter().all(|id| sim.leader_node(*id) == 1));

    assert_eq!(sim.request(freeze(1, false)).status_code(), Status::Ok);
    sim.advance(interval);
    let load = sim.load_per_node();
    assert_eq!(load.values().copied().collect::<Vec<_>>(), vec![3, 3]);
    assert_eq!(sim.request(freeze(9, true)).status_code(), Status::Error);
}
