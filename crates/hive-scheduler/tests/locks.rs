mod common;

use common::{Sim, config};
use hive_core::{LockLostReason, LockOwner, Status, TabletId, VolatileState};
use hive_scheduler::{Notification, Request, Response};
use hive_state::StateStore;

const OWNER: LockOwner = LockOwner {
    node_id: 2,
    actor_id: 7,
};

fn locked_cluster(timeout_ms: Option<u64>) -> (Sim, TabletId) {
    let mut sim = Sim::new(config(1));
    sim.storage_pool(2);
    sim.register(1, "dc-1");
    sim.register(2, "dc-1");
    let tablet_id = sim.create_simple(1);
    let response = sim.request(lock(tablet_id, timeout_ms, false));
    assert_eq!(response.status_code(), Status::Ok);
    (sim, tablet_id)
}

fn lock(tablet_id: TabletId, timeout_ms: Option<u64>, reconnect: bool) -> Request {
    Request::LockTabletExecution {
        tablet_id,
        owner: OWNER,
        sender_node: OWNER.node_id,
        timeout_ms,
        reconnect,
    }
}

fn lock_lost(reason: LockLostReason, tablet_id: TabletId) -> Notification {
    Notification::LockLost {
        tablet_id,
        owner: OWNER,
        reason,
    }
}

#[test]
fn locked_leader_stays_down_until_unlock() {
    let (mut sim, tablet_id) = locked_cluster(None);
    let boots = sim.boots().len();
    let tablet = sim.hive.tablets().get(tablet_id).unwrap();
    assert!(!tablet.leader.is_placed());

    sim.advance(30_000);
    assert_eq!(sim.boots().len(), boots);

    let unlock = sim.request(Request::UnlockTabletExecution {
        tablet_id,
        owner: OWNER,
        sender_node: 2,
    });
    assert_eq!(unlock.status_code(), Status::Ok);
    assert_eq!(
        sim.take_notifications(),
        vec![lock_lost(LockLostReason::Unlocked, tablet_id)]
    );
    let tablet = sim.hive.tablets().get(tablet_id).unwrap();
    assert_eq!(tablet.leader.state, VolatileState::Running);
}

#[test]
fn lock_is_checked_against_sender() {
    let (mut sim, tablet_id) = locked_cluster(None);
    let spoofed = Request::LockTabletExecution {
        tablet_id,
        owner: LockOwner {
            node_id: 3,
            actor_id: 1,
        },
        sender_node: 1,
        timeout_ms: None,
        reconnect: false,
    };
    assert_eq!(sim.request(spoofed).status_code(), Status::Error);

    let wrong_unlock = Request::UnlockTabletExecution {
        tablet_id,
        owner: LockOwner {
            node_id: 1,
            actor_id: 7,
        },
        sender_node: 1,
    };
    assert_eq!(sim.request(wrong_unlock).status_code(), Status::Error);
    assert!(sim.take_notifications().is_empty());
}

#[test]
fn new_owner_takes_the_lock_over() {
    let (mut sim, tablet_id) = locked_cluster(None);
    let other = LockOwner {
        node_id: 1,
        actor_id: 3,
    };
    let response = sim.request(Request::LockTabletExecution {
        tablet_id,
        owner: other,
        sender_node: 1,
        timeout_ms: None,
        reconnect: false,
    });
    assert_eq!(response.status_code(), Status::Ok);
    assert_eq!(
        sim.take_notifications(),
        vec![lock_lost(LockLostReason::NewLock, tablet_id)]
    );
    let held = sim.hive.tablets().get(tablet_id).unwrap().record.lock.unwrap();
    assert_eq!(held.owner, other);
}

#[test]
fn lock_without_timeout_is_lost_with_the_node() {
    let (mut sim, tablet_id) = locked_cluster(None);
    sim.request(Request::NodeDisconnected { node_id: 2 });
    assert_eq!(
        sim.take_notifications(),
        vec![lock_lost(LockLostReason::NodeDisconnected, tablet_id)]
    );
    assert_eq!(sim.leader_node(tablet_id), 1);
}

#[test]
fn lock_expires_after_reconnect_window() {
    let (mut sim, tablet_id) = locked_cluster(Some(1_000));
    sim.request(Request::NodeDisconnected { node_id: 2 });
    sim.advance(999);
    assert!(sim.take_notifications().is_empty());
    assert!(sim.hive.tablets().get(tablet_id).unwrap().is_locked());

    sim.advance(1);
    assert_eq!(
        sim.take_notifications(),
        vec![lock_lost(LockLostReason::NodeDisconnected, tablet_id)]
    );
    let tablet = sim.hive.tablets().get(tablet_id).unwrap();
    assert!(!tablet.is_locked());
    assert_eq!(tablet.leader.state, VolatileState::Running);
}

#[test]
fn reconnecting_owner_keeps_the_lock() {
    let (mut sim, tablet_id) = locked_cluster(Some(1_000));
    sim.request(Request::NodeDisconnected { node_id: 2 });
    sim.advance(500);
    sim.register(2, "dc-1");
    assert_eq!(
        sim.request(lock(tablet_id, Some(1_000), true)).status_code(),
        Status::Ok
    );

    sim.advance(5_000);
    assert!(sim.take_notifications().is_empty());
    let tablet = sim.hive.tablets().get(tablet_id).unwrap();
    assert!(tablet.is_locked());
    assert!(!tablet.lock_expiry_pending);
}

#[test]
fn reconnect_without_a_lock_fails() {
    let mut sim = Sim::new(config(1));
    sim.storage_pool(1);
    sim.register(1, "dc-1");
    let tablet_id = sim.create_simple(1);
    assert_eq!(
        sim.request(lock(tablet_id, None, true)).status_code(),
        Status::Error
    );
}

#[test]
fn external_boot_needs_the_lock() {
    let mut sim = Sim::new(config(1));
    sim.storage_pool(1);
    sim.register(1, "dc-1");
    let tablet_id = sim.create_simple(1);
    assert!(matches!(
        sim.request(Request::InitiateTabletExternalBoot { tablet_id }),
        Response::ExternalBoot {
            status: Status::Error,
            boot: None
        }
    ));

    sim.request(lock(tablet_id, None, false));
    let generation = sim.hive.tablets().get(tablet_id).unwrap().record.generation;
    let Response::ExternalBoot {
        status: Status::Ok,
        boot: Some(boot),
    } = sim.request(Request::InitiateTabletExternalBoot { tablet_id })
    else {
        panic!("external boot refused");
    };
    assert_eq!(boot.tablet_id, tablet_id);
    assert_eq!(boot.generation, generation + 1);
}

#[test]
fn locks_are_reclaimed_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hive.redb");
    let mut sim = Sim::with_store(config(1), StateStore::open(&path).unwrap());
    sim.storage_pool(1);
    sim.register(1, "dc-1");
    let plain = sim.create_simple(1);
    let timed = sim.create_simple(2);
    sim.request(lock(plain, None, false));
    sim.request(lock(timed, Some(2_000), false));
    drop(sim);

    let mut sim = Sim::load(config(1), StateStore::open(&path).unwrap(), 1_000);
    assert_eq!(
        sim.take_notifications(),
        vec![lock_lost(LockLostReason::HiveRestart, plain)]
    );
    assert!(sim.hive.tablets().get(timed).unwrap().lock_expiry_pending);

    sim.advance(2_000);
    assert_eq!(
        sim.take_notifications(),
        vec![lock_lost(LockLostReason::NodeDisconnected, timed)]
    );
}
