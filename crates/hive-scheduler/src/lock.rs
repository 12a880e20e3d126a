//! Tablet execution locks.
//!
//! A lock hands a tablet's leader to an external owner: the hive stops the
//! leader and will not boot it while the lock is held. A lock survives its
//! owner's node disconnecting for `timeout_ms`; without a timeout it is
//! released as soon as the node goes away.

use hive_core::{LEADER, LockLostReason, LockOwner, NodeId, ReplicaKey, Status, TabletId};
use hive_state::LockRecord;
use tracing::{debug, error, info, warn};

use crate::hive::Hive;
use crate::messages::{BootCommand, Notification, Response, Timer};

impl Hive {
    pub(crate) fn lock_tablet(
        &mut self,
        tablet_id: TabletId,
        owner: LockOwner,
        sender_node: NodeId,
        timeout_ms: Option<u64>,
        reconnect: bool,
        now_ms: u64,
    ) -> Response {
        let current = match self.live_tablet(tablet_id) {
            Ok(tablet) => tablet.record.lock,
            Err(response) => return response,
        };
        if owner.node_id != sender_node {
            warn!(tablet_id, %owner, sender_node, "lock owner is not on the sending node");
            return Response::status(Status::Error);
        }
        match current {
            Some(held) if held.owner == owner => {
                debug!(tablet_id, %owner, "lock renewed");
            }
            Some(held) => {
                if reconnect {
                    debug!(tablet_id, %owner, holder = %held.owner, "reconnect to a lock held by another owner");
                    return Response::status(Status::Error);
                }
                info!(tablet_id, %owner, previous = %held.owner, "lock taken over");
                self.notify(Notification::LockLost {
                    tablet_id,
                    owner: held.owner,
                    reason: LockLostReason::NewLock,
                });
            }
            None if reconnect => {
                debug!(tablet_id, %owner, "reconnect to a lock that is gone");
                return Response::status(Status::Error);
            }
            None => {}
        }

        let seq_no = self.next_lock_seq;
        self.next_lock_seq += 1;
        let timeout_ms = timeout_ms.map(|t| t.min(self.config.lock.max_timeout_ms));
        let Some(tablet) = self.tablets.get_mut(tablet_id) else {
            return Response::status(Status::Error);
        };
        tablet.record.lock = Some(LockRecord {
            owner,
            timeout_ms,
            locked_at_ms: now_ms,
            seq_no,
        });
        tablet.lock_expiry_pending = false;
        if let Err(e) = self.store.put_tablet(&tablet.record) {
            error!(tablet_id, error = %e, "failed to persist lock");
            tablet.record.lock = current;
            return Response::status(Status::Error);
        }
        let leader = ReplicaKey::leader(tablet_id);
        self.boot_queue.remove(leader);
        self.stop_replica(leader);
        info!(tablet_id, %owner, ?timeout_ms, seq_no, "tablet locked");
        Response::status(Status::Ok)
    }

    pub(crate) fn unlock_tablet(
        &mut self,
        tablet_id: TabletId,
        owner: LockOwner,
        sender_node: NodeId,
    ) -> Response {
        let current = match self.live_tablet(tablet_id) {
            Ok(tablet) => tablet.record.lock,
            Err(response) => return response,
        };
        match current {
            Some(held) if held.owner == owner && owner.node_id == sender_node => {
                self.release_lock(tablet_id, LockLostReason::Unlocked);
                Response::status(Status::Ok)
            }
            _ => {
                debug!(tablet_id, %owner, "unlock by a non-owner");
                Response::status(Status::Error)
            }
        }
    }

    /// Drop the lock, tell its owner why, and boot the leader again.
    pub(crate) fn release_lock(&mut self, tablet_id: TabletId, reason: LockLostReason) {
        let Some(tablet) = self.tablets.get_mut(tablet_id) else {
            return;
        };
        let Some(lock) = tablet.record.lock.take() else {
            return;
        };
        tablet.lock_expiry_pending = false;
        if let Err(e) = self.store.put_tablet(&tablet.record) {
            error!(tablet_id, error = %e, "failed to persist lock release");
        }
        info!(tablet_id, owner = %lock.owner, ?reason, "lock released");
        self.notify(Notification::LockLost {
            tablet_id,
            owner: lock.owner,
            reason,
        });
        self.enqueue(ReplicaKey::leader(tablet_id));
    }

    /// Reconnect window of a disconnected lock owner has elapsed.
    pub(crate) fn lock_expired(&mut self, tablet_id: TabletId, seq_no: u64) {
        let Some(tablet) = self.tablets.get(tablet_id) else {
            return;
        };
        let Some(lock) = tablet.record.lock else {
            return;
        };
        if lock.seq_no != seq_no {
            debug!(tablet_id, seq_no, current = lock.seq_no, "stale lock expiry");
            return;
        }
        // A returning owner re-locks with `reconnect`, which bumps the sequence.
        debug!(tablet_id, owner = %lock.owner, "lock owner did not reconnect in time");
        self.release_lock(tablet_id, LockLostReason::NodeDisconnected);
    }

    /// After a restart, every lock owner counts as disconnected: locks with a
    /// timeout get their reconnect window, the rest are released.
    pub(crate) fn restore_locks(&mut self) {
        let ids = self.tablets.ids();
        self.reclaim_locks(&ids, LockLostReason::HiveRestart);
    }

    /// Start the reconnect window of every lock held on `tablet_ids`; locks
    /// without a timeout are released at once.
    pub(crate) fn reclaim_locks(&mut self, tablet_ids: &[TabletId], reason: LockLostReason) {
        let locks: Vec<(TabletId, LockRecord)> = tablet_ids
            .iter()
            .filter_map(|id| self.tablets.get(*id))
            .filter(|t| !t.record.deleting)
            .filter_map(|t| t.record.lock.map(|l| (t.id(), l)))
            .collect();
        for (tablet_id, lock) in locks {
            match lock.timeout_ms {
                Some(timeout_ms) => {
                    if let Some(tablet) = self.tablets.get_mut(tablet_id) {
                        tablet.lock_expiry_pending = true;
                    }
                    self.arm(
                        timeout_ms,
                        Timer::LockExpiry {
                            tablet_id,
                            seq_no: lock.seq_no,
                        },
                    );
                }
                None => self.release_lock(tablet_id, reason),
            }
        }
    }

    /// Boot command for a lock owner that runs the leader itself.
    pub(crate) fn external_boot(&mut self, tablet_id: TabletId) -> Response {
        let locked = match self.live_tablet(tablet_id) {
            Ok(tablet) => tablet.is_locked(),
            Err(response) => return response,
        };
        if !locked {
            debug!(tablet_id, "external boot of an unlocked tablet");
            return Response::ExternalBoot {
                status: Status::Error,
                boot: None,
            };
        }
        let Some(tablet) = self.tablets.get_mut(tablet_id) else {
            return Response::status(Status::Error);
        };
        tablet.record.generation += 1;
        if let Err(e) = self.store.put_tablet(&tablet.record) {
            error!(tablet_id, error = %e, "failed to persist external boot generation");
            tablet.record.generation -= 1;
            return Response::ExternalBoot {
                status: Status::Error,
                boot: None,
            };
        }
        tablet.leader.generation = tablet.record.generation;
        let boot = BootCommand {
            tablet_id,
            follower_id: LEADER,
            role: tablet.leader.role(),
            generation: tablet.record.generation,
            tablet_type: tablet.record.tablet_type,
            channels: tablet.record.channels.clone(),
        };
        info!(tablet_id, generation = boot.generation, "external boot");
        Response::ExternalBoot {
            status: Status::Ok,
            boot: Some(boot),
        }
    }
}
