//! Handing a domain's tablets from a parent hive to a sub-hive.
//!
//! ```text
//!   sub-hive                              parent
//!   ────────                              ──────
//!   ConfigureHive   (Ready)
//!   InitMigration   (InProgress)
//!        │ SeizeTablets(domain, max) ───►  stop + mark seized, persist
//!        │ ◄─── SeizeTabletsReply(records)  (re-sends seized, unreleased)
//!   adopt if absent, persist progress
//!        │ ReleaseTablets(ids) ─────────►  drop rows, leave tombstones
//!        │ SeizeTablets ...
//!        │ ◄─── SeizeTabletsReply([])       (Complete)
//!   Complete
//! ```
//!
//! Every step is safe to repeat, so either side can restart at any point
//! and the sub-hive simply asks again.

use hive_core::{
    HiveId, LockLostReason, MigrationState, Status, SubDomainKey, TabletId, VolatileState,
};
use hive_state::{MigrationRecord, MigrationRole, TabletRecord};
use tracing::{debug, error, info, warn};

use crate::hive::Hive;
use crate::messages::{HiveMessage, Response};
use crate::tablet::Tablet;

fn migration_status(status: Status, record: Option<&MigrationRecord>) -> Response {
    Response::Migration {
        status,
        state: record.map(|r| r.state).unwrap_or_default(),
        migrated: record.map_or(0, |r| r.migrated),
    }
}

impl Hive {
    /// Parent of a domain this hive is still pulling tablets for.
    pub(crate) fn pulling_from(&self) -> Option<HiveId> {
        self.migrations
            .values()
            .find(|m| m.role == MigrationRole::Child && m.state == MigrationState::InProgress)
            .map(|m| m.peer_hive)
    }

    pub(crate) fn configure_hive(
        &mut self,
        domain: SubDomainKey,
        parent_hive: HiveId,
        now_ms: u64,
    ) -> Response {
        if parent_hive == self.hive_id() {
            warn!(%domain, "hive cannot migrate from itself");
            return Response::status(Status::Error);
        }
        if let Some(existing) = self.migrations.get(&domain) {
            if existing.role == MigrationRole::Child && existing.peer_hive == parent_hive {
                return Response::status(Status::Already);
            }
            warn!(%domain, parent_hive, current = existing.peer_hive, "domain already has a migration");
            return Response::status(Status::Error);
        }
        let record = MigrationRecord {
            domain,
            role: MigrationRole::Child,
            peer_hive: parent_hive,
            state: MigrationState::Ready,
            migrated: 0,
            updated_at_ms: now_ms,
        };
        if let Err(e) = self.store.put_migration(&record) {
            error!(%domain, error = %e, "failed to persist migration");
            return Response::status(Status::Error);
        }
        info!(%domain, parent_hive, "sub-hive configured");
        self.migrations.insert(domain, record);
        Response::status(Status::Ok)
    }

    pub(crate) fn init_migration(&mut self, domain: SubDomainKey, now_ms: u64) -> Response {
        let Some(record) = self.migrations.get(&domain) else {
            return migration_status(Status::Error, None);
        };
        if record.role != MigrationRole::Child {
            return migration_status(Status::Error, Some(record));
        }
        if record.state != MigrationState::Ready {
            return migration_status(Status::Already, Some(record));
        }
        let mut record = record.clone();
        record.state = MigrationState::InProgress;
        record.updated_at_ms = now_ms;
        if let Err(e) = self.store.put_migration(&record) {
            error!(%domain, error = %e, "failed to persist migration start");
            return migration_status(Status::Error, self.migrations.get(&domain));
        }
        info!(%domain, parent_hive = record.peer_hive, "migration started");
        let response = migration_status(Status::Ok, Some(&record));
        self.request_seize(&record);
        self.migrations.insert(domain, record);
        response
    }

    pub(crate) fn query_migration(&self, domain: SubDomainKey) -> Response {
        migration_status(Status::Ok, self.migrations.get(&domain))
    }

    /// Ask parents again for every migration interrupted by a restart.
    pub(crate) fn resume_migrations(&mut self) {
        let pending: Vec<MigrationRecord> = self
            .migrations
            .values()
            .filter(|m| m.role == MigrationRole::Child && m.state == MigrationState::InProgress)
            .cloned()
            .collect();
        for record in pending {
            info!(domain = %record.domain, migrated = record.migrated, "resuming migration");
            self.request_seize(&record);
        }
    }

    fn request_seize(&mut self, record: &MigrationRecord) {
        let message = HiveMessage::SeizeTablets {
            from: self.hive_id(),
            domain: record.domain,
            max: self.config.migration.batch_size.max(1),
        };
        self.send_hive(record.peer_hive, message);
    }

    pub(crate) fn on_hive_message(&mut self, message: HiveMessage, now_ms: u64) {
        match message {
            HiveMessage::SeizeTablets { from, domain, max } => {
                self.seize_tablets(from, domain, max, now_ms)
            }
            HiveMessage::SeizeTabletsReply {
                from,
                domain,
                tablets,
            } => self.adopt_tablets(from, domain, tablets, now_ms),
            HiveMessage::ReleaseTablets {
                from,
                domain,
                tablet_ids,
            } => self.release_tablets(from, domain, &tablet_ids, now_ms),
        }
    }

    // ── Parent side ────────────────────────────────────────────────

    fn seize_tablets(&mut self, from: HiveId, domain: SubDomainKey, max: usize, now_ms: u64) {
        if from == self.hive_id() {
            warn!(%domain, "seize request from self ignored");
            return;
        }
        let record = match self.migrations.get(&domain) {
            Some(existing) if existing.role != MigrationRole::Parent || existing.peer_hive != from => {
                warn!(%domain, from, peer = existing.peer_hive, "seize from an unexpected hive");
                return;
            }
            Some(existing) => existing.clone(),
            None => MigrationRecord {
                domain,
                role: MigrationRole::Parent,
                peer_hive: from,
                state: MigrationState::InProgress,
                migrated: 0,
                updated_at_ms: now_ms,
            },
        };
        if !self.migrations.contains_key(&domain) {
            if let Err(e) = self.store.put_migration(&record) {
                error!(%domain, error = %e, "failed to persist delegation");
                return;
            }
            info!(%domain, sub_hive = from, "domain delegated");
            self.migrations.insert(domain, record.clone());
        }

        let in_domain = |t: &&Tablet| t.record.object_domain == Some(domain);
        let mut selected: Vec<TabletId> = self
            .tablets
            .iter()
            .filter(in_domain)
            .filter(|t| t.record.seized_by == Some(from))
            .map(|t| t.id())
            .take(max)
            .collect();
        let fresh: Vec<TabletId> = self
            .tablets
            .iter()
            .filter(in_domain)
            .filter(|t| t.record.seized_by.is_none() && !t.record.deleting)
            .map(|t| t.id())
            .take(max.saturating_sub(selected.len()))
            .collect();
        for tablet_id in fresh {
            if self.seize_tablet(tablet_id, from) {
                selected.push(tablet_id);
            }
        }

        let records: Vec<TabletRecord> = selected
            .iter()
            .filter_map(|id| self.tablets.get(*id))
            .map(|t| t.record.clone())
            .collect();
        debug!(%domain, sub_hive = from, tablets = records.len(), "seize reply");
        if records.is_empty() && record.state != MigrationState::Complete {
            let mut done = record;
            done.state = MigrationState::Complete;
            done.updated_at_ms = now_ms;
            match self.store.put_migration(&done) {
                Ok(()) => {
                    info!(%domain, sub_hive = from, migrated = done.migrated, "domain handed over");
                    self.migrations.insert(domain, done);
                }
                Err(e) => error!(%domain, error = %e, "failed to persist delegation"),
            }
        }
        self.send_hive(
            from,
            HiveMessage::SeizeTabletsReply {
                from: self.hive_id(),
                domain,
                tablets: records,
            },
        );
    }

    /// Stop a tablet and mark it as belonging to `to`. Returns false if the
    /// mark could not be persisted.
    fn seize_tablet(&mut self, tablet_id: TabletId, to: HiveId) -> bool {
        let keys: Vec<_> = match self.tablets.get(tablet_id) {
            Some(tablet) => tablet.replicas().map(|r| r.key).collect(),
            None => return false,
        };
        if let Some(tablet) = self.tablets.get_mut(tablet_id) {
            tablet.record.seized_by = Some(to);
        }
        if !self.persist_tablet(tablet_id) {
            if let Some(tablet) = self.tablets.get_mut(tablet_id) {
                tablet.record.seized_by = None;
            }
            return false;
        }
        for key in keys {
            self.boot_queue.remove(key);
            self.balancer.moves.remove(&key);
            self.stop_replica(key);
            self.on_drain_progress(key);
            if let Some(replica) = self.tablets.replica_mut(key) {
                replica.state = VolatileState::Migrating;
            }
        }
        self.storage_balancer.moves.remove(&tablet_id);
        debug!(tablet_id, sub_hive = to, "tablet seized");
        true
    }

    fn release_tablets(
        &mut self,
        from: HiveId,
        domain: SubDomainKey,
        tablet_ids: &[TabletId],
        now_ms: u64,
    ) {
        let Some(record) = self.migrations.get(&domain) else {
            warn!(%domain, from, "release for a domain that is not delegated");
            return;
        };
        if record.role != MigrationRole::Parent || record.peer_hive != from {
            warn!(%domain, from, "release from an unexpected hive");
            return;
        }
        let released: Vec<_> = tablet_ids
            .iter()
            .filter_map(|id| self.tablets.get(*id))
            .filter(|t| t.record.seized_by == Some(from))
            .map(|t| (t.id(), t.record.owner))
            .collect();
        if released.is_empty() {
            return;
        }
        let mut progress = record.clone();
        progress.migrated += released.len() as u64;
        progress.updated_at_ms = now_ms;
        if let Err(e) = self.store.release_tablets(&released, from, &progress) {
            error!(%domain, error = %e, "failed to release tablets");
            return;
        }
        for (tablet_id, _) in &released {
            if let Some(tablet) = self.tablets.remove(*tablet_id) {
                for replica in tablet.replicas() {
                    self.nodes.detach(replica.node_id, replica.key);
                }
            }
            self.forwarded.insert(*tablet_id, from);
        }
        info!(%domain, sub_hive = from, released = released.len(), migrated = progress.migrated, "tablets released");
        self.migrations.insert(domain, progress);
    }

    // ── Sub-hive side ──────────────────────────────────────────────

    fn adopt_tablets(
        &mut self,
        from: HiveId,
        domain: SubDomainKey,
        tablets: Vec<TabletRecord>,
        now_ms: u64,
    ) {
        let record = match self.migrations.get(&domain) {
            Some(r)
                if r.role == MigrationRole::Child
                    && r.peer_hive == from
                    && r.state == MigrationState::InProgress =>
            {
                r.clone()
            }
            _ => {
                debug!(%domain, from, "seize reply outside a running migration");
                return;
            }
        };
        if tablets.is_empty() {
            let mut done = record;
            done.state = MigrationState::Complete;
            done.updated_at_ms = now_ms;
            if let Err(e) = self.store.put_migration(&done) {
                error!(%domain, error = %e, "failed to persist migration completion");
                return;
            }
            info!(%domain, migrated = done.migrated, "migration complete");
            self.migrations.insert(domain, done);
            return;
        }

        let tablets: Vec<TabletRecord> = tablets
            .into_iter()
            .map(|mut t| {
                t.seized_by = None;
                t.node_id = 0;
                for follower in &mut t.followers {
                    follower.node_id = 0;
                }
                t
            })
            .collect();
        let fresh: Vec<TabletRecord> = tablets
            .iter()
            .filter(|t| !self.tablets.contains(t.tablet_id))
            .cloned()
            .collect();
        let mut progress = record;
        progress.migrated += fresh.len() as u64;
        progress.updated_at_ms = now_ms;
        if let Err(e) = self.store.adopt_tablets(&fresh, &progress) {
            error!(%domain, error = %e, "failed to adopt tablets");
            return;
        }
        let fresh_ids: Vec<TabletId> = fresh.iter().map(|t| t.tablet_id).collect();
        for record in fresh {
            if let Some(lock) = record.lock {
                self.next_lock_seq = self.next_lock_seq.max(lock.seq_no + 1);
            }
            self.tablets.insert(Tablet::from_record(record));
        }
        self.reclaim_locks(&fresh_ids, LockLostReason::NodeDisconnected);
        for tablet_id in &fresh_ids {
            self.enqueue_tablet(*tablet_id);
        }
        info!(%domain, adopted = fresh_ids.len(), migrated = progress.migrated, "tablets adopted");

        let tablet_ids = tablets.iter().map(|t| t.tablet_id).collect();
        self.send_hive(
            from,
            HiveMessage::ReleaseTablets {
                from: self.hive_id(),
                domain,
                tablet_ids,
            },
        );
        self.request_seize(&progress);
        self.migrations.insert(domain, progress);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_core::HiveConfig;
    use hive_state::StateStore;

    use crate::messages::Request;

    fn hive(hive_id: u64) -> Hive {
        let config = HiveConfig {
            hive_id,
            ..HiveConfig::default()
        };
        Hive::load(config, StateStore::open_in_memory().unwrap(), 0).unwrap()
    }

    #[test]
    fn self_migration_is_rejected() {
        let mut hive = hive(7);
        let domain = SubDomainKey::new(1, 2);
        let response = hive.request(
            Request::ConfigureHive {
                domain,
                parent_hive: 7,
            },
            0,
        );
        assert_eq!(response.status_code(), Status::Error);
    }

    #[test]
    fn init_requires_configuration() {
        let mut hive = hive(8);
        let domain = SubDomainKey::new(1, 2);
        let response = hive.request(Request::InitMigration { domain }, 0);
        assert!(matches!(
            response,
            Response::Migration {
                status: Status::Error,
                state: MigrationState::NotReady,
                ..
            }
        ));

        hive.request(
            Request::ConfigureHive {
                domain,
                parent_hive: 1,
            },
            0,
        );
        hive.take_effects();
        let response = hive.request(Request::InitMigration { domain }, 0);
        assert!(matches!(
            response,
            Response::Migration {
                status: Status::Ok,
                state: MigrationState::InProgress,
                ..
            }
        ));
        let seized = hive.take_effects().into_iter().any(|e| {
            matches!(
                e,
                crate::messages::Effect::Hive {
                    hive_id: 1,
                    message: HiveMessage::SeizeTablets { from: 8, .. },
                }
            )
        });
        assert!(seized);
        let again = hive.request(Request::InitMigration { domain }, 0);
        assert_eq!(again.status_code(), Status::Already);
    }
}
