//! StateStore: redb-backed persistence for a hive.
//!
//! All values are JSON documents in `&str`-keyed tables. Multi-row updates
//! that must land together (migration adoption and release) go through a
//! single write transaction.

use std::path::Path;
use std::sync::Arc;

use hive_core::{HiveId, OwnerKey, SubDomainKey, TabletId};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for table in [TABLETS, TOMBSTONES, NODES, DOMAINS, MIGRATIONS, META] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic helpers ────────────────────────────────────────────

    fn put<T: Serialize>(&self, table: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let value = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            t.insert(key, value.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, table: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        match t.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn list<T: DeserializeOwned>(&self, table: JsonTable) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in t.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
        }
        Ok(results)
    }

    // ── Tablets ────────────────────────────────────────────────────

    pub fn put_tablet(&self, tablet: &TabletRecord) -> StateResult<()> {
        self.put(TABLETS, &tablet.table_key(), tablet)
    }

    pub fn get_tablet(&self, tablet_id: TabletId) -> StateResult<Option<TabletRecord>> {
        self.get(TABLETS, &tablet_id.to_string())
    }

    pub fn list_tablets(&self) -> StateResult<Vec<TabletRecord>> {
        self.list(TABLETS)
    }

    /// Remove a tablet row and leave a `Deleted` tombstone for its identity.
    pub fn delete_tablet(&self, tablet_id: TabletId, owner: OwnerKey) -> StateResult<bool> {
        let tombstone = Tombstone::Deleted { tablet_id };
        let value = serde_json::to_vec(&tombstone).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut tablets = txn.open_table(TABLETS).map_err(map_err!(Table))?;
            existed = tablets
                .remove(tablet_id.to_string().as_str())
                .map_err(map_err!(Write))?
                .is_some();
            let mut tombstones = txn.open_table(TOMBSTONES).map_err(map_err!(Table))?;
            tombstones
                .insert(owner.table_key().as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(tablet_id, %owner, existed, "tablet deleted");
        Ok(existed)
    }

    /// Hand out the next tablet id, starting at `base` on a fresh store.
    pub fn allocate_tablet_id(&self, base: TabletId) -> StateResult<TabletId> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let id;
        {
            let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
            let current: Option<TabletId> = match meta.get(NEXT_TABLET_ID).map_err(map_err!(Read))? {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };
            id = current.unwrap_or(base).max(base);
            let next = serde_json::to_vec(&(id + 1)).map_err(map_err!(Serialize))?;
            meta.insert(NEXT_TABLET_ID, next.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(id)
    }

    // ── Tombstones ─────────────────────────────────────────────────

    pub fn get_tombstone(&self, owner: OwnerKey) -> StateResult<Option<Tombstone>> {
        self.get(TOMBSTONES, &owner.table_key())
    }

    /// All tombstones with their owner keys.
    pub fn list_tombstones(&self) -> StateResult<Vec<(OwnerKey, Tombstone)>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(TOMBSTONES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in t.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            let Some(owner) = parse_owner_key(key.value()) else {
                return Err(StateError::Deserialize(format!(
                    "bad tombstone key {}",
                    key.value()
                )));
            };
            let tombstone: Tombstone =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push((owner, tombstone));
        }
        Ok(results)
    }

    // ── Migration transfer ─────────────────────────────────────────

    /// Insert tablets that are not stored yet and record progress, atomically.
    /// Returns how many rows were new.
    pub fn adopt_tablets(
        &self,
        tablets: &[TabletRecord],
        progress: &MigrationRecord,
    ) -> StateResult<usize> {
        let progress_value = serde_json::to_vec(progress).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut inserted = 0;
        {
            let mut table = txn.open_table(TABLETS).map_err(map_err!(Table))?;
            for tablet in tablets {
                let key = tablet.table_key();
                if table.get(key.as_str()).map_err(map_err!(Read))?.is_some() {
                    continue;
                }
                let value = serde_json::to_vec(tablet).map_err(map_err!(Serialize))?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
                inserted += 1;
            }
            let mut migrations = txn.open_table(MIGRATIONS).map_err(map_err!(Table))?;
            migrations
                .insert(progress.table_key().as_str(), progress_value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(inserted, domain = %progress.domain, "tablets adopted");
        Ok(inserted)
    }

    /// Drop tablets now owned by `hive_id` and leave forwarding tombstones.
    pub fn release_tablets(
        &self,
        tablets: &[(TabletId, OwnerKey)],
        hive_id: HiveId,
        progress: &MigrationRecord,
    ) -> StateResult<()> {
        let progress_value = serde_json::to_vec(progress).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(TABLETS).map_err(map_err!(Table))?;
            let mut tombstones = txn.open_table(TOMBSTONES).map_err(map_err!(Table))?;
            for (tablet_id, owner) in tablets {
                table
                    .remove(tablet_id.to_string().as_str())
                    .map_err(map_err!(Write))?;
                let tombstone = Tombstone::Migrated {
                    tablet_id: *tablet_id,
                    hive_id,
                };
                let value = serde_json::to_vec(&tombstone).map_err(map_err!(Serialize))?;
                tombstones
                    .insert(owner.table_key().as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
            let mut migrations = txn.open_table(MIGRATIONS).map_err(map_err!(Table))?;
            migrations
                .insert(progress.table_key().as_str(), progress_value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(released = tablets.len(), hive_id, "tablets released");
        Ok(())
    }

    // ── Nodes ──────────────────────────────────────────────────────

    pub fn put_node(&self, node: &NodeRecord) -> StateResult<()> {
        self.put(NODES, &node.table_key(), node)
    }

    pub fn list_nodes(&self) -> StateResult<Vec<NodeRecord>> {
        self.list(NODES)
    }

    // ── Domains ────────────────────────────────────────────────────

    pub fn put_domain(&self, domain: &DomainRecord) -> StateResult<()> {
        self.put(DOMAINS, &domain.key.table_key(), domain)
    }

    pub fn list_domains(&self) -> StateResult<Vec<DomainRecord>> {
        self.list(DOMAINS)
    }

    // ── Migrations ─────────────────────────────────────────────────

    pub fn put_migration(&self, record: &MigrationRecord) -> StateResult<()> {
        self.put(MIGRATIONS, &record.table_key(), record)
    }

    pub fn get_migration(&self, domain: SubDomainKey) -> StateResult<Option<MigrationRecord>> {
        self.get(MIGRATIONS, &domain.table_key())
    }

    pub fn list_migrations(&self) -> StateResult<Vec<MigrationRecord>> {
        self.list(MIGRATIONS)
    }
}

fn parse_owner_key(key: &str) -> Option<OwnerKey> {
    let (owner_id, owner_idx) = key.split_once(':')?;
    Some(OwnerKey::new(owner_id.parse().ok()?, owner_idx.parse().ok()?))
}
