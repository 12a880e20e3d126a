//! redb table definitions for the hive state store.
//!
//! Keys are strings, values are JSON documents. Numeric ids are written
//! in decimal; composite keys use `{a}:{b}`.

use redb::TableDefinition;

/// Tablet rows keyed by `{tablet_id}`. The execution lock lives in the row.
pub const TABLETS: TableDefinition<&str, &[u8]> = TableDefinition::new("tablets");

/// Deleted or migrated-away identities keyed by `{owner_id}:{owner_idx}`.
pub const TOMBSTONES: TableDefinition<&str, &[u8]> = TableDefinition::new("tombstones");

/// Node rows keyed by `{node_id}`.
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");

/// Domain records keyed by `{owner_id}:{path_id}`.
pub const DOMAINS: TableDefinition<&str, &[u8]> = TableDefinition::new("domains");

/// Migration progress keyed by domain.
pub const MIGRATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("migrations");

/// Counters and scalar settings keyed by name.
pub const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

/// Key in [`META`] holding the next free tablet id.
pub const NEXT_TABLET_ID: &str = "next_tablet_id";
