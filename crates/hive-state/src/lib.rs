//! hive-state: embedded state store for a hive.
//!
//! Backed by [redb](https://docs.rs/redb). Persists everything a hive needs
//! to rebuild its registries after a restart:
//!
//! - tablet rows (definition, channel history, last placement, lock)
//! - node registration and operator flags
//! - domain records and migration progress
//! - tombstones for deleted and migrated identities
//! - the tablet-id sequence
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`).

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
