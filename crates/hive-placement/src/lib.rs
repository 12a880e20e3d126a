//! Placement decisions for a hive.
//!
//! Everything here is pure: callers build views of nodes and replicas from
//! their registries and get back a decision. Nothing is mutated and no
//! I/O happens, which keeps the scheduler's event handlers deterministic
//! for a given RNG seed.
//!
//! # Components
//!
//! - **`scorer`**: node usage score for a prospective replica
//! - **`placer`**: candidate filtering, tiering and node selection
//! - **`balance`**: balancer move planning across resource dimensions
//! - **`storage`**: storage-group rebalancing within a pool

pub mod balance;
pub mod placer;
pub mod scorer;
pub mod storage;

pub use balance::{BalanceKind, BalanceNode, BalanceParams, BalanceReplica, Move, plan_moves};
pub use placer::{Placement, PlacementRequest, SpreadConstraint, Unplaceable, admits, place};
pub use scorer::{NodeView, score_node};
pub use storage::{ChannelView, GroupView, StorageMove, least_occupied, plan_storage_moves};
