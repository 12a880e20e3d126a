//! hive-scheduler: the tablet scheduler.
//!
//! A hive owns a set of tablets and decides which worker node runs each
//! replica. It boots replicas in priority order, rebalances compute and
//! storage, lends tablets to external lock owners and can hand a domain's
//! tablets to a sub-hive.
//!
//! # Architecture
//!
//! ```text
//! HiveRuntime (single task, serialized)
//!   └── Hive
//!       ├── NodeRegistry     nodes, liveness, usage windows
//!       ├── TabletRegistry   records + leader/follower replicas
//!       ├── StorageRegistry  pools and group occupancy
//!       ├── BootQueue        priority queue, wait queue, backoff
//!       ├── balancer         regular and emergency passes
//!       ├── storage_balancer channel moves between groups
//!       ├── lock             execution locks
//!       ├── migration        parent/sub-hive handover
//!       └── StateStore       redb persistence
//! ```
//!
//! Handlers never block: they update state, persist, and queue
//! [`Effect`]s for the runtime to carry out.

pub mod balancer;
pub mod boot;
pub mod error;
pub mod hive;
pub mod lock;
pub mod messages;
pub mod migration;
pub mod node;
pub mod node_ops;
pub mod runtime;
pub mod storage;
pub mod storage_balancer;
pub mod tablet;
pub mod tablet_ops;

pub use boot::BootQueue;
pub use error::{HiveError, HiveResult};
pub use hive::Hive;
pub use messages::{
    BootCommand, CreateTablet, Effect, Event, HiveMessage, InfoFilter, NodeCommand, Notification,
    RegisterNode, ReplicaStatus, Request, Response, StorageGroupReport, TabletInfo, TabletUsage,
    Timer,
};
pub use runtime::{ChannelOutbox, HiveHandle, HiveRuntime, LogOutbox, Outbox, epoch_ms};
