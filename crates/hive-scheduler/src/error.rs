//! Scheduler error types.
//!
//! Protocol outcomes such as `ALREADY` or `BLOCKED` are [`hive_core::Status`]
//! values inside replies. `HiveError` covers infrastructure failures only.

use hive_core::{NodeId, TabletId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HiveError {
    #[error("state store error: {0}")]
    State(#[from] hive_state::StateError),

    #[error("unknown tablet: {0}")]
    UnknownTablet(TabletId),

    #[error("unknown node: {0}")]
    UnknownNode(NodeId),

    #[error("hive runtime stopped")]
    Stopped,

    #[error("runtime error: {0}")]
    Runtime(#[from] anyhow::Error),
}

pub type HiveResult<T> = Result<T, HiveError>;
