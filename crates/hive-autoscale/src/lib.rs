//! hive-autoscale: node count recommendations per domain.
//!
//! The hive samples the average node usage of every domain on a timer and
//! feeds it here. Once a domain has a full window of samples, the
//! recommender answers with the node count that would bring usage down
//! (or up) to the configured target.
//!
//! # Algorithm
//!
//! ```text
//! usage       = max(sample window)
//! recommended = max(1, ceil(current_nodes * usage / target_utilization))
//! ```
//!
//! Until the window is full the answer is `NotReady`.

pub mod recommender;

pub use recommender::{Recommendation, ScalePolicy, ScaleRecommender};
