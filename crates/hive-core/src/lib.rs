pub mod config;
pub mod types;

pub use config::HiveConfig;
pub use types::*;
