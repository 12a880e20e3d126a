//! hive.toml configuration parser.
//!
//! Every section is optional; missing fields fall back to the defaults
//! below. Durations are in milliseconds.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::types::{HiveId, ResourceValues, ResourceWeights, SubDomainKey, TabletId};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HiveConfig {
    /// Tablet id of this hive instance.
    pub hive_id: HiveId,
    /// Domain the hive serves when no sub-domain is given.
    pub root_domain: SubDomainKey,
    /// First tablet id handed out by `CreateTablet`.
    pub tablet_id_base: TabletId,
    /// Seed for randomized node selection and retry jitter.
    pub seed: u64,
    pub boot: BootConfig,
    pub balancer: BalancerConfig,
    pub storage_balancer: StorageBalancerConfig,
    pub lock: LockConfig,
    pub node: NodeConfig,
    pub migration: MigrationConfig,
    pub scale_recommender: ScaleRecommenderConfig,
}

impl Default for HiveConfig {
    fn default() -> Self {
        Self {
            hive_id: 72_057_594_037_968_897,
            root_domain: SubDomainKey::new(72_057_594_046_678_944, 1),
            tablet_id_base: 72_075_186_224_037_888,
            seed: 0,
            boot: BootConfig::default(),
            balancer: BalancerConfig::default(),
            storage_balancer: StorageBalancerConfig::default(),
            lock: LockConfig::default(),
            node: NodeConfig::default(),
            migration: MigrationConfig::default(),
            scale_recommender: ScaleRecommenderConfig::default(),
        }
    }
}

/// How many queued tablets are placed per boot-queue sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootStrategy {
    /// Place up to `max_boot_batch_size` tablets per sweep.
    #[default]
    Heavy,
    /// One tablet per sweep; the next sweep is scheduled immediately.
    Balanced,
}

/// How a node is picked among the valid candidates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeSelectStrategy {
    #[default]
    ExactMin,
    /// Uniformly among candidates scoring within 7% of the best one.
    RandomMin7p,
    /// Weighted by free headroom.
    WeightedRandom,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootConfig {
    pub strategy: BootStrategy,
    pub node_select_strategy: NodeSelectStrategy,
    pub max_boot_batch_size: usize,
    /// In-flight boot cap; excess stays queued.
    pub max_tablets_scheduled: usize,
    pub retry_min_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Sweep period for tablets parked in the wait queue.
    pub wait_queue_retry_ms: u64,
    /// Boot failures within `bad_node_window_ms` that mark a node as bad.
    pub bad_node_failures: u32,
    pub bad_node_window_ms: u64,
    pub bad_node_skip_ms: u64,
    pub resource_weights: ResourceWeights,
    /// Node maximums used when a node does not declare them. CPU is in
    /// microseconds of CPU time per second, so the default is one core and
    /// tablets must report CPU in the same unit. Clusters whose nodes report
    /// on another scale set `max` at registration or override this.
    pub default_node_max: ResourceValues,
    /// Usage assumed for a tablet that has not reported metrics yet.
    pub default_tablet_usage: ResourceValues,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            strategy: BootStrategy::Heavy,
            node_select_strategy: NodeSelectStrategy::ExactMin,
            max_boot_batch_size: 1000,
            max_tablets_scheduled: 100,
            retry_min_delay_ms: 100,
            retry_max_delay_ms: 30_000,
            wait_queue_retry_ms: 1000,
            bad_node_failures: 3,
            bad_node_window_ms: 60_000,
            bad_node_skip_ms: 30_000,
            resource_weights: ResourceWeights::default(),
            default_node_max: ResourceValues::new(1_000_000, 512 << 30, 1 << 30, 100_000),
            default_tablet_usage: ResourceValues::new(0, 0, 0, 1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    pub min_period_between_balance_ms: u64,
    pub min_period_between_emergency_ms: u64,
    /// Normalized max-min spread that starts a resource-dimension pass.
    pub min_scatter_to_balance: f64,
    /// Tablet-count spread that starts a counter pass.
    pub min_counter_difference_to_balance: u64,
    /// Node usage that triggers the emergency balancer.
    pub max_node_usage_to_kick: f64,
    /// Nodes below this usage are never balanced from.
    pub min_node_usage_to_balance: f64,
    pub max_movements: usize,
    pub max_emergency_movements: usize,
    pub max_inflight_movements: usize,
    pub tablet_move_cooldown_ms: u64,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 10_000,
            min_period_between_balance_ms: 5_000,
            min_period_between_emergency_ms: 1_000,
            min_scatter_to_balance: 0.5,
            min_counter_difference_to_balance: 2,
            max_node_usage_to_kick: 0.9,
            min_node_usage_to_balance: 0.1,
            max_movements: 10,
            max_emergency_movements: 5,
            max_inflight_movements: 10,
            tablet_move_cooldown_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageBalancerConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    /// Occupancy spread across a pool's groups that starts a pass.
    pub min_scatter: f64,
    pub max_inflight: usize,
    pub min_period_between_reassign_ms: u64,
    pub group_ineligible_period_ms: u64,
}

impl Default for StorageBalancerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 60_000,
            min_scatter: 0.3,
            max_inflight: 1,
            min_period_between_reassign_ms: 600_000,
            group_ineligible_period_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Upper bound for a requested reconnect timeout.
    pub max_timeout_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            max_timeout_ms: 3_600_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Delay between a node disconnect and reassignment of its tablets.
    pub disconnect_grace_ms: u64,
    pub max_drain_inflight: usize,
    /// Window over which aggregate usage reports are maxed.
    pub usage_window_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            disconnect_grace_ms: 5_000,
            max_drain_inflight: 10,
            usage_window_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Tablets requested per `SeizeTablets` round.
    pub batch_size: usize,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self { batch_size: 100 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScaleRecommenderConfig {
    /// Usage samples needed before a recommendation is produced.
    pub history_size: usize,
    pub sample_interval_ms: u64,
    pub default_target_utilization: f64,
}

impl Default for ScaleRecommenderConfig {
    fn default() -> Self {
        Self {
            history_size: 15,
            sample_interval_ms: 10_000,
            default_target_utilization: 0.7,
        }
    }
}

impl HiveConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: HiveConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn with_hive_id(mut self, hive_id: HiveId) -> Self {
        self.hive_id = hive_id;
        self
    }

    pub fn with_root_domain(mut self, domain: SubDomainKey) -> Self {
        self.root_domain = domain;
        self
    }

    pub fn with_tablet_id_base(mut self, base: TabletId) -> Self {
        self.tablet_id_base = base;
        self
    }
}
