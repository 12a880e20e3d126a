//! Storage pools and groups as reported by the storage subsystem.

use std::collections::BTreeMap;

use hive_core::{GroupId, TabletChannel};
use hive_placement::{GroupView, least_occupied};

use crate::messages::StorageGroupReport;

#[derive(Debug, Clone)]
pub struct StorageGroup {
    pub group_id: GroupId,
    pub capacity: u64,
    pub allocated: u64,
    /// The group rejected an allocation; skip it until then.
    pub ineligible_until_ms: u64,
}

impl StorageGroup {
    pub fn occupancy(&self) -> f64 {
        if self.capacity == 0 {
            1.0
        } else {
            self.allocated as f64 / self.capacity as f64
        }
    }
}

#[derive(Debug, Default)]
pub struct StorageRegistry {
    pools: BTreeMap<String, BTreeMap<GroupId, StorageGroup>>,
}

impl StorageRegistry {
    /// Replace a pool's group list, keeping cool-off deadlines of known groups.
    pub fn update_pool(&mut self, pool: &str, reports: &[StorageGroupReport]) {
        let previous = self.pools.remove(pool).unwrap_or_default();
        let groups = reports
            .iter()
            .map(|r| {
                let ineligible_until_ms = previous
                    .get(&r.group_id)
                    .map_or(0, |g| g.ineligible_until_ms);
                (
                    r.group_id,
                    StorageGroup {
                        group_id: r.group_id,
                        capacity: r.capacity,
                        allocated: r.allocated,
                        ineligible_until_ms,
                    },
                )
            })
            .collect();
        self.pools.insert(pool.to_string(), groups);
    }

    pub fn has_pool(&self, pool: &str) -> bool {
        self.pools.contains_key(pool)
    }

    pub fn pool_names(&self) -> Vec<String> {
        self.pools.keys().cloned().collect()
    }

    pub fn pool_contains(&self, pool: &str, group_id: GroupId) -> bool {
        self.pools
            .get(pool)
            .is_some_and(|groups| groups.contains_key(&group_id))
    }

    pub fn group_views(&self, pool: &str, now_ms: u64) -> Vec<GroupView> {
        self.pools
            .get(pool)
            .map(|groups| {
                groups
                    .values()
                    .map(|g| GroupView {
                        group_id: g.group_id,
                        occupancy: g.occupancy(),
                        eligible: g.ineligible_until_ms <= now_ms,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Group with the most free space in `pool`, other than `exclude`.
    pub fn select_group(&self, pool: &str, exclude: Option<GroupId>, now_ms: u64) -> Option<GroupId> {
        least_occupied(&self.group_views(pool, now_ms), exclude)
    }

    pub fn mark_ineligible(&mut self, group_id: GroupId, until_ms: u64) {
        for groups in self.pools.values_mut() {
            if let Some(g) = groups.get_mut(&group_id) {
                g.ineligible_until_ms = g.ineligible_until_ms.max(until_ms);
            }
        }
    }

    /// Problems with a channel's current binding, if any.
    pub fn check_channel(&self, channel: &TabletChannel) -> Option<String> {
        let pool = &channel.binding.storage_pool;
        match channel.current_group() {
            None => Some(format!("channel {} has no storage group", channel.index)),
            Some(group) if self.has_pool(pool) && !self.pool_contains(pool, group) => Some(format!(
                "channel {} group {} is not in pool {}",
                channel.index, group, pool
            )),
            Some(_) => None,
        }
    }
}
