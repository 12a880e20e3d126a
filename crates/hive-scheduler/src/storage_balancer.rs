//! Storage balancing: moving tablet channels between storage groups.
//!
//! A channel move appends a history entry effective from the tablet's next
//! generation and restarts the leader so it boots with the new group.

use std::collections::HashSet;

use hive_core::{ChannelHistoryEntry, GroupId, Status, TabletId};
use hive_placement::{ChannelView, plan_storage_moves};
use tracing::{debug, info, warn};

use crate::hive::Hive;
use crate::messages::Response;

#[derive(Debug, Default)]
pub struct StorageBalancerState {
    /// Tablets restarted for a channel move, until their leader runs again.
    pub moves: HashSet<TabletId>,
}

impl Hive {
    pub(crate) fn storage_balancer_tick(&mut self, now_ms: u64) {
        let config = &self.config.storage_balancer;
        if !config.enabled {
            return;
        }
        let mut budget = config.max_inflight.saturating_sub(self.storage_balancer.moves.len());
        let min_scatter = config.min_scatter;
        let min_period = config.min_period_between_reassign_ms;
        if budget == 0 {
            debug!(in_flight = self.storage_balancer.moves.len(), "storage balancer has no budget");
            return;
        }
        for pool in self.storage.pool_names() {
            if budget == 0 {
                break;
            }
            let groups = self.storage.group_views(&pool, now_ms);
            let mut channels = Vec::new();
            for tablet in self.tablets.iter() {
                if tablet.record.deleting || tablet.is_migrating() {
                    continue;
                }
                let movable = !tablet.is_locked()
                    && now_ms.saturating_sub(tablet.record.last_reassign_ms) >= min_period
                    && !self.storage_balancer.moves.contains(&tablet.id());
                for channel in &tablet.record.channels {
                    if channel.binding.storage_pool != pool {
                        continue;
                    }
                    if let Some(group_id) = channel.current_group() {
                        channels.push(ChannelView {
                            tablet_id: tablet.id(),
                            channel: channel.index,
                            group_id,
                            movable,
                        });
                    }
                }
            }
            let moves = plan_storage_moves(&groups, &channels, min_scatter, budget);
            for mv in moves {
                info!(
                    tablet_id = mv.tablet_id,
                    channel = mv.channel,
                    from = mv.from_group,
                    to = mv.to_group,
                    %pool,
                    "storage balancer move"
                );
                if self.move_channel(mv.tablet_id, mv.channel, mv.to_group, now_ms) {
                    self.persist_tablet(mv.tablet_id);
                    self.storage_balancer.moves.insert(mv.tablet_id);
                    self.restart_leader(mv.tablet_id);
                    budget = budget.saturating_sub(1);
                }
            }
        }
    }

    /// Point a channel at `group_id` from the next generation on.
    fn move_channel(&mut self, tablet_id: TabletId, index: u32, group_id: GroupId, now_ms: u64) -> bool {
        let Some(tablet) = self.tablets.get_mut(tablet_id) else {
            return false;
        };
        let from_generation = tablet.record.generation + 1;
        let Some(channel) = tablet.record.channels.iter_mut().find(|c| c.index == index) else {
            return false;
        };
        if channel.current_group() == Some(group_id) {
            return false;
        }
        channel.history.push(ChannelHistoryEntry {
            from_generation,
            group_id,
            timestamp_ms: now_ms,
        });
        tablet.record.last_reassign_ms = now_ms;
        true
    }

    /// Move the listed channels (all when empty) to the least occupied other
    /// group of their pool. Returns how many moved. Persists the tablet.
    pub(crate) fn renew_channels(&mut self, tablet_id: TabletId, indexes: &[u32], now_ms: u64) -> usize {
        let targets: Vec<(u32, GroupId)> = match self.tablets.get(tablet_id) {
            Some(tablet) => tablet
                .record
                .channels
                .iter()
                .filter(|c| indexes.is_empty() || indexes.contains(&c.index))
                .filter_map(|c| {
                    self.storage
                        .select_group(&c.binding.storage_pool, c.current_group(), now_ms)
                        .map(|g| (c.index, g))
                })
                .collect(),
            None => return 0,
        };
        let mut moved = 0;
        for (index, group_id) in targets {
            if self.move_channel(tablet_id, index, group_id, now_ms) {
                moved += 1;
            }
        }
        if moved > 0 {
            self.persist_tablet(tablet_id);
        }
        moved
    }

    /// `ReassignTablet` and `ReassignTabletSpace`: move channels to forced
    /// groups or to the least occupied ones.
    pub(crate) fn reassign_tablet(
        &mut self,
        tablet_id: TabletId,
        indexes: &[u32],
        forced_groups: &[GroupId],
        now_ms: u64,
    ) -> Response {
        let tablet = match self.live_tablet(tablet_id) {
            Ok(tablet) => tablet,
            Err(response) => return response,
        };
        let channel_count = tablet.record.channels.len();
        if indexes.iter().any(|i| *i as usize >= channel_count) {
            warn!(tablet_id, ?indexes, "reassign of unknown channel");
            return Response::status(Status::Error);
        }
        let moved = if forced_groups.is_empty() {
            self.renew_channels(tablet_id, indexes, now_ms)
        } else {
            let all: Vec<u32> = (0..channel_count as u32).collect();
            let indexes = if indexes.is_empty() { &all[..] } else { indexes };
            if forced_groups.len() != indexes.len() {
                warn!(tablet_id, "forced groups do not match channels");
                return Response::status(Status::Error);
            }
            for (index, group_id) in indexes.iter().zip(forced_groups) {
                let pool = &tablet.record.channels[*index as usize].binding.storage_pool;
                if !self.storage.pool_contains(pool, *group_id) {
                    warn!(tablet_id, index, group_id, %pool, "forced group is not in the channel's pool");
                    return Response::status(Status::Error);
                }
            }
            let mut moved = 0;
            for (index, group_id) in indexes.iter().zip(forced_groups) {
                if self.move_channel(tablet_id, *index, *group_id, now_ms) {
                    moved += 1;
                }
            }
            if moved > 0 {
                self.persist_tablet(tablet_id);
            }
            moved
        };
        if moved == 0 {
            return Response::status(Status::Already);
        }
        info!(tablet_id, moved, "tablet channels reassigned");
        self.restart_leader(tablet_id);
        Response::status(Status::Ok)
    }
}
