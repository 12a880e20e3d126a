//! Storage-group rebalancing within one pool.

use std::collections::BTreeSet;

use hive_core::{GroupId, TabletId};

#[derive(Debug, Clone)]
pub struct GroupView {
    pub group_id: GroupId,
    /// Used fraction of the group's assured capacity.
    pub occupancy: f64,
    /// False while the group is in its post-rejection cool-off.
    pub eligible: bool,
}

/// A channel currently writing to a group of the pool.
#[derive(Debug, Clone)]
pub struct ChannelView {
    pub tablet_id: TabletId,
    pub channel: u32,
    pub group_id: GroupId,
    /// False while the tablet is inside its reassign cool-down.
    pub movable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageMove {
    pub tablet_id: TabletId,
    pub channel: u32,
    pub from_group: GroupId,
    pub to_group: GroupId,
}

/// Eligible group with the lowest occupancy, skipping `exclude`.
pub fn least_occupied(groups: &[GroupView], exclude: Option<GroupId>) -> Option<GroupId> {
    groups
        .iter()
        .filter(|g| g.eligible && Some(g.group_id) != exclude)
        .min_by(|a, b| {
            a.occupancy
                .total_cmp(&b.occupancy)
                .then(a.group_id.cmp(&b.group_id))
        })
        .map(|g| g.group_id)
}

/// Plan channel moves from the fullest groups to the emptiest ones.
///
/// A channel's share of its group is estimated as the group's occupancy
/// divided by the channels writing to it. At most one channel per tablet
/// moves in a pass.
pub fn plan_storage_moves(
    groups: &[GroupView],
    channels: &[ChannelView],
    min_scatter: f64,
    max_moves: usize,
) -> Vec<StorageMove> {
    let mut groups = groups.to_vec();
    if groups.iter().filter(|g| g.eligible).count() < 2 {
        return Vec::new();
    }
    let mut placement: Vec<ChannelView> = channels.to_vec();
    let mut touched: BTreeSet<TabletId> = BTreeSet::new();
    let mut moves = Vec::new();

    while moves.len() < max_moves {
        let Some(dst) = least_occupied(&groups, None) else {
            break;
        };
        let dst_occupancy = occupancy(&groups, dst);
        let Some(src) = groups
            .iter()
            .filter(|g| g.group_id != dst)
            .max_by(|a, b| {
                a.occupancy
                    .total_cmp(&b.occupancy)
                    .then(b.group_id.cmp(&a.group_id))
            })
            .map(|g| g.group_id)
        else {
            break;
        };
        let src_occupancy = occupancy(&groups, src);
        if src_occupancy - dst_occupancy <= min_scatter {
            break;
        }

        let on_src = placement.iter().filter(|c| c.group_id == src).count();
        if on_src == 0 {
            break;
        }
        let share = src_occupancy / on_src as f64;
        if dst_occupancy + share >= src_occupancy {
            break;
        }
        let Some(index) = placement
            .iter()
            .position(|c| c.group_id == src && c.movable && !touched.contains(&c.tablet_id))
        else {
            break;
        };

        let channel = &mut placement[index];
        channel.group_id = dst;
        touched.insert(channel.tablet_id);
        moves.push(StorageMove {
            tablet_id: channel.tablet_id,
            channel: channel.channel,
            from_group: src,
            to_group: dst,
        });
        for g in &mut groups {
            if g.group_id == src {
                g.occupancy -= share;
            } else if g.group_id == dst {
                g.occupancy += share;
            }
        }
    }
    moves
}

fn occupancy(groups: &[GroupView], group_id: GroupId) -> f64 {
    groups
        .iter()
        .find(|g| g.group_id == group_id)
        .map_or(0.0, |g| g.occupancy)
}
