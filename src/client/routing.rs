//! Key -> group routing table, shared read-mostly by every client context
//! and replica.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use crate::server::{Epoch, GroupId, ReplicaId};
use crate::utils::GuidStoreError;

use rangemap::RangeInclusiveMap;

/// Membership of one group as last published by a reconfiguration.
#[derive(Debug, Clone, PartialEq, Eq)]
struct GroupView {
    epoch: Epoch,
    members: Vec<ReplicaId>,
}

/// Deterministic partitioning of the 64-bit key hash space into contiguous
/// ranges, one per group, plus each group's current membership.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    ranges: RangeInclusiveMap<u64, GroupId>,
    groups: BTreeMap<GroupId, GroupView>,
}

impl RoutingTable {
    /// Splits the hash space evenly over the given groups, in group ID order.
    /// Every group starts in epoch `epoch`.
    pub fn new(
        groups: &[(GroupId, Vec<ReplicaId>)],
        epoch: Epoch,
    ) -> Result<Self, GuidStoreError> {
        if groups.is_empty() {
            return Err(GuidStoreError::msg("routing table needs a group"));
        }
        let mut ids: Vec<GroupId> = groups.iter().map(|(g, _)| *g).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != groups.len() {
            return Err(GuidStoreError::msg(
                "duplicate group ID in routing table",
            ));
        }

        let span = u64::MAX / ids.len() as u64;
        let mut ranges = RangeInclusiveMap::new();
        for (idx, &group) in ids.iter().enumerate() {
            let lo = span * idx as u64 + if idx == 0 { 0 } else { 1 };
            let hi = if idx + 1 == ids.len() {
                u64::MAX
            } else {
                span * (idx as u64 + 1)
            };
            ranges.insert(lo..=hi, group);
        }

        let groups = groups
            .iter()
            .map(|(group, members)| {
                (
                    *group,
                    GroupView {
                        epoch,
                        members: members.clone(),
                    },
                )
            })
            .collect();
        Ok(RoutingTable { ranges, groups })
    }

    /// 64-bit hash of a record key.
    pub fn key_hash(key: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish()
    }

    /// Group owning `key`.
    pub fn locate(&self, key: &str) -> Result<GroupId, GuidStoreError> {
        self.ranges
            .get(&Self::key_hash(key))
            .copied()
            .ok_or_else(|| {
                GuidStoreError::msg(format!("no group covers key '{}'", key))
            })
    }

    /// Current members of `group`.
    pub fn members(&self, group: GroupId) -> Option<&[ReplicaId]> {
        self.groups.get(&group).map(|v| v.members.as_slice())
    }

    pub fn epoch(&self, group: GroupId) -> Option<Epoch> {
        self.groups.get(&group).map(|v| v.epoch)
    }

    /// All group IDs, in order.
    pub fn groups(&self) -> impl Iterator<Item = GroupId> + '_ {
        self.groups.keys().copied()
    }

    /// Publishes a membership committed by a reconfiguration. Views of older
    /// epochs never replace newer ones. Returns true if updated.
    pub fn update_membership(
        &mut self,
        group: GroupId,
        epoch: Epoch,
        members: Vec<ReplicaId>,
    ) -> bool {
        match self.groups.get_mut(&group) {
            Some(view) if view.epoch >= epoch => false,
            Some(view) => {
                view.epoch = epoch;
                view.members = members;
                true
            }
            None => false,
        }
    }
}
