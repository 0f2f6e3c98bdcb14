// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Ordinal addressing for replica groups with holes.
//!
//! A group is described by a replica count and a set of *delete slots*:
//! ordinals that must stay vacant. Every controller pass has to arrive at the
//! same ordinals from the same inputs without coordinating, so everything
//! here is a pure function of its arguments.

use std::collections::BTreeSet;

/// The desired membership of one component.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DesiredTopology {
    pub replicas: u32,
    pub delete_slots: BTreeSet<u32>,
}

impl DesiredTopology {
    pub fn new(replicas: u32, delete_slots: impl IntoIterator<Item = u32>) -> DesiredTopology {
        DesiredTopology {
            replicas,
            delete_slots: delete_slots.into_iter().collect(),
        }
    }

    pub fn live_ordinals(&self) -> LiveOrdinals {
        live_ordinals(self.replicas, &self.delete_slots)
    }
}

/// The ordinals that must be running, in ascending order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LiveOrdinals(BTreeSet<u32>);

/// Computes the ordinals that must be running for `replicas` members when
/// the ordinals in `delete_slots` are kept vacant.
///
/// Slots are considered in ascending order; each slot below the running
/// count pushes the count up by one. Slots at or past the final count are
/// reservations for future scale-outs and don't affect the result.
pub fn live_ordinals(replicas: u32, delete_slots: &BTreeSet<u32>) -> LiveOrdinals {
    let mut count = replicas;
    let mut vacant = BTreeSet::new();
    for slot in delete_slots {
        if *slot < count {
            count = count.saturating_add(1);
            vacant.insert(*slot);
        }
    }
    LiveOrdinals((0..count).filter(|i| !vacant.contains(i)).collect())
}

impl LiveOrdinals {
    pub fn from_ordinals(ordinals: impl IntoIterator<Item = u32>) -> LiveOrdinals {
        LiveOrdinals(ordinals.into_iter().collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, ordinal: u32) -> bool {
        self.0.contains(&ordinal)
    }

    pub fn min(&self) -> Option<u32> {
        self.0.first().copied()
    }

    pub fn max(&self) -> Option<u32> {
        self.0.last().copied()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = u32> + '_ {
        self.0.iter().copied()
    }

    /// Highest ordinal first.
    pub fn descending(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.iter().rev().copied()
    }

    pub fn as_set(&self) -> &BTreeSet<u32> {
        &self.0
    }

    pub fn insert(&mut self, ordinal: u32) -> bool {
        self.0.insert(ordinal)
    }

    pub fn remove(&mut self, ordinal: u32) -> bool {
        self.0.remove(&ordinal)
    }

    /// Ordinals in `self` that aren't in `other`.
    pub fn difference(&self, other: &LiveOrdinals) -> BTreeSet<u32> {
        self.0.difference(&other.0).copied().collect()
    }

    /// One past the highest ordinal, i.e. the smallest rolling-update
    /// partition that leaves every live member alone.
    pub fn upper_bound(&self) -> u32 {
        self.max().map_or(0, |max| max.saturating_add(1))
    }

    /// The replica count and delete slots that reproduce exactly this set
    /// of ordinals: every hole below the highest ordinal becomes a slot.
    pub fn to_replicas_and_delete_slots(&self) -> (u32, BTreeSet<u32>) {
        let replicas = u32::try_from(self.0.len()).unwrap_or(u32::MAX);
        let holes = (0..self.upper_bound())
            .filter(|i| !self.0.contains(i))
            .collect();
        (replicas, holes)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn ordinals(replicas: u32, slots: &[u32]) -> Vec<u32> {
        live_ordinals(replicas, &slots.iter().copied().collect())
            .iter()
            .collect()
    }

    #[test]
    fn contiguous() {
        assert_eq!(ordinals(3, &[]), vec![0, 1, 2]);
    }

    #[test]
    fn holes() {
        assert_eq!(ordinals(3, &[1, 3]), vec![0, 2, 4]);
        assert_eq!(ordinals(4, &[1]), vec![0, 2, 3, 4]);
        assert_eq!(ordinals(4, &[1, 3]), vec![0, 2, 4, 5]);
        assert_eq!(ordinals(3, &[0, 3]), vec![1, 2, 4]);
        assert_eq!(ordinals(5, &[0, 3]), vec![1, 2, 4, 5, 6]);
        assert_eq!(ordinals(4, &[1, 2]), vec![0, 3, 4, 5]);
    }

    #[test]
    fn reserved_slots_are_ignored() {
        assert_eq!(ordinals(3, &[7]), vec![0, 1, 2]);
        assert_eq!(ordinals(2, &[1, 9]), vec![0, 2]);
    }

    #[test]
    fn zero_replicas() {
        assert_eq!(ordinals(0, &[]), Vec::<u32>::new());
        assert_eq!(ordinals(0, &[0, 1, 5]), Vec::<u32>::new());
    }

    #[test]
    fn views() {
        let live = live_ordinals(3, &BTreeSet::from([1, 3]));
        assert_eq!(live.min(), Some(0));
        assert_eq!(live.max(), Some(4));
        assert_eq!(live.descending().collect::<Vec<_>>(), vec![4, 2, 0]);
        assert_eq!(live.upper_bound(), 5);
        assert_eq!(LiveOrdinals::default().upper_bound(), 0);
    }

    #[test]
    fn replicas_and_delete_slots_roundtrip() {
        let live = LiveOrdinals::from_ordinals([0, 2, 4, 5]);
        let (replicas, slots) = live.to_replicas_and_delete_slots();
        assert_eq!(replicas, 4);
        assert_eq!(slots, BTreeSet::from([1, 3]));
        assert_eq!(live_ordinals(replicas, &slots), live);
    }

    proptest! {
        #[test]
        fn live_ordinals_property(
            replicas in 0u32..64,
            slots in proptest::collection::btree_set(0u32..128, 0..16),
        ) {
            let live = live_ordinals(replicas, &slots);
            let as_vec: Vec<u32> = live.iter().collect();

            prop_assert_eq!(as_vec.len(), usize::try_from(replicas).unwrap());
            prop_assert!(as_vec.windows(2).all(|w| w[0] < w[1]));
            prop_assert!(as_vec.iter().all(|i| !slots.contains(i)));
            // Deterministic.
            prop_assert_eq!(&live, &live_ordinals(replicas, &slots));
        }
    }
}
