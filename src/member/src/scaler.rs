// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Moves a group's ordinals toward the desired topology, one member at a
//! time.

use std::collections::BTreeSet;

use tidb_cluster_resources::crd::tidb_cluster::v1alpha1::TidbClusterStatus;
use tidb_cluster_resources::{MemberPhase, MemberType};
use tracing::debug;

use crate::Error;
use crate::ordinal::DesiredTopology;
use crate::quantity::parse_quantity;
use crate::replica_group::{ObservedReplicaGroup, ReplicaGroup};

/// The next declarative change to a group's membership.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScaleAction {
    NoOp,
    /// An upstream component is mid-upgrade.
    Blocked { upstream: MemberType },
    /// A member should be removed but the group itself is mid-upgrade.
    /// Removals wait for the upgrade to finish.
    AwaitingUpgrade,
    /// Add `ordinal`. `replicas` and `delete_slots` describe the group
    /// after the addition.
    GrowTo {
        replicas: u32,
        delete_slots: BTreeSet<u32>,
        ordinal: u32,
    },
    /// Remove `ordinal`.
    ShrinkTo {
        replicas: u32,
        delete_slots: BTreeSet<u32>,
        ordinal: u32,
    },
    /// The running ordinals are right but the recorded slots aren't, e.g.
    /// because slots were reserved above the highest ordinal.
    UpdateDeleteSlots(BTreeSet<u32>),
}

impl ScaleAction {
    /// Writes the action onto `group`.
    pub fn apply(&self, group: &mut ReplicaGroup) {
        match self {
            ScaleAction::NoOp | ScaleAction::Blocked { .. } | ScaleAction::AwaitingUpgrade => {}
            ScaleAction::GrowTo {
                replicas,
                delete_slots,
                ..
            }
            | ScaleAction::ShrinkTo {
                replicas,
                delete_slots,
                ..
            } => {
                group.set_replicas(*replicas);
                group.set_delete_slots(delete_slots.clone());
            }
            ScaleAction::UpdateDeleteSlots(delete_slots) => {
                group.set_delete_slots(delete_slots.clone());
            }
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Scaler {
    member_type: MemberType,
}

impl Scaler {
    pub fn new(member_type: MemberType) -> Scaler {
        Scaler { member_type }
    }

    /// Computes the next membership change for the group.
    ///
    /// Additions are made before removals. The lowest missing ordinal is
    /// added first and the highest surplus ordinal is removed first. Nothing
    /// is removed while the group is upgrading.
    /// `storage_request` is the size of the data volume each new member gets.
    pub fn reconcile(
        &self,
        desired: &DesiredTopology,
        observed: &ObservedReplicaGroup,
        cluster_status: &TidbClusterStatus,
        storage_request: Option<&str>,
    ) -> Result<ScaleAction, Error> {
        if let Some(upstream) = cluster_status.upgrading_upstream(self.member_type) {
            debug!(member_type = %self.member_type, %upstream, "upstream is upgrading, not scaling");
            return Ok(ScaleAction::Blocked { upstream });
        }

        let target = desired.live_ordinals();
        let current = observed.live_ordinals();

        if let Some(ordinal) = target.difference(&current).first().copied() {
            if let Some(request) = storage_request {
                parse_quantity(request).map_err(|e| {
                    Error::fatal(
                        self.member_type,
                        format!("invalid storage request {request:?}: {e}"),
                    )
                })?;
            }
            let mut next = current;
            next.insert(ordinal);
            let (replicas, delete_slots) = next.to_replicas_and_delete_slots();
            return Ok(ScaleAction::GrowTo {
                replicas,
                delete_slots,
                ordinal,
            });
        }

        if let Some(ordinal) = current.difference(&target).last().copied() {
            if cluster_status.component(self.member_type).phase == MemberPhase::Upgrading {
                debug!(member_type = %self.member_type, ordinal, "upgrading, not scaling in");
                return Ok(ScaleAction::AwaitingUpgrade);
            }
            let mut next = current;
            next.remove(ordinal);
            let (replicas, delete_slots) = next.to_replicas_and_delete_slots();
            return Ok(ScaleAction::ShrinkTo {
                replicas,
                delete_slots,
                ordinal,
            });
        }

        if observed.group.delete_slots() != &desired.delete_slots {
            return Ok(ScaleAction::UpdateDeleteSlots(desired.delete_slots.clone()));
        }

        Ok(ScaleAction::NoOp)
    }
}
