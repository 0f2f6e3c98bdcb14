// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Per-member health, leadership and revision, rebuilt on every pass.

use std::collections::BTreeMap;

use tidb_cluster_resources::crd::tidb_cluster::v1alpha1::{
    ComponentStatus, MemberStatus, TidbCluster,
};
use tidb_cluster_resources::{MemberPhase, MemberType};

use crate::control::ProbeSnapshot;
use crate::ordinal::LiveOrdinals;
use crate::replica_group::{ObservedReplicaGroup, ReplicaGroup};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberRecord {
    pub name: String,
    pub ordinal: Option<u32>,
    pub health: bool,
    pub is_leader: bool,
    /// Whether the coordination service knows this member.
    pub registered: bool,
    pub last_seen_revision: Option<String>,
}

impl From<&MemberRecord> for MemberStatus {
    fn from(record: &MemberRecord) -> MemberStatus {
        MemberStatus {
            name: record.name.clone(),
            ordinal: record.ordinal,
            health: record.health,
            is_leader: record.is_leader,
            revision: record.last_seen_revision.clone(),
        }
    }
}

/// A read-only view of one component's members for a single pass.
///
/// Leadership is only ever read from here and never carried between passes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberStatusView {
    member_type: MemberType,
    synced: bool,
    members: BTreeMap<u32, MemberRecord>,
    peers: Vec<MemberRecord>,
    leader: Option<String>,
}

impl MemberStatusView {
    /// Builds the view from the pods of `observed` and, for components
    /// tracked by the coordination service, the latest probe.
    ///
    /// `probe` is `None` either because the component isn't tracked or
    /// because the probe failed. For leader-electing components the latter is
    /// reported as not synced.
    pub fn build(
        tc: &TidbCluster,
        member_type: MemberType,
        observed: &ObservedReplicaGroup,
        probe: Option<&ProbeSnapshot>,
    ) -> MemberStatusView {
        let leader = probe.and_then(|probe| probe.leader.clone());
        let mut members = BTreeMap::new();
        for ordinal in observed.live_ordinals().iter() {
            let name = tc.member_name(member_type, ordinal);
            let pod_name = tc.pod_name(member_type, ordinal);
            let pod = observed.member(ordinal);
            let probed = probe.and_then(|probe| {
                probe
                    .member(&name)
                    .or_else(|| probe.member(&pod_name))
            });
            let health = match (probe, probed) {
                (Some(_), Some(probed)) => probed.health,
                (Some(_), None) => false,
                (None, _) => pod.is_some_and(|pod| pod.ready),
            };
            let is_leader = leader
                .as_ref()
                .is_some_and(|leader| *leader == name || *leader == pod_name);
            members.insert(
                ordinal,
                MemberRecord {
                    name,
                    ordinal: Some(ordinal),
                    health,
                    is_leader,
                    registered: probed.is_some(),
                    last_seen_revision: pod.and_then(|pod| pod.revision.clone()),
                },
            );
        }

        let peers = probe
            .map(|probe| {
                probe
                    .members
                    .iter()
                    .filter(|probed| {
                        !members.values().any(|member| {
                            member.name == probed.name
                                || member
                                    .ordinal
                                    .is_some_and(|o| tc.pod_name(member_type, o) == probed.name)
                        })
                    })
                    .map(|probed| MemberRecord {
                        name: probed.name.clone(),
                        ordinal: None,
                        health: probed.health,
                        is_leader: leader.as_deref() == Some(probed.name.as_str()),
                        registered: true,
                        last_seen_revision: None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        MemberStatusView {
            member_type,
            synced: probe.is_some() || !member_type.elects_leader(),
            members,
            peers,
            leader,
        }
    }

    pub fn member_type(&self) -> MemberType {
        self.member_type
    }

    /// Whether membership was read from the coordination service.
    pub fn synced(&self) -> bool {
        self.synced
    }

    pub fn member(&self, ordinal: u32) -> Option<&MemberRecord> {
        self.members.get(&ordinal)
    }

    pub fn members(&self) -> impl Iterator<Item = &MemberRecord> {
        self.members.values()
    }

    /// Members known to the coordination service that no live ordinal
    /// accounts for.
    pub fn peers(&self) -> impl Iterator<Item = &MemberRecord> {
        self.peers.iter()
    }

    pub fn leader(&self) -> Option<&str> {
        self.leader.as_deref()
    }

    pub fn is_leader(&self, ordinal: u32) -> bool {
        self.member(ordinal).is_some_and(|member| member.is_leader)
    }

    pub fn is_healthy(&self, ordinal: u32) -> bool {
        self.member(ordinal).is_some_and(|member| member.health)
    }

    /// Whether `name` belongs to a live member the coordination service
    /// knows about.
    pub fn is_registered(&self, name: &str) -> bool {
        self.members()
            .any(|member| member.name == name && member.registered)
    }

    /// Every member the coordination service reported, live or not.
    pub fn all_probed(&self) -> impl Iterator<Item = &MemberRecord> {
        self.members()
            .filter(|member| member.registered)
            .chain(self.peers())
    }

    /// Renders the view into the status written back to the cluster.
    pub fn to_component_status(
        &self,
        phase: MemberPhase,
        group: &ReplicaGroup,
        previous: &ComponentStatus,
    ) -> ComponentStatus {
        let last_applied_revision = if group.revisions_converged() {
            group.current_revision().map(str::to_owned)
        } else {
            previous.last_applied_revision.clone()
        };
        ComponentStatus {
            phase,
            synced: self.synced,
            members: self
                .members()
                .map(|member| (member.name.clone(), member.into()))
                .collect(),
            peer_members: self
                .peers()
                .map(|peer| (peer.name.clone(), peer.into()))
                .collect(),
            leader: self.leader.clone(),
            replica_group: Some(group.status()),
            last_applied_revision,
        }
    }
}

/// The phase a component is in given what the substrate reports and the
/// ordinals it should be running.
///
/// A group is upgrading while the substrate reports two revisions or while
/// any pod still runs something other than the update revision.
pub fn derive_phase(observed: &ObservedReplicaGroup, desired: &LiveOrdinals) -> MemberPhase {
    let group = &observed.group;
    let stale_pod = group.update_revision().is_some_and(|update_revision| {
        observed.members.values().any(|member| {
            member
                .revision
                .as_deref()
                .is_some_and(|revision| revision != update_revision)
        })
    });
    if !group.revisions_converged() || stale_pod {
        MemberPhase::Upgrading
    } else if group.live_ordinals() != *desired {
        MemberPhase::Scaling
    } else {
        MemberPhase::Normal
    }
}
