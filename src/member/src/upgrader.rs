// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Rolling upgrades.
//!
//! The upgrader never replaces a member itself. It lowers the group's
//! partition one ordinal at a time, highest first, and the substrate replaces
//! whatever the partition makes eligible. Between steps it waits for the
//! freshly replaced member to become healthy, and it moves leadership off a
//! member before making it eligible.

use tidb_cluster_resources::crd::tidb_cluster::v1alpha1::{TidbCluster, TidbClusterStatus};
use tidb_cluster_resources::{MemberPhase, MemberType};
use tracing::{debug, info, warn};

use crate::control::ClusterControl;
use crate::replica_group::{ObservedReplicaGroup, ReplicaGroup, RolloutStrategy, UpgradeCursor};
use crate::status::MemberStatusView;
use crate::{Error, leader, requeue};

/// What an upgrade pass did to the new group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpgradeOutcome {
    /// An upstream component is upgrading or this one is scaling. The
    /// previously applied pod spec was copied onto the new group.
    Frozen,
    /// The template changed. It must be applied with nothing eligible so
    /// that the substrate computes the new revision.
    AwaitingRevision,
    /// Every member runs the update revision.
    Converged,
    /// The rollout strategy was changed by hand and was carried through.
    Deferred,
    /// `cursor` was lowered and an admission webhook replaces the member.
    Delegated { cursor: UpgradeCursor },
    /// `cursor` was lowered and the substrate replaces the member.
    Advanced { cursor: UpgradeCursor },
}

impl UpgradeOutcome {
    /// Whether the pass placed the cursor on the new group.
    pub fn moved_cursor(&self) -> bool {
        matches!(
            self,
            UpgradeOutcome::Delegated { .. } | UpgradeOutcome::Advanced { .. }
        )
    }
}

/// Everything an upgrade pass reads.
pub struct UpgradeInput<'a> {
    pub tc: &'a TidbCluster,
    pub member_type: MemberType,
    /// The status of every component as of this pass.
    pub cluster_status: &'a TidbClusterStatus,
    pub observed: &'a ObservedReplicaGroup,
    pub view: &'a MemberStatusView,
}

pub struct Upgrader<'a> {
    cluster: &'a dyn ClusterControl,
    pod_webhook_enabled: bool,
}

impl<'a> Upgrader<'a> {
    pub fn new(cluster: &'a dyn ClusterControl, pod_webhook_enabled: bool) -> Upgrader<'a> {
        Upgrader {
            cluster,
            pod_webhook_enabled,
        }
    }

    /// Runs one upgrade pass, writing the pod template and cursor for this
    /// pass onto `new_group` and the component phase into `phase`.
    ///
    /// Waiting on a member, a leadership transfer or the coordination service
    /// is reported as [`Error::Requeue`].
    pub async fn upgrade(
        &self,
        input: &UpgradeInput<'_>,
        phase: &mut MemberPhase,
        new_group: &mut ReplicaGroup,
    ) -> Result<UpgradeOutcome, Error> {
        let UpgradeInput {
            tc,
            member_type,
            cluster_status,
            observed,
            view,
        } = *input;
        let old_group = &observed.group;

        if member_type.elects_leader() && !view.synced() {
            requeue!("{member_type} membership status is not synced, not upgrading");
        }

        let upstream = cluster_status.upgrading_upstream(member_type);
        if upstream.is_some() || *phase == MemberPhase::Scaling {
            info!(
                %member_type,
                upstream = ?upstream,
                %phase,
                "upgrade frozen until upstream upgrades and scaling finish"
            );
            if let Some(pod_spec) = old_group
                .last_applied_pod_spec()
                .or_else(|| old_group.template().and_then(|t| t.spec.clone()))
            {
                let mut template = new_group.template().cloned().unwrap_or_default();
                template.spec = Some(pod_spec);
                new_group.set_template(template);
            }
            return Ok(UpgradeOutcome::Frozen);
        }

        *phase = MemberPhase::Upgrading;
        if !new_group.template_matches_last_applied(old_group) {
            return Ok(UpgradeOutcome::AwaitingRevision);
        }
        if old_group.revisions_converged() {
            return Ok(UpgradeOutcome::Converged);
        }

        let old_cursor = match old_group.strategy() {
            RolloutStrategy::Managed(cursor) => cursor,
            overridden @ RolloutStrategy::ExternallyOverridden(_) => {
                warn!(
                    %member_type,
                    group = %old_group.name(),
                    "rollout strategy was modified manually, leaving the upgrade to it"
                );
                new_group.set_strategy(overridden);
                return Ok(UpgradeOutcome::Deferred);
            }
        };
        new_group.set_cursor(old_cursor);

        let Some(update_revision) = old_group.update_revision() else {
            requeue!("{} has no update revision yet", old_group.name());
        };

        for ordinal in observed.live_ordinals().descending() {
            let pod_name = tc.pod_name(member_type, ordinal);
            let Some(member) = observed.member(ordinal) else {
                requeue!("{member_type} pod {pod_name} not found");
            };
            let Some(revision) = member.revision.as_deref() else {
                requeue!("{member_type} pod {pod_name} has no revision label");
            };

            if revision == update_revision {
                if !view.is_healthy(ordinal) {
                    requeue!("upgraded {member_type} pod {pod_name} is not ready");
                }
                continue;
            }

            // Never raise the cursor mid-upgrade: an ordinal above it is
            // already eligible.
            let cursor = UpgradeCursor::at(ordinal).min(old_cursor);

            if self.pod_webhook_enabled {
                new_group.set_cursor(cursor);
                debug!(%member_type, cursor = cursor.get(), "delegating replacement to webhook");
                return Ok(UpgradeOutcome::Delegated { cursor });
            }

            if member_type.elects_leader() && view.is_leader(ordinal) {
                let target = leader::vacate(
                    self.cluster,
                    tc,
                    member_type,
                    ordinal,
                    &new_group.live_ordinals(),
                    observed.actual_replicas(),
                    view,
                )
                .await?;
                requeue!("{member_type} member {pod_name} is transferring leadership to {target}");
            }

            new_group.set_cursor(cursor);
            info!(%member_type, cursor = cursor.get(), "upgrading {pod_name}");
            return Ok(UpgradeOutcome::Advanced { cursor });
        }

        Ok(UpgradeOutcome::Converged)
    }
}
