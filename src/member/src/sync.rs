// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The per-component reconciliation pass.

use std::sync::Arc;

use anyhow::Context;
use kube::ResourceExt;
use tidb_cluster_resources::crd::tidb_cluster::v1alpha1::{TidbCluster, TidbClusterStatus};
use tidb_cluster_resources::{MemberPhase, MemberType};
use tracing::{debug, info, instrument, trace, warn};

use crate::config_map::sync_config_map;
use crate::control::{
    ClusterControl, ConfigMapControl, ReplicaGroupControl, ServiceControl, TemplateBuilder,
};
use crate::ordinal::DesiredTopology;
use crate::quantity::parse_quantity;
use crate::replica_group::{ObservedReplicaGroup, ReplicaGroup, RolloutStrategy, UpgradeCursor};
use crate::scaler::{ScaleAction, Scaler};
use crate::service::sync_peer_service;
use crate::status::{MemberStatusView, derive_phase};
use crate::upgrader::{UpgradeInput, UpgradeOutcome, Upgrader};
use crate::{Error, leader, requeue};

#[derive(Clone, Debug, Default)]
pub struct SyncConfig {
    /// Member replacement during upgrades is performed by an admission
    /// webhook; the engine only lowers the partition.
    pub pod_webhook_enabled: bool,
}

/// How far a pass got.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The component isn't declared.
    Skipped,
    /// The cluster is paused. Status was observed, nothing was changed.
    Paused,
    /// The group didn't exist and was created.
    Created,
    Synced {
        scale: ScaleAction,
        upgrade: Option<UpgradeOutcome>,
    },
}

/// Reconciles one component of a cluster at a time.
pub struct MemberSynchronizer {
    groups: Arc<dyn ReplicaGroupControl>,
    services: Arc<dyn ServiceControl>,
    config_maps: Arc<dyn ConfigMapControl>,
    cluster: Arc<dyn ClusterControl>,
    templates: Arc<dyn TemplateBuilder>,
    config: SyncConfig,
}

impl MemberSynchronizer {
    pub fn new(
        groups: Arc<dyn ReplicaGroupControl>,
        services: Arc<dyn ServiceControl>,
        config_maps: Arc<dyn ConfigMapControl>,
        cluster: Arc<dyn ClusterControl>,
        templates: Arc<dyn TemplateBuilder>,
        config: SyncConfig,
    ) -> MemberSynchronizer {
        MemberSynchronizer {
            groups,
            services,
            config_maps,
            cluster,
            templates,
            config,
        }
    }

    /// Runs one pass for `member_type`.
    ///
    /// `status` is the working copy of the cluster's status for this pass.
    /// The component's entry is refreshed before anything else happens, even
    /// if the pass later fails, and components synced later in the same pass
    /// see the refreshed phase.
    #[instrument(skip_all, fields(cluster = %tc.name_any(), %member_type))]
    pub async fn sync(
        &self,
        tc: &TidbCluster,
        member_type: MemberType,
        status: &mut TidbClusterStatus,
    ) -> Result<SyncOutcome, Error> {
        let Some(spec) = tc.component(member_type) else {
            trace!("component not declared");
            return Ok(SyncOutcome::Skipped);
        };
        let delete_slots = tc.delete_slots(member_type).map_err(|e| {
            Error::fatal(
                member_type,
                format!(
                    "malformed {} annotation: {e}",
                    member_type.delete_slots_annotation()
                ),
            )
        })?;
        for (resource, quantity) in &spec.requests {
            parse_quantity(quantity).map_err(|e| {
                Error::fatal(
                    member_type,
                    format!("invalid {resource} request {quantity:?}: {e}"),
                )
            })?;
        }
        let desired = DesiredTopology {
            replicas: spec.replicas,
            delete_slots,
        };

        let observed = self.observe(tc, member_type, &desired, status).await?;

        if tc.paused() {
            debug!("cluster is paused, not syncing");
            return Ok(SyncOutcome::Paused);
        }

        let service = self.templates.peer_service(tc, member_type)?;
        sync_peer_service(self.services.as_ref(), member_type, service).await?;

        let set_name = tc.set_name(member_type);
        let in_use = observed
            .as_ref()
            .and_then(|(observed, _)| observed.group.config_map_volume(&set_name));
        let config_map = match self.templates.config_map(tc, member_type)? {
            Some(config_map) => Some(
                sync_config_map(
                    self.config_maps.as_ref(),
                    config_map,
                    spec.config_update_strategy,
                    in_use.as_deref(),
                )
                .await?,
            ),
            None => None,
        };

        let mut new_group = ReplicaGroup::new(self.templates.replica_group(
            tc,
            member_type,
            config_map.as_deref(),
        )?)?;

        let Some((observed, view)) = observed else {
            new_group.set_replicas(desired.replicas);
            new_group.set_delete_slots(desired.delete_slots.clone());
            new_group.set_cursor(UpgradeCursor::frozen(&new_group.live_ordinals()));
            new_group
                .record_last_applied()
                .context("recording applied pod spec")?;
            info!(group = %set_name, replicas = desired.replicas, "creating replica group");
            self.groups.create(new_group.stateful_set()).await?;
            return Ok(SyncOutcome::Created);
        };
        let old_group = &observed.group;

        // Membership is only ever changed through the scaler.
        new_group.set_replicas(old_group.replicas());
        new_group.set_delete_slots(old_group.delete_slots().clone());
        let storage_request = spec.requests.get("storage").map(String::as_str);
        let scale =
            Scaler::new(member_type).reconcile(&desired, &observed, status, storage_request)?;
        if let ScaleAction::ShrinkTo { ordinal, .. } = scale {
            self.prepare_removal(tc, member_type, ordinal, &observed, &view)
                .await?;
        }
        scale.apply(&mut new_group);

        let mut phase = status.component(member_type).phase;
        let upgrade = if !new_group.template_matches_last_applied(old_group)
            || phase == MemberPhase::Upgrading
        {
            let input = UpgradeInput {
                tc,
                member_type,
                cluster_status: status,
                observed: &observed,
                view: &view,
            };
            let upgrader = Upgrader::new(self.cluster.as_ref(), self.config.pod_webhook_enabled);
            Some(upgrader.upgrade(&input, &mut phase, &mut new_group).await?)
        } else {
            None
        };
        status.component_mut(member_type).phase = phase;

        match (old_group.strategy(), &upgrade) {
            (RolloutStrategy::ExternallyOverridden(raw), _) => {
                new_group.set_strategy(RolloutStrategy::ExternallyOverridden(raw));
            }
            (_, Some(outcome)) if outcome.moved_cursor() => {}
            (RolloutStrategy::Managed(cursor), Some(UpgradeOutcome::Frozen)) => {
                new_group.set_cursor(cursor);
            }
            (RolloutStrategy::Managed(_), _) => {
                new_group.set_cursor(UpgradeCursor::frozen(&new_group.live_ordinals()));
            }
        }

        new_group
            .record_last_applied()
            .context("recording applied pod spec")?;
        let merged = new_group.merged_onto(old_group);
        if merged.stateful_set() != old_group.stateful_set() {
            debug!(group = %set_name, ?scale, ?upgrade, "updating replica group");
            self.groups.update(merged.stateful_set()).await?;
        }

        Ok(SyncOutcome::Synced { scale, upgrade })
    }

    /// Reads the group, its pods and the coordination service, and records
    /// what was seen in `status`. Returns `None` if the group doesn't exist.
    async fn observe(
        &self,
        tc: &TidbCluster,
        member_type: MemberType,
        desired: &DesiredTopology,
        status: &mut TidbClusterStatus,
    ) -> Result<Option<(ObservedReplicaGroup, MemberStatusView)>, Error> {
        let namespace = tc.namespace();
        let Some(set) = self
            .groups
            .get(&namespace, &tc.set_name(member_type))
            .await?
        else {
            return Ok(None);
        };
        let group = ReplicaGroup::new(set)?;
        let pods = self
            .groups
            .list_pods(&namespace, &tc.component_labels(member_type))
            .await?;
        let observed = ObservedReplicaGroup::new(group, &pods);

        let probe = match self.cluster.probe(tc, member_type).await {
            Ok(probe) => probe,
            Err(e) => {
                warn!("failed to read {member_type} membership: {e:#}");
                None
            }
        };
        let view = MemberStatusView::build(tc, member_type, &observed, probe.as_ref());
        let phase = derive_phase(&observed, &desired.live_ordinals());

        let component = status.component_mut(member_type);
        let next = view.to_component_status(phase, &observed.group, component);
        *component = next;
        Ok(Some((observed, view)))
    }

    /// Gets a member ready to be removed: leadership is moved off it and it
    /// leaves the coordination service's membership.
    async fn prepare_removal(
        &self,
        tc: &TidbCluster,
        member_type: MemberType,
        ordinal: u32,
        observed: &ObservedReplicaGroup,
        view: &MemberStatusView,
    ) -> Result<(), Error> {
        if !member_type.elects_leader() {
            return Ok(());
        }
        if !view.synced() {
            requeue!("{member_type} membership status is not synced, not scaling in");
        }
        if view.is_leader(ordinal) {
            let target = leader::vacate(
                self.cluster.as_ref(),
                tc,
                member_type,
                ordinal,
                &observed.live_ordinals(),
                observed.actual_replicas(),
                view,
            )
            .await?;
            requeue!(
                "{member_type} member {} is transferring leadership to {target} before removal",
                tc.pod_name(member_type, ordinal)
            );
        }
        if let Some(member) = view.member(ordinal).filter(|member| member.registered) {
            self.cluster
                .remove_member(tc, member_type, &member.name)
                .await?;
            info!(member = %member.name, "removed member");
        }
        Ok(())
    }
}
