// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The replicated process group backing one component.
//!
//! A [`ReplicaGroup`] wraps the `StatefulSet` the substrate runs and exposes
//! only the fields the engine reads or writes: the replica count, the
//! delete-slot annotation, the rolling-update partition and the pod template.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Context;
use k8s_openapi::api::apps::v1::{
    RollingUpdateStatefulSetStrategy, StatefulSet, StatefulSetUpdateStrategy,
};
use k8s_openapi::api::core::v1::{Pod, PodSpec, PodTemplateSpec};
use kube::ResourceExt;
use tidb_cluster_resources::crd::tidb_cluster::v1alpha1::ReplicaGroupStatus;

use crate::ordinal::{DesiredTopology, LiveOrdinals, live_ordinals};

/// Annotation on the group listing the ordinals the substrate must keep
/// vacant, as a JSON array.
pub const DELETE_SLOTS_ANNOTATION: &str = "delete-slots";
/// Pod label carrying the revision of the template the pod was created from.
pub const CONTROLLER_REVISION_HASH_LABEL: &str = "controller-revision-hash";
/// Annotation recording the pod spec the engine last applied.
pub const LAST_APPLIED_ANNOTATION: &str = "tidb.pingcap.com/last-applied-configuration";

/// The rolling-update partition. Ordinals at or above the cursor may be
/// replaced with the update revision; ordinals below it keep their current
/// revision.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UpgradeCursor(u32);

impl UpgradeCursor {
    /// Makes `ordinal` and everything above it eligible.
    pub fn at(ordinal: u32) -> UpgradeCursor {
        UpgradeCursor(ordinal)
    }

    /// The cursor that leaves every member of `live` alone.
    pub fn frozen(live: &LiveOrdinals) -> UpgradeCursor {
        UpgradeCursor(live.upper_bound())
    }

    pub fn get(&self) -> u32 {
        self.0
    }

    pub fn is_eligible(&self, ordinal: u32) -> bool {
        ordinal >= self.0
    }
}

/// How the group's members are rolled.
#[derive(Clone, Debug, PartialEq)]
pub enum RolloutStrategy {
    /// A rolling update gated by a partition the engine owns.
    Managed(UpgradeCursor),
    /// Someone switched the group to `OnDelete` or dropped the rolling-update
    /// parameters. The raw strategy is carried through untouched.
    ExternallyOverridden(StatefulSetUpdateStrategy),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReplicaGroup {
    set: StatefulSet,
    delete_slots: BTreeSet<u32>,
}

impl ReplicaGroup {
    pub fn new(set: StatefulSet) -> Result<ReplicaGroup, anyhow::Error> {
        let delete_slots = match set.annotations().get(DELETE_SLOTS_ANNOTATION) {
            Some(raw) if !raw.trim().is_empty() => serde_json::from_str(raw).with_context(|| {
                format!(
                    "parsing {DELETE_SLOTS_ANNOTATION} annotation of {}",
                    set.name_any()
                )
            })?,
            _ => BTreeSet::new(),
        };
        Ok(ReplicaGroup { set, delete_slots })
    }

    pub fn name(&self) -> String {
        self.set.name_any()
    }

    pub fn stateful_set(&self) -> &StatefulSet {
        &self.set
    }

    pub fn into_stateful_set(self) -> StatefulSet {
        self.set
    }

    pub fn replicas(&self) -> u32 {
        self.set
            .spec
            .as_ref()
            .and_then(|spec| spec.replicas)
            .and_then(|replicas| u32::try_from(replicas).ok())
            .unwrap_or(0)
    }

    pub fn set_replicas(&mut self, replicas: u32) {
        let spec = self.set.spec.get_or_insert_with(Default::default);
        spec.replicas = Some(i32::try_from(replicas).unwrap_or(i32::MAX));
    }

    pub fn delete_slots(&self) -> &BTreeSet<u32> {
        &self.delete_slots
    }

    pub fn set_delete_slots(&mut self, delete_slots: BTreeSet<u32>) {
        let annotations = self.set.annotations_mut();
        if delete_slots.is_empty() {
            annotations.remove(DELETE_SLOTS_ANNOTATION);
        } else {
            let ordinals: Vec<String> = delete_slots.iter().map(u32::to_string).collect();
            annotations.insert(
                DELETE_SLOTS_ANNOTATION.to_owned(),
                format!("[{}]", ordinals.join(",")),
            );
        }
        self.delete_slots = delete_slots;
    }

    pub fn topology(&self) -> DesiredTopology {
        DesiredTopology {
            replicas: self.replicas(),
            delete_slots: self.delete_slots.clone(),
        }
    }

    /// The ordinals the substrate is currently told to run.
    pub fn live_ordinals(&self) -> LiveOrdinals {
        live_ordinals(self.replicas(), &self.delete_slots)
    }

    pub fn strategy(&self) -> RolloutStrategy {
        let strategy = self
            .set
            .spec
            .as_ref()
            .and_then(|spec| spec.update_strategy.clone())
            .unwrap_or_default();
        match (strategy.type_.as_deref(), &strategy.rolling_update) {
            (Some("OnDelete"), _) | (_, None) => RolloutStrategy::ExternallyOverridden(strategy),
            (_, Some(rolling_update)) => {
                let partition = rolling_update
                    .partition
                    .and_then(|partition| u32::try_from(partition).ok())
                    .unwrap_or(0);
                RolloutStrategy::Managed(UpgradeCursor::at(partition))
            }
        }
    }

    pub fn set_strategy(&mut self, strategy: RolloutStrategy) {
        let spec = self.set.spec.get_or_insert_with(Default::default);
        match strategy {
            RolloutStrategy::Managed(cursor) => {
                let mut update_strategy = spec.update_strategy.take().unwrap_or_default();
                let rolling_update = update_strategy
                    .rolling_update
                    .get_or_insert_with(RollingUpdateStatefulSetStrategy::default);
                rolling_update.partition = Some(i32::try_from(cursor.get()).unwrap_or(i32::MAX));
                update_strategy.type_ = Some("RollingUpdate".to_owned());
                spec.update_strategy = Some(update_strategy);
            }
            RolloutStrategy::ExternallyOverridden(raw) => spec.update_strategy = Some(raw),
        }
    }

    /// The partition, if the engine owns the rollout.
    pub fn cursor(&self) -> Option<UpgradeCursor> {
        match self.strategy() {
            RolloutStrategy::Managed(cursor) => Some(cursor),
            RolloutStrategy::ExternallyOverridden(_) => None,
        }
    }

    pub fn set_cursor(&mut self, cursor: UpgradeCursor) {
        self.set_strategy(RolloutStrategy::Managed(cursor));
    }

    pub fn template(&self) -> Option<&PodTemplateSpec> {
        self.set.spec.as_ref().map(|spec| &spec.template)
    }

    pub fn set_template(&mut self, template: PodTemplateSpec) {
        self.set.spec.get_or_insert_with(Default::default).template = template;
    }

    pub fn current_revision(&self) -> Option<&str> {
        self.set.status.as_ref()?.current_revision.as_deref()
    }

    pub fn update_revision(&self) -> Option<&str> {
        self.set.status.as_ref()?.update_revision.as_deref()
    }

    /// Whether the substrate reports every member on the update revision.
    pub fn revisions_converged(&self) -> bool {
        self.current_revision() == self.update_revision()
    }

    /// The pod spec recorded in the last-applied annotation.
    pub fn last_applied_pod_spec(&self) -> Option<PodSpec> {
        let raw = self.set.annotations().get(LAST_APPLIED_ANNOTATION)?;
        serde_json::from_str(raw).ok()
    }

    /// Whether this group's template matches the pod spec last applied to
    /// `old`. A group without a readable record never matches.
    pub fn template_matches_last_applied(&self, old: &ReplicaGroup) -> bool {
        match (old.last_applied_pod_spec(), self.template()) {
            (Some(applied), Some(template)) => {
                template.spec.clone().unwrap_or_default() == applied
            }
            _ => false,
        }
    }

    /// Records the current pod spec in the last-applied annotation.
    pub fn record_last_applied(&mut self) -> Result<(), serde_json::Error> {
        let spec = self
            .template()
            .and_then(|template| template.spec.clone())
            .unwrap_or_default();
        let raw = serde_json::to_string(&spec)?;
        self.set
            .annotations_mut()
            .insert(LAST_APPLIED_ANNOTATION.to_owned(), raw);
        Ok(())
    }

    /// Finds the name of the config map mounted into the template whose name
    /// starts with `prefix`.
    pub fn config_map_volume(&self, prefix: &str) -> Option<String> {
        self.template()?
            .spec
            .as_ref()?
            .volumes
            .as_ref()?
            .iter()
            .filter_map(|volume| volume.config_map.as_ref())
            .map(|config_map| config_map.name.clone())
            .find(|name| name.starts_with(prefix))
    }

    /// Lays the engine-owned fields of `self` over `old`, keeping everything
    /// the substrate owns (resource version, status, selector).
    pub fn merged_onto(self, old: &ReplicaGroup) -> ReplicaGroup {
        let mut set = old.set.clone();
        let mut annotations: BTreeMap<String, String> = set.annotations().clone();
        annotations.remove(DELETE_SLOTS_ANNOTATION);
        annotations.extend(self.set.annotations().clone());
        if !annotations.is_empty() || set.metadata.annotations.is_some() {
            set.metadata.annotations = Some(annotations);
        }
        if !self.set.labels().is_empty() {
            set.labels_mut().extend(self.set.labels().clone());
        }

        if let Some(new_spec) = self.set.spec {
            let spec = set.spec.get_or_insert_with(Default::default);
            spec.replicas = new_spec.replicas;
            spec.template = new_spec.template;
            spec.update_strategy = new_spec.update_strategy;
        }
        ReplicaGroup {
            set,
            delete_slots: self.delete_slots,
        }
    }

    pub fn status(&self) -> ReplicaGroupStatus {
        let status = self.set.status.clone().unwrap_or_default();
        ReplicaGroupStatus {
            replicas: status.replicas,
            ready_replicas: status.ready_replicas.unwrap_or(0),
            current_revision: status.current_revision,
            update_revision: status.update_revision,
            partition: self
                .cursor()
                .and_then(|cursor| i32::try_from(cursor.get()).ok()),
        }
    }
}

/// One running pod of a group, as seen by the substrate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObservedMember {
    pub ordinal: u32,
    pub pod_name: String,
    /// The template revision the pod runs. `None` if the label is missing.
    pub revision: Option<String>,
    pub ready: bool,
}

impl ObservedMember {
    /// Reads a pod of the group named `set_name`. Pods whose name doesn't
    /// end in an ordinal of that group are ignored.
    pub fn from_pod(set_name: &str, pod: &Pod) -> Option<ObservedMember> {
        let pod_name = pod.name_any();
        let ordinal = pod_name
            .strip_prefix(set_name)?
            .strip_prefix('-')?
            .parse()
            .ok()?;
        let revision = pod.labels().get(CONTROLLER_REVISION_HASH_LABEL).cloned();
        let ready = pod
            .status
            .as_ref()
            .and_then(|status| status.conditions.as_ref())
            .and_then(|conditions| conditions.iter().find(|c| c.type_ == "Ready"))
            .is_some_and(|c| c.status == "True");
        Some(ObservedMember {
            ordinal,
            pod_name,
            revision,
            ready,
        })
    }
}

/// A group together with the pods currently backing it.
#[derive(Clone, Debug, PartialEq)]
pub struct ObservedReplicaGroup {
    pub group: ReplicaGroup,
    pub members: BTreeMap<u32, ObservedMember>,
}

impl ObservedReplicaGroup {
    pub fn new(group: ReplicaGroup, pods: &[Pod]) -> ObservedReplicaGroup {
        let set_name = group.name();
        let members = pods
            .iter()
            .filter_map(|pod| ObservedMember::from_pod(&set_name, pod))
            .map(|member| (member.ordinal, member))
            .collect();
        ObservedReplicaGroup { group, members }
    }

    pub fn member(&self, ordinal: u32) -> Option<&ObservedMember> {
        self.members.get(&ordinal)
    }

    pub fn live_ordinals(&self) -> LiveOrdinals {
        self.group.live_ordinals()
    }

    /// The number of replicas the substrate reports running.
    pub fn actual_replicas(&self) -> u32 {
        self.group
            .stateful_set()
            .status
            .as_ref()
            .and_then(|status| u32::try_from(status.replicas).ok())
            .unwrap_or(0)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use k8s_openapi::api::apps::v1::{StatefulSetSpec, StatefulSetStatus};
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;

    pub fn stateful_set(name: &str, replicas: u32, delete_slots: &[u32]) -> StatefulSet {
        let mut annotations = BTreeMap::new();
        if !delete_slots.is_empty() {
            annotations.insert(
                DELETE_SLOTS_ANNOTATION.to_owned(),
                serde_json::to_string(delete_slots).unwrap(),
            );
        }
        StatefulSet {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                namespace: Some("db".to_owned()),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(StatefulSetSpec {
                replicas: Some(i32::try_from(replicas).unwrap()),
                update_strategy: Some(StatefulSetUpdateStrategy {
                    type_: Some("RollingUpdate".to_owned()),
                    rolling_update: Some(RollingUpdateStatefulSetStrategy {
                        partition: Some(i32::try_from(replicas).unwrap()),
                        ..Default::default()
                    }),
                }),
                ..Default::default()
            }),
            status: Some(StatefulSetStatus {
                replicas: i32::try_from(replicas).unwrap(),
                current_revision: Some("rev-1".to_owned()),
                update_revision: Some("rev-1".to_owned()),
                ..Default::default()
            }),
        }
    }

    pub fn group(name: &str, replicas: u32, delete_slots: &[u32]) -> ReplicaGroup {
        ReplicaGroup::new(stateful_set(name, replicas, delete_slots)).unwrap()
    }

    pub fn pod(set_name: &str, ordinal: u32, revision: &str, ready: bool) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(format!("{set_name}-{ordinal}")),
                labels: Some(BTreeMap::from_iter([(
                    CONTROLLER_REVISION_HASH_LABEL.to_owned(),
                    revision.to_owned(),
                )])),
                ..Default::default()
            },
            status: Some(PodStatus {
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_owned(),
                    status: if ready { "True" } else { "False" }.to_owned(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{ConfigMapVolumeSource, Volume};

    use super::testing::*;
    use super::*;

    #[test]
    fn reads_delete_slots() {
        let group = group("basic-tikv", 3, &[1, 3]);
        assert_eq!(group.delete_slots(), &BTreeSet::from([1, 3]));
        assert_eq!(group.live_ordinals().iter().collect::<Vec<_>>(), vec![0, 2, 4]);

        let mut set = stateful_set("basic-tikv", 3, &[]);
        set.annotations_mut()
            .insert(DELETE_SLOTS_ANNOTATION.to_owned(), "{".to_owned());
        assert!(ReplicaGroup::new(set).is_err());
    }

    #[test]
    fn writes_delete_slots() {
        let mut group = group("basic-tikv", 3, &[]);
        group.set_delete_slots(BTreeSet::from([4, 1]));
        assert_eq!(
            group.stateful_set().annotations().get(DELETE_SLOTS_ANNOTATION),
            Some(&"[1,4]".to_owned())
        );
        group.set_delete_slots(BTreeSet::new());
        assert_eq!(
            group.stateful_set().annotations().get(DELETE_SLOTS_ANNOTATION),
            None
        );
    }

    #[test]
    fn rollout_strategy() {
        let mut group = group("basic-pd", 3, &[]);
        assert_eq!(group.cursor(), Some(UpgradeCursor::at(3)));

        group.set_cursor(UpgradeCursor::at(1));
        assert_eq!(group.strategy(), RolloutStrategy::Managed(UpgradeCursor::at(1)));

        let on_delete = StatefulSetUpdateStrategy {
            type_: Some("OnDelete".to_owned()),
            rolling_update: None,
        };
        group.set_strategy(RolloutStrategy::ExternallyOverridden(on_delete.clone()));
        assert_eq!(group.strategy(), RolloutStrategy::ExternallyOverridden(on_delete));
        assert_eq!(group.cursor(), None);
    }

    #[test]
    fn cursor_eligibility() {
        let live = LiveOrdinals::from_ordinals([0, 2, 4]);
        let frozen = UpgradeCursor::frozen(&live);
        assert!(live.iter().all(|ordinal| !frozen.is_eligible(ordinal)));
        assert!(UpgradeCursor::at(2).is_eligible(4));
        assert!(!UpgradeCursor::at(2).is_eligible(0));
    }

    #[test]
    fn last_applied_template() {
        let mut old = group("basic-pd", 3, &[]);
        let mut new = old.clone();
        // Nothing recorded yet.
        assert!(!new.template_matches_last_applied(&old));

        old.record_last_applied().unwrap();
        assert!(new.template_matches_last_applied(&old));

        new.set_template(PodTemplateSpec {
            spec: Some(PodSpec {
                hostname: Some("changed".to_owned()),
                ..Default::default()
            }),
            ..Default::default()
        });
        assert!(!new.template_matches_last_applied(&old));
    }

    #[test]
    fn finds_config_map_volume() {
        let mut group = group("basic-pump", 1, &[]);
        group.set_template(PodTemplateSpec {
            spec: Some(PodSpec {
                volumes: Some(vec![
                    Volume {
                        name: "annotations".to_owned(),
                        ..Default::default()
                    },
                    Volume {
                        name: "config".to_owned(),
                        config_map: Some(ConfigMapVolumeSource {
                            name: "basic-pump-5f1e2a9c".to_owned(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        });
        assert_eq!(
            group.config_map_volume("basic-pump").as_deref(),
            Some("basic-pump-5f1e2a9c")
        );
        assert_eq!(group.config_map_volume("basic-tidb"), None);
    }

    #[test]
    fn merge_keeps_substrate_fields() {
        let mut old = group("basic-tikv", 3, &[1]);
        old.set.metadata.resource_version = Some("42".to_owned());
        let mut new = group("basic-tikv", 5, &[]);
        new.set_cursor(UpgradeCursor::at(2));

        let merged = new.merged_onto(&old);
        assert_eq!(merged.replicas(), 5);
        assert!(merged.delete_slots().is_empty());
        assert_eq!(merged.cursor(), Some(UpgradeCursor::at(2)));
        assert_eq!(
            merged.stateful_set().metadata.resource_version.as_deref(),
            Some("42")
        );
        assert_eq!(
            merged.stateful_set().annotations().get(DELETE_SLOTS_ANNOTATION),
            None
        );
    }

    #[test]
    fn observes_pods() {
        let group = group("basic-tikv", 3, &[]);
        let pods = vec![
            pod("basic-tikv", 0, "rev-1", true),
            pod("basic-tikv", 2, "rev-2", false),
            pod("basic-tidb", 1, "rev-1", true),
        ];
        let observed = ObservedReplicaGroup::new(group, &pods);
        assert_eq!(observed.members.keys().copied().collect::<Vec<_>>(), vec![0, 2]);
        let member = observed.member(2).unwrap();
        assert_eq!(member.revision.as_deref(), Some("rev-2"));
        assert!(!member.ready);
        assert_eq!(observed.actual_replicas(), 3);
    }
}
