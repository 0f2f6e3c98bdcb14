// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::{CustomResource, Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::ManagedResource;
use crate::member::{MemberPhase, MemberType};

pub const NAME_LABEL: &str = "app.kubernetes.io/name";
pub const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const COMPONENT_LABEL: &str = "app.kubernetes.io/component";

pub mod v1alpha1 {
    use super::*;

    #[derive(
        CustomResource, Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema,
    )]
    #[serde(rename_all = "camelCase")]
    #[kube(
        namespaced,
        group = "pingcap.com",
        version = "v1alpha1",
        kind = "TidbCluster",
        singular = "tidbcluster",
        plural = "tidbclusters",
        shortname = "tc",
        status = "TidbClusterStatus",
        printcolumn = r#"{"name": "PD", "type": "string", "jsonPath": ".status.pd.phase"}"#,
        printcolumn = r#"{"name": "TiKV", "type": "string", "jsonPath": ".status.tikv.phase"}"#,
        printcolumn = r#"{"name": "TiDB", "type": "string", "jsonPath": ".status.tidb.phase"}"#
    )]
    pub struct TidbClusterSpec {
        /// The default version for every component, used as the image tag.
        pub version: String,
        /// Stops all changes to the cluster's process groups. Status is still
        /// observed while paused.
        #[serde(default)]
        pub paused: bool,
        /// The Kubernetes cluster domain. When set, members of leader-electing
        /// components register themselves under fully qualified names.
        pub cluster_domain: Option<String>,
        /// Placement driver members.
        pub pd: Option<ComponentSpec>,
        /// Row storage members.
        pub tikv: Option<ComponentSpec>,
        /// Columnar storage members.
        pub tiflash: Option<ComponentSpec>,
        /// Binlog collection members.
        pub pump: Option<ComponentSpec>,
        /// SQL compute members.
        pub tidb: Option<ComponentSpec>,
        /// Change data capture members.
        pub ticdc: Option<ComponentSpec>,
    }

    #[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
    #[serde(rename_all = "camelCase")]
    pub struct ComponentSpec {
        /// The number of live members. Ordinals listed in the component's
        /// delete-slots annotation are skipped when assigning ordinals.
        pub replicas: u32,
        /// The image repository, without a tag. Defaults to `pingcap/<component>`.
        pub base_image: Option<String>,
        /// Overrides the cluster-wide version for this component.
        pub version: Option<String>,
        /// Resource requests. `storage` sizes the data volume of each member.
        #[serde(default)]
        pub requests: BTreeMap<String, String>,
        /// The storage class of the data volume.
        pub storage_class_name: Option<String>,
        /// Configuration rendered into the component's config map.
        #[serde(default)]
        pub config: BTreeMap<String, String>,
        /// How changes to `config` reach running members.
        #[serde(default)]
        pub config_update_strategy: ConfigUpdateStrategy,
    }

    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
    pub enum ConfigUpdateStrategy {
        /// Update the config map in place; members pick up the change on
        /// their next restart.
        #[default]
        InPlace,
        /// Write each distinct configuration to a new config map, which
        /// changes the pod template and rolls the component.
        RollingUpdate,
    }

    #[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
    #[serde(rename_all = "camelCase")]
    pub struct TidbClusterStatus {
        #[serde(default)]
        pub pd: ComponentStatus,
        #[serde(default)]
        pub tikv: ComponentStatus,
        #[serde(default)]
        pub tiflash: ComponentStatus,
        #[serde(default)]
        pub pump: ComponentStatus,
        #[serde(default)]
        pub tidb: ComponentStatus,
        #[serde(default)]
        pub ticdc: ComponentStatus,
        #[serde(default)]
        pub conditions: Vec<Condition>,
    }

    impl TidbClusterStatus {
        pub fn component(&self, member_type: MemberType) -> &ComponentStatus {
            match member_type {
                MemberType::Pd => &self.pd,
                MemberType::Tikv => &self.tikv,
                MemberType::Tiflash => &self.tiflash,
                MemberType::Pump => &self.pump,
                MemberType::Tidb => &self.tidb,
                MemberType::Ticdc => &self.ticdc,
            }
        }

        pub fn component_mut(&mut self, member_type: MemberType) -> &mut ComponentStatus {
            match member_type {
                MemberType::Pd => &mut self.pd,
                MemberType::Tikv => &mut self.tikv,
                MemberType::Tiflash => &mut self.tiflash,
                MemberType::Pump => &mut self.pump,
                MemberType::Tidb => &mut self.tidb,
                MemberType::Ticdc => &mut self.ticdc,
            }
        }

        /// Returns the first upstream of `member_type` that is mid-upgrade.
        pub fn upgrading_upstream(&self, member_type: MemberType) -> Option<MemberType> {
            member_type
                .upstreams()
                .iter()
                .copied()
                .find(|upstream| self.component(*upstream).phase == MemberPhase::Upgrading)
        }

        /// Whether the status differs from `other` in a way worth writing
        /// back. Condition timestamps alone don't count.
        pub fn needs_update(&self, other: &TidbClusterStatus) -> bool {
            let summarize = |status: &TidbClusterStatus| {
                status
                    .conditions
                    .iter()
                    .map(|c| (c.type_.clone(), c.status.clone(), c.reason.clone(), c.message.clone()))
                    .collect::<Vec<_>>()
            };
            MemberType::ALL
                .iter()
                .any(|member_type| self.component(*member_type) != other.component(*member_type))
                || summarize(self) != summarize(other)
        }
    }

    #[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
    #[serde(rename_all = "camelCase")]
    pub struct ComponentStatus {
        #[serde(default)]
        pub phase: MemberPhase,
        /// Whether membership was successfully read from the coordination
        /// service on the last pass.
        #[serde(default)]
        pub synced: bool,
        /// Members backed by a live ordinal, keyed by member name.
        #[serde(default)]
        pub members: BTreeMap<String, MemberStatus>,
        /// Members known to the coordination service that aren't backed by a
        /// live ordinal of this group.
        #[serde(default)]
        pub peer_members: BTreeMap<String, MemberStatus>,
        pub leader: Option<String>,
        pub replica_group: Option<ReplicaGroupStatus>,
        /// The revision every member was running when the component last
        /// converged.
        pub last_applied_revision: Option<String>,
    }

    #[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
    #[serde(rename_all = "camelCase")]
    pub struct MemberStatus {
        pub name: String,
        pub ordinal: Option<u32>,
        pub health: bool,
        #[serde(default)]
        pub is_leader: bool,
        pub revision: Option<String>,
    }

    #[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
    #[serde(rename_all = "camelCase")]
    pub struct ReplicaGroupStatus {
        pub replicas: i32,
        pub ready_replicas: i32,
        pub current_revision: Option<String>,
        pub update_revision: Option<String>,
        pub partition: Option<i32>,
    }

    impl TidbCluster {
        pub fn namespace(&self) -> String {
            self.meta().namespace.clone().unwrap_or_default()
        }

        pub fn paused(&self) -> bool {
            self.spec.paused
        }

        pub fn component(&self, member_type: MemberType) -> Option<&ComponentSpec> {
            match member_type {
                MemberType::Pd => self.spec.pd.as_ref(),
                MemberType::Tikv => self.spec.tikv.as_ref(),
                MemberType::Tiflash => self.spec.tiflash.as_ref(),
                MemberType::Pump => self.spec.pump.as_ref(),
                MemberType::Tidb => self.spec.tidb.as_ref(),
                MemberType::Ticdc => self.spec.ticdc.as_ref(),
            }
        }

        pub fn status(&self) -> TidbClusterStatus {
            self.status.clone().unwrap_or_default()
        }

        /// The name of the replicated process group backing `member_type`.
        pub fn set_name(&self, member_type: MemberType) -> String {
            format!("{}-{}", self.name_any(), member_type)
        }

        pub fn peer_service_name(&self, member_type: MemberType) -> String {
            format!("{}-peer", self.set_name(member_type))
        }

        pub fn pod_name(&self, member_type: MemberType, ordinal: u32) -> String {
            format!("{}-{}", self.set_name(member_type), ordinal)
        }

        /// The name a member registers under with the coordination service.
        pub fn member_name(&self, member_type: MemberType, ordinal: u32) -> String {
            match &self.spec.cluster_domain {
                Some(domain) if member_type.elects_leader() && !domain.is_empty() => format!(
                    "{}.{}.{}.svc.{}",
                    self.pod_name(member_type, ordinal),
                    self.peer_service_name(member_type),
                    self.namespace(),
                    domain,
                ),
                _ => self.pod_name(member_type, ordinal),
            }
        }

        /// The ordinals an operator has explicitly removed from `member_type`.
        pub fn delete_slots(
            &self,
            member_type: MemberType,
        ) -> Result<BTreeSet<u32>, serde_json::Error> {
            match self
                .annotations()
                .get(&member_type.delete_slots_annotation())
            {
                Some(raw) if !raw.trim().is_empty() => serde_json::from_str(raw),
                _ => Ok(BTreeSet::new()),
            }
        }

        pub fn image(&self, member_type: MemberType) -> Option<String> {
            let spec = self.component(member_type)?;
            let base = spec
                .base_image
                .clone()
                .unwrap_or_else(|| format!("pingcap/{member_type}"));
            let version = spec.version.as_ref().unwrap_or(&self.spec.version);
            Some(format!("{base}:{version}"))
        }

        pub fn component_labels(&self, member_type: MemberType) -> BTreeMap<String, String> {
            let mut labels = self.default_labels();
            labels.insert(COMPONENT_LABEL.to_owned(), member_type.to_string());
            labels
        }
    }

    impl ManagedResource for TidbCluster {
        fn default_labels(&self) -> BTreeMap<String, String> {
            BTreeMap::from_iter([
                (NAME_LABEL.to_owned(), "tidb-cluster".to_owned()),
                (INSTANCE_LABEL.to_owned(), self.name_any()),
                (MANAGED_BY_LABEL.to_owned(), "tidb-operator".to_owned()),
            ])
        }
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::v1alpha1::*;
    use super::*;

    fn cluster(annotations: BTreeMap<String, String>) -> TidbCluster {
        let mut tc = TidbCluster::new(
            "basic",
            TidbClusterSpec {
                version: "v8.1.0".into(),
                pd: Some(ComponentSpec {
                    replicas: 3,
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        tc.metadata = ObjectMeta {
            name: Some("basic".into()),
            namespace: Some("db".into()),
            annotations: Some(annotations),
            ..Default::default()
        };
        tc
    }

    #[test]
    fn member_names() {
        let mut tc = cluster(BTreeMap::new());
        assert_eq!(tc.set_name(MemberType::Pd), "basic-pd");
        assert_eq!(tc.pod_name(MemberType::Pd, 2), "basic-pd-2");
        assert_eq!(tc.member_name(MemberType::Pd, 2), "basic-pd-2");

        tc.spec.cluster_domain = Some("cluster.local".into());
        assert_eq!(
            tc.member_name(MemberType::Pd, 2),
            "basic-pd-2.basic-pd-peer.db.svc.cluster.local"
        );
        // Only leader-electing members register under qualified names.
        assert_eq!(tc.member_name(MemberType::Tikv, 2), "basic-tikv-2");
    }

    #[test]
    fn delete_slots_from_annotation() {
        let tc = cluster(BTreeMap::from_iter([(
            MemberType::Pd.delete_slots_annotation(),
            "[3, 1]".to_owned(),
        )]));
        assert_eq!(
            tc.delete_slots(MemberType::Pd).unwrap(),
            BTreeSet::from([1, 3])
        );
        assert_eq!(tc.delete_slots(MemberType::Tikv).unwrap(), BTreeSet::new());

        let tc = cluster(BTreeMap::from_iter([(
            MemberType::Pd.delete_slots_annotation(),
            "[1,".to_owned(),
        )]));
        assert!(tc.delete_slots(MemberType::Pd).is_err());
    }

    #[test]
    fn images() {
        let mut tc = cluster(BTreeMap::new());
        assert_eq!(tc.image(MemberType::Pd).as_deref(), Some("pingcap/pd:v8.1.0"));
        assert_eq!(tc.image(MemberType::Tikv), None);

        let pd = tc.spec.pd.as_mut().unwrap();
        pd.base_image = Some("registry.local/pd".into());
        pd.version = Some("v8.1.1".into());
        assert_eq!(
            tc.image(MemberType::Pd).as_deref(),
            Some("registry.local/pd:v8.1.1")
        );
    }

    #[test]
    fn upgrading_upstream() {
        let mut status = TidbClusterStatus::default();
        assert_eq!(status.upgrading_upstream(MemberType::Tidb), None);
        status.pd.phase = MemberPhase::Upgrading;
        assert_eq!(
            status.upgrading_upstream(MemberType::Tidb),
            Some(MemberType::Pd)
        );
        assert_eq!(status.upgrading_upstream(MemberType::Pd), None);
        // Scaling upstreams don't block.
        status.pd.phase = MemberPhase::Scaling;
        assert_eq!(status.upgrading_upstream(MemberType::Tikv), None);
    }
}
