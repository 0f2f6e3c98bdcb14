// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The child objects rendered for each component.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::apps::v1::{
    RollingUpdateStatefulSetStrategy, StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy,
};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec, Service, ServicePort, ServiceSpec,
    Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use tidb_cluster_resources::MemberType;
use tidb_cluster_resources::crd::ManagedResource;
use tidb_cluster_resources::crd::tidb_cluster::v1alpha1::{ComponentSpec, TidbCluster};
use tidb_member::Error;
use tidb_member::control::TemplateBuilder;
use tidb_member::quantity::parse_quantity;

const CONFIG_VOLUME: &str = "config";
const CONFIG_FILE: &str = "config-file";
const CONFIG_DIR: &str = "/etc/tidb";
const DATA_VOLUME: &str = "data";
const DATA_DIR: &str = "/var/lib/tidb";

/// Specifies whether Kubernetes should pull images when creating pods.
#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImagePullPolicy {
    /// Always pull the image from the registry.
    Always,
    /// Pull the image only if it is not present.
    IfNotPresent,
    /// Never pull the image.
    Never,
}

impl fmt::Display for ImagePullPolicy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ImagePullPolicy::Always => f.write_str("Always"),
            ImagePullPolicy::IfNotPresent => f.write_str("IfNotPresent"),
            ImagePullPolicy::Never => f.write_str("Never"),
        }
    }
}

/// Renders a headless peer service, a config map and a StatefulSet per
/// component.
#[derive(Clone, Debug)]
pub struct DefaultTemplates {
    pub image_pull_policy: ImagePullPolicy,
}

fn component<'a>(tc: &'a TidbCluster, member_type: MemberType) -> Result<&'a ComponentSpec, Error> {
    tc.component(member_type)
        .ok_or_else(|| Error::fatal(member_type, "component is not declared"))
}

fn meta(tc: &TidbCluster, member_type: MemberType, name: String) -> ObjectMeta {
    let mut meta = tc.managed_resource_meta(name);
    meta.labels = Some(tc.component_labels(member_type));
    meta
}

/// Renders `config` as `key = value` lines.
fn render_config(config: &BTreeMap<String, String>) -> String {
    config
        .iter()
        .map(|(key, value)| format!("{key} = {value}\n"))
        .collect()
}

fn peer_port(member_type: MemberType) -> i32 {
    i32::from(member_type.peer_port())
}

impl TemplateBuilder for DefaultTemplates {
    fn peer_service(&self, tc: &TidbCluster, member_type: MemberType) -> Result<Service, Error> {
        Ok(Service {
            metadata: meta(tc, member_type, tc.peer_service_name(member_type)),
            spec: Some(ServiceSpec {
                cluster_ip: Some("None".into()),
                // Members have to find each other before any of them is ready.
                publish_not_ready_addresses: Some(true),
                selector: Some(tc.component_labels(member_type)),
                ports: Some(vec![ServicePort {
                    name: Some("peer".into()),
                    port: peer_port(member_type),
                    target_port: Some(IntOrString::Int(peer_port(member_type))),
                    protocol: Some("TCP".into()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    fn config_map(
        &self,
        tc: &TidbCluster,
        member_type: MemberType,
    ) -> Result<Option<ConfigMap>, Error> {
        let spec = component(tc, member_type)?;
        if spec.config.is_empty() {
            return Ok(None);
        }
        Ok(Some(ConfigMap {
            metadata: meta(tc, member_type, tc.set_name(member_type)),
            data: Some(BTreeMap::from_iter([(
                CONFIG_FILE.to_owned(),
                render_config(&spec.config),
            )])),
            ..Default::default()
        }))
    }

    fn replica_group(
        &self,
        tc: &TidbCluster,
        member_type: MemberType,
        config_map: Option<&str>,
    ) -> Result<StatefulSet, Error> {
        let spec = component(tc, member_type)?;
        let image = tc
            .image(member_type)
            .ok_or_else(|| Error::fatal(member_type, "no image"))?;
        let labels = tc.component_labels(member_type);

        let mut volumes = vec![];
        let mut volume_mounts = vec![];
        if let Some(name) = config_map {
            volumes.push(Volume {
                name: CONFIG_VOLUME.into(),
                config_map: Some(ConfigMapVolumeSource {
                    name: name.to_owned(),
                    ..Default::default()
                }),
                ..Default::default()
            });
            volume_mounts.push(VolumeMount {
                name: CONFIG_VOLUME.into(),
                mount_path: CONFIG_DIR.into(),
                read_only: Some(true),
                ..Default::default()
            });
        }

        let mut volume_claim_templates = None;
        if let Some(storage) = spec.requests.get("storage") {
            parse_quantity(storage).map_err(|e| {
                Error::fatal(member_type, format!("invalid storage request {storage:?}: {e}"))
            })?;
            volume_mounts.push(VolumeMount {
                name: DATA_VOLUME.into(),
                mount_path: DATA_DIR.into(),
                ..Default::default()
            });
            volume_claim_templates = Some(vec![PersistentVolumeClaim {
                metadata: ObjectMeta {
                    name: Some(DATA_VOLUME.into()),
                    ..Default::default()
                },
                spec: Some(PersistentVolumeClaimSpec {
                    access_modes: Some(vec!["ReadWriteOnce".into()]),
                    storage_class_name: spec.storage_class_name.clone(),
                    resources: Some(VolumeResourceRequirements {
                        requests: Some(BTreeMap::from_iter([(
                            "storage".to_owned(),
                            Quantity(storage.clone()),
                        )])),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]);
        }

        let container = Container {
            name: member_type.to_string(),
            image: Some(image),
            image_pull_policy: Some(self.image_pull_policy.to_string()),
            ports: Some(vec![ContainerPort {
                name: Some("peer".into()),
                container_port: peer_port(member_type),
                protocol: Some("TCP".into()),
                ..Default::default()
            }]),
            volume_mounts: (!volume_mounts.is_empty()).then_some(volume_mounts),
            ..Default::default()
        };

        Ok(StatefulSet {
            metadata: meta(tc, member_type, tc.set_name(member_type)),
            spec: Some(StatefulSetSpec {
                replicas: Some(i32::try_from(spec.replicas).map_err(|_| {
                    Error::fatal(member_type, format!("{} replicas is too many", spec.replicas))
                })?),
                selector: LabelSelector {
                    match_labels: Some(labels.clone()),
                    ..Default::default()
                },
                service_name: tc.peer_service_name(member_type),
                pod_management_policy: Some("Parallel".into()),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![container],
                        volumes: (!volumes.is_empty()).then_some(volumes),
                        ..Default::default()
                    }),
                },
                update_strategy: Some(StatefulSetUpdateStrategy {
                    type_: Some("RollingUpdate".into()),
                    rolling_update: Some(RollingUpdateStatefulSetStrategy::default()),
                }),
                volume_claim_templates,
                ..Default::default()
            }),
            ..Default::default()
        })
    }
}
