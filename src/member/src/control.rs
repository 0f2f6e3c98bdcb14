// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The collaborators the engine drives.
//!
//! Everything here performs I/O. The engine calls these at the edges of a
//! pass and keeps its decisions in pure functions over what they return.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Service};
use tidb_cluster_resources::MemberType;
use tidb_cluster_resources::crd::tidb_cluster::v1alpha1::TidbCluster;

use crate::Error;

/// Reads and writes one kind of namespaced object.
#[async_trait]
pub trait ObjectControl<K>: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, anyhow::Error>;

    async fn create(&self, object: &K) -> Result<K, anyhow::Error>;

    /// Replaces `object`. The write is rejected if the object changed since
    /// it was read.
    async fn update(&self, object: &K) -> Result<K, anyhow::Error>;
}

/// Access to the replicated process groups and the pods backing them.
#[async_trait]
pub trait ReplicaGroupControl: ObjectControl<StatefulSet> {
    async fn list_pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>, anyhow::Error>;
}

pub trait ServiceControl: ObjectControl<Service> {}

impl<T: ObjectControl<Service>> ServiceControl for T {}

pub trait ConfigMapControl: ObjectControl<ConfigMap> {}

impl<T: ObjectControl<ConfigMap>> ConfigMapControl for T {}

/// One member as reported by the cluster's coordination service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbedMember {
    pub name: String,
    pub health: bool,
}

/// A point-in-time read of a component's membership.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProbeSnapshot {
    pub members: Vec<ProbedMember>,
    pub leader: Option<String>,
}

impl ProbeSnapshot {
    pub fn member(&self, name: &str) -> Option<&ProbedMember> {
        self.members.iter().find(|member| member.name == name)
    }
}

/// The cluster's own coordination service.
#[async_trait]
pub trait ClusterControl: Send + Sync {
    /// Reads membership and leadership for `member_type`. Returns `None` for
    /// components whose membership isn't tracked by the coordination
    /// service.
    async fn probe(
        &self,
        tc: &TidbCluster,
        member_type: MemberType,
    ) -> Result<Option<ProbeSnapshot>, anyhow::Error>;

    /// Asks the current leader to hand leadership to `target`. Returns once
    /// the request is accepted, not once the transfer completes.
    async fn transfer_leader(
        &self,
        tc: &TidbCluster,
        member_type: MemberType,
        target: &str,
    ) -> Result<(), anyhow::Error>;

    /// Removes `name` from the membership of `member_type`.
    async fn remove_member(
        &self,
        tc: &TidbCluster,
        member_type: MemberType,
        name: &str,
    ) -> Result<(), anyhow::Error>;
}

/// Renders the desired child objects of a component.
pub trait TemplateBuilder: Send + Sync {
    fn peer_service(&self, tc: &TidbCluster, member_type: MemberType) -> Result<Service, Error>;

    /// The component's config map, if it has any configuration. The name is
    /// a base name; the synchronizer picks the final one.
    fn config_map(
        &self,
        tc: &TidbCluster,
        member_type: MemberType,
    ) -> Result<Option<ConfigMap>, Error>;

    /// The component's process group. `config_map` is the name of the
    /// config map to mount.
    fn replica_group(
        &self,
        tc: &TidbCluster,
        member_type: MemberType,
        config_map: Option<&str>,
    ) -> Result<StatefulSet, Error>;
}
