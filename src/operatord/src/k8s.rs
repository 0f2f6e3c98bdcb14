// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Object access through the Kubernetes API.

use std::collections::BTreeMap;
use std::fmt::Debug;

use anyhow::Context;
use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{ListParams, PostParams};
use kube::{Api, Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tidb_member::control::{ObjectControl, ReplicaGroupControl};

/// Reads and writes namespaced objects of any kind the engine manages.
#[derive(Clone)]
pub struct KubeControl {
    client: Client,
}

impl KubeControl {
    pub fn new(client: Client) -> KubeControl {
        KubeControl { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl<K> ObjectControl<K> for KubeControl
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + DeserializeOwned
        + Serialize
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, anyhow::Error> {
        self.api(namespace)
            .get_opt(name)
            .await
            .with_context(|| format!("getting {} {namespace}/{name}", K::kind(&())))
    }

    async fn create(&self, object: &K) -> Result<K, anyhow::Error> {
        let namespace = object.namespace().unwrap_or_default();
        self.api(&namespace)
            .create(&PostParams::default(), object)
            .await
            .with_context(|| {
                format!(
                    "creating {} {namespace}/{}",
                    K::kind(&()),
                    object.name_any()
                )
            })
    }

    async fn update(&self, object: &K) -> Result<K, anyhow::Error> {
        let namespace = object.namespace().unwrap_or_default();
        let name = object.name_any();
        self.api(&namespace)
            .replace(&name, &PostParams::default(), object)
            .await
            .with_context(|| format!("updating {} {namespace}/{name}", K::kind(&())))
    }
}

#[async_trait]
impl ReplicaGroupControl for KubeControl {
    async fn list_pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>, anyhow::Error> {
        let params = ListParams::default().labels(&label_selector(selector));
        let pods = self
            .api::<Pod>(namespace)
            .list(&params)
            .await
            .with_context(|| format!("listing pods in {namespace}"))?;
        Ok(pods.items)
    }
}

/// Formats `labels` as an equality-based label selector.
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(",")
}
