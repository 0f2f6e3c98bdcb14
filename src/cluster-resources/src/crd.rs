// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};

pub mod tidb_cluster;

/// A resource that owns the Kubernetes objects created on its behalf.
pub trait ManagedResource: Resource<DynamicType = ()> + Sized {
    fn default_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    fn owner_references(&self) -> Vec<OwnerReference> {
        self.controller_owner_ref(&()).into_iter().collect()
    }

    fn managed_resource_meta(&self, name: String) -> ObjectMeta {
        ObjectMeta {
            namespace: self.namespace(),
            name: Some(name),
            labels: Some(self.default_labels()),
            owner_references: Some(self.owner_references()),
            ..Default::default()
        }
    }
}
