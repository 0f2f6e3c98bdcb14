// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Component configuration.
//!
//! With [`ConfigUpdateStrategy::InPlace`] the config map mounted by the group
//! is rewritten under the same name, so running members only see a change
//! once they restart. With [`ConfigUpdateStrategy::RollingUpdate`] every
//! distinct configuration gets its own config map named after a digest of its
//! contents; mounting a new name changes the pod template and rolls the
//! component.

use std::collections::BTreeMap;
use std::fmt::Write;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::ResourceExt;
use sha2::{Digest, Sha256};
use tidb_cluster_resources::crd::tidb_cluster::v1alpha1::ConfigUpdateStrategy;
use tracing::debug;

use crate::Error;
use crate::control::ConfigMapControl;

/// The first eight hex digits of the SHA-256 of `data`.
pub fn digest(data: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in data {
        hasher.update(key.as_bytes());
        hasher.update([0]);
        hasher.update(value.as_bytes());
        hasher.update([0]);
    }
    let mut out = String::with_capacity(8);
    for byte in &hasher.finalize()[..4] {
        // Writing to a `String` can't fail.
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Picks the name the rendered config map `desired` is stored under.
///
/// `in_use` is the config map the group currently mounts, if any.
pub fn resolve_name(
    desired: &ConfigMap,
    strategy: ConfigUpdateStrategy,
    in_use: Option<&ConfigMap>,
) -> String {
    let base = desired.name_any();
    match strategy {
        ConfigUpdateStrategy::InPlace => in_use.map_or(base, |in_use| in_use.name_any()),
        ConfigUpdateStrategy::RollingUpdate => match in_use {
            // Unchanged contents keep their name so that switching strategy
            // doesn't roll the component.
            Some(in_use) if in_use.data == desired.data => in_use.name_any(),
            _ => format!(
                "{base}-{}",
                digest(desired.data.as_ref().unwrap_or(&BTreeMap::new()))
            ),
        },
    }
}

/// Stores `desired` and returns the name it was stored under.
///
/// `in_use_name` is the name of the config map the group currently mounts.
pub async fn sync_config_map(
    control: &dyn ConfigMapControl,
    mut desired: ConfigMap,
    strategy: ConfigUpdateStrategy,
    in_use_name: Option<&str>,
) -> Result<String, Error> {
    let namespace = desired.namespace().unwrap_or_default();
    let in_use = match in_use_name {
        Some(name) => control.get(&namespace, name).await?,
        None => None,
    };
    let name = resolve_name(&desired, strategy, in_use.as_ref());
    desired.metadata.name = Some(name.clone());

    let existing = if in_use.as_ref().is_some_and(|in_use| in_use.name_any() == name) {
        in_use
    } else {
        control.get(&namespace, &name).await?
    };
    match existing {
        None => {
            debug!(config_map = %name, "creating config map");
            control.create(&desired).await?;
        }
        Some(existing) if existing.data != desired.data || existing.labels() != desired.labels() => {
            debug!(config_map = %name, "updating config map");
            let mut updated = existing;
            updated.data = desired.data;
            updated.metadata.labels = desired.metadata.labels;
            control.update(&updated).await?;
        }
        Some(_) => {}
    }
    Ok(name)
}
