// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use anyhow::Context;
use k8s_openapi::api::core::v1::{Service, ServiceSpec};
use kube::ResourceExt;
use tidb_cluster_resources::MemberType;
use tracing::{debug, info};

use crate::Error;
use crate::control::ServiceControl;
use crate::replica_group::LAST_APPLIED_ANNOTATION;

fn record_last_applied(service: &mut Service) -> Result<(), Error> {
    let raw = serde_json::to_string(&service.spec.clone().unwrap_or_default())
        .context("serializing service spec")?;
    service
        .annotations_mut()
        .insert(LAST_APPLIED_ANNOTATION.to_owned(), raw);
    Ok(())
}

/// Whether `desired` matches the spec last applied to `existing`.
fn last_applied_matches(desired: &Service, existing: &Service) -> bool {
    let Some(raw) = existing.annotations().get(LAST_APPLIED_ANNOTATION) else {
        return false;
    };
    match serde_json::from_str::<ServiceSpec>(raw) {
        Ok(applied) => desired.spec.clone().unwrap_or_default() == applied,
        Err(_) => false,
    }
}

/// Creates or updates the headless service members use to find each other.
///
/// A service with the right name but no controlling owner is adopted. One
/// controlled by something else is left alone and reported.
pub async fn sync_peer_service(
    control: &dyn ServiceControl,
    member_type: MemberType,
    mut desired: Service,
) -> Result<(), Error> {
    let namespace = desired.namespace().unwrap_or_default();
    let name = desired.name_any();
    let Some(existing) = control.get(&namespace, &name).await? else {
        record_last_applied(&mut desired)?;
        debug!(service = %name, "creating peer service");
        control.create(&desired).await?;
        return Ok(());
    };

    let desired_owner = desired
        .owner_references()
        .iter()
        .find(|owner| owner.controller == Some(true))
        .cloned();
    let existing_owner = existing
        .owner_references()
        .iter()
        .find(|owner| owner.controller == Some(true))
        .cloned();
    let adopt = match (&existing_owner, &desired_owner) {
        (None, Some(_)) => true,
        (Some(existing), Some(desired)) if existing.uid != desired.uid => {
            return Err(Error::fatal(
                member_type,
                format!(
                    "service {name} is controlled by {} {}",
                    existing.kind, existing.name
                ),
            ));
        }
        _ => false,
    };

    if !adopt && last_applied_matches(&desired, &existing) {
        return Ok(());
    }

    let mut updated = existing.clone();
    if adopt {
        info!(service = %name, "adopting orphaned peer service");
        updated.metadata.owner_references = desired.metadata.owner_references.clone();
    }
    updated.labels_mut().extend(desired.labels().clone());
    let mut spec = desired.spec.unwrap_or_default();
    updated.spec = Some(spec.clone());
    record_last_applied(&mut updated)?;
    // The cluster IP is immutable once allocated.
    spec.cluster_ip = existing.spec.as_ref().and_then(|spec| spec.cluster_ip.clone());
    spec.cluster_ips = existing.spec.as_ref().and_then(|spec| spec.cluster_ips.clone());
    updated.spec = Some(spec);
    control.update(&updated).await?;
    Ok(())
}
