// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Prints the `TidbCluster` custom resource definition, for installing into a
//! Kubernetes cluster with `kubectl apply -f -`.

use kube::CustomResourceExt;
use tidb_cluster_resources::crd::tidb_cluster::v1alpha1::TidbCluster;

fn main() -> Result<(), anyhow::Error> {
    let crd = TidbCluster::crd();
    println!("{}", serde_json::to_string_pretty(&crd)?);
    Ok(())
}
