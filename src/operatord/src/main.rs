// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::runtime::{Controller, controller, watcher};
use kube::{Api, Client};
use tidb_cluster_resources::crd::tidb_cluster::v1alpha1::TidbCluster;
use tidb_operatord::controller::{Args, Context, error_policy, reconcile};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[clap(name = "tidb-operatord", about = "Reconciles TiDB clusters.")]
struct Cli {
    /// Which log messages to emit, in `RUST_LOG` syntax.
    #[clap(long, env = "TIDB_OPERATOR_LOG_FILTER", default_value = "info")]
    log_filter: String,
    #[clap(flatten)]
    controller: Args,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&cli.log_filter)
                .with_context(|| format!("invalid log filter {:?}", cli.log_filter))?,
        )
        .init();

    let client = Client::try_default()
        .await
        .context("connecting to Kubernetes")?;
    let (clusters, stateful_sets): (Api<TidbCluster>, Api<StatefulSet>) =
        match &cli.controller.namespace {
            Some(namespace) => (
                Api::namespaced(client.clone(), namespace),
                Api::namespaced(client.clone(), namespace),
            ),
            None => (Api::all(client.clone()), Api::all(client.clone())),
        };

    let concurrency = cli.controller.concurrency;
    info!(namespace = ?cli.controller.namespace, concurrency, "starting controller");
    let context = Arc::new(Context::new(cli.controller, client));
    Controller::new(clusters, watcher::Config::default())
        .owns(stateful_sets, watcher::Config::default())
        .with_config(controller::Config::default().concurrency(concurrency))
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .for_each(|result| async move {
            match result {
                Ok((cluster, action)) => debug!(%cluster, ?action, "reconciled"),
                Err(e) => warn!("controller error: {e}"),
            }
        })
        .await;
    info!("controller stopped");
    Ok(())
}
