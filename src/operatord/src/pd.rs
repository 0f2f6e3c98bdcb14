// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Cluster membership as reported by the placement driver.
//!
//! The placement driver reports its own members and the binlog pumps
//! registered with it. Members of the other components are judged by pod
//! readiness alone.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use tidb_cluster_resources::MemberType;
use tidb_cluster_resources::crd::tidb_cluster::v1alpha1::TidbCluster;
use tidb_member::control::{ClusterControl, ProbeSnapshot, ProbedMember};
use tidb_pd_client::{Client, ClientBuilder, ClientConfig, HealthStatus, MembersInfo, PumpNode};
use tracing::debug;
use url::Url;

#[derive(Clone, Debug)]
pub struct PdControl {
    scheme: String,
    port: u16,
    timeout: Duration,
}

impl PdControl {
    pub fn new(scheme: String, port: u16, timeout: Duration) -> PdControl {
        PdControl {
            scheme,
            port,
            timeout,
        }
    }

    /// The placement driver of `tc`, reached through its peer service.
    pub fn endpoint(&self, tc: &TidbCluster) -> Result<Url, anyhow::Error> {
        let raw = format!(
            "{}://{}.{}.svc:{}",
            self.scheme,
            tc.peer_service_name(MemberType::Pd),
            tc.namespace(),
            self.port
        );
        raw.parse()
            .with_context(|| format!("invalid placement driver endpoint {raw:?}"))
    }

    fn client(&self, tc: &TidbCluster) -> Result<Client, anyhow::Error> {
        let endpoint = self.endpoint(tc)?;
        Ok(ClientBuilder::default()
            .timeout(self.timeout)
            .build(ClientConfig { endpoint })?)
    }

    /// A client for changing the membership of `member_type`.
    fn membership_client(
        &self,
        tc: &TidbCluster,
        member_type: MemberType,
    ) -> Result<Client, anyhow::Error> {
        if !member_type.elects_leader() {
            bail!("{member_type} has no coordinated membership");
        }
        self.client(tc)
    }
}

/// The member name a pump registered under. Node ids are `host:port`, and
/// the host may be the pod's fully qualified name.
fn pump_member_name(node_id: &str) -> &str {
    let host = node_id
        .rsplit_once(':')
        .map_or(node_id, |(host, _port)| host);
    host.split('.').next().unwrap_or(host)
}

/// Pumps that aren't online are unhealthy. Pumps have no leader.
fn pump_snapshot(nodes: Vec<PumpNode>) -> ProbeSnapshot {
    ProbeSnapshot {
        members: nodes
            .iter()
            .map(|node| ProbedMember {
                name: pump_member_name(&node.node_id).to_owned(),
                health: node.is_online(),
            })
            .collect(),
        leader: None,
    }
}

/// Joins the member list with the health report. Members missing from the
/// health report are unhealthy.
fn snapshot(info: MembersInfo, health: Vec<HealthStatus>) -> ProbeSnapshot {
    let health: BTreeMap<_, _> = health
        .into_iter()
        .map(|status| (status.name, status.health))
        .collect();
    ProbeSnapshot {
        members: info
            .members
            .into_iter()
            .map(|member| ProbedMember {
                health: health.get(&member.name).copied().unwrap_or(false),
                name: member.name,
            })
            .collect(),
        leader: info.leader.map(|leader| leader.name),
    }
}

#[async_trait]
impl ClusterControl for PdControl {
    async fn probe(
        &self,
        tc: &TidbCluster,
        member_type: MemberType,
    ) -> Result<Option<ProbeSnapshot>, anyhow::Error> {
        match member_type {
            MemberType::Pd => {
                let client = self.client(tc)?;
                let info = client.members().await?;
                let health = client.health().await?;
                debug!(
                    endpoint = %client.endpoint(),
                    members = info.members.len(),
                    "read placement driver membership"
                );
                Ok(Some(snapshot(info, health)))
            }
            MemberType::Pump => {
                let client = self.client(tc)?;
                let nodes = client.pump_nodes().await?;
                debug!(
                    endpoint = %client.endpoint(),
                    pumps = nodes.len(),
                    "read pump registry"
                );
                Ok(Some(pump_snapshot(nodes)))
            }
            MemberType::Tikv | MemberType::Tiflash | MemberType::Tidb | MemberType::Ticdc => {
                Ok(None)
            }
        }
    }

    async fn transfer_leader(
        &self,
        tc: &TidbCluster,
        member_type: MemberType,
        target: &str,
    ) -> Result<(), anyhow::Error> {
        self.membership_client(tc, member_type)?
            .transfer_leader(target)
            .await
            .with_context(|| format!("transferring {member_type} leadership to {target}"))
    }

    async fn remove_member(
        &self,
        tc: &TidbCluster,
        member_type: MemberType,
        name: &str,
    ) -> Result<(), anyhow::Error> {
        self.membership_client(tc, member_type)?
            .delete_member(name)
            .await
            .with_context(|| format!("removing {member_type} member {name}"))
    }
}
