// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Moving cluster leadership off a member before it is replaced or removed.

use tidb_cluster_resources::MemberType;
use tidb_cluster_resources::crd::tidb_cluster::v1alpha1::TidbCluster;
use tracing::{info, warn};

use crate::control::ClusterControl;
use crate::ordinal::LiveOrdinals;
use crate::status::MemberStatusView;
use crate::{Error, requeue};

/// Picks the member that should take leadership from `vacating`.
///
/// With more than one replica running, leadership goes to the opposite end of
/// the live range: the highest ordinal, or the lowest if `vacating` is the
/// highest. The target is addressed by its member name if the coordination
/// service already knows it, and by its pod name otherwise. With a single
/// replica running, the first healthy peer other than `vacating` is used.
pub fn select_target(
    tc: &TidbCluster,
    member_type: MemberType,
    vacating: u32,
    live: &LiveOrdinals,
    actual_replicas: u32,
    view: &MemberStatusView,
) -> Result<String, Error> {
    let vacating_name = tc.member_name(member_type, vacating);
    let candidate = if actual_replicas > 1 {
        let ordinal = if live.max() == Some(vacating) {
            live.min()
        } else {
            live.max()
        };
        ordinal.map(|ordinal| {
            let name = tc.member_name(member_type, ordinal);
            if view.is_registered(&name) {
                name
            } else {
                tc.pod_name(member_type, ordinal)
            }
        })
    } else {
        view.all_probed()
            .find(|member| member.health && member.name != vacating_name)
            .map(|member| member.name.clone())
    };

    match candidate {
        Some(target)
            if target != vacating_name && target != tc.pod_name(member_type, vacating) =>
        {
            Ok(target)
        }
        _ => requeue!("no safe target to take {member_type} leadership from {vacating_name}"),
    }
}

/// Asks the coordination service to move leadership off `vacating` and
/// returns the member it was handed to.
///
/// The transfer completes asynchronously, so callers must treat success as a
/// reason to come back later rather than as permission to proceed.
pub async fn vacate(
    cluster: &dyn ClusterControl,
    tc: &TidbCluster,
    member_type: MemberType,
    vacating: u32,
    live: &LiveOrdinals,
    actual_replicas: u32,
    view: &MemberStatusView,
) -> Result<String, Error> {
    let target = select_target(tc, member_type, vacating, live, actual_replicas, view)?;
    if let Err(e) = cluster.transfer_leader(tc, member_type, &target).await {
        warn!(%member_type, %target, "failed to transfer leadership: {e:#}");
        return Err(e.into());
    }
    info!(%member_type, from = vacating, %target, "transferred leadership");
    Ok(target)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use tidb_cluster_resources::crd::tidb_cluster::v1alpha1::{ComponentSpec, TidbClusterSpec};

    use super::*;
    use crate::control::{ProbeSnapshot, ProbedMember};
    use crate::replica_group::ObservedReplicaGroup;
    use crate::replica_group::testing::{group, pod};

    fn cluster() -> TidbCluster {
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
            ..Default::default()
        };
        tc
    }

    fn snapshot(
        replicas: u32,
        probed: &[(&str, bool)],
    ) -> (ObservedReplicaGroup, MemberStatusView) {
        let pods: Vec<_> = (0..replicas)
            .map(|ordinal| pod("basic-pd", ordinal, "rev-1", true))
            .collect();
        let observed = ObservedReplicaGroup::new(group("basic-pd", replicas, &[]), &pods);
        let probe = ProbeSnapshot {
            members: probed
                .iter()
                .map(|(name, health)| ProbedMember {
                    name: (*name).into(),
                    health: *health,
                })
                .collect(),
            leader: None,
        };
        let view = MemberStatusView::build(&cluster(), MemberType::Pd, &observed, Some(&probe));
        (observed, view)
    }

    fn select(
        vacating: u32,
        observed: &ObservedReplicaGroup,
        view: &MemberStatusView,
    ) -> Result<String, Error> {
        select_target(
            &cluster(),
            MemberType::Pd,
            vacating,
            &observed.live_ordinals(),
            observed.actual_replicas(),
            view,
        )
    }

    #[test]
    fn prefers_the_opposite_end() {
        let (observed, view) = snapshot(
            3,
            &[("basic-pd-0", true), ("basic-pd-1", true), ("basic-pd-2", true)],
        );
        assert_eq!(select(0, &observed, &view).unwrap(), "basic-pd-2");
        assert_eq!(select(1, &observed, &view).unwrap(), "basic-pd-2");
        assert_eq!(select(2, &observed, &view).unwrap(), "basic-pd-0");
    }

    #[test]
    fn falls_back_to_pod_name() {
        let mut tc = cluster();
        tc.spec.cluster_domain = Some("cluster.local".into());
        let (observed, view) = snapshot(3, &[]);
        let target = select_target(
            &tc,
            MemberType::Pd,
            0,
            &observed.live_ordinals(),
            observed.actual_replicas(),
            &view,
        )
        .unwrap();
        assert_eq!(target, "basic-pd-2");
    }

    #[test]
    fn single_replica_uses_healthy_peer() {
        let (observed, view) = snapshot(
            1,
            &[("basic-pd-0", true), ("other-pd-0", false), ("other-pd-1", true)],
        );
        assert_eq!(select(0, &observed, &view).unwrap(), "other-pd-1");

        let (observed, view) = snapshot(1, &[("basic-pd-0", true), ("other-pd-0", false)]);
        assert!(select(0, &observed, &view).unwrap_err().is_requeue());
    }

    #[derive(Default)]
    struct RecordingCluster {
        transfers: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl ClusterControl for RecordingCluster {
        async fn probe(
            &self,
            _: &TidbCluster,
            _: MemberType,
        ) -> Result<Option<ProbeSnapshot>, anyhow::Error> {
            Ok(None)
        }

        async fn transfer_leader(
            &self,
            _: &TidbCluster,
            _: MemberType,
            target: &str,
        ) -> Result<(), anyhow::Error> {
            if self.fail {
                anyhow::bail!("connection refused");
            }
            self.transfers.lock().unwrap().push(target.to_owned());
            Ok(())
        }

        async fn remove_member(
            &self,
            _: &TidbCluster,
            _: MemberType,
            _: &str,
        ) -> Result<(), anyhow::Error> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn vacate_issues_transfer() {
        let (observed, view) = snapshot(3, &[("basic-pd-0", true), ("basic-pd-2", true)]);
        let cluster_control = RecordingCluster::default();
        let target = vacate(
            &cluster_control,
            &cluster(),
            MemberType::Pd,
            0,
            &observed.live_ordinals(),
            observed.actual_replicas(),
            &view,
        )
        .await
        .unwrap();
        assert_eq!(target, "basic-pd-2");
        assert_eq!(*cluster_control.transfers.lock().unwrap(), vec!["basic-pd-2"]);

        let failing = RecordingCluster {
            fail: true,
            ..Default::default()
        };
        let err = vacate(
            &failing,
            &cluster(),
            MemberType::Pd,
            0,
            &observed.live_ordinals(),
            observed.actual_replicas(),
            &view,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Transient(_)));
    }
}
