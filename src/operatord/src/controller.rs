// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::api::PostParams;
use kube::runtime::controller::Action;
use kube::{Api, Client, Resource, ResourceExt};
use tidb_cluster_resources::MemberType;
use tidb_cluster_resources::crd::tidb_cluster::v1alpha1::{TidbCluster, TidbClusterStatus};
use tidb_member::{MemberSynchronizer, SyncConfig, SyncOutcome};
use tracing::{debug, info, instrument, trace, warn};

use crate::Error;
use crate::k8s::KubeControl;
use crate::pd::PdControl;
use crate::resources::{DefaultTemplates, ImagePullPolicy};

const SYNCED_CONDITION: &str = "Synced";

#[derive(clap::Parser, Clone, Debug)]
pub struct Args {
    /// Only reconcile clusters in this namespace. All namespaces are watched
    /// if unset.
    #[clap(long, env = "TIDB_OPERATOR_NAMESPACE")]
    pub namespace: Option<String>,
    /// The number of clusters reconciled at once.
    #[clap(long, env = "TIDB_OPERATOR_CONCURRENCY", default_value = "4")]
    pub concurrency: u16,
    /// How long to wait before retrying a pass that is waiting on the
    /// cluster, e.g. for a member to become ready.
    #[clap(long, env = "TIDB_OPERATOR_REQUEUE_DELAY", value_parser = humantime::parse_duration, default_value = "10s")]
    pub requeue_delay: Duration,
    /// How often a cluster is reconciled when nothing about it changes.
    #[clap(long, env = "TIDB_OPERATOR_RESYNC_INTERVAL", value_parser = humantime::parse_duration, default_value = "60s")]
    pub resync_interval: Duration,
    /// The longest wait before retrying a failed pass. Waits double from
    /// one second with each consecutive failure.
    #[clap(long, env = "TIDB_OPERATOR_MAX_ERROR_BACKOFF", value_parser = humantime::parse_duration, default_value = "5m")]
    pub max_error_backoff: Duration,
    /// The placement driver's client port.
    #[clap(long, env = "TIDB_OPERATOR_PD_PORT", default_value = "2379")]
    pub pd_port: u16,
    #[clap(long, env = "TIDB_OPERATOR_PD_SCHEME", default_value = "http")]
    pub pd_scheme: String,
    #[clap(long, env = "TIDB_OPERATOR_PD_TIMEOUT", value_parser = humantime::parse_duration, default_value = "5s")]
    pub pd_timeout: Duration,
    /// Members are replaced during upgrades by an admission webhook rather
    /// than by this operator.
    #[clap(long, env = "TIDB_OPERATOR_POD_WEBHOOK_ENABLED")]
    pub pod_webhook_enabled: bool,
    #[clap(long, env = "TIDB_OPERATOR_IMAGE_PULL_POLICY", value_enum, default_value = "if-not-present")]
    pub image_pull_policy: ImagePullPolicy,
}

/// Consecutive failed passes per cluster, keyed by `namespace/name`.
///
/// A cluster that keeps failing is retried, and so refreshed, at least once
/// per `ttl`. Older entries belong to clusters that are gone and are pruned
/// whenever a failure is recorded.
#[derive(Debug)]
struct FailureTracker {
    ttl: Duration,
    failures: Mutex<BTreeMap<String, (u32, Instant)>>,
}

impl FailureTracker {
    fn new(ttl: Duration) -> FailureTracker {
        FailureTracker {
            ttl,
            failures: Default::default(),
        }
    }

    fn key(tc: &TidbCluster) -> String {
        format!("{}/{}", tc.namespace(), tc.name_any())
    }

    /// Returns how many passes over `key` in a row have failed, this one
    /// included.
    fn record(&self, key: String, now: Instant) -> u32 {
        // Counters stay valid even if a holder panicked.
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        failures.retain(|_, (_, last)| now.saturating_duration_since(*last) <= self.ttl);
        let (count, last) = failures.entry(key).or_insert((0, now));
        *count = count.saturating_add(1);
        *last = now;
        *count
    }

    fn reset(&self, key: &str) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

pub struct Context {
    config: Args,
    client: Client,
    synchronizer: MemberSynchronizer,
    failures: FailureTracker,
}

impl Context {
    pub fn new(config: Args, client: Client) -> Context {
        let kube = Arc::new(KubeControl::new(client.clone()));
        let synchronizer = MemberSynchronizer::new(
            Arc::clone(&kube) as _,
            Arc::clone(&kube) as _,
            kube,
            Arc::new(PdControl::new(
                config.pd_scheme.clone(),
                config.pd_port,
                config.pd_timeout,
            )),
            Arc::new(DefaultTemplates {
                image_pull_policy: config.image_pull_policy,
            }),
            SyncConfig {
                pod_webhook_enabled: config.pod_webhook_enabled,
            },
        );
        let failures = FailureTracker::new(config.max_error_backoff.saturating_mul(2));
        Context {
            config,
            client,
            synchronizer,
            failures,
        }
    }

    fn record_failure(&self, tc: &TidbCluster) -> u32 {
        self.failures.record(FailureTracker::key(tc), Instant::now())
    }

    fn reset_failures(&self, tc: &TidbCluster) {
        self.failures.reset(&FailureTracker::key(tc));
    }

    fn error_backoff(&self, failures: u32) -> Duration {
        error_backoff(failures, self.config.max_error_backoff)
    }

    async fn update_status(
        &self,
        tc: &TidbCluster,
        status: TidbClusterStatus,
    ) -> Result<(), kube::Error> {
        if !tc
            .status
            .as_ref()
            .is_none_or(|current| current.needs_update(&status))
        {
            return Ok(());
        }
        let api: Api<TidbCluster> = Api::namespaced(self.client.clone(), &tc.namespace());
        let mut new_tc = tc.clone();
        new_tc.status = Some(status);
        let data = serde_json::to_vec(&new_tc).map_err(kube::Error::SerdeError)?;
        api.replace_status(&tc.name_any(), &PostParams::default(), data)
            .await?;
        Ok(())
    }

    /// Runs one pass over every component of `tc`, stopping at the first
    /// component that can't finish.
    async fn sync(
        &self,
        tc: &TidbCluster,
        status: &mut TidbClusterStatus,
    ) -> Result<(), tidb_member::Error> {
        for member_type in MemberType::ALL {
            let outcome = self.synchronizer.sync(tc, member_type, status).await?;
            match outcome {
                SyncOutcome::Skipped | SyncOutcome::Paused => {
                    trace!(%member_type, ?outcome, "nothing to do")
                }
                SyncOutcome::Created => info!(%member_type, "created component"),
                SyncOutcome::Synced { .. } => debug!(%member_type, ?outcome, "synced component"),
            }
        }
        Ok(())
    }
}

/// One second, doubling with each consecutive failure up to `max`.
fn error_backoff(failures: u32, max: Duration) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    Duration::from_secs(1u64 << exponent).min(max)
}

fn synced_condition(tc: &TidbCluster, result: &Result<(), tidb_member::Error>) -> Condition {
    let (status, reason, message) = match result {
        Ok(()) => ("True", "Synced", "All components are synced".to_owned()),
        Err(e @ tidb_member::Error::Requeue(_)) => ("False", "Progressing", e.to_string()),
        Err(e @ tidb_member::Error::Fatal { .. }) => ("False", "InvalidSpec", e.to_string()),
        Err(e @ tidb_member::Error::Transient(_)) => ("False", "SyncFailed", format!("{e:#}")),
    };
    let previous = tc
        .status
        .as_ref()
        .and_then(|status| status.conditions.iter().find(|c| c.type_ == SYNCED_CONDITION));
    let last_transition_time = match previous {
        Some(previous) if previous.status == status => previous.last_transition_time.clone(),
        _ => Time(chrono::offset::Utc::now()),
    };
    Condition {
        type_: SYNCED_CONDITION.into(),
        status: status.into(),
        last_transition_time,
        message,
        observed_generation: tc.meta().generation,
        reason: reason.into(),
    }
}

#[instrument(skip_all, fields(cluster = %tc.name_any(), namespace = %tc.namespace()))]
pub async fn reconcile(tc: Arc<TidbCluster>, ctx: Arc<Context>) -> Result<Action, Error> {
    if tc.meta().deletion_timestamp.is_some() {
        ctx.reset_failures(&tc);
        debug!("cluster is being deleted");
        return Ok(Action::await_change());
    }
    let mut status = tc.status();
    let result = ctx.sync(&tc, &mut status).await;

    let condition = synced_condition(&tc, &result);
    status.conditions.retain(|c| c.type_ != SYNCED_CONDITION);
    status.conditions.push(condition);
    ctx.update_status(&tc, status).await?;

    match result {
        Ok(()) => {
            ctx.reset_failures(&tc);
            Ok(Action::requeue(ctx.config.resync_interval))
        }
        Err(tidb_member::Error::Requeue(reason)) => {
            ctx.reset_failures(&tc);
            debug!(%reason, "waiting on the cluster");
            Ok(Action::requeue(ctx.config.requeue_delay))
        }
        Err(e) => Err(e.into()),
    }
}

pub fn error_policy(tc: Arc<TidbCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    if let Error::Member(e @ tidb_member::Error::Fatal { .. }) = error {
        warn!(cluster = %tc.name_any(), "not reconciling until the cluster changes: {e}");
        return Action::await_change();
    }
    let backoff = ctx.error_backoff(ctx.record_failure(&tc));
    warn!(cluster = %tc.name_any(), ?backoff, "reconciliation failed: {error}");
    Action::requeue(backoff)
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use tidb_cluster_resources::MemberPhase;
    use tidb_cluster_resources::crd::tidb_cluster::v1alpha1::TidbClusterSpec;

    use super::*;

    fn cluster(conditions: Vec<Condition>) -> TidbCluster {
        let mut tc = TidbCluster::new("basic", TidbClusterSpec::default());
        tc.metadata = ObjectMeta {
            name: Some("basic".into()),
            namespace: Some("db".into()),
            generation: Some(3),
            ..Default::default()
        };
        tc.status = Some(TidbClusterStatus {
            conditions,
            ..Default::default()
        });
        tc
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let max = Duration::from_secs(60);
        assert_eq!(error_backoff(1, max), Duration::from_secs(1));
        assert_eq!(error_backoff(3, max), Duration::from_secs(4));
        assert_eq!(error_backoff(7, max), max);
        assert_eq!(error_backoff(u32::MAX, max), max);
    }

    #[test]
    fn failures_count_until_reset() {
        let tracker = FailureTracker::new(Duration::from_secs(600));
        let now = Instant::now();
        let key = FailureTracker::key(&cluster(vec![]));
        assert_eq!(key, "db/basic");
        assert_eq!(tracker.record(key.clone(), now), 1);
        assert_eq!(tracker.record(key.clone(), now + Duration::from_secs(1)), 2);
        tracker.reset(&key);
        assert_eq!(tracker.record(key, now + Duration::from_secs(2)), 1);
    }

    #[test]
    fn failures_of_vanished_clusters_are_pruned() {
        let tracker = FailureTracker::new(Duration::from_secs(600));
        let now = Instant::now();
        tracker.record("db/deleted".into(), now);
        tracker.record("db/flapping".into(), now);
        tracker.record("db/flapping".into(), now + Duration::from_secs(500));
        assert_eq!(tracker.len(), 2);

        assert_eq!(
            tracker.record("db/flapping".into(), now + Duration::from_secs(700)),
            3
        );
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn poisoned_failure_counts_stay_usable() {
        let tracker = Arc::new(FailureTracker::new(Duration::from_secs(600)));
        let poisoner = Arc::clone(&tracker);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.failures.lock().unwrap();
            panic!("poison the lock");
        })
        .join();
        assert!(tracker.failures.is_poisoned());
        assert_eq!(tracker.record("db/basic".into(), Instant::now()), 1);
    }

    #[test]
    fn condition_reasons() {
        let tc = cluster(vec![]);
        let condition = synced_condition(&tc, &Ok(()));
        assert_eq!(
            (condition.status.as_str(), condition.reason.as_str()),
            ("True", "Synced")
        );
        assert_eq!(condition.observed_generation, Some(3));

        let condition = synced_condition(
            &tc,
            &Err(tidb_member::Error::Requeue("pd member basic-pd-4 is not healthy".into())),
        );
        assert_eq!(
            (condition.status.as_str(), condition.reason.as_str()),
            ("False", "Progressing")
        );
        assert_eq!(condition.message, "pd member basic-pd-4 is not healthy");

        let condition = synced_condition(
            &tc,
            &Err(tidb_member::Error::fatal(MemberType::Pd, "bad slots")),
        );
        assert_eq!(condition.reason, "InvalidSpec");
        assert_eq!(condition.message, "invalid pd configuration: bad slots");
    }

    #[test]
    fn transition_time_only_moves_on_transitions() {
        let earlier = Time(chrono::DateTime::from_timestamp(1_700_000_000, 0).unwrap());
        let tc = cluster(vec![Condition {
            type_: SYNCED_CONDITION.into(),
            status: "False".into(),
            last_transition_time: earlier.clone(),
            message: String::new(),
            observed_generation: Some(2),
            reason: "Progressing".into(),
        }]);

        let still_waiting = synced_condition(&tc, &Err(tidb_member::Error::Requeue("x".into())));
        assert_eq!(still_waiting.last_transition_time, earlier);

        let synced = synced_condition(&tc, &Ok(()));
        assert_ne!(synced.last_transition_time, earlier);
    }

    #[test]
    fn condition_changes_need_a_status_write() {
        let tc = cluster(vec![]);
        let mut status = tc.status();
        assert!(!tc.status().needs_update(&status));
        status.conditions.push(synced_condition(&tc, &Ok(())));
        assert!(tc.status().needs_update(&status));

        let mut status = tc.status();
        status.pd.phase = MemberPhase::Upgrading;
        assert!(tc.status().needs_update(&status));
    }
}
