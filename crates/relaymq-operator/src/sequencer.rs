//! Post-deploy sequencer.
//!
//! Dependent resources converge declaratively; a few broker operations only
//! exist as imperative `relayctl` commands inside running members. The
//! sequencer turns pending signaling annotations into an ordered batch of
//! such commands, runs them through a [`PodExecutor`], and clears each
//! annotation only after its step completed. Lifecycle markers live on the
//! server StatefulSet; the plugin-change signal lives on the plugins
//! ConfigMap that carried the change. Nothing runs until the StatefulSet
//! rollout is fully observed.

use crate::annotations;
use crate::crd::RelayCluster;
use crate::error::Result;
use crate::exec::PodExecutor;
use crate::resources::{enabled_plugins, SERVER_CONTAINER};
use crate::retry::{with_conflict_retry, DEFAULT_CONFLICT_RETRIES};
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use tracing::{debug, info};

/// Imperative step derived from a pending signaling annotation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Enable all stable, still-disabled feature flags on a fresh cluster
    EnableFeatureFlags,
    /// Push the effective plugin list into every member
    SetPlugins { members: i32 },
    /// Rebalance queue leaders across members after a scale-up
    RebalanceQueues,
}

impl Step {
    /// The annotation this step consumes
    pub fn annotation(&self) -> &'static str {
        match self {
            Step::EnableFeatureFlags => annotations::CREATED_AT,
            Step::SetPlugins { .. } => annotations::PLUGINS_CHANGED_AT,
            Step::RebalanceQueues => annotations::QUEUE_REBALANCE_NEEDED_AT,
        }
    }
}

/// What the sequencer did with this pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerOutcome {
    /// Rollout still in progress or a step deferred; requeue soon
    NotReady,
    /// Every pending step ran and its annotation was cleared
    Done,
}

/// Ordered pending steps plus whether any step had to be deferred
#[derive(Debug, Default)]
pub struct Plan {
    pub steps: Vec<Step>,
    pub deferred: bool,
}

/// Whether the live StatefulSet has fully observed and completed its
/// current rollout
pub fn rollout_complete(sts: &StatefulSet) -> bool {
    let Some(spec) = sts.spec.as_ref() else {
        return false;
    };
    let Some(status) = sts.status.as_ref() else {
        return false;
    };
    let desired = spec.replicas.unwrap_or(1);
    if sts.metadata.generation != status.observed_generation {
        return false;
    }
    status.replicas == desired
        && status.ready_replicas.unwrap_or(0) == desired
        && status.updated_replicas.unwrap_or(0) == desired
}

/// Derive the pending step batch from the signaling annotations on the
/// StatefulSet and the plugins ConfigMap.
///
/// A plugin change is deferred inside a short grace window so the kubelet
/// has projected the updated plugins file into the pods before `relayctl`
/// reads it.
pub fn plan(sts: &StatefulSet, plugins_conf: Option<&ConfigMap>, now: DateTime<Utc>) -> Plan {
    let replicas = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let mut plan = Plan::default();

    if annotations::read(&sts.metadata, annotations::CREATED_AT).is_some() {
        plan.steps.push(Step::EnableFeatureFlags);
    }

    let plugins_changed = plugins_conf
        .and_then(|cm| annotations::read(&cm.metadata, annotations::PLUGINS_CHANGED_AT));
    if let Some(changed_at) = plugins_changed {
        if annotations::grace_elapsed(&changed_at, now) {
            plan.steps.push(Step::SetPlugins { members: replicas });
        } else {
            plan.deferred = true;
        }
    }

    if annotations::read(&sts.metadata, annotations::QUEUE_REBALANCE_NEEDED_AT).is_some() {
        // Rebalancing a single member is a no-op; run() still consumes the
        // annotation so it does not linger.
        if replicas > 1 {
            plan.steps.push(Step::RebalanceQueues);
        }
    }

    plan
}

/// Parse `relayctl list_feature_flags` output into flags that are stable
/// and still disabled
fn stable_disabled_flags(listing: &str) -> Vec<String> {
    listing
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let name = fields.next()?;
            let state = fields.next()?;
            let stability = fields.next()?;
            (state == "disabled" && stability == "stable").then(|| name.to_string())
        })
        .collect()
}

/// Run one step's commands through the executor.
///
/// Cluster-wide commands run against the first member; plugin activation
/// runs against every member and aborts on the first failure, which
/// surfaces as [`crate::error::OperatorError::CommandFailed`] naming the
/// failing pod.
pub async fn execute_step(
    executor: &dyn PodExecutor,
    namespace: &str,
    cluster: &RelayCluster,
    step: &Step,
) -> Result<()> {
    let first_member = cluster.member_pod_name(0);
    match step {
        Step::EnableFeatureFlags => {
            let listing = executor
                .exec(
                    namespace,
                    &first_member,
                    SERVER_CONTAINER,
                    &[
                        "relayctl".to_string(),
                        "list_feature_flags".to_string(),
                        "--quiet".to_string(),
                        "name".to_string(),
                        "state".to_string(),
                        "stability".to_string(),
                    ],
                )
                .await?;
            for flag in stable_disabled_flags(&listing.stdout) {
                info!(flag = %flag, "Enabling feature flag");
                executor
                    .exec(
                        namespace,
                        &first_member,
                        SERVER_CONTAINER,
                        &[
                            "relayctl".to_string(),
                            "enable_feature_flag".to_string(),
                            flag,
                        ],
                    )
                    .await?;
            }
        }
        Step::SetPlugins { members } => {
            let mut command = vec![
                "relayctl".to_string(),
                "set_plugins".to_string(),
                "--online".to_string(),
            ];
            command.extend(enabled_plugins(cluster));
            for member in 0..*members {
                executor
                    .exec(
                        namespace,
                        &cluster.member_pod_name(member),
                        SERVER_CONTAINER,
                        &command,
                    )
                    .await?;
            }
        }
        Step::RebalanceQueues => {
            executor
                .exec(
                    namespace,
                    &first_member,
                    SERVER_CONTAINER,
                    &[
                        "relayctl".to_string(),
                        "rebalance".to_string(),
                        "queues".to_string(),
                    ],
                )
                .await?;
        }
    }
    Ok(())
}

/// Run all pending steps against a fully rolled-out cluster, clearing each
/// step's annotation once it completed.
pub async fn run(
    client: &Client,
    cluster: &RelayCluster,
    sts: &StatefulSet,
    executor: &dyn PodExecutor,
) -> Result<SequencerOutcome> {
    let replicas = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    if replicas == 0 {
        // No members to run commands in; pending annotations wait for the
        // scale back up.
        return Ok(SequencerOutcome::Done);
    }
    if !rollout_complete(sts) {
        debug!("StatefulSet rollout incomplete; deferring post-deploy steps");
        return Ok(SequencerOutcome::NotReady);
    }

    let namespace = cluster
        .metadata
        .namespace
        .clone()
        .unwrap_or_else(|| "default".to_string());
    let sts_name = sts.metadata.name.clone().unwrap_or_default();
    let statefulsets: Api<StatefulSet> = Api::namespaced(client.clone(), &namespace);
    let configmaps: Api<ConfigMap> = Api::namespaced(client.clone(), &namespace);

    let plugins_conf_name = cluster.plugins_conf_name();
    let plugins_conf = configmaps.get_opt(&plugins_conf_name).await?;
    let plan = plan(sts, plugins_conf.as_ref(), chrono::Utc::now());

    for step in &plan.steps {
        execute_step(executor, &namespace, cluster, step).await?;
        match step {
            Step::SetPlugins { .. } => {
                clear_annotation(&configmaps, &plugins_conf_name, step.annotation()).await?
            }
            _ => clear_annotation(&statefulsets, &sts_name, step.annotation()).await?,
        }
        info!(step = ?step, "Post-deploy step completed");
    }

    // A lingering rebalance annotation on a single-member cluster is
    // consumed without running anything.
    if replicas == 1
        && annotations::read(&sts.metadata, annotations::QUEUE_REBALANCE_NEEDED_AT).is_some()
    {
        clear_annotation(&statefulsets, &sts_name, annotations::QUEUE_REBALANCE_NEEDED_AT).await?;
    }

    if plan.deferred {
        Ok(SequencerOutcome::NotReady)
    } else {
        Ok(SequencerOutcome::Done)
    }
}

async fn clear_annotation<K>(api: &Api<K>, name: &str, key: &str) -> Result<()>
where
    K: Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    with_conflict_retry(DEFAULT_CONFLICT_RETRIES, || async {
        api.patch(
            name,
            &PatchParams::default(),
            &Patch::Merge(annotations::clear_patch(key)),
        )
        .await?;
        Ok(())
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::RelayClusterSpec;
    use crate::exec::RecordingPodExecutor;
    use k8s_openapi::api::apps::v1::{StatefulSetSpec, StatefulSetStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn cluster() -> RelayCluster {
        RelayCluster {
            metadata: ObjectMeta {
                name: Some("broker".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: RelayClusterSpec::test_default(),
            status: None,
        }
    }

    fn rolled_out_sts(replicas: i32, keys: &[&str]) -> StatefulSet {
        let annotations: BTreeMap<String, String> = keys
            .iter()
            .map(|k| (k.to_string(), "2026-01-01T00:00:00Z".to_string()))
            .collect();
        StatefulSet {
            metadata: ObjectMeta {
                name: Some("broker-server".to_string()),
                generation: Some(2),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(StatefulSetSpec {
                replicas: Some(replicas),
                ..Default::default()
            }),
            status: Some(StatefulSetStatus {
                observed_generation: Some(2),
                replicas,
                ready_replicas: Some(replicas),
                updated_replicas: Some(replicas),
                ..Default::default()
            }),
        }
    }

    fn plugins_conf_with(keys: &[&str]) -> ConfigMap {
        let annotations: BTreeMap<String, String> = keys
            .iter()
            .map(|k| (k.to_string(), "2026-01-01T00:00:00Z".to_string()))
            .collect();
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("broker-plugins-conf".to_string()),
                annotations: Some(annotations),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn now() -> DateTime<Utc> {
        "2026-01-01T00:01:00Z".parse().unwrap()
    }

    #[test]
    fn rollout_completion() {
        assert!(rollout_complete(&rolled_out_sts(3, &[])));

        let mut lagging = rolled_out_sts(3, &[]);
        lagging.status.as_mut().unwrap().ready_replicas = Some(2);
        assert!(!rollout_complete(&lagging));

        let mut unobserved = rolled_out_sts(3, &[]);
        unobserved.metadata.generation = Some(3);
        assert!(!rollout_complete(&unobserved));
    }

    #[test]
    fn plan_orders_steps_from_annotations() {
        let sts = rolled_out_sts(
            3,
            &[
                annotations::CREATED_AT,
                annotations::QUEUE_REBALANCE_NEEDED_AT,
            ],
        );
        let cm = plugins_conf_with(&[annotations::PLUGINS_CHANGED_AT]);
        let plan = plan(&sts, Some(&cm), now());
        assert_eq!(
            plan.steps,
            vec![
                Step::EnableFeatureFlags,
                Step::SetPlugins { members: 3 },
                Step::RebalanceQueues,
            ]
        );
        assert!(!plan.deferred);
    }

    #[test]
    fn plugin_change_signals_through_the_plugins_configmap() {
        // The signal lives on the plugins ConfigMap; the same key on the
        // StatefulSet is not part of the contract and is ignored.
        let stale = rolled_out_sts(3, &[annotations::PLUGINS_CHANGED_AT]);
        assert!(plan(&stale, None, now()).steps.is_empty());
        assert!(plan(&stale, Some(&plugins_conf_with(&[])), now())
            .steps
            .is_empty());

        let cm = plugins_conf_with(&[annotations::PLUGINS_CHANGED_AT]);
        let plan = plan(&rolled_out_sts(3, &[]), Some(&cm), now());
        assert_eq!(plan.steps, vec![Step::SetPlugins { members: 3 }]);
    }

    #[test]
    fn plugin_change_deferred_inside_grace_window() {
        let sts = rolled_out_sts(3, &[]);
        let cm = plugins_conf_with(&[annotations::PLUGINS_CHANGED_AT]);
        let just_after: DateTime<Utc> = "2026-01-01T00:00:02Z".parse().unwrap();
        let plan = plan(&sts, Some(&cm), just_after);
        assert!(plan.steps.is_empty());
        assert!(plan.deferred);
    }

    #[test]
    fn rebalance_skipped_for_single_member() {
        let sts = rolled_out_sts(1, &[annotations::QUEUE_REBALANCE_NEEDED_AT]);
        let plan = plan(&sts, None, now());
        assert!(plan.steps.is_empty());
    }

    #[tokio::test]
    async fn feature_flags_enabled_individually() {
        let executor = RecordingPodExecutor::new();
        executor.queue_stdout(
            "classic_mirrored_queue_version enabled stable\n\
             stream_filtering disabled stable\n\
             raft_reorder disabled experimental\n",
        );

        execute_step(&executor, "default", &cluster(), &Step::EnableFeatureFlags)
            .await
            .unwrap();

        let calls = executor.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "broker-server-0");
        assert_eq!(calls[1].1[1], "enable_feature_flag");
        assert_eq!(calls[1].1[2], "stream_filtering");
    }

    #[tokio::test]
    async fn set_plugins_targets_every_member() {
        let executor = RecordingPodExecutor::new();
        let mut rc = cluster();
        rc.spec.plugins = vec!["relay_shovel".to_string()];

        execute_step(&executor, "default", &rc, &Step::SetPlugins { members: 3 })
            .await
            .unwrap();

        assert_eq!(
            executor.pods_called(),
            vec!["broker-server-0", "broker-server-1", "broker-server-2"]
        );
        let calls = executor.calls.lock().unwrap().clone();
        assert!(calls[0].1.contains(&"relay_shovel".to_string()));
        assert!(calls[0].1.contains(&"--online".to_string()));
    }

    #[tokio::test]
    async fn set_plugins_aborts_on_member_failure() {
        let executor = RecordingPodExecutor::new();
        executor.queue_stdout("");
        executor.queue_failure("broker-server-1", "plugin activation failed");

        let err = execute_step(&executor, "default", &cluster(), &Step::SetPlugins { members: 3 })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("broker-server-1"));
        // Member 2 was never reached.
        assert_eq!(executor.pods_called().len(), 2);
    }

    #[tokio::test]
    async fn rebalance_runs_on_first_member() {
        let executor = RecordingPodExecutor::new();
        execute_step(&executor, "default", &cluster(), &Step::RebalanceQueues)
            .await
            .unwrap();
        let calls = executor.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "broker-server-0");
        assert_eq!(calls[0].1[1], "rebalance");
    }
}
