//! RelayCluster controller.
//!
//! Watches RelayCluster objects and drives one full reconciliation pass per
//! change: operator defaults, TLS validation, the scaling guard, dependent
//! resources in a fixed order, config-change signaling, health observation,
//! the post-deploy sequencer, and finally the status subresource. Deletion
//! runs through a finalizer so member pods are marked before teardown.

use crate::annotations;
use crate::crd::{ClusterCondition, RelayCluster, RelayClusterStatus};
use crate::deletion;
use crate::error::{OperatorError, Result};
use crate::events::{actions, reasons, EventPublisher};
use crate::exec::PodExecutor;
use crate::resources::{
    apply, Applied, ClientServiceBuilder, DefaultUserSecretBuilder, HeadlessServiceBuilder,
    NodeAuthSecretBuilder, PluginsConfigMapBuilder, ServerConfigMapBuilder, ServiceAccountBuilder,
    StatefulSetBuilder,
};
use crate::retry::{with_conflict_retry, DEFAULT_CONFLICT_RETRIES};
use crate::scaling;
use crate::sequencer::{self, SequencerOutcome};
use crate::status::{
    observe_health, set_condition, CONDITION_RECONCILE_SUCCESS,
};
use crate::tls;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::events::EventType;
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::runtime::watcher::Config;
use kube::{Client, Resource, ResourceExt};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use validator::Validate;

/// Default requeue interval for successful reconciliations
const DEFAULT_REQUEUE_SECONDS: u64 = 300; // 5 minutes

/// Requeue interval while dependents are still converging
const IN_PROGRESS_REQUEUE_SECONDS: u64 = 10;

/// Requeue interval for error cases (base for exponential backoff)
const ERROR_REQUEUE_SECONDS: u64 = 30;

/// Maximum requeue delay for error backoff
const MAX_ERROR_REQUEUE_SECONDS: u64 = 600;

/// Operator-level defaults injected into cluster specs that leave the
/// corresponding fields empty
#[derive(Debug, Clone, Default)]
pub struct OperatorConfig {
    pub default_image: Option<String>,
    pub default_image_pull_secrets: Vec<String>,
    pub sidecar_updater_image: Option<String>,
}

/// Context passed to the controller
pub struct ControllerContext {
    /// Kubernetes client
    pub client: Client,
    /// Operator-level defaults
    pub config: OperatorConfig,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Command execution into member pods
    pub executor: Arc<dyn PodExecutor>,
    /// Metrics recorder (optional)
    pub metrics: Option<ControllerMetrics>,
    /// Per-cluster error retry counts for exponential backoff
    pub error_counts: dashmap::DashMap<String, u32>,
}

/// Metrics for the controller
#[derive(Clone)]
pub struct ControllerMetrics {
    /// Counter for reconciliation attempts
    pub reconciliations: metrics::Counter,
    /// Counter for reconciliation errors
    pub errors: metrics::Counter,
    /// Counter for rejected scale/storage transitions
    pub rejected_transitions: metrics::Counter,
    /// Histogram for reconciliation duration
    pub duration: metrics::Histogram,
}

impl ControllerMetrics {
    pub fn new() -> Self {
        Self {
            reconciliations: metrics::counter!("relaymq_operator_reconciliations_total"),
            errors: metrics::counter!("relaymq_operator_reconciliation_errors_total"),
            rejected_transitions: metrics::counter!("relaymq_operator_rejected_transitions_total"),
            duration: metrics::histogram!("relaymq_operator_reconciliation_duration_seconds"),
        }
    }
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the RelayCluster controller
pub async fn run_controller(
    client: Client,
    namespace: Option<String>,
    config: OperatorConfig,
    events: Arc<dyn EventPublisher>,
    executor: Arc<dyn PodExecutor>,
) -> Result<()> {
    let clusters: Api<RelayCluster> = match &namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };

    let ctx = Arc::new(ControllerContext {
        client: client.clone(),
        config,
        events,
        executor,
        metrics: Some(ControllerMetrics::new()),
        error_counts: dashmap::DashMap::new(),
    });

    info!(
        namespace = namespace.as_deref().unwrap_or("all"),
        "Starting RelayCluster controller"
    );

    let statefulsets = match &namespace {
        Some(ns) => Api::<StatefulSet>::namespaced(client.clone(), ns),
        None => Api::<StatefulSet>::all(client.clone()),
    };
    let services = match &namespace {
        Some(ns) => Api::<Service>::namespaced(client.clone(), ns),
        None => Api::<Service>::all(client.clone()),
    };
    let configmaps = match &namespace {
        Some(ns) => Api::<ConfigMap>::namespaced(client.clone(), ns),
        None => Api::<ConfigMap>::all(client.clone()),
    };

    Controller::new(clusters.clone(), Config::default())
        .owns(statefulsets, Config::default())
        .owns(services, Config::default())
        .owns(configmaps, Config::default())
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    debug!(
                        name = obj.name,
                        namespace = obj.namespace,
                        ?action,
                        "Reconciliation completed"
                    );
                }
                Err(e) => {
                    error!(error = %e, "Reconciliation failed");
                }
            }
        })
        .await;

    Ok(())
}

/// Whether reconciliation of this cluster is paused via the pause label
pub fn is_paused(cluster: &RelayCluster) -> bool {
    cluster
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(annotations::PAUSE_RECONCILIATION_LABEL))
        .map(|v| v == "true")
        .unwrap_or(false)
}

/// Main reconciliation function
#[instrument(skip(cluster, ctx), fields(name = %cluster.name_any(), namespace = cluster.namespace()))]
async fn reconcile(cluster: Arc<RelayCluster>, ctx: Arc<ControllerContext>) -> Result<Action> {
    let start = std::time::Instant::now();

    if let Some(ref metrics) = ctx.metrics {
        metrics.reconciliations.increment(1);
    }

    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
    let cluster_name = cluster.name_any();
    let clusters: Api<RelayCluster> = Api::namespaced(ctx.client.clone(), &namespace);

    // Paused clusters skip everything, including finalizer handling, so a
    // paused deletion stays pending until unpaused. Only the paused
    // condition and the event are written.
    if is_paused(&cluster) {
        info!("Reconciliation paused via label");
        let note = "reconciliation is paused; remove the pause label to resume".to_string();
        record_failure(&clusters, &cluster, reasons::PAUSED, note.clone()).await;
        ctx.events
            .publish(
                &cluster.object_ref(&()),
                EventType::Normal,
                reasons::PAUSED,
                actions::RECONCILE,
                Some(note),
            )
            .await;
        return Ok(Action::await_change());
    }

    let result = finalizer(
        &clusters,
        annotations::CLUSTER_FINALIZER,
        cluster,
        |event| async {
            match event {
                FinalizerEvent::Apply(cluster) => apply_cluster(cluster, ctx.clone()).await,
                FinalizerEvent::Cleanup(cluster) => cleanup_cluster(cluster, ctx.clone()).await,
            }
        },
    )
    .await;

    if let Some(ref metrics) = ctx.metrics {
        metrics.duration.record(start.elapsed().as_secs_f64());
    }

    if result.is_ok() {
        ctx.error_counts.remove(&cluster_name);
    }

    result.map_err(|e| {
        if let Some(ref metrics) = ctx.metrics {
            metrics.errors.increment(1);
        }
        OperatorError::FinalizerError(e.to_string())
    })
}

/// Spec-level merge patch filling operator defaults into empty fields, or
/// `None` when nothing needs defaulting
pub fn operator_default_patch(
    cluster: &RelayCluster,
    config: &OperatorConfig,
) -> Option<serde_json::Value> {
    let mut fields = serde_json::Map::new();
    if cluster.spec.image.is_none() {
        if let Some(image) = &config.default_image {
            fields.insert("image".to_string(), json!(image));
        }
    }
    if cluster.spec.sidecar_updater_image.is_none() {
        if let Some(image) = &config.sidecar_updater_image {
            fields.insert("sidecarUpdaterImage".to_string(), json!(image));
        }
    }
    if cluster.spec.image_pull_secrets.is_empty() && !config.default_image_pull_secrets.is_empty() {
        fields.insert(
            "imagePullSecrets".to_string(),
            json!(config.default_image_pull_secrets),
        );
    }
    if fields.is_empty() {
        None
    } else {
        Some(json!({ "spec": fields }))
    }
}

/// Apply (create/update) the cluster and its dependents
#[instrument(skip(cluster, ctx))]
async fn apply_cluster(cluster: Arc<RelayCluster>, ctx: Arc<ControllerContext>) -> Result<Action> {
    let name = cluster.name_any();
    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
    let cluster_ref = cluster.object_ref(&());
    let clusters: Api<RelayCluster> = Api::namespaced(ctx.client.clone(), &namespace);

    info!(name = %name, namespace = %namespace, "Reconciling RelayCluster");

    if let Err(errors) = cluster.spec.validate() {
        let error_messages: Vec<String> = errors
            .field_errors()
            .iter()
            .flat_map(|(field, errs)| {
                errs.iter()
                    .map(move |e| format!("{}: {:?}", field, e.message))
            })
            .collect();
        let error_msg = error_messages.join("; ");
        warn!(name = %name, errors = %error_msg, "Cluster spec validation failed");
        let err = OperatorError::InvalidConfig(error_msg);
        record_failure(&clusters, &cluster, reasons::RECONCILE_FAILED, err.to_string()).await;
        return Err(err);
    }

    // Fill operator defaults first; the patched spec comes back through the
    // watch, so this pass ends here when anything changed.
    if let Some(patch) = operator_default_patch(&cluster, &ctx.config) {
        debug!(name = %name, "Applying operator defaults to cluster spec");
        let result = clusters
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await;
        match result {
            Ok(_) => return Ok(Action::requeue(Duration::from_secs(1))),
            // Someone else wrote the spec first; re-read and retry shortly.
            Err(e) if crate::error::is_conflict(&e) => {
                return Ok(Action::requeue(Duration::from_secs(1)))
            }
            Err(e) => return Err(e.into()),
        }
    }

    // TLS material must be valid before any dependent is touched.
    if let Err(e) = tls::validate(&ctx.client, &cluster, &cluster_ref, ctx.events.as_ref()).await {
        record_failure(&clusters, &cluster, reasons::TLS_ERROR, e.to_string()).await;
        return Err(e);
    }

    let statefulsets: Api<StatefulSet> = Api::namespaced(ctx.client.clone(), &namespace);
    let configmaps: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), &namespace);
    let live_sts = statefulsets.get_opt(&cluster.server_name()).await?;

    // Scaling guard: decide the effective replica count and catch
    // irreversible storage transitions before anything is written.
    let desired = cluster.spec.replicas;
    let current = live_sts
        .as_ref()
        .and_then(|s| s.spec.as_ref())
        .and_then(|s| s.replicas)
        .unwrap_or(desired);
    let snapshot = annotations::read(&cluster.metadata, annotations::BEFORE_ZERO_REPLICAS)
        .and_then(|v| v.parse::<i32>().ok());

    let mut rejection = None;
    let mut effective = desired;
    let mut clear_snapshot = false;
    match scaling::check_replicas(current, desired, snapshot) {
        scaling::ScaleDecision::Permit => {}
        scaling::ScaleDecision::PermitScaleToZero { snapshot } => {
            // Record the pre-zero count before the StatefulSet shrinks, so a
            // crash between the two writes cannot lose it.
            stamp_annotation(
                &clusters,
                &name,
                annotations::BEFORE_ZERO_REPLICAS,
                &snapshot.to_string(),
            )
            .await?;
        }
        scaling::ScaleDecision::PermitScaleFromZero => {
            clear_snapshot = true;
        }
        scaling::ScaleDecision::Reject(r) => {
            effective = current;
            rejection = Some(r);
        }
    }

    if rejection.is_none() {
        if let Some(sts) = live_sts.as_ref() {
            if let Some(r) = scaling::check_storage(sts, &cluster.spec.storage.size)? {
                rejection = Some(r);
            }
        }
    }

    if let Some(r) = &rejection {
        warn!(name = %name, reason = r.reason, message = %r.message, "Rejected cluster transition");
        if let Some(ref metrics) = ctx.metrics {
            metrics.rejected_transitions.increment(1);
        }
        ctx.events
            .publish(
                &cluster_ref,
                EventType::Warning,
                r.reason,
                actions::SCALE,
                Some(r.message.clone()),
            )
            .await;
    }

    // Dependents in fixed order: configuration before the StatefulSet that
    // mounts it.
    let headless = apply(&ctx.client, &namespace, &HeadlessServiceBuilder { cluster: &cluster }).await?;
    let client_svc = apply(&ctx.client, &namespace, &ClientServiceBuilder { cluster: &cluster }).await?;
    apply(&ctx.client, &namespace, &DefaultUserSecretBuilder { cluster: &cluster }).await?;
    apply(&ctx.client, &namespace, &NodeAuthSecretBuilder { cluster: &cluster }).await?;
    apply(&ctx.client, &namespace, &ServiceAccountBuilder { cluster: &cluster }).await?;
    let server_conf = apply(&ctx.client, &namespace, &ServerConfigMapBuilder { cluster: &cluster }).await?;
    let plugins_conf = apply(&ctx.client, &namespace, &PluginsConfigMapBuilder { cluster: &cluster }).await?;
    let sts_applied = apply(
        &ctx.client,
        &namespace,
        &StatefulSetBuilder {
            cluster: &cluster,
            replicas: effective,
        },
    )
    .await?;
    debug!(
        ?headless, ?client_svc, ?server_conf, ?plugins_conf, ?sts_applied,
        "Dependent resources applied"
    );

    signal_changes(
        &cluster,
        &statefulsets,
        &configmaps,
        effective,
        server_conf,
        plugins_conf,
        sts_applied,
    )
    .await?;

    if clear_snapshot {
        clear_annotation(&clusters, &name, annotations::BEFORE_ZERO_REPLICAS).await?;
    }

    // Re-read the StatefulSet so health and the sequencer see this pass's
    // writes.
    let live_sts = statefulsets.get_opt(&cluster.server_name()).await?;

    let mut conditions = cluster
        .status
        .as_ref()
        .map(|s| s.conditions.clone())
        .unwrap_or_default();
    observe_health(&mut conditions, effective, live_sts.as_ref());

    let mut action = Action::requeue(Duration::from_secs(DEFAULT_REQUEUE_SECONDS));
    if let Some(r) = &rejection {
        set_condition(
            &mut conditions,
            CONDITION_RECONCILE_SUCCESS,
            "False",
            r.reason,
            Some(r.message.clone()),
        );
    } else if let Some(sts) = live_sts.as_ref() {
        match sequencer::run(&ctx.client, &cluster, sts, ctx.executor.as_ref()).await {
            Ok(SequencerOutcome::Done) => {
                set_condition(
                    &mut conditions,
                    CONDITION_RECONCILE_SUCCESS,
                    "True",
                    reasons::SUCCESS,
                    None,
                );
            }
            Ok(SequencerOutcome::NotReady) => {
                set_condition(
                    &mut conditions,
                    CONDITION_RECONCILE_SUCCESS,
                    "False",
                    reasons::IN_PROGRESS,
                    Some("waiting for members to roll out".to_string()),
                );
                action = Action::requeue(Duration::from_secs(IN_PROGRESS_REQUEUE_SECONDS));
            }
            Err(e) => {
                ctx.events
                    .publish(
                        &cluster_ref,
                        EventType::Warning,
                        reasons::COMMAND_FAILED,
                        actions::EXEC,
                        Some(e.to_string()),
                    )
                    .await;
                set_condition(
                    &mut conditions,
                    CONDITION_RECONCILE_SUCCESS,
                    "False",
                    reasons::COMMAND_FAILED,
                    Some(e.to_string()),
                );
                let status = build_status(&cluster, conditions, false);
                if let Err(status_err) = update_status(&clusters, &name, status).await {
                    warn!(name = %name, error = %status_err, "Failed to record failure condition");
                }
                return Err(e);
            }
        }
    }

    let succeeded = rejection.is_none()
        && crate::status::get_condition(&conditions, CONDITION_RECONCILE_SUCCESS)
            .map(|c| c.status == "True")
            .unwrap_or(false);

    let status = build_status(&cluster, conditions, succeeded);
    update_status(&clusters, &name, status).await?;

    if succeeded {
        ctx.events
            .publish(
                &cluster_ref,
                EventType::Normal,
                reasons::SUCCESS,
                actions::RECONCILE,
                None,
            )
            .await;
        info!(name = %name, "Reconciliation complete");
    }

    Ok(action)
}

/// Object a signaling stamp lands on
#[derive(Debug, Clone, PartialEq, Eq)]
enum StampTarget {
    StatefulSet,
    ConfigMap(String),
}

/// Map this pass's dependent mutations to the annotations they stamp.
///
/// Config changes are stamped on the ConfigMap that carried them; lifecycle
/// markers (creation, rebalance-needed) live on the StatefulSet.
fn pending_stamps(
    cluster: &RelayCluster,
    effective_replicas: i32,
    server_conf: Applied,
    plugins_conf: Applied,
    sts_applied: Applied,
) -> Vec<(StampTarget, &'static str)> {
    let mut stamps = Vec::new();
    if sts_applied == Applied::Created {
        stamps.push((StampTarget::StatefulSet, annotations::CREATED_AT));
    }
    if plugins_conf == Applied::Updated {
        stamps.push((
            StampTarget::ConfigMap(cluster.plugins_conf_name()),
            annotations::PLUGINS_CHANGED_AT,
        ));
    }
    if server_conf == Applied::Updated {
        stamps.push((
            StampTarget::ConfigMap(cluster.server_conf_name()),
            annotations::SERVER_CONF_CHANGED_AT,
        ));
    }
    if sts_applied == Applied::Updated
        && effective_replicas > 1
        && !cluster.spec.skip_queue_rebalance
    {
        stamps.push((StampTarget::StatefulSet, annotations::QUEUE_REBALANCE_NEEDED_AT));
    }
    stamps
}

/// Translate this pass's dependent mutations into signaling annotations,
/// and roll members when the server config is newer than their last
/// restart.
async fn signal_changes(
    cluster: &RelayCluster,
    statefulsets: &Api<StatefulSet>,
    configmaps: &Api<ConfigMap>,
    effective_replicas: i32,
    server_conf: Applied,
    plugins_conf: Applied,
    sts_applied: Applied,
) -> Result<()> {
    let sts_name = cluster.server_name();

    for (target, key) in pending_stamps(
        cluster,
        effective_replicas,
        server_conf,
        plugins_conf,
        sts_applied,
    ) {
        let stamp = annotations::timestamp_now();
        match target {
            StampTarget::StatefulSet => {
                stamp_annotation(statefulsets, &sts_name, key, &stamp).await?
            }
            StampTarget::ConfigMap(name) => {
                stamp_annotation(configmaps, &name, key, &stamp).await?
            }
        }
    }

    // Roll members when the server config change postdates their last
    // restart. The change stamp lives on the server ConfigMap.
    let Some(live) = statefulsets.get_opt(&sts_name).await? else {
        return Ok(());
    };
    let server_conf_live = configmaps.get_opt(&cluster.server_conf_name()).await?;
    let conf_changed = server_conf_live
        .as_ref()
        .and_then(|cm| annotations::read(&cm.metadata, annotations::SERVER_CONF_CHANGED_AT));
    let last_restart = live
        .spec
        .as_ref()
        .map(|s| &s.template)
        .and_then(|t| t.metadata.as_ref())
        .and_then(|m| m.annotations.as_ref())
        .and_then(|a| a.get(annotations::LAST_RESTART_AT))
        .map(String::as_str);

    if annotations::needs_restart(conf_changed, last_restart) {
        info!(statefulset = %sts_name, "Rolling members for updated server configuration");
        let patch = annotations::stamp_template_patch(
            annotations::LAST_RESTART_AT,
            &annotations::timestamp_now(),
        );
        with_conflict_retry(DEFAULT_CONFLICT_RETRIES, || async {
            statefulsets
                .patch(&sts_name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
            Ok(())
        })
        .await?;
    }
    Ok(())
}

async fn stamp_annotation<K>(api: &Api<K>, name: &str, key: &str, value: &str) -> Result<()>
where
    K: Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    let patch = annotations::stamp_patch(key, value);
    with_conflict_retry(DEFAULT_CONFLICT_RETRIES, || async {
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    })
    .await
}

async fn clear_annotation<K>(api: &Api<K>, name: &str, key: &str) -> Result<()>
where
    K: Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    let patch = annotations::clear_patch(key);
    with_conflict_retry(DEFAULT_CONFLICT_RETRIES, || async {
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    })
    .await
}

/// Status carrying a failed `ReconcileSuccess` condition on top of the
/// cluster's previous conditions; `observedGeneration` never advances here.
fn failure_status(cluster: &RelayCluster, reason: &str, message: String) -> RelayClusterStatus {
    let mut conditions = cluster
        .status
        .as_ref()
        .map(|s| s.conditions.clone())
        .unwrap_or_default();
    set_condition(
        &mut conditions,
        CONDITION_RECONCILE_SUCCESS,
        "False",
        reason,
        Some(message),
    );
    build_status(cluster, conditions, false)
}

/// Land a failure reason on the status before an error return.
///
/// Best-effort: a status write failure is logged but never masks the error
/// being surfaced.
async fn record_failure(
    clusters: &Api<RelayCluster>,
    cluster: &RelayCluster,
    reason: &str,
    message: String,
) {
    let name = cluster.name_any();
    let status = failure_status(cluster, reason, message);
    if let Err(e) = update_status(clusters, &name, status).await {
        warn!(name = %name, error = %e, "Failed to record failure condition");
    }
}

/// Assemble the new status subresource.
///
/// `observedGeneration` advances only after a fully successful pass; a
/// rejected transition or in-progress rollout keeps the previous value so
/// consumers can tell the declared spec has not converged.
fn build_status(
    cluster: &RelayCluster,
    conditions: Vec<ClusterCondition>,
    succeeded: bool,
) -> RelayClusterStatus {
    let previous = cluster.status.as_ref();
    let observed_generation = if succeeded {
        cluster.metadata.generation.unwrap_or(0)
    } else {
        previous.map(|s| s.observed_generation).unwrap_or(0)
    };

    RelayClusterStatus {
        observed_generation,
        conditions,
        default_user_secret: Some(cluster.default_user_secret_name()),
        client_service: Some(cluster.client_service_name()),
    }
}

/// Update the cluster status subresource
async fn update_status(
    api: &Api<RelayCluster>,
    name: &str,
    status: RelayClusterStatus,
) -> Result<()> {
    debug!(name = %name, "Updating cluster status");
    let patch = json!({ "status": status });
    with_conflict_retry(DEFAULT_CONFLICT_RETRIES, || async {
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    })
    .await
}

/// Cleanup when the cluster is deleted: run the deletion protocol, then let
/// the finalizer drop
#[instrument(skip(cluster, ctx))]
async fn cleanup_cluster(
    cluster: Arc<RelayCluster>,
    ctx: Arc<ControllerContext>,
) -> Result<Action> {
    let name = cluster.name_any();
    info!(name = %name, "Cleaning up RelayCluster");

    ctx.events
        .publish(
            &cluster.object_ref(&()),
            EventType::Normal,
            reasons::DELETION_STARTED,
            actions::DELETE,
            None,
        )
        .await;

    deletion::cleanup(&ctx.client, &cluster).await?;

    info!(name = %name, "Cleanup complete");
    Ok(Action::await_change())
}

/// Error policy for the controller: exponential backoff, overridden by the
/// error's own suggested delay
fn error_policy(
    cluster: Arc<RelayCluster>,
    error: &OperatorError,
    ctx: Arc<ControllerContext>,
) -> Action {
    let key = cluster.name_any();
    let retries = {
        let mut entry = ctx.error_counts.entry(key.clone()).or_insert(0);
        *entry += 1;
        *entry
    };

    // 30s → 60s → 120s → 240s → 480s → 600s (capped)
    let delay = error.requeue_delay().unwrap_or_else(|| {
        let base = Duration::from_secs(ERROR_REQUEUE_SECONDS);
        let backoff = base * 2u32.saturating_pow((retries - 1).min(5));
        backoff.min(Duration::from_secs(MAX_ERROR_REQUEUE_SECONDS))
    });

    warn!(
        error = %error,
        retry = retries,
        delay_secs = delay.as_secs(),
        "Reconciliation error for '{}', will retry",
        key
    );

    Action::requeue(delay)
}
