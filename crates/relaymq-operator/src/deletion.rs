//! Finalizer-gated deletion cleanup.
//!
//! Member pods are labeled as marked-for-deletion strictly before the
//! StatefulSet goes away, so in-pod shutdown hooks can tell an intentional
//! cluster teardown apart from an ordinary restart and skip their
//! availability safeguards. The StatefulSet delete carries a UID
//! precondition so a concurrently recreated object is never destroyed.

use crate::annotations;
use crate::crd::RelayCluster;
use crate::error::{is_not_found, Result};
use crate::retry::{with_conflict_retry, DEFAULT_CONFLICT_RETRIES};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, Preconditions};
use kube::Client;
use kube::ResourceExt;
use serde_json::json;
use tracing::{debug, info};

/// Merge patch that marks one member pod for deletion
pub fn deletion_label_patch() -> serde_json::Value {
    json!({
        "metadata": {
            "labels": {
                annotations::MARKED_FOR_DELETION_LABEL: "true"
            }
        }
    })
}

/// Delete parameters preconditioned on the exact live UID
pub fn uid_preconditions(uid: Option<String>) -> DeleteParams {
    DeleteParams {
        preconditions: Some(Preconditions {
            uid,
            resource_version: None,
        }),
        ..Default::default()
    }
}

fn member_selector(cluster: &RelayCluster) -> String {
    cluster
        .selector_labels()
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// The writes the deletion protocol performs, kept behind a trait so the
/// protocol's ordering can be exercised without a live cluster.
#[async_trait]
pub trait TeardownOps: Send + Sync {
    /// Names of the live member pods
    async fn member_pods(&self) -> Result<Vec<String>>;
    /// Apply the marked-for-deletion label to one pod
    async fn mark_pod(&self, pod: &str) -> Result<()>;
    /// Delete the server StatefulSet, preconditioned on its live UID
    async fn delete_server(&self) -> Result<()>;
}

struct KubeTeardown {
    pods: Api<Pod>,
    statefulsets: Api<StatefulSet>,
    selector: String,
    sts_name: String,
}

#[async_trait]
impl TeardownOps for KubeTeardown {
    async fn member_pods(&self) -> Result<Vec<String>> {
        let members = self
            .pods
            .list(&ListParams::default().labels(&self.selector))
            .await?;
        Ok(members.iter().map(|p| p.name_any()).collect())
    }

    async fn mark_pod(&self, pod: &str) -> Result<()> {
        with_conflict_retry(DEFAULT_CONFLICT_RETRIES, || async {
            self.pods
                .patch(
                    pod,
                    &PatchParams::default(),
                    &Patch::Merge(deletion_label_patch()),
                )
                .await?;
            Ok(())
        })
        .await
    }

    async fn delete_server(&self) -> Result<()> {
        let live = match self.statefulsets.get(&self.sts_name).await {
            Ok(sts) => sts,
            Err(e) if is_not_found(&e) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let params = uid_preconditions(live.metadata.uid.clone());
        match self.statefulsets.delete(&self.sts_name, &params).await {
            Ok(_) => {
                info!(statefulset = %self.sts_name, "Deleted server StatefulSet");
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Run the deletion protocol for a cluster whose finalizer fired.
///
/// Labeling failures surface after the conflict-retry budget and leave the
/// finalizer in place, so the protocol re-runs on the next pass. Objects
/// already gone are treated as success.
pub async fn cleanup(client: &Client, cluster: &RelayCluster) -> Result<()> {
    let namespace = cluster
        .metadata
        .namespace
        .clone()
        .unwrap_or_else(|| "default".to_string());
    info!(cluster = %cluster.name_any(), "Running deletion cleanup");

    let ops = KubeTeardown {
        pods: Api::namespaced(client.clone(), &namespace),
        statefulsets: Api::namespaced(client.clone(), &namespace),
        selector: member_selector(cluster),
        sts_name: cluster.server_name(),
    };
    run_teardown(&ops).await
}

/// Label every member pod, then delete the StatefulSet.
///
/// Every pod must be marked (or already gone) before the delete; any other
/// labeling error stops the protocol ahead of the delete.
pub async fn run_teardown(ops: &dyn TeardownOps) -> Result<()> {
    for pod in ops.member_pods().await? {
        match ops.mark_pod(&pod).await {
            Ok(()) => debug!(pod = %pod, "Marked member pod for deletion"),
            // A pod that vanished mid-protocol needs no marking.
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
    }
    ops.delete_server().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::RelayClusterSpec;
    use crate::error::OperatorError;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::sync::Mutex;

    struct RecordingTeardown {
        members: Vec<String>,
        /// Pod whose labeling fails past the retry budget
        mark_failure: Option<String>,
        calls: Mutex<Vec<String>>,
    }

    impl RecordingTeardown {
        fn new(members: &[&str]) -> Self {
            Self {
                members: members.iter().map(|m| m.to_string()).collect(),
                mark_failure: None,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TeardownOps for RecordingTeardown {
        async fn member_pods(&self) -> Result<Vec<String>> {
            self.calls.lock().unwrap().push("list".to_string());
            Ok(self.members.clone())
        }

        async fn mark_pod(&self, pod: &str) -> Result<()> {
            self.calls.lock().unwrap().push(format!("mark:{}", pod));
            match &self.mark_failure {
                Some(failing) if failing == pod => Err(OperatorError::ReconcileFailed(
                    "write conflict persisted after 4 attempts".to_string(),
                )),
                _ => Ok(()),
            }
        }

        async fn delete_server(&self) -> Result<()> {
            self.calls.lock().unwrap().push("delete".to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn pods_marked_strictly_before_statefulset_delete() {
        let ops = RecordingTeardown::new(&["broker-server-0", "broker-server-1"]);
        run_teardown(&ops).await.unwrap();
        assert_eq!(
            ops.calls(),
            vec!["list", "mark:broker-server-0", "mark:broker-server-1", "delete"]
        );
    }

    #[tokio::test]
    async fn vanished_pod_is_skipped_not_fatal() {
        struct VanishingPod(RecordingTeardown);

        #[async_trait]
        impl TeardownOps for VanishingPod {
            async fn member_pods(&self) -> Result<Vec<String>> {
                self.0.member_pods().await
            }
            async fn mark_pod(&self, pod: &str) -> Result<()> {
                self.0.calls.lock().unwrap().push(format!("mark:{}", pod));
                if pod == "broker-server-0" {
                    Err(OperatorError::NotFound {
                        kind: "Pod".to_string(),
                        name: pod.to_string(),
                        namespace: "default".to_string(),
                    })
                } else {
                    Ok(())
                }
            }
            async fn delete_server(&self) -> Result<()> {
                self.0.delete_server().await
            }
        }

        let ops = VanishingPod(RecordingTeardown::new(&[
            "broker-server-0",
            "broker-server-1",
        ]));
        run_teardown(&ops).await.unwrap();
        assert_eq!(
            ops.0.calls(),
            vec!["list", "mark:broker-server-0", "mark:broker-server-1", "delete"]
        );
    }

    #[tokio::test]
    async fn labeling_failure_halts_before_delete() {
        let mut ops = RecordingTeardown::new(&["broker-server-0", "broker-server-1"]);
        ops.mark_failure = Some("broker-server-0".to_string());

        let result = run_teardown(&ops).await;
        assert!(result.is_err());
        assert_eq!(ops.calls(), vec!["list", "mark:broker-server-0"]);
    }

    #[test]
    fn delete_is_preconditioned_on_uid() {
        let params = uid_preconditions(Some("4ac53e0e".to_string()));
        let preconditions = params.preconditions.unwrap();
        assert_eq!(preconditions.uid.as_deref(), Some("4ac53e0e"));
        assert!(preconditions.resource_version.is_none());
    }

    #[test]
    fn deletion_label_patch_shape() {
        let patch = deletion_label_patch();
        assert_eq!(
            patch["metadata"]["labels"][annotations::MARKED_FOR_DELETION_LABEL],
            "true"
        );
    }

    #[test]
    fn member_selector_targets_instance() {
        let cluster = RelayCluster {
            metadata: ObjectMeta {
                name: Some("broker".to_string()),
                ..Default::default()
            },
            spec: RelayClusterSpec::test_default(),
            status: None,
        };
        let selector = member_selector(&cluster);
        assert!(selector.contains("app.kubernetes.io/instance=broker"));
        assert!(selector.contains("app.kubernetes.io/name=relaymq"));
    }
}
