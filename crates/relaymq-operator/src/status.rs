//! Condition tracking for RelayCluster status.
//!
//! Conditions are keyed by type with exactly one entry per type; updates
//! replace in place. `lastTransitionTime` moves only when the status value
//! actually changes, so a re-reconcile that observes the same health does not
//! churn timestamps.

use crate::crd::ClusterCondition;
use chrono::Utc;
use k8s_openapi::api::apps::v1::StatefulSet;

/// All member pods are ready at the desired replica count
pub const CONDITION_ALL_REPLICAS_READY: &str = "AllReplicasReady";

/// At least one member pod is ready to serve clients
pub const CONDITION_CLUSTER_AVAILABLE: &str = "ClusterAvailable";

/// The last reconciliation pass converged without error
pub const CONDITION_RECONCILE_SUCCESS: &str = "ReconcileSuccess";

/// Set a condition, replacing any existing entry of the same type.
///
/// The previous `lastTransitionTime` is preserved when the status value is
/// unchanged; reason and message are always refreshed.
pub fn set_condition(
    conditions: &mut Vec<ClusterCondition>,
    condition_type: &str,
    status: &str,
    reason: &str,
    message: Option<String>,
) {
    let now = Utc::now().to_rfc3339();
    match conditions
        .iter_mut()
        .find(|c| c.condition_type == condition_type)
    {
        Some(existing) => {
            if existing.status != status {
                existing.last_transition_time = Some(now);
            }
            existing.status = status.to_string();
            existing.reason = Some(reason.to_string());
            existing.message = message;
        }
        None => conditions.push(ClusterCondition {
            condition_type: condition_type.to_string(),
            status: status.to_string(),
            reason: Some(reason.to_string()),
            message,
            last_transition_time: Some(now),
        }),
    }
}

/// Look up a condition by type
pub fn get_condition<'a>(
    conditions: &'a [ClusterCondition],
    condition_type: &str,
) -> Option<&'a ClusterCondition> {
    conditions.iter().find(|c| c.condition_type == condition_type)
}

/// Derive the health conditions from the observed StatefulSet.
///
/// `desired_replicas` is the effective replica count after the scaling guard,
/// not necessarily the declared one.
pub fn observe_health(
    conditions: &mut Vec<ClusterCondition>,
    desired_replicas: i32,
    sts: Option<&StatefulSet>,
) {
    let (ready, total) = sts
        .and_then(|s| s.status.as_ref())
        .map(|s| (s.ready_replicas.unwrap_or(0), s.replicas))
        .unwrap_or((0, 0));

    if ready >= desired_replicas && total == desired_replicas {
        set_condition(
            conditions,
            CONDITION_ALL_REPLICAS_READY,
            "True",
            "AllPodsAreReady",
            None,
        );
    } else {
        set_condition(
            conditions,
            CONDITION_ALL_REPLICAS_READY,
            "False",
            "NotAllPodsReady",
            Some(format!("{}/{} pods ready", ready, desired_replicas)),
        );
    }

    // A parked (zero-replica) cluster is intentionally unavailable; report
    // the reason rather than pretending it is degraded.
    if ready > 0 {
        set_condition(
            conditions,
            CONDITION_CLUSTER_AVAILABLE,
            "True",
            "AtLeastOneReplicaReady",
            None,
        );
    } else if desired_replicas == 0 {
        set_condition(
            conditions,
            CONDITION_CLUSTER_AVAILABLE,
            "False",
            "ScaledToZero",
            None,
        );
    } else {
        set_condition(
            conditions,
            CONDITION_CLUSTER_AVAILABLE,
            "False",
            "NoReplicasReady",
            None,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::StatefulSetStatus;

    fn sts_with(ready: i32, total: i32) -> StatefulSet {
        StatefulSet {
            status: Some(StatefulSetStatus {
                replicas: total,
                ready_replicas: Some(ready),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn sets_and_replaces_in_place() {
        let mut conditions = vec![];
        set_condition(
            &mut conditions,
            CONDITION_RECONCILE_SUCCESS,
            "True",
            "Success",
            None,
        );
        assert_eq!(conditions.len(), 1);

        set_condition(
            &mut conditions,
            CONDITION_RECONCILE_SUCCESS,
            "False",
            "UnsupportedOperation",
            Some("tried to scale cluster from 5 nodes to 3 nodes".to_string()),
        );
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].status, "False");
        assert_eq!(
            conditions[0].reason.as_deref(),
            Some("UnsupportedOperation")
        );
    }

    #[test]
    fn transition_time_moves_only_on_status_change() {
        let mut conditions = vec![];
        set_condition(&mut conditions, CONDITION_CLUSTER_AVAILABLE, "True", "A", None);
        let first = conditions[0].last_transition_time.clone();

        set_condition(&mut conditions, CONDITION_CLUSTER_AVAILABLE, "True", "B", None);
        assert_eq!(conditions[0].last_transition_time, first);
        assert_eq!(conditions[0].reason.as_deref(), Some("B"));

        set_condition(&mut conditions, CONDITION_CLUSTER_AVAILABLE, "False", "C", None);
        // Same-millisecond transitions can produce equal timestamps; the
        // field must at least still be present and the status flipped.
        assert!(conditions[0].last_transition_time.is_some());
        assert_eq!(conditions[0].status, "False");
    }

    #[test]
    fn health_all_ready() {
        let mut conditions = vec![];
        let sts = sts_with(3, 3);
        observe_health(&mut conditions, 3, Some(&sts));

        let ready = get_condition(&conditions, CONDITION_ALL_REPLICAS_READY).unwrap();
        assert_eq!(ready.status, "True");
        let avail = get_condition(&conditions, CONDITION_CLUSTER_AVAILABLE).unwrap();
        assert_eq!(avail.status, "True");
    }

    #[test]
    fn health_degraded() {
        let mut conditions = vec![];
        let sts = sts_with(1, 3);
        observe_health(&mut conditions, 3, Some(&sts));

        let ready = get_condition(&conditions, CONDITION_ALL_REPLICAS_READY).unwrap();
        assert_eq!(ready.status, "False");
        assert!(ready.message.as_deref().unwrap().contains("1/3"));
        let avail = get_condition(&conditions, CONDITION_CLUSTER_AVAILABLE).unwrap();
        assert_eq!(avail.status, "True");
    }

    #[test]
    fn health_scaled_to_zero() {
        let mut conditions = vec![];
        let sts = sts_with(0, 0);
        observe_health(&mut conditions, 0, Some(&sts));

        let avail = get_condition(&conditions, CONDITION_CLUSTER_AVAILABLE).unwrap();
        assert_eq!(avail.status, "False");
        assert_eq!(avail.reason.as_deref(), Some("ScaledToZero"));
        let ready = get_condition(&conditions, CONDITION_ALL_REPLICAS_READY).unwrap();
        assert_eq!(ready.status, "True");
    }

    #[test]
    fn health_missing_statefulset() {
        let mut conditions = vec![];
        observe_health(&mut conditions, 3, None);
        let avail = get_condition(&conditions, CONDITION_CLUSTER_AVAILABLE).unwrap();
        assert_eq!(avail.status, "False");
        assert_eq!(avail.reason.as_deref(), Some("NoReplicasReady"));
    }
}
