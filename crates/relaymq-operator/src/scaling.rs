//! Scaling guard: rejects replica and storage transitions that would lose
//! data.
//!
//! Scale-down of a quorum-backed messaging cluster and in-place storage
//! shrink are irreversible operations the underlying layers cannot perform
//! safely, so the guard freezes the live value, records a typed failure
//! reason on the success condition, and lets the rest of the pass converge
//! what it safely can. Scale-to-zero is special-cased through a saved
//! snapshot of the prior count.

use crate::error::{OperatorError, Result};
use crate::events::reasons;
use k8s_openapi::api::apps::v1::StatefulSet;

/// Name of the data volume-claim template on the server StatefulSet
pub const PERSISTENCE_VOLUME: &str = "persistence";

/// Typed rejection recorded on the success condition and as a warning event
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub reason: &'static str,
    pub message: String,
}

/// Outcome of comparing live replicas against desired
#[derive(Debug, Clone, PartialEq)]
pub enum ScaleDecision {
    /// Apply the desired count as-is
    Permit,
    /// Scaling to zero: snapshot the current count before applying
    PermitScaleToZero { snapshot: i32 },
    /// Returning from zero to the snapshotted count; clear the snapshot
    /// once applied
    PermitScaleFromZero,
    /// Disallowed transition: freeze the live count and record the failure
    Reject(Rejection),
}

/// Evaluate a replica transition.
///
/// `snapshot` is the saved pre-zero count, if any. Scale up among non-zero
/// values is always permitted; scale down among non-zero values never is;
/// zero-scale round trips only back to the exact snapshotted count.
pub fn check_replicas(current: i32, desired: i32, snapshot: Option<i32>) -> ScaleDecision {
    if current == desired {
        return ScaleDecision::Permit;
    }

    if current == 0 {
        return match snapshot {
            Some(saved) if saved == desired => ScaleDecision::PermitScaleFromZero,
            Some(saved) => ScaleDecision::Reject(Rejection {
                reason: reasons::UNSUPPORTED_OPERATION,
                message: format!(
                    "cluster was scaled to zero with {} nodes; scaling back up to {} nodes is not supported, only {} is",
                    saved, desired, saved
                ),
            }),
            None => ScaleDecision::Reject(Rejection {
                reason: reasons::UNSUPPORTED_OPERATION,
                message: format!(
                    "cannot scale cluster from 0 to {} nodes without a saved pre-zero replica count",
                    desired
                ),
            }),
        };
    }

    if desired == 0 {
        return ScaleDecision::PermitScaleToZero { snapshot: current };
    }

    if desired < current {
        return ScaleDecision::Reject(Rejection {
            reason: reasons::UNSUPPORTED_OPERATION,
            message: format!(
                "tried to scale cluster from {} nodes to {} nodes; cluster scale-down is not supported",
                current, desired
            ),
        });
    }

    ScaleDecision::Permit
}

/// Declared capacity of the persistence claim template on a live
/// StatefulSet; a missing template means the cluster runs ephemeral
/// (capacity zero).
pub fn live_storage_capacity(sts: &StatefulSet) -> Result<i128> {
    let quantity = sts
        .spec
        .as_ref()
        .and_then(|s| s.volume_claim_templates.as_ref())
        .and_then(|templates| {
            templates
                .iter()
                .find(|t| t.metadata.name.as_deref() == Some(PERSISTENCE_VOLUME))
        })
        .and_then(|t| t.spec.as_ref())
        .and_then(|s| s.resources.as_ref())
        .and_then(|r| r.requests.as_ref())
        .and_then(|requests| requests.get("storage"))
        .map(|q| q.0.as_str());

    match quantity {
        Some(raw) => parse_quantity(raw),
        None => Ok(0),
    }
}

/// Evaluate a storage-capacity transition against the live StatefulSet.
///
/// Shrinking a non-zero capacity and converting ephemeral (zero) storage to
/// persistent are both irreversible in place and rejected. Expansion is
/// permitted (handled out-of-band by claim resizing).
pub fn check_storage(current_sts: &StatefulSet, desired_size: &str) -> Result<Option<Rejection>> {
    let current = live_storage_capacity(current_sts)?;
    let desired = parse_quantity(desired_size)?;

    if current == 0 && desired > 0 {
        return Ok(Some(Rejection {
            reason: reasons::UNSUPPORTED_OPERATION,
            message: format!(
                "changing from ephemeral to persistent storage ({}) is not supported",
                desired_size
            ),
        }));
    }

    if desired < current {
        return Ok(Some(Rejection {
            reason: reasons::UNSUPPORTED_OPERATION,
            message: format!(
                "shrinking persistent storage to {} is not supported",
                desired_size
            ),
        }));
    }

    Ok(None)
}

/// Parse a Kubernetes resource quantity into milli-units (1Ki = 1024000).
///
/// Supports plain and decimal numbers with binary (Ki..Ei), SI (k..E) and
/// milli suffixes, which covers every storage quantity the CRD validator
/// admits.
pub fn parse_quantity(raw: &str) -> Result<i128> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(raw.len());
    let (number, suffix) = raw.split_at(split);

    let value: f64 = number
        .parse()
        .map_err(|_| OperatorError::InvalidConfig(format!("invalid quantity '{}'", raw)))?;

    let multiplier: f64 = match suffix {
        "" => 1.0,
        "m" => 0.001,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "Ki" => 1024.0,
        "Mi" => 1024f64.powi(2),
        "Gi" => 1024f64.powi(3),
        "Ti" => 1024f64.powi(4),
        "Pi" => 1024f64.powi(5),
        "Ei" => 1024f64.powi(6),
        _ => {
            return Err(OperatorError::InvalidConfig(format!(
                "invalid quantity suffix '{}'",
                suffix
            )))
        }
    };

    Ok((value * multiplier * 1000.0).round() as i128)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::StatefulSetSpec;
    use k8s_openapi::api::core::v1::{
        PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements,
    };
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn sts_with_storage(size: Option<&str>) -> StatefulSet {
        let templates = size.map(|size| {
            let mut requests = BTreeMap::new();
            requests.insert("storage".to_string(), Quantity(size.to_string()));
            vec![PersistentVolumeClaim {
                metadata: ObjectMeta {
                    name: Some(PERSISTENCE_VOLUME.to_string()),
                    ..Default::default()
                },
                spec: Some(PersistentVolumeClaimSpec {
                    resources: Some(VolumeResourceRequirements {
                        requests: Some(requests),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]
        });
        StatefulSet {
            spec: Some(StatefulSetSpec {
                volume_claim_templates: templates,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn scale_up_permitted() {
        assert_eq!(check_replicas(3, 5, None), ScaleDecision::Permit);
        assert_eq!(check_replicas(3, 3, None), ScaleDecision::Permit);
    }

    #[test]
    fn scale_down_rejected_with_both_counts() {
        let decision = check_replicas(5, 3, None);
        let ScaleDecision::Reject(rejection) = decision else {
            panic!("expected rejection");
        };
        assert_eq!(rejection.reason, "UnsupportedOperation");
        assert!(rejection
            .message
            .contains("tried to scale cluster from 5 nodes to 3 nodes"));
    }

    #[test]
    fn scale_to_zero_snapshots_current() {
        assert_eq!(
            check_replicas(4, 0, None),
            ScaleDecision::PermitScaleToZero { snapshot: 4 }
        );
    }

    #[test]
    fn scale_from_zero_round_trip() {
        assert_eq!(
            check_replicas(0, 4, Some(4)),
            ScaleDecision::PermitScaleFromZero
        );

        let ScaleDecision::Reject(rejection) = check_replicas(0, 2, Some(4)) else {
            panic!("expected rejection");
        };
        assert!(rejection.message.contains("only 4"));

        assert!(matches!(
            check_replicas(0, 3, None),
            ScaleDecision::Reject(_)
        ));

        // Staying at zero is a no-op, not a from-zero transition.
        assert_eq!(check_replicas(0, 0, Some(4)), ScaleDecision::Permit);
    }

    #[test]
    fn storage_shrink_rejected() {
        let sts = sts_with_storage(Some("20Gi"));
        let rejection = check_storage(&sts, "10Gi").unwrap().unwrap();
        assert_eq!(rejection.reason, "UnsupportedOperation");
        assert!(rejection.message.contains("shrinking"));
    }

    #[test]
    fn storage_expansion_permitted() {
        let sts = sts_with_storage(Some("10Gi"));
        assert!(check_storage(&sts, "20Gi").unwrap().is_none());
        assert!(check_storage(&sts, "10Gi").unwrap().is_none());
    }

    #[test]
    fn ephemeral_to_persistent_rejected() {
        let sts = sts_with_storage(None);
        let rejection = check_storage(&sts, "10Gi").unwrap().unwrap();
        assert!(rejection.message.contains("ephemeral"));

        let zero = sts_with_storage(Some("0"));
        assert!(check_storage(&zero, "10Gi").unwrap().is_some());

        // Staying ephemeral is fine.
        assert!(check_storage(&sts, "0").unwrap().is_none());
    }

    #[test]
    fn persistent_to_zero_rejected_as_shrink() {
        let sts = sts_with_storage(Some("10Gi"));
        assert!(check_storage(&sts, "0").unwrap().is_some());
    }

    #[test]
    fn quantity_parsing() {
        assert_eq!(parse_quantity("1").unwrap(), 1000);
        assert_eq!(parse_quantity("500m").unwrap(), 500);
        assert_eq!(parse_quantity("1Ki").unwrap(), 1_024_000);
        assert_eq!(parse_quantity("1k").unwrap(), 1_000_000);
        assert!(parse_quantity("10Gi").unwrap() > parse_quantity("10G").unwrap());
        assert!(parse_quantity("1.5Gi").unwrap() > parse_quantity("1Gi").unwrap());
        assert!(parse_quantity("10Qi").is_err());
        assert!(parse_quantity("abc").is_err());
    }
}
