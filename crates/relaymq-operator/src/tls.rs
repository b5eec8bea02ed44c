//! TLS secret validation.
//!
//! Runs before any dependent-resource mutation: a cluster that requests TLS
//! must not have its StatefulSet created or updated until the referenced
//! secret material exists and has the required shape.

use crate::crd::RelayCluster;
use crate::error::{is_not_found, OperatorError, Result};
use crate::events::{actions, reasons, EventPublisher};
use k8s_openapi::api::core::v1::{ObjectReference, Secret};
use kube::api::Api;
use kube::runtime::events::EventType;
use kube::Client;
use tracing::warn;

/// Required keys in the TLS secret
const TLS_CERT_KEY: &str = "tls.crt";
const TLS_KEY_KEY: &str = "tls.key";

/// Required key in the CA secret for mutual TLS
const CA_CERT_KEY: &str = "ca.crt";

/// Check that a secret carries a non-empty key
fn has_key(secret: &Secret, key: &str) -> bool {
    let in_data = secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .map(|v| !v.0.is_empty())
        .unwrap_or(false);
    let in_string_data = secret
        .string_data
        .as_ref()
        .and_then(|d| d.get(key))
        .map(|v| !v.is_empty())
        .unwrap_or(false);
    in_data || in_string_data
}

/// Pure shape check of the server certificate secret
pub fn check_certificate_material(secret: &Secret) -> std::result::Result<(), String> {
    if !has_key(secret, TLS_CERT_KEY) {
        return Err(format!("missing key {}", TLS_CERT_KEY));
    }
    if !has_key(secret, TLS_KEY_KEY) {
        return Err(format!("missing key {}", TLS_KEY_KEY));
    }
    Ok(())
}

/// Pure shape check of the CA secret used for mutual TLS
pub fn check_ca_material(secret: &Secret) -> std::result::Result<(), String> {
    if !has_key(secret, CA_CERT_KEY) {
        return Err(format!("missing key {}", CA_CERT_KEY));
    }
    Ok(())
}

/// Pure consistency check of the TLS declaration itself, independent of
/// secret state
pub fn check_tls_config(cluster: &RelayCluster) -> Result<()> {
    let tls = &cluster.spec.tls;
    if tls.disable_non_tls_listeners && !tls.enabled() {
        return Err(OperatorError::InvalidConfig(
            "disableNonTLSListeners requires TLS to be enabled via secretName".to_string(),
        ));
    }
    Ok(())
}

/// Validate the cluster's TLS configuration against live secret state.
///
/// A missing secret returns [`OperatorError::TlsSecretMissing`], which
/// carries a short fixed requeue since external remediation (certificate
/// issuance) is expected soon. Malformed material returns
/// [`OperatorError::TlsSecretInvalid`] and relies on the generic backoff.
pub async fn validate(
    client: &Client,
    cluster: &RelayCluster,
    cluster_ref: &ObjectReference,
    events: &dyn EventPublisher,
) -> Result<()> {
    check_tls_config(cluster)?;

    let tls = &cluster.spec.tls;
    let Some(secret_name) = tls.secret_name.as_deref() else {
        return Ok(());
    };

    let namespace = cluster
        .metadata
        .namespace
        .clone()
        .unwrap_or_else(|| "default".to_string());
    let secrets: Api<Secret> = Api::namespaced(client.clone(), &namespace);

    let secret = match secrets.get(secret_name).await {
        Ok(secret) => secret,
        Err(e) if is_not_found(&e) => {
            let err = OperatorError::TlsSecretMissing {
                secret: secret_name.to_string(),
                namespace,
            };
            warn!(secret = secret_name, "TLS secret not found");
            events
                .publish(
                    cluster_ref,
                    EventType::Warning,
                    reasons::TLS_ERROR,
                    actions::RECONCILE,
                    Some(err.to_string()),
                )
                .await;
            return Err(err);
        }
        Err(e) => return Err(e.into()),
    };

    if let Err(reason) = check_certificate_material(&secret) {
        let err = OperatorError::TlsSecretInvalid {
            secret: secret_name.to_string(),
            reason,
        };
        events
            .publish(
                cluster_ref,
                EventType::Warning,
                reasons::TLS_ERROR,
                actions::RECONCILE,
                Some(err.to_string()),
            )
            .await;
        return Err(err);
    }

    if let Some(ca_secret_name) = tls.ca_secret_name.as_deref() {
        // The CA material may live in the TLS secret itself or in a second
        // named secret.
        let ca_secret = if ca_secret_name == secret_name {
            secret
        } else {
            match secrets.get(ca_secret_name).await {
                Ok(secret) => secret,
                Err(e) if is_not_found(&e) => {
                    let err = OperatorError::TlsSecretMissing {
                        secret: ca_secret_name.to_string(),
                        namespace,
                    };
                    events
                        .publish(
                            cluster_ref,
                            EventType::Warning,
                            reasons::TLS_ERROR,
                            actions::RECONCILE,
                            Some(err.to_string()),
                        )
                        .await;
                    return Err(err);
                }
                Err(e) => return Err(e.into()),
            }
        };

        if let Err(reason) = check_ca_material(&ca_secret) {
            let err = OperatorError::TlsSecretInvalid {
                secret: ca_secret_name.to_string(),
                reason,
            };
            events
                .publish(
                    cluster_ref,
                    EventType::Warning,
                    reasons::TLS_ERROR,
                    actions::RECONCILE,
                    Some(err.to_string()),
                )
                .await;
            return Err(err);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::RelayClusterSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    fn secret_with_keys(keys: &[&str]) -> Secret {
        let mut data = BTreeMap::new();
        for key in keys {
            data.insert(key.to_string(), ByteString(b"pem".to_vec()));
        }
        Secret {
            data: Some(data),
            ..Default::default()
        }
    }

    #[test]
    fn certificate_material_complete() {
        let secret = secret_with_keys(&["tls.crt", "tls.key"]);
        assert!(check_certificate_material(&secret).is_ok());
    }

    #[test]
    fn certificate_material_missing_key() {
        let secret = secret_with_keys(&["tls.crt"]);
        let err = check_certificate_material(&secret).unwrap_err();
        assert!(err.contains("tls.key"));

        let empty = Secret::default();
        assert!(check_certificate_material(&empty).is_err());
    }

    #[test]
    fn certificate_material_empty_value_rejected() {
        let mut secret = secret_with_keys(&["tls.crt", "tls.key"]);
        secret
            .data
            .as_mut()
            .unwrap()
            .insert("tls.key".to_string(), ByteString(vec![]));
        assert!(check_certificate_material(&secret).is_err());
    }

    #[test]
    fn ca_material() {
        assert!(check_ca_material(&secret_with_keys(&["ca.crt"])).is_ok());
        assert!(check_ca_material(&secret_with_keys(&["tls.crt"])).is_err());
    }

    #[test]
    fn disable_non_tls_requires_tls() {
        let mut cluster = RelayCluster {
            metadata: ObjectMeta {
                name: Some("broker".to_string()),
                ..Default::default()
            },
            spec: RelayClusterSpec::test_default(),
            status: None,
        };
        cluster.spec.tls.disable_non_tls_listeners = true;
        assert!(check_tls_config(&cluster).is_err());

        cluster.spec.tls.secret_name = Some("broker-tls".to_string());
        assert!(check_tls_config(&cluster).is_ok());
    }
}
