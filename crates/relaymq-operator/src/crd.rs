//! Custom Resource Definition for the RelayMQ Kubernetes Operator
//!
//! This module defines the `RelayCluster` CRD that represents a RelayMQ
//! clustered messaging broker in Kubernetes. The operator watches these
//! resources and reconciles the dependent child resources (StatefulSet,
//! Services, ConfigMaps, Secrets, ServiceAccount) to match the declared
//! specification.

use kube::CustomResource;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;
use validator::{Validate, ValidationError};

/// Regex for validating Kubernetes resource quantities (e.g., "10Gi", "100Mi")
static QUANTITY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]+(\.[0-9]+)?(Ki|Mi|Gi|Ti|Pi|Ei|m|k|M|G|T|P|E)?$").unwrap());

/// Regex for validating Kubernetes names (RFC 1123 subdomain)
static NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap());

/// Validate a Kubernetes resource quantity string
fn validate_quantity(value: &str) -> Result<(), ValidationError> {
    if QUANTITY_REGEX.is_match(value) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_quantity")
            .with_message(format!("'{}' is not a valid Kubernetes quantity", value).into()))
    }
}

/// Validate an optional Kubernetes name (RFC 1123 subdomain)
fn validate_optional_k8s_name(value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Ok(()); // Empty is allowed for optional fields
    }
    if value.len() > 63 {
        return Err(
            ValidationError::new("name_too_long").with_message("name exceeds 63 characters".into())
        );
    }
    if !NAME_REGEX.is_match(value) {
        return Err(ValidationError::new("invalid_name").with_message(
            format!("'{}' is not a valid Kubernetes name (RFC 1123)", value).into(),
        ));
    }
    Ok(())
}

/// Validate a container image reference
fn validate_optional_image(value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Ok(()); // Empty uses the operator default
    }
    if value.len() > 255 {
        return Err(ValidationError::new("image_too_long")
            .with_message("image reference exceeds 255 characters".into()));
    }
    if value.contains("..") || value.starts_with('/') || value.starts_with('-') {
        return Err(ValidationError::new("invalid_image")
            .with_message(format!("'{}' is not a valid container image", value).into()));
    }
    Ok(())
}

/// Validate plugin names (broker plugin identifiers, snake_case)
fn validate_plugins(plugins: &[String]) -> Result<(), ValidationError> {
    const MAX_PLUGINS: usize = 100;
    if plugins.len() > MAX_PLUGINS {
        return Err(ValidationError::new("too_many_plugins")
            .with_message(format!("maximum {} plugins allowed", MAX_PLUGINS).into()));
    }
    for plugin in plugins {
        if plugin.is_empty()
            || plugin.len() > 100
            || !plugin
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(ValidationError::new("invalid_plugin")
                .with_message(format!("'{}' is not a valid plugin name", plugin).into()));
        }
    }
    Ok(())
}

/// Validate annotations map
fn validate_annotations(annotations: &BTreeMap<String, String>) -> Result<(), ValidationError> {
    if annotations.len() > 50 {
        return Err(ValidationError::new("too_many_annotations")
            .with_message("maximum 50 annotations allowed".into()));
    }
    for (key, value) in annotations {
        if key.len() > 253 {
            return Err(ValidationError::new("annotation_key_too_long")
                .with_message(format!("annotation key '{}' exceeds 253 characters", key).into()));
        }
        if value.len() > 262144 {
            return Err(ValidationError::new("annotation_value_too_long")
                .with_message(format!("annotation '{}' value exceeds 256KB", key).into()));
        }
    }
    Ok(())
}

/// Validate labels map
fn validate_labels(labels: &BTreeMap<String, String>) -> Result<(), ValidationError> {
    if labels.len() > 20 {
        return Err(ValidationError::new("too_many_labels")
            .with_message("maximum 20 labels allowed".into()));
    }
    for (key, value) in labels {
        if key.len() > 253 || value.len() > 63 {
            return Err(ValidationError::new("label_too_long")
                .with_message("label key max 253 chars, value max 63 chars".into()));
        }
        if key.starts_with("app.kubernetes.io/") {
            return Err(ValidationError::new("reserved_label").with_message(
                format!("label '{}' uses reserved prefix app.kubernetes.io/", key).into(),
            ));
        }
    }
    Ok(())
}

/// RelayCluster custom resource definition
///
/// Represents a RelayMQ clustered messaging broker deployment. The operator
/// continuously drives the dependent Kubernetes resources toward this
/// declaration and reports convergence status back onto `.status`.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "relaymq.io",
    version = "v1beta1",
    kind = "RelayCluster",
    plural = "relayclusters",
    shortname = "rmq",
    namespaced,
    status = "RelayClusterStatus",
    printcolumn = r#"{"name":"Replicas", "type":"integer", "jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"ObservedGeneration", "type":"integer", "jsonPath":".status.observedGeneration"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RelayClusterSpec {
    /// Number of broker replicas (0-100; 0 parks the cluster)
    #[serde(default = "default_replicas")]
    #[validate(range(min = 0, max = 100, message = "replicas must be between 0 and 100"))]
    pub replicas: i32,

    /// Container image (empty uses the operator-level default)
    #[serde(default)]
    #[validate(custom(function = "validate_optional_image"))]
    pub image: Option<String>,

    /// Image pull policy (Always, IfNotPresent, Never)
    #[serde(default = "default_image_pull_policy")]
    #[validate(custom(function = "validate_pull_policy"))]
    pub image_pull_policy: String,

    /// Image pull secrets (empty uses the operator-level default)
    #[serde(default)]
    #[validate(length(max = 10, message = "maximum 10 image pull secrets allowed"))]
    pub image_pull_secrets: Vec<String>,

    /// Credential-updater sidecar image (empty uses the operator-level default)
    #[serde(default)]
    #[validate(custom(function = "validate_optional_image"))]
    pub sidecar_updater_image: Option<String>,

    /// Storage configuration
    #[serde(default)]
    #[validate(nested)]
    pub storage: StorageSpec,

    /// Resource requirements (CPU, memory)
    #[serde(default)]
    #[schemars(skip)]
    pub resources: Option<k8s_openapi::api::core::v1::ResourceRequirements>,

    /// TLS configuration
    #[serde(default)]
    #[validate(nested)]
    pub tls: TlsSpec,

    /// Broker plugins to enable in addition to the built-in defaults
    #[serde(default)]
    #[validate(custom(function = "validate_plugins"))]
    pub plugins: Vec<String>,

    /// Server configuration blobs
    #[serde(default)]
    pub config: ConfigSpec,

    /// Client service configuration
    #[serde(default)]
    #[validate(nested)]
    pub service: ServiceConfigSpec,

    /// Skip the automatic queue rebalance after rolling updates
    #[serde(default)]
    pub skip_queue_rebalance: bool,

    /// Additional pod annotations (max 50)
    #[serde(default)]
    #[validate(custom(function = "validate_annotations"))]
    pub pod_annotations: BTreeMap<String, String>,

    /// Additional pod labels (max 20)
    #[serde(default)]
    #[validate(custom(function = "validate_labels"))]
    pub pod_labels: BTreeMap<String, String>,
}

/// Validate image pull policy
fn validate_pull_policy(policy: &str) -> Result<(), ValidationError> {
    match policy {
        "Always" | "IfNotPresent" | "Never" => Ok(()),
        _ => Err(ValidationError::new("invalid_pull_policy")
            .with_message("imagePullPolicy must be Always, IfNotPresent, or Never".into())),
    }
}

/// Storage specification for broker data
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    /// Storage size (e.g., "10Gi"); "0" runs the broker on ephemeral storage
    #[serde(default = "default_storage_size")]
    #[validate(custom(function = "validate_quantity"))]
    pub size: String,

    /// Storage class name (empty uses the cluster default)
    #[serde(default)]
    #[validate(custom(function = "validate_optional_k8s_name"))]
    pub storage_class_name: Option<String>,

    /// Access modes for the PVC
    #[serde(default = "default_access_modes")]
    #[validate(length(min = 1, max = 3, message = "access modes must have 1-3 entries"))]
    pub access_modes: Vec<String>,
}

impl Default for StorageSpec {
    fn default() -> Self {
        Self {
            size: default_storage_size(),
            storage_class_name: None,
            access_modes: default_access_modes(),
        }
    }
}

/// TLS configuration for broker listeners
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct TlsSpec {
    /// Secret holding `tls.crt` and `tls.key`; empty disables TLS
    #[serde(default)]
    #[validate(custom(function = "validate_optional_k8s_name"))]
    pub secret_name: Option<String>,

    /// Secret holding `ca.crt` for mutual TLS peer verification; setting
    /// it enables mutual TLS. May name the TLS secret itself when the CA
    /// certificate lives alongside the server pair.
    #[serde(default)]
    #[validate(custom(function = "validate_optional_k8s_name"))]
    pub ca_secret_name: Option<String>,

    /// Disable the plain (non-TLS) listeners; requires TLS to be enabled
    #[serde(default)]
    pub disable_non_tls_listeners: bool,
}

impl TlsSpec {
    /// Whether TLS is requested at all
    pub fn enabled(&self) -> bool {
        self.secret_name.is_some()
    }

    /// Whether mutual TLS (peer verification) is requested
    pub fn mutual(&self) -> bool {
        self.ca_secret_name.is_some()
    }
}

/// Free-form server configuration blobs, passed to the broker verbatim
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSpec {
    /// Appended to the generated `relaymq.conf` (ini-style key = value lines)
    #[serde(default)]
    pub basic: String,

    /// Full `advanced.config` contents (Erlang term format)
    #[serde(default)]
    pub advanced: String,

    /// Full `relaymq-env.conf` contents (shell environment format)
    #[serde(default)]
    pub env: String,
}

/// Client service configuration
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfigSpec {
    /// Service type for the client-facing service (ClusterIP, NodePort, LoadBalancer)
    #[serde(default = "default_service_type")]
    #[validate(custom(function = "validate_service_type"))]
    pub service_type: String,
}

impl Default for ServiceConfigSpec {
    fn default() -> Self {
        Self {
            service_type: default_service_type(),
        }
    }
}

fn validate_service_type(value: &str) -> Result<(), ValidationError> {
    match value {
        "ClusterIP" | "NodePort" | "LoadBalancer" => Ok(()),
        _ => Err(ValidationError::new("invalid_service_type")
            .with_message("serviceType must be ClusterIP, NodePort, or LoadBalancer".into())),
    }
}

/// Status reported back onto the RelayCluster resource
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RelayClusterStatus {
    /// Generation of the spec that last converged successfully.
    /// Only advances after a fully successful reconciliation pass.
    #[serde(default)]
    pub observed_generation: i64,

    /// Conditions describing cluster state; exactly one entry per type
    #[serde(default)]
    pub conditions: Vec<ClusterCondition>,

    /// Name of the generated default-user credentials Secret
    pub default_user_secret: Option<String>,

    /// Name of the client-facing Service
    pub client_service: Option<String>,
}

/// Condition describing an aspect of cluster state
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCondition {
    /// Type of condition
    #[serde(rename = "type")]
    pub condition_type: String,

    /// Status of the condition ("True", "False", "Unknown")
    pub status: String,

    /// Machine-readable reason for the last transition
    pub reason: Option<String>,

    /// Human-readable message
    pub message: Option<String>,

    /// Last time the condition status changed
    pub last_transition_time: Option<String>,
}

fn default_replicas() -> i32 {
    1
}

fn default_image_pull_policy() -> String {
    "IfNotPresent".to_string()
}

fn default_storage_size() -> String {
    "10Gi".to_string()
}

fn default_access_modes() -> Vec<String> {
    vec!["ReadWriteOnce".to_string()]
}

fn default_service_type() -> String {
    "ClusterIP".to_string()
}

impl RelayCluster {
    /// Name of the server StatefulSet
    pub fn server_name(&self) -> String {
        format!("{}-server", self.base_name())
    }

    /// Name of the headless discovery Service
    pub fn headless_service_name(&self) -> String {
        format!("{}-nodes", self.base_name())
    }

    /// Name of the client-facing Service
    pub fn client_service_name(&self) -> String {
        self.base_name()
    }

    /// Name of the server configuration ConfigMap
    pub fn server_conf_name(&self) -> String {
        format!("{}-server-conf", self.base_name())
    }

    /// Name of the plugins configuration ConfigMap
    pub fn plugins_conf_name(&self) -> String {
        format!("{}-plugins-conf", self.base_name())
    }

    /// Name of the generated default-user credentials Secret
    pub fn default_user_secret_name(&self) -> String {
        format!("{}-default-user", self.base_name())
    }

    /// Name of the generated inter-node auth Secret
    pub fn node_auth_secret_name(&self) -> String {
        format!("{}-node-auth", self.base_name())
    }

    /// Name of the ServiceAccount the member pods run as
    pub fn service_account_name(&self) -> String {
        format!("{}-server", self.base_name())
    }

    /// Pod name of the member at the given StatefulSet ordinal
    pub fn member_pod_name(&self, ordinal: i32) -> String {
        format!("{}-{}", self.server_name(), ordinal)
    }

    fn base_name(&self) -> String {
        self.metadata.name.clone().unwrap_or_default()
    }

    /// Common labels stamped on every dependent resource
    pub fn managed_labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.selector_labels();
        labels.insert(
            "app.kubernetes.io/managed-by".to_string(),
            "relaymq-operator".to_string(),
        );
        labels.insert(
            "app.kubernetes.io/part-of".to_string(),
            "relaymq".to_string(),
        );
        labels
    }

    /// Labels used to select member pods
    pub fn selector_labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert("app.kubernetes.io/name".to_string(), "relaymq".to_string());
        labels.insert(
            "app.kubernetes.io/instance".to_string(),
            self.base_name(),
        );
        labels.insert(
            "app.kubernetes.io/component".to_string(),
            "messaging-server".to_string(),
        );
        labels
    }
}
