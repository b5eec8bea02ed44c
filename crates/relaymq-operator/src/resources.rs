//! Dependent-resource builders.
//!
//! Every child resource of a RelayCluster is produced by a
//! [`DependentBuilder`]: `build()` returns the creation skeleton (identity,
//! owner reference, labels — no mutable spec), `update()` is the idempotent
//! in-place mutation applied on every pass. [`apply`] wires the two into
//! CreateOrUpdate semantics and reports whether the live object was actually
//! mutated, which is what the config-change signaling keys on.
//!
//! The driver applies builders in a fixed order so configuration objects
//! exist before the StatefulSet that mounts them; see
//! [`crate::controller`].

use crate::annotations;
use crate::crd::RelayCluster;
use crate::error::{is_not_found, OperatorError, Result};
use crate::retry::{with_conflict_retry, DEFAULT_CONFLICT_RETRIES};
use crate::scaling::{parse_quantity, PERSISTENCE_VOLUME};
use k8s_openapi::api::apps::v1::{
    RollingUpdateStatefulSetStrategy, StatefulSet, StatefulSetUpdateStrategy,
};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource, EnvVar,
    EnvVarSource, ObjectFieldSelector, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PodSpec, PodTemplateSpec, Secret, SecretVolumeSource, Service, ServiceAccount, ServicePort,
    Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, PostParams};
use kube::Client;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

/// Name of the broker container inside member pods
pub const SERVER_CONTAINER: &str = "relaymq";

/// Plugins always enabled regardless of the declared list
const DEFAULT_PLUGINS: [&str; 2] = ["relay_management", "relay_peer_discovery_k8s"];

const AMQP_PORT: i32 = 5672;
const AMQP_TLS_PORT: i32 = 5671;
const MANAGEMENT_PORT: i32 = 15672;
const CLUSTERING_PORT: i32 = 25672;

/// Builder for one dependent-resource kind.
///
/// `update()` must be idempotent: applying it twice to the same object must
/// produce the same object, and it must never clobber fields it does not
/// own (generated credentials, the rollout restart stamp, immutable claim
/// templates).
pub trait DependentBuilder {
    type Resource: kube::Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + std::fmt::Debug
        + Serialize
        + DeserializeOwned;

    /// Kind tag used for logging and change signaling
    fn resource_type(&self) -> &'static str;

    /// Creation skeleton: identity, owner reference and labels only
    fn build(&self) -> Self::Resource;

    /// In-place mutation toward the desired state
    fn update(&self, existing: &mut Self::Resource) -> Result<()>;
}

/// How [`apply`] left the live object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Created,
    Updated,
    Unchanged,
}

/// Create-if-absent, else mutate-and-replace-if-different, retried on
/// optimistic-concurrency conflicts with bounded attempts.
pub async fn apply<B>(client: &Client, namespace: &str, builder: &B) -> Result<Applied>
where
    B: DependentBuilder,
{
    let skeleton = builder.build();
    let name = kube::Resource::meta(&skeleton)
        .name
        .clone()
        .ok_or_else(|| {
            OperatorError::InvalidConfig(format!(
                "{} builder produced no name",
                builder.resource_type()
            ))
        })?;
    let api: Api<B::Resource> = Api::namespaced(client.clone(), namespace);

    with_conflict_retry(DEFAULT_CONFLICT_RETRIES, || {
        let api = api.clone();
        let name = name.clone();
        async move {
            match api.get(&name).await {
                Ok(existing) => {
                    let mut desired = existing.clone();
                    builder.update(&mut desired)?;
                    if serde_json::to_value(&existing)? == serde_json::to_value(&desired)? {
                        Ok(Applied::Unchanged)
                    } else {
                        debug!(kind = builder.resource_type(), name = %name, "Updating dependent");
                        api.replace(&name, &PostParams::default(), &desired).await?;
                        Ok(Applied::Updated)
                    }
                }
                Err(e) if is_not_found(&e) => {
                    let mut object = builder.build();
                    builder.update(&mut object)?;
                    debug!(kind = builder.resource_type(), name = %name, "Creating dependent");
                    api.create(&PostParams::default(), &object).await?;
                    Ok(Applied::Created)
                }
                Err(e) => Err(e.into()),
            }
        }
    })
    .await
}

/// Owner reference every dependent carries back to its RelayCluster
fn owner_reference(cluster: &RelayCluster) -> OwnerReference {
    OwnerReference {
        api_version: "relaymq.io/v1beta1".to_string(),
        kind: "RelayCluster".to_string(),
        name: cluster.metadata.name.clone().unwrap_or_default(),
        uid: cluster.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

fn child_meta(cluster: &RelayCluster, name: String) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: cluster.metadata.namespace.clone(),
        labels: Some(cluster.managed_labels()),
        owner_references: Some(vec![owner_reference(cluster)]),
        ..Default::default()
    }
}

/// Re-assert the fields of the metadata the operator owns, leaving
/// annotations and third-party labels alone
fn reassert_meta(cluster: &RelayCluster, meta: &mut ObjectMeta) {
    let labels = meta.labels.get_or_insert_with(BTreeMap::new);
    for (k, v) in cluster.managed_labels() {
        labels.insert(k, v);
    }
    meta.owner_references = Some(vec![owner_reference(cluster)]);
}

/// Effective plugin list: built-in defaults first, then the declared
/// plugins in order, duplicates dropped
pub fn enabled_plugins(cluster: &RelayCluster) -> Vec<String> {
    let mut plugins: Vec<String> = DEFAULT_PLUGINS.iter().map(|p| p.to_string()).collect();
    for plugin in &cluster.spec.plugins {
        if !plugins.contains(plugin) {
            plugins.push(plugin.clone());
        }
    }
    plugins
}

/// Whether the cluster runs on ephemeral storage (declared capacity zero)
fn is_ephemeral(cluster: &RelayCluster) -> bool {
    parse_quantity(&cluster.spec.storage.size)
        .map(|q| q == 0)
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Services

/// Headless service for member discovery
pub struct HeadlessServiceBuilder<'a> {
    pub cluster: &'a RelayCluster,
}

impl DependentBuilder for HeadlessServiceBuilder<'_> {
    type Resource = Service;

    fn resource_type(&self) -> &'static str {
        "HeadlessService"
    }

    fn build(&self) -> Service {
        Service {
            metadata: child_meta(self.cluster, self.cluster.headless_service_name()),
            ..Default::default()
        }
    }

    fn update(&self, existing: &mut Service) -> Result<()> {
        reassert_meta(self.cluster, &mut existing.metadata);
        let spec = existing.spec.get_or_insert_with(Default::default);
        // clusterIP is immutable; only stamp it at first creation.
        if spec.cluster_ip.is_none() {
            spec.cluster_ip = Some("None".to_string());
        }
        spec.selector = Some(self.cluster.selector_labels());
        spec.publish_not_ready_addresses = Some(true);
        spec.ports = Some(vec![ServicePort {
            name: Some("clustering".to_string()),
            port: CLUSTERING_PORT,
            target_port: Some(IntOrString::Int(CLUSTERING_PORT)),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]);
        Ok(())
    }
}

/// Client-facing service
pub struct ClientServiceBuilder<'a> {
    pub cluster: &'a RelayCluster,
}

impl DependentBuilder for ClientServiceBuilder<'_> {
    type Resource = Service;

    fn resource_type(&self) -> &'static str {
        "ClientService"
    }

    fn build(&self) -> Service {
        Service {
            metadata: child_meta(self.cluster, self.cluster.client_service_name()),
            ..Default::default()
        }
    }

    fn update(&self, existing: &mut Service) -> Result<()> {
        reassert_meta(self.cluster, &mut existing.metadata);
        let tls = &self.cluster.spec.tls;

        let mut ports = Vec::new();
        if !tls.disable_non_tls_listeners {
            ports.push(ServicePort {
                name: Some("amqp".to_string()),
                port: AMQP_PORT,
                target_port: Some(IntOrString::Int(AMQP_PORT)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            });
        }
        if tls.enabled() {
            ports.push(ServicePort {
                name: Some("amqps".to_string()),
                port: AMQP_TLS_PORT,
                target_port: Some(IntOrString::Int(AMQP_TLS_PORT)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            });
        }
        ports.push(ServicePort {
            name: Some("management".to_string()),
            port: MANAGEMENT_PORT,
            target_port: Some(IntOrString::Int(MANAGEMENT_PORT)),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        });

        let spec = existing.spec.get_or_insert_with(Default::default);
        spec.type_ = Some(self.cluster.spec.service.service_type.clone());
        spec.selector = Some(self.cluster.selector_labels());
        spec.ports = Some(ports);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Secrets

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn secret_has_key(secret: &Secret, key: &str) -> bool {
    secret
        .data
        .as_ref()
        .map(|d| d.contains_key(key))
        .unwrap_or(false)
        || secret
            .string_data
            .as_ref()
            .map(|d| d.contains_key(key))
            .unwrap_or(false)
}

/// Generated default-user credentials.
///
/// Credentials are generated exactly once; subsequent updates leave the
/// stored material untouched.
pub struct DefaultUserSecretBuilder<'a> {
    pub cluster: &'a RelayCluster,
}

impl DependentBuilder for DefaultUserSecretBuilder<'_> {
    type Resource = Secret;

    fn resource_type(&self) -> &'static str {
        "DefaultUserSecret"
    }

    fn build(&self) -> Secret {
        Secret {
            metadata: child_meta(self.cluster, self.cluster.default_user_secret_name()),
            type_: Some("Opaque".to_string()),
            ..Default::default()
        }
    }

    fn update(&self, existing: &mut Secret) -> Result<()> {
        reassert_meta(self.cluster, &mut existing.metadata);
        if !secret_has_key(existing, "username") || !secret_has_key(existing, "password") {
            let string_data = existing.string_data.get_or_insert_with(BTreeMap::new);
            string_data.insert(
                "username".to_string(),
                format!("default_user_{}", random_token(10).to_lowercase()),
            );
            string_data.insert("password".to_string(), random_token(24));
        }
        Ok(())
    }
}

/// Generated inter-node authentication cookie
pub struct NodeAuthSecretBuilder<'a> {
    pub cluster: &'a RelayCluster,
}

impl DependentBuilder for NodeAuthSecretBuilder<'_> {
    type Resource = Secret;

    fn resource_type(&self) -> &'static str {
        "NodeAuthSecret"
    }

    fn build(&self) -> Secret {
        Secret {
            metadata: child_meta(self.cluster, self.cluster.node_auth_secret_name()),
            type_: Some("Opaque".to_string()),
            ..Default::default()
        }
    }

    fn update(&self, existing: &mut Secret) -> Result<()> {
        reassert_meta(self.cluster, &mut existing.metadata);
        if !secret_has_key(existing, "cookie") {
            existing
                .string_data
                .get_or_insert_with(BTreeMap::new)
                .insert("cookie".to_string(), random_token(32));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ServiceAccount

pub struct ServiceAccountBuilder<'a> {
    pub cluster: &'a RelayCluster,
}

impl DependentBuilder for ServiceAccountBuilder<'_> {
    type Resource = ServiceAccount;

    fn resource_type(&self) -> &'static str {
        "ServiceAccount"
    }

    fn build(&self) -> ServiceAccount {
        ServiceAccount {
            metadata: child_meta(self.cluster, self.cluster.service_account_name()),
            ..Default::default()
        }
    }

    fn update(&self, existing: &mut ServiceAccount) -> Result<()> {
        reassert_meta(self.cluster, &mut existing.metadata);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ConfigMaps

/// Render the generated `relaymq.conf`, with the declared basic blob
/// appended verbatim
fn render_server_conf(cluster: &RelayCluster) -> String {
    let tls = &cluster.spec.tls;
    let mut conf = String::new();
    conf.push_str(&format!(
        "cluster_formation.peer_discovery_backend = k8s\n\
         cluster_formation.k8s.service_name = {}\n\
         cluster_name = {}\n",
        cluster.headless_service_name(),
        cluster.metadata.name.as_deref().unwrap_or_default(),
    ));
    if tls.disable_non_tls_listeners {
        conf.push_str("listeners.tcp = none\n");
    } else {
        conf.push_str(&format!("listeners.tcp.default = {}\n", AMQP_PORT));
    }
    if tls.enabled() {
        conf.push_str(&format!(
            "listeners.ssl.default = {}\n\
             ssl_options.certfile = /etc/relaymq-tls/tls.crt\n\
             ssl_options.keyfile = /etc/relaymq-tls/tls.key\n",
            AMQP_TLS_PORT
        ));
        if tls.mutual() {
            conf.push_str(
                "ssl_options.cacertfile = /etc/relaymq-tls/ca.crt\n\
                 ssl_options.verify = verify_peer\n\
                 ssl_options.fail_if_no_peer_cert = true\n",
            );
        }
    }
    if !cluster.spec.config.basic.is_empty() {
        conf.push_str(cluster.spec.config.basic.trim_end());
        conf.push('\n');
    }
    conf
}

/// Server configuration ConfigMap (`relaymq.conf`, `advanced.config`,
/// `relaymq-env.conf`)
pub struct ServerConfigMapBuilder<'a> {
    pub cluster: &'a RelayCluster,
}

impl DependentBuilder for ServerConfigMapBuilder<'_> {
    type Resource = ConfigMap;

    fn resource_type(&self) -> &'static str {
        "ServerConfigMap"
    }

    fn build(&self) -> ConfigMap {
        ConfigMap {
            metadata: child_meta(self.cluster, self.cluster.server_conf_name()),
            ..Default::default()
        }
    }

    fn update(&self, existing: &mut ConfigMap) -> Result<()> {
        reassert_meta(self.cluster, &mut existing.metadata);
        let mut data = BTreeMap::new();
        data.insert("relaymq.conf".to_string(), render_server_conf(self.cluster));
        if !self.cluster.spec.config.advanced.is_empty() {
            data.insert(
                "advanced.config".to_string(),
                self.cluster.spec.config.advanced.clone(),
            );
        }
        if !self.cluster.spec.config.env.is_empty() {
            data.insert(
                "relaymq-env.conf".to_string(),
                self.cluster.spec.config.env.clone(),
            );
        }
        existing.data = Some(data);
        Ok(())
    }
}

/// Enabled-plugins ConfigMap
pub struct PluginsConfigMapBuilder<'a> {
    pub cluster: &'a RelayCluster,
}

impl DependentBuilder for PluginsConfigMapBuilder<'_> {
    type Resource = ConfigMap;

    fn resource_type(&self) -> &'static str {
        "PluginsConfigMap"
    }

    fn build(&self) -> ConfigMap {
        ConfigMap {
            metadata: child_meta(self.cluster, self.cluster.plugins_conf_name()),
            ..Default::default()
        }
    }

    fn update(&self, existing: &mut ConfigMap) -> Result<()> {
        reassert_meta(self.cluster, &mut existing.metadata);
        let mut data = BTreeMap::new();
        data.insert(
            "enabled_plugins".to_string(),
            format!("[{}].", enabled_plugins(self.cluster).join(",")),
        );
        existing.data = Some(data);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// StatefulSet

/// Server StatefulSet.
///
/// `replicas` is the effective count after the scaling guard, which may
/// differ from the declared one when a transition was rejected.
pub struct StatefulSetBuilder<'a> {
    pub cluster: &'a RelayCluster,
    pub replicas: i32,
}

impl StatefulSetBuilder<'_> {
    fn container(&self) -> Container {
        let spec = &self.cluster.spec;
        let tls = &spec.tls;

        let mut ports = vec![
            ContainerPort {
                name: Some("management".to_string()),
                container_port: MANAGEMENT_PORT,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
            ContainerPort {
                name: Some("clustering".to_string()),
                container_port: CLUSTERING_PORT,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
        ];
        if !tls.disable_non_tls_listeners {
            ports.push(ContainerPort {
                name: Some("amqp".to_string()),
                container_port: AMQP_PORT,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            });
        }
        if tls.enabled() {
            ports.push(ContainerPort {
                name: Some("amqps".to_string()),
                container_port: AMQP_TLS_PORT,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            });
        }

        let env = vec![
            EnvVar {
                name: "RELAYMQ_POD_NAME".to_string(),
                value_from: Some(EnvVarSource {
                    field_ref: Some(ObjectFieldSelector {
                        field_path: "metadata.name".to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            },
            EnvVar {
                name: "RELAYMQ_POD_NAMESPACE".to_string(),
                value_from: Some(EnvVarSource {
                    field_ref: Some(ObjectFieldSelector {
                        field_path: "metadata.namespace".to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            },
            EnvVar {
                name: "RELAYMQ_NODENAME".to_string(),
                value: Some(format!(
                    "relay@$(RELAYMQ_POD_NAME).{}.$(RELAYMQ_POD_NAMESPACE)",
                    self.cluster.headless_service_name()
                )),
                ..Default::default()
            },
            EnvVar {
                name: "RELAYMQ_COOKIE_FILE".to_string(),
                value: Some("/etc/relaymq-node-auth/cookie".to_string()),
                ..Default::default()
            },
        ];

        let mut volume_mounts = vec![
            VolumeMount {
                name: PERSISTENCE_VOLUME.to_string(),
                mount_path: "/var/lib/relaymq".to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: "server-conf".to_string(),
                mount_path: "/etc/relaymq/conf.d".to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: "plugins-conf".to_string(),
                mount_path: "/etc/relaymq/plugins".to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: "node-auth".to_string(),
                mount_path: "/etc/relaymq-node-auth".to_string(),
                read_only: Some(true),
                ..Default::default()
            },
        ];
        if tls.enabled() {
            volume_mounts.push(VolumeMount {
                name: "tls".to_string(),
                mount_path: "/etc/relaymq-tls".to_string(),
                read_only: Some(true),
                ..Default::default()
            });
        }

        Container {
            name: SERVER_CONTAINER.to_string(),
            image: spec.image.clone(),
            image_pull_policy: Some(spec.image_pull_policy.clone()),
            env: Some(env),
            ports: Some(ports),
            resources: spec.resources.clone(),
            volume_mounts: Some(volume_mounts),
            ..Default::default()
        }
    }

    fn sidecar(&self) -> Option<Container> {
        let image = self.cluster.spec.sidecar_updater_image.clone()?;
        Some(Container {
            name: "credential-updater".to_string(),
            image: Some(image),
            args: Some(vec![
                "--secret-name".to_string(),
                self.cluster.default_user_secret_name(),
            ]),
            ..Default::default()
        })
    }

    fn volumes(&self) -> Vec<Volume> {
        let cluster = self.cluster;
        let mut volumes = vec![
            Volume {
                name: "server-conf".to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: cluster.server_conf_name(),
                    ..Default::default()
                }),
                ..Default::default()
            },
            Volume {
                name: "plugins-conf".to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: cluster.plugins_conf_name(),
                    ..Default::default()
                }),
                ..Default::default()
            },
            Volume {
                name: "node-auth".to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(cluster.node_auth_secret_name()),
                    ..Default::default()
                }),
                ..Default::default()
            },
        ];
        if cluster.spec.tls.enabled() {
            volumes.push(Volume {
                name: "tls".to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: cluster.spec.tls.secret_name.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }
        if is_ephemeral(cluster) {
            volumes.push(Volume {
                name: PERSISTENCE_VOLUME.to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            });
        }
        volumes
    }

    fn pod_template(&self) -> PodTemplateSpec {
        let cluster = self.cluster;
        let mut pod_labels = cluster.selector_labels();
        pod_labels.extend(cluster.spec.pod_labels.clone());

        let annotations = if cluster.spec.pod_annotations.is_empty() {
            None
        } else {
            Some(cluster.spec.pod_annotations.clone())
        };

        let mut containers = vec![self.container()];
        if let Some(sidecar) = self.sidecar() {
            containers.push(sidecar);
        }

        PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(pod_labels),
                annotations,
                ..Default::default()
            }),
            spec: Some(PodSpec {
                containers,
                service_account_name: Some(cluster.service_account_name()),
                image_pull_secrets: if cluster.spec.image_pull_secrets.is_empty() {
                    None
                } else {
                    Some(
                        cluster
                            .spec
                            .image_pull_secrets
                            .iter()
                            .map(|s| k8s_openapi::api::core::v1::LocalObjectReference {
                                name: s.clone(),
                            })
                            .collect(),
                    )
                },
                volumes: Some(self.volumes()),
                ..Default::default()
            }),
        }
    }

    fn volume_claim_templates(&self) -> Vec<PersistentVolumeClaim> {
        if is_ephemeral(self.cluster) {
            return Vec::new();
        }
        let storage = &self.cluster.spec.storage;
        let mut requests = BTreeMap::new();
        requests.insert("storage".to_string(), Quantity(storage.size.clone()));
        vec![PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(PERSISTENCE_VOLUME.to_string()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(storage.access_modes.clone()),
                storage_class_name: storage.storage_class_name.clone(),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(requests),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }]
    }
}

impl DependentBuilder for StatefulSetBuilder<'_> {
    type Resource = StatefulSet;

    fn resource_type(&self) -> &'static str {
        "StatefulSet"
    }

    fn build(&self) -> StatefulSet {
        StatefulSet {
            metadata: child_meta(self.cluster, self.cluster.server_name()),
            ..Default::default()
        }
    }

    fn update(&self, existing: &mut StatefulSet) -> Result<()> {
        // The restart stamp is owned by the signaling protocol, not the
        // builder; carry it across template rebuilds.
        let restart_stamp = existing
            .spec
            .as_ref()
            .map(|s| &s.template)
            .and_then(|t| t.metadata.as_ref())
            .and_then(|m| m.annotations.as_ref())
            .and_then(|a| a.get(annotations::LAST_RESTART_AT))
            .cloned();

        reassert_meta(self.cluster, &mut existing.metadata);

        let mut template = self.pod_template();
        if let Some(stamp) = restart_stamp {
            template
                .metadata
                .get_or_insert_with(Default::default)
                .annotations
                .get_or_insert_with(BTreeMap::new)
                .insert(annotations::LAST_RESTART_AT.to_string(), stamp);
        }

        let claim_templates = self.volume_claim_templates();
        let spec = existing.spec.get_or_insert_with(Default::default);
        spec.replicas = Some(self.replicas);
        spec.service_name = Some(self.cluster.headless_service_name());
        spec.selector = LabelSelector {
            match_labels: Some(self.cluster.selector_labels()),
            ..Default::default()
        };
        spec.pod_management_policy = Some("Parallel".to_string());
        spec.update_strategy = Some(StatefulSetUpdateStrategy {
            type_: Some("RollingUpdate".to_string()),
            rolling_update: Some(RollingUpdateStatefulSetStrategy {
                max_unavailable: Some(IntOrString::Int(1)),
                partition: Some(0),
            }),
        });
        spec.template = template;
        // Claim templates are immutable on a live StatefulSet; only stamp
        // them at first creation.
        if spec.volume_claim_templates.is_none() && !claim_templates.is_empty() {
            spec.volume_claim_templates = Some(claim_templates);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::RelayClusterSpec;

    fn cluster(name: &str) -> RelayCluster {
        RelayCluster {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                uid: Some("uid-123".to_string()),
                ..Default::default()
            },
            spec: RelayClusterSpec::test_default(),
            status: None,
        }
    }

    fn built<B: DependentBuilder>(builder: &B) -> B::Resource {
        let mut object = builder.build();
        builder.update(&mut object).unwrap();
        object
    }

    #[test]
    fn skeletons_carry_identity_and_owner_only() {
        let rc = cluster("broker");
        let skeleton = StatefulSetBuilder {
            cluster: &rc,
            replicas: 3,
        }
        .build();
        assert_eq!(skeleton.metadata.name.as_deref(), Some("broker-server"));
        assert!(skeleton.spec.is_none());

        let owners = skeleton.metadata.owner_references.unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].kind, "RelayCluster");
        assert_eq!(owners[0].name, "broker");
        assert_eq!(owners[0].controller, Some(true));
    }

    #[test]
    fn updates_are_idempotent() {
        let rc = cluster("broker");
        let builder = StatefulSetBuilder {
            cluster: &rc,
            replicas: 3,
        };
        let first = built(&builder);
        let mut second = first.clone();
        builder.update(&mut second).unwrap();
        assert_eq!(
            serde_json::to_value(&first).unwrap(),
            serde_json::to_value(&second).unwrap()
        );
    }

    #[test]
    fn statefulset_shape() {
        let rc = cluster("broker");
        let sts = built(&StatefulSetBuilder {
            cluster: &rc,
            replicas: 3,
        });
        let spec = sts.spec.unwrap();
        assert_eq!(spec.replicas, Some(3));
        assert_eq!(spec.service_name.as_deref(), Some("broker-nodes"));
        assert_eq!(spec.template.spec.as_ref().unwrap().containers[0].name, SERVER_CONTAINER);

        let claims = spec.volume_claim_templates.unwrap();
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].metadata.name.as_deref(), Some(PERSISTENCE_VOLUME));
    }

    #[test]
    fn ephemeral_storage_uses_empty_dir() {
        let mut rc = cluster("broker");
        rc.spec.storage.size = "0".to_string();
        let sts = built(&StatefulSetBuilder {
            cluster: &rc,
            replicas: 1,
        });
        let spec = sts.spec.unwrap();
        assert!(spec.volume_claim_templates.is_none());
        let volumes = spec.template.spec.unwrap().volumes.unwrap();
        assert!(volumes
            .iter()
            .any(|v| v.name == PERSISTENCE_VOLUME && v.empty_dir.is_some()));
    }

    #[test]
    fn update_preserves_restart_stamp() {
        let rc = cluster("broker");
        let builder = StatefulSetBuilder {
            cluster: &rc,
            replicas: 3,
        };
        let mut sts = built(&builder);
        sts.spec
            .as_mut()
            .unwrap()
            .template
            .metadata
            .as_mut()
            .unwrap()
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(
                annotations::LAST_RESTART_AT.to_string(),
                "2026-01-01T00:00:00Z".to_string(),
            );

        builder.update(&mut sts).unwrap();
        let stamp = sts
            .spec
            .unwrap()
            .template
            .metadata
            .unwrap()
            .annotations
            .unwrap()
            .get(annotations::LAST_RESTART_AT)
            .cloned();
        assert_eq!(stamp.as_deref(), Some("2026-01-01T00:00:00Z"));
    }

    #[test]
    fn update_does_not_replace_claim_templates() {
        let rc = cluster("broker");
        let builder = StatefulSetBuilder {
            cluster: &rc,
            replicas: 3,
        };
        let mut sts = built(&builder);
        let original = sts.spec.as_ref().unwrap().volume_claim_templates.clone();

        let mut grown = cluster("broker");
        grown.spec.storage.size = "50Gi".to_string();
        let grown_builder = StatefulSetBuilder {
            cluster: &grown,
            replicas: 3,
        };
        grown_builder.update(&mut sts).unwrap();
        assert_eq!(sts.spec.unwrap().volume_claim_templates, original);
    }

    #[test]
    fn tls_adds_listener_and_volume() {
        let mut rc = cluster("broker");
        rc.spec.tls.secret_name = Some("broker-tls".to_string());
        let sts = built(&StatefulSetBuilder {
            cluster: &rc,
            replicas: 1,
        });
        let pod = sts.spec.unwrap().template.spec.unwrap();
        assert!(pod.volumes.unwrap().iter().any(|v| v.name == "tls"));
        let ports = pod.containers[0].ports.as_ref().unwrap();
        assert!(ports.iter().any(|p| p.container_port == AMQP_TLS_PORT));

        let svc = built(&ClientServiceBuilder { cluster: &rc });
        let svc_ports = svc.spec.unwrap().ports.unwrap();
        assert!(svc_ports.iter().any(|p| p.name.as_deref() == Some("amqps")));
    }

    #[test]
    fn disabled_non_tls_listeners_drop_amqp_port() {
        let mut rc = cluster("broker");
        rc.spec.tls.secret_name = Some("broker-tls".to_string());
        rc.spec.tls.disable_non_tls_listeners = true;

        let svc = built(&ClientServiceBuilder { cluster: &rc });
        let ports = svc.spec.unwrap().ports.unwrap();
        assert!(!ports.iter().any(|p| p.name.as_deref() == Some("amqp")));

        let conf = render_server_conf(&rc);
        assert!(conf.contains("listeners.tcp = none"));
    }

    #[test]
    fn headless_service_shape() {
        let rc = cluster("broker");
        let svc = built(&HeadlessServiceBuilder { cluster: &rc });
        let spec = svc.spec.unwrap();
        assert_eq!(spec.cluster_ip.as_deref(), Some("None"));
        assert_eq!(spec.publish_not_ready_addresses, Some(true));
    }

    #[test]
    fn headless_update_keeps_assigned_cluster_ip() {
        let rc = cluster("broker");
        let builder = HeadlessServiceBuilder { cluster: &rc };
        let mut svc = built(&builder);
        // Simulate the api server having resolved the clusterIP.
        svc.spec.as_mut().unwrap().cluster_ip = Some("10.0.0.7".to_string());
        builder.update(&mut svc).unwrap();
        assert_eq!(svc.spec.unwrap().cluster_ip.as_deref(), Some("10.0.0.7"));
    }

    #[test]
    fn plugins_configmap_contents() {
        let mut rc = cluster("broker");
        rc.spec.plugins = vec!["relay_shovel".to_string(), "relay_management".to_string()];
        let cm = built(&PluginsConfigMapBuilder { cluster: &rc });
        let data = cm.data.unwrap();
        assert_eq!(
            data.get("enabled_plugins").unwrap(),
            "[relay_management,relay_peer_discovery_k8s,relay_shovel]."
        );
    }

    #[test]
    fn server_configmap_appends_basic_blob() {
        let mut rc = cluster("broker");
        rc.spec.config.basic = "vm_memory_high_watermark.relative = 0.8".to_string();
        let cm = built(&ServerConfigMapBuilder { cluster: &rc });
        let conf = cm.data.unwrap().get("relaymq.conf").cloned().unwrap();
        assert!(conf.contains("cluster_formation.k8s.service_name = broker-nodes"));
        assert!(conf.ends_with("vm_memory_high_watermark.relative = 0.8\n"));
        assert!(!cm_has_advanced(&rc));
    }

    fn cm_has_advanced(rc: &RelayCluster) -> bool {
        built(&ServerConfigMapBuilder { cluster: rc })
            .data
            .unwrap()
            .contains_key("advanced.config")
    }

    #[test]
    fn secrets_generate_once() {
        let rc = cluster("broker");
        let builder = DefaultUserSecretBuilder { cluster: &rc };
        let secret = built(&builder);
        let string_data = secret.string_data.clone().unwrap();
        let password = string_data.get("password").cloned().unwrap();
        assert_eq!(password.len(), 24);
        assert!(string_data
            .get("username")
            .unwrap()
            .starts_with("default_user_"));

        // A second update must not rotate the credentials.
        let mut again = secret.clone();
        builder.update(&mut again).unwrap();
        assert_eq!(
            again.string_data.unwrap().get("password").unwrap(),
            &password
        );
    }
}
