//! # RelayMQ Kubernetes Operator
//!
//! Kubernetes operator for deploying and managing RelayMQ messaging
//! clusters declaratively through the `RelayCluster` custom resource.
//!
//! ## Features
//!
//! - **Custom Resource Definition**: `RelayCluster` CRD with validation
//! - **Automated Reconciliation**: continuous convergence of Services,
//!   Secrets, ConfigMaps, ServiceAccount, and the server StatefulSet
//! - **Scaling Guard**: rejects scale-down and storage-shrink transitions
//!   that would lose messages, with a snapshot-based scale-to-zero path
//! - **Config-Change Signaling**: timestamp annotations decouple change
//!   detection from rolling restarts, plugin activation, and queue
//!   rebalancing across reconciliation passes
//! - **Post-Deploy Sequencing**: `relayctl` commands run inside members
//!   once a rollout fully completes
//! - **Finalizer-Gated Deletion**: member pods are marked before the
//!   StatefulSet is deleted so shutdown hooks skip availability safeguards
//! - **Observability**: structured tracing plus Prometheus-compatible
//!   operator metrics
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use relaymq_operator::prelude::*;
//! use kube::Client;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = Client::try_default().await?;
//!     let events = Arc::new(KubeEventPublisher::new(client.clone(), "relaymq-operator"));
//!     let executor = Arc::new(KubePodExecutor::new(client.clone()));
//!     run_controller(client, None, OperatorConfig::default(), events, executor).await
//! }
//! ```
//!
//! ## Architecture
//!
//! The operator follows the standard Kubernetes controller pattern:
//!
//! 1. **Watch**: RelayCluster objects plus owned StatefulSets, Services,
//!    and ConfigMaps
//! 2. **Reconcile**: one full pass per change — defaults, TLS validation,
//!    scaling guard, dependent resources, signaling, sequencer
//! 3. **Status**: condition tracking with `observedGeneration` advancing
//!    only after a fully successful pass
//!
//! ## Modules
//!
//! - [`crd`] - RelayCluster custom resource types with validation
//! - [`controller`] - reconciliation driver and controller setup
//! - [`resources`] - dependent-resource builders with CreateOrUpdate
//! - [`scaling`] - the scaling guard
//! - [`tls`] - TLS secret validation
//! - [`annotations`] - signaling annotation keys and helpers
//! - [`sequencer`] - post-deploy command sequencing
//! - [`deletion`] - finalizer-gated deletion protocol

pub mod annotations;
pub mod controller;
pub mod crd;
pub mod deletion;
pub mod error;
pub mod events;
pub mod exec;
pub mod resources;
pub mod retry;
pub mod scaling;
pub mod sequencer;
pub mod status;
pub mod tls;

pub mod prelude {
    //! Re-exports for convenient usage
    pub use crate::controller::{
        run_controller, ControllerContext, ControllerMetrics, OperatorConfig,
    };
    pub use crate::crd::{
        ClusterCondition, ConfigSpec, RelayCluster, RelayClusterSpec, RelayClusterStatus,
        ServiceConfigSpec, StorageSpec, TlsSpec,
    };
    pub use crate::error::{OperatorError, Result};
    pub use crate::events::{EventPublisher, KubeEventPublisher, NoopEventPublisher};
    pub use crate::exec::{ExecOutput, KubePodExecutor, PodExecutor};
    pub use crate::resources::{apply, Applied, DependentBuilder};
    pub use crate::scaling::{check_replicas, check_storage, ScaleDecision};
    pub use crate::sequencer::{SequencerOutcome, Step};
}
