//! Kubernetes Event recording for the RelayMQ operator.
//!
//! Events are fire-and-forget: failures are logged as warnings and never
//! propagate errors. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
///
/// Implementations are expected to be fire-and-forget: `publish()` logs a
/// warning on failure but never returns an error.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher; the controller name appears as the
    /// reportingComponent on Events.
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// No-op implementation for tests.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Well-known event reason strings.
///
/// These appear in `kubectl get events` under the REASON column; the
/// `ReconcileSuccess` condition reuses them as its reason field.
pub mod reasons {
    /// Reconciliation pass converged
    pub const SUCCESS: &str = "Success";
    /// Reconciliation is paused via the pause label
    pub const PAUSED: &str = "Paused";
    /// Dependent resources are still converging or rolling out
    pub const IN_PROGRESS: &str = "InProgress";
    /// Disallowed scale or storage transition was rejected
    pub const UNSUPPORTED_OPERATION: &str = "UnsupportedOperation";
    /// TLS secret missing or malformed
    pub const TLS_ERROR: &str = "TLSError";
    /// A command run inside a member failed
    pub const COMMAND_FAILED: &str = "CommandFailed";
    /// Reconciliation pass failed with an error
    pub const RECONCILE_FAILED: &str = "ReconcileFailed";
    /// Cluster deletion cleanup started
    pub const DELETION_STARTED: &str = "DeletionStarted";
}

/// Well-known event action strings.
pub mod actions {
    pub const RECONCILE: &str = "Reconcile";
    pub const SCALE: &str = "Scale";
    pub const DELETE: &str = "Delete";
    pub const EXEC: &str = "Exec";
}

/// Recording publisher for assertions in tests.
#[cfg(test)]
pub struct RecordingEventPublisher {
    pub events: std::sync::Mutex<Vec<(String, String, Option<String>)>>,
}

#[cfg(test)]
impl RecordingEventPublisher {
    pub fn new() -> Self {
        Self {
            events: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(r, _, _)| r.clone())
            .collect()
    }
}

#[cfg(test)]
#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        self.events
            .lock()
            .unwrap()
            .push((reason.to_string(), action.to_string(), note));
    }
}
