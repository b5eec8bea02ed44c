//! Annotation-based signaling between reconciliation passes.
//!
//! Config-change detection, member restarts, plugin activation, and queue
//! rebalancing are decoupled across passes: whichever pass detects a change
//! stamps a timestamp-valued annotation, and whichever pass completes the
//! corresponding action clears it. Absence means "no action pending". The
//! key strings are a wire contract — external tooling reads and writes them
//! directly.

use chrono::{DateTime, Duration, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::json;

/// Plugin list changed; plugin activation must run against every member
pub const PLUGINS_CHANGED_AT: &str = "relaymq.io/pluginsChangedAt";

/// Server configuration changed; members need a rolling restart
pub const SERVER_CONF_CHANGED_AT: &str = "relaymq.io/serverConfChangedAt";

/// Pod-template annotation the rollout mechanism keys on; stamping a new
/// value rolls the members
pub const LAST_RESTART_AT: &str = "relaymq.io/lastRestartAt";

/// StatefulSet was just created; one-time post-creation setup pending
pub const CREATED_AT: &str = "relaymq.io/createdAt";

/// Pod template changed on a multi-member cluster; queues need rebalancing
pub const QUEUE_REBALANCE_NEEDED_AT: &str = "relaymq.io/queueRebalanceNeededAt";

/// Replica count saved before scaling to zero; the only permitted
/// scale-from-zero target
pub const BEFORE_ZERO_REPLICAS: &str = "relaymq.io/beforeZeroReplicas";

/// Label that pauses all reconciliation of a cluster when set to "true"
pub const PAUSE_RECONCILIATION_LABEL: &str = "relaymq.io/pauseReconciliation";

/// Pod label read by the member's graceful-shutdown hook during deletion
pub const MARKED_FOR_DELETION_LABEL: &str = "relaymq.io/markedForDeletion";

/// Finalizer gating RelayCluster deletion
pub const CLUSTER_FINALIZER: &str = "relaymq.io/cluster-finalizer";

/// Grace window after a plugin-config mutation before commands may run
/// against members, to avoid racing an in-flight pod replacement.
pub const PLUGIN_EXEC_GRACE_SECONDS: i64 = 5;

/// Current timestamp in the RFC 3339 format used for every annotation value
pub fn timestamp_now() -> String {
    Utc::now().to_rfc3339()
}

/// Read an annotation value from object metadata
pub fn read<'a>(meta: &'a ObjectMeta, key: &str) -> Option<&'a str> {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

/// Merge patch that stamps a metadata annotation
pub fn stamp_patch(key: &str, value: &str) -> serde_json::Value {
    json!({ "metadata": { "annotations": { key: value } } })
}

/// Merge patch that clears a metadata annotation
pub fn clear_patch(key: &str) -> serde_json::Value {
    json!({ "metadata": { "annotations": { key: serde_json::Value::Null } } })
}

/// Merge patch that stamps an annotation on a StatefulSet's pod template.
/// The platform's rollout mechanism treats the template change as "roll pods".
pub fn stamp_template_patch(key: &str, value: &str) -> serde_json::Value {
    json!({ "spec": { "template": { "metadata": { "annotations": { key: value } } } } })
}

/// Whether a config change is newer than the last recorded member restart.
///
/// A missing or unparseable restart stamp counts as "never restarted for this
/// config"; an unparseable change stamp is treated as pending so a corrupted
/// value can never suppress a restart forever.
pub fn needs_restart(conf_changed_at: Option<&str>, last_restart_at: Option<&str>) -> bool {
    let changed = match conf_changed_at {
        None => return false,
        Some(raw) => match DateTime::parse_from_rfc3339(raw) {
            Ok(t) => t,
            Err(_) => return true,
        },
    };
    match last_restart_at.and_then(|raw| DateTime::parse_from_rfc3339(raw).ok()) {
        Some(restarted) => changed > restarted,
        None => true,
    }
}

/// Whether the plugin grace window has elapsed since `changed_at`.
///
/// An unparseable stamp elapses immediately rather than blocking activation.
pub fn grace_elapsed(changed_at: &str, now: DateTime<Utc>) -> bool {
    match DateTime::parse_from_rfc3339(changed_at) {
        Ok(t) => now.signed_duration_since(t) >= Duration::seconds(PLUGIN_EXEC_GRACE_SECONDS),
        Err(_) => true,
    }
}
