//! Kubernetes events emitted against a VerticaDB.

use async_trait::async_trait;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};
use tracing::warn;

use crate::crd::VerticaDB;

/// Reason codes attached to events.
pub mod reasons {
    pub const CLUSTER_SHUTDOWN_STARTED: &str = "ClusterShutdownStarted";
    pub const CLUSTER_SHUTDOWN_FAILED: &str = "ClusterShutdownFailed";
    pub const CLUSTER_SHUTDOWN_SUCCEEDED: &str = "ClusterShutdownSucceeded";
    pub const CLUSTER_RESTART_STARTED: &str = "ClusterRestartStarted";
    pub const CLUSTER_RESTART_FAILED: &str = "ClusterRestartFailed";
    pub const CLUSTER_RESTART_SUCCEEDED: &str = "ClusterRestartSucceeded";
    pub const NODE_RESTART_STARTED: &str = "NodeRestartStarted";
    pub const NODE_RESTART_FAILED: &str = "NodeRestartFailed";
    pub const NODE_RESTART_SUCCEEDED: &str = "NodeRestartSucceeded";
    pub const IMAGE_CHANGE_START: &str = "ImageChangeStart";
    pub const IMAGE_CHANGE_SUCCEEDED: &str = "ImageChangeSucceeded";
    pub const INVALID_UPGRADE_PATH: &str = "InvalidUpgradePath";
    pub const UNSUPPORTED_VERTICA_VERSION: &str = "UnsupportedVerticaVersion";
    pub const SUBCLUSTER_ADDED: &str = "SubclusterAdded";
    pub const SUBCLUSTER_REMOVED: &str = "SubclusterRemoved";
    pub const ADD_NODE_SUCCEEDED: &str = "AddNodeSucceeded";
    pub const INSTALL_SUCCEEDED: &str = "InstallSucceeded";
    pub const SUPERUSER_PASSWORD_SECRET_NOT_FOUND: &str = "SuperuserPasswordSecretNotFound";
}

/// Severity of an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Normal,
    Warning,
}

/// Sink for events about a VerticaDB.
///
/// Recording never fails the caller; a lost event is only logged.
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn record(&self, vdb: &VerticaDB, kind: EventKind, reason: &str, message: String);

    async fn normal(&self, vdb: &VerticaDB, reason: &str, message: String) {
        self.record(vdb, EventKind::Normal, reason, message).await;
    }

    async fn warning(&self, vdb: &VerticaDB, reason: &str, message: String) {
        self.record(vdb, EventKind::Warning, reason, message).await;
    }
}

/// [`EventRecorder`] publishing through the kube events API.
#[derive(Clone)]
pub struct KubeEventRecorder {
    client: Client,
    reporter: Reporter,
}

impl KubeEventRecorder {
    pub fn new(client: Client, reporter: Reporter) -> Self {
        Self { client, reporter }
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn record(&self, vdb: &VerticaDB, kind: EventKind, reason: &str, message: String) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone());
        let type_ = match kind {
            EventKind::Normal => EventType::Normal,
            EventKind::Warning => EventType::Warning,
        };
        if let Err(e) = recorder
            .publish(
                &Event {
                    type_,
                    reason: reason.into(),
                    note: Some(message),
                    action: reason.into(),
                    secondary: None,
                },
                &vdb.object_ref(&()),
            )
            .await
        {
            warn!(reason = %reason, error = %e, "Failed to publish event");
        }
    }
}
