//! Shared context for the controller.
//!
//! The Context struct holds state shared by every reconciliation: the
//! Kubernetes client, the event reporter identity, health state, and the
//! per-object retry counters behind the requeue backoff.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kube::Client;
use kube::runtime::events::Reporter;

use super::error::backoff_for_attempt;
use super::events::{EventRecorder, KubeEventRecorder};
use crate::health::HealthState;

/// Field manager name for the operator
pub const FIELD_MANAGER: &str = "verticadb-operator";

/// Shared context for the controller
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Event reporter identity
    reporter: Reporter,
    /// Optional health state for metrics and readiness
    pub health_state: Option<Arc<HealthState>>,
    /// Consecutive requeues per `namespace/name`
    retries: Arc<Mutex<HashMap<String, u32>>>,
}

impl Context {
    /// Create a new context
    pub fn new(client: Client, instance: Option<String>, health_state: Option<Arc<HealthState>>) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: FIELD_MANAGER.into(),
                instance,
            },
            health_state,
            retries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Event recorder publishing as this operator instance
    pub fn event_recorder(&self) -> Arc<dyn EventRecorder> {
        Arc::new(KubeEventRecorder::new(self.client.clone(), self.reporter.clone()))
    }

    /// Delay for the next requeue of `key`, growing with each consecutive call.
    pub fn next_backoff(&self, key: &str) -> Duration {
        let mut retries = self.retries.lock().unwrap_or_else(|e| e.into_inner());
        let attempt = retries.entry(key.to_string()).or_insert(0);
        let delay = backoff_for_attempt(*attempt);
        *attempt = attempt.saturating_add(1);
        delay
    }

    /// Number of consecutive requeues recorded for `key`.
    pub fn retry_count(&self, key: &str) -> u32 {
        let retries = self.retries.lock().unwrap_or_else(|e| e.into_inner());
        retries.get(key).copied().unwrap_or(0)
    }

    /// Forget the backoff of `key` after a pass that completed.
    pub fn reset_backoff(&self, key: &str) {
        let mut retries = self.retries.lock().unwrap_or_else(|e| e.into_inner());
        retries.remove(key);
    }
}
