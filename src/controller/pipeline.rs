//! Building blocks shared by every reconciler in a pass.
//!
//! A reconciliation pass runs an ordered list of actors against one
//! [`ClusterScope`]. Each actor is itself an ordered list of steps. A step
//! either lets the list continue or stops it with a [`StepResult`]; errors
//! abort the pass through `?`.

use std::sync::Arc;
use std::time::Duration;

use kube::ResourceExt;

use super::error::Result;
use super::events::EventRecorder;
use super::pod_facts::PodFacts;
use crate::client::{ClusterApi, PodRunner};
use crate::crd::VerticaDB;
use crate::health::HealthState;

/// Outcome of a step or of a whole reconciler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepResult {
    /// The step is satisfied; run the next one.
    Continue,
    /// Nothing left to do for this reconciler.
    Done,
    /// Stop the pass and try again later.
    Requeue,
    /// Stop the pass and try again after the delay.
    RequeueAfter(Duration),
}

impl StepResult {
    /// True for the results that abort the pass.
    pub fn is_requeue(self) -> bool {
        matches!(self, StepResult::Requeue | StepResult::RequeueAfter(_))
    }

    /// Collapse `Continue` into `Done` for callers outside the step list.
    pub fn settle(self) -> StepResult {
        match self {
            StepResult::Continue => StepResult::Done,
            other => other,
        }
    }
}

/// Everything one reconciliation pass works with.
///
/// The fact cache is shared by all actors of the pass. Steps read it freely
/// but only ever invalidate it after changing pods or subclusters.
pub struct ClusterScope {
    pub api: Arc<dyn ClusterApi>,
    pub runner: Arc<dyn PodRunner>,
    pub events: Arc<dyn EventRecorder>,
    pub vdb: VerticaDB,
    pub facts: PodFacts,
    pub health: Option<Arc<HealthState>>,
}

impl ClusterScope {
    pub fn new(
        api: Arc<dyn ClusterApi>,
        runner: Arc<dyn PodRunner>,
        events: Arc<dyn EventRecorder>,
        vdb: VerticaDB,
    ) -> Self {
        Self {
            api,
            runner,
            events,
            vdb,
            facts: PodFacts::new(),
            health: None,
        }
    }

    pub fn with_health(mut self, health: Option<Arc<HealthState>>) -> Self {
        self.health = health;
        self
    }

    pub fn name(&self) -> String {
        self.vdb.name_any()
    }

    pub fn namespace(&self) -> String {
        self.vdb.namespace().unwrap_or_default()
    }

    /// Refresh the fact cache if it was invalidated.
    pub async fn collect_facts(&mut self) -> Result<()> {
        self.facts
            .collect(self.api.as_ref(), self.runner.as_ref(), &self.vdb)
            .await
    }

    pub fn invalidate_facts(&mut self) {
        self.facts.invalidate();
    }

    /// Count an admintools lifecycle command in the metrics.
    pub fn record_admin_command(&self, kind: &str) {
        if let Some(health) = &self.health {
            health.metrics.record_admin_command(kind);
        }
    }

    /// Count an image change transition in the metrics.
    pub fn record_image_change(&self, policy: &str, phase: &str) {
        if let Some(health) = &self.health {
            health.metrics.record_image_change(policy, phase);
        }
    }
}
