//! Offline image change.
//!
//! The whole cluster is stopped, every StatefulSet is moved to the new image,
//! the old pods are deleted and the cluster is started again. Each step
//! checks whether a previous pass already did its work, so a pass that is
//! interrupted at any point resumes where it left off.

use tokio::time::Instant;
use tracing::info;

use super::error::{Error, Result};
use super::events::reasons;
use super::finder::{FindFlags, SubclusterFinder};
use super::image_change::{ImageChangeManager, RoleFilter};
use super::pipeline::{ClusterScope, StepResult};
use super::pod_facts::server_image;
use super::restart::RestartReconciler;
use crate::client::command;

pub const MSG_SHUTDOWN: &str = "Starting cluster shutdown";
pub const MSG_RESCHEDULE: &str = "Rescheduling pods with new image name";
pub const MSG_RESTART: &str = "Restarting cluster";

// ============================================================================
// Steps
// ============================================================================

/// Steps of an offline image change, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfflineStep {
    Start,
    CollectFacts,
    PostShutdownMsg,
    StopCluster,
    PostRescheduleMsg,
    UpdateStatefulSets,
    DeletePods,
    CheckForNewPods,
    PostRestartMsg,
    RestartCluster,
    Finish,
}

impl std::fmt::Display for OfflineStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OfflineStep::Start => write!(f, "Start"),
            OfflineStep::CollectFacts => write!(f, "CollectFacts"),
            OfflineStep::PostShutdownMsg => write!(f, "PostShutdownMsg"),
            OfflineStep::StopCluster => write!(f, "StopCluster"),
            OfflineStep::PostRescheduleMsg => write!(f, "PostRescheduleMsg"),
            OfflineStep::UpdateStatefulSets => write!(f, "UpdateStatefulSets"),
            OfflineStep::DeletePods => write!(f, "DeletePods"),
            OfflineStep::CheckForNewPods => write!(f, "CheckForNewPods"),
            OfflineStep::PostRestartMsg => write!(f, "PostRestartMsg"),
            OfflineStep::RestartCluster => write!(f, "RestartCluster"),
            OfflineStep::Finish => write!(f, "Finish"),
        }
    }
}

const STEPS: &[OfflineStep] = &[
    OfflineStep::Start,
    OfflineStep::CollectFacts,
    OfflineStep::PostShutdownMsg,
    OfflineStep::StopCluster,
    OfflineStep::PostRescheduleMsg,
    OfflineStep::UpdateStatefulSets,
    OfflineStep::DeletePods,
    OfflineStep::CheckForNewPods,
    OfflineStep::PostRestartMsg,
    OfflineStep::RestartCluster,
    OfflineStep::Finish,
];

// ============================================================================
// Reconciler
// ============================================================================

/// Drives an offline image change.
#[derive(Debug)]
pub struct OfflineImageChangeReconciler {
    manager: ImageChangeManager,
}

impl Default for OfflineImageChangeReconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl OfflineImageChangeReconciler {
    pub fn new() -> Self {
        Self {
            manager: ImageChangeManager::offline(),
        }
    }

    pub async fn reconcile(&mut self, scope: &mut ClusterScope) -> Result<StepResult> {
        if !self.manager.is_image_change_needed(scope).await? {
            return Ok(StepResult::Done);
        }

        for step in STEPS {
            let result = self.run_step(*step, scope).await?;
            if result != StepResult::Continue {
                info!(step = %step, result = ?result, "Offline image change stopped");
                return Ok(result);
            }
        }
        Ok(StepResult::Done)
    }

    async fn run_step(&mut self, step: OfflineStep, scope: &mut ClusterScope) -> Result<StepResult> {
        match step {
            OfflineStep::Start => {
                self.manager.start_image_change(scope).await?;
                Ok(StepResult::Continue)
            }
            OfflineStep::CollectFacts => {
                scope.collect_facts().await?;
                Ok(StepResult::Continue)
            }
            OfflineStep::PostShutdownMsg => self.post(scope, MSG_SHUTDOWN).await,
            OfflineStep::StopCluster => self.stop_cluster(scope).await,
            OfflineStep::PostRescheduleMsg => self.post(scope, MSG_RESCHEDULE).await,
            OfflineStep::UpdateStatefulSets => {
                if self
                    .manager
                    .update_image_in_statefulsets(scope, RoleFilter::All)
                    .await?
                    > 0
                {
                    scope.invalidate_facts();
                }
                Ok(StepResult::Continue)
            }
            OfflineStep::DeletePods => {
                if self
                    .manager
                    .delete_pods_running_old_image(scope, None, RoleFilter::All)
                    .await?
                    > 0
                {
                    scope.invalidate_facts();
                }
                Ok(StepResult::Continue)
            }
            OfflineStep::CheckForNewPods => self.check_for_new_pods(scope).await,
            OfflineStep::PostRestartMsg => self.post(scope, MSG_RESTART).await,
            OfflineStep::RestartCluster => {
                // Restart here so vertica comes up while the condition is set.
                let result = RestartReconciler::new().reconcile(scope).await?;
                if result.is_requeue() {
                    return Ok(result);
                }
                Ok(StepResult::Continue)
            }
            OfflineStep::Finish => {
                self.manager.finish_image_change(scope).await?;
                Ok(StepResult::Done)
            }
        }
    }

    async fn post(&self, scope: &mut ClusterScope, msg: &str) -> Result<StepResult> {
        self.manager.set_image_change_status(scope, msg).await?;
        Ok(StepResult::Continue)
    }

    /// Stop the cluster with `admintools -t stop_db`.
    ///
    /// Skipped when vertica is not running anywhere, or when every up node
    /// already runs the new image because a prior pass restarted it.
    async fn stop_cluster(&self, scope: &mut ClusterScope) -> Result<StepResult> {
        let Some(pod) = scope.facts.find_running_pod().map(|p| p.name.clone()) else {
            info!("No pods running so skipping vertica shutdown");
            return Ok(StepResult::Continue);
        };
        if scope.facts.up_node_count() == 0 {
            info!("No vertica process running so nothing to shutdown");
            return Ok(StepResult::Continue);
        }
        if !self.any_up_pods_with_old_image(scope).await? {
            info!("No vertica process running with the old image version");
            return Ok(StepResult::Continue);
        }

        scope
            .events
            .normal(
                &scope.vdb,
                reasons::CLUSTER_SHUTDOWN_STARTED,
                "Calling 'admintools -t stop_db'".to_string(),
            )
            .await;
        scope.record_admin_command("stop_db");
        let start = Instant::now();
        let cmd = command(&["-t", "stop_db", "-F", "-d", &scope.vdb.spec.db_name]);
        if let Err(e) = scope.runner.exec_admintools(&pod, &cmd).await {
            scope
                .events
                .warning(
                    &scope.vdb,
                    reasons::CLUSTER_SHUTDOWN_FAILED,
                    "Failed to shutdown the cluster".to_string(),
                )
                .await;
            return Err(Error::Exec(e));
        }
        scope
            .events
            .normal(
                &scope.vdb,
                reasons::CLUSTER_SHUTDOWN_SUCCEEDED,
                format!(
                    "Successfully called 'admintools -t stop_db' and it took {:?}",
                    start.elapsed()
                ),
            )
            .await;
        scope.invalidate_facts();
        Ok(StepResult::Continue)
    }

    async fn any_up_pods_with_old_image(&self, scope: &ClusterScope) -> Result<bool> {
        for pf in scope.facts.iter().filter(|p| p.up_node) {
            let Some(pod) = scope.api.get_pod(&pf.name).await? else {
                continue;
            };
            if server_image(&pod) != scope.vdb.spec.image {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Requeue until the platform has created a pod with the new image.
    async fn check_for_new_pods(&self, scope: &ClusterScope) -> Result<StepResult> {
        let finder = SubclusterFinder::new(scope.api.as_ref(), &scope.vdb);
        let found = finder
            .find_pods(FindFlags::EXISTING)
            .await?
            .iter()
            .any(|p| server_image(p) == scope.vdb.spec.image);
        if !found {
            info!("Requeue to wait until at least one pod exists with the new image");
            return Ok(StepResult::Requeue);
        }
        Ok(StepResult::Continue)
    }
}
