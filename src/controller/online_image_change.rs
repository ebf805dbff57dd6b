//! Online image change.
//!
//! Subclusters are moved to the new image one group at a time while the
//! database stays up. A transient secondary subcluster on the old image
//! takes client traffic while a subcluster is down. Primaries go down and
//! come back together since they form the quorum; secondaries go one at a
//! time.
//!
//! Status messages are computed once per pass from the subclusters that
//! exist, so a resumed pass posts the same phase index it left off at.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::StatefulSet;
use kube::ResourceExt;
use tracing::info;

use super::error::{Error, Result};
use super::finder::{FindFlags, SubclusterFinder};
use super::image_change::{
    ImageChangeManager, RoleFilter, statefulset_image, update_statefulset_image,
};
use super::names::{
    SUBCLUSTER_NAME_LABEL, SUBCLUSTER_TRANSIENT_LABEL, SUBCLUSTER_TYPE_LABEL,
    external_service_name, selector_for_service_name_routing, selector_for_subcluster_name_routing,
};
use super::pipeline::{ClusterScope, StepResult};
use super::restart::RestartReconciler;
use super::status::update_image_change_progress;
use super::transient::TransientSubcluster;
use super::version::VersionReconciler;
use crate::client::command;
use crate::client::parsing::has_active_sessions;
use crate::crd::{PRIMARY_SUBCLUSTER_TYPE, SECONDARY_SUBCLUSTER_TYPE, VerticaDB};

// ============================================================================
// Steps
// ============================================================================

/// Top level steps of an online image change, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnlineStep {
    Start,
    LoadSubclusterState,
    PrecomputeStatusMsgs,
    PostTransientMsg,
    CreateTransientStatefulSet,
    InstallTransientNodes,
    AddTransientSubcluster,
    AddTransientNodes,
    WaitForReadyTransientPod,
    RestartPrimaries,
    RestartSecondaries,
    PostTeardownMsg,
    RemoveTransientSubcluster,
    UninstallTransientNodes,
    DeleteTransientStatefulSet,
    Finish,
}

impl std::fmt::Display for OnlineStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OnlineStep::Start => write!(f, "Start"),
            OnlineStep::LoadSubclusterState => write!(f, "LoadSubclusterState"),
            OnlineStep::PrecomputeStatusMsgs => write!(f, "PrecomputeStatusMsgs"),
            OnlineStep::PostTransientMsg => write!(f, "PostTransientMsg"),
            OnlineStep::CreateTransientStatefulSet => write!(f, "CreateTransientStatefulSet"),
            OnlineStep::InstallTransientNodes => write!(f, "InstallTransientNodes"),
            OnlineStep::AddTransientSubcluster => write!(f, "AddTransientSubcluster"),
            OnlineStep::AddTransientNodes => write!(f, "AddTransientNodes"),
            OnlineStep::WaitForReadyTransientPod => write!(f, "WaitForReadyTransientPod"),
            OnlineStep::RestartPrimaries => write!(f, "RestartPrimaries"),
            OnlineStep::RestartSecondaries => write!(f, "RestartSecondaries"),
            OnlineStep::PostTeardownMsg => write!(f, "PostTeardownMsg"),
            OnlineStep::RemoveTransientSubcluster => write!(f, "RemoveTransientSubcluster"),
            OnlineStep::UninstallTransientNodes => write!(f, "UninstallTransientNodes"),
            OnlineStep::DeleteTransientStatefulSet => write!(f, "DeleteTransientStatefulSet"),
            OnlineStep::Finish => write!(f, "Finish"),
        }
    }
}

const STEPS: &[OnlineStep] = &[
    OnlineStep::Start,
    OnlineStep::LoadSubclusterState,
    OnlineStep::PrecomputeStatusMsgs,
    OnlineStep::PostTransientMsg,
    OnlineStep::CreateTransientStatefulSet,
    OnlineStep::InstallTransientNodes,
    OnlineStep::AddTransientSubcluster,
    OnlineStep::AddTransientNodes,
    OnlineStep::WaitForReadyTransientPod,
    OnlineStep::RestartPrimaries,
    OnlineStep::RestartSecondaries,
    OnlineStep::PostTeardownMsg,
    OnlineStep::RemoveTransientSubcluster,
    OnlineStep::UninstallTransientNodes,
    OnlineStep::DeleteTransientStatefulSet,
    OnlineStep::Finish,
];

/// Steps applied to a single subcluster's StatefulSet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubclusterStep {
    Drain,
    Recreate,
    CheckVersion,
    BringOnline,
}

impl std::fmt::Display for SubclusterStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubclusterStep::Drain => write!(f, "Drain"),
            SubclusterStep::Recreate => write!(f, "Recreate"),
            SubclusterStep::CheckVersion => write!(f, "CheckVersion"),
            SubclusterStep::BringOnline => write!(f, "BringOnline"),
        }
    }
}

/// Primaries run every sub-step as one batch before moving to the next.
const PRIMARY_STEPS: &[SubclusterStep] = &[
    SubclusterStep::Drain,
    SubclusterStep::Recreate,
    SubclusterStep::CheckVersion,
    SubclusterStep::BringOnline,
];

/// Secondaries run these in turn, one subcluster at a time.
///
/// There is no version check here. The primaries already ran the new image
/// through it, and a refused upgrade path stops the change before any
/// secondary is touched.
const SECONDARY_STEPS: &[SubclusterStep] = &[
    SubclusterStep::Drain,
    SubclusterStep::Recreate,
    SubclusterStep::BringOnline,
];

// ============================================================================
// Status messages
// ============================================================================

/// Phase messages for an image change over the given secondaries.
pub fn status_messages(secondaries: &[String]) -> Vec<String> {
    let mut msgs = vec![
        "Creating transient secondary subcluster".to_string(),
        "Draining primary subclusters".to_string(),
        "Recreating pods for primary subclusters".to_string(),
        "Checking if new version is compatible".to_string(),
        "Restarting vertica in primary subclusters".to_string(),
    ];
    for sc in secondaries {
        msgs.push(format!("Draining secondary subcluster '{sc}'"));
        msgs.push(format!("Recreating pods for secondary subcluster '{sc}'"));
        msgs.push(format!("Restarting vertica in secondary subcluster '{sc}'"));
    }
    msgs.push("Destroying transient secondary subcluster".to_string());
    msgs
}

/// Query counting client sessions in a subcluster, excluding our own.
pub fn active_sessions_query(sc_name: &str) -> String {
    format!(
        "select count(session_id) sessions \
         from v_monitor.sessions join v_catalog.subclusters using (node_name) \
         where session_id not in (select session_id from current_session)       \
         and subcluster_name = '{sc_name}';"
    )
}

/// Selector a drained subcluster's service should use.
///
/// The first routing name that is a subcluster of the VerticaDB is used,
/// skipping past the subcluster being drained unless nothing else matches.
/// `None` means no named subcluster fits and the transient should be used.
pub fn temporary_routing_selector(
    vdb: &VerticaDB,
    sc_name: &str,
) -> Option<BTreeMap<String, String>> {
    let subclusters = vdb.subcluster_map();
    let mut selector = None;
    for route in &vdb.spec.temporary_subcluster_routing.names {
        let Some(routing_sc) = subclusters.get(route.as_str()) else {
            info!(name = %route, "Temporary routing subcluster not found, skipping");
            continue;
        };
        selector = Some(selector_for_subcluster_name_routing(vdb, routing_sc));
        if route != sc_name {
            break;
        }
    }
    selector
}

fn is_matching_type(sts: &StatefulSet, sc_type: &str) -> bool {
    let labels = sts.labels();
    labels.get(SUBCLUSTER_TYPE_LABEL).map(String::as_str) == Some(sc_type)
        && labels.get(SUBCLUSTER_TRANSIENT_LABEL).map(String::as_str) != Some("true")
}

fn subcluster_name(sts: &StatefulSet) -> String {
    sts.labels()
        .get(SUBCLUSTER_NAME_LABEL)
        .cloned()
        .unwrap_or_default()
}

// ============================================================================
// Reconciler
// ============================================================================

/// Drives an online image change.
#[derive(Debug)]
pub struct OnlineImageChangeReconciler {
    manager: ImageChangeManager,
    /// Distinct images found in the primary StatefulSets.
    primary_images: Vec<String>,
    status_msgs: Vec<String>,
    next_msg: usize,
}

impl Default for OnlineImageChangeReconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl OnlineImageChangeReconciler {
    pub fn new() -> Self {
        Self {
            manager: ImageChangeManager::online(),
            primary_images: Vec::new(),
            status_msgs: Vec::new(),
            next_msg: 0,
        }
    }

    pub async fn reconcile(&mut self, scope: &mut ClusterScope) -> Result<StepResult> {
        if !self.manager.is_image_change_needed(scope).await? {
            return Ok(StepResult::Done);
        }

        let transient = TransientSubcluster::new(&scope.vdb);
        for step in STEPS {
            let result = self.run_step(*step, scope, &transient).await?;
            if result != StepResult::Continue {
                info!(step = %step, result = ?result, "Online image change stopped");
                return Ok(result);
            }
        }
        Ok(StepResult::Done)
    }

    async fn run_step(
        &mut self,
        step: OnlineStep,
        scope: &mut ClusterScope,
        transient: &TransientSubcluster,
    ) -> Result<StepResult> {
        match step {
            OnlineStep::Start => {
                self.manager.start_image_change(scope).await?;
                Ok(StepResult::Continue)
            }
            OnlineStep::LoadSubclusterState => {
                scope.collect_facts().await?;
                self.cache_primary_images(scope).await?;
                Ok(StepResult::Continue)
            }
            OnlineStep::PrecomputeStatusMsgs => {
                let secondaries: Vec<String> = self
                    .statefulsets_of_type(scope, SECONDARY_SUBCLUSTER_TYPE)
                    .await?
                    .iter()
                    .map(subcluster_name)
                    .collect();
                self.status_msgs = status_messages(&secondaries);
                self.next_msg = 0;
                Ok(StepResult::Continue)
            }
            OnlineStep::PostTransientMsg | OnlineStep::PostTeardownMsg => {
                self.post_next_status_msg(scope).await
            }
            OnlineStep::CreateTransientStatefulSet => {
                if self.skip_transient_setup(scope) {
                    return Ok(StepResult::Continue);
                }
                let Some(old_image) = self.fetch_old_image(&scope.vdb) else {
                    return Err(Error::Validation(format!(
                        "could not determine the old image name. Only available image is {}",
                        scope.vdb.spec.image
                    )));
                };
                transient.create_statefulset(scope, &old_image).await
            }
            OnlineStep::InstallTransientNodes => {
                if self.skip_transient_setup(scope) {
                    return Ok(StepResult::Continue);
                }
                transient.install(scope).await
            }
            OnlineStep::AddTransientSubcluster => {
                if self.skip_transient_setup(scope) {
                    return Ok(StepResult::Continue);
                }
                transient.add_subcluster(scope).await
            }
            OnlineStep::AddTransientNodes => {
                if self.skip_transient_setup(scope) {
                    return Ok(StepResult::Continue);
                }
                transient.add_nodes(scope).await
            }
            OnlineStep::WaitForReadyTransientPod => {
                if self.skip_transient_setup(scope) {
                    return Ok(StepResult::Continue);
                }
                transient.wait_for_ready_pod(scope).await
            }
            OnlineStep::RestartPrimaries => self.restart_primaries(scope, transient).await,
            OnlineStep::RestartSecondaries => self.restart_secondaries(scope, transient).await,
            OnlineStep::RemoveTransientSubcluster => {
                if !scope.vdb.requires_transient_subcluster() {
                    return Ok(StepResult::Continue);
                }
                transient.remove_subcluster(scope).await
            }
            OnlineStep::UninstallTransientNodes => {
                if !scope.vdb.requires_transient_subcluster() {
                    return Ok(StepResult::Continue);
                }
                transient.uninstall(scope).await
            }
            OnlineStep::DeleteTransientStatefulSet => {
                if !scope.vdb.requires_transient_subcluster() {
                    return Ok(StepResult::Continue);
                }
                transient.delete_statefulset(scope).await
            }
            OnlineStep::Finish => {
                self.manager.finish_image_change(scope).await?;
                Ok(StepResult::Done)
            }
        }
    }

    async fn post_next_status_msg(&mut self, scope: &mut ClusterScope) -> Result<StepResult> {
        let index = self.next_msg;
        self.next_msg += 1;
        update_image_change_progress(scope.api.as_ref(), &mut scope.vdb, &self.status_msgs, index)
            .await?;
        Ok(StepResult::Continue)
    }

    async fn cache_primary_images(&mut self, scope: &ClusterScope) -> Result<()> {
        let finder = SubclusterFinder::new(scope.api.as_ref(), &scope.vdb);
        for sts in finder.find_statefulsets(FindFlags::EXISTING).await? {
            if sts.labels().get(SUBCLUSTER_TYPE_LABEL).map(String::as_str)
                != Some(PRIMARY_SUBCLUSTER_TYPE)
            {
                continue;
            }
            let image = statefulset_image(&sts);
            if !self.primary_images.contains(&image) {
                self.primary_images.push(image);
            }
        }
        Ok(())
    }

    /// The image the primaries ran before the change.
    fn fetch_old_image(&self, vdb: &VerticaDB) -> Option<String> {
        self.primary_images
            .iter()
            .find(|img| **img != vdb.spec.image)
            .cloned()
    }

    /// True when the transient need not be created, installed or scaled out.
    ///
    /// That is the case when no template is configured, when every primary
    /// already runs the new image, or when nothing is up to act from.
    fn skip_transient_setup(&self, scope: &ClusterScope) -> bool {
        if !scope.vdb.requires_transient_subcluster() {
            return true;
        }
        if self.primary_images.len() == 1
            && self.primary_images.first() == Some(&scope.vdb.spec.image)
        {
            return true;
        }
        scope.facts.find_pod_to_run_vsql(None).is_none()
    }

    async fn statefulsets_of_type(
        &self,
        scope: &ClusterScope,
        sc_type: &str,
    ) -> Result<Vec<StatefulSet>> {
        let finder = SubclusterFinder::new(scope.api.as_ref(), &scope.vdb);
        Ok(finder
            .find_statefulsets(FindFlags::EXISTING | FindFlags::SORTED)
            .await?
            .into_iter()
            .filter(|sts| is_matching_type(sts, sc_type))
            .collect())
    }

    // ------------------------------------------------------------------------
    // Per-subcluster driving
    // ------------------------------------------------------------------------

    async fn restart_primaries(
        &mut self,
        scope: &mut ClusterScope,
        transient: &TransientSubcluster,
    ) -> Result<StepResult> {
        info!("Starting the handling of primaries");
        for step in PRIMARY_STEPS {
            self.post_next_status_msg(scope).await?;
            // Refetched per step since earlier steps change the StatefulSets.
            for sts in self.statefulsets_of_type(scope, PRIMARY_SUBCLUSTER_TYPE).await? {
                let result = self.run_subcluster_step(*step, scope, transient, &sts).await?;
                if result != StepResult::Continue {
                    info!(step = %step, subcluster = %subcluster_name(&sts), "Stopped handling primaries");
                    return Ok(result);
                }
            }
        }
        Ok(StepResult::Continue)
    }

    async fn restart_secondaries(
        &mut self,
        scope: &mut ClusterScope,
        transient: &TransientSubcluster,
    ) -> Result<StepResult> {
        info!("Starting the handling of secondaries");
        for sts in self.statefulsets_of_type(scope, SECONDARY_SUBCLUSTER_TYPE).await? {
            for step in SECONDARY_STEPS {
                self.post_next_status_msg(scope).await?;
                let result = self.run_subcluster_step(*step, scope, transient, &sts).await?;
                if result != StepResult::Continue {
                    info!(step = %step, subcluster = %subcluster_name(&sts), "Stopped handling secondary");
                    return Ok(result);
                }
            }
        }
        Ok(StepResult::Continue)
    }

    async fn run_subcluster_step(
        &self,
        step: SubclusterStep,
        scope: &mut ClusterScope,
        transient: &TransientSubcluster,
        sts: &StatefulSet,
    ) -> Result<StepResult> {
        let sc_name = subcluster_name(sts);
        match step {
            SubclusterStep::Drain => self.drain_subcluster(scope, transient, sts, &sc_name).await,
            SubclusterStep::Recreate => {
                let image = scope.vdb.spec.image.clone();
                if update_statefulset_image(scope.api.as_ref(), &sts.name_any(), &image).await? {
                    scope.invalidate_facts();
                }
                if self
                    .manager
                    .delete_pods_running_old_image(scope, Some(&sc_name), RoleFilter::All)
                    .await?
                    > 0
                {
                    scope.invalidate_facts();
                }
                Ok(StepResult::Continue)
            }
            SubclusterStep::CheckVersion => {
                if scope.vdb.spec.ignore_upgrade_path {
                    return Ok(StepResult::Continue);
                }
                let result = VersionReconciler::enforcing(&sc_name).reconcile(scope).await?;
                if result.is_requeue() {
                    return Ok(result);
                }
                Ok(StepResult::Continue)
            }
            SubclusterStep::BringOnline => {
                let result = RestartReconciler::new().reconcile(scope).await?;
                if result.is_requeue() {
                    return Ok(result);
                }
                scope.invalidate_facts();
                info!(subcluster = %sc_name, "Routing client traffic back to subcluster");
                self.route_client_traffic(scope, transient, &sc_name, false)
                    .await?;
                Ok(StepResult::Continue)
            }
        }
    }

    /// Route traffic away from the subcluster and wait for it to go idle.
    /// Nothing to do when its StatefulSet already has the new image.
    async fn drain_subcluster(
        &self,
        scope: &mut ClusterScope,
        transient: &TransientSubcluster,
        sts: &StatefulSet,
        sc_name: &str,
    ) -> Result<StepResult> {
        if statefulset_image(sts) == scope.vdb.spec.image {
            return Ok(StepResult::Continue);
        }
        info!(subcluster = %sc_name, "Rerouting client traffic from subcluster");
        self.route_client_traffic(scope, transient, sc_name, true)
            .await?;
        self.is_subcluster_idle(scope, sc_name).await
    }

    /// Requeue while the subcluster still has client sessions.
    async fn is_subcluster_idle(&self, scope: &mut ClusterScope, sc_name: &str) -> Result<StepResult> {
        scope.collect_facts().await?;
        let Some(pod) = scope
            .facts
            .find_pod_to_run_vsql(Some(sc_name))
            .map(|p| p.name.clone())
        else {
            info!(subcluster = %sc_name, "No pod found to run vsql, skipping active connection check");
            return Ok(StepResult::Continue);
        };
        let out = scope
            .runner
            .exec_vsql(&pod, &command(&["-tAc", &active_sessions_query(sc_name)]))
            .await?;
        if has_active_sessions(&out.stdout) {
            info!(subcluster = %sc_name, "Subcluster still has active sessions, requeuing");
            return Ok(StepResult::Requeue);
        }
        Ok(StepResult::Continue)
    }

    /// Point the subcluster's service at a temporary target, or back at the
    /// subcluster itself.
    async fn route_client_traffic(
        &self,
        scope: &ClusterScope,
        transient: &TransientSubcluster,
        sc_name: &str,
        to_temporary: bool,
    ) -> Result<()> {
        let vdb = &scope.vdb;
        let subclusters = vdb.subcluster_map();
        let Some(sc) = subclusters.get(sc_name) else {
            return Err(Error::Validation(format!(
                "routing for a subcluster that isn't in the vdb: {sc_name}"
            )));
        };

        let svc_name = external_service_name(vdb, sc);
        let Some(mut svc) = scope.api.get_service(&svc_name).await? else {
            info!(subcluster = %sc_name, service = %svc_name, "Service for subcluster not found, skipping traffic routing");
            return Ok(());
        };

        let selector = if to_temporary {
            match temporary_routing_selector(vdb, sc_name) {
                Some(selector) => selector,
                None => {
                    if !transient.exists(scope).await? {
                        info!(name = %transient.statefulset_name(vdb), "Transient does not exist, skipping routing to it");
                        return Ok(());
                    }
                    selector_for_subcluster_name_routing(vdb, transient.subcluster())
                }
            }
        } else {
            selector_for_service_name_routing(vdb, sc)
        };

        let spec = svc.spec.get_or_insert_with(Default::default);
        if spec.selector.as_ref() == Some(&selector) {
            return Ok(());
        }
        info!(service = %svc_name, selector = ?selector, "Updating service selector");
        spec.selector = Some(selector);
        scope.api.replace_service(&svc).await?;
        Ok(())
    }
}

/// Subcluster a service selector built by the routing helpers points at.
pub fn routed_subcluster(selector: &BTreeMap<String, String>) -> Option<&str> {
    selector.get(SUBCLUSTER_NAME_LABEL).map(String::as_str)
}
