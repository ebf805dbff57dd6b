//! Lifecycle of the transient subcluster used by the online image change.
//!
//! The transient is a secondary subcluster that runs the old image and takes
//! client traffic while the subcluster it replaces restarts. It is created
//! from the StatefulSet of an existing primary, installed, added to the
//! database and later torn down again. Every step checks whether it already
//! happened before acting.

use std::path::{Path, PathBuf};
use std::time::Duration;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::ResourceExt;
use tracing::{debug, info, warn};

use super::error::{Error, Result};
use super::events::reasons;
use super::finder::{FindFlags, SubclusterFinder};
use super::image_change::set_statefulset_image;
use super::names::{
    SUBCLUSTER_TRANSIENT_LABEL, SUBCLUSTER_TYPE_LABEL, pod_name,
    selector_for_subcluster_name_routing, statefulset_name, subcluster_labels,
};
use super::pipeline::{ClusterScope, StepResult};
use super::pod_facts::{PodFact, pod_names};
use crate::client::parsing::parse_compat21_node_name;
use crate::client::paths::{
    ADMINTOOLS_CONF, CONFIG_SHARE_DIR, EULA_ACCEPTANCE_SCRIPT, LOGROTATE_DIR, PYTHON3_BIN,
    SERVER_CONTAINER, UPDATE_VERTICA_BIN, installer_indicator_file,
};
use crate::client::{ParseError, PodRunner, command};
use crate::crd::{PRIMARY_SUBCLUSTER_TYPE, Subcluster, VerticaDB};

/// Attempts made while waiting for a transient pod to become ready.
pub const READY_ATTEMPTS: u32 = 30;
/// Pause between readiness checks.
pub const READY_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Output of db_remove_subcluster when the subcluster is already gone.
const NO_SUBCLUSTER_FOUND: &str = "No subcluster found";
/// Output of db_add_node when the license does not allow more nodes.
const LICENSE_LIMIT_MSG: &str = "Cannot create another node. The current license permits";

const ACCEPT_EULA_SCRIPT: &str = "import vertica.shared.logging
import vertica.tools.eula_checker
vertica.shared.logging.setup_admintool_logging()
vertica.tools.eula_checker.EulaChecker().write_acceptance()
";

/// Build the transient StatefulSet from the StatefulSet of another
/// subcluster.
///
/// Volume claims, service account and pod settings are kept. Identity,
/// labels, size and image come from `sc`.
pub fn build_transient_statefulset(
    vdb: &VerticaDB,
    template: &StatefulSet,
    sc: &Subcluster,
    image: &str,
) -> StatefulSet {
    let labels = subcluster_labels(vdb, sc);
    let mut spec = template.spec.clone().unwrap_or_default();
    spec.replicas = Some(sc.size);
    spec.selector = LabelSelector {
        match_labels: Some(selector_for_subcluster_name_routing(vdb, sc)),
        match_expressions: None,
    };
    let pod_meta = spec.template.metadata.get_or_insert_with(ObjectMeta::default);
    pod_meta.labels = Some(labels.clone());

    let mut sts = StatefulSet {
        metadata: ObjectMeta {
            name: Some(statefulset_name(vdb, sc)),
            namespace: template.namespace(),
            labels: Some(labels),
            owner_references: template.metadata.owner_references.clone(),
            ..Default::default()
        },
        spec: Some(spec),
        status: None,
    };
    set_statefulset_image(&mut sts, image);
    sts
}

/// `update_vertica --add-hosts` for the given IPs.
pub fn add_hosts_command(ips: &[String]) -> Vec<String> {
    command(&[
        "sudo",
        UPDATE_VERTICA_BIN,
        "--add-hosts",
        &ips.join(","),
        "--no-package-checks",
    ])
}

/// `update_vertica --remove-hosts` for the given host names.
pub fn remove_hosts_command(hosts: &[String]) -> Vec<String> {
    command(&[
        "sudo",
        UPDATE_VERTICA_BIN,
        "--remove-hosts",
        &hosts.join(","),
        "--no-package-checks",
    ])
}

pub fn add_subcluster_command(vdb: &VerticaDB, sc: &Subcluster) -> Vec<String> {
    let mut cmd = command(&[
        "-t",
        "db_add_subcluster",
        "--database",
        &vdb.spec.db_name,
        "--subcluster",
        &sc.name,
    ]);
    if !sc.is_primary {
        cmd.push("--is-secondary".to_string());
    }
    cmd
}

pub fn remove_subcluster_command(vdb: &VerticaDB, sc: &Subcluster) -> Vec<String> {
    command(&[
        "-t",
        "db_remove_subcluster",
        "--database",
        &vdb.spec.db_name,
        "--subcluster",
        &sc.name,
        "--noprompts",
    ])
}

pub fn add_node_command(vdb: &VerticaDB, pod: &PodFact) -> Vec<String> {
    command(&[
        "-t",
        "db_add_node",
        "--hosts",
        &pod.pod_ip,
        "--database",
        &vdb.spec.db_name,
        "--subcluster",
        &pod.subcluster,
        "--noprompt",
    ])
}

fn vdb_uid(vdb: &VerticaDB) -> String {
    vdb.metadata.uid.clone().unwrap_or_default()
}

/// Local scratch file for content copied into pods.
fn scratch_file(vdb: &VerticaDB, name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{name}.{}", vdb_uid(vdb)))
}

async fn write_scratch(path: &Path, contents: &str) -> Result<()> {
    tokio::fs::write(path, contents)
        .await
        .map_err(|e| Error::Transient(format!("failed to write {}: {e}", path.display())))
}

async fn remove_scratch(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        debug!(path = %path.display(), error = %e, "Failed to remove scratch file");
    }
}

/// Manages the transient subcluster of one VerticaDB.
#[derive(Clone, Debug)]
pub struct TransientSubcluster {
    sc: Subcluster,
}

impl TransientSubcluster {
    pub fn new(vdb: &VerticaDB) -> Self {
        Self {
            sc: vdb.build_transient_subcluster(""),
        }
    }

    pub fn subcluster(&self) -> &Subcluster {
        &self.sc
    }

    pub fn name(&self) -> &str {
        &self.sc.name
    }

    pub fn statefulset_name(&self, vdb: &VerticaDB) -> String {
        statefulset_name(vdb, &self.sc)
    }

    pub async fn exists(&self, scope: &ClusterScope) -> Result<bool> {
        Ok(scope
            .api
            .get_statefulset(&self.statefulset_name(&scope.vdb))
            .await?
            .is_some())
    }

    fn facts(&self, scope: &ClusterScope) -> Vec<PodFact> {
        scope.facts.filter_pods(|p| p.subcluster == self.sc.name)
    }

    /// Create the StatefulSet running `old_image`.
    pub async fn create_statefulset(&self, scope: &mut ClusterScope, old_image: &str) -> Result<StepResult> {
        if self.exists(scope).await? {
            return Ok(StepResult::Continue);
        }
        let finder = SubclusterFinder::new(scope.api.as_ref(), &scope.vdb);
        let template = finder
            .find_statefulsets(FindFlags::IN_VDB | FindFlags::SORTED)
            .await?
            .into_iter()
            .find(|sts| {
                sts.labels().get(SUBCLUSTER_TYPE_LABEL).map(String::as_str)
                    == Some(PRIMARY_SUBCLUSTER_TYPE)
                    && sts.labels().get(SUBCLUSTER_TRANSIENT_LABEL).map(String::as_str)
                        != Some("true")
            });
        let Some(template) = template else {
            info!("No primary statefulset to build the transient from, requeuing");
            return Ok(StepResult::Requeue);
        };

        let sc = scope.vdb.build_transient_subcluster(old_image);
        let sts = build_transient_statefulset(&scope.vdb, &template, &sc, old_image);
        info!(name = %sts.name_any(), image = %old_image, "Creating transient statefulset");
        scope.api.create_statefulset(&sts).await?;
        scope.invalidate_facts();
        Ok(StepResult::Continue)
    }

    /// Install vertica on transient pods that were never installed.
    ///
    /// admintools.conf is rebuilt on an installed pod with the new hosts and
    /// copied to every running pod. The installer indicator, the eula and the
    /// config directory are then fixed up on the new pods.
    pub async fn install(&self, scope: &mut ClusterScope) -> Result<StepResult> {
        scope.collect_facts().await?;
        let pods = self.facts(scope);
        if pods.iter().any(|p| !p.is_pod_running) {
            info!(subcluster = %self.sc.name, "Transient pods are not running yet, requeuing");
            return Ok(StepResult::Requeue);
        }
        let targets: Vec<PodFact> = pods
            .iter()
            .filter(|p| p.is_installed.is_false() && p.db_exists.is_false())
            .cloned()
            .collect();

        if !targets.is_empty() {
            let Some(installer) = scope.facts.find_installed_pods().into_iter().next() else {
                info!("No installed pod to run the installer from, requeuing");
                return Ok(StepResult::Requeue);
            };
            let runner = scope.runner.as_ref();
            let uid = vdb_uid(&scope.vdb);

            for pod in targets.iter().filter(|p| p.has_stale_admintools_conf) {
                let backup = format!("{ADMINTOOLS_CONF}.uid.{uid}");
                runner
                    .exec_in_pod(&pod.name, SERVER_CONTAINER, &command(&["mv", ADMINTOOLS_CONF, &backup]))
                    .await?;
            }

            let ips: Vec<String> = targets.iter().map(|p| p.pod_ip.clone()).collect();
            runner
                .exec_in_pod(&installer.name, SERVER_CONTAINER, &add_hosts_command(&ips))
                .await?;
            self.distribute_admintools_conf(scope, &installer.name).await?;
            self.create_install_indicators(scope.runner.as_ref(), &scope.vdb, &targets)
                .await?;

            scope
                .events
                .normal(
                    &scope.vdb,
                    reasons::INSTALL_SUCCEEDED,
                    format!("Installed vertica in the following pods: {}", pod_names(&targets)),
                )
                .await;
        }

        self.accept_eula_if_missing(scope, &pods).await?;
        self.check_config_dir(scope.runner.as_ref(), &pods).await?;
        if !targets.is_empty() {
            scope.invalidate_facts();
        }
        Ok(StepResult::Continue)
    }

    /// Copy admintools.conf from `source` to every running pod.
    async fn distribute_admintools_conf(&self, scope: &ClusterScope, source: &str) -> Result<()> {
        let conf = scope
            .runner
            .exec_in_pod(source, SERVER_CONTAINER, &command(&["cat", ADMINTOOLS_CONF]))
            .await?;
        let local = scratch_file(&scope.vdb, "admintools.conf");
        write_scratch(&local, &conf.stdout).await?;

        let mut result = Ok(());
        for pod in scope.facts.iter().filter(|p| p.is_pod_running && p.name != source) {
            if let Err(e) = scope
                .runner
                .copy_to_pod(&pod.name, SERVER_CONTAINER, &local, ADMINTOOLS_CONF)
                .await
            {
                result = Err(e.into());
                break;
            }
        }
        remove_scratch(&local).await;
        result
    }

    async fn create_install_indicators(
        &self,
        runner: &dyn PodRunner,
        vdb: &VerticaDB,
        pods: &[PodFact],
    ) -> Result<()> {
        let indicator = installer_indicator_file(&vdb_uid(vdb));
        for pod in pods {
            let grep = format!("grep -E '^node[0-9]{{4}} = {},' {ADMINTOOLS_CONF}", pod.pod_ip);
            let out = runner
                .exec_in_pod(&pod.name, SERVER_CONTAINER, &command(&["bash", "-c", &grep]))
                .await?;
            let node = parse_compat21_node_name(&out.stdout)?.ok_or_else(|| {
                ParseError::MissingField(format!("compat21 node for IP '{}'", pod.pod_ip))
            })?;
            info!(pod = %pod.name, node = %node, "Creating installer indicator file");
            runner
                .exec_in_pod(
                    &pod.name,
                    SERVER_CONTAINER,
                    &command(&["bash", "-c", &format!("echo {node} > {indicator}")]),
                )
                .await?;
        }
        Ok(())
    }

    async fn accept_eula_if_missing(&self, scope: &ClusterScope, pods: &[PodFact]) -> Result<()> {
        let missing: Vec<&PodFact> = pods
            .iter()
            .filter(|p| p.is_pod_running && p.eula_accepted.is_false())
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        let local = scratch_file(&scope.vdb, "accept_eula.py");
        write_scratch(&local, ACCEPT_EULA_SCRIPT).await?;
        let mut result = Ok(());
        for pod in missing {
            let accepted = async {
                scope
                    .runner
                    .copy_to_pod(&pod.name, SERVER_CONTAINER, &local, EULA_ACCEPTANCE_SCRIPT)
                    .await?;
                scope
                    .runner
                    .exec_in_pod(
                        &pod.name,
                        SERVER_CONTAINER,
                        &command(&[PYTHON3_BIN, EULA_ACCEPTANCE_SCRIPT]),
                    )
                    .await
            };
            if let Err(e) = accepted.await {
                result = Err(e.into());
                break;
            }
        }
        remove_scratch(&local).await;
        result
    }

    async fn check_config_dir(&self, runner: &dyn PodRunner, pods: &[PodFact]) -> Result<()> {
        for pod in pods.iter().filter(|p| p.is_pod_running) {
            if !pod.config_logrotate_writable {
                runner
                    .exec_in_pod(
                        &pod.name,
                        SERVER_CONTAINER,
                        &command(&["sudo", "chown", "-R", "dbadmin:verticadba", LOGROTATE_DIR]),
                    )
                    .await?;
            }
            if !pod.config_share_exists {
                runner
                    .exec_in_pod(&pod.name, SERVER_CONTAINER, &command(&["mkdir", CONFIG_SHARE_DIR]))
                    .await?;
            }
        }
        Ok(())
    }

    /// Subcluster names known to the database.
    async fn fetch_db_subclusters(&self, scope: &ClusterScope, pod: &str) -> Result<Vec<String>> {
        let out = scope
            .runner
            .exec_vsql(
                pod,
                &command(&["-tAc", "select distinct(subcluster_name) from subclusters"]),
            )
            .await?;
        Ok(out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Register the transient subcluster with the database.
    pub async fn add_subcluster(&self, scope: &mut ClusterScope) -> Result<StepResult> {
        scope.collect_facts().await?;
        let Some(at_pod) = scope.facts.find_pod_to_run_vsql(None).map(|p| p.name.clone()) else {
            info!("No up pod to add the transient subcluster from, requeuing");
            return Ok(StepResult::Requeue);
        };
        if self
            .fetch_db_subclusters(scope, &at_pod)
            .await?
            .iter()
            .any(|s| *s == self.sc.name)
        {
            return Ok(StepResult::Continue);
        }

        scope
            .runner
            .exec_admintools(&at_pod, &add_subcluster_command(&scope.vdb, &self.sc))
            .await?;
        scope
            .events
            .normal(
                &scope.vdb,
                reasons::SUBCLUSTER_ADDED,
                format!("Added new subcluster '{}'", self.sc.name),
            )
            .await;
        Ok(StepResult::Continue)
    }

    /// Add every transient pod that is not yet a database node.
    pub async fn add_nodes(&self, scope: &mut ClusterScope) -> Result<StepResult> {
        scope.collect_facts().await?;
        if !scope.facts.any_pods_missing_db(&self.sc.name).is_true() {
            return Ok(StepResult::Continue);
        }
        let pods = scope.facts.find_pods_with_missing_db(&self.sc.name);
        let Some(at_pod) = scope.facts.find_pod_to_run_vsql(None).map(|p| p.name.clone()) else {
            info!("No up pod to run db_add_node from, requeuing");
            return Ok(StepResult::Requeue);
        };

        for pod in &pods {
            let start = tokio::time::Instant::now();
            match scope
                .runner
                .exec_admintools(&at_pod, &add_node_command(&scope.vdb, pod))
                .await
            {
                Ok(_) => {
                    scope
                        .events
                        .normal(
                            &scope.vdb,
                            reasons::ADD_NODE_SUCCEEDED,
                            format!(
                                "Successfully called 'admintools -t db_add_node' and it took {:?}",
                                start.elapsed()
                            ),
                        )
                        .await;
                    scope.invalidate_facts();
                }
                Err(e) if e.stdout.contains(LICENSE_LIMIT_MSG) => {
                    warn!(pod = %pod.name, "License limit reached, not adding more transient nodes");
                    return Ok(StepResult::Continue);
                }
                Err(e) => return Err(e.into()),
            }
        }

        let rebalance = format!("select rebalance_shards('{}')", self.sc.name);
        scope
            .runner
            .exec_vsql(&at_pod, &command(&["-tAc", &rebalance]))
            .await?;
        Ok(StepResult::Continue)
    }

    /// Wait a bounded time for the first transient pod to be ready.
    ///
    /// Never requeues. A transient that does not become ready only means
    /// routing to it will not reach a pod.
    pub async fn wait_for_ready_pod(&self, scope: &ClusterScope) -> Result<StepResult> {
        let name = pod_name(&self.statefulset_name(&scope.vdb), 0);
        for _ in 0..READY_ATTEMPTS {
            let pod = match scope.api.get_pod(&name).await {
                Ok(Some(pod)) => pod,
                Ok(None) => {
                    info!(pod = %name, "Transient pod not found, not waiting for it");
                    return Ok(StepResult::Continue);
                }
                Err(e) => {
                    info!(pod = %name, error = %e, "Error while fetching transient pod");
                    return Ok(StepResult::Continue);
                }
            };
            let ready = pod
                .status
                .as_ref()
                .and_then(|s| s.container_statuses.as_ref())
                .and_then(|cs| cs.iter().find(|c| c.name == SERVER_CONTAINER))
                .is_some_and(|c| c.ready);
            if ready {
                info!(pod = %name, "Transient pod is ready");
                return Ok(StepResult::Continue);
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
        warn!(
            pod = %name,
            attempts = READY_ATTEMPTS,
            "Transient pod never became ready, continuing without waiting for it"
        );
        Ok(StepResult::Continue)
    }

    /// Remove the transient subcluster from the database.
    pub async fn remove_subcluster(&self, scope: &mut ClusterScope) -> Result<StepResult> {
        if !self.exists(scope).await? {
            return Ok(StepResult::Continue);
        }
        scope.collect_facts().await?;
        let Some(at_pod) = scope
            .facts
            .iter()
            .find(|p| p.up_node && !p.is_transient)
            .map(|p| p.name.clone())
        else {
            info!("No up pod to remove the transient subcluster from, requeuing");
            return Ok(StepResult::Requeue);
        };

        match scope
            .runner
            .exec_admintools(&at_pod, &remove_subcluster_command(&scope.vdb, &self.sc))
            .await
        {
            Ok(_) => {}
            Err(e) if e.stdout.contains(NO_SUBCLUSTER_FOUND) => {
                debug!(subcluster = %self.sc.name, "Transient subcluster already removed");
                return Ok(StepResult::Continue);
            }
            Err(e) => return Err(e.into()),
        }
        scope
            .events
            .normal(
                &scope.vdb,
                reasons::SUBCLUSTER_REMOVED,
                format!("Removed subcluster '{}'", self.sc.name),
            )
            .await;
        scope.invalidate_facts();
        Ok(StepResult::Continue)
    }

    /// Remove the transient hosts from admintools.conf and drop their
    /// installer indicators.
    pub async fn uninstall(&self, scope: &mut ClusterScope) -> Result<StepResult> {
        if !self.exists(scope).await? {
            return Ok(StepResult::Continue);
        }
        scope.collect_facts().await?;
        let pods: Vec<PodFact> = self
            .facts(scope)
            .into_iter()
            .filter(|p| p.is_pod_running && !p.is_installed.is_false())
            .collect();
        if pods.is_empty() {
            return Ok(StepResult::Continue);
        }
        let Some(exec_pod) = scope
            .facts
            .iter()
            .find(|p| p.is_pod_running && !p.is_transient)
            .map(|p| p.name.clone())
        else {
            return Ok(StepResult::Requeue);
        };

        let hosts: Vec<String> = pods.iter().map(|p| p.dns_name.clone()).collect();
        scope
            .runner
            .exec_in_pod(&exec_pod, SERVER_CONTAINER, &remove_hosts_command(&hosts))
            .await?;

        let indicator = installer_indicator_file(&vdb_uid(&scope.vdb));
        for pod in &pods {
            scope
                .runner
                .exec_in_pod(&pod.name, SERVER_CONTAINER, &command(&["rm", &indicator]))
                .await?;
        }
        scope.invalidate_facts();
        Ok(StepResult::Continue)
    }

    pub async fn delete_statefulset(&self, scope: &mut ClusterScope) -> Result<StepResult> {
        let name = self.statefulset_name(&scope.vdb);
        if !self.exists(scope).await? {
            return Ok(StepResult::Continue);
        }
        info!(name = %name, "Deleting transient statefulset");
        scope.api.delete_statefulset(&name).await?;
        scope.invalidate_facts();
        Ok(StepResult::Continue)
    }
}
