//! Restart and re-IP of Vertica nodes.
//!
//! Pods that get rescheduled come back with new IPs, so before vertica can
//! be started the IPs recorded in admintools.conf may need to be rewritten.
//! Two paths exist: when no node is up the whole cluster is started with
//! `start_db`, otherwise the down nodes are restarted with `restart_node`.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use super::error::{Error, Result};
use super::events::reasons;
use super::pipeline::{ClusterScope, StepResult};
use super::pod_facts::{PodFact, pod_names};
use super::status::update_conditions;
use crate::client::parsing::{STATE_UP, parse_admintools_conf_ips, parse_cluster_node_status};
use crate::client::paths::{ADMINTOOLS_CONF, IP_MAP_FILE, SERVER_CONTAINER};
use crate::client::{command, debug_dump_admintools_conf};
use crate::crd::{ConditionType, VerticaDB};

/// Delay before retrying a restart that vertica refused because it had not
/// yet noticed the nodes were down.
pub const RESTART_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Output of `restart_node` when some of the hosts are still considered up.
pub const NODES_NOT_DOWN_MSG: &str = "All nodes in the input are not down, can't restart";

const KILL_VERTICA_SCRIPT: &str = "for pid in $(pgrep ^vertica$); do kill -n SIGKILL $pid; done";

/// Contents of the map file handed to `admintools -t re_ip`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MapFile {
    /// One `<old-ip> <new-ip>` line per node.
    pub contents: Vec<String>,
    /// At least one node has a new IP.
    pub ip_changing: bool,
    /// False when the file could not be built and the caller should requeue.
    pub ok: bool,
}

/// Pair the IPs from admintools.conf with the current pod IPs.
///
/// Lookup is by the compat21 node name since pods that were never added to
/// the database have no vnode name yet. Nodes missing from `old_ips` are
/// skipped. The result is not ok when `pods` is empty or any pod is not
/// running, since its new IP is not known yet.
pub fn gen_map_file(old_ips: &BTreeMap<String, String>, pods: &[PodFact]) -> MapFile {
    let mut map = MapFile::default();
    if pods.is_empty() {
        info!("No pods qualify for re_ip, requeuing restart");
        return map;
    }
    for pod in pods {
        if !pod.is_pod_running {
            info!(pod = %pod.name, "Not all pods are running, requeuing restart");
            return MapFile {
                ok: false,
                ..map
            };
        }
        let Some(old_ip) = old_ips.get(&pod.compat21_node_name) else {
            continue;
        };
        if *old_ip != pod.pod_ip {
            map.ip_changing = true;
        }
        map.contents.push(format!("{} {}", old_ip, pod.pod_ip));
    }
    map.ok = true;
    map
}

/// Command that writes the map file into the pod.
pub fn map_file_upload_command(contents: &[String]) -> Vec<String> {
    command(&[
        "bash",
        "-c",
        &format!("cat > {}<<< '{}'", IP_MAP_FILE, contents.join("\n")),
    ])
}

pub fn reip_command() -> Vec<String> {
    command(&["-t", "re_ip", &format!("--file={IP_MAP_FILE}"), "--noprompt"])
}

/// `start_db` arguments for the whole cluster.
pub fn start_db_command(vdb: &VerticaDB) -> Vec<String> {
    let mut cmd = command(&[
        "-t",
        "start_db",
        &format!("--database={}", vdb.spec.db_name),
        "--noprompt",
    ]);
    if vdb.spec.ignore_cluster_lease {
        cmd.push("--ignore-cluster-lease".to_string());
    }
    if vdb.spec.restart_timeout != 0 {
        cmd.push(format!("--timeout={}", vdb.spec.restart_timeout));
    }
    cmd
}

/// `restart_node` arguments for the given vnodes and their new IPs.
pub fn restart_node_command(vdb: &VerticaDB, vnodes: &[String], ips: &[String]) -> Vec<String> {
    let mut cmd = command(&[
        "-t",
        "restart_node",
        &format!("--database={}", vdb.spec.db_name),
        &format!("--hosts={}", vnodes.join(",")),
        &format!("--new-host-ips={}", ips.join(",")),
        "--noprompt",
    ]);
    if vdb.spec.restart_timeout != 0 {
        cmd.push(format!("--timeout={}", vdb.spec.restart_timeout));
    }
    cmd
}

/// Brings down vertica nodes back up.
#[derive(Debug, Default)]
pub struct RestartReconciler {
    /// Pod admintools runs from, picked once per invocation.
    at_pod: Option<String>,
}

impl RestartReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn reconcile(&mut self, scope: &mut ClusterScope) -> Result<StepResult> {
        let auto_restart = scope.vdb.spec.auto_restart_vertica;
        update_conditions(
            scope.api.as_ref(),
            &mut scope.vdb,
            &[(ConditionType::AutoRestartVertica, auto_restart, "AutoRestartVertica")],
        )
        .await?;
        if !auto_restart {
            return Ok(StepResult::Done);
        }

        scope.collect_facts().await?;
        let result = if scope.facts.up_node_count() == 0 {
            self.reconcile_cluster(scope).await?
        } else {
            self.reconcile_nodes(scope).await?
        };
        Ok(result.settle())
    }

    /// Pick the admintools pod if not already chosen.
    fn set_at_pod(&mut self, scope: &ClusterScope) -> Option<String> {
        if self.at_pod.is_none() {
            self.at_pod = scope
                .facts
                .find_pod_to_run_admintools()
                .map(|p| p.name.clone());
        }
        self.at_pod.clone()
    }

    /// Restart when every node is down.
    async fn reconcile_cluster(&mut self, scope: &mut ClusterScope) -> Result<StepResult> {
        if scope.facts.are_all_pods_running_and_zero_installed() {
            return Ok(StepResult::Done);
        }
        if scope.facts.count_running_and_installed() == 0 {
            // A pod that is not running yet may need a restart once it is.
            return Ok(StepResult::Requeue);
        }
        let Some(at_pod) = self.set_at_pod(scope) else {
            info!("No pod found to run admintools from, requeuing reconciliation");
            return Ok(StepResult::Requeue);
        };

        let db_exists = scope.facts.does_db_exist().is_true();
        // list_allnodes fails when there is no database yet.
        if db_exists && self.any_up_nodes_in_cluster_state(scope, &at_pod).await? {
            return Ok(StepResult::Requeue);
        }

        let down_pods = scope.facts.find_restartable_pods();
        kill_old_processes(scope, &down_pods).await?;

        let reip_pods = scope.facts.find_reip_pods(false);
        let result = self.reip_nodes(scope, &at_pod, &reip_pods).await?;
        if result.is_requeue() {
            return Ok(result);
        }

        if !db_exists {
            return Ok(StepResult::Done);
        }
        self.restart_cluster(scope, &at_pod).await
    }

    /// Restart the down nodes and re-IP installed pods not yet in the
    /// database.
    async fn reconcile_nodes(&mut self, scope: &mut ClusterScope) -> Result<StepResult> {
        let down_pods = scope.facts.find_restartable_pods();
        if !down_pods.is_empty() {
            let Some(at_pod) = self.set_at_pod(scope) else {
                info!("No pod found to run admintools from, requeuing reconciliation");
                return Ok(StepResult::Requeue);
            };
            let result = self.restart_pods(scope, &at_pod, down_pods).await?;
            if result.is_requeue() {
                return Ok(result);
            }
        }

        let reip_pods = scope.facts.find_reip_pods(true);
        if !reip_pods.is_empty() {
            let Some(at_pod) = self.set_at_pod(scope) else {
                info!("No pod found to run admintools from, requeuing reconciliation");
                return Ok(StepResult::Requeue);
            };
            return self.reip_nodes(scope, &at_pod, &reip_pods).await;
        }
        Ok(StepResult::Done)
    }

    async fn restart_pods(
        &mut self,
        scope: &mut ClusterScope,
        at_pod: &str,
        pods: Vec<PodFact>,
    ) -> Result<StepResult> {
        let total = pods.len();
        let cluster_state = self.fetch_cluster_node_status(scope, at_pod).await?;
        let down_pods: Vec<PodFact> = pods
            .into_iter()
            .filter(|p| cluster_state.get(&p.vnode_name).map(String::as_str) != Some(STATE_UP))
            .collect();
        if down_pods.is_empty() {
            // The cluster does not know yet that the pods are down.
            return Ok(StepResult::Requeue);
        }

        let vnodes: Vec<String> = down_pods.iter().map(|p| p.vnode_name.clone()).collect();
        let ips: Vec<String> = down_pods.iter().map(|p| p.pod_ip.clone()).collect();

        kill_old_processes(scope, &down_pods).await?;
        debug_dump_admintools_conf(scope.runner.as_ref(), at_pod).await;

        let cmd = restart_node_command(&scope.vdb, &vnodes, &ips);
        scope
            .events
            .normal(
                &scope.vdb,
                reasons::NODE_RESTART_STARTED,
                format!(
                    "Calling 'admintools -t restart_node' to restart the following pods: {}",
                    pod_names(&down_pods)
                ),
            )
            .await;
        scope.record_admin_command("restart_node");
        let start = Instant::now();
        match scope.runner.exec_admintools(at_pod, &cmd).await {
            Ok(_) => {}
            Err(e) => {
                scope
                    .events
                    .warning(
                        &scope.vdb,
                        reasons::NODE_RESTART_FAILED,
                        "Failed while calling 'admintools -t restart_node'".to_string(),
                    )
                    .await;
                if e.stdout.contains(NODES_NOT_DOWN_MSG) {
                    info!("Vertica has not detected the nodes are down yet, retrying restart later");
                    return Ok(StepResult::RequeueAfter(RESTART_RETRY_DELAY));
                }
                return Err(Error::Exec(e));
            }
        }
        scope
            .events
            .normal(
                &scope.vdb,
                reasons::NODE_RESTART_SUCCEEDED,
                format!(
                    "Successfully called 'admintools -t restart_node' and it took {:?}",
                    start.elapsed()
                ),
            )
            .await;
        debug_dump_admintools_conf(scope.runner.as_ref(), at_pod).await;

        scope.invalidate_facts();

        // Some pods were skipped because the cluster still had them up.
        if total > down_pods.len() {
            return Ok(StepResult::Requeue);
        }
        Ok(StepResult::Continue)
    }

    /// Node states as the cluster sees them, keyed by vnode name.
    async fn fetch_cluster_node_status(
        &self,
        scope: &ClusterScope,
        at_pod: &str,
    ) -> Result<BTreeMap<String, String>> {
        let out = scope
            .runner
            .exec_admintools(at_pod, &command(&["-t", "list_allnodes"]))
            .await?;
        Ok(parse_cluster_node_status(&out.stdout))
    }

    async fn any_up_nodes_in_cluster_state(&self, scope: &ClusterScope, at_pod: &str) -> Result<bool> {
        let state = self.fetch_cluster_node_status(scope, at_pod).await?;
        Ok(state.values().any(|s| s == STATE_UP))
    }

    /// IPs recorded for each compat21 node name in admintools.conf.
    async fn fetch_old_ips(&self, scope: &ClusterScope, at_pod: &str) -> Result<BTreeMap<String, String>> {
        let grep = format!("grep --regexp='^node[0-9]' {ADMINTOOLS_CONF}");
        let out = scope
            .runner
            .exec_in_pod(at_pod, SERVER_CONTAINER, &command(&["bash", "-c", &grep]))
            .await?;
        Ok(parse_admintools_conf_ips(&out.stdout)?)
    }

    /// Run `re_ip` for `pods` when any of their IPs changed.
    async fn reip_nodes(
        &self,
        scope: &mut ClusterScope,
        at_pod: &str,
        pods: &[PodFact],
    ) -> Result<StepResult> {
        let old_ips = self.fetch_old_ips(scope, at_pod).await?;
        let map = gen_map_file(&old_ips, pods);
        if !map.ok {
            info!("Could not generate the map file contents from nodes, requeuing reconciliation");
            return Ok(StepResult::Requeue);
        }
        if !map.ip_changing {
            debug!("No IPs changed, skipping re_ip");
            return Ok(StepResult::Continue);
        }

        scope
            .runner
            .exec_in_pod(at_pod, SERVER_CONTAINER, &map_file_upload_command(&map.contents))
            .await?;
        debug_dump_admintools_conf(scope.runner.as_ref(), at_pod).await;

        scope.record_admin_command("re_ip");
        scope.runner.exec_admintools(at_pod, &reip_command()).await?;
        debug_dump_admintools_conf(scope.runner.as_ref(), at_pod).await;
        Ok(StepResult::Continue)
    }

    async fn restart_cluster(&self, scope: &mut ClusterScope, at_pod: &str) -> Result<StepResult> {
        let cmd = start_db_command(&scope.vdb);
        scope
            .events
            .normal(
                &scope.vdb,
                reasons::CLUSTER_RESTART_STARTED,
                "Calling 'admintools -t start_db' to restart the cluster".to_string(),
            )
            .await;
        scope.record_admin_command("start_db");
        let start = Instant::now();
        if let Err(e) = scope.runner.exec_admintools(at_pod, &cmd).await {
            scope
                .events
                .warning(
                    &scope.vdb,
                    reasons::CLUSTER_RESTART_FAILED,
                    "Failed while calling 'admintools -t start_db'".to_string(),
                )
                .await;
            return Err(Error::Exec(e));
        }
        scope
            .events
            .normal(
                &scope.vdb,
                reasons::CLUSTER_RESTART_SUCCEEDED,
                format!(
                    "Successfully called 'admintools -t start_db' and it took {:?}",
                    start.elapsed()
                ),
            )
            .await;
        scope.invalidate_facts();
        Ok(StepResult::Done)
    }
}

/// Kill any vertica process left on pods the facts consider down.
async fn kill_old_processes(scope: &ClusterScope, pods: &[PodFact]) -> Result<()> {
    let cmd = command(&["bash", "-c", KILL_VERTICA_SCRIPT]);
    for pod in pods {
        scope
            .runner
            .exec_in_pod(&pod.name, SERVER_CONTAINER, &cmd)
            .await?;
    }
    Ok(())
}
