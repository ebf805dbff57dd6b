//! Cached facts about every pod of a VerticaDB.
//!
//! Collection walks every pod slot of every subcluster, including subclusters
//! that are being removed, and runs a fixed battery of read-only probes in
//! each running pod. The results are kept until a step that changes the
//! cluster topology calls [`PodFacts::invalidate`]; the next
//! [`PodFacts::collect`] then probes again from scratch.
//!
//! All query methods are pure functions over the cache.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;
use tracing::debug;

use super::error::Result;
use super::finder::{FindFlags, SubclusterFinder};
use super::names::{pod_name, statefulset_name};
use super::tristate::TriState;
use crate::client::parsing::parse_vnode_name;
use crate::client::paths::{
    ADMINTOOLS_CONF, CONFIG_SHARE_DIR, EULA_ACCEPTANCE_FILE, LOGROTATE_DIR, SERVER_CONTAINER,
    installer_indicator_file,
};
use crate::client::{ClusterApi, ExecError, PodRunner, command};
use crate::crd::{Subcluster, VerticaDB};

/// stderr printed by vsql when nothing listens on the client port.
const VSQL_NOT_CONNECTED: &str = "vsql: could not connect to server:";
const NO_SUCH_FILE: &str = "No such file or directory";

/// Observed state of one pod slot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PodFact {
    /// Pod name.
    pub name: String,
    /// Name of the subcluster the slot belongs to.
    pub subcluster: String,
    pub is_primary: bool,
    pub is_transient: bool,
    /// `<hostname>.<subdomain>` of the pod.
    pub dns_name: String,
    pub pod_ip: String,
    /// Image of the server container.
    pub image: String,
    /// The pod object exists.
    pub exists: bool,
    /// The pod phase is Running.
    pub is_pod_running: bool,
    /// The installer has run for this instance of the VerticaDB.
    pub is_installed: TriState,
    /// admintools.conf exists but belongs to a prior instance.
    pub has_stale_admintools_conf: bool,
    /// The database directory exists on this pod.
    pub db_exists: TriState,
    /// Name vertica gave the node, e.g. `v_vertdb_node0001`.
    pub vnode_name: String,
    /// Index based node name assigned at install time, e.g. `node0001`.
    pub compat21_node_name: String,
    /// vertica accepts client connections.
    pub up_node: bool,
    pub eula_accepted: TriState,
    pub config_logrotate_exists: bool,
    pub config_logrotate_writable: bool,
    pub config_share_exists: bool,
}

impl PodFact {
    /// A slot whose pod object does not exist.
    pub fn absent(name: &str, sc: &Subcluster) -> Self {
        Self {
            name: name.to_string(),
            subcluster: sc.name.clone(),
            is_primary: sc.is_primary,
            is_transient: sc.is_transient,
            ..Default::default()
        }
    }
}

/// The fact cache for one reconciliation pass.
#[derive(Clone, Debug)]
pub struct PodFacts {
    detail: BTreeMap<String, PodFact>,
    need_collection: bool,
}

impl Default for PodFacts {
    fn default() -> Self {
        Self::new()
    }
}

impl PodFacts {
    /// An empty cache that collects on first use.
    pub fn new() -> Self {
        Self {
            detail: BTreeMap::new(),
            need_collection: true,
        }
    }

    /// A cache preloaded with facts, treated as current.
    pub fn from_facts(facts: impl IntoIterator<Item = PodFact>) -> Self {
        Self {
            detail: facts.into_iter().map(|f| (f.name.clone(), f)).collect(),
            need_collection: false,
        }
    }

    /// Gather facts unless the cache is current.
    pub async fn collect(
        &mut self,
        api: &dyn ClusterApi,
        runner: &dyn PodRunner,
        vdb: &VerticaDB,
    ) -> Result<()> {
        if !self.need_collection {
            return Ok(());
        }
        self.detail.clear();

        let finder = SubclusterFinder::new(api, vdb);
        for sc in finder.find_subclusters(FindFlags::ALL).await? {
            self.collect_subcluster(api, runner, vdb, &sc).await?;
        }
        debug!(pods = self.detail.len(), "Collected pod facts");
        self.need_collection = false;
        Ok(())
    }

    /// Mark the cache stale so the next collect probes again.
    pub fn invalidate(&mut self) {
        self.need_collection = true;
    }

    pub fn needs_collection(&self) -> bool {
        self.need_collection
    }

    async fn collect_subcluster(
        &mut self,
        api: &dyn ClusterApi,
        runner: &dyn PodRunner,
        vdb: &VerticaDB,
        sc: &Subcluster,
    ) -> Result<()> {
        let sts_name = statefulset_name(vdb, sc);
        let Some(sts) = api.get_statefulset(&sts_name).await? else {
            // No StatefulSet means none of its pods exist.
            return Ok(());
        };
        let replicas = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
        for index in 0..sc.size.max(replicas) {
            let name = pod_name(&sts_name, index);
            let fact = match api.get_pod(&name).await? {
                None => PodFact::absent(&name, sc),
                Some(pod) => collect_pod(runner, vdb, sc, &name, &pod).await?,
            };
            self.detail.insert(name, fact);
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&PodFact> {
        self.detail.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PodFact> {
        self.detail.values()
    }

    pub fn len(&self) -> usize {
        self.detail.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detail.is_empty()
    }

    /// Pods matching `filter`, in name order.
    pub fn filter_pods(&self, filter: impl Fn(&PodFact) -> bool) -> Vec<PodFact> {
        self.detail.values().filter(|p| filter(p)).cloned().collect()
    }

    /// Whether the database exists anywhere.
    ///
    /// True when some running pod has the database. Unknown when none does
    /// but a running pod could not tell. False otherwise.
    pub fn does_db_exist(&self) -> TriState {
        let mut result = TriState::False;
        for pf in self.detail.values().filter(|p| p.is_pod_running) {
            match pf.db_exists {
                TriState::True => return TriState::True,
                TriState::Unknown => result = TriState::Unknown,
                TriState::False => {}
            }
        }
        result
    }

    /// Whether a running pod of the subcluster lacks the database.
    pub fn any_pods_missing_db(&self, sc_name: &str) -> TriState {
        let mut result = TriState::False;
        for pf in self.detail.values().filter(|p| p.subcluster == sc_name) {
            if pf.db_exists.is_false() && pf.is_pod_running {
                return TriState::True;
            }
            if pf.db_exists.is_unknown() {
                result = TriState::Unknown;
            }
        }
        result
    }

    /// Running pods of the subcluster that lack the database, by DNS name.
    pub fn find_pods_with_missing_db(&self, sc_name: &str) -> Vec<PodFact> {
        let mut pods =
            self.filter_pods(|p| p.subcluster == sc_name && p.db_exists.is_false() && p.is_pod_running);
        pods.sort_by(|a, b| a.dns_name.cmp(&b.dns_name));
        pods
    }

    /// An up pod able to run vsql, optionally limited to one subcluster.
    pub fn find_pod_to_run_vsql(&self, sc_name: Option<&str>) -> Option<&PodFact> {
        self.detail
            .values()
            .find(|p| p.up_node && sc_name.is_none_or(|sc| p.subcluster == sc))
    }

    /// A pod to run admintools from: an up pod, else an installed running pod.
    pub fn find_pod_to_run_admintools(&self) -> Option<&PodFact> {
        self.detail
            .values()
            .find(|p| p.up_node)
            .or_else(|| {
                self.detail
                    .values()
                    .find(|p| p.is_installed.is_true() && p.is_pod_running)
            })
    }

    pub fn find_running_pod(&self) -> Option<&PodFact> {
        self.detail.values().find(|p| p.is_pod_running)
    }

    /// Installed, running pods with the database whose vertica is down.
    pub fn find_restartable_pods(&self) -> Vec<PodFact> {
        self.filter_pods(|p| {
            !p.up_node && p.is_installed.is_true() && p.db_exists.is_true() && p.is_pod_running
        })
    }

    pub fn find_installed_pods(&self) -> Vec<PodFact> {
        self.filter_pods(|p| p.is_installed.is_true() && p.is_pod_running)
    }

    /// Pods whose IP may need refreshing in admintools.conf.
    ///
    /// These are pods that exist and are not known to be uninstalled. Pods
    /// that are not running are included so the caller can notice them and
    /// wait.
    pub fn find_reip_pods(&self, only_pods_without_db: bool) -> Vec<PodFact> {
        self.filter_pods(|p| {
            p.exists
                && !p.is_installed.is_false()
                && !(only_pods_without_db && p.db_exists.is_true())
        })
    }

    pub fn count_running_and_installed(&self) -> usize {
        self.detail
            .values()
            .filter(|p| p.is_pod_running && p.is_installed.is_true())
            .count()
    }

    /// True when every pod is running and none is installed, ignoring
    /// transient pods.
    pub fn are_all_pods_running_and_zero_installed(&self) -> bool {
        self.detail
            .values()
            .filter(|p| !p.is_transient)
            .all(|p| p.is_pod_running && !p.is_installed.is_true())
    }

    pub fn up_node_count(&self) -> usize {
        self.detail.values().filter(|p| p.up_node).count()
    }

    /// First pod that exists but is not running.
    pub fn any_pods_not_running(&self) -> Option<&PodFact> {
        self.detail.values().find(|p| p.exists && !p.is_pod_running)
    }
}

/// Comma separated pod names for events and logs.
pub fn pod_names(pods: &[PodFact]) -> String {
    pods.iter()
        .map(|p| p.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Server container image of a pod, empty when absent.
pub fn server_image(pod: &Pod) -> String {
    pod.spec
        .as_ref()
        .and_then(|s| s.containers.iter().find(|c| c.name == SERVER_CONTAINER))
        .and_then(|c| c.image.clone())
        .unwrap_or_default()
}

async fn collect_pod(
    runner: &dyn PodRunner,
    vdb: &VerticaDB,
    sc: &Subcluster,
    name: &str,
    pod: &Pod,
) -> Result<PodFact> {
    let spec = pod.spec.as_ref();
    let status = pod.status.as_ref();
    let mut pf = PodFact {
        exists: true,
        is_pod_running: status.and_then(|s| s.phase.as_deref()) == Some("Running"),
        dns_name: format!(
            "{}.{}",
            spec.and_then(|s| s.hostname.as_deref()).unwrap_or_default(),
            spec.and_then(|s| s.subdomain.as_deref()).unwrap_or_default()
        ),
        pod_ip: status.and_then(|s| s.pod_ip.clone()).unwrap_or_default(),
        image: server_image(pod),
        ..PodFact::absent(name, sc)
    };
    if !pf.is_pod_running {
        return Ok(pf);
    }

    check_is_installed(runner, vdb, &mut pf).await?;
    check_is_db_created(runner, vdb, &mut pf).await?;
    check_if_node_is_up(runner, &mut pf).await?;
    check_eula_acceptance(runner, &mut pf).await?;
    pf.config_logrotate_exists = probe_succeeds(runner, name, &["test", "-d", LOGROTATE_DIR]).await;
    pf.config_logrotate_writable =
        probe_succeeds(runner, name, &["test", "-w", LOGROTATE_DIR]).await;
    pf.config_share_exists = probe_succeeds(runner, name, &["test", "-d", CONFIG_SHARE_DIR]).await;
    Ok(pf)
}

/// Propagate `err` unless its stderr contains `absent_marker`.
fn absent_or_error(err: ExecError, absent_marker: &str) -> Result<()> {
    if err.stderr.contains(absent_marker) {
        Ok(())
    } else {
        Err(err.into())
    }
}

async fn check_is_installed(runner: &dyn PodRunner, vdb: &VerticaDB, pf: &mut PodFact) -> Result<()> {
    let uid = vdb.metadata.uid.as_deref().unwrap_or_default();
    let indicator = installer_indicator_file(uid);
    match runner
        .exec_in_pod(&pf.name, SERVER_CONTAINER, &command(&["cat", &indicator]))
        .await
    {
        Ok(out) => {
            pf.is_installed = TriState::True;
            pf.compat21_node_name = out.stdout.trim_end_matches('\n').to_string();
        }
        Err(e) => {
            absent_or_error(e, &format!("cat: {indicator}: {NO_SUCH_FILE}"))?;
            pf.is_installed = TriState::False;
            pf.has_stale_admintools_conf = match runner
                .exec_in_pod(&pf.name, SERVER_CONTAINER, &command(&["ls", ADMINTOOLS_CONF]))
                .await
            {
                Ok(_) => true,
                Err(e) => {
                    absent_or_error(e, NO_SUCH_FILE)?;
                    false
                }
            };
        }
    }
    Ok(())
}

async fn check_is_db_created(runner: &dyn PodRunner, vdb: &VerticaDB, pf: &mut PodFact) -> Result<()> {
    let db = &vdb.spec.db_name;
    let cmd = command(&[
        "bash",
        "-c",
        &format!("ls -d {}/{db}/v_{db}_node????_data", vdb.spec.local.data_path),
    ]);
    match runner.exec_in_pod(&pf.name, SERVER_CONTAINER, &cmd).await {
        Ok(out) => {
            pf.db_exists = TriState::True;
            pf.vnode_name = parse_vnode_name(&out.stdout)?;
        }
        Err(e) => {
            absent_or_error(e, NO_SUCH_FILE)?;
            pf.db_exists = TriState::False;
        }
    }
    Ok(())
}

async fn check_if_node_is_up(runner: &dyn PodRunner, pf: &mut PodFact) -> Result<()> {
    if pf.db_exists.is_false() {
        pf.up_node = false;
        return Ok(());
    }
    match runner.exec_vsql(&pf.name, &command(&["-c", "select 1"])).await {
        Ok(_) => pf.up_node = true,
        Err(e) => {
            absent_or_error(e, VSQL_NOT_CONNECTED)?;
            pf.up_node = false;
        }
    }
    Ok(())
}

async fn check_eula_acceptance(runner: &dyn PodRunner, pf: &mut PodFact) -> Result<()> {
    match runner
        .exec_in_pod(&pf.name, SERVER_CONTAINER, &command(&["cat", EULA_ACCEPTANCE_FILE]))
        .await
    {
        Ok(_) => pf.eula_accepted = TriState::True,
        Err(e) => {
            absent_or_error(e, &format!("cat: {EULA_ACCEPTANCE_FILE}: {NO_SUCH_FILE}"))?;
            pf.eula_accepted = TriState::False;
        }
    }
    Ok(())
}

/// Config directory probes never fail collection.
async fn probe_succeeds(runner: &dyn PodRunner, pod: &str, cmd: &[&str]) -> bool {
    runner
        .exec_in_pod(pod, SERVER_CONTAINER, &command(cmd))
        .await
        .is_ok()
}
