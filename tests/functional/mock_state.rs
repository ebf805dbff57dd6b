//! In-memory cluster for driving the reconcilers without Kubernetes.
//!
//! [`MockCluster`] stands in for both the API server and the pods. It keeps
//! the objects of one namespace plus a small model of what vertica is doing
//! in each pod, and answers the probes and admintools calls the reconcilers
//! make from that model.
//!
//! The model is deliberately coarse:
//! - Deleting a pod behaves like the StatefulSet controller with an OnDelete
//!   strategy: the pod comes straight back with the template image and a new
//!   IP, and vertica on it is down.
//! - Creating a StatefulSet schedules its pods on the template image. Their
//!   vertica is not installed until the installer and db_add_node run.
//! - `stop_db`, `start_db`, `restart_node` and `re_ip` flip node state and
//!   rewrite the IPs recorded in admintools.conf.
//! - Every command is logged so tests can assert on what was run.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerStatus, Pod, PodSpec, PodStatus, PodTemplateSpec, Secret, Service,
    ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::ResourceExt;

use vertica_operator::client::paths::{
    ADMINTOOLS_BIN, ADMINTOOLS_CONF, EULA_ACCEPTANCE_FILE, SERVER_CONTAINER, UPDATE_VERTICA_BIN,
    VERTICA_BIN,
};
use vertica_operator::client::{ClusterApi, ExecError, ExecOutput, PodRunner};
use vertica_operator::controller::error::{Error, Result};
use vertica_operator::controller::events::{EventKind, EventRecorder};
use vertica_operator::controller::image_change::statefulset_image;
use vertica_operator::controller::names::{
    SUBCLUSTER_NAME_LABEL, external_service_name, headless_service_name, pod_name,
    selector_for_service_name_routing, statefulset_name, subcluster_labels,
};
use vertica_operator::controller::pipeline::ClusterScope;
use vertica_operator::controller::restart::NODES_NOT_DOWN_MSG;
use vertica_operator::crd::{Subcluster, VERSION_ANNOTATION, VerticaDB, VerticaDBSpec};

pub const NAMESPACE: &str = "vertica";
pub const VDB_NAME: &str = "vertdb";
pub const VDB_UID: &str = "ee65657f-a5f3-4f2e-b3c6-5a1e3f1c7e10";
pub const OLD_IMAGE: &str = "vertica/vertica-k8s:11.1.0-0";
pub const NEW_IMAGE: &str = "vertica/vertica-k8s:12.0.0-0";

const NO_SUCH_FILE: &str = "No such file or directory";
const NO_SUBCLUSTER_FOUND: &str = "No subcluster found";

// ============================================================================
// Fixtures
// ============================================================================

pub fn subcluster(name: &str, size: i32, is_primary: bool) -> Subcluster {
    Subcluster {
        name: name.to_string(),
        size,
        is_primary,
        ..Default::default()
    }
}

/// A VerticaDB asking for [`NEW_IMAGE`], with the server version of
/// [`OLD_IMAGE`] already recorded.
pub fn vdb(subclusters: Vec<Subcluster>) -> VerticaDB {
    let mut vdb = VerticaDB::new(
        VDB_NAME,
        VerticaDBSpec {
            image: NEW_IMAGE.to_string(),
            subclusters,
            ..Default::default()
        },
    );
    vdb.metadata.namespace = Some(NAMESPACE.to_string());
    vdb.metadata.uid = Some(VDB_UID.to_string());
    vdb.metadata.annotations = Some(BTreeMap::from([(
        VERSION_ANNOTATION.to_string(),
        "v11.1.0".to_string(),
    )]));
    vdb
}

fn server_container(image: &str) -> Container {
    Container {
        name: SERVER_CONTAINER.to_string(),
        image: Some(image.to_string()),
        ..Default::default()
    }
}

pub fn statefulset(vdb: &VerticaDB, sc: &Subcluster, image: &str) -> StatefulSet {
    let labels = subcluster_labels(vdb, sc);
    StatefulSet {
        metadata: ObjectMeta {
            name: Some(statefulset_name(vdb, sc)),
            namespace: Some(NAMESPACE.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(sc.size),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            service_name: Some(headless_service_name(vdb)),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![server_container(image)],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

fn running_pod(name: &str, labels: BTreeMap<String, String>, image: &str, ip: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![server_container(image)],
            hostname: Some(name.to_string()),
            subdomain: Some(VDB_NAME.to_string()),
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            pod_ip: Some(ip.to_string()),
            container_statuses: Some(vec![ContainerStatus {
                name: SERVER_CONTAINER.to_string(),
                image: image.to_string(),
                ready: true,
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

/// Labels the pods of a StatefulSet are created with.
fn template_labels(sts: &StatefulSet) -> BTreeMap<String, String> {
    sts.spec
        .as_ref()
        .and_then(|s| s.template.metadata.as_ref())
        .and_then(|m| m.labels.clone())
        .unwrap_or_default()
}

/// StatefulSet a pod belongs to, going by its name.
fn owning_statefulset(pod: &str) -> &str {
    pod.rsplit_once('-').map_or(pod, |(sts, _)| sts)
}

/// Value following `flag` in an argument list.
fn arg_after<'a>(args: &[&'a str], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| *a == flag)
        .and_then(|i| args.get(i + 1))
        .copied()
}

fn service(vdb: &VerticaDB, sc: &Subcluster) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(external_service_name(vdb, sc)),
            namespace: Some(NAMESPACE.to_string()),
            labels: Some(subcluster_labels(vdb, sc)),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(selector_for_service_name_routing(vdb, sc)),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn matches_selector(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.split_once('='))
        .all(|(k, v)| labels.get(k).map(String::as_str) == Some(v))
}

// ============================================================================
// Cluster model
// ============================================================================

/// What vertica looks like inside one pod. Survives pod deletion, like the
/// data on a persistent volume.
#[derive(Debug, Clone, Default)]
pub struct VerticaNode {
    /// Name assigned at install time, e.g. `node0001`.
    pub compat21: String,
    /// Name vertica knows the node by, e.g. `v_vertdb_node0001`.
    pub vnode: String,
    pub installed: bool,
    pub db_exists: bool,
    pub up: bool,
}

/// Objects and vertica state of one namespace.
#[derive(Debug, Default)]
pub struct MockClusterState {
    pub vdb: Option<VerticaDB>,
    pub statefulsets: BTreeMap<String, StatefulSet>,
    pub pods: BTreeMap<String, Pod>,
    pub services: BTreeMap<String, Service>,
    pub secrets: BTreeMap<String, Secret>,
    /// Vertica state keyed by pod name.
    pub nodes: BTreeMap<String, VerticaNode>,
    /// IPs in admintools.conf, keyed by compat21 node name.
    pub conf_ips: BTreeMap<String, String>,
    /// Client sessions per subcluster.
    pub sessions: BTreeMap<String, u32>,
    /// Subclusters known to the database catalog.
    pub db_subclusters: BTreeSet<String>,
    /// Database nodes the license allows. db_add_node fails beyond it.
    pub license_node_limit: Option<usize>,
    /// Server version reported for each image.
    pub versions: BTreeMap<String, String>,
    /// Number of upcoming `restart_node` calls that fail because vertica
    /// still thinks the nodes are up.
    pub restart_node_refusals: u32,
    /// Keep deleted pods gone until [`MockCluster::release_deleted_pods`].
    pub hold_deleted_pods: bool,
    held_pods: Vec<(String, BTreeMap<String, String>)>,
    /// Every command run in a pod, in order.
    pub commands: Vec<(String, Vec<String>)>,
    next_ip: u32,
}

impl MockClusterState {
    fn allocate_ip(&mut self) -> String {
        self.next_ip += 1;
        format!("10.244.{}.{}", 1 + self.next_ip / 250, self.next_ip % 250)
    }

    fn pod_ip(&self, pod: &str) -> Option<String> {
        self.pods
            .get(pod)
            .and_then(|p| p.status.as_ref())
            .and_then(|s| s.pod_ip.clone())
    }

    fn pod_with_ip(&self, ip: &str) -> Option<String> {
        self.pods
            .keys()
            .find(|p| self.pod_ip(p).as_deref() == Some(ip))
            .cloned()
    }

    /// Next free compat21 name in admintools.conf.
    fn next_compat21(&self) -> String {
        let last = self
            .conf_ips
            .keys()
            .filter_map(|n| n.strip_prefix("node")?.parse::<u32>().ok())
            .max()
            .unwrap_or(0);
        format!("node{:04}", last + 1)
    }

    fn is_running(&self, pod: &str) -> bool {
        self.pods
            .get(pod)
            .and_then(|p| p.status.as_ref())
            .and_then(|s| s.phase.as_deref())
            == Some("Running")
    }

    /// Bring a deleted pod back from its StatefulSet template.
    fn reschedule(&mut self, name: &str, labels: BTreeMap<String, String>) {
        let Some(sts) = self.statefulsets.get(owning_statefulset(name)) else {
            return;
        };
        let image = statefulset_image(sts);
        let ip = self.allocate_ip();
        self.pods
            .insert(name.to_string(), running_pod(name, labels, &image, &ip));
        if let Some(node) = self.nodes.get_mut(name) {
            node.up = false;
        }
    }

    fn exec(&mut self, pod: &str, cmd: &[String]) -> std::result::Result<ExecOutput, ExecError> {
        self.commands.push((pod.to_string(), cmd.to_vec()));
        if !self.is_running(pod) {
            return Err(ExecError::new(pod, "pod is not running"));
        }
        let node = self.nodes.get(pod).cloned().unwrap_or_default();
        let args: Vec<&str> = cmd.iter().map(String::as_str).collect();
        match args.as_slice() {
            ["cat", path] if *path == EULA_ACCEPTANCE_FILE => Ok(ExecOutput::default()),
            ["cat", path] if path.contains("install-indicator-") => {
                if node.installed {
                    Ok(ExecOutput::new(format!("{}\n", node.compat21), ""))
                } else {
                    Err(missing_file(pod, &format!("cat: {path}: {NO_SUCH_FILE}")))
                }
            }
            ["rm", path] if path.contains("install-indicator-") => {
                if let Some(node) = self.nodes.get_mut(pod) {
                    node.installed = false;
                }
                Ok(ExecOutput::default())
            }
            ["sudo", bin, "--add-hosts", ips, ..] if *bin == UPDATE_VERTICA_BIN => {
                for ip in ips.split(',') {
                    let compat21 = self.next_compat21();
                    self.conf_ips.insert(compat21, ip.to_string());
                }
                Ok(ExecOutput::new("Installation complete\n", ""))
            }
            ["sudo", bin, "--remove-hosts", hosts, ..] if *bin == UPDATE_VERTICA_BIN => {
                for host in hosts.split(',') {
                    let name = host.split('.').next().unwrap_or_default();
                    if let Some(node) = self.nodes.get(name) {
                        self.conf_ips.remove(&node.compat21);
                    }
                }
                Ok(ExecOutput::new("Removal complete\n", ""))
            }
            ["ls", path] if *path == ADMINTOOLS_CONF => {
                if node.installed {
                    Ok(ExecOutput::new(format!("{path}\n"), ""))
                } else {
                    Err(missing_file(pod, &format!("ls: cannot access '{path}': {NO_SUCH_FILE}")))
                }
            }
            ["bash", "-c", script] => self.run_script(pod, &node, script),
            [bin, "--version"] if *bin == VERTICA_BIN => Ok(self.version_output(pod)),
            [bin, rest @ ..] if *bin == ADMINTOOLS_BIN => self.admintools(pod, rest),
            ["vsql", rest @ ..] => self.vsql(pod, &node, rest),
            _ => Ok(ExecOutput::default()),
        }
    }

    fn run_script(
        &mut self,
        pod: &str,
        node: &VerticaNode,
        script: &str,
    ) -> std::result::Result<ExecOutput, ExecError> {
        if script.contains("grep --regexp='^node[0-9]'") {
            let lines: String = self
                .conf_ips
                .iter()
                .map(|(n, ip)| format!("{n} = {ip},/data,/data\n"))
                .collect();
            return Ok(ExecOutput::new(lines, ""));
        }
        if let Some(rest) = script.strip_prefix("grep -E '^node[0-9]{4} = ") {
            let ip = rest.split(',').next().unwrap_or_default();
            let lines: String = self
                .conf_ips
                .iter()
                .filter(|(_, i)| *i == ip)
                .map(|(n, i)| format!("{n} = {i},/data,/data\n"))
                .collect();
            if lines.is_empty() {
                return Err(ExecError::new(pod, "exit 1"));
            }
            return Ok(ExecOutput::new(lines, ""));
        }
        if let Some(rest) = script.strip_prefix("echo ")
            && rest.contains("install-indicator-")
        {
            let compat21 = rest.split_whitespace().next().unwrap_or_default();
            let entry = self.nodes.entry(pod.to_string()).or_default();
            entry.compat21 = compat21.to_string();
            entry.installed = true;
            return Ok(ExecOutput::default());
        }
        if script.starts_with("ls -d ") {
            if node.db_exists {
                return Ok(ExecOutput::new(format!("/data/{VDB_NAME}/{}_data\n", node.vnode), ""));
            }
            return Err(missing_file(
                pod,
                &format!("ls: cannot access '/data/{VDB_NAME}/v_{VDB_NAME}_node????_data': {NO_SUCH_FILE}"),
            ));
        }
        Ok(ExecOutput::default())
    }

    fn version_output(&self, pod: &str) -> ExecOutput {
        let image = self
            .pods
            .get(pod)
            .map(vertica_operator::controller::pod_facts::server_image)
            .unwrap_or_default();
        let version = self
            .versions
            .get(&image)
            .cloned()
            .unwrap_or_else(|| "v11.1.0-0".to_string());
        ExecOutput::new(
            format!(
                "Vertica Analytic Database {version}\n\
                 vertica({version}) built by @re-docker5 from master@ae6ac4d on 'Thu Jan 13 21:29:58 UTC 2022' $BuildId$\n"
            ),
            "",
        )
    }

    fn vsql(
        &mut self,
        pod: &str,
        node: &VerticaNode,
        args: &[&str],
    ) -> std::result::Result<ExecOutput, ExecError> {
        if !node.up {
            return Err(ExecError::new(pod, "exit 2").with_output(ExecOutput::new(
                "",
                "vsql: could not connect to server: Connection refused\n",
            )));
        }
        let query = args.last().copied().unwrap_or_default();
        if query.contains("count(session_id)") {
            let sc = query
                .split("subcluster_name = '")
                .nth(1)
                .and_then(|rest| rest.split('\'').next())
                .unwrap_or_default();
            let count = self.sessions.get(sc).copied().unwrap_or(0);
            return Ok(ExecOutput::new(format!("{count}\n"), ""));
        }
        if query.contains("from subclusters") {
            let names: String = self.db_subclusters.iter().map(|s| format!("{s}\n")).collect();
            return Ok(ExecOutput::new(names, ""));
        }
        Ok(ExecOutput::new("1\n", ""))
    }

    fn admintools(&mut self, pod: &str, args: &[&str]) -> std::result::Result<ExecOutput, ExecError> {
        let tool = args
            .iter()
            .position(|a| *a == "-t")
            .and_then(|i| args.get(i + 1))
            .copied()
            .unwrap_or_default();
        let option = |name: &str| {
            args.iter()
                .find_map(|a| a.strip_prefix(&format!("--{name}=")).map(str::to_string))
        };
        match tool {
            "list_allnodes" => {
                let mut out = String::from(
                    " Node          | Host       | State | Version                 | DB\n\
                     ---------------+------------+-------+-------------------------+----\n",
                );
                for (name, node) in self.nodes.iter().filter(|(_, n)| n.db_exists) {
                    let ip = self.pod_ip(name).unwrap_or_default();
                    let state = if node.up { "UP" } else { "DOWN" };
                    out.push_str(&format!(
                        " {} | {} | {} | vertica-11.1.0.0 | {VDB_NAME}\n",
                        node.vnode, ip, state
                    ));
                }
                Ok(ExecOutput::new(out, ""))
            }
            "stop_db" => {
                for node in self.nodes.values_mut() {
                    node.up = false;
                }
                Ok(ExecOutput::new("Database vertdb stopped successfully\n", ""))
            }
            "start_db" => {
                let running: Vec<String> = self
                    .nodes
                    .keys()
                    .filter(|p| self.is_running(p))
                    .cloned()
                    .collect();
                for name in running {
                    if let Some(node) = self.nodes.get_mut(&name)
                        && node.db_exists
                    {
                        node.up = true;
                    }
                }
                Ok(ExecOutput::new("Database vertdb: Startup Succeeded.\n", ""))
            }
            "restart_node" => {
                if self.restart_node_refusals > 0 {
                    self.restart_node_refusals -= 1;
                    return Err(ExecError::new(pod, "exit 1")
                        .with_output(ExecOutput::new(format!("{NODES_NOT_DOWN_MSG}\n"), "")));
                }
                let hosts = option("hosts").unwrap_or_default();
                let vnodes: Vec<&str> = hosts.split(',').collect();
                let restarted: Vec<String> = self
                    .nodes
                    .iter()
                    .filter(|(_, n)| vnodes.contains(&n.vnode.as_str()))
                    .map(|(p, _)| p.clone())
                    .collect();
                for name in restarted {
                    let ip = self.pod_ip(&name).unwrap_or_default();
                    if let Some(node) = self.nodes.get_mut(&name) {
                        node.up = true;
                        self.conf_ips.insert(node.compat21.clone(), ip);
                    }
                }
                Ok(ExecOutput::new("Restart succeeded\n", ""))
            }
            "db_add_subcluster" => {
                let sc = arg_after(args, "--subcluster").unwrap_or_default();
                self.db_subclusters.insert(sc.to_string());
                Ok(ExecOutput::new(format!("Subcluster added: {sc}\n"), ""))
            }
            "db_remove_subcluster" => {
                let sc = arg_after(args, "--subcluster").unwrap_or_default();
                if !self.db_subclusters.remove(sc) {
                    return Err(ExecError::new(pod, "exit 1")
                        .with_output(ExecOutput::new(format!("{NO_SUBCLUSTER_FOUND}\n"), "")));
                }
                let sts = format!("{VDB_NAME}-{sc}");
                for (name, node) in self.nodes.iter_mut() {
                    if owning_statefulset(name) == sts {
                        node.db_exists = false;
                        node.up = false;
                    }
                }
                Ok(ExecOutput::new(format!("Subcluster removed: {sc}\n"), ""))
            }
            "db_add_node" => {
                let db_nodes = self.nodes.values().filter(|n| n.db_exists).count();
                if let Some(limit) = self.license_node_limit
                    && db_nodes >= limit
                {
                    return Err(ExecError::new(pod, "exit 1").with_output(ExecOutput::new(
                        format!(
                            "Cannot create another node. The current license permits {limit} node(s) and the database catalog already contains {db_nodes} node(s)\n"
                        ),
                        "",
                    )));
                }
                let ip = arg_after(args, "--hosts").unwrap_or_default();
                let Some(name) = self.pod_with_ip(ip) else {
                    return Err(ExecError::new(pod, "exit 1"));
                };
                let node = self.nodes.entry(name).or_default();
                node.vnode = format!("v_{VDB_NAME}_{}", node.compat21);
                node.db_exists = true;
                node.up = true;
                Ok(ExecOutput::new("Node added\n", ""))
            }
            "re_ip" => {
                let installed: Vec<(String, String)> = self
                    .nodes
                    .iter()
                    .filter(|(_, n)| n.installed)
                    .map(|(p, n)| (p.clone(), n.compat21.clone()))
                    .collect();
                for (name, compat21) in installed {
                    if let Some(ip) = self.pod_ip(&name) {
                        self.conf_ips.insert(compat21, ip);
                    }
                }
                Ok(ExecOutput::new("IP addresses updated\n", ""))
            }
            _ => Ok(ExecOutput::default()),
        }
    }
}

fn missing_file(pod: &str, stderr: &str) -> ExecError {
    ExecError::new(pod, "exit 1").with_output(ExecOutput::new("", stderr))
}

// ============================================================================
// Handle
// ============================================================================

/// Shared handle on a [`MockClusterState`]. Implements both [`ClusterApi`]
/// and [`PodRunner`].
#[derive(Clone, Default)]
pub struct MockCluster {
    state: Arc<Mutex<MockClusterState>>,
}

impl MockCluster {
    /// A cluster where `vdb` is installed and up on `image` with one pod per
    /// slot of every subcluster in its spec.
    pub fn running(vdb: &VerticaDB, image: &str) -> Self {
        let cluster = Self::default();
        {
            let mut state = cluster.state();
            state.vdb = Some(vdb.clone());
            state.versions.insert(OLD_IMAGE.to_string(), "v11.1.0-0".to_string());
            state.versions.insert(NEW_IMAGE.to_string(), "v12.0.0-0".to_string());
            let mut node_index = 0;
            for sc in &vdb.spec.subclusters {
                let sts = statefulset(vdb, sc, image);
                let sts_name = sts.name_any();
                state.statefulsets.insert(sts_name.clone(), sts);
                let svc = service(vdb, sc);
                state.services.insert(svc.name_any(), svc);
                state.db_subclusters.insert(sc.name.clone());
                for index in 0..sc.size {
                    node_index += 1;
                    let name = pod_name(&sts_name, index);
                    let ip = state.allocate_ip();
                    let pod = running_pod(&name, subcluster_labels(vdb, sc), image, &ip);
                    state.pods.insert(name.clone(), pod);
                    let compat21 = format!("node{node_index:04}");
                    state.conf_ips.insert(compat21.clone(), ip);
                    state.nodes.insert(
                        name,
                        VerticaNode {
                            vnode: format!("v_{}_{compat21}", vdb.spec.db_name),
                            compat21,
                            installed: true,
                            db_exists: true,
                            up: true,
                        },
                    );
                }
            }
        }
        cluster
    }

    pub fn state(&self) -> MutexGuard<'_, MockClusterState> {
        self.state.lock().unwrap()
    }

    /// The VerticaDB as last written.
    pub fn vdb(&self) -> VerticaDB {
        self.state().vdb.clone().unwrap()
    }

    /// A fresh scope over this cluster, as a new reconcile pass would build.
    pub fn scope(&self, events: &Arc<MockEvents>) -> ClusterScope {
        ClusterScope::new(
            Arc::new(self.clone()),
            Arc::new(self.clone()),
            events.clone(),
            self.vdb(),
        )
    }

    pub fn pod_image(&self, pod: &str) -> String {
        self.state()
            .pods
            .get(pod)
            .map(vertica_operator::controller::pod_facts::server_image)
            .unwrap_or_default()
    }

    pub fn pod_ip(&self, pod: &str) -> String {
        self.state().pod_ip(pod).unwrap_or_default()
    }

    pub fn node(&self, pod: &str) -> VerticaNode {
        self.state().nodes.get(pod).cloned().unwrap_or_default()
    }

    pub fn set_node_up(&self, pod: &str, up: bool) {
        if let Some(node) = self.state().nodes.get_mut(pod) {
            node.up = up;
        }
    }

    pub fn set_sessions(&self, subcluster: &str, count: u32) {
        self.state().sessions.insert(subcluster.to_string(), count);
    }

    /// Delete every pod and let it come back with a new IP.
    pub fn reschedule_all_pods(&self) {
        let mut state = self.state();
        let pods: Vec<(String, BTreeMap<String, String>)> = state
            .pods
            .values()
            .map(|p| (p.name_any(), p.labels().clone()))
            .collect();
        for (name, labels) in pods {
            state.pods.remove(&name);
            state.reschedule(&name, labels);
        }
    }

    /// Let the platform recreate the pods deleted while they were held.
    pub fn release_deleted_pods(&self) {
        let mut state = self.state();
        state.hold_deleted_pods = false;
        for (name, labels) in std::mem::take(&mut state.held_pods) {
            state.reschedule(&name, labels);
        }
    }

    pub fn service_selector(&self, name: &str) -> BTreeMap<String, String> {
        self.state()
            .services
            .get(name)
            .and_then(|s| s.spec.as_ref())
            .and_then(|s| s.selector.clone())
            .unwrap_or_default()
    }

    /// Number of `admintools -t <tool>` calls made so far.
    pub fn admintools_calls(&self, tool: &str) -> usize {
        self.state()
            .commands
            .iter()
            .filter(|(_, cmd)| {
                cmd.first().map(String::as_str) == Some(ADMINTOOLS_BIN)
                    && cmd.windows(2).any(|w| w[0] == "-t" && w[1] == tool)
            })
            .count()
    }
}

#[async_trait]
impl ClusterApi for MockCluster {
    async fn get_vdb(&self, name: &str) -> Result<Option<VerticaDB>> {
        Ok(self.state().vdb.clone().filter(|v| v.name_any() == name))
    }

    async fn replace_vdb(&self, vdb: &VerticaDB) -> Result<VerticaDB> {
        let mut state = self.state();
        let mut stored = vdb.clone();
        stored.status = state.vdb.as_ref().and_then(|v| v.status.clone());
        state.vdb = Some(stored.clone());
        Ok(stored)
    }

    async fn replace_vdb_status(&self, vdb: &VerticaDB) -> Result<VerticaDB> {
        let mut state = self.state();
        let stored = state
            .vdb
            .as_mut()
            .ok_or_else(|| Error::Transient("vdb not found".to_string()))?;
        stored.status = vdb.status.clone();
        Ok(stored.clone())
    }

    async fn get_statefulset(&self, name: &str) -> Result<Option<StatefulSet>> {
        Ok(self.state().statefulsets.get(name).cloned())
    }

    async fn list_statefulsets(&self, label_selector: &str) -> Result<Vec<StatefulSet>> {
        Ok(self
            .state()
            .statefulsets
            .values()
            .filter(|s| matches_selector(s.labels(), label_selector))
            .cloned()
            .collect())
    }

    async fn create_statefulset(&self, sts: &StatefulSet) -> Result<StatefulSet> {
        let mut state = self.state();
        let name = sts.name_any();
        state.statefulsets.insert(name.clone(), sts.clone());
        let replicas = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
        for index in 0..replicas {
            let pod = pod_name(&name, index);
            if state.hold_deleted_pods {
                state.held_pods.push((pod, template_labels(sts)));
            } else {
                state.reschedule(&pod, template_labels(sts));
            }
        }
        Ok(sts.clone())
    }

    async fn replace_statefulset(&self, sts: &StatefulSet) -> Result<StatefulSet> {
        let mut state = self.state();
        if !state.statefulsets.contains_key(&sts.name_any()) {
            return Err(Error::Transient(format!("statefulset {} not found", sts.name_any())));
        }
        state.statefulsets.insert(sts.name_any(), sts.clone());
        Ok(sts.clone())
    }

    async fn delete_statefulset(&self, name: &str) -> Result<()> {
        let mut state = self.state();
        state.statefulsets.remove(name);
        state.pods.retain(|p, _| owning_statefulset(p) != name);
        state.nodes.retain(|p, _| owning_statefulset(p) != name);
        state.held_pods.retain(|(p, _)| owning_statefulset(p) != name);
        Ok(())
    }

    async fn get_pod(&self, name: &str) -> Result<Option<Pod>> {
        Ok(self.state().pods.get(name).cloned())
    }

    async fn list_pods(&self, label_selector: &str) -> Result<Vec<Pod>> {
        Ok(self
            .state()
            .pods
            .values()
            .filter(|p| matches_selector(p.labels(), label_selector))
            .cloned()
            .collect())
    }

    async fn delete_pod(&self, name: &str) -> Result<()> {
        let mut state = self.state();
        if let Some(pod) = state.pods.remove(name) {
            if state.hold_deleted_pods {
                state.held_pods.push((name.to_string(), pod.labels().clone()));
            } else {
                state.reschedule(name, pod.labels().clone());
            }
        }
        Ok(())
    }

    async fn get_service(&self, name: &str) -> Result<Option<Service>> {
        Ok(self.state().services.get(name).cloned())
    }

    async fn list_services(&self, label_selector: &str) -> Result<Vec<Service>> {
        Ok(self
            .state()
            .services
            .values()
            .filter(|s| matches_selector(s.labels(), label_selector))
            .cloned()
            .collect())
    }

    async fn replace_service(&self, svc: &Service) -> Result<Service> {
        self.state().services.insert(svc.name_any(), svc.clone());
        Ok(svc.clone())
    }

    async fn get_secret(&self, name: &str) -> Result<Option<Secret>> {
        Ok(self.state().secrets.get(name).cloned())
    }
}

#[async_trait]
impl PodRunner for MockCluster {
    async fn exec_in_pod(
        &self,
        pod: &str,
        _container: &str,
        command: &[String],
    ) -> std::result::Result<ExecOutput, ExecError> {
        self.state().exec(pod, command)
    }

    async fn copy_to_pod(
        &self,
        pod: &str,
        _container: &str,
        local_path: &Path,
        remote_path: &str,
    ) -> std::result::Result<ExecOutput, ExecError> {
        let cmd = vec![
            "cp".to_string(),
            local_path.display().to_string(),
            remote_path.to_string(),
        ];
        self.state().exec(pod, &cmd)
    }

    fn password(&self) -> Option<&str> {
        None
    }
}

// ============================================================================
// Events
// ============================================================================

/// A recorded event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub kind: EventKind,
    pub reason: String,
    pub message: String,
}

/// [`EventRecorder`] that keeps every event in memory.
#[derive(Debug, Default)]
pub struct MockEvents {
    events: Mutex<Vec<RecordedEvent>>,
}

impl MockEvents {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn all(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.all().into_iter().map(|e| e.reason).collect()
    }

    pub fn count(&self, reason: &str) -> usize {
        self.all().iter().filter(|e| e.reason == reason).count()
    }
}

#[async_trait]
impl EventRecorder for MockEvents {
    async fn record(&self, _vdb: &VerticaDB, kind: EventKind, reason: &str, message: String) {
        self.events.lock().unwrap().push(RecordedEvent {
            kind,
            reason: reason.to_string(),
            message,
        });
    }
}

/// Pods of a subcluster, in ordinal order.
pub fn pods_of(vdb: &VerticaDB, sc_name: &str) -> Vec<String> {
    vdb.spec
        .subclusters
        .iter()
        .filter(|sc| sc.name == sc_name)
        .flat_map(|sc| {
            let sts = statefulset_name(vdb, sc);
            (0..sc.size).map(move |i| pod_name(&sts, i))
        })
        .collect()
}

/// Whether `labels` route to the named subcluster.
pub fn routes_to(selector: &BTreeMap<String, String>, sc_name: &str) -> bool {
    selector.get(SUBCLUSTER_NAME_LABEL).map(String::as_str) == Some(sc_name)
}
