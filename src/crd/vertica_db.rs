//! VerticaDB Custom Resource Definition.
//!
//! Declares the desired state of a Vertica cluster: the server image, the
//! subclusters that make up the database, and the policies that govern how
//! the operator restarts the cluster and moves it to a new image.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Annotation holding the Vertica version reported by the server binary.
pub const VERSION_ANNOTATION: &str = "vertica.com/version";
/// Annotation holding the build date reported by the server binary.
pub const BUILD_DATE_ANNOTATION: &str = "vertica.com/buildDate";
/// Annotation holding the build reference reported by the server binary.
pub const BUILD_REF_ANNOTATION: &str = "vertica.com/buildRef";

/// Name used for the transient subcluster when the template leaves it blank.
pub const DEFAULT_TRANSIENT_SUBCLUSTER_NAME: &str = "transient";

/// VerticaDB is a custom resource describing a Vertica Eon database.
///
/// Example:
/// ```yaml
/// apiVersion: vertica.com/v1beta1
/// kind: VerticaDB
/// metadata:
///   name: vertdb
/// spec:
///   image: vertica/vertica-k8s:11.1.0-0
///   imageChangePolicy: Online
///   subclusters:
///     - name: main
///       size: 3
///       isPrimary: true
///   temporarySubclusterRouting:
///     template:
///       name: transient
///       size: 1
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "vertica.com",
    version = "v1beta1",
    kind = "VerticaDB",
    plural = "verticadbs",
    shortname = "vdb",
    status = "VerticaDBStatus",
    namespaced,
    printcolumn = r#"{"name":"Subclusters", "type":"integer", "jsonPath":".status.subclusterCount"}"#,
    printcolumn = r#"{"name":"Installed", "type":"integer", "jsonPath":".status.installCount"}"#,
    printcolumn = r#"{"name":"DBAdded", "type":"integer", "jsonPath":".status.addedToDBCount"}"#,
    printcolumn = r#"{"name":"Up", "type":"integer", "jsonPath":".status.upNodeCount"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VerticaDBSpec {
    /// Vertica server image. Changing it triggers an image change.
    #[serde(default = "default_image")]
    pub image: String,

    /// Name of the database.
    #[serde(default = "default_db_name")]
    pub db_name: String,

    /// Restart the vertica process when it goes down.
    #[serde(default = "default_true")]
    pub auto_restart_vertica: bool,

    /// How the database comes into existence.
    #[serde(default)]
    pub init_policy: InitPolicy,

    /// Strategy used when the image changes.
    #[serde(default)]
    pub image_change_policy: ImageChangePolicy,

    /// Skip the upgrade-path check during an online image change.
    #[serde(default)]
    pub ignore_upgrade_path: bool,

    /// Pass --ignore-cluster-lease to start_db.
    #[serde(default)]
    pub ignore_cluster_lease: bool,

    /// Timeout in seconds handed to start_db and restart_node. Zero leaves
    /// the admintools default.
    #[serde(default)]
    pub restart_timeout: i32,

    /// Fixed requeue delay in seconds. Zero uses exponential backoff.
    #[serde(default)]
    pub requeue_time: i32,

    /// Fault tolerance of the database.
    #[serde(default)]
    pub k_safety: KSafety,

    /// Secret holding the license. Online image change in Auto mode needs one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license_secret: Option<String>,

    /// Secret holding the superuser password under the key `password`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superuser_password_secret: Option<String>,

    /// Local storage paths inside the pod.
    #[serde(default)]
    pub local: LocalStorage,

    /// Subclusters that make up the database.
    #[serde(default)]
    pub subclusters: Vec<Subcluster>,

    /// Where client traffic goes while a subcluster is offline during an
    /// online image change.
    #[serde(default)]
    pub temporary_subcluster_routing: SubclusterSelection,
}

impl Default for VerticaDBSpec {
    fn default() -> Self {
        Self {
            image: default_image(),
            db_name: default_db_name(),
            auto_restart_vertica: true,
            init_policy: InitPolicy::default(),
            image_change_policy: ImageChangePolicy::default(),
            ignore_upgrade_path: false,
            ignore_cluster_lease: false,
            restart_timeout: 0,
            requeue_time: 0,
            k_safety: KSafety::default(),
            license_secret: None,
            superuser_password_secret: None,
            local: LocalStorage::default(),
            subclusters: vec![Subcluster::default()],
            temporary_subcluster_routing: SubclusterSelection::default(),
        }
    }
}

fn default_image() -> String {
    "vertica/vertica-k8s:11.0.1-0-minimal".to_string()
}

fn default_db_name() -> String {
    "vertdb".to_string()
}

fn default_true() -> bool {
    true
}

fn default_data_path() -> String {
    "/data".to_string()
}

/// Policy describing how the database is initialized.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize, JsonSchema)]
pub enum InitPolicy {
    /// The operator creates a new database.
    #[default]
    Create,
    /// The operator revives a database from communal storage.
    Revive,
    /// Only pods are scheduled; the database is managed externally.
    ScheduleOnly,
}

/// Strategy used to move the cluster to a new image.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize, JsonSchema)]
pub enum ImageChangePolicy {
    /// Pick online when the cluster qualifies, offline otherwise.
    #[default]
    Auto,
    /// Stop the whole cluster, swap the image, start it again.
    Offline,
    /// Restart one subcluster at a time while traffic is diverted.
    Online,
}

impl std::fmt::Display for ImageChangePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageChangePolicy::Auto => write!(f, "Auto"),
            ImageChangePolicy::Offline => write!(f, "Offline"),
            ImageChangePolicy::Online => write!(f, "Online"),
        }
    }
}

/// K-safety level of the database.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize, JsonSchema)]
pub enum KSafety {
    #[serde(rename = "0")]
    Zero,
    #[default]
    #[serde(rename = "1")]
    One,
}

/// Paths local to each pod.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalStorage {
    /// Directory holding the database data files.
    #[serde(default = "default_data_path")]
    pub data_path: String,
}

impl Default for LocalStorage {
    fn default() -> Self {
        Self {
            data_path: default_data_path(),
        }
    }
}

/// A named group of Vertica nodes backed by one StatefulSet.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Subcluster {
    /// Subcluster name as known to Vertica.
    pub name: String,

    /// Number of pods.
    #[serde(default)]
    pub size: i32,

    /// Primary subclusters form the quorum.
    #[serde(default)]
    pub is_primary: bool,

    /// Set only on the subcluster built for an online image change.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_transient: bool,

    /// Image to use instead of `spec.image`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_override: Option<String>,

    /// Name of the client service. Defaults to the subcluster name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
}

impl Subcluster {
    /// Name of the service routing client traffic to this subcluster.
    pub fn service_name(&self) -> &str {
        match self.service_name.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => &self.name,
        }
    }

    /// Value for the subcluster type label.
    pub fn type_label(&self) -> &'static str {
        if self.is_primary {
            PRIMARY_SUBCLUSTER_TYPE
        } else {
            SECONDARY_SUBCLUSTER_TYPE
        }
    }
}

/// Label value for primary subclusters.
pub const PRIMARY_SUBCLUSTER_TYPE: &str = "primary";
/// Label value for secondary subclusters.
pub const SECONDARY_SUBCLUSTER_TYPE: &str = "secondary";

/// Subclusters that take over client traffic during an online image change.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubclusterSelection {
    /// Existing subclusters to route to, in priority order.
    #[serde(default)]
    pub names: Vec<String>,

    /// Template for a transient subcluster created for the image change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<Subcluster>,
}

/// Observed state of a VerticaDB.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VerticaDBStatus {
    /// Pods where the installer has run.
    #[serde(default)]
    pub install_count: i32,
    /// Pods that are members of the database.
    #[serde(default)]
    pub added_to_db_count: i32,
    /// Pods with a vertica process accepting connections.
    #[serde(default)]
    pub up_node_count: i32,
    /// Number of subclusters in the spec.
    #[serde(default)]
    pub subcluster_count: i32,
    /// Per-subcluster counts.
    #[serde(default)]
    pub subclusters: Vec<SubclusterStatus>,
    /// Conditions of the database.
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Human readable phase of an image change in progress.
    #[serde(default)]
    pub image_change_status: String,
    /// Phase list of the image change in progress.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_change_progress: Option<ImageChangeProgress>,
}

/// Counts for a single subcluster.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubclusterStatus {
    pub name: String,
    pub install_count: i32,
    pub added_to_db_count: i32,
    pub up_node_count: i32,
}

/// Ordered phase messages of an image change and the one currently shown.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageChangeProgress {
    /// Every message the image change will post, in order.
    pub messages: Vec<String>,
    /// Index into `messages` of the current phase, -1 before the first.
    pub index: i32,
}

/// Condition describes the state of the database at a certain point.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition.
    pub r#type: String,
    /// Status of the condition ("True", "False", "Unknown").
    pub status: String,
    /// Machine-readable reason for the condition's last transition.
    #[serde(default)]
    pub reason: String,
    /// Human-readable message indicating details about last transition.
    #[serde(default)]
    pub message: String,
    /// Last time the condition transitioned from one status to another.
    #[serde(default)]
    pub last_transition_time: String,
}

impl Condition {
    /// Create a new condition.
    pub fn new(condition_type: ConditionType, status: bool, reason: &str) -> Self {
        Self {
            r#type: condition_type.to_string(),
            status: if status {
                "True".to_string()
            } else {
                "False".to_string()
            },
            reason: reason.to_string(),
            message: String::new(),
            last_transition_time: jiff::Timestamp::now().to_string(),
        }
    }

    /// True when the condition status is "True".
    pub fn is_true(&self) -> bool {
        self.status == "True"
    }
}

/// Types of conditions for VerticaDB.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum ConditionType {
    /// The operator restarts vertica when it goes down.
    AutoRestartVertica,
    /// An image change of any kind is underway.
    ImageChangeInProgress,
    /// An offline image change is underway.
    OfflineImageChangeInProgress,
    /// An online image change is underway.
    OnlineImageChangeInProgress,
}

impl std::fmt::Display for ConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConditionType::AutoRestartVertica => write!(f, "AutoRestartVertica"),
            ConditionType::ImageChangeInProgress => write!(f, "ImageChangeInProgress"),
            ConditionType::OfflineImageChangeInProgress => {
                write!(f, "OfflineImageChangeInProgress")
            }
            ConditionType::OnlineImageChangeInProgress => write!(f, "OnlineImageChangeInProgress"),
        }
    }
}

impl VerticaDB {
    /// Look up a condition by type.
    pub fn condition(&self, condition_type: ConditionType) -> Option<&Condition> {
        let wanted = condition_type.to_string();
        self.status
            .as_ref()
            .and_then(|s| s.conditions.iter().find(|c| c.r#type == wanted))
    }

    /// True when the given condition is set to "True".
    pub fn is_condition_set(&self, condition_type: ConditionType) -> bool {
        self.condition(condition_type).is_some_and(Condition::is_true)
    }

    /// Map of subcluster name to its spec.
    pub fn subcluster_map(&self) -> BTreeMap<&str, &Subcluster> {
        self.spec
            .subclusters
            .iter()
            .map(|sc| (sc.name.as_str(), sc))
            .collect()
    }

    /// Whether an online image change should stand up a transient subcluster.
    pub fn requires_transient_subcluster(&self) -> bool {
        self.spec
            .temporary_subcluster_routing
            .template
            .as_ref()
            .is_some_and(|t| !t.name.is_empty() && t.size > 0)
    }

    /// Build the transient subcluster. The image override is left unset when
    /// `image` is empty.
    pub fn build_transient_subcluster(&self, image: &str) -> Subcluster {
        let template = self.spec.temporary_subcluster_routing.template.as_ref();
        let name = template
            .map(|t| t.name.clone())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| DEFAULT_TRANSIENT_SUBCLUSTER_NAME.to_string());
        Subcluster {
            service_name: template.and_then(|t| t.service_name.clone()),
            name,
            size: template.map(|t| t.size).unwrap_or(0),
            is_primary: false,
            is_transient: true,
            image_override: (!image.is_empty()).then(|| image.to_string()),
        }
    }

    /// Version recorded in the annotations, if any.
    pub fn vertica_version(&self) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(VERSION_ANNOTATION))
            .map(String::as_str)
    }

    /// Image change status message, empty when none.
    pub fn image_change_status(&self) -> &str {
        self.status
            .as_ref()
            .map(|s| s.image_change_status.as_str())
            .unwrap_or("")
    }
}
