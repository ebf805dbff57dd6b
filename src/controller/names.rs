//! Object names, labels and selectors for VerticaDB resources.

use std::collections::BTreeMap;

use kube::ResourceExt;

use crate::crd::{Subcluster, VerticaDB};

pub const SUBCLUSTER_NAME_LABEL: &str = "vertica.com/subcluster-name";
pub const SUBCLUSTER_TYPE_LABEL: &str = "vertica.com/subcluster-type";
pub const SUBCLUSTER_SVC_NAME_LABEL: &str = "vertica.com/subcluster-svc";
pub const SUBCLUSTER_TRANSIENT_LABEL: &str = "vertica.com/subcluster-transient";
pub const VDB_INSTANCE_LABEL: &str = "app.kubernetes.io/instance";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const OPERATOR_NAME: &str = "verticadb-operator";

/// Name of the StatefulSet backing a subcluster.
pub fn statefulset_name(vdb: &VerticaDB, sc: &Subcluster) -> String {
    format!("{}-{}", vdb.name_any(), sc.name.replace('_', "-")).to_lowercase()
}

/// Name of the pod at `index` in a StatefulSet.
pub fn pod_name(sts_name: &str, index: i32) -> String {
    format!("{sts_name}-{index}")
}

/// Name of the client-facing service of a subcluster.
pub fn external_service_name(vdb: &VerticaDB, sc: &Subcluster) -> String {
    format!("{}-{}", vdb.name_any(), sc.service_name())
}

/// Name of the headless service giving pods stable DNS names.
pub fn headless_service_name(vdb: &VerticaDB) -> String {
    vdb.name_any()
}

/// Labels that every object of a VerticaDB carries.
pub fn operator_labels(vdb: &VerticaDB) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), OPERATOR_NAME.to_string()),
        (VDB_INSTANCE_LABEL.to_string(), vdb.name_any()),
    ])
}

/// Labels for objects that belong to one subcluster.
///
/// Transient subclusters never carry the service name label, since they
/// take traffic on behalf of whichever subcluster is offline.
pub fn subcluster_labels(vdb: &VerticaDB, sc: &Subcluster) -> BTreeMap<String, String> {
    let mut labels = operator_labels(vdb);
    labels.insert(SUBCLUSTER_NAME_LABEL.to_string(), sc.name.clone());
    labels.insert(SUBCLUSTER_TYPE_LABEL.to_string(), sc.type_label().to_string());
    labels.insert(
        SUBCLUSTER_TRANSIENT_LABEL.to_string(),
        sc.is_transient.to_string(),
    );
    if !sc.is_transient {
        labels.insert(
            SUBCLUSTER_SVC_NAME_LABEL.to_string(),
            sc.service_name().to_string(),
        );
    }
    labels
}

/// Service selector that picks every subcluster sharing a service name.
pub fn selector_for_service_name_routing(
    vdb: &VerticaDB,
    sc: &Subcluster,
) -> BTreeMap<String, String> {
    BTreeMap::from([
        (VDB_INSTANCE_LABEL.to_string(), vdb.name_any()),
        (
            SUBCLUSTER_SVC_NAME_LABEL.to_string(),
            sc.service_name().to_string(),
        ),
    ])
}

/// Service selector that picks exactly one subcluster by name.
pub fn selector_for_subcluster_name_routing(
    vdb: &VerticaDB,
    sc: &Subcluster,
) -> BTreeMap<String, String> {
    BTreeMap::from([
        (VDB_INSTANCE_LABEL.to_string(), vdb.name_any()),
        (SUBCLUSTER_NAME_LABEL.to_string(), sc.name.clone()),
    ])
}

/// Render labels as a `k=v,k=v` selector string.
pub fn to_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}
