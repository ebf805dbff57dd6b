//! Lookup of the subclusters of a VerticaDB and the objects backing them.
//!
//! A subcluster can exist in the spec, as objects in the cluster, or both.
//! Objects of a subcluster removed from the spec stay around until they are
//! deleted, so callers pick what they need with [`FindFlags`].

use std::collections::BTreeMap;
use std::ops::BitOr;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::ResourceExt;

use super::error::Result;
use super::names::{
    SUBCLUSTER_NAME_LABEL, SUBCLUSTER_TRANSIENT_LABEL, SUBCLUSTER_TYPE_LABEL, operator_labels,
    to_selector,
};
use crate::client::ClusterApi;
use crate::crd::{PRIMARY_SUBCLUSTER_TYPE, Subcluster, VerticaDB};

/// Selection of subclusters for a find operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FindFlags(u8);

impl FindFlags {
    /// Subclusters that appear in the spec.
    pub const IN_VDB: FindFlags = FindFlags(1);
    /// Subclusters that have objects but are gone from the spec.
    pub const NOT_IN_VDB: FindFlags = FindFlags(1 << 1);
    /// Subclusters whose objects currently exist, in the spec or not.
    pub const EXISTING: FindFlags = FindFlags(1 << 2);
    /// Sort results by name.
    pub const SORTED: FindFlags = FindFlags(1 << 3);
    pub const ALL: FindFlags = FindFlags(Self::IN_VDB.0 | Self::NOT_IN_VDB.0);

    pub fn contains(self, other: FindFlags) -> bool {
        self.0 & other.0 == other.0
    }

    fn without(self, other: FindFlags) -> FindFlags {
        FindFlags(self.0 & !other.0)
    }
}

impl BitOr for FindFlags {
    type Output = FindFlags;

    fn bitor(self, rhs: FindFlags) -> FindFlags {
        FindFlags(self.0 | rhs.0)
    }
}

/// Finds subclusters and their StatefulSets, pods and services.
pub struct SubclusterFinder<'a> {
    api: &'a dyn ClusterApi,
    vdb: &'a VerticaDB,
    subclusters: BTreeMap<&'a str, &'a Subcluster>,
}

impl<'a> SubclusterFinder<'a> {
    pub fn new(api: &'a dyn ClusterApi, vdb: &'a VerticaDB) -> Self {
        Self {
            api,
            vdb,
            subclusters: vdb.subcluster_map(),
        }
    }

    fn selector(&self) -> String {
        to_selector(&operator_labels(self.vdb))
    }

    /// Whether an object with these labels should be returned.
    fn selects(&self, labels: &BTreeMap<String, String>, flags: FindFlags) -> bool {
        let Some(sc_name) = labels.get(SUBCLUSTER_NAME_LABEL) else {
            // Cluster-wide objects such as the headless service.
            return false;
        };
        if flags.contains(FindFlags::EXISTING) || flags.contains(FindFlags::ALL) {
            return true;
        }
        let in_vdb = self.subclusters.contains_key(sc_name.as_str());
        (flags.contains(FindFlags::IN_VDB) && in_vdb)
            || (flags.contains(FindFlags::NOT_IN_VDB) && !in_vdb)
    }

    fn filter<K: ResourceExt>(&self, items: Vec<K>, flags: FindFlags) -> Vec<K> {
        let mut items: Vec<K> = items
            .into_iter()
            .filter(|o| self.selects(o.labels(), flags))
            .collect();
        if flags.contains(FindFlags::SORTED) {
            items.sort_by_key(|o| o.name_any());
        }
        items
    }

    pub async fn find_statefulsets(&self, flags: FindFlags) -> Result<Vec<StatefulSet>> {
        let items = self.api.list_statefulsets(&self.selector()).await?;
        Ok(self.filter(items, flags))
    }

    pub async fn find_pods(&self, flags: FindFlags) -> Result<Vec<Pod>> {
        let items = self.api.list_pods(&self.selector()).await?;
        Ok(self.filter(items, flags))
    }

    pub async fn find_services(&self, flags: FindFlags) -> Result<Vec<Service>> {
        let items = self.api.list_services(&self.selector()).await?;
        Ok(self.filter(items, flags))
    }

    /// Subclusters selected by `flags`.
    ///
    /// Subclusters found only through their StatefulSet come back with size
    /// zero, which marks them as being removed. Their role and transient flag
    /// are read from the StatefulSet labels.
    pub async fn find_subclusters(&self, flags: FindFlags) -> Result<Vec<Subcluster>> {
        let mut subclusters: Vec<Subcluster> = Vec::new();
        if flags.contains(FindFlags::IN_VDB) {
            subclusters.extend(self.vdb.spec.subclusters.iter().cloned());
        }

        if flags.contains(FindFlags::NOT_IN_VDB) || flags.contains(FindFlags::EXISTING) {
            let sts_flags = flags.without(FindFlags::IN_VDB);
            for sts in self.find_statefulsets(sts_flags).await? {
                let labels = sts.labels();
                let name = labels
                    .get(SUBCLUSTER_NAME_LABEL)
                    .cloned()
                    .unwrap_or_default();
                if let Some(sc) = self.subclusters.get(name.as_str()) {
                    if !flags.contains(FindFlags::IN_VDB) {
                        subclusters.push((*sc).clone());
                    }
                    continue;
                }
                subclusters.push(Subcluster {
                    name,
                    size: 0,
                    is_primary: labels.get(SUBCLUSTER_TYPE_LABEL).map(String::as_str)
                        == Some(PRIMARY_SUBCLUSTER_TYPE),
                    is_transient: labels.get(SUBCLUSTER_TRANSIENT_LABEL).map(String::as_str)
                        == Some("true"),
                    image_override: None,
                    service_name: None,
                });
            }
        }

        if flags.contains(FindFlags::SORTED) {
            subclusters.sort_by(|a, b| a.name.cmp(&b.name));
        }
        Ok(subclusters)
    }
}
