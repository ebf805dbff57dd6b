//! Refreshes the pod counts in the VerticaDB status from the fact cache.

use tracing::debug;

use super::common::update_vdb_status;
use super::error::Result;
use super::pipeline::{ClusterScope, StepResult};
use super::pod_facts::PodFacts;
use crate::crd::{SubclusterStatus, VerticaDB, VerticaDBStatus};

/// Per-subcluster counts for every subcluster in the spec, in spec order.
pub fn subcluster_statuses(vdb: &VerticaDB, facts: &PodFacts) -> Vec<SubclusterStatus> {
    vdb.spec
        .subclusters
        .iter()
        .map(|sc| {
            let mut status = SubclusterStatus {
                name: sc.name.clone(),
                ..Default::default()
            };
            for pf in facts.iter().filter(|p| p.subcluster == sc.name) {
                if pf.is_installed.is_true() {
                    status.install_count += 1;
                }
                if pf.db_exists.is_true() {
                    status.added_to_db_count += 1;
                }
                if pf.up_node {
                    status.up_node_count += 1;
                }
            }
            status
        })
        .collect()
}

/// Write the counts into `status`. Returns whether anything changed.
pub fn apply_counts(status: &mut VerticaDBStatus, subclusters: &[SubclusterStatus]) -> bool {
    let install_count = subclusters.iter().map(|s| s.install_count).sum();
    let added_to_db_count = subclusters.iter().map(|s| s.added_to_db_count).sum();
    let up_node_count = subclusters.iter().map(|s| s.up_node_count).sum();
    let subcluster_count = i32::try_from(subclusters.len()).unwrap_or(i32::MAX);

    if status.install_count == install_count
        && status.added_to_db_count == added_to_db_count
        && status.up_node_count == up_node_count
        && status.subcluster_count == subcluster_count
        && status.subclusters == subclusters
    {
        return false;
    }
    status.install_count = install_count;
    status.added_to_db_count = added_to_db_count;
    status.up_node_count = up_node_count;
    status.subcluster_count = subcluster_count;
    status.subclusters = subclusters.to_vec();
    true
}

#[derive(Clone, Copy, Debug, Default)]
pub struct StatusCountsReconciler;

impl StatusCountsReconciler {
    pub async fn reconcile(&self, scope: &mut ClusterScope) -> Result<StepResult> {
        scope.collect_facts().await?;
        let subclusters = subcluster_statuses(&scope.vdb, &scope.facts);
        let changed = update_vdb_status(scope.api.as_ref(), &mut scope.vdb, |status| {
            apply_counts(status, &subclusters)
        })
        .await?;
        if changed {
            debug!(name = %scope.name(), "Updated status counts");
        }
        Ok(StepResult::Done)
    }
}
