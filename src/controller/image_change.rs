//! Logic shared by the offline and online image change reconcilers.
//!
//! Each operation can run again on every pass and is a no-op, detectable
//! without side effects, once it has been applied.

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetUpdateStrategy};
use kube::ResourceExt;
use tracing::info;

use super::common::retry_on_conflict;
use super::error::Result;
use super::events::reasons;
use super::finder::{FindFlags, SubclusterFinder};
use super::names::{SUBCLUSTER_NAME_LABEL, SUBCLUSTER_TRANSIENT_LABEL, SUBCLUSTER_TYPE_LABEL};
use super::pipeline::ClusterScope;
use super::pod_facts::server_image;
use super::status::{update_conditions, update_image_change_status};
use super::version::{ONLINE_UPGRADE_VERSION, VersionInfo};
use crate::client::ClusterApi;
use crate::client::paths::SERVER_CONTAINER;
use crate::crd::{
    ConditionType, ImageChangePolicy, InitPolicy, KSafety, PRIMARY_SUBCLUSTER_TYPE,
    SECONDARY_SUBCLUSTER_TYPE, VerticaDB,
};

/// Which subcluster roles an operation applies to. Transient subclusters
/// are never included.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoleFilter {
    Primary,
    Secondary,
    All,
}

impl RoleFilter {
    fn matches(self, type_label: Option<&str>) -> bool {
        match self {
            RoleFilter::All => true,
            RoleFilter::Primary => type_label == Some(PRIMARY_SUBCLUSTER_TYPE),
            RoleFilter::Secondary => type_label == Some(SECONDARY_SUBCLUSTER_TYPE),
        }
    }
}

/// Whether the online strategy applies to `vdb`.
///
/// Auto picks online only with a license, k-safety above zero and a server
/// version that supports it.
pub fn online_image_change_allowed(vdb: &VerticaDB) -> bool {
    match vdb.spec.image_change_policy {
        ImageChangePolicy::Offline => false,
        ImageChangePolicy::Online => true,
        ImageChangePolicy::Auto => {
            let licensed = vdb
                .spec
                .license_secret
                .as_deref()
                .is_some_and(|s| !s.is_empty());
            if !licensed || vdb.spec.k_safety == KSafety::Zero {
                return false;
            }
            VersionInfo::from_vdb(vdb).is_some_and(|v| v.is_equal_or_newer(ONLINE_UPGRADE_VERSION))
        }
    }
}

pub fn offline_image_change_allowed(vdb: &VerticaDB) -> bool {
    !online_image_change_allowed(vdb)
}

/// Image of the server container in a StatefulSet template.
pub fn statefulset_image(sts: &StatefulSet) -> String {
    sts.spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|p| p.containers.iter().find(|c| c.name == SERVER_CONTAINER))
        .and_then(|c| c.image.clone())
        .unwrap_or_default()
}

/// Point the server container at `image` and switch the StatefulSet to
/// OnDelete so the platform does not roll the pods itself. Returns false when
/// the image already matches.
pub fn set_statefulset_image(sts: &mut StatefulSet, image: &str) -> bool {
    if statefulset_image(sts) == image {
        return false;
    }
    let Some(spec) = sts.spec.as_mut() else {
        return false;
    };
    if let Some(pod_spec) = spec.template.spec.as_mut()
        && let Some(container) = pod_spec
            .containers
            .iter_mut()
            .find(|c| c.name == SERVER_CONTAINER)
    {
        container.image = Some(image.to_string());
    }
    spec.update_strategy = Some(StatefulSetUpdateStrategy {
        type_: Some("OnDelete".to_string()),
        rolling_update: None,
    });
    true
}

fn is_transient(sts: &StatefulSet) -> bool {
    sts.labels().get(SUBCLUSTER_TRANSIENT_LABEL).map(String::as_str) == Some("true")
}

/// Change the image of one StatefulSet, re-fetching on conflict.
pub async fn update_statefulset_image(api: &dyn ClusterApi, name: &str, image: &str) -> Result<bool> {
    retry_on_conflict(name, || async move {
        let Some(mut sts) = api.get_statefulset(name).await? else {
            return Ok(false);
        };
        if !set_statefulset_image(&mut sts, image) {
            return Ok(false);
        }
        info!(name = %name, image = %image, "Updating image in old statefulset");
        api.replace_statefulset(&sts).await?;
        Ok(true)
    })
    .await
}

/// State of one image change attempt.
#[derive(Clone, Copy, Debug)]
pub struct ImageChangeManager {
    /// Condition specific to the strategy.
    condition: ConditionType,
    policy_allows: fn(&VerticaDB) -> bool,
    /// The strategy condition was already set when the pass started.
    pub continuing: bool,
}

impl ImageChangeManager {
    pub fn offline() -> Self {
        Self {
            condition: ConditionType::OfflineImageChangeInProgress,
            policy_allows: offline_image_change_allowed,
            continuing: false,
        }
    }

    pub fn online() -> Self {
        Self {
            condition: ConditionType::OnlineImageChangeInProgress,
            policy_allows: online_image_change_allowed,
            continuing: false,
        }
    }

    fn policy_label(&self) -> &'static str {
        match self.condition {
            ConditionType::OnlineImageChangeInProgress => "online",
            _ => "offline",
        }
    }

    /// Whether an image change should proceed.
    ///
    /// True if one of this strategy is already in progress, or if the policy
    /// picks this strategy and some StatefulSet runs another image. Never
    /// true for a ScheduleOnly database.
    pub async fn is_image_change_needed(&mut self, scope: &ClusterScope) -> Result<bool> {
        if scope.vdb.spec.init_policy == InitPolicy::ScheduleOnly {
            return Ok(false);
        }
        if scope.vdb.is_condition_set(self.condition) {
            self.continuing = true;
            return Ok(true);
        }
        if !(self.policy_allows)(&scope.vdb) {
            return Ok(false);
        }
        let finder = SubclusterFinder::new(scope.api.as_ref(), &scope.vdb);
        let stss = finder.find_statefulsets(FindFlags::IN_VDB).await?;
        Ok(stss
            .iter()
            .any(|sts| statefulset_image(sts) != scope.vdb.spec.image))
    }

    /// Set the in-progress conditions. The start event is only sent for a
    /// new image change.
    pub async fn start_image_change(&self, scope: &mut ClusterScope) -> Result<()> {
        info!(
            name = %scope.name(),
            continuing = self.continuing,
            "Starting image change for reconciliation iteration"
        );
        update_conditions(
            scope.api.as_ref(),
            &mut scope.vdb,
            &[
                (ConditionType::ImageChangeInProgress, true, "ImageChangeStarted"),
                (self.condition, true, "ImageChangeStarted"),
            ],
        )
        .await?;

        if !self.continuing {
            scope
                .events
                .normal(
                    &scope.vdb,
                    reasons::IMAGE_CHANGE_START,
                    format!(
                        "Vertica server image change has started.  New image is '{}'",
                        scope.vdb.spec.image
                    ),
                )
                .await;
            scope.record_image_change(self.policy_label(), "started");
        }
        Ok(())
    }

    /// Clear the status message and the in-progress conditions.
    pub async fn finish_image_change(&self, scope: &mut ClusterScope) -> Result<()> {
        update_image_change_status(scope.api.as_ref(), &mut scope.vdb, "").await?;
        super::status::clear_image_change_progress(scope.api.as_ref(), &mut scope.vdb).await?;
        update_conditions(
            scope.api.as_ref(),
            &mut scope.vdb,
            &[
                (ConditionType::ImageChangeInProgress, false, "ImageChangeFinished"),
                (self.condition, false, "ImageChangeFinished"),
            ],
        )
        .await?;
        scope
            .events
            .normal(
                &scope.vdb,
                reasons::IMAGE_CHANGE_SUCCEEDED,
                "Vertica server image change has completed successfully".to_string(),
            )
            .await;
        scope.record_image_change(self.policy_label(), "finished");
        Ok(())
    }

    pub async fn set_image_change_status(&self, scope: &mut ClusterScope, msg: &str) -> Result<()> {
        update_image_change_status(scope.api.as_ref(), &mut scope.vdb, msg).await?;
        Ok(())
    }

    /// Move every existing StatefulSet of the given role to the new image.
    ///
    /// Only StatefulSets that already exist are touched, so a scale-out
    /// paired with the image change takes effect afterwards. Returns how many
    /// changed.
    pub async fn update_image_in_statefulsets(
        &self,
        scope: &mut ClusterScope,
        roles: RoleFilter,
    ) -> Result<usize> {
        let finder = SubclusterFinder::new(scope.api.as_ref(), &scope.vdb);
        let stss = finder.find_statefulsets(FindFlags::EXISTING).await?;
        let image = scope.vdb.spec.image.clone();
        let mut changed = 0;
        for sts in stss {
            if is_transient(&sts)
                || !roles.matches(sts.labels().get(SUBCLUSTER_TYPE_LABEL).map(String::as_str))
            {
                continue;
            }
            if update_statefulset_image(scope.api.as_ref(), &sts.name_any(), &image).await? {
                changed += 1;
            }
        }
        Ok(changed)
    }

    /// Delete pods still on the old image, for one subcluster or every one
    /// matching `roles`. Returns how many were deleted.
    pub async fn delete_pods_running_old_image(
        &self,
        scope: &mut ClusterScope,
        subcluster: Option<&str>,
        roles: RoleFilter,
    ) -> Result<usize> {
        let finder = SubclusterFinder::new(scope.api.as_ref(), &scope.vdb);
        let pods = finder.find_pods(FindFlags::EXISTING).await?;
        let mut deleted = 0;
        for pod in pods {
            let labels = pod.labels();
            if labels.get(SUBCLUSTER_TRANSIENT_LABEL).map(String::as_str) == Some("true") {
                continue;
            }
            if let Some(sc) = subcluster
                && labels.get(SUBCLUSTER_NAME_LABEL).map(String::as_str) != Some(sc)
            {
                continue;
            }
            if !roles.matches(labels.get(SUBCLUSTER_TYPE_LABEL).map(String::as_str)) {
                continue;
            }
            if server_image(&pod) != scope.vdb.spec.image {
                info!(pod = %pod.name_any(), "Deleting pod that had old image");
                scope.api.delete_pod(&pod.name_any()).await?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}
