//! Vertica server version tracking.
//!
//! The version running in the pods is recorded in annotations on the
//! VerticaDB. Other reconcilers read it back to decide what the server
//! supports, and the online image change uses it to refuse upgrade paths
//! that Vertica does not allow.

use std::collections::BTreeMap;

use regex::Regex;
use semver::Version;
use tracing::{debug, info};

use super::common::update_vdb;
use super::error::Result;
use super::events::reasons;
use super::pipeline::{ClusterScope, StepResult};
use crate::client::paths::{SERVER_CONTAINER, VERTICA_BIN};
use crate::client::{VersionOutput, command};
use crate::crd::{
    BUILD_DATE_ANNOTATION, BUILD_REF_ANNOTATION, ConditionType, VERSION_ANNOTATION, VerticaDB,
};

/// Oldest server version the operator manages.
pub const MINIMUM_VERSION: &str = "v11.0.1";
/// Oldest server version that can change images online.
pub const ONLINE_UPGRADE_VERSION: &str = "v11.1.0";

/// A parsed `vMAJOR.MINOR.PATCH` version and the string it came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionInfo {
    pub raw: String,
    pub version: Version,
}

impl VersionInfo {
    /// Parse the first `vX.Y.Z` in `raw`.
    pub fn parse(raw: &str) -> Option<Self> {
        let re = Regex::new(r"v(\d+)\.(\d+)\.(\d+)").ok()?;
        let caps = re.captures(raw)?;
        let part = |i: usize| caps.get(i)?.as_str().parse::<u64>().ok();
        Some(Self {
            raw: raw.to_string(),
            version: Version::new(part(1)?, part(2)?, part(3)?),
        })
    }

    /// Version recorded in the VerticaDB annotations.
    pub fn from_vdb(vdb: &VerticaDB) -> Option<Self> {
        vdb.vertica_version().and_then(Self::parse)
    }

    /// True when at least `other`. An unparsable `other` compares as newer.
    pub fn is_equal_or_newer(&self, other: &str) -> bool {
        VersionInfo::parse(other).is_some_and(|o| self.version >= o.version)
    }

    pub fn is_supported(&self) -> bool {
        self.is_equal_or_newer(MINIMUM_VERSION)
    }

    fn same_release(&self, other: &Version) -> bool {
        self.version.major == other.major && self.version.minor == other.minor
    }

    /// The release that must follow this one, for releases with a fixed path.
    fn next_release(&self) -> Option<(&'static str, Version)> {
        match (self.version.major, self.version.minor, self.version.patch) {
            (11, 0, 0..=2) => Some(("v11.1.x", Version::new(11, 1, 0))),
            (11, 1, 0..=1) => Some(("v12.0.x", Version::new(12, 0, 0))),
            _ => None,
        }
    }

    /// Check that moving to `target` is an allowed upgrade.
    ///
    /// Downgrades are refused. Patch releases may be skipped, release
    /// versions may not. Versions with no known path are allowed so that
    /// newer servers keep working.
    pub fn is_valid_upgrade_path(&self, target: &VersionInfo) -> std::result::Result<(), String> {
        if self.version == target.version {
            return Ok(());
        }
        if target.version < self.version {
            return Err(format!(
                "Version '{}' to '{}' is a downgrade and is not supported",
                self.raw, target.raw
            ));
        }
        if self.same_release(&target.version) {
            return Ok(());
        }
        match self.next_release() {
            None => Ok(()),
            Some((_, next)) if target.same_release(&next) => Ok(()),
            Some((name, _)) => Err(format!(
                "Version '{}' to '{}' is invalid because it skips '{}'",
                self.raw, target.raw, name
            )),
        }
    }
}

/// Build annotations from `vertica --version` output.
pub fn version_annotations(output: &VersionOutput) -> BTreeMap<String, String> {
    let mut annotations = BTreeMap::new();
    if let Some(v) = &output.version {
        annotations.insert(VERSION_ANNOTATION.to_string(), v.clone());
    }
    if let Some(r) = &output.build_ref {
        annotations.insert(BUILD_REF_ANNOTATION.to_string(), r.clone());
    }
    if let Some(d) = &output.build_date {
        annotations.insert(BUILD_DATE_ANNOTATION.to_string(), d.clone());
    }
    annotations
}

/// Merge `new` into the annotations of `vdb`. Returns whether any changed.
pub fn merge_annotations(vdb: &mut VerticaDB, new: &BTreeMap<String, String>) -> bool {
    let annotations = vdb.metadata.annotations.get_or_insert_with(BTreeMap::new);
    let mut changed = false;
    for (k, v) in new {
        if annotations.get(k) != Some(v) {
            annotations.insert(k.clone(), v.clone());
            changed = true;
        }
    }
    changed
}

/// Records the server version in the VerticaDB annotations.
#[derive(Clone, Debug, Default)]
pub struct VersionReconciler {
    /// Refuse versions that do not follow the upgrade path.
    pub enforce_upgrade_path: bool,
    /// Only read the version from pods of this subcluster.
    pub subcluster: Option<String>,
}

impl VersionReconciler {
    /// Reconciler that enforces the upgrade path using pods of `subcluster`.
    pub fn enforcing(subcluster: &str) -> Self {
        Self {
            enforce_upgrade_path: true,
            subcluster: Some(subcluster.to_string()),
        }
    }

    pub async fn reconcile(&self, scope: &mut ClusterScope) -> Result<StepResult> {
        // The annotation must keep the pre-change version until the image
        // change has checked the upgrade path against it.
        if !self.enforce_upgrade_path
            && scope.vdb.is_condition_set(ConditionType::ImageChangeInProgress)
        {
            debug!(name = %scope.name(), "Image change in progress, not recording the version");
            return Ok(StepResult::Done);
        }

        scope.collect_facts().await?;

        let pod = scope
            .facts
            .iter()
            .find(|p| {
                p.is_pod_running
                    && self
                        .subcluster
                        .as_deref()
                        .is_none_or(|sc| p.subcluster == sc)
            })
            .map(|p| p.name.clone());
        let Some(pod) = pod else {
            info!(name = %scope.name(), "Could not find any running pod, requeuing reconciliation");
            return Ok(StepResult::Requeue);
        };

        let out = scope
            .runner
            .exec_in_pod(&pod, SERVER_CONTAINER, &command(&[VERTICA_BIN, "--version"]))
            .await?;
        let annotations = version_annotations(&VersionOutput::parse(&out.stdout)?);

        if self.enforce_upgrade_path
            && let Some(result) = self.check_upgrade_path(scope, &annotations).await
        {
            return Ok(result);
        }

        let changed = update_vdb(scope.api.as_ref(), &mut scope.vdb, |vdb| {
            merge_annotations(vdb, &annotations)
        })
        .await?;
        if changed {
            debug!(pod = %pod, "Updated version annotations");
        }

        let Some(info) = VersionInfo::from_vdb(&scope.vdb) else {
            return Ok(StepResult::Done);
        };
        if !info.is_supported() {
            scope
                .events
                .warning(
                    &scope.vdb,
                    reasons::UNSUPPORTED_VERTICA_VERSION,
                    format!(
                        "The Vertica version {} is unsupported with this operator.  The minimum version supported is {}.",
                        info.raw, MINIMUM_VERSION
                    ),
                )
                .await;
            return Ok(StepResult::Requeue);
        }
        Ok(StepResult::Done)
    }

    /// Returns a result to stop with when the new version is not allowed.
    async fn check_upgrade_path(
        &self,
        scope: &ClusterScope,
        annotations: &BTreeMap<String, String>,
    ) -> Option<StepResult> {
        let current = VersionInfo::from_vdb(&scope.vdb)?;
        let target = annotations
            .get(VERSION_ANNOTATION)
            .and_then(|v| VersionInfo::parse(v))?;
        match current.is_valid_upgrade_path(&target) {
            Ok(()) => None,
            Err(reason) => {
                scope
                    .events
                    .warning(&scope.vdb, reasons::INVALID_UPGRADE_PATH, reason)
                    .await;
                Some(StepResult::Requeue)
            }
        }
    }
}
