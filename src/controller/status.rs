//! Status management utilities.
//!
//! Conditions and the image change progress live in the VerticaDB status.
//! Every helper here only writes when the value actually changes.

use crate::client::ClusterApi;
use crate::controller::common::update_vdb_status;
use crate::controller::error::Result;
use crate::crd::{Condition, ConditionType, ImageChangeProgress, VerticaDB, VerticaDBStatus};

/// Set a condition, keeping its transition time when the status is unchanged.
///
/// Returns true if the condition changed.
pub fn set_condition(status: &mut VerticaDBStatus, condition: Condition) -> bool {
    match status
        .conditions
        .iter_mut()
        .find(|c| c.r#type == condition.r#type)
    {
        Some(existing) if existing.status == condition.status => false,
        Some(existing) => {
            *existing = condition;
            true
        }
        None => {
            status.conditions.push(condition);
            true
        }
    }
}

/// Check if a condition type is true
pub fn is_condition_true(conditions: &[Condition], condition_type: ConditionType) -> bool {
    let wanted = condition_type.to_string();
    conditions
        .iter()
        .find(|c| c.r#type == wanted)
        .is_some_and(Condition::is_true)
}

/// Persist one or more conditions in a single status write.
pub async fn update_conditions(
    api: &dyn ClusterApi,
    vdb: &mut VerticaDB,
    conditions: &[(ConditionType, bool, &str)],
) -> Result<bool> {
    update_vdb_status(api, vdb, |status| {
        let mut changed = false;
        for (ty, value, reason) in conditions {
            changed |= set_condition(status, Condition::new(*ty, *value, reason));
        }
        changed
    })
    .await
}

/// Persist the free-text image change status.
pub async fn update_image_change_status(
    api: &dyn ClusterApi,
    vdb: &mut VerticaDB,
    message: &str,
) -> Result<bool> {
    update_vdb_status(api, vdb, |status| {
        if status.image_change_status == message {
            return false;
        }
        status.image_change_status = message.to_string();
        true
    })
    .await
}

/// Persist the phase list and post the message at `index`.
pub async fn update_image_change_progress(
    api: &dyn ClusterApi,
    vdb: &mut VerticaDB,
    messages: &[String],
    index: usize,
) -> Result<bool> {
    let message = messages.get(index).cloned().unwrap_or_default();
    let index = i32::try_from(index).unwrap_or(i32::MAX);
    update_vdb_status(api, vdb, |status| {
        let progress = ImageChangeProgress {
            messages: messages.to_vec(),
            index,
        };
        if status.image_change_status == message
            && status.image_change_progress.as_ref() == Some(&progress)
        {
            return false;
        }
        status.image_change_status = message.clone();
        status.image_change_progress = Some(progress);
        true
    })
    .await
}

/// Clear the status message and progress once an image change is over.
pub async fn clear_image_change_progress(api: &dyn ClusterApi, vdb: &mut VerticaDB) -> Result<bool> {
    update_vdb_status(api, vdb, |status| {
        if status.image_change_status.is_empty() && status.image_change_progress.is_none() {
            return false;
        }
        status.image_change_status.clear();
        status.image_change_progress = None;
        true
    })
    .await
}
