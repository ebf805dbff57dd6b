//! Shared controller helpers.
//!
//! Writes to the VerticaDB race with other passes and with users editing the
//! object. Every write here re-fetches the object, applies the change and
//! retries when the API server reports a conflict.

use std::future::Future;
use std::time::Duration;

use kube::ResourceExt;
use tracing::debug;

use crate::client::ClusterApi;
use crate::controller::error::{Error, Result};
use crate::crd::{VerticaDB, VerticaDBStatus};

/// Attempts made before a conflict is returned to the caller.
pub const MAX_CONFLICT_RETRIES: u32 = 5;

/// Delay between conflict retries: 50ms doubling.
fn conflict_delay(attempt: u32) -> Duration {
    Duration::from_millis(50u64.saturating_mul(1u64 << attempt.min(6)))
}

/// Run `op` again while it fails with a conflict.
pub async fn retry_on_conflict<T, F, Fut>(what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(e) if e.is_conflict() && attempt + 1 < MAX_CONFLICT_RETRIES => {
                debug!(object = %what, attempt, "Conflict on write, retrying");
                tokio::time::sleep(conflict_delay(attempt)).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

async fn fetch_vdb(api: &dyn ClusterApi, name: &str) -> Result<VerticaDB> {
    api.get_vdb(name)
        .await?
        .ok_or_else(|| Error::Transient(format!("VerticaDB {name} no longer exists")))
}

/// Apply `mutate` to the latest VerticaDB and replace it when it changed.
///
/// `vdb` is refreshed with what the API server returned. Returns whether a
/// write happened.
pub async fn update_vdb<F>(api: &dyn ClusterApi, vdb: &mut VerticaDB, mutate: F) -> Result<bool>
where
    F: Fn(&mut VerticaDB) -> bool + Send + Sync,
{
    let name = vdb.name_any();
    let name = name.as_str();
    let mutate = &mutate;
    let (fresh, changed) = retry_on_conflict(name, || async move {
        let mut fresh = fetch_vdb(api, name).await?;
        if !mutate(&mut fresh) {
            return Ok((fresh, false));
        }
        Ok((api.replace_vdb(&fresh).await?, true))
    })
    .await?;
    *vdb = fresh;
    Ok(changed)
}

/// Apply `mutate` to the latest status and write it when it changed.
pub async fn update_vdb_status<F>(
    api: &dyn ClusterApi,
    vdb: &mut VerticaDB,
    mutate: F,
) -> Result<bool>
where
    F: Fn(&mut VerticaDBStatus) -> bool + Send + Sync,
{
    let name = vdb.name_any();
    let name = name.as_str();
    let mutate = &mutate;
    let (fresh, changed) = retry_on_conflict(name, || async move {
        let mut fresh = fetch_vdb(api, name).await?;
        let status = fresh.status.get_or_insert_with(VerticaDBStatus::default);
        if !mutate(status) {
            return Ok((fresh, false));
        }
        Ok((api.replace_vdb_status(&fresh).await?, true))
    })
    .await?;
    *vdb = fresh;
    Ok(changed)
}
