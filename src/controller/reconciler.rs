//! Reconciliation loop for VerticaDB.
//!
//! Each pass builds a [`ClusterScope`] and runs the actors in a fixed order.
//! An actor that asks to retry, or fails, ends the pass; the next pass starts
//! from the first actor again and relies on every actor skipping work that
//! is already done.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kube::{ResourceExt, runtime::controller::Action};
use tracing::{debug, error, info, warn};

use crate::client::{ClusterApi, KubeClusterApi, KubePodRunner};
use crate::controller::{
    context::Context,
    error::{Error, Result},
    events::{EventRecorder, reasons},
    offline_image_change::OfflineImageChangeReconciler,
    online_image_change::OnlineImageChangeReconciler,
    pipeline::{ClusterScope, StepResult},
    restart::RestartReconciler,
    status_counts::StatusCountsReconciler,
    version::VersionReconciler,
};
use crate::crd::VerticaDB;

/// Key in the superuser password secret holding the password.
pub const SUPERUSER_PASSWORD_KEY: &str = "password";

/// Actors of a reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    /// Refresh the pod counts in the status
    StatusCounts,
    /// Restart vertica and re-IP nodes
    Restart,
    /// Record the server version in the annotations
    Version,
    OfflineImageChange,
    OnlineImageChange,
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Actor::StatusCounts => write!(f, "StatusCountsReconciler"),
            Actor::Restart => write!(f, "RestartReconciler"),
            Actor::Version => write!(f, "VersionReconciler"),
            Actor::OfflineImageChange => write!(f, "OfflineImageChangeReconciler"),
            Actor::OnlineImageChange => write!(f, "OnlineImageChangeReconciler"),
        }
    }
}

/// Order of the actors. Status counts run first in case the prior pass
/// failed, and last to pick up what the other actors changed.
pub const ACTORS: &[Actor] = &[
    Actor::StatusCounts,
    Actor::Restart,
    Actor::Version,
    Actor::OfflineImageChange,
    Actor::OnlineImageChange,
    Actor::StatusCounts,
];

async fn run_actor(actor: Actor, scope: &mut ClusterScope) -> Result<StepResult> {
    match actor {
        Actor::StatusCounts => StatusCountsReconciler.reconcile(scope).await,
        Actor::Restart => RestartReconciler::new().reconcile(scope).await,
        Actor::Version => VersionReconciler::default().reconcile(scope).await,
        Actor::OfflineImageChange => OfflineImageChangeReconciler::new().reconcile(scope).await,
        Actor::OnlineImageChange => OnlineImageChangeReconciler::new().reconcile(scope).await,
    }
}

/// Run every actor against `scope`.
///
/// Returns the first requeue result, or `Done` once all actors finished.
pub async fn run_actors(scope: &mut ClusterScope) -> Result<StepResult> {
    for actor in ACTORS {
        info!(name = %scope.name(), actor = %actor, "starting actor");
        let result = run_actor(*actor, scope).await.inspect_err(|e| {
            info!(name = %scope.name(), actor = %actor, error = %e, "aborting reconcile of VerticaDB");
        })?;
        if result.is_requeue() {
            info!(name = %scope.name(), actor = %actor, result = ?result, "aborting reconcile of VerticaDB");
            return Ok(result);
        }
    }
    Ok(StepResult::Done)
}

/// Read the superuser password from the secret named in the spec.
///
/// A missing secret is an error and is reported as an event. A secret
/// without the password key only logs and runs without a password.
pub async fn fetch_superuser_password(
    api: &dyn ClusterApi,
    events: &dyn EventRecorder,
    vdb: &VerticaDB,
) -> Result<Option<String>> {
    let Some(secret_name) = vdb
        .spec
        .superuser_password_secret
        .as_deref()
        .filter(|s| !s.is_empty())
    else {
        return Ok(None);
    };

    let Some(secret) = api.get_secret(secret_name).await? else {
        events
            .warning(
                vdb,
                reasons::SUPERUSER_PASSWORD_SECRET_NOT_FOUND,
                format!("Secret for superuser password '{secret_name}' was not found"),
            )
            .await;
        return Err(Error::Transient(format!(
            "superuser password secret {secret_name} not found"
        )));
    };

    let from_data = secret
        .data
        .as_ref()
        .and_then(|d| d.get(SUPERUSER_PASSWORD_KEY))
        .map(|b| String::from_utf8_lossy(&b.0).to_string());
    let from_string_data = || {
        secret
            .string_data
            .as_ref()
            .and_then(|d| d.get(SUPERUSER_PASSWORD_KEY))
            .cloned()
    };
    match from_data.or_else(from_string_data) {
        Some(password) => Ok(Some(password)),
        None => {
            error!(
                secret = %secret_name,
                "password not found, secret must have a key with name '{}'",
                SUPERUSER_PASSWORD_KEY
            );
            Ok(None)
        }
    }
}

/// Delay for a pass that asked to retry.
///
/// A fixed `requeueTime` in the spec wins over the backoff. A requested
/// delay is kept as is.
pub fn requeue_delay(vdb: &VerticaDB, result: StepResult, backoff: impl FnOnce() -> Duration) -> Duration {
    match result {
        StepResult::RequeueAfter(delay) => delay,
        _ if vdb.spec.requeue_time > 0 => {
            Duration::from_secs(u64::try_from(vdb.spec.requeue_time).unwrap_or(0))
        }
        _ => backoff(),
    }
}

/// Reconcile a VerticaDB
///
/// This is the main reconciliation function called by the controller.
pub async fn reconcile(obj: Arc<VerticaDB>, ctx: Arc<Context>) -> Result<Action> {
    let start_time = Instant::now();
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let key = format!("{namespace}/{name}");

    info!(name = %name, namespace = %namespace, "starting reconcile of VerticaDB");

    if obj.metadata.deletion_timestamp.is_some() {
        // Owned objects are garbage collected through their owner references.
        debug!(name = %name, "VerticaDB is being deleted, nothing to do");
        return Ok(Action::await_change());
    }

    let api: Arc<dyn ClusterApi> = Arc::new(KubeClusterApi::new(ctx.client.clone(), &namespace));
    let events = ctx.event_recorder();
    let password = fetch_superuser_password(api.as_ref(), events.as_ref(), &obj).await?;
    let runner = Arc::new(KubePodRunner::new(ctx.client.clone(), &namespace, password));

    let mut scope = ClusterScope::new(api, runner, events, (*obj).clone())
        .with_health(ctx.health_state.clone());
    let result = run_actors(&mut scope).await?;

    if let Some(ref health_state) = ctx.health_state {
        health_state
            .metrics
            .record_reconcile(&namespace, &name, start_time.elapsed().as_secs_f64());
    }

    if result.is_requeue() {
        let delay = requeue_delay(&scope.vdb, result, || ctx.next_backoff(&key));
        info!(name = %name, delay = ?delay, "Requeuing reconcile of VerticaDB");
        return Ok(Action::requeue(delay));
    }

    ctx.reset_backoff(&key);
    info!(name = %name, duration = ?start_time.elapsed(), "ending reconcile of VerticaDB");
    Ok(Action::await_change())
}

/// Error policy for the controller
///
/// Determines how to handle reconciliation errors.
pub fn error_policy(obj: Arc<VerticaDB>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());

    if let Some(ref health_state) = ctx.health_state {
        health_state.metrics.record_error(&namespace, &name);
    }

    if error.is_not_found() {
        debug!(name = %name, "Resource not found (likely deleted)");
        return Action::await_change();
    }

    if error.is_retryable() {
        let delay = ctx.next_backoff(&format!("{namespace}/{name}"));
        warn!(name = %name, error = %error, delay = ?delay, "Retryable error, will retry");
        Action::requeue(delay)
    } else {
        error!(name = %name, error = %error, "Non-retryable error");
        Action::requeue(error.requeue_after())
    }
}
