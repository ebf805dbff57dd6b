//! Leader election over a coordination.k8s.io/v1 Lease.
//!
//! Only one replica reconciles at a time. The lease is read, checked and
//! written back with its resourceVersion, so two replicas racing for an
//! expired lease cannot both win: the loser gets a 409 and tries again on
//! its next round.

use std::time::Duration;

use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use k8s_openapi::chrono::{DateTime, TimeDelta, Utc};
use kube::api::{Api, PostParams};
use kube::Client;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum LeaderElectionError {
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("lease {0} has no resourceVersion")]
    MissingResourceVersion(String),
}

/// Settings of a [`LeaseLock`].
#[derive(Clone, Debug)]
pub struct LeaseLockParams {
    /// Identity written into the lease while held, usually the pod name.
    pub holder_id: String,
    pub lease_name: String,
    /// How long the lease stays valid without a renewal.
    pub lease_ttl: Duration,
}

/// Outcome of one acquire or renew round.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaseLockResult {
    pub acquired_lease: bool,
}

/// What to do with the lease as it was read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaseAction {
    /// We hold it, bump the renew time.
    Renew,
    /// Nobody holds a live lease, claim it.
    TakeOver,
    /// Someone else holds a live lease.
    Wait,
}

/// Current time in the representation the Lease API uses.
fn now() -> DateTime<Utc> {
    let ts = jiff::Timestamp::now();
    let nanos = u32::try_from(ts.subsec_nanosecond()).unwrap_or(0);
    DateTime::from_timestamp(ts.as_second(), nanos).unwrap_or_default()
}

/// Decide how to treat a lease read at `now`.
///
/// A lease without a renew time or duration counts as expired.
pub fn lease_action(spec: Option<&LeaseSpec>, holder_id: &str, now: DateTime<Utc>) -> LeaseAction {
    let holder = spec.and_then(|s| s.holder_identity.as_deref());
    if holder == Some(holder_id) {
        return LeaseAction::Renew;
    }
    if holder.is_none_or(str::is_empty) {
        return LeaseAction::TakeOver;
    }
    let renew_time = spec.and_then(|s| s.renew_time.as_ref());
    let duration = spec.and_then(|s| s.lease_duration_seconds);
    let expired = match (renew_time, duration) {
        (Some(rt), Some(secs)) => now > rt.0 + TimeDelta::seconds(i64::from(secs)),
        _ => true,
    };
    if expired {
        LeaseAction::TakeOver
    } else {
        LeaseAction::Wait
    }
}

/// A Lease used as a mutual exclusion lock between operator replicas.
pub struct LeaseLock {
    api: Api<Lease>,
    params: LeaseLockParams,
}

impl LeaseLock {
    pub fn new(client: Client, namespace: &str, params: LeaseLockParams) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            params,
        }
    }

    fn ttl_secs(&self) -> i32 {
        i32::try_from(self.params.lease_ttl.as_secs()).unwrap_or(i32::MAX)
    }

    /// Take the lease if it is free or expired, or renew it if already held.
    pub async fn try_acquire_or_renew(&self) -> Result<LeaseLockResult, LeaderElectionError> {
        let now = now();
        let Some(existing) = self.api.get_opt(&self.params.lease_name).await? else {
            return self.create(now).await;
        };

        let spec = existing.spec.as_ref();
        let acquired_lease = match lease_action(spec, &self.params.holder_id, now) {
            LeaseAction::Wait => {
                debug!(
                    holder = ?spec.and_then(|s| s.holder_identity.as_deref()),
                    "Lease held by another replica"
                );
                false
            }
            LeaseAction::Renew => {
                let mut updated = existing.clone();
                if let Some(spec) = updated.spec.as_mut() {
                    spec.renew_time = Some(MicroTime(now));
                }
                self.replace(&updated).await?
            }
            LeaseAction::TakeOver => {
                let transitions = spec.and_then(|s| s.lease_transitions).unwrap_or(0);
                let mut updated = existing.clone();
                updated.spec = Some(self.held_spec(now, transitions + 1));
                let taken = self.replace(&updated).await?;
                if taken {
                    info!(holder = %self.params.holder_id, "Took over expired lease");
                }
                taken
            }
        };
        Ok(LeaseLockResult { acquired_lease })
    }

    fn held_spec(&self, now: DateTime<Utc>, transitions: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(self.params.holder_id.clone()),
            lease_duration_seconds: Some(self.ttl_secs()),
            acquire_time: Some(MicroTime(now)),
            renew_time: Some(MicroTime(now)),
            lease_transitions: Some(transitions),
            ..Default::default()
        }
    }

    async fn create(&self, now: DateTime<Utc>) -> Result<LeaseLockResult, LeaderElectionError> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.params.lease_name.clone()),
                ..Default::default()
            },
            spec: Some(self.held_spec(now, 0)),
        };
        match self.api.create(&PostParams::default(), &lease).await {
            Ok(_) => {
                info!(lease = %self.params.lease_name, "Created lease");
                Ok(LeaseLockResult { acquired_lease: true })
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(lease = %self.params.lease_name, "Lease created by another replica");
                Ok(LeaseLockResult { acquired_lease: false })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write the lease back. A conflict means another replica got there first.
    async fn replace(&self, lease: &Lease) -> Result<bool, LeaderElectionError> {
        if lease.metadata.resource_version.is_none() {
            return Err(LeaderElectionError::MissingResourceVersion(
                self.params.lease_name.clone(),
            ));
        }
        match self
            .api
            .replace(&self.params.lease_name, &PostParams::default(), lease)
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(lease = %self.params.lease_name, "Lease changed while updating it");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}
