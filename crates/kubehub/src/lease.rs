//! Lease-based leader election over coordination.k8s.io/v1.

use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use keel_core::ApiError;
use keel_store::LeaderSignal;
use kube::api::{Api, PostParams};
use kube::Client;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client::classify;

#[derive(Debug, Clone)]
pub struct LeaseSettings {
    pub namespace: String,
    pub name: String,
    pub identity: String,
    /// How long a lease stays valid without renewal.
    pub lease_duration: Duration,
    /// A leader that cannot renew within this window steps down.
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

pub struct LeaseElector {
    api: Api<Lease>,
    settings: LeaseSettings,
}

/// Whether `identity` may write itself into the lease at `now`.
fn can_take(spec: &LeaseSpec, identity: &str, now: DateTime<Utc>, default_duration: Duration) -> bool {
    let holder = spec.holder_identity.as_deref().unwrap_or_default();
    if holder.is_empty() || holder == identity {
        return true;
    }
    let Some(MicroTime(renewed)) = spec.renew_time.as_ref() else { return true };
    let secs = spec
        .lease_duration_seconds
        .map(i64::from)
        .unwrap_or(default_duration.as_secs() as i64);
    *renewed + chrono::Duration::seconds(secs) < now
}

impl LeaseElector {
    pub fn new(client: Client, settings: LeaseSettings) -> Self {
        Self { api: Api::namespaced(client, &settings.namespace), settings }
    }

    fn spec_for(&self, prev: Option<&LeaseSpec>, now: DateTime<Utc>) -> LeaseSpec {
        let id = &self.settings.identity;
        let same_holder = prev.and_then(|p| p.holder_identity.as_deref()) == Some(id.as_str());
        let transitions = prev.and_then(|p| p.lease_transitions).unwrap_or(0);
        LeaseSpec {
            holder_identity: Some(id.clone()),
            lease_duration_seconds: Some(self.settings.lease_duration.as_secs() as i32),
            acquire_time: if same_holder { prev.and_then(|p| p.acquire_time.clone()) } else { Some(MicroTime(now)) },
            renew_time: Some(MicroTime(now)),
            lease_transitions: Some(if same_holder || prev.is_none() { transitions } else { transitions + 1 }),
            ..LeaseSpec::default()
        }
    }

    /// One acquire-or-renew round trip. `Ok(false)` means another holder owns a live lease.
    async fn try_acquire_or_renew(&self) -> Result<bool, ApiError> {
        let now = Utc::now();
        let pp = PostParams::default();
        let current = match self.api.get(&self.settings.name).await.map_err(classify) {
            Ok(l) => l,
            Err(e) if e.is_not_found() => {
                let lease = Lease {
                    metadata: ObjectMeta { name: Some(self.settings.name.clone()), ..ObjectMeta::default() },
                    spec: Some(self.spec_for(None, now)),
                };
                return match self.api.create(&pp, &lease).await.map_err(classify) {
                    Ok(_) => Ok(true),
                    Err(e) if e.is_already_exists() => Ok(false),
                    Err(e) => Err(e),
                };
            }
            Err(e) => return Err(e),
        };

        let prev = current.spec.clone().unwrap_or_default();
        if !can_take(&prev, &self.settings.identity, now, self.settings.lease_duration) {
            debug!(holder = prev.holder_identity.as_deref().unwrap_or_default(), "lease held elsewhere");
            return Ok(false);
        }
        let mut next = current;
        next.spec = Some(self.spec_for(Some(&prev), now));
        match self.api.replace(&self.settings.name, &pp, &next).await.map_err(classify) {
            Ok(_) => Ok(true),
            Err(e) if e.is_conflict() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Drive `signal` until the process exits. Leadership is dropped when renewal fails for
    /// longer than the renew deadline or another holder takes the lease.
    pub async fn run(self, signal: LeaderSignal) {
        let mut leading = false;
        let mut last_renew: Option<Instant> = None;
        info!(lease = %self.settings.name, identity = %self.settings.identity, "leader election started");
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    last_renew = Some(Instant::now());
                    if !leading {
                        info!(identity = %self.settings.identity, "acquired leadership");
                        leading = true;
                        signal.set(true);
                    }
                }
                Ok(false) => {
                    if leading {
                        warn!("lease taken by another holder");
                        leading = false;
                        signal.set(false);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "lease round trip failed");
                    let expired = last_renew.map_or(true, |t| t.elapsed() > self.settings.renew_deadline);
                    if leading && expired {
                        warn!("renew deadline passed; stepping down");
                        leading = false;
                        signal.set(false);
                    }
                }
            }
            tokio::time::sleep(self.settings.retry_period).await;
        }
    }
}
