use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use k8s_openapi::api::apps::v1::{DaemonSet, StatefulSet};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Service};
use keel_apply::NodeDefaults;
use keel_schema::{TAccount, TConfig, TEndpoint, TExitedRecord, TServer};
use keel_store::{Clock, EventSink, Handle, ObjectCache, PolicyRegistry, RateLimit, Report, WorkQueue};
use kube::Resource;
use rustc_hash::FxHashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// How long the expected PVC annotations must stay unchanged before they are written.
    pub pvc_settle: Duration,
    pub backoff: RateLimit,
}

impl Default for Settings {
    fn default() -> Self { Self { pvc_settle: Duration::from_secs(2), backoff: RateLimit::default() } }
}

/// Rate limit for repeated warnings about the same object. The n-th repeat waits out the n-th
/// backoff step; a warning quiet for the whole backoff ceiling starts over.
#[derive(Default)]
pub struct Warnings {
    sent: Mutex<FxHashMap<String, (DateTime<Utc>, u32)>>,
}

impl Warnings {
    pub fn admit(&self, key: &str, now: DateTime<Utc>, backoff: &RateLimit) -> bool {
        let mut sent = self.sent.lock().unwrap_or_else(|p| p.into_inner());
        let Some((last, count)) = sent.get_mut(key) else {
            sent.insert(key.to_string(), (now, 1));
            return true;
        };
        let quiet = (now - *last).to_std().unwrap_or(Duration::ZERO);
        if quiet >= backoff.max {
            *count = 0;
        } else if quiet < backoff.delay(*count) {
            return false;
        }
        *last = now;
        *count += 1;
        true
    }
}

/// Everything a reconciler reads or writes, built once at startup.
pub struct Context {
    pub tservers: Handle<TServer>,
    pub tendpoints: Handle<TEndpoint>,
    pub records: Handle<TExitedRecord>,
    pub tconfigs: Handle<TConfig>,
    pub taccounts: Handle<TAccount>,
    pub services: Handle<Service>,
    pub statefulsets: Handle<StatefulSet>,
    pub daemonsets: Handle<DaemonSet>,
    pub pvcs: Handle<PersistentVolumeClaim>,
    pub pods: Arc<dyn ObjectCache<Pod>>,
    pub policy: Arc<PolicyRegistry>,
    pub events: Arc<dyn EventSink>,
    pub clock: Arc<dyn Clock>,
    pub settings: Settings,
    pub warnings: Warnings,
}

impl Context {
    pub fn node_defaults(&self, namespace: &str) -> NodeDefaults {
        let p = self.policy.get(namespace);
        NodeDefaults { image: p.node_image.clone(), secret: p.node_secret.clone() }
    }

    pub(crate) fn queue(&self, name: &'static str) -> WorkQueue { WorkQueue::with_rate_limit(name, self.settings.backoff) }

    pub async fn report(&self, ts: &TServer, report: Report) { self.events.publish(ts.object_ref(&()), report).await; }
}
