//! Local-volume annotations on the claims of a StatefulSet.
//!
//! Claims are created by the StatefulSet controller, not by us; this reconciler copies the
//! uid/gid/mode of each local volume onto them once the desired values have stopped changing
//! for the settle window.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use keel_apply::local_volume_annotations;
use keel_core::{labels, Action, Outcome, Selector};
use keel_store::{Controller, Notification, Object, Receiver, Reconciler, WorkQueue};
use rustc_hash::FxHashMap;
use tracing::{debug, info};

use crate::{failed, identity_key, object_key, server_key, Context};

const NAME: &str = "pvc";

fn annotated(pvc: &PersistentVolumeClaim, expected: &BTreeMap<String, String>) -> bool {
    let have = pvc.metadata.annotations.as_ref();
    expected.iter().all(|(k, v)| have.and_then(|a| a.get(k)) == Some(v))
}

pub struct PvcReconciler {
    ctx: Arc<Context>,
    queue: WorkQueue,
    /// Key -> (fingerprint of the pending writes, first time it was seen).
    stable: Mutex<FxHashMap<String, (String, DateTime<Utc>)>>,
}

impl PvcReconciler {
    pub fn new(ctx: Arc<Context>) -> Arc<Self> {
        let queue = ctx.queue(NAME);
        Arc::new(Self { ctx, queue, stable: Mutex::new(FxHashMap::default()) })
    }

    pub fn queue(&self) -> &WorkQueue { &self.queue }

    pub fn controller(self: &Arc<Self>, workers: usize) -> Controller {
        Controller::new(NAME, self.queue.clone(), workers, Arc::clone(self) as Arc<dyn Reconciler>)
    }

    fn forget(&self, key: &str) { self.stable.lock().unwrap_or_else(|p| p.into_inner()).remove(key); }

    /// Remaining settle time for `fingerprint`, restarting the window when it changed.
    fn settle(&self, key: &str, fingerprint: String) -> Option<std::time::Duration> {
        let now = self.ctx.clock.now();
        let window = self.ctx.settings.pvc_settle;
        let mut stable = self.stable.lock().unwrap_or_else(|p| p.into_inner());
        match stable.get(key) {
            Some((seen, since)) if *seen == fingerprint => {
                let elapsed = (now - *since).to_std().unwrap_or_default();
                window.checked_sub(elapsed).filter(|d| !d.is_zero())
            }
            _ => {
                stable.insert(key.to_string(), (fingerprint, now));
                Some(window)
            }
        }
    }
}

impl Receiver for PvcReconciler {
    fn receive(&self, n: &Notification) {
        match &n.object {
            Object::TServer(_) => self.queue.add(&identity_key(&n.object)),
            Object::PersistentVolumeClaim(_) if n.action != Action::Deleted => {
                if let Some(key) = server_key(&n.object) {
                    self.queue.add(&key);
                }
            }
            _ => {}
        }
    }
}

#[async_trait]
impl Reconciler for PvcReconciler {
    async fn reconcile(&self, raw: &str) -> Outcome {
        let Some(key) = object_key(NAME, raw) else { return Outcome::Fatal };
        let ctx = &self.ctx;
        let ts = match ctx.tservers.cache.get(&key.namespace, &key.name) {
            Some(ts) if !ts.is_deleting() && !ts.is_daemon() => ts,
            _ => {
                self.forget(raw);
                return Outcome::Done;
            }
        };

        let mut pending = Vec::new();
        for (volume, expected) in local_volume_annotations(&ts) {
            if expected.is_empty() {
                continue;
            }
            let selector = Selector::new()
                .equal(labels::SERVER_APP, &ts.spec.app)
                .equal(labels::SERVER_NAME, &ts.spec.server)
                .equal(labels::LOCAL_VOLUME, &volume);
            for pvc in ctx.pvcs.cache.list(&key.namespace, &selector) {
                if pvc.metadata.deletion_timestamp.is_none() && !annotated(&pvc, &expected) {
                    pending.push((pvc, expected.clone()));
                }
            }
        }
        if pending.is_empty() {
            self.forget(raw);
            return Outcome::Done;
        }

        let fingerprint: Vec<_> = pending.iter().map(|(p, a)| (p.metadata.name.clone(), a)).collect();
        let fingerprint = serde_json::to_string(&fingerprint).unwrap_or_default();
        if let Some(wait) = self.settle(raw, fingerprint) {
            debug!(key = %key, pending = pending.len(), ?wait, "waiting for claim annotations to settle");
            return Outcome::AddAfter(wait);
        }

        let mut outcome = Outcome::Done;
        for (pvc, expected) in pending {
            let mut next = PersistentVolumeClaim::clone(&pvc);
            next.metadata.annotations.get_or_insert_with(BTreeMap::new).extend(expected);
            let name = next.metadata.name.clone().unwrap_or_default();
            match ctx.pvcs.client.update(&key.namespace, &next).await {
                Ok(_) => info!(ns = %key.namespace, pvc = %name, "local volume annotations written"),
                Err(e) => outcome = outcome.merge(failed(NAME, "update", &key.namespace, &name, &e)),
            }
        }
        if outcome == Outcome::Done {
            self.forget(raw);
        }
        outcome
    }
}
