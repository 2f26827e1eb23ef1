//! Exit history of each (app, server).
//!
//! Two kinds of keys share one queue. `ns/name` keys keep the record of a TServer in existence.
//! `ns/event/<json>` keys carry one terminated pod, captured when its deletion was observed,
//! and insert it at the head of the record.

use std::sync::Arc;

use async_trait::async_trait;
use keel_apply::{build_texited_record, exited_pod, is_controlled_by};
use keel_core::{labels, EventKey, JsonPatch, ObjectKey, Outcome};
use keel_schema::{TExitedPod, TExitedRecord};
use keel_store::{Controller, Notification, Object, Receiver, Reconciler, WorkQueue};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info};

use crate::{create, failed, identity_key, object_key, out_of_control, retire, Context};

const NAME: &str = "texitedrecord";
const EVENT_TAG: &str = "event";

/// Newest entries scanned for a repeated uid before inserting.
pub const DEDUP_LOOKBACK: usize = 12;

/// Payload of an event key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Exited {
    app: String,
    server: String,
    pods: Vec<TExitedPod>,
}

/// Key that records `pod` in the history of its server.
pub fn event_key(namespace: &str, app: &str, server: &str, pod: TExitedPod) -> Option<String> {
    let payload = Exited { app: app.into(), server: server.into(), pods: vec![pod] };
    let json = serde_json::to_string(&payload).ok()?;
    Some(EventKey::new(namespace, EVENT_TAG, json).to_string())
}

/// Patch inserting `entry` at the head of `record`, evicting from the tail so no more than
/// `limit` entries remain. `None` when the uid is already among the newest entries.
pub fn insert_patch(record: &TExitedRecord, entry: &TExitedPod, limit: usize) -> Option<JsonPatch> {
    let len = record.pods.len();
    if record.pods.iter().take(DEDUP_LOOKBACK.min(len)).any(|p| p.uid == entry.uid) {
        return None;
    }
    let mut patch = JsonPatch::new().add("/pods/0", json!(entry));
    // after the insert the list holds len + 1 entries; drop indices limit..=len, highest first
    for idx in (limit.max(1)..=len).rev() {
        patch = patch.remove(format!("/pods/{idx}"));
    }
    Some(patch)
}

pub struct TExitedRecordReconciler {
    ctx: Arc<Context>,
    queue: WorkQueue,
}

impl TExitedRecordReconciler {
    pub fn new(ctx: Arc<Context>) -> Arc<Self> {
        let queue = ctx.queue(NAME);
        Arc::new(Self { ctx, queue })
    }

    pub fn queue(&self) -> &WorkQueue { &self.queue }

    pub fn controller(self: &Arc<Self>, workers: usize) -> Controller {
        Controller::new(NAME, self.queue.clone(), workers, Arc::clone(self) as Arc<dyn Reconciler>)
    }

    async fn ensure(&self, key: ObjectKey) -> Outcome {
        let ctx = &self.ctx;
        let ts = match ctx.tservers.cache.get(&key.namespace, &key.name) {
            None => return retire(NAME, &ctx.records, &key, None).await,
            Some(ts) if ts.is_deleting() => return retire(NAME, &ctx.records, &key, Some(&*ts)).await,
            Some(ts) => ts,
        };
        match ctx.records.cache.get(&key.namespace, &key.name) {
            None => create(NAME, &ctx.records, &key, &build_texited_record(&ts)).await,
            Some(record) if !is_controlled_by(&record.metadata, &ts) => out_of_control(ctx, NAME, &ts, "TExitedRecord").await,
            Some(_) => Outcome::Done,
        }
    }

    async fn record(&self, key: EventKey) -> Outcome {
        let ctx = &self.ctx;
        let event: Exited = match serde_json::from_str(&key.payload) {
            Ok(e) => e,
            Err(e) => {
                error!(key = %key, error = %e, "unreadable exit event");
                return Outcome::Fatal;
            }
        };
        let Some(entry) = event.pods.first() else {
            error!(key = %key, "exit event without a pod");
            return Outcome::Fatal;
        };
        let name = labels::child_name(&event.app, &event.server);
        let Some(record) = ctx.records.cache.get(&key.namespace, &name) else {
            // the record follows its TServer; wait for it unless the TServer is gone too
            return match ctx.tservers.cache.get(&key.namespace, &name) {
                Some(_) => Outcome::Retry,
                None => Outcome::Done,
            };
        };
        let limit = ctx.policy.get(&key.namespace).max_exited_records;
        let Some(patch) = insert_patch(&record, entry, limit) else {
            debug!(ns = %key.namespace, record = %name, uid = %entry.uid, "exit already recorded");
            return Outcome::Done;
        };
        match ctx.records.client.patch(&key.namespace, &name, &patch).await {
            Ok(_) => {
                info!(ns = %key.namespace, record = %name, pod = %entry.name, "exit recorded");
                Outcome::Done
            }
            Err(e) => failed(NAME, "patch", &key.namespace, &name, &e),
        }
    }
}

impl Receiver for TExitedRecordReconciler {
    fn receive(&self, n: &Notification) {
        match &n.object {
            Object::TServer(_) | Object::TExitedRecord(_) => self.queue.add(&identity_key(&n.object)),
            Object::Pod(pod) => {
                let Some((app, server, entry)) = exited_pod(pod) else { return };
                if let Some(key) = event_key(n.object.namespace(), &app, &server, entry) {
                    self.queue.add(&key);
                }
            }
            _ => {}
        }
    }
}

#[async_trait]
impl Reconciler for TExitedRecordReconciler {
    async fn reconcile(&self, key: &str) -> Outcome {
        if EventKey::has_tag(key, EVENT_TAG) {
            return match EventKey::parse(key) {
                Ok(k) => self.record(k).await,
                Err(e) => {
                    error!(key = %key, error = %e, "unparseable reconcile key");
                    Outcome::Fatal
                }
            };
        }
        match object_key(NAME, key) {
            Some(k) => self.ensure(k).await,
            None => Outcome::Fatal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::PatchOp;

    fn entry(uid: &str) -> TExitedPod { TExitedPod { uid: uid.into(), name: format!("pod-{uid}"), ..Default::default() } }

    fn record(n: usize) -> TExitedRecord {
        let mut r = TExitedRecord::new("tars", "test-hello");
        r.pods = (0..n).map(|i| entry(&format!("u{i}"))).collect();
        r
    }

    #[test]
    fn below_capacity_only_inserts() {
        let p = insert_patch(&record(3), &entry("new"), 60).unwrap();
        assert_eq!(p.len(), 1);
        assert!(matches!(&p.ops()[0], PatchOp::Add { path, .. } if path == "/pods/0"));
    }

    #[test]
    fn at_capacity_evicts_the_oldest() {
        let p = insert_patch(&record(60), &entry("new"), 60).unwrap();
        assert_eq!(p.ops()[1], PatchOp::Remove { path: "/pods/60".into() });
        assert_eq!(p.len(), 2);
    }

    #[test]
    fn shrunk_limit_trims_down_to_it() {
        let p = insert_patch(&record(5), &entry("new"), 3).unwrap();
        let removed: Vec<_> = p.ops()[1..]
            .iter()
            .map(|op| match op {
                PatchOp::Remove { path } => path.clone(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(removed, ["/pods/5", "/pods/4", "/pods/3"]);
    }

    #[test]
    fn recent_duplicates_are_skipped_old_ones_are_not() {
        let r = record(20);
        assert!(insert_patch(&r, &entry("u11"), 60).is_none());
        // beyond the lookback window
        assert!(insert_patch(&r, &entry("u12"), 60).is_some());
    }

    #[test]
    fn event_keys_round_trip_through_the_key_codec() {
        let key = event_key("tars", "Test", "Hello", entry("u1")).unwrap();
        assert!(EventKey::has_tag(&key, EVENT_TAG));
        let parsed = EventKey::parse(&key).unwrap();
        let ev: Exited = serde_json::from_str(&parsed.payload).unwrap();
        assert_eq!(ev.pods[0].uid, "u1");
        assert_eq!((ev.app.as_str(), ev.server.as_str()), ("Test", "Hello"));
    }
}
