//! StatefulSet of a non-daemon TServer.
//!
//! Claim templates cannot be changed on a live StatefulSet, so any difference there deletes the
//! StatefulSet (and the claims of removed local volumes) and lets a later pass create the new
//! one. Every other managed field is patched in place.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keel_apply::{build_claim_templates, build_statefulset, diff_claim_templates, dry_run_sync_statefulset, is_controlled_by};
use keel_core::{labels, ObjectKey, Outcome, Selector};
use keel_schema::TServer;
use keel_store::{delete_if_present, Controller, Notification, Object, Receiver, Reconciler, Report, WorkQueue};
use tracing::{debug, info, warn};

use crate::{build_failed, create, failed, identity_key, object_key, out_of_control, reasons, retire, Context};

const NAME: &str = "statefulset";

/// Re-check delay while a StatefulSet is being deleted.
pub const DELETION_RECHECK: Duration = Duration::from_secs(3);

pub struct StatefulSetReconciler {
    ctx: Arc<Context>,
    queue: WorkQueue,
}

impl StatefulSetReconciler {
    pub fn new(ctx: Arc<Context>) -> Arc<Self> {
        let queue = ctx.queue(NAME);
        Arc::new(Self { ctx, queue })
    }

    pub fn queue(&self) -> &WorkQueue { &self.queue }

    pub fn controller(self: &Arc<Self>, workers: usize) -> Controller {
        Controller::new(NAME, self.queue.clone(), workers, Arc::clone(self) as Arc<dyn Reconciler>)
    }

    async fn rebuild(&self, ts: &TServer, key: &ObjectKey, removed: Vec<String>) -> Outcome {
        let ctx = &self.ctx;
        if let Err(e) = delete_if_present(&*ctx.statefulsets.client, &key.namespace, &key.name).await {
            return failed(NAME, "delete", &key.namespace, &key.name, &e);
        }
        info!(key = %key, removed = ?removed, "claim templates changed; statefulset deleted for rebuild");
        let note = format!("volume claim templates of statefulset {key} changed; rebuilding");
        ctx.report(ts, Report::normal(reasons::REBUILD, "Rebuild", note)).await;
        if !removed.is_empty() {
            let orphans = Selector::new()
                .equal(labels::SERVER_APP, &ts.spec.app)
                .equal(labels::SERVER_NAME, &ts.spec.server)
                .within(labels::LOCAL_VOLUME, removed);
            // best effort: the claims are unused once the pods are gone
            if let Err(e) = ctx.pvcs.client.delete_collection(&key.namespace, &orphans).await {
                warn!(key = %key, selector = %orphans, error = %e, "orphan claim cleanup failed");
            }
        }
        Outcome::AddAfter(DELETION_RECHECK)
    }
}

impl Receiver for StatefulSetReconciler {
    fn receive(&self, n: &Notification) {
        match &n.object {
            Object::TServer(_) | Object::StatefulSet(_) => {
                self.queue.add(&identity_key(&n.object));
            }
            _ => {}
        }
    }
}

#[async_trait]
impl Reconciler for StatefulSetReconciler {
    async fn reconcile(&self, key: &str) -> Outcome {
        let Some(key) = object_key(NAME, key) else { return Outcome::Fatal };
        let ctx = &self.ctx;
        let ts = match ctx.tservers.cache.get(&key.namespace, &key.name) {
            None => return retire(NAME, &ctx.statefulsets, &key, None).await,
            Some(ts) if ts.is_deleting() || ts.is_daemon() => return retire(NAME, &ctx.statefulsets, &key, Some(&*ts)).await,
            Some(ts) => ts,
        };
        let defaults = ctx.node_defaults(&key.namespace);

        let Some(sts) = ctx.statefulsets.cache.get(&key.namespace, &key.name) else {
            return match build_statefulset(&ts, &defaults) {
                Ok(sts) => create(NAME, &ctx.statefulsets, &key, &sts).await,
                Err(e) => build_failed(ctx, NAME, &ts, e).await,
            };
        };
        if sts.metadata.deletion_timestamp.is_some() {
            debug!(key = %key, "statefulset still terminating");
            return Outcome::AddAfter(DELETION_RECHECK);
        }
        if !is_controlled_by(&sts.metadata, &ts) {
            return out_of_control(ctx, NAME, &ts, "StatefulSet").await;
        }

        let observed: &[_] = sts.spec.as_ref().and_then(|s| s.volume_claim_templates.as_deref()).unwrap_or_default();
        let claims = diff_claim_templates(observed, &build_claim_templates(&ts));
        if !claims.equal {
            return self.rebuild(&ts, &key, claims.removed).await;
        }

        match dry_run_sync_statefulset(&ts, &sts, &defaults) {
            Ok(None) => Outcome::Done,
            Ok(Some(plan)) => match ctx.statefulsets.client.patch(&key.namespace, &key.name, &plan.patch).await {
                Ok(_) => {
                    info!(key = %key, adds = plan.summary.adds, updates = plan.summary.updates, removes = plan.summary.removes, "statefulset synced");
                    Outcome::Done
                }
                Err(e) => failed(NAME, "patch", &key.namespace, &key.name, &e),
            },
            Err(e) => build_failed(ctx, NAME, &ts, e).await,
        }
    }
}
