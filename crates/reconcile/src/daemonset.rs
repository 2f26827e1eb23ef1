//! DaemonSet of a daemon-mode TServer.

use std::sync::Arc;

use async_trait::async_trait;
use keel_apply::{build_daemonset, dry_run_sync_daemonset, is_controlled_by};
use keel_core::Outcome;
use keel_store::{Controller, Notification, Object, Receiver, Reconciler, WorkQueue};
use tracing::info;

use crate::statefulset::DELETION_RECHECK;
use crate::{build_failed, create, failed, identity_key, object_key, out_of_control, retire, Context};

const NAME: &str = "daemonset";

pub struct DaemonSetReconciler {
    ctx: Arc<Context>,
    queue: WorkQueue,
}

impl DaemonSetReconciler {
    pub fn new(ctx: Arc<Context>) -> Arc<Self> {
        let queue = ctx.queue(NAME);
        Arc::new(Self { ctx, queue })
    }

    pub fn queue(&self) -> &WorkQueue { &self.queue }

    pub fn controller(self: &Arc<Self>, workers: usize) -> Controller {
        Controller::new(NAME, self.queue.clone(), workers, Arc::clone(self) as Arc<dyn Reconciler>)
    }
}

impl Receiver for DaemonSetReconciler {
    fn receive(&self, n: &Notification) {
        if matches!(n.object, Object::TServer(_) | Object::DaemonSet(_)) {
            self.queue.add(&identity_key(&n.object));
        }
    }
}

#[async_trait]
impl Reconciler for DaemonSetReconciler {
    async fn reconcile(&self, key: &str) -> Outcome {
        let Some(key) = object_key(NAME, key) else { return Outcome::Fatal };
        let ctx = &self.ctx;
        let ts = match ctx.tservers.cache.get(&key.namespace, &key.name) {
            None => return retire(NAME, &ctx.daemonsets, &key, None).await,
            Some(ts) if ts.is_deleting() || !ts.is_daemon() => return retire(NAME, &ctx.daemonsets, &key, Some(&*ts)).await,
            Some(ts) => ts,
        };
        let defaults = ctx.node_defaults(&key.namespace);

        let Some(ds) = ctx.daemonsets.cache.get(&key.namespace, &key.name) else {
            return match build_daemonset(&ts, &defaults) {
                Ok(ds) => create(NAME, &ctx.daemonsets, &key, &ds).await,
                Err(e) => build_failed(ctx, NAME, &ts, e).await,
            };
        };
        if ds.metadata.deletion_timestamp.is_some() {
            return Outcome::AddAfter(DELETION_RECHECK);
        }
        if !is_controlled_by(&ds.metadata, &ts) {
            return out_of_control(ctx, NAME, &ts, "DaemonSet").await;
        }

        match dry_run_sync_daemonset(&ts, &ds, &defaults) {
            Ok(None) => Outcome::Done,
            Ok(Some(plan)) => match ctx.daemonsets.client.patch(&key.namespace, &key.name, &plan.patch).await {
                Ok(_) => {
                    info!(key = %key, updates = plan.summary.updates, "daemonset synced");
                    Outcome::Done
                }
                Err(e) => failed(NAME, "patch", &key.namespace, &key.name, &e),
            },
            Err(e) => build_failed(ctx, NAME, &ts, e).await,
        }
    }
}
