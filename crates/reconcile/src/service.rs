//! Headless Service of a TServer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keel_apply::{build_service, dry_run_sync_service, is_controlled_by};
use keel_core::Outcome;
use keel_store::{Controller, Notification, Object, Receiver, Reconciler, WorkQueue};
use tracing::info;

use crate::{create, failed, identity_key, object_key, out_of_control, retire, Context};

const NAME: &str = "service";
const DELETION_RECHECK: Duration = Duration::from_secs(1);

pub struct ServiceReconciler {
    ctx: Arc<Context>,
    queue: WorkQueue,
}

impl ServiceReconciler {
    pub fn new(ctx: Arc<Context>) -> Arc<Self> {
        let queue = ctx.queue(NAME);
        Arc::new(Self { ctx, queue })
    }

    pub fn queue(&self) -> &WorkQueue { &self.queue }

    pub fn controller(self: &Arc<Self>, workers: usize) -> Controller {
        Controller::new(NAME, self.queue.clone(), workers, Arc::clone(self) as Arc<dyn Reconciler>)
    }
}

impl Receiver for ServiceReconciler {
    fn receive(&self, n: &Notification) {
        if matches!(n.object, Object::TServer(_) | Object::Service(_)) {
            self.queue.add(&identity_key(&n.object));
        }
    }
}

#[async_trait]
impl Reconciler for ServiceReconciler {
    async fn reconcile(&self, key: &str) -> Outcome {
        let Some(key) = object_key(NAME, key) else { return Outcome::Fatal };
        let ctx = &self.ctx;
        let ts = match ctx.tservers.cache.get(&key.namespace, &key.name) {
            None => return retire(NAME, &ctx.services, &key, None).await,
            Some(ts) if ts.is_deleting() => return retire(NAME, &ctx.services, &key, Some(&*ts)).await,
            Some(ts) => ts,
        };

        let Some(svc) = ctx.services.cache.get(&key.namespace, &key.name) else {
            return create(NAME, &ctx.services, &key, &build_service(&ts)).await;
        };
        if svc.metadata.deletion_timestamp.is_some() {
            return Outcome::AddAfter(DELETION_RECHECK);
        }
        if !is_controlled_by(&svc.metadata, &ts) {
            return out_of_control(ctx, NAME, &ts, "Service").await;
        }
        let Some(plan) = dry_run_sync_service(&ts, &svc) else { return Outcome::Done };
        match ctx.services.client.patch(&key.namespace, &key.name, &plan.patch).await {
            Ok(_) => {
                info!(key = %key, adds = plan.summary.adds, updates = plan.summary.updates, "service synced");
                Outcome::Done
            }
            Err(e) => failed(NAME, "patch", &key.namespace, &key.name, &e),
        }
    }
}
