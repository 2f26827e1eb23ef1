//! TServer status: replica counts of the pods selected by (app, server).

use std::sync::Arc;

use async_trait::async_trait;
use keel_core::{labels, Action, Outcome, Selector};
use keel_schema::{TServer, TServerStatus};
use keel_store::{Controller, Notification, Object, Receiver, Reconciler, WorkQueue};
use tracing::debug;

use crate::{failed, identity_key, object_key, server_key, Context};

const NAME: &str = "tserver";

pub struct TServerReconciler {
    ctx: Arc<Context>,
    queue: WorkQueue,
}

impl TServerReconciler {
    pub fn new(ctx: Arc<Context>) -> Arc<Self> {
        let queue = ctx.queue(NAME);
        Arc::new(Self { ctx, queue })
    }

    pub fn queue(&self) -> &WorkQueue { &self.queue }

    pub fn controller(self: &Arc<Self>, workers: usize) -> Controller {
        Controller::new(NAME, self.queue.clone(), workers, Arc::clone(self) as Arc<dyn Reconciler>)
    }
}

impl Receiver for TServerReconciler {
    fn receive(&self, n: &Notification) {
        match &n.object {
            Object::TServer(_) if n.action != Action::Deleted => self.queue.add(&identity_key(&n.object)),
            Object::Pod(_) => {
                if let Some(key) = server_key(&n.object) {
                    self.queue.add(&key);
                }
            }
            _ => {}
        }
    }
}

#[async_trait]
impl Reconciler for TServerReconciler {
    async fn reconcile(&self, key: &str) -> Outcome {
        let Some(key) = object_key(NAME, key) else { return Outcome::Fatal };
        let ctx = &self.ctx;
        let Some(ts) = ctx.tservers.cache.get(&key.namespace, &key.name) else { return Outcome::Done };

        let selector = Selector::new()
            .equal(labels::SERVER_APP, &ts.spec.app)
            .equal(labels::SERVER_NAME, &ts.spec.server);
        let pods = ctx.pods.list(&key.namespace, &selector);
        let ready = pods
            .iter()
            .filter(|p| {
                let conditions = p.status.as_ref().and_then(|s| s.conditions.as_deref()).unwrap_or_default();
                conditions.iter().any(|c| c.type_ == "Ready" && c.status == "True")
            })
            .count();
        let status = TServerStatus {
            replicas: ts.spec.k8s.replicas,
            ready_replicas: ready as i32,
            current_replicas: pods.len() as i32,
            selector: selector.to_string(),
        };
        if ts.status.as_ref() == Some(&status) {
            return Outcome::Done;
        }

        debug!(key = %key, ready = status.ready_replicas, current = status.current_replicas, "tserver status changed");
        let mut next = TServer::clone(&ts);
        next.status = Some(status);
        match ctx.tservers.client.update_status(&key.namespace, &next).await {
            Ok(_) => Outcome::Done,
            Err(e) => failed(NAME, "update_status", &key.namespace, &key.name, &e),
        }
    }
}
