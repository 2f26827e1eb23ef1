//! TEndpoint: spec projection of a TServer plus one status entry per live pod.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, PodCondition};
use keel_apply::{build_tendpoint, dry_run_sync_tendpoint, is_controlled_by};
use keel_core::{labels, ObjectKey, Outcome, Selector};
use keel_schema::{TEndpoint, TEndpointPodStatus, TEndpointStatus};
use keel_store::{Controller, Notification, Object, Receiver, Reconciler, WorkQueue};
use kube::ResourceExt;
use tracing::debug;

use crate::{create, failed, identity_key, object_key, out_of_control, retire, server_key, Context};

const NAME: &str = "tendpoint";

/// Conditions reported in this order before any others.
const LEADING_CONDITIONS: [&str; 3] = ["PodScheduled", "Initialized", "ContainersReady"];

/// `setting/present/pid` as carried in the readiness gate condition reason.
fn split_reason(reason: &str) -> (String, String, String) {
    let parts: Vec<&str> = reason.split('/').collect();
    match parts.as_slice() {
        [setting] => (setting.to_string(), String::new(), String::new()),
        [setting, present] => (setting.to_string(), present.to_string(), String::new()),
        [setting, present, pid] => (setting.to_string(), present.to_string(), pid.to_string()),
        _ => ("Unknown".into(), "Unknown".into(), String::new()),
    }
}

pub fn pod_status(pod: &Pod) -> TEndpointPodStatus {
    let status = pod.status.clone().unwrap_or_default();
    let mut out = TEndpointPodStatus {
        uid: pod.uid().unwrap_or_default(),
        name: pod.name_any(),
        id: pod.labels().get(labels::SERVER_ID).cloned().unwrap_or_default(),
        pod_ip: status.pod_ip.unwrap_or_default(),
        host_ip: status.host_ip.unwrap_or_default(),
        start_time: pod.metadata.creation_timestamp.clone(),
        setting_state: "Active".into(),
        ..TEndpointPodStatus::default()
    };
    if pod.metadata.deletion_timestamp.is_some() {
        out.present_state = "Terminating".into();
        out.present_message = format!("pod/{} is terminating", out.name);
        return out;
    }

    let conditions = status.conditions.unwrap_or_default();
    let find = |t: &str| conditions.iter().find(|c| c.type_ == t);
    let gate = find(labels::READINESS_GATE);

    if let Some(ready) = find("Ready").filter(|c| c.status == "True") {
        out.present_state = "Active".into();
        if let Some(gate) = gate {
            out.present_message = ready.message.clone().unwrap_or_default();
            out.pid = split_reason(gate.reason.as_deref().unwrap_or_default()).2;
        }
        return out;
    }

    let special = |c: &&PodCondition| {
        LEADING_CONDITIONS.contains(&c.type_.as_str()) || c.type_ == "Ready" || c.type_ == labels::READINESS_GATE
    };
    let ordered = LEADING_CONDITIONS.iter().filter_map(|t| find(*t)).chain(conditions.iter().filter(|c| !special(c)));
    for c in ordered {
        if c.status != "True" {
            out.present_state = c.reason.clone().unwrap_or_default();
            out.present_message = c.message.clone().unwrap_or_default();
            return out;
        }
        out.present_state = c.type_.clone();
        out.present_message = c.message.clone().unwrap_or_default();
    }

    if let Some(gate) = gate {
        (out.setting_state, out.present_state, out.pid) = split_reason(gate.reason.as_deref().unwrap_or_default());
    }
    out
}

pub struct TEndpointReconciler {
    ctx: Arc<Context>,
    queue: WorkQueue,
}

impl TEndpointReconciler {
    pub fn new(ctx: Arc<Context>) -> Arc<Self> {
        let queue = ctx.queue(NAME);
        Arc::new(Self { ctx, queue })
    }

    pub fn queue(&self) -> &WorkQueue { &self.queue }

    pub fn controller(self: &Arc<Self>, workers: usize) -> Controller {
        Controller::new(NAME, self.queue.clone(), workers, Arc::clone(self) as Arc<dyn Reconciler>)
    }

    async fn sync_status(&self, key: &ObjectKey, mut te: TEndpoint) -> Outcome {
        let selector = Selector::new()
            .equal(labels::SERVER_APP, &te.spec.app)
            .equal(labels::SERVER_NAME, &te.spec.server);
        let mut pods: Vec<TEndpointPodStatus> =
            self.ctx.pods.list(&key.namespace, &selector).iter().map(|p| pod_status(p)).collect();
        pods.sort_by(|a, b| a.name.cmp(&b.name));

        let observed = te.status.as_ref().map(|s| s.pod_status.as_slice()).unwrap_or_default();
        if observed == pods.as_slice() {
            return Outcome::Done;
        }
        debug!(key = %key, pods = pods.len(), "pod status changed");
        te.status = Some(TEndpointStatus { pod_status: pods });
        match self.ctx.tendpoints.client.update_status(&key.namespace, &te).await {
            Ok(_) => Outcome::Done,
            Err(e) => failed(NAME, "update_status", &key.namespace, &key.name, &e),
        }
    }
}

impl Receiver for TEndpointReconciler {
    fn receive(&self, n: &Notification) {
        match &n.object {
            Object::TServer(_) | Object::TEndpoint(_) => self.queue.add(&identity_key(&n.object)),
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
impl Reconciler for TEndpointReconciler {
    async fn reconcile(&self, key: &str) -> Outcome {
        let Some(key) = object_key(NAME, key) else { return Outcome::Fatal };
        let ctx = &self.ctx;
        let ts = match ctx.tservers.cache.get(&key.namespace, &key.name) {
            None => return retire(NAME, &ctx.tendpoints, &key, None).await,
            Some(ts) if ts.is_deleting() => return retire(NAME, &ctx.tendpoints, &key, Some(&*ts)).await,
            Some(ts) => ts,
        };

        let Some(te) = ctx.tendpoints.cache.get(&key.namespace, &key.name) else {
            return create(NAME, &ctx.tendpoints, &key, &build_tendpoint(&ts)).await;
        };
        if !is_controlled_by(&te.metadata, &ts) {
            return out_of_control(ctx, NAME, &ts, "TEndpoint").await;
        }

        let current = match dry_run_sync_tendpoint(&ts, &te) {
            None => TEndpoint::clone(&te),
            Some(target) => match ctx.tendpoints.client.update(&key.namespace, &target).await {
                Ok(updated) => updated,
                Err(e) => return failed(NAME, "update", &key.namespace, &key.name, &e),
            },
        };
        self.sync_status(&key, current).await
    }
}
