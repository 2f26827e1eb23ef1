//! Keel reconcilers, one module per kind, all written against a shared [`Context`].
//!
//! Every reconciler is both a [`Receiver`] (it maps notifications to keys on its own queue) and
//! a [`Reconciler`](keel_store::Reconciler) (it converges one key per pass). [`wire`] builds the
//! whole set; the binary registers the receivers with the router and hands the controllers to the
//! manager.

#![forbid(unsafe_code)]

use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use keel_apply::{is_controlled_by, BuildError};
use keel_core::{labels, ApiError, ObjectKey, Outcome};
use keel_schema::TServer;
use keel_store::{delete_if_present, Controller, Handle, Object, Receiver, Report};
use kube::Resource;
use tracing::{debug, error, info, warn};

mod context;
pub mod daemonset;
pub mod pvc;
pub mod service;
pub mod statefulset;
pub mod taccount;
pub mod tconfig;
pub mod tendpoint;
pub mod texitedrecord;
pub mod tserver;

pub use context::{Context, Settings, Warnings};

/// Event reasons attached to TServers.
pub mod reasons {
    pub const OUT_CONTROL: &str = "OutControl";
    pub const NO_NODE_IMAGE: &str = "NoNodeImage";
    pub const REBUILD: &str = "Rebuild";
}

/// Worker count per reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workers {
    pub statefulset: usize,
    pub daemonset: usize,
    pub service: usize,
    pub tendpoint: usize,
    pub tserver: usize,
    pub texitedrecord: usize,
    pub tconfig: usize,
    pub taccount: usize,
    pub pvc: usize,
}

impl Default for Workers {
    fn default() -> Self {
        Self {
            statefulset: 3,
            daemonset: 1,
            service: 1,
            tendpoint: 3,
            tserver: 1,
            texitedrecord: 1,
            tconfig: 1,
            taccount: 1,
            pvc: 1,
        }
    }
}

pub struct Wiring {
    pub receivers: Vec<Arc<dyn Receiver>>,
    pub controllers: Vec<Controller>,
}

/// Build every reconciler over `ctx`.
pub fn wire(ctx: &Arc<Context>, workers: &Workers) -> Wiring {
    let sts = statefulset::StatefulSetReconciler::new(Arc::clone(ctx));
    let ds = daemonset::DaemonSetReconciler::new(Arc::clone(ctx));
    let svc = service::ServiceReconciler::new(Arc::clone(ctx));
    let te = tendpoint::TEndpointReconciler::new(Arc::clone(ctx));
    let ts = tserver::TServerReconciler::new(Arc::clone(ctx));
    let ter = texitedrecord::TExitedRecordReconciler::new(Arc::clone(ctx));
    let tc = tconfig::TConfigReconciler::new(Arc::clone(ctx));
    let ta = taccount::TAccountReconciler::new(Arc::clone(ctx));
    let pvc = pvc::PvcReconciler::new(Arc::clone(ctx));

    let mut controllers = vec![
        sts.controller(workers.statefulset),
        ds.controller(workers.daemonset),
        svc.controller(workers.service),
        te.controller(workers.tendpoint),
        ts.controller(workers.tserver),
        ter.controller(workers.texitedrecord),
        ta.controller(workers.taccount),
        pvc.controller(workers.pvc),
    ];
    controllers.extend(tc.controllers(workers.tconfig));

    let receivers: Vec<Arc<dyn Receiver>> = vec![
        sts as Arc<dyn Receiver>,
        ds as Arc<dyn Receiver>,
        svc as Arc<dyn Receiver>,
        te as Arc<dyn Receiver>,
        ts as Arc<dyn Receiver>,
        ter as Arc<dyn Receiver>,
        tc as Arc<dyn Receiver>,
        ta as Arc<dyn Receiver>,
        pvc as Arc<dyn Receiver>,
    ];
    Wiring { receivers, controllers }
}

/// `namespace/name` of a key, or `None` (logged) when the key is malformed.
pub(crate) fn object_key(controller: &'static str, key: &str) -> Option<ObjectKey> {
    match ObjectKey::parse(key) {
        Ok(k) => Some(k),
        Err(e) => {
            error!(controller, key = %key, error = %e, "unparseable reconcile key");
            None
        }
    }
}

/// `namespace/name` of a watched object.
pub(crate) fn identity_key(obj: &Object) -> String { format!("{}/{}", obj.namespace(), obj.name()) }

/// Key of the TServer an object is labelled with, if it carries both identity labels.
pub(crate) fn server_key(obj: &Object) -> Option<String> {
    let l = obj.labels()?;
    let app = l.get(labels::SERVER_APP).filter(|s| !s.is_empty())?;
    let server = l.get(labels::SERVER_NAME).filter(|s| !s.is_empty())?;
    Some(format!("{}/{}", obj.namespace(), labels::child_name(app, server)))
}

/// Log a failed call and ask for a rate-limited retry.
pub(crate) fn failed(controller: &'static str, verb: &'static str, ns: &str, name: &str, err: &ApiError) -> Outcome {
    warn!(controller, verb, ns = %ns, name = %name, error = %err, "api call failed");
    Outcome::Retry
}

/// True when `meta` is controlled by some TServer, whichever one it was.
pub(crate) fn controlled_by_any_tserver(meta: &ObjectMeta) -> bool {
    meta.owner_references.iter().flatten().any(|r| {
        r.controller == Some(true) && r.kind == TServer::kind(&()) && r.api_version == keel_schema::API_VERSION
    })
}

/// Delete a child that should not exist. Objects controlled by anything other than `owner` (or,
/// without an owner, by anything other than a TServer) are left alone.
pub(crate) async fn retire<K>(controller: &'static str, h: &Handle<K>, key: &ObjectKey, owner: Option<&TServer>) -> Outcome
where
    K: Resource<DynamicType = ()> + Send + Sync + 'static,
{
    let Some(child) = h.cache.get(&key.namespace, &key.name) else { return Outcome::Done };
    let owned = match owner {
        Some(ts) => is_controlled_by(child.meta(), ts),
        None => controlled_by_any_tserver(child.meta()),
    };
    if !owned {
        debug!(controller, key = %key, "not ours; leaving in place");
        return Outcome::Done;
    }
    if child.meta().deletion_timestamp.is_some() {
        return Outcome::Done;
    }
    match delete_if_present(&*h.client, &key.namespace, &key.name).await {
        Ok(()) => {
            info!(controller, key = %key, kind = %K::kind(&()), "deleted");
            Outcome::Done
        }
        Err(e) => failed(controller, "delete", &key.namespace, &key.name, &e),
    }
}

/// Create a child; losing the race to another writer counts as success.
pub(crate) async fn create<K>(controller: &'static str, h: &Handle<K>, key: &ObjectKey, obj: &K) -> Outcome
where
    K: Resource<DynamicType = ()> + Send + Sync + 'static,
{
    match h.client.create(&key.namespace, obj).await {
        Ok(_) => {
            info!(controller, key = %key, kind = %K::kind(&()), "created");
            Outcome::Done
        }
        Err(e) if e.is_already_exists() => Outcome::Done,
        Err(e) => failed(controller, "create", &key.namespace, &key.name, &e),
    }
}

/// A same-named object exists that `ts` does not control: report it and retry, never adopt.
pub(crate) async fn out_of_control(ctx: &Context, controller: &'static str, ts: &TServer, kind: &str) -> Outcome {
    let ns = ts.metadata.namespace.as_deref().unwrap_or_default();
    let name = ts.metadata.name.as_deref().unwrap_or_default();
    let note = format!("{kind} {ns}/{name} exists but is not controlled by TServer {ns}/{name}");
    warn!(controller, ns = %ns, name = %name, kind, "name taken by an object we do not control");
    let key = format!("{controller}/{kind}/{ns}/{name}");
    if ctx.warnings.admit(&key, ctx.clock.now(), &ctx.settings.backoff) {
        ctx.report(ts, Report::warning(reasons::OUT_CONTROL, "Reconcile", note)).await;
    }
    Outcome::Retry
}

pub(crate) async fn build_failed(ctx: &Context, controller: &'static str, ts: &TServer, err: BuildError) -> Outcome {
    match err {
        BuildError::MissingNodeImage { .. } => {
            warn!(controller, error = %err, "cannot build pod template");
            ctx.report(ts, Report::warning(reasons::NO_NODE_IMAGE, "Build", err.to_string())).await;
            Outcome::Retry
        }
    }
}
