//! Keel apply: builds every resource derived from a TServer, and decides whether a live one has
//! drifted from what the TServer asks for.
//!
//! Drift is judged on a projection of the fields this controller sets (see [`diff`]), so values
//! the API server defaults or other writers add never cause churn.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use keel_core::labels;
use keel_schema::TServer;
use kube::{Resource, ResourceExt};
use thiserror::Error;

pub mod diff;
mod pod;
mod record;
mod service;
mod workload;

pub use diff::{covers, diff_summary, DiffSummary};
pub use pod::build_pod_template;
pub use record::{build_texited_record, build_tendpoint, dry_run_sync_tendpoint, exited_pod};
pub use service::{build_service, dry_run_sync_service};
pub use workload::{
    build_claim_templates, build_daemonset, build_statefulset, diff_claim_templates, dry_run_sync_daemonset,
    dry_run_sync_statefulset, local_volume_annotations, ClaimDiff,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    /// A tars-subtype server needs a node image and neither its release nor the namespace policy
    /// names one.
    #[error("no node image configured for {namespace}/{name}")]
    MissingNodeImage { namespace: String, name: String },
}

/// An in-place correction of a drifted child: the patch to send and what it changes, for logs.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncPlan {
    pub patch: keel_core::JsonPatch,
    pub summary: DiffSummary,
}

/// Namespace-level fallbacks for the node init container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeDefaults {
    pub image: Option<String>,
    pub secret: Option<String>,
}

/// `ServerApp`/`ServerName` labels that select everything derived from `ts`.
pub fn selector_labels(ts: &TServer) -> BTreeMap<String, String> {
    BTreeMap::from([
        (labels::SERVER_APP.to_string(), ts.spec.app.clone()),
        (labels::SERVER_NAME.to_string(), ts.spec.server.clone()),
    ])
}

/// Identity and controller reference shared by every child object of `ts`.
pub fn child_meta(ts: &TServer) -> ObjectMeta {
    ObjectMeta {
        name: Some(ts.name_any()),
        namespace: ts.namespace(),
        labels: Some(selector_labels(ts)),
        owner_references: owner_references(ts),
        ..ObjectMeta::default()
    }
}

pub fn owner_references(ts: &TServer) -> Option<Vec<OwnerReference>> {
    ts.controller_owner_ref(&()).map(|r| vec![r])
}

/// True when `meta` names `ts` as its controller.
pub fn is_controlled_by(meta: &ObjectMeta, ts: &TServer) -> bool {
    let Some(uid) = ts.meta().uid.as_deref() else { return false };
    meta.owner_references
        .iter()
        .flatten()
        .any(|r| r.controller == Some(true) && r.uid == uid)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use keel_schema::*;

    pub fn tserver(app: &str, server: &str) -> TServer {
        let name = keel_core::labels::child_name(app, server);
        let mut ts = TServer::new(
            &name,
            TServerSpec {
                app: app.into(),
                server: server.into(),
                sub_type: SubType::Tars,
                tars: Some(TServerTars {
                    servants: vec![TServerServant { name: "HelloObj".into(), port: 10000, is_tars: true, is_tcp: true, ..Default::default() }],
                    ..Default::default()
                }),
                k8s: TServerK8S { replicas: 2, ..Default::default() },
                release: Some(TServerRelease {
                    id: "v1".into(),
                    image: "registry/test-hello:v1".into(),
                    node_image: Some("tarsnode:v1".into()),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        ts.metadata.namespace = Some("tars".into());
        ts.metadata.uid = Some("11111111-2222-3333-4444-555555555555".into());
        convert::normalize_tserver(&mut ts);
        ts
    }
}
