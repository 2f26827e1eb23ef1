//! StatefulSet and DaemonSet builders, claim templates, and their in-place sync plans.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{
    DaemonSet, DaemonSetSpec, DaemonSetUpdateStrategy, RollingUpdateDaemonSet, StatefulSet, StatefulSetSpec,
};
use k8s_openapi::api::core::v1::{
    Container, PersistentVolumeClaim, PersistentVolumeClaimSpec, PodTemplateSpec, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use keel_core::patch::label_path;
use keel_core::{labels, JsonPatch};
use keel_schema::convert::default_update_strategy;
use keel_schema::TServer;
use kube::ResourceExt;
use serde_json::{json, Value as Json};

use crate::diff::{covers, diff_summary};
use crate::{build_pod_template, child_meta, selector_labels, BuildError, NodeDefaults, SyncPlan};

fn local_volume_claim(ts: &TServer, name: &str) -> PersistentVolumeClaim {
    let mut claim_labels = selector_labels(ts);
    claim_labels.insert(labels::LOCAL_VOLUME.into(), name.into());
    PersistentVolumeClaim {
        metadata: ObjectMeta { name: Some(name.into()), labels: Some(claim_labels.clone()), ..ObjectMeta::default() },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".into()]),
            selector: Some(LabelSelector { match_labels: Some(claim_labels), match_expressions: None }),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([("storage".to_string(), Quantity("1G".into()))])),
                ..VolumeResourceRequirements::default()
            }),
            storage_class_name: Some(labels::STORAGE_CLASS.into()),
            volume_mode: Some("Filesystem".into()),
            ..PersistentVolumeClaimSpec::default()
        }),
        status: None,
    }
}

/// Claim templates for the StatefulSet of `ts`: user templates, one per local volume, and a
/// placeholder claim that delays binding when the pod takes host resources.
pub fn build_claim_templates(ts: &TServer) -> Vec<PersistentVolumeClaim> {
    let k8s = &ts.spec.k8s;
    let mut out = Vec::new();
    for m in &k8s.mounts {
        if let Some(tpl) = &m.source.persistent_volume_claim_template {
            let mut pvc = tpl.clone();
            pvc.metadata.name = Some(m.name.clone());
            out.push(pvc);
        }
        if m.source.t_local_volume.is_some() {
            out.push(local_volume_claim(ts, &m.name));
        }
    }
    if k8s.host_ipc || k8s.host_network || !k8s.host_ports.is_empty() {
        out.push(local_volume_claim(ts, labels::HOST_BIND_PLACEHOLDER));
    }
    out
}

/// Expected PVC annotations per local-volume claim name. Unset fields are left alone.
pub fn local_volume_annotations(ts: &TServer) -> BTreeMap<String, BTreeMap<String, String>> {
    ts.spec
        .k8s
        .mounts
        .iter()
        .filter_map(|m| m.source.t_local_volume.as_ref().map(|v| (m.name.clone(), v)))
        .map(|(name, v)| {
            let mut ann = BTreeMap::new();
            for (key, value) in [
                (labels::LOCAL_VOLUME_UID, &v.uid),
                (labels::LOCAL_VOLUME_GID, &v.gid),
                (labels::LOCAL_VOLUME_MODE, &v.mode),
            ] {
                if let Some(value) = value {
                    ann.insert(key.to_string(), value.clone());
                }
            }
            (name, ann)
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClaimDiff {
    /// Observed templates already match the desired ones.
    pub equal: bool,
    /// Local-volume claims present on the workload but no longer desired.
    pub removed: Vec<String>,
}

fn claim_view(pvc: &PersistentVolumeClaim) -> Json {
    let spec = pvc.spec.clone().unwrap_or_default();
    json!({
        "name": pvc.metadata.name,
        "labels": pvc.metadata.labels,
        "accessModes": spec.access_modes.unwrap_or_default(),
        "resources": spec.resources,
        "selector": spec.selector,
        "storageClassName": spec.storage_class_name,
        "volumeMode": spec.volume_mode,
    })
}

/// Compare claim templates by name. Any addition, removal or change makes them unequal; claim
/// templates cannot be patched, so an unequal result means the workload must be rebuilt.
pub fn diff_claim_templates(observed: &[PersistentVolumeClaim], desired: &[PersistentVolumeClaim]) -> ClaimDiff {
    let by_name: BTreeMap<&str, &PersistentVolumeClaim> =
        desired.iter().map(|p| (p.metadata.name.as_deref().unwrap_or_default(), p)).collect();
    let mut equal = observed.len() == desired.len();
    let mut removed = Vec::new();
    for cur in observed {
        let name = cur.metadata.name.as_deref().unwrap_or_default();
        match by_name.get(name) {
            Some(want) => equal &= covers(&claim_view(want), &claim_view(cur)),
            None => {
                equal = false;
                let local = cur.spec.as_ref().and_then(|s| s.storage_class_name.as_deref()) == Some(labels::STORAGE_CLASS);
                if local {
                    removed.push(name.to_string());
                }
            }
        }
    }
    ClaimDiff { equal, removed }
}

pub fn build_statefulset(ts: &TServer, defaults: &NodeDefaults) -> Result<StatefulSet, BuildError> {
    let k8s = &ts.spec.k8s;
    let claims = build_claim_templates(ts);
    Ok(StatefulSet {
        metadata: child_meta(ts),
        spec: Some(StatefulSetSpec {
            replicas: Some(k8s.replicas),
            selector: LabelSelector { match_labels: Some(selector_labels(ts)), match_expressions: None },
            template: build_pod_template(ts, defaults)?,
            volume_claim_templates: (!claims.is_empty()).then_some(claims),
            service_name: ts.name_any(),
            pod_management_policy: k8s.pod_management_policy.clone(),
            update_strategy: Some(k8s.update_strategy.clone().unwrap_or_else(default_update_strategy)),
            revision_history_limit: Some(labels::DEFAULT_REVISION_HISTORY),
            ..StatefulSetSpec::default()
        }),
        status: None,
    })
}

fn daemonset_update_strategy(ts: &TServer) -> DaemonSetUpdateStrategy {
    let strategy = ts.spec.k8s.update_strategy.clone().unwrap_or_else(default_update_strategy);
    let partition = strategy.rolling_update.as_ref().and_then(|r| r.partition);
    DaemonSetUpdateStrategy {
        type_: strategy.type_,
        rolling_update: partition.map(|p| RollingUpdateDaemonSet {
            max_unavailable: Some(IntOrString::Int(p.max(1))),
            max_surge: None,
        }),
    }
}

pub fn build_daemonset(ts: &TServer, defaults: &NodeDefaults) -> Result<DaemonSet, BuildError> {
    Ok(DaemonSet {
        metadata: child_meta(ts),
        spec: Some(DaemonSetSpec {
            selector: LabelSelector { match_labels: Some(selector_labels(ts)), match_expressions: None },
            template: build_pod_template(ts, defaults)?,
            update_strategy: Some(daemonset_update_strategy(ts)),
            ..DaemonSetSpec::default()
        }),
        status: None,
    })
}

fn container_view(c: &Container) -> Json {
    json!({
        "image": c.image,
        "command": c.command.clone().unwrap_or_default(),
        "args": c.args.clone().unwrap_or_default(),
        "ports": c.ports.clone().unwrap_or_default(),
        "env": c.env.clone().unwrap_or_default(),
        "envFrom": c.env_from.clone().unwrap_or_default(),
        "resources": c.resources,
        "volumeMounts": c.volume_mounts.clone().unwrap_or_default(),
        "imagePullPolicy": c.image_pull_policy,
    })
}

/// The pod-template fields this controller owns. `main` names the server container.
pub(crate) fn template_view(t: &PodTemplateSpec, main: &str) -> Json {
    let spec = t.spec.clone().unwrap_or_default();
    let mains: Vec<Json> = spec.containers.iter().filter(|c| c.name == main).map(container_view).collect();
    let inits: Vec<Json> = spec
        .init_containers
        .iter()
        .flatten()
        .filter(|c| c.name == labels::NODE_CONTAINER)
        .map(|c| json!({"image": c.image, "env": c.env.clone().unwrap_or_default(), "volumeMounts": c.volume_mounts}))
        .collect();
    json!({
        "labels": t.metadata.as_ref().and_then(|m| m.labels.clone()),
        "main": mains,
        "init": inits,
        "volumes": spec.volumes.unwrap_or_default(),
        "affinity": spec.affinity,
        "readinessGates": spec.readiness_gates.unwrap_or_default(),
        "hostNetwork": spec.host_network.unwrap_or(false),
        "hostIPC": spec.host_ipc.unwrap_or(false),
        "serviceAccountName": spec.service_account_name.unwrap_or_default(),
        "imagePullSecrets": spec.image_pull_secrets.unwrap_or_default(),
        "dnsPolicy": spec.dns_policy,
        "dnsConfig": spec.dns_config,
        "enableServiceLinks": spec.enable_service_links,
    })
}

/// Desired template plus every container and init container some other writer added.
fn merge_foreign(desired: &PodTemplateSpec, observed: &PodTemplateSpec, main: &str) -> PodTemplateSpec {
    let mut out = desired.clone();
    let Some(cur) = observed.spec.as_ref() else { return out };
    if let Some(spec) = out.spec.as_mut() {
        spec.containers.extend(cur.containers.iter().filter(|c| c.name != main).cloned());
        let foreign_inits: Vec<Container> =
            cur.init_containers.iter().flatten().filter(|c| c.name != labels::NODE_CONTAINER).cloned().collect();
        if !foreign_inits.is_empty() {
            spec.init_containers.get_or_insert_with(Vec::new).extend(foreign_inits);
        }
    }
    out
}

/// Ops that make every label in `want` present on an object whose labels are `have`.
pub(crate) fn label_ops(
    mut patch: JsonPatch,
    want: &BTreeMap<String, String>,
    have: Option<&BTreeMap<String, String>>,
) -> JsonPatch {
    let Some(have) = have else {
        return patch.add("/metadata/labels", json!(want));
    };
    for (k, v) in want {
        if have.get(k) != Some(v) {
            patch = patch.add(label_path(k), json!(v));
        }
    }
    patch
}

fn to_json<T: serde::Serialize>(v: &T) -> Json { serde_json::to_value(v).unwrap_or(Json::Null) }

fn statefulset_view(sts: &StatefulSet, main: &str) -> Json {
    let spec = sts.spec.clone().unwrap_or_default();
    json!({
        "labels": sts.metadata.labels,
        "replicas": spec.replicas,
        "updateStrategy": spec.update_strategy,
        "template": template_view(&spec.template, main),
    })
}

fn daemonset_view(ds: &DaemonSet, main: &str) -> Json {
    let spec = ds.spec.clone().unwrap_or_default();
    json!({
        "labels": ds.metadata.labels,
        "updateStrategy": spec.update_strategy,
        "template": template_view(&spec.template, main),
    })
}

/// The patch that brings `observed` back in line with `ts`, or `None` when nothing drifted.
/// Claim templates are not considered here; see [`diff_claim_templates`].
pub fn dry_run_sync_statefulset(
    ts: &TServer,
    observed: &StatefulSet,
    defaults: &NodeDefaults,
) -> Result<Option<SyncPlan>, BuildError> {
    let desired = build_statefulset(ts, defaults)?;
    let main = ts.name_any();
    let want = statefulset_view(&desired, &main);
    let have = statefulset_view(observed, &main);
    if covers(&want, &have) {
        return Ok(None);
    }
    let want_spec = desired.spec.unwrap_or_default();
    let have_spec = observed.spec.clone().unwrap_or_default();
    let patch = label_ops(JsonPatch::new(), &selector_labels(ts), observed.metadata.labels.as_ref())
        .add("/spec/replicas", json!(want_spec.replicas))
        .add("/spec/updateStrategy", to_json(&want_spec.update_strategy))
        .add("/spec/template", to_json(&merge_foreign(&want_spec.template, &have_spec.template, &main)));
    Ok(Some(SyncPlan { patch, summary: diff_summary(&want, &have) }))
}

pub fn dry_run_sync_daemonset(
    ts: &TServer,
    observed: &DaemonSet,
    defaults: &NodeDefaults,
) -> Result<Option<SyncPlan>, BuildError> {
    let desired = build_daemonset(ts, defaults)?;
    let main = ts.name_any();
    let want = daemonset_view(&desired, &main);
    let have = daemonset_view(observed, &main);
    if covers(&want, &have) {
        return Ok(None);
    }
    let want_spec = desired.spec.unwrap_or_default();
    let have_spec = observed.spec.clone().unwrap_or_default();
    let patch = label_ops(JsonPatch::new(), &selector_labels(ts), observed.metadata.labels.as_ref())
        .add("/spec/updateStrategy", to_json(&want_spec.update_strategy))
        .add("/spec/template", to_json(&merge_foreign(&want_spec.template, &have_spec.template, &main)));
    Ok(Some(SyncPlan { patch, summary: diff_summary(&want, &have) }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::tserver;
    use keel_schema::{TK8SMount, TK8SMountSource, TLocalVolume};
    use k8s_openapi::api::apps::v1::StatefulSetUpdateStrategy;

    fn local_mount(name: &str) -> TK8SMount {
        TK8SMount {
            name: name.into(),
            mount_path: format!("/data/{name}"),
            source: TK8SMountSource { t_local_volume: Some(TLocalVolume { uid: Some("1000".into()), ..Default::default() }), ..Default::default() },
            ..Default::default()
        }
    }

    /// What the API server hands back: our object plus defaults and foreign additions.
    fn as_served(mut sts: StatefulSet) -> StatefulSet {
        sts.metadata.labels.get_or_insert_with(Default::default).insert("team".into(), "a".into());
        let spec = sts.spec.as_mut().unwrap();
        let pod = spec.template.spec.as_mut().unwrap();
        for c in &mut pod.containers {
            c.termination_message_path = Some("/dev/termination-log".into());
            c.image_pull_policy.get_or_insert_with(|| "IfNotPresent".into());
        }
        pod.containers.push(Container { name: "sidecar".into(), image: Some("envoy".into()), ..Default::default() });
        pod.scheduler_name = Some("default-scheduler".into());
        sts
    }

    #[test]
    fn served_statefulset_does_not_drift() {
        let ts = tserver("Test", "Hello");
        let sts = as_served(build_statefulset(&ts, &NodeDefaults::default()).unwrap());
        assert_eq!(dry_run_sync_statefulset(&ts, &sts, &NodeDefaults::default()).unwrap(), None);
    }

    #[test]
    fn image_change_patches_template_and_keeps_sidecar() {
        let mut ts = tserver("Test", "Hello");
        let sts = as_served(build_statefulset(&ts, &NodeDefaults::default()).unwrap());
        ts.spec.release.as_mut().unwrap().image = "registry/test-hello:v2".into();
        let plan = dry_run_sync_statefulset(&ts, &sts, &NodeDefaults::default()).unwrap().unwrap();
        assert!(plan.summary.updates >= 1);
        let template = plan
            .patch
            .ops()
            .iter()
            .find_map(|op| match op {
                keel_core::PatchOp::Add { path, value } if path == "/spec/template" => Some(value.clone()),
                _ => None,
            })
            .unwrap();
        let names: Vec<_> = template["spec"]["containers"].as_array().unwrap().iter().map(|c| c["name"].clone()).collect();
        assert_eq!(names, [json!("test-hello"), json!("sidecar")]);
        assert_eq!(template["spec"]["containers"][0]["image"], "registry/test-hello:v2");
    }

    #[test]
    fn removed_env_is_drift() {
        let mut ts = tserver("Test", "Hello");
        ts.spec.k8s.env = vec![k8s_openapi::api::core::v1::EnvVar { name: "A".into(), value: Some("1".into()), value_from: None }];
        let sts = build_statefulset(&ts, &NodeDefaults::default()).unwrap();
        ts.spec.k8s.env.clear();
        assert!(dry_run_sync_statefulset(&ts, &sts, &NodeDefaults::default()).unwrap().is_some());
    }

    #[test]
    fn claim_templates_detect_add_change_and_remove() {
        let mut ts = tserver("Test", "Hello");
        ts.spec.k8s.mounts = vec![local_mount("data"), local_mount("logs")];
        let before = build_claim_templates(&ts);
        assert_eq!(before.len(), 2);
        assert_eq!(diff_claim_templates(&before, &before), ClaimDiff { equal: true, removed: vec![] });

        ts.spec.k8s.mounts.pop();
        let after = build_claim_templates(&ts);
        assert_eq!(diff_claim_templates(&before, &after), ClaimDiff { equal: false, removed: vec!["logs".into()] });

        // an addition alone removes nothing
        assert_eq!(diff_claim_templates(&after, &before), ClaimDiff { equal: false, removed: vec![] });

        ts.spec.k8s.host_network = true;
        let with_placeholder = build_claim_templates(&ts);
        assert!(with_placeholder.iter().any(|p| p.metadata.name.as_deref() == Some("delay-bind")));
    }

    #[test]
    fn daemonset_strategy_maps_partition_to_max_unavailable() {
        let mut ts = tserver("Test", "Hello");
        ts.spec.k8s.daemon_set = true;
        let us = daemonset_update_strategy(&ts);
        assert_eq!(us.rolling_update.unwrap().max_unavailable, Some(IntOrString::Int(1)));

        ts.spec.k8s.update_strategy = Some(StatefulSetUpdateStrategy { type_: Some("OnDelete".into()), rolling_update: None });
        let us = daemonset_update_strategy(&ts);
        assert_eq!(us.type_.as_deref(), Some("OnDelete"));
        assert!(us.rolling_update.is_none());
    }

    #[test]
    fn local_volume_annotations_skip_unset_fields() {
        let mut ts = tserver("Test", "Hello");
        ts.spec.k8s.mounts = vec![local_mount("data")];
        let ann = local_volume_annotations(&ts);
        assert_eq!(ann["data"], BTreeMap::from([(labels::LOCAL_VOLUME_UID.to_string(), "1000".to_string())]));
    }
}
