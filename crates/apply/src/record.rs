use k8s_openapi::api::core::v1::Pod;
use keel_core::labels;
use keel_schema::{TEndpoint, TEndpointSpec, TExitedPod, TExitedRecord, TServer};
use kube::ResourceExt;

use crate::{child_meta, is_controlled_by, owner_references, selector_labels};

fn endpoint_spec(ts: &TServer) -> TEndpointSpec {
    TEndpointSpec {
        app: ts.spec.app.clone(),
        server: ts.spec.server.clone(),
        sub_type: ts.spec.sub_type,
        important: ts.spec.important,
        tars: ts.spec.tars.clone(),
        normal: ts.spec.normal.clone(),
        host_ports: ts.spec.k8s.host_ports.clone(),
        release: ts.spec.release.clone(),
    }
}

pub fn build_tendpoint(ts: &TServer) -> TEndpoint {
    TEndpoint { metadata: child_meta(ts), spec: endpoint_spec(ts), status: None }
}

/// The TEndpoint with its spec, selector labels and controller reference brought back in line
/// with `ts`, or `None` when nothing drifted. Status is left as observed.
pub fn dry_run_sync_tendpoint(ts: &TServer, observed: &TEndpoint) -> Option<TEndpoint> {
    let spec = endpoint_spec(ts);
    let want_labels = selector_labels(ts);
    let labels_ok = observed
        .metadata
        .labels
        .as_ref()
        .map_or(false, |have| want_labels.iter().all(|(k, v)| have.get(k) == Some(v)));
    if observed.spec == spec && labels_ok && is_controlled_by(&observed.metadata, ts) {
        return None;
    }
    let mut out = observed.clone();
    out.spec = spec;
    out.metadata.labels.get_or_insert_with(Default::default).extend(want_labels);
    out.metadata.owner_references = owner_references(ts);
    Some(out)
}

pub fn build_texited_record(ts: &TServer) -> TExitedRecord {
    let mut r = TExitedRecord::new(&ts.namespace().unwrap_or_default(), &ts.name_any());
    r.metadata.labels = Some(selector_labels(ts));
    r.metadata.owner_references = owner_references(ts);
    r.app = ts.spec.app.clone();
    r.server = ts.spec.server.clone();
    r
}

/// Compact summary of a terminating pod of some TServer, with the (app, server) it belongs to.
///
/// `None` unless the pod is being deleted, has a uid, and carries both server labels.
pub fn exited_pod(pod: &Pod) -> Option<(String, String, TExitedPod)> {
    let deleted = pod.metadata.deletion_timestamp.clone()?;
    let uid = pod.metadata.uid.clone().filter(|u| !u.is_empty())?;
    let pod_labels = pod.metadata.labels.as_ref()?;
    let app = pod_labels.get(labels::SERVER_APP).filter(|s| !s.is_empty())?;
    let server = pod_labels.get(labels::SERVER_NAME).filter(|s| !s.is_empty())?;
    let status = pod.status.clone().unwrap_or_default();
    let entry = TExitedPod {
        uid,
        name: pod.name_any(),
        id: pod_labels.get(labels::SERVER_ID).cloned().unwrap_or_default(),
        node_ip: status.host_ip.unwrap_or_default(),
        pod_ip: status.pod_ip.unwrap_or_default(),
        create_time: pod.metadata.creation_timestamp.clone(),
        delete_time: Some(deleted),
    };
    Some((app.clone(), server.clone(), entry))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::tserver;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
    use std::collections::BTreeMap;

    #[test]
    fn tendpoint_sync_only_when_spec_or_identity_drifts() {
        let mut ts = tserver("Test", "Hello");
        let te = build_tendpoint(&ts);
        assert!(dry_run_sync_tendpoint(&ts, &te).is_none());

        ts.spec.k8s.host_ports = vec![keel_schema::TK8SHostPort { name_ref: "HelloObj".into(), port: 20000 }];
        let synced = dry_run_sync_tendpoint(&ts, &te).unwrap();
        assert_eq!(synced.spec.host_ports.len(), 1);
    }

    #[test]
    fn exited_pod_needs_deletion_and_labels() {
        let mut pod = Pod {
            metadata: ObjectMeta {
                name: Some("test-hello-0".into()),
                uid: Some("u-1".into()),
                labels: Some(BTreeMap::from([
                    (labels::SERVER_APP.to_string(), "Test".to_string()),
                    (labels::SERVER_NAME.to_string(), "Hello".to_string()),
                ])),
                ..ObjectMeta::default()
            },
            ..Pod::default()
        };
        assert!(exited_pod(&pod).is_none());

        pod.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        let (app, server, entry) = exited_pod(&pod).unwrap();
        assert_eq!((app.as_str(), server.as_str()), ("Test", "Hello"));
        assert_eq!(entry.uid, "u-1");
        assert!(entry.delete_time.is_some());
    }
}
