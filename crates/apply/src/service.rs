use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use keel_core::JsonPatch;
use keel_schema::TServer;
use serde_json::json;

use crate::diff::{covers, diff_summary};
use crate::workload::label_ops;
use crate::{child_meta, selector_labels, SyncPlan};

fn service_port(name: &str, port: i32, is_tcp: bool) -> ServicePort {
    ServicePort {
        name: Some(name.to_lowercase()),
        protocol: Some(if is_tcp { "TCP" } else { "UDP" }.into()),
        port,
        target_port: Some(IntOrString::Int(port)),
        ..ServicePort::default()
    }
}

fn service_ports(ts: &TServer) -> Vec<ServicePort> {
    let mut out = Vec::new();
    if let Some(t) = &ts.spec.tars {
        out.extend(t.servants.iter().map(|s| service_port(&s.name, s.port, s.is_tcp)));
        out.extend(t.ports.iter().map(|p| service_port(&p.name, p.port, p.is_tcp)));
    }
    if let Some(n) = &ts.spec.normal {
        out.extend(n.ports.iter().map(|p| service_port(&p.name, p.port, p.is_tcp)));
    }
    out
}

/// Headless service selecting the pods of `ts`.
pub fn build_service(ts: &TServer) -> Service {
    let ports = service_ports(ts);
    Service {
        metadata: child_meta(ts),
        spec: Some(ServiceSpec {
            ports: (!ports.is_empty()).then_some(ports),
            selector: Some(selector_labels(ts)),
            cluster_ip: Some("None".into()),
            type_: Some("ClusterIP".into()),
            ..ServiceSpec::default()
        }),
        status: None,
    }
}

fn service_view(svc: &Service) -> serde_json::Value {
    let spec = svc.spec.clone().unwrap_or_default();
    json!({
        "labels": svc.metadata.labels,
        "ports": spec.ports.unwrap_or_default(),
        "selector": spec.selector,
    })
}

pub fn dry_run_sync_service(ts: &TServer, observed: &Service) -> Option<SyncPlan> {
    let desired = build_service(ts);
    let want = service_view(&desired);
    let have = service_view(observed);
    if covers(&want, &have) {
        return None;
    }
    let spec = desired.spec.unwrap_or_default();
    let patch = label_ops(JsonPatch::new(), &selector_labels(ts), observed.metadata.labels.as_ref())
        .add("/spec/ports", json!(spec.ports.unwrap_or_default()))
        .add("/spec/selector", json!(spec.selector));
    Some(SyncPlan { patch, summary: diff_summary(&want, &have) })
}
