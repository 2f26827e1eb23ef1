//! Boundary adapter from older TServer shapes to the internal model.
//!
//! Reconcilers only ever see the normalised form: watch streams run every TServer through
//! [`normalize_tserver`] before it reaches a cache or a receiver.

use k8s_openapi::api::apps::v1::{RollingUpdateStatefulSetStrategy, StatefulSetUpdateStrategy};

use crate::tserver::TServer;

/// Update strategy applied when a TServer leaves it unset.
pub fn default_update_strategy() -> StatefulSetUpdateStrategy {
    StatefulSetUpdateStrategy {
        type_: Some("RollingUpdate".to_string()),
        rolling_update: Some(RollingUpdateStatefulSetStrategy { partition: Some(0), ..Default::default() }),
    }
}

pub fn normalize_tserver(ts: &mut TServer) {
    let k8s = &mut ts.spec.k8s;
    if let Some(gate) = k8s.readiness_gate.take() {
        if !gate.is_empty() && !k8s.readiness_gates.contains(&gate) {
            k8s.readiness_gates.push(gate);
        }
    }
    if k8s.update_strategy.is_none() {
        k8s.update_strategy = Some(default_update_strategy());
    }
    if let Some(release) = ts.spec.release.as_mut() {
        if release.node_image.as_deref().map(str::trim).map_or(false, str::is_empty) {
            release.node_image = None;
        }
        if release.node_secret.as_deref().map_or(false, str::is_empty) {
            release.node_secret = None;
        }
        if release.secret.as_deref().map_or(false, str::is_empty) {
            release.secret = None;
        }
    }
}
