//! Per-namespace runtime policy, read on every pass and replaced wholesale on change.

use std::sync::Arc;

use arc_swap::ArcSwap;
use keel_core::{labels, Action};
use keel_schema::TFrameworkConfig;
use rustc_hash::FxHashMap;
use tracing::info;

use crate::router::{Notification, Object, Receiver};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    pub max_exited_records: usize,
    pub max_config_history: usize,
    pub node_image: Option<String>,
    pub node_secret: Option<String>,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_exited_records: labels::DEFAULT_MAX_RECORD_LEN,
            max_config_history: labels::DEFAULT_MAX_CONFIG_HISTORY,
            node_image: None,
            node_secret: None,
        }
    }
}

fn non_empty(s: &str) -> Option<String> {
    let t = s.trim();
    (!t.is_empty()).then(|| t.to_string())
}

impl Policy {
    pub fn from_framework(cfg: &TFrameworkConfig) -> Self {
        let d = Policy::default();
        Self {
            max_exited_records: cfg.record_limit.texited_pod.map(|n| n as usize).filter(|n| *n > 0).unwrap_or(d.max_exited_records),
            max_config_history: cfg.record_limit.tconfig_history.map(|n| n as usize).filter(|n| *n > 0).unwrap_or(d.max_config_history),
            node_image: non_empty(&cfg.node_image.image),
            node_secret: non_empty(&cfg.node_image.secret),
        }
    }
}

/// Snapshot map namespace -> policy behind an atomic pointer. Readers never block writers.
pub struct PolicyRegistry {
    snap: ArcSwap<FxHashMap<String, Arc<Policy>>>,
    fallback: Arc<Policy>,
}

impl Default for PolicyRegistry {
    fn default() -> Self { Self::new(Policy::default()) }
}

impl PolicyRegistry {
    pub fn new(fallback: Policy) -> Self {
        Self { snap: ArcSwap::from_pointee(FxHashMap::default()), fallback: Arc::new(fallback) }
    }

    pub fn get(&self, namespace: &str) -> Arc<Policy> {
        self.snap.load().get(namespace).cloned().unwrap_or_else(|| Arc::clone(&self.fallback))
    }

    /// Install (`Some`) or clear (`None`) the policy of `namespace`.
    pub fn set(&self, namespace: &str, policy: Option<Policy>) {
        let policy = policy.map(Arc::new);
        self.snap.rcu(|cur| {
            let mut next = FxHashMap::clone(cur);
            match &policy {
                Some(p) => next.insert(namespace.to_string(), Arc::clone(p)),
                None => next.remove(namespace),
            };
            next
        });
    }
}

impl Receiver for PolicyRegistry {
    fn receive(&self, n: &Notification) {
        let Object::TFrameworkConfig(cfg) = &n.object else { return };
        if n.object.name() != labels::FRAMEWORK_CONFIG_NAME {
            return;
        }
        let ns = n.object.namespace();
        match n.action {
            Action::Deleted => self.set(ns, None),
            Action::Added | Action::Modified => {
                let p = Policy::from_framework(cfg);
                info!(ns = %ns, max_exited = p.max_exited_records, max_history = p.max_config_history, "policy updated");
                self.set(ns, Some(p));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_schema::{NodeImage, RecordLimit};

    fn framework(ns: &str, name: &str, texited: Option<u32>) -> Object {
        let mut cfg = TFrameworkConfig::new(ns, name);
        cfg.record_limit = RecordLimit { texited_pod: texited, tconfig_history: Some(3), timage_release: None };
        cfg.node_image = NodeImage { image: "tarsnode:1".into(), secret: "".into() };
        Object::TFrameworkConfig(Arc::new(cfg))
    }

    #[test]
    fn follows_framework_object_lifecycle() {
        let reg = PolicyRegistry::default();
        assert_eq!(*reg.get("tars"), Policy::default());

        reg.receive(&Notification { action: Action::Added, object: framework("tars", "tars-framework", Some(5)) });
        let p = reg.get("tars");
        assert_eq!(p.max_exited_records, 5);
        assert_eq!(p.max_config_history, 3);
        assert_eq!(p.node_image.as_deref(), Some("tarsnode:1"));
        assert_eq!(p.node_secret, None);
        assert_eq!(*reg.get("other"), Policy::default());

        // other names in the namespace are ignored
        reg.receive(&Notification { action: Action::Modified, object: framework("tars", "scratch", Some(9)) });
        assert_eq!(reg.get("tars").max_exited_records, 5);

        reg.receive(&Notification { action: Action::Deleted, object: framework("tars", "tars-framework", Some(5)) });
        assert_eq!(*reg.get("tars"), Policy::default());
    }

    #[test]
    fn zero_limits_fall_back_to_defaults() {
        let mut cfg = TFrameworkConfig::new("tars", "tars-framework");
        cfg.record_limit.texited_pod = Some(0);
        assert_eq!(Policy::from_framework(&cfg).max_exited_records, labels::DEFAULT_MAX_RECORD_LEN);
    }
}
