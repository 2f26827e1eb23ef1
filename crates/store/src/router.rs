//! Fan-out of watch notifications to every registered receiver.
//!
//! Watch streams report "applied" and "deleted"; the router turns those into
//! Added/Modified/Deleted by remembering the last `resourceVersion` seen per object, and drops
//! Modified notifications whose version did not move (relists and resyncs).

use std::fmt;
use std::sync::{Arc, Mutex};

use k8s_openapi::api::apps::v1::{DaemonSet, StatefulSet};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use keel_core::Action;
use keel_schema::{TAccount, TConfig, TEndpoint, TExitedRecord, TFrameworkConfig, TServer};
use metrics::counter;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    TServer,
    TEndpoint,
    TExitedRecord,
    TConfig,
    TAccount,
    TFrameworkConfig,
    Pod,
    Service,
    StatefulSet,
    DaemonSet,
    PersistentVolumeClaim,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::TServer => "TServer",
            Kind::TEndpoint => "TEndpoint",
            Kind::TExitedRecord => "TExitedRecord",
            Kind::TConfig => "TConfig",
            Kind::TAccount => "TAccount",
            Kind::TFrameworkConfig => "TFrameworkConfig",
            Kind::Pod => "Pod",
            Kind::Service => "Service",
            Kind::StatefulSet => "StatefulSet",
            Kind::DaemonSet => "DaemonSet",
            Kind::PersistentVolumeClaim => "PersistentVolumeClaim",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// One watched object, tagged by kind.
#[derive(Debug, Clone)]
pub enum Object {
    TServer(Arc<TServer>),
    TEndpoint(Arc<TEndpoint>),
    TExitedRecord(Arc<TExitedRecord>),
    TConfig(Arc<TConfig>),
    TAccount(Arc<TAccount>),
    TFrameworkConfig(Arc<TFrameworkConfig>),
    Pod(Arc<Pod>),
    Service(Arc<Service>),
    StatefulSet(Arc<StatefulSet>),
    DaemonSet(Arc<DaemonSet>),
    PersistentVolumeClaim(Arc<PersistentVolumeClaim>),
}

/// Typed objects the router can carry.
pub trait Watched: Sized {
    const KIND: Kind;
    fn wrap(obj: Arc<Self>) -> Object;
}

macro_rules! watched {
    ($($ty:ident),* $(,)?) => {
        $(
            impl Watched for $ty {
                const KIND: Kind = Kind::$ty;
                fn wrap(obj: Arc<Self>) -> Object { Object::$ty(obj) }
            }
        )*

        impl Object {
            pub fn kind(&self) -> Kind {
                match self { $(Object::$ty(_) => Kind::$ty,)* }
            }

            pub fn meta(&self) -> &ObjectMeta {
                match self { $(Object::$ty(o) => &o.metadata,)* }
            }
        }
    };
}

watched!(
    TServer,
    TEndpoint,
    TExitedRecord,
    TConfig,
    TAccount,
    TFrameworkConfig,
    Pod,
    Service,
    StatefulSet,
    DaemonSet,
    PersistentVolumeClaim,
);

impl Object {
    pub fn namespace(&self) -> &str { self.meta().namespace.as_deref().unwrap_or_default() }
    pub fn name(&self) -> &str { self.meta().name.as_deref().unwrap_or_default() }
    pub fn labels(&self) -> Option<&std::collections::BTreeMap<String, String>> { self.meta().labels.as_ref() }
}

#[derive(Debug, Clone)]
pub struct Notification {
    pub action: Action,
    pub object: Object,
}

/// Receivers translate notifications into queue keys. They must not block or write.
pub trait Receiver: Send + Sync {
    fn receive(&self, n: &Notification);
}

type SeenKey = (Kind, String);

#[derive(Default)]
pub struct EventRouter {
    receivers: Vec<Arc<dyn Receiver>>,
    seen: Mutex<FxHashMap<SeenKey, (Option<String>, Object)>>,
}

impl EventRouter {
    pub fn new() -> Self { Self::default() }

    pub fn register(&mut self, receiver: Arc<dyn Receiver>) { self.receivers.push(receiver); }
    pub fn receivers(&self) -> usize { self.receivers.len() }

    fn seen_key(obj: &Object) -> SeenKey { (obj.kind(), format!("{}/{}", obj.namespace(), obj.name())) }

    /// An object was created or changed (or re-listed).
    pub fn applied(&self, object: Object) {
        let key = Self::seen_key(&object);
        let rv = object.meta().resource_version.clone();
        let previous = {
            let mut seen = self.seen.lock().unwrap_or_else(|p| p.into_inner());
            seen.insert(key, (rv.clone(), object.clone()))
        };
        let action = match previous {
            None => Action::Added,
            Some((Some(prev), _)) if rv.as_deref() == Some(prev.as_str()) => {
                counter!("router_suppressed_total", 1u64, "kind" => object.kind().as_str());
                trace!(kind = %object.kind(), ns = object.namespace(), name = object.name(), "unchanged version; suppressed");
                return;
            }
            Some(_) => Action::Modified,
        };
        self.dispatch(action, object);
    }

    pub fn deleted(&self, object: Object) {
        let key = Self::seen_key(&object);
        self.seen.lock().unwrap_or_else(|p| p.into_inner()).remove(&key);
        self.dispatch(Action::Deleted, object);
    }

    /// A watch stream re-listed `kind`. Objects seen before but missing from the listing were
    /// deleted while the stream was down.
    pub fn restarted(&self, kind: Kind, objects: Vec<Object>) {
        let present: FxHashSet<SeenKey> = objects.iter().map(Self::seen_key).collect();
        let vanished: Vec<Object> = {
            let seen = self.seen.lock().unwrap_or_else(|p| p.into_inner());
            seen.iter()
                .filter(|(k, _)| k.0 == kind && !present.contains(*k))
                .map(|(_, (_, o))| o.clone())
                .collect()
        };
        for o in vanished {
            self.deleted(o);
        }
        for o in objects {
            self.applied(o);
        }
    }

    fn dispatch(&self, action: Action, object: Object) {
        counter!("router_events_total", 1u64, "kind" => object.kind().as_str(), "action" => action.as_str());
        let n = Notification { action, object };
        for r in &self.receivers {
            r.receive(&n);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Tape(Mutex<Vec<(Action, String)>>);

    impl Receiver for Tape {
        fn receive(&self, n: &Notification) {
            self.0.lock().unwrap().push((n.action, n.object.name().to_string()));
        }
    }

    fn pod(name: &str, rv: &str) -> Object {
        Object::Pod(Arc::new(Pod {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("tars".into()),
                resource_version: Some(rv.into()),
                ..Default::default()
            },
            ..Default::default()
        }))
    }

    #[test]
    fn classifies_and_suppresses_unchanged_versions() {
        let tape = Arc::new(Tape::default());
        let mut router = EventRouter::new();
        router.register(tape.clone());
        router.applied(pod("a", "1"));
        router.applied(pod("a", "1"));
        router.applied(pod("a", "2"));
        router.deleted(pod("a", "2"));
        router.applied(pod("a", "3"));
        let got = tape.0.lock().unwrap().clone();
        assert_eq!(
            got,
            vec![
                (Action::Added, "a".to_string()),
                (Action::Modified, "a".to_string()),
                (Action::Deleted, "a".to_string()),
                (Action::Added, "a".to_string()),
            ]
        );
    }

    #[test]
    fn relist_reports_vanished_objects_as_deleted() {
        let tape = Arc::new(Tape::default());
        let mut router = EventRouter::new();
        router.register(tape.clone());
        router.applied(pod("a", "1"));
        router.applied(pod("b", "1"));
        router.restarted(Kind::Pod, vec![pod("a", "1")]);
        let got = tape.0.lock().unwrap().clone();
        assert_eq!(got[2], (Action::Deleted, "b".to_string()));
        // "a" unchanged on relist
        assert_eq!(got.len(), 3);
    }

    #[test]
    fn every_receiver_sees_every_event() {
        let a = Arc::new(Tape::default());
        let b = Arc::new(Tape::default());
        let mut router = EventRouter::new();
        router.register(a.clone());
        router.register(b.clone());
        router.applied(pod("x", "7"));
        assert_eq!(a.0.lock().unwrap().len(), 1);
        assert_eq!(b.0.lock().unwrap().len(), 1);
    }
}
