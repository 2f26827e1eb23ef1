//! In-memory stand-ins for the cluster, for tests of reconcilers and pools.
//!
//! `FakeApi<K>` is both the cache and the client of one kind: writes land in the same map the
//! cache reads, as if the watch caught up instantly. Every call is journaled, failed or not.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ObjectReference;
use keel_core::{ApiError, JsonPatch, Selector};
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::client::{Handle, ObjectCache, ResourceClient};
use crate::clock::Clock;
use crate::events::{EventSink, Report};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Create,
    Update,
    UpdateStatus,
    Patch,
    Delete,
    DeleteCollection,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub verb: Verb,
    pub namespace: String,
    /// Object name, or the rendered selector for `DeleteCollection`.
    pub target: String,
    pub patch: Option<JsonPatch>,
}

type Objects<K> = BTreeMap<(String, String), K>;

pub struct FakeApi<K> {
    objects: Mutex<Objects<K>>,
    calls: Mutex<Vec<Call>>,
    failures: Mutex<VecDeque<(Verb, ApiError)>>,
    version: AtomicU64,
    synced: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> { m.lock().unwrap_or_else(|p| p.into_inner()) }

fn identity<K: Resource>(obj: &K, namespace: &str) -> (String, String) {
    (namespace.to_string(), obj.meta().name.clone().unwrap_or_default())
}

impl<K> FakeApi<K>
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            objects: Mutex::new(BTreeMap::new()),
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
            version: AtomicU64::new(1),
            synced: AtomicBool::new(true),
        })
    }

    /// Cache and client backed by this fake.
    pub fn handle(self: &Arc<Self>) -> Handle<K> {
        Handle::new(Arc::clone(self) as Arc<dyn ObjectCache<K>>, Arc::clone(self) as Arc<dyn ResourceClient<K>>)
    }

    fn next_version(&self) -> String { self.version.fetch_add(1, Ordering::SeqCst).to_string() }

    fn stamp(&self, obj: &mut K, namespace: &str) {
        let meta = obj.meta_mut();
        meta.namespace = Some(namespace.to_string());
        if meta.uid.is_none() {
            meta.uid = Some(uuid::Uuid::new_v4().to_string());
        }
        meta.resource_version = Some(self.next_version());
    }

    /// Seed an object without journaling it.
    pub fn insert(&self, mut obj: K) -> K {
        let ns = obj.meta().namespace.clone().unwrap_or_default();
        self.stamp(&mut obj, &ns);
        lock(&self.objects).insert(identity(&obj, &ns), obj.clone());
        obj
    }

    /// Remove an object without journaling it.
    pub fn evict(&self, namespace: &str, name: &str) -> Option<K> {
        lock(&self.objects).remove(&(namespace.to_string(), name.to_string()))
    }

    pub fn object(&self, namespace: &str, name: &str) -> Option<K> {
        lock(&self.objects).get(&(namespace.to_string(), name.to_string())).cloned()
    }

    pub fn all(&self) -> Vec<K> { lock(&self.objects).values().cloned().collect() }
    pub fn calls(&self) -> Vec<Call> { lock(&self.calls).clone() }
    pub fn clear_calls(&self) { lock(&self.calls).clear(); }
    pub fn count(&self, verb: Verb) -> usize { lock(&self.calls).iter().filter(|c| c.verb == verb).count() }
    pub fn writes(&self) -> usize { lock(&self.calls).len() }

    /// The next call with `verb` fails with `err`.
    pub fn fail_next(&self, verb: Verb, err: ApiError) { lock(&self.failures).push_back((verb, err)); }

    pub fn set_synced(&self, synced: bool) { self.synced.store(synced, Ordering::SeqCst); }

    fn record(&self, verb: Verb, namespace: &str, target: &str, patch: Option<&JsonPatch>) -> Result<(), ApiError> {
        lock(&self.calls).push(Call {
            verb,
            namespace: namespace.to_string(),
            target: target.to_string(),
            patch: patch.cloned(),
        });
        let mut failures = lock(&self.failures);
        match failures.iter().position(|(v, _)| *v == verb) {
            Some(i) => Err(failures.remove(i).map(|(_, e)| e).unwrap_or(ApiError::Transient("injected".into()))),
            None => Ok(()),
        }
    }

    fn replace(&self, namespace: &str, obj: &K) -> Result<K, ApiError> {
        let key = identity(obj, namespace);
        let mut objects = lock(&self.objects);
        let current = objects.get(&key).ok_or(ApiError::NotFound)?;
        let sent = obj.meta().resource_version.as_deref();
        if sent.is_some() && sent != current.meta().resource_version.as_deref() {
            return Err(ApiError::Conflict(format!("stale resourceVersion for {}/{}", key.0, key.1)));
        }
        let mut next = obj.clone();
        next.meta_mut().uid = current.meta().uid.clone();
        next.meta_mut().namespace = Some(namespace.to_string());
        next.meta_mut().resource_version = Some(self.next_version());
        objects.insert(key, next.clone());
        Ok(next)
    }
}

impl<K> ObjectCache<K> for FakeApi<K>
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>> { self.object(namespace, name).map(Arc::new) }

    fn list(&self, namespace: &str, selector: &Selector) -> Vec<Arc<K>> {
        lock(&self.objects)
            .iter()
            .filter(|((ns, _), o)| ns == namespace && selector.matches(o.meta().labels.as_ref()))
            .map(|(_, o)| Arc::new(o.clone()))
            .collect()
    }

    fn has_synced(&self) -> bool { self.synced.load(Ordering::SeqCst) }
}

#[async_trait]
impl<K> ResourceClient<K> for FakeApi<K>
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn create(&self, namespace: &str, obj: &K) -> Result<K, ApiError> {
        let key = identity(obj, namespace);
        self.record(Verb::Create, namespace, &key.1, None)?;
        if lock(&self.objects).contains_key(&key) {
            return Err(ApiError::AlreadyExists);
        }
        let mut created = obj.clone();
        self.stamp(&mut created, namespace);
        lock(&self.objects).insert(key, created.clone());
        Ok(created)
    }

    async fn update(&self, namespace: &str, obj: &K) -> Result<K, ApiError> {
        self.record(Verb::Update, namespace, &identity(obj, namespace).1, None)?;
        self.replace(namespace, obj)
    }

    async fn update_status(&self, namespace: &str, obj: &K) -> Result<K, ApiError> {
        self.record(Verb::UpdateStatus, namespace, &identity(obj, namespace).1, None)?;
        self.replace(namespace, obj)
    }

    async fn patch(&self, namespace: &str, name: &str, patch: &JsonPatch) -> Result<K, ApiError> {
        self.record(Verb::Patch, namespace, name, Some(patch))?;
        let key = (namespace.to_string(), name.to_string());
        let mut objects = lock(&self.objects);
        let current = objects.get(&key).ok_or(ApiError::NotFound)?;
        let mut doc = serde_json::to_value(current).map_err(|e| ApiError::Invalid(e.to_string()))?;
        apply_patch(&mut doc, patch)?;
        let mut next: K = serde_json::from_value(doc).map_err(|e| ApiError::Invalid(e.to_string()))?;
        next.meta_mut().resource_version = Some(self.next_version());
        objects.insert(key, next.clone());
        Ok(next)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), ApiError> {
        self.record(Verb::Delete, namespace, name, None)?;
        lock(&self.objects).remove(&(namespace.to_string(), name.to_string())).map(|_| ()).ok_or(ApiError::NotFound)
    }

    async fn delete_collection(&self, namespace: &str, selector: &Selector) -> Result<(), ApiError> {
        self.record(Verb::DeleteCollection, namespace, &selector.to_string(), None)?;
        lock(&self.objects).retain(|(ns, _), o| !(ns == namespace && selector.matches(o.meta().labels.as_ref())));
        Ok(())
    }
}

/// Apply `patch` with the same engine the API client serialises into; a failing operation
/// leaves `doc` untouched.
pub fn apply_patch(doc: &mut Value, patch: &JsonPatch) -> Result<(), ApiError> {
    json_patch::patch(doc, &patch.to_document()?).map_err(|e| ApiError::Invalid(e.to_string()))
}

/// Event sink that keeps everything it is given.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<(ObjectReference, Report)>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }
    pub fn events(&self) -> Vec<(ObjectReference, Report)> { lock(&self.events).clone() }
    pub fn reasons(&self) -> Vec<String> { lock(&self.events).iter().map(|(_, r)| r.reason.clone()).collect() }
    pub fn len(&self) -> usize { lock(&self.events).len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn publish(&self, regarding: ObjectReference, report: Report) { lock(&self.events).push((regarding, report)); }
}

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn at(now: DateTime<Utc>) -> Arc<Self> { Arc::new(Self { now: Mutex::new(now) }) }
    pub fn advance(&self, d: chrono::Duration) { *lock(&self.now) += d; }
    pub fn set(&self, now: DateTime<Utc>) { *lock(&self.now) = now; }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> { *lock(&self.now) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use serde_json::json;

    fn cm(name: &str, label: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("ns".into()),
                labels: Some([("tier".to_string(), label.to_string())].into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn optimistic_concurrency_and_journal() {
        let api = FakeApi::<ConfigMap>::new();
        let created = api.create("ns", &cm("a", "x")).await.unwrap();
        assert!(created.metadata.uid.is_some());
        assert_eq!(api.create("ns", &cm("a", "x")).await, Err(ApiError::AlreadyExists));

        let mut stale = created.clone();
        api.update("ns", &created).await.unwrap();
        stale.data = Some([("k".to_string(), "v".to_string())].into());
        assert!(api.update("ns", &stale).await.unwrap_err().is_conflict());
        assert_eq!(api.count(Verb::Update), 2);
        assert_eq!(api.count(Verb::Create), 2);
    }

    #[tokio::test]
    async fn patches_and_collections() {
        let api = FakeApi::<ConfigMap>::new();
        api.insert(cm("a", "x"));
        api.insert(cm("b", "y"));
        let p = JsonPatch::new().add("/data", json!({"k": "v"}));
        let out = api.patch("ns", "a", &p).await.unwrap();
        assert_eq!(out.data.unwrap()["k"], "v");

        api.delete_collection("ns", &Selector::new().equal("tier", "x")).await.unwrap();
        assert!(api.object("ns", "a").is_none());
        assert!(api.object("ns", "b").is_some());
        assert_eq!(api.delete("ns", "a").await, Err(ApiError::NotFound));

        let bad = JsonPatch::new().add("/data/k2", json!("v2")).remove("/data/missing");
        assert!(matches!(api.patch("ns", "b", &bad).await, Err(ApiError::Invalid(_))));
        assert!(api.object("ns", "b").unwrap().data.is_none());

        api.fail_next(Verb::Delete, ApiError::Transient("boom".into()));
        assert!(matches!(api.delete("ns", "b").await, Err(ApiError::Transient(_))));
        assert!(api.delete("ns", "b").await.is_ok());
    }

    #[tokio::test]
    async fn label_pointers_are_unescaped() {
        let api = FakeApi::<ConfigMap>::new();
        api.insert(cm("a", "x"));
        let p = JsonPatch::new()
            .add(keel_core::patch::label_path("tars.io/Deleting"), json!(""))
            .remove(keel_core::patch::label_path("tier"));
        let labels = api.patch("ns", "a", &p).await.unwrap().metadata.labels.unwrap();
        assert_eq!(labels.into_iter().collect::<Vec<_>>(), [("tars.io/Deleting".to_string(), String::new())]);
    }
}
