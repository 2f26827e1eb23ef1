use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use keel_core::Selector;
use keel_store::ObjectCache;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::Resource;

/// Reflector-backed read cache. Readiness flips once the first listing has been applied.
pub struct ReflectorCache<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    store: Store<K>,
    synced: Arc<AtomicBool>,
}

impl<K> ReflectorCache<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    pub fn new(store: Store<K>) -> Self { Self { store, synced: Arc::new(AtomicBool::new(false)) } }

    pub(crate) fn sync_flag(&self) -> Arc<AtomicBool> { Arc::clone(&self.synced) }
}

impl<K> ObjectCache<K> for ReflectorCache<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        self.store.get(&ObjectRef::new(name).within(namespace))
    }

    fn list(&self, namespace: &str, selector: &Selector) -> Vec<Arc<K>> {
        self.store
            .state()
            .into_iter()
            .filter(|o| o.meta().namespace.as_deref() == Some(namespace))
            .filter(|o| selector.matches(o.meta().labels.as_ref()))
            .collect()
    }

    fn has_synced(&self) -> bool { self.synced.load(Ordering::Acquire) }
}
