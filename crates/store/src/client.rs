//! Read and write contracts the reconcilers are written against.
//!
//! Reads go through a local watch-fed cache; writes go to the authoritative store and come
//! back classified as [`ApiError`]. Both are trait objects so tests can swap in fakes.

use std::sync::Arc;

use async_trait::async_trait;
use keel_core::{ApiError, JsonPatch, Selector};

/// Per-kind local read cache.
pub trait ObjectCache<K>: Send + Sync {
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>>;
    fn list(&self, namespace: &str, selector: &Selector) -> Vec<Arc<K>>;
    fn has_synced(&self) -> bool;
}

/// Per-kind mutation surface. Every call is a network round trip.
#[async_trait]
pub trait ResourceClient<K: Send + Sync + 'static>: Send + Sync {
    async fn create(&self, namespace: &str, obj: &K) -> Result<K, ApiError>;
    /// Optimistic replace; a stale `resourceVersion` yields `ApiError::Conflict`.
    async fn update(&self, namespace: &str, obj: &K) -> Result<K, ApiError>;
    async fn update_status(&self, namespace: &str, obj: &K) -> Result<K, ApiError>;
    async fn patch(&self, namespace: &str, name: &str, patch: &JsonPatch) -> Result<K, ApiError>;
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), ApiError>;
    async fn delete_collection(&self, namespace: &str, selector: &Selector) -> Result<(), ApiError>;
}

/// Cache and client for one kind, handed to reconcilers as a unit.
pub struct Handle<K: Send + Sync + 'static> {
    pub cache: Arc<dyn ObjectCache<K>>,
    pub client: Arc<dyn ResourceClient<K>>,
}

impl<K: Send + Sync + 'static> Clone for Handle<K> {
    fn clone(&self) -> Self { Self { cache: Arc::clone(&self.cache), client: Arc::clone(&self.client) } }
}

impl<K: Send + Sync + 'static> Handle<K> {
    pub fn new(cache: Arc<dyn ObjectCache<K>>, client: Arc<dyn ResourceClient<K>>) -> Self { Self { cache, client } }
}

/// Deletes and treats absence as success.
pub async fn delete_if_present<K: Send + Sync + 'static>(
    client: &dyn ResourceClient<K>,
    namespace: &str,
    name: &str,
) -> Result<(), ApiError> {
    match client.delete(namespace, name).await {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}
