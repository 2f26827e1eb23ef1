use std::fmt::Debug;
use std::marker::PhantomData;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use keel_core::{ApiError, JsonPatch, Selector};
use keel_store::ResourceClient;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

/// Map a kube error onto the store's error taxonomy.
pub fn classify(err: kube::Error) -> ApiError {
    match err {
        kube::Error::Api(resp) => ApiError::from_status(resp.code, &resp.reason, &resp.message),
        other => ApiError::Transient(other.to_string()),
    }
}

/// Typed client for one namespaced kind.
pub struct KubeClient<K> {
    client: Client,
    field_manager: String,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeClient<K> {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self { client, field_manager: field_manager.into(), _kind: PhantomData }
    }
}

impl<K> KubeClient<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    fn api(&self, namespace: &str) -> Api<K> { Api::namespaced(self.client.clone(), namespace) }

    fn post_params(&self) -> PostParams { PostParams { dry_run: false, field_manager: Some(self.field_manager.clone()) } }
}

fn name_of<K: Resource>(obj: &K) -> Result<&str, ApiError> {
    obj.meta().name.as_deref().ok_or_else(|| ApiError::Invalid("object has no metadata.name".into()))
}

#[async_trait]
impl<K> ResourceClient<K> for KubeClient<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Serialize
        + DeserializeOwned
        + Debug
        + Send
        + Sync
        + 'static,
{
    async fn create(&self, namespace: &str, obj: &K) -> Result<K, ApiError> {
        self.api(namespace).create(&self.post_params(), obj).await.map_err(classify)
    }

    async fn update(&self, namespace: &str, obj: &K) -> Result<K, ApiError> {
        let name = name_of(obj)?;
        self.api(namespace).replace(name, &self.post_params(), obj).await.map_err(classify)
    }

    async fn update_status(&self, namespace: &str, obj: &K) -> Result<K, ApiError> {
        let name = name_of(obj)?;
        let body = serde_json::to_vec(obj).map_err(|e| ApiError::Invalid(e.to_string()))?;
        self.api(namespace).replace_status(name, &self.post_params(), body).await.map_err(classify)
    }

    async fn patch(&self, namespace: &str, name: &str, patch: &JsonPatch) -> Result<K, ApiError> {
        let doc = patch.to_document()?;
        debug!(kind = %K::kind(&()), ns = %namespace, name = %name, ops = patch.len(), "json patch");
        let pp = PatchParams { field_manager: Some(self.field_manager.clone()), ..PatchParams::default() };
        self.api(namespace).patch(name, &pp, &Patch::<()>::Json(doc)).await.map_err(classify)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), ApiError> {
        self.api(namespace).delete(name, &DeleteParams::background()).await.map(|_| ()).map_err(classify)
    }

    async fn delete_collection(&self, namespace: &str, selector: &Selector) -> Result<(), ApiError> {
        let lp = ListParams::default().labels(&selector.to_string());
        self.api(namespace)
            .delete_collection(&DeleteParams::background(), &lp)
            .await
            .map(|_| ())
            .map_err(classify)
    }
}
