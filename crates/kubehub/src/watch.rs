use std::fmt::Debug;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::NamespaceResourceScope;
use keel_store::{EventRouter, Watched};
use kube::api::Api;
use kube::runtime::reflector::store::Writer;
use kube::runtime::watcher::{self, Event};
use kube::runtime::{reflector, WatchStreamExt};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::ReflectorCache;

/// Which namespaces a watch covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchScope {
    All,
    Namespace(String),
}

impl WatchScope {
    fn api<K>(&self, client: Client) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        match self {
            WatchScope::All => Api::all(client),
            WatchScope::Namespace(ns) => Api::namespaced(client, ns),
        }
    }
}

/// A list+watch of `K` whose cache exists before the stream starts, so reconcilers can be built
/// over the cache and registered with the router before any event flows.
pub struct Watch<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    api: Api<K>,
    config: watcher::Config,
    writer: Writer<K>,
    cache: Arc<ReflectorCache<K>>,
}

impl<K> Watch<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Watched
        + Clone
        + DeserializeOwned
        + Debug
        + Send
        + Sync
        + 'static,
{
    pub fn new(client: Client, scope: &WatchScope, config: watcher::Config) -> Self {
        let (reader, writer) = reflector::store();
        Self { api: scope.api(client), config, writer, cache: Arc::new(ReflectorCache::new(reader)) }
    }

    pub fn cache(&self) -> Arc<ReflectorCache<K>> { Arc::clone(&self.cache) }

    /// Start streaming into the cache and the router.
    ///
    /// `modify` runs on each object before it is stored or routed; the TServer watch uses it to
    /// normalize older wire shapes into the internal model.
    pub fn spawn<F>(self, router: Arc<EventRouter>, modify: F) -> JoinHandle<()>
    where
        F: FnMut(&mut K) + Send + 'static,
    {
        let synced = self.cache.sync_flag();
        let kind = K::KIND;
        let stream = reflector::reflector(self.writer, watcher::watcher(self.api, self.config).default_backoff().modify(modify));
        tokio::spawn(async move {
            futures::pin_mut!(stream);
            info!(kind = %kind, "watcher started");
            while let Some(ev) = stream.next().await {
                match ev {
                    Ok(Event::Applied(o)) => router.applied(K::wrap(Arc::new(o))),
                    Ok(Event::Deleted(o)) => router.deleted(K::wrap(Arc::new(o))),
                    Ok(Event::Restarted(list)) => {
                        debug!(kind = %kind, count = list.len(), "watch restart");
                        router.restarted(kind, list.into_iter().map(|o| K::wrap(Arc::new(o))).collect());
                        synced.store(true, Ordering::Release);
                    }
                    Err(e) => warn!(kind = %kind, error = %e, "watch error; backing off"),
                }
            }
            warn!(kind = %kind, "watcher stream ended");
        })
    }
}
