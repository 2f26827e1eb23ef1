//! Leadership signal and the write fence built on it.

use std::sync::Arc;

use async_trait::async_trait;
use keel_core::{ApiError, JsonPatch, Selector};
use tokio::sync::watch;

use crate::client::ResourceClient;

/// Write side of the gate, driven by an elector.
pub struct LeaderSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl LeaderSignal {
    pub fn set(&self, leading: bool) { self.tx.send_replace(leading); }
}

/// Read side of the gate; cheap to clone.
#[derive(Clone)]
pub struct LeaderGate {
    rx: watch::Receiver<bool>,
    // keeps a fixed gate's channel open so `lost` never resolves spuriously
    _pin: Option<Arc<watch::Sender<bool>>>,
}

pub fn leader_gate() -> (LeaderSignal, LeaderGate) {
    let (tx, rx) = watch::channel(false);
    (LeaderSignal { tx: Arc::new(tx) }, LeaderGate { rx, _pin: None })
}

impl LeaderGate {
    /// A gate that is always open; for single-replica deployments and tests.
    pub fn always() -> Self {
        let (tx, rx) = watch::channel(true);
        Self { rx, _pin: Some(Arc::new(tx)) }
    }

    pub fn is_leader(&self) -> bool { *self.rx.borrow() }

    /// Wait until leadership is held. Returns false if the elector went away first.
    pub async fn acquired(&mut self) -> bool { self.rx.wait_for(|v| *v).await.is_ok() }

    /// Wait until leadership is lost or the elector went away.
    pub async fn lost(&mut self) { let _ = self.rx.wait_for(|v| !*v).await; }
}

/// Refuses every mutation while the gate is closed.
pub struct Fenced<K: Send + Sync + 'static> {
    inner: Arc<dyn ResourceClient<K>>,
    gate: LeaderGate,
}

impl<K: Send + Sync + 'static> Fenced<K> {
    pub fn new(inner: Arc<dyn ResourceClient<K>>, gate: LeaderGate) -> Self { Self { inner, gate } }

    fn check(&self) -> Result<(), ApiError> {
        if self.gate.is_leader() { Ok(()) } else { Err(ApiError::Fenced) }
    }
}

#[async_trait]
impl<K: Send + Sync + 'static> ResourceClient<K> for Fenced<K> {
    async fn create(&self, namespace: &str, obj: &K) -> Result<K, ApiError> {
        self.check()?;
        self.inner.create(namespace, obj).await
    }

    async fn update(&self, namespace: &str, obj: &K) -> Result<K, ApiError> {
        self.check()?;
        self.inner.update(namespace, obj).await
    }

    async fn update_status(&self, namespace: &str, obj: &K) -> Result<K, ApiError> {
        self.check()?;
        self.inner.update_status(namespace, obj).await
    }

    async fn patch(&self, namespace: &str, name: &str, patch: &JsonPatch) -> Result<K, ApiError> {
        self.check()?;
        self.inner.patch(namespace, name, patch).await
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), ApiError> {
        self.check()?;
        self.inner.delete(namespace, name).await
    }

    async fn delete_collection(&self, namespace: &str, selector: &Selector) -> Result<(), ApiError> {
        self.check()?;
        self.inner.delete_collection(namespace, selector).await
    }
}
