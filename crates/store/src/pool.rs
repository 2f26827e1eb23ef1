//! Worker pools: N tasks per reconciler pulling keys from its queue.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use keel_core::Outcome;
use metrics::{counter, histogram};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::queue::WorkQueue;

/// A level-triggered reconcile function keyed by an opaque string.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    async fn reconcile(&self, key: &str) -> Outcome;
}

/// One reconciler bound to its queue and worker count.
#[derive(Clone)]
pub struct Controller {
    name: &'static str,
    queue: WorkQueue,
    workers: usize,
    reconciler: Arc<dyn Reconciler>,
}

impl Controller {
    pub fn new(name: &'static str, queue: WorkQueue, workers: usize, reconciler: Arc<dyn Reconciler>) -> Self {
        Self { name, queue, workers: workers.max(1), reconciler }
    }

    pub fn name(&self) -> &'static str { self.name }
    pub fn queue(&self) -> &WorkQueue { &self.queue }
    pub fn workers(&self) -> usize { self.workers }

    pub fn spawn(&self) -> Vec<JoinHandle<()>> {
        (0..self.workers)
            .map(|idx| {
                let this = self.clone();
                tokio::spawn(async move { this.run_worker(idx).await })
            })
            .collect()
    }

    async fn run_worker(self, idx: usize) {
        debug!(controller = self.name, worker = idx, "worker started");
        while let Some(key) = self.queue.get().await {
            let outcome = self.process(&key).await;
            let fatal = apply_outcome(self.name, &self.queue, &key, outcome);
            self.queue.done(&key);
            if fatal {
                self.queue.shut_down();
            }
        }
        debug!(controller = self.name, worker = idx, "worker stopped");
    }

    /// Run one pass; a panic inside the pass is contained and treated as `Retry`.
    pub async fn process(&self, key: &str) -> Outcome {
        let started = Instant::now();
        let outcome = match AssertUnwindSafe(self.reconciler.reconcile(key)).catch_unwind().await {
            Ok(o) => o,
            Err(_) => {
                error!(controller = self.name, key = %key, "reconcile panicked");
                Outcome::Retry
            }
        };
        histogram!("reconcile_ms", started.elapsed().as_secs_f64() * 1000.0, "controller" => self.name);
        counter!("reconcile_total", 1u64, "controller" => self.name, "result" => outcome.as_str());
        outcome
    }
}

/// Translate an outcome into queue actions. Returns true when the pool must stop.
pub fn apply_outcome(name: &'static str, queue: &WorkQueue, key: &str, outcome: Outcome) -> bool {
    match outcome {
        Outcome::Done => {
            queue.forget(key);
            false
        }
        Outcome::Retry => {
            warn!(controller = name, key = %key, requeues = queue.num_requeues(key), "reconcile will retry");
            queue.add_rate_limited(key);
            false
        }
        Outcome::AddAfter(d) => {
            debug!(controller = name, key = %key, after_ms = d.as_millis() as u64, "reconcile re-check scheduled");
            queue.forget(key);
            queue.add_after(key, d);
            false
        }
        Outcome::Fatal => {
            error!(controller = name, key = %key, "invariant violated; stopping this reconciler");
            true
        }
    }
}
