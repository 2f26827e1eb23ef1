//! Starts every worker pool behind the cache-sync and leadership gates, and fences them on the
//! way out.

use std::future::Future;
use std::time::Duration;

use futures::future::join_all;
use tracing::{info, warn};

use crate::leader::LeaderGate;
use crate::pool::Controller;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stop {
    /// The shutdown future resolved.
    Shutdown,
    /// Leadership was lost, or never acquired before the elector went away.
    LeadershipLost,
    /// Every pool stopped on its own (each hit a fatal outcome).
    Exhausted,
}

type SyncCheck = Box<dyn Fn() -> bool + Send + Sync>;

pub struct Manager {
    controllers: Vec<Controller>,
    synced: Vec<(&'static str, SyncCheck)>,
    drain_timeout: Duration,
    sync_poll: Duration,
}

impl Manager {
    pub fn new(drain_timeout: Duration) -> Self {
        Self { controllers: Vec::new(), synced: Vec::new(), drain_timeout, sync_poll: Duration::from_millis(100) }
    }

    pub fn add_controller(&mut self, c: Controller) { self.controllers.push(c); }
    pub fn controllers(&self) -> &[Controller] { &self.controllers }

    pub fn add_sync_check(&mut self, name: &'static str, check: impl Fn() -> bool + Send + Sync + 'static) {
        self.synced.push((name, Box::new(check)));
    }

    pub fn all_synced(&self) -> bool { self.synced.iter().all(|(_, f)| f()) }

    async fn wait_synced(&self) {
        let mut ticks = 0u32;
        while !self.all_synced() {
            ticks = ticks.wrapping_add(1);
            if ticks % 50 == 0 {
                let pending: Vec<&str> = self.synced.iter().filter(|(_, f)| !f()).map(|(n, _)| *n).collect();
                info!(pending = ?pending, "waiting for caches to sync");
            }
            tokio::time::sleep(self.sync_poll).await;
        }
    }

    pub async fn run<S>(self, mut gate: LeaderGate, shutdown: S) -> Stop
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        tokio::select! {
            _ = self.wait_synced() => info!(caches = self.synced.len(), "caches synced"),
            _ = &mut shutdown => return Stop::Shutdown,
        }
        tokio::select! {
            held = gate.acquired() => {
                if !held {
                    return Stop::LeadershipLost;
                }
            }
            _ = &mut shutdown => return Stop::Shutdown,
        }

        let workers: usize = self.controllers.iter().map(Controller::workers).sum();
        info!(controllers = self.controllers.len(), workers, "leadership held; starting worker pools");
        let handles: Vec<_> = self.controllers.iter().flat_map(Controller::spawn).collect();

        let stop = tokio::select! {
            _ = gate.lost() => Stop::LeadershipLost,
            _ = &mut shutdown => Stop::Shutdown,
            _ = join_all(handles) => Stop::Exhausted,
        };
        self.fence(stop).await;
        stop
    }

    /// Stop handing out work and wait for in-flight passes to finish.
    async fn fence(&self, stop: Stop) {
        if stop == Stop::LeadershipLost {
            warn!("leadership lost; fencing writes and draining in-flight work");
        }
        for c in &self.controllers {
            c.queue().shut_down();
        }
        let drains = self.controllers.iter().map(|c| async move { (c.name(), c.queue().drain(self.drain_timeout).await) });
        for (name, clean) in join_all(drains).await {
            if !clean {
                warn!(controller = name, timeout_ms = self.drain_timeout.as_millis() as u64, "in-flight work did not drain in time");
            }
        }
        info!(reason = ?stop, "worker pools stopped");
    }
}
