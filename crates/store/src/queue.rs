//! Deduplicating work queue with delayed and rate-limited adds.
//!
//! A key is held at most once while pending and at most once while in flight. Re-adding an
//! in-flight key marks it dirty; `done` puts it back so the next pass observes the latest state.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use metrics::counter;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tracing::debug;

use crate::timers::TimerRegistry;

/// Per-key exponential backoff: `base * 2^(failures-1)`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub base: Duration,
    pub max: Duration,
}

impl Default for RateLimit {
    fn default() -> Self { Self { base: Duration::from_millis(5), max: Duration::from_secs(1000) } }
}

impl RateLimit {
    pub fn delay(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(31);
        self.base.checked_mul(1u32 << exp).map_or(self.max, |d| d.min(self.max))
    }
}

#[derive(Default)]
struct State {
    queue: VecDeque<String>,
    dirty: FxHashSet<String>,
    processing: FxHashSet<String>,
    failures: FxHashMap<String, u32>,
    shutting_down: bool,
}

struct Inner {
    name: &'static str,
    state: Mutex<State>,
    ready: Notify,
    idle: Notify,
    limit: RateLimit,
    timers: Arc<TimerRegistry>,
}

#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

impl WorkQueue {
    pub fn new(name: &'static str) -> Self { Self::with_rate_limit(name, RateLimit::default()) }

    pub fn with_rate_limit(name: &'static str, limit: RateLimit) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                state: Mutex::new(State::default()),
                ready: Notify::new(),
                idle: Notify::new(),
                limit,
                timers: TimerRegistry::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> { self.inner.state.lock().unwrap_or_else(|p| p.into_inner()) }

    pub fn name(&self) -> &'static str { self.inner.name }
    pub fn len(&self) -> usize { self.state().queue.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
    pub fn in_flight(&self) -> usize { self.state().processing.len() }
    pub fn is_shutting_down(&self) -> bool { self.state().shutting_down }
    pub fn num_requeues(&self, key: &str) -> u32 { self.state().failures.get(key).copied().unwrap_or(0) }
    pub fn pending_timers(&self) -> usize { self.inner.timers.pending() }

    pub fn add(&self, key: &str) {
        let mut st = self.state();
        if st.shutting_down || st.dirty.contains(key) {
            return;
        }
        st.dirty.insert(key.to_string());
        counter!("queue_adds_total", 1u64, "queue" => self.inner.name);
        if st.processing.contains(key) {
            return;
        }
        st.queue.push_back(key.to_string());
        drop(st);
        self.inner.ready.notify_one();
    }

    pub fn add_after(&self, key: &str, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        if self.is_shutting_down() {
            return;
        }
        let queue = self.clone();
        let owned = key.to_string();
        self.inner.timers.schedule(key, delay, move || queue.add(&owned));
    }

    pub fn add_rate_limited(&self, key: &str) {
        let failures = {
            let mut st = self.state();
            let n = st.failures.entry(key.to_string()).or_insert(0);
            *n = n.saturating_add(1);
            *n
        };
        let delay = self.inner.limit.delay(failures);
        counter!("queue_retries_total", 1u64, "queue" => self.inner.name);
        debug!(queue = self.inner.name, key = %key, failures, delay_ms = delay.as_millis() as u64, "requeue with backoff");
        self.add_after(key, delay);
    }

    /// Reset the backoff counter for `key`.
    pub fn forget(&self, key: &str) { self.state().failures.remove(key); }

    /// Next key to process, or `None` once the queue is shut down. Keys still pending at
    /// shutdown are abandoned.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.inner.ready.notified();
            {
                let mut st = self.state();
                if st.shutting_down {
                    return None;
                }
                if let Some(key) = st.queue.pop_front() {
                    st.dirty.remove(&key);
                    st.processing.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    pub fn done(&self, key: &str) {
        let mut st = self.state();
        st.processing.remove(key);
        let requeue = !st.shutting_down && st.dirty.contains(key);
        if requeue {
            st.queue.push_back(key.to_string());
        }
        let idle = st.processing.is_empty();
        drop(st);
        if requeue {
            self.inner.ready.notify_one();
        }
        if idle {
            self.inner.idle.notify_waiters();
        }
    }

    pub fn shut_down(&self) {
        {
            let mut st = self.state();
            if st.shutting_down {
                return;
            }
            st.shutting_down = true;
        }
        let cancelled = self.inner.timers.cancel_all();
        debug!(queue = self.inner.name, cancelled, "queue shut down");
        self.inner.ready.notify_waiters();
    }

    /// Shut down and wait until no key is in flight. Returns false on timeout.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.shut_down();
        let wait = async {
            loop {
                let notified = self.inner.idle.notified();
                if self.state().processing.is_empty() {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let rl = RateLimit { base: Duration::from_millis(5), max: Duration::from_millis(100) };
        assert_eq!(rl.delay(1), Duration::from_millis(5));
        assert_eq!(rl.delay(2), Duration::from_millis(10));
        assert_eq!(rl.delay(4), Duration::from_millis(40));
        assert_eq!(rl.delay(6), Duration::from_millis(100));
        assert_eq!(rl.delay(u32::MAX), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn pending_duplicates_collapse() {
        let q = WorkQueue::new("t");
        q.add("a");
        q.add("b");
        q.add("a");
        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await.as_deref(), Some("a"));
        assert_eq!(q.get().await.as_deref(), Some("b"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn in_flight_key_is_requeued_once_after_done() {
        let q = WorkQueue::new("t");
        q.add("a");
        let k = q.get().await.unwrap();
        q.add("a");
        q.add("a");
        // not eligible while in flight
        assert!(q.is_empty());
        q.done(&k);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await.as_deref(), Some("a"));
        q.done("a");
        assert!(q.is_empty());
        assert_eq!(q.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_adds_back_off_until_forgotten() {
        let q = WorkQueue::with_rate_limit("t", RateLimit { base: Duration::from_millis(10), max: Duration::from_secs(1) });
        q.add_rate_limited("a");
        q.add_rate_limited("a");
        assert_eq!(q.num_requeues("a"), 2);
        // the first (10ms) timer wins over the later (20ms) one
        assert_eq!(q.pending_timers(), 1);
        tokio::time::sleep(Duration::from_millis(11)).await;
        assert_eq!(q.len(), 1);
        q.forget("a");
        assert_eq!(q.num_requeues("a"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn add_after_fires_once() {
        let q = WorkQueue::new("t");
        q.add_after("a", Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(q.is_empty());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn shutdown_wakes_waiters_and_drops_work() {
        let q = WorkQueue::new("t");
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;
        q.shut_down();
        assert_eq!(waiter.await.unwrap(), None);
        q.add("late");
        assert!(q.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn drain_waits_for_in_flight() {
        let q = WorkQueue::new("t");
        q.add("a");
        let key = q.get().await.unwrap();
        let finisher = {
            let q = q.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                q.done(&key);
            })
        };
        assert!(q.drain(Duration::from_secs(1)).await);
        finisher.await.unwrap();

        let stuck = WorkQueue::new("s");
        stuck.add("x");
        let _held = stuck.get().await.unwrap();
        assert!(!stuck.drain(Duration::from_millis(100)).await);
    }
}
