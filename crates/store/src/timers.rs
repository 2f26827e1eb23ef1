//! Cancellable per-key delayed tasks.
//!
//! At most one timer is pending per key. Scheduling an earlier deadline replaces the pending
//! timer; a later one is dropped. Cancelled timers never fire.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::task::AbortHandle;
use tokio::time::Instant;

struct Timer {
    deadline: Instant,
    seq: u64,
    abort: AbortHandle,
}

#[derive(Default)]
pub struct TimerRegistry {
    entries: Mutex<FxHashMap<String, Timer>>,
    seq: AtomicU64,
}

impl TimerRegistry {
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }

    /// Run `fire` after `delay` unless an earlier timer for `key` is already pending.
    /// Returns whether the timer was registered.
    pub fn schedule<F>(self: &Arc<Self>, key: &str, delay: Duration, fire: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let deadline = Instant::now() + delay;
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(existing) = entries.get(key) {
            if existing.deadline <= deadline {
                return false;
            }
            existing.abort.abort();
        }
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let registry = Arc::clone(self);
        let owned = key.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if registry.take(&owned, seq) {
                fire();
            }
        });
        entries.insert(key.to_string(), Timer { deadline, seq, abort: handle.abort_handle() });
        true
    }

    /// Remove the entry if it still belongs to the timer identified by `seq`.
    fn take(&self, key: &str, seq: u64) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        match entries.get(key) {
            Some(t) if t.seq == seq => {
                entries.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn cancel(&self, key: &str) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        match entries.remove(key) {
            Some(t) => {
                t.abort.abort();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let n = entries.len();
        for (_, t) in entries.drain() {
            t.abort.abort();
        }
        n
    }

    pub fn pending(&self) -> usize { self.entries.lock().unwrap_or_else(|p| p.into_inner()).len() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn earlier_deadline_replaces_later() {
        let reg = TimerRegistry::new();
        let fired = Arc::new(Mutex::new(Vec::new()));
        let f1 = Arc::clone(&fired);
        let f2 = Arc::clone(&fired);
        assert!(reg.schedule("k", Duration::from_secs(10), move || f1.lock().unwrap().push("late")));
        assert!(reg.schedule("k", Duration::from_secs(1), move || f2.lock().unwrap().push("early")));
        let f3 = Arc::clone(&fired);
        assert!(!reg.schedule("k", Duration::from_secs(5), move || f3.lock().unwrap().push("ignored")));
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(*fired.lock().unwrap(), vec!["early"]);
        assert_eq!(reg.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timers_never_fire() {
        let reg = TimerRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        for key in ["a", "b", "c"] {
            let c = Arc::clone(&count);
            reg.schedule(key, Duration::from_millis(50), move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert!(reg.cancel("a"));
        assert!(!reg.cancel("a"));
        assert_eq!(reg.cancel_all(), 2);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
