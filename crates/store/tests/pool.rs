use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use keel_core::Outcome;
use keel_store::{leader_gate, Controller, LeaderGate, Manager, Reconciler, Stop, WorkQueue};

/// Replays a scripted outcome per key, then `Done`.
#[derive(Default)]
struct Script {
    plan: Mutex<Vec<(String, Outcome)>>,
    seen: Mutex<Vec<String>>,
}

impl Script {
    fn with(plan: &[(&str, Outcome)]) -> Arc<Self> {
        Arc::new(Self {
            plan: Mutex::new(plan.iter().map(|(k, o)| (k.to_string(), *o)).collect()),
            seen: Mutex::default(),
        })
    }

    fn seen(&self) -> Vec<String> { self.seen.lock().unwrap().clone() }
}

#[async_trait]
impl Reconciler for Script {
    async fn reconcile(&self, key: &str) -> Outcome {
        self.seen.lock().unwrap().push(key.to_string());
        let mut plan = self.plan.lock().unwrap();
        match plan.iter().position(|(k, _)| k == key) {
            Some(i) => plan.remove(i).1,
            None => Outcome::Done,
        }
    }
}

struct Panics;

#[async_trait]
impl Reconciler for Panics {
    async fn reconcile(&self, _key: &str) -> Outcome { panic!("boom") }
}

async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn fatal_stops_only_the_issuing_pool() {
    let a = Script::with(&[("ns/bad", Outcome::Fatal)]);
    let b = Script::with(&[]);
    let qa = WorkQueue::new("a");
    let qb = WorkQueue::new("b");
    let mut handles = Controller::new("a", qa.clone(), 2, a.clone()).spawn();
    handles.extend(Controller::new("b", qb.clone(), 2, b.clone()).spawn());

    qa.add("ns/bad");
    settle().await;
    assert!(qa.is_shutting_down());
    qa.add("ns/after");
    qb.add("ns/x");
    settle().await;
    assert_eq!(a.seen(), vec!["ns/bad"]);
    assert_eq!(b.seen(), vec!["ns/x"]);
    assert!(!qb.is_shutting_down());
    qb.shut_down();
    for h in handles {
        h.await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn retry_backs_off_and_add_after_waits() {
    let s = Script::with(&[("ns/r", Outcome::Retry), ("ns/later", Outcome::AddAfter(Duration::from_secs(3)))]);
    let q = WorkQueue::new("t");
    let handles = Controller::new("t", q.clone(), 1, s.clone()).spawn();

    q.add("ns/r");
    q.add("ns/later");
    settle().await;
    assert_eq!(s.seen(), vec!["ns/r", "ns/later"]);

    // the first retry is due after the base backoff
    tokio::time::sleep(Duration::from_millis(10)).await;
    settle().await;
    assert_eq!(s.seen().iter().filter(|k| *k == "ns/r").count(), 2);
    assert_eq!(q.num_requeues("ns/r"), 0);

    tokio::time::sleep(Duration::from_secs(2)).await;
    settle().await;
    assert_eq!(s.seen().iter().filter(|k| *k == "ns/later").count(), 1);
    tokio::time::sleep(Duration::from_secs(2)).await;
    settle().await;
    assert_eq!(s.seen().iter().filter(|k| *k == "ns/later").count(), 2);

    q.shut_down();
    for h in handles {
        h.await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn panicking_pass_is_retried_not_fatal() {
    let q = WorkQueue::new("p");
    let c = Controller::new("p", q.clone(), 1, Arc::new(Panics));
    assert_eq!(c.process("ns/x").await, Outcome::Retry);
    assert!(!q.is_shutting_down());
}

#[tokio::test(start_paused = true)]
async fn manager_waits_for_sync_and_stops_on_leadership_loss() {
    let s = Script::with(&[]);
    let q = WorkQueue::new("m");
    let synced = Arc::new(AtomicUsize::new(0));
    let mut mgr = Manager::new(Duration::from_secs(1));
    mgr.add_controller(Controller::new("m", q.clone(), 1, s.clone()));
    let flag = synced.clone();
    mgr.add_sync_check("pods", move || flag.load(Ordering::SeqCst) > 0);

    let (signal, gate) = leader_gate();
    q.add("ns/a");
    let run = tokio::spawn(mgr.run(gate, std::future::pending::<()>()));

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(s.seen().is_empty());
    synced.store(1, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(500)).await;
    // synced but not leading
    assert!(s.seen().is_empty());

    signal.set(true);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(s.seen(), vec!["ns/a"]);

    signal.set(false);
    assert_eq!(run.await.unwrap(), Stop::LeadershipLost);
    assert!(q.is_shutting_down());
}

#[tokio::test(start_paused = true)]
async fn manager_honours_shutdown() {
    let q = WorkQueue::new("s");
    let mut mgr = Manager::new(Duration::from_millis(100));
    mgr.add_controller(Controller::new("s", q.clone(), 1, Script::with(&[])));
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let run = tokio::spawn(mgr.run(LeaderGate::always(), async move {
        let _ = rx.await;
    }));
    tokio::time::sleep(Duration::from_millis(50)).await;
    tx.send(()).unwrap();
    assert_eq!(run.await.unwrap(), Stop::Shutdown);
}
