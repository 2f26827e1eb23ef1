mod common;

use std::sync::Arc;

use common::*;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use keel_apply::build_texited_record;
use keel_core::{labels, Action, Outcome};
use keel_reconcile::texitedrecord::{event_key, TExitedRecordReconciler};
use keel_schema::TExitedPod;
use keel_store::testing::Verb;
use keel_store::{Notification, Object, Policy, Receiver, Reconciler};

fn exit(uid: &str) -> TExitedPod { TExitedPod { uid: uid.into(), name: format!("test-hello-{uid}"), ..Default::default() } }

fn uids(w: &World) -> Vec<String> {
    w.records.object(NS, "test-hello").unwrap().pods.into_iter().map(|p| p.uid).collect()
}

fn terminating_pod(w: &World, uid: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(format!("test-hello-{uid}")),
            namespace: Some(NS.into()),
            uid: Some(uid.into()),
            deletion_timestamp: Some(Time(w.now())),
            labels: Some(
                [(labels::SERVER_APP.to_string(), "Test".to_string()), (labels::SERVER_NAME.to_string(), "Hello".to_string())].into(),
            ),
            ..Default::default()
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn ring_keeps_the_newest_entries_up_to_the_limit() {
    let w = World::with_policy(Policy { max_exited_records: 3, ..Policy::default() });
    let ts = tserver();
    w.tservers.insert(ts.clone());
    w.records.insert(build_texited_record(&ts));
    let r = TExitedRecordReconciler::new(w.ctx.clone());

    for uid in ["a", "b", "c", "d"] {
        let key = event_key(NS, "Test", "Hello", exit(uid)).unwrap();
        assert_eq!(r.reconcile(&key).await, Outcome::Done);
    }
    assert_eq!(uids(&w), ["d", "c", "b"]);
    assert_eq!(w.records.count(Verb::Patch), 4);
}

#[tokio::test]
async fn redelivered_exit_is_recorded_once() {
    let w = World::new();
    let ts = tserver();
    w.tservers.insert(ts.clone());
    w.records.insert(build_texited_record(&ts));
    let r = TExitedRecordReconciler::new(w.ctx.clone());

    r.receive(&Notification { action: Action::Modified, object: Object::Pod(Arc::new(terminating_pod(&w, "u1"))) });
    let key = r.queue().get().await.unwrap();
    assert_eq!(r.reconcile(&key).await, Outcome::Done);
    assert_eq!(r.reconcile(&key).await, Outcome::Done);

    assert_eq!(uids(&w), ["u1"]);
    assert_eq!(w.records.count(Verb::Patch), 1);
}

#[tokio::test]
async fn live_pods_are_not_history() {
    let w = World::new();
    let r = TExitedRecordReconciler::new(w.ctx.clone());
    let mut pod = terminating_pod(&w, "u1");
    pod.metadata.deletion_timestamp = None;
    r.receive(&Notification { action: Action::Modified, object: Object::Pod(Arc::new(pod)) });
    assert!(r.queue().is_empty());
}

#[tokio::test]
async fn exit_waits_for_the_record_while_its_server_exists() {
    let w = World::new();
    let r = TExitedRecordReconciler::new(w.ctx.clone());
    let key = event_key(NS, "Test", "Hello", exit("u1")).unwrap();

    w.tservers.insert(tserver());
    assert_eq!(r.reconcile(&key).await, Outcome::Retry);

    w.tservers.evict(NS, "test-hello");
    assert_eq!(r.reconcile(&key).await, Outcome::Done);
    assert_eq!(w.records.writes(), 0);
}

#[tokio::test]
async fn garbled_event_key_is_fatal() {
    let w = World::new();
    let r = TExitedRecordReconciler::new(w.ctx.clone());
    assert_eq!(r.reconcile("tars/event/{not json").await, Outcome::Fatal);
}
