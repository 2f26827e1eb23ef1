mod common;

use std::time::Duration;

use chrono::Duration as Span;
use common::*;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use keel_core::Outcome;
use keel_reconcile::taccount::TAccountReconciler;
use keel_schema::{TAccount, TAccountAuthentication, TAccountSpec, TAccountToken};
use keel_store::testing::Verb;
use keel_store::Reconciler;

fn account(w: &World, expiries: &[(&str, i64)]) -> TAccount {
    let tokens = expiries
        .iter()
        .map(|(name, secs)| TAccountToken {
            name: (*name).into(),
            content: format!("token-{name}"),
            update_time: None,
            expiration_time: Time(w.now() + Span::seconds(*secs)),
            valid: true,
        })
        .collect();
    let mut a = TAccount::new(
        "admin",
        TAccountSpec {
            username: "admin".into(),
            extra: Vec::new(),
            authentication: TAccountAuthentication { tokens, ..Default::default() },
        },
    );
    a.metadata.namespace = Some(NS.into());
    a
}

fn tokens(w: &World) -> Vec<String> {
    w.taccounts.object(NS, "admin").unwrap().spec.authentication.tokens.into_iter().map(|t| t.name).collect()
}

#[tokio::test]
async fn expired_tokens_are_reclaimed_on_schedule() {
    let w = World::new();
    w.taccounts.insert(account(&w, &[("short", 5), ("long", 30)]));
    let r = TAccountReconciler::new(w.ctx.clone());

    assert_eq!(r.reconcile("tars/admin").await, Outcome::AddAfter(Duration::from_secs(5)));
    assert_eq!(w.taccounts.writes(), 0);

    w.clock.advance(Span::seconds(5));
    assert_eq!(r.reconcile("tars/admin").await, Outcome::AddAfter(Duration::from_secs(25)));
    assert_eq!(tokens(&w), ["long"]);
    assert_eq!(w.taccounts.count(Verb::Update), 1);

    w.clock.advance(Span::seconds(25));
    assert_eq!(r.reconcile("tars/admin").await, Outcome::Done);
    assert!(tokens(&w).is_empty());
}

#[tokio::test]
async fn failed_prune_is_retried() {
    let w = World::new();
    w.taccounts.insert(account(&w, &[("stale", -1)]));
    w.taccounts.fail_next(Verb::Update, keel_core::ApiError::Conflict("stale resourceVersion".into()));
    let r = TAccountReconciler::new(w.ctx.clone());

    assert_eq!(r.reconcile("tars/admin").await, Outcome::Retry);
    assert_eq!(r.reconcile("tars/admin").await, Outcome::Done);
    assert!(tokens(&w).is_empty());
}

#[tokio::test]
async fn vanished_account_is_done() {
    let w = World::new();
    let r = TAccountReconciler::new(w.ctx.clone());
    assert_eq!(r.reconcile("tars/ghost").await, Outcome::Done);
}
