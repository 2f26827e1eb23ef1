//! Token expiry: drop expired tokens and come back when the next one expires.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_core::{Action, Outcome};
use keel_schema::{TAccount, TAccountToken};
use keel_store::{Controller, Notification, Object, Receiver, Reconciler, WorkQueue};
use tracing::info;

use crate::{failed, identity_key, object_key, Context};

const NAME: &str = "taccount";

fn expired(token: &TAccountToken, now: DateTime<Utc>) -> bool { token.expiration_time.0 <= now }

/// Time until the earliest remaining expiry, if any token is left.
pub fn next_expiry(tokens: &[TAccountToken], now: DateTime<Utc>) -> Option<Duration> {
    tokens.iter().map(|t| t.expiration_time.0 - now).min().and_then(|d| d.to_std().ok())
}

pub struct TAccountReconciler {
    ctx: Arc<Context>,
    queue: WorkQueue,
}

impl TAccountReconciler {
    pub fn new(ctx: Arc<Context>) -> Arc<Self> {
        let queue = ctx.queue(NAME);
        Arc::new(Self { ctx, queue })
    }

    pub fn queue(&self) -> &WorkQueue { &self.queue }

    pub fn controller(self: &Arc<Self>, workers: usize) -> Controller {
        Controller::new(NAME, self.queue.clone(), workers, Arc::clone(self) as Arc<dyn Reconciler>)
    }
}

impl Receiver for TAccountReconciler {
    fn receive(&self, n: &Notification) {
        if matches!(n.object, Object::TAccount(_)) && n.action != Action::Deleted {
            self.queue.add(&identity_key(&n.object));
        }
    }
}

#[async_trait]
impl Reconciler for TAccountReconciler {
    async fn reconcile(&self, key: &str) -> Outcome {
        let Some(key) = object_key(NAME, key) else { return Outcome::Fatal };
        let ctx = &self.ctx;
        let Some(account) = ctx.taccounts.cache.get(&key.namespace, &key.name) else { return Outcome::Done };
        let now = ctx.clock.now();

        let tokens = &account.spec.authentication.tokens;
        let live: Vec<TAccountToken> = tokens.iter().filter(|t| !expired(t, now)).cloned().collect();
        if live.len() != tokens.len() {
            let mut next = TAccount::clone(&account);
            next.spec.authentication.tokens = live.clone();
            if let Err(e) = ctx.taccounts.client.update(&key.namespace, &next).await {
                return failed(NAME, "update", &key.namespace, &key.name, &e);
            }
            info!(key = %key, reclaimed = tokens.len() - live.len(), remaining = live.len(), "expired tokens reclaimed");
        }

        match next_expiry(&live, now) {
            Some(wait) => Outcome::AddAfter(wait),
            None => Outcome::Done,
        }
    }
}
