//! Versioned configs: single activation, bounded history and cascading deletion.
//!
//! Configs sharing (app, server, configName, podSeq) form a group. Three queues run against the
//! same cache: `activate` settles the activation handoff of a group, `retain` trims its inactive
//! history, and `delete` removes everything marked for deletion in a namespace.

use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use keel_core::{labels, patch::label_path, Action, EventKey, JsonPatch, Outcome, Selector};
use keel_schema::TConfig;
use keel_store::{Controller, Notification, Object, Receiver, Reconciler, WorkQueue};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info};

use crate::{failed, Context};

const ACTIVATE: &str = "tconfig-activate";
const RETAIN: &str = "tconfig-retain";
const DELETE: &str = "tconfig-delete";
const GROUP_TAG: &str = "group";

/// Identity shared by every version of one config file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Group {
    pub app: String,
    pub server: String,
    pub config_name: String,
    pub pod_seq: String,
}

impl Group {
    pub fn of(cfg: &TConfig) -> Self {
        Self {
            app: cfg.app.clone(),
            server: cfg.server.clone(),
            config_name: cfg.config_name.clone(),
            pod_seq: cfg.pod_seq.clone(),
        }
    }

    pub fn key(&self, namespace: &str) -> Option<String> {
        let payload = serde_json::to_string(self).ok()?;
        Some(EventKey::new(namespace, GROUP_TAG, payload).to_string())
    }

    fn parse(key: &str) -> Option<(String, Self)> {
        let k = EventKey::parse(key).ok().filter(|k| k.tag == GROUP_TAG)?;
        let group = serde_json::from_str(&k.payload).ok()?;
        Some((k.namespace, group))
    }

    pub fn selector(&self) -> Selector {
        Selector::new()
            .equal(labels::SERVER_APP, &self.app)
            .equal(labels::SERVER_NAME, &self.server)
            .equal(labels::CONFIG_NAME, &self.config_name)
            .equal(labels::CONFIG_POD_SEQ, &self.pod_seq)
    }
}

fn has_label(cfg: &TConfig, label: &str) -> bool { cfg.metadata.labels.as_ref().is_some_and(|l| l.contains_key(label)) }

fn name_of(cfg: &TConfig) -> &str { cfg.metadata.name.as_deref().unwrap_or_default() }

/// Newer configs sort last.
fn by_age(a: &TConfig, b: &TConfig) -> Ordering {
    let ts = |c: &TConfig| c.metadata.creation_timestamp.as_ref().map(|t| t.0);
    ts(a).cmp(&ts(b)).then_with(|| a.version.cmp(&b.version))
}

/// Patch turning an activated config into an inactive one, clearing the handoff marker if set.
pub fn deactivate_patch(cfg: &TConfig) -> JsonPatch {
    let mut patch = JsonPatch::new();
    if has_label(cfg, labels::CONFIG_DEACTIVATE) {
        patch = patch.remove(label_path(labels::CONFIG_DEACTIVATE));
    }
    patch.add(label_path(labels::CONFIG_ACTIVATED), json!("false")).replace("/activated", json!(false))
}

/// Versions to bulk-delete so that at most `limit` of `versions` remain: everything strictly
/// older than the cutoff.
pub fn expired_versions(mut versions: Vec<String>, limit: usize) -> Vec<String> {
    if versions.len() <= limit {
        return Vec::new();
    }
    if limit == 0 {
        return versions;
    }
    versions.sort();
    let cutoff = versions[versions.len() - limit].clone();
    versions.into_iter().filter(|v| *v < cutoff).collect()
}

pub struct TConfigReconciler {
    ctx: Arc<Context>,
    activate: WorkQueue,
    retain: WorkQueue,
    delete: WorkQueue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Activate,
    Retain,
    Delete,
}

struct StageRunner {
    stage: Stage,
    owner: Arc<TConfigReconciler>,
}

impl TConfigReconciler {
    pub fn new(ctx: Arc<Context>) -> Arc<Self> {
        let (activate, retain, delete) = (ctx.queue(ACTIVATE), ctx.queue(RETAIN), ctx.queue(DELETE));
        Arc::new(Self { ctx, activate, retain, delete })
    }

    pub fn activate_queue(&self) -> &WorkQueue { &self.activate }
    pub fn retain_queue(&self) -> &WorkQueue { &self.retain }
    pub fn delete_queue(&self) -> &WorkQueue { &self.delete }

    /// One controller per stage, each with `workers` workers.
    pub fn controllers(self: &Arc<Self>, workers: usize) -> Vec<Controller> {
        [(Stage::Activate, ACTIVATE, &self.activate), (Stage::Retain, RETAIN, &self.retain), (Stage::Delete, DELETE, &self.delete)]
            .into_iter()
            .map(|(stage, name, queue)| {
                let runner = Arc::new(StageRunner { stage, owner: Arc::clone(self) });
                Controller::new(name, queue.clone(), workers, runner as Arc<dyn Reconciler>)
            })
            .collect()
    }

    /// Settle the activation handoff of a group: clear pending deactivations, then keep only the
    /// newest activated config.
    pub async fn reconcile_activation(&self, key: &str) -> Outcome {
        let Some((ns, group)) = Group::parse(key) else {
            error!(controller = ACTIVATE, key = %key, "unparseable reconcile key");
            return Outcome::Fatal;
        };
        let client = &self.ctx.tconfigs.client;
        let siblings = self.ctx.tconfigs.cache.list(&ns, &group.selector().absent(labels::CONFIG_DELETING));
        let mut outcome = Outcome::Done;

        let (marked, rest): (Vec<_>, Vec<_>) = siblings.iter().partition(|c| has_label(c, labels::CONFIG_DEACTIVATE));
        for cfg in &marked {
            match client.patch(&ns, name_of(cfg), &deactivate_patch(cfg)).await {
                Ok(_) => info!(ns = %ns, config = name_of(cfg), "deactivation confirmed"),
                Err(e) => outcome = outcome.merge(failed(ACTIVATE, "patch", &ns, name_of(cfg), &e)),
            }
        }

        let mut active: Vec<_> = rest.into_iter().filter(|c| c.activated).collect();
        if active.len() > 1 {
            active.sort_by(|a, b| by_age(a, b));
            let keep = active.pop().map(|c| name_of(c).to_string()).unwrap_or_default();
            for cfg in active {
                match client.patch(&ns, name_of(cfg), &deactivate_patch(cfg)).await {
                    Ok(_) => info!(ns = %ns, config = name_of(cfg), active = %keep, "superseded config deactivated"),
                    Err(e) => outcome = outcome.merge(failed(ACTIVATE, "patch", &ns, name_of(cfg), &e)),
                }
            }
        }
        outcome
    }

    /// Bulk-delete inactive history of a group beyond the namespace's limit.
    pub async fn reconcile_retention(&self, key: &str) -> Outcome {
        let Some((ns, group)) = Group::parse(key) else {
            error!(controller = RETAIN, key = %key, "unparseable reconcile key");
            return Outcome::Fatal;
        };
        let inactive = group.selector().absent(labels::CONFIG_DELETING).equal(labels::CONFIG_ACTIVATED, "false");
        let versions: Vec<String> = self.ctx.tconfigs.cache.list(&ns, &inactive).iter().map(|c| c.version.clone()).collect();
        let limit = self.ctx.policy.get(&ns).max_config_history;
        let expired = expired_versions(versions, limit);
        if expired.is_empty() {
            return Outcome::Done;
        }

        let count = expired.len();
        let selector = inactive.within(labels::CONFIG_VERSION, expired);
        match self.ctx.tconfigs.client.delete_collection(&ns, &selector).await {
            Ok(()) => {
                info!(ns = %ns, config = %group.config_name, deleted = count, limit, "config history trimmed");
                Outcome::Done
            }
            Err(e) => failed(RETAIN, "delete_collection", &ns, &group.config_name, &e),
        }
    }

    /// Remove configs marked for deletion in a namespace. A deleted master first marks the same
    /// config of every other podSeq and stays until all of those marks have landed.
    pub async fn reconcile_deletion(&self, ns: &str) -> Outcome {
        let ctx = &self.ctx;
        let marked = Selector::new().exists(labels::CONFIG_DELETING);
        let deleting = ctx.tconfigs.cache.list(ns, &marked);
        if deleting.is_empty() {
            return Outcome::Done;
        }
        let (masters, dependents): (Vec<_>, Vec<_>) = deleting.iter().partition(|c| c.pod_seq == labels::MASTER_POD_SEQ);
        let mut outcome = Outcome::Done;

        if !dependents.is_empty() {
            let selector = marked.clone().not_equal(labels::CONFIG_POD_SEQ, labels::MASTER_POD_SEQ);
            match ctx.tconfigs.client.delete_collection(ns, &selector).await {
                Ok(()) => info!(ns = %ns, deleted = dependents.len(), "marked configs deleted"),
                Err(e) => outcome = outcome.merge(failed(DELETE, "delete_collection", ns, ns, &e)),
            }
        }

        for master in masters {
            let group = Selector::new()
                .equal(labels::SERVER_APP, &master.app)
                .equal(labels::SERVER_NAME, &master.server)
                .equal(labels::CONFIG_NAME, &master.config_name);
            let unmarked = group.clone().not_equal(labels::CONFIG_POD_SEQ, labels::MASTER_POD_SEQ).absent(labels::CONFIG_DELETING);
            let mut settled = true;
            for slave in ctx.tconfigs.cache.list(ns, &unmarked) {
                let patch = JsonPatch::new().add(label_path(labels::CONFIG_DELETING), json!(""));
                match ctx.tconfigs.client.patch(ns, name_of(&slave), &patch).await {
                    Ok(_) => debug!(ns = %ns, config = name_of(&slave), master = name_of(master), "dependent marked for deletion"),
                    Err(e) if e.is_not_found() => {}
                    Err(e) => {
                        settled = false;
                        outcome = outcome.merge(failed(DELETE, "patch", ns, name_of(&slave), &e));
                    }
                }
            }
            if !settled {
                continue;
            }
            let selector = group.equal(labels::CONFIG_POD_SEQ, labels::MASTER_POD_SEQ).exists(labels::CONFIG_DELETING);
            match ctx.tconfigs.client.delete_collection(ns, &selector).await {
                Ok(()) => info!(ns = %ns, config = name_of(master), "master config deleted"),
                Err(e) => outcome = outcome.merge(failed(DELETE, "delete_collection", ns, name_of(master), &e)),
            }
        }
        outcome
    }
}

impl Receiver for TConfigReconciler {
    fn receive(&self, n: &Notification) {
        let Object::TConfig(cfg) = &n.object else { return };
        if n.action == Action::Deleted {
            return;
        }
        let ns = n.object.namespace();
        if has_label(cfg, labels::CONFIG_DELETING) {
            self.delete.add(ns);
            return;
        }
        if let Some(key) = Group::of(cfg).key(ns) {
            self.activate.add(&key);
            self.retain.add(&key);
        }
    }
}

#[async_trait]
impl Reconciler for StageRunner {
    async fn reconcile(&self, key: &str) -> Outcome {
        match self.stage {
            Stage::Activate => self.owner.reconcile_activation(key).await,
            Stage::Retain => self.owner.reconcile_retention(key).await,
            Stage::Delete => self.owner.reconcile_deletion(key).await,
        }
    }
}
