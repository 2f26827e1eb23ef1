use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use clap::{Args, Parser};
use k8s_openapi::api::apps::v1::{DaemonSet, StatefulSet};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Service};
use k8s_openapi::NamespaceResourceScope;
use keel_core::labels;
use keel_kubehub::{KubeClient, KubeEventSink, LeaseElector, LeaseSettings, Watch, WatchScope};
use keel_reconcile::{wire, Context, Settings, Warnings, Workers};
use keel_schema::convert::normalize_tserver;
use keel_schema::{TAccount, TConfig, TEndpoint, TExitedRecord, TFrameworkConfig, TServer};
use keel_store::{
    leader_gate, EventRouter, EventSink, Fenced, Handle, LeaderGate, Manager, ObjectCache, PolicyRegistry, RateLimit,
    Receiver, ResourceClient, Stop, SystemClock, Watched,
};
use kube::runtime::watcher;
use kube::{Client, Resource};
use tracing::{error, info, warn};

const FIELD_MANAGER: &str = "keel-controller";

#[derive(Parser, Debug)]
#[command(name = "keel-controller", version, about = "Reconciles TServers into workloads, services and records")]
struct Cli {
    /// Watch a single namespace instead of the whole cluster
    #[arg(long, env = "KEEL_NAMESPACE")]
    namespace: Option<String>,

    #[command(flatten)]
    workers: WorkerArgs,

    #[command(flatten)]
    election: ElectionArgs,

    /// First retry delay of a failing key, in milliseconds
    #[arg(long, env = "KEEL_BACKOFF_BASE_MS", default_value_t = 5)]
    backoff_base_ms: u64,

    /// Retry delay cap, in seconds
    #[arg(long, env = "KEEL_BACKOFF_MAX_SECS", default_value_t = 1000)]
    backoff_max_secs: u64,

    /// How long in-flight passes may run after shutdown or leadership loss
    #[arg(long, env = "KEEL_DRAIN_SECS", default_value_t = 30)]
    drain_secs: u64,

    /// How long expected PVC annotations must be stable before they are written, in milliseconds
    #[arg(long, env = "KEEL_PVC_SETTLE_MS", default_value_t = 2000)]
    pvc_settle_ms: u64,
}

#[derive(Args, Debug)]
struct WorkerArgs {
    #[arg(long, env = "KEEL_STATEFULSET_WORKERS", default_value_t = 3)]
    statefulset_workers: usize,
    #[arg(long, env = "KEEL_DAEMONSET_WORKERS", default_value_t = 1)]
    daemonset_workers: usize,
    #[arg(long, env = "KEEL_SERVICE_WORKERS", default_value_t = 1)]
    service_workers: usize,
    #[arg(long, env = "KEEL_TENDPOINT_WORKERS", default_value_t = 3)]
    tendpoint_workers: usize,
    #[arg(long, env = "KEEL_TSERVER_WORKERS", default_value_t = 1)]
    tserver_workers: usize,
    #[arg(long, env = "KEEL_TEXITEDRECORD_WORKERS", default_value_t = 1)]
    texitedrecord_workers: usize,
    #[arg(long, env = "KEEL_TCONFIG_WORKERS", default_value_t = 1)]
    tconfig_workers: usize,
    #[arg(long, env = "KEEL_TACCOUNT_WORKERS", default_value_t = 1)]
    taccount_workers: usize,
    #[arg(long, env = "KEEL_PVC_WORKERS", default_value_t = 1)]
    pvc_workers: usize,
}

impl From<&WorkerArgs> for Workers {
    fn from(a: &WorkerArgs) -> Self {
        Workers {
            statefulset: a.statefulset_workers,
            daemonset: a.daemonset_workers,
            service: a.service_workers,
            tendpoint: a.tendpoint_workers,
            tserver: a.tserver_workers,
            texitedrecord: a.texitedrecord_workers,
            tconfig: a.tconfig_workers,
            taccount: a.taccount_workers,
            pvc: a.pvc_workers,
        }
    }
}

#[derive(Args, Debug)]
struct ElectionArgs {
    /// Run workers only while holding the lease
    #[arg(long, env = "KEEL_LEADER_ELECT", default_value_t = false)]
    leader_elect: bool,
    #[arg(long, env = "KEEL_LEASE_NAME", default_value = "keel-controller")]
    lease_name: String,
    #[arg(long, env = "KEEL_LEASE_NAMESPACE", default_value = "tars-system")]
    lease_namespace: String,
    /// Holder identity; defaults to POD_NAME, then a random id
    #[arg(long, env = "KEEL_LEASE_IDENTITY")]
    lease_identity: Option<String>,
    #[arg(long, env = "KEEL_LEASE_DURATION_SECS", default_value_t = 15)]
    lease_duration_secs: u64,
    #[arg(long, env = "KEEL_RENEW_DEADLINE_SECS", default_value_t = 10)]
    renew_deadline_secs: u64,
    #[arg(long, env = "KEEL_RETRY_PERIOD_SECS", default_value_t = 2)]
    retry_period_secs: u64,
}

impl ElectionArgs {
    fn settings(&self) -> LeaseSettings {
        let identity = self
            .lease_identity
            .clone()
            .or_else(|| std::env::var("POD_NAME").ok())
            .unwrap_or_else(|| format!("keel-{}", uuid::Uuid::new_v4()));
        LeaseSettings {
            namespace: self.lease_namespace.clone(),
            name: self.lease_name.clone(),
            identity,
            lease_duration: Duration::from_secs(self.lease_duration_secs),
            renew_deadline: Duration::from_secs(self.renew_deadline_secs),
            retry_period: Duration::from_secs(self.retry_period_secs),
        }
    }
}

fn init_tracing() {
    let env = std::env::var("KEEL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KEEL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KEEL_METRICS_ADDR; expected host:port");
        }
    }
}

/// Cache from the watch, writes through a leadership-fenced kube client.
fn handle<K>(watch: &Watch<K>, client: &Client, gate: &LeaderGate) -> Handle<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Watched
        + Clone
        + serde::Serialize
        + serde::de::DeserializeOwned
        + std::fmt::Debug
        + Send
        + Sync
        + 'static,
{
    let kube: Arc<dyn ResourceClient<K>> = Arc::new(KubeClient::<K>::new(client.clone(), FIELD_MANAGER));
    Handle::new(watch.cache() as Arc<dyn ObjectCache<K>>, Arc::new(Fenced::new(kube, gate.clone())))
}

/// Children we derive carry the server labels; nothing else of these kinds is ours to watch.
fn tars_labelled() -> watcher::Config { watcher::Config::default().labels(labels::SERVER_APP) }

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let client = Client::try_default().await.context("building kube client")?;
    let scope = match &cli.namespace {
        Some(ns) => WatchScope::Namespace(ns.clone()),
        None => WatchScope::All,
    };
    info!(scope = ?scope, leader_elect = cli.election.leader_elect, "starting keel-controller");

    let (signal, gate) = leader_gate();
    let gate = if cli.election.leader_elect {
        tokio::spawn(LeaseElector::new(client.clone(), cli.election.settings()).run(signal));
        gate
    } else {
        LeaderGate::always()
    };

    let tservers = Watch::<TServer>::new(client.clone(), &scope, watcher::Config::default());
    let tendpoints = Watch::<TEndpoint>::new(client.clone(), &scope, watcher::Config::default());
    let records = Watch::<TExitedRecord>::new(client.clone(), &scope, watcher::Config::default());
    let tconfigs = Watch::<TConfig>::new(client.clone(), &scope, watcher::Config::default());
    let taccounts = Watch::<TAccount>::new(client.clone(), &scope, watcher::Config::default());
    let frameworks = Watch::<TFrameworkConfig>::new(client.clone(), &scope, watcher::Config::default());
    let services = Watch::<Service>::new(client.clone(), &scope, tars_labelled());
    let statefulsets = Watch::<StatefulSet>::new(client.clone(), &scope, tars_labelled());
    let daemonsets = Watch::<DaemonSet>::new(client.clone(), &scope, tars_labelled());
    let pvcs = Watch::<PersistentVolumeClaim>::new(client.clone(), &scope, tars_labelled());
    let pods = Watch::<Pod>::new(client.clone(), &scope, tars_labelled());

    let policy = Arc::new(PolicyRegistry::default());
    let ctx = Arc::new(Context {
        tservers: handle(&tservers, &client, &gate),
        tendpoints: handle(&tendpoints, &client, &gate),
        records: handle(&records, &client, &gate),
        tconfigs: handle(&tconfigs, &client, &gate),
        taccounts: handle(&taccounts, &client, &gate),
        services: handle(&services, &client, &gate),
        statefulsets: handle(&statefulsets, &client, &gate),
        daemonsets: handle(&daemonsets, &client, &gate),
        pvcs: handle(&pvcs, &client, &gate),
        pods: pods.cache() as Arc<dyn ObjectCache<Pod>>,
        policy: Arc::clone(&policy),
        events: Arc::new(KubeEventSink::new(client.clone(), FIELD_MANAGER)) as Arc<dyn EventSink>,
        clock: Arc::new(SystemClock),
        settings: Settings {
            pvc_settle: Duration::from_millis(cli.pvc_settle_ms),
            backoff: RateLimit {
                base: Duration::from_millis(cli.backoff_base_ms),
                max: Duration::from_secs(cli.backoff_max_secs),
            },
        },
        warnings: Warnings::default(),
    });
    let wiring = wire(&ctx, &Workers::from(&cli.workers));

    let mut router = EventRouter::new();
    router.register(Arc::clone(&policy) as Arc<dyn Receiver>);
    for r in wiring.receivers {
        router.register(r);
    }
    info!(receivers = router.receivers(), "event router ready");

    let mut manager = Manager::new(Duration::from_secs(cli.drain_secs));
    for c in wiring.controllers {
        manager.add_controller(c);
    }
    macro_rules! synced {
        ($($name:literal => $watch:ident),* $(,)?) => {
            $(
                let cache = $watch.cache();
                manager.add_sync_check($name, move || cache.has_synced());
            )*
        };
    }
    synced!(
        "tserver" => tservers,
        "tendpoint" => tendpoints,
        "texitedrecord" => records,
        "tconfig" => tconfigs,
        "taccount" => taccounts,
        "tframeworkconfig" => frameworks,
        "service" => services,
        "statefulset" => statefulsets,
        "daemonset" => daemonsets,
        "persistentvolumeclaim" => pvcs,
        "pod" => pods,
    );

    let router = Arc::new(router);
    let _watches = [
        tservers.spawn(Arc::clone(&router), normalize_tserver),
        tendpoints.spawn(Arc::clone(&router), |_| {}),
        records.spawn(Arc::clone(&router), |_| {}),
        tconfigs.spawn(Arc::clone(&router), |_| {}),
        taccounts.spawn(Arc::clone(&router), |_| {}),
        frameworks.spawn(Arc::clone(&router), |_| {}),
        services.spawn(Arc::clone(&router), |_| {}),
        statefulsets.spawn(Arc::clone(&router), |_| {}),
        daemonsets.spawn(Arc::clone(&router), |_| {}),
        pvcs.spawn(Arc::clone(&router), |_| {}),
        pods.spawn(Arc::clone(&router), |_| {}),
    ];

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "cannot listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        info!("shutdown requested");
    };
    match manager.run(gate, shutdown).await {
        Stop::Shutdown => Ok(()),
        // a fenced replica must not keep serving stale caches; the supervisor restarts it
        Stop::LeadershipLost => bail!("leadership lost"),
        Stop::Exhausted => bail!("every reconciler stopped on a fatal outcome"),
    }
}
