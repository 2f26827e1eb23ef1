#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use k8s_openapi::api::apps::v1::{DaemonSet, StatefulSet};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Service};
use keel_core::labels;
use keel_reconcile::{Context, Settings, Warnings};
use keel_schema::convert::normalize_tserver;
use keel_schema::*;
use keel_store::testing::{FakeApi, ManualClock, RecordingSink};
use keel_store::{Clock, EventSink, ObjectCache, Policy, PolicyRegistry};

pub const NS: &str = "tars";
pub const TS_UID: &str = "11111111-2222-3333-4444-555555555555";

/// A whole fake cluster plus the context reconcilers run against.
pub struct World {
    pub tservers: Arc<FakeApi<TServer>>,
    pub tendpoints: Arc<FakeApi<TEndpoint>>,
    pub records: Arc<FakeApi<TExitedRecord>>,
    pub tconfigs: Arc<FakeApi<TConfig>>,
    pub taccounts: Arc<FakeApi<TAccount>>,
    pub services: Arc<FakeApi<Service>>,
    pub statefulsets: Arc<FakeApi<StatefulSet>>,
    pub daemonsets: Arc<FakeApi<DaemonSet>>,
    pub pvcs: Arc<FakeApi<PersistentVolumeClaim>>,
    pub pods: Arc<FakeApi<Pod>>,
    pub sink: Arc<RecordingSink>,
    pub clock: Arc<ManualClock>,
    pub policy: Arc<PolicyRegistry>,
    pub ctx: Arc<Context>,
}

impl World {
    pub fn new() -> Self { Self::with_policy(Policy::default()) }

    pub fn with_policy(policy: Policy) -> Self {
        let tservers = FakeApi::new();
        let tendpoints = FakeApi::new();
        let records = FakeApi::new();
        let tconfigs = FakeApi::new();
        let taccounts = FakeApi::new();
        let services = FakeApi::new();
        let statefulsets = FakeApi::new();
        let daemonsets = FakeApi::new();
        let pvcs = FakeApi::new();
        let pods = FakeApi::new();
        let sink = RecordingSink::new();
        let clock = ManualClock::at(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
        let policy = Arc::new(PolicyRegistry::new(policy));
        let ctx = Arc::new(Context {
            tservers: tservers.handle(),
            tendpoints: tendpoints.handle(),
            records: records.handle(),
            tconfigs: tconfigs.handle(),
            taccounts: taccounts.handle(),
            services: services.handle(),
            statefulsets: statefulsets.handle(),
            daemonsets: daemonsets.handle(),
            pvcs: pvcs.handle(),
            pods: Arc::clone(&pods) as Arc<dyn ObjectCache<Pod>>,
            policy: Arc::clone(&policy),
            events: Arc::clone(&sink) as Arc<dyn EventSink>,
            clock: Arc::clone(&clock) as Arc<dyn Clock>,
            settings: Settings::default(),
            warnings: Warnings::default(),
        });
        Self { tservers, tendpoints, records, tconfigs, taccounts, services, statefulsets, daemonsets, pvcs, pods, sink, clock, policy, ctx }
    }

    pub fn now(&self) -> DateTime<Utc> { self.clock.now() }

    /// Total writes across every child kind.
    pub fn child_writes(&self) -> usize {
        self.tendpoints.writes()
            + self.records.writes()
            + self.services.writes()
            + self.statefulsets.writes()
            + self.daemonsets.writes()
            + self.pvcs.writes()
    }

    pub fn clear_calls(&self) {
        self.tservers.clear_calls();
        self.tendpoints.clear_calls();
        self.records.clear_calls();
        self.tconfigs.clear_calls();
        self.taccounts.clear_calls();
        self.services.clear_calls();
        self.statefulsets.clear_calls();
        self.daemonsets.clear_calls();
        self.pvcs.clear_calls();
    }
}

/// `Test.Hello`, a tars server with one servant and two replicas.
pub fn tserver() -> TServer {
    let mut ts = TServer::new(
        "test-hello",
        TServerSpec {
            app: "Test".into(),
            server: "Hello".into(),
            sub_type: SubType::Tars,
            tars: Some(TServerTars {
                servants: vec![TServerServant { name: "HelloObj".into(), port: 10000, is_tars: true, is_tcp: true, ..Default::default() }],
                ..Default::default()
            }),
            k8s: TServerK8S { replicas: 2, ..Default::default() },
            release: Some(TServerRelease {
                id: "v1".into(),
                image: "registry/test-hello:v1".into(),
                node_image: Some("tarsnode:v1".into()),
                ..Default::default()
            }),
            ..Default::default()
        },
    );
    ts.metadata.namespace = Some(NS.into());
    ts.metadata.uid = Some(TS_UID.into());
    normalize_tserver(&mut ts);
    ts
}

/// Local-volume mount named `name` with the given uid/gid.
pub fn local_volume(name: &str, uid: &str, gid: &str) -> TK8SMount {
    TK8SMount {
        name: name.into(),
        source: TK8SMountSource {
            t_local_volume: Some(TLocalVolume { uid: Some(uid.into()), gid: Some(gid.into()), mode: None }),
            ..Default::default()
        },
        mount_path: format!("/data/{name}"),
        ..Default::default()
    }
}

/// A TConfig of `Test.Hello` carrying the labels admission would have set.
pub fn tconfig(name: &str, version: &str, pod_seq: &str, activated: bool) -> TConfig {
    let mut c = TConfig::new(NS, name);
    c.app = "Test".into();
    c.server = "Hello".into();
    c.config_name = "hello.conf".into();
    c.pod_seq = pod_seq.into();
    c.version = version.into();
    c.activated = activated;
    c.metadata.labels = Some(
        [
            (labels::SERVER_APP, "Test"),
            (labels::SERVER_NAME, "Hello"),
            (labels::CONFIG_NAME, "hello.conf"),
            (labels::CONFIG_POD_SEQ, pod_seq),
            (labels::CONFIG_VERSION, version),
            (labels::CONFIG_ACTIVATED, if activated { "true" } else { "false" }),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect(),
    );
    c
}

pub fn with_label(mut c: TConfig, key: &str) -> TConfig {
    c.metadata.labels.get_or_insert_with(Default::default).insert(key.into(), String::new());
    c
}
