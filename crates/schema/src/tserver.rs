//! TServer: the desired state of one microservice.

use k8s_openapi::api::apps::v1::StatefulSetUpdateStrategy;
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, DownwardAPIVolumeSource, EmptyDirVolumeSource, EnvFromSource, EnvVar,
    HostPathVolumeSource, NodeSelectorRequirement, PersistentVolumeClaim, PersistentVolumeClaimVolumeSource,
    ResourceRequirements, SecretVolumeSource,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[kube(
    group = "k8s.tars.io",
    version = "v1beta3",
    kind = "TServer",
    namespaced,
    status = "TServerStatus",
    shortname = "ts",
    derive = "PartialEq",
    derive = "Default",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct TServerSpec {
    pub app: String,
    pub server: String,
    #[serde(default)]
    pub sub_type: SubType,
    #[serde(default)]
    pub important: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tars: Option<TServerTars>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normal: Option<TServerNormal>,
    pub k8s: TServerK8S,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release: Option<TServerRelease>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SubType {
    #[default]
    Tars,
    Normal,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TServerServant {
    pub name: String,
    pub port: i32,
    #[serde(default)]
    pub thread: i32,
    #[serde(default)]
    pub connection: i32,
    #[serde(default)]
    pub capacity: i32,
    #[serde(default)]
    pub timeout: i32,
    #[serde(default)]
    pub is_tars: bool,
    #[serde(default)]
    pub is_tcp: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TServerPort {
    pub name: String,
    pub port: i32,
    #[serde(default)]
    pub is_tcp: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TServerTars {
    #[serde(default)]
    pub template: String,
    #[serde(default)]
    pub profile: String,
    #[serde(default)]
    pub async_thread: i32,
    #[serde(default)]
    pub servants: Vec<TServerServant>,
    #[serde(default)]
    pub ports: Vec<TServerPort>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct TServerNormal {
    #[serde(default)]
    pub ports: Vec<TServerPort>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TK8SHostPort {
    pub name_ref: String,
    pub port: i32,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct TLocalVolume {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TK8SMountSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_path: Option<HostPathVolumeSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub empty_dir: Option<EmptyDirVolumeSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<SecretVolumeSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map: Option<ConfigMapVolumeSource>,
    #[serde(default, rename = "downwardAPI", skip_serializing_if = "Option::is_none")]
    pub downward_api: Option<DownwardAPIVolumeSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim: Option<PersistentVolumeClaimVolumeSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim_template: Option<PersistentVolumeClaim>,
    #[serde(default, rename = "tLocalVolume", skip_serializing_if = "Option::is_none")]
    pub t_local_volume: Option<TLocalVolume>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TK8SMount {
    pub name: String,
    pub source: TK8SMountSource,
    #[serde(default)]
    pub read_only: bool,
    pub mount_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_propagation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_path_expr: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AbilityAffinity {
    AppRequired,
    ServerRequired,
    AppOrServerPreferred,
    #[default]
    None,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LauncherType {
    Foreground,
    #[default]
    Background,
}

impl LauncherType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LauncherType::Foreground => "foreground",
            LauncherType::Background => "background",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TServerK8S {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default)]
    pub env_from: Vec<EnvFromSource>,
    #[serde(default, rename = "hostIPC")]
    pub host_ipc: bool,
    #[serde(default)]
    pub host_network: bool,
    #[serde(default)]
    pub host_ports: Vec<TK8SHostPort>,
    #[serde(default)]
    pub mounts: Vec<TK8SMount>,
    #[serde(default)]
    pub daemon_set: bool,
    #[serde(default)]
    pub node_selector: Vec<NodeSelectorRequirement>,
    #[serde(default)]
    pub ability_affinity: AbilityAffinity,
    #[serde(default)]
    pub not_stacked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_management_policy: Option<String>,
    #[serde(default)]
    pub replicas: i32,
    #[serde(default)]
    pub readiness_gates: Vec<String>,
    /// Single-gate field of the older schema; folded into `readiness_gates` by `convert`.
    #[serde(default, skip_serializing)]
    pub readiness_gate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_strategy: Option<StatefulSetUpdateStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,
    #[serde(default)]
    pub launcher_type: LauncherType,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TServerRelease {
    #[serde(default)]
    pub id: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_secret: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TServerStatus {
    #[serde(default)]
    pub replicas: i32,
    #[serde(default)]
    pub ready_replicas: i32,
    #[serde(default)]
    pub current_replicas: i32,
    #[serde(default)]
    pub selector: String,
}

impl TServer {
    pub fn is_daemon(&self) -> bool { self.spec.k8s.daemon_set }
    pub fn is_deleting(&self) -> bool { self.metadata.deletion_timestamp.is_some() }
    pub fn is_tars(&self) -> bool { self.spec.sub_type == SubType::Tars }
}
