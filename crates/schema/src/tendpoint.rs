//! TEndpoint: per-TServer projection of spec and live pod state.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use serde::{Deserialize, Serialize};

use crate::tserver::{SubType, TK8SHostPort, TServerNormal, TServerRelease, TServerTars};

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[kube(
    group = "k8s.tars.io",
    version = "v1beta3",
    kind = "TEndpoint",
    namespaced,
    status = "TEndpointStatus",
    shortname = "te",
    derive = "PartialEq",
    derive = "Default",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct TEndpointSpec {
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
    #[serde(default)]
    pub host_ports: Vec<TK8SHostPort>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release: Option<TServerRelease>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct TEndpointStatus {
    #[serde(default, rename = "pods")]
    pub pod_status: Vec<TEndpointPodStatus>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TEndpointPodStatus {
    pub uid: String,
    pub name: String,
    #[serde(default)]
    pub id: String,
    #[serde(default, rename = "podIP")]
    pub pod_ip: String,
    #[serde(default, rename = "hostIP")]
    pub host_ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<Time>,
    #[serde(default)]
    pub setting_state: String,
    #[serde(default)]
    pub present_state: String,
    #[serde(default)]
    pub present_message: String,
    #[serde(default)]
    pub pid: String,
}
