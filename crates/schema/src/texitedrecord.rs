use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use serde::{Deserialize, Serialize};

/// Bounded newest-first history of terminated pods of one (app, server).
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TExitedRecord {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub app: String,
    pub server: String,
    #[serde(default)]
    pub pods: Vec<TExitedPod>,
}

top_level_resource!(TExitedRecord, "TExitedRecord", "texitedrecords");

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TExitedPod {
    pub uid: String,
    pub name: String,
    #[serde(default)]
    pub id: String,
    #[serde(default, rename = "nodeIP")]
    pub node_ip: String,
    #[serde(default, rename = "podIP")]
    pub pod_ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_time: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_time: Option<Time>,
}
