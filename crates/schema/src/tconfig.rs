use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use serde::{Deserialize, Serialize};

/// One immutable version of a named config file for (app, server, podSeq).
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TConfig {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub app: String,
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub pod_seq: String,
    pub config_name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub config_content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_time: Option<Time>,
    #[serde(default)]
    pub update_person: String,
    #[serde(default)]
    pub update_reason: String,
    #[serde(default)]
    pub activated: bool,
}

top_level_resource!(TConfig, "TConfig", "tconfigs");
