use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

/// Per-namespace runtime policy. Only the object named `tars-framework` is consulted.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TFrameworkConfig {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub record_limit: RecordLimit,
    #[serde(default)]
    pub node_image: NodeImage,
}

top_level_resource!(TFrameworkConfig, "TFrameworkConfig", "tframeworkconfigs");

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct RecordLimit {
    #[serde(default, rename = "texitedPod", skip_serializing_if = "Option::is_none")]
    pub texited_pod: Option<u32>,
    #[serde(default, rename = "tconfigHistory", skip_serializing_if = "Option::is_none")]
    pub tconfig_history: Option<u32>,
    #[serde(default, rename = "timageRelease", skip_serializing_if = "Option::is_none")]
    pub timage_release: Option<u32>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct NodeImage {
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub secret: String,
}
