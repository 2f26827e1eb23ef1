use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[kube(
    group = "k8s.tars.io",
    version = "v1beta3",
    kind = "TAccount",
    namespaced,
    shortname = "tac",
    derive = "PartialEq",
    derive = "Default",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct TAccountSpec {
    pub username: String,
    #[serde(default)]
    pub extra: Vec<String>,
    #[serde(default)]
    pub authentication: TAccountAuthentication,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TAccountAuthentication {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bcrypt_password: Option<String>,
    #[serde(default)]
    pub tokens: Vec<TAccountToken>,
    #[serde(default)]
    pub activated: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TAccountToken {
    pub name: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_time: Option<Time>,
    pub expiration_time: Time,
    #[serde(default)]
    pub valid: bool,
}
