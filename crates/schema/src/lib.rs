//! Keel schema: the custom resources the controller reads and writes.
//!
//! TServer, TEndpoint and TAccount carry `spec`/`status` and are derived with
//! `kube::CustomResource`. TConfig, TExitedRecord and TFrameworkConfig keep their fields at the
//! top level of the object, so they implement `kube::Resource` by hand through `top_level_resource!`.

#![forbid(unsafe_code)]

/// Implements `kube::Resource` for a namespaced object whose payload lives beside `metadata`.
/// The type must have `metadata`, `api_version` and `kind` fields.
macro_rules! top_level_resource {
    ($ty:ident, $kind:literal, $plural:literal) => {
        impl kube::Resource for $ty {
            type DynamicType = ();
            type Scope = k8s_openapi::NamespaceResourceScope;

            fn kind(_: &()) -> std::borrow::Cow<'_, str> { $kind.into() }
            fn group(_: &()) -> std::borrow::Cow<'_, str> { $crate::GROUP.into() }
            fn version(_: &()) -> std::borrow::Cow<'_, str> { $crate::VERSION.into() }
            fn plural(_: &()) -> std::borrow::Cow<'_, str> { $plural.into() }
            fn meta(&self) -> &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta { &self.metadata }
            fn meta_mut(&mut self) -> &mut k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                &mut self.metadata
            }
        }

        impl $ty {
            /// Empty object with type metadata and identity filled in.
            pub fn new(namespace: &str, name: &str) -> Self {
                Self {
                    api_version: $crate::API_VERSION.to_string(),
                    kind: $kind.to_string(),
                    metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                        name: Some(name.to_string()),
                        namespace: Some(namespace.to_string()),
                        ..Default::default()
                    },
                    ..Default::default()
                }
            }
        }
    };
}

pub mod convert;
pub mod taccount;
pub mod tconfig;
pub mod tendpoint;
pub mod texitedrecord;
pub mod tframeworkconfig;
pub mod tserver;

pub use taccount::{TAccount, TAccountAuthentication, TAccountSpec, TAccountToken};
pub use tconfig::TConfig;
pub use tendpoint::{TEndpoint, TEndpointPodStatus, TEndpointSpec, TEndpointStatus};
pub use texitedrecord::{TExitedPod, TExitedRecord};
pub use tframeworkconfig::{NodeImage, RecordLimit, TFrameworkConfig};
pub use tserver::*;

pub const GROUP: &str = "k8s.tars.io";
pub const VERSION: &str = "v1beta3";
pub const API_VERSION: &str = "k8s.tars.io/v1beta3";
