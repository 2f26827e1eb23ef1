//! Label, annotation and naming constants shared by builders and reconcilers.

pub const SERVER_APP: &str = "tars.io/ServerApp";
pub const SERVER_NAME: &str = "tars.io/ServerName";
pub const SERVER_ID: &str = "tars.io/ServerID";

pub const CONFIG_NAME: &str = "tars.io/ConfigName";
pub const CONFIG_VERSION: &str = "tars.io/Version";
pub const CONFIG_ACTIVATED: &str = "tars.io/Activated";
pub const CONFIG_POD_SEQ: &str = "tars.io/PodSeq";
pub const CONFIG_DELETING: &str = "tars.io/Deleting";
pub const CONFIG_DEACTIVATE: &str = "tars.io/Deactivate";

pub const LOCAL_VOLUME: &str = "tars.io/LocalVolume";
pub const LOCAL_VOLUME_UID: &str = "tars.io/LocalVolumeUID";
pub const LOCAL_VOLUME_GID: &str = "tars.io/LocalVolumeGID";
pub const LOCAL_VOLUME_MODE: &str = "tars.io/LocalVolumeMode";

pub const NODE: &str = "tars.io/node";
pub const ABILITY_PREFIX: &str = "tars.io/ability";
pub const HOSTNAME: &str = "kubernetes.io/hostname";

/// Readiness gate whose condition reason is `setting/present/pid`.
pub const READINESS_GATE: &str = "tars.io/active";

/// podSeq of the master config; every other podSeq is a slave of it.
pub const MASTER_POD_SEQ: &str = "m";

pub const STORAGE_CLASS: &str = "tars-storage-class";
pub const HOST_BIND_PLACEHOLDER: &str = "delay-bind";
pub const IMAGE_PLACEHOLDER: &str = " ";
pub const FRAMEWORK_CONFIG_NAME: &str = "tars-framework";

pub const NODE_CONTAINER: &str = "tarsnode";
pub const NODE_WORK_DIR: &str = "tarsnode-work-dir";
pub const NODE_WORK_DIR_PATH: &str = "/usr/local/app/tars/tarsnode";
pub const HOST_TIMEZONE: &str = "host-timezone";

pub const DEFAULT_MAX_RECORD_LEN: usize = 60;
pub const DEFAULT_MAX_CONFIG_HISTORY: usize = 10;
pub const DEFAULT_REVISION_HISTORY: i32 = 5;

/// Deterministic child name for an (app, server) pair.
pub fn child_name(app: &str, server: &str) -> String {
    format!("{}-{}", app.to_lowercase(), server.to_lowercase())
}
