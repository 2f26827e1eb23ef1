use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Affinity, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, EnvVarSource, HostPathVolumeSource,
    LocalObjectReference, NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm, ObjectFieldSelector,
    PodAffinityTerm, PodAntiAffinity, PodDNSConfig, PodDNSConfigOption, PodReadinessGate, PodSpec, PodTemplateSpec,
    PreferredSchedulingTerm, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use keel_core::labels;
use keel_schema::{AbilityAffinity, LauncherType, TServer};
use kube::ResourceExt;

use crate::{selector_labels, BuildError, NodeDefaults};

fn protocol(is_tcp: bool) -> Option<String> { Some(if is_tcp { "TCP" } else { "UDP" }.to_string()) }

fn non_empty(v: Vec<String>) -> Option<Vec<String>> { (!v.is_empty()).then_some(v) }

fn container_ports(ts: &TServer) -> Vec<ContainerPort> {
    let k8s = &ts.spec.k8s;
    let host_port = |name: &str| {
        if k8s.host_network {
            return None;
        }
        k8s.host_ports.iter().find(|h| h.name_ref == name).map(|h| h.port)
    };

    let ports = match (&ts.spec.tars, &ts.spec.normal) {
        (Some(t), _) => t.ports.as_slice(),
        (None, Some(n)) => n.ports.as_slice(),
        (None, None) => &[],
    };
    let mut out: Vec<ContainerPort> = ports
        .iter()
        .map(|p| ContainerPort {
            name: Some(p.name.clone()),
            container_port: p.port,
            protocol: protocol(p.is_tcp),
            host_port: host_port(&p.name),
            ..ContainerPort::default()
        })
        .collect();

    // servants are only published on the container when bound to a host port
    for s in ts.spec.tars.iter().flat_map(|t| t.servants.iter()) {
        if let Some(hp) = host_port(&s.name) {
            out.push(ContainerPort {
                name: Some(format!("p{hp}-{}", s.port)),
                container_port: s.port,
                host_port: Some(hp),
                protocol: protocol(s.is_tcp),
                ..ContainerPort::default()
            });
        }
    }
    out
}

fn volume_mounts(ts: &TServer) -> Vec<VolumeMount> {
    let k8s = &ts.spec.k8s;
    let mut out: Vec<VolumeMount> = k8s
        .mounts
        .iter()
        .filter(|m| !(k8s.daemon_set && (m.source.t_local_volume.is_some() || m.source.persistent_volume_claim_template.is_some())))
        .map(|m| VolumeMount {
            name: m.name.clone(),
            mount_path: m.mount_path.clone(),
            read_only: m.read_only.then_some(true),
            sub_path: m.sub_path.clone(),
            mount_propagation: m.mount_propagation.clone(),
            sub_path_expr: m.sub_path_expr.clone(),
            ..VolumeMount::default()
        })
        .collect();
    out.push(VolumeMount { name: labels::HOST_TIMEZONE.into(), mount_path: "/etc/localtime".into(), ..VolumeMount::default() });
    if ts.is_tars() {
        out.push(node_work_dir_mount());
    }
    out
}

fn node_work_dir_mount() -> VolumeMount {
    VolumeMount { name: labels::NODE_WORK_DIR.into(), mount_path: labels::NODE_WORK_DIR_PATH.into(), ..VolumeMount::default() }
}

fn volumes(ts: &TServer) -> Vec<Volume> {
    let mut out: Vec<Volume> = ts
        .spec
        .k8s
        .mounts
        .iter()
        .filter(|m| m.source.t_local_volume.is_none() && m.source.persistent_volume_claim_template.is_none())
        .map(|m| Volume {
            name: m.name.clone(),
            host_path: m.source.host_path.clone(),
            empty_dir: m.source.empty_dir.clone(),
            secret: m.source.secret.clone(),
            config_map: m.source.config_map.clone(),
            downward_api: m.source.downward_api.clone(),
            persistent_volume_claim: m.source.persistent_volume_claim.clone(),
            ..Volume::default()
        })
        .collect();
    out.push(Volume {
        name: labels::HOST_TIMEZONE.into(),
        host_path: Some(HostPathVolumeSource { path: "/etc/localtime".into(), ..HostPathVolumeSource::default() }),
        ..Volume::default()
    });
    if ts.is_tars() {
        out.push(Volume {
            name: labels::NODE_WORK_DIR.into(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Volume::default()
        });
    }
    out
}

fn exists(key: String) -> NodeSelectorRequirement {
    NodeSelectorRequirement { key, operator: "Exists".into(), values: None }
}

fn affinity(ts: &TServer) -> Affinity {
    let ns = ts.namespace().unwrap_or_default();
    let (app, server) = (&ts.spec.app, &ts.spec.server);
    let k8s = &ts.spec.k8s;

    let mut required = k8s.node_selector.clone();
    required.push(exists(format!("{}.{}", labels::NODE, ns)));

    let mut preferred = Vec::new();
    let mut anti = None;
    if !k8s.daemon_set {
        let app_key = format!("{}.{}.{}", labels::ABILITY_PREFIX, ns, app);
        let server_key = format!("{}.{}.{}-{}", labels::ABILITY_PREFIX, ns, app, server);
        match k8s.ability_affinity {
            AbilityAffinity::AppRequired => required.push(exists(app_key)),
            AbilityAffinity::ServerRequired => required.push(exists(server_key)),
            AbilityAffinity::AppOrServerPreferred => {
                let term = |weight, key| PreferredSchedulingTerm {
                    weight,
                    preference: NodeSelectorTerm { match_expressions: Some(vec![exists(key)]), match_fields: None },
                };
                preferred = vec![term(60, server_key), term(30, app_key)];
            }
            AbilityAffinity::None => {}
        }
        if k8s.not_stacked {
            anti = Some(PodAntiAffinity {
                required_during_scheduling_ignored_during_execution: Some(vec![PodAffinityTerm {
                    label_selector: Some(LabelSelector { match_labels: Some(selector_labels(ts)), match_expressions: None }),
                    namespaces: Some(vec![ns.clone()]),
                    topology_key: labels::HOSTNAME.into(),
                    ..PodAffinityTerm::default()
                }]),
                ..PodAntiAffinity::default()
            });
        }
    }

    Affinity {
        node_affinity: Some(NodeAffinity {
            required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                node_selector_terms: vec![NodeSelectorTerm { match_expressions: Some(required), match_fields: None }],
            }),
            preferred_during_scheduling_ignored_during_execution: (!preferred.is_empty()).then_some(preferred),
        }),
        pod_anti_affinity: anti,
        ..Affinity::default()
    }
}

fn field_env(name: &str, path: &str) -> EnvVar {
    EnvVar {
        name: name.into(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector { field_path: path.into(), api_version: None }),
            ..EnvVarSource::default()
        }),
        value: None,
    }
}

fn value_env(name: &str, value: &str) -> EnvVar { EnvVar { name: name.into(), value: Some(value.into()), value_from: None } }

/// Image of the node init container: the release's own, else the namespace default.
fn node_image(ts: &TServer, defaults: &NodeDefaults) -> Result<String, BuildError> {
    ts.spec
        .release
        .as_ref()
        .and_then(|r| r.node_image.clone())
        .or_else(|| defaults.image.clone())
        .filter(|i| !i.trim().is_empty())
        .ok_or_else(|| BuildError::MissingNodeImage {
            namespace: ts.namespace().unwrap_or_default(),
            name: ts.name_any(),
        })
}

fn init_containers(ts: &TServer, defaults: &NodeDefaults) -> Result<Option<Vec<Container>>, BuildError> {
    if !ts.is_tars() {
        return Ok(None);
    }
    let mut env = vec![
        field_env("Namespace", "metadata.namespace"),
        field_env("PodName", "metadata.name"),
        field_env("PodIP", "status.podIP"),
        value_env("ServerApp", &ts.spec.app),
        value_env("ServerName", &ts.spec.server),
    ];
    if ts.spec.k8s.launcher_type != LauncherType::Background {
        env.push(value_env("LauncherType", ts.spec.k8s.launcher_type.as_str()));
    }
    Ok(Some(vec![Container {
        name: labels::NODE_CONTAINER.into(),
        image: Some(node_image(ts, defaults)?),
        image_pull_policy: Some("Always".into()),
        env: Some(env),
        volume_mounts: Some(vec![node_work_dir_mount()]),
        ..Container::default()
    }]))
}

fn image_pull_secrets(ts: &TServer, defaults: &NodeDefaults) -> Option<Vec<LocalObjectReference>> {
    let release = ts.spec.release.as_ref()?;
    let secret = release.secret.clone().filter(|s| !s.is_empty());
    let node_secret = if ts.spec.tars.is_some() {
        release.node_secret.clone().or_else(|| defaults.secret.clone()).filter(|s| !s.is_empty())
    } else {
        None
    };
    let mut out = Vec::new();
    if let Some(s) = &secret {
        out.push(LocalObjectReference { name: Some(s.clone()) });
    }
    if let Some(n) = node_secret.filter(|n| Some(n) != secret.as_ref()) {
        out.push(LocalObjectReference { name: Some(n) });
    }
    (!out.is_empty()).then_some(out)
}

/// Pod template for the workload of `ts`.
///
/// Fails only when `ts` is a tars server and no node image can be resolved.
pub fn build_pod_template(ts: &TServer, defaults: &NodeDefaults) -> Result<PodTemplateSpec, BuildError> {
    let k8s = &ts.spec.k8s;
    let mut pod_labels: BTreeMap<String, String> = selector_labels(ts);
    if let Some(release) = &ts.spec.release {
        pod_labels.insert(labels::SERVER_ID.into(), release.id.clone());
    }
    let image = ts.spec.release.as_ref().map_or(labels::IMAGE_PLACEHOLDER.to_string(), |r| r.image.clone());
    let ports = container_ports(ts);
    let gates: Vec<PodReadinessGate> =
        k8s.readiness_gates.iter().map(|g| PodReadinessGate { condition_type: g.clone() }).collect();

    let main = Container {
        name: ts.name_any(),
        image: Some(image),
        command: non_empty(k8s.command.clone()),
        args: non_empty(k8s.args.clone()),
        ports: (!ports.is_empty()).then_some(ports),
        env_from: (!k8s.env_from.is_empty()).then(|| k8s.env_from.clone()),
        env: (!k8s.env.is_empty()).then(|| k8s.env.clone()),
        resources: k8s.resources.clone(),
        volume_mounts: Some(volume_mounts(ts)),
        image_pull_policy: k8s.image_pull_policy.clone(),
        ..Container::default()
    };

    Ok(PodTemplateSpec {
        metadata: Some(ObjectMeta { name: Some(ts.name_any()), labels: Some(pod_labels), ..ObjectMeta::default() }),
        spec: Some(PodSpec {
            volumes: Some(volumes(ts)),
            init_containers: init_containers(ts, defaults)?,
            containers: vec![main],
            restart_policy: Some("Always".into()),
            dns_policy: Some(if k8s.host_network { "ClusterFirstWithHostNet" } else { "ClusterFirst" }.into()),
            service_account_name: k8s.service_account.clone(),
            host_network: k8s.host_network.then_some(true),
            host_ipc: k8s.host_ipc.then_some(true),
            image_pull_secrets: image_pull_secrets(ts, defaults),
            affinity: Some(affinity(ts)),
            dns_config: Some(PodDNSConfig {
                options: Some(vec![PodDNSConfigOption { name: Some("ndots".into()), value: Some("2".into()) }]),
                ..PodDNSConfig::default()
            }),
            readiness_gates: (!gates.is_empty()).then_some(gates),
            enable_service_links: Some(false),
            ..PodSpec::default()
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::tserver;
    use keel_schema::{SubType, TK8SHostPort, TServerPort};

    #[test]
    fn tars_template_carries_node_init_container() {
        let ts = tserver("Test", "Hello");
        let tpl = build_pod_template(&ts, &NodeDefaults::default()).unwrap();
        let spec = tpl.spec.unwrap();
        let init = spec.init_containers.unwrap();
        assert_eq!(init[0].name, "tarsnode");
        assert_eq!(init[0].image.as_deref(), Some("tarsnode:v1"));
        let names: Vec<_> = spec.volumes.unwrap().into_iter().map(|v| v.name).collect();
        assert_eq!(names, ["host-timezone", "tarsnode-work-dir"]);
        assert_eq!(tpl.metadata.unwrap().labels.unwrap()[labels::SERVER_ID], "v1");
    }

    #[test]
    fn node_image_falls_back_to_namespace_default_then_fails() {
        let mut ts = tserver("Test", "Hello");
        ts.spec.release.as_mut().unwrap().node_image = None;
        let defaults = NodeDefaults { image: Some("tarsnode:ns".into()), secret: None };
        let tpl = build_pod_template(&ts, &defaults).unwrap();
        assert_eq!(tpl.spec.unwrap().init_containers.unwrap()[0].image.as_deref(), Some("tarsnode:ns"));

        let err = build_pod_template(&ts, &NodeDefaults::default()).unwrap_err();
        assert!(matches!(err, BuildError::MissingNodeImage { .. }));

        ts.spec.sub_type = SubType::Normal;
        assert!(build_pod_template(&ts, &NodeDefaults::default()).is_ok());
    }

    #[test]
    fn host_ports_bind_servants_and_ports() {
        let mut ts = tserver("Test", "Hello");
        ts.spec.tars.as_mut().unwrap().ports = vec![TServerPort { name: "http".into(), port: 8080, is_tcp: true }];
        ts.spec.k8s.host_ports = vec![
            TK8SHostPort { name_ref: "HelloObj".into(), port: 20000 },
            TK8SHostPort { name_ref: "http".into(), port: 28080 },
        ];
        let ports = container_ports(&ts);
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[0].host_port, Some(28080));
        assert_eq!(ports[1].name.as_deref(), Some("p20000-10000"));

        ts.spec.k8s.host_network = true;
        assert!(container_ports(&ts).iter().all(|p| p.host_port.is_none()));
    }

    #[test]
    fn ability_affinity_and_anti_stacking() {
        let mut ts = tserver("Test", "Hello");
        ts.spec.k8s.ability_affinity = AbilityAffinity::ServerRequired;
        ts.spec.k8s.not_stacked = true;
        let a = affinity(&ts);
        let terms = a.node_affinity.unwrap().required_during_scheduling_ignored_during_execution.unwrap().node_selector_terms;
        let keys: Vec<_> = terms[0].match_expressions.as_ref().unwrap().iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, ["tars.io/node.tars", "tars.io/ability.tars.Test-Hello"]);
        assert!(a.pod_anti_affinity.is_some());

        ts.spec.k8s.daemon_set = true;
        let a = affinity(&ts);
        assert!(a.pod_anti_affinity.is_none());
    }
}
