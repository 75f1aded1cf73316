//! Child object templates.
//!
//! Every builder is a pure function of the cluster, the tier's spec & its resolved properties.
//! Builders stamp canonical labels & the owner reference; fingerprints are stamped at apply time.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, EnvVar, EnvVarSource, HTTPGetAction, ObjectFieldSelector, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec, Probe, ResourceRequirements, SecretVolumeSource, Service, ServicePort, ServiceSpec,
    TCPSocketAction, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::Resource;

use crate::tierconfig::TierConfig;
use quarry_core::crd::{QuarryCluster, RequiredMetadata, TierSpec};
use quarry_core::{TierKind, TierNames};

/// The name of the volume holding a tier's properties file.
const CONFIG_VOLUME: &str = "tier-config";

pub const FE_HTTP_PORT: i32 = 8030;
pub const FE_RPC_PORT: i32 = 9020;
pub const FE_QUERY_PORT: i32 = 9030;
pub const FE_EDIT_LOG_PORT: i32 = 9010;
pub const BE_PORT: i32 = 9060;
pub const WEBSERVER_PORT: i32 = 8040;
pub const HEARTBEAT_PORT: i32 = 9050;
pub const BRPC_PORT: i32 = 8060;
pub const PROXY_HTTP_PORT: i32 = 8080;

/// A named port of a tier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TierPort {
    pub name: &'static str,
    pub port: i32,
}

/// The ports served by the given tier, honoring overrides from its properties.
pub fn tier_ports(tier: TierKind, config: &TierConfig) -> Vec<TierPort> {
    let port = |name: &'static str, key: &str, default: i32| TierPort { name, port: config.port(key, default) };
    match tier {
        TierKind::Frontend => vec![
            port("http", "http_port", FE_HTTP_PORT),
            port("rpc", "rpc_port", FE_RPC_PORT),
            port("query", "query_port", FE_QUERY_PORT),
            port("edit-log", "edit_log_port", FE_EDIT_LOG_PORT),
        ],
        TierKind::Backend => vec![
            port("be", "be_port", BE_PORT),
            port("webserver", "webserver_port", WEBSERVER_PORT),
            port("heartbeat", "heartbeat_service_port", HEARTBEAT_PORT),
            port("brpc", "brpc_port", BRPC_PORT),
        ],
        TierKind::Compute => vec![
            port("thrift", "thrift_port", BE_PORT),
            port("webserver", "webserver_port", WEBSERVER_PORT),
            port("heartbeat", "heartbeat_service_port", HEARTBEAT_PORT),
            port("brpc", "brpc_port", BRPC_PORT),
        ],
        TierKind::Proxy => vec![TierPort { name: "http", port: PROXY_HTTP_PORT }],
    }
}

/// The address at which dependent tiers reach the frontend tier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrontendAddress {
    pub service: String,
    pub query_port: i32,
    pub http_port: i32,
}

impl FrontendAddress {
    pub fn new(cluster: &QuarryCluster, config: &TierConfig) -> Self {
        let names = TierNames::new(cluster.name(), TierKind::Frontend);
        Self {
            service: format!("{}.{}", names.internal_service, cluster.namespace()),
            query_port: config.port("query_port", FE_QUERY_PORT),
            http_port: config.port("http_port", FE_HTTP_PORT),
        }
    }
}

/// Everything needed to render the children of one tier.
pub struct TierTemplate<'a> {
    pub cluster: &'a QuarryCluster,
    pub names: &'a TierNames,
    pub spec: &'a TierSpec,
    pub config: &'a TierConfig,
    /// The frontend address, for dependent tiers.
    pub frontend: Option<&'a FrontendAddress>,
    /// Tier specific environment, placed before user supplied environment.
    pub env: Vec<EnvVar>,
}

impl<'a> TierTemplate<'a> {
    /// Metadata for a child object with the given name.
    fn metadata(&self, name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.into()),
            namespace: Some(self.cluster.namespace().into()),
            labels: Some(self.names.labels()),
            owner_references: self.cluster.controller_owner_ref(&()).map(|owner| vec![owner]),
            ..Default::default()
        }
    }

    fn service_ports(&self) -> Vec<ServicePort> {
        tier_ports(self.names.tier, self.config)
            .into_iter()
            .map(|port| ServicePort {
                name: Some(port.name.into()),
                port: port.port,
                protocol: Some("TCP".into()),
                target_port: Some(IntOrString::Int(port.port)),
                ..Default::default()
            })
            .collect()
    }

    /// Build the externally reachable service of this tier.
    pub fn build_external_service(&self) -> Service {
        let mut service = Service {
            metadata: self.metadata(&self.names.external_service),
            ..Default::default()
        };
        let service_spec = self.spec.service.clone().unwrap_or_default();
        if let Some(annotations) = service_spec.annotations {
            service.metadata.annotations = Some(annotations);
        }
        service.spec = Some(ServiceSpec {
            type_: Some(service_spec.type_.unwrap_or_else(|| "ClusterIP".into())),
            selector: Some(self.names.selector_labels()),
            ports: Some(self.service_ports()),
            ..Default::default()
        });
        service
    }

    /// Build the headless service which gives this tier's instances a stable identity.
    pub fn build_internal_service(&self) -> Service {
        Service {
            metadata: self.metadata(&self.names.internal_service),
            spec: Some(ServiceSpec {
                cluster_ip: Some("None".into()),
                type_: Some("ClusterIP".into()),
                publish_not_ready_addresses: Some(true),
                selector: Some(self.names.selector_labels()),
                ports: Some(self.service_ports()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Build the StatefulSet backing this tier.
    #[tracing::instrument(level = "debug", skip(self), fields(tier = %self.names.tier))]
    pub fn build_statefulset(&self) -> StatefulSet {
        let mut sts = StatefulSet {
            metadata: self.metadata(&self.names.workload),
            ..Default::default()
        };
        let spec = sts.spec.get_or_insert_with(StatefulSetSpec::default);
        spec.replicas = self.spec.replicas;
        spec.service_name = self.names.internal_service.clone();
        spec.pod_management_policy = Some("Parallel".into());
        spec.update_strategy = Some(StatefulSetUpdateStrategy {
            type_: Some("RollingUpdate".into()),
            rolling_update: None,
        });
        spec.selector = LabelSelector {
            match_labels: Some(self.names.selector_labels()),
            ..Default::default()
        };
        spec.template = self.build_pod_template();
        if !self.spec.storage_volumes.is_empty() {
            spec.volume_claim_templates = Some(
                self.spec
                    .storage_volumes
                    .iter()
                    .map(|volume| PersistentVolumeClaim {
                        metadata: ObjectMeta { name: Some(volume.name.clone()), ..Default::default() },
                        spec: Some(PersistentVolumeClaimSpec {
                            access_modes: Some(vec!["ReadWriteOnce".into()]),
                            storage_class_name: volume.storage_class_name.clone(),
                            resources: Some(ResourceRequirements {
                                requests: Some(maplit::btreemap! {
                                    "storage".into() => Quantity(volume.storage_size.clone()),
                                }),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }),
                        ..Default::default()
                    })
                    .collect(),
            );
        }
        sts
    }

    /// Build the Deployment backing this tier.
    #[tracing::instrument(level = "debug", skip(self), fields(tier = %self.names.tier))]
    pub fn build_deployment(&self) -> Deployment {
        Deployment {
            metadata: self.metadata(&self.names.workload),
            spec: Some(DeploymentSpec {
                replicas: self.spec.replicas,
                selector: LabelSelector {
                    match_labels: Some(self.names.selector_labels()),
                    ..Default::default()
                },
                template: self.build_pod_template(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn build_pod_template(&self) -> PodTemplateSpec {
        let tier = self.names.tier;
        let ports = tier_ports(tier, self.config);
        let config_mount_path = format!("/etc/quarry/{}/conf", tier.short_name());

        let mut env = vec![
            field_env("POD_NAME", "metadata.name"),
            field_env("POD_NAMESPACE", "metadata.namespace"),
            field_env("POD_IP", "status.podIP"),
            value_env("HOST_TYPE", "FQDN"),
            value_env("CONFIGMAP_MOUNT_PATH", &config_mount_path),
        ];
        if let Some(frontend) = self.frontend {
            env.push(value_env("FE_SERVICE_NAME", &frontend.service));
            env.push(value_env("FE_QUERY_PORT", &frontend.query_port.to_string()));
            env.push(value_env("FE_HTTP_PORT", &frontend.http_port.to_string()));
        }
        env.extend(self.env.iter().cloned());
        env.extend(self.spec.env_vars.iter().map(|var| value_env(&var.name, &var.value)));

        let mut volumes = vec![];
        let mut mounts = vec![];
        if let Some(reference) = self.spec.config_map_info.as_ref() {
            volumes.push(Volume {
                name: CONFIG_VOLUME.into(),
                config_map: Some(ConfigMapVolumeSource {
                    name: Some(reference.config_map_name.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            });
            mounts.push(VolumeMount {
                name: CONFIG_VOLUME.into(),
                mount_path: config_mount_path.clone(),
                ..Default::default()
            });
        }
        if tier.workload_kind() == quarry_core::WorkloadKind::StatefulSet {
            mounts.extend(self.spec.storage_volumes.iter().map(|volume| VolumeMount {
                name: volume.name.clone(),
                mount_path: volume.mount_path.clone(),
                ..Default::default()
            }));
        }
        for mount in self.spec.config_maps.iter() {
            volumes.push(Volume {
                name: mount.name.clone(),
                config_map: Some(ConfigMapVolumeSource { name: Some(mount.name.clone()), ..Default::default() }),
                ..Default::default()
            });
            mounts.push(VolumeMount {
                name: mount.name.clone(),
                mount_path: mount.mount_path.clone(),
                sub_path: mount.sub_path.clone(),
                ..Default::default()
            });
        }
        for mount in self.spec.secrets.iter() {
            volumes.push(Volume {
                name: mount.name.clone(),
                secret: Some(SecretVolumeSource { secret_name: Some(mount.name.clone()), ..Default::default() }),
                ..Default::default()
            });
            mounts.push(VolumeMount {
                name: mount.name.clone(),
                mount_path: mount.mount_path.clone(),
                sub_path: mount.sub_path.clone(),
                ..Default::default()
            });
        }

        let resources = self.spec.resources.as_ref().map(|resources| ResourceRequirements {
            requests: resources.requests.as_ref().map(to_quantities),
            limits: resources.limits.as_ref().map(to_quantities),
            ..Default::default()
        });

        let probe = health_probe(tier, self.config);
        PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(self.names.labels()),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                termination_grace_period_seconds: Some(120),
                service_account_name: self.spec.service_account.clone(),
                node_selector: self.spec.node_selector.clone(),
                volumes: if volumes.is_empty() { None } else { Some(volumes) },
                containers: vec![Container {
                    // NOTE WELL: do not change the name of this container, live images are located by it.
                    name: tier.short_name().into(),
                    image: Some(self.spec.image.clone()),
                    image_pull_policy: Some(self.spec.image_pull_policy.clone().unwrap_or_else(|| "IfNotPresent".into())),
                    ports: Some(
                        ports
                            .iter()
                            .map(|port| ContainerPort {
                                name: Some(port.name.into()),
                                container_port: port.port,
                                protocol: Some("TCP".into()),
                                ..Default::default()
                            })
                            .collect(),
                    ),
                    env: Some(env),
                    resources,
                    volume_mounts: if mounts.is_empty() { None } else { Some(mounts) },
                    startup_probe: Some(Probe {
                        failure_threshold: Some(60),
                        period_seconds: Some(5),
                        ..probe.clone()
                    }),
                    liveness_probe: Some(Probe {
                        failure_threshold: Some(3),
                        period_seconds: Some(5),
                        ..probe.clone()
                    }),
                    readiness_probe: Some(Probe {
                        failure_threshold: Some(3),
                        period_seconds: Some(5),
                        ..probe
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }),
        }
    }
}

/// The health check action of the given tier.
fn health_probe(tier: TierKind, config: &TierConfig) -> Probe {
    match tier {
        TierKind::Frontend => http_probe(config.port("http_port", FE_HTTP_PORT)),
        TierKind::Proxy => http_probe(PROXY_HTTP_PORT),
        TierKind::Backend | TierKind::Compute => tcp_probe(config.port("heartbeat_service_port", HEARTBEAT_PORT)),
    }
}

fn http_probe(port: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some("/api/health".into()),
            port: IntOrString::Int(port),
            scheme: Some("HTTP".into()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// A bare port-open check.
pub fn tcp_probe(port: i32) -> Probe {
    Probe {
        tcp_socket: Some(TCPSocketAction {
            port: IntOrString::Int(port),
            host: None,
        }),
        ..Default::default()
    }
}

pub fn value_env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.into(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn field_env(name: &str, path: &str) -> EnvVar {
    EnvVar {
        name: name.into(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: path.into(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn to_quantities(raw: &BTreeMap<String, String>) -> BTreeMap<String, Quantity> {
    raw.iter().map(|(key, val)| (key.clone(), Quantity(val.clone()))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;

    #[test]
    fn statefulset_carries_labels_owner_and_image() {
        let cluster = fixtures::cluster("prod", "quarry/fe:3.1");
        let names = TierNames::new("prod", TierKind::Frontend);
        let spec = cluster.spec.tier(TierKind::Frontend).cloned().unwrap_or_default();
        let config = TierConfig::parse("query_port = 19030");
        let template = TierTemplate { cluster: &cluster, names: &names, spec: &spec, config: &config, frontend: None, env: vec![] };

        let sts = template.build_statefulset();
        let sts_spec = sts.spec.as_ref().expect("expected statefulset spec");
        let pod_spec = sts_spec.template.spec.as_ref().expect("expected pod spec");

        assert_eq!(sts.metadata.name.as_deref(), Some("prod-fe"));
        assert_eq!(sts_spec.replicas, Some(3));
        assert_eq!(sts_spec.service_name, "prod-fe-search");
        assert_eq!(pod_spec.containers[0].image.as_deref(), Some("quarry/fe:3.1"));
        assert!(sts.metadata.owner_references.as_ref().map(|refs| refs.len()) == Some(1), "expected a controller owner reference");
        let query = pod_spec.containers[0].ports.as_ref().and_then(|ports| ports.iter().find(|port| port.name.as_deref() == Some("query")).cloned());
        assert_eq!(query.map(|port| port.container_port), Some(19030));
    }

    #[test]
    fn dependents_receive_frontend_address() {
        let cluster = fixtures::cluster("prod", "quarry/cn:3.1");
        let names = TierNames::new("prod", TierKind::Compute);
        let spec = cluster.spec.tier(TierKind::Compute).cloned().unwrap_or_default();
        let config = TierConfig::default();
        let frontend = FrontendAddress::new(&cluster, &TierConfig::default());
        let template = TierTemplate { cluster: &cluster, names: &names, spec: &spec, config: &config, frontend: Some(&frontend), env: vec![] };

        let sts = template.build_statefulset();
        let env = sts.spec.and_then(|spec| spec.template.spec).map(|spec| spec.containers[0].env.clone().unwrap_or_default()).unwrap_or_default();
        let fe_service = env.iter().find(|var| var.name == "FE_SERVICE_NAME").and_then(|var| var.value.clone());

        assert_eq!(fe_service.as_deref(), Some("prod-fe-search.default"));
    }

    #[test]
    fn internal_service_is_headless() {
        let cluster = fixtures::cluster("prod", "quarry/fe:3.1");
        let names = TierNames::new("prod", TierKind::Frontend);
        let spec = TierSpec::default();
        let config = TierConfig::default();
        let template = TierTemplate { cluster: &cluster, names: &names, spec: &spec, config: &config, frontend: None, env: vec![] };

        let service = template.build_internal_service();
        let service_spec = service.spec.expect("expected service spec");
        assert_eq!(service_spec.cluster_ip.as_deref(), Some("None"));
        assert_eq!(service_spec.publish_not_ready_addresses, Some(true));
    }
}
