//! # Exporter deployment manifest
//!
//! This module build the optional metrics exporter deployment. Only the
//! address and password environment variables are owned by the operator when
//! reconciling an existing deployment.

use std::collections::BTreeMap;

use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec},
        core::v1::{
            Container, ContainerPort, EnvVar, HTTPGetAction, PodSpec, PodTemplateSpec, Probe,
            ResourceRequirements,
        },
    },
    apimachinery::pkg::{
        api::resource::Quantity,
        apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference},
        util::intstr::IntOrString,
    },
};

use crate::svc::{crd::redis::Redis, k8s::secret, manifest};

// -----------------------------------------------------------------------------
// Constants

pub const REDIS_ADDR_ENV: &str = "REDIS_ADDR";
pub const REDIS_SENTINEL_ADDR_ENV: &str = "REDIS_SENTINEL_ADDR";
pub const REDIS_SM4_PASSWORD_ENV: &str = "REDIS_SM4_PASSWORD";

const DEFAULT_REQUEST_CPU: &str = "25m";
const DEFAULT_LIMIT_CPU: &str = "50m";
const DEFAULT_REQUEST_MEMORY: &str = "50Mi";
const DEFAULT_LIMIT_MEMORY: &str = "100Mi";

// -----------------------------------------------------------------------------
// Address helpers

/// returns the comma separated list of redis addresses the exporter scrapes
pub fn redis_addr(rf: &Redis) -> String {
    (0..rf.spec.redis.replicas)
        .map(|index| {
            format!(
                "redis://{}:{}",
                manifest::redis_host(rf, index),
                manifest::redis_port(rf, index)
            )
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// returns the comma separated list of sentinel addresses the exporter scrapes
pub fn sentinel_addr(rf: &Redis) -> String {
    (0..rf.spec.sentinel.replicas)
        .map(|index| {
            format!(
                "redis://{}:{}",
                manifest::sentinel_host(rf, index),
                manifest::sentinel_port(rf, index)
            )
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn label_or_unknown(rf: &Redis, key: &str) -> String {
    rf.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(key))
        .filter(|value| !value.is_empty())
        .map(String::to_owned)
        .unwrap_or_else(|| "unknown".into())
}

// -----------------------------------------------------------------------------
// Env helpers

pub(crate) fn env_by_container_name(
    container_name: &str,
    containers: &[Container],
    key: &str,
) -> Option<String> {
    containers
        .iter()
        .find(|container| container.name == container_name)
        .and_then(|container| container.env.as_ref())
        .and_then(|env| env.iter().find(|var| var.name == key))
        .and_then(|var| var.value.to_owned())
}

pub(crate) fn set_env_by_container_name(
    container_name: &str,
    containers: &[Container],
    key: &str,
    value: &str,
) -> Vec<Container> {
    containers
        .iter()
        .map(|container| {
            let mut container = container.to_owned();
            if container.name == container_name {
                if let Some(env) = container.env.as_mut() {
                    for var in env.iter_mut() {
                        if var.name == key {
                            var.value = Some(value.into());
                            var.value_from = None;
                        }
                    }
                }
            }
            container
        })
        .collect()
}

// -----------------------------------------------------------------------------
// Builders

fn default_resources() -> ResourceRequirements {
    let mut limits = BTreeMap::new();
    let mut requests = BTreeMap::new();

    limits.insert("cpu".to_string(), Quantity(DEFAULT_LIMIT_CPU.into()));
    limits.insert("memory".to_string(), Quantity(DEFAULT_LIMIT_MEMORY.into()));
    requests.insert("cpu".to_string(), Quantity(DEFAULT_REQUEST_CPU.into()));
    requests.insert("memory".to_string(), Quantity(DEFAULT_REQUEST_MEMORY.into()));

    ResourceRequirements {
        limits: Some(limits),
        requests: Some(requests),
        ..Default::default()
    }
}

fn http_probe(path: &str, port: i32) -> Probe {
    Probe {
        initial_delay_seconds: Some(manifest::GRACE_TIME),
        timeout_seconds: Some(5),
        period_seconds: Some(manifest::DEFAULT_PERIOD_SECONDS),
        success_threshold: Some(manifest::DEFAULT_SUCCESS_THRESHOLD),
        failure_threshold: Some(manifest::DEFAULT_FAILURE_THRESHOLD),
        http_get: Some(HTTPGetAction {
            path: Some(path.into()),
            port: IntOrString::Int(port),
            scheme: Some("HTTP".into()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn exporter_deployment(
    rf: &Redis,
    owner_refs: &[OwnerReference],
    password: &str,
) -> Result<Deployment, secret::Error> {
    let labels = manifest::exporter_labels(rf);
    let port = manifest::exporter_port(rf);
    let port_number: i32 = port.parse().unwrap_or(manifest::EXPORTER_CONTAINER_PORT);

    let node_affinity = manifest::static_node_affinity(
        Some(rf.spec.exporter.static_resource.host.as_str()).filter(|host| !host.is_empty()),
    );
    let affinity = manifest::node_and_pod_affinity(
        &rf.spec.exporter.affinity,
        false,
        &labels,
        node_affinity,
    );

    let sm4_password = secret::encrypt_sm4(password)?;

    let env = vec![
        EnvVar {
            name: "REDIS_EXPORTER_WEB_LISTEN_ADDRESS".into(),
            value: Some(format!(":{}", port)),
            ..Default::default()
        },
        EnvVar {
            name: REDIS_ADDR_ENV.into(),
            value: Some(redis_addr(rf)),
            ..Default::default()
        },
        EnvVar {
            name: REDIS_SENTINEL_ADDR_ENV.into(),
            value: Some(sentinel_addr(rf)),
            ..Default::default()
        },
        EnvVar {
            name: "REDIS_EXPORTER_REGION_ID".into(),
            value: Some(label_or_unknown(rf, "region_id")),
            ..Default::default()
        },
        EnvVar {
            name: "REDIS_EXPORTER_PRODUCT_ID".into(),
            value: Some(label_or_unknown(rf, "product_id")),
            ..Default::default()
        },
        EnvVar {
            name: "REDIS_EXPORTER_INSTANCE_ID".into(),
            value: Some(label_or_unknown(rf, "instance_id")),
            ..Default::default()
        },
        EnvVar {
            name: "REDIS_EXPORTER_INSTANCE_NAME".into(),
            value: Some(manifest::rf_name(rf)),
            ..Default::default()
        },
        EnvVar {
            name: REDIS_SM4_PASSWORD_ENV.into(),
            value: Some(sm4_password),
            ..Default::default()
        },
        EnvVar {
            name: "TZ".into(),
            value: Some("Asia/Shanghai".into()),
            ..Default::default()
        },
    ];

    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(manifest::exporter_root_name(rf)),
            namespace: Some(manifest::rf_namespace(rf)),
            labels: Some(labels.to_owned()),
            owner_references: Some(owner_refs.to_vec()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.to_owned()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    affinity,
                    host_network: Some(rf.spec.exporter.host_network),
                    containers: vec![Container {
                        name: manifest::EXPORTER_CONTAINER_NAME.into(),
                        image: Some(rf.spec.exporter.image.to_owned()),
                        image_pull_policy: Some(manifest::pull_policy(
                            &rf.spec.exporter.image_pull_policy,
                        )),
                        ports: Some(vec![ContainerPort {
                            name: Some(manifest::EXPORTER_CONTAINER_NAME.into()),
                            container_port: port_number,
                            protocol: Some("TCP".into()),
                            ..Default::default()
                        }]),
                        env: Some(env),
                        resources: Some(default_resources()),
                        liveness_probe: Some(http_probe("/health", port_number)),
                        readiness_probe: Some(http_probe("/metrics", port_number)),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// carries the owned environment variables over to an already existing
/// deployment
pub fn exporter_deployment_from_existing(
    rf: &Redis,
    password: &str,
    existing: &Deployment,
) -> Result<Deployment, secret::Error> {
    let mut desired = existing.to_owned();
    let sm4_password = secret::encrypt_sm4(password)?;

    if let Some(spec) = desired.spec.as_mut() {
        if let Some(pod_spec) = spec.template.spec.as_mut() {
            pod_spec.containers = set_env_by_container_name(
                manifest::EXPORTER_CONTAINER_NAME,
                &pod_spec.containers,
                REDIS_ADDR_ENV,
                &redis_addr(rf),
            );
            pod_spec.containers = set_env_by_container_name(
                manifest::EXPORTER_CONTAINER_NAME,
                &pod_spec.containers,
                REDIS_SENTINEL_ADDR_ENV,
                &sentinel_addr(rf),
            );
            pod_spec.containers = set_env_by_container_name(
                manifest::EXPORTER_CONTAINER_NAME,
                &pod_spec.containers,
                REDIS_SM4_PASSWORD_ENV,
                &sm4_password,
            );
        }
    }

    Ok(desired)
}

pub fn exporter_deployments_equal(desired: &Deployment, existing: &Deployment) -> bool {
    let containers_of = |deployment: &Deployment| {
        deployment
            .spec
            .as_ref()
            .and_then(|spec| spec.template.spec.as_ref())
            .map(|pod_spec| pod_spec.containers.to_owned())
            .unwrap_or_default()
    };

    let desired_containers = containers_of(desired);
    let existing_containers = containers_of(existing);

    [REDIS_ADDR_ENV, REDIS_SENTINEL_ADDR_ENV, REDIS_SM4_PASSWORD_ENV]
        .iter()
        .all(|key| {
            env_by_container_name(manifest::EXPORTER_CONTAINER_NAME, &desired_containers, key)
                == env_by_container_name(manifest::EXPORTER_CONTAINER_NAME, &existing_containers, key)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::svc::crd::redis::{Spec, StaticResource};

    fn fixture() -> Redis {
        let mut rf = Redis::new("redis-sample", Spec::default());

        rf.metadata.namespace = Some("redis-system".into());
        rf.spec.redis.replicas = 2;
        rf.spec.sentinel.replicas = 3;
        rf.spec.exporter.enabled = true;
        rf.spec.exporter.image = "redis-exporter:latest".into();
        rf
    }

    #[test]
    fn test_redis_addr_uses_headless_services() {
        assert_eq!(
            redis_addr(&fixture()),
            "redis://headless-redis-redis-sample-0:6379,redis://headless-redis-redis-sample-1:6379"
        );
    }

    #[test]
    fn test_redis_addr_uses_static_resources() {
        let mut rf = fixture();

        rf.spec.redis.static_resources = vec![
            StaticResource {
                host: "h1".into(),
                port: 7001,
            },
            StaticResource {
                host: "h2".into(),
                port: 7002,
            },
        ];

        assert_eq!(redis_addr(&rf), "redis://h1:7001,redis://h2:7002");
    }

    #[test]
    fn test_exporter_deployment_env() {
        let deployment = exporter_deployment(&fixture(), &[], "pass").unwrap();
        let containers = deployment
            .spec
            .as_ref()
            .unwrap()
            .template
            .spec
            .as_ref()
            .unwrap()
            .containers
            .to_owned();

        assert_eq!(
            env_by_container_name("exporter", &containers, REDIS_SENTINEL_ADDR_ENV).unwrap(),
            sentinel_addr(&fixture())
        );

        let sm4 = env_by_container_name("exporter", &containers, REDIS_SM4_PASSWORD_ENV).unwrap();
        assert_eq!(secret::decrypt_sm4(&sm4).unwrap(), "pass");
    }

    #[test]
    fn test_exporter_deployments_equal_tracks_owned_env_only() {
        let rf = fixture();
        let deployment = exporter_deployment(&rf, &[], "pass").unwrap();
        let same = exporter_deployment_from_existing(&rf, "pass", &deployment).unwrap();

        assert!(exporter_deployments_equal(&same, &deployment));

        let mut drifted = fixture();
        drifted.spec.redis.replicas = 3;
        let desired = exporter_deployment_from_existing(&drifted, "pass", &deployment).unwrap();

        assert!(!exporter_deployments_equal(&desired, &deployment));
    }
}
