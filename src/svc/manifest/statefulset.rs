//! # StatefulSet manifests
//!
//! This module build the per-replica redis and sentinel statefulsets, and
//! implement the owned-field equality used by the ensure pipeline. Resource
//! quantities are compared on their parsed value, the cluster canonicalises
//! what users write (`0.1` comes back as `100m`).

use std::collections::BTreeMap;

use k8s_openapi::{
    api::{
        apps::v1::{StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy},
        core::v1::{
            ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource, EnvVar,
            ExecAction, PodSpec, PodTemplateSpec, Probe, ResourceRequirements, Volume, VolumeMount,
        },
    },
    apimachinery::pkg::{
        api::resource::Quantity,
        apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference},
    },
};

use crate::svc::{
    crd::redis::{Redis, Storage},
    manifest,
};

// -----------------------------------------------------------------------------
// Constants

const REDIS_READINESS_VOLUME_NAME: &str = "redis-readiness-config";
const REDIS_STORAGE_VOLUME_NAME: &str = "redis-data";
const REDIS_LOG_STORAGE_VOLUME_NAME: &str = "redis-log";
const REDIS_CONFIG_COPY_NAME: &str = "redis-config-copy";
const REDIS_CONFIG_VOLUME_NAME: &str = "redis-config";
const SENTINEL_CONFIG_COPY_NAME: &str = "sentinel-config-copy";
const SENTINEL_CONFIG_VOLUME_NAME: &str = "sentinel-config";

const CONFIG_MAP_DEFAULT_MODE: i32 = 0o644;
const READINESS_SCRIPT_MODE: i32 = 0o744;

// -----------------------------------------------------------------------------
// Quantity helpers

/// parses a kubernetes resource quantity into nano-units, so that the spelled
/// out and canonical forms of the same value compare equal
pub(crate) fn parse_quantity(value: &str) -> Option<i128> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    let (value, negative) = match value.strip_prefix('-') {
        Some(rest) => (rest, true),
        None => (value.strip_prefix('+').unwrap_or(value), false),
    };

    let suffixes: &[(&str, i128)] = &[
        ("Ki", 1_024 * 1_000_000_000),
        ("Mi", 1_048_576 * 1_000_000_000),
        ("Gi", 1_073_741_824 * 1_000_000_000),
        ("Ti", 1_099_511_627_776 * 1_000_000_000),
        ("Pi", 1_125_899_906_842_624 * 1_000_000_000),
        ("Ei", 1_152_921_504_606_846_976 * 1_000_000_000),
        ("n", 1),
        ("u", 1_000),
        ("m", 1_000_000),
        ("k", 1_000_000_000_000),
        ("M", 1_000_000_000_000_000),
        ("G", 1_000_000_000_000_000_000),
        ("T", 1_000_000_000_000_000_000_000),
        ("P", 1_000_000_000_000_000_000_000_000),
        ("E", 1_000_000_000_000_000_000_000_000_000),
    ];

    let (digits, multiplier) = suffixes
        .iter()
        .find_map(|(suffix, multiplier)| {
            value
                .strip_suffix(suffix)
                .map(|digits| (digits, *multiplier))
        })
        .unwrap_or((value, 1_000_000_000));

    // scientific notation is only legal without a suffix
    let (digits, exponent) = match digits.split_once(['e', 'E']) {
        Some((mantissa, exponent)) => (mantissa, exponent.parse::<i32>().ok()?),
        None => (digits, 0),
    };

    let (integer, fraction) = match digits.split_once('.') {
        Some((integer, fraction)) => (integer, fraction),
        None => (digits, ""),
    };

    if integer.is_empty() && fraction.is_empty() {
        return None;
    }

    let mut numerator: i128 = if integer.is_empty() {
        0
    } else {
        integer.parse().ok()?
    };
    let mut denominator: i128 = 1;

    for digit in fraction.chars() {
        numerator = numerator
            .checked_mul(10)?
            .checked_add(digit.to_digit(10)? as i128)?;
        denominator = denominator.checked_mul(10)?;
    }

    match exponent.cmp(&0) {
        std::cmp::Ordering::Greater => {
            numerator = numerator.checked_mul(10_i128.checked_pow(exponent as u32)?)?;
        }
        std::cmp::Ordering::Less => {
            denominator = denominator.checked_mul(10_i128.checked_pow(exponent.unsigned_abs())?)?;
        }
        std::cmp::Ordering::Equal => {}
    }

    let nanos = numerator.checked_mul(multiplier)? / denominator;

    Some(if negative { -nanos } else { nanos })
}

pub(crate) fn quantities_equal(a: &Quantity, b: &Quantity) -> bool {
    match (parse_quantity(&a.0), parse_quantity(&b.0)) {
        (Some(a), Some(b)) => a == b,
        _ => a.0 == b.0,
    }
}

fn quantity_maps_equal(
    a: &Option<BTreeMap<String, Quantity>>,
    b: &Option<BTreeMap<String, Quantity>>,
) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => {
            a.len() == b.len()
                && a.iter().all(|(key, value)| {
                    b.get(key)
                        .map(|other| quantities_equal(value, other))
                        .unwrap_or(false)
                })
        }
        (Some(a), None) | (None, Some(a)) => a.is_empty(),
    }
}

pub(crate) fn resources_equal(
    a: Option<&ResourceRequirements>,
    b: Option<&ResourceRequirements>,
) -> bool {
    let empty = ResourceRequirements::default();
    let a = a.unwrap_or(&empty);
    let b = b.unwrap_or(&empty);

    quantity_maps_equal(&a.limits, &b.limits) && quantity_maps_equal(&a.requests, &b.requests)
}

// -----------------------------------------------------------------------------
// Container helpers

pub(crate) fn resources_by_container_name<'a>(
    name: &str,
    containers: &'a [Container],
) -> Option<&'a ResourceRequirements> {
    containers
        .iter()
        .find(|container| container.name == name)
        .and_then(|container| container.resources.as_ref())
}

pub(crate) fn set_resources_by_container_name(
    name: &str,
    containers: &[Container],
    resources: &ResourceRequirements,
) -> Vec<Container> {
    containers
        .iter()
        .map(|container| {
            let mut container = container.to_owned();
            if container.name == name {
                container.resources = Some(resources.to_owned());
            }
            container
        })
        .collect()
}

fn timezone_env() -> Vec<EnvVar> {
    vec![EnvVar {
        name: "TZ".into(),
        value: Some("Asia/Shanghai".into()),
        ..Default::default()
    }]
}

fn fixed_resources(cpu: &str, memory: &str) -> ResourceRequirements {
    let mut list = BTreeMap::new();

    list.insert("cpu".to_string(), Quantity(cpu.into()));
    list.insert("memory".to_string(), Quantity(memory.into()));

    ResourceRequirements {
        limits: Some(list.to_owned()),
        requests: Some(list),
        ..Default::default()
    }
}

fn exec_probe(command: Vec<String>) -> Probe {
    Probe {
        initial_delay_seconds: Some(manifest::GRACE_TIME),
        timeout_seconds: Some(5),
        period_seconds: Some(manifest::DEFAULT_PERIOD_SECONDS),
        success_threshold: Some(manifest::DEFAULT_SUCCESS_THRESHOLD),
        failure_threshold: Some(manifest::DEFAULT_FAILURE_THRESHOLD),
        exec: Some(ExecAction {
            command: Some(command),
        }),
        ..Default::default()
    }
}

/// init container that copies the mounted read-only configuration to the
/// writable path once, so that `CONFIG REWRITE` survives restarts
fn config_copy_container(
    name: &str,
    image: &str,
    pull_policy: String,
    config_volume: &str,
    data_volume: &str,
    config_path: String,
    writable_path: String,
) -> Container {
    let command = format!(
        "if test ! -f \"{}\"; then echo \"not exists\" && mkdir -p {} && cp {} {}; else echo \"exists\"; fi",
        writable_path,
        manifest::conf_writable_mount_path(),
        config_path,
        writable_path,
    );

    Container {
        name: name.into(),
        image: Some(image.into()),
        image_pull_policy: Some(pull_policy),
        volume_mounts: Some(vec![
            VolumeMount {
                name: config_volume.into(),
                mount_path: manifest::conf_mount_path().into(),
                ..Default::default()
            },
            VolumeMount {
                name: data_volume.into(),
                mount_path: "/data".into(),
                ..Default::default()
            },
        ]),
        command: Some(vec!["sh".into(), "-c".into(), command]),
        resources: Some(fixed_resources("10m", "32Mi")),
        env: Some(timezone_env()),
        ..Default::default()
    }
}

// -----------------------------------------------------------------------------
// Volume helpers

fn storage_volume_name(storage: &Storage, default: &str) -> String {
    match &storage.persistent_volume_claim {
        Some(pvc) => pvc.metadata.name.to_owned().unwrap_or_else(|| default.into()),
        None => default.into(),
    }
}

fn storage_volume(storage: &Storage, default: &str) -> Option<Volume> {
    if storage.persistent_volume_claim.is_some() {
        return None;
    }

    Some(Volume {
        name: default.into(),
        empty_dir: Some(
            storage
                .empty_dir
                .to_owned()
                .unwrap_or_else(EmptyDirVolumeSource::default),
        ),
        ..Default::default()
    })
}

fn config_map_volume(volume_name: &str, config_map_name: String, mode: i32) -> Volume {
    Volume {
        name: volume_name.into(),
        config_map: Some(ConfigMapVolumeSource {
            name: Some(config_map_name),
            default_mode: Some(mode),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn update_strategy(strategy: &StatefulSetUpdateStrategy) -> StatefulSetUpdateStrategy {
    if strategy.type_.is_none() {
        return StatefulSetUpdateStrategy {
            type_: Some("RollingUpdate".into()),
            ..Default::default()
        };
    }

    strategy.to_owned()
}

fn volume_claim_templates(
    rf_storage: &Storage,
    rf_storage_log: &Storage,
    owner_refs: &[OwnerReference],
) -> Option<Vec<k8s_openapi::api::core::v1::PersistentVolumeClaim>> {
    let mut templates = None;

    if let Some(pvc) = &rf_storage.persistent_volume_claim {
        let mut pvc = pvc.to_owned();
        if !rf_storage.keep_after_deletion {
            // owned claims follow the custom resource on deletion
            pvc.metadata.owner_references = Some(owner_refs.to_vec());
        }
        templates = Some(vec![pvc]);
    }

    if let Some(pvc) = &rf_storage_log.persistent_volume_claim {
        let mut pvc = pvc.to_owned();
        if !rf_storage_log.keep_after_deletion {
            pvc.metadata.owner_references = Some(owner_refs.to_vec());
        }
        templates = Some(vec![pvc]);
    }

    templates
}

// -----------------------------------------------------------------------------
// Redis statefulset

fn redis_command(rf: &Redis) -> Vec<String> {
    if !rf.spec.redis.command.is_empty() {
        return rf.spec.redis.command.to_owned();
    }

    vec!["redis-server".into(), manifest::redis_config_writable_path()]
}

pub fn redis_stateful_set(rf: &Redis, owner_refs: &[OwnerReference], index: i32) -> StatefulSet {
    let name = manifest::redis_name(rf, index);
    let selector = manifest::redis_labels(rf);
    let labels = manifest::labels_with_statefulset_name(selector.to_owned(), &name);

    let data_volume_name = storage_volume_name(&rf.spec.redis.storage, REDIS_STORAGE_VOLUME_NAME);
    let log_volume_name =
        storage_volume_name(&rf.spec.redis.storage_log, REDIS_LOG_STORAGE_VOLUME_NAME);

    let mut volumes = vec![
        config_map_volume(
            REDIS_CONFIG_VOLUME_NAME,
            manifest::redis_config_map_name(rf, index),
            CONFIG_MAP_DEFAULT_MODE,
        ),
        config_map_volume(
            REDIS_READINESS_VOLUME_NAME,
            manifest::readiness_config_map_name(rf),
            READINESS_SCRIPT_MODE,
        ),
    ];
    volumes.extend(storage_volume(&rf.spec.redis.storage, REDIS_STORAGE_VOLUME_NAME));
    volumes.extend(storage_volume(
        &rf.spec.redis.storage_log,
        REDIS_LOG_STORAGE_VOLUME_NAME,
    ));

    let volume_mounts = vec![
        VolumeMount {
            name: REDIS_READINESS_VOLUME_NAME.into(),
            mount_path: "/redis-readiness".into(),
            ..Default::default()
        },
        VolumeMount {
            name: data_volume_name.to_owned(),
            mount_path: "/data".into(),
            ..Default::default()
        },
        VolumeMount {
            name: log_volume_name,
            mount_path: "/redislog".into(),
            ..Default::default()
        },
    ];

    let node_affinity = manifest::static_node_affinity(
        rf.spec
            .redis
            .static_resources
            .get(index as usize)
            .map(|resource| resource.host.as_str()),
    );
    let affinity = manifest::node_and_pod_affinity(
        &rf.spec.redis.affinity,
        rf.spec.redis.enabled_pod_anti_affinity,
        &selector,
        node_affinity,
    );

    let port = manifest::redis_port(rf, index);
    let port_number: i32 = port.parse().unwrap_or(manifest::REDIS_CONTAINER_PORT);
    let liveness_command = format!("redis-cli -p {} -h $(hostname) ping", port);
    let pull_policy = manifest::pull_policy(&rf.spec.redis.image_pull_policy);

    StatefulSet {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(manifest::rf_namespace(rf)),
            labels: Some(labels.to_owned()),
            owner_references: Some(owner_refs.to_vec()),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(1),
            update_strategy: Some(update_strategy(&rf.spec.redis.update_strategy)),
            pod_management_policy: Some("Parallel".into()),
            selector: LabelSelector {
                match_labels: Some(labels.to_owned()),
                ..Default::default()
            },
            service_name: Default::default(),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: rf.spec.redis.pod_annotations.to_owned(),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    affinity,
                    tolerations: rf.spec.redis.tolerations.to_owned(),
                    node_selector: rf.spec.redis.node_selector.to_owned(),
                    security_context: Some(manifest::security_context(
                        &rf.spec.redis.security_context,
                    )),
                    host_network: Some(rf.spec.redis.host_network),
                    dns_policy: Some(manifest::dns_policy(&rf.spec.redis.dns_policy)),
                    image_pull_secrets: Some(rf.spec.redis.image_pull_secrets.to_owned()),
                    priority_class_name: Some(rf.spec.redis.priority_class_name.to_owned()),
                    init_containers: Some(vec![config_copy_container(
                        REDIS_CONFIG_COPY_NAME,
                        &rf.spec.redis.image,
                        pull_policy.to_owned(),
                        REDIS_CONFIG_VOLUME_NAME,
                        &data_volume_name,
                        manifest::redis_config_path(),
                        manifest::redis_config_writable_path(),
                    )]),
                    containers: vec![Container {
                        name: manifest::REDIS_CONTAINER_NAME.into(),
                        image: Some(rf.spec.redis.image.to_owned()),
                        image_pull_policy: Some(pull_policy),
                        ports: Some(vec![ContainerPort {
                            name: Some(manifest::REDIS_CONTAINER_NAME.into()),
                            container_port: port_number,
                            protocol: Some("TCP".into()),
                            ..Default::default()
                        }]),
                        volume_mounts: Some(volume_mounts),
                        command: Some(redis_command(rf)),
                        readiness_probe: Some(exec_probe(vec![
                            "/bin/sh".into(),
                            "/redis-readiness/ready.sh".into(),
                        ])),
                        liveness_probe: Some(exec_probe(vec![
                            "sh".into(),
                            "-c".into(),
                            liveness_command,
                        ])),
                        resources: Some(rf.spec.redis.resources.to_owned()),
                        env: Some(timezone_env()),
                        ..Default::default()
                    }],
                    volumes: Some(volumes),
                    ..Default::default()
                }),
            },
            volume_claim_templates: volume_claim_templates(
                &rf.spec.redis.storage,
                &rf.spec.redis.storage_log,
                owner_refs,
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// carries the owned fields over to an already existing statefulset, only the
/// resources of the redis container belong to the operator
pub fn redis_stateful_set_from_existing(rf: &Redis, existing: &StatefulSet) -> StatefulSet {
    let mut desired = existing.to_owned();

    if let Some(spec) = desired.spec.as_mut() {
        if let Some(pod_spec) = spec.template.spec.as_mut() {
            pod_spec.containers = set_resources_by_container_name(
                manifest::REDIS_CONTAINER_NAME,
                &pod_spec.containers,
                &rf.spec.redis.resources,
            );
        }
    }

    desired
}

pub fn redis_stateful_sets_equal(desired: &StatefulSet, existing: &StatefulSet) -> bool {
    stateful_sets_equal(manifest::REDIS_CONTAINER_NAME, desired, existing)
}

// -----------------------------------------------------------------------------
// Sentinel statefulset

fn sentinel_command(rf: &Redis) -> Vec<String> {
    if !rf.spec.sentinel.command.is_empty() {
        return rf.spec.sentinel.command.to_owned();
    }

    vec![
        "redis-server".into(),
        manifest::sentinel_config_writable_path(),
        "--sentinel".into(),
    ]
}

pub fn sentinel_stateful_set(rf: &Redis, owner_refs: &[OwnerReference], index: i32) -> StatefulSet {
    let name = manifest::sentinel_name(rf, index);
    let selector = manifest::sentinel_labels(rf);
    let labels = manifest::labels_with_statefulset_name(selector.to_owned(), &name);

    let data_volume_name =
        storage_volume_name(&rf.spec.sentinel.storage, REDIS_STORAGE_VOLUME_NAME);
    let log_volume_name =
        storage_volume_name(&rf.spec.sentinel.storage_log, REDIS_LOG_STORAGE_VOLUME_NAME);

    let mut volumes = vec![config_map_volume(
        SENTINEL_CONFIG_VOLUME_NAME,
        manifest::sentinel_config_map_name(rf, index),
        CONFIG_MAP_DEFAULT_MODE,
    )];
    volumes.extend(storage_volume(
        &rf.spec.sentinel.storage,
        REDIS_STORAGE_VOLUME_NAME,
    ));
    volumes.extend(storage_volume(
        &rf.spec.sentinel.storage_log,
        REDIS_LOG_STORAGE_VOLUME_NAME,
    ));

    let volume_mounts = vec![
        VolumeMount {
            name: data_volume_name.to_owned(),
            mount_path: "/data".into(),
            ..Default::default()
        },
        VolumeMount {
            name: log_volume_name,
            mount_path: "/redislog".into(),
            ..Default::default()
        },
    ];

    let node_affinity = manifest::static_node_affinity(
        rf.spec
            .sentinel
            .static_resources
            .get(index as usize)
            .map(|resource| resource.host.as_str()),
    );
    let affinity = manifest::node_and_pod_affinity(
        &rf.spec.sentinel.affinity,
        rf.spec.sentinel.enabled_pod_anti_affinity,
        &selector,
        node_affinity,
    );

    let port = manifest::sentinel_port(rf, index);
    let port_number: i32 = port.parse().unwrap_or(manifest::SENTINEL_CONTAINER_PORT);
    let probe_command = format!("redis-cli -p {} -h $(hostname) ping", port);
    let pull_policy = manifest::pull_policy(&rf.spec.sentinel.image_pull_policy);

    StatefulSet {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(manifest::rf_namespace(rf)),
            labels: Some(labels.to_owned()),
            owner_references: Some(owner_refs.to_vec()),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(1),
            update_strategy: Some(update_strategy(&rf.spec.sentinel.update_strategy)),
            pod_management_policy: Some("Parallel".into()),
            selector: LabelSelector {
                match_labels: Some(labels.to_owned()),
                ..Default::default()
            },
            service_name: Default::default(),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: rf.spec.sentinel.pod_annotations.to_owned(),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    affinity,
                    tolerations: rf.spec.sentinel.tolerations.to_owned(),
                    node_selector: rf.spec.sentinel.node_selector.to_owned(),
                    security_context: Some(manifest::security_context(
                        &rf.spec.sentinel.security_context,
                    )),
                    host_network: Some(rf.spec.sentinel.host_network),
                    dns_policy: Some(manifest::dns_policy(&rf.spec.sentinel.dns_policy)),
                    image_pull_secrets: Some(rf.spec.sentinel.image_pull_secrets.to_owned()),
                    priority_class_name: Some(rf.spec.sentinel.priority_class_name.to_owned()),
                    init_containers: Some(vec![config_copy_container(
                        SENTINEL_CONFIG_COPY_NAME,
                        &rf.spec.sentinel.image,
                        pull_policy.to_owned(),
                        SENTINEL_CONFIG_VOLUME_NAME,
                        &data_volume_name,
                        manifest::sentinel_config_path(),
                        manifest::sentinel_config_writable_path(),
                    )]),
                    containers: vec![Container {
                        name: manifest::SENTINEL_CONTAINER_NAME.into(),
                        image: Some(rf.spec.sentinel.image.to_owned()),
                        image_pull_policy: Some(pull_policy),
                        ports: Some(vec![ContainerPort {
                            name: Some(manifest::SENTINEL_CONTAINER_NAME.into()),
                            container_port: port_number,
                            protocol: Some("TCP".into()),
                            ..Default::default()
                        }]),
                        volume_mounts: Some(volume_mounts),
                        command: Some(sentinel_command(rf)),
                        readiness_probe: Some(exec_probe(vec![
                            "sh".into(),
                            "-c".into(),
                            probe_command.to_owned(),
                        ])),
                        liveness_probe: Some(exec_probe(vec![
                            "sh".into(),
                            "-c".into(),
                            probe_command,
                        ])),
                        resources: Some(rf.spec.sentinel.resources.to_owned()),
                        env: Some(timezone_env()),
                        ..Default::default()
                    }],
                    volumes: Some(volumes),
                    ..Default::default()
                }),
            },
            volume_claim_templates: volume_claim_templates(
                &rf.spec.sentinel.storage,
                &rf.spec.sentinel.storage_log,
                owner_refs,
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn sentinel_stateful_set_from_existing(rf: &Redis, existing: &StatefulSet) -> StatefulSet {
    let mut desired = existing.to_owned();

    if let Some(spec) = desired.spec.as_mut() {
        if let Some(pod_spec) = spec.template.spec.as_mut() {
            pod_spec.containers = set_resources_by_container_name(
                manifest::SENTINEL_CONTAINER_NAME,
                &pod_spec.containers,
                &rf.spec.sentinel.resources,
            );
        }
    }

    desired
}

pub fn sentinel_stateful_sets_equal(desired: &StatefulSet, existing: &StatefulSet) -> bool {
    stateful_sets_equal(manifest::SENTINEL_CONTAINER_NAME, desired, existing)
}

fn stateful_sets_equal(container_name: &str, desired: &StatefulSet, existing: &StatefulSet) -> bool {
    let containers_of = |statefulset: &StatefulSet| {
        statefulset
            .spec
            .as_ref()
            .and_then(|spec| spec.template.spec.as_ref())
            .map(|pod_spec| pod_spec.containers.to_owned())
            .unwrap_or_default()
    };

    let desired_containers = containers_of(desired);
    let existing_containers = containers_of(existing);

    resources_equal(
        resources_by_container_name(container_name, &desired_containers),
        resources_by_container_name(container_name, &existing_containers),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::svc::crd::redis::{Spec, StaticResource};

    fn fixture() -> Redis {
        let mut rf = Redis::new("redis-sample", Spec::default());

        rf.metadata.namespace = Some("redis-system".into());
        rf.spec.redis.replicas = 3;
        rf.spec.redis.image = "redis:6.2".into();
        rf.spec.sentinel.replicas = 3;
        rf.spec.sentinel.image = "redis:6.2".into();
        rf
    }

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity("100m"), Some(100_000_000));
        assert_eq!(parse_quantity("0.1"), Some(100_000_000));
        assert_eq!(parse_quantity("1"), Some(1_000_000_000));
        assert_eq!(parse_quantity("1Gi"), Some(1_073_741_824_000_000_000));
        assert_eq!(parse_quantity("1G"), Some(1_000_000_000_000_000_000));
        assert_eq!(parse_quantity("1e3"), Some(1_000_000_000_000));
        assert_eq!(parse_quantity("128974848"), parse_quantity("123Mi"));
        assert_eq!(parse_quantity(""), None);
        assert_eq!(parse_quantity("garbage"), None);
    }

    #[test]
    fn test_quantities_equal() {
        assert!(quantities_equal(
            &Quantity("0.1".into()),
            &Quantity("100m".into())
        ));
        assert!(!quantities_equal(
            &Quantity("1Gi".into()),
            &Quantity("1G".into())
        ));
    }

    fn requirements(cpu: &str, memory: &str) -> ResourceRequirements {
        let mut list = BTreeMap::new();

        list.insert("cpu".to_string(), Quantity(cpu.into()));
        list.insert("memory".to_string(), Quantity(memory.into()));

        ResourceRequirements {
            limits: Some(list.to_owned()),
            requests: Some(list),
            ..Default::default()
        }
    }

    #[test]
    fn test_statefulset_equality_canonicalises_quantities() {
        let mut rf = fixture();

        rf.spec.redis.resources = requirements("0.1", "1Gi");

        let desired = redis_stateful_set(&rf, &[], 0);

        // the cluster canonicalised what the user wrote
        let mut existing = desired.to_owned();
        if let Some(spec) = existing.spec.as_mut() {
            if let Some(pod_spec) = spec.template.spec.as_mut() {
                pod_spec.containers =
                    set_resources_by_container_name("redis", &pod_spec.containers, &requirements("100m", "1073741824"));
            }
        }

        assert!(redis_stateful_sets_equal(&desired, &existing));

        let mut changed = existing.to_owned();
        if let Some(spec) = changed.spec.as_mut() {
            if let Some(pod_spec) = spec.template.spec.as_mut() {
                pod_spec.containers =
                    set_resources_by_container_name("redis", &pod_spec.containers, &requirements("200m", "1Gi"));
            }
        }

        assert!(!redis_stateful_sets_equal(&desired, &changed));
    }

    #[test]
    fn test_redis_stateful_set_shape() {
        let rf = fixture();
        let statefulset = redis_stateful_set(&rf, &[], 1);
        let spec = statefulset.spec.as_ref().unwrap();

        assert_eq!(
            statefulset.metadata.name.as_deref(),
            Some("redis-redis-sample-1")
        );
        assert_eq!(spec.replicas, Some(1));
        assert_eq!(spec.pod_management_policy.as_deref(), Some("Parallel"));

        let pod_spec = spec.template.spec.as_ref().unwrap();
        let init = &pod_spec.init_containers.as_ref().unwrap()[0];

        assert_eq!(init.name, "redis-config-copy");
        assert!(init.command.as_ref().unwrap()[2].contains("cp /redis/redis.conf /data/conf/redis.conf"));

        let container = &pod_spec.containers[0];
        assert_eq!(container.name, "redis");
        assert_eq!(
            container.command.as_ref().unwrap(),
            &vec!["redis-server".to_string(), "/data/conf/redis.conf".to_string()]
        );
        assert_eq!(
            container.readiness_probe.as_ref().unwrap().exec.as_ref().unwrap().command,
            Some(vec!["/bin/sh".to_string(), "/redis-readiness/ready.sh".to_string()])
        );
    }

    #[test]
    fn test_sentinel_stateful_set_shape() {
        let rf = fixture();
        let statefulset = sentinel_stateful_set(&rf, &[], 0);
        let pod_spec = statefulset
            .spec
            .as_ref()
            .unwrap()
            .template
            .spec
            .as_ref()
            .unwrap();
        let container = &pod_spec.containers[0];

        assert_eq!(container.name, "sentinel");
        assert_eq!(
            container.command.as_ref().unwrap(),
            &vec![
                "redis-server".to_string(),
                "/data/conf/sentinel.conf".to_string(),
                "--sentinel".to_string()
            ]
        );
        assert_eq!(container.ports.as_ref().unwrap()[0].container_port, 26379);
    }

    #[test]
    fn test_static_resources_pin_nodes_and_ports() {
        let mut rf = fixture();

        rf.spec.redis.replicas = 2;
        rf.spec.redis.host_network = true;
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

        let statefulset = redis_stateful_set(&rf, &[], 1);
        let pod_spec = statefulset
            .spec
            .as_ref()
            .unwrap()
            .template
            .spec
            .as_ref()
            .unwrap();

        assert_eq!(pod_spec.host_network, Some(true));
        assert_eq!(pod_spec.containers[0].ports.as_ref().unwrap()[0].container_port, 7002);

        let node_affinity = pod_spec
            .affinity
            .as_ref()
            .unwrap()
            .node_affinity
            .as_ref()
            .unwrap();
        let term = &node_affinity
            .required_during_scheduling_ignored_during_execution
            .as_ref()
            .unwrap()
            .node_selector_terms[0];

        assert_eq!(
            term.match_expressions.as_ref().unwrap()[0].values,
            Some(vec!["h2".to_string()])
        );
    }
}
