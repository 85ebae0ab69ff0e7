//! # Manifest module
//!
//! This module provide the naming scheme, labels and shared builders for every
//! child object managed by the operator. Other tooling relies on the generated
//! names, so they are covered by tests and must not change.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Affinity, NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm, Pod,
    PodAffinityTerm, PodAntiAffinity, PodSecurityContext,
};

use crate::svc::crd::redis::{PodState, Redis};

pub mod configmap;
pub mod deployment;
pub mod service;
pub mod statefulset;

// -----------------------------------------------------------------------------
// Constants

pub const REDIS_FINALIZER: &str = "redis.component.zhizuqiu/finalizer";

pub const REDIS_GROUP_NAME: &str = "mymaster";

pub const REDIS_ROOT_NAME: &str = "redis";
pub const REDIS_CONTAINER_NAME: &str = "redis";
pub const REDIS_READINESS_NAME: &str = "redis-readiness";
pub const REDIS_CONTAINER_PORT: i32 = 6379;
pub const REDIS_CONFIG_FILE_NAME: &str = "redis.conf";

pub const SENTINEL_ROOT_NAME: &str = "sentinel";
pub const SENTINEL_CONTAINER_NAME: &str = "sentinel";
pub const SENTINEL_CONTAINER_PORT: i32 = 26379;
pub const SENTINEL_CONFIG_FILE_NAME: &str = "sentinel.conf";

pub const EXPORTER_ROOT_NAME: &str = "exporter";
pub const EXPORTER_CONTAINER_NAME: &str = "exporter";
pub const EXPORTER_CONTAINER_PORT: i32 = 9121;

pub const HEADLESS_SERVICE_BASE_NAME: &str = "headless";

const CONF_WRITABLE_MOUNT_PATH: &str = "/data/conf";
const CONF_MOUNT_PATH: &str = "/redis";

const APP_LABEL: &str = "redis-sentinel";
const HOSTNAME_TOPOLOGY_KEY: &str = "kubernetes.io/hostname";

const APP_NAME_LABEL_KEY: &str = "app.kubernetes.io/name";
const APP_COMPONENT_LABEL_KEY: &str = "app.kubernetes.io/component";
const APP_PART_OF_LABEL_KEY: &str = "app.kubernetes.io/part-of";
const STATEFULSET_NAME_LABEL_KEY: &str = "app.kubernetes.io/statefulset";
const STATEFULSET_POD_LABEL_KEY: &str = "statefulset.kubernetes.io/pod-name";

pub(crate) const GRACE_TIME: i32 = 30;
pub(crate) const DEFAULT_PERIOD_SECONDS: i32 = 10;
pub(crate) const DEFAULT_SUCCESS_THRESHOLD: i32 = 1;
pub(crate) const DEFAULT_FAILURE_THRESHOLD: i32 = 3;

// -----------------------------------------------------------------------------
// Paths helpers

pub fn redis_config_writable_path() -> String {
    format!("{}/{}", CONF_WRITABLE_MOUNT_PATH, REDIS_CONFIG_FILE_NAME)
}

pub fn redis_config_path() -> String {
    format!("{}/{}", CONF_MOUNT_PATH, REDIS_CONFIG_FILE_NAME)
}

pub fn sentinel_config_writable_path() -> String {
    format!("{}/{}", CONF_WRITABLE_MOUNT_PATH, SENTINEL_CONFIG_FILE_NAME)
}

pub fn sentinel_config_path() -> String {
    format!("{}/{}", CONF_MOUNT_PATH, SENTINEL_CONFIG_FILE_NAME)
}

pub(crate) fn conf_writable_mount_path() -> &'static str {
    CONF_WRITABLE_MOUNT_PATH
}

pub(crate) fn conf_mount_path() -> &'static str {
    CONF_MOUNT_PATH
}

// -----------------------------------------------------------------------------
// Naming helpers

fn generate_name(type_name: &str, meta_name: &str) -> String {
    format!("{}-{}", type_name, meta_name)
}

/// returns the name of the custom resource.
///
/// # Panic
///
/// panic if the name is null which could not happen on an admitted resource
pub fn rf_name(rf: &Redis) -> String {
    rf.metadata
        .name
        .to_owned()
        .expect("custom resource to have a name")
}

/// returns the namespace of the custom resource.
///
/// # Panic
///
/// panic if the namespace is null which could not happen on a namespaced
/// resource
pub fn rf_namespace(rf: &Redis) -> String {
    rf.metadata
        .namespace
        .to_owned()
        .expect("custom resource to be owned by a namespace")
}

pub fn redis_root_name(rf: &Redis) -> String {
    generate_name(REDIS_ROOT_NAME, &rf_name(rf))
}

pub fn redis_name(rf: &Redis, index: i32) -> String {
    format!("{}-{}", redis_root_name(rf), index)
}

pub fn sentinel_root_name(rf: &Redis) -> String {
    generate_name(SENTINEL_ROOT_NAME, &rf_name(rf))
}

pub fn sentinel_name(rf: &Redis, index: i32) -> String {
    format!("{}-{}", sentinel_root_name(rf), index)
}

pub fn exporter_root_name(rf: &Redis) -> String {
    generate_name(EXPORTER_ROOT_NAME, &rf_name(rf))
}

pub fn readiness_config_map_name(rf: &Redis) -> String {
    generate_name(REDIS_READINESS_NAME, &rf_name(rf))
}

pub fn redis_config_map_name(rf: &Redis, index: i32) -> String {
    redis_name(rf, index)
}

pub fn sentinel_config_map_name(rf: &Redis, index: i32) -> String {
    sentinel_name(rf, index)
}

pub fn sentinel_service_name(rf: &Redis) -> String {
    sentinel_root_name(rf)
}

pub fn redis_headless_service_name(rf: &Redis, index: i32) -> String {
    format!("{}-{}", HEADLESS_SERVICE_BASE_NAME, redis_name(rf, index))
}

pub fn sentinel_headless_service_name(rf: &Redis, index: i32) -> String {
    format!("{}-{}", HEADLESS_SERVICE_BASE_NAME, sentinel_name(rf, index))
}

// -----------------------------------------------------------------------------
// Labels helpers

/// merges all the label maps received as argument into a single new label map
pub fn merge_labels(all: &[&BTreeMap<String, String>]) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    for map in all {
        for (k, v) in map.iter() {
            labels.insert(k.to_owned(), v.to_owned());
        }
    }

    labels
}

/// returns the selector labels of the given component, merged with the labels
/// carried by the custom resource itself
pub fn selector_labels(component: &str, rf: &Redis) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();

    labels.insert(APP_NAME_LABEL_KEY.into(), rf_name(rf));
    labels.insert(APP_COMPONENT_LABEL_KEY.into(), component.into());
    labels.insert(APP_PART_OF_LABEL_KEY.into(), APP_LABEL.into());

    if let Some(user) = &rf.metadata.labels {
        merge_labels(&[&labels, user])
    } else {
        labels
    }
}

/// returns the labels selecting every pod of the instance, whatever the
/// component
pub fn instance_labels(name: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();

    labels.insert(APP_NAME_LABEL_KEY.into(), name.into());
    labels.insert(APP_PART_OF_LABEL_KEY.into(), APP_LABEL.into());
    labels
}

pub fn redis_labels(rf: &Redis) -> BTreeMap<String, String> {
    selector_labels(REDIS_ROOT_NAME, rf)
}

pub fn sentinel_labels(rf: &Redis) -> BTreeMap<String, String> {
    selector_labels(SENTINEL_ROOT_NAME, rf)
}

pub fn exporter_labels(rf: &Redis) -> BTreeMap<String, String> {
    selector_labels(EXPORTER_ROOT_NAME, rf)
}

pub fn readiness_config_map_labels(rf: &Redis) -> BTreeMap<String, String> {
    selector_labels(REDIS_ROOT_NAME, rf)
}

pub(crate) fn labels_with_statefulset_name(
    mut labels: BTreeMap<String, String>,
    name: &str,
) -> BTreeMap<String, String> {
    labels.insert(STATEFULSET_NAME_LABEL_KEY.into(), name.into());
    labels
}

pub(crate) fn statefulset_pod_selector(statefulset_name: &str) -> BTreeMap<String, String> {
    let mut selector = BTreeMap::new();

    selector.insert(
        STATEFULSET_POD_LABEL_KEY.into(),
        format!("{}-0", statefulset_name),
    );
    selector
}

// -----------------------------------------------------------------------------
// Topology helpers

/// returns the minimum number of sentinels that must agree to trigger a
/// failover
pub fn quorum(rf: &Redis) -> i32 {
    rf.spec.sentinel.replicas / 2 + 1
}

/// returns the ip and port the replicas and sentinels are initially pointed
/// at, which is the first static resource when defined or the loopback
/// placeholder rewritten by the first reconcile otherwise
pub fn master_ip_and_port(rf: &Redis) -> (String, String) {
    match rf.spec.redis.static_resources.first() {
        Some(resource) => (resource.host.to_owned(), resource.port.to_string()),
        None => ("127.0.0.1".into(), REDIS_CONTAINER_PORT.to_string()),
    }
}

pub fn redis_port(rf: &Redis, index: i32) -> String {
    match rf.spec.redis.static_resources.get(index as usize) {
        Some(resource) => resource.port.to_string(),
        None => REDIS_CONTAINER_PORT.to_string(),
    }
}

pub fn sentinel_port(rf: &Redis, index: i32) -> String {
    match rf.spec.sentinel.static_resources.get(index as usize) {
        Some(resource) => resource.port.to_string(),
        None => SENTINEL_CONTAINER_PORT.to_string(),
    }
}

pub fn exporter_port(rf: &Redis) -> String {
    if rf.spec.exporter.static_resource.port != 0 {
        return rf.spec.exporter.static_resource.port.to_string();
    }

    EXPORTER_CONTAINER_PORT.to_string()
}

pub fn redis_host(rf: &Redis, index: i32) -> String {
    match rf.spec.redis.static_resources.get(index as usize) {
        Some(resource) => resource.host.to_owned(),
        None => redis_headless_service_name(rf, index),
    }
}

pub fn sentinel_host(rf: &Redis, index: i32) -> String {
    match rf.spec.sentinel.static_resources.get(index as usize) {
        Some(resource) => resource.host.to_owned(),
        None => sentinel_headless_service_name(rf, index),
    }
}

/// returns whether sentinel can perform a failover on its own. Host-network
/// deployments pin replicas to static hosts and ports, there is nothing
/// sentinel could promote elsewhere.
pub fn needs_auto_failover(rf: &Redis) -> bool {
    !rf.spec.redis.host_network || !rf.spec.sentinel.host_network
}

// -----------------------------------------------------------------------------
// Pod state helpers

pub fn role_from_labels(pod: &Pod) -> String {
    let labels = match &pod.metadata.labels {
        Some(labels) => labels,
        None => return "unknown".into(),
    };

    match labels.get(APP_COMPONENT_LABEL_KEY) {
        Some(component) => component.to_owned(),
        None => "unknown".into(),
    }
}

pub fn container_name_from_labels(pod: &Pod) -> String {
    match role_from_labels(pod).as_str() {
        REDIS_ROOT_NAME => REDIS_CONTAINER_NAME.into(),
        SENTINEL_ROOT_NAME => SENTINEL_CONTAINER_NAME.into(),
        EXPORTER_ROOT_NAME => EXPORTER_CONTAINER_NAME.into(),
        other => other.into(),
    }
}

fn container_port(pod: &Pod, container_name: &str, port_name: &str) -> i32 {
    let spec = match &pod.spec {
        Some(spec) => spec,
        None => return 0,
    };

    for container in &spec.containers {
        if container.name != container_name {
            continue;
        }

        if let Some(ports) = &container.ports {
            for port in ports {
                if port.name.as_deref() == Some(port_name) {
                    return port.container_port;
                }
            }
        }
    }

    0
}

pub fn pod_port(pod: &Pod) -> i32 {
    match role_from_labels(pod).as_str() {
        REDIS_ROOT_NAME => container_port(pod, REDIS_CONTAINER_NAME, REDIS_CONTAINER_NAME),
        SENTINEL_ROOT_NAME => container_port(pod, SENTINEL_CONTAINER_NAME, SENTINEL_CONTAINER_NAME),
        EXPORTER_ROOT_NAME => container_port(pod, EXPORTER_CONTAINER_NAME, EXPORTER_CONTAINER_NAME),
        _ => 0,
    }
}

/// computes the per-pod observed state recorded on the custom resource status
pub fn pod_states(pods: &[Pod]) -> BTreeMap<String, PodState> {
    let mut states = BTreeMap::new();

    for pod in pods {
        let name = pod.metadata.name.to_owned().unwrap_or_default();
        let status = pod.status.to_owned().unwrap_or_default();

        states.insert(
            name.to_owned(),
            PodState {
                name,
                role: role_from_labels(pod),
                phase: status.phase.unwrap_or_default(),
                host_ip: status.host_ip.unwrap_or_default(),
                pod_ip: status.pod_ip.unwrap_or_default(),
                container_port: pod_port(pod),
                pod_ips: status.pod_ips.unwrap_or_default(),
                start_time: status.start_time,
            },
        );
    }

    states
}

fn expected_pod_count(rf: &Redis) -> usize {
    let mut count = (rf.spec.redis.replicas + rf.spec.sentinel.replicas) as usize;
    if rf.spec.exporter.enabled {
        count += 1;
    }

    count
}

/// computes the aggregated phase of the instance, `Running` only when every
/// expected pod is present and running
pub fn global_phase(rf: &Redis, pods: &[Pod]) -> String {
    if pods.len() != expected_pod_count(rf) {
        return "Pending".into();
    }

    for pod in pods {
        let phase = pod
            .status
            .as_ref()
            .and_then(|status| status.phase.to_owned());
        if phase.as_deref() != Some("Running") {
            return "Pending".into();
        }
    }

    "Running".into()
}

/// computes the aggregated readiness of the instance from the tracked
/// container of every expected pod
pub fn global_ready(rf: &Redis, pods: &[Pod]) -> bool {
    if pods.len() != expected_pod_count(rf) {
        return false;
    }

    for pod in pods {
        let container_name = container_name_from_labels(pod);
        let ready = pod
            .status
            .as_ref()
            .and_then(|status| status.container_statuses.as_ref())
            .and_then(|statuses| {
                statuses
                    .iter()
                    .find(|status| status.name == container_name)
                    .map(|status| status.ready)
            });

        if ready != Some(true) {
            return false;
        }
    }

    true
}

// -----------------------------------------------------------------------------
// Pod spec helpers

pub(crate) fn dns_policy(policy: &Option<String>) -> String {
    match policy {
        Some(policy) if !policy.is_empty() => policy.to_owned(),
        _ => "ClusterFirst".into(),
    }
}

pub(crate) fn pull_policy(policy: &Option<String>) -> String {
    match policy {
        Some(policy) if !policy.is_empty() => policy.to_owned(),
        _ => "IfNotPresent".into(),
    }
}

pub(crate) fn security_context(secctx: &Option<PodSecurityContext>) -> PodSecurityContext {
    if let Some(secctx) = secctx {
        return secctx.to_owned();
    }

    PodSecurityContext {
        run_as_user: Some(1000),
        run_as_group: Some(1000),
        run_as_non_root: Some(true),
        fs_group: Some(1000),
        ..Default::default()
    }
}

fn hostname_pod_affinity_term(labels: &BTreeMap<String, String>) -> PodAffinityTerm {
    PodAffinityTerm {
        topology_key: HOSTNAME_TOPOLOGY_KEY.into(),
        label_selector: Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector {
            match_labels: Some(labels.to_owned()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn static_node_affinity(host: Option<&str>) -> Option<NodeAffinity> {
    let host = host?;

    Some(NodeAffinity {
        required_during_scheduling_ignored_during_execution: Some(NodeSelector {
            node_selector_terms: vec![NodeSelectorTerm {
                match_expressions: Some(vec![NodeSelectorRequirement {
                    key: HOSTNAME_TOPOLOGY_KEY.into(),
                    operator: "In".into(),
                    values: Some(vec![host.into()]),
                }]),
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// combines the user supplied affinity with the hostname anti-affinity term
/// and the static-resource node pinning
pub(crate) fn node_and_pod_affinity(
    affinity: &Option<Affinity>,
    enabled_pod_anti_affinity: bool,
    labels: &BTreeMap<String, String>,
    node_affinity: Option<NodeAffinity>,
) -> Option<Affinity> {
    let mut aff = affinity.to_owned();

    if enabled_pod_anti_affinity {
        let term = hostname_pod_affinity_term(labels);
        let aff = aff.get_or_insert_with(Affinity::default);
        let anti = aff
            .pod_anti_affinity
            .get_or_insert_with(PodAntiAffinity::default);
        let terms = anti
            .required_during_scheduling_ignored_during_execution
            .get_or_insert_with(Vec::new);

        if !terms.iter().any(|t| *t == term) {
            terms.push(term);
        }
    }

    if let Some(node_affinity) = node_affinity {
        aff.get_or_insert_with(Affinity::default).node_affinity = Some(node_affinity);
    }

    aff
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{Container, ContainerPort, PodSpec, PodStatus};

    use super::*;
    use crate::svc::crd::redis::{Spec, StaticResource};

    fn fixture() -> Redis {
        let mut rf = Redis::new("redis-sample", Spec::default());

        rf.metadata.namespace = Some("redis-system".into());
        rf
    }

    #[test]
    fn test_names() {
        let rf = fixture();

        assert_eq!(redis_name(&rf, 0), "redis-redis-sample-0");
        assert_eq!(sentinel_name(&rf, 0), "sentinel-redis-sample-0");
        assert_eq!(
            readiness_config_map_name(&rf),
            "redis-readiness-redis-sample"
        );
        assert_eq!(exporter_root_name(&rf), "exporter-redis-sample");
        assert_eq!(sentinel_service_name(&rf), "sentinel-redis-sample");
        assert_eq!(
            redis_headless_service_name(&rf, 2),
            "headless-redis-redis-sample-2"
        );
        assert_eq!(
            sentinel_headless_service_name(&rf, 1),
            "headless-sentinel-redis-sample-1"
        );
    }

    #[test]
    fn test_paths() {
        assert_eq!(redis_config_writable_path(), "/data/conf/redis.conf");
        assert_eq!(redis_config_path(), "/redis/redis.conf");
        assert_eq!(sentinel_config_writable_path(), "/data/conf/sentinel.conf");
        assert_eq!(sentinel_config_path(), "/redis/sentinel.conf");
    }

    #[test]
    fn test_quorum() {
        let mut rf = fixture();

        rf.spec.sentinel.replicas = 3;
        assert_eq!(quorum(&rf), 2);

        rf.spec.sentinel.replicas = 5;
        assert_eq!(quorum(&rf), 3);

        rf.spec.sentinel.replicas = 4;
        assert_eq!(quorum(&rf), 3);
    }

    #[test]
    fn test_selector_labels_merge_user_labels() {
        let mut rf = fixture();
        let mut user = BTreeMap::new();

        user.insert("instance_id".to_string(), "6dc60b61".to_string());
        rf.metadata.labels = Some(user);

        let labels = redis_labels(&rf);

        assert_eq!(labels.get("app.kubernetes.io/name").unwrap(), "redis-sample");
        assert_eq!(labels.get("app.kubernetes.io/component").unwrap(), "redis");
        assert_eq!(
            labels.get("app.kubernetes.io/part-of").unwrap(),
            "redis-sentinel"
        );
        assert_eq!(labels.get("instance_id").unwrap(), "6dc60b61");
    }

    #[test]
    fn test_master_ip_and_port() {
        let mut rf = fixture();

        assert_eq!(
            master_ip_and_port(&rf),
            ("127.0.0.1".to_string(), "6379".to_string())
        );

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

        assert_eq!(master_ip_and_port(&rf), ("h1".to_string(), "7001".to_string()));
        assert_eq!(redis_port(&rf, 1), "7002");
        assert_eq!(redis_host(&rf, 1), "h2");
        assert_eq!(redis_port(&rf, 2), "6379");
    }

    #[test]
    fn test_needs_auto_failover() {
        let mut rf = fixture();

        assert!(needs_auto_failover(&rf));

        rf.spec.redis.host_network = true;
        assert!(needs_auto_failover(&rf));

        rf.spec.sentinel.host_network = true;
        assert!(!needs_auto_failover(&rf));
    }

    fn running_pod(name: &str, component: &str, ready: bool) -> Pod {
        let mut labels = BTreeMap::new();

        labels.insert("app.kubernetes.io/component".to_string(), component.to_string());

        let container_name = match component {
            "redis" => "redis",
            "sentinel" => "sentinel",
            _ => "exporter",
        };

        Pod {
            metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                name: Some(name.into()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: container_name.into(),
                    ports: Some(vec![ContainerPort {
                        name: Some(container_name.into()),
                        container_port: 6379,
                        ..Default::default()
                    }]),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some("Running".into()),
                pod_ip: Some("10.0.0.1".into()),
                container_statuses: Some(vec![k8s_openapi::api::core::v1::ContainerStatus {
                    name: container_name.into(),
                    ready,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_pod_states() {
        let pods = vec![running_pod("redis-redis-sample-0", "redis", true)];
        let states = pod_states(&pods);
        let state = states.get("redis-redis-sample-0").unwrap();

        assert_eq!(state.role, "redis");
        assert_eq!(state.phase, "Running");
        assert_eq!(state.pod_ip, "10.0.0.1");
        assert_eq!(state.container_port, 6379);
    }

    #[test]
    fn test_global_phase_and_ready() {
        let mut rf = fixture();

        rf.spec.redis.replicas = 1;
        rf.spec.sentinel.replicas = 1;

        let pods = vec![
            running_pod("redis-redis-sample-0", "redis", true),
            running_pod("sentinel-redis-sample-0", "sentinel", true),
        ];

        assert_eq!(global_phase(&rf, &pods), "Running");
        assert!(global_ready(&rf, &pods));

        let partial = vec![running_pod("redis-redis-sample-0", "redis", true)];
        assert_eq!(global_phase(&rf, &partial), "Pending");
        assert!(!global_ready(&rf, &partial));

        let unready = vec![
            running_pod("redis-redis-sample-0", "redis", false),
            running_pod("sentinel-redis-sample-0", "sentinel", true),
        ];
        assert!(!global_ready(&rf, &unready));
    }
}
