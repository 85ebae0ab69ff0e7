//! # Service manifests
//!
//! This module build the sentinel cluster-ip service and the per-replica
//! headless services giving each process a stable network identity

use k8s_openapi::{
    api::core::v1::{Service, ServicePort, ServiceSpec},
    apimachinery::pkg::{
        apis::meta::v1::{ObjectMeta, OwnerReference},
        util::intstr::IntOrString,
    },
};

use crate::svc::{crd::redis::Redis, manifest};

pub fn sentinel_service(rf: &Redis, owner_refs: &[OwnerReference]) -> Service {
    let labels = manifest::sentinel_labels(rf);

    Service {
        metadata: ObjectMeta {
            name: Some(manifest::sentinel_service_name(rf)),
            namespace: Some(manifest::rf_namespace(rf)),
            labels: Some(labels.to_owned()),
            owner_references: Some(owner_refs.to_vec()),
            annotations: rf.spec.sentinel.service.service_annotations.to_owned(),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(labels),
            ports: Some(vec![ServicePort {
                name: Some(manifest::SENTINEL_CONTAINER_NAME.into()),
                port: manifest::SENTINEL_CONTAINER_PORT,
                target_port: Some(IntOrString::Int(manifest::SENTINEL_CONTAINER_PORT)),
                protocol: Some("TCP".into()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn headless_service(
    name: String,
    namespace: String,
    labels: std::collections::BTreeMap<String, String>,
    selector: std::collections::BTreeMap<String, String>,
    port_name: &str,
    port: i32,
    owner_refs: &[OwnerReference],
) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace),
            labels: Some(labels),
            owner_references: Some(owner_refs.to_vec()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(selector),
            type_: Some("ClusterIP".into()),
            cluster_ip: Some("None".into()),
            ports: Some(vec![ServicePort {
                name: Some(port_name.into()),
                port,
                target_port: Some(IntOrString::Int(port)),
                protocol: Some("TCP".into()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn redis_headless_service(rf: &Redis, owner_refs: &[OwnerReference], index: i32) -> Service {
    let port: i32 = manifest::redis_port(rf, index)
        .parse()
        .unwrap_or(manifest::REDIS_CONTAINER_PORT);

    headless_service(
        manifest::redis_headless_service_name(rf, index),
        manifest::rf_namespace(rf),
        manifest::redis_labels(rf),
        manifest::statefulset_pod_selector(&manifest::redis_name(rf, index)),
        manifest::REDIS_CONTAINER_NAME,
        port,
        owner_refs,
    )
}

pub fn sentinel_headless_service(rf: &Redis, owner_refs: &[OwnerReference], index: i32) -> Service {
    let port: i32 = manifest::sentinel_port(rf, index)
        .parse()
        .unwrap_or(manifest::SENTINEL_CONTAINER_PORT);

    headless_service(
        manifest::sentinel_headless_service_name(rf, index),
        manifest::rf_namespace(rf),
        manifest::sentinel_labels(rf),
        manifest::statefulset_pod_selector(&manifest::sentinel_name(rf, index)),
        manifest::SENTINEL_CONTAINER_NAME,
        port,
        owner_refs,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::svc::crd::redis::Spec;

    fn fixture() -> Redis {
        let mut rf = Redis::new("redis-sample", Spec::default());

        rf.metadata.namespace = Some("redis-system".into());
        rf
    }

    #[test]
    fn test_sentinel_service() {
        let service = sentinel_service(&fixture(), &[]);
        let spec = service.spec.unwrap();

        assert_eq!(service.metadata.name.as_deref(), Some("sentinel-redis-sample"));
        assert_eq!(spec.ports.unwrap()[0].port, 26379);
        assert!(spec.cluster_ip.is_none());
    }

    #[test]
    fn test_headless_services() {
        let service = redis_headless_service(&fixture(), &[], 0);
        let spec = service.spec.unwrap();

        assert_eq!(
            service.metadata.name.as_deref(),
            Some("headless-redis-redis-sample-0")
        );
        assert_eq!(spec.cluster_ip.as_deref(), Some("None"));
        assert_eq!(
            spec.selector.unwrap().get("statefulset.kubernetes.io/pod-name").unwrap(),
            "redis-redis-sample-0-0"
        );

        let service = sentinel_headless_service(&fixture(), &[], 2);
        assert_eq!(
            service.metadata.name.as_deref(),
            Some("headless-sentinel-redis-sample-2")
        );
    }
}
