//! # Checker module
//!
//! This module provide the read-only audits ran against the live cluster.
//! Every predicate only considers pods in phase `Running` without a deletion
//! timestamp, probes against a pod that went away surface as transport
//! errors.

use std::{collections::BTreeMap, sync::Arc};

use chrono::{Duration, Utc};
use k8s_openapi::api::core::v1::Pod;
use tracing::info;

use crate::svc::{
    k8s::store::{self, Store},
    manifest,
    ops::{element::Element, Error},
    redis::{Endpoint, RedisClient},
};

// -----------------------------------------------------------------------------
// Checker structure

pub struct Checker {
    store: Store,
    client: Arc<dyn RedisClient>,
}

impl Checker {
    pub fn new(store: Store, client: Arc<dyn RedisClient>) -> Self {
        Self { store, client }
    }

    // -------------------------------------------------------------------------
    // Pod discovery

    async fn running_endpoints(
        &self,
        el: &Element,
        labels: &BTreeMap<String, String>,
        container: &str,
    ) -> Result<Vec<Endpoint>, Error> {
        let pods = self.store.list_pods(el.namespace(), labels).await?;

        Ok(pods
            .iter()
            .filter(|pod| is_running(pod))
            .map(|pod| {
                Endpoint::new(
                    pod.metadata.namespace.as_deref().unwrap_or_default(),
                    pod.metadata.name.as_deref().unwrap_or_default(),
                    container,
                    pod.status
                        .as_ref()
                        .and_then(|status| status.pod_ip.as_deref())
                        .unwrap_or_default(),
                )
            })
            .collect())
    }

    /// returns the running redis processes
    pub async fn redis_endpoints(&self, el: &Element) -> Result<Vec<Endpoint>, Error> {
        self.running_endpoints(
            el,
            &manifest::redis_labels(el.redis()),
            manifest::REDIS_CONTAINER_NAME,
        )
        .await
    }

    /// returns the running sentinel processes
    pub async fn sentinel_endpoints(&self, el: &Element) -> Result<Vec<Endpoint>, Error> {
        self.running_endpoints(
            el,
            &manifest::sentinel_labels(el.redis()),
            manifest::SENTINEL_CONTAINER_NAME,
        )
        .await
    }

    // -------------------------------------------------------------------------
    // Workload audits

    /// verifies one statefulset exists for every declared redis replica
    pub async fn check_redis_number(&self, el: &Element) -> Result<(), Error> {
        let statefulsets = self
            .store
            .list_stateful_sets(el.namespace(), &manifest::redis_labels(el.redis()))
            .await?;

        for index in 0..el.redis().spec.redis.replicas {
            let name = manifest::redis_name(el.redis(), index);
            if store::search_stateful_set_by_name(&name, &statefulsets).is_none() {
                return Err(Error::RedisNumberMismatch);
            }
        }

        Ok(())
    }

    /// verifies one statefulset exists for every declared sentinel replica
    pub async fn check_sentinel_number(&self, el: &Element) -> Result<(), Error> {
        let statefulsets = self
            .store
            .list_stateful_sets(el.namespace(), &manifest::sentinel_labels(el.redis()))
            .await?;

        for index in 0..el.redis().spec.sentinel.replicas {
            let name = manifest::sentinel_name(el.redis(), index);
            if store::search_stateful_set_by_name(&name, &statefulsets).is_none() {
                return Err(Error::SentinelNumberMismatch);
            }
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Data plane audits

    /// counts the processes currently advertising themselves as master. The
    /// probe addresses the expected pod of every declared replica whatever
    /// its phase, a down pod surfaces as a transport error.
    pub async fn number_of_masters(&self, el: &Element) -> Result<usize, Error> {
        let mut masters = 0;

        for index in 0..el.redis().spec.redis.replicas {
            let target = Endpoint::new(
                el.namespace(),
                &format!("{}-0", manifest::redis_name(el.redis(), index)),
                manifest::REDIS_CONTAINER_NAME,
                "",
            );

            let password = self.client.redis_password(&target).await?;
            if self.client.is_master(&target, &password).await? {
                masters += 1;
            }
        }

        Ok(masters)
    }

    /// returns the unique running process advertising itself as master
    pub async fn master_endpoint(&self, el: &Element) -> Result<Endpoint, Error> {
        let mut masters = vec![];

        for target in self.redis_endpoints(el).await? {
            let password = self.client.redis_password(&target).await?;
            if self.client.is_master(&target, &password).await? {
                masters.push(target);
            }
        }

        if masters.len() != 1 {
            return Err(Error::MasterNotUnique(masters.len()));
        }

        Ok(masters.remove(0))
    }

    /// verifies every running replica reports the given master as its
    /// replication source
    pub async fn check_all_slaves_from_master(
        &self,
        master: &Endpoint,
        el: &Element,
    ) -> Result<(), Error> {
        for target in self.redis_endpoints(el).await? {
            let password = self.client.redis_password(&target).await?;
            let master_host = self.client.slave_master_host(&target, &password).await?;

            if let Some(host) = master_host {
                if host != master.ip {
                    return Err(Error::SlaveOfWrongMaster {
                        slave: target.name,
                        expected: master.ip.to_owned(),
                        actual: host,
                    });
                }
            }
        }

        Ok(())
    }

    /// verifies the sentinel keeps as many sentinels in memory as the spec
    /// declares
    pub async fn check_sentinel_number_in_memory(
        &self,
        sentinel: &Endpoint,
        el: &Element,
    ) -> Result<(), Error> {
        let sentinels = self.client.sentinels_in_memory(sentinel).await?;

        if sentinels != el.redis().spec.sentinel.replicas {
            return Err(Error::SentinelMemoryMismatch);
        }

        Ok(())
    }

    /// verifies the sentinel keeps as many replicas in memory as the spec
    /// declares
    pub async fn check_sentinel_slaves_number_in_memory(
        &self,
        sentinel: &Endpoint,
        el: &Element,
    ) -> Result<(), Error> {
        let slaves = self.client.sentinel_slaves_in_memory(sentinel).await?;

        if slaves != el.redis().spec.redis.replicas - 1 {
            return Err(Error::SentinelSlavesMemoryMismatch);
        }

        Ok(())
    }

    /// verifies the sentinel monitors the expected master address
    pub async fn check_sentinel_monitor(
        &self,
        sentinel: &Endpoint,
        monitor_ip: &str,
        monitor_port: Option<&str>,
    ) -> Result<(), Error> {
        let (actual_ip, actual_port) = self.client.sentinel_monitor_target(sentinel).await?;

        if actual_ip != monitor_ip {
            return Err(Error::WrongMonitor);
        }

        if let Some(port) = monitor_port {
            if port != actual_port {
                return Err(Error::WrongMonitor);
            }
        }

        Ok(())
    }

    /// returns the age of the youngest running redis pod, the failover grace
    /// heuristic
    pub async fn minimum_redis_pod_time(&self, el: &Element) -> Result<Duration, Error> {
        // more than ten years
        let mut min_time = Duration::hours(100_000);

        let pods = self
            .store
            .list_pods(el.namespace(), &manifest::redis_labels(el.redis()))
            .await?;

        for pod in &pods {
            let start_time = match pod.status.as_ref().and_then(|status| status.start_time.as_ref())
            {
                Some(time) => time,
                None => continue,
            };

            let alive = Utc::now().signed_duration_since(start_time.0);

            info!(
                namespace = el.namespace(),
                name = el.name(),
                pod = pod.metadata.name.as_deref().unwrap_or_default(),
                seconds = alive.num_seconds(),
                "Pod has been alive"
            );

            if alive < min_time {
                min_time = alive;
            }
        }

        Ok(min_time)
    }
}

// -----------------------------------------------------------------------------
// Helpers

pub(crate) fn is_running(pod: &Pod) -> bool {
    let running = pod
        .status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        == Some("Running");

    running && pod.metadata.deletion_timestamp.is_none()
}

#[cfg(test)]
mod tests {
    use k8s_openapi::{
        api::core::v1::PodStatus,
        apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time},
    };

    use super::*;

    #[test]
    fn test_is_running() {
        let mut pod = Pod {
            metadata: ObjectMeta::default(),
            spec: None,
            status: Some(PodStatus {
                phase: Some("Running".into()),
                ..Default::default()
            }),
        };

        assert!(is_running(&pod));

        pod.metadata.deletion_timestamp = Some(Time(Utc::now()));
        assert!(!is_running(&pod));

        pod.metadata.deletion_timestamp = None;
        pod.status.as_mut().unwrap().phase = Some("Pending".into());
        assert!(!is_running(&pod));
    }
}
