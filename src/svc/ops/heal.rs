//! # Healer module
//!
//! This module provide the corrective mutations applied to the live cluster,
//! every operation is a legal starting point for the next reconcile and may
//! be repeated safely

use std::sync::Arc;

use tracing::info;

use crate::svc::{
    k8s::{secret, store::Store},
    manifest,
    ops::{element::Element, Error},
    redis::{Endpoint, RedisClient, REDIS_DEFAULT_PORT},
};

// -----------------------------------------------------------------------------
// Healer structure

pub struct Healer {
    store: Store,
    client: Arc<dyn RedisClient>,
}

impl Healer {
    pub fn new(store: Store, client: Arc<dyn RedisClient>) -> Self {
        Self { store, client }
    }

    /// promotes the given process, the promotion is persisted through a
    /// configuration rewrite so it survives a restart
    pub async fn make_master(&self, target: &Endpoint) -> Result<(), Error> {
        let password = self.client.redis_password(target).await?;

        Ok(self.client.make_master(target, &password).await?)
    }

    /// promotes the oldest redis pod and points every other one at it
    pub async fn set_oldest_as_master(&self, el: &Element) -> Result<(), Error> {
        let mut pods = self
            .store
            .list_pods(el.namespace(), &manifest::redis_labels(el.redis()))
            .await?;

        if pods.is_empty() {
            return Err(Error::NoRedisPods);
        }

        pods.sort_by(|a, b| {
            a.metadata
                .creation_timestamp
                .as_ref()
                .map(|time| time.0)
                .cmp(&b.metadata.creation_timestamp.as_ref().map(|time| time.0))
        });

        let mut new_master_ip = String::new();
        for pod in &pods {
            let target = Endpoint::new(
                pod.metadata.namespace.as_deref().unwrap_or_default(),
                pod.metadata.name.as_deref().unwrap_or_default(),
                manifest::REDIS_CONTAINER_NAME,
                pod.status
                    .as_ref()
                    .and_then(|status| status.pod_ip.as_deref())
                    .unwrap_or_default(),
            );
            let password = self.client.redis_password(&target).await?;

            if new_master_ip.is_empty() {
                new_master_ip = target.ip.to_owned();
                info!(
                    namespace = el.namespace(),
                    name = el.name(),
                    pod = &target.name,
                    ip = &new_master_ip,
                    "New master elected"
                );
                self.client.make_master(&target, &password).await?;
            } else {
                info!(
                    namespace = el.namespace(),
                    name = el.name(),
                    pod = &target.name,
                    master = &new_master_ip,
                    "Making pod slave of the new master"
                );
                self.client
                    .make_slave_of(&target, &password, &new_master_ip, REDIS_DEFAULT_PORT)
                    .await?;
            }
        }

        Ok(())
    }

    /// points every redis pod at the given master, promoting the master
    /// itself when needed
    pub async fn set_master_on_all(&self, master_ip: &str, el: &Element) -> Result<(), Error> {
        let pods = self
            .store
            .list_pods(el.namespace(), &manifest::redis_labels(el.redis()))
            .await?;

        for pod in &pods {
            let target = Endpoint::new(
                pod.metadata.namespace.as_deref().unwrap_or_default(),
                pod.metadata.name.as_deref().unwrap_or_default(),
                manifest::REDIS_CONTAINER_NAME,
                pod.status
                    .as_ref()
                    .and_then(|status| status.pod_ip.as_deref())
                    .unwrap_or_default(),
            );
            let password = self.client.redis_password(&target).await?;

            if target.ip == master_ip {
                info!(
                    namespace = el.namespace(),
                    name = el.name(),
                    pod = &target.name,
                    "Ensure pod is master"
                );
                self.client.make_master(&target, &password).await?;
            } else {
                info!(
                    namespace = el.namespace(),
                    name = el.name(),
                    pod = &target.name,
                    master = master_ip,
                    "Making pod slave of the master"
                );
                self.client
                    .make_slave_of(&target, &password, master_ip, REDIS_DEFAULT_PORT)
                    .await?;
            }
        }

        Ok(())
    }

    /// rewrites the monitored master of the given sentinel, then restores the
    /// authentication password when one is configured
    pub async fn new_sentinel_monitor(
        &self,
        sentinel: &Endpoint,
        master_ip: &str,
        el: &Element,
    ) -> Result<(), Error> {
        info!(
            namespace = el.namespace(),
            name = el.name(),
            sentinel = &sentinel.name,
            master = master_ip,
            "Sentinel is not monitoring the correct master, changing..."
        );

        let quorum = manifest::quorum(el.redis()).to_string();
        let password = secret::spec_password(&self.store, el.redis()).await?;

        Ok(self
            .client
            .monitor_redis(sentinel, master_ip, REDIS_DEFAULT_PORT, &quorum, &password)
            .await?)
    }

    /// flushes the sentinel state so it rediscovers the topology
    pub async fn restore_sentinel(&self, sentinel: &Endpoint) -> Result<(), Error> {
        info!(
            namespace = &sentinel.namespace,
            sentinel = &sentinel.name,
            ip = &sentinel.ip,
            "Restoring sentinel..."
        );

        Ok(self.client.reset_sentinel(sentinel).await?)
    }

    pub async fn set_redis_custom_config(
        &self,
        target: &Endpoint,
        el: &Element,
    ) -> Result<(), Error> {
        info!(
            namespace = el.namespace(),
            name = el.name(),
            pod = &target.name,
            "Setting the custom config on redis..."
        );

        let configs = el
            .redis()
            .spec
            .redis
            .custom_config
            .to_owned()
            .unwrap_or_default();
        let password = self.client.redis_password(target).await?;

        Ok(self
            .client
            .set_custom_redis_config(target, &configs, &password)
            .await?)
    }

    pub async fn set_sentinel_custom_config(
        &self,
        sentinel: &Endpoint,
        el: &Element,
    ) -> Result<(), Error> {
        info!(
            namespace = el.namespace(),
            name = el.name(),
            pod = &sentinel.name,
            "Setting the custom config on sentinel..."
        );

        let configs = el
            .redis()
            .spec
            .sentinel
            .custom_config
            .to_owned()
            .unwrap_or_default();

        Ok(self
            .client
            .set_custom_sentinel_config(sentinel, &configs)
            .await?)
    }

    /// installs the declared password on the given redis process, the current
    /// one is read back from the writable configuration file
    pub async fn set_redis_password(&self, target: &Endpoint, el: &Element) -> Result<(), Error> {
        let new_password = secret::spec_password(&self.store, el.redis()).await?;

        Ok(self.client.set_redis_password(target, &new_password).await?)
    }

    /// installs the declared password on the given sentinel process
    pub async fn set_sentinel_password(
        &self,
        sentinel: &Endpoint,
        el: &Element,
    ) -> Result<(), Error> {
        let new_password = secret::spec_password(&self.store, el.redis()).await?;

        Ok(self
            .client
            .set_sentinel_password(sentinel, &new_password)
            .await?)
    }
}
