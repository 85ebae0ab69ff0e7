//! # Deleter module
//!
//! This module dismantle the child objects during finalization, in the
//! reverse dependency order of the ensure pipeline, and verify the teardown
//! took effect before the finalizer may be removed

use std::collections::BTreeMap;

use tracing::info;

use crate::svc::{
    k8s::store::Store,
    manifest,
    ops::{element::Element, Error},
};

// -----------------------------------------------------------------------------
// Deleter structure

pub struct Deleter {
    store: Store,
}

impl Deleter {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    async fn delete_stateful_sets(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), Error> {
        for statefulset in self.store.list_stateful_sets(namespace, labels).await? {
            self.store.delete(&statefulset).await?;
        }

        Ok(())
    }

    async fn delete_pods(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), Error> {
        for pod in self.store.list_pods(namespace, labels).await? {
            self.store.delete(&pod).await?;
        }

        Ok(())
    }

    async fn delete_persistent_volume_claims(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), Error> {
        for pvc in self
            .store
            .list_persistent_volume_claims(namespace, labels)
            .await?
        {
            self.store.delete(&pvc).await?;
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Deletions

    pub async fn sentinel_stateful_sets(&self, el: &Element) -> Result<(), Error> {
        info!(
            namespace = el.namespace(),
            name = el.name(),
            "Delete sentinel statefulsets"
        );
        self.delete_stateful_sets(el.namespace(), &manifest::sentinel_labels(el.redis()))
            .await
    }

    pub async fn redis_stateful_sets(&self, el: &Element) -> Result<(), Error> {
        info!(
            namespace = el.namespace(),
            name = el.name(),
            "Delete redis statefulsets"
        );
        self.delete_stateful_sets(el.namespace(), &manifest::redis_labels(el.redis()))
            .await
    }

    pub async fn sentinel_pods(&self, el: &Element) -> Result<(), Error> {
        self.delete_pods(el.namespace(), &manifest::sentinel_labels(el.redis()))
            .await
    }

    pub async fn redis_pods(&self, el: &Element) -> Result<(), Error> {
        self.delete_pods(el.namespace(), &manifest::redis_labels(el.redis()))
            .await
    }

    pub async fn sentinel_persistent_volume_claims(&self, el: &Element) -> Result<(), Error> {
        self.delete_persistent_volume_claims(el.namespace(), &manifest::sentinel_labels(el.redis()))
            .await
    }

    pub async fn redis_persistent_volume_claims(&self, el: &Element) -> Result<(), Error> {
        self.delete_persistent_volume_claims(el.namespace(), &manifest::redis_labels(el.redis()))
            .await
    }

    // -------------------------------------------------------------------------
    // Teardown checks

    pub async fn check_sentinel_pods_gone(&self, el: &Element) -> Result<(), Error> {
        let pods = self
            .store
            .list_pods(el.namespace(), &manifest::sentinel_labels(el.redis()))
            .await?;

        if !pods.is_empty() {
            return Err(Error::PodsStillPresent("sentinel", pods.len()));
        }

        Ok(())
    }

    pub async fn check_redis_pods_gone(&self, el: &Element) -> Result<(), Error> {
        let pods = self
            .store
            .list_pods(el.namespace(), &manifest::redis_labels(el.redis()))
            .await?;

        if !pods.is_empty() {
            return Err(Error::PodsStillPresent("redis", pods.len()));
        }

        Ok(())
    }

    pub async fn check_sentinel_persistent_volume_claims_gone(
        &self,
        el: &Element,
    ) -> Result<(), Error> {
        let pvcs = self
            .store
            .list_persistent_volume_claims(el.namespace(), &manifest::sentinel_labels(el.redis()))
            .await?;

        if !pvcs.is_empty() {
            return Err(Error::PersistentVolumeClaimsStillPresent("sentinel", pvcs.len()));
        }

        Ok(())
    }

    pub async fn check_redis_persistent_volume_claims_gone(
        &self,
        el: &Element,
    ) -> Result<(), Error> {
        let pvcs = self
            .store
            .list_persistent_volume_claims(el.namespace(), &manifest::redis_labels(el.redis()))
            .await?;

        if !pvcs.is_empty() {
            return Err(Error::PersistentVolumeClaimsStillPresent("redis", pvcs.len()));
        }

        Ok(())
    }
}
