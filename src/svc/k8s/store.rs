//! # Store module
//!
//! This module provide a typed facade over the kubernetes api for the
//! resources the operator owns, the reads filter not-found answers and the
//! status helpers patch the custom resource status subresource

use std::{collections::BTreeMap, fmt::Debug};

use k8s_openapi::{
    api::{
        apps::v1::{Deployment, StatefulSet},
        core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret, Service},
    },
    NamespaceResourceScope,
};
use kube::{api::{DeleteParams, ListParams, PostParams}, Api, Client, Resource, ResourceExt};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::svc::{
    crd::redis::{ClusterState, Redis, RedisState, SentinelState},
    k8s::resource,
};

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to execute request on kubernetes api, {0}")]
    KubeClient(kube::Error),
    #[error("failed to compute diff between the original and modified object, {0}")]
    Diff(serde_json::Error),
    #[error("custom resource '{0}/{1}' is gone")]
    Gone(String, String),
    #[error("custom resource '{0}/{1}' is being deleted")]
    Deleted(String, String),
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        Self::KubeClient(err)
    }
}

// -----------------------------------------------------------------------------
// Helpers

fn selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

fn not_found_as_none<T>(result: Result<T, kube::Error>) -> Result<Option<T>, kube::Error> {
    match result {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(err)) if err.code == 404 => Ok(None),
        Err(err) => Err(err),
    }
}

// -----------------------------------------------------------------------------
// Store structure

/// typed access to the kubernetes resources the operator reads and writes
#[derive(Clone)]
pub struct Store {
    kube: Client,
}

impl Store {
    pub fn new(kube: Client) -> Self {
        Self { kube }
    }

    fn api<T>(&self, namespace: &str) -> Api<T>
    where
        T: Resource<Scope = NamespaceResourceScope> + DeserializeOwned + Clone + Debug,
        <T as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.kube.to_owned(), namespace)
    }

    // -------------------------------------------------------------------------
    // Custom resource

    /// fetches the custom resource, a not-found answer is given back as `None`
    pub async fn get_redis(&self, namespace: &str, name: &str) -> Result<Option<Redis>, Error> {
        debug!(namespace, name, "execute a request to retrieve custom resource");
        Ok(not_found_as_none(self.api::<Redis>(namespace).get(name).await)?)
    }

    /// fetches a fresh copy of the custom resource for a pipeline step, a
    /// resource that disappeared or carries a deletion timestamp aborts the
    /// reconcile
    pub async fn get_fresh_redis(&self, namespace: &str, name: &str) -> Result<Redis, Error> {
        let redis = self
            .get_redis(namespace, name)
            .await?
            .ok_or_else(|| Error::Gone(namespace.into(), name.into()))?;

        if resource::deleted(&redis) {
            return Err(Error::Deleted(namespace.into(), name.into()));
        }

        Ok(redis)
    }

    // -------------------------------------------------------------------------
    // Child objects, reads

    pub async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, Error> {
        Ok(not_found_as_none(
            self.api::<ConfigMap>(namespace).get(name).await,
        )?)
    }

    pub async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error> {
        Ok(not_found_as_none(
            self.api::<Service>(namespace).get(name).await,
        )?)
    }

    pub async fn get_stateful_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<StatefulSet>, Error> {
        Ok(not_found_as_none(
            self.api::<StatefulSet>(namespace).get(name).await,
        )?)
    }

    pub async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, Error> {
        Ok(not_found_as_none(
            self.api::<Deployment>(namespace).get(name).await,
        )?)
    }

    pub async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        Ok(not_found_as_none(
            self.api::<Secret>(namespace).get(name).await,
        )?)
    }

    pub async fn list_pods(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>, Error> {
        let params = ListParams::default().labels(&selector(labels));

        Ok(self.api::<Pod>(namespace).list(&params).await?.items)
    }

    pub async fn list_stateful_sets(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<StatefulSet>, Error> {
        let params = ListParams::default().labels(&selector(labels));

        Ok(self.api::<StatefulSet>(namespace).list(&params).await?.items)
    }

    pub async fn list_persistent_volume_claims(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<PersistentVolumeClaim>, Error> {
        let params = ListParams::default().labels(&selector(labels));

        Ok(self
            .api::<PersistentVolumeClaim>(namespace)
            .list(&params)
            .await?
            .items)
    }

    // -------------------------------------------------------------------------
    // Child objects, writes

    pub async fn create<T>(&self, obj: &T) -> Result<T, Error>
    where
        T: Resource<Scope = NamespaceResourceScope> + Serialize + DeserializeOwned + Clone + Debug,
        <T as Resource>::DynamicType: Default,
    {
        let (namespace, name) = resource::namespaced_name(obj);

        debug!(
            namespace = &namespace,
            name = &name,
            "execute a request to create a resource"
        );
        Ok(self
            .api::<T>(&namespace)
            .create(&PostParams::default(), obj)
            .await?)
    }

    pub async fn update<T>(&self, obj: &T) -> Result<T, Error>
    where
        T: Resource<Scope = NamespaceResourceScope> + Serialize + DeserializeOwned + Clone + Debug,
        <T as Resource>::DynamicType: Default,
    {
        let (namespace, name) = resource::namespaced_name(obj);

        debug!(
            namespace = &namespace,
            name = &name,
            "execute a request to update a resource"
        );
        Ok(self
            .api::<T>(&namespace)
            .replace(&name, &PostParams::default(), obj)
            .await?)
    }

    pub async fn delete<T>(&self, obj: &T) -> Result<(), Error>
    where
        T: Resource<Scope = NamespaceResourceScope> + Serialize + DeserializeOwned + Clone + Debug,
        <T as Resource>::DynamicType: Default,
    {
        let (namespace, name) = resource::namespaced_name(obj);

        debug!(
            namespace = &namespace,
            name = &name,
            "execute a request to delete a resource"
        );
        self.api::<T>(&namespace)
            .delete(&name, &DeleteParams::default())
            .await?;

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Custom resource status subresource

    async fn patch_status(&self, origin: &Redis, modified: Redis) -> Result<Redis, Error> {
        let patch = resource::diff(origin, &modified).map_err(Error::Diff)?;

        Ok(resource::patch_status(self.kube.to_owned(), modified, patch).await?)
    }

    pub async fn update_redis_state(&self, rf: &Redis, state: RedisState) -> Result<Redis, Error> {
        let mut modified = rf.to_owned();

        modified.status.get_or_insert_with(Default::default).redis = state;
        self.patch_status(rf, modified).await
    }

    pub async fn update_sentinel_state(
        &self,
        rf: &Redis,
        state: SentinelState,
    ) -> Result<Redis, Error> {
        let mut modified = rf.to_owned();

        modified.status.get_or_insert_with(Default::default).sentinel = state;
        self.patch_status(rf, modified).await
    }

    pub async fn update_cluster_state(
        &self,
        rf: &Redis,
        state: ClusterState,
    ) -> Result<Redis, Error> {
        let mut modified = rf.to_owned();

        modified.status.get_or_insert_with(Default::default).state = state;
        self.patch_status(rf, modified).await
    }
}

// -----------------------------------------------------------------------------
// Helpers on listed objects

/// returns the statefulset with the given name out of the given list, if any
pub fn search_stateful_set_by_name<'a>(
    name: &str,
    statefulsets: &'a [StatefulSet],
) -> Option<&'a StatefulSet> {
    statefulsets
        .iter()
        .find(|statefulset| statefulset.name_any() == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector() {
        let mut labels = BTreeMap::new();

        labels.insert("app.kubernetes.io/name".to_string(), "redis-sample".to_string());
        labels.insert("app.kubernetes.io/part-of".to_string(), "redis-sentinel".to_string());

        assert_eq!(
            selector(&labels),
            "app.kubernetes.io/name=redis-sample,app.kubernetes.io/part-of=redis-sentinel"
        );
    }

    #[test]
    fn test_search_stateful_set_by_name() {
        let mut statefulset = StatefulSet::default();

        statefulset.metadata.name = Some("redis-redis-sample-0".into());

        let list = vec![statefulset];

        assert!(search_stateful_set_by_name("redis-redis-sample-0", &list).is_some());
        assert!(search_stateful_set_by_name("redis-redis-sample-1", &list).is_none());
    }
}
