//! # Ensurer module
//!
//! This module enforce the desired state of every child object. Each step
//! computes a ternary outcome, `Desired` is a no-op, `Pending` updates only
//! the fields the operator owns and `Missing` creates the object.

use tracing::info;

use crate::svc::{
    k8s::{secret, store::Store},
    manifest::{self, configmap, deployment, service, statefulset},
    ops::{element::Element, md5_hex, Error},
};

// -----------------------------------------------------------------------------
// Outcome enumeration

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
enum Outcome {
    Desired,
    Pending,
    Missing,
}

// -----------------------------------------------------------------------------
// Ensurer structure

pub struct Ensurer {
    store: Store,
}

impl Ensurer {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    // -------------------------------------------------------------------------
    // Sentinel config maps

    pub async fn sentinel_config_maps(&self, el: &mut Element) -> Result<(), Error> {
        el.refresh(&self.store).await?;

        for index in 0..el.redis().spec.sentinel.replicas {
            self.sentinel_config_map(el, index).await?;
        }

        Ok(())
    }

    async fn sentinel_config_map(&self, el: &mut Element, index: i32) -> Result<(), Error> {
        el.refresh(&self.store).await?;

        let password = secret::spec_password(&self.store, el.redis()).await?;
        let name = manifest::sentinel_config_map_name(el.redis(), index);
        let existing = self.store.get_config_map(el.namespace(), &name).await?;

        let mut desired = None;
        let outcome = match &existing {
            Some(existing) => {
                let candidate = configmap::sentinel_config_map_from_existing(
                    el.redis(),
                    &password,
                    existing,
                    index,
                );

                if candidate.data == existing.data {
                    Outcome::Desired
                } else {
                    desired = Some(candidate);
                    Outcome::Pending
                }
            }
            None => Outcome::Missing,
        };

        // a config map created with a password seeds the fingerprint, so the
        // first check-and-heal does not rotate a fresh cluster
        let previous = el.redis().status_or_default().sentinel;
        let mut current = previous.to_owned();
        if outcome == Outcome::Missing {
            current.password.md5 = md5_hex(&password);
        }
        if current != previous {
            info!(
                namespace = el.namespace(),
                name = el.name(),
                "Seed sentinel password fingerprint on status"
            );
            self.store.update_sentinel_state(el.redis(), current).await?;
            el.taint();
        }

        match outcome {
            Outcome::Desired => {}
            Outcome::Pending => {
                info!(
                    namespace = el.namespace(),
                    name = el.name(),
                    configmap = &name,
                    "Update sentinel config map"
                );
                if let Some(desired) = desired {
                    self.store.update(&desired).await?;
                }
            }
            Outcome::Missing => {
                info!(
                    namespace = el.namespace(),
                    name = el.name(),
                    configmap = &name,
                    "Create sentinel config map"
                );
                self.store
                    .create(&configmap::sentinel_config_map(
                        el.redis(),
                        el.owner_refs(),
                        &password,
                        index,
                    ))
                    .await?;
            }
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Redis readiness config map

    pub async fn redis_readiness_config_map(&self, el: &mut Element) -> Result<(), Error> {
        el.refresh(&self.store).await?;

        let name = manifest::readiness_config_map_name(el.redis());
        if self
            .store
            .get_config_map(el.namespace(), &name)
            .await?
            .is_some()
        {
            return Ok(());
        }

        info!(
            namespace = el.namespace(),
            name = el.name(),
            configmap = &name,
            "Create readiness config map"
        );
        self.store
            .create(&configmap::readiness_config_map(el.redis(), el.owner_refs()))
            .await?;

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Redis config maps

    pub async fn redis_master_config_map(&self, el: &mut Element) -> Result<(), Error> {
        self.redis_config_map(el, 0).await
    }

    pub async fn redis_slave_config_maps(&self, el: &mut Element) -> Result<(), Error> {
        el.refresh(&self.store).await?;

        for index in 1..el.redis().spec.redis.replicas {
            self.redis_config_map(el, index).await?;
        }

        Ok(())
    }

    async fn redis_config_map(&self, el: &mut Element, index: i32) -> Result<(), Error> {
        el.refresh(&self.store).await?;

        let password = secret::spec_password(&self.store, el.redis()).await?;
        let name = manifest::redis_config_map_name(el.redis(), index);
        let existing = self.store.get_config_map(el.namespace(), &name).await?;

        let mut desired = None;
        let outcome = match &existing {
            Some(existing) => {
                let candidate = configmap::redis_config_map_from_existing(
                    el.redis(),
                    &password,
                    existing,
                    index,
                );

                if candidate.data == existing.data {
                    Outcome::Desired
                } else {
                    desired = Some(candidate);
                    Outcome::Pending
                }
            }
            None => Outcome::Missing,
        };

        let previous = el.redis().status_or_default().redis;
        let mut current = previous.to_owned();
        if outcome == Outcome::Missing {
            current.password.md5 = md5_hex(&password);
        }
        if current != previous {
            info!(
                namespace = el.namespace(),
                name = el.name(),
                "Seed redis password fingerprint on status"
            );
            self.store.update_redis_state(el.redis(), current).await?;
            el.taint();
        }

        match outcome {
            Outcome::Desired => {}
            Outcome::Pending => {
                info!(
                    namespace = el.namespace(),
                    name = el.name(),
                    configmap = &name,
                    "Update redis config map"
                );
                if let Some(desired) = desired {
                    self.store.update(&desired).await?;
                }
            }
            Outcome::Missing => {
                info!(
                    namespace = el.namespace(),
                    name = el.name(),
                    configmap = &name,
                    "Create redis config map"
                );
                self.store
                    .create(&configmap::redis_config_map(
                        el.redis(),
                        el.owner_refs(),
                        &password,
                        index,
                    ))
                    .await?;
            }
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // StatefulSets

    pub async fn redis_stateful_sets(&self, el: &mut Element) -> Result<(), Error> {
        el.refresh(&self.store).await?;

        for index in 0..el.redis().spec.redis.replicas {
            self.redis_stateful_set(el, index).await?;
        }

        Ok(())
    }

    async fn redis_stateful_set(&self, el: &mut Element, index: i32) -> Result<(), Error> {
        el.refresh(&self.store).await?;

        let name = manifest::redis_name(el.redis(), index);
        let existing = self.store.get_stateful_set(el.namespace(), &name).await?;

        match &existing {
            Some(existing) => {
                let desired = statefulset::redis_stateful_set_from_existing(el.redis(), existing);

                if statefulset::redis_stateful_sets_equal(&desired, existing) {
                    return Ok(());
                }

                info!(
                    namespace = el.namespace(),
                    name = el.name(),
                    statefulset = &name,
                    "Update redis statefulset"
                );
                self.store.update(&desired).await?;
            }
            None => {
                info!(
                    namespace = el.namespace(),
                    name = el.name(),
                    statefulset = &name,
                    "Create redis statefulset"
                );
                self.store
                    .create(&statefulset::redis_stateful_set(
                        el.redis(),
                        el.owner_refs(),
                        index,
                    ))
                    .await?;
            }
        }

        Ok(())
    }

    pub async fn sentinel_stateful_sets(&self, el: &mut Element) -> Result<(), Error> {
        el.refresh(&self.store).await?;

        for index in 0..el.redis().spec.sentinel.replicas {
            self.sentinel_stateful_set(el, index).await?;
        }

        Ok(())
    }

    async fn sentinel_stateful_set(&self, el: &mut Element, index: i32) -> Result<(), Error> {
        el.refresh(&self.store).await?;

        let name = manifest::sentinel_name(el.redis(), index);
        let existing = self.store.get_stateful_set(el.namespace(), &name).await?;

        match &existing {
            Some(existing) => {
                let desired =
                    statefulset::sentinel_stateful_set_from_existing(el.redis(), existing);

                if statefulset::sentinel_stateful_sets_equal(&desired, existing) {
                    return Ok(());
                }

                info!(
                    namespace = el.namespace(),
                    name = el.name(),
                    statefulset = &name,
                    "Update sentinel statefulset"
                );
                self.store.update(&desired).await?;
            }
            None => {
                info!(
                    namespace = el.namespace(),
                    name = el.name(),
                    statefulset = &name,
                    "Create sentinel statefulset"
                );
                self.store
                    .create(&statefulset::sentinel_stateful_set(
                        el.redis(),
                        el.owner_refs(),
                        index,
                    ))
                    .await?;
            }
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Services

    pub async fn sentinel_service(&self, el: &mut Element) -> Result<(), Error> {
        el.refresh(&self.store).await?;

        let name = manifest::sentinel_service_name(el.redis());
        if self.store.get_service(el.namespace(), &name).await?.is_some() {
            return Ok(());
        }

        info!(
            namespace = el.namespace(),
            name = el.name(),
            service = &name,
            "Create sentinel service"
        );
        self.store
            .create(&service::sentinel_service(el.redis(), el.owner_refs()))
            .await?;

        Ok(())
    }

    pub async fn sentinel_headless_services(&self, el: &mut Element) -> Result<(), Error> {
        el.refresh(&self.store).await?;

        for index in 0..el.redis().spec.sentinel.replicas {
            let name = manifest::sentinel_headless_service_name(el.redis(), index);
            if self.store.get_service(el.namespace(), &name).await?.is_some() {
                continue;
            }

            info!(
                namespace = el.namespace(),
                name = el.name(),
                service = &name,
                "Create sentinel headless service"
            );
            self.store
                .create(&service::sentinel_headless_service(
                    el.redis(),
                    el.owner_refs(),
                    index,
                ))
                .await?;
        }

        Ok(())
    }

    pub async fn redis_headless_services(&self, el: &mut Element) -> Result<(), Error> {
        el.refresh(&self.store).await?;

        for index in 0..el.redis().spec.redis.replicas {
            let name = manifest::redis_headless_service_name(el.redis(), index);
            if self.store.get_service(el.namespace(), &name).await?.is_some() {
                continue;
            }

            info!(
                namespace = el.namespace(),
                name = el.name(),
                service = &name,
                "Create redis headless service"
            );
            self.store
                .create(&service::redis_headless_service(
                    el.redis(),
                    el.owner_refs(),
                    index,
                ))
                .await?;
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Exporter deployment

    pub async fn exporter_deployment(&self, el: &mut Element) -> Result<(), Error> {
        el.refresh(&self.store).await?;

        let name = manifest::exporter_root_name(el.redis());
        let existing = self.store.get_deployment(el.namespace(), &name).await?;
        let password = secret::spec_password(&self.store, el.redis()).await?;

        match &existing {
            Some(existing) => {
                let desired = deployment::exporter_deployment_from_existing(
                    el.redis(),
                    &password,
                    existing,
                )?;

                if deployment::exporter_deployments_equal(&desired, existing) {
                    return Ok(());
                }

                info!(
                    namespace = el.namespace(),
                    name = el.name(),
                    deployment = &name,
                    "Update exporter deployment"
                );
                self.store.update(&desired).await?;
            }
            None => {
                info!(
                    namespace = el.namespace(),
                    name = el.name(),
                    deployment = &name,
                    "Create exporter deployment"
                );
                self.store
                    .create(&deployment::exporter_deployment(
                        el.redis(),
                        el.owner_refs(),
                        &password,
                    )?)
                    .await?;
            }
        }

        Ok(())
    }
}
