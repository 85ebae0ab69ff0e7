//! # Operations module
//!
//! This module wire the reconciliation pipeline: the ordered ensure steps,
//! the finalization teardown and the check-and-heal decision tree that keeps
//! the running cluster converged on the declared state.

use std::{sync::Arc, time::Duration};

use chrono::Duration as ChronoDuration;
use md5::{Digest, Md5};
use tracing::{info, warn};

use crate::svc::{
    k8s::{secret, store, store::Store},
    manifest,
    ops::{
        check::Checker,
        delete::Deleter,
        element::{Element, SoftError},
        ensure::Ensurer,
        heal::Healer,
    },
    redis::{self, agent::ExecApi, Endpoint, ExecClient, RedisClient},
};

pub mod check;
pub mod delete;
pub mod element;
pub mod ensure;
pub mod heal;

// -----------------------------------------------------------------------------
// Constants

pub const ERROR_REQUEUE_AFTER: Duration = Duration::from_secs(10);
pub const NORMAL_REQUEUE_AFTER: Duration = Duration::from_secs(30);

/// grace window left to sentinel to perform a failover on its own before the
/// operator promotes the oldest pod itself
const TIME_TO_PREPARE_SECONDS: i64 = 30;

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to execute request on kubernetes api, {0}")]
    Store(store::Error),
    #[error("failed to resolve password, {0}")]
    Secret(secret::Error),
    #[error("failed to execute command against redis, {0}")]
    Redis(redis::Error),
    #[error("failed to serialize custom config, {0}")]
    Serialize(serde_json::Error),
    #[error("number of redis pods differ from specification")]
    RedisNumberMismatch,
    #[error("number of sentinel pods differ from specification")]
    SentinelNumberMismatch,
    #[error("slave {slave} does not have the master {expected}, has {actual}")]
    SlaveOfWrongMaster {
        slave: String,
        expected: String,
        actual: String,
    },
    #[error("sentinels in memory mismatch")]
    SentinelMemoryMismatch,
    #[error("redis slaves in sentinel memory mismatch")]
    SentinelSlavesMemoryMismatch,
    #[error("the monitor on the sentinel config does not match with the expected one")]
    WrongMonitor,
    #[error("number of redis nodes known as master is different than 1, got {0}")]
    MasterNotUnique(usize),
    #[error("number of redis pods are 0")]
    NoRedisPods,
    #[error("failed to set the new password on the redis master")]
    MasterPasswordRotation,
    #[error("{0} pod's size = {1}")]
    PodsStillPresent(&'static str, usize),
    #[error("{0} pvc's size = {1}")]
    PersistentVolumeClaimsStillPresent(&'static str, usize),
}

impl From<store::Error> for Error {
    fn from(err: store::Error) -> Self {
        Self::Store(err)
    }
}

impl From<secret::Error> for Error {
    fn from(err: secret::Error) -> Self {
        Self::Secret(err)
    }
}

impl From<redis::Error> for Error {
    fn from(err: redis::Error) -> Self {
        Self::Redis(err)
    }
}

// -----------------------------------------------------------------------------
// Helpers

pub fn md5_hex(input: &str) -> String {
    hex::encode(Md5::digest(input.as_bytes()))
}

fn custom_config_md5(configs: &[String]) -> Result<String, Error> {
    let serialized = serde_json::to_string(configs).map_err(Error::Serialize)?;

    Ok(md5_hex(&serialized))
}

// -----------------------------------------------------------------------------
// Pipeline structure

/// the reconciliation engine, one instance serves one reconcile invocation
pub struct Pipeline {
    store: Store,
    ensurer: Ensurer,
    deleter: Deleter,
    checker: Checker,
    healer: Healer,
}

impl Pipeline {
    pub fn new(kube: kube::Client) -> Self {
        let store = Store::new(kube.to_owned());
        let client: Arc<dyn RedisClient> =
            Arc::new(ExecClient::new(Arc::new(ExecApi::new(kube))));

        Self {
            ensurer: Ensurer::new(store.to_owned()),
            deleter: Deleter::new(store.to_owned()),
            checker: Checker::new(store.to_owned(), client.to_owned()),
            healer: Healer::new(store.to_owned(), client),
            store,
        }
    }

    // -------------------------------------------------------------------------
    // Ensure pipeline

    /// enforces the desired state of every child object, in dependency order
    pub async fn ensure(&self, el: &mut Element) -> Result<(), Error> {
        self.ensurer.sentinel_config_maps(el).await?;
        self.ensurer.redis_readiness_config_map(el).await?;
        self.ensurer.redis_master_config_map(el).await?;
        self.ensurer.redis_slave_config_maps(el).await?;
        self.ensurer.redis_stateful_sets(el).await?;
        self.ensurer.sentinel_stateful_sets(el).await?;

        if el.redis().spec.sentinel.service.enabled {
            self.ensurer.sentinel_service(el).await?;
        }

        if !el.redis().spec.sentinel.host_network {
            self.ensurer.sentinel_headless_services(el).await?;
        }

        if !el.redis().spec.redis.host_network {
            self.ensurer.redis_headless_services(el).await?;
        }

        if el.redis().spec.exporter.enabled {
            self.ensurer.exporter_deployment(el).await?;
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Delete pipeline

    /// dismantles the child objects in reverse dependency order, and fails
    /// while pods or claims survive so the finalizer is kept for a retry
    pub async fn delete_ensure(&self, el: &mut Element) -> Result<(), Error> {
        self.deleter.sentinel_stateful_sets(el).await?;
        self.deleter.redis_stateful_sets(el).await?;
        self.deleter.sentinel_pods(el).await?;
        self.deleter.redis_pods(el).await?;
        self.deleter.check_sentinel_pods_gone(el).await?;
        self.deleter.check_redis_pods_gone(el).await?;
        self.deleter.sentinel_persistent_volume_claims(el).await?;
        self.deleter.redis_persistent_volume_claims(el).await?;
        self.deleter
            .check_sentinel_persistent_volume_claims_gone(el)
            .await?;
        self.deleter
            .check_redis_persistent_volume_claims_gone(el)
            .await?;

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Check-and-heal pipeline

    /// audits the running cluster and heals the observed divergences:
    /// replica counts match the spec, exactly one master, every slave
    /// replicates it, every sentinel monitors it with a clean memory, and
    /// custom config and passwords match their recorded fingerprints
    pub async fn check_and_heal(&self, el: &mut Element) -> Result<(), Error> {
        el.refresh(&self.store).await?;

        self.check_state(el).await?;

        let rotate_config = self.need_check_and_heal_custom_config(el).await?;
        let rotate_password = self.need_check_and_heal_password(el).await?;

        if !rotate_config && !rotate_password {
            let status = el.redis().status_or_default();

            if status.state.cluster {
                info!(
                    namespace = el.namespace(),
                    name = el.name(),
                    "cluster = true, skip check and heal"
                );
                return Ok(());
            }

            if !manifest::needs_auto_failover(el.redis()) {
                info!(
                    namespace = el.namespace(),
                    name = el.name(),
                    "no need to auto failover, skip check and heal"
                );
                return Ok(());
            }
        }

        self.check_number(el).await?;
        self.check_master(el).await?;
        self.check_and_heal_topology(el).await?;
        self.check_and_heal_custom_config(el).await?;
        self.check_and_heal_password(el).await?;

        Ok(())
    }

    /// recomputes the observed pod map, phase and readiness and stores them
    /// when they changed
    async fn check_state(&self, el: &mut Element) -> Result<(), Error> {
        el.refresh(&self.store).await?;

        let pods = self
            .store
            .list_pods(el.namespace(), &manifest::instance_labels(el.name()))
            .await?;

        let previous = el.redis().status_or_default().state;
        let mut current = previous.to_owned();

        current.pods = manifest::pod_states(&pods);
        current.phase = manifest::global_phase(el.redis(), &pods);
        current.ready = manifest::global_ready(el.redis(), &pods);

        if current != previous {
            info!(
                namespace = el.namespace(),
                name = el.name(),
                "State Status not equal"
            );
            self.store.update_cluster_state(el.redis(), current).await?;
            el.taint();
        }

        Ok(())
    }

    async fn check_number(&self, el: &mut Element) -> Result<(), Error> {
        el.refresh(&self.store).await?;

        if let Err(err) = self.checker.check_redis_number(el).await {
            warn!(
                namespace = el.namespace(),
                name = el.name(),
                error = err.to_string(),
                "Number of redis mismatch, this could be for a change on the statefulset"
            );
            return Err(err);
        }

        if let Err(err) = self.checker.check_sentinel_number(el).await {
            warn!(
                namespace = el.namespace(),
                name = el.name(),
                error = err.to_string(),
                "Number of sentinel mismatch, this could be for a change on the statefulset"
            );
            return Err(err);
        }

        Ok(())
    }

    async fn check_master(&self, el: &mut Element) -> Result<(), Error> {
        el.refresh(&self.store).await?;

        let masters = self.checker.number_of_masters(el).await?;

        info!(
            namespace = el.namespace(),
            name = el.name(),
            masters,
            "Master Number"
        );

        match masters {
            0 => {
                el.soft(SoftError::NoMaster);

                let targets = self.checker.redis_endpoints(el).await?;
                if targets.len() == 1 {
                    self.healer.make_master(&targets[0]).await?;
                    return Ok(());
                }

                let min_time = self.checker.minimum_redis_pod_time(el).await?;

                info!(
                    namespace = el.namespace(),
                    name = el.name(),
                    seconds = min_time.num_seconds(),
                    "Youngest redis pod age"
                );

                if min_time > ChronoDuration::seconds(TIME_TO_PREPARE_SECONDS) {
                    // sentinel had its chance, promote the oldest pod
                    el.soft(SoftError::FailoverTimeout(min_time.num_seconds()));
                    self.healer.set_oldest_as_master(el).await?;
                } else {
                    el.soft(SoftError::AwaitFailover);
                    info!(
                        namespace = el.namespace(),
                        name = el.name(),
                        "No master found, wait until failover"
                    );
                }
            }
            1 => {}
            _ => {
                el.soft(SoftError::MultipleMasters);
                info!(
                    namespace = el.namespace(),
                    name = el.name(),
                    "More than one master, fix manually"
                );
            }
        }

        Ok(())
    }

    async fn check_and_heal_topology(&self, el: &mut Element) -> Result<(), Error> {
        el.refresh(&self.store).await?;

        let master = self.checker.master_endpoint(el).await?;

        self.check_and_heal_redis(el, &master).await?;
        self.check_and_heal_sentinels(el, &master).await?;

        Ok(())
    }

    async fn check_and_heal_redis(&self, el: &mut Element, master: &Endpoint) -> Result<(), Error> {
        el.refresh(&self.store).await?;

        if let Err(err) = self.checker.check_all_slaves_from_master(master, el).await {
            info!(
                namespace = el.namespace(),
                name = el.name(),
                error = err.to_string(),
                "Not all slaves have the same master"
            );
            self.healer.set_master_on_all(&master.ip, el).await?;
        }

        Ok(())
    }

    async fn check_and_heal_sentinels(
        &self,
        el: &mut Element,
        master: &Endpoint,
    ) -> Result<(), Error> {
        el.refresh(&self.store).await?;

        let sentinels = self.checker.sentinel_endpoints(el).await?;

        for sentinel in &sentinels {
            if self
                .checker
                .check_sentinel_monitor(sentinel, &master.ip, None)
                .await
                .is_err()
            {
                el.soft(SoftError::WrongMonitor);
                info!(
                    namespace = el.namespace(),
                    name = el.name(),
                    sentinel = &sentinel.name,
                    "Sentinel is not monitoring the correct master"
                );
                self.healer
                    .new_sentinel_monitor(sentinel, &master.ip, el)
                    .await?;
            }
        }

        for sentinel in &sentinels {
            if let Err(err) = self.checker.check_sentinel_number_in_memory(sentinel, el).await {
                el.soft(SoftError::SentinelNumberInMemory(sentinel.name.to_owned()));
                warn!(
                    namespace = el.namespace(),
                    name = el.name(),
                    sentinel = &sentinel.name,
                    error = err.to_string(),
                    "Sentinel has more sentinel in memory than expected"
                );
                self.healer.restore_sentinel(sentinel).await?;
            }
        }

        for sentinel in &sentinels {
            if let Err(err) = self
                .checker
                .check_sentinel_slaves_number_in_memory(sentinel, el)
                .await
            {
                el.soft(SoftError::SentinelSlavesInMemory(sentinel.name.to_owned()));
                warn!(
                    namespace = el.namespace(),
                    name = el.name(),
                    sentinel = &sentinel.name,
                    error = err.to_string(),
                    "Sentinel has more slaves in memory than expected"
                );
                self.healer.restore_sentinel(sentinel).await?;
            }
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Custom config rotation

    async fn need_check_and_heal_custom_config(&self, el: &mut Element) -> Result<bool, Error> {
        el.refresh(&self.store).await?;

        if let Some(configs) = &el.redis().spec.redis.custom_config {
            if custom_config_md5(configs)? != el.redis().status_or_default().redis.custom_config.md5
            {
                return Ok(true);
            }
        }

        if let Some(configs) = &el.redis().spec.sentinel.custom_config {
            if custom_config_md5(configs)?
                != el.redis().status_or_default().sentinel.custom_config.md5
            {
                return Ok(true);
            }
        }

        Ok(false)
    }

    async fn check_and_heal_custom_config(&self, el: &mut Element) -> Result<(), Error> {
        el.refresh(&self.store).await?;

        self.check_and_heal_redis_custom_config(el).await?;
        self.check_and_heal_sentinel_custom_config(el).await?;

        Ok(())
    }

    async fn check_and_heal_redis_custom_config(&self, el: &mut Element) -> Result<(), Error> {
        el.refresh(&self.store).await?;

        let configs = match &el.redis().spec.redis.custom_config {
            Some(configs) => configs.to_owned(),
            None => return Ok(()),
        };

        let md5 = custom_config_md5(&configs)?;
        let previous = el.redis().status_or_default().redis;
        if md5 == previous.custom_config.md5 {
            return Ok(());
        }

        el.soft(SoftError::RedisConfigDrift);
        info!(
            namespace = el.namespace(),
            name = el.name(),
            "RedisCustomConfig Status not equal"
        );

        for target in self.checker.redis_endpoints(el).await? {
            self.healer.set_redis_custom_config(&target, el).await?;
        }

        let mut current = previous;
        current.custom_config.md5 = md5;
        self.store.update_redis_state(el.redis(), current).await?;
        el.taint();

        Ok(())
    }

    async fn check_and_heal_sentinel_custom_config(&self, el: &mut Element) -> Result<(), Error> {
        el.refresh(&self.store).await?;

        let configs = match &el.redis().spec.sentinel.custom_config {
            Some(configs) => configs.to_owned(),
            None => return Ok(()),
        };

        let md5 = custom_config_md5(&configs)?;
        let previous = el.redis().status_or_default().sentinel;
        if md5 == previous.custom_config.md5 {
            return Ok(());
        }

        el.soft(SoftError::SentinelConfigDrift);
        info!(
            namespace = el.namespace(),
            name = el.name(),
            "SentinelCustomConfig Status not equal"
        );

        for sentinel in self.checker.sentinel_endpoints(el).await? {
            self.healer.set_sentinel_custom_config(&sentinel, el).await?;
        }

        let mut current = previous;
        current.custom_config.md5 = md5;
        self.store.update_sentinel_state(el.redis(), current).await?;
        el.taint();

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Password rotation

    async fn need_check_and_heal_password(&self, el: &mut Element) -> Result<bool, Error> {
        el.refresh(&self.store).await?;

        let md5 = md5_hex(&secret::spec_password(&self.store, el.redis()).await?);
        let status = el.redis().status_or_default();

        Ok(md5 != status.redis.password.md5 || md5 != status.sentinel.password.md5)
    }

    /// sentinel first: it must hold the new `auth-pass` before the master
    /// rotates, otherwise it could not authenticate a post-rotation failover
    async fn check_and_heal_password(&self, el: &mut Element) -> Result<(), Error> {
        el.refresh(&self.store).await?;

        self.check_and_heal_sentinel_password(el).await?;
        self.check_and_heal_redis_password(el).await?;

        Ok(())
    }

    async fn check_and_heal_sentinel_password(&self, el: &mut Element) -> Result<(), Error> {
        el.refresh(&self.store).await?;

        let md5 = md5_hex(&secret::spec_password(&self.store, el.redis()).await?);
        let previous = el.redis().status_or_default().sentinel;
        if md5 == previous.password.md5 {
            return Ok(());
        }

        el.soft(SoftError::SentinelPasswordDrift);
        info!(
            namespace = el.namespace(),
            name = el.name(),
            "SentinelPassword Status not equal"
        );

        for sentinel in self.checker.sentinel_endpoints(el).await? {
            info!(
                namespace = el.namespace(),
                name = el.name(),
                sentinel = &sentinel.name,
                "starting set sentinel new password..."
            );
            self.healer.set_sentinel_password(&sentinel, el).await?;
        }

        let mut current = previous;
        current.password.md5 = md5;
        self.store.update_sentinel_state(el.redis(), current).await?;
        el.taint();

        Ok(())
    }

    async fn check_and_heal_redis_password(&self, el: &mut Element) -> Result<(), Error> {
        el.refresh(&self.store).await?;

        let md5 = md5_hex(&secret::spec_password(&self.store, el.redis()).await?);
        let previous = el.redis().status_or_default().redis;
        if md5 == previous.password.md5 {
            return Ok(());
        }

        el.soft(SoftError::RedisPasswordDrift);
        info!(
            namespace = el.namespace(),
            name = el.name(),
            "RedisPassword Status not equal"
        );

        self.apply_redis_password(el).await?;

        let mut current = previous;
        current.password.md5 = md5;
        self.store.update_redis_state(el.redis(), current).await?;
        el.taint();

        Ok(())
    }

    /// the master rotates first, replicas only follow once it succeeded so
    /// their `masterauth` never outruns the master `requirepass`
    async fn apply_redis_password(&self, el: &mut Element) -> Result<(), Error> {
        el.refresh(&self.store).await?;

        let master = self.checker.master_endpoint(el).await?;
        let targets = self.checker.redis_endpoints(el).await?;

        let mut rotated = false;
        for target in &targets {
            if *target == master {
                info!(
                    namespace = el.namespace(),
                    name = el.name(),
                    pod = &target.name,
                    "starting set redis master new password..."
                );
                self.healer.set_redis_password(target, el).await?;
                rotated = true;
            }
        }

        if !rotated {
            return Err(Error::MasterPasswordRotation);
        }

        for target in &targets {
            if *target != master {
                info!(
                    namespace = el.namespace(),
                    name = el.name(),
                    pod = &target.name,
                    "starting set redis slave new password..."
                );
                self.healer.set_redis_password(target, el).await?;
            }
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Cluster flag

    /// records whether the last reconcile completed every check, the flag is
    /// never raised while a soft error is outstanding
    pub async fn check_cluster(&self, el: &mut Element, converged: bool) -> Result<(), Error> {
        el.refresh(&self.store).await?;

        let previous = el.redis().status_or_default().state;
        let mut current = previous.to_owned();

        current.cluster = converged;

        if current != previous {
            info!(
                namespace = el.namespace(),
                name = el.name(),
                "State Cluster Status not equal"
            );
            self.store.update_cluster_state(el.redis(), current).await?;
            el.taint();
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_md5_hex() {
        assert_eq!(md5_hex("pass"), "1a1dc91c907325c69271ddf0c944bc72");
        assert_eq!(md5_hex(""), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn test_custom_config_md5_is_stable() {
        let configs = vec!["maxmemory 1gb".to_string(), "save 900 1".to_string()];

        assert_eq!(
            custom_config_md5(&configs).unwrap(),
            custom_config_md5(&configs.to_owned()).unwrap()
        );
        assert_ne!(
            custom_config_md5(&configs).unwrap(),
            custom_config_md5(&configs[..1].to_vec()).unwrap()
        );
    }

    #[test]
    fn test_requeue_intervals() {
        assert_eq!(ERROR_REQUEUE_AFTER, Duration::from_secs(10));
        assert_eq!(NORMAL_REQUEUE_AFTER, Duration::from_secs(30));
    }
}
