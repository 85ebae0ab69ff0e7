//! # Element module
//!
//! This module provide the per-reconcile working context. Any step that
//! mutates the custom resource taints the element, the next step entry then
//! re-fetches a fresh copy before reading it.

use std::fmt::{self, Display, Formatter};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

use crate::svc::{
    crd::redis::Redis,
    k8s::{
        resource,
        store::{self, Store},
    },
};

// -----------------------------------------------------------------------------
// SoftError enumeration

/// a divergence observed during check-and-heal, a corrective mutation was
/// performed or is pending. Soft errors do not fail the reconcile but force a
/// short requeue, and the cluster flag is never raised while one is
/// outstanding.
#[derive(PartialEq, Eq, Clone, Debug)]
pub enum SoftError {
    NoMaster,
    AwaitFailover,
    FailoverTimeout(i64),
    MultipleMasters,
    WrongMonitor,
    SentinelNumberInMemory(String),
    SentinelSlavesInMemory(String),
    RedisConfigDrift,
    SentinelConfigDrift,
    RedisPasswordDrift,
    SentinelPasswordDrift,
}

impl Display for SoftError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::NoMaster => write!(f, "Master Number = 0"),
            Self::AwaitFailover => write!(f, "No master found, wait until failover"),
            Self::FailoverTimeout(seconds) => write!(
                f,
                "time {}s more than expected. Not even one master, fixing...",
                seconds
            ),
            Self::MultipleMasters => write!(f, "More than one master, fix manually"),
            Self::WrongMonitor => write!(f, "Sentinel is not monitoring the correct master"),
            Self::SentinelNumberInMemory(name) => write!(
                f,
                "{}: Sentinel has more sentinel in memory than expected",
                name
            ),
            Self::SentinelSlavesInMemory(name) => write!(
                f,
                "{}: Sentinel has more slaves in memory than expected",
                name
            ),
            Self::RedisConfigDrift => write!(f, "RedisCustomConfig Status not equal"),
            Self::SentinelConfigDrift => write!(f, "SentinelCustomConfig Status not equal"),
            Self::RedisPasswordDrift => write!(f, "RedisPassword Status not equal"),
            Self::SentinelPasswordDrift => write!(f, "SentinelPassword Status not equal"),
        }
    }
}

// -----------------------------------------------------------------------------
// Element structure

/// per-reconcile scratch record carrying the loaded custom resource, the
/// owner reference template of child objects, the dirty flag and the
/// accumulated soft errors
pub struct Element {
    redis: Redis,
    namespace: String,
    name: String,
    owner_refs: Vec<OwnerReference>,
    dirty: bool,
    soft_errors: Vec<SoftError>,
}

impl Element {
    pub fn new(redis: Redis) -> Self {
        let (namespace, name) = resource::namespaced_name(&redis);
        let owner_refs = vec![resource::owner_reference(&redis)];

        Self {
            redis,
            namespace,
            name,
            owner_refs,
            dirty: false,
            soft_errors: vec![],
        }
    }

    pub fn redis(&self) -> &Redis {
        &self.redis
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner_refs(&self) -> &[OwnerReference] {
        &self.owner_refs
    }

    /// marks the loaded custom resource as stale, the next [`Self::refresh`]
    /// re-fetches it
    pub fn taint(&mut self) {
        self.dirty = true;
    }

    /// re-fetches the custom resource whenever a previous step tainted it,
    /// every pipeline step calls this at entry
    pub async fn refresh(&mut self, store: &Store) -> Result<(), store::Error> {
        if self.dirty {
            self.redis = store.get_fresh_redis(&self.namespace, &self.name).await?;
        }

        self.dirty = false;
        Ok(())
    }

    pub fn soft(&mut self, err: SoftError) {
        self.soft_errors.push(err);
    }

    pub fn soft_errors(&self) -> &[SoftError] {
        &self.soft_errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_soft_error_messages() {
        assert_eq!(SoftError::NoMaster.to_string(), "Master Number = 0");
        assert_eq!(
            SoftError::AwaitFailover.to_string(),
            "No master found, wait until failover"
        );
        assert_eq!(
            SoftError::WrongMonitor.to_string(),
            "Sentinel is not monitoring the correct master"
        );
        assert_eq!(
            SoftError::SentinelNumberInMemory("sentinel-redis-sample-0-0".into()).to_string(),
            "sentinel-redis-sample-0-0: Sentinel has more sentinel in memory than expected"
        );
        assert_eq!(
            SoftError::RedisPasswordDrift.to_string(),
            "RedisPassword Status not equal"
        );
    }
}
