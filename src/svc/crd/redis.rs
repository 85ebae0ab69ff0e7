//! # Redis custom resource
//!
//! This module provide the redis high-availability custom resource, its
//! admission invariants and the reconciliation driver running the ensure and
//! check-and-heal pipelines.

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use k8s_openapi::{
    api::{
        apps::v1::StatefulSetUpdateStrategy,
        core::v1::{
            Affinity, EmptyDirVolumeSource, LocalObjectReference, PersistentVolumeClaim, PodIP,
            PodSecurityContext, ResourceRequirements, Toleration,
        },
    },
    apimachinery::pkg::apis::meta::v1::Time,
};
use kube::{
    runtime::{controller, controller::Action, watcher, Controller},
    Api, CustomResource,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::svc::{
    k8s::{self, finalizer, resource, Context, ControllerBuilder},
    manifest,
    ops::{self, element::Element, Pipeline, ERROR_REQUEUE_AFTER, NORMAL_REQUEUE_AFTER},
};

// -----------------------------------------------------------------------------
// StaticResource structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct StaticResource {
    #[serde(rename = "host", default)]
    pub host: String,
    #[serde(rename = "port", default)]
    pub port: i32,
}

// -----------------------------------------------------------------------------
// CommandRename structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct CommandRename {
    #[serde(rename = "from", default)]
    pub from: String,
    #[serde(rename = "to", default)]
    pub to: String,
}

// -----------------------------------------------------------------------------
// Storage structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct Storage {
    #[serde(rename = "keepAfterDeletion", default)]
    pub keep_after_deletion: bool,
    #[serde(rename = "emptyDir", skip_serializing_if = "Option::is_none")]
    pub empty_dir: Option<EmptyDirVolumeSource>,
    #[serde(rename = "persistentVolumeClaim", skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim: Option<PersistentVolumeClaim>,
}

// -----------------------------------------------------------------------------
// RedisSettings structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct RedisSettings {
    #[serde(rename = "resources", default)]
    pub resources: ResourceRequirements,
    #[serde(rename = "customConfig", skip_serializing_if = "Option::is_none")]
    pub custom_config: Option<Vec<String>>,
    #[serde(rename = "image", default)]
    pub image: String,
    #[serde(rename = "updateStrategy", default)]
    pub update_strategy: StatefulSetUpdateStrategy,
    #[serde(rename = "imagePullPolicy", skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,
    #[serde(rename = "replicas", default)]
    pub replicas: i32,
    #[serde(rename = "customCommandRenames", default)]
    pub custom_command_renames: Vec<CommandRename>,
    #[serde(rename = "command", default)]
    pub command: Vec<String>,
    #[serde(rename = "storage", default)]
    pub storage: Storage,
    #[serde(rename = "storageLog", default)]
    pub storage_log: Storage,
    #[serde(rename = "affinity", skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,
    #[serde(rename = "securityContext", skip_serializing_if = "Option::is_none")]
    pub security_context: Option<PodSecurityContext>,
    #[serde(rename = "imagePullSecrets", default)]
    pub image_pull_secrets: Vec<LocalObjectReference>,
    #[serde(rename = "tolerations", skip_serializing_if = "Option::is_none")]
    pub tolerations: Option<Vec<Toleration>>,
    #[serde(rename = "nodeSelector", skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,
    #[serde(rename = "podAnnotations", skip_serializing_if = "Option::is_none")]
    pub pod_annotations: Option<BTreeMap<String, String>>,
    #[serde(rename = "hostNetwork", default)]
    pub host_network: bool,
    #[serde(rename = "dnsPolicy", skip_serializing_if = "Option::is_none")]
    pub dns_policy: Option<String>,
    #[serde(rename = "priorityClassName", default)]
    pub priority_class_name: String,
    #[serde(rename = "enabledPodAntiAffinity", default)]
    pub enabled_pod_anti_affinity: bool,
    #[serde(rename = "staticResources", default)]
    pub static_resources: Vec<StaticResource>,
}

// -----------------------------------------------------------------------------
// SentinelService structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct SentinelService {
    #[serde(rename = "enabled", default)]
    pub enabled: bool,
    #[serde(rename = "serviceAnnotations", skip_serializing_if = "Option::is_none")]
    pub service_annotations: Option<BTreeMap<String, String>>,
}

// -----------------------------------------------------------------------------
// SentinelSettings structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct SentinelSettings {
    #[serde(rename = "resources", default)]
    pub resources: ResourceRequirements,
    #[serde(rename = "customConfig", skip_serializing_if = "Option::is_none")]
    pub custom_config: Option<Vec<String>>,
    #[serde(rename = "service", default)]
    pub service: SentinelService,
    #[serde(rename = "image", default)]
    pub image: String,
    #[serde(rename = "updateStrategy", default)]
    pub update_strategy: StatefulSetUpdateStrategy,
    #[serde(rename = "imagePullPolicy", skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,
    #[serde(rename = "replicas", default)]
    pub replicas: i32,
    #[serde(rename = "command", default)]
    pub command: Vec<String>,
    #[serde(rename = "storage", default)]
    pub storage: Storage,
    #[serde(rename = "storageLog", default)]
    pub storage_log: Storage,
    #[serde(rename = "affinity", skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,
    #[serde(rename = "securityContext", skip_serializing_if = "Option::is_none")]
    pub security_context: Option<PodSecurityContext>,
    #[serde(rename = "imagePullSecrets", default)]
    pub image_pull_secrets: Vec<LocalObjectReference>,
    #[serde(rename = "tolerations", skip_serializing_if = "Option::is_none")]
    pub tolerations: Option<Vec<Toleration>>,
    #[serde(rename = "nodeSelector", skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,
    #[serde(rename = "podAnnotations", skip_serializing_if = "Option::is_none")]
    pub pod_annotations: Option<BTreeMap<String, String>>,
    #[serde(rename = "hostNetwork", default)]
    pub host_network: bool,
    #[serde(rename = "dnsPolicy", skip_serializing_if = "Option::is_none")]
    pub dns_policy: Option<String>,
    #[serde(rename = "priorityClassName", default)]
    pub priority_class_name: String,
    #[serde(rename = "enabledPodAntiAffinity", default)]
    pub enabled_pod_anti_affinity: bool,
    #[serde(rename = "staticResources", default)]
    pub static_resources: Vec<StaticResource>,
}

// -----------------------------------------------------------------------------
// ExporterSettings structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct ExporterSettings {
    #[serde(rename = "enabled", default)]
    pub enabled: bool,
    #[serde(rename = "image", default)]
    pub image: String,
    #[serde(rename = "imagePullPolicy", skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,
    #[serde(rename = "hostNetwork", default)]
    pub host_network: bool,
    #[serde(rename = "staticResource", default)]
    pub static_resource: StaticResource,
    #[serde(rename = "affinity", skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,
}

// -----------------------------------------------------------------------------
// Auth structures

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub enum PasswordEncodeType {
    #[default]
    #[serde(rename = "base64")]
    Base64,
    #[serde(rename = "sm4")]
    Sm4,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct Password {
    #[serde(rename = "encodeType", default)]
    pub encode_type: PasswordEncodeType,
    #[serde(rename = "value", default)]
    pub value: String,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct AuthSettings {
    #[serde(rename = "secretPath", default)]
    pub secret_path: String,
    #[serde(rename = "password", default)]
    pub password: Password,
}

// -----------------------------------------------------------------------------
// Spec structure

#[derive(CustomResource, JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
#[kube(group = "component.zhizuqiu")]
#[kube(version = "v1alpha1")]
#[kube(kind = "Redis")]
#[kube(singular = "redis")]
#[kube(plural = "redis")]
#[kube(status = "Status")]
#[kube(namespaced)]
#[kube(derive = "PartialEq")]
#[kube(derive = "Default")]
#[kube(
    printcolumn = r#"{"name":"Phase","type":"string","description":"Phase of instances in Redis","jsonPath":".status.state.phase"}"#
)]
#[kube(
    printcolumn = r#"{"name":"Ready","type":"boolean","description":"Ready status of instances in Redis","jsonPath":".status.state.ready"}"#
)]
#[kube(
    printcolumn = r#"{"name":"Cluster","type":"boolean","description":"Cluster status of instances in Redis","jsonPath":".status.state.cluster"}"#
)]
#[kube(
    printcolumn = r#"{"name":"Redis_Replicas","type":"integer","description":"Redis replicas of instances in Redis","jsonPath":".spec.redis.replicas"}"#
)]
#[kube(
    printcolumn = r#"{"name":"Sentinel_Replicas","type":"integer","description":"Sentinel replicas of instances in Redis","jsonPath":".spec.sentinel.replicas"}"#
)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
pub struct Spec {
    #[serde(rename = "redis", default)]
    pub redis: RedisSettings,
    #[serde(rename = "sentinel", default)]
    pub sentinel: SentinelSettings,
    #[serde(rename = "exporter", default)]
    pub exporter: ExporterSettings,
    #[serde(rename = "auth", default)]
    pub auth: AuthSettings,
}

// -----------------------------------------------------------------------------
// Status structures

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct Fingerprint {
    #[serde(rename = "md5", default)]
    pub md5: String,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct RedisState {
    #[serde(rename = "redisCustomConfig", default)]
    pub custom_config: Fingerprint,
    #[serde(rename = "redisPassword", default)]
    pub password: Fingerprint,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct SentinelState {
    #[serde(rename = "sentinelCustomConfig", default)]
    pub custom_config: Fingerprint,
    #[serde(rename = "sentinelPassword", default)]
    pub password: Fingerprint,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct ExporterState {}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct PodState {
    #[serde(rename = "name", default)]
    pub name: String,
    #[serde(rename = "role", default)]
    pub role: String,
    #[serde(rename = "phase", default)]
    pub phase: String,
    #[serde(rename = "hostIP", default)]
    pub host_ip: String,
    #[serde(rename = "podIP", default)]
    pub pod_ip: String,
    #[serde(rename = "containerPort", default)]
    pub container_port: i32,
    #[serde(rename = "podIPs", default)]
    pub pod_ips: Vec<PodIP>,
    #[serde(rename = "startTime", skip_serializing_if = "Option::is_none")]
    pub start_time: Option<Time>,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct ClusterState {
    #[serde(rename = "pods", default)]
    pub pods: BTreeMap<String, PodState>,
    #[serde(rename = "phase", default)]
    pub phase: String,
    #[serde(rename = "ready", default)]
    pub ready: bool,
    #[serde(rename = "cluster", default)]
    pub cluster: bool,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct Status {
    #[serde(rename = "redis", default)]
    pub redis: RedisState,
    #[serde(rename = "sentinel", default)]
    pub sentinel: SentinelState,
    #[serde(rename = "exporter", default)]
    pub exporter: ExporterState,
    #[serde(rename = "state", default)]
    pub state: ClusterState,
}

// -----------------------------------------------------------------------------
// ValidationError enum

#[derive(thiserror::Error, Debug)]
pub enum ValidationError {
    #[error("spec.redis.staticResources must be defined when spec.redis.hostNetwork is set")]
    MissingRedisStaticResources,
    #[error("spec.redis.staticResources must hold at least spec.redis.replicas entries")]
    NotEnoughRedisStaticResources,
    #[error("spec.sentinel.staticResources must be defined when spec.sentinel.hostNetwork is set")]
    MissingSentinelStaticResources,
    #[error("spec.sentinel.staticResources must hold at least spec.sentinel.replicas entries")]
    NotEnoughSentinelStaticResources,
    #[error(
        "spec.exporter.hostNetwork requires both spec.redis.hostNetwork and spec.sentinel.hostNetwork"
    )]
    ExporterHostNetwork,
}

// -----------------------------------------------------------------------------
// Redis implementation

impl Redis {
    /// validates the admission invariants of the resource, violations are
    /// terminal for the current reconcile
    pub fn check(&self) -> Result<(), ValidationError> {
        if self.spec.redis.host_network && self.spec.redis.replicas > 0 {
            if self.spec.redis.static_resources.is_empty() {
                return Err(ValidationError::MissingRedisStaticResources);
            }
            if (self.spec.redis.static_resources.len() as i32) < self.spec.redis.replicas {
                return Err(ValidationError::NotEnoughRedisStaticResources);
            }
        }

        if self.spec.sentinel.host_network && self.spec.sentinel.replicas > 0 {
            if self.spec.sentinel.static_resources.is_empty() {
                return Err(ValidationError::MissingSentinelStaticResources);
            }
            if (self.spec.sentinel.static_resources.len() as i32) < self.spec.sentinel.replicas {
                return Err(ValidationError::NotEnoughSentinelStaticResources);
            }
        }

        if (!self.spec.redis.host_network || !self.spec.sentinel.host_network)
            && self.spec.exporter.host_network
        {
            return Err(ValidationError::ExporterHostNetwork);
        }

        Ok(())
    }

    pub fn status_or_default(&self) -> Status {
        self.status.to_owned().unwrap_or_default()
    }
}

// -----------------------------------------------------------------------------
// ReconcilerError enum

#[derive(thiserror::Error, Debug)]
pub enum ReconcilerError {
    #[error("failed to reconcile resource, {0}")]
    Reconcile(String),
    #[error("failed to validate custom resource, {0}")]
    Validation(ValidationError),
    #[error("failed to execute request on kubernetes api, {0}")]
    KubeClient(kube::Error),
    #[error("failed to compute diff between the original and modified object, {0}")]
    Diff(serde_json::Error),
    #[error("failed to execute reconciliation pipeline, {0}")]
    Pipeline(ops::Error),
}

impl From<kube::Error> for ReconcilerError {
    fn from(err: kube::Error) -> Self {
        Self::KubeClient(err)
    }
}

impl From<ValidationError> for ReconcilerError {
    fn from(err: ValidationError) -> Self {
        Self::Validation(err)
    }
}

impl From<ops::Error> for ReconcilerError {
    fn from(err: ops::Error) -> Self {
        Self::Pipeline(err)
    }
}

impl From<controller::Error<Self, watcher::Error>> for ReconcilerError {
    fn from(err: controller::Error<ReconcilerError, watcher::Error>) -> Self {
        Self::Reconcile(err.to_string())
    }
}

// -----------------------------------------------------------------------------
// Reconciler structure

#[derive(Clone, Default, Debug)]
pub struct Reconciler {}

impl ControllerBuilder<Redis> for Reconciler {
    fn build(&self, context: Arc<Context>) -> Controller<Redis> {
        Controller::new(
            Api::all(context.kube.to_owned()),
            watcher::Config::default(),
        )
    }
}

#[async_trait]
impl k8s::Reconciler<Redis> for Reconciler {
    type Error = ReconcilerError;

    async fn upsert(ctx: Arc<Context>, origin: Arc<Redis>) -> Result<Action, ReconcilerError> {
        let Context { kube, config: _ } = ctx.as_ref();
        let (namespace, name) = resource::namespaced_name(&*origin);
        let pipeline = Pipeline::new(kube.to_owned());

        // ---------------------------------------------------------------------
        // Step 1: set finalizer

        let mut redis = (*origin).to_owned();
        if !finalizer::contains(&redis, manifest::REDIS_FINALIZER) {
            info!(
                namespace = &namespace,
                name = &name,
                "Set finalizer on custom resource"
            );

            let modified = finalizer::add(redis, manifest::REDIS_FINALIZER);
            let patch = resource::diff(&*origin, &modified).map_err(ReconcilerError::Diff)?;
            redis = resource::patch(kube.to_owned(), &modified, patch).await?;
        }

        // ---------------------------------------------------------------------
        // Step 2: validate admission invariants

        redis.check()?;

        // ---------------------------------------------------------------------
        // Step 3: ensure every child object matches the desired state

        let mut el = Element::new(redis);

        pipeline.ensure(&mut el).await?;

        // ---------------------------------------------------------------------
        // Step 4: audit the running cluster and heal divergences

        pipeline.check_and_heal(&mut el).await?;
        if !el.soft_errors().is_empty() {
            for soft in el.soft_errors() {
                warn!(
                    namespace = &namespace,
                    name = &name,
                    error = soft.to_string(),
                    "Recovery was performed or is pending, waiting next reconcile"
                );
            }

            return Ok(Action::requeue(ERROR_REQUEUE_AFTER));
        }

        // ---------------------------------------------------------------------
        // Step 5: record that all checks completed

        pipeline.check_cluster(&mut el, true).await?;

        Ok(Action::requeue(NORMAL_REQUEUE_AFTER))
    }

    async fn delete(ctx: Arc<Context>, origin: Arc<Redis>) -> Result<Action, ReconcilerError> {
        let Context { kube, config: _ } = ctx.as_ref();
        let (namespace, name) = resource::namespaced_name(&*origin);
        let pipeline = Pipeline::new(kube.to_owned());

        if finalizer::contains(&*origin, manifest::REDIS_FINALIZER) {
            // -----------------------------------------------------------------
            // Step 1: tear child objects down, in reverse dependency order

            info!(
                namespace = &namespace,
                name = &name,
                "Finalize custom resource"
            );

            let mut el = Element::new((*origin).to_owned());
            pipeline.delete_ensure(&mut el).await?;

            // -----------------------------------------------------------------
            // Step 2: remove the finalizer, kubernetes collects the resource

            info!(
                namespace = &namespace,
                name = &name,
                "Remove finalizer from custom resource"
            );

            let modified = finalizer::remove((*origin).to_owned(), manifest::REDIS_FINALIZER);
            let patch = resource::diff(&*origin, &modified).map_err(ReconcilerError::Diff)?;
            resource::patch(kube.to_owned(), &modified, patch).await?;
        }

        Ok(Action::requeue(NORMAL_REQUEUE_AFTER))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> Redis {
        let mut rf = Redis::new("redis-sample", Spec::default());

        rf.metadata.namespace = Some("redis-system".into());
        rf
    }

    #[test]
    fn test_check_accepts_default_spec() {
        assert!(fixture().check().is_ok());
    }

    #[test]
    fn test_check_requires_static_resources_with_host_network() {
        let mut rf = fixture();

        rf.spec.redis.host_network = true;
        rf.spec.redis.replicas = 2;

        assert!(matches!(
            rf.check(),
            Err(ValidationError::MissingRedisStaticResources)
        ));

        rf.spec.redis.static_resources = vec![StaticResource {
            host: "h1".into(),
            port: 7001,
        }];

        assert!(matches!(
            rf.check(),
            Err(ValidationError::NotEnoughRedisStaticResources)
        ));

        rf.spec.redis.static_resources.push(StaticResource {
            host: "h2".into(),
            port: 7002,
        });

        assert!(rf.check().is_ok());
    }

    #[test]
    fn test_check_requires_sentinel_static_resources_with_host_network() {
        let mut rf = fixture();

        rf.spec.sentinel.host_network = true;
        rf.spec.sentinel.replicas = 1;

        assert!(matches!(
            rf.check(),
            Err(ValidationError::MissingSentinelStaticResources)
        ));
    }

    #[test]
    fn test_check_rejects_exporter_host_network_without_cluster_host_network() {
        let mut rf = fixture();

        rf.spec.exporter.host_network = true;
        assert!(matches!(
            rf.check(),
            Err(ValidationError::ExporterHostNetwork)
        ));

        rf.spec.redis.host_network = true;
        rf.spec.sentinel.host_network = true;
        assert!(rf.check().is_ok());
    }

    #[test]
    fn test_password_encode_type_defaults_to_base64() {
        let password: Password = serde_json::from_str(r#"{"value": "cGFzcw=="}"#).unwrap();

        assert_eq!(password.encode_type, PasswordEncodeType::Base64);
    }

    #[test]
    fn test_status_wire_format() {
        let mut status = Status::default();

        status.redis.password.md5 = "1a1dc91c907325c69271ddf0c944bc72".into();

        let serialized = serde_json::to_value(&status).unwrap();

        assert_eq!(
            serialized["redis"]["redisPassword"]["md5"],
            "1a1dc91c907325c69271ddf0c944bc72"
        );
    }
}
