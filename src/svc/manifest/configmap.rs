//! # ConfigMap manifests
//!
//! This module render the redis and sentinel configuration files and wrap
//! them into the config maps mounted by the statefulsets

use std::collections::BTreeMap;

use k8s_openapi::{
    api::core::v1::ConfigMap, apimachinery::pkg::apis::meta::v1::ObjectMeta,
    apimachinery::pkg::apis::meta::v1::OwnerReference,
};

use crate::svc::{crd::redis::Redis, manifest};

// -----------------------------------------------------------------------------
// Configuration file templates

const REDIS_CONFIG_TEMPLATE: &str = r#"protected-mode no
pidfile /redis/redis.pid
dir /data/
loglevel notice
logfile /redislog/redis.log
appendonly yes
appendfilename "appendonly.aof"
client-output-buffer-limit normal 0 0 0
client-output-buffer-limit slave 0 0 0
client-output-buffer-limit pubsub 33554432 8388608 60
repl-backlog-size 1048576000
tcp-keepalive 60
repl-timeout 300
slave-priority 50
timeout 600
"#;

const SENTINEL_CONFIG_STANZA: &str = r#"sentinel down-after-milliseconds mymaster 1000
sentinel failover-timeout mymaster 3000
sentinel parallel-syncs mymaster 2
protected-mode no
loglevel notice
logfile /redislog/redis.log
timeout 600"#;

const READINESS_SCRIPT: &str = r#"ROLE="role"
ROLE_MASTER="role:master"
ROLE_SLAVE="role:slave"
IN_SYNC="master_sync_in_progress:1"
NO_MASTER="master_host:127.0.0.1"

function getPass(){
    local password=$(cat /data/conf/redis.conf | grep requirepass | awk -F\" '{print $2}')
    echo "$password"
}

function getPort(){
    local port=$(cat /data/conf/redis.conf | grep port | awk '{print $2}')
    echo "$port"
}

REDIS_PASSWORD="$(getPass)"
REDIS_PORT="$(getPort)"

check_master(){
        exit 0
}

check_slave(){
        in_sync=$(redis-cli -p "${REDIS_PORT}" --no-auth-warning -a "${REDIS_PASSWORD}" info replication | grep $IN_SYNC | tr -d "\r" | tr -d "\n")
        no_master=$(redis-cli -p "${REDIS_PORT}" --no-auth-warning -a "${REDIS_PASSWORD}" info replication | grep $NO_MASTER | tr -d "\r" | tr -d "\n")

        if [ -z "$in_sync" ] && [ -z "$no_master" ]; then
                exit 0
        fi

        exit 1
}

role=$(redis-cli -p "${REDIS_PORT}" --no-auth-warning -a "${REDIS_PASSWORD}" info replication | grep $ROLE | tr -d "\r" | tr -d "\n")

case $role in
        $ROLE_MASTER)
                check_master
                ;;
        $ROLE_SLAVE)
                check_slave
                ;;
        *)
                echo "unespected"
                exit 1
esac"#;

// -----------------------------------------------------------------------------
// Renderers

fn redis_config_base(rf: &Redis) -> String {
    let mut content = REDIS_CONFIG_TEMPLATE.to_string();

    for rename in &rf.spec.redis.custom_command_renames {
        content.push_str(&format!(
            "rename-command \"{}\" \"{}\"\n",
            rename.from, rename.to
        ));
    }

    content
}

/// renders the configuration file of the redis process at the given index,
/// every index but 0 boots as a replica of the declared master
pub fn render_redis_config(rf: &Redis, password: &str, index: i32) -> String {
    let mut content = redis_config_base(rf);
    let (master_ip, master_port) = manifest::master_ip_and_port(rf);

    if index != 0 {
        content = format!("replicaof {} {}\n{}", master_ip, master_port, content);
    }

    let port = if index == 0 {
        master_port
    } else {
        manifest::redis_port(rf, index)
    };
    content = format!("port {}\n{}", port, content);

    if !password.is_empty() {
        content = format!(
            "{}\nmasterauth \"{}\"\nrequirepass \"{}\"",
            content, password, password
        );
    }

    content
}

/// renders the configuration file of the sentinel process at the given index
pub fn render_sentinel_config(rf: &Redis, password: &str, index: i32) -> String {
    let quorum = manifest::quorum(rf);
    let (master_ip, master_port) = manifest::master_ip_and_port(rf);

    let mut content = format!(
        "sentinel monitor {} {} {} {}\n{}",
        manifest::REDIS_GROUP_NAME,
        master_ip,
        master_port,
        quorum,
        SENTINEL_CONFIG_STANZA
    );

    content = format!("port {}\n{}", manifest::sentinel_port(rf, index), content);

    if !password.is_empty() {
        content = format!(
            "{}\nsentinel auth-pass {} \"{}\"",
            content,
            manifest::REDIS_GROUP_NAME,
            password
        );
    }

    content
}

// -----------------------------------------------------------------------------
// Builders

fn config_map(
    name: String,
    namespace: String,
    labels: BTreeMap<String, String>,
    owner_refs: &[OwnerReference],
    data: BTreeMap<String, String>,
) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace),
            labels: Some(labels),
            owner_references: Some(owner_refs.to_vec()),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    }
}

pub fn redis_config_map(
    rf: &Redis,
    owner_refs: &[OwnerReference],
    password: &str,
    index: i32,
) -> ConfigMap {
    let mut data = BTreeMap::new();

    data.insert(
        manifest::REDIS_CONFIG_FILE_NAME.into(),
        render_redis_config(rf, password, index),
    );

    config_map(
        manifest::redis_config_map_name(rf, index),
        manifest::rf_namespace(rf),
        manifest::redis_labels(rf),
        owner_refs,
        data,
    )
}

/// carries the rendered configuration over to an already existing config map,
/// only the data is owned by the operator
pub fn redis_config_map_from_existing(
    rf: &Redis,
    password: &str,
    existing: &ConfigMap,
    index: i32,
) -> ConfigMap {
    let mut desired = existing.to_owned();
    let mut data = BTreeMap::new();

    data.insert(
        manifest::REDIS_CONFIG_FILE_NAME.into(),
        render_redis_config(rf, password, index),
    );
    desired.data = Some(data);
    desired
}

pub fn sentinel_config_map(
    rf: &Redis,
    owner_refs: &[OwnerReference],
    password: &str,
    index: i32,
) -> ConfigMap {
    let mut data = BTreeMap::new();

    data.insert(
        manifest::SENTINEL_CONFIG_FILE_NAME.into(),
        render_sentinel_config(rf, password, index),
    );

    config_map(
        manifest::sentinel_config_map_name(rf, index),
        manifest::rf_namespace(rf),
        manifest::sentinel_labels(rf),
        owner_refs,
        data,
    )
}

pub fn sentinel_config_map_from_existing(
    rf: &Redis,
    password: &str,
    existing: &ConfigMap,
    index: i32,
) -> ConfigMap {
    let mut desired = existing.to_owned();
    let mut data = BTreeMap::new();

    data.insert(
        manifest::SENTINEL_CONFIG_FILE_NAME.into(),
        render_sentinel_config(rf, password, index),
    );
    desired.data = Some(data);
    desired
}

pub fn readiness_config_map(rf: &Redis, owner_refs: &[OwnerReference]) -> ConfigMap {
    let mut data = BTreeMap::new();

    data.insert("ready.sh".into(), READINESS_SCRIPT.into());

    config_map(
        manifest::readiness_config_map_name(rf),
        manifest::rf_namespace(rf),
        manifest::readiness_config_map_labels(rf),
        owner_refs,
        data,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::svc::crd::redis::{CommandRename, Spec, StaticResource};

    fn fixture() -> Redis {
        let mut rf = Redis::new("redis-sample", Spec::default());

        rf.metadata.namespace = Some("redis-system".into());
        rf.spec.redis.replicas = 3;
        rf.spec.sentinel.replicas = 3;
        rf
    }

    #[test]
    fn test_render_sentinel_config() {
        let content = render_sentinel_config(&fixture(), "", 0);

        assert!(content.starts_with("port 26379\n"));
        assert!(content.contains("sentinel monitor mymaster 127.0.0.1 6379 2\n"));
        assert!(content.contains("sentinel down-after-milliseconds mymaster 1000"));
        assert!(!content.contains("auth-pass"));
    }

    #[test]
    fn test_render_sentinel_config_with_password() {
        let content = render_sentinel_config(&fixture(), "pass", 0);

        assert!(content.ends_with("sentinel auth-pass mymaster \"pass\""));
    }

    #[test]
    fn test_render_redis_master_config() {
        let content = render_redis_config(&fixture(), "", 0);

        assert!(content.starts_with("port 6379\n"));
        assert!(!content.contains("replicaof"));
        assert!(content.contains("appendonly yes"));
    }

    #[test]
    fn test_render_redis_slave_config() {
        let content = render_redis_config(&fixture(), "", 1);

        assert!(content.starts_with("port 6379\nreplicaof 127.0.0.1 6379\n"));
    }

    #[test]
    fn test_render_redis_config_with_password() {
        let content = render_redis_config(&fixture(), "pass", 0);

        assert!(content.ends_with("masterauth \"pass\"\nrequirepass \"pass\""));
    }

    #[test]
    fn test_render_redis_config_with_static_resources() {
        let mut rf = fixture();

        rf.spec.redis.host_network = true;
        rf.spec.redis.replicas = 2;
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

        let master = render_redis_config(&rf, "", 0);
        assert!(master.starts_with("port 7001\n"));

        let slave = render_redis_config(&rf, "", 1);
        assert!(slave.starts_with("port 7002\nreplicaof h1 7001\n"));
    }

    #[test]
    fn test_render_redis_config_with_command_renames() {
        let mut rf = fixture();

        rf.spec.redis.custom_command_renames = vec![CommandRename {
            from: "FLUSHALL".into(),
            to: "DISABLED_FLUSHALL".into(),
        }];

        let content = render_redis_config(&rf, "", 0);

        assert!(content.contains("rename-command \"FLUSHALL\" \"DISABLED_FLUSHALL\"\n"));
    }

    #[test]
    fn test_config_map_objects() {
        let rf = fixture();
        let cm = sentinel_config_map(&rf, &[], "", 1);

        assert_eq!(cm.metadata.name.as_deref(), Some("sentinel-redis-sample-1"));
        assert_eq!(cm.metadata.namespace.as_deref(), Some("redis-system"));
        assert!(cm.data.unwrap().contains_key("sentinel.conf"));

        let cm = readiness_config_map(&rf, &[]);
        assert_eq!(
            cm.metadata.name.as_deref(),
            Some("redis-readiness-redis-sample")
        );
        assert!(cm.data.unwrap().contains_key("ready.sh"));
    }
}
