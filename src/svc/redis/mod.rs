//! # Redis module
//!
//! This module provide the typed client used to inspect and mutate the
//! managed redis and sentinel processes, on top of the in-pod command agent

use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::svc::redis::agent::RedisApi;

pub mod agent;

// -----------------------------------------------------------------------------
// Constants

pub const REDIS_DEFAULT_PORT: &str = "6379";

static SENTINEL_NUMBER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new("sentinels=([0-9]+)").expect("sentinels regex to be well formed")
});
static SENTINEL_STATUS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new("status=([a-z]+)").expect("status regex to be well formed"));
static SLAVE_NUMBER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new("slaves=([0-9]+)").expect("slaves regex to be well formed"));
static MASTER_HOST_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new("master_host:([0-9.]+)").expect("master host regex to be well formed"));

const ROLE_MASTER: &str = "role:master";

// -----------------------------------------------------------------------------
// Endpoint structure

/// the unit every check and heal operation addresses, one redis or sentinel
/// process running in one container of one pod
#[derive(PartialEq, Eq, Clone, Debug, Default)]
pub struct Endpoint {
    pub namespace: String,
    pub name: String,
    pub container: String,
    pub ip: String,
}

impl Endpoint {
    pub fn new(namespace: &str, name: &str, container: &str, ip: &str) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            container: container.into(),
            ip: ip.into(),
        }
    }
}

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to execute command in pod, {0}")]
    Agent(agent::Error),
    #[error("sentinels not ready")]
    SentinelNotReady,
    #[error("'{0}' not found in info output")]
    MissingCapture(&'static str),
    #[error("failed to parse number out of info output, {0}")]
    ParseNumber(std::num::ParseIntError),
    #[error("sentinel master answer misses the '{0}' field")]
    MalformedMonitor(&'static str),
    #[error("configuration '{0}' malformed")]
    MalformedConfig(String),
}

impl From<agent::Error> for Error {
    fn from(err: agent::Error) -> Self {
        Self::Agent(err)
    }
}

// -----------------------------------------------------------------------------
// Helpers

/// escapes every `$` of the given password so it survives the `sh -c`
/// composition unexpanded
pub fn escape_password(password: &str) -> String {
    password.replace('$', "\\$")
}

fn is_sentinel_ready(info: &str) -> Result<(), Error> {
    match SENTINEL_STATUS_RE
        .captures(info)
        .and_then(|captures| captures.get(1))
    {
        Some(status) if status.as_str() == "ok" => Ok(()),
        _ => Err(Error::SentinelNotReady),
    }
}

fn capture_number(re: &Regex, info: &str, name: &'static str) -> Result<i32, Error> {
    let capture = re
        .captures(info)
        .and_then(|captures| captures.get(1))
        .ok_or(Error::MissingCapture(name))?;

    capture.as_str().parse().map_err(Error::ParseNumber)
}

fn split_config_line(config: &str) -> Result<(String, String), Error> {
    let mut parts = config.split(' ');
    let parameter = parts.next().unwrap_or_default();
    let value = parts.collect::<Vec<_>>().join(" ");

    if parameter.is_empty() || value.is_empty() {
        return Err(Error::MalformedConfig(config.into()));
    }

    Ok((parameter.into(), value))
}

/// reads the `ip` and `port` fields out of the key/value array answered by
/// `SENTINEL master`
fn parse_monitor_target(output: &str) -> Result<(String, String), Error> {
    let lines: Vec<&str> = output.lines().collect();
    let field = |key: &'static str| -> Result<String, Error> {
        lines
            .chunks(2)
            .find(|pair| pair.first() == Some(&key))
            .and_then(|pair| pair.get(1))
            .map(|value| value.to_string())
            .ok_or(Error::MalformedMonitor(key))
    };

    Ok((field("ip")?, field("port")?))
}

// -----------------------------------------------------------------------------
// RedisClient trait

/// typed operations against the managed processes, the production variant
/// drives the exec agent, tests swap in a mock
#[async_trait]
pub trait RedisClient: Send + Sync {
    async fn sentinels_in_memory(&self, sentinel: &Endpoint) -> Result<i32, Error>;
    async fn sentinel_slaves_in_memory(&self, sentinel: &Endpoint) -> Result<i32, Error>;
    async fn reset_sentinel(&self, sentinel: &Endpoint) -> Result<(), Error>;
    async fn slave_master_host(
        &self,
        redis: &Endpoint,
        password: &str,
    ) -> Result<Option<String>, Error>;
    async fn is_master(&self, redis: &Endpoint, password: &str) -> Result<bool, Error>;
    async fn monitor_redis(
        &self,
        sentinel: &Endpoint,
        monitor_ip: &str,
        port: &str,
        quorum: &str,
        password: &str,
    ) -> Result<(), Error>;
    async fn make_master(&self, redis: &Endpoint, password: &str) -> Result<(), Error>;
    async fn make_slave_of(
        &self,
        redis: &Endpoint,
        password: &str,
        master_ip: &str,
        master_port: &str,
    ) -> Result<(), Error>;
    async fn sentinel_monitor_target(&self, sentinel: &Endpoint)
        -> Result<(String, String), Error>;
    async fn set_custom_sentinel_config(
        &self,
        sentinel: &Endpoint,
        configs: &[String],
    ) -> Result<(), Error>;
    async fn set_custom_redis_config(
        &self,
        redis: &Endpoint,
        configs: &[String],
        password: &str,
    ) -> Result<(), Error>;
    async fn set_redis_password(&self, redis: &Endpoint, new_password: &str) -> Result<(), Error>;
    async fn set_sentinel_password(
        &self,
        sentinel: &Endpoint,
        new_password: &str,
    ) -> Result<(), Error>;
    async fn redis_password(&self, redis: &Endpoint) -> Result<String, Error>;
}

// -----------------------------------------------------------------------------
// ExecClient structure

/// production [`RedisClient`] backed by the in-pod command agent
#[derive(Clone)]
pub struct ExecClient {
    api: Arc<dyn RedisApi>,
}

impl ExecClient {
    pub fn new(api: Arc<dyn RedisApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl RedisClient for ExecClient {
    async fn sentinels_in_memory(&self, sentinel: &Endpoint) -> Result<i32, Error> {
        let info = self.api.sentinel_info(sentinel, "sentinel").await?;

        is_sentinel_ready(&info)?;
        capture_number(&SENTINEL_NUMBER_RE, &info, "sentinels")
    }

    async fn sentinel_slaves_in_memory(&self, sentinel: &Endpoint) -> Result<i32, Error> {
        let info = self.api.sentinel_info(sentinel, "sentinel").await?;

        is_sentinel_ready(&info)?;
        capture_number(&SLAVE_NUMBER_RE, &info, "slaves")
    }

    async fn reset_sentinel(&self, sentinel: &Endpoint) -> Result<(), Error> {
        self.api.sentinel_reset(sentinel).await?;
        Ok(())
    }

    async fn slave_master_host(
        &self,
        redis: &Endpoint,
        password: &str,
    ) -> Result<Option<String>, Error> {
        let info = self.api.info(redis, password, "replication").await?;

        Ok(MASTER_HOST_RE
            .captures(&info)
            .and_then(|captures| captures.get(1))
            .map(|capture| capture.as_str().to_string()))
    }

    async fn is_master(&self, redis: &Endpoint, password: &str) -> Result<bool, Error> {
        let info = self.api.info(redis, password, "replication").await?;

        Ok(info.contains(ROLE_MASTER))
    }

    async fn monitor_redis(
        &self,
        sentinel: &Endpoint,
        monitor_ip: &str,
        port: &str,
        quorum: &str,
        password: &str,
    ) -> Result<(), Error> {
        self.api.sentinel_remove(sentinel).await?;
        self.api
            .sentinel_monitor(sentinel, monitor_ip, port, quorum)
            .await?;

        if !password.is_empty() {
            self.api.sentinel_set_auth_pass(sentinel, password).await?;
        }

        Ok(())
    }

    async fn make_master(&self, redis: &Endpoint, password: &str) -> Result<(), Error> {
        self.api.make_master(redis, password).await?;
        Ok(())
    }

    async fn make_slave_of(
        &self,
        redis: &Endpoint,
        password: &str,
        master_ip: &str,
        master_port: &str,
    ) -> Result<(), Error> {
        self.api
            .slave_of(redis, password, master_ip, master_port)
            .await?;
        Ok(())
    }

    async fn sentinel_monitor_target(
        &self,
        sentinel: &Endpoint,
    ) -> Result<(String, String), Error> {
        let output = self.api.sentinel_master(sentinel).await?;

        parse_monitor_target(&output)
    }

    async fn set_custom_sentinel_config(
        &self,
        sentinel: &Endpoint,
        configs: &[String],
    ) -> Result<(), Error> {
        for config in configs {
            let (parameter, value) = split_config_line(config)?;

            self.api
                .apply_sentinel_config(sentinel, &parameter, &value)
                .await?;
        }

        Ok(())
    }

    async fn set_custom_redis_config(
        &self,
        redis: &Endpoint,
        configs: &[String],
        password: &str,
    ) -> Result<(), Error> {
        for config in configs {
            let (parameter, value) = split_config_line(config)?;

            self.api
                .apply_redis_config(redis, password, &parameter, &value)
                .await?;
        }

        Ok(())
    }

    async fn set_redis_password(&self, redis: &Endpoint, new_password: &str) -> Result<(), Error> {
        let old_password = self.api.config_password(redis).await?;

        self.api
            .set_masterauth(redis, &old_password, new_password)
            .await?;
        self.api
            .set_requirepass(redis, &old_password, new_password)
            .await?;

        Ok(())
    }

    async fn set_sentinel_password(
        &self,
        sentinel: &Endpoint,
        new_password: &str,
    ) -> Result<(), Error> {
        self.api
            .sentinel_set_auth_pass(sentinel, new_password)
            .await?;
        Ok(())
    }

    async fn redis_password(&self, redis: &Endpoint) -> Result<String, Error> {
        let password = self.api.config_password(redis).await?;

        Ok(password.lines().next().unwrap_or_default().to_string())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use super::*;

    const SENTINEL_INFO_OK: &str = "# Sentinel\nsentinel_masters:1\nmaster0:name=mymaster,status=ok,address=10.0.0.1:6379,slaves=2,sentinels=3\n";
    const SENTINEL_INFO_DOWN: &str = "# Sentinel\nsentinel_masters:1\nmaster0:name=mymaster,status=odown,address=10.0.0.1:6379,slaves=2,sentinels=3\n";
    const REPLICATION_MASTER: &str =
        "# Replication\nrole:master\nconnected_slaves:2\nmaster_replid:abc\n";
    const REPLICATION_SLAVE: &str =
        "# Replication\nrole:slave\nmaster_host:10.0.0.1\nmaster_port:6379\n";

    /// canned-output [`RedisApi`] recording the issued calls
    #[derive(Default)]
    pub(crate) struct MockApi {
        pub info_output: String,
        pub sentinel_info_output: String,
        pub sentinel_master_output: String,
        pub config_password_output: String,
        pub calls: Mutex<Vec<String>>,
    }

    impl MockApi {
        fn record(&self, call: &str) {
            self.calls.lock().unwrap().push(call.to_string());
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().to_owned()
        }
    }

    #[async_trait]
    impl RedisApi for MockApi {
        async fn info(
            &self,
            _target: &Endpoint,
            _password: &str,
            section: &str,
        ) -> Result<String, agent::Error> {
            self.record(&format!("info {}", section));
            Ok(self.info_output.to_owned())
        }

        async fn make_master(
            &self,
            target: &Endpoint,
            _password: &str,
        ) -> Result<String, agent::Error> {
            self.record(&format!("make_master {}", target.name));
            Ok("OK".into())
        }

        async fn slave_of(
            &self,
            target: &Endpoint,
            _password: &str,
            master_ip: &str,
            master_port: &str,
        ) -> Result<String, agent::Error> {
            self.record(&format!("slave_of {} {} {}", target.name, master_ip, master_port));
            Ok("OK".into())
        }

        async fn sentinel_master(&self, _target: &Endpoint) -> Result<String, agent::Error> {
            self.record("sentinel_master");
            Ok(self.sentinel_master_output.to_owned())
        }

        async fn sentinel_remove(&self, _target: &Endpoint) -> Result<String, agent::Error> {
            self.record("sentinel_remove");
            Ok("OK".into())
        }

        async fn sentinel_monitor(
            &self,
            _target: &Endpoint,
            monitor_ip: &str,
            port: &str,
            quorum: &str,
        ) -> Result<String, agent::Error> {
            self.record(&format!("sentinel_monitor {} {} {}", monitor_ip, port, quorum));
            Ok("OK".into())
        }

        async fn sentinel_set_auth_pass(
            &self,
            _target: &Endpoint,
            password: &str,
        ) -> Result<String, agent::Error> {
            self.record(&format!("sentinel_set_auth_pass {}", password));
            Ok("OK".into())
        }

        async fn sentinel_info(
            &self,
            _target: &Endpoint,
            _section: &str,
        ) -> Result<String, agent::Error> {
            self.record("sentinel_info");
            Ok(self.sentinel_info_output.to_owned())
        }

        async fn sentinel_reset(&self, _target: &Endpoint) -> Result<String, agent::Error> {
            self.record("sentinel_reset");
            Ok("1".into())
        }

        async fn apply_redis_config(
            &self,
            _target: &Endpoint,
            _password: &str,
            parameter: &str,
            value: &str,
        ) -> Result<String, agent::Error> {
            self.record(&format!("apply_redis_config {} {}", parameter, value));
            Ok("OK".into())
        }

        async fn apply_sentinel_config(
            &self,
            _target: &Endpoint,
            parameter: &str,
            value: &str,
        ) -> Result<String, agent::Error> {
            self.record(&format!("apply_sentinel_config {} {}", parameter, value));
            Ok("OK".into())
        }

        async fn rewrite_config(
            &self,
            _target: &Endpoint,
            _password: &str,
        ) -> Result<String, agent::Error> {
            self.record("rewrite_config");
            Ok("OK".into())
        }

        async fn config_password(&self, _target: &Endpoint) -> Result<String, agent::Error> {
            self.record("config_password");
            Ok(self.config_password_output.to_owned())
        }

        async fn set_masterauth(
            &self,
            _target: &Endpoint,
            old_password: &str,
            new_password: &str,
        ) -> Result<String, agent::Error> {
            self.record(&format!("set_masterauth {} {}", old_password, new_password));
            Ok("OK".into())
        }

        async fn set_requirepass(
            &self,
            _target: &Endpoint,
            old_password: &str,
            new_password: &str,
        ) -> Result<String, agent::Error> {
            self.record(&format!("set_requirepass {} {}", old_password, new_password));
            Ok("OK".into())
        }
    }

    fn endpoint() -> Endpoint {
        Endpoint::new("redis-system", "redis-redis-sample-0-0", "redis", "10.0.0.1")
    }

    #[test]
    fn test_escape_password() {
        assert_eq!(escape_password("HyxfHdIpiCui4jA"), "HyxfHdIpiCui4jA");
        assert_eq!(escape_password("HyxfHdIpiCui4j$A"), "HyxfHdIpiCui4j\\$A");
        assert_eq!(escape_password("$A"), "\\$A");
        assert_eq!(escape_password("$"), "\\$");
        assert_eq!(escape_password(""), "");
    }

    #[tokio::test]
    async fn test_sentinels_in_memory() {
        let client = ExecClient::new(Arc::new(MockApi {
            sentinel_info_output: SENTINEL_INFO_OK.into(),
            ..Default::default()
        }));

        assert_eq!(client.sentinels_in_memory(&endpoint()).await.unwrap(), 3);
        assert_eq!(
            client.sentinel_slaves_in_memory(&endpoint()).await.unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn test_sentinels_in_memory_requires_ok_status() {
        let client = ExecClient::new(Arc::new(MockApi {
            sentinel_info_output: SENTINEL_INFO_DOWN.into(),
            ..Default::default()
        }));

        assert!(matches!(
            client.sentinels_in_memory(&endpoint()).await,
            Err(Error::SentinelNotReady)
        ));
    }

    #[tokio::test]
    async fn test_is_master() {
        let client = ExecClient::new(Arc::new(MockApi {
            info_output: REPLICATION_MASTER.into(),
            ..Default::default()
        }));

        assert!(client.is_master(&endpoint(), "").await.unwrap());

        let client = ExecClient::new(Arc::new(MockApi {
            info_output: REPLICATION_SLAVE.into(),
            ..Default::default()
        }));

        assert!(!client.is_master(&endpoint(), "").await.unwrap());
    }

    #[tokio::test]
    async fn test_slave_master_host() {
        let client = ExecClient::new(Arc::new(MockApi {
            info_output: REPLICATION_SLAVE.into(),
            ..Default::default()
        }));

        assert_eq!(
            client.slave_master_host(&endpoint(), "").await.unwrap(),
            Some("10.0.0.1".to_string())
        );

        let client = ExecClient::new(Arc::new(MockApi {
            info_output: REPLICATION_MASTER.into(),
            ..Default::default()
        }));

        assert_eq!(client.slave_master_host(&endpoint(), "").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sentinel_monitor_target() {
        let client = ExecClient::new(Arc::new(MockApi {
            sentinel_master_output:
                "name\nmymaster\nip\n10.0.0.1\nport\n6379\nrunid\nabc\nflags\nmaster\n".into(),
            ..Default::default()
        }));

        assert_eq!(
            client.sentinel_monitor_target(&endpoint()).await.unwrap(),
            ("10.0.0.1".to_string(), "6379".to_string())
        );
    }

    #[tokio::test]
    async fn test_monitor_redis_sets_auth_pass_last() {
        let api = Arc::new(MockApi::default());
        let client = ExecClient::new(api.to_owned());

        client
            .monitor_redis(&endpoint(), "10.0.0.1", "6379", "2", "pass")
            .await
            .unwrap();

        assert_eq!(
            api.calls(),
            vec![
                "sentinel_remove",
                "sentinel_monitor 10.0.0.1 6379 2",
                "sentinel_set_auth_pass pass"
            ]
        );
    }

    #[tokio::test]
    async fn test_monitor_redis_without_password() {
        let api = Arc::new(MockApi::default());
        let client = ExecClient::new(api.to_owned());

        client
            .monitor_redis(&endpoint(), "10.0.0.1", "6379", "2", "")
            .await
            .unwrap();

        assert_eq!(
            api.calls(),
            vec!["sentinel_remove", "sentinel_monitor 10.0.0.1 6379 2"]
        );
    }

    #[tokio::test]
    async fn test_set_redis_password_order() {
        let api = Arc::new(MockApi {
            config_password_output: "old".into(),
            ..Default::default()
        });
        let client = ExecClient::new(api.to_owned());

        client.set_redis_password(&endpoint(), "new").await.unwrap();

        assert_eq!(
            api.calls(),
            vec![
                "config_password",
                "set_masterauth old new",
                "set_requirepass old new"
            ]
        );
    }

    #[tokio::test]
    async fn test_set_custom_redis_config() {
        let api = Arc::new(MockApi::default());
        let client = ExecClient::new(api.to_owned());

        client
            .set_custom_redis_config(
                &endpoint(),
                &["maxmemory 1gb".to_string(), "save 900 1".to_string()],
                "",
            )
            .await
            .unwrap();

        assert_eq!(
            api.calls(),
            vec!["apply_redis_config maxmemory 1gb", "apply_redis_config save 900 1"]
        );
    }

    #[tokio::test]
    async fn test_set_custom_config_rejects_malformed_line() {
        let client = ExecClient::new(Arc::new(MockApi::default()));

        assert!(matches!(
            client
                .set_custom_redis_config(&endpoint(), &["maxmemory".to_string()], "")
                .await,
            Err(Error::MalformedConfig(_))
        ));
    }
}
