//! # Agent module
//!
//! This module compose `redis-cli` command lines and execute them inside the
//! target containers through the kubernetes exec subresource. Ports are never
//! assumed, every command resolves them from the writable configuration file
//! of the pod it runs in.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::{api::AttachParams, Api, Client};
use tokio::io::AsyncReadExt;
use tracing::{error, warn};

use crate::svc::{
    manifest,
    redis::{escape_password, Endpoint},
};

// -----------------------------------------------------------------------------
// Constants

const REDIS_PORT_EXPORT: &str =
    "export REDIS_PORT=$(cat /data/conf/redis.conf | grep port | awk '{print $2}') && ";
const SENTINEL_PORT_EXPORT: &str =
    "export REDIS_PORT=$(cat /data/conf/sentinel.conf | grep port | awk '{print $2}') && ";

const SENTINEL_REMOVE_IGNORABLE: &str = "ERR No such master with that name";

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to open exec channel into pod '{0}/{1}', {2}")]
    Exec(String, String, kube::Error),
    #[error("failed to read command output from pod '{0}/{1}', {2}")]
    Output(String, String, std::io::Error),
    #[error("{0} err: {1}")]
    UnexpectedOutput(&'static str, String),
}

// -----------------------------------------------------------------------------
// Output predicates

fn first_line(output: &str) -> &str {
    output.lines().next().unwrap_or_default()
}

fn is_ok(output: &str) -> bool {
    first_line(output) == "OK"
}

fn is_slave_of_ok(output: &str) -> bool {
    first_line(output).starts_with("OK")
}

fn is_sentinel_master_ok(output: &str) -> bool {
    first_line(output) == "name"
}

fn is_sentinel_remove_ignorable(output: &str) -> bool {
    let line = first_line(output);

    line == "OK" || line == SENTINEL_REMOVE_IGNORABLE
}

fn has_been_reset(output: &str) -> bool {
    let line = first_line(output);

    !line.is_empty() && line.chars().all(|c| c.is_ascii_digit())
}

// -----------------------------------------------------------------------------
// Command composition

fn redis_cli(password: &str, args: &str) -> String {
    let password = escape_password(password);
    if password.is_empty() {
        format!("{}redis-cli -p \"${{REDIS_PORT}}\" {}", REDIS_PORT_EXPORT, args)
    } else {
        format!(
            "{}redis-cli -p \"${{REDIS_PORT}}\" --no-auth-warning -a {} {}",
            REDIS_PORT_EXPORT, password, args
        )
    }
}

fn sentinel_cli(args: &str) -> String {
    format!(
        "{}redis-cli -p \"${{REDIS_PORT}}\" {}",
        SENTINEL_PORT_EXPORT, args
    )
}

// -----------------------------------------------------------------------------
// RedisApi trait

/// raw command surface against one redis or sentinel process, the production
/// variant execs into the pod, tests provide canned outputs
#[async_trait]
pub trait RedisApi: Send + Sync {
    async fn info(&self, target: &Endpoint, password: &str, section: &str)
        -> Result<String, Error>;
    async fn make_master(&self, target: &Endpoint, password: &str) -> Result<String, Error>;
    async fn slave_of(
        &self,
        target: &Endpoint,
        password: &str,
        master_ip: &str,
        master_port: &str,
    ) -> Result<String, Error>;
    async fn sentinel_master(&self, target: &Endpoint) -> Result<String, Error>;
    async fn sentinel_remove(&self, target: &Endpoint) -> Result<String, Error>;
    async fn sentinel_monitor(
        &self,
        target: &Endpoint,
        monitor_ip: &str,
        port: &str,
        quorum: &str,
    ) -> Result<String, Error>;
    async fn sentinel_set_auth_pass(
        &self,
        target: &Endpoint,
        password: &str,
    ) -> Result<String, Error>;
    async fn sentinel_info(&self, target: &Endpoint, section: &str) -> Result<String, Error>;
    async fn sentinel_reset(&self, target: &Endpoint) -> Result<String, Error>;
    async fn apply_redis_config(
        &self,
        target: &Endpoint,
        password: &str,
        parameter: &str,
        value: &str,
    ) -> Result<String, Error>;
    async fn apply_sentinel_config(
        &self,
        target: &Endpoint,
        parameter: &str,
        value: &str,
    ) -> Result<String, Error>;
    async fn rewrite_config(&self, target: &Endpoint, password: &str) -> Result<String, Error>;
    async fn config_password(&self, target: &Endpoint) -> Result<String, Error>;
    async fn set_masterauth(
        &self,
        target: &Endpoint,
        old_password: &str,
        new_password: &str,
    ) -> Result<String, Error>;
    async fn set_requirepass(
        &self,
        target: &Endpoint,
        old_password: &str,
        new_password: &str,
    ) -> Result<String, Error>;
}

// -----------------------------------------------------------------------------
// ExecApi structure

/// executes composed shell commands inside the target container over the
/// kubernetes exec subresource
#[derive(Clone)]
pub struct ExecApi {
    kube: Client,
}

impl ExecApi {
    pub fn new(kube: Client) -> Self {
        Self { kube }
    }

    async fn exec(&self, target: &Endpoint, command: &str) -> Result<String, Error> {
        let api: Api<Pod> = Api::namespaced(self.kube.to_owned(), &target.namespace);

        let mut params = AttachParams::default()
            .stdin(false)
            .stdout(true)
            .stderr(true);
        if !target.container.is_empty() {
            params = params.container(&target.container);
        }

        let mut process = api
            .exec(&target.name, vec!["sh", "-c", command], &params)
            .await
            .map_err(|err| Error::Exec(target.namespace.to_owned(), target.name.to_owned(), err))?;

        let mut stdout_reader = process.stdout();
        let mut stderr_reader = process.stderr();

        let stdout_fut = async {
            let mut buffer = String::new();
            if let Some(reader) = stdout_reader.as_mut() {
                reader.read_to_string(&mut buffer).await?;
            }
            Ok::<String, std::io::Error>(buffer)
        };
        let stderr_fut = async {
            let mut buffer = String::new();
            if let Some(reader) = stderr_reader.as_mut() {
                reader.read_to_string(&mut buffer).await?;
            }
            Ok::<String, std::io::Error>(buffer)
        };

        let (stdout, stderr) = tokio::join!(stdout_fut, stderr_fut);
        let stdout = stdout
            .map_err(|err| Error::Output(target.namespace.to_owned(), target.name.to_owned(), err))?;
        let stderr = stderr
            .map_err(|err| Error::Output(target.namespace.to_owned(), target.name.to_owned(), err))?;

        if let Some(status) = process.take_status() {
            let _ = status.await;
        }

        if !stderr.is_empty() {
            warn!(
                namespace = &target.namespace,
                name = &target.name,
                container = &target.container,
                stderr = &stderr,
                "Command wrote to the standard error stream"
            );
        }

        Ok(stdout)
    }

    /// `CONFIG REWRITE` after a mutation is best effort, a failed rewrite is
    /// logged but does not fail the step
    async fn rewrite_best_effort(&self, target: &Endpoint, password: &str) {
        if let Err(err) = self.rewrite_config(target, password).await {
            error!(
                namespace = &target.namespace,
                name = &target.name,
                error = err.to_string(),
                "Failed to rewrite configuration file"
            );
        }
    }
}

#[async_trait]
impl RedisApi for ExecApi {
    async fn info(
        &self,
        target: &Endpoint,
        password: &str,
        section: &str,
    ) -> Result<String, Error> {
        self.exec(target, &redis_cli(password, &format!("info {}", section)))
            .await
    }

    async fn make_master(&self, target: &Endpoint, password: &str) -> Result<String, Error> {
        let output = self.exec(target, &redis_cli(password, "SLAVEOF NO ONE")).await?;

        if !is_ok(&output) {
            return Err(Error::UnexpectedOutput("SLAVEOF NO ONE", output));
        }

        self.rewrite_best_effort(target, password).await;
        Ok(output)
    }

    async fn slave_of(
        &self,
        target: &Endpoint,
        password: &str,
        master_ip: &str,
        master_port: &str,
    ) -> Result<String, Error> {
        let command = redis_cli(password, &format!("SLAVEOF {} {}", master_ip, master_port));
        let output = self.exec(target, &command).await?;

        if !is_slave_of_ok(&output) {
            return Err(Error::UnexpectedOutput("SLAVEOF", output));
        }

        self.rewrite_best_effort(target, password).await;
        Ok(output)
    }

    async fn sentinel_master(&self, target: &Endpoint) -> Result<String, Error> {
        let command = sentinel_cli(&format!("SENTINEL master {}", manifest::REDIS_GROUP_NAME));
        let output = self.exec(target, &command).await?;

        if !is_sentinel_master_ok(&output) {
            return Err(Error::UnexpectedOutput("SENTINEL master", output));
        }

        Ok(output)
    }

    async fn sentinel_remove(&self, target: &Endpoint) -> Result<String, Error> {
        let command = sentinel_cli(&format!("SENTINEL REMOVE {}", manifest::REDIS_GROUP_NAME));
        let output = self.exec(target, &command).await?;

        if !is_sentinel_remove_ignorable(&output) {
            return Err(Error::UnexpectedOutput("SENTINEL REMOVE", output));
        }

        Ok(output)
    }

    async fn sentinel_monitor(
        &self,
        target: &Endpoint,
        monitor_ip: &str,
        port: &str,
        quorum: &str,
    ) -> Result<String, Error> {
        let command = sentinel_cli(&format!(
            "SENTINEL MONITOR {} {} {} {}",
            manifest::REDIS_GROUP_NAME,
            monitor_ip,
            port,
            quorum
        ));
        let output = self.exec(target, &command).await?;

        if !is_ok(&output) {
            return Err(Error::UnexpectedOutput("SENTINEL MONITOR", output));
        }

        Ok(output)
    }

    async fn sentinel_set_auth_pass(
        &self,
        target: &Endpoint,
        password: &str,
    ) -> Result<String, Error> {
        let command = sentinel_cli(&format!(
            "SENTINEL SET {} auth-pass \"{}\"",
            manifest::REDIS_GROUP_NAME,
            escape_password(password)
        ));
        let output = self.exec(target, &command).await?;

        if !is_ok(&output) {
            return Err(Error::UnexpectedOutput("SENTINEL SET auth-pass", output));
        }

        Ok(output)
    }

    async fn sentinel_info(&self, target: &Endpoint, section: &str) -> Result<String, Error> {
        self.exec(target, &sentinel_cli(&format!("info {}", section)))
            .await
    }

    async fn sentinel_reset(&self, target: &Endpoint) -> Result<String, Error> {
        let output = self.exec(target, &sentinel_cli("SENTINEL reset \"*\"")).await?;

        if !has_been_reset(&output) {
            return Err(Error::UnexpectedOutput("SENTINEL reset *", output));
        }

        Ok(output)
    }

    async fn apply_redis_config(
        &self,
        target: &Endpoint,
        password: &str,
        parameter: &str,
        value: &str,
    ) -> Result<String, Error> {
        let command = redis_cli(password, &format!("CONFIG SET {} {}", parameter, value));
        let output = self.exec(target, &command).await?;

        if !is_ok(&output) {
            return Err(Error::UnexpectedOutput("CONFIG SET", output));
        }

        // a fresh requirepass must authenticate its own rewrite
        if parameter == "requirepass" {
            self.rewrite_best_effort(target, value).await;
        } else {
            self.rewrite_best_effort(target, password).await;
        }

        Ok(output)
    }

    async fn apply_sentinel_config(
        &self,
        target: &Endpoint,
        parameter: &str,
        value: &str,
    ) -> Result<String, Error> {
        let command = sentinel_cli(&format!(
            "SENTINEL SET {} {} {}",
            manifest::REDIS_GROUP_NAME,
            parameter,
            value
        ));
        let output = self.exec(target, &command).await?;

        if !is_ok(&output) {
            return Err(Error::UnexpectedOutput("SENTINEL SET", output));
        }

        Ok(output)
    }

    async fn rewrite_config(&self, target: &Endpoint, password: &str) -> Result<String, Error> {
        let output = self.exec(target, &redis_cli(password, "CONFIG REWRITE")).await?;

        if !is_ok(&output) {
            return Err(Error::UnexpectedOutput("CONFIG REWRITE", output));
        }

        Ok(output)
    }

    async fn config_password(&self, target: &Endpoint) -> Result<String, Error> {
        let command = format!(
            "cat {} | grep requirepass | awk -F\\\" '{{print $2}}'",
            manifest::redis_config_writable_path()
        );
        let output = self.exec(target, &command).await?;

        Ok(first_line(&output).to_string())
    }

    async fn set_masterauth(
        &self,
        target: &Endpoint,
        old_password: &str,
        new_password: &str,
    ) -> Result<String, Error> {
        let command = redis_cli(
            old_password,
            &format!("CONFIG SET masterauth \"{}\"", escape_password(new_password)),
        );
        let output = self.exec(target, &command).await?;

        if !is_ok(&output) {
            return Err(Error::UnexpectedOutput("CONFIG SET masterauth", output));
        }

        self.rewrite_best_effort(target, old_password).await;
        Ok(output)
    }

    async fn set_requirepass(
        &self,
        target: &Endpoint,
        old_password: &str,
        new_password: &str,
    ) -> Result<String, Error> {
        let command = redis_cli(
            old_password,
            &format!("CONFIG SET requirepass \"{}\"", escape_password(new_password)),
        );
        let output = self.exec(target, &command).await?;

        if !is_ok(&output) {
            return Err(Error::UnexpectedOutput("CONFIG SET requirepass", output));
        }

        // the rewrite authenticates with the freshly installed password
        self.rewrite_best_effort(target, new_password).await;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_ok() {
        assert!(is_ok("OK"));
        assert!(is_ok("OK\n"));
        assert!(!is_ok(""));
        assert!(!is_ok("ERR unknown command"));
        assert!(!is_ok("NOT OK"));
    }

    #[test]
    fn test_is_slave_of_ok() {
        assert!(is_slave_of_ok("OK"));
        assert!(is_slave_of_ok("OK Already connected to specified master"));
        assert!(!is_slave_of_ok("ERR OK"));
        assert!(!is_slave_of_ok(""));
    }

    #[test]
    fn test_is_sentinel_master_ok() {
        assert!(is_sentinel_master_ok("name\nmymaster\nip\n10.0.0.1\n"));
        assert!(!is_sentinel_master_ok("ERR No such master with that name"));
    }

    #[test]
    fn test_is_sentinel_remove_ignorable() {
        assert!(is_sentinel_remove_ignorable("OK"));
        assert!(is_sentinel_remove_ignorable("ERR No such master with that name"));
        assert!(!is_sentinel_remove_ignorable("ERR something else"));
        assert!(!is_sentinel_remove_ignorable(""));
    }

    #[test]
    fn test_has_been_reset() {
        assert!(has_been_reset("1"));
        assert!(has_been_reset("12\n"));
        assert!(!has_been_reset("ERR"));
        assert!(!has_been_reset(""));
    }

    #[test]
    fn test_redis_cli_composition() {
        let command = redis_cli("", "info replication");

        assert_eq!(
            command,
            "export REDIS_PORT=$(cat /data/conf/redis.conf | grep port | awk '{print $2}') && redis-cli -p \"${REDIS_PORT}\" info replication"
        );

        let command = redis_cli("pa$s", "info replication");

        assert!(command.contains("--no-auth-warning -a pa\\$s info replication"));
    }

    #[test]
    fn test_sentinel_cli_composition() {
        let command = sentinel_cli("SENTINEL master mymaster");

        assert_eq!(
            command,
            "export REDIS_PORT=$(cat /data/conf/sentinel.conf | grep port | awk '{print $2}') && redis-cli -p \"${REDIS_PORT}\" SENTINEL master mymaster"
        );
    }
}
