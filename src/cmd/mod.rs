//! # Command module
//!
//! This module provide command line interface structures and helpers

use std::{error::Error, io, net::AddrParseError, path::PathBuf, process::abort, sync::Arc};

use async_trait::async_trait;
use clap::{ArgAction, Parser, Subcommand};
use hyper::{
    service::{make_service_fn, service_fn},
    Server,
};
use tracing::{error, info};

use crate::{
    cmd::crd::CustomResourceDefinitionError,
    svc::{
        cfg::Configuration,
        crd::redis,
        http,
        k8s::{client, Context, Watcher},
    },
};

pub mod crd;

// -----------------------------------------------------------------------------
// Executor trait

#[async_trait]
pub trait Executor {
    type Error;

    async fn execute(&self, config: Arc<Configuration>) -> Result<(), Self::Error>;
}

// -----------------------------------------------------------------------------
// CommandError enum

#[derive(thiserror::Error, Debug)]
pub enum CommandError {
    #[error("failed to execute command '{0}', {1}")]
    Execution(String, Arc<CommandError>),
    #[error("failed to execute command, {0}")]
    CustomResourceDefinition(CustomResourceDefinitionError),
}

// -----------------------------------------------------------------------------
// Command enum

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Interact with custom resource definition
    #[command(name = "custom-resource-definition", aliases = &["crd"])]
    CustomResourceDefinition,
}

#[async_trait]
impl Executor for Command {
    type Error = CommandError;

    #[cfg_attr(feature = "trace", tracing::instrument)]
    async fn execute(&self, config: Arc<Configuration>) -> Result<(), Self::Error> {
        match self {
            Self::CustomResourceDefinition => crd::view(config)
                .await
                .map_err(CommandError::CustomResourceDefinition)
                .map_err(|err| {
                    CommandError::Execution("custom-resource-definition".into(), Arc::new(err))
                }),
        }
    }
}

// -----------------------------------------------------------------------------
// Args struct

#[derive(Parser, Clone, Debug)]
#[command(about = env!("CARGO_PKG_DESCRIPTION"), version)]
pub struct Args {
    /// Increase log verbosity
    #[arg(short = 'v', global = true, action = ArgAction::Count)]
    pub verbosity: u8,
    /// Specify location of kubeconfig
    #[arg(short = 'k', long = "kubeconfig", global = true)]
    pub kubeconfig: Option<PathBuf>,
    /// Specify location of configuration
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,
    /// Check if configuration is healthy
    #[arg(short = 't', long = "check", global = true)]
    pub check: bool,
    #[command(subcommand)]
    pub command: Option<Command>,
}

// -----------------------------------------------------------------------------
// DaemonError enum

#[derive(thiserror::Error, Debug)]
pub enum DaemonError {
    #[error("failed to parse listen address '{0}', {1}")]
    Listen(String, AddrParseError),
    #[error("failed to handle termination signal, {0}")]
    SigTerm(io::Error),
    #[error("failed to create kubernetes client, {0}")]
    Client(client::Error),
}

// -----------------------------------------------------------------------------
// daemon function

pub async fn daemon(
    kubeconfig: Option<PathBuf>,
    config: Arc<Configuration>,
) -> Result<(), DaemonError> {
    // -------------------------------------------------------------------------
    // Create a new kubernetes client from path if defined, or via the
    // environment or defaults locations
    let kube_client = client::try_new(kubeconfig)
        .await
        .map_err(DaemonError::Client)?;

    // -------------------------------------------------------------------------
    // Create context to give to the reconciler
    let context = Arc::new(Context::new(kube_client, config.to_owned()));

    // -------------------------------------------------------------------------
    // Create reconciler
    let handle = tokio::spawn(async move {
        let reconciler = redis::Reconciler::default();

        info!("Start to listen for events of redis custom resource");
        if let Err(err) = reconciler.watch(context).await {
            error!(
                error = err.to_string(),
                "Could not reconcile redis custom resource"
            );
        }

        abort();
    });

    // -------------------------------------------------------------------------
    // Create http server
    let addr = config
        .operator
        .listen
        .parse()
        .map_err(|err| DaemonError::Listen(config.operator.listen.to_owned(), err))?;

    let server = tokio::spawn(async move {
        let builder = match Server::try_bind(&addr) {
            Ok(builder) => builder,
            Err(err) => {
                error!(error = err.to_string(), "Could not bind http server");
                abort();
            }
        };

        let server = builder.serve(make_service_fn(|_| async {
            Ok::<_, Box<dyn Error + Send + Sync>>(service_fn(http::router))
        }));

        info!("Start to listen for http request on {}", addr);
        if let Err(err) = server.await {
            error!(error = err.to_string(), "Could not serve http server");
        }

        abort()
    });

    // -------------------------------------------------------------------------
    // Wait for termination signal
    tokio::signal::ctrl_c()
        .await
        .map_err(DaemonError::SigTerm)?;

    // -------------------------------------------------------------------------
    // Cancel reconciler
    handle.abort();
    if let Err(err) = handle.await {
        if !err.is_cancelled() {
            error!(
                error = err.to_string(),
                "Could not wait for the task to complete"
            );
        }
    }

    // -------------------------------------------------------------------------
    // Cancel http server
    server.abort();
    if let Err(err) = server.await {
        if !err.is_cancelled() {
            error!(
                error = err.to_string(),
                "Could not wait for the http server to gracefully close"
            );
        }
    }

    Ok(())
}
