//! # Configuration module
//!
//! This module provide utilities and helpers to interact with the
//! configuration

use std::{
    convert::TryFrom,
    env::{self, VarError},
    path::PathBuf,
};

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::info;

// -----------------------------------------------------------------------------
// Constants

pub const OPERATOR_LISTEN: &str = "0.0.0.0:8000";

// -----------------------------------------------------------------------------
// Operator structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Operator {
    #[serde(rename = "listen")]
    pub listen: String,
}

// -----------------------------------------------------------------------------
// ConfigurationError enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to load configuration, {0}")]
    Build(ConfigError),
    #[error("failed to deserialize configuration, {0}")]
    Deserialize(ConfigError),
    #[error("failed to set default for key '{0}', {1}")]
    Default(String, ConfigError),
    #[error("failed to retrieve environment variable '{0}', {1}")]
    EnvironmentVariable(&'static str, VarError),
}

// -----------------------------------------------------------------------------
// Configuration structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Configuration {
    #[serde(rename = "operator")]
    pub operator: Operator,
}

impl TryFrom<PathBuf> for Configuration {
    type Error = Error;

    #[cfg_attr(feature = "trace", tracing::instrument)]
    fn try_from(path: PathBuf) -> Result<Self, Self::Error> {
        Config::builder()
            .set_default("operator.listen", OPERATOR_LISTEN)
            .map_err(|err| Error::Default("operator.listen".into(), err))?
            .add_source(Environment::with_prefix(
                &env!("CARGO_PKG_NAME").replace('-', "_"),
            ))
            .add_source(File::from(path).required(true))
            .build()
            .map_err(Error::Build)?
            .try_deserialize()
            .map_err(Error::Deserialize)
    }
}

impl Configuration {
    #[cfg_attr(feature = "trace", tracing::instrument)]
    pub fn try_default() -> Result<Self, Error> {
        Config::builder()
            .set_default("operator.listen", OPERATOR_LISTEN)
            .map_err(|err| Error::Default("operator.listen".into(), err))?
            .add_source(Environment::with_prefix(
                &env!("CARGO_PKG_NAME").replace('-', "_"),
            ))
            .add_source(
                File::from(PathBuf::from(format!(
                    "/usr/share/{}/config",
                    env!("CARGO_PKG_NAME")
                )))
                .required(false),
            )
            .add_source(
                File::from(PathBuf::from(format!(
                    "/etc/{}/config",
                    env!("CARGO_PKG_NAME")
                )))
                .required(false),
            )
            .add_source(
                File::from(PathBuf::from(format!(
                    "{}/.config/{}/config",
                    env::var("HOME").map_err(|err| Error::EnvironmentVariable("HOME", err))?,
                    env!("CARGO_PKG_NAME")
                )))
                .required(false),
            )
            .add_source(File::from(PathBuf::from("config")).required(false))
            .build()
            .map_err(Error::Build)?
            .try_deserialize()
            .map_err(Error::Deserialize)
    }

    /// prints messages about the compiled feature flags
    #[cfg_attr(feature = "trace", tracing::instrument)]
    pub fn help(&self) {
        #[cfg(feature = "metrics")]
        info!("Build with 'metrics' feature flag");

        #[cfg(feature = "trace")]
        info!("Build with 'trace' feature flag");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_default_listen() {
        let config = Configuration::try_default().expect("configuration to load from defaults");

        assert_eq!(config.operator.listen, OPERATOR_LISTEN);
    }
}
