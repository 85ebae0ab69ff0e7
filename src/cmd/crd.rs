//! # Custom resource definition module
//!
//! This module provides custom resource module command line interface
//! function implementation

use std::sync::Arc;

use kube::CustomResourceExt;

use crate::svc::{cfg::Configuration, crd::redis::Redis};

// -----------------------------------------------------------------------------
// CustomResourceDefinitionError enum

#[derive(thiserror::Error, Debug)]
pub enum CustomResourceDefinitionError {
    #[error("failed to serialize custom resource definition, {0}")]
    Serialize(serde_yaml::Error),
}

// -----------------------------------------------------------------------------
// view function

pub async fn view(_config: Arc<Configuration>) -> Result<(), CustomResourceDefinitionError> {
    let crd = serde_yaml::to_string(&Redis::crd())
        .map_err(CustomResourceDefinitionError::Serialize)?;

    print!("{}", crd);
    Ok(())
}
