//! # Custom resource definition module
//!
//! This module provide the custom resource definition managed by the operator,
//! its structures, implementation and reconciliation loop.

pub mod redis;
