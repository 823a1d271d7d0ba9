//! Deployment of the benchmark functions and authentication against them.
//!
//! Each provider region is managed by a [`Deployer`](deployer::Deployer), created through the
//! [`DeployerRegistry`](registry::DeployerRegistry). The
//! [`DeployOrchestrator`](orchestrator::DeployOrchestrator) runs an operation against all targets
//! of a deploy config in parallel, and [`generate`] turns the deployed functions into a benchmark
//! config for `faasbench-core`.
#![warn(missing_debug_implementations)]

pub mod auth;
pub mod deployer;
pub mod error;
pub mod generate;
pub mod orchestrator;
pub mod registry;

pub use error::{AuthError, DeployError};
