//! Compute lifecycle boundary
//!
//! This module provides:
//! - [`ComputeClient`] trait: create, terminate and list worker instances
//! - [`InMemoryCompute`] for testing and dev mode
//! - [`DockerCompute`] running each worker as a container

mod docker;
mod instance;
mod memory;

pub use docker::{DockerCompute, MACHINE_TYPE_LABEL, MANAGED_LABEL};
pub use instance::{
    ComputeClient, ComputeError, Instance, InstanceFilter, InstanceState, LaunchSpec, NAME_TAG,
};
pub use memory::InMemoryCompute;
