//! Fluent container configuration and self-healing image updates on top of
//! the Docker Engine API client [bollard].
//!
//! The centerpiece is [`UpdateOrchestrator`]: it recreates a named container
//! from a new image, waits for it to run, and rolls back to the previous
//! image on any failure. It talks to the engine through the
//! [`ContainerRuntime`] trait, implemented by [`DockerRuntime`] for a real
//! daemon and by [`InMemoryRuntime`] for tests.

pub mod builder;
pub mod config;
pub mod error;
pub mod filters;
pub mod orchestrator;
pub mod runtime;
pub mod types;

pub use builder::{ContainerSpec, HostOverrides, PortMapping, RestartPolicy, RestartPolicyKind};
pub use config::Config;
pub use error::{ErrorKind, RuntimeError, UpdateError};
pub use filters::Filters;
pub use orchestrator::UpdateOrchestrator;
pub use runtime::{ContainerRuntime, DockerRuntime, InMemoryRuntime};
pub use types::{
    ContainerRef, ContainerSnapshot, ContainerState, ImageReference, UpdateOutcome, UpdateStatus,
};
