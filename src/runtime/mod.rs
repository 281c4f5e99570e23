use async_trait::async_trait;

use crate::error::RuntimeError;
use crate::types::{ContainerRef, ContainerSnapshot, ContainerState};

pub mod docker;
pub mod memory;
pub use docker::DockerRuntime;
pub use memory::InMemoryRuntime;

/// The container engine operations the update orchestrator is built on.
///
/// Implementations translate engine failures into [`RuntimeError`]; they
/// never retry on their own.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Exact-name lookup. `Ok(None)` means no container has that name.
    async fn find_by_name(&self, name: &str) -> Result<Option<ContainerRef>, RuntimeError>;

    /// Captures the creation configuration of a container.
    async fn inspect(&self, container: &ContainerRef) -> Result<ContainerSnapshot, RuntimeError>;

    /// Whether the container named `name` is currently in `state`.
    /// Absence and lookup errors both answer `false`.
    async fn is_in_state(&self, name: &str, state: ContainerState) -> bool;

    /// Removes the container; `force` kills it instead of stopping gracefully.
    async fn remove(&self, container: &ContainerRef, force: bool) -> Result<(), RuntimeError>;

    /// Creates (but does not start) a container from `snapshot`.
    async fn create(&self, snapshot: &ContainerSnapshot) -> Result<ContainerRef, RuntimeError>;

    /// Starts a created container. `Ok(false)` when the engine did not start it.
    async fn start(&self, container: &ContainerRef) -> Result<bool, RuntimeError>;
}
