use async_trait::async_trait;

use crate::config::{ExecSpec, RunSpec};
use crate::error::Result;
use crate::types::{EventStream, EventsQuery, ExecHandle};

/// Issues container operations against a container runtime.
///
/// Every call may fail with a [`RuntimeError`](crate::RuntimeError) carrying
/// the runtime's stderr and exit code. Removal of a container that no longer
/// exists fails with [`RuntimeError::NotFound`](crate::RuntimeError::NotFound).
#[async_trait]
pub trait ContainerOperator: Send + Sync {
    /// Human-readable name of the runtime backend (e.g. "docker").
    fn name(&self) -> &str;

    /// Create and start a detached container from `spec`.
    async fn run_container(&self, spec: &RunSpec) -> Result<()>;
    /// Force-remove a container, killing it if running.
    async fn remove_container(&self, name: &str) -> Result<()>;
    /// Force-remove several containers in one runtime call.
    async fn remove_containers(&self, names: &[String]) -> Result<()>;
    /// Names of all containers, running or not, whose name matches `prefix`.
    async fn container_names(&self, prefix: &str) -> Result<Vec<String>>;

    /// Start a process inside a running container without waiting for it.
    async fn exec(&self, name: &str, spec: &ExecSpec) -> Result<ExecHandle>;
    /// Subscribe to lifecycle events of containers matching the query.
    async fn monitor_events(&self, query: &EventsQuery) -> Result<EventStream>;
}
