use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use sandbox::{ContainerEvent, ContainerOperator, ExecHandle, ExecSpec, RunSpec, RuntimeError};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tracing::{debug, info, trace, warn};

use crate::error::ContainerError;
use crate::events::{EventHandler, EventsMonitor};

/// Lifecycle state of a runtime container, derived from its events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Stopped,
    Running,
    Paused,
    Deleted,
    Unknown,
}

impl ContainerState {
    pub fn from_event(status: &str) -> Self {
        match status {
            "create" | "kill" | "die" | "oom" | "stop" => Self::Stopped,
            "start" | "restart" | "unpause" => Self::Running,
            "pause" => Self::Paused,
            "destroy" => Self::Deleted,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Deleted => "deleted",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// One runtime container and the `RunSpec` it was created from.
///
/// State changes are pushed to the receiver returned by [`SandboxContainer::run`]
/// in the order the runtime reported them. Unknown events never reach it.
pub struct SandboxContainer {
    spec: RunSpec,
    operator: Arc<dyn ContainerOperator>,
    feed: Arc<EventsMonitor>,
    state: Arc<Mutex<Option<ContainerState>>>,
    removed: AtomicBool,
    /// Held across the runtime calls of `rerun` and `remove`.
    lifecycle: AsyncMutex<()>,
}

impl SandboxContainer {
    /// Subscribe to the container's events, then create and start it.
    pub async fn run(
        spec: RunSpec,
        operator: Arc<dyn ContainerOperator>,
        feed: Arc<EventsMonitor>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ContainerState>), ContainerError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(None));

        let handler_state = Arc::clone(&state);
        let handler: EventHandler = Arc::new(move |event: ContainerEvent| {
            let next = ContainerState::from_event(&event.status);
            if next == ContainerState::Unknown {
                trace!(name = %event.container, status = %event.status, "ignoring event");
                return;
            }
            *handler_state.lock().unwrap_or_else(PoisonError::into_inner) = Some(next);
            let _ = tx.send(next);
        });
        feed.subscribe(&spec.name, handler)?;

        if let Err(e) = operator.run_container(&spec).await {
            let _ = feed.unsubscribe(&spec.name);
            return Err(e.into());
        }
        info!(name = %spec.name, image = %spec.image, "container created");

        let container = Self {
            spec,
            operator,
            feed,
            state,
            removed: AtomicBool::new(false),
            lifecycle: AsyncMutex::new(()),
        };
        Ok((container, rx))
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &RunSpec {
        &self.spec
    }

    /// Last known state, `None` until the first recognised event.
    pub fn state(&self) -> Option<ContainerState> {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start `spec` inside the container without waiting for it to finish.
    pub async fn exec(&self, spec: &ExecSpec) -> Result<ExecHandle, ContainerError> {
        debug!(name = %self.spec.name, "exec in container");
        Ok(self.operator.exec(&self.spec.name, spec).await?)
    }

    /// Destroy the container and create it again from the same `RunSpec`.
    ///
    /// Does nothing once the container has been removed for good. A
    /// concurrent [`remove`](Self::remove) waits for the rerun to finish and
    /// then removes the new container.
    pub async fn rerun(&self) -> Result<(), ContainerError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_removed() {
            return Ok(());
        }
        self.remove_tolerant().await?;
        if self.is_removed() {
            return Ok(());
        }
        self.operator.run_container(&self.spec).await?;
        info!(name = %self.spec.name, "container recreated");
        Ok(())
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    /// Unsubscribe from events and remove the container. Idempotent.
    ///
    /// The state stream closes once this returns.
    pub async fn remove(&self) -> Result<(), ContainerError> {
        if self.removed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Err(e) = self.feed.unsubscribe(&self.spec.name) {
            warn!(name = %self.spec.name, error = %e, "unsubscribe failed");
        }
        let _lifecycle = self.lifecycle.lock().await;
        self.remove_tolerant().await?;
        info!(name = %self.spec.name, "container removed");
        Ok(())
    }

    async fn remove_tolerant(&self) -> Result<(), RuntimeError> {
        match self.operator.remove_container(&self.spec.name).await {
            Err(e) if e.is_not_found() => {
                debug!(name = %self.spec.name, "container already gone");
                Ok(())
            }
            other => other,
        }
    }
}
