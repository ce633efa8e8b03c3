mod api;
mod config;
mod container;
mod error;
mod events;
mod executor;
mod factory;
mod gc;
mod kind;
mod manager;
mod pool;
mod runner;
#[cfg(test)]
mod testing;

pub use api::{Submission, SubmissionStatus, submit};
pub use config::{BorrowSettings, ExecutorProfile, ExecutorProfiles, PoolSettings, ScriptSettings};
pub use container::{ContainerState, SandboxContainer};
pub use error::{BorrowError, ContainerError, ExecutorError, FeedError, PoolError, Result, RunError};
pub use events::{EventHandler, EventsMonitor, LIFECYCLE_EVENTS};
pub use executor::{Executor, ExecutorState, Lease, Transition};
pub use factory::ExecutorFactory;
pub use gc::collect_orphans;
pub use kind::{ExecutorKind, ExecutorParameters, ScriptType};
pub use manager::{Borrowed, ExecutorManager};
pub use pool::{ExecutorPool, ExecutorSource};
pub use runner::{ScriptRunner, build_report};
