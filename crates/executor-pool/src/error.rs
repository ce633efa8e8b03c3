use std::time::Duration;

use sandbox::RuntimeError;

use crate::kind::{ExecutorKind, ScriptType};

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("events monitor already started")]
    AlreadyStarted,

    #[error("container {0} is already subscribed to events")]
    AlreadySubscribed(String),

    #[error("container {0} is not subscribed to events")]
    NotSubscribed(String),

    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),
}

#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("events feed error: {0}")]
    Feed(#[from] FeedError),

    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("executor {0} is not reserved under this lease")]
    NotReserved(String),

    #[error("container error: {0}")]
    Container(#[from] ContainerError),
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("pool exhausted: no {kind} executor available and {max_size} executors already exist")]
    Exhausted { kind: ExecutorKind, max_size: usize },

    /// A fresh executor never reported readiness. The pool is misconfigured
    /// or the runtime does not deliver events.
    #[error("executor {id} not ready after {timeout:?}")]
    NeverReady { id: String, timeout: Duration },

    #[error("pool is stopped")]
    Stopped,

    #[error("executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),
}

impl PoolError {
    /// Failures that retrying cannot fix.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::NeverReady { .. } | Self::Stopped)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BorrowError {
    #[error("failed to borrow {kind} executor after {attempts} attempts")]
    Exhausted { kind: ExecutorKind, attempts: u32 },

    #[error("pool error: {0}")]
    Pool(#[from] PoolError),
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{} code isn't supported yet", .0.language())]
    Unsupported(ScriptType),

    #[error("script execution isn't started: {0}")]
    NotStarted(#[from] BorrowError),

    #[error("executor error: {0}")]
    Executor(#[from] ExecutorError),
}

pub type Result<T, E = PoolError> = std::result::Result<T, E>;
