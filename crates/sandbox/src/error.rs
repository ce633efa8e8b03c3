#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The container is already gone, or its removal is already underway.
    ///
    /// Concurrent removal by the runtime itself is expected, so callers
    /// that remove containers match on this variant and carry on.
    #[error("container not found: {0}")]
    NotFound(String),

    #[error("runtime command failed: {command} (exit code {code:?})\n{stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("runtime not available: {0}")]
    NotAvailable(String),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
