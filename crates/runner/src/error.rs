#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("config error: {0}")]
    Config(String),

    #[error("runtime error: {0}")]
    Runtime(#[from] sandbox::RuntimeError),

    #[error("events feed error: {0}")]
    Feed(#[from] executor_pool::FeedError),

    #[error("pool error: {0}")]
    Pool(#[from] executor_pool::PoolError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type RunnerResult<T> = Result<T, RunnerError>;
