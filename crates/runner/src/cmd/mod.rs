mod gc;
mod run;
mod serve;

use std::sync::Arc;

use executor_pool::{EventsMonitor, ExecutorManager, ExecutorPool, ScriptRunner};
use sandbox::ContainerOperator;
use sandbox_docker::DockerOperator;
use tracing::info;

use crate::config::RunnerConfig;
use crate::error::RunnerResult;

pub use gc::{GcArgs, run_gc};
pub use run::{RunArgs, run_run};
pub use serve::{ServeArgs, run_serve};

/// Await a signal if registered, or pend forever if registration failed.
async fn recv_signal(sig: &mut Option<tokio::signal::unix::Signal>) {
    match sig {
        Some(s) => {
            s.recv().await;
        }
        None => std::future::pending().await,
    }
}

async fn connect(config: &RunnerConfig) -> RunnerResult<Arc<dyn ContainerOperator>> {
    let operator = DockerOperator::connect(&config.docker_binary).await?;
    Ok(Arc::new(operator))
}

/// Events monitor, warm pool and script runner wired over the docker CLI.
struct Services {
    feed: Arc<EventsMonitor>,
    pool: Arc<ExecutorPool>,
    runner: ScriptRunner,
}

impl Services {
    async fn start(config: RunnerConfig) -> RunnerResult<Self> {
        let operator = connect(&config).await?;

        let feed = Arc::new(EventsMonitor::new(
            config.pool.container_prefix(),
            Arc::clone(&operator),
        ));
        feed.start().await?;

        let pool = ExecutorPool::new(config.pool, config.executors, operator, Arc::clone(&feed));
        if let Err(e) = pool.start().await {
            pool.stop().await;
            feed.stop();
            return Err(e.into());
        }

        let manager = ExecutorManager::new(config.borrow, pool.clone());
        let runner = ScriptRunner::new(config.script, manager);
        info!("runner ready");
        Ok(Self { feed, pool, runner })
    }

    async fn shutdown(self) {
        self.pool.stop().await;
        self.feed.stop();
    }
}
