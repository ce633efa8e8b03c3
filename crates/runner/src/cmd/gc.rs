use std::path::PathBuf;

use clap::Args;
use executor_pool::collect_orphans;

use super::connect;
use crate::config;
use crate::error::RunnerResult;

#[derive(Args)]
pub struct GcArgs {
    /// Path to runner.yaml config file
    #[arg(long, short, env = "RUNNER_CONFIG")]
    config: PathBuf,
}

/// Remove containers left behind by a previous pool with the same name.
pub async fn run_gc(args: GcArgs) -> RunnerResult<()> {
    let config = config::load(&args.config).await?;
    let operator = connect(&config).await?;

    let removed = collect_orphans(operator.as_ref(), &config.pool.container_prefix()).await?;
    println!("removed {removed} orphaned container(s)");
    Ok(())
}
