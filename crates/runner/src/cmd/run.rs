use std::path::PathBuf;
use std::process::ExitCode;

use clap::Args;
use executor_pool::{ScriptType, submit};
use tokio::io::AsyncReadExt;
use tracing::warn;

use super::Services;
use crate::config;
use crate::error::{RunnerError, RunnerResult};

#[derive(Args)]
pub struct RunArgs {
    /// Path to runner.yaml config file
    #[arg(long, short, env = "RUNNER_CONFIG")]
    config: PathBuf,
    /// Script language: dotnet, java or go
    #[arg(long = "type", short = 't', default_value = "dotnet")]
    script_type: ScriptType,
    /// Script file, `-` or omitted to read stdin
    script: Option<PathBuf>,
}

/// Run one script on a freshly started pool and print the report.
pub async fn run_run(args: RunArgs) -> RunnerResult<ExitCode> {
    let config = config::load(&args.config).await?;
    let script = read_script(args.script.as_deref()).await?;

    let services = Services::start(config).await?;
    let submission = submit(&services.runner, &script, args.script_type).await;
    services.shutdown().await;

    if submission.is_ok() {
        print!("{}", submission.body);
        Ok(ExitCode::SUCCESS)
    } else {
        warn!(status = %submission.status, "script was not run");
        eprintln!("{}", submission.body);
        Ok(ExitCode::FAILURE)
    }
}

async fn read_script(path: Option<&std::path::Path>) -> RunnerResult<String> {
    match path {
        Some(path) if path.as_os_str() != "-" => tokio::fs::read_to_string(path)
            .await
            .map_err(|e| RunnerError::Config(format!("read script {}: {e}", path.display()))),
        _ => {
            let mut script = String::new();
            tokio::io::stdin().read_to_string(&mut script).await?;
            Ok(script)
        }
    }
}
