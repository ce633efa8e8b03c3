use std::path::PathBuf;

use clap::Args;
use executor_pool::{ScriptRunner, ScriptType, submit};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};

use super::{Services, recv_signal};
use crate::config;
use crate::error::RunnerResult;

/// Line that ends one script on stdin.
const SCRIPT_SEPARATOR: &str = "---";

#[derive(Args)]
pub struct ServeArgs {
    /// Path to runner.yaml config file
    #[arg(long, short, env = "RUNNER_CONFIG")]
    config: PathBuf,
    /// Script language: dotnet, java or go
    #[arg(long = "type", short = 't', default_value = "dotnet")]
    script_type: ScriptType,
}

/// Splits stdin into scripts separated by `---` lines.
#[derive(Default)]
struct ScriptBlocks {
    current: String,
}

impl ScriptBlocks {
    /// Add one input line. Returns the finished script when `line` is a
    /// separator.
    fn push_line(&mut self, line: &str) -> Option<String> {
        if line.trim() == SCRIPT_SEPARATOR {
            return Some(std::mem::take(&mut self.current));
        }
        self.current.push_str(line);
        self.current.push('\n');
        None
    }

    /// The unterminated last script, if it has any content.
    fn finish(self) -> Option<String> {
        (!self.current.trim().is_empty()).then_some(self.current)
    }
}

/// Keep a warm pool and run every script read from stdin until EOF or a
/// termination signal.
pub async fn run_serve(args: ServeArgs) -> RunnerResult<()> {
    let config = config::load(&args.config).await?;
    let services = Services::start(config).await?;

    let result = serve(&services.runner, args.script_type).await;
    services.shutdown().await;
    result
}

async fn serve(runner: &ScriptRunner, script_type: ScriptType) -> RunnerResult<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate()).ok();
    let mut sigint = signal(SignalKind::interrupt()).ok();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut blocks = ScriptBlocks::default();

    info!(script_type = %script_type, "reading scripts from stdin");
    loop {
        tokio::select! {
            _ = recv_signal(&mut sigterm) => {
                info!("received SIGTERM, stopping");
                return Ok(());
            }
            _ = recv_signal(&mut sigint) => {
                info!("received SIGINT, stopping");
                return Ok(());
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Some(script) = blocks.push_line(&line) {
                        run_one(runner, &script, script_type).await;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "failed to read stdin");
                    return Err(e.into());
                }
            },
        }
    }

    if let Some(script) = blocks.finish() {
        run_one(runner, &script, script_type).await;
    }
    info!("stdin closed, stopping");
    Ok(())
}

async fn run_one(runner: &ScriptRunner, script: &str, script_type: ScriptType) {
    let submission = submit(runner, script, script_type).await;
    info!(status = %submission.status, "script processed");
    println!("{}", submission.body);
    println!("{SCRIPT_SEPARATOR}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_scripts_on_separator_lines() {
        let mut blocks = ScriptBlocks::default();

        assert_eq!(blocks.push_line("var a = 1;"), None);
        assert_eq!(blocks.push_line("Console.WriteLine(a);"), None);
        assert_eq!(
            blocks.push_line("---").as_deref(),
            Some("var a = 1;\nConsole.WriteLine(a);\n")
        );
        assert_eq!(blocks.push_line("return;"), None);
        assert_eq!(blocks.push_line("  ---  ").as_deref(), Some("return;\n"));
        assert_eq!(blocks.finish(), None);
    }

    #[test]
    fn unterminated_script_is_kept() {
        let mut blocks = ScriptBlocks::default();
        blocks.push_line("return 1;");
        assert_eq!(blocks.finish().as_deref(), Some("return 1;\n"));
    }

    #[test]
    fn empty_block_is_passed_through() {
        let mut blocks = ScriptBlocks::default();
        assert_eq!(blocks.push_line("---").as_deref(), Some(""));
    }
}
