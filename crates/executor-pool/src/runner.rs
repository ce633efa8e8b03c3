use std::fmt::Write as _;
use std::time::{Duration, Instant};

use sandbox::drain_output;
use tracing::{error, info, warn};

use crate::config::ScriptSettings;
use crate::error::RunError;
use crate::kind::{ExecutorParameters, ScriptType};
use crate::manager::{Borrowed, ExecutorManager};

/// Runs one script on a borrowed executor and renders the report.
pub struct ScriptRunner {
    settings: ScriptSettings,
    manager: ExecutorManager,
}

impl ScriptRunner {
    pub fn new(settings: ScriptSettings, manager: ExecutorManager) -> Self {
        Self { settings, manager }
    }

    /// Borrow an executor for `script_type`, run `script` under the running
    /// timeout and return the report. The executor is always redeemed.
    ///
    /// A timeout is not an error: the report says the execution was aborted.
    pub async fn run(&self, script: &str, script_type: ScriptType) -> Result<String, RunError> {
        if script.trim().is_empty() {
            return Err(RunError::InvalidArgument("Script is empty".into()));
        }
        let Some(kind) = script_type.executor_kind() else {
            return Err(RunError::Unsupported(script_type));
        };

        let borrowed = match self.manager.borrow(kind).await {
            Ok(borrowed) => borrowed,
            Err(e) => {
                error!(script_type = %script_type, error = %e, "failed to borrow executor");
                return Err(RunError::NotStarted(e));
            }
        };

        let result = self.run_on(&borrowed, script).await;
        if let Err(e) = self.manager.redeem(&borrowed) {
            warn!(id = %borrowed.executor.id(), error = %e, "failed to redeem executor");
        }
        result
    }

    async fn run_on(&self, borrowed: &Borrowed, script: &str) -> Result<String, RunError> {
        let executor = &borrowed.executor;
        let started = Instant::now();
        let handle = executor.execute(borrowed.lease, script).await?;
        let mut output = handle.output;

        let timeout = self.settings.running_timeout();
        let timed_out = match tokio::time::timeout(timeout, handle.job).await {
            Ok(Ok(Ok(exit))) => {
                info!(id = %executor.id(), exit_code = ?exit.exit_code, "script finished");
                false
            }
            Ok(Ok(Err(e))) => {
                warn!(id = %executor.id(), error = %e, "script process failed");
                false
            }
            Ok(Err(e)) => {
                error!(id = %executor.id(), error = %e, "exec task panicked");
                false
            }
            Err(_) => {
                warn!(id = %executor.id(), ?timeout, "script running timeout exceeded");
                true
            }
        };
        let elapsed = started.elapsed();

        let lines = drain_output(&mut output);
        Ok(build_report(executor.parameters(), &lines, elapsed, timed_out))
    }
}

/// Render the execution report shown to the script author.
pub fn build_report(
    parameters: &ExecutorParameters,
    output: &[String],
    elapsed: Duration,
    timed_out: bool,
) -> String {
    let mut report = String::new();
    let _ = writeln!(report, "> Executing on {}", parameters.display_name);
    let _ = writeln!(
        report,
        "> Resources: CPU {}, RAM {} MB, space {} MB, network - {}",
        parameters.cpus,
        parameters.memory_mb,
        parameters.space_mb,
        !parameters.network_disabled
    );
    report.push('\n');

    if output.is_empty() {
        report.push_str("> No output\n");
    } else {
        report.push_str("> Output:\n\n");
        for line in output {
            report.push_str(line);
            report.push('\n');
        }
    }
    report.push('\n');

    if timed_out {
        report.push_str("----------------------------------------------------\n");
        report.push_str("✗ Script running timeout exceeded. Execution aborted\n");
    } else {
        report.push_str("------------------------------\n");
        report.push_str("✓ Script executed successfully\n");
    }
    let _ = writeln!(report, "> Time elapsed: {} seconds", elapsed.as_secs());
    report
}
