//! Script submission entry point shared by every front end.

use std::fmt;

use crate::error::RunError;
use crate::kind::ScriptType;
use crate::runner::ScriptRunner;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionStatus {
    Ok,
    Failed,
    NotSupported,
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ok => "ok",
            Self::Failed => "failed",
            Self::NotSupported => "not supported",
        };
        f.write_str(s)
    }
}

/// Outcome of one submission: the report on success, the error text
/// otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub status: SubmissionStatus,
    pub body: String,
}

impl Submission {
    pub fn is_ok(&self) -> bool {
        self.status == SubmissionStatus::Ok
    }
}

/// Run `script` and map the outcome to a submission status. Unsupported
/// script types are answered without touching the pool.
pub async fn submit(runner: &ScriptRunner, script: &str, script_type: ScriptType) -> Submission {
    if script_type.executor_kind().is_none() {
        return Submission {
            status: SubmissionStatus::NotSupported,
            body: RunError::Unsupported(script_type).to_string(),
        };
    }

    match runner.run(script, script_type).await {
        Ok(report) => Submission {
            status: SubmissionStatus::Ok,
            body: report,
        },
        Err(RunError::Unsupported(script_type)) => Submission {
            status: SubmissionStatus::NotSupported,
            body: RunError::Unsupported(script_type).to_string(),
        },
        Err(e) => Submission {
            status: SubmissionStatus::Failed,
            body: failure_text(&e),
        },
    }
}

fn failure_text(err: &RunError) -> String {
    match err {
        RunError::InvalidArgument(message) => message.clone(),
        RunError::NotStarted(_) => "Script execution isn't started".to_string(),
        other => other.to_string(),
    }
}
