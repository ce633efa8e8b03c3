use std::path::{Path, PathBuf};

use sandbox::RuntimeError;

use crate::command::exec;

/// Locate the docker CLI and verify the daemon answers.
///
/// Collects all failures and returns them in a single `NotAvailable` error.
pub async fn check_prerequisites(binary: &str) -> Result<PathBuf, RuntimeError> {
    let mut errors = Vec::new();

    let path = match which::which(binary) {
        Ok(path) => Some(path),
        Err(e) => {
            errors.push(format!("{binary} not found on PATH: {e}"));
            None
        }
    };

    if let Some(path) = &path {
        check_daemon(path, &mut errors).await;
    }

    match path {
        Some(path) if errors.is_empty() => Ok(path),
        _ => Err(RuntimeError::NotAvailable(errors.join("; "))),
    }
}

async fn check_daemon(binary: &Path, errors: &mut Vec<String>) {
    let args = ["info".to_string(), "--format".into(), "{{.ServerVersion}}".into()];
    if let Err(e) = exec(binary, &args).await {
        errors.push(format!("docker daemon not reachable: {}", e.detail));
    }
}
