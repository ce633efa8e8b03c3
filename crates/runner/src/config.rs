use std::path::Path;

use executor_pool::{BorrowSettings, ExecutorKind, ExecutorProfiles, PoolSettings, ScriptSettings};
use serde::Deserialize;

use crate::error::{RunnerError, RunnerResult};

pub(crate) const DEFAULT_DOCKER_BINARY: &str = "docker";

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunnerConfig {
    /// Docker CLI name or path.
    pub docker_binary: String,
    pub pool: PoolSettings,
    pub borrow: BorrowSettings,
    pub script: ScriptSettings,
    pub executors: ExecutorProfiles,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            docker_binary: DEFAULT_DOCKER_BINARY.to_string(),
            pool: PoolSettings::default(),
            borrow: BorrowSettings::default(),
            script: ScriptSettings::default(),
            executors: ExecutorProfiles::default(),
        }
    }
}

/// Load and validate a runner config from a YAML file.
///
/// Omitted sections and fields take their defaults; an empty file yields the
/// default config.
pub async fn load(path: &Path) -> RunnerResult<RunnerConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| RunnerError::Config(format!("read {}: {e}", path.display())))?;
    let config = if content.trim().is_empty() {
        RunnerConfig::default()
    } else {
        serde_yaml_ng::from_str(&content)
            .map_err(|e| RunnerError::Config(format!("parse {}: {e}", path.display())))?
    };
    validate(&config)?;
    Ok(config)
}

fn validate(config: &RunnerConfig) -> RunnerResult<()> {
    let pool = &config.pool;
    let mut problems = Vec::new();

    if config.docker_binary.trim().is_empty() {
        problems.push("docker_binary must not be empty".to_string());
    }
    if pool.name.trim().is_empty() {
        problems.push("pool.name must not be empty".to_string());
    }
    if pool.kinds.is_empty() {
        problems.push("pool.kinds must name at least one executor kind".to_string());
    }
    if pool.min_ready > pool.max_size {
        problems.push(format!(
            "pool.min_ready ({}) exceeds pool.max_size ({})",
            pool.min_ready, pool.max_size
        ));
    }
    if pool.shrink_enabled && pool.shrink_interval_ms == 0 {
        problems.push("pool.shrink_interval_ms must be positive".to_string());
    }
    if pool.detect_hanged_enabled && pool.detect_hanged_interval_ms == 0 {
        problems.push("pool.detect_hanged_interval_ms must be positive".to_string());
    }
    if pool.hanging_timeout_ms == 0 {
        problems.push("pool.hanging_timeout_ms must be positive".to_string());
    }
    if pool.readiness_timeout_ms == 0 {
        problems.push("pool.readiness_timeout_ms must be positive".to_string());
    }
    if config.borrow.attempts == 0 {
        problems.push("borrow.attempts must be at least 1".to_string());
    }
    if config.script.running_timeout_ms == 0 {
        problems.push("script.running_timeout_ms must be positive".to_string());
    }
    // A script still inside its running timeout must never count as hung.
    if pool.detect_hanged_enabled && pool.hanging_timeout_ms <= config.script.running_timeout_ms {
        problems.push(format!(
            "pool.hanging_timeout_ms ({}) must exceed script.running_timeout_ms ({})",
            pool.hanging_timeout_ms, config.script.running_timeout_ms
        ));
    }
    for kind in ExecutorKind::ALL {
        let profile = config.executors.get(*kind);
        if profile.memory_mb == 0 || profile.space_mb == 0 || profile.cpus <= 0.0 {
            problems.push(format!(
                "executors.{kind}: memory_mb, space_mb and cpus must be positive"
            ));
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(RunnerError::Config(problems.join("; ")))
    }
}
