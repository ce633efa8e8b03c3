use std::time::Duration;

use serde::Deserialize;

use crate::kind::ExecutorKind;

/// Sizing and maintenance settings of an executor pool.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Pool name, also the prefix of every container name it owns.
    pub name: String,
    /// Executor kinds kept warm.
    pub kinds: Vec<ExecutorKind>,
    /// Upper bound on tracked executors across all kinds.
    pub max_size: usize,
    /// Ready executors to keep per kind.
    pub min_ready: usize,
    pub shrink_enabled: bool,
    pub shrink_interval_ms: u64,
    pub detect_hanged_enabled: bool,
    pub detect_hanged_interval_ms: u64,
    /// How long an executor may stay reserved, executing or released.
    pub hanging_timeout_ms: u64,
    /// How long a newly created executor may take to report readiness.
    pub readiness_timeout_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            name: "sandbox-executor".to_string(),
            kinds: vec![ExecutorKind::Dotnet],
            max_size: 20,
            min_ready: 3,
            shrink_enabled: true,
            shrink_interval_ms: 30_000,
            detect_hanged_enabled: true,
            detect_hanged_interval_ms: 10_000,
            hanging_timeout_ms: 20_000,
            readiness_timeout_ms: 30_000,
        }
    }
}

impl PoolSettings {
    /// Prefix shared by every container the pool owns, `<name>-`. Events,
    /// orphan collection and executor names all rely on it.
    pub fn container_prefix(&self) -> String {
        format!("{}-", self.name)
    }

    pub fn shrink_interval(&self) -> Duration {
        Duration::from_millis(self.shrink_interval_ms)
    }

    pub fn detect_hanged_interval(&self) -> Duration {
        Duration::from_millis(self.detect_hanged_interval_ms)
    }

    pub fn hanging_timeout(&self) -> Duration {
        Duration::from_millis(self.hanging_timeout_ms)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }
}

/// Retry policy for borrowing an executor.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BorrowSettings {
    /// Total attempts, including the first one.
    pub attempts: u32,
    pub delay_ms: u64,
}

impl Default for BorrowSettings {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay_ms: 500,
        }
    }
}

impl BorrowSettings {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScriptSettings {
    pub running_timeout_ms: u64,
}

impl Default for ScriptSettings {
    fn default() -> Self {
        Self {
            running_timeout_ms: 10_000,
        }
    }
}

impl ScriptSettings {
    pub fn running_timeout(&self) -> Duration {
        Duration::from_millis(self.running_timeout_ms)
    }
}

/// Container resources of one executor kind.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ExecutorProfile {
    /// Image override; `None` uses the kind's default image.
    pub image: Option<String>,
    pub memory_mb: u32,
    pub cpus: f64,
    /// Size of the in-memory scratch directory.
    pub space_mb: u32,
    pub network_disabled: bool,
}

impl Default for ExecutorProfile {
    fn default() -> Self {
        ExecutorKind::Dotnet.default_profile()
    }
}

/// Per-kind executor profiles.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorProfiles {
    pub dotnet: ExecutorProfile,
}

impl Default for ExecutorProfiles {
    fn default() -> Self {
        Self {
            dotnet: ExecutorKind::Dotnet.default_profile(),
        }
    }
}

impl ExecutorProfiles {
    pub fn get(&self, kind: ExecutorKind) -> &ExecutorProfile {
        match kind {
            ExecutorKind::Dotnet => &self.dotnet,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_defaults() {
        let settings = PoolSettings::default();
        assert_eq!(settings.name, "sandbox-executor");
        assert_eq!(settings.kinds, vec![ExecutorKind::Dotnet]);
        assert_eq!(settings.max_size, 20);
        assert_eq!(settings.min_ready, 3);
        assert_eq!(settings.shrink_interval(), Duration::from_secs(30));
        assert_eq!(settings.detect_hanged_interval(), Duration::from_secs(10));
        assert_eq!(settings.hanging_timeout(), Duration::from_secs(20));
        assert!(settings.shrink_enabled);
        assert!(settings.detect_hanged_enabled);
        assert_eq!(settings.container_prefix(), "sandbox-executor-");
    }

    #[test]
    fn borrow_and_script_defaults() {
        let borrow = BorrowSettings::default();
        assert_eq!(borrow.attempts, 3);
        assert_eq!(borrow.delay(), Duration::from_millis(500));
        assert_eq!(
            ScriptSettings::default().running_timeout(),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn profiles_resolve_by_kind() {
        let profiles = ExecutorProfiles::default();
        assert_eq!(profiles.get(ExecutorKind::Dotnet).memory_mb, 100);
        assert_eq!(profiles.get(ExecutorKind::Dotnet).space_mb, 100);
    }
}
