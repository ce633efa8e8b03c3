use std::fmt;
use std::str::FromStr;

use sandbox::{ExecSpec, ResourceLimits, RunSpec, TmpfsMount};
use serde::Deserialize;

use crate::config::ExecutorProfile;

/// Runtime an executor hosts. Each variant carries its own image, exec
/// command and default resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    Dotnet,
}

/// Resource parameters of an executor, as shown in execution reports.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorParameters {
    pub display_name: &'static str,
    pub memory_mb: u32,
    pub cpus: f64,
    pub space_mb: u32,
    pub network_disabled: bool,
}

const EXECUTOR_USER: &str = "executor";
const SCRATCH_DIR: &str = "/exec-dir";

impl ExecutorKind {
    pub const ALL: &'static [ExecutorKind] = &[ExecutorKind::Dotnet];

    /// Lowercase name used in container names and config files.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dotnet => "dotnet",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::Dotnet => ".NET SDK 6.0",
        }
    }

    pub fn default_image(self) -> &'static str {
        match self {
            Self::Dotnet => "sandbox/executor:dotnet6",
        }
    }

    /// Resource defaults for this kind.
    pub fn default_profile(self) -> ExecutorProfile {
        match self {
            Self::Dotnet => ExecutorProfile {
                image: None,
                memory_mb: 100,
                cpus: 1.5,
                space_mb: 100,
                network_disabled: true,
            },
        }
    }

    /// Container spec for a fresh executor of this kind.
    pub fn run_spec(self, name: &str, profile: &ExecutorProfile) -> RunSpec {
        let image = profile
            .image
            .clone()
            .unwrap_or_else(|| self.default_image().to_string());
        RunSpec {
            name: name.to_string(),
            image,
            command: Vec::new(),
            user: EXECUTOR_USER.to_string(),
            resources: ResourceLimits {
                memory_mb: profile.memory_mb,
                cpus: profile.cpus,
                network_disabled: profile.network_disabled,
            },
            tmpfs: Some(TmpfsMount {
                destination: SCRATCH_DIR.to_string(),
                size_bytes: u64::from(profile.space_mb) * 1024 * 1024,
            }),
        }
    }

    /// Command that runs `script` inside a container of this kind.
    pub fn exec_spec(self, script: &str) -> ExecSpec {
        match self {
            Self::Dotnet => ExecSpec {
                command: vec!["/restore-dir/exec.sh".to_string(), script.to_string()],
                workdir: None,
                user: EXECUTOR_USER.to_string(),
            },
        }
    }

    pub fn parameters(self, profile: &ExecutorProfile) -> ExecutorParameters {
        ExecutorParameters {
            display_name: self.display_name(),
            memory_mb: profile.memory_mb,
            cpus: profile.cpus,
            space_mb: profile.space_mb,
            network_disabled: profile.network_disabled,
        }
    }
}

impl fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Script language selected by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptType {
    Dotnet,
    Java,
    Go,
}

impl ScriptType {
    /// Executor kind able to run this script type, if any.
    pub fn executor_kind(self) -> Option<ExecutorKind> {
        match self {
            Self::Dotnet => Some(ExecutorKind::Dotnet),
            Self::Java | Self::Go => None,
        }
    }

    pub fn language(self) -> &'static str {
        match self {
            Self::Dotnet => ".NET",
            Self::Java => "Java",
            Self::Go => "Go",
        }
    }
}

impl fmt::Display for ScriptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Dotnet => "dotnet",
            Self::Java => "java",
            Self::Go => "go",
        };
        f.write_str(name)
    }
}

impl FromStr for ScriptType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dotnet" | "csharp" | "cs" => Ok(Self::Dotnet),
            "java" => Ok(Self::Java),
            "go" | "golang" => Ok(Self::Go),
            other => Err(format!(
                "unknown script type '{other}' (expected dotnet, java or go)"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dotnet_run_spec_uses_profile() {
        let profile = ExecutorKind::Dotnet.default_profile();
        let spec = ExecutorKind::Dotnet.run_spec("pool-dotnet-1a2b3c4d", &profile);

        assert_eq!(spec.name, "pool-dotnet-1a2b3c4d");
        assert_eq!(spec.image, "sandbox/executor:dotnet6");
        assert_eq!(spec.user, "executor");
        assert_eq!(spec.resources.memory_mb, 100);
        assert_eq!(spec.resources.cpus, 1.5);
        assert!(spec.resources.network_disabled);
        let tmpfs = spec.tmpfs.unwrap();
        assert_eq!(tmpfs.destination, "/exec-dir");
        assert_eq!(tmpfs.size_bytes, 100 * 1024 * 1024);
    }

    #[test]
    fn image_override_wins() {
        let profile = ExecutorProfile {
            image: Some("registry.local/dotnet:8".into()),
            ..ExecutorKind::Dotnet.default_profile()
        };
        let spec = ExecutorKind::Dotnet.run_spec("c-1", &profile);
        assert_eq!(spec.image, "registry.local/dotnet:8");
    }

    #[test]
    fn dotnet_exec_spec_passes_script_as_one_argument() {
        let spec = ExecutorKind::Dotnet.exec_spec("Console.WriteLine(\"hi\");");
        assert_eq!(
            spec.command,
            vec!["/restore-dir/exec.sh", "Console.WriteLine(\"hi\");"]
        );
        assert_eq!(spec.user, "executor");
    }

    #[test]
    fn parameters_follow_profile() {
        let profile = ExecutorProfile {
            memory_mb: 256,
            ..ExecutorKind::Dotnet.default_profile()
        };
        let params = ExecutorKind::Dotnet.parameters(&profile);
        assert_eq!(params.display_name, ".NET SDK 6.0");
        assert_eq!(params.memory_mb, 256);
        assert_eq!(params.space_mb, 100);
    }

    #[test]
    fn only_dotnet_scripts_have_an_executor() {
        assert_eq!(
            ScriptType::Dotnet.executor_kind(),
            Some(ExecutorKind::Dotnet)
        );
        assert_eq!(ScriptType::Java.executor_kind(), None);
        assert_eq!(ScriptType::Go.executor_kind(), None);
    }

    #[test]
    fn script_type_parses_aliases() {
        assert_eq!("DOTNET".parse::<ScriptType>(), Ok(ScriptType::Dotnet));
        assert_eq!("golang".parse::<ScriptType>(), Ok(ScriptType::Go));
        assert!("python".parse::<ScriptType>().is_err());
    }
}
