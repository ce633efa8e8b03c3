use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sandbox::{
    ContainerOperator, EventStream, EventsQuery, ExecHandle, ExecSpec, Result, RunSpec,
    RuntimeError,
};
use tracing::{debug, info};

use crate::command::{CommandError, exec};
use crate::prerequisites::check_prerequisites;
use crate::stream::{spawn_event_stream, spawn_exec};

const DOCKER_BINARY: &str = "docker";

/// Template for `docker events`, one `name,status` pair per line.
const EVENT_FORMAT: &str = "{{.Actor.Attributes.name}},{{.Status}}";

/// Stderr fragments docker prints when a container is gone or already being
/// removed.
const NOT_FOUND_MARKERS: &[&str] = &["No such container", "is already in progress"];

/// [`ContainerOperator`] backed by the docker CLI.
pub struct DockerOperator {
    binary: PathBuf,
}

impl DockerOperator {
    /// Locate `docker` on PATH and check that the daemon is reachable.
    pub async fn new() -> Result<Self> {
        Self::connect(DOCKER_BINARY).await
    }

    /// Like [`DockerOperator::new`] for a binary name or path of choice.
    pub async fn connect(binary: &str) -> Result<Self> {
        let binary = check_prerequisites(binary).await?;
        info!(binary = %binary.display(), "docker runtime available");
        Ok(Self { binary })
    }

    /// Use the given docker binary without any checks.
    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    async fn docker(&self, args: Vec<String>, subject: &str) -> Result<String> {
        exec(&self.binary, &args)
            .await
            .map_err(|e| map_command_error(subject, e))
    }
}

#[async_trait]
impl ContainerOperator for DockerOperator {
    fn name(&self) -> &str {
        DOCKER_BINARY
    }

    async fn run_container(&self, spec: &RunSpec) -> Result<()> {
        let id = self.docker(run_args(spec), &spec.name).await?;
        debug!(name = %spec.name, id = %id, "container started");
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        self.docker(rm_args(&[name.to_string()]), name).await?;
        debug!(name = %name, "container removed");
        Ok(())
    }

    async fn remove_containers(&self, names: &[String]) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        self.docker(rm_args(names), &names.join(", ")).await?;
        debug!(count = names.len(), "containers removed");
        Ok(())
    }

    async fn container_names(&self, prefix: &str) -> Result<Vec<String>> {
        let stdout = self.docker(ps_args(prefix), prefix).await?;
        Ok(parse_names(&stdout, prefix))
    }

    async fn exec(&self, name: &str, spec: &ExecSpec) -> Result<ExecHandle> {
        debug!(name = %name, command = ?spec.command, "exec");
        spawn_exec(&self.binary, &exec_args(name, spec))
    }

    async fn monitor_events(&self, query: &EventsQuery) -> Result<EventStream> {
        info!(prefix = %query.name_prefix, since = %query.since, "subscribing to docker events");
        spawn_event_stream(&self.binary, &events_args(query))
    }
}

fn map_command_error(subject: &str, err: CommandError) -> RuntimeError {
    if NOT_FOUND_MARKERS.iter().any(|m| err.detail.contains(m)) {
        return RuntimeError::NotFound(subject.to_string());
    }
    RuntimeError::CommandFailed {
        command: err.command,
        code: err.code,
        stderr: err.detail,
    }
}

// ---------------------------------------------------------------------------
// Argument builders
// ---------------------------------------------------------------------------

pub(crate) fn run_args(spec: &RunSpec) -> Vec<String> {
    let network = if spec.resources.network_disabled {
        "none"
    } else {
        "bridge"
    };

    let mut args = vec![
        "run".to_string(),
        "-d".into(),
        "-it".into(),
        "--name".into(),
        spec.name.clone(),
        format!("--memory={}m", spec.resources.memory_mb),
        format!("--cpus={}", spec.resources.cpus),
        "--network".into(),
        network.into(),
    ];
    if let Some(tmpfs) = &spec.tmpfs {
        args.push("--mount".into());
        args.push(format!(
            "type=tmpfs,destination={},tmpfs-size={}",
            tmpfs.destination, tmpfs.size_bytes
        ));
    }
    args.push("-u".into());
    args.push(spec.user.clone());
    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());
    args
}

pub(crate) fn rm_args(names: &[String]) -> Vec<String> {
    let mut args = vec!["rm".to_string(), "-f".into()];
    args.extend(names.iter().cloned());
    args
}

pub(crate) fn ps_args(prefix: &str) -> Vec<String> {
    vec![
        "ps".to_string(),
        "-a".into(),
        "--filter".into(),
        format!("name={prefix}"),
        "--format".into(),
        "{{.Names}}".into(),
    ]
}

pub(crate) fn exec_args(name: &str, spec: &ExecSpec) -> Vec<String> {
    let mut args = vec!["exec".to_string()];
    if let Some(workdir) = &spec.workdir {
        args.push("-w".into());
        args.push(workdir.clone());
    }
    args.push("-u".into());
    args.push(spec.user.clone());
    args.push(name.to_string());
    args.extend(spec.command.iter().cloned());
    args
}

pub(crate) fn events_args(query: &EventsQuery) -> Vec<String> {
    let mut args = vec![
        "events".to_string(),
        "--filter".into(),
        format!("container={}", query.name_prefix),
    ];
    for event in &query.event_types {
        args.push("--filter".into());
        args.push(format!("event={event}"));
    }
    args.push("--format".into());
    args.push(EVENT_FORMAT.into());
    args.push("--since".into());
    args.push(format!(
        "{}.{:09}",
        query.since.timestamp(),
        query.since.timestamp_subsec_nanos()
    ));
    args
}

/// `docker ps --filter name=` matches substrings, keep only real prefix matches.
fn parse_names(stdout: &str, prefix: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|name| !name.is_empty() && name.starts_with(prefix))
        .map(str::to_string)
        .collect()
}
