/// Resource caps applied to a sandbox container at creation time.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLimits {
    pub memory_mb: u32,
    pub cpus: f64,
    /// Run with networking disabled (`none`) instead of the default bridge.
    pub network_disabled: bool,
}

/// Size-capped in-memory scratch mount inside the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TmpfsMount {
    pub destination: String,
    pub size_bytes: u64,
}

/// Everything needed to create and start one container.
///
/// Kept by the owning sandbox container so it can be recreated verbatim
/// after a reset.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSpec {
    /// Container name; doubles as the runtime's container identifier.
    pub name: String,
    pub image: String,
    /// Optional command overriding the image entrypoint arguments.
    pub command: Vec<String>,
    pub user: String,
    pub resources: ResourceLimits,
    pub tmpfs: Option<TmpfsMount>,
}

/// A command to run inside an already running container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecSpec {
    pub command: Vec<String>,
    pub workdir: Option<String>,
    pub user: String,
}
