//! In-memory container runtime for unit tests.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sandbox::{
    ContainerOperator, EventStream, EventsQuery, ExecHandle, ExecSpec, ProcessExit, Result,
    RunSpec, RuntimeError, output_channel,
};
use tokio::sync::mpsc;

#[derive(Default)]
struct FakeState {
    events_tx: Option<mpsc::UnboundedSender<String>>,
    events_query: Option<EventsQuery>,
    fail_monitor: bool,
    fail_run: bool,
    /// How long `run_container` takes before the container exists.
    run_delay: Option<Duration>,
    /// Emit `create` and `start` events when a container is run.
    auto_start: bool,
    live: HashSet<String>,
    leftovers: Vec<String>,
    runs: Vec<RunSpec>,
    removed: Vec<String>,
    execs: Vec<(String, ExecSpec)>,
    exec_output: Vec<String>,
    exec_hangs: bool,
}

/// Records every call and replays realistic `name,status` event lines
/// through the stream handed to the events monitor.
pub(crate) struct FakeOperator {
    state: Mutex<FakeState>,
}

impl FakeOperator {
    /// Runtime whose containers start as soon as they are run.
    pub fn new() -> Arc<Self> {
        let op = Arc::new(Self {
            state: Mutex::new(FakeState::default()),
        });
        op.set_auto_start(true);
        op
    }

    /// Runtime whose containers never report `start`.
    pub fn never_starting() -> Arc<Self> {
        let op = Self::new();
        op.set_auto_start(false);
        op
    }

    fn with<T>(&self, f: impl FnOnce(&mut FakeState) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn set_auto_start(&self, auto_start: bool) {
        self.with(|s| s.auto_start = auto_start);
    }

    pub fn fail_monitor(&self, fail: bool) {
        self.with(|s| s.fail_monitor = fail);
    }

    pub fn fail_run(&self, fail: bool) {
        self.with(|s| s.fail_run = fail);
    }

    pub fn set_run_delay(&self, delay: Duration) {
        self.with(|s| s.run_delay = Some(delay));
    }

    pub fn set_exec_output(&self, lines: &[&str]) {
        self.with(|s| s.exec_output = lines.iter().map(|l| l.to_string()).collect());
    }

    pub fn set_exec_hangs(&self, hangs: bool) {
        self.with(|s| s.exec_hangs = hangs);
    }

    /// Pretend a previous process left this container behind.
    pub fn add_leftover(&self, name: &str) {
        self.with(|s| s.leftovers.push(name.to_string()));
    }

    /// Push a raw event line to the monitor.
    pub fn emit(&self, line: &str) {
        self.with(|s| {
            if let Some(tx) = &s.events_tx {
                let _ = tx.send(line.to_string());
            }
        });
    }

    pub fn last_events_query(&self) -> Option<EventsQuery> {
        self.with(|s| s.events_query.clone())
    }

    pub fn runs(&self) -> Vec<RunSpec> {
        self.with(|s| s.runs.clone())
    }

    pub fn run_count(&self) -> usize {
        self.with(|s| s.runs.len())
    }

    pub fn removed(&self) -> Vec<String> {
        self.with(|s| s.removed.clone())
    }

    pub fn execs(&self) -> Vec<(String, ExecSpec)> {
        self.with(|s| s.execs.clone())
    }

    pub fn live_count(&self) -> usize {
        self.with(|s| s.live.len())
    }

    pub fn is_live(&self, name: &str) -> bool {
        self.with(|s| s.live.contains(name))
    }
}

fn emit_locked(state: &FakeState, name: &str, statuses: &[&str]) {
    if let Some(tx) = &state.events_tx {
        for status in statuses {
            let _ = tx.send(format!("{name},{status}"));
        }
    }
}

#[async_trait]
impl ContainerOperator for FakeOperator {
    fn name(&self) -> &str {
        "fake"
    }

    async fn run_container(&self, spec: &RunSpec) -> Result<()> {
        if let Some(delay) = self.with(|s| s.run_delay) {
            tokio::time::sleep(delay).await;
        }
        self.with(|s| {
            if s.fail_run {
                return Err(RuntimeError::CommandFailed {
                    command: format!("run {}", spec.name),
                    code: Some(125),
                    stderr: "image not found".into(),
                });
            }
            s.runs.push(spec.clone());
            s.live.insert(spec.name.clone());
            if s.auto_start {
                emit_locked(s, &spec.name, &["create", "start"]);
            } else {
                emit_locked(s, &spec.name, &["create"]);
            }
            Ok(())
        })
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        self.with(|s| {
            if !s.live.remove(name) {
                return Err(RuntimeError::NotFound(name.to_string()));
            }
            s.removed.push(name.to_string());
            emit_locked(s, name, &["kill", "die", "destroy"]);
            Ok(())
        })
    }

    async fn remove_containers(&self, names: &[String]) -> Result<()> {
        self.with(|s| {
            for name in names {
                s.live.remove(name);
                s.leftovers.retain(|l| l != name);
                s.removed.push(name.clone());
            }
        });
        Ok(())
    }

    async fn container_names(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self.with(|s| {
            s.leftovers
                .iter()
                .chain(s.live.iter())
                .filter(|n| n.starts_with(prefix))
                .cloned()
                .collect()
        }))
    }

    async fn exec(&self, name: &str, spec: &ExecSpec) -> Result<ExecHandle> {
        let (lines, hangs) = self.with(|s| {
            s.execs.push((name.to_string(), spec.clone()));
            (s.exec_output.clone(), s.exec_hangs)
        });

        let (tx, output) = output_channel();
        for line in lines {
            let _ = tx.send(line);
        }
        let job = tokio::spawn(async move {
            let _tx = tx;
            if hangs {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Ok(ProcessExit { exit_code: Some(0) })
        });
        Ok(ExecHandle { job, output })
    }

    async fn monitor_events(&self, query: &EventsQuery) -> Result<EventStream> {
        self.with(|s| {
            if s.fail_monitor {
                return Err(RuntimeError::NotAvailable("daemon down".into()));
            }
            let (tx, lines) = mpsc::unbounded_channel();
            s.events_tx = Some(tx);
            s.events_query = Some(query.clone());
            let job = tokio::spawn(std::future::pending::<Result<()>>());
            Ok(EventStream { job, lines })
        })
    }
}

/// Poll `condition` until it holds, failing the test after two seconds.
pub(crate) async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
