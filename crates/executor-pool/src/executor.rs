use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use sandbox::{ContainerOperator, ExecHandle, RunSpec};
use tokio::sync::{broadcast, mpsc};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::container::{ContainerState, SandboxContainer};
use crate::error::ExecutorError;
use crate::events::EventsMonitor;
use crate::kind::{ExecutorKind, ExecutorParameters};

const NOTIFY_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    /// Container created, first start not yet observed.
    New,
    Ready,
    Reserved,
    Executing,
    /// Returned by its borrower, about to be reset.
    Released,
    /// Container being recreated.
    Reset,
    Eliminated,
}

impl ExecutorState {
    pub fn is_ready(self) -> bool {
        self == Self::Ready
    }

    /// States that must not last longer than the hang timeout.
    pub fn is_time_bounded(self) -> bool {
        matches!(self, Self::Reserved | Self::Executing | Self::Released)
    }
}

impl fmt::Display for ExecutorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Ready => "ready",
            Self::Reserved => "reserved",
            Self::Executing => "executing",
            Self::Released => "released",
            Self::Reset => "reset",
            Self::Eliminated => "eliminated",
        };
        f.write_str(s)
    }
}

/// State an executor moves to when its container reports `container`.
/// `None` means no transition.
pub(crate) fn next_state(
    current: ExecutorState,
    container: ContainerState,
) -> Option<ExecutorState> {
    use ExecutorState::{Eliminated, New, Ready, Reset};

    match (current, container) {
        (Eliminated, _) => None,
        (_, ContainerState::Running) => Some(Ready),
        // First boot has not happened yet.
        (New, ContainerState::Stopped) => None,
        // Removal requested by the reset itself.
        (Reset, ContainerState::Deleted) => None,
        (_, ContainerState::Deleted) => Some(Eliminated),
        (_, ContainerState::Stopped | ContainerState::Paused | ContainerState::Unknown) => {
            Some(Reset)
        }
    }
}

/// An observed executor state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub id: String,
    pub from: ExecutorState,
    pub to: ExecutorState,
}

struct Status {
    state: ExecutorState,
    since: Instant,
}

/// Proof that the holder reserved an executor. A lease goes stale once the
/// executor is released, reset or reserved by someone else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease(u64);

#[derive(Default)]
struct Reservation {
    held: bool,
    /// Bumped on every reservation, so each lease is unique.
    generation: u64,
    since: Option<Instant>,
}

impl Reservation {
    fn holds(&self, lease: Lease) -> bool {
        self.held && self.generation == lease.0
    }

    fn take(&mut self) -> Lease {
        self.held = true;
        self.generation += 1;
        self.since = Some(Instant::now());
        Lease(self.generation)
    }

    fn clear(&mut self) {
        self.held = false;
        self.since = None;
    }
}

/// A sandbox container that can be reserved by one borrower at a time and
/// run scripts.
pub struct Executor {
    kind: ExecutorKind,
    parameters: ExecutorParameters,
    container: SandboxContainer,
    status: Mutex<Status>,
    reservation: Mutex<Reservation>,
    readiness: broadcast::Sender<bool>,
    transitions: broadcast::Sender<Transition>,
    tracker: TaskTracker,
}

impl Executor {
    /// Run the container for `spec` and wrap it in a `New` executor.
    ///
    /// Background resets are spawned on `tracker`.
    pub async fn start(
        kind: ExecutorKind,
        parameters: ExecutorParameters,
        spec: RunSpec,
        operator: Arc<dyn ContainerOperator>,
        feed: Arc<EventsMonitor>,
        tracker: TaskTracker,
    ) -> Result<Arc<Self>, ExecutorError> {
        let (container, states) = SandboxContainer::run(spec, operator, feed).await?;
        let (readiness, _) = broadcast::channel(NOTIFY_CAPACITY);
        let (transitions, _) = broadcast::channel(NOTIFY_CAPACITY);

        let executor = Arc::new(Self {
            kind,
            parameters,
            container,
            status: Mutex::new(Status {
                state: ExecutorState::New,
                since: Instant::now(),
            }),
            reservation: Mutex::new(Reservation::default()),
            readiness,
            transitions,
            tracker,
        });
        spawn_state_applier(Arc::downgrade(&executor), states);

        info!(id = %executor.id(), kind = %kind, "executor created");
        Ok(executor)
    }

    pub fn id(&self) -> &str {
        self.container.name()
    }

    pub fn kind(&self) -> ExecutorKind {
        self.kind
    }

    pub fn parameters(&self) -> &ExecutorParameters {
        &self.parameters
    }

    pub fn state(&self) -> ExecutorState {
        self.status.lock().unwrap_or_else(PoisonError::into_inner).state
    }

    /// When the current state was entered.
    pub fn state_since(&self) -> Instant {
        self.status.lock().unwrap_or_else(PoisonError::into_inner).since
    }

    pub fn state_age(&self) -> Duration {
        self.state_since().elapsed()
    }

    pub fn is_reserved(&self) -> bool {
        self.reservation().held
    }

    pub fn reserved_at(&self) -> Option<Instant> {
        self.reservation().since
    }

    /// Whether `lease` is the executor's current reservation.
    pub fn holds(&self, lease: Lease) -> bool {
        self.reservation().holds(lease)
    }

    fn reservation(&self) -> MutexGuard<'_, Reservation> {
        self.reservation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `true` each time the executor becomes ready, `false` on every other
    /// transition.
    pub fn readiness(&self) -> broadcast::Receiver<bool> {
        self.readiness.subscribe()
    }

    pub fn transitions(&self) -> broadcast::Receiver<Transition> {
        self.transitions.subscribe()
    }

    /// Wait until the executor is ready. Returns `false` on timeout or if
    /// the executor is eliminated first.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let mut readiness = self.readiness();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.state() {
                ExecutorState::Ready => return true,
                ExecutorState::Eliminated => return false,
                _ => {}
            }
            match tokio::time::timeout_at(deadline, readiness.recv()).await {
                Ok(Ok(true)) => return true,
                Ok(Ok(false)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => {
                    return self.state().is_ready();
                }
            }
        }
    }

    /// Reserve the executor for one borrower.
    ///
    /// Succeeds for exactly one caller while the executor is ready. The
    /// returned lease is required to execute and release.
    pub fn try_reserve(&self) -> Option<Lease> {
        let mut reservation = self.reservation();
        if reservation.held {
            debug!(id = %self.id(), "executor already reserved");
            return None;
        }
        let moved = self.update(|state| state.is_ready().then_some(ExecutorState::Reserved));
        if moved.is_none() {
            debug!(id = %self.id(), state = %self.state(), "executor not ready, reservation refused");
            return None;
        }
        Some(reservation.take())
    }

    /// Take the reservation without changing state, so no borrower can
    /// reserve the executor. Used before removing an idle executor.
    pub(crate) fn try_claim(&self) -> bool {
        let mut reservation = self.reservation();
        if reservation.held {
            return false;
        }
        reservation.take();
        true
    }

    /// Start `script` in the container under the reservation `lease`.
    pub async fn execute(&self, lease: Lease, script: &str) -> Result<ExecHandle, ExecutorError> {
        if script.trim().is_empty() {
            return Err(ExecutorError::InvalidArgument("script is empty".into()));
        }
        {
            let reservation = self.reservation();
            if !reservation.holds(lease) {
                return Err(ExecutorError::NotReserved(self.id().to_string()));
            }
            self.update(|state| {
                (state != ExecutorState::Eliminated).then_some(ExecutorState::Executing)
            });
        }

        info!(id = %self.id(), "executing script");
        let handle = self.container.exec(&self.kind.exec_spec(script)).await?;
        Ok(handle)
    }

    /// Give the executor back. Clears the reservation and recreates the
    /// container in the background.
    ///
    /// Fails if `lease` went stale, e.g. because a hang sweep reset the
    /// executor and another borrower reserved it since.
    pub fn release(self: &Arc<Self>, lease: Lease) -> Result<(), ExecutorError> {
        let moved = {
            let mut reservation = self.reservation();
            if !reservation.holds(lease) {
                return Err(ExecutorError::NotReserved(self.id().to_string()));
            }
            let moved = self.update(|state| {
                (state != ExecutorState::Eliminated).then_some(ExecutorState::Released)
            });
            reservation.clear();
            moved
        };
        info!(id = %self.id(), "executor released");

        if moved.is_some() {
            self.spawn_reset();
        }
        Ok(())
    }

    /// Recreate the container. The executor becomes ready again once the new
    /// container starts. Any reservation is dropped.
    pub async fn reset(&self) -> Result<(), ExecutorError> {
        {
            let mut reservation = self.reservation();
            if self.state() == ExecutorState::Eliminated {
                return Ok(());
            }
            self.update(|state| {
                (state != ExecutorState::Eliminated).then_some(ExecutorState::Reset)
            });
            reservation.clear();
        }
        self.container.rerun().await?;
        Ok(())
    }

    /// Remove the container for good.
    pub async fn eliminate(&self) -> Result<(), ExecutorError> {
        self.update(|_| Some(ExecutorState::Eliminated));
        self.container.remove().await?;
        Ok(())
    }

    fn spawn_reset(self: &Arc<Self>) {
        let executor = Arc::clone(self);
        self.tracker.spawn(async move {
            if let Err(e) = executor.reset().await {
                warn!(id = %executor.id(), error = %e, "background reset failed");
            }
        });
    }

    /// Follow a container state change. A container that stopped on its
    /// own is recreated.
    fn apply(self: &Arc<Self>, container: ContainerState) {
        debug!(id = %self.id(), container = %container, "container state");
        let moved = {
            let mut reservation = self.reservation();
            let moved = self.update(|state| next_state(state, container));
            if moved == Some(ExecutorState::Reset) {
                reservation.clear();
            }
            moved
        };
        if moved == Some(ExecutorState::Reset) {
            warn!(id = %self.id(), container = %container, "container stopped unexpectedly, recreating");
            self.spawn_reset();
        }
    }

    /// Move to the state chosen by `decide`, notifying observers if it
    /// changed. Returns the new state on a real transition.
    fn update(
        &self,
        decide: impl FnOnce(ExecutorState) -> Option<ExecutorState>,
    ) -> Option<ExecutorState> {
        let (from, to) = {
            let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
            let from = status.state;
            let to = decide(from)?;
            if to == from {
                return None;
            }
            status.state = to;
            status.since = Instant::now();
            (from, to)
        };

        info!(id = %self.id(), from = %from, to = %to, "executor state changed");
        let _ = self.readiness.send(to.is_ready());
        let _ = self.transitions.send(Transition {
            id: self.id().to_string(),
            from,
            to,
        });
        Some(to)
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("id", &self.id())
            .field("kind", &self.kind)
            .field("state", &self.state())
            .field("reserved", &self.is_reserved())
            .finish()
    }
}

/// Feed container states into the executor until the container stream
/// closes or the executor is dropped.
fn spawn_state_applier(executor: Weak<Executor>, mut states: mpsc::UnboundedReceiver<ContainerState>) {
    tokio::spawn(async move {
        while let Some(state) = states.recv().await {
            let Some(executor) = executor.upgrade() else {
                break;
            };
            executor.apply(state);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeOperator, wait_until};

    const READY_TIMEOUT: Duration = Duration::from_secs(2);

    async fn executor_on(op: &Arc<FakeOperator>, name: &str) -> Arc<Executor> {
        let feed = Arc::new(EventsMonitor::new("pool", op.clone()));
        feed.start().await.unwrap();
        let kind = ExecutorKind::Dotnet;
        let profile = kind.default_profile();
        Executor::start(
            kind,
            kind.parameters(&profile),
            kind.run_spec(name, &profile),
            op.clone(),
            feed,
            TaskTracker::new(),
        )
        .await
        .unwrap()
    }

    async fn ready_executor(op: &Arc<FakeOperator>) -> Arc<Executor> {
        let executor = executor_on(op, "pool-dotnet-00000001").await;
        assert!(executor.wait_ready(READY_TIMEOUT).await);
        executor
    }

    #[test]
    fn container_state_transitions() {
        use ContainerState as C;
        use ExecutorState as E;

        for state in [E::New, E::Ready, E::Reserved, E::Executing, E::Released, E::Reset] {
            assert_eq!(next_state(state, C::Running), Some(E::Ready), "{state}");
            assert_eq!(next_state(state, C::Paused), Some(E::Reset), "{state}");
            assert_eq!(next_state(state, C::Unknown), Some(E::Reset), "{state}");
        }

        assert_eq!(next_state(E::New, C::Stopped), None);
        assert_eq!(next_state(E::Ready, C::Stopped), Some(E::Reset));
        assert_eq!(next_state(E::Executing, C::Stopped), Some(E::Reset));

        assert_eq!(next_state(E::Reset, C::Deleted), None);
        for state in [E::New, E::Ready, E::Reserved, E::Executing, E::Released] {
            assert_eq!(next_state(state, C::Deleted), Some(E::Eliminated), "{state}");
        }

        for container in [C::Running, C::Stopped, C::Paused, C::Deleted, C::Unknown] {
            assert_eq!(next_state(E::Eliminated, container), None);
        }
    }

    #[test]
    fn time_bounded_states() {
        assert!(ExecutorState::Reserved.is_time_bounded());
        assert!(ExecutorState::Executing.is_time_bounded());
        assert!(ExecutorState::Released.is_time_bounded());
        assert!(!ExecutorState::Ready.is_time_bounded());
        assert!(!ExecutorState::Reset.is_time_bounded());
    }

    #[tokio::test]
    async fn becomes_ready_when_container_starts() {
        let op = FakeOperator::new();
        let executor = executor_on(&op, "pool-dotnet-00000001").await;

        assert!(executor.wait_ready(READY_TIMEOUT).await);
        assert_eq!(executor.state(), ExecutorState::Ready);
        assert!(!executor.is_reserved());
    }

    #[tokio::test]
    async fn stays_new_until_first_start() {
        let op = FakeOperator::never_starting();
        let executor = executor_on(&op, "pool-dotnet-00000001").await;

        assert!(!executor.wait_ready(Duration::from_millis(100)).await);
        assert_eq!(executor.state(), ExecutorState::New);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reservation_has_one_winner() {
        let op = FakeOperator::new();
        let executor = ready_executor(&op).await;

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..32 {
            let executor = Arc::clone(&executor);
            tasks.spawn(async move { executor.try_reserve() });
        }
        let mut winners = 0;
        while let Some(result) = tasks.join_next().await {
            if result.unwrap().is_some() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        assert_eq!(executor.state(), ExecutorState::Reserved);
        assert!(executor.reserved_at().is_some());
    }

    #[tokio::test]
    async fn reserve_requires_ready() {
        let op = FakeOperator::never_starting();
        let executor = executor_on(&op, "pool-dotnet-00000001").await;

        assert!(executor.try_reserve().is_none());
        assert!(!executor.is_reserved());
    }

    #[tokio::test]
    async fn readiness_emits_true_once_per_ready_transition() {
        let op = FakeOperator::new();
        let executor = ready_executor(&op).await;
        let mut readiness = executor.readiness();

        assert!(executor.try_reserve().is_some());
        op.emit("pool-dotnet-00000001,restart");
        op.emit("pool-dotnet-00000001,start");

        assert!(!readiness.recv().await.unwrap());
        assert!(readiness.recv().await.unwrap());
        // The second `start` is a no-op, nothing else is emitted.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(readiness.try_recv().is_err());
    }

    #[tokio::test]
    async fn execute_rejects_blank_script() {
        let op = FakeOperator::new();
        let executor = ready_executor(&op).await;
        let lease = executor.try_reserve().unwrap();

        let err = executor.execute(lease, "  \n").await.unwrap_err();
        assert!(matches!(err, ExecutorError::InvalidArgument(_)), "got: {err}");
        assert!(op.execs().is_empty());
    }

    #[tokio::test]
    async fn execute_requires_current_lease() {
        let op = FakeOperator::new();
        let executor = ready_executor(&op).await;
        let lease = executor.try_reserve().unwrap();
        executor.release(lease).unwrap();

        let err = executor.execute(lease, "return 1;").await.unwrap_err();
        assert!(matches!(err, ExecutorError::NotReserved(_)), "got: {err}");
        assert!(op.execs().is_empty());
    }

    #[tokio::test]
    async fn execute_runs_kind_command() {
        let op = FakeOperator::new();
        op.set_exec_output(&["hello"]);
        let executor = ready_executor(&op).await;
        let lease = executor.try_reserve().unwrap();

        let mut handle = executor
            .execute(lease, "Console.WriteLine(\"hello\");")
            .await
            .unwrap();
        assert_eq!(executor.state(), ExecutorState::Executing);
        handle.job.await.unwrap().unwrap();
        assert_eq!(handle.output.recv().await.unwrap(), "hello");

        let execs = op.execs();
        assert_eq!(execs.len(), 1);
        assert_eq!(execs[0].0, "pool-dotnet-00000001");
        assert_eq!(execs[0].1.command[0], "/restore-dir/exec.sh");
    }

    #[tokio::test]
    async fn released_executor_returns_to_ready() {
        let op = FakeOperator::new();
        let executor = ready_executor(&op).await;
        let mut transitions = executor.transitions();
        let lease = executor.try_reserve().unwrap();

        executor.release(lease).unwrap();
        assert!(!executor.is_reserved());

        let mut seen = Vec::new();
        while seen.last() != Some(&ExecutorState::Ready) {
            let transition = tokio::time::timeout(READY_TIMEOUT, transitions.recv())
                .await
                .unwrap()
                .unwrap();
            seen.push(transition.to);
        }
        assert_eq!(
            seen,
            vec![
                ExecutorState::Reserved,
                ExecutorState::Released,
                ExecutorState::Reset,
                ExecutorState::Ready
            ]
        );
        assert_eq!(op.run_count(), 2);
    }

    #[tokio::test]
    async fn second_release_fails() {
        let op = FakeOperator::new();
        let executor = ready_executor(&op).await;
        let lease = executor.try_reserve().unwrap();
        executor.release(lease).unwrap();

        let err = executor.release(lease).unwrap_err();
        assert!(matches!(err, ExecutorError::NotReserved(_)), "got: {err}");
    }

    #[tokio::test]
    async fn lease_from_before_reset_cannot_touch_next_reservation() {
        let op = FakeOperator::new();
        let executor = ready_executor(&op).await;
        let stale = executor.try_reserve().unwrap();

        executor.reset().await.unwrap();
        wait_until("executor ready after reset", || executor.state().is_ready()).await;
        let current = executor.try_reserve().unwrap();
        assert_ne!(stale, current);

        let err = executor.release(stale).unwrap_err();
        assert!(matches!(err, ExecutorError::NotReserved(_)), "got: {err}");
        let err = executor.execute(stale, "return 1;").await.unwrap_err();
        assert!(matches!(err, ExecutorError::NotReserved(_)), "got: {err}");

        assert!(executor.holds(current));
        assert_eq!(executor.state(), ExecutorState::Reserved);
        assert!(executor.try_reserve().is_none());
    }

    #[tokio::test]
    async fn reset_clears_reservation_and_recreates() {
        let op = FakeOperator::new();
        let executor = ready_executor(&op).await;
        let lease = executor.try_reserve().unwrap();

        executor.reset().await.unwrap();
        assert!(!executor.is_reserved());
        assert!(!executor.holds(lease));
        wait_until("executor ready after reset", || executor.state().is_ready()).await;
        assert_eq!(op.run_count(), 2);
    }

    #[tokio::test]
    async fn stopped_container_is_recreated() {
        let op = FakeOperator::new();
        let executor = ready_executor(&op).await;

        op.emit("pool-dotnet-00000001,die");

        wait_until("container recreated", || {
            op.run_count() == 2 && executor.state().is_ready()
        })
        .await;
        assert!(op.is_live("pool-dotnet-00000001"));
    }

    #[tokio::test]
    async fn paused_container_drops_reservation_and_recovers() {
        let op = FakeOperator::new();
        let executor = ready_executor(&op).await;
        let lease = executor.try_reserve().unwrap();

        op.emit("pool-dotnet-00000001,pause");

        wait_until("executor recovered", || {
            op.run_count() == 2 && executor.state().is_ready()
        })
        .await;
        assert!(!executor.holds(lease));
        assert!(executor.try_reserve().is_some());
    }

    #[tokio::test]
    async fn debug_shows_identity_and_state() {
        let op = FakeOperator::new();
        let executor = ready_executor(&op).await;

        let debug = format!("{executor:?}");
        assert!(debug.contains("pool-dotnet-00000001"), "{debug}");
        assert!(debug.contains("Dotnet"), "{debug}");
        assert!(debug.contains("Ready"), "{debug}");
    }

    #[tokio::test]
    async fn external_destroy_eliminates() {
        let op = FakeOperator::new();
        let executor = ready_executor(&op).await;

        op.emit("pool-dotnet-00000001,destroy");
        wait_until("executor eliminated", || {
            executor.state() == ExecutorState::Eliminated
        })
        .await;

        op.emit("pool-dotnet-00000001,start");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(executor.state(), ExecutorState::Eliminated);
    }

    #[tokio::test]
    async fn eliminate_removes_container() {
        let op = FakeOperator::new();
        let executor = ready_executor(&op).await;

        executor.eliminate().await.unwrap();
        assert_eq!(executor.state(), ExecutorState::Eliminated);
        assert!(!op.is_live("pool-dotnet-00000001"));

        // Nothing brings an eliminated executor back.
        executor.reset().await.unwrap();
        assert_eq!(executor.state(), ExecutorState::Eliminated);
        assert_eq!(op.run_count(), 1);
    }
}
