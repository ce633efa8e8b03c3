//! Elastic pool of executors.
//!
//! Design:
//! - [`ExecutorPool::start`] removes orphaned containers, warms up
//!   `min_ready` executors per kind and launches the shrink and hang sweeps
//! - [`ExecutorPool::get_available_executor`] hands out a ready executor, or
//!   creates one on demand and extends the pool in the background
//! - The pool never tracks more than `max_size` executors; in-flight
//!   creations count against the limit
//! - The hang sweep resets stuck executors and stops tracking dead ones

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use sandbox::ContainerOperator;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::{ExecutorProfiles, PoolSettings};
use crate::error::PoolError;
use crate::events::EventsMonitor;
use crate::executor::{Executor, ExecutorState};
use crate::factory::ExecutorFactory;
use crate::gc::collect_orphans;
use crate::kind::ExecutorKind;

// ---------------------------------------------------------------------------
// Sizing (pure functions)
// ---------------------------------------------------------------------------

/// Executors to add when a kind is below its ready target.
///
/// An empty pool gets the minimum target; otherwise the pool doubles, capped
/// by the headroom left under `max_size`.
pub(crate) fn extension_count(total: usize, min_ready: usize, max_size: usize) -> usize {
    let headroom = max_size.saturating_sub(total);
    if total == 0 {
        min_ready.min(headroom)
    } else {
        total.min(headroom)
    }
}

/// Ready executors of one kind to eliminate in a shrink pass.
///
/// Nothing is removed until there are more than twice `min_ready`; then
/// half of the surplus over `min_ready` goes, rounded up.
pub(crate) fn shrink_count(ready: usize, min_ready: usize) -> usize {
    if ready <= min_ready.saturating_mul(2) {
        return 0;
    }
    (ready - min_ready).div_ceil(2)
}

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Something that hands out ready executors.
#[async_trait]
pub trait ExecutorSource: Send + Sync {
    async fn get_available_executor(&self, kind: ExecutorKind) -> Result<Arc<Executor>, PoolError>;
}

#[derive(Default)]
struct Slots {
    executors: HashMap<String, Arc<Executor>>,
    /// Creations in flight, per kind.
    pending: HashMap<ExecutorKind, usize>,
}

impl Slots {
    fn total(&self) -> usize {
        self.executors.len() + self.pending.values().sum::<usize>()
    }

    fn count_of(&self, kind: ExecutorKind) -> usize {
        let tracked = self
            .executors
            .values()
            .filter(|e| e.kind() == kind)
            .count();
        tracked + self.pending.get(&kind).copied().unwrap_or(0)
    }

    fn reserve(&mut self, kind: ExecutorKind, count: usize) {
        *self.pending.entry(kind).or_default() += count;
    }

    fn unreserve(&mut self, kind: ExecutorKind) {
        if let Some(n) = self.pending.get_mut(&kind) {
            *n = n.saturating_sub(1);
        }
    }
}

pub struct ExecutorPool {
    settings: PoolSettings,
    factory: ExecutorFactory,
    operator: Arc<dyn ContainerOperator>,
    slots: Mutex<Slots>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    started: AtomicBool,
    stopped: AtomicBool,
    me: Weak<ExecutorPool>,
}

impl ExecutorPool {
    pub fn new(
        settings: PoolSettings,
        profiles: ExecutorProfiles,
        operator: Arc<dyn ContainerOperator>,
        feed: Arc<EventsMonitor>,
    ) -> Arc<Self> {
        let tracker = TaskTracker::new();
        Arc::new_cyclic(|me| Self {
            factory: ExecutorFactory::new(
                settings.name.clone(),
                profiles,
                Arc::clone(&operator),
                feed,
                tracker.clone(),
            ),
            settings,
            operator,
            slots: Mutex::new(Slots::default()),
            tracker,
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            me: me.clone(),
        })
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the tracked executors.
    pub fn snapshot(&self) -> Vec<Arc<Executor>> {
        self.slots().executors.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.slots().executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ready_count(&self, kind: ExecutorKind) -> usize {
        self.snapshot()
            .iter()
            .filter(|e| e.kind() == kind && e.state().is_ready())
            .count()
    }

    /// Remove orphaned containers, warm up every kind and start the
    /// maintenance loops.
    pub async fn start(&self) -> Result<(), PoolError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(PoolError::Stopped);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            warn!(pool = %self.settings.name, "pool already started");
            return Ok(());
        }

        let prefix = self.settings.container_prefix();
        let removed = collect_orphans(self.operator.as_ref(), &prefix).await?;
        info!(pool = %self.settings.name, removed, "startup garbage collection done");

        let timeout = self.settings.readiness_timeout();
        let mut warmup = JoinSet::new();
        for &kind in &self.settings.kinds {
            for executor in self.extend(kind).await {
                warmup.spawn(async move { (executor.id().to_string(), executor.wait_ready(timeout).await) });
            }
        }
        while let Some(result) = warmup.join_next().await {
            match result {
                Ok((_, true)) => {}
                Ok((id, false)) => warn!(id = %id, "executor not ready after warm-up"),
                Err(e) => error!(error = %e, "warm-up task panicked"),
            }
        }

        self.spawn_maintenance();
        info!(
            pool = %self.settings.name,
            executors = self.len(),
            max_size = self.settings.max_size,
            min_ready = self.settings.min_ready,
            "pool started"
        );
        Ok(())
    }

    /// Eliminate every tracked executor, stop the maintenance loops and
    /// wait for background jobs to finish.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();

        let executors: Vec<Arc<Executor>> =
            self.slots().executors.drain().map(|(_, e)| e).collect();
        info!(pool = %self.settings.name, count = executors.len(), "stopping pool");

        let mut set = JoinSet::new();
        for executor in executors {
            set.spawn(async move {
                if let Err(e) = executor.eliminate().await {
                    warn!(id = %executor.id(), error = %e, "failed to eliminate executor");
                }
            });
        }
        while let Some(result) = set.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "elimination task panicked");
            }
        }

        self.tracker.close();
        self.tracker.wait().await;
        info!(pool = %self.settings.name, "pool stopped");
    }

    /// A ready executor of `kind`, created on demand if none is idle.
    ///
    /// Fails with [`PoolError::Exhausted`] when the pool is full and with
    /// [`PoolError::NeverReady`] when a new executor does not become ready
    /// within the readiness timeout.
    pub async fn get_available_executor(
        &self,
        kind: ExecutorKind,
    ) -> Result<Arc<Executor>, PoolError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(PoolError::Stopped);
        }
        if let Some(executor) = self.find_ready(kind) {
            debug!(id = %executor.id(), "found ready executor");
            return Ok(executor);
        }

        {
            let mut slots = self.slots();
            if slots.total() >= self.settings.max_size {
                return Err(PoolError::Exhausted {
                    kind,
                    max_size: self.settings.max_size,
                });
            }
            slots.reserve(kind, 1);
        }

        if let Some(pool) = self.me.upgrade() {
            self.tracker.spawn(async move {
                pool.extend(kind).await;
            });
        }

        info!(kind = %kind, "no ready executor, creating one");
        let executor = self.create_tracked(kind).await?;

        let timeout = self.settings.readiness_timeout();
        if !executor.wait_ready(timeout).await {
            error!(id = %executor.id(), ?timeout, "new executor never became ready");
            self.slots().executors.remove(executor.id());
            if let Err(e) = executor.eliminate().await {
                warn!(id = %executor.id(), error = %e, "failed to eliminate executor");
            }
            return Err(PoolError::NeverReady {
                id: executor.id().to_string(),
                timeout,
            });
        }
        Ok(executor)
    }

    fn find_ready(&self, kind: ExecutorKind) -> Option<Arc<Executor>> {
        self.snapshot()
            .into_iter()
            .find(|e| e.kind() == kind && e.state().is_ready())
    }

    /// Create an executor for a slot already reserved in `pending` and
    /// start tracking it.
    async fn create_tracked(&self, kind: ExecutorKind) -> Result<Arc<Executor>, PoolError> {
        let created = self.factory.create(kind).await;

        let executor = {
            let mut slots = self.slots();
            slots.unreserve(kind);
            let executor = match created {
                Ok(executor) => executor,
                Err(e) => {
                    error!(kind = %kind, error = %e, "failed to create executor");
                    return Err(e.into());
                }
            };
            if !self.stopped.load(Ordering::Acquire) {
                slots
                    .executors
                    .insert(executor.id().to_string(), Arc::clone(&executor));
                return Ok(executor);
            }
            executor
        };

        // The pool stopped while the container was being created.
        if let Err(e) = executor.eliminate().await {
            warn!(id = %executor.id(), error = %e, "failed to eliminate executor");
        }
        Err(PoolError::Stopped)
    }

    /// Add executors of `kind` if it is below its ready target. Returns the
    /// executors created.
    async fn extend(&self, kind: ExecutorKind) -> Vec<Arc<Executor>> {
        if self.stopped.load(Ordering::Acquire) {
            return Vec::new();
        }

        let count = {
            let mut slots = self.slots();
            if slots.count_of(kind) >= self.settings.min_ready {
                return Vec::new();
            }
            let count = extension_count(
                slots.total(),
                self.settings.min_ready,
                self.settings.max_size,
            );
            slots.reserve(kind, count);
            count
        };
        if count == 0 {
            return Vec::new();
        }

        info!(kind = %kind, count, "extending pool");
        let mut set = JoinSet::new();
        for _ in 0..count {
            let Some(pool) = self.me.upgrade() else {
                break;
            };
            set.spawn(async move { pool.create_tracked(kind).await });
        }

        let mut created = Vec::with_capacity(count);
        while let Some(result) = set.join_next().await {
            match result {
                Ok(Ok(executor)) => created.push(executor),
                Ok(Err(e)) => debug!(kind = %kind, error = %e, "extension creation failed"),
                Err(e) => error!(error = %e, "executor creation task panicked"),
            }
        }
        created
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    fn spawn_maintenance(&self) {
        let Some(pool) = self.me.upgrade() else {
            return;
        };

        if self.settings.shrink_enabled {
            let pool = Arc::clone(&pool);
            self.tracker.spawn(every(
                self.settings.shrink_interval(),
                self.shutdown.clone(),
                move || pool.shrink(),
            ));
        }
        if self.settings.detect_hanged_enabled {
            self.tracker.spawn(every(
                self.settings.detect_hanged_interval(),
                self.shutdown.clone(),
                move || pool.detect_hanged(),
            ));
        }
    }

    /// Eliminate the oldest surplus ready executors of every kind.
    pub(crate) fn shrink(&self) {
        let mut doomed = Vec::new();
        {
            let mut slots = self.slots();
            for &kind in &self.settings.kinds {
                let mut ready: Vec<Arc<Executor>> = slots
                    .executors
                    .values()
                    .filter(|e| e.kind() == kind && e.state().is_ready())
                    .cloned()
                    .collect();
                let count = shrink_count(ready.len(), self.settings.min_ready);
                if count == 0 {
                    continue;
                }
                ready.sort_by_key(|e| e.state_since());

                let mut claimed = 0;
                for executor in ready {
                    if claimed == count {
                        break;
                    }
                    // A borrower may be about to reserve it; skip if so.
                    if executor.try_claim() {
                        slots.executors.remove(executor.id());
                        doomed.push(executor);
                        claimed += 1;
                    }
                }
                info!(kind = %kind, count = claimed, "shrinking pool");
            }
        }

        for executor in doomed {
            self.tracker.spawn(async move {
                if let Err(e) = executor.eliminate().await {
                    warn!(id = %executor.id(), error = %e, "failed to eliminate executor");
                }
            });
        }
    }

    /// Reset executors stuck in a time-bounded state.
    ///
    /// Executors whose container was destroyed, or that stayed in `Reset`
    /// past the hanging timeout, are untracked and eliminated so their slot
    /// can be reused.
    pub(crate) fn detect_hanged(&self) {
        let timeout = self.settings.hanging_timeout();
        let mut hung = Vec::new();
        let mut dead = Vec::new();
        self.slots().executors.retain(|_, executor| {
            let state = executor.state();
            let overdue = executor.state_age() > timeout;
            match state {
                ExecutorState::Eliminated => {
                    dead.push(Arc::clone(executor));
                    false
                }
                ExecutorState::Reset if overdue => {
                    dead.push(Arc::clone(executor));
                    false
                }
                _ if state.is_time_bounded() && overdue => {
                    hung.push(Arc::clone(executor));
                    true
                }
                _ => true,
            }
        });

        for executor in dead {
            warn!(id = %executor.id(), state = %executor.state(), "dropping dead executor");
            self.tracker.spawn(async move {
                if let Err(e) = executor.eliminate().await {
                    warn!(id = %executor.id(), error = %e, "failed to eliminate executor");
                }
            });
        }

        for executor in hung {
            warn!(
                id = %executor.id(),
                state = %executor.state(),
                age = ?executor.state_age(),
                "executor hung, resetting"
            );
            self.tracker.spawn(async move {
                if let Err(e) = executor.reset().await {
                    warn!(id = %executor.id(), error = %e, "failed to reset hung executor");
                }
            });
        }
    }
}

#[async_trait]
impl ExecutorSource for ExecutorPool {
    async fn get_available_executor(&self, kind: ExecutorKind) -> Result<Arc<Executor>, PoolError> {
        ExecutorPool::get_available_executor(self, kind).await
    }
}

/// Run `pass` every `period` until `shutdown` fires. The first pass runs one
/// period after start.
async fn every(period: Duration, shutdown: CancellationToken, pass: impl Fn() + Send + 'static) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => pass(),
        }
    }
}
