use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::BorrowSettings;
use crate::error::{BorrowError, ExecutorError};
use crate::executor::{Executor, Lease};
use crate::kind::ExecutorKind;
use crate::pool::ExecutorSource;

/// An executor reserved for one caller and the lease proving it.
#[derive(Debug)]
pub struct Borrowed {
    pub executor: Arc<Executor>,
    pub lease: Lease,
}

/// Borrows executors from a pool with a bounded number of attempts.
pub struct ExecutorManager {
    settings: BorrowSettings,
    source: Arc<dyn ExecutorSource>,
}

impl ExecutorManager {
    pub fn new(settings: BorrowSettings, source: Arc<dyn ExecutorSource>) -> Self {
        Self { settings, source }
    }

    /// Get a ready executor of `kind` and reserve it for the caller.
    ///
    /// An attempt fails when the pool has nothing to give or another
    /// borrower reserved the executor first. Fatal pool errors are returned
    /// at once; otherwise the call sleeps `delay` between attempts and fails
    /// with [`BorrowError::Exhausted`] after the last one.
    pub async fn borrow(&self, kind: ExecutorKind) -> Result<Borrowed, BorrowError> {
        let attempts = self.settings.attempts;
        for attempt in 1..=attempts {
            match self.source.get_available_executor(kind).await {
                Ok(executor) => {
                    if let Some(lease) = executor.try_reserve() {
                        debug!(id = %executor.id(), attempt, "executor borrowed");
                        return Ok(Borrowed { executor, lease });
                    }
                    debug!(id = %executor.id(), attempt, "executor taken by another borrower");
                }
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => {
                    info!(kind = %kind, attempt, attempts, error = %e, "no executor available");
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.settings.delay()).await;
            }
        }

        warn!(kind = %kind, attempts, "executor pool exhausted");
        Err(BorrowError::Exhausted { kind, attempts })
    }

    /// Give a borrowed executor back to its pool.
    ///
    /// Fails without touching the executor if the lease went stale.
    pub fn redeem(&self, borrowed: &Borrowed) -> Result<(), ExecutorError> {
        borrowed.executor.release(borrowed.lease)
    }
}
