use std::sync::Arc;

use sandbox::ContainerOperator;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::config::ExecutorProfiles;
use crate::error::ExecutorError;
use crate::events::EventsMonitor;
use crate::executor::Executor;
use crate::kind::ExecutorKind;

/// Creates executors whose containers are named `<pool>-<kind>-<8 hex>`.
pub struct ExecutorFactory {
    pool_name: String,
    profiles: ExecutorProfiles,
    operator: Arc<dyn ContainerOperator>,
    feed: Arc<EventsMonitor>,
    tracker: TaskTracker,
}

impl ExecutorFactory {
    pub fn new(
        pool_name: impl Into<String>,
        profiles: ExecutorProfiles,
        operator: Arc<dyn ContainerOperator>,
        feed: Arc<EventsMonitor>,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            pool_name: pool_name.into(),
            profiles,
            operator,
            feed,
            tracker,
        }
    }

    pub fn container_name(&self, kind: ExecutorKind) -> String {
        let id: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();
        format!("{}-{kind}-{id}", self.pool_name)
    }

    pub async fn create(&self, kind: ExecutorKind) -> Result<Arc<Executor>, ExecutorError> {
        let profile = self.profiles.get(kind);
        let name = self.container_name(kind);
        Executor::start(
            kind,
            kind.parameters(profile),
            kind.run_spec(&name, profile),
            Arc::clone(&self.operator),
            Arc::clone(&self.feed),
            self.tracker.clone(),
        )
        .await
    }
}
