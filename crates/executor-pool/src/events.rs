//! Demultiplexes the runtime's single event stream into per-container
//! subscriptions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use sandbox::{ContainerEvent, ContainerOperator, EventStream, EventsQuery};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::error::FeedError;

/// Runtime event statuses the monitor subscribes to.
pub const LIFECYCLE_EVENTS: &[&str] = &[
    "create", "start", "restart", "pause", "unpause", "kill", "die", "oom", "stop", "destroy",
];

/// Callback invoked for every event of one container, in runtime order.
pub type EventHandler = Arc<dyn Fn(ContainerEvent) + Send + Sync>;

type Subscribers = Mutex<HashMap<String, EventHandler>>;

/// Watches runtime events for all containers whose names start with a prefix
/// and routes each event to the subscriber registered for that container.
pub struct EventsMonitor {
    prefix: String,
    operator: Arc<dyn ContainerOperator>,
    subscribers: Arc<Subscribers>,
    started: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EventsMonitor {
    pub fn new(prefix: impl Into<String>, operator: Arc<dyn ContainerOperator>) -> Self {
        Self {
            prefix: prefix.into(),
            operator,
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            started: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Open the runtime event stream and start dispatching.
    ///
    /// Only events emitted after this call are observed.
    pub async fn start(&self) -> Result<(), FeedError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(FeedError::AlreadyStarted);
        }

        let query = EventsQuery {
            name_prefix: self.prefix.clone(),
            event_types: LIFECYCLE_EVENTS.iter().map(|s| s.to_string()).collect(),
            since: Utc::now(),
        };
        let EventStream { job, mut lines } = match self.operator.monitor_events(&query).await {
            Ok(stream) => stream,
            Err(e) => {
                self.started.store(false, Ordering::Release);
                return Err(e.into());
            }
        };

        let subscribers = Arc::clone(&self.subscribers);
        let prefix = self.prefix.clone();
        let task = tokio::spawn(async move {
            while let Some(line) = lines.recv().await {
                dispatch(&subscribers, &line);
            }
            match job.await {
                Ok(Ok(())) => debug!(prefix = %prefix, "events stream closed"),
                Ok(Err(e)) => error!(prefix = %prefix, error = %e, "events stream failed"),
                Err(e) => error!(prefix = %prefix, error = %e, "events stream task panicked"),
            }
        });
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);

        info!(prefix = %self.prefix, runtime = self.operator.name(), "events monitor started");
        Ok(())
    }

    /// Stop dispatching and close the runtime event stream. Subscriptions
    /// are kept.
    pub fn stop(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
            info!(prefix = %self.prefix, "events monitor stopped");
        }
        self.started.store(false, Ordering::Release);
    }

    pub fn subscribe(&self, container: &str, handler: EventHandler) -> Result<(), FeedError> {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if subscribers.contains_key(container) {
            return Err(FeedError::AlreadySubscribed(container.to_string()));
        }
        subscribers.insert(container.to_string(), handler);
        debug!(container = %container, "subscribed to events");
        Ok(())
    }

    pub fn unsubscribe(&self, container: &str) -> Result<(), FeedError> {
        let removed = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(container);
        match removed {
            Some(_) => {
                debug!(container = %container, "unsubscribed from events");
                Ok(())
            }
            None => Err(FeedError::NotSubscribed(container.to_string())),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Drop for EventsMonitor {
    fn drop(&mut self) {
        let task = self
            .task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

/// Route one raw `name,status` line to its subscriber.
fn dispatch(subscribers: &Subscribers, line: &str) {
    if line.trim().is_empty() {
        return;
    }
    let Some(event) = ContainerEvent::parse(line) else {
        warn!(line = %line, "skipping malformed container event");
        return;
    };

    // Clone the handler out so it runs without holding the lock.
    let handler = subscribers
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&event.container)
        .cloned();

    match handler {
        Some(handler) => {
            trace!(container = %event.container, status = %event.status, "container event");
            handler(event);
        }
        None => {
            trace!(container = %event.container, status = %event.status, "event without subscriber");
        }
    }
}
