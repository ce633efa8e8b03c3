use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::error::Result;

/// Number of exec output lines retained for a slow reader. Older lines are
/// dropped first.
pub const OUTPUT_BUFFER_LINES: usize = 100;

/// Create the bounded, drop-oldest channel used for exec output.
///
/// The channel may hold a few more lines than [`OUTPUT_BUFFER_LINES`];
/// read it with [`drain_output`].
pub fn output_channel() -> (broadcast::Sender<String>, broadcast::Receiver<String>) {
    broadcast::channel(OUTPUT_BUFFER_LINES)
}

/// Take every buffered exec output line, keeping the newest
/// [`OUTPUT_BUFFER_LINES`].
pub fn drain_output(output: &mut broadcast::Receiver<String>) -> Vec<String> {
    let mut lines = VecDeque::with_capacity(OUTPUT_BUFFER_LINES);
    loop {
        match output.try_recv() {
            Ok(line) => {
                if lines.len() == OUTPUT_BUFFER_LINES {
                    lines.pop_front();
                }
                lines.push_back(line);
            }
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(broadcast::error::TryRecvError::Empty | broadcast::error::TryRecvError::Closed) => {
                break;
            }
        }
    }
    lines.into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
}

/// A running exec: the job completes when the process exits, output lines
/// arrive on `output` as they are produced.
#[derive(Debug)]
pub struct ExecHandle {
    pub job: JoinHandle<Result<ProcessExit>>,
    pub output: broadcast::Receiver<String>,
}

/// Filter for a runtime event subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventsQuery {
    pub name_prefix: String,
    pub event_types: Vec<String>,
    pub since: DateTime<Utc>,
}

/// A live runtime event subscription. Each line is a raw `name,status` pair.
#[derive(Debug)]
pub struct EventStream {
    pub job: JoinHandle<Result<()>>,
    pub lines: mpsc::UnboundedReceiver<String>,
}

/// One lifecycle event reported by the runtime for a named container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEvent {
    pub container: String,
    pub status: String,
}

impl ContainerEvent {
    /// Parse a raw `name,status` line. Returns `None` for blank or malformed
    /// lines.
    pub fn parse(line: &str) -> Option<Self> {
        let (container, status) = line.trim().split_once(',')?;
        let container = container.trim();
        let status = status.trim();
        if container.is_empty() || status.is_empty() {
            return None;
        }
        Some(Self {
            container: container.to_string(),
            status: status.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_name_and_status() {
        let event = ContainerEvent::parse("pool-dotnet-1a2b3c4d,start\n").unwrap();
        assert_eq!(event.container, "pool-dotnet-1a2b3c4d");
        assert_eq!(event.status, "start");
    }

    #[test]
    fn parse_keeps_status_with_commas() {
        // Container names cannot contain commas, statuses can.
        let event = ContainerEvent::parse("c-1,exec_start: sh -c a,b").unwrap();
        assert_eq!(event.status, "exec_start: sh -c a,b");
    }

    #[test]
    fn parse_rejects_blank_and_malformed() {
        assert!(ContainerEvent::parse("").is_none());
        assert!(ContainerEvent::parse("   ").is_none());
        assert!(ContainerEvent::parse("no-comma").is_none());
        assert!(ContainerEvent::parse(",start").is_none());
        assert!(ContainerEvent::parse("c-1,").is_none());
    }

    #[tokio::test]
    async fn drain_keeps_newest_lines() {
        let (tx, mut rx) = output_channel();
        for i in 0..OUTPUT_BUFFER_LINES + 5 {
            tx.send(format!("line {i}")).unwrap();
        }

        let received = drain_output(&mut rx);
        assert_eq!(received.len(), OUTPUT_BUFFER_LINES);
        assert_eq!(received.first().unwrap(), "line 5");
        assert_eq!(received.last().unwrap(), "line 104");
    }

    #[tokio::test]
    async fn drain_skips_lines_lost_to_overflow() {
        let (tx, mut rx) = output_channel();
        for i in 0..1_000 {
            tx.send(format!("line {i}")).unwrap();
        }

        let received = drain_output(&mut rx);
        assert_eq!(received.len(), OUTPUT_BUFFER_LINES);
        assert_eq!(received.last().unwrap(), "line 999");
        assert!(drain_output(&mut rx).is_empty());
    }
}
