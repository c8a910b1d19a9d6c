use std::fmt;

use serde::Serialize;
use tokio::sync::watch;

/// Lifecycle state of one backend.
///
/// Process backends move `starting -> running -> stopping -> stopped`, or to
/// `error` when the spawn fails. Remote backends only toggle between
/// `running` and `stopped` through the management endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl BackendStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendStatus::Starting => "starting",
            BackendStatus::Running => "running",
            BackendStatus::Stopping => "stopping",
            BackendStatus::Stopped => "stopped",
            BackendStatus::Error => "error",
        }
    }

    /// A process may still be attached in these states.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            BackendStatus::Starting | BackendStatus::Running | BackendStatus::Stopping
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BackendStatus::Stopped | BackendStatus::Error)
    }
}

impl fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-backend status cell.
///
/// Wraps a watch channel so that observers (the router, tests) can await a
/// transition instead of polling.
#[derive(Debug)]
pub struct StatusTracker {
    backend: String,
    tx: watch::Sender<BackendStatus>,
}

impl StatusTracker {
    pub fn new(backend: &str, initial: BackendStatus) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self {
            backend: backend.to_string(),
            tx,
        }
    }

    pub fn get(&self) -> BackendStatus {
        *self.tx.borrow()
    }

    /// Records a new status. Returns `false` when the status was already set.
    pub fn set(&self, next: BackendStatus) -> bool {
        let mut previous = next;
        let changed = self.tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            previous = *current;
            *current = next;
            true
        });
        if changed {
            tracing::info!(
                backend = %self.backend,
                from = %previous,
                to = %next,
                "Backend status changed"
            );
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<BackendStatus> {
        self.tx.subscribe()
    }
}
