use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, watch};

use crate::backend::stdio::StdioProcess;
use crate::config::types::{BackendConfig, TransportKind};
use crate::status::{BackendStatus, StatusTracker};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("backend '{0}' is already registered")]
    DuplicateId(String),

    #[error("backend '{0}' not found")]
    NotFound(String),

    #[error("backend '{0}' already has a live process")]
    ProcessAttached(String),

    #[error("backend '{id}' still '{status}' after waiting {waited:?}")]
    WaitTimeout {
        id: String,
        status: BackendStatus,
        waited: Duration,
    },
}

struct BackendRecord {
    config: Arc<BackendConfig>,
    status: StatusTracker,
    started_at: Instant,
    started_wall: DateTime<Utc>,
    process: Option<Arc<StdioProcess>>,
}

/// Point-in-time view of one backend.
#[derive(Debug, Clone)]
pub struct BackendSnapshot {
    pub config: Arc<BackendConfig>,
    pub status: BackendStatus,
    pub started_at: DateTime<Utc>,
    /// Seconds since the last start while the backend is live, 0 otherwise.
    pub uptime_secs: u64,
    pub pid: Option<u32>,
}

impl BackendSnapshot {
    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn kind(&self) -> TransportKind {
        self.config.transport.kind()
    }
}

/// Owned store of backend descriptors and their runtime state.
///
/// Cloning shares the same store. Descriptors are never removed; only the
/// transient process handle comes and goes.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    inner: Arc<RwLock<HashMap<String, BackendRecord>>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, config: BackendConfig) -> Result<(), RegistryError> {
        let mut map = self.inner.write().await;
        if map.contains_key(&config.id) {
            return Err(RegistryError::DuplicateId(config.id));
        }

        tracing::info!(
            backend = %config.id,
            transport = %config.transport.kind().as_str(),
            "Backend registered"
        );
        let record = BackendRecord {
            status: StatusTracker::new(&config.id, BackendStatus::Starting),
            config: Arc::new(config),
            started_at: Instant::now(),
            started_wall: Utc::now(),
            process: None,
        };
        map.insert(record.config.id.clone(), record);
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<BackendSnapshot, RegistryError> {
        let map = self.inner.read().await;
        map.get(id)
            .map(snapshot)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    /// All backends, ordered by id.
    pub async fn list(&self) -> Vec<BackendSnapshot> {
        let map = self.inner.read().await;
        let mut all: Vec<BackendSnapshot> = map.values().map(snapshot).collect();
        all.sort_by(|a, b| a.config.id.cmp(&b.config.id));
        all
    }

    pub async fn ids(&self) -> Vec<String> {
        let map = self.inner.read().await;
        let mut ids: Vec<String> = map.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn status(&self, id: &str) -> Option<BackendStatus> {
        self.inner.read().await.get(id).map(|r| r.status.get())
    }

    /// Records a status change. Unknown ids are ignored; repeating the
    /// current status is a no-op. Returns whether anything changed.
    pub async fn set_status(&self, id: &str, status: BackendStatus) -> bool {
        let map = self.inner.read().await;
        match map.get(id) {
            Some(record) => record.status.set(status),
            None => {
                tracing::debug!(backend = %id, status = %status, "status update for unknown backend ignored");
                false
            }
        }
    }

    /// Resets the start timestamp used for uptime.
    pub async fn mark_started(&self, id: &str) {
        if let Some(record) = self.inner.write().await.get_mut(id) {
            record.started_at = Instant::now();
            record.started_wall = Utc::now();
        }
    }

    pub async fn subscribe(&self, id: &str) -> Option<watch::Receiver<BackendStatus>> {
        self.inner.read().await.get(id).map(|r| r.status.subscribe())
    }

    /// Waits until the status of `id` satisfies `done`, or `timeout` passes.
    pub async fn wait_for_status<F>(
        &self,
        id: &str,
        timeout: Duration,
        done: F,
    ) -> Result<BackendStatus, RegistryError>
    where
        F: Fn(&BackendStatus) -> bool,
    {
        let mut rx = self
            .subscribe(id)
            .await
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        let outcome = tokio::time::timeout(timeout, rx.wait_for(|s| done(s)))
            .await
            .map(|seen| seen.map(|status| *status));

        match outcome {
            Ok(Ok(status)) => Ok(status),
            Ok(Err(_)) => Err(RegistryError::NotFound(id.to_string())),
            Err(_) => Err(RegistryError::WaitTimeout {
                id: id.to_string(),
                status: *rx.borrow(),
                waited: timeout,
            }),
        }
    }

    /// Associates a live process with `id`. At most one handle may be
    /// attached at a time.
    pub async fn attach_process(
        &self,
        id: &str,
        process: Arc<StdioProcess>,
    ) -> Result<(), RegistryError> {
        let mut map = self.inner.write().await;
        let record = map
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        if record.process.is_some() {
            return Err(RegistryError::ProcessAttached(id.to_string()));
        }
        record.process = Some(process);
        Ok(())
    }

    /// Removes the handle for `id`, but only if it is `process` itself.
    pub async fn detach_process(&self, id: &str, process: &Arc<StdioProcess>) -> bool {
        let mut map = self.inner.write().await;
        match map.get_mut(id) {
            Some(record)
                if record
                    .process
                    .as_ref()
                    .is_some_and(|current| Arc::ptr_eq(current, process)) =>
            {
                record.process = None;
                true
            }
            _ => false,
        }
    }

    pub async fn process(&self, id: &str) -> Option<Arc<StdioProcess>> {
        self.inner.read().await.get(id).and_then(|r| r.process.clone())
    }
}

fn snapshot(record: &BackendRecord) -> BackendSnapshot {
    let status = record.status.get();
    let uptime_secs = if status.is_live() {
        record.started_at.elapsed().as_secs()
    } else {
        0
    };
    BackendSnapshot {
        config: record.config.clone(),
        status,
        started_at: record.started_wall,
        uptime_secs,
        pid: record.process.as_ref().map(|p| p.pid()),
    }
}
