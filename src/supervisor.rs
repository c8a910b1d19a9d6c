use std::os::unix::process::ExitStatusExt;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Child;
use tokio::sync::Mutex;

use crate::backend::stdio::StdioProcess;
use crate::config::types::{ProcessConfig, Transport};
use crate::error::GatewayError;
use crate::registry::BackendRegistry;
use crate::status::BackendStatus;

/// Spawns and terminates process backends and observes their exit.
///
/// There is no restart policy: a process that exits stays `stopped` until
/// `start` is called again.
#[derive(Clone)]
pub struct ProcessSupervisor {
    registry: BackendRegistry,
    /// Serializes start, stop and exit cleanup so a late exit can never
    /// overwrite the status of a freshly started replacement.
    lifecycle: Arc<Mutex<()>>,
}

impl ProcessSupervisor {
    pub fn new(registry: BackendRegistry) -> Self {
        Self {
            registry,
            lifecycle: Arc::new(Mutex::new(())),
        }
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    /// Spawns the process for `id`.
    ///
    /// Rejects the call with [`GatewayError::AlreadyRunning`] while a previous
    /// process is still attached (including one that is `stopping`). A spawn
    /// failure leaves the backend in `error`.
    pub async fn start(&self, id: &str) -> Result<BackendStatus, GatewayError> {
        let config = self.process_config(id, "start").await?;
        let _guard = self.lifecycle.lock().await;

        if self.registry.process(id).await.is_some() {
            return Err(GatewayError::AlreadyRunning(id.to_string()));
        }

        self.registry.set_status(id, BackendStatus::Starting).await;
        self.registry.mark_started(id).await;

        let (process, child) = match StdioProcess::spawn(id, &config) {
            Ok(spawned) => spawned,
            Err(e) => {
                tracing::error!(backend = %id, error = %e, "Failed to spawn backend process");
                self.registry.set_status(id, BackendStatus::Error).await;
                return Err(GatewayError::from_backend(id, e));
            }
        };

        let process = Arc::new(process);
        if let Err(e) = self.registry.attach_process(id, process.clone()).await {
            process.terminate();
            tokio::spawn(reap(child));
            return Err(e.into());
        }

        tracing::info!(
            backend = %id,
            pid = process.pid(),
            command = %config.command,
            "Backend process started"
        );
        self.registry.set_status(id, BackendStatus::Running).await;

        tokio::spawn(observe_exit(
            self.registry.clone(),
            self.lifecycle.clone(),
            id.to_string(),
            process,
            child,
        ));

        Ok(BackendStatus::Running)
    }

    /// Requests termination and returns at once.
    ///
    /// The backend moves to `stopping`; the exit observer completes the move
    /// to `stopped`. Stopping a backend with no live process is a no-op
    /// success.
    pub async fn stop(&self, id: &str) -> Result<BackendStatus, GatewayError> {
        self.process_config(id, "stop").await?;
        let _guard = self.lifecycle.lock().await;

        match self.registry.process(id).await {
            Some(process) => {
                self.registry.set_status(id, BackendStatus::Stopping).await;
                tracing::info!(backend = %id, pid = process.pid(), "Stopping backend process");
                process.terminate();
                Ok(BackendStatus::Stopping)
            }
            None => {
                self.registry.set_status(id, BackendStatus::Stopped).await;
                Ok(BackendStatus::Stopped)
            }
        }
    }

    /// Starts every process backend marked `autostart`; the rest are parked
    /// in `stopped`. Failures are recorded in the status and logged.
    pub async fn start_all(&self) {
        for snapshot in self.registry.list().await {
            let Transport::Process(config) = &snapshot.config.transport else {
                continue;
            };
            if !config.autostart {
                self.registry
                    .set_status(snapshot.id(), BackendStatus::Stopped)
                    .await;
                continue;
            }
            if let Err(e) = self.start(snapshot.id()).await {
                tracing::warn!(backend = %snapshot.id(), error = %e, "Autostart failed");
            }
        }
    }

    /// Signals every live process and waits up to `grace` for them to exit.
    pub async fn shutdown(&self, grace: Duration) {
        let mut stopping = Vec::new();
        for id in self.registry.ids().await {
            if self.registry.process(&id).await.is_some() {
                if let Err(e) = self.stop(&id).await {
                    tracing::warn!(backend = %id, error = %e, "Failed to stop backend");
                }
                stopping.push(id);
            }
        }

        let deadline = tokio::time::Instant::now() + grace;
        for id in stopping {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if let Err(e) = self
                .registry
                .wait_for_status(&id, remaining, BackendStatus::is_terminal)
                .await
            {
                tracing::warn!(backend = %id, error = %e, "Backend did not exit before shutdown");
            }
        }
    }

    async fn process_config(
        &self,
        id: &str,
        operation: &'static str,
    ) -> Result<ProcessConfig, GatewayError> {
        let snapshot = self.registry.get(id).await?;
        match &snapshot.config.transport {
            Transport::Process(config) => Ok(config.clone()),
            other => Err(GatewayError::UnsupportedTransport {
                id: id.to_string(),
                kind: other.kind().as_str(),
                operation,
            }),
        }
    }
}

async fn observe_exit(
    registry: BackendRegistry,
    lifecycle: Arc<Mutex<()>>,
    id: String,
    process: Arc<StdioProcess>,
    mut child: Child,
) {
    let outcome = child.wait().await;

    let _guard = lifecycle.lock().await;
    let requested = registry.status(&id).await == Some(BackendStatus::Stopping);

    match outcome {
        Ok(status) if requested => {
            tracing::info!(
                backend = %id,
                code = ?status.code(),
                signal = ?status.signal(),
                "Backend process stopped"
            );
        }
        Ok(status) => {
            tracing::warn!(
                backend = %id,
                code = ?status.code(),
                signal = ?status.signal(),
                "Backend process exited unexpectedly, not restarting"
            );
        }
        Err(e) => {
            tracing::warn!(backend = %id, error = %e, "Failed to wait for backend process");
        }
    }

    registry.detach_process(&id, &process).await;
    registry.set_status(&id, BackendStatus::Stopped).await;
}

async fn reap(mut child: Child) {
    let _ = child.wait().await;
}
