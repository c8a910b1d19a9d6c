use std::time::Duration;

use tokio::net::TcpListener;

use crate::config::types::{GatewaySettings, HubConfig, Transport};
use crate::registry::BackendRegistry;
use crate::router::{AppState, build_router};
use crate::status::BackendStatus;

/// How long shutdown waits for backend processes after signalling them.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Registers every configured backend and autostarts process backends.
///
/// Remote backends have no lifecycle of their own and are marked `running`
/// straight away. A duplicate id is logged and skipped; it never aborts
/// startup.
pub async fn bootstrap(config: HubConfig, settings: GatewaySettings) -> anyhow::Result<AppState> {
    let registry = BackendRegistry::new();

    for backend in config.backends {
        let id = backend.id.clone();
        let remote = !matches!(backend.transport, Transport::Process(_));

        if let Err(e) = registry.register(backend).await {
            tracing::warn!(backend = %id, error = %e, "Skipping backend");
            continue;
        }

        if remote {
            registry.set_status(&id, BackendStatus::Running).await;
        }
    }

    let state = AppState::new(registry, settings)?;
    state.supervisor.start_all().await;
    Ok(state)
}

/// Serves until `state.shutdown` is cancelled, then stops every backend process.
pub async fn serve(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
    let shutdown = state.shutdown.clone();
    let app = build_router(state.clone());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    tracing::info!("HTTP server stopped, terminating backend processes");
    state.supervisor.shutdown(SHUTDOWN_GRACE).await;
    Ok(())
}
