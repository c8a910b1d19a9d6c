use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use hub_gateway::cli::Cli;
use hub_gateway::config::load_config_lenient;
use hub_gateway::gateway;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    hub_gateway::logging::init(cli.log_level.as_deref().unwrap_or("info"));

    let config = load_config_lenient(&cli.config);
    let settings = cli.settings();

    // Bind before any backend process is spawned.
    let listener = TcpListener::bind((cli.host.as_str(), cli.port))
        .await
        .with_context(|| format!("failed to bind {}:{}", cli.host, cli.port))?;

    tracing::info!(
        listen = %format!("{}:{}", cli.host, cli.port),
        base_url = %settings.base_url,
        backends = config.backends.len(),
        "Hub gateway starting"
    );

    let state = gateway::bootstrap(config, settings).await?;
    tokio::spawn(shutdown_signal(state.shutdown.clone()));

    gateway::serve(listener, state).await?;
    tracing::info!("Hub gateway stopped");
    Ok(())
}

async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
    token.cancel();
}
