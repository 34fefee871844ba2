//! AgentMesh Bridge daemon
//!
//! Thin CLI wrapper: load configuration from the environment, build the
//! core components, serve until SIGINT/SIGTERM, then drain in-flight tasks
//! and persist state. Exits 0 on a clean drain, 1 on drain timeout or any
//! fatal error. A hard-kill timer fires 5 s after the drain window in case
//! anything wedges.

use std::time::Duration;
use tracing::{error, info};

use agentmesh_bridge::config::Config;
use agentmesh_bridge::server::{self, AppState};

fn main() -> eyre::Result<()> {
    // Install color-eyre for better error reporting
    color_eyre::install()?;

    // Run the async main
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    init_logging();

    info!("Starting AgentMesh Bridge");

    let config = Config::load()?;
    info!(
        host = %config.server.host,
        port = config.server.port,
        command = %config.executor.command,
        escrow = config.escrow.is_some(),
        x402 = config.x402.is_some(),
        "Configuration loaded"
    );

    let state = AppState::build(config)?;
    info!(
        mock_mode = state.executor.is_mock(),
        trust_profiles = state.trust.len(),
        "Core components initialized"
    );

    // Serve in the background; intake is gated by the coordinator, so the
    // server task does not need to finish before draining starts.
    let server_state = state.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server::serve(server_state).await {
            error!(error = %e, "Server error");
        }
    });

    wait_for_shutdown_signal().await;

    let drain_timeout = Duration::from_secs(state.config.drain_timeout_s);
    state.shutdown.begin_drain();

    // Outer hard-kill: if the drain itself wedges, the process still dies
    let kill_after = drain_timeout + Duration::from_secs(5);
    tokio::spawn(async move {
        tokio::time::sleep(kill_after).await;
        error!("Drain did not finish in time, hard exit");
        std::process::exit(1);
    });

    let executor = state.executor.clone();
    let report = state
        .shutdown
        .drain(&state.registry, |task_id| executor.cancel(task_id), drain_timeout)
        .await;

    state.limiter.save();
    state.trust.save();
    server_handle.abort();

    info!("AgentMesh Bridge stopped");
    if report.timed_out {
        return Err(eyre::eyre!(
            "drain timed out with {} tasks cancelled",
            report.cancelled
        ));
    }
    Ok(())
}

/// Initialize tracing/logging with structured output
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,agentmesh_bridge=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown");
        }
    }
}
