//! Server binary
//!
//! Loads settings, connects persistence, wires the component graph, serves
//! HTTP, and drains active sessions on shutdown within the configured
//! grace period.

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use callweave_config::load_settings;
use callweave_core::CallOutcome;
use callweave_server::{create_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "info,callweave_server=debug".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let env = std::env::var("CALLWEAVE_ENV").ok();
    let settings = load_settings(env.as_deref()).context("loading settings")?;

    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .context("installing Prometheus recorder")?;

    let persistence = callweave_persistence::init(&settings.scylla)
        .await
        .context("initializing persistence")?;

    let state = AppState::new(settings.clone(), std::sync::Arc::new(persistence), env)
        .map_err(|e| anyhow::anyhow!(e.to_string()))?
        .with_metrics_handle(metrics_handle);

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    tracing::info!(addr = %addr, "Server listening");

    let registry = state.registry.clone();
    let grace = Duration::from_secs(settings.server.shutdown_grace_secs);

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving")?;

    // Drain live sessions within the grace period, then close them out
    let deadline = tokio::time::Instant::now() + grace;
    while !registry.is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    for session in registry.live_sessions() {
        tracing::warn!(call_id = %session.call_id, "Force-closing session at shutdown");
        session.cancel.cancel();
        let _ = registry.close(session.call_id, CallOutcome::BridgeClosed).await;
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
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

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, draining sessions");
}
