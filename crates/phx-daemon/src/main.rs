//! Phoenix control-plane daemon — binds the agent/operator HTTP API and
//! the `/ws` realtime channel, and drives the background loops (task
//! reaper, token-blacklist GC, agent expiry sweep) no single request
//! owns.

use anyhow::{Context, Result};
use phx_core::config::Config;
use tracing::info;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("failed to load config, using defaults: {e}");
        Config::default()
    });

    phx_telemetry::logging::init_logging("phoenix-daemon", &config.general.log_level);
    info!(version = env!("CARGO_PKG_VERSION"), pid = std::process::id(), "phoenix daemon starting");

    let ctx = phx_daemon::build_state(config)
        .await
        .context("failed to assemble control-plane state")?;
    let config = ctx.config.clone();
    let queue = ctx.state.queue.clone();
    let store = ctx.state.store.clone();

    let bind_addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind gateway listener on {bind_addr}"))?;
    let bound_addr = listener.local_addr()?;
    info!(%bound_addr, "gateway listener bound");

    let router = phx_gateway::build_router(ctx.state);

    let shutdown = phx_harness::ShutdownSignal::new();
    let reaper = tokio::spawn(phx_daemon::background::reaper_loop(
        queue,
        config.queue.clone(),
        std::time::Duration::from_secs(config.queue.reaper_period_secs),
        shutdown.clone(),
    ));
    let token_gc = tokio::spawn(phx_daemon::background::token_gc_loop(
        store.clone(),
        config.auth.clone(),
        std::time::Duration::from_secs(config.auth.blacklist_gc_period_secs),
        shutdown.clone(),
    ));
    let agent_expiry = tokio::spawn(phx_daemon::background::agent_expiry_loop(
        store,
        config.agents.clone(),
        std::time::Duration::from_secs(config.agents.expiry_sweep_period_secs),
        shutdown.clone(),
    ));

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
                return;
            }
            info!("ctrl-c received, initiating graceful shutdown");
            shutdown.trigger();
        }
    });

    let mut shutdown_rx = shutdown.subscribe();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await
        .context("gateway server error")?;

    reaper.abort();
    token_gc.abort();
    agent_expiry.abort();
    info!("phoenix daemon stopped");
    Ok(())
}
