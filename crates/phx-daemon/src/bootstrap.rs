//! Assembles every component crate into one [`phx_gateway::AppState`].
//!
//! Kept separate from `main.rs` so integration tests can build the same
//! state the real binary runs, against an in-memory store.

use std::sync::Arc;

use anyhow::{Context, Result};
use phx_analyser::Analyser;
use phx_auth::AuthService;
use phx_bus::EventBus;
use phx_collector::{CollectorRegistry, NullSource};
use phx_control::{DeploymentManager, ExperimentController, LoadSimManager};
use phx_core::Config;
use phx_gateway::AppState;
use phx_queue::TaskQueue;
use phx_store::Store;
use phx_templates::Renderer;

/// Everything [`build_state`] built, so callers (the binary's `main`, or a
/// test) can reach the pieces `AppState` doesn't expose directly — e.g.
/// the config the background loops need their own tunables from.
pub struct AppContext {
    pub state: AppState,
    pub config: Arc<Config>,
}

/// Opens the store at `config.store.path` (expanding a leading `~/`),
/// replays any operator-registered templates into the renderer so a
/// restart doesn't lose them, and wires every component crate together.
pub async fn build_state(config: Config) -> Result<AppContext> {
    let store_path = expand_home(&config.store.path);
    let store = Arc::new(
        Store::open(&store_path)
            .await
            .with_context(|| format!("opening store at {store_path}"))?,
    );

    let renderer = Arc::new(Renderer::with_builtins());
    for template in store
        .list_registered_templates()
        .await
        .context("loading registered templates")?
    {
        renderer
            .register(&template.name, &template.source)
            .with_context(|| format!("replaying registered template {}", template.name))?;
    }

    let bus = Arc::new(EventBus::new(config.bus.subscriber_buffer));
    let queue = Arc::new(TaskQueue::new(store.clone()));
    let analyser = Arc::new(Analyser::from_config(store.clone(), &config));
    let collectors = Arc::new(CollectorRegistry::new(
        store.clone(),
        analyser.clone(),
        Arc::new(NullSource),
        bus.clone(),
        std::time::Duration::from_secs(config.agents.metrics_poll_interval_secs),
    ));

    let experiments = Arc::new(ExperimentController::new(
        store.clone(),
        queue.clone(),
        bus.clone(),
        renderer.clone(),
        analyser.clone(),
        collectors.clone(),
        config.kpi.clone(),
    ));
    let deployments = Arc::new(DeploymentManager::new(
        store.clone(),
        queue.clone(),
        bus.clone(),
        renderer.clone(),
    ));
    let loadsim = Arc::new(LoadSimManager::new(store.clone(), queue.clone(), bus.clone()));
    let auth = Arc::new(AuthService::new(store.clone(), config.auth.clone()));

    let config = Arc::new(config);
    let state = AppState {
        store,
        queue,
        bus,
        renderer,
        analyser,
        collectors,
        experiments,
        deployments,
        loadsim,
        auth,
        config: config.clone(),
    };

    Ok(AppContext { state, config })
}

/// Expands a leading `~/` the same way every other `~`-prefixed path in
/// this workspace's config is expanded — `dirs::home_dir()` or `.` if
/// `$HOME` can't be resolved.
fn expand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        let home = dirs::home_dir().unwrap_or_else(|| std::path::PathBuf::from("."));
        return home.join(rest).to_string_lossy().into_owned();
    }
    path.to_string()
}
