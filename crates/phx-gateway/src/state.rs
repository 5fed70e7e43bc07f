//! Shared application state handed to every route handler.

use std::sync::Arc;

use phx_analyser::Analyser;
use phx_auth::AuthService;
use phx_bus::EventBus;
use phx_collector::CollectorRegistry;
use phx_control::{DeploymentManager, ExperimentController, LoadSimManager};
use phx_core::Config;
use phx_queue::TaskQueue;
use phx_store::Store;
use phx_templates::Renderer;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub queue: Arc<TaskQueue>,
    pub bus: Arc<EventBus>,
    pub renderer: Arc<Renderer>,
    pub analyser: Arc<Analyser>,
    pub collectors: Arc<CollectorRegistry>,
    pub experiments: Arc<ExperimentController>,
    pub deployments: Arc<DeploymentManager>,
    pub loadsim: Arc<LoadSimManager>,
    pub auth: Arc<AuthService>,
    pub config: Arc<Config>,
}
