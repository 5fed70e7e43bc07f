use std::collections::HashMap;
use std::sync::Arc;

use phx_bus::{BusMessage, EventBus};
use phx_core::types::{DeploymentStatus, PipelineDeployment, Task, TaskAction, TaskType, Variant};
use phx_core::{PhoenixError, PhoenixResult};
use phx_queue::TaskQueue;
use phx_store::Store;
use phx_templates::{RenderData, Renderer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `CreateDeployment` request body.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateDeploymentRequest {
    pub name: String,
    pub namespace: String,
    pub template_name: String,
    /// logical node name -> host selector
    pub target_nodes: HashMap<String, String>,
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
}

/// `UpdateDeployment` request body. Only parameter changes are modeled —
/// the store's field-wise update surface covers parameters, status, and
/// instance counts; renaming a deployment or moving it to a different
/// namespace is not part of this contract.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateDeploymentRequest {
    pub parameters: Option<HashMap<String, Value>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NodeTaskCounts {
    pub pending: u32,
    pub running: u32,
    pub completed: u32,
    pub failed: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeploymentStatusReport {
    pub deployment: PipelineDeployment,
    pub overall_status: String,
    pub nodes: HashMap<String, NodeTaskCounts>,
}

/// Orchestrates `pipeline_deployments` rollout: renders the deployment's
/// template per target node, dispatches `deployment/*` tasks through the
/// task queue, and records every change as a new `DeploymentVersion`.
pub struct DeploymentManager {
    store: Arc<Store>,
    queue: Arc<TaskQueue>,
    bus: Arc<EventBus>,
    renderer: Arc<Renderer>,
}

impl DeploymentManager {
    pub fn new(store: Arc<Store>, queue: Arc<TaskQueue>, bus: Arc<EventBus>, renderer: Arc<Renderer>) -> Self {
        Self { store, queue, bus, renderer }
    }

    pub async fn create_deployment(&self, request: CreateDeploymentRequest) -> PhoenixResult<PipelineDeployment> {
        let mut deployment = PipelineDeployment::new(request.name, request.namespace, request.template_name);
        deployment.target_nodes = request.target_nodes;
        deployment.parameters = request.parameters;
        self.store.create_deployment(&deployment).await?;

        let pipeline_config = self.render_and_dispatch(&deployment, TaskAction::Deploy, 1).await;
        self.store
            .record_deployment_version(
                &deployment.id,
                pipeline_config,
                deployment.parameters.clone(),
                "system".to_string(),
                DeploymentStatus::Deploying,
                None,
                Some("initial deployment".into()),
            )
            .await?;

        self.bus.publish(BusMessage::new(
            "deployment_created",
            "deployments",
            serde_json::json!({ "deployment_id": deployment.id, "namespace": deployment.namespace }),
        ));
        self.store.get_deployment(&deployment.id).await
    }

    pub async fn update_deployment(&self, id: &str, request: UpdateDeploymentRequest) -> PhoenixResult<PipelineDeployment> {
        if let Some(parameters) = request.parameters {
            self.store.update_deployment_parameters(id, parameters).await?;
            let deployment = self.store.get_deployment(id).await?;
            let pipeline_config = self.render_and_dispatch(&deployment, TaskAction::Deploy, 1).await;
            self.store
                .record_deployment_version(
                    id,
                    pipeline_config,
                    deployment.parameters.clone(),
                    "system".to_string(),
                    DeploymentStatus::Deploying,
                    None,
                    Some("parameter update".into()),
                )
                .await?;
            self.bus.publish(BusMessage::new(
                "deployment_updated",
                "deployments",
                serde_json::json!({ "deployment_id": id }),
            ));
        }
        self.store.get_deployment(id).await
    }

    /// Rolls back to `version`, or `current_version - 1` when omitted.
    pub async fn rollback_deployment(&self, id: &str, version: Option<i64>) -> PhoenixResult<PipelineDeployment> {
        let deployment = self.store.get_deployment(id).await?;
        let target_version = match version {
            Some(v) => v,
            None => {
                let candidate = deployment.current_version - 1;
                if candidate < 1 {
                    return Err(PhoenixError::PreconditionFailed("no prior version to roll back to".into()));
                }
                candidate
            }
        };

        self.store.rollback_deployment_version(id, target_version, "system".to_string()).await?;
        let target = self.store.get_deployment_version(id, target_version).await?;

        for (node, host) in &deployment.target_nodes {
            let mut task = Task::new(host.clone(), TaskType::Deployment, TaskAction::Rollback);
            task.deployment_id = Some(id.to_string());
            task.priority = 1;
            task.config.insert("node".into(), Value::String(node.clone()));
            task.config.insert("rendered_config".into(), Value::String(target.pipeline_config.clone()));
            task.config.insert("target_version".into(), Value::from(target_version));
            self.queue.enqueue(&task).await?;
        }

        self.bus.publish(BusMessage::new(
            "deployment_rollback",
            "deployments",
            serde_json::json!({ "deployment_id": id, "target_version": target_version }),
        ));
        self.store.get_deployment(id).await
    }

    pub async fn delete_deployment(&self, id: &str) -> PhoenixResult<()> {
        let deployment = self.store.get_deployment(id).await?;
        self.store.soft_delete_deployment(id).await?;

        for (node, host) in &deployment.target_nodes {
            let mut task = Task::new(host.clone(), TaskType::Deployment, TaskAction::Undeploy);
            task.deployment_id = Some(id.to_string());
            task.priority = 2;
            task.config.insert("node".into(), Value::String(node.clone()));
            self.queue.enqueue(&task).await?;
        }

        self.bus.publish(BusMessage::new(
            "deployment_deleted",
            "deployments",
            serde_json::json!({ "deployment_id": id }),
        ));
        Ok(())
    }

    /// Aggregates the deployment-typed tasks into per-node `{pending,
    /// running, completed, failed}` counts and an overall status: `failed`
    /// if any node has a failed task, `ready` if every node's tasks are
    /// all completed, `deploying` if any task is running, otherwise the
    /// persisted status.
    pub async fn get_status(&self, id: &str) -> PhoenixResult<DeploymentStatusReport> {
        let deployment = self.store.get_deployment(id).await?;
        let tasks = self.store.list_tasks_for_deployment(id).await?;

        let mut nodes: HashMap<String, NodeTaskCounts> = HashMap::new();
        for task in &tasks {
            let node = task
                .config
                .get("node")
                .and_then(|v| v.as_str())
                .unwrap_or(&task.host_id)
                .to_string();
            let counts = nodes.entry(node).or_default();
            use phx_core::types::TaskStatus::*;
            match task.status {
                Pending => counts.pending += 1,
                Assigned | Running => counts.running += 1,
                Completed => counts.completed += 1,
                Failed => counts.failed += 1,
            }
        }

        let any_failed = nodes.values().any(|c| c.failed > 0);
        let any_running = nodes.values().any(|c| c.running > 0);
        let all_completed = !nodes.is_empty() && nodes.values().all(|c| c.completed > 0 && c.pending == 0 && c.running == 0 && c.failed == 0);

        let overall_status = if any_failed {
            "failed".to_string()
        } else if all_completed {
            "ready".to_string()
        } else if any_running {
            "deploying".to_string()
        } else {
            format!("{:?}", deployment.status).to_lowercase()
        };

        Ok(DeploymentStatusReport { deployment, overall_status, nodes })
    }

    /// Renders the template against every target node (falling back to an
    /// empty rendered config plus a recorded error rather than aborting the
    /// deployment), enqueues one task per node, and returns a JSON map of
    /// node -> rendered config suitable for recording as a
    /// `DeploymentVersion`'s `pipeline_config`.
    async fn render_and_dispatch(&self, deployment: &PipelineDeployment, action: TaskAction, priority: i32) -> String {
        let mut rendered_by_node: HashMap<String, String> = HashMap::new();

        for (node, host) in &deployment.target_nodes {
            let mut data = RenderData::new(&deployment.id, Variant::Baseline, host);
            data.parameters = deployment.parameters.clone();
            let mut task = Task::new(host.clone(), TaskType::Deployment, action);
            task.deployment_id = Some(deployment.id.clone());
            task.priority = priority;
            task.config.insert("node".into(), Value::String(node.clone()));

            match self.renderer.render(&deployment.template_name, &data) {
                Ok(rendered) => {
                    task.config.insert("rendered_config".into(), Value::String(rendered.clone()));
                    rendered_by_node.insert(node.clone(), rendered);
                }
                Err(e) => {
                    tracing::warn!(deployment_id = %deployment.id, node, error = %e, "deployment template failed to render");
                    task.config.insert("rendered_config".into(), Value::String(String::new()));
                    task.config.insert("error".into(), Value::String(e.to_string()));
                    rendered_by_node.insert(node.clone(), String::new());
                }
            }

            if let Err(e) = self.queue.enqueue(&task).await {
                tracing::warn!(deployment_id = %deployment.id, node, error = %e, "failed to enqueue deployment task");
            }
        }

        serde_json::to_string(&rendered_by_node).unwrap_or_default()
    }
}
