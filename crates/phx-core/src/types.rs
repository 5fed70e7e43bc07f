use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

// ---------------------------------------------------------------------------
// Variant
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    Baseline,
    Candidate,
}

impl std::fmt::Display for Variant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Variant::Baseline => write!(f, "baseline"),
            Variant::Candidate => write!(f, "candidate"),
        }
    }
}

// ---------------------------------------------------------------------------
// ExperimentPhase
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentPhase {
    Created,
    Deploying,
    Running,
    Monitoring,
    Analysing,
    Completed,
    Promoted,
    Stopping,
    Stopped,
    Failed,
    Rollback,
}

impl ExperimentPhase {
    /// Returns `true` when a transition from `self` to `target` is valid,
    /// per the experiment phase machine.
    pub fn can_transition_to(&self, target: &ExperimentPhase) -> bool {
        use ExperimentPhase::*;
        matches!(
            (self, target),
            (Created, Deploying)
                | (Deploying, Running)
                | (Running, Monitoring)
                | (Deploying, Stopping)
                | (Running, Stopping)
                | (Monitoring, Stopping)
                | (Stopping, Stopped)
                | (Monitoring, Analysing)
                | (Analysing, Completed)
                | (Completed, Promoted)
                | (Running, Rollback)
                | (Completed, Rollback)
                | (_, Failed)
        )
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Collector,
    Loadsim,
    Deployment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskAction {
    Start,
    Stop,
    Deploy,
    Undeploy,
    Rollback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    /// The only legal path is `pending -> assigned -> running -> {completed|failed}`,
    /// plus the reaper's `assigned|running -> pending` demotion on reassignment.
    pub fn can_transition_to(&self, target: &TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, target),
            (Pending, Assigned)
                | (Assigned, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Assigned, Failed)
                | (Assigned, Pending)
                | (Running, Pending)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub host_id: String,
    pub experiment_id: Option<String>,
    pub deployment_id: Option<String>,
    pub task_type: TaskType,
    pub action: TaskAction,
    pub priority: i32,
    pub status: TaskStatus,
    #[serde(default)]
    pub config: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result: HashMap<String, serde_json::Value>,
    pub error_message: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
}

impl Task {
    pub fn new(host_id: impl Into<String>, task_type: TaskType, action: TaskAction) -> Self {
        Self {
            id: new_id(),
            host_id: host_id.into(),
            experiment_id: None,
            deployment_id: None,
            task_type,
            action,
            priority: 1,
            status: TaskStatus::Pending,
            config: HashMap::new(),
            created_at: Utc::now(),
            assigned_at: None,
            started_at: None,
            completed_at: None,
            result: HashMap::new(),
            error_message: None,
            retry_count: 0,
        }
    }

    /// True once `assigned_at < now - stale_threshold` and the task has not
    /// reached a terminal status.
    pub fn is_stale(&self, now: DateTime<Utc>, stale_threshold_secs: i64) -> bool {
        if self.status != TaskStatus::Assigned && self.status != TaskStatus::Running {
            return false;
        }
        match self.assigned_at {
            Some(t) => (now - t).num_seconds() >= stale_threshold_secs,
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Healthy,
    Offline,
    Updating,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub host_id: String,
    pub hostname: String,
    pub ip: Option<String>,
    pub agent_version: String,
    #[serde(default)]
    pub capabilities: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub active_tasks: HashSet<String>,
    #[serde(default)]
    pub resource_usage: ResourceUsage,
    pub last_heartbeat: DateTime<Utc>,
    pub status: AgentStatus,
    pub location: Option<String>,
}

impl Agent {
    /// A minimal agent record created on first heartbeat for an unknown host.
    pub fn minimal(host_id: impl Into<String>) -> Self {
        let host_id = host_id.into();
        Self {
            hostname: host_id.clone(),
            host_id,
            ip: None,
            agent_version: String::new(),
            capabilities: HashMap::new(),
            active_tasks: HashSet::new(),
            resource_usage: ResourceUsage::default(),
            last_heartbeat: Utc::now(),
            status: AgentStatus::Healthy,
            location: None,
        }
    }

    pub fn is_stale(&self, now: DateTime<Utc>, heartbeat_expiry_secs: i64) -> bool {
        (now - self.last_heartbeat).num_seconds() >= heartbeat_expiry_secs
    }
}

// ---------------------------------------------------------------------------
// Experiment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub target_hosts: Vec<String>,
    pub baseline_template: String,
    #[serde(default)]
    pub baseline_variables: HashMap<String, serde_json::Value>,
    pub candidate_template: String,
    #[serde(default)]
    pub candidate_variables: HashMap<String, serde_json::Value>,
    pub load_profile: Option<String>,
    pub duration_secs: i64,
    #[serde(default)]
    pub warmup_duration_secs: i64,
    #[serde(default)]
    pub critical_processes: Vec<String>,
}

impl ExperimentConfig {
    /// Invariants checked at create/start time.
    pub fn validate(&self) -> Result<(), String> {
        if self.target_hosts.is_empty() {
            return Err("target_hosts must not be empty".into());
        }
        if self.baseline_template.trim().is_empty() {
            return Err("baseline_template must not be empty".into());
        }
        if self.candidate_template.trim().is_empty() {
            return Err("candidate_template must not be empty".into());
        }
        if self.warmup_duration_secs > 0 && self.duration_secs <= self.warmup_duration_secs {
            return Err("duration must exceed warmup_duration".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExperimentStatus {
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub kpis: Option<KpiResult>,
    #[serde(default)]
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub phase: ExperimentPhase,
    pub config: ExperimentConfig,
    #[serde(default)]
    pub status: ExperimentStatus,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Experiment {
    pub fn new(name: impl Into<String>, config: ExperimentConfig) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            name: name.into(),
            description: None,
            phase: ExperimentPhase::Created,
            config,
            status: ExperimentStatus::default(),
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the accuracy recorded on this experiment's KPI result clears
    /// the promotion gate.
    pub fn accuracy_clears_promotion_gate(&self, min_accuracy_pct: f64) -> bool {
        self.status
            .kpis
            .as_ref()
            .map(|k| k.data_accuracy_pct >= min_accuracy_pct)
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// PipelineDeployment / DeploymentVersion
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Deploying,
    Ready,
    Degraded,
    Failed,
    RollingBack,
    Deleting,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeploymentInstanceCounts {
    pub desired: u32,
    pub ready: u32,
    pub updated: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDeployment {
    pub id: String,
    pub name: String,
    pub namespace: String,
    pub template_name: String,
    /// logical node name -> host selector
    #[serde(default)]
    pub target_nodes: HashMap<String, String>,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub resource_requirements: HashMap<String, serde_json::Value>,
    pub status: DeploymentStatus,
    pub phase: String,
    #[serde(default)]
    pub instances: DeploymentInstanceCounts,
    #[serde(default)]
    pub metrics_snapshot: HashMap<String, serde_json::Value>,
    pub current_version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl PipelineDeployment {
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        template_name: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            name: name.into(),
            namespace: namespace.into(),
            template_name: template_name.into(),
            target_nodes: HashMap::new(),
            parameters: HashMap::new(),
            resource_requirements: HashMap::new(),
            status: DeploymentStatus::Pending,
            phase: "creating".into(),
            instances: DeploymentInstanceCounts::default(),
            metrics_snapshot: HashMap::new(),
            current_version: 0,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentVersion {
    pub deployment_id: String,
    pub version: i64,
    pub pipeline_config: String,
    #[serde(default)]
    pub parameters_snapshot: HashMap<String, serde_json::Value>,
    pub deployed_by: String,
    pub deployed_at: DateTime<Utc>,
    pub status: DeploymentStatus,
    pub rollback_from_version: Option<i64>,
    pub notes: Option<String>,
}

// ---------------------------------------------------------------------------
// ExperimentEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentEvent {
    pub id: String,
    pub experiment_id: String,
    pub event_type: String,
    pub phase: ExperimentPhase,
    pub message: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl ExperimentEvent {
    pub fn new(
        experiment_id: impl Into<String>,
        event_type: impl Into<String>,
        phase: ExperimentPhase,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: new_id(),
            experiment_id: experiment_id.into(),
            event_type: event_type.into(),
            phase,
            message: message.into(),
            metadata: HashMap::new(),
            timestamp: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// MetricSample
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    pub experiment_id: String,
    pub timestamp: DateTime<Utc>,
    pub metric_name: String,
    pub variant: Variant,
    pub host_id: String,
    pub value: f64,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// KpiResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReductionMetric {
    pub baseline: f64,
    pub candidate: f64,
    pub reduction_pct: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recommendation {
    DoNotPromote,
    Caution,
    LimitedBenefit,
    StronglyRecommend,
    Recommend,
}

impl std::fmt::Display for Recommendation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Recommendation::DoNotPromote => "DO NOT PROMOTE",
            Recommendation::Caution => "CAUTION",
            Recommendation::LimitedBenefit => "LIMITED BENEFIT",
            Recommendation::StronglyRecommend => "STRONGLY RECOMMEND",
            Recommendation::Recommend => "RECOMMEND",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KpiResult {
    pub cardinality_reduction_pct: f64,
    pub cost_reduction_pct: f64,
    pub cpu_usage: ReductionMetric,
    pub memory_usage: ReductionMetric,
    pub ingest_rate: ReductionMetric,
    pub data_accuracy_pct: f64,
    pub recommendation: Recommendation,
    #[serde(default)]
    pub errors: Vec<String>,
    pub computed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// TokenBlacklistEntry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBlacklistEntry {
    pub jti: String,
    pub user_id: String,
    pub expires_at: DateTime<Utc>,
    pub reason: String,
}

impl TokenBlacklistEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

// ---------------------------------------------------------------------------
// User (ambient auth)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Admin,
    Operator,
    Viewer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub password_hash: String,
    pub role: UserRole,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(username: impl Into<String>, password_hash: impl Into<String>, role: UserRole) -> Self {
        Self {
            id: new_id(),
            username: username.into(),
            password_hash: password_hash.into(),
            role,
            created_at: Utc::now(),
        }
    }
}
