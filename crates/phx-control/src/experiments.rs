use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use phx_analyser::Analyser;
use phx_bus::{BusMessage, EventBus};
use phx_collector::CollectorRegistry;
use phx_core::config::KpiConfig;
use phx_core::types::{
    Experiment, ExperimentConfig, ExperimentEvent, ExperimentPhase, Task, TaskAction, TaskType, Variant,
};
use phx_core::{PhoenixError, PhoenixResult};
use phx_queue::TaskQueue;
use phx_store::Store;
use phx_templates::{RenderData, Renderer};
use serde_json::Value;

/// State machine driving an experiment through its phases (`created` →
/// … → `completed`/`promoted`/`stopped`/`failed`/`rollback`). Holds no
/// experiment state of its own; every method reads the current phase
/// from the store, checks `ExperimentPhase::can_transition_to`, and
/// writes the result back — all under the per-experiment lock so two
/// concurrent triggers for the same experiment never race.
pub struct ExperimentController {
    store: Arc<Store>,
    queue: Arc<TaskQueue>,
    bus: Arc<EventBus>,
    renderer: Arc<Renderer>,
    analyser: Arc<Analyser>,
    collectors: Arc<CollectorRegistry>,
    kpi_config: KpiConfig,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ExperimentController {
    pub fn new(
        store: Arc<Store>,
        queue: Arc<TaskQueue>,
        bus: Arc<EventBus>,
        renderer: Arc<Renderer>,
        analyser: Arc<Analyser>,
        collectors: Arc<CollectorRegistry>,
        kpi_config: KpiConfig,
    ) -> Self {
        Self {
            store,
            queue,
            bus,
            renderer,
            analyser,
            collectors,
            kpi_config,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, experiment_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("experiment lock table poisoned");
        locks
            .entry(experiment_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    pub async fn create_experiment(&self, name: impl Into<String>, config: ExperimentConfig) -> PhoenixResult<Experiment> {
        config.validate().map_err(PhoenixError::invalid)?;
        let experiment = Experiment::new(name, config);
        self.store.create_experiment(&experiment).await?;
        self.bus.publish(BusMessage::new(
            "experiment_created",
            "experiments",
            serde_json::json!({ "experiment_id": experiment.id, "name": experiment.name }),
        ));
        Ok(experiment)
    }

    /// `Start`. Rejected unless the experiment is still
    /// `created` — a concurrent second `Start` on the same experiment
    /// fails rather than re-deploying.
    pub async fn start(&self, experiment_id: &str) -> PhoenixResult<Experiment> {
        let lock = self.lock_for(experiment_id);
        let _guard = lock.lock().await;

        let experiment = self.store.get_experiment(experiment_id).await?;
        if experiment.phase != ExperimentPhase::Created {
            return Err(PhoenixError::Conflict(format!(
                "experiment {experiment_id} is not in the created phase"
            )));
        }
        if experiment.config.target_hosts.is_empty() {
            return Err(PhoenixError::invalid("target_hosts must not be empty"));
        }
        if !self.renderer.has_template(&experiment.config.baseline_template) {
            return Err(PhoenixError::invalid(format!(
                "baseline template {} is not resolvable",
                experiment.config.baseline_template
            )));
        }
        if !self.renderer.has_template(&experiment.config.candidate_template) {
            return Err(PhoenixError::invalid(format!(
                "candidate template {} is not resolvable",
                experiment.config.candidate_template
            )));
        }

        for host in &experiment.config.target_hosts {
            self.enqueue_collector_task(
                &experiment,
                host,
                Variant::Baseline,
                &experiment.config.baseline_template,
                &experiment.config.baseline_variables,
                TaskAction::Start,
                1,
            )
            .await?;
            self.enqueue_collector_task(
                &experiment,
                host,
                Variant::Candidate,
                &experiment.config.candidate_template,
                &experiment.config.candidate_variables,
                TaskAction::Start,
                1,
            )
            .await?;
        }

        if experiment.config.load_profile.is_some() {
            self.enqueue_loadsim_task(&experiment, TaskAction::Start, 0).await?;
        }

        self.apply_transition(experiment.phase, experiment_id, ExperimentPhase::Deploying, "experiment_started", "experiment started")
            .await?;
        self.store.get_experiment(experiment_id).await
    }

    /// Called by the gateway after a task report succeeds, so the
    /// controller can advance phases that depend on task completion:
    /// `deploying → running` once every `collector/start` task for the
    /// experiment is `completed`, and `any → failed` if a critical task
    /// (a `collector/start`) exhausts its retries.
    pub async fn on_task_report(&self, task: &Task) -> PhoenixResult<()> {
        let Some(experiment_id) = task.experiment_id.clone() else {
            return Ok(());
        };
        let lock = self.lock_for(&experiment_id);
        let _guard = lock.lock().await;

        let experiment = self.store.get_experiment(&experiment_id).await?;

        if task.task_type == TaskType::Collector && task.action == TaskAction::Start {
            use phx_core::types::TaskStatus;
            if experiment.phase == ExperimentPhase::Deploying && matches!(task.status, TaskStatus::Completed | TaskStatus::Failed) {
                let tasks = self.store.list_tasks_for_experiment(&experiment_id).await?;
                let start_tasks: Vec<_> = tasks
                    .iter()
                    .filter(|t| t.task_type == TaskType::Collector && t.action == TaskAction::Start)
                    .collect();
                let total = start_tasks.len();
                let failed = start_tasks.iter().filter(|t| t.status == TaskStatus::Failed).count();

                // A single agent's failure is recoverable — the experiment
                // only fails once a majority of the collector/start tasks
                // across hosts have failed.
                if total > 0 && failed * 2 > total {
                    self.apply_transition(
                        experiment.phase,
                        &experiment_id,
                        ExperimentPhase::Failed,
                        "experiment_failed",
                        "a majority of collector/start tasks failed",
                    )
                    .await?;
                    return Ok(());
                }

                let all_started_terminal = start_tasks.iter().all(|t| t.status.is_terminal());
                if all_started_terminal {
                    self.apply_transition(experiment.phase, &experiment_id, ExperimentPhase::Running, "experiment_phase_updated", "all collectors started")
                        .await?;
                    let mut status = experiment.status.clone();
                    status.started_at.get_or_insert(chrono::Utc::now());
                    self.store.update_experiment_status(&experiment_id, status).await?;
                    self.collectors.start(&experiment_id)?;
                    self.spawn_warmup_timer(experiment_id.clone(), experiment.config.warmup_duration_secs);
                }
            }
        }

        if matches!(task.task_type, TaskType::Collector | TaskType::Loadsim)
            && task.action == TaskAction::Stop
            && experiment.phase == ExperimentPhase::Stopping
        {
            let tasks = self.store.list_tasks_for_experiment(&experiment_id).await?;
            let all_stop_done = tasks
                .iter()
                .filter(|t| t.action == TaskAction::Stop)
                .all(|t| t.status.is_terminal());
            if all_stop_done {
                self.apply_transition(experiment.phase, &experiment_id, ExperimentPhase::Stopped, "experiment_stopped", "all stop tasks finished")
                    .await?;
            }
        }

        Ok(())
    }

    fn spawn_warmup_timer(&self, experiment_id: String, warmup_duration_secs: i64) {
        let store = self.store.clone();
        let bus = self.bus.clone();
        tokio::spawn(async move {
            if warmup_duration_secs > 0 {
                tokio::time::sleep(std::time::Duration::from_secs(warmup_duration_secs as u64)).await;
            }
            let Ok(experiment) = store.get_experiment(&experiment_id).await else {
                return;
            };
            if experiment.phase != ExperimentPhase::Running {
                return;
            }
            if store.set_experiment_phase(&experiment_id, ExperimentPhase::Monitoring).await.is_ok() {
                let _ = store
                    .append_experiment_event(&ExperimentEvent::new(
                        &experiment_id,
                        "experiment_phase_updated",
                        ExperimentPhase::Monitoring,
                        "warmup elapsed",
                    ))
                    .await;
                bus.publish(BusMessage::new(
                    "experiment_phase_updated",
                    "experiments",
                    serde_json::json!({ "experiment_id": experiment_id, "phase": ExperimentPhase::Monitoring }),
                ));
            }
        });
    }

    /// `Stop`. A no-op while already `stopping`.
    pub async fn stop(&self, experiment_id: &str) -> PhoenixResult<Experiment> {
        let lock = self.lock_for(experiment_id);
        let _guard = lock.lock().await;

        let experiment = self.store.get_experiment(experiment_id).await?;
        if experiment.phase == ExperimentPhase::Stopping {
            return Ok(experiment);
        }
        if !matches!(
            experiment.phase,
            ExperimentPhase::Deploying | ExperimentPhase::Running | ExperimentPhase::Monitoring
        ) {
            return Err(PhoenixError::Conflict(format!(
                "cannot stop experiment in phase {:?}",
                experiment.phase
            )));
        }

        for host in &experiment.config.target_hosts {
            for variant in [Variant::Baseline, Variant::Candidate] {
                self.enqueue_stop_task(&experiment, host, variant, 2).await?;
            }
        }
        if experiment.config.load_profile.is_some() {
            self.enqueue_loadsim_task(&experiment, TaskAction::Stop, 2).await?;
        }
        self.collectors.stop(experiment_id);

        self.apply_transition(experiment.phase, experiment_id, ExperimentPhase::Stopping, "experiment_phase_updated", "stop requested")
            .await?;
        self.store.get_experiment(experiment_id).await
    }

    /// `Analyse`. Only valid once the experiment has reached `monitoring`;
    /// an operator (or the gateway route) triggers this explicitly once
    /// `duration_secs` has elapsed since the experiment started.
    pub async fn analyse(&self, experiment_id: &str) -> PhoenixResult<Experiment> {
        let lock = self.lock_for(experiment_id);
        let _guard = lock.lock().await;

        let experiment = self.store.get_experiment(experiment_id).await?;
        if experiment.phase != ExperimentPhase::Monitoring {
            return Err(PhoenixError::Conflict(format!(
                "experiment {experiment_id} is not in the monitoring phase"
            )));
        }

        self.apply_transition(experiment.phase, experiment_id, ExperimentPhase::Analysing, "experiment_phase_updated", "analysis started")
            .await?;

        let now = chrono::Utc::now();
        let window_start = experiment
            .status
            .started_at
            .unwrap_or(now - chrono::Duration::seconds(experiment.config.duration_secs.max(1)));
        let kpis = self.analyser.analyse(experiment_id, window_start, now).await?;

        let mut status = experiment.status.clone();
        status.kpis = Some(kpis.clone());
        status.ended_at = Some(now);
        self.store.update_experiment_status(experiment_id, status).await?;

        self.apply_transition(ExperimentPhase::Analysing, experiment_id, ExperimentPhase::Completed, "experiment_analysed", "kpis computed")
            .await?;
        self.bus.publish(BusMessage::new(
            "kpis_calculated",
            "experiments",
            serde_json::json!({ "experiment_id": experiment_id, "kpis": kpis }),
        ));

        self.store.get_experiment(experiment_id).await
    }

    /// `UpdatePhase`: an operator-forced phase transition, for manual
    /// intervention when the automatic state machine can't make progress
    /// on its own (most commonly force-failing a stuck experiment). Still
    /// goes through `can_transition_to` — this triggers the same kind of
    /// transition the automatic paths do, just from an explicit request
    /// instead of a task report or timer.
    pub async fn update_phase(&self, experiment_id: &str, to: ExperimentPhase) -> PhoenixResult<Experiment> {
        let lock = self.lock_for(experiment_id);
        let _guard = lock.lock().await;

        let experiment = self.store.get_experiment(experiment_id).await?;
        self.apply_transition(experiment.phase, experiment_id, to, "experiment_phase_updated", "phase updated by operator")
            .await?;
        self.store.get_experiment(experiment_id).await
    }

    /// `Promote`. Fails `PreconditionFailed` if accuracy
    /// hasn't cleared the configured threshold.
    pub async fn promote(&self, experiment_id: &str) -> PhoenixResult<Experiment> {
        let lock = self.lock_for(experiment_id);
        let _guard = lock.lock().await;

        let experiment = self.store.get_experiment(experiment_id).await?;
        if experiment.phase != ExperimentPhase::Completed {
            return Err(PhoenixError::Conflict(format!(
                "experiment {experiment_id} is not in the completed phase"
            )));
        }
        if experiment.status.kpis.is_none() {
            return Err(PhoenixError::PreconditionFailed("no kpis recorded for this experiment".into()));
        }
        if !experiment.accuracy_clears_promotion_gate(self.kpi_config.min_accuracy_pct) {
            return Err(PhoenixError::PreconditionFailed(format!(
                "accuracy below the {}% promotion threshold",
                self.kpi_config.min_accuracy_pct
            )));
        }

        let mut metadata = experiment.metadata.clone();
        metadata.insert("promoted".into(), Value::Bool(true));
        metadata.insert("promoted_at".into(), Value::String(chrono::Utc::now().to_rfc3339()));
        metadata.insert("promoted_template".into(), Value::String(experiment.config.candidate_template.clone()));
        self.store.update_experiment_metadata(experiment_id, metadata).await?;

        self.apply_transition(experiment.phase, experiment_id, ExperimentPhase::Promoted, "experiment_promoted", "promoted")
            .await?;
        self.store.get_experiment(experiment_id).await
    }

    /// `Rollback`: stops the candidate variant only.
    pub async fn rollback(&self, experiment_id: &str) -> PhoenixResult<Experiment> {
        let lock = self.lock_for(experiment_id);
        let _guard = lock.lock().await;

        let experiment = self.store.get_experiment(experiment_id).await?;
        if !matches!(experiment.phase, ExperimentPhase::Running | ExperimentPhase::Completed) {
            return Err(PhoenixError::Conflict(format!(
                "cannot roll back experiment in phase {:?}",
                experiment.phase
            )));
        }

        for host in &experiment.config.target_hosts {
            self.enqueue_stop_task(&experiment, host, Variant::Candidate, 3).await?;
        }
        self.collectors.stop(experiment_id);

        self.apply_transition(experiment.phase, experiment_id, ExperimentPhase::Rollback, "experiment_rollback", "rollback requested")
            .await?;
        self.bus.publish(BusMessage::new(
            "experiment_rollback",
            "experiments",
            serde_json::json!({ "experiment_id": experiment_id, "hosts_affected": experiment.config.target_hosts }),
        ));
        self.store.get_experiment(experiment_id).await
    }

    /// Checks `phase` against `can_transition_to` and, if legal, persists
    /// the new phase, appends the event row, and publishes both the
    /// generic `experiment_phase_updated` message and (when distinct) the
    /// semantic event type.
    async fn apply_transition(
        &self,
        from: ExperimentPhase,
        experiment_id: &str,
        to: ExperimentPhase,
        event_type: &str,
        message: &str,
    ) -> PhoenixResult<()> {
        if !from.can_transition_to(&to) {
            return Err(PhoenixError::Conflict(format!("illegal experiment transition {from:?} -> {to:?}")));
        }
        self.store.set_experiment_phase(experiment_id, to).await?;
        self.store
            .append_experiment_event(&ExperimentEvent::new(experiment_id, event_type, to, message))
            .await?;
        self.bus.publish(BusMessage::new(
            "experiment_phase_updated",
            "experiments",
            serde_json::json!({ "experiment_id": experiment_id, "phase": to, "message": message }),
        ));
        if event_type != "experiment_phase_updated" {
            self.bus.publish(BusMessage::new(
                event_type,
                "experiments",
                serde_json::json!({ "experiment_id": experiment_id, "phase": to }),
            ));
        }
        Ok(())
    }

    async fn enqueue_collector_task(
        &self,
        experiment: &Experiment,
        host: &str,
        variant: Variant,
        template: &str,
        variables: &HashMap<String, Value>,
        action: TaskAction,
        priority: i32,
    ) -> PhoenixResult<()> {
        let mut data = RenderData::new(&experiment.id, variant, host);
        data.parameters = variables.clone();
        let rendered = self.renderer.render(template, &data)?;

        let mut task = Task::new(host, TaskType::Collector, action);
        task.experiment_id = Some(experiment.id.clone());
        task.priority = priority;
        task.config.insert("variant".into(), serde_json::to_value(variant).unwrap_or(Value::Null));
        task.config.insert("rendered_config".into(), Value::String(rendered));
        self.queue.enqueue(&task).await
    }

    async fn enqueue_stop_task(&self, experiment: &Experiment, host: &str, variant: Variant, priority: i32) -> PhoenixResult<()> {
        let mut task = Task::new(host, TaskType::Collector, TaskAction::Stop);
        task.experiment_id = Some(experiment.id.clone());
        task.priority = priority;
        task.config.insert("variant".into(), serde_json::to_value(variant).unwrap_or(Value::Null));
        self.queue.enqueue(&task).await
    }

    async fn enqueue_loadsim_task(&self, experiment: &Experiment, action: TaskAction, priority: i32) -> PhoenixResult<()> {
        let host = experiment
            .config
            .target_hosts
            .first()
            .cloned()
            .unwrap_or_else(|| "loadsim".to_string());
        let mut task = Task::new(host, TaskType::Loadsim, action);
        task.experiment_id = Some(experiment.id.clone());
        task.priority = priority;
        if let Some(profile) = &experiment.config.load_profile {
            task.config.insert("load_profile".into(), Value::String(profile.clone()));
        }
        self.queue.enqueue(&task).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phx_collector::NullSource;
    use std::collections::HashMap as Map;

    fn config() -> ExperimentConfig {
        config_with_hosts(vec!["h1".into()])
    }

    fn config_with_hosts(target_hosts: Vec<String>) -> ExperimentConfig {
        ExperimentConfig {
            target_hosts,
            baseline_template: "baseline".into(),
            baseline_variables: Map::new(),
            candidate_template: "topk".into(),
            candidate_variables: Map::new(),
            load_profile: None,
            duration_secs: 60,
            warmup_duration_secs: 0,
            critical_processes: vec![],
        }
    }

    async fn controller() -> (ExperimentController, Arc<Store>, Arc<TaskQueue>) {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let queue = Arc::new(TaskQueue::new(store.clone()));
        let bus = Arc::new(EventBus::new(64));
        let renderer = Arc::new(Renderer::with_builtins());
        let analyser = Arc::new(Analyser::new(store.clone(), KpiConfig::default()));
        let collectors = Arc::new(CollectorRegistry::new(
            store.clone(),
            analyser.clone(),
            Arc::new(NullSource),
            bus.clone(),
            std::time::Duration::from_secs(3600),
        ));
        let controller = ExperimentController::new(store.clone(), queue.clone(), bus, renderer, analyser, collectors, KpiConfig::default());
        (controller, store, queue)
    }

    #[tokio::test]
    async fn start_rejects_when_not_created() {
        let (controller, _store, _queue) = controller().await;
        let experiment = controller.create_experiment("exp", config()).await.unwrap();
        controller.start(&experiment.id).await.unwrap();
        let err = controller.start(&experiment.id).await.unwrap_err();
        assert_eq!(err.kind(), "conflict");
    }

    #[tokio::test]
    async fn start_enqueues_one_collector_task_per_host_per_variant() {
        let (controller, store, _queue) = controller().await;
        let experiment = controller.create_experiment("exp", config()).await.unwrap();
        let started = controller.start(&experiment.id).await.unwrap();
        assert_eq!(started.phase, ExperimentPhase::Deploying);

        let tasks = store.list_tasks_for_experiment(&experiment.id).await.unwrap();
        assert_eq!(tasks.len(), 2);
        assert!(tasks.iter().all(|t| t.task_type == TaskType::Collector && t.action == TaskAction::Start));
    }

    #[tokio::test]
    async fn completing_all_start_tasks_advances_to_running() {
        let (controller, store, queue) = controller().await;
        let experiment = controller.create_experiment("exp", config()).await.unwrap();
        controller.start(&experiment.id).await.unwrap();

        let claimed = queue.claim_for_host("h1", 10, std::time::Duration::from_millis(10)).await.unwrap();
        for task in &claimed {
            let completed = store
                .update_task_status_with_result(&task.id, "h1", phx_core::types::TaskStatus::Running, Default::default(), None)
                .await
                .unwrap();
            let completed = store
                .update_task_status_with_result(&completed.id, "h1", phx_core::types::TaskStatus::Completed, Default::default(), None)
                .await
                .unwrap();
            controller.on_task_report(&completed).await.unwrap();
        }

        let experiment = store.get_experiment(&experiment.id).await.unwrap();
        assert_eq!(experiment.phase, ExperimentPhase::Running);
    }

    #[tokio::test]
    async fn a_single_host_failure_is_recoverable_and_experiment_still_advances() {
        let (controller, store, queue) = controller().await;
        let experiment = controller
            .create_experiment("exp", config_with_hosts(vec!["h1".into(), "h2".into()]))
            .await
            .unwrap();
        controller.start(&experiment.id).await.unwrap();

        // 4 collector/start tasks total (baseline + candidate per host).
        // One of them fails; the other three complete. A single failure
        // out of four must not fail the experiment.
        let mut failed_once = false;
        for host in ["h1", "h2"] {
            let claimed = queue.claim_for_host(host, 10, std::time::Duration::from_millis(10)).await.unwrap();
            for task in &claimed {
                let running = store
                    .update_task_status_with_result(&task.id, host, phx_core::types::TaskStatus::Running, Default::default(), None)
                    .await
                    .unwrap();
                let final_status = if !failed_once {
                    failed_once = true;
                    phx_core::types::TaskStatus::Failed
                } else {
                    phx_core::types::TaskStatus::Completed
                };
                let reported = store
                    .update_task_status_with_result(&running.id, host, final_status, Default::default(), None)
                    .await
                    .unwrap();
                controller.on_task_report(&reported).await.unwrap();
            }
        }

        let experiment = store.get_experiment(&experiment.id).await.unwrap();
        assert_eq!(experiment.phase, ExperimentPhase::Running);
    }

    #[tokio::test]
    async fn a_majority_of_start_tasks_failing_marks_the_experiment_failed() {
        let (controller, store, queue) = controller().await;
        let experiment = controller
            .create_experiment("exp", config_with_hosts(vec!["h1".into(), "h2".into()]))
            .await
            .unwrap();
        controller.start(&experiment.id).await.unwrap();

        // 4 collector/start tasks total; fail 3 of them (a majority). The
        // experiment must transition to `failed` as soon as the majority
        // is reached, without waiting on the 4th, still-pending task.
        let mut failures = 0;
        'hosts: for host in ["h1", "h2"] {
            let claimed = queue.claim_for_host(host, 10, std::time::Duration::from_millis(10)).await.unwrap();
            for task in &claimed {
                let running = store
                    .update_task_status_with_result(&task.id, host, phx_core::types::TaskStatus::Running, Default::default(), None)
                    .await
                    .unwrap();
                let reported = store
                    .update_task_status_with_result(&running.id, host, phx_core::types::TaskStatus::Failed, Default::default(), None)
                    .await
                    .unwrap();
                controller.on_task_report(&reported).await.unwrap();
                failures += 1;
                if failures == 3 {
                    break 'hosts;
                }
            }
        }

        let experiment = store.get_experiment(&experiment.id).await.unwrap();
        assert_eq!(experiment.phase, ExperimentPhase::Failed);
    }

    #[tokio::test]
    async fn update_phase_rejects_an_illegal_transition() {
        let (controller, _store, _queue) = controller().await;
        let experiment = controller.create_experiment("exp", config()).await.unwrap();
        let err = controller.update_phase(&experiment.id, ExperimentPhase::Promoted).await.unwrap_err();
        assert_eq!(err.kind(), "conflict");
    }

    #[tokio::test]
    async fn update_phase_can_force_fail_a_stuck_experiment() {
        let (controller, store, _queue) = controller().await;
        let experiment = controller.create_experiment("exp", config()).await.unwrap();
        controller.start(&experiment.id).await.unwrap();

        let updated = controller.update_phase(&experiment.id, ExperimentPhase::Failed).await.unwrap();
        assert_eq!(updated.phase, ExperimentPhase::Failed);
        let stored = store.get_experiment(&experiment.id).await.unwrap();
        assert_eq!(stored.phase, ExperimentPhase::Failed);
    }

    #[tokio::test]
    async fn stop_while_stopping_is_a_no_op() {
        let (controller, _store, _queue) = controller().await;
        let experiment = controller.create_experiment("exp", config()).await.unwrap();
        controller.start(&experiment.id).await.unwrap();
        let stopped_once = controller.stop(&experiment.id).await.unwrap();
        assert_eq!(stopped_once.phase, ExperimentPhase::Stopping);
        let stopped_twice = controller.stop(&experiment.id).await.unwrap();
        assert_eq!(stopped_twice.phase, ExperimentPhase::Stopping);
    }

    #[tokio::test]
    async fn promote_fails_below_accuracy_threshold() {
        let (controller, store, _queue) = controller().await;
        let experiment = controller.create_experiment("exp", config()).await.unwrap();
        let mut status = experiment.status.clone();
        status.kpis = Some(phx_core::types::KpiResult {
            cardinality_reduction_pct: 50.0,
            cost_reduction_pct: 50.0,
            cpu_usage: phx_core::types::ReductionMetric { baseline: 10.0, candidate: 9.0, reduction_pct: 10.0 },
            memory_usage: phx_core::types::ReductionMetric { baseline: 10.0, candidate: 9.0, reduction_pct: 10.0 },
            ingest_rate: phx_core::types::ReductionMetric { baseline: 10.0, candidate: 9.0, reduction_pct: 10.0 },
            data_accuracy_pct: 50.0,
            recommendation: phx_core::types::Recommendation::DoNotPromote,
            errors: vec![],
            computed_at: chrono::Utc::now(),
        });
        store.update_experiment_status(&experiment.id, status).await.unwrap();
        store.set_experiment_phase(&experiment.id, ExperimentPhase::Completed).await.unwrap();

        let err = controller.promote(&experiment.id).await.unwrap_err();
        assert_eq!(err.kind(), "precondition_failed");
    }
}
