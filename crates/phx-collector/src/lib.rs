//! Metrics Collector.
//!
//! Lifecycle per experiment: `Start(id)` registers an in-memory,
//! per-experiment sampler; `Stop(id)` cancels it. The registry is an
//! exclusively-owned map guarded by a mutex — `start`/`stop` are its only
//! mutators.
//!
//! Each worker wakes every `poll_interval` (default 15s), pulls a snapshot
//! per variant from a [`MetricsSource`] — an out-of-scope external
//! time-series backend, queried only through this small interface — and
//! writes the samples into the metric cache via `phx-store`. Every 5th
//! tick it additionally triggers a `phx-analyser` KPI computation and
//! publishes `kpis_calculated` on the `experiments` topic.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use phx_analyser::Analyser;
use phx_bus::{BusMessage, EventBus};
use phx_core::types::{MetricSample, Variant};
use phx_core::{PhoenixError, PhoenixResult};
use phx_store::Store;
use tokio::task::JoinHandle;

/// Number of poll ticks between KPI computations: every 5th tick triggers
/// an asynchronous KPI computation.
const KPI_TRIGGER_EVERY_N_TICKS: u64 = 5;

/// The external time-series backend the collector samples from. Out of
/// scope for this repository; [`NullSource`] is the standalone stand-in
/// used when no such backend is reachable, mirroring `phx-analyser`'s
/// in-memory `MetricsBackend`.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn sample(&self, experiment_id: &str, variant: Variant) -> PhoenixResult<Vec<MetricSample>>;
}

/// Always returns an empty snapshot. A real deployment implements
/// [`MetricsSource`] against Prometheus or whatever TSDB agents actually
/// publish to.
pub struct NullSource;

#[async_trait]
impl MetricsSource for NullSource {
    async fn sample(&self, _experiment_id: &str, _variant: Variant) -> PhoenixResult<Vec<MetricSample>> {
        Ok(Vec::new())
    }
}

pub struct CollectorRegistry {
    store: Arc<Store>,
    analyser: Arc<Analyser>,
    source: Arc<dyn MetricsSource>,
    bus: Arc<EventBus>,
    poll_interval: Duration,
    workers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl CollectorRegistry {
    pub fn new(
        store: Arc<Store>,
        analyser: Arc<Analyser>,
        source: Arc<dyn MetricsSource>,
        bus: Arc<EventBus>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            analyser,
            source,
            bus,
            poll_interval,
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a collector for `experiment_id`. Errors if one is already
    /// running — `start` is not idempotent.
    pub fn start(&self, experiment_id: &str) -> PhoenixResult<()> {
        let mut workers = self.workers.lock().expect("collector registry lock poisoned");
        if workers.contains_key(experiment_id) {
            return Err(PhoenixError::Conflict(format!(
                "a collector is already running for experiment {experiment_id}"
            )));
        }
        let handle = tokio::spawn(run(
            experiment_id.to_string(),
            self.store.clone(),
            self.analyser.clone(),
            self.source.clone(),
            self.bus.clone(),
            self.poll_interval,
        ));
        workers.insert(experiment_id.to_string(), handle);
        Ok(())
    }

    /// Cancels the collector for `experiment_id`, if one is running.
    /// Idempotent: stopping an experiment with no collector is a no-op.
    pub fn stop(&self, experiment_id: &str) {
        let handle = self
            .workers
            .lock()
            .expect("collector registry lock poisoned")
            .remove(experiment_id);
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    pub fn is_running(&self, experiment_id: &str) -> bool {
        self.workers
            .lock()
            .expect("collector registry lock poisoned")
            .contains_key(experiment_id)
    }

    pub fn running_count(&self) -> usize {
        self.workers.lock().expect("collector registry lock poisoned").len()
    }
}

async fn run(
    experiment_id: String,
    store: Arc<Store>,
    analyser: Arc<Analyser>,
    source: Arc<dyn MetricsSource>,
    bus: Arc<EventBus>,
    poll_interval: Duration,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    let mut tick: u64 = 0;
    loop {
        ticker.tick().await;
        tick += 1;

        for variant in [Variant::Baseline, Variant::Candidate] {
            match source.sample(&experiment_id, variant).await {
                Ok(samples) if !samples.is_empty() => {
                    if let Err(e) = store.write_metric_samples(samples).await {
                        tracing::warn!(experiment_id, %variant, error = %e, "collector failed to cache samples");
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(experiment_id, %variant, error = %e, "collector failed to sample metrics source");
                }
            }
        }

        if tick % KPI_TRIGGER_EVERY_N_TICKS == 0 {
            compute_and_store_kpis(&experiment_id, &store, &analyser, &bus).await;
        }
    }
}

async fn compute_and_store_kpis(experiment_id: &str, store: &Store, analyser: &Analyser, bus: &EventBus) {
    let now = Utc::now();
    let window_start = now - chrono::Duration::minutes(30);
    let kpis = match analyser.analyse(experiment_id, window_start, now).await {
        Ok(k) => k,
        Err(e) => {
            tracing::warn!(experiment_id, error = %e, "kpi computation failed");
            return;
        }
    };

    let mut status = match store.get_experiment(experiment_id).await {
        Ok(e) => e.status,
        Err(e) => {
            tracing::warn!(experiment_id, error = %e, "collector could not load experiment to store kpis");
            return;
        }
    };
    status.kpis = Some(kpis.clone());
    if let Err(e) = store.update_experiment_status(experiment_id, status).await {
        tracing::warn!(experiment_id, error = %e, "failed to persist computed kpis");
        return;
    }

    bus.publish(BusMessage::new(
        "kpis_calculated",
        "experiments",
        serde_json::json!({ "experiment_id": experiment_id, "kpis": kpis }),
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use phx_core::config::KpiConfig;
    use phx_core::types::{Experiment, ExperimentConfig};
    use std::collections::HashMap as Map;

    fn experiment() -> Experiment {
        Experiment::new(
            "exp1",
            ExperimentConfig {
                target_hosts: vec!["h1".into()],
                baseline_template: "baseline".into(),
                baseline_variables: Map::new(),
                candidate_template: "topk".into(),
                candidate_variables: Map::new(),
                load_profile: None,
                duration_secs: 300,
                warmup_duration_secs: 0,
                critical_processes: vec![],
            },
        )
    }

    #[tokio::test]
    async fn start_is_rejected_while_already_running() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let analyser = Arc::new(Analyser::new(store.clone(), KpiConfig::default()));
        let registry = CollectorRegistry::new(
            store,
            analyser,
            Arc::new(NullSource),
            Arc::new(EventBus::new(16)),
            Duration::from_secs(3600),
        );
        registry.start("exp1").unwrap();
        let err = registry.start("exp1").unwrap_err();
        assert_eq!(err.kind(), "conflict");
        registry.stop("exp1");
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_clears_registry() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let analyser = Arc::new(Analyser::new(store.clone(), KpiConfig::default()));
        let registry = CollectorRegistry::new(
            store,
            analyser,
            Arc::new(NullSource),
            Arc::new(EventBus::new(16)),
            Duration::from_secs(3600),
        );
        registry.start("exp1").unwrap();
        assert!(registry.is_running("exp1"));
        registry.stop("exp1");
        registry.stop("exp1");
        assert!(!registry.is_running("exp1"));
        assert_eq!(registry.running_count(), 0);
    }

    #[tokio::test]
    async fn tick_writes_samples_and_triggers_kpis_on_fifth_tick() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        store.create_experiment(&experiment()).await.unwrap();
        let analyser = Arc::new(Analyser::new(store.clone(), KpiConfig::default()));
        let bus = Arc::new(EventBus::new(16));
        let sub = bus.subscribe("test", ["experiments".to_string()]);

        struct OneSample;
        #[async_trait::async_trait]
        impl MetricsSource for OneSample {
            async fn sample(&self, experiment_id: &str, variant: Variant) -> PhoenixResult<Vec<MetricSample>> {
                Ok(vec![MetricSample {
                    experiment_id: experiment_id.to_string(),
                    timestamp: Utc::now(),
                    metric_name: "process_cpu_usage_pct".into(),
                    variant,
                    host_id: "h1".into(),
                    value: 10.0,
                    labels: Map::new(),
                }])
            }
        }

        tokio::time::pause();
        let registry = CollectorRegistry::new(store.clone(), analyser, Arc::new(OneSample), bus, Duration::from_millis(10));
        registry.start("exp1").unwrap();

        for _ in 0..5 {
            tokio::time::advance(Duration::from_millis(10)).await;
        }
        tokio::task::yield_now().await;

        let msg = sub.receiver.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(msg.message_type, "kpis_calculated");
        registry.stop("exp1");
    }
}
