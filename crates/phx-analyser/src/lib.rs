//! KPI Analyser.
//!
//! Pulls variant snapshots through a [`MetricsBackend`] — a query seam
//! left abstract so the analyser can be driven by `phx-store`'s
//! `metric_cache` in production and by a fixture backend in tests — and
//! reduces them to a [`phx_core::types::KpiResult`] plus a five-tier
//! recommendation. Deterministic and side-effect free beyond reading the
//! backend: persisting the result on the experiment row is the caller's
//! job (the Experiment Controller).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use phx_core::config::{CostConfig, KpiConfig};
use phx_core::types::{KpiResult, Recommendation, ReductionMetric, Variant};
use phx_core::{PhoenixError, PhoenixResult};
use phx_store::Store;

/// Canonical metric names the analyser queries. Collectors are expected
/// to write samples under these names; anything else they write is
/// simply not consulted by KPI computation.
pub const CPU_METRIC: &str = "process_cpu_usage_pct";
pub const MEMORY_METRIC: &str = "process_memory_bytes";
pub const INGEST_METRIC: &str = "ingest_rate_points_per_sec";

/// Query seam over the metrics store. Implemented for
/// `phx_store::Store` directly; tests supply an in-memory fake.
#[async_trait]
pub trait MetricsBackend: Send + Sync {
    async fn latest_value(
        &self,
        experiment_id: &str,
        metric_name: &str,
        variant: Variant,
        at: DateTime<Utc>,
    ) -> PhoenixResult<Option<f64>>;

    async fn cardinality(&self, experiment_id: &str, variant: Variant, since: DateTime<Utc>) -> PhoenixResult<u64>;
}

#[async_trait]
impl MetricsBackend for Store {
    async fn latest_value(
        &self,
        experiment_id: &str,
        metric_name: &str,
        variant: Variant,
        at: DateTime<Utc>,
    ) -> PhoenixResult<Option<f64>> {
        self.latest_metric_value(experiment_id, metric_name, variant, at).await
    }

    async fn cardinality(&self, experiment_id: &str, variant: Variant, since: DateTime<Utc>) -> PhoenixResult<u64> {
        self.distinct_series_count(experiment_id, variant, since).await
    }
}

/// Counts successful backend fetches per variant across one `analyse`
/// call, so the step can tell "some agents had a bad sample" (recoverable,
/// logged into `errors`) apart from "the backend never returned anything
/// for this variant at all" (fails the whole step).
#[derive(Default)]
struct PerVariantFetches {
    baseline_ok: u32,
    candidate_ok: u32,
}

impl PerVariantFetches {
    fn record_ok(&mut self, variant: Variant) {
        match variant {
            Variant::Baseline => self.baseline_ok += 1,
            Variant::Candidate => self.candidate_ok += 1,
        }
    }
}

pub struct Analyser {
    backend: Arc<dyn MetricsBackend>,
    config: KpiConfig,
    cost: CostConfig,
}

impl Analyser {
    pub fn new(backend: Arc<dyn MetricsBackend>, config: KpiConfig) -> Self {
        Self {
            backend,
            config,
            cost: CostConfig::default(),
        }
    }

    /// Builds an analyser from the full application config, splitting out
    /// the KPI thresholds and the cost-rate table it needs.
    pub fn from_config(backend: Arc<dyn MetricsBackend>, config: &phx_core::Config) -> Self {
        Self {
            backend,
            config: config.kpi.clone(),
            cost: config.cost.clone(),
        }
    }

    /// `Analyse(experiment_id, window_start, at)`.
    /// `window_start` bounds the cardinality query; `at` is the range-end
    /// instant scalar metrics are sampled at.
    pub async fn analyse(
        &self,
        experiment_id: &str,
        window_start: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> PhoenixResult<KpiResult> {
        let mut errors = Vec::new();
        let mut fetched = PerVariantFetches::default();

        let base_cardinality = self
            .cardinality_or_log(experiment_id, Variant::Baseline, window_start, &mut errors, &mut fetched)
            .await;
        let cand_cardinality = self
            .cardinality_or_log(experiment_id, Variant::Candidate, window_start, &mut errors, &mut fetched)
            .await;
        let cardinality_reduction_pct = reduction_pct_floored(base_cardinality as f64, cand_cardinality as f64);

        let cpu = self.reduction_metric(experiment_id, CPU_METRIC, at, &mut errors, &mut fetched).await;
        let memory = self.reduction_metric(experiment_id, MEMORY_METRIC, at, &mut errors, &mut fetched).await;
        let ingest = self.reduction_metric(experiment_id, INGEST_METRIC, at, &mut errors, &mut fetched).await;

        let cost_reduction_pct = self.cost_reduction_pct(
            base_cardinality,
            cand_cardinality,
            &ingest,
            cardinality_reduction_pct,
            cpu.reduction_pct,
            memory.reduction_pct,
        );

        let data_accuracy_pct = self.data_accuracy_pct(experiment_id, at, &mut errors, &mut fetched).await;

        // Per-host agent hiccups are recoverable and surface as individual
        // entries in `errors`; only a backend that could not fetch
        // anything at all for *either* variant fails the analyse step.
        if fetched.baseline_ok == 0 && fetched.candidate_ok == 0 {
            return Err(PhoenixError::Unavailable(format!(
                "metrics backend returned no data for either variant of experiment {experiment_id}: {}",
                errors.join("; ")
            )));
        }

        let recommendation = self.recommend(cardinality_reduction_pct, cost_reduction_pct, data_accuracy_pct, cpu.reduction_pct);

        Ok(KpiResult {
            cardinality_reduction_pct,
            cost_reduction_pct,
            cpu_usage: cpu,
            memory_usage: memory,
            ingest_rate: ingest,
            data_accuracy_pct,
            recommendation,
            errors,
            computed_at: Utc::now(),
        })
    }

    async fn cardinality_or_log(
        &self,
        experiment_id: &str,
        variant: Variant,
        since: DateTime<Utc>,
        errors: &mut Vec<String>,
        fetched: &mut PerVariantFetches,
    ) -> u64 {
        match self.backend.cardinality(experiment_id, variant, since).await {
            Ok(n) => {
                fetched.record_ok(variant);
                n
            }
            Err(e) => {
                errors.push(format!("cardinality({variant}): {e}"));
                0
            }
        }
    }

    async fn reduction_metric(
        &self,
        experiment_id: &str,
        metric_name: &str,
        at: DateTime<Utc>,
        errors: &mut Vec<String>,
        fetched: &mut PerVariantFetches,
    ) -> ReductionMetric {
        let baseline = self
            .value_or_log(experiment_id, metric_name, Variant::Baseline, at, errors, fetched)
            .await;
        let candidate = self
            .value_or_log(experiment_id, metric_name, Variant::Candidate, at, errors, fetched)
            .await;
        ReductionMetric {
            baseline,
            candidate,
            reduction_pct: reduction_pct(baseline, candidate),
        }
    }

    async fn value_or_log(
        &self,
        experiment_id: &str,
        metric_name: &str,
        variant: Variant,
        at: DateTime<Utc>,
        errors: &mut Vec<String>,
        fetched: &mut PerVariantFetches,
    ) -> f64 {
        match self.backend.latest_value(experiment_id, metric_name, variant, at).await {
            Ok(v) => {
                fetched.record_ok(variant);
                v.unwrap_or(0.0)
            }
            Err(e) => {
                errors.push(format!("{metric_name}({variant}): {e}"));
                0.0
            }
        }
    }

    /// Step 4: absolute cost model, falling back to a weighted blend when
    /// ingest rates are unavailable for either variant.
    fn cost_reduction_pct(
        &self,
        base_cardinality: u64,
        cand_cardinality: u64,
        ingest: &ReductionMetric,
        cardinality_reduction_pct: f64,
        cpu_reduction_pct: f64,
        memory_reduction_pct: f64,
    ) -> f64 {
        if ingest.baseline > 0.0 && ingest.candidate > 0.0 {
            let base_cost = self.monthly_cost(ingest.baseline, base_cardinality);
            let cand_cost = self.monthly_cost(ingest.candidate, cand_cardinality);
            if base_cost > 0.0 {
                return ((base_cost - cand_cost) / base_cost * 100.0).max(0.0);
            }
        }
        (0.7 * cardinality_reduction_pct + 0.2 * cpu_reduction_pct.max(0.0) + 0.1 * memory_reduction_pct.max(0.0)).max(0.0)
    }

    fn monthly_cost(&self, ingest_rate_per_sec: f64, cardinality: u64) -> f64 {
        const SECONDS_PER_MONTH: f64 = 30.0 * 24.0 * 3600.0;
        const GB: f64 = 1024.0 * 1024.0 * 1024.0;
        let ingest_cost = (ingest_rate_per_sec * SECONDS_PER_MONTH / 1_000_000.0) * self.config_ingest_cost_per_million();
        let storage_cost =
            (cardinality as f64 * 8.0 * self.config_retention_seconds() / GB) * self.config_storage_cost_per_gb();
        let base = ingest_cost + storage_cost;
        base * (1.0 + self.config_processing_overhead_pct() / 100.0)
    }

    /// Step 5: presence ratio of the configured critical metrics.
    async fn data_accuracy_pct(
        &self,
        experiment_id: &str,
        at: DateTime<Utc>,
        errors: &mut Vec<String>,
        fetched: &mut PerVariantFetches,
    ) -> f64 {
        let mut present_baseline = 0u32;
        let mut present_candidate = 0u32;
        for metric in &self.config.critical_metrics {
            let baseline_result = self.backend.latest_value(experiment_id, metric, Variant::Baseline, at).await;
            let baseline_present = match baseline_result {
                Ok(v) => {
                    fetched.record_ok(Variant::Baseline);
                    v.is_some()
                }
                Err(e) => {
                    errors.push(format!("accuracy probe {metric}(baseline): {e}"));
                    false
                }
            };
            if baseline_present {
                present_baseline += 1;
                let candidate_result = self.backend.latest_value(experiment_id, metric, Variant::Candidate, at).await;
                let candidate_present = match candidate_result {
                    Ok(v) => {
                        fetched.record_ok(Variant::Candidate);
                        v.is_some()
                    }
                    Err(e) => {
                        errors.push(format!("accuracy probe {metric}(candidate): {e}"));
                        false
                    }
                };
                if candidate_present {
                    present_candidate += 1;
                }
            }
        }
        if present_baseline == 0 {
            100.0
        } else {
            100.0 * present_candidate as f64 / present_baseline as f64
        }
    }

    /// Five-tier recommendation.
    fn recommend(&self, cardinality_reduction_pct: f64, cost_reduction_pct: f64, accuracy_pct: f64, cpu_reduction_pct: f64) -> Recommendation {
        let cpu_increase_pct = -cpu_reduction_pct;
        if accuracy_pct < self.config.min_accuracy_pct {
            return Recommendation::DoNotPromote;
        }
        if cpu_increase_pct > self.config.max_cpu_increase_pct {
            return Recommendation::Caution;
        }
        if cardinality_reduction_pct < self.config.min_cardinality_reduction_pct
            || cost_reduction_pct < self.config.min_cost_reduction_pct
        {
            return Recommendation::LimitedBenefit;
        }
        if cardinality_reduction_pct > self.config.strongly_recommend_cardinality_pct
            && accuracy_pct >= self.config.strongly_recommend_accuracy_pct
        {
            return Recommendation::StronglyRecommend;
        }
        Recommendation::Recommend
    }

    fn config_ingest_cost_per_million(&self) -> f64 {
        self.cost.ingest_cost_per_million
    }
    fn config_storage_cost_per_gb(&self) -> f64 {
        self.cost.storage_cost_per_gb
    }
    fn config_retention_seconds(&self) -> f64 {
        self.cost.retention_seconds
    }
    fn config_processing_overhead_pct(&self) -> f64 {
        self.cost.processing_overhead_pct
    }
}

fn reduction_pct(baseline: f64, candidate: f64) -> f64 {
    if baseline == 0.0 {
        0.0
    } else {
        (baseline - candidate) / baseline * 100.0
    }
}

fn reduction_pct_floored(baseline: f64, candidate: f64) -> f64 {
    if baseline <= 0.0 {
        0.0
    } else {
        ((baseline - candidate) / baseline * 100.0).max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct FakeBackend {
        values: Mutex<HashMap<(String, String, Variant), f64>>,
        cardinalities: Mutex<HashMap<(String, Variant), u64>>,
    }

    impl FakeBackend {
        fn new() -> Self {
            Self {
                values: Mutex::new(HashMap::new()),
                cardinalities: Mutex::new(HashMap::new()),
            }
        }

        fn set_value(&self, experiment_id: &str, metric: &str, variant: Variant, value: f64) {
            self.values
                .lock()
                .unwrap()
                .insert((experiment_id.to_string(), metric.to_string(), variant), value);
        }

        fn set_cardinality(&self, experiment_id: &str, variant: Variant, n: u64) {
            self.cardinalities
                .lock()
                .unwrap()
                .insert((experiment_id.to_string(), variant), n);
        }
    }

    #[async_trait]
    impl MetricsBackend for FakeBackend {
        async fn latest_value(
            &self,
            experiment_id: &str,
            metric_name: &str,
            variant: Variant,
            _at: DateTime<Utc>,
        ) -> PhoenixResult<Option<f64>> {
            Ok(self
                .values
                .lock()
                .unwrap()
                .get(&(experiment_id.to_string(), metric_name.to_string(), variant))
                .copied())
        }

        async fn cardinality(&self, experiment_id: &str, variant: Variant, _since: DateTime<Utc>) -> PhoenixResult<u64> {
            Ok(self
                .cardinalities
                .lock()
                .unwrap()
                .get(&(experiment_id.to_string(), variant))
                .copied()
                .unwrap_or(0))
        }
    }

    fn analyser_with(backend: Arc<FakeBackend>) -> Analyser {
        Analyser::new(backend, KpiConfig::default())
    }

    #[tokio::test]
    async fn strongly_recommends_when_big_win_and_high_accuracy() {
        let backend = Arc::new(FakeBackend::new());
        backend.set_cardinality("exp1", Variant::Baseline, 1000);
        backend.set_cardinality("exp1", Variant::Candidate, 400);
        backend.set_value("exp1", CPU_METRIC, Variant::Baseline, 50.0);
        backend.set_value("exp1", CPU_METRIC, Variant::Candidate, 45.0);
        backend.set_value("exp1", MEMORY_METRIC, Variant::Baseline, 1000.0);
        backend.set_value("exp1", MEMORY_METRIC, Variant::Candidate, 900.0);
        backend.set_value("exp1", INGEST_METRIC, Variant::Baseline, 10000.0);
        backend.set_value("exp1", INGEST_METRIC, Variant::Candidate, 4000.0);
        for metric in &KpiConfig::default().critical_metrics {
            backend.set_value("exp1", metric, Variant::Baseline, 1.0);
            backend.set_value("exp1", metric, Variant::Candidate, 1.0);
        }

        let analyser = analyser_with(backend);
        let now = Utc::now();
        let result = analyser.analyse("exp1", now - chrono::Duration::minutes(30), now).await.unwrap();

        assert_eq!(result.cardinality_reduction_pct, 60.0);
        assert_eq!(result.data_accuracy_pct, 100.0);
        assert!(matches!(result.recommendation, Recommendation::StronglyRecommend));
        assert!(result.errors.is_empty());
    }

    #[tokio::test]
    async fn low_accuracy_forces_do_not_promote() {
        let backend = Arc::new(FakeBackend::new());
        backend.set_cardinality("exp1", Variant::Baseline, 1000);
        backend.set_cardinality("exp1", Variant::Candidate, 100);
        for metric in &KpiConfig::default().critical_metrics {
            backend.set_value("exp1", metric, Variant::Baseline, 1.0);
        }
        // none present for candidate -> 0% accuracy

        let analyser = analyser_with(backend);
        let now = Utc::now();
        let result = analyser.analyse("exp1", now - chrono::Duration::minutes(30), now).await.unwrap();
        assert_eq!(result.data_accuracy_pct, 0.0);
        assert!(matches!(result.recommendation, Recommendation::DoNotPromote));
    }

    #[tokio::test]
    async fn cpu_regression_forces_caution_when_accuracy_is_fine() {
        let backend = Arc::new(FakeBackend::new());
        backend.set_cardinality("exp1", Variant::Baseline, 1000);
        backend.set_cardinality("exp1", Variant::Candidate, 700);
        backend.set_value("exp1", CPU_METRIC, Variant::Baseline, 50.0);
        backend.set_value("exp1", CPU_METRIC, Variant::Candidate, 70.0);
        for metric in &KpiConfig::default().critical_metrics {
            backend.set_value("exp1", metric, Variant::Baseline, 1.0);
            backend.set_value("exp1", metric, Variant::Candidate, 1.0);
        }

        let analyser = analyser_with(backend);
        let now = Utc::now();
        let result = analyser.analyse("exp1", now - chrono::Duration::minutes(30), now).await.unwrap();
        assert!(matches!(result.recommendation, Recommendation::Caution));
    }

    #[tokio::test]
    async fn missing_ingest_rate_falls_back_to_weighted_blend() {
        let backend = Arc::new(FakeBackend::new());
        backend.set_cardinality("exp1", Variant::Baseline, 1000);
        backend.set_cardinality("exp1", Variant::Candidate, 750);
        // no ingest samples at all -> cost model falls back to the blend
        let analyser = analyser_with(backend);
        let now = Utc::now();
        let result = analyser.analyse("exp1", now - chrono::Duration::minutes(30), now).await.unwrap();
        assert_eq!(result.cost_reduction_pct, 0.7 * 25.0);
    }

    #[tokio::test]
    async fn zero_baseline_cardinality_yields_zero_reduction_not_nan() {
        let backend = Arc::new(FakeBackend::new());
        let analyser = analyser_with(backend);
        let now = Utc::now();
        let result = analyser.analyse("exp1", now - chrono::Duration::minutes(30), now).await.unwrap();
        assert_eq!(result.cardinality_reduction_pct, 0.0);
        assert!(!result.cardinality_reduction_pct.is_nan());
    }

    /// A backend that errors on every call, regardless of variant.
    struct FailingBackend;

    #[async_trait]
    impl MetricsBackend for FailingBackend {
        async fn latest_value(
            &self,
            _experiment_id: &str,
            _metric_name: &str,
            _variant: Variant,
            _at: DateTime<Utc>,
        ) -> PhoenixResult<Option<f64>> {
            Err(PhoenixError::Unavailable("backend down".into()))
        }

        async fn cardinality(&self, _experiment_id: &str, _variant: Variant, _since: DateTime<Utc>) -> PhoenixResult<u64> {
            Err(PhoenixError::Unavailable("backend down".into()))
        }
    }

    /// A backend that only ever serves the baseline variant; every
    /// candidate call errors. One variant being fully fetchable should
    /// still be a recoverable, `Ok` analysis.
    struct BaselineOnlyBackend;

    #[async_trait]
    impl MetricsBackend for BaselineOnlyBackend {
        async fn latest_value(
            &self,
            _experiment_id: &str,
            _metric_name: &str,
            variant: Variant,
            _at: DateTime<Utc>,
        ) -> PhoenixResult<Option<f64>> {
            match variant {
                Variant::Baseline => Ok(Some(10.0)),
                Variant::Candidate => Err(PhoenixError::Unavailable("candidate host unreachable".into())),
            }
        }

        async fn cardinality(&self, _experiment_id: &str, variant: Variant, _since: DateTime<Utc>) -> PhoenixResult<u64> {
            match variant {
                Variant::Baseline => Ok(500),
                Variant::Candidate => Err(PhoenixError::Unavailable("candidate host unreachable".into())),
            }
        }
    }

    #[tokio::test]
    async fn total_failure_to_fetch_either_variant_is_an_error() {
        let analyser = Analyser::new(Arc::new(FailingBackend), KpiConfig::default());
        let now = Utc::now();
        let result = analyser.analyse("exp1", now - chrono::Duration::minutes(30), now).await;
        assert!(matches!(result, Err(PhoenixError::Unavailable(_))));
    }

    #[tokio::test]
    async fn one_variant_fully_down_is_still_a_recoverable_ok_analysis() {
        let analyser = Analyser::new(Arc::new(BaselineOnlyBackend), KpiConfig::default());
        let now = Utc::now();
        let result = analyser.analyse("exp1", now - chrono::Duration::minutes(30), now).await.unwrap();
        assert!(!result.errors.is_empty());
    }
}
