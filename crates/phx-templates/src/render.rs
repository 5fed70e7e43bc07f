use std::collections::HashMap;
use std::sync::RwLock;

use handlebars::Handlebars;
use phx_core::types::Variant;
use phx_core::{PhoenixError, PhoenixResult};
use serde::Serialize;

/// Input to `Render(templateName, data)`.
#[derive(Debug, Clone, Serialize)]
pub struct RenderData {
    pub experiment_id: String,
    pub variant: Variant,
    pub host_id: String,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
}

impl RenderData {
    pub fn new(experiment_id: impl Into<String>, variant: Variant, host_id: impl Into<String>) -> Self {
        Self {
            experiment_id: experiment_id.into(),
            variant,
            host_id: host_id.into(),
            parameters: HashMap::new(),
        }
    }
}

/// Deterministic renderer over a fixed built-in catalogue plus templates
/// registered at runtime. `render` never mutates state and two calls with
/// identical inputs always produce byte-identical output.
pub struct Renderer {
    engine: RwLock<Handlebars<'static>>,
}

impl Renderer {
    /// A renderer pre-loaded with the built-in catalogue: `baseline`,
    /// `topk`, `adaptive`, `hybrid`.
    pub fn with_builtins() -> Self {
        let mut engine = Handlebars::new();
        engine.set_strict_mode(false);
        for (name, source) in BUILTIN_TEMPLATES {
            engine
                .register_template_string(name, source)
                .expect("built-in template source must be valid handlebars");
        }
        Self { engine: RwLock::new(engine) }
    }

    /// Registers (or overwrites) a template at runtime. Purely in-memory —
    /// callers that need the registration to survive a restart persist it
    /// through `phx_store::Store::register_template` themselves and replay
    /// it here on startup. Takes `&self`: the engine is lock-guarded so a
    /// shared `Arc<Renderer>` held by every route handler can still accept
    /// runtime registrations.
    pub fn register(&self, name: &str, source: &str) -> PhoenixResult<()> {
        self.engine
            .write()
            .expect("template engine lock poisoned")
            .register_template_string(name, source)
            .map_err(|e| PhoenixError::invalid(format!("invalid template {name}: {e}")))
    }

    pub fn has_template(&self, name: &str) -> bool {
        self.engine.read().expect("template engine lock poisoned").get_template(name).is_some()
    }

    pub fn builtin_names() -> &'static [&'static str] {
        &["baseline", "topk", "adaptive", "hybrid"]
    }

    /// `Render(templateName, data) -> string | TemplateNotFound | RenderError`.
    pub fn render(&self, template_name: &str, data: &RenderData) -> PhoenixResult<String> {
        let engine = self.engine.read().expect("template engine lock poisoned");
        if engine.get_template(template_name).is_none() {
            return Err(PhoenixError::not_found(format!("template {template_name} not found")));
        }
        engine
            .render(template_name, data)
            .map_err(|e| PhoenixError::internal(format!("rendering {template_name}: {e}")))
    }
}

impl Default for Renderer {
    fn default() -> Self {
        Self::with_builtins()
    }
}

const BUILTIN_TEMPLATES: &[(&str, &str)] = &[
    ("baseline", BASELINE_TEMPLATE),
    ("topk", TOPK_TEMPLATE),
    ("adaptive", ADAPTIVE_TEMPLATE),
    ("hybrid", HYBRID_TEMPLATE),
];

/// Full-fidelity collector: no cardinality reduction, used as the control
/// variant every experiment compares against.
const BASELINE_TEMPLATE: &str = r#"receivers:
  otlp:
    endpoint: "0.0.0.0:4317"
processors:
  memory_limiter:
    limit_mib: {{#if parameters.memory_limit_mib}}{{parameters.memory_limit_mib}}{{else}}512{{/if}}
    check_interval: "5s"
  batch:
    timeout: "10s"
    send_batch_size: 8192
exporters:
  otlp:
    endpoint: "{{#if parameters.exporter_endpoint}}{{parameters.exporter_endpoint}}{{else}}collector.internal:4317{{/if}}"
    tls:
      insecure: false
service:
  pipelines:
    metrics:
      receivers: [otlp]
      processors: [memory_limiter, batch]
      exporters: [otlp]
"#;

/// Keeps only the top-K highest-cardinality label combinations per metric.
const TOPK_TEMPLATE: &str = r#"receivers:
  otlp:
    endpoint: "0.0.0.0:4317"
processors:
  memory_limiter:
    limit_mib: {{#if parameters.memory_limit_mib}}{{parameters.memory_limit_mib}}{{else}}512{{/if}}
    check_interval: "5s"
  topk_filter:
    limit: {{#if parameters.k}}{{parameters.k}}{{else}}50{{/if}}
  batch:
    timeout: "10s"
    send_batch_size: 8192
exporters:
  otlp:
    endpoint: "{{#if parameters.exporter_endpoint}}{{parameters.exporter_endpoint}}{{else}}collector.internal:4317{{/if}}"
    tls:
      insecure: false
service:
  pipelines:
    metrics:
      receivers: [otlp]
      processors: [memory_limiter, topk_filter, batch]
      exporters: [otlp]
"#;

/// Drops or aggregates series under a moving ingest-rate threshold.
const ADAPTIVE_TEMPLATE: &str = r#"receivers:
  otlp:
    endpoint: "0.0.0.0:4317"
processors:
  memory_limiter:
    limit_mib: {{#if parameters.memory_limit_mib}}{{parameters.memory_limit_mib}}{{else}}512{{/if}}
    check_interval: "5s"
  adaptive_sampler:
    limit: {{#if parameters.rate_limit}}{{parameters.rate_limit}}{{else}}1000{{/if}}
  batch:
    timeout: "10s"
    send_batch_size: 8192
exporters:
  otlp:
    endpoint: "{{#if parameters.exporter_endpoint}}{{parameters.exporter_endpoint}}{{else}}collector.internal:4317{{/if}}"
    tls:
      insecure: false
service:
  pipelines:
    metrics:
      receivers: [otlp]
      processors: [memory_limiter, adaptive_sampler, batch]
      exporters: [otlp]
"#;

/// Both top-K filtering and adaptive sampling in series.
const HYBRID_TEMPLATE: &str = r#"receivers:
  otlp:
    endpoint: "0.0.0.0:4317"
processors:
  memory_limiter:
    limit_mib: {{#if parameters.memory_limit_mib}}{{parameters.memory_limit_mib}}{{else}}512{{/if}}
    check_interval: "5s"
  topk_filter:
    limit: {{#if parameters.k}}{{parameters.k}}{{else}}50{{/if}}
  adaptive_sampler:
    limit: {{#if parameters.rate_limit}}{{parameters.rate_limit}}{{else}}1000{{/if}}
  batch:
    timeout: "10s"
    send_batch_size: 8192
exporters:
  otlp:
    endpoint: "{{#if parameters.exporter_endpoint}}{{parameters.exporter_endpoint}}{{else}}collector.internal:4317{{/if}}"
    tls:
      insecure: false
service:
  pipelines:
    metrics:
      receivers: [otlp]
      processors: [memory_limiter, topk_filter, adaptive_sampler, batch]
      exporters: [otlp]
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_is_pure_and_deterministic() {
        let renderer = Renderer::with_builtins();
        let data = RenderData::new("exp1", Variant::Baseline, "h1");
        let a = renderer.render("baseline", &data).unwrap();
        let b = renderer.render("baseline", &data).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn unknown_template_is_not_found() {
        let renderer = Renderer::with_builtins();
        let data = RenderData::new("exp1", Variant::Baseline, "h1");
        let err = renderer.render("does-not-exist", &data).unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn topk_honours_supplied_k_parameter() {
        let renderer = Renderer::with_builtins();
        let mut data = RenderData::new("exp1", Variant::Candidate, "h1");
        data.parameters.insert("k".into(), serde_json::json!(25));
        let out = renderer.render("topk", &data).unwrap();
        assert!(out.contains("limit: 25"));
    }

    #[test]
    fn runtime_registration_is_immediately_renderable() {
        let renderer = Renderer::with_builtins();
        renderer
            .register("custom", "receivers:\n  otlp:\n    endpoint: \"x\"\n")
            .unwrap();
        let data = RenderData::new("exp1", Variant::Baseline, "h1");
        assert!(renderer.render("custom", &data).is_ok());
    }
}
