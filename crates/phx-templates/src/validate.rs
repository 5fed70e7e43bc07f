use std::collections::HashMap;

use phx_core::{PhoenixError, PhoenixResult};
use serde::Deserialize;

/// Shape of a rendered pipeline config, permissive enough to accept any
/// receiver/processor/exporter name while still letting us walk the graph
///. Unknown top-level keys are ignored rather than rejected —
/// `Validate` only cares about the wiring, not the full OTel-collector schema.
#[derive(Debug, Deserialize)]
struct PipelineConfig {
    #[serde(default)]
    receivers: HashMap<String, serde_yaml::Value>,
    #[serde(default)]
    processors: HashMap<String, serde_yaml::Value>,
    #[serde(default)]
    exporters: HashMap<String, serde_yaml::Value>,
    service: ServiceConfig,
}

#[derive(Debug, Deserialize)]
struct ServiceConfig {
    pipelines: HashMap<String, PipelineRef>,
}

#[derive(Debug, Deserialize)]
struct PipelineRef {
    #[serde(default)]
    receivers: Vec<String>,
    #[serde(default)]
    processors: Vec<String>,
    #[serde(default)]
    exporters: Vec<String>,
}

/// `Validate(rendered) -> Ok | Err(reasons)`. Parses the
/// rendered YAML and checks every rejection rule; returns the first rule
/// violated rather than accumulating all of them, mirroring `Render`'s
/// fail-fast contract.
pub fn validate(rendered: &str) -> PhoenixResult<()> {
    let config: PipelineConfig = serde_yaml::from_str(rendered)
        .map_err(|e| PhoenixError::invalid(format!("pipeline config is not valid YAML: {e}")))?;

    if config.receivers.is_empty() {
        return Err(PhoenixError::invalid("pipeline config has no receivers"));
    }
    if config.exporters.is_empty() {
        return Err(PhoenixError::invalid("pipeline config has no exporters"));
    }
    if config.service.pipelines.is_empty() {
        return Err(PhoenixError::invalid("pipeline config declares no service pipelines"));
    }

    for (name, body) in &config.receivers {
        validate_otlp_endpoint("receiver", name, body)?;
    }
    for (name, body) in &config.exporters {
        validate_otlp_endpoint("exporter", name, body)?;
        validate_tls_insecure(name, body)?;
    }
    for (name, body) in &config.processors {
        validate_processor(name, body)?;
    }

    for (pipeline_name, pipeline) in &config.service.pipelines {
        validate_refs_resolve(pipeline_name, "receivers", &pipeline.receivers, &config.receivers)?;
        validate_refs_resolve(pipeline_name, "processors", &pipeline.processors, &config.processors)?;
        validate_refs_resolve(pipeline_name, "exporters", &pipeline.exporters, &config.exporters)?;
    }

    Ok(())
}

/// Exporters (and the `otlp` receiver) that ship with a network endpoint;
/// rendering one with a blank `endpoint` produces a collector that starts
/// but never sends anything anywhere.
const ENDPOINT_CARRYING: &[&str] = &["otlp", "prometheus", "pushgateway"];

fn validate_otlp_endpoint(kind: &str, name: &str, body: &serde_yaml::Value) -> PhoenixResult<()> {
    if !ENDPOINT_CARRYING.contains(&name) {
        return Ok(());
    }
    let endpoint = body.get("endpoint").and_then(|v| v.as_str()).unwrap_or("");
    if endpoint.trim().is_empty() {
        return Err(PhoenixError::invalid(format!("{name} {kind} has an empty endpoint")));
    }
    Ok(())
}

fn validate_tls_insecure(name: &str, body: &serde_yaml::Value) -> PhoenixResult<()> {
    let Some(tls) = body.get("tls") else {
        return Ok(());
    };
    let Some(insecure) = tls.get("insecure") else {
        return Ok(());
    };
    if !insecure.is_bool() {
        return Err(PhoenixError::invalid(format!(
            "exporter {name} has a non-boolean tls.insecure field"
        )));
    }
    Ok(())
}

fn validate_processor(name: &str, body: &serde_yaml::Value) -> PhoenixResult<()> {
    match name {
        "batch" => {
            let timeout_ok = body
                .get("timeout")
                .and_then(|v| v.as_str())
                .map(|s| !s.trim().is_empty())
                .unwrap_or(false);
            if !timeout_ok {
                return Err(PhoenixError::invalid("batch processor has an invalid timeout"));
            }
            let batch_size_ok = body
                .get("send_batch_size")
                .and_then(|v| v.as_u64())
                .map(|n| n > 0)
                .unwrap_or(false);
            if !batch_size_ok {
                return Err(PhoenixError::invalid("batch processor has an invalid send_batch_size"));
            }
        }
        "memory_limiter" => {
            let limit_ok = body
                .get("limit_mib")
                .and_then(|v| v.as_u64())
                .map(|n| n > 0)
                .unwrap_or(false);
            if !limit_ok {
                return Err(PhoenixError::invalid("memory_limiter has an invalid limit_mib"));
            }
            let interval_ok = body
                .get("check_interval")
                .and_then(|v| v.as_str())
                .map(|s| !s.trim().is_empty())
                .unwrap_or(false);
            if !interval_ok {
                return Err(PhoenixError::invalid("memory_limiter has an invalid check_interval"));
            }
        }
        _ => {
            if let Some(mapping) = body.as_mapping() {
                for (key, value) in mapping {
                    let Some(key) = key.as_str() else { continue };
                    if key.to_lowercase().contains("limit") {
                        let positive = value.as_u64().map(|n| n > 0).or_else(|| value.as_i64().map(|n| n > 0));
                        if positive != Some(true) {
                            return Err(PhoenixError::invalid(format!(
                                "processor {name} has a non-positive {key}"
                            )));
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

fn validate_refs_resolve(
    pipeline_name: &str,
    kind: &str,
    refs: &[String],
    declared: &HashMap<String, serde_yaml::Value>,
) -> PhoenixResult<()> {
    for r in refs {
        if !declared.contains_key(r) {
            return Err(PhoenixError::invalid(format!(
                "pipeline {pipeline_name} references undeclared {kind} component {r}"
            )));
        }
    }
    Ok(())
}
