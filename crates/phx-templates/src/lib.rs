//! Template Renderer.
//!
//! `render` is the pure function the rest of the control plane treats as a
//! black box: `(templateName, data) -> rendered string`. This crate
//! supplies the concrete implementation — `handlebars` as the templating
//! engine plus Phoenix's own built-in catalogue and the `Validate`
//! pipeline-graph checker. Pipeline YAML shape follows the
//! receivers/processors/exporters wiring used by OTel-collector-style
//! pipelines.

pub mod render;
pub mod validate;

pub use render::{RenderData, Renderer};
pub use validate::validate;
