//! Template rendering for patches, Helm values and metric queries
//!
//! Templates use standard Jinja syntax via minijinja with strict undefined
//! handling, so a reference to a parameter the trial does not assign fails
//! instead of rendering as an empty string.
//!
//! # Patch and Helm value context
//!
//! - `{{ values.<parameter> }}` - integer assignment for the parameter
//! - `{{ trial.name }}`, `{{ trial.namespace }}`, `{{ trial.target_namespace }}`
//! - `{{ trial.labels }}`, `{{ trial.annotations }}`
//!
//! # Metric context
//!
//! Everything in the patch context plus:
//!
//! - `{{ start_time }}`, `{{ completion_time }}` - RFC 3339 timestamps
//! - `{{ duration_seconds }}` - completion minus start, never negative
//! - `{{ range }}` - the duration as a Prometheus range (e.g. `300s`)

mod context;
mod engine;
mod filters;

pub use context::{MetricContext, PatchContext, TrialMeta};
pub use engine::TemplateEngine;
