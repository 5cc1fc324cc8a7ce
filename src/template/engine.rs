//! Template engine for trial patches, Helm values and metric queries

use minijinja::{Environment, UndefinedBehavior, Value};

use super::context::{MetricContext, PatchContext};
use super::filters;
use crate::crd::{Metric, Trial};
use crate::Result;

/// Template engine with strict undefined handling
///
/// Supports:
/// - Standard Jinja `{{ ... }}` / `{% ... %}` syntax
/// - Custom filters (percent, base64_encode, required)
/// - A `duration(start, end)` function for metric queries
pub struct TemplateEngine {
    env: Environment<'static>,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateEngine {
    /// Create a new template engine
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_keep_trailing_newline(true);

        env.add_filter("percent", filters::percent);
        env.add_filter("base64_encode", filters::base64_encode);
        env.add_filter("required", filters::required);
        env.add_function("duration", filters::duration);

        Self { env }
    }

    fn render(&self, template: &str, ctx: Value) -> Result<String> {
        Ok(self.env.render_str(template, ctx)?)
    }

    /// Render a patch template to a JSON document
    ///
    /// Templates may produce YAML or JSON. Returns None when the rendered
    /// document is empty or `null`, which means "nothing to patch".
    pub fn render_patch(&self, template: &str, trial: &Trial) -> Result<Option<String>> {
        let rendered = self.render(template, Value::from_serialize(PatchContext::new(trial)))?;
        if rendered.trim().is_empty() {
            return Ok(None);
        }
        let doc: serde_json::Value = serde_yaml::from_str(&rendered)?;
        if doc.is_null() {
            return Ok(None);
        }
        Ok(Some(serde_json::to_string(&doc)?))
    }

    /// Render a literal Helm value
    pub fn render_helm_value(&self, value: &str, trial: &Trial) -> Result<String> {
        self.render(value, Value::from_serialize(PatchContext::new(trial)))
    }

    /// Render a metric's query and (optional) error query
    pub fn render_metric_queries(
        &self,
        metric: &Metric,
        trial: &Trial,
    ) -> Result<(String, Option<String>)> {
        let ctx = Value::from_serialize(MetricContext::new(trial));
        let query = self.render(&metric.query, ctx.clone())?;
        let error_query = match metric.error_query.as_deref().filter(|q| !q.is_empty()) {
            Some(q) => Some(self.render(q, ctx)?),
            None => None,
        };
        Ok((query, error_query))
    }
}
