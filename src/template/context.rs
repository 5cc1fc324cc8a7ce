//! Template contexts built from a trial

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use kube::ResourceExt;
use serde::Serialize;

use crate::crd::Trial;

/// Trial metadata visible to templates
#[derive(Clone, Debug, Default, Serialize)]
pub struct TrialMeta {
    /// Trial name
    pub name: String,
    /// Namespace the trial lives in
    pub namespace: String,
    /// Namespace patches and setup tasks target
    pub target_namespace: String,
    /// Trial labels
    pub labels: BTreeMap<String, String>,
    /// Trial annotations
    pub annotations: BTreeMap<String, String>,
}

impl TrialMeta {
    fn from_trial(trial: &Trial) -> Self {
        Self {
            name: trial.name_any(),
            namespace: trial.namespace().unwrap_or_default(),
            target_namespace: trial.target_namespace(),
            labels: trial.labels().clone(),
            annotations: trial.annotations().clone(),
        }
    }
}

/// Context for patch templates and Helm values
#[derive(Clone, Debug, Default, Serialize)]
pub struct PatchContext {
    /// Trial metadata
    pub trial: TrialMeta,
    /// Parameter assignments keyed by parameter name
    pub values: BTreeMap<String, i64>,
}

impl PatchContext {
    /// Build the context for a trial
    pub fn new(trial: &Trial) -> Self {
        Self {
            trial: TrialMeta::from_trial(trial),
            values: trial
                .spec
                .assignments
                .iter()
                .map(|a| (a.name.clone(), a.value))
                .collect(),
        }
    }
}

/// Context for metric queries, evaluated after the trial run completed
#[derive(Clone, Debug, Default, Serialize)]
pub struct MetricContext {
    /// Trial metadata
    pub trial: TrialMeta,
    /// Parameter assignments keyed by parameter name
    pub values: BTreeMap<String, i64>,
    /// Effective start of the trial run
    pub start_time: String,
    /// Completion of the trial run
    pub completion_time: String,
    /// Seconds between start and completion
    pub duration_seconds: f64,
    /// Duration as a Prometheus range value
    pub range: String,
}

impl MetricContext {
    /// Build the context for a trial
    pub fn new(trial: &Trial) -> Self {
        let patch = PatchContext::new(trial);
        let status = trial.status.as_ref();
        let start = status.and_then(|s| s.start_time);
        let completion = status.and_then(|s| s.completion_time);
        let duration_seconds = match (start, completion) {
            (Some(s), Some(c)) if s < c => (c - s).num_milliseconds() as f64 / 1000.0,
            _ => 0.0,
        };

        Self {
            trial: patch.trial,
            values: patch.values,
            start_time: format_time(start),
            completion_time: format_time(completion),
            duration_seconds,
            range: format!("{duration_seconds:.0}s"),
        }
    }
}

fn format_time(t: Option<DateTime<Utc>>) -> String {
    t.map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default()
}
