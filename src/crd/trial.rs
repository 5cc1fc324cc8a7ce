//! Trial Custom Resource Definition
//!
//! A Trial evaluates one set of parameter assignments: it runs setup tasks,
//! patches the target workloads, runs a trial job and collects metrics.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::JobTemplateSpec;
use k8s_openapi::api::core::v1::{ObjectReference, Volume};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Assignment, Condition, PatchOperation, SetupTask, TrialValue};
use crate::{ANNOTATION_REPORT_TRIAL_URL, LABEL_TRIAL};

/// Specification for a Trial
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "trialops.dev",
    version = "v1alpha1",
    kind = "Trial",
    plural = "trials",
    shortname = "tr",
    status = "TrialStatus",
    namespaced,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Assignments","type":"string","jsonPath":".status.assignmentsSummary"}"#,
    printcolumn = r#"{"name":"Values","type":"string","jsonPath":".status.valuesSummary"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TrialSpec {
    /// Experiment holding the definitions for this trial, defaults to an
    /// experiment with the trial's name in the trial's namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_ref: Option<ObjectReference>,

    /// Default namespace for patch targets, defaults to the trial namespace.
    /// Set once at creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_namespace: Option<String>,

    /// Parameter assignments evaluated by this trial
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assignments: Vec<Assignment>,

    /// Matches the job representing the trial run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,

    /// Job template for the trial run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<JobTemplateSpec>,

    /// Seconds added to the observed job start time to account for spin up
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time_offset_seconds: Option<i64>,

    /// Approximate run time of the default trial job in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approximate_runtime_seconds: Option<i64>,

    /// Minimum seconds after finishing before the trial may be cleaned up
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds_after_finished: Option<i32>,

    /// Tasks run before the trial starts and after it ends
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub setup_tasks: Vec<SetupTask>,

    /// Volumes available to setup tasks
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub setup_volumes: Vec<Volume>,

    /// Service account for setup jobs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_service_account_name: Option<String>,
}

/// Status for a Trial
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrialStatus {
    /// One word summary of where the trial is in its lifecycle
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub phase: String,

    /// Assignments rendered for display
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub assignments_summary: String,

    /// Collected values rendered for display
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub values_summary: String,

    /// Effective (offset) start time of the trial run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    /// Completion time of the trial run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,

    /// Conditions representing the trial state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Rendered patches and their progress
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patch_operations: Vec<PatchOperation>,

    /// Collected metric values and their progress
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<TrialValue>,
}

impl Trial {
    /// Namespace patches and setup tasks target
    pub fn target_namespace(&self) -> String {
        self.spec
            .target_namespace
            .clone()
            .filter(|ns| !ns.is_empty())
            .or_else(|| self.namespace())
            .unwrap_or_default()
    }

    /// Namespace and name of the owning experiment
    pub fn experiment_key(&self) -> (String, String) {
        let reference = self.spec.experiment_ref.as_ref();
        let namespace = reference
            .and_then(|r| r.namespace.clone())
            .or_else(|| self.namespace())
            .unwrap_or_default();
        let name = reference
            .and_then(|r| r.name.clone())
            .unwrap_or_else(|| self.name_any());
        (namespace, name)
    }

    /// Labels used when the user did not specify any
    pub fn default_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(LABEL_TRIAL.to_string(), self.name_any())])
    }

    /// Selector matching the trial run job
    pub fn job_selector(&self) -> LabelSelector {
        if let Some(selector) = &self.spec.selector {
            return selector.clone();
        }
        let labels = self
            .spec
            .template
            .as_ref()
            .and_then(|t| t.metadata.as_ref())
            .and_then(|m| m.labels.clone())
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| self.default_labels());
        LabelSelector {
            match_labels: Some(labels),
            ..Default::default()
        }
    }

    /// URL used to report this trial's observation, if it came from a suggestion
    pub fn report_url(&self) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(ANNOTATION_REPORT_TRIAL_URL))
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Current status, or an empty one
    pub fn status_or_default(&self) -> TrialStatus {
        self.status.clone().unwrap_or_default()
    }
}
