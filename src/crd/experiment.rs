//! Experiment Custom Resource Definition
//!
//! An Experiment describes a search space (parameters), the outcomes to
//! optimize (metrics), how to put the cluster into a candidate state
//! (patches) and a template for the Trials that evaluate each candidate.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::{CustomResource, Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::trial::TrialSpec;
use super::types::{Condition, Metric, Parameter, PatchTemplate};
use crate::LABEL_EXPERIMENT;

/// Specification for an Experiment
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "trialops.dev",
    version = "v1alpha1",
    kind = "Experiment",
    plural = "experiments",
    shortname = "exp",
    status = "ExperimentStatus",
    namespaced,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Active","type":"integer","jsonPath":".status.activeTrials"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentSpec {
    /// Number of trials to run concurrently on this cluster, defaults to 1
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Total expected replicas across all clusters, defaults to the replica count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<i32>,

    /// Number of random suggestions at the start of the experiment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burn_in: Option<i32>,

    /// Maximum number of trials across all clusters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<i32>,

    /// Search space
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Parameter>,

    /// Outcomes to optimize
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metrics: Vec<Metric>,

    /// Patch templates that put the cluster into a candidate state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patches: Vec<PatchTemplate>,

    /// Namespaces trials may run in; only one trial runs per namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<LabelSelector>,

    /// Locates the trials belonging to this experiment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,

    /// Template for new trials
    #[serde(default)]
    pub template: TrialTemplateSpec,
}

/// Metadata carried over from the template onto each new trial
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrialTemplateMetadata {
    /// Fixed trial name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Prefix for generated trial names
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generate_name: Option<String>,

    /// Namespace to create trials in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Trial labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Trial annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Template used to create new trials
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct TrialTemplateSpec {
    /// Trial metadata
    #[serde(default)]
    pub metadata: TrialTemplateMetadata,

    /// Trial spec
    #[serde(default)]
    pub spec: TrialSpec,
}

/// Status for an Experiment
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentStatus {
    /// One word summary of the experiment state
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub phase: String,

    /// Number of trials currently occupying a slot
    #[serde(default)]
    pub active_trials: i32,

    /// Conditions representing the experiment state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl Experiment {
    /// Effective number of concurrent trials on this cluster
    ///
    /// Zero once the experiment is being deleted, otherwise the explicit
    /// replica count or 1.
    pub fn replicas(&self) -> i32 {
        if self.metadata.deletion_timestamp.is_some() {
            return 0;
        }
        self.spec.replicas.unwrap_or(1)
    }

    /// Set the replica count, clamping negative values to zero
    pub fn set_replicas(&mut self, replicas: i32) {
        self.spec.replicas = Some(replicas.max(0));
    }

    /// Labels used when the user did not specify any
    pub fn default_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(LABEL_EXPERIMENT.to_string(), self.name_any())])
    }

    /// Label selector matching the trials of this experiment
    pub fn trial_selector(&self) -> LabelSelector {
        if let Some(selector) = &self.spec.selector {
            return selector.clone();
        }
        let labels = if self.spec.template.metadata.labels.is_empty() {
            self.default_labels()
        } else {
            self.spec.template.metadata.labels.clone()
        };
        LabelSelector {
            match_labels: Some(labels),
            ..Default::default()
        }
    }

    /// Object reference pointing back at this experiment
    pub fn self_reference(&self) -> ObjectReference {
        ObjectReference {
            api_version: Some(Self::api_version(&()).to_string()),
            kind: Some(Self::kind(&()).to_string()),
            name: Some(self.name_any()),
            namespace: self.namespace(),
            uid: self.metadata.uid.clone(),
            ..Default::default()
        }
    }

    /// Read an annotation, treating empty values as absent
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Set an annotation
    pub fn set_annotation(&mut self, key: &str, value: impl Into<String>) {
        self.annotations_mut().insert(key.to_string(), value.into());
    }

    /// Remove an annotation, returning true if it was present
    pub fn remove_annotation(&mut self, key: &str) -> bool {
        self.metadata
            .annotations
            .as_mut()
            .is_some_and(|a| a.remove(key).is_some())
    }
}
