//! Supporting types shared by the Experiment and Trial CRDs

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{ObjectReference, VolumeMount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// Conditions
// =============================================================================

/// Condition status following Kubernetes conventions
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Observable conditions of a trial
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum TrialConditionType {
    /// The trial run finished successfully
    Complete,
    /// The trial run failed
    Failed,
    /// All "create" setup tasks ran successfully
    SetupCreated,
    /// All "delete" setup tasks ran successfully
    SetupDeleted,
    /// Patches have been applied
    Patched,
    /// Patched workloads have stabilized
    Stable,
    /// Metrics have been collected
    Observed,
}

impl TrialConditionType {
    /// String form used in the condition's `type` field
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => "Complete",
            Self::Failed => "Failed",
            Self::SetupCreated => "SetupCreated",
            Self::SetupDeleted => "SetupDeleted",
            Self::Patched => "Patched",
            Self::Stable => "Stable",
            Self::Observed => "Observed",
        }
    }
}

impl std::fmt::Display for TrialConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kubernetes-style condition for status reporting
///
/// Used on both experiments and trials. `last_probe_time` moves on every
/// evaluation, `last_transition_time` only when `status` changes.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., SetupCreated, Complete)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// Last time the condition was evaluated
    pub last_probe_time: DateTime<Utc>,

    /// Last time the condition transitioned
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition probed and transitioned at `now`
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_probe_time: now,
            last_transition_time: now,
        }
    }
}

// =============================================================================
// Experiment search space and outcomes
// =============================================================================

/// Domain of a single component of the experiment search space
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Parameter {
    /// Name of the parameter
    pub name: String,
    /// Inclusive minimum value
    #[serde(default)]
    pub min: i64,
    /// Inclusive maximum value
    #[serde(default)]
    pub max: i64,
}

/// How a metric value is collected
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    /// Rendered against the trial itself, no external service involved
    #[default]
    Local,
    /// PromQL query against a matched Prometheus service
    Prometheus,
    /// Dotted JSON path evaluated against a document served by a matched service
    Jsonpath,
}

/// Observable outcome of a trial run
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Metric {
    /// Name of the metric
    pub name: String,

    /// The goal is to minimize this metric
    #[serde(default)]
    pub minimize: bool,

    /// Collection type, defaults to local
    #[serde(default, rename = "type")]
    pub type_: MetricType,

    /// Collection type specific query
    pub query: String,

    /// Query for the error (standard deviation) of the value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_query: Option<String>,

    /// URL scheme used to reach the matched service, defaults to http
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,

    /// Selects the services to collect from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,

    /// Port number or name on the matched service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<IntOrString>,

    /// URL path prefix on the matched service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

// =============================================================================
// Patches
// =============================================================================

/// Patch flavours understood by the API server
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PatchType {
    /// Strategic merge patch
    #[default]
    Strategic,
    /// JSON merge patch (RFC 7386)
    Merge,
    /// JSON patch (RFC 6902)
    Json,
}

/// A patch template written against the experiment parameters
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PatchTemplate {
    /// Patch type, defaults to strategic
    #[serde(default, rename = "type")]
    pub type_: PatchType,

    /// Template that renders to a valid patch document
    pub patch: String,

    /// Direct reference to the object to patch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_ref: Option<ObjectReference>,

    /// Selects the objects to patch when no name is given in `target_ref`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,
}

/// A rendered patch bound to one target object
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PatchOperation {
    /// Object the patch is applied to
    pub target_ref: ObjectReference,

    /// Patch type
    pub patch_type: PatchType,

    /// Rendered patch document
    pub data: String,

    /// Remaining attempts, zero once applied
    #[serde(default)]
    pub attempts_remaining: i32,

    /// Wait for the patched object to stabilize
    #[serde(default)]
    pub wait: bool,
}

// =============================================================================
// Trial assignments and values
// =============================================================================

/// A name/value pair assigning one experiment parameter
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct Assignment {
    /// Parameter name
    pub name: String,
    /// Assigned value
    pub value: i64,
}

/// An observed metric value
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrialValue {
    /// Metric name
    pub name: String,

    /// Observed float formatted as a string
    #[serde(default)]
    pub value: String,

    /// Observed standard deviation formatted as a string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Remaining attempts, zero once collected
    #[serde(default)]
    pub attempts_remaining: i32,
}

// =============================================================================
// Setup tasks
// =============================================================================

/// Selects a trial parameter assignment
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ParameterSelector {
    /// Name of the trial parameter
    pub name: String,
}

/// Source of a Helm value
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelmValueSource {
    /// Use a trial parameter assignment as the value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter_ref: Option<ParameterSelector>,
}

/// A value passed to a Helm chart
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelmValue {
    /// Name as passed to `--set`
    pub name: String,

    /// Treat the value as a string
    #[serde(default)]
    pub force_string: bool,

    /// Literal value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<IntOrString>,

    /// Value taken from another source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<HelmValueSource>,
}

/// Reference to a ConfigMap holding `*values.yaml` keys
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ConfigMapValuesReference {
    /// ConfigMap name
    pub name: String,
}

/// A source of a Helm values file
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelmValuesFromSource {
    /// ConfigMap to read values files from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map: Option<ConfigMapValuesReference>,
}

/// Cluster state applied before each trial and removed after it
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SetupTask {
    /// Unique name of the task
    pub name: String,

    /// Override the default setup image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Entrypoint override, honoured only together with `image`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,

    /// Argument override, honoured only together with `image`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Skip the task when creating
    #[serde(default)]
    pub skip_create: bool,

    /// Skip the task when deleting
    #[serde(default)]
    pub skip_delete: bool,

    /// Volume mounts for the task container
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,

    /// Helm chart to release as part of this task
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm_chart: Option<String>,

    /// Helm chart version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm_chart_version: Option<String>,

    /// Helm repository URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm_repository: Option<String>,

    /// Helm values, ignored unless `helm_chart` is set
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub helm_values: Vec<HelmValue>,

    /// Helm values files, ignored unless `helm_chart` is set
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub helm_values_from: Vec<HelmValuesFromSource>,
}

#[cfg(test)]
mod tests {
    use super::*;

    mod conditions {
        use super::*;

        #[test]
        fn test_new_condition_uses_one_timestamp() {
            let now = Utc::now();
            let c = Condition::new("SetupCreated", ConditionStatus::Unknown, "", "", now);
            assert_eq!(c.last_probe_time, now);
            assert_eq!(c.last_transition_time, now);
        }

        #[test]
        fn test_condition_status_defaults_to_unknown() {
            assert_eq!(ConditionStatus::default(), ConditionStatus::Unknown);
            assert_eq!(ConditionStatus::False.to_string(), "False");
        }

        #[test]
        fn test_condition_serializes_with_kubernetes_field_names() {
            let c = Condition::new(
                TrialConditionType::Failed.as_str(),
                ConditionStatus::True,
                "SetupJobFailed",
                "Setup job did not complete successfully",
                Utc::now(),
            );
            let json = serde_json::to_value(&c).unwrap();
            assert_eq!(json["type"], "Failed");
            assert_eq!(json["status"], "True");
            assert!(json.get("lastProbeTime").is_some());
            assert!(json.get("lastTransitionTime").is_some());
        }

        #[test]
        fn test_empty_reason_is_omitted() {
            let c = Condition::new("Patched", ConditionStatus::False, "", "", Utc::now());
            let json = serde_json::to_value(&c).unwrap();
            assert!(json.get("reason").is_none());
            assert!(json.get("message").is_none());
        }
    }

    mod setup_tasks {
        use super::*;

        /// Story: A minimal setup task only needs a name
        #[test]
        fn story_minimal_task_deserializes_with_defaults() {
            let task: SetupTask = serde_json::from_str(r#"{"name":"postgres"}"#).unwrap();
            assert_eq!(task.name, "postgres");
            assert!(!task.skip_create);
            assert!(!task.skip_delete);
            assert!(task.image.is_none());
            assert!(task.helm_values.is_empty());
        }

        #[test]
        fn test_helm_value_from_parameter_ref() {
            let v: HelmValue = serde_json::from_str(
                r#"{"name":"resources.limits.cpu","valueFrom":{"parameterRef":{"name":"cpu"}}}"#,
            )
            .unwrap();
            let source = v.value_from.unwrap().parameter_ref.unwrap();
            assert_eq!(source.name, "cpu");
        }
    }

    mod metrics {
        use super::*;

        #[test]
        fn test_metric_type_defaults_to_local() {
            let m: Metric = serde_json::from_str(r#"{"name":"cost","query":"42"}"#).unwrap();
            assert_eq!(m.type_, MetricType::Local);
            assert!(!m.minimize);
        }

        #[test]
        fn test_metric_type_is_lowercase_on_the_wire() {
            let m: Metric =
                serde_json::from_str(r#"{"name":"p95","type":"prometheus","query":"x"}"#).unwrap();
            assert_eq!(m.type_, MetricType::Prometheus);
        }
    }
}
