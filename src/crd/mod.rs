//! Custom Resource Definitions for trialops
//!
//! This module contains the Experiment and Trial CRDs and their supporting types.

mod experiment;
mod trial;
mod types;

pub use experiment::{
    Experiment, ExperimentSpec, ExperimentStatus, TrialTemplateMetadata, TrialTemplateSpec,
};
pub use trial::{Trial, TrialSpec, TrialStatus};
pub use types::{
    Assignment, Condition, ConditionStatus, ConfigMapValuesReference, HelmValue, HelmValueSource,
    HelmValuesFromSource, Metric, MetricType, Parameter, ParameterSelector, PatchOperation,
    PatchTemplate, PatchType, SetupTask, TrialConditionType, TrialValue,
};
