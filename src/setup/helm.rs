//! Helm generator configuration for chart-backed setup tasks
//!
//! The setup tools image reads a base64 encoded `HelmGenerator` document from
//! `HELM_CONFIG` and renders the chart from it.

use std::path::Path;

use base64::{engine::general_purpose::STANDARD, Engine};
use k8s_openapi::api::core::v1::{ConfigMapVolumeSource, Volume, VolumeMount};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde::Serialize;

use crate::crd::{SetupTask, Trial};
use crate::template::TemplateEngine;
use crate::{Error, Result};

const HELM_GENERATOR_API_VERSION: &str = "konjure.gramlabs.com/v1beta1";
const HELM_GENERATOR_KIND: &str = "HelmGenerator";
const HELM_VALUES_ROOT: &str = "/workspace/helm-values";

/// Environment variable carrying the encoded generator config
pub const HELM_CONFIG_ENV: &str = "HELM_CONFIG";

#[derive(Debug, Serialize, PartialEq)]
#[serde(untagged)]
enum GeneratorValue {
    Int(i64),
    String(String),
}

#[derive(Debug, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct HelmGeneratorValue {
    #[serde(skip_serializing_if = "Option::is_none")]
    file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<GeneratorValue>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    force_string: bool,
}

#[derive(Debug, Serialize)]
struct GeneratorMetadata {
    name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HelmGeneratorConfig {
    api_version: &'static str,
    kind: &'static str,
    metadata: GeneratorMetadata,
    release_name: String,
    chart: String,
    version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    repo: Option<String>,
    values: Vec<HelmGeneratorValue>,
}

/// Output of resolving a Helm task: the env value plus what the container needs mounted
#[derive(Debug, Default)]
pub struct HelmTaskConfig {
    /// Base64 encoded generator document
    pub encoded: String,
    /// Read-only mounts for config-map values files
    pub volume_mounts: Vec<VolumeMount>,
    /// Config-map volumes backing `volume_mounts`
    pub volumes: Vec<Volume>,
}

/// Build the generator config for a task, or None when the task has no chart
pub fn helm_task_config(
    task: &SetupTask,
    trial: &Trial,
    engine: &TemplateEngine,
) -> Result<Option<HelmTaskConfig>> {
    let Some(chart) = task.helm_chart.as_deref().filter(|c| !c.is_empty()) else {
        return Ok(None);
    };

    let mut out = HelmTaskConfig::default();
    let mut values = Vec::with_capacity(task.helm_values.len() + task.helm_values_from.len());

    for hv in &task.helm_values {
        let value = match (&hv.value_from, &hv.value) {
            (Some(source), _) => {
                let Some(parameter) = &source.parameter_ref else {
                    return Err(Error::configuration(format!(
                        "unknown source for Helm value '{}'",
                        hv.name
                    )));
                };
                let assignment = trial
                    .spec
                    .assignments
                    .iter()
                    .find(|a| a.name == parameter.name)
                    .ok_or_else(|| {
                        Error::configuration(format!(
                            "invalid parameter reference '{}' for Helm value '{}'",
                            parameter.name, hv.name
                        ))
                    })?;
                GeneratorValue::Int(assignment.value)
            }
            (None, Some(IntOrString::Int(i))) => GeneratorValue::Int(i64::from(*i)),
            (None, Some(IntOrString::String(s))) => {
                GeneratorValue::String(engine.render_helm_value(s, trial)?)
            }
            (None, None) => {
                return Err(Error::configuration(format!(
                    "unknown source for Helm value '{}'",
                    hv.name
                )));
            }
        };
        values.push(HelmGeneratorValue {
            name: Some(hv.name.clone()),
            value: Some(value),
            force_string: hv.force_string,
            ..Default::default()
        });
    }

    for source in &task.helm_values_from {
        let Some(cm) = &source.config_map else {
            continue;
        };
        let dir = Path::new(HELM_VALUES_ROOT).join(&cm.name);
        values.push(HelmGeneratorValue {
            file: Some(dir.join("*values.yaml").to_string_lossy().into_owned()),
            ..Default::default()
        });
        out.volume_mounts.push(VolumeMount {
            name: cm.name.clone(),
            mount_path: dir.to_string_lossy().into_owned(),
            read_only: Some(true),
            ..Default::default()
        });
        out.volumes.push(Volume {
            name: cm.name.clone(),
            config_map: Some(ConfigMapVolumeSource {
                name: cm.name.clone(),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    let config = HelmGeneratorConfig {
        api_version: HELM_GENERATOR_API_VERSION,
        kind: HELM_GENERATOR_KIND,
        metadata: GeneratorMetadata {
            name: task.name.clone(),
        },
        release_name: task.name.clone(),
        chart: chart.to_string(),
        version: task.helm_chart_version.clone().unwrap_or_default(),
        repo: task.helm_repository.clone().filter(|r| !r.is_empty()),
        values,
    };
    out.encoded = STANDARD.encode(serde_yaml::to_string(&config)?);
    Ok(Some(out))
}
