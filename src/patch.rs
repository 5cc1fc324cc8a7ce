//! Patch rendering and target resolution
//!
//! Experiment patch templates are rendered once per trial into patch
//! operations stored on the trial status. Each operation names exactly one
//! target object; templates that select targets by label expand into one
//! operation per match when the reconciler resolves them.

use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::Patch;
use kube::ResourceExt;
use tracing::warn;

use crate::crd::{Experiment, PatchOperation, PatchTemplate, PatchType, Trial};
use crate::template::TemplateEngine;
use crate::{Error, Result};

/// Attempts allowed for each patch before the trial fails
pub const PATCH_ATTEMPTS: i32 = 3;

/// Verify the trial assigns every experiment parameter
///
/// Out of bounds assignments are logged but accepted.
pub fn check_assignments(trial: &Trial, experiment: &Experiment) -> Result<()> {
    let mut missing = Vec::new();
    for p in &experiment.spec.parameters {
        match trial.spec.assignments.iter().find(|a| a.name == p.name) {
            Some(a) if a.value < p.min || a.value > p.max => {
                warn!(
                    trial = %trial.name_any(),
                    parameter = %p.name,
                    assignment = a.value,
                    min = p.min,
                    max = p.max,
                    "assignment out of bounds"
                );
            }
            Some(_) => {}
            None => missing.push(p.name.as_str()),
        }
    }

    if missing.is_empty() {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "trial {} is missing assignments for {}",
            trial.name_any(),
            missing.join(", ")
        )))
    }
}

/// Where a rendered patch should be applied
#[derive(Clone, Debug, PartialEq)]
pub enum PatchTarget {
    /// A single named object
    Object(ObjectReference),
    /// Every object of the referenced kind matching the selector
    Selector {
        /// apiVersion, kind and namespace of the candidates
        reference: ObjectReference,
        /// Label selector the candidates must match
        selector: LabelSelector,
    },
}

/// A patch template rendered against one trial
#[derive(Clone, Debug, PartialEq)]
pub struct RenderedPatch {
    /// Patch type
    pub patch_type: PatchType,
    /// Rendered JSON document, None when the template rendered to nothing
    pub data: Option<String>,
    /// Where to apply it
    pub target: PatchTarget,
}

/// Render every experiment patch template for a trial
pub fn render_patches(
    experiment: &Experiment,
    trial: &Trial,
    engine: &TemplateEngine,
) -> Result<Vec<RenderedPatch>> {
    experiment
        .spec
        .patches
        .iter()
        .map(|template| {
            let data = engine.render_patch(&template.patch, trial)?;
            let target = patch_target(template, data.as_deref(), trial)?;
            Ok(RenderedPatch {
                patch_type: template.type_,
                data,
                target,
            })
        })
        .collect()
}

fn patch_target(
    template: &PatchTemplate,
    data: Option<&str>,
    trial: &Trial,
) -> Result<PatchTarget> {
    let mut reference = match &template.target_ref {
        Some(r) => r.clone(),
        // Strategic merge patches may name their own target
        None if template.type_ == PatchType::Strategic => data
            .and_then(|d| serde_json::from_str::<serde_json::Value>(d).ok())
            .map(|doc| ObjectReference {
                api_version: doc["apiVersion"].as_str().map(str::to_string),
                kind: doc["kind"].as_str().map(str::to_string),
                name: doc["metadata"]["name"].as_str().map(str::to_string),
                namespace: doc["metadata"]["namespace"].as_str().map(str::to_string),
                ..Default::default()
            })
            .unwrap_or_default(),
        None => ObjectReference::default(),
    };

    if reference.namespace.as_deref().unwrap_or_default().is_empty() {
        reference.namespace = Some(trial.target_namespace());
    }
    if reference.kind.as_deref().unwrap_or_default().is_empty() {
        return Err(Error::validation("invalid patch reference: missing kind"));
    }

    if reference.name.as_deref().unwrap_or_default().is_empty() {
        return match &template.selector {
            Some(selector) => Ok(PatchTarget::Selector {
                reference,
                selector: selector.clone(),
            }),
            None => Err(Error::validation(
                "invalid patch reference: missing name or selector",
            )),
        };
    }
    Ok(PatchTarget::Object(reference))
}

/// Build the stored operation for one target
///
/// Patches that rendered to nothing start with zero attempts so they are never
/// applied.
pub fn new_patch_operation(
    target_ref: ObjectReference,
    patch_type: PatchType,
    data: Option<String>,
) -> PatchOperation {
    let attempts_remaining = if data.is_some() { PATCH_ATTEMPTS } else { 0 };
    PatchOperation {
        target_ref,
        patch_type,
        data: data.unwrap_or_default(),
        attempts_remaining,
        wait: true,
    }
}

/// Convert a stored operation into a kube patch
pub fn to_kube_patch(op: &PatchOperation) -> Result<Patch<serde_json::Value>> {
    Ok(match op.patch_type {
        PatchType::Strategic => Patch::Strategic(serde_json::from_str(&op.data)?),
        PatchType::Merge => Patch::Merge(serde_json::from_str(&op.data)?),
        PatchType::Json => Patch::Json(serde_json::from_str::<json_patch::Patch>(&op.data)?),
    })
}
