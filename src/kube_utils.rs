//! Small Kubernetes helpers shared by the reconcilers
//!
//! Patch targets are arbitrary objects referenced by apiVersion and kind, so
//! they are reached through `DynamicObject` with an `ApiResource` built here.
//! Label selectors from the CRDs are rendered to the string form list calls
//! expect.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference};
use kube::discovery::ApiResource;
use kube::{Resource, ResourceExt};

use crate::{Error, Result};

/// Build an ApiResource from an apiVersion and kind
///
/// The version is used exactly as given.
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Parse apiVersion into (group, version)
///
/// The core group has no prefix, so `v1` yields an empty group.
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

// Kinds commonly targeted by patches whose plural is irregular
const KIND_PLURALS: &[(&str, &str)] = &[
    ("endpoints", "endpoints"),
    ("ingress", "ingresses"),
    ("networkpolicy", "networkpolicies"),
    ("podsecuritypolicy", "podsecuritypolicies"),
    ("horizontalpodautoscaler", "horizontalpodautoscalers"),
];

/// Pluralize a Kubernetes resource kind
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if let Some((_, plural)) = KIND_PLURALS.iter().find(|(s, _)| *s == lower) {
        return (*plural).to_string();
    }

    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{lower}es")
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{lower}s")
    }
}

/// Render a LabelSelector in the string form accepted by list calls
///
/// An empty selector renders as the empty string, which matches everything.
pub fn label_selector_string(selector: &LabelSelector) -> Result<String> {
    let mut parts: Vec<String> = selector
        .match_labels
        .iter()
        .flatten()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();

    for expr in selector.match_expressions.iter().flatten() {
        let values = expr.values.clone().unwrap_or_default();
        let part = match expr.operator.as_str() {
            "In" | "NotIn" if values.is_empty() => {
                return Err(Error::validation(format!(
                    "label selector operator {} on '{}' requires values",
                    expr.operator, expr.key
                )));
            }
            "In" => format!("{} in ({})", expr.key, values.join(",")),
            "NotIn" => format!("{} notin ({})", expr.key, values.join(",")),
            "Exists" => expr.key.clone(),
            "DoesNotExist" => format!("!{}", expr.key),
            other => {
                return Err(Error::validation(format!(
                    "unknown label selector operator '{other}'"
                )));
            }
        };
        parts.push(part);
    }

    Ok(parts.join(","))
}

/// True if the object carries the named finalizer
pub fn has_finalizer<K: ResourceExt>(obj: &K, finalizer: &str) -> bool {
    obj.finalizers().iter().any(|f| f == finalizer)
}

/// Controller owner reference pointing at `owner`
///
/// Returns None when the owner has not been persisted yet (no uid).
pub fn controller_owner_ref<K>(owner: &K) -> Option<OwnerReference>
where
    K: Resource<DynamicType = ()>,
{
    let mut reference = owner.controller_owner_ref(&())?;
    reference.block_owner_deletion = Some(true);
    Some(reference)
}
