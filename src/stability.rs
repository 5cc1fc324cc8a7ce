//! Rollout checks for patched workloads
//!
//! After a patch is applied the trial waits for the target to settle before
//! starting the trial run. The checks mirror `kubectl rollout status` for
//! Deployments, StatefulSets and DaemonSets, and fall back to inspecting the
//! workload's pods when the rollout is still in progress.

use std::time::Duration;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use thiserror::Error;

/// Delay before re-checking a workload that is still rolling out
pub const STABILITY_RETRY: Duration = Duration::from_secs(5);

const REASON_UPDATE_STRATEGY: &str = "UpdateStrategy";

/// A workload that has not reached a stable state
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StabilityError {
    /// Still settling; check again after `retry_after`
    #[error("{kind}/{name} is not ready: {reason}")]
    NotReady {
        /// Target kind
        kind: String,
        /// Target name
        name: String,
        /// Short machine-readable reason
        reason: String,
        /// Minimum delay before the next check
        retry_after: Duration,
    },
    /// Will never settle without intervention
    #[error("{kind} stability error for {name}: {reason}")]
    Failed {
        /// Target kind
        kind: String,
        /// Target name
        name: String,
        /// Short machine-readable reason
        reason: String,
    },
}

impl StabilityError {
    /// Delay to wait before checking again, None for permanent failures
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::NotReady { retry_after, .. } => Some(*retry_after),
            Self::Failed { .. } => None,
        }
    }
}

/// Outcome of one check before it is bound to a target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instability {
    /// Short machine-readable reason
    pub reason: String,
    /// Set when the problem is expected to resolve on its own
    pub retry_after: Option<Duration>,
}

impl Instability {
    fn waiting(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retry_after: Some(STABILITY_RETRY),
        }
    }

    fn permanent(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retry_after: None,
        }
    }

    /// Whether the workload's pods should be inspected for a better answer
    pub fn needs_pod_check(&self) -> bool {
        self.retry_after.is_some() || self.reason == REASON_UPDATE_STRATEGY
    }

    fn into_error(self, kind: &str, name: &str) -> StabilityError {
        match self.retry_after {
            Some(retry_after) => StabilityError::NotReady {
                kind: kind.to_string(),
                name: name.to_string(),
                reason: self.reason,
                retry_after,
            },
            None => StabilityError::Failed {
                kind: kind.to_string(),
                name: name.to_string(),
                reason: self.reason,
            },
        }
    }
}

/// A patch target whose rollout can be checked
#[derive(Debug, Clone)]
pub enum Workload {
    /// apps/v1 Deployment
    Deployment(Box<Deployment>),
    /// apps/v1 StatefulSet
    StatefulSet(Box<StatefulSet>),
    /// apps/v1 DaemonSet
    DaemonSet(Box<DaemonSet>),
}

impl Workload {
    /// Whether `kind` has a rollout check; other kinds are considered stable
    pub fn is_checked_kind(kind: &str) -> bool {
        matches!(kind, "Deployment" | "StatefulSet" | "DaemonSet")
    }

    /// Pod selector of the workload
    pub fn selector(&self) -> Option<&LabelSelector> {
        match self {
            Self::Deployment(d) => d.spec.as_ref().map(|s| &s.selector),
            Self::StatefulSet(s) => s.spec.as_ref().map(|s| &s.selector),
            Self::DaemonSet(d) => d.spec.as_ref().map(|s| &s.selector),
        }
    }

    /// Check the rollout status of the workload itself
    pub fn check(&self) -> Result<(), Instability> {
        match self {
            Self::Deployment(d) => check_deployment(d),
            Self::StatefulSet(s) => check_stateful_set(s),
            Self::DaemonSet(d) => check_daemon_set(d),
        }
    }
}

/// Combine a workload check with the state of its pods
///
/// A pod level problem replaces the workload level reason since it is more
/// specific. Unsupported update strategies are accepted as stable.
pub fn settle(
    kind: &str,
    name: &str,
    workload: Result<(), Instability>,
    pods: Option<&[Pod]>,
) -> Result<(), StabilityError> {
    let Err(mut instability) = workload else {
        return Ok(());
    };
    if let Some(pods) = pods {
        if let Err(pod_instability) = check_pods(pods) {
            instability = pod_instability;
        }
    }
    if instability.reason == REASON_UPDATE_STRATEGY {
        return Ok(());
    }
    Err(instability.into_error(kind, name))
}

fn check_deployment(d: &Deployment) -> Result<(), Instability> {
    let generation = d.metadata.generation.unwrap_or(0);
    let spec_replicas = d.spec.as_ref().and_then(|s| s.replicas);
    let status = d.status.clone().unwrap_or_default();

    if generation > status.observed_generation.unwrap_or(0) {
        return Err(Instability::waiting("ObservedGeneration"));
    }
    let deadline_exceeded = status.conditions.iter().flatten().any(|c| {
        c.type_ == "Progressing" && c.reason.as_deref() == Some("ProgressDeadlineExceeded")
    });
    if deadline_exceeded {
        return Err(Instability::permanent("ProgressDeadlineExceeded"));
    }
    let updated = status.updated_replicas.unwrap_or(0);
    if spec_replicas.is_some_and(|r| updated < r) {
        return Err(Instability::waiting("UpdatedReplicas"));
    }
    if status.replicas.unwrap_or(0) > updated {
        return Err(Instability::waiting("Replicas"));
    }
    if status.available_replicas.unwrap_or(0) < updated {
        return Err(Instability::waiting("AvailableReplicas"));
    }
    Ok(())
}

fn check_daemon_set(d: &DaemonSet) -> Result<(), Instability> {
    let strategy = d
        .spec
        .as_ref()
        .and_then(|s| s.update_strategy.as_ref())
        .and_then(|u| u.type_.as_deref())
        .unwrap_or("RollingUpdate");
    if strategy != "RollingUpdate" {
        return Err(Instability::permanent(REASON_UPDATE_STRATEGY));
    }

    let status = d.status.clone().unwrap_or_default();
    if d.metadata.generation.unwrap_or(0) > status.observed_generation.unwrap_or(0) {
        return Err(Instability::waiting("ObservedGeneration"));
    }
    if status.updated_number_scheduled.unwrap_or(0) < status.desired_number_scheduled {
        return Err(Instability::waiting("NumberScheduled"));
    }
    if status.number_available.unwrap_or(0) < status.desired_number_scheduled {
        return Err(Instability::waiting("NumberAvailable"));
    }
    Ok(())
}

fn check_stateful_set(s: &StatefulSet) -> Result<(), Instability> {
    let spec = s.spec.clone().unwrap_or_default();
    let update = spec.update_strategy.unwrap_or_default();
    if update.type_.as_deref().unwrap_or("RollingUpdate") != "RollingUpdate" {
        return Err(Instability::permanent(REASON_UPDATE_STRATEGY));
    }

    let status = s.status.clone().unwrap_or_default();
    let observed = status.observed_generation.unwrap_or(0);
    if observed == 0 || s.metadata.generation.unwrap_or(0) > observed {
        return Err(Instability::waiting("ObservedGeneration"));
    }
    if spec
        .replicas
        .is_some_and(|r| status.ready_replicas.unwrap_or(0) < r)
    {
        return Err(Instability::waiting("ReadyReplicas"));
    }
    if let Some(rolling) = update.rolling_update {
        if let (Some(replicas), Some(partition)) = (spec.replicas, rolling.partition) {
            if status.updated_replicas.unwrap_or(0) < replicas - partition {
                return Err(Instability::waiting("UpdatedReplicas"));
            }
        }
        return Ok(());
    }
    if status.update_revision != status.current_revision {
        return Err(Instability::waiting("CurrentRevision"));
    }
    Ok(())
}

/// Check the pods backing a workload
///
/// Unschedulable pods and crash looping containers never recover on their
/// own; a pod that is merely not ready yet is worth waiting for.
pub fn check_pods(pods: &[Pod]) -> Result<(), Instability> {
    for pod in pods {
        let Some(status) = &pod.status else {
            continue;
        };
        let conditions = status.conditions.as_deref().unwrap_or_default();

        if let Some(c) = conditions.iter().find(|c| {
            c.type_ == "PodScheduled"
                && c.status == "False"
                && c.reason.as_deref() == Some("Unschedulable")
        }) {
            return Err(Instability::permanent(c.reason.clone().unwrap_or_default()));
        }
        check_container_statuses(status.init_container_statuses.as_deref())?;
        check_container_statuses(status.container_statuses.as_deref())?;
        if let Some(c) = conditions
            .iter()
            .find(|c| c.type_ == "Ready" && c.status == "False")
        {
            return Err(Instability::waiting(c.reason.clone().unwrap_or_default()));
        }
    }
    Ok(())
}

fn check_container_statuses(statuses: Option<&[ContainerStatus]>) -> Result<(), Instability> {
    for cs in statuses.unwrap_or_default() {
        let waiting_reason = cs
            .state
            .as_ref()
            .and_then(|s| s.waiting.as_ref())
            .and_then(|w| w.reason.as_deref());
        if !cs.ready && cs.restart_count > 0 && waiting_reason == Some("CrashLoopBackOff") {
            return Err(Instability::permanent("CrashLoopBackOff"));
        }
    }
    Ok(())
}
