//! Condition store helpers
//!
//! Conditions are the durable state the reconcilers read and write. For the
//! setup categories the tri-state status is load-bearing:
//!
//! - absent: no setup of this kind is needed
//! - `Unknown`: needed, but no job has been observed for it yet
//! - `False`: a job was observed and has not completed
//! - `True`: the job completed
//!
//! `last_probe_time` moves on every evaluation. `last_transition_time` moves
//! only when the status changes, and during a setup pass it is copied from
//! the probe time so that [`needs_update`] can detect changes made in the
//! current pass.

use chrono::{DateTime, Duration, Utc};

use crate::crd::{Condition, ConditionStatus, SetupTask, Trial, TrialConditionType};

/// Find the condition of the given type
pub fn find_condition<'a>(
    conditions: &'a [Condition],
    type_: TrialConditionType,
) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_.as_str())
}

fn find_condition_mut(
    conditions: &mut [Condition],
    type_: TrialConditionType,
) -> Option<&mut Condition> {
    conditions.iter_mut().find(|c| c.type_ == type_.as_str())
}

/// Status of the condition of the given type, if present
pub fn condition_status(
    conditions: &[Condition],
    type_: TrialConditionType,
) -> Option<ConditionStatus> {
    find_condition(conditions, type_).map(|c| c.status)
}

/// Probe the setup conditions against the current task list
///
/// Returns false (leaving `conditions` untouched) when no task needs a create
/// or delete action. Otherwise existing setup conditions have their probe time
/// refreshed, missing ones are appended as `Unknown`, and true is returned.
pub fn probe_conditions(
    conditions: &mut Vec<Condition>,
    tasks: &[SetupTask],
    now: DateTime<Utc>,
) -> bool {
    let mut needs_create = tasks.iter().any(|t| !t.skip_create);
    let mut needs_delete = tasks.iter().any(|t| !t.skip_delete);
    if !needs_create && !needs_delete {
        return false;
    }

    for c in conditions.iter_mut() {
        if c.type_ == TrialConditionType::SetupCreated.as_str() {
            c.last_probe_time = now;
            needs_create = false;
        } else if c.type_ == TrialConditionType::SetupDeleted.as_str() {
            c.last_probe_time = now;
            needs_delete = false;
        }
    }

    if needs_create {
        conditions.push(Condition::new(
            TrialConditionType::SetupCreated.as_str(),
            ConditionStatus::Unknown,
            "",
            "",
            now,
        ));
    }
    if needs_delete {
        conditions.push(Condition::new(
            TrialConditionType::SetupDeleted.as_str(),
            ConditionStatus::Unknown,
            "",
            "",
            now,
        ));
    }
    true
}

/// Change the status of an existing condition
///
/// The transition time is copied from the condition's probe time, so the
/// probe must have happened earlier in the same pass. Missing conditions are
/// left alone: only the probe step creates them.
pub fn set_condition(
    conditions: &mut [Condition],
    type_: TrialConditionType,
    status: ConditionStatus,
) {
    if let Some(c) = find_condition_mut(conditions, type_) {
        if c.status != status {
            c.status = status;
            c.last_transition_time = c.last_probe_time;
        }
    }
}

/// True if any condition transitioned at `probe_time`
pub fn needs_update(conditions: &[Condition], probe_time: DateTime<Utc>) -> bool {
    conditions
        .iter()
        .any(|c| c.last_transition_time == probe_time)
}

/// Create or update a condition
///
/// The probe time is always refreshed. The transition time changes only when
/// the status does (or the condition is new).
pub fn apply_condition(
    conditions: &mut Vec<Condition>,
    type_: TrialConditionType,
    status: ConditionStatus,
    reason: &str,
    message: &str,
    now: DateTime<Utc>,
) {
    match find_condition_mut(conditions, type_) {
        Some(c) => {
            if c.status != status {
                c.status = status;
                c.last_transition_time = now;
            }
            c.reason = reason.to_string();
            c.message = message.to_string();
            c.last_probe_time = now;
        }
        None => conditions.push(Condition::new(
            type_.as_str(),
            status,
            reason,
            message,
            now,
        )),
    }
}

/// Compare a condition against an expected status
///
/// `None` when the condition is absent, otherwise whether it matches.
pub fn check_condition(
    conditions: &[Condition],
    type_: TrialConditionType,
    status: ConditionStatus,
) -> Option<bool> {
    condition_status(conditions, type_).map(|s| s == status)
}

/// True once the trial completed or failed
pub fn is_finished(conditions: &[Condition]) -> bool {
    check_condition(conditions, TrialConditionType::Complete, ConditionStatus::True)
        == Some(true)
        || is_failed(conditions)
}

/// True if the trial failed
pub fn is_failed(conditions: &[Condition]) -> bool {
    check_condition(conditions, TrialConditionType::Failed, ConditionStatus::True) == Some(true)
}

fn trial_conditions(trial: &Trial) -> &[Condition] {
    trial
        .status
        .as_ref()
        .map(|s| s.conditions.as_slice())
        .unwrap_or_default()
}

/// True if the trial still occupies a slot
///
/// A trial is active until it finishes, and a finished trial stays active
/// while its delete-mode setup has not completed.
pub fn is_active(trial: &Trial) -> bool {
    let conditions = trial_conditions(trial);
    if !is_finished(conditions) {
        return true;
    }
    matches!(
        check_condition(conditions, TrialConditionType::SetupDeleted, ConditionStatus::True),
        Some(false)
    )
}

/// True once a finished trial has outlived its TTL
pub fn needs_cleanup(trial: &Trial, now: DateTime<Utc>) -> bool {
    let Some(ttl) = trial.spec.ttl_seconds_after_finished else {
        return false;
    };
    let Some(status) = &trial.status else {
        return false;
    };
    if !is_finished(&status.conditions) {
        return false;
    }
    let finished_at = status.completion_time.or_else(|| {
        status
            .conditions
            .iter()
            .filter(|c| {
                (c.type_ == TrialConditionType::Complete.as_str()
                    || c.type_ == TrialConditionType::Failed.as_str())
                    && c.status == ConditionStatus::True
            })
            .map(|c| c.last_transition_time)
            .max()
    });
    finished_at.is_some_and(|t| t + Duration::seconds(i64::from(ttl)) <= now)
}

// =============================================================================
// Trial summaries
// =============================================================================

const SUMMARY_CREATED: &str = "Created";
const SUMMARY_SETUP_CREATED: &str = "Setup Created";
const SUMMARY_SETTING_UP: &str = "Setting up";
const SUMMARY_SETUP_DELETED: &str = "Setup Deleted";
const SUMMARY_TEARING_DOWN: &str = "Tearing Down";
const SUMMARY_PATCHED: &str = "Patched";
const SUMMARY_PATCHING: &str = "Patching";
const SUMMARY_RUNNING: &str = "Running";
const SUMMARY_STABILIZED: &str = "Stabilized";
const SUMMARY_WAITING: &str = "Waiting";
const SUMMARY_CAPTURED: &str = "Captured";
const SUMMARY_CAPTURING: &str = "Capturing";
const SUMMARY_COMPLETED: &str = "Completed";
const SUMMARY_FAILED: &str = "Failed";

/// One word summary of the trial lifecycle, driven by condition order
pub fn trial_phase(trial: &Trial) -> &'static str {
    let Some(status) = &trial.status else {
        return SUMMARY_CREATED;
    };
    let mut summary = SUMMARY_CREATED;
    for c in &status.conditions {
        summary = match (c.type_.as_str(), c.status) {
            ("Complete", ConditionStatus::True) => return SUMMARY_COMPLETED,
            ("Failed", ConditionStatus::True) => return SUMMARY_FAILED,
            ("SetupCreated", ConditionStatus::True) => SUMMARY_SETUP_CREATED,
            ("SetupCreated", _) => SUMMARY_SETTING_UP,
            ("SetupDeleted", ConditionStatus::True) => SUMMARY_SETUP_DELETED,
            ("SetupDeleted", ConditionStatus::False) => SUMMARY_TEARING_DOWN,
            ("Patched", ConditionStatus::True) => SUMMARY_PATCHED,
            ("Patched", _) => SUMMARY_PATCHING,
            ("Stable", ConditionStatus::True) if status.start_time.is_some() => SUMMARY_RUNNING,
            ("Stable", ConditionStatus::True) => SUMMARY_STABILIZED,
            ("Stable", _) => SUMMARY_WAITING,
            ("Observed", ConditionStatus::True) => SUMMARY_CAPTURED,
            ("Observed", _) => SUMMARY_CAPTURING,
            _ => summary,
        };
    }
    summary
}

/// Assignments rendered as `name=value` pairs
pub fn assignments_summary(trial: &Trial) -> String {
    trial
        .spec
        .assignments
        .iter()
        .map(|a| format!("{}={}", a.name, a.value))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Collected values rendered as `name=value` pairs
pub fn values_summary(trial: &Trial) -> String {
    trial
        .status
        .as_ref()
        .map(|s| {
            s.values
                .iter()
                .filter(|v| v.attempts_remaining == 0)
                .map(|v| format!("{}={}", v.name, v.value))
                .collect::<Vec<_>>()
                .join(", ")
        })
        .unwrap_or_default()
}

/// Refresh the display fields of the trial status, returning true if any changed
pub fn update_summary(trial: &mut Trial) -> bool {
    let phase = trial_phase(trial).to_string();
    let assignments = assignments_summary(trial);
    let values = values_summary(trial);
    let status = trial.status.get_or_insert_with(Default::default);

    let mut dirty = false;
    if status.phase != phase {
        status.phase = phase;
        dirty = true;
    }
    if status.assignments_summary != assignments {
        status.assignments_summary = assignments;
        dirty = true;
    }
    if status.values_summary != values {
        status.values_summary = values;
        dirty = true;
    }
    dirty
}
