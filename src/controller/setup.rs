//! Setup pass of the trial reconciler
//!
//! Runs before anything else in a trial pass. It observes the trial's setup
//! jobs, records their progress on the SetupCreated and SetupDeleted
//! conditions, creates the next job when one is due and manages the
//! finalizer that keeps a deleted trial around until its teardown ran.

use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::Job;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use super::trial::{persist, TrialContext};
use crate::conditions::{
    apply_condition, check_condition, is_finished, needs_update, probe_conditions,
    set_condition,
};
use crate::crd::{ConditionStatus, Trial, TrialConditionType};
use crate::kube_utils::{has_finalizer, label_selector_string};
use crate::setup::{
    failed_container_message, find_setup_job_condition_type, is_setup_job_complete,
    is_setup_job_failed, new_setup_job, stuck_pending_message, SetupMode,
};
use crate::{Result, LABEL_TRIAL, LABEL_TRIAL_ROLE, ROLE_TRIAL_SETUP, SETUP_FINALIZER};

/// Drive the setup lifecycle of a trial
///
/// Returns the action to take when this pass changed something (or must
/// wait), None when the trial may move on to its next stage.
pub(super) async fn reconcile_setup(
    trial: &mut Trial,
    ctx: &TrialContext,
    now: DateTime<Utc>,
) -> Result<Option<Action>> {
    let tasks = trial.spec.setup_tasks.clone();
    let status = trial.status.get_or_insert_with(Default::default);
    if !probe_conditions(&mut status.conditions, &tasks, now) {
        return Ok(None);
    }

    observe_setup_jobs(trial, ctx, now).await?;

    let conditions = trial.status_or_default().conditions;
    if needs_update(&conditions, now) {
        return persist(trial, ctx).await.map(Some);
    }

    let finished = is_finished(&conditions);
    let deleting = trial.metadata.deletion_timestamp.is_some();
    let created = check_condition(
        &conditions,
        TrialConditionType::SetupCreated,
        ConditionStatus::Unknown,
    );
    let deleted = check_condition(
        &conditions,
        TrialConditionType::SetupDeleted,
        ConditionStatus::Unknown,
    );

    // The finalizer exists before the first setup job does
    let mut mode = None;
    if created == Some(true) {
        if deleted.is_some() && !has_finalizer(trial, SETUP_FINALIZER) {
            return add_setup_finalizer(trial, ctx).await.map(Some);
        }
        mode = Some(SetupMode::Create);
    }
    if deleted == Some(true) {
        if !has_finalizer(trial, SETUP_FINALIZER) {
            return add_setup_finalizer(trial, ctx).await.map(Some);
        }
        if finished || deleting {
            mode = Some(SetupMode::Delete);
        }
    }

    if let Some(mode) = mode {
        let job = new_setup_job(trial, mode, &ctx.config, &ctx.templates)?;
        info!(job = %job.name_any(), mode = %mode, "creating setup job");
        ctx.kube.create_job(&job).await?;
        return Ok(Some(Action::await_change()));
    }

    // The create job is running; nothing else may start until it is done
    let creating = check_condition(
        &conditions,
        TrialConditionType::SetupCreated,
        ConditionStatus::False,
    ) == Some(true);
    if creating && !finished && !deleting {
        return Ok(Some(Action::requeue(ctx.config.setup_poll_interval)));
    }

    let torn_down = check_condition(
        &conditions,
        TrialConditionType::SetupDeleted,
        ConditionStatus::True,
    ) == Some(true);
    if torn_down && has_finalizer(trial, SETUP_FINALIZER) {
        let finalizers = trial
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != SETUP_FINALIZER)
            .cloned()
            .collect();
        info!("removing setup finalizer");
        ctx.kube.set_finalizers(trial, finalizers).await?;
        return Ok(Some(Action::await_change()));
    }

    Ok(None)
}

async fn add_setup_finalizer(trial: &Trial, ctx: &TrialContext) -> Result<Action> {
    let mut finalizers = trial.finalizers().to_vec();
    finalizers.push(SETUP_FINALIZER.to_string());
    info!("adding setup finalizer");
    ctx.kube.set_finalizers(trial, finalizers).await?;
    Ok(Action::await_change())
}

/// Fold the state of existing setup jobs into the trial conditions
async fn observe_setup_jobs(
    trial: &mut Trial,
    ctx: &TrialContext,
    now: DateTime<Utc>,
) -> Result<()> {
    let namespace = trial.namespace().unwrap_or_default();
    let selector = format!(
        "{}={},{}={}",
        LABEL_TRIAL,
        trial.name_any(),
        LABEL_TRIAL_ROLE,
        ROLE_TRIAL_SETUP
    );
    let jobs = ctx.kube.list_jobs(&namespace, &selector).await?;

    for job in &jobs {
        let type_ = find_setup_job_condition_type(job)?;
        let failure = match is_setup_job_failed(job) {
            Some(message) => Some(message),
            None => failed_pod_message(job, &namespace, ctx)
                .await?
                .or_else(|| stuck_pending_message(job, now, ctx.config.setup_startup_timeout)),
        };

        let status = trial.status.get_or_insert_with(Default::default);
        let job_status = if failure.is_some() {
            ConditionStatus::True
        } else {
            is_setup_job_complete(job)
        };
        debug!(
            job = %job.name_any(),
            condition = %type_,
            status = %job_status,
            "observed setup job"
        );
        set_condition(&mut status.conditions, type_, job_status);

        if let Some(message) = failure {
            if !is_finished(&status.conditions) {
                warn!(job = %job.name_any(), error = %message, "setup job failed");
                apply_condition(
                    &mut status.conditions,
                    TrialConditionType::Failed,
                    ConditionStatus::True,
                    "SetupJobFailed",
                    &message,
                    now,
                );
            }
        }
    }
    Ok(())
}

async fn failed_pod_message(
    job: &Job,
    namespace: &str,
    ctx: &TrialContext,
) -> Result<Option<String>> {
    let Some(selector) = job.spec.as_ref().and_then(|s| s.selector.as_ref()) else {
        return Ok(None);
    };
    let pods = ctx
        .kube
        .list_pods(namespace, &label_selector_string(selector)?)
        .await?;
    Ok(failed_container_message(&pods).map(str::to_string))
}
