//! Trial controller implementation
//!
//! A trial moves through setup, patching, stabilization, the trial run job
//! and metric collection. All progress is recorded in the trial status, and
//! each reconcile pass performs at most one write before returning: the
//! resulting watch event (or an explicit requeue) drives the next step.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Container, ObjectReference, Pod, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use super::setup::reconcile_setup;
use crate::conditions::{
    apply_condition, check_condition, find_condition, is_finished, update_summary,
};
use crate::config::ControllerConfig;
use crate::crd::{
    ConditionStatus, Experiment, PatchOperation, Trial, TrialConditionType, TrialValue,
};
use crate::kube_utils::{build_api_resource, controller_owner_ref, label_selector_string};
use crate::metrics::{capture_metric, Capture, HttpMetricFetcher, MetricFetcher};
use crate::patch::{
    check_assignments, new_patch_operation, render_patches, to_kube_patch, PatchTarget,
};
use crate::stability::{settle, StabilityError, Workload};
use crate::template::TemplateEngine;
use crate::{
    Error, Result, FIELD_MANAGER, LABEL_EXPERIMENT, LABEL_TRIAL, LABEL_TRIAL_ROLE,
    ROLE_TRIAL_RUN, ROLE_TRIAL_SETUP,
};

/// Attempts allowed for each metric before the trial fails
pub const METRIC_ATTEMPTS: i32 = 3;

/// Run time of the default trial job when none is given
const DEFAULT_RUNTIME_SECONDS: i64 = 120;

/// Trait abstracting the Kubernetes operations of the trial controller
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TrialKubeClient: Send + Sync {
    /// Persist the trial status
    ///
    /// The write carries the trial's resource version, so a trial that changed
    /// since it was read fails with a conflict.
    async fn update_status(&self, trial: &Trial) -> Result<()>;

    /// Replace the finalizers of a trial
    async fn set_finalizers(&self, trial: &Trial, finalizers: Vec<String>) -> Result<()>;

    /// Get an experiment, None if it does not exist
    async fn get_experiment(&self, namespace: &str, name: &str) -> Result<Option<Experiment>>;

    /// List jobs matching a label selector
    async fn list_jobs(&self, namespace: &str, selector: &str) -> Result<Vec<Job>>;

    /// Create a job
    async fn create_job(&self, job: &Job) -> Result<()>;

    /// List pods matching a label selector
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>>;

    /// List services matching a label selector
    async fn list_services(&self, namespace: &str, selector: &str) -> Result<Vec<Service>>;

    /// Names of the objects of the referenced kind matching a label selector
    async fn list_object_names(
        &self,
        reference: &ObjectReference,
        selector: &str,
    ) -> Result<Vec<String>>;

    /// Apply a stored patch operation to its target
    async fn apply_patch(&self, op: &PatchOperation) -> Result<()>;

    /// Fetch a patch target whose rollout can be checked, None if it does not exist
    async fn get_workload(&self, reference: &ObjectReference) -> Result<Option<Workload>>;
}

/// Real Kubernetes client implementation
pub struct TrialKubeClientImpl {
    client: Client,
}

impl TrialKubeClientImpl {
    /// Create a new TrialKubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn trials(&self, trial: &Trial) -> Api<Trial> {
        Api::namespaced(self.client.clone(), &trial.namespace().unwrap_or_default())
    }

    fn dynamic(&self, reference: &ObjectReference) -> Result<Api<DynamicObject>> {
        let kind = reference.kind.as_deref().unwrap_or_default();
        let api_version = reference.api_version.as_deref().unwrap_or("v1");
        if kind.is_empty() {
            return Err(Error::validation("invalid patch reference: missing kind"));
        }
        let ar = build_api_resource(api_version, kind);
        Ok(match reference.namespace.as_deref().filter(|ns| !ns.is_empty()) {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        })
    }
}

#[async_trait]
impl TrialKubeClient for TrialKubeClientImpl {
    async fn update_status(&self, trial: &Trial) -> Result<()> {
        let status_patch = json!({
            "metadata": { "resourceVersion": trial.resource_version() },
            "status": trial.status,
        });
        self.trials(trial)
            .patch_status(
                &trial.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&status_patch),
            )
            .await?;
        Ok(())
    }

    async fn set_finalizers(&self, trial: &Trial, finalizers: Vec<String>) -> Result<()> {
        let patch = json!({
            "metadata": {
                "resourceVersion": trial.resource_version(),
                "finalizers": finalizers,
            }
        });
        self.trials(trial)
            .patch(
                &trial.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }

    async fn get_experiment(&self, namespace: &str, name: &str) -> Result<Option<Experiment>> {
        let api: Api<Experiment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_jobs(&self, namespace: &str, selector: &str) -> Result<Vec<Job>> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default().labels(selector)).await?.items)
    }

    async fn create_job(&self, job: &Job) -> Result<()> {
        let api: Api<Job> = Api::namespaced(
            self.client.clone(),
            job.metadata.namespace.as_deref().unwrap_or("default"),
        );
        api.create(&PostParams::default(), job).await?;
        Ok(())
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default().labels(selector)).await?.items)
    }

    async fn list_services(&self, namespace: &str, selector: &str) -> Result<Vec<Service>> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default().labels(selector)).await?.items)
    }

    async fn list_object_names(
        &self,
        reference: &ObjectReference,
        selector: &str,
    ) -> Result<Vec<String>> {
        let list = self
            .dynamic(reference)?
            .list(&ListParams::default().labels(selector))
            .await?;
        Ok(list.items.iter().map(|o| o.name_any()).collect())
    }

    async fn apply_patch(&self, op: &PatchOperation) -> Result<()> {
        let name = op.target_ref.name.as_deref().unwrap_or_default();
        let patch = to_kube_patch(op)?;
        self.dynamic(&op.target_ref)?
            .patch(name, &PatchParams::default(), &patch)
            .await?;
        Ok(())
    }

    async fn get_workload(&self, reference: &ObjectReference) -> Result<Option<Workload>> {
        let namespace = reference.namespace.as_deref().unwrap_or("default");
        let name = reference.name.as_deref().unwrap_or_default();
        let workload = match reference.kind.as_deref().unwrap_or_default() {
            "Deployment" => Api::<Deployment>::namespaced(self.client.clone(), namespace)
                .get_opt(name)
                .await?
                .map(|d| Workload::Deployment(Box::new(d))),
            "StatefulSet" => Api::<StatefulSet>::namespaced(self.client.clone(), namespace)
                .get_opt(name)
                .await?
                .map(|s| Workload::StatefulSet(Box::new(s))),
            "DaemonSet" => Api::<DaemonSet>::namespaced(self.client.clone(), namespace)
                .get_opt(name)
                .await?
                .map(|d| Workload::DaemonSet(Box::new(d))),
            _ => None,
        };
        Ok(workload)
    }
}

/// Controller context for the trial reconciler
pub struct TrialContext {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn TrialKubeClient>,
    /// HTTP access to metric sources
    pub metrics: Arc<dyn MetricFetcher>,
    /// Renders patches, Helm values and metric queries
    pub templates: TemplateEngine,
    /// Controller configuration
    pub config: ControllerConfig,
}

impl TrialContext {
    /// Create a builder for constructing a TrialContext
    pub fn builder(client: Client, config: ControllerConfig) -> TrialContextBuilder {
        TrialContextBuilder {
            client,
            config,
            kube: None,
            metrics: None,
        }
    }

    /// Create a context for testing with custom mock clients
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn TrialKubeClient>,
        metrics: Arc<dyn MetricFetcher>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            kube,
            metrics,
            templates: TemplateEngine::new(),
            config,
        }
    }
}

/// Builder for constructing [`TrialContext`] instances
pub struct TrialContextBuilder {
    client: Client,
    config: ControllerConfig,
    kube: Option<Arc<dyn TrialKubeClient>>,
    metrics: Option<Arc<dyn MetricFetcher>>,
}

impl TrialContextBuilder {
    /// Override the Kubernetes client (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn TrialKubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the metric fetcher (primarily for testing)
    pub fn metric_fetcher(mut self, metrics: Arc<dyn MetricFetcher>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build the TrialContext
    pub fn build(self) -> Result<TrialContext> {
        let metrics: Arc<dyn MetricFetcher> = match self.metrics {
            Some(m) => m,
            None => Arc::new(HttpMetricFetcher::new(self.config.request_timeout)?),
        };
        Ok(TrialContext {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(TrialKubeClientImpl::new(self.client.clone()))),
            metrics,
            templates: TemplateEngine::new(),
            config: self.config,
        })
    }
}

/// Reconcile a Trial resource
///
/// Conflicts from stale writes are retried immediately, and a trial that
/// disappeared mid-pass is left alone.
#[instrument(skip(trial, ctx), fields(trial = %trial.name_any()))]
pub async fn reconcile(trial: Arc<Trial>, ctx: Arc<TrialContext>) -> Result<Action> {
    let mut trial = (*trial).clone();
    match reconcile_trial(&mut trial, &ctx, Utc::now()).await {
        Err(e) if e.is_conflict() => {
            debug!("trial changed during reconcile, retrying");
            Ok(Action::requeue(Duration::ZERO))
        }
        Err(e) if e.is_not_found() => {
            debug!(error = %e, "object no longer exists");
            Ok(Action::await_change())
        }
        other => other,
    }
}

/// Error policy for the trial controller
pub fn error_policy(trial: Arc<Trial>, error: &Error, _ctx: Arc<TrialContext>) -> Action {
    error!(
        ?error,
        trial = %trial.name_any(),
        "reconciliation failed"
    );
    Action::requeue(Duration::from_secs(5))
}

async fn reconcile_trial(
    trial: &mut Trial,
    ctx: &TrialContext,
    now: DateTime<Utc>,
) -> Result<Action> {
    if let Some(action) = reconcile_setup(trial, ctx, now).await? {
        return Ok(action);
    }

    let status = trial.status_or_default();
    if is_finished(&status.conditions) || trial.metadata.deletion_timestamp.is_some() {
        if update_summary(trial) {
            ctx.kube.update_status(trial).await?;
        }
        return Ok(Action::await_change());
    }

    if let Some(action) = render_patch_operations(trial, ctx, now).await? {
        return Ok(action);
    }
    if let Some(action) = apply_next_patch(trial, ctx, now).await? {
        return Ok(action);
    }
    if let Some(action) = mark_patched(trial, ctx, now).await? {
        return Ok(action);
    }
    if let Some(action) = wait_for_stability(trial, ctx, now).await? {
        return Ok(action);
    }
    if let Some(action) = reconcile_run_job(trial, ctx, now).await? {
        return Ok(action);
    }
    if let Some(action) = collect_metrics(trial, ctx, now).await? {
        return Ok(action);
    }

    if update_summary(trial) {
        ctx.kube.update_status(trial).await?;
        return Ok(Action::await_change());
    }
    Ok(Action::requeue(ctx.config.idle_requeue))
}

/// Refresh the display fields and write the status
pub(super) async fn persist(trial: &mut Trial, ctx: &TrialContext) -> Result<Action> {
    update_summary(trial);
    ctx.kube.update_status(trial).await?;
    Ok(Action::await_change())
}

async fn owning_experiment(trial: &Trial, ctx: &TrialContext) -> Result<Experiment> {
    let (namespace, name) = trial.experiment_key();
    ctx.kube
        .get_experiment(&namespace, &name)
        .await?
        .ok_or_else(|| {
            Error::configuration(format!("experiment {namespace}/{name} not found"))
        })
}

// =============================================================================
// Patches
// =============================================================================

async fn render_patch_operations(
    trial: &mut Trial,
    ctx: &TrialContext,
    now: DateTime<Utc>,
) -> Result<Option<Action>> {
    let status = trial.status_or_default();
    if find_condition(&status.conditions, TrialConditionType::Patched).is_some() {
        return Ok(None);
    }

    let experiment = owning_experiment(trial, ctx).await?;
    check_assignments(trial, &experiment)?;

    let mut operations = Vec::new();
    for rendered in render_patches(&experiment, trial, &ctx.templates)? {
        match rendered.target {
            PatchTarget::Object(reference) => operations.push(new_patch_operation(
                reference,
                rendered.patch_type,
                rendered.data,
            )),
            PatchTarget::Selector {
                reference,
                selector,
            } => {
                let names = ctx
                    .kube
                    .list_object_names(&reference, &label_selector_string(&selector)?)
                    .await?;
                for name in names {
                    let mut target = reference.clone();
                    target.name = Some(name);
                    operations.push(new_patch_operation(
                        target,
                        rendered.patch_type,
                        rendered.data.clone(),
                    ));
                }
            }
        }
    }

    info!(operations = operations.len(), "rendered patches");
    let status = trial.status.get_or_insert_with(Default::default);
    status.patch_operations = operations;
    apply_condition(
        &mut status.conditions,
        TrialConditionType::Patched,
        ConditionStatus::Unknown,
        "",
        "",
        now,
    );
    persist(trial, ctx).await.map(Some)
}

async fn apply_next_patch(
    trial: &mut Trial,
    ctx: &TrialContext,
    now: DateTime<Utc>,
) -> Result<Option<Action>> {
    let status = trial.status.get_or_insert_with(Default::default);
    let Some(index) = status
        .patch_operations
        .iter()
        .position(|op| op.attempts_remaining > 0)
    else {
        return Ok(None);
    };

    let op = status.patch_operations[index].clone();
    let target = format!(
        "{}/{}",
        op.target_ref.kind.as_deref().unwrap_or_default(),
        op.target_ref.name.as_deref().unwrap_or_default()
    );
    match ctx.kube.apply_patch(&op).await {
        Ok(()) => {
            info!(target = %target, "applied patch");
            status.patch_operations[index].attempts_remaining = 0;
            if op.wait {
                apply_condition(
                    &mut status.conditions,
                    TrialConditionType::Stable,
                    ConditionStatus::Unknown,
                    "",
                    "",
                    now,
                );
            }
        }
        Err(e) if e.is_conflict() => return Err(e),
        Err(e) => {
            warn!(target = %target, error = %e, "patch failed");
            let remaining = op.attempts_remaining - 1;
            status.patch_operations[index].attempts_remaining = remaining;
            if remaining == 0 {
                apply_condition(
                    &mut status.conditions,
                    TrialConditionType::Failed,
                    ConditionStatus::True,
                    "PatchFailed",
                    &e.to_string(),
                    now,
                );
            }
        }
    }

    apply_condition(
        &mut status.conditions,
        TrialConditionType::Patched,
        ConditionStatus::False,
        "",
        "",
        now,
    );
    persist(trial, ctx).await.map(Some)
}

async fn mark_patched(
    trial: &mut Trial,
    ctx: &TrialContext,
    now: DateTime<Utc>,
) -> Result<Option<Action>> {
    let status = trial.status.get_or_insert_with(Default::default);
    if check_condition(
        &status.conditions,
        TrialConditionType::Patched,
        ConditionStatus::True,
    ) == Some(true)
    {
        return Ok(None);
    }
    apply_condition(
        &mut status.conditions,
        TrialConditionType::Patched,
        ConditionStatus::True,
        "",
        "",
        now,
    );
    persist(trial, ctx).await.map(Some)
}

// =============================================================================
// Stability
// =============================================================================

async fn wait_for_stability(
    trial: &mut Trial,
    ctx: &TrialContext,
    now: DateTime<Utc>,
) -> Result<Option<Action>> {
    let status = trial.status.get_or_insert_with(Default::default);
    if check_condition(
        &status.conditions,
        TrialConditionType::Stable,
        ConditionStatus::True,
    ) != Some(false)
    {
        return Ok(None);
    }

    for index in 0..status.patch_operations.len() {
        let op = &status.patch_operations[index];
        if !op.wait || op.attempts_remaining != 0 {
            continue;
        }

        match check_stability(&op.target_ref, ctx).await? {
            Ok(()) => status.patch_operations[index].wait = false,
            Err(e @ StabilityError::NotReady { .. }) => {
                let retry_after = e.retry_after().unwrap_or(ctx.config.stability_poll_interval);
                let message = e.to_string();
                debug!(reason = %message, "waiting for patched workload");
                let unchanged = find_condition(&status.conditions, TrialConditionType::Stable)
                    .is_some_and(|c| c.status == ConditionStatus::False && c.message == message);
                if !unchanged {
                    apply_condition(
                        &mut status.conditions,
                        TrialConditionType::Stable,
                        ConditionStatus::False,
                        "Waiting",
                        &message,
                        now,
                    );
                    persist(trial, ctx).await?;
                }
                return Ok(Some(Action::requeue(retry_after)));
            }
            Err(e) => {
                warn!(error = %e, "patched workload will not stabilize");
                apply_condition(
                    &mut status.conditions,
                    TrialConditionType::Failed,
                    ConditionStatus::True,
                    "WaitFailed",
                    &e.to_string(),
                    now,
                );
                return persist(trial, ctx).await.map(Some);
            }
        }
    }

    apply_condition(
        &mut status.conditions,
        TrialConditionType::Stable,
        ConditionStatus::True,
        "",
        "",
        now,
    );
    persist(trial, ctx).await.map(Some)
}

/// Check the rollout of one patch target
///
/// The outer error is an API failure, the inner one the stability verdict.
async fn check_stability(
    reference: &ObjectReference,
    ctx: &TrialContext,
) -> Result<std::result::Result<(), StabilityError>> {
    let kind = reference.kind.as_deref().unwrap_or_default();
    let name = reference.name.as_deref().unwrap_or_default();
    if !Workload::is_checked_kind(kind) {
        return Ok(Ok(()));
    }

    let Some(workload) = ctx.kube.get_workload(reference).await? else {
        return Ok(Err(StabilityError::NotReady {
            kind: kind.to_string(),
            name: name.to_string(),
            reason: "NotFound".to_string(),
            retry_after: ctx.config.stability_poll_interval,
        }));
    };

    let check = workload.check();
    let pods = match (&check, workload.selector()) {
        (Err(instability), Some(selector)) if instability.needs_pod_check() => {
            let namespace = reference.namespace.as_deref().unwrap_or("default");
            Some(
                ctx.kube
                    .list_pods(namespace, &label_selector_string(selector)?)
                    .await?,
            )
        }
        _ => None,
    };
    Ok(settle(kind, name, check, pods.as_deref()))
}

// =============================================================================
// Trial run job
// =============================================================================

/// Build the job that runs the trial
///
/// The job comes from the trial's template. Without one, a container that
/// sleeps for the approximate run time (plus the start offset) is used.
pub fn new_run_job(trial: &Trial) -> Job {
    let template = trial.spec.template.clone().unwrap_or_default();
    let mut metadata = template.metadata.unwrap_or_default();
    let mut spec = template.spec.unwrap_or_default();
    let (_, experiment_name) = trial.experiment_key();

    let run_labels = [
        (LABEL_EXPERIMENT, experiment_name),
        (LABEL_TRIAL, trial.name_any()),
        (LABEL_TRIAL_ROLE, ROLE_TRIAL_RUN.to_string()),
    ];

    let labels = metadata.labels.get_or_insert_with(Default::default);
    for (k, v) in &run_labels {
        labels.entry(k.to_string()).or_insert_with(|| v.clone());
    }
    let pod_metadata = spec.template.metadata.get_or_insert_with(ObjectMeta::default);
    let pod_labels = pod_metadata.labels.get_or_insert_with(Default::default);
    for (k, v) in &run_labels {
        pod_labels.entry(k.to_string()).or_insert_with(|| v.clone());
    }

    metadata.namespace = trial.namespace();
    if metadata.name.as_deref().unwrap_or_default().is_empty() {
        metadata.name = Some(trial.name_any());
    }
    metadata.owner_references = controller_owner_ref(trial).map(|o| vec![o]);

    if spec.backoff_limit.is_none() {
        spec.backoff_limit = Some(0);
    }

    let pod = spec.template.spec.get_or_insert_with(Default::default);
    if pod.restart_policy.as_deref().unwrap_or_default().is_empty() {
        pod.restart_policy = Some("Never".to_string());
    }
    if pod.containers.is_empty() {
        let runtime = trial
            .spec
            .approximate_runtime_seconds
            .filter(|s| *s > 0)
            .unwrap_or(DEFAULT_RUNTIME_SECONDS)
            + trial.spec.start_time_offset_seconds.unwrap_or(0);
        pod.containers.push(Container {
            name: "default-trial-run".to_string(),
            image: Some("busybox".to_string()),
            command: Some(vec!["/bin/sh".to_string()]),
            args: Some(vec![
                "-c".to_string(),
                format!("echo 'Sleeping for {runtime}s...' && sleep {runtime} && echo 'Done.'"),
            ]),
            ..Default::default()
        });
    }

    Job {
        metadata,
        spec: Some(spec),
        status: None,
    }
}

/// Copy the run job's progress into the trial status, returning true on change
fn apply_job_status(trial: &mut Trial, job: &Job, now: DateTime<Utc>) -> bool {
    let offset = chrono::Duration::seconds(trial.spec.start_time_offset_seconds.unwrap_or(0));
    let Some(job_status) = &job.status else {
        return false;
    };
    let status = trial.status.get_or_insert_with(Default::default);
    let mut dirty = false;

    // The start time is fixed the first time it is observed
    if status.start_time.is_none() {
        if let Some(start) = &job_status.start_time {
            status.start_time = Some(start.0 + offset);
            dirty = true;
        }
    }
    if status.completion_time.is_none() {
        if let Some(end) = &job_status.completion_time {
            status.completion_time = Some(end.0);
            dirty = true;
        }
    }

    for c in job_status.conditions.iter().flatten() {
        if c.type_ != "Failed" || c.status != "True" {
            continue;
        }
        let reason = c.reason.as_deref().unwrap_or_default();
        if reason == "DeadlineExceeded" {
            // An active deadline is the intended way to bound the run
            if status.completion_time.is_none() {
                status.completion_time =
                    Some(c.last_transition_time.as_ref().map_or(now, |t| t.0));
                dirty = true;
            }
            continue;
        }
        if check_condition(
            &status.conditions,
            TrialConditionType::Failed,
            ConditionStatus::True,
        ) != Some(true)
        {
            apply_condition(
                &mut status.conditions,
                TrialConditionType::Failed,
                ConditionStatus::True,
                reason,
                c.message.as_deref().unwrap_or_default(),
                now,
            );
            dirty = true;
        }
    }
    dirty
}

async fn reconcile_run_job(
    trial: &mut Trial,
    ctx: &TrialContext,
    now: DateTime<Utc>,
) -> Result<Option<Action>> {
    let status = trial.status_or_default();
    if status.start_time.is_some() && status.completion_time.is_some() {
        return Ok(None);
    }

    let namespace = trial.namespace().unwrap_or_default();
    let selector = label_selector_string(&trial.job_selector())?;
    let jobs: Vec<Job> = ctx
        .kube
        .list_jobs(&namespace, &selector)
        .await?
        .into_iter()
        .filter(|j| {
            j.labels().get(LABEL_TRIAL_ROLE).map(String::as_str) != Some(ROLE_TRIAL_SETUP)
        })
        .collect();

    if jobs.is_empty() {
        let job = new_run_job(trial);
        info!(job = %job.name_any(), "creating trial run job");
        ctx.kube.create_job(&job).await?;
        return Ok(Some(Action::await_change()));
    }

    let mut dirty = false;
    for job in &jobs {
        dirty |= apply_job_status(trial, job, now);
    }
    if dirty {
        return persist(trial, ctx).await.map(Some);
    }
    Ok(None)
}

// =============================================================================
// Metrics
// =============================================================================

async fn collect_metrics(
    trial: &mut Trial,
    ctx: &TrialContext,
    now: DateTime<Utc>,
) -> Result<Option<Action>> {
    if trial.status_or_default().completion_time.is_none() {
        return Ok(Some(Action::requeue(ctx.config.idle_requeue)));
    }

    let experiment = owning_experiment(trial, ctx).await?;
    let metrics = &experiment.spec.metrics;

    let status = trial.status.get_or_insert_with(Default::default);
    if metrics.is_empty() {
        apply_condition(
            &mut status.conditions,
            TrialConditionType::Complete,
            ConditionStatus::True,
            "",
            "",
            now,
        );
        return persist(trial, ctx).await.map(Some);
    }

    if find_condition(&status.conditions, TrialConditionType::Observed).is_none() {
        status.values = metrics
            .iter()
            .map(|m| TrialValue {
                name: m.name.clone(),
                attempts_remaining: METRIC_ATTEMPTS,
                ..Default::default()
            })
            .collect();
        apply_condition(
            &mut status.conditions,
            TrialConditionType::Observed,
            ConditionStatus::Unknown,
            "",
            "",
            now,
        );
        return persist(trial, ctx).await.map(Some);
    }

    let Some(index) = status.values.iter().position(|v| v.attempts_remaining > 0) else {
        apply_condition(
            &mut status.conditions,
            TrialConditionType::Observed,
            ConditionStatus::True,
            "",
            "",
            now,
        );
        apply_condition(
            &mut status.conditions,
            TrialConditionType::Complete,
            ConditionStatus::True,
            "",
            "",
            now,
        );
        return persist(trial, ctx).await.map(Some);
    };

    let name = status.values[index].name.clone();
    let capture = match metrics.iter().find(|m| m.name == name) {
        Some(metric) => {
            let services = match &metric.selector {
                Some(selector) => {
                    ctx.kube
                        .list_services(&trial.target_namespace(), &label_selector_string(selector)?)
                        .await?
                }
                None => Vec::new(),
            };
            capture_metric(metric, trial, &services, &ctx.templates, ctx.metrics.as_ref()).await
        }
        None => Err(Error::metric(format!("metric '{name}' is not defined"))),
    };

    let status = trial.status.get_or_insert_with(Default::default);
    let value = &mut status.values[index];
    let failure = match capture {
        Ok(Capture::RetryAfter(delay)) => {
            debug!(metric = %name, "metric data not ready");
            return Ok(Some(Action::requeue(delay)));
        }
        Ok(Capture::Value { value: v, error }) if !v.is_nan() => {
            info!(metric = %name, value = v, "captured metric");
            value.value = v.to_string();
            value.error = error.map(|e| e.to_string());
            value.attempts_remaining = 0;
            None
        }
        Ok(Capture::Value { .. }) => Some(format!("metric '{name}' is not a number")),
        Err(e) if e.is_conflict() => return Err(e),
        Err(e) => Some(e.to_string()),
    };

    if let Some(message) = failure {
        warn!(metric = %name, error = %message, "metric capture failed");
        value.attempts_remaining -= 1;
        if value.attempts_remaining <= 0 {
            value.attempts_remaining = 0;
            apply_condition(
                &mut status.conditions,
                TrialConditionType::Failed,
                ConditionStatus::True,
                "MetricFailed",
                &message,
                now,
            );
        }
    }

    apply_condition(
        &mut status.conditions,
        TrialConditionType::Observed,
        ConditionStatus::False,
        "",
        "",
        now,
    );
    persist(trial, ctx).await.map(Some)
}
