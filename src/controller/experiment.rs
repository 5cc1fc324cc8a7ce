//! Experiment controller implementation
//!
//! Keeps an experiment's trials in step with the remote suggestion service:
//! registers the experiment, reports finished trials, and creates new trials
//! from suggestions while there are free slots.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use super::namespace::find_available_namespace;
use crate::conditions::{is_active, is_finished, needs_cleanup};
use crate::config::ControllerConfig;
use crate::crd::{Experiment, ExperimentStatus, Trial};
use crate::kube_utils::{controller_owner_ref, label_selector_string};
use crate::remote::{
    experiment_to_remote, populate_trial, trial_values, HttpSuggestionClient, NextTrial,
    SuggestionClient,
};
use crate::retry::{retry_if, RetryConfig};
use crate::{
    Error, Result, ANNOTATION_EXPERIMENT_URL, ANNOTATION_REPORT_TRIAL_URL,
    ANNOTATION_SUGGESTION_URL, FIELD_MANAGER,
};

const PHASE_CREATED: &str = "Created";
const PHASE_PAUSED: &str = "Paused";
const PHASE_NEVER_RUN: &str = "Never run";
const PHASE_IDLE: &str = "Idle";
const PHASE_RUNNING: &str = "Running";
const PHASE_COMPLETED: &str = "Completed";

/// Trait abstracting the Kubernetes operations of the experiment controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ExperimentKubeClient: Send + Sync {
    /// Replace the experiment (spec and metadata)
    async fn replace_experiment(&self, experiment: &Experiment) -> Result<()>;

    /// Persist the experiment status, guarded by its resource version
    async fn patch_experiment_status(&self, experiment: &Experiment) -> Result<()>;

    /// List trials matching a label selector
    async fn list_trials(&self, namespace: &str, selector: &str) -> Result<Vec<Trial>>;

    /// Create a trial
    async fn create_trial(&self, trial: &Trial) -> Result<()>;

    /// Replace a trial (spec and metadata)
    async fn replace_trial(&self, trial: &Trial) -> Result<()>;

    /// Delete a trial
    async fn delete_trial(&self, trial: &Trial) -> Result<()>;

    /// Names of the namespaces matching a label selector, in list order
    async fn list_namespaces(&self, selector: &str) -> Result<Vec<String>>;
}

/// Real Kubernetes client implementation
pub struct ExperimentKubeClientImpl {
    client: Client,
}

impl ExperimentKubeClientImpl {
    /// Create a new ExperimentKubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn experiments(&self, experiment: &Experiment) -> Api<Experiment> {
        Api::namespaced(
            self.client.clone(),
            &experiment.namespace().unwrap_or_default(),
        )
    }

    fn trials(&self, namespace: &str) -> Api<Trial> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ExperimentKubeClient for ExperimentKubeClientImpl {
    async fn replace_experiment(&self, experiment: &Experiment) -> Result<()> {
        self.experiments(experiment)
            .replace(&experiment.name_any(), &PostParams::default(), experiment)
            .await?;
        Ok(())
    }

    async fn patch_experiment_status(&self, experiment: &Experiment) -> Result<()> {
        let status_patch = json!({
            "metadata": { "resourceVersion": experiment.resource_version() },
            "status": experiment.status,
        });
        self.experiments(experiment)
            .patch_status(
                &experiment.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&status_patch),
            )
            .await?;
        Ok(())
    }

    async fn list_trials(&self, namespace: &str, selector: &str) -> Result<Vec<Trial>> {
        Ok(self
            .trials(namespace)
            .list(&ListParams::default().labels(selector))
            .await?
            .items)
    }

    async fn create_trial(&self, trial: &Trial) -> Result<()> {
        self.trials(&trial.namespace().unwrap_or_default())
            .create(&PostParams::default(), trial)
            .await?;
        Ok(())
    }

    async fn replace_trial(&self, trial: &Trial) -> Result<()> {
        self.trials(&trial.namespace().unwrap_or_default())
            .replace(&trial.name_any(), &PostParams::default(), trial)
            .await?;
        Ok(())
    }

    async fn delete_trial(&self, trial: &Trial) -> Result<()> {
        self.trials(&trial.namespace().unwrap_or_default())
            .delete(&trial.name_any(), &DeleteParams::background())
            .await?;
        Ok(())
    }

    async fn list_namespaces(&self, selector: &str) -> Result<Vec<String>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default().labels(selector)).await?;
        Ok(list.items.iter().map(|ns| ns.name_any()).collect())
    }
}

/// Controller context for the experiment reconciler
pub struct ExperimentContext {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn ExperimentKubeClient>,
    /// Remote suggestion service, None when no server is configured
    pub suggestions: Option<Arc<dyn SuggestionClient>>,
    /// Controller configuration
    pub config: ControllerConfig,
}

impl ExperimentContext {
    /// Create a builder for constructing an ExperimentContext
    pub fn builder(client: Client, config: ControllerConfig) -> ExperimentContextBuilder {
        ExperimentContextBuilder {
            client,
            config,
            kube: None,
            suggestions: None,
        }
    }

    /// Create a context for testing with custom mock clients
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn ExperimentKubeClient>,
        suggestions: Option<Arc<dyn SuggestionClient>>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            kube,
            suggestions,
            config,
        }
    }
}

/// Builder for constructing [`ExperimentContext`] instances
pub struct ExperimentContextBuilder {
    client: Client,
    config: ControllerConfig,
    kube: Option<Arc<dyn ExperimentKubeClient>>,
    suggestions: Option<Arc<dyn SuggestionClient>>,
}

impl ExperimentContextBuilder {
    /// Override the Kubernetes client (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn ExperimentKubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the suggestion client (primarily for testing)
    pub fn suggestion_client(mut self, suggestions: Arc<dyn SuggestionClient>) -> Self {
        self.suggestions = Some(suggestions);
        self
    }

    /// Build the ExperimentContext
    ///
    /// Without an override the HTTP client is configured from the server
    /// URL, and no client is used when none is set.
    pub fn build(self) -> Result<ExperimentContext> {
        let suggestions = match self.suggestions {
            Some(s) => Some(s),
            None => HttpSuggestionClient::from_config(&self.config)?
                .map(|c| Arc::new(c) as Arc<dyn SuggestionClient>),
        };
        Ok(ExperimentContext {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(ExperimentKubeClientImpl::new(self.client.clone()))),
            suggestions,
            config: self.config,
        })
    }
}

/// Reconcile an Experiment resource
#[instrument(skip(experiment, ctx), fields(experiment = %experiment.name_any()))]
pub async fn reconcile(experiment: Arc<Experiment>, ctx: Arc<ExperimentContext>) -> Result<Action> {
    let mut experiment = (*experiment).clone();
    match reconcile_experiment(&mut experiment, &ctx, Utc::now()).await {
        Err(e) if e.is_conflict() => {
            debug!("experiment changed during reconcile, retrying");
            Ok(Action::requeue(Duration::ZERO))
        }
        Err(e) if e.is_not_found() => {
            debug!(error = %e, "object no longer exists");
            Ok(Action::await_change())
        }
        other => other,
    }
}

/// Error policy for the experiment controller
pub fn error_policy(
    experiment: Arc<Experiment>,
    error: &Error,
    _ctx: Arc<ExperimentContext>,
) -> Action {
    error!(
        ?error,
        experiment = %experiment.name_any(),
        "reconciliation failed"
    );
    Action::requeue(Duration::from_secs(5))
}

async fn reconcile_experiment(
    experiment: &mut Experiment,
    ctx: &ExperimentContext,
    now: DateTime<Utc>,
) -> Result<Action> {
    if let Some(action) = register_experiment(experiment, ctx).await? {
        return Ok(action);
    }
    if let Some(action) = resolve_suggestion_source(experiment, ctx).await? {
        return Ok(action);
    }

    let namespace = experiment.namespace().unwrap_or_default();
    let selector = label_selector_string(&experiment.trial_selector())?;
    let trials = ctx.kube.list_trials(&namespace, &selector).await?;

    if let Some(action) = report_finished_trials(&trials, ctx).await? {
        return Ok(action);
    }
    if let Some(action) = clean_up_trials(experiment, &trials, ctx, now).await? {
        return Ok(action);
    }
    if let Some(action) = create_next_trial(experiment, &trials, ctx).await? {
        return Ok(action);
    }
    update_status(experiment, &trials, ctx).await
}

// =============================================================================
// Remote registration
// =============================================================================

async fn register_experiment(
    experiment: &mut Experiment,
    ctx: &ExperimentContext,
) -> Result<Option<Action>> {
    let Some(suggestions) = &ctx.suggestions else {
        return Ok(None);
    };
    if experiment.annotation(ANNOTATION_EXPERIMENT_URL).is_some()
        || experiment.metadata.deletion_timestamp.is_some()
    {
        return Ok(None);
    }

    let remote = suggestions
        .create_experiment(&experiment.name_any(), &experiment_to_remote(experiment))
        .await?;
    let Some(self_url) = remote.self_url.filter(|u| !u.is_empty()) else {
        return Err(Error::remote("server did not return the experiment location"));
    };

    info!(url = %self_url, "registered experiment");
    experiment.set_annotation(ANNOTATION_EXPERIMENT_URL, self_url);
    if let Some(next) = remote.next_trial_url.filter(|u| !u.is_empty()) {
        experiment.set_annotation(ANNOTATION_SUGGESTION_URL, next);
    }
    ctx.kube.replace_experiment(experiment).await?;
    Ok(Some(Action::await_change()))
}

async fn resolve_suggestion_source(
    experiment: &mut Experiment,
    ctx: &ExperimentContext,
) -> Result<Option<Action>> {
    let Some(suggestions) = &ctx.suggestions else {
        return Ok(None);
    };
    let Some(url) = experiment.annotation(ANNOTATION_EXPERIMENT_URL).map(str::to_string) else {
        return Ok(None);
    };
    if experiment.annotation(ANNOTATION_SUGGESTION_URL).is_some() || experiment.replicas() <= 0 {
        return Ok(None);
    }

    let client: &dyn SuggestionClient = suggestions.as_ref();
    let url = url.as_str();
    let remote = retry_if(
        &RetryConfig::remote(),
        "get_remote_experiment",
        Error::is_transient,
        move || client.get_experiment(url),
    )
    .await?;

    let parallel = remote.optimization.parallel_trials;
    if parallel > 0 && parallel < experiment.replicas() {
        debug!(replicas = parallel, "capping replicas to remote parallelism");
        experiment.set_replicas(parallel);
    }

    if let Some(next) = remote.next_trial_url.filter(|u| !u.is_empty()) {
        info!("stored suggestion source");
        experiment.set_annotation(ANNOTATION_SUGGESTION_URL, next);
        ctx.kube.replace_experiment(experiment).await?;
        return Ok(Some(Action::await_change()));
    }
    Ok(None)
}

// =============================================================================
// Finished trials
// =============================================================================

async fn report_finished_trials(
    trials: &[Trial],
    ctx: &ExperimentContext,
) -> Result<Option<Action>> {
    let Some(suggestions) = &ctx.suggestions else {
        return Ok(None);
    };

    for trial in trials {
        let Some(report_url) = trial.report_url() else {
            continue;
        };
        let finished = is_finished(&trial.status_or_default().conditions);
        if trial.metadata.deletion_timestamp.is_some() {
            if finished {
                continue;
            }
            // Dropping the report URL records that the server was told
            suggestions.abandon_trial(report_url).await?;
            info!(trial = %trial.name_any(), "abandoned deleted trial");
            let mut abandoned = trial.clone();
            abandoned
                .annotations_mut()
                .remove(ANNOTATION_REPORT_TRIAL_URL);
            ctx.kube.replace_trial(&abandoned).await?;
            return Ok(Some(Action::await_change()));
        }
        if !finished {
            continue;
        }

        let values = trial_values(trial)?;
        suggestions.report_trial(report_url, &values).await?;
        info!(trial = %trial.name_any(), failed = values.failed, "reported trial");

        // Deleting the trial marks the observation as accounted for
        ctx.kube.delete_trial(trial).await?;
        return Ok(Some(Action::await_change()));
    }
    Ok(None)
}

async fn clean_up_trials(
    experiment: &Experiment,
    trials: &[Trial],
    ctx: &ExperimentContext,
    now: DateTime<Utc>,
) -> Result<Option<Action>> {
    let deleting = experiment.metadata.deletion_timestamp.is_some();
    let expired = trials.iter().find(|t| {
        t.metadata.deletion_timestamp.is_none()
            && (needs_cleanup(t, now)
                || (deleting && !is_finished(&t.status_or_default().conditions)))
    });

    let Some(trial) = expired else {
        return Ok(None);
    };
    if let (Some(suggestions), Some(report_url)) = (&ctx.suggestions, trial.report_url()) {
        if !is_finished(&trial.status_or_default().conditions) {
            suggestions.abandon_trial(report_url).await?;
            info!(trial = %trial.name_any(), "abandoned unfinished trial");
        }
    }
    info!(trial = %trial.name_any(), "deleting trial");
    ctx.kube.delete_trial(trial).await?;
    Ok(Some(Action::await_change()))
}

// =============================================================================
// New trials
// =============================================================================

async fn create_next_trial(
    experiment: &mut Experiment,
    trials: &[Trial],
    ctx: &ExperimentContext,
) -> Result<Option<Action>> {
    let Some(suggestions) = &ctx.suggestions else {
        return Ok(None);
    };
    let Some(suggestion_url) = experiment
        .annotation(ANNOTATION_SUGGESTION_URL)
        .map(str::to_string)
    else {
        return Ok(None);
    };
    let replicas = usize::try_from(experiment.replicas()).unwrap_or(0);
    if trials.len() >= replicas {
        return Ok(None);
    }

    let candidates = match &experiment.spec.namespace_selector {
        Some(selector) => {
            ctx.kube
                .list_namespaces(&label_selector_string(selector)?)
                .await?
        }
        None => Vec::new(),
    };
    let Some(namespace) = find_available_namespace(experiment, trials, &candidates) else {
        debug!("no namespace available for a new trial");
        return Ok(None);
    };

    match suggestions.next_trial(&suggestion_url).await? {
        next @ NextTrial::Assigned { .. } => {
            let mut trial = populate_trial(experiment, &namespace, &next)?;
            trial.metadata.owner_references = controller_owner_ref(experiment).map(|o| vec![o]);
            info!(trial = %trial.name_any(), namespace = %namespace, "creating trial");
            if let Err(e) = ctx.kube.create_trial(&trial).await {
                if let Some(report_url) = trial.report_url() {
                    if let Err(abandon) = suggestions.abandon_trial(report_url).await {
                        warn!(error = %abandon, "failed to abandon suggestion");
                    }
                }
                return Err(e);
            }
            Ok(Some(Action::await_change()))
        }
        NextTrial::Exhausted => {
            info!("suggestions exhausted, stopping trial creation");
            experiment.set_replicas(0);
            experiment.remove_annotation(ANNOTATION_SUGGESTION_URL);
            ctx.kube.replace_experiment(experiment).await?;
            Ok(Some(Action::await_change()))
        }
        NextTrial::Unavailable => {
            debug!("no suggestion available yet");
            Ok(Some(Action::requeue(ctx.config.suggestion_backoff)))
        }
    }
}

// =============================================================================
// Status
// =============================================================================

fn experiment_phase(experiment: &Experiment, trials: &[Trial], active: i32) -> &'static str {
    let registered = experiment.annotation(ANNOTATION_EXPERIMENT_URL).is_some();
    if experiment.replicas() == 0 {
        return if registered && experiment.annotation(ANNOTATION_SUGGESTION_URL).is_none() {
            PHASE_COMPLETED
        } else {
            PHASE_PAUSED
        };
    }
    if trials.is_empty() {
        return if registered { PHASE_NEVER_RUN } else { PHASE_CREATED };
    }
    if active == 0 {
        PHASE_IDLE
    } else {
        PHASE_RUNNING
    }
}

async fn update_status(
    experiment: &mut Experiment,
    trials: &[Trial],
    ctx: &ExperimentContext,
) -> Result<Action> {
    let active = i32::try_from(trials.iter().filter(|t| is_active(t)).count()).unwrap_or(i32::MAX);
    let phase = experiment_phase(experiment, trials, active);

    let current = experiment.status.clone().unwrap_or_default();
    if current.phase == phase && current.active_trials == active {
        return Ok(Action::await_change());
    }

    experiment.status = Some(ExperimentStatus {
        phase: phase.to_string(),
        active_trials: active,
        ..current
    });
    debug!(phase, active, "updating experiment status");
    ctx.kube.patch_experiment_status(experiment).await?;
    Ok(Action::await_change())
}
