//! trialops - CRD-driven Kubernetes operator for optimization experiments
//!
//! An Experiment describes a parameter search space and the metrics to
//! optimize. trialops asks a remote suggestion service for candidate
//! assignments, runs each candidate as a Trial on the cluster and reports
//! the observed metric values back, until the remote service runs out of
//! suggestions or the budget is spent.
//!
//! # Architecture
//!
//! Two reconcilers cooperate through persisted state only:
//! - The trial reconciler drives one Trial through setup, patching,
//!   stabilization, the trial run job and metric collection
//! - The experiment reconciler registers the experiment remotely, keeps the
//!   number of trials at the desired parallelism and reports finished trials
//!
//! Each reconcile pass performs at most one mutation and then returns, relying
//! on the resulting watch event (or an explicit requeue) for the next step.
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definitions (Experiment, Trial)
//! - [`conditions`] - Condition store helpers and trial status summaries
//! - [`setup`] - Setup task jobs (create/delete modes, Helm generator config)
//! - [`template`] - Jinja rendering of patches, Helm values and metric queries
//! - [`patch`] - Patch rendering and target resolution
//! - [`stability`] - Rollout checks for patched workloads
//! - [`metrics`] - Metric capture (local, Prometheus, JSON path)
//! - [`remote`] - Remote suggestion service client
//! - [`controller`] - Trial and experiment reconcilers, namespace allocation
//! - [`config`] - Controller configuration
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod conditions;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod metrics;
pub mod patch;
pub mod remote;
pub mod retry;
pub mod setup;
pub mod stability;
pub mod template;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Well-known Labels, Annotations and Finalizers
// =============================================================================
// Persisted state shared between the reconcilers. Changing any of these
// orphans state written by earlier versions of the operator.

/// Annotation holding the URL of the experiment on the remote server
pub const ANNOTATION_EXPERIMENT_URL: &str = "trialops.dev/experiment-url";

/// Annotation holding the URL used to obtain the next suggestion
pub const ANNOTATION_SUGGESTION_URL: &str = "trialops.dev/suggestion-url";

/// Annotation holding the URL used to report a trial's observation
pub const ANNOTATION_REPORT_TRIAL_URL: &str = "trialops.dev/report-trial-url";

/// Label naming the experiment an object belongs to
pub const LABEL_EXPERIMENT: &str = "trialops.dev/experiment";

/// Label naming the trial an object belongs to
pub const LABEL_TRIAL: &str = "trialops.dev/trial";

/// Label naming the role an object plays in trial execution
pub const LABEL_TRIAL_ROLE: &str = "trialops.dev/trial-role";

/// Trial role of setup jobs
pub const ROLE_TRIAL_SETUP: &str = "trialSetup";

/// Trial role of trial run jobs
pub const ROLE_TRIAL_RUN: &str = "trialRun";

/// Finalizer holding a trial until its delete-mode setup job has run
pub const SETUP_FINALIZER: &str = "trialops.dev/setup";

/// Field manager name used for server-side apply and patches
pub const FIELD_MANAGER: &str = "trialops-controller";
