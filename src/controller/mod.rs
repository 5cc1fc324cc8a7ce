//! Reconcilers for the trialops CRDs
//!
//! The trial and experiment controllers share no in-process state. Each
//! reads what it needs from the API server on every pass and hands the
//! next step to the watch event its own write produces.

pub mod experiment;
mod namespace;
mod setup;
pub mod trial;

pub use experiment::{
    ExperimentContext, ExperimentContextBuilder, ExperimentKubeClient, ExperimentKubeClientImpl,
};
pub use namespace::find_available_namespace;
pub use trial::{
    new_run_job, TrialContext, TrialContextBuilder, TrialKubeClient, TrialKubeClientImpl,
};
