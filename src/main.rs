//! trialops operator - runs optimization experiments as Kubernetes trials

use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use trialops::config::ControllerConfig;
use trialops::controller::{experiment, trial, ExperimentContext, TrialContext};
use trialops::crd::{Experiment, Trial};
use trialops::retry::{retry_with_backoff, RetryConfig};

/// trialops - CRD-driven Kubernetes operator for optimization experiments
#[derive(Parser, Debug)]
#[command(name = "trialops", version, about, long_about = None)]
struct Cli {
    /// Print the CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the experiment and trial controllers (default mode)
    Controller(ControllerArgs),
}

/// Controller settings, each also read from the environment
#[derive(Args, Debug, Default)]
struct ControllerArgs {
    /// Base URL of the remote suggestion server; trials are created by hand when unset
    #[arg(long, env = "TRIALOPS_SERVER_URL")]
    server_url: Option<String>,

    /// Bearer token presented to the remote suggestion server
    #[arg(long, env = "TRIALOPS_SERVER_TOKEN", hide_env_values = true)]
    server_token: Option<String>,

    /// Image used by setup tasks that do not name their own
    #[arg(long, env = "DEFAULT_SETUP_IMAGE")]
    setup_image: Option<String>,

    /// Pull policy for the default setup image
    #[arg(long, env = "DEFAULT_SETUP_IMAGE_PULL_POLICY")]
    setup_image_pull_policy: Option<String>,

    /// Timeout for each remote request, in seconds
    #[arg(long, default_value = "10")]
    request_timeout_secs: u64,
}

impl ControllerArgs {
    fn into_config(self) -> anyhow::Result<ControllerConfig> {
        let mut config = ControllerConfig {
            server_token: self.server_token.filter(|t| !t.is_empty()),
            request_timeout: std::time::Duration::from_secs(self.request_timeout_secs),
            ..Default::default()
        };
        if let Some(url) = self.server_url.filter(|u| !u.is_empty()) {
            config = config.with_server_url(&url)?;
        }
        if let Some(image) = self.setup_image {
            config = config.with_setup_image(image, self.setup_image_pull_policy);
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("failed to install the TLS crypto provider: {e:?}");
        std::process::exit(1);
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        for crd in [Experiment::crd(), Trial::crd()] {
            let yaml = serde_yaml::to_string(&crd)
                .map_err(|e| anyhow::anyhow!("failed to serialize CRD: {}", e))?;
            println!("---\n{yaml}");
        }
        return Ok(());
    }

    let args = match cli.command {
        Some(Commands::Controller(args)) => args,
        None => ControllerArgs::parse_from_env(),
    };
    run_controller(args.into_config()?).await
}

impl ControllerArgs {
    /// Settings for the default mode, which takes no flags
    fn parse_from_env() -> Self {
        #[derive(Parser)]
        struct EnvOnly {
            #[command(flatten)]
            args: ControllerArgs,
        }
        EnvOnly::parse_from(["trialops"]).args
    }
}

/// Install or update both CRDs with server-side apply
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
        CustomResourceDefinition,
    };
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(trialops::FIELD_MANAGER).force();

    for crd in [Experiment::crd(), Trial::crd()] {
        let name = crd.metadata.name.clone().unwrap_or_default();
        let patch = Patch::Apply(&crd);
        tracing::info!(crd = %name, "installing CRD");
        retry_with_backoff(&RetryConfig::startup(), "install_crd", || {
            crds.patch(&name, &params, &patch)
        })
        .await
        .map_err(|e| anyhow::anyhow!("failed to install CRD {}: {}", name, e))?;
    }
    Ok(())
}

async fn run_controller(config: ControllerConfig) -> anyhow::Result<()> {
    tracing::info!(
        server = config.server_url.as_ref().map(|u| u.as_str()).unwrap_or("<none>"),
        setup_image = %config.setup_image,
        "trialops controller starting"
    );

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client).await?;

    let trial_ctx = Arc::new(TrialContext::builder(client.clone(), config.clone()).build()?);
    let experiment_ctx = Arc::new(ExperimentContext::builder(client.clone(), config).build()?);

    let trials: Api<Trial> = Api::all(client.clone());
    let jobs: Api<Job> = Api::all(client.clone());
    let experiments: Api<Experiment> = Api::all(client.clone());

    let trial_controller = Controller::new(trials.clone(), WatcherConfig::default())
        .owns(jobs, WatcherConfig::default())
        .shutdown_on_signal()
        .run(trial::reconcile, trial::error_policy, trial_ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => tracing::debug!(?action, "trial reconciliation completed"),
                Err(e) => tracing::error!(error = ?e, "trial reconciliation error"),
            }
        });

    let experiment_controller = Controller::new(experiments, WatcherConfig::default())
        .owns(trials, WatcherConfig::default())
        .shutdown_on_signal()
        .run(experiment::reconcile, experiment::error_policy, experiment_ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => tracing::debug!(?action, "experiment reconciliation completed"),
                Err(e) => tracing::error!(error = ?e, "experiment reconciliation error"),
            }
        });

    tokio::select! {
        _ = trial_controller => {
            tracing::info!("trial controller completed");
        }
        _ = experiment_controller => {
            tracing::info!("experiment controller completed");
        }
    }

    tracing::info!("trialops controller shutting down");
    Ok(())
}
