//! Remote suggestion service client
//!
//! The remote server owns the optimization algorithm. The operator registers
//! each experiment with it, asks it for the next trial's assignments and
//! reports observed values back. Links between remote resources travel in
//! `Link` and `Location` headers.
//!
//! Status handling lives in pure functions so the protocol can be tested
//! without a server; [`HttpSuggestionClient`] only moves bytes.

mod convert;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;
use reqwest::header::{HeaderMap, LINK, LOCATION};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::config::ControllerConfig;
use crate::{Error, Result};

pub use convert::{
    assignments_from_remote, experiment_to_remote, populate_trial, trial_assignments,
    trial_name, trial_values,
};

/// Link relation of an experiment's own URL
pub const REL_SELF: &str = "self";

/// Link relation of the URL that hands out the next trial
pub const REL_NEXT_TRIAL: &str = "https://trialops.dev/rel/nextTrial";

// =============================================================================
// Wire types
// =============================================================================

/// How the remote optimizer generates trials
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Optimization {
    /// Estimated number of trials for the whole experiment
    #[serde(default, skip_serializing_if = "is_zero")]
    pub experiment_budget: i32,
    /// Number of trials run concurrently across all clusters
    #[serde(default, skip_serializing_if = "is_zero")]
    pub parallel_trials: i32,
    /// Number of random trials at the start of the experiment
    #[serde(default, skip_serializing_if = "is_zero")]
    pub burn_in: i32,
}

fn is_zero(v: &i32) -> bool {
    *v == 0
}

/// Inclusive bounds of an integer parameter
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Bounds {
    /// Minimum value
    pub min: i64,
    /// Maximum value
    pub max: i64,
}

/// A parameter of the remote search space
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct RemoteParameter {
    /// Parameter name
    pub name: String,
    /// Always `int` for parameters created by the operator
    #[serde(rename = "type")]
    pub type_: String,
    /// Parameter domain
    pub bounds: Bounds,
}

/// A metric the remote optimizer optimizes
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct RemoteMetric {
    /// Metric name
    pub name: String,
    /// Minimize rather than maximize
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub minimize: bool,
}

/// The remote representation of an experiment
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteExperiment {
    /// URL of the experiment itself, from the `self` link
    #[serde(skip)]
    pub self_url: Option<String>,
    /// URL handing out the next trial, from the next trial link
    #[serde(skip)]
    pub next_trial_url: Option<String>,
    /// Display name, never used to build URLs
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub display_name: String,
    /// Optimizer configuration
    #[serde(default)]
    pub optimization: Optimization,
    /// Outcomes being optimized
    #[serde(default)]
    pub metrics: Vec<RemoteMetric>,
    /// Search space
    #[serde(default)]
    pub parameters: Vec<RemoteParameter>,
}

/// One assigned parameter of a suggestion
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteAssignment {
    /// Name of the experiment parameter
    pub parameter_name: String,
    /// Assigned value as a JSON number
    pub value: serde_json::Value,
}

#[derive(Deserialize)]
struct AssignmentsBody {
    #[serde(default)]
    assignments: Vec<RemoteAssignment>,
}

/// One observed metric value
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteValue {
    /// Metric name
    pub metric_name: String,
    /// Observed value
    pub value: f64,
    /// Observed standard deviation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<f64>,
}

/// The observation reported for a finished trial
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct TrialValues {
    /// Observed values, omitted for failed trials
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<RemoteValue>,
    /// The trial failed and `values` must be ignored
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub failed: bool,
    /// Effective start of the trial run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,
    /// End of the trial run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
}

/// Answer to a next trial request
#[derive(Clone, Debug, PartialEq)]
pub enum NextTrial {
    /// A new suggestion to evaluate
    Assigned {
        /// Parameter assignments
        assignments: Vec<RemoteAssignment>,
        /// URL the observation is reported to
        report_url: String,
    },
    /// The experiment will never produce another suggestion
    Exhausted,
    /// No suggestion right now; ask again later
    Unavailable,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: String,
}

// =============================================================================
// Client trait
// =============================================================================

/// Operations against the remote suggestion service
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SuggestionClient: Send + Sync {
    /// Register (or update) an experiment under `name`
    async fn create_experiment(
        &self,
        name: &str,
        experiment: &RemoteExperiment,
    ) -> Result<RemoteExperiment>;

    /// Read an experiment back from its URL
    async fn get_experiment(&self, url: &str) -> Result<RemoteExperiment>;

    /// Ask for the next trial
    async fn next_trial(&self, url: &str) -> Result<NextTrial>;

    /// Report the observation of a finished trial
    async fn report_trial(&self, url: &str, values: &TrialValues) -> Result<()>;

    /// Tell the server a suggested trial will never be reported
    async fn abandon_trial(&self, url: &str) -> Result<()>;
}

// =============================================================================
// Protocol helpers
// =============================================================================

/// Parse an RFC 8288 `Link` header into `(rel, url)` pairs
pub fn parse_links(header: &str) -> Vec<(String, String)> {
    let mut links = Vec::new();
    for part in header.split(',') {
        let mut pieces = part.split(';');
        let Some(target) = pieces.next().map(str::trim) else {
            continue;
        };
        let Some(target) = target.strip_prefix('<').and_then(|t| t.strip_suffix('>')) else {
            continue;
        };
        for param in pieces {
            let Some((key, value)) = param.trim().split_once('=') else {
                continue;
            };
            if key.trim().eq_ignore_ascii_case("rel") {
                for rel in value.trim().trim_matches('"').split_whitespace() {
                    links.push((rel.to_string(), target.to_string()));
                }
            }
        }
    }
    links
}

/// Resolve a possibly relative reference against the request URL
fn resolve(base: &Url, reference: &str) -> String {
    base.join(reference)
        .map(String::from)
        .unwrap_or_else(|_| reference.to_string())
}

/// Copy the experiment links out of the response headers
fn apply_links(experiment: &mut RemoteExperiment, headers: &HeaderMap, base: &Url) {
    for value in headers.get_all(LINK) {
        let Ok(value) = value.to_str() else { continue };
        for (rel, target) in parse_links(value) {
            match rel.as_str() {
                REL_SELF => experiment.self_url = Some(resolve(base, &target)),
                REL_NEXT_TRIAL => experiment.next_trial_url = Some(resolve(base, &target)),
                _ => {}
            }
        }
    }
}

/// Build the error for an unsuccessful response
///
/// A server supplied `{"error": ...}` message wins over the status specific
/// default.
pub fn response_error(status: StatusCode, body: &str, known: Option<&str>) -> Error {
    let message = serde_json::from_str::<ErrorBody>(body)
        .ok()
        .map(|b| b.error)
        .filter(|m| !m.is_empty())
        .or_else(|| known.map(str::to_string))
        .unwrap_or_else(|| format!("unexpected server response: {status}"));
    Error::remote(message)
}

fn create_experiment_error(status: StatusCode) -> Option<&'static str> {
    match status {
        StatusCode::BAD_REQUEST => Some("experiment name is invalid"),
        StatusCode::CONFLICT => Some("experiment name conflicts with an existing experiment"),
        StatusCode::UNPROCESSABLE_ENTITY => Some("experiment is invalid"),
        _ => None,
    }
}

/// Interpret a next trial response status
///
/// Returns None when the status carries a suggestion body.
pub fn next_trial_status(status: StatusCode) -> Option<NextTrial> {
    match status {
        StatusCode::GONE => Some(NextTrial::Exhausted),
        StatusCode::SERVICE_UNAVAILABLE => Some(NextTrial::Unavailable),
        _ => None,
    }
}

/// Interpret a report response status
///
/// A trial that was already reported is treated as reported, which keeps
/// re-reporting after a failed trial delete harmless.
pub fn report_trial_result(status: StatusCode, body: &str) -> Result<()> {
    match status {
        StatusCode::OK | StatusCode::CREATED | StatusCode::NO_CONTENT | StatusCode::CONFLICT => {
            Ok(())
        }
        StatusCode::NOT_FOUND => Err(response_error(status, body, Some("trial not found"))),
        StatusCode::UNPROCESSABLE_ENTITY => {
            Err(response_error(status, body, Some("trial observation is invalid")))
        }
        _ => Err(response_error(status, body, None)),
    }
}

/// Interpret an abandon response status
///
/// A trial the server no longer knows is as good as abandoned.
pub fn abandon_trial_result(status: StatusCode, body: &str) -> Result<()> {
    match status {
        StatusCode::OK | StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => Ok(()),
        _ => Err(response_error(status, body, None)),
    }
}

// =============================================================================
// HTTP implementation
// =============================================================================

/// reqwest-backed [`SuggestionClient`]
pub struct HttpSuggestionClient {
    client: reqwest::Client,
    base: Url,
    token: Option<String>,
}

impl HttpSuggestionClient {
    /// Create a client for the server configured in `config`
    ///
    /// Returns None when no server is configured.
    pub fn from_config(config: &ControllerConfig) -> Result<Option<Self>> {
        let Some(base) = config.server_url.clone() else {
            return Ok(None);
        };
        Ok(Some(Self::new(
            base,
            config.server_token.clone(),
            config.request_timeout,
        )?))
    }

    /// Create a client for `base`, which must end with a slash
    pub fn new(base: Url, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base,
            token,
        })
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, url)
            .header(reqwest::header::ACCEPT, "application/json");
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn parse_url(url: &str) -> Result<Url> {
        Url::parse(url).map_err(|e| Error::remote(format!("invalid remote URL '{url}': {e}")))
    }
}

#[async_trait]
impl SuggestionClient for HttpSuggestionClient {
    async fn create_experiment(
        &self,
        name: &str,
        experiment: &RemoteExperiment,
    ) -> Result<RemoteExperiment> {
        let url = self
            .base
            .join(&format!("experiments/{name}"))
            .map_err(|e| Error::remote(format!("invalid experiment name '{name}': {e}")))?;
        debug!(url = %url, "creating remote experiment");

        let resp = self
            .request(reqwest::Method::PUT, url.clone())
            .json(experiment)
            .send()
            .await?;
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.text().await?;

        if status != StatusCode::OK && status != StatusCode::CREATED {
            return Err(response_error(
                status,
                &body,
                create_experiment_error(status),
            ));
        }
        let mut created: RemoteExperiment = if body.trim().is_empty() {
            RemoteExperiment::default()
        } else {
            serde_json::from_str(&body)?
        };
        apply_links(&mut created, &headers, &url);
        Ok(created)
    }

    async fn get_experiment(&self, url: &str) -> Result<RemoteExperiment> {
        let url = Self::parse_url(url)?;
        let resp = self.request(reqwest::Method::GET, url.clone()).send().await?;
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.text().await?;

        match status {
            StatusCode::OK => {
                let mut experiment: RemoteExperiment = serde_json::from_str(&body)?;
                apply_links(&mut experiment, &headers, &url);
                Ok(experiment)
            }
            StatusCode::NOT_FOUND => Err(response_error(
                status,
                &body,
                Some("experiment not found"),
            )),
            _ => Err(response_error(status, &body, None)),
        }
    }

    async fn next_trial(&self, url: &str) -> Result<NextTrial> {
        let url = Self::parse_url(url)?;
        let resp = self
            .request(reqwest::Method::POST, url.clone())
            .send()
            .await?;
        let status = resp.status();
        if let Some(answer) = next_trial_status(status) {
            return Ok(answer);
        }

        let location = resp
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(|l| resolve(&url, l));
        let body = resp.text().await?;
        if status != StatusCode::OK {
            return Err(response_error(status, &body, None));
        }

        let report_url =
            location.ok_or_else(|| Error::remote("suggestion is missing a Location header"))?;
        let parsed: AssignmentsBody = serde_json::from_str(&body)?;
        Ok(NextTrial::Assigned {
            assignments: parsed.assignments,
            report_url,
        })
    }

    async fn report_trial(&self, url: &str, values: &TrialValues) -> Result<()> {
        let url = Self::parse_url(url)?;
        let resp = self
            .request(reqwest::Method::POST, url)
            .json(values)
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        report_trial_result(status, &body)
    }

    async fn abandon_trial(&self, url: &str) -> Result<()> {
        let url = Self::parse_url(url)?;
        let resp = self.request(reqwest::Method::DELETE, url).send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        abandon_trial_result(status, &body)
    }
}
