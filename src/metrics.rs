//! Metric capture for finished trials
//!
//! Three collection types are supported:
//! - `local`: the rendered query is the value
//! - `prometheus`: a scalar PromQL query evaluated at the trial completion time
//! - `jsonpath`: a dotted path (`{.a.b}`) evaluated against a JSON document
//!
//! Prometheus and JSON path metrics are served by the services matched by
//! the metric selector; the services are listed by the caller.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
#[cfg(test)]
use mockall::automock;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::crd::{Metric, MetricType, Trial};
use crate::template::TemplateEngine;
use crate::{Error, Result};

/// Delay before retrying a capture whose data is not scraped yet
pub const CAPTURE_RETRY: Duration = Duration::from_secs(5);

/// Result of one capture attempt
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Capture {
    /// A value and its optional standard deviation
    Value {
        /// Observed value, may be NaN when the source had no data
        value: f64,
        /// Standard deviation
        error: Option<f64>,
    },
    /// The data is not available yet; try again without counting an attempt
    RetryAfter(Duration),
}

/// HTTP access to the services metrics are collected from
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MetricFetcher: Send + Sync {
    /// True once every healthy Prometheus target has been scraped after `at`
    async fn prometheus_targets_ready(&self, base_url: &str, at: DateTime<Utc>) -> Result<bool>;

    /// Evaluate an instant query that must produce a scalar
    async fn prometheus_scalar(&self, base_url: &str, query: &str, at: DateTime<Utc>)
        -> Result<f64>;

    /// Fetch a JSON document, None when the server did not answer 200
    async fn fetch_json(&self, url: &str) -> Result<Option<Value>>;
}

/// reqwest-backed [`MetricFetcher`]
pub struct HttpMetricFetcher {
    client: reqwest::Client,
}

impl HttpMetricFetcher {
    /// Create a fetcher whose requests time out after `timeout`
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[derive(Deserialize)]
struct PromResponse {
    status: String,
    #[serde(default)]
    data: Option<PromData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromData {
    #[serde(default)]
    result_type: Option<String>,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    active_targets: Vec<PromTarget>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromTarget {
    health: String,
    last_scrape: DateTime<Utc>,
}

fn prom_data(resp: PromResponse) -> Result<PromData> {
    if resp.status != "success" {
        return Err(Error::metric(
            resp.error.unwrap_or_else(|| "prometheus query failed".to_string()),
        ));
    }
    resp.data
        .ok_or_else(|| Error::metric("prometheus response has no data"))
}

/// Extract the value of a scalar query result
fn scalar_value(data: &PromData) -> Result<f64> {
    let result_type = data.result_type.as_deref().unwrap_or_default();
    if result_type != "scalar" {
        return Err(Error::metric(format!(
            "expected scalar query result, got {result_type}"
        )));
    }
    // [ <unix time>, "<value>" ]
    let raw = data.result[1]
        .as_str()
        .ok_or_else(|| Error::metric("malformed scalar query result"))?;
    parse_float(raw)
}

fn parse_float(raw: &str) -> Result<f64> {
    match raw {
        "NaN" => Ok(f64::NAN),
        "+Inf" => Ok(f64::INFINITY),
        "-Inf" => Ok(f64::NEG_INFINITY),
        _ => raw
            .trim()
            .parse()
            .map_err(|_| Error::metric(format!("could not parse '{raw}' as a number"))),
    }
}

#[async_trait]
impl MetricFetcher for HttpMetricFetcher {
    async fn prometheus_targets_ready(&self, base_url: &str, at: DateTime<Utc>) -> Result<bool> {
        let url = format!("{}/api/v1/targets", base_url.trim_end_matches('/'));
        let resp: PromResponse = self
            .client
            .get(&url)
            .query(&[("state", "active")])
            .send()
            .await?
            .json()
            .await?;
        let data = prom_data(resp)?;
        Ok(data
            .active_targets
            .iter()
            .filter(|t| t.health == "up")
            .all(|t| t.last_scrape >= at))
    }

    async fn prometheus_scalar(
        &self,
        base_url: &str,
        query: &str,
        at: DateTime<Utc>,
    ) -> Result<f64> {
        let url = format!("{}/api/v1/query", base_url.trim_end_matches('/'));
        let time = at.to_rfc3339_opts(SecondsFormat::Secs, true);
        let resp: PromResponse = self
            .client
            .get(&url)
            .query(&[("query", query), ("time", time.as_str())])
            .send()
            .await?
            .json()
            .await?;
        scalar_value(&prom_data(resp)?)
    }

    async fn fetch_json(&self, url: &str) -> Result<Option<Value>> {
        let resp = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;
        if resp.status() != reqwest::StatusCode::OK {
            return Ok(None);
        }
        Ok(Some(resp.json().await?))
    }
}

/// Build one URL per matched service, addressing services by cluster IP
pub fn service_urls(metric: &Metric, services: &[Service]) -> Result<Vec<String>> {
    let scheme = metric
        .scheme
        .as_deref()
        .map(str::to_lowercase)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "http".to_string());
    if scheme != "http" && scheme != "https" {
        return Err(Error::configuration(format!(
            "scheme must be 'http' or 'https': {scheme}"
        )));
    }
    let path = format!(
        "/{}",
        metric.path.as_deref().unwrap_or_default().trim_start_matches('/')
    );

    let mut urls = Vec::with_capacity(services.len());
    for svc in services {
        let Some(spec) = &svc.spec else { continue };
        let host = spec.cluster_ip.as_deref().unwrap_or_default();
        let ports = spec.ports.as_deref().unwrap_or_default();

        let port = match &metric.port {
            Some(IntOrString::Int(p)) if *p > 0 => Some(*p),
            other => {
                let name = match other {
                    Some(IntOrString::String(s)) => s.as_str(),
                    _ => "",
                };
                ports
                    .iter()
                    .find(|sp| sp.name.as_deref() == Some(name) || ports.len() == 1)
                    .map(|sp| sp.port)
            }
        };
        let Some(port) = port else {
            let requested = match &metric.port {
                Some(IntOrString::Int(p)) => p.to_string(),
                Some(IntOrString::String(s)) => s.clone(),
                None => String::new(),
            };
            return Err(Error::configuration(format!(
                "metric '{}' has unresolvable port: {requested}",
                metric.name
            )));
        };
        urls.push(format!("{scheme}://{host}:{port}{path}"));
    }

    if urls.is_empty() {
        return Err(Error::metric(format!(
            "unable to find metric targets for '{}'",
            metric.name
        )));
    }
    Ok(urls)
}

/// Evaluate a `{.a.b}` path against a document
///
/// Numeric segments index into arrays. The match must be a number or a
/// string holding one.
pub fn eval_json_path(doc: &Value, path: &str) -> Result<f64> {
    let inner = path
        .trim()
        .strip_prefix('{')
        .and_then(|p| p.strip_suffix('}'))
        .unwrap_or(path.trim());
    let mut current = doc;
    for segment in inner.split('.').filter(|s| !s.is_empty()) {
        let next = match segment.parse::<usize>() {
            Ok(i) => current.get(i),
            Err(_) => current.get(segment),
        };
        current = next.ok_or_else(|| Error::metric(format!("query '{path}' did not match")))?;
    }
    match current {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| Error::metric("could not convert match to a floating point number")),
        Value::String(s) => parse_float(s),
        _ => Err(Error::metric(
            "could not convert match to a floating point number",
        )),
    }
}

/// Capture one metric for a finished trial
///
/// `services` are the services matched by the metric selector in the
/// trial's target namespace; local metrics ignore them.
pub async fn capture_metric(
    metric: &Metric,
    trial: &Trial,
    services: &[Service],
    engine: &TemplateEngine,
    fetcher: &dyn MetricFetcher,
) -> Result<Capture> {
    let (query, error_query) = engine.render_metric_queries(metric, trial)?;

    match metric.type_ {
        MetricType::Local => {
            let value = parse_float(&query)?;
            Ok(Capture::Value { value, error: None })
        }
        MetricType::Prometheus => {
            let completion = trial
                .status
                .as_ref()
                .and_then(|s| s.completion_time)
                .ok_or_else(|| Error::metric("trial has not completed"))?;
            let mut last_err = None;
            for url in service_urls(metric, services)? {
                match capture_prometheus(&url, &query, error_query.as_deref(), completion, fetcher)
                    .await
                {
                    Ok(capture) => return Ok(capture),
                    Err(e) => {
                        debug!(
                            metric = %metric.name,
                            url = %url,
                            error = %e,
                            "prometheus capture failed"
                        );
                        last_err = Some(e);
                    }
                }
            }
            Err(last_err.unwrap_or_else(|| Error::metric("no prometheus targets")))
        }
        MetricType::Jsonpath => {
            let mut last_err = None;
            for url in service_urls(metric, services)? {
                match fetcher.fetch_json(&url).await {
                    Ok(Some(doc)) => {
                        let value = eval_json_path(&doc, &query)?;
                        return Ok(Capture::Value { value, error: None });
                    }
                    Ok(None) => {
                        return Ok(Capture::Value {
                            value: f64::NAN,
                            error: None,
                        })
                    }
                    Err(e) => last_err = Some(e),
                }
            }
            Err(last_err.unwrap_or_else(|| Error::metric("no json path targets")))
        }
    }
}

async fn capture_prometheus(
    url: &str,
    query: &str,
    error_query: Option<&str>,
    at: DateTime<Utc>,
    fetcher: &dyn MetricFetcher,
) -> Result<Capture> {
    if !fetcher.prometheus_targets_ready(url, at).await? {
        return Ok(Capture::RetryAfter(CAPTURE_RETRY));
    }

    let value = fetcher.prometheus_scalar(url, query, at).await?;
    if value.is_nan() {
        let mut message = "metric data not available".to_string();
        if query.starts_with("scalar(") {
            message.push_str(
                " (the scalar function may have received an input vector whose size is not 1)",
            );
        }
        return Err(Error::metric(message));
    }

    let error = match error_query {
        Some(q) => Some(fetcher.prometheus_scalar(url, q, at).await?).filter(|e| !e.is_nan()),
        None => None,
    };
    Ok(Capture::Value { value, error })
}
