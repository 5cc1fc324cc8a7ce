//! Error types for the trialops operator

use thiserror::Error;

/// Main error type for trialops operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Transport error talking to the remote server or a metric endpoint
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The remote suggestion service rejected or failed a request
    #[error("remote error: {0}")]
    Remote(String),

    /// A trial or experiment is configured in a way that cannot be executed
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Validation error for CRD specs
    #[error("validation error: {0}")]
    Validation(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Metric capture failed
    #[error("metric error: {0}")]
    Metric(String),

    /// A patch, Helm value or metric query template failed to render
    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),
}

impl Error {
    /// Create a remote error with the given message
    pub fn remote(msg: impl Into<String>) -> Self {
        Self::Remote(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a metric error with the given message
    pub fn metric(msg: impl Into<String>) -> Self {
        Self::Metric(msg.into())
    }

    /// True when the API server rejected a write because the stored
    /// resource version moved on (HTTP 409)
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Kube(kube::Error::Api(ae)) if ae.code == 409)
    }

    /// True when the API server reported the object as missing (HTTP 404)
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Kube(kube::Error::Api(ae)) if ae.code == 404)
    }

    /// True for failures that may go away by asking again: lost
    /// connections, timeouts, throttling and server side errors
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Kube(kube::Error::Api(ae)) => ae.code == 429 || ae.code >= 500,
            Self::Kube(_) => true,
            Self::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().is_some_and(|s| s.is_server_error())
            }
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(test)]
pub(crate) fn api_error(code: u16, reason: &str) -> Error {
    Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{reason} (test)"),
        reason: reason.to_string(),
        code,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==========================================================================
    // Story Tests: Error Categories in the Reconcile Loop
    // ==========================================================================
    //
    // The reconcilers treat each category differently: conflicts requeue
    // immediately, configuration errors block one resource until its spec is
    // fixed, remote errors retry with backoff.

    /// Story: A concurrent writer bumped the trial's resource version
    ///
    /// The status patch fails with 409 and the reconciler must recognise it
    /// as "try again with a fresh copy" rather than a real failure.
    #[test]
    fn story_conflict_is_recognised() {
        let err = api_error(409, "Conflict");
        assert!(err.is_conflict());
        assert!(!err.is_not_found());
        assert!(err.to_string().contains("kubernetes error"));
    }

    /// Story: The experiment was deleted between list and get
    #[test]
    fn story_not_found_is_recognised() {
        let err = api_error(404, "NotFound");
        assert!(err.is_not_found());
        assert!(!err.is_conflict());
        assert!(!err.is_transient());
    }

    /// Story: The API server is overloaded and asks clients to slow down
    #[test]
    fn story_throttling_and_server_errors_are_transient() {
        assert!(api_error(429, "TooManyRequests").is_transient());
        assert!(api_error(503, "ServiceUnavailable").is_transient());
        assert!(!api_error(422, "Invalid").is_transient());
    }

    /// Story: A Helm value points at a parameter the experiment never defined
    ///
    /// Job construction aborts with a configuration error that names the
    /// offending value so the user can correct the trial template.
    #[test]
    fn story_configuration_errors_name_the_problem() {
        let err = Error::configuration(
            "invalid parameter reference 'memory' for Helm value 'resources.limits.memory'",
        );
        assert!(err.to_string().contains("configuration error"));
        assert!(err.to_string().contains("'memory'"));

        match Error::configuration("any") {
            Error::Configuration(msg) => assert_eq!(msg, "any"),
            _ => panic!("Expected Configuration variant"),
        }
    }

    /// Story: The remote server answered with an unexpected status
    #[test]
    fn story_remote_errors_surface_server_message() {
        let err = Error::remote("unexpected server response: 500 Internal Server Error");
        assert!(err.to_string().starts_with("remote error"));
        assert!(!err.is_conflict());
    }

    /// Story: Serialization failures from serde convert automatically
    #[test]
    fn story_serde_errors_convert() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{not json");
        let err: Error = parse.unwrap_err().into();
        assert!(matches!(err, Error::Serialization(_)));
        assert!(!err.is_transient());

        let err = Error::metric("capturing metric latency got NaN");
        assert!(err.to_string().contains("NaN"));
        let err = Error::validation("trial t1 is missing assignments for cpu");
        assert!(err.to_string().contains("missing assignments"));
    }
}
