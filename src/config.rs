//! Controller configuration
//!
//! Everything the reconcilers need from the environment is collected here and
//! handed to them through their contexts. Nothing is read from process-wide
//! state after start up.

use std::time::Duration;

use url::Url;

use crate::{Error, Result};

/// Built-in setup tools image
pub const DEFAULT_SETUP_IMAGE: &str = "setuptools:latest";

/// Pull policy for the built-in setup tools image
pub const DEFAULT_SETUP_IMAGE_PULL_POLICY: &str = "IfNotPresent";

/// Configuration shared by the trial and experiment reconcilers
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Base URL of the remote suggestion server; no remote calls when unset
    pub server_url: Option<Url>,
    /// Bearer token sent to the remote suggestion server
    pub server_token: Option<String>,
    /// Image used by setup tasks that do not name one
    pub setup_image: String,
    /// Pull policy for an environment `setup_image`; empty leaves it to the cluster
    pub setup_image_pull_policy: String,
    /// True when `setup_image` came from the environment rather than the built-in default
    pub setup_image_from_env: bool,
    /// Timeout for each remote request
    pub request_timeout: Duration,
    /// Requeue delay when the remote server has no suggestion available
    pub suggestion_backoff: Duration,
    /// Requeue delay while a create-mode setup job is running
    pub setup_poll_interval: Duration,
    /// Setup jobs that have not started a pod within this window are failed
    pub setup_startup_timeout: Duration,
    /// Requeue delay while waiting for patched workloads to stabilize
    pub stability_poll_interval: Duration,
    /// Requeue delay for a trial with nothing left to do but wait
    pub idle_requeue: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            server_token: None,
            setup_image: DEFAULT_SETUP_IMAGE.to_string(),
            setup_image_pull_policy: DEFAULT_SETUP_IMAGE_PULL_POLICY.to_string(),
            setup_image_from_env: false,
            request_timeout: Duration::from_secs(10),
            suggestion_backoff: Duration::from_secs(5),
            setup_poll_interval: Duration::from_secs(1),
            setup_startup_timeout: Duration::from_secs(120),
            stability_poll_interval: Duration::from_secs(5),
            idle_requeue: Duration::from_secs(60),
        }
    }
}

impl ControllerConfig {
    /// Set the remote server URL, validating it
    pub fn with_server_url(mut self, url: &str) -> Result<Self> {
        let mut parsed = Url::parse(url)
            .map_err(|e| Error::configuration(format!("invalid server URL '{url}': {e}")))?;
        // Url::join drops the last segment unless the path ends in a slash
        if !parsed.path().ends_with('/') {
            let path = format!("{}/", parsed.path());
            parsed.set_path(&path);
        }
        self.server_url = Some(parsed);
        Ok(self)
    }

    /// Use an image (and optional pull policy) from the environment for setup tasks
    pub fn with_setup_image(mut self, image: String, pull_policy: Option<String>) -> Self {
        if image.is_empty() {
            return self;
        }
        self.setup_image = image;
        self.setup_image_from_env = true;
        self.setup_image_pull_policy = pull_policy.unwrap_or_default();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ControllerConfig::default();
        assert!(config.server_url.is_none());
        assert_eq!(config.setup_image, "setuptools:latest");
        assert_eq!(config.setup_image_pull_policy, "IfNotPresent");
        assert!(!config.setup_image_from_env);
        assert_eq!(config.suggestion_backoff, Duration::from_secs(5));
        assert_eq!(config.setup_startup_timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_server_url_gets_trailing_slash() {
        let config = ControllerConfig::default()
            .with_server_url("https://api.example.com/v1")
            .unwrap();
        assert_eq!(
            config.server_url.unwrap().as_str(),
            "https://api.example.com/v1/"
        );
    }

    #[test]
    fn test_invalid_server_url_is_configuration_error() {
        let err = ControllerConfig::default()
            .with_server_url("not a url")
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_setup_image_from_environment() {
        let config = ControllerConfig::default()
            .with_setup_image("registry/setup:1.2".to_string(), Some("Always".to_string()));
        assert_eq!(config.setup_image, "registry/setup:1.2");
        assert_eq!(config.setup_image_pull_policy, "Always");
        assert!(config.setup_image_from_env);
    }

    #[test]
    fn test_empty_setup_image_keeps_default() {
        let config = ControllerConfig::default().with_setup_image(String::new(), None);
        assert_eq!(config.setup_image, DEFAULT_SETUP_IMAGE);
        assert!(!config.setup_image_from_env);
    }

    #[test]
    fn test_setup_image_without_policy_clears_the_builtin_one() {
        let config =
            ControllerConfig::default().with_setup_image("registry/setup:1.2".to_string(), None);
        assert!(config.setup_image_pull_policy.is_empty());
    }
}
