//! Agent configuration structures.

use std::{
    fmt,
    sync::{Arc, LazyLock},
};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;
use uuid::Uuid;

use crate::{
    errors::ApitallyError,
    types::{Request, Response},
};

/// Default Hub base URL.
pub(crate) const DEFAULT_HUB_BASE_URL: &str = "https://hub.apitally.io";
/// Environment variable overriding the Hub base URL.
pub(crate) const HUB_BASE_URL_ENV: &str = "APITALLY_HUB_BASE_URL";

/// Client ids must be version 4 UUIDs.
static CLIENT_ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?i)[0-9a-f]{8}-[0-9a-f]{4}-4[0-9a-f]{3}-[89ab][0-9a-f]{3}-[0-9a-f]{12}$")
        .expect("client id pattern is valid")
});

/// Environment names, validated after normalization.
static ENV_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\w-]{1,32}$").expect("env pattern is valid"));

/// Top-level agent configuration.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[non_exhaustive]
pub struct ApitallyConfig {
    /// Client id issued by the Hub. Must be a version 4 UUID.
    pub client_id: String,
    /// Environment name, e.g. `dev` or `prod`.
    ///
    /// Normalized to lowercase with underscores replaced by hyphens.
    #[serde(default = "ApitallyConfig::default_env")]
    pub env: String,
    /// Version of the host application, published with startup metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    /// Request detail logging configuration.
    #[serde(default)]
    pub request_logging: RequestLoggingConfig,
    /// Hub base URL override.
    ///
    /// When unset, the `APITALLY_HUB_BASE_URL` environment variable is
    /// consulted before falling back to the production Hub.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hub_base_url: Option<Url>,
}

impl ApitallyConfig {
    /// Create a configuration with default settings for the given client id.
    #[must_use]
    pub fn new(client_id: impl ToString) -> Self {
        Self {
            client_id: client_id.to_string(),
            env: Self::default_env(),
            app_version: None,
            request_logging: RequestLoggingConfig::default(),
            hub_base_url: None,
        }
    }

    /// Default value for [`Self::env`].
    #[must_use]
    #[inline]
    fn default_env() -> String {
        "dev".into()
    }

    /// Set the environment name.
    #[must_use]
    pub fn with_env(mut self, env: impl ToString) -> Self {
        self.env = env.to_string();
        self
    }

    /// Set the host application version.
    #[must_use]
    pub fn with_app_version(mut self, app_version: impl ToString) -> Self {
        self.app_version = Some(app_version.to_string());
        self
    }

    /// Set the request detail logging configuration.
    #[must_use]
    pub fn with_request_logging(mut self, request_logging: RequestLoggingConfig) -> Self {
        self.request_logging = request_logging;
        self
    }

    /// Set the Hub base URL, overriding environment and default.
    #[must_use]
    pub fn with_hub_base_url(mut self, hub_base_url: Url) -> Self {
        self.hub_base_url = Some(hub_base_url);
        self
    }

    /// Validate and parse the configured client id.
    pub(crate) fn validated_client_id(&self) -> Result<Uuid, ApitallyError> {
        if !CLIENT_ID_PATTERN.is_match(&self.client_id) {
            return Err(ApitallyError::InvalidClientId(self.client_id.clone()));
        }
        Uuid::try_parse(&self.client_id)
            .map_err(|_| ApitallyError::InvalidClientId(self.client_id.clone()))
    }

    /// Normalize and validate the configured environment name.
    pub(crate) fn normalized_env(&self) -> Result<String, ApitallyError> {
        let env = self.env.trim().to_lowercase().replace('_', "-");
        if !ENV_PATTERN.is_match(&env) {
            return Err(ApitallyError::InvalidEnv(self.env.clone()));
        }
        Ok(env)
    }

    /// Resolve the Hub base URL from configuration, environment or default.
    pub(crate) fn resolved_hub_base_url(&self) -> Url {
        if let Some(url) = &self.hub_base_url {
            return url.clone();
        }
        if let Ok(value) = std::env::var(HUB_BASE_URL_ENV) {
            match Url::parse(&value) {
                Ok(url) => return url,
                Err(err) => {
                    warn!(error = %err, %value, "ignoring invalid {HUB_BASE_URL_ENV}");
                }
            }
        }
        Url::parse(DEFAULT_HUB_BASE_URL).expect("default hub base URL is valid")
    }
}

/// Callback masking a request body. Returning `None` drops the body.
pub type MaskRequestBodyCallback = Arc<dyn Fn(&Request) -> Option<Vec<u8>> + Send + Sync>;
/// Callback masking a response body. Returning `None` drops the body.
pub type MaskResponseBodyCallback =
    Arc<dyn Fn(&Request, &Response) -> Option<Vec<u8>> + Send + Sync>;
/// Callback excluding whole requests from detail logging.
pub type ExcludeCallback = Arc<dyn Fn(&Request, &Response) -> bool + Send + Sync>;

/// Request detail logging configuration.
#[derive(Clone, Deserialize, Serialize)]
#[non_exhaustive]
pub struct RequestLoggingConfig {
    /// Whether request detail logging is enabled at all.
    #[serde(default)]
    pub enabled: bool,
    /// Include query parameters in logged URLs.
    #[serde(default = "crate::util::default_true")]
    pub log_query_params: bool,
    /// Include request headers.
    #[serde(default)]
    pub log_request_headers: bool,
    /// Include request bodies (JSON and plain-text content types only).
    #[serde(default)]
    pub log_request_body: bool,
    /// Include response headers.
    #[serde(default = "crate::util::default_true")]
    pub log_response_headers: bool,
    /// Include response bodies (JSON and plain-text content types only).
    #[serde(default)]
    pub log_response_body: bool,
    /// Include details of unhandled errors.
    #[serde(default = "crate::util::default_true")]
    pub log_exception: bool,
    /// Include application log lines captured during the request.
    #[serde(default)]
    pub capture_logs: bool,
    /// Additional query parameter name patterns to mask.
    #[serde(default)]
    pub mask_query_params: Vec<String>,
    /// Additional header name patterns to mask.
    #[serde(default)]
    pub mask_headers: Vec<String>,
    /// Additional body field name patterns to mask.
    #[serde(default)]
    pub mask_body_fields: Vec<String>,
    /// Additional path patterns to exclude from logging.
    #[serde(default)]
    pub exclude_paths: Vec<String>,
    /// Custom request body masking callback.
    #[serde(skip)]
    pub mask_request_body_callback: Option<MaskRequestBodyCallback>,
    /// Custom response body masking callback.
    #[serde(skip)]
    pub mask_response_body_callback: Option<MaskResponseBodyCallback>,
    /// Custom request exclusion callback.
    #[serde(skip)]
    pub exclude_callback: Option<ExcludeCallback>,
}

impl Default for RequestLoggingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            log_query_params: true,
            log_request_headers: false,
            log_request_body: false,
            log_response_headers: true,
            log_response_body: false,
            log_exception: true,
            capture_logs: false,
            mask_query_params: Vec::new(),
            mask_headers: Vec::new(),
            mask_body_fields: Vec::new(),
            exclude_paths: Vec::new(),
            mask_request_body_callback: None,
            mask_response_body_callback: None,
            exclude_callback: None,
        }
    }
}

impl fmt::Debug for RequestLoggingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestLoggingConfig")
            .field("enabled", &self.enabled)
            .field("log_query_params", &self.log_query_params)
            .field("log_request_headers", &self.log_request_headers)
            .field("log_request_body", &self.log_request_body)
            .field("log_response_headers", &self.log_response_headers)
            .field("log_response_body", &self.log_response_body)
            .field("log_exception", &self.log_exception)
            .field("capture_logs", &self.capture_logs)
            .field("mask_query_params", &self.mask_query_params)
            .field("mask_headers", &self.mask_headers)
            .field("mask_body_fields", &self.mask_body_fields)
            .field("exclude_paths", &self.exclude_paths)
            .finish_non_exhaustive()
    }
}

impl RequestLoggingConfig {
    /// Create a configuration with logging enabled and default settings.
    #[must_use]
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    /// Set whether query parameters are logged.
    #[must_use]
    pub fn with_query_params(mut self, log: bool) -> Self {
        self.log_query_params = log;
        self
    }

    /// Set whether request headers are logged.
    #[must_use]
    pub fn with_request_headers(mut self, log: bool) -> Self {
        self.log_request_headers = log;
        self
    }

    /// Set whether request bodies are logged.
    #[must_use]
    pub fn with_request_body(mut self, log: bool) -> Self {
        self.log_request_body = log;
        self
    }

    /// Set whether response headers are logged.
    #[must_use]
    pub fn with_response_headers(mut self, log: bool) -> Self {
        self.log_response_headers = log;
        self
    }

    /// Set whether response bodies are logged.
    #[must_use]
    pub fn with_response_body(mut self, log: bool) -> Self {
        self.log_response_body = log;
        self
    }

    /// Set whether unhandled error details are logged.
    #[must_use]
    pub fn with_exception(mut self, log: bool) -> Self {
        self.log_exception = log;
        self
    }

    /// Set whether captured application logs are attached.
    #[must_use]
    pub fn with_capture_logs(mut self, capture: bool) -> Self {
        self.capture_logs = capture;
        self
    }

    /// Add query parameter name patterns to mask.
    #[must_use]
    pub fn with_mask_query_params<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        self.mask_query_params
            .extend(patterns.into_iter().map(|pattern| pattern.to_string()));
        self
    }

    /// Add header name patterns to mask.
    #[must_use]
    pub fn with_mask_headers<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        self.mask_headers
            .extend(patterns.into_iter().map(|pattern| pattern.to_string()));
        self
    }

    /// Add body field name patterns to mask.
    #[must_use]
    pub fn with_mask_body_fields<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        self.mask_body_fields
            .extend(patterns.into_iter().map(|pattern| pattern.to_string()));
        self
    }

    /// Add path patterns to exclude from logging.
    #[must_use]
    pub fn with_exclude_paths<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        self.exclude_paths
            .extend(patterns.into_iter().map(|pattern| pattern.to_string()));
        self
    }

    /// Set a custom request body masking callback.
    #[must_use]
    pub fn with_mask_request_body_callback(
        mut self,
        callback: impl Fn(&Request) -> Option<Vec<u8>> + Send + Sync + 'static,
    ) -> Self {
        self.mask_request_body_callback = Some(Arc::new(callback));
        self
    }

    /// Set a custom response body masking callback.
    #[must_use]
    pub fn with_mask_response_body_callback(
        mut self,
        callback: impl Fn(&Request, &Response) -> Option<Vec<u8>> + Send + Sync + 'static,
    ) -> Self {
        self.mask_response_body_callback = Some(Arc::new(callback));
        self
    }

    /// Set a custom request exclusion callback.
    #[must_use]
    pub fn with_exclude_callback(
        mut self,
        callback: impl Fn(&Request, &Response) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.exclude_callback = Some(Arc::new(callback));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLIENT_ID: &str = "076f0b05-4d67-4981-86b9-7d7a1dd4b210";

    #[test]
    fn valid_client_id_parses() {
        let config = ApitallyConfig::new(CLIENT_ID);
        assert_eq!(config.validated_client_id().unwrap().to_string(), CLIENT_ID);
        // Case-insensitive.
        let config = ApitallyConfig::new(CLIENT_ID.to_uppercase());
        assert!(config.validated_client_id().is_ok());
    }

    #[test]
    fn invalid_client_ids_are_rejected() {
        for client_id in [
            "",
            "not-a-uuid",
            // Valid UUID but not version 4.
            "076f0b05-4d67-1981-86b9-7d7a1dd4b210",
            // Invalid variant nibble.
            "076f0b05-4d67-4981-c6b9-7d7a1dd4b210",
        ] {
            let config = ApitallyConfig::new(client_id);
            assert_eq!(
                config.validated_client_id(),
                Err(ApitallyError::InvalidClientId(client_id.to_owned())),
                "{client_id:?} should be rejected"
            );
        }
    }

    #[test]
    fn env_is_normalized() {
        let config = ApitallyConfig::new(CLIENT_ID).with_env("  My_Env  ");
        assert_eq!(config.normalized_env().unwrap(), "my-env");
    }

    #[test]
    fn invalid_envs_are_rejected() {
        for env in ["", "has spaces", "x".repeat(33).as_str()] {
            let config = ApitallyConfig::new(CLIENT_ID).with_env(env);
            assert_eq!(
                config.normalized_env(),
                Err(ApitallyError::InvalidEnv(env.to_owned())),
                "{env:?} should be rejected"
            );
        }
    }

    #[test]
    fn request_logging_defaults() {
        let config: RequestLoggingConfig = serde_json::from_str("{}").unwrap();
        assert!(!config.enabled);
        assert!(config.log_query_params);
        assert!(!config.log_request_headers);
        assert!(config.log_response_headers);
        assert!(config.log_exception);
        assert!(!config.capture_logs);
    }

    #[test]
    fn configured_hub_base_url_wins() {
        let url = Url::parse("http://localhost:1234").unwrap();
        let config = ApitallyConfig::new(CLIENT_ID).with_hub_base_url(url.clone());
        assert_eq!(config.resolved_hub_base_url(), url);
    }
}
