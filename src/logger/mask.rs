//! Masking and exclusion policy for request log records.

use regex::{Regex, RegexSet};
use tracing::warn;
use url::Url;

/// Replacement value for masked query params, headers and body fields.
pub(crate) const MASKED: &str = "******";

/// Paths that never produce detail log records.
const EXCLUDE_PATH_PATTERNS: &[&str] = &[
    r"/_?healthz?$",
    r"/_?health[_-]?checks?$",
    r"/_?heart[_-]?beats?$",
    r"/ping$",
    r"/ready$",
    r"/live$",
];

/// User agents of well-known health check probes.
const EXCLUDE_USER_AGENT_PATTERNS: &[&str] = &[
    r"health[-_ ]?check",
    r"googlehc",
    r"kube-probe",
    r"microsoft-azure-application-lb",
];

/// Query parameter names that are always masked.
const MASK_QUERY_PARAM_PATTERNS: &[&str] = &[
    r"auth", r"api-?key", r"secret", r"token", r"password", r"pwd", r"cookie",
];

/// Header names that are always masked.
const MASK_HEADER_PATTERNS: &[&str] = &[
    r"auth", r"api-?key", r"secret", r"token", r"password", r"pwd", r"cookie",
];

/// Body field names that are always masked.
const MASK_BODY_FIELD_PATTERNS: &[&str] = &[
    r"password", r"token", r"secret", r"auth", r"card[-_ ]?number", r"ccv", r"ssn",
];

/// Compiled exclusion and masking rules, built-in patterns merged with
/// user-configured ones.
#[derive(Debug)]
pub(crate) struct MaskPolicy {
    exclude_paths: RegexSet,
    exclude_user_agents: RegexSet,
    mask_query_params: RegexSet,
    mask_headers: RegexSet,
    mask_body_fields: RegexSet,
}

impl MaskPolicy {
    pub(crate) fn new(
        exclude_paths: &[String],
        mask_query_params: &[String],
        mask_headers: &[String],
        mask_body_fields: &[String],
    ) -> Self {
        Self {
            exclude_paths: build_set(EXCLUDE_PATH_PATTERNS, exclude_paths),
            exclude_user_agents: build_set(EXCLUDE_USER_AGENT_PATTERNS, &[]),
            mask_query_params: build_set(MASK_QUERY_PARAM_PATTERNS, mask_query_params),
            mask_headers: build_set(MASK_HEADER_PATTERNS, mask_headers),
            mask_body_fields: build_set(MASK_BODY_FIELD_PATTERNS, mask_body_fields),
        }
    }

    pub(crate) fn is_excluded_path(&self, path: &str) -> bool {
        self.exclude_paths.is_match(path)
    }

    pub(crate) fn is_excluded_user_agent(&self, user_agent: &str) -> bool {
        self.exclude_user_agents.is_match(user_agent)
    }

    pub(crate) fn should_mask_body_field(&self, name: &str) -> bool {
        self.mask_body_fields.is_match(name)
    }

    /// Mask matching query parameter values in a URL, leaving the rest as-is.
    ///
    /// URLs that fail to parse are returned unchanged.
    pub(crate) fn mask_url_query(&self, url: &str) -> String {
        let Ok(mut parsed) = Url::parse(url) else {
            return url.to_owned();
        };
        if parsed.query().is_none() {
            return url.to_owned();
        }
        let pairs: Vec<(String, String)> = parsed
            .query_pairs()
            .map(|(name, value)| {
                let value = if self.mask_query_params.is_match(&name) {
                    MASKED.to_owned()
                } else {
                    value.into_owned()
                };
                (name.into_owned(), value)
            })
            .collect();
        parsed
            .query_pairs_mut()
            .clear()
            .extend_pairs(pairs.iter().map(|(name, value)| (name, value)));
        parsed.into()
    }

    /// Mask matching header values in place.
    pub(crate) fn mask_headers(&self, headers: &mut [(String, String)]) {
        for (name, value) in headers {
            if self.mask_headers.is_match(name) {
                *value = MASKED.to_owned();
            }
        }
    }

    /// Recursively mask matching fields of a JSON document.
    pub(crate) fn mask_body_fields(&self, value: &mut serde_json::Value) {
        match value {
            serde_json::Value::Object(map) => {
                for (name, field) in map {
                    if self.should_mask_body_field(name) {
                        *field = serde_json::Value::String(MASKED.to_owned());
                    } else {
                        self.mask_body_fields(field);
                    }
                }
            }
            serde_json::Value::Array(items) => {
                for item in items {
                    self.mask_body_fields(item);
                }
            }
            _ => {}
        }
    }
}

/// Compile built-in and user patterns into a case-insensitive set.
///
/// Invalid user patterns are skipped with a warning.
fn build_set(builtin: &[&str], user: &[String]) -> RegexSet {
    let patterns = builtin
        .iter()
        .map(|pattern| format!("(?i:{pattern})"))
        .chain(user.iter().filter_map(|pattern| {
            let wrapped = format!("(?i:{pattern})");
            if Regex::new(&wrapped).is_ok() {
                Some(wrapped)
            } else {
                warn!(pattern, "ignoring invalid pattern");
                None
            }
        }));
    RegexSet::new(patterns).unwrap_or_else(|_| RegexSet::empty())
}
