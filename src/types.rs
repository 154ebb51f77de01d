//! Framework-agnostic ingress types and Hub wire schemas.
//!
//! Framework adapters translate their native request/response objects into
//! these structs and feed them into the client. Everything that crosses the
//! wire serializes with [`serde`]; body bytes are emitted as base64 strings.

use std::collections::BTreeMap;

use serde::Serialize;
use uuid::Uuid;

use crate::{
    consumers::Consumer,
    error_counters::{ServerErrorsItem, ValidationErrorsItem},
    requests::RequestsItem,
};

/// Completed HTTP request, as observed by a framework adapter.
#[derive(Clone, Debug, Serialize)]
#[non_exhaustive]
pub struct Request {
    /// Unix timestamp (seconds) at which the request was received.
    pub timestamp: f64,
    /// Identifier of the consumer attached to this request, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consumer: Option<String>,
    /// HTTP request method.
    pub method: String,
    /// Matched route template, e.g. `/items/:id`. Not the concrete URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Full request URL.
    pub url: String,
    /// Request headers as name/value pairs. Repeated names are allowed.
    pub headers: Vec<(String, String)>,
    /// Request body size in bytes, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
    /// Raw request body.
    #[serde(with = "base64_bytes", skip_serializing_if = "Option::is_none")]
    pub body: Option<Vec<u8>>,
}

impl Request {
    /// Create a request record with the current timestamp and no optional parts.
    #[must_use]
    pub fn new(method: impl ToString, url: impl ToString) -> Self {
        Self {
            timestamp: crate::util::unix_now(),
            consumer: None,
            method: method.to_string(),
            path: None,
            url: url.to_string(),
            headers: Vec::new(),
            size: None,
            body: None,
        }
    }

    /// Value of the first header with the given name, compared case-insensitively.
    #[must_use]
    pub(crate) fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Completed HTTP response, as observed by a framework adapter.
#[derive(Clone, Debug, Serialize)]
#[non_exhaustive]
pub struct Response {
    /// HTTP response status code.
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    /// Total request handling time in seconds.
    #[serde(rename = "responseTime")]
    pub response_time: f64,
    /// Response headers as name/value pairs.
    pub headers: Vec<(String, String)>,
    /// Response body size in bytes, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
    /// Raw response body.
    #[serde(with = "base64_bytes", skip_serializing_if = "Option::is_none")]
    pub body: Option<Vec<u8>>,
}

impl Response {
    /// Create a response record with no optional parts.
    #[must_use]
    pub fn new(status_code: u16, response_time: f64) -> Self {
        Self {
            status_code,
            response_time,
            headers: Vec::new(),
            size: None,
            body: None,
        }
    }

    /// Value of the first header with the given name, compared case-insensitively.
    #[must_use]
    pub(crate) fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Unhandled error raised while serving a request.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ExceptionInfo {
    /// Error type name.
    pub error_type: String,
    /// Error message.
    pub message: String,
    /// Rendered stack trace or backtrace, one frame per line.
    pub stacktrace: String,
}

impl ExceptionInfo {
    /// Create an exception record.
    #[must_use]
    pub fn new(error_type: impl ToString, message: impl ToString, stacktrace: impl ToString) -> Self {
        Self {
            error_type: error_type.to_string(),
            message: message.to_string(),
            stacktrace: stacktrace.to_string(),
        }
    }
}

/// Application log line captured while serving a request.
#[derive(Clone, Debug, Serialize)]
#[non_exhaustive]
pub struct LogRecord {
    /// Unix timestamp (seconds) of the log event.
    pub timestamp: f64,
    /// Name of the emitting logger or target, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logger: Option<String>,
    /// Log level as a lowercase string.
    pub level: String,
    /// Log message text.
    pub message: String,
}

/// A single declared route of the host application.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PathInfo {
    /// HTTP method.
    pub method: String,
    /// Route template.
    pub path: String,
}

impl PathInfo {
    /// Create a route entry.
    #[must_use]
    pub fn new(method: impl ToString, path: impl ToString) -> Self {
        Self {
            method: method.to_string(),
            path: path.to_string(),
        }
    }
}

/// One-time startup metadata published to the Hub.
#[derive(Clone, Debug)]
pub(crate) struct StartupData {
    /// Declared routes of the host application.
    pub(crate) paths: Vec<PathInfo>,
    /// Runtime and framework versions, name to version string.
    pub(crate) versions: BTreeMap<String, String>,
    /// Client identification, `<language>:<framework>`.
    pub(crate) client: String,
}

/// Wire payload for the `startup` Hub endpoint.
#[derive(Debug, Serialize)]
pub(crate) struct StartupPayload {
    pub(crate) instance_uuid: Uuid,
    pub(crate) message_uuid: Uuid,
    pub(crate) paths: Vec<PathInfo>,
    pub(crate) versions: BTreeMap<String, String>,
    pub(crate) client: String,
}

/// Wire payload for the `sync` Hub endpoint.
///
/// Built once per scheduler tick by draining all counters, then held in the
/// retry queue until delivered or expired.
#[derive(Debug, Serialize)]
pub(crate) struct SyncPayload {
    /// Unix seconds at which this payload was built.
    pub(crate) timestamp: f64,
    pub(crate) instance_uuid: Uuid,
    pub(crate) message_uuid: Uuid,
    pub(crate) requests: Vec<RequestsItem>,
    pub(crate) validation_errors: Vec<ValidationErrorsItem>,
    pub(crate) server_errors: Vec<ServerErrorsItem>,
    pub(crate) consumers: Vec<Consumer>,
}

/// Serde helper emitting `Option<Vec<u8>>` as a base64 string.
pub(crate) mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::Serializer;

    pub(crate) fn serialize<S>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, to_value};

    use super::*;

    #[test]
    fn response_serializes_with_wire_names() {
        let mut resp = Response::new(200, 0.123);
        resp.headers.push(("Content-Type".into(), "application/json".into()));
        resp.body = Some(b"{}".to_vec());
        let value = to_value(&resp).unwrap();
        assert_eq!(value["statusCode"], json!(200));
        assert_eq!(value["responseTime"], json!(0.123));
        assert_eq!(value["body"], json!("e30="));
        assert!(value.get("size").is_none());
    }

    #[test]
    fn request_header_lookup_is_case_insensitive() {
        let mut req = Request::new("GET", "http://test/hello");
        req.headers.push(("User-Agent".into(), "curl/8".into()));
        assert_eq!(req.header("user-agent"), Some("curl/8"));
        assert_eq!(req.header("x-missing"), None);
    }
}
