//! Fingerprinted aggregation of validation and server errors.
//!
//! Both counters follow the same pattern: a count per fingerprint, plus the
//! full details of the first occurrence as a sample. Fingerprints are MD5
//! digests over the identifying attributes, so they are stable across
//! platforms and processes.

use std::collections::HashMap;

use md5::{Digest, Md5};
use parking_lot::Mutex;
use serde::Serialize;

use crate::{
    types::ExceptionInfo,
    util::{current_sentry_event_id, truncate_chars, truncate_lines},
};

/// Maximum length of an emitted error message, in characters.
const MAX_MSG_LEN: usize = 2048;
/// Maximum length of an emitted stack trace, in characters.
const MAX_STACKTRACE_LEN: usize = 65_536;

/// MD5 fingerprint over the given key attributes, as a hex string.
fn fingerprint<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    let mut hasher = Md5::new();
    let mut first = true;
    for part in parts {
        if !first {
            hasher.update(b"|");
        }
        hasher.update(part.as_bytes());
        first = false;
    }
    hex::encode(hasher.finalize())
}

/// Full details of a validation error, kept for the first occurrence.
#[derive(Debug)]
struct ValidationErrorDetails {
    consumer: Option<String>,
    method: String,
    path: String,
    loc: String,
    msg: String,
    error_type: String,
}

/// One aggregated row of the `validation_errors` list in a sync payload.
#[derive(Debug, Serialize)]
#[non_exhaustive]
pub(crate) struct ValidationErrorsItem {
    pub(crate) consumer: Option<String>,
    pub(crate) method: String,
    pub(crate) path: String,
    /// Field location, split into its dot-separated components.
    pub(crate) loc: Vec<String>,
    pub(crate) msg: String,
    #[serde(rename = "type")]
    pub(crate) error_type: String,
    pub(crate) error_count: u64,
}

/// Aggregates request validation errors per fingerprint.
#[derive(Debug, Default)]
pub(crate) struct ValidationErrorCounter {
    inner: Mutex<CounterInner<ValidationErrorDetails>>,
}

#[derive(Debug)]
struct CounterInner<D> {
    counts: HashMap<String, u64>,
    details: HashMap<String, D>,
}

impl<D> Default for CounterInner<D> {
    fn default() -> Self {
        Self {
            counts: HashMap::new(),
            details: HashMap::new(),
        }
    }
}

impl ValidationErrorCounter {
    /// Record one validation error.
    pub(crate) fn add_validation_error(
        &self,
        consumer: Option<&str>,
        method: &str,
        path: &str,
        loc: &str,
        msg: &str,
        error_type: &str,
    ) {
        let method = method.to_ascii_uppercase();
        let msg = msg.trim();
        let key = fingerprint([
            consumer.unwrap_or_default(),
            method.as_str(),
            path,
            loc,
            msg,
            error_type,
        ]);
        let mut inner = self.inner.lock();
        *inner.counts.entry(key.clone()).or_default() += 1;
        inner.details.entry(key).or_insert_with(|| ValidationErrorDetails {
            consumer: consumer.map(ToOwned::to_owned),
            method,
            path: path.to_owned(),
            loc: loc.to_owned(),
            msg: msg.to_owned(),
            error_type: error_type.to_owned(),
        });
    }

    /// Emit one aggregated item per fingerprint and clear all state.
    pub(crate) fn get_and_reset_validation_errors(&self) -> Vec<ValidationErrorsItem> {
        let mut inner = self.inner.lock();
        let counts = std::mem::take(&mut inner.counts);
        let mut details = std::mem::take(&mut inner.details);
        drop(inner);

        counts
            .into_iter()
            .filter_map(|(key, count)| {
                let detail = details.remove(&key)?;
                Some(ValidationErrorsItem {
                    consumer: detail.consumer,
                    method: detail.method,
                    path: detail.path,
                    loc: detail.loc.split('.').map(ToOwned::to_owned).collect(),
                    msg: detail.msg,
                    error_type: detail.error_type,
                    error_count: count,
                })
            })
            .collect()
    }
}

/// Full details of a server error, kept for the first occurrence.
#[derive(Debug)]
struct ServerErrorDetails {
    consumer: Option<String>,
    method: String,
    path: String,
    error_type: String,
    msg: String,
    traceback: String,
    sentry_event_id: Option<String>,
}

/// One aggregated row of the `server_errors` list in a sync payload.
#[derive(Debug, Serialize)]
#[non_exhaustive]
pub(crate) struct ServerErrorsItem {
    pub(crate) consumer: Option<String>,
    pub(crate) method: String,
    pub(crate) path: String,
    #[serde(rename = "type")]
    pub(crate) error_type: String,
    pub(crate) msg: String,
    pub(crate) traceback: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) sentry_event_id: Option<String>,
    pub(crate) error_count: u64,
}

/// Aggregates unhandled server errors per fingerprint.
#[derive(Debug, Default)]
pub(crate) struct ServerErrorCounter {
    inner: Mutex<CounterInner<ServerErrorDetails>>,
}

impl ServerErrorCounter {
    /// Record one unhandled server error.
    pub(crate) fn add_server_error(
        &self,
        consumer: Option<&str>,
        method: &str,
        path: &str,
        exception: &ExceptionInfo,
    ) {
        let method = method.to_ascii_uppercase();
        let msg = exception.message.trim();
        let traceback = exception.stacktrace.trim();
        let key = fingerprint([
            consumer.unwrap_or_default(),
            method.as_str(),
            path,
            exception.error_type.as_str(),
            msg,
            traceback,
        ]);
        let mut inner = self.inner.lock();
        *inner.counts.entry(key.clone()).or_default() += 1;
        inner.details.entry(key).or_insert_with(|| ServerErrorDetails {
            consumer: consumer.map(ToOwned::to_owned),
            method,
            path: path.to_owned(),
            error_type: exception.error_type.clone(),
            msg: msg.to_owned(),
            traceback: traceback.to_owned(),
            sentry_event_id: current_sentry_event_id(),
        });
    }

    /// Emit one aggregated item per fingerprint and clear all state.
    ///
    /// Messages and stack traces are truncated on emission.
    pub(crate) fn get_and_reset_server_errors(&self) -> Vec<ServerErrorsItem> {
        let mut inner = self.inner.lock();
        let counts = std::mem::take(&mut inner.counts);
        let mut details = std::mem::take(&mut inner.details);
        drop(inner);

        counts
            .into_iter()
            .filter_map(|(key, count)| {
                let detail = details.remove(&key)?;
                Some(ServerErrorsItem {
                    consumer: detail.consumer,
                    method: detail.method,
                    path: detail.path,
                    error_type: detail.error_type,
                    msg: truncate_chars(&detail.msg, MAX_MSG_LEN),
                    traceback: truncate_lines(&detail.traceback, MAX_STACKTRACE_LEN),
                    sentry_event_id: detail.sentry_event_id,
                    error_count: count,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exception() -> ExceptionInfo {
        ExceptionInfo::new(
            "ValueError",
            "something went wrong",
            "frame 1\nframe 2\nframe 3",
        )
    }

    #[test]
    fn fingerprints_match_reference_digests() {
        // Standard MD5 test vectors, so digests are comparable across
        // platforms and implementations.
        assert_eq!(
            fingerprint([]),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
        assert_eq!(
            fingerprint(["abc"]),
            "900150983cd24fb0d6963f7d28e17f72"
        );
        assert_eq!(fingerprint(["a", "bc"]), fingerprint(["a", "bc"]));
        assert_ne!(fingerprint(["a", "bc"]), fingerprint(["ab", "c"]));
    }

    #[test]
    fn identical_server_errors_dedup() {
        let counter = ServerErrorCounter::default();
        counter.add_server_error(Some("bob"), "GET", "/x", &exception());
        counter.add_server_error(Some("bob"), "GET", "/x", &exception());

        let items = counter.get_and_reset_server_errors();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].error_count, 2);
        assert_eq!(items[0].error_type, "ValueError");
        assert_eq!(items[0].msg, "something went wrong");
        assert_eq!(items[0].traceback, "frame 1\nframe 2\nframe 3");
        assert!(counter.get_and_reset_server_errors().is_empty());
    }

    #[test]
    fn differing_tracebacks_do_not_dedup() {
        let counter = ServerErrorCounter::default();
        counter.add_server_error(None, "GET", "/x", &exception());
        let other = ExceptionInfo::new("ValueError", "something went wrong", "other frame");
        counter.add_server_error(None, "GET", "/x", &other);
        assert_eq!(counter.get_and_reset_server_errors().len(), 2);
    }

    #[test]
    fn message_and_trim_feed_the_fingerprint() {
        let counter = ServerErrorCounter::default();
        let padded = ExceptionInfo::new(
            "ValueError",
            "  something went wrong  ",
            "\nframe 1\nframe 2\nframe 3\n",
        );
        counter.add_server_error(Some("bob"), "get", "/x", &padded);
        counter.add_server_error(Some("bob"), "GET", "/x", &exception());
        let items = counter.get_and_reset_server_errors();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].error_count, 2);
    }

    #[test]
    fn long_fields_truncate_on_emission() {
        let counter = ServerErrorCounter::default();
        let long = ExceptionInfo::new(
            "ValueError",
            "m".repeat(3000),
            (0..4000)
                .map(|i| format!("frame {i}"))
                .collect::<Vec<_>>()
                .join("\n"),
        );
        counter.add_server_error(None, "GET", "/x", &long);
        let items = counter.get_and_reset_server_errors();
        assert!(items[0].msg.ends_with("... (truncated)"));
        assert_eq!(items[0].msg.chars().count(), 2048 + "... (truncated)".len());
        assert!(items[0].traceback.ends_with("... (truncated) ..."));
        assert!(items[0].traceback.chars().count() <= 65_536);
    }

    #[test]
    fn validation_errors_dedup_and_split_loc() {
        let counter = ValidationErrorCounter::default();
        for _ in 0..3 {
            counter.add_validation_error(
                None,
                "POST",
                "/items",
                "body.item.price",
                "value is not a valid float",
                "type_error.float",
            );
        }
        counter.add_validation_error(
            None,
            "POST",
            "/items",
            "body.item.name",
            "field required",
            "value_error.missing",
        );

        let mut items = counter.get_and_reset_validation_errors();
        assert_eq!(items.len(), 2);
        items.sort_by_key(|item| item.error_count);
        assert_eq!(items[0].loc, vec!["body", "item", "name"]);
        assert_eq!(items[0].error_count, 1);
        assert_eq!(items[1].loc, vec!["body", "item", "price"]);
        assert_eq!(items[1].error_count, 3);
        assert!(counter.get_and_reset_validation_errors().is_empty());
    }

    #[test]
    fn consumer_distinguishes_fingerprints() {
        let counter = ValidationErrorCounter::default();
        counter.add_validation_error(Some("a"), "GET", "/x", "query.q", "bad", "type_error");
        counter.add_validation_error(Some("b"), "GET", "/x", "query.q", "bad", "type_error");
        counter.add_validation_error(None, "GET", "/x", "query.q", "bad", "type_error");
        assert_eq!(counter.get_and_reset_validation_errors().len(), 3);
    }
}
