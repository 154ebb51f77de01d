//! Misc utility functions shared between subsystems.

use std::time::{SystemTime, UNIX_EPOCH};

/// Helper function used for default boolean values in [`serde`].
///
/// Always returns `true`.
#[must_use]
#[inline]
pub(crate) fn default_true() -> bool {
    true
}

/// Current wall-clock time as Unix seconds.
#[must_use]
pub(crate) fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Truncate a string to at most `max` characters, appending a marker if
/// anything was cut off.
#[must_use]
pub(crate) fn truncate_chars(value: &str, max: usize) -> String {
    match value.char_indices().nth(max) {
        Some((pos, _)) => format!("{}... (truncated)", &value[..pos]),
        None => value.to_owned(),
    }
}

/// Truncate a multi-line string to at most `max` characters, cutting only at
/// line boundaries.
///
/// Used for exception stack traces, where a partial line is useless.
#[must_use]
pub(crate) fn truncate_lines(value: &str, max: usize) -> String {
    const MARKER: &str = "... (truncated) ...";
    let mut out = Vec::new();
    let mut length = 0;
    for line in value.trim().lines() {
        if length + line.chars().count() + 1 > max - MARKER.len() {
            out.push(MARKER);
            break;
        }
        out.push(line);
        length += line.chars().count() + 1;
    }
    out.join("\n")
}

/// Sentry event id most recently captured on this thread, if the `sentry`
/// feature is enabled and the Sentry SDK has one.
#[must_use]
pub(crate) fn current_sentry_event_id() -> Option<String> {
    #[cfg(feature = "sentry")]
    {
        sentry_core::Hub::current()
            .last_event_id()
            .map(|id| id.to_string())
    }
    #[cfg(not(feature = "sentry"))]
    None
}

/// Parse a `Content-Length` style header value into a size.
///
/// Accepts a comma-separated list of values, using the first one. Invalid
/// and negative values yield `None`.
#[must_use]
pub fn parse_content_length(value: &str) -> Option<i64> {
    value
        .split(',')
        .next()
        .and_then(|first| first.trim().parse::<i64>().ok())
        .filter(|size| *size >= 0)
}
