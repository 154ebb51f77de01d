//! Request detail logging with masking, bounded queues and a gzip spool.
//!
//! Ingestion is synchronous and cheap: records are screened against the
//! exclusion rules and pushed onto a bounded in-memory queue. Masking,
//! serialization and compression happen later, on the maintenance tick,
//! under the spool lock.

mod mask;
mod spool;

use std::{
    collections::VecDeque,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::{
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug_span, warn, Instrument};
use url::Url;
use uuid::Uuid;

use crate::{
    config::RequestLoggingConfig,
    logger::mask::MaskPolicy,
    types::{ExceptionInfo, LogRecord, Request, Response},
    util::{current_sentry_event_id, truncate_chars, truncate_lines},
};

pub(crate) use self::spool::ClosedGzipFile;

/// Maximum number of records queued in memory awaiting serialization.
const MAX_PENDING_WRITES: usize = 100;
/// Maximum logged body size per side, in bytes.
const MAX_BODY_SIZE: usize = 50_000;
/// Replacement for bodies exceeding [`MAX_BODY_SIZE`].
const BODY_TOO_LARGE: &[u8] = b"<body too large>";
/// Maximum length of an attached log message, in characters.
const MAX_LOG_MSG_LEN: usize = 2048;
/// Maximum length of an attached exception message, in characters.
const MAX_EXC_MSG_LEN: usize = 2048;
/// Maximum length of an attached exception stack trace, in characters.
const MAX_EXC_STACKTRACE_LEN: usize = 65_536;
/// Interval of the flush/rotate/retention maintenance task.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);

/// Content types whose bodies may be captured.
const SUPPORTED_CONTENT_TYPES: &[&str] = &[
    "application/json",
    "application/x-ndjson",
    "application/ld+json",
    "application/problem+json",
    "application/vnd.api+json",
    "text/plain",
    "text/html",
];

fn parse_content_type(value: Option<&str>) -> Option<mime::Mime> {
    value.and_then(|value| value.parse().ok())
}

fn is_supported_content_type(value: Option<&str>) -> bool {
    parse_content_type(value)
        .is_some_and(|mime| SUPPORTED_CONTENT_TYPES.contains(&mime.essence_str()))
}

fn is_json_content_type(value: Option<&str>) -> bool {
    parse_content_type(value).is_some_and(|mime| {
        let essence = mime.essence_str();
        essence == "application/json"
            || essence == "application/x-ndjson"
            || essence.ends_with("+json")
    })
}

/// Exception details attached to a log record.
#[derive(Debug, Serialize)]
struct ExceptionItem {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
    stacktrace: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    sentry_event_id: Option<String>,
}

/// One request detail record, emitted as a single NDJSON line.
#[derive(Debug, Serialize)]
struct RequestLogItem {
    uuid: Uuid,
    request: Request,
    response: Response,
    #[serde(skip_serializing_if = "Option::is_none")]
    exception: Option<ExceptionItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    logs: Option<Vec<LogRecord>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    spans: Option<serde_json::Value>,
}

/// Request detail logger.
///
/// Disabled for the life of the process if the temp directory turns out to
/// be unwritable at construction. May additionally be suspended for a while
/// when the Hub asks for it.
pub(crate) struct RequestLogger {
    enabled: AtomicBool,
    config: RequestLoggingConfig,
    policy: MaskPolicy,
    pending: Mutex<VecDeque<RequestLogItem>>,
    suspend_until: Mutex<Option<Instant>>,
    spool: Mutex<Option<spool::TempGzipSpool>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for RequestLogger {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl RequestLogger {
    pub(crate) fn new(config: RequestLoggingConfig) -> Arc<Self> {
        let policy = MaskPolicy::new(
            &config.exclude_paths,
            &config.mask_query_params,
            &config.mask_headers,
            &config.mask_body_fields,
        );
        let spool = if config.enabled {
            match spool::TempGzipSpool::new() {
                Ok(spool) => Some(spool),
                Err(err) => {
                    warn!(error = %err, "temp directory is not writable, request logging disabled");
                    None
                }
            }
        } else {
            None
        };
        let enabled = config.enabled && spool.is_some();
        Arc::new(Self {
            enabled: AtomicBool::new(enabled),
            config,
            policy,
            pending: Mutex::new(VecDeque::new()),
            suspend_until: Mutex::new(None),
            spool: Mutex::new(spool),
            task: Mutex::new(None),
        })
    }

    /// Spawn the 1 second maintenance task. Requires a Tokio runtime.
    pub(crate) fn start_maintenance(self: &Arc<Self>) {
        if !self.is_enabled() {
            return;
        }
        let weak = Arc::downgrade(self);
        let span = debug_span!("request_logger_maintenance");
        let task = tokio::spawn(
            async move {
                let mut timer = interval(MAINTENANCE_INTERVAL);
                timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    timer.tick().await;
                    let Some(logger) = weak.upgrade() else {
                        break;
                    };
                    let _ = tokio::task::spawn_blocking(move || logger.maintain()).await;
                }
            }
            .instrument(span),
        );
        *self.task.lock() = Some(task);
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn is_suspended(&self) -> bool {
        self.suspend_until
            .lock()
            .is_some_and(|until| until > Instant::now())
    }

    /// Suspend ingestion for the given duration and drop everything pending.
    ///
    /// An upload already in flight is not affected.
    pub(crate) fn suspend_for(&self, duration: Duration) {
        *self.suspend_until.lock() = Some(Instant::now() + duration);
        self.clear();
    }

    /// Ingest one completed request/response exchange.
    ///
    /// Synchronous and non-blocking apart from short lock windows; never
    /// returns an error.
    pub(crate) fn log_request(
        &self,
        mut request: Request,
        mut response: Response,
        exception: Option<&ExceptionInfo>,
        logs: Vec<LogRecord>,
        spans: Option<serde_json::Value>,
    ) {
        if !self.is_enabled() || self.is_suspended() {
            return;
        }
        let path = request
            .path
            .clone()
            .or_else(|| Url::parse(&request.url).ok().map(|url| url.path().to_owned()));
        if path.is_some_and(|path| self.policy.is_excluded_path(&path)) {
            return;
        }
        if request
            .header("user-agent")
            .is_some_and(|user_agent| self.policy.is_excluded_user_agent(user_agent))
        {
            return;
        }
        if let Some(callback) = &self.config.exclude_callback {
            match catch_unwind(AssertUnwindSafe(|| callback(&request, &response))) {
                Ok(true) => return,
                Ok(false) => {}
                Err(_) => {
                    warn!("exclude callback panicked, dropping request log record");
                    return;
                }
            }
        }

        if !self.config.log_request_body
            || !is_supported_content_type(request.header("content-type"))
        {
            request.body = None;
        }
        if !self.config.log_response_body
            || !is_supported_content_type(response.header("content-type"))
        {
            response.body = None;
        }
        request.size = request.size.filter(|size| *size >= 0);
        response.size = response.size.filter(|size| *size >= 0);

        let exception = exception
            .filter(|_| self.config.log_exception)
            .map(|exception| ExceptionItem {
                error_type: exception.error_type.clone(),
                message: truncate_chars(&exception.message, MAX_EXC_MSG_LEN),
                stacktrace: truncate_lines(&exception.stacktrace, MAX_EXC_STACKTRACE_LEN),
                sentry_event_id: current_sentry_event_id(),
            });
        let logs = (self.config.capture_logs && !logs.is_empty()).then(|| {
            logs.into_iter()
                .map(|mut record| {
                    record.message = truncate_chars(&record.message, MAX_LOG_MSG_LEN);
                    record
                })
                .collect()
        });

        let item = RequestLogItem {
            uuid: Uuid::new_v4(),
            request,
            response,
            exception,
            logs,
            spans,
        };
        let mut pending = self.pending.lock();
        pending.push_back(item);
        while pending.len() > MAX_PENDING_WRITES {
            pending.pop_front();
        }
    }

    /// Mask, serialize and append all pending records to the current file.
    pub(crate) fn write_pending_to_file(&self) {
        let items: Vec<RequestLogItem> = {
            let mut pending = self.pending.lock();
            pending.drain(..).collect()
        };
        if items.is_empty() {
            return;
        }
        let mut guard = self.spool.lock();
        let Some(spool) = guard.as_mut() else {
            return;
        };
        for mut item in items {
            self.apply_masks(&mut item);
            match serde_json::to_vec(&item) {
                Ok(line) => {
                    if let Err(err) = spool.write_line(&line) {
                        warn!(error = %err, "failed to write request log record");
                    }
                }
                Err(err) => warn!(error = %err, "failed to serialize request log record"),
            }
        }
    }

    /// Apply user callbacks, size caps and masking rules to one record.
    fn apply_masks(&self, item: &mut RequestLogItem) {
        // User callbacks see the record as ingested.
        if item.request.body.is_some() {
            if let Some(callback) = &self.config.mask_request_body_callback {
                item.request.body =
                    match catch_unwind(AssertUnwindSafe(|| callback(&item.request))) {
                        Ok(body) => body,
                        Err(_) => {
                            warn!("request body masking callback panicked, dropping body");
                            None
                        }
                    };
            }
        }
        if item.response.body.is_some() {
            if let Some(callback) = &self.config.mask_response_body_callback {
                item.response.body = match catch_unwind(AssertUnwindSafe(|| {
                    callback(&item.request, &item.response)
                })) {
                    Ok(body) => body,
                    Err(_) => {
                        warn!("response body masking callback panicked, dropping body");
                        None
                    }
                };
            }
        }

        for body in [&mut item.request.body, &mut item.response.body] {
            if body.as_ref().is_some_and(|bytes| bytes.len() > MAX_BODY_SIZE) {
                *body = Some(BODY_TOO_LARGE.to_vec());
            }
        }

        let request_content_type = item.request.header("content-type").map(ToOwned::to_owned);
        let response_content_type = item.response.header("content-type").map(ToOwned::to_owned);
        self.mask_json_body(&mut item.request.body, request_content_type.as_deref());
        self.mask_json_body(&mut item.response.body, response_content_type.as_deref());

        if self.config.log_request_headers {
            self.policy.mask_headers(&mut item.request.headers);
        } else {
            item.request.headers = Vec::new();
        }
        if self.config.log_response_headers {
            self.policy.mask_headers(&mut item.response.headers);
        } else {
            item.response.headers = Vec::new();
        }

        item.request.url = if self.config.log_query_params {
            self.policy.mask_url_query(&item.request.url)
        } else {
            strip_query(&item.request.url)
        };
    }

    /// Mask matching fields of a JSON body in place.
    ///
    /// Bodies that are not JSON, or fail to parse as UTF-8 JSON, pass
    /// through unchanged.
    fn mask_json_body(&self, body: &mut Option<Vec<u8>>, content_type: Option<&str>) {
        let Some(bytes) = body else {
            return;
        };
        if bytes.as_slice() == BODY_TOO_LARGE || !is_json_content_type(content_type) {
            return;
        }
        if let Ok(mut value) = serde_json::from_slice::<serde_json::Value>(bytes) {
            self.policy.mask_body_fields(&mut value);
            if let Ok(masked) = serde_json::to_vec(&value) {
                *body = Some(masked);
            }
        }
    }

    /// One maintenance pass: expire suspension, flush, rotate oversized file.
    pub(crate) fn maintain(&self) {
        {
            let mut suspend = self.suspend_until.lock();
            if suspend.is_some_and(|until| until <= Instant::now()) {
                *suspend = None;
            }
        }
        self.write_pending_to_file();
        if let Some(spool) = self.spool.lock().as_mut() {
            if let Err(err) = spool.rotate_if_full() {
                warn!(error = %err, "failed to rotate request log file");
            }
        }
    }

    /// Close the current spool file so it becomes uploadable.
    pub(crate) fn rotate_file(&self) {
        if let Some(spool) = self.spool.lock().as_mut() {
            if let Err(err) = spool.rotate() {
                warn!(error = %err, "failed to rotate request log file");
            }
        }
    }

    /// Take the oldest closed spool file for upload.
    pub(crate) fn pop_file(&self) -> Option<ClosedGzipFile> {
        self.spool.lock().as_mut()?.pop_file()
    }

    /// Return a file to the front of the upload queue.
    pub(crate) fn requeue_file(&self, file: ClosedGzipFile) {
        if let Some(spool) = self.spool.lock().as_mut() {
            spool.requeue_file(file);
        }
    }

    /// Drop all pending records and delete all spool files.
    pub(crate) fn clear(&self) {
        self.pending.lock().clear();
        if let Some(spool) = self.spool.lock().as_mut() {
            spool.clear();
        }
    }

    /// Disable the logger, stop maintenance and delete local state.
    pub(crate) fn close(&self) {
        self.enabled.store(false, Ordering::Relaxed);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.clear();
    }
}

/// Remove the query string from a URL.
fn strip_query(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) => {
            parsed.set_query(None);
            parsed.into()
        }
        Err(_) => url.split('?').next().unwrap_or(url).to_owned(),
    }
}
