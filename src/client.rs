//! Process-wide client: lifecycle, scheduler and Hub synchronization.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, error, warn, Instrument};
use uuid::Uuid;

use crate::{
    config::ApitallyConfig,
    consumers::{Consumer, ConsumerRegistry},
    error_counters::{ServerErrorCounter, ValidationErrorCounter},
    errors::ApitallyError,
    hub::{HubClient, HubOutcome},
    instance,
    logger::RequestLogger,
    requests::RequestCounter,
    types::{ExceptionInfo, LogRecord, PathInfo, Request, Response, StartupData, StartupPayload, SyncPayload},
    util::unix_now,
};

/// Sync interval during the initial burst period.
const INITIAL_SYNC_INTERVAL: Duration = Duration::from_secs(10);
/// Sync interval after the initial burst period.
const SYNC_INTERVAL: Duration = Duration::from_secs(60);
/// Length of the initial burst period after construction.
const INITIAL_PERIOD: Duration = Duration::from_secs(3600);
/// Queued sync payloads older than this are dropped, in seconds.
const MAX_QUEUE_AGE: f64 = 3600.0;
/// Maximum number of spool files uploaded per tick.
const MAX_LOG_FILES_PER_TICK: usize = 10;

/// The one client instance of this process.
static INSTANCE: Mutex<Option<Arc<ApitallyClient>>> = Mutex::new(None);

/// Startup metadata and its delivery state.
#[derive(Debug, Default)]
struct StartupState {
    data: Option<StartupData>,
    sent: bool,
}

/// The in-process telemetry agent.
///
/// At most one live instance exists per process. Constructing it starts the
/// background sync scheduler immediately; [`Self::shutdown`] stops it, runs
/// one final sync and releases the singleton slot.
///
/// Construction must happen inside a Tokio runtime.
pub struct ApitallyClient {
    instance_uuid: Uuid,
    app_version: Option<String>,
    hub: HubClient,
    request_counter: RequestCounter,
    consumer_registry: ConsumerRegistry,
    validation_error_counter: ValidationErrorCounter,
    server_error_counter: ServerErrorCounter,
    request_logger: Arc<RequestLogger>,
    startup: Mutex<StartupState>,
    /// Serializes startup publication; the eager send on
    /// [`Self::set_startup_data`] can otherwise race the first tick.
    startup_send_lock: tokio::sync::Mutex<()>,
    sync_queue: Mutex<VecDeque<SyncPayload>>,
    /// Set on a terminal Hub response; stops syncing permanently.
    stopped: AtomicBool,
    shut_down: AtomicBool,
    started_at: Instant,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ApitallyClient {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl ApitallyClient {
    /// Create the client and start its background scheduler.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the configuration is invalid, a client already
    /// exists in this process, or the HTTP transport cannot be initialized.
    pub fn new(config: ApitallyConfig) -> Result<Arc<Self>, ApitallyError> {
        let client_id = config.validated_client_id()?;
        let env = config.normalized_env()?;

        let mut slot = INSTANCE.lock();
        if slot.is_some() {
            return Err(ApitallyError::AlreadyInitialized);
        }

        let hub = HubClient::new(config.resolved_hub_base_url(), client_id, env.clone())
            .map_err(|err| ApitallyError::Transport(err.to_string()))?;
        let instance_uuid = instance::get_instance_uuid(client_id, &env);
        let request_logger = RequestLogger::new(config.request_logging.clone());

        let client = Arc::new(Self {
            instance_uuid,
            app_version: config.app_version.clone(),
            hub,
            request_counter: RequestCounter::default(),
            consumer_registry: ConsumerRegistry::default(),
            validation_error_counter: ValidationErrorCounter::default(),
            server_error_counter: ServerErrorCounter::default(),
            request_logger,
            startup: Mutex::new(StartupState::default()),
            startup_send_lock: tokio::sync::Mutex::new(()),
            sync_queue: Mutex::new(VecDeque::new()),
            stopped: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            started_at: Instant::now(),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        });
        client.request_logger.start_maintenance();
        client.spawn_scheduler();
        *slot = Some(Arc::clone(&client));
        debug!(%client_id, env, %instance_uuid, "apitally client started");
        Ok(client)
    }

    /// Get the client instance of this process.
    ///
    /// # Errors
    ///
    /// Returns `Err` if no client has been created yet.
    pub fn get() -> Result<Arc<Self>, ApitallyError> {
        INSTANCE.lock().clone().ok_or(ApitallyError::NotInitialized)
    }

    /// Stable UUID identifying this process instance.
    #[must_use]
    pub fn instance_uuid(&self) -> Uuid {
        self.instance_uuid
    }

    /// Record one served request in the aggregated counters.
    ///
    /// `response_time` is in milliseconds.
    #[allow(clippy::too_many_arguments)]
    pub fn add_request(
        &self,
        consumer: Option<&Consumer>,
        method: &str,
        path: &str,
        status_code: u16,
        response_time: f64,
        request_size: Option<i64>,
        response_size: Option<i64>,
    ) {
        self.consumer_registry.add_or_update_consumer(consumer);
        self.request_counter.add_request(
            consumer.map(|consumer| consumer.identifier.as_str()),
            method,
            path,
            status_code,
            response_time,
            request_size,
            response_size,
        );
    }

    /// Record one request validation error.
    pub fn add_validation_error(
        &self,
        consumer: Option<&Consumer>,
        method: &str,
        path: &str,
        loc: &str,
        msg: &str,
        error_type: &str,
    ) {
        self.consumer_registry.add_or_update_consumer(consumer);
        self.validation_error_counter.add_validation_error(
            consumer.map(|consumer| consumer.identifier.as_str()),
            method,
            path,
            loc,
            msg,
            error_type,
        );
    }

    /// Record one unhandled server error.
    pub fn add_server_error(
        &self,
        consumer: Option<&Consumer>,
        method: &str,
        path: &str,
        exception: &ExceptionInfo,
    ) {
        self.consumer_registry.add_or_update_consumer(consumer);
        self.server_error_counter.add_server_error(
            consumer.map(|consumer| consumer.identifier.as_str()),
            method,
            path,
            exception,
        );
    }

    /// Enqueue one request detail record, if request logging is enabled.
    pub fn log_request(
        &self,
        request: Request,
        response: Response,
        exception: Option<&ExceptionInfo>,
        logs: Vec<LogRecord>,
        spans: Option<serde_json::Value>,
    ) {
        self.request_logger
            .log_request(request, response, exception, logs, spans);
    }

    /// Store startup metadata and publish it eagerly.
    ///
    /// Publication is retried on every scheduler tick until the Hub
    /// acknowledges it.
    pub fn set_startup_data<V>(
        self: &Arc<Self>,
        paths: Vec<PathInfo>,
        versions: V,
        client: impl ToString,
    ) where
        V: IntoIterator<Item = (String, String)>,
    {
        let mut versions: BTreeMap<String, String> = versions.into_iter().collect();
        if let Some(app_version) = &self.app_version {
            versions
                .entry("app".to_owned())
                .or_insert_with(|| app_version.clone());
        }
        *self.startup.lock() = StartupState {
            data: Some(StartupData {
                paths,
                versions,
                client: client.to_string(),
            }),
            sent: false,
        };
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            if let Some(client) = weak.upgrade() {
                client.send_startup().await;
            }
        });
    }

    /// Stop the scheduler, flush and upload what is pending, release the
    /// singleton slot.
    ///
    /// Idempotent; later calls return immediately.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        if !self.stopped.load(Ordering::Relaxed) {
            self.request_logger.write_pending_to_file();
            self.send_sync().await;
            self.send_log().await;
        }
        self.request_logger.close();
        *INSTANCE.lock() = None;
        debug!("apitally client shut down");
    }

    fn spawn_scheduler(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let span = debug_span!("apitally_sync");
        let task = tokio::spawn(
            async move {
                loop {
                    let Some(client) = weak.upgrade() else {
                        break;
                    };
                    if client.stopped.load(Ordering::Relaxed) {
                        break;
                    }
                    client.tick().await;
                    let delay = client.sync_interval();
                    drop(client);
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
            .instrument(span),
        );
        *self.task.lock() = Some(task);
    }

    /// Interval until the next tick: fast during the initial burst period.
    fn sync_interval(&self) -> Duration {
        if self.started_at.elapsed() < INITIAL_PERIOD {
            INITIAL_SYNC_INTERVAL
        } else {
            SYNC_INTERVAL
        }
    }

    async fn tick(&self) {
        tokio::join!(self.send_sync(), self.send_log(), self.send_startup());
    }

    /// Drain all counters into a fresh sync payload.
    fn build_sync_payload(&self) -> SyncPayload {
        SyncPayload {
            timestamp: unix_now(),
            instance_uuid: self.instance_uuid,
            message_uuid: Uuid::new_v4(),
            requests: self.request_counter.get_and_reset_requests(),
            validation_errors: self
                .validation_error_counter
                .get_and_reset_validation_errors(),
            server_errors: self.server_error_counter.get_and_reset_server_errors(),
            consumers: self.consumer_registry.get_and_reset_updated_consumers(),
        }
    }

    /// Build a payload for this tick, then drain the payload queue.
    async fn send_sync(&self) {
        self.sync_queue.lock().push_back(self.build_sync_payload());
        let mut sent = 0_u32;
        loop {
            if self.stopped.load(Ordering::Relaxed) {
                break;
            }
            let payload = match self.sync_queue.lock().pop_front() {
                Some(payload) => payload,
                None => break,
            };
            if unix_now() - payload.timestamp > MAX_QUEUE_AGE {
                debug!("dropping expired sync payload");
                continue;
            }
            if sent > 0 {
                // Pace consecutive POSTs a little.
                let delay = rand::thread_rng().gen_range(100..=500);
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            match self.hub.send_sync(&payload).await {
                HubOutcome::Accepted => {}
                HubOutcome::PayloadRejected => {
                    warn!("hub rejected sync payload, dropping it");
                }
                HubOutcome::ClientNotFound => {
                    self.stop_sync();
                    break;
                }
                HubOutcome::Transient | HubOutcome::PaymentRequired { .. } => {
                    self.sync_queue.lock().push_front(payload);
                    break;
                }
            }
            sent += 1;
        }
    }

    /// Publish startup metadata if present and not yet acknowledged.
    async fn send_startup(&self) {
        if self.stopped.load(Ordering::Relaxed) {
            return;
        }
        let _sending = self.startup_send_lock.lock().await;
        let payload = {
            let startup = self.startup.lock();
            match (&startup.data, startup.sent) {
                (Some(data), false) => Some(StartupPayload {
                    instance_uuid: self.instance_uuid,
                    message_uuid: Uuid::new_v4(),
                    paths: data.paths.clone(),
                    versions: data.versions.clone(),
                    client: data.client.clone(),
                }),
                _ => None,
            }
        };
        let Some(payload) = payload else {
            return;
        };
        match self.hub.send_startup(&payload).await {
            HubOutcome::Accepted => self.startup.lock().sent = true,
            HubOutcome::ClientNotFound => self.stop_sync(),
            HubOutcome::PayloadRejected => {
                warn!("hub rejected startup payload, dropping it");
                self.startup.lock().sent = true;
            }
            HubOutcome::Transient | HubOutcome::PaymentRequired { .. } => {}
        }
    }

    /// Rotate the spool and upload up to [`MAX_LOG_FILES_PER_TICK`] files.
    async fn send_log(&self) {
        if !self.request_logger.is_enabled() {
            return;
        }
        self.request_logger.rotate_file();
        for _ in 0..MAX_LOG_FILES_PER_TICK {
            let Some(file) = self.request_logger.pop_file() else {
                break;
            };
            let payload = match file.read() {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(error = %err, "failed to read request log file, dropping it");
                    file.delete();
                    continue;
                }
            };
            debug!(uuid = %file.uuid, bytes = file.size, "uploading request log file");
            match self.hub.send_log(file.uuid, payload).await {
                HubOutcome::Accepted => file.delete(),
                HubOutcome::PayloadRejected => {
                    warn!("hub rejected request log file, dropping it");
                    file.delete();
                }
                HubOutcome::PaymentRequired {
                    retry_after: Some(retry_after),
                } => {
                    warn!(
                        seconds = retry_after.as_secs(),
                        "hub asked to suspend request logging"
                    );
                    self.request_logger.suspend_for(retry_after);
                    file.delete();
                    break;
                }
                HubOutcome::PaymentRequired { retry_after: None }
                | HubOutcome::ClientNotFound
                | HubOutcome::Transient => {
                    self.request_logger.requeue_file(file);
                    break;
                }
            }
        }
    }

    /// Permanently stop syncing after a terminal Hub response.
    ///
    /// The request logger's maintenance keeps running so local retention
    /// stays bounded.
    fn stop_sync(&self) {
        if !self.stopped.swap(true, Ordering::Relaxed) {
            error!("hub does not know this client id, stopping sync");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use mockito::Matcher;
    use serde_json::json;

    use super::*;
    use crate::config::RequestLoggingConfig;

    const CLIENT_ID: &str = "076f0b05-4d67-4981-86b9-7d7a1dd4b210";

    /// Client tests share the process-wide singleton slot.
    static TEST_LOCK: StdMutex<()> = StdMutex::new(());

    fn lock() -> std::sync::MutexGuard<'static, ()> {
        TEST_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn config(server: &mockito::ServerGuard) -> ApitallyConfig {
        ApitallyConfig::new(CLIENT_ID)
            .with_hub_base_url(url::Url::parse(&server.url()).unwrap())
    }

    fn sync_path() -> String {
        format!("/v2/{CLIENT_ID}/dev/sync")
    }

    #[tokio::test]
    async fn construction_is_validated() {
        let _guard = lock();
        assert_eq!(
            ApitallyClient::new(ApitallyConfig::new("nope")).err(),
            Some(ApitallyError::InvalidClientId("nope".to_owned()))
        );
        assert_eq!(
            ApitallyClient::new(ApitallyConfig::new(CLIENT_ID).with_env("bad env")).err(),
            Some(ApitallyError::InvalidEnv("bad env".to_owned()))
        );
        assert_eq!(ApitallyClient::get().err(), Some(ApitallyError::NotInitialized));
    }

    #[tokio::test]
    async fn singleton_slot_is_exclusive() {
        let _guard = lock();
        let mut server = mockito::Server::new_async().await;
        let _sync = server
            .mock("POST", sync_path().as_str())
            .with_status(202)
            .create_async()
            .await;

        let client = ApitallyClient::new(config(&server)).unwrap();
        assert_eq!(
            ApitallyClient::new(config(&server)).err(),
            Some(ApitallyError::AlreadyInitialized)
        );
        assert!(ApitallyClient::get().is_ok());

        client.shutdown().await;
        client.shutdown().await;
        assert_eq!(ApitallyClient::get().err(), Some(ApitallyError::NotInitialized));

        // The slot is free again after shutdown.
        let client = ApitallyClient::new(config(&server)).unwrap();
        client.shutdown().await;
    }

    #[tokio::test]
    async fn sync_payload_drains_counters() {
        let _guard = lock();
        let mut server = mockito::Server::new_async().await;
        let _sync = server
            .mock("POST", sync_path().as_str())
            .with_status(202)
            .create_async()
            .await;
        let client = ApitallyClient::new(config(&server)).unwrap();

        let consumer = Consumer::new("alice").unwrap().with_name("Alice");
        for _ in 0..3 {
            client.add_request(Some(&consumer), "GET", "/hello", 200, 23.4, Some(0), Some(17));
        }
        client.add_request(Some(&consumer), "GET", "/hello", 200, 108.0, Some(0), Some(17));
        client.add_validation_error(None, "POST", "/items", "body.name", "required", "missing");
        client.add_server_error(
            None,
            "GET",
            "/boom",
            &ExceptionInfo::new("Panic", "boom", "frame"),
        );

        let payload = client.build_sync_payload();
        assert_eq!(payload.requests.len(), 1);
        assert_eq!(payload.requests[0].request_count, 4);
        assert_eq!(payload.requests[0].response_size_sum, 68);
        assert_eq!(payload.validation_errors.len(), 1);
        assert_eq!(payload.server_errors.len(), 1);
        assert_eq!(payload.consumers.len(), 1);
        assert_eq!(payload.instance_uuid, client.instance_uuid());

        // Everything was drained in one step.
        let empty = client.build_sync_payload();
        assert!(empty.requests.is_empty());
        assert!(empty.validation_errors.is_empty());
        assert!(empty.server_errors.is_empty());
        assert!(empty.consumers.is_empty());
        assert_ne!(empty.message_uuid, payload.message_uuid);

        client.shutdown().await;
    }

    #[tokio::test]
    async fn hub_404_stops_sync() {
        let _guard = lock();
        let mut server = mockito::Server::new_async().await;
        let sync = server
            .mock("POST", sync_path().as_str())
            .with_status(404)
            .expect(1)
            .create_async()
            .await;

        let client = ApitallyClient::new(config(&server)).unwrap();
        // The first tick fires immediately after construction.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(client.stopped.load(Ordering::Relaxed));

        // Further sync attempts are no-ops.
        client.send_sync().await;
        sync.assert_async().await;

        client.shutdown().await;
    }

    #[tokio::test]
    async fn hub_422_drops_payload() {
        let _guard = lock();
        let mut server = mockito::Server::new_async().await;
        let _sync = server
            .mock("POST", sync_path().as_str())
            .with_status(422)
            .expect_at_least(1)
            .create_async()
            .await;

        let client = ApitallyClient::new(config(&server)).unwrap();
        client.send_sync().await;
        assert!(client.sync_queue.lock().is_empty());
        assert!(!client.stopped.load(Ordering::Relaxed));

        client.shutdown().await;
    }

    #[tokio::test]
    async fn transient_failure_requeues_payload() {
        let _guard = lock();
        let mut server = mockito::Server::new_async().await;
        // In-transport retries: one initial attempt plus three retries.
        let sync = server
            .mock("POST", sync_path().as_str())
            .with_status(503)
            .expect_at_least(4)
            .create_async()
            .await;

        let client = ApitallyClient::new(config(&server)).unwrap();
        // Wait out the in-transport retries of the first tick.
        tokio::time::sleep(Duration::from_millis(4500)).await;
        sync.assert_async().await;

        // The payload is retained for later ticks, not dropped.
        assert!(!client.sync_queue.lock().is_empty());

        client.stop_sync();
        client.shutdown().await;
    }

    #[tokio::test]
    async fn startup_data_is_sent_until_acknowledged() {
        let _guard = lock();
        let mut server = mockito::Server::new_async().await;
        let _sync = server
            .mock("POST", sync_path().as_str())
            .with_status(202)
            .create_async()
            .await;
        let startup = server
            .mock("POST", format!("/v2/{CLIENT_ID}/dev/startup").as_str())
            .match_body(Matcher::PartialJson(json!({
                "paths": [{"method": "GET", "path": "/hello"}],
                "versions": {"app": "1.2.3", "rust": "1.80.0"},
                "client": "rs:axum",
            })))
            .with_status(202)
            .expect(1)
            .create_async()
            .await;

        let config = config(&server).with_app_version("1.2.3");
        let client = ApitallyClient::new(config).unwrap();
        client.set_startup_data(
            vec![PathInfo::new("GET", "/hello")],
            [("rust".to_owned(), "1.80.0".to_owned())],
            "rs:axum",
        );
        tokio::time::sleep(Duration::from_millis(500)).await;
        startup.assert_async().await;

        // Acknowledged, so later ticks do not resend.
        client.send_startup().await;
        startup.assert_async().await;

        client.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn hub_402_suspends_request_logging() {
        let _guard = lock();
        let mut server = mockito::Server::new_async().await;
        let _sync = server
            .mock("POST", sync_path().as_str())
            .with_status(202)
            .create_async()
            .await;
        let _log = server
            .mock("POST", Matcher::Regex(format!("^/v2/{CLIENT_ID}/dev/log")))
            .match_query(Matcher::Any)
            .with_status(402)
            .with_header("Retry-After", "1")
            .create_async()
            .await;

        let config = config(&server).with_request_logging(RequestLoggingConfig::enabled());
        let client = ApitallyClient::new(config).unwrap();
        assert!(client.request_logger.is_enabled());

        client.log_request(
            Request::new("GET", "https://x/hello"),
            Response::new(200, 0.01),
            None,
            Vec::new(),
            None,
        );
        client.request_logger.write_pending_to_file();
        client.send_log().await;

        // Suspended: new records are dropped on ingest.
        client.log_request(
            Request::new("GET", "https://x/hello"),
            Response::new(200, 0.01),
            None,
            Vec::new(),
            None,
        );
        client.request_logger.write_pending_to_file();
        client.request_logger.rotate_file();
        assert!(client.request_logger.pop_file().is_none());

        // After the Retry-After interval, maintenance lifts the suspension.
        tokio::time::sleep(Duration::from_millis(1100)).await;
        client.request_logger.maintain();
        client.log_request(
            Request::new("GET", "https://x/hello"),
            Response::new(200, 0.01),
            None,
            Vec::new(),
            None,
        );
        client.request_logger.write_pending_to_file();
        client.request_logger.rotate_file();
        assert!(client.request_logger.pop_file().is_some());

        client.shutdown().await;
    }
}
