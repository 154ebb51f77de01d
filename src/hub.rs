//! Hub transport.
//!
//! Thin wrapper around an instrumented [`reqwest`] client. Transient
//! failures (408, 429, 5xx, network errors) are retried in-transport with a
//! fixed backoff; terminal statuses are classified into a [`HubOutcome`] for
//! the scheduler to act on.

use std::time::Duration;

use reqwest::{header, Client, StatusCode};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::Serialize;
use tracing::debug;
use url::Url;
use uuid::Uuid;

use crate::types::{StartupPayload, SyncPayload};

/// Path prefix of the Hub API version in use.
const HUB_VERSION: &str = "v2";
/// Total request timeout for Hub POSTs.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Fixed interval between in-transport retries.
const RETRY_INTERVAL: Duration = Duration::from_secs(1);
/// Number of in-transport retries for transient failures.
const MAX_RETRIES: u32 = 3;

/// Classified outcome of one Hub POST.
#[derive(Debug)]
pub(crate) enum HubOutcome {
    /// 2xx.
    Accepted,
    /// 402 with an optional `Retry-After` interval; only meaningful on the
    /// log endpoint.
    PaymentRequired {
        /// Parsed `Retry-After` header, integer seconds only.
        retry_after: Option<Duration>,
    },
    /// 404, the Hub does not know this client id.
    ClientNotFound,
    /// 422, the payload was rejected and must not be retried.
    PayloadRejected,
    /// Network error or retryable status, after in-transport retries.
    Transient,
}

/// HTTP client for the Hub ingestion API.
#[derive(Debug)]
pub(crate) struct HubClient {
    client: ClientWithMiddleware,
    base_url: Url,
    client_id: Uuid,
    env: String,
}

impl HubClient {
    pub(crate) fn new(base_url: Url, client_id: Uuid, env: String) -> Result<Self, reqwest::Error> {
        let retry_policy = ExponentialBackoff::builder()
            .retry_bounds(RETRY_INTERVAL, RETRY_INTERVAL)
            .build_with_max_retries(MAX_RETRIES);
        let client = Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        let client = ClientBuilder::new(client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();
        Ok(Self {
            client,
            base_url,
            client_id,
            env,
        })
    }

    /// URL of a Hub endpoint: `<base>/v2/<client_id>/<env>/<endpoint>`.
    fn endpoint_url(&self, endpoint: &str) -> Url {
        let mut url = self.base_url.clone();
        let client_id = self.client_id.to_string();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend([
                HUB_VERSION,
                client_id.as_str(),
                self.env.as_str(),
                endpoint,
            ]);
        }
        url
    }

    pub(crate) async fn send_startup(&self, payload: &StartupPayload) -> HubOutcome {
        self.post_json("startup", payload).await
    }

    pub(crate) async fn send_sync(&self, payload: &SyncPayload) -> HubOutcome {
        self.post_json("sync", payload).await
    }

    /// POST one compressed spool file to the log endpoint.
    pub(crate) async fn send_log(&self, file_uuid: Uuid, payload: Vec<u8>) -> HubOutcome {
        let mut url = self.endpoint_url("log");
        url.query_pairs_mut()
            .append_pair("uuid", &file_uuid.to_string());
        let result = self
            .client
            .post(url)
            .header(header::CONTENT_TYPE, "application/gzip")
            .body(payload)
            .send()
            .await;
        classify(result)
    }

    async fn post_json<T: Serialize>(&self, endpoint: &str, payload: &T) -> HubOutcome {
        let result = self
            .client
            .post(self.endpoint_url(endpoint))
            .json(payload)
            .send()
            .await;
        classify(result)
    }
}

fn classify(result: Result<reqwest::Response, reqwest_middleware::Error>) -> HubOutcome {
    match result {
        Ok(response) if response.status().is_success() => HubOutcome::Accepted,
        Ok(response) => match response.status() {
            StatusCode::PAYMENT_REQUIRED => HubOutcome::PaymentRequired {
                retry_after: parse_retry_after(&response),
            },
            StatusCode::NOT_FOUND => HubOutcome::ClientNotFound,
            StatusCode::UNPROCESSABLE_ENTITY => HubOutcome::PayloadRejected,
            status => {
                debug!(%status, "hub request failed");
                HubOutcome::Transient
            }
        },
        Err(err) => {
            debug!(error = %err, "hub request error");
            HubOutcome::Transient
        }
    }
}

/// Parse a `Retry-After` header as integer seconds. HTTP-date values are
/// not accepted.
fn parse_retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
        .map(Duration::from_secs)
}
