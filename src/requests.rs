//! Aggregated per-endpoint request counters and histograms.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use serde::Serialize;

/// Bucket width for response time histograms, in milliseconds.
const RESPONSE_TIME_BUCKET_MS: u64 = 10;
/// Bucket width for payload size histograms, in bytes.
const SIZE_BUCKET_BYTES: u64 = 1000;

/// Aggregation key for request counters.
///
/// Requests aggregate per consumer, method, route template and status code.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct RequestKey {
    consumer: Option<String>,
    method: String,
    path: String,
    status_code: u16,
}

/// Aggregated values for one [`RequestKey`].
#[derive(Debug, Default)]
struct RequestEntry {
    request_count: u64,
    request_size_sum: u64,
    response_size_sum: u64,
    response_times: BTreeMap<u64, u64>,
    request_sizes: BTreeMap<u64, u64>,
    response_sizes: BTreeMap<u64, u64>,
}

/// One aggregated row of the `requests` list in a sync payload.
#[derive(Debug, Serialize)]
#[non_exhaustive]
pub(crate) struct RequestsItem {
    pub(crate) consumer: Option<String>,
    pub(crate) method: String,
    pub(crate) path: String,
    pub(crate) status_code: u16,
    pub(crate) request_count: u64,
    pub(crate) request_size_sum: u64,
    pub(crate) response_size_sum: u64,
    /// Histogram of response times, bucketed to 10 ms.
    pub(crate) response_times: BTreeMap<u64, u64>,
    /// Histogram of request body sizes, bucketed to kilobytes.
    pub(crate) request_sizes: BTreeMap<u64, u64>,
    /// Histogram of response body sizes, bucketed to kilobytes.
    pub(crate) response_sizes: BTreeMap<u64, u64>,
}

/// Concurrent per-endpoint request counter.
///
/// Writers take a short lock per observation; the drain swaps out the whole
/// map so readers always see a consistent snapshot.
#[derive(Debug, Default)]
pub(crate) struct RequestCounter {
    inner: Mutex<HashMap<RequestKey, RequestEntry>>,
}

impl RequestCounter {
    /// Record one served request.
    ///
    /// `response_time` is in milliseconds. Negative sizes are ignored.
    pub(crate) fn add_request(
        &self,
        consumer: Option<&str>,
        method: &str,
        path: &str,
        status_code: u16,
        response_time: f64,
        request_size: Option<i64>,
        response_size: Option<i64>,
    ) {
        let key = RequestKey {
            consumer: consumer.map(ToOwned::to_owned),
            method: method.to_ascii_uppercase(),
            path: path.to_owned(),
            status_code,
        };
        let response_time_bucket =
            (response_time.max(0.0) as u64) / RESPONSE_TIME_BUCKET_MS * RESPONSE_TIME_BUCKET_MS;

        let mut inner = self.inner.lock();
        let entry = inner.entry(key).or_default();
        entry.request_count += 1;
        *entry.response_times.entry(response_time_bucket).or_default() += 1;
        if let Some(size) = request_size.filter(|size| *size >= 0) {
            let size = size as u64;
            entry.request_size_sum += size;
            *entry.request_sizes.entry(size / SIZE_BUCKET_BYTES).or_default() += 1;
        }
        if let Some(size) = response_size.filter(|size| *size >= 0) {
            let size = size as u64;
            entry.response_size_sum += size;
            *entry.response_sizes.entry(size / SIZE_BUCKET_BYTES).or_default() += 1;
        }
    }

    /// Emit one [`RequestsItem`] per key and atomically clear all state.
    pub(crate) fn get_and_reset_requests(&self) -> Vec<RequestsItem> {
        let drained = std::mem::take(&mut *self.inner.lock());
        drained
            .into_iter()
            .map(|(key, entry)| RequestsItem {
                consumer: key.consumer,
                method: key.method,
                path: key.path,
                status_code: key.status_code,
                request_count: entry.request_count,
                request_size_sum: entry.request_size_sum,
                response_size_sum: entry.response_size_sum,
                response_times: entry.response_times,
                request_sizes: entry.request_sizes,
                response_sizes: entry.response_sizes,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn aggregates_per_key() {
        let counter = RequestCounter::default();
        for _ in 0..3 {
            counter.add_request(Some("alice"), "GET", "/hello", 200, 23.4, Some(0), Some(17));
        }
        counter.add_request(Some("alice"), "get", "/hello", 200, 108.0, Some(0), Some(17));

        let mut items = counter.get_and_reset_requests();
        assert_eq!(items.len(), 1);
        let item = items.pop().unwrap();
        assert_eq!(item.consumer.as_deref(), Some("alice"));
        assert_eq!(item.method, "GET");
        assert_eq!(item.path, "/hello");
        assert_eq!(item.status_code, 200);
        assert_eq!(item.request_count, 4);
        assert_eq!(item.request_size_sum, 0);
        assert_eq!(item.response_size_sum, 68);
        assert_eq!(item.response_times, BTreeMap::from([(20, 3), (100, 1)]));
        assert_eq!(item.request_sizes, BTreeMap::from([(0, 4)]));
        assert_eq!(item.response_sizes, BTreeMap::from([(0, 4)]));
    }

    #[test]
    fn drain_resets_state() {
        let counter = RequestCounter::default();
        counter.add_request(None, "GET", "/a", 200, 5.0, None, None);
        assert_eq!(counter.get_and_reset_requests().len(), 1);
        assert!(counter.get_and_reset_requests().is_empty());
    }

    #[test]
    fn distinct_keys_stay_independent() {
        let counter = RequestCounter::default();
        counter.add_request(None, "GET", "/a", 200, 5.0, None, None);
        counter.add_request(None, "GET", "/a", 404, 5.0, None, None);
        counter.add_request(None, "POST", "/a", 200, 5.0, None, None);
        counter.add_request(Some("u"), "GET", "/a", 200, 5.0, None, None);
        counter.add_request(None, "GET", "/b", 200, 5.0, None, None);

        let items = counter.get_and_reset_requests();
        assert_eq!(items.len(), 5);
        assert!(items.iter().all(|item| item.request_count == 1));
    }

    #[test]
    fn total_count_matches_observations() {
        let counter = RequestCounter::default();
        for i in 0..137 {
            counter.add_request(None, "GET", "/a", if i % 2 == 0 { 200 } else { 500 }, 1.0, None, None);
        }
        let total: u64 = counter
            .get_and_reset_requests()
            .iter()
            .map(|item| item.request_count)
            .sum();
        assert_eq!(total, 137);
    }

    #[test]
    fn negative_sizes_are_dropped() {
        let counter = RequestCounter::default();
        counter.add_request(None, "GET", "/a", 200, 1.0, Some(-5), Some(2500));
        let items = counter.get_and_reset_requests();
        assert_eq!(items[0].request_size_sum, 0);
        assert!(items[0].request_sizes.is_empty());
        assert_eq!(items[0].response_size_sum, 2500);
        assert_eq!(items[0].response_sizes, BTreeMap::from([(2, 1)]));
    }

    #[test]
    fn histogram_keys_serialize_as_strings() {
        let counter = RequestCounter::default();
        counter.add_request(None, "GET", "/a", 200, 23.4, None, Some(17));
        let items = counter.get_and_reset_requests();
        let value = serde_json::to_value(&items[0]).unwrap();
        assert_eq!(value["response_times"]["20"], serde_json::json!(1));
        assert_eq!(value["response_sizes"]["0"], serde_json::json!(1));
    }
}
