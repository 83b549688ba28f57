//! HTTP request metrics on an owned Prometheus recorder.
//!
//! The recorder is not installed globally: every instrument is registered
//! directly on it, so tests and multiple service instances never share state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics::{Gauge, Key, KeyName, Label, Level, Metadata, Recorder, SharedString, Unit};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle, PrometheusRecorder};

pub const REQUEST_DURATION: &str = "request_duration_seconds";
pub const REQUESTS_TOTAL: &str = "requests_total";
pub const REQUESTS_IN_FLIGHT: &str = "requests_in_flight";
pub const REQUEST_SIZE: &str = "request_size_bytes";
pub const RESPONSE_SIZE: &str = "response_size_bytes";
pub const ERROR_RATE: &str = "error_rate_total";
pub const PROCESS_UPTIME: &str = "process_uptime_seconds";
pub const RUNTIME_WORKERS: &str = "runtime_worker_threads";

const DURATION_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];
const SIZE_BUCKETS: &[f64] = &[100.0, 1_000.0, 10_000.0, 100_000.0, 1_000_000.0];

/// Outcome of one finished request, as seen by the metrics stage.
#[derive(Debug, Clone)]
pub struct RequestObservation<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub status: u16,
    pub request_bytes: u64,
    pub response_bytes: u64,
    pub duration: Duration,
}

pub struct HttpMetrics {
    recorder: PrometheusRecorder,
    handle: PrometheusHandle,
    in_flight: Arc<AtomicU64>,
}

impl std::fmt::Debug for HttpMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpMetrics")
            .field("in_flight", &self.in_flight_count())
            .finish_non_exhaustive()
    }
}

fn metadata() -> Metadata<'static> {
    Metadata::new(module_path!(), Level::INFO, Some(module_path!()))
}

fn key(name: &'static str, labels: Vec<Label>) -> Key {
    Key::from_parts(name, labels)
}

fn labels(method: &str, path: &str, status: Option<u16>) -> Vec<Label> {
    let mut labels = vec![
        Label::new("method", method.to_owned()),
        Label::new("path", path.to_owned()),
    ];
    if let Some(code) = status {
        labels.push(Label::new("code", code.to_string()));
    }
    labels
}

impl HttpMetrics {
    /// # Errors
    ///
    /// Returns an error if a bucket configuration is rejected.
    pub fn new() -> Result<Self, BuildError> {
        let recorder = PrometheusBuilder::new()
            .set_buckets_for_metric(Matcher::Full(REQUEST_DURATION.to_string()), DURATION_BUCKETS)?
            .set_buckets_for_metric(Matcher::Suffix("_size_bytes".to_string()), SIZE_BUCKETS)?
            .build_recorder();
        let handle = recorder.handle();

        let describe = |name: &'static str, unit: Option<Unit>, help: &'static str| {
            recorder.describe_histogram(KeyName::from(name), unit, SharedString::from(help));
        };
        describe(REQUEST_DURATION, Some(Unit::Seconds), "Duration of HTTP requests in seconds");
        describe(REQUEST_SIZE, Some(Unit::Bytes), "Size of HTTP requests in bytes");
        describe(RESPONSE_SIZE, Some(Unit::Bytes), "Size of HTTP responses in bytes");
        recorder.describe_counter(
            KeyName::from(REQUESTS_TOTAL),
            None,
            SharedString::from("Total number of HTTP requests"),
        );
        recorder.describe_counter(
            KeyName::from(ERROR_RATE),
            None,
            SharedString::from("Total number of HTTP errors"),
        );
        recorder.describe_gauge(
            KeyName::from(REQUESTS_IN_FLIGHT),
            None,
            SharedString::from("Number of HTTP requests currently being processed"),
        );

        Ok(Self {
            recorder,
            handle,
            in_flight: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Increments the in-flight gauge for `(method, path)` until the guard drops.
    #[must_use]
    pub fn track_in_flight(&self, method: &str, path: &str) -> InFlightGuard {
        let gauge = self
            .recorder
            .register_gauge(&key(REQUESTS_IN_FLIGHT, labels(method, path, None)), &metadata());
        gauge.increment(1.0);
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            gauge,
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    /// Records the terminal signals for a finished request.
    #[allow(clippy::cast_precision_loss)]
    pub fn observe(&self, obs: &RequestObservation<'_>) {
        let meta = metadata();
        let labels = labels(obs.method, obs.path, Some(obs.status));

        self.recorder
            .register_histogram(&key(REQUEST_DURATION, labels.clone()), &meta)
            .record(obs.duration.as_secs_f64());
        self.recorder
            .register_counter(&key(REQUESTS_TOTAL, labels.clone()), &meta)
            .increment(1);
        self.recorder
            .register_histogram(&key(REQUEST_SIZE, labels.clone()), &meta)
            .record(obs.request_bytes as f64);
        self.recorder
            .register_histogram(&key(RESPONSE_SIZE, labels.clone()), &meta)
            .record(obs.response_bytes as f64);

        if obs.status >= 500 {
            self.recorder
                .register_counter(&key(ERROR_RATE, labels), &meta)
                .increment(1);
        }
    }

    /// Publishes a process-level gauge sampled by the profiler.
    pub fn set_process_gauge(&self, name: &'static str, value: f64) {
        self.recorder
            .register_gauge(&key(name, Vec::new()), &metadata())
            .set(value);
    }

    /// Requests currently between the metrics stage's entry and exit.
    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Prometheus text exposition of everything recorded so far.
    #[must_use]
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// Decrements the in-flight gauge and counter on drop, including on panic
/// unwind and when the request future is dropped mid-flight.
#[derive(Debug)]
pub struct InFlightGuard {
    gauge: Gauge,
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.gauge.decrement(1.0);
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
