//! Periodic process sampler.
//!
//! Every tick publishes uptime and runtime worker count as gauges on the
//! owned metrics recorder, next to the in-flight request gauge, so they are
//! scraped from the metrics endpoint. Nothing is uploaded.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, info};

use super::http_metrics::{HttpMetrics, PROCESS_UPTIME, RUNTIME_WORKERS};
use crate::service::worker::{BackgroundRunnable, BackgroundWorker};

pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessSample {
    pub uptime_secs: u64,
    pub in_flight_requests: u64,
    pub runtime_workers: usize,
}

#[derive(Debug)]
pub enum ProfilingTask {
    SampleNow,
}

struct SamplerState {
    started: Instant,
    metrics: Arc<HttpMetrics>,
    samples: u64,
}

impl SamplerState {
    #[allow(clippy::cast_precision_loss)]
    fn sample(&mut self) {
        let sample = ProcessSample {
            uptime_secs: self.started.elapsed().as_secs(),
            in_flight_requests: self.metrics.in_flight_count(),
            runtime_workers: tokio::runtime::Handle::current().metrics().num_workers(),
        };
        self.metrics
            .set_process_gauge(PROCESS_UPTIME, sample.uptime_secs as f64);
        self.metrics
            .set_process_gauge(RUNTIME_WORKERS, sample.runtime_workers as f64);
        self.samples += 1;
        debug!(
            uptime_secs = sample.uptime_secs,
            in_flight = sample.in_flight_requests,
            workers = sample.runtime_workers,
            "Process sample"
        );
    }
}

#[async_trait]
impl BackgroundRunnable for SamplerState {
    type Task = ProfilingTask;

    async fn run(&mut self, task: ProfilingTask) {
        match task {
            ProfilingTask::SampleNow => self.sample(),
        }
    }

    async fn on_tick(&mut self) {
        self.sample();
    }

    async fn shutdown(&mut self) {
        info!(samples = self.samples, "Profiler stopped");
    }
}

/// Owner of the sampling worker. Stopped as the last shutdown step.
pub struct Profiler {
    worker: BackgroundWorker<SamplerState>,
}

impl Profiler {
    /// Starts sampling every `interval`.
    #[must_use]
    pub fn start(metrics: Arc<HttpMetrics>, interval: Duration) -> Self {
        let state = SamplerState {
            started: Instant::now(),
            metrics,
            samples: 0,
        };
        Self {
            worker: BackgroundWorker::start(state, interval, 8),
        }
    }

    /// Takes a sample outside the regular schedule.
    ///
    /// # Errors
    ///
    /// Returns an error if the profiler has stopped.
    pub async fn sample_now(&self) -> anyhow::Result<()> {
        self.worker.submit(ProfilingTask::SampleNow).await
    }

    pub async fn stop(mut self) {
        self.worker.stop().await;
    }
}
