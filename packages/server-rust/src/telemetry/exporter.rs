//! Span export over OTLP.
//!
//! Request spans are ordinary `tracing` spans; the layer returned by
//! [`SpanExporter::layer`] bridges them into an OpenTelemetry tracer provider
//! whose batch processor ships them to `<endpoint>/v1/traces`. Recording never
//! blocks the request path: the processor queue drops spans when full.

use std::time::Duration;

use anyhow::Context as _;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::{Protocol, WithExportConfig};
use opentelemetry_sdk::trace::{
    BatchConfigBuilder, BatchSpanProcessor, Sampler, SdkTracerProvider,
    SpanExporter as SpanBackend,
};
use opentelemetry_sdk::Resource;
use tracing::{Level, Metadata};
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::{Layer, Registry};

use crate::service::config::ServiceConfig;

/// Default interval between scheduled batch exports.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Spans and events under this target never reach the exporter.
pub const UNTRACED_TARGET: &str = "profile_server::untraced";

const QUEUE_CAPACITY: usize = 2048;
const TRACES_PATH: &str = "/v1/traces";
const TRACER_NAME: &str = "profile-server";
const EXPORT_TIMEOUT: Duration = Duration::from_secs(10);

/// What the tracer provider reports about this process and how it batches.
#[derive(Debug, Clone)]
pub struct ExportSettings {
    pub service_name: String,
    pub service_version: String,
    pub environment: String,
    /// Ratio of root traces sampled; inbound sampling decisions are honoured.
    pub sample_rate: f64,
    pub batch_size: usize,
    pub flush_interval: Duration,
}

impl ExportSettings {
    #[must_use]
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            service_name: config.service_name.clone(),
            service_version: config.service_version.clone(),
            environment: config.environment.clone(),
            sample_rate: config.tracing_sample_rate,
            batch_size: config.tracing_batch_size,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }

    fn sampler(&self) -> Sampler {
        Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
            self.sample_rate.clamp(0.0, 1.0),
        )))
    }

    fn resource(&self) -> Resource {
        Resource::builder()
            .with_service_name(self.service_name.clone())
            .with_attributes([
                KeyValue::new("service.version", self.service_version.clone()),
                KeyValue::new("deployment.environment", self.environment.clone()),
            ])
            .build()
    }
}

/// Owner of the tracer provider. Shut down once, by the shutdown sequence.
#[derive(Debug)]
pub struct SpanExporter {
    provider: SdkTracerProvider,
}

impl SpanExporter {
    /// Exports to an OTLP/HTTP collector at `endpoint` (e.g. `http://localhost:4318`).
    ///
    /// # Errors
    ///
    /// Returns an error if the OTLP exporter cannot be built.
    pub fn otlp(endpoint: &str, settings: &ExportSettings) -> anyhow::Result<Self> {
        let url = format!("{}{TRACES_PATH}", endpoint.trim_end_matches('/'));
        let backend = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_protocol(Protocol::HttpBinary)
            .with_endpoint(url)
            .with_timeout(EXPORT_TIMEOUT)
            .build()
            .context("building OTLP span exporter")?;
        Ok(Self::with_backend(backend, settings))
    }

    /// Batches finished spans into `backend`.
    #[must_use]
    pub fn with_backend<E>(backend: E, settings: &ExportSettings) -> Self
    where
        E: SpanBackend + 'static,
    {
        let batching = BatchConfigBuilder::default()
            .with_max_queue_size(QUEUE_CAPACITY)
            .with_max_export_batch_size(settings.batch_size.clamp(1, QUEUE_CAPACITY))
            .with_scheduled_delay(settings.flush_interval)
            .build();
        let processor = BatchSpanProcessor::builder(backend)
            .with_batch_config(batching)
            .build();
        let provider = SdkTracerProvider::builder()
            .with_span_processor(processor)
            .with_sampler(settings.sampler())
            .with_resource(settings.resource())
            .build();
        Self { provider }
    }

    /// Bridge from `tracing` spans at INFO and above, excluding
    /// [`UNTRACED_TARGET`]. Filtered independently of the log level.
    #[must_use]
    pub fn layer(&self) -> impl Layer<Registry> + Send + Sync + 'static {
        tracing_opentelemetry::layer()
            .with_tracer(self.provider.tracer(TRACER_NAME))
            .with_filter(filter_fn(exportable))
    }

    /// Exports everything queued so far. Blocks until the processor answers.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider has shut down or the export failed.
    pub fn force_flush(&self) -> anyhow::Result<()> {
        self.provider.force_flush().context("flushing pending spans")
    }

    /// Flushes, then shuts the provider down. The provider is shut down even
    /// when the flush fails.
    ///
    /// # Errors
    ///
    /// Returns the flush error if any, else the shutdown error.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        tokio::task::spawn_blocking(move || {
            let flushed = self.force_flush();
            let stopped = self
                .provider
                .shutdown()
                .context("shutting down tracer provider");
            flushed.and(stopped)
        })
        .await
        .context("span exporter shutdown task failed")?
    }
}

fn exportable(meta: &Metadata<'_>) -> bool {
    meta.target() != UNTRACED_TARGET && *meta.level() <= Level::INFO
}

#[cfg(test)]
mod tests {
    use opentelemetry_sdk::trace::{InMemorySpanExporter, InMemorySpanExporterBuilder};
    use tracing::info_span;
    use tracing_subscriber::layer::SubscriberExt;

    use super::*;

    fn settings(sample_rate: f64) -> ExportSettings {
        ExportSettings {
            service_name: "profile-service".into(),
            service_version: "test".into(),
            environment: "development".into(),
            sample_rate,
            batch_size: 512,
            flush_interval: Duration::from_secs(60),
        }
    }

    fn span_names(backend: &InMemorySpanExporter) -> Vec<String> {
        backend
            .get_finished_spans()
            .unwrap()
            .into_iter()
            .map(|span| span.name.into_owned())
            .collect()
    }

    #[test]
    fn force_flush_exports_finished_spans() {
        let backend = InMemorySpanExporter::default();
        let exporter = SpanExporter::with_backend(backend.clone(), &settings(1.0));
        let subscriber = Registry::default().with(exporter.layer());

        tracing::subscriber::with_default(subscriber, || {
            info_span!("request").in_scope(|| {});
        });
        exporter.force_flush().unwrap();

        let spans = backend.get_finished_spans().unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].name, "request");
    }

    #[test]
    fn debug_and_untraced_spans_are_not_exported() {
        let backend = InMemorySpanExporter::default();
        let exporter = SpanExporter::with_backend(backend.clone(), &settings(1.0));
        let subscriber = Registry::default().with(exporter.layer());

        tracing::subscriber::with_default(subscriber, || {
            tracing::debug_span!("chatty").in_scope(|| {});
            info_span!(target: UNTRACED_TARGET, "health").in_scope(|| {});
            info_span!("kept").in_scope(|| {});
        });
        exporter.force_flush().unwrap();

        assert_eq!(span_names(&backend), vec!["kept".to_string()]);
    }

    #[test]
    fn zero_sample_rate_drops_root_spans() {
        let backend = InMemorySpanExporter::default();
        let exporter = SpanExporter::with_backend(backend.clone(), &settings(0.0));
        let subscriber = Registry::default().with(exporter.layer());

        tracing::subscriber::with_default(subscriber, || {
            info_span!("request").in_scope(|| {});
        });
        exporter.force_flush().unwrap();

        assert!(span_names(&backend).is_empty());
    }

    #[test]
    fn settings_follow_config() {
        let config = ServiceConfig::default();
        let settings = ExportSettings::from_config(&config);
        assert_eq!(settings.service_name, config.service_name);
        assert_eq!(settings.batch_size, config.tracing_batch_size);
        assert_eq!(settings.flush_interval, DEFAULT_FLUSH_INTERVAL);
    }

    #[tokio::test]
    async fn shutdown_flushes_pending_spans() {
        let backend = InMemorySpanExporterBuilder::new()
            .keep_records_on_shutdown()
            .build();
        let exporter = SpanExporter::with_backend(backend.clone(), &settings(1.0));
        let subscriber = Registry::default().with(exporter.layer());

        tracing::subscriber::with_default(subscriber, || {
            info_span!("request").in_scope(|| {});
        });
        exporter.shutdown().await.unwrap();

        assert_eq!(span_names(&backend), vec!["request".to_string()]);
    }
}
