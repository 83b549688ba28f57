//! Logging setup, request metrics, span export and process sampling.

pub mod exporter;
pub mod http_metrics;
pub mod profiling;

pub use exporter::{ExportSettings, SpanExporter, UNTRACED_TARGET};
pub use http_metrics::{HttpMetrics, InFlightGuard, RequestObservation};
pub use profiling::Profiler;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Output format for the process-wide subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Console,
}

impl LogFormat {
    /// Anything other than `console` selects JSON.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("console") {
            Self::Console
        } else {
            Self::Json
        }
    }
}

/// Installs the global subscriber. `RUST_LOG`, when set, overrides `level`.
///
/// The level filter applies to log output only; when `spans` is given its
/// bridge layer sees request spans regardless of the configured level.
///
/// # Errors
///
/// Returns an error if `level` is not a valid filter or a subscriber is
/// already installed.
pub fn init_logging(
    level: &str,
    format: LogFormat,
    spans: Option<&SpanExporter>,
) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level.to_lowercase())?,
    };

    let span_bridge = spans.map(SpanExporter::layer);
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);

    match format {
        LogFormat::Json => Registry::default()
            .with(span_bridge)
            .with(
                fmt_layer
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_filter(filter),
            )
            .try_init()?,
        LogFormat::Console => Registry::default()
            .with(span_bridge)
            .with(fmt_layer.with_ansi(true).with_filter(filter))
            .try_init()?,
    }

    Ok(())
}
