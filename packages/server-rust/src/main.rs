//! Profile service entry point.
//!
//! Startup failures (invalid configuration, store initialization, bind)
//! exit non-zero before anything is served. After a termination signal the
//! shutdown sequence always runs to completion and the process exits 0.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};

use profile_server::network::{
    termination_signal, AppState, NetworkConfig, NetworkModule, ReadinessGate, ShutdownController,
    ShutdownReport, ShutdownSequence,
};
use profile_server::service::auth::HttpAuthResolver;
use profile_server::service::middleware::{AuthPolicy, ExemptPaths, IngressPipeline};
use profile_server::service::store::{MemoryProfileStore, ProfileStore};
use profile_server::service::{ServiceConfig, ServiceError};
use profile_server::telemetry::profiling::DEFAULT_SAMPLE_INTERVAL;
use profile_server::telemetry::{
    init_logging, ExportSettings, HttpMetrics, LogFormat, Profiler, SpanExporter,
};

#[tokio::main]
async fn main() -> ExitCode {
    let config = ServiceConfig::parse();
    if let Err(e) = config.validate().map_err(ServiceError::from) {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }

    // The tracer provider exists before logging so request spans reach it.
    let exporter = if config.tracing_enabled {
        match SpanExporter::otlp(&config.tracing_endpoint, &ExportSettings::from_config(&config)) {
            Ok(exporter) => Some(exporter),
            Err(e) => {
                eprintln!("{}", unavailable("span exporter")(e));
                return ExitCode::FAILURE;
            }
        }
    } else {
        None
    };

    if let Err(e) = init_logging(
        &config.log_level,
        LogFormat::parse(&config.log_format),
        exporter.as_ref(),
    ) {
        eprintln!("failed to initialize logging: {e:#}");
        return ExitCode::FAILURE;
    }

    match run(config, exporter).await {
        Ok(report) => {
            info!(summary = %report, "Service stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Startup failed");
            ExitCode::FAILURE
        }
    }
}

fn unavailable<E>(resource: &'static str) -> impl FnOnce(E) -> ServiceError
where
    E: Into<anyhow::Error>,
{
    move |e| ServiceError::ResourceUnavailable {
        resource,
        source: e.into(),
    }
}

#[cfg(feature = "postgres")]
fn build_store(config: &ServiceConfig) -> Result<Arc<dyn ProfileStore>, ServiceError> {
    use profile_server::service::store::PgProfileStore;

    match &config.database_url {
        Some(url) => {
            let store = PgProfileStore::connect_lazy(url, config.db_max_connections)
                .map_err(unavailable("profile store"))?;
            info!(max_connections = config.db_max_connections, "Using PostgreSQL profile store");
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(MemoryProfileStore::new())),
    }
}

#[cfg(not(feature = "postgres"))]
fn build_store(config: &ServiceConfig) -> Result<Arc<dyn ProfileStore>, ServiceError> {
    if config.database_url.is_some() {
        warn!("DATABASE_URL is set but the postgres feature is disabled; using in-memory store");
    }
    Ok(Arc::new(MemoryProfileStore::new()))
}

async fn run(
    config: ServiceConfig,
    exporter: Option<SpanExporter>,
) -> Result<ShutdownReport, ServiceError> {
    if exporter.is_some() {
        info!(
            endpoint = %config.tracing_endpoint,
            sample_rate = config.tracing_sample_rate,
            "Span export enabled"
        );
    }

    let metrics = Arc::new(
        HttpMetrics::new().map_err(unavailable("metrics recorder"))?,
    );

    let profiler = if config.profiling_enabled {
        info!(
            interval_secs = DEFAULT_SAMPLE_INTERVAL.as_secs(),
            "Process sampling enabled"
        );
        Some(Profiler::start(Arc::clone(&metrics), DEFAULT_SAMPLE_INTERVAL))
    } else {
        None
    };

    let store = build_store(&config)?;
    store
        .initialize()
        .await
        .map_err(unavailable("profile store"))?;

    let resolver = HttpAuthResolver::new(&config.auth_service_url)
        .map_err(unavailable("identity client"))?;
    let policy = AuthPolicy::from_fallback_flag(config.allow_unauthenticated_fallback);
    if policy == AuthPolicy::Fallback {
        warn!("Unauthenticated fallback enabled: failed authentication continues as the demo principal");
    }

    let network_config = NetworkConfig::from(&config);
    let mut exempt = ExemptPaths::default();
    if let Some(path) = &network_config.metrics_path {
        exempt = exempt.with(path);
    }

    let readiness = Arc::new(ReadinessGate::new());
    let pipeline = IngressPipeline::new(
        exempt,
        Arc::clone(&metrics),
        Arc::new(resolver),
        policy,
    );
    let state = AppState {
        readiness: Arc::clone(&readiness),
        metrics,
        store: Arc::clone(&store),
    };

    let controller = ShutdownController::from_config(readiness, &network_config);
    let mut module = NetworkModule::new(network_config);
    let addr = module.start().await.map_err(ServiceError::Bind)?;
    let router = module.build_router(state, &pipeline);
    let listener = module.serve(router).map_err(ServiceError::Bind)?;

    info!(
        service = %config.service_name,
        version = %config.service_version,
        env = %config.environment,
        port = addr.port(),
        "Service started"
    );

    let mut sequence = ShutdownSequence::new()
        .then("listener", listener.shutdown())
        .then("profile_store", async move {
            store.close().await.map_err(anyhow::Error::from)
        });
    if let Some(exporter) = exporter {
        sequence = sequence.then("span_exporter", exporter.shutdown());
    }
    if let Some(profiler) = profiler {
        sequence = sequence.then("profiler", async move {
            profiler.stop().await;
            Ok(())
        });
    }

    Ok(controller.run(termination_signal(), sequence).await)
}
