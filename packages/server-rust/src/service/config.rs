//! Environment-driven service configuration.
//!
//! Every option can be supplied as an environment variable or a `--long` flag.
//! `validate()` collects all problems instead of stopping at the first one so
//! a misconfigured deployment reports everything in a single crash loop.

use std::time::Duration;

use clap::{ArgAction, Parser};

/// Default and upper bound for the shutdown deadline.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
pub const MAX_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(60);

/// Default and upper bound for the readiness drain delay.
pub const DEFAULT_DRAIN_DELAY: Duration = Duration::from_secs(5);
pub const MAX_DRAIN_DELAY: Duration = Duration::from_secs(30);

const VALID_ENVS: &[&str] = &["development", "dev", "staging", "stage", "production", "prod"];
const VALID_LOG_LEVELS: &[&str] = &["debug", "info", "warn", "error"];
const VALID_LOG_FORMATS: &[&str] = &["json", "console"];

/// Errors produced while validating configuration. Always fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration validation failed:\n  - {}", .0.join("\n  - "))]
    Invalid(Vec<String>),
}

/// Full service configuration, read from the environment.
#[derive(Debug, Clone, Parser)]
#[command(name = "profile-server", version, about = "User-profile service")]
#[allow(clippy::struct_excessive_bools)]
pub struct ServiceConfig {
    /// Service name reported in logs, spans and profiles.
    #[arg(long, env = "SERVICE_NAME", default_value = "profile-service")]
    pub service_name: String,

    /// Build version reported in logs and span resources.
    #[arg(long, env = "VERSION", default_value = "dev")]
    pub service_version: String,

    /// Deployment environment.
    #[arg(long = "env", env = "ENV", default_value = "development")]
    pub environment: String,

    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// `json` or `console`.
    #[arg(long, env = "LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    #[arg(long, env = "TRACING_ENABLED", default_value_t = true, action = ArgAction::Set, value_parser = parse_flag)]
    pub tracing_enabled: bool,

    #[arg(long, env = "OTEL_COLLECTOR_ENDPOINT", default_value = "http://localhost:4318")]
    pub tracing_endpoint: String,

    #[arg(long, env = "OTEL_SAMPLE_RATE", default_value_t = 0.1)]
    pub tracing_sample_rate: f64,

    #[arg(long, env = "OTEL_BATCH_SIZE", default_value_t = 512)]
    pub tracing_batch_size: usize,

    #[arg(long, env = "PROFILING_ENABLED", default_value_t = false, action = ArgAction::Set, value_parser = parse_flag)]
    pub profiling_enabled: bool,

    #[arg(long, env = "METRICS_ENABLED", default_value_t = true, action = ArgAction::Set, value_parser = parse_flag)]
    pub metrics_enabled: bool,

    #[arg(long, env = "METRICS_PATH", default_value = "/metrics")]
    pub metrics_path: String,

    /// Shutdown deadline, e.g. `10s`. Values outside `(0, 60s]` fall back to the default.
    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value = "10s")]
    pub shutdown_timeout: String,

    /// Pause between failing readiness and closing the listener, e.g. `5s`.
    /// Values outside `(0, 30s]` fall back to the default.
    #[arg(long, env = "READINESS_DRAIN_DELAY", default_value = "5s")]
    pub readiness_drain_delay: String,

    /// Upper bound on a single request, including the identity-service call.
    #[arg(long, env = "REQUEST_TIMEOUT", default_value = "30s")]
    pub request_timeout: String,

    #[arg(long, env = "AUTH_SERVICE_URL", default_value = "http://auth.auth.svc.cluster.local:8080")]
    pub auth_service_url: String,

    /// Demo-only: substitute a fixed principal when authentication fails.
    #[arg(long, env = "AUTH_ALLOW_UNAUTHENTICATED_FALLBACK", default_value_t = false, action = ArgAction::Set, value_parser = parse_flag)]
    pub allow_unauthenticated_fallback: bool,

    /// PostgreSQL connection string. Requires the `postgres` feature; without
    /// it the service runs on the in-memory store.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    #[arg(long, env = "DB_POOL_MAX_CONNECTIONS", default_value_t = 25)]
    pub db_max_connections: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::parse_from(["profile-server"])
    }
}

impl ServiceConfig {
    /// Checks cross-field constraints. Returns every violation found.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` listing each problem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.service_name.trim().is_empty() {
            errors.push("SERVICE_NAME is required (e.g., 'user', 'profile')".to_string());
        }
        if !VALID_ENVS.contains(&self.environment.as_str()) {
            errors.push(format!(
                "ENV must be one of {VALID_ENVS:?}, got: {}",
                self.environment
            ));
        }
        if !VALID_LOG_LEVELS.contains(&self.log_level.to_lowercase().as_str()) {
            errors.push(format!(
                "LOG_LEVEL must be one of {VALID_LOG_LEVELS:?}, got: {}",
                self.log_level
            ));
        }
        if !VALID_LOG_FORMATS.contains(&self.log_format.to_lowercase().as_str()) {
            errors.push(format!(
                "LOG_FORMAT must be one of {VALID_LOG_FORMATS:?}, got: {}",
                self.log_format
            ));
        }

        if self.tracing_enabled {
            if self.tracing_endpoint.is_empty() {
                errors.push("OTEL_COLLECTOR_ENDPOINT is required when tracing is enabled".to_string());
            }
            if !(0.0..=1.0).contains(&self.tracing_sample_rate) {
                errors.push(format!(
                    "OTEL_SAMPLE_RATE must be between 0.0 and 1.0, got: {:.2}",
                    self.tracing_sample_rate
                ));
            }
            if self.tracing_batch_size == 0 {
                errors.push("OTEL_BATCH_SIZE must be greater than 0".to_string());
            }
        }

        if self.metrics_enabled && !self.metrics_path.starts_with('/') {
            errors.push(format!(
                "METRICS_PATH must start with '/', got: {}",
                self.metrics_path
            ));
        }

        if parse_duration(&self.request_timeout).is_none_or(|d| d.is_zero()) {
            errors.push(format!(
                "REQUEST_TIMEOUT must be a positive duration, got: {}",
                self.request_timeout
            ));
        }

        if self.auth_service_url.is_empty() {
            errors.push("AUTH_SERVICE_URL is required".to_string());
        }

        if self.allow_unauthenticated_fallback && self.is_production() {
            errors.push(
                "AUTH_ALLOW_UNAUTHENTICATED_FALLBACK must not be enabled in production".to_string(),
            );
        }

        if self.db_max_connections == 0 {
            errors.push("DB_POOL_MAX_CONNECTIONS must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }

    #[must_use]
    pub fn is_production(&self) -> bool {
        matches!(self.environment.to_lowercase().as_str(), "production" | "prod")
    }

    #[must_use]
    pub fn is_development(&self) -> bool {
        matches!(self.environment.to_lowercase().as_str(), "development" | "dev")
    }

    /// Shutdown deadline, reverting to the default when out of range.
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        bounded_duration(
            "SHUTDOWN_TIMEOUT",
            &self.shutdown_timeout,
            DEFAULT_SHUTDOWN_TIMEOUT,
            MAX_SHUTDOWN_TIMEOUT,
        )
    }

    /// Readiness drain delay, reverting to the default when out of range.
    #[must_use]
    pub fn drain_delay(&self) -> Duration {
        bounded_duration(
            "READINESS_DRAIN_DELAY",
            &self.readiness_drain_delay,
            DEFAULT_DRAIN_DELAY,
            MAX_DRAIN_DELAY,
        )
    }

    /// Per-request timeout. `validate()` guarantees this parses.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        parse_duration(&self.request_timeout).unwrap_or(Duration::from_secs(30))
    }
}

/// Accepts `true`/`1`/`yes` (case-insensitive) as true; anything else is false.
fn parse_flag(raw: &str) -> Result<bool, String> {
    Ok(matches!(
        raw.trim().to_lowercase().as_str(),
        "true" | "1" | "yes"
    ))
}

/// Parses a humantime duration (`10s`, `1m30s`) or a bare number of seconds.
fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    humantime::parse_duration(raw).ok()
}

/// Parses `raw`, falling back to `default` when it is unparsable, zero, or above `max`.
fn bounded_duration(name: &str, raw: &str, default: Duration, max: Duration) -> Duration {
    match parse_duration(raw) {
        Some(d) if !d.is_zero() && d <= max => d,
        _ => {
            tracing::warn!(
                option = name,
                value = raw,
                default_secs = default.as_secs(),
                "Out-of-range duration, using default"
            );
            default
        }
    }
}
