//! HTTP handler definitions for the profile service.
//!
//! Defines `AppState` (the shared state carried through axum extractors)
//! and re-exports the handler functions used when building the router.

pub mod health;
pub mod metrics;
pub mod profile;

pub use health::{health_handler, liveness_handler, readiness_handler};
pub use metrics::metrics_handler;
pub use profile::{create_user, get_profile, get_user, update_profile};

use std::sync::Arc;

use crate::network::ReadinessGate;
use crate::service::store::ProfileStore;
use crate::telemetry::HttpMetrics;

/// Shared application state passed to all axum handlers via `State` extraction.
#[derive(Clone)]
pub struct AppState {
    /// Flipped to draining when shutdown begins; read by the readiness probe.
    pub readiness: Arc<ReadinessGate>,
    /// Owned recorder rendered by the scrape endpoint.
    pub metrics: Arc<HttpMetrics>,
    pub store: Arc<dyn ProfileStore>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("readiness", &self.readiness.state())
            .finish_non_exhaustive()
    }
}
