//! Ingress composition: the shared trace -> log -> metrics stack plus the
//! per-route authentication layer.

use std::sync::Arc;

use tower::layer::util::{Identity, Stack};
use tower::ServiceBuilder;

use super::auth::{AuthLayer, AuthPolicy};
use super::exempt::ExemptPaths;
use super::logging::AccessLogLayer;
use super::metrics::RequestMetricsLayer;
use super::trace::TraceContextLayer;
use crate::service::auth::AuthResolver;
use crate::telemetry::http_metrics::HttpMetrics;

/// Layer stack applied to every route, outermost first.
pub type IngressLayers =
    Stack<RequestMetricsLayer, Stack<AccessLogLayer, Stack<TraceContextLayer, Identity>>>;

/// The four ingress stages, built once at startup.
#[derive(Clone)]
pub struct IngressPipeline {
    trace: TraceContextLayer,
    log: AccessLogLayer,
    metrics: RequestMetricsLayer,
    auth: AuthLayer,
}

impl std::fmt::Debug for IngressPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngressPipeline")
            .field("auth", &self.auth)
            .finish_non_exhaustive()
    }
}

impl IngressPipeline {
    #[must_use]
    pub fn new(
        exempt: ExemptPaths,
        metrics: Arc<HttpMetrics>,
        resolver: Arc<dyn AuthResolver>,
        policy: AuthPolicy,
    ) -> Self {
        Self {
            trace: TraceContextLayer::new(exempt.clone()),
            log: AccessLogLayer::new(),
            metrics: RequestMetricsLayer::new(metrics, exempt),
            auth: AuthLayer::new(resolver, policy),
        }
    }

    /// Trace context first so the access log and metrics see its trace id.
    ///
    /// Attach with `Router::layer` so `MatchedPath` is already set when the
    /// metrics stage runs.
    #[must_use]
    pub fn layers(&self) -> IngressLayers {
        ServiceBuilder::new()
            .layer(self.trace.clone())
            .layer(self.log.clone())
            .layer(self.metrics.clone())
            .into_inner()
    }

    /// Authentication for protected routes; attach with `Router::route_layer`.
    #[must_use]
    pub fn auth_layer(&self) -> AuthLayer {
        self.auth.clone()
    }
}
