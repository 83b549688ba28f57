//! Third ingress stage: request counters, histograms and the in-flight gauge.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::HttpBody;
use axum::extract::{MatchedPath, Request};
use axum::http::header::CONTENT_LENGTH;
use axum::http::HeaderMap;
use axum::response::Response;
use tower::{Layer, Service};

use super::exempt::ExemptPaths;
use crate::telemetry::http_metrics::{HttpMetrics, RequestObservation};

/// Body size from `Content-Length`, else the body's exact size hint, else 0.
fn body_bytes(headers: &HeaderMap, exact: Option<u64>) -> u64 {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .or(exact)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// RequestMetricsLayer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RequestMetricsLayer {
    metrics: Arc<HttpMetrics>,
    exempt: ExemptPaths,
}

impl RequestMetricsLayer {
    #[must_use]
    pub fn new(metrics: Arc<HttpMetrics>, exempt: ExemptPaths) -> Self {
        Self { metrics, exempt }
    }
}

impl<S> Layer<S> for RequestMetricsLayer {
    type Service = RequestMetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestMetricsService {
            inner,
            metrics: Arc::clone(&self.metrics),
            exempt: self.exempt.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// RequestMetricsService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RequestMetricsService<S> {
    inner: S,
    metrics: Arc<HttpMetrics>,
    exempt: ExemptPaths,
}

impl<S> Service<Request> for RequestMetricsService<S>
where
    S: Service<Request, Response = Response> + Send,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Response, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        if self.exempt.is_exempt(req.uri().path()) {
            return Box::pin(self.inner.call(req));
        }

        let method = req.method().to_string();
        let route = req
            .extensions()
            .get::<MatchedPath>()
            .map_or_else(|| req.uri().path().to_owned(), |m| m.as_str().to_owned());
        let request_bytes = body_bytes(req.headers(), req.body().size_hint().exact());

        let guard = self.metrics.track_in_flight(&method, &route);
        let metrics = Arc::clone(&self.metrics);
        let start = Instant::now();
        let fut = self.inner.call(req);

        Box::pin(async move {
            let result = fut.await;
            if let Ok(response) = &result {
                metrics.observe(&RequestObservation {
                    method: &method,
                    path: &route,
                    status: response.status().as_u16(),
                    request_bytes,
                    response_bytes: body_bytes(
                        response.headers(),
                        response.body().size_hint().exact(),
                    ),
                    duration: start.elapsed(),
                });
            }
            drop(guard);
            result
        })
    }
}
