//! First ingress stage: establishes the request context.
//!
//! Every request gets a trace id, a request span carrying it, and an
//! `X-Trace-ID` response header. An inbound `traceparent` becomes the span's
//! remote parent; otherwise the id is the one the tracer assigned to the span.
//! Exempt paths run under [`UNTRACED_TARGET`] so the exporter never sees them.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::extract::Request;
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use axum::response::Response;
use opentelemetry::propagation::{Extractor, TextMapPropagator};
use opentelemetry::trace::TraceContextExt;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use tower::{Layer, Service};
use tracing::field::{display, Empty};
use tracing::{info_span, Instrument, Span};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use super::exempt::ExemptPaths;
use crate::service::context::{RequestContext, TraceId, TRACE_ID_HEADER};
use crate::telemetry::exporter::UNTRACED_TARGET;

struct HeaderCarrier<'a>(&'a HeaderMap);

impl Extractor for HeaderCarrier<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(HeaderName::as_str).collect()
    }
}

/// Trace id the tracer assigned to `span`, if a tracer is installed.
fn assigned_trace_id(span: &Span) -> Option<TraceId> {
    let id = span.context().span().span_context().trace_id();
    (id != opentelemetry::trace::TraceId::INVALID).then(|| TraceId::from(id))
}

// ---------------------------------------------------------------------------
// TraceContextLayer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TraceContextLayer {
    exempt: ExemptPaths,
}

impl TraceContextLayer {
    #[must_use]
    pub fn new(exempt: ExemptPaths) -> Self {
        Self { exempt }
    }
}

impl<S> Layer<S> for TraceContextLayer {
    type Service = TraceContextService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TraceContextService {
            inner,
            exempt: self.exempt.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// TraceContextService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TraceContextService<S> {
    inner: S,
    exempt: ExemptPaths,
}

impl<S> TraceContextService<S> {
    fn open_span(&self, req: &Request) -> Span {
        let method = req.method().as_str();
        let path = req.uri().path();

        if self.exempt.is_exempt(path) {
            return info_span!(
                target: UNTRACED_TARGET,
                "request",
                trace_id = Empty,
                method = %method,
                path = %path,
            );
        }

        let span = info_span!(
            "request",
            otel.kind = "server",
            otel.status_code = Empty,
            trace_id = Empty,
            method = %method,
            path = %path,
            status = Empty,
        );
        let parent = TraceContextPropagator::new().extract(&HeaderCarrier(req.headers()));
        if parent.has_active_span() {
            let _ = span.set_parent(parent);
        }
        span
    }
}

impl<S> Service<Request> for TraceContextService<S>
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

    fn call(&mut self, mut req: Request) -> Self::Future {
        let span = self.open_span(&req);
        let trace_id = TraceId::from_headers(req.headers())
            .or_else(|| assigned_trace_id(&span))
            .unwrap_or_else(TraceId::generate);
        span.record("trace_id", display(&trace_id));

        req.extensions_mut()
            .insert(RequestContext::new(trace_id.clone(), span.clone()));

        let fut = span.in_scope(|| self.inner.call(req));

        Box::pin(async move {
            let mut response = fut.instrument(span.clone()).await?;

            let status = response.status();
            span.record("status", status.as_u16());
            if status.is_server_error() {
                span.record("otel.status_code", "ERROR");
            }
            if let Ok(value) = HeaderValue::from_str(trace_id.as_str()) {
                response.headers_mut().insert(TRACE_ID_HEADER, value);
            }

            Ok(response)
        })
    }
}
