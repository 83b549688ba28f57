//! Transport-level middleware.
//!
//! These layers sit inside the ingress pipeline (trace, log, metrics) so a
//! timeout, an oversized body, or a handler panic still shows up in the
//! access log and the request counters with the status it produced.

use axum::http::StatusCode;
use tower::layer::util::{Identity, Stack};
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

use super::config::NetworkConfig;

pub type TransportLayers = Stack<
    CatchPanicLayer<tower_http::catch_panic::DefaultResponseForPanic>,
    Stack<TimeoutLayer, Stack<RequestBodyLimitLayer, Identity>>,
>;

/// Builds the transport stack, outermost first:
/// 1. `RequestBodyLimit` -- 413 above `max_body_bytes`
/// 2. `Timeout` -- 408 once `request_timeout` elapses
/// 3. `CatchPanic` -- converts a handler panic into a 500
///
/// The timeout must wrap a service whose response body has a `Default`,
/// which the body-limit response does not; hence the limit sits outside.
#[must_use]
pub fn build_http_layers(config: &NetworkConfig) -> TransportLayers {
    ServiceBuilder::new()
        .layer(RequestBodyLimitLayer::new(config.max_body_bytes))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            config.request_timeout,
        ))
        .layer(CatchPanicLayer::new())
        .into_inner()
}
