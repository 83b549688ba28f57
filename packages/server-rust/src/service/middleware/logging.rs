//! Second ingress stage: one structured access-log entry per request, health
//! check paths included, plus an ERROR entry for every status of 400 and above.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Request};
use axum::http::header::USER_AGENT;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use tower::{Layer, Service};
use tracing::{error, info};

use crate::service::context::RequestContext;

const FORWARDED_FOR: &str = "x-forwarded-for";
const REAL_IP: &str = "x-real-ip";

/// Client address: first `X-Forwarded-For` hop, then `X-Real-IP`, then the peer.
#[must_use]
pub fn client_address(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get(FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    let real_ip = || {
        headers
            .get(REAL_IP)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    forwarded
        .or_else(real_ip)
        .map(str::to_owned)
        .or_else(|| peer.map(|p| p.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Request-side fields captured before the handler runs.
#[derive(Debug, Clone)]
struct AccessLog {
    method: String,
    path: String,
    client: String,
    user_agent: String,
    trace_id: String,
}

impl AccessLog {
    fn begin(req: &Request) -> Self {
        let peer = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        Self {
            method: req.method().to_string(),
            path: req.uri().path().to_owned(),
            client: client_address(req.headers(), peer),
            user_agent: req
                .headers()
                .get(USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_owned(),
            trace_id: req
                .extensions()
                .get::<RequestContext>()
                .map(|ctx| ctx.trace_id().to_string())
                .unwrap_or_default(),
        }
    }

    fn finish(&self, status: StatusCode, duration: Duration) {
        let status = status.as_u16();
        let duration_ms = duration.as_secs_f64() * 1000.0;

        info!(
            method = %self.method,
            path = %self.path,
            status,
            duration_ms,
            client_ip = %self.client,
            user_agent = %self.user_agent,
            trace_id = %self.trace_id,
            "HTTP request"
        );
        if status >= 400 {
            error!(
                method = %self.method,
                path = %self.path,
                status,
                trace_id = %self.trace_id,
                "HTTP request failed"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// AccessLogLayer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct AccessLogLayer;

impl AccessLogLayer {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for AccessLogLayer {
    type Service = AccessLogService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AccessLogService { inner }
    }
}

#[derive(Debug, Clone)]
pub struct AccessLogService<S> {
    inner: S,
}

impl<S> Service<Request> for AccessLogService<S>
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
        let entry = AccessLog::begin(&req);
        let start = Instant::now();
        let fut = self.inner.call(req);

        Box::pin(async move {
            let response = fut.await?;
            entry.finish(response.status(), start.elapsed());
            Ok(response)
        })
    }
}
