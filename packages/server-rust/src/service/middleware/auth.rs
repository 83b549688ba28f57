//! Fourth ingress stage, applied to protected routes only: resolve the bearer
//! credential to a principal, or reject with 401 unless fallback is enabled.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::extract::Request;
use axum::response::{IntoResponse, Response};
use tower::{Layer, Service};
use tracing::debug;

use crate::service::auth::{extract_bearer, AuthResolver};
use crate::service::context::{Principal, RequestContext};
use crate::service::error::ApiError;

/// What to do when authentication fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPolicy {
    /// Respond 401; the handler never runs.
    Reject,
    /// Attach the fixed demo principal and continue.
    Fallback,
}

impl AuthPolicy {
    #[must_use]
    pub fn from_fallback_flag(allow_fallback: bool) -> Self {
        if allow_fallback {
            Self::Fallback
        } else {
            Self::Reject
        }
    }
}

// ---------------------------------------------------------------------------
// AuthLayer
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AuthLayer {
    resolver: Arc<dyn AuthResolver>,
    policy: AuthPolicy,
}

impl std::fmt::Debug for AuthLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthLayer")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl AuthLayer {
    #[must_use]
    pub fn new(resolver: Arc<dyn AuthResolver>, policy: AuthPolicy) -> Self {
        Self { resolver, policy }
    }

    #[must_use]
    pub fn policy(&self) -> AuthPolicy {
        self.policy
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthService {
            inner,
            resolver: Arc::clone(&self.resolver),
            policy: self.policy,
        }
    }
}

// ---------------------------------------------------------------------------
// AuthService
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AuthService<S> {
    inner: S,
    resolver: Arc<dyn AuthResolver>,
    policy: AuthPolicy,
}

impl<S> Service<Request> for AuthService<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Response, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request) -> Self::Future {
        // The inner service is driven after an await, so take the ready one
        // and leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let resolver = Arc::clone(&self.resolver);
        let policy = self.policy;
        let credential = extract_bearer(req.headers()).map(str::to_owned);

        Box::pin(async move {
            let outcome = match credential {
                Ok(token) => resolver.resolve(&token).await,
                Err(failure) => Err(failure),
            };

            let principal = match outcome {
                Ok(principal) => principal,
                Err(failure) => match policy {
                    AuthPolicy::Reject => {
                        debug!(reason = failure.as_str(), "Authentication failed");
                        return Ok(ApiError::Unauthorized(failure).into_response());
                    }
                    AuthPolicy::Fallback => {
                        debug!(reason = failure.as_str(), "Authentication failed, using fallback principal");
                        Principal::fallback()
                    }
                },
            };

            if let Some(ctx) = req.extensions_mut().get_mut::<RequestContext>() {
                ctx.attach_principal(principal.clone());
            }
            req.extensions_mut().insert(principal);

            inner.call(req).await
        })
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{self, StatusCode};
    use axum::routing::get;
    use axum::{Extension, Router};
    use tower::ServiceExt;

    use super::*;
    use crate::service::auth::AuthFailure;
    use crate::service::context::FALLBACK_PRINCIPAL_ID;
    use crate::test_support::StubResolver;

    async fn whoami(Extension(principal): Extension<Principal>) -> String {
        principal.id
    }

    fn app(resolver: Arc<StubResolver>, policy: AuthPolicy) -> Router {
        Router::new()
            .route("/api/v1/users/profile", get(whoami))
            .route_layer(AuthLayer::new(resolver, policy))
    }

    fn request(auth: Option<&str>) -> http::Request<Body> {
        let mut builder = http::Request::get("/api/v1/users/profile");
        if let Some(value) = auth {
            builder = builder.header("authorization", value);
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn read(resp: Response) -> (StatusCode, String) {
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn valid_credential_attaches_principal() {
        let resolver = Arc::new(StubResolver::accepting("42"));
        let resp = app(resolver.clone(), AuthPolicy::Reject)
            .oneshot(request(Some("Bearer good")))
            .await
            .unwrap();
        assert_eq!(read(resp).await, (StatusCode::OK, "42".to_string()));
        assert_eq!(resolver.calls(), 1);
    }

    #[tokio::test]
    async fn missing_header_rejected_without_resolver_call() {
        let resolver = Arc::new(StubResolver::accepting("42"));
        let resp = app(resolver.clone(), AuthPolicy::Reject)
            .oneshot(request(None))
            .await
            .unwrap();
        let (status, body) = read(resp).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body, r#"{"error":"Authentication required"}"#);
        assert_eq!(resolver.calls(), 0);
    }

    #[tokio::test]
    async fn malformed_header_rejected() {
        let resolver = Arc::new(StubResolver::accepting("42"));
        let resp = app(resolver.clone(), AuthPolicy::Reject)
            .oneshot(request(Some("Basic abc")))
            .await
            .unwrap();
        let (status, body) = read(resp).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body, r#"{"error":"Invalid authorization header"}"#);
        assert_eq!(resolver.calls(), 0);
    }

    #[tokio::test]
    async fn resolver_failure_rejected() {
        for failure in [AuthFailure::Rejected, AuthFailure::Unavailable] {
            let resolver = Arc::new(StubResolver::failing(failure));
            let resp = app(resolver, AuthPolicy::Reject)
                .oneshot(request(Some("Bearer whatever")))
                .await
                .unwrap();
            let (status, body) = read(resp).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
            assert_eq!(body, r#"{"error":"Invalid or expired token"}"#);
        }
    }

    #[tokio::test]
    async fn fallback_policy_substitutes_demo_principal() {
        let resolver = Arc::new(StubResolver::failing(AuthFailure::Unavailable));
        for auth in [None, Some("Basic abc"), Some("Bearer expired")] {
            let resp = app(resolver.clone(), AuthPolicy::Fallback)
                .oneshot(request(auth))
                .await
                .unwrap();
            assert_eq!(
                read(resp).await,
                (StatusCode::OK, FALLBACK_PRINCIPAL_ID.to_string())
            );
        }
    }

    #[test]
    fn policy_from_flag() {
        assert_eq!(AuthPolicy::from_fallback_flag(true), AuthPolicy::Fallback);
        assert_eq!(AuthPolicy::from_fallback_flag(false), AuthPolicy::Reject);
    }
}
