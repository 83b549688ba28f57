//! Bearer-token authentication against the external identity service.

use std::time::Duration;

use async_trait::async_trait;
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use reqwest::StatusCode;
use tracing::debug;

use super::context::Principal;

/// Per-call budget for the identity-service round trip.
pub const IDENTITY_CALL_TIMEOUT: Duration = Duration::from_secs(5);

const BEARER_PREFIX: &str = "Bearer ";
const IDENTITY_PATH: &str = "/api/v1/auth/me";

/// Why a request could not be authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthFailure {
    #[error("no credential supplied")]
    Missing,
    #[error("authorization header is not a bearer credential")]
    Malformed,
    #[error("credential rejected by identity service")]
    Rejected,
    #[error("identity service unavailable")]
    Unavailable,
}

impl AuthFailure {
    /// Message safe to return to the caller.
    #[must_use]
    pub fn public_message(self) -> &'static str {
        match self {
            Self::Missing => "Authentication required",
            Self::Malformed => "Invalid authorization header",
            Self::Rejected | Self::Unavailable => "Invalid or expired token",
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::Malformed => "malformed",
            Self::Rejected => "rejected",
            Self::Unavailable => "unavailable",
        }
    }
}

/// Pulls the credential out of `Authorization: Bearer <token>`.
///
/// # Errors
///
/// `Missing` when the header is absent or empty, `Malformed` for any other
/// shape (wrong scheme, empty token, non-ASCII value).
pub fn extract_bearer(headers: &HeaderMap) -> Result<&str, AuthFailure> {
    let Some(value) = headers.get(AUTHORIZATION) else {
        return Err(AuthFailure::Missing);
    };
    let value = value.to_str().map_err(|_| AuthFailure::Malformed)?;
    if value.is_empty() {
        return Err(AuthFailure::Missing);
    }
    match value.strip_prefix(BEARER_PREFIX) {
        Some(token) if !token.trim().is_empty() => Ok(token),
        _ => Err(AuthFailure::Malformed),
    }
}

/// Turns a bearer credential into a verified principal.
#[async_trait]
pub trait AuthResolver: Send + Sync {
    /// # Errors
    ///
    /// `Rejected` when the identity service refuses the credential,
    /// `Unavailable` for every other failure.
    async fn resolve(&self, credential: &str) -> Result<Principal, AuthFailure>;
}

/// Resolver backed by `GET <base>/api/v1/auth/me`. No retries, no caching.
#[derive(Debug, Clone)]
pub struct HttpAuthResolver {
    me_url: String,
    client: reqwest::Client,
}

impl HttpAuthResolver {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(base_url: &str) -> Result<Self, reqwest::Error> {
        Self::with_timeout(base_url, IDENTITY_CALL_TIMEOUT)
    }

    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            me_url: format!("{}{IDENTITY_PATH}", base_url.trim_end_matches('/')),
            client,
        })
    }
}

#[async_trait]
impl AuthResolver for HttpAuthResolver {
    async fn resolve(&self, credential: &str) -> Result<Principal, AuthFailure> {
        let response = self
            .client
            .get(&self.me_url)
            .bearer_auth(credential)
            .send()
            .await
            .map_err(|e| {
                debug!(error = %e, "Identity service request failed");
                AuthFailure::Unavailable
            })?;

        match response.status() {
            StatusCode::OK => {
                let principal = response.json::<Principal>().await.map_err(|e| {
                    debug!(error = %e, "Identity service returned an unreadable body");
                    AuthFailure::Unavailable
                })?;
                if principal.id.is_empty() {
                    debug!("Identity service returned a principal without an id");
                    return Err(AuthFailure::Unavailable);
                }
                Ok(principal)
            }
            StatusCode::UNAUTHORIZED => Err(AuthFailure::Rejected),
            status => {
                debug!(%status, "Identity service returned an unexpected status");
                Err(AuthFailure::Unavailable)
            }
        }
    }
}
