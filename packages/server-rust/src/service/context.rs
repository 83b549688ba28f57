//! Per-request context carried through the ingress pipeline in request
//! extensions: the trace identifier, the request span, and (once the auth
//! stage has run) the resolved principal.

use std::fmt;

use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use tracing::Span;

/// Response and request header carrying the trace identifier.
pub const TRACE_ID_HEADER: &str = "x-trace-id";
/// W3C trace-context header.
pub const TRACEPARENT_HEADER: &str = "traceparent";

const MAX_TRACE_ID_LEN: usize = 128;

/// Identifier that ties together every log line, span and response for one request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TraceId(String);

impl TraceId {
    /// Fresh identifier: 16 random bytes, hex-encoded, never all zeros.
    #[must_use]
    pub fn generate() -> Self {
        loop {
            let bytes: [u8; 16] = rand::random();
            if bytes != [0u8; 16] {
                return Self(hex::encode(bytes));
            }
        }
    }

    /// Extracts an inbound identifier.
    ///
    /// The trace-id field of `traceparent` wins; otherwise `X-Trace-ID` is
    /// used. Values that could not be echoed back safely are ignored.
    #[must_use]
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let from_traceparent = headers
            .get(TRACEPARENT_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split('-').filter(|part| !part.is_empty()).nth(1))
            .and_then(Self::parse);

        from_traceparent.or_else(|| {
            headers
                .get(TRACE_ID_HEADER)
                .and_then(|v| v.to_str().ok())
                .and_then(Self::parse)
        })
    }

    fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let acceptable = !raw.is_empty()
            && raw.len() <= MAX_TRACE_ID_LEN
            && raw.bytes().all(|b| b.is_ascii_graphic());
        acceptable.then(|| Self(raw.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

}

impl From<opentelemetry::trace::TraceId> for TraceId {
    fn from(id: opentelemetry::trace::TraceId) -> Self {
        Self(format!("{id:032x}"))
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Principal
// ---------------------------------------------------------------------------

/// Identifier given to the demo principal substituted in fallback mode.
pub const FALLBACK_PRINCIPAL_ID: &str = "1";

/// Caller identity as returned by the identity service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: String,
}

impl Principal {
    /// Fixed demo identity used when unauthenticated fallback is enabled.
    #[must_use]
    pub fn fallback() -> Self {
        Self {
            id: FALLBACK_PRINCIPAL_ID.to_string(),
            username: String::new(),
            email: String::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// RequestContext
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RequestContext {
    trace_id: TraceId,
    span: Span,
    principal: Option<Principal>,
}

impl RequestContext {
    #[must_use]
    pub fn new(trace_id: TraceId, span: Span) -> Self {
        Self {
            trace_id,
            span,
            principal: None,
        }
    }

    #[must_use]
    pub fn trace_id(&self) -> &TraceId {
        &self.trace_id
    }

    /// Span every log entry for this request is recorded under.
    #[must_use]
    pub fn span(&self) -> &Span {
        &self.span
    }

    #[must_use]
    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    /// Attaches the principal. Only the first call takes effect; returns
    /// whether this call attached it.
    pub fn attach_principal(&mut self, principal: Principal) -> bool {
        if self.principal.is_some() {
            return false;
        }
        self.principal = Some(principal);
        true
    }
}
