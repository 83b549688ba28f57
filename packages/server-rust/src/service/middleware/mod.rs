//! Tower middleware for the request-ingress chain.
//!
//! - [`trace`]: trace id, request span, `X-Trace-ID` header, span export
//! - [`logging`]: one access-log entry per request
//! - [`metrics`]: request counters, histograms and the in-flight gauge
//! - [`auth`]: bearer credential resolution for protected routes
//! - [`pipeline`]: composes the stages in order

pub mod auth;
pub mod exempt;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod trace;

pub use auth::{AuthLayer, AuthPolicy};
pub use exempt::ExemptPaths;
pub use logging::AccessLogLayer;
pub use metrics::RequestMetricsLayer;
pub use pipeline::IngressPipeline;
pub use trace::TraceContextLayer;
