//! Profile service: user-profile HTTP API wrapped in an ordered ingress pipeline
//! (trace, log, metrics, auth) with a readiness gate and a deadline-bounded
//! graceful shutdown sequence.

pub mod network;
pub mod service;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod test_support;

pub use network::{
    NetworkConfig, NetworkModule, ReadinessGate, ShutdownController, ShutdownSequence,
};
pub use service::{ServiceConfig, ServiceError};
