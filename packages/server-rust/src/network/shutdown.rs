//! Readiness gate and ordered, deadline-bounded shutdown.
//!
//! Shutdown state machine: Serving -> Draining -> (teardown steps) -> done.
//! The gate flips exactly once. Teardown steps run strictly in registration
//! order and share a single absolute deadline, so total teardown time never
//! exceeds the configured timeout regardless of how many steps overrun.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::service::ServiceError;

use super::NetworkConfig;

// ---------------------------------------------------------------------------
// ReadinessGate
// ---------------------------------------------------------------------------

/// Readiness as reported to orchestrator probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessState {
    /// Accepting traffic.
    Serving,
    /// Shutdown has begun; load balancers should stop routing here.
    Draining,
}

impl ReadinessState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Serving => "ok",
            Self::Draining => "shutting_down",
        }
    }
}

/// One-way readiness flag shared between the probe handler and the shutdown
/// controller. Safe to read from any thread at any time.
#[derive(Debug, Default)]
pub struct ReadinessGate {
    draining: AtomicBool,
}

impl ReadinessGate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn state(&self) -> ReadinessState {
        if self.is_draining() {
            ReadinessState::Draining
        } else {
            ReadinessState::Serving
        }
    }

    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Flips the gate to draining. Returns `true` only for the call that
    /// performed the transition; later calls are no-ops.
    pub fn begin_drain(&self) -> bool {
        !self.draining.swap(true, Ordering::AcqRel)
    }
}

// ---------------------------------------------------------------------------
// ShutdownSequence
// ---------------------------------------------------------------------------

type TeardownFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// Result of one teardown step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Completed,
    Failed(String),
    /// The shared deadline expired before the step finished.
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct StepReport {
    pub name: &'static str,
    pub outcome: StepOutcome,
    pub elapsed: Duration,
}

/// What happened during a shutdown run, one entry per step in execution order.
#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
    pub steps: Vec<StepReport>,
}

impl ShutdownReport {
    /// Steps that did not complete cleanly.
    #[must_use]
    pub fn failures(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.outcome != StepOutcome::Completed)
            .count()
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures() == 0
    }

    #[must_use]
    pub fn outcome_of(&self, name: &str) -> Option<&StepOutcome> {
        self.steps.iter().find(|s| s.name == name).map(|s| &s.outcome)
    }
}

impl fmt::Display for ShutdownReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, step) in self.steps.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            match &step.outcome {
                StepOutcome::Completed => write!(f, "{}=ok", step.name)?,
                StepOutcome::Failed(e) => write!(f, "{}=error({e})", step.name)?,
                StepOutcome::TimedOut => write!(f, "{}=timeout", step.name)?,
            }
        }
        Ok(())
    }
}

/// Ordered list of named teardown actions.
///
/// Each action is a future built at startup that owns the resource it tears
/// down, so every resource is released at most once.
#[derive(Default)]
pub struct ShutdownSequence {
    steps: Vec<(&'static str, TeardownFuture)>,
}

impl ShutdownSequence {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a step. Steps run in the order they are added.
    #[must_use]
    pub fn then<F>(mut self, name: &'static str, action: F) -> Self
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.steps.push((name, Box::pin(action)));
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|(name, _)| *name).collect()
    }

    /// Runs every step in order against the shared `deadline`.
    ///
    /// A failing or overrunning step is logged and the sequence moves on.
    /// A step already past the deadline is still polled once, so actions
    /// that complete immediately are not skipped.
    pub async fn run(self, deadline: Instant) -> ShutdownReport {
        let mut report = ShutdownReport::default();

        for (name, action) in self.steps {
            let started = Instant::now();
            let outcome = match tokio::time::timeout_at(deadline, action).await {
                Ok(Ok(())) => {
                    info!(step = name, "Shutdown step complete");
                    StepOutcome::Completed
                }
                Ok(Err(e)) => {
                    error!(step = name, error = %e, "Shutdown step failed");
                    StepOutcome::Failed(e.to_string())
                }
                Err(_) => {
                    let err = ServiceError::TeardownTimeout { step: name };
                    warn!(step = name, error = %err, "Shutdown step abandoned");
                    StepOutcome::TimedOut
                }
            };
            report.steps.push(StepReport {
                name,
                outcome,
                elapsed: started.elapsed(),
            });
        }

        report
    }
}

// ---------------------------------------------------------------------------
// ShutdownController
// ---------------------------------------------------------------------------

/// Drives shutdown: wait for a signal, fail readiness, hold for the drain
/// delay, then run the teardown sequence under one deadline.
#[derive(Debug, Clone)]
pub struct ShutdownController {
    readiness: Arc<ReadinessGate>,
    drain_delay: Duration,
    shutdown_timeout: Duration,
}

impl ShutdownController {
    #[must_use]
    pub fn new(readiness: Arc<ReadinessGate>, drain_delay: Duration, shutdown_timeout: Duration) -> Self {
        Self {
            readiness,
            drain_delay,
            shutdown_timeout,
        }
    }

    #[must_use]
    pub fn from_config(readiness: Arc<ReadinessGate>, config: &NetworkConfig) -> Self {
        Self::new(readiness, config.drain_delay, config.shutdown_timeout)
    }

    #[must_use]
    pub fn readiness(&self) -> &Arc<ReadinessGate> {
        &self.readiness
    }

    /// Waits for `signal`, then shuts down. Returns once every step has
    /// completed, failed, or been abandoned at the deadline.
    pub async fn run<S>(&self, signal: S, sequence: ShutdownSequence) -> ShutdownReport
    where
        S: Future<Output = ()>,
    {
        signal.await;
        info!("Shutdown signal received");
        self.shutdown(sequence).await
    }

    /// Shuts down immediately, without waiting for a signal.
    pub async fn shutdown(&self, sequence: ShutdownSequence) -> ShutdownReport {
        if self.readiness.begin_drain() {
            info!("Readiness probe now failing");
        }

        if !self.drain_delay.is_zero() {
            info!(
                delay_ms = u64::try_from(self.drain_delay.as_millis()).unwrap_or(u64::MAX),
                "Waiting for load balancers to deregister"
            );
            tokio::time::sleep(self.drain_delay).await;
        }

        let deadline = Instant::now() + self.shutdown_timeout;
        info!(
            steps = sequence.len(),
            timeout_ms = u64::try_from(self.shutdown_timeout.as_millis()).unwrap_or(u64::MAX),
            "Starting graceful shutdown"
        );

        let report = sequence.run(deadline).await;
        if report.is_clean() {
            info!("Graceful shutdown complete");
        } else {
            warn!(failures = report.failures(), summary = %report, "Shutdown finished with errors");
        }
        report
    }
}

/// Resolves on SIGINT or, on Unix, SIGTERM.
pub async fn termination_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C"),
        () = terminate => info!("Received SIGTERM"),
    }
}
