//! Background worker for periodic and on-demand tasks.
//!
//! Provides a generic `BackgroundWorker<R>` that processes tasks from a bounded
//! mpsc channel via a `BackgroundRunnable` implementation, with periodic tick
//! callbacks. The process sampler runs on it.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::oneshot;

// ---------------------------------------------------------------------------
// BackgroundRunnable trait
// ---------------------------------------------------------------------------

/// Trait for task handlers executed by `BackgroundWorker`.
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    /// The type of task this runnable processes.
    type Task: Send + 'static;

    /// Process a single task.
    async fn run(&mut self, task: Self::Task);

    /// Called on each tick interval. Default is a no-op.
    async fn on_tick(&mut self) {}

    /// Called once when the worker is shutting down, after queued tasks have
    /// been drained. Default is a no-op.
    async fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// BackgroundWorker
// ---------------------------------------------------------------------------

/// Generic background worker that processes tasks via an mpsc channel.
///
/// The worker spawns a tokio task that:
/// 1. Listens for tasks on the mpsc channel
/// 2. Calls `BackgroundRunnable::run()` for each task
/// 3. Calls `BackgroundRunnable::on_tick()` at the configured interval
/// 4. On stop, drains whatever is still queued, then calls `shutdown()`
pub struct BackgroundWorker<R: BackgroundRunnable> {
    tx: Option<mpsc::Sender<R::Task>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Starts the worker with the given tick interval and queue capacity.
    #[must_use]
    pub fn start(mut runnable: R, tick_interval: Duration, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<R::Task>(capacity.max(1));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick_interval);
            // Skip the first immediate tick so on_tick doesn't fire at startup.
            ticker.tick().await;

            loop {
                tokio::select! {
                    task = rx.recv() => {
                        match task {
                            Some(t) => runnable.run(t).await,
                            None => break,
                        }
                    }
                    _ = ticker.tick() => {
                        runnable.on_tick().await;
                    }
                    _ = &mut shutdown_rx => {
                        break;
                    }
                }
            }

            rx.close();
            while let Ok(task) = rx.try_recv() {
                runnable.run(task).await;
            }
            runnable.shutdown().await;
        });

        Self {
            tx: Some(tx),
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Submit a task to the worker, waiting for queue space.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker has been stopped.
    pub async fn submit(&self, task: R::Task) -> anyhow::Result<()> {
        match &self.tx {
            Some(tx) => tx
                .send(task)
                .await
                .map_err(|_| anyhow::anyhow!("worker channel closed")),
            None => Err(anyhow::anyhow!("worker not running")),
        }
    }

    /// Stops the worker and waits for it to finish. Idempotent.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    #[derive(Default, Clone)]
    struct Counters {
        runs: Arc<AtomicU32>,
        ticks: Arc<AtomicU32>,
        shutdowns: Arc<AtomicU32>,
    }

    struct CountingRunnable(Counters);

    #[async_trait]
    impl BackgroundRunnable for CountingRunnable {
        type Task = String;

        async fn run(&mut self, _task: String) {
            self.0.runs.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_tick(&mut self) {
            self.0.ticks.fetch_add(1, Ordering::SeqCst);
        }

        async fn shutdown(&mut self) {
            self.0.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn queued_tasks_are_drained_before_shutdown() {
        let counters = Counters::default();
        let mut worker = BackgroundWorker::start(
            CountingRunnable(counters.clone()),
            Duration::from_secs(60),
            16,
        );

        for i in 0..3 {
            worker.submit(format!("task-{i}")).await.unwrap();
        }
        worker.stop().await;

        assert_eq!(counters.runs.load(Ordering::SeqCst), 3);
        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 1);
        assert!(!worker.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn tick_fires_periodically() {
        let counters = Counters::default();
        let mut worker = BackgroundWorker::start(
            CountingRunnable(counters.clone()),
            Duration::from_millis(20),
            16,
        );

        tokio::time::sleep(Duration::from_millis(105)).await;
        worker.stop().await;

        assert!(counters.ticks.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn submit_after_stop_returns_error() {
        let mut worker = BackgroundWorker::start(
            CountingRunnable(Counters::default()),
            Duration::from_secs(60),
            16,
        );
        worker.stop().await;
        worker.stop().await;

        assert!(worker.submit("late".to_string()).await.is_err());
    }
}
