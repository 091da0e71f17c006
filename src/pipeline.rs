//! Bounded-concurrency polling loop.
//!
//! The pipeline repeatedly asks a [`PipelineWorker`] for work and runs each
//! item as its own tokio task. The number of in-flight tasks never exceeds
//! `high_watermark`; new work is only requested once it drops to
//! `low_watermark` or below, and an empty load backs off for
//! `polling_interval` before asking again.
//!
//! ```text
//!            load_tasks(high - in_flight)
//!   store ◀──────────────────────────────── loop ──spawn──▶ process_task
//!                                            ▲                   │
//!                                            └──── slot freed ◀──┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error};

/// Supplies and handles work items for [`start_task_pipeline`].
///
/// `process_task` is expected to handle its own errors; the pipeline only
/// reports panics.
#[async_trait]
pub trait PipelineWorker: Send + Sync + 'static {
    type Task: Send + 'static;

    /// Load up to `count` items. An empty result makes the pipeline wait one
    /// polling interval.
    async fn load_tasks(&self, count: usize) -> Vec<Self::Task>;

    async fn process_task(&self, task: Self::Task);
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub low_watermark: usize,
    pub high_watermark: usize,
    pub polling_interval: Duration,
}

/// Handle to a running pipeline.
///
/// Dropping the handle stops the pipeline the same way [`stop`](Self::stop)
/// does.
pub struct PipelineHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PipelineHandle {
    /// Stop polling for new work. In-flight tasks keep running.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Wait until the loop has exited and every in-flight task has finished.
    pub async fn join(self) -> Result<()> {
        let PipelineHandle { stop_tx, task } = self;
        task.await?;
        drop(stop_tx);
        Ok(())
    }
}

/// Start the polling loop on the current tokio runtime.
pub fn start_task_pipeline<W: PipelineWorker>(
    worker: Arc<W>,
    options: PipelineOptions,
) -> Result<PipelineHandle> {
    if options.low_watermark >= options.high_watermark {
        bail!("low_watermark must be lower than high_watermark");
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    let task = tokio::spawn(run_pipeline(worker, options, stop_rx));
    Ok(PipelineHandle { stop_tx, task })
}

async fn run_pipeline<W: PipelineWorker>(
    worker: Arc<W>,
    options: PipelineOptions,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut in_flight: JoinSet<()> = JoinSet::new();

    loop {
        if *stop_rx.borrow() {
            break;
        }

        while let Some(finished) = in_flight.try_join_next() {
            report_task_exit(finished);
        }

        if in_flight.len() > options.low_watermark {
            tokio::select! {
                finished = in_flight.join_next() => {
                    if let Some(finished) = finished {
                        report_task_exit(finished);
                    }
                }
                _ = wait_for_stop(&mut stop_rx) => break,
            }
            continue;
        }

        let count = options.high_watermark - in_flight.len();
        // Loading claims rows, so it must not be cancelled halfway. Claimed
        // items are dispatched even if a stop arrives meanwhile.
        let items = worker.load_tasks(count).await;

        if items.is_empty() {
            tokio::select! {
                _ = tokio::time::sleep(options.polling_interval) => {}
                _ = wait_for_stop(&mut stop_rx) => break,
            }
            continue;
        }

        debug!(count = items.len(), in_flight = in_flight.len(), "dispatching tasks");
        for item in items {
            let worker = Arc::clone(&worker);
            in_flight.spawn(async move { worker.process_task(item).await });
        }
    }

    // Let in-flight work drain; dropping the JoinSet would abort it.
    while let Some(finished) = in_flight.join_next().await {
        report_task_exit(finished);
    }
    debug!("task pipeline stopped");
}

/// Resolves once a stop is requested or the handle is dropped.
async fn wait_for_stop(stop_rx: &mut watch::Receiver<bool>) {
    let _ = stop_rx.wait_for(|stopped| *stopped).await;
}

fn report_task_exit(result: std::result::Result<(), JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            error!(error = %e, "pipeline task panicked");
        }
    }
}
