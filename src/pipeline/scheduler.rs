use std::future::Future;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// What a `run_batch` call got through.
#[derive(Debug)]
pub struct BatchReport<O> {
    /// Outputs of tasks that ran to completion, chunk by chunk.
    pub completed: Vec<O>,
    /// Tasks that panicked; their output is lost but the batch carried on.
    pub panicked: usize,
    /// Tasks never admitted because the token fired first.
    pub not_started: usize,
    pub chunks: usize,
    pub cancelled: bool,
}

impl<O> Default for BatchReport<O> {
    fn default() -> Self {
        Self {
            completed: Vec::new(),
            panicked: 0,
            not_started: 0,
            chunks: 0,
            cancelled: false,
        }
    }
}

/// Run `tasks` in chunks of `max_concurrency`, each chunk spawned together and
/// fully drained before the next starts, with `inter_batch_delay` between
/// chunks. Cancellation is checked before each chunk only.
pub async fn run_batch<Fut>(
    tasks: Vec<Fut>,
    max_concurrency: usize,
    inter_batch_delay: Duration,
    cancel: &CancellationToken,
) -> BatchReport<Fut::Output>
where
    Fut: Future + Send + 'static,
    Fut::Output: Send + 'static,
{
    let chunk_size = max_concurrency.max(1);
    let total = tasks.len();
    let mut report = BatchReport::default();
    let mut pending = tasks.into_iter();
    let mut admitted = 0usize;

    loop {
        let chunk: Vec<Fut> = pending.by_ref().take(chunk_size).collect();
        if chunk.is_empty() {
            break;
        }
        if cancel.is_cancelled() {
            report.cancelled = true;
            report.not_started = total - admitted;
            info!(target: "scheduler", not_started = report.not_started, "cancelled; no further chunks admitted");
            break;
        }
        if report.chunks > 0 && !inter_batch_delay.is_zero() {
            sleep(inter_batch_delay).await;
        }

        admitted += chunk.len();
        report.chunks += 1;
        debug!(target: "scheduler", chunk = report.chunks, size = chunk.len(), "dispatching chunk");
        let handles: Vec<_> = chunk.into_iter().map(tokio::spawn).collect();
        for joined in join_all(handles).await {
            match joined {
                Ok(out) => report.completed.push(out),
                Err(join_err) => {
                    report.panicked += 1;
                    error!(target: "scheduler", error = %join_err, "task aborted");
                }
            }
        }
    }
    report
}
