//! Batch coordinator: fans a candidate batch out to probes under the governor
//! and streams results back in completion order.

use crate::proxy::checker::Probe;
use crate::proxy::governor::Governor;
use crate::proxy::models::{CandidateBatch, Endpoint, ErrorKind, ValidationResult, VerifiedSet};
use futures::{FutureExt, Stream, StreamExt};
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Results buffered between the driver and a slow consumer
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Per-run knobs of the coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// Wall-clock budget for a whole batch; `None` waits for every probe
    pub deadline: Option<Duration>,
    /// Only forward successful results
    pub working_only: bool,
    pub channel_capacity: usize,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            deadline: None,
            working_only: false,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl CoordinatorOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_working_only(mut self, working_only: bool) -> Self {
        self.working_only = working_only;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }
}

/// Counters for one finished batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub submitted: usize,
    pub completed: usize,
    pub succeeded: usize,
    /// Probes dropped by the deadline, cancellation or a vanished consumer
    pub abandoned: usize,
    pub resource_exhausted: usize,
    pub deadline_hit: bool,
    pub cancelled: bool,
}

/// Validates candidate batches with bounded concurrency
pub struct BatchCoordinator<P: Probe> {
    probe: Arc<P>,
    governor: Governor,
    options: CoordinatorOptions,
    cancel: CancellationToken,
}

impl<P: Probe> Clone for BatchCoordinator<P> {
    fn clone(&self) -> Self {
        Self {
            probe: Arc::clone(&self.probe),
            governor: self.governor.clone(),
            options: self.options.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<P: Probe> BatchCoordinator<P> {
    pub fn new(probe: P, governor: Governor) -> Self {
        Self {
            probe: Arc::new(probe),
            governor,
            options: CoordinatorOptions::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_options(mut self, options: CoordinatorOptions) -> Self {
        self.options = options;
        self
    }

    /// Abandon outstanding probes when `cancel` fires
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn governor(&self) -> &Governor {
        &self.governor
    }

    pub fn options(&self) -> &CoordinatorOptions {
        &self.options
    }

    /// Probe every endpoint of `batch` once.
    ///
    /// Results arrive in completion order as soon as each probe finishes. The
    /// stream ends when every probe has reported, or when the deadline or the
    /// cancellation token fires; in the latter case outstanding probes are
    /// aborted and their slots returned before the stream closes.
    ///
    /// Must be called inside a tokio runtime.
    pub fn validate(&self, batch: CandidateBatch) -> ValidationStream {
        let (tx, rx) = mpsc::channel(self.options.channel_capacity.max(1));
        let driver = tokio::spawn(drive(
            Arc::clone(&self.probe),
            self.governor.clone(),
            self.options.clone(),
            self.cancel.clone(),
            batch,
            tx,
        ));
        ValidationStream { rx, driver: Some(driver) }
    }

    /// Like [`validate`](Self::validate) but only successes are yielded
    pub fn validate_working(&self, batch: CandidateBatch) -> ValidationStream {
        let working_only = self.options.clone().with_working_only(true);
        let coordinator = self.clone().with_options(working_only);
        coordinator.validate(batch)
    }

    /// Two passes: the endpoints verified by a first run become the batch of a
    /// second run, which is what the returned stream reports. Filters out
    /// proxies that only succeed transiently, at the cost of one extra pass.
    pub async fn double_check(&self, batch: CandidateBatch) -> ValidationStream {
        let submitted = batch.len();
        let survivors = self.validate_working(batch).verified().await;
        info!(
            "first pass kept {} of {} candidates, re-checking",
            survivors.len(),
            submitted
        );
        self.validate(survivors.into_batch())
    }
}

/// Completion-ordered results of one batch
pub struct ValidationStream {
    rx: mpsc::Receiver<ValidationResult>,
    driver: Option<JoinHandle<BatchSummary>>,
}

impl ValidationStream {
    /// Drain the stream into the set of verified endpoints
    pub async fn verified(mut self) -> VerifiedSet {
        let mut verified = VerifiedSet::new();
        while let Some(result) = self.next().await {
            verified.record(&result);
        }
        verified
    }

    /// Wait for the run to finish and return its counters. Dropping the
    /// receiving side first means any results not yet consumed are discarded
    /// and outstanding probes are abandoned.
    pub async fn summary(mut self) -> BatchSummary {
        self.rx.close();
        while self.rx.recv().await.is_some() {}
        match self.driver.take() {
            Some(driver) => driver.await.unwrap_or_else(|e| {
                warn!("validation driver failed: {}", e);
                BatchSummary::default()
            }),
            None => BatchSummary::default(),
        }
    }
}

impl Stream for ValidationStream {
    type Item = ValidationResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for ValidationStream {
    fn drop(&mut self) {
        // The driver watches for the closed channel and stops on its own
        self.rx.close();
    }
}

enum Stop {
    Finished,
    Deadline,
    Cancelled,
    ConsumerGone,
    GovernorClosed,
}

async fn drive<P: Probe>(
    probe: Arc<P>,
    governor: Governor,
    options: CoordinatorOptions,
    cancel: CancellationToken,
    batch: CandidateBatch,
    tx: mpsc::Sender<ValidationResult>,
) -> BatchSummary {
    let started = Instant::now();
    let mut summary = BatchSummary {
        submitted: batch.len(),
        ..Default::default()
    };
    info!(
        "validating {} candidates (max {} in flight, deadline {:?})",
        summary.submitted,
        governor.capacity(),
        options.deadline
    );

    let deadline = async {
        match options.deadline {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    let mut queue = batch.into_iter().peekable();
    let mut running: JoinSet<ValidationResult> = JoinSet::new();

    let stop = loop {
        if queue.peek().is_none() && running.is_empty() {
            break Stop::Finished;
        }

        tokio::select! {
            biased;

            _ = cancel.cancelled() => break Stop::Cancelled,
            _ = &mut deadline => break Stop::Deadline,
            _ = tx.closed() => break Stop::ConsumerGone,

            Some(joined) = running.join_next(), if !running.is_empty() => {
                let result = match joined {
                    Ok(result) => result,
                    // Tasks catch their own panics and are only aborted below.
                    Err(e) => {
                        debug!("probe task ended abnormally: {}", e);
                        continue;
                    }
                };
                summary.completed += 1;
                if result.succeeded {
                    summary.succeeded += 1;
                }
                if result.error == Some(ErrorKind::ResourceExhausted) {
                    if summary.resource_exhausted == 0 {
                        warn!(
                            "local socket/descriptor limit hit while probing {}; \
                             max connections ({}) is too high for this host",
                            result.endpoint,
                            governor.capacity()
                        );
                    }
                    summary.resource_exhausted += 1;
                }
                if options.working_only && !result.succeeded {
                    continue;
                }
                // A slow consumer must not stretch the deadline
                let sent = tokio::select! {
                    biased;

                    _ = cancel.cancelled() => Err(Stop::Cancelled),
                    _ = &mut deadline => Err(Stop::Deadline),
                    sent = tx.send(result) => sent.map_err(|_| Stop::ConsumerGone),
                };
                if let Err(stop) = sent {
                    break stop;
                }
            }

            permit = governor.acquire(), if queue.peek().is_some() => {
                let permit = match permit {
                    Ok(permit) => permit,
                    Err(_) => break Stop::GovernorClosed,
                };
                if let Some(endpoint) = queue.next() {
                    let probe = Arc::clone(&probe);
                    running.spawn(async move {
                        let _permit = permit;
                        run_probe(probe.as_ref(), endpoint).await
                    });
                }
            }
        }
    };

    let outstanding = running.len();
    // Aborts and waits, so every permit is back before the stream closes.
    running.shutdown().await;
    summary.abandoned = outstanding + queue.count();

    match stop {
        Stop::Finished => {}
        Stop::Deadline => {
            summary.deadline_hit = true;
            warn!(
                "batch deadline reached after {:.2}s, abandoning {} probes",
                started.elapsed().as_secs_f64(),
                summary.abandoned
            );
        }
        Stop::Cancelled => {
            summary.cancelled = true;
            info!("validation cancelled, abandoning {} probes", summary.abandoned);
        }
        Stop::ConsumerGone => {
            summary.cancelled = true;
            debug!("result consumer went away, abandoning {} probes", summary.abandoned);
        }
        Stop::GovernorClosed => {
            summary.cancelled = true;
            warn!("concurrency governor closed, abandoning {} probes", summary.abandoned);
        }
    }

    if summary.resource_exhausted > 0 {
        warn!(
            "{} probes failed on local resource exhaustion; lower max connections",
            summary.resource_exhausted
        );
    }
    info!(
        "✓ validation finished: {} working, {} failed, {} abandoned in {:.2}s",
        summary.succeeded,
        summary.completed - summary.succeeded,
        summary.abandoned,
        started.elapsed().as_secs_f64()
    );
    summary
}

async fn run_probe<P: Probe>(probe: &P, endpoint: Endpoint) -> ValidationResult {
    AssertUnwindSafe(probe.probe(&endpoint))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| ValidationResult::failed(endpoint, ErrorKind::ProbePanicked))
}
